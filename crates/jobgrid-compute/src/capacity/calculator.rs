//! Usage calculators estimate what an execution will consume.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use jobgrid_core::{Job, Resources};

use crate::error::ComputeResult;

#[async_trait]
pub trait UsageCalculator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Estimate the usage of `job`, given the usage parsed from its declared resources.
    async fn calculate(&self, job: &Job, parsed_usage: &Resources) -> ComputeResult<Resources>;
}

/// Fills dimensions the job left at zero with the node's defaults.
#[derive(Debug, Clone)]
pub struct DefaultsUsageCalculator {
    defaults: Resources,
}

impl DefaultsUsageCalculator {
    pub fn new(defaults: Resources) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl UsageCalculator for DefaultsUsageCalculator {
    fn name(&self) -> &'static str {
        "defaults"
    }

    async fn calculate(&self, _job: &Job, parsed_usage: &Resources) -> ComputeResult<Resources> {
        Ok(parsed_usage.merge(&self.defaults))
    }
}

/// Runs every calculator and keeps the highest estimate per dimension,
/// starting from the parsed usage.
#[derive(Clone, Default)]
pub struct ChainedUsageCalculator {
    calculators: Vec<Arc<dyn UsageCalculator>>,
}

impl ChainedUsageCalculator {
    pub fn new(calculators: Vec<Arc<dyn UsageCalculator>>) -> Self {
        Self { calculators }
    }
}

#[async_trait]
impl UsageCalculator for ChainedUsageCalculator {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn calculate(&self, job: &Job, parsed_usage: &Resources) -> ComputeResult<Resources> {
        let mut usage = parsed_usage.clone();
        for calculator in &self.calculators {
            let estimate = calculator.calculate(job, parsed_usage).await?;
            debug!(calculator = calculator.name(), estimate = %estimate, "usage estimated");
            usage = usage.max(&estimate);
        }
        Ok(usage)
    }
}
