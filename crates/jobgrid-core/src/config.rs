//! jobgrid.toml configuration parser.
//!
//! One file describes an orchestrator and any number of compute nodes:
//!
//! ```toml
//! [orchestrator]
//! node_id = "orchestrator-0"
//! over_ask_factor = 3
//! retry = { strategy = "budget", max_attempts = 3 }
//!
//! [[compute]]
//! node_id = "compute-0"
//! engines = ["noop"]
//! capacity = { cpu = "4", memory = "8Gi" }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::quantity::parse_duration;
use crate::resources::{Resources, ResourcesConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub compute: Vec<ComputeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub node_id: String,
    /// Nodes asked for a bid per bid required.
    pub over_ask_factor: u32,
    pub retry: RetryConfig,
    /// Upper bound of the random jitter added to node ranks.
    pub random_rank_factor: u32,
    /// Nodes older than this version are never selected.
    pub min_node_version: Option<String>,
    /// Upper bound for a single outbound notification, e.g. `"30s"`.
    pub notification_timeout: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_id: "orchestrator-0".to_string(),
            over_ask_factor: 3,
            retry: RetryConfig::default(),
            random_rank_factor: 5,
            min_node_version: None,
            notification_timeout: "30s".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn notification_timeout(&self) -> CoreResult<Duration> {
        parse_duration(&self.notification_timeout)
    }

    pub fn min_node_version(&self) -> CoreResult<Option<semver::Version>> {
        self.min_node_version
            .as_deref()
            .map(|v| {
                semver::Version::parse(v)
                    .map_err(|e| CoreError::Config(format!("min_node_version '{v}': {e}")))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryConfig {
    Fixed { enabled: bool },
    Budget { max_attempts: u32 },
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::Fixed { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub node_id: String,
    pub labels: HashMap<String, String>,
    pub version: Option<String>,
    pub engines: Vec<String>,
    pub publishers: Vec<String>,
    pub storage_sources: Vec<String>,
    /// Total capacity of the node.
    pub capacity: ResourcesConfig,
    /// Largest single job; defaults to the full capacity.
    pub job_resource_limits: Option<ResourcesConfig>,
    /// Filled into dimensions a job leaves unspecified.
    pub default_job_resources: ResourcesConfig,
    /// Resources that may wait in the admission queue beyond running
    /// capacity. When unset the node bids regardless of queue depth.
    pub queue_capacity: Option<ResourcesConfig>,
    pub accept_networked_jobs: bool,
    pub min_job_execution_timeout: Option<String>,
    pub max_job_execution_timeout: Option<String>,
    /// Applied to jobs that do not set their own timeout.
    pub default_job_execution_timeout: Option<String>,
    /// Simulated run time of the noop engine, e.g. `"100ms"`.
    pub noop_engine_delay: Option<String>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            node_id: "compute-0".to_string(),
            labels: HashMap::new(),
            version: None,
            engines: vec!["noop".to_string()],
            publishers: vec!["noop".to_string()],
            storage_sources: Vec::new(),
            capacity: ResourcesConfig::new("4", "8Gi"),
            job_resource_limits: None,
            default_job_resources: ResourcesConfig::new("100m", "100Mi"),
            queue_capacity: None,
            accept_networked_jobs: false,
            min_job_execution_timeout: None,
            max_job_execution_timeout: None,
            default_job_execution_timeout: None,
            noop_engine_delay: None,
        }
    }
}

impl ComputeConfig {
    pub fn capacity(&self) -> CoreResult<Resources> {
        self.capacity.to_resources()
    }

    pub fn job_resource_limits(&self) -> CoreResult<Resources> {
        match &self.job_resource_limits {
            Some(limits) => limits.to_resources(),
            None => self.capacity(),
        }
    }

    pub fn default_job_resources(&self) -> CoreResult<Resources> {
        self.default_job_resources.to_resources()
    }

    pub fn queue_capacity(&self) -> CoreResult<Option<Resources>> {
        self.queue_capacity
            .as_ref()
            .map(ResourcesConfig::to_resources)
            .transpose()
    }

    pub fn version(&self) -> CoreResult<Option<semver::Version>> {
        self.version
            .as_deref()
            .map(|v| {
                semver::Version::parse(v)
                    .map_err(|e| CoreError::Config(format!("version '{v}': {e}")))
            })
            .transpose()
    }

    pub fn min_job_execution_timeout(&self) -> CoreResult<Option<Duration>> {
        optional_duration(&self.min_job_execution_timeout)
    }

    pub fn max_job_execution_timeout(&self) -> CoreResult<Option<Duration>> {
        optional_duration(&self.max_job_execution_timeout)
    }

    pub fn default_job_execution_timeout(&self) -> CoreResult<Option<Duration>> {
        optional_duration(&self.default_job_execution_timeout)
    }

    pub fn noop_engine_delay(&self) -> CoreResult<Duration> {
        Ok(optional_duration(&self.noop_engine_delay)?.unwrap_or_default())
    }
}

fn optional_duration(value: &Option<String>) -> CoreResult<Option<Duration>> {
    value.as_deref().map(parse_duration).transpose()
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: NodeConfig =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// A single-orchestrator, `nodes`-compute-node configuration.
    pub fn devstack(nodes: usize) -> Self {
        let compute = (0..nodes)
            .map(|i| ComputeConfig {
                node_id: format!("compute-{i}"),
                ..ComputeConfig::default()
            })
            .collect();
        Self {
            orchestrator: OrchestratorConfig::default(),
            compute,
        }
    }

    /// Check every quantity and duration up front so a bad file fails at
    /// startup rather than on the first job.
    pub fn validate(&self) -> CoreResult<()> {
        self.orchestrator.notification_timeout()?;
        self.orchestrator.min_node_version()?;
        if self.orchestrator.over_ask_factor == 0 {
            return Err(CoreError::Config("over_ask_factor must be at least 1".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.compute {
            if !seen.insert(node.node_id.as_str()) {
                return Err(CoreError::Config(format!("duplicate compute node_id '{}'", node.node_id)));
            }
            node.capacity()?;
            node.job_resource_limits()?;
            node.default_job_resources()?;
            node.queue_capacity()?;
            node.version()?;
            node.min_job_execution_timeout()?;
            node.max_job_execution_timeout()?;
            node.default_job_execution_timeout()?;
            node.noop_engine_delay()?;
        }
        Ok(())
    }
}
