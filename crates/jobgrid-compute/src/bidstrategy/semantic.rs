//! Semantic bid strategies: decisions that need only the job.

use std::time::Duration;

use async_trait::async_trait;

use jobgrid_core::Job;

use super::{BidStrategyResponse, SemanticBidStrategy};
use crate::error::ComputeResult;

/// Bid only on jobs whose engine this node has installed.
#[derive(Debug, Clone)]
pub struct EngineSupportStrategy {
    engines: Vec<String>,
}

impl EngineSupportStrategy {
    pub fn new(engines: Vec<String>) -> Self {
        Self { engines }
    }
}

#[async_trait]
impl SemanticBidStrategy for EngineSupportStrategy {
    fn name(&self) -> &'static str {
        "engine-support"
    }

    async fn should_bid(&self, job: &Job) -> ComputeResult<BidStrategyResponse> {
        let engine = &job.task.engine.kind;
        if self.engines.iter().any(|e| e == engine) {
            Ok(BidStrategyResponse::bid(format!("engine {engine} is installed")))
        } else {
            Ok(BidStrategyResponse::reject(format!(
                "engine {engine} is not installed"
            )))
        }
    }
}

/// Bid only on jobs whose publisher this node can run. Jobs without a
/// publisher always pass.
#[derive(Debug, Clone)]
pub struct PublisherSupportStrategy {
    publishers: Vec<String>,
}

impl PublisherSupportStrategy {
    pub fn new(publishers: Vec<String>) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl SemanticBidStrategy for PublisherSupportStrategy {
    fn name(&self) -> &'static str {
        "publisher-support"
    }

    async fn should_bid(&self, job: &Job) -> ComputeResult<BidStrategyResponse> {
        let publisher = &job.task.publisher;
        if publisher.is_empty() || self.publishers.iter().any(|p| p == publisher) {
            Ok(BidStrategyResponse::bid("publisher supported"))
        } else {
            Ok(BidStrategyResponse::reject(format!(
                "publisher {publisher} is not installed"
            )))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkingStrategy {
    accept_networked_jobs: bool,
}

impl NetworkingStrategy {
    pub fn new(accept_networked_jobs: bool) -> Self {
        Self {
            accept_networked_jobs,
        }
    }
}

#[async_trait]
impl SemanticBidStrategy for NetworkingStrategy {
    fn name(&self) -> &'static str {
        "networking"
    }

    async fn should_bid(&self, job: &Job) -> ComputeResult<BidStrategyResponse> {
        if job.task.network.is_disabled() || self.accept_networked_jobs {
            Ok(BidStrategyResponse::bid("networking requirements met"))
        } else {
            Ok(BidStrategyResponse::reject(
                "node does not accept jobs that require networking",
            ))
        }
    }
}

/// Keeps requested execution timeouts inside the node's window.
/// Long-running jobs and jobs without a timeout always pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutStrategy {
    min: Option<Duration>,
    max: Option<Duration>,
}

impl TimeoutStrategy {
    pub fn new(min: Option<Duration>, max: Option<Duration>) -> Self {
        Self { min, max }
    }
}

#[async_trait]
impl SemanticBidStrategy for TimeoutStrategy {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn should_bid(&self, job: &Job) -> ComputeResult<BidStrategyResponse> {
        if job.is_long_running() {
            return Ok(BidStrategyResponse::bid("long-running job has no timeout"));
        }
        let Some(timeout) = job.execution_timeout() else {
            return Ok(BidStrategyResponse::bid("job uses the node default timeout"));
        };
        if let Some(min) = self.min.filter(|min| timeout < *min) {
            return Ok(BidStrategyResponse::reject(format!(
                "execution timeout {timeout:?} is below the node minimum {min:?}"
            )));
        }
        if let Some(max) = self.max.filter(|max| timeout > *max) {
            return Ok(BidStrategyResponse::reject(format!(
                "execution timeout {timeout:?} exceeds the node maximum {max:?}"
            )));
        }
        Ok(BidStrategyResponse::bid("execution timeout within limits"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgrid_core::{JobType, NetworkType, Task};

    #[tokio::test]
    async fn engine_support() {
        let strategy = EngineSupportStrategy::new(vec!["noop".into(), "wasm".into()]);
        let wasm = Job::new("j", Task::new("wasm"));
        let docker = Job::new("j", Task::new("docker"));

        assert!(strategy.should_bid(&wasm).await.unwrap().should_bid);
        let response = strategy.should_bid(&docker).await.unwrap();
        assert!(!response.should_bid);
        assert!(response.reason.contains("docker"));
    }

    #[tokio::test]
    async fn publisher_support() {
        let strategy = PublisherSupportStrategy::new(vec!["local".into()]);
        let none = Job::new("j", Task::new("noop"));
        let local = Job::new("j", Task::new("noop").with_publisher("local"));
        let s3 = Job::new("j", Task::new("noop").with_publisher("s3"));

        assert!(strategy.should_bid(&none).await.unwrap().should_bid);
        assert!(strategy.should_bid(&local).await.unwrap().should_bid);
        assert!(!strategy.should_bid(&s3).await.unwrap().should_bid);
    }

    #[tokio::test]
    async fn networking() {
        let mut task = Task::new("noop");
        task.network.kind = NetworkType::Http;
        let networked = Job::new("j", task);
        let offline = Job::new("j", Task::new("noop"));

        let strict = NetworkingStrategy::new(false);
        assert!(strict.should_bid(&offline).await.unwrap().should_bid);
        assert!(!strict.should_bid(&networked).await.unwrap().should_bid);
        assert!(
            NetworkingStrategy::new(true)
                .should_bid(&networked)
                .await
                .unwrap()
                .should_bid
        );
    }

    #[tokio::test]
    async fn timeout_window() {
        let strategy = TimeoutStrategy::new(
            Some(Duration::from_secs(10)),
            Some(Duration::from_secs(600)),
        );
        let short = Job::new("j", Task::new("noop").with_timeout_secs(5));
        let ok = Job::new("j", Task::new("noop").with_timeout_secs(60));
        let long = Job::new("j", Task::new("noop").with_timeout_secs(3600));
        let service =
            Job::new("j", Task::new("noop").with_timeout_secs(3600)).with_type(JobType::Service);
        let unset = Job::new("j", Task::new("noop"));

        assert!(!strategy.should_bid(&short).await.unwrap().should_bid);
        assert!(strategy.should_bid(&ok).await.unwrap().should_bid);
        assert!(!strategy.should_bid(&long).await.unwrap().should_bid);
        assert!(strategy.should_bid(&service).await.unwrap().should_bid);
        assert!(strategy.should_bid(&unset).await.unwrap().should_bid);
    }
}
