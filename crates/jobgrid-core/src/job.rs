//! Job types.
//!
//! A `Job` is the unit of user work. The scheduler treats it as immutable
//! while scheduling and re-reads it from the store on every pass; only
//! `state`, `state_message`, `version` and `updated_at` change over time.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resources::ResourcesConfig;
use crate::{epoch_millis, ids};

/// Unique identifier for a job.
pub type JobId = String;

// ── Job ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub namespace: String,
    pub job_type: JobType,
    /// Higher runs first in a node's admission queue.
    pub priority: i32,
    pub deal: Deal,
    pub task: Task,
    /// Node label constraints (all must match).
    #[serde(default)]
    pub constraints: Vec<LabelSelector>,
    /// Nodes start executing as soon as they bid instead of waiting for
    /// the scheduler to accept the bid. Bids cannot be rationed, so the
    /// scheduler asks only as many nodes as it needs.
    #[serde(default)]
    pub direct_run: bool,
    pub state: JobState,
    pub state_message: String,
    /// Incremented on every persisted update.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Job {
    /// Create a new batch job with default deal and priority.
    pub fn new(name: &str, task: Task) -> Self {
        let now = epoch_millis();
        Self {
            id: ids::new_id("j"),
            name: name.to_string(),
            namespace: "default".to_string(),
            job_type: JobType::Batch,
            priority: 0,
            deal: Deal::default(),
            task,
            constraints: Vec::new(),
            direct_run: false,
            state: JobState::New,
            state_message: String::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_deal(mut self, deal: Deal) -> Self {
        self.deal = deal;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = job_type;
        self
    }

    pub fn with_constraints(mut self, constraints: Vec<LabelSelector>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_direct_run(mut self) -> Self {
        self.direct_run = true;
        self
    }

    /// The requested execution timeout, if any.
    pub fn execution_timeout(&self) -> Option<Duration> {
        match self.task.timeouts.execution_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn is_long_running(&self) -> bool {
        self.job_type.is_long_running()
    }
}

/// Kind of workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[default]
    Batch,
    Ops,
    Service,
    Daemon,
}

impl JobType {
    /// Long-running jobs are never subject to an execution timeout.
    pub fn is_long_running(self) -> bool {
        matches!(self, JobType::Service | JobType::Daemon)
    }
}

/// Lifecycle state of a job as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    InProgress,
    Cancelled,
    Error,
    CompletedPartially,
    Completed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Cancelled | JobState::Error | JobState::CompletedPartially | JobState::Completed
        )
    }

    pub fn non_terminal() -> Vec<JobState> {
        vec![JobState::New, JobState::InProgress]
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "New",
            JobState::InProgress => "InProgress",
            JobState::Cancelled => "Cancelled",
            JobState::Error => "Error",
            JobState::CompletedPartially => "CompletedPartially",
            JobState::Completed => "Completed",
        };
        f.write_str(s)
    }
}

/// How many executions a job wants and how many bids it waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    /// Desired number of parallel executions.
    pub concurrency: u32,
    /// Completed executions required for a fully completed job.
    pub confidence: u32,
    /// Bids to collect before any bid is accepted or rejected.
    pub min_bids: u32,
}

impl Default for Deal {
    fn default() -> Self {
        Self {
            concurrency: 1,
            confidence: 0,
            min_bids: 0,
        }
    }
}

impl Deal {
    pub fn new(concurrency: u32, min_bids: u32) -> Self {
        Self {
            concurrency,
            confidence: 0,
            min_bids,
        }
    }

    pub fn with_confidence(mut self, confidence: u32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Concurrency, never less than one.
    pub fn concurrency(&self) -> u32 {
        self.concurrency.max(1)
    }
}

// ── Task ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub engine: EngineSpec,
    /// Publisher kind; empty when results are not published.
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub inputs: Vec<InputSource>,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Task {
    pub fn new(engine: &str) -> Self {
        Self {
            name: "main".to_string(),
            engine: EngineSpec {
                kind: engine.to_string(),
                params: HashMap::new(),
            },
            ..Self::default()
        }
    }

    pub fn with_resources(mut self, resources: ResourcesConfig) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_publisher(mut self, publisher: &str) -> Self {
        self.publisher = publisher.to_string();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeouts.execution_timeout_secs = secs;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineSpec {
    /// Engine kind, e.g. `"docker"`, `"wasm"`, `"noop"`.
    pub kind: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// An input the execution needs staged from a storage source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSource {
    /// Storage source kind, e.g. `"s3"`, `"url"`.
    pub kind: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    None,
    Host,
    Http,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub kind: NetworkType,
    /// Allowed domains for `Http` networking.
    pub domains: Vec<String>,
    /// Container ports the task listens on.
    pub ports: Vec<u16>,
}

impl NetworkConfig {
    pub fn is_disabled(&self) -> bool {
        self.kind == NetworkType::None && self.ports.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Zero means no explicit timeout.
    pub execution_timeout_secs: u64,
}

// ── Label selectors ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// A single node-label requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelector {
    pub fn new(key: &str, operator: SelectorOperator, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
            SelectorOperator::Gt | SelectorOperator::Lt => {
                let (Some(actual), Some(bound)) = (
                    value.and_then(|v| v.parse::<i64>().ok()),
                    self.values.first().and_then(|v| v.parse::<i64>().ok()),
                ) else {
                    return false;
                };
                if self.operator == SelectorOperator::Gt {
                    actual > bound
                } else {
                    actual < bound
                }
            }
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {:?}", self.key, self.operator, self.values)
    }
}
