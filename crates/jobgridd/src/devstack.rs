//! In-process devstack: one orchestrator and N compute nodes.
//!
//! Every component runs in this process and talks through the same
//! traits a networked deployment would use:
//!
//! ```text
//! Scheduler ──▶ ComputeProxy ──▶ ComputeNode × N
//!     ▲                               │
//!     └────────── Callback ◀──────────┘
//! ```
//!
//! All detached work (bidding, buffered runs, notifications) shares one
//! [`BackgroundTasks`] handle, so [`Devstack::settle`] returns only once
//! every job has stopped moving.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use jobgrid_compute::bidstrategy::{
    AvailableCapacityStrategy, ChainedResourceBidStrategy, ChainedSemanticBidStrategy,
    EngineSupportStrategy, MaxCapacityStrategy, NetworkingStrategy, PublisherSupportStrategy,
    ResourceBidStrategy, SemanticBidStrategy, TimeoutStrategy,
};
use jobgrid_compute::capacity::{
    DefaultsUsageCalculator, EnqueuedUsageTracker, ResourceCapacityTracker,
};
use jobgrid_compute::{
    BaseExecutor, Bidder, BidderParams, ComputeNode, ComputeNodeParams, Executor, ExecutorBuffer,
    ExecutorBufferParams, NoopEngine, NoopPublisher,
};
use jobgrid_core::config::{ComputeConfig, NodeConfig, OrchestratorConfig};
use jobgrid_core::protocol::Callback;
use jobgrid_core::{
    BackgroundTasks, ExecutionStateType, InMemoryMetrics, Job, JobId, JobState, NodeInfo,
    SharedMetrics,
};
use jobgrid_orchestrator::ranking::{
    ChainRanker, FeatureNodeRanker, LabelsNodeRanker, MaxUsageNodeRanker, MinVersionNodeRanker,
    NodeRanker, PreviousExecutionsNodeRanker, RandomNodeRanker,
};
use jobgrid_orchestrator::{
    ComputeProxy, NodeDiscoverer, NodeSelector, NoopVerifier, OrchestratorResult, Scheduler,
    SchedulerParams, retry,
};
use jobgrid_state::{InMemoryStore, JobStore};

/// Discovers the devstack's compute nodes, reporting their live capacity.
#[derive(Default)]
struct LocalNodeDiscoverer {
    nodes: RwLock<Vec<Arc<ComputeNode>>>,
}

impl LocalNodeDiscoverer {
    fn add(&self, node: Arc<ComputeNode>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(node);
    }

    fn clear(&self) {
        self.nodes.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl NodeDiscoverer for LocalNodeDiscoverer {
    fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.iter().map(|n| n.node_info()).collect())
    }
}

pub struct Devstack {
    scheduler: Scheduler,
    store: Arc<dyn JobStore>,
    nodes: Vec<Arc<ComputeNode>>,
    proxy: Arc<ComputeProxy>,
    discoverer: Arc<LocalNodeDiscoverer>,
    metrics: Arc<InMemoryMetrics>,
    tasks: BackgroundTasks,
}

impl Devstack {
    /// Build the stack with the orchestrator persisting to `store`.
    pub fn new<S: JobStore + 'static>(config: &NodeConfig, store: Arc<S>) -> anyhow::Result<Self> {
        config.validate()?;
        let tasks = BackgroundTasks::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let orchestrator = &config.orchestrator;

        // The scheduler is every node's callback and reaches the nodes
        // through the proxy, so the proxy and discoverer start empty and
        // are filled once the nodes exist.
        let proxy = Arc::new(ComputeProxy::new());
        let discoverer = Arc::new(LocalNodeDiscoverer::default());
        let selector = NodeSelector::new(discoverer.clone(), rankers(orchestrator, store.clone())?);

        let scheduler = Scheduler::new(SchedulerParams {
            node_id: orchestrator.node_id.clone(),
            store: store.clone(),
            selector,
            compute: proxy.clone(),
            retry_strategy: retry::from_config(&orchestrator.retry),
            verifier: Arc::new(NoopVerifier),
            over_ask_factor: orchestrator.over_ask_factor,
            notification_timeout: orchestrator.notification_timeout()?,
            tasks: tasks.clone(),
            metrics: metrics.clone(),
        });

        let callback: Arc<dyn Callback> = Arc::new(scheduler.clone());
        let mut nodes = Vec::with_capacity(config.compute.len());
        for compute in &config.compute {
            let node = compute_node(
                compute,
                &orchestrator.node_id,
                callback.clone(),
                &tasks,
                metrics.clone(),
            )
            .with_context(|| format!("compute node {}", compute.node_id))?;
            let node = Arc::new(node);
            proxy.register(node.node_id(), node.clone());
            discoverer.add(node.clone());
            info!(node_id = node.node_id(), "compute node ready");
            nodes.push(node);
        }
        info!(
            orchestrator = %orchestrator.node_id,
            compute_nodes = nodes.len(),
            "devstack ready"
        );

        Ok(Self {
            scheduler,
            store,
            nodes,
            proxy,
            discoverer,
            metrics,
            tasks,
        })
    }

    /// Build the stack with an in-memory orchestrator store.
    pub fn in_memory(config: &NodeConfig) -> anyhow::Result<Self> {
        Self::new(config, Arc::new(InMemoryStore::new()))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn nodes(&self) -> &[Arc<ComputeNode>] {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<ComputeNode>> {
        self.nodes.iter().find(|n| n.node_id() == node_id)
    }

    pub fn metrics(&self) -> &InMemoryMetrics {
        &self.metrics
    }

    /// Start a job; returns its ID once bid requests are on their way.
    pub async fn submit(&self, job: Job) -> OrchestratorResult<JobId> {
        let job_id = job.id.clone();
        self.scheduler.start_job(job).await?;
        Ok(job_id)
    }

    /// Wait until no background work remains, bounded by `timeout`.
    pub async fn settle(&self, timeout: Duration) -> anyhow::Result<()> {
        tokio::time::timeout(timeout, self.tasks.wait_idle())
            .await
            .with_context(|| format!("devstack still busy after {timeout:?}"))
    }

    /// Current state of a job and its executions.
    pub fn report(&self, job_id: &str) -> anyhow::Result<JobReport> {
        let job = self.store.get_job(job_id)?;
        let executions = self
            .store
            .get_executions(job_id)?
            .into_iter()
            .map(|e| ExecutionReport {
                execution_id: e.id.clone(),
                node_id: e.node_id.clone(),
                state: e.state(),
                message: e.compute_state.message.clone(),
                stdout: e.run_output.as_ref().map(|o| o.stdout.clone()),
                published_uri: e.published_result.as_ref().map(|r| r.uri.clone()),
            })
            .collect();
        Ok(JobReport {
            job_id: job.id,
            name: job.name,
            state: job.state,
            message: job.state_message,
            executions,
        })
    }

    /// Drain background work and detach the nodes from the orchestrator,
    /// releasing everything that holds the store.
    pub async fn shutdown(self, timeout: Duration) -> anyhow::Result<()> {
        let settled = self.settle(timeout).await;
        for node in &self.nodes {
            self.proxy.unregister(node.node_id());
        }
        self.discoverer.clear();
        info!("devstack stopped");
        settled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub name: String,
    pub state: JobState,
    pub message: String,
    pub executions: Vec<ExecutionReport>,
}

impl JobReport {
    pub fn executions_in(&self, state: ExecutionStateType) -> Vec<&ExecutionReport> {
        self.executions.iter().filter(|e| e.state == state).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub node_id: String,
    pub state: ExecutionStateType,
    pub message: String,
    pub stdout: Option<String>,
    pub published_uri: Option<String>,
}

fn rankers<S: JobStore + 'static>(
    config: &OrchestratorConfig,
    store: Arc<S>,
) -> anyhow::Result<Arc<dyn NodeRanker>> {
    let mut chain = ChainRanker::default()
        .with(Arc::new(FeatureNodeRanker::new()))
        .with(Arc::new(MaxUsageNodeRanker::new()))
        .with(Arc::new(LabelsNodeRanker::new()));
    if let Some(min_version) = config.min_node_version()? {
        chain = chain.with(Arc::new(MinVersionNodeRanker::new(min_version)));
    }
    let chain = chain
        .with(Arc::new(PreviousExecutionsNodeRanker::new(store)))
        .with(Arc::new(RandomNodeRanker::new(config.random_rank_factor)));
    Ok(Arc::new(chain))
}

fn compute_node(
    config: &ComputeConfig,
    requester_node_id: &str,
    callback: Arc<dyn Callback>,
    tasks: &BackgroundTasks,
    metrics: SharedMetrics,
) -> anyhow::Result<ComputeNode> {
    let node_id = config.node_id.clone();
    let store = Arc::new(InMemoryStore::new());
    let job_limits = config.job_resource_limits()?;
    let running = Arc::new(ResourceCapacityTracker::new(config.capacity()?));
    let enqueued = Arc::new(EnqueuedUsageTracker::new());

    let executor: Arc<dyn Executor> = Arc::new(
        BaseExecutor::new(&node_id, requester_node_id, store.clone(), callback.clone())
            .with_engine(Arc::new(NoopEngine::new(config.noop_engine_delay()?)))
            .with_publisher(Arc::new(NoopPublisher)),
    );
    let buffer = ExecutorBuffer::new(ExecutorBufferParams {
        node_id: node_id.clone(),
        running_capacity: running.clone(),
        enqueued_capacity: enqueued.clone(),
        delegate: executor.clone(),
        default_timeout: config.default_job_execution_timeout()?,
        tasks: tasks.clone(),
        metrics: metrics.clone(),
    });

    let semantic: Vec<Arc<dyn SemanticBidStrategy>> = vec![
        Arc::new(EngineSupportStrategy::new(config.engines.clone())),
        Arc::new(PublisherSupportStrategy::new(config.publishers.clone())),
        Arc::new(NetworkingStrategy::new(config.accept_networked_jobs)),
        Arc::new(TimeoutStrategy::new(
            config.min_job_execution_timeout()?,
            config.max_job_execution_timeout()?,
        )),
    ];
    let mut resource: Vec<Arc<dyn ResourceBidStrategy>> =
        vec![Arc::new(MaxCapacityStrategy::new(job_limits.clone()))];
    if let Some(queue_capacity) = config.queue_capacity()? {
        resource.push(Arc::new(AvailableCapacityStrategy::new(
            running.clone(),
            enqueued.clone(),
            queue_capacity,
        )));
    }

    let bidder = Bidder::new(BidderParams {
        node_id: node_id.clone(),
        semantic_strategy: Arc::new(ChainedSemanticBidStrategy::new(semantic)),
        resource_strategy: Arc::new(ChainedResourceBidStrategy::new(resource)),
        usage_calculator: Arc::new(DefaultsUsageCalculator::new(config.default_job_resources()?)),
        store: store.clone(),
        callback: callback.clone(),
        buffer: buffer.clone(),
        tasks: tasks.clone(),
        metrics,
    });

    Ok(ComputeNode::new(ComputeNodeParams {
        node_id,
        labels: config.labels.clone(),
        version: config.version()?,
        engines: config.engines.clone(),
        publishers: config.publishers.clone(),
        storage_sources: config.storage_sources.clone(),
        job_resource_limits: job_limits,
        store,
        callback,
        bidder,
        buffer,
        executor,
        running_capacity: running,
        tasks: tasks.clone(),
    }))
}
