//! Devstack integration tests.
//!
//! Each test builds a full in-process stack (scheduler, proxy, compute
//! nodes with bidders, buffers and noop executors) and drives jobs to a
//! terminal state. Background work is awaited through `Devstack::settle`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use jobgrid_core::config::{ComputeConfig, NodeConfig};
use jobgrid_core::metrics::JOBS_COMPLETED_TOTAL;
use jobgrid_core::{
    Deal, ExecutionStateType, Job, JobState, LabelSelector, ResourcesConfig, SelectorOperator,
    Task,
};
use jobgrid_orchestrator::OrchestratorError;
use jobgrid_state::{ExecutionStore, JobStore, RedbStore};
use jobgridd::Devstack;

const SETTLE: Duration = Duration::from_secs(10);

fn noop_job(name: &str, cpu: &str, concurrency: u32) -> Job {
    let task = Task::new("noop")
        .with_publisher("noop")
        .with_resources(ResourcesConfig::new(cpu, "64Mi"));
    Job::new(name, task).with_deal(Deal::new(concurrency, 0))
}

fn assert_capacity_released(devstack: &Devstack) {
    for node in devstack.nodes() {
        let info = node.node_info();
        let compute = info.compute.unwrap();
        let (available, max) = (&compute.available_capacity, &compute.max_capacity);
        assert!(
            (available.cpu - max.cpu).abs() < 1e-9 && available.memory == max.memory,
            "{} still holds capacity: {available} of {max}",
            info.id
        );
        assert_eq!(compute.running_executions, 0);
        assert_eq!(compute.enqueued_executions, 0);
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn runs_jobs_to_completion() {
    let devstack = Devstack::in_memory(&NodeConfig::devstack(3)).unwrap();

    let mut job_ids = Vec::new();
    for i in 0..5 {
        job_ids.push(devstack.submit(noop_job(&format!("job-{i}"), "100m", 1)).await.unwrap());
    }
    devstack.settle(SETTLE).await.unwrap();

    for job_id in &job_ids {
        let report = devstack.report(job_id).unwrap();
        assert_eq!(report.state, JobState::Completed, "{report:?}");
        let completed = report.executions_in(ExecutionStateType::Completed);
        assert_eq!(completed.len(), 1);
        let stdout = completed[0].stdout.as_deref().unwrap();
        assert!(stdout.contains(&completed[0].execution_id), "{stdout}");
        assert!(completed[0].published_uri.is_some());
        assert!(report.executions.iter().all(|e| e.state.is_terminal()));
    }
    assert_eq!(
        devstack.metrics().counter(JOBS_COMPLETED_TOTAL, &[("state", "Completed")]),
        5
    );
    assert_capacity_released(&devstack);
}

#[tokio::test]
async fn concurrency_two_runs_on_two_nodes() {
    let devstack = Devstack::in_memory(&NodeConfig::devstack(3)).unwrap();
    let job_id = devstack.submit(noop_job("pair", "500m", 2)).await.unwrap();
    devstack.settle(SETTLE).await.unwrap();

    let report = devstack.report(&job_id).unwrap();
    assert_eq!(report.state, JobState::Completed);
    let nodes: HashSet<&str> = report
        .executions_in(ExecutionStateType::Completed)
        .iter()
        .map(|e| e.node_id.as_str())
        .collect();
    assert_eq!(nodes.len(), 2);
    assert_capacity_released(&devstack);
}

#[tokio::test]
async fn compute_side_mirrors_orchestrator_outcome() {
    let devstack = Devstack::in_memory(&NodeConfig::devstack(2)).unwrap();
    let job_id = devstack.submit(noop_job("mirror", "100m", 1)).await.unwrap();
    devstack.settle(SETTLE).await.unwrap();

    let report = devstack.report(&job_id).unwrap();
    for execution in &report.executions {
        let node = devstack.node(&execution.node_id).unwrap();
        let local = node.store().get_execution(&execution.execution_id).unwrap();
        assert_eq!(local.state(), execution.state, "{}", execution.node_id);
    }
}

#[tokio::test]
async fn oversized_job_is_never_placed() {
    let devstack = Devstack::in_memory(&NodeConfig::devstack(2)).unwrap();
    let job = noop_job("huge", "64", 1);
    let job_id = job.id.clone();

    let err = devstack.submit(job).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NotEnoughNodes { requested: 1, available: 0 }
    ));
    let report = devstack.report(&job_id).unwrap();
    assert_eq!(report.state, JobState::Error);
    assert!(report.executions.is_empty());
}

#[tokio::test]
async fn unsupported_engine_is_never_placed() {
    let devstack = Devstack::in_memory(&NodeConfig::devstack(2)).unwrap();
    let job = Job::new("docker", Task::new("docker"));
    let err = devstack.submit(job).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotEnoughNodes { .. }));
}

#[tokio::test]
async fn label_constraints_pin_the_node() {
    let mut config = NodeConfig::devstack(3);
    config.compute[1].labels = HashMap::from([("zone".to_string(), "east".to_string())]);
    let devstack = Devstack::in_memory(&config).unwrap();

    let job = noop_job("pinned", "100m", 1)
        .with_constraints(vec![LabelSelector::new("zone", SelectorOperator::In, &["east"])]);
    let job_id = devstack.submit(job).await.unwrap();
    devstack.settle(SETTLE).await.unwrap();

    let report = devstack.report(&job_id).unwrap();
    assert_eq!(report.state, JobState::Completed);
    assert!(report.executions.iter().all(|e| e.node_id == "compute-1"));
}

#[tokio::test]
async fn single_cpu_node_runs_jobs_one_after_another() {
    let config = NodeConfig {
        compute: vec![ComputeConfig {
            node_id: "compute-0".to_string(),
            capacity: ResourcesConfig::new("1", "1Gi"),
            noop_engine_delay: Some("300ms".to_string()),
            ..ComputeConfig::default()
        }],
        ..NodeConfig::default()
    };
    let devstack = Devstack::in_memory(&config).unwrap();

    let first = devstack.submit(noop_job("first", "1", 1)).await.unwrap();
    let second = devstack.submit(noop_job("second", "1", 1)).await.unwrap();

    let node = devstack.node("compute-0").unwrap().clone();
    eventually(|| {
        node.buffer().running_executions().len() == 1
            && node.buffer().enqueued_executions_count() == 1
    })
    .await;

    devstack.settle(SETTLE).await.unwrap();
    assert_eq!(devstack.report(&first).unwrap().state, JobState::Completed);
    assert_eq!(devstack.report(&second).unwrap().state, JobState::Completed);
    assert_capacity_released(&devstack);
}

#[tokio::test]
async fn cancelling_a_running_job_frees_the_node() {
    let mut config = NodeConfig::devstack(2);
    for node in &mut config.compute {
        node.noop_engine_delay = Some("30s".to_string());
    }
    let devstack = Devstack::in_memory(&config).unwrap();
    let job_id = devstack.submit(noop_job("slow", "100m", 1)).await.unwrap();

    let nodes = devstack.nodes().to_vec();
    eventually(|| nodes.iter().any(|n| !n.buffer().running_executions().is_empty())).await;

    devstack
        .scheduler()
        .cancel_job(&job_id, "no longer needed")
        .await
        .unwrap();
    devstack.settle(SETTLE).await.unwrap();

    let report = devstack.report(&job_id).unwrap();
    assert_eq!(report.state, JobState::Cancelled);
    assert_eq!(report.message, "no longer needed");
    for execution in &report.executions {
        let node = devstack.node(&execution.node_id).unwrap();
        let local = node.store().get_execution(&execution.execution_id).unwrap();
        assert!(local.is_terminal(), "{:?} on {}", local.state(), execution.node_id);
    }
    assert_capacity_released(&devstack);

    let err = devstack.scheduler().cancel_job(&job_id, "again").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::JobAlreadyTerminal(_)));
}

#[tokio::test]
async fn redb_store_keeps_finished_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobgrid.redb");

    let devstack = Devstack::new(&NodeConfig::devstack(2), Arc::new(RedbStore::open(&path).unwrap()))
        .unwrap();
    let job_id = devstack.submit(noop_job("durable", "100m", 1)).await.unwrap();
    devstack.shutdown(SETTLE).await.unwrap();

    let store = RedbStore::open(&path).unwrap();
    let job = store.get_job(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    let executions = store.get_executions(&job_id).unwrap();
    assert_eq!(
        executions
            .iter()
            .filter(|e| e.state() == ExecutionStateType::Completed)
            .count(),
        1
    );
}

#[tokio::test]
async fn direct_run_job_completes_without_approval() {
    let devstack = Devstack::in_memory(&NodeConfig::devstack(3)).unwrap();
    let job_id = devstack
        .submit(noop_job("direct", "100m", 1).with_direct_run())
        .await
        .unwrap();
    devstack.settle(SETTLE).await.unwrap();

    let report = devstack.report(&job_id).unwrap();
    assert_eq!(report.state, JobState::Completed, "{report:?}");
    assert_eq!(report.executions.len(), 1);
    assert_eq!(report.executions_in(ExecutionStateType::Completed).len(), 1);
    assert_capacity_released(&devstack);
}
