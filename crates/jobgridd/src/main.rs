//! jobgridd: the JobGrid daemon.
//!
//! Runs an orchestrator and a set of compute nodes in one process, submits
//! a batch of noop jobs and prints how each one ended.
//!
//! # Usage
//!
//! ```text
//! jobgridd devstack --config jobgrid.toml --jobs 10 --concurrency 2
//! jobgridd devstack --nodes 3 --data-dir /var/lib/jobgrid
//! jobgridd config --nodes 3 > jobgrid.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobgrid_core::config::NodeConfig;
use jobgrid_core::quantity::parse_duration;
use jobgrid_core::{Deal, Job, ResourcesConfig, Task};
use jobgrid_state::RedbStore;
use jobgridd::Devstack;

#[derive(Parser)]
#[command(name = "jobgridd", about = "JobGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an orchestrator and compute nodes in-process and submit jobs.
    Devstack {
        /// Node configuration file. Without it, `--nodes` default nodes are used.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of default compute nodes when no config file is given.
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Persist orchestrator state under this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Jobs to submit.
        #[arg(long, default_value = "1")]
        jobs: usize,

        /// Executions per job.
        #[arg(long, default_value = "1")]
        concurrency: u32,

        /// CPU requested per execution.
        #[arg(long, default_value = "100m")]
        cpu: String,

        /// Memory requested per execution.
        #[arg(long, default_value = "64Mi")]
        memory: String,

        /// Give up waiting for jobs after this long.
        #[arg(long, default_value = "60s")]
        timeout: String,

        /// Print reports as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print a default devstack configuration.
    Config {
        #[arg(long, default_value = "3")]
        nodes: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,jobgridd=debug,jobgrid_orchestrator=debug,jobgrid_compute=debug")
        }))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Devstack {
            config,
            nodes,
            data_dir,
            jobs,
            concurrency,
            cpu,
            memory,
            timeout,
            json,
        } => {
            let config = match config {
                Some(path) => NodeConfig::from_file(&path)?,
                None => NodeConfig::devstack(nodes),
            };
            let resources = ResourcesConfig::new(&cpu, &memory);
            let timeout = parse_duration(&timeout)?;
            run_devstack(config, data_dir, jobs, concurrency, resources, timeout, json).await
        }
        Command::Config { nodes } => {
            print!("{}", NodeConfig::devstack(nodes).to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_devstack(
    config: NodeConfig,
    data_dir: Option<PathBuf>,
    jobs: usize,
    concurrency: u32,
    resources: ResourcesConfig,
    timeout: Duration,
    json: bool,
) -> anyhow::Result<()> {
    info!("JobGrid devstack starting");

    let devstack = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let path = dir.join("jobgrid.redb");
            let store = RedbStore::open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            info!(path = ?path, "state store opened");
            Devstack::new(&config, Arc::new(store))?
        }
        None => Devstack::in_memory(&config)?,
    };

    let mut job_ids = Vec::with_capacity(jobs);
    for i in 0..jobs {
        let task = Task::new("noop")
            .with_publisher("noop")
            .with_resources(resources.clone());
        let job = Job::new(&format!("job-{i}"), task).with_deal(Deal::new(concurrency, 0));
        let job_id = job.id.clone();
        if let Err(e) = devstack.submit(job).await {
            warn!(%job_id, error = %e, "job not started");
        }
        job_ids.push(job_id);
    }

    devstack.settle(timeout).await?;

    for job_id in &job_ids {
        let report = devstack.report(job_id)?;
        if json {
            println!("{}", serde_json::to_string(&report)?);
            continue;
        }
        println!("{} {} {}", report.job_id, report.name, report.state);
        for e in &report.executions {
            println!("  {} on {}: {} {}", e.execution_id, e.node_id, e.state, e.message);
        }
    }
    if !json {
        print!("{}", devstack.metrics().render_prometheus());
    }

    devstack.shutdown(timeout).await
}
