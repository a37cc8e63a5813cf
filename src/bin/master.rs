use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cronfleet::api::{self, ApiState};
use cronfleet::config::Config;
use cronfleet::master::{CronWheel, GrpcDispatcher, JobService, SchedulerService, WorkerDiscovery};
use cronfleet::metrics::Metrics;
use cronfleet::shutdown::shutdown_token;
use cronfleet::store::{EtcdExecutionStore, EtcdJobStore, JobStore, LeaderElection, Store};

#[derive(Parser, Debug)]
#[command(name = "cronfleet-master")]
#[command(about = "Distributed cron master: leader election, scheduling, dispatch")]
struct Args {
    /// etcd endpoints (comma-separated)
    #[arg(long, default_value = "127.0.0.1:2379")]
    etcd_endpoints: String,

    /// etcd dial timeout in seconds
    #[arg(long, default_value = "5")]
    etcd_timeout_secs: u64,

    /// Address for the management HTTP API
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Leader election session TTL in seconds
    #[arg(long, default_value = "10")]
    election_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config {
        etcd_endpoints: args
            .etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        etcd_timeout: Duration::from_secs(args.etcd_timeout_secs),
        http_listen_addr: args.http_addr.to_string(),
        leader_election_ttl: Duration::from_secs(args.election_ttl_secs),
        ..Default::default()
    };

    let node_id = Uuid::new_v4().to_string();
    tracing::info!(
        node_id = %node_id,
        http_addr = %args.http_addr,
        etcd_endpoints = ?config.etcd_endpoints,
        "Starting cronfleet master node"
    );

    let cancel = shutdown_token();

    let store = Store::connect(&config).await?;
    tracing::info!("Connected to etcd");

    let metrics = Arc::new(Metrics::new()?);

    let discovery = Arc::new(WorkerDiscovery::new());
    {
        let discovery = discovery.clone();
        let client = store.client();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            discovery.run(client, cancel).await;
        });
    }

    let dispatcher = Arc::new(GrpcDispatcher::new(discovery.clone()));
    let wheel = Arc::new(CronWheel::new(dispatcher));
    let election = Arc::new(LeaderElection::new(
        store.client(),
        node_id.clone(),
        config.election_ttl_seconds(),
        metrics.clone(),
    ));
    let jobs: Arc<dyn JobStore> = Arc::new(EtcdJobStore::new(store.client()));
    let history = Arc::new(EtcdExecutionStore::new(store.client()));

    let job_service = Arc::new(JobService::new(
        jobs.clone(),
        history,
        wheel.clone(),
        election.clone(),
    ));

    let scheduler_service = SchedulerService::new(election, wheel, jobs, node_id);
    let scheduler_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            scheduler_service.run(cancel).await;
        })
    };

    api::run(
        args.http_addr,
        ApiState {
            jobs: job_service,
            metrics,
        },
        cancel.clone(),
    )
    .await?;

    // The API drained; let the scheduler resign before exiting.
    let _ = scheduler_handle.await;
    tracing::info!("Master node shut down");
    Ok(())
}
