use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cronfleet::config::Config;
use cronfleet::job::ExecutorKind;
use cronfleet::metrics::Metrics;
use cronfleet::proto::worker_server::WorkerServer;
use cronfleet::shutdown::shutdown_token;
use cronfleet::store::{EtcdExecutionStore, EtcdLocker, Store};
use cronfleet::worker::http_exec::HttpExecutor;
use cronfleet::worker::shell_exec::ShellExecutor;
use cronfleet::worker::{ExecutorRegistry, WorkerRegistry, WorkerService};

#[derive(Parser, Debug)]
#[command(name = "cronfleet-worker")]
#[command(about = "Distributed cron worker: executes dispatched jobs")]
struct Args {
    /// etcd endpoints (comma-separated)
    #[arg(long, default_value = "127.0.0.1:2379")]
    etcd_endpoints: String,

    /// etcd dial timeout in seconds
    #[arg(long, default_value = "5")]
    etcd_timeout_secs: u64,

    /// Address the gRPC server listens on
    #[arg(long, default_value = "0.0.0.0:50052")]
    grpc_addr: SocketAddr,

    /// Address masters should dial; registered in the coordination store
    #[arg(long, default_value = "127.0.0.1:50052")]
    advertise_addr: String,

    /// Registration lease TTL in seconds (shared with leader election)
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
        leader_election_ttl: Duration::from_secs(args.election_ttl_secs),
        grpc_listen_addr: args.grpc_addr.to_string(),
        ..Default::default()
    };

    let worker_id = Uuid::new_v4().to_string();
    tracing::info!(
        worker_id = %worker_id,
        grpc_addr = %args.grpc_addr,
        advertise_addr = %args.advertise_addr,
        "Starting cronfleet worker node"
    );

    let cancel = shutdown_token();

    let store = Store::connect(&config).await?;
    tracing::info!("Connected to etcd");

    let registry = WorkerRegistry::register(
        store.client(),
        &worker_id,
        &args.advertise_addr,
        config.election_ttl_seconds(),
    )
    .await?;

    let mut executors = ExecutorRegistry::new();
    executors.insert(ExecutorKind::Http, Arc::new(HttpExecutor::new()?));
    executors.insert(ExecutorKind::Shell, Arc::new(ShellExecutor::new()));

    let metrics = Arc::new(Metrics::new()?);
    let service = WorkerService::new(
        executors,
        Arc::new(EtcdLocker::new(store.client())),
        Arc::new(EtcdExecutionStore::new(store.client())),
        metrics,
        worker_id.clone(),
    );

    tracing::info!(addr = %args.grpc_addr, "gRPC server listening");
    let shutdown = cancel.clone();
    Server::builder()
        .add_service(WorkerServer::new(service))
        .serve_with_shutdown(args.grpc_addr, shutdown.cancelled_owned())
        .await?;

    // Drop the registration immediately so dispatchers stop seeing us.
    if let Err(e) = registry.deregister().await {
        tracing::error!(worker_id = %worker_id, error = %e, "failed to deregister worker");
    }

    tracing::info!("Worker node shut down");
    Ok(())
}
