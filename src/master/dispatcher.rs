use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::error::{CronError, Result};
use crate::job::{format_duration, ExecutorKind, Job};
use crate::master::discovery::WorkerDiscovery;
use crate::proto;
use crate::proto::worker_client::WorkerClient;

/// Master-side hand-off of one job firing to the worker fleet.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Pick a live worker and submit the job. Returns the execution id the
    /// worker acknowledged with.
    async fn dispatch(&self, job: &Job) -> Result<String>;
}

/// Snapshot view of the live worker addresses.
#[async_trait]
pub trait WorkerSource: Send + Sync {
    async fn get_workers(&self) -> Vec<String>;
}

#[async_trait]
impl WorkerSource for WorkerDiscovery {
    async fn get_workers(&self) -> Vec<String> {
        WorkerDiscovery::get_workers(self).await
    }
}

/// Dispatches over gRPC to workers found through discovery.
///
/// Client connections are cached per address. Cached clients are never
/// evicted, even after call failures; tonic reconnects lazily underneath,
/// so a dead address costs a failed dispatch rather than a poisoned cache,
/// but the map itself only grows.
pub struct GrpcDispatcher {
    discovery: Arc<dyn WorkerSource>,
    clients: Mutex<HashMap<String, WorkerClient<Channel>>>,
}

impl GrpcDispatcher {
    pub fn new(discovery: Arc<dyn WorkerSource>) -> Self {
        Self {
            discovery,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_create_client(&self, addr: &str) -> Result<WorkerClient<Channel>> {
        if let Some(client) = self.clients.lock().await.get(addr) {
            return Ok(client.clone());
        }

        let endpoint = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let client = WorkerClient::connect(endpoint).await?;

        // Double-check: another dispatch may have connected concurrently;
        // the first insertion wins.
        let mut clients = self.clients.lock().await;
        let entry = clients.entry(addr.to_string()).or_insert_with(|| {
            tracing::info!(addr = %addr, "created new gRPC client for worker");
            client
        });
        Ok(entry.clone())
    }
}

#[async_trait]
impl Dispatcher for GrpcDispatcher {
    async fn dispatch(&self, job: &Job) -> Result<String> {
        let workers = self.discovery.get_workers().await;
        if workers.is_empty() {
            return Err(CronError::NoWorkersAvailable);
        }

        let addr = {
            let idx = rand::thread_rng().gen_range(0..workers.len());
            workers[idx].clone()
        };
        tracing::info!(job_name = %job.name, worker_addr = %addr, "dispatching task to worker");

        let mut client = self.get_or_create_client(&addr).await?;
        let resp = client
            .execute_task(task_request_from_job(job))
            .await
            .map_err(|e| {
                tracing::error!(
                    job_name = %job.name,
                    worker_addr = %addr,
                    error = %e,
                    "failed to execute task via gRPC"
                );
                CronError::Grpc(e)
            })?
            .into_inner();

        if !resp.error_message.is_empty() {
            return Err(CronError::Internal(format!(
                "worker rejected task: {}",
                resp.error_message
            )));
        }
        Ok(resp.execution_id)
    }
}

/// Build the wire request from a job definition.
pub fn task_request_from_job(job: &Job) -> proto::TaskRequest {
    let mut req = proto::TaskRequest {
        id: job.id.clone(),
        name: job.name.clone(),
        cron_expr: job.cron_expr.clone(),
        executor_type: job.executor_type.to_string(),
        http_executor: None,
        shell_executor: None,
        concurrency_policy: job.concurrency_policy.to_string(),
        retry_policy: None,
        created_at: Some(prost_types::Timestamp {
            seconds: job.created_at.timestamp(),
            nanos: job.created_at.timestamp_subsec_nanos() as i32,
        }),
    };

    match job.executor_type {
        ExecutorKind::Http => {
            req.http_executor = Some(proto::ExecutorHttp {
                url: job.executor.url.clone(),
                method: job.executor.method.clone(),
            });
        }
        ExecutorKind::Shell => {
            req.shell_executor = Some(proto::ExecutorShell {
                command: job.executor.command.clone(),
            });
        }
    }

    if let Some(retry) = &job.retry_policy {
        req.retry_policy = Some(proto::RetryPolicy {
            max_retries: retry.max_retries as i32,
            backoff: format_duration(retry.backoff),
        });
    }

    req
}
