use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tonic::{Request, Response, Status};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{CronError, Result};
use crate::job::{
    parse_duration, ConcurrencyPolicy, ExecutionRecord, ExecutorKind, ExecutorSpec, Job,
    RetryPolicy,
};
use crate::metrics::Metrics;
use crate::proto;
use crate::proto::worker_server::Worker;
use crate::store::{ExecutionStore, Locker};
use crate::worker::executor::{ExecOutcome, ExecutorRegistry};

/// The `Worker` RPC service and execution supervisor.
///
/// `execute_task` acknowledges with a fresh execution id and hands the
/// job to a background supervisor that owns the record lifecycle:
/// persist `running`, gate `Forbid` jobs on the distributed lock, run the
/// executor behind a panic barrier, and persist the terminal record on
/// every exit path.
#[derive(Clone)]
pub struct WorkerService {
    executors: Arc<ExecutorRegistry>,
    locker: Arc<dyn Locker>,
    history: Arc<dyn ExecutionStore>,
    metrics: Arc<Metrics>,
    worker_id: String,
}

impl WorkerService {
    pub fn new(
        executors: ExecutorRegistry,
        locker: Arc<dyn Locker>,
        history: Arc<dyn ExecutionStore>,
        metrics: Arc<Metrics>,
        worker_id: String,
    ) -> Self {
        Self {
            executors: Arc::new(executors),
            locker,
            history,
            metrics,
            worker_id,
        }
    }

    /// Drive one execution through the record state machine.
    pub async fn run_job(self, exec_id: String, job: Job) {
        let mut record = ExecutionRecord::started(&exec_id, &job.name, &self.worker_id);
        if let Err(e) = self.history.save(&record).await {
            // Execution proceeds regardless; the terminal save tries again.
            tracing::error!(error = %e, "failed to save initial execution record");
        }

        let outcome = self.supervise(&job).await;

        record.retries_attempted = outcome.retries_attempted;
        let status_label = match outcome.error {
            None => {
                record.finish_success(outcome.output);
                "success"
            }
            Some(error) => {
                tracing::error!(error = %error, "job execution failed");
                record.finish_failed(outcome.output, error);
                "failed"
            }
        };
        self.metrics.record_execution(&job.name, status_label);

        if let Err(e) = self.history.save(&record).await {
            tracing::error!(error = %e, "failed to save final execution record");
        }
    }

    async fn supervise(&self, job: &Job) -> ExecOutcome {
        // Forbid jobs must not overlap themselves anywhere in the
        // cluster; losing the lock race skips this execution. Retries
        // below happen under the same lock.
        let guard = if job.concurrency_policy == ConcurrencyPolicy::Forbid {
            match self.locker.try_lock(&job.name).await {
                Ok(guard) => {
                    tracing::info!(job_name = %job.name, "acquired lock for job execution");
                    Some(guard)
                }
                Err(e) => {
                    let message = format!("skipped execution: {e}");
                    tracing::warn!(job_name = %job.name, "{message}");
                    return ExecOutcome::failure(String::new(), message);
                }
            }
        } else {
            None
        };

        let outcome = match self.executors.get(&job.executor_type) {
            Some(executor) => {
                let executor = executor.clone();
                let job_for_exec = job.clone();
                // The executor runs on its own task so a panicking
                // executor fails this execution instead of the worker.
                match tokio::spawn(async move { executor.execute(&job_for_exec).await }).await {
                    Ok(outcome) => outcome,
                    Err(join_err) if join_err.is_panic() => ExecOutcome::failure(
                        String::new(),
                        format!("panic: {}", panic_message(join_err)),
                    ),
                    Err(join_err) => ExecOutcome::failure(
                        String::new(),
                        format!("executor task aborted: {join_err}"),
                    ),
                }
            }
            None => ExecOutcome::failure(
                String::new(),
                CronError::UnknownExecutorKind(job.executor_type.to_string()).to_string(),
            ),
        };

        if let Some(guard) = guard {
            match guard.unlock().await {
                Ok(()) => tracing::info!(job_name = %job.name, "released job lock"),
                Err(e) => tracing::error!(job_name = %job.name, error = %e, "failed to unlock job"),
            }
        }
        outcome
    }
}

#[tonic::async_trait]
impl Worker for WorkerService {
    async fn execute_task(
        &self,
        request: Request<proto::TaskRequest>,
    ) -> std::result::Result<Response<proto::TaskResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(
            job_name = %req.name,
            worker_id = %self.worker_id,
            "received task execution request"
        );

        let job = match task_request_to_job(&req) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_name = %req.name, error = %e, "invalid task request");
                return Ok(Response::new(proto::TaskResponse {
                    execution_id: String::new(),
                    error_message: e.to_string(),
                }));
            }
        };

        let exec_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "run_job",
            job_name = %job.name,
            execution_id = %exec_id,
            worker_id = %self.worker_id,
        );
        // Fire and forget: the ack does not wait for the executor.
        tokio::spawn(self.clone().run_job(exec_id.clone(), job).instrument(span));

        Ok(Response::new(proto::TaskResponse {
            execution_id: exec_id,
            error_message: String::new(),
        }))
    }
}

/// Parse the wire request into a job definition.
pub fn task_request_to_job(req: &proto::TaskRequest) -> Result<Job> {
    let executor_type: ExecutorKind = req.executor_type.parse()?;
    let executor = match executor_type {
        ExecutorKind::Http => {
            let http = req.http_executor.as_ref().ok_or_else(|| {
                CronError::InvalidJob("http_executor is missing for http job".to_string())
            })?;
            ExecutorSpec {
                url: http.url.clone(),
                method: http.method.clone(),
                command: String::new(),
            }
        }
        ExecutorKind::Shell => {
            let shell = req.shell_executor.as_ref().ok_or_else(|| {
                CronError::InvalidJob("shell_executor is missing for shell job".to_string())
            })?;
            ExecutorSpec {
                command: shell.command.clone(),
                ..Default::default()
            }
        }
    };

    let retry_policy = match &req.retry_policy {
        Some(retry) => {
            if retry.max_retries < 0 {
                return Err(CronError::InvalidJob(
                    "max_retries cannot be negative".to_string(),
                ));
            }
            Some(RetryPolicy {
                max_retries: retry.max_retries as u32,
                backoff: parse_duration(&retry.backoff)?,
            })
        }
        None => None,
    };

    let created_at = req
        .created_at
        .as_ref()
        .and_then(|ts| {
            Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32)
                .single()
        })
        .unwrap_or_default();

    Ok(Job {
        id: req.id.clone(),
        name: req.name.clone(),
        cron_expr: req.cron_expr.clone(),
        executor_type,
        executor,
        concurrency_policy: req.concurrency_policy.parse()?,
        retry_policy,
        created_at,
        updated_at: created_at,
    })
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    let payload = join_err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
