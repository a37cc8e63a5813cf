use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::job::{ExecutionRecord, Job};
use crate::master::scheduler::CronWheel;
use crate::store::election::LeadershipWatch;
use crate::store::{ExecutionStore, JobStore, LeaderElection};

/// Pause before re-campaigning after a failed campaign.
const CAMPAIGN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Binds the cron wheel to leadership.
///
/// Supervisor loop: campaign, load every job from the store into the
/// wheel, run the wheel until leadership is lost or the root token is
/// cancelled, then tear the wheel down and go again. Only the replica
/// holding the election key ever fires dispatches.
pub struct SchedulerService {
    election: Arc<LeaderElection>,
    wheel: Arc<CronWheel>,
    jobs: Arc<dyn JobStore>,
    node_id: String,
}

impl SchedulerService {
    pub fn new(
        election: Arc<LeaderElection>,
        wheel: Arc<CronWheel>,
        jobs: Arc<dyn JobStore>,
        node_id: String,
    ) -> Self {
        Self {
            election,
            wheel,
            jobs,
            node_id,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(node_id = %self.node_id, "scheduler service starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            tracing::info!(node_id = %self.node_id, "campaigning for leadership");
            let lost = match self.election.campaign(&cancel).await {
                Ok(lost) => lost,
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!(node_id = %self.node_id, error = %e, "campaign failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(CAMPAIGN_RETRY_DELAY) => {}
                    }
                    continue;
                }
            };

            self.load_jobs().await;
            self.wheel.start().await;

            tokio::select! {
                _ = lost.wait() => {
                    tracing::warn!(node_id = %self.node_id, "leadership lost, stopping scheduler");
                }
                _ = cancel.cancelled() => {}
            }

            self.wheel.stop().await;
            self.wheel.clear();
            self.election.resign().await;
        }

        tracing::info!(node_id = %self.node_id, "scheduler service shut down");
    }

    async fn load_jobs(&self) {
        let jobs = match self.jobs.list().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(node_id = %self.node_id, error = %e, "failed to load jobs for scheduler");
                return;
            }
        };
        for job in &jobs {
            if let Err(e) = self.wheel.add_job(job) {
                tracing::error!(job_name = %job.name, error = %e, "failed to schedule stored job");
            }
        }
        tracing::info!(node_id = %self.node_id, jobs = jobs.len(), "loaded jobs into scheduler");
    }
}

/// API-facing job operations.
///
/// Changes are always persisted; they are installed into the wheel only
/// on the leading replica. Followers pick them up when they next win a
/// campaign and reload from the store.
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    history: Arc<dyn ExecutionStore>,
    wheel: Arc<CronWheel>,
    leadership: Arc<dyn LeadershipWatch>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        history: Arc<dyn ExecutionStore>,
        wheel: Arc<CronWheel>,
        leadership: Arc<dyn LeadershipWatch>,
    ) -> Self {
        Self {
            jobs,
            history,
            wheel,
            leadership,
        }
    }

    /// Validate and persist a job, assigning an id and timestamps on first
    /// save. Returns the stored form.
    pub async fn save(&self, mut job: Job) -> Result<Job> {
        job.validate()?;

        let now = Utc::now();
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
            job.created_at = now;
        }
        job.updated_at = now;

        self.jobs.save(&job).await?;
        if self.leadership.is_leader() {
            self.wheel.add_job(&job)?;
        }
        Ok(job)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        if self.leadership.is_leader() {
            self.wheel.remove_job(name);
        }
        self.jobs.delete(name).await
    }

    pub async fn get(&self, name: &str) -> Result<Job> {
        self.jobs.get(name).await
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.jobs.list().await
    }

    pub async fn list_history(
        &self,
        job_name: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.history.list_by_job(job_name, page, page_size).await
    }
}
