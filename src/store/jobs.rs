use async_trait::async_trait;
use etcd_client::{Client, GetOptions};

use crate::error::{CronError, Result};
use crate::job::Job;
use crate::store::JOBS_PREFIX;

/// Persistence surface for job definitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &Job) -> Result<()>;
    async fn get(&self, name: &str) -> Result<Job>;
    async fn delete(&self, name: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<Job>>;
}

/// Jobs as JSON under `/cron/jobs/<name>`.
pub struct EtcdJobStore {
    client: Client,
}

impl EtcdJobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn key(name: &str) -> String {
        format!("{JOBS_PREFIX}{name}")
    }
}

#[async_trait]
impl JobStore for EtcdJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let value = serde_json::to_vec(job)?;
        let mut client = self.client.clone();
        client.put(Self::key(&job.name), value, None).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Job> {
        let mut client = self.client.clone();
        let resp = client.get(Self::key(name), None).await?;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| CronError::JobNotFound(name.to_string()))?;
        Ok(serde_json::from_slice(kv.value())?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(Self::key(name), None).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut client = self.client.clone();
        let resp = client
            .get(JOBS_PREFIX, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut jobs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<Job>(kv.value()) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    // A corrupt entry must not take down the whole listing.
                    tracing::warn!(
                        key = %String::from_utf8_lossy(kv.key()),
                        error = %e,
                        "Skipping unparseable job entry"
                    );
                }
            }
        }
        Ok(jobs)
    }
}
