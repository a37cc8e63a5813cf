use async_trait::async_trait;
use etcd_client::{Client, GetOptions, SortOrder, SortTarget};

use crate::error::{CronError, Result};
use crate::job::ExecutionRecord;
use crate::store::HISTORY_PREFIX;

/// Persistence surface for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist one record. Saving an existing `(job_name, id)` pair
    /// overwrites it; terminal states are idempotent under re-persistence.
    async fn save(&self, record: &ExecutionRecord) -> Result<()>;
    async fn get(&self, job_name: &str, exec_id: &str) -> Result<ExecutionRecord>;
    /// Page through a job's records, newest first. `page` starts at 1.
    async fn list_by_job(
        &self,
        job_name: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ExecutionRecord>>;
}

/// Execution records as JSON under `/cron/history/<job_name>/<exec_id>`.
///
/// Pagination reads the whole prefix and slices client-side; that is fine
/// for the per-job histories this system keeps but does not scale to very
/// large ones.
pub struct EtcdExecutionStore {
    client: Client,
}

impl EtcdExecutionStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn key(job_name: &str, exec_id: &str) -> String {
        format!("{HISTORY_PREFIX}{job_name}/{exec_id}")
    }
}

#[async_trait]
impl ExecutionStore for EtcdExecutionStore {
    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        let mut client = self.client.clone();
        client
            .put(Self::key(&record.job_name, &record.id), value, None)
            .await?;
        Ok(())
    }

    async fn get(&self, job_name: &str, exec_id: &str) -> Result<ExecutionRecord> {
        let mut client = self.client.clone();
        let resp = client.get(Self::key(job_name, exec_id), None).await?;
        let kv = resp.kvs().first().ok_or_else(|| {
            CronError::Internal(format!("execution record {job_name}/{exec_id} not found"))
        })?;
        Ok(serde_json::from_slice(kv.value())?)
    }

    async fn list_by_job(
        &self,
        job_name: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let prefix = format!("{HISTORY_PREFIX}{job_name}/");
        let mut client = self.client.clone();
        let resp = client
            .get(
                prefix,
                Some(
                    GetOptions::new()
                        .with_prefix()
                        .with_sort(SortTarget::Create, SortOrder::Descend),
                ),
            )
            .await?;

        let (start, end) = page_bounds(page, page_size, resp.kvs().len());
        let mut records = Vec::with_capacity(end - start);
        for kv in &resp.kvs()[start..end] {
            match serde_json::from_slice::<ExecutionRecord>(kv.value()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(kv.key()),
                        error = %e,
                        "Skipping unparseable execution record"
                    );
                }
            }
        }
        Ok(records)
    }
}

/// Clamp a 1-based page window to `total` entries.
pub(crate) fn page_bounds(page: usize, page_size: usize, total: usize) -> (usize, usize) {
    let page = page.max(1);
    let start = (page - 1).saturating_mul(page_size).min(total);
    let end = start.saturating_add(page_size).min(total);
    (start, end)
}
