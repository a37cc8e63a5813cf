use std::time::Duration;

use etcd_client::{Client, PutOptions};

use crate::error::Result;
use crate::store::WORKERS_PREFIX;

/// Lease-bound registration of this worker in the coordination store.
///
/// The registration key vanishes on its own within the TTL if the process
/// dies; a graceful shutdown revokes the lease so it vanishes at once.
pub struct WorkerRegistry {
    client: Client,
    worker_id: String,
    lease_id: i64,
}

impl WorkerRegistry {
    /// Register under `/cron/workers/<worker_id>` and start refreshing the
    /// lease in the background.
    ///
    /// If the keep-alive stream ever closes, the worker stays up to finish
    /// in-flight executions but does not re-register; the operator
    /// restarts the process.
    pub async fn register(
        client: Client,
        worker_id: &str,
        address: &str,
        ttl_seconds: i64,
    ) -> Result<Self> {
        let mut c = client.clone();
        let lease = c.lease_grant(ttl_seconds, None).await?;
        let lease_id = lease.id();

        let key = format!("{WORKERS_PREFIX}{worker_id}");
        c.put(
            key.as_str(),
            address,
            Some(PutOptions::new().with_lease(lease_id)),
        )
        .await?;

        let (mut keeper, mut stream) = c.lease_keep_alive(lease_id).await?;
        let id = worker_id.to_string();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs((ttl_seconds as u64 / 3).max(1)));
            loop {
                tick.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        tracing::debug!(worker_id = %id, ttl = resp.ttl(), "lease keep-alive refreshed");
                    }
                    _ => break,
                }
            }
            tracing::warn!(
                worker_id = %id,
                "keep-alive stream closed, worker registration may have expired"
            );
        });

        tracing::info!(key = %key, value = %address, "worker registered successfully");
        Ok(Self {
            client,
            worker_id: worker_id.to_string(),
            lease_id,
        })
    }

    /// Revoke the lease; the registration key is deleted with it.
    pub async fn deregister(self) -> Result<()> {
        tracing::info!(worker_id = %self.worker_id, "deregistering worker");
        let mut client = self.client.clone();
        client.lease_revoke(self.lease_id).await?;
        Ok(())
    }
}
