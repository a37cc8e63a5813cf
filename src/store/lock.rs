use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, LockOptions};
use tokio::task::JoinHandle;

use crate::error::{CronError, Result};
use crate::store::LOCK_PREFIX;

/// How long a lock attempt may wait before it counts as not acquired.
const TRY_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
/// TTL of the session backing one lock acquisition.
const LOCK_SESSION_TTL: i64 = 10;

/// Cluster-wide mutual exclusion keyed by job name.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to take the named lock within a bounded wait. Times out with
    /// `LockNotAcquired`; never blocks past the deadline.
    async fn try_lock(&self, name: &str) -> Result<Box<dyn LockGuard>>;
}

#[async_trait]
pub trait LockGuard: Send + Sync {
    async fn unlock(self: Box<Self>) -> Result<()>;
}

/// Locks under `/cron/locks/<name>`, each acquisition on its own session
/// so losing one lease is a bounded local event.
pub struct EtcdLocker {
    client: Client,
}

impl EtcdLocker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Locker for EtcdLocker {
    async fn try_lock(&self, name: &str) -> Result<Box<dyn LockGuard>> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(LOCK_SESSION_TTL, None).await?;
        let lease_id = lease.id();

        // The lock must outlive executions longer than the session TTL.
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let keepalive: JoinHandle<()> = tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs((LOCK_SESSION_TTL as u64 / 3).max(1)));
            loop {
                tick.tick().await;
                if keeper.keep_alive().await.is_err() {
                    return;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    _ => return,
                }
            }
        });

        let key = format!("{LOCK_PREFIX}{name}");
        let attempt = tokio::time::timeout(
            TRY_LOCK_TIMEOUT,
            client.lock(key, Some(LockOptions::new().with_lease(lease_id))),
        )
        .await;

        match attempt {
            Ok(Ok(resp)) => Ok(Box::new(EtcdLockGuard {
                client: self.client.clone(),
                key: resp.key().to_vec(),
                lease_id,
                keepalive,
            })),
            Ok(Err(e)) => {
                keepalive.abort();
                let _ = client.lease_revoke(lease_id).await;
                Err(e.into())
            }
            Err(_) => {
                keepalive.abort();
                // Revoking the lease removes our waiter key so the lock
                // cannot be granted to us after we gave up.
                let _ = client.lease_revoke(lease_id).await;
                Err(CronError::LockNotAcquired(name.to_string()))
            }
        }
    }
}

struct EtcdLockGuard {
    client: Client,
    key: Vec<u8>,
    lease_id: i64,
    keepalive: JoinHandle<()>,
}

#[async_trait]
impl LockGuard for EtcdLockGuard {
    async fn unlock(self: Box<Self>) -> Result<()> {
        self.keepalive.abort();
        let mut client = self.client.clone();
        let unlocked = client.unlock(self.key).await;
        let _ = client.lease_revoke(self.lease_id).await;
        unlocked?;
        Ok(())
    }
}
