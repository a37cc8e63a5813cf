use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, LeaderKey, LeaseKeepAliveStream, LeaseKeeper, ResignOptions};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::metrics::Metrics;
use crate::store::ELECTION_KEY;

/// Best-effort observation of whether this replica currently leads.
/// Readable without blocking; the election updates it as epochs begin
/// and end.
pub trait LeadershipWatch: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leader election over the store's election primitive.
///
/// A campaign creates a session (lease plus keep-alive task) and blocks
/// until this candidate holds the election key. The store guarantees at
/// most one holder; `is_leader` is a best-effort local observation.
pub struct LeaderElection {
    client: Client,
    node_id: String,
    ttl_seconds: i64,
    is_leader: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    state: Mutex<Option<Leadership>>,
}

struct Leadership {
    leader_key: LeaderKey,
    lease_id: i64,
    keepalive: JoinHandle<()>,
}

/// Resolves when the election session dies. Closed exactly once per
/// successful campaign.
pub struct LeadershipLost {
    rx: oneshot::Receiver<()>,
}

impl LeadershipLost {
    pub async fn wait(self) {
        // Either an explicit loss signal or the keep-alive task going away
        // ends the epoch.
        let _ = self.rx.await;
    }
}

impl LeaderElection {
    pub fn new(client: Client, node_id: String, ttl_seconds: i64, metrics: Arc<Metrics>) -> Self {
        metrics.set_leader(&node_id, false);
        Self {
            client,
            node_id,
            ttl_seconds,
            is_leader: Arc::new(AtomicBool::new(false)),
            metrics,
            state: Mutex::new(None),
        }
    }

    /// Campaign for leadership. Blocks until this node is the leader, the
    /// campaign fails, or `cancel` fires.
    pub async fn campaign(&self, cancel: &CancellationToken) -> Result<LeadershipLost> {
        // Drop any session left over from a lost epoch.
        self.state.lock().await.take();

        let mut client = self.client.clone();
        let lease = client.lease_grant(self.ttl_seconds, None).await?;
        let lease_id = lease.id();

        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        let (lost_tx, lost_rx) = oneshot::channel();
        let keepalive = tokio::spawn(run_session_keepalive(
            keeper,
            stream,
            Duration::from_secs((self.ttl_seconds as u64 / 3).max(1)),
            lost_tx,
            self.is_leader.clone(),
            self.metrics.clone(),
            self.node_id.clone(),
        ));

        let mut campaign_client = self.client.clone();
        let campaign_result = tokio::select! {
            res = campaign_client.campaign(ELECTION_KEY, self.node_id.clone(), lease_id) => res,
            _ = cancel.cancelled() => {
                keepalive.abort();
                let _ = client.lease_revoke(lease_id).await;
                return Err(CronError::Internal("campaign cancelled".to_string()));
            }
        };

        let resp = match campaign_result {
            Ok(resp) => resp,
            Err(e) => {
                keepalive.abort();
                let _ = client.lease_revoke(lease_id).await;
                return Err(e.into());
            }
        };
        let leader_key = resp.leader().cloned().ok_or_else(|| {
            CronError::Internal("campaign response carried no leader key".to_string())
        })?;

        tracing::info!(node_id = %self.node_id, "successfully campaigned and became the leader");
        self.is_leader.store(true, Ordering::SeqCst);
        self.metrics.set_leader(&self.node_id, true);
        *self.state.lock().await = Some(Leadership {
            leader_key,
            lease_id,
            keepalive,
        });

        Ok(LeadershipLost { rx: lost_rx })
    }

    /// Voluntarily give up leadership and tear down the session.
    pub async fn resign(&self) {
        let Some(leadership) = self.state.lock().await.take() else {
            return;
        };
        tracing::info!(node_id = %self.node_id, "resigning leadership");
        self.is_leader.store(false, Ordering::SeqCst);
        self.metrics.set_leader(&self.node_id, false);
        leadership.keepalive.abort();

        let mut client = self.client.clone();
        if let Err(e) = client
            .resign(Some(ResignOptions::new().with_leader(leadership.leader_key)))
            .await
        {
            tracing::warn!(node_id = %self.node_id, error = %e, "Failed to resign election key");
        }
        let _ = client.lease_revoke(leadership.lease_id).await;
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }
}

impl LeadershipWatch for LeaderElection {
    fn is_leader(&self) -> bool {
        LeaderElection::is_leader(self)
    }
}

/// Refresh the session lease until it can no longer be refreshed, then
/// flip the leadership observation off and signal the lost channel.
async fn run_session_keepalive(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    period: Duration,
    lost_tx: oneshot::Sender<()>,
    is_leader: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    node_id: String,
) {
    let mut tick = tokio::time::interval(period);
    loop {
        tick.tick().await;
        if keeper.keep_alive().await.is_err() {
            break;
        }
        match stream.message().await {
            // ttl 0 means the lease is already gone.
            Ok(Some(resp)) if resp.ttl() > 0 => {}
            _ => break,
        }
    }

    tracing::warn!(node_id = %node_id, "election session expired, leadership lost");
    is_leader.store(false, Ordering::SeqCst);
    metrics.set_leader(&node_id, false);
    let _ = lost_tx.send(());
}
