use std::collections::HashMap;
use std::time::Duration;

use etcd_client::{Client, EventType, GetOptions, WatchOptions};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::WORKERS_PREFIX;

/// Live mirror of the worker registry.
///
/// The map is written only by the watcher task driven from [`run`];
/// everyone else takes snapshot reads. A worker whose lease expires
/// disappears from the mirror within the registration TTL.
///
/// [`run`]: WorkerDiscovery::run
pub struct WorkerDiscovery {
    workers: RwLock<HashMap<String, String>>,
}

impl WorkerDiscovery {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Point-in-time copy of the live worker addresses.
    pub async fn get_workers(&self) -> Vec<String> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Keep the mirror synchronized for the lifetime of the master:
    /// snapshot via a prefix list, then apply watch events; if the watch
    /// stream terminates, start over with a fresh list-then-watch.
    pub async fn run(&self, client: Client, cancel: CancellationToken) {
        tracing::info!("starting to watch for workers");
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.sync(client.clone(), &cancel).await {
                tracing::warn!(error = %e, "worker watch interrupted, resyncing");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    /// One list-then-watch cycle. Returns when the watch stream ends.
    async fn sync(&self, mut client: Client, cancel: &CancellationToken) -> Result<()> {
        let resp = client
            .get(WORKERS_PREFIX, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        {
            let mut workers = self.workers.write().await;
            workers.clear();
            for kv in resp.kvs() {
                if let Some(worker_id) = worker_id_from_key(kv.key()) {
                    let addr = String::from_utf8_lossy(kv.value()).to_string();
                    tracing::info!(id = %worker_id, addr = %addr, "found existing worker");
                    workers.insert(worker_id, addr);
                }
            }
        }

        let (mut watcher, mut stream) = client
            .watch(
                WORKERS_PREFIX,
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_start_revision(revision + 1),
                ),
            )
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = watcher.cancel().await;
                    return Ok(());
                }
                msg = stream.message() => match msg? {
                    Some(resp) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Some(worker_id) = worker_id_from_key(kv.key()) else { continue };
                            let addr = String::from_utf8_lossy(kv.value()).to_string();
                            self.apply(event.event_type(), worker_id, addr).await;
                        }
                    }
                    // Stream ended; the caller re-enters list-then-watch.
                    None => return Ok(()),
                }
            }
        }
    }

    async fn apply(&self, event_type: EventType, worker_id: String, addr: String) {
        let mut workers = self.workers.write().await;
        match event_type {
            EventType::Put => {
                if !workers.contains_key(&worker_id) {
                    tracing::info!(id = %worker_id, addr = %addr, "new worker discovered");
                }
                workers.insert(worker_id, addr);
            }
            EventType::Delete => {
                let known = workers.remove(&worker_id);
                tracing::info!(id = %worker_id, addr = ?known, "worker deregistered");
            }
        }
    }
}

impl Default for WorkerDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_id_from_key(key: &[u8]) -> Option<String> {
    std::str::from_utf8(key)
        .ok()?
        .strip_prefix(WORKERS_PREFIX)
        .map(str::to_string)
}
