//! Gateway to the coordination store (etcd).
//!
//! All persistent state lives under the `/cron/` keyspace: job
//! definitions, lease-bound worker registrations, execution history, the
//! leader election subtree, and per-job lock subtrees. Components hold
//! only in-memory mirrors that are always reconcilable from here.

use etcd_client::{Client, ConnectOptions};

use crate::config::Config;
use crate::error::Result;

pub mod election;
pub mod history;
pub mod jobs;
pub mod lock;

pub use election::{LeaderElection, LeadershipLost, LeadershipWatch};
pub use history::{EtcdExecutionStore, ExecutionStore};
pub use jobs::{EtcdJobStore, JobStore};
pub use lock::{EtcdLocker, LockGuard, Locker};

pub const JOBS_PREFIX: &str = "/cron/jobs/";
pub const WORKERS_PREFIX: &str = "/cron/workers/";
pub const HISTORY_PREFIX: &str = "/cron/history/";
pub const ELECTION_KEY: &str = "/cron/leader";
pub const LOCK_PREFIX: &str = "/cron/locks/";

/// Handle to the coordination store. `etcd_client::Client` is cheap to
/// clone; every component that talks to the store works on its own clone.
#[derive(Clone)]
pub struct Store {
    client: Client,
}

impl Store {
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.etcd_timeout)
            .with_timeout(config.etcd_timeout);
        let client = Client::connect(&config.etcd_endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}
