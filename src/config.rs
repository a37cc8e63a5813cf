use std::time::Duration;

/// Runtime configuration shared by the master and worker binaries.
/// Binaries fill this from command-line flags; defaults match a
/// single-node local etcd setup.
#[derive(Debug, Clone)]
pub struct Config {
    pub etcd_endpoints: Vec<String>,
    pub etcd_timeout: Duration,
    pub http_listen_addr: String,
    /// TTL for the leader-election session. Worker registrations reuse
    /// this TTL for their lease.
    pub leader_election_ttl: Duration,
    pub grpc_listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["127.0.0.1:2379".to_string()],
            etcd_timeout: Duration::from_secs(5),
            http_listen_addr: "0.0.0.0:8080".to_string(),
            leader_election_ttl: Duration::from_secs(10),
            grpc_listen_addr: "0.0.0.0:50052".to_string(),
        }
    }
}

impl Config {
    pub fn election_ttl_seconds(&self) -> i64 {
        self.leader_election_ttl.as_secs().max(1) as i64
    }
}
