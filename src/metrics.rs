use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::{CronError, Result};

/// Process-wide metrics, registered against one private registry and
/// exposed through the master's `/metrics` route.
pub struct Metrics {
    registry: Registry,
    pub job_executions_total: IntCounterVec,
    pub is_leader: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let job_executions_total = IntCounterVec::new(
            Opts::new(
                "job_executions_total",
                "Total number of cron job executions.",
            ),
            &["job_name", "status"],
        )
        .map_err(|e| CronError::Internal(e.to_string()))?;
        let is_leader = IntGaugeVec::new(
            Opts::new(
                "is_leader",
                "Is this node currently the leader. 1 if leader, 0 otherwise.",
            ),
            &["node_id"],
        )
        .map_err(|e| CronError::Internal(e.to_string()))?;

        registry
            .register(Box::new(job_executions_total.clone()))
            .map_err(|e| CronError::Internal(e.to_string()))?;
        registry
            .register(Box::new(is_leader.clone()))
            .map_err(|e| CronError::Internal(e.to_string()))?;

        Ok(Self {
            registry,
            job_executions_total,
            is_leader,
        })
    }

    pub fn record_execution(&self, job_name: &str, status: &str) {
        self.job_executions_total
            .with_label_values(&[job_name, status])
            .inc();
    }

    pub fn set_leader(&self, node_id: &str, leading: bool) {
        self.is_leader
            .with_label_values(&[node_id])
            .set(if leading { 1 } else { 0 });
    }

    /// Prometheus text exposition of every registered metric.
    pub fn gather(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| CronError::Internal(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| CronError::Internal(e.to_string()))
    }
}
