use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CronError, Result};

/// Maximum number of retries a job may configure.
pub const MAX_RETRIES_LIMIT: u32 = 10;
/// Maximum length of a job name.
pub const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Http,
    Shell,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Http => write!(f, "http"),
            ExecutorKind::Shell => write!(f, "shell"),
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(ExecutorKind::Http),
            "shell" => Ok(ExecutorKind::Shell),
            other => Err(CronError::UnknownExecutorKind(other.to_string())),
        }
    }
}

/// Per-kind executor configuration. Only the fields for the job's
/// `executor_type` are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    #[default]
    Allow,
    Forbid,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyPolicy::Allow => write!(f, "Allow"),
            ConcurrencyPolicy::Forbid => write!(f, "Forbid"),
        }
    }
}

impl FromStr for ConcurrencyPolicy {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            // An unset policy on the wire means Allow.
            "Allow" | "" => Ok(ConcurrencyPolicy::Allow),
            "Forbid" => Ok(ConcurrencyPolicy::Forbid),
            other => Err(CronError::InvalidJob(format!(
                "invalid concurrency policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_nanos")]
    pub backoff: Duration,
}

/// A scheduled job definition. `name` is the identity; saving a job with
/// an existing name replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    pub executor_type: ExecutorKind,
    pub executor: ExecutorSpec,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Check the job definition, applying defaults (HTTP method, an unset
    /// concurrency policy) in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(CronError::InvalidJob(format!(
                "job name must be 1..={MAX_NAME_LEN} characters"
            )));
        }
        parse_cron_expr(&self.cron_expr)?;
        match self.executor_type {
            ExecutorKind::Http => {
                if self.executor.url.is_empty() {
                    return Err(CronError::InvalidJob(
                        "executor URL cannot be empty for http job".to_string(),
                    ));
                }
                if self.executor.method.is_empty() {
                    self.executor.method = "GET".to_string();
                }
            }
            ExecutorKind::Shell => {
                if self.executor.command.is_empty() {
                    return Err(CronError::InvalidJob(
                        "executor command cannot be empty for shell job".to_string(),
                    ));
                }
            }
        }
        if let Some(retry) = &self.retry_policy {
            if retry.max_retries > MAX_RETRIES_LIMIT {
                return Err(CronError::InvalidJob(format!(
                    "max_retries cannot exceed {MAX_RETRIES_LIMIT}"
                )));
            }
        }
        Ok(())
    }
}

/// Parse a 6-field (seconds included) cron expression.
pub fn parse_cron_expr(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expr).map_err(|e| CronError::InvalidCronExpr {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One attempt by a worker to carry out a job's action.
///
/// `end_time` is `None` exactly while `status` is `Running`; the terminal
/// persistence sets it once. Status only moves `running -> {success,failed}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub retries_attempted: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker_id: String,
}

impl ExecutionRecord {
    /// The initial `running` record, persisted before the executor runs.
    pub fn started(exec_id: &str, job_name: &str, worker_id: &str) -> Self {
        Self {
            id: exec_id.to_string(),
            job_name: job_name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: ExecutionStatus::Running,
            output: String::new(),
            error: String::new(),
            retries_attempted: 0,
            worker_id: worker_id.to_string(),
        }
    }

    pub fn finish_success(&mut self, output: String) {
        self.status = ExecutionStatus::Success;
        self.output = output;
        self.end_time = Some(Utc::now());
    }

    pub fn finish_failed(&mut self, output: String, error: String) {
        self.status = ExecutionStatus::Failed;
        self.output = output;
        self.error = error;
        self.end_time = Some(Utc::now());
    }
}

/// Serialize a `Duration` as integer nanoseconds, the on-disk form of a
/// retry backoff.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// Parse a duration string like "100ms", "2s" or "1m30s".
///
/// Units: ns, us, ms, s, m, h. Concatenated terms add up.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CronError::InvalidJob("duration cannot be empty".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }
        let mut unit = String::from(c);
        // Two-letter units: ns, us, ms.
        if c != 's' && chars.peek() == Some(&'s') {
            unit.push(chars.next().unwrap());
        }
        let value: f64 = num
            .parse()
            .map_err(|_| CronError::InvalidJob(format!("invalid duration: {input:?}")))?;
        num.clear();
        let nanos = match unit.as_str() {
            "ns" => value,
            "us" => value * 1_000.0,
            "ms" => value * 1_000_000.0,
            "s" => value * 1_000_000_000.0,
            "m" => value * 60.0 * 1_000_000_000.0,
            "h" => value * 3_600.0 * 1_000_000_000.0,
            _ => {
                return Err(CronError::InvalidJob(format!(
                    "unknown duration unit {unit:?} in {input:?}"
                )))
            }
        };
        total += Duration::from_nanos(nanos as u64);
    }
    if !num.is_empty() {
        return Err(CronError::InvalidJob(format!(
            "duration {input:?} is missing a unit"
        )));
    }
    Ok(total)
}

/// Format a duration for the wire, the inverse of [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0s".to_string();
    }
    if total_ms < 1_000 {
        return format!("{total_ms}ms");
    }
    let mut out = String::new();
    let mut secs = d.as_secs();
    let sub_ms = d.subsec_millis();
    if secs >= 3_600 {
        out.push_str(&format!("{}h", secs / 3_600));
        secs %= 3_600;
    }
    if secs >= 60 {
        out.push_str(&format!("{}m", secs / 60));
        secs %= 60;
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    if sub_ms > 0 {
        out.push_str(&format!("{sub_ms}ms"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_job(name: &str, command: &str) -> Job {
        Job {
            id: String::new(),
            name: name.to_string(),
            cron_expr: "*/1 * * * * *".to_string(),
            executor_type: ExecutorKind::Shell,
            executor: ExecutorSpec {
                command: command.to_string(),
                ..Default::default()
            },
            concurrency_policy: ConcurrencyPolicy::Allow,
            retry_policy: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_accepts_shell_job() {
        let mut job = shell_job("backup", "echo hi");
        assert!(job.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_command() {
        let mut job = shell_job("backup", "");
        assert!(matches!(job.validate(), Err(CronError::InvalidJob(_))));
    }

    #[test]
    fn validate_rejects_bad_cron() {
        let mut job = shell_job("backup", "echo hi");
        job.cron_expr = "not a cron".to_string();
        assert!(matches!(
            job.validate(),
            Err(CronError::InvalidCronExpr { .. })
        ));
    }

    #[test]
    fn validate_rejects_long_name() {
        let mut job = shell_job(&"x".repeat(129), "echo hi");
        assert!(matches!(job.validate(), Err(CronError::InvalidJob(_))));
    }

    #[test]
    fn validate_defaults_http_method() {
        let mut job = shell_job("ping", "unused");
        job.executor_type = ExecutorKind::Http;
        job.executor = ExecutorSpec {
            url: "http://example.com/health".to_string(),
            ..Default::default()
        };
        job.validate().unwrap();
        assert_eq!(job.executor.method, "GET");
    }

    #[test]
    fn validate_caps_retries() {
        let mut job = shell_job("backup", "echo hi");
        job.retry_policy = Some(RetryPolicy {
            max_retries: 11,
            backoff: Duration::from_millis(100),
        });
        assert!(matches!(job.validate(), Err(CronError::InvalidJob(_))));
    }

    #[test]
    fn job_json_round_trip() {
        let mut job = shell_job("backup", "echo hi");
        job.id = "abc".to_string();
        job.retry_policy = Some(RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(100),
        });
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, job.name);
        assert_eq!(back.cron_expr, job.cron_expr);
        assert_eq!(back.executor, job.executor);
        assert_eq!(back.retry_policy, job.retry_policy);
    }

    #[test]
    fn executor_kind_json_is_lowercase() {
        let json = serde_json::to_string(&ExecutorKind::Http).unwrap();
        assert_eq!(json, "\"http\"");
    }

    #[test]
    fn parse_duration_terms() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3_600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5parsecs").is_err());
    }

    #[test]
    fn format_duration_round_trips() {
        for d in [
            Duration::from_millis(100),
            Duration::from_secs(2),
            Duration::from_secs(90),
            Duration::from_secs(3_661),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn record_terminal_transitions_set_end_time() {
        let mut record = ExecutionRecord::started("e1", "backup", "w1");
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.end_time.is_none());

        record.finish_success("hi\n".to_string());
        assert_eq!(record.status, ExecutionStatus::Success);
        let end = record.end_time.expect("terminal status sets end_time");
        assert!(end >= record.start_time);
    }
}
