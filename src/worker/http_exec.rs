use std::time::Duration;

use async_trait::async_trait;

use crate::job::Job;
use crate::worker::executor::{ExecOutcome, TaskExecutor};

/// Overall client timeout per attempt.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
/// How much of the response body is kept for the execution record.
const MAX_BODY_CAPTURE: usize = 1024;

/// Calls the job's URL. Server errors (5xx) and timeouts are retriable;
/// everything else fails the execution on the first attempt.
pub struct HttpExecutor {
    client: reqwest::Client,
}

struct AttemptFailure {
    output: String,
    message: String,
    retriable: bool,
}

impl HttpExecutor {
    pub fn new() -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| crate::error::CronError::Internal(e.to_string()))?;
        Ok(Self { client })
    }

    async fn attempt(&self, job: &Job) -> Result<String, AttemptFailure> {
        let method_str = if job.executor.method.is_empty() {
            "GET"
        } else {
            job.executor.method.as_str()
        };
        let method =
            reqwest::Method::from_bytes(method_str.as_bytes()).map_err(|e| AttemptFailure {
                output: String::new(),
                message: format!("failed to create http request: {e}"),
                retriable: false,
            })?;

        let resp = self
            .client
            .request(method, &job.executor.url)
            .send()
            .await
            .map_err(|e| AttemptFailure {
                output: String::new(),
                message: format!("http request failed: {e}"),
                // Only timeouts are retriable among transport failures;
                // connection refused and DNS errors fail the attempt for
                // good.
                retriable: e.is_timeout(),
            })?;

        let status = resp.status();
        let body = match resp.bytes().await {
            Ok(bytes) => {
                let capped = &bytes[..bytes.len().min(MAX_BODY_CAPTURE)];
                String::from_utf8_lossy(capped).to_string()
            }
            Err(_) => String::new(),
        };

        if status.is_server_error() {
            return Err(AttemptFailure {
                output: body,
                message: format!("http request returned 5xx server error: {status}"),
                retriable: true,
            });
        }
        if status.is_client_error() {
            return Err(AttemptFailure {
                output: body,
                message: format!("http request returned 4xx client error: {status}"),
                retriable: false,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn execute(&self, job: &Job) -> ExecOutcome {
        let (max_retries, backoff) = match &job.retry_policy {
            Some(policy) if policy.max_retries > 0 => (policy.max_retries, policy.backoff),
            _ => (0, Duration::ZERO),
        };

        let mut attempt_no = 0;
        loop {
            match self.attempt(job).await {
                Ok(output) => {
                    return ExecOutcome {
                        output,
                        retries_attempted: attempt_no,
                        error: None,
                    };
                }
                Err(failure) if !failure.retriable => {
                    return ExecOutcome {
                        output: failure.output,
                        retries_attempted: attempt_no,
                        error: Some(format!(
                            "non-retriable error on attempt {}: {}",
                            attempt_no + 1,
                            failure.message
                        )),
                    };
                }
                Err(failure) => {
                    if attempt_no >= max_retries {
                        let error = if max_retries == 0 {
                            failure.message
                        } else {
                            format!("job failed after {max_retries} retries: {}", failure.message)
                        };
                        return ExecOutcome {
                            output: failure.output,
                            retries_attempted: attempt_no,
                            error: Some(error),
                        };
                    }
                    tracing::warn!(
                        job_name = %job.name,
                        attempt = attempt_no + 1,
                        error = %failure.message,
                        "http attempt failed, retrying"
                    );
                    attempt_no += 1;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
