//! Periodic HTTP health polling.

use crate::scheduler::{TaskContext, WorkFunction, WorkResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of a single poll.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRecord {
    /// 1-based poll number.
    pub check: u32,
    pub status: Option<u16>,
    pub response_time_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Polls `url` `max_checks` times, `interval` apart.
///
/// Individual poll failures are recorded, not fatal: the task completes with
/// the full set of results unless it is cancelled.
#[derive(Debug, Clone)]
pub struct HealthCheckAction {
    url: String,
    interval: Duration,
    max_checks: u32,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl HealthCheckAction {
    /// Ten checks, one minute apart, with a 10 second request timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            interval: Duration::from_secs(60),
            max_checks: 10,
            request_timeout: Duration::from_secs(10),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_checks(mut self, max_checks: u32) -> Self {
        self.max_checks = max_checks;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn poll(&self, check: u32) -> CheckRecord {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .timeout(self.request_timeout)
            .send()
            .await;
        let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match response {
            Ok(resp) => {
                let status = resp.status();
                CheckRecord {
                    check,
                    status: Some(status.as_u16()),
                    response_time_ms,
                    success: status.is_success(),
                    error: None,
                }
            }
            Err(e) => CheckRecord {
                check,
                status: None,
                response_time_ms,
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl WorkFunction for HealthCheckAction {
    async fn execute(&self, ctx: TaskContext) -> WorkResult {
        let mut results = Vec::with_capacity(self.max_checks as usize);

        for check in 1..=self.max_checks {
            ctx.check_cancelled()?;
            let record = self.poll(check).await;
            debug!(url = %self.url, check, success = record.success, "health check");
            results.push(record);
            ctx.set_progress(f64::from(check) / f64::from(self.max_checks) * 100.0);

            if check < self.max_checks {
                ctx.sleep(self.interval).await?;
            }
        }

        ctx.set_progress(100.0);
        let successful_checks = results.iter().filter(|r| r.success).count();
        Ok(json!({
            "url": self.url,
            "total_checks": results.len(),
            "successful_checks": successful_checks,
            "results": results,
        }))
    }
}
