//! Monitor-to-daemon notification channel.
//!
//! Every status is first written to the [`StatusStore`], then posted to the
//! daemon at `/monitor/{id}/start` or `/monitor/{id}/stop`. Delivery is
//! retried with a fixed delay; giving up is logged and otherwise tolerated
//! because the durable record is what recovery trusts.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use crate::status::{StartStatus, StatusError, StatusStore, StopStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

pub fn start_path(id: &str) -> String {
    format!("/monitor/{id}/start")
}

pub fn stop_path(id: &str) -> String {
    format!("/monitor/{id}/stop")
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The daemon refused the payload; retrying cannot help.
    #[error("daemon rejected notification ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("daemon unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<NotifyError>,
    },

    #[error("failed to persist status: {0}")]
    Persist(#[from] StatusError),
}

/// Retrying HTTP client for the daemon's notification endpoints.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    base: String,
    policy: RetryPolicy,
}

impl Notifier {
    /// `addr` is either `host:port` or a full `http://` URL.
    pub fn new(addr: &str, policy: RetryPolicy) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        Ok(Self {
            client,
            base,
            policy,
        })
    }

    pub async fn notify_start(&self, id: &str, status: &StartStatus) -> Result<(), NotifyError> {
        self.post(&start_path(id), status).await
    }

    pub async fn notify_stop(&self, id: &str, status: &StopStatus) -> Result<(), NotifyError> {
        self.post(&stop_path(id), status).await
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), NotifyError> {
        let url = format!("{}{}", self.base, path);
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self.try_post(&url, body).await {
                Ok(()) => {
                    if attempt > 1 {
                        log::info!("POST {url} delivered on attempt {attempt}");
                    }
                    return Ok(());
                }
                Err(e @ NotifyError::Rejected { .. }) => return Err(e),
                Err(e) => e,
            };
            if attempt >= attempts {
                return Err(NotifyError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }
            log::warn!("POST {url} attempt {attempt}/{attempts} failed: {err}");
            tokio::time::sleep(self.policy.delay).await;
            attempt += 1;
        }
    }

    async fn try_post<T: Serialize>(&self, url: &str, body: &T) -> Result<(), NotifyError> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(NotifyError::Unavailable {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Durable-then-deliver reporting for one container.
#[derive(Debug, Clone)]
pub struct Reporter {
    id: String,
    store: StatusStore,
    notifier: Notifier,
}

impl Reporter {
    pub fn new(id: impl Into<String>, store: StatusStore, notifier: Notifier) -> Self {
        Self {
            id: id.into(),
            store,
            notifier,
        }
    }

    pub fn record_start(&self, status: &StartStatus) -> Result<(), NotifyError> {
        self.store.write_start(status)?;
        Ok(())
    }

    pub async fn send_start(&self, status: &StartStatus) -> Result<(), NotifyError> {
        self.notifier.notify_start(&self.id, status).await
    }

    pub async fn report_start(&self, status: &StartStatus) -> Result<(), NotifyError> {
        self.record_start(status)?;
        self.send_start(status).await
    }

    pub fn record_stop(&self, status: &StopStatus) -> Result<(), NotifyError> {
        self.store.write_stop(status)?;
        Ok(())
    }

    pub async fn send_stop(&self, status: &StopStatus) -> Result<(), NotifyError> {
        self.notifier.notify_stop(&self.id, status).await
    }

    pub async fn report_stop(&self, status: &StopStatus) -> Result<(), NotifyError> {
        self.record_stop(status)?;
        self.send_stop(status).await
    }
}
