//! Outbound webhook notifications
//!
//! Delivery is fire-and-forget: every failure (connect, timeout, non-2xx) is
//! logged and dropped, nothing is retried inline and nothing reaches the
//! caller. A job record per attempt can be kept for a later drainer.
use super::context::Context;
use super::store::{DocumentStore, Update};
use super::utils::{Clock, SystemClock};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_JOBS: &str = "webhook_jobs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub event_key: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSettings {
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub signature_header: String,
    pub record_deliveries: bool,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2_000),
            total_timeout: Duration::from_millis(4_000),
            signature_header: "X-Webhook-Signature".to_string(),
            record_deliveries: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub url: String,
    pub status: DeliveryStatus,
    pub http_status: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempts: Vec<DeliveryAttempt>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == DeliveryStatus::Sent)
            .count()
    }
}

/// Hex encoded HMAC-SHA256 of `body`.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// The JSON body every subscriber receives.
pub fn envelope(event_key: &str, payload: &Value, ctx: &Context, sent_at_millis: i64) -> Value {
    json!({
        "event": event_key,
        "payload": payload,
        "context": {
            "username": ctx.username,
            "tenant_id": ctx.tenant_id,
            "period_id": ctx.period_id,
            "session_id": ctx.session_id,
        },
        "sent_at": sent_at_millis,
    })
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    subscriptions: Arc<Vec<WebhookSubscription>>,
    settings: WebhookSettings,
    agent: ureq::Agent,
    clock: Arc<dyn Clock>,
    jobs: Option<Arc<dyn DocumentStore>>,
}

impl WebhookDispatcher {
    pub fn new(subscriptions: Vec<WebhookSubscription>, settings: WebhookSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_connect(Some(settings.connect_timeout))
            .timeout_global(Some(settings.total_timeout))
            .build();

        Self {
            subscriptions: Arc::new(subscriptions),
            settings,
            agent: ureq::Agent::new_with_config(config),
            clock: Arc::new(SystemClock),
            jobs: None,
        }
    }
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    /// Where delivery job records go when `record_deliveries` is on.
    pub fn with_job_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.jobs = Some(store);
        self
    }

    pub fn subscriptions_for(&self, event_key: &str) -> Vec<&WebhookSubscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.active && s.event_key == event_key && !s.url.trim().is_empty())
            .collect()
    }

    fn post(&self, sub: &WebhookSubscription, body: &str) -> Result<u16, String> {
        let mut request = self
            .agent
            .post(sub.url.trim())
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", sub.event_key.as_str());

        if let Some(secret) = sub.secret.as_deref().filter(|s| !s.is_empty()) {
            if let Some(signature) = sign(secret, body.as_bytes()) {
                let value = format!("sha256={signature}");
                request = request.header(self.settings.signature_header.as_str(), value.as_str());
            }
        }

        let response = request.send(body).map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }

    // job bookkeeping never affects delivery, failures are only logged
    fn open_job(&self, event_key: &str, payload: &Value, url: &str) -> Option<String> {
        if !self.settings.record_deliveries {
            return None;
        }
        let store = self.jobs.as_ref()?;
        let job = json!({
            "event": event_key,
            "event_id": payload.get("event_id"),
            "target_url": url,
            "status": DeliveryStatus::Pending,
            "retry_count": 0,
            "last_error": null,
            "created_at": self.clock.now().timestamp_millis(),
        });
        match store.insert(WEBHOOK_JOBS, job) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(error = %err, "webhook job record not written");
                None
            }
        }
    }

    fn close_job(&self, job_id: Option<String>, attempt: &DeliveryAttempt) {
        let (Some(job_id), Some(store)) = (job_id, self.jobs.as_ref()) else {
            return;
        };
        let update = Update::new()
            .set("status", json!(attempt.status))
            .set("last_error", json!(attempt.error))
            .set("updated_at", json!(self.clock.now().timestamp_millis()));
        if let Err(err) = store.update_by_id(WEBHOOK_JOBS, &job_id, &update) {
            tracing::warn!(job_id = %job_id, error = %err, "webhook job record not updated");
        }
    }

    /// Posts to every active subscriber of `event_key`, blocking at most the
    /// configured timeouts per subscriber. Never fails.
    pub fn dispatch(&self, event_key: &str, payload: &Value, ctx: &Context) -> DispatchReport {
        let subscribers = self.subscriptions_for(event_key);
        if subscribers.is_empty() {
            return DispatchReport::default();
        }

        let body = envelope(
            event_key,
            payload,
            &ctx.normalized(),
            self.clock.now().timestamp_millis(),
        )
        .to_string();

        let mut report = DispatchReport::default();
        for sub in subscribers {
            let job_id = self.open_job(event_key, payload, &sub.url);
            let attempt = match self.post(sub, &body) {
                Ok(code) => DeliveryAttempt {
                    url: sub.url.clone(),
                    status: DeliveryStatus::Sent,
                    http_status: Some(code),
                    error: None,
                },
                Err(error) => {
                    tracing::warn!(event_key, url = %sub.url, error = %error, "webhook delivery failed");
                    DeliveryAttempt {
                        url: sub.url.clone(),
                        status: DeliveryStatus::Fail,
                        http_status: None,
                        error: Some(error),
                    }
                }
            };
            self.close_job(job_id, &attempt);
            report.attempts.push(attempt);
        }

        tracing::info!(
            event_key,
            subscribers = report.attempts.len(),
            delivered = report.delivered(),
            "webhooks dispatched"
        );
        report
    }

    /// Same as `dispatch` on a detached thread. Dropping the handle is fine,
    /// the delivery carries on and its outcome is discarded. One thread per
    /// call, unbounded.
    pub fn spawn_dispatch(
        &self,
        event_key: &str,
        payload: Value,
        ctx: &Context,
    ) -> Option<JoinHandle<DispatchReport>> {
        if self.subscriptions_for(event_key).is_empty() {
            return None;
        }
        let dispatcher = self.clone();
        let event_key = event_key.to_string();
        let ctx = ctx.clone();

        match std::thread::Builder::new()
            .name("webhook-dispatch".to_string())
            .spawn(move || dispatcher.dispatch(&event_key, &payload, &ctx))
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "could not start webhook dispatch thread");
                None
            }
        }
    }
}
