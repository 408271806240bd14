use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::RiverConfig;
use crate::dao::Dao;
use crate::error::{DeliveryOutcome, FailureReason, RiverResult};
use crate::message::WebhookPayload;
use crate::signing::{EVENT_HEADER, SIGNATURE_HEADER};
use crate::telemetry::metric_inc;

/// Prefix of the per-webhook failure counter key.
pub const FAILED_WEBHOOK_COUNT_KEY: &str = "failed_webhook_count";
const KEY_SEPARATOR: &str = ":";

/// Where a webhook stands after a failed delivery was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureState {
    Counting(u32),
    Deactivated,
}

/// Counts consecutive delivery failures per webhook and switches the
/// webhook off once the limit is reached.
///
/// Counters live only in the cache; an evicted counter starts over at zero.
/// A deactivated webhook stays off until someone re-enables it.
pub struct FailureTracker {
    cache: Arc<dyn Cache>,
    dao: Arc<dyn Dao>,
    max_failures: u32,
}

impl FailureTracker {
    pub fn new(cache: Arc<dyn Cache>, dao: Arc<dyn Dao>, max_failures: u32) -> Self {
        Self {
            cache,
            dao,
            max_failures: max_failures.max(1),
        }
    }

    pub fn counter_key(webhook_id: &str) -> String {
        format!("{}{}{}", FAILED_WEBHOOK_COUNT_KEY, KEY_SEPARATOR, webhook_id)
    }

    pub async fn failure_count(&self, appid: &str, webhook_id: &str) -> RiverResult<u32> {
        let value = self.cache.get(appid, &Self::counter_key(webhook_id)).await?;
        Ok(value
            .as_ref()
            .and_then(Value::as_u64)
            .map(|count| count as u32)
            .unwrap_or(0))
    }

    pub async fn record_failure(&self, appid: &str, webhook_id: &str) -> RiverResult<FailureState> {
        let key = Self::counter_key(webhook_id);
        let count = self.failure_count(appid, webhook_id).await?;

        if count + 1 >= self.max_failures {
            self.deactivate(appid, webhook_id).await?;
            self.cache.remove(appid, &key).await?;
            return Ok(FailureState::Deactivated);
        }

        self.cache.put(appid, &key, json!(count + 1)).await?;
        Ok(FailureState::Counting(count + 1))
    }

    /// Clear a non-zero counter after a clean delivery.
    pub async fn reset_if_failing(&self, appid: &str, webhook_id: &str) -> RiverResult<()> {
        if self.failure_count(appid, webhook_id).await? > 0 {
            self.cache.remove(appid, &Self::counter_key(webhook_id)).await?;
        }
        Ok(())
    }

    async fn deactivate(&self, appid: &str, webhook_id: &str) -> RiverResult<()> {
        let Some(mut webhook) = self.dao.read(appid, webhook_id).await? else {
            warn!(appid, webhook_id, "failing webhook no longer exists");
            return Ok(());
        };

        let mut fields = serde_json::Map::new();
        fields.insert("active".to_string(), Value::Bool(false));
        fields.insert("tooManyFailures".to_string(), Value::Bool(true));
        webhook.merge_fields(&fields)?;
        self.dao.update(appid, webhook).await?;

        metric_inc("river.webhook.deactivated");
        info!(
            appid,
            webhook_id,
            max_failures = self.max_failures,
            "webhook deactivated after too many failed deliveries"
        );
        Ok(())
    }
}

/// Delivers signed webhook payloads over HTTP.
pub struct WebhookDelivery {
    client: reqwest::Client,
    config: Arc<RiverConfig>,
    failures: FailureTracker,
}

impl WebhookDelivery {
    pub fn new(config: Arc<RiverConfig>, failures: FailureTracker) -> RiverResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.webhook_timeout)
            .timeout(config.webhook_timeout)
            .user_agent(config.user_agent())
            .build()?;
        Ok(Self {
            client,
            config,
            failures,
        })
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// Deliver one webhook message. Returns 1 when the delivery went out,
    /// 0 when it was skipped. Never fails: problems are logged and counted.
    pub async fn process_webhook_payload(&self, payload: &WebhookPayload) -> usize {
        if !self.config.webhooks_enabled
            || payload.target_url.trim().is_empty()
            || payload.payload.is_empty()
        {
            return 0;
        }
        let Some(webhook_id) = payload.webhook_id.as_deref() else {
            return 0;
        };

        let request = match self.build_request(payload) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    appid = %payload.appid,
                    webhook_id,
                    error = %e,
                    "failed to build webhook request"
                );
                return 0;
            }
        };

        let attempts = self.config.delivery_attempts();
        let requests: Vec<reqwest::Request> = (0..attempts)
            .filter_map(|_| request.try_clone())
            .collect();
        let outcomes = join_all(requests.into_iter().map(|r| self.send(r))).await;

        let mut failed = 0usize;
        for outcome in &outcomes {
            match outcome {
                DeliveryOutcome::Delivered => {
                    metric_inc("river.webhook.delivered");
                    debug!(appid = %payload.appid, webhook_id, "webhook delivered");
                }
                DeliveryOutcome::Failed(reason) => {
                    failed += 1;
                    metric_inc("river.webhook.failed");
                    warn!(
                        appid = %payload.appid,
                        webhook_id,
                        target = %payload.target_url,
                        reason = %reason,
                        "webhook delivery failed"
                    );
                    match self.failures.record_failure(&payload.appid, webhook_id).await {
                        Ok(FailureState::Deactivated) => break,
                        Ok(FailureState::Counting(_)) => {}
                        Err(e) => {
                            error!(appid = %payload.appid, webhook_id, error = %e, "failed to record webhook failure");
                        }
                    }
                }
            }
        }

        // A fully successful round closes out earlier failures; a mixed
        // round leaves the counter alone.
        if failed == 0 && !outcomes.is_empty() {
            if let Err(e) = self.failures.reset_if_failing(&payload.appid, webhook_id).await {
                error!(appid = %payload.appid, webhook_id, error = %e, "failed to reset webhook failures");
            }
        }
        1
    }

    fn build_request(&self, payload: &WebhookPayload) -> RiverResult<reqwest::Request> {
        let (content_type, body) = if payload.url_encoded {
            (
                "application/x-www-form-urlencoded".to_string(),
                format!("payload={}", urlencoding::encode(&payload.payload)),
            )
        } else {
            (
                format!("application/json; charset={}", self.config.default_encoding),
                payload.payload.clone(),
            )
        };

        let request = self
            .client
            .post(payload.target_url.trim())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(SIGNATURE_HEADER, payload.signature.as_str())
            .header(EVENT_HEADER, payload.event.as_str())
            .header(reqwest::header::USER_AGENT, self.config.user_agent())
            .body(body)
            .build()?;
        Ok(request)
    }

    async fn send(&self, request: reqwest::Request) -> DeliveryOutcome {
        match self.client.execute(request).await {
            Ok(response) => {
                let status = response.status().as_u16();
                if self.config.success_range.is_success(status) {
                    DeliveryOutcome::Delivered
                } else {
                    DeliveryOutcome::Failed(FailureReason::Status(status))
                }
            }
            Err(err) if err.is_timeout() => DeliveryOutcome::Failed(FailureReason::Timeout),
            Err(_) => DeliveryOutcome::Failed(FailureReason::Network),
        }
    }
}
