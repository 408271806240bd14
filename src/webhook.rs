//! Webhook payload construction and subscription matching.
//!
//! Mutations are matched against the active webhook subscriptions of a
//! tenant. Every match produces a signed payload message that is pushed to
//! the queue, where a River picks it up and delivers it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::RiverConfig;
use crate::error::RiverResult;
use crate::message::WebhookPayload;
use crate::queue::Queue;
use crate::search::Search;
use crate::signing::{compute_signature, SignatureEncoding};
use crate::telemetry::metric_inc;
use crate::types::{now_millis, DaoMethod, Pager, ParaObject, Webhook, WEBHOOK_TYPE};

/// Build the queue message announcing `event` on `items` to `webhook`.
///
/// The inner payload `{timestamp, appid, event, items}` is serialized once;
/// the signature covers exactly those bytes and the string travels verbatim
/// inside the envelope. Returns an empty string when nothing should be
/// enqueued.
pub fn build_webhook_payload(
    appid: &str,
    items: &[ParaObject],
    event: &str,
    webhook: &Webhook,
    encoding: SignatureEncoding,
) -> String {
    let values: Vec<Value> = items.iter().map(ParaObject::to_value).collect();
    build_payload_from_values(appid, values, event, webhook, encoding)
}

fn build_payload_from_values(
    appid: &str,
    items: Vec<Value>,
    event: &str,
    webhook: &Webhook,
    encoding: SignatureEncoding,
) -> String {
    if webhook.id.trim().is_empty() || webhook.target_url.trim().is_empty() {
        return String::new();
    }

    let inner = json!({
        "timestamp": now_millis(),
        "appid": appid,
        "event": event,
        "items": items,
    });
    let payload = match serde_json::to_string(&inner) {
        Ok(payload) => payload,
        Err(e) => {
            error!(appid, webhook_id = %webhook.id, error = %e, "failed to serialize webhook payload");
            return String::new();
        }
    };

    let signature = compute_signature(webhook.secret.as_bytes(), payload.as_bytes(), encoding);
    let envelope = WebhookPayload {
        appid: appid.to_string(),
        webhook_id: Some(webhook.id.clone()),
        target_url: webhook.target_url.clone(),
        url_encoded: webhook.url_encoded,
        event: event.to_string(),
        signature,
        payload,
    };

    match serde_json::to_string(&envelope.to_value()) {
        Ok(message) => message,
        Err(e) => {
            error!(appid, webhook_id = %webhook.id, error = %e, "failed to serialize webhook envelope");
            String::new()
        }
    }
}

/// Listens to DAO mutations and enqueues payloads for matching webhooks.
pub struct WebhookNotifier {
    search: Arc<dyn Search>,
    queue: Arc<dyn Queue>,
    config: Arc<RiverConfig>,
}

impl WebhookNotifier {
    pub fn new(search: Arc<dyn Search>, queue: Arc<dyn Queue>, config: Arc<RiverConfig>) -> Self {
        Self {
            search,
            queue,
            config,
        }
    }

    /// Fire-and-forget variant of [`notify_mutation`](Self::notify_mutation).
    pub fn on_mutation(
        self: &Arc<Self>,
        appid: impl Into<String>,
        method: DaoMethod,
        objects: Vec<ParaObject>,
    ) -> JoinHandle<usize> {
        let notifier = Arc::clone(self);
        let appid = appid.into();
        tokio::spawn(async move {
            match notifier.notify_mutation(&appid, method, &objects).await {
                Ok(enqueued) => enqueued,
                Err(e) => {
                    warn!(appid = %appid, method = method.as_str(), error = %e, "webhook notification failed");
                    0
                }
            }
        })
    }

    /// Enqueue one payload per matching webhook. Returns how many were
    /// enqueued.
    pub async fn notify_mutation(
        &self,
        appid: &str,
        method: DaoMethod,
        objects: &[ParaObject],
    ) -> RiverResult<usize> {
        if !self.config.webhooks_enabled {
            return Ok(0);
        }
        let objects: Vec<&ParaObject> = objects
            .iter()
            .filter(|object| object.object_type != WEBHOOK_TYPE)
            .collect();
        if objects.is_empty() {
            return Ok(0);
        }

        let mut terms = HashMap::new();
        terms.insert(method.as_str().to_string(), Value::Bool(true));
        terms.insert("active".to_string(), Value::Bool(true));

        let mut enqueued = 0;
        for webhook in self.subscribers(appid, &terms).await? {
            let items: Vec<ParaObject> = objects
                .iter()
                .filter(|object| webhook.matches_type(&object.object_type))
                .map(|object| (*object).clone())
                .collect();
            if items.is_empty() {
                continue;
            }
            let message = build_webhook_payload(
                appid,
                &items,
                method.as_str(),
                &webhook,
                self.config.signature_encoding,
            );
            if self.enqueue(message).await? {
                enqueued += 1;
            }
        }

        debug!(appid, method = method.as_str(), enqueued, "webhook payloads enqueued");
        Ok(enqueued)
    }

    /// Announce an application-defined event to every active webhook
    /// listening for it.
    pub async fn post_custom_event(&self, appid: &str, event: &str, payload: Value) -> RiverResult<usize> {
        if !self.config.webhooks_enabled || event.trim().is_empty() {
            return Ok(0);
        }

        let mut terms = HashMap::new();
        terms.insert("active".to_string(), Value::Bool(true));

        let items = match payload {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let mut enqueued = 0;
        for webhook in self.subscribers(appid, &terms).await? {
            if !webhook.custom_events.iter().any(|name| name == event) {
                continue;
            }
            let message = build_payload_from_values(
                appid,
                items.clone(),
                event,
                &webhook,
                self.config.signature_encoding,
            );
            if self.enqueue(message).await? {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    async fn subscribers(&self, appid: &str, terms: &HashMap<String, Value>) -> RiverResult<Vec<Webhook>> {
        let mut pager = Pager::new(self.config.webhook_page_size);
        let mut webhooks = Vec::new();
        loop {
            let page = self.search.find_terms(appid, WEBHOOK_TYPE, terms, &mut pager).await?;
            if page.is_empty() {
                break;
            }
            for object in &page {
                match Webhook::from_object(object) {
                    Ok(webhook) => webhooks.push(webhook),
                    Err(e) => warn!(appid, webhook_id = %object.id, error = %e, "skipping unreadable webhook"),
                }
            }
            pager.next_page();
        }
        Ok(webhooks)
    }

    async fn enqueue(&self, message: String) -> RiverResult<bool> {
        if message.is_empty() {
            return Ok(false);
        }
        self.queue.push(message).await?;
        metric_inc("river.webhook.enqueued");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RiverMessage, TypeRegistry};
    use crate::queue::LocalQueue;
    use crate::search::InMemorySearch;
    use crate::signing::verify_signature;

    fn hook(id: &str) -> Webhook {
        Webhook::new(id, "app1", "http://example.invalid/hook").with_secret("s3cret")
    }

    fn decode(message: &str) -> WebhookPayload {
        match RiverMessage::decode(message, &TypeRegistry::new()) {
            Some(RiverMessage::WebhookPayload(payload)) => payload,
            other => panic!("expected webhook payload, got {:?}", other),
        }
    }

    #[test]
    fn payload_is_signed_over_inner_json() {
        let object = ParaObject::new("sysprop").with_id("o1").with_appid("app1");
        let message = build_webhook_payload("app1", &[object], "create", &hook("w1"), SignatureEncoding::Base64);

        let payload = decode(&message);
        assert_eq!(payload.webhook_id.as_deref(), Some("w1"));
        assert_eq!(payload.event, "create");
        assert!(verify_signature(
            b"s3cret",
            payload.payload.as_bytes(),
            &payload.signature,
            SignatureEncoding::Base64
        ));

        let inner: Value = serde_json::from_str(&payload.payload).unwrap();
        assert_eq!(inner["appid"], "app1");
        assert_eq!(inner["event"], "create");
        assert_eq!(inner["items"][0]["id"], "o1");
        assert!(inner["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn hex_signatures_verify() {
        let message = build_webhook_payload("app1", &[], "update", &hook("w1"), SignatureEncoding::Hex);
        let payload = decode(&message);
        assert!(payload.signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(verify_signature(
            b"s3cret",
            payload.payload.as_bytes(),
            &payload.signature,
            SignatureEncoding::Hex
        ));
    }

    #[test]
    fn webhook_without_target_yields_nothing() {
        let webhook = Webhook::new("w1", "app1", "");
        assert!(build_webhook_payload("app1", &[], "create", &webhook, SignatureEncoding::Base64).is_empty());
    }

    struct Fixture {
        search: Arc<InMemorySearch>,
        queue: Arc<LocalQueue>,
        notifier: Arc<WebhookNotifier>,
    }

    fn fixture(page_size: usize) -> Fixture {
        let search = Arc::new(InMemorySearch::new());
        let queue = Arc::new(LocalQueue::new("river"));
        let config = Arc::new(RiverConfig {
            webhook_page_size: page_size,
            ..Default::default()
        });
        let notifier = Arc::new(WebhookNotifier::new(search.clone(), queue.clone(), config));
        Fixture { search, queue, notifier }
    }

    async fn subscribe(search: &InMemorySearch, webhook: Webhook) {
        search.index_all("app1", vec![webhook.to_object().unwrap()]).await.unwrap();
    }

    #[tokio::test]
    async fn matches_method_activity_and_type_filter() {
        let f = fixture(30);
        subscribe(&f.search, hook("all").on(DaoMethod::Create)).await;
        subscribe(&f.search, hook("users").on(DaoMethod::Create).with_type_filter("user")).await;
        subscribe(&f.search, hook("updates").on(DaoMethod::Update)).await;
        let mut inactive = hook("inactive").on(DaoMethod::Create);
        inactive.active = false;
        subscribe(&f.search, inactive).await;

        let objects = vec![ParaObject::new("sysprop").with_id("o1").with_appid("app1")];
        let enqueued = f.notifier.notify_mutation("app1", DaoMethod::Create, &objects).await.unwrap();
        assert_eq!(enqueued, 1);

        let payload = decode(&f.queue.pull().await.unwrap());
        assert_eq!(payload.webhook_id.as_deref(), Some("all"));
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn pages_through_all_subscriptions() {
        let f = fixture(2);
        for i in 0..5 {
            subscribe(&f.search, hook(&format!("w{}", i)).on(DaoMethod::UpdateAll)).await;
        }
        let objects = vec![ParaObject::new("tag").with_id("t1").with_appid("app1")];
        let enqueued = f.notifier.notify_mutation("app1", DaoMethod::UpdateAll, &objects).await.unwrap();
        assert_eq!(enqueued, 5);
        assert_eq!(f.queue.len().await, 5);
    }

    #[tokio::test]
    async fn webhook_mutations_do_not_notify() {
        let f = fixture(30);
        subscribe(&f.search, hook("w1").on(DaoMethod::Create)).await;
        let objects = vec![hook("w2").to_object().unwrap()];
        let handle = f.notifier.on_mutation("app1", DaoMethod::Create, objects);
        assert_eq!(handle.await.unwrap(), 0);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn custom_events_reach_listeners_only() {
        let f = fixture(30);
        subscribe(&f.search, hook("listener").with_custom_event("order.shipped")).await;
        subscribe(&f.search, hook("other").with_custom_event("order.paid")).await;

        let enqueued = f
            .notifier
            .post_custom_event("app1", "order.shipped", json!({"order": 42}))
            .await
            .unwrap();
        assert_eq!(enqueued, 1);

        let payload = decode(&f.queue.pull().await.unwrap());
        assert_eq!(payload.webhook_id.as_deref(), Some("listener"));
        let inner: Value = serde_json::from_str(&payload.payload).unwrap();
        assert_eq!(inner["items"][0]["order"], 42);
    }
}
