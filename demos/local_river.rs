use std::sync::Arc;
use std::time::Duration;

use para_river::{
    AlwaysHealthy, DaoMethod, FailureTracker, InMemoryCache, InMemoryDao, InMemorySearch, IndexMaintenance,
    LocalQueue, ParaObject, PendingIds, Queue, QueueSource, River, RiverConfig, RiverHandle, Search, Webhook,
    WebhookDelivery, WebhookNotifier,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,para_river=debug")))
        .init();

    let config = Arc::new(RiverConfig {
        polling_sleep: Duration::from_secs(1),
        ..RiverConfig::from_env()
    });
    let queue = Arc::new(LocalQueue::new("river"));
    let dao = Arc::new(InMemoryDao::new());
    let search = Arc::new(InMemorySearch::new());
    let cache = Arc::new(InMemoryCache::new());
    let shutdown = CancellationToken::new();

    let failures = FailureTracker::new(cache.clone(), dao.clone(), config.max_failed_webhook_attempts);
    let delivery = Arc::new(WebhookDelivery::new(config.clone(), failures)?);
    let indexing = Arc::new(IndexMaintenance::new(
        dao.clone(),
        search.clone(),
        cache,
        Arc::new(PendingIds::new()),
        &config,
        shutdown.clone(),
    ));
    let river = Arc::new(River::new(
        config.clone(),
        Arc::new(QueueSource::new(queue.clone(), config.max_messages_per_pull)),
        dao,
        Arc::new(AlwaysHealthy),
        delivery,
        indexing,
        shutdown,
    ));

    // Nothing listens on this port; the delivery failure shows up in the logs.
    let webhook = Webhook::new("w1", "app1", "http://127.0.0.1:9/hook")
        .with_secret("supersecret")
        .on(DaoMethod::Create);
    search.index_all("app1", vec![webhook.to_object()?]).await?;

    queue
        .push(r#"{"_appid":"app1","_type":"sysprop","name":"hello"}"#.to_string())
        .await?;

    let notifier = Arc::new(WebhookNotifier::new(search, queue.clone(), config));
    let created = ParaObject::new("sysprop").with_id("o1").with_appid("app1");
    notifier.on_mutation("app1", DaoMethod::Create, vec![created]).await?;

    let mut handle = RiverHandle::start(river);
    tokio::time::sleep(Duration::from_secs(3)).await;
    handle.stop().await;
    Ok(())
}
