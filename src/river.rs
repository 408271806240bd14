//! The River: a polling consumer that turns queue messages into batched
//! DAO writes, webhook deliveries and index maintenance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RiverConfig;
use crate::dao::Dao;
use crate::delivery::WebhookDelivery;
use crate::error::RiverResult;
use crate::health::HealthCheck;
use crate::indexing::IndexMaintenance;
use crate::message::{Mutation, MutationKind, RiverMessage, TypeRegistry};
use crate::queue::MessageSource;
use crate::telemetry::{metric_add, metric_inc};
use crate::types::{new_id, now_millis, ParaObject};

/// Objects waiting to be written for one tenant.
#[derive(Debug, Default)]
pub struct AppBatch {
    pub create: Vec<ParaObject>,
    pub update: Vec<ParaObject>,
    pub delete: Vec<ParaObject>,
}

impl AppBatch {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Per-cycle batches, grouped by appid.
#[derive(Debug, Default)]
pub struct Batches {
    apps: BTreeMap<String, AppBatch>,
}

impl Batches {
    pub fn is_empty(&self) -> bool {
        self.apps.values().all(AppBatch::is_empty)
    }

    pub fn app(&self, appid: &str) -> Option<&AppBatch> {
        self.apps.get(appid)
    }

    fn entry(&mut self, appid: &str) -> &mut AppBatch {
        self.apps.entry(appid.to_string()).or_default()
    }
}

/// Where a single message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Dropped,
    Create,
    Update,
    Delete,
    /// Handed to webhook delivery; carries the processed count.
    Webhook(usize),
    /// Handed to index maintenance; carries the processed count.
    Index(usize),
}

/// How a cycle counts towards idle backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Something was batched or a control message was handled.
    Work,
    /// Nothing was pulled.
    Idle,
    /// Messages were pulled but all of them were dropped.
    DroppedOnly,
}

/// What one polling cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub pulled: usize,
    /// Control messages handled inline.
    pub processed: usize,
    /// Objects placed in create/update/delete batches.
    pub batched: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl CycleReport {
    pub fn had_work(&self) -> bool {
        self.processed > 0 || self.batched > 0
    }

    pub fn activity(&self) -> Activity {
        if self.had_work() {
            Activity::Work
        } else if self.pulled == 0 {
            Activity::Idle
        } else {
            Activity::DroppedOnly
        }
    }
}

/// Counts consecutive idle cycles and says when to back off.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    idle_cycles: u32,
    threshold: u32,
}

impl IdleBackoff {
    pub fn new(threshold: u32) -> Self {
        Self {
            idle_cycles: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record a cycle. Returns true when the loop should sleep before the
    /// next poll. A cycle that only dropped messages leaves the count alone.
    pub fn record(&mut self, activity: Activity) -> bool {
        match activity {
            Activity::Work => {
                self.idle_cycles = 0;
                false
            }
            Activity::DroppedOnly => false,
            Activity::Idle => {
                self.idle_cycles = self.idle_cycles.saturating_add(1);
                self.idle_cycles >= self.threshold
            }
        }
    }

    pub fn idle_cycles(&self) -> u32 {
        self.idle_cycles
    }
}

pub struct River {
    config: Arc<RiverConfig>,
    source: Arc<dyn MessageSource>,
    registry: TypeRegistry,
    dao: Arc<dyn Dao>,
    health: Arc<dyn HealthCheck>,
    delivery: Arc<WebhookDelivery>,
    indexing: Arc<IndexMaintenance>,
    shutdown: CancellationToken,
}

impl River {
    pub fn new(
        config: Arc<RiverConfig>,
        source: Arc<dyn MessageSource>,
        dao: Arc<dyn Dao>,
        health: Arc<dyn HealthCheck>,
        delivery: Arc<WebhookDelivery>,
        indexing: Arc<IndexMaintenance>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            registry: TypeRegistry::new(),
            dao,
            health,
            delivery,
            indexing,
            shutdown,
        }
    }

    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Poll until the shutdown token fires.
    pub async fn run(&self) {
        info!(max_messages = self.config.max_messages_per_pull, "river started");
        let mut backoff = IdleBackoff::new(self.config.idle_cycles_before_sleep);

        while !self.shutdown.is_cancelled() {
            let report = self.run_once().await;
            if backoff.record(report.activity()) {
                debug!(
                    idle_cycles = backoff.idle_cycles(),
                    sleep_ms = self.config.polling_sleep.as_millis() as u64,
                    "river idle, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.config.polling_sleep) => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
        }

        info!("river stopped");
    }

    /// One poll-classify-flush cycle.
    pub async fn run_once(&self) -> CycleReport {
        let messages = if self.health.is_healthy() {
            match self.source.pull_messages().await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "failed to pull messages");
                    Vec::new()
                }
            }
        } else {
            debug!("backing services unhealthy, skipping pull");
            Vec::new()
        };

        let mut report = CycleReport {
            pulled: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return report;
        }
        metric_add("river.messages.pulled", messages.len() as u64);

        let mut batches = Batches::default();
        for raw in &messages {
            match self.parse_and_categorize_message(raw, &mut batches).await {
                Ok(Placement::Webhook(n)) | Ok(Placement::Index(n)) => report.processed += n,
                Ok(Placement::Dropped) => metric_inc("river.messages.dropped"),
                Ok(Placement::Create) | Ok(Placement::Update) | Ok(Placement::Delete) => report.batched += 1,
                Err(e) => {
                    error!(error = %e, "batch processing operation failed");
                }
            }
        }

        if !batches.is_empty() || report.processed > 0 {
            let (created, updated, deleted) = self.flush(batches).await;
            report.created = created;
            report.updated = updated;
            report.deleted = deleted;
        }
        report
    }

    /// Classify one raw message, appending mutations to `batches` and
    /// running control messages inline.
    pub async fn parse_and_categorize_message(
        &self,
        raw: &str,
        batches: &mut Batches,
    ) -> RiverResult<Placement> {
        let Some(message) = RiverMessage::decode(raw, &self.registry) else {
            debug!("dropping unrecognized message");
            return Ok(Placement::Dropped);
        };

        match message {
            RiverMessage::WebhookPayload(payload) => {
                Ok(Placement::Webhook(self.delivery.process_webhook_payload(&payload).await))
            }
            RiverMessage::IndexPayload(payload) => {
                Ok(Placement::Index(self.indexing.process_index_payload(&payload).await))
            }
            RiverMessage::Mutation(mutation) => self.categorize_mutation(mutation, batches).await,
        }
    }

    async fn categorize_mutation(&self, mutation: Mutation, batches: &mut Batches) -> RiverResult<Placement> {
        let Mutation {
            kind,
            appid,
            object_type,
            id,
            fields,
        } = mutation;

        match (kind, id) {
            (MutationKind::Delete, Some(id)) => {
                let stub = ParaObject::new(object_type).with_id(id).with_appid(appid.as_str());
                batches.entry(&appid).delete.push(stub);
                Ok(Placement::Delete)
            }
            (MutationKind::Update, Some(id)) => {
                let Some(mut object) = self.dao.read(&appid, &id).await? else {
                    debug!(appid = %appid, id = %id, "dropping update for missing object");
                    return Ok(Placement::Dropped);
                };
                object.merge_fields(&fields)?;
                object.updated = Some(now_millis());
                batches.entry(&appid).update.push(object);
                Ok(Placement::Update)
            }
            (_, id) => {
                let mut object = ParaObject::from_fields(&fields)?;
                object.object_type = object_type;
                object.appid = appid.clone();
                object.id = id.unwrap_or_else(new_id);
                let now = now_millis();
                object.timestamp.get_or_insert(now);
                object.updated = Some(now);
                batches.entry(&appid).create.push(object);
                Ok(Placement::Create)
            }
        }
    }

    async fn flush(&self, batches: Batches) -> (usize, usize, usize) {
        let (mut created, mut updated, mut deleted) = (0, 0, 0);

        for (appid, batch) in batches.apps {
            if !batch.create.is_empty() {
                let n = batch.create.len();
                match self.dao.create_all(&appid, batch.create).await {
                    Ok(()) => created += n,
                    Err(e) => error!(appid = %appid, count = n, error = %e, "createAll failed"),
                }
            }
            if !batch.update.is_empty() {
                let n = batch.update.len();
                match self.dao.update_all(&appid, batch.update).await {
                    Ok(()) => updated += n,
                    Err(e) => error!(appid = %appid, count = n, error = %e, "updateAll failed"),
                }
            }
            if !batch.delete.is_empty() {
                let n = batch.delete.len();
                match self.dao.delete_all(&appid, batch.delete).await {
                    Ok(()) => deleted += n,
                    Err(e) => error!(appid = %appid, count = n, error = %e, "deleteAll failed"),
                }
            }
        }

        metric_add("river.objects.flushed", (created + updated + deleted) as u64);
        if created + updated + deleted > 0 {
            debug!(created, updated, deleted, "batches flushed");
        }
        (created, updated, deleted)
    }
}

/// Runs a [`River`] on the runtime and restarts it if it panics.
pub struct RiverHandle {
    river: Arc<River>,
    running: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl RiverHandle {
    /// Spawn the River under supervision.
    ///
    /// Stopping cancels the River's shutdown token for good, so a River
    /// that was stopped cannot be started again; build a new one with a
    /// fresh token. Such a handle comes back not running.
    pub fn start(river: Arc<River>) -> Self {
        if river.shutdown_token().is_cancelled() {
            warn!("river was already shut down, not starting it");
            return Self {
                river,
                running: Arc::new(AtomicBool::new(false)),
                supervisor: None,
            };
        }
        let running = Arc::new(AtomicBool::new(true));
        let supervisor = tokio::spawn(supervise(river.clone(), running.clone()));
        Self {
            river,
            running,
            supervisor: Some(supervisor),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel the River and wait for it to wind down.
    pub async fn stop(&mut self) {
        self.river.shutdown_token().cancel();
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn supervise(river: Arc<River>, running: Arc<AtomicBool>) {
    let shutdown = river.shutdown_token().clone();
    let restart_delay = river.config.restart_delay;

    loop {
        let task = {
            let river = river.clone();
            tokio::spawn(async move { river.run().await })
        };

        match task.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                metric_inc("river.restarted");
                error!(
                    restart_delay_ms = restart_delay.as_millis() as u64,
                    "river task panicked, restarting"
                );
            }
            Err(e) => {
                warn!(error = %e, "river task aborted");
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    running.store(false, Ordering::SeqCst);
}
