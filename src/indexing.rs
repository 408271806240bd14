//! Index maintenance operations received over the queue.
//!
//! `index_all_op` may name objects this node cannot read yet (replication
//! lag). Whatever is readable is indexed at once; the rest is parked in
//! [`PendingIds`] and retried in the background a bounded number of times.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::RiverConfig;
use crate::dao::Dao;
use crate::error::{RiverError, RiverResult};
use crate::message::{IndexOp, IndexPayload};
use crate::queue::Queue;
use crate::search::Search;
use crate::telemetry::metric_inc;
use crate::types::ParaObject;

/// Ids waiting to become readable, mapped to their appid.
#[derive(Debug, Default)]
pub struct PendingIds {
    ids: DashMap<String, String>,
}

impl PendingIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, appid: &str, id: &str) {
        self.ids.insert(id.to_string(), appid.to_string());
    }

    pub fn remove(&self, id: &str) {
        self.ids.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn still_pending(&self, ids: &[String]) -> Vec<String> {
        ids.iter().filter(|id| self.contains(id)).cloned().collect()
    }
}

/// What an `index_all` call did right away.
#[derive(Debug)]
pub struct IndexAllReport {
    pub indexed: usize,
    pub pending: Vec<String>,
    /// Background retry, present when anything was left pending.
    pub retry: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct RetryContext {
    dao: Arc<dyn Dao>,
    search: Arc<dyn Search>,
    pending: Arc<PendingIds>,
    max_retries: u32,
    base_delay: Duration,
    shutdown: CancellationToken,
}

/// Executes index maintenance operations against DAO and search.
pub struct IndexMaintenance {
    dao: Arc<dyn Dao>,
    search: Arc<dyn Search>,
    cache: Arc<dyn Cache>,
    retry: RetryContext,
}

impl IndexMaintenance {
    pub fn new(
        dao: Arc<dyn Dao>,
        search: Arc<dyn Search>,
        cache: Arc<dyn Cache>,
        pending: Arc<PendingIds>,
        config: &RiverConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let retry = RetryContext {
            dao: dao.clone(),
            search: search.clone(),
            pending,
            max_retries: config.max_indexing_retries,
            base_delay: config.index_retry_base_delay,
            shutdown,
        };
        Self {
            dao,
            search,
            cache,
            retry,
        }
    }

    pub fn pending(&self) -> &Arc<PendingIds> {
        &self.retry.pending
    }

    /// Run one index operation. Returns 1 when it ran, 0 when the operation
    /// was unknown or failed.
    pub async fn process_index_payload(&self, payload: &IndexPayload) -> usize {
        match self.apply(payload).await {
            Ok(processed) => processed,
            Err(e) => {
                error!(
                    appid = %payload.appid,
                    op = payload.op.op_name(),
                    error = %e,
                    "index operation failed"
                );
                0
            }
        }
    }

    async fn apply(&self, payload: &IndexPayload) -> RiverResult<usize> {
        let appid = payload.appid.as_str();
        if let IndexOp::IndexAll(ids) | IndexOp::UnindexAll(ids) = &payload.op {
            if ids.is_empty() {
                return Err(RiverError::InvalidPayload {
                    reason: format!("{} without ids", payload.op.op_name()),
                });
            }
        }
        match &payload.op {
            IndexOp::IndexAll(ids) => {
                self.index_all(appid, ids).await?;
            }
            IndexOp::UnindexAll(ids) => {
                let stubs = ids
                    .iter()
                    .map(|id| ParaObject::default().with_id(id.clone()).with_appid(appid))
                    .collect();
                self.search.unindex_all(appid, stubs).await?;
            }
            IndexOp::RebuildIndex(app) => {
                self.search.rebuild_index(self.dao.as_ref(), app).await?;
                info!(appid = %app.appid, "index rebuilt");
            }
            IndexOp::CreateIndex(app) => {
                self.search.create_index(app).await?;
            }
            IndexOp::DeleteIndex(app) => {
                self.search.delete_index(app).await?;
            }
            IndexOp::Unknown(op) => {
                debug!(appid, op = %op, "ignoring unknown index operation");
                return Ok(0);
            }
        }
        Ok(1)
    }

    /// Index the given ids, scheduling a retry for those not readable yet.
    pub async fn index_all(&self, appid: &str, ids: &[String]) -> RiverResult<IndexAllReport> {
        if ids.is_empty() {
            return Ok(IndexAllReport {
                indexed: 0,
                pending: Vec::new(),
                retry: None,
            });
        }

        if let Err(e) = self.cache.remove_all(appid, ids).await {
            warn!(appid, error = %e, "failed to evict cached objects before indexing");
        }

        let found = self.dao.read_all(appid, ids).await?;
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains_key(*id))
            .cloned()
            .collect();

        let indexed = found.len();
        if indexed > 0 {
            self.search.index_all(appid, found.into_values().collect()).await?;
        }

        if missing.is_empty() {
            return Ok(IndexAllReport {
                indexed,
                pending: missing,
                retry: None,
            });
        }

        for id in &missing {
            self.retry.pending.insert(appid, id);
        }
        debug!(appid, pending = missing.len(), "objects not readable yet, scheduling index retry");

        let ctx = self.retry.clone();
        let task_appid = appid.to_string();
        let task_ids = missing.clone();
        let retry = tokio::spawn(async move {
            retry_pending(&ctx, &task_appid, &task_ids).await;
            for id in &task_ids {
                ctx.pending.remove(id);
            }
        });

        Ok(IndexAllReport {
            indexed,
            pending: missing,
            retry: Some(retry),
        })
    }
}

/// Linear backoff retry: round `i` waits `base_delay * (i + 1)`.
async fn retry_pending(ctx: &RetryContext, appid: &str, ids: &[String]) {
    for round in 0..ctx.max_retries {
        let delay = ctx.base_delay.saturating_mul(round + 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.shutdown.cancelled() => {
                info!(appid, "index retry interrupted");
                return;
            }
        }

        let still = ctx.pending.still_pending(ids);
        if still.is_empty() {
            return;
        }

        match ctx.dao.read_all(appid, &still).await {
            Ok(found) if !found.is_empty() => {
                let resolved: Vec<String> = found.keys().cloned().collect();
                match ctx.search.index_all(appid, found.into_values().collect()).await {
                    Ok(()) => {
                        for id in &resolved {
                            ctx.pending.remove(id);
                        }
                        debug!(appid, round, resolved = resolved.len(), "indexed late objects");
                    }
                    Err(e) => warn!(appid, round, error = %e, "index retry failed"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(appid, round, error = %e, "index retry read failed"),
        }

        if ctx.pending.still_pending(ids).is_empty() {
            return;
        }
    }

    let missing = ctx.pending.still_pending(ids);
    if !missing.is_empty() {
        metric_inc("river.index.retry_exhausted");
        warn!(
            appid,
            ids = ?missing,
            retries = ctx.max_retries,
            "giving up on indexing objects that never became readable"
        );
    }
}

/// Fan an index operation out to every River through the queue.
pub async fn push_index_op(queue: &dyn Queue, payload: &IndexPayload) -> RiverResult<()> {
    queue.push(payload.to_message()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::dao::InMemoryDao;
    use crate::queue::LocalQueue;
    use crate::search::InMemorySearch;
    use crate::types::AppDescriptor;

    struct Fixture {
        dao: Arc<InMemoryDao>,
        search: Arc<InMemorySearch>,
        shutdown: CancellationToken,
        maintenance: IndexMaintenance,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let dao = Arc::new(InMemoryDao::new());
        let search = Arc::new(InMemorySearch::new());
        let cache = Arc::new(InMemoryCache::new());
        let shutdown = CancellationToken::new();
        let config = RiverConfig {
            max_indexing_retries: max_retries,
            index_retry_base_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let maintenance = IndexMaintenance::new(
            dao.clone(),
            search.clone(),
            cache,
            Arc::new(PendingIds::new()),
            &config,
            shutdown.clone(),
        );
        Fixture {
            dao,
            search,
            shutdown,
            maintenance,
        }
    }

    fn obj(id: &str) -> ParaObject {
        ParaObject::new("sysprop").with_id(id).with_appid("app1")
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn late_objects_are_indexed_by_retry() {
        let f = fixture(5);
        f.dao.insert(obj("A")).await;
        f.dao.insert(obj("B")).await;

        let report = f.maintenance.index_all("app1", &ids(&["A", "B", "C"])).await.unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.pending, ids(&["C"]));
        assert_eq!(f.search.indexed_ids("app1").await, ids(&["A", "B"]));
        assert!(f.maintenance.pending().contains("C"));

        f.dao.insert(obj("C")).await;
        report.retry.unwrap().await.unwrap();

        assert_eq!(f.search.indexed_ids("app1").await, ids(&["A", "B", "C"]));
        assert!(f.maintenance.pending().is_empty());
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let f = fixture(2);
        f.dao.insert(obj("A")).await;

        let report = f.maintenance.index_all("app1", &ids(&["A", "C"])).await.unwrap();
        report.retry.unwrap().await.unwrap();

        assert_eq!(f.search.indexed_ids("app1").await, ids(&["A"]));
        assert!(!f.maintenance.pending().contains("C"));
    }

    #[tokio::test]
    async fn retry_stops_on_shutdown() {
        let f = fixture(5);
        let report = f.maintenance.index_all("app1", &ids(&["X"])).await.unwrap();
        f.shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), report.retry.unwrap())
            .await
            .expect("retry task should stop promptly")
            .unwrap();
        assert!(f.maintenance.pending().is_empty());
    }

    #[tokio::test]
    async fn all_readable_means_no_retry() {
        let f = fixture(5);
        f.dao.insert(obj("A")).await;
        let report = f.maintenance.index_all("app1", &ids(&["A"])).await.unwrap();
        assert!(report.retry.is_none());
        assert!(report.pending.is_empty());
    }

    #[tokio::test]
    async fn routes_operations() {
        let f = fixture(0);
        f.dao.insert(obj("A")).await;
        let app = AppDescriptor::new("app1");

        let create = IndexPayload::new("app1", IndexOp::CreateIndex(app.clone()));
        assert_eq!(f.maintenance.process_index_payload(&create).await, 1);
        assert!(f.search.has_index("app1").await);

        let rebuild = IndexPayload::new("app1", IndexOp::RebuildIndex(app.clone()));
        assert_eq!(f.maintenance.process_index_payload(&rebuild).await, 1);
        assert_eq!(f.search.indexed_ids("app1").await, ids(&["A"]));

        let unindex = IndexPayload::new("app1", IndexOp::UnindexAll(ids(&["A"])));
        assert_eq!(f.maintenance.process_index_payload(&unindex).await, 1);
        assert!(f.search.indexed_ids("app1").await.is_empty());

        let delete = IndexPayload::new("app1", IndexOp::DeleteIndex(app));
        assert_eq!(f.maintenance.process_index_payload(&delete).await, 1);
        assert!(!f.search.has_index("app1").await);

        let unknown = IndexPayload::new("app1", IndexOp::Unknown("reticulate".into()));
        assert_eq!(f.maintenance.process_index_payload(&unknown).await, 0);
    }

    #[tokio::test]
    async fn empty_id_lists_are_rejected() {
        let f = fixture(0);
        let index = IndexPayload::new("app1", IndexOp::IndexAll(Vec::new()));
        assert!(matches!(
            f.maintenance.apply(&index).await,
            Err(RiverError::InvalidPayload { .. })
        ));
        assert_eq!(f.maintenance.process_index_payload(&index).await, 0);

        let unindex = IndexPayload::new("app1", IndexOp::UnindexAll(Vec::new()));
        assert_eq!(f.maintenance.process_index_payload(&unindex).await, 0);
        assert_eq!(f.search.index_all_calls(), 0);
    }

    #[tokio::test]
    async fn index_ops_travel_over_the_queue() {
        let queue = LocalQueue::new("q");
        let payload = IndexPayload::new("app1", IndexOp::IndexAll(ids(&["A"])));
        push_index_op(&queue, &payload).await.unwrap();
        assert!(queue.pull().await.unwrap().contains("index_all_op"));
    }
}
