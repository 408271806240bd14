use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::RiverResult;
use crate::types::{Pager, ParaObject};

/// Tenant-scoped object store.
#[async_trait]
pub trait Dao: Send + Sync {
    async fn read(&self, appid: &str, id: &str) -> RiverResult<Option<ParaObject>>;

    /// Read many objects at once. Ids that do not resolve are absent from
    /// the returned map.
    async fn read_all(&self, appid: &str, ids: &[String]) -> RiverResult<HashMap<String, ParaObject>>;

    async fn create_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()>;

    async fn update_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()>;

    async fn delete_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()>;

    async fn update(&self, appid: &str, object: ParaObject) -> RiverResult<()> {
        self.update_all(appid, vec![object]).await
    }

    /// One page of all objects of a tenant, ordered by id.
    async fn read_page(&self, appid: &str, pager: &mut Pager) -> RiverResult<Vec<ParaObject>>;
}

/// Counts of batch calls, used to observe how the River flushes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DaoCallStats {
    pub create_all: usize,
    pub update_all: usize,
    pub delete_all: usize,
}

/// In-memory DAO, partitioned by appid.
#[derive(Default)]
pub struct InMemoryDao {
    apps: RwLock<HashMap<String, HashMap<String, ParaObject>>>,
    create_all_calls: AtomicUsize,
    update_all_calls: AtomicUsize,
    delete_all_calls: AtomicUsize,
}

impl InMemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing call accounting.
    pub async fn insert(&self, object: ParaObject) {
        let mut guard = self.apps.write().await;
        guard
            .entry(object.appid.clone())
            .or_default()
            .insert(object.id.clone(), object);
    }

    pub async fn count(&self, appid: &str) -> usize {
        let guard = self.apps.read().await;
        guard.get(appid).map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn call_stats(&self) -> DaoCallStats {
        DaoCallStats {
            create_all: self.create_all_calls.load(Ordering::SeqCst),
            update_all: self.update_all_calls.load(Ordering::SeqCst),
            delete_all: self.delete_all_calls.load(Ordering::SeqCst),
        }
    }

    async fn upsert(&self, appid: &str, objects: Vec<ParaObject>) {
        let mut guard = self.apps.write().await;
        let app = guard.entry(appid.to_string()).or_default();
        for mut object in objects {
            if object.id.is_empty() {
                continue;
            }
            object.appid = appid.to_string();
            app.insert(object.id.clone(), object);
        }
    }
}

#[async_trait]
impl Dao for InMemoryDao {
    async fn read(&self, appid: &str, id: &str) -> RiverResult<Option<ParaObject>> {
        let guard = self.apps.read().await;
        Ok(guard.get(appid).and_then(|objects| objects.get(id)).cloned())
    }

    async fn read_all(&self, appid: &str, ids: &[String]) -> RiverResult<HashMap<String, ParaObject>> {
        let guard = self.apps.read().await;
        let Some(objects) = guard.get(appid) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| objects.get(id).map(|o| (id.clone(), o.clone())))
            .collect())
    }

    async fn create_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        self.create_all_calls.fetch_add(1, Ordering::SeqCst);
        self.upsert(appid, objects).await;
        Ok(())
    }

    async fn update_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        self.update_all_calls.fetch_add(1, Ordering::SeqCst);
        self.upsert(appid, objects).await;
        Ok(())
    }

    async fn delete_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        self.delete_all_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.apps.write().await;
        if let Some(app) = guard.get_mut(appid) {
            for object in objects {
                app.remove(&object.id);
            }
        }
        Ok(())
    }

    async fn read_page(&self, appid: &str, pager: &mut Pager) -> RiverResult<Vec<ParaObject>> {
        let guard = self.apps.read().await;
        let Some(objects) = guard.get(appid) else {
            pager.count = 0;
            return Ok(Vec::new());
        };
        let mut all: Vec<&ParaObject> = objects.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        pager.count = all.len() as u64;
        Ok(all
            .into_iter()
            .skip(pager.offset())
            .take(pager.limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn objects_are_isolated_per_tenant() {
        let dao = InMemoryDao::new();
        dao.create_all("app1", vec![ParaObject::new("sysprop").with_id("a")])
            .await
            .unwrap();

        assert!(dao.read("app1", "a").await.unwrap().is_some());
        assert!(dao.read("app2", "a").await.unwrap().is_none());
        assert_eq!(dao.read("app1", "a").await.unwrap().unwrap().appid, "app1");
    }

    #[tokio::test]
    async fn read_all_skips_missing_ids() {
        let dao = InMemoryDao::new();
        dao.insert(ParaObject::new("sysprop").with_id("a").with_appid("app1")).await;

        let found = dao
            .read_all("app1", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("a"));
    }

    #[tokio::test]
    async fn pages_through_objects() {
        let dao = InMemoryDao::new();
        for i in 0..5 {
            dao.insert(ParaObject::new("sysprop").with_id(format!("o{}", i)).with_appid("app1")).await;
        }

        let mut pager = Pager::new(2);
        let mut seen = 0;
        loop {
            let page = dao.read_page("app1", &mut pager).await.unwrap();
            if page.is_empty() {
                break;
            }
            seen += page.len();
            pager.next_page();
        }
        assert_eq!(seen, 5);
        assert_eq!(pager.count, 5);
    }
}
