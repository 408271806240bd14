use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::dao::Dao;
use crate::error::RiverResult;
use crate::types::{AppDescriptor, Pager, ParaObject};

/// Tenant-scoped search index.
#[async_trait]
pub trait Search: Send + Sync {
    async fn index_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()>;

    async fn unindex_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()>;

    async fn find_by_id(&self, appid: &str, id: &str) -> RiverResult<Option<ParaObject>>;

    /// Objects of `object_type` whose fields equal every given term.
    /// Fills `pager.count` with the total number of hits.
    async fn find_terms(
        &self,
        appid: &str,
        object_type: &str,
        terms: &HashMap<String, Value>,
        pager: &mut Pager,
    ) -> RiverResult<Vec<ParaObject>>;

    /// Drop the app's index and re-index everything the DAO holds for it.
    async fn rebuild_index(&self, dao: &dyn Dao, app: &AppDescriptor) -> RiverResult<()>;

    async fn create_index(&self, app: &AppDescriptor) -> RiverResult<()>;

    async fn delete_index(&self, app: &AppDescriptor) -> RiverResult<()>;
}

/// In-memory index keyed by appid, then object id.
#[derive(Default)]
pub struct InMemorySearch {
    indexes: RwLock<HashMap<String, BTreeMap<String, ParaObject>>>,
    index_all_calls: AtomicUsize,
}

const REBUILD_PAGE_SIZE: usize = 100;

impl InMemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_index(&self, appid: &str) -> bool {
        self.indexes.read().await.contains_key(appid)
    }

    pub async fn indexed_ids(&self, appid: &str) -> Vec<String> {
        let guard = self.indexes.read().await;
        guard
            .get(appid)
            .map(|index| index.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn index_all_calls(&self) -> usize {
        self.index_all_calls.load(Ordering::SeqCst)
    }
}

fn matches_terms(object: &ParaObject, object_type: &str, terms: &HashMap<String, Value>) -> bool {
    if !object_type.is_empty() && object.object_type != object_type {
        return false;
    }
    let Value::Object(fields) = object.to_value() else {
        return false;
    };
    terms.iter().all(|(key, expected)| fields.get(key) == Some(expected))
}

#[async_trait]
impl Search for InMemorySearch {
    async fn index_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        self.index_all_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.indexes.write().await;
        let index = guard.entry(appid.to_string()).or_default();
        for object in objects {
            if !object.id.is_empty() {
                index.insert(object.id.clone(), object);
            }
        }
        Ok(())
    }

    async fn unindex_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        let mut guard = self.indexes.write().await;
        if let Some(index) = guard.get_mut(appid) {
            for object in objects {
                index.remove(&object.id);
            }
        }
        Ok(())
    }

    async fn find_by_id(&self, appid: &str, id: &str) -> RiverResult<Option<ParaObject>> {
        let guard = self.indexes.read().await;
        Ok(guard.get(appid).and_then(|index| index.get(id)).cloned())
    }

    async fn find_terms(
        &self,
        appid: &str,
        object_type: &str,
        terms: &HashMap<String, Value>,
        pager: &mut Pager,
    ) -> RiverResult<Vec<ParaObject>> {
        let guard = self.indexes.read().await;
        let Some(index) = guard.get(appid) else {
            pager.count = 0;
            return Ok(Vec::new());
        };
        let hits: Vec<&ParaObject> = index
            .values()
            .filter(|object| matches_terms(object, object_type, terms))
            .collect();
        pager.count = hits.len() as u64;
        Ok(hits
            .into_iter()
            .skip(pager.offset())
            .take(pager.limit)
            .cloned()
            .collect())
    }

    async fn rebuild_index(&self, dao: &dyn Dao, app: &AppDescriptor) -> RiverResult<()> {
        let mut rebuilt = BTreeMap::new();
        let mut pager = Pager::new(REBUILD_PAGE_SIZE);
        loop {
            let page = dao.read_page(&app.appid, &mut pager).await?;
            if page.is_empty() {
                break;
            }
            for object in page {
                rebuilt.insert(object.id.clone(), object);
            }
            pager.next_page();
        }

        let mut guard = self.indexes.write().await;
        guard.insert(app.appid.clone(), rebuilt);
        Ok(())
    }

    async fn create_index(&self, app: &AppDescriptor) -> RiverResult<()> {
        let mut guard = self.indexes.write().await;
        guard.entry(app.appid.clone()).or_default();
        Ok(())
    }

    async fn delete_index(&self, app: &AppDescriptor) -> RiverResult<()> {
        self.indexes.write().await.remove(&app.appid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::InMemoryDao;
    use serde_json::json;

    #[tokio::test]
    async fn find_terms_matches_all_terms() {
        let search = InMemorySearch::new();
        search
            .index_all(
                "app1",
                vec![
                    ParaObject::new("webhook").with_id("w1").with_property("create", json!(true)),
                    ParaObject::new("webhook").with_id("w2").with_property("create", json!(false)),
                    ParaObject::new("sysprop").with_id("s1").with_property("create", json!(true)),
                ],
            )
            .await
            .unwrap();

        let mut terms = HashMap::new();
        terms.insert("create".to_string(), json!(true));
        let mut pager = Pager::new(10);
        let hits = search.find_terms("app1", "webhook", &terms, &mut pager).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "w1");
        assert_eq!(pager.count, 1);
    }

    #[tokio::test]
    async fn rebuild_replaces_index_from_dao() {
        let dao = InMemoryDao::new();
        dao.insert(ParaObject::new("sysprop").with_id("a").with_appid("app1")).await;
        dao.insert(ParaObject::new("sysprop").with_id("b").with_appid("app1")).await;

        let search = InMemorySearch::new();
        search
            .index_all("app1", vec![ParaObject::new("sysprop").with_id("stale")])
            .await
            .unwrap();

        search.rebuild_index(&dao, &AppDescriptor::new("app1")).await.unwrap();
        assert_eq!(search.indexed_ids("app1").await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn create_and_delete_index() {
        let search = InMemorySearch::new();
        let app = AppDescriptor::new("app9");
        search.create_index(&app).await.unwrap();
        assert!(search.has_index("app9").await);
        search.delete_index(&app).await.unwrap();
        assert!(!search.has_index("app9").await);
    }
}
