#[cfg(feature = "postgres")]
use std::collections::HashMap;

#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio_postgres::Client;

#[cfg(feature = "postgres")]
use crate::dao::Dao;
#[cfg(feature = "postgres")]
use crate::error::{RiverError, RiverResult};
#[cfg(feature = "postgres")]
use crate::types::{Pager, ParaObject};

/// DAO storing objects as JSONB rows keyed by `(appid, id)`.
#[cfg(feature = "postgres")]
pub struct PostgresDao {
    client: Client,
}

#[cfg(feature = "postgres")]
fn dao_err(err: tokio_postgres::Error) -> RiverError {
    RiverError::Dao(err.to_string())
}

#[cfg(feature = "postgres")]
impl PostgresDao {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS para_objects (
                    appid TEXT NOT NULL,
                    id TEXT NOT NULL,
                    json JSONB NOT NULL,
                    PRIMARY KEY (appid, id)
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    async fn upsert(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        for mut object in objects {
            if object.id.is_empty() {
                continue;
            }
            object.appid = appid.to_string();
            let json = serde_json::to_value(&object)?;
            self.client
                .execute(
                    "INSERT INTO para_objects (appid, id, json)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (appid, id) DO UPDATE SET json = EXCLUDED.json",
                    &[&appid, &object.id, &json],
                )
                .await
                .map_err(dao_err)?;
        }
        Ok(())
    }
}

#[cfg(feature = "postgres")]
fn row_to_object(row: &tokio_postgres::Row) -> Option<ParaObject> {
    let json: serde_json::Value = row.try_get("json").ok()?;
    serde_json::from_value(json).ok()
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Dao for PostgresDao {
    async fn read(&self, appid: &str, id: &str) -> RiverResult<Option<ParaObject>> {
        let row = self
            .client
            .query_opt(
                "SELECT json FROM para_objects WHERE appid = $1 AND id = $2",
                &[&appid, &id],
            )
            .await
            .map_err(dao_err)?;
        Ok(row.as_ref().and_then(row_to_object))
    }

    async fn read_all(&self, appid: &str, ids: &[String]) -> RiverResult<HashMap<String, ParaObject>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .client
            .query(
                "SELECT json FROM para_objects WHERE appid = $1 AND id = ANY($2)",
                &[&appid, &ids],
            )
            .await
            .map_err(dao_err)?;
        Ok(rows
            .iter()
            .filter_map(row_to_object)
            .map(|object| (object.id.clone(), object))
            .collect())
    }

    async fn create_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        self.upsert(appid, objects).await
    }

    async fn update_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        self.upsert(appid, objects).await
    }

    async fn delete_all(&self, appid: &str, objects: Vec<ParaObject>) -> RiverResult<()> {
        let ids: Vec<String> = objects.into_iter().map(|o| o.id).collect();
        self.client
            .execute(
                "DELETE FROM para_objects WHERE appid = $1 AND id = ANY($2)",
                &[&appid, &ids],
            )
            .await
            .map_err(dao_err)?;
        Ok(())
    }

    async fn read_page(&self, appid: &str, pager: &mut Pager) -> RiverResult<Vec<ParaObject>> {
        let count: i64 = self
            .client
            .query_one("SELECT COUNT(*) FROM para_objects WHERE appid = $1", &[&appid])
            .await
            .map_err(dao_err)?
            .get(0);
        pager.count = count.max(0) as u64;

        let rows = self
            .client
            .query(
                "SELECT json FROM para_objects WHERE appid = $1 ORDER BY id LIMIT $2 OFFSET $3",
                &[&appid, &(pager.limit as i64), &(pager.offset() as i64)],
            )
            .await
            .map_err(dao_err)?;
        Ok(rows.iter().filter_map(row_to_object).collect())
    }
}
