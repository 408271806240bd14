use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RiverResult;

/// Object type of webhook subscription records.
pub const WEBHOOK_TYPE: &str = "webhook";

/// Fields an update message is never allowed to overwrite.
pub const LOCKED_FIELDS: [&str; 5] = ["id", "type", "appid", "timestamp", "creatorid"];

/// Generic domain object stored by the DAO and indexed by search.
///
/// Well-known fields are typed; everything else lives in `properties`
/// and is flattened into the JSON form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParaObject {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub object_type: String,

    #[serde(default)]
    pub appid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Creation time, epoch millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Last update time, epoch millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creatorid: Option<String>,

    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ParaObject {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_appid(mut self, appid: impl Into<String>) -> Self {
        self.appid = appid.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Build an object from raw message fields, ignoring `_`-prefixed
    /// control fields.
    pub fn from_fields(fields: &Map<String, Value>) -> RiverResult<Self> {
        let data: Map<String, Value> = fields
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(data))?)
    }

    /// Overlay message fields onto this object. Locked fields and control
    /// fields are left untouched.
    pub fn merge_fields(&mut self, fields: &Map<String, Value>) -> RiverResult<()> {
        let Value::Object(mut current) = serde_json::to_value(&*self)? else {
            return Ok(());
        };
        for (key, value) in fields {
            if key.starts_with('_') || LOCKED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            current.insert(key.clone(), value.clone());
        }
        *self = serde_json::from_value(Value::Object(current))?;
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Look up a field by its JSON name, typed fields included.
    pub fn field(&self, key: &str) -> Option<Value> {
        match self.to_value() {
            Value::Object(mut map) => map.remove(key),
            _ => None,
        }
    }
}

/// DAO methods that can trigger webhook notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaoMethod {
    Create,
    Update,
    Delete,
    CreateAll,
    UpdateAll,
    DeleteAll,
}

impl DaoMethod {
    /// Name used as the webhook subscription flag and as `X-Para-Event`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DaoMethod::Create => "create",
            DaoMethod::Update => "update",
            DaoMethod::Delete => "delete",
            DaoMethod::CreateAll => "createAll",
            DaoMethod::UpdateAll => "updateAll",
            DaoMethod::DeleteAll => "deleteAll",
        }
    }
}

/// Webhook subscription record.
///
/// Stored through the DAO as a [`ParaObject`] of type `webhook`; this
/// is the typed view the dispatcher works with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub appid: String,

    #[serde(default)]
    pub target_url: String,

    /// Shared secret used to sign payloads.
    #[serde(default)]
    pub secret: String,

    /// Only objects of this type trigger the webhook. Blank or `*` means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<String>,

    #[serde(default)]
    pub url_encoded: bool,

    #[serde(default = "default_active")]
    pub active: bool,

    /// Set when the webhook was switched off after repeated failures.
    #[serde(default)]
    pub too_many_failures: bool,

    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub create_all: bool,
    #[serde(default)]
    pub update_all: bool,
    #[serde(default)]
    pub delete_all: bool,

    /// Application-defined events this webhook listens to.
    #[serde(default)]
    pub custom_events: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl Webhook {
    pub fn new(id: impl Into<String>, appid: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            appid: appid.into(),
            target_url: target_url.into(),
            secret: String::new(),
            type_filter: None,
            url_encoded: false,
            active: true,
            too_many_failures: false,
            create: false,
            update: false,
            delete: false,
            create_all: false,
            update_all: false,
            delete_all: false,
            custom_events: Vec::new(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_type_filter(mut self, type_filter: impl Into<String>) -> Self {
        self.type_filter = Some(type_filter.into());
        self
    }

    pub fn with_url_encoded(mut self, url_encoded: bool) -> Self {
        self.url_encoded = url_encoded;
        self
    }

    /// Subscribe to a DAO method.
    pub fn on(mut self, method: DaoMethod) -> Self {
        match method {
            DaoMethod::Create => self.create = true,
            DaoMethod::Update => self.update = true,
            DaoMethod::Delete => self.delete = true,
            DaoMethod::CreateAll => self.create_all = true,
            DaoMethod::UpdateAll => self.update_all = true,
            DaoMethod::DeleteAll => self.delete_all = true,
        }
        self
    }

    pub fn with_custom_event(mut self, event: impl Into<String>) -> Self {
        self.custom_events.push(event.into());
        self
    }

    pub fn subscribes_to(&self, method: DaoMethod) -> bool {
        match method {
            DaoMethod::Create => self.create,
            DaoMethod::Update => self.update,
            DaoMethod::Delete => self.delete,
            DaoMethod::CreateAll => self.create_all,
            DaoMethod::UpdateAll => self.update_all,
            DaoMethod::DeleteAll => self.delete_all,
        }
    }

    /// Whether mutations of `object_type` should reach this webhook.
    pub fn matches_type(&self, object_type: &str) -> bool {
        match self.type_filter.as_deref().map(str::trim) {
            None | Some("") | Some("*") => true,
            Some(filter) => filter == object_type,
        }
    }

    pub fn from_object(object: &ParaObject) -> RiverResult<Self> {
        Ok(serde_json::from_value(object.to_value())?)
    }

    pub fn to_object(&self) -> RiverResult<ParaObject> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.insert("type".to_string(), Value::String(WEBHOOK_TYPE.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Page cursor for search queries.
///
/// `page` is 1-based. Callers advance it with [`Pager::next_page`] and stop
/// once a page comes back empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pager {
    pub page: u64,
    pub limit: usize,
    /// Total hits reported by the last query.
    pub count: u64,
}

impl Pager {
    pub fn new(limit: usize) -> Self {
        Self {
            page: 1,
            limit: limit.max(1),
            count: 0,
        }
    }

    pub fn next_page(&mut self) {
        self.page += 1;
    }

    /// Index of the first item of the current page.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize).saturating_mul(self.limit)
    }
}

impl Default for Pager {
    fn default() -> Self {
        Self::new(30)
    }
}

/// App record carried by index maintenance operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub appid: String,

    /// Shared apps live in the root index.
    #[serde(default)]
    pub shared: bool,
}

impl AppDescriptor {
    pub fn new(appid: impl Into<String>) -> Self {
        Self {
            appid: appid.into(),
            shared: false,
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Start of the id clock, 2020-01-01T00:00:00Z.
const ID_EPOCH_MILLIS: i64 = 1_577_836_800_000;
const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_NODE_ID: u64 = (1 << NODE_BITS) - 1;

static LAST_ID: AtomicU64 = AtomicU64::new(0);
static NODE_ID: OnceLock<u64> = OnceLock::new();

/// Node bits of generated ids: `PARA_WORKER_ID` when set, random otherwise.
fn node_id() -> u64 {
    *NODE_ID.get_or_init(|| {
        std::env::var("PARA_WORKER_ID")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|id| id & MAX_NODE_ID)
            .unwrap_or_else(|| fastrand::u64(0..=MAX_NODE_ID))
    })
}

/// Generate a new numeric object id.
///
/// Snowflake layout: milliseconds since the id epoch, then node bits, then
/// a sequence. Ids are strictly increasing within a process; a burst that
/// exhausts the sequence borrows from the next millisecond.
pub fn new_id() -> String {
    let millis = (now_millis() - ID_EPOCH_MILLIS).max(0) as u64;
    let floor = (millis << (NODE_BITS + SEQUENCE_BITS)) | (node_id() << SEQUENCE_BITS);
    let previous = match LAST_ID.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(floor.max(last + 1))
    }) {
        Ok(previous) | Err(previous) => previous,
    };
    floor.max(previous + 1).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_skips_locked_and_control_fields() {
        let mut object = ParaObject::new("sysprop")
            .with_id("k1")
            .with_appid("app1")
            .with_name("before");
        object.timestamp = Some(1);

        let fields = json!({
            "_id": "k1",
            "_type": "sysprop",
            "id": "other",
            "appid": "app2",
            "timestamp": 99,
            "name": "after",
            "color": "blue"
        });
        object.merge_fields(fields.as_object().unwrap()).unwrap();

        assert_eq!(object.id, "k1");
        assert_eq!(object.appid, "app1");
        assert_eq!(object.timestamp, Some(1));
        assert_eq!(object.name.as_deref(), Some("after"));
        assert_eq!(object.properties.get("color"), Some(&json!("blue")));
        assert!(!object.properties.contains_key("_type"));
    }

    #[test]
    fn webhook_round_trips_through_object() {
        let webhook = Webhook::new("w1", "app1", "http://example.com/hook")
            .with_secret("s3cret")
            .with_type_filter("user")
            .on(DaoMethod::Create);

        let object = webhook.to_object().unwrap();
        assert_eq!(object.object_type, WEBHOOK_TYPE);
        assert_eq!(object.field("targetUrl"), Some(json!("http://example.com/hook")));
        assert_eq!(object.field("create"), Some(json!(true)));

        let back = Webhook::from_object(&object).unwrap();
        assert_eq!(back, webhook);
    }

    #[test]
    fn type_filter_wildcards() {
        let any = Webhook::new("w1", "app1", "http://x");
        assert!(any.matches_type("sysprop"));
        assert!(any.clone().with_type_filter("*").matches_type("user"));
        assert!(any.clone().with_type_filter(" ").matches_type("user"));
        assert!(!any.with_type_filter("tag").matches_type("user"));
    }

    #[test]
    fn ids_do_not_repeat_in_a_tight_loop() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200_000 {
            assert!(seen.insert(new_id()));
        }
    }

    #[test]
    fn ids_do_not_repeat_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..20_000).map(|_| new_id()).collect::<Vec<_>>()))
            .collect();
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 80_000);
    }

    #[test]
    fn ids_increase() {
        let a: u64 = new_id().parse().unwrap();
        let b: u64 = new_id().parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn pager_offsets() {
        let mut pager = Pager::new(10);
        assert_eq!(pager.offset(), 0);
        pager.next_page();
        assert_eq!(pager.offset(), 10);
    }
}
