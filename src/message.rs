//! Wire format of queue messages and their decoding.
//!
//! Every message is a JSON object carrying `_appid` and `_type`. Domain
//! mutations use a whitelisted object type; control operations use one of
//! the sentinel types below and travel over the same queue.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::types::AppDescriptor;

pub const ID_KEY: &str = "_id";
pub const TYPE_KEY: &str = "_type";
pub const APPID_KEY: &str = "_appid";
pub const DELETE_KEY: &str = "_delete";
pub const CREATE_KEY: &str = "_create";

/// Sentinel type of webhook delivery messages.
pub const WEBHOOK_PAYLOAD_TYPE: &str = "webhookpayload";
/// Sentinel type of index maintenance messages.
pub const INDEX_PAYLOAD_TYPE: &str = "indexpayload";

pub const INDEX_ALL_OP: &str = "index_all_op";
pub const UNINDEX_ALL_OP: &str = "unindex_all_op";
pub const REBUILD_INDEX_OP: &str = "rebuild_index_op";
pub const CREATE_INDEX_OP: &str = "create_index_op";
pub const DELETE_INDEX_OP: &str = "delete_index_op";

/// Domain types accepted from the queue.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: HashSet<String>,
}

const CORE_TYPES: [&str; 8] = [
    "sysprop",
    "user",
    "app",
    "tag",
    "address",
    "translation",
    "webhook",
    "vote",
];

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            types: CORE_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// A registry that accepts nothing but the given types.
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn register(&mut self, object_type: impl Into<String>) {
        let object_type = object_type.into();
        if object_type != WEBHOOK_PAYLOAD_TYPE && object_type != INDEX_PAYLOAD_TYPE {
            self.types.insert(object_type);
        }
    }

    pub fn contains(&self, object_type: &str) -> bool {
        self.types.contains(object_type)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A create/update/delete of a domain object.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub appid: String,
    pub object_type: String,
    /// Absent for creates without a client-supplied id.
    pub id: Option<String>,
    /// Raw message fields, control fields included.
    pub fields: Map<String, Value>,
}

/// A signed webhook delivery request.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookPayload {
    pub appid: String,
    pub webhook_id: Option<String>,
    pub target_url: String,
    pub url_encoded: bool,
    pub event: String,
    pub signature: String,
    /// Pre-serialized JSON payload, sent verbatim.
    pub payload: String,
}

impl WebhookPayload {
    pub fn from_fields(appid: &str, fields: &Map<String, Value>) -> Self {
        Self {
            appid: appid.to_string(),
            webhook_id: string_field(fields, ID_KEY),
            target_url: string_field(fields, "targetUrl").unwrap_or_default(),
            url_encoded: flag(fields, "urlEncoded"),
            event: string_field(fields, "event").unwrap_or_default(),
            signature: string_field(fields, "signature").unwrap_or_default(),
            payload: string_field(fields, "payload").unwrap_or_default(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(ref id) = self.webhook_id {
            map.insert(ID_KEY.to_string(), Value::String(id.clone()));
        }
        map.insert(TYPE_KEY.to_string(), Value::String(WEBHOOK_PAYLOAD_TYPE.to_string()));
        map.insert(APPID_KEY.to_string(), Value::String(self.appid.clone()));
        map.insert("targetUrl".to_string(), Value::String(self.target_url.clone()));
        map.insert("urlEncoded".to_string(), Value::Bool(self.url_encoded));
        map.insert("event".to_string(), Value::String(self.event.clone()));
        map.insert("signature".to_string(), Value::String(self.signature.clone()));
        map.insert("payload".to_string(), Value::String(self.payload.clone()));
        Value::Object(map)
    }
}

/// Index maintenance operation.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    IndexAll(Vec<String>),
    UnindexAll(Vec<String>),
    RebuildIndex(AppDescriptor),
    CreateIndex(AppDescriptor),
    DeleteIndex(AppDescriptor),
    /// Operation id not understood by this node.
    Unknown(String),
}

impl IndexOp {
    pub fn op_name(&self) -> &str {
        match self {
            IndexOp::IndexAll(_) => INDEX_ALL_OP,
            IndexOp::UnindexAll(_) => UNINDEX_ALL_OP,
            IndexOp::RebuildIndex(_) => REBUILD_INDEX_OP,
            IndexOp::CreateIndex(_) => CREATE_INDEX_OP,
            IndexOp::DeleteIndex(_) => DELETE_INDEX_OP,
            IndexOp::Unknown(name) => name.as_str(),
        }
    }

    fn payload_value(&self) -> Value {
        match self {
            IndexOp::IndexAll(ids) | IndexOp::UnindexAll(ids) => {
                Value::Array(ids.iter().cloned().map(Value::String).collect())
            }
            IndexOp::RebuildIndex(app) | IndexOp::CreateIndex(app) | IndexOp::DeleteIndex(app) => {
                serde_json::to_value(app).unwrap_or(Value::Null)
            }
            IndexOp::Unknown(_) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexPayload {
    pub appid: String,
    pub op: IndexOp,
}

impl IndexPayload {
    pub fn new(appid: impl Into<String>, op: IndexOp) -> Self {
        Self {
            appid: appid.into(),
            op,
        }
    }

    pub fn from_fields(appid: &str, fields: &Map<String, Value>) -> Self {
        let op_name = string_field(fields, "op").unwrap_or_default();
        let payload = fields.get("payload").cloned().unwrap_or(Value::Null);

        let op = match op_name.as_str() {
            INDEX_ALL_OP => IndexOp::IndexAll(id_list(&payload)),
            UNINDEX_ALL_OP => IndexOp::UnindexAll(id_list(&payload)),
            REBUILD_INDEX_OP | CREATE_INDEX_OP | DELETE_INDEX_OP => {
                let app = serde_json::from_value::<AppDescriptor>(payload)
                    .unwrap_or_else(|_| AppDescriptor::new(appid));
                match op_name.as_str() {
                    REBUILD_INDEX_OP => IndexOp::RebuildIndex(app),
                    CREATE_INDEX_OP => IndexOp::CreateIndex(app),
                    _ => IndexOp::DeleteIndex(app),
                }
            }
            _ => IndexOp::Unknown(op_name.clone()),
        };

        Self {
            appid: appid.to_string(),
            op,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(TYPE_KEY.to_string(), Value::String(INDEX_PAYLOAD_TYPE.to_string()));
        map.insert(APPID_KEY.to_string(), Value::String(self.appid.clone()));
        map.insert("op".to_string(), Value::String(self.op.op_name().to_string()));
        map.insert("payload".to_string(), self.op.payload_value());
        Value::Object(map)
    }

    /// Serialize for transport on the queue.
    pub fn to_message(&self) -> String {
        self.to_value().to_string()
    }
}

/// A queue message decoded once, at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum RiverMessage {
    Mutation(Mutation),
    WebhookPayload(WebhookPayload),
    IndexPayload(IndexPayload),
}

impl RiverMessage {
    /// Decode a raw queue message.
    ///
    /// Returns `None` for anything the River must drop: invalid JSON,
    /// non-object payloads, missing `_appid`/`_type`, or an unknown type.
    pub fn decode(raw: &str, registry: &TypeRegistry) -> Option<Self> {
        let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(raw) else {
            return None;
        };
        Self::from_fields(fields, registry)
    }

    pub fn from_fields(fields: Map<String, Value>, registry: &TypeRegistry) -> Option<Self> {
        let appid = string_field(&fields, APPID_KEY)?;
        let object_type = string_field(&fields, TYPE_KEY)?;

        match object_type.as_str() {
            WEBHOOK_PAYLOAD_TYPE => {
                return Some(RiverMessage::WebhookPayload(WebhookPayload::from_fields(&appid, &fields)));
            }
            INDEX_PAYLOAD_TYPE => {
                return Some(RiverMessage::IndexPayload(IndexPayload::from_fields(&appid, &fields)));
            }
            _ => {}
        }

        if !registry.contains(&object_type) {
            return None;
        }

        let id = string_field(&fields, ID_KEY);
        let kind = if flag(&fields, DELETE_KEY) && id.is_some() {
            MutationKind::Delete
        } else if id.is_none() || flag(&fields, CREATE_KEY) {
            MutationKind::Create
        } else {
            MutationKind::Update
        };

        Some(RiverMessage::Mutation(Mutation {
            kind,
            appid,
            object_type,
            id,
            fields,
        }))
    }
}

/// Non-blank string field. Numbers are accepted for ids.
fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Boolean flag given either as a JSON bool or as the string "true".
fn flag(fields: &Map<String, Value>, key: &str) -> bool {
    match fields.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn id_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
