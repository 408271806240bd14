//! Queue-driven event processing for multi-tenant Para backends.
//!
//! A [`River`] drains a shared queue, classifies every message and turns
//! domain mutations into **one bulk DAO call per kind per cycle**. Control
//! messages ride the same queue:
//! - webhook payloads are delivered over HTTP and counted against a
//!   per-webhook failure budget that deactivates misbehaving targets
//! - index operations are applied to the search backend, with a bounded
//!   background retry for objects that are not readable yet
//!
//! ## Guarantees
//! - Malformed or foreign messages are dropped without side effects
//! - Batched writes, grouped per tenant
//! - Adaptive idle backoff and cooperative shutdown
//!
//! ## Non-Guarantees
//! - Exactly-once processing
//! - Ordering across competing Rivers
//! - Automatic reactivation of deactivated webhooks
//!
//! Storage, search, cache and queue backends are traits; in-memory
//! implementations ship with the crate and Redis / Postgres backends are
//! available behind features.

mod cache;
mod config;
mod dao;
mod delivery;
mod error;
mod health;
mod indexing;
mod message;
mod queue;
mod river;
mod search;
mod signing;
mod telemetry;
mod types;
mod webhook;

#[cfg(feature = "redis")]
mod queue_redis;

#[cfg(feature = "postgres")]
mod dao_postgres;

pub use cache::{Cache, InMemoryCache};
pub use config::{RiverConfig, SuccessRange, MAX_REPEATED_DELIVERY_ATTEMPTS};
pub use dao::{Dao, DaoCallStats, InMemoryDao};
pub use delivery::{FailureState, FailureTracker, WebhookDelivery, FAILED_WEBHOOK_COUNT_KEY};
pub use error::{DeliveryOutcome, FailureReason, RiverError, RiverResult};
pub use health::{AlwaysHealthy, HealthCheck, HealthFlag};
pub use indexing::{push_index_op, IndexAllReport, IndexMaintenance, PendingIds};
pub use message::{
    IndexOp,
    IndexPayload,
    Mutation,
    MutationKind,
    RiverMessage,
    TypeRegistry,
    WebhookPayload,
    INDEX_PAYLOAD_TYPE,
    WEBHOOK_PAYLOAD_TYPE,
};
pub use queue::{LocalQueue, MessageSource, Queue, QueueSource};
pub use river::{Activity, AppBatch, Batches, CycleReport, IdleBackoff, Placement, River, RiverHandle};
pub use search::{InMemorySearch, Search};
pub use signing::{
    compute_signature,
    verify_signature,
    parse_signature_headers,
    verify_webhook_request,
    ParsedSignature,
    SignatureEncoding,
    VerificationError,
    EVENT_HEADER,
    SIGNATURE_HEADER,
};
pub use types::{new_id, AppDescriptor, DaoMethod, Pager, ParaObject, Webhook, LOCKED_FIELDS, WEBHOOK_TYPE};
pub use webhook::{build_webhook_payload, WebhookNotifier};

#[cfg(feature = "redis")]
pub use queue_redis::RedisQueue;

#[cfg(feature = "postgres")]
pub use dao_postgres::PostgresDao;
