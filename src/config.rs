use std::time::Duration;

use crate::signing::SignatureEncoding;

/// Which HTTP statuses count as a successful webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessRange {
    /// Any status within 10 of 200 (190..=210).
    Tolerant,
    /// 2xx only.
    Strict,
}

impl SuccessRange {
    pub fn is_success(&self, status: u16) -> bool {
        match self {
            SuccessRange::Tolerant => (190..=210).contains(&status),
            SuccessRange::Strict => (200..300).contains(&status),
        }
    }
}

/// Runtime knobs for the River and the webhook dispatcher.
#[derive(Debug, Clone)]
pub struct RiverConfig {
    /// Sleep applied once the loop has been idle for a few cycles.
    pub polling_sleep: Duration,
    /// Long-poll wait a managed queue backend may block for on a single pull.
    pub polling_interval: Duration,
    /// Consecutive idle cycles before the loop starts sleeping.
    pub idle_cycles_before_sleep: u32,
    pub max_messages_per_pull: usize,
    pub max_failed_webhook_attempts: u32,
    pub max_indexing_retries: u32,
    /// Base of the linear backoff between index retry rounds.
    pub index_retry_base_delay: Duration,
    pub webhooks_enabled: bool,
    /// Number of parallel delivery attempts per webhook message. Negative
    /// values are taken as absolute.
    pub repeated_delivery_attempts: i32,
    pub webhook_timeout: Duration,
    pub default_encoding: String,
    pub success_range: SuccessRange,
    pub signature_encoding: SignatureEncoding,
    /// Delay before a crashed River task is restarted.
    pub restart_delay: Duration,
    /// Page size used when scanning webhook subscriptions.
    pub webhook_page_size: usize,
}

const DEFAULT_POLLING_SLEEP_SECS: u64 = 60;
const DEFAULT_POLLING_INTERVAL_SECS: u64 = 20;
const DEFAULT_MAX_MESSAGES_PER_PULL: usize = 10;
const DEFAULT_MAX_FAILED_WEBHOOK_ATTEMPTS: u32 = 10;
const DEFAULT_MAX_INDEXING_RETRIES: u32 = 5;
const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;
pub const MAX_REPEATED_DELIVERY_ATTEMPTS: u32 = 100;

impl Default for RiverConfig {
    fn default() -> Self {
        Self {
            polling_sleep: Duration::from_secs(DEFAULT_POLLING_SLEEP_SECS),
            polling_interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS),
            idle_cycles_before_sleep: 3,
            max_messages_per_pull: DEFAULT_MAX_MESSAGES_PER_PULL,
            max_failed_webhook_attempts: DEFAULT_MAX_FAILED_WEBHOOK_ATTEMPTS,
            max_indexing_retries: DEFAULT_MAX_INDEXING_RETRIES,
            index_retry_base_delay: Duration::from_secs(1),
            webhooks_enabled: true,
            repeated_delivery_attempts: 1,
            webhook_timeout: Duration::from_secs(DEFAULT_WEBHOOK_TIMEOUT_SECS),
            default_encoding: "UTF-8".to_string(),
            success_range: SuccessRange::Tolerant,
            signature_encoding: SignatureEncoding::Base64,
            restart_delay: Duration::from_secs(5),
            webhook_page_size: 30,
        }
    }
}

impl RiverConfig {
    /// Read overrides from `PARA_*` environment variables. Unset or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            polling_sleep: env_secs("PARA_QUEUE_POLLING_SLEEP_SECONDS")
                .unwrap_or(defaults.polling_sleep),
            polling_interval: env_secs("PARA_QUEUE_POLLING_INTERVAL_SECONDS")
                .unwrap_or(defaults.polling_interval),
            idle_cycles_before_sleep: env_parse::<u32>("PARA_QUEUE_IDLE_CYCLES_BEFORE_SLEEP")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.idle_cycles_before_sleep),
            max_messages_per_pull: env_parse::<usize>("PARA_QUEUE_MAX_MESSAGES_PER_PULL")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_messages_per_pull),
            max_failed_webhook_attempts: env_parse::<u32>("PARA_MAX_FAILED_WEBHOOK_ATTEMPTS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_failed_webhook_attempts),
            max_indexing_retries: env_parse::<u32>("PARA_MAX_INDEXING_RETRIES")
                .unwrap_or(defaults.max_indexing_retries),
            index_retry_base_delay: env_parse::<u64>("PARA_INDEX_RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.index_retry_base_delay),
            webhooks_enabled: env_bool("PARA_WEBHOOKS_ENABLED")
                .unwrap_or(defaults.webhooks_enabled),
            repeated_delivery_attempts: env_parse::<i32>("PARA_WEBHOOKS_REPEATED_DELIVERY_ATTEMPTS")
                .unwrap_or(defaults.repeated_delivery_attempts),
            webhook_timeout: env_secs("PARA_WEBHOOKS_TIMEOUT_SECONDS")
                .filter(|value| !value.is_zero())
                .unwrap_or(defaults.webhook_timeout),
            default_encoding: std::env::var("PARA_DEFAULT_ENCODING")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.default_encoding),
            success_range: match std::env::var("PARA_WEBHOOKS_SUCCESS_RANGE").ok().as_deref() {
                Some("strict") => SuccessRange::Strict,
                Some("tolerant") => SuccessRange::Tolerant,
                _ => defaults.success_range,
            },
            signature_encoding: match std::env::var("PARA_WEBHOOKS_SIGNATURE_ENCODING").ok().as_deref() {
                Some("hex") => SignatureEncoding::Hex,
                Some("base64") => SignatureEncoding::Base64,
                _ => defaults.signature_encoding,
            },
            restart_delay: env_secs("PARA_RIVER_RESTART_DELAY_SECONDS")
                .unwrap_or(defaults.restart_delay),
            webhook_page_size: env_parse::<usize>("PARA_WEBHOOKS_PAGE_SIZE")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.webhook_page_size),
        }
    }

    /// Effective number of parallel delivery attempts, 1..=100.
    pub fn delivery_attempts(&self) -> u32 {
        self.repeated_delivery_attempts
            .unsigned_abs()
            .clamp(1, MAX_REPEATED_DELIVERY_ATTEMPTS)
    }

    pub fn user_agent(&self) -> String {
        format!("Para Webhook Dispatcher {}", env!("CARGO_PKG_VERSION"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
}
