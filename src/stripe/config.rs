//! Stripe webhook configuration
//!
//! Secrets are read from the environment, never from files checked into the
//! repository.

use std::time::Duration;

use crate::stripe::error::{StripeWebhookError, StripeWebhookResult};

/// Default signature timestamp tolerance (Stripe recommends five minutes)
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Default number of retries after the first processing attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-attempt processing timeout
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: u64 = 30;

/// Default capacity of the background event queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Configuration for receiving and processing Stripe webhooks
#[derive(Clone)]
pub struct StripeWebhookConfig {
    /// Webhook signing secret (`whsec_...`)
    pub webhook_secret: String,
    /// Maximum accepted age of a signed timestamp
    pub signature_tolerance: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry
    pub base_retry_delay: Duration,
    /// Upper bound for a single retry delay
    pub max_retry_delay: Duration,
    /// Timeout for one processing attempt
    pub processing_timeout: Duration,
    /// Capacity of the background queue
    pub queue_capacity: usize,
    /// How long event ids are remembered for deduplication
    pub idempotency_ttl: Duration,
    /// Maximum number of remembered event ids
    pub idempotency_max_entries: usize,
}

impl std::fmt::Debug for StripeWebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeWebhookConfig")
            .field("webhook_secret", &"[REDACTED]")
            .field("signature_tolerance", &self.signature_tolerance)
            .field("max_retries", &self.max_retries)
            .field("processing_timeout", &self.processing_timeout)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl StripeWebhookConfig {
    /// Create a configuration with defaults and the given secret
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            signature_tolerance: Duration::from_secs(DEFAULT_TOLERANCE_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(DEFAULT_PROCESSING_TIMEOUT_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idempotency_ttl: Duration::from_secs(72 * 3600),
            idempotency_max_entries: 100_000,
        }
    }

    /// Load configuration from environment variables
    ///
    /// `STRIPE_WEBHOOK_SECRET` is required. `STRIPE_WEBHOOK_TOLERANCE_SECS`,
    /// `STRIPE_WEBHOOK_MAX_RETRIES` and `STRIPE_WEBHOOK_TIMEOUT_SECS` are
    /// optional overrides.
    pub fn from_env() -> StripeWebhookResult<Self> {
        let secret = std::env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| {
            StripeWebhookError::ConfigError("STRIPE_WEBHOOK_SECRET is not set".to_string())
        })?;

        let mut config = Self::new(secret);
        config.validate()?;

        if let Some(secs) = env_parse::<u64>("STRIPE_WEBHOOK_TOLERANCE_SECS")? {
            config.signature_tolerance = Duration::from_secs(secs);
        }
        if let Some(retries) = env_parse::<u32>("STRIPE_WEBHOOK_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(secs) = env_parse::<u64>("STRIPE_WEBHOOK_TIMEOUT_SECS")? {
            config.processing_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Reject obviously unusable secrets
    pub fn validate(&self) -> StripeWebhookResult<()> {
        if self.webhook_secret.trim().is_empty() {
            return Err(StripeWebhookError::ConfigError(
                "webhook secret must not be empty".to_string(),
            ));
        }
        if !self.webhook_secret.starts_with("whsec_") {
            tracing::warn!("Webhook secret does not start with whsec_; is this the signing secret?");
        }
        Ok(())
    }

    /// Delay before retry number `retry` (zero-based), exponential with a cap
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }

    /// Configuration for tests: short delays, small queue
    pub fn test_config() -> Self {
        Self {
            webhook_secret: "whsec_test_secret".to_string(),
            signature_tolerance: Duration::from_secs(DEFAULT_TOLERANCE_SECS),
            max_retries: 2,
            base_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(20),
            processing_timeout: Duration::from_secs(5),
            queue_capacity: 64,
            idempotency_ttl: Duration::from_secs(3600),
            idempotency_max_entries: 1000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> StripeWebhookResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| StripeWebhookError::ConfigError(format!("{key} is not a valid number"))),
        Err(_) => Ok(None),
    }
}
