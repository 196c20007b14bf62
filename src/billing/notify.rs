//! Purchase notifications
//!
//! Sent after a purchase with a fulfillment tag completes (for example to
//! hand out repository access). Delivery runs on a detached task; a failure
//! here never touches the reconciliation that triggered it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::NotifierConfig;

/// Retry delays for transient failures (1s, 4s, 16s)
const RETRY_DELAYS: &[u64] = &[1, 4, 16];

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// A completed purchase that needs fulfillment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseNotice {
    /// Purchase ID
    pub purchase_id: String,
    /// Buyer
    pub user_id: String,
    /// Buyer email, if known
    pub email: Option<String>,
    /// Price that was bought
    pub product_id: String,
    /// Fulfillment tag from the price catalog
    pub fulfillment: String,
    /// Amount in the smallest currency unit
    pub amount: i64,
    /// ISO currency code
    pub currency: String,
    /// Completion time (Unix timestamp)
    pub completed_at: i64,
}

/// Outbound notification sender
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Notify that a purchase completed
    async fn purchase_completed(&self, notice: &PurchaseNotice) -> anyhow::Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn purchase_completed(&self, notice: &PurchaseNotice) -> anyhow::Result<()> {
        tracing::info!(
            purchase_id = %notice.purchase_id,
            user_id = %notice.user_id,
            fulfillment = %notice.fulfillment,
            "Purchase fulfillment notice (email delivery disabled)"
        );
        Ok(())
    }
}

/// Resend API request body
#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
}

/// Resend API response
#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    #[allow(dead_code)]
    id: String,
}

/// Notifier that emails the buyer through Resend
#[derive(Clone)]
pub struct ResendNotifier {
    api_key: String,
    from_email: String,
    http_client: Client,
    retry_delays: Vec<Duration>,
}

impl std::fmt::Debug for ResendNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendNotifier")
            .field("from_email", &self.from_email)
            .finish_non_exhaustive()
    }
}

impl ResendNotifier {
    /// Create a notifier with the default retry schedule
    pub fn new(api_key: impl Into<String>, from_email: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            from_email: from_email.into(),
            http_client: Client::new(),
            retry_delays: RETRY_DELAYS.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// Override the retry schedule
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    fn compose(notice: &PurchaseNotice) -> (String, String) {
        let date = format_date(notice.completed_at);
        let subject = format!("Your purchase is ready ({})", notice.fulfillment);
        let text = format!(
            "Thanks for your purchase.\n\nPurchase: {}\nProduct: {}\nAmount: {} {}\nCompleted: {}\n\nWe are setting up {} for your account now.",
            notice.purchase_id,
            notice.product_id,
            format_amount(notice.amount),
            notice.currency.to_uppercase(),
            date,
            notice.fulfillment.replace('_', " "),
        );
        (subject, text)
    }

    /// Send one request; the flag tells whether a retry could help
    async fn send_request(
        &self,
        request: &ResendEmailRequest<'_>,
    ) -> std::result::Result<(), (anyhow::Error, bool)> {
        let response = self
            .http_client
            .post(RESEND_API_URL)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| (anyhow::anyhow!("request to Resend failed: {e}"), true))?;

        let status = response.status();
        if status.is_success() {
            let _: ResendEmailResponse = response
                .json()
                .await
                .map_err(|e| (anyhow::anyhow!("unexpected Resend response: {e}"), false))?;
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let is_transient = status.as_u16() == 429 || status.is_server_error();
        Err((
            anyhow::anyhow!("Resend returned {status}: {body}"),
            is_transient,
        ))
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn purchase_completed(&self, notice: &PurchaseNotice) -> anyhow::Result<()> {
        let Some(to) = notice.email.as_deref() else {
            tracing::warn!(
                purchase_id = %notice.purchase_id,
                user_id = %notice.user_id,
                "Buyer has no email address; skipping fulfillment email"
            );
            return Ok(());
        };

        let (subject, text) = Self::compose(notice);
        let request = ResendEmailRequest {
            from: &self.from_email,
            to: vec![to],
            subject,
            text,
        };

        let mut last_error = None;
        let delays = std::iter::once(Duration::ZERO).chain(self.retry_delays.iter().copied());
        for (attempt, delay) in delays.enumerate() {
            if !delay.is_zero() {
                tracing::warn!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    purchase_id = %notice.purchase_id,
                    "Retrying fulfillment email after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_request(&request).await {
                Ok(()) => {
                    tracing::info!(
                        purchase_id = %notice.purchase_id,
                        to = %to,
                        attempt,
                        "Fulfillment email sent via Resend"
                    );
                    return Ok(());
                }
                Err((error, true)) => last_error = Some(error),
                Err((error, false)) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("email retries exhausted")))
    }
}

/// Notifier chosen at startup from [`NotifierConfig`]
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    /// Log only
    Log(LogNotifier),
    /// Email through Resend
    Resend(ResendNotifier),
}

impl ConfiguredNotifier {
    /// Build the notifier described by `config`
    pub fn from_config(config: &NotifierConfig) -> Self {
        match config {
            NotifierConfig::Log => Self::Log(LogNotifier),
            NotifierConfig::Resend {
                api_key,
                from_email,
            } => Self::Resend(ResendNotifier::new(api_key, from_email)),
        }
    }

    /// Short name for startup logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Resend(_) => "resend",
        }
    }
}

#[async_trait]
impl Notifier for ConfiguredNotifier {
    async fn purchase_completed(&self, notice: &PurchaseNotice) -> anyhow::Result<()> {
        match self {
            Self::Log(inner) => inner.purchase_completed(notice).await,
            Self::Resend(inner) => inner.purchase_completed(notice).await,
        }
    }
}

/// Format a Unix timestamp as a date (e.g. "Jan 15, 2024")
fn format_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%b %d, %Y").to_string())
        .unwrap_or_else(|| "Unknown date".to_string())
}

fn format_amount(minor_units: i64) -> String {
    format!("{}.{:02}", minor_units / 100, (minor_units % 100).abs())
}
