//! Service configuration
//!
//! Network, storage and price-table settings come from CLI flags with
//! environment fallbacks. Secrets (Stripe keys, Resend key) are read from the
//! environment only.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};
use crate::stripe::config::StripeWebhookConfig;

/// Default sender for fulfillment emails
pub const DEFAULT_FROM_EMAIL: &str = "billing@localhost";

/// Command-line arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "creditsync")]
#[command(version)]
#[command(about = "Stripe webhook reconciliation for purchases, subscriptions and credits")]
pub struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "CREDITSYNC_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "CREDITSYNC_PORT", default_value = "8080")]
    pub port: u16,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "creditsync.db")]
    pub database: PathBuf,

    /// Price → credits table (JSON)
    #[arg(long, env = "PRICE_TABLE_PATH", default_value = "config/prices.json")]
    pub prices: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Default tracing filter when `RUST_LOG` is not set
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "creditsync=debug,tower_http=debug"
        } else {
            "creditsync=info,tower_http=info"
        }
    }

    /// Address to bind
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where fulfillment notifications go
#[derive(Clone, PartialEq, Eq)]
pub enum NotifierConfig {
    /// Log only
    Log,
    /// Email through Resend
    Resend {
        /// Resend API key
        api_key: String,
        /// Sender address
        from_email: String,
    },
}

impl std::fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log => f.write_str("Log"),
            Self::Resend { from_email, .. } => f
                .debug_struct("Resend")
                .field("from_email", from_email)
                .finish_non_exhaustive(),
        }
    }
}

impl NotifierConfig {
    /// Resend when an API key is present, logging otherwise
    pub fn from_values(api_key: Option<String>, from_email: Option<String>) -> Self {
        match api_key.filter(|k| !k.trim().is_empty()) {
            Some(api_key) => Self::Resend {
                api_key,
                from_email: from_email.unwrap_or_else(|| DEFAULT_FROM_EMAIL.to_string()),
            },
            None => Self::Log,
        }
    }
}

/// Fully resolved service configuration
#[derive(Clone)]
pub struct Config {
    /// CLI arguments
    pub args: Args,
    /// Stripe API secret key (`sk_...`)
    pub stripe_secret_key: String,
    /// Webhook verification and processing settings
    pub webhook: StripeWebhookConfig,
    /// Notification channel
    pub notifier: NotifierConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("args", &self.args)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Resolve configuration from `args` and the environment
    pub fn load(args: Args) -> Result<Self> {
        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Config("STRIPE_SECRET_KEY is not set".to_string()))?;

        let webhook = StripeWebhookConfig::from_env()?;

        let notifier = NotifierConfig::from_values(
            std::env::var("RESEND_API_KEY").ok(),
            std::env::var("NOTIFY_FROM_EMAIL").ok(),
        );

        Ok(Self {
            args,
            stripe_secret_key,
            webhook,
            notifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["creditsync"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.prices, PathBuf::from("config/prices.json"));
        assert!(!args.verbose);
        assert_eq!(args.log_filter(), "creditsync=info,tower_http=info");
    }

    #[test]
    fn test_args_flags() {
        let args = Args::try_parse_from([
            "creditsync",
            "-H",
            "0.0.0.0",
            "--port",
            "9000",
            "--database",
            "/tmp/billing.db",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.addr(), "0.0.0.0:9000");
        assert_eq!(args.database, PathBuf::from("/tmp/billing.db"));
        assert!(args.log_filter().contains("debug"));
    }

    #[test]
    fn test_notifier_selection() {
        assert_eq!(NotifierConfig::from_values(None, None), NotifierConfig::Log);
        assert_eq!(
            NotifierConfig::from_values(Some("  ".into()), None),
            NotifierConfig::Log
        );
        assert_eq!(
            NotifierConfig::from_values(Some("re_1".into()), None),
            NotifierConfig::Resend {
                api_key: "re_1".into(),
                from_email: DEFAULT_FROM_EMAIL.into()
            }
        );
    }
}
