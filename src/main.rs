//! creditsync server
//!
//! Stripe webhook receiver that reconciles purchases, subscriptions and
//! credit balances into SQLite.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use creditsync::billing::{ConfiguredNotifier, PriceCatalog, Reconciler};
use creditsync::config::{Args, Config};
use creditsync::handlers::{status_router, AppState};
use creditsync::store::SqliteStore;
use creditsync::stripe::{
    stripe_webhook_router, EventProcessor, InMemoryIdempotencyStore, StripeClient,
    StripeWebhookState,
};

/// How long in-flight events get to finish after the listener stops
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(args).context("failed to load configuration")?;
    tracing::debug!(config = ?config, "Configuration loaded");

    let catalog = PriceCatalog::load(&config.args.prices)
        .with_context(|| format!("failed to load price table {}", config.args.prices.display()))?;

    let store = SqliteStore::open(&config.args.database).with_context(|| {
        format!("failed to open database {}", config.args.database.display())
    })?;
    tracing::info!(path = %config.args.database.display(), "Database ready");

    let notifier = ConfiguredNotifier::from_config(&config.notifier);
    tracing::info!(notifier = notifier.kind(), "Purchase notifications configured");

    let reconciler = Reconciler::new(
        Arc::new(store),
        Arc::new(
            StripeClient::new(config.stripe_secret_key.clone())
                .context("failed to build Stripe client")?,
        ),
        Arc::new(notifier),
        catalog,
    );

    let idempotency = Arc::new(InMemoryIdempotencyStore::new(
        config.webhook.idempotency_ttl,
        config.webhook.idempotency_max_entries,
    ));
    let (processor, handle) =
        EventProcessor::new(Arc::new(reconciler), idempotency, config.webhook.clone());
    let worker = tokio::spawn(handle.run());

    let app_state = Arc::new(AppState::new(processor.stats()));
    let webhook_state = Arc::new(StripeWebhookState::new(&config.webhook, Arc::new(processor)));

    let app = stripe_webhook_router(webhook_state)
        .merge(status_router(app_state))
        .layer(TraceLayer::new_for_http());

    let addr = config.args.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    tracing::info!(addr = %addr, version = creditsync::VERSION, "creditsync listening");

    // Dropping the router closes the queue; the worker then drains
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    match tokio::time::timeout(DRAIN_TIMEOUT, worker).await {
        Ok(Ok(())) => tracing::info!("Event processor drained"),
        Ok(Err(e)) => tracing::error!(error = %e, "Event processor task failed"),
        Err(_) => tracing::warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "Gave up waiting for in-flight events"
        ),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping server...");
}
