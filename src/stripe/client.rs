//! Stripe API client
//!
//! The reconcilers only need three read calls from Stripe. They go through
//! the [`PaymentProvider`] trait so tests can substitute canned responses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::error::ProviderError;
use crate::stripe::events::{LineItem, List, PaymentIntent, Subscription};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Upper bound on a single Stripe request, connect through body
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read access to the payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync + 'static {
    /// Retrieve a payment intent by id
    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError>;

    /// List the line items of a checkout session
    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItem>, ProviderError>;

    /// List a customer's subscriptions, most recent first
    ///
    /// Includes every status (canceled too) with the price and default
    /// payment method expanded.
    async fn list_subscriptions(
        &self,
        customer_id: &str,
        limit: u32,
    ) -> Result<Vec<Subscription>, ProviderError>;
}

/// REST client for the Stripe API
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl StripeClient {
    /// Create a client for the live Stripe API
    pub fn new(secret_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(secret_key, STRIPE_API_BASE, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client against another base URL (stripe-mock, proxies)
    pub fn with_base_url(
        secret_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            secret_key: secret_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(path, status = status.as_u16(), "Stripe API returned an error");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Decode(format!("{path}: {e}")))
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError> {
        self.get(&format!("/payment_intents/{id}"), &[]).await
    }

    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItem>, ProviderError> {
        let list: List<LineItem> = self
            .get(
                &format!("/checkout/sessions/{session_id}/line_items"),
                &[("limit", "100".to_string())],
            )
            .await?;
        Ok(list.data)
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
        limit: u32,
    ) -> Result<Vec<Subscription>, ProviderError> {
        let list: List<Subscription> = self
            .get(
                "/subscriptions",
                &[
                    ("customer", customer_id.to_string()),
                    ("limit", limit.to_string()),
                    ("status", "all".to_string()),
                    ("expand[]", "data.default_payment_method".to_string()),
                    ("expand[]", "data.items.data.price".to_string()),
                ],
            )
            .await?;
        Ok(list.data)
    }
}
