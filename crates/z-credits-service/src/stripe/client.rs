//! Stripe API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use z_credits_core::UserId;

use super::types::{
    Customer, CustomerBalanceTransaction, PaymentIntent, StripeErrorResponse, StripeSearchResult,
};
use crate::collaborators::{GatewayError, PaymentGateway, Receipt, SettlementRequest};

/// Error type for Stripe operations.
#[derive(Debug, thiserror::Error)]
pub enum StripeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Stripe API returned an error.
    #[error("Stripe API error: {error_type} - {message}")]
    Api {
        /// Error type.
        error_type: String,
        /// Error message.
        message: String,
        /// Error code.
        code: Option<String>,
    },

    /// No Stripe customer carries the user's ID.
    #[error("no Stripe customer for user {0}")]
    CustomerNotFound(String),

    /// The customer has no payment method to charge off-session.
    #[error("customer {0} has no default payment method")]
    NoPaymentMethod(String),

    /// The payment did not complete synchronously.
    #[error("payment intent {id} ended in status {status}")]
    Incomplete {
        /// Payment intent ID.
        id: String,
        /// Final status reported by Stripe.
        status: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<StripeError> for GatewayError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::Http(e) => Self::Unavailable(e.to_string()),
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Stripe-backed payment gateway.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    api_key: String,
    base_url: String,
}

impl StripeGateway {
    /// Stripe API base URL.
    const BASE_URL: &'static str = "https://api.stripe.com/v1";

    /// Create a gateway against the live Stripe API.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Stripe secret API key (`sk_test_...` or `sk_live_...`)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self, StripeError> {
        Self::with_base_url(api_key, Self::BASE_URL)
    }

    /// Create a gateway against a custom base URL (e.g. a mock server).
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or the HTTP client cannot be built.
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, StripeError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(StripeError::Configuration("API key is empty".into()));
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Find the Stripe customer registered for a user.
    ///
    /// # Errors
    ///
    /// Returns `StripeError::CustomerNotFound` if no customer carries the
    /// user's ID in its metadata.
    pub async fn find_customer(&self, user_id: &UserId) -> Result<Customer, StripeError> {
        let query = format!("metadata['user_id']:'{user_id}'");

        let response = self
            .client
            .get(format!("{}/customers/search", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .query(&[("query", query.as_str()), ("limit", "1")])
            .send()
            .await?;

        let result: StripeSearchResult<Customer> = self.handle_response(response).await?;
        result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| StripeError::CustomerNotFound(user_id.to_string()))
    }

    /// Charge a user's default payment method off-session.
    ///
    /// # Errors
    ///
    /// Returns an error unless the payment intent reaches `succeeded`.
    pub async fn create_charge(
        &self,
        request: &SettlementRequest,
    ) -> Result<PaymentIntent, StripeError> {
        let customer = self.find_customer(&request.user_id).await?;
        let payment_method = customer
            .default_payment_method()
            .ok_or_else(|| StripeError::NoPaymentMethod(customer.id.clone()))?;

        let params = [
            ("amount", request.amount_cents.to_string()),
            ("currency", "usd".to_string()),
            ("customer", customer.id.clone()),
            ("payment_method", payment_method.to_string()),
            ("confirm", "true".to_string()),
            ("off_session", "true".to_string()),
            ("description", request.description.clone()),
            ("metadata[user_id]", request.user_id.to_string()),
            ("metadata[proration_event_id]", request.event_id.to_string()),
        ];

        tracing::debug!(
            user_id = %request.user_id,
            event_id = %request.event_id,
            amount_cents = request.amount_cents,
            "Creating Stripe payment intent"
        );

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .header("Idempotency-Key", request.event_id.to_string())
            .form(&params)
            .send()
            .await?;

        let intent: PaymentIntent = self.handle_response(response).await?;
        if intent.status != "succeeded" {
            return Err(StripeError::Incomplete {
                id: intent.id,
                status: intent.status,
            });
        }
        Ok(intent)
    }

    /// Credit a user's customer balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the customer cannot be found or Stripe rejects the
    /// transaction.
    pub async fn create_credit(
        &self,
        request: &SettlementRequest,
    ) -> Result<CustomerBalanceTransaction, StripeError> {
        let customer = self.find_customer(&request.user_id).await?;

        // Negative amounts credit the customer.
        let params = [
            ("amount", (-request.amount_cents).to_string()),
            ("currency", "usd".to_string()),
            ("description", request.description.clone()),
            ("metadata[user_id]", request.user_id.to_string()),
            ("metadata[proration_event_id]", request.event_id.to_string()),
        ];

        tracing::debug!(
            user_id = %request.user_id,
            event_id = %request.event_id,
            amount_cents = request.amount_cents,
            "Creating Stripe customer balance credit"
        );

        let response = self
            .client
            .post(format!(
                "{}/customers/{}/balance_transactions",
                self.base_url, customer.id
            ))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .header("Idempotency-Key", request.event_id.to_string())
            .form(&params)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, StripeError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        // Try to parse error response
        let error_body: Result<StripeErrorResponse, _> = response.json().await;

        match error_body {
            Ok(stripe_error) => Err(StripeError::Api {
                error_type: stripe_error.error.error_type,
                message: stripe_error.error.message,
                code: stripe_error.error.code,
            }),
            Err(_) => Err(StripeError::Api {
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn settle_charge(&self, request: &SettlementRequest) -> Result<Receipt, GatewayError> {
        let intent = self.create_charge(request).await?;
        Ok(Receipt {
            invoice_id: intent.id,
        })
    }

    async fn issue_credit(&self, request: &SettlementRequest) -> Result<Receipt, GatewayError> {
        let transaction = self.create_credit(request).await?;
        Ok(Receipt {
            invoice_id: transaction.id,
        })
    }
}
