//! Stripe API types.

use serde::Deserialize;

/// Stripe customer object.
#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    /// Stripe customer ID.
    pub id: String,
    /// Customer email.
    #[serde(default)]
    pub email: Option<String>,
    /// Invoice settings, including the default payment method.
    #[serde(default)]
    pub invoice_settings: Option<InvoiceSettings>,
    /// Metadata attached to the customer.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Customer {
    /// The payment method charged off-session, if one is on file.
    #[must_use]
    pub fn default_payment_method(&self) -> Option<&str> {
        self.invoice_settings
            .as_ref()
            .and_then(|s| s.default_payment_method.as_deref())
    }
}

/// Customer invoice settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceSettings {
    /// Default payment method ID.
    #[serde(default)]
    pub default_payment_method: Option<String>,
}

/// Stripe `PaymentIntent` object.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    /// Payment intent ID.
    pub id: String,
    /// Amount in cents.
    #[serde(default)]
    pub amount: i64,
    /// Currency (e.g., "usd").
    #[serde(default)]
    pub currency: String,
    /// Status (succeeded, processing, `requires_action`, etc.).
    #[serde(default)]
    pub status: String,
    /// Customer ID.
    #[serde(default)]
    pub customer: Option<String>,
}

/// Stripe customer balance transaction.
///
/// A negative amount is a credit the customer can spend on future invoices.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerBalanceTransaction {
    /// Transaction ID.
    pub id: String,
    /// Signed amount in cents.
    pub amount: i64,
    /// Currency.
    #[serde(default)]
    pub currency: String,
    /// Customer balance after the transaction.
    #[serde(default)]
    pub ending_balance: i64,
}

/// Stripe search result wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeSearchResult<T> {
    /// Matching items.
    pub data: Vec<T>,
    /// Whether there are more items.
    #[serde(default)]
    pub has_more: bool,
}

/// Stripe API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorResponse {
    /// Error details.
    pub error: StripeErrorDetail,
}

/// Stripe error detail.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorDetail {
    /// Error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Error code.
    #[serde(default)]
    pub code: Option<String>,
}
