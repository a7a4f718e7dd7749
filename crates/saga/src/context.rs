//! Business payload carried by a saga run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form business context attached to a saga.
///
/// Fixed once the saga starts; step outputs accumulate on the saga's output
/// data instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaContext {
    pub user_id: Option<String>,
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub wallet_id: Option<String>,
    pub shop_id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub locale: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub trace_id: Option<String>,
    /// Anything that doesn't fit a dedicated field.
    pub data: BTreeMap<String, Value>,
}

impl SagaContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_wallet(mut self, wallet_id: impl Into<String>) -> Self {
        self.wallet_id = Some(wallet_id.into());
        self
    }

    /// Sets the monetary amount and its currency.
    pub fn with_amount(mut self, amount: f64, currency: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.currency = Some(currency.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Adds a free-form data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Returns the correlation ID, or an empty string when unset.
    pub fn correlation_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let ctx = SagaContext::new()
            .with_user("u-1")
            .with_amount(1500.0, "KES")
            .with_country("KE")
            .with_data("tier", "gold");

        assert_eq!(ctx.user_id.as_deref(), Some("u-1"));
        assert_eq!(ctx.amount, Some(1500.0));
        assert_eq!(ctx.currency.as_deref(), Some("KES"));
        assert_eq!(ctx.country.as_deref(), Some("KE"));
        assert_eq!(ctx.data.get("tier"), Some(&Value::from("gold")));
    }

    #[test]
    fn test_deserializes_with_missing_fields() {
        let ctx: SagaContext = serde_json::from_str(r#"{"amount": 10.5}"#).unwrap();
        assert_eq!(ctx.amount, Some(10.5));
        assert!(ctx.data.is_empty());
        assert_eq!(ctx.correlation_id(), "");
    }
}
