//! Step activation conditions.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::context::SagaContext;

/// Evaluates a step's activation conditions against the saga context.
///
/// All conditions must hold. Well-known keys:
/// - `country`, `currency`: equality with the context field
/// - `amount_gte`, `amount_lte`: numeric bounds on `context.amount`
///
/// Any other key is compared for equality with the context's data map.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Returns true if the step should run.
    pub fn should_execute(conditions: &BTreeMap<String, Value>, context: &SagaContext) -> bool {
        conditions
            .iter()
            .all(|(key, expected)| Self::holds(key, expected, context))
    }

    /// Returns the first condition key that doesn't hold, if any.
    pub fn first_mismatch<'a>(
        conditions: &'a BTreeMap<String, Value>,
        context: &SagaContext,
    ) -> Option<&'a str> {
        conditions
            .iter()
            .find(|(key, expected)| !Self::holds(key, expected, context))
            .map(|(key, _)| key.as_str())
    }

    fn holds(key: &str, expected: &Value, context: &SagaContext) -> bool {
        match key {
            "country" => str_matches(context.country.as_deref(), expected),
            "currency" => str_matches(context.currency.as_deref(), expected),
            "amount_gte" => match (context.amount, expected.as_f64()) {
                (Some(amount), Some(bound)) => amount >= bound,
                _ => false,
            },
            "amount_lte" => match (context.amount, expected.as_f64()) {
                (Some(amount), Some(bound)) => amount <= bound,
                _ => false,
            },
            other => context
                .data
                .get(other)
                .is_some_and(|actual| values_equal(actual, expected)),
        }
    }
}

fn str_matches(actual: Option<&str>, expected: &Value) -> bool {
    match (actual, expected.as_str()) {
        (Some(actual), Some(expected)) => actual == expected,
        _ => false,
    }
}

/// JSON equality where numbers compare by value (`1` equals `1.0`).
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => actual == expected,
    }
}
