//! Value types shared by definitions, sagas and steps.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Error code recorded when a step or compensation call exceeds its timeout.
pub const TIMEOUT_ERROR_CODE: &str = "TIMEOUT";

/// Error code recorded when the executor task panicked.
pub const EXECUTOR_PANIC_ERROR_CODE: &str = "EXECUTOR_PANIC";

/// Error code recorded when a pending retry is abandoned because the saga expired.
pub const SAGA_EXPIRED_ERROR_CODE: &str = "SAGA_EXPIRED";

/// Error code recorded when a pending retry is abandoned because the saga was cancelled.
pub const CANCELLED_ERROR_CODE: &str = "CANCELLED";

/// The fixed catalog of business processes the platform runs as sagas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaType {
    OrderProcessing,
    PaymentProcessing,
    UserRegistration,
    KycVerification,
    WalletTopUp,
    WalletWithdrawal,
    ShopOnboarding,
    ProductListing,
    OrderFulfillment,
    RefundProcessing,
    AccountClosure,
    DataMigration,
    SystemMaintenance,
}

impl SagaType {
    /// Every recognised saga type.
    pub const ALL: [SagaType; 13] = [
        SagaType::OrderProcessing,
        SagaType::PaymentProcessing,
        SagaType::UserRegistration,
        SagaType::KycVerification,
        SagaType::WalletTopUp,
        SagaType::WalletWithdrawal,
        SagaType::ShopOnboarding,
        SagaType::ProductListing,
        SagaType::OrderFulfillment,
        SagaType::RefundProcessing,
        SagaType::AccountClosure,
        SagaType::DataMigration,
        SagaType::SystemMaintenance,
    ];

    /// Returns the type name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaType::OrderProcessing => "order_processing",
            SagaType::PaymentProcessing => "payment_processing",
            SagaType::UserRegistration => "user_registration",
            SagaType::KycVerification => "kyc_verification",
            SagaType::WalletTopUp => "wallet_top_up",
            SagaType::WalletWithdrawal => "wallet_withdrawal",
            SagaType::ShopOnboarding => "shop_onboarding",
            SagaType::ProductListing => "product_listing",
            SagaType::OrderFulfillment => "order_fulfillment",
            SagaType::RefundProcessing => "refund_processing",
            SagaType::AccountClosure => "account_closure",
            SagaType::DataMigration => "data_migration",
            SagaType::SystemMaintenance => "system_maintenance",
        }
    }
}

impl std::fmt::Display for SagaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown saga type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown saga type '{0}'")]
pub struct UnknownSagaType(pub String);

impl FromStr for SagaType {
    type Err = UnknownSagaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownSagaType(s.to_string()))
    }
}

/// How the steps of a saga are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time in definition order; dependencies are ignored.
    #[default]
    Sequential,
    /// All steps at once; only for steps known to be independent.
    Parallel,
    /// Dependency-driven levels.
    Mixed,
}

impl ExecutionMode {
    /// Returns the mode name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Mixed => "mixed",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to a completed step when the saga rolls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Nothing to undo; the step stays completed.
    #[default]
    None,
    /// Call the compensation endpoint; a failure halts the rollback.
    Automatic,
    /// Call the compensation endpoint; a failure is recorded and the rollback continues.
    BestEffort,
    /// Leave the step for an operator to compensate.
    Manual,
}

impl CompensationStrategy {
    /// Returns true if the coordinator calls a compensation endpoint for this strategy.
    pub fn calls_endpoint(&self) -> bool {
        matches!(
            self,
            CompensationStrategy::Automatic | CompensationStrategy::BestEffort
        )
    }

    /// Returns the strategy name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStrategy::None => "none",
            CompensationStrategy::Automatic => "automatic",
            CompensationStrategy::BestEffort => "best_effort",
            CompensationStrategy::Manual => "manual",
        }
    }
}

impl std::fmt::Display for CompensationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry configuration for a step (or the saga-wide default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub interval: Duration,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Cap on the nominal (pre-jitter) delay.
    pub max_interval: Duration,
    /// Error codes that may be retried.
    #[serde(default)]
    pub retry_on: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(300),
            retry_on: vec![
                "SERVICE_UNAVAILABLE".to_string(),
                "NETWORK_ERROR".to_string(),
                "RATE_LIMITED".to_string(),
            ],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            retry_on: Vec::new(),
            ..Self::default()
        }
    }

    /// Returns true if `error_code` is listed as retryable.
    pub fn is_retryable(&self, error_code: &str) -> bool {
        self.retry_on.iter().any(|code| code == error_code)
    }

    /// Checks that the policy's numbers make sense.
    pub fn validate(&self, owner: &str) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidRetryPolicy {
            owner: owner.to_string(),
            reason: reason.to_string(),
        };
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(invalid("backoff factor must be a finite number >= 1.0"));
        }
        if self.max_interval < self.interval {
            return Err(invalid("max interval must not be shorter than interval"));
        }
        Ok(())
    }
}

/// Frozen per-step configuration, copied from the definition at instantiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfiguration {
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    pub timeout: Duration,
    /// Falls back to the saga-level policy when absent.
    pub retry_policy: Option<RetryPolicy>,
    pub compensation_strategy: CompensationStrategy,
    pub compensation_endpoint: Option<String>,
    /// Names of steps that must be satisfied first (mixed mode only).
    pub dependencies: Vec<String>,
    /// Activation predicate; empty means always run.
    pub conditions: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, String>,
}

/// One attempt to execute a step. Never edited after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// 1-based attempt number.
    pub attempt: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub output: Value,
}

impl ExecutionResult {
    /// A successful attempt carrying `output`.
    pub fn success(output: Value) -> Self {
        Self {
            attempt: 0,
            success: true,
            status_code: Some(200),
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
            duration_ms: 0,
            output,
        }
    }

    /// A failed attempt.
    pub fn failure(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attempt: 0,
            success: false,
            status_code: None,
            error_code: Some(error_code.into()),
            error_message: Some(message.into()),
            timestamp: Utc::now(),
            duration_ms: 0,
            output: Value::Null,
        }
    }

    /// Sets the response status code.
    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// One attempt to compensate a step. Never edited after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub output: Value,
}

impl CompensationResult {
    /// A successful compensation.
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            status_code: Some(200),
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
            duration_ms: 0,
            output,
        }
    }

    /// A failed compensation.
    pub fn failure(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            error_code: Some(error_code.into()),
            error_message: Some(message.into()),
            timestamp: Utc::now(),
            duration_ms: 0,
            output: Value::Null,
        }
    }
}
