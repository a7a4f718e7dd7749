//! Ready-made definitions for common business processes.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::definition::{SagaDefinition, StepDefinition};
use crate::types::{CompensationStrategy, ExecutionMode, SagaType};

/// Order placement: inventory and payment in parallel once the order is valid.
pub fn order_processing(config: &EngineConfig) -> SagaDefinition {
    config
        .definition("order-processing", SagaType::OrderProcessing)
        .execution_mode(ExecutionMode::Mixed)
        .step(StepDefinition::new("validate_order", "orders", "/orders/validate"))
        .step(
            StepDefinition::new("reserve_inventory", "inventory", "/inventory/reserve")
                .depends_on("validate_order")
                .compensate_with(CompensationStrategy::Automatic, "/inventory/release"),
        )
        .step(
            StepDefinition::new("process_payment", "payments", "/payments/charge")
                .depends_on("validate_order")
                .timeout(Duration::from_secs(15))
                .compensate_with(CompensationStrategy::Automatic, "/payments/refund"),
        )
        .step(
            StepDefinition::new("create_shipment", "shipping", "/shipments")
                .depends_on("reserve_inventory")
                .depends_on("process_payment")
                .compensate_with(CompensationStrategy::BestEffort, "/shipments/cancel"),
        )
        .step(
            StepDefinition::new("send_confirmation", "notifications", "/notifications/order")
                .depends_on("create_shipment"),
        )
}

/// Card payment with a fraud check reserved for large amounts.
pub fn payment_processing(config: &EngineConfig) -> SagaDefinition {
    config
        .definition("payment-processing", SagaType::PaymentProcessing)
        .step(
            StepDefinition::new("authorize_payment", "payments", "/payments/authorize")
                .compensate_with(CompensationStrategy::Automatic, "/payments/void"),
        )
        .step(
            StepDefinition::new("fraud_check", "risk", "/risk/score").condition("amount_gte", 1000),
        )
        .step(
            StepDefinition::new("capture_payment", "payments", "/payments/capture")
                .compensate_with(CompensationStrategy::Automatic, "/payments/refund"),
        )
        .step(
            StepDefinition::new("record_ledger_entry", "ledger", "/ledger/entries")
                .compensate_with(CompensationStrategy::BestEffort, "/ledger/reverse"),
        )
}

/// Wallet top-up from a card.
pub fn wallet_top_up(config: &EngineConfig) -> SagaDefinition {
    config
        .definition("wallet-top-up", SagaType::WalletTopUp)
        .step(
            StepDefinition::new("charge_card", "payments", "/payments/charge")
                .compensate_with(CompensationStrategy::Automatic, "/payments/refund"),
        )
        .step(
            StepDefinition::new("credit_wallet", "wallets", "/wallets/credit")
                .compensate_with(CompensationStrategy::Automatic, "/wallets/debit"),
        )
        .step(StepDefinition::new("notify_user", "notifications", "/notifications/top-up"))
}

/// Identity checks; a manual review runs only when the context asks for one.
pub fn kyc_verification(config: &EngineConfig) -> SagaDefinition {
    config
        .definition("kyc-verification", SagaType::KycVerification)
        .execution_mode(ExecutionMode::Mixed)
        .default_timeout(Duration::from_secs(24 * 3600))
        .step(StepDefinition::new("verify_identity", "kyc", "/kyc/identity"))
        .step(StepDefinition::new("verify_address", "kyc", "/kyc/address"))
        .step(
            StepDefinition::new("sanctions_screening", "compliance", "/compliance/screen")
                .depends_on("verify_identity")
                .depends_on("verify_address"),
        )
        .step(
            StepDefinition::new("manual_review", "compliance", "/compliance/review")
                .depends_on("sanctions_screening")
                .condition("requires_manual_review", true)
                .timeout(Duration::from_secs(3600)),
        )
        .step(
            StepDefinition::new("approve_account", "accounts", "/accounts/approve")
                .depends_on("manual_review")
                .compensation(CompensationStrategy::Manual),
        )
}

/// Merchant onboarding: payments, storefront and compliance fan out from shop creation.
pub fn shop_onboarding(config: &EngineConfig) -> SagaDefinition {
    config
        .definition("shop-onboarding", SagaType::ShopOnboarding)
        .execution_mode(ExecutionMode::Mixed)
        .step(
            StepDefinition::new("create_shop", "shops", "/shops")
                .compensate_with(CompensationStrategy::Automatic, "/shops/delete"),
        )
        .step(
            StepDefinition::new("setup_payouts", "payments", "/payouts/setup")
                .depends_on("create_shop")
                .compensate_with(CompensationStrategy::Automatic, "/payouts/disable"),
        )
        .step(
            StepDefinition::new("configure_storefront", "storefront", "/storefronts")
                .depends_on("create_shop")
                .compensate_with(CompensationStrategy::BestEffort, "/storefronts/reset"),
        )
        .step(
            StepDefinition::new("merchant_kyc", "kyc", "/kyc/merchant")
                .depends_on("create_shop")
                .compensation(CompensationStrategy::Manual),
        )
        .step(
            StepDefinition::new("activate_shop", "shops", "/shops/activate")
                .depends_on("setup_payouts")
                .depends_on("configure_storefront")
                .depends_on("merchant_kyc"),
        )
}

/// Every built-in blueprint.
pub fn all(config: &EngineConfig) -> Vec<SagaDefinition> {
    vec![
        order_processing(config),
        payment_processing(config),
        wallet_top_up(config),
        kyc_verification(config),
        shop_onboarding(config),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ExecutionPlanner;

    #[test]
    fn test_blueprints_are_valid() {
        for definition in all(&EngineConfig::default()) {
            assert!(
                definition.validate().is_ok(),
                "{} should validate",
                definition.name
            );
        }
    }

    #[test]
    fn test_blueprint_types_are_distinct() {
        let mut types: Vec<_> = all(&EngineConfig::default())
            .iter()
            .map(|d| d.saga_type)
            .collect();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), 5);
    }

    #[test]
    fn test_order_processing_levels() {
        let definition = order_processing(&EngineConfig::default());
        let graph: Vec<(&str, &[String])> = definition
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s.dependencies.as_slice()))
            .collect();

        let levels = ExecutionPlanner::dependency_levels(&graph).unwrap();
        assert_eq!(levels, vec![vec![0], vec![1, 2], vec![3], vec![4]]);
    }
}
