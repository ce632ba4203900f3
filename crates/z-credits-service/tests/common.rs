//! Common test utilities for z-credits integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use z_credits_core::{
    BillingInterval, CreditDeduction, PriceBook, Subscription, SubscriptionId,
    SubscriptionStatus, Tier, UserId,
};
use z_credits_service::{
    CreditLedger, DowngradeCreditMode, GatewayError, LedgerConfig, PaymentGateway, Receipt,
    SettlementRequest, SubscriptionDirectory,
};
use z_credits_store::{RocksStore, Store, StoreTx};

/// How the fake payment gateway answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentBehavior {
    /// Every call succeeds.
    Succeed,
    /// Every call is declined.
    Decline,
    /// Every call hangs forever.
    Hang,
}

/// In-memory payment gateway that records what it was asked to do.
pub struct FakePayments {
    behavior: Mutex<PaymentBehavior>,
    pub charges: Mutex<Vec<SettlementRequest>>,
    pub credits: Mutex<Vec<SettlementRequest>>,
}

impl FakePayments {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(PaymentBehavior::Succeed),
            charges: Mutex::new(Vec::new()),
            credits: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: PaymentBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    pub fn credit_count(&self) -> usize {
        self.credits.lock().unwrap().len()
    }

    async fn respond(&self, prefix: &str, request: &SettlementRequest) -> Result<Receipt, GatewayError> {
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            PaymentBehavior::Succeed => Ok(Receipt {
                invoice_id: format!("{prefix}_{}", request.event_id),
            }),
            PaymentBehavior::Decline => Err(GatewayError::Rejected("card declined".into())),
            PaymentBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for FakePayments {
    async fn settle_charge(&self, request: &SettlementRequest) -> Result<Receipt, GatewayError> {
        self.charges.lock().unwrap().push(request.clone());
        self.respond("pi", request).await
    }

    async fn issue_credit(&self, request: &SettlementRequest) -> Result<Receipt, GatewayError> {
        self.credits.lock().unwrap().push(request.clone());
        self.respond("cbtxn", request).await
    }
}

/// In-memory subscription directory.
pub struct FakeSubscriptions {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    fail_changes: Mutex<bool>,
}

impl FakeSubscriptions {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            fail_changes: Mutex::new(false),
        }
    }

    pub fn insert(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id, subscription);
    }

    pub fn get(&self, subscription_id: &SubscriptionId) -> Subscription {
        self.subscriptions.lock().unwrap()[subscription_id].clone()
    }

    pub fn fail_changes(&self, fail: bool) {
        *self.fail_changes.lock().unwrap() = fail;
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if *self.fail_changes.lock().unwrap() {
            return Err(GatewayError::Unavailable("subscription service down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionDirectory for FakeSubscriptions {
    async fn get_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<Subscription>, GatewayError> {
        Ok(self.subscriptions.lock().unwrap().get(subscription_id).cloned())
    }

    async fn advance_tier(
        &self,
        subscription_id: &SubscriptionId,
        tier: &Tier,
        interval: BillingInterval,
    ) -> Result<(), GatewayError> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| GatewayError::Rejected("unknown subscription".into()))?;
        subscription.tier = tier.clone();
        subscription.interval = interval;
        Ok(())
    }

    async fn cancel(&self, subscription_id: &SubscriptionId) -> Result<(), GatewayError> {
        self.check_available()?;
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| GatewayError::Rejected("unknown subscription".into()))?;
        subscription.status = SubscriptionStatus::Cancelled;
        Ok(())
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The ledger under test.
    pub ledger: Arc<CreditLedger>,
    /// Direct store access for seeding facts and inspecting rows.
    pub store: Arc<RocksStore>,
    /// Fake subscription management.
    pub subscriptions: Arc<FakeSubscriptions>,
    /// Fake payment gateway.
    pub payments: Arc<FakePayments>,
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: TempDir,
}

impl TestHarness {
    /// Create a new test harness with a fresh database.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Create a harness with ledger downgrade credits paid through the gateway.
    pub fn with_payment_credits() -> Self {
        Self::with_config(LedgerConfig {
            downgrade_credit_mode: DowngradeCreditMode::Payment,
            ..test_config()
        })
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(
            RocksStore::open(temp_dir.path(), &config.store_options())
                .expect("Failed to open store"),
        );
        let subscriptions = Arc::new(FakeSubscriptions::new());
        let payments = Arc::new(FakePayments::new());

        let ledger = CreditLedger::new(
            store.clone(),
            subscriptions.clone(),
            payments.clone(),
            &config,
        );

        Self {
            ledger: Arc::new(ledger),
            store,
            subscriptions,
            payments,
            _temp_dir: temp_dir,
        }
    }

    /// Register an active monthly subscription with 10 of 30 days left.
    pub fn subscription(&self, user_id: UserId, tier: &str) -> Subscription {
        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::generate(),
            user_id,
            tier: Tier::new(tier),
            status: SubscriptionStatus::Active,
            interval: BillingInterval::Monthly,
            billing_cycle_start: now - chrono::Duration::days(20),
            billing_cycle_end: now + chrono::Duration::days(10) - chrono::Duration::seconds(30),
            prices: price_book(),
        };
        self.subscriptions.insert(subscription.clone());
        subscription
    }

    /// Append a deduction the way the metering side does.
    pub fn record_deduction(&self, user_id: UserId, amount: i64) -> CreditDeduction {
        let deduction = CreditDeduction::new(user_id, amount, "inference");
        let mut tx = self.store.begin().unwrap();
        tx.lock_balance(&user_id).unwrap();
        tx.insert_deduction(&deduction).unwrap();
        tx.commit().unwrap();
        deduction
    }

    /// Cached balance amount, straight from the store.
    pub fn cached_amount(&self, user_id: &UserId) -> Option<i64> {
        self.store.get_balance(user_id).unwrap().map(|b| b.amount)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Ledger configuration tuned for fast tests.
pub fn test_config() -> LedgerConfig {
    LedgerConfig {
        retry_max_attempts: 10,
        retry_initial_backoff_ms: 5,
        retry_max_backoff_ms: 50,
        lock_timeout_ms: 2000,
        settlement_timeout_seconds: 1,
        ..LedgerConfig::default()
    }
}

/// Prices used across tests, in cents per month.
pub fn price_book() -> PriceBook {
    PriceBook::new()
        .with_tier("free", 0)
        .with_tier("pro", 1900)
        .with_tier("team", 1900)
        .with_tier("pro_max", 4500)
}

/// A fixed instant, for deterministic calculator tests.
pub fn frozen_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 21, 12, 0, 0).unwrap()
}

/// Upper bound for anything the harness waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);
