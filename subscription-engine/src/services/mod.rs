//! Services module for subscription-engine.

pub mod clock;
pub mod database;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use database::PgStore;
pub use gateway::{ChargeRequest, ChargeResult, ChargeStatus, HttpPaymentGateway, PaymentGateway};
pub use memory::InMemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_billing_attempt, record_error,
    record_gateway_charge_duration, record_period_roll, record_quota_denial, record_transition,
    record_usage_increment,
};
pub use store::{
    AtomicCounterStore, EngineStore, LedgerStore, PlanStore, SubscriptionStore, TransitionCommit,
};
