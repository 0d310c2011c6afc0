//! Test helpers for subscription-engine integration tests.
//!
//! Builds an engine over the in-memory store with a hand-driven clock and a
//! scripted payment gateway.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subscription_engine::config::{
    BillingPolicy, DatabaseConfig, EngineConfig, GatewayConfig, SchedulerConfig,
};
use subscription_engine::engine::{Deadline, Engine};
use subscription_engine::error::EngineError;
use subscription_engine::models::{
    BillingCycle, BillingEntry, CreatePlan, IdempotencyToken, NewBillingEntry, Owner,
    PaymentStatus, Plan, PlanFeatures, PlanLimits, StartTrial, Subscription,
};
use subscription_engine::services::{
    init_metrics, ChargeRequest, ChargeResult, ChargeStatus, InMemoryStore, ManualClock,
    PaymentGateway, PgStore,
};
use subscription_engine::startup::Application;
use uuid::Uuid;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Database URL for Postgres-backed tests, if one is configured.
pub fn test_database_url() -> Option<String> {
    dotenvy::dotenv().ok();
    std::env::var("TEST_DATABASE_URL").ok()
}

fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_subscriptions_{}_{}", std::process::id(), counter)
}

/// Create an empty schema and return a database URL scoped to it. Returns
/// `None` when no test database is configured so the caller can skip.
pub async fn test_schema_url() -> Option<String> {
    let base_url = test_database_url()?;
    let schema_name = unique_schema_name();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&base_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
        .execute(&pool)
        .await
        .ok();
    sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
        .execute(&pool)
        .await
        .expect("Failed to create test schema");
    pool.close().await;

    let separator = if base_url.contains('?') { "&" } else { "?" };
    Some(format!(
        "{}{}options=-c search_path%3D{}",
        base_url, separator, schema_name
    ))
}

/// Connect to a fresh, migrated schema.
pub async fn pg_store() -> Option<Arc<PgStore>> {
    let url = test_schema_url().await?;
    let store = PgStore::new(&url, 10, 1)
        .await
        .expect("Failed to create test store");
    store
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    Some(Arc::new(store))
}

pub fn utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn token(value: &str) -> IdempotencyToken {
    IdempotencyToken::new(value).unwrap()
}

/// What the gateway does with the next charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Paid,
    Declined,
    Unreachable,
    /// Never answers; the engine's payment timeout fires first.
    Hang,
}

/// Gateway that plays back scripted outcomes and counts charges per
/// idempotency key.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Scripted>,
    charges: Mutex<HashMap<String, usize>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Scripted::Paid),
            charges: Mutex::new(HashMap::new()),
        }
    }

    /// Queue outcomes for the next charges, in order.
    pub fn push(&self, outcome: Scripted) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Outcome once the queue is empty.
    pub fn always(&self, outcome: Scripted) {
        *self.fallback.lock().unwrap() = outcome;
    }

    pub fn charges_for(&self, idempotency_key: &str) -> usize {
        self.charges
            .lock()
            .unwrap()
            .get(idempotency_key)
            .copied()
            .unwrap_or(0)
    }

    /// Distinct billing rows that were charged.
    pub fn distinct_keys(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    pub fn total_charges(&self) -> usize {
        self.charges.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResult, EngineError> {
        *self
            .charges
            .lock()
            .unwrap()
            .entry(request.idempotency_key())
            .or_insert(0) += 1;

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap());

        match outcome {
            Scripted::Paid => Ok(ChargeResult {
                status: ChargeStatus::Paid,
                reference: Some(format!("ch_{}", request.billing_history_id.simple())),
                failure_reason: None,
            }),
            Scripted::Declined => Ok(ChargeResult {
                status: ChargeStatus::Failed,
                reference: None,
                failure_reason: Some("card_declined".to_string()),
            }),
            Scripted::Unreachable => Err(EngineError::PaymentGatewayFailure(
                "connection refused".to_string(),
            )),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err(EngineError::PaymentGatewayTimeout)
            }
        }
    }
}

pub fn test_policy() -> BillingPolicy {
    BillingPolicy {
        trial_length_days: 14,
        grace_period_days: 7,
        payment_timeout_secs: 5,
        default_limits: PlanLimits::default(),
        default_currency: "USD".to_string(),
    }
}

/// Service configuration for tests: random local port, no scheduler.
pub fn test_config(database_url: &str) -> EngineConfig {
    EngineConfig {
        common: service_core::config::Config {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        },
        service_name: "subscription-engine".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: String::new(),
        database: DatabaseConfig {
            url: database_url.to_string(),
            max_connections: 5,
            min_connections: 1,
        },
        billing: test_policy(),
        scheduler: SchedulerConfig {
            enabled: false,
            tick_secs: 60,
            batch_size: 100,
        },
        payment_gateway: GatewayConfig {
            base_url: "http://127.0.0.1:9".to_string(),
        },
    }
}

/// A running service bound to a random port.
pub struct TestApp {
    pub http_address: String,
}

impl TestApp {
    /// Spawn the service against a fresh schema. `None` when no test
    /// database is configured.
    pub async fn spawn() -> Option<Self> {
        init_metrics();

        let url = test_schema_url().await?;
        let app = Application::build(test_config(&url))
            .await
            .expect("Failed to build application");
        let http_address = format!("http://127.0.0.1:{}", app.http_port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the HTTP server by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Some(TestApp { http_address })
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<ScriptedGateway>,
}

impl TestEngine {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_policy(start, test_policy())
    }

    pub fn with_policy(start: DateTime<Utc>, policy: BillingPolicy) -> Self {
        init_metrics();

        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start));
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = Engine::new(store.clone(), clock.clone(), policy, gateway.clone());

        Self {
            engine,
            store,
            clock,
            gateway,
        }
    }

    pub fn set_time(&self, to: DateTime<Utc>) {
        self.clock.set(to);
    }

    pub async fn plan(&self, limits: PlanLimits) -> Plan {
        self.plan_with(limits, PlanFeatures::default(), BillingCycle::Monthly)
            .await
    }

    pub async fn plan_with(
        &self,
        limits: PlanLimits,
        features: PlanFeatures,
        billing_cycle: BillingCycle,
    ) -> Plan {
        self.engine
            .create_plan(
                Deadline::none(),
                &CreatePlan {
                    name: "Team".to_string(),
                    description: Some("For small teams".to_string()),
                    price: Decimal::new(4900, 2),
                    currency: "USD".to_string(),
                    billing_cycle,
                    features,
                    limits,
                },
            )
            .await
            .unwrap()
    }

    /// Start a trial for a fresh user.
    pub async fn subscribe(&self, plan: &Plan, auto_renew: bool) -> Subscription {
        self.subscribe_owner(Owner::User(Uuid::new_v4()), plan, auto_renew)
            .await
    }

    pub async fn subscribe_owner(&self, owner: Owner, plan: &Plan, auto_renew: bool) -> Subscription {
        self.engine
            .start_trial(
                Deadline::none(),
                &StartTrial {
                    owner,
                    plan_id: plan.plan_id,
                    auto_renew,
                    payment_method: Some("pm_card_visa".to_string()),
                    token: token(&format!("signup-{}", Uuid::new_v4())),
                },
            )
            .await
            .unwrap()
            .subscription
    }

    /// Record a pending billing row for the subscription's current terms.
    pub async fn attempt(&self, subscription_id: Uuid, key: &str) -> BillingEntry {
        let subscription = self.reload(subscription_id).await;
        self.engine
            .record_attempt(
                Deadline::none(),
                &NewBillingEntry::for_terms(
                    subscription_id,
                    key,
                    &subscription.terms,
                    subscription.payment_method.clone(),
                ),
            )
            .await
            .unwrap()
    }

    /// Record a billing row and resolve it with `status`.
    pub async fn resolved_attempt(
        &self,
        subscription_id: Uuid,
        key: &str,
        status: PaymentStatus,
    ) -> BillingEntry {
        let entry = self.attempt(subscription_id, key).await;
        self.engine
            .resolve_attempt(
                Deadline::none(),
                entry.billing_history_id,
                status,
                Some(format!("ch_{}", key)),
            )
            .await
            .unwrap()
            .entry
    }

    pub async fn reload(&self, subscription_id: Uuid) -> Subscription {
        self.engine
            .get_subscription(Deadline::none(), subscription_id)
            .await
            .unwrap()
    }
}
