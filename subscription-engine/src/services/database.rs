//! Postgres store for subscription-engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AttemptResolution, BillingCycle, BillingEntry, IdempotencyToken, ListPlansFilter,
    ListSubscriptionsFilter, NewBillingEntry, NewPeriod, Owner, PaymentStatus, PeriodChange, Plan,
    PlanFeatures, PlanLimits, PlanTerms, Reservation, Resource, ResolveOutcome, Subscription,
    SubscriptionStatus, TransitionAction, TransitionRecord, UpdatePlan, UsagePeriod,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    AtomicCounterStore, LedgerStore, PlanStore, SubscriptionStore, TransitionCommit,
};

#[derive(FromRow)]
struct PlanRow {
    plan_id: Uuid,
    name: String,
    description: Option<String>,
    price: Decimal,
    currency: String,
    billing_cycle: String,
    features: Json<PlanFeatures>,
    limits: Json<PlanLimits>,
    is_active: bool,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = EngineError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        let billing_cycle = BillingCycle::from_string(&row.billing_cycle).ok_or_else(|| {
            EngineError::Storage(anyhow::anyhow!(
                "Plan {} has unknown billing cycle '{}'",
                row.plan_id,
                row.billing_cycle
            ))
        })?;

        Ok(Plan {
            plan_id: row.plan_id,
            name: row.name,
            description: row.description,
            price: row.price,
            currency: row.currency,
            billing_cycle,
            features: row.features.0,
            limits: row.limits.0,
            is_active: row.is_active,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    user_id: Option<Uuid>,
    organization_id: Option<Uuid>,
    plan_id: Uuid,
    terms: Json<PlanTerms>,
    status: SubscriptionStatus,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    trial_end_date: Option<DateTime<Utc>>,
    auto_renew: bool,
    billing_anchor_day: i16,
    last_payment_date: Option<DateTime<Utc>>,
    next_payment_date: Option<DateTime<Utc>>,
    past_due_since: Option<DateTime<Utc>>,
    payment_method: Option<String>,
    version: i64,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = EngineError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            subscription_id: row.subscription_id,
            owner: Owner::from_columns(row.user_id, row.organization_id)?,
            plan_id: row.plan_id,
            terms: row.terms.0,
            status: row.status,
            start_date: row.start_date,
            end_date: row.end_date,
            trial_end_date: row.trial_end_date,
            auto_renew: row.auto_renew,
            billing_anchor_day: row.billing_anchor_day.clamp(1, 31) as u32,
            last_payment_date: row.last_payment_date,
            next_payment_date: row.next_payment_date,
            past_due_since: row.past_due_since,
            payment_method: row.payment_method,
            version: row.version,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct PeriodRow {
    period_id: Uuid,
    subscription_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    closed_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
}

#[derive(FromRow)]
struct CounterRow {
    period_id: Uuid,
    resource: String,
    used: i64,
}

#[derive(FromRow)]
struct BillingRow {
    billing_history_id: Uuid,
    subscription_id: Uuid,
    attempt_key: String,
    plan_name: String,
    amount: Decimal,
    currency: String,
    status: PaymentStatus,
    paid_at: Option<DateTime<Utc>>,
    payment_method: Option<String>,
    payment_reference: Option<String>,
    invoice_reference: Option<String>,
    created_utc: DateTime<Utc>,
    resolved_utc: Option<DateTime<Utc>>,
}

impl From<BillingRow> for BillingEntry {
    fn from(row: BillingRow) -> Self {
        BillingEntry {
            billing_history_id: row.billing_history_id,
            subscription_id: row.subscription_id,
            attempt_key: row.attempt_key,
            plan_name: row.plan_name,
            amount: row.amount,
            currency: row.currency,
            status: row.status,
            paid_at: row.paid_at,
            payment_method: row.payment_method,
            payment_reference: row.payment_reference,
            invoice_reference: row.invoice_reference,
            created_utc: row.created_utc,
            resolved_utc: row.resolved_utc,
        }
    }
}

#[derive(FromRow)]
struct TransitionRow {
    subscription_id: Uuid,
    token: String,
    action: TransitionAction,
    from_status: Option<SubscriptionStatus>,
    snapshot: Json<Subscription>,
    recorded_utc: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for TransitionRecord {
    type Error = EngineError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(TransitionRecord {
            subscription_id: row.subscription_id,
            token: IdempotencyToken::new(row.token)?,
            action: row.action,
            from_status: row.from_status,
            snapshot: row.snapshot.0,
            recorded_utc: row.recorded_utc,
        })
    }
}

fn to_db_count(value: u64) -> Result<i64, EngineError> {
    i64::try_from(value)
        .map_err(|_| EngineError::Validation(format!("count {} is out of range", value)))
}

fn from_db_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Postgres-backed store. Counter and transition guarantees hold across any
/// number of service instances sharing the database.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, EngineError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), EngineError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Storage(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Attach counters to period rows.
    async fn hydrate_periods(&self, rows: Vec<PeriodRow>) -> Result<Vec<UsagePeriod>, EngineError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.period_id).collect();
        let counters = sqlx::query_as::<_, CounterRow>(
            r#"
            SELECT period_id, resource, used
            FROM usage_counters
            WHERE period_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to load counters: {}", e)))?;

        let mut by_period: BTreeMap<Uuid, BTreeMap<Resource, u64>> = BTreeMap::new();
        for counter in counters {
            by_period
                .entry(counter.period_id)
                .or_default()
                .insert(Resource::from(counter.resource), from_db_count(counter.used));
        }

        Ok(rows
            .into_iter()
            .map(|row| UsagePeriod {
                counters: by_period.remove(&row.period_id).unwrap_or_default(),
                period_id: row.period_id,
                subscription_id: row.subscription_id,
                period_start: row.period_start,
                period_end: row.period_end,
                closed_utc: row.closed_utc,
                created_utc: row.created_utc,
            })
            .collect())
    }
}

/// Close and/or open periods on an open transaction.
async fn apply_period_change_on(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    change: &PeriodChange,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let (close, open) = match change {
        PeriodChange::Keep => return Ok(()),
        PeriodChange::Close {
            period_id,
            closed_at,
        } => (Some((*period_id, *closed_at)), None),
        PeriodChange::Open(next) => (None, Some(next)),
        PeriodChange::Roll {
            period_id,
            closed_at,
            next,
        } => (Some((*period_id, *closed_at)), Some(next)),
    };

    if let Some((period_id, closed_at)) = close {
        let closed = sqlx::query(
            r#"
            UPDATE usage_periods
            SET closed_utc = $3,
                period_end = GREATEST(period_start, LEAST(period_end, $3))
            WHERE period_id = $1 AND subscription_id = $2 AND closed_utc IS NULL
            "#,
        )
        .bind(period_id)
        .bind(subscription_id)
        .bind(closed_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to close period: {}", e)))?
        .rows_affected();

        if closed == 0 {
            return Err(EngineError::ConcurrencyConflict(format!(
                "usage period {}",
                period_id
            )));
        }
    }

    if let Some(next) = open {
        insert_period_on(conn, next, now).await?;
    }

    Ok(())
}

async fn insert_period_on(
    conn: &mut PgConnection,
    next: &NewPeriod,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO usage_periods (period_id, subscription_id, period_start, period_end, created_utc)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(next.period_id)
    .bind(next.subscription_id)
    .bind(next.period_start)
    .bind(next.period_end)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| match e {
        // Another writer already opened a period for this subscription
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            EngineError::ConcurrencyConflict(format!(
                "usage periods of subscription {}",
                next.subscription_id
            ))
        }
        _ => EngineError::Storage(anyhow::anyhow!("Failed to open period: {}", e)),
    })?;

    Ok(())
}

#[async_trait]
impl PlanStore for PgStore {
    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn insert_plan(&self, plan: &Plan) -> Result<Plan, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            INSERT INTO plans (plan_id, name, description, price, currency, billing_cycle, features, limits, is_active, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING plan_id, name, description, price, currency, billing_cycle, features, limits, is_active, created_utc, updated_utc
            "#,
        )
        .bind(plan.plan_id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(&plan.currency)
        .bind(plan.billing_cycle.as_str())
        .bind(Json(&plan.features))
        .bind(Json(&plan.limits))
        .bind(plan.is_active)
        .bind(plan.created_utc)
        .bind(plan.updated_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to create plan: {}", e)))?;

        timer.observe_duration();

        row.try_into()
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT plan_id, name, description, price, currency, billing_cycle, features, limits, is_active, created_utc, updated_utc
            FROM plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();

        row.map(Plan::try_from).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_plans(&self, filter: &ListPlansFilter) -> Result<Vec<Plan>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_plans"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let rows = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT plan_id, name, description, price, currency, billing_cycle, features, limits, is_active, created_utc, updated_utc
            FROM plans
            WHERE ($1::bool = TRUE OR is_active = TRUE)
              AND ($2::uuid IS NULL OR plan_id > $2)
            ORDER BY plan_id
            LIMIT $3
            "#,
        )
        .bind(filter.include_inactive)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to list plans: {}", e)))?;

        timer.observe_duration();

        rows.into_iter().map(Plan::try_from).collect()
    }

    #[instrument(skip(self, input), fields(plan_id = %plan_id))]
    async fn update_plan(
        &self,
        plan_id: Uuid,
        input: &UpdatePlan,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            UPDATE plans
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                price = COALESCE($4, price),
                features = COALESCE($5, features),
                limits = COALESCE($6, limits),
                updated_utc = $7
            WHERE plan_id = $1
            RETURNING plan_id, name, description, price, currency, billing_cycle, features, limits, is_active, created_utc, updated_utc
            "#,
        )
        .bind(plan_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.price)
        .bind(input.features.clone().map(Json))
        .bind(input.limits.clone().map(Json))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to update plan: {}", e)))?;

        timer.observe_duration();

        row.map(Plan::try_from).transpose()
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn set_plan_active(
        &self,
        plan_id: Uuid,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Plan>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_plan_active"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            UPDATE plans
            SET is_active = $2, updated_utc = $3
            WHERE plan_id = $1
            RETURNING plan_id, name, description, price, currency, billing_cycle, features, limits, is_active, created_utc, updated_utc
            "#,
        )
        .bind(plan_id)
        .bind(is_active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to change plan activity: {}", e))
        })?;

        timer.observe_duration();

        row.map(Plan::try_from).transpose()
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    #[instrument(skip(self, subscription, first_period, token), fields(subscription_id = %subscription.subscription_id, owner = %subscription.owner))]
    async fn create_subscription(
        &self,
        subscription: &Subscription,
        first_period: &NewPeriod,
        token: &IdempotencyToken,
    ) -> Result<Subscription, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, organization_id, plan_id, terms, status, start_date, end_date, trial_end_date, auto_renew, billing_anchor_day, last_payment_date, next_payment_date, past_due_since, payment_method, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING subscription_id, user_id, organization_id, plan_id, terms, status, start_date, end_date, trial_end_date, auto_renew, billing_anchor_day, last_payment_date, next_payment_date, past_due_since, payment_method, version, created_utc, updated_utc
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.owner.user_id())
        .bind(subscription.owner.organization_id())
        .bind(subscription.plan_id)
        .bind(Json(&subscription.terms))
        .bind(subscription.status)
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.trial_end_date)
        .bind(subscription.auto_renew)
        .bind(subscription.billing_anchor_day.clamp(1, 31) as i16)
        .bind(subscription.last_payment_date)
        .bind(subscription.next_payment_date)
        .bind(subscription.past_due_since)
        .bind(&subscription.payment_method)
        .bind(subscription.version)
        .bind(subscription.created_utc)
        .bind(subscription.updated_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                if db_err.constraint() == Some("subscriptions_pkey") {
                    EngineError::DuplicateEvent {
                        token: token.to_string(),
                    }
                } else {
                    EngineError::OwnerAlreadySubscribed(subscription.owner.to_string())
                }
            }
            sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => {
                EngineError::Validation(format!("Subscription rejected: {}", db_err.message()))
            }
            _ => EngineError::Storage(anyhow::anyhow!("Failed to create subscription: {}", e)),
        })?;

        let created = Subscription::try_from(row)?;

        insert_period_on(&mut *tx, first_period, created.created_utc).await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_transitions (subscription_id, token, action, from_status, snapshot, recorded_utc)
            VALUES ($1, $2, $3, NULL, $4, $5)
            "#,
        )
        .bind(created.subscription_id)
        .bind(token.as_str())
        .bind(TransitionAction::StartTrial)
        .bind(Json(&created))
        .bind(created.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to record transition: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to commit subscription: {}", e))
        })?;

        timer.observe_duration();

        Ok(created)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT subscription_id, user_id, organization_id, plan_id, terms, status, start_date, end_date, trial_end_date, auto_renew, billing_anchor_day, last_payment_date, next_payment_date, past_due_since, payment_method, version, created_utc, updated_utc
            FROM subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to get subscription: {}", e)))?;

        timer.observe_duration();

        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(self), fields(owner = %owner))]
    async fn find_live_subscription(
        &self,
        owner: &Owner,
    ) -> Result<Option<Subscription>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_live_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT subscription_id, user_id, organization_id, plan_id, terms, status, start_date, end_date, trial_end_date, auto_renew, billing_anchor_day, last_payment_date, next_payment_date, past_due_since, payment_method, version, created_utc, updated_utc
            FROM subscriptions
            WHERE ($1::uuid IS NOT NULL AND user_id = $1 OR $2::uuid IS NOT NULL AND organization_id = $2)
              AND status IN ('trial', 'active')
            LIMIT 1
            "#,
        )
        .bind(owner.user_id())
        .bind(owner.organization_id())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to find live subscription: {}", e))
        })?;

        timer.observe_duration();

        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT subscription_id, user_id, organization_id, plan_id, terms, status, start_date, end_date, trial_end_date, auto_renew, billing_anchor_day, last_payment_date, next_payment_date, past_due_since, payment_method, version, created_utc, updated_utc
            FROM subscriptions
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::uuid IS NULL OR organization_id = $2)
              AND ($3::varchar IS NULL OR status = $3)
              AND ($4::uuid IS NULL OR plan_id = $4)
              AND ($5::uuid IS NULL OR subscription_id > $5)
            ORDER BY subscription_id
            LIMIT $6
            "#,
        )
        .bind(filter.owner.and_then(|o| o.user_id()))
        .bind(filter.owner.and_then(|o| o.organization_id()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.plan_id)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to list subscriptions: {}", e))
        })?;

        timer.observe_duration();

        rows.into_iter().map(Subscription::try_from).collect()
    }

    #[instrument(skip(self, commit), fields(subscription_id = %commit.next.subscription_id, action = %commit.action, token = %commit.token))]
    async fn commit_transition(
        &self,
        commit: &TransitionCommit,
    ) -> Result<Subscription, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_transition"])
            .start_timer();

        let subscription_id = commit.next.subscription_id;
        let mut next = commit.next.clone();
        next.version = commit.expected_version + 1;
        next.updated_utc = commit.at;

        let mut tx = self.pool.begin().await.map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let recorded = sqlx::query(
            r#"
            INSERT INTO subscription_transitions (subscription_id, token, action, from_status, snapshot, recorded_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (subscription_id, token) DO NOTHING
            "#,
        )
        .bind(subscription_id)
        .bind(commit.token.as_str())
        .bind(commit.action)
        .bind(commit.from_status)
        .bind(Json(&next))
        .bind(commit.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to record transition: {}", e))
        })?
        .rows_affected();

        if recorded == 0 {
            return Err(EngineError::DuplicateEvent {
                token: commit.token.to_string(),
            });
        }

        let updated = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET status = $3,
                end_date = $4,
                trial_end_date = $5,
                auto_renew = $6,
                billing_anchor_day = $7,
                last_payment_date = $8,
                next_payment_date = $9,
                past_due_since = $10,
                payment_method = $11,
                version = $12,
                updated_utc = $13
            WHERE subscription_id = $1 AND version = $2
            RETURNING subscription_id, user_id, organization_id, plan_id, terms, status, start_date, end_date, trial_end_date, auto_renew, billing_anchor_day, last_payment_date, next_payment_date, past_due_since, payment_method, version, created_utc, updated_utc
            "#,
        )
        .bind(subscription_id)
        .bind(commit.expected_version)
        .bind(next.status)
        .bind(next.end_date)
        .bind(next.trial_end_date)
        .bind(next.auto_renew)
        .bind(next.billing_anchor_day.clamp(1, 31) as i16)
        .bind(next.last_payment_date)
        .bind(next.next_payment_date)
        .bind(next.past_due_since)
        .bind(&next.payment_method)
        .bind(next.version)
        .bind(next.updated_utc)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => {
                EngineError::Validation(format!("Transition rejected: {}", db_err.message()))
            }
            _ => EngineError::Storage(anyhow::anyhow!("Failed to update subscription: {}", e)),
        })?;

        let Some(updated) = updated else {
            debug!("Subscription version moved, rejecting transition");
            return Err(EngineError::ConcurrencyConflict(format!(
                "subscription {}",
                subscription_id
            )));
        };

        apply_period_change_on(&mut *tx, subscription_id, &commit.period, commit.at).await?;

        tx.commit().await.map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to commit transition: {}", e))
        })?;

        timer.observe_duration();

        Subscription::try_from(updated)
    }

    #[instrument(skip(self, token), fields(subscription_id = %subscription_id, token = %token))]
    async fn find_transition(
        &self,
        subscription_id: Uuid,
        token: &IdempotencyToken,
    ) -> Result<Option<TransitionRecord>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_transition"])
            .start_timer();

        let row = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT subscription_id, token, action, from_status, snapshot, recorded_utc
            FROM subscription_transitions
            WHERE subscription_id = $1 AND token = $2
            "#,
        )
        .bind(subscription_id)
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to find transition: {}", e)))?;

        timer.observe_duration();

        row.map(TransitionRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_roll_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_roll_candidates"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT s.subscription_id
            FROM subscriptions s
            WHERE (s.status IN ('trial', 'active') AND s.next_payment_date <= $1)
               OR EXISTS (
                    SELECT 1 FROM usage_periods p
                    WHERE p.subscription_id = s.subscription_id
                      AND p.closed_utc IS NULL
                      AND p.period_end <= $1
               )
            ORDER BY s.subscription_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to list roll candidates: {}", e))
        })?;

        timer.observe_duration();

        Ok(ids)
    }
}

#[async_trait]
impl AtomicCounterStore for PgStore {
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn open_period(&self, subscription_id: Uuid) -> Result<Option<UsagePeriod>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_period"])
            .start_timer();

        let row = sqlx::query_as::<_, PeriodRow>(
            r#"
            SELECT period_id, subscription_id, period_start, period_end, closed_utc, created_utc
            FROM usage_periods
            WHERE subscription_id = $1 AND closed_utc IS NULL
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to get open period: {}", e)))?;

        let period = self
            .hydrate_periods(row.into_iter().collect())
            .await?
            .pop();

        timer.observe_duration();

        Ok(period)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn list_periods(&self, subscription_id: Uuid) -> Result<Vec<UsagePeriod>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_periods"])
            .start_timer();

        let rows = sqlx::query_as::<_, PeriodRow>(
            r#"
            SELECT period_id, subscription_id, period_start, period_end, closed_utc, created_utc
            FROM usage_periods
            WHERE subscription_id = $1
            ORDER BY period_start
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to list periods: {}", e)))?;

        let periods = self.hydrate_periods(rows).await?;

        timer.observe_duration();

        Ok(periods)
    }

    #[instrument(skip(self, change), fields(subscription_id = %subscription_id))]
    async fn apply_period_change(
        &self,
        subscription_id: Uuid,
        change: &PeriodChange,
    ) -> Result<(), EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_period_change"])
            .start_timer();

        let now = match change {
            PeriodChange::Keep => return Ok(()),
            PeriodChange::Close { closed_at, .. } | PeriodChange::Roll { closed_at, .. } => {
                *closed_at
            }
            PeriodChange::Open(next) => next.period_start,
        };

        let mut tx = self.pool.begin().await.map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        apply_period_change_on(&mut *tx, subscription_id, change, now).await?;

        tx.commit().await.map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to commit period change: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id, resource = %resource))]
    async fn increment(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment"])
            .start_timer();

        // The period row is share-locked so a concurrent close waits for us
        // or we observe it closed; never both.
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            WITH period AS (
                SELECT period_id
                FROM usage_periods
                WHERE subscription_id = $1 AND closed_utc IS NULL AND period_end > $4
                FOR SHARE
            )
            INSERT INTO usage_counters (period_id, resource, used)
            SELECT period_id, $2, $3 FROM period
            ON CONFLICT (period_id, resource)
            DO UPDATE SET used = usage_counters.used + EXCLUDED.used
            RETURNING used
            "#,
        )
        .bind(subscription_id)
        .bind(resource.as_str())
        .bind(to_db_count(amount)?)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => {
                EngineError::Validation(format!("Counter {} out of range", resource))
            }
            _ => EngineError::Storage(anyhow::anyhow!("Failed to increment usage: {}", e)),
        })?;

        timer.observe_duration();

        total
            .map(from_db_count)
            .ok_or(EngineError::NoActivePeriod { subscription_id })
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id, resource = %resource))]
    async fn increment_within(
        &self,
        subscription_id: Uuid,
        resource: &Resource,
        amount: u64,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_within"])
            .start_timer();

        let amount = to_db_count(amount)?;
        let cap = i64::try_from(cap).unwrap_or(i64::MAX);

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            WITH period AS (
                SELECT period_id
                FROM usage_periods
                WHERE subscription_id = $1 AND closed_utc IS NULL AND period_end > $5
                FOR SHARE
            )
            INSERT INTO usage_counters (period_id, resource, used)
            SELECT period_id, $2, $3 FROM period WHERE $3 <= $4
            ON CONFLICT (period_id, resource)
            DO UPDATE SET used = usage_counters.used + EXCLUDED.used
            WHERE usage_counters.used + EXCLUDED.used <= $4
            RETURNING used
            "#,
        )
        .bind(subscription_id)
        .bind(resource.as_str())
        .bind(amount)
        .bind(cap)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to reserve usage: {}", e)))?;

        if let Some(total) = total {
            timer.observe_duration();
            return Ok(Reservation::Granted {
                total: from_db_count(total),
            });
        }

        // Nothing written: either no open period or the cap would be exceeded
        let used = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(c.used, 0)
            FROM usage_periods p
            LEFT JOIN usage_counters c ON c.period_id = p.period_id AND c.resource = $2
            WHERE p.subscription_id = $1 AND p.closed_utc IS NULL AND p.period_end > $3
            "#,
        )
        .bind(subscription_id)
        .bind(resource.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("Failed to read usage: {}", e)))?;

        timer.observe_duration();

        used.map(|used| Reservation::Denied {
            used: from_db_count(used),
        })
        .ok_or(EngineError::NoActivePeriod { subscription_id })
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    #[instrument(skip(self, entry), fields(subscription_id = %entry.subscription_id, attempt_key = %entry.attempt_key))]
    async fn record_attempt(
        &self,
        entry: &NewBillingEntry,
        now: DateTime<Utc>,
    ) -> Result<BillingEntry, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_attempt"])
            .start_timer();

        let inserted = sqlx::query_as::<_, BillingRow>(
            r#"
            INSERT INTO billing_history (billing_history_id, subscription_id, attempt_key, plan_name, amount, currency, status, payment_method, invoice_reference, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9)
            ON CONFLICT (subscription_id, attempt_key) DO NOTHING
            RETURNING billing_history_id, subscription_id, attempt_key, plan_name, amount, currency, status, paid_at, payment_method, payment_reference, invoice_reference, created_utc, resolved_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.subscription_id)
        .bind(&entry.attempt_key)
        .bind(&entry.plan_name)
        .bind(entry.amount)
        .bind(&entry.currency)
        .bind(&entry.payment_method)
        .bind(&entry.invoice_reference)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to record billing attempt: {}", e))
        })?;

        let row = match inserted {
            Some(row) => row,
            None => {
                // Same cycle already recorded; hand back the existing row
                sqlx::query_as::<_, BillingRow>(
                    r#"
                    SELECT billing_history_id, subscription_id, attempt_key, plan_name, amount, currency, status, paid_at, payment_method, payment_reference, invoice_reference, created_utc, resolved_utc
                    FROM billing_history
                    WHERE subscription_id = $1 AND attempt_key = $2
                    "#,
                )
                .bind(entry.subscription_id)
                .bind(&entry.attempt_key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    EngineError::Storage(anyhow::anyhow!("Failed to fetch existing attempt: {}", e))
                })?
            }
        };

        timer.observe_duration();

        Ok(row.into())
    }

    #[instrument(skip(self), fields(billing_history_id = %billing_history_id))]
    async fn get_entry(
        &self,
        billing_history_id: Uuid,
    ) -> Result<Option<BillingEntry>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_entry"])
            .start_timer();

        let row = sqlx::query_as::<_, BillingRow>(
            r#"
            SELECT billing_history_id, subscription_id, attempt_key, plan_name, amount, currency, status, paid_at, payment_method, payment_reference, invoice_reference, created_utc, resolved_utc
            FROM billing_history
            WHERE billing_history_id = $1
            "#,
        )
        .bind(billing_history_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to get billing entry: {}", e))
        })?;

        timer.observe_duration();

        Ok(row.map(BillingEntry::from))
    }

    #[instrument(skip(self, resolution), fields(billing_history_id = %billing_history_id, status = %resolution.status))]
    async fn resolve_attempt(
        &self,
        billing_history_id: Uuid,
        resolution: &AttemptResolution,
    ) -> Result<ResolveOutcome, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_attempt"])
            .start_timer();

        let updated = sqlx::query_as::<_, BillingRow>(
            r#"
            UPDATE billing_history
            SET status = $2,
                payment_reference = COALESCE($3, payment_reference),
                paid_at = CASE WHEN $2 = 'paid' THEN $4 ELSE paid_at END,
                resolved_utc = $4
            WHERE billing_history_id = $1 AND status = 'pending'
            RETURNING billing_history_id, subscription_id, attempt_key, plan_name, amount, currency, status, paid_at, payment_method, payment_reference, invoice_reference, created_utc, resolved_utc
            "#,
        )
        .bind(billing_history_id)
        .bind(resolution.status.as_str())
        .bind(&resolution.payment_reference)
        .bind(resolution.resolved_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to resolve billing attempt: {}", e))
        })?;

        let outcome = match updated {
            Some(row) => ResolveOutcome {
                entry: row.into(),
                applied: true,
            },
            None => {
                let existing = self.get_entry(billing_history_id).await?.ok_or_else(|| {
                    EngineError::NotFound(format!("billing history {}", billing_history_id))
                })?;
                ResolveOutcome {
                    entry: existing,
                    applied: false,
                }
            }
        };

        timer.observe_duration();

        Ok(outcome)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn list_entries(&self, subscription_id: Uuid) -> Result<Vec<BillingEntry>, EngineError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_billing_entries"])
            .start_timer();

        let rows = sqlx::query_as::<_, BillingRow>(
            r#"
            SELECT billing_history_id, subscription_id, attempt_key, plan_name, amount, currency, status, paid_at, payment_method, payment_reference, invoice_reference, created_utc, resolved_utc
            FROM billing_history
            WHERE subscription_id = $1
            ORDER BY created_utc, billing_history_id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            EngineError::Storage(anyhow::anyhow!("Failed to list billing history: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows.into_iter().map(BillingEntry::from).collect())
    }
}
