//! Application startup and lifecycle management.

use crate::config::EngineConfig;
use crate::engine::{roller, Engine};
use crate::services::{get_metrics, init_metrics, HttpPaymentGateway, PgStore, SystemClock};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub store: Arc<PgStore>,
    pub engine: Engine,
}

/// Liveness: the process is up and the database answers.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "error": e.to_string()
                })),
            )
        }
    }
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Connect to Postgres, apply migrations and bind the HTTP listener.
    pub async fn build(config: EngineConfig) -> Result<Self, AppError> {
        init_metrics();

        let store = PgStore::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            AppError::from(e)
        })?;

        store.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            AppError::from(e)
        })?;

        let store = Arc::new(store);
        let gateway = Arc::new(HttpPaymentGateway::new(
            config.payment_gateway.base_url.clone(),
        ));
        let engine = Engine::new(
            store.clone(),
            Arc::new(SystemClock),
            config.billing.clone(),
            gateway,
        );

        let http_addr = config.common.http_addr();
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        Ok(Self {
            http_port,
            http_listener,
            state: AppState {
                config,
                store,
                engine,
            },
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Serve HTTP and, when enabled, run the period roller until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler = &self.state.config.scheduler;
        let roller_task = scheduler.enabled.then(|| {
            tracing::info!(
                tick_secs = scheduler.tick_secs,
                batch_size = scheduler.batch_size,
                "Starting period roller"
            );
            roller::spawn(
                self.state.engine.roller().clone(),
                Duration::from_secs(scheduler.tick_secs.max(1)),
                scheduler.batch_size,
            )
        });

        tracing::info!(
            service = %self.state.config.service_name,
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, router(self.state)).await;

        if let Some(task) = roller_task {
            task.abort();
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
