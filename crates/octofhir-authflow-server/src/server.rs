use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, routing::get};
use octofhir_authflow::{AuthFlowServices, router};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;

/// Wires the flow services from configuration with in-memory stores.
pub fn build_services(cfg: &AppConfig) -> anyhow::Result<Arc<AuthFlowServices>> {
    Ok(AuthFlowServices::builder(cfg.authflow.clone()).build()?)
}

/// Builds the full application router.
pub async fn build_app(cfg: &AppConfig) -> anyhow::Result<Router> {
    Ok(app(build_services(cfg)?))
}

/// Flow endpoints plus the service routes, around existing services.
pub fn app(services: Arc<AuthFlowServices>) -> Router {
    let realm = services.realm.name.clone();
    Router::new()
        .route("/", get(move || root(realm.clone())))
        .route("/healthz", get(healthz))
        .merge(router(services))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn root(realm: String) -> Json<Value> {
    Json(json!({
        "service": "OctoFHIR Auth Flows",
        "realm": realm,
        "status": "ok",
    }))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Periodically drops expired auth sessions and consumed token keys.
pub fn spawn_sweeper(services: Arc<AuthFlowServices>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let sessions = services.sessions.remove_expired().await;
            let tokens = services
                .consumed
                .remove_expired(services.clock.unix_timestamp())
                .await;
            match (sessions, tokens) {
                (Ok(0), Ok(0)) => {}
                (Ok(sessions), Ok(tokens)) => {
                    tracing::debug!(sessions, tokens, "Swept expired auth state");
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "Sweeping expired auth state failed");
                }
            }
        }
    })
}

/// Serves until Ctrl+C.
pub async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let services = build_services(&cfg)?;
    let sweeper = spawn_sweeper(services.clone(), cfg.server.sweep_interval);

    let addr = cfg.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        realm = %services.realm.name,
        issuer = %services.codec.issuer(),
        "listening"
    );
    axum::serve(
        listener,
        app(services).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
