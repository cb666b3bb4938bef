//! HTTP API for health, reset schedules, and manual resets
//!
//! Thin surface over the aggregator, orchestrator, and store:
//! - `GET /health` — per-core panel and node health
//! - `GET /reset-config` — reset schedule for every core
//! - `PUT /reset-config/{core}` — update enabled/interval_minutes
//! - `POST /reset/{core}` — run a reset pass synchronously
//!
//! Unknown core names are rejected with a client error before any side
//! effect.

use crate::core::Core;
use crate::db::Database;
use crate::health::HealthAggregator;
use crate::reset::ResetOrchestrator;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared state behind every request handler.
pub struct ApiContext {
    pub db: Arc<Database>,
    pub health: HealthAggregator,
    pub orchestrator: Arc<ResetOrchestrator>,
}

/// Partial update for a core's reset schedule.
#[derive(Debug, Deserialize)]
pub struct ResetConfigUpdate {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<i64>,
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

fn bad_request(message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "detail": message.into() });
    json_response(StatusCode::BAD_REQUEST, body.to_string())
}

fn internal_error(message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "detail": message.into() });
    json_response(StatusCode::INTERNAL_SERVER_ERROR, body.to_string())
}

/// API server; serves plain HTTP until the shutdown channel flips.
pub struct ApiServer {
    bind_addr: SocketAddr,
    context: Arc<ApiContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<ApiContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let context = Arc::clone(&context);
                                    async move { handle_request(req, context).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<ApiContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => {
            let report = context.health.collect().await;
            json_ok(&report)
        }

        (&Method::GET, "/reset-config") => match context.db.list_reset_configs() {
            Ok(configs) => json_ok(&configs),
            Err(e) => {
                error!(error = %e, "failed to load reset configs");
                internal_error(e.to_string())
            }
        },

        (&Method::PUT, path) if path.starts_with("/reset-config/") => {
            let core_name = path.trim_start_matches("/reset-config/").to_string();
            handle_update_reset_config(req, &context, &core_name).await?
        }

        (&Method::POST, path) if path.starts_with("/reset/") => {
            let core_name = path.trim_start_matches("/reset/").to_string();
            handle_manual_reset(&context, &core_name).await
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn handle_update_reset_config(
    req: Request<Incoming>,
    context: &ApiContext,
    core_name: &str,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let Some(core) = Core::from_str(core_name) else {
        return Ok(bad_request(format!("Invalid core: {core_name}")));
    };

    let body = req.into_body().collect().await?.to_bytes();
    let update: ResetConfigUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => return Ok(bad_request(format!("Malformed request body: {e}"))),
    };

    // Reject before touching the store so the row stays unchanged
    if let Some(interval) = update.interval_minutes {
        if interval < 1 {
            return Ok(bad_request("Interval must be at least 1 minute"));
        }
    }

    match context
        .db
        .update_reset_config(core, update.enabled, update.interval_minutes, Utc::now())
    {
        Ok(record) => Ok(json_ok(&record)),
        Err(e) => {
            error!(core = %core, error = %e, "failed to update reset config");
            Ok(internal_error(e.to_string()))
        }
    }
}

async fn handle_manual_reset(context: &ApiContext, core_name: &str) -> Response<Full<Bytes>> {
    let Some(core) = Core::from_str(core_name) else {
        return bad_request(format!("Invalid core: {core_name}"));
    };

    info!(core = %core, "manual reset requested");

    if let Err(e) = context.orchestrator.reset_core(core).await {
        error!(core = %core, error = %e, "reset failed");
        return internal_error(e.to_string());
    }

    if let Err(e) = context.db.mark_reset(core, Utc::now()) {
        warn!(core = %core, error = %e, "reset completed but schedule update failed");
        return internal_error(e.to_string());
    }

    let body = serde_json::json!({
        "status": "success",
        "message": format!("{core} reset successfully"),
    });
    json_response(StatusCode::OK, body.to_string())
}
