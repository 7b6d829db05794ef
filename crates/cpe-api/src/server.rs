//! Axum router and server for the Control API

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::Json;
use cpe_core::{Error, Reconciler, Result};
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::dto::{ApiResponse, CODE_ERROR};
use crate::handlers;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub reconciler: Arc<Reconciler>,
}

impl ApiState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

/// Turn a handler panic into a "500" envelope
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "control handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::failure(CODE_ERROR, format!("internal error: {}", detail))),
    )
        .into_response()
}

/// Build the Control API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/cpe/{sn}/configAll", post(handlers::config_all))
        .route(
            "/cpe/{sn}/{kind}",
            post(handlers::create_object).put(handlers::put_object),
        )
        .route("/cpe/{sn}/{kind}/{id}", delete(handlers::delete_object))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the Control API until `shutdown` flips to true
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("control API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    info!("control API stopped");
    Ok(())
}
