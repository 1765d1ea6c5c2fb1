//! HTTP server for the generation relay.
//!
//! Routes:
//! - `POST /generate`: start a generation
//! - `GET /stream`: follow a response as SSE
//! - `GET /status/{id}`: status and buffered events
//! - `GET /active`: active responses and the session epoch
//! - `POST /stop`: cancel by session or mode
//! - `POST /clear`, `GET /context`, `GET /messages`: stored session data
//! - `GET /commands`, `PUT|DELETE /commands/{name}`: saved prompt commands
//! - `GET /health`

mod error;
mod routes;
mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, Method, header};
use axum::routing::{get, post, put};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::relay::GenerationRelay;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the router with every endpoint.
pub fn router(relay: Arc<GenerationRelay>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(stream::LAST_EVENT_ID),
        ]);

    Router::new()
        .route("/generate", post(routes::generate))
        .route("/stream", get(stream::stream))
        .route("/status/{id}", get(routes::status))
        .route("/active", get(routes::active))
        .route("/stop", post(routes::stop))
        .route("/clear", post(routes::clear))
        .route("/context", get(routes::context))
        .route("/messages", get(routes::messages))
        .route("/commands", get(routes::commands))
        .route(
            "/commands/{name}",
            put(routes::save_command).delete(routes::delete_command),
        )
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(relay)
}

/// Bind `addr` and serve until `shutdown` flips to `true`.
pub async fn serve(
    addr: SocketAddr,
    relay: Arc<GenerationRelay>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Starting HTTP server");
    serve_on(listener, relay, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    relay: Arc<GenerationRelay>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    axum::serve(listener, router(relay))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("HTTP server shutting down");
        })
        .await?;
    Ok(())
}
