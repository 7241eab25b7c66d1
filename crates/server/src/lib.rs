//! The chat transport endpoint.
//!
//! `POST /api/chat` takes a whole conversation, forwards it to the model
//! backend behind a fixed directive, and streams the completion back as a
//! data stream (see [`chat_relay_protocol`]). Nothing is kept between
//! requests: every request owns its backend call and its outbound stream.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod chat;
pub mod config;
mod error;
mod relay;
mod stream;

use std::sync::Arc;

use axum::Router;
use axum::http::{Method, header};
use axum::routing::{get, post};
use chat_relay_model::ModelProvider;
use chat_relay_protocol::CHAT_PATH;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{ApiError, BackendError};
pub use relay::Relay;

/// The directive used when no other one is configured.
pub const DEFAULT_DIRECTIVE: &str = include_str!("./directive.md");

/// Shared, read-only state of the endpoint.
#[derive(Clone)]
pub struct AppState {
    relay: Relay,
    directive: Arc<str>,
}

impl AppState {
    /// Creates the state from a model provider and the directive that is
    /// put in front of every conversation.
    pub fn new<P: ModelProvider + 'static>(
        provider: P,
        directive: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            relay: Relay::new(provider),
            directive: directive.into(),
        }
    }
}

/// Builds the router with the chat and health routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(CHAT_PATH, post(chat::chat))
        .with_state(state)
}

/// Builds the router with the layers used when serving: permissive CORS
/// for browser clients and request tracing.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}
