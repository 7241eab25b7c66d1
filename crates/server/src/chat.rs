use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use chat_relay_model::{ModelMessage, ModelRequest};
use chat_relay_protocol::{
    ChatRequest, Role, STREAM_CONTENT_TYPE, STREAM_HEADER, STREAM_VERSION,
    WireMessage,
};
use uuid::Uuid;

use crate::stream::data_stream;
use crate::{ApiError, AppState};

/// `POST /api/chat`
pub(crate) async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    if req.messages.is_empty() {
        return Err(ApiError::EmptyConversation);
    }

    let message_id = format!("msg-{}", Uuid::new_v4().simple());
    debug!(%message_id, messages = req.messages.len(), "relaying conversation");

    let model_req = build_model_request(&state.directive, req.messages);
    let events = state.relay.open(model_req).await?;
    debug!(%message_id, "backend stream opened");

    let headers = [
        (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache"),
        (header::HeaderName::from_static(STREAM_HEADER), STREAM_VERSION),
    ];
    let body = Body::from_stream(data_stream(message_id, events));
    Ok((headers, body).into_response())
}

/// Puts the directive in front of the conversation, keeping its order.
fn build_model_request(
    directive: &str,
    messages: Vec<WireMessage>,
) -> ModelRequest {
    let mut model_messages = Vec::with_capacity(messages.len() + 1);
    model_messages.push(ModelMessage::System(directive.to_owned()));
    model_messages.extend(messages.into_iter().map(|msg| match msg.role {
        Role::User => ModelMessage::User(msg.content),
        Role::Assistant => ModelMessage::Assistant(msg.content),
        Role::System => ModelMessage::System(msg.content),
    }));
    ModelRequest {
        messages: model_messages,
    }
}
