use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use chat_relay_model::ModelMessage;
use chat_relay_protocol::{
    CHAT_PATH, FinishReason, FrameDecoder, STREAM_HEADER, StreamPart,
};
use chat_relay_server::{AppState, router};
use chat_relay_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::time::timeout;
use tower::ServiceExt;

const DIRECTIVE: &str = "Answer briefly.";

fn app(provider: &TestModelProvider) -> Router {
    router(AppState::new(provider.clone(), DIRECTIVE))
}

fn chat_request(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(CHAT_PATH)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

fn decode(body: &[u8]) -> Vec<StreamPart> {
    let mut decoder = FrameDecoder::new();
    decoder.push(body);
    let mut parts = vec![];
    while let Some(part) = decoder.next_part().unwrap() {
        parts.push(part);
    }
    decoder.finish().unwrap();
    parts
}

fn text_of(parts: &[StreamPart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            StreamPart::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_single_turn_round_trip() {
    let mut provider = TestModelProvider::default();
    provider.add_turn(PresetResponse::with_deltas(["4"]));

    let body = json!({ "messages": [{ "role": "user", "content": "2+2=?" }] });
    let response = app(&provider)
        .oneshot(chat_request(body.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(STREAM_HEADER).unwrap(),
        chat_relay_protocol::STREAM_VERSION
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parts = decode(&body);
    assert!(matches!(&parts[0], StreamPart::Start { message_id } if !message_id.is_empty()));
    assert_eq!(text_of(&parts), "4");
    assert_eq!(
        parts.last(),
        Some(&StreamPart::Finish {
            finish_reason: FinishReason::Stop
        })
    );
}

#[tokio::test]
async fn test_history_is_forwarded_in_order() {
    let mut provider = TestModelProvider::default();
    provider.add_turn(PresetResponse::with_deltas(["hello"]));
    provider.add_turn(PresetResponse::with_deltas(["see ", "you"]));

    let body = json!({
        "messages": [
            { "role": "user", "content": "hi" },
            { "role": "assistant", "content": "hello" },
            { "role": "user", "content": "bye" },
        ]
    });
    let response = app(&provider)
        .oneshot(chat_request(body.to_string()))
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(text_of(&decode(&body)), "see you");

    let requests = provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].messages,
        vec![
            ModelMessage::System(DIRECTIVE.to_owned()),
            ModelMessage::User("hi".to_owned()),
            ModelMessage::Assistant("hello".to_owned()),
            ModelMessage::User("bye".to_owned()),
        ]
    );
}

#[tokio::test]
async fn test_malformed_requests_never_reach_the_backend() {
    let mut provider = TestModelProvider::default();
    provider.add_turn(PresetResponse::with_deltas(["unused"]));

    for body in [
        "{}",
        "not json",
        r#"{"messages":[]}"#,
        r#"{"messages":[{"role":"robot","content":"beep"}]}"#,
        r#"{"messages":[{"role":"user"}]}"#,
    ] {
        let response = app(&provider).oneshot(chat_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        assert!(response.headers().get(STREAM_HEADER).is_none());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("malformed"));
    }
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_backend_failure_before_stream() {
    let mut provider = TestModelProvider::default();
    provider.add_turn(PresetResponse::with_deltas(["never"]).with_failures(0));

    let body = json!({ "messages": [{ "role": "user", "content": "hi" }] });
    let response = app(&provider)
        .oneshot(chat_request(body.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["error"].is_string());
    // The endpoint does not retry.
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn test_backend_failure_mid_stream() {
    let mut provider = TestModelProvider::default();
    provider.add_turn(PresetResponse::with_events([
        PresetEvent::MessageDelta("Partial ".to_owned()),
        PresetEvent::MessageDelta("answer".to_owned()),
        PresetEvent::Fault("connection reset".to_owned()),
    ]));

    let body = json!({ "messages": [{ "role": "user", "content": "hi" }] });
    let response = app(&provider)
        .oneshot(chat_request(body.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parts = decode(&body);
    assert_eq!(text_of(&parts), "Partial answer");
    assert!(matches!(parts.last(), Some(StreamPart::Error(_))));
    assert!(
        !parts
            .iter()
            .any(|part| matches!(part, StreamPart::Finish { .. }))
    );
}

#[tokio::test]
async fn test_deltas_are_forwarded_as_they_arrive() {
    // A full answer takes far longer than the timeout below, so the first
    // deltas can only show up if nothing is buffered.
    let mut provider = TestModelProvider::default();
    provider.set_delay(Duration::from_millis(20));
    provider.add_turn(PresetResponse::with_deltas(
        (0..1000).map(|idx| format!("{idx} ")),
    ));

    let body = json!({ "messages": [{ "role": "user", "content": "count" }] });
    let response = app(&provider)
        .oneshot(chat_request(body.to_string()))
        .await
        .unwrap();
    let mut frames = response.into_body().into_data_stream();

    let mut decoder = FrameDecoder::new();
    let mut parts = vec![];
    timeout(Duration::from_secs(5), async {
        while parts.len() < 3 {
            let frame = frames.next().await.unwrap().unwrap();
            decoder.push(&frame);
            while let Some(part) = decoder.next_part().unwrap() {
                parts.push(part);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(parts[1], StreamPart::Text("0 ".to_owned()));
    assert_eq!(parts[2], StreamPart::Text("1 ".to_owned()));
}

#[tokio::test]
async fn test_disconnect_releases_the_backend_response() {
    let mut provider = TestModelProvider::default();
    provider.set_delay(Duration::from_millis(20));
    provider.add_turn(PresetResponse::with_deltas(
        (0..1000).map(|idx| format!("{idx} ")),
    ));

    let body = json!({ "messages": [{ "role": "user", "content": "count" }] });
    let response = app(&provider)
        .oneshot(chat_request(body.to_string()))
        .await
        .unwrap();
    let mut frames = response.into_body().into_data_stream();

    // Start frame and a few deltas.
    timeout(Duration::from_secs(5), async {
        for _ in 0..4 {
            frames.next().await.unwrap().unwrap();
        }
    })
    .await
    .unwrap();
    assert_eq!(provider.live_responses(), 1);

    drop(frames);
    assert_eq!(provider.live_responses(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_are_independent() {
    let mut provider = TestModelProvider::default();
    provider.add_turn(PresetResponse::with_deltas(["one"]));
    provider.add_turn(PresetResponse::with_deltas(["two"]));
    let app = app(&provider);

    let mut tasks = vec![];
    for idx in 0..8 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let messages = if idx % 2 == 0 {
                json!([{ "role": "user", "content": "a" }])
            } else {
                json!([
                    { "role": "user", "content": "a" },
                    { "role": "assistant", "content": "one" },
                    { "role": "user", "content": "b" },
                ])
            };
            let body = json!({ "messages": messages }).to_string();
            let response = app.oneshot(chat_request(body)).await.unwrap();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (idx, text_of(&decode(&body)))
        }));
    }

    for task in tasks {
        let (idx, text) = task.await.unwrap();
        let expected = if idx % 2 == 0 { "one" } else { "two" };
        assert_eq!(text, expected);
    }
    assert_eq!(provider.requests().len(), 8);
}

#[tokio::test]
async fn test_health() {
    let provider = TestModelProvider::default();
    let response = app(&provider)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
