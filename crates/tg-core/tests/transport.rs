mod common;

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tg_core::cancel::{CancelToken, cancel_pair};
use tg_core::codec::PayloadKind;
use tg_core::request::RequestBuilder;
use tg_core::{GenerationSpec, GeneratorConfig, HttpTransport, RetryConfig, Transport, TransportError};

use common::{MockEndpoint, Reply, red_png};

fn retry(max_retries: u32, initial_ms: u64) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(initial_ms),
        max_backoff: Duration::from_secs(1),
        multiplier: 2.0,
    }
}

fn request_for(endpoint: &MockEndpoint) -> tg_core::request::OutboundRequest {
    let config = GeneratorConfig {
        endpoint: endpoint.url.clone(),
        api_key: Some("sk-test".into()),
        ..GeneratorConfig::default()
    };
    RequestBuilder::new(&config)
        .build(&GenerationSpec::new("red square", "Textures/Red"))
        .unwrap()
}

#[tokio::test]
async fn retries_server_errors_with_backoff() {
    let endpoint = MockEndpoint::start(vec![
        Reply::Status(500),
        Reply::Status(500),
        Reply::Status(500),
        Reply::Png(red_png()),
    ])
    .await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(3, 20)).unwrap();

    let started = Instant::now();
    let delivery = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(delivery.attempts, 4);
    assert_eq!(endpoint.hits(), 4);
    assert_eq!(delivery.payload.kind, PayloadKind::BinaryImage);
    assert_eq!(delivery.payload.bytes, red_png());
    // 20 + 40 + 80
    assert!(started.elapsed() >= Duration::from_millis(140));
}

#[tokio::test]
async fn client_errors_fail_fast() {
    let endpoint = MockEndpoint::start(vec![Reply::Status(400)]).await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(3, 20)).unwrap();

    let failure = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransportError::Http4xx { status: 400, .. }));
    assert_eq!(failure.attempts, 1);
    assert_eq!(endpoint.hits(), 1);
}

#[tokio::test]
async fn exhausted_retries_report_last_error() {
    let endpoint = MockEndpoint::start(vec![Reply::Status(503)]).await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(2, 5)).unwrap();

    let failure = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransportError::Http5xx { status: 503, .. }));
    assert_eq!(failure.attempts, 3);
    assert_eq!(endpoint.hits(), 3);
}

#[tokio::test]
async fn sends_built_headers_and_body() {
    let endpoint = MockEndpoint::start(vec![Reply::Png(red_png())]).await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(0, 5)).unwrap();
    let request = request_for(&endpoint);

    transport.send(request.clone(), CancelToken::never()).await.unwrap();

    let seen = endpoint.seen();
    assert_eq!(seen[0].path, "/v2beta/stable-image/generate/core");
    assert_eq!(seen[0].headers["authorization"], "Bearer sk-test");
    assert_eq!(seen[0].headers["accept"], "image/*");
    assert_eq!(seen[0].body, request.body);
}

#[tokio::test]
async fn json_base64_is_passed_through() {
    let encoded = BASE64.encode(red_png());
    let endpoint = MockEndpoint::start(vec![Reply::Json(json!({
        "image": encoded,
        "finish_reason": "SUCCESS",
        "seed": 12
    }))])
    .await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(0, 5)).unwrap();

    let delivery = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(delivery.payload.kind, PayloadKind::Base64Image);
    assert_eq!(delivery.payload.bytes, encoded.as_bytes());
}

#[tokio::test]
async fn image_url_is_fetched() {
    let endpoint = MockEndpoint::start(vec![
        Reply::Json(json!({ "url": "/results/red.png" })),
        Reply::Png(red_png()),
    ])
    .await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(0, 5)).unwrap();

    let delivery = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(delivery.payload.kind, PayloadKind::BinaryImage);
    assert_eq!(delivery.payload.bytes, red_png());
    assert_eq!(delivery.attempts, 2);
    assert_eq!(endpoint.seen()[1].path, "/results/red.png");
}

#[tokio::test]
async fn json_without_image_is_invalid() {
    let endpoint = MockEndpoint::start(vec![Reply::Json(json!({ "status": "queued" }))]).await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(3, 5)).unwrap();

    let failure = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, TransportError::InvalidResponse(_)));
    assert_eq!(endpoint.hits(), 1);
}

#[tokio::test]
async fn timeouts_are_retried() {
    let endpoint = MockEndpoint::start(vec![
        Reply::Delayed(Duration::from_secs(5), Box::new(Reply::Png(red_png()))),
        Reply::Png(red_png()),
    ])
    .await;
    let transport = HttpTransport::new(Duration::from_millis(100), retry(1, 5)).unwrap();

    let delivery = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(delivery.attempts, 2);
}

#[tokio::test]
async fn rate_limit_is_retried_with_capped_delay() {
    let endpoint = MockEndpoint::start(vec![
        Reply::RateLimited { retry_after_secs: 30 },
        Reply::Png(red_png()),
    ])
    .await;
    let transport = HttpTransport::new(
        Duration::from_secs(5),
        RetryConfig {
            max_backoff: Duration::from_millis(50),
            ..retry(1, 5)
        },
    )
    .unwrap();

    let started = Instant::now();
    let delivery = transport
        .send(request_for(&endpoint), CancelToken::never())
        .await
        .unwrap();

    assert_eq!(delivery.attempts, 2);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn huge_retry_after_is_clamped() {
    let endpoint = MockEndpoint::start(vec![
        Reply::RateLimited { retry_after_secs: u64::MAX },
        Reply::Png(red_png()),
    ])
    .await;
    let transport = HttpTransport::new(
        Duration::from_secs(5),
        RetryConfig {
            max_backoff: Duration::from_millis(20),
            ..retry(1, 5)
        },
    )
    .unwrap();

    let delivery = tokio::time::timeout(
        Duration::from_secs(5),
        transport.send(request_for(&endpoint), CancelToken::never()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(delivery.attempts, 2);
    assert_eq!(endpoint.hits(), 2);
}

#[tokio::test]
async fn cancellation_stops_in_flight_request() {
    let endpoint = MockEndpoint::start(vec![Reply::Delayed(
        Duration::from_secs(10),
        Box::new(Reply::Png(red_png())),
    )])
    .await;
    let transport = HttpTransport::new(Duration::from_secs(30), retry(3, 5)).unwrap();
    let (handle, token) = cancel_pair();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let failure = transport.send(request_for(&endpoint), token).await.unwrap_err();

    assert_eq!(failure.error, TransportError::Cancelled);
    assert_eq!(failure.attempts, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancellation_stops_backoff() {
    let endpoint = MockEndpoint::start(vec![Reply::Status(502)]).await;
    let transport = HttpTransport::new(Duration::from_secs(5), retry(5, 10_000)).unwrap();
    let (handle, token) = cancel_pair();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });

    let failure = transport.send(request_for(&endpoint), token).await.unwrap_err();
    assert_eq!(failure.error, TransportError::Cancelled);
    assert_eq!(endpoint.hits(), 1);
}
