use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use image::{Rgb, RgbImage};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::Instant;
use veriface_core::faces::{EnrolledTemplate, FaceEmbedding};
use veriface_core::providers::{
    BoundedProvider, CandidateSet, HttpCompareAdapter, HttpEngineClient, HttpLivenessAdapter,
    ProviderAdapter, ProviderClient, ProviderError, ProviderInput,
};

const API_KEY: &str = "engine-secret";

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(endpoint: &str) -> ProviderClient<HttpEngineClient> {
    ProviderClient::Ready(
        HttpEngineClient::new(endpoint, Some(API_KEY.into()), Duration::from_secs(5)).unwrap(),
    )
}

fn authorised(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(format!("Bearer {API_KEY}").as_str())
}

fn input() -> ProviderInput {
    ProviderInput {
        frame: Arc::new(RgbImage::from_pixel(16, 16, Rgb([120, 90, 60]))),
        embedding: None,
        similarity_threshold: None,
    }
}

fn pool() -> CandidateSet {
    Arc::from(vec![EnrolledTemplate {
        subject_id: "alice".into(),
        embedding: FaceEmbedding::from_raw(vec![0.6, 0.8]).unwrap(),
        captured_at: Utc::now(),
        raw_image_ref: Some("images/alice-1.png".into()),
    }])
}

#[tokio::test]
async fn compare_engine_match_is_reported() {
    let router = Router::new().route(
        "/compare",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            if !authorised(&headers) {
                return (StatusCode::UNAUTHORIZED, Json(json!({})));
            }
            let candidates = body["candidates"].as_array().cloned().unwrap_or_default();
            let has_image = body["image"].as_str().is_some_and(|image| !image.is_empty());
            if candidates.len() != 1 || !has_image {
                return (StatusCode::BAD_REQUEST, Json(json!({})));
            }
            (
                StatusCode::OK,
                Json(json!({
                    "subject_id": candidates[0]["subject_id"],
                    "confidence": 91.5
                })),
            )
        }),
    );
    let endpoint = serve(router).await;
    let adapter = HttpCompareAdapter::new("vendor", client(&endpoint));

    let outcome = adapter.evaluate(&input(), &pool()).await.unwrap();
    assert_eq!(outcome.confidence, 91.5);
    assert_eq!(outcome.matched_subject_id.as_deref(), Some("alice"));
}

#[tokio::test]
async fn compare_engine_rejection_is_insufficient_confidence() {
    let router = Router::new().route(
        "/compare",
        post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "similarity below floor") }),
    );
    let endpoint = serve(router).await;
    let adapter = HttpCompareAdapter::new("vendor", client(&endpoint));

    let err = adapter.evaluate(&input(), &pool()).await.unwrap_err();
    assert_eq!(
        err,
        ProviderError::InsufficientConfidence("similarity below floor".into())
    );
}

#[tokio::test]
async fn compare_engine_naming_unknown_subject_is_invalid() {
    let router = Router::new().route(
        "/compare",
        post(|| async { Json(json!({ "subject_id": "mallory", "confidence": 99.0 })) }),
    );
    let endpoint = serve(router).await;
    let adapter = HttpCompareAdapter::new("vendor", client(&endpoint));

    let err = adapter.evaluate(&input(), &pool()).await.unwrap_err();
    assert_eq!(err.kind(), "invalid-response");
}

#[tokio::test]
async fn server_error_is_transport_failure() {
    let router = Router::new().route(
        "/compare",
        post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let endpoint = serve(router).await;
    let adapter = HttpCompareAdapter::new("vendor", client(&endpoint));

    let err = adapter.evaluate(&input(), &pool()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Transport(_)));
}

#[tokio::test]
async fn liveness_engine_reports_score_without_subject() {
    let router = Router::new().route(
        "/liveness",
        post(|| async { Json(json!({ "face_detected": true, "liveness": 83.0 })) }),
    );
    let endpoint = serve(router).await;
    let adapter = HttpLivenessAdapter::new("anti-spoof", client(&endpoint));

    let outcome = adapter.evaluate(&input(), &pool()).await.unwrap();
    assert_eq!(outcome.confidence, 83.0);
    assert!(outcome.matched_subject_id.is_none());
}

#[tokio::test]
async fn liveness_engine_without_face_fails() {
    let router = Router::new().route(
        "/liveness",
        post(|| async { Json(json!({ "face_detected": false })) }),
    );
    let endpoint = serve(router).await;
    let adapter = HttpLivenessAdapter::new("anti-spoof", client(&endpoint));

    let err = adapter.evaluate(&input(), &pool()).await.unwrap_err();
    assert_eq!(err, ProviderError::NoFaceDetected);
}

#[tokio::test]
async fn slow_engine_is_cut_off_at_provider_timeout() {
    let router = Router::new().route(
        "/compare",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(json!({ "subject_id": "alice", "confidence": 99.0 }))
        }),
    );
    let endpoint = serve(router).await;
    let provider = BoundedProvider::new(
        Arc::new(HttpCompareAdapter::new("vendor", client(&endpoint))),
        Duration::from_millis(200),
        1.0,
        1.0,
    );

    let started = Instant::now();
    let result = provider
        .verify(&input(), &pool(), Instant::now() + Duration::from_secs(2))
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!result.success);
    assert_eq!(result.error, Some(ProviderError::Timeout(200)));
}
