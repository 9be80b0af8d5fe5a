//! Admission behavior for `POST /v1/jobs`.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use image::{DynamicImage, RgbImage};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use relume_app::config::AppConfig;
use relume_app::server::build_router;
use relume_app::services::context::{build_context, AppContext};
use relume_app::services::moderation::{ModerationClient, ModerationError, ModerationVerdict};

const KEY_A: &str = "018f3a20-5a9e-7cc0-b1a5-4f2b9a1c0de3";
const KEY_B: &str = "018f3a20-5a9e-7cc0-b1a5-4f2b9a1c0de4";
const BOUNDARY: &str = "relume-test-boundary";
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

struct RejectingModeration;

#[async_trait]
impl ModerationClient for RejectingModeration {
    async fn moderate(
        &self,
        _image: &[u8],
        _context: &str,
    ) -> Result<ModerationVerdict, ModerationError> {
        Ok(ModerationVerdict {
            allowed: false,
            flags: vec!["graphic-violence".to_string()],
            rejection: Some("unsafe content".to_string()),
        })
    }
}

async fn build(custom: impl FnOnce(&mut AppConfig)) -> (TempDir, Arc<AppContext>, axum::Router) {
    let temp = TempDir::new().expect("temp dir");
    let mut config = AppConfig::dev(temp.path().to_path_buf());
    custom(&mut config);
    let (ctx, _failures) = build_context(config).await.expect("context builds");
    let ctx = Arc::new(ctx);
    let router = build_router(Arc::clone(&ctx))
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));
    (temp, ctx, router)
}

fn png_bytes() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
        image::Rgb([(x * 3) as u8, (y * 3) as u8, 120])
    }));
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("png encode");
    out
}

fn multipart_body(image: &[u8], prompt: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"in.png\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(image);
    body.extend_from_slice(b"\r\n");
    if let Some(prompt) = prompt {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"prompt\"\r\n\r\n{prompt}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(key: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/jobs")
        .header(header::AUTHORIZATION, "Bearer dev-user-a")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body)).expect("request builds")
}

fn blob_request(key: &str, object_name: &str, prompt: Option<&str>) -> Request<Body> {
    let payload = json!({
        "source": { "type": "blob", "object_name": object_name },
        "prompt": prompt,
    });
    Request::builder()
        .method("POST")
        .uri("/v1/jobs")
        .header(header::AUTHORIZATION, "Bearer dev-user-a")
        .header(header::CONTENT_TYPE, "application/json")
        .header("Idempotency-Key", key)
        .body(Body::from(payload.to_string()))
        .expect("request builds")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn missing_credential_is_unauthorized() {
    let (_temp, _ctx, router) = build(|_| {}).await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/jobs")
        .header("Idempotency-Key", KEY_A)
        .body(Body::empty())
        .expect("request builds");

    let response = router.oneshot(request).await.expect("responds");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/problem+json")
    );
    let body = body_json(response).await;
    assert_eq!(body["type"], "urn:relume:unauthorized");
}

#[tokio::test]
async fn missing_idempotency_key_is_rejected() {
    let (_temp, _ctx, router) = build(|_| {}).await;
    let response = router
        .oneshot(multipart_request(None, multipart_body(&png_bytes(), None)))
        .await
        .expect("responds");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["type"], "urn:relume:idempotency-key-missing");
}

#[tokio::test]
async fn malformed_idempotency_key_is_rejected() {
    let (_temp, _ctx, router) = build(|_| {}).await;
    // One character short of the canonical form.
    let off_by_one = &KEY_A[..35];
    let response = router
        .oneshot(multipart_request(
            Some(off_by_one),
            multipart_body(&png_bytes(), None),
        ))
        .await
        .expect("responds");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["type"], "urn:relume:idempotency-key-invalid");
}

#[tokio::test]
async fn inline_submission_is_accepted_with_location_and_rate_headers() {
    let (_temp, ctx, router) = build(|_| {}).await;
    let response = router
        .oneshot(multipart_request(
            Some(KEY_A),
            multipart_body(&png_bytes(), Some("  make it pop  ")),
        ))
        .await
        .expect("responds");

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .expect("Location header")
        .to_string();
    assert!(location.starts_with("/v1/jobs/"));
    assert_eq!(
        response
            .headers()
            .get("ratelimit-limit")
            .and_then(|v| v.to_str().ok()),
        Some("120")
    );
    assert!(response.headers().get("ratelimit-remaining").is_some());
    assert!(response.headers().get("ratelimit-reset").is_some());

    let body = body_json(response).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["credit"]["kind"], "free");
    assert_eq!(body["credit"]["amount"], 1);
    assert_eq!(body["location"], location);

    let job_id = body["job_id"].as_str().expect("job id").to_string();
    let record = ctx
        .records
        .get(&job_id.parse().expect("uuid"))
        .expect("get")
        .expect("record exists");
    assert_eq!(record.owner, "dev-user-a");
    assert_eq!(record.prompt.as_deref(), Some("make it pop"));
    assert!(record
        .preprocess_ops
        .contains(&"strip-metadata".to_string()));
}

#[tokio::test]
async fn identical_resubmission_replays_the_canonical_response() {
    let (_temp, ctx, router) = build(|_| {}).await;
    let image = png_bytes();

    let first = router
        .clone()
        .oneshot(multipart_request(Some(KEY_A), multipart_body(&image, Some("p"))))
        .await
        .expect("responds");
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let first_location = first
        .headers()
        .get(header::LOCATION)
        .cloned()
        .expect("location");
    let first_body = first.into_body().collect().await.expect("body").to_bytes();

    let second = router
        .oneshot(multipart_request(Some(KEY_A), multipart_body(&image, Some("p"))))
        .await
        .expect("responds");
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    assert_eq!(
        second.headers().get(header::LOCATION),
        Some(&first_location)
    );
    let second_body = second.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(first_body, second_body, "replay must be byte-for-byte");

    // Exactly one job record exists for that id.
    let value: Value = serde_json::from_slice(&first_body).expect("json");
    let job_id: uuid::Uuid = value["job_id"].as_str().expect("id").parse().expect("uuid");
    assert!(ctx.records.get(&job_id).expect("get").is_some());
    assert_eq!(ctx.queue.find_by_job(job_id).expect("tasks").len(), 1);
}

#[tokio::test]
async fn divergent_payload_with_same_key_conflicts() {
    let (_temp, _ctx, router) = build(|_| {}).await;
    let first = router
        .clone()
        .oneshot(multipart_request(
            Some(KEY_A),
            multipart_body(&png_bytes(), Some("p")),
        ))
        .await
        .expect("responds");
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = router
        .oneshot(multipart_request(
            Some(KEY_A),
            multipart_body(&png_bytes(), Some("different prompt")),
        ))
        .await
        .expect("responds");
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body = body_json(second).await;
    assert_eq!(body["title"], "Idempotency Conflict");
    assert_eq!(body["type"], "urn:relume:idempotency-conflict");
}

#[tokio::test]
async fn blob_reference_submission_is_accepted() {
    let (_temp, ctx, router) = build(|_| {}).await;
    let object_name = "dev-user-a/pre-uploaded.png";
    ctx.blobs
        .put("dev-user-a", object_name, &png_bytes())
        .await
        .expect("seed blob");

    let response = router
        .oneshot(blob_request(KEY_A, object_name, None))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn foreign_blob_reference_is_invalid_payload() {
    let (_temp, ctx, router) = build(|_| {}).await;
    let object_name = "dev-user-b/secret.png";
    ctx.blobs
        .put("dev-user-b", object_name, &png_bytes())
        .await
        .expect("seed blob");

    let response = router
        .oneshot(blob_request(KEY_A, object_name, None))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["type"], "urn:relume:invalid-payload");
}

#[tokio::test]
async fn unsniffable_bytes_are_unsupported_media() {
    let (_temp, _ctx, router) = build(|_| {}).await;
    let response = router
        .oneshot(multipart_request(
            Some(KEY_A),
            multipart_body(b"GIF89a not an allowed format", None),
        ))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn size_limit_is_exact() {
    let (_temp, _ctx, router) = build(|_| {}).await;

    // A valid PNG padded to exactly the limit is admitted; decoders stop at
    // the image trailer, so the padding is inert.
    let mut at_limit = png_bytes();
    at_limit.resize(MAX_IMAGE_BYTES, 0);
    let response = router
        .clone()
        .oneshot(multipart_request(Some(KEY_A), multipart_body(&at_limit, None)))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut over_limit = png_bytes();
    over_limit.resize(MAX_IMAGE_BYTES + 1, 0);
    let response = router
        .oneshot(multipart_request(Some(KEY_B), multipart_body(&over_limit, None)))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
}

#[tokio::test]
async fn moderation_reject_returns_422_without_debit() {
    let temp = TempDir::new().expect("temp dir");
    let config = AppConfig::dev(temp.path().to_path_buf());
    let (mut ctx, _failures) = build_context(config).await.expect("context builds");
    ctx.moderation = Arc::new(RejectingModeration);
    let ctx = Arc::new(ctx);
    let router = build_router(Arc::clone(&ctx))
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));

    let response = router
        .oneshot(multipart_request(
            Some(KEY_A),
            multipart_body(&png_bytes(), None),
        ))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["type"], "urn:relume:moderation-rejected");
    assert_eq!(body["categories"][0], "graphic-violence");

    // No debit, no record.
    assert!(ctx.credits.ledger_for("dev-user-a").expect("ledger").is_empty());
}

#[tokio::test]
async fn exhausted_credits_return_402_with_remaining() {
    let (_temp, ctx, router) = build(|config| {
        config.credits.daily_free_limit = 1;
    })
    .await;

    let first = router
        .clone()
        .oneshot(multipart_request(
            Some(KEY_A),
            multipart_body(&png_bytes(), None),
        ))
        .await
        .expect("responds");
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = router
        .oneshot(multipart_request(
            Some(KEY_B),
            multipart_body(&png_bytes(), None),
        ))
        .await
        .expect("responds");
    assert_eq!(second.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(second).await;
    assert_eq!(body["type"], "urn:relume:insufficient-credits");
    assert_eq!(body["remaining_credits"], 0);

    // Only the admitted job produced ledger entries.
    assert_eq!(ctx.credits.ledger_for("dev-user-a").expect("ledger").len(), 1);
}

#[tokio::test]
async fn rate_limited_user_gets_429_with_retry_hint() {
    let (_temp, _ctx, router) = build(|config| {
        config.server.rate_limit.user_limit = 2;
    })
    .await;

    for key in [KEY_A, KEY_B] {
        let response = router
            .clone()
            .oneshot(multipart_request(Some(key), multipart_body(&png_bytes(), None)))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = router
        .oneshot(multipart_request(
            Some("018f3a20-5a9e-7cc0-b1a5-4f2b9a1c0de5"),
            multipart_body(&png_bytes(), None),
        ))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("ratelimit-remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
}

#[tokio::test]
async fn post_limiter_errors_still_carry_rate_headers() {
    let (_temp, _ctx, router) = build(|_| {}).await;
    let response = router
        .oneshot(multipart_request(None, multipart_body(&png_bytes(), None)))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get("ratelimit-limit").is_some());
}
