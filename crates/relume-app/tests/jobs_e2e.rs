//! End-to-end job flows: admission through the worker pipeline, terminal
//! failure through the dead letter, and operator replay.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use image::{DynamicImage, RgbImage};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use relume_app::config::AppConfig;
use relume_app::pipeline;
use relume_app::server::build_router;
use relume_app::services::context::{build_context, AppContext};
use relume_app::services::credits::LedgerKind;
use relume_app::services::dead_letter::{dead_letter_id, DeadLetterService};
use relume_app::services::provider::{ProviderError, RestorationProvider, RestoredImage};
use relume_app::services::queue::TerminalFailure;
use relume_app::services::records::JobStatus;

const KEY: &str = "018f3a20-5a9e-7cc0-b1a5-4f2b9a1c0df0";
const BOUNDARY: &str = "relume-e2e-boundary";

struct AlwaysFailingProvider;

#[async_trait]
impl RestorationProvider for AlwaysFailingProvider {
    async fn restore(&self, _prompt: &str, _image: &[u8]) -> Result<RestoredImage, ProviderError> {
        Err(ProviderError::Status {
            status: 503,
            body: "upstream keeps failing".to_string(),
        })
    }
}

struct Fixture {
    _temp: TempDir,
    ctx: Arc<AppContext>,
    router: axum::Router,
    failures: tokio::sync::mpsc::UnboundedReceiver<TerminalFailure>,
    dead_letters: Arc<DeadLetterService>,
}

async fn fixture(failing_provider: bool) -> Fixture {
    let temp = TempDir::new().expect("temp dir");
    let config = AppConfig::dev(temp.path().to_path_buf());
    let (mut ctx, failures) = build_context(config).await.expect("context builds");
    if failing_provider {
        ctx.provider = Arc::new(AlwaysFailingProvider);
    }
    let ctx = Arc::new(ctx);
    let router = build_router(Arc::clone(&ctx))
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));
    let dead_letters = Arc::new(DeadLetterService::new(
        Arc::clone(&ctx.docs),
        Arc::clone(&ctx.records),
        Arc::clone(&ctx.credits),
        Arc::clone(&ctx.queue),
    ));
    Fixture {
        _temp: temp,
        ctx,
        router,
        failures,
        dead_letters,
    }
}

fn jpeg_bytes() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_fn(512, 512, |x, y| {
        image::Rgb([(x / 2) as u8, (y / 2) as u8, 96])
    }));
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)
        .expect("jpeg encode");
    out
}

fn submit_request(key: &str) -> Request<Body> {
    let image = jpeg_bytes();
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"photo.jpg\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&image);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/v1/jobs")
        .header(header::AUTHORIZATION, "Bearer dev-user-e2e")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("Idempotency-Key", key)
        .body(Body::from(body))
        .expect("request builds")
}

async fn submit(fx: &Fixture, key: &str) -> Uuid {
    let response = fx
        .router
        .clone()
        .oneshot(submit_request(key))
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("json");
    value["job_id"].as_str().expect("job id").parse().expect("uuid")
}

async fn get_job(fx: &Fixture, job_id: Uuid) -> (StatusCode, Value) {
    let response = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/v1/jobs/{job_id}"))
                .header(header::AUTHORIZATION, "Bearer dev-user-e2e")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("responds");
    let status = response.status();
    let body = response.into_body().collect().await.expect("body").to_bytes();
    (status, serde_json::from_slice(&body).expect("json"))
}

/// Drain the queue by running every due delivery through the worker path.
async fn drain_queue(fx: &Fixture) {
    loop {
        match fx.ctx.queue.claim().expect("claim") {
            Some(lease) => pipeline::run_one(&fx.ctx, lease).await,
            None => {
                // Retries may be scheduled a few ms out under the dev config.
                let stats = fx.ctx.queue.stats().expect("stats");
                if stats.queued == 0 && stats.leased == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }
    }
}

#[tokio::test]
async fn happy_path_free_submission_succeeds_end_to_end() {
    let mut fx = fixture(false).await;
    let job_id = submit(&fx, KEY).await;

    let (status, body) = get_job(&fx, job_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");

    drain_queue(&fx).await;

    let (status, body) = get_job(&fx, job_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["credit"]["kind"], "free");
    assert!(body["download_url"].as_str().expect("signed url").contains("sig="));
    assert!(body["timings"]["total_ms"].is_number());
    assert!(body["enhanced_prompt"].is_string());
    assert_eq!(body["classification"].as_object().expect("map").len(), 7);

    // One free debit, no refund, free counter consumed once.
    let ledger = fx.ctx.credits.ledger_for("dev-user-e2e").expect("ledger");
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].kind, LedgerKind::Free);
    assert_eq!(ledger[0].amount, -1);

    // No terminal failure was emitted.
    assert!(fx.failures.try_recv().is_err());
}

#[tokio::test]
async fn provider_exhaustion_dead_letters_refunds_and_replays() {
    let mut fx = fixture(true).await;
    let job_id = submit(&fx, KEY).await;

    drain_queue(&fx).await;

    // The attempt budget (5 in the dev profile) is exhausted.
    let failure = fx.failures.try_recv().expect("terminal failure emitted");
    assert_eq!(failure.envelope.attempts_made, 5);
    assert_eq!(failure.envelope.task.job_id, job_id);

    fx.dead_letters
        .handle_failure(failure)
        .await
        .expect("dead-letter write");

    let (status, body) = get_job(&fx, job_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["kind"], "provider-exhausted");
    assert!(body["download_url"].is_null());

    // Exactly one debit and one refund referencing it.
    let ledger = fx.ctx.credits.ledger_for("dev-user-e2e").expect("ledger");
    assert_eq!(ledger.len(), 2);
    let debit = ledger.iter().find(|e| e.kind == LedgerKind::Free).expect("debit");
    let refund = ledger
        .iter()
        .find(|e| e.kind == LedgerKind::Refund)
        .expect("refund");
    assert_eq!(refund.refunds, Some(debit.id));
    assert_eq!(refund.amount, 1);

    // Replay re-enqueues without re-debiting.
    let audit = fx
        .dead_letters
        .replay(&dead_letter_id(job_id), "ops", "provider recovered", None)
        .await
        .expect("replay");
    assert_eq!(audit.job_id, job_id);
    let lease = fx.ctx.queue.claim().expect("claim").expect("replayed task");
    let marker = lease.envelope.task.replay.expect("marker");
    assert_eq!(marker.original_job_id, job_id);
    assert_eq!(marker.previous_attempts, 5);
    assert_eq!(
        fx.ctx.credits.ledger_for("dev-user-e2e").expect("ledger").len(),
        2,
        "replay must not debit"
    );
    assert!(fx
        .dead_letters
        .get(&dead_letter_id(job_id))
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn foreign_and_missing_jobs_share_the_not_found_shape() {
    let fx = fixture(false).await;
    let job_id = submit(&fx, KEY).await;

    let missing = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/v1/jobs/{}", Uuid::now_v7()))
                .header(header::AUTHORIZATION, "Bearer dev-user-e2e")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("responds");
    let foreign = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/v1/jobs/{job_id}"))
                .header(header::AUTHORIZATION, "Bearer dev-user-other")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("responds");

    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);

    let missing_body = missing.into_body().collect().await.expect("body").to_bytes();
    let foreign_body = foreign.into_body().collect().await.expect("body").to_bytes();
    let missing_json: Value = serde_json::from_slice(&missing_body).expect("json");
    let foreign_json: Value = serde_json::from_slice(&foreign_body).expect("json");
    assert_eq!(missing_json["type"], foreign_json["type"]);
    assert_eq!(missing_json["title"], foreign_json["title"]);
    assert_eq!(missing_json["detail"], foreign_json["detail"]);
}

#[tokio::test]
async fn stream_of_terminal_job_emits_status_and_closes() {
    let fx = fixture(false).await;
    let job_id = submit(&fx, KEY).await;
    drain_queue(&fx).await;

    let response = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/v1/jobs/{job_id}/stream"))
                .header(header::AUTHORIZATION, "Bearer dev-user-e2e")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("responds");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .expect("content type")
        .starts_with("text/event-stream"));

    // Terminal job: the stream closes after the initial status event, so the
    // whole body is collectable.
    let body = response.into_body().collect().await.expect("body").to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains(": connected"));
    assert!(text.contains("event: status"));
    assert!(text.contains("\"succeeded\""));
}

#[tokio::test]
async fn duplicate_delivery_after_success_writes_nothing() {
    let fx = fixture(false).await;
    let job_id = submit(&fx, KEY).await;

    let lease = fx.ctx.queue.claim().expect("claim").expect("due");
    pipeline::process_lease(&fx.ctx, &lease)
        .await
        .expect("first delivery succeeds");
    let first = fx.ctx.records.get(&job_id).expect("get").expect("exists");
    assert_eq!(first.status, JobStatus::Succeeded);

    // Simulated redelivery of the same lease.
    pipeline::process_lease(&fx.ctx, &lease)
        .await
        .expect("duplicate is a clean no-op");
    let second = fx.ctx.records.get(&job_id).expect("get").expect("exists");
    assert_eq!(second.updated_at_ms, first.updated_at_ms);
}
