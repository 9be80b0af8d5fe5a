//! Job submission, point lookup, and the status push stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequest, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::pipeline::preprocess::{prepare_image, PreparedImage, MAX_INLINE_IMAGE_BYTES};
use crate::server::auth::{authenticate, request_id};
use crate::server::problem::{apply_rate_headers, ErrorKind, Problem};
use crate::services::context::AppContext;
use crate::services::credits::DebitKind;
use crate::services::idempotency::{validate_idempotency_key, IdempotencyEntry};
use crate::services::moderation::{moderate_fail_closed, ModerationVerdict};
use crate::services::queue::QueueTask;
use crate::services::rate_limit::{RateOutcome, RateSnapshot};
use crate::services::records::{DebitRecord, JobRecord, JobStatus};
use crate::trace::TraceContext;

const JOBS_PATH: &str = "/v1/jobs";
const JSON_BODY_LIMIT: usize = 1 << 20;
const FILE_TOO_LARGE_RETRY_SECS: u64 = 30;
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Serialize, Clone, Copy)]
struct CreditInfo {
    amount: i64,
    kind: DebitKind,
}

#[derive(Debug, Serialize)]
struct SubmitAccepted {
    job_id: String,
    status: JobStatus,
    credit: CreditInfo,
    location: String,
}

#[derive(Debug, Deserialize)]
struct BlobSubmitBody {
    source: BlobSource,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobSource {
    #[serde(rename = "type")]
    kind: String,
    object_name: String,
}

/// Decoded submission content; the canonical input to fingerprinting.
struct Submission {
    image: Vec<u8>,
    prompt: Option<String>,
    source: SubmissionSource,
}

enum SubmissionSource {
    Inline,
    Blob { object_name: String },
}

pub async fn submit_job(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let rid = request_id(&headers);
    match admit(&ctx, addr, &headers, rid.clone(), request).await {
        Ok(response) => response,
        Err(problem) => problem.with_instance(rid).into_response(),
    }
}

/// Admission steps 1–2, then the rate-limited remainder. Every response
/// produced after the limiter carries its headers.
async fn admit(
    ctx: &Arc<AppContext>,
    addr: SocketAddr,
    headers: &HeaderMap,
    rid: Option<String>,
    request: Request,
) -> Result<Response, Problem> {
    // 1. Identity.
    let user = authenticate(ctx, headers).await?;
    let owner = user.user_id.as_str();

    // 2. Rate limits: user bucket, then peer bucket.
    let rate = match ctx
        .rate_limits
        .check(owner, addr.ip())
        .await
        .map_err(|e| Problem::internal(e.to_string()))?
    {
        RateOutcome::Admitted(snapshot) => snapshot,
        RateOutcome::Denied(snapshot) => {
            return Err(Problem::new(ErrorKind::RateLimitExceeded)
                .with_detail("request rate exceeded; slow down")
                .with_retry_after(snapshot.reset_secs)
                .with_rate(snapshot));
        }
    };

    admit_limited(ctx, owner, rate, headers, rid, request)
        .await
        .map_err(|problem| problem.with_rate(rate))
}

/// Admission steps 3–11.
async fn admit_limited(
    ctx: &Arc<AppContext>,
    owner: &str,
    rate: RateSnapshot,
    headers: &HeaderMap,
    rid: Option<String>,
    request: Request,
) -> Result<Response, Problem> {
    // 3. Idempotency key, canonical 128-bit textual form.
    let Some(raw_key) = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(Problem::new(ErrorKind::IdempotencyKeyMissing)
            .with_detail("POST /v1/jobs requires an Idempotency-Key header"));
    };
    let Some(key) = validate_idempotency_key(raw_key.trim()) else {
        return Err(Problem::new(ErrorKind::IdempotencyKeyInvalid)
            .with_detail("Idempotency-Key must be a canonical lowercase UUID"));
    };
    let key = key.to_string();

    // 4. Decode the request body.
    let submission = decode_submission(ctx, owner, request).await?;

    // 5. Preprocess.
    let prepared = prepare_image(&submission.image).map_err(|error| {
        Problem::new(ErrorKind::UnsupportedMediaType).with_detail(error.to_string())
    })?;

    // 6. Moderation, fail closed.
    let verdict = moderate_fail_closed(ctx.moderation.as_ref(), &prepared.bytes, "job-submission").await;
    if !verdict.allowed {
        if let Err(error) = crate::services::moderation::append_audit(&ctx.docs, owner, &verdict) {
            tracing::warn!(%error, "failed to append moderation audit");
        }
        return Err(Problem::new(ErrorKind::ModerationRejected)
            .with_detail(
                verdict
                    .rejection
                    .clone()
                    .unwrap_or_else(|| "content failed moderation".to_string()),
            )
            .with_extension("categories", json!(verdict.flags)));
    }

    // 7. Fingerprint and idempotency consult.
    let fingerprint = submission_fingerprint(&submission);
    if let Some(entry) = ctx
        .idempotency
        .get(owner, &key)
        .await
        .map_err(|e| Problem::internal(e.to_string()))?
    {
        if entry.fingerprint == fingerprint {
            tracing::info!(%owner, "idempotent replay of canonical response");
            return Ok(replay_response(entry, &rate));
        }
        return Err(Problem::new(ErrorKind::IdempotencyConflict)
            .with_detail("this Idempotency-Key was used with a different payload"));
    }

    // Steps 8–11 run detached from the connection: a peer disconnect after
    // the debit must not strand the job without enqueue or compensation.
    let finalize = tokio::spawn(finalize_admission(
        Arc::clone(ctx),
        owner.to_string(),
        key,
        fingerprint,
        rate,
        rid,
        submission,
        prepared,
        verdict,
        TraceContext::from_headers(headers),
    ));
    match finalize.await {
        Ok(result) => result,
        Err(join_error) => Err(Problem::internal(format!(
            "admission finalization aborted: {join_error}"
        ))),
    }
}

/// Admission steps 8–11, owning everything it needs.
#[allow(clippy::too_many_arguments)]
async fn finalize_admission(
    ctx: Arc<AppContext>,
    owner: String,
    key: String,
    fingerprint: String,
    rate: RateSnapshot,
    rid: Option<String>,
    submission: Submission,
    prepared: PreparedImage,
    verdict: ModerationVerdict,
    trace: TraceContext,
) -> Result<Response, Problem> {
    let owner = owner.as_str();

    // 8. Credits.
    let job_id = Uuid::now_v7();
    let decision = ctx
        .credits
        .check_and_deduct(owner, job_id)
        .await
        .map_err(|e| Problem::internal(e.to_string()))?;
    if !decision.allowed {
        let problem = Problem::new(ErrorKind::InsufficientCredits)
            .with_detail("free tier exhausted and paid balance is empty")
            .with_instance(rid.clone())
            .with_extension("remaining_credits", decision.remaining);
        store_entry(&ctx, owner, &key, &fingerprint, &problem).await;
        return Ok(problem.with_rate(rate).into_response());
    }
    let debit = DebitRecord {
        amount: decision.amount,
        kind: decision.kind.unwrap_or(DebitKind::Free),
    };

    // 9. Job record.
    let mut record = JobRecord::new(job_id, owner);
    record.prompt = submission.prompt.clone();
    record.preprocess_ops = prepared.operations.clone();
    record.moderation = Some(verdict.clone());
    record.debit = Some(debit);
    ctx.records
        .create(&record)
        .map_err(|e| Problem::internal(e.to_string()))?;

    // 10. Stage the prepared image and enqueue; compensate on failure.
    let source_object = format!("{owner}/{job_id}-src.jpg");
    if let Err(error) = ctx.blobs.put(owner, &source_object, &prepared.bytes).await {
        return Err(compensate(&ctx, owner, job_id, "blob-store", &error.to_string()).await);
    }
    let task = QueueTask {
        job_id,
        owner: owner.to_string(),
        prompt: submission.prompt.clone(),
        source_object,
        source_format: prepared.source_format.slug().to_string(),
        moderation_flags: verdict.flags.clone(),
        classification_hints: None,
        debit: Some(debit),
        trace,
        replay: None,
    };
    if let Err(error) = ctx.queue.enqueue(task) {
        return Err(compensate(&ctx, owner, job_id, "enqueue", &error.to_string()).await);
    }

    // 11. Canonical 202, stored then emitted.
    let location = format!("{JOBS_PATH}/{job_id}");
    let accepted = SubmitAccepted {
        job_id: job_id.to_string(),
        status: JobStatus::Queued,
        credit: CreditInfo {
            amount: debit.amount,
            kind: debit.kind,
        },
        location: location.clone(),
    };
    let body = serde_json::to_vec(&accepted).map_err(|e| Problem::internal(e.to_string()))?;
    let canonical_headers = vec![
        ("location".to_string(), location),
        ("content-type".to_string(), "application/json".to_string()),
    ];
    if let Err(error) = ctx
        .idempotency
        .put(owner, &key, &fingerprint, 202, &canonical_headers, &body)
        .await
    {
        tracing::warn!(%error, "failed to store idempotency entry");
    }

    tracing::info!(%owner, %job_id, kind = ?debit.kind, "job admitted");
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::ACCEPTED;
    for (name, value) in &canonical_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    apply_rate_headers(response.headers_mut(), &rate);
    Ok(response)
}

async fn decode_submission(
    ctx: &AppContext,
    owner: &str,
    request: Request,
) -> Result<Submission, Problem> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        return decode_multipart(request).await;
    }
    if content_type.starts_with("application/json") {
        return decode_blob_reference(ctx, owner, request).await;
    }
    Err(Problem::new(ErrorKind::InvalidPayload)
        .with_detail("body must be multipart/form-data or application/json"))
}

async fn decode_multipart(request: Request) -> Result<Submission, Problem> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| Problem::new(ErrorKind::InvalidPayload).with_detail(e.to_string()))?;

    let mut image: Option<Vec<u8>> = None;
    let mut prompt: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Problem::new(ErrorKind::InvalidPayload).with_detail(e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                let bytes = field.bytes().await.map_err(|e| {
                    Problem::new(ErrorKind::FileTooLarge)
                        .with_detail(e.to_string())
                        .with_retry_after(FILE_TOO_LARGE_RETRY_SECS)
                })?;
                if bytes.len() > MAX_INLINE_IMAGE_BYTES {
                    return Err(Problem::new(ErrorKind::FileTooLarge)
                        .with_detail(format!(
                            "image exceeds the {MAX_INLINE_IMAGE_BYTES}-byte limit"
                        ))
                        .with_retry_after(FILE_TOO_LARGE_RETRY_SECS));
                }
                image = Some(bytes.to_vec());
            }
            Some("prompt") => {
                let text = field.text().await.map_err(|e| {
                    Problem::new(ErrorKind::InvalidPayload).with_detail(e.to_string())
                })?;
                prompt = normalize_prompt(Some(text));
            }
            _ => {}
        }
    }

    let Some(image) = image else {
        return Err(Problem::new(ErrorKind::InvalidPayload)
            .with_detail("multipart body must contain an `image` part"));
    };
    Ok(Submission {
        image,
        prompt,
        source: SubmissionSource::Inline,
    })
}

async fn decode_blob_reference(
    ctx: &AppContext,
    owner: &str,
    request: Request,
) -> Result<Submission, Problem> {
    let body = axum::body::to_bytes(request.into_body(), JSON_BODY_LIMIT)
        .await
        .map_err(|e| Problem::new(ErrorKind::InvalidPayload).with_detail(e.to_string()))?;
    let parsed: BlobSubmitBody = serde_json::from_slice(&body)
        .map_err(|e| Problem::new(ErrorKind::InvalidPayload).with_detail(e.to_string()))?;
    if parsed.source.kind != "blob" {
        return Err(Problem::new(ErrorKind::InvalidPayload)
            .with_detail("source.type must be \"blob\""));
    }

    // Ownership is enforced by the store: foreign objects read as missing.
    let image = ctx
        .blobs
        .download(owner, &parsed.source.object_name)
        .await
        .map_err(|_| {
            Problem::new(ErrorKind::InvalidPayload)
                .with_detail("referenced object does not exist or is not yours")
        })?;

    Ok(Submission {
        image,
        prompt: normalize_prompt(parsed.prompt),
        source: SubmissionSource::Blob {
            object_name: parsed.source.object_name,
        },
    })
}

fn normalize_prompt(prompt: Option<String>) -> Option<String> {
    prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

/// Fingerprint over method, path, and the decoded canonical content, so
/// multipart boundaries and JSON whitespace do not defeat replay detection.
fn submission_fingerprint(submission: &Submission) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"POST\n");
    hasher.update(JOBS_PATH.as_bytes());
    hasher.update(b"\n");
    match &submission.source {
        SubmissionSource::Inline => {
            hasher.update(b"inline\n");
            hasher.update(&submission.image);
        }
        SubmissionSource::Blob { object_name } => {
            hasher.update(b"blob\n");
            hasher.update(object_name.as_bytes());
        }
    }
    hasher.update(b"\n");
    if let Some(prompt) = &submission.prompt {
        hasher.update(prompt.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Refund and fail the record after a post-debit admission failure.
async fn compensate(
    ctx: &AppContext,
    owner: &str,
    job_id: Uuid,
    stage: &'static str,
    error: &str,
) -> Problem {
    tracing::error!(%owner, %job_id, stage, %error, "admission failed after debit; compensating");
    if let Err(refund_error) = ctx.credits.refund(owner, job_id, "admission failed").await {
        tracing::error!(%job_id, %refund_error, "compensating refund failed");
    }
    if let Err(record_error) = ctx.records.mark_failed(&job_id, stage, error) {
        tracing::error!(%job_id, %record_error, "failed to mark record failed");
    }
    Problem::internal(format!("{stage} failure during admission"))
}

async fn store_entry(ctx: &AppContext, owner: &str, key: &str, fingerprint: &str, problem: &Problem) {
    let headers = vec![(
        "content-type".to_string(),
        crate::server::problem::PROBLEM_CONTENT_TYPE.to_string(),
    )];
    let status = problem.kind().status().as_u16();
    if let Err(error) = ctx
        .idempotency
        .put(owner, key, fingerprint, status, &headers, &problem.body_bytes())
        .await
    {
        tracing::warn!(%error, "failed to store idempotency entry");
    }
}

fn replay_response(entry: IdempotencyEntry, rate: &RateSnapshot) -> Response {
    let mut response = Response::new(Body::from(entry.body));
    *response.status_mut() =
        StatusCode::from_u16(entry.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    apply_rate_headers(response.headers_mut(), rate);
    response
}

#[derive(Debug, Serialize)]
struct ModerationSummary {
    allowed: bool,
    flags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JobProjection {
    job_id: String,
    status: JobStatus,
    created_at: String,
    updated_at: String,
    attempts: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    preprocess_ops: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credit: Option<CreditInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enhanced_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification: Option<std::collections::BTreeMap<String, f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timings: Option<crate::services::records::StageTimings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    moderation: Option<ModerationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<crate::services::records::JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_expires_at: Option<String>,
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn format_unix(secs: u64) -> String {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Owner-facing view of a record; mints a fresh download URL on success.
async fn project(ctx: &AppContext, record: &JobRecord) -> JobProjection {
    let mut download_url = None;
    let mut download_expires_at = None;
    if record.status == JobStatus::Succeeded {
        if let Some(result_object) = &record.result_object {
            let filename = format!("restored-{}.jpg", record.id);
            match ctx
                .blobs
                .issue_download_url(&record.owner, result_object, &filename)
                .await
            {
                Ok(target) => {
                    download_url = Some(target.download_url);
                    download_expires_at = Some(format_unix(target.expires_at_unix));
                }
                Err(error) => {
                    tracing::warn!(job_id = %record.id, %error, "failed to mint download url");
                }
            }
        }
    }

    JobProjection {
        job_id: record.id.to_string(),
        status: record.status,
        created_at: format_ms(record.created_at_ms),
        updated_at: format_ms(record.updated_at_ms),
        attempts: record.attempts_made,
        preprocess_ops: record.preprocess_ops.clone(),
        credit: record.debit.map(|debit| CreditInfo {
            amount: debit.amount,
            kind: debit.kind,
        }),
        prompt: record.prompt.clone(),
        enhanced_prompt: record.enhanced_prompt.clone(),
        classification: record.classification.clone(),
        timings: record.timings,
        moderation: record.moderation.as_ref().map(|verdict| ModerationSummary {
            allowed: verdict.allowed,
            flags: verdict.flags.clone(),
        }),
        error: record.error.clone(),
        download_url,
        download_expires_at,
    }
}

/// Missing, foreign, and malformed ids share one response shape.
fn job_not_found(rid: Option<String>) -> Problem {
    Problem::new(ErrorKind::NotFound)
        .with_detail("no such job")
        .with_instance(rid)
}

async fn load_owned_record(
    ctx: &AppContext,
    owner: &str,
    raw_id: &str,
    rid: Option<String>,
) -> Result<JobRecord, Problem> {
    let Ok(job_id) = Uuid::parse_str(raw_id) else {
        return Err(job_not_found(rid));
    };
    let record = ctx
        .records
        .get(&job_id)
        .map_err(|e| Problem::internal(e.to_string()))?;
    match record {
        Some(record) if record.owner == owner => Ok(record),
        _ => Err(job_not_found(rid)),
    }
}

pub async fn get_job(
    State(ctx): State<Arc<AppContext>>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let rid = request_id(&headers);
    let user = match authenticate(&ctx, &headers).await {
        Ok(user) => user,
        Err(problem) => return problem.into_response(),
    };
    match load_owned_record(&ctx, &user.user_id, &raw_id, rid).await {
        Ok(record) => axum::Json(project(&ctx, &record).await).into_response(),
        Err(problem) => problem.into_response(),
    }
}

pub async fn stream_job(
    State(ctx): State<Arc<AppContext>>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let rid = request_id(&headers);
    let user = match authenticate(&ctx, &headers).await {
        Ok(user) => user,
        Err(problem) => return problem.into_response(),
    };
    let record = match load_owned_record(&ctx, &user.user_id, &raw_id, rid).await {
        Ok(record) => record,
        Err(problem) => return problem.into_response(),
    };

    let job_id = record.id;
    let heartbeat = Duration::from_millis(ctx.config.jobs.sse_heartbeat_ms.max(1_000));
    // Subscribe before projecting so no transition can slip between the
    // snapshot and the subscription.
    let mut changes = ctx.records.subscribe();

    let stream = async_stream::stream! {
        yield Ok::<Event, std::convert::Infallible>(Event::default().comment("connected"));

        let initial = project(&ctx, &record).await;
        let mut terminal = record.status.is_terminal();
        match serde_json::to_string(&initial) {
            Ok(data) => yield Ok(Event::default().event("status").data(data)),
            Err(error) => {
                yield Ok(Event::default().event("error").data(error.to_string()));
                return;
            }
        }

        while !terminal {
            match changes.recv().await {
                Ok(changed) if changed.id == job_id => {
                    terminal = changed.status.is_terminal();
                    let projection = project(&ctx, &changed).await;
                    match serde_json::to_string(&projection) {
                        Ok(data) => yield Ok(Event::default().event("status").data(data)),
                        Err(error) => {
                            yield Ok(Event::default().event("error").data(error.to_string()));
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%job_id, skipped, "stream lagged behind record changes");
                    // Resync from the store after a lag.
                    if let Ok(Some(current)) = ctx.records.get(&job_id) {
                        terminal = current.status.is_terminal();
                        let projection = project(&ctx, &current).await;
                        if let Ok(data) = serde_json::to_string(&projection) {
                            yield Ok(Event::default().event("status").data(data));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    yield Ok(Event::default().event("error").data("{\"message\":\"stream closed\"}"));
                    return;
                }
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(image: &[u8], prompt: Option<&str>, source: SubmissionSource) -> Submission {
        Submission {
            image: image.to_vec(),
            prompt: prompt.map(str::to_string),
            source,
        }
    }

    #[test]
    fn fingerprint_ignores_transport_framing_but_not_content() {
        let a = submission(b"img", Some("p"), SubmissionSource::Inline);
        let b = submission(b"img", Some("p"), SubmissionSource::Inline);
        assert_eq!(submission_fingerprint(&a), submission_fingerprint(&b));

        let other_prompt = submission(b"img", Some("q"), SubmissionSource::Inline);
        assert_ne!(
            submission_fingerprint(&a),
            submission_fingerprint(&other_prompt)
        );

        let other_image = submission(b"img2", Some("p"), SubmissionSource::Inline);
        assert_ne!(
            submission_fingerprint(&a),
            submission_fingerprint(&other_image)
        );

        let blob = submission(
            b"img",
            Some("p"),
            SubmissionSource::Blob {
                object_name: "user/x.jpg".to_string(),
            },
        );
        assert_ne!(submission_fingerprint(&a), submission_fingerprint(&blob));
    }

    #[test]
    fn prompts_are_trimmed_and_emptied() {
        assert_eq!(normalize_prompt(Some("  hi  ".to_string())), Some("hi".to_string()));
        assert_eq!(normalize_prompt(Some("   ".to_string())), None);
        assert_eq!(normalize_prompt(None), None);
    }

    #[test]
    fn timestamps_render_rfc3339() {
        let rendered = format_ms(1_700_000_000_000);
        assert!(rendered.starts_with("2023-11-14T"));
        assert!(rendered.ends_with('Z'));
    }
}
