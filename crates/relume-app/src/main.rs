use std::{env, process, sync::Arc};

use chrono::{SecondsFormat, TimeZone, Utc};
use inquire::Confirm;
use serde_json::json;
use tracing_subscriber::{filter::LevelFilter, fmt};
use uuid::Uuid;

use relume_app::cli::replay::{CleanupArgs, ReplayAllArgs, ReplayOneArgs, ReplayUserArgs};
use relume_app::cli::{Cli, Commands, JobsArgs, JobsCommands, JobsStatusFormat, ReplayArgs, ReplayCommands};
use relume_app::services::queue::TaskEnvelope;
use relume_app::config;
use relume_app::error::AppError;
use relume_app::server;
use relume_app::services::context::{build_context, AppContext};
use relume_app::services::dead_letter::{dead_letter_id, DeadLetterService};
use relume_app::services::queue::TaskState;
use relume_app::services::records::JobStatus;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        _ => match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let config = config::load()?;
            server::serve(config).await?;
        }
        Some(Commands::Jobs(args)) => {
            run_jobs(args).await?;
        }
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}

/// Operator tools run against the same stores as the server but spawn no
/// workers; terminal failures raised here still land in the dead letter.
async fn operator_context() -> Result<(Arc<AppContext>, Arc<DeadLetterService>), AppError> {
    let config = config::load()?;
    let (ctx, failures) = build_context(config).await?;
    let ctx = Arc::new(ctx);
    let dead_letters = Arc::new(DeadLetterService::new(
        Arc::clone(&ctx.docs),
        Arc::clone(&ctx.records),
        Arc::clone(&ctx.credits),
        Arc::clone(&ctx.queue),
    ));
    tokio::spawn(relume_app::services::dead_letter::run_writer(
        Arc::clone(&dead_letters),
        failures,
    ));
    Ok((ctx, dead_letters))
}

fn operator_name() -> String {
    env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

async fn run_jobs(args: JobsArgs) -> Result<(), AppError> {
    let (ctx, dead_letters) = operator_context().await?;

    match args.command {
        JobsCommands::Replay(replay_args) => {
            run_replay(replay_args, dead_letters).await?;
        }
        JobsCommands::Status(status_args) => {
            let job_id = Uuid::parse_str(&status_args.id).map_err(|_| {
                AppError::Config(config::AppConfigError::Invalid(format!(
                    "`{}` is not a job id",
                    status_args.id
                )))
            })?;

            let record = ctx.records.get(&job_id)?;
            let tasks = ctx.queue.find_by_job(job_id)?;
            let dead_letter = dead_letters.get(&dead_letter_id(job_id))?;
            let recommendation = recommend(record.as_ref().map(|r| r.status), &tasks, dead_letter.is_some());

            match status_args.format {
                JobsStatusFormat::Json => {
                    let payload = json!({
                        "job_id": job_id.to_string(),
                        "record": record.as_ref().map(|r| json!({
                            "status": r.status,
                            "attempts": r.attempts_made,
                            "created_at": format_ms(r.created_at_ms),
                            "updated_at": format_ms(r.updated_at_ms),
                            "error": r.error.clone(),
                        })),
                        "tasks": tasks.iter().map(|t| json!({
                            "task_id": t.task_id.to_string(),
                            "state": t.state,
                            "attempts_made": t.attempts_made,
                            "next_attempt_at": format_ms(t.next_attempt_at_ms),
                            "last_error": t.last_error.clone(),
                        })).collect::<Vec<_>>(),
                        "dead_letter": dead_letter.as_ref().map(|d| json!({
                            "id": d.id.clone(),
                            "error_kind": d.error_kind.clone(),
                            "attempts_made": d.attempts_made,
                            "failed_at": format_ms(d.failed_at_ms),
                        })),
                        "recommendation": recommendation,
                    });
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
                JobsStatusFormat::Table => {
                    println!("job {job_id}");
                    match &record {
                        Some(record) => println!(
                            "  record: {:?}, attempts {}, updated {}",
                            record.status,
                            record.attempts_made,
                            format_ms(record.updated_at_ms)
                        ),
                        None => println!("  record: none"),
                    }
                    if tasks.is_empty() {
                        println!("  queue: no tasks");
                    }
                    for task in &tasks {
                        println!(
                            "  task {}: {:?}, attempts {}, next {}{}",
                            task.task_id,
                            task.state,
                            task.attempts_made,
                            format_ms(task.next_attempt_at_ms),
                            task.last_error
                                .as_deref()
                                .map(|e| format!(", last error: {e}"))
                                .unwrap_or_default()
                        );
                    }
                    match &dead_letter {
                        Some(entry) => println!(
                            "  dead-letter: {} ({}, {} attempts, failed {})",
                            entry.id,
                            entry.error_kind,
                            entry.attempts_made,
                            format_ms(entry.failed_at_ms)
                        ),
                        None => println!("  dead-letter: none"),
                    }
                    println!("  recommendation: {recommendation}");
                }
            }
        }
        JobsCommands::QueueStats(stats_args) => {
            let stats = ctx.queue.stats()?;
            match stats_args.format {
                JobsStatusFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                JobsStatusFormat::Table => {
                    println!("queued:    {}", stats.queued);
                    println!("leased:    {}", stats.leased);
                    println!("completed: {}", stats.completed);
                    println!("failed:    {}", stats.failed);
                    match stats.oldest_queued_ms {
                        Some(ms) => println!("oldest queued: {}", format_ms(ms)),
                        None => println!("oldest queued: -"),
                    }
                }
            }
        }
    }

    Ok(())
}

fn recommend(status: Option<JobStatus>, tasks: &[TaskEnvelope], dead_lettered: bool) -> String {
    match status {
        Some(JobStatus::Succeeded) => "no action needed".to_string(),
        Some(JobStatus::Failed) if dead_lettered => {
            "failed and archived; use `relume jobs replay replay <id>` to retry".to_string()
        }
        Some(JobStatus::Failed) => {
            "failed without a dead-letter entry; the user must resubmit".to_string()
        }
        Some(JobStatus::Running) => "in flight; check again shortly".to_string(),
        Some(JobStatus::Queued) => {
            if tasks.iter().any(|t| t.state == TaskState::Queued) {
                "waiting in the queue; no action needed".to_string()
            } else if tasks.iter().any(|t| t.state == TaskState::Leased) {
                "leased by a worker; check again shortly".to_string()
            } else {
                "record queued but no live task; consider replay or resubmission".to_string()
            }
        }
        None => "unknown job id".to_string(),
    }
}

async fn run_replay(
    args: ReplayArgs,
    dead_letters: Arc<DeadLetterService>,
) -> Result<(), AppError> {
    let actor = operator_name();

    match args.command {
        ReplayCommands::List => {
            let entries = dead_letters.list()?;
            if entries.is_empty() {
                println!("dead letter is empty");
            }
            for entry in entries {
                println!(
                    "{}  owner={}  kind={}  attempts={}  failed={}",
                    entry.id,
                    entry.owner,
                    entry.error_kind,
                    entry.attempts_made,
                    format_ms(entry.failed_at_ms)
                );
            }
        }
        ReplayCommands::Stats => {
            let stats = dead_letters.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        ReplayCommands::Replay(ReplayOneArgs {
            id,
            reason,
            max_attempts,
        }) => {
            let id = normalize_dead_letter_id(&id);
            let audit = dead_letters.replay(&id, &actor, &reason, max_attempts).await?;
            println!(
                "replayed {} as task {} (job {})",
                audit.dead_letter_id, audit.new_task_id, audit.job_id
            );
        }
        ReplayCommands::ReplayAll(ReplayAllArgs { reason, yes }) => {
            let total = dead_letters.stats()?.total;
            if total == 0 {
                println!("dead letter is empty");
                return Ok(());
            }
            if !yes && !confirm(&format!("Replay all {total} dead-letter entries?")) {
                println!("aborted");
                return Ok(());
            }
            let audits = dead_letters.replay_all(&actor, &reason).await?;
            println!("replayed {} entries", audits.len());
        }
        ReplayCommands::ReplayUser(ReplayUserArgs {
            user_id,
            reason,
        }) => {
            let audits = dead_letters.replay_user(&user_id, &actor, &reason).await?;
            println!("replayed {} entries for {user_id}", audits.len());
        }
        ReplayCommands::Cleanup(CleanupArgs { yes }) => {
            if !yes && !confirm("Remove all dead-letter entries past retention?") {
                println!("aborted");
                return Ok(());
            }
            let removed = dead_letters.cleanup()?;
            println!("removed {removed} expired entries");
        }
    }

    Ok(())
}

fn normalize_dead_letter_id(raw: &str) -> String {
    if raw.starts_with("dl:") {
        raw.to_string()
    } else {
        format!("dl:{raw}")
    }
}

fn confirm(message: &str) -> bool {
    Confirm::new(message)
        .with_default(false)
        .prompt()
        .unwrap_or(false)
}
