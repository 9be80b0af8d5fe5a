//! Configuration loading and validation.
//!
//! Layered sources, lowest precedence first: built-in defaults, system and
//! XDG settings files, a local `config/settings.toml`, an explicit
//! `RELUME_CONFIG_FILE`, `RELUME__*` environment pairs, and finally the flat
//! operational variables (`JOBS_*`, `RATE_LIMIT_*`, …) recognized for
//! deployment tooling. Required secrets are checked before the server boots
//! and missing ones terminate startup with a message naming the variable.

use std::{env, path::PathBuf};

use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const ETC_CONFIG_ENV: &str = "RELUME_ETC_CONFIG_DIR";
const CONFIG_OVERRIDE_ENV: &str = "RELUME_CONFIG_FILE";
const ETC_CONFIG_DEFAULT: &str = "/etc/xdg";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("missing required secret: {0}")]
    MissingSecret(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub jobs: JobsConfig,
    pub credits: CreditsConfig,
    pub storage: StorageConfig,
    pub kv: KvConfig,
    pub provider: ProviderSettings,
    pub moderation: ModerationSettings,
    pub auth: AuthSettings,
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitSettings {
    pub user_limit: u32,
    pub user_interval_secs: u64,
    pub ip_limit: u32,
    pub ip_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct JobsConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_jitter: f64,
    pub remove_on_complete: usize,
    pub remove_on_fail: usize,
    pub worker_concurrency: usize,
    pub stalled_check_ms: u64,
    pub sse_heartbeat_ms: u64,
    pub stage_timeout_ms: u64,
    pub task_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CreditsConfig {
    pub daily_free_limit: u32,
    pub job_cost: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub blob_public_base_url: String,
    pub upload_ttl_seconds: u64,
    pub download_ttl_seconds: u64,
    pub original_retention_days: u32,
    pub result_retention_days: u32,
    /// Key material for signed blob URLs; hashed into the actual key.
    pub signing_key: String,
}

impl StorageConfig {
    pub fn docs_dir(&self) -> PathBuf {
        self.data_dir.join("docs")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn derived_signing_key(&self) -> [u8; 32] {
        *blake3::hash(self.signing_key.as_bytes()).as_bytes()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KvConfig {
    /// Shared key-value store URL. Absent means the in-process fallback,
    /// which readiness reports as degraded.
    pub redis_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// Development echo provider; no credentials needed.
    Echo,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    pub mode: ProviderMode,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub requests_per_second: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModerationMode {
    Permissive,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModerationSettings {
    pub mode: ModerationMode,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Accepts `dev-user-<id>` bearer tokens.
    Dev,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub mode: AuthMode,
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct HealthConfig {
    pub metric_sample_size: usize,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let default_data = dirs.data_dir().to_path_buf();

    let mut builder = defaults(Config::builder(), &default_data)?;

    for path in base_config_paths(&dirs) {
        debug_assert!(!path.as_os_str().is_empty());
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(override_path) = config_override_path()? {
        builder = builder.add_source(
            File::from(override_path)
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("RELUME").separator("__"));
    builder = flat_env_overrides(builder)?;

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

type Builder = ConfigBuilder<config::builder::DefaultState>;

fn defaults(builder: Builder, data_dir: &std::path::Path) -> Result<Builder, AppConfigError> {
    Ok(builder
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("server.rate_limit.user_limit", 120)?
        .set_default("server.rate_limit.user_interval_secs", 60)?
        .set_default("server.rate_limit.ip_limit", 100)?
        .set_default("server.rate_limit.ip_interval_secs", 60)?
        .set_default("jobs.max_attempts", 5)?
        .set_default("jobs.backoff_base_ms", 1_000)?
        .set_default("jobs.backoff_jitter", 0.3)?
        .set_default("jobs.remove_on_complete", 100)?
        .set_default("jobs.remove_on_fail", 500)?
        .set_default("jobs.worker_concurrency", 2)?
        .set_default("jobs.stalled_check_ms", 10_000)?
        .set_default("jobs.sse_heartbeat_ms", 30_000)?
        .set_default("jobs.stage_timeout_ms", 180_000)?
        .set_default("jobs.task_timeout_ms", 300_000)?
        .set_default("credits.daily_free_limit", 3)?
        .set_default("credits.job_cost", 1)?
        .set_default("storage.data_dir", data_dir.to_string_lossy().to_string())?
        .set_default("storage.blob_public_base_url", "http://127.0.0.1:8081")?
        .set_default("storage.upload_ttl_seconds", 900)?
        .set_default("storage.download_ttl_seconds", 900)?
        .set_default("storage.original_retention_days", 7)?
        .set_default("storage.result_retention_days", 30)?
        .set_default("storage.signing_key", "relume-dev-signing-key")?
        .set_default("kv.redis_url", None::<String>)?
        .set_default("provider.mode", "echo")?
        .set_default("provider.base_url", "https://api.restoration.example")?
        .set_default("provider.model", "restore-xl-1")?
        .set_default("provider.api_key", None::<String>)?
        .set_default("provider.requests_per_second", 4)?
        .set_default("moderation.mode", "permissive")?
        .set_default("moderation.endpoint", None::<String>)?
        .set_default("moderation.api_key", None::<String>)?
        .set_default("auth.mode", "dev")?
        .set_default("auth.endpoint", None::<String>)?
        .set_default("health.metric_sample_size", 1_000)?)
}

/// Flat variables recognized for deployment tooling, mapped onto their
/// structured keys. These outrank every other source.
fn flat_env_overrides(mut builder: Builder) -> Result<Builder, AppConfigError> {
    const MAPPING: [(&str, &str); 22] = [
        ("JOBS_MAX_ATTEMPTS", "jobs.max_attempts"),
        ("JOBS_BACKOFF_BASE_MS", "jobs.backoff_base_ms"),
        ("JOBS_BACKOFF_JITTER", "jobs.backoff_jitter"),
        ("JOBS_REMOVE_ON_COMPLETE", "jobs.remove_on_complete"),
        ("JOBS_REMOVE_ON_FAIL", "jobs.remove_on_fail"),
        ("JOBS_WORKER_CONCURRENCY", "jobs.worker_concurrency"),
        ("JOBS_STALLED_CHECK_MS", "jobs.stalled_check_ms"),
        ("JOBS_SSE_HEARTBEAT_MS", "jobs.sse_heartbeat_ms"),
        ("JOBS_STAGE_TIMEOUT_MS", "jobs.stage_timeout_ms"),
        ("JOBS_TASK_TIMEOUT_MS", "jobs.task_timeout_ms"),
        ("RATE_LIMIT_USER_LIMIT", "server.rate_limit.user_limit"),
        ("RATE_LIMIT_USER_INTERVAL", "server.rate_limit.user_interval_secs"),
        ("RATE_LIMIT_IP_LIMIT", "server.rate_limit.ip_limit"),
        ("RATE_LIMIT_IP_INTERVAL", "server.rate_limit.ip_interval_secs"),
        ("BLOB_UPLOAD_TTL_SECONDS", "storage.upload_ttl_seconds"),
        ("BLOB_DOWNLOAD_TTL_SECONDS", "storage.download_ttl_seconds"),
        ("BLOB_ORIGINAL_RETENTION_DAYS", "storage.original_retention_days"),
        ("BLOB_RESULT_RETENTION_DAYS", "storage.result_retention_days"),
        ("HEALTH_METRIC_SAMPLE_SIZE", "health.metric_sample_size"),
        ("REDIS_URL", "kv.redis_url"),
        ("PROVIDER_API_KEY", "provider.api_key"),
        ("RELUME_DATA_DIR", "storage.data_dir"),
    ];
    for (variable, key) in MAPPING {
        builder = builder.set_override_option(key, env::var(variable).ok())?;
    }
    Ok(builder)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "ribelo", "relume").ok_or(AppConfigError::MissingProjectDirs)
}

fn base_config_paths(dirs: &ProjectDirs) -> [PathBuf; 3] {
    let etc_root = etc_config_dir();
    [
        etc_root.join("relume").join("settings.toml"),
        dirs.config_dir().join("settings.toml"),
        PathBuf::from(LOCAL_CONFIG_PATH),
    ]
}

fn config_override_path() -> Result<Option<PathBuf>, AppConfigError> {
    match env::var_os(CONFIG_OVERRIDE_ENV) {
        None => Ok(None),
        Some(raw) => {
            let path = PathBuf::from(raw);
            if path.as_os_str().is_empty() {
                return Err(AppConfigError::Invalid(
                    "RELUME_CONFIG_FILE must not be empty".to_string(),
                ));
            }
            Ok(Some(path))
        }
    }
}

fn etc_config_dir() -> PathBuf {
    match env::var_os(ETC_CONFIG_ENV) {
        Some(raw) if !raw.is_empty() => PathBuf::from(raw),
        _ => PathBuf::from(ETC_CONFIG_DEFAULT),
    }
}

fn validate(config: &AppConfig) -> Result<(), AppConfigError> {
    if config.jobs.max_attempts == 0 {
        return Err(AppConfigError::Invalid(
            "jobs.max_attempts must be at least 1".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&config.jobs.backoff_jitter) {
        return Err(AppConfigError::Invalid(
            "jobs.backoff_jitter must be in [0, 1)".to_string(),
        ));
    }
    if config.jobs.worker_concurrency == 0 {
        return Err(AppConfigError::Invalid(
            "jobs.worker_concurrency must be at least 1".to_string(),
        ));
    }
    if config.server.rate_limit.user_limit == 0 || config.server.rate_limit.ip_limit == 0 {
        return Err(AppConfigError::Invalid(
            "rate limits must be at least 1".to_string(),
        ));
    }
    if config.credits.job_cost <= 0 {
        return Err(AppConfigError::Invalid(
            "credits.job_cost must be positive".to_string(),
        ));
    }
    if config.health.metric_sample_size == 0 {
        return Err(AppConfigError::Invalid(
            "health.metric_sample_size must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Secrets that must be present before `serve` boots. Checked late so the
/// operator tools can run against local stores without provider credentials.
pub fn validate_serve_secrets(config: &AppConfig) -> Result<(), AppConfigError> {
    if config.provider.mode == ProviderMode::Http
        && config.provider.api_key.as_deref().unwrap_or("").is_empty()
    {
        return Err(AppConfigError::MissingSecret("PROVIDER_API_KEY"));
    }
    if config.moderation.mode == ModerationMode::Http
        && config.moderation.endpoint.as_deref().unwrap_or("").is_empty()
    {
        return Err(AppConfigError::MissingSecret("RELUME__MODERATION__ENDPOINT"));
    }
    if config.auth.mode == AuthMode::Http
        && config.auth.endpoint.as_deref().unwrap_or("").is_empty()
    {
        return Err(AppConfigError::MissingSecret("RELUME__AUTH__ENDPOINT"));
    }
    Ok(())
}

impl AppConfig {
    /// Development profile: in-process stores, echo provider, permissive
    /// moderation, `dev-user-<id>` bearer tokens. Used by tests and local
    /// bootstrap.
    pub fn dev(data_dir: PathBuf) -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                rate_limit: RateLimitSettings {
                    user_limit: 120,
                    user_interval_secs: 60,
                    ip_limit: 100,
                    ip_interval_secs: 60,
                },
            },
            jobs: JobsConfig {
                max_attempts: 5,
                backoff_base_ms: 10,
                backoff_jitter: 0.0,
                remove_on_complete: 100,
                remove_on_fail: 500,
                worker_concurrency: 2,
                stalled_check_ms: 10_000,
                sse_heartbeat_ms: 30_000,
                stage_timeout_ms: 30_000,
                task_timeout_ms: 60_000,
            },
            credits: CreditsConfig {
                daily_free_limit: 3,
                job_cost: 1,
            },
            storage: StorageConfig {
                data_dir,
                blob_public_base_url: "http://127.0.0.1:8081".to_string(),
                upload_ttl_seconds: 900,
                download_ttl_seconds: 900,
                original_retention_days: 7,
                result_retention_days: 30,
                signing_key: "relume-dev-signing-key".to_string(),
            },
            kv: KvConfig { redis_url: None },
            provider: ProviderSettings {
                mode: ProviderMode::Echo,
                base_url: "https://api.restoration.example".to_string(),
                model: "restore-xl-1".to_string(),
                api_key: None,
                requests_per_second: 50,
            },
            moderation: ModerationSettings {
                mode: ModerationMode::Permissive,
                endpoint: None,
                api_key: None,
            },
            auth: AuthSettings {
                mode: AuthMode::Dev,
                endpoint: None,
            },
            health: HealthConfig {
                metric_sample_size: 1_000,
            },
        }
    }
}
