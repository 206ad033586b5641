use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/config/connmon.yaml";

/// Top-level configuration for the connmon service.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub country: CountryConfig,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub sync_token: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            country: CountryConfig::default(),
            regions: Vec::new(),
            dsn: String::new(),
            sync_token: String::new(),
            upstream: UpstreamConfig::default(),
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// The monitored country.
#[derive(Debug, Clone, Deserialize)]
pub struct CountryConfig {
    pub code: String,
    pub name: String,
}

impl Default for CountryConfig {
    fn default() -> Self {
        Self {
            code: "VE".into(),
            name: "Venezuela".into(),
        }
    }
}

/// One monitored subnational region.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub code: String,
    pub name: String,
}

/// Upstream measurement service endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "UpstreamConfig::default_base_url")]
    pub base_url: String,
    #[serde(
        default = "UpstreamConfig::default_request_timeout",
        with = "humantime_serde"
    )]
    pub request_timeout: Duration,
}

impl UpstreamConfig {
    fn default_base_url() -> String {
        "https://api.measurements.example/v2".to_string()
    }

    const fn default_request_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            request_timeout: Self::default_request_timeout(),
        }
    }
}

/// Sync scheduling, windowing, and pacing knobs.
///
/// The pacing delays are empirically tuned safe margins against the
/// upstream's undocumented rate limits; they are configuration, not contract.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Scheduled latest-window sync for the country.
    #[serde(
        default = "SyncConfig::default_national_interval",
        with = "humantime_serde"
    )]
    pub national_interval: Duration,
    /// Scheduled region series + score sync.
    #[serde(
        default = "SyncConfig::default_regional_interval",
        with = "humantime_serde"
    )]
    pub regional_interval: Duration,
    /// Width of the "latest window" fetched by live syncs.
    #[serde(
        default = "SyncConfig::default_latest_window",
        with = "humantime_serde"
    )]
    pub latest_window: Duration,
    /// Stored data older than this triggers a refresh on read.
    #[serde(
        default = "SyncConfig::default_refresh_interval",
        with = "humantime_serde"
    )]
    pub refresh_interval: Duration,
    /// Pause between sequential single-entity datasource calls.
    #[serde(
        default = "SyncConfig::default_datasource_delay",
        with = "humantime_serde"
    )]
    pub datasource_delay: Duration,
    /// Unconditional pause between backfill chunks.
    #[serde(default = "SyncConfig::default_chunk_pause", with = "humantime_serde")]
    pub chunk_pause: Duration,
    /// Width of one backfill chunk.
    #[serde(
        default = "SyncConfig::default_backfill_chunk",
        with = "humantime_serde"
    )]
    pub backfill_chunk: Duration,
    /// Hard cap on simultaneous outbound calls during batch region fetches.
    #[serde(default = "SyncConfig::default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

impl SyncConfig {
    const fn default_national_interval() -> Duration {
        Duration::from_secs(6 * 3600)
    }

    const fn default_regional_interval() -> Duration {
        Duration::from_secs(6 * 3600)
    }

    const fn default_latest_window() -> Duration {
        Duration::from_secs(25 * 3600)
    }

    const fn default_refresh_interval() -> Duration {
        Duration::from_secs(24 * 3600)
    }

    const fn default_datasource_delay() -> Duration {
        Duration::from_secs(2)
    }

    const fn default_chunk_pause() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_backfill_chunk() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }

    const fn default_fetch_concurrency() -> usize {
        5
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            national_interval: Self::default_national_interval(),
            regional_interval: Self::default_regional_interval(),
            latest_window: Self::default_latest_window(),
            refresh_interval: Self::default_refresh_interval(),
            datasource_delay: Self::default_datasource_delay(),
            chunk_pause: Self::default_chunk_pause(),
            backfill_chunk: Self::default_backfill_chunk(),
            fetch_concurrency: Self::default_fetch_concurrency(),
        }
    }
}

/// In-process fallback cache tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl CacheConfig {
    const fn default_ttl() -> Duration {
        Duration::from_secs(15 * 60)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Self::default_ttl(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8282".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

/// Load configuration from a YAML file, falling back to defaults + env
/// overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("CONNMON_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    ensure_required_secrets(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.dsn.trim().is_empty() {
        bail!(
            "Remove `dsn` from connmon YAML config; set the Postgres connection string via the CONNMON_DSN environment variable."
        );
    }
    if !config.sync_token.trim().is_empty() {
        bail!(
            "Remove `sync_token` from connmon YAML config; set the sync secret via the CONNMON_SYNC_TOKEN environment variable."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    match env::var("CONNMON_DSN") {
        Ok(dsn) => {
            if dsn.trim().is_empty() {
                bail!("Environment variable CONNMON_DSN is set but empty.");
            }
            config.dsn = dsn;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    }

    match env::var("CONNMON_SYNC_TOKEN") {
        Ok(token) => {
            if token.trim().is_empty() {
                bail!("Environment variable CONNMON_SYNC_TOKEN is set but empty.");
            }
            config.sync_token = token;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    }

    if let Ok(base_url) = env::var("CONNMON_UPSTREAM_URL") {
        if !base_url.is_empty() {
            config.upstream.base_url = base_url;
        }
    }

    Ok(())
}

fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.dsn.trim().is_empty() {
        bail!(
            "Missing Postgres DSN. Set the CONNMON_DSN environment variable. Secrets must not be stored in YAML."
        );
    }
    if config.sync_token.trim().is_empty() {
        bail!(
            "Missing sync secret. Set the CONNMON_SYNC_TOKEN environment variable. Secrets must not be stored in YAML."
        );
    }
    Ok(())
}
