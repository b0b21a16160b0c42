//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration,
};

use axum::http::Method;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{FreshnessPolicy, KeyMask};

mod cli;

pub use cli::{CacheOverrides, CliArgs, Command, ServeArgs, ServeOverrides, SweepArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "diskcache";
const ENV_PREFIX: &str = "DISKCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECLAIM_GRACE_SECS: u64 = 30;
const DEFAULT_METHODS: [&str; 2] = ["GET", "HEAD"];
const DEFAULT_FILES_ROOT: &str = "public";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub files: FilesSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub key_mask: KeyMask,
    pub use_stale: bool,
    pub populate_wait: Option<Duration>,
    pub reclaim_interval: Duration,
    pub reclaim_grace: Duration,
    pub methods: Vec<Method>,
    pub freshness: FreshnessPolicy,
}

#[derive(Debug, Clone)]
pub struct FilesSettings {
    pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.key_parts")
            .with_list_parse_key("cache.methods"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sweep(args)) => raw.apply_sweep_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    files: RawFilesSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(root) = overrides.files_root.as_ref() {
            self.files.root = Some(root.clone());
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_sweep_overrides(&mut self, args: &SweepArgs) {
        if let Some(directory) = args.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(parts) = overrides.cache_key_parts.as_ref() {
            self.cache.key_parts = Some(parts.clone());
        }
        if let Some(use_stale) = overrides.cache_use_stale {
            self.cache.use_stale = Some(use_stale);
        }
        if let Some(wait) = overrides.cache_populate_wait_ms {
            self.cache.populate_wait_ms = Some(wait);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            files,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            files: build_files_settings(files)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    let key_mask = match cache.key_parts {
        Some(parts) => KeyMask::from_names(parts.iter().filter(|part| !part.trim().is_empty()))
            .map_err(|err| LoadError::invalid("cache.key_parts", err.to_string()))?,
        None => KeyMask::default(),
    };
    if key_mask == KeyMask::NONE {
        return Err(LoadError::invalid(
            "cache.key_parts",
            "at least one request part is required",
        ));
    }

    let populate_wait = match cache.populate_wait_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.populate_wait_ms",
                "must be greater than zero; omit it to wait without bound",
            ));
        }
        Some(millis) => Some(Duration::from_millis(millis)),
        None => None,
    };

    let reclaim_interval_secs = cache
        .reclaim_interval_seconds
        .unwrap_or(DEFAULT_RECLAIM_INTERVAL_SECS);
    if reclaim_interval_secs == 0 {
        return Err(LoadError::invalid(
            "cache.reclaim_interval_seconds",
            "must be greater than zero",
        ));
    }
    let reclaim_grace_secs = cache
        .reclaim_grace_seconds
        .unwrap_or(DEFAULT_RECLAIM_GRACE_SECS);

    let methods = parse_methods(cache.methods)?;
    let freshness = build_freshness(cache.validity)?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        directory,
        key_mask,
        use_stale: cache.use_stale.unwrap_or(false),
        populate_wait,
        reclaim_interval: Duration::from_secs(reclaim_interval_secs),
        reclaim_grace: Duration::from_secs(reclaim_grace_secs),
        methods,
        freshness,
    })
}

fn parse_methods(methods: Option<Vec<String>>) -> Result<Vec<Method>, LoadError> {
    let names = methods.unwrap_or_else(|| DEFAULT_METHODS.map(String::from).to_vec());

    let mut parsed = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_ascii_uppercase();
        if name.is_empty() {
            continue;
        }
        let method = Method::from_bytes(name.as_bytes()).map_err(|_| {
            LoadError::invalid("cache.methods", format!("invalid HTTP method `{name}`"))
        })?;
        if !parsed.contains(&method) {
            parsed.push(method);
        }
    }

    if parsed.is_empty() {
        return Err(LoadError::invalid(
            "cache.methods",
            "at least one method is required",
        ));
    }
    Ok(parsed)
}

fn build_freshness(validity: Option<BTreeMap<String, u64>>) -> Result<FreshnessPolicy, LoadError> {
    let Some(validity) = validity else {
        return Ok(FreshnessPolicy::default());
    };

    let mut policy = FreshnessPolicy::empty();
    for (status, seconds) in validity {
        let code = status
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|code| (100..=599).contains(code))
            .ok_or_else(|| {
                LoadError::invalid(
                    "cache.validity",
                    format!("`{status}` is not an HTTP status code"),
                )
            })?;
        if seconds == 0 {
            return Err(LoadError::invalid(
                "cache.validity",
                format!("validity for {code} must be greater than zero"),
            ));
        }
        policy = policy.with_validity(Duration::from_secs(seconds), &[code]);
    }
    Ok(policy)
}

fn build_files_settings(files: RawFilesSettings) -> Result<FilesSettings, LoadError> {
    let root = files
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FILES_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("files.root", "path must not be empty"));
    }
    Ok(FilesSettings { root })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    key_parts: Option<Vec<String>>,
    use_stale: Option<bool>,
    populate_wait_ms: Option<u64>,
    reclaim_interval_seconds: Option<u64>,
    reclaim_grace_seconds: Option<u64>,
    methods: Option<Vec<String>>,
    validity: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFilesSettings {
    root: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
