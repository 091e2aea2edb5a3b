//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{collections::HashSet, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::config::{
    CacheConfig, DEFAULT_KEY_TEMPLATE, GatewayOptions, InvalidationMode, SiteConfigs,
};
use crate::infra::memcached::{Credentials, Endpoint, Protocol, parse_server_list};

pub use cli::{CliArgs, Command, GlobalOverrides, PurgeArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagegate";
const ENV_PREFIX: &str = "PAGEGATE";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 500;
const DEFAULT_IO_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 30;
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub backend: BackendSettings,
    pub gateway: GatewayOptions,
    pub sites: SiteConfigs,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEngine {
    Memcached,
    Memory,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub engine: BackendEngine,
    pub servers: Vec<Endpoint>,
    pub protocol: Protocol,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub reconnect_interval: Duration,
    pub memory_capacity: NonZeroUsize,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
    Settings::from_raw(raw)
}

/// Parse CLI arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
    gateway: RawGatewaySettings,
    sites: Vec<RawSiteSettings>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(engine) = overrides.backend_engine.as_ref() {
            self.backend.engine = Some(engine.clone());
        }
        if let Some(servers) = overrides.backend_servers.as_ref() {
            self.backend.servers = Some(servers.clone());
        }
        if let Some(binary) = overrides.backend_binary {
            self.backend.binary = Some(binary);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            backend,
            gateway,
            sites,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            backend: build_backend_settings(backend)?,
            gateway: build_gateway_options(gateway)?,
            sites: build_sites(sites)?,
        })
    }
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

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let engine = match backend.engine.as_deref().map(str::trim) {
        None | Some("memcached") => BackendEngine::Memcached,
        Some("memory") => BackendEngine::Memory,
        Some(other) => {
            return Err(LoadError::invalid(
                "backend.engine",
                format!("unknown engine `{other}` (expected memcached or memory)"),
            ));
        }
    };

    let servers = parse_server_list(backend.servers.as_deref().unwrap_or_default())
        .map_err(|reason| LoadError::invalid("backend.servers", reason))?;

    let protocol = if backend.binary.unwrap_or(false) {
        Protocol::Binary
    } else {
        Protocol::Text
    };

    let username = backend.username.and_then(non_blank);
    let credentials = match (username, backend.password) {
        (Some(username), password) => Some(Credentials {
            username,
            password: password.unwrap_or_default(),
        }),
        (None, Some(password)) if !password.is_empty() => {
            return Err(LoadError::invalid(
                "backend.username",
                "a password was given without a username",
            ));
        }
        (None, _) => None,
    };

    let connect_timeout = positive_duration_ms(
        backend.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        "backend.connect_timeout_ms",
    )?;
    let io_timeout = positive_duration_ms(
        backend.io_timeout_ms.unwrap_or(DEFAULT_IO_TIMEOUT_MS),
        "backend.io_timeout_ms",
    )?;
    let reconnect_secs = backend
        .reconnect_interval_seconds
        .unwrap_or(DEFAULT_RECONNECT_INTERVAL_SECS);
    if reconnect_secs == 0 {
        return Err(LoadError::invalid(
            "backend.reconnect_interval_seconds",
            "must be greater than zero",
        ));
    }

    let memory_capacity =
        NonZeroUsize::new(backend.memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY))
        .ok_or_else(|| LoadError::invalid("backend.memory_capacity", "must be greater than zero"))?;

    Ok(BackendSettings {
        engine,
        servers,
        protocol,
        credentials,
        connect_timeout,
        io_timeout,
        reconnect_interval: Duration::from_secs(reconnect_secs),
        memory_capacity,
    })
}

fn build_gateway_options(gateway: RawGatewaySettings) -> Result<GatewayOptions, LoadError> {
    let defaults = GatewayOptions::default();

    let nocache_cookie = gateway
        .nocache_cookie
        .and_then(non_blank)
        .unwrap_or(defaults.nocache_cookie);
    if !is_cookie_name(&nocache_cookie) {
        return Err(LoadError::invalid(
            "gateway.nocache_cookie",
            format!("`{nocache_cookie}` is not a valid cookie name"),
        ));
    }

    let default_scheme = gateway
        .default_scheme
        .map(|scheme| scheme.trim().to_ascii_lowercase())
        .unwrap_or(defaults.default_scheme);
    if default_scheme != "http" && default_scheme != "https" {
        return Err(LoadError::invalid(
            "gateway.default_scheme",
            "must be `http` or `https`",
        ));
    }

    let max_body_bytes = gateway.max_body_bytes.unwrap_or(defaults.max_body_bytes);
    if max_body_bytes == 0 {
        return Err(LoadError::invalid(
            "gateway.max_body_bytes",
            "must be greater than zero",
        ));
    }

    Ok(GatewayOptions {
        enabled: gateway.enabled.unwrap_or(defaults.enabled),
        nocache_cookie,
        nocache_cookie_ttl: gateway
            .nocache_cookie_ttl_seconds
            .unwrap_or(defaults.nocache_cookie_ttl),
        default_scheme,
        max_body_bytes,
    })
}

fn build_sites(sites: Vec<RawSiteSettings>) -> Result<SiteConfigs, LoadError> {
    let mut seen = HashSet::new();
    let mut configs = SiteConfigs::new();
    for site in sites {
        let host = site
            .host
            .clone()
            .and_then(non_blank)
            .ok_or_else(|| LoadError::invalid("sites.host", "every site needs a host"))?
            .to_ascii_lowercase();
        if !seen.insert(host.clone()) {
            return Err(LoadError::invalid(
                "sites.host",
                format!("host `{host}` is configured twice"),
            ));
        }
        configs.insert(host, build_site(site)?);
    }
    Ok(configs)
}

fn build_site(site: RawSiteSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let key_template = site
        .key_template
        .and_then(non_blank)
        .unwrap_or_else(|| DEFAULT_KEY_TEMPLATE.to_string());
    let prefix_data = site.prefix_data.unwrap_or(defaults.prefix_data);
    let prefix_meta = site.prefix_meta.unwrap_or(defaults.prefix_meta);
    if prefix_data == prefix_meta {
        return Err(LoadError::invalid(
            "sites.prefix_meta",
            "data and meta prefixes must differ",
        ));
    }

    let nocache_url = match site.nocache_url.and_then(non_blank) {
        Some(pattern) => Some(Regex::new(&pattern).map_err(|err| {
            LoadError::invalid("sites.nocache_url", format!("invalid pattern: {err}"))
        })?),
        None => None,
    };

    let invalidation_mode = match site.invalidation_mode {
        Some(mode) => InvalidationMode::parse(&mode).ok_or_else(|| {
            LoadError::invalid(
                "sites.invalidation_mode",
                format!("unknown mode `{mode}` (expected flush, resource, taxonomies or index)"),
            )
        })?,
        None => defaults.invalidation_mode,
    };

    let nocache_cookies = site
        .nocache_cookies
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(CacheConfig {
        key_template,
        prefix_data,
        prefix_meta,
        hash_keys: site.hash_keys.unwrap_or(defaults.hash_keys),
        expire: site.expire.unwrap_or(defaults.expire),
        expire_home: site.expire_home.unwrap_or(defaults.expire_home),
        expire_taxonomy: site.expire_taxonomy.unwrap_or(defaults.expire_taxonomy),
        expire_single: site.expire_single.unwrap_or(defaults.expire_single),
        nocache_home: site.nocache_home.unwrap_or(defaults.nocache_home),
        nocache_feed: site.nocache_feed.unwrap_or(defaults.nocache_feed),
        nocache_archive: site.nocache_archive.unwrap_or(defaults.nocache_archive),
        nocache_single: site.nocache_single.unwrap_or(defaults.nocache_single),
        nocache_cookies,
        nocache_url,
        cache_logged_in: site.cache_logged_in.unwrap_or(defaults.cache_logged_in),
        logged_in_cookie_prefix: site
            .logged_in_cookie_prefix
            .unwrap_or(defaults.logged_in_cookie_prefix),
        session_cookie: site.session_cookie.unwrap_or(defaults.session_cookie),
        invalidation_mode,
        response_header: site.response_header.unwrap_or(defaults.response_header),
        pingback_header: site.pingback_header.unwrap_or(defaults.pingback_header),
        shortlink_header: site.shortlink_header.unwrap_or(defaults.shortlink_header),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    engine: Option<String>,
    servers: Option<String>,
    binary: Option<bool>,
    username: Option<String>,
    password: Option<String>,
    connect_timeout_ms: Option<u64>,
    io_timeout_ms: Option<u64>,
    reconnect_interval_seconds: Option<u64>,
    memory_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGatewaySettings {
    enabled: Option<bool>,
    nocache_cookie: Option<String>,
    nocache_cookie_ttl_seconds: Option<u64>,
    default_scheme: Option<String>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    host: Option<String>,
    key_template: Option<String>,
    prefix_data: Option<String>,
    prefix_meta: Option<String>,
    hash_keys: Option<bool>,
    expire: Option<u64>,
    expire_home: Option<u64>,
    expire_taxonomy: Option<u64>,
    expire_single: Option<u64>,
    nocache_home: Option<bool>,
    nocache_feed: Option<bool>,
    nocache_archive: Option<bool>,
    nocache_single: Option<bool>,
    nocache_cookies: Option<String>,
    nocache_url: Option<String>,
    cache_logged_in: Option<bool>,
    logged_in_cookie_prefix: Option<String>,
    session_cookie: Option<String>,
    invalidation_mode: Option<String>,
    response_header: Option<bool>,
    pingback_header: Option<bool>,
    shortlink_header: Option<bool>,
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn positive_duration_ms(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
