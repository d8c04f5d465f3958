use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["tenantry.toml", "config/tenantry.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub resolver: ResolverConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Platform database holding the tenant directory.
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
    /// One SQLite file per tenant store lives under this directory.
    pub tenant_data_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub jitter_ratio: f64,
    pub timeout_secs: u64,
    pub confidence_threshold: f64,
    pub audit_enabled: bool,
    pub usage_metering_enabled: bool,
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_floor(&self) -> Duration {
        Duration::from_millis(self.backoff_floor_ms)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }
}

#[derive(Clone, Debug)]
pub struct ResolverConfig {
    pub cache_ttl_secs: u64,
    pub tenant_header: String,
    pub reserved_subdomains: Vec<String>,
}

impl ResolverConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub tenant_data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub port: Option<u16>,
    pub max_retries: Option<u32>,
    pub confidence_threshold: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://tenantry.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
                tenant_data_dir: PathBuf::from("data/tenants"),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            engine: EngineConfig {
                max_retries: 3,
                backoff_floor_ms: 2_000,
                backoff_ceiling_ms: 10_000,
                jitter_ratio: 0.1,
                timeout_secs: 300,
                confidence_threshold: 0.85,
                audit_enabled: true,
                usage_metering_enabled: true,
            },
            resolver: ResolverConfig {
                cache_ttl_secs: 300,
                tenant_header: "X-Tenant-ID".to_string(),
                reserved_subdomains: ["www", "api", "admin"].map(String::from).to_vec(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
            if let Some(tenant_data_dir) = database.tenant_data_dir {
                self.database.tenant_data_dir = tenant_data_dir;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(max_retries) = engine.max_retries {
                self.engine.max_retries = max_retries;
            }
            if let Some(backoff_floor_ms) = engine.backoff_floor_ms {
                self.engine.backoff_floor_ms = backoff_floor_ms;
            }
            if let Some(backoff_ceiling_ms) = engine.backoff_ceiling_ms {
                self.engine.backoff_ceiling_ms = backoff_ceiling_ms;
            }
            if let Some(jitter_ratio) = engine.jitter_ratio {
                self.engine.jitter_ratio = jitter_ratio;
            }
            if let Some(timeout_secs) = engine.timeout_secs {
                self.engine.timeout_secs = timeout_secs;
            }
            if let Some(confidence_threshold) = engine.confidence_threshold {
                self.engine.confidence_threshold = confidence_threshold;
            }
            if let Some(audit_enabled) = engine.audit_enabled {
                self.engine.audit_enabled = audit_enabled;
            }
            if let Some(usage_metering_enabled) = engine.usage_metering_enabled {
                self.engine.usage_metering_enabled = usage_metering_enabled;
            }
        }

        if let Some(resolver) = patch.resolver {
            if let Some(cache_ttl_secs) = resolver.cache_ttl_secs {
                self.resolver.cache_ttl_secs = cache_ttl_secs;
            }
            if let Some(tenant_header) = resolver.tenant_header {
                self.resolver.tenant_header = tenant_header;
            }
            if let Some(reserved_subdomains) = resolver.reserved_subdomains {
                self.resolver.reserved_subdomains = normalize_labels(reserved_subdomains);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TENANTRY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TENANTRY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("TENANTRY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TENANTRY_DATABASE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_DATABASE_TENANT_DATA_DIR") {
            self.database.tenant_data_dir = PathBuf::from(value);
        }

        if let Some(value) = read_env("TENANTRY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TENANTRY_SERVER_PORT") {
            self.server.port = parse_u16("TENANTRY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TENANTRY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("TENANTRY_ENGINE_MAX_RETRIES") {
            self.engine.max_retries = parse_u32("TENANTRY_ENGINE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_ENGINE_BACKOFF_FLOOR_MS") {
            self.engine.backoff_floor_ms = parse_u64("TENANTRY_ENGINE_BACKOFF_FLOOR_MS", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_ENGINE_BACKOFF_CEILING_MS") {
            self.engine.backoff_ceiling_ms =
                parse_u64("TENANTRY_ENGINE_BACKOFF_CEILING_MS", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_ENGINE_JITTER_RATIO") {
            self.engine.jitter_ratio = parse_f64("TENANTRY_ENGINE_JITTER_RATIO", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_ENGINE_TIMEOUT_SECS") {
            self.engine.timeout_secs = parse_u64("TENANTRY_ENGINE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_ENGINE_CONFIDENCE_THRESHOLD") {
            self.engine.confidence_threshold =
                parse_f64("TENANTRY_ENGINE_CONFIDENCE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_ENGINE_AUDIT_ENABLED") {
            self.engine.audit_enabled = parse_bool("TENANTRY_ENGINE_AUDIT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_ENGINE_USAGE_METERING_ENABLED") {
            self.engine.usage_metering_enabled =
                parse_bool("TENANTRY_ENGINE_USAGE_METERING_ENABLED", &value)?;
        }

        if let Some(value) = read_env("TENANTRY_RESOLVER_CACHE_TTL_SECS") {
            self.resolver.cache_ttl_secs = parse_u64("TENANTRY_RESOLVER_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("TENANTRY_RESOLVER_TENANT_HEADER") {
            self.resolver.tenant_header = value;
        }
        if let Some(value) = read_env("TENANTRY_RESOLVER_RESERVED_SUBDOMAINS") {
            self.resolver.reserved_subdomains =
                normalize_labels(value.split(',').map(str::to_owned).collect());
        }

        let log_level =
            read_env("TENANTRY_LOGGING_LEVEL").or_else(|| read_env("TENANTRY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TENANTRY_LOGGING_FORMAT").or_else(|| read_env("TENANTRY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(tenant_data_dir) = overrides.tenant_data_dir {
            self.database.tenant_data_dir = tenant_data_dir;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.engine.max_retries = max_retries;
        }
        if let Some(confidence_threshold) = overrides.confidence_threshold {
            self.engine.confidence_threshold = confidence_threshold;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_engine(&self.engine)?;
        validate_resolver(&self.resolver)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// Path of the config file `load` would read, if any.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn normalize_labels(labels: Vec<String>) -> Vec<String> {
    labels
        .into_iter()
        .map(|label| label.trim().to_ascii_lowercase())
        .filter(|label| !label.is_empty())
        .collect()
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if database.tenant_data_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "database.tenant_data_dir must name a directory for tenant stores".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&engine.confidence_threshold) {
        return Err(ConfigError::Validation(
            "engine.confidence_threshold must be in range 0.0..=1.0".to_string(),
        ));
    }

    if engine.backoff_floor_ms == 0 {
        return Err(ConfigError::Validation(
            "engine.backoff_floor_ms must be greater than zero".to_string(),
        ));
    }

    if engine.backoff_floor_ms > engine.backoff_ceiling_ms {
        return Err(ConfigError::Validation(format!(
            "engine.backoff_floor_ms ({}) must not exceed engine.backoff_ceiling_ms ({})",
            engine.backoff_floor_ms, engine.backoff_ceiling_ms
        )));
    }

    if !(0.0..=1.0).contains(&engine.jitter_ratio) {
        return Err(ConfigError::Validation(
            "engine.jitter_ratio must be in range 0.0..=1.0".to_string(),
        ));
    }

    if engine.timeout_secs == 0 || engine.timeout_secs > 3_600 {
        return Err(ConfigError::Validation(
            "engine.timeout_secs must be in range 1..=3600".to_string(),
        ));
    }

    Ok(())
}

fn validate_resolver(resolver: &ResolverConfig) -> Result<(), ConfigError> {
    if resolver.cache_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "resolver.cache_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if resolver.tenant_header.trim().is_empty() {
        return Err(ConfigError::Validation(
            "resolver.tenant_header must name the header carrying the tenant id".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    engine: Option<EnginePatch>,
    resolver: Option<ResolverPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
    tenant_data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    max_retries: Option<u32>,
    backoff_floor_ms: Option<u64>,
    backoff_ceiling_ms: Option<u64>,
    jitter_ratio: Option<f64>,
    timeout_secs: Option<u64>,
    confidence_threshold: Option<f64>,
    audit_enabled: Option<bool>,
    usage_metering_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ResolverPatch {
    cache_ttl_secs: Option<u64>,
    tenant_header: Option<String>,
    reserved_subdomains: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
