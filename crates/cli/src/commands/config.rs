use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tenantry_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

use crate::commands::CommandResult;

pub fn run(options: &LoadOptions) -> CommandResult {
    match AppConfig::load(options.clone()) {
        Ok(config) => CommandResult {
            exit_code: 0,
            output: render(&config, resolve_config_path(options.config_path.as_deref())),
        },
        Err(error) => CommandResult::failure(
            "config",
            "config_validation",
            format!("config validation failed: {error}"),
            2,
        ),
    }
}

fn entries(config: &AppConfig) -> Vec<(&'static str, String)> {
    let database = &config.database;
    let server = &config.server;
    let engine = &config.engine;
    let resolver = &config.resolver;
    vec![
        ("database.url", database.url.clone()),
        ("database.max_connections", database.max_connections.to_string()),
        ("database.timeout_secs", database.timeout_secs.to_string()),
        ("database.tenant_data_dir", database.tenant_data_dir.display().to_string()),
        ("server.bind_address", server.bind_address.clone()),
        ("server.port", server.port.to_string()),
        ("server.graceful_shutdown_secs", server.graceful_shutdown_secs.to_string()),
        ("engine.max_retries", engine.max_retries.to_string()),
        ("engine.backoff_floor_ms", engine.backoff_floor_ms.to_string()),
        ("engine.backoff_ceiling_ms", engine.backoff_ceiling_ms.to_string()),
        ("engine.jitter_ratio", engine.jitter_ratio.to_string()),
        ("engine.timeout_secs", engine.timeout_secs.to_string()),
        ("engine.confidence_threshold", engine.confidence_threshold.to_string()),
        ("engine.audit_enabled", engine.audit_enabled.to_string()),
        ("engine.usage_metering_enabled", engine.usage_metering_enabled.to_string()),
        ("resolver.cache_ttl_secs", resolver.cache_ttl_secs.to_string()),
        ("resolver.tenant_header", resolver.tenant_header.clone()),
        ("resolver.reserved_subdomains", resolver.reserved_subdomains.join(",")),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format).to_ascii_lowercase()),
    ]
}

pub fn render(config: &AppConfig, config_file_path: Option<PathBuf>) -> String {
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value) in entries(config) {
        let source = field_source(key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }
    lines.join("\n")
}

/// `engine.max_retries` reads `TENANTRY_ENGINE_MAX_RETRIES`.
fn env_key(key_path: &str) -> String {
    format!("TENANTRY_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let env_key = env_key(key_path);
    if env::var_os(&env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
