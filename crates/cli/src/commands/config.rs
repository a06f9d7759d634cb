use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use adloop_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: Option<&str>| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", Some("ADLOOP_DATABASE_URL")),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", Some("ADLOOP_DATABASE_MAX_CONNECTIONS")),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", Some("ADLOOP_DATABASE_TIMEOUT_SECS")),
    ));

    lines.push(render_line(
        "platform.api_base_url",
        &config.platform.api_base_url,
        source("platform.api_base_url", Some("ADLOOP_PLATFORM_API_BASE_URL")),
    ));
    lines.push(render_line(
        "platform.access_token",
        &redact_token(config.platform.access_token.expose_secret()),
        source("platform.access_token", Some("ADLOOP_PLATFORM_ACCESS_TOKEN")),
    ));
    lines.push(render_line(
        "platform.timeout_secs",
        &config.platform.timeout_secs.to_string(),
        source("platform.timeout_secs", Some("ADLOOP_PLATFORM_TIMEOUT_SECS")),
    ));

    lines.push(render_line(
        "server.bind_address",
        &config.server.bind_address,
        source("server.bind_address", Some("ADLOOP_SERVER_BIND_ADDRESS")),
    ));
    lines.push(render_line(
        "server.port",
        &config.server.port.to_string(),
        source("server.port", Some("ADLOOP_SERVER_PORT")),
    ));

    lines.push(render_line(
        "edge.origin_base_url",
        &config.edge.origin_base_url,
        source("edge.origin_base_url", Some("ADLOOP_EDGE_ORIGIN_BASE_URL")),
    ));
    lines.push(render_line(
        "edge.fresh_ttl_secs",
        &config.edge.fresh_ttl_secs.to_string(),
        source("edge.fresh_ttl_secs", Some("ADLOOP_EDGE_FRESH_TTL_SECS")),
    ));
    lines.push(render_line(
        "edge.stale_ttl_secs",
        &config.edge.stale_ttl_secs.to_string(),
        source("edge.stale_ttl_secs", Some("ADLOOP_EDGE_STALE_TTL_SECS")),
    ));

    lines.push(render_line(
        "queue.poll_interval_secs",
        &config.queue.poll_interval_secs.to_string(),
        source("queue.poll_interval_secs", None),
    ));

    lines.push(render_line(
        "settings_path",
        &config.settings_path.display().to_string(),
        source("settings_path", Some("ADLOOP_SETTINGS_PATH")),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", Some("ADLOOP_LOGGING_LEVEL")),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", Some("ADLOOP_LOGGING_FORMAT")),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("adloop.toml"), PathBuf::from("config/adloop.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
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

fn redact_token(token: &str) -> String {
    if token.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}
