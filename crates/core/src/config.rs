use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueConfig;

/// Process configuration, fixed for the lifetime of the process. Tunable
/// decision thresholds live in [`crate::settings`] instead so they can be
/// reloaded without restart.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub platform: PlatformConfig,
    pub server: ServerConfig,
    pub edge: EdgeConfig,
    pub queue: QueueSettings,
    pub logging: LoggingConfig,
    /// Path to the hot-reloadable runtime settings file.
    pub settings_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub api_base_url: String,
    pub access_token: SecretString,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EdgeConfig {
    /// Origin endpoint serving fresh predictions and assignments.
    pub origin_base_url: String,
    pub origin_timeout_ms: u64,
    pub fresh_ttl_secs: u64,
    /// Stale entries are still servable (with a refresh kicked off) until
    /// this age; past it they are treated as absent.
    pub stale_ttl_secs: u64,
    pub assignment_ttl_secs: u64,
    pub retry_after_secs: u64,
    pub max_entries: usize,
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub claim_timeout_secs: i64,
    pub max_retries: u32,
    pub retry_base_delay_secs: i64,
    pub retry_backoff_multiplier: u32,
    pub retention_days: i64,
    pub poll_interval_secs: u64,
    pub concurrency: usize,
}

impl QueueSettings {
    pub fn engine_config(&self) -> QueueConfig {
        QueueConfig {
            claim_timeout_secs: self.claim_timeout_secs,
            default_max_retries: self.max_retries,
            retry_base_delay_secs: self.retry_base_delay_secs,
            retry_backoff_multiplier: self.retry_backoff_multiplier,
            retention_days: self.retention_days,
        }
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
    pub log_level: Option<String>,
    pub platform_access_token: Option<String>,
    pub settings_path: Option<PathBuf>,
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
                url: "sqlite://adloop.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            platform: PlatformConfig {
                api_base_url: "https://ads-api.example.com".to_string(),
                access_token: String::new().into(),
                timeout_secs: 30,
                max_retries: 3,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            edge: EdgeConfig {
                origin_base_url: "http://localhost:9090".to_string(),
                origin_timeout_ms: 2_000,
                fresh_ttl_secs: 300,
                stale_ttl_secs: 3_600,
                assignment_ttl_secs: 86_400,
                retry_after_secs: 30,
                max_entries: 100_000,
            },
            queue: QueueSettings {
                claim_timeout_secs: 300,
                max_retries: 3,
                retry_base_delay_secs: 5,
                retry_backoff_multiplier: 2,
                retention_days: 14,
                poll_interval_secs: 5,
                concurrency: 4,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            settings_path: PathBuf::from("config/settings.toml"),
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("adloop.toml"));
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
        }

        if let Some(platform) = patch.platform {
            if let Some(api_base_url) = platform.api_base_url {
                self.platform.api_base_url = api_base_url;
            }
            if let Some(access_token_value) = platform.access_token {
                self.platform.access_token = access_token_value.into();
            }
            if let Some(timeout_secs) = platform.timeout_secs {
                self.platform.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = platform.max_retries {
                self.platform.max_retries = max_retries;
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

        if let Some(edge) = patch.edge {
            if let Some(origin_base_url) = edge.origin_base_url {
                self.edge.origin_base_url = origin_base_url;
            }
            if let Some(origin_timeout_ms) = edge.origin_timeout_ms {
                self.edge.origin_timeout_ms = origin_timeout_ms;
            }
            if let Some(fresh_ttl_secs) = edge.fresh_ttl_secs {
                self.edge.fresh_ttl_secs = fresh_ttl_secs;
            }
            if let Some(stale_ttl_secs) = edge.stale_ttl_secs {
                self.edge.stale_ttl_secs = stale_ttl_secs;
            }
            if let Some(assignment_ttl_secs) = edge.assignment_ttl_secs {
                self.edge.assignment_ttl_secs = assignment_ttl_secs;
            }
            if let Some(retry_after_secs) = edge.retry_after_secs {
                self.edge.retry_after_secs = retry_after_secs;
            }
            if let Some(max_entries) = edge.max_entries {
                self.edge.max_entries = max_entries;
            }
        }

        if let Some(queue) = patch.queue {
            if let Some(claim_timeout_secs) = queue.claim_timeout_secs {
                self.queue.claim_timeout_secs = claim_timeout_secs;
            }
            if let Some(max_retries) = queue.max_retries {
                self.queue.max_retries = max_retries;
            }
            if let Some(retry_base_delay_secs) = queue.retry_base_delay_secs {
                self.queue.retry_base_delay_secs = retry_base_delay_secs;
            }
            if let Some(retry_backoff_multiplier) = queue.retry_backoff_multiplier {
                self.queue.retry_backoff_multiplier = retry_backoff_multiplier;
            }
            if let Some(retention_days) = queue.retention_days {
                self.queue.retention_days = retention_days;
            }
            if let Some(poll_interval_secs) = queue.poll_interval_secs {
                self.queue.poll_interval_secs = poll_interval_secs;
            }
            if let Some(concurrency) = queue.concurrency {
                self.queue.concurrency = concurrency;
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

        if let Some(settings_path) = patch.settings_path {
            self.settings_path = settings_path;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("ADLOOP_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("ADLOOP_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("ADLOOP_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("ADLOOP_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("ADLOOP_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("ADLOOP_PLATFORM_API_BASE_URL") {
            self.platform.api_base_url = value;
        }
        if let Some(value) = read_env("ADLOOP_PLATFORM_ACCESS_TOKEN") {
            self.platform.access_token = value.into();
        }
        if let Some(value) = read_env("ADLOOP_PLATFORM_TIMEOUT_SECS") {
            self.platform.timeout_secs = parse_u64("ADLOOP_PLATFORM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("ADLOOP_PLATFORM_MAX_RETRIES") {
            self.platform.max_retries = parse_u32("ADLOOP_PLATFORM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("ADLOOP_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("ADLOOP_SERVER_PORT") {
            self.server.port = parse_u16("ADLOOP_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("ADLOOP_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("ADLOOP_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("ADLOOP_EDGE_ORIGIN_BASE_URL") {
            self.edge.origin_base_url = value;
        }
        if let Some(value) = read_env("ADLOOP_EDGE_FRESH_TTL_SECS") {
            self.edge.fresh_ttl_secs = parse_u64("ADLOOP_EDGE_FRESH_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("ADLOOP_EDGE_STALE_TTL_SECS") {
            self.edge.stale_ttl_secs = parse_u64("ADLOOP_EDGE_STALE_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("ADLOOP_SETTINGS_PATH") {
            self.settings_path = PathBuf::from(value);
        }

        let log_level = read_env("ADLOOP_LOGGING_LEVEL").or_else(|| read_env("ADLOOP_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("ADLOOP_LOGGING_FORMAT").or_else(|| read_env("ADLOOP_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(access_token) = overrides.platform_access_token {
            self.platform.access_token = access_token.into();
        }
        if let Some(settings_path) = overrides.settings_path {
            self.settings_path = settings_path;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_platform(&self.platform)?;
        validate_server(&self.server)?;
        validate_edge(&self.edge)?;
        validate_queue(&self.queue)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("adloop.toml"), PathBuf::from("config/adloop.toml")]
        .into_iter()
        .find(|path| path.exists())
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

    Ok(())
}

fn validate_platform(platform: &PlatformConfig) -> Result<(), ConfigError> {
    let base_url = platform.api_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "platform.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if platform.access_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "platform.access_token is required. Set it in the config file or via ADLOOP_PLATFORM_ACCESS_TOKEN".to_string(),
        ));
    }

    if platform.timeout_secs == 0 || platform.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "platform.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation(
            "server.port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_edge(edge: &EdgeConfig) -> Result<(), ConfigError> {
    let base_url = edge.origin_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "edge.origin_base_url must start with http:// or https://".to_string(),
        ));
    }

    if edge.fresh_ttl_secs == 0 || edge.stale_ttl_secs <= edge.fresh_ttl_secs {
        return Err(ConfigError::Validation(
            "edge TTLs must satisfy 0 < fresh_ttl_secs < stale_ttl_secs".to_string(),
        ));
    }

    if edge.origin_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "edge.origin_timeout_ms must be greater than zero".to_string(),
        ));
    }

    if edge.max_entries == 0 {
        return Err(ConfigError::Validation(
            "edge.max_entries must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_queue(queue: &QueueSettings) -> Result<(), ConfigError> {
    if queue.claim_timeout_secs <= 0 {
        return Err(ConfigError::Validation(
            "queue.claim_timeout_secs must be positive".to_string(),
        ));
    }

    if queue.retry_backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "queue.retry_backoff_multiplier must be greater than zero".to_string(),
        ));
    }

    if queue.retention_days <= 0 {
        return Err(ConfigError::Validation(
            "queue.retention_days must be positive".to_string(),
        ));
    }

    if queue.concurrency == 0 {
        return Err(ConfigError::Validation(
            "queue.concurrency must be greater than zero".to_string(),
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

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    platform: Option<PlatformPatch>,
    server: Option<ServerPatch>,
    edge: Option<EdgePatch>,
    queue: Option<QueuePatch>,
    logging: Option<LoggingPatch>,
    settings_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformPatch {
    api_base_url: Option<String>,
    access_token: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EdgePatch {
    origin_base_url: Option<String>,
    origin_timeout_ms: Option<u64>,
    fresh_ttl_secs: Option<u64>,
    stale_ttl_secs: Option<u64>,
    assignment_ttl_secs: Option<u64>,
    retry_after_secs: Option<u64>,
    max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct QueuePatch {
    claim_timeout_secs: Option<i64>,
    max_retries: Option<u32>,
    retry_base_delay_secs: Option<i64>,
    retry_backoff_multiplier: Option<u32>,
    retention_days: Option<i64>,
    poll_interval_secs: Option<u64>,
    concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_PLATFORM_TOKEN", "tok-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("adloop.toml");
            fs::write(
                &path,
                r#"
[platform]
access_token = "${TEST_PLATFORM_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.platform.access_token.expose_secret() == "tok-from-env",
                "access token should be loaded from environment",
            )
        })();

        clear_vars(&["TEST_PLATFORM_TOKEN"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("ADLOOP_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("ADLOOP_PLATFORM_ACCESS_TOKEN", "tok-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("adloop.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[platform]
access_token = "tok-from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.platform.access_token.expose_secret() == "tok-from-env",
                "env access token should win over file and defaults",
            )
        })();

        clear_vars(&["ADLOOP_DATABASE_URL", "ADLOOP_PLATFORM_ACCESS_TOKEN"]);
        result
    }

    #[test]
    fn missing_platform_token_fails_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["ADLOOP_PLATFORM_ACCESS_TOKEN"]);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("platform.access_token")
        );
        ensure(has_message, "validation failure should mention platform.access_token")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("ADLOOP_PLATFORM_ACCESS_TOKEN", "tok-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("tok-secret-value"), "debug output should not contain token")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["ADLOOP_PLATFORM_ACCESS_TOKEN"]);
        result
    }

    #[test]
    fn inverted_edge_ttls_fail_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("ADLOOP_PLATFORM_ACCESS_TOKEN", "tok-valid");
        env::set_var("ADLOOP_EDGE_FRESH_TTL_SECS", "3600");
        env::set_var("ADLOOP_EDGE_STALE_TTL_SECS", "300");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected edge TTL validation failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::Validation(ref message) if message.contains("TTL")),
                "validation failure should mention TTLs",
            )
        })();

        clear_vars(&[
            "ADLOOP_PLATFORM_ACCESS_TOKEN",
            "ADLOOP_EDGE_FRESH_TTL_SECS",
            "ADLOOP_EDGE_STALE_TTL_SECS",
        ]);
        result
    }
}
