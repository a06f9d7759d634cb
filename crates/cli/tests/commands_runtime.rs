use std::env;
use std::sync::{Mutex, OnceLock};

use adloop_cli::commands::{backfill, config, migrate};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(
        &[
            ("ADLOOP_PLATFORM_ACCESS_TOKEN", "tok-test"),
            ("ADLOOP_DATABASE_URL", "sqlite::memory:"),
        ],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 0, "expected successful migrate run");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["status"], "ok");
        },
    );
}

#[test]
fn migrate_returns_config_failure_without_a_platform_token() {
    with_env(&[("ADLOOP_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn backfill_over_an_empty_store_reports_zero_counts() {
    with_env(
        &[
            ("ADLOOP_PLATFORM_ACCESS_TOKEN", "tok-test"),
            ("ADLOOP_DATABASE_URL", "sqlite::memory:?cache=shared"),
            ("ADLOOP_DATABASE_MAX_CONNECTIONS", "1"),
        ],
        || {
            let result = backfill::run(24);
            assert_eq!(result.exit_code, 0, "expected successful backfill run");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "backfill");
            assert_eq!(payload["status"], "ok");
            assert_eq!(payload["details"]["evaluated"], 0);
            assert_eq!(payload["details"]["enqueued"], 0);
        },
    );
}

#[test]
fn config_inspection_redacts_the_platform_token() {
    with_env(
        &[
            ("ADLOOP_PLATFORM_ACCESS_TOKEN", "tok-secret-value"),
            ("ADLOOP_DATABASE_URL", "sqlite::memory:"),
        ],
        || {
            let output = config::run();
            assert!(output.contains("platform.access_token = <redacted>"));
            assert!(!output.contains("tok-secret-value"));
            assert!(output.contains("database.url = sqlite::memory:"));
            assert!(output.contains("source: env (ADLOOP_DATABASE_URL)"));
        },
    );
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "ADLOOP_DATABASE_URL",
        "ADLOOP_DATABASE_MAX_CONNECTIONS",
        "ADLOOP_DATABASE_TIMEOUT_SECS",
        "ADLOOP_PLATFORM_API_BASE_URL",
        "ADLOOP_PLATFORM_ACCESS_TOKEN",
        "ADLOOP_PLATFORM_TIMEOUT_SECS",
        "ADLOOP_PLATFORM_MAX_RETRIES",
        "ADLOOP_SERVER_BIND_ADDRESS",
        "ADLOOP_SERVER_PORT",
        "ADLOOP_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "ADLOOP_EDGE_ORIGIN_BASE_URL",
        "ADLOOP_EDGE_FRESH_TTL_SECS",
        "ADLOOP_EDGE_STALE_TTL_SECS",
        "ADLOOP_SETTINGS_PATH",
        "ADLOOP_LOGGING_LEVEL",
        "ADLOOP_LOGGING_FORMAT",
        "ADLOOP_LOG_LEVEL",
        "ADLOOP_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
