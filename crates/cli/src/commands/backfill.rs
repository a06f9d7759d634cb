use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::commands::CommandResult;
use adloop_core::config::{AppConfig, LoadOptions};
use adloop_core::queue::QueueEngine;
use adloop_core::settings::{RuntimeSettings, SettingsHandle};
use adloop_db::repositories::{SqlJobRepository, SqlSnapshotRepository};
use adloop_db::{connect_with_settings, migrations};
use adloop_worker::SnapshotIntake;

/// Re-run winner detection over snapshots observed in the last `since_hours`,
/// under whatever criteria the settings file currently carries. Safe to run
/// repeatedly; the queue deduplicates in-flight indexing work.
pub fn run(since_hours: u64) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "backfill",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let settings = if config.settings_path.exists() {
        match SettingsHandle::load(&config.settings_path) {
            Ok(settings) => settings,
            Err(error) => {
                return CommandResult::failure(
                    "backfill",
                    "settings",
                    format!("runtime settings issue: {error}"),
                    6,
                );
            }
        }
    } else {
        SettingsHandle::from_settings(RuntimeSettings::default())
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "backfill",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let intake = SnapshotIntake::new(
            Arc::new(SqlSnapshotRepository::new(pool.clone())),
            Arc::new(SqlJobRepository::new(pool.clone())),
            QueueEngine::new(config.queue.engine_config()),
            settings,
        );

        let now = Utc::now();
        let since = now - Duration::hours(since_hours as i64);
        let counts = intake
            .backfill(since, now)
            .await
            .map_err(|error| ("backfill", error.to_string(), 7u8))?;

        pool.close().await;
        Ok::<(u64, u64), (&'static str, String, u8)>(counts)
    });

    match result {
        Ok((evaluated, enqueued)) => CommandResult::success_with_details(
            "backfill",
            format!("re-evaluated {evaluated} snapshots, enqueued {enqueued} winner jobs"),
            Some(serde_json::json!({ "evaluated": evaluated, "enqueued": enqueued })),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("backfill", error_class, message, exit_code)
        }
    }
}
