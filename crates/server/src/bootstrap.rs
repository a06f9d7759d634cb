use adloop_core::config::{AppConfig, ConfigError, LoadOptions};
use adloop_core::settings::{RuntimeSettings, SettingsError, SettingsHandle};
use adloop_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub settings: SettingsHandle,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let settings = if config.settings_path.exists() {
        let handle = SettingsHandle::load(&config.settings_path)?;
        info!(
            event_name = "system.bootstrap.settings_loaded",
            correlation_id = "bootstrap",
            path = %config.settings_path.display(),
            version = handle.current().version,
            "runtime settings loaded"
        );
        handle
    } else {
        info!(
            event_name = "system.bootstrap.settings_defaulted",
            correlation_id = "bootstrap",
            path = %config.settings_path.display(),
            "settings file absent, using built-in defaults"
        );
        SettingsHandle::from_settings(RuntimeSettings::default())
    };

    Ok(Application { config, db_pool, settings })
}
