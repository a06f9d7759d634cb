//! Admin/ops surface.
//!
//! Read-only views over the queue, the action ledger, and recent learning
//! cycles, plus two mutations: a manual cycle trigger and a runtime-settings
//! reload. Everything here reads the durable store directly; the workers
//! stay unaware of the admin surface.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use adloop_core::domain::action::ActionStatus;
use adloop_core::domain::job::JobStatus;
use adloop_core::settings::SettingsHandle;
use adloop_db::repositories::{ActionRepository, CycleRepository, JobRepository, RepositoryError};

const RECENT_ACTIONS: u32 = 20;
const RECENT_CYCLES: u32 = 10;

#[derive(Clone)]
pub struct AdminState {
    jobs: Arc<dyn JobRepository>,
    actions: Arc<dyn ActionRepository>,
    cycles: Arc<dyn CycleRepository>,
    settings: SettingsHandle,
    cycle_trigger: mpsc::Sender<()>,
}

impl AdminState {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        actions: Arc<dyn ActionRepository>,
        cycles: Arc<dyn CycleRepository>,
        settings: SettingsHandle,
        cycle_trigger: mpsc::Sender<()>,
    ) -> Self {
        Self { jobs, actions, cycles, settings, cycle_trigger }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/queue", get(queue_depth))
        .route("/admin/actions", get(action_summary))
        .route("/admin/cycles", get(recent_cycles).post(trigger_cycle))
        .route("/admin/settings/reload", post(reload_settings))
        .with_state(state)
}

#[derive(Serialize)]
struct QueueDepthResponse {
    pending: u64,
    processing: u64,
    completed: u64,
    failed: u64,
}

async fn queue_depth(
    State(state): State<AdminState>,
) -> Result<Json<QueueDepthResponse>, AdminError> {
    Ok(Json(QueueDepthResponse {
        pending: state.jobs.count_by_status(JobStatus::Pending).await?,
        processing: state.jobs.count_by_status(JobStatus::Processing).await?,
        completed: state.jobs.count_by_status(JobStatus::Completed).await?,
        failed: state.jobs.count_by_status(JobStatus::Failed).await?,
    }))
}

#[derive(Serialize)]
struct ActionSummary {
    id: String,
    campaign_ref: String,
    kind: &'static str,
    status: &'static str,
    attempt_count: u32,
    requested_value: Option<String>,
    applied_value: Option<String>,
    last_error: Option<String>,
}

#[derive(Serialize)]
struct ActionsResponse {
    pending: u64,
    applied: u64,
    rejected: u64,
    failed: u64,
    recent: Vec<ActionSummary>,
}

async fn action_summary(
    State(state): State<AdminState>,
) -> Result<Json<ActionsResponse>, AdminError> {
    let recent = state
        .actions
        .list_recent(RECENT_ACTIONS)
        .await?
        .into_iter()
        .map(|action| ActionSummary {
            id: action.id.0,
            campaign_ref: action.campaign_ref,
            kind: action.kind.as_str(),
            status: action.status.as_str(),
            attempt_count: action.attempt_count,
            requested_value: action.requested_value.map(|value| value.to_string()),
            applied_value: action.applied_value.map(|value| value.to_string()),
            last_error: action.last_error,
        })
        .collect();

    Ok(Json(ActionsResponse {
        pending: state.actions.count_by_status(ActionStatus::Pending).await?,
        applied: state.actions.count_by_status(ActionStatus::Applied).await?,
        rejected: state.actions.count_by_status(ActionStatus::Rejected).await?,
        failed: state.actions.count_by_status(ActionStatus::Failed).await?,
        recent,
    }))
}

#[derive(Serialize)]
struct CycleRunResponse {
    id: String,
    triggered_by: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    aborted: bool,
    settings_version: u64,
    outcomes: serde_json::Value,
}

async fn recent_cycles(
    State(state): State<AdminState>,
) -> Result<Json<Vec<CycleRunResponse>>, AdminError> {
    let runs = state
        .cycles
        .list_recent(RECENT_CYCLES)
        .await?
        .into_iter()
        .map(|run| CycleRunResponse {
            outcomes: serde_json::from_str(&run.outcomes_json)
                .unwrap_or(serde_json::Value::Null),
            id: run.id,
            triggered_by: run.triggered_by,
            started_at: run.started_at,
            finished_at: run.finished_at,
            aborted: run.aborted,
            settings_version: run.settings_version,
        })
        .collect();
    Ok(Json(runs))
}

async fn trigger_cycle(State(state): State<AdminState>) -> Result<Response, AdminError> {
    match state.cycle_trigger.try_send(()) {
        Ok(()) => {
            info!(
                event_name = "admin.cycle.triggered",
                correlation_id = "admin",
                "manual learning cycle requested"
            );
            Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "triggered" })))
                .into_response())
        }
        // A trigger is already waiting; the next cycle covers this request.
        Err(mpsc::error::TrySendError::Full(())) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "already_pending" })),
        )
            .into_response()),
        Err(mpsc::error::TrySendError::Closed(())) => {
            Err(AdminError::internal("orchestrator is not running"))
        }
    }
}

async fn reload_settings(State(state): State<AdminState>) -> Result<Response, AdminError> {
    match state.settings.reload() {
        Ok(version) => {
            info!(
                event_name = "admin.settings.reloaded",
                correlation_id = "admin",
                version,
                "runtime settings reloaded"
            );
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({ "status": "reloaded", "version": version })),
            )
                .into_response())
        }
        Err(error) => {
            warn!(
                event_name = "admin.settings.reload_failed",
                correlation_id = "admin",
                error = %error,
                "settings reload rejected, previous snapshot stays active"
            );
            Err(AdminError { status: StatusCode::UNPROCESSABLE_ENTITY, message: error.to_string() })
        }
    }
}

struct AdminError {
    status: StatusCode,
    message: String,
}

impl AdminError {
    fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl From<RepositoryError> for AdminError {
    fn from(error: RepositoryError) -> Self {
        Self::internal(error.to_string())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    use adloop_core::domain::action::{Action, ActionId, ActionKind, ActionStatus};
    use adloop_core::domain::job::JobType;
    use adloop_core::domain::snapshot::EntityId;
    use adloop_core::queue::{QueueConfig, QueueEngine};
    use adloop_core::settings::{RuntimeSettings, SettingsHandle};
    use adloop_db::repositories::{
        ActionRepository, JobRepository, SqlActionRepository, SqlCycleRepository,
        SqlJobRepository,
    };
    use adloop_db::{connect_with_settings, migrations, DbPool};

    use super::{router, AdminState};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn state_with(
        pool: &DbPool,
        settings: SettingsHandle,
        cycle_trigger: mpsc::Sender<()>,
    ) -> AdminState {
        AdminState::new(
            Arc::new(SqlJobRepository::new(pool.clone())),
            Arc::new(SqlActionRepository::new(pool.clone())),
            Arc::new(SqlCycleRepository::new(pool.clone())),
            settings,
            cycle_trigger,
        )
    }

    fn default_state(pool: &DbPool) -> AdminState {
        let (tx, _rx) = mpsc::channel(1);
        state_with(pool, SettingsHandle::from_settings(RuntimeSettings::default()), tx)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn queue_depth_reflects_enqueued_jobs() {
        let pool = setup_pool().await;
        let jobs = SqlJobRepository::new(pool.clone());
        let engine = QueueEngine::new(QueueConfig::default());
        let job = engine.create(
            JobType::IndexWinner,
            EntityId("vid-1".to_string()),
            "{}".to_string(),
            1,
            Utc::now(),
        );
        jobs.enqueue(job).await.expect("enqueue");

        let app = router(default_state(&pool));
        let response = app
            .oneshot(Request::get("/admin/queue").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["pending"], 1);
        assert_eq!(body["processing"], 0);
        assert_eq!(body["completed"], 0);

        pool.close().await;
    }

    #[tokio::test]
    async fn action_summary_counts_and_lists_recent_actions() {
        let pool = setup_pool().await;
        let actions = SqlActionRepository::new(pool.clone());
        let now = Utc::now();
        actions
            .save(Action {
                id: ActionId("act-1".to_string()),
                campaign_ref: "camp-1".to_string(),
                account_ref: "acct-1".to_string(),
                kind: ActionKind::BudgetChange,
                requested_value: Some(Decimal::new(150_00, 2)),
                applied_value: None,
                status: ActionStatus::Pending,
                attempt_count: 0,
                max_attempts: 3,
                next_attempt_at: now,
                last_error: None,
                requested_at: now,
                applied_at: None,
                external_ref: None,
                settings_version: 1,
            })
            .await
            .expect("save action");

        let app = router(default_state(&pool));
        let response = app
            .oneshot(Request::get("/admin/actions").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["pending"], 1);
        assert_eq!(body["applied"], 0);
        assert_eq!(body["recent"][0]["id"], "act-1");
        assert_eq!(body["recent"][0]["kind"], "budget_change");

        pool.close().await;
    }

    #[tokio::test]
    async fn manual_cycle_trigger_is_accepted_and_delivered() {
        let pool = setup_pool().await;
        let (tx, mut rx) = mpsc::channel(1);
        let app = router(state_with(
            &pool,
            SettingsHandle::from_settings(RuntimeSettings::default()),
            tx,
        ));

        let response = app
            .oneshot(Request::post("/admin/cycles").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_ok());

        pool.close().await;
    }

    #[tokio::test]
    async fn second_trigger_while_one_is_pending_is_still_accepted() {
        let pool = setup_pool().await;
        let (tx, _rx) = mpsc::channel(1);
        let app = router(state_with(
            &pool,
            SettingsHandle::from_settings(RuntimeSettings::default()),
            tx,
        ));

        for expected in ["triggered", "already_pending"] {
            let response = app
                .clone()
                .oneshot(Request::post("/admin/cycles").body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::ACCEPTED);
            assert_eq!(body_json(response).await["status"], expected);
        }

        pool.close().await;
    }

    #[tokio::test]
    async fn settings_reload_from_file_bumps_the_version() {
        let pool = setup_pool().await;
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[winner]\nctr_threshold = 0.05\n").expect("write settings");

        let settings = SettingsHandle::load(&path).expect("load settings");
        let (tx, _rx) = mpsc::channel(1);
        let app = router(state_with(&pool, settings, tx));

        let response = app
            .oneshot(Request::post("/admin/settings/reload").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "reloaded");
        assert_eq!(body["version"], 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn settings_reload_without_a_file_is_rejected() {
        let pool = setup_pool().await;
        let app = router(default_state(&pool));

        let response = app
            .oneshot(Request::post("/admin/settings/reload").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["error"].is_string());

        pool.close().await;
    }
}
