use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use adloop_core::domain::action::{Action, ActionId, ActionKind, ActionStatus};
use adloop_core::safety::BudgetChange;

use super::{
    parse_decimal, parse_optional_decimal, parse_optional_timestamp, parse_timestamp, parse_u32,
    parse_u64, ActionRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlActionRepository {
    pool: DbPool,
}

impl SqlActionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ActionRepository for SqlActionRepository {
    async fn save(&self, action: Action) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO action (
                id,
                campaign_ref,
                account_ref,
                kind,
                requested_value,
                applied_value,
                status,
                attempt_count,
                max_attempts,
                next_attempt_at,
                last_error,
                requested_at,
                applied_at,
                external_ref,
                settings_version
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                requested_value = excluded.requested_value,
                applied_value = excluded.applied_value,
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                next_attempt_at = excluded.next_attempt_at,
                last_error = excluded.last_error,
                applied_at = excluded.applied_at,
                external_ref = excluded.external_ref",
        )
        .bind(&action.id.0)
        .bind(&action.campaign_ref)
        .bind(&action.account_ref)
        .bind(action.kind.as_str())
        .bind(action.requested_value.map(|value| value.to_string()))
        .bind(action.applied_value.map(|value| value.to_string()))
        .bind(action.status.as_str())
        .bind(i64::from(action.attempt_count))
        .bind(i64::from(action.max_attempts))
        .bind(action.next_attempt_at.to_rfc3339())
        .bind(action.last_error.as_deref())
        .bind(action.requested_at.to_rfc3339())
        .bind(action.applied_at.map(|value| value.to_rfc3339()))
        .bind(action.external_ref.as_deref())
        .bind(i64::from(action.settings_version))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &ActionId) -> Result<Option<Action>, RepositoryError> {
        let row = sqlx::query(&select_sql("WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(action_from_row).transpose()
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Action>, RepositoryError> {
        let rows = sqlx::query(&select_sql(
            "WHERE status = 'pending' AND next_attempt_at <= ?
             ORDER BY next_attempt_at ASC, requested_at ASC
             LIMIT ?",
        ))
        .bind(now.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(action_from_row).collect()
    }

    async fn mark_applied(
        &self,
        id: &ActionId,
        applied_value: Option<Decimal>,
        external_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        // The status predicate makes the apply marker exactly-once under
        // concurrent executors and redelivered work.
        let updated = sqlx::query(
            "UPDATE action
             SET status = 'applied',
                 applied_value = ?,
                 external_ref = ?,
                 applied_at = ?,
                 attempt_count = attempt_count + 1
             WHERE id = ? AND status = 'pending'",
        )
        .bind(applied_value.map(|value| value.to_string()))
        .bind(external_ref)
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn applied_times_for_account(
        &self,
        account_ref: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT applied_at FROM action
             WHERE account_ref = ? AND status = 'applied' AND applied_at >= ?
             ORDER BY applied_at ASC",
        )
        .bind(account_ref)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| parse_timestamp("applied_at", row.try_get("applied_at")?))
            .collect()
    }

    async fn budget_history_for_campaign(
        &self,
        campaign_ref: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BudgetChange>, RepositoryError> {
        // The newest applied change before `since` anchors the series so the
        // first in-range change knows the value it moved from.
        let rows = sqlx::query(
            "SELECT applied_at, applied_value FROM action
             WHERE campaign_ref = ?
               AND kind = 'budget_change'
               AND status = 'applied'
               AND applied_value IS NOT NULL
               AND applied_at >= COALESCE(
                   (SELECT MAX(applied_at) FROM action
                    WHERE campaign_ref = ?
                      AND kind = 'budget_change'
                      AND status = 'applied'
                      AND applied_value IS NOT NULL
                      AND applied_at < ?),
                   ?)
             ORDER BY applied_at ASC",
        )
        .bind(campaign_ref)
        .bind(campaign_ref)
        .bind(since.to_rfc3339())
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        let mut previous: Option<Decimal> = None;
        for row in rows {
            let at = parse_timestamp("applied_at", row.try_get("applied_at")?)?;
            let to = parse_decimal("applied_value", row.try_get("applied_value")?)?;
            history.push(BudgetChange { at, from: previous.unwrap_or(to), to });
            previous = Some(to);
        }
        Ok(history)
    }

    async fn count_by_status(&self, status: ActionStatus) -> Result<u64, RepositoryError> {
        let count = sqlx::query("SELECT COUNT(*) AS count FROM action WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("count");
        parse_u64("count", count)
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<Action>, RepositoryError> {
        let rows = sqlx::query(&select_sql("ORDER BY requested_at DESC LIMIT ?"))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(action_from_row).collect()
    }
}

fn select_sql(where_clause: &str) -> String {
    format!(
        "SELECT
            id,
            campaign_ref,
            account_ref,
            kind,
            requested_value,
            applied_value,
            status,
            attempt_count,
            max_attempts,
            next_attempt_at,
            last_error,
            requested_at,
            applied_at,
            external_ref,
            settings_version
         FROM action {where_clause}"
    )
}

fn action_from_row(row: SqliteRow) -> Result<Action, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = ActionKind::parse(&kind_raw)
        .map_err(|_| RepositoryError::Decode(format!("unknown action kind `{kind_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = ActionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action status `{status_raw}`")))?;

    Ok(Action {
        id: ActionId(row.try_get("id")?),
        campaign_ref: row.try_get("campaign_ref")?,
        account_ref: row.try_get("account_ref")?,
        kind,
        requested_value: parse_optional_decimal(
            "requested_value",
            row.try_get("requested_value")?,
        )?,
        applied_value: parse_optional_decimal("applied_value", row.try_get("applied_value")?)?,
        status,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        next_attempt_at: parse_timestamp("next_attempt_at", row.try_get("next_attempt_at")?)?,
        last_error: row.try_get("last_error")?,
        requested_at: parse_timestamp("requested_at", row.try_get("requested_at")?)?,
        applied_at: parse_optional_timestamp("applied_at", row.try_get("applied_at")?)?,
        external_ref: row.try_get("external_ref")?,
        settings_version: parse_u32("settings_version", row.try_get("settings_version")?)?,
    })
}
