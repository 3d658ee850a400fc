use drill_core::model::{OwnerId, PendingResponse, Session, SessionId};
use sqlx::{Sqlite, Transaction};

use super::SqliteRepository;
use super::mapping::{conn, map_session_row, question_ids_to_json, ser};
use crate::repository::{SessionRepository, StorageError};

const SESSION_COLUMNS: &str = "id, owner, selector, target, resolved, status, cancel_reason, \
     started_at, last_activity_at, delivered, planned";

async fn upsert_session(
    tx: &mut Transaction<'_, Sqlite>,
    session: &Session,
) -> Result<(), StorageError> {
    sqlx::query(
        r"
        INSERT INTO sessions (
            id, owner, selector, target, resolved, status, cancel_reason,
            started_at, last_activity_at, delivered, planned
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            resolved = excluded.resolved,
            status = excluded.status,
            cancel_reason = excluded.cancel_reason,
            last_activity_at = excluded.last_activity_at,
            delivered = excluded.delivered,
            planned = excluded.planned
        ",
    )
    .bind(session.id().to_string())
    .bind(session.owner().as_str())
    .bind(serde_json::to_string(session.selector()).map_err(ser)?)
    .bind(i64::from(session.target()))
    .bind(i64::from(session.resolved()))
    .bind(session.status().as_str())
    .bind(session.cancel_reason().map(|r| r.as_str()))
    .bind(session.started_at())
    .bind(session.last_activity_at())
    .bind(question_ids_to_json(session.delivered())?)
    .bind(question_ids_to_json(session.planned())?)
    .execute(&mut **tx)
    .await
    .map_err(conn)?;
    Ok(())
}

#[async_trait::async_trait]
impl SessionRepository for SqliteRepository {
    async fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;
        upsert_session(&mut tx, session).await?;
        tx.commit().await.map_err(conn)
    }

    async fn get_session(&self, id: SessionId) -> Result<Session, StorageError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_session_row(&row)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sessions WHERE id = ?1")
            .bind(session.id().to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        if existing.is_none() {
            return Err(StorageError::NotFound);
        }
        let mut tx = self.pool.begin().await.map_err(conn)?;
        upsert_session(&mut tx, session).await?;
        tx.commit().await.map_err(conn)
    }

    async fn update_if_active(&self, session: &Session) -> Result<bool, StorageError> {
        // Same compare-and-set shape as the response resolution: the write
        // only lands while the stored row is still active.
        let result = sqlx::query(
            r"
            UPDATE sessions SET
                resolved = ?2,
                status = ?3,
                cancel_reason = ?4,
                last_activity_at = ?5,
                delivered = ?6,
                planned = ?7
            WHERE id = ?1 AND status = 'active'
            ",
        )
        .bind(session.id().to_string())
        .bind(i64::from(session.resolved()))
        .bind(session.status().as_str())
        .bind(session.cancel_reason().map(|r| r.as_str()))
        .bind(session.last_activity_at())
        .bind(question_ids_to_json(session.delivered())?)
        .bind(question_ids_to_json(session.planned())?)
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_active(&self, owner: &OwnerId) -> Result<Option<Session>, StorageError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE owner = ?1 AND status = 'active' \
             ORDER BY started_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        row.as_ref().map(map_session_row).transpose()
    }

    async fn active_sessions(&self) -> Result<Vec<Session>, StorageError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'active' ORDER BY started_at"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_session_row).collect()
    }

    async fn record_delivery(
        &self,
        session: &Session,
        response: &PendingResponse,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;
        upsert_session(&mut tx, session).await?;
        sqlx::query(
            r"
            INSERT INTO responses (
                id, session_id, question_id, topic, kind, token, ordinal, correct_index,
                created_at, deadline_at, state, selected_option, correct, resolved_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ",
        )
        .bind(response.id().to_string())
        .bind(response.session_id().to_string())
        .bind(response.question_id().to_string())
        .bind(response.topic().as_str())
        .bind(response.kind().as_str())
        .bind(response.token().as_str())
        .bind(i64::from(response.ordinal()))
        .bind(i64::from(response.correct_index()))
        .bind(response.created_at())
        .bind(response.deadline_at())
        .bind(response.state().as_str())
        .bind(response.selected_option().map(i64::from))
        .bind(response.correct())
        .bind(response.resolved_at())
        .execute(&mut *tx)
        .await
        .map_err(conn)?;
        tx.commit().await.map_err(conn)
    }
}
