use chrono::{DateTime, Utc};
use drill_core::model::{PendingResponse, PollToken, ResponseId, ResponseOutcome, SessionId};

use super::SqliteRepository;
use super::mapping::{conn, map_response_row, parse_response_state};
use crate::repository::{ResolveOutcome, ResponseRepository, StorageError};

const RESPONSE_COLUMNS: &str = "id, session_id, question_id, topic, kind, token, ordinal, \
     correct_index, created_at, deadline_at, state, selected_option, correct, resolved_at";

#[async_trait::async_trait]
impl ResponseRepository for SqliteRepository {
    async fn get_response(&self, id: ResponseId) -> Result<PendingResponse, StorageError> {
        let sql = format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_response_row(&row)
    }

    async fn find_by_token(
        &self,
        token: &PollToken,
    ) -> Result<Option<PendingResponse>, StorageError> {
        let sql = format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE token = ?1");
        let row = sqlx::query(&sql)
            .bind(token.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;
        row.as_ref().map(map_response_row).transpose()
    }

    async fn try_resolve(
        &self,
        id: ResponseId,
        outcome: ResponseOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, StorageError> {
        let (selected, correct) = match outcome {
            ResponseOutcome::Answered { selected, correct } => (
                Some(
                    i64::try_from(selected)
                        .map_err(|_| StorageError::Serialization("selected overflow".into()))?,
                ),
                Some(correct),
            ),
            ResponseOutcome::TimedOut => (None, None),
        };

        // The WHERE clause is the compare-and-set: only a still-pending row
        // takes the write, so exactly one resolver wins.
        let updated = sqlx::query(
            r"
            UPDATE responses
            SET state = ?1, selected_option = ?2, correct = ?3, resolved_at = ?4
            WHERE id = ?5 AND state = 'pending'
            ",
        )
        .bind(outcome.state().as_str())
        .bind(selected)
        .bind(correct)
        .bind(resolved_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if updated.rows_affected() > 0 {
            let response = self.get_response(id).await?;
            return Ok(ResolveOutcome::Applied(response));
        }

        let state: String = sqlx::query_scalar("SELECT state FROM responses WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        Ok(ResolveOutcome::AlreadyTerminal(parse_response_state(
            &state,
        )?))
    }

    async fn list_for_session(
        &self,
        session: SessionId,
    ) -> Result<Vec<PendingResponse>, StorageError> {
        let sql = format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses WHERE session_id = ?1 ORDER BY ordinal"
        );
        let rows = sqlx::query(&sql)
            .bind(session.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_response_row).collect()
    }

    async fn pending_responses(&self) -> Result<Vec<PendingResponse>, StorageError> {
        let sql = format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses WHERE state = 'pending' ORDER BY deadline_at"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_response_row).collect()
    }
}
