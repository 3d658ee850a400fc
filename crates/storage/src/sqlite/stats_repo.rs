use std::collections::HashSet;

use chrono::{DateTime, Utc};
use drill_core::model::{
    FailedScope, OwnerId, PendingResponse, QuestionId, ResponseOutcome, SubjectStats, Topic,
};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{conn, question_id_from_str, ser, topic_from_str};
use crate::repository::{DegradedRecord, HistoryRepository, StatsRepository, StorageError};

fn to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn to_u32(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

#[async_trait::async_trait]
impl StatsRepository for SqliteRepository {
    async fn get_stats(
        &self,
        owner: &OwnerId,
        topic: &Topic,
    ) -> Result<SubjectStats, StorageError> {
        let row = sqlx::query(
            r"
            SELECT resolved, correct, incorrect, timed_out,
                   current_streak, best_streak, last_study_at
            FROM stats WHERE owner = ?1 AND topic = ?2
            ",
        )
        .bind(owner.as_str())
        .bind(topic.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;
        let Some(row) = row else {
            return Ok(SubjectStats::new());
        };

        let seen_rows: Vec<String> = sqlx::query_scalar(
            "SELECT question_id FROM seen_questions WHERE owner = ?1 AND topic = ?2",
        )
        .bind(owner.as_str())
        .bind(topic.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        let seen: HashSet<QuestionId> = seen_rows
            .iter()
            .map(|s| question_id_from_str(s))
            .collect::<Result<_, _>>()?;

        Ok(SubjectStats::from_persisted(
            to_u64("resolved", row.try_get("resolved").map_err(ser)?)?,
            to_u64("correct", row.try_get("correct").map_err(ser)?)?,
            to_u64("incorrect", row.try_get("incorrect").map_err(ser)?)?,
            to_u64("timed_out", row.try_get("timed_out").map_err(ser)?)?,
            to_u32("current_streak", row.try_get("current_streak").map_err(ser)?)?,
            to_u32("best_streak", row.try_get("best_streak").map_err(ser)?)?,
            seen,
            row.try_get("last_study_at").map_err(ser)?,
        ))
    }

    async fn apply_resolution(
        &self,
        owner: &OwnerId,
        response: &PendingResponse,
        outcome: ResponseOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;

        // The applied marker is the idempotency key: a second attempt for the
        // same response hits the primary key and changes nothing.
        let marker = sqlx::query(
            r"
            INSERT INTO applied_resolutions (response_id, owner, applied_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(response_id) DO NOTHING
            ",
        )
        .bind(response.id().to_string())
        .bind(owner.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;
        if marker.rows_affected() == 0 {
            tx.rollback().await.map_err(conn)?;
            return Ok(false);
        }

        let row = sqlx::query(
            r"
            SELECT resolved, correct, incorrect, timed_out, current_streak, best_streak
            FROM stats WHERE owner = ?1 AND topic = ?2
            ",
        )
        .bind(owner.as_str())
        .bind(response.topic().as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(conn)?;
        let (mut resolved, mut correct, mut incorrect, mut timed_out, mut streak, mut best) =
            match row {
                Some(row) => (
                    row.try_get::<i64, _>("resolved").map_err(ser)?,
                    row.try_get::<i64, _>("correct").map_err(ser)?,
                    row.try_get::<i64, _>("incorrect").map_err(ser)?,
                    row.try_get::<i64, _>("timed_out").map_err(ser)?,
                    row.try_get::<i64, _>("current_streak").map_err(ser)?,
                    row.try_get::<i64, _>("best_streak").map_err(ser)?,
                ),
                None => (0, 0, 0, 0, 0, 0),
            };

        resolved += 1;
        let event_correct = match outcome {
            ResponseOutcome::Answered { correct: true, .. } => {
                correct += 1;
                streak += 1;
                best = best.max(streak);
                Some(true)
            }
            ResponseOutcome::Answered { correct: false, .. } => {
                incorrect += 1;
                streak = 0;
                Some(false)
            }
            ResponseOutcome::TimedOut => {
                timed_out += 1;
                None
            }
        };

        sqlx::query(
            r"
            INSERT INTO stats (
                owner, topic, resolved, correct, incorrect, timed_out,
                current_streak, best_streak, last_study_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(owner, topic) DO UPDATE SET
                resolved = excluded.resolved,
                correct = excluded.correct,
                incorrect = excluded.incorrect,
                timed_out = excluded.timed_out,
                current_streak = excluded.current_streak,
                best_streak = excluded.best_streak,
                last_study_at = excluded.last_study_at
            ",
        )
        .bind(owner.as_str())
        .bind(response.topic().as_str())
        .bind(resolved)
        .bind(correct)
        .bind(incorrect)
        .bind(timed_out)
        .bind(streak)
        .bind(best)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        // Seen membership is about exposure, not correctness; wrong answers
        // and timeouts exhaust the pool the same way.
        sqlx::query(
            r"
            INSERT INTO seen_questions (owner, topic, question_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(owner, topic, question_id) DO NOTHING
            ",
        )
        .bind(owner.as_str())
        .bind(response.topic().as_str())
        .bind(response.question_id().to_string())
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        sqlx::query(
            r"
            INSERT INTO answer_events (owner, question_id, topic, correct, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(owner.as_str())
        .bind(response.question_id().to_string())
        .bind(response.topic().as_str())
        .bind(event_correct)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        tx.commit().await.map_err(conn)?;
        Ok(true)
    }

    async fn record_degraded(&self, record: &DegradedRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO degraded_resolutions (
                owner, response_id, question_id, token,
                selected_option, correct, recorded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(record.owner.as_str())
        .bind(record.response_id.to_string())
        .bind(record.question_id.to_string())
        .bind(record.token.as_str())
        .bind(record.selected_option.map(i64::from))
        .bind(record.correct)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(())
    }

    async fn reset_seen(&self, owner: &OwnerId, topic: &Topic) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM seen_questions WHERE owner = ?1 AND topic = ?2")
            .bind(owner.as_str())
            .bind(topic.as_str())
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoryRepository for SqliteRepository {
    async fn has_history(&self, owner: &OwnerId) -> Result<bool, StorageError> {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM answer_events WHERE owner = ?1 LIMIT 1")
                .bind(owner.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(conn)?;
        Ok(row.is_some())
    }

    async fn failed_pool(
        &self,
        owner: &OwnerId,
        scope: &FailedScope,
        limit: usize,
    ) -> Result<Vec<QuestionId>, StorageError> {
        // A question stays in the pool while its newest failure (wrong answer
        // or timeout) postdates its newest correct answer.
        let mut sql = String::from(
            r"
            SELECT question_id, MAX(occurred_at) AS failed_at
            FROM answer_events
            WHERE owner = ?1 AND (correct IS NULL OR correct = 0)
            ",
        );
        if scope.topic().is_some() {
            sql.push_str(" AND topic = ?3");
        }
        sql.push_str(
            r"
            GROUP BY question_id
            HAVING failed_at > COALESCE((
                SELECT MAX(e2.occurred_at) FROM answer_events e2
                WHERE e2.owner = ?1
                  AND e2.question_id = answer_events.question_id
                  AND e2.correct = 1
            ), '')
            ORDER BY failed_at ASC
            LIMIT ?2
            ",
        );

        let mut query = sqlx::query(&sql)
            .bind(owner.as_str())
            .bind(to_i64("limit", limit as u64)?);
        if let Some(topic) = scope.topic() {
            query = query.bind(topic.as_str());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(conn)?;
        rows.iter()
            .map(|row| {
                question_id_from_str(&row.try_get::<String, _>("question_id").map_err(ser)?)
            })
            .collect()
    }

    async fn oldest_failure_topic(&self, owner: &OwnerId) -> Result<Option<Topic>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT topic, MAX(occurred_at) AS failed_at
            FROM answer_events
            WHERE owner = ?1 AND (correct IS NULL OR correct = 0)
            GROUP BY question_id
            HAVING failed_at > COALESCE((
                SELECT MAX(e2.occurred_at) FROM answer_events e2
                WHERE e2.owner = ?1
                  AND e2.question_id = answer_events.question_id
                  AND e2.correct = 1
            ), '')
            ORDER BY failed_at ASC
            LIMIT 1
            ",
        )
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;
        row.map(|row| topic_from_str(&row.try_get::<String, _>("topic").map_err(ser)?))
            .transpose()
    }
}
