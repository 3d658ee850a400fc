use drill_core::model::{Question, QuestionId, Topic};

use super::mapping::{conn, map_question_row, ser, topic_from_str};
use super::SqliteRepository;
use crate::repository::{QuestionRepository, StorageError};

#[async_trait::async_trait]
impl QuestionRepository for SqliteRepository {
    async fn upsert_question(&self, question: &Question) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO questions (id, topic, number, text, options, correct_index)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                topic = excluded.topic,
                number = excluded.number,
                text = excluded.text,
                options = excluded.options,
                correct_index = excluded.correct_index
            ",
        )
        .bind(question.id().to_string())
        .bind(question.topic().as_str())
        .bind(i64::from(question.number()))
        .bind(question.text())
        .bind(serde_json::to_string(question.options()).map_err(ser)?)
        .bind(
            i64::try_from(question.correct_index())
                .map_err(|_| StorageError::Serialization("correct_index overflow".into()))?,
        )
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(())
    }

    async fn get_question(&self, id: QuestionId) -> Result<Question, StorageError> {
        let row = sqlx::query(
            "SELECT id, topic, number, text, options, correct_index FROM questions WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_question_row(&row)
    }

    async fn topics(&self) -> Result<Vec<Topic>, StorageError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT topic FROM questions ORDER BY topic",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;
        rows.iter().map(|t| topic_from_str(t)).collect()
    }

    async fn count(&self, topic: &Topic) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM questions WHERE topic = ?1")
            .bind(topic.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(conn)?;
        u64::try_from(count).map_err(|_| StorageError::Serialization("negative count".into()))
    }

    async fn random_question(
        &self,
        topic: &Topic,
        exclude: &[QuestionId],
    ) -> Result<Option<Question>, StorageError> {
        // The exclusion list arrives as a JSON array so the query shape stays
        // fixed regardless of its length.
        let excluded = serde_json::to_string(
            &exclude.iter().map(ToString::to_string).collect::<Vec<_>>(),
        )
        .map_err(ser)?;
        let row = sqlx::query(
            r"
            SELECT id, topic, number, text, options, correct_index
            FROM questions
            WHERE topic = ?1
              AND id NOT IN (SELECT value FROM json_each(?2))
            ORDER BY RANDOM()
            LIMIT 1
            ",
        )
        .bind(topic.as_str())
        .bind(excluded)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;
        row.as_ref().map(map_question_row).transpose()
    }
}
