use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates the full schema (questions, sessions, responses, stats, history,
/// and indexes).
#[allow(clippy::too_many_lines)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS questions (
                    id TEXT PRIMARY KEY,
                    topic TEXT NOT NULL,
                    number INTEGER NOT NULL CHECK (number >= 0),
                    text TEXT NOT NULL,
                    options TEXT NOT NULL,
                    correct_index INTEGER NOT NULL CHECK (correct_index >= 0)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    selector TEXT NOT NULL,
                    target INTEGER NOT NULL CHECK (target > 0),
                    resolved INTEGER NOT NULL CHECK (resolved >= 0),
                    status TEXT NOT NULL,
                    cancel_reason TEXT,
                    started_at TEXT NOT NULL,
                    last_activity_at TEXT NOT NULL,
                    delivered TEXT NOT NULL,
                    planned TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS responses (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    token TEXT NOT NULL UNIQUE,
                    ordinal INTEGER NOT NULL CHECK (ordinal > 0),
                    correct_index INTEGER NOT NULL CHECK (correct_index >= 0),
                    created_at TEXT NOT NULL,
                    deadline_at TEXT NOT NULL,
                    state TEXT NOT NULL,
                    selected_option INTEGER,
                    correct INTEGER,
                    resolved_at TEXT,
                    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS stats (
                    owner TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    resolved INTEGER NOT NULL CHECK (resolved >= 0),
                    correct INTEGER NOT NULL CHECK (correct >= 0),
                    incorrect INTEGER NOT NULL CHECK (incorrect >= 0),
                    timed_out INTEGER NOT NULL CHECK (timed_out >= 0),
                    current_streak INTEGER NOT NULL CHECK (current_streak >= 0),
                    best_streak INTEGER NOT NULL CHECK (best_streak >= 0),
                    last_study_at TEXT,
                    PRIMARY KEY (owner, topic)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS seen_questions (
                    owner TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    PRIMARY KEY (owner, topic, question_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS applied_resolutions (
                    response_id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS answer_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    correct INTEGER,
                    occurred_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS degraded_resolutions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner TEXT NOT NULL,
                    response_id TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    token TEXT NOT NULL,
                    selected_option INTEGER,
                    correct INTEGER,
                    recorded_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_questions_topic
                    ON questions(topic);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_sessions_owner_status
                    ON sessions(owner, status);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_responses_session_ordinal
                    ON responses(session_id, ordinal);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_responses_state
                    ON responses(state);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_answer_events_owner_question
                    ON answer_events(owner, question_id, occurred_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
