use chrono::{DateTime, Utc};
use drill_core::model::{
    CancelReason, OwnerId, PendingResponse, PollKind, PollToken, Question, QuestionId, ResponseId,
    ResponseState, Session, SessionId, SessionStatus, Topic, TopicSelector,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

pub(crate) fn question_id_from_str(s: &str) -> Result<QuestionId, StorageError> {
    s.parse().map_err(ser)
}

pub(crate) fn session_id_from_str(s: &str) -> Result<SessionId, StorageError> {
    s.parse().map_err(ser)
}

pub(crate) fn response_id_from_str(s: &str) -> Result<ResponseId, StorageError> {
    s.parse().map_err(ser)
}

pub(crate) fn topic_from_str(s: &str) -> Result<Topic, StorageError> {
    Topic::new(s).map_err(ser)
}

pub(crate) fn parse_session_status(s: &str) -> Result<SessionStatus, StorageError> {
    match s {
        "active" => Ok(SessionStatus::Active),
        "completed" => Ok(SessionStatus::Completed),
        "cancelled" => Ok(SessionStatus::Cancelled),
        "expired" => Ok(SessionStatus::Expired),
        _ => Err(StorageError::Serialization(format!("invalid status: {s}"))),
    }
}

pub(crate) fn parse_cancel_reason(s: &str) -> Result<CancelReason, StorageError> {
    match s {
        "user_requested" => Ok(CancelReason::UserRequested),
        "superseded" => Ok(CancelReason::Superseded),
        "delivery_failed" => Ok(CancelReason::DeliveryFailed),
        _ => Err(StorageError::Serialization(format!(
            "invalid cancel reason: {s}"
        ))),
    }
}

pub(crate) fn parse_response_state(s: &str) -> Result<ResponseState, StorageError> {
    match s {
        "pending" => Ok(ResponseState::Pending),
        "answered" => Ok(ResponseState::Answered),
        "timed_out" => Ok(ResponseState::TimedOut),
        _ => Err(StorageError::Serialization(format!("invalid state: {s}"))),
    }
}

pub(crate) fn parse_poll_kind(s: &str) -> Result<PollKind, StorageError> {
    match s {
        "study" => Ok(PollKind::Study),
        "exam_drill" => Ok(PollKind::ExamDrill),
        "simulacro" => Ok(PollKind::Simulacro),
        "duel" => Ok(PollKind::Duel),
        _ => Err(StorageError::Serialization(format!("invalid kind: {s}"))),
    }
}

pub(crate) fn question_ids_to_json(ids: &[QuestionId]) -> Result<String, StorageError> {
    serde_json::to_string(ids).map_err(ser)
}

pub(crate) fn question_ids_from_json(json: &str) -> Result<Vec<QuestionId>, StorageError> {
    serde_json::from_str(json).map_err(ser)
}

pub(crate) fn map_question_row(row: &SqliteRow) -> Result<Question, StorageError> {
    let id = question_id_from_str(&row.try_get::<String, _>("id").map_err(ser)?)?;
    let topic = topic_from_str(&row.try_get::<String, _>("topic").map_err(ser)?)?;
    let number_i64: i64 = row.try_get("number").map_err(ser)?;
    let number = u32::try_from(number_i64)
        .map_err(|_| StorageError::Serialization(format!("invalid number: {number_i64}")))?;
    let text: String = row.try_get("text").map_err(ser)?;
    let options: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("options").map_err(ser)?).map_err(ser)?;
    let correct_i64: i64 = row.try_get("correct_index").map_err(ser)?;
    let correct_index = usize::try_from(correct_i64)
        .map_err(|_| StorageError::Serialization(format!("invalid correct_index: {correct_i64}")))?;
    Question::new(id, topic, number, text, options, correct_index).map_err(ser)
}

pub(crate) fn map_session_row(row: &SqliteRow) -> Result<Session, StorageError> {
    let id = session_id_from_str(&row.try_get::<String, _>("id").map_err(ser)?)?;
    let owner = OwnerId::new(row.try_get::<String, _>("owner").map_err(ser)?);
    let selector: TopicSelector =
        serde_json::from_str(&row.try_get::<String, _>("selector").map_err(ser)?).map_err(ser)?;
    let target_i64: i64 = row.try_get("target").map_err(ser)?;
    let target = u32::try_from(target_i64)
        .map_err(|_| StorageError::Serialization(format!("invalid target: {target_i64}")))?;
    let resolved_i64: i64 = row.try_get("resolved").map_err(ser)?;
    let resolved = u32::try_from(resolved_i64)
        .map_err(|_| StorageError::Serialization(format!("invalid resolved: {resolved_i64}")))?;
    let status = parse_session_status(&row.try_get::<String, _>("status").map_err(ser)?)?;
    let cancel_reason = row
        .try_get::<Option<String>, _>("cancel_reason")
        .map_err(ser)?
        .as_deref()
        .map(parse_cancel_reason)
        .transpose()?;
    let started_at: DateTime<Utc> = row.try_get("started_at").map_err(ser)?;
    let last_activity_at: DateTime<Utc> = row.try_get("last_activity_at").map_err(ser)?;
    let delivered = question_ids_from_json(&row.try_get::<String, _>("delivered").map_err(ser)?)?;
    let planned = question_ids_from_json(&row.try_get::<String, _>("planned").map_err(ser)?)?;
    Ok(Session::from_persisted(
        id,
        owner,
        selector,
        target,
        resolved,
        status,
        cancel_reason,
        started_at,
        last_activity_at,
        delivered,
        planned,
    ))
}

pub(crate) fn map_response_row(row: &SqliteRow) -> Result<PendingResponse, StorageError> {
    let id = response_id_from_str(&row.try_get::<String, _>("id").map_err(ser)?)?;
    let session_id = session_id_from_str(&row.try_get::<String, _>("session_id").map_err(ser)?)?;
    let question_id =
        question_id_from_str(&row.try_get::<String, _>("question_id").map_err(ser)?)?;
    let topic = topic_from_str(&row.try_get::<String, _>("topic").map_err(ser)?)?;
    let kind = parse_poll_kind(&row.try_get::<String, _>("kind").map_err(ser)?)?;
    let token = PollToken::new(row.try_get::<String, _>("token").map_err(ser)?);
    let ordinal_i64: i64 = row.try_get("ordinal").map_err(ser)?;
    let ordinal = u32::try_from(ordinal_i64)
        .map_err(|_| StorageError::Serialization(format!("invalid ordinal: {ordinal_i64}")))?;
    let correct_i64: i64 = row.try_get("correct_index").map_err(ser)?;
    let correct_index = u32::try_from(correct_i64)
        .map_err(|_| StorageError::Serialization(format!("invalid correct_index: {correct_i64}")))?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(ser)?;
    let deadline_at: DateTime<Utc> = row.try_get("deadline_at").map_err(ser)?;
    let state = parse_response_state(&row.try_get::<String, _>("state").map_err(ser)?)?;
    let selected_option = row
        .try_get::<Option<i64>, _>("selected_option")
        .map_err(ser)?
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| StorageError::Serialization(format!("invalid selected_option: {v}")))
        })
        .transpose()?;
    let correct = row.try_get::<Option<bool>, _>("correct").map_err(ser)?;
    let resolved_at: Option<DateTime<Utc>> = row.try_get("resolved_at").map_err(ser)?;
    Ok(PendingResponse::from_persisted(
        id,
        session_id,
        question_id,
        topic,
        kind,
        token,
        ordinal,
        correct_index,
        created_at,
        deadline_at,
        state,
        selected_option,
        correct,
        resolved_at,
    ))
}
