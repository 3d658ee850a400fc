use std::sync::Arc;

use drill_core::Clock;
use drill_core::model::{CancelReason, Session, SessionStatus, SessionSummary};
use storage::repository::Storage;
use tracing::{error, info};

use crate::channel::NotificationSink;
use crate::delivery::DeliveryCoordinator;
use crate::error::ReconcileError;

/// Drives a session forward after each resolved question: either the next
/// question goes out, or the session is finalized with a summary.
#[derive(Clone)]
pub struct SessionFlow {
    storage: Storage,
    delivery: DeliveryCoordinator,
    sink: Arc<dyn NotificationSink>,
    clock: Clock,
}

impl SessionFlow {
    #[must_use]
    pub fn new(
        storage: Storage,
        delivery: DeliveryCoordinator,
        sink: Arc<dyn NotificationSink>,
        clock: Clock,
    ) -> Self {
        Self {
            storage,
            delivery,
            sink,
            clock,
        }
    }

    /// Delivers the first question of a freshly started session. A failed
    /// first delivery cancels the session instead of leaving it dangling.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Delivery` with the failure that caused the
    /// cancellation.
    pub async fn kick_off(&self, session: &mut Session) -> Result<(), ReconcileError> {
        if let Err(failure) = self.delivery.deliver_next(session).await {
            self.cancel_for_delivery_failure(session).await?;
            return Err(failure.into());
        }
        Ok(())
    }

    /// Advances the session after one of its questions resolved: sends the
    /// next question while questions remain, or finalizes with a summary.
    ///
    /// Delivery failure here cancels the session; the error is logged and
    /// swallowed because the triggering resolution itself already succeeded.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Storage` when session state cannot be read
    /// or written.
    pub async fn advance_or_finalize(&self, session: &mut Session) -> Result<(), ReconcileError> {
        match session.status() {
            SessionStatus::Completed => self.finalize(session).await,
            SessionStatus::Active => {
                if let Err(failure) = self.delivery.deliver_next(session).await {
                    error!(
                        session = %session.id(),
                        error = %failure,
                        "delivery failed mid-session, cancelling"
                    );
                    self.cancel_for_delivery_failure(session).await?;
                }
                Ok(())
            }
            // Resolutions can land on already-cancelled or expired sessions;
            // their stats are recorded but the session stays put.
            SessionStatus::Cancelled | SessionStatus::Expired => Ok(()),
        }
    }

    async fn finalize(&self, session: &Session) -> Result<(), ReconcileError> {
        let responses = self.storage.responses.list_for_session(session.id()).await?;
        let summary = SessionSummary::from_responses(
            session.id(),
            session.selector(),
            session.resolved(),
            &responses,
        )?;
        info!(
            session = %session.id(),
            correct = summary.correct(),
            total = summary.total(),
            "session completed"
        );
        self.sink
            .notify(session.owner(), &render_summary(&summary))
            .await;
        Ok(())
    }

    async fn cancel_for_delivery_failure(
        &self,
        session: &mut Session,
    ) -> Result<(), ReconcileError> {
        session.cancel(CancelReason::DeliveryFailed, self.clock.now());
        self.storage.sessions.update_session(session).await?;
        self.sink
            .notify(
                session.owner(),
                "Session cancelled: the next question could not be delivered.",
            )
            .await;
        Ok(())
    }
}

fn render_summary(summary: &SessionSummary) -> String {
    let mut text = format!(
        "Session finished ({}): {}/{} correct, {} wrong, {} timed out.",
        summary.selector_label(),
        summary.correct(),
        summary.total(),
        summary.incorrect(),
        summary.timed_out(),
    );
    if let Some(accuracy) = summary.accuracy() {
        let percent = (accuracy * 100.0).round();
        text.push_str(&format!(" Accuracy: {percent:.0}%."));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::render_summary;
    use drill_core::model::{
        PendingResponse, PollKind, PollToken, QuestionId, ResponseId, ResponseOutcome, SessionId,
        SessionSummary, Topic, TopicSelector,
    };
    use drill_core::time::fixed_now;

    fn resolved(outcome: ResponseOutcome, ordinal: u32) -> PendingResponse {
        let mut r = PendingResponse::new(
            ResponseId::generate(),
            SessionId::generate(),
            QuestionId::generate(),
            Topic::new("armada").unwrap(),
            PollKind::Study,
            PollToken::new(format!("tok-{ordinal}")),
            ordinal,
            0,
            fixed_now(),
            fixed_now(),
        );
        r.resolve(outcome, fixed_now()).unwrap();
        r
    }

    #[test]
    fn summary_text_includes_counts_and_accuracy() {
        let responses = vec![
            resolved(ResponseOutcome::Answered { selected: 0, correct: true }, 1),
            resolved(ResponseOutcome::Answered { selected: 1, correct: false }, 2),
            resolved(ResponseOutcome::TimedOut, 3),
        ];
        let selector = TopicSelector::Single(Topic::new("armada").unwrap());
        let summary =
            SessionSummary::from_responses(SessionId::generate(), &selector, 3, &responses)
                .unwrap();
        let text = render_summary(&summary);
        assert!(text.contains("1/3 correct"));
        assert!(text.contains("1 wrong"));
        assert!(text.contains("1 timed out"));
        assert!(text.contains("Accuracy: 50%"));
    }

    #[test]
    fn summary_text_omits_accuracy_when_nothing_answered() {
        let responses = vec![resolved(ResponseOutcome::TimedOut, 1)];
        let summary = SessionSummary::from_responses(
            SessionId::generate(),
            &TopicSelector::Random,
            1,
            &responses,
        )
        .unwrap();
        let text = render_summary(&summary);
        assert!(!text.contains("Accuracy"));
    }
}
