use async_trait::async_trait;
use drill_core::model::{OwnerId, PollToken};
use drill_core::poll::PollDraft;
use thiserror::Error;

/// Errors surfaced by the external delivery channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The channel refused this particular poll; a substitute question may
    /// still go through.
    #[error("channel rejected the poll: {0}")]
    Rejected(String),
    /// The channel itself is unreachable; substitution will not help.
    #[error("channel transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    /// Whether trying a different question could succeed.
    #[must_use]
    pub fn is_substitutable(&self) -> bool {
        matches!(self, ChannelError::Rejected(_))
    }
}

/// Outbound poll delivery. The returned token is the channel's correlation
/// handle for the eventual answer callback.
#[async_trait]
pub trait PollChannel: Send + Sync {
    /// Sends one quiz poll to the owner.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Rejected` when this poll was refused and
    /// `ChannelError::Transport` when the channel is down.
    async fn send_poll(&self, owner: &OwnerId, draft: &PollDraft)
    -> Result<PollToken, ChannelError>;
}

/// Outbound plain-text notifications (summaries, progress, cancellations).
///
/// Notification failures are never allowed to disturb session state, so this
/// interface is infallible from the caller's point of view; implementations
/// log and swallow their own errors.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, owner: &OwnerId, text: &str);
}
