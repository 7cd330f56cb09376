//! Inbound Event Types
//!
//! Typed event kinds shared by routing and ingress, plus the immutable
//! [`InboundEvent`] produced once a delivery passes verification.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Kinds of events the gateway knows how to route.
///
/// Producers name their events with strings; anything not recognised lands in
/// [`EventKind::Unknown`] so it can still be routed and logged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum EventKind {
    /// A message was posted in a channel.
    Message,
    /// The application was mentioned.
    Mention,
    /// A reaction was added to a message.
    Reaction,
    /// A slash command was invoked.
    Command,
    /// An interactive component (button, menu) was used.
    Interaction,
    /// Commits were pushed.
    Push,
    /// A pull request changed state.
    PullRequest,
    /// A pull request review was submitted.
    PullRequestReview,
    /// An issue changed state.
    Issue,
    /// A comment was left on an issue or pull request.
    IssueComment,
    /// A check run was created or completed.
    CheckRun,
    /// The application was installed or uninstalled.
    Installation,
    /// Connectivity probe sent when a webhook is configured.
    Ping,
    /// Any event type without a dedicated variant.
    Unknown(String),
}

impl EventKind {
    /// Parse a producer's event type string.
    pub fn parse_str(s: &str) -> Self {
        match s {
            "message" => Self::Message,
            "app_mention" | "mention" => Self::Mention,
            "reaction_added" | "reaction" => Self::Reaction,
            "command" | "slash_command" => Self::Command,
            "block_actions" | "interactive_message" | "interaction" => Self::Interaction,
            "push" => Self::Push,
            "pull_request" => Self::PullRequest,
            "pull_request_review" => Self::PullRequestReview,
            "issues" | "issue" => Self::Issue,
            "issue_comment" => Self::IssueComment,
            "check_run" => Self::CheckRun,
            "installation" => Self::Installation,
            "ping" => Self::Ping,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Mention => "app_mention",
            Self::Reaction => "reaction_added",
            Self::Command => "command",
            Self::Interaction => "interaction",
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::PullRequestReview => "pull_request_review",
            Self::Issue => "issues",
            Self::IssueComment => "issue_comment",
            Self::CheckRun => "check_run",
            Self::Installation => "installation",
            Self::Ping => "ping",
            Self::Unknown(s) => s,
        }
    }

    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A verified, not-yet-deduplicated delivery.
///
/// Immutable once built; handlers receive it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Producer-assigned delivery identifier (or a body digest when absent).
    pub delivery_id: String,
    pub kind: EventKind,
    pub received_at: DateTime<Utc>,
    pub raw_body: Bytes,
    pub signature: String,
    /// Signing timestamp; `None` for schemes without one.
    pub signature_timestamp: Option<DateTime<Utc>>,
    /// Identifier of the user that triggered the event, if the provider sent one.
    pub actor_id: Option<String>,
    /// Command name for [`EventKind::Command`] events.
    pub command: Option<String>,
    /// Name of the provider profile that accepted the delivery.
    pub provider: String,
}

impl InboundEvent {
    /// Parse the raw body as JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.raw_body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_and_unknown_kinds() {
        assert_eq!(EventKind::parse_str("pull_request"), EventKind::PullRequest);
        assert_eq!(EventKind::parse_str("app_mention"), EventKind::Mention);
        assert_eq!(EventKind::parse_str("slash_command"), EventKind::Command);
        assert_eq!(
            EventKind::parse_str("workflow_run"),
            EventKind::Unknown("workflow_run".into())
        );
        assert!(EventKind::parse_str("deployment").is_unknown());
    }

    #[test]
    fn as_str_round_trips_for_known_kinds() {
        for kind in [
            EventKind::Message,
            EventKind::Mention,
            EventKind::Command,
            EventKind::Push,
            EventKind::Issue,
            EventKind::IssueComment,
            EventKind::Ping,
        ] {
            assert_eq!(EventKind::parse_str(kind.as_str()), kind);
        }
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&EventKind::Unknown("team_join".into())).unwrap();
        assert_eq!(json, "\"team_join\"");
        assert_eq!(serde_json::to_string(&EventKind::Push).unwrap(), "\"push\"");
    }
}
