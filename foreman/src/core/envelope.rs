//! Message envelopes exchanged through worker inboxes.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::Evidence;

pub const SCHEMA_VERSION: &str = "1";

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Envelope `type`. Unrecognised types deserialize to `Unknown` so newer
/// senders never break older consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Task,
    FsmUpdate,
    FsmRequest,
    Verify,
    Sync,
    Ack,
    Note,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::FsmUpdate => "fsm_update",
            Self::FsmRequest => "fsm_request",
            Self::Verify => "verify",
            Self::Sync => "sync",
            Self::Ack => "ack",
            Self::Note => "note",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "fsm_update" => Ok(Self::FsmUpdate),
            "fsm_request" => Ok(Self::FsmRequest),
            "verify" => Ok(Self::Verify),
            "sync" => Ok(Self::Sync),
            "ack" => Ok(Self::Ack),
            "note" => Ok(Self::Note),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

/// One message, stored as one JSON file under the recipient's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_s: Option<u64>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            created_at: Utc::now(),
            ttl_s: None,
            schema_version: default_schema_version(),
            task_id: None,
            state: None,
            summary: None,
            evidence: Vec::new(),
            repo_path: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_repo_path(mut self, repo_path: impl Into<String>) -> Self {
        self.repo_path = Some(repo_path.into());
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<Evidence>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_ttl(mut self, ttl_s: u64) -> Self {
        self.ttl_s = Some(ttl_s);
        self
    }

    /// Instant after which the envelope must be dropped, if it has a TTL.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl_s?;
        let delta = TimeDelta::try_seconds(i64::try_from(ttl).ok()?)?;
        self.created_at.checked_add_signed(delta)
    }

    /// True once `created_at + ttl_s` has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_parses_as_unknown() {
        let raw = r#"{"type":"telemetry","from":"a","to":"b","created_at":"2026-01-01T00:00:00Z"}"#;
        let envelope: Envelope = serde_json::from_str(raw).expect("parse");
        assert_eq!(envelope.kind, MessageType::Unknown);
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn ttl_expiry_is_inclusive_of_deadline() {
        let mut envelope = Envelope::new(MessageType::Note, "a", "b").with_ttl(10);
        envelope.created_at = "2026-01-01T00:00:00Z".parse().expect("ts");
        let before = "2026-01-01T00:00:09Z".parse().expect("ts");
        let at = "2026-01-01T00:00:10Z".parse().expect("ts");
        assert!(!envelope.is_expired(before));
        assert!(envelope.is_expired(at));
    }

    #[test]
    fn no_ttl_never_expires() {
        let envelope = Envelope::new(MessageType::Note, "a", "b");
        let far = "2999-01-01T00:00:00Z".parse().expect("ts");
        assert!(!envelope.is_expired(far));
    }

    #[test]
    fn optional_fields_are_omitted_when_empty() {
        let envelope = Envelope::new(MessageType::Ack, "a", "b");
        let json = serde_json::to_value(&envelope).expect("json");
        assert_eq!(json["type"], "ack");
        assert!(json.get("task_id").is_none());
        assert!(json.get("evidence").is_none());
    }

    #[test]
    fn message_type_from_str_matches_wire_names() {
        for kind in [
            MessageType::Task,
            MessageType::FsmUpdate,
            MessageType::FsmRequest,
            MessageType::Verify,
            MessageType::Sync,
            MessageType::Ack,
            MessageType::Note,
        ] {
            assert_eq!(kind.as_str().parse::<MessageType>(), Ok(kind));
        }
        assert!("bogus".parse::<MessageType>().is_err());
    }
}
