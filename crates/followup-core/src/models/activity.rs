use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::ContactId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityKind {
    Call,
    Email,
    Meeting,
    Message,
    Note,
    Other(String),
}

impl ActivityKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Call => "call",
            Self::Email => "email",
            Self::Meeting => "meeting",
            Self::Message => "message",
            Self::Note => "note",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for ActivityKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "call" => Self::Call,
            "email" => Self::Email,
            "meeting" => Self::Meeting,
            "message" | "whatsapp" | "sms" => Self::Message,
            "note" => Self::Note,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

impl From<ActivityKind> for String {
    fn from(kind: ActivityKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A persisted interaction with a contact. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub contact_id: ContactId,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Latest-activity information for one contact, as returned by the lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub has_activity: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl ActivitySummary {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            has_activity: true,
            last_activity_at: Some(timestamp),
        }
    }

    /// Fold another summary for the same contact into this one, keeping the later timestamp.
    pub fn merge(&mut self, other: &ActivitySummary) {
        self.has_activity |= other.has_activity;
        self.last_activity_at = match (self.last_activity_at, other.last_activity_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

pub type ActivityMap = HashMap<ContactId, ActivitySummary>;

/// Reduce raw records to one summary per contact.
pub fn summarize(records: &[ActivityRecord]) -> ActivityMap {
    let mut map = ActivityMap::new();
    for record in records {
        map.entry(record.contact_id.clone())
            .or_default()
            .merge(&ActivitySummary::at(record.timestamp));
    }
    map
}

/// What the user logged, before it is turned into an optimistic entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityDescriptor {
    pub kind: ActivityKind,
    pub details: Option<String>,
    /// Defaults to the moment of recording.
    pub occurred_at: Option<DateTime<Utc>>,
}

impl ActivityDescriptor {
    pub fn new(kind: ActivityKind) -> Self {
        Self {
            kind,
            details: None,
            occurred_at: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Succeeded,
    Failed,
}

/// A client-only activity that has not been confirmed by the backend yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticActivity {
    pub local_id: Uuid,
    pub contact_id: ContactId,
    pub kind: ActivityKind,
    pub details: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// Local wall-clock time the entry was created; drives expiry.
    pub recorded_at: DateTime<Utc>,
    pub status: SyncStatus,
}

impl OptimisticActivity {
    pub fn to_record(&self) -> ActivityRecord {
        ActivityRecord {
            contact_id: self.contact_id.clone(),
            kind: self.kind.clone(),
            details: self.details.clone(),
            timestamp: self.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_summarize_keeps_latest() {
        let now = Utc::now();
        let records = vec![
            ActivityRecord {
                contact_id: "a".to_string(),
                kind: ActivityKind::Call,
                details: None,
                timestamp: now - Duration::days(10),
            },
            ActivityRecord {
                contact_id: "a".to_string(),
                kind: ActivityKind::Email,
                details: Some("follow-up".to_string()),
                timestamp: now - Duration::days(2),
            },
            ActivityRecord {
                contact_id: "b".to_string(),
                kind: ActivityKind::Note,
                details: None,
                timestamp: now - Duration::days(5),
            },
        ];

        let map = summarize(&records);
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"].last_activity_at, Some(now - Duration::days(2)));
        assert!(map["b"].has_activity);
    }

    #[test]
    fn test_summary_wire_format() {
        let json = r#"{"hasActivity": true, "lastActivityAt": 1700000000000}"#;
        let summary: ActivitySummary = serde_json::from_str(json).unwrap();
        assert!(summary.has_activity);
        assert_eq!(
            summary.last_activity_at.unwrap().timestamp_millis(),
            1_700_000_000_000
        );

        let empty: ActivitySummary = serde_json::from_str(r#"{"hasActivity": false}"#).unwrap();
        assert!(empty.last_activity_at.is_none());
    }

    #[test]
    fn test_record_uses_type_field() {
        let json = r#"{"contactId": "c1", "type": "WhatsApp", "timestamp": 0}"#;
        let record: ActivityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, ActivityKind::Message);
        assert!(record.details.is_none());

        let out = serde_json::to_value(&record).unwrap();
        assert_eq!(out["type"], "message");
        assert!(out.get("details").is_none());
    }
}
