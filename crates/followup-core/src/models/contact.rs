use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ValidationError;

pub type ContactId = String;

/// Pipeline status of a contact. `Converted` (also reported as "paid") is terminal
/// and never needs a follow-up.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContactStatus {
    New,
    Contacted,
    Qualified,
    Proposal,
    Negotiation,
    Converted,
    Lost,
    Other(String),
}

impl ContactStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "new" | "lead" => Self::New,
            "contacted" => Self::Contacted,
            "qualified" => Self::Qualified,
            "proposal" => Self::Proposal,
            "negotiation" => Self::Negotiation,
            "converted" | "paid" | "won" => Self::Converted,
            "lost" => Self::Lost,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::Proposal => "proposal",
            Self::Negotiation => "negotiation",
            Self::Converted => "converted",
            Self::Lost => "lost",
            Self::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converted)
    }
}

impl From<String> for ContactStatus {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<ContactStatus> for String {
    fn from(status: ContactStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A contact as handed to the follow-up core. Read-only from the core's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: ContactId,
    pub status: ContactStatus,
    pub labels: BTreeSet<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(id: impl Into<ContactId>) -> Self {
        Self {
            id: id.into(),
            status: ContactStatus::New,
            labels: BTreeSet::new(),
            created_at: None,
        }
    }

    pub fn with_status(mut self, status: ContactStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Contact ids arrive as strings or integers depending on the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s.trim().to_string(),
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// Contact record exactly as the external contact store returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: RawId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl TryFrom<ContactRecord> for Contact {
    type Error = ValidationError;

    fn try_from(record: ContactRecord) -> Result<Self, Self::Error> {
        let id = record.id.into_string();
        if id.is_empty() {
            return Err(ValidationError::EmptyContactId);
        }

        let created_at = match record.created_at {
            Some(millis) => Some(Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                ValidationError::InvalidTimestamp {
                    contact_id: id.clone(),
                    millis,
                }
            })?),
            None => None,
        };

        let labels = record
            .labels
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Contact {
            id,
            status: record
                .status
                .as_deref()
                .map(ContactStatus::parse)
                .unwrap_or(ContactStatus::New),
            labels,
            created_at,
        })
    }
}

/// Set of selected labels. Empty means "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFilter(BTreeSet<String>);

impl LabelFilter {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            labels
                .into_iter()
                .map(Into::into)
                .filter(|l: &String| !l.trim().is_empty())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the filter is empty or the contact carries at least one selected label.
    pub fn matches(&self, contact: &Contact) -> bool {
        self.0.is_empty() || self.0.iter().any(|l| contact.labels.contains(l))
    }

    /// Selected labels in sorted order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}
