//! Activity backends.
//!
//! The hosted backend owns contact activities; the follow-up core only reads the
//! latest timestamp per contact and appends new activities. `ActivityBackend` is the
//! seam, object safe so the runtime can hold an `Arc<dyn ActivityBackend>`.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::error::BackendError;
use crate::models::{summarize, ActivityMap, ActivityRecord, ActivitySummary, ContactId};

pub trait ActivityBackend: Send + Sync {
    /// Latest activity for each of `contact_ids`. Contacts without activity may be absent.
    fn fetch_activities<'a>(
        &'a self,
        contact_ids: &'a [ContactId],
    ) -> BoxFuture<'a, Result<ActivityMap, BackendError>>;

    fn persist_activity<'a>(
        &'a self,
        activity: &'a ActivityRecord,
    ) -> BoxFuture<'a, Result<(), BackendError>>;
}

/// Backend holding activity records in memory. Used for fixtures and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<Vec<ActivityRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ActivityRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Load a JSON array of activity records.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read activities file: {}", path.display()))?;
        let records: Vec<ActivityRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse activities file: {}", path.display()))?;
        Ok(Self::with_records(records))
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.read().clone()
    }
}

impl ActivityBackend for MemoryBackend {
    fn fetch_activities<'a>(
        &'a self,
        contact_ids: &'a [ContactId],
    ) -> BoxFuture<'a, Result<ActivityMap, BackendError>> {
        Box::pin(async move {
            let wanted: HashSet<&str> = contact_ids.iter().map(String::as_str).collect();
            let records = self.records.read();
            let matching: Vec<ActivityRecord> = records
                .iter()
                .filter(|r| wanted.contains(r.contact_id.as_str()))
                .cloned()
                .collect();
            Ok(summarize(&matching))
        })
    }

    fn persist_activity<'a>(
        &'a self,
        activity: &'a ActivityRecord,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            self.records.write().push(activity.clone());
            Ok(())
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LatestActivitiesRequest<'a> {
    contact_ids: &'a [ContactId],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestActivityRow {
    contact_id: ContactId,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_activity_at: Option<DateTime<Utc>>,
}

/// JSON-over-HTTP backend.
///
/// - `POST {base}/rpc/latest_activities` with `{"contactIds": [...]}` returns
///   `[{"contactId": "...", "lastActivityAt": <millis>|null}]`
/// - `POST {base}/activities` with an activity record appends it
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.post(self.endpoint(path));
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }
        request
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

impl ActivityBackend for HttpBackend {
    fn fetch_activities<'a>(
        &'a self,
        contact_ids: &'a [ContactId],
    ) -> BoxFuture<'a, Result<ActivityMap, BackendError>> {
        Box::pin(async move {
            let response = self
                .post("rpc/latest_activities")
                .json(&LatestActivitiesRequest { contact_ids })
                .send()
                .await?;
            let rows: Vec<LatestActivityRow> = Self::check(response).await?.json().await?;

            let mut map = ActivityMap::new();
            for row in rows {
                let summary = ActivitySummary {
                    has_activity: row.last_activity_at.is_some(),
                    last_activity_at: row.last_activity_at,
                };
                map.entry(row.contact_id).or_default().merge(&summary);
            }
            Ok(map)
        })
    }

    fn persist_activity<'a>(
        &'a self,
        activity: &'a ActivityRecord,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let response = self.post("activities").json(activity).send().await?;
            Self::check(response).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivityKind;
    use chrono::Duration;

    fn record(contact_id: &str, days_ago: i64) -> ActivityRecord {
        ActivityRecord {
            contact_id: contact_id.to_string(),
            kind: ActivityKind::Call,
            details: None,
            timestamp: Utc::now() - Duration::days(days_ago),
        }
    }

    #[test]
    fn test_memory_backend_fetch_and_persist() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let backend = MemoryBackend::with_records(vec![record("a", 5), record("b", 1)]);

        let ids = vec!["a".to_string(), "c".to_string()];
        let map = rt.block_on(backend.fetch_activities(&ids)).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map["a"].has_activity);

        rt.block_on(backend.persist_activity(&record("c", 0))).unwrap();
        let map = rt.block_on(backend.fetch_activities(&ids)).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(backend.records().len(), 3);
    }

    #[test]
    fn test_memory_backend_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activities.json");
        std::fs::write(
            &path,
            r#"[{"contactId": "1", "type": "email", "timestamp": 1700000000000}]"#,
        )
        .unwrap();

        let backend = MemoryBackend::from_json_file(&path).unwrap();
        assert_eq!(backend.records().len(), 1);
        assert!(MemoryBackend::from_json_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_http_endpoint_joining() {
        let backend = HttpBackend::new("https://crm.example.com/api/", None);
        assert_eq!(
            backend.endpoint("/rpc/latest_activities"),
            "https://crm.example.com/api/rpc/latest_activities"
        );
        assert_eq!(backend.endpoint("activities"), "https://crm.example.com/api/activities");
    }

    #[test]
    fn test_latest_row_parsing() {
        let rows: Vec<LatestActivityRow> = serde_json::from_str(
            r#"[{"contactId": "1", "lastActivityAt": 1700000000000}, {"contactId": "2", "lastActivityAt": null}]"#,
        )
        .unwrap();
        assert!(rows[0].last_activity_at.is_some());
        assert!(rows[1].last_activity_at.is_none());
    }
}
