use anyhow::{Context, Result};
use followup_core::models::FollowUpBuckets;
use followup_core::{Availability, FollowUpView};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyOutput {
    pub availability: Availability,
    #[serde(flatten)]
    pub buckets: FollowUpBuckets,
}

impl From<FollowUpView> for ClassifyOutput {
    fn from(view: FollowUpView) -> Self {
        Self {
            availability: view.availability,
            buckets: view.buckets,
        }
    }
}

impl ClassifyOutput {
    pub fn render(&self, pretty: bool) -> Result<String> {
        if pretty {
            serde_json::to_string_pretty(self).context("Failed to serialize output")
        } else {
            serde_json::to_string(self).context("Failed to serialize output")
        }
    }
}
