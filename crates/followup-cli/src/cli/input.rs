use std::path::Path;

use anyhow::{Context, Result};
use followup_core::models::{Contact, ContactRecord};

/// Load a JSON array of contact records and validate every one of them.
pub fn load_contacts(path: &Path) -> Result<Vec<Contact>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read contacts file: {}", path.display()))?;
    parse_contacts(&content)
        .with_context(|| format!("Failed to parse contacts file: {}", path.display()))
}

pub fn parse_contacts(json: &str) -> Result<Vec<Contact>> {
    let records: Vec<ContactRecord> =
        serde_json::from_str(json).context("Contacts must be a JSON array of records")?;
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            Contact::try_from(record).with_context(|| format!("Invalid contact at index {}", index))
        })
        .collect()
}
