//! Typed note view over a stored record.

use crate::model::record::{Record, RecordId};
use serde::{Deserialize, Serialize};

/// One note as created by the note service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: RecordId,
    pub title: String,
    pub text: String,
    /// RFC 3339 creation time; absent for notes written by older clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Note {
    /// Converts the note into its stored record shape.
    pub fn to_record(&self) -> Record {
        let mut record = Record::new(self.id.clone())
            .with_field("title", self.title.clone())
            .with_field("text", self.text.clone());
        if let Some(created_at) = &self.created_at {
            record.insert("created_at", created_at.clone());
        }
        record
    }

    /// Reads a note view from a record. Missing `title`/`text` read as empty.
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id().to_string(),
            title: record.get_str("title").unwrap_or_default().to_string(),
            text: record.get_str("text").unwrap_or_default().to_string(),
            created_at: record.get_str("created_at").map(str::to_string),
        }
    }
}
