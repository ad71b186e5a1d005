//! Note use-case service.
//!
//! # Responsibility
//! - Provide the create/list/delete note use-cases on top of the record store.
//! - Assign ids and creation timestamps to new notes.
//! - Redact deleted notes from backup snapshots.
//!
//! # Invariants
//! - Create and delete are read-modify-write within one store lock hold.
//! - New notes are appended, so list order is creation order.
//! - A note is never created with both title and text blank.

use crate::model::note::Note;
use crate::model::record::RecordId;
use crate::repo::record_store::RecordStore;
use crate::storage::StoreError;
use chrono::{SecondsFormat, Utc};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 200;

/// Service error for note use-cases.
#[derive(Debug)]
pub enum NoteServiceError {
    /// Input rejected before touching storage.
    InvalidNote(String),
    /// Target note does not exist.
    NoteNotFound(RecordId),
    /// Generated id already present in the collection.
    DuplicateId(RecordId),
    /// Persistence-layer failure.
    Store(StoreError),
}

impl Display for NoteServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNote(message) => write!(f, "invalid note: {message}"),
            Self::NoteNotFound(id) => write!(f, "note not found: {id}"),
            Self::DuplicateId(id) => write!(f, "note id already exists: {id}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for NoteServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for NoteServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::DuplicateId(id) => Self::DuplicateId(id),
            other => Self::Store(other),
        }
    }
}

/// Note service facade over the record store.
#[derive(Clone)]
pub struct NoteService {
    store: RecordStore,
}

impl NoteService {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Creates one note and appends it to the collection.
    pub async fn create_note(
        &self,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Note, NoteServiceError> {
        let title = title.into().trim().to_string();
        let text = text.into().trim().to_string();
        validate_note_input(&title, &text)?;

        let note = Note {
            id: Uuid::new_v4().to_string(),
            title,
            text,
            created_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        };

        let record = note.to_record();
        self.store
            .update(|records| {
                if records.iter().any(|existing| existing.id() == record.id()) {
                    return Err(NoteServiceError::DuplicateId(record.id().to_string()));
                }
                records.push(record);
                Ok(())
            })
            .await?;

        info!("event=note_create module=service status=ok id={}", note.id);
        Ok(note)
    }

    /// Returns all notes in creation order.
    pub async fn list_notes(&self) -> Result<Vec<Note>, NoteServiceError> {
        let records = self.store.load_all().await?;
        Ok(records.iter().map(Note::from_record).collect())
    }

    /// Deletes one note and redacts it from backup snapshots.
    ///
    /// Redaction runs after the delete is saved and is best-effort; failures
    /// are logged and do not fail the delete.
    pub async fn delete_note(&self, id: &str) -> Result<Note, NoteServiceError> {
        let removed = self
            .store
            .update(|records| {
                let position = records
                    .iter()
                    .position(|record| record.id() == id)
                    .ok_or_else(|| NoteServiceError::NoteNotFound(id.to_string()))?;
                Ok::<_, NoteServiceError>(records.remove(position))
            })
            .await?;

        let report = self.store.purge_record_from_backups(id).await;
        if report.failed > 0 {
            warn!(
                "event=note_delete module=service status=partial id={} redaction_failures={}",
                id, report.failed
            );
        } else {
            info!("event=note_delete module=service status=ok id={}", id);
        }

        Ok(Note::from_record(&removed))
    }
}

fn validate_note_input(title: &str, text: &str) -> Result<(), NoteServiceError> {
    if title.is_empty() && text.is_empty() {
        return Err(NoteServiceError::InvalidNote(
            "title and text cannot both be empty".to_string(),
        ));
    }
    if title.chars().count() > TITLE_MAX_CHARS {
        return Err(NoteServiceError::InvalidNote(format!(
            "title exceeds {TITLE_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_note_input, NoteServiceError};
    use crate::storage::StoreError;

    #[test]
    fn blank_note_is_rejected() {
        assert!(matches!(
            validate_note_input("", ""),
            Err(NoteServiceError::InvalidNote(_))
        ));
        assert!(validate_note_input("", "body only").is_ok());
        assert!(validate_note_input("title only", "").is_ok());
    }

    #[test]
    fn overlong_title_is_rejected() {
        let title = "x".repeat(201);
        assert!(validate_note_input(&title, "").is_err());
    }

    #[test]
    fn store_duplicate_maps_to_service_duplicate() {
        let err = NoteServiceError::from(StoreError::DuplicateId("7".to_string()));
        assert!(matches!(err, NoteServiceError::DuplicateId(id) if id == "7"));
    }
}
