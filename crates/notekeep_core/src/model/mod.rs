//! Domain model for the stored collection.
//!
//! # Responsibility
//! - Define the record shape the store persists.
//! - Provide the typed note view used by the note service.
//!
//! # Invariants
//! - Every record is identified by a stable string `id`.
//! - The store always reads and writes whole collections.

pub mod note;
pub mod record;
