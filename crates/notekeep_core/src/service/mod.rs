//! Use-case services.
//!
//! # Responsibility
//! - Orchestrate record store calls into note-level use-cases.
//! - Keep request-handling layers decoupled from storage details.

pub mod note_service;
