//! Repository layer over the JSON collection file.
//!
//! # Responsibility
//! - Offer whole-collection persistence APIs to services and handlers.
//! - Isolate file, lock and backup details behind one facade.
//!
//! # Invariants
//! - Callers never write the collection file except through `RecordStore`.

pub mod record_store;
