//! `patrol-memory` – The Event Log.
//!
//! Durable record of every closed incident, kept in a local SQLite file that
//! the dashboard reads.
//!
//! # Modules
//!
//! - [`event_log`] – [`EventLog`][event_log::EventLog] and its SQLite
//!   implementation [`SqliteEventLog`][event_log::SqliteEventLog]: append-only
//!   persistence of [`EventRecord`][patrol_types::EventRecord]s with lazy,
//!   filtered queries.

pub mod event_log;

pub use event_log::{EventFilter, EventLog, RecordStream, SqliteEventLog, StorageError};
