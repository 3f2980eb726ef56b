//! Storage engine for treemirror
//!
//! SQLite-backed mapping store, durable task queue and task lock rows.

mod connection;
pub mod locks;
pub mod mapping;
mod migrations;
pub mod queue;

pub use connection::Storage;
pub use mapping::PlaceholderOutcome;
pub use migrations::SCHEMA_VERSION;
pub use queue::{QueueStats, TaskRow, TaskStatus};
