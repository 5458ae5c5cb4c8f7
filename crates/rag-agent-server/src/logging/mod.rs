//! Structured audit logging for the agent loop.
//!
//! Request-scoped activity records (request id, conversation id, component,
//! kind) are queued through a bounded channel and batch-inserted by background
//! workers so the hot path never waits on the log table.

mod logger;
mod types;

pub use logger::{AuditLogger, LoggerConfig};
pub use types::{AuditRecord, AuditStatus, Component, RecordKind};
