//! allproxy: session state for a capture-and-inspect proxy dashboard.
//!
//! Captured traffic and log lines flow through [`session::Session`], which
//! applies no-capture rules and breakpoints, keeps a bounded live queue, and
//! freezes it into named snapshots that can be exported and re-imported.

pub mod allproxy_breakpoints;
pub mod allproxy_core;
pub mod allproxy_logs;
pub mod allproxy_queries;
pub mod allproxy_queue;
pub mod allproxy_snapshots;
pub mod allproxy_storage;
mod cli;
pub mod colors;
pub mod session;

pub use cli::{run, DynError};
pub use session::{IngestOutcome, RuleList, Session, SessionConfig, SessionError};
