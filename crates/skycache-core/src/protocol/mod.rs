//! Request/reply control surface for diagnostics and cache management.
//!
//! Commands arrive as JSON (`{"type": ..., "payload": ...}`), are parsed
//! into the closed `Command` enum and dispatched by the agent. Every
//! command gets exactly one `ReplyEnvelope` back.

mod client;
mod command;
mod reply;

pub use client::ControlClient;
pub use command::{Command, QueueRequest};
pub use reply::{
    ClearReport, Diagnostics, HealthSummary, ManifestCoverage, Reply, ReplyEnvelope,
    ValidationReport, Verdict, VersionInfo,
};
