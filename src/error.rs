// SPDX-License-Identifier: MIT
//! Error taxonomy shared across the daemon.
//!
//! Every error kind carries a stable wire name and a stable process exit
//! code. Gateway handlers map kinds to HTTP statuses; the router never
//! returns these to a caller — routing failures become bounces, dead-letter
//! entries, or events.

/// All failure kinds the orchestrator can surface.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("no route from {from} to {to}")]
    NoRoute { from: String, to: String },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("mail file corrupt: {0}")]
    MailCorrupt(String),

    #[error("container runtime failure: {0}")]
    ContainerRuntime(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl HiveError {
    /// Stable wire identifier, used in HTTP error bodies and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            HiveError::NoRoute { .. } => "ErrNoRoute",
            HiveError::UnknownNode(_) => "ErrUnknownNode",
            HiveError::Validation(_) => "ErrValidation",
            HiveError::MailCorrupt(_) => "ErrMailCorrupt",
            HiveError::ContainerRuntime(_) => "ErrContainerRuntime",
            HiveError::AlreadyExists(_) => "ErrAlreadyExists",
            HiveError::NotFound(_) => "ErrNotFound",
            HiveError::Busy(_) => "ErrBusy",
            HiveError::Io(_) => "ErrIO",
            HiveError::Cancelled => "ErrCancelled",
        }
    }

    /// Stable process exit code for CLI front-ends. 0 is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            HiveError::NoRoute { .. } => 10,
            HiveError::UnknownNode(_) => 11,
            HiveError::Validation(_) => 12,
            HiveError::MailCorrupt(_) => 13,
            HiveError::ContainerRuntime(_) => 14,
            HiveError::AlreadyExists(_) => 15,
            HiveError::NotFound(_) => 16,
            HiveError::Busy(_) => 17,
            HiveError::Io(_) => 18,
            HiveError::Cancelled => 19,
        }
    }
}
