//! Error taxonomy for sessions, engines, and dispatch.
//!
//! [`BrokerError`] is `Clone` because one failure (a dead channel, say)
//! has to reject every caller waiting on that session.

use std::time::Duration;

use thiserror::Error;

/// Broad classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, raised before any channel or engine is touched.
    Validation,
    /// The session or engine identity is unknown.
    Lookup,
    /// A channel could not be obtained.
    Acquisition,
    /// The remote end misbehaved, went away, or never became ready.
    Protocol,
    /// The session was torn down while the caller was waiting.
    Lifecycle,
    /// A readiness or request wait exceeded its limit.
    Timeout,
    /// The remote engine or an external collaborator reported a failure.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("could not open a channel: {0}")]
    Acquisition(String),

    #[error("engine failed to become ready: {0}")]
    NotReady(String),

    #[error("the engine was terminated unexpectedly")]
    TerminatedUnexpectedly,

    #[error("failed to deserialize a message from the engine: {0}")]
    Deserialize(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("the session was destroyed")]
    Destroyed,

    #[error("{what} timed out after {after:?}")]
    TimedOut { what: &'static str, after: Duration },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("page extraction failed: {0}")]
    Extraction(String),
}

impl BrokerError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    pub fn engine_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "engine",
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingField(_)
            | Self::MissingArgument(_)
            | Self::InvalidArgument { .. }
            | Self::UnknownCommand(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::Lookup,
            Self::Acquisition(_) => ErrorKind::Acquisition,
            Self::NotReady(_)
            | Self::TerminatedUnexpectedly
            | Self::Deserialize(_)
            | Self::Channel(_) => ErrorKind::Protocol,
            Self::Destroyed => ErrorKind::Lifecycle,
            Self::TimedOut { .. } => ErrorKind::Timeout,
            Self::Engine(_) | Self::Extraction(_) => ErrorKind::Remote,
        }
    }

    /// Stable error name used when serializing for transport.
    pub fn name(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Lookup => "NotFoundError",
            ErrorKind::Acquisition => "AcquisitionError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Lifecycle => "DestroyedError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Remote => "RemoteError",
        }
    }
}

/// Render an error and its `source()` chain, one cause per line.
pub fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        out.push_str("\ncaused by: ");
        out.push_str(&inner.to_string());
        cause = inner.source();
    }
    out
}
