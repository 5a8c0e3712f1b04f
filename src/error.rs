use crate::graph::SpanId;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Inconsistent parent links found while building one session's span tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("malformed graph: span {span_id} is its own ancestor")]
    Cycle { span_id: SpanId },

    #[error("malformed graph: span {span_id} has parents {first} and {second}")]
    ConflictingParent {
        span_id: SpanId,
        first: SpanId,
        second: SpanId,
    },

    #[error("malformed graph: span {span_id} is both top-level and a child of {parent}")]
    ConflictingRoot { span_id: SpanId, parent: SpanId },
}

/// Failures reported by a tracing backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TracerError {
    #[error("span {span_id:x} of trace {trace_id:x} is not open")]
    UnknownSpan { trace_id: u64, span_id: u64 },

    #[error("agent channel disconnected")]
    Disconnected,

    #[error("span storage lock poisoned")]
    Poisoned,
}

impl TracerError {
    /// The transport is gone; nothing later in the run can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TracerError::Disconnected | TracerError::Poisoned)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropagationError {
    #[error("propagated context invalid: {reason} in {token:?}")]
    Invalid { token: String, reason: &'static str },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad row at {path}:{line}: {source}")]
    Row {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("record source unavailable: {0}")]
    Unavailable(String),
}

/// Everything that can stop a single session; contained to that session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    MalformedGraph(#[from] GraphError),

    #[error("materialization of span {span_id} failed: {source}")]
    Materialization {
        span_id: SpanId,
        #[source]
        source: TracerError,
    },

    #[error("backend call failed: {0}")]
    Backend(#[from] TracerError),

    #[error("fetching events failed: {0}")]
    Source(#[from] SourceError),

    #[error("session {0} is already in flight")]
    SessionAlreadyActive(Uuid),
}

impl SessionError {
    /// Short stable name used when logging a skipped session.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::MalformedGraph(_) => "MalformedGraph",
            SessionError::Materialization { .. } => "MaterializationFailure",
            SessionError::Backend(_) => "BackendFailure",
            SessionError::Source(_) => "SourceFailure",
            SessionError::SessionAlreadyActive(_) => "SessionAlreadyActive",
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Materialization { source, .. } | SessionError::Backend(source) => {
                source.is_fatal()
            }
            _ => false,
        }
    }
}

/// Run-level failures. Only these abort the whole run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("fetching sessions failed: {0}")]
    Source(#[from] SourceError),

    #[error("tracing backend unavailable while processing session {session_id}: {source}")]
    Backend {
        session_id: Uuid,
        #[source]
        source: SessionError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
