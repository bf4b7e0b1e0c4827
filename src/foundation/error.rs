//! Crate-wide error type.
//!
//! The taxonomy mirrors where an error can interrupt an export:
//!
//! - [`ClipflowError::Build`]: graph construction rejected the operation
//!   (invalid filter arguments, incompatible inputs, no-op application).
//!   Always synchronous, never retried.
//! - [`ClipflowError::Source`]: a source descriptor could not be read.
//!   Fatal to the export; the caller may retry by re-issuing.
//! - [`ClipflowError::Protocol`]: a programming-contract violation on the
//!   request/reply channel (unknown node id, superseded listener, reply with
//!   nobody waiting). Not recoverable.
//! - [`ClipflowError::Engine`]: a fatal decode/encode/mux failure reported by
//!   the media engine. Propagates as export-fatal and triggers teardown.
//! - [`ClipflowError::Frame`]: a per-frame engine failure. Logged by the
//!   coordinator and skipped; forward progress continues.

/// Convenience alias used by every fallible function in the crate.
pub type ClipflowResult<T> = Result<T, ClipflowError>;

/// Coarse error class, used when an error has to cross the context boundary
/// as plain data and be rebuilt on the other side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Graph-construction failure.
    Build,
    /// Source I/O failure.
    Source,
    /// Request/reply contract violation.
    Protocol,
    /// Fatal engine failure.
    Engine,
    /// Non-fatal per-frame engine failure.
    Frame,
}

/// Error type for all clipflow operations.
#[derive(thiserror::Error, Debug)]
pub enum ClipflowError {
    /// Graph-construction failure; rejects the building call.
    #[error("build error: {0}")]
    Build(String),

    /// Source descriptor unreadable, range fetch rejected, path missing.
    #[error("source error: {0}")]
    Source(String),

    /// Request routed to an unknown id, reply with no pending listener, or a
    /// pending listener replaced by a newer request of the same key.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Fatal engine failure (malformed container, encoder setup, mux error).
    #[error("engine error: {0}")]
    Engine(String),

    /// Per-frame engine failure; the coordinator logs and skips the frame.
    #[error("frame error: {0}")]
    Frame(String),

    /// Anything else, preserved with its source chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClipflowError {
    /// Build-time rejection.
    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    /// Source I/O failure.
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Messaging-contract violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Fatal engine failure.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Non-fatal per-frame failure.
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::Frame(msg.into())
    }

    /// Class of this error, for wire transport.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Build(_) => ErrorKind::Build,
            Self::Source(_) => ErrorKind::Source,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Engine(_) | Self::Other(_) => ErrorKind::Engine,
            Self::Frame(_) => ErrorKind::Frame,
        }
    }

    /// Rebuild an error from its wire form.
    pub fn from_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        match kind {
            ErrorKind::Build => Self::Build(msg.into()),
            ErrorKind::Source => Self::Source(msg.into()),
            ErrorKind::Protocol => Self::Protocol(msg.into()),
            ErrorKind::Engine => Self::Engine(msg.into()),
            ErrorKind::Frame => Self::Frame(msg.into()),
        }
    }

    /// Whether this error must abort the in-flight export.
    ///
    /// Everything except per-frame engine failures is export-fatal.
    pub fn is_export_fatal(&self) -> bool {
        !matches!(self, Self::Frame(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            ClipflowError::build("x").to_string().contains("build error:")
        );
        assert!(
            ClipflowError::source("x")
                .to_string()
                .contains("source error:")
        );
        assert!(
            ClipflowError::protocol("x")
                .to_string()
                .contains("protocol error:")
        );
        assert!(
            ClipflowError::engine("x")
                .to_string()
                .contains("engine error:")
        );
    }

    #[test]
    fn only_frame_errors_are_non_fatal() {
        assert!(!ClipflowError::frame("bad frame").is_export_fatal());
        assert!(ClipflowError::build("x").is_export_fatal());
        assert!(ClipflowError::source("x").is_export_fatal());
        assert!(ClipflowError::protocol("x").is_export_fatal());
        assert!(ClipflowError::engine("x").is_export_fatal());
    }

    #[test]
    fn kind_round_trips_over_the_wire() {
        let err = ClipflowError::source("missing file");
        let rebuilt = ClipflowError::from_kind(err.kind(), "missing file");
        assert!(matches!(rebuilt, ClipflowError::Source(_)));
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = ClipflowError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.kind(), ErrorKind::Engine);
    }
}
