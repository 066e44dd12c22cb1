//! Error classification for the mirror engine.
//!
//! [`ErrorMetadata`] is attached to an `anyhow` error chain via
//! `.context(...)` to tag it with the failure kind the workflow dispatches
//! on. The `short_msg` is a stable ScreamingCamelCase tag usable in tests
//! and log search; `msg` is the developer-facing description.

use std::borrow::Cow;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub kind: ErrorKind,
    /// Short ScreamingCamelCase tag, e.g. `SlotCreationFailed`.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection resets, timeouts: retried with backoff by the owning
    /// activity, then by the workflow.
    Transient,
    /// A change record that cannot be applied (missing key, missing old
    /// tuple). The table enters Error; the mirror continues.
    RecordRejected,
    /// Malformed WAL frame. The batch is abandoned without advancing the
    /// LSN; persistent failure fails the mirror.
    Decode,
    /// Invalid mirror configuration; reported synchronously, no workflow is
    /// started.
    Config,
    /// A signal that is not valid in the mirror's current state.
    SignalConflict,
    /// The referenced mirror/peer/table does not exist.
    NotFound,
    /// Inability to persist engine state; aborts the iteration.
    Fatal,
}

impl ErrorMetadata {
    pub fn transient(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: ErrorKind::Transient,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn record_rejected(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: ErrorKind::RecordRejected,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn decode(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: ErrorKind::Decode,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn config(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: ErrorKind::Config,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn signal_conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: ErrorKind::SignalConflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn fatal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }
}

/// Classification helpers on `anyhow::Error` chains.
pub trait ErrorMetadataAnyhowExt {
    fn metadata(&self) -> Option<&ErrorMetadata>;

    fn kind(&self) -> Option<ErrorKind> {
        self.metadata().map(|m| m.kind)
    }

    fn short_msg(&self) -> Option<&str> {
        self.metadata().map(|m| m.short_msg.as_ref())
    }

    fn is_transient(&self) -> bool {
        self.kind() == Some(ErrorKind::Transient)
    }

    fn is_record_rejected(&self) -> bool {
        self.kind() == Some(ErrorKind::RecordRejected)
    }

    fn is_decode(&self) -> bool {
        self.kind() == Some(ErrorKind::Decode)
    }

    fn is_signal_conflict(&self) -> bool {
        self.kind() == Some(ErrorKind::SignalConflict)
    }

    fn is_fatal(&self) -> bool {
        self.kind() == Some(ErrorKind::Fatal)
    }
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn metadata(&self) -> Option<&ErrorMetadata> {
        // The chain iterates outermost-first, so the most recent
        // classification wins.
        self.chain().find_map(|e| e.downcast_ref::<ErrorMetadata>())
    }
}

/// Whether a driver-level error is worth retrying: the connection died, the
/// server is shedding load, or the transaction lost a race.
pub fn pg_error_is_transient(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    let Some(code) = e.code() else {
        // No SQLSTATE means the failure happened below the protocol:
        // connect/read/write errors.
        return true;
    };
    let code = code.code();
    // Class 08: connection exception; class 53: insufficient resources;
    // 57P01 admin_shutdown, 57P02 crash_shutdown, 57P03 cannot_connect_now;
    // 40001 serialization_failure, 40P01 deadlock_detected.
    code.starts_with("08")
        || code.starts_with("53")
        || code == "57P01"
        || code == "57P02"
        || code == "57P03"
        || code == "40001"
        || code == "40P01"
}

/// Wraps a driver error, tagging it `Transient` when retryable.
pub fn classify_pg_error(e: tokio_postgres::Error, what: &'static str) -> anyhow::Error {
    let transient = pg_error_is_transient(&e);
    let err = anyhow::Error::from(e);
    if transient {
        err.context(ErrorMetadata::transient(
            "PostgresTransient",
            format!("transient failure during {what}"),
        ))
    } else {
        err.context(format!("failure during {what}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_survives_context_chains() {
        let err = anyhow::anyhow!("io reset")
            .context(ErrorMetadata::transient("ConnReset", "connection reset"))
            .context("while pulling changes");
        assert!(err.is_transient());
        assert_eq!(err.short_msg(), Some("ConnReset"));
        assert!(!err.is_record_rejected());
    }

    #[test]
    fn bare_errors_have_no_kind() {
        let err = anyhow::anyhow!("plain");
        assert_eq!(err.kind(), None);
        assert!(!err.is_transient());
    }

    #[test]
    fn outermost_metadata_wins_lookup() {
        let err = anyhow::anyhow!("x")
            .context(ErrorMetadata::record_rejected("NoKey", "no primary key"))
            .context(ErrorMetadata::transient("Outer", "outer"));
        assert!(err.is_transient());
    }
}
