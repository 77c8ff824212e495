//! Error taxonomy for the migration engine.
//!
//! Mirrors `common::err::decode_error::ReError`'s shape (string-carrying
//! variants, `From` impls for the usual I/O/parse errors) but adds the
//! recovery-kind taxonomy the orchestrator needs to decide whether to
//! retry, abort with cleanup, or abort and leave state for diagnosis.

use std::fmt;
use std::io;
use std::num::ParseIntError;

use mysql_async::Error as MySqlError;

/// What the orchestrator should do in response to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Abort the migration, dropping shadow/changelog tables created this run.
    AbortWithCleanup,
    /// Abort the migration, leaving all state in place for inspection.
    AbortWithoutCleanup,
    /// Retry the operation, up to `default_retries`, with backoff.
    Retry,
    /// Surface to the operator and wait for `--approve-renamed-columns` or
    /// `--skip-renamed-columns`.
    AwaitApproval,
    /// Terminate immediately, no cleanup, no retry.
    Panic,
    /// Normal shutdown: roll back in-flight work, record the phase, exit 0.
    Cancel,
}

#[derive(Debug)]
pub enum GhostError {
    /// Invalid host role, missing privileges, no usable unique key,
    /// unsupported binlog format.
    FatalTopology(String),
    /// Critical-load threshold breached (after optional re-check).
    FatalCritical(String),
    /// Lock-wait timeout, deadlock, transient network error.
    Transient(String),
    /// Column-rename detection requires human approval.
    RenameAmbiguity(String),
    /// The panic-flag file was observed.
    PanicFlag(String),
    /// Normal shutdown in progress.
    Cancellation(String),

    IoError(io::Error),
    ParseIntError(ParseIntError),
    MySqlError(MySqlError),
    ConfigError(String),
}

impl GhostError {
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            GhostError::FatalTopology(_) => RecoveryAction::AbortWithCleanup,
            GhostError::FatalCritical(_) => RecoveryAction::AbortWithoutCleanup,
            GhostError::Transient(_) => RecoveryAction::Retry,
            GhostError::RenameAmbiguity(_) => RecoveryAction::AwaitApproval,
            GhostError::PanicFlag(_) => RecoveryAction::Panic,
            GhostError::Cancellation(_) => RecoveryAction::Cancel,
            // Unclassified driver/IO/config errors default to the safest
            // conservative action: stop and leave state for a human.
            GhostError::IoError(_)
            | GhostError::ParseIntError(_)
            | GhostError::MySqlError(_)
            | GhostError::ConfigError(_) => RecoveryAction::AbortWithoutCleanup,
        }
    }

    /// Classify a raw driver error the way the applier is required to:
    /// lock-wait timeout and deadlock are transient, duplicate key during
    /// row-copy is expected (INSERT IGNORE), anything else is fatal.
    pub fn classify_statement_error(err: MySqlError, during_row_copy_insert_ignore: bool) -> Option<GhostError> {
        if let MySqlError::Server(ref server_err) = err {
            match server_err.code {
                // ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK
                1205 | 1213 => return Some(GhostError::Transient(server_err.message.clone())),
                // ER_DUP_ENTRY
                1062 if during_row_copy_insert_ignore => return None,
                _ => {}
            }
        }
        Some(GhostError::MySqlError(err))
    }
}

impl fmt::Display for GhostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GhostError::FatalTopology(s) => write!(f, "fatal topology error: {s}"),
            GhostError::FatalCritical(s) => write!(f, "fatal critical-load error: {s}"),
            GhostError::Transient(s) => write!(f, "transient error: {s}"),
            GhostError::RenameAmbiguity(s) => write!(f, "rename ambiguity: {s}"),
            GhostError::PanicFlag(s) => write!(f, "panic flag: {s}"),
            GhostError::Cancellation(s) => write!(f, "cancelled: {s}"),
            GhostError::IoError(e) => write!(f, "{e}"),
            GhostError::ParseIntError(e) => write!(f, "{e}"),
            GhostError::MySqlError(e) => write!(f, "{e}"),
            GhostError::ConfigError(s) => write!(f, "config error: {s}"),
        }
    }
}

impl std::error::Error for GhostError {}

impl From<io::Error> for GhostError {
    fn from(e: io::Error) -> Self {
        GhostError::IoError(e)
    }
}

impl From<ParseIntError> for GhostError {
    fn from(e: ParseIntError) -> Self {
        GhostError::ParseIntError(e)
    }
}

impl From<MySqlError> for GhostError {
    fn from(e: MySqlError) -> Self {
        GhostError::MySqlError(e)
    }
}

pub type GResult<T> = Result<T, GhostError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recovery_action_matches_kind() {
        assert_eq!(
            GhostError::FatalTopology("x".into()).recovery_action(),
            RecoveryAction::AbortWithCleanup
        );
        assert_eq!(
            GhostError::PanicFlag("x".into()).recovery_action(),
            RecoveryAction::Panic
        );
    }
}
