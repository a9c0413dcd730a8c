//! Error kinds shared by every component (§7 ERROR HANDLING DESIGN).
//!
//! These are the vocabulary both schedulers and sinks use to classify a
//! failure; the classification drives policy (does it halt a scheduler?
//! does it poison a sink? does it abort the process?) rather than existing
//! purely for display.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitoringError {
    /// Malformed input: an unparsable TLV packet, an unparsable scrape body.
    #[error("parse error: {0}")]
    EParse(String),

    /// A task record failed validation (§3 invariants R1-R3) at commit time.
    #[error("invalid task record: {0}")]
    EConfig(String),

    /// A bounded wait (connect, recv, process join) expired.
    #[error("timed out: {0}")]
    ETimeout(String),

    /// Connection establishment failed (refused, unreachable, reset).
    #[error("connection error: {0}")]
    EConn(String),

    /// A read/write syscall failed for a reason other than timeout.
    #[error("I/O error: {0}")]
    EIO(String),

    /// A size or queue-capacity limit was exceeded.
    #[error("overflow: {0}")]
    EOverflow(String),

    /// A child process was terminated by a signal (ScriptScheduler).
    #[error("child killed: {0}")]
    EKilled(String),

    /// A sink rejected further submissions after sustained failure.
    #[error("output poisoned: {0}")]
    EPoisoned(String),

    /// Unrecoverable: the process cannot continue (e.g. demultiplexer init
    /// failure). Returning this from `main` exits the process non-zero.
    #[error("fatal: {0}")]
    EFatal(String),
}

impl MonitoringError {
    pub fn eio(err: impl std::fmt::Display) -> Self {
        MonitoringError::EIO(err.to_string())
    }

    pub fn econn(err: impl std::fmt::Display) -> Self {
        MonitoringError::EConn(err.to_string())
    }

    pub fn eparse(err: impl std::fmt::Display) -> Self {
        MonitoringError::EParse(err.to_string())
    }
}
