//! Crate-wide error taxonomy and worker exit codes.
//!
//! `AfdError` enumerates the language-neutral error kinds from the error
//! handling design: `Syntax`, `ResourceExhausted`, `AttachFailed`, `Stale`,
//! `Transient`, `PermanentRemote`, `Corruption`. Narrower per-module errors
//! (`StatusError`, `LsDataError`, `TrlError`, `ProtocolError`,
//! `CorrelatorError`) convert into it at the boundary where a worker needs a
//! single return type; library code otherwise returns its own concrete error
//! type rather than `Box<dyn Error>`.

use thiserror::Error;

use crate::correlator::CorrelatorError;
use crate::lsdata::LsDataError;
use crate::protocol::ProtocolError;
use crate::reinit::ReinitError;
use crate::status::StatusError;
use crate::trl::TrlError;

/// Top-level error taxonomy shared by every binary.
#[derive(Debug, Error)]
pub enum AfdError {
    /// Bad CLI or bad message-name characters. Fatal; never retried.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Allocation or file-descriptor failure. Fatal; the cleanup path runs.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Cannot map FSA/FRA or version mismatch. Fatal with a distinct exit
    /// code so supervisors can choose whether to restart.
    #[error("attach failed: {0}")]
    AttachFailed(#[from] StatusError),

    /// The table generation changed mid-flight; recoverable by detach and
    /// re-attach, but the current position may now be permanently invalid.
    #[error("stale generation: {0}")]
    Stale(String),

    /// The protocol adapter could not complete an operation but a retry by
    /// the external scheduler may succeed.
    #[error("transient failure: {0}")]
    Transient(#[from] ProtocolError),

    /// The adapter returned a protocol-level error that will not clear on
    /// retry (authentication, not-found, non-reclassifiable 4xx/5xx).
    #[error("permanent remote failure: {0}")]
    PermanentRemote(String),

    /// An on-disk table had an invalid size or negative counter. The
    /// invariant was auto-corrected; this variant exists for callers that
    /// want to surface the correction rather than only logging it.
    #[error("corruption auto-corrected: {0}")]
    Corruption(String),

    /// Retrieve-list store failure.
    #[error("retrieve-list error: {0}")]
    LsData(#[from] LsDataError),

    /// Transfer-rate-limit engine failure.
    #[error("transfer-rate-limit error: {0}")]
    Trl(#[from] TrlError),

    /// Confirmation correlator failure.
    #[error("correlator error: {0}")]
    Correlator(#[from] CorrelatorError),

    /// Reinitialiser teardown failure.
    #[error("reinit error: {0}")]
    Reinit(#[from] ReinitError),
}

/// Worker exit codes (§6). `sf_xxx`/`gf_xxx` map every outcome to one of
/// these; a syntax-time failure is signalled by negating the numeric value,
/// which [`ExitCode::negated_raw`] produces directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful completion of the job.
    TransferSuccess = 0,
    /// Malformed CLI invocation.
    SyntaxError = 1,
    /// Allocation failure.
    AllocError = 2,
    /// The job-id number could not be resolved.
    JidNumberError = 3,
    /// `exec` adapter failed to spawn or run the command.
    ExecError = 4,
    /// Could not open the incoming/work directory.
    OpenFileDirError = 5,
    /// Could not create a required directory.
    MkdirError = 6,
    /// The keep-connected no-op path failed.
    NoopError = 7,
    /// Generic non-specific failure.
    Incorrect = 8,
    /// The worker was killed by a signal before it could finish cleanly.
    GotKilled = 9,
}

impl ExitCode {
    /// Raw numeric value used as the process exit status.
    #[must_use]
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Negated numeric value, used when the failure happened at
    /// argument-parse time rather than during the work loop.
    #[must_use]
    pub fn negated_raw(self) -> i32 {
        -(self as i32)
    }
}

impl AfdError {
    /// Maps this error onto the worker exit code a scheduler should observe.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Syntax(_) => ExitCode::SyntaxError,
            Self::ResourceExhausted(_) => ExitCode::AllocError,
            Self::AttachFailed(_) => ExitCode::OpenFileDirError,
            Self::Stale(_) => ExitCode::TransferSuccess,
            Self::Transient(_) | Self::PermanentRemote(_) => ExitCode::Incorrect,
            Self::Corruption(_) => ExitCode::TransferSuccess,
            Self::LsData(_) => ExitCode::OpenFileDirError,
            Self::Trl(_) => ExitCode::Incorrect,
            Self::Correlator(_) => ExitCode::Incorrect,
            Self::Reinit(_) => ExitCode::Incorrect,
        }
    }
}
