//! Error types for `execpool`.
//!
//! Every error is `Clone` so a single recorded failure can be handed out on
//! every subsequent read of a stream. I/O causes are shared through `Arc`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias using the `execpool` [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the pool and by checked-out workers.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A pool was requested with zero workers.
    #[error("pool size must be at least 1")]
    InvalidSize,

    /// The worker executable could not be resolved.
    #[error("failed to look up executable {}: {source}", program.display())]
    Lookup {
        program: PathBuf,
        #[source]
        source: which::Error,
    },

    /// One of the initial workers could not be started.
    #[error("failed to create worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: SpawnError,
    },

    /// A replacement worker could not be started; the pool is dead.
    #[error("failed to add a worker to the pool: {0}")]
    Replenish(#[source] SpawnError),

    /// The pool stopped handing out workers without a recorded cause.
    #[error("pool is closed")]
    PoolClosed,

    /// The worker exited unsuccessfully.
    #[error(transparent)]
    Exit(#[from] ExitError),

    /// Waiting for the worker to exit failed.
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] Arc<io::Error>),

    /// Reading the caller-supplied input failed.
    #[error("failed to copy stdin: {0}")]
    Input(#[source] Arc<io::Error>),

    /// Writing to the worker's stdin failed.
    #[error("failed to write to stdin pipe: {0}")]
    WriteStdin(#[source] Arc<io::Error>),

    /// Closing the worker's stdin failed.
    #[error("failed to close stdin pipe: {0}")]
    CloseStdin(#[source] Arc<io::Error>),

    /// Reading the worker's stdout failed.
    #[error("failed to read stdout pipe: {0}")]
    Read(#[source] Arc<io::Error>),
}

impl Error {
    /// Recover the typed error carried by an I/O error returned from a
    /// worker output stream.
    pub fn from_io(err: &io::Error) -> Option<&Self> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Self>())
    }

    /// The underlying I/O failure, if this error wraps one.
    pub fn io_cause(&self) -> Option<&io::Error> {
        match self {
            Self::Wait(e)
            | Self::Input(e)
            | Self::WriteStdin(e)
            | Self::CloseStdin(e)
            | Self::Read(e) => Some(e),
            Self::Spawn { source, .. } | Self::Replenish(source) => source.io_cause(),
            _ => None,
        }
    }

    /// Exit code of a failed worker (-1 when it was killed by a signal).
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit(e) => Some(e.exit_code()),
            _ => None,
        }
    }

    /// True when the worker was terminated by a signal, e.g. on cancellation.
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::Exit(e) if e.is_signal())
    }

    /// True for the error that marks a permanently failed pool.
    pub const fn is_pool_failure(&self) -> bool {
        matches!(self, Self::Replenish(_) | Self::PoolClosed)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        Self::other(err)
    }
}

/// Failure to start a single worker process.
#[derive(Debug, Clone, Error)]
pub enum SpawnError {
    #[error("failed to start command: {0}")]
    Start(#[source] Arc<io::Error>),

    #[error("failed to capture {0} pipe")]
    MissingPipe(&'static str),

    #[error("extra files are only supported on unix")]
    ExtraFilesUnsupported,
}

impl SpawnError {
    fn io_cause(&self) -> Option<&io::Error> {
        match self {
            Self::Start(e) => Some(e),
            _ => None,
        }
    }
}

/// A worker finished with an unsuccessful exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitError {
    status: ExitStatus,
}

impl ExitError {
    pub const fn new(status: ExitStatus) -> Self {
        Self { status }
    }

    pub const fn status(&self) -> ExitStatus {
        self.status
    }

    /// Exit code, or `None` when the process was terminated by a signal.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Exit code, or -1 when the process was terminated by a signal.
    pub fn exit_code(&self) -> i32 {
        match self.status.code() {
            Some(code) => code,
            None => -1,
        }
    }

    pub fn is_signal(&self) -> bool {
        self.status.code().is_none()
    }

    /// Signal number that terminated the process.
    #[cfg(unix)]
    pub fn signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.status.signal()
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.status.code() {
            return write!(f, "exit status {code}");
        }

        #[cfg(unix)]
        if let Some(signal) = self.signal() {
            return match nix::sys::signal::Signal::try_from(signal) {
                Ok(sig) => write!(f, "killed by signal {}", sig.as_str()),
                Err(_) => write!(f, "killed by signal {signal}"),
            };
        }

        write!(f, "terminated abnormally")
    }
}

impl std::error::Error for ExitError {}
