//! Streams handed out by a pool checkout.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use uuid::Uuid;

use crate::error::Error;
use crate::process::Process;

/// A stream that fails every read with the same error without touching any
/// OS resource. Returned in place of a worker once a pool is dead.
#[derive(Debug, Clone)]
pub struct ErrorStream {
    error: Error,
}

impl ErrorStream {
    pub const fn new(error: Error) -> Self {
        Self { error }
    }

    pub const fn error(&self) -> &Error {
        &self.error
    }
}

impl AsyncRead for ErrorStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(self.error.clone().into()))
    }
}

/// The stdout of a checked-out worker, or the pool's error stream.
#[derive(Debug)]
pub enum Output {
    Process(Process),
    Failed(ErrorStream),
}

impl Output {
    /// True when the pool was dead and no worker was checked out.
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Id of the checked-out worker.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Self::Process(p) => Some(p.id()),
            Self::Failed(_) => None,
        }
    }

    /// The error recorded so far: the worker's first error, or the pool
    /// error carried by a failed checkout.
    pub fn error(&self) -> Option<Error> {
        match self {
            Self::Process(p) => p.error(),
            Self::Failed(e) => Some(e.error().clone()),
        }
    }
}

impl AsyncRead for Output {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Process(p) => Pin::new(p).poll_read(cx, buf),
            Self::Failed(e) => Pin::new(e).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::SpawnError;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn error_stream_always_fails() {
        let mut stream = ErrorStream::new(Error::Replenish(SpawnError::MissingPipe("stdin")));
        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let err = stream.read(&mut buf).await.unwrap_err();
            assert!(Error::from_io(&err).unwrap().is_pool_failure());
        }
    }

    #[tokio::test]
    async fn failed_output_reads_nothing() {
        let mut output = Output::Failed(ErrorStream::new(Error::InvalidSize));
        assert!(output.is_failed());
        assert!(output.id().is_none());
        assert!(matches!(output.error(), Some(Error::InvalidSize)));

        let mut out = Vec::new();
        let err = output.read_to_end(&mut out).await.unwrap_err();
        assert!(out.is_empty());
        assert!(matches!(Error::from_io(&err), Some(Error::InvalidSize)));
    }
}
