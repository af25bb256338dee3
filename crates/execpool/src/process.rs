//! A single pre-spawned worker process.
//!
//! A [`Process`] owns the read side of one worker: its stdout pipe and the
//! channel on which the reaper task reports the exit status. Background
//! tasks (input feeding, external cancellation) only ever see a
//! [`ProcessHandle`], which exposes the set-once error cell and the
//! cancellation token and nothing else.
//!
//! Reading a `Process` to the end drives it to completion: end of stdout
//! waits for the exit status, a failing status becomes the stream error, and
//! the first error recorded by any task is the one every later read reports.

use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, ExitError, Result, SpawnError};
use crate::spec::ProcessSpec;

/// Chunk size used when pumping caller input into a worker's stdin.
const INPUT_BUFFER_SIZE: usize = 8 * 1024;

/// State shared between a worker's reader and its background tasks.
#[derive(Debug)]
struct Shared {
    id: Uuid,
    /// First error recorded for this worker. Never overwritten.
    error: RwLock<Option<Error>>,
    cancel: CancellationToken,
}

impl Shared {
    fn stop(&self, err: Option<Error>) {
        if let Some(err) = err {
            let mut slot = self.error.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    fn error(&self) -> Option<Error> {
        self.error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Streaming stdout.
    Reading,
    /// Stdout reached EOF; waiting for the exit status.
    Waiting,
    /// Terminal: the error cell decides between EOF and failure.
    Done,
}

/// One live worker process, waiting for input on stdin.
///
/// Implements [`AsyncRead`] over the worker's stdout. Dropping a `Process`
/// kills the worker if it is still running.
#[derive(Debug)]
pub struct Process {
    shared: Arc<Shared>,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    exit: oneshot::Receiver<io::Result<ExitStatus>>,
    phase: Phase,
}

impl Process {
    /// Start one worker from `spec`.
    ///
    /// Must be called from within a Tokio runtime: the OS child handle is
    /// moved into a reaper task that waits for exit and kills the child when
    /// the worker is cancelled.
    pub(crate) fn spawn(spec: &ProcessSpec) -> std::result::Result<Self, SpawnError> {
        let mut cmd = spec.command()?;
        let mut child = cmd.spawn().map_err(|e| SpawnError::Start(Arc::new(e)))?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            error: RwLock::new(None),
            cancel: CancellationToken::new(),
        });
        let pid = child.id();

        debug!(
            worker = %shared.id,
            pid = ?pid,
            program = %spec.program().display(),
            "Spawned worker"
        );

        let (exit_tx, exit_rx) = oneshot::channel();
        let cancel = shared.cancel.clone();
        let id = shared.id;
        tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                status = child.wait() => status,
                () = cancel.cancelled() => {
                    debug!(worker = %id, "Killing worker");
                    if let Err(e) = child.start_kill() {
                        warn!(worker = %id, error = %e, "Failed to kill worker");
                    }
                    child.wait().await
                }
            };
            // The reader may already be gone.
            let _ = exit_tx.send(status);
        });

        Ok(Self {
            shared,
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            exit: exit_rx,
            phase: Phase::Reading,
        })
    }

    /// Unique id of this worker, used in log lines.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// OS process id, if the worker had not exited when it was spawned.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The first error recorded for this worker, if any.
    pub fn error(&self) -> Option<Error> {
        self.shared.error()
    }

    /// Handle for background tasks that may stop or cancel this worker.
    pub(crate) fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Detach the stdin pipe together with a handle to report failures.
    /// Returns `None` if the feeder was already taken.
    pub(crate) fn take_feeder(&mut self) -> Option<Feeder> {
        let stdin = self.stdin.take()?;
        Some(Feeder {
            stdin,
            handle: self.handle(),
        })
    }

    /// Record `err` (first writer wins), close stdout and cancel the worker.
    pub(crate) fn stop(&mut self, err: Option<Error>) {
        self.stdout = None;
        self.shared.stop(err);
    }

    /// Stop with `err` and return whichever error ended up recorded.
    fn fail(&mut self, err: Error) -> io::Error {
        self.stop(Some(err.clone()));
        self.shared.error().unwrap_or(err).into()
    }

    fn finish(
        &mut self,
        outcome: std::result::Result<io::Result<ExitStatus>, oneshot::error::RecvError>,
    ) {
        match outcome {
            Ok(Ok(status)) if status.success() => self.stop(None),
            Ok(Ok(status)) => {
                debug!(worker = %self.shared.id, %status, "Worker exited unsuccessfully");
                self.stop(Some(ExitError::new(status).into()));
            }
            Ok(Err(e)) => self.stop(Some(Error::Wait(Arc::new(e)))),
            Err(_) => self.stop(Some(Error::Wait(Arc::new(io::Error::other(
                "worker reaper exited without an exit status",
            ))))),
        }
    }
}

impl AsyncRead for Process {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.shared.error() {
            this.stdout = None;
            return Poll::Ready(Err(err.into()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.phase {
                Phase::Reading => {
                    let Some(stdout) = this.stdout.as_mut() else {
                        this.phase = Phase::Waiting;
                        continue;
                    };
                    let before = buf.filled().len();
                    match ready!(Pin::new(stdout).poll_read(cx, buf)) {
                        Ok(()) if buf.filled().len() > before => return Poll::Ready(Ok(())),
                        Ok(()) => {
                            this.stdout = None;
                            this.phase = Phase::Waiting;
                        }
                        Err(e) => {
                            this.phase = Phase::Done;
                            return Poll::Ready(Err(this.fail(Error::Read(Arc::new(e)))));
                        }
                    }
                }
                Phase::Waiting => {
                    let outcome = ready!(Pin::new(&mut this.exit).poll(cx));
                    this.phase = Phase::Done;
                    this.finish(outcome);
                }
                Phase::Done => {
                    return Poll::Ready(match this.shared.error() {
                        Some(err) => Err(err.into()),
                        None => Ok(()),
                    });
                }
            }
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Cloneable access to a worker's error cell and cancellation token.
#[derive(Debug, Clone)]
pub(crate) struct ProcessHandle {
    shared: Arc<Shared>,
}

impl ProcessHandle {
    pub(crate) fn id(&self) -> Uuid {
        self.shared.id
    }

    pub(crate) fn stop(&self, err: Option<Error>) {
        self.shared.stop(err);
    }

    /// Kill the worker as soon as `trigger` completes, unless the worker
    /// finishes first.
    pub(crate) fn cancel_on<F>(&self, trigger: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.shared.cancel.clone();
        let id = self.shared.id;
        tokio::spawn(async move {
            tokio::select! {
                () = trigger => {
                    debug!(worker = %id, "Worker cancelled by caller");
                    cancel.cancel();
                }
                () = cancel.cancelled() => {}
            }
        });
    }
}

/// The write side of a checked-out worker.
#[derive(Debug)]
pub(crate) struct Feeder {
    stdin: ChildStdin,
    handle: ProcessHandle,
}

impl Feeder {
    /// Pump `input` into the worker's stdin, then close it. Failures stop
    /// the worker; the first recorded error is what its reader observes.
    pub(crate) async fn run<R>(self, mut input: R)
    where
        R: AsyncRead + Unpin,
    {
        let Self { mut stdin, handle } = self;
        let cancel = handle.shared.cancel.clone();

        let copied = tokio::select! {
            res = copy_input(&mut input, &mut stdin) => res,
            () = cancel.cancelled() => Ok(()),
        };
        if let Err(err) = copied {
            warn!(worker = %handle.id(), error = %err, "Failed to feed worker input");
            handle.stop(Some(err));
        }

        if let Err(e) = stdin.shutdown().await {
            if e.kind() != io::ErrorKind::BrokenPipe {
                handle.stop(Some(Error::CloseStdin(Arc::new(e))));
            }
        }
        drop(stdin);
        debug!(worker = %handle.id(), "Closed worker stdin");
    }
}

/// Copy `input` to `stdin` until EOF. A worker that closes its stdin early
/// ends the copy without error: its exit status decides the outcome.
async fn copy_input<R, W>(input: &mut R, stdin: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; INPUT_BUFFER_SIZE];
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Input(Arc::new(e))),
        };
        match stdin.write_all(&buf[..n]).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Worker closed stdin before consuming all input");
                return Ok(());
            }
            Err(e) => return Err(Error::WriteStdin(Arc::new(e))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shared() -> Shared {
        Shared {
            id: Uuid::new_v4(),
            error: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn io_err(msg: &str) -> Arc<io::Error> {
        Arc::new(io::Error::other(msg.to_string()))
    }

    async fn read_all(process: &mut Process) -> (Vec<u8>, io::Result<usize>) {
        let mut out = Vec::new();
        let res = process.read_to_end(&mut out).await;
        (out, res)
    }

    #[test]
    fn first_stop_error_wins() {
        let shared = shared();
        shared.stop(Some(Error::Input(io_err("first"))));
        shared.stop(Some(Error::Read(io_err("second"))));
        shared.stop(None);

        let err = shared.error().unwrap();
        assert!(matches!(err, Error::Input(_)));
        assert!(err.to_string().contains("first"));
        assert!(shared.cancel.is_cancelled());
    }

    #[test]
    fn stop_without_error_keeps_cell_empty() {
        let shared = shared();
        shared.stop(None);
        assert!(shared.error().is_none());
        assert!(shared.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn concurrent_stops_record_one_error() {
        let shared = Arc::new(shared());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move {
                shared.stop(Some(Error::Read(io_err(&format!("stop {i}")))));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let first = shared.error().unwrap().to_string();
        for _ in 0..4 {
            assert_eq!(shared.error().unwrap().to_string(), first);
        }
    }

    #[tokio::test]
    async fn reads_output_of_clean_exit() {
        let mut process = Process::spawn(&ProcessSpec::new("cat")).unwrap();
        let feeder = process.take_feeder().unwrap();
        feeder.run(&b"hello\n"[..]).await;

        let (out, res) = read_all(&mut process).await;
        assert_eq!(res.unwrap(), 6);
        assert_eq!(out, b"hello\n");
        assert!(process.error().is_none());
    }

    #[tokio::test]
    async fn feeder_is_taken_once() {
        let mut process = Process::spawn(&ProcessSpec::new("cat")).unwrap();
        assert!(process.pid().is_some_and(|pid| pid > 0));
        assert!(process.take_feeder().is_some());
        assert!(process.take_feeder().is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_stream_error() {
        let spec = ProcessSpec::new("sh").args(["-c", "exit 3"]);
        let mut process = Process::spawn(&spec).unwrap();
        process.take_feeder().unwrap().run(&b""[..]).await;

        let (out, res) = read_all(&mut process).await;
        assert!(out.is_empty());
        let err = res.unwrap_err();
        assert_eq!(Error::from_io(&err).unwrap().exit_code(), Some(3));

        // Every later read repeats the same error.
        let mut buf = [0u8; 8];
        let again = process.read(&mut buf).await.unwrap_err();
        assert_eq!(Error::from_io(&again).unwrap().exit_code(), Some(3));
    }

    #[tokio::test]
    async fn stored_error_takes_priority_over_clean_eof() {
        let mut process = Process::spawn(&ProcessSpec::new("cat")).unwrap();
        let feeder = process.take_feeder().unwrap();
        process.handle().stop(Some(Error::Input(io_err("upstream"))));
        drop(feeder);

        let (_, res) = read_all(&mut process).await;
        let err = res.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::Input(_))));
    }

    #[tokio::test]
    async fn cancel_on_trigger_kills_worker() {
        let mut process = Process::spawn(&ProcessSpec::new("sleep").arg("10")).unwrap();
        let _feeder = process.take_feeder().unwrap();
        process
            .handle()
            .cancel_on(tokio::time::sleep(Duration::from_millis(50)));

        let (out, res) = tokio::time::timeout(Duration::from_secs(5), read_all(&mut process))
            .await
            .expect("killed worker should finish promptly");
        assert!(out.is_empty());
        let err = res.unwrap_err();
        let err = Error::from_io(&err).unwrap();
        assert!(err.is_signal());
        assert_eq!(err.exit_code(), Some(-1));
    }

    #[tokio::test]
    async fn copy_input_ignores_broken_pipe() {
        struct Closed;
        impl AsyncWrite for Closed {
            fn poll_write(
                self: Pin<&mut Self>,
                _: &mut Context<'_>,
                _: &[u8],
            ) -> Poll<io::Result<usize>> {
                Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
            }
            fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let mut input = &b"some input"[..];
        copy_input(&mut input, &mut Closed).await.unwrap();
    }
}
