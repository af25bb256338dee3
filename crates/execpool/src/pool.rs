//! Pool of pre-spawned worker processes.
//!
//! The [`Pool`] keeps `size` identical workers waiting on stdin. A checkout
//! hands one worker to the caller and immediately starts a replacement in the
//! background, so callers never pay process start-up latency. Ready workers
//! are counted by a Tokio semaphore; closing the semaphore is the one-way
//! transition into the failed state, performed together with recording the
//! pool error under the same lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::output::{ErrorStream, Output};
use crate::process::Process;
use crate::spec::ProcessSpec;

/// A fixed-size pool of ready worker processes.
///
/// Cloning is cheap and every clone checks out from the same workers.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    spec: ProcessSpec,
    size: usize,
    /// One permit per queued worker. Closed once the pool has failed.
    ready: Semaphore,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Process>,
    /// Set once, in the same critical section that closes `ready`.
    error: Option<Error>,
}

impl Pool {
    /// Create a pool with `size` workers started from `spec`.
    ///
    /// Fails without creating a pool if `size` is zero, if the program
    /// cannot be found on `PATH`, or if any initial worker fails to start.
    /// Must be called from within a Tokio runtime.
    pub fn new(spec: ProcessSpec, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let program = spec.resolve()?;

        let mut queue = VecDeque::with_capacity(size);
        for index in 0..size {
            let process = Process::spawn(&spec).map_err(|source| Error::Spawn { index, source })?;
            queue.push_back(process);
        }

        info!(program = %program.display(), size, "Worker pool created");

        Ok(Self {
            inner: Arc::new(Inner {
                spec,
                size,
                ready: Semaphore::new(size),
                state: Mutex::new(State { queue, error: None }),
            }),
        })
    }

    /// Check out a worker and feed it `input`.
    ///
    /// Waits only until a ready worker is available. The replacement worker
    /// and the input copy run as background tasks; the returned stream can be
    /// read immediately. Once the pool has failed, every call returns an
    /// [`Output::Failed`] stream carrying the pool error.
    pub async fn exec<R>(&self, input: R) -> Output
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut process = match self.checkout().await {
            Ok(process) => process,
            Err(err) => return Output::Failed(ErrorStream::new(err)),
        };
        debug!(worker = %process.id(), pid = ?process.pid(), "Checked out worker");

        self.replenish();

        if let Some(feeder) = process.take_feeder() {
            tokio::spawn(feeder.run(input));
        }

        Output::Process(process)
    }

    /// Like [`exec`](Self::exec), but kills the worker when `cancel` fires
    /// before the worker finishes. A killed worker reports a signal exit.
    pub async fn exec_with_cancel<R>(&self, cancel: CancellationToken, input: R) -> Output
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let output = self.exec(input).await;
        if let Output::Process(process) = &output {
            process
                .handle()
                .cancel_on(async move { cancel.cancelled().await });
        }
        output
    }

    /// Like [`exec`](Self::exec), but kills the worker if it has not
    /// finished within `timeout`.
    pub async fn exec_with_timeout<R>(&self, timeout: Duration, input: R) -> Output
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let output = self.exec(input).await;
        if let Output::Process(process) = &output {
            process.handle().cancel_on(tokio::time::sleep(timeout));
        }
        output
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of workers currently waiting to be checked out.
    pub fn ready(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// The error that failed the pool, if it has failed.
    pub fn error(&self) -> Option<Error> {
        self.inner.lock_state().error.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.ready.is_closed()
    }

    async fn checkout(&self) -> Result<Process> {
        match self.inner.ready.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(self.error().unwrap_or(Error::PoolClosed)),
        }
        let mut state = self.inner.lock_state();
        // The queue is drained when the pool fails, so a permit taken just
        // before that can find it empty.
        state
            .queue
            .pop_front()
            .ok_or_else(|| state.error.clone().unwrap_or(Error::PoolClosed))
    }

    /// Start one replacement worker in the background.
    fn replenish(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            match Process::spawn(&pool.inner.spec) {
                Ok(process) => pool.put(process),
                Err(source) => pool.fail(Error::Replenish(source)),
            }
        });
    }

    fn put(&self, process: Process) {
        let mut state = self.inner.lock_state();
        if state.error.is_some() {
            debug!(worker = %process.id(), "Pool has failed, discarding replacement worker");
            return;
        }
        if state.queue.len() >= self.inner.size {
            warn!(
                worker = %process.id(),
                size = self.inner.size,
                "Pool is full, discarding replacement worker"
            );
            return;
        }
        state.queue.push_back(process);
        self.inner.ready.add_permits(1);
    }

    /// Record `err` and close the pool. Only the first failure is kept.
    fn fail(&self, err: Error) {
        let idle = {
            let mut state = self.inner.lock_state();
            if state.error.is_some() {
                debug!(error = %err, "Pool already failed, dropping later replenishment error");
                return;
            }
            error!(error = %err, "Worker pool failed permanently");
            state.error = Some(err);
            self.inner.ready.close();
            std::mem::take(&mut state.queue)
        };
        // Idle workers can no longer be checked out; dropping kills them.
        drop(idle);
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
