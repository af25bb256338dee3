//! `execpool run` -- pipe newline-separated records through pooled workers.
//!
//! Each record is fed to its own worker. Outputs are written to stdout in
//! input order, whatever order the workers finish in.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use execpool::{Error, Output, Pool};

/// Options for one `run` invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Maximum records in flight at once.
    pub jobs: usize,
    /// Kill a worker that runs longer than this.
    pub timeout: Option<Duration>,
}

/// Output of one record, with the error that ended it if any.
#[derive(Debug)]
pub struct RecordOutcome {
    pub index: usize,
    pub output: Vec<u8>,
    pub error: Option<io::Error>,
}

/// Split `input` into newline-terminated records. The last record keeps no
/// newline if the input did not end with one.
pub fn split_records(input: &[u8]) -> Vec<Vec<u8>> {
    input
        .split_inclusive(|&b| b == b'\n')
        .map(<[u8]>::to_vec)
        .collect()
}

/// Feed every record to a worker, at most `opts.jobs` at a time, and return
/// the outcomes in input order.
///
/// Cancelling `cancel` kills every worker still running and stops
/// dispatching further records.
pub async fn process_records(
    pool: &Pool,
    records: Vec<Vec<u8>>,
    opts: RunOptions,
    cancel: &CancellationToken,
) -> Vec<RecordOutcome> {
    let limit = Arc::new(Semaphore::new(opts.jobs.max(1)));
    let mut tasks = Vec::with_capacity(records.len());

    for (index, record) in records.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let token = cancel.child_token();
        let mut output = pool
            .exec_with_cancel(token.clone(), io::Cursor::new(record))
            .await;
        debug!(index, worker = ?output.id(), "Dispatched record");

        tasks.push(tokio::spawn(async move {
            let (buf, res) = read_record(&mut output, &token, opts.timeout).await;
            drop(permit);
            RecordOutcome {
                index,
                output: buf,
                error: res.err(),
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.into_iter().enumerate() {
        outcomes.push(task.await.unwrap_or_else(|e| RecordOutcome {
            index,
            output: Vec::new(),
            error: Some(io::Error::other(e)),
        }));
    }
    outcomes
}

/// Read one record's output to the end, killing its worker through `token`
/// once `timeout` elapses.
async fn read_record(
    output: &mut Output,
    token: &CancellationToken,
    timeout: Option<Duration>,
) -> (Vec<u8>, io::Result<usize>) {
    let worker = output.id();
    let mut buf = Vec::new();
    let res = {
        let read = output.read_to_end(&mut buf);
        tokio::pin!(read);
        match timeout {
            Some(timeout) => tokio::select! {
                res = &mut read => res,
                () = tokio::time::sleep(timeout) => {
                    debug!(worker = ?worker, "Record timed out, killing worker");
                    token.cancel();
                    read.await
                }
            },
            None => read.await,
        }
    };
    (buf, res)
}

/// Execute the `run` subcommand against stdin/stdout.
pub async fn run(pool: &Pool, opts: RunOptions) -> Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("Failed to read stdin")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, killing running workers");
            interrupt.cancel();
        }
    });

    let records = split_records(&input);
    let total = records.len();
    let outcomes = process_records(pool, records, opts, &cancel).await;
    let dispatched = outcomes.len();

    let mut stdout = tokio::io::stdout();
    let mut failed = 0usize;
    for outcome in outcomes {
        stdout
            .write_all(&outcome.output)
            .await
            .context("Failed to write stdout")?;
        if let Some(err) = outcome.error {
            failed += 1;
            match Error::from_io(&err) {
                Some(cause) => error!(record = outcome.index, error = %cause, "Record failed"),
                None => error!(record = outcome.index, error = %err, "Record failed"),
            }
        }
    }
    stdout.flush().await.context("Failed to flush stdout")?;

    if dispatched < total {
        anyhow::bail!("interrupted after {dispatched} of {total} records");
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {total} records failed");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use execpool::ProcessSpec;

    #[test]
    fn split_keeps_newlines_and_trailing_record() {
        let records = split_records(b"one\ntwo\nthree");
        assert_eq!(records, vec![b"one\n".to_vec(), b"two\n".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn split_empty_input_has_no_records() {
        assert!(split_records(b"").is_empty());
    }

    #[tokio::test]
    async fn outcomes_follow_input_order() {
        let pool = Pool::new(ProcessSpec::new("cat"), 2).unwrap();
        let records = split_records(b"a\nb\nc\nd\n");

        let outcomes = process_records(
            &pool,
            records,
            RunOptions {
                jobs: 3,
                timeout: None,
            },
            &CancellationToken::new(),
        )
        .await;

        let joined: Vec<u8> = outcomes.iter().flat_map(|o| o.output.clone()).collect();
        assert_eq!(joined, b"a\nb\nc\nd\n");
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert!(outcomes.iter().enumerate().all(|(i, o)| o.index == i));
    }

    #[tokio::test]
    async fn failing_records_carry_exit_errors() {
        let pool = Pool::new(ProcessSpec::new("grep").arg("keep"), 2).unwrap();
        let records = split_records(b"keep me\ndrop me\n");

        let outcomes = process_records(
            &pool,
            records,
            RunOptions {
                jobs: 2,
                timeout: None,
            },
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcomes[0].output, b"keep me\n");
        assert!(outcomes[0].error.is_none());
        // grep exits 1 when nothing matched.
        let err = outcomes[1].error.as_ref().unwrap();
        assert_eq!(Error::from_io(err).unwrap().exit_code(), Some(1));
    }

    #[tokio::test]
    async fn timeout_kills_slow_records() {
        let pool = Pool::new(ProcessSpec::new("sleep").arg("10"), 1).unwrap();

        let outcomes = process_records(
            &pool,
            split_records(b"x\n"),
            RunOptions {
                jobs: 1,
                timeout: Some(Duration::from_millis(100)),
            },
            &CancellationToken::new(),
        )
        .await;

        let err = outcomes[0].error.as_ref().unwrap();
        assert!(Error::from_io(err).unwrap().is_signal());
    }

    #[tokio::test]
    async fn fast_record_does_not_wait_for_timeout() {
        let pool = Pool::new(ProcessSpec::new("cat"), 1).unwrap();
        let token = CancellationToken::new();
        let mut output = pool
            .exec_with_cancel(token.clone(), io::Cursor::new(b"quick\n".to_vec()))
            .await;

        let (buf, res) = tokio::time::timeout(
            Duration::from_secs(5),
            read_record(&mut output, &token, Some(Duration::from_secs(3600))),
        )
        .await
        .expect("record should finish without waiting out its timeout");
        res.unwrap();
        assert_eq!(buf, b"quick\n");
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let pool = Pool::new(ProcessSpec::new("cat"), 1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = process_records(
            &pool,
            split_records(b"a\nb\n"),
            RunOptions {
                jobs: 1,
                timeout: None,
            },
            &cancel,
        )
        .await;
        assert!(outcomes.is_empty());
    }
}
