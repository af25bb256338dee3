//! `execpool bench` -- compare pooled checkouts with spawning per call.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use execpool::{Pool, ProcessSpec};

/// Timings of a benchmark run.
#[derive(Debug, Clone, Copy)]
pub struct BenchReport {
    pub iterations: u32,
    pub pooled: Duration,
    pub fresh: Duration,
}

impl BenchReport {
    pub fn pooled_mean(&self) -> Duration {
        self.pooled / self.iterations.max(1)
    }

    pub fn fresh_mean(&self) -> Duration {
        self.fresh / self.iterations.max(1)
    }
}

/// Run `input` through `iterations` pooled checkouts, then through
/// `iterations` freshly spawned processes, checking that every run produces
/// the same output.
pub async fn bench(
    pool: &Pool,
    spec: &ProcessSpec,
    input: &[u8],
    iterations: u32,
) -> Result<BenchReport> {
    let mut expected: Option<Vec<u8>> = None;

    let start = Instant::now();
    for i in 0..iterations {
        let mut output = pool.exec(std::io::Cursor::new(input.to_vec())).await;
        let mut buf = Vec::new();
        output
            .read_to_end(&mut buf)
            .await
            .with_context(|| format!("Pooled run {i} failed"))?;
        check_output(&mut expected, buf, "pooled", i)?;
    }
    let pooled = start.elapsed();

    let start = Instant::now();
    for i in 0..iterations {
        let buf = run_fresh(spec, input)
            .await
            .with_context(|| format!("Fresh run {i} failed"))?;
        check_output(&mut expected, buf, "fresh", i)?;
    }
    let fresh = start.elapsed();

    info!(iterations, ?pooled, ?fresh, "Benchmark finished");

    Ok(BenchReport {
        iterations,
        pooled,
        fresh,
    })
}

fn check_output(expected: &mut Option<Vec<u8>>, actual: Vec<u8>, mode: &str, i: u32) -> Result<()> {
    match expected {
        Some(want) => ensure!(
            *want == actual,
            "{mode} run {i} produced different output: {:?}",
            String::from_utf8_lossy(&actual)
        ),
        None => *expected = Some(actual),
    }
    Ok(())
}

/// Spawn one process from `spec`, feed it `input` and collect its stdout.
async fn run_fresh(spec: &ProcessSpec, input: &[u8]) -> Result<Vec<u8>> {
    let mut cmd = spec.command()?;
    let mut child = cmd.spawn().context("Failed to spawn process")?;

    // Written concurrently with the stdout read so a worker echoing more
    // than a pipe buffer of input cannot deadlock against us.
    let mut stdin = child.stdin.take().context("Failed to capture stdin")?;
    let input = input.to_vec();
    let writer = tokio::spawn(async move {
        match stdin.write_all(&input).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
            _ => Ok(()),
        }
    });

    let output = child
        .wait_with_output()
        .await
        .context("Failed to wait for process")?;
    writer
        .await
        .context("Stdin writer task failed")?
        .context("Failed to write stdin")?;
    ensure!(output.status.success(), "process exited with {}", output.status);
    Ok(output.stdout)
}

/// Print a report to stdout.
#[allow(clippy::print_stdout)]
pub fn print_report(report: &BenchReport) {
    println!("iterations: {}", report.iterations);
    println!(
        "pooled:     {:?} total, {:?} per call",
        report.pooled,
        report.pooled_mean()
    );
    println!(
        "fresh:      {:?} total, {:?} per call",
        report.fresh,
        report.fresh_mean()
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bench_compares_identical_outputs() {
        let spec = ProcessSpec::new("grep").arg("none");
        let pool = Pool::new(spec.clone(), 4).unwrap();

        let report = bench(&pool, &spec, b"this makes sense\nthis is nonesense", 5)
            .await
            .unwrap();
        assert_eq!(report.iterations, 5);
        assert!(report.pooled > Duration::ZERO);
        assert!(report.fresh > Duration::ZERO);
    }

    #[tokio::test]
    async fn bench_reports_failing_program() {
        let spec = ProcessSpec::new("sh").args(["-c", "exit 4"]);
        let pool = Pool::new(spec.clone(), 1).unwrap();

        let err = bench(&pool, &spec, b"", 1).await.unwrap_err();
        assert!(err.to_string().contains("Pooled run 0 failed"));
    }

    #[tokio::test]
    async fn fresh_run_streams_large_input() {
        let input = vec![b'x'; 1024 * 1024];
        let out = tokio::time::timeout(
            Duration::from_secs(10),
            run_fresh(&ProcessSpec::new("cat"), &input),
        )
        .await
        .expect("fresh run should not block on a full pipe")
        .unwrap();
        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn means_divide_totals() {
        let report = BenchReport {
            iterations: 4,
            pooled: Duration::from_millis(8),
            fresh: Duration::from_millis(40),
        };
        assert_eq!(report.pooled_mean(), Duration::from_millis(2));
        assert_eq!(report.fresh_mean(), Duration::from_millis(10));
    }
}
