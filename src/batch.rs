//! Batch processing over a bounded worker pool.
//!
//! One bad file must not sink the batch: per-file errors are captured in
//! that file's outcome and the remaining files keep going. The one
//! exception is an invariant violation, which indicates a defect rather
//! than bad input and aborts the whole run.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;

use crate::engine::{CutReport, Engine};
use crate::error::{Error, Result};

/// Upper bound on how long one file is allowed to take; the join deadline
/// for the whole batch is this times the file count.
const PER_FILE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Cap on worker threads; the pool never exceeds the file count or the
    /// available parallelism regardless.
    pub max_threads: Option<usize>,
}

/// Outcome for one file of the batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub path: PathBuf,
    pub report: Result<CutReport>,
}

fn pool_size(files: usize, options: &BatchOptions) -> usize {
    let available = thread::available_parallelism().map_or(1, |n| n.get());
    let mut size = available.min(files).max(1);
    if let Some(cap) = options.max_threads {
        size = size.min(cap.max(1));
    }
    size
}

/// Process `files` concurrently. Outcomes are returned in completion
/// order. An invariant violation in any file aborts with that error.
pub fn run(
    engine: Arc<Engine>,
    files: Vec<PathBuf>,
    output_dir: Option<PathBuf>,
    options: &BatchOptions,
) -> Result<Vec<BatchOutcome>> {
    if files.is_empty() {
        return Ok(Vec::new());
    }
    let total = files.len();
    let threads = pool_size(total, options);
    log::debug!("processing {total} files on {threads} threads");

    let (job_tx, job_rx) = channel::unbounded::<PathBuf>();
    let (outcome_tx, outcome_rx) = channel::unbounded::<BatchOutcome>();
    for file in files {
        // Unbounded channel with all senders alive; send cannot fail here.
        let _ = job_tx.send(file);
    }
    drop(job_tx);

    for _ in 0..threads {
        let jobs = job_rx.clone();
        let outcomes = outcome_tx.clone();
        let engine = Arc::clone(&engine);
        let output_dir = output_dir.clone();
        thread::spawn(move || {
            for path in jobs.iter() {
                let report = engine.process_file(&path, output_dir.as_deref());
                if let Err(err) = &report {
                    log::error!("{}: {err}", path.display());
                }
                if outcomes.send(BatchOutcome { path, report }).is_err() {
                    // Collector gave up waiting.
                    return;
                }
            }
        });
    }
    drop(outcome_tx);

    let deadline = Instant::now() + PER_FILE_TIMEOUT * total as u32;
    let mut collected = Vec::with_capacity(total);
    while collected.len() < total {
        match outcome_rx.recv_deadline(deadline) {
            Ok(outcome) => collected.push(outcome),
            Err(channel::RecvTimeoutError::Timeout) => {
                log::error!(
                    "batch timed out with {} of {total} files finished",
                    collected.len()
                );
                break;
            }
            Err(channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(i) = collected
        .iter()
        .position(|o| matches!(o.report, Err(Error::Invariant(_))))
    {
        if let Err(err) = collected.swap_remove(i).report {
            return Err(err);
        }
    }
    Ok(collected)
}
