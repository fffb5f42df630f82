//! Per-chunk supervision: running the aligner process under a timeout and a
//! shared cancellation flag, then checking that what came back accounts for
//! every read of the chunk exactly once.

use crate::aligner::{AlignmentJob, Aligner};
use crate::alignment_record::{coordinate_cmp, AlignmentRecord};
use crate::error::{PipelineError, Result};
use log::debug;
use rustc_hash::FxHashMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Run-wide cancellation flag shared by all workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a supervised process did not run to completion
#[derive(Debug)]
pub enum ProcessFailure {
    Spawn(io::Error),
    Wait(io::Error),
    TimedOut,
    Cancelled,
}

/// Spawn `command` in its own process group and wait for it, terminating the
/// whole group on timeout or cancellation (SIGTERM, then SIGKILL after a grace
/// period).
pub fn run_supervised(
    mut command: Command,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> std::result::Result<ExitStatus, ProcessFailure> {
    command.process_group(0);
    let mut child = command.spawn().map_err(ProcessFailure::Spawn)?;
    let start = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                terminate(&mut child);
                return Err(ProcessFailure::Wait(e));
            }
        }
        if cancel.is_cancelled() {
            terminate(&mut child);
            return Err(ProcessFailure::Cancelled);
        }
        if timeout.is_some_and(|t| start.elapsed() >= t) {
            terminate(&mut child);
            return Err(ProcessFailure::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    let deadline = Instant::now() + TERMINATION_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Post-alignment record filtering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOptions {
    /// Primary alignments covering fewer read bases are reported unmapped
    pub min_aligned_length: u64,
    /// Primary alignments with a lower MAPQ are reported unmapped
    pub min_mapq: u8,
    /// Keep secondary and supplementary records instead of dropping them
    pub keep_secondary: bool,
    /// Report reads missing from the aligner output as unmapped instead of failing
    pub fill_unaligned: bool,
}

/// Tallies of what the checks did to a chunk's records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub mapped: usize,
    pub unmapped: usize,
    pub demoted: usize,
    pub dropped_secondary: usize,
    pub filled: usize,
}

/// Align one chunk and return its records locally sorted in output order.
///
/// Every read of the chunk ends up with exactly one primary record; an aligner
/// output that reports an unknown read, reports a read twice, or omits one
/// (unless `fill_unaligned` is set) fails the chunk.
pub fn align_chunk(
    aligner: &dyn Aligner,
    job: &AlignmentJob,
    filter: &FilterOptions,
    cancel: &CancelToken,
) -> Result<(Vec<AlignmentRecord>, ChunkReport)> {
    let chunk = job.chunk;
    let context = chunk.context();
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled { chunk: context });
    }

    let index: FxHashMap<&str, usize> = chunk
        .reads
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();
    let mut seen = vec![false; chunk.reads.len()];
    let mut records = Vec::with_capacity(chunk.reads.len());
    let mut report = ChunkReport::default();

    for record in aligner.align(job, cancel)? {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { chunk: context });
        }
        let mut record = record?;
        let Some(&i) = index.get(record.name.as_str()) else {
            return Err(PipelineError::chunk(
                &context,
                format!("aligner reported unknown read '{}'", record.name),
            ));
        };
        let read = &chunk.reads[i];
        record.hole_number = read.hole_number;
        if record.read_group.is_none() {
            record.read_group = read.read_group.clone();
        }
        record.restore_sequence(read);

        if !record.is_primary() {
            if filter.keep_secondary {
                records.push(record);
            } else {
                report.dropped_secondary += 1;
            }
            continue;
        }

        if seen[i] {
            return Err(PipelineError::chunk(
                &context,
                format!("aligner reported read '{}' more than once", record.name),
            ));
        }
        seen[i] = true;

        if record.is_mapped()
            && (record.aligned_query_length() < filter.min_aligned_length
                || record.mapq < filter.min_mapq)
        {
            record.demote_to_unmapped();
            report.demoted += 1;
        }
        if record.is_mapped() {
            report.mapped += 1;
        } else {
            report.unmapped += 1;
        }
        records.push(record);
    }

    let missing: Vec<usize> = (0..seen.len()).filter(|&i| !seen[i]).collect();
    if let Some(&first) = missing.first() {
        if !filter.fill_unaligned {
            return Err(PipelineError::chunk(
                &context,
                format!(
                    "aligner returned {} of {} reads (first missing: '{}')",
                    chunk.reads.len() - missing.len(),
                    chunk.reads.len(),
                    chunk.reads[first].name
                ),
            ));
        }
        for &i in &missing {
            records.push(AlignmentRecord::unmapped(&chunk.reads[i]));
        }
        report.filled = missing.len();
        report.unmapped += missing.len();
    }

    records.sort_by(coordinate_cmp);
    debug!(
        "{}: {} mapped, {} unmapped, {} demoted, {} filled, {} secondary dropped",
        context,
        report.mapped,
        report.unmapped,
        report.demoted,
        report.filled,
        report.dropped_secondary
    );
    Ok((records, report))
}
