//! Pipeline coordinator: resolve, plan, align in parallel, merge and publish.

use crate::aligner::{AlignmentJob, Aligner};
use crate::chunk::{plan_chunks, Chunk, ChunkPlan};
use crate::dataset::{resolve_reads, resolve_reference};
use crate::error::{PipelineError, Result};
use crate::merge::MergedRecords;
use crate::realign::detect_input;
use crate::reference::ReferenceSet;
use crate::sorted_run::SortedRun;
use crate::stats::AlignmentStats;
use crate::subset_filter::HoleNumberFilter;
use crate::supervisor::{align_chunk, CancelToken, FilterOptions};
use crate::writer::{build_header, write_sorted_output, OutputOptions, WriteSummary};
use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub reference: PathBuf,
    pub output: PathBuf,
    /// Forwarded verbatim to the aligner
    pub algorithm_options: String,
    pub hole_numbers: HoleNumberFilter,
    /// Total threads, shared among the running aligner processes
    pub num_threads: usize,
    /// Aligner processes running at once
    pub workers: usize,
    pub max_chunk_size: usize,
    pub filter: FilterOptions,
    /// Parent of the temporary work directory (system default when unset)
    pub tmp_dir: Option<PathBuf>,
    pub keep_tmp_dir: bool,
    pub index: bool,
    /// Recorded in the `@PG` header line
    pub command_line: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            input: PathBuf::new(),
            reference: PathBuf::new(),
            output: PathBuf::new(),
            algorithm_options: String::new(),
            hole_numbers: HoleNumberFilter::default(),
            num_threads: num_cpus::get(),
            workers: num_cpus::get(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            filter: FilterOptions::default(),
            tmp_dir: None,
            keep_tmp_dir: false,
            index: true,
            command_line: String::new(),
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(PipelineError::Config("number of threads must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("number of workers must be at least 1".into()));
        }
        if self.max_chunk_size == 0 {
            return Err(PipelineError::Config("maximum chunk size must be at least 1".into()));
        }
        Ok(())
    }
}

/// What a successful run produced
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub realigned: bool,
    pub reads: usize,
    pub chunks: usize,
    pub demoted: usize,
    pub filled: usize,
    pub written: WriteSummary,
    pub stats: AlignmentStats,
}

struct ChunkOutcome {
    run: SortedRun,
    demoted: usize,
    filled: usize,
}

fn process_chunk(
    aligner: &dyn Aligner,
    chunk: &Chunk,
    reference: &ReferenceSet,
    config: &PipelineConfig,
    work_dir: &Path,
    threads: usize,
    cancel: &CancelToken,
) -> Result<ChunkOutcome> {
    let start_time = Instant::now();
    let job = AlignmentJob {
        chunk,
        reference,
        options: &config.algorithm_options,
        work_dir,
        threads,
    };
    let (records, report) = align_chunk(aligner, &job, &config.filter, cancel)?;

    let run_path = work_dir.join(format!("chunk_{:04}.run", chunk.id));
    let run = SortedRun::write(&run_path, &records).map_err(|e| {
        PipelineError::chunk(&chunk.context(), format!("failed to spill sorted run: {}", e))
    })?;
    debug!(
        "[pbalign] {:.3}s {} aligned ({} records)",
        start_time.elapsed().as_secs_f64(),
        chunk.context(),
        run.len()
    );
    Ok(ChunkOutcome {
        run,
        demoted: report.demoted,
        filled: report.filled,
    })
}

/// Run the whole pipeline with the given aligner.
///
/// The output (and its index) appear at `config.output` only if every chunk
/// aligned and the merged stream was written completely.
pub fn run_pipeline(config: &PipelineConfig, aligner: &dyn Aligner) -> Result<PipelineSummary> {
    let start_time = Instant::now();
    config.validate()?;

    let input = detect_input(&config.input)?;
    let reference = resolve_reference(&config.reference)?;
    let read_set = resolve_reads(&input, &config.input, &config.hole_numbers)?;
    let total_reads = read_set.len();
    let (reads, read_groups) = read_set.into_parts();
    info!(
        "[pbalign] {:.3}s Resolved {} reads ({} mode) and {} reference sequences ({} bp)",
        start_time.elapsed().as_secs_f64(),
        total_reads,
        if input.is_realignment() { "realignment" } else { "fresh" },
        reference.len(),
        reference.total_length()
    );

    let chunks = plan_chunks(
        reads,
        &ChunkPlan {
            workers: config.workers,
            max_chunk_size: config.max_chunk_size,
        },
    )?;
    let workers = config.workers.min(chunks.len()).max(1);
    let threads_per_worker = (config.num_threads / workers).max(1);

    let mut tmp_builder = tempfile::Builder::new();
    tmp_builder
        .prefix("pbalign-")
        .disable_cleanup(config.keep_tmp_dir);
    let work_dir = match &config.tmp_dir {
        Some(dir) => dir
            .canonicalize()
            .and_then(|dir| tmp_builder.tempdir_in(dir)),
        None => tmp_builder.tempdir(),
    }
    .map_err(|e| {
        PipelineError::write(
            config.tmp_dir.as_deref().unwrap_or(Path::new("<system temp>")),
            format!("cannot create work directory: {}", e),
        )
    })?;
    if config.keep_tmp_dir {
        info!("[pbalign] Keeping work directory '{}'", work_dir.path().display());
    }

    info!(
        "[pbalign] {:.3}s Aligning {} chunks with {} ({} workers, {} threads each)",
        start_time.elapsed().as_secs_f64(),
        chunks.len(),
        aligner.name(),
        workers,
        threads_per_worker
    );

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| PipelineError::Config(format!("cannot start worker pool: {}", e)))?;
    let cancel = CancelToken::new();
    let first_error: Mutex<Option<PipelineError>> = Mutex::new(None);

    let outcomes: Vec<Option<ChunkOutcome>> = pool.install(|| {
        chunks
            .par_iter()
            .map(|chunk| {
                if cancel.is_cancelled() {
                    return None;
                }
                match process_chunk(
                    aligner,
                    chunk,
                    &reference,
                    config,
                    work_dir.path(),
                    threads_per_worker,
                    &cancel,
                ) {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        if !e.is_cancellation() {
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() {
                                warn!("{}; cancelling remaining chunks", e);
                                *slot = Some(e);
                            }
                            cancel.cancel();
                        }
                        None
                    }
                }
            })
            .collect()
    });
    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }

    let outcomes: Vec<ChunkOutcome> = outcomes.into_iter().flatten().collect();
    let demoted = outcomes.iter().map(|o| o.demoted).sum();
    let filled = outcomes.iter().map(|o| o.filled).sum();
    if filled > 0 {
        warn!("{} reads missing from the aligner output were reported unmapped", filled);
    }
    info!(
        "[pbalign] {:.3}s Aligned all chunks, merging {} sorted runs",
        start_time.elapsed().as_secs_f64(),
        outcomes.len()
    );

    let readers = outcomes
        .iter()
        .map(|o| o.run.reader())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| PipelineError::write(&config.output, e))?;
    let merged = MergedRecords::new(readers).map_err(|e| PipelineError::write(&config.output, e))?;
    let header = build_header(&reference, &read_groups, &config.command_line);
    // counted from the stream being written; the writer rejects out-of-order records
    let mut stats =
        AlignmentStats::for_references(reference.sequences().iter().map(|s| s.name.clone()));
    let written = write_sorted_output(
        merged.inspect(|record| {
            if let Ok(record) = record {
                stats.add(record);
            }
        }),
        &config.output,
        &header,
        &OutputOptions {
            index: config.index,
            threads: config.num_threads,
        },
    )?;
    info!(
        "[pbalign] {:.3}s Wrote {} records ({} mapped, {} unmapped) to '{}'",
        start_time.elapsed().as_secs_f64(),
        written.records,
        written.mapped,
        written.unmapped,
        config.output.display()
    );

    stats.log_report(&config.output);
    if stats.primary != total_reads as u64 {
        warn!(
            "Output holds {} primary records for {} input reads",
            stats.primary, total_reads
        );
    }

    Ok(PipelineSummary {
        realigned: input.is_realignment(),
        reads: total_reads,
        chunks: chunks.len(),
        demoted,
        filled,
        written,
        stats,
    })
}
