use clap::Parser;
use log::{error, info};
use pbalign::aligner::{AlignerCommand, ExternalAligner};
use pbalign::error::{PipelineError, Result};
use pbalign::pipeline::{run_pipeline, PipelineConfig, DEFAULT_MAX_CHUNK_SIZE};
use pbalign::subset_filter::HoleNumberFilter;
use pbalign::supervisor::FilterOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Align reads to a reference with an external aligner, producing a
/// coordinate-sorted, indexed BAM.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Reads to align: FASTA/FASTQ, BAM/SAM (aligned input is realigned), dataset XML or fofn
    #[clap(value_parser)]
    input: PathBuf,

    /// Reference FASTA or reference dataset XML
    #[clap(value_parser)]
    reference: PathBuf,

    /// Output BAM
    #[clap(value_parser)]
    output: PathBuf,

    /// Options passed verbatim to the aligner
    #[clap(long = "algorithmOptions", value_parser, default_value = "", allow_hyphen_values = true)]
    algorithm_options: String,

    /// Hole numbers to align, e.g. `1-1000,30000-30500`, or a file listing such ranges
    #[clap(long = "holeNumbers", value_parser)]
    hole_numbers: Option<String>,

    /// Aligner preset (blasr or minimap2)
    #[clap(long, value_parser, default_value = "blasr")]
    aligner: String,

    /// Custom aligner command template using {reads}, {reference}, {output}, {threads} and {options}
    #[clap(long = "alignerCommand", value_parser)]
    aligner_command: Option<String>,

    /// Total number of threads.
    #[clap(short = 'j', long = "nproc", value_parser, default_value_t = num_cpus::get())]
    nproc: usize,

    /// Number of aligner processes running at once (defaults to --nproc)
    #[clap(long, value_parser)]
    workers: Option<usize>,

    /// Maximum number of reads per aligner invocation
    #[clap(long = "maxChunkSize", value_parser, default_value_t = DEFAULT_MAX_CHUNK_SIZE)]
    max_chunk_size: usize,

    /// Kill an aligner invocation running longer than this many seconds
    #[clap(long, value_parser)]
    timeout: Option<u64>,

    /// Report alignments covering fewer read bases as unmapped
    #[clap(long = "minLength", value_parser, default_value_t = 0)]
    min_length: u64,

    /// Report alignments with a lower mapping quality as unmapped
    #[clap(long = "minMapQV", value_parser, default_value_t = 0)]
    min_mapqv: u8,

    /// Keep secondary and supplementary alignments
    #[clap(long = "keepSecondary", action)]
    keep_secondary: bool,

    /// Report reads absent from the aligner output as unmapped instead of failing
    #[clap(long = "fillUnaligned", action)]
    fill_unaligned: bool,

    /// Directory for temporary files
    #[clap(long = "tmpDir", value_parser)]
    tmp_dir: Option<PathBuf>,

    /// Keep the temporary work directory
    #[clap(long = "keepTmpDir", action)]
    keep_tmp_dir: bool,

    /// Do not build the .bai index
    #[clap(long = "noIndex", action)]
    no_index: bool,

    /// Verbosity level (0 = error, 1 = info, 2 = debug)
    #[clap(short, long, default_value = "0")]
    verbose: u8,
}

fn build_aligner(args: &Args) -> Result<ExternalAligner> {
    let command = match &args.aligner_command {
        Some(template) => AlignerCommand::parse(template)?,
        None => AlignerCommand::preset(&args.aligner)?,
    };
    if args.timeout == Some(0) {
        return Err(PipelineError::Config("timeout must be at least 1 second".into()));
    }
    Ok(ExternalAligner::new(
        command,
        args.timeout.map(Duration::from_secs),
    ))
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    Ok(PipelineConfig {
        input: args.input.clone(),
        reference: args.reference.clone(),
        output: args.output.clone(),
        algorithm_options: args.algorithm_options.clone(),
        hole_numbers: HoleNumberFilter::from_arg(args.hole_numbers.as_deref())?,
        num_threads: args.nproc,
        workers: args.workers.unwrap_or(args.nproc),
        max_chunk_size: args.max_chunk_size,
        filter: FilterOptions {
            min_aligned_length: args.min_length,
            min_mapq: args.min_mapqv,
            keep_secondary: args.keep_secondary,
            fill_unaligned: args.fill_unaligned,
        },
        tmp_dir: args.tmp_dir.clone(),
        keep_tmp_dir: args.keep_tmp_dir,
        index: !args.no_index,
        command_line: std::env::args().collect::<Vec<_>>().join(" "),
    })
}

fn run(args: &Args) -> Result<()> {
    let aligner = build_aligner(args)?;
    let config = build_config(args)?;
    let summary = run_pipeline(&config, &aligner)?;
    info!(
        "Aligned {} reads in {} chunks: {} mapped, {} unmapped",
        summary.reads, summary.chunks, summary.stats.mapped, summary.stats.unmapped
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} failed: {}", e.stage(), e);
            ExitCode::FAILURE
        }
    }
}
