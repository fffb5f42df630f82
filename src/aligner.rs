//! The external aligner seam.
//!
//! Orchestration only talks to the `Aligner` trait; `ExternalAligner` runs a
//! real mapper (blasr, minimap2 or any command template) as a child process.

use crate::alignment_record::AlignmentRecord;
use crate::bam_input::AlignmentRecords;
use crate::chunk::Chunk;
use crate::error::{ChunkContext, PipelineError, Result};
use crate::reference::ReferenceSet;
use crate::supervisor::{run_supervised, CancelToken, ProcessFailure};
use log::debug;
use std::fs::File;
use std::io::{BufWriter, Read as IoRead, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Records produced for one chunk, consumed once
pub type AlignmentStream = Box<dyn Iterator<Item = Result<AlignmentRecord>>>;

/// Everything an aligner needs to align one chunk
pub struct AlignmentJob<'a> {
    pub chunk: &'a Chunk,
    pub reference: &'a ReferenceSet,
    /// Passed through to the mapper untouched
    pub options: &'a str,
    /// Scratch directory of the run; file names carry the chunk id
    pub work_dir: &'a Path,
    pub threads: usize,
}

pub trait Aligner: Sync {
    fn name(&self) -> &str;

    fn align(&self, job: &AlignmentJob, cancel: &CancelToken) -> Result<AlignmentStream>;
}

pub const BLASR_TEMPLATE: &str =
    "blasr {reads} {reference} --sam --out {output} --nproc {threads} {options}";
pub const MINIMAP2_TEMPLATE: &str = "minimap2 -a -t {threads} {options} {reference} {reads}";

/// Command line template of an external aligner.
///
/// Placeholders: `{reads}`, `{reference}`, `{output}`, `{threads}` and
/// `{options}`. A template without `{output}` is expected to write SAM to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignerCommand {
    program: String,
    args: Vec<String>,
}

impl AlignerCommand {
    pub fn parse(template: &str) -> Result<Self> {
        let mut tokens = split_options(template)?.into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| PipelineError::Config("empty aligner command".to_string()))?;
        let args: Vec<String> = tokens.collect();
        for required in ["{reads}", "{reference}"] {
            if !args.iter().any(|a| a.contains(required)) {
                return Err(PipelineError::Config(format!(
                    "aligner command '{}' lacks the {} placeholder",
                    template, required
                )));
            }
        }
        Ok(AlignerCommand { program, args })
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "blasr" => Self::parse(BLASR_TEMPLATE),
            "minimap2" => Self::parse(MINIMAP2_TEMPLATE),
            _ => Err(PipelineError::Config(format!(
                "unknown aligner '{}' (expected blasr or minimap2)",
                name
            ))),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the aligner writes its alignments to stdout
    pub fn writes_stdout(&self) -> bool {
        !self.args.iter().any(|a| a.contains("{output}"))
    }

    /// Expand the template into an argument vector
    pub fn arguments(
        &self,
        reads: &Path,
        reference: &Path,
        output: &Path,
        threads: usize,
        options: &str,
    ) -> Result<Vec<String>> {
        let option_args = split_options(options)?;
        let mut argv = Vec::with_capacity(self.args.len() + option_args.len());
        for arg in &self.args {
            if arg == "{options}" {
                argv.extend(option_args.iter().cloned());
                continue;
            }
            argv.push(
                arg.replace("{reads}", &reads.to_string_lossy())
                    .replace("{reference}", &reference.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{threads}", &threads.to_string()),
            );
        }
        Ok(argv)
    }
}

/// Split an option string into arguments the way a POSIX shell would for plain
/// words, single and double quotes and backslash escapes. Nothing is expanded.
pub fn split_options(options: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = options.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(options)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated(options)),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(options)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

fn unterminated(options: &str) -> PipelineError {
    PipelineError::Config(format!("unterminated quote in '{}'", options))
}

/// Aligner backed by an external process
#[derive(Debug, Clone)]
pub struct ExternalAligner {
    command: AlignerCommand,
    timeout: Option<Duration>,
}

impl ExternalAligner {
    pub fn new(command: AlignerCommand, timeout: Option<Duration>) -> Self {
        ExternalAligner { command, timeout }
    }

    fn chunk_path(job: &AlignmentJob, ext: &str) -> PathBuf {
        job.work_dir.join(format!("chunk_{:04}.{}", job.chunk.id, ext))
    }
}

/// Write the chunk's reads as FASTQ, or FASTA when any read lacks qualities
fn write_reads(chunk: &Chunk, path_stem: &Path) -> std::io::Result<PathBuf> {
    let fastq = chunk
        .reads
        .iter()
        .all(|r| r.qualities.as_ref().is_some_and(|q| q.len() == r.sequence.len()));
    let path = path_stem.with_extension(if fastq { "fastq" } else { "fasta" });
    let mut out = BufWriter::new(File::create(&path)?);
    for read in &chunk.reads {
        if fastq {
            out.write_all(b"@")?;
            out.write_all(read.name.as_bytes())?;
            out.write_all(b"\n")?;
            out.write_all(&read.sequence)?;
            out.write_all(b"\n+\n")?;
            let encoded: Vec<u8> = read
                .qualities
                .iter()
                .flatten()
                .map(|q| q.saturating_add(33).min(126))
                .collect();
            out.write_all(&encoded)?;
            out.write_all(b"\n")?;
        } else {
            writeln!(out, ">{}", read.name)?;
            out.write_all(&read.sequence)?;
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    Ok(path)
}

/// Last few lines of the aligner's stderr, for error messages
fn stderr_tail(path: &Path) -> String {
    const TAIL_BYTES: u64 = 2048;
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES))).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(5)..].join(" | ")
}

fn with_stderr(reason: String, stderr_path: &Path) -> String {
    let tail = stderr_tail(stderr_path);
    if tail.is_empty() {
        reason
    } else {
        format!("{} (stderr: {})", reason, tail)
    }
}

/// Open the aligner output, mapping its reference names onto the run's reference set
fn open_output(
    path: &Path,
    reference: &ReferenceSet,
    context: &ChunkContext,
) -> Result<AlignmentStream> {
    let (records, header) = AlignmentRecords::open(path)
        .map_err(|reason| PipelineError::chunk(context, format!("unreadable aligner output: {}", reason)))?;
    let reference_ids = header
        .target_names
        .iter()
        .map(|name| {
            reference.get_id(name).map(Some).ok_or_else(|| {
                PipelineError::chunk(
                    context,
                    format!("aligner output names unknown reference sequence '{}'", name),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let context = context.clone();
    Ok(Box::new(records.with_reference_ids(reference_ids).map(
        move |record| {
            record.map_err(|reason| {
                PipelineError::chunk(&context, format!("malformed aligner output: {}", reason))
            })
        },
    )))
}

impl Aligner for ExternalAligner {
    fn name(&self) -> &str {
        self.command.program()
    }

    fn align(&self, job: &AlignmentJob, cancel: &CancelToken) -> Result<AlignmentStream> {
        let context = job.chunk.context();
        let reads_path = write_reads(job.chunk, &Self::chunk_path(job, "reads"))
            .map_err(|e| PipelineError::chunk(&context, format!("failed to write reads: {}", e)))?;
        let output_path = Self::chunk_path(job, "sam");
        let stderr_path = Self::chunk_path(job, "stderr");

        let argv = self.command.arguments(
            &reads_path,
            job.reference.fasta_path(),
            &output_path,
            job.threads,
            job.options,
        )?;
        debug!("{}: running {} {}", context, self.command.program(), argv.join(" "));

        let io_err =
            |e: std::io::Error| PipelineError::chunk(&context, format!("failed to set up aligner I/O: {}", e));
        let mut command = Command::new(self.command.program());
        command
            .args(&argv)
            .current_dir(job.work_dir)
            .stdin(Stdio::null())
            .stderr(File::create(&stderr_path).map_err(io_err)?);
        if self.command.writes_stdout() {
            command.stdout(File::create(&output_path).map_err(io_err)?);
        } else {
            command.stdout(Stdio::null());
        }

        match run_supervised(command, self.timeout, cancel) {
            Ok(status) if status.success() => {}
            Ok(status) => {
                return Err(PipelineError::chunk(
                    &context,
                    with_stderr(format!("aligner {}", status), &stderr_path),
                ))
            }
            Err(ProcessFailure::Spawn(e)) => {
                return Err(PipelineError::chunk(
                    &context,
                    format!("failed to start '{}': {}", self.command.program(), e),
                ))
            }
            Err(ProcessFailure::Wait(e)) => {
                return Err(PipelineError::chunk(
                    &context,
                    format!("failed to wait for aligner: {}", e),
                ))
            }
            Err(ProcessFailure::TimedOut) => {
                return Err(PipelineError::ChunkTimeout {
                    chunk: context,
                    timeout: self.timeout.unwrap_or_default(),
                })
            }
            Err(ProcessFailure::Cancelled) => {
                return Err(PipelineError::Cancelled { chunk: context })
            }
        }

        if !output_path.is_file() {
            return Err(PipelineError::chunk(
                &context,
                with_stderr("aligner produced no output file".to_string(), &stderr_path),
            ));
        }
        open_output(&output_path, job.reference, &context)
    }
}
