//! Final output: header construction, sorted BAM writing and atomic publication
//! of the BAM together with its `.bai` index.

use crate::alignment_record::{coordinate_cmp, AlignmentRecord};
use crate::error::{PipelineError, Result};
use crate::read_set::ReadGroup;
use crate::reference::ReferenceSet;
use log::{debug, warn};
use rust_htslib::bam;
use rust_htslib::bam::header::HeaderRecord;
use std::cmp::Ordering;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// `.bai` path next to a BAM
pub fn index_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".bai");
    PathBuf::from(name)
}

/// Header of the sorted output: references in declaration order, one read
/// group per movie and the producing command line.
pub fn build_header(
    reference: &ReferenceSet,
    read_groups: &[ReadGroup],
    command_line: &str,
) -> bam::Header {
    let mut header = bam::Header::new();

    let mut hd = HeaderRecord::new(b"HD");
    hd.push_tag(b"VN", "1.6");
    hd.push_tag(b"SO", "coordinate");
    header.push_record(&hd);

    for seq in reference.sequences() {
        let mut sq = HeaderRecord::new(b"SQ");
        sq.push_tag(b"SN", &seq.name);
        sq.push_tag(b"LN", seq.length);
        header.push_record(&sq);
    }

    for rg in read_groups {
        let mut record = HeaderRecord::new(b"RG");
        record.push_tag(b"ID", &rg.id);
        record.push_tag(b"PL", "PACBIO");
        if let Some(pu) = &rg.platform_unit {
            record.push_tag(b"PU", pu);
        }
        if let Some(ds) = &rg.description {
            record.push_tag(b"DS", ds);
        }
        header.push_record(&record);
    }

    let mut pg = HeaderRecord::new(b"PG");
    pg.push_tag(b"ID", "pbalign");
    pg.push_tag(b"PN", "pbalign");
    pg.push_tag(b"VN", env!("CARGO_PKG_VERSION"));
    if !command_line.is_empty() {
        pg.push_tag(b"CL", command_line);
    }
    header.push_record(&pg);

    header
}

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    /// Build and publish a `.bai` next to the output
    pub index: bool,
    /// BGZF compression threads
    pub threads: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions {
            index: true,
            threads: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub records: u64,
    pub mapped: u64,
    pub unmapped: u64,
    pub index: Option<PathBuf>,
}

fn staging_file(parent: &Path, suffix: &str, output: &Path) -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(".pbalign-")
        .suffix(suffix)
        .permissions(std::fs::Permissions::from_mode(0o644))
        .tempfile_in(parent)
        .map_err(|e| PipelineError::write(output, format!("cannot stage output: {}", e)))
}

/// Write merged records to `output`.
///
/// Records are written to a staged file in the destination directory and only
/// renamed into place once the whole stream was written (and indexed). On any
/// error the destination is left untouched.
pub fn write_sorted_output<I>(
    records: I,
    output: &Path,
    header: &bam::Header,
    options: &OutputOptions,
) -> Result<WriteSummary>
where
    I: Iterator<Item = io::Result<AlignmentRecord>>,
{
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        return Err(PipelineError::write(
            output,
            format!("directory '{}' does not exist", parent.display()),
        ));
    }

    let staged = staging_file(parent, ".bam", output)?;
    let mut summary = WriteSummary::default();
    {
        let mut writer = bam::Writer::from_path(staged.path(), header, bam::Format::Bam)
            .map_err(|e| PipelineError::write(output, e))?;
        if options.threads > 1 {
            writer
                .set_threads(options.threads)
                .map_err(|e| PipelineError::write(output, e))?;
        }

        let mut previous: Option<AlignmentRecord> = None;
        for record in records {
            let record = record.map_err(|e| PipelineError::write(output, e))?;
            if let Some(prev) = &previous {
                if coordinate_cmp(prev, &record) == Ordering::Greater {
                    return Err(PipelineError::write(
                        output,
                        format!(
                            "record '{}' is out of coordinate order after '{}'",
                            record.name, prev.name
                        ),
                    ));
                }
            }
            let bam_record = record
                .to_bam_record()
                .map_err(|e| PipelineError::write(output, e))?;
            writer
                .write(&bam_record)
                .map_err(|e| PipelineError::write(output, e))?;

            summary.records += 1;
            if record.is_mapped() {
                summary.mapped += 1;
            } else {
                summary.unmapped += 1;
            }
            previous = Some(record);
        }
    }
    debug!(
        "Wrote {} records to staged output '{}'",
        summary.records,
        staged.path().display()
    );

    let final_index = index_path(output);
    if options.index {
        let staged_index = staging_file(parent, ".bam.bai", output)?;
        build_index(staged.path(), staged_index.path(), options.threads)
            .map_err(|e| PipelineError::write(output, e))?;
        // a failed BAM rename leaves any earlier BAM and its index untouched
        staged
            .persist(output)
            .map_err(|e| PipelineError::write(output, e.error))?;
        if let Err(e) = staged_index.persist(&final_index) {
            if final_index.exists() {
                warn!(
                    "Removing index '{}' that no longer matches '{}'",
                    final_index.display(),
                    output.display()
                );
                let _ = std::fs::remove_file(&final_index);
            }
            return Err(PipelineError::write(&final_index, e.error));
        }
        summary.index = Some(final_index);
    } else {
        staged
            .persist(output)
            .map_err(|e| PipelineError::write(output, e.error))?;
        if final_index.exists() {
            warn!(
                "Removing stale index '{}' left from an earlier run",
                final_index.display()
            );
            std::fs::remove_file(&final_index)
                .map_err(|e| PipelineError::write(&final_index, e))?;
        }
    }

    Ok(summary)
}

fn build_index(bam_path: &Path, index_path: &Path, threads: usize) -> std::result::Result<(), String> {
    bam::index::build(bam_path, Some(index_path), bam::index::Type::Bai, threads.max(1) as u32)
        .map_err(|e| format!("failed to build index: {}", e))
}

/// Rebuild the `.bai` of a coordinate-sorted BAM in place
pub fn reindex(output: &Path, threads: usize) -> Result<PathBuf> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staged_index = staging_file(parent, ".bam.bai", output)?;
    build_index(output, staged_index.path(), threads).map_err(|e| PipelineError::write(output, e))?;
    let final_index = index_path(output);
    staged_index
        .persist(&final_index)
        .map_err(|e| PipelineError::write(&final_index, e.error))?;
    Ok(final_index)
}
