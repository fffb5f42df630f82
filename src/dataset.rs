//! Dataset resolution.
//!
//! A dataset reference is a dataset XML container, a `.fofn` (file of file
//! names), or a direct FASTA/FASTQ/SAM/BAM file. Containers are expanded into
//! their data files; the files are then loaded into a `ReadSet` (or a
//! `ReferenceSet` for the reference), and the hole number filter is applied.

use crate::alignment_record::AlignmentRecord;
use crate::bam_input::AlignmentRecords;
use crate::error::{PipelineError, Result};
use crate::read_set::{parse_read_name, Read, ReadGroup, ReadSet};
use crate::realign::{self, InputKind};
use crate::reference::ReferenceSet;
use crate::subset_filter::{apply_hole_number_filter, HoleNumberFilter};
use log::{debug, info, warn};
use noodles::bgzf;
use regex::Regex;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read as IoRead, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Containers nested deeper than this are rejected
const MAX_NESTING: usize = 8;

/// File formats understood by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Fasta,
    Fastq,
    Sam,
    Bam,
    DatasetXml,
    Fofn,
}

impl DataFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        let ext = name.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "fasta" | "fa" | "fna" | "fsa" => Some(DataFormat::Fasta),
            "fastq" | "fq" => Some(DataFormat::Fastq),
            "sam" => Some(DataFormat::Sam),
            "bam" => Some(DataFormat::Bam),
            "xml" => Some(DataFormat::DatasetXml),
            "fofn" => Some(DataFormat::Fofn),
            _ => None,
        }
    }

    /// Detect format from the extension, falling back to the file contents
    pub fn detect(path: &Path) -> Result<Self> {
        if let Some(format) = Self::from_path(path) {
            return Ok(format);
        }
        sniff_format(path)
            .map_err(|e| PipelineError::from_dataset_io(path, e))?
            .ok_or_else(|| PipelineError::malformed(path, "unrecognized file format"))
    }

    pub fn is_container(self) -> bool {
        matches!(self, DataFormat::DatasetXml | DataFormat::Fofn)
    }
}

const BGZF_HEADER_SIZE: usize = 18;

/// Check whether a file starts with a valid BGZF header.
/// Returns `Ok(false)` for regular gzip, too-small files, or plain text.
fn is_bgzf<R: IoRead + Seek>(reader: &mut R) -> io::Result<bool> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    let result = match reader.read_exact(&mut header) {
        Ok(()) => {
            Ok(header[0..2] == [0x1f, 0x8b]      // gzip magic
                && header[2] == 0x08              // DEFLATE
                && header[3] == 0x04              // FEXTRA
                && header[10..12] == [0x06, 0x00] // XLEN=6
                && header[12..14] == [b'B', b'C'] // BC subfield
                && header[14..16] == [0x02, 0x00]) // SLEN=2
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    };
    reader.seek(SeekFrom::Start(0))?;
    result
}

/// Guess the format of a file without a telling extension
fn sniff_format(path: &Path) -> io::Result<Option<DataFormat>> {
    let mut file = File::open(path)?;
    if is_bgzf(&mut file)? {
        let mut reader = bgzf::io::Reader::new(file);
        let mut magic = [0u8; 4];
        return Ok(match reader.read_exact(&mut magic) {
            Ok(()) if &magic == b"BAM\x01" => Some(DataFormat::Bam),
            _ => None,
        });
    }

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    while reader.read_line(&mut line)? > 0 {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            line.clear();
            continue;
        }
        let format = if trimmed.starts_with('>') {
            Some(DataFormat::Fasta)
        } else if trimmed.starts_with('<') {
            Some(DataFormat::DatasetXml)
        } else if ["@HD\t", "@SQ\t", "@RG\t", "@PG\t", "@CO\t"]
            .iter()
            .any(|p| trimmed.starts_with(p))
        {
            Some(DataFormat::Sam)
        } else if trimmed.starts_with('@') {
            Some(DataFormat::Fastq)
        } else {
            None
        };
        return Ok(format);
    }
    Ok(None)
}

/// One data file declared by a dataset XML
#[derive(Debug, Clone, PartialEq, Eq)]
struct DatasetResource {
    id: String,
    meta_type: Option<String>,
}

fn comment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment regex"))
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<(/?)([A-Za-z_][\w.:-]*)((?:[^>"']|"[^"]*"|'[^']*')*?)(/?)>"#)
            .expect("valid tag regex")
    })
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([A-Za-z_][\w.:-]*)\s*=\s*"([^"]*)""#).expect("valid attribute regex"))
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn attribute(attributes: &str, wanted: &str) -> Option<String> {
    attribute_regex()
        .captures_iter(attributes)
        .find(|caps| local_name(&caps[1]) == wanted)
        .map(|caps| caps[2].to_string())
}

/// `ExternalResource` elements that belong to the dataset itself. Resources
/// nested inside another resource (scraps, chip stats), `FileIndices` blocks
/// and child `DataSets` are not data files of this dataset.
fn dataset_resources(text: &str) -> Vec<DatasetResource> {
    let text = comment_regex().replace_all(text, "");
    let mut open: Vec<String> = Vec::new();
    let mut resources = Vec::new();

    for caps in tag_regex().captures_iter(&text) {
        let name = local_name(&caps[2]).to_string();
        if !caps[1].is_empty() {
            if let Some(pos) = open.iter().rposition(|n| *n == name) {
                open.truncate(pos);
            }
            continue;
        }
        if name == "ExternalResource"
            && !open
                .iter()
                .any(|n| matches!(n.as_str(), "ExternalResource" | "FileIndices" | "DataSets"))
        {
            if let Some(id) = attribute(&caps[3], "ResourceId") {
                resources.push(DatasetResource {
                    id,
                    meta_type: attribute(&caps[3], "MetaType"),
                });
            }
        }
        if caps[4].is_empty() {
            open.push(name);
        }
    }
    resources
}

fn is_index_resource(path: &str) -> bool {
    [".pbi", ".bai", ".csi", ".fai", ".gzi", ".sa", ".ctab", ".index"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

/// Meta types of files that sit next to the data without holding reads or
/// reference sequences
fn is_auxiliary_meta_type(meta_type: &str) -> bool {
    meta_type.starts_with("PacBio.Index.")
        || [
            "ScrapsBamFile",
            "ChipStatsFile",
            "AdapterFastaFile",
            "ControlFastaFile",
            "HqRegionBamFile",
            "LqRegionBamFile",
        ]
        .iter()
        .any(|suffix| meta_type.ends_with(suffix))
}

fn resolve_relative(base: &Path, entry: &str) -> PathBuf {
    let entry = entry.strip_prefix("file://").unwrap_or(entry);
    let candidate = PathBuf::from(entry);
    if candidate.is_absolute() {
        candidate
    } else {
        base.parent().unwrap_or(Path::new(".")).join(candidate)
    }
}

/// Expand a dataset reference into its data files, in declaration order
pub fn expand_dataset(path: &Path) -> Result<Vec<PathBuf>> {
    expand_nested(path, 0)
}

fn expand_nested(path: &Path, depth: usize) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Err(PipelineError::DatasetNotFound {
            path: path.to_path_buf(),
        });
    }
    if depth > MAX_NESTING {
        return Err(PipelineError::malformed(path, "dataset containers nested too deeply"));
    }

    let entries: Vec<PathBuf> = match DataFormat::detect(path)? {
        DataFormat::DatasetXml => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| PipelineError::from_dataset_io(path, e))?;
            dataset_resources(&text)
                .into_iter()
                .filter(|resource| {
                    let auxiliary = is_index_resource(&resource.id)
                        || resource.meta_type.as_deref().is_some_and(is_auxiliary_meta_type);
                    if auxiliary {
                        debug!("Skipping auxiliary resource '{}' in '{}'", resource.id, path.display());
                    }
                    !auxiliary
                })
                .map(|resource| resolve_relative(path, &resource.id))
                .collect()
        }
        DataFormat::Fofn => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| PipelineError::from_dataset_io(path, e))?;
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(|l| resolve_relative(path, l))
                .collect()
        }
        _ => return Ok(vec![path.to_path_buf()]),
    };

    if entries.is_empty() {
        return Err(PipelineError::malformed(path, "dataset lists no data files"));
    }

    let mut files = Vec::new();
    for entry in entries {
        files.extend(expand_nested(&entry, depth + 1)?);
    }
    Ok(files)
}

/// Load reads from a FASTA or FASTQ file (optionally gzipped)
fn load_fastx(path: &Path, ordinal_offset: u64) -> Result<Vec<Read>> {
    let mut reader = needletail::parse_fastx_file(path).map_err(|e| {
        if path.exists() {
            PipelineError::malformed(path, e.to_string())
        } else {
            PipelineError::DatasetNotFound {
                path: path.to_path_buf(),
            }
        }
    })?;

    let mut reads = Vec::new();
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| PipelineError::malformed(path, e.to_string()))?;
        let id = String::from_utf8_lossy(record.id());
        let name = id.split_whitespace().next().unwrap_or("").to_string();
        if name.is_empty() {
            return Err(PipelineError::malformed(path, "record without a name"));
        }
        let qualities = record
            .qual()
            .map(|q| q.iter().map(|b| b.saturating_sub(33)).collect());
        let ordinal = ordinal_offset + reads.len() as u64;
        reads.push(Read::new(name, record.seq().to_vec(), qualities, ordinal));
    }
    Ok(reads)
}

/// Turn a record back into the read it was made from, discarding any placement
pub fn read_from_record(record: AlignmentRecord) -> Read {
    let (sequence, qualities) = record.original_orientation();
    let read_group = record
        .read_group
        .clone()
        .or_else(|| parse_read_name(&record.name).map(|(movie, _)| movie.to_string()));
    Read {
        name: record.name,
        hole_number: record.hole_number,
        sequence,
        qualities,
        read_group,
    }
}

/// Reads loaded from a SAM/BAM file together with its header read groups
pub struct BamReads {
    pub reads: Vec<Read>,
    pub read_groups: Vec<ReadGroup>,
    pub mapped: usize,
    pub skipped_non_primary: usize,
}

/// Load the primary records of a SAM/BAM file as reads
pub fn load_bam_reads(path: &Path, ordinal_offset: u64) -> Result<BamReads> {
    if !path.exists() {
        return Err(PipelineError::DatasetNotFound {
            path: path.to_path_buf(),
        });
    }
    let (records, header) =
        AlignmentRecords::open(path).map_err(|reason| PipelineError::malformed(path, reason))?;

    let mut reads = Vec::new();
    let mut mapped = 0;
    let mut skipped_non_primary = 0;
    for record in records.with_ordinal_offset(ordinal_offset) {
        let record = record.map_err(|reason| PipelineError::malformed(path, reason))?;
        if !record.is_primary() {
            skipped_non_primary += 1;
            continue;
        }
        if record.is_mapped() {
            mapped += 1;
        }
        reads.push(read_from_record(record));
    }

    Ok(BamReads {
        reads,
        read_groups: header.read_groups,
        mapped,
        skipped_non_primary,
    })
}

/// Load raw (never aligned) reads from the given data files
pub fn load_raw_reads(files: &[PathBuf]) -> Result<(Vec<Read>, Vec<ReadGroup>)> {
    let mut reads: Vec<Read> = Vec::new();
    let mut read_groups = Vec::new();
    for file in files {
        let offset = reads.len() as u64;
        match DataFormat::detect(file)? {
            DataFormat::Fasta | DataFormat::Fastq => {
                let loaded = load_fastx(file, offset)?;
                debug!("Loaded {} reads from '{}'", loaded.len(), file.display());
                reads.extend(loaded);
            }
            DataFormat::Bam | DataFormat::Sam => {
                let loaded = load_bam_reads(file, offset)?;
                if loaded.skipped_non_primary > 0 {
                    warn!(
                        "Skipped {} non-primary records in unaligned input '{}'",
                        loaded.skipped_non_primary,
                        file.display()
                    );
                }
                debug!("Loaded {} reads from '{}'", loaded.reads.len(), file.display());
                reads.extend(loaded.reads);
                read_groups.extend(loaded.read_groups);
            }
            DataFormat::DatasetXml | DataFormat::Fofn => {
                return Err(PipelineError::malformed(file, "unexpected nested dataset"));
            }
        }
    }
    Ok((reads, read_groups))
}

/// Resolve the reads of a detected input, applying the hole number filter
pub fn resolve_reads(input: &InputKind, origin: &Path, filter: &HoleNumberFilter) -> Result<ReadSet> {
    let (reads, read_groups) = match input {
        InputKind::FreshInput(files) => load_raw_reads(files)?,
        InputKind::AlignedInput(files) => realign::extract_reads(files)?,
    };
    if reads.is_empty() {
        return Err(PipelineError::malformed(origin, "dataset contains no reads"));
    }

    let mut read_set = ReadSet::new(reads, dedup_read_groups(read_groups), origin)?;
    info!("Resolved {} reads from '{}'", read_set.len(), origin.display());
    apply_hole_number_filter(&mut read_set, filter)?;
    Ok(read_set)
}

fn dedup_read_groups(groups: Vec<ReadGroup>) -> Vec<ReadGroup> {
    let mut seen = rustc_hash::FxHashSet::default();
    groups
        .into_iter()
        .filter(|rg| seen.insert(rg.id.clone()))
        .collect()
}

/// Resolve a reference dataset to its single FASTA file
pub fn resolve_reference(path: &Path) -> Result<ReferenceSet> {
    let fasta_files: Vec<PathBuf> = expand_dataset(path)?
        .into_iter()
        .filter(|f| matches!(DataFormat::detect(f), Ok(DataFormat::Fasta)))
        .collect();
    match fasta_files.as_slice() {
        [fasta] => ReferenceSet::from_fasta(fasta),
        [] => Err(PipelineError::malformed(path, "reference dataset names no FASTA file")),
        _ => Err(PipelineError::malformed(
            path,
            format!(
                "reference dataset names {} FASTA files, expected one",
                fasta_files.len()
            ),
        )),
    }
}
