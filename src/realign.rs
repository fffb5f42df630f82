use crate::bam_input::AlignmentRecords;
use crate::dataset::{expand_dataset, load_bam_reads, DataFormat};
use crate::error::{PipelineError, Result};
use crate::read_set::{Read, ReadGroup};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// How the input dataset enters the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// Raw reads that were never aligned
    FreshInput(Vec<PathBuf>),
    /// Alignment files from an earlier run; only their reads are reused
    AlignedInput(Vec<PathBuf>),
}

impl InputKind {
    pub fn files(&self) -> &[PathBuf] {
        match self {
            InputKind::FreshInput(files) | InputKind::AlignedInput(files) => files,
        }
    }

    pub fn is_realignment(&self) -> bool {
        matches!(self, InputKind::AlignedInput(_))
    }
}

/// Whether a single data file holds alignments: SAM/BAM files whose header
/// declares reference sequences. A mapped record needs an `@SQ` line, so the
/// header alone decides.
fn is_aligned_file(path: &Path) -> Result<bool> {
    match DataFormat::detect(path)? {
        DataFormat::Bam | DataFormat::Sam => {
            let (_, header) = AlignmentRecords::open(path)
                .map_err(|reason| PipelineError::malformed(path, reason))?;
            Ok(!header.target_names.is_empty())
        }
        DataFormat::Fasta | DataFormat::Fastq => Ok(false),
        DataFormat::DatasetXml | DataFormat::Fofn => {
            Err(PipelineError::malformed(path, "unexpected nested dataset"))
        }
    }
}

/// Decide between fresh alignment and realignment for a dataset reference.
/// Containers are expanded first; all of their files must agree.
pub fn detect_input(path: &Path) -> Result<InputKind> {
    let files = expand_dataset(path)?;

    let mut aligned = Vec::with_capacity(files.len());
    for file in &files {
        let is_aligned = is_aligned_file(file)?;
        debug!(
            "'{}' holds {}",
            file.display(),
            if is_aligned { "alignments" } else { "raw reads" }
        );
        aligned.push(is_aligned);
    }

    if aligned.iter().all(|&a| a) {
        info!("Input '{}' is already aligned, realigning its reads", path.display());
        Ok(InputKind::AlignedInput(files))
    } else if aligned.iter().all(|&a| !a) {
        Ok(InputKind::FreshInput(files))
    } else {
        Err(PipelineError::malformed(
            path,
            "dataset mixes aligned and unaligned files",
        ))
    }
}

/// Pull the reads back out of aligned files, discarding every prior mapping
/// decision. Reverse-strand records are returned to their sequenced orientation.
pub fn extract_reads(files: &[PathBuf]) -> Result<(Vec<Read>, Vec<ReadGroup>)> {
    let mut reads: Vec<Read> = Vec::new();
    let mut read_groups = Vec::new();
    for file in files {
        let loaded = load_bam_reads(file, reads.len() as u64)?;
        if loaded.skipped_non_primary > 0 {
            warn!(
                "Ignoring {} secondary/supplementary records in '{}'",
                loaded.skipped_non_primary,
                file.display()
            );
        }
        debug!(
            "Extracted {} reads ({} previously mapped) from '{}'",
            loaded.reads.len(),
            loaded.mapped,
            file.display()
        );
        reads.extend(loaded.reads);
        read_groups.extend(loaded.read_groups);
    }
    Ok((reads, read_groups))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(path: &Path, contents: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    const ALIGNED_SAM: &str = "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:ref\tLN:100\n\
@RG\tID:mov\tPU:mov\tDS:READTYPE=SUBREAD;BINDINGKIT=100-619-300\n\
mov/2/0_6\t16\tref\t5\t60\t6M\t*\t0\t0\tAACCGT\t!#%')+\tRG:Z:mov\n\
mov/2/0_6\t272\tref\t50\t10\t6M\t*\t0\t0\tAACCGT\t!#%')+\tRG:Z:mov\n\
mov/1/0_4\t0\tref\t20\t60\t4M\t*\t0\t0\tGGGG\t*\tRG:Z:mov\n\
mov/3/0_4\t4\t*\t0\t0\t*\t*\t0\t0\tTTTT\t*\tRG:Z:mov\n";

    #[test]
    fn test_detect_fresh_and_aligned() {
        let dir = tempfile::TempDir::new().unwrap();
        let fasta = dir.path().join("r.fasta");
        write(&fasta, ">m/1/0_4\nACGT\n");
        assert_eq!(
            detect_input(&fasta).unwrap(),
            InputKind::FreshInput(vec![fasta.clone()])
        );

        let unaligned = dir.path().join("u.sam");
        write(&unaligned, "@HD\tVN:1.6\nm/1/0_4\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\t*\n");
        assert!(!detect_input(&unaligned).unwrap().is_realignment());

        let aligned = dir.path().join("a.sam");
        write(&aligned, ALIGNED_SAM);
        assert!(detect_input(&aligned).unwrap().is_realignment());

        // output of an earlier run where nothing mapped
        let all_unmapped = dir.path().join("none_mapped.sam");
        write(
            &all_unmapped,
            "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:ref\tLN:100\n\
             m/1/0_4\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\t*\n",
        );
        assert!(detect_input(&all_unmapped).unwrap().is_realignment());
    }

    #[test]
    fn test_mixed_dataset_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        write(&dir.path().join("r.fasta"), ">m/1/0_4\nACGT\n");
        write(&dir.path().join("a.sam"), ALIGNED_SAM);
        write(&dir.path().join("in.fofn"), "r.fasta\na.sam\n");
        assert!(matches!(
            detect_input(&dir.path().join("in.fofn")),
            Err(PipelineError::MalformedDataset { .. })
        ));
    }

    #[test]
    fn test_extract_reads_discards_mapping() {
        let dir = tempfile::TempDir::new().unwrap();
        let aligned = dir.path().join("a.sam");
        write(&aligned, ALIGNED_SAM);

        let (reads, groups) = extract_reads(&[aligned]).unwrap();
        // the secondary record is skipped, file order is kept
        let names: Vec<&str> = reads.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["mov/2/0_6", "mov/1/0_4", "mov/3/0_4"]);

        // reverse strand record comes back in sequenced orientation
        assert_eq!(reads[0].sequence, b"ACGGTT".to_vec());
        assert_eq!(reads[0].qualities, Some(vec![10, 8, 6, 4, 2, 0]));
        assert_eq!(reads[0].hole_number, 2);
        assert_eq!(reads[1].qualities, None);
        assert_eq!(reads[2].read_group.as_deref(), Some("mov"));

        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].description.as_deref(),
            Some("READTYPE=SUBREAD;BINDINGKIT=100-619-300")
        );
    }
}
