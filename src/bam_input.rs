// SAM/BAM reading shared by the aligner output parser, the realignment
// extractor, unaligned BAM inputs and the output checks.
use crate::alignment_record::AlignmentRecord;
use crate::read_set::{parse_read_groups, ReadGroup};
use rust_htslib::bam;
use rust_htslib::bam::Read as HtsRead;
use std::path::{Path, PathBuf};

/// Header facts needed by the pipeline
#[derive(Debug, Clone, Default)]
pub struct HeaderInfo {
    pub target_names: Vec<String>,
    pub target_lengths: Vec<u64>,
    pub read_groups: Vec<ReadGroup>,
}

impl HeaderInfo {
    fn from_view(view: &bam::HeaderView) -> Self {
        // `target_names()` builds a slice from a null pointer when the header
        // has no @SQ lines, so look names up one tid at a time
        let target_count = view.target_count();
        let target_names: Vec<String> = (0..target_count)
            .map(|tid| String::from_utf8_lossy(view.tid2name(tid)).into_owned())
            .collect();
        let target_lengths = (0..target_count)
            .map(|tid| view.target_len(tid).unwrap_or(0))
            .collect();
        let text = String::from_utf8_lossy(view.as_bytes());
        HeaderInfo {
            target_names,
            target_lengths,
            read_groups: parse_read_groups(&text),
        }
    }

    /// Identity mapping from header target ids to reference ids
    pub fn identity_reference_ids(&self) -> Vec<Option<usize>> {
        (0..self.target_names.len()).map(Some).collect()
    }
}

/// Streaming reader converting SAM/BAM records into `AlignmentRecord`s
pub struct AlignmentRecords {
    path: PathBuf,
    reader: bam::Reader,
    record: bam::Record,
    reference_ids: Vec<Option<usize>>,
    ordinal: u64,
}

impl AlignmentRecords {
    /// Open a SAM or BAM file; the format is detected by htslib
    pub fn open(path: &Path) -> Result<(Self, HeaderInfo), String> {
        let reader = bam::Reader::from_path(path)
            .map_err(|e| format!("failed to open '{}': {}", path.display(), e))?;
        let header = HeaderInfo::from_view(reader.header());
        let reference_ids = header.identity_reference_ids();
        Ok((
            AlignmentRecords {
                path: path.to_path_buf(),
                reader,
                record: bam::Record::new(),
                reference_ids,
                ordinal: 0,
            },
            header,
        ))
    }

    /// Map header target ids onto another reference set's ids
    pub fn with_reference_ids(mut self, reference_ids: Vec<Option<usize>>) -> Self {
        self.reference_ids = reference_ids;
        self
    }

    /// Hole numbers of records without a `zm` tag or PacBio name count up from `offset`
    pub fn with_ordinal_offset(mut self, offset: u64) -> Self {
        self.ordinal = offset;
        self
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

impl Iterator for AlignmentRecords {
    type Item = Result<AlignmentRecord, String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read(&mut self.record)? {
            Ok(()) => {
                let converted =
                    AlignmentRecord::from_bam_record(&self.record, &self.reference_ids, self.ordinal)
                        .map_err(|e| format!("{} in '{}'", e, self.path.display()));
                self.ordinal += 1;
                Some(converted)
            }
            Err(e) => Some(Err(format!(
                "failed to read record from '{}': {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_sam_text() {
        let dir = tempfile::TempDir::new().unwrap();
        let sam = dir.path().join("x.sam");
        let mut f = std::fs::File::create(&sam).unwrap();
        write!(
            f,
            "@HD\tVN:1.6\n@SQ\tSN:chr1\tLN:100\n@SQ\tSN:chr2\tLN:50\n@RG\tID:mov\tPU:mov\n\
             mov/3/0_4\t16\tchr2\t10\t60\t4M\t*\t0\t0\tACGT\t*\tRG:Z:mov\n\
             plain\t4\t*\t0\t0\t*\t*\t0\t0\tAAAA\t*\n"
        )
        .unwrap();
        drop(f);

        let (records, header) = AlignmentRecords::open(&sam).unwrap();
        assert_eq!(header.target_names, vec!["chr1", "chr2"]);
        assert_eq!(header.target_lengths, vec![100, 50]);
        assert_eq!(header.read_groups.len(), 1);

        let records: Vec<AlignmentRecord> = records
            .with_ordinal_offset(10)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        let first = records[0].placement.unwrap();
        assert_eq!(first.reference_id, 1);
        assert_eq!(first.position, 10);
        assert_eq!(records[0].hole_number, 3);
        assert_eq!(records[0].read_group.as_deref(), Some("mov"));
        assert!(!records[1].is_mapped());
        // second record in the file: ordinal offset 10 + 1
        assert_eq!(records[1].hole_number, 11);
    }

    #[test]
    fn test_read_unaligned_header_without_targets() {
        let dir = tempfile::TempDir::new().unwrap();
        let sam = dir.path().join("subreads.sam");
        std::fs::write(
            &sam,
            "@HD\tVN:1.6\n@RG\tID:mov\tPL:PACBIO\tPU:mov\n\
             mov/1/0_4\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\t*\tRG:Z:mov\tzm:i:1\n",
        )
        .unwrap();

        let (records, header) = AlignmentRecords::open(&sam).unwrap();
        assert!(header.target_names.is_empty());
        assert!(header.target_lengths.is_empty());
        assert_eq!(header.read_groups.len(), 1);

        let records: Vec<AlignmentRecord> = records.collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_mapped());
        assert_eq!(records[0].hole_number, 1);
    }

    #[test]
    fn test_open_missing_file() {
        assert!(AlignmentRecords::open(Path::new("/nonexistent/x.bam")).is_err());
    }
}
