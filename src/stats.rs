use crate::alignment_record::{coordinate_cmp, AlignmentRecord};
use crate::bam_input::AlignmentRecords;
use crate::error::{PipelineError, Result};
use log::info;
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

/// Summary counts of an alignment file, in the spirit of `samtools flagstat`
/// plus the summed per-position depth
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignmentStats {
    pub records: u64,
    pub primary: u64,
    pub mapped: u64,
    pub unmapped: u64,
    pub secondary: u64,
    pub supplementary: u64,
    pub duplicate: u64,
    /// Sum over reference positions of read depth (aligned match bases of
    /// primary, non-duplicate records)
    pub depth_sum: u64,
    /// Mapped primary records per reference, in header order
    pub mapped_per_reference: Vec<(String, u64)>,
    /// Whether records follow the output coordinate order
    pub sorted: bool,
}

impl AlignmentStats {
    /// Empty counts for a file declaring `reference_names`, in header order
    pub fn for_references<I: IntoIterator<Item = String>>(reference_names: I) -> Self {
        AlignmentStats {
            mapped_per_reference: reference_names.into_iter().map(|n| (n, 0)).collect(),
            sorted: true,
            ..Default::default()
        }
    }

    pub fn add(&mut self, record: &AlignmentRecord) {
        self.records += 1;
        if record.is_secondary() {
            self.secondary += 1;
        }
        if record.is_supplementary() {
            self.supplementary += 1;
        }
        if record.is_duplicate() {
            self.duplicate += 1;
        }
        if !record.is_primary() {
            return;
        }
        self.primary += 1;
        match record.placement {
            Some(p) => {
                self.mapped += 1;
                if let Some(entry) = self.mapped_per_reference.get_mut(p.reference_id) {
                    entry.1 += 1;
                }
                if !record.is_duplicate() {
                    self.depth_sum += record
                        .cigar
                        .iter()
                        .filter(|op| op.is_match())
                        .map(|op| op.len() as u64)
                        .sum::<u64>();
                }
            }
            None => self.unmapped += 1,
        }
    }

    /// Scan a SAM/BAM file
    pub fn from_file(path: &Path) -> Result<Self> {
        let (records, header) =
            AlignmentRecords::open(path).map_err(|reason| PipelineError::malformed(path, reason))?;
        let mut stats = AlignmentStats::for_references(header.target_names);
        let mut previous: Option<AlignmentRecord> = None;
        for record in records {
            let record = record.map_err(|reason| PipelineError::malformed(path, reason))?;
            if let Some(prev) = &previous {
                if coordinate_cmp(prev, &record) == Ordering::Greater {
                    stats.sorted = false;
                }
            }
            stats.add(&record);
            previous = Some(record);
        }
        Ok(stats)
    }

    pub fn log_report(&self, path: &Path) {
        info!("[stats] '{}': {}", path.display(), self);
        for (name, mapped) in &self.mapped_per_reference {
            info!("[stats]   {}: {} mapped", name, mapped);
        }
    }
}

impl fmt::Display for AlignmentStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} primary, {} mapped, {} unmapped, {} secondary, {} supplementary, {} duplicate, depth sum {}{}",
            self.records,
            self.primary,
            self.mapped,
            self.unmapped,
            self.secondary,
            self.supplementary,
            self.duplicate,
            self.depth_sum,
            if self.sorted { "" } else { " (NOT coordinate sorted)" }
        )
    }
}
