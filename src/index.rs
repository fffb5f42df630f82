use crate::alignment_record::{coordinate_cmp, AlignmentRecord};
use crate::bam_input::AlignmentRecords;
use crate::error::{PipelineError, Result};
use coitrees::{BasicCOITree, Interval, IntervalTree};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::path::Path;

/// Per-interval payload: position of the record in the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexedRecord {
    pub ordinal: u64,
    pub mapq: u8,
}

/// In-memory range index over a coordinate-sorted alignment file.
///
/// Derived data only: it is rebuilt from the file whenever needed.
pub struct AlignmentIndex {
    reference_names: Vec<String>,
    name_to_id: FxHashMap<String, usize>,
    trees: Vec<BasicCOITree<IndexedRecord, u32>>,
    records: u64,
    unmapped: u64,
}

fn to_coord(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl AlignmentIndex {
    /// Build from a sorted SAM/BAM file, rejecting files that are not coordinate sorted
    pub fn build(path: &Path) -> Result<Self> {
        let (records, header) =
            AlignmentRecords::open(path).map_err(|reason| PipelineError::malformed(path, reason))?;

        let mut intervals: Vec<Vec<Interval<IndexedRecord>>> =
            (0..header.target_names.len()).map(|_| Vec::new()).collect();
        let mut previous: Option<AlignmentRecord> = None;
        let mut count = 0u64;
        let mut unmapped = 0u64;
        for record in records {
            let record = record.map_err(|reason| PipelineError::malformed(path, reason))?;
            if let Some(prev) = &previous {
                if coordinate_cmp(prev, &record) == Ordering::Greater {
                    return Err(PipelineError::malformed(
                        path,
                        format!("record '{}' breaks coordinate order", record.name),
                    ));
                }
            }
            match record.reference_interval() {
                Some((reference_id, first, last)) => intervals[reference_id].push(Interval {
                    first: to_coord(first),
                    last: to_coord(last),
                    metadata: IndexedRecord {
                        ordinal: count,
                        mapq: record.mapq,
                    },
                }),
                None => unmapped += 1,
            }
            count += 1;
            previous = Some(record);
        }

        let trees = intervals
            .iter()
            .map(|nodes| BasicCOITree::new(nodes.as_slice()))
            .collect();
        let name_to_id = header
            .target_names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();

        Ok(AlignmentIndex {
            reference_names: header.target_names,
            name_to_id,
            trees,
            records: count,
            unmapped,
        })
    }

    pub fn reference_names(&self) -> &[String] {
        &self.reference_names
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn unmapped(&self) -> u64 {
        self.unmapped
    }

    fn tree(&self, reference: &str) -> Option<&BasicCOITree<IndexedRecord, u32>> {
        self.name_to_id.get(reference).map(|&id| &self.trees[id])
    }

    /// Ordinals of records overlapping the 1-based closed range, in file order
    pub fn query(&self, reference: &str, start: u64, end: u64) -> Vec<u64> {
        let mut hits = Vec::new();
        if let Some(tree) = self.tree(reference) {
            tree.query(to_coord(start), to_coord(end), |interval| {
                hits.push(interval.metadata.ordinal);
            });
        }
        hits.sort_unstable();
        hits
    }

    /// Number of records overlapping the 1-based closed range
    pub fn count(&self, reference: &str, start: u64, end: u64) -> usize {
        self.tree(reference)
            .map_or(0, |tree| tree.query_count(to_coord(start), to_coord(end)))
    }

    /// Reference bases of the range covered by records, summed over records
    pub fn coverage(&self, reference: &str, start: u64, end: u64) -> u64 {
        let (start, end) = (to_coord(start), to_coord(end));
        let mut total = 0u64;
        if let Some(tree) = self.tree(reference) {
            tree.query(start, end, |interval| {
                let first = interval.first.max(start);
                let last = interval.last.min(end);
                if last >= first {
                    total += (last - first + 1) as u64;
                }
            });
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_sam(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("x.sam");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            "@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000\n@SQ\tSN:chr2\tLN:1000\n{}",
            body
        )
        .unwrap();
        path
    }

    #[test]
    fn test_query_and_coverage() {
        let dir = tempfile::TempDir::new().unwrap();
        let sam = write_sam(
            dir.path(),
            "m/1/0_10\t0\tchr1\t10\t60\t10M\t*\t0\t0\t*\t*\n\
             m/2/0_10\t0\tchr1\t15\t20\t5M2D5M\t*\t0\t0\t*\t*\n\
             m/3/0_10\t0\tchr2\t1\t60\t10M\t*\t0\t0\t*\t*\n\
             m/4/0_10\t4\t*\t0\t0\t*\t*\t0\t0\tACGT\t*\n",
        );
        let index = AlignmentIndex::build(&sam).unwrap();
        assert_eq!(index.records(), 4);
        assert_eq!(index.unmapped(), 1);

        // chr1:10-19 and chr1:15-26
        assert_eq!(index.query("chr1", 18, 20), vec![0, 1]);
        assert_eq!(index.query("chr1", 21, 30), vec![1]);
        assert_eq!(index.count("chr1", 1, 9), 0);
        assert_eq!(index.count("chr2", 5, 5), 1);
        assert!(index.query("chrX", 1, 100).is_empty());

        assert_eq!(index.coverage("chr1", 1, 1000), 10 + 12);
        assert_eq!(index.coverage("chr1", 15, 19), 5 + 5);
    }

    #[test]
    fn test_unsorted_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let sam = write_sam(
            dir.path(),
            "m/1/0_10\t0\tchr2\t10\t60\t10M\t*\t0\t0\t*\t*\n\
             m/2/0_10\t0\tchr1\t15\t20\t10M\t*\t0\t0\t*\t*\n",
        );
        assert!(matches!(
            AlignmentIndex::build(&sam),
            Err(PipelineError::MalformedDataset { .. })
        ));
    }
}
