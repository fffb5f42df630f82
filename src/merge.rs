use crate::alignment_record::{coordinate_cmp, AlignmentRecord};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;

/// Head record of one source; ordered so that `BinaryHeap` pops the smallest
struct HeapEntry {
    record: AlignmentRecord,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        coordinate_cmp(&other.record, &self.record).then(other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// K-way merge of individually sorted record sources.
///
/// Holds one record per source at a time. Equal records come out in source
/// order, so the merge is deterministic.
pub struct MergedRecords<I> {
    sources: Vec<I>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl<I> MergedRecords<I>
where
    I: Iterator<Item = io::Result<AlignmentRecord>>,
{
    pub fn new(mut sources: Vec<I>) -> io::Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(record) = iter.next() {
                heap.push(HeapEntry {
                    record: record?,
                    source,
                });
            }
        }
        Ok(MergedRecords {
            sources,
            heap,
            failed: false,
        })
    }
}

impl<I> Iterator for MergedRecords<I>
where
    I: Iterator<Item = io::Result<AlignmentRecord>>,
{
    type Item = io::Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let HeapEntry { record, source } = self.heap.pop()?;
        match self.sources[source].next() {
            Some(Ok(next)) => {
                if coordinate_cmp(&next, &record) == Ordering::Less {
                    self.failed = true;
                    return Some(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("merge source {} is not sorted at '{}'", source, next.name),
                    )));
                }
                self.heap.push(HeapEntry {
                    record: next,
                    source,
                });
            }
            Some(Err(e)) => {
                self.failed = true;
                return Some(Err(e));
            }
            None => {}
        }
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment_record::{parse_cigar, Placement, Strand};
    use crate::read_set::Read;

    fn record(hole: u64, reference_id: usize, position: u64) -> AlignmentRecord {
        let mut r = AlignmentRecord::unmapped(&Read::new(
            format!("m/{}/0_4", hole),
            b"ACGT".to_vec(),
            None,
            0,
        ));
        r.placement = Some(Placement {
            reference_id,
            position,
            strand: Strand::Forward,
        });
        r.cigar = parse_cigar("4M").unwrap();
        r
    }

    fn unmapped(hole: u64) -> AlignmentRecord {
        AlignmentRecord::unmapped(&Read::new(format!("m/{}/0_4", hole), b"ACGT".to_vec(), None, 0))
    }

    fn source(records: Vec<AlignmentRecord>) -> std::vec::IntoIter<io::Result<AlignmentRecord>> {
        records.into_iter().map(Ok).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_merge_interleaves_sources() {
        let a = source(vec![record(1, 0, 5), record(4, 1, 1), unmapped(9)]);
        let b = source(vec![record(2, 0, 3), record(3, 0, 5), unmapped(7)]);
        let c = source(vec![]);
        let merged: Vec<u64> = MergedRecords::new(vec![a, b, c])
            .unwrap()
            .map(|r| r.unwrap().hole_number)
            .collect();
        assert_eq!(merged, vec![2, 1, 3, 4, 7, 9]);
    }

    #[test]
    fn test_merge_is_independent_of_source_order() {
        let runs = || {
            vec![
                vec![record(10, 0, 100), record(11, 0, 200)],
                vec![record(12, 0, 150), unmapped(1)],
                vec![record(13, 0, 100)],
            ]
        };
        let forward: Vec<AlignmentRecord> = MergedRecords::new(runs().into_iter().map(source).collect())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let backward: Vec<AlignmentRecord> =
            MergedRecords::new(runs().into_iter().rev().map(source).collect())
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_unsorted_source_is_reported() {
        let a = source(vec![record(1, 0, 50), record(2, 0, 10)]);
        let results: Vec<io::Result<AlignmentRecord>> = MergedRecords::new(vec![a]).unwrap().collect();
        assert!(results.iter().any(|r| r.is_err()));
    }
}
