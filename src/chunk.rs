use crate::error::{ChunkContext, PipelineError, Result};
use crate::read_set::Read;
use log::debug;

/// Parameters of the chunk planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Parallel workers available; never forces more chunks than the size bound needs
    pub workers: usize,
    /// Upper bound on reads per chunk
    pub max_chunk_size: usize,
}

/// A contiguous run of reads aligned by one aligner invocation
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: usize,
    pub reads: Vec<Read>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Identity used in error messages
    pub fn context(&self) -> ChunkContext {
        ChunkContext {
            id: self.id,
            first_hole_number: self.reads.first().map_or(0, |r| r.hole_number),
            last_hole_number: self.reads.last().map_or(0, |r| r.hole_number),
            reads: self.reads.len(),
        }
    }
}

/// Number of chunks needed so that none exceeds `max_chunk_size`
pub fn chunk_count(reads: usize, max_chunk_size: usize) -> usize {
    if reads == 0 {
        0
    } else {
        reads.div_ceil(max_chunk_size)
    }
}

/// Split reads into the fewest chunks that respect the size bound, keeping the
/// input order. Sizes are balanced: the first `n % k` chunks hold one extra read.
pub fn plan_chunks(reads: Vec<Read>, plan: &ChunkPlan) -> Result<Vec<Chunk>> {
    if plan.max_chunk_size == 0 {
        return Err(PipelineError::Config(
            "maximum chunk size must be at least 1".to_string(),
        ));
    }
    if plan.workers == 0 {
        return Err(PipelineError::Config(
            "number of workers must be at least 1".to_string(),
        ));
    }

    let total = reads.len();
    let k = chunk_count(total, plan.max_chunk_size);
    if k == 0 {
        return Ok(Vec::new());
    }
    let base = total / k;
    let extra = total % k;

    let mut chunks = Vec::with_capacity(k);
    let mut remaining = reads.into_iter();
    for id in 0..k {
        let size = base + usize::from(id < extra);
        chunks.push(Chunk {
            id,
            reads: remaining.by_ref().take(size).collect(),
        });
    }

    debug!(
        "Planned {} chunks for {} reads (max {} per chunk, {} workers)",
        k, total, plan.max_chunk_size, plan.workers
    );
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reads(n: u64) -> Vec<Read> {
        (0..n)
            .map(|i| Read::new(format!("m/{}/0_4", i), b"ACGT".to_vec(), None, i))
            .collect()
    }

    fn sizes(chunks: &[Chunk]) -> Vec<usize> {
        chunks.iter().map(Chunk::len).collect()
    }

    #[test]
    fn test_balanced_chunks_preserve_order() {
        let plan = ChunkPlan {
            workers: 4,
            max_chunk_size: 4,
        };
        let chunks = plan_chunks(reads(10), &plan).unwrap();
        assert_eq!(sizes(&chunks), vec![4, 3, 3]);
        let order: Vec<u64> = chunks
            .iter()
            .flat_map(|c| c.reads.iter().map(|r| r.hole_number))
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        assert_eq!(chunks.iter().map(|c| c.id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_workers_do_not_force_extra_chunks() {
        let plan = ChunkPlan {
            workers: 16,
            max_chunk_size: 100,
        };
        assert_eq!(sizes(&plan_chunks(reads(10), &plan).unwrap()), vec![10]);
        assert_eq!(sizes(&plan_chunks(reads(201), &plan).unwrap()), vec![67, 67, 67]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let plan = ChunkPlan {
            workers: 3,
            max_chunk_size: 7,
        };
        let a: Vec<Vec<u64>> = plan_chunks(reads(50), &plan)
            .unwrap()
            .iter()
            .map(|c| c.reads.iter().map(|r| r.hole_number).collect())
            .collect();
        let b: Vec<Vec<u64>> = plan_chunks(reads(50), &plan)
            .unwrap()
            .iter()
            .map(|c| c.reads.iter().map(|r| r.hole_number).collect())
            .collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|c| c.len() <= 7));
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_invalid_plans_and_empty_input() {
        let bad = ChunkPlan {
            workers: 1,
            max_chunk_size: 0,
        };
        assert!(matches!(plan_chunks(reads(3), &bad), Err(PipelineError::Config(_))));
        let plan = ChunkPlan {
            workers: 1,
            max_chunk_size: 5,
        };
        assert!(plan_chunks(Vec::new(), &plan).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_context_reports_hole_range() {
        let plan = ChunkPlan {
            workers: 1,
            max_chunk_size: 5,
        };
        let chunks = plan_chunks(reads(10), &plan).unwrap();
        let ctx = chunks[1].context();
        assert_eq!((ctx.id, ctx.first_hole_number, ctx.last_hole_number, ctx.reads), (1, 5, 9, 5));
    }
}
