//! Error taxonomy for the alignment pipeline.
//!
//! Resolution-time errors are raised before any worker starts, worker-time
//! errors abort the whole run and cancel sibling chunks, and write errors are
//! raised while finalizing the output (nothing is published in that case).

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identity of a chunk, carried by worker-time errors so a failure can be reproduced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkContext {
    pub id: usize,
    pub first_hole_number: u64,
    pub last_hole_number: u64,
    pub reads: usize,
}

impl fmt::Display for ChunkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} (hole numbers {}-{}, {} reads)",
            self.id, self.first_hole_number, self.last_hole_number, self.reads
        )
    }
}

#[derive(Debug)]
pub enum PipelineError {
    DatasetNotFound {
        path: PathBuf,
    },
    MalformedDataset {
        path: PathBuf,
        reason: String,
    },
    EmptySubset {
        filter: String,
        total: usize,
    },
    ChunkAlignment {
        chunk: ChunkContext,
        reason: String,
    },
    ChunkTimeout {
        chunk: ChunkContext,
        timeout: Duration,
    },
    /// A worker stopped because a sibling chunk failed first
    Cancelled {
        chunk: ChunkContext,
    },
    Write {
        path: PathBuf,
        reason: String,
    },
    Config(String),
}

impl PipelineError {
    pub fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        PipelineError::MalformedDataset {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn chunk(chunk: &ChunkContext, reason: impl Into<String>) -> Self {
        PipelineError::ChunkAlignment {
            chunk: chunk.clone(),
            reason: reason.into(),
        }
    }

    pub fn write(path: &Path, reason: impl fmt::Display) -> Self {
        PipelineError::Write {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Map an I/O error on a dataset path to the matching resolution error
    pub fn from_dataset_io(path: &Path, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            PipelineError::DatasetNotFound {
                path: path.to_path_buf(),
            }
        } else {
            PipelineError::malformed(path, e.to_string())
        }
    }

    /// Name of the pipeline stage that raised the error
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::DatasetNotFound { .. }
            | PipelineError::MalformedDataset { .. }
            | PipelineError::EmptySubset { .. } => "dataset resolution",
            PipelineError::ChunkAlignment { .. }
            | PipelineError::ChunkTimeout { .. }
            | PipelineError::Cancelled { .. } => "alignment",
            PipelineError::Write { .. } => "output writing",
            PipelineError::Config(_) => "configuration",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::DatasetNotFound { path } => {
                write!(f, "Dataset not found: '{}'", path.display())
            }
            PipelineError::MalformedDataset { path, reason } => {
                write!(f, "Malformed dataset '{}': {}", path.display(), reason)
            }
            PipelineError::EmptySubset { filter, total } => write!(
                f,
                "Hole number filter '{}' matched none of the {} input reads",
                filter, total
            ),
            PipelineError::ChunkAlignment { chunk, reason } => {
                write!(f, "Alignment of {} failed: {}", chunk, reason)
            }
            PipelineError::ChunkTimeout { chunk, timeout } => write!(
                f,
                "Alignment of {} timed out after {}s",
                chunk,
                timeout.as_secs()
            ),
            PipelineError::Cancelled { chunk } => {
                write!(f, "Alignment of {} was cancelled", chunk)
            }
            PipelineError::Write { path, reason } => {
                write!(f, "Failed to write '{}': {}", path.display(), reason)
            }
            PipelineError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ChunkContext {
        ChunkContext {
            id: 2,
            first_hole_number: 30000,
            last_hole_number: 30500,
            reads: 17,
        }
    }

    #[test]
    fn test_chunk_errors_name_the_hole_number_range() {
        let err = PipelineError::chunk(&context(), "exit status: 3");
        let msg = err.to_string();
        assert!(msg.contains("chunk 2"));
        assert!(msg.contains("30000-30500"));
        assert!(msg.contains("exit status: 3"));
        assert_eq!(err.stage(), "alignment");
    }

    #[test]
    fn test_not_found_io_maps_to_dataset_not_found() {
        let err = PipelineError::from_dataset_io(
            Path::new("missing.fasta"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, PipelineError::DatasetNotFound { .. }));

        let err = PipelineError::from_dataset_io(
            Path::new("bad.fasta"),
            io::Error::new(io::ErrorKind::InvalidData, "garbage"),
        );
        assert!(matches!(err, PipelineError::MalformedDataset { .. }));
        assert_eq!(err.stage(), "dataset resolution");
    }

    #[test]
    fn test_cancellation_is_flagged() {
        let err = PipelineError::Cancelled { chunk: context() };
        assert!(err.is_cancellation());
        assert!(!PipelineError::Config("x".into()).is_cancellation());
    }
}
