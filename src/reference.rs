use crate::error::{PipelineError, Result};
use log::debug;
use rust_htslib::faidx;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSequence {
    pub name: String,
    pub length: u64,
}

/// Named reference sequences in FASTA declaration order
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    fasta_path: PathBuf,
    sequences: Vec<ReferenceSequence>,
    name_to_id: FxHashMap<String, usize>,
}

impl ReferenceSet {
    /// Load sequence names and lengths from the FASTA's `.fai`, creating the
    /// index through htslib when it does not exist yet.
    pub fn from_fasta(fasta_path: &Path) -> Result<Self> {
        if !fasta_path.is_file() {
            return Err(PipelineError::DatasetNotFound {
                path: fasta_path.to_path_buf(),
            });
        }

        // aligners run inside the work directory, so keep an absolute path
        let fasta_path = &fasta_path
            .canonicalize()
            .map_err(|e| PipelineError::from_dataset_io(fasta_path, e))?;
        let fai_path = PathBuf::from(format!("{}.fai", fasta_path.display()));

        // Try to open the .fai file, if it doesn't exist, try to create it
        let fai_content = match std::fs::read_to_string(&fai_path) {
            Ok(content) => content,
            Err(_) => {
                debug!("Creating FASTA index for '{}'", fasta_path.display());
                faidx::Reader::from_path(fasta_path).map_err(|e| {
                    PipelineError::malformed(
                        fasta_path,
                        format!("failed to create FASTA index: {}", e),
                    )
                })?;
                std::fs::read_to_string(&fai_path)
                    .map_err(|e| PipelineError::from_dataset_io(&fai_path, e))?
            }
        };

        let sequences = parse_fai(&fai_content).map_err(|reason| {
            PipelineError::malformed(fasta_path, reason)
        })?;
        Self::new(fasta_path.to_path_buf(), sequences)
    }

    pub fn new(fasta_path: PathBuf, sequences: Vec<ReferenceSequence>) -> Result<Self> {
        if sequences.is_empty() {
            return Err(PipelineError::malformed(
                &fasta_path,
                "reference contains no sequences",
            ));
        }
        let mut name_to_id = FxHashMap::default();
        for (id, seq) in sequences.iter().enumerate() {
            if name_to_id.insert(seq.name.clone(), id).is_some() {
                return Err(PipelineError::malformed(
                    &fasta_path,
                    format!("duplicate reference sequence '{}'", seq.name),
                ));
            }
        }
        Ok(ReferenceSet {
            fasta_path,
            sequences,
            name_to_id,
        })
    }

    pub fn fasta_path(&self) -> &Path {
        &self.fasta_path
    }

    pub fn sequences(&self) -> &[ReferenceSequence] {
        &self.sequences
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get_id(&self, name: &str) -> Option<usize> {
        self.name_to_id.get(name).copied()
    }

    pub fn get_name(&self, id: usize) -> Option<&str> {
        self.sequences.get(id).map(|s| s.name.as_str())
    }

    pub fn total_length(&self) -> u64 {
        self.sequences.iter().map(|s| s.length).sum()
    }
}

/// Parse the name and length columns of a `.fai` file
fn parse_fai(content: &str) -> std::result::Result<Vec<ReferenceSequence>, String> {
    let mut sequences = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 2 || fields[0].is_empty() {
            return Err(format!("invalid .fai line '{}'", line));
        }
        let length = fields[1]
            .parse::<u64>()
            .map_err(|e| format!("invalid sequence length in .fai line '{}': {}", line, e))?;
        sequences.push(ReferenceSequence {
            name: fields[0].to_string(),
            length,
        });
    }
    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_reference_from_fasta_builds_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let fasta = dir.path().join("ref.fasta");
        let mut f = std::fs::File::create(&fasta).unwrap();
        writeln!(f, ">chrB desc\nACGTACGTAC\nGT\n>chrA\nAAAA").unwrap();
        drop(f);

        let reference = ReferenceSet::from_fasta(&fasta).unwrap();
        assert_eq!(reference.len(), 2);
        // declaration order, not sorted order
        assert_eq!(reference.get_name(0), Some("chrB"));
        assert_eq!(reference.sequences()[0].length, 12);
        assert_eq!(reference.get_id("chrA"), Some(1));
        assert_eq!(reference.total_length(), 16);
        assert!(dir.path().join("ref.fasta.fai").exists());
    }

    #[test]
    fn test_missing_reference() {
        let err = ReferenceSet::from_fasta(Path::new("/nonexistent/ref.fasta")).unwrap_err();
        assert!(matches!(err, PipelineError::DatasetNotFound { .. }));
    }

    #[test]
    fn test_parse_fai_rejects_garbage() {
        assert!(parse_fai("chr1\tabc\t0\t60\t61\n").is_err());
        assert_eq!(parse_fai("chr1\t100\t6\t60\t61\n").unwrap()[0].length, 100);
    }

    #[test]
    fn test_duplicate_reference_names() {
        let seqs = vec![
            ReferenceSequence { name: "a".into(), length: 1 },
            ReferenceSequence { name: "a".into(), length: 2 },
        ];
        assert!(ReferenceSet::new(PathBuf::from("r.fa"), seqs).is_err());
        assert!(ReferenceSet::new(PathBuf::from("r.fa"), vec![]).is_err());
    }
}
