use crate::error::{PipelineError, Result};
use regex::Regex;
use rustc_hash::FxHashSet;
use std::path::Path;
use std::sync::OnceLock;

/// A single sequencing read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub name: String,
    pub hole_number: u64,
    pub sequence: Vec<u8>,
    /// Phred values (no ASCII offset)
    pub qualities: Option<Vec<u8>>,
    pub read_group: Option<String>,
}

impl Read {
    /// Build a read from its name, taking the hole number from a PacBio-style
    /// `movie/hole/...` name and falling back to `ordinal` otherwise.
    pub fn new(name: String, sequence: Vec<u8>, qualities: Option<Vec<u8>>, ordinal: u64) -> Self {
        let (read_group, hole_number) = match parse_read_name(&name) {
            Some((movie, hole)) => (Some(movie.to_string()), hole),
            None => (None, ordinal),
        };
        Read {
            name,
            hole_number,
            sequence,
            qualities,
            read_group,
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// `@RG` header entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroup {
    pub id: String,
    pub platform_unit: Option<String>,
    pub description: Option<String>,
}

impl ReadGroup {
    pub fn for_movie(movie: &str) -> Self {
        ReadGroup {
            id: movie.to_string(),
            platform_unit: Some(movie.to_string()),
            description: None,
        }
    }
}

/// Ordered reads with unique names plus the read groups they belong to
#[derive(Debug, Clone, Default)]
pub struct ReadSet {
    reads: Vec<Read>,
    read_groups: Vec<ReadGroup>,
}

impl ReadSet {
    /// Build a read set, rejecting duplicate read names. Read groups referenced by
    /// reads but missing from `read_groups` are added with the group id as movie.
    pub fn new(reads: Vec<Read>, mut read_groups: Vec<ReadGroup>, origin: &Path) -> Result<Self> {
        let mut names: FxHashSet<&str> = FxHashSet::default();
        names.reserve(reads.len());
        for read in &reads {
            if !names.insert(read.name.as_str()) {
                return Err(PipelineError::malformed(
                    origin,
                    format!("duplicate read name '{}'", read.name),
                ));
            }
        }

        let mut known: FxHashSet<String> = read_groups.iter().map(|rg| rg.id.clone()).collect();
        for read in &reads {
            if let Some(rg) = &read.read_group {
                if known.insert(rg.clone()) {
                    read_groups.push(ReadGroup::for_movie(rg));
                }
            }
        }

        Ok(ReadSet { reads, read_groups })
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    pub fn reads(&self) -> &[Read] {
        &self.reads
    }

    /// Keep only reads matching `keep`, preserving order; read groups no longer
    /// referenced are dropped.
    pub fn retain<F: FnMut(&Read) -> bool>(&mut self, keep: F) {
        self.reads.retain(keep);
        let used: FxHashSet<&str> = self
            .reads
            .iter()
            .filter_map(|r| r.read_group.as_deref())
            .collect();
        self.read_groups.retain(|rg| used.contains(rg.id.as_str()));
    }

    pub fn read_groups(&self) -> &[ReadGroup] {
        &self.read_groups
    }

    pub fn into_parts(self) -> (Vec<Read>, Vec<ReadGroup>) {
        (self.reads, self.read_groups)
    }
}

fn read_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^/\s]+)/(\d+)(?:/\S*)?$").expect("valid read name regex"))
}

/// Split a PacBio read name `movie/hole[/start_end|/ccs]` into movie and hole number
pub fn parse_read_name(name: &str) -> Option<(&str, u64)> {
    let caps = read_name_regex().captures(name)?;
    let movie = caps.get(1)?.as_str();
    let hole = caps.get(2)?.as_str().parse::<u64>().ok()?;
    Some((movie, hole))
}

/// Parse the `@RG` lines of a SAM header text
pub fn parse_read_groups(header_text: &str) -> Vec<ReadGroup> {
    header_text
        .lines()
        .filter(|line| line.starts_with("@RG\t"))
        .filter_map(|line| {
            let mut id = None;
            let mut platform_unit = None;
            let mut description = None;
            for field in line.split('\t').skip(1) {
                if let Some(v) = field.strip_prefix("ID:") {
                    id = Some(v.to_string());
                } else if let Some(v) = field.strip_prefix("PU:") {
                    platform_unit = Some(v.to_string());
                } else if let Some(v) = field.strip_prefix("DS:") {
                    description = Some(v.to_string());
                }
            }
            id.map(|id| ReadGroup {
                id,
                platform_unit,
                description,
            })
        })
        .collect()
}

pub fn reverse_complement(sequence: &[u8]) -> Vec<u8> {
    sequence
        .iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'T' => b'A',
            b'C' => b'G',
            b'G' => b'C',
            b'a' => b't',
            b't' => b'a',
            b'c' => b'g',
            b'g' => b'c',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_name_variants() {
        assert_eq!(
            parse_read_name("m150404_101626_42267_c1008_s1_p0/30012/0_1534"),
            Some(("m150404_101626_42267_c1008_s1_p0", 30012))
        );
        assert_eq!(parse_read_name("movie/7/ccs"), Some(("movie", 7)));
        assert_eq!(parse_read_name("movie/7"), Some(("movie", 7)));
        assert_eq!(parse_read_name("read_7"), None);
        assert_eq!(parse_read_name("movie/abc/0_10"), None);
    }

    #[test]
    fn test_read_new_falls_back_to_ordinal() {
        let read = Read::new("plain".to_string(), b"ACGT".to_vec(), None, 41);
        assert_eq!(read.hole_number, 41);
        assert_eq!(read.read_group, None);

        let read = Read::new("mov/12/0_4".to_string(), b"ACGT".to_vec(), None, 41);
        assert_eq!(read.hole_number, 12);
        assert_eq!(read.read_group.as_deref(), Some("mov"));
    }

    #[test]
    fn test_read_set_rejects_duplicate_names() {
        let reads = vec![
            Read::new("m/1/0_4".into(), b"ACGT".to_vec(), None, 0),
            Read::new("m/1/0_4".into(), b"ACGT".to_vec(), None, 1),
        ];
        let err = ReadSet::new(reads, vec![], Path::new("in.fasta")).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedDataset { .. }));
    }

    #[test]
    fn test_read_set_adds_and_prunes_read_groups() {
        let reads = vec![
            Read::new("a/1/0_4".into(), b"ACGT".to_vec(), None, 0),
            Read::new("b/2/0_4".into(), b"ACGT".to_vec(), None, 1),
        ];
        let header_groups = vec![ReadGroup {
            id: "a".into(),
            platform_unit: Some("a".into()),
            description: Some("BINDINGKIT=1".into()),
        }];
        let mut set = ReadSet::new(reads, header_groups, Path::new("x")).unwrap();
        assert_eq!(set.read_groups().len(), 2);
        assert_eq!(set.read_groups()[1], ReadGroup::for_movie("b"));

        set.retain(|r| r.hole_number == 1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.read_groups().len(), 1);
        assert_eq!(set.read_groups()[0].description.as_deref(), Some("BINDINGKIT=1"));
    }

    #[test]
    fn test_parse_read_groups_from_header() {
        let header = "@HD\tVN:1.6\n@RG\tID:abc\tPU:movie1\tDS:READTYPE=SUBREAD\n@RG\tPU:orphan\n";
        let groups = parse_read_groups(header);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "abc");
        assert_eq!(groups[0].platform_unit.as_deref(), Some("movie1"));
        assert_eq!(groups[0].description.as_deref(), Some("READTYPE=SUBREAD"));
    }

    #[test]
    fn test_reverse_complement() {
        assert_eq!(reverse_complement(b"AACGTN"), b"NACGTT".to_vec());
        assert_eq!(reverse_complement(b"acg"), b"cgt".to_vec());
    }
}
