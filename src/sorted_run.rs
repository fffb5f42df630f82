use crate::alignment_record::AlignmentRecord;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const RUN_MAGIC: &[u8; 8] = b"PBRUN001";

/// A chunk's records in output order, spilled to disk until the merge
#[derive(Debug, Clone)]
pub struct SortedRun {
    path: PathBuf,
    records: u64,
}

impl SortedRun {
    /// Write already sorted records to `path`
    pub fn write(path: &Path, records: &[AlignmentRecord]) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(RUN_MAGIC)?;
        writer.write_all(&(records.len() as u64).to_le_bytes())?;
        for record in records {
            bincode::serde::encode_into_std_write(record, &mut writer, bincode::config::standard())
                .map_err(io::Error::other)?;
        }
        writer.flush()?;
        Ok(SortedRun {
            path: path.to_path_buf(),
            records: records.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Stream the records back in the order they were written
    pub fn reader(&self) -> io::Result<RunReader> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != RUN_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid magic bytes in {:?}", self.path),
            ));
        }
        let mut count = [0u8; 8];
        reader.read_exact(&mut count)?;
        let remaining = u64::from_le_bytes(count);
        if remaining != self.records {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Run {:?} holds {} records, expected {}",
                    self.path, remaining, self.records
                ),
            ));
        }
        Ok(RunReader { reader, remaining })
    }
}

pub struct RunReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl Iterator for RunReader {
    type Item = io::Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let record = bincode::serde::decode_from_std_read(&mut self.reader, bincode::config::standard())
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Failed to decode sorted run record: {e}"),
                )
            });
        if record.is_err() {
            self.remaining = 0;
        }
        Some(record)
    }
}
