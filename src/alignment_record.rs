use crate::read_set::{reverse_complement, Read};
use rust_htslib::bam::record::{Aux, Cigar, CigarString};
use rust_htslib::bam::{self, Record};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// SAM flag bits kept as provenance on a record. Unmapped and reverse bits are
/// derived from the placement instead.
pub const FLAG_UNMAPPED: u16 = 0x4;
pub const FLAG_REVERSE: u16 = 0x10;
pub const FLAG_SECONDARY: u16 = 0x100;
pub const FLAG_QC_FAIL: u16 = 0x200;
pub const FLAG_DUPLICATE: u16 = 0x400;
pub const FLAG_SUPPLEMENTARY: u16 = 0x800;

const PROVENANCE_FLAGS: u16 = FLAG_SECONDARY | FLAG_QC_FAIL | FLAG_DUPLICATE | FLAG_SUPPLEMENTARY;

/// Strand orientation for alignments
#[derive(Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Strand {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CigarOp {
    len: u32,
    op: char,
}

impl CigarOp {
    pub fn new(len: u32, op: char) -> Option<Self> {
        matches!(op, 'M' | 'I' | 'D' | 'N' | 'S' | 'H' | 'P' | '=' | 'X').then_some(CigarOp { len, op })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn op(&self) -> char {
        self.op
    }

    /// Whether the operation consumes reference bases
    pub fn consumes_reference(&self) -> bool {
        matches!(self.op, 'M' | 'D' | 'N' | '=' | 'X')
    }

    /// Whether the operation consumes aligned query bases (clips excluded)
    pub fn consumes_aligned_query(&self) -> bool {
        matches!(self.op, 'M' | 'I' | '=' | 'X')
    }

    /// Whether the operation places a read base on a reference base
    pub fn is_match(&self) -> bool {
        matches!(self.op, 'M' | '=' | 'X')
    }

    fn to_htslib(self) -> Cigar {
        match self.op {
            'M' => Cigar::Match(self.len),
            'I' => Cigar::Ins(self.len),
            'D' => Cigar::Del(self.len),
            'N' => Cigar::RefSkip(self.len),
            'S' => Cigar::SoftClip(self.len),
            'H' => Cigar::HardClip(self.len),
            'P' => Cigar::Pad(self.len),
            '=' => Cigar::Equal(self.len),
            _ => Cigar::Diff(self.len),
        }
    }
}

/// Parse a CIGAR string such as `10M2I5M`; `*` and the empty string give no operations
pub fn parse_cigar(cigar: &str) -> Result<Vec<CigarOp>, String> {
    if cigar == "*" || cigar.is_empty() {
        return Ok(Vec::new());
    }
    let mut ops = Vec::new();
    let mut len: u32 = 0;
    let mut has_digits = false;
    for c in cigar.chars() {
        if let Some(d) = c.to_digit(10) {
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(d))
                .ok_or_else(|| format!("CIGAR operation length overflow in '{}'", cigar))?;
            has_digits = true;
        } else {
            if !has_digits {
                return Err(format!("Invalid CIGAR format '{}'", cigar));
            }
            let op = CigarOp::new(len, c)
                .ok_or_else(|| format!("Unsupported CIGAR operation '{}' in '{}'", c, cigar))?;
            ops.push(op);
            len = 0;
            has_digits = false;
        }
    }
    if has_digits {
        return Err(format!("Invalid CIGAR format '{}'", cigar));
    }
    Ok(ops)
}

pub fn format_cigar(ops: &[CigarOp]) -> String {
    if ops.is_empty() {
        return "*".to_string();
    }
    ops.iter().map(|op| format!("{}{}", op.len(), op.op())).collect()
}

/// Where a mapped record sits on the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Index into the run's reference set (declaration order)
    pub reference_id: usize,
    /// 1-based leftmost mapped position
    pub position: u64,
    pub strand: Strand,
}

/// One read mapped (or unmapped) against the reference.
///
/// A mapped record always has a placement; an unmapped record has none. The
/// stored sequence follows SAM conventions: reverse-strand records hold the
/// reverse complement of the read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentRecord {
    pub name: String,
    pub hole_number: u64,
    pub placement: Option<Placement>,
    pub cigar: Vec<CigarOp>,
    pub mapq: u8,
    /// Provenance flags (secondary, supplementary, duplicate, QC fail)
    pub flags: u16,
    pub sequence: Vec<u8>,
    pub qualities: Option<Vec<u8>>,
    pub read_group: Option<String>,
    pub edit_distance: Option<u32>,
}

impl AlignmentRecord {
    /// An unmapped record carrying the read as-is
    pub fn unmapped(read: &Read) -> Self {
        AlignmentRecord {
            name: read.name.clone(),
            hole_number: read.hole_number,
            placement: None,
            cigar: Vec::new(),
            mapq: 0,
            flags: 0,
            sequence: read.sequence.clone(),
            qualities: read.qualities.clone(),
            read_group: read.read_group.clone(),
            edit_distance: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.placement.is_some()
    }

    pub fn is_secondary(&self) -> bool {
        self.flags & FLAG_SECONDARY != 0
    }

    pub fn is_supplementary(&self) -> bool {
        self.flags & FLAG_SUPPLEMENTARY != 0
    }

    pub fn is_duplicate(&self) -> bool {
        self.flags & FLAG_DUPLICATE != 0
    }

    /// Primary records represent the read itself; there is exactly one per read
    pub fn is_primary(&self) -> bool {
        !self.is_secondary() && !self.is_supplementary()
    }

    pub fn strand(&self) -> Strand {
        self.placement.map(|p| p.strand).unwrap_or_default()
    }

    /// Full SAM flag word
    pub fn sam_flags(&self) -> u16 {
        let mut flags = self.flags & PROVENANCE_FLAGS;
        match self.placement {
            None => flags |= FLAG_UNMAPPED,
            Some(p) if p.strand == Strand::Reverse => flags |= FLAG_REVERSE,
            Some(_) => {}
        }
        flags
    }

    /// Number of reference bases covered by the alignment
    pub fn reference_span(&self) -> u64 {
        self.cigar
            .iter()
            .filter(|op| op.consumes_reference())
            .map(|op| op.len() as u64)
            .sum()
    }

    /// Number of read bases taking part in the alignment
    pub fn aligned_query_length(&self) -> u64 {
        self.cigar
            .iter()
            .filter(|op| op.consumes_aligned_query())
            .map(|op| op.len() as u64)
            .sum()
    }

    /// 1-based closed reference interval covered by a mapped record
    pub fn reference_interval(&self) -> Option<(usize, u64, u64)> {
        let p = self.placement?;
        let span = self.reference_span().max(1);
        Some((p.reference_id, p.position, p.position + span - 1))
    }

    /// Sequence and qualities in the read's original orientation
    pub fn original_orientation(&self) -> (Vec<u8>, Option<Vec<u8>>) {
        if self.strand() == Strand::Reverse {
            let qualities = self.qualities.as_ref().map(|q| q.iter().rev().copied().collect());
            (reverse_complement(&self.sequence), qualities)
        } else {
            (self.sequence.clone(), self.qualities.clone())
        }
    }

    /// Turn a mapped record into an unmapped one, keeping the read itself
    pub fn demote_to_unmapped(&mut self) {
        let (sequence, qualities) = self.original_orientation();
        self.sequence = sequence;
        self.qualities = qualities;
        self.placement = None;
        self.cigar.clear();
        self.mapq = 0;
        self.edit_distance = None;
    }

    /// Fill in SEQ/QUAL from the input read when the aligner left them out
    pub fn restore_sequence(&mut self, read: &Read) {
        if !self.sequence.is_empty() {
            return;
        }
        if self.strand() == Strand::Reverse {
            self.sequence = reverse_complement(&read.sequence);
            self.qualities = read
                .qualities
                .as_ref()
                .map(|q| q.iter().rev().copied().collect());
        } else {
            self.sequence = read.sequence.clone();
            self.qualities = read.qualities.clone();
        }
    }

    /// Convert an htslib record. `reference_ids` maps the record's header target id
    /// to an index in the caller's reference set.
    pub fn from_bam_record(
        record: &Record,
        reference_ids: &[Option<usize>],
        fallback_hole_number: u64,
    ) -> Result<Self, String> {
        let name = String::from_utf8_lossy(record.qname()).into_owned();

        let placement = if record.is_unmapped() || record.tid() < 0 {
            None
        } else {
            let tid = record.tid() as usize;
            let reference_id = reference_ids.get(tid).copied().flatten().ok_or_else(|| {
                format!("record '{}' references unknown target id {}", name, tid)
            })?;
            if record.pos() < 0 {
                return Err(format!("mapped record '{}' has no position", name));
            }
            Some(Placement {
                reference_id,
                position: record.pos() as u64 + 1,
                strand: if record.is_reverse() {
                    Strand::Reverse
                } else {
                    Strand::Forward
                },
            })
        };

        let cigar = if placement.is_some() {
            record
                .cigar()
                .iter()
                .map(|c| {
                    CigarOp::new(c.len(), c.char())
                        .ok_or_else(|| format!("unsupported CIGAR operation in '{}'", name))
                })
                .collect::<Result<Vec<_>, String>>()?
        } else {
            Vec::new()
        };
        if placement.is_some() && cigar.is_empty() {
            return Err(format!("mapped record '{}' has no CIGAR", name));
        }

        let qual = record.qual();
        let qualities = if qual.is_empty() || qual[0] == 255 {
            None
        } else {
            Some(qual.to_vec())
        };

        let hole_number = aux_integer(record, b"zm")
            .and_then(|v| u64::try_from(v).ok())
            .or_else(|| crate::read_set::parse_read_name(&name).map(|(_, hole)| hole))
            .unwrap_or(fallback_hole_number);

        let read_group = match record.aux(b"RG") {
            Ok(Aux::String(rg)) => Some(rg.to_string()),
            _ => None,
        };

        Ok(AlignmentRecord {
            name,
            hole_number,
            placement,
            cigar,
            mapq: if placement.is_some() { record.mapq() } else { 0 },
            flags: record.flags() & PROVENANCE_FLAGS,
            sequence: record.seq().as_bytes(),
            qualities,
            read_group,
            edit_distance: aux_integer(record, b"NM").and_then(|v| u32::try_from(v).ok()),
        })
    }

    /// Convert to an htslib record for writing
    pub fn to_bam_record(&self) -> Result<Record, String> {
        let mut record = bam::Record::new();
        let cigar = CigarString(self.cigar.iter().map(|op| op.to_htslib()).collect());
        let qualities = match &self.qualities {
            Some(q) if q.len() == self.sequence.len() => q.clone(),
            _ => vec![255u8; self.sequence.len()],
        };
        record.set(self.name.as_bytes(), Some(&cigar), &self.sequence, &qualities);

        match self.placement {
            Some(p) => {
                let tid = i32::try_from(p.reference_id)
                    .map_err(|_| format!("reference id {} out of range", p.reference_id))?;
                record.set_tid(tid);
                record.set_pos(p.position as i64 - 1);
                record.set_mapq(self.mapq);
            }
            None => {
                record.set_tid(-1);
                record.set_pos(-1);
                record.set_mapq(0);
            }
        }
        record.set_mtid(-1);
        record.set_mpos(-1);
        record.set_insert_size(0);
        record.set_flags(self.sam_flags());

        if let Some(rg) = &self.read_group {
            record
                .push_aux(b"RG", Aux::String(rg))
                .map_err(|e| format!("failed to set RG on '{}': {}", self.name, e))?;
        }
        if let Ok(hole) = u32::try_from(self.hole_number) {
            record
                .push_aux(b"zm", Aux::U32(hole))
                .map_err(|e| format!("failed to set zm on '{}': {}", self.name, e))?;
        }
        if let Some(nm) = self.edit_distance {
            record
                .push_aux(b"NM", Aux::U32(nm))
                .map_err(|e| format!("failed to set NM on '{}': {}", self.name, e))?;
        }
        Ok(record)
    }
}

fn aux_integer(record: &Record, tag: &[u8]) -> Option<i64> {
    match record.aux(tag).ok()? {
        Aux::I8(v) => Some(v as i64),
        Aux::U8(v) => Some(v as i64),
        Aux::I16(v) => Some(v as i64),
        Aux::U16(v) => Some(v as i64),
        Aux::I32(v) => Some(v as i64),
        Aux::U32(v) => Some(v as i64),
        _ => None,
    }
}

/// Global output order: mapped records by reference declaration order then
/// position, unmapped records trailing. Ties break on hole number, then the
/// natural order of read names, then flags, strand and CIGAR so the order is total.
pub fn coordinate_cmp(a: &AlignmentRecord, b: &AlignmentRecord) -> Ordering {
    coordinate_key(a)
        .cmp(&coordinate_key(b))
        .then(a.hole_number.cmp(&b.hole_number))
        .then_with(|| natord::compare(&a.name, &b.name))
        .then_with(|| a.name.cmp(&b.name))
        .then(a.flags.cmp(&b.flags))
        .then(a.strand().cmp(&b.strand()))
        .then_with(|| a.cigar.cmp(&b.cigar))
}

/// (unmapped, reference id, position); the part of the order an index relies on
pub fn coordinate_key(record: &AlignmentRecord) -> (bool, usize, u64) {
    match record.placement {
        Some(p) => (false, p.reference_id, p.position),
        None => (true, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(name: &str, hole: u64, reference_id: usize, position: u64) -> AlignmentRecord {
        AlignmentRecord {
            name: name.to_string(),
            hole_number: hole,
            placement: Some(Placement {
                reference_id,
                position,
                strand: Strand::Forward,
            }),
            cigar: parse_cigar("4M").unwrap(),
            mapq: 60,
            flags: 0,
            sequence: b"ACGT".to_vec(),
            qualities: None,
            read_group: None,
            edit_distance: None,
        }
    }

    #[test]
    fn test_parse_and_format_cigar() {
        let ops = parse_cigar("5S10M2I3D1=1X").unwrap();
        assert_eq!(ops.len(), 6);
        assert_eq!(format_cigar(&ops), "5S10M2I3D1=1X");
        assert!(parse_cigar("*").unwrap().is_empty());
        assert_eq!(format_cigar(&[]), "*");
        assert!(parse_cigar("10").is_err());
        assert!(parse_cigar("M").is_err());
        assert!(parse_cigar("3Q").is_err());
    }

    #[test]
    fn test_spans() {
        let mut record = mapped("m/1/0_20", 1, 0, 100);
        record.cigar = parse_cigar("5S10M2I3D2N1=1X").unwrap();
        assert_eq!(record.reference_span(), 10 + 3 + 2 + 1 + 1);
        assert_eq!(record.aligned_query_length(), 10 + 2 + 1 + 1);
        assert_eq!(record.reference_interval(), Some((0, 100, 116)));
    }

    #[test]
    fn test_flags_follow_placement() {
        let mut record = mapped("m/1/0_4", 1, 0, 10);
        assert_eq!(record.sam_flags(), 0);
        record.placement.as_mut().unwrap().strand = Strand::Reverse;
        record.flags = FLAG_SECONDARY | FLAG_UNMAPPED;
        // the unmapped bit is never taken from provenance
        assert_eq!(record.sam_flags(), FLAG_SECONDARY | FLAG_REVERSE);
        assert!(!record.is_primary());

        record.demote_to_unmapped();
        assert_eq!(record.sam_flags(), FLAG_SECONDARY | FLAG_UNMAPPED);
    }

    #[test]
    fn test_demote_restores_orientation() {
        let mut record = mapped("m/1/0_4", 1, 0, 10);
        record.placement.as_mut().unwrap().strand = Strand::Reverse;
        record.sequence = b"AACG".to_vec();
        record.qualities = Some(vec![1, 2, 3, 4]);
        record.demote_to_unmapped();
        assert_eq!(record.sequence, b"CGTT".to_vec());
        assert_eq!(record.qualities, Some(vec![4, 3, 2, 1]));
        assert!(record.cigar.is_empty());
        assert_eq!(record.placement, None);
    }

    #[test]
    fn test_restore_sequence_from_read() {
        let read = Read::new("m/1/0_4".into(), b"AACG".to_vec(), Some(vec![1, 2, 3, 4]), 0);
        let mut record = mapped("m/1/0_4", 1, 0, 10);
        record.sequence.clear();
        record.placement.as_mut().unwrap().strand = Strand::Reverse;
        record.restore_sequence(&read);
        assert_eq!(record.sequence, b"CGTT".to_vec());
        assert_eq!(record.qualities, Some(vec![4, 3, 2, 1]));
    }

    #[test]
    fn test_coordinate_order() {
        let a = mapped("m/5/0_4", 5, 0, 200);
        let b = mapped("m/3/0_4", 3, 1, 10);
        let c = mapped("m/2/0_4", 2, 0, 200);
        let u = AlignmentRecord::unmapped(&Read::new("m/1/0_4".into(), b"ACGT".to_vec(), None, 0));

        let mut records = vec![u.clone(), b.clone(), a.clone(), c.clone()];
        records.sort_by(coordinate_cmp);
        // reference 0 before reference 1, same position broken by hole number, unmapped last
        assert_eq!(records, vec![c, a, b, u]);
    }

    #[test]
    fn test_natural_name_tie_break() {
        let mut a = mapped("m/7/10_20", 7, 0, 5);
        let mut b = mapped("m/7/9_20", 7, 0, 5);
        a.hole_number = 7;
        b.hole_number = 7;
        assert_eq!(coordinate_cmp(&b, &a), Ordering::Less);
    }

    #[test]
    fn test_bam_record_conversion() {
        let mut record = mapped("m/9/0_4", 9, 1, 37);
        record.read_group = Some("m".to_string());
        record.edit_distance = Some(2);
        record.qualities = Some(vec![30, 31, 32, 33]);
        let bam_record = record.to_bam_record().unwrap();
        assert_eq!(bam_record.tid(), 1);
        assert_eq!(bam_record.pos(), 36);
        assert_eq!(bam_record.mapq(), 60);

        let ids = vec![Some(0), Some(1)];
        let back = AlignmentRecord::from_bam_record(&bam_record, &ids, 0).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_bam_record_unknown_target_is_rejected() {
        let record = mapped("m/9/0_4", 9, 1, 37).to_bam_record().unwrap();
        let ids = vec![Some(0), None];
        assert!(AlignmentRecord::from_bam_record(&record, &ids, 0).is_err());
    }
}
