use crate::error::{PipelineError, Result};
use crate::read_set::ReadSet;
use log::{debug, info};
use std::fmt;
use std::path::Path;

/// Filter for selecting reads by hole number.
///
/// Holds a canonical list of closed ranges: sorted, with overlapping and
/// adjacent ranges merged. An empty filter selects every read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoleNumberFilter {
    ranges: Vec<(u64, u64)>,
}

impl HoleNumberFilter {
    /// Parse comma separated closed ranges such as `1-1000,30000-30500,42`
    pub fn parse(list: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            ranges.push(parse_range(part)?);
        }
        Ok(Self::from_ranges(ranges))
    }

    /// Build a filter from arbitrary ranges, normalizing them
    pub fn from_ranges(mut ranges: Vec<(u64, u64)>) -> Self {
        ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        HoleNumberFilter { ranges: merged }
    }

    /// Resolve the `--holeNumbers` argument: either a range list or the path of a
    /// file holding ranges (one or more per line, `#` comments allowed)
    pub fn from_arg(arg: Option<&str>) -> Result<Self> {
        let Some(arg) = arg else {
            return Ok(Self::default());
        };
        if Path::new(arg).is_file() {
            load_hole_number_filter(Path::new(arg))
        } else {
            Self::parse(arg)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Check if a hole number falls inside the filter (always true for an empty filter)
    pub fn matches(&self, hole_number: u64) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|&(start, _)| start <= hole_number);
        idx > 0 && hole_number <= self.ranges[idx - 1].1
    }
}

impl fmt::Display for HoleNumberFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|&(s, e)| {
                if s == e {
                    s.to_string()
                } else {
                    format!("{}-{}", s, e)
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

fn parse_range(part: &str) -> Result<(u64, u64)> {
    let invalid = |reason: &str| {
        PipelineError::Config(format!("invalid hole number range '{}': {}", part, reason))
    };
    let (start, end) = match part.split_once('-') {
        Some((s, e)) => (s.trim(), e.trim()),
        None => (part, part),
    };
    let start = start.parse::<u64>().map_err(|_| invalid("invalid start value"))?;
    let end = end.parse::<u64>().map_err(|_| invalid("invalid end value"))?;
    if start > end {
        return Err(invalid("start value must not exceed end value"));
    }
    Ok((start, end))
}

/// Load a hole number filter from a file
pub fn load_hole_number_filter(path: &Path) -> Result<HoleNumberFilter> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Config(format!(
            "Failed to read hole number list '{}': {}",
            path.display(),
            e
        ))
    })?;

    let mut ranges = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        ranges.extend(HoleNumberFilter::parse(trimmed)?.ranges);
    }
    if ranges.is_empty() {
        return Err(PipelineError::Config(format!(
            "Hole number list '{}' did not contain any ranges",
            path.display()
        )));
    }

    Ok(HoleNumberFilter::from_ranges(ranges))
}

/// Apply the filter to a read set, preserving order. A non-empty filter that
/// selects nothing is an error: an empty alignment run is a misconfiguration.
pub fn apply_hole_number_filter(reads: &mut ReadSet, filter: &HoleNumberFilter) -> Result<()> {
    if filter.is_empty() {
        return Ok(());
    }

    let before = reads.len();
    reads.retain(|read| filter.matches(read.hole_number));

    let filtered_out = before.saturating_sub(reads.len());
    debug!(
        "Filtered out {} reads outside hole numbers {}",
        filtered_out, filter
    );

    if reads.is_empty() {
        return Err(PipelineError::EmptySubset {
            filter: filter.to_string(),
            total: before,
        });
    }
    info!(
        "Selected {} of {} reads with hole numbers {}",
        reads.len(),
        before,
        filter
    );
    Ok(())
}
