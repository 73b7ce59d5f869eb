#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CellGid(pub u32);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CellLid(pub u32);

impl std::fmt::Display for CellGid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for CellLid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully resolved endpoint: a specific source or target item on a cell.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct CellAddress {
    pub gid: CellGid,
    pub lid: CellLid,
}

impl CellAddress {
    pub fn new(gid: u32, lid: u32) -> Self {
        Self {
            gid: CellGid(gid),
            lid: CellLid(lid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CellKind {
    Cable,
    Lif,
    SpikeSource,
    Benchmark,
}

pub fn cell_kind_code(kind: CellKind) -> u8 {
    match kind {
        CellKind::Cable => 0,
        CellKind::Lif => 1,
        CellKind::SpikeSource => 2,
        CellKind::Benchmark => 3,
    }
}

/// Simulation time in milliseconds.
pub type TimeMs = f64;

/// Gids at or above this bound are reserved for sources external to the
/// simulation and may not be used by recipe cells.
pub const MAX_SOURCE_GID: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    pub source: CellAddress,
    pub time: TimeMs,
}

impl Spike {
    pub fn new(source: CellAddress, time: TimeMs) -> Self {
        Self { source, time }
    }
}

/// One half-epoch of the integration loop: the closed-open time interval
/// `[t0, t1)` with a monotonically increasing id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Epoch {
    pub id: u64,
    pub t0: TimeMs,
    pub t1: TimeMs,
}

impl Epoch {
    pub fn new(id: u64, t0: TimeMs, t1: TimeMs) -> Self {
        Self { id, t0, t1 }
    }

    pub fn duration(&self) -> TimeMs {
        self.t1 - self.t0
    }
}

/// An event to be delivered to a target item on some cell of the owning
/// group: apply `weight` at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeEvent {
    pub target: CellLid,
    pub time: TimeMs,
    pub weight: f32,
}

impl SpikeEvent {
    pub fn new(target: CellLid, time: TimeMs, weight: f32) -> Self {
        Self {
            target,
            time,
            weight,
        }
    }
}

/// Delivery order within a queue: time, then target lid, then weight, so
/// that runs are reproducible when times tie.
pub fn event_order(a: &SpikeEvent, b: &SpikeEvent) -> std::cmp::Ordering {
    (a.time, a.target, a.weight)
        .partial_cmp(&(b.time, b.target, b.weight))
        .expect("event times and weights are finite")
}

/// Prefix-sum index over a vector of counts. The result has one more entry
/// than the input, starting at zero and ending at the total.
pub fn make_index(counts: &[usize]) -> Vec<usize> {
    let mut index = Vec::with_capacity(counts.len() + 1);
    let mut sum = 0usize;
    index.push(0);
    for &count in counts {
        sum += count;
        index.push(sum);
    }
    index
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("partition must start at 0, starts at {0}")]
    BadStart(usize),
    #[error("partition entry {index} decreases from {prev} to {next}")]
    NotMonotonic {
        index: usize,
        prev: usize,
        next: usize,
    },
    #[error("partition ends at {end}, expected {expected}")]
    BadEnd { end: usize, expected: usize },
}

/// A valid partition is a non-decreasing sequence from 0 to `total`.
pub fn validate_partition(part: &[usize], total: usize) -> Result<(), PartitionError> {
    match part.first() {
        Some(&first) if first != 0 => return Err(PartitionError::BadStart(first)),
        None => return Err(PartitionError::BadStart(0)),
        _ => {}
    }
    for (index, window) in part.windows(2).enumerate() {
        if window[1] < window[0] {
            return Err(PartitionError::NotMonotonic {
                index,
                prev: window[0],
                next: window[1],
            });
        }
    }
    let end = *part.last().unwrap_or(&0);
    if end != total {
        return Err(PartitionError::BadEnd {
            end,
            expected: total,
        });
    }
    Ok(())
}

pub fn update_u8(hasher: &mut blake3::Hasher, value: u8) {
    hasher.update(&[value]);
}

pub fn update_u16(hasher: &mut blake3::Hasher, value: u16) {
    hasher.update(&value.to_le_bytes());
}

pub fn update_u32(hasher: &mut blake3::Hasher, value: u32) {
    hasher.update(&value.to_le_bytes());
}

pub fn update_u64(hasher: &mut blake3::Hasher, value: u64) {
    hasher.update(&value.to_le_bytes());
}

pub fn update_f32(hasher: &mut blake3::Hasher, value: f32) {
    hasher.update(&value.to_bits().to_le_bytes());
}

pub fn update_f64(hasher: &mut blake3::Hasher, value: f64) {
    hasher.update(&value.to_bits().to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_index_is_prefix_sum() {
        assert_eq!(make_index(&[]), vec![0]);
        assert_eq!(make_index(&[3, 0, 2]), vec![0, 3, 3, 5]);
    }

    #[test]
    fn partition_validation() {
        assert!(validate_partition(&[0, 3, 3, 5], 5).is_ok());
        assert_eq!(
            validate_partition(&[1, 3], 3),
            Err(PartitionError::BadStart(1))
        );
        assert_eq!(
            validate_partition(&[0, 3, 2], 2),
            Err(PartitionError::NotMonotonic {
                index: 1,
                prev: 3,
                next: 2
            })
        );
        assert_eq!(
            validate_partition(&[0, 4], 5),
            Err(PartitionError::BadEnd {
                end: 4,
                expected: 5
            })
        );
    }

    #[test]
    fn address_ordering_is_gid_then_lid() {
        let a = CellAddress::new(1, 9);
        let b = CellAddress::new(2, 0);
        assert!(a < b);
        assert!(CellAddress::new(2, 0) < CellAddress::new(2, 1));
    }
}
