#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use dendron_core::{CellGid, CellLid};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LidSelectionPolicy {
    RoundRobin,
    AssertUnivalent,
}

/// A half-open range of local ids `[begin, end)` bound to one label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LidRange {
    pub begin: u32,
    pub end: u32,
}

impl LidRange {
    pub fn new(begin: u32, end: u32) -> Self {
        assert!(begin <= end, "lid range must not be reversed");
        Self { begin, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("label '{label}' not found on cell {gid}")]
    LabelNotFound { gid: CellGid, label: String },
    #[error("label '{label}' on cell {gid} maps to {size} items where exactly one is required")]
    NonUnivalentLabel {
        gid: CellGid,
        label: String,
        size: u32,
    },
    #[error("cell {gid} declared more than once in label map")]
    DuplicateCell { gid: CellGid },
    #[error("label '{label}' declared more than once on cell {gid}")]
    DuplicateLabel { gid: CellGid, label: String },
    #[error("label map has {gids} gids but {cells} cell entries")]
    SizeMismatch { gids: usize, cells: usize },
}

/// Per-cell label ranges in construction order, stored flat so the whole
/// structure can be gathered across ranks without pointer chasing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellLabelRange {
    sizes: Vec<usize>,
    labels: Vec<String>,
    ranges: Vec<LidRange>,
}

impl CellLabelRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cell(&mut self) {
        self.sizes.push(0);
    }

    pub fn add_label(&mut self, label: impl Into<String>, range: LidRange) {
        let last = self
            .sizes
            .last_mut()
            .expect("add_cell must precede add_label");
        *last += 1;
        self.labels.push(label.into());
        self.ranges.push(range);
    }

    pub fn num_cells(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn ranges(&self) -> &[LidRange] {
        &self.ranges
    }

    pub fn append(&mut self, other: CellLabelRange) {
        self.sizes.extend(other.sizes);
        self.labels.extend(other.labels);
        self.ranges.extend(other.ranges);
    }
}

/// Label ranges paired with the gids they describe, in matching order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellLabelsAndGids {
    pub label_range: CellLabelRange,
    pub gids: Vec<CellGid>,
}

impl CellLabelsAndGids {
    pub fn new(label_range: CellLabelRange, gids: Vec<CellGid>) -> Self {
        assert_eq!(
            label_range.num_cells(),
            gids.len(),
            "label ranges and gids must pair up"
        );
        Self { label_range, gids }
    }

    pub fn append(&mut self, other: CellLabelsAndGids) {
        self.label_range.append(other.label_range);
        self.gids.extend(other.gids);
    }
}

/// Global map from `(gid, label)` to its lid range, buildable on any rank
/// from the gathered per-rank `CellLabelsAndGids`.
#[derive(Debug, Clone, Default)]
pub struct LabelResolutionMap {
    map: BTreeMap<(CellGid, String), LidRange>,
}

impl LabelResolutionMap {
    pub fn build(source: &CellLabelsAndGids) -> Result<Self, LabelError> {
        if source.label_range.num_cells() != source.gids.len() {
            return Err(LabelError::SizeMismatch {
                gids: source.gids.len(),
                cells: source.label_range.num_cells(),
            });
        }
        let mut map = BTreeMap::new();
        let mut seen = std::collections::BTreeSet::new();
        let mut cursor = 0usize;
        for (cell, &gid) in source.gids.iter().enumerate() {
            if !seen.insert(gid) {
                return Err(LabelError::DuplicateCell { gid });
            }
            let count = source.label_range.sizes()[cell];
            for offset in 0..count {
                let label = &source.label_range.labels()[cursor + offset];
                let range = source.label_range.ranges()[cursor + offset];
                if map.insert((gid, label.clone()), range).is_some() {
                    return Err(LabelError::DuplicateLabel {
                        gid,
                        label: label.clone(),
                    });
                }
            }
            cursor += count;
        }
        Ok(Self { map })
    }

    pub fn range(&self, gid: CellGid, label: &str) -> Option<LidRange> {
        self.map.get(&(gid, label.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Stateful resolver over a `LabelResolutionMap`. Round-robin selection
/// advances a cursor per `(gid, label)` and wraps at the range end.
#[derive(Debug, Clone)]
pub struct Resolver<'a> {
    map: &'a LabelResolutionMap,
    cursors: BTreeMap<(CellGid, String), u32>,
}

impl<'a> Resolver<'a> {
    pub fn new(map: &'a LabelResolutionMap) -> Self {
        Self {
            map,
            cursors: BTreeMap::new(),
        }
    }

    pub fn resolve(
        &mut self,
        gid: CellGid,
        label: &str,
        policy: LidSelectionPolicy,
    ) -> Result<CellLid, LabelError> {
        let range = self
            .map
            .range(gid, label)
            .ok_or_else(|| LabelError::LabelNotFound {
                gid,
                label: label.to_string(),
            })?;
        match policy {
            LidSelectionPolicy::AssertUnivalent => {
                if range.len() != 1 {
                    return Err(LabelError::NonUnivalentLabel {
                        gid,
                        label: label.to_string(),
                        size: range.len(),
                    });
                }
                Ok(CellLid(range.begin))
            }
            LidSelectionPolicy::RoundRobin => {
                if range.is_empty() {
                    return Err(LabelError::NonUnivalentLabel {
                        gid,
                        label: label.to_string(),
                        size: 0,
                    });
                }
                let key = (gid, label.to_string());
                let cursor = self.cursors.entry(key).or_insert(range.begin);
                let lid = *cursor;
                *cursor += 1;
                if *cursor == range.end {
                    *cursor = range.begin;
                }
                Ok(CellLid(lid))
            }
        }
    }
}
