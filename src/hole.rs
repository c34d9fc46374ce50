// Unresolved byte ranges ("holes") tracked across multi-round passes.
//
// Holes never overlap. Resolving a sub-range removes its hole and puts back
// the leading and trailing remainders, so the union of holes and resolved
// ranges always equals the original range.

use std::collections::BTreeMap;

use crate::error::{Result, SyncError};

/// Half-open byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hole {
    pub offset: u64,
    pub length: u64,
}

impl Hole {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, other: &Hole) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Hole) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Non-overlapping holes keyed by offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoleSet {
    holes: BTreeMap<u64, u64>,
}

impl HoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One hole covering `[0, len)`, or nothing for an empty object.
    pub fn whole(len: u64) -> Self {
        let mut set = Self::new();
        if len > 0 {
            set.holes.insert(0, len);
        }
        set
    }

    /// Add a hole; it must not overlap an existing one.
    pub fn insert(&mut self, hole: Hole) -> Result<()> {
        if hole.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.overlapping(&hole) {
            return Err(SyncError::protocol(format!(
                "hole {hole:?} overlaps existing hole {existing:?}"
            )));
        }
        self.holes.insert(hole.offset, hole.length);
        Ok(())
    }

    /// The hole starting at or before `offset`, if it covers `offset`.
    pub fn covering(&self, offset: u64) -> Option<Hole> {
        let (&off, &len) = self.holes.range(..=offset).next_back()?;
        let hole = Hole::new(off, len);
        (offset < hole.end()).then_some(hole)
    }

    fn overlapping(&self, range: &Hole) -> Option<Hole> {
        if let Some(h) = self.covering(range.offset) {
            return Some(h);
        }
        self.holes
            .range(range.offset..range.end())
            .next()
            .map(|(&off, &len)| Hole::new(off, len))
    }

    /// Remove `resolved` from the set. It must lie inside exactly one hole.
    pub fn split(&mut self, resolved: Hole) -> Result<()> {
        match self.covering(resolved.offset) {
            Some(hole) if hole.contains(&resolved) => {
                self.carve(hole, resolved);
                Ok(())
            }
            _ => Err(SyncError::protocol(format!(
                "resolved range {resolved:?} is not inside a single hole"
            ))),
        }
    }

    /// Like [`split`](Self::split), but a range already fully resolved is a
    /// no-op. Returns whether anything was removed. Partial overlap is still
    /// an invariant violation.
    pub fn split_if_present(&mut self, resolved: Hole) -> Result<bool> {
        match self.overlapping(&resolved) {
            None => Ok(false),
            Some(hole) if hole.contains(&resolved) => {
                self.carve(hole, resolved);
                Ok(true)
            }
            Some(hole) => Err(SyncError::protocol(format!(
                "resolved range {resolved:?} partially overlaps hole {hole:?}"
            ))),
        }
    }

    fn carve(&mut self, hole: Hole, resolved: Hole) {
        self.holes.remove(&hole.offset);
        if resolved.offset > hole.offset {
            self.holes.insert(hole.offset, resolved.offset - hole.offset);
        }
        if resolved.end() < hole.end() {
            self.holes.insert(resolved.end(), hole.end() - resolved.end());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Hole> + '_ {
        self.holes.iter().map(|(&off, &len)| Hole::new(off, len))
    }

    pub fn len(&self) -> usize {
        self.holes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holes.is_empty()
    }

    /// Sum of hole lengths.
    pub fn total_len(&self) -> u64 {
        self.holes.values().sum()
    }
}
