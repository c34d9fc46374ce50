// Hash index for block matching.
//
// Maps a weak hash to the blocks sharing it, each bucket ordered by strong
// hash so a candidate is confirmed in O(log n). A weak-hash hit is never
// reported without a strong-hash match.

use std::collections::{BTreeMap, HashMap};

use super::rolling::WeakHash;
use super::strong::StrongHash;
use crate::error::{Result, SyncError};
use crate::stream::HashSink;

// ---------------------------------------------------------------------------
// Positions and hashed blocks
// ---------------------------------------------------------------------------

/// Location of a block in the target object.
///
/// `base_offset` is non-zero only when hashing was scoped to a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TargetPosition {
    pub base_offset: u64,
    pub block_index: u64,
}

impl TargetPosition {
    pub fn new(base_offset: u64, block_index: u64) -> Self {
        Self {
            base_offset,
            block_index,
        }
    }

    /// Absolute offset in the target object.
    #[inline]
    pub fn absolute(&self, block_len: u32) -> u64 {
        self.base_offset + self.block_index * block_len as u64
    }
}

/// One hashed target block, as streamed to the matching side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHash {
    pub weak: WeakHash,
    pub strong: StrongHash,
    pub position: TargetPosition,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Weak-hash buckets of strong-hash-ordered target positions.
#[derive(Debug, Clone, Default)]
pub struct HashIndex {
    buckets: HashMap<WeakHash, BTreeMap<StrongHash, TargetPosition>>,
    block_len: u32,
    entries: usize,
}

impl HashIndex {
    pub fn new(block_len: u32) -> Self {
        Self {
            buckets: HashMap::new(),
            block_len,
            entries: 0,
        }
    }

    /// Block length every indexed block was hashed with.
    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    /// Insert a block. The first position seen for identical content wins.
    pub fn insert(&mut self, weak: WeakHash, strong: StrongHash, position: TargetPosition) {
        let bucket = self.buckets.entry(weak).or_default();
        if let std::collections::btree_map::Entry::Vacant(e) = bucket.entry(strong) {
            e.insert(position);
            self.entries += 1;
        }
    }

    /// Confirm a weak-hash hit against `candidate`'s strong hash.
    ///
    /// The strong hash is only computed when the bucket exists.
    #[inline]
    pub fn find(&self, weak: WeakHash, candidate: &[u8]) -> Option<TargetPosition> {
        let bucket = self.buckets.get(&weak)?;
        bucket.get(&StrongHash::of(candidate)).copied()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entries = 0;
    }

    pub fn reset(&mut self, block_len: u32) {
        self.clear();
        self.block_len = block_len;
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Distinct (weak, strong) entries.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Extend<BlockHash> for HashIndex {
    fn extend<I: IntoIterator<Item = BlockHash>>(&mut self, iter: I) {
        for b in iter {
            self.insert(b.weak, b.strong, b.position);
        }
    }
}

/// Builds an index from a received hash stream.
///
/// A missing object arrives as `on_error(NotFound)` and leaves the index
/// empty; any other error is kept for the caller.
impl HashSink for HashIndex {
    fn begin(&mut self, _name: &str, block_len: u32) -> Result<()> {
        self.reset(block_len);
        Ok(())
    }

    fn block(&mut self, hash: BlockHash) -> Result<()> {
        self.insert(hash.weak, hash.strong, hash.position);
        Ok(())
    }

    fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.reset(block_len);
        Ok(())
    }

    fn end(&mut self, _digest: StrongHash, _size: u64) -> Result<()> {
        Ok(())
    }

    fn on_error(&mut self, err: &SyncError) {
        if err.is_no_object_error() {
            log::debug!("hash index: {err}, using empty index");
        } else {
            log::warn!("hash index: {err}");
        }
        self.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::rolling::RollingHasher;

    fn block_hash(data: &[u8], index: u64) -> BlockHash {
        BlockHash {
            weak: RollingHasher::checksum(data),
            strong: StrongHash::of(data),
            position: TargetPosition::new(0, index),
        }
    }

    #[test]
    fn insert_lookup() {
        let mut idx = HashIndex::new(4);
        let b = block_hash(b"ABCD", 3);
        idx.insert(b.weak, b.strong, b.position);
        assert_eq!(idx.find(b.weak, b"ABCD"), Some(TargetPosition::new(0, 3)));
        assert_eq!(idx.find(b.weak ^ 1, b"ABCD"), None);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn crafted_weak_collision_is_rejected() {
        let x = [0x61, 0x60, 0x60, 0x61];
        let y = [0x60, 0x61, 0x61, 0x60];
        let mut idx = HashIndex::new(4);
        let b = block_hash(&x, 0);
        idx.insert(b.weak, b.strong, b.position);
        let wy = RollingHasher::checksum(&y);
        assert_eq!(wy, b.weak);
        assert_eq!(idx.find(wy, &y), None, "weak collision must not match");
        assert!(idx.find(b.weak, &x).is_some());
    }

    #[test]
    fn colliding_blocks_share_a_bucket() {
        let x = [0x61, 0x60, 0x60, 0x61];
        let y = [0x60, 0x61, 0x61, 0x60];
        let mut idx = HashIndex::new(4);
        idx.extend([block_hash(&x, 0), block_hash(&y, 1)]);
        assert_eq!(idx.bucket_count(), 1);
        assert_eq!(idx.len(), 2);
        let w = RollingHasher::checksum(&x);
        assert_eq!(idx.find(w, &x).map(|p| p.block_index), Some(0));
        assert_eq!(idx.find(w, &y).map(|p| p.block_index), Some(1));
    }

    #[test]
    fn first_position_wins_for_duplicates() {
        let mut idx = HashIndex::new(4);
        idx.extend([block_hash(b"SAME", 0), block_hash(b"SAME", 5)]);
        assert_eq!(idx.len(), 1);
        let w = RollingHasher::checksum(b"SAME");
        assert_eq!(idx.find(w, b"SAME").map(|p| p.block_index), Some(0));
    }

    #[test]
    fn clear_and_reset() {
        let mut idx = HashIndex::new(4);
        idx.extend([block_hash(b"ABCD", 0)]);
        assert!(!idx.is_empty());
        idx.reset(8);
        assert!(idx.is_empty());
        assert_eq!(idx.block_len(), 8);
        assert_eq!(idx.bucket_count(), 0);
    }

    #[test]
    fn target_position_absolute() {
        let p = TargetPosition::new(1000, 3);
        assert_eq!(p.absolute(400), 2200);
    }

    #[test]
    fn received_round_replaces_the_index() {
        let mut idx = HashIndex::new(0);
        idx.begin("obj", 8).unwrap();
        idx.block(block_hash(b"AAAABBBB", 0)).unwrap();
        idx.end_round().unwrap();
        idx.next_round(4).unwrap();
        idx.block(block_hash(b"CCCC", 1)).unwrap();
        idx.end_round().unwrap();
        idx.end(StrongHash::ZERO, 12).unwrap();

        assert_eq!(idx.block_len(), 4);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.find(RollingHasher::checksum(b"AAAABBBB"), b"AAAABBBB"), None);
        let w = RollingHasher::checksum(b"CCCC");
        assert_eq!(idx.find(w, b"CCCC"), Some(TargetPosition::new(0, 1)));
    }

    #[test]
    fn sink_ignores_missing_object() {
        let mut idx = HashIndex::new(4);
        idx.begin("obj", 4).unwrap();
        idx.block(block_hash(b"ABCD", 0)).unwrap();
        idx.on_error(&SyncError::NotFound { name: "obj".into() });
        assert!(idx.is_empty());
    }
}
