// Hashing and block matching.
//
// This module provides:
// - The rolling weak hash and the 16-byte strong hash
// - Block-size limits and profiles
// - The weak/strong hash index
// - The block matcher that scans a source against an index

pub mod config;
pub mod matching;
pub mod rolling;
pub mod strong;
pub mod table;

use crate::error::Result;
use crate::hole::{Hole, HoleSet};
use crate::source::ByteSource;
use rolling::RollingHasher;
use strong::strong_hash;
use table::{BlockHash, HashIndex, TargetPosition};

/// Hash every whole block of `range`, positions relative to `range.offset`.
///
/// `emit` also gets the block's bytes. A trailing partial block is not
/// hashed. Returns the number of blocks.
pub fn hash_range<R, F>(reader: &mut R, range: Hole, block_len: u32, mut emit: F) -> Result<u64>
where
    R: ByteSource + ?Sized,
    F: FnMut(BlockHash, &[u8]) -> Result<()>,
{
    let blk = block_len as u64;
    if blk == 0 || range.length < blk {
        return Ok(0);
    }
    let count = range.length / blk;
    let mut buf = vec![0u8; block_len as usize];
    for i in 0..count {
        reader.read_exact_at(range.offset + i * blk, &mut buf)?;
        let hash = BlockHash {
            weak: RollingHasher::checksum(&buf),
            strong: strong_hash(&buf),
            position: TargetPosition::new(range.offset, i),
        };
        emit(hash, &buf)?;
    }
    Ok(count)
}

/// Build an index over every hole at least one block long.
pub fn index_holes<R: ByteSource + ?Sized>(
    reader: &mut R,
    holes: &HoleSet,
    block_len: u32,
) -> Result<(HashIndex, u64)> {
    let mut index = HashIndex::new(block_len);
    let mut blocks = 0;
    for hole in holes.iter() {
        blocks += hash_range(reader, hole, block_len, |b, _| {
            index.insert(b.weak, b.strong, b.position);
            Ok(())
        })?;
    }
    Ok((index, blocks))
}
