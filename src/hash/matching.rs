// Block matching: scan a byte stream against a hash index.
//
// A window of `block_len` bytes slides over each scanned range:
//   1. Weak-hash the window and look it up; a bucket hit is confirmed by
//      the strong hash inside `HashIndex::find`.
//   2. On a hit, flush pending unmatched bytes as one diff, emit an equal
//      record, jump a whole block and re-seed the rolling hash.
//   3. On a miss, the leading byte joins the pending run and the window
//      rolls forward one byte.
//   4. Whatever is left at the end (including a tail shorter than a block)
//      becomes a diff.
// With an empty index nothing is hashed: the range is copied as diffs.
//
// Reads are buffered; the buffer keeps the pending run so a diff is emitted
// as one record unless it outgrows half the buffer.

use super::config;
use super::rolling::RollingHasher;
use super::table::{HashIndex, TargetPosition};
use crate::error::{Result, SyncError};
use crate::hole::{Hole, HoleSet};
use crate::source::ByteSource;
use crate::stream::DeltaSink;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A confirmed block match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    pub source_offset: u64,
    pub position: TargetPosition,
    pub block_len: u32,
}

impl BlockMatch {
    /// Resolved range in the scanned (source) object.
    pub fn source_range(&self) -> Hole {
        Hole::new(self.source_offset, self.block_len as u64)
    }

    /// Range the block was read from in the target object.
    pub fn target_range(&self) -> Hole {
        Hole::new(self.position.absolute(self.block_len), self.block_len as u64)
    }
}

/// Counters for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchStats {
    /// Bytes covered by the scanned ranges.
    pub bytes_scanned: u64,
    /// Hash-index lookups performed.
    pub lookups: u64,
    pub equal_blocks: u64,
    pub diff_records: u64,
    pub diff_bytes: u64,
}

impl MatchStats {
    pub fn merge(&mut self, other: &MatchStats) {
        self.bytes_scanned += other.bytes_scanned;
        self.lookups += other.lookups;
        self.equal_blocks += other.equal_blocks;
        self.diff_records += other.diff_records;
        self.diff_bytes += other.diff_bytes;
    }
}

/// Stats plus every match found, in emission order.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub stats: MatchStats,
    pub matches: Vec<BlockMatch>,
}

// ---------------------------------------------------------------------------
// Scan buffer
// ---------------------------------------------------------------------------

struct Window {
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`.
    origin: u64,
    /// Start of the hashed window in `buf`.
    pos: usize,
    /// Start of the pending unmatched run in `buf` (`pending <= pos`).
    pending: usize,
    /// Bytes of the range not yet read.
    remaining: u64,
    cap: usize,
}

impl Window {
    fn new(range: Hole, cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            origin: range.offset,
            pos: 0,
            pending: 0,
            remaining: range.length,
            cap,
        }
    }

    fn fill<R: ByteSource + ?Sized>(&mut self, reader: &mut R) -> Result<()> {
        let want = ((self.cap - self.buf.len()) as u64).min(self.remaining) as usize;
        let old = self.buf.len();
        self.buf.resize(old + want, 0);
        let n = reader.read(&mut self.buf[old..])?;
        if n < want {
            return Err(SyncError::io(
                format!("{}: object shrank while scanning", reader.name()),
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }
        self.remaining -= want as u64;
        Ok(())
    }

    #[inline]
    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Scans ranges of a source object against one hash index.
#[derive(Debug, Clone, Copy)]
pub struct BlockMatcher<'a> {
    index: &'a HashIndex,
    block_len: u32,
    buffer_len: usize,
    emit_diffs: bool,
}

impl<'a> BlockMatcher<'a> {
    pub fn new(index: &'a HashIndex) -> Self {
        Self {
            index,
            block_len: index.block_len(),
            buffer_len: config::DEFAULT.buffer_len,
            emit_diffs: true,
        }
    }

    pub fn with_buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len.max(1);
        self
    }

    /// Emit only equal records; unmatched bytes stay unresolved.
    pub fn resolve_only(mut self) -> Self {
        self.emit_diffs = false;
        self
    }

    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    /// Scan one range of `reader`.
    pub fn scan<R, S>(&self, reader: &mut R, range: Hole, sink: &mut S) -> Result<ScanReport>
    where
        R: ByteSource + ?Sized,
        S: DeltaSink + ?Sized,
    {
        let mut report = ScanReport::default();
        self.scan_into(reader, range, sink, &mut report)?;
        Ok(report)
    }

    /// Scan every hole of `holes` in offset order.
    pub fn scan_holes<R, S>(
        &self,
        reader: &mut R,
        holes: &HoleSet,
        sink: &mut S,
    ) -> Result<ScanReport>
    where
        R: ByteSource + ?Sized,
        S: DeltaSink + ?Sized,
    {
        let mut report = ScanReport::default();
        for hole in holes.iter() {
            self.scan_into(reader, hole, sink, &mut report)?;
        }
        Ok(report)
    }

    fn scan_into<R, S>(
        &self,
        reader: &mut R,
        range: Hole,
        sink: &mut S,
        report: &mut ScanReport,
    ) -> Result<()>
    where
        R: ByteSource + ?Sized,
        S: DeltaSink + ?Sized,
    {
        if range.is_empty() {
            return Ok(());
        }
        report.stats.bytes_scanned += range.length;
        let blk = self.block_len as usize;
        if self.index.is_empty() || blk == 0 || range.length < blk as u64 {
            return self.copy_range(reader, range, sink, report);
        }

        let cap = (range.length.min(self.buffer_len.max(4 * blk) as u64)) as usize;
        let mut win = Window::new(range, cap);
        reader.seek_to(range.offset)?;
        win.fill(reader)?;

        let mut hasher = RollingHasher::new();
        hasher.seed(&win.buf[..blk]);
        loop {
            report.stats.lookups += 1;
            let pos = win.pos;
            if let Some(position) = self.index.find(hasher.value(), &win.buf[pos..pos + blk]) {
                self.flush_pending(&mut win, sink, report)?;
                let source_offset = win.origin + pos as u64;
                log::trace!(
                    "equal: block {}+{} -> {source_offset}",
                    position.base_offset,
                    position.block_index
                );
                sink.equal(position, self.block_len, source_offset)?;
                report.stats.equal_blocks += 1;
                report.matches.push(BlockMatch {
                    source_offset,
                    position,
                    block_len: self.block_len,
                });
                win.pos += blk;
                win.pending = win.pos;
                if !self.ensure(&mut win, reader, sink, report)? {
                    break;
                }
                hasher.seed(&win.buf[win.pos..win.pos + blk]);
            } else {
                let outgoing = win.buf[pos];
                win.pos += 1;
                if !self.ensure(&mut win, reader, sink, report)? {
                    break;
                }
                hasher.roll(outgoing, win.buf[win.pos + blk - 1]);
            }
        }

        // Fewer than a block left: the rest is unmatched.
        win.pos = win.buf.len();
        self.flush_pending(&mut win, sink, report)
    }

    /// Make sure a full block is buffered at `win.pos`. Returns false once
    /// the range is exhausted.
    fn ensure<R, S>(
        &self,
        win: &mut Window,
        reader: &mut R,
        sink: &mut S,
        report: &mut ScanReport,
    ) -> Result<bool>
    where
        R: ByteSource + ?Sized,
        S: DeltaSink + ?Sized,
    {
        let blk = self.block_len as usize;
        while win.available() < blk {
            if win.remaining == 0 {
                return Ok(false);
            }
            if win.pos - win.pending > win.cap / 2 {
                self.flush_pending(win, sink, report)?;
            }
            let consumed = win.pending;
            win.buf.drain(..consumed);
            win.origin += consumed as u64;
            win.pos -= consumed;
            win.pending = 0;
            win.fill(reader)?;
        }
        Ok(true)
    }

    /// Emit `buf[pending..pos]` as one diff and mark it consumed.
    fn flush_pending<S: DeltaSink + ?Sized>(
        &self,
        win: &mut Window,
        sink: &mut S,
        report: &mut ScanReport,
    ) -> Result<()> {
        if win.pos > win.pending && self.emit_diffs {
            let offset = win.origin + win.pending as u64;
            sink.diff(&win.buf[win.pending..win.pos], offset)?;
            report.stats.diff_records += 1;
            report.stats.diff_bytes += (win.pos - win.pending) as u64;
        }
        win.pending = win.pos;
        Ok(())
    }

    /// Copy a range verbatim, without hashing.
    fn copy_range<R, S>(
        &self,
        reader: &mut R,
        range: Hole,
        sink: &mut S,
        report: &mut ScanReport,
    ) -> Result<()>
    where
        R: ByteSource + ?Sized,
        S: DeltaSink + ?Sized,
    {
        if !self.emit_diffs {
            return Ok(());
        }
        emit_verbatim(reader, range, self.buffer_len, sink, &mut report.stats)
    }
}

/// Emit `range` of `reader` as diff records of at most `chunk` bytes.
pub fn emit_verbatim<R, S>(
    reader: &mut R,
    range: Hole,
    chunk: usize,
    sink: &mut S,
    stats: &mut MatchStats,
) -> Result<()>
where
    R: ByteSource + ?Sized,
    S: DeltaSink + ?Sized,
{
    let chunk = (range.length.min(chunk.max(1) as u64)) as usize;
    let mut buf = vec![0u8; chunk];
    let mut offset = range.offset;
    while offset < range.end() {
        let n = ((range.end() - offset) as usize).min(chunk);
        reader.read_exact_at(offset, &mut buf[..n])?;
        sink.diff(&buf[..n], offset)?;
        stats.diff_records += 1;
        stats.diff_bytes += n as u64;
        offset += n as u64;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::strong::StrongHash;
    use crate::script::{DeltaRecord, DiffRecord, EditScript, EqualRecord};
    use crate::source::MemorySource;
    use crate::stream::DeltaSink;

    fn index_of(target: &[u8], blk: u32) -> HashIndex {
        let mut idx = HashIndex::new(blk);
        for (i, block) in target.chunks_exact(blk as usize).enumerate() {
            idx.insert(
                RollingHasher::checksum(block),
                StrongHash::of(block),
                TargetPosition::new(0, i as u64),
            );
        }
        idx
    }

    fn run(target: &[u8], source: &[u8], blk: u32, buffer_len: usize) -> (EditScript, MatchStats) {
        let idx = index_of(target, blk);
        let mut src = MemorySource::new("src", source.to_vec());
        let mut script = EditScript::new();
        script.begin("src", blk).unwrap();
        let report = BlockMatcher::new(&idx)
            .with_buffer_len(buffer_len)
            .scan(&mut src, Hole::new(0, source.len() as u64), &mut script)
            .unwrap();
        script.end(source.len() as u64).unwrap();
        (script, report.stats)
    }

    fn equal(index: u64, source_offset: u64) -> DeltaRecord {
        DeltaRecord::Equal(EqualRecord {
            position: TargetPosition::new(0, index),
            block_len: 4,
            source_offset,
        })
    }

    fn diff(offset: u64, data: &[u8]) -> DeltaRecord {
        DeltaRecord::Diff(DiffRecord::bytes(offset, data))
    }

    #[test]
    fn trailing_block_changed() {
        let (script, _) = run(b"AAAABBBBCCCC", b"AAAABBBBDDDD", 4, 1 << 16);
        assert_eq!(
            script.records,
            vec![equal(0, 0), equal(1, 4), diff(8, b"DDDD")]
        );
    }

    #[test]
    fn shifted_content_is_found() {
        let (script, _) = run(b"AAAABBBBCCCC", b"xyAAAABBBBCCCCz", 4, 1 << 16);
        assert_eq!(
            script.records,
            vec![
                diff(0, b"xy"),
                equal(0, 2),
                equal(1, 6),
                equal(2, 10),
                diff(14, b"z"),
            ]
        );
    }

    #[test]
    fn empty_index_copies_without_lookups() {
        let idx = HashIndex::new(4);
        let mut src = MemorySource::new("src", b"HELLO".to_vec());
        let mut script = EditScript::new();
        let report = BlockMatcher::new(&idx)
            .scan(&mut src, Hole::new(0, 5), &mut script)
            .unwrap();
        assert_eq!(script.records, vec![diff(0, b"HELLO")]);
        assert_eq!(report.stats.lookups, 0);
    }

    #[test]
    fn short_source_is_diff() {
        let (script, stats) = run(b"AAAABBBB", b"AAA", 4, 1 << 16);
        assert_eq!(script.records, vec![diff(0, b"AAA")]);
        assert_eq!(stats.lookups, 0);
    }

    #[test]
    fn weak_collision_is_not_matched() {
        let target = [0x61, 0x60, 0x60, 0x61];
        let source = [0x60, 0x61, 0x61, 0x60];
        let (script, stats) = run(&target, &source, 4, 1 << 16);
        assert_eq!(script.records, vec![diff(0, &source)]);
        assert_eq!(stats.equal_blocks, 0);
    }

    #[test]
    fn small_buffer_gives_same_matches() {
        let target: Vec<u8> = (0..4000u32).map(|i| (i * 31 % 253) as u8).collect();
        let mut source = b"prefix".to_vec();
        source.extend_from_slice(&target[100..3000]);
        source.extend_from_slice(b"middle-junk");
        source.extend_from_slice(&target[3000..]);

        let (big, _) = run(&target, &source, 16, 1 << 20);
        let (small, _) = run(&target, &source, 16, 64);
        let eq_big: Vec<_> = big.equals().copied().collect();
        let eq_small: Vec<_> = small.equals().copied().collect();
        assert_eq!(eq_big, eq_small);

        let mut rebuilt = vec![0u8; source.len()];
        for e in small.equals() {
            let t = e.target_offset() as usize;
            let s = e.source_offset as usize;
            rebuilt[s..s + 16].copy_from_slice(&target[t..t + 16]);
        }
        for d in small.diffs() {
            if let crate::script::DiffPayload::Bytes(b) = &d.payload {
                let s = d.source_offset as usize;
                rebuilt[s..s + b.len()].copy_from_slice(b);
            }
        }
        assert_eq!(rebuilt, source);
    }

    #[test]
    fn resolve_only_emits_no_diffs() {
        let idx = index_of(b"AAAABBBB", 4);
        let mut src = MemorySource::new("src", b"zzBBBBzzAAAA".to_vec());
        let mut script = EditScript::new();
        let report = BlockMatcher::new(&idx)
            .resolve_only()
            .scan(&mut src, Hole::new(0, 12), &mut script)
            .unwrap();
        assert!(script.diffs().next().is_none());
        assert_eq!(report.matches.len(), 2);
        assert_eq!(report.matches[0].source_range(), Hole::new(2, 4));
        assert_eq!(report.matches[0].target_range(), Hole::new(4, 4));
    }

    #[test]
    fn scan_holes_stays_inside_holes() {
        let idx = index_of(b"AAAABBBB", 4);
        let mut src = MemorySource::new("src", b"AAAAxxxxBBBB".to_vec());
        let mut holes = HoleSet::whole(12);
        holes.split(Hole::new(0, 6)).unwrap();
        let mut script = EditScript::new();
        let report = BlockMatcher::new(&idx)
            .resolve_only()
            .scan_holes(&mut src, &holes, &mut script)
            .unwrap();
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].source_offset, 8);
        assert_eq!(report.stats.bytes_scanned, 6);
    }

    #[test]
    fn idempotent() {
        let target: Vec<u8> = (0..2000u32).map(|i| (i % 97) as u8).collect();
        let mut source = target.clone();
        source[700] ^= 0xFF;
        let (a, _) = run(&target, &source, 32, 256);
        let (b, _) = run(&target, &source, 32, 256);
        assert_eq!(a, b);
    }
}
