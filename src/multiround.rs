// Multi-round refinement.
//
// Large, mostly-identical objects are matched with big blocks first; only
// the ranges still unresolved ("holes") are re-hashed and re-scanned with
// blocks `base` times smaller, until the block length would drop to the
// floor. Whatever source range is still a hole then goes out verbatim.
//
// Event order: begin(blk0) equal* end_round { next_round(blk) equal* end_round }*
// diff* end(size). Identical objects short-circuit to begin/end before any
// per-block hashing.

use crate::error::Result;
use crate::hash;
use crate::hash::config::BlockConfig;
use crate::hash::matching::{self, BlockMatcher, MatchStats};
use crate::hash::strong::ObjectDigest;
use crate::hole::{Hole, HoleSet};
use crate::source::ByteSource;
use crate::stream::DeltaSink;

const DIGEST_BUF_SIZE: usize = 64 * 1024;

/// Counters for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub block_len: u32,
    /// Target blocks hashed into this round's index.
    pub blocks_hashed: u64,
    /// Holes open when the round started.
    pub target_holes: usize,
    pub source_holes: usize,
    pub matched_blocks: u64,
    /// Source bytes this round's matches covered.
    pub matched_bytes: u64,
    /// Source bytes still in holes after the round.
    pub source_hole_bytes: u64,
    pub lookups: u64,
}

/// Outcome of a multi-round pass.
#[derive(Debug, Clone, Default)]
pub struct MultiroundReport {
    /// Source and target were byte-identical.
    pub identical: bool,
    /// False when the comparison object was absent.
    pub target_exists: bool,
    pub source_size: u64,
    pub rounds: Vec<RoundStats>,
    /// Verbatim bytes sent after the last round.
    pub diff_records: u64,
    pub diff_bytes: u64,
}

impl MultiroundReport {
    pub fn blocks_hashed(&self) -> u64 {
        self.rounds.iter().map(|r| r.blocks_hashed).sum()
    }

    pub fn lookups(&self) -> u64 {
        self.rounds.iter().map(|r| r.lookups).sum()
    }

    pub fn matched_blocks(&self) -> u64 {
        self.rounds.iter().map(|r| r.matched_blocks).sum()
    }
}

/// Drives repeated index/match passes over shrinking block lengths.
#[derive(Debug, Clone, Copy, Default)]
pub struct Multiround {
    config: BlockConfig,
}

impl Multiround {
    pub fn new(config: BlockConfig) -> Self {
        Self { config }
    }

    /// Match `source` against `target`, streaming records into `sink`.
    ///
    /// Errors are reported to `sink.on_error` and returned; no further
    /// records are emitted for the object.
    pub fn run<T, S, K>(
        &self,
        target: &mut T,
        source: &mut S,
        sink: &mut K,
    ) -> Result<MultiroundReport>
    where
        T: ByteSource + ?Sized,
        S: ByteSource + ?Sized,
        K: DeltaSink + ?Sized,
    {
        match self.run_inner(target, source, sink) {
            Ok(report) => Ok(report),
            Err(e) => {
                log::debug!("multiround {}: {e}", source.name());
                sink.on_error(&e);
                Err(e)
            }
        }
    }

    fn run_inner<T, S, K>(
        &self,
        target: &mut T,
        source: &mut S,
        sink: &mut K,
    ) -> Result<MultiroundReport>
    where
        T: ByteSource + ?Sized,
        S: ByteSource + ?Sized,
        K: DeltaSink + ?Sized,
    {
        let cfg = &self.config;
        source.open()?;
        let source_size = source.size()?;
        let name = source.name().to_string();
        let mut report = MultiroundReport {
            source_size,
            ..Default::default()
        };

        if !open_if_present(target)? {
            log::warn!("{}: comparison object missing, sending {name} whole", target.name());
            sink.begin(&name, cfg.min_block)?;
            let mut stats = MatchStats::default();
            matching::emit_verbatim(
                source,
                Hole::new(0, source_size),
                cfg.buffer_len,
                sink,
                &mut stats,
            )?;
            report.diff_records = stats.diff_records;
            report.diff_bytes = stats.diff_bytes;
            sink.end(source_size)?;
            return Ok(report);
        }
        report.target_exists = true;

        let target_size = target.size()?;
        let mut block_len = cfg.multiround_initial(target_size);

        if target_size == source_size {
            let t = ObjectDigest::of_source(target, DIGEST_BUF_SIZE)?;
            let s = ObjectDigest::of_source(source, DIGEST_BUF_SIZE)?;
            if t == s {
                log::debug!("{name}: identical to {}, nothing to send", target.name());
                report.identical = true;
                sink.begin(&name, block_len)?;
                sink.end(source_size)?;
                return Ok(report);
            }
        }

        let mut target_holes = HoleSet::whole(target_size);
        let mut source_holes = HoleSet::whole(source_size);
        sink.begin(&name, block_len)?;

        loop {
            let (index, blocks_hashed) = hash::index_holes(target, &target_holes, block_len)?;
            let mut round = RoundStats {
                block_len,
                blocks_hashed,
                target_holes: target_holes.len(),
                source_holes: source_holes.len(),
                ..Default::default()
            };

            let scan = BlockMatcher::new(&index)
                .with_buffer_len(cfg.buffer_len)
                .resolve_only()
                .scan_holes(source, &source_holes, sink)?;
            for m in &scan.matches {
                source_holes.split(m.source_range())?;
                target_holes.split_if_present(m.target_range())?;
            }
            round.matched_blocks = scan.stats.equal_blocks;
            round.matched_bytes = scan.matches.iter().map(|m| m.source_range().length).sum();
            round.source_hole_bytes = source_holes.total_len();
            round.lookups = scan.stats.lookups;
            log::debug!(
                "{name}: round {} block {block_len}: hashed {blocks_hashed}, matched {}, \
                 {} source holes left",
                report.rounds.len(),
                round.matched_blocks,
                source_holes.len()
            );
            report.rounds.push(round);
            sink.end_round()?;

            if source_holes.is_empty() {
                break;
            }
            match cfg.next_round(block_len) {
                Some(next) => {
                    block_len = next;
                    sink.next_round(block_len)?;
                }
                None => break,
            }
        }

        let mut stats = MatchStats::default();
        for hole in source_holes.iter() {
            matching::emit_verbatim(source, hole, cfg.buffer_len, sink, &mut stats)?;
        }
        report.diff_records = stats.diff_records;
        report.diff_bytes = stats.diff_bytes;
        sink.end(source_size)?;
        Ok(report)
    }
}

/// Open `target`, returning false if it does not exist.
pub(crate) fn open_if_present<T: ByteSource + ?Sized>(target: &mut T) -> Result<bool> {
    if !target.exists() {
        return Ok(false);
    }
    match target.open() {
        Ok(()) => Ok(true),
        Err(e) if e.is_no_object_error() => Ok(false),
        Err(e) => Err(e),
    }
}
