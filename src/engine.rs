// Sync engine: the public entry points tying hashing, matching, multi-round
// refinement and in-place ordering together.
//
//   build_index / hash_stream   target side: hash the comparison object
//   generate_delta              source side: scan against a received index
//   run_multiround              both objects local: refine over rounds
//   diff / patch                whole-buffer convenience wrappers

use crate::error::{Result, SyncError};
use crate::hash;
use crate::hash::config::BlockConfig;
use crate::hash::matching::{BlockMatcher, MatchStats};
use crate::hash::strong::{ObjectDigest, StrongHash};
use crate::hash::table::HashIndex;
use crate::hole::Hole;
use crate::inplace::InPlaceStream;
use crate::multiround::{self, Multiround, MultiroundReport};
use crate::reconstruct;
use crate::script::EditScript;
use crate::source::{ByteSource, MemorySource};
use crate::stream::{DeltaSink, HashSink};
use crate::wire::SyncFlags;

pub use crate::inplace::resolve_in_place;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for one sync pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Block-length limits and scan buffer size.
    pub config: BlockConfig,
    /// Refine with shrinking blocks instead of a single pass.
    pub multiround: bool,
    /// Order the delta so the target can be rewritten in place.
    pub in_place: bool,
    /// Fixed block length for single-round passes.
    pub block_len: Option<u32>,
}

impl SyncOptions {
    /// Block length for hashing an object of `size` bytes.
    pub fn block_len_for(&self, size: u64) -> u32 {
        self.block_len
            .unwrap_or_else(|| self.config.block_length_for(size))
            .max(1)
    }

    pub fn flags(&self) -> SyncFlags {
        let mut flags = SyncFlags::empty();
        flags.set(SyncFlags::MULTIROUND, self.multiround);
        flags.set(SyncFlags::IN_PLACE, self.in_place);
        flags
    }

    /// Reject combinations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.multiround && self.in_place {
            return Err(SyncError::protocol(
                "in-place ordering needs a single round; later rounds read scoped target ranges",
            ));
        }
        if self.block_len == Some(0) {
            return Err(SyncError::protocol("block length must be positive"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Target side
// ---------------------------------------------------------------------------

/// Result of hashing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSummary {
    pub name: String,
    pub exists: bool,
    pub block_len: u32,
    pub blocks: u64,
    pub size: u64,
    pub digest: StrongHash,
}

/// Hash every block of `reader` into `sink`, with the whole-object digest
/// at `end`.
///
/// An absent object produces `begin`, a not-found `on_error`, then
/// `end(ZERO, 0)`; receivers treat that as an empty index.
pub fn hash_stream<R, S>(reader: &mut R, sink: &mut S, opts: &SyncOptions) -> Result<HashSummary>
where
    R: ByteSource + ?Sized,
    S: HashSink + ?Sized,
{
    match hash_stream_inner(reader, sink, opts) {
        Ok(summary) => Ok(summary),
        Err(e) => {
            log::debug!("hashing {}: {e}", reader.name());
            sink.on_error(&e);
            Err(e)
        }
    }
}

fn hash_stream_inner<R, S>(reader: &mut R, sink: &mut S, opts: &SyncOptions) -> Result<HashSummary>
where
    R: ByteSource + ?Sized,
    S: HashSink + ?Sized,
{
    let name = reader.name().to_string();
    if !multiround::open_if_present(reader)? {
        let block_len = opts.block_len_for(0);
        log::info!("{name}: no such object, sending an empty signature");
        sink.begin(&name, block_len)?;
        sink.on_error(&SyncError::NotFound { name: name.clone() });
        sink.end(StrongHash::ZERO, 0)?;
        return Ok(HashSummary {
            name,
            exists: false,
            block_len,
            blocks: 0,
            size: 0,
            digest: StrongHash::ZERO,
        });
    }

    let size = reader.size()?;
    let block_len = opts.block_len_for(size);
    sink.begin(&name, block_len)?;

    // One sequential pass feeds both the block hashes and the digest.
    let mut digest = ObjectDigest::new();
    let blocks = hash::hash_range(reader, Hole::new(0, size), block_len, |b, bytes| {
        digest.update(bytes);
        sink.block(b)
    })?;
    let hashed = blocks * block_len as u64;
    if hashed < size {
        let mut tail = vec![0u8; (size - hashed) as usize];
        reader.read_exact_at(hashed, &mut tail)?;
        digest.update(&tail);
    }
    let digest = digest.finalize();
    sink.end(digest, size)?;
    log::debug!("{name}: hashed {blocks} blocks of {block_len} bytes");
    Ok(HashSummary {
        name,
        exists: true,
        block_len,
        blocks,
        size,
        digest,
    })
}

/// Build a hash index over `reader`. An absent object yields an empty index.
pub fn build_index<R>(reader: &mut R, opts: &SyncOptions) -> Result<HashIndex>
where
    R: ByteSource + ?Sized,
{
    let mut index = HashIndex::new(opts.block_len_for(0));
    hash_stream(reader, &mut index, opts)?;
    Ok(index)
}

// ---------------------------------------------------------------------------
// Source side
// ---------------------------------------------------------------------------

/// Scan `source` against `index`, streaming a complete delta into `sink`.
///
/// With `opts.in_place` the stream is reordered for in-place application
/// before it reaches `sink`.
pub fn generate_delta<R, S>(
    source: &mut R,
    index: &HashIndex,
    sink: &mut S,
    opts: &SyncOptions,
) -> Result<MatchStats>
where
    R: ByteSource + ?Sized,
    S: DeltaSink + ?Sized,
{
    if opts.in_place {
        let mut stream = InPlaceStream::new(&mut *sink).with_chunk(opts.config.buffer_len);
        let stats = match scan_source(source, index, &mut stream, opts) {
            Ok(stats) => stats,
            Err(e) => {
                stream.on_error(&e);
                return Err(e);
            }
        };
        stream.finish(source)?;
        return Ok(stats);
    }
    scan_source(source, index, sink, opts).inspect_err(|e| sink.on_error(e))
}

fn scan_source<R, S>(
    source: &mut R,
    index: &HashIndex,
    sink: &mut S,
    opts: &SyncOptions,
) -> Result<MatchStats>
where
    R: ByteSource + ?Sized,
    S: DeltaSink + ?Sized,
{
    source.open()?;
    let size = source.size()?;
    let name = source.name().to_string();
    sink.begin(&name, index.block_len())?;
    let report = BlockMatcher::new(index)
        .with_buffer_len(opts.config.buffer_len)
        .scan(source, Hole::new(0, size), sink)?;
    sink.end(size)?;
    let s = &report.stats;
    log::debug!(
        "{name}: {} equal blocks, {} diff bytes in {} records, {} lookups",
        s.equal_blocks,
        s.diff_bytes,
        s.diff_records,
        s.lookups
    );
    Ok(report.stats)
}

/// Multi-round pass with both objects available locally.
pub fn run_multiround<T, R, S>(
    target: &mut T,
    source: &mut R,
    sink: &mut S,
    opts: &SyncOptions,
) -> Result<MultiroundReport>
where
    T: ByteSource + ?Sized,
    R: ByteSource + ?Sized,
    S: DeltaSink + ?Sized,
{
    Multiround::new(opts.config).run(target, source, sink)
}

// ---------------------------------------------------------------------------
// Buffer helpers
// ---------------------------------------------------------------------------

/// Compute the edit script turning `target` into `source`.
pub fn diff(target: &[u8], source: &[u8], opts: &SyncOptions) -> Result<EditScript> {
    opts.validate()?;
    let mut t = MemorySource::new("target", target.to_vec());
    let mut s = MemorySource::new("source", source.to_vec());
    let mut script = EditScript::new();
    if opts.multiround {
        run_multiround(&mut t, &mut s, &mut script, opts)?;
    } else {
        let index = build_index(&mut t, opts)?;
        generate_delta(&mut s, &index, &mut script, opts)?;
    }
    Ok(script)
}

/// Rebuild the source object from `target` and `script`.
pub fn patch(target: &[u8], script: &EditScript) -> Result<Vec<u8>> {
    reconstruct::apply(target, script)
}

/// Rewrite `target` into the source object without a second buffer.
/// `script` must have been produced with `in_place` set.
pub fn patch_in_place(target: &mut Vec<u8>, script: &EditScript) -> Result<()> {
    reconstruct::apply_in_place(target, script).map(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
