// Event sinks for hash streams and delta streams.
//
// Per object, a delta stream is:
//   begin(name, block_len)
//   { equal | diff }*
//   { next_round(block_len) { equal | diff }* end_round }*   (multi-round only)
//   end(total_size)
// `on_error` may arrive at any point and ends the stream for that object.
// A hash stream has the same shape with `block` events and a whole-object
// digest at `end`. `Guarded` enforces the ordering contract.

use crate::error::{Result, SyncError};
use crate::hash::strong::StrongHash;
use crate::hash::table::{BlockHash, TargetPosition};

// ---------------------------------------------------------------------------
// Sink traits
// ---------------------------------------------------------------------------

/// Consumer of matcher and coordinator output.
pub trait DeltaSink {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()>;

    /// Bytes at `source_offset` equal the target block at `position`.
    fn equal(&mut self, position: TargetPosition, block_len: u32, source_offset: u64)
    -> Result<()>;

    /// `data` must be copied verbatim to `source_offset`.
    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()>;

    fn next_round(&mut self, _block_len: u32) -> Result<()> {
        Ok(())
    }

    fn end_round(&mut self) -> Result<()> {
        Ok(())
    }

    fn end(&mut self, total_size: u64) -> Result<()>;

    fn on_error(&mut self, err: &SyncError);
}

/// Consumer of per-block hashes of a target object.
pub trait HashSink {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()>;

    fn block(&mut self, hash: BlockHash) -> Result<()>;

    fn next_round(&mut self, _block_len: u32) -> Result<()> {
        Ok(())
    }

    fn end_round(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whole-object digest and size.
    fn end(&mut self, digest: StrongHash, size: u64) -> Result<()>;

    fn on_error(&mut self, err: &SyncError);
}

impl<S: DeltaSink + ?Sized> DeltaSink for &mut S {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        (**self).begin(name, block_len)
    }
    fn equal(
        &mut self,
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    ) -> Result<()> {
        (**self).equal(position, block_len, source_offset)
    }
    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()> {
        (**self).diff(data, source_offset)
    }
    fn next_round(&mut self, block_len: u32) -> Result<()> {
        (**self).next_round(block_len)
    }
    fn end_round(&mut self) -> Result<()> {
        (**self).end_round()
    }
    fn end(&mut self, total_size: u64) -> Result<()> {
        (**self).end(total_size)
    }
    fn on_error(&mut self, err: &SyncError) {
        (**self).on_error(err)
    }
}

impl<S: HashSink + ?Sized> HashSink for &mut S {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        (**self).begin(name, block_len)
    }
    fn block(&mut self, hash: BlockHash) -> Result<()> {
        (**self).block(hash)
    }
    fn next_round(&mut self, block_len: u32) -> Result<()> {
        (**self).next_round(block_len)
    }
    fn end_round(&mut self) -> Result<()> {
        (**self).end_round()
    }
    fn end(&mut self, digest: StrongHash, size: u64) -> Result<()> {
        (**self).end(digest, size)
    }
    fn on_error(&mut self, err: &SyncError) {
        (**self).on_error(err)
    }
}

// ---------------------------------------------------------------------------
// Ordering contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Open,
    Closed,
    Failed,
}

/// State machine for the per-object event order.
#[derive(Debug, Clone)]
pub struct SequenceGuard {
    phase: Phase,
    block_len: u32,
}

impl Default for SequenceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            block_len: 0,
        }
    }

    /// Active block length of the current round.
    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    fn expect_open(&self, event: &str) -> Result<()> {
        match self.phase {
            Phase::Open => Ok(()),
            Phase::Idle => Err(SyncError::protocol(format!("{event} before begin"))),
            Phase::Closed => Err(SyncError::protocol(format!("{event} after end"))),
            Phase::Failed => Err(SyncError::protocol(format!("{event} after error"))),
        }
    }

    pub fn begin(&mut self, block_len: u32) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(SyncError::protocol("begin sent twice"));
        }
        self.phase = Phase::Open;
        self.block_len = block_len;
        Ok(())
    }

    /// A diff or hashed-block event.
    pub fn record(&mut self, event: &str) -> Result<()> {
        self.expect_open(event)
    }

    pub fn equal(&mut self, block_len: u32) -> Result<()> {
        self.expect_open("equal")?;
        if block_len != self.block_len {
            return Err(SyncError::protocol(format!(
                "equal block length {block_len} differs from active block length {}",
                self.block_len
            )));
        }
        Ok(())
    }

    pub fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.expect_open("next_round")?;
        if block_len == 0 || block_len > self.block_len {
            return Err(SyncError::protocol(format!(
                "round block length {block_len} does not shrink from {}",
                self.block_len
            )));
        }
        self.block_len = block_len;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.expect_open("end")?;
        self.phase = Phase::Closed;
        Ok(())
    }

    pub fn fail(&mut self) {
        self.phase = Phase::Failed;
    }
}

/// Sink wrapper that rejects events violating the ordering contract.
#[derive(Debug)]
pub struct Guarded<S> {
    inner: S,
    guard: SequenceGuard,
}

impl<S> Guarded<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            guard: SequenceGuard::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: DeltaSink> DeltaSink for Guarded<S> {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        self.guard.begin(block_len)?;
        self.inner.begin(name, block_len)
    }

    fn equal(
        &mut self,
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    ) -> Result<()> {
        self.guard.equal(block_len)?;
        self.inner.equal(position, block_len, source_offset)
    }

    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()> {
        self.guard.record("diff")?;
        self.inner.diff(data, source_offset)
    }

    fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.guard.next_round(block_len)?;
        self.inner.next_round(block_len)
    }

    fn end_round(&mut self) -> Result<()> {
        self.guard.record("end_round")?;
        self.inner.end_round()
    }

    fn end(&mut self, total_size: u64) -> Result<()> {
        self.guard.end()?;
        self.inner.end(total_size)
    }

    fn on_error(&mut self, err: &SyncError) {
        self.guard.fail();
        self.inner.on_error(err)
    }
}

impl<S: HashSink> HashSink for Guarded<S> {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        self.guard.begin(block_len)?;
        self.inner.begin(name, block_len)
    }

    fn block(&mut self, hash: BlockHash) -> Result<()> {
        self.guard.record("block")?;
        self.inner.block(hash)
    }

    fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.guard.next_round(block_len)?;
        self.inner.next_round(block_len)
    }

    fn end_round(&mut self) -> Result<()> {
        self.guard.record("end_round")?;
        self.inner.end_round()
    }

    fn end(&mut self, digest: StrongHash, size: u64) -> Result<()> {
        self.guard.end()?;
        self.inner.end(digest, size)
    }

    // A missing object still closes its stream with `end`.
    fn on_error(&mut self, err: &SyncError) {
        if !err.is_no_object_error() {
            self.guard.fail();
        }
        self.inner.on_error(err)
    }
}
