// Rebuilding an object from a delta stream.
//
// `Reconstructor` reads equal blocks from the comparison object and writes
// the new object separately. `InPlaceReconstructor` reads and writes the
// same object and relies on the stream arriving in in-place order.

use crate::error::{Result, SyncError};
use crate::hash::table::TargetPosition;
use crate::script::EditScript;
use crate::source::{ByteSource, MemorySource, ObjectWriter};
use crate::stream::DeltaSink;

/// Bytes written by a reconstruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub equal_blocks: u64,
    pub equal_bytes: u64,
    pub diff_records: u64,
    pub diff_bytes: u64,
    pub total_size: u64,
}

fn copy_block<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut Vec<u8>,
    from: u64,
    to: u64,
    len: u32,
) -> Result<()>
where
    R: ByteSource + ?Sized,
    W: ObjectWriter + ?Sized,
{
    buf.resize(len as usize, 0);
    reader.read_exact_at(from, buf)?;
    writer.write_at(to, buf)
}

// ---------------------------------------------------------------------------
// Separate output
// ---------------------------------------------------------------------------

/// Applies a delta stream, reading equal blocks from `target` and writing
/// everything to `out`.
#[derive(Debug)]
pub struct Reconstructor<R, W> {
    target: R,
    out: W,
    buf: Vec<u8>,
    stats: ApplyStats,
    failed: Option<String>,
}

impl<R: ByteSource, W: ObjectWriter> Reconstructor<R, W> {
    pub fn new(target: R, out: W) -> Self {
        Self {
            target,
            out,
            buf: Vec::new(),
            stats: ApplyStats::default(),
            failed: None,
        }
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    /// Error message reported by the sender, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    pub fn into_output(self) -> W {
        self.out
    }
}

impl<R: ByteSource, W: ObjectWriter> DeltaSink for Reconstructor<R, W> {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        log::debug!("reconstructing {name}, block length {block_len}");
        self.stats = ApplyStats::default();
        self.failed = None;
        Ok(())
    }

    fn equal(
        &mut self,
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    ) -> Result<()> {
        copy_block(
            &mut self.target,
            &mut self.out,
            &mut self.buf,
            position.absolute(block_len),
            source_offset,
            block_len,
        )?;
        self.stats.equal_blocks += 1;
        self.stats.equal_bytes += block_len as u64;
        Ok(())
    }

    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()> {
        self.out.write_at(source_offset, data)?;
        self.stats.diff_records += 1;
        self.stats.diff_bytes += data.len() as u64;
        Ok(())
    }

    fn end(&mut self, total_size: u64) -> Result<()> {
        ObjectWriter::set_len(&mut self.out, total_size)?;
        self.out.flush()?;
        self.stats.total_size = total_size;
        Ok(())
    }

    fn on_error(&mut self, err: &SyncError) {
        log::warn!("reconstruction aborted: {err}");
        self.failed = Some(err.to_string());
    }
}

// ---------------------------------------------------------------------------
// In place
// ---------------------------------------------------------------------------

/// Applies an in-place ordered delta stream to a single object.
#[derive(Debug)]
pub struct InPlaceReconstructor<O> {
    object: O,
    buf: Vec<u8>,
    stats: ApplyStats,
    failed: Option<String>,
}

impl<O: ByteSource + ObjectWriter> InPlaceReconstructor<O> {
    pub fn new(object: O) -> Self {
        Self {
            object,
            buf: Vec::new(),
            stats: ApplyStats::default(),
            failed: None,
        }
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    pub fn failure(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    pub fn into_inner(self) -> O {
        self.object
    }
}

impl<O: ByteSource + ObjectWriter> DeltaSink for InPlaceReconstructor<O> {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        log::debug!("rewriting {name} in place, block length {block_len}");
        self.stats = ApplyStats::default();
        self.failed = None;
        if !self.object.exists() {
            return Ok(());
        }
        self.object.open()
    }

    fn equal(
        &mut self,
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    ) -> Result<()> {
        let from = position.absolute(block_len);
        if from != source_offset {
            let mut buf = std::mem::take(&mut self.buf);
            buf.resize(block_len as usize, 0);
            self.object.read_exact_at(from, &mut buf)?;
            self.object.write_at(source_offset, &buf)?;
            self.buf = buf;
        }
        self.stats.equal_blocks += 1;
        self.stats.equal_bytes += block_len as u64;
        Ok(())
    }

    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()> {
        self.object.write_at(source_offset, data)?;
        self.stats.diff_records += 1;
        self.stats.diff_bytes += data.len() as u64;
        Ok(())
    }

    fn end(&mut self, total_size: u64) -> Result<()> {
        ObjectWriter::set_len(&mut self.object, total_size)?;
        self.object.flush()?;
        self.stats.total_size = total_size;
        Ok(())
    }

    fn on_error(&mut self, err: &SyncError) {
        log::warn!("in-place rewrite aborted: {err}");
        self.failed = Some(err.to_string());
    }
}

// ---------------------------------------------------------------------------
// Buffer helpers
// ---------------------------------------------------------------------------

/// Rebuild the source object from `target` and a recorded script.
pub fn apply(target: &[u8], script: &EditScript) -> Result<Vec<u8>> {
    let mut r = Reconstructor::new(
        MemorySource::new(script.name.clone(), target.to_vec()),
        Vec::with_capacity(script.total_size as usize),
    );
    script.replay(&mut r)?;
    Ok(r.into_output())
}

/// Rewrite `buf` in place. `script` must already be in in-place order with
/// every diff materialized.
pub fn apply_in_place(buf: &mut Vec<u8>, script: &EditScript) -> Result<ApplyStats> {
    let object = MemorySource::new(script.name.clone(), std::mem::take(buf));
    let mut r = InPlaceReconstructor::new(object);
    let result = script.replay(&mut r);
    let stats = r.stats();
    *buf = r.into_inner().into_inner();
    result.map(|()| stats)
}
