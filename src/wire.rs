// Minimal framing for hash and delta event streams.
//
// Every frame is a 6-byte header (u16 type, u32 payload length, both
// little-endian) followed by the payload. Integers inside payloads are
// little-endian; strong hashes are always 16 raw bytes.
//
//   hash stream:  HashBegin  (HashBlock | RoundBegin | RoundEnd)* HashEnd
//   delta stream: DeltaBegin (Equal | Diff | RoundBegin | RoundEnd)* DeltaEnd
//
// Either stream may carry an Error frame. For a hash stream a not-found
// error is still followed by HashEnd; anything else terminates the stream.

use std::io::{self, Read, Write};

use bitflags::bitflags;

use crate::error::{Result, SyncError};
use crate::hash::strong::{DIGEST_BYTES, StrongHash};
use crate::hash::table::{BlockHash, TargetPosition};
use crate::stream::{DeltaSink, Guarded, HashSink};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const HEADER_LEN: usize = 6;

/// Largest diff carried by one frame; longer runs are split.
pub const MAX_DIFF_CHUNK: usize = 1 << 24;

/// Payloads above this are rejected as malformed.
pub const MAX_PAYLOAD: u32 = MAX_DIFF_CHUNK as u32 + 64;

bitflags! {
    /// Stream options announced in the begin frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncFlags: u16 {
        const MULTIROUND = 1 << 0;
        const IN_PLACE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    HashBegin = 1,
    HashBlock = 2,
    HashEnd = 3,
    DeltaBegin = 4,
    Equal = 5,
    Diff = 6,
    RoundBegin = 7,
    RoundEnd = 8,
    DeltaEnd = 9,
    Error = 10,
}

impl TryFrom<u16> for FrameType {
    type Error = SyncError;

    fn try_from(v: u16) -> Result<Self> {
        Ok(match v {
            1 => FrameType::HashBegin,
            2 => FrameType::HashBlock,
            3 => FrameType::HashEnd,
            4 => FrameType::DeltaBegin,
            5 => FrameType::Equal,
            6 => FrameType::Diff,
            7 => FrameType::RoundBegin,
            8 => FrameType::RoundEnd,
            9 => FrameType::DeltaEnd,
            10 => FrameType::Error,
            other => return Err(SyncError::Frame(format!("unknown frame type {other}"))),
        })
    }
}

// ---------------------------------------------------------------------------
// Decoded frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    HashBegin {
        name: String,
        block_len: u32,
        flags: SyncFlags,
    },
    HashBlock(BlockHash),
    HashEnd {
        digest: StrongHash,
        size: u64,
    },
    DeltaBegin {
        name: String,
        block_len: u32,
        flags: SyncFlags,
    },
    Equal {
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    },
    Diff {
        source_offset: u64,
        data: Vec<u8>,
    },
    RoundBegin {
        block_len: u32,
    },
    RoundEnd,
    DeltaEnd {
        total_size: u64,
    },
    Error {
        code: i32,
        message: String,
    },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::HashBegin { .. } => FrameType::HashBegin,
            Self::HashBlock(_) => FrameType::HashBlock,
            Self::HashEnd { .. } => FrameType::HashEnd,
            Self::DeltaBegin { .. } => FrameType::DeltaBegin,
            Self::Equal { .. } => FrameType::Equal,
            Self::Diff { .. } => FrameType::Diff,
            Self::RoundBegin { .. } => FrameType::RoundBegin,
            Self::RoundEnd => FrameType::RoundEnd,
            Self::DeltaEnd { .. } => FrameType::DeltaEnd,
            Self::Error { .. } => FrameType::Error,
        }
    }

    /// Encode header and payload.
    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let mut p = Vec::new();
        match self {
            Self::HashBegin {
                name,
                block_len,
                flags,
            }
            | Self::DeltaBegin {
                name,
                block_len,
                flags,
            } => {
                p.extend_from_slice(&block_len.to_le_bytes());
                p.extend_from_slice(&flags.bits().to_le_bytes());
                p.extend_from_slice(name.as_bytes());
            }
            Self::HashBlock(b) => {
                p.extend_from_slice(&b.weak.to_le_bytes());
                p.extend_from_slice(&b.position.block_index.to_le_bytes());
                p.extend_from_slice(&b.position.base_offset.to_le_bytes());
                p.extend_from_slice(b.strong.as_bytes());
            }
            Self::HashEnd { digest, size } => {
                p.extend_from_slice(digest.as_bytes());
                p.extend_from_slice(&size.to_le_bytes());
            }
            Self::Equal {
                position,
                block_len,
                source_offset,
            } => {
                p.extend_from_slice(&position.block_index.to_le_bytes());
                p.extend_from_slice(&position.base_offset.to_le_bytes());
                p.extend_from_slice(&block_len.to_le_bytes());
                p.extend_from_slice(&source_offset.to_le_bytes());
            }
            Self::Diff {
                source_offset,
                data,
            } => {
                p.extend_from_slice(&source_offset.to_le_bytes());
                p.extend_from_slice(data);
            }
            Self::RoundBegin { block_len } => p.extend_from_slice(&block_len.to_le_bytes()),
            Self::RoundEnd => {}
            Self::DeltaEnd { total_size } => p.extend_from_slice(&total_size.to_le_bytes()),
            Self::Error { code, message } => {
                p.extend_from_slice(&code.to_le_bytes());
                p.extend_from_slice(message.as_bytes());
            }
        }
        write_header(w, self.frame_type(), p.len())?;
        w.write_all(&p)
    }

    /// Decode a payload of the given type.
    pub fn decode(ty: FrameType, payload: &[u8]) -> Result<Self> {
        let mut p = Payload::new(ty, payload);
        let frame = match ty {
            FrameType::HashBegin | FrameType::DeltaBegin => {
                let block_len = p.u32()?;
                let bits = p.u16()?;
                let flags = SyncFlags::from_bits(bits)
                    .ok_or_else(|| SyncError::Frame(format!("unknown flag bits {bits:#06x}")))?;
                let name = p.text()?;
                if ty == FrameType::HashBegin {
                    Self::HashBegin {
                        name,
                        block_len,
                        flags,
                    }
                } else {
                    Self::DeltaBegin {
                        name,
                        block_len,
                        flags,
                    }
                }
            }
            FrameType::HashBlock => {
                let weak = p.u32()?;
                let block_index = p.u64()?;
                let base_offset = p.u64()?;
                let strong = p.hash()?;
                Self::HashBlock(BlockHash {
                    weak,
                    strong,
                    position: TargetPosition::new(base_offset, block_index),
                })
            }
            FrameType::HashEnd => Self::HashEnd {
                digest: p.hash()?,
                size: p.u64()?,
            },
            FrameType::Equal => {
                let block_index = p.u64()?;
                let base_offset = p.u64()?;
                Self::Equal {
                    position: TargetPosition::new(base_offset, block_index),
                    block_len: p.u32()?,
                    source_offset: p.u64()?,
                }
            }
            FrameType::Diff => Self::Diff {
                source_offset: p.u64()?,
                data: p.rest().to_vec(),
            },
            FrameType::RoundBegin => Self::RoundBegin {
                block_len: p.u32()?,
            },
            FrameType::RoundEnd => Self::RoundEnd,
            FrameType::DeltaEnd => Self::DeltaEnd {
                total_size: p.u64()?,
            },
            FrameType::Error => Self::Error {
                code: p.i32()?,
                message: p.text()?,
            },
        };
        p.finish()?;
        Ok(frame)
    }
}

fn write_header<W: Write + ?Sized>(w: &mut W, ty: FrameType, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame payload too large"))?;
    let mut h = [0u8; HEADER_LEN];
    h[..2].copy_from_slice(&(ty as u16).to_le_bytes());
    h[2..].copy_from_slice(&len.to_le_bytes());
    w.write_all(&h)
}

/// Split a header into frame type and payload length.
pub fn decode_header(h: &[u8; HEADER_LEN]) -> Result<(FrameType, u32)> {
    let ty = FrameType::try_from(u16::from_le_bytes([h[0], h[1]]))?;
    let len = u32::from_le_bytes([h[2], h[3], h[4], h[5]]);
    if len > MAX_PAYLOAD {
        return Err(SyncError::Frame(format!("{ty:?} payload of {len} bytes")));
    }
    Ok((ty, len))
}

struct Payload<'a> {
    ty: FrameType,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    fn new(ty: FrameType, buf: &'a [u8]) -> Self {
        Self { ty, buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            SyncError::Frame(format!("{:?} payload truncated at byte {}", self.ty, self.pos))
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Result<i32> {
        self.take().map(i32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64> {
        self.take().map(u64::from_le_bytes)
    }

    fn hash(&mut self) -> Result<StrongHash> {
        self.take::<DIGEST_BYTES>().map(StrongHash::from)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn text(&mut self) -> Result<String> {
        let ty = self.ty;
        String::from_utf8(self.rest().to_vec())
            .map_err(|_| SyncError::Frame(format!("{ty:?} text is not UTF-8")))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(SyncError::Frame(format!(
                "{:?} payload has {} trailing bytes",
                self.ty,
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes hash or delta events as frames.
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    inner: W,
    flags: SyncFlags,
    frames: u64,
    bytes: u64,
    /// Write failure raised inside `on_error`, which cannot return it.
    deferred: Option<SyncError>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            flags: SyncFlags::empty(),
            frames: 0,
            bytes: 0,
            deferred: None,
        }
    }

    pub fn with_flags(mut self, flags: SyncFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Bytes written, headers included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush and return the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        self.inner
            .flush()
            .map_err(|e| SyncError::io("flush frames", e))?;
        Ok(self.inner)
    }

    fn put(&mut self, ty: FrameType, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let w = &mut self.inner;
        let res = write_header(w, ty, len)
            .and_then(|()| parts.iter().try_for_each(|p| w.write_all(p)));
        res.map_err(|e| SyncError::io(format!("write {ty:?} frame"), e))?;
        self.frames += 1;
        self.bytes += (HEADER_LEN + len) as u64;
        log::trace!("frame {ty:?} ({len} bytes)");
        Ok(())
    }

    fn put_begin(&mut self, ty: FrameType, name: &str, block_len: u32) -> Result<()> {
        let flags = self.flags.bits();
        self.put(
            ty,
            &[&block_len.to_le_bytes(), &flags.to_le_bytes(), name.as_bytes()],
        )
    }

    fn put_error(&mut self, err: &SyncError) {
        let code = err.code();
        let message = match err {
            SyncError::NotFound { name } => name.clone(),
            other => other.to_string(),
        };
        if let Err(e) = self.put(FrameType::Error, &[&code.to_le_bytes(), message.as_bytes()]) {
            log::warn!("could not forward error frame: {e}");
            self.deferred.get_or_insert(e);
        }
    }
}

impl<W: Write> HashSink for FrameWriter<W> {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        self.put_begin(FrameType::HashBegin, name, block_len)
    }

    fn block(&mut self, hash: BlockHash) -> Result<()> {
        self.put(
            FrameType::HashBlock,
            &[
                &hash.weak.to_le_bytes(),
                &hash.position.block_index.to_le_bytes(),
                &hash.position.base_offset.to_le_bytes(),
                hash.strong.as_bytes(),
            ],
        )
    }

    fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.put(FrameType::RoundBegin, &[&block_len.to_le_bytes()])
    }

    fn end_round(&mut self) -> Result<()> {
        self.put(FrameType::RoundEnd, &[])
    }

    fn end(&mut self, digest: StrongHash, size: u64) -> Result<()> {
        self.put(FrameType::HashEnd, &[digest.as_bytes(), &size.to_le_bytes()])
    }

    fn on_error(&mut self, err: &SyncError) {
        self.put_error(err)
    }
}

impl<W: Write> DeltaSink for FrameWriter<W> {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        self.put_begin(FrameType::DeltaBegin, name, block_len)
    }

    fn equal(
        &mut self,
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    ) -> Result<()> {
        self.put(
            FrameType::Equal,
            &[
                &position.block_index.to_le_bytes(),
                &position.base_offset.to_le_bytes(),
                &block_len.to_le_bytes(),
                &source_offset.to_le_bytes(),
            ],
        )
    }

    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()> {
        let mut offset = source_offset;
        for chunk in data.chunks(MAX_DIFF_CHUNK) {
            self.put(FrameType::Diff, &[&offset.to_le_bytes(), chunk])?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.put(FrameType::RoundBegin, &[&block_len.to_le_bytes()])
    }

    fn end_round(&mut self) -> Result<()> {
        self.put(FrameType::RoundEnd, &[])
    }

    fn end(&mut self, total_size: u64) -> Result<()> {
        self.put(FrameType::DeltaEnd, &[&total_size.to_le_bytes()])
    }

    fn on_error(&mut self, err: &SyncError) {
        self.put_error(err)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Header of a replayed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub block_len: u32,
    pub flags: SyncFlags,
}

/// Reads frames and replays them into sinks.
#[derive(Debug)]
pub struct FrameReader<R: Read> {
    inner: R,
    payload: Vec<u8>,
    frames: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            payload: Vec::new(),
            frames: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Next frame, or `None` at a clean end of input.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut h = [0u8; HEADER_LEN];
        let mut got = 0;
        while got < HEADER_LEN {
            match self.inner.read(&mut h[got..]) {
                Ok(0) if got == 0 => return Ok(None),
                Ok(0) => {
                    return Err(SyncError::Frame(format!(
                        "input ends inside a frame header ({got} of {HEADER_LEN} bytes)"
                    )));
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SyncError::io("read frame header", e)),
            }
        }
        let (ty, len) = decode_header(&h)?;
        self.payload.resize(len as usize, 0);
        self.inner.read_exact(&mut self.payload).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SyncError::Frame(format!("{ty:?} payload truncated, expected {len} bytes"))
            } else {
                SyncError::io("read frame payload", e)
            }
        })?;
        self.frames += 1;
        Frame::decode(ty, &self.payload).map(Some)
    }

    fn require_frame(&mut self) -> Result<Frame> {
        self.read_frame()?
            .ok_or_else(|| SyncError::Frame("stream ends before its end frame".into()))
    }

    /// Replay one hash stream into `sink`.
    pub fn replay_hashes<S: HashSink>(&mut self, sink: S) -> Result<StreamInfo> {
        let mut sink = Guarded::new(sink);
        let info = match self.require_frame()? {
            Frame::HashBegin {
                name,
                block_len,
                flags,
            } => {
                sink.begin(&name, block_len)?;
                StreamInfo {
                    name,
                    block_len,
                    flags,
                }
            }
            other => return Err(unexpected("HashBegin", &other)),
        };
        loop {
            let frame = match self.require_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    sink.on_error(&e);
                    return Err(e);
                }
            };
            match frame {
                Frame::HashBlock(b) => sink.block(b)?,
                Frame::RoundBegin { block_len } => sink.next_round(block_len)?,
                Frame::RoundEnd => sink.end_round()?,
                Frame::HashEnd { digest, size } => {
                    sink.end(digest, size)?;
                    return Ok(info);
                }
                Frame::Error { code, message } => {
                    let err = SyncError::from_code(code, message);
                    sink.on_error(&err);
                    if !err.is_no_object_error() {
                        return Err(err);
                    }
                }
                other => return Err(unexpected("hash record", &other)),
            }
        }
    }

    /// Replay one delta stream into `sink`.
    pub fn replay_delta<S: DeltaSink>(&mut self, sink: S) -> Result<StreamInfo> {
        let mut sink = Guarded::new(sink);
        let info = match self.require_frame()? {
            Frame::DeltaBegin {
                name,
                block_len,
                flags,
            } => {
                sink.begin(&name, block_len)?;
                StreamInfo {
                    name,
                    block_len,
                    flags,
                }
            }
            Frame::Error { code, message } => {
                let err = SyncError::from_code(code, message);
                sink.on_error(&err);
                return Err(err);
            }
            other => return Err(unexpected("DeltaBegin", &other)),
        };
        loop {
            let frame = match self.require_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    sink.on_error(&e);
                    return Err(e);
                }
            };
            let step = match frame {
                Frame::Equal {
                    position,
                    block_len,
                    source_offset,
                } => sink.equal(position, block_len, source_offset),
                Frame::Diff {
                    source_offset,
                    data,
                } => sink.diff(&data, source_offset),
                Frame::RoundBegin { block_len } => sink.next_round(block_len),
                Frame::RoundEnd => sink.end_round(),
                Frame::DeltaEnd { total_size } => {
                    sink.end(total_size)?;
                    return Ok(info);
                }
                Frame::Error { code, message } => {
                    let err = SyncError::from_code(code, message);
                    sink.on_error(&err);
                    return Err(err);
                }
                other => Err(unexpected("delta record", &other)),
            };
            if let Err(e) = step {
                sink.on_error(&e);
                return Err(e);
            }
        }
    }
}

fn unexpected(wanted: &str, got: &Frame) -> SyncError {
    SyncError::protocol(format!("expected {wanted}, got {:?} frame", got.frame_type()))
}
