// Strong block hash: 16-byte MD4 digest.
//
// Confirms content equality after a weak-hash bucket hit. MD4 is used for
// accidental-collision resistance only, not for integrity.

use std::fmt;

use digest::Digest;

use crate::error::Result;
use crate::source::ByteSource;

/// Digest width in bytes.
pub const DIGEST_BYTES: usize = 16;

/// A 16-byte content digest, ordered bytewise.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StrongHash(pub [u8; DIGEST_BYTES]);

impl StrongHash {
    pub const ZERO: StrongHash = StrongHash([0; DIGEST_BYTES]);

    /// Digest of one block.
    #[inline]
    pub fn of(data: &[u8]) -> Self {
        Self(md4::Md4::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::with_capacity(DIGEST_BYTES * 2);
        for b in self.0 {
            let _ = write!(out, "{b:02x}");
        }
        out
    }
}

impl fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongHash({})", self.to_hex())
    }
}

impl From<[u8; DIGEST_BYTES]> for StrongHash {
    fn from(bytes: [u8; DIGEST_BYTES]) -> Self {
        Self(bytes)
    }
}

/// Shorthand for [`StrongHash::of`].
#[inline]
pub fn strong_hash(data: &[u8]) -> StrongHash {
    StrongHash::of(data)
}

// ---------------------------------------------------------------------------
// Whole-object digest
// ---------------------------------------------------------------------------

/// Streaming digest over a whole object.
#[derive(Clone, Default)]
pub struct ObjectDigest {
    inner: md4::Md4,
    len: u64,
}

impl ObjectDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> StrongHash {
        StrongHash(self.inner.finalize().into())
    }

    /// Digest everything from the start of `reader` to its end.
    pub fn of_source<R: ByteSource + ?Sized>(reader: &mut R, buf_len: usize) -> Result<StrongHash> {
        reader.seek_to(0)?;
        let mut digest = Self::new();
        let mut buf = vec![0u8; buf_len.max(1)];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        Ok(digest.finalize())
    }
}
