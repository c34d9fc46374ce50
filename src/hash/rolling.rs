// Rolling weak hash (rsync "rollsum").
//
// Two 16-bit sums over a window of `count` bytes, each byte biased by
// CHAR_OFFSET:
//   s1 = sum(b_i + CHAR_OFFSET)
//   s2 = sum of the running s1 values
// The digest packs them as `(s2 << 16) | s1`. Seeding costs O(window);
// sliding by one byte costs O(1).

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Bias added to every byte before summing.
pub const CHAR_OFFSET: u32 = 31;

/// 32-bit weak hash of one window.
pub type WeakHash = u32;

// ---------------------------------------------------------------------------
// Rolling hasher
// ---------------------------------------------------------------------------

/// Incremental rollsum state over a sliding window.
#[derive(Debug, Clone, Default)]
pub struct RollingHasher {
    s1: u32,
    s2: u32,
    count: u32,
}

impl RollingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot weak hash of `block`.
    #[inline]
    pub fn checksum(block: &[u8]) -> WeakHash {
        let mut h = Self::new();
        h.update(block);
        h.value()
    }

    /// Reset and seed the window from `block`.
    #[inline]
    pub fn seed(&mut self, block: &[u8]) -> WeakHash {
        *self = Self::new();
        self.update(block);
        self.value()
    }

    /// Append bytes to the window.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        let mut s1 = self.s1;
        let mut s2 = self.s2;
        for &b in data {
            s1 = s1.wrapping_add(b as u32 + CHAR_OFFSET);
            s2 = s2.wrapping_add(s1);
        }
        self.s1 = s1 & 0xFFFF;
        self.s2 = s2 & 0xFFFF;
        self.count = self.count.wrapping_add(data.len() as u32);
    }

    /// Slide the window by one byte: drop `outgoing`, append `incoming`.
    #[inline(always)]
    pub fn roll(&mut self, outgoing: u8, incoming: u8) -> WeakHash {
        let out = outgoing as u32 + CHAR_OFFSET;
        self.s1 = self
            .s1
            .wrapping_add(incoming as u32)
            .wrapping_sub(outgoing as u32)
            & 0xFFFF;
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub(self.count.wrapping_mul(out))
            & 0xFFFF;
        self.value()
    }

    /// Current digest, `(s2 << 16) | s1`.
    #[inline(always)]
    pub fn value(&self) -> WeakHash {
        (self.s2 << 16) | (self.s1 & 0xFFFF)
    }

    /// Number of bytes in the window.
    pub fn window_len(&self) -> u32 {
        self.count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
