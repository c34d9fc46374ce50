// Block-size limits and tuning profiles.
//
// Each profile bounds block lengths for single-round and multi-round passes
// and the scan buffer used by the matcher. `LOW_MEMORY` trades larger
// record counts for a smaller working set.

/// Smallest block length used by any pass.
pub const MIN_BLOCK: u32 = 400;

/// Largest block length chosen for a single-round pass (128 KiB).
pub const MAX_BLOCK: u32 = 1 << 17;

/// Divisor applied to the block length between multi-round passes.
pub const MULTIROUND_BASE: u32 = 3;

/// Tuning limits for hashing and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    /// Name for display purposes.
    pub name: &'static str,
    /// Floor for every block length (also the multi-round stopping point).
    pub min_block: u32,
    /// Ceiling for single-round block lengths.
    pub max_block: u32,
    /// Ceiling for the first multi-round block length.
    pub multiround_max_block: u32,
    /// Divisor between rounds.
    pub multiround_base: u32,
    /// Upper bound on the matcher's read buffer.
    pub buffer_len: usize,
}

pub const DEFAULT: BlockConfig = BlockConfig {
    name: "default",
    min_block: MIN_BLOCK,
    max_block: MAX_BLOCK,
    multiround_max_block: 1 << 22,
    multiround_base: MULTIROUND_BASE,
    buffer_len: 1 << 25,
};

pub const LOW_MEMORY: BlockConfig = BlockConfig {
    name: "low-memory",
    min_block: MIN_BLOCK,
    max_block: MAX_BLOCK,
    multiround_max_block: 1 << 20,
    multiround_base: MULTIROUND_BASE,
    buffer_len: 1 << 23,
};

impl Default for BlockConfig {
    fn default() -> Self {
        DEFAULT
    }
}

/// Look up a profile by name.
pub fn config_for_profile(name: &str) -> Option<BlockConfig> {
    match name {
        "default" => Some(DEFAULT),
        "low-memory" | "low_memory" => Some(LOW_MEMORY),
        _ => None,
    }
}

/// Single-round block length for an object of `filesize` bytes under `DEFAULT`.
pub fn block_length_for(filesize: u64) -> u32 {
    DEFAULT.block_length_for(filesize)
}

impl BlockConfig {
    /// `log2(filesize) * cbrt(filesize)`, clamped to `[min_block, max_block]`.
    pub fn block_length_for(&self, filesize: u64) -> u32 {
        if filesize <= 1 {
            return self.min_block;
        }
        let size = filesize as f64;
        let raw = size.log2() * size.cbrt();
        // Float-to-int casts saturate, so huge inputs land on max_block.
        (raw as u64).clamp(self.min_block as u64, self.max_block as u64) as u32
    }

    /// First block length of a multi-round pass.
    pub fn multiround_initial(&self, filesize: u64) -> u32 {
        let base = self.multiround_base.max(2) as u64;
        (filesize / base).clamp(self.min_block as u64, self.multiround_max_block as u64) as u32
    }

    /// Block length of the round after `block_len`, or `None` once it would
    /// fall at or below `min_block`.
    pub fn next_round(&self, block_len: u32) -> Option<u32> {
        let next = block_len / self.multiround_base.max(2);
        (next > self.min_block).then_some(next)
    }

    /// Every block length a multi-round pass starting at `initial` visits.
    pub fn round_lengths(&self, initial: u32) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors(Some(initial), move |&b| self.next_round(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_objects_get_min_block() {
        assert_eq!(block_length_for(0), MIN_BLOCK);
        assert_eq!(block_length_for(1), MIN_BLOCK);
        assert_eq!(block_length_for(1000), MIN_BLOCK);
    }

    #[test]
    fn block_length_grows_with_size() {
        let a = block_length_for(1 << 20);
        let b = block_length_for(1 << 30);
        assert!(a < b, "{a} should be < {b}");
        // 1 GiB: log2 = 30, cbrt = 1024.
        assert!((b as i64 - 30 * 1024).abs() <= 30, "got {b}");
    }

    #[test]
    fn huge_objects_hit_max_block() {
        assert_eq!(block_length_for(u64::MAX), MAX_BLOCK);
        assert_eq!(block_length_for(1 << 50), MAX_BLOCK);
    }

    #[test]
    fn multiround_initial_clamps() {
        assert_eq!(DEFAULT.multiround_initial(10), MIN_BLOCK);
        assert_eq!(DEFAULT.multiround_initial(3 * 10_000), 10_000);
        assert_eq!(DEFAULT.multiround_initial(u64::MAX), 1 << 22);
        assert_eq!(LOW_MEMORY.multiround_initial(u64::MAX), 1 << 20);
    }

    #[test]
    fn round_lengths_strictly_decrease_and_stop() {
        let initial = DEFAULT.multiround_initial(1 << 30);
        let rounds: Vec<u32> = DEFAULT.round_lengths(initial).collect();
        assert_eq!(rounds[0], initial);
        for w in rounds.windows(2) {
            assert!(w[1] < w[0]);
        }
        assert!(rounds.iter().all(|&b| b >= MIN_BLOCK));
        let bound = ((initial as f64 / MIN_BLOCK as f64).ln() / 3f64.ln()).ceil() as usize;
        assert!(rounds.len() <= bound.max(1), "{} rounds > {bound}", rounds.len());
    }

    #[test]
    fn next_round_stops_at_floor() {
        assert_eq!(DEFAULT.next_round(1200), None);
        assert_eq!(DEFAULT.next_round(1203), Some(401));
        assert_eq!(DEFAULT.next_round(MIN_BLOCK), None);
    }

    #[test]
    fn profile_lookup() {
        assert_eq!(config_for_profile("default"), Some(DEFAULT));
        assert_eq!(config_for_profile("low-memory"), Some(LOW_MEMORY));
        assert_eq!(config_for_profile("fast"), None);
    }
}
