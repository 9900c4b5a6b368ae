//! Pattern Generator (C1).
//!
//! Produces a deterministic sequence of block-sized fill patterns for the
//! current wiping method and pass number. Transcribed from
//! `wfs_wiping.c::fill_buffer` in the original implementation, including its
//! pattern tables and its "which passes are random" rule.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seed constant XORed with wall-clock seconds at startup. Pattern
/// reproducibility across runs is explicitly not required.
const SEED_CONSTANT: u64 = 0x5EED_FACE_F00D_BAAD;

/// Patterns used by the "random" method (taken from `shred`, 3/4-bit words).
const PATTERNS_RANDOM: &[u16] = &[
    0x000, 0xFFF, 0x555, 0xAAA, 0x249, 0x492, 0x6DB, 0x924, 0xB6D, 0xDB6, 0x111, 0x222, 0x333,
    0x444, 0x666, 0x777, 0x888, 0x999, 0xBBB, 0xCCC, 0xDDD, 0xEEE,
];

/// Gutmann's patterns: the same as `PATTERNS_RANDOM`, plus five entries the
/// method reuses a second time.
const PATTERNS_GUTMANN: &[u16] = &[
    0x000, 0xFFF, 0x555, 0xAAA, 0x249, 0x492, 0x6DB, 0x924, 0xB6D, 0xDB6, 0x111, 0x222, 0x333,
    0x444, 0x666, 0x777, 0x888, 0x999, 0xBBB, 0xCCC, 0xDDD, 0xEEE, 0x555, 0xAAA, 0x249, 0x492,
    0x924,
];

const PATTERNS_SCHNEIER: &[u16] = &[0xFFF, 0x000];

/// Methods supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeMethod {
    Gutmann,
    Random,
    Schneier,
    /// DoD 5220.22-M: pass 0 is a random byte, pass 1 its complement, pass 2
    /// random. The random byte is drawn once per session, not per block.
    Dod,
}

impl WipeMethod {
    /// Case-insensitive parse, as accepted by `--method`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gutmann" => Some(WipeMethod::Gutmann),
            "random" => Some(WipeMethod::Random),
            "schneier" => Some(WipeMethod::Schneier),
            "dod" => Some(WipeMethod::Dod),
            _ => None,
        }
    }

    fn pattern_table(self) -> &'static [u16] {
        match self {
            WipeMethod::Gutmann => PATTERNS_GUTMANN,
            WipeMethod::Random => PATTERNS_RANDOM,
            WipeMethod::Schneier => PATTERNS_SCHNEIER,
            // DoD's table is session-specific (random byte + complement); the
            // session carries it separately in `PatternSelection::dod_table`.
            WipeMethod::Dod => &[],
        }
    }

    /// Natural total pass count for this method (used when `-n 0`).
    pub fn default_pass_count(self) -> u64 {
        match self {
            WipeMethod::Gutmann => PATTERNS_GUTMANN.len() as u64 + 4 + 1 + 4,
            WipeMethod::Random => PATTERNS_RANDOM.len() as u64 + 1 + 1 + 1,
            WipeMethod::Schneier => PATTERNS_SCHNEIER.len() as u64 + 5,
            WipeMethod::Dod => 2 + 1,
        }
    }

    /// True if pass `pat_no` (of `total` passes) draws a fresh random word
    /// each time it is used, rather than picking a table entry.
    fn is_pass_random(self, pat_no: u64, total: u64) -> bool {
        match self {
            WipeMethod::Gutmann => {
                pat_no == 0
                    || pat_no == total - 1
                    || pat_no == total / 2
                    || pat_no == 1
                    || pat_no == 2
                    || pat_no == 3
                    || pat_no == total - 2
                    || pat_no == total - 3
                    || pat_no == total - 4
            }
            WipeMethod::Random => pat_no == 0 || pat_no == total - 1 || pat_no == total / 2,
            WipeMethod::Schneier | WipeMethod::Dod => pat_no >= 2,
        }
    }
}

/// Per-session wiping configuration consumed by the generator.
#[derive(Debug, Clone)]
pub struct SessionWipeConfig {
    pub method: WipeMethod,
    /// Total pass count for this session (0 in `-n` means "use the
    /// method's natural length" and must be resolved before this is built).
    pub total_passes: u64,
    /// Force every pattern to all-zero bytes.
    pub all_zeros: bool,
}

/// Per-block/session pattern selection state: which deterministic patterns
/// have already been used, and (for DoD) the session's random byte pair.
pub struct PatternSelection {
    used: Vec<bool>,
    dod_table: [u16; 2],
    rng: StdRng,
}

impl PatternSelection {
    pub fn new(method: WipeMethod) -> Self {
        let mut rng = StdRng::seed_from_u64(
            SEED_CONSTANT
                ^ SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
        );
        let npat = match method {
            WipeMethod::Dod => 2,
            other => other.pattern_table().len(),
        };
        let dod_byte: u16 = rng.gen::<u16>() & 0xFFF;
        PatternSelection {
            used: vec![false; npat],
            dod_table: [dod_byte, (!dod_byte) & 0xFFF],
            rng,
        }
    }

    fn table(&self, method: WipeMethod) -> &[u16] {
        match method {
            WipeMethod::Dod => &self.dod_table,
            other => other.pattern_table(),
        }
    }

    /// Clears the used-pattern bitmap so the next block starts its pass
    /// sequence with a fresh pick of table entries. `wfs_wiping.c`'s
    /// `selected[]` array is a local of `fill_buffer`'s caller, reset for
    /// every block; `dod_table`/`rng` stay untouched, since the DoD random
    /// byte is drawn once per session, not per block.
    pub fn reset_used(&mut self) {
        for u in self.used.iter_mut() {
            *u = false;
        }
    }
}

/// Pattern Generator (C1): fills a destination buffer with one pass's
/// pattern, expanded to the buffer's full length.
pub struct PatternGenerator;

impl PatternGenerator {
    pub fn new() -> Self {
        PatternGenerator
    }

    /// Fills `dest[..len]` with the pattern for pass `pass_index`.
    pub fn fill(
        &self,
        pass_index: u64,
        dest: &mut [u8],
        selection: &mut PatternSelection,
        session: &SessionWipeConfig,
    ) {
        let len = dest.len();
        if len == 0 {
            return;
        }
        let npat = selection.table(session.method).len();
        if npat > 0 {
            if selection.used.iter().all(|&u| u)
                && !session
                    .method
                    .is_pass_random(pass_index % session.total_passes, session.total_passes)
            {
                for u in selection.used.iter_mut() {
                    *u = false;
                }
            }
        }

        let pat_no = pass_index % session.total_passes;
        let bits: u16 = if session.all_zeros {
            0
        } else if session.method.is_pass_random(pat_no, session.total_passes) {
            selection.rng.gen::<u16>() & 0xFFF
        } else {
            let i = match session.method {
                WipeMethod::Gutmann | WipeMethod::Random => {
                    let table = selection.table(session.method);
                    loop {
                        let cand = (selection.rng.gen::<usize>()) % table.len();
                        if !selection.used[cand] {
                            break cand;
                        }
                        if selection.used.iter().all(|&u| u) {
                            break cand;
                        }
                    }
                }
                WipeMethod::Schneier | WipeMethod::Dod => (pat_no as usize).min(npat - 1),
            };
            let table = selection.table(session.method);
            let word = table[i];
            if i < selection.used.len() {
                selection.used[i] = true;
            }
            word
        };

        Self::expand(bits, dest);
    }

    /// Expands a 12-bit pattern word into a byte buffer: 3 bytes, doubled
    /// until at least `len`, then a tail copy to reach exactly `len`.
    fn expand(bits: u16, buffer: &mut [u8]) {
        let len = buffer.len();
        buffer[0] = ((bits >> 4) & 0xFF) as u8;
        if len > 1 {
            buffer[1] = ((bits >> 8) & 0xFF) as u8;
        }
        if len > 2 {
            buffer[2] = (bits & 0xFF) as u8;
        }
        let mut i = 3usize;
        while (i << 1) < len {
            let (head, tail) = buffer.split_at_mut(i);
            tail[..i].copy_from_slice(&head[..i]);
            i <<= 1;
        }
        if i < len {
            let (head, tail) = buffer.split_at_mut(i);
            tail.copy_from_slice(&head[..len - i]);
        }
    }
}

impl Default for PatternGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_replicates_three_byte_word() {
        let mut buf = [0u8; 13];
        PatternGenerator::expand(0xABC, &mut buf);
        assert_eq!(&buf[0..3], &[0x0A, 0xBC, 0x00]);
        assert_eq!(buf.len(), 13);
        // the first 3 bytes must repeat across the whole buffer
        for i in 3..13 {
            assert_eq!(buf[i], buf[i % 3]);
        }
    }

    #[test]
    fn all_zero_override_forces_zero_pattern() {
        let mut selection = PatternSelection::new(WipeMethod::Gutmann);
        let session = SessionWipeConfig {
            method: WipeMethod::Gutmann,
            total_passes: WipeMethod::Gutmann.default_pass_count(),
            all_zeros: true,
        };
        let gen = PatternGenerator::new();
        let mut buf = [0xFFu8; 16];
        gen.fill(0, &mut buf, &mut selection, &session);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn dod_second_pass_is_complement_of_first() {
        let selection = PatternSelection::new(WipeMethod::Dod);
        let (a, b) = (selection.dod_table[0], selection.dod_table[1]);
        assert_eq!(a ^ b, 0xFFF);
    }

    #[test]
    fn schneier_pass_count_matches_method_table() {
        assert_eq!(WipeMethod::Schneier.default_pass_count(), 2 + 5);
        assert_eq!(WipeMethod::Dod.default_pass_count(), 3);
    }

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!(WipeMethod::parse("DoD"), Some(WipeMethod::Dod));
        assert_eq!(WipeMethod::parse("GUTMANN"), Some(WipeMethod::Gutmann));
        assert_eq!(WipeMethod::parse("bogus"), None);
    }
}
