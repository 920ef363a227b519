use crate::deterministic::{INTERESTING_8, INTERESTING_16, INTERESTING_32, random_arithmetic};
use crate::mutator::Mutator;
use rand::Rng;
use rand_core::RngCore;

/// Output is never allowed to grow beyond this multiple of the input length.
pub const HAVOC_GROWTH_CAP: usize = 10;

const DEFAULT_MIN_STACK: u32 = 2;
const DEFAULT_MAX_STACK: u32 = 16;
const MAX_BLOCK: usize = 32;

/// Stacks a random number of random edits in one pass.
#[derive(Debug, Clone)]
pub struct HavocMutator {
    min_stack: u32,
    max_stack: u32,
}

impl Default for HavocMutator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_STACK, DEFAULT_MAX_STACK)
    }
}

impl HavocMutator {
    pub fn new(min_stack: u32, max_stack: u32) -> Self {
        let min_stack = min_stack.max(1);
        Self {
            min_stack,
            max_stack: max_stack.max(min_stack),
        }
    }

    pub fn min_stack(&self) -> u32 {
        self.min_stack
    }

    pub fn max_stack(&self) -> u32 {
        self.max_stack
    }

    /// Applies exactly `iterations` stacked edits.
    pub fn mutate_with_iterations(
        &self,
        data: &[u8],
        iterations: u32,
        rng: &mut dyn RngCore,
    ) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let cap = data.len().saturating_mul(HAVOC_GROWTH_CAP);
        let mut out = data.to_vec();
        for _ in 0..iterations {
            apply_random_edit(&mut out, cap, rng);
            out.truncate(cap);
        }
        out
    }
}

fn block_len(limit: usize, rng: &mut dyn RngCore) -> usize {
    rng.random_range(1..=limit.clamp(1, MAX_BLOCK))
}

fn apply_random_edit(out: &mut Vec<u8>, cap: usize, rng: &mut dyn RngCore) {
    let len = out.len();
    match rng.random_range(0..11u8) {
        0 => {
            let bit = rng.random_range(0..len * 8);
            out[bit / 8] ^= 0x80 >> (bit % 8);
        }
        1 => {
            let pos = rng.random_range(0..len);
            out[pos] = INTERESTING_8[rng.random_range(0..INTERESTING_8.len())] as u8;
        }
        2 if len >= 2 => {
            let pos = rng.random_range(0..=len - 2);
            let value = INTERESTING_16[rng.random_range(0..INTERESTING_16.len())];
            let bytes = if rng.random_bool(0.5) {
                value.to_le_bytes()
            } else {
                value.to_be_bytes()
            };
            out[pos..pos + 2].copy_from_slice(&bytes);
        }
        3 if len >= 4 => {
            let pos = rng.random_range(0..=len - 4);
            let value = INTERESTING_32[rng.random_range(0..INTERESTING_32.len())];
            let bytes = if rng.random_bool(0.5) {
                value.to_le_bytes()
            } else {
                value.to_be_bytes()
            };
            out[pos..pos + 4].copy_from_slice(&bytes);
        }
        4 => {
            *out = random_arithmetic(out, rng);
        }
        5 => {
            let pos = rng.random_range(0..len);
            out[pos] ^= rng.random_range(1..=255u8);
        }
        6 if len > 1 => {
            let del = block_len(len - 1, rng);
            let pos = rng.random_range(0..=len - del);
            out.drain(pos..pos + del);
        }
        7 if len < cap => {
            let take = block_len(len.min(cap - len), rng);
            let from = rng.random_range(0..=len - take);
            let to = rng.random_range(0..=len);
            let block: Vec<u8> = out[from..from + take].to_vec();
            out.splice(to..to, block);
        }
        8 if len >= 2 => {
            let take = block_len(len - 1, rng);
            let from = rng.random_range(0..=len - take);
            let to = rng.random_range(0..=len - take);
            out.copy_within(from..from + take, to);
        }
        9 if len < cap => {
            let take = block_len(cap - len, rng);
            let to = rng.random_range(0..=len);
            let fill = rng.random::<u8>();
            out.splice(to..to, std::iter::repeat_n(fill, take));
        }
        10 => {
            let take = block_len(len, rng);
            let pos = rng.random_range(0..=len - take);
            let fill = rng.random::<u8>();
            out[pos..pos + take].fill(fill);
        }
        _ => {
            let pos = rng.random_range(0..len);
            out[pos] = out[pos].wrapping_add(1);
        }
    }
}

impl Mutator for HavocMutator {
    fn name(&self) -> &str {
        "havoc"
    }

    fn mutate(&mut self, data: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
        let iterations = rng.random_range(self.min_stack..=self.max_stack);
        self.mutate_with_iterations(data, iterations, rng)
    }
}
