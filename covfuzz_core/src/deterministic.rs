//! Length-preserving byte edits: bit flips, byte flips, wraparound arithmetic
//! and "interesting" boundary values, both as single random shots and as an
//! exhaustive sweep.

use crate::mutator::Mutator;
use rand::Rng;
use rand_core::RngCore;

/// Largest magnitude used by arithmetic edits.
pub const ARITH_MAX: i64 = 35;

/// Flip and arithmetic widths, in bits for bit flips and bytes otherwise.
pub const DEFAULT_WIDTHS: [usize; 3] = [1, 2, 4];

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
pub const INTERESTING_16: [i16; 10] = [-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];
pub const INTERESTING_32: [i32; 8] = [
    i32::MIN,
    -100_663_046,
    -32769,
    32768,
    65535,
    65536,
    100_663_045,
    i32::MAX,
];

fn interesting_for_width(width: usize) -> Vec<u64> {
    match width {
        1 => INTERESTING_8.iter().map(|&v| v as u8 as u64).collect(),
        2 => INTERESTING_8
            .iter()
            .map(|&v| v as i16)
            .chain(INTERESTING_16.iter().copied())
            .map(|v| v as u16 as u64)
            .collect(),
        _ => INTERESTING_8
            .iter()
            .map(|&v| v as i32)
            .chain(INTERESTING_16.iter().map(|&v| v as i32))
            .chain(INTERESTING_32.iter().copied())
            .map(|v| v as u32 as u64)
            .collect(),
    }
}

fn read_value(data: &[u8], pos: usize, width: usize, big_endian: bool) -> u64 {
    let bytes = &data[pos..pos + width];
    let mut value = 0u64;
    if big_endian {
        for &b in bytes {
            value = (value << 8) | b as u64;
        }
    } else {
        for &b in bytes.iter().rev() {
            value = (value << 8) | b as u64;
        }
    }
    value
}

fn write_value(data: &mut [u8], pos: usize, width: usize, big_endian: bool, value: u64) {
    for i in 0..width {
        let byte = (value >> (8 * i)) as u8;
        if big_endian {
            data[pos + width - 1 - i] = byte;
        } else {
            data[pos + i] = byte;
        }
    }
}

fn flip_bits(data: &mut [u8], first_bit: usize, count: usize) {
    for bit in first_bit..first_bit + count {
        data[bit / 8] ^= 0x80 >> (bit % 8);
    }
}

fn flip_bytes(data: &mut [u8], pos: usize, count: usize) {
    for b in &mut data[pos..pos + count] {
        *b ^= 0xFF;
    }
}

fn add_wrapping(data: &mut [u8], pos: usize, width: usize, big_endian: bool, delta: i64) {
    let mask = if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    };
    let value = read_value(data, pos, width, big_endian);
    write_value(
        data,
        pos,
        width,
        big_endian,
        value.wrapping_add(delta as u64) & mask,
    );
}

fn endians(width: usize) -> &'static [bool] {
    if width == 1 { &[false] } else { &[false, true] }
}

fn positions(len: usize, width: usize) -> usize {
    if len >= width { len - width + 1 } else { 0 }
}

/// Every variant produced by flipping `width` consecutive bits, for each width.
pub fn bit_flips(data: &[u8], widths: &[usize]) -> Vec<Vec<u8>> {
    let total_bits = data.len() * 8;
    let mut out = Vec::new();
    for &width in widths.iter().filter(|&&w| w > 0) {
        for first in 0..positions(total_bits, width) {
            let mut variant = data.to_vec();
            flip_bits(&mut variant, first, width);
            out.push(variant);
        }
    }
    out
}

/// Every variant produced by inverting `width` consecutive bytes.
pub fn byte_flips(data: &[u8], widths: &[usize]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for &width in widths.iter().filter(|&&w| w > 0) {
        for pos in 0..positions(data.len(), width) {
            let mut variant = data.to_vec();
            flip_bytes(&mut variant, pos, width);
            out.push(variant);
        }
    }
    out
}

/// Every variant produced by adding each delta to each aligned integer of each
/// width. Multi-byte widths are tried little- then big-endian.
pub fn arithmetic(data: &[u8], deltas: &[i64], widths: &[usize]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for &width in widths.iter().filter(|&&w| (1..=8).contains(&w)) {
        for pos in 0..positions(data.len(), width) {
            for &big_endian in endians(width) {
                for &delta in deltas {
                    let mut variant = data.to_vec();
                    add_wrapping(&mut variant, pos, width, big_endian, delta);
                    out.push(variant);
                }
            }
        }
    }
    out
}

/// Every variant produced by overwriting each position with each interesting
/// value at widths 1, 2 and 4.
pub fn interesting_values(data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for width in DEFAULT_WIDTHS {
        let values = interesting_for_width(width);
        for pos in 0..positions(data.len(), width) {
            for &big_endian in endians(width) {
                for &value in &values {
                    let mut variant = data.to_vec();
                    write_value(&mut variant, pos, width, big_endian, value);
                    out.push(variant);
                }
            }
        }
    }
    out
}

fn default_deltas() -> Vec<i64> {
    (1..=ARITH_MAX).chain((1..=ARITH_MAX).map(|d| -d)).collect()
}

fn random_width(len: usize, rng: &mut dyn RngCore) -> usize {
    let fitting: Vec<usize> = DEFAULT_WIDTHS.iter().copied().filter(|&w| w <= len).collect();
    fitting[rng.random_range(0..fitting.len())]
}

pub fn random_bit_flip(data: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
    let mut out = data.to_vec();
    if !out.is_empty() {
        let bit = rng.random_range(0..out.len() * 8);
        flip_bits(&mut out, bit, 1);
    }
    out
}

pub fn random_byte_flip(data: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
    let mut out = data.to_vec();
    if !out.is_empty() {
        let pos = rng.random_range(0..out.len());
        flip_bytes(&mut out, pos, 1);
    }
    out
}

pub fn random_arithmetic(data: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let width = random_width(out.len(), rng);
    let pos = rng.random_range(0..positions(out.len(), width));
    let big_endian = width > 1 && rng.random_bool(0.5);
    let mut delta = rng.random_range(1..=ARITH_MAX);
    if rng.random_bool(0.5) {
        delta = -delta;
    }
    add_wrapping(&mut out, pos, width, big_endian, delta);
    out
}

pub fn random_interesting(data: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        return out;
    }
    let width = random_width(out.len(), rng);
    let pos = rng.random_range(0..positions(out.len(), width));
    let big_endian = width > 1 && rng.random_bool(0.5);
    let values = interesting_for_width(width);
    let value = values[rng.random_range(0..values.len())];
    write_value(&mut out, pos, width, big_endian, value);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    BitFlip(usize),
    ByteFlip(usize),
    Arith { width: usize, big_endian: bool },
    Interesting { width: usize, big_endian: bool },
}

const STAGES: [Stage; 14] = [
    Stage::BitFlip(1),
    Stage::BitFlip(2),
    Stage::BitFlip(4),
    Stage::ByteFlip(1),
    Stage::ByteFlip(2),
    Stage::ByteFlip(4),
    Stage::Arith { width: 1, big_endian: false },
    Stage::Arith { width: 2, big_endian: false },
    Stage::Arith { width: 2, big_endian: true },
    Stage::Arith { width: 4, big_endian: false },
    Stage::Arith { width: 4, big_endian: true },
    Stage::Interesting { width: 1, big_endian: false },
    Stage::Interesting { width: 2, big_endian: false },
    Stage::Interesting { width: 4, big_endian: false },
];

/// Lazy walk over every deterministic edit of one input, in stage order.
///
/// Big-endian interesting values are omitted from the sweep; the random
/// `interesting` strategy still produces them.
#[derive(Debug, Clone)]
pub struct DeterministicSweep {
    base: Vec<u8>,
    stage: usize,
    pos: usize,
    variant: usize,
    deltas: Vec<i64>,
}

impl DeterministicSweep {
    pub fn new(base: Vec<u8>) -> Self {
        Self {
            base,
            stage: 0,
            pos: 0,
            variant: 0,
            deltas: default_deltas(),
        }
    }

    pub fn base(&self) -> &[u8] {
        &self.base
    }

    fn stage_shape(&self, stage: Stage) -> (usize, usize) {
        let len = self.base.len();
        match stage {
            Stage::BitFlip(w) => (positions(len * 8, w), 1),
            Stage::ByteFlip(w) => (positions(len, w), 1),
            Stage::Arith { width, .. } => (positions(len, width), self.deltas.len()),
            Stage::Interesting { width, .. } => {
                (positions(len, width), interesting_for_width(width).len())
            }
        }
    }

    fn apply(&self, stage: Stage) -> Vec<u8> {
        let mut out = self.base.clone();
        match stage {
            Stage::BitFlip(w) => flip_bits(&mut out, self.pos, w),
            Stage::ByteFlip(w) => flip_bytes(&mut out, self.pos, w),
            Stage::Arith { width, big_endian } => {
                add_wrapping(&mut out, self.pos, width, big_endian, self.deltas[self.variant])
            }
            Stage::Interesting { width, big_endian } => {
                let value = interesting_for_width(width)[self.variant];
                write_value(&mut out, self.pos, width, big_endian, value)
            }
        }
        out
    }
}

impl Iterator for DeterministicSweep {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        while let Some(&stage) = STAGES.get(self.stage) {
            let (positions, variants) = self.stage_shape(stage);
            if self.pos >= positions {
                self.stage += 1;
                self.pos = 0;
                self.variant = 0;
                continue;
            }
            let out = self.apply(stage);
            self.variant += 1;
            if self.variant >= variants {
                self.variant = 0;
                self.pos += 1;
            }
            return Some(out);
        }
        None
    }
}

/// Walks the deterministic sweep of whatever input it is handed, restarting
/// when the input changes or the sweep runs out.
#[derive(Debug, Default)]
pub struct DeterministicMutator {
    sweep: Option<DeterministicSweep>,
}

impl DeterministicMutator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mutator for DeterministicMutator {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn mutate(&mut self, data: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let stale = self.sweep.as_ref().is_none_or(|s| s.base() != data);
        if stale {
            self.sweep = Some(DeterministicSweep::new(data.to_vec()));
        }
        match self.sweep.as_mut().and_then(Iterator::next) {
            Some(out) => out,
            None => {
                self.sweep = None;
                random_bit_flip(data, rng)
            }
        }
    }
}
