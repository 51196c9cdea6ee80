//! Deterministic payload pattern
//! Both peers derive the byte at any absolute offset from the same shared seed

use std::sync::OnceLock;

/// Seed pattern length. Large enough that typical buffer sizes never wrap
/// within a single I/O, power of two so the modulo folds to a mask.
const SEED_LEN: usize = 1 << 20; // 1 MiB

static SEED: OnceLock<Box<[u8]>> = OnceLock::new();

/// Fixed xorshift64* stream; any change here breaks cross-host verification.
fn build_seed() -> Box<[u8]> {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut seed = vec![0u8; SEED_LEN];
    for chunk in seed.chunks_exact_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let word = state.wrapping_mul(0x2545_f491_4f6c_dd1d);
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    seed.into_boxed_slice()
}

fn seed() -> &'static [u8] {
    SEED.get_or_init(build_seed)
}

/// The byte every peer expects at absolute offset `offset`
#[inline]
pub fn byte_at(offset: u64) -> u8 {
    seed()[(offset as usize) & (SEED_LEN - 1)]
}

/// Fill `buf` with the pattern starting at absolute offset `offset`
pub fn fill(offset: u64, buf: &mut [u8]) {
    let pattern = seed();
    let mut pos = (offset as usize) & (SEED_LEN - 1);
    let mut written = 0;
    while written < buf.len() {
        let run = (SEED_LEN - pos).min(buf.len() - written);
        buf[written..written + run].copy_from_slice(&pattern[pos..pos + run]);
        written += run;
        pos = 0;
    }
}

/// Produce `len` pattern bytes starting at `offset`
pub fn generate(offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    fill(offset, &mut buf);
    buf
}

/// Verify received bytes against the pattern at `offset`.
/// Returns the absolute offset of the first mismatch.
pub fn verify(offset: u64, buf: &[u8]) -> Result<(), u64> {
    let pattern = seed();
    for (i, &received) in buf.iter().enumerate() {
        let at = offset + i as u64;
        if pattern[(at as usize) & (SEED_LEN - 1)] != received {
            return Err(at);
        }
    }
    Ok(())
}
