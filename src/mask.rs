//! Frame masking and mask-key generation
//!
//! Client-to-server payloads are XORed with a 4-byte key. The hot loop
//! widens the key to a doubled `u64` and processes 8 bytes per iteration.

use std::cell::Cell;

/// XOR `data` in place with the repeating 4-byte `mask`.
///
/// Masking is an involution: applying the same key twice restores the
/// original bytes, so this one function serves both directions.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// XOR `data` in place with `mask`, starting at `offset` bytes into the
/// key cycle. Used when a payload is unmasked in more than one pass.
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let mut rotated = [0u8; 4];
    for (i, b) in rotated.iter_mut().enumerate() {
        *b = mask[(i + offset) & 3];
    }

    let mask_word = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    for (i, b) in chunks.into_remainder().iter_mut().enumerate() {
        *b ^= rotated[i & 3];
    }
}

thread_local! {
    static RNG_STATE: Cell<u64> = const { Cell::new(0) };
}

/// Generate a 4-byte mask key from a thread-local xorshift64 generator
/// seeded with clock and address entropy on first use.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    (next_random() as u32).to_ne_bytes()
}

/// Generate the 16-byte client handshake nonce.
pub fn generate_nonce() -> [u8; 16] {
    let hi = next_random().to_ne_bytes();
    let lo = next_random().to_ne_bytes();
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(&hi);
    nonce[8..].copy_from_slice(&lo);
    nonce
}

#[inline]
fn next_random() -> u64 {
    RNG_STATE.with(|state| {
        let mut s = state.get();
        if s == 0 {
            s = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            s ^= &s as *const _ as u64;
            // A zero seed would lock the generator at zero forever.
            s |= 1;
        }

        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;

        state.set(s);
        s
    })
}
