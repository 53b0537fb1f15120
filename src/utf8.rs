//! Streaming UTF-8 validation
//!
//! Text payloads may be split across fragments and across inflate output
//! chunks, so validation has to carry state between calls. [`Utf8Validator`]
//! is Bjoern Hoehrmann's table-driven DFA: one transition per byte, states
//! encoded as offsets into the transition table. It rejects overlong
//! encodings, surrogate halves and code points above U+10FFFF exactly like
//! `str::from_utf8` does.
//!
//! Whole buffers that are already complete go through `simdutf8` instead,
//! which is substantially faster than the DFA on valid input.

const ACCEPT: u8 = 0;
const REJECT: u8 = 12;

// Byte -> character class.
#[rustfmt::skip]
static UTF8_CLASS: [u8; 256] = [
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, 9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7, 7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2, 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3, 11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,
];

// (state, class) -> next state; states are multiples of 12.
#[rustfmt::skip]
static UTF8_STATE: [u8; 108] = [
     0,12,24,36,60,96,84,12,12,12,48,72, 12,12,12,12,12,12,12,12,12,12,12,12,
    12, 0,12,12,12,12,12, 0,12, 0,12,12, 12,24,12,12,12,12,12,24,12,24,12,12,
    12,12,12,12,12,12,12,24,12,12,12,12, 12,24,12,12,12,12,12,12,12,24,12,12,
    12,12,12,12,12,12,12,36,12,36,12,12, 12,36,12,12,12,12,12,36,12,36,12,12,
    12,36,12,12,12,12,12,12,12,12,12,12,
];

/// Incremental UTF-8 validator carrying DFA state across chunks.
#[derive(Debug, Clone)]
pub struct Utf8Validator {
    state: u8,
}

impl Utf8Validator {
    /// Create a validator in the accepting state.
    pub fn new() -> Self {
        Self { state: ACCEPT }
    }

    /// Feed a chunk. Returns `false` as soon as the input can no longer be
    /// a prefix of valid UTF-8; once rejected the validator stays rejected
    /// until [`reset`](Self::reset).
    pub fn update(&mut self, chunk: &[u8]) -> bool {
        let mut state = self.state;
        for &byte in chunk {
            state = UTF8_STATE[(state + UTF8_CLASS[byte as usize]) as usize];
            if state == REJECT {
                break;
            }
        }
        self.state = state;
        state != REJECT
    }

    /// Finish the stream. Valid only if no multi-byte sequence is left
    /// dangling. Resets the validator for the next message.
    pub fn finish(&mut self) -> bool {
        let ok = self.state == ACCEPT;
        self.state = ACCEPT;
        ok
    }

    /// Discard any pending partial sequence.
    pub fn reset(&mut self) {
        self.state = ACCEPT;
    }
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a complete buffer.
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}
