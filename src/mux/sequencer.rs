//! Per-channel sequence generators
//!
//! Every channel owns a SplitMix64 generator. Both ends seed it from the
//! connection seed and the channel key, so the expected sequence of a
//! channel does not depend on when either side created it.

use super::channel_type::PipeKind;
use crate::protocol::token_seed;
use rand::RngCore;

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Shared secret both ends derive their sequencers from
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionSeed(u64);

impl SessionSeed {
    pub fn from_u64(seed: u64) -> Self {
        SessionSeed(seed)
    }

    /// Hash a token into a seed
    pub fn from_token(token: &str) -> Self {
        SessionSeed(token_seed(token))
    }

    /// Fresh seed from the OS RNG, for callers that exchange it themselves
    pub fn random() -> Self {
        SessionSeed(rand::rngs::OsRng.next_u64())
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Sequencer for one channel key
    pub fn sequencer(&self, kind: PipeKind, number: u32) -> Sequencer {
        let key = (((kind == PipeKind::Direct) as u64) << 32) | number as u64;
        Sequencer::new(mix(self.0 ^ mix(key.wrapping_add(GOLDEN_GAMMA))))
    }
}

impl std::fmt::Debug for SessionSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSeed(..)")
    }
}

/// SplitMix64 stream
#[derive(Debug, Clone)]
pub struct Sequencer {
    state: u64,
}

impl Sequencer {
    pub fn new(seed: u64) -> Self {
        Sequencer { state: seed }
    }

    /// Next value in the stream
    pub fn next_value(&mut self) -> u64 {
        self.state = self.state.wrapping_add(GOLDEN_GAMMA);
        mix(self.state)
    }
}
