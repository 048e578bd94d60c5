//! Padding, burst-split and timing-jitter policies.
//!
//! Everything that shapes traffic against analysis (padding sizes, chunk sizes,
//! inter-packet delays) draws from the system CSPRNG. Handshake cosmetics
//! (query decorators, cookie values) are the only users of the thread RNG.

use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng as _, RngCore as _};

use crate::config::{ObfsConfig, StealthConfig};

/// Smallest chunk a burst-split write is cut into.
pub const MIN_BURST_CHUNK: usize = 512;

/// Writes at or below this size are never delayed, keeping control traffic prompt.
pub const JITTER_THRESHOLD: usize = 128;

/// Uniform random padding appended to each packet's plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingPolicy {
    pub min: usize,
    pub max: usize,
}

impl PaddingPolicy {
    pub fn draw(&self) -> Vec<u8> {
        let n = if self.max == 0 {
            0
        } else {
            OsRng.gen_range(self.min.min(self.max)..=self.max)
        };

        let mut pad = vec![0u8; n];
        OsRng.fill_bytes(&mut pad);

        pad
    }
}

/// Splits one logical write into several independently encrypted packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPolicy {
    pub max_chunk: usize,
}

impl BurstPolicy {
    pub fn applies_to(&self, len: usize) -> bool {
        self.max_chunk > 0 && len > self.max_chunk
    }

    pub fn draw_chunk_len(&self) -> usize {
        let max = self.max_chunk.max(1);

        OsRng.gen_range(MIN_BURST_CHUNK.min(max)..=max)
    }

    pub fn draw_delay(&self) -> Duration {
        Duration::from_millis(OsRng.gen_range(1..=5))
    }
}

/// Delays large writes by a uniform random amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteJitter {
    pub min: Duration,
    pub max: Duration,
}

impl WriteJitter {
    /// The delay to apply after writing `len` plaintext bytes, if any.
    pub fn draw_for(&self, len: usize) -> Option<Duration> {
        if len <= JITTER_THRESHOLD {
            return None;
        }

        let min = self.min.min(self.max).as_millis() as u64;
        let max = self.max.as_millis() as u64;

        Some(Duration::from_millis(OsRng.gen_range(min..=max)))
    }
}

/// The effective traffic-shaping policies derived from configuration.
///
/// The stealth surface wins over the legacy obfs one where both configure
/// padding. Peers must configure padding symmetrically: the in-packet length
/// prefix exists on the wire iff a padding policy is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObfsPolicies {
    pub padding: Option<PaddingPolicy>,
    pub burst: Option<BurstPolicy>,
    pub jitter: Option<WriteJitter>,
}

impl ObfsPolicies {
    pub fn from_config(obfs: &ObfsConfig, stealth: &StealthConfig) -> Self {
        let padding = if stealth.random_padding {
            Some(PaddingPolicy {
                min: stealth.min_padding,
                max: stealth.max_padding,
            })
        } else if obfs.enabled {
            Some(PaddingPolicy {
                min: obfs.min_padding,
                max: obfs.max_padding,
            })
        } else {
            None
        };

        let burst = stealth.burst_split.then_some(BurstPolicy {
            max_chunk: stealth.max_burst_size,
        });

        let jitter = obfs.enabled.then_some(WriteJitter {
            min: Duration::from_millis(obfs.min_delay_ms),
            max: Duration::from_millis(obfs.max_delay_ms),
        });

        Self {
            padding,
            burst,
            jitter,
        }
    }
}

/// Random alphanumeric string for handshake cosmetics (fake paths, cookies).
pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_stays_within_bounds() {
        let policy = PaddingPolicy { min: 8, max: 32 };

        for _ in 0..100 {
            let pad = policy.draw();
            assert!((8..=32).contains(&pad.len()));
        }
    }

    #[test]
    fn zero_padding_policy_is_empty() {
        let policy = PaddingPolicy { min: 0, max: 0 };

        assert!(policy.draw().is_empty());
    }

    #[test]
    fn burst_chunks_stay_within_bounds() {
        let policy = BurstPolicy { max_chunk: 1024 };

        assert!(policy.applies_to(5000));
        assert!(!policy.applies_to(1024));

        for _ in 0..100 {
            let len = policy.draw_chunk_len();
            assert!((MIN_BURST_CHUNK..=1024).contains(&len));
        }
    }

    #[test]
    fn small_writes_are_never_jittered() {
        let jitter = WriteJitter {
            min: Duration::from_millis(5),
            max: Duration::from_millis(25),
        };

        assert_eq!(jitter.draw_for(128), None);
        assert!(jitter.draw_for(129).is_some());
    }

    #[test]
    fn stealth_padding_wins_over_obfs() {
        let obfs = ObfsConfig {
            enabled: true,
            min_padding: 1,
            max_padding: 2,
            ..Default::default()
        };
        let stealth = StealthConfig {
            random_padding: true,
            min_padding: 64,
            max_padding: 512,
            ..Default::default()
        };

        let policies = ObfsPolicies::from_config(&obfs, &stealth);

        assert_eq!(
            policies.padding,
            Some(PaddingPolicy { min: 64, max: 512 })
        );
    }

    #[test]
    fn disabling_both_knobs_disables_padding() {
        let obfs = ObfsConfig::default();
        let stealth = StealthConfig {
            random_padding: false,
            ..Default::default()
        };

        let policies = ObfsPolicies::from_config(&obfs, &stealth);

        assert_eq!(policies.padding, None);
        assert_eq!(policies.jitter, None);
    }

    #[test]
    fn random_alphanumeric_has_requested_length() {
        assert_eq!(random_alphanumeric(8).len(), 8);
        assert!(random_alphanumeric(8).chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
