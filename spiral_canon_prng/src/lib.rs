// Deterministic, portable pseudo-random number generator.
//
// xoshiro256++ (Blackman & Vigna, 2019) seeded through SplitMix64. Score
// generation itself is a pure function of its inputs and never draws random
// numbers; this crate exists for the parts of the pipeline that need
// reproducible noise:
// - `spiral_canon_sequencer::simulated` injects transient host failures at a
//   configured rate, one independent stream per track.
// - `spiral_canon_sequencer::dispatch` jitters retry backoff so concurrent
//   voices do not retry in lockstep.
//
// Streams are derived with `fork`, so a run with six voices and one seed
// replays the exact same failure pattern per voice regardless of how the
// dispatch threads interleave.
//
// **Critical constraint: determinism.** The core generator uses integer
// arithmetic only. Floating-point values are derived from the upper bits of
// `next_u64` and never feed back into the state.

use serde::{Deserialize, Serialize};

/// Xoshiro256++ generator state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonRng {
    s: [u64; 4],
}

impl CanonRng {
    /// Create a generator from a `u64` seed. Equal seeds give equal streams.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Derive an independent generator for a numbered sub-stream.
    ///
    /// The parent is not advanced: `fork(n)` is a pure function of the
    /// parent's current state and `n`, so forking per voice or per track
    /// does not depend on the order in which the forks are taken.
    pub fn fork(&self, stream: u64) -> Self {
        let mut sm = self.s[0]
            ^ self.s[1].rotate_left(17)
            ^ self.s[2].rotate_left(31)
            ^ self.s[3].rotate_left(47)
            ^ stream.wrapping_mul(0xd1b5_4a32_d192_ed03);
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);

        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Uniform `f64` in [0, 1), built from the upper 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform integer in `[low, high)` without modulo bias.
    ///
    /// Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "range_u64: low must be less than high");
        let range = high - low;
        if range.is_power_of_two() {
            return low + (self.next_u64() & (range - 1));
        }
        let threshold = range.wrapping_neg() % range;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return low + (r % range);
            }
        }
    }

    /// `true` with probability `p`. `p <= 0` never fires, `p >= 1` always does.
    pub fn random_bool(&mut self, p: f64) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.next_f64() < p
    }

    /// A multiplicative jitter factor in `[1 - spread, 1]`.
    ///
    /// `spread` is clamped to [0, 1]. Used to scale retry delays down by a
    /// random fraction.
    pub fn jitter_factor(&mut self, spread: f64) -> f64 {
        let spread = spread.clamp(0.0, 1.0);
        1.0 - spread * self.next_f64()
    }
}

/// SplitMix64 step, used only to expand seeds into xoshiro state.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = CanonRng::new(42);
        let mut b = CanonRng::new(42);
        for _ in 0..1000 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn fork_is_order_independent() {
        let root = CanonRng::new(7);
        let first_then_second = (root.fork(1), root.fork(2));
        let second_then_first = {
            let b = root.fork(2);
            let a = root.fork(1);
            (a, b)
        };
        assert_eq!(first_then_second, second_then_first);
    }

    #[test]
    fn forks_diverge_from_each_other_and_parent() {
        let root = CanonRng::new(7);
        let mut parent = root.clone();
        let mut a = root.fork(0);
        let mut b = root.fork(1);
        let (pa, va, vb) = (parent.next_u64(), a.next_u64(), b.next_u64());
        assert_ne!(va, vb);
        assert_ne!(pa, va);
    }

    #[test]
    fn f64_in_unit_range() {
        let mut rng = CanonRng::new(12345);
        for _ in 0..10_000 {
            let v = rng.next_f64();
            assert!((0.0..1.0).contains(&v), "f64 out of range: {v}");
        }
    }

    #[test]
    fn range_u64_within_bounds() {
        let mut rng = CanonRng::new(999);
        for _ in 0..10_000 {
            let v = rng.range_u64(10, 20);
            assert!((10..20).contains(&v), "range_u64 out of range: {v}");
        }
    }

    #[test]
    fn random_bool_rate_is_close_to_p() {
        let mut rng = CanonRng::new(42);
        let n = 20_000;
        let hits = (0..n).filter(|_| rng.random_bool(0.1)).count();
        let pct = hits as f64 / n as f64;
        assert!(
            (0.08..0.12).contains(&pct),
            "random_bool(0.1) should be ~10%, got {:.1}%",
            pct * 100.0
        );
    }

    #[test]
    fn random_bool_extremes() {
        let mut rng = CanonRng::new(42);
        for _ in 0..100 {
            assert!(!rng.random_bool(0.0));
            assert!(!rng.random_bool(-1.0));
            assert!(rng.random_bool(1.0));
            assert!(rng.random_bool(2.0));
        }
    }

    #[test]
    fn jitter_factor_stays_in_band() {
        let mut rng = CanonRng::new(3);
        for _ in 0..1000 {
            let f = rng.jitter_factor(0.5);
            assert!((0.5..=1.0).contains(&f), "jitter out of band: {f}");
        }
        assert_eq!(rng.jitter_factor(0.0), 1.0);
    }

    #[test]
    fn serialization_roundtrip_continues_stream() {
        let mut rng = CanonRng::new(42);
        for _ in 0..100 {
            rng.next_u64();
        }
        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: CanonRng = serde_json::from_str(&json).unwrap();
        for _ in 0..100 {
            assert_eq!(rng.next_u64(), restored.next_u64());
        }
    }
}
