// Deterministic pseudo-random source for session-level decisions.
//
// xoshiro256++ (Blackman & Vigna, 2019) seeded through SplitMix64. The
// authority draws every random choice it makes from one `HubRng` per session:
// which free slot a joining player receives, which tied candidate wins a vote
// under the `Random` tie-break, and which legal action is played on behalf of a
// silent player under the `RandomLegal` missed-turn policy. Seeding from the
// session configuration makes a whole session replayable.
//
// The generator must stay platform-independent: integer arithmetic only, no
// floating point in the core step, no stdlib randomness.

/// Seeded xoshiro256++ generator.
#[derive(Clone, Debug)]
pub struct HubRng {
    s: [u64; 4],
}

impl HubRng {
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

    /// Create a generator from a textual label (typically a session id)
    /// mixed with a numeric seed. The label is folded with FNV-1a so two
    /// sessions sharing a configured seed still diverge.
    pub fn from_label(label: &str, seed: u64) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in label.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Self::new(hash ^ seed)
    }

    /// Next raw `u64` from the stream.
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

    /// Uniform integer in `[low, high)`, rejection-sampled to avoid modulo
    /// bias. Panics if `low >= high`.
    pub fn range_usize(&mut self, low: usize, high: usize) -> usize {
        assert!(low < high, "range_usize: low must be less than high");
        let range = (high - low) as u64;
        if range.is_power_of_two() {
            return low + (self.next_u64() & (range - 1)) as usize;
        }
        let threshold = range.wrapping_neg() % range;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return low + (r % range) as usize;
            }
        }
    }

    /// Pick one element uniformly. `None` for an empty slice.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.range_usize(0, items.len());
        items.get(idx)
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.range_usize(0, i + 1);
            items.swap(i, j);
        }
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
