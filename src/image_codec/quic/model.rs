//! Adaptive context model: buckets of code-length accumulators shared
//! between ranges of correlate values.

use super::family::Family;
use super::state::BandState;
use super::tables::QUIC_EVOL;

/// Bucket layout parameters for a given bits-per-component.
pub struct Model {
    pub bpc: u32,
    pub levels: u32,
    pub repfirst: u32,
    pub firstsize: u32,
    pub repnext: u32,
    pub mulsize: u32,
}

impl Model {
    pub fn new(bpc: u32) -> Self {
        // bucket growth per evolution family: 1 → 1 1 1 2 2 4 4 8 8…,
        // 3 → 1 2 4 8…, 5 → 1 4 16 64…
        let (repfirst, firstsize, repnext, mulsize) = match QUIC_EVOL {
            1 => (3, 1, 2, 2),
            3 => (1, 1, 1, 2),
            5 => (1, 1, 1, 4),
            _ => unreachable!("unsupported model evolution"),
        };

        Model {
            bpc,
            levels: 1 << bpc,
            repfirst,
            firstsize,
            repnext,
            mulsize,
        }
    }
}

// ── Bucket ───────────────────────────────────────────────────────

/// One bucket: eight accumulated Golomb code lengths plus the index of
/// the currently cheapest code.
#[derive(Clone)]
pub struct Bucket {
    pub bestcode: u32,
    counters: [u32; 8],
}

impl Bucket {
    fn new(bpp: u32) -> Self {
        Bucket {
            bestcode: bpp,
            counters: [0; 8],
        }
    }

    /// Account `curval` under every code parameter and re-select the
    /// cheapest. Counters are halved once the best exceeds the trigger.
    pub fn update_model(&mut self, family: &Family, state: &BandState, curval: u32, bpc: u32) {
        let bpp = bpc;

        let mut bestcode = bpp - 1;
        self.counters[bestcode as usize] += family.golomb_code_len(curval, bestcode);
        let mut bestcode_len = self.counters[bestcode as usize];

        for i in (0..bpp - 1).rev() {
            self.counters[i as usize] += family.golomb_code_len(curval, i);
            let ith_len = self.counters[i as usize];
            if ith_len < bestcode_len {
                bestcode = i;
                bestcode_len = ith_len;
            }
        }

        self.bestcode = bestcode;

        if bestcode_len > state.wm_trigger {
            for c in self.counters.iter_mut().take(bpp as usize) {
                *c >>= 1;
            }
        }
    }
}

// ── FamilyStat ───────────────────────────────────────────────────

/// The bucket store for one colour channel: contiguous buckets plus a
/// correlate-value → bucket index table.
pub struct FamilyStat {
    buckets: Vec<Bucket>,
    index: Vec<u16>,
}

impl FamilyStat {
    pub fn new(model: &Model) -> Self {
        let mut st = FamilyStat {
            buckets: Vec::new(),
            index: Vec::with_capacity(model.levels as usize),
        };

        let mut repcntr = model.repfirst + 1;
        let mut bsize = model.firstsize;
        let mut bstart: u32 = 0;
        let mut bend: u32 = 0;

        while bend < model.levels - 1 {
            repcntr -= 1;
            if repcntr == 0 {
                repcntr = model.repnext;
                bsize *= model.mulsize;
            }

            bend = bstart + bsize - 1;
            if bend + bsize >= model.levels {
                bend = model.levels - 1;
            }

            let idx = st.buckets.len() as u16;
            st.buckets.push(Bucket::new(model.bpc - 1));
            for _ in bstart..=bend {
                st.index.push(idx);
            }

            bstart = bend + 1;
        }

        st
    }

    pub fn bucket(&self, correlate: u8) -> &Bucket {
        &self.buckets[self.index[correlate as usize] as usize]
    }

    pub fn bucket_mut(&mut self, correlate: u8) -> &mut Bucket {
        &mut self.buckets[self.index[correlate as usize] as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::family::family_8bpc;
    use super::super::state::BandState;

    #[test]
    fn bucket_layout_8bpc() {
        let stat = FamilyStat::new(&Model::new(8));
        assert_eq!(stat.index.len(), 256);
        // evolution 3: sizes 1, 2, 4, 8, … — all 256 levels covered
        assert_eq!(stat.index[0], 0);
        assert_eq!(stat.index[1], 1);
        assert_eq!(stat.index[2], 1);
        assert_eq!(stat.index[3], 2);
        assert_eq!(stat.index[6], 2);
        assert_eq!(stat.index[7], 3);
        assert_eq!(stat.index[255], *stat.index.last().unwrap());
    }

    #[test]
    fn bucket_layout_5bpc() {
        let stat = FamilyStat::new(&Model::new(5));
        assert_eq!(stat.index.len(), 32);
    }

    #[test]
    fn update_model_selects_cheapest() {
        let stat_model = Model::new(8);
        let mut stat = FamilyStat::new(&stat_model);
        let state = BandState::new();
        let f = family_8bpc();

        let b = stat.bucket_mut(0);
        assert_eq!(b.bestcode, 7);
        // small residuals favour a small code parameter
        for _ in 0..16 {
            b.update_model(f, &state, 0, 8);
        }
        assert_eq!(b.bestcode, 0);
    }
}
