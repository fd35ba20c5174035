//! Per-band decoder state: model-update countdown, wait-mask stage and
//! the MELCODE run-length sub-state.

use super::tables::{BEST_TRIG_TAB, DEF_WMI_NEXT, QUIC_EVOL, QUIC_J, TABRAND_CHAOS};

pub struct BandState {
    pub waitcnt: u32,
    tabrand_seed: u8,
    pub wm_trigger: u32,
    pub wmidx: u32,
    pub wmileft: u32,

    /// Index into the MELCODE state array.
    pub melcstate: u32,
    /// Expected run length is `2^melclen`; shorter runs are a 1 bit
    /// followed by the residual in `melclen` fixed bits.
    pub melclen: u32,
    pub melcorder: u32,
}

impl BandState {
    pub fn new() -> Self {
        let mut s = BandState {
            waitcnt: 0,
            tabrand_seed: 0xff,
            wm_trigger: 0,
            wmidx: 0,
            wmileft: DEF_WMI_NEXT,
            melcstate: 0,
            melclen: 0,
            melcorder: 0,
        };
        s.reset();
        s
    }

    pub fn reset(&mut self) {
        self.waitcnt = 0;
        self.tabrand_seed = 0xff;
        self.wmidx = 0;
        self.wmileft = DEF_WMI_NEXT;
        self.set_wm_trigger();
        self.melcstate = 0;
        self.melclen = QUIC_J[0];
        self.melcorder = 1 << self.melclen;
    }

    pub fn set_wm_trigger(&mut self) {
        let wm = self.wmidx.min(10);
        self.wm_trigger = BEST_TRIG_TAB[QUIC_EVOL / 2][wm as usize];
    }

    pub fn tabrand(&mut self) -> u32 {
        self.tabrand_seed = self.tabrand_seed.wrapping_add(1);
        TABRAND_CHAOS[self.tabrand_seed as usize]
    }
}

impl Default for BandState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state() {
        let s = BandState::new();
        assert_eq!(s.waitcnt, 0);
        assert_eq!(s.wmidx, 0);
        assert_eq!(s.wmileft, DEF_WMI_NEXT);
        assert_eq!(s.wm_trigger, BEST_TRIG_TAB[1][0]);
        assert_eq!(s.melcstate, 0);
        assert_eq!(s.melcorder, 1);
    }

    #[test]
    fn tabrand_walks_table() {
        let mut s = BandState::new();
        assert_eq!(s.tabrand(), TABRAND_CHAOS[0]);
        assert_eq!(s.tabrand(), TABRAND_CHAOS[1]);
        // seed wraps after 256 draws
        for _ in 2..256 {
            s.tabrand();
        }
        assert_eq!(s.tabrand(), TABRAND_CHAOS[0]);
    }

    #[test]
    fn wm_trigger_saturates() {
        let mut s = BandState::new();
        s.wmidx = 25;
        s.set_wm_trigger();
        assert_eq!(s.wm_trigger, BEST_TRIG_TAB[1][10]);
    }
}
