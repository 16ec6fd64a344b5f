//! Hang-and-recover automatic gain control.
//!
//! The AGC runs once per block and picks a per-sample gain ratio so the
//! gain glides geometrically across the block instead of stepping at the
//! boundary; a strong signal straddling two blocks produces no click.
//! Four branches, checked in order: strong signal, noise-limited, hang,
//! recover.

use crate::error::{Error, Result};

/// Which branch fired for the last block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgcState {
    /// Output would exceed headroom; gain is being pulled down.
    Strong,
    /// Amplified noise floor would exceed the threshold.
    NoiseLimited,
    /// Holding gain after a strong signal, waiting out the hang time.
    Hang,
    /// Gain climbing back at the recovery rate.
    Recover,
}

#[derive(Debug, Clone)]
pub struct HangAgc {
    /// Noise threshold relative to headroom, linear voltage, <= 1.
    threshold: f32,
    /// Recovery, voltage ratio per output sample, > 1.
    recovery_rate: f32,
    /// Hang duration in blocks.
    hangtime: u32,
    hangcount: u32,
    state: AgcState,
}

impl HangAgc {
    pub fn new(threshold: f32, recovery_rate: f32, hangtime: u32) -> Self {
        Self {
            threshold,
            recovery_rate,
            hangtime,
            hangcount: 0,
            state: AgcState::Recover,
        }
    }

    pub fn state(&self) -> AgcState {
        self.state
    }

    pub fn hangcount(&self) -> u32 {
        self.hangcount
    }

    pub fn set_hangtime(&mut self, blocks: u32) {
        self.hangtime = blocks;
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn set_recovery_rate(&mut self, per_sample: f32) {
        self.recovery_rate = per_sample;
    }

    /// Choose the per-sample gain ratio for one block.
    ///
    /// * `gain` - gain at block start, linear voltage
    /// * `headroom` - target maximum output amplitude
    /// * `bb_power` - mean squared baseband magnitude this block
    /// * `n0` - front-end noise density, power per Hz
    /// * `bw` - pre-detection bandwidth `|max_IF - min_IF|`, Hz
    /// * `block_len` - output samples per block (`Lo`)
    ///
    /// The ratio is close to 1; applied `block_len` times it lands the
    /// gain exactly on the branch target.
    pub fn block_gain_change(
        &mut self,
        gain: f32,
        headroom: f32,
        bb_power: f32,
        n0: f32,
        bw: f32,
        block_len: usize,
    ) -> Result<f32> {
        let ampl = bb_power.sqrt();
        let bn = (bw * n0).sqrt();
        let nth = 1.0 / block_len as f32;

        let gain_change = if ampl * gain > headroom {
            // Strong signal: come down to headroom by the end of the block
            self.state = AgcState::Strong;
            self.hangcount = self.hangtime;
            let newgain = headroom / ampl;
            if newgain > 0.0 {
                (newgain / gain).powf(nth)
            } else {
                1.0
            }
        } else if bn * gain > self.threshold * headroom {
            // Keep amplified noise below the threshold
            self.state = AgcState::NoiseLimited;
            let newgain = self.threshold * headroom / bn;
            if newgain > 0.0 {
                (newgain / gain).powf(nth)
            } else {
                1.0
            }
        } else if self.hangcount > 0 {
            self.state = AgcState::Hang;
            self.hangcount -= 1;
            1.0
        } else {
            self.state = AgcState::Recover;
            self.recovery_rate
        };

        if gain_change == 0.0 || !gain_change.is_finite() {
            return Err(Error::InternalInvariant("agc gain change zero"));
        }
        Ok(gain_change)
    }
}
