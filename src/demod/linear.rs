//! Linear demodulator: USB/LSB/CW/AM/IQ, every mode that is a passband
//! selection plus optional coherent carrier recovery.
//!
//! Each block runs up to five passes in order: PLL, post-detection shift,
//! AGC, output conversion, mute decision. The PLL operates on the
//! downconverted carrier at DC; the frequency shift must therefore come
//! after it.

use num_complex::Complex;

use crate::channel::ChannelConfig;
use crate::demod::agc::HangAgc;
use crate::emit::PcmBlock;
use crate::error::Result;
use crate::filter::Baseband;
use crate::osc::{Oscillator, Pll};

/// Per-block demodulation result alongside the PCM block itself.
#[derive(Debug, Clone, Copy)]
pub struct DemodStats {
    pub snr: f32,
    pub foffset: f32,
    pub gain: f32,
    pub pll_lock: bool,
    pub rotations: i64,
    pub output_power: f32,
}

pub struct LinearDemod {
    // configuration
    samprate: u32,
    channels: usize,
    envelope: bool,
    pll_enabled: bool,
    square: bool,
    agc_enabled: bool,
    headroom: f32,
    loop_bw: f32,
    damping: f32,
    squelch_open: f32,
    squelch_close: f32,
    lock_limit: i64,
    /// Pre-detection bandwidth, for the AGC noise estimate.
    bandwidth: f32,

    // runtime state
    gain: f32,
    shift: f32,
    pll: Pll,
    shift_osc: Oscillator,
    agc: HangAgc,
    was_on: bool,
    lock_count: i64,
    pll_lock: bool,
    rotations: i64,
    cphase: f64,
    snr: f32,
    foffset: f32,
}

impl LinearDemod {
    pub fn new(cfg: &ChannelConfig) -> Self {
        let fo = cfg.output.samprate;
        Self {
            samprate: fo,
            channels: cfg.output.channels,
            envelope: cfg.linear.envelope,
            pll_enabled: cfg.linear.pll,
            square: cfg.linear.square,
            agc_enabled: cfg.linear.agc,
            headroom: cfg.output.headroom,
            loop_bw: cfg.linear.loop_bw,
            damping: cfg.linear.damping,
            squelch_open: cfg.linear.squelch_open,
            squelch_close: cfg.linear.squelch_close,
            lock_limit: (cfg.linear.lock_time * fo as f32) as i64,
            bandwidth: (cfg.filter.max_if - cfg.filter.min_if).abs(),
            gain: cfg.output.gain,
            shift: cfg.tune.shift,
            pll: Pll::new(fo as f64),
            shift_osc: Oscillator::new(cfg.tune.shift / fo as f32),
            agc: HangAgc::new(
                cfg.linear.threshold,
                cfg.linear.recovery_rate,
                cfg.linear.hangtime,
            ),
            was_on: false,
            lock_count: 0,
            pll_lock: false,
            rotations: 0,
            cphase: 0.0,
            snr: f32::NAN,
            foffset: 0.0,
        }
    }

    /// Demodulate one baseband block. `tuned` is false when the channel
    /// frequency is zero, which forces the mute flag.
    pub fn process(&mut self, bb: &mut Baseband, tuned: bool) -> Result<(PcmBlock, DemodStats)> {
        let lo = bb.samples.len();
        let buffer = &mut bb.samples;

        // Pass A: carrier recovery. Runs on the signal at DC, so it must
        // precede the frequency shift.
        if self.pll_enabled {
            if !self.was_on {
                self.rotations = 0;
                self.pll.reset();
                self.was_on = true;
            }
            self.pll.set_params(self.loop_bw as f64, self.damping as f64);

            let mut signal = 0.0f32;
            let mut noise = 0.0f32;
            for s in buffer.iter_mut() {
                *s *= self.pll.phasor().conj();
                let phase = if self.square {
                    (*s * *s).arg()
                } else {
                    s.arg()
                };
                self.pll.step(phase as f64);
                // in phase with the VCO is signal+noise, quadrature is noise
                signal += s.re * s.re;
                noise += s.im * s.im;
            }
            self.snr = if noise != 0.0 {
                (signal / noise - 1.0).max(0.0)
            } else {
                f32::NAN
            };

            // Lock detector with hysteresis. NaN SNR compares false both
            // ways and leaves the count untouched.
            if self.snr < self.squelch_close {
                self.lock_count -= lo as i64;
                if self.lock_count <= -self.lock_limit {
                    self.lock_count = -self.lock_limit;
                    self.pll_lock = false;
                }
            } else if self.snr > self.squelch_open {
                self.lock_count += lo as i64;
                if self.lock_count >= self.lock_limit {
                    self.lock_count = self.lock_limit;
                    self.pll_lock = true;
                }
            }

            // Cycle counting on the VCO phase
            let phase = self.pll.phase();
            let phase_diff = phase - self.cphase;
            self.cphase = phase;
            if phase_diff > std::f64::consts::PI {
                self.rotations -= 1;
            } else if phase_diff < -std::f64::consts::PI {
                self.rotations += 1;
            }
            self.foffset = self.pll.freq_hz() as f32;
        } else {
            self.was_on = false;
        }

        // Pass B: post-detection shift, phase preserved across blocks
        self.shift_osc.set_freq(self.shift / self.samprate as f32);
        if self.shift_osc.freq() != 0.0 {
            for s in buffer.iter_mut() {
                *s *= self.shift_osc.next();
            }
            self.shift_osc.renormalize();
        }

        // Pass C: AGC picks the per-sample gain ratio for this block
        let gain_change = if self.agc_enabled {
            self.agc.block_gain_change(
                self.gain,
                self.headroom,
                bb.bb_power,
                bb.n0,
                self.bandwidth,
                lo,
            )?
        } else {
            1.0
        };

        // Pass D: output conversion with geometric gain interpolation
        let mut output_power = 0.0f32;
        let mut pcm = Vec::with_capacity(lo * self.channels);
        if self.channels == 1 {
            if self.envelope {
                // AM envelope
                for &s in buffer.iter() {
                    let y = s.norm() * self.gain;
                    output_power += y * y;
                    pcm.push(y);
                    self.gain *= gain_change;
                }
            } else {
                // in-phase only: SSB, CW
                for &s in buffer.iter() {
                    let y = s.re * self.gain;
                    output_power += y * y;
                    pcm.push(y);
                    self.gain *= gain_change;
                }
            }
        } else if self.envelope {
            // I on left, envelope on right; +6 dB on the envelope matches
            // the SSB side by ear
            for &s in buffer.iter() {
                let l = s.re * self.gain;
                let r = 2.0 * s.norm() * self.gain;
                output_power += l * l + r * r;
                pcm.push(l);
                pcm.push(r);
                self.gain *= gain_change;
            }
        } else {
            // I/Q stereo
            for &s in buffer.iter() {
                let l = s.re * self.gain;
                let r = s.im * self.gain;
                output_power += l * l + r * r;
                pcm.push(l);
                pcm.push(r);
                self.gain *= gain_change;
            }
        }
        output_power /= lo as f32;
        if self.channels == 1 {
            // 0 dBFS is 1.0 peak, not RMS
            output_power *= 2.0;
        }

        // Pass E: mute on dead air, unlocked PLL, or an untuned channel
        let mute = output_power == 0.0 || (self.pll_enabled && !self.pll_lock) || !tuned;

        let stats = DemodStats {
            snr: self.snr,
            foffset: self.foffset,
            gain: self.gain,
            pll_lock: self.pll_lock,
            rotations: self.rotations,
            output_power,
        };
        Ok((
            PcmBlock {
                samples: pcm,
                channels: self.channels,
                mute,
            },
            stats,
        ))
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn set_headroom(&mut self, headroom: f32) {
        self.headroom = headroom;
    }

    pub fn set_shift(&mut self, shift: f32) {
        self.shift = shift;
    }

    pub fn set_pll_bandwidth(&mut self, loop_bw: f32) {
        self.loop_bw = loop_bw;
    }

    pub fn set_pll_enable(&mut self, on: bool) {
        self.pll_enabled = on;
    }

    pub fn set_agc_enable(&mut self, on: bool) {
        self.agc_enabled = on;
    }

    /// Track passband edits so the AGC noise estimate follows the filter.
    pub fn set_bandwidth(&mut self, bw: f32) {
        self.bandwidth = bw.abs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FilterConfig, LinearConfig, OutputConfig, TuneConfig};
    use approx::assert_relative_eq;

    fn config(channels: usize, envelope: bool, pll: bool, agc: bool) -> ChannelConfig {
        ChannelConfig {
            name: "t".into(),
            tune: TuneConfig {
                freq: 10_000_000.0,
                shift: 0.0,
                doppler: 0.0,
                doppler_rate: 0.0,
            },
            filter: FilterConfig {
                min_if: 200.0,
                max_if: 3000.0,
                kaiser_beta: 11.0,
                conjugate: false,
            },
            output: OutputConfig {
                samprate: 24_000,
                channels,
                headroom: 0.1778,
                gain: 1.0,
                ssrc: 1,
            },
            linear: LinearConfig {
                agc,
                pll,
                square: false,
                envelope,
                threshold: 0.1778,
                recovery_rate: 1.0001,
                hangtime: 10,
                loop_bw: 100.0,
                damping: std::f64::consts::FRAC_1_SQRT_2 as f32,
                lock_time: 0.05,
                squelch_open: crate::db2power(8.0),
                squelch_close: crate::db2power(7.0),
            },
        }
    }

    fn block(samples: Vec<Complex<f32>>) -> Baseband {
        let bb_power =
            samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len().max(1) as f32;
        Baseband {
            index: 1,
            samples,
            bb_power,
            n0: 0.0,
        }
    }

    #[test]
    fn test_sample_count_invariants() {
        for (channels, envelope) in [(1, false), (1, true), (2, false), (2, true)] {
            let mut demod = LinearDemod::new(&config(channels, envelope, false, false));
            let mut bb = block(vec![Complex::new(0.5, 0.1); 480]);
            let (pcm, _) = demod.process(&mut bb, true).unwrap();
            assert_eq!(pcm.samples.len(), 480 * channels);
        }
    }

    #[test]
    fn test_gain_constant_without_agc() {
        let mut demod = LinearDemod::new(&config(1, false, false, false));
        let before = demod.gain();
        let mut bb = block(vec![Complex::new(0.3, 0.0); 480]);
        demod.process(&mut bb, true).unwrap();
        assert_eq!(demod.gain(), before);
    }

    #[test]
    fn test_dc_passthrough_mono() {
        let mut demod = LinearDemod::new(&config(1, false, false, false));
        let mut bb = block(vec![Complex::new(1.0, 0.0); 480]);
        let (pcm, stats) = demod.process(&mut bb, true).unwrap();
        for &y in &pcm.samples {
            assert_relative_eq!(y, 1.0, epsilon = 1e-6);
        }
        // mono power accounting doubles the mean square
        assert_relative_eq!(stats.output_power, 2.0, epsilon = 1e-5);
        assert!(!pcm.mute);
    }

    #[test]
    fn test_envelope_detection() {
        let mut demod = LinearDemod::new(&config(1, true, false, false));
        let mut bb = block(vec![Complex::new(0.6, 0.8); 16]);
        let (pcm, _) = demod.process(&mut bb, true).unwrap();
        for &y in &pcm.samples {
            assert_relative_eq!(y, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_iq_stereo_interleaving() {
        let mut demod = LinearDemod::new(&config(2, false, false, false));
        let mut bb = block(vec![Complex::new(0.25, -0.5); 8]);
        let (pcm, _) = demod.process(&mut bb, true).unwrap();
        assert_eq!(pcm.samples.len(), 16);
        assert_relative_eq!(pcm.samples[0], 0.25, epsilon = 1e-6);
        assert_relative_eq!(pcm.samples[1], -0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_mute_on_silence_and_zero_freq() {
        let mut demod = LinearDemod::new(&config(1, false, false, false));
        let mut bb = block(vec![Complex::new(0.0, 0.0); 480]);
        let (pcm, _) = demod.process(&mut bb, true).unwrap();
        assert!(pcm.mute);

        let mut bb = block(vec![Complex::new(0.5, 0.0); 480]);
        let (pcm, _) = demod.process(&mut bb, false).unwrap();
        assert!(pcm.mute);
    }

    #[test]
    fn test_pll_locks_on_offset_carrier() {
        let mut demod = LinearDemod::new(&config(1, false, true, false));
        let fo = 24_000.0f64;
        let offset = 10.0f64;
        let lo = 480;
        let mut phase = 0.0f64;
        let mut locked_at = None;
        // lock_time 0.05 s at 24 kHz = 1200 samples = 2.5 blocks
        for blk in 0..40 {
            let samples: Vec<Complex<f32>> = (0..lo)
                .map(|_| {
                    let s = Complex::from_polar(1.0f32, phase as f32);
                    phase += 2.0 * std::f64::consts::PI * offset / fo;
                    s
                })
                .collect();
            let mut bb = block(samples);
            let (_, stats) = demod.process(&mut bb, true).unwrap();
            if stats.pll_lock && locked_at.is_none() {
                locked_at = Some(blk);
            }
        }
        let locked_at = locked_at.expect("PLL should lock on a clean carrier");
        assert!(locked_at >= 2, "lock requires lock_time of good SNR");
        let mut bb = block(vec![Complex::new(1.0, 0.0); lo]);
        let (_, stats) = demod.process(&mut bb, true).unwrap();
        assert!(
            (stats.foffset - offset as f32).abs() < 1.0,
            "foffset {} should approach {offset} Hz",
            stats.foffset
        );
    }

    #[test]
    fn test_rotations_change_bounded_per_block() {
        let mut demod = LinearDemod::new(&config(1, false, true, false));
        let fo = 24_000.0f64;
        let mut phase = 0.0f64;
        let mut last = 0i64;
        for _ in 0..20 {
            let samples: Vec<Complex<f32>> = (0..480)
                .map(|_| {
                    let s = Complex::from_polar(1.0f32, phase as f32);
                    phase += 2.0 * std::f64::consts::PI * 25.0 / fo;
                    s
                })
                .collect();
            let mut bb = block(samples);
            let (_, stats) = demod.process(&mut bb, true).unwrap();
            assert!((stats.rotations - last).abs() <= 1);
            last = stats.rotations;
        }
    }

    #[test]
    fn test_shift_moves_dc_to_tone() {
        let mut cfg = config(2, false, false, false);
        cfg.tune.shift = 6000.0; // quarter of the sample rate
        let mut demod = LinearDemod::new(&cfg);
        let mut bb = block(vec![Complex::new(1.0, 0.0); 8]);
        let (pcm, _) = demod.process(&mut bb, true).unwrap();
        // DC shifted by fs/4: I channel walks 1, 0, -1, 0, ...
        assert_relative_eq!(pcm.samples[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(pcm.samples[2], 0.0, epsilon = 1e-5);
        assert_relative_eq!(pcm.samples[4], -1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_agc_reduces_hot_signal_to_headroom() {
        let mut demod = LinearDemod::new(&config(1, false, false, true));
        // strong constant tone, unity amplitude
        let mut last_power = 0.0;
        for _ in 0..30 {
            let mut bb = block(vec![Complex::new(1.0, 0.0); 480]);
            let (_, stats) = demod.process(&mut bb, true).unwrap();
            last_power = stats.output_power;
        }
        // mono accounting: output_power converges to 2 * headroom^2
        let target = 2.0 * 0.1778f32 * 0.1778;
        assert!(
            (last_power - target).abs() / target < 0.1,
            "output power {last_power} should approach {target}"
        );
    }
}
