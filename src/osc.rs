//! Complex oscillators: a stepped phasor for post-detection frequency
//! shifts, and the carrier-recovery phase-locked loop used by the linear
//! demodulator.

use std::f64::consts::PI;

use num_complex::Complex;

/// A stepped complex oscillator.
///
/// Holds a unit phasor and a per-sample rotation multiplier. Phase is
/// preserved across blocks; callers renormalize once per block to keep the
/// phasor on the unit circle.
#[derive(Debug, Clone)]
pub struct Oscillator {
    phasor: Complex<f32>,
    step: Complex<f32>,
    freq: f32,
}

impl Oscillator {
    /// Create an oscillator at `freq` cycles per sample.
    pub fn new(freq: f32) -> Self {
        let angle = 2.0 * std::f32::consts::PI * freq;
        Self {
            phasor: Complex::new(1.0, 0.0),
            step: Complex::new(angle.cos(), angle.sin()),
            freq,
        }
    }

    /// Current frequency in cycles per sample.
    pub fn freq(&self) -> f32 {
        self.freq
    }

    /// Retarget the oscillator without disturbing its phase.
    pub fn set_freq(&mut self, freq: f32) {
        if freq != self.freq {
            let angle = 2.0 * std::f32::consts::PI * freq;
            self.step = Complex::new(angle.cos(), angle.sin());
            self.freq = freq;
        }
    }

    /// Return the current phasor and advance by one sample.
    pub fn next(&mut self) -> Complex<f32> {
        let out = self.phasor;
        self.phasor *= self.step;
        out
    }

    /// Pull the phasor back onto the unit circle; call once per block.
    pub fn renormalize(&mut self) {
        let norm = self.phasor.norm();
        if norm > 0.0 {
            self.phasor /= norm;
        }
    }
}

/// Second-order phase-locked loop for carrier recovery.
///
/// The loop filter is the standard proportional + integral design
/// (Gardner): with natural frequency `omega_n` derived from the loop
/// bandwidth and damping factor,
///
/// ```text
/// omega_n    = 2*pi*loop_bw / Fs / (damping + 1/(4*damping))
/// prop_gain  = 2 * damping * omega_n
/// integ_gain = omega_n^2
/// ```
///
/// The integrator carries the frequency estimate; resetting it on PLL
/// re-enable restarts acquisition from zero offset.
#[derive(Debug, Clone)]
pub struct Pll {
    samprate: f64,
    /// VCO phase, radians, wrapped to [-pi, pi]
    phase: f64,
    /// Integral path, radians per sample
    integrator: f64,
    prop_gain: f64,
    integ_gain: f64,
}

impl Pll {
    pub fn new(samprate: f64) -> Self {
        Self {
            samprate,
            phase: 0.0,
            integrator: 0.0,
            prop_gain: 0.0,
            integ_gain: 0.0,
        }
    }

    /// Set loop bandwidth (Hz) and damping factor. Safe to call per block;
    /// gains are recomputed from scratch.
    pub fn set_params(&mut self, loop_bw: f64, damping: f64) {
        let omega_n = 2.0 * PI * loop_bw / self.samprate / (damping + 1.0 / (4.0 * damping));
        self.prop_gain = 2.0 * damping * omega_n;
        self.integ_gain = omega_n * omega_n;
    }

    /// Current VCO phasor.
    pub fn phasor(&self) -> Complex<f32> {
        Complex::from_polar(1.0, self.phase as f32)
    }

    /// Current VCO phase in radians, [-pi, pi].
    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Advance the loop by one sample given the detected phase error.
    pub fn step(&mut self, phase_error: f64) {
        self.integrator += self.integ_gain * phase_error;
        self.phase += self.prop_gain * phase_error + self.integrator;
        if self.phase > PI {
            self.phase -= 2.0 * PI;
        } else if self.phase < -PI {
            self.phase += 2.0 * PI;
        }
    }

    /// Frequency estimate in Hz, taken from the integral path.
    pub fn freq_hz(&self) -> f64 {
        self.integrator * self.samprate / (2.0 * PI)
    }

    /// Clear the oscillator and integrator; used on PLL re-enable.
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.integrator = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_oscillator_quarter_turns() {
        let mut osc = Oscillator::new(0.25);
        let a = osc.next();
        let b = osc.next();
        let c = osc.next();
        assert_relative_eq!(a.re, 1.0, epsilon = 1e-6);
        assert_relative_eq!(b.im, 1.0, epsilon = 1e-6);
        assert_relative_eq!(c.re, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_oscillator_set_freq_keeps_phase() {
        let mut osc = Oscillator::new(0.1);
        for _ in 0..7 {
            osc.next();
        }
        let before = osc.next();
        osc.set_freq(0.2);
        // next() returns the phasor before stepping at the new rate
        let after = osc.next();
        let expected = before * Complex::from_polar(1.0, 2.0 * std::f32::consts::PI * 0.1);
        assert!((after - expected).norm() < 1e-5);
    }

    #[test]
    fn test_oscillator_stays_on_unit_circle() {
        let mut osc = Oscillator::new(0.013);
        for _ in 0..10 {
            for _ in 0..4096 {
                osc.next();
            }
            osc.renormalize();
        }
        assert_relative_eq!(osc.next().norm(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_pll_tracks_offset_carrier() {
        let fs = 24_000.0;
        let offset = 10.0;
        let mut pll = Pll::new(fs);
        pll.set_params(100.0, std::f64::consts::FRAC_1_SQRT_2);

        let mut carrier_phase = 0.0f64;
        for _ in 0..48_000 {
            let s = Complex::from_polar(1.0f32, carrier_phase as f32);
            carrier_phase += 2.0 * PI * offset / fs;
            let rotated = s * pll.phasor().conj();
            pll.step(rotated.arg() as f64);
        }
        assert!(
            (pll.freq_hz() - offset).abs() < 1.0,
            "PLL should converge to {offset} Hz, got {:.2}",
            pll.freq_hz()
        );
    }

    #[test]
    fn test_pll_reset_clears_state() {
        let mut pll = Pll::new(24_000.0);
        pll.set_params(100.0, 0.707);
        for _ in 0..100 {
            pll.step(0.3);
        }
        pll.reset();
        assert_eq!(pll.phase(), 0.0);
        assert_eq!(pll.freq_hz(), 0.0);
    }
}
