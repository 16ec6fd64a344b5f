//! Per-channel frequency-domain filter masks.
//!
//! A mask is the channel's entire pre-detection filter in one set of `No`
//! complex coefficients: brick-wall passband limits, Kaiser window and the
//! overall chain normalization folded together. The tuning offset is *not*
//! part of the mask; the channel filter applies it as a bin offset when
//! extracting from the shared forward block.

use num_complex::Complex;
use tracing::warn;

use crate::fft;

/// Zeroth-order modified Bessel function of the first kind.
///
/// Power-series evaluation, converged well below f32 resolution; used only
/// at mask build time.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x = x / 2.0;
    for k in 1..=32 {
        term *= half_x / k as f64;
        let t = term * term;
        sum += t;
        if t < 1e-18 * sum {
            break;
        }
    }
    sum
}

/// Generate a Kaiser window of the given length and shape parameter.
///
/// Beta trades skirt sharpness against sidelobe height; 11 keeps sidelobes
/// below roughly -70 dB.
pub fn kaiser_window(length: usize, beta: f64) -> Vec<f32> {
    if length == 0 {
        return vec![];
    }
    if length == 1 {
        return vec![1.0];
    }
    let half = (length - 1) as f64 / 2.0;
    let denom = bessel_i0(beta);
    (0..length)
        .map(|n| {
            let x = (n as f64 - half) / half;
            (bessel_i0(beta * (1.0 - x * x).sqrt()) / denom) as f32
        })
        .collect()
}

/// Build the frequency-domain mask for one channel.
///
/// * `no` - channel transform size
/// * `mo` - channel impulse response length (taps)
/// * `fo` - channel output sample rate, Hz
/// * `min_if`, `max_if` - passband edges relative to the tuning frequency
/// * `beta` - Kaiser shape parameter
/// * `forward_len` - forward transform size, folded in as `1/N` so that a
///   passband tone traverses the forward-multiply-inverse chain at unity
///   gain
///
/// Passband edges beyond the channel Nyquist interval are clamped with a
/// warning rather than rejected; the channel keeps running with the widest
/// realizable filter.
pub fn build_mask(
    no: usize,
    mo: usize,
    fo: u32,
    min_if: f32,
    max_if: f32,
    beta: f32,
    forward_len: usize,
) -> Vec<Complex<f32>> {
    let half_rate = fo as f32 / 2.0;
    let (mut low, mut high) = (min_if, max_if);
    if low < -half_rate || high > half_rate {
        warn!(
            low,
            high, half_rate, "passband exceeds channel Nyquist interval, clamping"
        );
        low = low.max(-half_rate);
        high = high.min(half_rate);
    }

    // Ideal brick-wall response on the channel's bin grid
    let bin_hz = fo as f32 / no as f32;
    let mut buf: Vec<Complex<f32>> = (0..no)
        .map(|j| {
            let signed = if j <= no / 2 { j as i64 } else { j as i64 - no as i64 };
            let f = signed as f32 * bin_hz;
            if f >= low && f <= high {
                Complex::new(1.0, 0.0)
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();

    // To the time domain: impulse response circularly centered on sample 0
    fft::inverse(no).process(&mut buf);
    let scale = 1.0 / no as f32;
    for v in buf.iter_mut() {
        *v *= scale;
    }

    // Window `mo` taps around the center and lay them out as a causal FIR
    let window = kaiser_window(mo, beta as f64);
    let half = (mo / 2) as isize;
    let mut taps = vec![Complex::new(0.0, 0.0); no];
    for (k, &w) in window.iter().enumerate() {
        let src = (k as isize - half).rem_euclid(no as isize) as usize;
        taps[k] = buf[src] * w;
    }

    // Back to the frequency domain with the chain gain folded in
    fft::forward(no).process(&mut taps);
    let norm = 1.0 / forward_len as f32;
    for v in taps.iter_mut() {
        *v *= norm;
    }
    taps
}
