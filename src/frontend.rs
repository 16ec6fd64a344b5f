//! Front-end descriptor and overlap-save block geometry.
//!
//! The front end is fixed at startup: sample rate, real-vs-complex input,
//! and block time determine the three sizes everything else is built on:
//!
//! - `L` samples of new input per block (`block_len`),
//! - `M` the longest realizable impulse response (`response_len`),
//! - `N = L + M - 1` the forward transform size (`fft_len`).
//!
//! With `overlap` fraction `V`, `M = L / (V - 1) + 1`, so consecutive
//! transform windows share `M - 1 = L / (V - 1)` samples. Once built, a
//! [`FrontEnd`] never changes.

use std::time::Duration;

use crate::error::{Error, Result};

/// Immutable front-end description plus derived block geometry.
#[derive(Debug, Clone)]
pub struct FrontEnd {
    samprate: u32,
    center: f64,
    real_input: bool,
    blocktime_ms: f32,
    overlap: usize,
    block_len: usize,
    response_len: usize,
    fft_len: usize,
}

impl FrontEnd {
    /// Build a front-end descriptor and validate the derived geometry.
    ///
    /// `center` is the frequency of bin 0 of the forward transform: the
    /// nominal center frequency for complex input, or the low band edge
    /// for real input (whose usable band is `[center, center + Fs/2]`).
    pub fn new(
        samprate: u32,
        center: f64,
        real_input: bool,
        blocktime_ms: f32,
        overlap: usize,
    ) -> Result<Self> {
        if samprate == 0 {
            return Err(Error::Config("front-end sample rate is zero".into()));
        }
        if !(blocktime_ms.is_finite() && blocktime_ms > 0.0) {
            return Err(Error::Config(format!("bad block time {blocktime_ms} ms")));
        }
        if overlap < 2 {
            return Err(Error::Config(format!(
                "overlap must be at least 2, got {overlap}"
            )));
        }
        let block_len = (samprate as f64 * blocktime_ms as f64 / 1000.0).round() as usize;
        if block_len == 0 {
            return Err(Error::Config("block time too short for sample rate".into()));
        }
        let response_len = block_len / (overlap - 1) + 1;
        let fft_len = block_len + response_len - 1;
        if fft_len % 2 != 0 {
            return Err(Error::Config(format!(
                "transform size {fft_len} is odd; adjust block time or overlap"
            )));
        }
        Ok(Self {
            samprate,
            center,
            real_input,
            blocktime_ms,
            overlap,
            block_len,
            response_len,
            fft_len,
        })
    }

    pub fn samprate(&self) -> u32 {
        self.samprate
    }

    pub fn center(&self) -> f64 {
        self.center
    }

    pub fn real_input(&self) -> bool {
        self.real_input
    }

    pub fn blocktime_ms(&self) -> f32 {
        self.blocktime_ms
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// New input samples per block (`L`).
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Maximum impulse response length (`M`).
    pub fn response_len(&self) -> usize {
        self.response_len
    }

    /// Forward transform size (`N = L + M - 1`).
    pub fn fft_len(&self) -> usize {
        self.fft_len
    }

    /// Number of stored frequency bins: `N/2 + 1` for real input, `N` for
    /// complex.
    pub fn bin_count(&self) -> usize {
        if self.real_input {
            self.fft_len / 2 + 1
        } else {
            self.fft_len
        }
    }

    /// Wall-clock duration of one block.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.blocktime_ms as f64 / 1000.0)
    }

    /// Integer decimation from the front-end rate to `fo`.
    ///
    /// The output rate must divide the front-end rate, the block length and
    /// the transform size exactly, or no channel at `fo` can share this
    /// forward transform.
    pub fn decimation(&self, fo: u32) -> Result<usize> {
        let mismatch = Error::SampleRateMismatch {
            fs: self.samprate,
            fo,
        };
        if fo == 0 || self.samprate % fo != 0 {
            return Err(mismatch);
        }
        let d = (self.samprate / fo) as usize;
        if self.block_len % d != 0 || self.fft_len % d != 0 {
            return Err(mismatch);
        }
        Ok(d)
    }

    /// Signed forward-transform bin nearest to the absolute frequency `freq`.
    ///
    /// The caller wraps the result modulo `N`; negative bins address the
    /// spectrum below the center (conjugate mirrors for real input).
    pub fn tuning_bin(&self, freq: f64) -> i64 {
        let rel = freq - self.center;
        (rel * self.fft_len as f64 / self.samprate as f64).round() as i64
    }
}
