//! Shared FFT planner.
//!
//! A single process-wide planner hands out transform plans to the forward
//! stage, every channel filter and the mask builder. Plans are `Arc`-shared
//! and cheap to clone; the planner itself is the only global state in the
//! crate.

use std::sync::{Arc, Mutex, OnceLock};

use rustfft::{Fft, FftPlanner};

static PLANNER: OnceLock<Mutex<FftPlanner<f32>>> = OnceLock::new();

fn planner() -> &'static Mutex<FftPlanner<f32>> {
    PLANNER.get_or_init(|| Mutex::new(FftPlanner::new()))
}

/// Plan (or fetch the cached plan for) a forward transform of `len` points.
pub fn forward(len: usize) -> Arc<dyn Fft<f32>> {
    planner()
        .lock()
        .expect("fft planner lock poisoned")
        .plan_fft_forward(len)
}

/// Plan (or fetch the cached plan for) an inverse transform of `len` points.
///
/// rustfft inverse transforms are unnormalized; callers fold the `1/len`
/// (or a combined chain gain) into their own coefficients.
pub fn inverse(len: usize) -> Arc<dyn Fft<f32>> {
    planner()
        .lock()
        .expect("fft planner lock poisoned")
        .plan_fft_inverse(len)
}
