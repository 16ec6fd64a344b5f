//! The shared fast-convolution engine.
//!
//! One forward FFT per block is shared by every channel. The
//! [`ForwardStage`] is the publication point: the forward driver publishes
//! each transformed block behind an `Arc`, attached channel filters pick it
//! up, multiply their own frequency-domain mask and run a small inverse
//! transform at their own output rate. Overlap-save semantics throughout:
//! each block carries `M - 1` samples of history and each channel discards
//! the first `Mo - 1` output samples.
//!
//! Attach and detach take effect at the next block. After publishing, the
//! driver waits up to one block time for every attached consumer; a
//! consumer that misses the deadline is marked laggy and skipped, and its
//! next wait reports the miss so it can substitute a zero block.

pub mod mask;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use num_complex::Complex;
use rustfft::Fft;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fft;
use crate::frontend::FrontEnd;

/// One transformed block, read-only after publication.
#[derive(Debug)]
pub struct ForwardBlock {
    /// Monotonically increasing block index, starting at 1.
    pub index: u64,
    /// Frequency-domain bins: `N` for complex input, `N/2 + 1` for real.
    pub bins: Vec<Complex<f32>>,
    /// Per-block noise spectral density estimate (power per Hz).
    pub n0: f32,
}

struct LegState {
    consumed: u64,
    laggy: bool,
}

struct Shared {
    current: Option<Arc<ForwardBlock>>,
    index: u64,
    legs: HashMap<usize, LegState>,
    next_leg_id: usize,
    stopped: bool,
}

/// Publication barrier between the forward driver and the channel filters.
pub struct ForwardStage {
    frontend: FrontEnd,
    shared: Mutex<Shared>,
    published: Condvar,
    consumed: Condvar,
}

impl ForwardStage {
    pub fn new(frontend: FrontEnd) -> Arc<Self> {
        Arc::new(Self {
            frontend,
            shared: Mutex::new(Shared {
                current: None,
                index: 0,
                legs: HashMap::new(),
                next_leg_id: 0,
                stopped: false,
            }),
            published: Condvar::new(),
            consumed: Condvar::new(),
        })
    }

    pub fn frontend(&self) -> &FrontEnd {
        &self.frontend
    }

    /// Register a consumer. It will see blocks published after this call.
    pub fn attach(self: &Arc<Self>) -> LegHandle {
        let mut shared = self.shared.lock().unwrap();
        let id = shared.next_leg_id;
        shared.next_leg_id += 1;
        let consumed = shared.index;
        shared.legs.insert(
            id,
            LegState {
                consumed,
                laggy: false,
            },
        );
        // the driver may be waiting for its first consumer
        self.consumed.notify_all();
        debug!(leg = id, block = consumed, "leg attached");
        LegHandle {
            stage: Arc::clone(self),
            id,
        }
    }

    /// Number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.shared.lock().unwrap().legs.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().unwrap().stopped
    }

    /// Stop the pipeline: wakes the driver and every waiting consumer.
    pub fn stop(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.stopped = true;
        drop(shared);
        self.published.notify_all();
        self.consumed.notify_all();
    }

    /// Block until at least one consumer is attached. Returns false when
    /// the stage was stopped instead.
    fn wait_for_consumer(&self) -> bool {
        let mut shared = self.shared.lock().unwrap();
        while shared.legs.is_empty() && !shared.stopped {
            shared = self.consumed.wait(shared).unwrap();
        }
        !shared.stopped
    }

    fn publish(&self, bins: Vec<Complex<f32>>, n0: f32) -> u64 {
        let mut shared = self.shared.lock().unwrap();
        shared.index += 1;
        let index = shared.index;
        shared.current = Some(Arc::new(ForwardBlock { index, bins, n0 }));
        drop(shared);
        self.published.notify_all();
        index
    }

    /// Wait until every attached leg has consumed `index`, marking legs
    /// laggy when the deadline passes.
    fn wait_consumed(&self, index: u64, deadline: Duration) {
        let until = Instant::now() + deadline;
        let mut shared = self.shared.lock().unwrap();
        loop {
            if shared.stopped
                || shared
                    .legs
                    .values()
                    .all(|leg| leg.laggy || leg.consumed >= index)
            {
                return;
            }
            let now = Instant::now();
            if now >= until {
                for (id, leg) in shared.legs.iter_mut() {
                    if !leg.laggy && leg.consumed < index {
                        warn!(leg = id, block = index, "consumer missed block deadline");
                        leg.laggy = true;
                    }
                }
                return;
            }
            let (guard, _timeout) = self.consumed.wait_timeout(shared, until - now).unwrap();
            shared = guard;
        }
    }
}

/// What a consumer gets back from [`LegHandle::wait_block`].
pub enum LegBlock {
    /// A freshly published block, ready to filter.
    Ready(Arc<ForwardBlock>),
    /// This leg missed the consumption deadline; the block carrying this
    /// index was released without it. Substitute a zero output block.
    Missed(u64),
}

/// A consumer's attachment to the forward stage. Detaches on drop.
pub struct LegHandle {
    stage: Arc<ForwardStage>,
    id: usize,
}

impl LegHandle {
    /// Wait for the next unconsumed block. Returns `None` when the stage
    /// has stopped.
    pub fn wait_block(&self) -> Option<LegBlock> {
        let mut shared = self.stage.shared.lock().unwrap();
        loop {
            if shared.stopped {
                return None;
            }
            let index = shared.index;
            let leg = shared.legs.get_mut(&self.id).expect("leg detached");
            if leg.laggy {
                leg.laggy = false;
                leg.consumed = index;
                drop(shared);
                self.stage.consumed.notify_all();
                return Some(LegBlock::Missed(index));
            }
            if index > leg.consumed {
                if let Some(block) = shared.current.as_ref() {
                    return Some(LegBlock::Ready(Arc::clone(block)));
                }
            }
            shared = self.stage.published.wait(shared).unwrap();
        }
    }

    /// Acknowledge consumption of `index`, releasing the driver's barrier.
    pub fn ack(&self, index: u64) {
        let mut shared = self.stage.shared.lock().unwrap();
        if let Some(leg) = shared.legs.get_mut(&self.id) {
            leg.consumed = index;
        }
        drop(shared);
        self.stage.consumed.notify_all();
    }

    pub fn stage(&self) -> &Arc<ForwardStage> {
        &self.stage
    }
}

impl Drop for LegHandle {
    fn drop(&mut self) {
        let mut shared = self.stage.shared.lock().unwrap();
        shared.legs.remove(&self.id);
        drop(shared);
        self.stage.consumed.notify_all();
        debug!(leg = self.id, "leg detached");
    }
}

/// Thread-local state of the forward transform: the overlap-save window and
/// the FFT plan. Owned by the forward thread; everything shared lives in
/// the [`ForwardStage`].
pub struct ForwardDriver {
    stage: Arc<ForwardStage>,
    window: Vec<Complex<f32>>,
    plan: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl ForwardDriver {
    pub fn new(stage: Arc<ForwardStage>) -> Self {
        let n = stage.frontend().fft_len();
        let plan = fft::forward(n);
        let scratch = vec![Complex::new(0.0, 0.0); plan.get_inplace_scratch_len()];
        Self {
            stage,
            window: vec![Complex::new(0.0, 0.0); n],
            plan,
            scratch,
        }
    }

    /// Ingest one block of `L` fresh samples: slide the overlap-save
    /// window, transform, estimate the noise floor, publish, and hold the
    /// barrier until all consumers have caught up (or one block time has
    /// passed). Returns the published block index, or `None` when the
    /// stage stopped.
    pub fn push_block(&mut self, fresh: &[Complex<f32>]) -> Result<Option<u64>> {
        let fe = self.stage.frontend();
        let l = fe.block_len();
        let n = fe.fft_len();
        if fresh.len() != l {
            return Err(Error::InternalInvariant("ingest block length != L"));
        }
        if !self.stage.wait_for_consumer() {
            return Ok(None);
        }

        // retain the last M-1 samples, append the new L
        self.window.copy_within(l..n, 0);
        self.window[n - l..].copy_from_slice(fresh);

        let mut bins = self.window.clone();
        self.plan.process_with_scratch(&mut bins, &mut self.scratch);
        if fe.real_input() {
            bins.truncate(n / 2 + 1);
        }

        let n0 = estimate_n0(&bins, n, fe.samprate());
        let index = self.stage.publish(bins, n0);
        self.stage.wait_consumed(index, fe.block_duration());
        Ok(Some(index))
    }
}

/// Noise spectral density from the quietest tenth of the bins.
///
/// For white noise of density `n0`, an unnormalized `N`-point transform
/// yields `E|X[k]|^2 = n0 * Fs * N`; occupied bins only push the estimate
/// up, so the low decile tracks the noise floor.
fn estimate_n0(bins: &[Complex<f32>], fft_len: usize, samprate: u32) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let mut powers: Vec<f32> = bins.iter().map(|b| b.norm_sqr()).collect();
    let cut = (powers.len() / 10).max(1);
    powers.select_nth_unstable_by(cut - 1, |a, b| a.total_cmp(b));
    let mean: f32 = powers[..cut].iter().sum::<f32>() / cut as f32;
    mean / (fft_len as f32 * samprate as f32)
}

/// A block of complex baseband delivered to a demodulator.
pub struct Baseband {
    pub index: u64,
    pub samples: Vec<Complex<f32>>,
    /// Mean squared magnitude over the block.
    pub bb_power: f32,
    /// Front-end noise density for this block.
    pub n0: f32,
}

/// Per-channel output side of the fast-convolution engine.
///
/// Holds the mask, the tuning bin offset, the inverse transform and the
/// inter-block phase corrector that keeps the downconversion coherent when
/// the tuning bin does not divide the block hop.
pub struct ChannelFilter {
    leg: LegHandle,
    fft_len: usize,
    block_len: usize,
    real_input: bool,
    fo: u32,
    no: usize,
    mo: usize,
    lo: usize,
    bin_offset: i64,
    mask: Vec<Complex<f32>>,
    plan: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
    buf: Vec<Complex<f32>>,
    /// Accumulated inter-block phase correction.
    block_phase: Complex<f32>,
    /// Per-block rotation: `exp(-2*pi*i * k0 * L / N)`.
    block_rot: Complex<f32>,
}

impl ChannelFilter {
    /// Attach a new output leg to `stage` and build its mask.
    pub fn new(
        stage: &Arc<ForwardStage>,
        fo: u32,
        freq: f64,
        min_if: f32,
        max_if: f32,
        kaiser_beta: f32,
    ) -> Result<Self> {
        let fe = stage.frontend().clone();
        let d = fe.decimation(fo)?;
        let no = fe.fft_len() / d;
        let lo = fe.block_len() / d;
        let mo = no - lo + 1;

        let plan = fft::inverse(no);
        let scratch = vec![Complex::new(0.0, 0.0); plan.get_inplace_scratch_len()];
        let mut filter = Self {
            leg: stage.attach(),
            fft_len: fe.fft_len(),
            block_len: fe.block_len(),
            real_input: fe.real_input(),
            fo,
            no,
            mo,
            lo,
            bin_offset: 0,
            mask: Vec::new(),
            plan,
            scratch,
            buf: vec![Complex::new(0.0, 0.0); no],
            block_phase: Complex::new(1.0, 0.0),
            block_rot: Complex::new(1.0, 0.0),
        };
        filter.set_passband(min_if, max_if, kaiser_beta);
        filter.retune(freq);
        Ok(filter)
    }

    /// Baseband samples produced per block (`Lo`).
    pub fn output_len(&self) -> usize {
        self.lo
    }

    /// Channel transform size (`No`).
    pub fn transform_len(&self) -> usize {
        self.no
    }

    /// Channel impulse response length (`Mo`).
    pub fn response_len(&self) -> usize {
        self.mo
    }

    /// Move the tuning bin; the mask is untouched. Cheap enough to call on
    /// every retune, including per-block Doppler steps.
    pub fn retune(&mut self, freq: f64) {
        let k0 = self.leg.stage().frontend().tuning_bin(freq);
        if k0 == self.bin_offset {
            return;
        }
        self.bin_offset = k0;
        let turns = (k0 * self.block_len as i64).rem_euclid(self.fft_len as i64);
        let angle = -2.0 * std::f32::consts::PI * turns as f32 / self.fft_len as f32;
        self.block_rot = Complex::from_polar(1.0, angle);
    }

    /// Rebuild the mask for new passband edges or window shape.
    pub fn set_passband(&mut self, min_if: f32, max_if: f32, kaiser_beta: f32) {
        let (low, high) = if min_if <= max_if {
            (min_if, max_if)
        } else {
            (max_if, min_if)
        };
        self.mask = mask::build_mask(self.no, self.mo, self.fo, low, high, kaiser_beta, self.fft_len);
    }

    /// Wait for the next forward block. `None` means the pipeline stopped.
    pub fn wait_block(&self) -> Option<LegBlock> {
        self.leg.wait_block()
    }

    /// Release the barrier for `index` after processing.
    pub fn ack(&self, index: u64) {
        self.leg.ack(index)
    }

    /// Extract, filter and inverse-transform one published block.
    pub fn process(&mut self, block: &ForwardBlock) -> Baseband {
        let no = self.no;
        for j in 0..no {
            let signed = if j <= no / 2 { j as i64 } else { j as i64 - no as i64 };
            let k = self.bin_offset + signed;
            self.buf[j] = self.bin(&block.bins, k) * self.mask[j];
        }
        self.plan
            .process_with_scratch(&mut self.buf, &mut self.scratch);

        let phase = self.block_phase;
        let mut bb_power = 0.0f32;
        let samples: Vec<Complex<f32>> = self.buf[self.mo - 1..]
            .iter()
            .map(|&s| {
                let v = s * phase;
                bb_power += v.norm_sqr();
                v
            })
            .collect();
        bb_power /= self.lo as f32;

        self.block_phase *= self.block_rot;
        let norm = self.block_phase.norm();
        if norm > 0.0 {
            self.block_phase /= norm;
        }

        Baseband {
            index: block.index,
            samples,
            bb_power,
            n0: block.n0,
        }
    }

    /// Zero output for a missed block, keeping the sample count invariant.
    pub fn zero_block(&mut self, index: u64) -> Baseband {
        self.block_phase *= self.block_rot;
        Baseband {
            index,
            samples: vec![Complex::new(0.0, 0.0); self.lo],
            bb_power: 0.0,
            n0: 0.0,
        }
    }

    /// Fetch forward bin `k` (signed, wrapped), reconstructing negative
    /// frequencies by conjugate mirror when the front end is real.
    fn bin(&self, bins: &[Complex<f32>], k: i64) -> Complex<f32> {
        let n = self.fft_len as i64;
        let kw = k.rem_euclid(n) as usize;
        if !self.real_input {
            return bins[kw];
        }
        let half = self.fft_len / 2;
        if kw <= half {
            bins[kw]
        } else {
            bins[self.fft_len - kw].conj()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::FrontEnd;

    fn small_frontend() -> FrontEnd {
        // 48 ksps, 10 ms blocks, 1/5 overlap: L=480, M=121, N=600
        FrontEnd::new(48_000, 0.0, false, 10.0, 5).unwrap()
    }

    #[test]
    fn test_geometry_small() {
        let fe = small_frontend();
        assert_eq!(fe.block_len(), 480);
        assert_eq!(fe.response_len(), 121);
        assert_eq!(fe.fft_len(), 600);
    }

    #[test]
    fn test_leg_sizes() {
        let stage = ForwardStage::new(small_frontend());
        let filt = ChannelFilter::new(&stage, 8_000, 0.0, -3_000.0, 3_000.0, 11.0).unwrap();
        // d = 6: No = 100, Lo = 80, Mo = 21
        assert_eq!(filt.transform_len(), 100);
        assert_eq!(filt.output_len(), 80);
        assert_eq!(filt.response_len(), 21);
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let stage = ForwardStage::new(small_frontend());
        assert!(matches!(
            ChannelFilter::new(&stage, 44_100, 0.0, -3_000.0, 3_000.0, 11.0),
            Err(Error::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn test_publish_and_consume_in_order() {
        let fe = small_frontend();
        let stage = ForwardStage::new(fe.clone());
        let mut filt = ChannelFilter::new(&stage, 8_000, 0.0, -3_000.0, 3_000.0, 11.0).unwrap();
        let mut driver = ForwardDriver::new(Arc::clone(&stage));

        let worker = std::thread::spawn({
            let stage = Arc::clone(&stage);
            move || {
                let mut indices = Vec::new();
                let mut seen = 0;
                while let Some(block) = filt.wait_block() {
                    match block {
                        LegBlock::Ready(fb) => {
                            let bb = filt.process(&fb);
                            assert_eq!(bb.samples.len(), filt.output_len());
                            indices.push(fb.index);
                            filt.ack(fb.index);
                        }
                        LegBlock::Missed(idx) => {
                            filt.ack(idx);
                        }
                    }
                    seen += 1;
                    if seen == 3 {
                        stage.stop();
                    }
                }
                indices
            }
        });

        let fresh = vec![Complex::new(1.0, 0.0); fe.block_len()];
        for _ in 0..50 {
            if driver.push_block(&fresh).unwrap().is_none() {
                break;
            }
        }
        let indices = worker.join().unwrap();
        // strictly increasing consumption order within the channel
        assert!(!indices.is_empty());
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_dc_passthrough_after_settling() {
        let fe = small_frontend();
        let stage = ForwardStage::new(fe.clone());
        let mut filt = ChannelFilter::new(&stage, 8_000, 0.0, -3_000.0, 3_000.0, 11.0).unwrap();
        let mut driver = ForwardDriver::new(Arc::clone(&stage));

        let handle = std::thread::spawn({
            let stage = Arc::clone(&stage);
            move || {
                let mut last = Vec::new();
                let mut ready = 0;
                while let Some(block) = filt.wait_block() {
                    match block {
                        LegBlock::Ready(fb) => {
                            let bb = filt.process(&fb);
                            filt.ack(fb.index);
                            ready += 1;
                            if ready >= 4 {
                                last = bb.samples;
                                stage.stop();
                            }
                        }
                        LegBlock::Missed(idx) => filt.ack(idx),
                    }
                }
                last
            }
        });

        let fresh = vec![Complex::new(1.0, 0.0); fe.block_len()];
        for _ in 0..50 {
            if driver.push_block(&fresh).unwrap().is_none() {
                break;
            }
        }
        let out = handle.join().unwrap();
        // DC through a DC-centered passband: every output sample ~1.0
        assert!(!out.is_empty());
        for s in &out {
            assert!((s.re - 1.0).abs() < 0.02, "re = {}", s.re);
            assert!(s.im.abs() < 0.02, "im = {}", s.im);
        }
    }

    #[test]
    fn test_estimate_n0_flat_noise_floor() {
        // all bins at equal power p: estimate = p / (N * Fs)
        let bins = vec![Complex::new(2.0, 0.0); 600];
        let n0 = estimate_n0(&bins, 600, 48_000);
        let expected = 4.0 / (600.0 * 48_000.0);
        assert!((n0 - expected).abs() / expected < 1e-5);
    }
}
