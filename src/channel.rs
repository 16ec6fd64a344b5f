//! Per-receiver channel state: configuration groups, the dynamic-creation
//! prototype, the runtime parameter update path and the status snapshot
//! shared with the status reporter.
//!
//! Updates never block the pipeline: they are queued per channel and
//! drained at the start of each block, so an update submitted while block
//! `k` is processing takes effect in block `k + 1`. A frequency-only
//! retune rebuilds only the tuning bin; passband or window edits rebuild
//! the whole mask.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::error::{Error, Result};

/// Tuning parameters, all mutable at runtime.
#[derive(Debug, Clone, Copy)]
pub struct TuneConfig {
    /// Channel center frequency, Hz absolute.
    pub freq: f64,
    /// Post-detection frequency shift, Hz (CW offset and the like).
    pub shift: f32,
    /// Doppler offset, Hz, added to the tuning frequency.
    pub doppler: f64,
    /// Doppler rate, Hz per second; advances the offset each block.
    pub doppler_rate: f64,
}

/// Pre-detection filter parameters.
#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    /// Lower passband edge relative to the tuning frequency, Hz.
    pub min_if: f32,
    /// Upper passband edge relative to the tuning frequency, Hz.
    pub max_if: f32,
    /// Kaiser window shape parameter.
    pub kaiser_beta: f32,
    /// Independent-sideband conjugate flag; accepted and carried, the
    /// mask builder treats both sidebands identically.
    pub conjugate: bool,
}

/// Output and gain parameters.
#[derive(Debug, Clone, Copy)]
pub struct OutputConfig {
    /// Output sample rate, Hz; must evenly divide the front-end blocks.
    pub samprate: u32,
    /// 1 = mono, 2 = stereo / IQ.
    pub channels: usize,
    /// Target maximum output amplitude, linear, <= 1.
    pub headroom: f32,
    /// Initial gain, linear voltage ratio.
    pub gain: f32,
    /// RTP synchronization source; 0 derives it from the frequency.
    pub ssrc: u32,
}

/// Linear demodulator settings.
#[derive(Debug, Clone, Copy)]
pub struct LinearConfig {
    pub agc: bool,
    pub pll: bool,
    /// Squaring detector for suppressed-carrier modes; implies `pll`.
    pub square: bool,
    /// Envelope detection instead of the in-phase channel.
    pub envelope: bool,
    /// AGC noise threshold, linear voltage ratio <= 1.
    pub threshold: f32,
    /// AGC recovery, voltage ratio per output sample (> 1).
    pub recovery_rate: f32,
    /// AGC hang time in blocks.
    pub hangtime: u32,
    /// PLL loop bandwidth, Hz.
    pub loop_bw: f32,
    /// PLL damping factor.
    pub damping: f32,
    /// Time above/below the squelch thresholds before the lock state
    /// flips, seconds.
    pub lock_time: f32,
    /// Lock detector opens above this SNR (power ratio).
    pub squelch_open: f32,
    /// Lock detector closes below this SNR (power ratio).
    pub squelch_close: f32,
}

/// Complete channel configuration. Also serves as the immutable
/// [`prototype`](ChannelConfig::instantiate) record for dynamically
/// created channels.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub tune: TuneConfig,
    pub filter: FilterConfig,
    pub output: OutputConfig,
    pub linear: LinearConfig,
}

impl ChannelConfig {
    /// Validate the invariants that hold for every running channel.
    pub fn validate(&self) -> Result<()> {
        if self.output.channels != 1 && self.output.channels != 2 {
            return Err(Error::Config(format!(
                "channel '{}': invalid channel count {}",
                self.name, self.output.channels
            )));
        }
        if !(self.output.headroom > 0.0 && self.output.headroom <= 1.0) {
            return Err(Error::Config(format!(
                "channel '{}': headroom must be in (0, 1]",
                self.name
            )));
        }
        if self.output.gain < 0.0 {
            return Err(Error::Config(format!(
                "channel '{}': negative gain",
                self.name
            )));
        }
        Ok(())
    }

    /// Normalized copy: swapped passband edges ordered, `square` forcing
    /// `pll`, the SSRC derived from the frequency when unset.
    pub fn normalized(mut self) -> Self {
        if self.filter.min_if > self.filter.max_if {
            std::mem::swap(&mut self.filter.min_if, &mut self.filter.max_if);
        }
        if self.linear.square {
            self.linear.pll = true;
        }
        if self.output.ssrc == 0 && self.tune.freq != 0.0 {
            self.output.ssrc = ssrc_from_freq(self.tune.freq);
        }
        self
    }

    /// Factory method for the dynamic-demod path: clone this prototype
    /// into a live channel at `freq`.
    pub fn instantiate(&self, name: &str, freq: f64, ssrc: u32) -> ChannelConfig {
        let mut cfg = self.clone();
        cfg.name = name.to_string();
        cfg.tune.freq = freq;
        cfg.output.ssrc = ssrc;
        cfg.normalized()
    }
}

/// Default SSRC: the decimal digits of the frequency in Hz.
pub fn ssrc_from_freq(freq: f64) -> u32 {
    (freq.abs().round() as u64 % (u32::MAX as u64 + 1)) as u32
}

/// A runtime parameter change, applied at the next block boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelUpdate {
    Frequency(f64),
    Shift(f32),
    Doppler { offset: f64, rate: f64 },
    FilterLow(f32),
    FilterHigh(f32),
    KaiserBeta(f32),
    Gain(f32),
    Headroom(f32),
    PllBandwidth(f32),
    PllEnable(bool),
    AgcEnable(bool),
}

/// Bounded per-channel update queue. The sender side never blocks the
/// pipeline; a full queue drops the oldest pending update.
pub struct UpdateQueue {
    tx: Sender<ChannelUpdate>,
    rx: Receiver<ChannelUpdate>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(64);
        Self { tx, rx }
    }

    pub fn sender(&self) -> Sender<ChannelUpdate> {
        self.tx.clone()
    }

    /// Deposit an update without blocking; oldest-first overflow.
    pub fn push(&self, update: ChannelUpdate) {
        while self.tx.try_send(update).is_err() {
            let _ = self.rx.try_recv();
        }
    }

    /// Drain everything queued so far, in submission order.
    pub fn drain(&self) -> Vec<ChannelUpdate> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(u) => out.push(u),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

impl Default for UpdateQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a channel's observable state, published once per block
/// under a short-held lock and read by the status reporter.
#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    pub ssrc: u32,
    pub freq: f64,
    pub snr: f32,
    pub foffset: f32,
    pub gain: f32,
    pub pll_lock: bool,
    pub rotations: i64,
    pub bb_power: f32,
    pub n0: f32,
    pub output_power: f32,
    pub blocks: u64,
}

/// Shared handle to a channel's status snapshot.
pub type StatusHandle = Arc<Mutex<ChannelStatus>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            name: "usb-test".into(),
            tune: TuneConfig {
                freq: 14_074_000.0,
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
                channels: 1,
                headroom: 0.178,
                gain: 1.0,
                ssrc: 0,
            },
            linear: LinearConfig {
                agc: true,
                pll: false,
                square: false,
                envelope: false,
                threshold: 0.178,
                recovery_rate: 1.000096,
                hangtime: 55,
                loop_bw: 100.0,
                damping: std::f64::consts::FRAC_1_SQRT_2 as f32,
                lock_time: 0.05,
                squelch_open: 6.31,
                squelch_close: 5.01,
            },
        }
    }

    #[test]
    fn test_ssrc_from_freq_decimal_digits() {
        assert_eq!(ssrc_from_freq(14_074_000.0), 14_074_000);
        assert_eq!(ssrc_from_freq(0.0), 0);
    }

    #[test]
    fn test_normalize_orders_passband_and_derives_ssrc() {
        let mut cfg = test_config();
        cfg.filter.min_if = 3000.0;
        cfg.filter.max_if = 200.0;
        let cfg = cfg.normalized();
        assert!(cfg.filter.min_if <= cfg.filter.max_if);
        assert_eq!(cfg.output.ssrc, 14_074_000);
    }

    #[test]
    fn test_square_implies_pll() {
        let mut cfg = test_config();
        cfg.linear.square = true;
        cfg.linear.pll = false;
        let cfg = cfg.normalized();
        assert!(cfg.linear.pll);
    }

    #[test]
    fn test_validate_rejects_bad_channel_count() {
        let mut cfg = test_config();
        cfg.output.channels = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_prototype_instantiation() {
        let proto = test_config();
        let live = proto.instantiate("dyn-7074", 7_074_000.0, 0);
        assert_eq!(live.tune.freq, 7_074_000.0);
        assert_eq!(live.output.ssrc, 7_074_000);
        assert_eq!(live.filter.min_if, proto.filter.min_if);
    }

    #[test]
    fn test_update_queue_order_and_drain() {
        let q = UpdateQueue::new();
        q.push(ChannelUpdate::Gain(2.0));
        q.push(ChannelUpdate::Shift(500.0));
        let drained = q.drain();
        assert_eq!(
            drained,
            vec![ChannelUpdate::Gain(2.0), ChannelUpdate::Shift(500.0)]
        );
        assert!(q.drain().is_empty());
    }

    #[test]
    fn test_update_queue_overflow_drops_oldest() {
        let q = UpdateQueue::new();
        for i in 0..100 {
            q.push(ChannelUpdate::Gain(i as f32));
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 64);
        assert_eq!(*drained.last().unwrap(), ChannelUpdate::Gain(99.0));
    }
}
