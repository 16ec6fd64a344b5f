//! Configuration file support for rxbankd.
//!
//! A TOML document with a `[global]` table (front end, block geometry,
//! status destination, mode-file path) and one `[channels.<name>]` table
//! per receiver. Channel tables name a mode preset; presets come from a
//! built-in table mirroring the usual analog modes, optionally extended or
//! overridden by a `[modes.<name>]` file. Precedence per key:
//! channel table, then mode preset, then built-in default.
//!
//! Frequencies are strings and accept `k`/`M`/`G` suffixes; `freq` (or
//! `freq0`..`freq9` for long lists) is whitespace-separated, and a listed
//! frequency of 0 turns the section into the dynamic-channel template.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use rxbank::channel::{ChannelConfig, FilterConfig, LinearConfig, OutputConfig, TuneConfig};
use rxbank::{db2power, db2voltage, Error, Result};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub channels: BTreeMap<String, ChannelSection>,
}

/// `[global]` settings applying to the whole daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Sample input: a `host:port` UDP endpoint or an I/Q file path.
    pub input: Option<String>,
    /// Wire sample format (ru8/rs8/rs16/rf32/cu8/cs8/cs16/cf32).
    pub format: String,
    /// Front-end sample rate, Hz.
    pub samprate: u32,
    /// Frequency of forward bin 0, Hz.
    pub center: f64,
    /// Real-sampled front end (half spectrum).
    pub real: bool,
    /// Block time, milliseconds.
    pub blocktime: f32,
    /// Overlap fraction denominator (5 = 1/5 of each transform reused).
    pub overlap: usize,
    /// Status/command destination, `host:port`; omit to disable.
    pub status: Option<String>,
    /// Status report interval, milliseconds.
    #[serde(rename = "status-interval")]
    pub status_interval_ms: u64,
    /// Default PCM destination for channels that set none.
    pub data: Option<String>,
    /// Extra mode presets, `[modes.<name>]` tables.
    #[serde(rename = "mode-file")]
    pub mode_file: Option<PathBuf>,
    /// Front-end stall timeout in block times.
    #[serde(rename = "stall-blocks")]
    pub stall_blocks: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            input: None,
            format: "cs16".into(),
            samprate: 0,
            center: 0.0,
            real: false,
            blocktime: 20.0,
            overlap: 5,
            status: None,
            status_interval_ms: 1000,
            data: None,
            mode_file: None,
            stall_blocks: 2,
        }
    }
}

/// One `[channels.<name>]` (or `[modes.<name>]`) table. Every field is
/// optional so the same shape works as a preset layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub disable: bool,
    pub mode: Option<String>,
    pub ssrc: Option<u32>,
    pub data: Option<String>,
    pub samprate: Option<u32>,
    /// Passband edges relative to the tuning frequency, Hz.
    pub low: Option<f32>,
    pub high: Option<f32>,
    #[serde(rename = "kaiser-beta")]
    pub kaiser_beta: Option<f32>,
    /// Post-detection shift, Hz.
    pub shift: Option<f32>,
    /// Initial gain, dB.
    pub gain: Option<f32>,
    /// Headroom, dB (sign ignored, always below full scale).
    pub headroom: Option<f32>,
    /// AGC recovery rate, dB/s.
    #[serde(rename = "recovery-rate")]
    pub recovery_rate: Option<f32>,
    /// AGC hang time, seconds.
    #[serde(rename = "hang-time")]
    pub hang_time: Option<f32>,
    /// AGC threshold, dB below headroom.
    pub threshold: Option<f32>,
    /// Lock detector opens above this SNR, dB.
    #[serde(rename = "squelch-open")]
    pub squelch_open: Option<f32>,
    /// Lock detector closes below this SNR, dB.
    #[serde(rename = "squelch-close")]
    pub squelch_close: Option<f32>,
    pub pll: Option<bool>,
    /// Squaring detector; implies pll.
    pub square: Option<bool>,
    pub envelope: Option<bool>,
    pub agc: Option<bool>,
    #[serde(rename = "pll-bw")]
    pub pll_bw: Option<f32>,
    #[serde(rename = "lock-time")]
    pub lock_time: Option<f32>,
    pub channels: Option<usize>,
    pub stereo: Option<bool>,
    pub mono: Option<bool>,
    pub conj: Option<bool>,
    pub freq: Option<String>,
    pub freq0: Option<String>,
    pub freq1: Option<String>,
    pub freq2: Option<String>,
    pub freq3: Option<String>,
    pub freq4: Option<String>,
    pub freq5: Option<String>,
    pub freq6: Option<String>,
    pub freq7: Option<String>,
    pub freq8: Option<String>,
    pub freq9: Option<String>,
}

impl ChannelSection {
    /// All frequency tokens, `freq` first then `freq0`..`freq9`.
    pub fn frequency_tokens(&self) -> Vec<String> {
        [
            &self.freq,
            &self.freq0,
            &self.freq1,
            &self.freq2,
            &self.freq3,
            &self.freq4,
            &self.freq5,
            &self.freq6,
            &self.freq7,
            &self.freq8,
            &self.freq9,
        ]
        .into_iter()
        .flatten()
        .flat_map(|list| list.split_whitespace().map(str::to_string))
        .collect()
    }

    /// Overlay `self` on a preset: every unset field falls back.
    fn resolved(&self, preset: &ChannelSection) -> ChannelSection {
        macro_rules! pick {
            ($field:ident) => {
                self.$field.clone().or_else(|| preset.$field.clone())
            };
        }
        ChannelSection {
            disable: self.disable,
            mode: pick!(mode),
            ssrc: pick!(ssrc),
            data: pick!(data),
            samprate: pick!(samprate),
            low: pick!(low),
            high: pick!(high),
            kaiser_beta: pick!(kaiser_beta),
            shift: pick!(shift),
            gain: pick!(gain),
            headroom: pick!(headroom),
            recovery_rate: pick!(recovery_rate),
            hang_time: pick!(hang_time),
            threshold: pick!(threshold),
            squelch_open: pick!(squelch_open),
            squelch_close: pick!(squelch_close),
            pll: pick!(pll),
            square: pick!(square),
            envelope: pick!(envelope),
            agc: pick!(agc),
            pll_bw: pick!(pll_bw),
            lock_time: pick!(lock_time),
            channels: pick!(channels),
            stereo: pick!(stereo),
            mono: pick!(mono),
            conj: pick!(conj),
            freq: self.freq.clone(),
            freq0: self.freq0.clone(),
            freq1: self.freq1.clone(),
            freq2: self.freq2.clone(),
            freq3: self.freq3.clone(),
            freq4: self.freq4.clone(),
            freq5: self.freq5.clone(),
            freq6: self.freq6.clone(),
            freq7: self.freq7.clone(),
            freq8: self.freq8.clone(),
            freq9: self.freq9.clone(),
        }
    }
}

/// `[modes.<name>]` file shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ModeFile {
    modes: BTreeMap<String, ChannelSection>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("can't read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("can't parse {}: {e}", path.display())))?;
        if config.global.input.is_none() {
            return Err(Error::Config("input not specified in [global]".into()));
        }
        if config.global.samprate == 0 {
            return Err(Error::Config("samprate not specified in [global]".into()));
        }
        Ok(config)
    }

    /// Mode preset table: built-ins overlaid with the optional mode file.
    pub fn modes(&self) -> Result<BTreeMap<String, ChannelSection>> {
        let mut modes = builtin_modes();
        if let Some(path) = &self.global.mode_file {
            let path = expanduser(path.clone());
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("can't read {}: {e}", path.display())))?;
            let extra: ModeFile = toml::from_str(&text)
                .map_err(|e| Error::Config(format!("can't parse {}: {e}", path.display())))?;
            modes.extend(extra.modes);
        }
        Ok(modes)
    }
}

/// Parse a frequency token, accepting `k`, `M` and `G` suffixes.
pub fn parse_frequency(s: &str) -> Option<f64> {
    let s = s.trim();
    let (digits, scale) = if let Some(stripped) = s.strip_suffix(['G', 'g']) {
        (stripped, 1e9)
    } else if let Some(stripped) = s.strip_suffix(['M', 'm']) {
        (stripped, 1e6)
    } else if let Some(stripped) = s.strip_suffix(['k', 'K']) {
        (stripped, 1e3)
    } else {
        (s, 1.0)
    };
    let value: f64 = digits.trim().parse().ok()?;
    (value >= 0.0).then_some(value * scale)
}

fn expanduser(path: PathBuf) -> PathBuf {
    if let Some(stripped) = path.to_str().and_then(|p| p.strip_prefix('~')) {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped.trim_start_matches('/'));
        }
    }
    path
}

/// Built-in analog mode presets.
fn builtin_modes() -> BTreeMap<String, ChannelSection> {
    let mut modes = BTreeMap::new();
    let base = ChannelSection {
        samprate: Some(24_000),
        kaiser_beta: Some(11.0),
        agc: Some(true),
        channels: Some(1),
        ..ChannelSection::default()
    };
    modes.insert(
        "usb".into(),
        ChannelSection {
            low: Some(100.0),
            high: Some(3000.0),
            ..base.clone()
        },
    );
    modes.insert(
        "lsb".into(),
        ChannelSection {
            low: Some(-3000.0),
            high: Some(-100.0),
            ..base.clone()
        },
    );
    modes.insert(
        "cwu".into(),
        ChannelSection {
            low: Some(300.0),
            high: Some(700.0),
            shift: Some(500.0),
            ..base.clone()
        },
    );
    modes.insert(
        "cwl".into(),
        ChannelSection {
            low: Some(-700.0),
            high: Some(-300.0),
            shift: Some(-500.0),
            ..base.clone()
        },
    );
    modes.insert(
        "am".into(),
        ChannelSection {
            low: Some(-5000.0),
            high: Some(5000.0),
            envelope: Some(true),
            ..base.clone()
        },
    );
    // synchronous AM: carrier recovery, product detection
    modes.insert(
        "ame".into(),
        ChannelSection {
            low: Some(-5000.0),
            high: Some(5000.0),
            pll: Some(true),
            ..base.clone()
        },
    );
    modes.insert(
        "iq".into(),
        ChannelSection {
            low: Some(-5000.0),
            high: Some(5000.0),
            channels: Some(2),
            agc: Some(false),
            gain: Some(0.0),
            ..base
        },
    );
    modes
}

/// Turn one resolved section plus a frequency into an engine channel
/// configuration, applying the dB and per-sample conversions.
pub fn build_channel_config(
    name: &str,
    section: &ChannelSection,
    modes: &BTreeMap<String, ChannelSection>,
    global: &GlobalConfig,
    freq: f64,
) -> Result<ChannelConfig> {
    let resolved = match &section.mode {
        Some(mode) => {
            let preset = modes
                .get(mode)
                .ok_or_else(|| Error::Config(format!("channel '{name}': unknown mode '{mode}'")))?;
            section.resolved(preset)
        }
        None => section.clone(),
    };

    let samprate = resolved.samprate.unwrap_or(24_000);
    let mut low = resolved.low.unwrap_or(-5000.0);
    let mut high = resolved.high.unwrap_or(5000.0);
    if low > high {
        tracing::warn!(channel = name, "swapping passband edges");
        std::mem::swap(&mut low, &mut high);
    }

    let mut squelch_open = resolved.squelch_open.unwrap_or(8.0);
    let mut squelch_close = resolved.squelch_close.unwrap_or(7.0);
    if squelch_close > squelch_open {
        tracing::warn!(channel = name, "setting squelch-close = squelch-open");
        squelch_close = squelch_open;
    }

    let channels = match (resolved.stereo, resolved.mono) {
        (Some(true), _) => 2,
        (_, Some(true)) => 1,
        _ => resolved.channels.unwrap_or(1),
    };

    // dB/s to voltage ratio per output sample
    let recovery_db_per_sec = resolved.recovery_rate.unwrap_or(20.0).abs();
    let recovery_rate = db2voltage(recovery_db_per_sec / samprate as f32);
    // seconds to blocks
    let hangtime = (resolved.hang_time.unwrap_or(1.1).abs() * 1000.0 / global.blocktime)
        .round() as u32;

    Ok(ChannelConfig {
        name: name.to_string(),
        tune: TuneConfig {
            freq,
            shift: resolved.shift.unwrap_or(0.0),
            doppler: 0.0,
            doppler_rate: 0.0,
        },
        filter: FilterConfig {
            min_if: low,
            max_if: high,
            kaiser_beta: resolved.kaiser_beta.unwrap_or(11.0),
            conjugate: resolved.conj.unwrap_or(false),
        },
        output: OutputConfig {
            samprate,
            channels,
            headroom: db2voltage(-resolved.headroom.unwrap_or(15.0).abs()),
            gain: db2voltage(resolved.gain.unwrap_or(50.0)),
            ssrc: resolved.ssrc.unwrap_or(0),
        },
        linear: LinearConfig {
            agc: resolved.agc.unwrap_or(true),
            pll: resolved.pll.unwrap_or(false),
            square: resolved.square.unwrap_or(false),
            envelope: resolved.envelope.unwrap_or(false),
            threshold: db2voltage(-resolved.threshold.unwrap_or(15.0).abs()),
            recovery_rate,
            hangtime,
            loop_bw: resolved.pll_bw.unwrap_or(100.0),
            damping: std::f64::consts::FRAC_1_SQRT_2 as f32,
            lock_time: resolved.lock_time.unwrap_or(0.05),
            squelch_open: db2power(squelch_open),
            squelch_close: db2power(squelch_close),
        },
    })
}
