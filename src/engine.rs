//! The engine: one context object owning the whole pipeline.
//!
//! Threads, one per long-lived role: the ingester reads front-end samples
//! and clocks blocks into the forward thread; the forward thread runs the
//! shared FFT and publishes; each channel runs its filter, demodulator and
//! sink on its own thread; an optional status thread reports TLV snapshots
//! and accepts TLV commands. Nothing here is a process-wide global; the
//! only singleton in the crate is the FFT planner.
//!
//! Channel shutdown is cooperative: a stop flag checked at block
//! boundaries, then the leg detaches and the thread is reaped.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel;
use num_complex::Complex;
use tracing::{debug, error, info, warn};

use crate::channel::{
    ChannelConfig, ChannelStatus, ChannelUpdate, StatusHandle, UpdateQueue,
};
use crate::demod::LinearDemod;
use crate::emit::PcmSink;
use crate::error::{Error, Result};
use crate::filter::{ChannelFilter, ForwardDriver, ForwardStage, LegBlock};
use crate::frontend::FrontEnd;
use crate::ingest::SampleSource;
use crate::status::{self, StatusType, PKT_COMMAND, PKT_STATUS};

/// A running channel, owned by the engine's channel list.
pub struct ChannelHandle {
    pub name: String,
    pub ssrc: u32,
    queue: Arc<UpdateQueue>,
    stop: Arc<AtomicBool>,
    status: StatusHandle,
    join: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    /// Queue a parameter update; applied at the next block boundary.
    pub fn update(&self, update: ChannelUpdate) {
        self.queue.push(update);
    }

    /// Ask the demodulator to exit at its next block boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Copy of the latest status snapshot.
    pub fn status(&self) -> ChannelStatus {
        self.status.lock().unwrap().clone()
    }

    fn finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }
}

/// Builds a PCM sink for a dynamically created channel.
pub type SinkFactory = Box<dyn Fn(&ChannelConfig) -> Result<Box<dyn PcmSink>> + Send>;

/// The dynamic-creation template: an immutable configuration record plus
/// the factory that makes its output sinks.
struct Prototype {
    cfg: ChannelConfig,
    make_sink: SinkFactory,
}

/// Engine context threaded through every component.
pub struct Engine {
    stage: Arc<ForwardStage>,
    channels: Arc<Mutex<Vec<ChannelHandle>>>,
    prototype: Arc<Mutex<Option<Prototype>>>,
    ingest_join: Option<JoinHandle<()>>,
    forward_join: Option<JoinHandle<()>>,
    status_join: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(frontend: FrontEnd) -> Self {
        Self {
            stage: ForwardStage::new(frontend),
            channels: Arc::new(Mutex::new(Vec::new())),
            prototype: Arc::new(Mutex::new(None)),
            ingest_join: None,
            forward_join: None,
            status_join: None,
        }
    }

    pub fn frontend(&self) -> FrontEnd {
        self.stage.frontend().clone()
    }

    pub fn stage(&self) -> &Arc<ForwardStage> {
        &self.stage
    }

    /// Spawn the ingest and forward threads over `source`.
    ///
    /// The ingester clocks one block every `L` samples; stalls are logged
    /// and retried after a resync, end of stream stops the pipeline.
    pub fn start_input(&mut self, mut source: Box<dyn SampleSource>) {
        let fe = self.frontend();
        let stage = Arc::clone(&self.stage);
        let (tx, rx) = channel::bounded::<Vec<Complex<f32>>>(1);

        let ingest_stage = Arc::clone(&stage);
        self.ingest_join = Some(
            std::thread::Builder::new()
                .name("ingest".into())
                .spawn(move || {
                    let l = fe.block_len();
                    let mut buf = Vec::with_capacity(l);
                    loop {
                        if ingest_stage.is_stopped() {
                            break;
                        }
                        match source.read_block(&mut buf, l) {
                            Ok(()) => {
                                if tx.send(std::mem::take(&mut buf)).is_err() {
                                    break;
                                }
                                buf = Vec::with_capacity(l);
                            }
                            Err(Error::FrontEndStalled(t)) => {
                                warn!(timeout = ?t, "front end stalled");
                                let dropped = source.resync();
                                if dropped > 0 {
                                    info!(dropped, "front end resynchronized");
                                }
                            }
                            Err(Error::EndOfStream) => {
                                info!("sample stream ended");
                                break;
                            }
                            Err(e) => {
                                error!(error = %e, "ingest failed");
                                break;
                            }
                        }
                    }
                    ingest_stage.stop();
                })
                .expect("spawn ingest thread"),
        );

        self.forward_join = Some(
            std::thread::Builder::new()
                .name("forward".into())
                .spawn(move || {
                    let mut driver = ForwardDriver::new(Arc::clone(&stage));
                    while let Ok(block) = rx.recv() {
                        match driver.push_block(&block) {
                            Ok(Some(index)) => {
                                debug!(index, "block published");
                            }
                            Ok(None) => break,
                            Err(e) => {
                                // forward-stage errors stop the pipeline
                                error!(error = %e, "forward transform failed");
                                stage.stop();
                                break;
                            }
                        }
                    }
                })
                .expect("spawn forward thread"),
        );
    }

    /// Create and start a channel. The configuration is validated and
    /// normalized; a channel that cannot build its filter never starts,
    /// and other channels are unaffected.
    pub fn start_channel(&self, cfg: ChannelConfig, sink: Box<dyn PcmSink>) -> Result<u32> {
        spawn_channel(&self.stage, &self.channels, cfg, sink)
    }

    /// Install the dynamic-demod template. A command addressed to an
    /// unknown SSRC with a frequency item clones the template into a live
    /// channel, with a sink built by `make_sink`.
    pub fn set_prototype(&self, cfg: ChannelConfig, make_sink: SinkFactory) {
        info!(name = %cfg.name, "dynamic channel template installed");
        *self.prototype.lock().unwrap() = Some(Prototype { cfg, make_sink });
    }

    /// Queue an update for the channel with this SSRC.
    pub fn update_channel(&self, ssrc: u32, update: ChannelUpdate) -> bool {
        let channels = self.channels.lock().unwrap();
        match channels.iter().find(|c| c.ssrc == ssrc) {
            Some(c) => {
                c.update(update);
                true
            }
            None => false,
        }
    }

    /// Request a cooperative stop of one channel.
    pub fn stop_channel(&self, ssrc: u32) -> bool {
        let channels = self.channels.lock().unwrap();
        match channels.iter().find(|c| c.ssrc == ssrc) {
            Some(c) => {
                c.request_stop();
                true
            }
            None => false,
        }
    }

    /// Snapshot every channel's status.
    pub fn channel_statuses(&self) -> Vec<ChannelStatus> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.status())
            .collect()
    }

    /// Join and drop channels whose threads have exited.
    pub fn reap(&self) -> usize {
        let mut channels = self.channels.lock().unwrap();
        let before = channels.len();
        channels.retain_mut(|c| {
            if c.finished() {
                if let Some(join) = c.join.take() {
                    let _ = join.join();
                }
                debug!(ssrc = c.ssrc, "channel reaped");
                false
            } else {
                true
            }
        });
        before - channels.len()
    }

    /// Decode a TLV command packet and queue the resulting updates to the
    /// addressed channel (SSRC 0 broadcasts to every channel). An unknown
    /// SSRC with a frequency item instantiates the dynamic template.
    pub fn dispatch_command(&self, packet: &[u8]) {
        route_command(&self.stage, &self.channels, &self.prototype, packet);
    }

    /// Spawn the status thread: periodic TLV reports for every channel on
    /// `socket` towards `dest`, incoming command packets decoded and
    /// dispatched, finished channels reaped along the way.
    pub fn start_status(&mut self, socket: UdpSocket, dest: SocketAddr, interval: Duration) {
        let stage = Arc::clone(&self.stage);
        let channels = Arc::clone(&self.channels);
        let prototype = Arc::clone(&self.prototype);
        let _ = socket.set_read_timeout(Some(interval.min(Duration::from_millis(100))));
        self.status_join = Some(
            std::thread::Builder::new()
                .name("status".into())
                .spawn(move || {
                    let mut buf = [0u8; 8192];
                    let mut last_report: Option<Instant> = None;
                    loop {
                        if stage.is_stopped() {
                            break;
                        }
                        let mut report_now = false;
                        match socket.recv_from(&mut buf) {
                            Ok((n, _from)) if n > 0 && buf[0] == PKT_COMMAND => {
                                route_command(&stage, &channels, &prototype, &buf[..n]);
                                // a poll (or any command) gets a fresh report
                                report_now = true;
                            }
                            Ok(_) => {}
                            Err(e)
                                if e.kind() == std::io::ErrorKind::WouldBlock
                                    || e.kind() == std::io::ErrorKind::TimedOut => {}
                            Err(e) => {
                                warn!(error = %e, "status socket receive failed");
                            }
                        }
                        if report_now || last_report.map_or(true, |t| t.elapsed() >= interval) {
                            last_report = Some(Instant::now());
                            let snapshots: Vec<ChannelStatus> = {
                                let mut held = channels.lock().unwrap();
                                held.retain_mut(|c| {
                                    if c.finished() {
                                        if let Some(join) = c.join.take() {
                                            let _ = join.join();
                                        }
                                        false
                                    } else {
                                        true
                                    }
                                });
                                held.iter().map(|c| c.status()).collect()
                            };
                            for snapshot in &snapshots {
                                let pkt = encode_status(snapshot);
                                if let Err(e) = socket.send_to(&pkt, dest) {
                                    warn!(error = %e, "status send failed");
                                    break;
                                }
                            }
                        }
                    }
                })
                .expect("spawn status thread"),
        );
    }

    /// Stop everything: ingestion, the forward barrier, all channels, the
    /// status thread; joins all of them.
    pub fn shutdown(&mut self) {
        self.stage.stop();
        {
            let channels = self.channels.lock().unwrap();
            for c in channels.iter() {
                c.request_stop();
            }
        }
        if let Some(j) = self.ingest_join.take() {
            let _ = j.join();
        }
        if let Some(j) = self.forward_join.take() {
            let _ = j.join();
        }
        if let Some(j) = self.status_join.take() {
            let _ = j.join();
        }
        let mut channels = self.channels.lock().unwrap();
        for c in channels.iter_mut() {
            if let Some(join) = c.join.take() {
                let _ = join.join();
            }
        }
        channels.clear();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One channel's demodulation loop. Runs until the stop flag is set, the
/// stage stops, or the demodulator hits a fatal invariant.
fn channel_worker(
    cfg: ChannelConfig,
    stage: Arc<ForwardStage>,
    queue: Arc<UpdateQueue>,
    stop: Arc<AtomicBool>,
    status: StatusHandle,
    mut sink: Box<dyn PcmSink>,
) {
    let mut tune = cfg.tune;
    let mut filt_cfg = cfg.filter;
    let mut filter = match ChannelFilter::new(
        &stage,
        cfg.output.samprate,
        tune.freq + tune.doppler,
        filt_cfg.min_if,
        filt_cfg.max_if,
        filt_cfg.kaiser_beta,
    ) {
        Ok(f) => f,
        Err(e) => {
            warn!(channel = %cfg.name, error = %e, "channel refused to start");
            return;
        }
    };
    let mut demod = LinearDemod::new(&cfg);
    let block_secs = stage.frontend().blocktime_ms() as f64 / 1000.0;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        // apply queued parameter updates before touching the next block;
        // coalesce so one drain rebuilds the mask at most once
        let mut retune = false;
        let mut remask = false;
        for update in queue.drain() {
            match update {
                ChannelUpdate::Frequency(f) => {
                    tune.freq = f;
                    retune = true;
                }
                ChannelUpdate::Shift(s) => {
                    tune.shift = s;
                    demod.set_shift(s);
                }
                ChannelUpdate::Doppler { offset, rate } => {
                    tune.doppler = offset;
                    tune.doppler_rate = rate;
                    retune = true;
                }
                ChannelUpdate::FilterLow(low) => {
                    filt_cfg.min_if = low;
                    remask = true;
                }
                ChannelUpdate::FilterHigh(high) => {
                    filt_cfg.max_if = high;
                    remask = true;
                }
                ChannelUpdate::KaiserBeta(beta) => {
                    filt_cfg.kaiser_beta = beta;
                    remask = true;
                }
                ChannelUpdate::Gain(g) => demod.set_gain(g),
                ChannelUpdate::Headroom(h) => demod.set_headroom(h),
                ChannelUpdate::PllBandwidth(bw) => demod.set_pll_bandwidth(bw),
                ChannelUpdate::PllEnable(on) => demod.set_pll_enable(on),
                ChannelUpdate::AgcEnable(on) => demod.set_agc_enable(on),
            }
        }
        if remask {
            if filt_cfg.min_if > filt_cfg.max_if {
                std::mem::swap(&mut filt_cfg.min_if, &mut filt_cfg.max_if);
            }
            filter.set_passband(filt_cfg.min_if, filt_cfg.max_if, filt_cfg.kaiser_beta);
            demod.set_bandwidth(filt_cfg.max_if - filt_cfg.min_if);
        }
        if tune.doppler_rate != 0.0 {
            tune.doppler += tune.doppler_rate * block_secs;
            retune = true;
        }
        if retune {
            filter.retune(tune.freq + tune.doppler);
            status.lock().unwrap().freq = tune.freq;
        }

        let mut baseband = match filter.wait_block() {
            None => break,
            Some(LegBlock::Ready(fb)) => {
                let bb = filter.process(&fb);
                // consumption of the shared block ends here
                filter.ack(fb.index);
                bb
            }
            Some(LegBlock::Missed(index)) => filter.zero_block(index),
        };

        let tuned = tune.freq != 0.0;
        match demod.process(&mut baseband, tuned) {
            Ok((pcm, stats)) => {
                // send failures are logged by the sink; keep producing and
                // retry on the next block
                let _ = sink.send(&pcm);
                let mut st = status.lock().unwrap();
                st.snr = stats.snr;
                st.foffset = stats.foffset;
                st.gain = stats.gain;
                st.pll_lock = stats.pll_lock;
                st.rotations = stats.rotations;
                st.output_power = stats.output_power;
                st.bb_power = baseband.bb_power;
                st.n0 = baseband.n0;
                st.blocks = baseband.index;
            }
            Err(e) => {
                // fatal within the channel, terminates this channel only
                error!(channel = %cfg.name, error = %e, "demodulator failed");
                break;
            }
        }
    }
    debug!(channel = %cfg.name, "demodulator exited");
}

/// Validate, normalize and launch one channel worker.
fn spawn_channel(
    stage: &Arc<ForwardStage>,
    channels: &Arc<Mutex<Vec<ChannelHandle>>>,
    cfg: ChannelConfig,
    sink: Box<dyn PcmSink>,
) -> Result<u32> {
    let cfg = cfg.normalized();
    cfg.validate()?;
    // fail fast on rate mismatches before spawning anything
    stage.frontend().decimation(cfg.output.samprate)?;

    let ssrc = cfg.output.ssrc;
    let name = cfg.name.clone();
    let queue = Arc::new(UpdateQueue::new());
    let stop = Arc::new(AtomicBool::new(false));
    let status: StatusHandle = Arc::new(Mutex::new(ChannelStatus {
        ssrc,
        freq: cfg.tune.freq,
        ..ChannelStatus::default()
    }));

    let join = std::thread::Builder::new()
        .name(format!("lin {ssrc}"))
        .spawn({
            let stage = Arc::clone(stage);
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            let status = Arc::clone(&status);
            move || channel_worker(cfg, stage, queue, stop, status, sink)
        })
        .expect("spawn channel thread");

    info!(ssrc, "channel started");
    channels.lock().unwrap().push(ChannelHandle {
        name,
        ssrc,
        queue,
        stop,
        status,
        join: Some(join),
    });
    Ok(ssrc)
}

/// Queue the updates of one TLV command packet to the addressed channels
/// (SSRC 0 broadcasts). A command for an SSRC nobody owns, carrying a
/// frequency, clones the dynamic template into a new channel.
fn route_command(
    stage: &Arc<ForwardStage>,
    channels: &Arc<Mutex<Vec<ChannelHandle>>>,
    prototype: &Mutex<Option<Prototype>>,
    packet: &[u8],
) {
    if packet.first() != Some(&PKT_COMMAND) {
        return;
    }
    let ssrc = status::ssrc_of(packet);
    let updates = decode_updates(&packet[1..]);
    let mut matched = ssrc == 0;
    {
        let held = channels.lock().unwrap();
        for c in held.iter() {
            if ssrc == 0 || c.ssrc == ssrc {
                matched = true;
                for &u in &updates {
                    c.update(u);
                }
            }
        }
    }
    if matched {
        return;
    }
    // unknown SSRC: try the dynamic template
    let freq = updates.iter().find_map(|u| match u {
        ChannelUpdate::Frequency(f) => Some(*f),
        _ => None,
    });
    let Some(freq) = freq else {
        return;
    };
    let held = prototype.lock().unwrap();
    let Some(proto) = held.as_ref() else {
        return;
    };
    let cfg = proto.cfg.instantiate(&format!("dyn-{ssrc}"), freq, ssrc);
    match (proto.make_sink)(&cfg) {
        Ok(sink) => {
            if let Err(e) = spawn_channel(stage, channels, cfg, sink) {
                warn!(ssrc, error = %e, "dynamic channel failed to start");
            }
        }
        Err(e) => warn!(ssrc, error = %e, "dynamic channel sink failed"),
    }
}

/// Translate settable TLV items into channel updates.
fn decode_updates(body: &[u8]) -> Vec<ChannelUpdate> {
    let mut updates = Vec::new();
    for (ty, value) in status::Items::new(body) {
        let Some(ty) = StatusType::from_byte(ty) else {
            continue;
        };
        match ty {
            StatusType::RadioFrequency => {
                updates.push(ChannelUpdate::Frequency(status::decode_double(value)))
            }
            StatusType::ShiftFrequency => {
                updates.push(ChannelUpdate::Shift(status::decode_float(value)))
            }
            StatusType::FilterLow => {
                updates.push(ChannelUpdate::FilterLow(status::decode_float(value)))
            }
            StatusType::FilterHigh => {
                updates.push(ChannelUpdate::FilterHigh(status::decode_float(value)))
            }
            StatusType::KaiserBeta => {
                updates.push(ChannelUpdate::KaiserBeta(status::decode_float(value)))
            }
            StatusType::Gain => updates.push(ChannelUpdate::Gain(status::decode_float(value))),
            StatusType::Headroom => {
                updates.push(ChannelUpdate::Headroom(status::decode_float(value)))
            }
            StatusType::PllBandwidth => {
                updates.push(ChannelUpdate::PllBandwidth(status::decode_float(value)))
            }
            StatusType::PllEnable => {
                updates.push(ChannelUpdate::PllEnable(status::decode_int(value) != 0))
            }
            StatusType::AgcEnable => {
                updates.push(ChannelUpdate::AgcEnable(status::decode_int(value) != 0))
            }
            _ => {}
        }
    }
    updates
}

/// Encode one channel's status snapshot as a TLV report packet.
fn encode_status(st: &ChannelStatus) -> Vec<u8> {
    let mut pkt = vec![PKT_STATUS];
    status::encode_int(&mut pkt, StatusType::OutputSsrc, st.ssrc as u64);
    status::encode_double(&mut pkt, StatusType::RadioFrequency, st.freq);
    status::encode_float(&mut pkt, StatusType::SignalNoiseRatio, st.snr);
    status::encode_float(&mut pkt, StatusType::FrequencyOffset, st.foffset);
    status::encode_float(&mut pkt, StatusType::Gain, st.gain);
    status::encode_int(&mut pkt, StatusType::PllLock, st.pll_lock as u64);
    status::encode_int(&mut pkt, StatusType::PllRotations, st.rotations as u64);
    status::encode_float(&mut pkt, StatusType::OutputPower, st.output_power);
    status::encode_float(&mut pkt, StatusType::BasebandPower, st.bb_power);
    status::encode_float(&mut pkt, StatusType::NoiseDensity, st.n0);
    status::encode_int(&mut pkt, StatusType::BlockCount, st.blocks);
    status::encode_eol(&mut pkt);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FilterConfig, LinearConfig, OutputConfig, TuneConfig};
    use crate::emit::PcmBlock;
    use crate::ingest::ReaderSource;
    use crate::SampleFormat;
    use std::io::Cursor;

    struct CollectSink(Arc<Mutex<Vec<f32>>>);

    impl PcmSink for CollectSink {
        fn send(&mut self, block: &PcmBlock) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(&block.samples);
            Ok(())
        }
    }

    fn frontend() -> FrontEnd {
        // L=480, M=121, N=600 at 48 ksps
        FrontEnd::new(48_000, 0.0, false, 10.0, 5).unwrap()
    }

    fn dc_channel_config() -> ChannelConfig {
        ChannelConfig {
            name: "dc".into(),
            tune: TuneConfig {
                freq: 1.0, // off-zero so the mute path stays open; bin 0 anyway
                shift: 0.0,
                doppler: 0.0,
                doppler_rate: 0.0,
            },
            filter: FilterConfig {
                min_if: -3000.0,
                max_if: 3000.0,
                kaiser_beta: 11.0,
                conjugate: false,
            },
            output: OutputConfig {
                samprate: 8_000,
                channels: 1,
                headroom: 1.0,
                gain: 1.0,
                ssrc: 99,
            },
            linear: LinearConfig {
                agc: false,
                pll: false,
                square: false,
                envelope: false,
                threshold: 0.178,
                recovery_rate: 1.0001,
                hangtime: 10,
                loop_bw: 100.0,
                damping: 0.707,
                lock_time: 0.05,
                squelch_open: 6.3,
                squelch_close: 5.0,
            },
        }
    }

    fn dc_stream(blocks: usize, block_len: usize) -> Box<dyn SampleSource> {
        let mut bytes = Vec::with_capacity(blocks * block_len * 8);
        for _ in 0..blocks * block_len {
            bytes.extend_from_slice(&1.0f32.to_le_bytes());
            bytes.extend_from_slice(&0.0f32.to_le_bytes());
        }
        Box::new(ReaderSource::new(Cursor::new(bytes), SampleFormat::Cf32))
    }

    #[test]
    fn test_end_to_end_dc_continuity() {
        let fe = frontend();
        let mut engine = Engine::new(fe.clone());
        let collected = Arc::new(Mutex::new(Vec::new()));
        engine
            .start_channel(dc_channel_config(), Box::new(CollectSink(collected.clone())))
            .unwrap();
        engine.start_input(dc_stream(12, fe.block_len()));

        // the stream is finite; ingest stops the stage at EOF
        engine.shutdown();

        let samples = collected.lock().unwrap();
        // whole blocks of 80 output samples; the trailing block can race
        // the end-of-stream stop
        assert_eq!(samples.len() % 80, 0);
        assert!(samples.len() >= 9 * 80, "got {} samples", samples.len());
        // skip the filter settling (first two blocks), then flat 1.0
        for &s in &samples[160..] {
            assert!((s - 1.0).abs() < 0.02, "sample {s} drifted");
        }
    }

    #[test]
    fn test_channel_rejects_bad_rate_without_starting() {
        let engine = Engine::new(frontend());
        let mut cfg = dc_channel_config();
        cfg.output.samprate = 44_100;
        let err = engine.start_channel(cfg, Box::new(crate::emit::NullSink));
        assert!(matches!(err, Err(Error::SampleRateMismatch { .. })));
        assert_eq!(engine.channel_statuses().len(), 0);
    }

    #[test]
    fn test_stop_and_reap_channel() {
        let fe = frontend();
        let mut engine = Engine::new(fe.clone());
        let ssrc = engine
            .start_channel(dc_channel_config(), Box::new(crate::emit::NullSink))
            .unwrap();
        engine.start_input(dc_stream(200, fe.block_len()));

        assert!(engine.stop_channel(ssrc));
        // cooperative exit happens at a block boundary
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.channel_statuses().len() == 1 && Instant::now() < deadline {
            engine.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.channel_statuses().len(), 0);
        engine.shutdown();
    }

    #[test]
    fn test_update_routing_by_ssrc() {
        let engine = Engine::new(frontend());
        assert!(!engine.update_channel(123, ChannelUpdate::Gain(2.0)));
    }

    #[test]
    fn test_status_packet_round_trip() {
        let st = ChannelStatus {
            ssrc: 14_074_000,
            freq: 14_074_000.0,
            snr: 12.5,
            foffset: -3.25,
            gain: 2.0,
            pll_lock: true,
            rotations: 17,
            bb_power: 0.5,
            n0: 1e-9,
            output_power: 0.25,
            blocks: 1000,
        };
        let pkt = encode_status(&st);
        assert_eq!(pkt[0], PKT_STATUS);
        assert_eq!(status::ssrc_of(&pkt), 14_074_000);
        let mut seen_freq = None;
        let mut seen_lock = None;
        for (ty, value) in status::Items::new(&pkt[1..]) {
            match StatusType::from_byte(ty) {
                Some(StatusType::RadioFrequency) => {
                    seen_freq = Some(status::decode_double(value))
                }
                Some(StatusType::PllLock) => seen_lock = Some(status::decode_int(value) != 0),
                _ => {}
            }
        }
        assert_eq!(seen_freq, Some(14_074_000.0));
        assert_eq!(seen_lock, Some(true));
    }

    #[test]
    fn test_dynamic_template_instantiation() {
        let engine = Engine::new(frontend());
        let mut proto = dc_channel_config();
        proto.name = "template".into();
        proto.tune.freq = 0.0;
        proto.output.ssrc = 0;
        engine.set_prototype(
            proto,
            Box::new(|_cfg| Ok(Box::new(crate::emit::NullSink) as Box<dyn PcmSink>)),
        );

        let mut pkt = vec![PKT_COMMAND];
        status::encode_int(&mut pkt, StatusType::OutputSsrc, 5_000);
        status::encode_double(&mut pkt, StatusType::RadioFrequency, 5_000.0);
        status::encode_eol(&mut pkt);
        engine.dispatch_command(&pkt);

        let statuses = engine.channel_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].ssrc, 5_000);
        assert_eq!(statuses[0].freq, 5_000.0);

        // same command again only updates, it does not duplicate
        engine.dispatch_command(&pkt);
        assert_eq!(engine.channel_statuses().len(), 1);
    }

    #[test]
    fn test_decode_updates_from_command() {
        let mut body = Vec::new();
        status::encode_double(&mut body, StatusType::RadioFrequency, 7_074_000.0);
        status::encode_float(&mut body, StatusType::FilterLow, -2400.0);
        status::encode_int(&mut body, StatusType::AgcEnable, 1);
        status::encode_eol(&mut body);
        let updates = decode_updates(&body);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0], ChannelUpdate::Frequency(7_074_000.0));
        assert_eq!(updates[1], ChannelUpdate::FilterLow(-2400.0));
        assert_eq!(updates[2], ChannelUpdate::AgcEnable(true));
    }
}
