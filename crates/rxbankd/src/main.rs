//! Multichannel SDR demodulation daemon.
//!
//! Reads a TOML configuration naming a sample input (UDP endpoint or I/Q
//! file), derives any number of receiver channels from the shared forward
//! transform, and emits one RTP PCM stream per channel. A TLV status
//! socket reports per-channel state and accepts retune/parameter
//! commands; a channel section listing frequency 0 becomes the template
//! for channels created on demand over that socket.
//!
//! # Usage
//!
//! ```bash
//! rxbankd radio.toml
//! rxbankd -vv radio.toml       # debug logging
//! ```

mod config;

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::{info, warn};

use rxbank::channel::ssrc_from_freq;
use rxbank::emit::{PcmSink, RtpPcmSink};
use rxbank::engine::Engine;
use rxbank::frontend::FrontEnd;
use rxbank::ingest::{ReaderSource, SampleSource, UdpSource};
use rxbank::{Error, Result, SampleFormat};

use config::{build_channel_config, parse_frequency, Config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multichannel SDR demodulation daemon", long_about = None)]
struct Args {
    /// Configuration file
    config: PathBuf,

    /// Verbosity level (-v=info, -vv=debug, -vvv=trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(e) = run(&args) {
        println!("{e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    println!("Loading config file {}...", args.config.display());
    let config = Config::load(&args.config)?;
    let global = config.global.clone();

    let frontend = FrontEnd::new(
        global.samprate,
        global.center,
        global.real,
        global.blocktime,
        global.overlap,
    )?;
    info!(
        samprate = frontend.samprate(),
        real = frontend.real_input(),
        block_ms = frontend.blocktime_ms(),
        l = frontend.block_len(),
        m = frontend.response_len(),
        n = frontend.fft_len(),
        "front end configured"
    );

    let format = SampleFormat::from_str(&global.format).map_err(Error::Config)?;
    let input_spec = global.input.clone().expect("validated by Config::load");
    let stall = frontend.block_duration() * global.stall_blocks.max(1);
    let source: Box<dyn SampleSource> = match input_spec.to_socket_addrs() {
        Ok(mut addrs) => {
            let addr = addrs.next().ok_or_else(|| {
                Error::Config(format!("input '{input_spec}' resolves to nothing"))
            })?;
            let socket = UdpSocket::bind(addr)?;
            info!(%addr, "listening for front end samples");
            Box::new(UdpSource::new(socket, format, stall)?)
        }
        Err(_) => {
            info!(file = %input_spec, "reading samples from file");
            Box::new(ReaderSource::from_file(&input_spec, format)?)
        }
    };

    let mut engine = Engine::new(frontend);
    let modes = config.modes()?;
    let mut started = 0usize;

    for (name, section) in &config.channels {
        if section.disable {
            continue;
        }
        println!("Processing [channels.{name}]");
        let data_dest = match section.data.clone().or_else(|| global.data.clone()) {
            Some(d) => d,
            None => {
                println!("channel '{name}': 'data' missing and not set in [global]");
                continue;
            }
        };

        let tokens = section.frequency_tokens();
        if tokens.is_empty() {
            println!("channel '{name}': no frequencies listed");
            continue;
        }
        let mut nfreq = 0usize;
        for token in &tokens {
            let Some(freq) = parse_frequency(token) else {
                println!("channel '{name}': can't parse frequency '{token}'");
                continue;
            };
            let cfg = match build_channel_config(name, section, &modes, &global, freq) {
                Ok(cfg) => cfg,
                Err(e) => {
                    println!("channel '{name}': {e}");
                    break;
                }
            };

            if freq == 0.0 {
                // template for dynamically created channels
                let dest = data_dest.clone();
                engine.set_prototype(
                    cfg,
                    Box::new(move |c| {
                        let sink = rtp_sink(&dest, c.output.ssrc, c.output.channels)?;
                        Ok(sink)
                    }),
                );
                println!("dynamic channel template '{name}' installed");
                continue;
            }

            let ssrc = if cfg.output.ssrc != 0 {
                cfg.output.ssrc
            } else {
                ssrc_from_freq(freq)
            };
            let sink = match rtp_sink(&data_dest, ssrc, cfg.output.channels) {
                Ok(s) => s,
                Err(e) => {
                    println!("channel '{name}': can't set up PCM output to {data_dest}: {e}");
                    continue;
                }
            };
            match engine.start_channel(cfg, sink) {
                Ok(ssrc) => {
                    nfreq += 1;
                    started += 1;
                    info!(channel = name.as_str(), ssrc, freq, "started");
                }
                Err(e) => println!("channel '{name}': {e}"),
            }
        }
        println!("{nfreq} demodulators started from [channels.{name}]");
    }
    println!("{started} total demodulators started");

    if let Some(status_spec) = &global.status {
        match resolve(status_spec) {
            Ok(dest) => {
                let socket = UdpSocket::bind(if dest.is_ipv4() {
                    "0.0.0.0:0"
                } else {
                    "[::]:0"
                })?;
                engine.start_status(
                    socket,
                    dest,
                    Duration::from_millis(global.status_interval_ms.max(100)),
                );
                info!(%dest, "status reporter started");
            }
            Err(e) => warn!(error = %e, "status destination unusable"),
        }
    }

    engine.start_input(source);

    // stay alive until the pipeline winds down (end of file, fatal error)
    while !engine.stage().is_stopped() {
        std::thread::sleep(Duration::from_millis(200));
        engine.reap();
    }
    engine.shutdown();
    Ok(())
}

fn resolve(spec: &str) -> Result<SocketAddr> {
    spec.to_socket_addrs()
        .map_err(|e| Error::Config(format!("can't resolve '{spec}': {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("'{spec}' resolves to nothing")))
}

fn rtp_sink(dest: &str, ssrc: u32, channels: usize) -> Result<Box<dyn PcmSink>> {
    let addr = resolve(dest)?;
    Ok(Box::new(RtpPcmSink::new(addr, ssrc, channels)?))
}
