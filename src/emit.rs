//! Channel audio output.
//!
//! The demodulator hands one [`PcmBlock`] per block to a [`PcmSink`]. The
//! engine itself does not care what the sink does; the bundled
//! [`RtpPcmSink`] packetizes 16-bit big-endian PCM behind a minimal RTP
//! header and sends it over UDP, which is what the daemon uses. Muted
//! blocks advance the RTP timestamp without emitting packets, and the
//! first packet after a gap carries the RTP marker bit.

use std::net::{SocketAddr, UdpSocket};

use tracing::warn;

use crate::error::Result;

/// One block of demodulated audio, interleaved when stereo.
#[derive(Debug, Clone)]
pub struct PcmBlock {
    pub samples: Vec<f32>,
    pub channels: usize,
    /// Squelched: no carrier, no PLL lock, or an untuned channel.
    pub mute: bool,
}

impl PcmBlock {
    /// Frames in this block (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Downstream consumer of demodulated audio.
pub trait PcmSink: Send {
    fn send(&mut self, block: &PcmBlock) -> Result<()>;
}

/// Sink that discards everything; placeholder for channels without an
/// output destination.
pub struct NullSink;

impl PcmSink for NullSink {
    fn send(&mut self, _block: &PcmBlock) -> Result<()> {
        Ok(())
    }
}

/// Dynamic RTP payload types for raw 16-bit PCM.
pub const RTP_PT_PCM_MONO: u8 = 122;
pub const RTP_PT_PCM_STEREO: u8 = 123;

/// Serialize one RTP packet: 12-byte header, then big-endian 16-bit PCM.
fn rtp_packet(
    payload_type: u8,
    marker: bool,
    seq: u16,
    timestamp: u32,
    ssrc: u32,
    samples: &[f32],
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(12 + samples.len() * 2);
    pkt.push(0x80); // V=2, no padding, no extension, no CSRC
    pkt.push(payload_type | if marker { 0x80 } else { 0 });
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&timestamp.to_be_bytes());
    pkt.extend_from_slice(&ssrc.to_be_bytes());
    for &s in samples {
        let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
        pkt.extend_from_slice(&v.to_be_bytes());
    }
    pkt
}

/// RTP-over-UDP PCM sender, one per channel.
pub struct RtpPcmSink {
    socket: UdpSocket,
    ssrc: u32,
    payload_type: u8,
    seq: u16,
    timestamp: u32,
    in_gap: bool,
}

impl RtpPcmSink {
    pub fn new(dest: SocketAddr, ssrc: u32, channels: usize) -> Result<Self> {
        let bind: SocketAddr = if dest.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(dest)?;
        Ok(Self {
            socket,
            ssrc,
            payload_type: if channels == 2 {
                RTP_PT_PCM_STEREO
            } else {
                RTP_PT_PCM_MONO
            },
            seq: 0,
            timestamp: 0,
            in_gap: true,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

impl PcmSink for RtpPcmSink {
    fn send(&mut self, block: &PcmBlock) -> Result<()> {
        let frames = block.frames() as u32;
        if block.mute {
            // keep the clock running, emit nothing
            self.timestamp = self.timestamp.wrapping_add(frames);
            self.in_gap = true;
            return Ok(());
        }
        let pkt = rtp_packet(
            self.payload_type,
            self.in_gap,
            self.seq,
            self.timestamp,
            self.ssrc,
            &block.samples,
        );
        self.in_gap = false;
        self.seq = self.seq.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(frames);
        if let Err(e) = self.socket.send(&pkt) {
            warn!(ssrc = self.ssrc, error = %e, "rtp send failed");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_header_layout() {
        let pkt = rtp_packet(122, true, 0x0102, 0x03040506, 0x0708090a, &[1.0, -1.0]);
        assert_eq!(pkt.len(), 12 + 4);
        assert_eq!(pkt[0], 0x80);
        assert_eq!(pkt[1], 122 | 0x80); // marker set
        assert_eq!(&pkt[2..4], &[0x01, 0x02]);
        assert_eq!(&pkt[4..8], &[0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&pkt[8..12], &[0x07, 0x08, 0x09, 0x0a]);
        // full-scale positive then negative, big endian
        assert_eq!(&pkt[12..14], &32767i16.to_be_bytes());
        assert_eq!(&pkt[14..16], &(-32768i16).to_be_bytes());
    }

    #[test]
    fn test_mute_suppresses_packets_and_sets_marker() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_nonblocking(true).unwrap();
        let mut sink = RtpPcmSink::new(recv.local_addr().unwrap(), 42, 1).unwrap();

        let audio = PcmBlock {
            samples: vec![0.5; 8],
            channels: 1,
            mute: false,
        };
        let silence = PcmBlock {
            samples: vec![0.0; 8],
            channels: 1,
            mute: true,
        };

        let mut buf = [0u8; 64];
        sink.send(&audio).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let (n, _) = recv.recv_from(&mut buf).unwrap();
        assert!(buf[1] & 0x80 != 0, "first packet after startup is marked");
        assert_eq!(n, 12 + 16);
        let first_ts = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        // two muted blocks: nothing on the wire, timestamp keeps counting
        sink.send(&silence).unwrap();
        sink.send(&silence).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(recv.recv_from(&mut buf).is_err());

        sink.send(&audio).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let _ = recv.recv_from(&mut buf).unwrap();
        assert!(buf[1] & 0x80 != 0, "first packet after a gap is marked");
        let ts = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(ts, first_ts + 24, "timestamp advanced through the gap");
    }

    #[test]
    fn test_sequence_increments_only_on_sent_packets() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut sink = RtpPcmSink::new(recv.local_addr().unwrap(), 7, 2).unwrap();
        let audio = PcmBlock {
            samples: vec![0.1; 16],
            channels: 2,
            mute: false,
        };
        sink.send(&audio).unwrap();
        assert_eq!(sink.seq, 1);
        sink.send(&PcmBlock {
            samples: vec![0.0; 16],
            channels: 2,
            mute: true,
        })
        .unwrap();
        assert_eq!(sink.seq, 1);
    }
}
