//! TLV status/command encoding.
//!
//! Every item on the wire is `{type byte, length byte, value bytes}`.
//! Integers go big-endian with leading zeroes suppressed; a zero value
//! compresses to length 0. Floats and doubles travel as their IEEE-754
//! bit patterns through the integer encoder, and NaN is never encoded.
//! Socket addresses are 4+2 bytes for IPv4 and an 8-byte prefix + 2 for
//! IPv6. A single EOL byte (0) terminates a list.
//!
//! Packets start with one discriminator byte: 0 for status reports, 1 for
//! commands.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// First byte of every packet.
pub const PKT_STATUS: u8 = 0;
pub const PKT_COMMAND: u8 = 1;

/// Item type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusType {
    Eol = 0,
    CommandTag = 1,
    OutputSsrc = 2,
    RadioFrequency = 3,
    OutputSampleRate = 4,
    SignalNoiseRatio = 5,
    FrequencyOffset = 6,
    Gain = 7,
    PllLock = 8,
    PllRotations = 9,
    OutputPower = 10,
    BasebandPower = 11,
    NoiseDensity = 12,
    OutputChannels = 13,
    OutputDestination = 14,
    FilterLow = 15,
    FilterHigh = 16,
    ShiftFrequency = 17,
    Headroom = 18,
    AgcEnable = 19,
    PllEnable = 20,
    PllBandwidth = 21,
    KaiserBeta = 22,
    BlockCount = 23,
}

impl StatusType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use StatusType::*;
        Some(match b {
            0 => Eol,
            1 => CommandTag,
            2 => OutputSsrc,
            3 => RadioFrequency,
            4 => OutputSampleRate,
            5 => SignalNoiseRatio,
            6 => FrequencyOffset,
            7 => Gain,
            8 => PllLock,
            9 => PllRotations,
            10 => OutputPower,
            11 => BasebandPower,
            12 => NoiseDensity,
            13 => OutputChannels,
            14 => OutputDestination,
            15 => FilterLow,
            16 => FilterHigh,
            17 => ShiftFrequency,
            18 => Headroom,
            19 => AgcEnable,
            20 => PllEnable,
            21 => PllBandwidth,
            22 => KaiserBeta,
            23 => BlockCount,
            _ => return None,
        })
    }
}

/// Append a 64-bit integer item, byte-swapped, leading zeroes suppressed.
pub fn encode_int(buf: &mut Vec<u8>, ty: StatusType, x: u64) {
    buf.push(ty as u8);
    if x == 0 {
        // zero value compresses to zero length
        buf.push(0);
        return;
    }
    let len = 8 - (x.leading_zeros() / 8) as usize;
    buf.push(len as u8);
    buf.extend_from_slice(&x.to_be_bytes()[8 - len..]);
}

/// Append a float item via its bit pattern. NaN encodes nothing.
pub fn encode_float(buf: &mut Vec<u8>, ty: StatusType, x: f32) {
    if x.is_nan() {
        return;
    }
    encode_int(buf, ty, x.to_bits() as u64);
}

/// Append a double item via its bit pattern. NaN encodes nothing.
pub fn encode_double(buf: &mut Vec<u8>, ty: StatusType, x: f64) {
    if x.is_nan() {
        return;
    }
    encode_int(buf, ty, x.to_bits());
}

/// Append a byte string, truncated to 255 bytes.
pub fn encode_string(buf: &mut Vec<u8>, ty: StatusType, s: &[u8]) {
    let len = s.len().min(255);
    buf.push(ty as u8);
    buf.push(len as u8);
    buf.extend_from_slice(&s[..len]);
}

/// Append a socket address item.
pub fn encode_socket(buf: &mut Vec<u8>, ty: StatusType, sock: SocketAddr) {
    match sock {
        SocketAddr::V4(v4) => {
            buf.push(ty as u8);
            buf.push(6);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            buf.push(ty as u8);
            buf.push(10);
            buf.extend_from_slice(&v6.ip().octets()[..8]);
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

/// Terminate a list.
pub fn encode_eol(buf: &mut Vec<u8>) {
    buf.push(StatusType::Eol as u8);
}

/// Decode a length-suppressed big-endian integer.
pub fn decode_int(value: &[u8]) -> u64 {
    value.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Decode a float item; an 8-byte value is narrowed from double.
pub fn decode_float(value: &[u8]) -> f32 {
    match value.len() {
        0 => 0.0,
        8 => decode_double(value) as f32,
        _ => f32::from_bits(decode_int(value) as u32),
    }
}

/// Decode a double item; a 4-byte value is widened from float.
pub fn decode_double(value: &[u8]) -> f64 {
    match value.len() {
        0 => 0.0,
        4 => decode_float(value) as f64,
        _ => f64::from_bits(decode_int(value)),
    }
}

/// Decode a socket address item; `None` for unknown layouts.
pub fn decode_socket(value: &[u8]) -> Option<SocketAddr> {
    match value.len() {
        6 => {
            let ip = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
            let port = u16::from_be_bytes([value[4], value[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        10 => {
            let mut octets = [0u8; 16];
            octets[..8].copy_from_slice(&value[..8]);
            let port = u16::from_be_bytes([value[8], value[9]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Iterator over the items of one packet body (after the discriminator).
pub struct Items<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Items<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }
}

impl<'a> Iterator for Items<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.body.len() {
            return None;
        }
        let ty = self.body[self.pos];
        self.pos += 1;
        if ty == StatusType::Eol as u8 {
            return None;
        }
        if self.pos >= self.body.len() {
            return None;
        }
        let len = self.body[self.pos] as usize;
        self.pos += 1;
        if self.pos + len > self.body.len() {
            // malformed length, stop scanning
            return None;
        }
        let value = &self.body[self.pos..self.pos + len];
        self.pos += len;
        Some((ty, value))
    }
}

/// Extract the SSRC a command or status packet addresses; 0 (reserved)
/// means broadcast or absent.
pub fn ssrc_of(packet: &[u8]) -> u32 {
    if packet.is_empty() {
        return 0;
    }
    for (ty, value) in Items::new(&packet[1..]) {
        if ty == StatusType::OutputSsrc as u8 {
            return decode_int(value) as u32;
        }
    }
    0
}

/// Build an empty poll command: optional SSRC (absent = broadcast), a
/// 32-bit command tag, EOL.
pub fn encode_poll(ssrc: u32, tag: u32) -> Vec<u8> {
    let mut buf = vec![PKT_COMMAND];
    if ssrc != 0 {
        encode_int(&mut buf, StatusType::OutputSsrc, ssrc as u64);
    }
    encode_int(&mut buf, StatusType::CommandTag, tag as u64);
    encode_eol(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_compresses_to_zero_length() {
        let mut buf = Vec::new();
        encode_int(&mut buf, StatusType::OutputSsrc, 0);
        assert_eq!(buf, vec![StatusType::OutputSsrc as u8, 0]);
    }

    #[test]
    fn test_leading_zero_suppression() {
        let mut buf = Vec::new();
        encode_int(&mut buf, StatusType::OutputSsrc, 0x1234);
        assert_eq!(buf, vec![StatusType::OutputSsrc as u8, 2, 0x12, 0x34]);

        let mut buf = Vec::new();
        encode_int(&mut buf, StatusType::BlockCount, u64::MAX);
        assert_eq!(buf[1], 8);
        assert_eq!(decode_int(&buf[2..]), u64::MAX);
    }

    #[test]
    fn test_float_round_trip_through_integer_encoder() {
        let mut buf = Vec::new();
        encode_float(&mut buf, StatusType::Gain, -12.5);
        let (ty, value) = Items::new(&buf).next().unwrap();
        assert_eq!(ty, StatusType::Gain as u8);
        assert_eq!(decode_float(value), -12.5);
    }

    #[test]
    fn test_double_narrowing_and_widening() {
        let mut buf = Vec::new();
        encode_double(&mut buf, StatusType::RadioFrequency, 14_074_000.0);
        let (_, value) = Items::new(&buf).next().unwrap();
        assert_eq!(decode_double(value), 14_074_000.0);
        // a float value read as double widens
        let mut buf = Vec::new();
        encode_float(&mut buf, StatusType::Gain, 2.0);
        let (_, value) = Items::new(&buf).next().unwrap();
        assert_eq!(decode_double(value), 2.0);
    }

    #[test]
    fn test_nan_is_never_encoded() {
        let mut buf = Vec::new();
        encode_float(&mut buf, StatusType::SignalNoiseRatio, f32::NAN);
        encode_double(&mut buf, StatusType::RadioFrequency, f64::NAN);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_socket_round_trip() {
        let v4: SocketAddr = "239.1.2.3:5004".parse().unwrap();
        let mut buf = Vec::new();
        encode_socket(&mut buf, StatusType::OutputDestination, v4);
        let (_, value) = Items::new(&buf).next().unwrap();
        assert_eq!(decode_socket(value).unwrap(), v4);

        let v6: SocketAddr = "[ff02::1:2:3:4]:5004".parse().unwrap();
        let mut buf = Vec::new();
        encode_socket(&mut buf, StatusType::OutputDestination, v6);
        let (_, value) = Items::new(&buf).next().unwrap();
        assert_eq!(value.len(), 10);
        // only the 8-byte prefix survives
        let decoded = decode_socket(value).unwrap();
        assert_eq!(decoded.port(), 5004);
    }

    #[test]
    fn test_poll_command_layout() {
        let pkt = encode_poll(1234, 0xdeadbeef);
        assert_eq!(pkt[0], PKT_COMMAND);
        assert_eq!(ssrc_of(&pkt), 1234);
        let tag = Items::new(&pkt[1..])
            .find(|(ty, _)| *ty == StatusType::CommandTag as u8)
            .map(|(_, v)| decode_int(v) as u32);
        assert_eq!(tag, Some(0xdeadbeef));
        assert_eq!(*pkt.last().unwrap(), 0);
    }

    #[test]
    fn test_broadcast_poll_has_no_ssrc() {
        let pkt = encode_poll(0, 7);
        assert_eq!(ssrc_of(&pkt), 0);
    }

    #[test]
    fn test_malformed_length_stops_scan() {
        // item claims 10 bytes but only 2 follow
        let pkt = vec![PKT_COMMAND, StatusType::Gain as u8, 10, 1, 2];
        assert_eq!(ssrc_of(&pkt), 0);
        assert_eq!(Items::new(&pkt[1..]).count(), 0);
    }

    #[test]
    fn test_string_truncation() {
        let mut buf = Vec::new();
        let long = vec![b'x'; 300];
        encode_string(&mut buf, StatusType::OutputDestination, &long);
        let (_, value) = Items::new(&buf).next().unwrap();
        assert_eq!(value.len(), 255);
    }
}
