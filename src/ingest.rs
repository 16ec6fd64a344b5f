//! Sample ingestion: the block clock of the whole pipeline.
//!
//! A [`SampleSource`] delivers exactly `L` converted samples per call; the
//! ingest thread forwards each block to the forward transform stage, which
//! is what advances the global block counter. Sources convert from the
//! front end's packed wire format to `Complex<f32>` on the way in.

use std::io::Read;
use std::net::UdpSocket;
use std::path::Path;
use std::time::Duration;

use num_complex::Complex;

use crate::error::{Error, Result};
use crate::{convert_bytes_to_complex, SampleFormat};

/// A blocking source of front-end samples.
pub trait SampleSource: Send {
    /// Fill `out` with exactly `count` samples. Errors:
    /// [`Error::FrontEndStalled`] when nothing arrives in time,
    /// [`Error::EndOfStream`] when a finite source runs out.
    fn read_block(&mut self, out: &mut Vec<Complex<f32>>, count: usize) -> Result<()>;

    /// Drop any partially accumulated input so the next block starts on a
    /// fresh boundary. Returns the number of samples discarded.
    fn resync(&mut self) -> usize {
        0
    }
}

/**
 * Reader-backed sample source (files, pipes, test fixtures)
 */
pub struct ReaderSource<R: Read + Send> {
    reader: R,
    format: SampleFormat,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R, format: SampleFormat) -> Self {
        Self { reader, format }
    }
}

impl ReaderSource<std::io::BufReader<std::fs::File>> {
    pub fn from_file<P: AsRef<Path>>(path: P, format: SampleFormat) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(Error::Network)?;
        Ok(Self::new(std::io::BufReader::new(file), format))
    }
}

impl<R: Read + Send> SampleSource for ReaderSource<R> {
    fn read_block(&mut self, out: &mut Vec<Complex<f32>>, count: usize) -> Result<()> {
        let mut buffer = vec![0u8; count * self.format.bytes_per_sample()];
        match self.reader.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::EndOfStream)
            }
            Err(e) => return Err(e.into()),
        }
        out.clear();
        out.extend(convert_bytes_to_complex(self.format, &buffer));
        Ok(())
    }
}

/**
 * UDP datagram sample source
 */
pub struct UdpSource {
    socket: UdpSocket,
    format: SampleFormat,
    /// Converted samples waiting to fill a block.
    pending: Vec<Complex<f32>>,
    /// Wire bytes left over when a datagram splits a sample.
    remainder: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl UdpSource {
    /// Wrap a bound (and typically multicast-joined) socket. `timeout` is
    /// the stall detector, conventionally twice the block time.
    pub fn new(socket: UdpSocket, format: SampleFormat, timeout: Duration) -> Result<Self> {
        socket.set_read_timeout(Some(timeout))?;
        Ok(Self {
            socket,
            format,
            pending: Vec::new(),
            remainder: Vec::new(),
            recv_buf: vec![0u8; 65536],
        })
    }

    fn stall_timeout(&self) -> Duration {
        self.socket
            .read_timeout()
            .ok()
            .flatten()
            .unwrap_or(Duration::from_millis(40))
    }
}

impl SampleSource for UdpSource {
    fn read_block(&mut self, out: &mut Vec<Complex<f32>>, count: usize) -> Result<()> {
        while self.pending.len() < count {
            let n = match self.socket.recv(&mut self.recv_buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(Error::FrontEndStalled(self.stall_timeout()));
                }
                Err(e) => return Err(e.into()),
            };
            self.remainder.extend_from_slice(&self.recv_buf[..n]);
            let bps = self.format.bytes_per_sample();
            let whole = self.remainder.len() / bps * bps;
            self.pending
                .extend(convert_bytes_to_complex(self.format, &self.remainder[..whole]));
            self.remainder.drain(..whole);
        }
        out.clear();
        out.extend(self.pending.drain(..count));
        Ok(())
    }

    fn resync(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.remainder.clear();
        dropped
    }
}
