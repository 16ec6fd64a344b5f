#![doc = include_str!("../readme.md")]

use num_complex::Complex;

pub mod channel;
pub mod demod;
pub mod emit;
pub mod engine;
pub mod error;
pub mod fft;
pub mod filter;
pub mod frontend;
pub mod ingest;
pub mod osc;
pub mod status;

pub use error::{Error, Result};

/**
 * Front-end sample format
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SampleFormat {
    /// Real unsigned 8-bit, offset binary (Ru8)
    Ru8,
    /// Real signed 8-bit (Rs8)
    Rs8,
    /// Real signed 16-bit little endian (Rs16)
    Rs16,
    /// Real 32-bit float (Rf32)
    Rf32,
    /// Complex unsigned 8-bit, offset binary (Cu8)
    Cu8,
    /// Complex signed 8-bit (Cs8)
    Cs8,
    /// Complex signed 16-bit little endian (Cs16)
    Cs16,
    /// Complex 32-bit float (Cf32)
    Cf32,
}

impl SampleFormat {
    /// Bytes occupied by one sample (one real value, or one I/Q pair).
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Ru8 | SampleFormat::Rs8 => 1,
            SampleFormat::Rs16 | SampleFormat::Cu8 | SampleFormat::Cs8 => 2,
            SampleFormat::Rf32 | SampleFormat::Cs16 => 4,
            SampleFormat::Cf32 => 8,
        }
    }

    /// True when the format carries real samples (no quadrature part).
    pub fn is_real(self) -> bool {
        matches!(
            self,
            SampleFormat::Ru8 | SampleFormat::Rs8 | SampleFormat::Rs16 | SampleFormat::Rf32
        )
    }
}

impl std::str::FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ru8" => Ok(SampleFormat::Ru8),
            "rs8" => Ok(SampleFormat::Rs8),
            "rs16" => Ok(SampleFormat::Rs16),
            "rf32" => Ok(SampleFormat::Rf32),
            "cu8" => Ok(SampleFormat::Cu8),
            "cs8" => Ok(SampleFormat::Cs8),
            "cs16" => Ok(SampleFormat::Cs16),
            "cf32" => Ok(SampleFormat::Cf32),
            other => Err(format!("unknown sample format '{other}'")),
        }
    }
}

/// Convert a raw front-end byte buffer to complex float samples.
///
/// Real formats produce samples with a zero quadrature part; the forward
/// transform stage knows the input is real and stores only the upper half
/// spectrum.
pub fn convert_bytes_to_complex(format: SampleFormat, buffer: &[u8]) -> Vec<Complex<f32>> {
    match format {
        SampleFormat::Ru8 => buffer
            .iter()
            .map(|&b| Complex::new((b as f32 - 127.5) / 128.0, 0.0))
            .collect(),
        SampleFormat::Rs8 => buffer
            .iter()
            .map(|&b| Complex::new((b as i8) as f32 / 128.0, 0.0))
            .collect(),
        SampleFormat::Rs16 => buffer
            .chunks_exact(2)
            .map(|c| Complex::new(i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0, 0.0))
            .collect(),
        SampleFormat::Rf32 => buffer
            .chunks_exact(4)
            .map(|c| Complex::new(f32::from_le_bytes([c[0], c[1], c[2], c[3]]), 0.0))
            .collect(),
        SampleFormat::Cu8 => buffer
            .chunks_exact(2)
            .map(|c| Complex::new((c[0] as f32 - 127.5) / 128.0, (c[1] as f32 - 127.5) / 128.0))
            .collect(),
        SampleFormat::Cs8 => buffer
            .chunks_exact(2)
            .map(|c| Complex::new((c[0] as i8) as f32 / 128.0, (c[1] as i8) as f32 / 128.0))
            .collect(),
        SampleFormat::Cs16 => buffer
            .chunks_exact(4)
            .map(|c| {
                Complex::new(
                    i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0,
                    i16::from_le_bytes([c[2], c[3]]) as f32 / 32768.0,
                )
            })
            .collect(),
        SampleFormat::Cf32 => buffer
            .chunks_exact(8)
            .map(|c| {
                Complex::new(
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect(),
    }
}

/// Decibels to voltage ratio.
pub fn db2voltage(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Decibels to power ratio.
pub fn db2power(db: f32) -> f32 {
    10.0_f32.powf(db / 10.0)
}

/// Voltage ratio to decibels.
pub fn voltage2db(v: f32) -> f32 {
    20.0 * v.log10()
}

/// Power ratio to decibels.
pub fn power2db(p: f32) -> f32 {
    10.0 * p.log10()
}
