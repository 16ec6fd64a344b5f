//! Error types for rxbank operations.

use std::time::Duration;

use thiserror::Error;

/// Result type for rxbank operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine and its components.
///
/// Channel-scoped errors (`SampleRateMismatch`, `PassbandOutOfRange`,
/// `Network`, `InternalInvariant`) never stop other channels; front-end and
/// forward-stage errors stop or pause the whole pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration. Fatal at startup, per-channel at runtime.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No samples arrived from the front end within the timeout.
    #[error("front end stalled: no samples within {0:?}")]
    FrontEndStalled(Duration),

    /// The input stream was drained and resynchronized.
    #[error("front end resynchronized, {0} samples discarded")]
    FrontEndResync(usize),

    /// The sample stream ended (file sources only).
    #[error("sample stream ended")]
    EndOfStream,

    /// Channel output rate does not divide the front-end rate and block sizes.
    #[error("sample rate mismatch: {fo} Hz output does not evenly divide {fs} Hz blocks")]
    SampleRateMismatch { fs: u32, fo: u32 },

    /// Requested passband extends outside the channel's Nyquist interval.
    #[error("passband [{low}, {high}] Hz exceeds +/-{half} Hz, clamped")]
    PassbandOutOfRange { low: f32, high: f32, half: f32 },

    /// Output send failure; the channel retries on the next block.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Internal invariant violated; terminates the offending channel only.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(&'static str),
}
