//! Demodulators.
//!
//! Only the coherent linear family lives here (USB/LSB/CW/AM/IQ — anything
//! that is a passband selection plus optional carrier recovery). FM
//! demodulation plugs in externally through the same baseband-block /
//! PCM-sink seams.

pub mod agc;
pub mod linear;

pub use agc::{AgcState, HangAgc};
pub use linear::LinearDemod;
