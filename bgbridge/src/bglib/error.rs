//! Error types for BGAPI deframing

use thiserror::Error;

/// Why a run of bytes could not be assembled into a frame.
///
/// None of these are fatal: the codec hands the offending bytes back as a
/// wrong read and resynchronizes on the next byte.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("Unexpected start byte: 0x{0:02x}")]
    UnexpectedByte(u8),

    #[error("Zero payload length")]
    ZeroLength,

    #[error("Declared frame length {0} exceeds buffer capacity")]
    TooLong(usize),

    #[error("Bad advertising set sentinel: 0x{0:02x}")]
    Sentinel(u8),

    #[error("Missing end marker")]
    Terminator,
}
