//! BGAPI serial protocol: frame model, known headers and the link codec.

pub mod codec;
pub mod error;
pub mod protocol;

pub use codec::{FrameCodec, Framing, Outbound, Read};
pub use error::FramingError;
pub use protocol::{classify, ChipMessage, Frame, Header, Kind};

#[cfg(test)]
pub(crate) mod test_data;
