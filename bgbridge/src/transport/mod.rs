//! Serial links to the chip and the application.
//!
//! Both ends are character devices: the chip UART, and the pseudo-terminal
//! the vendor application was configured to use instead of it. The bridge
//! itself only needs `AsyncRead + AsyncWrite`, so tests drive it over
//! in-memory pipes.

pub mod serial;

pub use serial::{open, LinkConfig, TransportError};
