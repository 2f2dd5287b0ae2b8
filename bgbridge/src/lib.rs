//! Serial bridge between a BGAPI BLE chip and the hub application that drives
//! it, with passive advertisement decoding on the side.
//!
//! The chip speaks BGAPI over a UART. The vendor application expects to own
//! that UART; instead it is pointed at a pseudo-terminal and the bridge sits
//! in between. It repairs the chip's corrupted framing, feeds the chip one
//! command at a time, restarts the chip when discovery stalls, and decodes the
//! advertisements flowing past (including encrypted MiBeacons).

pub mod bglib;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod gap;
pub mod keys;
pub mod mibeacon;
pub mod sequencer;
pub mod sink;
pub mod supervisor;
pub mod tracing;
pub mod transport;
pub mod types;
