use thiserror::Error;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::bglib::Framing;
use crate::tracing::prelude::*;

/// Both links run at this rate unless configured otherwise.
pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        source: tokio_serial::Error,
    },
}

/// Where a link lives and how its frames are delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub path: String,
    pub baud: u32,
    pub framing: Framing,
}

impl LinkConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud: DEFAULT_BAUD,
            framing: Framing::default(),
        }
    }
}

/// Open a link as 8N1 without flow control.
pub fn open(link: &LinkConfig) -> Result<SerialStream, TransportError> {
    let stream = tokio_serial::new(&link.path, link.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|source| TransportError::Open {
            path: link.path.clone(),
            source,
        })?;
    debug!(path = %link.path, baud = link.baud, framing = ?link.framing, "Opened link");
    Ok(stream)
}
