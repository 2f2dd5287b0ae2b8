//! Decode captured chunks with the bridge's own codec and decoders.

use std::collections::HashMap;

use bgbridge::bglib::protocol::scan;
use bgbridge::bglib::{
    classify, ChipMessage, Frame, FrameCodec, Framing, FramingError, Header, Read,
};
use bgbridge::gap::report::{parse, to_legacy};
use bgbridge::gap::vendor::{self, Decoded};
use bgbridge::gap::Advertisement;
use bgbridge::keys::KeyProvider;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::capture::{Chunk, Direction};

#[derive(Debug)]
pub enum Content {
    /// Application command, or chip response / event.
    Frame {
        header: Option<Header>,
        message: Option<ChipMessage>,
    },
    /// Extended scan response, decoded as the bridge would publish it.
    Advertisement(Box<Advertisement>),
    Wrong(FramingError),
}

#[derive(Debug)]
pub struct Dissected {
    pub timestamp: Option<f64>,
    pub direction: Direction,
    pub raw: Vec<u8>,
    pub content: Content,
}

/// Feeds each side's bytes through its own codec.
pub struct Dissector<'k> {
    codecs: HashMap<Direction, FrameCodec>,
    buffers: HashMap<Direction, BytesMut>,
    keys: &'k dyn KeyProvider,
}

impl<'k> Dissector<'k> {
    pub fn new(chip: Framing, app: Framing, keys: &'k dyn KeyProvider) -> Self {
        Self {
            codecs: HashMap::from([
                (Direction::Chip, FrameCodec::chip(chip)),
                (Direction::App, FrameCodec::app(app)),
            ]),
            buffers: HashMap::new(),
            keys,
        }
    }

    /// Everything completed by this chunk.
    pub fn feed(&mut self, chunk: &Chunk) -> Vec<Dissected> {
        let buffer = self.buffers.entry(chunk.direction).or_default();
        buffer.extend_from_slice(&chunk.data);

        let mut reads = Vec::new();
        if let Some(codec) = self.codecs.get_mut(&chunk.direction) {
            // Decoding from memory cannot fail
            while let Ok(Some(read)) = codec.decode(buffer) {
                reads.push(read);
            }
        }

        reads
            .into_iter()
            .map(|read| self.dissect(chunk.timestamp, chunk.direction, read))
            .collect()
    }

    fn dissect(&self, timestamp: Option<f64>, direction: Direction, read: Read) -> Dissected {
        let (raw, content) = match read {
            Read::Wrong { bytes, reason } => (bytes.to_vec(), Content::Wrong(reason)),
            Read::Frame(frame) => {
                let content = match direction {
                    Direction::App => Content::Frame {
                        header: frame.header(),
                        message: None,
                    },
                    Direction::Chip => self.chip_frame(&frame),
                };
                (frame.as_bytes().to_vec(), content)
            }
        };
        Dissected {
            timestamp,
            direction,
            raw,
            content,
        }
    }

    fn chip_frame(&self, frame: &Frame) -> Content {
        let message = classify(frame);
        if message == ChipMessage::ScanResponse {
            if let Some(adv) = self.advertisement(frame) {
                return Content::Advertisement(Box::new(adv));
            }
        }
        Content::Frame {
            header: frame.header(),
            message: Some(message),
        }
    }

    fn advertisement(&self, frame: &Frame) -> Option<Advertisement> {
        if frame.len() < scan::DATA {
            return None;
        }
        let mut raw = BytesMut::from(frame.as_bytes());
        let len = to_legacy(&mut raw);
        let mut report = parse(&raw[..len])?;
        let decoded = if report.malformed {
            Decoded::default()
        } else {
            vendor::decode(&mut report, self.keys)
        };
        Some(Advertisement {
            report,
            data: decoded.vendor,
            tracker: decoded.tracker,
        })
    }
}
