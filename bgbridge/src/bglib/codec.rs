//! Link codec: turns a noisy serial byte stream into BGAPI frames.
//!
//! Chip firmware in the field has two known defects the decoder repairs:
//!
//! - In extended scan response events a single payload byte is sometimes
//!   written as `0xDB 0xDC` or `0xDB 0xDD`. The second byte is surplus.
//! - The advertising set id (always `0xFF` for passive scans) is sometimes
//!   replaced by the start of the next message, leaving the length field
//!   meaningless.
//!
//! Newer firmware wraps each message in `0xC0 ... 0xC0` markers; the
//! [`Framing`] of each link is chosen at setup.

use std::io;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::FramingError;
use super::protocol::{is_type_byte, scan, Frame, HEADER_LEN, MAX_FRAME_LEN, TYPE_EVENT};

/// Frame delimiter used by bracketed links.
pub const MARKER: u8 = 0xC0;

/// First byte of the firmware's spurious two-byte sequences.
pub const ESCAPE: u8 = 0xDB;

/// How frames are delimited on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// `[type][len][class][cmd][payload]`
    #[default]
    Unbracketed,
    /// `[0xC0][type][len][class][cmd][payload][0xC0]`
    Bracketed,
}

impl Framing {
    /// Bytes preceding the type byte.
    fn lead(self) -> usize {
        match self {
            Framing::Unbracketed => 0,
            Framing::Bracketed => 1,
        }
    }

    /// Bytes on the wire besides the payload.
    fn overhead(self) -> usize {
        HEADER_LEN + 2 * self.lead()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown framing {0:?}, expected \"unbracketed\" or \"bracketed\"")]
pub struct ParseFramingError(String);

impl FromStr for Framing {
    type Err = ParseFramingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unbracketed" | "plain" => Ok(Framing::Unbracketed),
            "bracketed" | "c0" => Ok(Framing::Bracketed),
            _ => Err(ParseFramingError(s.to_string())),
        }
    }
}

/// One result from the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Read {
    Frame(Frame),
    /// Bytes that could not be assembled into a frame. They are forwarded or
    /// dropped by the caller; decoding continues with the next byte.
    Wrong { bytes: Bytes, reason: FramingError },
}

/// Item written to the application link: a frame, or stray chip bytes
/// passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Raw(Bytes),
}

/// Stateful BGAPI deframer and framer for one link.
pub struct FrameCodec {
    framing: Framing,
    allow_empty: bool,
    buf: BytesMut,
    expected: Option<usize>,
    repaired: bool,
}

impl FrameCodec {
    /// Codec for the chip link. The chip never sends an empty payload, so a
    /// zero length byte means the stream is out of sync.
    pub fn chip(framing: Framing) -> Self {
        Self::new(framing, false)
    }

    /// Codec for the application link, where payload-less commands such as
    /// `cmd_system_get_bt_address` are legitimate.
    pub fn app(framing: Framing) -> Self {
        Self::new(framing, true)
    }

    fn new(framing: Framing, allow_empty: bool) -> Self {
        Self {
            framing,
            allow_empty,
            buf: BytesMut::with_capacity(MAX_FRAME_LEN + 2),
            expected: None,
            repaired: false,
        }
    }

    /// Feed one byte. Returns a result once a frame completes or the
    /// accumulated bytes are known to be bad.
    pub fn push(&mut self, byte: u8) -> Option<Read> {
        match (self.framing, self.buf.len()) {
            (Framing::Unbracketed, 0) if !is_type_byte(byte) => {
                return Some(wrong_byte(byte));
            }
            (Framing::Bracketed, 0) if byte != MARKER => {
                return Some(wrong_byte(byte));
            }
            (Framing::Bracketed, 1) if !is_type_byte(byte) => {
                if byte == MARKER {
                    // The held marker closed a frame we lost; this one opens the next
                    return Some(wrong_byte(MARKER));
                }
                self.buf.put_u8(byte);
                return Some(self.wrong(FramingError::UnexpectedByte(byte)));
            }
            _ => {}
        }

        if self.in_scan_response()
            && self.buf.last() == Some(&ESCAPE)
            && matches!(byte, 0xDC | 0xDD)
        {
            return None;
        }

        self.buf.put_u8(byte);
        let n = self.buf.len();
        let lead = self.framing.lead();

        if n == lead + 2 {
            if byte == 0 && !self.allow_empty {
                return Some(self.wrong(FramingError::ZeroLength));
            }
            let expected = self.framing.overhead() + byte as usize;
            if expected > MAX_FRAME_LEN + 2 * lead {
                return Some(self.wrong(FramingError::TooLong(expected)));
            }
            self.expected = Some(expected);
        }

        if n == lead + scan::ADV_SID + 1 && self.in_scan_response() {
            let sid = self.buf[lead + scan::ADV_SID];
            if sid != scan::SENTINEL {
                return Some(self.wrong(FramingError::Sentinel(sid)));
            }
        }

        if Some(n) == self.expected {
            return self.complete();
        }
        None
    }

    /// True once the header of an extended scan response has been read.
    fn in_scan_response(&self) -> bool {
        let lead = self.framing.lead();
        self.buf.len() >= lead + HEADER_LEN
            && self.buf[lead] == TYPE_EVENT
            && self.buf[lead + 2] == 0x03
            && self.buf[lead + 3] == 0x04
    }

    fn complete(&mut self) -> Option<Read> {
        match self.framing {
            Framing::Unbracketed => Some(Read::Frame(Frame::from_raw(self.take()))),
            Framing::Bracketed => {
                if self.buf.last() == Some(&MARKER) {
                    let mut raw = self.take();
                    raw.truncate(raw.len() - 1);
                    raw.advance(1);
                    return Some(Read::Frame(Frame::from_raw(raw)));
                }
                if !self.repaired {
                    self.repaired = true;
                    if self.strip_escapes() > 0 {
                        return None;
                    }
                }
                Some(self.wrong(FramingError::Terminator))
            }
        }
    }

    /// Drop surplus bytes after `0xDB` anywhere in the payload region.
    /// Returns how many were removed.
    fn strip_escapes(&mut self) -> usize {
        let start = self.framing.lead() + HEADER_LEN;
        let mut kept = BytesMut::with_capacity(self.buf.capacity());
        kept.put_slice(&self.buf[..start.min(self.buf.len())]);
        for &byte in self.buf.iter().skip(start) {
            if kept.len() > start && kept.last() == Some(&ESCAPE) && matches!(byte, 0xDC | 0xDD) {
                continue;
            }
            kept.put_u8(byte);
        }
        let removed = self.buf.len() - kept.len();
        self.buf = kept;
        removed
    }

    fn take(&mut self) -> BytesMut {
        self.expected = None;
        self.repaired = false;
        self.buf.split()
    }

    fn wrong(&mut self, reason: FramingError) -> Read {
        Read::Wrong {
            bytes: self.take().freeze(),
            reason,
        }
    }
}

fn wrong_byte(byte: u8) -> Read {
    Read::Wrong {
        bytes: Bytes::copy_from_slice(&[byte]),
        reason: FramingError::UnexpectedByte(byte),
    }
}

impl Decoder for FrameCodec {
    type Item = Read;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Bytes move into our own accumulation buffer one at a time, since the
        // repair rules depend on what was kept, not on what arrived. Bad data
        // is reported as Read::Wrong; returning Err would end the stream.
        while src.has_remaining() {
            if let Some(read) = self.push(src.get_u8()) {
                return Ok(Some(read));
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(frame.len() + 2);
        if self.framing == Framing::Bracketed {
            dst.put_u8(MARKER);
        }
        dst.put_slice(frame.as_bytes());
        if self.framing == Framing::Bracketed {
            dst.put_u8(MARKER);
        }
        Ok(())
    }
}

impl Encoder<Outbound> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outbound::Frame(frame) => <Self as Encoder<Frame>>::encode(self, frame, dst),
            Outbound::Raw(bytes) => {
                dst.put_slice(&bytes);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bglib::test_data::{scan_response, ADDRESS};
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn decode_all(codec: &mut FrameCodec, bytes: &[u8]) -> Vec<Read> {
        bytes.iter().filter_map(|&b| codec.push(b)).collect()
    }

    fn frames(reads: &[Read]) -> Vec<Vec<u8>> {
        reads
            .iter()
            .filter_map(|r| match r {
                Read::Frame(f) => Some(f.as_bytes().to_vec()),
                Read::Wrong { .. } => None,
            })
            .collect()
    }

    const START_DISCOVERY_RSP: [u8; 6] = [0x20, 0x02, 0x03, 0x18, 0x00, 0x00];
    const BT_ADDRESS_RSP: [u8; 10] = [0x20, 0x06, 0x01, 0x03, 0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4];

    #[test]
    fn one_frame_per_input_frame() {
        let adv = scan_response(ADDRESS, 0xC4, 0x25, &[0x02, 0x01, 0x06]);
        let mut stream = Vec::new();
        stream.extend_from_slice(&START_DISCOVERY_RSP);
        stream.extend_from_slice(&adv);
        stream.extend_from_slice(&BT_ADDRESS_RSP);

        let reads = decode_all(&mut FrameCodec::chip(Framing::Unbracketed), &stream);
        assert_eq!(reads.len(), 3);
        assert_eq!(
            frames(&reads),
            vec![START_DISCOVERY_RSP.to_vec(), adv, BT_ADDRESS_RSP.to_vec()]
        );
    }

    #[test]
    fn decoder_handles_partial_frames() {
        let mut codec = FrameCodec::chip(Framing::Unbracketed);
        let mut buf = BytesMut::from(&START_DISCOVERY_RSP[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty(), "bytes move into the codec's own buffer");

        buf.put_slice(&START_DISCOVERY_RSP[3..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Read::Frame(f)) => assert_eq!(f.as_bytes(), &START_DISCOVERY_RSP),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn firmware_escape_bytes_are_dropped() {
        // rssi 0xDB followed by a spurious 0xDC, as seen from fw 1.5.0
        let clean = scan_response(ADDRESS, 0xDB, 0x26, &[0x02, 0x01, 0x06]);
        let mut corrupted = clean[..18].to_vec();
        corrupted.push(0xDC);
        corrupted.extend_from_slice(&clean[18..]);

        let reads = decode_all(&mut FrameCodec::chip(Framing::Unbracketed), &corrupted);
        assert_eq!(frames(&reads), vec![clean.clone()]);

        // Same for 0xDD inside the advertising data
        let clean = scan_response(ADDRESS, 0xC4, 0x26, &[0x03, 0xFF, 0xDB, 0x11]);
        let mut corrupted = clean.clone();
        let at = corrupted.len() - 1;
        corrupted.insert(at, 0xDD);
        let reads = decode_all(&mut FrameCodec::chip(Framing::Unbracketed), &corrupted);
        assert_eq!(frames(&reads), vec![clean]);
    }

    #[test]
    fn escape_rule_only_applies_to_scan_responses() {
        let frame = [0xA0, 0x03, 0x07, 0x07, 0xDB, 0xDC, 0x01];
        let reads = decode_all(&mut FrameCodec::chip(Framing::Unbracketed), &frame);
        assert_eq!(frames(&reads), vec![frame.to_vec()]);
    }

    #[test]
    fn zero_length_is_a_two_byte_wrong_read() {
        let mut codec = FrameCodec::chip(Framing::Unbracketed);
        assert_eq!(codec.push(0x20), None);
        assert_eq!(
            codec.push(0x00),
            Some(Read::Wrong {
                bytes: Bytes::from_static(&[0x20, 0x00]),
                reason: FramingError::ZeroLength,
            })
        );
    }

    #[test]
    fn app_link_accepts_empty_commands() {
        let get_address = [0x20, 0x00, 0x01, 0x03];
        let reads = decode_all(&mut FrameCodec::app(Framing::Unbracketed), &get_address);
        assert_eq!(frames(&reads), vec![get_address.to_vec()]);
    }

    #[test]
    fn garbage_yields_single_byte_wrong_reads() {
        let mut stream = vec![0x93, 0x71, 0x62, 0xAD];
        stream.extend_from_slice(&START_DISCOVERY_RSP);

        let reads = decode_all(&mut FrameCodec::chip(Framing::Unbracketed), &stream);
        assert_eq!(reads.len(), 5);
        for (read, byte) in reads.iter().zip([0x93, 0x71, 0x62, 0xAD]) {
            assert_eq!(read, &wrong_byte(byte));
        }
        assert_eq!(frames(&reads), vec![START_DISCOVERY_RSP.to_vec()]);
    }

    #[test]
    fn bad_sentinel_returns_sixteen_bytes() {
        let mut bad = scan_response(ADDRESS, 0xC4, 0x25, &[0x02, 0x01, 0x06]);
        bad[scan::ADV_SID] = 0xC0;
        let good = scan_response(ADDRESS, 0xC4, 0x25, &[0x02, 0x01, 0x06]);

        let mut stream = bad.clone();
        stream.extend_from_slice(&good);
        let reads = decode_all(&mut FrameCodec::chip(Framing::Unbracketed), &stream);

        assert_eq!(
            reads[0],
            Read::Wrong {
                bytes: Bytes::copy_from_slice(&bad[..16]),
                reason: FramingError::Sentinel(0xC0),
            }
        );
        // Remainder of the broken event is skipped byte by byte
        assert!(reads[1..reads.len() - 1]
            .iter()
            .all(|r| matches!(r, Read::Wrong { bytes, .. } if bytes.len() == 1)));
        assert_eq!(reads.last(), Some(&Read::Frame(Frame::from_bytes(&good).unwrap())));
    }

    #[test]
    fn bracketed_frame() {
        let mut stream = vec![MARKER];
        stream.extend_from_slice(&START_DISCOVERY_RSP);
        stream.push(MARKER);

        let reads = decode_all(&mut FrameCodec::chip(Framing::Bracketed), &stream);
        assert_eq!(frames(&reads), vec![START_DISCOVERY_RSP.to_vec()]);
    }

    #[test]
    fn bracketed_resync_on_doubled_marker() {
        // Tail marker of a lost frame, then a complete frame
        let mut stream = vec![MARKER, MARKER];
        stream.extend_from_slice(&START_DISCOVERY_RSP);
        stream.push(MARKER);

        let reads = decode_all(&mut FrameCodec::chip(Framing::Bracketed), &stream);
        assert_eq!(reads[0], wrong_byte(MARKER));
        assert_eq!(frames(&reads), vec![START_DISCOVERY_RSP.to_vec()]);
    }

    #[test]
    fn bracketed_repair_pass_recovers_frame() {
        // Declared payload is DB 11; the wire carries a surplus DC
        let stream = [MARKER, 0xA0, 0x02, 0x07, 0x07, 0xDB, 0xDC, 0x11, MARKER];
        let reads = decode_all(&mut FrameCodec::chip(Framing::Bracketed), &stream);
        assert_eq!(frames(&reads), vec![vec![0xA0, 0x02, 0x07, 0x07, 0xDB, 0x11]]);
    }

    #[test]
    fn bracketed_missing_terminator() {
        let stream = [MARKER, 0x20, 0x01, 0x01, 0x01, 0x00, 0x55];
        let reads = decode_all(&mut FrameCodec::chip(Framing::Bracketed), &stream);
        assert_eq!(
            reads,
            vec![Read::Wrong {
                bytes: Bytes::copy_from_slice(&stream),
                reason: FramingError::Terminator,
            }]
        );
    }

    #[test]
    fn bracketed_sentinel_offset() {
        let mut adv = scan_response(ADDRESS, 0xC4, 0x25, &[0x02, 0x01, 0x06]);
        adv[scan::ADV_SID] = 0x00;
        let mut stream = vec![MARKER];
        stream.extend_from_slice(&adv);

        let mut codec = FrameCodec::chip(Framing::Bracketed);
        let first = decode_all(&mut codec, &stream).into_iter().next();
        match first {
            Some(Read::Wrong { bytes, reason }) => {
                assert_eq!(bytes.len(), 17);
                assert_eq!(reason, FramingError::Sentinel(0x00));
            }
            other => panic!("expected sentinel wrong read, got {:?}", other),
        }
    }

    #[test]
    fn encoder_respects_framing() {
        let frame = Frame::from_bytes(&START_DISCOVERY_RSP).unwrap();

        let mut dst = BytesMut::new();
        FrameCodec::chip(Framing::Bracketed).encode(frame.clone(), &mut dst).unwrap();
        assert_eq!(dst[0], MARKER);
        assert_eq!(&dst[1..7], &START_DISCOVERY_RSP);
        assert_eq!(dst[7], MARKER);

        let mut dst = BytesMut::new();
        let mut codec = FrameCodec::app(Framing::Unbracketed);
        codec.encode(Outbound::Frame(frame), &mut dst).unwrap();
        codec.encode(Outbound::Raw(Bytes::from_static(&[0x93, 0x71])), &mut dst).unwrap();
        assert_eq!(&dst[..6], &START_DISCOVERY_RSP);
        assert_eq!(&dst[6..], &[0x93, 0x71]);
    }

    #[test]
    fn framing_from_str() {
        assert_eq!("bracketed".parse::<Framing>().unwrap(), Framing::Bracketed);
        assert_eq!("Unbracketed".parse::<Framing>().unwrap(), Framing::Unbracketed);
        assert!("hdlc".parse::<Framing>().is_err());
    }

    #[tokio::test]
    async fn framed_read_over_byte_stream() {
        let mut stream = vec![0x00];
        stream.extend_from_slice(&BT_ADDRESS_RSP);
        let mut reader = FramedRead::new(&stream[..], FrameCodec::chip(Framing::Unbracketed));

        assert_eq!(reader.next().await.unwrap().unwrap(), wrong_byte(0x00));
        match reader.next().await.unwrap().unwrap() {
            Read::Frame(f) => assert_eq!(f.as_bytes(), &BT_ADDRESS_RSP),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(reader.next().await.is_none());
    }
}
