//! Decoders for plain (unencrypted) vendor advertisements.
//!
//! Service-data parsers receive the bytes after the 16-bit UUID; the iBeacon
//! parser receives the manufacturer data after the company id.

use serde::Serialize;

use crate::types::HexBytes;

fn be16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

/// Reading from a thermometer running ATC1441 or pvvx custom firmware.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thermometer {
    pub temperature: f32,
    pub humidity: f32,
    pub battery: u8,
    /// Millivolts.
    pub voltage: u16,
    pub seq: u8,
}

/// Parse UUID `0x181A` service data.
///
/// Two layouts exist: the original ATC1441 one (13 bytes, big endian, 0.1 °C)
/// and the pvvx one (15 bytes, little endian, 0.01 °C / 0.01 %).
pub fn parse_atc1441(b: &[u8]) -> Option<Thermometer> {
    match b.len() {
        13 => Some(Thermometer {
            temperature: f32::from(be16(b, 6) as i16) / 10.0,
            humidity: f32::from(b[8]),
            battery: b[9],
            voltage: be16(b, 10),
            seq: b[12],
        }),
        15 => Some(Thermometer {
            temperature: f32::from(le16(b, 6) as i16) / 100.0,
            humidity: f32::from(le16(b, 8)) / 100.0,
            voltage: le16(b, 10),
            battery: b[12],
            seq: b[13],
        }),
        _ => None,
    }
}

/// Weight in whatever unit the scale is set to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    /// Catty mode (jin); value as displayed.
    Weight(f32),
    WeightLb(f32),
    WeightKg(f32),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleReading {
    pub stabilized: bool,
    pub removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impedance: Option<u16>,
    #[serde(flatten)]
    pub weight: Option<Weight>,
}

/// Parse Mi Scale v1 (UUID `0x181D`) service data.
pub fn parse_mi_scale_v1(b: &[u8]) -> Option<ScaleReading> {
    if b.len() < 3 {
        return None;
    }
    let flags = b[0];
    let raw = f32::from(le16(b, 1));
    let weight = if flags & 0x10 != 0 {
        Weight::Weight(raw / 100.0)
    } else if flags & 0x01 != 0 {
        Weight::WeightLb(raw / 100.0)
    } else {
        Weight::WeightKg(raw / 200.0)
    };
    Some(ScaleReading {
        stabilized: flags & 0x20 != 0,
        removed: flags & 0x80 != 0,
        impedance: None,
        weight: Some(weight),
    })
}

/// Parse Mi Body Composition Scale (UUID `0x181B`) service data.
pub fn parse_mi_scale_v2(b: &[u8]) -> Option<ScaleReading> {
    // Weight is the u16 at offset 11
    if b.len() < 13 {
        return None;
    }
    let flags = b[1];
    let raw = f32::from(le16(b, 11));
    let weight = match b[0] {
        0x10 => Some(Weight::Weight(raw / 100.0)),
        0x03 => Some(Weight::WeightLb(raw / 100.0)),
        0x02 => Some(Weight::WeightKg(raw / 200.0)),
        _ => None,
    };
    Some(ScaleReading {
        stabilized: flags & 0x20 != 0,
        removed: flags & 0x80 != 0,
        impedance: (flags & 0x02 != 0).then(|| le16(b, 9)),
        weight,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IBeacon {
    pub uuid: String,
    pub major: u16,
    pub minor: u16,
    /// Calibrated power at 1 m.
    pub tx: i8,
}

impl IBeacon {
    /// Identity used for tracker counting.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.uuid, self.major, self.minor)
    }
}

/// Parse Apple manufacturer data as an iBeacon.
pub fn parse_ibeacon(b: &[u8]) -> Option<IBeacon> {
    if b.len() != 23 || b[0] != 0x02 || b[1] != 0x15 {
        return None;
    }
    Some(IBeacon {
        uuid: HexBytes(&b[2..18]).to_string(),
        major: be16(b, 18),
        minor: be16(b, 20),
        tx: b[22] as i8,
    })
}
