//! Legacy scan response layout and advertisement report parsing.
//!
//! The application only understands `evt_le_gap_scan_response`, so extended
//! responses from the chip are rewritten in place:
//!
//! ```text
//! extended: A0 len 03 04 type addr[6] addr_type bonding phy phy sid tx rssi ch int[2] dlen data..
//! legacy:   A0 len-7 03 00 rssi type addr[6] addr_type bonding dlen data..
//! ```

use std::collections::BTreeMap;

use bytes::BytesMut;
use serde::{Serialize, Serializer};

use crate::bglib::protocol::{scan, HEADER_LEN, TYPE_EVENT};
use crate::types::{HexBytes, MacAddr};

/// Bytes dropped by the legacy conversion.
pub const LEGACY_SHRINK: usize = 7;

/// Offset of the AD structures in a legacy scan response.
pub const LEGACY_DATA: usize = 15;

pub const AD_SHORT_NAME: u8 = 0x08;
pub const AD_COMPLETE_NAME: u8 = 0x09;
pub const AD_SERVICE_DATA: u8 = 0x16;
pub const AD_MESH_MESSAGE: u8 = 0x2A;
pub const AD_MESH_BEACON: u8 = 0x2B;
pub const AD_MANUFACTURER: u8 = 0xFF;

pub const UUID_XIAOMI: u16 = 0xFE95;
pub const UUID_GOOGLE: u16 = 0xFE9F;

/// Rewrite an extended scan response as a legacy one, in place.
///
/// The caller must have validated the frame (at least 22 bytes, consistent
/// data length). Returns the new length.
pub fn to_legacy(raw: &mut BytesMut) -> usize {
    let len = raw[1];
    let rssi = raw[scan::RSSI];

    raw[1] = len - LEGACY_SHRINK as u8;
    raw[3] = 0x00;
    // packet_type, address, address_type, bonding shift right by one to
    // make room for rssi; copy back to front so nothing is clobbered
    raw.copy_within(scan::PACKET_TYPE..=scan::BONDING, HEADER_LEN + 1);
    raw[HEADER_LEN] = rssi;
    raw.copy_within(scan::DATA_LEN.., LEGACY_DATA - 1);

    let n = raw.len() - LEGACY_SHRINK;
    raw.truncate(n);
    debug_assert_eq!(raw[0], TYPE_EVENT);
    n
}

/// AD structures keyed by type, last occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFields(BTreeMap<u8, Vec<u8>>);

impl RawFields {
    pub fn get(&self, ad_type: u8) -> Option<&[u8]> {
        self.0.get(&ad_type).map(Vec::as_slice)
    }

    fn insert(&mut self, ad_type: u8, value: &[u8]) {
        self.0.insert(ad_type, value.to_vec());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Rendered as `"TT:hex TT:hex"`.
impl Serialize for RawFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rendered = self
            .0
            .iter()
            .map(|(ad_type, value)| format!("{:02X}:{}", ad_type, HexBytes(value)))
            .collect::<Vec<_>>()
            .join(" ");
        serializer.serialize_str(&rendered)
    }
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvertisementReport {
    #[serde(rename = "type")]
    pub packet_type: u8,
    #[serde(rename = "addr")]
    pub address: MacAddr,
    #[serde(rename = "rand")]
    pub address_type: u8,
    #[serde(skip)]
    pub bonding: u8,
    pub rssi: i8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<&'static str>,
    /// 0 raw, 1 recognized, 2 decoded.
    pub useful: u8,

    #[serde(rename = "suuid", skip_serializing_if = "Option::is_none")]
    pub service_uuid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub raw: RawFields,

    /// Declared AD lengths or types were invalid; vendor decoding is skipped.
    #[serde(skip)]
    pub malformed: bool,
}

impl AdvertisementReport {
    /// Service data following the 16-bit UUID.
    pub fn service_data(&self) -> Option<&[u8]> {
        self.raw.get(AD_SERVICE_DATA).and_then(|v| v.get(2..))
    }

    /// Manufacturer data following the company id.
    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.raw.get(AD_MANUFACTURER).and_then(|v| v.get(2..))
    }

    fn mark_malformed(&mut self, comment: &'static str) {
        self.malformed = true;
        self.comment = Some(comment);
        self.useful = 0;
    }
}

/// Company id to brand for the manufacturers we commonly see.
pub fn brand(company_id: u16) -> Option<&'static str> {
    match company_id {
        0x0006 => Some("Microsoft"),
        0x004C => Some("Apple"),
        0x0075 => Some("Samsung"),
        0x00E0 => Some("Google"),
        0x0157 => Some("Huami"),
        0x05A7 => Some("Sonos"),
        _ => None,
    }
}

fn valid_ad_type(ad_type: u8) -> bool {
    ad_type != 0 && !(0x2E..=0xFE).contains(&ad_type)
}

/// Parse a legacy scan response. Returns `None` if the fixed part is
/// truncated.
pub fn parse(legacy: &[u8]) -> Option<AdvertisementReport> {
    if legacy.len() < LEGACY_DATA {
        return None;
    }
    let mut report = AdvertisementReport {
        packet_type: legacy[5],
        address: MacAddr::from_wire_slice(&legacy[6..12])?,
        address_type: legacy[12],
        bonding: legacy[13],
        rssi: legacy[4] as i8,
        brand: None,
        comment: None,
        useful: 0,
        service_uuid: None,
        company_id: None,
        name: None,
        raw: RawFields::default(),
        malformed: false,
    };

    let data = &legacy[LEGACY_DATA..];
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + len >= data.len() {
            report.mark_malformed("wrong len");
            break;
        }
        let ad_type = data[i + 1];
        if !valid_ad_type(ad_type) {
            report.mark_malformed("wrong adv type");
            break;
        }
        let value = &data[i + 2..=i + len];
        report.raw.insert(ad_type, value);

        match ad_type {
            AD_SERVICE_DATA if value.len() >= 2 => {
                let uuid = u16::from_le_bytes([value[0], value[1]]);
                report.service_uuid = Some(uuid);
                match uuid {
                    UUID_XIAOMI => {
                        report.brand = Some("Xiaomi".into());
                        report.useful = 1;
                    }
                    UUID_GOOGLE => {
                        report.brand = Some("Google".into());
                        report.useful = 0;
                    }
                    _ => report.useful = 1,
                }
            }
            AD_MANUFACTURER if value.len() >= 2 => {
                let company = u16::from_le_bytes([value[0], value[1]]);
                report.company_id = Some(company);
                report.brand = Some(match brand(company) {
                    Some(name) => name.to_string(),
                    None => format!("0x{:04X}", company),
                });
                report.useful = 1;
            }
            AD_MESH_MESSAGE => {
                report.comment = Some("Mesh Message");
                report.useful = 0;
            }
            AD_MESH_BEACON => {
                report.comment = Some("Mesh Beacon");
                report.useful = 0;
            }
            AD_SHORT_NAME | AD_COMPLETE_NAME => {
                report.name = Some(String::from_utf8_lossy(value).into_owned());
            }
            _ => {}
        }

        i += len + 1;
    }

    Some(report)
}
