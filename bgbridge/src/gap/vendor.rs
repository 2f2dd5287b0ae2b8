//! Vendor dispatch over a parsed advertisement.

use serde::Serialize;

use super::parsers::{self, IBeacon, ScaleReading, Thermometer};
use super::report::{AdvertisementReport, UUID_XIAOMI};
use crate::keys::KeyProvider;
use crate::mibeacon::{self, MiBeacon, Reading, Usefulness};

pub const UUID_ATC1441: u16 = 0x181A;
pub const UUID_MI_SCALE_V2: u16 = 0x181B;
pub const UUID_MI_SCALE_V1: u16 = 0x181D;

pub const COMPANY_APPLE: u16 = 0x004C;
pub const COMPANY_NUT: u16 = 0x00D2;
pub const COMPANY_HUAMI: u16 = 0x0157;

/// Devices only useful for presence detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackerKind {
    #[serde(rename = "ibeacon")]
    IBeacon,
    #[serde(rename = "nut")]
    Nut,
    #[serde(rename = "miband")]
    MiBand,
}

/// Decoded service data payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "vendor", rename_all = "snake_case")]
pub enum Vendor {
    Atc1441(Thermometer),
    MiScaleV1(ScaleReading),
    MiScaleV2(ScaleReading),
    #[serde(rename = "mibeacon")]
    MiBeacon {
        beacon: MiBeacon,
        #[serde(skip_serializing_if = "Option::is_none")]
        reading: Option<Reading>,
        #[serde(skip)]
        usefulness: Usefulness,
    },
}

/// Presence-only device recognized from manufacturer data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tracker {
    pub kind: TrackerKind,
    pub id: String,
    pub rssi: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ibeacon: Option<IBeacon>,
}

/// Everything recognized in one advertisement. Service data and
/// manufacturer data are decoded independently.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub vendor: Option<Vendor>,
    pub tracker: Option<Tracker>,
}

fn from_service_data(report: &AdvertisementReport, keys: &dyn KeyProvider) -> Option<Vendor> {
    let data = report.service_data()?;
    match report.service_uuid? {
        UUID_ATC1441 => parsers::parse_atc1441(data).map(Vendor::Atc1441),
        UUID_MI_SCALE_V2 => parsers::parse_mi_scale_v2(data).map(Vendor::MiScaleV2),
        UUID_MI_SCALE_V1 => parsers::parse_mi_scale_v1(data).map(Vendor::MiScaleV1),
        UUID_XIAOMI => {
            let (beacon, usefulness) = mibeacon::decode(data, keys);
            let reading = match usefulness {
                Usefulness::Decoded => beacon.reading(),
                _ => None,
            };
            Some(Vendor::MiBeacon {
                beacon,
                reading,
                usefulness,
            })
        }
        _ => None,
    }
}

fn from_manufacturer_data(report: &AdvertisementReport) -> Option<Tracker> {
    let by_address = |kind| Tracker {
        kind,
        id: report.address.to_string(),
        rssi: report.rssi,
        ibeacon: None,
    };
    match report.company_id? {
        COMPANY_APPLE => {
            let beacon = parsers::parse_ibeacon(report.manufacturer_data()?)?;
            Some(Tracker {
                kind: TrackerKind::IBeacon,
                id: beacon.id(),
                rssi: report.rssi,
                ibeacon: Some(beacon),
            })
        }
        COMPANY_NUT => Some(by_address(TrackerKind::Nut)),
        // Mi Band / Amazfit: payload unknown, presence only
        COMPANY_HUAMI => Some(by_address(TrackerKind::MiBand)),
        _ => None,
    }
}

/// Decode the vendor payloads of a well-formed report and update its
/// usefulness.
pub fn decode(report: &mut AdvertisementReport, keys: &dyn KeyProvider) -> Decoded {
    let decoded = Decoded {
        vendor: from_service_data(report, keys),
        tracker: from_manufacturer_data(report),
    };
    let level = match &decoded.vendor {
        // Encrypted beacons keep the "recognized" level from the report
        Some(Vendor::MiBeacon { usefulness, .. }) if *usefulness != Usefulness::Encrypted => {
            Some(*usefulness as u8)
        }
        Some(Vendor::MiBeacon { .. }) | None => None,
        Some(_) => Some(Usefulness::Decoded as u8),
    };
    let tracker = decoded.tracker.as_ref().map(|_| Usefulness::Decoded as u8);
    if let Some(level) = level.max(tracker) {
        report.useful = level;
    }
    decoded
}
