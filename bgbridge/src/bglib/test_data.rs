//! Frame builders shared by tests across the crate.

use super::protocol::{scan, TYPE_EVENT};

/// Build a raw `evt_le_gap_extended_scan_response` frame carrying `data` as
/// the advertising payload.
pub(crate) fn scan_response(address: [u8; 6], rssi: u8, channel: u8, data: &[u8]) -> Vec<u8> {
    let mut raw = vec![TYPE_EVENT, (18 + data.len()) as u8, 0x03, 0x04];
    raw.push(0x00); // packet_type
    raw.extend_from_slice(&address);
    raw.push(0x00); // address_type
    raw.push(0xFF); // bonding
    raw.push(0x01); // primary_phy
    raw.push(0x00); // secondary_phy
    raw.push(scan::SENTINEL);
    raw.push(0x7F); // tx_power
    raw.push(rssi);
    raw.push(channel);
    raw.extend_from_slice(&[0x00, 0x00]); // periodic_interval
    raw.push(data.len() as u8);
    raw.extend_from_slice(data);
    raw
}

/// Address used by most fixtures, wire order.
pub(crate) const ADDRESS: [u8; 6] = [0xF4, 0x83, 0x02, 0x38, 0xC1, 0xA4];
