//! MiBeacon object (event) table.
//!
//! Event ids `0x1001..` are sensor readings, low ids are lock and security
//! events. Scales are fixed per id; a few products report quirky values and
//! are special-cased by product id.

use serde::Serialize;

use crate::types::serialize_hex;

/// Product ids with special handling.
pub mod product {
    /// LYWSD03MMC and its predecessor report humidity creeping up by 0.1
    /// per advertisement.
    pub const THERMOMETER_903: u16 = 903;
    pub const THERMOMETER_1371: u16 = 1371;
    /// Night Light 2: "illuminance" is really a light on/off indicator.
    pub const NIGHT_LIGHT_2: u16 = 2038;
    /// Qingping motion sensor reports illuminance with each motion event.
    pub const QINGPING_MOTION: u16 = 2691;
}

/// A decoded MiBeacon object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    Button(u8),
    Sleep(u8),
    Rssi(i8),
    Temperature(f32),
    Kettle {
        power: u8,
        temperature: f32,
    },
    Humidity(f32),
    Illuminance(u32),
    Light(u8),
    Moisture(u8),
    Conductivity(u16),
    Battery(u8),
    Climate {
        temperature: f32,
        humidity: f32,
    },
    /// 1 when unlocked.
    Lock(u8),
    /// 1 when open.
    Opening(u8),
    Formaldehyde(f32),
    Supply(u8),
    WaterLeak(u8),
    Smoke(u8),
    Gas(u8),
    IdleTime(u32),
    /// 1 when open.
    Contact(u8),
    Fingerprint {
        action_id: u8,
        key_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<&'static str>,
    },
    Door {
        action_id: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<&'static str>,
    },
    Armed(bool),
    LockAction {
        action_id: u8,
        method_id: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<&'static str>,
        key_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'static str>,
        timestamp: u32,
    },
    Motion {
        #[serde(skip_serializing_if = "Option::is_none")]
        illuminance: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        light: Option<u8>,
    },
    ToothbrushStart {
        counter: u8,
    },
    ToothbrushFinish {
        score: u8,
    },
    /// Unknown id, or a known id with unexpected data.
    Raw(#[serde(serialize_with = "serialize_hex")] Vec<u8>),
}

fn le16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le24(b: &[u8]) -> u32 {
    u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

impl Reading {
    /// Decode object `event_id` carrying `data` from product `product_id`.
    ///
    /// Returns `None` for event id 0, which carries nothing.
    pub fn decode(event_id: u16, data: &[u8], product_id: u16) -> Option<Reading> {
        if event_id == 0 {
            return None;
        }
        Some(decode_known(event_id, data, product_id).unwrap_or_else(|| Reading::Raw(data.to_vec())))
    }
}

fn decode_known(event_id: u16, data: &[u8], product_id: u16) -> Option<Reading> {
    let first = *data.first()?;
    let reading = match (event_id, data.len()) {
        (0x1001, 3) => Reading::Button(first),
        (0x1002, _) => Reading::Sleep(first),
        (0x1003, _) => Reading::Rssi(first as i8),
        (0x1004, 2) => Reading::Temperature(f32::from(le16(data) as i16) / 10.0),
        (0x1005, 2) => Reading::Kettle {
            power: first,
            temperature: f32::from(data[1]),
        },
        (0x1006, 2) => {
            let mut humidity = f32::from(le16(data)) / 10.0;
            if matches!(product_id, product::THERMOMETER_903 | product::THERMOMETER_1371) {
                humidity = humidity.trunc();
            }
            Reading::Humidity(humidity)
        }
        (0x1007, 3) => {
            let lux = le24(data);
            if product_id == product::NIGHT_LIGHT_2 {
                Reading::Light(u8::from(lux >= 100))
            } else {
                Reading::Illuminance(lux)
            }
        }
        (0x1008, _) => Reading::Moisture(first),
        (0x1009, 2) => Reading::Conductivity(le16(data)),
        (0x100A, _) => Reading::Battery(first),
        (0x100D, 4) => Reading::Climate {
            temperature: f32::from(le16(data) as i16) / 10.0,
            humidity: f32::from(le16(&data[2..])) / 10.0,
        },
        (0x100E, _) => Reading::Lock(u8::from(first == 0)),
        (0x100F, _) => Reading::Opening(u8::from(first == 0)),
        (0x1010, 2) => Reading::Formaldehyde(f32::from(le16(data) as i16) / 100.0),
        (0x1012, _) => Reading::Opening(first),
        (0x1013, _) => Reading::Supply(first),
        (0x1014, _) => Reading::WaterLeak(first),
        (0x1015, _) => Reading::Smoke(first),
        (0x1016, _) => Reading::Gas(first),
        (0x1017, 4) => Reading::IdleTime(le32(data)),
        (0x1018, _) => Reading::Light(first),
        (0x1019, _) => match first {
            0 => Reading::Contact(1),
            1 => Reading::Contact(0),
            _ => return None,
        },
        (0x0006, 5) => Reading::Fingerprint {
            action_id: data[4],
            key_id: format!("{:04x}", le32(data)),
            message: fingerprint_message(data[4]),
        },
        (0x0007, _) => Reading::Door {
            action_id: first,
            message: door_message(first),
        },
        (0x0008, _) => Reading::Armed(first > 0),
        (0x000B, n) if n >= 9 => {
            let action_id = first & 0x0F;
            let method_id = first >> 4;
            let key = le32(&data[1..]);
            let error = lock_error(key);
            let key_id = if error.is_none() && method_id > 0 {
                (key & 0xFFFF).to_string()
            } else {
                format!("{:04x}", key)
            };
            Reading::LockAction {
                action_id,
                method_id,
                message: lock_action(action_id),
                method: lock_method(method_id),
                key_id,
                error,
                timestamp: le32(&data[5..]),
            }
        }
        (0x000F, 3) => {
            let value = le24(data);
            if product_id == product::QINGPING_MOTION {
                Reading::Motion {
                    illuminance: Some(value),
                    light: None,
                }
            } else {
                Reading::Motion {
                    illuminance: None,
                    light: Some(u8::from(value >= 100)),
                }
            }
        }
        (0x0010, 2) if first == 0 => Reading::ToothbrushStart { counter: data[1] },
        (0x0010, 2) => Reading::ToothbrushFinish { score: data[1] },
        _ => return None,
    };
    Some(reading)
}

fn fingerprint_message(action_id: u8) -> Option<&'static str> {
    Some(match action_id {
        0 => "Match successful",
        1 => "Match failed",
        2 => "Timeout",
        3 => "Low quality",
        4 => "Insufficient area",
        5 => "Skin is too dry",
        6 => "Skin is too wet",
        _ => return None,
    })
}

fn door_message(action_id: u8) -> Option<&'static str> {
    Some(match action_id {
        0 => "Door is open",
        1 => "Door is closed",
        2 => "Timeout is not closed",
        3 => "Knock on the door",
        4 => "Breaking the door",
        5 => "Door is stuck",
        _ => return None,
    })
}

fn lock_action(action_id: u8) -> Option<&'static str> {
    Some(match action_id {
        0b0000 => "Unlock outside the door",
        0b0001 => "Lock",
        0b0010 => "Turn on anti-lock",
        0b0011 => "Turn off anti-lock",
        0b0100 => "Unlock inside the door",
        0b0101 => "Lock inside the door",
        0b0110 => "Turn on child lock",
        0b0111 => "Turn off child lock",
        0b1111 => "-",
        _ => return None,
    })
}

fn lock_method(method_id: u8) -> Option<&'static str> {
    Some(match method_id {
        0b0000 => "bluetooth",
        0b0001 => "password",
        0b0010 => "biological",
        0b0011 => "key",
        0b0100 => "turntable",
        0b0101 => "nfc",
        0b0110 => "one-time password",
        0b0111 => "two-step verification",
        0b1000 => "coercion",
        0b1010 => "manual",
        0b1011 => "automatic",
        0b1111 => "-",
        _ => return None,
    })
}

fn lock_error(key: u32) -> Option<&'static str> {
    Some(match key {
        0xC0DE0000 => "Frequent unlocking with incorrect password",
        0xC0DE0001 => "Frequent unlocking with wrong fingerprints",
        0xC0DE0002 => "Operation timeout (password input timeout)",
        0xC0DE0003 => "Lock picking",
        0xC0DE0004 => "Reset button is pressed",
        0xC0DE0005 => "The wrong key is frequently unlocked",
        0xC0DE0006 => "Foreign body in the keyhole",
        0xC0DE0007 => "The key has not been taken out",
        0xC0DE0008 => "Error NFC frequently unlocks",
        0xC0DE0009 => "Timeout is not locked as required",
        0xC0DE000A => "Failure to unlock frequently in multiple ways",
        0xC0DE000B => "Unlocking the face frequently fails",
        0xC0DE000C => "Failure to unlock the vein frequently",
        0xC0DE000D => "Hijacking alarm",
        0xC0DE000E => "Unlock inside the door after arming",
        0xC0DE000F => "Palmprints frequently fail to unlock",
        0xC0DE0010 => "The safe was moved",
        0xC0DE1000 => "The battery level is less than 10%",
        0xC0DE1001 => "The battery is less than 5%",
        0xC0DE1002 => "The fingerprint sensor is abnormal",
        0xC0DE1003 => "The accessory battery is low",
        0xC0DE1004 => "Mechanical failure",
        _ => return None,
    })
}
