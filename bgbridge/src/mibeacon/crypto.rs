//! MiBeacon payload decryption.
//!
//! Both generations use AES-128 CCM with associated data `0x11`:
//!
//! - v2/v3: 12-byte bind key stretched to 16 bytes, 13-byte nonce, and no
//!   usable tag (the 1-byte trailer is not a CCM tag). CCM without a tag is
//!   plain CTR with counter blocks `0x01 || nonce || i`, starting at `i = 1`.
//! - v4/v5: 16-byte bind key, 12-byte nonce, 4-byte tag.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U12, U4};
use ccm::Ccm;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

type MiBeaconCcm = Ccm<Aes128, U4, U12>;
type LegacyCtr = ctr::Ctr128BE<Aes128>;

const AAD: [u8; 1] = [0x11];

/// Inserted between the halves of a v2/v3 bind key.
const LEGACY_KEY_FILLER: [u8; 4] = [0x8D, 0x3D, 0x3C, 0x97];

/// CCM flags byte for a 13-byte nonce (L = 2).
const LEGACY_CTR_FLAGS: u8 = 0x01;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    #[error("Payload too short for version {0} encryption")]
    TooShort(u8),

    #[error("Bind key is {actual} bytes, need {expected}")]
    KeyLength { expected: usize, actual: usize },

    #[error("Authentication tag mismatch")]
    Authentication,

    #[error("Unsupported MiBeacon version {0}")]
    UnsupportedVersion(u8),
}

/// Decrypt the payload starting at `pos` of a full MiBeacon service data
/// buffer.
pub fn decrypt(version: u8, data: &[u8], pos: usize, key: &[u8]) -> Result<Vec<u8>, DecryptError> {
    match version {
        2 | 3 => decrypt_legacy(data, pos, key),
        4 | 5 => decrypt_ccm(data, pos, key),
        other => Err(DecryptError::UnsupportedVersion(other)),
    }
}

/// v2/v3: `... ciphertext ext_counter[3] trailer[1]`.
fn decrypt_legacy(data: &[u8], pos: usize, key: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let len = data.len();
    if len < pos + 4 {
        return Err(DecryptError::TooShort(3));
    }
    if key.len() < 12 {
        return Err(DecryptError::KeyLength {
            expected: 12,
            actual: key.len(),
        });
    }

    let mut full_key = [0u8; 16];
    full_key[..6].copy_from_slice(&key[..6]);
    full_key[6..10].copy_from_slice(&LEGACY_KEY_FILLER);
    full_key[10..].copy_from_slice(&key[6..12]);

    // frame control, product id, seq | ext counter | mac[0..5]
    let mut iv = [0u8; 16];
    iv[0] = LEGACY_CTR_FLAGS;
    iv[1..6].copy_from_slice(&data[0..5]);
    iv[6..9].copy_from_slice(&data[len - 4..len - 1]);
    iv[9..14].copy_from_slice(&data[5..10]);
    iv[15] = 1;

    let mut plain = data[pos..len - 4].to_vec();
    let mut cipher = LegacyCtr::new_from_slices(&full_key, &iv).map_err(|_| DecryptError::KeyLength {
        expected: 16,
        actual: full_key.len(),
    })?;
    cipher.apply_keystream(&mut plain);
    Ok(plain)
}

/// v4/v5: `... ciphertext rand[3] tag[4]`.
fn decrypt_ccm(data: &[u8], pos: usize, key: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let len = data.len();
    if len < pos + 7 || len < 11 {
        return Err(DecryptError::TooShort(5));
    }
    let cipher = MiBeaconCcm::new_from_slice(key).map_err(|_| DecryptError::KeyLength {
        expected: 16,
        actual: key.len(),
    })?;

    // mac | product id, seq | rand
    let mut nonce = [0u8; 12];
    nonce[..6].copy_from_slice(&data[5..11]);
    nonce[6..9].copy_from_slice(&data[2..5]);
    nonce[9..].copy_from_slice(&data[len - 7..len - 4]);

    let mut plain = data[pos..len - 7].to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            &AAD,
            &mut plain,
            GenericArray::from_slice(&data[len - 4..]),
        )
        .map_err(|_| DecryptError::Authentication)?;
    Ok(plain)
}
