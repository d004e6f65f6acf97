//! AES-CBC decryption and KeyMap access.
//!
//! The archive encrypts metadata regions with per-region keys and every bulk
//! block with a key drawn from the KeyMap table. Both paths go through
//! [`decrypt_cbc`], which strips PKCS#7 padding only when the tail actually
//! is valid padding: metadata regions are padded, block payloads generally
//! are not, and the format gives no flag to tell them apart.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::error::NtpiError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const AES_BLOCK: usize = 16;

/// Width of one KeyMap entry.
pub const KEYMAP_KEY_LEN: usize = 32;

/// AES-CBC decrypt `ciphertext` with `key` and `iv`.
///
/// `key` must be 16, 24 or 32 bytes, `iv` exactly 16, and the ciphertext a
/// multiple of the AES block size. The decrypted buffer has PKCS#7 padding
/// removed when its tail forms valid padding; otherwise it is returned
/// unchanged — an invalid tail is not an error.
pub fn decrypt_cbc(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, NtpiError> {
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(NtpiError::Crypto(format!(
            "invalid key size: {} (must be 16, 24, or 32)",
            key.len()
        )));
    }
    if iv.len() != AES_BLOCK {
        return Err(NtpiError::Crypto(format!(
            "invalid IV size: {} (must be 16)",
            iv.len()
        )));
    }
    if ciphertext.len() % AES_BLOCK != 0 {
        return Err(NtpiError::Crypto(format!(
            "ciphertext size {} is not a multiple of the AES block size",
            ciphertext.len()
        )));
    }

    let mut buf = ciphertext.to_vec();
    let cipher_err = |_| NtpiError::Crypto("AES-CBC decryption failed".into());
    match key.len() {
        16 => {
            Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|e| NtpiError::Crypto(e.to_string()))?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(cipher_err)?;
        }
        24 => {
            Aes192CbcDec::new_from_slices(key, iv)
                .map_err(|e| NtpiError::Crypto(e.to_string()))?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(cipher_err)?;
        }
        _ => {
            Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|e| NtpiError::Crypto(e.to_string()))?
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(cipher_err)?;
        }
    }

    strip_pkcs7(&mut buf);
    Ok(buf)
}

/// Remove PKCS#7 padding in place when — and only when — the tail is valid.
fn strip_pkcs7(buf: &mut Vec<u8>) {
    let Some(&last) = buf.last() else { return };
    let pad = last as usize;
    if pad == 0 || pad > AES_BLOCK || pad > buf.len() {
        return;
    }
    if buf[buf.len() - pad..].iter().all(|&b| b == last) {
        buf.truncate(buf.len() - pad);
    }
}

/// Extract the 32-byte AES key at `index` from the KeyMap table.
///
/// The table is conceptually indexed modulo its length: the byte offset is
/// `(index * 32) mod len`, and a key that starts near the end of the table
/// wraps around to its beginning. The table length is not required to be a
/// multiple of 32.
pub fn extract_key(table: &[u8], index: u64) -> Result<[u8; KEYMAP_KEY_LEN], NtpiError> {
    if table.is_empty() {
        return Err(NtpiError::Crypto("keymap table is empty".into()));
    }

    let offset = ((index as u128 * KEYMAP_KEY_LEN as u128) % table.len() as u128) as usize;
    let mut key = [0u8; KEYMAP_KEY_LEN];
    if offset + KEYMAP_KEY_LEN <= table.len() {
        key.copy_from_slice(&table[offset..offset + KEYMAP_KEY_LEN]);
    } else {
        let head = table.len() - offset;
        key[..head].copy_from_slice(&table[offset..]);
        key[head..].copy_from_slice(&table[..KEYMAP_KEY_LEN - head]);
    }
    Ok(key)
}
