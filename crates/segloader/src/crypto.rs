//! AES-128 segment decryption and the per-loader key cache.

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use moka::sync::Cache;
use tracing::trace;

use crate::error::DecryptError;
use crate::playlist::KeyDescriptor;

/// AES-128 keys are 16 bytes.
pub const KEY_LENGTH: usize = 16;

const KEY_CACHE_CAPACITY: u64 = 64;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub fn parse_iv(iv_hex_str: &str) -> Result<[u8; 16], DecryptError> {
    let iv_str = iv_hex_str
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mut iv_bytes = [0u8; 16];
    hex::decode_to_slice(iv_str, &mut iv_bytes).map_err(|e| DecryptError::InvalidIv {
        iv: iv_hex_str.to_string(),
        reason: e.to_string(),
    })?;
    Ok(iv_bytes)
}

/// IV for keys without an explicit one: the media sequence number as a
/// 128-bit big-endian integer.
pub fn iv_from_sequence(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

/// Explicit IV of the key, or the one derived from the segment's media sequence.
pub fn segment_iv(key: &KeyDescriptor, media_sequence: u64) -> Result<[u8; 16], DecryptError> {
    match &key.iv {
        Some(iv) => parse_iv(iv),
        None => Ok(iv_from_sequence(media_sequence)),
    }
}

/// AES-128-CBC with PKCS#7 padding.
pub fn decrypt_aes128_cbc(data: &[u8], key: &[u8], iv: &[u8; 16]) -> Result<Bytes, DecryptError> {
    if key.len() != KEY_LENGTH {
        return Err(DecryptError::KeyLength(key.len()));
    }

    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| DecryptError::Cipher(format!("Failed to initialize AES decryptor: {e}")))?;

    let decrypted_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| DecryptError::Cipher(e.to_string()))?
        .len();

    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}

/// Raw key bytes by resolved key uri. Lives as long as its loader; playlist
/// changes leave it untouched.
pub struct KeyCache {
    enabled: bool,
    cache: Cache<String, Bytes>,
}

impl KeyCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            cache: Cache::new(KEY_CACHE_CAPACITY),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, uri: &str) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }
        let hit = self.cache.get(uri);
        trace!(uri, hit = hit.is_some(), "Key cache lookup");
        hit
    }

    pub fn insert(&self, uri: &str, key: Bytes) {
        if self.enabled {
            self.cache.insert(uri.to_string(), key);
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use cipher::BlockEncryptMut;

    use super::*;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plain: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let mut buffer = vec![0u8; (plain.len() / 16 + 1) * 16];
        buffer[..plain.len()].copy_from_slice(plain);
        let len = Aes128CbcEnc::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plain.len())
            .unwrap()
            .len();
        buffer.truncate(len);
        buffer
    }

    #[test]
    fn test_decrypt_round_trip() {
        let key = [7u8; 16];
        let iv = iv_from_sequence(42);
        let plain = b"transport stream payload".to_vec();
        let cipher_text = encrypt(&plain, &key, &iv);
        let decrypted = decrypt_aes128_cbc(&cipher_text, &key, &iv).unwrap();
        assert_eq!(decrypted.as_ref(), plain.as_slice());
    }

    #[test]
    fn test_rejects_short_key() {
        let err = decrypt_aes128_cbc(&[0u8; 16], &[1u8; 8], &[0u8; 16]).unwrap_err();
        assert_eq!(err, DecryptError::KeyLength(8));
    }

    #[test]
    fn test_iv_from_sequence_is_big_endian() {
        let iv = iv_from_sequence(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    #[test]
    fn test_explicit_iv_wins() {
        let key = KeyDescriptor {
            uri: "k".into(),
            iv: Some("0x000102030405060708090a0b0c0d0e0f".into()),
        };
        let iv = segment_iv(&key, 99).unwrap();
        assert_eq!(iv[15], 0x0f);
        let bad = KeyDescriptor {
            uri: "k".into(),
            iv: Some("0xzz".into()),
        };
        assert!(matches!(segment_iv(&bad, 0), Err(DecryptError::InvalidIv { .. })));
    }

    #[test]
    fn test_key_cache() {
        let cache = KeyCache::new(true);
        cache.insert("https://k", Bytes::from_static(&[1; 16]));
        assert!(cache.get("https://k").is_some());
        cache.clear();
        assert!(cache.get("https://k").is_none());

        let disabled = KeyCache::new(false);
        disabled.insert("https://k", Bytes::from_static(&[1; 16]));
        assert!(disabled.get("https://k").is_none());
    }
}
