//! Chunk wire format: a versioned container carrying a compressed and/or
//! encrypted payload plus an integrity hash over the plaintext.
//!
//! ```text
//! Version(1) Index(4,LE) IsCompressed(1) IsEncrypted(1) OriginalSize(4,LE)
//! StoredSize(4,LE) Body(StoredSize) HashAlgoId(1) Hash(16)
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use md5::{Digest, Md5};

use crate::error::CodecError;

pub const CHUNK_VERSION: u8 = 0x01;
pub const HASH_ALGO_MD5: u8 = 0x01;
pub const HASH_LEN: usize = 16;
pub const HEADER_LEN: usize = 15;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

const LZ4_HC_LEVEL: i32 = 6;

pub type EncryptionKey = [u8; 32];

/// A chunk that has been fully decoded: plaintext payload plus the header
/// fields the caller needs back (chunk index within its file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    pub payload: Vec<u8>,
    pub index: u32,
    pub hash: [u8; HASH_LEN],
}

/// Worst-case LZ4 expansion for an input of `n` bytes.
pub fn lz4_max_expansion(n: usize) -> usize {
    n / 255 + 16
}

/// Largest plaintext payload that, once encoded, is guaranteed to fit within
/// `max_attachment_size` bytes.
pub fn chunk_data_size(max_attachment_size: usize) -> usize {
    max_attachment_size.saturating_sub(lz4_max_expansion(max_attachment_size) + 256)
}

pub fn encode(
    payload: &[u8],
    index: u32,
    encryption_key: Option<&EncryptionKey>,
    compress: bool,
) -> Vec<u8> {
    let hash = md5_hash(payload);

    let (is_compressed, original_size, compressed) = if compress {
        let compressed = lz4_compress(payload);
        (true, payload.len() as u32, compressed)
    } else {
        (false, payload.len() as u32, payload.to_vec())
    };

    let (is_encrypted, body) = match encryption_key {
        Some(key) => (true, aes_encrypt(key, &compressed)),
        None => (false, compressed),
    };

    let stored_size = body.len() as u32;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + 1 + HASH_LEN);
    out.push(CHUNK_VERSION);
    out.extend_from_slice(&index.to_le_bytes());
    out.push(is_compressed as u8);
    out.push(is_encrypted as u8);
    out.extend_from_slice(&original_size.to_le_bytes());
    out.extend_from_slice(&stored_size.to_le_bytes());
    out.extend_from_slice(&body);
    out.push(HASH_ALGO_MD5);
    out.extend_from_slice(&hash);
    out
}

pub fn decode(
    bytes: &[u8],
    encryption_key: Option<&EncryptionKey>,
) -> Result<DecodedChunk, CodecError> {
    need(bytes, HEADER_LEN)?;

    let version = bytes[0];
    if version != CHUNK_VERSION {
        return Err(CodecError::UnsupportedChunkVersion(version));
    }
    let index = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
    let is_compressed = bytes[5] != 0;
    let is_encrypted = bytes[6] != 0;
    let original_size = u32::from_le_bytes(bytes[7..11].try_into().unwrap());
    let stored_size = u32::from_le_bytes(bytes[11..15].try_into().unwrap()) as usize;

    let body_start = HEADER_LEN;
    let body_end = body_start + stored_size;
    need(bytes, body_end + 1 + HASH_LEN)?;
    let body = &bytes[body_start..body_end];

    let hash_algo = bytes[body_end];
    if hash_algo != HASH_ALGO_MD5 {
        return Err(CodecError::UnknownHashAlgorithm(hash_algo));
    }
    let mut stored_hash = [0u8; HASH_LEN];
    stored_hash.copy_from_slice(&bytes[body_end + 1..body_end + 1 + HASH_LEN]);

    let decrypted = if is_encrypted {
        let key = encryption_key.ok_or(CodecError::DecryptionFailed)?;
        aes_decrypt(key, body).ok_or(CodecError::DecryptionFailed)?
    } else {
        body.to_vec()
    };

    let payload = if is_compressed {
        lz4_decompress(&decrypted, original_size)?
    } else {
        decrypted
    };

    if payload.len() as u32 != original_size {
        return Err(CodecError::DecompressionSizeMismatch {
            expected: original_size,
            actual: payload.len() as u32,
        });
    }

    let computed_hash = md5_hash(&payload);
    if computed_hash != stored_hash {
        return Err(CodecError::HashMismatch);
    }

    Ok(DecodedChunk {
        payload,
        index,
        hash: stored_hash,
    })
}

fn need(bytes: &[u8], len: usize) -> Result<(), CodecError> {
    if bytes.len() < len {
        Err(CodecError::Truncated {
            needed: len,
            have: bytes.len(),
        })
    } else {
        Ok(())
    }
}

fn md5_hash(payload: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Md5::new();
    hasher.update(payload);
    hasher.finalize().into()
}

fn lz4_compress(payload: &[u8]) -> Vec<u8> {
    lz4::block::compress(
        payload,
        Some(lz4::block::CompressionMode::HIGHCOMPRESSION(LZ4_HC_LEVEL)),
        false,
    )
    .expect("lz4 block compression is infallible for in-memory buffers")
}

fn lz4_decompress(body: &[u8], original_size: u32) -> Result<Vec<u8>, CodecError> {
    lz4::block::decompress(body, Some(original_size as i32)).map_err(|_| {
        CodecError::DecompressionSizeMismatch {
            expected: original_size,
            actual: 0,
        }
    })
}

fn aes_encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; GCM_IV_LEN];
    getrandom::getrandom(&mut iv).expect("system RNG must be available");
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM encryption over an in-memory buffer cannot fail");

    let mut out = Vec::with_capacity(GCM_IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

fn aes_decrypt(key: &EncryptionKey, body: &[u8]) -> Option<Vec<u8>> {
    if body.len() < GCM_IV_LEN + GCM_TAG_LEN {
        return None;
    }
    let (iv, ciphertext) = body.split_at(GCM_IV_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    cipher.decrypt(nonce, ciphertext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain() {
        let payload = b"hello chat filesystem".to_vec();
        let encoded = encode(&payload, 7, None, true);
        let decoded = decode(&encoded, None).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.index, 7);
    }

    #[test]
    fn round_trip_encrypted() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let key: EncryptionKey = [9u8; 32];
        let encoded = encode(&payload, 42, Some(&key), true);
        let decoded = decode(&encoded, Some(&key)).unwrap();
        assert_eq!(decoded.payload, payload);
        assert!(encoded.len() < payload.len());
    }

    #[test]
    fn round_trip_uncompressed() {
        let payload = vec![0xABu8; 64];
        let encoded = encode(&payload, 0, None, false);
        let decoded = decode(&encoded, None).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn tampered_hash_is_rejected() {
        let payload = b"integrity matters".to_vec();
        let mut encoded = encode(&payload, 1, None, false);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let err = decode(&encoded, None).unwrap_err();
        assert_eq!(err, CodecError::HashMismatch);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let payload = b"secret bytes".to_vec();
        let key: EncryptionKey = [1u8; 32];
        let other: EncryptionKey = [2u8; 32];
        let encoded = encode(&payload, 0, Some(&key), false);
        let err = decode(&encoded, Some(&other)).unwrap_err();
        assert_eq!(err, CodecError::DecryptionFailed);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let err = decode(&[0x01, 0x00], None).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut encoded = encode(b"x", 0, None, false);
        encoded[0] = 0x02;
        let err = decode(&encoded, None).unwrap_err();
        assert_eq!(err, CodecError::UnsupportedChunkVersion(0x02));
    }

    #[test]
    fn chunk_data_size_leaves_room_for_expansion() {
        let max = 8 * 1024 * 1024;
        let size = chunk_data_size(max);
        assert!(size + lz4_max_expansion(size) + 256 <= max);
    }
}
