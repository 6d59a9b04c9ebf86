//! Crypto primitives for filename obfuscation
//!
//! Segment obfuscation uses AES-256 in CFB mode without padding, so the
//! ciphertext is exactly as long as the plaintext. The IV for a segment is
//! content-addressed: a SHA-1 digest of segment bytes and key bytes,
//! truncated to the cipher block size. The same digest (over the ciphertext
//! instead of the plaintext) keys the IV pool, so a reader can recover the
//! IV without knowing the plaintext in advance.

use crate::error::{Error, Result};
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes256;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use ring::digest;
use zeroize::Zeroizing;

/// Share and obfuscation key size in bytes (AES-256)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Cipher block size; also the IV length for segment obfuscation
pub const BLOCK_SIZE: usize = 16;

/// Lookup/IV digest output size in bytes (SHA-1)
pub const LOOKUP_HASH_SIZE: usize = 20;

type CfbEnc = cfb_mode::Encryptor<Aes256>;
type CfbDec = cfb_mode::Decryptor<Aes256>;

/// Symmetric key material, zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; SYMMETRIC_KEY_SIZE]>);

impl SymmetricKey {
    /// Wrap raw key bytes. Fails if the length is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SYMMETRIC_KEY_SIZE {
            return Err(Error::KeyNotFound(format!(
                "key material is {} bytes, expected {}",
                bytes.len(),
                SYMMETRIC_KEY_SIZE
            )));
        }
        let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(SymmetricKey(key))
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
        rand::thread_rng().fill_bytes(key.as_mut());
        SymmetricKey(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ref() == other.0.as_ref()
    }
}

impl Eq for SymmetricKey {}

fn sha1_over(parts: &[&[u8]]) -> [u8; LOOKUP_HASH_SIZE] {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; LOOKUP_HASH_SIZE];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// Lookup hash for the IV pool: `SHA1(ciphertext_segment || key)`
pub fn lookup_hash(obfuscated_segment: &str, key: &SymmetricKey) -> [u8; LOOKUP_HASH_SIZE] {
    sha1_over(&[obfuscated_segment.as_bytes(), key.as_bytes()])
}

/// Content-addressed IV: `SHA1(segment || key)` truncated to the block size
pub fn derive_iv(segment: &str, key: &SymmetricKey) -> [u8; BLOCK_SIZE] {
    let hash = sha1_over(&[segment.as_bytes(), key.as_bytes()]);
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&hash[..BLOCK_SIZE]);
    iv
}

/// Encrypt a segment's UTF-8 bytes under `(key, iv)`. Ciphertext length
/// equals plaintext length (stream mode, no padding).
pub fn encrypt_segment(segment: &str, key: &SymmetricKey, iv: &[u8]) -> Result<Vec<u8>> {
    let enc = CfbEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| Error::Obfuscation(format!("cipher init failed: {e}")))?;
    let mut buf = segment.as_bytes().to_vec();
    enc.encrypt(&mut buf);
    Ok(buf)
}

/// Decrypt segment bytes and decode them as UTF-8
pub fn decrypt_segment(ciphertext: &[u8], key: &SymmetricKey, iv: &[u8]) -> Result<String> {
    let dec = CfbDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| Error::Obfuscation(format!("cipher init failed: {e}")))?;
    let mut buf = ciphertext.to_vec();
    dec.decrypt(&mut buf);
    String::from_utf8(buf)
        .map_err(|_| Error::Obfuscation("decrypted segment is not valid UTF-8".into()))
}

/// Encode ciphertext as an unpadded URL-safe base64 path segment.
/// Segments become backend path components and must avoid `+`, `/` and `=`.
pub fn encode_segment(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode an unpadded URL-safe base64 path segment
pub fn decode_segment(segment: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::Obfuscation(format!("invalid base64 segment '{segment}': {e}")))
}

/// Uppercase hex, the encoding used for IV pool entry names
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode hex regardless of case
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.to_ascii_lowercase())
        .map_err(|e| Error::Obfuscation(format!("invalid hex '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_cipher_round_trip() {
        let key = SymmetricKey::generate();
        let iv = derive_iv("report.txt", &key);
        let ct = encrypt_segment("report.txt", &key, &iv).unwrap();
        assert_eq!(ct.len(), "report.txt".len());
        let pt = decrypt_segment(&ct, &key, &iv).unwrap();
        assert_eq!(pt, "report.txt");
    }

    #[test]
    fn test_iv_is_content_addressed() {
        let key = SymmetricKey::generate();
        assert_eq!(derive_iv("a.txt", &key), derive_iv("a.txt", &key));
        assert_ne!(derive_iv("a.txt", &key), derive_iv("b.txt", &key));

        let other = SymmetricKey::generate();
        assert_ne!(derive_iv("a.txt", &key), derive_iv("a.txt", &other));
    }

    #[test]
    fn test_encoding_is_url_safe_and_unpadded() {
        // 16 arbitrary bytes would need padding in plain base64
        let bytes: Vec<u8> = (0u8..16).collect();
        let encoded = encode_segment(&bytes);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_segment(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_hex_round_trip() {
        let iv = [0xABu8; BLOCK_SIZE];
        let s = to_hex(&iv);
        assert_eq!(s.len(), 2 * BLOCK_SIZE);
        assert_eq!(s, s.to_ascii_uppercase());
        assert_eq!(from_hex(&s).unwrap(), iv.to_vec());
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(SymmetricKey::from_bytes(&[0u8; 16]).is_err());
        assert!(SymmetricKey::from_bytes(&[0u8; 32]).is_ok());
    }
}
