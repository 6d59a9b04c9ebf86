//! Encrypted file content
//!
//! File bodies are sealed in fixed-size plaintext chunks with AES-256-GCM.
//! Every stored chunk is `nonce || ciphertext || tag`, and a fresh random
//! nonce is drawn on every reseal, so rewriting a chunk never reuses a
//! nonce under the same key. A small plaintext header records which share
//! key generation sealed the file, so readers can resolve the right key
//! after a rotation.

use crate::backend::BackendFile;
use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use crate::keys::ShareKey;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};

/// File header magic
pub const FILE_MAGIC: [u8; 8] = *b"SHROUD\x00\x01";

/// Header: magic, key version (LE u32), 4 reserved bytes
pub const HEADER_LEN: u64 = 16;

/// Plaintext bytes per chunk
pub const CHUNK_SIZE: usize = 4096;

const TAG_LEN: usize = 16;

/// Stored bytes per full chunk
const STORED_CHUNK: usize = NONCE_LEN + CHUNK_SIZE + TAG_LEN;

const CHUNK_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Plaintext length of a file given its stored length. Lets directory
/// listings report logical sizes without opening and unsealing files.
pub fn plaintext_len(stored: u64) -> u64 {
    let body = stored.saturating_sub(HEADER_LEN);
    let full = body / STORED_CHUNK as u64;
    let rem = body % STORED_CHUNK as u64;
    full * CHUNK_SIZE as u64 + rem.saturating_sub(CHUNK_OVERHEAD as u64)
}

/// One open encrypted file
pub struct CryptoFile {
    file: Box<dyn BackendFile>,
    sealer: LessSafeKey,
    key_version: u32,
}

fn sealer_for(key: &SymmetricKey) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&aead::AES_256_GCM, key.as_bytes())
        .map_err(|_| Error::Crypto("content key rejected by AEAD".into()))?;
    Ok(LessSafeKey::new(unbound))
}

impl CryptoFile {
    /// Initialize a freshly created backend file under the given share key
    /// generation. Writes the header immediately.
    pub fn create(file: Box<dyn BackendFile>, share_key: &ShareKey) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN as usize];
        header[..8].copy_from_slice(&FILE_MAGIC);
        header[8..12].copy_from_slice(&share_key.version.to_le_bytes());
        file.write_at(&header, 0)?;
        Ok(CryptoFile {
            file,
            sealer: sealer_for(&share_key.key)?,
            key_version: share_key.version,
        })
    }

    /// Open an existing encrypted file. The header names the key generation
    /// that sealed the content; `resolve` turns it into key material.
    pub fn open(
        file: Box<dyn BackendFile>,
        resolve: impl FnOnce(u32) -> Result<SymmetricKey>,
    ) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN as usize];
        let n = read_stored(file.as_ref(), &mut header, 0)?;
        if n < HEADER_LEN as usize || header[..8] != FILE_MAGIC {
            return Err(Error::BadFileFormat("missing or short file header".into()));
        }
        let key_version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let key = resolve(key_version)?;
        Ok(CryptoFile {
            file,
            sealer: sealer_for(&key)?,
            key_version,
        })
    }

    /// Key generation this file's content is sealed under
    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    /// Logical (plaintext) length
    pub fn len(&self) -> Result<u64> {
        Ok(plaintext_len(self.file.len()?))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let plain_len = self.len()?;
        if offset >= plain_len || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((plain_len - offset) as usize);
        let mut done = 0;
        while done < want {
            let pos = offset + done as u64;
            let idx = pos / CHUNK_SIZE as u64;
            let in_off = (pos % CHUNK_SIZE as u64) as usize;
            let chunk = self
                .read_chunk(idx)?
                .ok_or_else(|| Error::BadFileFormat("chunk missing inside file body".into()))?;
            let n = (want - done).min(chunk.len().saturating_sub(in_off));
            if n == 0 {
                break;
            }
            buf[done..done + n].copy_from_slice(&chunk[in_off..in_off + n]);
            done += n;
        }
        Ok(done)
    }

    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let cur = self.len()?;
        if offset > cur {
            self.zero_fill(cur, offset)?;
        }
        self.write_at_inner(buf, offset)?;
        Ok(buf.len())
    }

    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        let cur = self.len()?;
        if new_len == cur {
            return Ok(());
        }
        if new_len > cur {
            return self.zero_fill(cur, new_len);
        }
        let full = new_len / CHUNK_SIZE as u64;
        let rem = (new_len % CHUNK_SIZE as u64) as usize;
        if rem == 0 {
            self.file.set_len(HEADER_LEN + full * STORED_CHUNK as u64)?;
        } else {
            let mut chunk = self
                .read_chunk(full)?
                .ok_or_else(|| Error::BadFileFormat("chunk missing inside file body".into()))?;
            chunk.truncate(rem);
            // Drop the tail, then reseal the now-partial last chunk
            self.file.set_len(HEADER_LEN + full * STORED_CHUNK as u64)?;
            self.write_chunk(full, &chunk)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    fn zero_fill(&mut self, from: u64, to: u64) -> Result<()> {
        let zeros = [0u8; CHUNK_SIZE];
        let mut pos = from;
        while pos < to {
            let n = ((to - pos) as usize).min(CHUNK_SIZE);
            self.write_at_inner(&zeros[..n], pos)?;
            pos += n as u64;
        }
        Ok(())
    }

    // write_at without the gap check, used by zero_fill to avoid recursion
    fn write_at_inner(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let mut src = buf;
        let mut pos = offset;
        while !src.is_empty() {
            let idx = pos / CHUNK_SIZE as u64;
            let in_off = (pos % CHUNK_SIZE as u64) as usize;
            let mut chunk = self.read_chunk(idx)?.unwrap_or_default();
            let n = (CHUNK_SIZE - in_off).min(src.len());
            if chunk.len() < in_off + n {
                chunk.resize(in_off + n, 0);
            }
            chunk[in_off..in_off + n].copy_from_slice(&src[..n]);
            self.write_chunk(idx, &chunk)?;
            src = &src[n..];
            pos += n as u64;
        }
        Ok(())
    }

    /// Unsealed plaintext of chunk `idx`, or None past the end of file
    fn read_chunk(&self, idx: u64) -> Result<Option<Vec<u8>>> {
        let stored_off = HEADER_LEN + idx * STORED_CHUNK as u64;
        let mut stored = vec![0u8; STORED_CHUNK];
        let n = read_stored(self.file.as_ref(), &mut stored, stored_off)?;
        if n == 0 {
            return Ok(None);
        }
        if n < CHUNK_OVERHEAD {
            return Err(Error::BadFileFormat(format!(
                "stored chunk {idx} is {n} bytes, below overhead"
            )));
        }
        stored.truncate(n);
        let (nonce_bytes, body) = stored.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Crypto("bad chunk nonce".into()))?;
        let mut body = body.to_vec();
        let plain = self
            .sealer
            .open_in_place(nonce, Aad::empty(), &mut body)
            .map_err(|_| Error::Crypto(format!("chunk {idx} failed authentication")))?;
        Ok(Some(plain.to_vec()))
    }

    fn write_chunk(&mut self, idx: u64, plain: &[u8]) -> Result<()> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut body = plain.to_vec();
        let tag = self
            .sealer
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut body)
            .map_err(|_| Error::Crypto("chunk sealing failed".into()))?;

        let mut stored = Vec::with_capacity(CHUNK_OVERHEAD + body.len());
        stored.extend_from_slice(&nonce_bytes);
        stored.extend_from_slice(&body);
        stored.extend_from_slice(tag.as_ref());
        self.file
            .write_at(&stored, HEADER_LEN + idx * STORED_CHUNK as u64)?;
        Ok(())
    }
}

/// Read until `buf` is full or the file ends; returns bytes read
fn read_stored(file: &dyn BackendFile, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend, ShareKey) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::open(dir.path()).unwrap();
        let share_key = ShareKey {
            version: 3,
            key: SymmetricKey::generate(),
        };
        (dir, backend, share_key)
    }

    #[test]
    fn test_round_trip_across_chunk_boundary() {
        let (_dir, backend, share_key) = setup();
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();

        let mut cf = CryptoFile::create(backend.create("/f").unwrap(), &share_key).unwrap();
        cf.write_at(&data, 0).unwrap();
        cf.flush().unwrap();
        assert_eq!(cf.len().unwrap(), data.len() as u64);

        let cf = CryptoFile::open(backend.open("/f", false).unwrap(), |v| {
            assert_eq!(v, 3);
            Ok(share_key.key.clone())
        })
        .unwrap();
        let mut out = vec![0u8; data.len()];
        assert_eq!(cf.read_at(&mut out, 0).unwrap(), data.len());
        assert_eq!(out, data);

        // Unaligned read crossing the first chunk boundary
        let mut mid = vec![0u8; 200];
        assert_eq!(cf.read_at(&mut mid, CHUNK_SIZE as u64 - 100).unwrap(), 200);
        assert_eq!(mid, data[CHUNK_SIZE - 100..CHUNK_SIZE + 100]);
    }

    #[test]
    fn test_stored_size_reveals_only_length() {
        let (_dir, backend, share_key) = setup();
        let mut cf = CryptoFile::create(backend.create("/f").unwrap(), &share_key).unwrap();
        cf.write_at(&vec![7u8; CHUNK_SIZE + 10], 0).unwrap();

        let stored = backend.metadata("/f").unwrap().len;
        let expected = HEADER_LEN
            + (NONCE_LEN + CHUNK_SIZE + 16) as u64
            + (NONCE_LEN + 10 + 16) as u64;
        assert_eq!(stored, expected);
        assert_eq!(plaintext_len(stored), (CHUNK_SIZE + 10) as u64);
    }

    #[test]
    fn test_sparse_write_zero_fills_gap() {
        let (_dir, backend, share_key) = setup();
        let mut cf = CryptoFile::create(backend.create("/f").unwrap(), &share_key).unwrap();
        cf.write_at(b"tail", 10_000).unwrap();
        assert_eq!(cf.len().unwrap(), 10_004);

        let mut out = vec![1u8; 10_004];
        cf.read_at(&mut out, 0).unwrap();
        assert!(out[..10_000].iter().all(|&b| b == 0));
        assert_eq!(&out[10_000..], b"tail");
    }

    #[test]
    fn test_truncate_and_extend() {
        let (_dir, backend, share_key) = setup();
        let data: Vec<u8> = (0..CHUNK_SIZE + 500).map(|i| (i % 251) as u8).collect();
        let mut cf = CryptoFile::create(backend.create("/f").unwrap(), &share_key).unwrap();
        cf.write_at(&data, 0).unwrap();

        cf.set_len(100).unwrap();
        assert_eq!(cf.len().unwrap(), 100);
        let mut out = vec![0u8; 200];
        assert_eq!(cf.read_at(&mut out, 0).unwrap(), 100);
        assert_eq!(&out[..100], &data[..100]);

        cf.set_len(300).unwrap();
        assert_eq!(cf.len().unwrap(), 300);
        assert_eq!(cf.read_at(&mut out, 100).unwrap(), 200);
        assert!(out[..200].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tampered_chunk_fails_authentication() {
        let (dir, backend, share_key) = setup();
        let mut cf = CryptoFile::create(backend.create("/f").unwrap(), &share_key).unwrap();
        cf.write_at(b"authentic content", 0).unwrap();
        drop(cf);

        // Flip one ciphertext byte on disk
        let path = dir.path().join("f");
        let mut raw = std::fs::read(&path).unwrap();
        let idx = HEADER_LEN as usize + NONCE_LEN + 2;
        raw[idx] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let cf =
            CryptoFile::open(backend.open("/f", false).unwrap(), |_| Ok(share_key.key.clone()))
                .unwrap();
        let mut out = [0u8; 16];
        assert!(matches!(cf.read_at(&mut out, 0), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let (_dir, backend, _share_key) = setup();
        let f = backend.create("/plain").unwrap();
        f.write_at(b"not an encrypted file at all", 0).unwrap();
        let err = CryptoFile::open(backend.open("/plain", false).unwrap(), |_| {
            Ok(SymmetricKey::generate())
        });
        assert!(matches!(err, Err(Error::BadFileFormat(_))));
    }
}
