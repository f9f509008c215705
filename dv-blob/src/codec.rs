//! Compression and authenticated encryption primitives.
//!
//! Blobs are written compress-then-encrypt, never the other way around,
//! so the ciphertext never leaks the compressibility of the plaintext.
//! On disk/in the object store the layout is always
//!
//! ```text
//! [ AES-256-GCM(nonce(12) || ciphertext || tag(16)) ] wrapping
//! [ gzip | zstd | none wrapping plaintext ]
//! ```
//!
//! with the outer encryption layer optional and the middle compression
//! layer optional, exactly as declared by the blob's metadata sidecar.

use std::io::{Read, Write};

use anyhow::{bail, Context as _};
use openssl::symm::{Cipher, Crypter, Mode};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const GCM_NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Encryption {
    #[default]
    None,
    Aes256Gcm,
}

/// Process-wide, immutable-after-construction AES-256-GCM key.
///
/// Never logged, never serialized; the only thing callers keep around
/// across PUT/GET calls.
#[derive(Clone)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() != KEY_LEN {
            bail!(
                "encryption key must be exactly {KEY_LEN} bytes, got {}",
                bytes.len()
            );
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Compresses `data` at `level` with the given algorithm.
pub fn compress(data: &[u8], algo: Compression, level: i32) -> Result<Vec<u8>> {
    match algo {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            use flate2::write::GzEncoder;
            let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::new(level.max(0) as u32));
            enc.write_all(data).context("gzip compress")?;
            Ok(enc.finish().context("gzip finish")?)
        }
        Compression::Zstd => {
            Ok(zstd::bulk::compress(data, level).context("zstd compress")?)
        }
    }
}

/// Decompresses `data` that was compressed with `algo`.
pub fn decompress(data: &[u8], algo: Compression) -> Result<Vec<u8>> {
    match algo {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            use flate2::read::GzDecoder;
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .context("gzip decompress")?;
            Ok(out)
        }
        Compression::Zstd => {
            // blobs are capped well below u32::MAX; a generous upper bound
            // avoids a second pass to discover the decompressed size.
            Ok(zstd::bulk::decompress(data, 512 * 1024 * 1024).context("zstd decompress")?)
        }
    }
}

/// Encrypts `plaintext` under `key`, drawing a fresh nonce from the OS RNG.
/// Returns `nonce || ciphertext || tag`.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Cipher::aes_256_gcm();
    let mut tag = [0u8; GCM_TAG_LEN];
    let ciphertext =
        openssl::symm::encrypt_aead(cipher, &key.0, Some(&nonce), &[], plaintext, &mut tag)
            .context("aes-256-gcm encrypt")?;

    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len() + GCM_TAG_LEN);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypts `nonce || ciphertext || tag` produced by [`encrypt`].
pub fn decrypt(blob: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    if blob.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
        bail!("ciphertext too short to contain nonce and tag");
    }
    let (nonce, rest) = blob.split_at(GCM_NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);

    let cipher = Cipher::aes_256_gcm();
    openssl::symm::decrypt_aead(cipher, &key.0, Some(nonce), &[], ciphertext, tag)
        .map_err(|e| anyhow::anyhow!("aes-256-gcm decrypt (tag mismatch or corrupt data): {e}"))
}

/// Exercises the cipher in streaming mode for large plaintext, returning the
/// same `nonce || ciphertext || tag` layout as [`encrypt`]. Used by backends
/// that stream a blob to disk/network instead of buffering it fully.
pub fn encrypt_stream(mut reader: impl Read, key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Cipher::aes_256_gcm();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, &key.0, Some(&nonce))?;

    let mut ciphertext = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    let mut out_buf = vec![0u8; 64 * 1024 + cipher.block_size()];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let count = crypter.update(&buf[..n], &mut out_buf)?;
        ciphertext.extend_from_slice(&out_buf[..count]);
    }
    let count = crypter.finalize(&mut out_buf)?;
    ciphertext.extend_from_slice(&out_buf[..count]);

    let mut tag = [0u8; GCM_TAG_LEN];
    crypter.get_tag(&mut tag)?;

    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len() + GCM_TAG_LEN);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_none() {
        let data = b"hello world";
        let c = compress(data, Compression::None, 0).unwrap();
        assert_eq!(decompress(&c, Compression::None).unwrap(), data);
    }

    #[test]
    fn roundtrip_gzip() {
        let data = b"hello world, compressed please, a few more bytes to make gzip worthwhile";
        let c = compress(data, Compression::Gzip, 6).unwrap();
        assert_ne!(c, data);
        assert_eq!(decompress(&c, Compression::Gzip).unwrap(), data);
    }

    #[test]
    fn roundtrip_zstd() {
        let data = b"hello world, compressed please, a few more bytes to make zstd worthwhile";
        let c = compress(data, Compression::Zstd, 3).unwrap();
        assert_eq!(decompress(&c, Compression::Zstd).unwrap(), data);
    }

    #[test]
    fn roundtrip_encryption() {
        let key = EncryptionKey::new(vec![7u8; 32]).unwrap();
        let plaintext = b"some plaintext that needs protecting";
        let ciphertext = encrypt(plaintext, &key).unwrap();
        assert_ne!(&ciphertext[12..ciphertext.len() - 16], plaintext.as_slice());
        let decrypted = decrypt(&ciphertext, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_length_rejected() {
        assert!(EncryptionKey::new(vec![0u8; 10]).is_err());
        assert!(EncryptionKey::new(vec![0u8; 32]).is_ok());
    }

    #[test]
    fn tampered_ciphertext_fails_decrypt() {
        let key = EncryptionKey::new(vec![1u8; 32]).unwrap();
        let mut ciphertext = encrypt(b"authenticated data please", &key).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(decrypt(&ciphertext, &key).is_err());
    }

    #[test]
    fn streaming_encrypt_matches_buffered_roundtrip() {
        let key = EncryptionKey::new(vec![3u8; 32]).unwrap();
        let data = vec![42u8; 200_000];
        let ciphertext = encrypt_stream(&data[..], &key).unwrap();
        let decrypted = decrypt(&ciphertext, &key).unwrap();
        assert_eq!(decrypted, data);
    }
}
