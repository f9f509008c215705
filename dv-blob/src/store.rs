use std::io::Read;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metadata::{BlobMetadata, Reference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    S3,
    Hybrid,
}

/// Aggregate occupancy numbers for a store, as reported by `stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub blob_count: u64,
    pub logical_bytes: u64,
    pub physical_bytes: u64,
}

impl Stats {
    pub fn deduplication_factor(&self) -> f64 {
        if self.physical_bytes == 0 {
            1.0
        } else {
            self.logical_bytes as f64 / self.physical_bytes as f64
        }
    }
}

/// The uniform contract every blob backend (local filesystem, S3, hybrid)
/// implements. Modeled as a capability trait rather than a class
/// hierarchy: [`crate::hybrid::HybridBlobStore`] *composes* two values
/// behind this trait, it does not subclass either.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `reader`'s fully-consumed bytes under `hash`.
    ///
    /// Fails with [`crate::BlobError::AlreadyExists`] if `hash` is already
    /// present, and with [`crate::BlobError::InvalidInput`] if `hash` is
    /// not 64 lowercase hex digits. The write is atomic: a partial write
    /// is never observable under `hash`.
    async fn put(&self, hash: &str, data: &[u8], meta: BlobMetadata) -> Result<()>;

    /// Returns the decoded plaintext bytes stored under `hash`.
    ///
    /// Fails with [`crate::BlobError::NotFound`] if absent, and with
    /// [`crate::BlobError::IntegrityFailure`] if decoding fails
    /// authentication or the decoded bytes don't hash to `hash`.
    async fn get(&self, hash: &str) -> Result<Vec<u8>>;

    /// Moves the blob to the store's trash namespace. Idempotent: trashing
    /// an already-trashed or absent blob is not an error.
    async fn delete(&self, hash: &str) -> Result<()>;

    async fn exists(&self, hash: &str) -> Result<bool>;

    async fn size(&self, hash: &str) -> Result<u64>;

    /// Lists hashes with the given hex prefix (empty prefix lists all).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Bumps `last_accessed`/`access_count` without reading the payload.
    async fn touch(&self, hash: &str) -> Result<()>;

    async fn get_metadata(&self, hash: &str) -> Result<BlobMetadata>;

    async fn update_metadata(&self, hash: &str, meta: BlobMetadata) -> Result<()>;

    /// Atomically merges `reference` into the metadata stored under
    /// `hash`, putting `pending` as the initial metadata if `hash` isn't
    /// present yet. Concurrent callers racing on the same hash must
    /// converge to the union of every reference any of them added, with
    /// at most one physical write of the payload. Returns `true` if this
    /// call performed that initial write.
    ///
    /// The default implementation is not atomic across the
    /// exists-check/put/get/update sequence; backends should override it
    /// with a per-hash lock (or equivalent) held for the whole operation.
    async fn put_or_merge_reference(
        &self,
        hash: &str,
        data: &[u8],
        pending: BlobMetadata,
        reference: Reference,
    ) -> Result<bool> {
        if !self.exists(hash).await? {
            match self.put(hash, data, pending).await {
                Ok(()) => return Ok(true),
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(e),
            }
        }
        let mut meta = self.get_metadata(hash).await?;
        if meta.add_reference(reference) {
            self.update_metadata(hash, meta).await?;
        }
        Ok(false)
    }

    /// Atomically removes `reference` from `hash`'s metadata, returning
    /// the metadata afterwards, or `None` if `hash` isn't present. See
    /// [`BlobStore::put_or_merge_reference`] for the atomicity contract
    /// backends should provide.
    async fn remove_reference(&self, hash: &str, reference: &Reference) -> Result<Option<BlobMetadata>> {
        let mut meta = match self.get_metadata(hash).await {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if meta.remove_reference(reference) {
            self.update_metadata(hash, meta.clone()).await?;
        }
        Ok(Some(meta))
    }

    fn backend(&self) -> Backend;

    async fn stats(&self) -> Result<Stats>;

    /// Copies a blob (and its metadata) from this store into `other`.
    async fn copy(&self, hash: &str, other: &dyn BlobStore) -> Result<()> {
        let data = self.get(hash).await?;
        let meta = self.get_metadata(hash).await?;
        if other.exists(hash).await.unwrap_or(false) {
            return Ok(());
        }
        other.put(hash, &data, meta).await
    }

    /// Copies then deletes from this store.
    async fn move_to(&self, hash: &str, other: &dyn BlobStore) -> Result<()> {
        self.copy(hash, other).await?;
        self.delete(hash).await
    }

    /// Sets the blob aside as corrupt without deleting it, so an operator
    /// can inspect why a verify pass failed. Default is a no-op; backends
    /// that can rename/tag in place should override it.
    async fn quarantine(&self, _hash: &str) -> Result<()> {
        Ok(())
    }
}

/// Streaming hash helper shared by every backend and by the ingestor:
/// SHA-256 of everything read from `reader`, hex-encoded.
pub fn hash_reader(mut reader: impl Read) -> Result<String> {
    use openssl::sha::Sha256;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finish()))
}

pub fn hash_bytes(data: &[u8]) -> String {
    use openssl::sha::Sha256;
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finish())
}

/// Recognizes a [`crate::BlobError::AlreadyExists`] wrapped in an
/// `anyhow::Error`, e.g. to fall through to a reference merge after
/// losing a `put` race.
pub fn is_already_exists(e: &anyhow::Error) -> bool {
    e.to_string().contains("already exists")
}
