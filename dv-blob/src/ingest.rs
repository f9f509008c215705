//! Chunk ingestion: hash verification, dedup, and reference bookkeeping.
//!
//! Concurrent ingests of the same hash converge to the union of every
//! reference any of them added, with at most one physical write of the
//! payload: adding and removing a reference both go through
//! [`BlobStore::put_or_merge_reference`]/[`BlobStore::remove_reference`],
//! which each backend implements under a per-hash lock held for the
//! whole read-modify-write instead of as two separate trait calls.

use std::io::Read;
use std::sync::Arc;

use anyhow::bail;

use crate::catalog::{Chunk, ChunkDescriptor, ChunkStatus, DatasetCatalog};
use crate::codec::{Compression, Encryption};
use crate::error::Result;
use crate::metadata::{BlobMetadata, Reference};
use crate::store::{hash_reader, BlobStore};

pub struct Ingestor {
    store: Arc<dyn BlobStore>,
    catalog: Arc<dyn DatasetCatalog>,
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub checked: u64,
    pub missing: u64,
    pub invalid: u64,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.missing == 0 && self.invalid == 0
    }
}

impl Ingestor {
    pub fn new(store: Arc<dyn BlobStore>, catalog: Arc<dyn DatasetCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Reads `reader` fully, verifies it hashes to `desc.hash`, dedups
    /// against the store, and records the chunk as `verified` in the
    /// catalog.
    pub async fn ingest_chunk(&self, desc: ChunkDescriptor, reader: impl Read) -> Result<Chunk> {
        let mut buf = Vec::new();
        let mut reader = reader;
        reader.read_to_end(&mut buf)?;

        let actual = hash_reader(&buf[..])?;
        if actual != desc.hash {
            bail!(crate::BlobError::IntegrityFailure(format!(
                "chunk {}:{}:{} hashes to {actual}, expected {}",
                desc.dataset_id, desc.version_id, desc.index, desc.hash
            )));
        }

        let reference = Reference {
            dataset_id: desc.dataset_id.clone(),
            version_id: desc.version_id.clone(),
            chunk_index: desc.index,
        };

        let pending = {
            let mut meta =
                BlobMetadata::new(desc.hash.clone(), buf.len() as u64, Compression::None, Encryption::None);
            meta.add_reference(reference.clone());
            meta
        };
        self.store
            .put_or_merge_reference(&desc.hash, &buf, pending, reference)
            .await?;

        self.catalog
            .record_chunk(desc, buf.len() as u64, ChunkStatus::Verified)
            .await
    }

    /// Removes `chunk`'s reference from its blob's metadata; if that was
    /// the last reference, the blob is logically deleted. The catalog
    /// record moves to `deleted`.
    pub async fn delete_chunk(&self, chunk: &Chunk) -> Result<()> {
        let reference = Reference {
            dataset_id: chunk.dataset_id.clone(),
            version_id: chunk.version_id.clone(),
            chunk_index: chunk.index,
        };

        if let Some(meta) = self.store.remove_reference(&chunk.hash, &reference).await? {
            if meta.is_orphaned() {
                self.store.delete(&chunk.hash).await?;
            }
        }

        self.catalog.set_chunk_status(chunk.id, ChunkStatus::Deleted).await
    }

    /// Lists every chunk in `(dataset_id, version_id)` and verifies the
    /// blob backing each one both exists and still hashes to the expected
    /// digest. Blobs that fail the digest check are quarantined rather
    /// than silently left in place.
    pub async fn verify_dataset_integrity(&self, dataset_id: &str, version_id: &str) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        for chunk in self.catalog.list_chunks(dataset_id, version_id).await? {
            report.checked += 1;
            if !self.store.exists(&chunk.hash).await? {
                report.missing += 1;
                continue;
            }
            match self.store.get(&chunk.hash).await {
                Ok(bytes) => {
                    let actual = crate::store::hash_bytes(&bytes);
                    if actual != chunk.hash {
                        report.invalid += 1;
                        self.store.quarantine(&chunk.hash).await?;
                    }
                }
                Err(_) => {
                    report.invalid += 1;
                    self.store.quarantine(&chunk.hash).await?;
                }
            }
        }
        Ok(report)
    }
}
