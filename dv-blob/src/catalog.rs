//! The `DatasetCatalog` collaborator boundary: the relational store that
//! owns dataset/version/chunk bookkeeping sits behind this trait. The
//! blob engine only ever sees chunk records and hashes through it — it
//! has no idea how (or whether) the catalog persists to SQL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Verified,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: u64,
    pub dataset_id: String,
    pub version_id: String,
    pub index: u64,
    pub hash: String,
    pub size: u64,
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub dataset_id: String,
    pub version_id: String,
    pub index: u64,
    pub hash: String,
}

#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    async fn list_datasets(&self) -> Result<Vec<String>>;
    async fn list_versions(&self, dataset_id: &str) -> Result<Vec<String>>;
    async fn list_chunks(&self, dataset_id: &str, version_id: &str) -> Result<Vec<Chunk>>;

    /// All chunks across all datasets/versions, used by the mark phase of
    /// mark-and-sweep garbage collection to build the live-hash set.
    async fn list_all_chunks(&self) -> Result<Vec<Chunk>>;

    async fn record_chunk(&self, chunk: ChunkDescriptor, size: u64, status: ChunkStatus) -> Result<Chunk>;

    async fn set_chunk_status(&self, chunk_id: u64, status: ChunkStatus) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryCatalog {
        next_id: AtomicU64,
        chunks: Mutex<Vec<Chunk>>,
    }

    #[async_trait]
    impl DatasetCatalog for MemoryCatalog {
        async fn list_datasets(&self) -> Result<Vec<String>> {
            let chunks = self.chunks.lock().await;
            let mut out: Vec<String> = chunks.iter().map(|c| c.dataset_id.clone()).collect();
            out.sort();
            out.dedup();
            Ok(out)
        }

        async fn list_versions(&self, dataset_id: &str) -> Result<Vec<String>> {
            let chunks = self.chunks.lock().await;
            let mut out: Vec<String> = chunks
                .iter()
                .filter(|c| c.dataset_id == dataset_id)
                .map(|c| c.version_id.clone())
                .collect();
            out.sort();
            out.dedup();
            Ok(out)
        }

        async fn list_chunks(&self, dataset_id: &str, version_id: &str) -> Result<Vec<Chunk>> {
            let chunks = self.chunks.lock().await;
            Ok(chunks
                .iter()
                .filter(|c| c.dataset_id == dataset_id && c.version_id == version_id)
                .cloned()
                .collect())
        }

        async fn list_all_chunks(&self) -> Result<Vec<Chunk>> {
            Ok(self.chunks.lock().await.clone())
        }

        async fn record_chunk(
            &self,
            desc: ChunkDescriptor,
            size: u64,
            status: ChunkStatus,
        ) -> Result<Chunk> {
            let mut chunks = self.chunks.lock().await;
            if let Some(existing) = chunks
                .iter_mut()
                .find(|c| c.dataset_id == desc.dataset_id && c.version_id == desc.version_id && c.index == desc.index)
            {
                existing.hash = desc.hash;
                existing.size = size;
                existing.status = status;
                return Ok(existing.clone());
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let chunk = Chunk {
                id,
                dataset_id: desc.dataset_id,
                version_id: desc.version_id,
                index: desc.index,
                hash: desc.hash,
                size,
                status,
            };
            chunks.push(chunk.clone());
            Ok(chunk)
        }

        async fn set_chunk_status(&self, chunk_id: u64, status: ChunkStatus) -> Result<()> {
            let mut chunks = self.chunks.lock().await;
            if let Some(c) = chunks.iter_mut().find(|c| c.id == chunk_id) {
                c.status = status;
            }
            Ok(())
        }
    }
}
