//! S3-compatible backend. Keys are laid out the same way the local
//! backend shards by hash, just with `/` instead of a filesystem
//! separator: `<prefix>/chunks/<hh>/<hh>/<hash>` plus a sibling
//! `<hash>.meta` object. Trash is a `.trash/` key prefix rather than a
//! directory.
//!
//! The object-storage client sits behind a narrow [`S3Client`] trait
//! rather than a concrete SDK type, so the store can be exercised against
//! an in-memory double in tests and against any S3-compatible endpoint
//! (AWS itself, MinIO, Ceph RGW) in production via [`AwsS3Client`].

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{self, Compression, Encryption, EncryptionKey};
use crate::error::Result;
use crate::metadata::{is_valid_hash, BlobMetadata, Reference};
use crate::store::{hash_bytes, Backend, BlobStore, Stats};

/// Capability boundary for whatever object-storage client is actually in
/// use (AWS SDK, a MinIO-compatible endpoint, a test double). `dv-blob`
/// never talks to `aws-sdk-s3` types directly outside [`AwsS3Client`].
#[async_trait]
pub trait S3Client: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_object(&self, key: &str) -> Result<()>;
    async fn head_object(&self, key: &str) -> Result<bool>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
    async fn copy_object(&self, src: &str, dst: &str) -> Result<()>;
}

pub struct S3BlobStore {
    client: Box<dyn S3Client>,
    prefix: String,
    compression: Option<(Compression, i32)>,
    key: Option<EncryptionKey>,
    /// Per-hash lock guarding read-modify-write metadata updates; there is
    /// no cross-process conditional write available through the narrow
    /// `S3Client` trait, so this only serializes callers within one
    /// process the same way `LocalBlobStore::locks` does.
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

fn data_key(prefix: &str, hash: &str) -> String {
    format!("{prefix}/chunks/{}/{}/{hash}", &hash[0..2], &hash[2..4])
}

fn meta_key(prefix: &str, hash: &str) -> String {
    format!("{}.meta", data_key(prefix, hash))
}

fn trash_data_key(prefix: &str, hash: &str) -> String {
    format!("{prefix}/.trash/{hash}")
}

fn trash_meta_key(prefix: &str, hash: &str) -> String {
    format!("{prefix}/.trash/{hash}.meta")
}

impl S3BlobStore {
    pub fn new(
        client: Box<dyn S3Client>,
        prefix: impl Into<String>,
        compression: Option<(Compression, i32)>,
        key: Option<EncryptionKey>,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            compression,
            key,
            locks: DashMap::new(),
        }
    }

    fn hash_lock(&self, hash: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = match self.compression {
            Some((algo, level)) => codec::compress(plaintext, algo, level)?,
            None => plaintext.to_vec(),
        };
        match &self.key {
            Some(key) => codec::encrypt(&compressed, key),
            None => Ok(compressed),
        }
    }

    fn decode(&self, raw: &[u8], meta: &BlobMetadata) -> Result<Vec<u8>> {
        let compressed = match meta.encryption {
            Encryption::Aes256Gcm => {
                let key = self
                    .key
                    .as_ref()
                    .ok_or_else(|| anyhow!("blob is encrypted but no client-side key is configured"))?;
                codec::decrypt(raw, key)?
            }
            Encryption::None => raw.to_vec(),
        };
        match meta.compression {
            Compression::None => Ok(compressed),
            algo => codec::decompress(&compressed, algo),
        }
    }

    async fn read_meta(&self, key: &str, hash: &str) -> Result<BlobMetadata> {
        let bytes = self
            .client
            .get_object(key)
            .await?
            .ok_or_else(|| anyhow!(crate::BlobError::NotFound(hash.to_string())))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `put`'s body, assuming the caller already holds `hash`'s lock.
    async fn put_locked(&self, hash: &str, data: &[u8], mut meta: BlobMetadata) -> Result<()> {
        if !is_valid_hash(hash) {
            bail!(crate::BlobError::InvalidInput(format!(
                "not a 64-hex hash: {hash}"
            )));
        }
        let key = data_key(&self.prefix, hash);
        if self.client.head_object(&key).await? {
            bail!(crate::BlobError::AlreadyExists(hash.to_string()));
        }

        meta.compression = self.compression.map(|(a, _)| a).unwrap_or(Compression::None);
        meta.encryption = if self.key.is_some() {
            Encryption::Aes256Gcm
        } else {
            Encryption::None
        };

        let encoded = self.encode(data)?;
        self.client.put_object(&key, encoded).await?;
        self.client
            .put_object(&meta_key(&self.prefix, hash), serde_json::to_vec(&meta)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, hash: &str, data: &[u8], meta: BlobMetadata) -> Result<()> {
        let lock = self.hash_lock(hash);
        let _guard = lock.lock().await;
        self.put_locked(hash, data, meta).await
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let meta = self.get_metadata(hash).await?;
        let key = data_key(&self.prefix, hash);
        let raw = self
            .client
            .get_object(&key)
            .await?
            .ok_or_else(|| anyhow!(crate::BlobError::NotFound(hash.to_string())))?;
        let plaintext = self.decode(&raw, &meta)?;
        let actual = hash_bytes(&plaintext);
        if actual != hash {
            bail!(crate::BlobError::IntegrityFailure(format!(
                "stored blob {hash} decodes to digest {actual}"
            )));
        }
        Ok(plaintext)
    }

    async fn delete(&self, hash: &str) -> Result<()> {
        let key = data_key(&self.prefix, hash);
        if !self.client.head_object(&key).await? {
            return Ok(());
        }
        self.client.copy_object(&key, &trash_data_key(&self.prefix, hash)).await?;
        self.client.delete_object(&key).await?;

        let meta_k = meta_key(&self.prefix, hash);
        if self.client.head_object(&meta_k).await? {
            self.client
                .copy_object(&meta_k, &trash_meta_key(&self.prefix, hash))
                .await?;
            self.client.delete_object(&meta_k).await?;
        }
        Ok(())
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        self.client.head_object(&data_key(&self.prefix, hash)).await
    }

    async fn size(&self, hash: &str) -> Result<u64> {
        Ok(self.get_metadata(hash).await?.size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self
            .client
            .list_keys(&format!("{}/chunks/", self.prefix))
            .await?;
        let mut out = Vec::new();
        for key in keys {
            if let Some(hash) = key.rsplit('/').next() {
                if !hash.ends_with(".meta") && is_valid_hash(hash) && hash.starts_with(prefix) {
                    out.push(hash.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn touch(&self, hash: &str) -> Result<()> {
        let key = meta_key(&self.prefix, hash);
        let mut meta = self.read_meta(&key, hash).await?;
        meta.touch();
        self.client.put_object(&key, serde_json::to_vec(&meta)?).await
    }

    async fn get_metadata(&self, hash: &str) -> Result<BlobMetadata> {
        self.read_meta(&meta_key(&self.prefix, hash), hash).await
    }

    async fn update_metadata(&self, hash: &str, meta: BlobMetadata) -> Result<()> {
        self.client
            .put_object(&meta_key(&self.prefix, hash), serde_json::to_vec(&meta)?)
            .await
    }

    async fn put_or_merge_reference(
        &self,
        hash: &str,
        data: &[u8],
        pending: BlobMetadata,
        reference: Reference,
    ) -> Result<bool> {
        let lock = self.hash_lock(hash);
        let _guard = lock.lock().await;
        if !self.client.head_object(&data_key(&self.prefix, hash)).await? {
            self.put_locked(hash, data, pending).await?;
            return Ok(true);
        }
        let meta_k = meta_key(&self.prefix, hash);
        let mut meta = self.read_meta(&meta_k, hash).await?;
        if meta.add_reference(reference) {
            self.client.put_object(&meta_k, serde_json::to_vec(&meta)?).await?;
        }
        Ok(false)
    }

    async fn remove_reference(&self, hash: &str, reference: &Reference) -> Result<Option<BlobMetadata>> {
        let lock = self.hash_lock(hash);
        let _guard = lock.lock().await;
        let meta_k = meta_key(&self.prefix, hash);
        let mut meta = match self.read_meta(&meta_k, hash).await {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if meta.remove_reference(reference) {
            self.client.put_object(&meta_k, serde_json::to_vec(&meta)?).await?;
        }
        Ok(Some(meta))
    }

    fn backend(&self) -> Backend {
        Backend::S3
    }

    async fn stats(&self) -> Result<Stats> {
        let mut stats = Stats::default();
        let mut seen = HashSet::new();
        for hash in self.list("").await? {
            if !seen.insert(hash.clone()) {
                continue;
            }
            if let Ok(meta) = self.get_metadata(&hash).await {
                stats.blob_count += 1;
                stats.logical_bytes += meta.size;
                // object storage does not expose on-disk physical size the
                // way a filesystem does; logical and physical coincide.
                stats.physical_bytes += meta.size;
            }
        }
        Ok(stats)
    }
}

/// `S3Client` backed by the real AWS SDK, for an S3-compatible endpoint
/// (AWS S3 itself, or any MinIO/Ceph-RGW endpoint reachable with the same
/// API and a custom `endpoint_url`).
pub struct AwsS3Client {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl AwsS3Client {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl S3Client for AwsS3Client {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .send()
            .await
            .map_err(|e| anyhow!("s3 put_object {key}: {e}"))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(resp) => {
                let bytes = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| anyhow!("s3 get_object {key} body: {e}"))?
                    .into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(anyhow!("s3 get_object {key}: {e}")),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("s3 delete_object {key}: {e}"))?;
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(anyhow!("s3 head_object {key}: {e}")),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut continuation = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation.take() {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.map_err(|e| anyhow!("s3 list_objects_v2 {prefix}: {e}"))?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    out.push(key.to_string());
                }
            }
            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(out)
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .key(dst)
            .send()
            .await
            .map_err(|e| anyhow!("s3 copy_object {src}->{dst}: {e}"))?;
        Ok(())
    }
}

fn is_not_found<E: std::fmt::Display>(e: &E) -> bool {
    e.to_string().contains("NotFound") || e.to_string().contains("NoSuchKey")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// In-memory `S3Client` double used by the S3/Hybrid test suites.
    #[derive(Default, Clone)]
    pub struct MemoryS3Client {
        objects: Arc<DashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl S3Client for MemoryS3Client {
        async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
            self.objects.insert(key.to_string(), body);
            Ok(())
        }
        async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.objects.get(key).map(|v| v.clone()))
        }
        async fn delete_object(&self, key: &str) -> Result<()> {
            self.objects.remove(key);
            Ok(())
        }
        async fn head_object(&self, key: &str) -> Result<bool> {
            Ok(self.objects.contains_key(key))
        }
        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .objects
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| k.starts_with(prefix))
                .collect())
        }
        async fn copy_object(&self, src: &str, dst: &str) -> Result<()> {
            let data = self
                .objects
                .get(src)
                .map(|v| v.clone())
                .ok_or_else(|| anyhow!("copy_object: source {src} missing"))?;
            self.objects.insert(dst.to_string(), data);
            Ok(())
        }
    }

    fn store(client: MemoryS3Client) -> S3BlobStore {
        S3BlobStore::new(Box::new(client), "ds", None, None)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = store(MemoryS3Client::default());
        let data = b"hello";
        let hash = hash_bytes(data);
        store
            .put(&hash, data, BlobMetadata::new(hash.clone(), data.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), data);
    }

    #[tokio::test]
    async fn delete_moves_to_trash_prefix() {
        let client = MemoryS3Client::default();
        let store = store(client.clone());
        let data = b"hello";
        let hash = hash_bytes(data);
        store
            .put(&hash, data, BlobMetadata::new(hash.clone(), data.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();
        store.delete(&hash).await.unwrap();
        assert!(!store.exists(&hash).await.unwrap());
        assert!(client.head_object(&trash_data_key("ds", &hash)).await.unwrap());
    }
}
