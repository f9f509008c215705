//! Filesystem-backed [`BlobStore`]: sharded two-level directory layout,
//! atomic rename-into-place, a `.trash/` staging directory for logical
//! deletes, and a JSON sidecar per blob. Shards are created on demand
//! under `<hash[0:2]>/<hash[2:4]>/` rather than precreated, and per-hash
//! metadata updates are serialized through an in-process lock table
//! instead of a filesystem-level lock file, since this store only ever
//! needs to coordinate within a single process.

use std::collections::HashSet;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::codec::{self, Compression, Encryption, EncryptionKey};
use crate::error::Result;
use crate::metadata::{is_valid_hash, BlobMetadata, Reference};
use crate::store::{hash_bytes, Backend, BlobStore, Stats};

const TRASH_DIR: &str = ".trash";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub compression_enabled: bool,
    #[serde(default)]
    pub compression_algorithm: Compression,
    #[serde(default = "default_level")]
    pub compression_level: i32,
    #[serde(default)]
    pub encryption_enabled: bool,
}

fn default_level() -> i32 {
    3
}

pub struct LocalBlobStore {
    base: PathBuf,
    compression: Option<(Compression, i32)>,
    key: Option<EncryptionKey>,
    /// Per-hash lock guarding read-modify-write metadata updates, so two
    /// concurrent ingests of the same hash converge to the union of their
    /// reference additions instead of racing each other's `update_metadata`.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

fn shard_dir(base: &Path, hash: &str) -> PathBuf {
    base.join("blobs").join(&hash[0..2]).join(&hash[2..4])
}

fn data_path(base: &Path, hash: &str) -> PathBuf {
    shard_dir(base, hash).join(hash)
}

fn meta_path(base: &Path, hash: &str) -> PathBuf {
    shard_dir(base, hash).join(format!("{hash}.meta"))
}

fn trash_data_path(base: &Path, hash: &str) -> PathBuf {
    base.join(TRASH_DIR).join(hash)
}

fn trash_meta_path(base: &Path, hash: &str) -> PathBuf {
    base.join(TRASH_DIR).join(format!("{hash}.meta"))
}

impl LocalBlobStore {
    pub fn open(config: LocalStoreConfig, key: Option<EncryptionKey>) -> Result<Self> {
        if config.encryption_enabled && key.is_none() {
            bail!("encryption enabled in config but no key supplied");
        }
        std::fs::create_dir_all(config.path.join("blobs"))
            .with_context(|| format!("creating blob root {:?}", config.path))?;
        std::fs::create_dir_all(config.path.join(TRASH_DIR))
            .with_context(|| format!("creating trash dir under {:?}", config.path))?;
        set_dir_perms(&config.path.join("blobs"))?;
        set_dir_perms(&config.path.join(TRASH_DIR))?;

        let compression = config
            .compression_enabled
            .then_some((config.compression_algorithm, config.compression_level));

        log::info!(
            "opened local blob store at {:?} (compression={:?}, encryption={})",
            config.path,
            compression,
            config.encryption_enabled
        );

        Ok(Self {
            base: config.path,
            compression,
            key: if config.encryption_enabled { key } else { None },
            locks: DashMap::new(),
        })
    }

    fn hash_lock(&self, hash: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
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
                    .ok_or_else(|| anyhow!("blob is encrypted but no key is configured"))?;
                codec::decrypt(raw, key)?
            }
            Encryption::None => raw.to_vec(),
        };
        match meta.compression {
            Compression::None => Ok(compressed),
            algo => codec::decompress(&compressed, algo),
        }
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let dir = path.parent().ok_or_else(|| anyhow!("no parent dir"))?;
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            ".tmp-{}-{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id()
        ));
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(0o600);
            f.set_permissions(perms)?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_meta(path: &Path) -> Result<BlobMetadata> {
        let data = std::fs::read(path)
            .map_err(|e| anyhow!("{}: {e}", crate::BlobError::NotFound(path.display().to_string())))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// `put`'s body, assuming the caller already holds `hash`'s lock.
    fn put_locked(&self, hash: &str, data: &[u8], mut meta: BlobMetadata) -> Result<()> {
        if !is_valid_hash(hash) {
            bail!(crate::BlobError::InvalidInput(format!(
                "not a 64-hex hash: {hash}"
            )));
        }
        let path = data_path(&self.base, hash);
        if path.exists() {
            bail!(crate::BlobError::AlreadyExists(hash.to_string()));
        }

        meta.compression = self.compression.map(|(a, _)| a).unwrap_or(Compression::None);
        meta.encryption = if self.key.is_some() {
            Encryption::Aes256Gcm
        } else {
            Encryption::None
        };

        let encoded = self.encode(data)?;
        Self::write_atomic(&path, &encoded)?;
        Self::write_atomic(&meta_path(&self.base, hash), &serde_json::to_vec(&meta)?)?;
        Ok(())
    }
}

fn set_dir_perms(p: &Path) -> Result<()> {
    let mut perms = std::fs::metadata(p)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(p, perms)?;
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, hash: &str, data: &[u8], meta: BlobMetadata) -> Result<()> {
        let _guard = self.hash_lock(hash).lock().unwrap();
        self.put_locked(hash, data, meta)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let meta = self.get_metadata(hash).await?;
        let path = data_path(&self.base, hash);
        let raw = std::fs::read(&path)
            .map_err(|_| anyhow!(crate::BlobError::NotFound(hash.to_string())))?;
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
        let data = data_path(&self.base, hash);
        let meta = meta_path(&self.base, hash);
        if !data.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(self.base.join(TRASH_DIR))?;
        std::fs::rename(&data, trash_data_path(&self.base, hash))?;
        if meta.exists() {
            std::fs::rename(&meta, trash_meta_path(&self.base, hash))?;
        }
        Ok(())
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(data_path(&self.base, hash).exists())
    }

    async fn size(&self, hash: &str) -> Result<u64> {
        Ok(self.get_metadata(hash).await?.size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let blobs_dir = self.base.join("blobs");
        if !blobs_dir.exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(&blobs_dir)
            .min_depth(3)
            .max_depth(3)
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".meta") {
                continue;
            }
            if is_valid_hash(&name) && name.starts_with(prefix) {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    async fn touch(&self, hash: &str) -> Result<()> {
        let _guard = self.hash_lock(hash).lock().unwrap();
        let path = meta_path(&self.base, hash);
        let mut meta = Self::read_meta(&path)?;
        meta.touch();
        Self::write_atomic(&path, &serde_json::to_vec(&meta)?)
    }

    async fn get_metadata(&self, hash: &str) -> Result<BlobMetadata> {
        Self::read_meta(&meta_path(&self.base, hash))
    }

    async fn update_metadata(&self, hash: &str, meta: BlobMetadata) -> Result<()> {
        let _guard = self.hash_lock(hash).lock().unwrap();
        Self::write_atomic(&meta_path(&self.base, hash), &serde_json::to_vec(&meta)?)
    }

    async fn put_or_merge_reference(
        &self,
        hash: &str,
        data: &[u8],
        pending: BlobMetadata,
        reference: Reference,
    ) -> Result<bool> {
        let _guard = self.hash_lock(hash).lock().unwrap();
        if !data_path(&self.base, hash).exists() {
            self.put_locked(hash, data, pending)?;
            return Ok(true);
        }
        let path = meta_path(&self.base, hash);
        let mut meta = Self::read_meta(&path)?;
        if meta.add_reference(reference) {
            Self::write_atomic(&path, &serde_json::to_vec(&meta)?)?;
        }
        Ok(false)
    }

    async fn remove_reference(&self, hash: &str, reference: &Reference) -> Result<Option<BlobMetadata>> {
        let _guard = self.hash_lock(hash).lock().unwrap();
        let path = meta_path(&self.base, hash);
        let mut meta = match Self::read_meta(&path) {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if meta.remove_reference(reference) {
            Self::write_atomic(&path, &serde_json::to_vec(&meta)?)?;
        }
        Ok(Some(meta))
    }

    fn backend(&self) -> Backend {
        Backend::Local
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
                if let Ok(on_disk) = std::fs::metadata(data_path(&self.base, &hash)) {
                    stats.physical_bytes += on_disk.len();
                }
            }
        }
        Ok(stats)
    }

    /// Renames the data file aside with a `.bad` suffix, leaving the
    /// metadata sidecar in place so an operator can see what was expected.
    /// Idempotent: quarantining an absent blob is a no-op.
    async fn quarantine(&self, hash: &str) -> Result<()> {
        let path = data_path(&self.base, hash);
        if !path.exists() {
            return Ok(());
        }
        let quarantined = path.with_file_name(format!("{hash}.bad"));
        std::fs::rename(&path, &quarantined)?;
        log::warn!("quarantined corrupt blob {hash} at {:?}", quarantined);
        Ok(())
    }
}

impl LocalBlobStore {
    /// Total bytes physically resident in the hot directory, used by
    /// [`crate::gc::pressure_percent`] and LRU tiering.
    pub fn total_size_on_disk(&self) -> Result<u64> {
        let mut total = 0u64;
        let blobs_dir = self.base.join("blobs");
        if !blobs_dir.exists() {
            return Ok(0);
        }
        for entry in walkdir::WalkDir::new(&blobs_dir).min_depth(3).max_depth(3) {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(".meta") {
                continue;
            }
            total += entry.metadata()?.len();
        }
        Ok(total)
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Physically removes a trashed blob. Idempotent.
    pub fn empty_trash_entry(&self, hash: &str) -> Result<()> {
        let data = trash_data_path(&self.base, hash);
        let meta = trash_meta_path(&self.base, hash);
        if data.exists() {
            std::fs::remove_file(&data)?;
        }
        if meta.exists() {
            std::fs::remove_file(&meta)?;
        }
        Ok(())
    }

    /// Lists hashes currently sitting in `.trash`, along with the mtime of
    /// their data file (used by GC's trash-retention sweep).
    pub fn list_trash(&self) -> Result<Vec<(String, std::time::SystemTime)>> {
        let trash_dir = self.base.join(TRASH_DIR);
        let mut out = Vec::new();
        if !trash_dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&trash_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".meta") || !is_valid_hash(&name) {
                continue;
            }
            let mtime = entry.metadata()?.modified()?;
            out.push((name, mtime));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(tmp: &tempfile::TempDir) -> LocalBlobStore {
        LocalBlobStore::open(
            LocalStoreConfig {
                path: tmp.path().to_path_buf(),
                compression_enabled: false,
                compression_algorithm: Compression::None,
                compression_level: 3,
                encryption_enabled: false,
            },
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let data = b"hello";
        let hash = hash_bytes(data);
        store
            .put(&hash, data, BlobMetadata::new(hash.clone(), data.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), data);
        assert!(store.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn put_twice_fails_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let data = b"hello";
        let hash = hash_bytes(data);
        let meta = BlobMetadata::new(hash.clone(), data.len() as u64, Compression::None, Encryption::None);
        store.put(&hash, data, meta.clone()).await.unwrap();
        let err = store.put(&hash, data, meta).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn invalid_hash_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let meta = BlobMetadata::new("not-a-hash".into(), 1, Compression::None, Encryption::None);
        assert!(store.put("not-a-hash", b"x", meta).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_logical_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let data = b"hello";
        let hash = hash_bytes(data);
        store
            .put(&hash, data, BlobMetadata::new(hash.clone(), data.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();
        store.delete(&hash).await.unwrap();
        assert!(!store.exists(&hash).await.unwrap());
        // idempotent: deleting an already-trashed blob is a no-op
        store.delete(&hash).await.unwrap();
        let trashed = store.list_trash().unwrap();
        assert_eq!(trashed.len(), 1);
        assert_eq!(trashed[0].0, hash);
    }

    #[tokio::test]
    async fn quarantine_moves_data_file_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let data = b"hello";
        let hash = hash_bytes(data);
        store
            .put(&hash, data, BlobMetadata::new(hash.clone(), data.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();

        store.quarantine(&hash).await.unwrap();
        assert!(!store.exists(&hash).await.unwrap());
        assert!(data_path(&store.base, &hash).with_file_name(format!("{hash}.bad")).exists());

        // idempotent once quarantined
        store.quarantine(&hash).await.unwrap();
    }

    #[tokio::test]
    async fn roundtrip_with_compression_and_encryption() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::open(
            LocalStoreConfig {
                path: tmp.path().to_path_buf(),
                compression_enabled: true,
                compression_algorithm: Compression::Zstd,
                compression_level: 3,
                encryption_enabled: true,
            },
            Some(EncryptionKey::new(vec![9u8; 32]).unwrap()),
        )
        .unwrap();
        let data = b"some plaintext that compresses reasonably well well well well well";
        let hash = hash_bytes(data);
        store
            .put(&hash, data, BlobMetadata::new(hash.clone(), data.len() as u64, Compression::None, Encryption::None))
            .await
            .unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), data);
        let meta = store.get_metadata(&hash).await.unwrap();
        assert_eq!(meta.compression, Compression::Zstd);
        assert_eq!(meta.encryption, Encryption::Aes256Gcm);
    }
}
