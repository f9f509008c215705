//! Durable storage for audit entries. The collaborator boundary keeps
//! `AuditLogger` storage-agnostic, the same capability-trait seam
//! `dv_blob::catalog::DatasetCatalog` uses against its backing store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::chain;
use crate::entry::AuditEntry;
use crate::error::AuditError;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn persist(&self, entry: AuditEntry) -> anyhow::Result<()>;
    async fn query_range(&self, lo: u64, hi: u64) -> anyhow::Result<Vec<AuditEntry>>;
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
    async fn verify_chain(&self, lo: u64, hi: u64) -> anyhow::Result<()>;
}

/// In-memory reference implementation, ordered by id. A durable backend
/// (e.g. an embedded database) would implement the same trait against a
/// table keyed by `id`.
pub struct MemoryRepository {
    entries: DashMap<u64, AuditEntry>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        MemoryRepository {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn persist(&self, entry: AuditEntry) -> anyhow::Result<()> {
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    async fn query_range(&self, lo: u64, hi: u64) -> anyhow::Result<Vec<AuditEntry>> {
        let mut out: Vec<AuditEntry> = self
            .entries
            .iter()
            .filter(|kv| *kv.key() >= lo && *kv.key() <= hi)
            .map(|kv| kv.value().clone())
            .collect();
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|kv| kv.value().timestamp < cutoff)
            .map(|kv| *kv.key())
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        Ok(stale.len() as u64)
    }

    async fn verify_chain(&self, lo: u64, hi: u64) -> anyhow::Result<()> {
        let entries = self.query_range(lo, hi).await?;
        if entries.is_empty() {
            anyhow::bail!(AuditError::NotFound(format!("no entries in range [{lo}, {hi}]")));
        }
        chain::verify_segment(&entries).map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::set_hash_chain;
    use crate::entry::{Action, Flags};
    use uuid::Uuid;

    fn entry(id: u64, prev: Option<String>) -> AuditEntry {
        let mut e = AuditEntry {
            id,
            timestamp: Utc::now(),
            node_id: "node-a".to_string(),
            job_id: None,
            operation_id: Uuid::new_v4(),
            role_used: "app".to_string(),
            actor: "svc".to_string(),
            source_component: "api".to_string(),
            action: Action::Select,
            table_name: None,
            query: None,
            query_hash: None,
            rows_affected: 0,
            duration_ms: 0,
            metadata: Default::default(),
            prev_hash: None,
            entry_hash: String::new(),
            flags: Flags::default(),
        };
        set_hash_chain(&mut e, prev);
        e
    }

    #[tokio::test]
    async fn persists_and_queries_range() {
        let repo = MemoryRepository::new();
        let e1 = entry(1, None);
        let e2 = entry(2, Some(e1.entry_hash.clone()));
        repo.persist(e1).await.unwrap();
        repo.persist(e2).await.unwrap();

        let found = repo.query_range(1, 2).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(repo.verify_chain(1, 2).await.is_ok());
    }

    #[tokio::test]
    async fn purge_removes_entries_before_cutoff() {
        let repo = MemoryRepository::new();
        repo.persist(entry(1, None)).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let removed = repo.purge_older_than(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.query_range(1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verify_chain_on_empty_range_fails() {
        let repo = MemoryRepository::new();
        repo.persist(entry(1, None)).await.unwrap();
        assert!(repo.verify_chain(50, 60).await.is_err());
    }
}
