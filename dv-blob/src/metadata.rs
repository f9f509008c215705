use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::codec::{Compression, Encryption};

/// One (dataset, version, position) triple referencing a blob by hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub dataset_id: String,
    pub version_id: String,
    pub chunk_index: u64,
}

/// The sidecar JSON stored alongside every blob (`<hash>.meta`).
///
/// `(hash, size, compression, encryption)` are immutable once the blob is
/// PUT; `references`, `tags`, `last_accessed` and `access_count` are the
/// only fields later writers may update, and only through
/// [`crate::store::BlobStore::update_metadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub hash: String,
    pub size: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub access_count: u64,
    pub references: HashSet<Reference>,
    pub compression: Compression,
    pub encryption: Encryption,
    #[serde(default)]
    pub tags: std::collections::HashMap<String, String>,
    /// Present only while a blob has been moved to `.trash`; records the
    /// original hash so empty-trash and GC can still report on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_hash: Option<String>,
}

impl BlobMetadata {
    pub fn new(hash: String, size: u64, compression: Compression, encryption: Encryption) -> Self {
        let now = chrono::Utc::now();
        Self {
            hash,
            size,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            references: HashSet::new(),
            compression,
            encryption,
            tags: Default::default(),
            original_hash: None,
        }
    }

    pub fn touch(&mut self) {
        let now = chrono::Utc::now();
        if now > self.last_accessed {
            self.last_accessed = now;
        }
        self.access_count += 1;
    }

    pub fn add_reference(&mut self, r: Reference) -> bool {
        self.references.insert(r)
    }

    pub fn remove_reference(&mut self, r: &Reference) -> bool {
        self.references.remove(r)
    }

    pub fn is_orphaned(&self) -> bool {
        self.references.is_empty()
    }
}

/// Returns whether `s` is exactly 64 lowercase hex characters.
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_hash_shape() {
        assert!(is_valid_hash(&"a".repeat(64)));
        assert!(!is_valid_hash(&"A".repeat(64)));
        assert!(!is_valid_hash("abc"));
        assert!(!is_valid_hash(&"g".repeat(64)));
    }

    #[test]
    fn metadata_reference_set_is_idempotent() {
        let mut m = BlobMetadata::new("a".repeat(64), 5, Compression::None, Encryption::None);
        let r = Reference {
            dataset_id: "d1".into(),
            version_id: "v1".into(),
            chunk_index: 0,
        };
        assert!(m.add_reference(r.clone()));
        assert!(!m.add_reference(r.clone()));
        assert!(m.remove_reference(&r));
        assert!(!m.remove_reference(&r));
        assert!(m.is_orphaned());
    }
}
