//! Per-entry SHA-256 hash chaining over a fixed canonical field tuple.
//!
//! The field order and delimiter are part of the external wire format
//! and must never change without a chain-format version bump — every
//! consumer that recomputes a hash to verify a chain segment has to
//! agree on exactly this layout.

use openssl::sha::Sha256;

use crate::entry::AuditEntry;

const DELIMITER: char = '|';

/// Builds the canonical string hashed into `entry_hash`. Exposed so the
/// repository's `verify_chain` can recompute without duplicating the field
/// order.
pub fn canonical_form(entry: &AuditEntry) -> String {
    let fields = [
        entry.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        entry.node_id.clone(),
        entry.operation_id.to_string(),
        entry.role_used.clone(),
        entry.action.to_string(),
        entry.table_name.clone().unwrap_or_default(),
        entry.source_component.clone(),
        entry.rows_affected.to_string(),
        entry.duration_ms.to_string(),
        entry.prev_hash.clone().unwrap_or_default(),
        entry.job_id.clone().unwrap_or_default(),
        entry.query_hash.clone().unwrap_or_default(),
    ];
    fields.join(&DELIMITER.to_string())
}

pub fn compute_hash(entry: &AuditEntry) -> String {
    let canonical = canonical_form(entry);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finish())
}

/// Assigns `prev_hash` and derives `entry_hash` from it in one step, so
/// callers can never compute the hash against a stale `prev_hash`.
pub fn set_hash_chain(entry: &mut AuditEntry, prev: Option<String>) {
    entry.prev_hash = prev;
    entry.entry_hash = compute_hash(entry);
}

/// Verifies that each entry's stored `entry_hash` matches recomputation,
/// and that it equals the following entry's `prev_hash`. `entries` must be
/// in ascending `id` order.
pub fn verify_segment(entries: &[AuditEntry]) -> Result<(), ChainError> {
    for (i, entry) in entries.iter().enumerate() {
        let recomputed = compute_hash(entry);
        if recomputed != entry.entry_hash {
            return Err(ChainError::HashMismatch { id: entry.id });
        }
        if let Some(next) = entries.get(i + 1) {
            if next.prev_hash.as_deref() != Some(entry.entry_hash.as_str()) {
                return Err(ChainError::Broken {
                    id: entry.id,
                    next_id: next.id,
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("entry {id} hash does not match recomputed value")]
    HashMismatch { id: u64 },
    #[error("chain broken between entry {id} and {next_id}")]
    Broken { id: u64, next_id: u64 },
}
