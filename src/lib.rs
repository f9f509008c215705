//! This crate ties together the two subsystems of the dataset service's
//! storage layer.
//!
//! # Blob engine
//!
//! Chunk bytes handed to an [`dv_blob::Ingestor`] are hashed, deduplicated
//! and written through a [`dv_blob::BlobStore`] backend (local filesystem,
//! S3-compatible, or a hot/cold [`dv_blob::HybridBlobStore`]). A blob is
//! addressed purely by the SHA-256 of its plaintext; the store never knows
//! about datasets or versions, only about hashes and the reference sets
//! attached to their metadata. A [`dv_blob::GarbageCollector`] reconciles
//! the store against the catalog on a schedule, moving unreferenced blobs
//! to a same-namespace trash area before physically removing them after a
//! retention window.
//!
//! # Audit pipeline
//!
//! Every query the system runs produces a [`dv_audit::AuditEntry`] via
//! [`dv_audit::AuditLogger`]: the entry is redacted, chained by hash to the
//! previous entry in the log, checked against alert rules and a sliding
//! window rate limiter, published to an in-process stream, and handed to
//! whichever exporters (syslog, rotating files, batched S3 objects) are
//! enabled. None of this depends on the blob engine; the two subsystems
//! share only their ambient error/logging conventions.
//!
//! Both subsystems are deliberately free of any knowledge of the
//! relational store or the HTTP/CLI front end that drives them — see
//! [`dv_blob::DatasetCatalog`] and [`dv_audit::Repository`] for the
//! collaborator boundaries they're built against.

pub use dv_audit;
pub use dv_blob;
