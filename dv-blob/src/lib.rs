//! Content-addressed blob storage.
//!
//! Chunk bytes are hashed (SHA-256 of the plaintext), optionally
//! compressed then encrypted ([`codec`]), and written through a
//! [`store::BlobStore`] backend: [`local::LocalBlobStore`] (filesystem),
//! [`s3::S3BlobStore`] (object storage via the [`s3::S3Client`]
//! capability), or [`hybrid::HybridBlobStore`] (hot+cold composition with
//! LRU/age tiering). [`ingest::Ingestor`] handles hash verification and
//! dedup-aware reference counting against a [`catalog::DatasetCatalog`]
//! collaborator; [`gc::GarbageCollector`] reconciles the store against
//! that same catalog on a schedule ("mark" = live hash set from the
//! catalog, "sweep" = anything else old enough to trash).

pub mod catalog;
pub mod codec;
pub mod error;
pub mod gc;
pub mod hybrid;
pub mod ingest;
pub mod local;
pub mod metadata;
pub mod s3;
pub mod store;

pub use catalog::{Chunk, ChunkDescriptor, ChunkStatus, DatasetCatalog};
pub use codec::{Compression, Encryption, EncryptionKey};
pub use error::BlobError;
pub use gc::{GarbageCollector, GcConfig, GcMethod, GcReport};
pub use hybrid::{HybridBlobStore, TieringConfig, TieringStrategy};
pub use ingest::{IntegrityReport, Ingestor};
pub use local::{LocalBlobStore, LocalStoreConfig};
pub use metadata::{BlobMetadata, Reference};
pub use s3::{AwsS3Client, S3BlobStore, S3Client};
pub use store::{Backend, BlobStore, Stats};
