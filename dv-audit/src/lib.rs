//! Per-query audit recording.
//!
//! [`logger::AuditLogger`] is the orchestration point: it classifies and
//! redacts a query ([`redact`]), observes it against a
//! [`ratelimit::RateLimiter`] and an [`alert::AlertDetector`], chain-links
//! it ([`chain`]), persists it through a [`repository::Repository`]
//! collaborator, and fans it out to a [`stream::Streamer`] and any
//! configured [`export`] sinks. Exporter failures never fail the log
//! call; repository failures do, since the repository is the
//! authoritative record.

pub mod alert;
pub mod chain;
pub mod config;
pub mod entry;
pub mod error;
pub mod export;
pub mod expr;
pub mod logger;
pub mod ratelimit;
pub mod redact;
pub mod repository;
pub mod stream;

pub use alert::{Alert, AlertDetector, ExpressionRule, GroupBy, Severity, ThresholdRule};
pub use chain::ChainError;
pub use config::AuditConfig;
pub use entry::{Action, AuditEntry, Flags, QueryInfo};
pub use error::AuditError;
pub use export::Exporter;
pub use logger::{AuditLogger, AuditLoggerConfig};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use redact::Redactor;
pub use repository::{MemoryRepository, Repository};
pub use stream::{BatchedStreamer, StreamProcessor, Streamer};
