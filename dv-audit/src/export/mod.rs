//! Optional, independently-failing audit sinks. Every exporter implements
//! [`Exporter`]; a failure from one never stops the others (spec §7: "Audit
//! exporters never cause audit failure").

pub mod file;
pub mod s3;
pub mod syslog;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entry::AuditEntry;

#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, entry: &AuditEntry) -> anyhow::Result<()>;
    async fn flush(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;

    /// Last successful export and the current run of consecutive
    /// failures, so a caller can skip an exporter's retry cost when it is
    /// visibly broken. Exporters that don't track health return the
    /// default (unknown) snapshot.
    fn health(&self) -> ExporterHealth {
        ExporterHealth::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExporterHealth {
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Shared success/failure bookkeeping embedded by each concrete exporter.
#[derive(Default)]
pub(crate) struct HealthTracker {
    last_success: Mutex<Option<DateTime<Utc>>>,
    consecutive_failures: AtomicU32,
}

impl HealthTracker {
    pub(crate) fn record_success(&self) {
        *self.last_success.lock().unwrap() = Some(Utc::now());
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> ExporterHealth {
        ExporterHealth {
            last_success: *self.last_success.lock().unwrap(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
        }
    }
}

pub(crate) fn entry_to_line(entry: &AuditEntry) -> anyhow::Result<String> {
    Ok(serde_json::to_string(entry)?)
}
