//! Batched S3 exporter: entries accumulate in memory and upload as a
//! single JSON-lines object, partitioned by time. Mirrors the `S3Client`
//! capability split used by `dv-blob::s3` so either crate can be tested
//! against an in-memory double without a network dependency.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression as GzCompression;
use tokio::sync::Mutex;

use crate::entry::AuditEntry;
use crate::export::{entry_to_line, Exporter, ExporterHealth, HealthTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionBy {
    Hour,
    Day,
    Month,
}

impl PartitionBy {
    fn path_segment(self, timestamp: DateTime<Utc>) -> String {
        match self {
            PartitionBy::Hour => timestamp.format("%Y/%m/%d/%H").to_string(),
            PartitionBy::Day => timestamp.format("%Y/%m/%d").to_string(),
            PartitionBy::Month => timestamp.format("%Y/%m").to_string(),
        }
    }
}

#[async_trait]
pub trait S3Client: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>, metadata: HashMap<String, String>) -> anyhow::Result<()>;
}

pub struct AwsS3Client {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl AwsS3Client {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        AwsS3Client { client, bucket: bucket.into() }
    }
}

#[async_trait]
impl S3Client for AwsS3Client {
    async fn put_object(&self, key: &str, body: Vec<u8>, metadata: HashMap<String, String>) -> anyhow::Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(body));
        for (k, v) in metadata {
            request = request.metadata(k, v);
        }
        request.send().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct S3ExportConfig {
    pub prefix: String,
    pub batch_size: usize,
    pub gzip: bool,
    pub partition_by: PartitionBy,
    pub node_id: String,
}

pub struct S3Exporter {
    client: Arc<dyn S3Client>,
    config: S3ExportConfig,
    buffer: Mutex<Vec<AuditEntry>>,
    health: HealthTracker,
}

impl S3Exporter {
    pub fn new(client: Arc<dyn S3Client>, config: S3ExportConfig) -> Self {
        S3Exporter {
            client,
            config,
            buffer: Mutex::new(Vec::new()),
            health: HealthTracker::default(),
        }
    }

    fn object_key(&self, first_timestamp: DateTime<Utc>) -> String {
        let partition = self.config.partition_by.path_segment(first_timestamp);
        let ext = if self.config.gzip { "jsonl.gz" } else { "jsonl" };
        format!(
            "{}/{}/audit-{}.{}",
            self.config.prefix,
            partition,
            first_timestamp.format("%Y%m%dT%H%M%S%.f"),
            ext
        )
    }

    async fn upload(&self, batch: Vec<AuditEntry>) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let first = batch.first().unwrap().timestamp;
        let last = batch.last().unwrap().timestamp;
        let key = self.object_key(first);

        let mut body = String::new();
        for entry in &batch {
            body.push_str(&entry_to_line(entry)?);
            body.push('\n');
        }
        let bytes = if self.config.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
            encoder.write_all(body.as_bytes())?;
            encoder.finish()?
        } else {
            body.into_bytes()
        };

        let mut metadata = HashMap::new();
        metadata.insert("entry_count".to_string(), batch.len().to_string());
        metadata.insert("first_entry".to_string(), first.to_rfc3339());
        metadata.insert("last_entry".to_string(), last.to_rfc3339());
        metadata.insert("node_id".to_string(), self.config.node_id.clone());

        if let Err(e) = self.client.put_object(&key, bytes, metadata).await {
            self.health.record_failure();
            let mut guard = self.buffer.lock().await;
            let mut restored = batch;
            restored.append(&mut guard);
            *guard = restored;
            return Err(e);
        }
        self.health.record_success();
        Ok(())
    }
}

#[async_trait]
impl Exporter for S3Exporter {
    async fn export(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let batch = {
            let mut guard = self.buffer.lock().await;
            guard.push(entry.clone());
            if guard.len() >= self.config.batch_size {
                Some(std::mem::take(&mut *guard))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.upload(batch).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let batch = {
            let mut guard = self.buffer.lock().await;
            std::mem::take(&mut *guard)
        };
        self.upload(batch).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.flush().await
    }

    fn health(&self) -> ExporterHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Action, Flags};
    use dashmap::DashMap;
    use uuid::Uuid;

    struct MemoryS3Client {
        objects: DashMap<String, (Vec<u8>, HashMap<String, String>)>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl MemoryS3Client {
        fn new() -> Self {
            MemoryS3Client {
                objects: DashMap::new(),
                fail_next: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl S3Client for MemoryS3Client {
        async fn put_object(&self, key: &str, body: Vec<u8>, metadata: HashMap<String, String>) -> anyhow::Result<()> {
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("simulated upload failure");
            }
            self.objects.insert(key.to_string(), (body, metadata));
            Ok(())
        }
    }

    fn sample_entry(id: u64) -> AuditEntry {
        AuditEntry {
            id,
            timestamp: Utc::now(),
            node_id: "node-a".to_string(),
            job_id: None,
            operation_id: Uuid::new_v4(),
            role_used: "app".to_string(),
            actor: "svc".to_string(),
            source_component: "api".to_string(),
            action: Action::Select,
            table_name: Some("users".to_string()),
            query: None,
            query_hash: None,
            rows_affected: 1,
            duration_ms: 1,
            metadata: Default::default(),
            prev_hash: None,
            entry_hash: String::new(),
            flags: Flags::default(),
        }
    }

    #[tokio::test]
    async fn uploads_on_batch_size() {
        let client = Arc::new(MemoryS3Client::new());
        let exporter = S3Exporter::new(
            client.clone(),
            S3ExportConfig {
                prefix: "audit".to_string(),
                batch_size: 2,
                gzip: false,
                partition_by: PartitionBy::Day,
                node_id: "node-a".to_string(),
            },
        );
        exporter.export(&sample_entry(1)).await.unwrap();
        assert!(client.objects.is_empty());
        exporter.export(&sample_entry(2)).await.unwrap();
        assert_eq!(client.objects.len(), 1);
    }

    #[tokio::test]
    async fn failed_upload_restores_buffer_for_retry() {
        let client = Arc::new(MemoryS3Client::new());
        client.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let exporter = S3Exporter::new(
            client.clone(),
            S3ExportConfig {
                prefix: "audit".to_string(),
                batch_size: 1,
                gzip: true,
                partition_by: PartitionBy::Hour,
                node_id: "node-a".to_string(),
            },
        );
        assert!(exporter.export(&sample_entry(1)).await.is_err());
        assert!(client.objects.is_empty());

        exporter.flush().await.unwrap();
        assert_eq!(client.objects.len(), 1);
    }
}
