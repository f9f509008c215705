//! Rotating JSON-lines file exporter, optionally gzip-compressed.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression as GzCompression;
use tokio::sync::Mutex;

use crate::entry::AuditEntry;
use crate::export::{entry_to_line, Exporter, ExporterHealth, HealthTracker};

#[derive(Debug, Clone)]
pub struct FileExportConfig {
    pub directory: PathBuf,
    pub prefix: String,
    pub gzip: bool,
    pub max_file_size: u64,
    pub max_age: chrono::Duration,
}

struct OpenFile {
    path: PathBuf,
    size: u64,
    file: std::fs::File,
}

pub struct FileExporter {
    config: FileExportConfig,
    current: Mutex<Option<OpenFile>>,
    health: HealthTracker,
}

impl FileExporter {
    pub fn new(config: FileExportConfig) -> Self {
        FileExporter {
            config,
            current: Mutex::new(None),
            health: HealthTracker::default(),
        }
    }

    fn new_file_path(&self) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.f");
        let ext = if self.config.gzip { "jsonl.gz" } else { "jsonl" };
        self.config.directory.join(format!("{}-{}.{}", self.config.prefix, timestamp, ext))
    }

    fn open_new(&self) -> anyhow::Result<OpenFile> {
        std::fs::create_dir_all(&self.config.directory)?;
        let path = self.new_file_path();
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(OpenFile { path, size: 0, file })
    }

    fn write_record(&self, open: &mut OpenFile, record: &[u8]) -> anyhow::Result<()> {
        if self.config.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
            encoder.write_all(record)?;
            let compressed = encoder.finish()?;
            open.file.write_all(&compressed)?;
            open.size += compressed.len() as u64;
        } else {
            open.file.write_all(record)?;
            open.size += record.len() as u64;
        }
        Ok(())
    }

    pub fn cleanup(&self) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - self.config.max_age;
        let mut removed = 0;
        if !self.config.directory.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.config.directory)? {
            let entry = entry?;
            let path = entry.path();
            if !is_our_file(&path, &self.config.prefix) {
                continue;
            }
            let modified: chrono::DateTime<Utc> = entry.metadata()?.modified()?.into();
            if modified < cutoff {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn is_our_file(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(prefix))
        .unwrap_or(false)
}

#[async_trait]
impl Exporter for FileExporter {
    async fn export(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let mut record = entry_to_line(entry)?;
        record.push('\n');
        let bytes = record.into_bytes();

        let mut guard = self.current.lock().await;
        let needs_new = match guard.as_ref() {
            None => true,
            Some(open) => open.size + bytes.len() as u64 > self.config.max_file_size,
        };
        if needs_new {
            *guard = Some(self.open_new()?);
        }
        let open = guard.as_mut().unwrap();
        let result = self.write_record(open, &bytes);
        match &result {
            Ok(()) => self.health.record_success(),
            Err(_) => self.health.record_failure(),
        }
        result
    }

    async fn flush(&self) -> anyhow::Result<()> {
        if let Some(open) = self.current.lock().await.as_mut() {
            open.file.flush()?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.flush().await?;
        *self.current.lock().await = None;
        Ok(())
    }

    fn health(&self) -> ExporterHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Action, Flags};
    use uuid::Uuid;

    fn sample_entry() -> AuditEntry {
        AuditEntry {
            id: 1,
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
            duration_ms: 2,
            metadata: Default::default(),
            prev_hash: None,
            entry_hash: String::new(),
            flags: Flags::default(),
        }
    }

    #[tokio::test]
    async fn writes_jsonl_records() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FileExporter::new(FileExportConfig {
            directory: dir.path().to_path_buf(),
            prefix: "audit".to_string(),
            gzip: false,
            max_file_size: 1_000_000,
            max_age: chrono::Duration::days(30),
        });
        exporter.export(&sample_entry()).await.unwrap();
        exporter.close().await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("\"id\":1"));
    }

    #[tokio::test]
    async fn rotates_when_max_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = FileExporter::new(FileExportConfig {
            directory: dir.path().to_path_buf(),
            prefix: "audit".to_string(),
            gzip: false,
            max_file_size: 1,
            max_age: chrono::Duration::days(30),
        });
        exporter.export(&sample_entry()).await.unwrap();
        exporter.export(&sample_entry()).await.unwrap();
        exporter.close().await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
    }
}
