//! RFC 5424 syslog exporter over TCP, UDP, or a Unix domain socket, with
//! optional TLS >= 1.2 for the TCP transport.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::sync::Mutex;

use crate::entry::{Action, AuditEntry};
use crate::export::{Exporter, ExporterHealth, HealthTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Unix,
}

#[derive(Debug, Clone)]
pub struct SyslogConfig {
    pub transport: Transport,
    pub address: String,
    pub facility: u8,
    pub app_name: String,
    pub hostname: String,
    pub tls: bool,
    pub max_retries: u32,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        SyslogConfig {
            transport: Transport::Udp,
            address: "127.0.0.1:514".to_string(),
            facility: 16,
            app_name: "dataset-vault-audit".to_string(),
            hostname: "-".to_string(),
            tls: false,
            max_retries: 3,
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
    Tls(blocking_tls::TlsStream),
}

/// TLS handshakes and writes run on a blocking thread via
/// [`openssl::ssl::SslConnector`] rather than an async TLS crate, since
/// nothing else in the dependency stack reaches for one.
mod blocking_tls {
    use openssl::ssl::{SslConnector, SslMethod, SslStream};
    use std::net::TcpStream as StdTcpStream;

    pub struct TlsStream(pub SslStream<StdTcpStream>);

    impl TlsStream {
        pub fn connect(address: &str) -> anyhow::Result<Self> {
            let std_stream = StdTcpStream::connect(address)?;
            let connector = SslConnector::builder(SslMethod::tls())?.build();
            let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
            let stream = connector.connect(host, std_stream)?;
            Ok(TlsStream(stream))
        }
    }
}

pub struct SyslogExporter {
    config: SyslogConfig,
    conn: Mutex<Option<Connection>>,
    sequence: AtomicU32,
    health: HealthTracker,
}

impl SyslogExporter {
    pub fn new(config: SyslogConfig) -> Self {
        SyslogExporter {
            config,
            conn: Mutex::new(None),
            sequence: AtomicU32::new(1),
            health: HealthTracker::default(),
        }
    }

    async fn connect(&self) -> anyhow::Result<Connection> {
        match (self.config.transport, self.config.tls) {
            (Transport::Tcp, false) => Ok(Connection::Tcp(TcpStream::connect(&self.config.address).await?)),
            (Transport::Tcp, true) => {
                let address = self.config.address.clone();
                let stream = tokio::task::spawn_blocking(move || blocking_tls::TlsStream::connect(&address)).await??;
                Ok(Connection::Tls(stream))
            }
            (Transport::Udp, _) => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(&self.config.address).await?;
                Ok(Connection::Udp(socket))
            }
            (Transport::Unix, _) => Ok(Connection::Unix(UnixStream::connect(&self.config.address).await?)),
        }
    }

    async fn write_line(&self, line: &str) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        let payload = format!("{}\n", line);
        let result = match guard.as_mut().unwrap() {
            Connection::Tcp(s) => s.write_all(payload.as_bytes()).await.map_err(anyhow::Error::from),
            Connection::Udp(s) => s.send(payload.as_bytes()).await.map(|_| ()).map_err(anyhow::Error::from),
            Connection::Unix(s) => s.write_all(payload.as_bytes()).await.map_err(anyhow::Error::from),
            Connection::Tls(s) => {
                use std::io::Write;
                s.0.write_all(payload.as_bytes()).map_err(anyhow::Error::from)
            }
        };

        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn send_with_retries(&self, line: &str) -> anyhow::Result<()> {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            match self.write_line(line).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("syslog export attempt {} failed: {}", attempt, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("syslog export failed with no attempts made")))
    }
}

fn severity_for(entry: &AuditEntry) -> u8 {
    if entry.flags.suspicious || entry.flags.alert_triggered {
        4 // warning
    } else if entry.flags.break_glass || entry.action == Action::Ddl {
        5 // notice
    } else {
        6 // info
    }
}

fn escape_sd_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace(']', "\\]")
}

pub fn format_rfc5424(entry: &AuditEntry, config: &SyslogConfig) -> String {
    let severity = severity_for(entry);
    let pri = config.facility as u32 * 8 + severity as u32;
    let timestamp = entry.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let procid = std::process::id();
    let msg_id = entry.operation_id.to_string();

    let sd = format!(
        "[bibd@0 action=\"{}\" table=\"{}\" role=\"{}\" entry_id=\"{}\"]",
        escape_sd_value(&entry.action.to_string()),
        escape_sd_value(entry.table_name.as_deref().unwrap_or("")),
        escape_sd_value(&entry.role_used),
        entry.id,
    );

    let msg = format!(
        "action={} table={} role={} rows={} duration={}ms",
        entry.action,
        entry.table_name.as_deref().unwrap_or("-"),
        entry.role_used,
        entry.rows_affected,
        entry.duration_ms,
    );

    format!(
        "<{}>1 {} {} {} {} {} {} {}",
        pri, timestamp, config.hostname, config.app_name, procid, msg_id, sd, msg
    )
}

#[async_trait]
impl Exporter for SyslogExporter {
    async fn export(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.sequence.fetch_add(1, Ordering::Relaxed);
        let line = format_rfc5424(entry, &self.config);
        let result = self.send_with_retries(&line).await;
        match &result {
            Ok(()) => self.health.record_success(),
            Err(_) => self.health.record_failure(),
        }
        result
    }

    async fn flush(&self) -> anyhow::Result<()> {
        if let Some(Connection::Tcp(s)) = self.conn.lock().await.as_mut() {
            s.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        *self.conn.lock().await = None;
        Ok(())
    }

    fn health(&self) -> ExporterHealth {
        self.health.snapshot()
    }
}
