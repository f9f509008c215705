//! Ties the per-query pipeline together: redact, rate-limit, alert,
//! chain, persist, publish, export. See spec §4.12.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::alert::AlertDetector;
use crate::chain;
use crate::entry::{AuditEntry, Flags, QueryInfo};
use crate::export::Exporter;
use crate::ratelimit::{RateLimitSubject, RateLimiter};
use crate::redact::{self, Redactor};
use crate::repository::Repository;
use crate::stream::Streamer;

const EXPORTER_SKIP_THRESHOLD: u32 = 5;

pub struct AuditLoggerConfig {
    pub hash_chain: bool,
    pub node_id: String,
    pub retention_days: i64,
}

struct ChainState {
    last_hash: Option<String>,
    entry_count: u64,
}

pub struct AuditLogger {
    config: AuditLoggerConfig,
    repository: Arc<dyn Repository>,
    streamer: Arc<Streamer>,
    exporters: Vec<Arc<dyn Exporter>>,
    redactor: Redactor,
    rate_limiter: Option<Arc<RateLimiter>>,
    alert_detector: Option<Arc<AlertDetector>>,
    chain_state: StdMutex<ChainState>,
    next_id: AtomicU64,
}

impl AuditLogger {
    pub fn new(
        config: AuditLoggerConfig,
        repository: Arc<dyn Repository>,
        streamer: Arc<Streamer>,
        redactor: Redactor,
    ) -> Self {
        AuditLogger {
            config,
            repository,
            streamer,
            exporters: Vec::new(),
            redactor,
            rate_limiter: None,
            alert_detector: None,
            chain_state: StdMutex::new(ChainState { last_hash: None, entry_count: 0 }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_alert_detector(mut self, detector: Arc<AlertDetector>) -> Self {
        self.alert_detector = Some(detector);
        self
    }

    pub async fn log(
        &self,
        query_info: QueryInfo,
        role_used: &str,
        source_component: &str,
        actor: &str,
    ) -> anyhow::Result<AuditEntry> {
        let action = redact::parse_action(&query_info.query);
        let table_name = redact::extract_table(&query_info.query);
        let query_hash = redact::hash_query(&query_info.query);
        let (redacted_query, sensitive_indices) = self.redactor.redact_query(&query_info.query);
        let redacted_args = self.redactor.redact_args(&query_info.args, &sensitive_indices);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert(
            "args".to_string(),
            Value::Array(redacted_args.into_iter().map(Value::String).collect()),
        );
        if let Some(err) = &query_info.error {
            metadata.insert("error".to_string(), Value::String(err.clone()));
        }

        let mut flags = Flags::default();

        if let Some(limiter) = &self.rate_limiter {
            let subject = RateLimitSubject {
                role_used,
                actor,
                action: &action.to_string(),
                table_name: table_name.as_deref(),
            };
            let decision = limiter.check(&subject);
            if !decision.allowed {
                flags.rate_limited = true;
                if let Some(reason) = decision.reason {
                    metadata.insert("rate_limit_reason".to_string(), Value::String(reason));
                }
            }
        }

        let mut entry = AuditEntry {
            // Allocated below, inside the chain-lock critical section: the
            // id order must match the order entries complete that section
            // or `verify_chain`'s id-ordered scan can see a `prev_hash`
            // that points at a higher id than its own.
            id: 0,
            timestamp: Utc::now(),
            node_id: self.config.node_id.clone(),
            job_id: query_info.job_id.clone(),
            operation_id: Uuid::new_v4(),
            role_used: role_used.to_string(),
            actor: actor.to_string(),
            source_component: source_component.to_string(),
            action,
            table_name,
            query: Some(redacted_query),
            query_hash: Some(query_hash),
            rows_affected: query_info.rows_affected,
            duration_ms: query_info.duration_ms,
            metadata,
            prev_hash: None,
            entry_hash: String::new(),
            flags,
        };

        if let Some(detector) = &self.alert_detector {
            let alerts = detector.check(&entry);
            if !alerts.is_empty() {
                entry.flags.alert_triggered = true;
                entry.flags.suspicious = true;
                let alert_summaries: Vec<Value> = alerts
                    .iter()
                    .map(|a| {
                        serde_json::json!({
                            "rule": a.rule_name,
                            "severity": format!("{:?}", a.severity),
                            "observed_count": a.observed_count,
                            "threshold": a.threshold,
                        })
                    })
                    .collect();
                entry.metadata.insert("alerts".to_string(), Value::Array(alert_summaries));

                if let Some(limiter) = &self.rate_limiter {
                    for alert in &alerts {
                        if alert.trigger_rate_limit {
                            limiter.trigger_block(&format!("actor:{}", actor), limiter.block_duration());
                        }
                    }
                }
            }
        }

        {
            let mut state = self.chain_state.lock().unwrap();
            entry.id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if self.config.hash_chain {
                chain::set_hash_chain(&mut entry, state.last_hash.clone());
                state.last_hash = Some(entry.entry_hash.clone());
            }
            state.entry_count += 1;
        }

        self.repository.persist(entry.clone()).await?;

        self.streamer.publish(entry.clone()).await;
        for exporter in &self.exporters {
            if exporter.health().consecutive_failures >= EXPORTER_SKIP_THRESHOLD {
                log::warn!("skipping visibly broken exporter after {EXPORTER_SKIP_THRESHOLD} consecutive failures");
                continue;
            }
            if let Err(e) = exporter.export(&entry).await {
                log::warn!("audit exporter failed, continuing: {}", e);
            }
        }

        Ok(entry)
    }

    pub async fn purge(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        self.repository.purge_older_than(cutoff).await
    }

    pub async fn verify_chain(&self, lo: u64, hi: u64) -> anyhow::Result<()> {
        self.repository.verify_chain(lo, hi).await
    }

    pub fn entry_count(&self) -> u64 {
        self.chain_state.lock().unwrap().entry_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertDetector, GroupBy, Severity, ThresholdRule};
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::repository::MemoryRepository;

    fn logger() -> AuditLogger {
        AuditLogger::new(
            AuditLoggerConfig {
                hash_chain: true,
                node_id: "node-a".to_string(),
                retention_days: 90,
            },
            Arc::new(MemoryRepository::new()),
            Arc::new(Streamer::new(100)),
            Redactor::new(&["password".to_string()], &[], "[REDACTED]"),
        )
    }

    #[tokio::test]
    async fn logs_and_chains_entries() {
        let logger = logger();
        let q1 = QueryInfo {
            query: "INSERT INTO users(name, password) VALUES($1, $2)".to_string(),
            args: vec!["alice".to_string(), "s3cr3t".to_string()],
            rows_affected: 1,
            duration_ms: 2,
            error: None,
            job_id: None,
        };
        let e1 = logger.log(q1, "app", "api", "svc").await.unwrap();
        assert!(e1.query.as_ref().unwrap().contains("alice"));
        assert!(!e1.metadata["args"].to_string().contains("s3cr3t"));
        assert!(e1.prev_hash.is_none());

        let q2 = QueryInfo {
            query: "SELECT * FROM users".to_string(),
            args: vec![],
            rows_affected: 5,
            duration_ms: 1,
            error: None,
            job_id: None,
        };
        let e2 = logger.log(q2, "app", "api", "svc").await.unwrap();
        assert_eq!(e2.prev_hash.as_deref(), Some(e1.entry_hash.as_str()));

        assert!(logger.verify_chain(e1.id, e2.id).await.is_ok());
        assert_eq!(logger.entry_count(), 2);
    }

    #[tokio::test]
    async fn rate_limited_entry_is_still_recorded() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            enabled: true,
            default_limit: 0,
            default_window: std::time::Duration::from_secs(60),
            block_duration: std::time::Duration::from_secs(60),
            bypass_roles: vec![],
            limits_by_action: Default::default(),
            limits_by_table: Default::default(),
        }));
        let logger = logger().with_rate_limiter(limiter);
        let q = QueryInfo {
            query: "SELECT 1".to_string(),
            args: vec![],
            rows_affected: 0,
            duration_ms: 0,
            error: None,
            job_id: None,
        };
        let entry = logger.log(q, "app", "api", "svc").await.unwrap();
        assert!(entry.flags.rate_limited);
    }

    #[tokio::test]
    async fn alert_sets_suspicious_and_triggered_flags() {
        let rule = ThresholdRule {
            name: "deletes".to_string(),
            description: "too many deletes".to_string(),
            filter_action: Some(crate::entry::Action::Delete),
            filter_table: None,
            filter_role: None,
            group_by: GroupBy::Global,
            threshold: 1,
            window: std::time::Duration::from_secs(60),
            severity: Severity::Critical,
            trigger_rate_limit: false,
        };
        let detector = Arc::new(AlertDetector::new(vec![rule], vec![]));
        let logger = logger().with_alert_detector(detector);
        let q = QueryInfo {
            query: "DELETE FROM users".to_string(),
            args: vec![],
            rows_affected: 3,
            duration_ms: 1,
            error: None,
            job_id: None,
        };
        let entry = logger.log(q, "app", "api", "svc").await.unwrap();
        assert!(entry.flags.alert_triggered);
        assert!(entry.flags.suspicious);
    }

    #[tokio::test]
    async fn alert_triggered_block_uses_configured_block_duration() {
        let rule = ThresholdRule {
            name: "bulk_delete".to_string(),
            description: "too many deletes".to_string(),
            filter_action: Some(crate::entry::Action::Delete),
            filter_table: None,
            filter_role: None,
            group_by: GroupBy::Actor,
            threshold: 1,
            window: std::time::Duration::from_secs(300),
            severity: Severity::Critical,
            trigger_rate_limit: true,
        };
        let detector = Arc::new(AlertDetector::new(vec![rule], vec![]));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            enabled: true,
            default_limit: 100,
            default_window: std::time::Duration::from_secs(300),
            block_duration: std::time::Duration::from_secs(300),
            bypass_roles: vec![],
            limits_by_action: Default::default(),
            limits_by_table: Default::default(),
        }));
        let logger = logger().with_alert_detector(detector).with_rate_limiter(limiter.clone());
        let q = QueryInfo {
            query: "DELETE FROM users".to_string(),
            args: vec![],
            rows_affected: 1,
            duration_ms: 1,
            error: None,
            job_id: None,
        };
        let entry = logger.log(q, "app", "api", "eve").await.unwrap();
        assert!(entry.flags.alert_triggered);

        let snapshot = limiter.snapshot();
        assert!(snapshot.contains_key("actor:eve"));

        // a fresh check for eve is rejected well inside the 5-minute
        // block_duration the rule configured, not the old 60s default.
        let subject = RateLimitSubject {
            role_used: "app",
            actor: "eve",
            action: "SELECT",
            table_name: None,
        };
        assert!(!limiter.check(&subject).allowed);
    }

    #[tokio::test]
    async fn concurrent_logs_chain_in_completion_order() {
        let logger = Arc::new(logger());
        let make_query = |n: u64| QueryInfo {
            query: format!("SELECT {n}"),
            args: vec![],
            rows_affected: 0,
            duration_ms: 0,
            error: None,
            job_id: None,
        };

        let l1 = logger.clone();
        let l2 = logger.clone();
        let (e1, e2) = tokio::join!(
            l1.log(make_query(1), "app", "api", "svc"),
            l2.log(make_query(2), "app", "api", "svc"),
        );
        let e1 = e1.unwrap();
        let e2 = e2.unwrap();

        // whichever entry completed the chain-lock section second must
        // carry the first one's entry_hash as its prev_hash, regardless of
        // which `log()` call was issued first.
        let (first, second) = if e1.id < e2.id { (e1, e2) } else { (e2, e1) };
        assert_eq!(second.prev_hash.as_deref(), Some(first.entry_hash.as_str()));
        assert!(logger.verify_chain(first.id, second.id).await.is_ok());
    }
}
