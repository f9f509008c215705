//! Threshold and expression-based alerting over the live entry stream.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entry::{Action, AuditEntry};
use crate::expr::{self, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupBy {
    Actor,
    NodeId,
    Role,
    Table,
    Action,
    Source,
    Global,
}

impl GroupBy {
    fn value(self, entry: &AuditEntry) -> String {
        match self {
            GroupBy::Actor => entry.actor.clone(),
            GroupBy::NodeId => entry.node_id.clone(),
            GroupBy::Role => entry.role_used.clone(),
            GroupBy::Table => entry.table_name.clone().unwrap_or_default(),
            GroupBy::Action => entry.action.to_string(),
            GroupBy::Source => entry.source_component.clone(),
            GroupBy::Global => "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub name: String,
    pub description: String,
    pub filter_action: Option<Action>,
    pub filter_table: Option<String>,
    pub filter_role: Option<String>,
    pub group_by: GroupBy,
    pub threshold: usize,
    pub window: Duration,
    pub severity: Severity,
    pub trigger_rate_limit: bool,
}

impl ThresholdRule {
    fn matches_filters(&self, entry: &AuditEntry) -> bool {
        if let Some(a) = self.filter_action {
            if entry.action != a {
                return false;
            }
        }
        if let Some(t) = &self.filter_table {
            if entry.table_name.as_deref() != Some(t.as_str()) {
                return false;
            }
        }
        if let Some(r) = &self.filter_role {
            if &entry.role_used != r {
                return false;
            }
        }
        true
    }
}

pub struct ExpressionRule {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub trigger_rate_limit: bool,
    pub expr: Expr,
}

impl ExpressionRule {
    pub fn compile(
        name: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        trigger_rate_limit: bool,
        source: &str,
    ) -> anyhow::Result<Self> {
        let expr = expr::parse(source).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(ExpressionRule {
            name: name.into(),
            description: description.into(),
            severity,
            trigger_rate_limit,
            expr,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub rule_name: String,
    pub description: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub entry_id: u64,
    pub observed_count: Option<usize>,
    pub threshold: Option<usize>,
    pub trigger_rate_limit: bool,
}

type Callback = Box<dyn Fn(&Alert) + Send + Sync>;

pub struct AlertDetector {
    threshold_rules: Vec<ThresholdRule>,
    expression_rules: Vec<ExpressionRule>,
    counters: RwLock<HashMap<(String, String), Vec<Instant>>>,
    callbacks: Mutex<Vec<Callback>>,
}

impl AlertDetector {
    pub fn new(threshold_rules: Vec<ThresholdRule>, expression_rules: Vec<ExpressionRule>) -> Self {
        AlertDetector {
            threshold_rules,
            expression_rules,
            counters: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn check(&self, entry: &AuditEntry) -> Vec<Alert> {
        let mut fired = Vec::new();
        let now = Instant::now();

        for rule in &self.threshold_rules {
            if !rule.matches_filters(entry) {
                continue;
            }
            let group_value = rule.group_by.value(entry);
            let key = (rule.name.clone(), group_value);
            let mut counters = self.counters.write().unwrap();
            let timestamps = counters.entry(key).or_default();
            timestamps.retain(|t| now.duration_since(*t) <= rule.window);
            timestamps.push(now);
            let count = timestamps.len();
            if count >= rule.threshold {
                fired.push(Alert {
                    rule_name: rule.name.clone(),
                    description: rule.description.clone(),
                    severity: rule.severity,
                    timestamp: entry.timestamp,
                    entry_id: entry.id,
                    observed_count: Some(count),
                    threshold: Some(rule.threshold),
                    trigger_rate_limit: rule.trigger_rate_limit,
                });
            }
        }

        let fields = entry_fields(entry);
        for rule in &self.expression_rules {
            let matched = expr::eval(&rule.expr, &fields).unwrap_or(false);
            if matched {
                fired.push(Alert {
                    rule_name: rule.name.clone(),
                    description: rule.description.clone(),
                    severity: rule.severity,
                    timestamp: entry.timestamp,
                    entry_id: entry.id,
                    observed_count: None,
                    threshold: None,
                    trigger_rate_limit: rule.trigger_rate_limit,
                });
            }
        }

        let callbacks = self.callbacks.lock().unwrap();
        for alert in &fired {
            for cb in callbacks.iter() {
                cb(alert);
            }
        }

        fired
    }

    /// Prunes expired timestamps for every rule's window, then drops
    /// counters left with nothing in them. Run periodically by the owning
    /// [`crate::logger::AuditLogger`].
    pub fn cleanup(&self) {
        let now = Instant::now();
        let windows: HashMap<&str, Duration> = self
            .threshold_rules
            .iter()
            .map(|r| (r.name.as_str(), r.window))
            .collect();
        let mut counters = self.counters.write().unwrap();
        for (key, timestamps) in counters.iter_mut() {
            if let Some(window) = windows.get(key.0.as_str()) {
                timestamps.retain(|t| now.duration_since(*t) <= *window);
            }
        }
        counters.retain(|_, timestamps| !timestamps.is_empty());
    }
}

fn entry_fields(entry: &AuditEntry) -> HashMap<String, Value> {
    let keys = [
        "node_id",
        "job_id",
        "operation_id",
        "role_used",
        "action",
        "table_name",
        "rows_affected",
        "duration_ms",
        "source_component",
        "actor",
        "suspicious",
        "break_glass",
    ];
    let mut map = HashMap::new();
    for k in keys {
        if let Some(v) = entry.field(k) {
            map.insert(k.to_string(), v);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Flags;
    use uuid::Uuid;

    fn base_entry(id: u64, action: Action, table: &str) -> AuditEntry {
        AuditEntry {
            id,
            timestamp: Utc::now(),
            node_id: "node-a".to_string(),
            job_id: None,
            operation_id: Uuid::new_v4(),
            role_used: "app".to_string(),
            actor: "alice".to_string(),
            source_component: "api".to_string(),
            action,
            table_name: Some(table.to_string()),
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

    #[test]
    fn threshold_rule_fires_after_enough_hits() {
        let rule = ThresholdRule {
            name: "many_deletes".to_string(),
            description: "too many deletes".to_string(),
            filter_action: Some(Action::Delete),
            filter_table: None,
            filter_role: None,
            group_by: GroupBy::Actor,
            threshold: 3,
            window: Duration::from_secs(60),
            severity: Severity::Warning,
            trigger_rate_limit: true,
        };
        let detector = AlertDetector::new(vec![rule], vec![]);

        let mut fired_total = 0;
        for i in 1..=3 {
            let entry = base_entry(i, Action::Delete, "users");
            fired_total += detector.check(&entry).len();
        }
        assert_eq!(fired_total, 1);
    }

    #[test]
    fn filters_exclude_non_matching_entries() {
        let rule = ThresholdRule {
            name: "ddl_watch".to_string(),
            description: "ddl activity".to_string(),
            filter_action: Some(Action::Ddl),
            filter_table: None,
            filter_role: None,
            group_by: GroupBy::Global,
            threshold: 1,
            window: Duration::from_secs(60),
            severity: Severity::Critical,
            trigger_rate_limit: false,
        };
        let detector = AlertDetector::new(vec![rule], vec![]);
        let entry = base_entry(1, Action::Select, "users");
        assert!(detector.check(&entry).is_empty());
    }

    #[test]
    fn expression_rule_matches_large_deletes() {
        let mut entry = base_entry(1, Action::Delete, "users");
        entry.rows_affected = 10_000;
        let rule = ExpressionRule::compile(
            "bulk_delete",
            "large delete",
            Severity::Critical,
            true,
            "action == 'DELETE' && rows_affected > 1000",
        )
        .unwrap();
        let detector = AlertDetector::new(vec![], vec![rule]);
        let fired = detector.check(&entry);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].trigger_rate_limit);
    }

    #[test]
    fn cleanup_drops_empty_counters() {
        let rule = ThresholdRule {
            name: "r".to_string(),
            description: String::new(),
            filter_action: None,
            filter_table: None,
            filter_role: None,
            group_by: GroupBy::Global,
            threshold: 100,
            window: Duration::from_millis(1),
            severity: Severity::Info,
            trigger_rate_limit: false,
        };
        let detector = AlertDetector::new(vec![rule], vec![]);
        detector.check(&base_entry(1, Action::Select, "t"));
        std::thread::sleep(Duration::from_millis(5));
        detector.cleanup();
        assert!(detector.counters.read().unwrap().is_empty());
    }
}
