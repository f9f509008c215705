use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Select => "SELECT",
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::Ddl => "DDL",
            Action::Other => "OTHER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub break_glass: bool,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default)]
    pub suspicious: bool,
    #[serde(default)]
    pub alert_triggered: bool,
}

/// What the caller asked the system to do; the raw material
/// [`crate::logger::AuditLogger::log`] turns into a chained, redacted
/// [`AuditEntry`].
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub query: String,
    pub args: Vec<String>,
    pub rows_affected: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub job_id: Option<String>,
}

/// An append-only, chain-linked audit record. Never mutated once
/// persisted (A1); every field after `id` is fixed at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub operation_id: Uuid,

    pub role_used: String,

    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_hash: Option<String>,

    pub rows_affected: u64,
    pub duration_ms: u64,
    pub source_component: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default)]
    pub entry_hash: String,

    pub flags: Flags,
}

impl AuditEntry {
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "node_id" => Some(Value::String(self.node_id.clone())),
            "job_id" => self.job_id.clone().map(Value::String),
            "operation_id" => Some(Value::String(self.operation_id.to_string())),
            "role_used" => Some(Value::String(self.role_used.clone())),
            "action" => Some(Value::String(self.action.to_string())),
            "table_name" => self.table_name.clone().map(Value::String),
            "rows_affected" => Some(Value::from(self.rows_affected)),
            "duration_ms" => Some(Value::from(self.duration_ms)),
            "source_component" => Some(Value::String(self.source_component.clone())),
            "actor" => Some(Value::String(self.actor.clone())),
            "suspicious" => Some(Value::Bool(self.flags.suspicious)),
            "break_glass" => Some(Value::Bool(self.flags.break_glass)),
            _ => None,
        }
    }
}
