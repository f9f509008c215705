//! Multi-key sliding-window rate limiting, observational rather than
//! enforcing — see [`crate::logger::AuditLogger::log`] for how a rejection
//! is recorded on the entry rather than blocking the caller.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_limit: usize,
    pub default_window: Duration,
    pub block_duration: Duration,
    pub bypass_roles: Vec<String>,
    pub limits_by_action: HashMap<String, usize>,
    pub limits_by_table: HashMap<String, usize>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: false,
            default_limit: 100,
            default_window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
            bypass_roles: Vec::new(),
            limits_by_action: HashMap::new(),
            limits_by_table: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    limit: usize,
    counts: Vec<Instant>,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    keys: RwLock<HashMap<String, KeyState>>,
}

/// Input derived from an about-to-be-logged entry; kept separate from
/// [`crate::entry::AuditEntry`] since the limiter runs before the entry's
/// chain fields exist.
pub struct RateLimitSubject<'a> {
    pub role_used: &'a str,
    pub actor: &'a str,
    pub action: &'a str,
    pub table_name: Option<&'a str>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn keys_for(subject: &RateLimitSubject<'_>) -> Vec<String> {
        let mut keys = vec!["global".to_string(), format!("actor:{}", subject.actor), format!("action:{}", subject.action)];
        if let Some(table) = subject.table_name {
            if !table.is_empty() {
                keys.push(format!("table:{}", table));
            }
        }
        keys.retain(|k| !k.ends_with(':'));
        keys
    }

    /// Per spec.md §4.10 step 1, every key — not just `action:`/`table:`
    /// keys — resolves its limit as `limits_by_action[action]` if set,
    /// else `limits_by_table[table]` if set, else `default_limit`.
    fn limit_for(&self, subject: &RateLimitSubject<'_>) -> usize {
        if let Some(l) = self.config.limits_by_action.get(subject.action) {
            return *l;
        }
        if let Some(table) = subject.table_name {
            if let Some(l) = self.config.limits_by_table.get(table) {
                return *l;
            }
        }
        self.config.default_limit
    }

    pub fn check(&self, subject: &RateLimitSubject<'_>) -> Decision {
        if !self.config.enabled {
            return Decision { allowed: true, reason: None };
        }
        if self.config.bypass_roles.iter().any(|r| r == subject.role_used) {
            return Decision { allowed: true, reason: None };
        }

        let now = Instant::now();
        let mut keys_guard = self.keys.write().unwrap();

        let limit = self.limit_for(subject);
        for key in Self::keys_for(subject) {
            let window = self.config.default_window;
            let state = keys_guard.entry(key.clone()).or_insert_with(|| KeyState {
                limit,
                counts: Vec::new(),
                blocked_until: None,
            });
            state.limit = limit;

            if let Some(until) = state.blocked_until {
                if now < until {
                    return Decision {
                        allowed: false,
                        reason: Some(format!("key '{}' blocked until {:?}", key, until)),
                    };
                }
                state.blocked_until = None;
                state.counts.clear();
            }

            state.counts.retain(|t| now.duration_since(*t) <= window);
            if state.counts.len() >= state.limit {
                state.blocked_until = Some(now + self.config.block_duration);
                return Decision {
                    allowed: false,
                    reason: Some(format!("key '{}' exceeded limit {}", key, state.limit)),
                };
            }
            state.counts.push(now);
        }

        Decision { allowed: true, reason: None }
    }

    /// The configured `block_duration`, for callers (e.g. the alert→limiter
    /// wiring in [`crate::logger::AuditLogger::log`]) that force a block via
    /// [`Self::trigger_block`] and want the same duration §4.10 uses for a
    /// limit-exceeded block rather than an ad hoc one.
    pub fn block_duration(&self) -> Duration {
        self.config.block_duration
    }

    pub fn trigger_block(&self, key: &str, duration: Duration) {
        let mut keys_guard = self.keys.write().unwrap();
        let state = keys_guard.entry(key.to_string()).or_insert_with(|| KeyState {
            limit: self.config.default_limit,
            counts: Vec::new(),
            blocked_until: None,
        });
        state.blocked_until = Some(Instant::now() + duration);
    }

    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut keys_guard = self.keys.write().unwrap();
        keys_guard.retain(|_, state| {
            state.counts.retain(|t| now.duration_since(*t) <= self.config.default_window);
            !state.counts.is_empty() || state.blocked_until.map(|u| u > now).unwrap_or(false)
        });
    }

    pub fn snapshot(&self) -> HashMap<String, usize> {
        let keys_guard = self.keys.read().unwrap();
        keys_guard.iter().map(|(k, v)| (k.clone(), v.counts.len())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(limit: usize) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            default_limit: limit,
            default_window: Duration::from_secs(60),
            block_duration: Duration::from_millis(20),
            bypass_roles: vec!["admin".to_string()],
            limits_by_action: HashMap::new(),
            limits_by_table: HashMap::new(),
        }
    }

    #[test]
    fn allows_under_limit_and_blocks_over() {
        let limiter = RateLimiter::new(config(2));
        let subject = RateLimitSubject {
            role_used: "app",
            actor: "alice",
            action: "SELECT",
            table_name: Some("users"),
        };
        assert!(limiter.check(&subject).allowed);
        assert!(limiter.check(&subject).allowed);
        let decision = limiter.check(&subject);
        assert!(!decision.allowed);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn bypass_role_is_always_allowed() {
        let limiter = RateLimiter::new(config(0));
        let subject = RateLimitSubject {
            role_used: "admin",
            actor: "root",
            action: "DELETE",
            table_name: None,
        };
        assert!(limiter.check(&subject).allowed);
    }

    #[test]
    fn block_clears_after_expiry() {
        let limiter = RateLimiter::new(config(1));
        let subject = RateLimitSubject {
            role_used: "app",
            actor: "bob",
            action: "UPDATE",
            table_name: None,
        };
        assert!(limiter.check(&subject).allowed);
        assert!(!limiter.check(&subject).allowed);
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check(&subject).allowed);
    }

    #[test]
    fn trigger_block_forces_rejection() {
        let limiter = RateLimiter::new(config(100));
        limiter.trigger_block("actor:eve", Duration::from_secs(60));
        let subject = RateLimitSubject {
            role_used: "app",
            actor: "eve",
            action: "SELECT",
            table_name: None,
        };
        assert!(!limiter.check(&subject).allowed);
    }

    #[test]
    fn action_override_applies_to_every_key_not_just_the_action_key() {
        let mut limits_by_action = HashMap::new();
        limits_by_action.insert("DELETE".to_string(), 1);
        let mut cfg = config(100);
        cfg.limits_by_action = limits_by_action;
        let limiter = RateLimiter::new(cfg);
        let subject = RateLimitSubject {
            role_used: "app",
            actor: "eve",
            action: "DELETE",
            table_name: None,
        };
        assert!(limiter.check(&subject).allowed);
        // the global/actor keys share the DELETE override (limit 1), so
        // the second DELETE is rejected instead of admitting up to 100.
        assert!(!limiter.check(&subject).allowed);
    }
}
