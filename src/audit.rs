// =============================================================================
// Audit log — shared append-only record of mutating actions
// =============================================================================
//
// Used by both the Risk & Guardrails gate (§4.8) and the Flags Store (§4.10):
// every mutation to process-wide state produces one entry here. Grounded on
// the teacher's atomic-write persistence idiom in `runtime_config.rs`, extended
// with an in-memory append-only log since no entry is ever edited or removed.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// {ts, actor, action, before, after, ip, trace_id} (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub ip: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        actor: impl Into<String>,
        action: impl Into<String>,
        before: Option<Value>,
        after: Option<Value>,
    ) {
        self.entries.write().push(AuditEntry {
            ts: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            before,
            after,
            ip: None,
            trace_id: None,
        });
    }

    /// Most recent `limit` entries, newest-last (append order).
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(limit);
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_and_never_removes() {
        let log = AuditLog::new();
        log.record("system", "guardrails.kill", None, Some(serde_json::json!(true)));
        log.record("alice", "guardrails.unkill", Some(serde_json::json!(true)), Some(serde_json::json!(false)));
        assert_eq!(log.len(), 2);
        let recent = log.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].actor, "alice");
    }
}
