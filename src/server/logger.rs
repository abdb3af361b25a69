// src/server/logger.rs
//! Upstream request/response audit log.
//!
//! Keeps the most recent calls in memory, dropping the oldest once the
//! capacity is reached. One instance is owned by the service context and
//! shared by every stream; entries are independent of each other.

use crate::utils::now_millis;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    InFlight,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditStatus::InFlight => write!(f, "in_flight"),
            AuditStatus::Completed => write!(f, "completed"),
            AuditStatus::Failed => write!(f, "failed"),
            AuditStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: u64,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub request: Value,
    /// Raw text received from upstream, tool markers included
    pub response: String,
    pub status: AuditStatus,
}

pub struct AuditLog {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record the start of an upstream call and return its entry id.
    pub fn begin<T: Serialize>(&self, request: &T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_value(request).unwrap_or_else(|e| {
            crate::log_warn!("Audit entry {} has an unserializable request: {}", id, e);
            Value::Null
        });
        let entry = AuditEntry {
            id,
            started_at_ms: now_millis(),
            finished_at_ms: None,
            request,
            response: String::new(),
            status: AuditStatus::InFlight,
        };

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        id
    }

    /// Finalize an entry. Entries already evicted are ignored.
    pub fn complete(&self, id: u64, response: String, status: AuditStatus) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().rev().find(|e| e.id == id) {
            entry.response = response;
            entry.status = status;
            entry.finished_at_ms = Some(now_millis());
        } else {
            crate::log_warn!("Audit entry {} was evicted before it completed", id);
        }
    }

    /// Snapshot, oldest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<AuditEntry> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn records_request_and_response() {
        let log = AuditLog::new(4);
        let id = log.begin(&json!({"model": "default"}));
        assert_eq!(log.get(id).unwrap().status, AuditStatus::InFlight);

        log.complete(id, "hello".to_string(), AuditStatus::Completed);
        let entry = log.get(id).unwrap();
        assert_eq!(entry.request["model"], "default");
        assert_eq!(entry.response, "hello");
        assert_eq!(entry.status, AuditStatus::Completed);
        assert!(entry.finished_at_ms.unwrap() >= entry.started_at_ms);
    }

    #[test]
    fn drops_oldest_beyond_capacity() {
        let log = AuditLog::new(100);
        let ids: Vec<u64> = (0..150).map(|i| log.begin(&json!({ "n": i }))).collect();
        let entries = log.entries();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[0].id, ids[50]);
        assert_eq!(entries[99].id, ids[149]);

        // evicted entries are ignored
        log.complete(ids[0], "late".to_string(), AuditStatus::Completed);
        assert!(log.get(ids[0]).is_none());
    }

    #[test]
    fn clear_empties_the_log() {
        let log = AuditLog::new(2);
        log.begin(&json!({}));
        log.clear();
        assert!(log.is_empty());
        assert!(log.begin(&json!({})) > 1);
    }

    #[test]
    fn concurrent_appends_respect_capacity() {
        let log = Arc::new(AuditLog::new(10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = log.begin(&json!({ "t": t, "i": i }));
                        log.complete(id, String::new(), AuditStatus::Completed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.len(), 10);
    }
}
