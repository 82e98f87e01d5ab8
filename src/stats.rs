//! Cumulative statistics for sources, targets, and the replicator loop.
//!
//! Stats blocks are the only state shared between a running replicator and
//! the control surface. Each block sits behind a reader/writer lock;
//! readers copy under the lock and return the copy, so maps inside stats
//! are always deep-copied on read.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::fsm::State;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub total_events: u64,
    pub total_bytes: u64,
    pub event_error_count: u64,
    pub connection_retries: u64,
    pub connection_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connect_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub source_specific: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetStats {
    pub total_writes: u64,
    pub total_flushes: u64,
    pub total_bytes: u64,
    pub write_error_count: u64,
    pub flush_error_count: u64,
    pub connection_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connect_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_write_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicatorStats {
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
    pub signals_received: u64,
    pub checkpoint_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

impl Default for ReplicatorStats {
    fn default() -> Self {
        Self {
            state: State::Created,
            started_at: None,
            uptime_seconds: 0,
            signals_received: 0,
            checkpoint_count: 0,
            last_checkpoint_at: None,
        }
    }
}

/// Combined view returned by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub source: SourceStats,
    pub target: TargetStats,
    pub replicator: ReplicatorStats,
}

/// A stats block shared between its owning component and readers.
///
/// `snapshot` clones under the read lock; `update` runs the mutation under
/// the write lock. Lock poisoning is ignored: stats are plain data and a
/// panicked writer cannot leave them in a state worth propagating.
#[derive(Debug, Default)]
pub struct Shared<T>(Arc<RwLock<T>>);

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn snapshot(&self) -> T {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner))
    }
}
