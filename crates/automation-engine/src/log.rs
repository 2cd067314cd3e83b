//! Append-only execution log

use crate::error::AutomationError;
use crate::model::{AutomationId, ExecutionRecord};
use crate::persistence;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Records kept in memory for queries
const RETAINED_RECORDS: usize = 1000;

/// One row per automation execution attempt.
///
/// Records are kept in memory for queries and, with a path, appended to a
/// JSON-lines file.
pub struct ExecutionLog {
    path: Option<PathBuf>,
    records: Mutex<VecDeque<ExecutionRecord>>,
    next_id: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
}

impl ExecutionLog {
    /// Create a log that is not written to disk
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the log file and load its most recent records
    pub async fn load(path: PathBuf) -> Self {
        let mut loaded: Vec<ExecutionRecord> = persistence::load_lines(&path).await;
        let next_id = loaded.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        if loaded.len() > RETAINED_RECORDS {
            loaded.drain(..loaded.len() - RETAINED_RECORDS);
        }

        Self {
            path: Some(path),
            records: Mutex::new(loaded.into()),
            next_id: AtomicU64::new(next_id),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record the outcome of an execution
    pub async fn append(
        &self,
        automation_id: AutomationId,
        trigger_data: Value,
        outcome: &Result<Value, AutomationError>,
    ) -> ExecutionRecord {
        let (action_result, error_message) = match outcome {
            Ok(result) => (result.clone(), None),
            Err(e) => (Value::Object(serde_json::Map::new()), Some(e.to_string())),
        };
        let record = ExecutionRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            automation_id,
            timestamp: Utc::now(),
            trigger_data,
            action_result,
            success: outcome.is_ok(),
            error_message,
        };

        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.push_back(record.clone());
            if records.len() > RETAINED_RECORDS {
                records.pop_front();
            }
        }

        if let Some(path) = &self.path {
            let _guard = self.write_lock.lock().await;
            if let Err(e) = persistence::append_line(path, &record).await {
                tracing::warn!("Failed to write execution log: {}", e);
            }
        }

        record
    }

    /// Most recent records first, optionally for one automation.
    ///
    /// Only the last `RETAINED_RECORDS` executions across all automations
    /// are searched; older ones remain in the log file.
    pub fn list(&self, automation_id: Option<AutomationId>, limit: usize) -> Vec<ExecutionRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .rev()
            .filter(|r| automation_id.map_or(true, |id| r.automation_id == id))
            .take(limit)
            .cloned()
            .collect()
    }
}
