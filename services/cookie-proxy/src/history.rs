//! Recent request log
//!
//! Bounded in-memory record of proxied calls for the admin endpoints. Newest
//! entries come first; the oldest is dropped once the capacity is reached.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::RwLock;

/// Maximum records kept.
pub const HISTORY_CAPACITY: usize = 100;

/// Longest URL shown before truncation.
const MAX_URL_CHARS: usize = 80;

/// One proxied call as shown in `/admin/request-logs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: String,
    pub time: DateTime<Local>,
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub success: bool,
    pub attempts: u32,
}

pub struct RequestHistory {
    records: RwLock<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl RequestHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub async fn push(
        &self,
        method: &str,
        url: &str,
        status_code: u16,
        duration_ms: u64,
        success: bool,
        attempts: u32,
    ) {
        let record = RequestRecord {
            id: uuid::Uuid::new_v4().as_simple().to_string(),
            time: Local::now(),
            method: method.to_string(),
            url: truncate_url(url),
            status_code,
            duration_ms,
            success,
            attempts,
        };

        let mut records = self.records.write().await;
        records.push_front(record);
        records.truncate(self.capacity);
    }

    /// All records, newest first.
    pub async fn snapshot(&self) -> Vec<RequestRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    /// Time of the most recent successful call.
    pub async fn last_success(&self) -> Option<DateTime<Local>> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.success)
            .map(|r| r.time)
    }

    /// Drop every record, returning how many there were.
    pub async fn clear(&self) -> usize {
        let mut records = self.records.write().await;
        let n = records.len();
        records.clear();
        n
    }
}

fn truncate_url(url: &str) -> String {
    if url.chars().count() <= MAX_URL_CHARS {
        return url.to_string();
    }
    let head: String = url.chars().take(MAX_URL_CHARS - 3).collect();
    format!("{head}...")
}
