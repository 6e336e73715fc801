//! Bus session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One continuous connected period on a bus.
///
/// Created by the reconnect supervisor on a successful connect and closed
/// exactly once, on disconnect or terminal link error. Everything outside
/// the supervisor sees sessions read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSession {
    /// Monotonically increasing per supervisor.
    pub id: u64,
    /// Interface name, e.g. `can0`.
    pub channel: String,
    /// Bitrate the session was opened with.
    pub bitrate: u32,
    pub started_at: DateTime<Utc>,
    /// `None` while the session is open.
    pub ended_at: Option<DateTime<Utc>>,
    /// How many times the supervisor had reconnected when this session
    /// opened. Audit data only; backoff timing never reads it.
    pub restart_count: u32,
}

impl BusSession {
    pub fn open(id: u64, channel: &str, bitrate: u32, restart_count: u32) -> Self {
        Self {
            id,
            channel: channel.to_string(),
            bitrate,
            started_at: Utc::now(),
            ended_at: None,
            restart_count,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Set the end time. Idempotent: a session that is already closed
    /// keeps its original end time.
    pub fn close(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }
}
