//! Time-series sink (InfluxDB v2 line protocol).
//!
//! Frames become points in a `can_frames` measurement, tagged by channel
//! and arbitration id, with the frame's wall-clock time as the series
//! time. Gap markers are not written (loss accounting lives in the
//! durable store), so the point count tracks data frames exactly.
//!
//! The sink batches points (count or elapsed-time bound) and absorbs
//! backend trouble on its own: failed writes are retried under bounded
//! backoff while up to `pending_cap` points buffer in memory, and overflow
//! evicts the oldest points. `accept` never returns an error for network
//! failures, so the dispatcher is never backpressured beyond the sink's
//! own queue.
//!
//! On the first flush the sink provisions the target bucket with the
//! configured retention. Provisioning is idempotent: an existing bucket
//! with the same retention is left untouched.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{InfluxConfig, RetentionPolicy};
use crate::error::{Error, SinkError};
use crate::sink::FrameSink;
use crate::types::Frame;

/// Outcome of a bucket provisioning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    /// Bucket was created with the requested retention.
    Created,
    /// Bucket already existed with the same retention; nothing changed.
    AlreadyExists,
    /// Bucket existed with a different retention and was updated.
    Updated,
}

/// Transport to an InfluxDB-compatible backend.
///
/// The HTTP implementation is [`HttpBackend`]; tests substitute an
/// in-memory recorder.
#[async_trait]
pub trait SeriesBackend: Send + Sync {
    /// Make sure the bucket exists with the given retention.
    async fn ensure_bucket(
        &self,
        bucket: &str,
        retention: RetentionPolicy,
    ) -> Result<Provisioning, SinkError>;

    /// Write a batch of line-protocol points.
    async fn write(&self, bucket: &str, lines: &[String]) -> Result<(), SinkError>;
}

/// Series sink tuning.
#[derive(Debug, Clone)]
pub struct SeriesOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Points buffered while the backend is unreachable; beyond this the
    /// oldest are evicted.
    pub pending_cap: usize,
    pub retry_base: Duration,
    pub retry_ceiling: Duration,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            pending_cap: 10_000,
            retry_base: Duration::from_millis(500),
            retry_ceiling: Duration::from_secs(30),
        }
    }
}

struct SeriesState {
    batch: Vec<String>,
    pending: VecDeque<String>,
    provisioned: bool,
    last_flush: Instant,
    failures: u32,
    next_retry: Option<Instant>,
    evicted: u64,
}

/// InfluxDB-backed time-series sink.
pub struct SeriesSink {
    backend: Arc<dyn SeriesBackend>,
    bucket: String,
    retention: RetentionPolicy,
    opts: SeriesOptions,
    state: Mutex<SeriesState>,
}

impl SeriesSink {
    pub fn new(
        backend: Arc<dyn SeriesBackend>,
        bucket: impl Into<String>,
        retention: RetentionPolicy,
        opts: SeriesOptions,
    ) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
            retention,
            opts,
            state: Mutex::new(SeriesState {
                batch: Vec::new(),
                pending: VecDeque::new(),
                provisioned: false,
                last_flush: Instant::now(),
                failures: 0,
                next_retry: None,
                evicted: 0,
            }),
        }
    }

    /// Build a sink talking to the configured InfluxDB host.
    pub fn from_config(config: &InfluxConfig) -> Result<Self, Error> {
        let retention = config.retention()?;
        let backend = HttpBackend::new(config.base_url(), &config.org, &config.token);
        Ok(Self::new(
            Arc::new(backend),
            config.bucket.clone(),
            retention,
            SeriesOptions {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
                pending_cap: config.pending_cap,
                ..SeriesOptions::default()
            },
        ))
    }

    /// Points evicted because the retry buffer overflowed.
    pub async fn evicted(&self) -> u64 {
        self.state.lock().await.evicted
    }

    /// Points waiting for the backend to come back.
    pub async fn backlog(&self) -> usize {
        let state = self.state.lock().await;
        state.batch.len() + state.pending.len()
    }

    async fn try_flush(&self, state: &mut SeriesState, force: bool) {
        // Stage the batch into the retry buffer, newest last
        state.pending.extend(state.batch.drain(..));
        while state.pending.len() > self.opts.pending_cap {
            state.pending.pop_front();
            state.evicted += 1;
        }

        if state.pending.is_empty() {
            state.last_flush = Instant::now();
            return;
        }

        if !force {
            if let Some(at) = state.next_retry {
                if Instant::now() < at {
                    return;
                }
            }
        }

        if !state.provisioned {
            match self.backend.ensure_bucket(&self.bucket, self.retention).await {
                Ok(outcome) => {
                    info!(bucket = %self.bucket, ?outcome, "series bucket provisioned");
                    state.provisioned = true;
                }
                Err(err) => {
                    self.note_failure(state, &err);
                    return;
                }
            }
        }

        let lines: Vec<String> = state.pending.iter().cloned().collect();
        match self.backend.write(&self.bucket, &lines).await {
            Ok(()) => {
                debug!(points = lines.len(), "series batch written");
                state.pending.clear();
                state.failures = 0;
                state.next_retry = None;
                state.last_flush = Instant::now();
            }
            Err(err) => self.note_failure(state, &err),
        }
    }

    fn note_failure(&self, state: &mut SeriesState, err: &SinkError) {
        let shift = state.failures.min(8);
        let delay = self.opts.retry_ceiling.min(self.opts.retry_base * (1u32 << shift));
        state.failures = state.failures.saturating_add(1);
        state.next_retry = Some(Instant::now() + delay);
        state.last_flush = Instant::now();
        warn!(
            error = %err,
            failures = state.failures,
            retry_in = ?delay,
            buffered = state.pending.len(),
            "series backend unavailable, buffering"
        );
    }
}

#[async_trait]
impl FrameSink for SeriesSink {
    async fn accept(&self, frame: &Arc<Frame>) -> Result<(), SinkError> {
        if frame.is_gap_marker() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        state.batch.push(frame_point(frame));

        let due = state.batch.len() >= self.opts.batch_size
            || state.last_flush.elapsed() >= self.opts.flush_interval;
        if due {
            self.try_flush(&mut state, false).await;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        self.try_flush(&mut state, true).await;
        if state.pending.is_empty() {
            Ok(())
        } else {
            Err(SinkError::series(format!("{} points still unwritten", state.pending.len())))
        }
    }
}

/// Format one frame as an InfluxDB line-protocol point.
///
/// `can_frames,arb_id=<hex>,channel=<n> dlc=<n>i,b0=<n>i,... <ts_ns>`
///
/// Tags are emitted in lexical key order; all values are numeric, so no
/// escaping is required.
fn frame_point(frame: &Frame) -> String {
    use std::fmt::Write;

    let mut line = format!(
        "can_frames,arb_id={},channel={} dlc={}i",
        frame.id,
        frame.channel,
        frame.payload.len()
    );
    for (i, byte) in frame.payload.iter().enumerate() {
        let _ = write!(line, ",b{i}={byte}i");
    }
    let _ = write!(line, " {}", frame.wall_clock.timestamp_nanos_opt().unwrap_or_default());
    line
}

/// InfluxDB v2 HTTP API backend.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    org: String,
    token: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, org: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            org: org.to_string(),
            token: token.to_string(),
        }
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            request
        } else {
            request.header("Authorization", format!("Token {}", self.token))
        }
    }

    async fn org_id(&self) -> Result<String, SinkError> {
        let url = format!("{}/api/v2/orgs?org={}", self.base_url, self.org);
        let response = self
            .auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SinkError::series(format!("org lookup failed: {e}")))?;
        let body: serde_json::Value = response
            .error_for_status()
            .map_err(|e| SinkError::series(format!("org lookup rejected: {e}")))?
            .json()
            .await
            .map_err(|e| SinkError::series(format!("org lookup unreadable: {e}")))?;

        body["orgs"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SinkError::series(format!("organization '{}' not found", self.org)))
    }
}

#[async_trait]
impl SeriesBackend for HttpBackend {
    async fn ensure_bucket(
        &self,
        bucket: &str,
        retention: RetentionPolicy,
    ) -> Result<Provisioning, SinkError> {
        let url = format!("{}/api/v2/buckets?name={}", self.base_url, bucket);
        let response = self
            .auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| SinkError::series(format!("bucket lookup failed: {e}")))?;
        let body: serde_json::Value = response
            .error_for_status()
            .map_err(|e| SinkError::series(format!("bucket lookup rejected: {e}")))?
            .json()
            .await
            .map_err(|e| SinkError::series(format!("bucket lookup unreadable: {e}")))?;

        let want_seconds = retention.expire_seconds();
        if let Some(existing) = body["buckets"].as_array().and_then(|b| b.first()) {
            let current = existing["retentionRules"][0]["everySeconds"].as_u64().unwrap_or(0);
            if current == want_seconds {
                return Ok(Provisioning::AlreadyExists);
            }

            let id = existing["id"]
                .as_str()
                .ok_or_else(|| SinkError::series("bucket id missing in lookup response"))?;
            let url = format!("{}/api/v2/buckets/{}", self.base_url, id);
            self.auth(self.client.patch(&url))
                .json(&json!({
                    "retentionRules": [{"type": "expire", "everySeconds": want_seconds}]
                }))
                .send()
                .await
                .map_err(|e| SinkError::series(format!("bucket update failed: {e}")))?
                .error_for_status()
                .map_err(|e| SinkError::series(format!("bucket update rejected: {e}")))?;
            return Ok(Provisioning::Updated);
        }

        let org_id = self.org_id().await?;
        let url = format!("{}/api/v2/buckets", self.base_url);
        self.auth(self.client.post(&url))
            .json(&json!({
                "orgID": org_id,
                "name": bucket,
                "retentionRules": [{"type": "expire", "everySeconds": want_seconds}]
            }))
            .send()
            .await
            .map_err(|e| SinkError::series(format!("bucket create failed: {e}")))?
            .error_for_status()
            .map_err(|e| SinkError::series(format!("bucket create rejected: {e}")))?;
        Ok(Provisioning::Created)
    }

    async fn write(&self, bucket: &str, lines: &[String]) -> Result<(), SinkError> {
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            self.base_url, self.org, bucket
        );
        self.auth(self.client.post(&url))
            .body(lines.join("\n"))
            .send()
            .await
            .map_err(|e| SinkError::series(format!("write failed: {e}")))?
            .error_for_status()
            .map_err(|e| SinkError::series(format!("write rejected: {e}")))?;
        Ok(())
    }
}
