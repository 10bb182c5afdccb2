// Attempt Logger
// Every supplier attempt produces one immutable entry. Entries are handed to a
// writer task over a bounded channel so that a slow or broken sink can never fail
// or stall a search: when the channel is full the entry is dropped and counted.

use crate::config::AttemptLogConfig;
use crate::descriptor::ServiceType;
use crate::supplier::{ErrorKind, SupplierOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    NoResults,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLogEntry {
    pub correlation_id: String,
    pub service_type: ServiceType,
    pub provider_id: String,
    // 1-based dispatch order within the request
    pub attempt_order: u32,
    pub outcome: AttemptOutcome,
    pub response_time_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub result_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl AttemptLogEntry {
    pub fn from_outcome(
        correlation_id: &str,
        service_type: ServiceType,
        attempt_order: u32,
        outcome: &SupplierOutcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let attempt_outcome = if outcome.has_items() {
            AttemptOutcome::Success
        } else if outcome.success {
            AttemptOutcome::NoResults
        } else {
            AttemptOutcome::Error
        };
        Self {
            correlation_id: correlation_id.to_string(),
            service_type,
            provider_id: outcome.provider_id.clone(),
            attempt_order,
            outcome: attempt_outcome,
            response_time_ms: outcome.response_time_ms,
            error_kind: outcome.error_kind,
            error_message: outcome.error_message.clone(),
            result_count: outcome.item_count,
            timestamp,
        }
    }
}

// Per-provider aggregation used by analytics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    pub attempts: u64,
    pub successes: u64,
    pub no_results: u64,
    pub errors: u64,
    pub avg_response_time_ms: f64,
}

impl ProviderStats {
    pub fn aggregate<'a>(
        entries: impl IntoIterator<Item = &'a AttemptLogEntry>,
    ) -> HashMap<String, ProviderStats> {
        let mut totals: HashMap<String, (ProviderStats, u64)> = HashMap::new();
        for entry in entries {
            let (stats, total_ms) = totals.entry(entry.provider_id.clone()).or_default();
            stats.attempts += 1;
            match entry.outcome {
                AttemptOutcome::Success => stats.successes += 1,
                AttemptOutcome::NoResults => stats.no_results += 1,
                AttemptOutcome::Error => stats.errors += 1,
            }
            *total_ms += entry.response_time_ms;
        }
        totals
            .into_iter()
            .map(|(id, (mut stats, total_ms))| {
                stats.avg_response_time_ms = total_ms as f64 / stats.attempts as f64;
                (id, stats)
            })
            .collect()
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

// Durable destination for attempt entries
#[async_trait]
pub trait AttemptSink: Send + Sync + 'static {
    async fn append(&self, entry: &AttemptLogEntry) -> Result<(), SinkError>;

    async fn query(
        &self,
        service_type: Option<ServiceType>,
    ) -> Result<Vec<AttemptLogEntry>, SinkError>;
}

// Bounded in-memory ring, oldest entries go first
pub struct MemoryAttemptSink {
    entries: RwLock<VecDeque<AttemptLogEntry>>,
    capacity: usize,
}

impl MemoryAttemptSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entries(&self) -> Vec<AttemptLogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn entries_for(&self, correlation_id: &str) -> Vec<AttemptLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }
}

impl Default for MemoryAttemptSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl AttemptSink for MemoryAttemptSink {
    async fn append(&self, entry: &AttemptLogEntry) -> Result<(), SinkError> {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        Ok(())
    }

    async fn query(
        &self,
        service_type: Option<ServiceType>,
    ) -> Result<Vec<AttemptLogEntry>, SinkError> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| service_type.map_or(true, |st| e.service_type == st))
            .cloned()
            .collect())
    }
}

// Append-only JSON lines file
pub struct JsonLinesAttemptSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesAttemptSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AttemptSink for JsonLinesAttemptSink {
    async fn append(&self, entry: &AttemptLogEntry) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(
        &self,
        service_type: Option<ServiceType>,
    ) -> Result<Vec<AttemptLogEntry>, SinkError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry: AttemptLogEntry = serde_json::from_str(line)?;
            if service_type.map_or(true, |st| entry.service_type == st) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

enum LogMessage {
    Append(AttemptLogEntry),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct LoggerCounters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptLoggerStats {
    pub written: u64,
    // Rejected because the queue was full or the writer had stopped
    pub dropped: u64,
    // Accepted but the sink returned an error or timed out
    pub failed: u64,
}

// Handle to the writer task; must be created inside a tokio runtime
pub struct AttemptLogger {
    sender: mpsc::Sender<LogMessage>,
    sink: Arc<dyn AttemptSink>,
    counters: Arc<LoggerCounters>,
}

impl AttemptLogger {
    pub fn new(sink: Arc<dyn AttemptSink>, config: &AttemptLogConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let counters = Arc::new(LoggerCounters::default());
        let writer = LogWriter {
            receiver,
            sink: Arc::clone(&sink),
            counters: Arc::clone(&counters),
            write_timeout: config.write_timeout(),
        };
        tokio::spawn(writer.run());
        Self {
            sender,
            sink,
            counters,
        }
    }

    // Fire-and-forget, never blocks the caller
    pub fn append(&self, entry: AttemptLogEntry) {
        if let Err(e) = self.sender.try_send(LogMessage::Append(entry)) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            warn!(reason, "Dropped attempt log entry");
        }
    }

    // Resolves once everything queued before this call has reached the sink
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(LogMessage::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    pub async fn entries(
        &self,
        service_type: Option<ServiceType>,
    ) -> Result<Vec<AttemptLogEntry>, SinkError> {
        self.sink.query(service_type).await
    }

    pub async fn stats_by_provider(
        &self,
        service_type: Option<ServiceType>,
    ) -> Result<HashMap<String, ProviderStats>, SinkError> {
        let entries = self.sink.query(service_type).await?;
        Ok(ProviderStats::aggregate(&entries))
    }

    pub fn stats(&self) -> AttemptLoggerStats {
        AttemptLoggerStats {
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

struct LogWriter {
    receiver: mpsc::Receiver<LogMessage>,
    sink: Arc<dyn AttemptSink>,
    counters: Arc<LoggerCounters>,
    write_timeout: Duration,
}

impl LogWriter {
    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                LogMessage::Append(entry) => self.write(entry).await,
                LogMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Attempt log writer stopped");
    }

    async fn write(&self, entry: AttemptLogEntry) {
        match tokio::time::timeout(self.write_timeout, self.sink.append(&entry)).await {
            Ok(Ok(())) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %entry.correlation_id,
                    provider_id = %entry.provider_id,
                    error = %e,
                    "Failed to persist attempt log entry"
                );
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %entry.correlation_id,
                    provider_id = %entry.provider_id,
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "Attempt log sink timed out"
                );
            }
        }
    }
}
