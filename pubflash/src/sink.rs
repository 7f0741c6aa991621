//! Operator-facing log store.
//!
//! The [`LogSink`] is an append-only list of timestamped [`LogEntry`] values
//! with publish/subscribe notification. It performs no I/O: front ends
//! subscribe to it and render entries however they like.
//!
//! Handles are cheap to clone and all clones share the same store.

use chrono::{DateTime, Local};
use log::trace;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Severity of a log line as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Severity {
    /// Informational output.
    #[default]
    Info,
    /// Failure output.
    Error,
    /// Positive outcome (also used for device warnings).
    Success,
}

impl Severity {
    /// All severities, in display order.
    pub const ALL: [Self; 3] = [Self::Info, Self::Error, Self::Success];

    /// Lowercase name of the severity.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::Success => "success",
        }
    }

    /// Parse a severity name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "error" => Some(Self::Error),
            "success" => Some(Self::Success),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    message: String,
    severity: Severity,
    timestamp: DateTime<Local>,
}

impl LogEntry {
    /// Create an entry stamped with the current local time.
    pub fn new(message: impl AsRef<str>, severity: Severity) -> Self {
        Self::with_timestamp(message, severity, Local::now())
    }

    /// Create an entry with an explicit timestamp.
    pub fn with_timestamp(
        message: impl AsRef<str>,
        severity: Severity,
        timestamp: DateTime<Local>,
    ) -> Self {
        Self {
            message: message.as_ref().trim().to_string(),
            severity,
            timestamp,
        }
    }

    /// The message text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The entry severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// When the entry was created.
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Wall-clock label used by consoles and exports (`HH:MM:SS`).
    pub fn time_label(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/// Identity of a sink subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber callback. Receives `Some(entry)` on write and `None` on clear.
pub type Subscriber = Arc<dyn Fn(Option<&LogEntry>) + Send + Sync>;

#[derive(Default)]
struct SinkState {
    entries: Mutex<Vec<LogEntry>>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

/// Shared append-only log store.
#[derive(Clone, Default)]
pub struct LogSink {
    state: Arc<SinkState>,
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LogSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line and notify subscribers.
    pub fn write(&self, message: impl AsRef<str>, severity: Severity) {
        let entry = LogEntry::new(message, severity);
        trace!("[{}] {}", entry.severity(), entry.message());
        lock(&self.state.entries).push(entry.clone());
        self.notify(Some(&entry));
    }

    /// Append an informational line.
    pub fn info(&self, message: impl AsRef<str>) {
        self.write(message, Severity::Info);
    }

    /// Append an error line.
    pub fn error(&self, message: impl AsRef<str>) {
        self.write(message, Severity::Error);
    }

    /// Append a success line.
    pub fn success(&self, message: impl AsRef<str>) {
        self.write(message, Severity::Success);
    }

    /// Register a callback for future writes and clears.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Option<&LogEntry>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.state.subscribers).push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.state.subscribers).retain(|(sub, _)| *sub != id);
    }

    /// Snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.state.entries).clone()
    }

    /// Snapshot of the entries whose severity is in `severities`.
    pub fn filtered(&self, severities: &[Severity]) -> Vec<LogEntry> {
        lock(&self.state.entries)
            .iter()
            .filter(|entry| severities.contains(&entry.severity()))
            .cloned()
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        lock(&self.state.entries).len()
    }

    /// Whether the sink holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and notify subscribers with `None`.
    pub fn clear(&self) {
        lock(&self.state.entries).clear();
        self.notify(None);
    }

    fn notify(&self, entry: Option<&LogEntry>) {
        // Callbacks run outside the lock so they may (un)subscribe freely.
        let subscribers: Vec<Subscriber> = lock(&self.state.subscribers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in subscribers {
            callback(entry);
        }
    }
}
