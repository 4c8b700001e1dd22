//! Diagnostic log — bounded record of warnings and errors for support.
//!
//! DESIGN
//! ======
//! The log is an explicit value owned by whoever builds the session and the
//! subscriber; there is no global instance. `DiagnosticLayer` feeds it from
//! `tracing`, so every WARN/ERROR event the crate emits is captured without
//! call sites knowing about the log.
//!
//! When a path is configured the whole log is rewritten as a JSON array
//! after every record. The log itself never emits tracing events: it sits
//! underneath the layer and would otherwise feed itself.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::config::SyncConfig;
use crate::helpers::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub timestamp: i64,
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("diagnostic log io: {0}")]
    Io(#[from] std::io::Error),
    #[error("diagnostic log encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

impl crate::error::ErrorCode for DiagnosticsError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "E_DIAGNOSTICS_IO",
            Self::Encode(_) => "E_DIAGNOSTICS_ENCODE",
        }
    }
}

struct LogInner {
    entries: VecDeque<DiagnosticEntry>,
    capacity: usize,
    path: Option<PathBuf>,
}

/// Bounded, optionally persisted diagnostic log. Cheap to clone.
#[derive(Clone)]
pub struct DiagnosticLog {
    inner: Arc<Mutex<LogInner>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiagnosticLog {
    /// In-memory log keeping the newest `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                entries: VecDeque::new(),
                capacity: capacity.max(1),
                path: None,
            })),
        }
    }

    /// Log persisted at `path`, seeded with whatever the file already holds.
    ///
    /// # Errors
    ///
    /// Returns `Io` if an existing file cannot be read, `Encode` if it is
    /// not a JSON array of entries.
    pub fn open(capacity: usize, path: impl Into<PathBuf>) -> Result<Self, DiagnosticsError> {
        let path = path.into();
        let capacity = capacity.max(1);
        let mut entries: VecDeque<DiagnosticEntry> = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => VecDeque::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(err) => return Err(err.into()),
        };
        while entries.len() > capacity {
            entries.pop_front();
        }
        Ok(Self { inner: Arc::new(Mutex::new(LogInner { entries, capacity, path: Some(path) })) })
    }

    /// `open` when `config` names a path, otherwise `new`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open`].
    pub fn from_config(config: &SyncConfig) -> Result<Self, DiagnosticsError> {
        match &config.diagnostic_path {
            Some(path) => Self::open(config.diagnostic_capacity, path.clone()),
            None => Ok(Self::new(config.diagnostic_capacity)),
        }
    }

    /// Append an entry, evicting the oldest beyond capacity, and persist.
    ///
    /// # Errors
    ///
    /// Returns the persistence failure. The entry is kept in memory either way.
    pub fn record(&self, entry: DiagnosticEntry) -> Result<(), DiagnosticsError> {
        let mut inner = locked(&self.inner);
        inner.entries.push_back(entry);
        while inner.entries.len() > inner.capacity {
            inner.entries.pop_front();
        }
        write_file(&inner)
    }

    #[must_use]
    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        locked(&self.inner).entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        locked(&self.inner).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        locked(&self.inner).entries.is_empty()
    }

    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        locked(&self.inner).path.clone()
    }

    /// Drop every entry (and the persisted copy).
    ///
    /// # Errors
    ///
    /// Returns the persistence failure.
    pub fn clear(&self) -> Result<(), DiagnosticsError> {
        let mut inner = locked(&self.inner);
        inner.entries.clear();
        write_file(&inner)
    }

    /// Rewrite the persisted copy. A no-op for in-memory logs.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Encode` on failure.
    pub fn persist(&self) -> Result<(), DiagnosticsError> {
        write_file(&locked(&self.inner))
    }
}

fn write_file(inner: &LogInner) -> Result<(), DiagnosticsError> {
    let Some(path) = &inner.path else {
        return Ok(());
    };
    let bytes = serde_json::to_vec_pretty(&inner.entries)?;
    ensure_parent(path)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

// =============================================================================
// TRACING LAYER
// =============================================================================

/// `tracing_subscriber` layer copying WARN and ERROR events into a
/// `DiagnosticLog`.
pub struct DiagnosticLayer {
    log: DiagnosticLog,
}

impl DiagnosticLayer {
    #[must_use]
    pub fn new(log: DiagnosticLog) -> Self {
        Self { log }
    }
}

impl<S: Subscriber> Layer<S> for DiagnosticLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let entry = DiagnosticEntry {
            timestamp: now_ms(),
            level: meta.level().to_string(),
            target: meta.target().to_owned(),
            message: visitor.finish(),
        };
        // Persistence failures cannot be reported through tracing from here.
        let _ = self.log.record(entry);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

#[cfg(test)]
#[path = "diagnostics_test.rs"]
mod tests;
