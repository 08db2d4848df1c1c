//! Lifecycle events.
//!
//! Every event is appended as one JSON line to the events file and
//! broadcast to in-process subscribers. Writing an event never fails the
//! operation that produced it; a write error is logged and dropped.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use podlite_shared::errors::{PodliteError, PodliteResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Container,
    Pod,
    Volume,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Create,
    Remove,
    Prepare,
    Cleanup,
    Mount,
    Unmount,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Event {
    pub fn new(
        event_type: EventType,
        status: EventStatus,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            time: Utc::now(),
            event_type,
            status,
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Append-only JSON-lines event log.
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    sender: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            sender,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event. Failures are logged, not returned.
    pub fn write(&self, event: Event) {
        if let Err(e) = self.append(&event) {
            tracing::warn!(
                path = %self.path.display(),
                status = ?event.status,
                id = %event.id,
                "failed to write event: {}",
                e
            );
        }
        let _ = self.sender.send(event);
    }

    fn append(&self, event: &Event) -> PodliteResult<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Receive events written after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Every event in the log, oldest first. A missing log is empty.
    pub fn read_all(&self) -> PodliteResult<Vec<Event>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| {
                PodliteError::Internal(format!("corrupt event log line {:?}: {}", line, e))
            })?;
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_append_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events").join("events.log"));
        let mut rx = log.subscribe();

        log.write(Event::new(EventType::Container, EventStatus::Create, "abc", "web"));
        log.write(Event::new(EventType::System, EventStatus::Refresh, "", ""));

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, EventStatus::Create);
        assert_eq!(events[0].name, "web");
        assert_eq!(events[1].event_type, EventType::System);
        assert_eq!(rx.try_recv().unwrap().id, "abc");

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.lines().next().unwrap().contains(r#""type":"container""#));
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("none.log"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
