//! Delivery collaborators
//!
//! The durable store receives session records and event batches and answers
//! ok/err. The best-effort transport is fire-and-forget: used at teardown, its
//! outcome is never inspected.

use crate::error::TelemetryError;
use crate::types::{Event, SessionPatch, SessionRecord};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// Durable remote store
pub trait EventStore {
    fn append_session(&mut self, record: &SessionRecord) -> Result<(), TelemetryError>;

    fn append_events(&mut self, batch: &[Event]) -> Result<(), TelemetryError>;

    fn update_session(&mut self, id: &str, patch: &SessionPatch) -> Result<(), TelemetryError>;
}

/// Non-blocking delivery used at unload. No response handling.
pub trait BestEffortTransport {
    fn send(&mut self, endpoint: &str, payload: &str);
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryStoreState {
    sessions: Vec<SessionRecord>,
    events: Vec<Event>,
    patches: Vec<(String, SessionPatch)>,
    calls: u64,
    fail_next: u32,
    offline: bool,
}

impl MemoryStoreState {
    fn check_available(&mut self) -> Result<(), TelemetryError> {
        self.calls += 1;
        if self.offline {
            return Err(TelemetryError::Transport("store offline".to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(TelemetryError::StoreRejected("injected failure".to_string()));
        }
        Ok(())
    }
}

/// Store kept in memory. Clones share contents, so a test can hold one clone
/// while the pipeline owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls of any kind
    pub fn fail_next(&self, n: u32) {
        self.state.borrow_mut().fail_next = n;
    }

    /// Fail every call until switched back
    pub fn set_offline(&self, offline: bool) {
        self.state.borrow_mut().offline = offline;
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state.borrow().sessions.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn patches(&self) -> Vec<(String, SessionPatch)> {
        self.state.borrow().patches.clone()
    }

    /// Calls received, successful or not
    pub fn call_count(&self) -> u64 {
        self.state.borrow().calls
    }
}

impl EventStore for MemoryStore {
    fn append_session(&mut self, record: &SessionRecord) -> Result<(), TelemetryError> {
        let mut state = self.state.borrow_mut();
        state.check_available()?;
        state.sessions.push(record.clone());
        Ok(())
    }

    fn append_events(&mut self, batch: &[Event]) -> Result<(), TelemetryError> {
        let mut state = self.state.borrow_mut();
        state.check_available()?;
        state.events.extend_from_slice(batch);
        Ok(())
    }

    fn update_session(&mut self, id: &str, patch: &SessionPatch) -> Result<(), TelemetryError> {
        let mut state = self.state.borrow_mut();
        state.check_available()?;
        if let Some(record) = state.sessions.iter_mut().find(|s| s.id == id) {
            record.ended_at = Some(patch.ended_at);
            record.total_event_count = patch.total_event_count;
        }
        state.patches.push((id.to_string(), patch.clone()));
        Ok(())
    }
}

// ============================================================================
// Newline-delimited JSON store
// ============================================================================

/// One line of an [`NdjsonStore`] file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreLine {
    AppendSession { record: SessionRecord },
    AppendEvent { event: Event },
    UpdateSession { id: String, patch: SessionPatch },
}

/// Append-only file store, one JSON object per line
#[derive(Debug, Clone)]
pub struct NdjsonStore {
    path: PathBuf,
}

impl NdjsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every line back
    pub fn read_lines(path: &Path) -> Result<Vec<StoreLine>, TelemetryError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut lines = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<StoreLine>(trimmed).map_err(|e| {
                TelemetryError::ParseError(format!("Failed to parse line {}: {}", line_num + 1, e))
            })?;
            lines.push(parsed);
        }
        Ok(lines)
    }

    fn write_lines(&self, lines: &[StoreLine]) -> Result<(), TelemetryError> {
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(&serde_json::to_string(line)?);
            buffer.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buffer.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl EventStore for NdjsonStore {
    fn append_session(&mut self, record: &SessionRecord) -> Result<(), TelemetryError> {
        self.write_lines(&[StoreLine::AppendSession {
            record: record.clone(),
        }])
    }

    fn append_events(&mut self, batch: &[Event]) -> Result<(), TelemetryError> {
        let lines: Vec<StoreLine> = batch
            .iter()
            .cloned()
            .map(|event| StoreLine::AppendEvent { event })
            .collect();
        self.write_lines(&lines)
    }

    fn update_session(&mut self, id: &str, patch: &SessionPatch) -> Result<(), TelemetryError> {
        self.write_lines(&[StoreLine::UpdateSession {
            id: id.to_string(),
            patch: patch.clone(),
        }])
    }
}

// ============================================================================
// Best-effort transports
// ============================================================================

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBeacon;

impl BestEffortTransport for NullBeacon {
    fn send(&mut self, endpoint: &str, payload: &str) {
        debug!(endpoint, bytes = payload.len(), "Best-effort payload discarded");
    }
}

/// Records what was sent. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MemoryBeacon {
    sent: Rc<RefCell<Vec<(String, String)>>>,
}

impl MemoryBeacon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.borrow().clone()
    }
}

impl BestEffortTransport for MemoryBeacon {
    fn send(&mut self, endpoint: &str, payload: &str) {
        self.sent
            .borrow_mut()
            .push((endpoint.to_string(), payload.to_string()));
    }
}

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Fires the payload as one non-blocking UDP datagram
#[derive(Debug)]
pub struct UdpBeacon {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpBeacon {
    pub fn new(target: SocketAddr) -> Result<Self, TelemetryError> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, target })
    }
}

impl BestEffortTransport for UdpBeacon {
    fn send(&mut self, endpoint: &str, payload: &str) {
        let envelope = serde_json::json!({ "endpoint": endpoint, "payload": payload }).to_string();
        if envelope.len() > MAX_DATAGRAM_BYTES {
            debug!(bytes = envelope.len(), "Best-effort payload too large for datagram");
            return;
        }
        if let Err(err) = self.socket.send_to(envelope.as_bytes(), self.target) {
            debug!(error = %err, "Best-effort datagram not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceInfo, EventData, EventType};
    use chrono::{TimeZone, Utc};

    fn record() -> SessionRecord {
        SessionRecord {
            id: "sess-1".to_string(),
            principal_id: "user-1".to_string(),
            started_at: Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap(),
            ended_at: None,
            device_info: DeviceInfo::default(),
            total_event_count: 0,
        }
    }

    fn event(seq: u64) -> Event {
        Event {
            session_id: "sess-1".to_string(),
            principal_id: Some("user-1".to_string()),
            sequence_num: seq,
            event_type: EventType::PageView,
            target: None,
            data: EventData::new(),
            section_context: Some("intro".to_string()),
            client_timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 1).unwrap(),
        }
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        let mut handle = store.clone();

        store.fail_next(1);
        assert!(handle.append_events(&[event(1)]).is_err());
        assert!(handle.append_events(&[event(1)]).is_ok());

        store.set_offline(true);
        assert!(handle.append_session(&record()).is_err());
        store.set_offline(false);

        assert_eq!(store.events().len(), 1);
        assert_eq!(store.call_count(), 3);
    }

    #[test]
    fn test_memory_store_update_patches_record() {
        let store = MemoryStore::new();
        let mut handle = store.clone();
        handle.append_session(&record()).unwrap();
        let ended = Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap();
        handle
            .update_session(
                "sess-1",
                &SessionPatch {
                    ended_at: ended,
                    total_event_count: 12,
                },
            )
            .unwrap();

        let sessions = store.sessions();
        assert_eq!(sessions[0].ended_at, Some(ended));
        assert_eq!(sessions[0].total_event_count, 12);
        assert_eq!(store.patches().len(), 1);
    }

    #[test]
    fn test_ndjson_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.ndjson");
        let mut store = NdjsonStore::new(&path);

        store.append_session(&record()).unwrap();
        store.append_events(&[event(1), event(2)]).unwrap();

        let lines = NdjsonStore::read_lines(&path).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(matches!(lines[0], StoreLine::AppendSession { .. }));
        match &lines[2] {
            StoreLine::AppendEvent { event } => assert_eq!(event.sequence_num, 2),
            other => panic!("unexpected line {:?}", other),
        }
    }

    #[test]
    fn test_ndjson_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lines = NdjsonStore::read_lines(&dir.path().join("absent.ndjson")).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_memory_beacon_records() {
        let beacon = MemoryBeacon::new();
        let mut handle = beacon.clone();
        handle.send("/api/log-events", "[]");
        assert_eq!(
            beacon.sent(),
            vec![("/api/log-events".to_string(), "[]".to_string())]
        );
    }

    #[test]
    fn test_udp_beacon_never_blocks() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut beacon = UdpBeacon::new(receiver.local_addr().unwrap()).unwrap();
        beacon.send("/api/log-events", "[1,2,3]");

        let mut buf = [0u8; 1024];
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value["endpoint"], "/api/log-events");
        assert_eq!(value["payload"], "[1,2,3]");
    }
}
