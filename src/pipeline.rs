//! Pipeline orchestration
//!
//! [`Pipeline`] is the session handle the UI layer talks to. It owns the dedup
//! filters, the sequencer, the delivery queue and the flush task for exactly one
//! open session, and hands batches to the durable store.
//!
//! Stages for every logged action:
//! 1. DedupLayer - click merge and scroll quantization (typed helpers only)
//! 2. EventEncoder - payload normalization, then sequence allocation
//! 3. DeliveryQueue - append at the tail
//! 4. Flush - timer, high-priority event, backgrounding, or session end
//!
//! Nothing here returns an error to the caller. Delivery failures are re-queued
//! and logged; malformed events are dropped and logged.

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::dedup::{ClickTarget, DedupLayer};
use crate::encoder::{finite_number, EventDraft, EventEncoder, PayloadPolicy};
use crate::error::TelemetryError;
use crate::lifecycle::{HookId, HookRegistry, LifecycleEvent, LifecycleSignals};
use crate::principal::{
    provision_guest, HandleStore, IdentityProvider, LocalIdentityProvider, MemoryHandleStore,
    Principal,
};
use crate::queue::{DeliveryQueue, QueueBatch};
use crate::scheduler::{DeadlineScheduler, Repeat, TaskId, TaskScheduler};
use crate::stuck::{StuckEvent, StuckReason};
use crate::transport::{BestEffortTransport, EventStore, NullBeacon};
use crate::types::{
    DeviceInfo, Event, EventData, EventType, FlushStats, PrincipalState, SessionInfo,
    SessionPatch, SessionRecord,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ActiveSession {
    id: String,
    principal: Option<Principal>,
    started_at: DateTime<Utc>,
    persisted: bool,
    queue: DeliveryQueue,
    flush_task: TaskId,
    hook: HookId,
    stats: FlushStats,
}

impl ActiveSession {
    fn principal_state(&self) -> PrincipalState {
        if self.principal.is_some() {
            PrincipalState::Resolved
        } else {
            PrincipalState::Unresolved
        }
    }
}

/// Session handle for one embedding host.
///
/// Handles are independent: several can coexist, each with its own session,
/// queue and timer.
pub struct Pipeline {
    config: PipelineConfig,
    clock: Box<dyn Clock>,
    scheduler: Box<dyn TaskScheduler>,
    store: Box<dyn EventStore>,
    beacon: Box<dyn BestEffortTransport>,
    handles: Box<dyn HandleStore>,
    identity: Box<dyn IdentityProvider>,
    lifecycle: Box<dyn LifecycleSignals>,
    device_info: DeviceInfo,
    dedup: DedupLayer,
    encoder: EventEncoder,
    session: Option<ActiveSession>,
}

impl Pipeline {
    /// Create a handle that delivers to `store`.
    ///
    /// Uses the system clock, an internal scheduler, a discarding best-effort
    /// transport and an in-memory guest credential until replaced with the
    /// `with_*` builders.
    ///
    /// # Example
    /// ```ignore
    /// let mut pipeline = Pipeline::new(PipelineConfig::default(), MemoryStore::new());
    /// let session_id = pipeline.init_session(Some(Principal::authenticated("user-42")));
    /// ```
    pub fn new(config: PipelineConfig, store: impl EventStore + 'static) -> Self {
        let dedup = DedupLayer::new(config.click_merge_window(), config.scroll_threshold_pct);
        let encoder = EventEncoder::new(PayloadPolicy::from_config(&config));
        Self {
            config,
            clock: Box::new(SystemClock),
            scheduler: Box::new(DeadlineScheduler::new()),
            store: Box::new(store),
            beacon: Box::new(NullBeacon),
            handles: Box::new(MemoryHandleStore::new()),
            identity: Box::new(LocalIdentityProvider::new()),
            lifecycle: Box::new(HookRegistry::new()),
            device_info: DeviceInfo::detect(),
            dedup,
            encoder,
            session: None,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_scheduler(mut self, scheduler: impl TaskScheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    pub fn with_beacon(mut self, beacon: impl BestEffortTransport + 'static) -> Self {
        self.beacon = Box::new(beacon);
        self
    }

    pub fn with_identity(
        mut self,
        handles: impl HandleStore + 'static,
        identity: impl IdentityProvider + 'static,
    ) -> Self {
        self.handles = Box::new(handles);
        self.identity = Box::new(identity);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: impl LifecycleSignals + 'static) -> Self {
        self.lifecycle = Box::new(lifecycle);
        self
    }

    pub fn with_device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = device_info;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Open a new session and return its id.
    ///
    /// An open session is ended first. Without a principal a guest is
    /// provisioned; if that fails the session still opens, events queue, and
    /// provisioning is retried on each flush tick.
    pub fn init_session(&mut self, principal: Option<Principal>) -> String {
        if self.session.is_some() {
            info!("Replacing active session");
            self.end_session();
        }

        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();
        self.encoder.reset();
        self.dedup.clear();

        let principal = match principal {
            Some(principal) => Some(principal),
            None => self.provision(),
        };

        let flush_task = self
            .scheduler
            .start(self.config.flush_interval(), Repeat::Every, now);
        let hook = self.lifecycle.attach();

        self.session = Some(ActiveSession {
            id: id.clone(),
            principal,
            started_at: now,
            persisted: false,
            queue: DeliveryQueue::new(),
            flush_task,
            hook,
            stats: FlushStats::default(),
        });
        self.persist_session();

        info!(
            session_id = %id,
            principal_state = ?self.session.as_ref().map(ActiveSession::principal_state),
            "Session started"
        );
        id
    }

    /// Close the open session. Returns false when there was none.
    ///
    /// Logs `session_end`, attempts a final flush, hands anything still queued
    /// to the best-effort transport, then patches the session record and
    /// cancels the timer and hooks. Events of a session whose principal never
    /// resolved are dropped instead of sent without one.
    pub fn end_session(&mut self) -> bool {
        if self.session.is_none() {
            return false;
        }

        let preceding = self.encoder.sequence();
        self.record(EventDraft::new(EventType::SessionEnd).field("total_events", preceding));
        if !self.config.is_immediate(&EventType::SessionEnd) {
            self.flush();
        }

        let Some(mut session) = self.session.take() else {
            return false;
        };
        let now = self.clock.now();
        let total_events = self.encoder.sequence();

        let residual = session.queue.take_all();
        if !residual.is_empty() && session.principal.is_none() {
            warn!(
                session_id = %session.id,
                events = residual.len(),
                "Dropping residual events, principal never resolved"
            );
        } else if !residual.is_empty() {
            info!(
                session_id = %session.id,
                events = residual.len(),
                "Handing residual events to best-effort transport"
            );
            self.send_best_effort(&residual);
        }

        if session.persisted {
            let patch = SessionPatch {
                ended_at: now,
                total_event_count: total_events,
            };
            if let Err(err) = self.store.update_session(&session.id, &patch) {
                warn!(error = %err, session_id = %session.id, "Failed to update session record");
            }
        } else if let Some(principal) = &session.principal {
            let record = SessionRecord {
                id: session.id.clone(),
                principal_id: principal.id.clone(),
                started_at: session.started_at,
                ended_at: Some(now),
                device_info: self.device_info.clone(),
                total_event_count: total_events,
            };
            if let Err(err) = self.store.append_session(&record) {
                warn!(error = %err, session_id = %session.id, "Failed to persist ended session");
            }
        }

        self.scheduler.stop(session.flush_task);
        self.lifecycle.detach(session.hook);
        self.dedup.clear();

        info!(
            session_id = %session.id,
            total_events,
            delivered = session.stats.events_delivered,
            "Session ended"
        );
        true
    }

    pub fn session_info(&self) -> SessionInfo {
        match &self.session {
            Some(session) => SessionInfo {
                session_id: Some(session.id.clone()),
                sequence_counter: self.encoder.sequence(),
                principal_id: session.principal.as_ref().map(|p| p.id.clone()),
                principal_state: Some(session.principal_state()),
                queued_events: session.queue.len(),
                in_flight_events: session.queue.in_flight_len(),
                flush_timer_active: self.scheduler.is_active(session.flush_task),
                session_persisted: session.persisted,
                flush_stats: session.stats,
            },
            None => SessionInfo {
                session_id: None,
                sequence_counter: 0,
                principal_id: None,
                principal_state: None,
                queued_events: 0,
                in_flight_events: 0,
                flush_timer_active: false,
                session_persisted: false,
                flush_stats: FlushStats::default(),
            },
        }
    }

    // ------------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------------

    /// Record one event. Returns `None` without side effects when no session
    /// is open, and `None` after a warning when the payload is malformed.
    pub fn log_event(
        &mut self,
        event_type: EventType,
        target: Option<&str>,
        data: EventData,
        section: Option<&str>,
    ) -> Option<Event> {
        let mut draft = EventDraft::new(event_type).section(section);
        draft.target = target.map(str::to_string);
        draft.data = data;
        self.record(draft)
    }

    /// Log a click unless it repeats the last logged click on the same target
    /// inside the merge window.
    pub fn log_click(
        &mut self,
        target: &ClickTarget,
        x: f64,
        y: f64,
        section: Option<&str>,
    ) -> Option<Event> {
        self.session.as_ref()?;
        let (x, y) = match (finite_number("x", x), finite_number("y", y)) {
            (Ok(x), Ok(y)) => (x, y),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "Dropped malformed click");
                return None;
            }
        };

        let now = self.clock.now();
        let resolved = target.resolve();
        if !self.dedup.admit_click(&resolved, section, now) {
            debug!(click_target = %resolved, "Merged repeat click");
            return None;
        }

        self.record(
            EventDraft::new(EventType::Click)
                .target(resolved)
                .field("x", x)
                .field("y", y)
                .section(section),
        )
    }

    /// Log scroll depth (percent) when it enters a new bucket
    pub fn log_scroll(&mut self, depth_pct: f64, section: Option<&str>) -> Option<Event> {
        self.session.as_ref()?;
        let bucket = self.dedup.admit_scroll(depth_pct, section)?;
        self.record(
            EventDraft::new(EventType::Scroll)
                .field("depth_percent", bucket)
                .section(section),
        )
    }

    /// Log a page view. Always resets the dedup filters.
    pub fn log_page_view(&mut self, section: &str, referrer: Option<&str>) -> Option<Event> {
        self.session.as_ref()?;
        self.dedup.clear();
        self.dedup.enter_section(Some(section));

        let referrer = referrer.map_or(Value::Null, |r| Value::String(r.to_string()));
        self.record(
            EventDraft::new(EventType::PageView)
                .field("referrer_section", referrer)
                .section(Some(section)),
        )
    }

    pub fn log_problem_attempt(
        &mut self,
        problem_id: &str,
        is_correct: bool,
        time_spent_ms: u64,
        hint_used: bool,
        section: Option<&str>,
    ) -> Option<Event> {
        self.record(
            EventDraft::new(EventType::ProblemAttempt)
                .target(problem_id)
                .field("problem_id", problem_id)
                .field("is_correct", is_correct)
                .field("time_spent_ms", time_spent_ms)
                .field("hint_used", hint_used)
                .section(section),
        )
    }

    pub fn log_hint_request(
        &mut self,
        problem_id: &str,
        hint_index: u32,
        section: Option<&str>,
    ) -> Option<Event> {
        self.record(
            EventDraft::new(EventType::HintRequest)
                .target(problem_id)
                .field("problem_id", problem_id)
                .field("hint_index", hint_index)
                .section(section),
        )
    }

    /// Only the shape of a chat turn is recorded, never its text
    pub fn log_chat_message(
        &mut self,
        turn_number: u32,
        message_length: usize,
        is_user: bool,
        section: Option<&str>,
    ) -> Option<Event> {
        self.record(
            EventDraft::new(EventType::ChatMessage)
                .field("turn_number", turn_number)
                .field("message_length", message_length)
                .field("is_user", is_user)
                .section(section),
        )
    }

    pub fn log_highlight_create(
        &mut self,
        text_length: usize,
        has_note: bool,
        section: Option<&str>,
    ) -> Option<Event> {
        self.record(
            EventDraft::new(EventType::HighlightCreate)
                .field("text_length", text_length)
                .field("has_note", has_note)
                .section(section),
        )
    }

    /// Generic UI interaction, named by `action`
    pub fn log_interaction(
        &mut self,
        action: &str,
        target: Option<&str>,
        mut data: EventData,
        section: Option<&str>,
    ) -> Option<Event> {
        data.insert("action".to_string(), Value::String(action.to_string()));
        self.log_event(EventType::Interaction, target, data, section)
    }

    /// Record a stuck event emitted by the rule engine
    pub fn log_stuck_event(&mut self, stuck: &StuckEvent) -> Option<Event> {
        let mut draft = EventDraft::new(EventType::StuckDetected)
            .field("reason", stuck.reason.code())
            .field("detected_at_ms", stuck.timestamp.timestamp_millis())
            .section(stuck.section_id.as_deref());
        draft = match stuck.reason {
            StuckReason::ConsecutiveWrong { count }
            | StuckReason::UnitErrors { count }
            | StuckReason::HintClicks { count } => draft.field("count", count),
            StuckReason::Idle { idle_ms } => draft.field("idle_ms", idle_ms),
        };
        if let Some(problem_id) = &stuck.problem_id {
            draft = draft.target(problem_id.clone());
        }
        self.record(draft)
    }

    fn record(&mut self, draft: EventDraft) -> Option<Event> {
        let now = self.clock.now();
        let session = self.session.as_mut()?;
        let event_type = draft.event_type.clone();
        let principal_id = session.principal.as_ref().map(|p| p.id.as_str());

        let event = match self.encoder.encode(&session.id, principal_id, draft, now) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, event_type = %event_type, "Dropped malformed event");
                return None;
            }
        };
        session.queue.push(event.clone());

        if self.config.is_immediate(&event_type) {
            self.flush();
        }
        Some(event)
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Deliver the live queue synchronously. Returns true when a batch was
    /// accepted by the store.
    pub fn flush(&mut self) -> bool {
        let Some(batch) = self.begin_flush() else {
            return false;
        };
        let outcome = self.store.append_events(batch.events());
        self.complete_flush(batch, outcome)
    }

    /// Take the live queue as the in-flight batch.
    ///
    /// Returns `None` when there is no session, nothing queued, a batch already
    /// in flight, no resolved principal, or the session record cannot be
    /// persisted yet. Events logged afterwards land in a fresh queue.
    pub fn begin_flush(&mut self) -> Option<QueueBatch> {
        let session = self.session.as_ref()?;
        if session.queue.is_empty() || session.queue.in_flight().is_some() {
            return None;
        }
        if session.principal.is_none() {
            debug!(session_id = %session.id, "Flush withheld until principal resolves");
            return None;
        }
        if !self.persist_session() {
            return None;
        }

        let session = self.session.as_mut()?;
        let batch = session.queue.drain(&session.id)?;
        session.stats.attempts += 1;
        debug!(session_id = %session.id, events = batch.len(), "Flushing batch");
        Some(batch)
    }

    /// Report the store's answer for a batch from [`Pipeline::begin_flush`].
    ///
    /// Success retires the batch. Failure puts it back ahead of anything logged
    /// since, to be retried on the next tick. A failed batch from a session that
    /// has since ended goes to the best-effort transport.
    pub fn complete_flush(
        &mut self,
        batch: QueueBatch,
        outcome: Result<(), TelemetryError>,
    ) -> bool {
        let is_current = self
            .session
            .as_ref()
            .map_or(false, |s| s.id == batch.session_id());

        if !is_current {
            return match outcome {
                Ok(()) => {
                    debug!(session_id = %batch.session_id(), "Late batch delivered for ended session");
                    true
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        session_id = %batch.session_id(),
                        events = batch.len(),
                        "Flush failed after session ended"
                    );
                    self.send_best_effort(batch.events());
                    false
                }
            };
        }

        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match outcome {
            Ok(()) => {
                session.queue.acknowledge(batch.id());
                session.stats.successes += 1;
                session.stats.events_delivered += batch.len() as u64;
                debug!(session_id = %session.id, events = batch.len(), "Batch delivered");
                true
            }
            Err(err) => {
                session.stats.failures += 1;
                warn!(
                    error = %err,
                    retryable = err.is_retryable(),
                    session_id = %session.id,
                    events = batch.len(),
                    "Flush failed, batch re-queued"
                );
                session.queue.restore(batch);
                false
            }
        }
    }

    /// Poll the flush timer. When it has fired, retry principal provisioning
    /// if needed and flush. Returns true when a batch was delivered.
    pub fn tick(&mut self) -> bool {
        let now = self.clock.now();
        let Some(flush_task) = self.session.as_ref().map(|s| s.flush_task) else {
            return false;
        };
        if !self.scheduler.fire(flush_task, now) {
            return false;
        }

        if self.session.as_ref().map_or(false, |s| s.principal.is_none()) {
            if let Some(principal) = self.provision() {
                if let Some(session) = self.session.as_mut() {
                    let stamped = session.queue.attribute(&principal.id);
                    info!(
                        session_id = %session.id,
                        principal_id = %principal.id,
                        stamped,
                        "Principal resolved"
                    );
                    session.principal = Some(principal);
                }
            }
        }

        self.flush()
    }

    /// React to a host lifecycle notification
    pub fn on_lifecycle(&mut self, event: LifecycleEvent) {
        let Some(session) = &self.session else {
            return;
        };
        match event {
            LifecycleEvent::Hidden => {
                self.flush();
            }
            LifecycleEvent::Visible => {
                debug!(session_id = %session.id, "Host visible");
            }
            LifecycleEvent::Unload => {
                if session.principal.is_none() {
                    debug!(session_id = %session.id, "Unload beacon withheld until principal resolves");
                    return;
                }
                let pending = session.queue.pending();
                self.send_best_effort(&pending);
            }
        }
    }

    fn provision(&mut self) -> Option<Principal> {
        match provision_guest(self.handles.as_mut(), self.identity.as_mut()) {
            Ok(principal) => Some(principal),
            Err(err) => {
                warn!(error = %err, "Principal unresolved, events will queue");
                None
            }
        }
    }

    /// Make sure the store has the session record. Returns false while it does
    /// not.
    fn persist_session(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.persisted {
            return true;
        }
        let Some(principal) = &session.principal else {
            return false;
        };

        let record = SessionRecord {
            id: session.id.clone(),
            principal_id: principal.id.clone(),
            started_at: session.started_at,
            ended_at: None,
            device_info: self.device_info.clone(),
            total_event_count: 0,
        };
        match self.store.append_session(&record) {
            Ok(()) => {
                session.persisted = true;
                true
            }
            Err(err) => {
                session.stats.failures += 1;
                warn!(error = %err, session_id = %session.id, "Failed to persist session record");
                false
            }
        }
    }

    fn send_best_effort(&mut self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        match serde_json::to_string(events) {
            Ok(payload) => self.beacon.send(&self.config.unload_endpoint, &payload),
            Err(err) => warn!(error = %err, "Failed to encode best-effort payload"),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.scheduler.stop(session.flush_task);
            self.lifecycle.detach(session.hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::{MemoryBeacon, MemoryStore};
    use pretty_assertions::assert_eq;

    fn pipeline() -> (Pipeline, MemoryStore, ManualClock) {
        let store = MemoryStore::new();
        let clock = ManualClock::from_millis(1_705_327_200_000);
        let pipeline = Pipeline::new(PipelineConfig::default(), store.clone())
            .with_clock(clock.clone())
            .with_device_info(DeviceInfo::default());
        (pipeline, store, clock)
    }

    #[test]
    fn test_logging_without_session_is_noop() {
        let (mut pipeline, store, _) = pipeline();
        assert!(pipeline
            .log_event(EventType::Click, None, EventData::new(), None)
            .is_none());
        assert!(pipeline.log_scroll(50.0, None).is_none());
        assert!(!pipeline.end_session());
        assert_eq!(store.call_count(), 0);
    }

    #[test]
    fn test_init_session_persists_record() {
        let (mut pipeline, store, _) = pipeline();
        let id = pipeline.init_session(Some(Principal::authenticated("user-1")));

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].principal_id, "user-1");

        let info = pipeline.session_info();
        assert!(info.session_persisted);
        assert!(info.flush_timer_active);
        assert_eq!(info.principal_state, Some(PrincipalState::Resolved));
    }

    #[test]
    fn test_guest_is_provisioned_without_principal() {
        let (mut pipeline, store, _) = pipeline();
        pipeline.init_session(None);
        let info = pipeline.session_info();
        assert!(info.principal_id.is_some());
        assert_eq!(store.sessions()[0].principal_id, info.principal_id.unwrap());
    }

    #[test]
    fn test_timer_flushes_queue() {
        let (mut pipeline, store, clock) = pipeline();
        pipeline.init_session(Some(Principal::authenticated("user-1")));
        pipeline.log_page_view("intro", None);
        pipeline.log_chat_message(1, 40, true, Some("intro"));

        clock.advance_millis(4_999);
        assert!(!pipeline.tick());
        assert!(store.events().is_empty());

        clock.advance_millis(1);
        assert!(pipeline.tick());
        assert_eq!(store.events().len(), 2);
        assert_eq!(pipeline.session_info().flush_stats.events_delivered, 2);
    }

    #[test]
    fn test_problem_attempt_flushes_immediately() {
        let (mut pipeline, store, _) = pipeline();
        pipeline.init_session(Some(Principal::authenticated("user-1")));
        pipeline.log_highlight_create(120, false, Some("intro"));
        pipeline.log_problem_attempt("p1", false, 3_000, false, Some("intro"));

        let seqs: Vec<u64> = store.events().iter().map(|e| e.sequence_num).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_stuck_event_is_logged() {
        let (mut pipeline, store, clock) = pipeline();
        pipeline.init_session(Some(Principal::authenticated("user-1")));
        let stuck = StuckEvent {
            problem_id: Some("p1".into()),
            section_id: Some("torque".into()),
            reason: StuckReason::ConsecutiveWrong { count: 2 },
            timestamp: clock.now(),
        };

        let event = pipeline.log_stuck_event(&stuck).unwrap();
        assert_eq!(event.event_type, EventType::StuckDetected);
        assert_eq!(event.target.as_deref(), Some("p1"));
        assert_eq!(event.data["reason"], "consecutive_wrong");
        assert_eq!(event.data["count"], 2);
        assert!(store.events().is_empty());
    }

    #[test]
    fn test_unload_beacons_without_clearing() {
        let (pipeline, _, _) = pipeline();
        let beacon = MemoryBeacon::new();
        let mut pipeline = pipeline.with_beacon(beacon.clone());
        pipeline.init_session(Some(Principal::authenticated("user-1")));
        pipeline.log_chat_message(1, 10, true, None);

        pipeline.on_lifecycle(LifecycleEvent::Unload);
        let sent = beacon.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "/api/log-events");
        let events: Vec<Event> = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(pipeline.session_info().queued_events, 1);
    }

    #[test]
    fn test_session_end_reports_preceding_count() {
        let (mut pipeline, store, _) = pipeline();
        pipeline.init_session(Some(Principal::authenticated("user-1")));
        pipeline.log_chat_message(1, 10, true, None);
        pipeline.log_chat_message(2, 12, false, None);
        assert!(pipeline.end_session());

        let events = store.events();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::SessionEnd);
        assert_eq!(last.sequence_num, 3);
        assert_eq!(last.data["total_events"], 2);
        assert_eq!(store.sessions()[0].total_event_count, 3);
        assert!(store.sessions()[0].ended_at.is_some());
    }
}
