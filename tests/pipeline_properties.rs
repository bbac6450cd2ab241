//! End-to-end behavior of the telemetry pipeline and stuck detection

use std::cell::Cell;
use std::rc::Rc;

use chrono::Duration;
use pretty_assertions::assert_eq;

use lumen_telemetry::clock::ManualClock;
use lumen_telemetry::lifecycle::HookRegistry;
use lumen_telemetry::principal::{GuestCredential, IdentityProvider, MemoryHandleStore};
use lumen_telemetry::scheduler::{DeadlineScheduler, TaskScheduler};
use lumen_telemetry::stuck::{
    create_context, detect_stuck_event, update_after_answer, StuckMonitor,
};
use lumen_telemetry::transport::{MemoryBeacon, MemoryStore};
use lumen_telemetry::types::{DeviceInfo, PrincipalState};
use lumen_telemetry::{
    ClickTarget, Clock, EventData, EventType, Pipeline, PipelineConfig, Principal, StuckReason,
    StuckRules, TelemetryError,
};

const T0_MS: i64 = 1_705_327_200_000;

struct Harness {
    pipeline: Pipeline,
    store: MemoryStore,
    clock: ManualClock,
    scheduler: DeadlineScheduler,
    hooks: HookRegistry,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let clock = ManualClock::from_millis(T0_MS);
    let scheduler = DeadlineScheduler::new();
    let hooks = HookRegistry::new();
    let pipeline = Pipeline::new(PipelineConfig::default(), store.clone())
        .with_clock(clock.clone())
        .with_scheduler(scheduler.clone())
        .with_lifecycle(hooks.clone())
        .with_device_info(DeviceInfo::default());
    Harness {
        pipeline,
        store,
        clock,
        scheduler,
        hooks,
    }
}

fn user() -> Option<Principal> {
    Some(Principal::authenticated("user-1"))
}

fn seqs(store: &MemoryStore) -> Vec<u64> {
    store.events().iter().map(|e| e.sequence_num).collect()
}

fn log_chat(pipeline: &mut Pipeline, turn: u32) {
    pipeline
        .log_chat_message(turn, 20, turn % 2 == 1, Some("intro"))
        .expect("chat message should be logged");
}

/// Identity provider that fails a fixed number of times before succeeding
#[derive(Clone)]
struct FlakyIdentity {
    failures_left: Rc<Cell<u32>>,
    calls: Rc<Cell<u32>>,
}

impl FlakyIdentity {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: Rc::new(Cell::new(times)),
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl IdentityProvider for FlakyIdentity {
    fn sign_in_or_create(
        &mut self,
        credential: &GuestCredential,
    ) -> Result<String, TelemetryError> {
        self.calls.set(self.calls.get() + 1);
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            return Err(TelemetryError::Transport("identity service down".into()));
        }
        Ok(format!("guest-principal-{}", credential.handle))
    }
}

#[test]
fn test_sequence_has_no_gaps_across_failures() {
    let mut h = harness();
    h.pipeline.init_session(user());

    h.store.fail_next(2);
    for turn in 1..=3 {
        log_chat(&mut h.pipeline, turn);
    }
    h.pipeline.flush();
    for turn in 4..=6 {
        log_chat(&mut h.pipeline, turn);
    }
    h.pipeline.flush();
    h.pipeline.flush();

    assert_eq!(seqs(&h.store), vec![1, 2, 3, 4, 5, 6]);
    let stats = h.pipeline.session_info().flush_stats;
    assert_eq!(stats.failures, 2);
    assert_eq!(stats.successes, 1);
}

#[test]
fn test_repeated_failures_keep_order() {
    let mut baseline = harness();
    baseline.pipeline.init_session(user());
    for turn in 1..=5 {
        log_chat(&mut baseline.pipeline, turn);
    }
    baseline.pipeline.flush();

    let mut h = harness();
    h.pipeline.init_session(user());
    h.store.fail_next(3);
    for turn in 1..=5 {
        log_chat(&mut h.pipeline, turn);
        h.clock.advance_millis(5_000);
        h.pipeline.tick();
    }
    h.clock.advance_millis(5_000);
    h.pipeline.tick();

    assert_eq!(seqs(&h.store), seqs(&baseline.store));
    assert_eq!(h.pipeline.session_info().queued_events, 0);
}

#[test]
fn test_events_logged_during_flight_survive_failure() {
    let mut h = harness();
    h.pipeline.init_session(user());
    log_chat(&mut h.pipeline, 1);
    log_chat(&mut h.pipeline, 2);

    let batch = h.pipeline.begin_flush().expect("batch");
    assert_eq!(batch.len(), 2);
    assert!(h.pipeline.begin_flush().is_none());

    log_chat(&mut h.pipeline, 3);
    let info = h.pipeline.session_info();
    assert_eq!(info.in_flight_events, 2);
    assert_eq!(info.queued_events, 1);

    let delivered = h
        .pipeline
        .complete_flush(batch, Err(TelemetryError::Transport("timeout".into())));
    assert!(!delivered);
    assert_eq!(h.pipeline.session_info().queued_events, 3);

    assert!(h.pipeline.flush());
    assert_eq!(seqs(&h.store), vec![1, 2, 3]);
}

#[test]
fn test_click_merge_window() {
    let mut h = harness();
    h.pipeline.init_session(user());
    let target = ClickTarget::with_test_id("check-answer");

    assert!(h.pipeline.log_click(&target, 5.0, 5.0, Some("intro")).is_some());
    h.clock.advance_millis(100);
    assert!(h.pipeline.log_click(&target, 5.0, 5.0, Some("intro")).is_none());
    h.clock.advance_millis(500);
    assert!(h.pipeline.log_click(&target, 5.0, 5.0, Some("intro")).is_some());

    assert_eq!(h.pipeline.session_info().sequence_counter, 2);
}

#[test]
fn test_scroll_quantization() {
    let mut h = harness();
    h.pipeline.init_session(user());

    let logged: Vec<u64> = [3.0, 12.0, 19.0, 25.0]
        .iter()
        .filter_map(|d| h.pipeline.log_scroll(*d, Some("reading")))
        .map(|e| e.data["depth_percent"].as_u64().unwrap())
        .collect();
    assert_eq!(logged, vec![10, 20]);
}

#[test]
fn test_page_view_resets_filters() {
    let mut h = harness();
    h.pipeline.init_session(user());
    let target = ClickTarget::with_element_id("next");

    assert!(h.pipeline.log_click(&target, 1.0, 1.0, Some("intro")).is_some());
    assert!(h.pipeline.log_scroll(42.0, Some("intro")).is_some());

    h.pipeline.log_page_view("intro", Some("intro"));
    assert!(h.pipeline.log_click(&target, 1.0, 1.0, Some("intro")).is_some());
    assert!(h.pipeline.log_scroll(42.0, Some("intro")).is_some());
}

#[test]
fn test_stuck_rules_fire_once() {
    let rules = StuckRules::default();
    let t0 = ManualClock::from_millis(T0_MS).now();

    let context = create_context(Some("torque".into()), Some("p1".into()), t0);
    assert!(detect_stuck_event(&context, &rules, t0).event.is_none());

    let context = update_after_answer(&context, false, false, t0);
    let context = update_after_answer(&context, false, false, t0);
    let detection = detect_stuck_event(&context, &rules, t0);
    let event = detection.event.expect("two wrong answers");
    assert_eq!(event.reason, StuckReason::ConsecutiveWrong { count: 2 });

    let context = update_after_answer(&detection.context, false, false, t0);
    assert!(detect_stuck_event(&context, &rules, t0).event.is_none());
}

#[test]
fn test_end_session_twice() {
    let mut h = harness();
    h.pipeline.init_session(user());
    log_chat(&mut h.pipeline, 1);

    assert!(h.pipeline.end_session());
    let calls = h.store.call_count();
    assert!(!h.pipeline.end_session());
    assert_eq!(h.store.call_count(), calls);

    assert_eq!(h.scheduler.active_count(), 0);
    assert_eq!(h.hooks.attached_count(), 0);
    assert!(h
        .pipeline
        .log_event(EventType::Click, None, EventData::new(), None)
        .is_none());
}

#[test]
fn test_init_session_replaces_flush_task() {
    let mut h = harness();
    let first = h.pipeline.init_session(user());
    log_chat(&mut h.pipeline, 1);
    let second = h.pipeline.init_session(user());

    assert_ne!(first, second);
    assert_eq!(h.scheduler.started_total(), 2);
    assert_eq!(h.scheduler.stopped_total(), 1);
    assert_eq!(h.scheduler.active_count(), 1);
    assert_eq!(h.hooks.attached_count(), 1);

    // The replaced session was ended and its events delivered
    let sessions = h.store.sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions[0].ended_at.is_some());
    let first_events: Vec<EventType> = h
        .store
        .events()
        .into_iter()
        .filter(|e| e.session_id == first)
        .map(|e| e.event_type)
        .collect();
    assert_eq!(first_events, vec![EventType::ChatMessage, EventType::SessionEnd]);

    // Numbering restarts for the new session
    let event = h
        .pipeline
        .log_chat_message(1, 10, true, None)
        .expect("logged");
    assert_eq!(event.sequence_num, 1);
    assert_eq!(event.session_id, second);
}

#[test]
fn test_unresolved_principal_withholds_flush() {
    let store = MemoryStore::new();
    let clock = ManualClock::from_millis(T0_MS);
    let identity = FlakyIdentity::failing(2);
    let mut pipeline = Pipeline::new(PipelineConfig::default(), store.clone())
        .with_clock(clock.clone())
        .with_identity(MemoryHandleStore::new(), identity.clone())
        .with_device_info(DeviceInfo::default());

    pipeline.init_session(None);
    assert_eq!(
        pipeline.session_info().principal_state,
        Some(PrincipalState::Unresolved)
    );

    log_chat(&mut pipeline, 1);
    pipeline.log_problem_attempt("p1", true, 1_000, false, None);
    assert!(!pipeline.flush());
    assert_eq!(store.call_count(), 0);

    // Second provisioning attempt still fails
    clock.advance(Duration::milliseconds(5_000));
    assert!(!pipeline.tick());
    assert_eq!(pipeline.session_info().queued_events, 2);

    clock.advance(Duration::milliseconds(5_000));
    assert!(pipeline.tick());
    assert_eq!(identity.calls.get(), 3);

    let info = pipeline.session_info();
    assert_eq!(info.principal_state, Some(PrincipalState::Resolved));
    assert!(info.session_persisted);

    let events = store.events();
    assert_eq!(seqs(&store), vec![1, 2]);
    let principal = info.principal_id.unwrap();
    assert!(events
        .iter()
        .all(|e| e.principal_id.as_deref() == Some(principal.as_str())));
    assert_eq!(store.sessions()[0].principal_id, principal);
}

#[test]
fn test_unresolved_principal_sends_nothing_best_effort() {
    let store = MemoryStore::new();
    let beacon = MemoryBeacon::new();
    let mut pipeline = Pipeline::new(PipelineConfig::default(), store.clone())
        .with_clock(ManualClock::from_millis(T0_MS))
        .with_beacon(beacon.clone())
        .with_identity(MemoryHandleStore::new(), FlakyIdentity::failing(u32::MAX))
        .with_device_info(DeviceInfo::default());

    pipeline.init_session(None);
    log_chat(&mut pipeline, 1);

    pipeline.on_lifecycle(lumen_telemetry::LifecycleEvent::Unload);
    assert!(beacon.sent().is_empty());
    assert_eq!(pipeline.session_info().queued_events, 1);

    assert!(pipeline.end_session());
    assert!(beacon.sent().is_empty());
    assert_eq!(store.call_count(), 0);
}

#[test]
fn test_shared_scheduler_keeps_idle_watch() {
    let store = MemoryStore::new();
    let clock = ManualClock::from_millis(T0_MS);
    let scheduler = DeadlineScheduler::new();
    let mut pipeline = Pipeline::new(PipelineConfig::default(), store)
        .with_clock(clock.clone())
        .with_scheduler(scheduler.clone())
        .with_device_info(DeviceInfo::default());
    let mut monitor = StuckMonitor::new(
        StuckRules::default(),
        Box::new(clock.clone()),
        Box::new(scheduler.clone()),
    );

    pipeline.init_session(user());
    monitor.watch(Some("intro".into()), Some("p1".into()));
    assert_eq!(scheduler.active_count(), 2);

    clock.advance(Duration::seconds(95));
    pipeline.tick();
    assert!(monitor.idle_watch_active());

    let event = monitor.tick().expect("idle rule should fire");
    assert_eq!(event.reason, StuckReason::Idle { idle_ms: 95_000 });
    assert!(pipeline.session_info().flush_timer_active);
}

#[test]
fn test_malformed_event_consumes_no_sequence_number() {
    let mut h = harness();
    h.pipeline.init_session(user());
    log_chat(&mut h.pipeline, 1);

    let mut nested = EventData::new();
    nested.insert("steps".into(), serde_json::json!([1, 2, 3]));
    assert!(h
        .pipeline
        .log_event(EventType::Interaction, Some("stepper"), nested, None)
        .is_none());
    assert!(h.pipeline.log_click(&ClickTarget::default(), f64::NAN, 0.0, None).is_none());

    log_chat(&mut h.pipeline, 2);
    h.pipeline.flush();
    assert_eq!(seqs(&h.store), vec![1, 2]);
}

#[test]
fn test_session_record_retried_before_events() {
    let mut h = harness();
    h.store.set_offline(true);
    h.pipeline.init_session(user());
    assert!(!h.pipeline.session_info().session_persisted);

    log_chat(&mut h.pipeline, 1);
    assert!(!h.pipeline.flush());
    assert!(h.store.events().is_empty());

    h.store.set_offline(false);
    h.clock.advance_millis(5_000);
    assert!(h.pipeline.tick());
    assert_eq!(h.store.sessions().len(), 1);
    assert_eq!(seqs(&h.store), vec![1]);
}

#[test]
fn test_hidden_flushes_and_timer_stops_with_pipeline() {
    let mut h = harness();
    h.pipeline.init_session(user());
    log_chat(&mut h.pipeline, 1);

    h.pipeline.on_lifecycle(lumen_telemetry::LifecycleEvent::Hidden);
    assert_eq!(seqs(&h.store), vec![1]);

    drop(h.pipeline);
    assert_eq!(h.scheduler.active_count(), 0);
    assert_eq!(h.hooks.attached_count(), 0);
}
