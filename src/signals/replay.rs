//! Replay recorded UI signals
//!
//! Drives a [`Pipeline`] and a [`StuckMonitor`] from a signal stream on a
//! manual clock that follows the signal timestamps. Timers fire as they would
//! have live: before each signal, due flush and idle-watch tasks are polled.

use crate::clock::{Clock, ManualClock};
use crate::config::PipelineConfig;
use crate::error::TelemetryError;
use crate::pipeline::Pipeline;
use crate::principal::Principal;
use crate::scheduler::DeadlineScheduler;
use crate::signals::ui_signal::{SignalKind, SignalValidationError, UiSignal};
use crate::stuck::{StuckEvent, StuckMonitor};
use crate::transport::EventStore;
use crate::types::{EventType, SessionInfo};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Parsing and validation helpers for signal streams
pub struct SignalAdapter;

impl SignalAdapter {
    /// Parse a JSON string containing an array of UiSignals
    pub fn parse_array(json: &str) -> Result<Vec<UiSignal>, TelemetryError> {
        let signals: Vec<UiSignal> = serde_json::from_str(json)?;
        Ok(signals)
    }

    /// Parse NDJSON (newline-delimited JSON) containing UiSignals
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<UiSignal>, TelemetryError> {
        let mut signals = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<UiSignal>(trimmed) {
                Ok(signal) => signals.push(signal),
                Err(e) => {
                    return Err(TelemetryError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(signals)
    }

    /// Parse either form: a leading `[` means a JSON array
    pub fn parse_auto(input: &str) -> Result<Vec<UiSignal>, TelemetryError> {
        if input.trim_start().starts_with('[') {
            Self::parse_array(input)
        } else {
            Self::parse_ndjson(input)
        }
    }

    /// Validate every signal plus timestamp ordering. Only failures are returned.
    pub fn validate_signals(signals: &[UiSignal]) -> Vec<ValidationResult> {
        let mut previous: Option<DateTime<Utc>> = None;
        let mut failures = Vec::new();

        for (index, signal) in signals.iter().enumerate() {
            let mut error = signal.validate().err();
            if error.is_none() {
                if let Some(prev) = previous {
                    if signal.timestamp < prev {
                        error = Some(SignalValidationError::TimestampRegression {
                            previous: prev,
                            timestamp: signal.timestamp,
                        });
                    }
                }
            }
            previous = Some(previous.map_or(signal.timestamp, |p| p.max(signal.timestamp)));

            if let Some(error) = error {
                failures.push(ValidationResult {
                    index,
                    signal_id: signal.signal_id.clone(),
                    error,
                });
            }
        }
        failures
    }
}

/// A failed signal validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub index: usize,
    pub signal_id: Option<String>,
    pub error: SignalValidationError,
}

/// Outcome of a replay
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub signals: usize,
    pub events_logged: usize,
    /// Signals that produced no event (merged, same bucket, no session)
    pub suppressed: usize,
    pub sessions: Vec<String>,
    pub stuck_events: Vec<StuckEvent>,
    pub final_state: SessionInfo,
}

/// Replays signals through a pipeline and a stuck monitor
pub struct Replayer {
    clock: ManualClock,
    pipeline: Pipeline,
    monitor: StuckMonitor,
    started: bool,
    signals: usize,
    events_logged: usize,
    suppressed: usize,
    sessions: Vec<String>,
    stuck_events: Vec<StuckEvent>,
}

impl Replayer {
    pub fn new(config: PipelineConfig, store: impl EventStore + 'static) -> Self {
        let clock = ManualClock::from_millis(0);
        let rules = config.stuck;
        let pipeline = Pipeline::new(config, store)
            .with_clock(clock.clone())
            .with_scheduler(DeadlineScheduler::new());
        let monitor = StuckMonitor::new(
            rules,
            Box::new(clock.clone()),
            Box::new(DeadlineScheduler::new()),
        );

        Self {
            clock,
            pipeline,
            monitor,
            started: false,
            signals: 0,
            events_logged: 0,
            suppressed: 0,
            sessions: Vec::new(),
            stuck_events: Vec::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Apply one signal. Signals must arrive in timestamp order.
    pub fn apply(&mut self, signal: &UiSignal) -> Result<(), TelemetryError> {
        signal
            .validate()
            .map_err(|e| TelemetryError::ParseError(format!("Invalid signal: {}", e)))?;

        let now = self.clock.now();
        if self.started && signal.timestamp < now {
            return Err(TelemetryError::ParseError(
                SignalValidationError::TimestampRegression {
                    previous: now,
                    timestamp: signal.timestamp,
                }
                .to_string(),
            ));
        }
        self.started = true;
        self.clock.set(signal.timestamp);
        self.signals += 1;

        self.poll_timers();

        let section = signal.section.as_deref();
        let logged = match &signal.signal {
            SignalKind::SessionStart { principal_id } => {
                let principal = principal_id.clone().map(Principal::authenticated);
                let id = self.pipeline.init_session(principal);
                self.sessions.push(id);
                self.monitor.clear();
                false
            }
            SignalKind::SessionEnd => {
                self.monitor.clear();
                self.pipeline.end_session()
            }
            SignalKind::PageView { page, referrer } => {
                let logged = self.pipeline.log_page_view(page, referrer.as_deref()).is_some();
                if self.pipeline.is_active() {
                    self.monitor.watch(Some(page.clone()), None);
                }
                logged
            }
            SignalKind::Click { target, x, y } => {
                self.pipeline.log_click(target, *x, *y, section).is_some()
            }
            SignalKind::Scroll { depth_percent } => {
                self.pipeline.log_scroll(*depth_percent, section).is_some()
            }
            SignalKind::ProblemOpen { problem_id } => {
                if self.pipeline.is_active() {
                    self.monitor
                        .watch(section.map(str::to_string), Some(problem_id.clone()));
                }
                false
            }
            SignalKind::ProblemAttempt {
                problem_id,
                is_correct,
                time_spent_ms,
                hint_used,
                unit_error,
            } => {
                let logged = self
                    .pipeline
                    .log_problem_attempt(problem_id, *is_correct, *time_spent_ms, *hint_used, section)
                    .is_some();
                let stuck = self.monitor.record_answer(*is_correct, *unit_error);
                self.log_stuck(stuck);
                logged
            }
            SignalKind::HintRequest {
                problem_id,
                hint_index,
            } => {
                let logged = self
                    .pipeline
                    .log_hint_request(problem_id, *hint_index, section)
                    .is_some();
                let stuck = self.monitor.record_hint();
                self.log_stuck(stuck);
                logged
            }
            SignalKind::ChatMessage {
                turn_number,
                message_length,
                is_user,
            } => self
                .pipeline
                .log_chat_message(*turn_number, *message_length, *is_user, section)
                .is_some(),
            SignalKind::HighlightCreate {
                text_length,
                has_note,
            } => self
                .pipeline
                .log_highlight_create(*text_length, *has_note, section)
                .is_some(),
            SignalKind::Interaction {
                action,
                target,
                data,
            } => self
                .pipeline
                .log_interaction(action, target.as_deref(), data.clone(), section)
                .is_some(),
            SignalKind::Lifecycle { event } => {
                self.pipeline.on_lifecycle(*event);
                false
            }
            SignalKind::Custom { name, target, data } => self
                .pipeline
                .log_event(
                    EventType::from_name(name),
                    target.as_deref(),
                    data.clone(),
                    section,
                )
                .is_some(),
        };

        if logged {
            self.events_logged += 1;
        } else if produces_event(&signal.signal) {
            debug!(kind = signal.signal.name(), "Signal produced no event");
            self.suppressed += 1;
        }
        Ok(())
    }

    /// Apply every signal, then flush what is left
    pub fn run(mut self, signals: &[UiSignal]) -> Result<ReplayReport, TelemetryError> {
        for signal in signals {
            self.apply(signal)?;
        }
        Ok(self.finish())
    }

    pub fn finish(mut self) -> ReplayReport {
        self.pipeline.flush();
        ReplayReport {
            signals: self.signals,
            events_logged: self.events_logged,
            suppressed: self.suppressed,
            sessions: std::mem::take(&mut self.sessions),
            stuck_events: std::mem::take(&mut self.stuck_events),
            final_state: self.pipeline.session_info(),
        }
    }

    fn poll_timers(&mut self) {
        self.pipeline.tick();
        let stuck = self.monitor.tick();
        self.log_stuck(stuck);
    }

    fn log_stuck(&mut self, stuck: Option<StuckEvent>) {
        let Some(stuck) = stuck else {
            return;
        };
        if self.pipeline.log_stuck_event(&stuck).is_some() {
            self.events_logged += 1;
        }
        self.stuck_events.push(stuck);
    }
}

fn produces_event(kind: &SignalKind) -> bool {
    !matches!(
        kind,
        SignalKind::SessionStart { .. } | SignalKind::ProblemOpen { .. } | SignalKind::Lifecycle { .. }
    )
}
