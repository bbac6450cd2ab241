//! Stateful wrapper around the stuck rules
//!
//! A monitor tracks one problem at a time and owns exactly one idle-watch task
//! for it. Switching problems replaces both the context and the task.

use crate::clock::Clock;
use crate::scheduler::{Repeat, TaskId, TaskScheduler};
use crate::stuck::detector::{
    create_context, detect_stuck_event, update_after_answer, update_after_hint, StuckContext,
    StuckEvent, StuckRules,
};
use tracing::debug;

pub struct StuckMonitor {
    rules: StuckRules,
    clock: Box<dyn Clock>,
    scheduler: Box<dyn TaskScheduler>,
    context: Option<StuckContext>,
    idle_task: Option<TaskId>,
}

impl StuckMonitor {
    pub fn new(
        rules: StuckRules,
        clock: Box<dyn Clock>,
        scheduler: Box<dyn TaskScheduler>,
    ) -> Self {
        Self {
            rules,
            clock,
            scheduler,
            context: None,
            idle_task: None,
        }
    }

    /// Start watching a problem, replacing whatever was watched before
    pub fn watch(&mut self, section_id: Option<String>, problem_id: Option<String>) {
        let now = self.clock.now();
        debug!(
            section = section_id.as_deref().unwrap_or(""),
            problem = problem_id.as_deref().unwrap_or(""),
            "Stuck monitor watching new context"
        );
        self.context = Some(create_context(section_id, problem_id, now));
        self.arm_idle_watch();
    }

    /// Stop watching and cancel the idle task
    pub fn clear(&mut self) {
        self.disarm_idle_watch();
        self.context = None;
    }

    pub fn record_answer(&mut self, is_correct: bool, has_unit_error: bool) -> Option<StuckEvent> {
        let now = self.clock.now();
        let context = self.context.as_ref()?;
        let updated = update_after_answer(context, is_correct, has_unit_error, now);
        self.context = Some(updated);
        self.arm_idle_watch();
        self.evaluate()
    }

    pub fn record_hint(&mut self) -> Option<StuckEvent> {
        let now = self.clock.now();
        let context = self.context.as_ref()?;
        let updated = update_after_hint(context, now);
        self.context = Some(updated);
        self.arm_idle_watch();
        self.evaluate()
    }

    /// Poll the idle task. Returns an idle event when it has fired.
    pub fn tick(&mut self) -> Option<StuckEvent> {
        let now = self.clock.now();
        let idle_task = self.idle_task?;
        if !self.scheduler.fire(idle_task, now) {
            return None;
        }
        self.idle_task = None;
        self.evaluate()
    }

    pub fn context(&self) -> Option<&StuckContext> {
        self.context.as_ref()
    }

    pub fn idle_watch_active(&self) -> bool {
        self.idle_task
            .map(|id| self.scheduler.is_active(id))
            .unwrap_or(false)
    }

    pub fn rules(&self) -> &StuckRules {
        &self.rules
    }

    fn evaluate(&mut self) -> Option<StuckEvent> {
        let now = self.clock.now();
        let context = self.context.as_ref()?;
        let detection = detect_stuck_event(context, &self.rules, now);
        self.context = Some(detection.context);
        if let Some(event) = &detection.event {
            debug!(reason = event.reason.code(), "Stuck event detected");
        }
        detection.event
    }

    fn arm_idle_watch(&mut self) {
        self.disarm_idle_watch();
        let now = self.clock.now();
        self.idle_task = Some(
            self.scheduler
                .start(self.rules.idle_timeout(), Repeat::Once, now),
        );
    }

    fn disarm_idle_watch(&mut self) {
        if let Some(id) = self.idle_task.take() {
            self.scheduler.stop(id);
        }
    }
}

impl Drop for StuckMonitor {
    fn drop(&mut self) {
        self.disarm_idle_watch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::DeadlineScheduler;
    use crate::stuck::StuckReason;

    fn monitor() -> (StuckMonitor, ManualClock, DeadlineScheduler) {
        let clock = ManualClock::from_millis(1_705_327_200_000);
        let scheduler = DeadlineScheduler::new();
        let monitor = StuckMonitor::new(
            StuckRules::default(),
            Box::new(clock.clone()),
            Box::new(scheduler.clone()),
        );
        (monitor, clock, scheduler)
    }

    #[test]
    fn test_inputs_without_context_are_ignored() {
        let (mut monitor, _, scheduler) = monitor();
        assert!(monitor.record_answer(false, false).is_none());
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_switching_problem_replaces_idle_task() {
        let (mut monitor, _, scheduler) = monitor();
        monitor.watch(Some("s1".into()), Some("p1".into()));
        monitor.watch(Some("s1".into()), Some("p2".into()));
        monitor.watch(Some("s2".into()), None);

        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.started_total(), 3);
        assert_eq!(scheduler.stopped_total(), 2);
        assert_eq!(monitor.context().unwrap().section_id.as_deref(), Some("s2"));
    }

    #[test]
    fn test_idle_fires_once_after_timeout() {
        let (mut monitor, clock, _) = monitor();
        monitor.watch(Some("s1".into()), Some("p1".into()));

        clock.advance_millis(89_000);
        assert!(monitor.tick().is_none());

        clock.advance_millis(1_000);
        let event = monitor.tick().expect("idle should fire");
        assert!(matches!(event.reason, StuckReason::Idle { .. }));
        assert!(!monitor.idle_watch_active());

        clock.advance_millis(90_000);
        assert!(monitor.tick().is_none());
    }

    #[test]
    fn test_input_rearms_idle_watch() {
        let (mut monitor, clock, _) = monitor();
        monitor.watch(Some("s1".into()), Some("p1".into()));

        clock.advance_millis(60_000);
        assert!(monitor.record_hint().is_none());
        clock.advance_millis(60_000);
        assert!(monitor.tick().is_none());
        clock.advance_millis(30_000);
        assert!(monitor.tick().is_some());
    }

    #[test]
    fn test_wrong_answers_fire_through_monitor() {
        let (mut monitor, _, _) = monitor();
        monitor.watch(Some("s1".into()), Some("p1".into()));

        assert!(monitor.record_answer(false, false).is_none());
        let event = monitor.record_answer(false, false).unwrap();
        assert_eq!(event.reason, StuckReason::ConsecutiveWrong { count: 2 });
        assert!(monitor.record_answer(false, false).is_none());
    }

    #[test]
    fn test_clear_and_drop_cancel_task() {
        let (mut monitor, _, scheduler) = monitor();
        monitor.watch(Some("s1".into()), None);
        monitor.clear();
        assert_eq!(scheduler.active_count(), 0);

        monitor.watch(Some("s1".into()), None);
        drop(monitor);
        assert_eq!(scheduler.active_count(), 0);
    }
}
