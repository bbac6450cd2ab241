//! Schedulable tasks
//!
//! Timers are explicit tasks owned by whoever started them. Each owner polls its
//! own task with [`TaskScheduler::fire`] and the current time (usually from a
//! [`crate::clock::Clock`]); nothing fires behind the caller's back, and polling
//! one task never consumes another owner's.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Handle to a started task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u64);

/// Whether a task fires once or keeps firing at its interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    Every,
}

/// Start/stop interface for timers
pub trait TaskScheduler {
    /// Start a task that first fires `interval` after `now`
    fn start(&mut self, interval: Duration, repeat: Repeat, now: DateTime<Utc>) -> TaskId;

    /// Cancel a task. Returns false if it was not active.
    fn stop(&mut self, id: TaskId) -> bool;

    /// Whether `id` has reached its deadline. A fired repeating task is
    /// re-armed and a fired one-shot task is retired. Other tasks are untouched.
    fn fire(&mut self, id: TaskId, now: DateTime<Utc>) -> bool;

    fn is_active(&self, id: TaskId) -> bool;

    fn active_count(&self) -> usize;
}

#[derive(Debug)]
struct Task {
    interval: Duration,
    next_due: DateTime<Utc>,
    repeat: Repeat,
}

#[derive(Debug, Default)]
struct TaskTable {
    next_id: u64,
    tasks: BTreeMap<TaskId, Task>,
    started_total: u64,
    stopped_total: u64,
}

/// Deadline-table scheduler. Clones share one table, so a test can keep a clone
/// to inspect what the pipeline started and stopped.
#[derive(Debug, Clone, Default)]
pub struct DeadlineScheduler {
    table: Rc<RefCell<TaskTable>>,
}

impl DeadlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks ever started
    pub fn started_total(&self) -> u64 {
        self.table.borrow().started_total
    }

    /// Number of tasks explicitly stopped
    pub fn stopped_total(&self) -> u64 {
        self.table.borrow().stopped_total
    }

    /// Next deadline of an active task
    pub fn next_due(&self, id: TaskId) -> Option<DateTime<Utc>> {
        self.table.borrow().tasks.get(&id).map(|t| t.next_due)
    }
}

impl TaskScheduler for DeadlineScheduler {
    fn start(&mut self, interval: Duration, repeat: Repeat, now: DateTime<Utc>) -> TaskId {
        let mut table = self.table.borrow_mut();
        table.next_id += 1;
        table.started_total += 1;
        let id = TaskId(table.next_id);
        table.tasks.insert(
            id,
            Task {
                interval,
                next_due: now + interval,
                repeat,
            },
        );
        id
    }

    fn stop(&mut self, id: TaskId) -> bool {
        let mut table = self.table.borrow_mut();
        let removed = table.tasks.remove(&id).is_some();
        if removed {
            table.stopped_total += 1;
        }
        removed
    }

    fn fire(&mut self, id: TaskId, now: DateTime<Utc>) -> bool {
        let mut table = self.table.borrow_mut();
        let retire = match table.tasks.get_mut(&id) {
            Some(task) if task.next_due > now => return false,
            Some(task) if task.repeat == Repeat::Every && task.interval > Duration::zero() => {
                // Missed periods collapse into this single firing
                while task.next_due <= now {
                    task.next_due = task.next_due + task.interval;
                }
                false
            }
            Some(_) => true,
            None => return false,
        };
        if retire {
            table.tasks.remove(&id);
        }
        true
    }

    fn is_active(&self, id: TaskId) -> bool {
        self.table.borrow().tasks.contains_key(&id)
    }

    fn active_count(&self) -> usize {
        self.table.borrow().tasks.len()
    }
}
