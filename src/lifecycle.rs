//! Host lifecycle hooks
//!
//! The pipeline registers for lifecycle notifications while a session is open
//! and removes its registration on teardown. The host forwards the events it
//! observes to [`crate::pipeline::Pipeline::on_lifecycle`].

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Host went to the background
    Hidden,
    Visible,
    /// Host is about to go away
    Unload,
}

/// Registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

pub trait LifecycleSignals {
    fn attach(&mut self) -> HookId;

    /// Returns false if the hook was not attached
    fn detach(&mut self, id: HookId) -> bool;
}

#[derive(Debug, Default)]
struct Hooks {
    next_id: u64,
    attached: BTreeSet<HookId>,
}

/// In-memory registry. Clones share the registrations.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    hooks: Rc<RefCell<Hooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attached_count(&self) -> usize {
        self.hooks.borrow().attached.len()
    }

    pub fn is_attached(&self, id: HookId) -> bool {
        self.hooks.borrow().attached.contains(&id)
    }
}

impl LifecycleSignals for HookRegistry {
    fn attach(&mut self) -> HookId {
        let mut hooks = self.hooks.borrow_mut();
        hooks.next_id += 1;
        let id = HookId(hooks.next_id);
        hooks.attached.insert(id);
        id
    }

    fn detach(&mut self, id: HookId) -> bool {
        self.hooks.borrow_mut().attached.remove(&id)
    }
}
