//! Delivery queue
//!
//! Append at the tail, drain whole at flush time. A drained snapshot is held as
//! the single in-flight batch until the transport answers; on failure it goes
//! back to the front, ahead of anything logged meanwhile.

use crate::types::Event;
use serde::Serialize;
use std::collections::VecDeque;

/// Identifier of a drained batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BatchId(u64);

/// Ordered snapshot of events handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBatch {
    id: BatchId,
    session_id: String,
    events: Vec<Event>,
}

impl QueueBatch {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Live queue plus the in-flight marker for one session
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    live: VecDeque<Event>,
    in_flight: Option<(BatchId, usize)>,
    next_batch: u64,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.live.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn in_flight(&self) -> Option<BatchId> {
        self.in_flight.map(|(id, _)| id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.map(|(_, len)| len).unwrap_or(0)
    }

    /// Swap the live queue for an empty one and hand out the old contents.
    ///
    /// Returns `None` when there is nothing to send or a batch is already in
    /// flight.
    pub fn drain(&mut self, session_id: &str) -> Option<QueueBatch> {
        if self.live.is_empty() || self.in_flight.is_some() {
            return None;
        }

        let events: Vec<Event> = std::mem::take(&mut self.live).into();
        self.next_batch += 1;
        let id = BatchId(self.next_batch);
        self.in_flight = Some((id, events.len()));

        Some(QueueBatch {
            id,
            session_id: session_id.to_string(),
            events,
        })
    }

    /// Transport succeeded: the batch is done
    pub fn acknowledge(&mut self, id: BatchId) -> bool {
        match self.in_flight {
            Some((current, _)) if current == id => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Transport failed: put the batch back in front of newer events
    pub fn restore(&mut self, batch: QueueBatch) {
        if self.in_flight.map(|(id, _)| id) == Some(batch.id) {
            self.in_flight = None;
        }
        for event in batch.events.into_iter().rev() {
            self.live.push_front(event);
        }
    }

    /// Copy of everything not yet handed out
    pub fn pending(&self) -> Vec<Event> {
        self.live.iter().cloned().collect()
    }

    /// Remove everything from the live queue
    pub fn take_all(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.live).into()
    }

    /// Stamp a principal onto queued events that were logged without one
    pub fn attribute(&mut self, principal_id: &str) -> usize {
        let mut stamped = 0;
        for event in self.live.iter_mut().filter(|e| e.principal_id.is_none()) {
            event.principal_id = Some(principal_id.to_string());
            stamped += 1;
        }
        stamped
    }
}
