use std::time::{Duration, Instant};

use ahash::HashMap;

use crate::{group::ConnectionId, id::NodeId, scheduler::EventHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPointState {
    /// Waiting for arrivals, a timeout event is armed.
    Open,
    /// Every member arrived, a resolution event is armed.
    Resolving,
}

/// A named rendezvous within a group.
///
/// Each sync point has a generation that is unique within the server so that
/// events scheduled for a sync point that has already been resolved cannot
/// affect a newer one with the same name.
#[derive(Debug)]
pub(crate) struct SyncPoint {
    id: NodeId,
    generation: u64,
    arrived: HashMap<ConnectionId, NodeId>,
    deadline: Instant,
    event: EventHandle,
    state: SyncPointState,
}

impl SyncPoint {
    pub fn new(id: NodeId, generation: u64, deadline: Instant, timeout: EventHandle) -> Self {
        Self {
            id,
            generation,
            arrived: HashMap::default(),
            deadline,
            event: timeout,
            state: SyncPointState::Open,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The currently armed timeout or resolution event.
    pub fn event(&self) -> EventHandle {
        self.event
    }

    pub fn is_resolving(&self) -> bool {
        self.state == SyncPointState::Resolving
    }

    pub fn has_arrived(&self, connection: ConnectionId) -> bool {
        self.arrived.contains_key(&connection)
    }

    /// Records an arrival. Returns false if the connection had already arrived.
    pub fn arrive(&mut self, connection: ConnectionId, member: &NodeId) -> bool {
        debug_assert!(!self.is_resolving());
        self.arrived.insert(connection, member.clone()).is_none()
    }

    /// Removes a departed member. Returns false if it had not arrived.
    pub fn depart(&mut self, connection: ConnectionId) -> bool {
        self.arrived.remove(&connection).is_some()
    }

    /// Whether the arrivals correspond exactly to `members`.
    pub fn is_complete(&self, members: &HashMap<ConnectionId, NodeId>) -> bool {
        // Arrivals are always a subset of the members.
        debug_assert!(self.arrived.keys().all(|c| members.contains_key(c)));
        self.arrived.len() == members.len()
    }

    /// Marks the sync point as resolving with `resolution` being the armed
    /// resolution event.
    pub fn begin_resolving(&mut self, resolution: EventHandle) {
        self.state = SyncPointState::Resolving;
        self.event = resolution;
    }

    pub fn time_left(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn arrived_connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.arrived.keys().copied()
    }

    /// Ids of the arrived members, sorted.
    pub fn arrived_members(&self) -> Vec<NodeId> {
        let mut members = self.arrived.values().cloned().collect::<Vec<_>>();
        members.sort();
        members
    }
}
