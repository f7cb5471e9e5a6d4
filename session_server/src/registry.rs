//! Connection registry.
//!
//! Tracks live connections and the per-connection view: loading flag, player
//! controller, and the set of entities the peer has been told about. Only the
//! session mutates the registry, in response to accept/drop events.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use session_shared::{ecs::EntityId, net::ConnectionId};

/// The player side of a connection: which entity, if any, it embodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerController {
    pawn: Option<EntityId>,
    spawn_pending: bool,
}

impl PlayerController {
    pub fn pawn(&self) -> Option<EntityId> {
        self.pawn
    }

    pub fn is_spawn_pending(&self) -> bool {
        self.spawn_pending
    }

    /// No body and none on the way.
    pub fn needs_body(&self) -> bool {
        self.pawn.is_none() && !self.spawn_pending
    }

    pub(crate) fn mark_spawn_pending(&mut self) {
        self.spawn_pending = true;
    }

    pub(crate) fn clear_spawn_pending(&mut self) {
        self.spawn_pending = false;
    }

    pub(crate) fn bind(&mut self, entity: EntityId) {
        self.pawn = Some(entity);
        self.spawn_pending = false;
    }

    /// Drops the pawn if it is `entity`.
    pub(crate) fn unbind(&mut self, entity: EntityId) -> bool {
        if self.pawn == Some(entity) {
            self.pawn = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Entities a peer currently knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaView {
    known: BTreeSet<EntityId>,
}

impl ReplicaView {
    pub fn knows(&self, entity: EntityId) -> bool {
        self.known.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub(crate) fn insert(&mut self, entity: EntityId) -> bool {
        self.known.insert(entity)
    }

    pub(crate) fn forget(&mut self, entity: EntityId) -> bool {
        self.known.remove(&entity)
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&EntityId) -> bool) {
        self.known.retain(f);
    }

    pub(crate) fn clear(&mut self) {
        self.known.clear();
    }
}

/// Per-connection view state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionView {
    id: ConnectionId,
    loading_level: bool,
    loading_since: Option<Duration>,
    pub(crate) controller: PlayerController,
    pub(crate) replica: ReplicaView,
}

impl ConnectionView {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            loading_level: false,
            loading_since: None,
            controller: PlayerController::default(),
            replica: ReplicaView::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// While true the peer only receives handshake messages.
    pub fn is_loading_level(&self) -> bool {
        self.loading_level
    }

    /// Session time at which the current load started.
    pub fn loading_since(&self) -> Option<Duration> {
        self.loading_since
    }

    pub fn controller(&self) -> &PlayerController {
        &self.controller
    }

    pub fn replica(&self) -> &ReplicaView {
        &self.replica
    }

    pub(crate) fn begin_loading(&mut self, now: Duration) {
        self.loading_level = true;
        self.loading_since = Some(now);
    }

    pub(crate) fn finish_loading(&mut self) {
        self.loading_level = false;
        self.loading_since = None;
    }
}

/// All live connections, iterated in id order.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    views: BTreeMap<ConnectionId, ConnectionView>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the connection was already present.
    pub fn add(&mut self, id: ConnectionId) -> bool {
        if self.views.contains_key(&id) {
            return false;
        }
        self.views.insert(id, ConnectionView::new(id));
        true
    }

    /// Removing an unknown connection is a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionView> {
        self.views.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionView> {
        self.views.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionView> {
        self.views.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.views.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.views.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionView> {
        self.views.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionView> {
        self.views.values_mut()
    }

    /// True when no live connection is still loading.
    pub fn all_loaded(&self) -> bool {
        self.views.values().all(|v| !v.loading_level)
    }

    pub fn loading_count(&self) -> usize {
        self.views.values().filter(|v| v.loading_level).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_get() {
        let mut reg = ConnectionRegistry::new();
        let a = ConnectionId(1);
        assert!(reg.add(a));
        assert!(!reg.add(a));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(a).is_some());

        assert!(reg.remove(a).is_some());
        assert!(reg.remove(a).is_none());
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn removal_drops_replica_view() {
        let mut reg = ConnectionRegistry::new();
        let a = ConnectionId(1);
        reg.add(a);
        reg.get_mut(a).unwrap().replica.insert(EntityId(9));
        reg.remove(a);
        reg.add(a);
        assert!(reg.get(a).unwrap().replica().is_empty());
    }

    #[test]
    fn controller_lifecycle() {
        let mut c = PlayerController::default();
        assert!(c.needs_body());
        c.mark_spawn_pending();
        assert!(!c.needs_body());
        c.bind(EntityId(3));
        assert_eq!(c.pawn(), Some(EntityId(3)));
        assert!(!c.is_spawn_pending());
        assert!(!c.unbind(EntityId(4)));
        assert!(c.unbind(EntityId(3)));
        assert!(c.needs_body());
    }

    #[test]
    fn all_loaded_tracks_live_views() {
        let mut reg = ConnectionRegistry::new();
        for id in 1..=2 {
            reg.add(ConnectionId(id));
            reg.get_mut(ConnectionId(id))
                .unwrap()
                .begin_loading(Duration::ZERO);
        }
        assert!(!reg.all_loaded());
        reg.get_mut(ConnectionId(1)).unwrap().finish_loading();
        assert_eq!(reg.loading_count(), 1);
        reg.remove(ConnectionId(2));
        assert!(reg.all_loaded());
    }
}
