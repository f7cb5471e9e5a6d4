//! Entity/component storage (minimal ECS).
//!
//! Deliberately small: typed component storages keyed by entity id. Entity
//! ids are allocated by whoever instantiates the entity (the entity factory on
//! the server, the network on the client), so the world only tracks which ids
//! are alive. Storages are ordered by id to keep snapshot iteration stable.

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, BTreeSet, HashMap},
};

use serde::{Deserialize, Serialize};

/// Opaque entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

trait Storage: Send + Sync {
    fn remove(&mut self, entity: EntityId);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: 'static + Send + Sync> Storage for BTreeMap<EntityId, T> {
    fn remove(&mut self, entity: EntityId) {
        BTreeMap::remove(self, &entity);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Simple world that can store typed components.
#[derive(Default)]
pub struct World {
    alive: BTreeSet<EntityId>,
    storages: HashMap<TypeId, Box<dyn Storage>>,
}

impl World {
    /// Registers an externally allocated entity id. Returns false if it was
    /// already alive.
    pub fn register(&mut self, entity: EntityId) -> bool {
        self.alive.insert(entity)
    }

    /// Removes an entity and all of its components.
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        if !self.alive.remove(&entity) {
            return false;
        }
        for storage in self.storages.values_mut() {
            storage.remove(entity);
        }
        true
    }

    /// Drops every entity.
    pub fn clear(&mut self) {
        self.alive.clear();
        self.storages.clear();
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.alive.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Alive entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.alive.iter().copied()
    }

    /// Inserts/replaces a component. Ignored for entities that are not alive.
    pub fn insert<T: 'static + Send + Sync>(&mut self, entity: EntityId, component: T) {
        if !self.alive.contains(&entity) {
            return;
        }
        if let Some(storage) = self.storage_mut::<T>(true) {
            storage.insert(entity, component);
        }
    }

    /// Gets a component reference.
    pub fn get<T: 'static + Send + Sync>(&self, entity: EntityId) -> Option<&T> {
        self.storage::<T>().and_then(|storage| storage.get(&entity))
    }

    /// Gets a mutable component reference.
    pub fn get_mut<T: 'static + Send + Sync>(&mut self, entity: EntityId) -> Option<&mut T> {
        self.storage_mut::<T>(false)
            .and_then(|storage| storage.get_mut(&entity))
    }

    /// Iterates entities with a given component, in id order.
    pub fn iter<T: 'static + Send + Sync>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.storage::<T>()
            .into_iter()
            .flat_map(|storage| storage.iter().map(|(k, v)| (*k, v)))
    }

    fn storage<T: 'static + Send + Sync>(&self) -> Option<&BTreeMap<EntityId, T>> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<BTreeMap<EntityId, T>>())
    }

    fn storage_mut<T: 'static + Send + Sync>(
        &mut self,
        create: bool,
    ) -> Option<&mut BTreeMap<EntityId, T>> {
        let key = TypeId::of::<T>();
        if create {
            self.storages
                .entry(key)
                .or_insert_with(|| Box::new(BTreeMap::<EntityId, T>::new()));
        }
        self.storages
            .get_mut(&key)
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<BTreeMap<EntityId, T>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Pose;

    #[test]
    fn despawn_removes_all_components() {
        let mut world = World::default();
        let e = EntityId(7);
        world.register(e);
        world.insert(e, Pose::ORIGIN);
        world.insert(e, 42u8);
        assert_eq!(world.get::<u8>(e), Some(&42));

        assert!(world.despawn(e));
        assert!(world.get::<Pose>(e).is_none());
        assert!(world.get::<u8>(e).is_none());
        assert!(!world.despawn(e));
    }

    #[test]
    fn insert_on_unknown_entity_is_ignored() {
        let mut world = World::default();
        world.insert(EntityId(1), 5u8);
        assert_eq!(world.iter::<u8>().count(), 0);
    }

    #[test]
    fn iteration_is_id_ordered() {
        let mut world = World::default();
        for id in [5, 1, 3] {
            world.register(EntityId(id));
            world.insert(EntityId(id), id as u32);
        }
        let ids: Vec<u64> = world.iter::<u32>().map(|(e, _)| e.0).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
