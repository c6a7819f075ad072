//! Entity/component store.
//!
//! A generational arena of [`ComponentBundle`]s. Entities refer to each other
//! through [`EntityId`] handles only; a removed slot bumps its generation so a
//! stale handle never resolves to the entity that later reuses the slot.
//!
//! The store has no interior locking. It is mutated by exactly one owner (the
//! server tick loop) and read after the simulation step completes.

use sha2::{Digest, Sha256};

use crate::{math::Vec3, net::ClientId};

/// Generational entity handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub index: u32,
    pub generation: u32,
}

/// Position and orientation (pitch, yaw, roll in degrees).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub origin: Vec3,
    pub angles: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity(pub Vec3);

/// Marks the entity a client drives with its commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controller {
    pub client: ClientId,
}

/// Attachment to another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parent(pub EntityId);

/// Everything the store knows about one entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComponentBundle {
    pub transform: Option<Transform>,
    pub velocity: Option<Velocity>,
    pub controller: Option<Controller>,
    pub parent: Option<Parent>,
}

/// A component type that has a slot in [`ComponentBundle`].
pub trait Component: Sized + 'static {
    fn slot(bundle: &ComponentBundle) -> &Option<Self>;
    fn slot_mut(bundle: &mut ComponentBundle) -> &mut Option<Self>;
}

macro_rules! bundle_component {
    ($ty:ty, $field:ident) => {
        impl Component for $ty {
            fn slot(bundle: &ComponentBundle) -> &Option<Self> {
                &bundle.$field
            }
            fn slot_mut(bundle: &mut ComponentBundle) -> &mut Option<Self> {
                &mut bundle.$field
            }
        }
    };
}

bundle_component!(Transform, transform);
bundle_component!(Velocity, velocity);
bundle_component!(Controller, controller);
bundle_component!(Parent, parent);

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    bundle: Option<ComponentBundle>,
}

/// Entity store.
#[derive(Debug, Clone, Default)]
pub struct World {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entity with an empty bundle.
    pub fn spawn(&mut self) -> EntityId {
        self.spawn_with(ComponentBundle::default())
    }

    /// Creates an entity with the given components.
    pub fn spawn_with(&mut self, bundle: ComponentBundle) -> EntityId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.bundle = Some(bundle);
            return EntityId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            bundle: Some(bundle),
        });
        EntityId {
            index,
            generation: 0,
        }
    }

    /// Removes an entity and returns its components.
    ///
    /// `Parent` links that pointed at the removed entity are cleared.
    pub fn despawn(&mut self, id: EntityId) -> Option<ComponentBundle> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let bundle = slot.bundle.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;

        for other in self.slots.iter_mut().filter_map(|s| s.bundle.as_mut()) {
            if other.parent == Some(Parent(id)) {
                other.parent = None;
            }
        }
        Some(bundle)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.bundle(id).is_some()
    }

    pub fn bundle(&self, id: EntityId) -> Option<&ComponentBundle> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.bundle.as_ref())
    }

    pub fn bundle_mut(&mut self, id: EntityId) -> Option<&mut ComponentBundle> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.bundle.as_mut())
    }

    /// Attaches or replaces a component. Returns the previous value.
    ///
    /// Inserting on a dead handle is a no-op and returns `None`.
    pub fn insert<C: Component>(&mut self, id: EntityId, component: C) -> Option<C> {
        let bundle = self.bundle_mut(id)?;
        C::slot_mut(bundle).replace(component)
    }

    pub fn get<C: Component>(&self, id: EntityId) -> Option<&C> {
        self.bundle(id).and_then(|b| C::slot(b).as_ref())
    }

    pub fn get_mut<C: Component>(&mut self, id: EntityId) -> Option<&mut C> {
        self.bundle_mut(id).and_then(|b| C::slot_mut(b).as_mut())
    }

    pub fn remove_component<C: Component>(&mut self, id: EntityId) -> Option<C> {
        self.bundle_mut(id).and_then(|b| C::slot_mut(b).take())
    }

    /// Lazy iteration in arena order. The iterator is `Clone`, so a consumer
    /// can restart it without touching the store.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.slots.iter().enumerate(),
        }
    }

    /// Mutable iteration in arena order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut ComponentBundle)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.bundle.as_mut().map(|b| {
                (
                    EntityId {
                        index: i as u32,
                        generation,
                    },
                    b,
                )
            })
        })
    }

    /// Entity driven by `client`, if spawned.
    pub fn controlled_by(&self, client: ClientId) -> Option<EntityId> {
        self.iter()
            .find(|(_, b)| b.controller.is_some_and(|c| c.client == client))
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drops every entity. Generations survive so old handles stay dead.
    pub fn clear(&mut self) {
        let ids: Vec<EntityId> = self.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.despawn(id);
        }
    }

    /// SHA-256 over the bit patterns of every live entity, in arena order.
    pub fn state_hash(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        for (id, b) in self.iter() {
            h.update(id.index.to_le_bytes());
            h.update(id.generation.to_le_bytes());
            if let Some(t) = b.transform {
                h.update([1u8]);
                for v in [t.origin, t.angles] {
                    for f in [v.x, v.y, v.z] {
                        h.update(f.to_bits().to_le_bytes());
                    }
                }
            }
            if let Some(Velocity(v)) = b.velocity {
                h.update([2u8]);
                for f in [v.x, v.y, v.z] {
                    h.update(f.to_bits().to_le_bytes());
                }
            }
            if let Some(c) = b.controller {
                h.update([3u8]);
                h.update(c.client.0.to_le_bytes());
            }
            if let Some(Parent(p)) = b.parent {
                h.update([4u8]);
                h.update(p.index.to_le_bytes());
                h.update(p.generation.to_le_bytes());
            }
        }
        h.finalize().into()
    }
}

/// Iterator over live entities, see [`World::iter`].
#[derive(Clone)]
pub struct Iter<'a> {
    inner: std::iter::Enumerate<std::slice::Iter<'a, Slot>>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (EntityId, &'a ComponentBundle);

    fn next(&mut self) -> Option<Self::Item> {
        for (i, slot) in self.inner.by_ref() {
            if let Some(b) = &slot.bundle {
                let id = EntityId {
                    index: i as u32,
                    generation: slot.generation,
                };
                return Some((id, b));
            }
        }
        None
    }
}
