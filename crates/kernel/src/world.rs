use glam::Vec3;
use std::collections::BTreeMap;
use worldsave_common::Serial;
use worldsave_persist::EntityLookup;

use crate::entity::{Entity, EntityFlags, EntityKind, Facing};

/// The authoritative world state.
///
/// Uses BTreeMap for deterministic iteration order: two worlds with the same entities
/// always save to the same bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct World {
    pub(crate) entities: BTreeMap<Serial, Entity>,
    pub(crate) tick: u64,
    /// Seed for deterministic RNG. Advanced each step.
    pub(crate) seed: u64,
    pub(crate) next_serial: u32,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> &BTreeMap<Serial, Entity> {
        &self.entities
    }

    /// Spawn a new entity of `kind` at `position`. Returns its serial.
    pub fn spawn(&mut self, kind: EntityKind, position: Vec3) -> Serial {
        let serial = self.allocate_serial();
        let mut entity = Entity::new(serial, kind);
        entity.position = position;
        self.entities.insert(serial, entity);
        serial
    }

    /// Insert an entity under its own serial, replacing any previous holder.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        let serial = entity.serial;
        self.next_serial = self.next_serial.max(serial.value().saturating_add(1));
        self.entities.insert(serial, entity)
    }

    /// Remove an entity and detach it from its parent. Children keep a dangling parent
    /// serial until the next load drops it.
    pub fn despawn(&mut self, serial: Serial) -> Option<Entity> {
        let entity = self.entities.remove(&serial)?;
        if let Some(parent) = entity.parent.and_then(|p| self.entities.get_mut(&p)) {
            parent.contents.retain(|s| *s != serial);
        }
        Some(entity)
    }

    pub fn get(&self, serial: Serial) -> Option<&Entity> {
        self.entities.get(&serial)
    }

    pub fn get_mut(&mut self, serial: Serial) -> Option<&mut Entity> {
        self.entities.get_mut(&serial)
    }

    /// Move `child` into `parent`'s contents. Returns false if either is missing.
    pub fn set_parent(&mut self, child: Serial, parent: Serial) -> bool {
        if child == parent || !self.entities.contains_key(&parent) {
            return false;
        }
        let Some(entity) = self.entities.get_mut(&child) else {
            return false;
        };
        let previous = entity.parent.replace(parent);
        if previous == Some(parent) {
            return true;
        }
        if let Some(old) = previous.and_then(|p| self.entities.get_mut(&p)) {
            old.contents.retain(|s| *s != child);
        }
        if let Some(new) = self.entities.get_mut(&parent) {
            new.contents.push(child);
        }
        true
    }

    /// Advance the simulation by one tick.
    pub fn step(&mut self) {
        self.tick += 1;
        self.seed = splitmix64(self.seed);
    }

    /// Build a deterministic sample world: a few containers with items inside, mobiles
    /// scattered around, and one spawner referencing every mobile.
    pub fn sample(seed: u64, entities: usize) -> Self {
        let mut world = Self::with_seed(seed);
        let mut rng = seed;
        let mut next = || {
            rng = splitmix64(rng);
            rng
        };

        let spawner = world.spawn(EntityKind::spawner(), Vec3::ZERO);
        let mut containers = Vec::new();
        for i in 1..entities {
            let roll = next();
            let position = Vec3::new((roll % 512) as f32, ((roll >> 16) % 512) as f32, ((roll >> 32) % 16) as f32);
            let kind = match roll % 4 {
                0 => EntityKind::container(),
                1 => EntityKind::mobile(),
                _ => EntityKind::item(),
            };
            let is_container = kind == EntityKind::container();
            let is_mobile = kind == EntityKind::mobile();
            let serial = world.spawn(kind, position);

            if let Some(entity) = world.get_mut(serial) {
                entity.name = Some(format!("entity-{i}"));
                entity.title = if i % 2 == 0 {
                    (1_000 + i as i32).into()
                } else {
                    format!("Thing {i}").as_str().into()
                };
                entity.facing = match (roll >> 8) % 4 {
                    0 => Facing::North,
                    1 => Facing::East,
                    2 => Facing::South,
                    _ => Facing::West,
                };
                if is_mobile {
                    entity.flags |= EntityFlags::MOVABLE;
                }
                entity.tags.insert("level".to_string(), (roll % 100) as i32);
            }

            if is_container {
                containers.push(serial);
            } else if is_mobile {
                world.set_parent(serial, spawner);
            } else if !containers.is_empty() {
                let container = containers[(roll as usize >> 4) % containers.len()];
                world.set_parent(serial, container);
            }
        }
        world
    }

    /// Deterministic hash of the world state for comparison.
    pub fn state_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325; // FNV offset basis
        let mix = |h: &mut u64, bytes: &[u8]| {
            for &b in bytes {
                *h ^= b as u64;
                *h = h.wrapping_mul(0x0100_0000_01b3);
            }
        };
        mix(&mut h, &self.tick.to_le_bytes());
        mix(&mut h, &self.seed.to_le_bytes());
        for (serial, entity) in &self.entities {
            mix(&mut h, &serial.value().to_le_bytes());
            mix(&mut h, entity.kind.name().as_bytes());
            mix(&mut h, entity.name.as_deref().unwrap_or("").as_bytes());
            mix(&mut h, &entity.position.x.to_le_bytes());
            mix(&mut h, &entity.position.y.to_le_bytes());
            mix(&mut h, &entity.position.z.to_le_bytes());
            mix(&mut h, &[entity.facing as u8]);
            mix(&mut h, &entity.flags.bits().to_le_bytes());
            mix(&mut h, &entity.parent.unwrap_or(Serial::NONE).value().to_le_bytes());
            for child in &entity.contents {
                mix(&mut h, &child.value().to_le_bytes());
            }
            for (key, value) in &entity.tags {
                mix(&mut h, key.as_bytes());
                mix(&mut h, &value.to_le_bytes());
            }
        }
        h
    }

    /// First free serial at or after `next_serial`. Wraps back to 1 instead of reaching
    /// `Serial::NONE`.
    fn allocate_serial(&mut self) -> Serial {
        let mut candidate = self.next_serial;
        loop {
            if candidate == 0 || candidate >= Serial::NONE.value() {
                candidate = 1;
            }
            if !self.entities.contains_key(&Serial::new(candidate)) {
                break;
            }
            candidate += 1;
        }
        self.next_serial = candidate + 1;
        Serial::new(candidate)
    }
}

/// Lookups resolve to the serial itself: references stay serials in memory and only
/// need proof that the target survived the load.
impl EntityLookup for World {
    type Entity = Serial;

    fn find_entity(&self, serial: Serial) -> Option<Serial> {
        self.entities.contains_key(&serial).then_some(serial)
    }
}

/// Splitmix64 step, used to advance the world seed reproducibly.
fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_starts_empty() {
        let w = World::new();
        assert_eq!(w.tick(), 0);
        assert_eq!(w.entity_count(), 0);
    }

    #[test]
    fn spawn_and_despawn() {
        let mut w = World::new();
        let serial = w.spawn(EntityKind::item(), Vec3::ONE);
        assert_eq!(serial, Serial::new(1));
        assert!(w.get(serial).is_some());

        assert!(w.despawn(serial).is_some());
        assert_eq!(w.entity_count(), 0);
    }

    #[test]
    fn serials_skip_inserted_entities() {
        let mut w = World::new();
        w.insert(Entity::new(Serial::new(5), EntityKind::item()));
        assert_eq!(w.spawn(EntityKind::item(), Vec3::ZERO), Serial::new(6));
    }

    #[test]
    fn serials_wrap_before_none() {
        let mut w = World::new();
        w.insert(Entity::new(Serial::new(u32::MAX - 1), EntityKind::item()));
        w.insert(Entity::new(Serial::new(1), EntityKind::item()));

        let first = w.spawn(EntityKind::item(), Vec3::ZERO);
        let second = w.spawn(EntityKind::item(), Vec3::ZERO);
        assert_eq!(first, Serial::new(2));
        assert_eq!(second, Serial::new(3));
        assert!(w.entities().keys().all(|s| !s.is_none()));
    }

    #[test]
    fn set_parent_moves_between_containers() {
        let mut w = World::new();
        let a = w.spawn(EntityKind::container(), Vec3::ZERO);
        let b = w.spawn(EntityKind::container(), Vec3::ZERO);
        let item = w.spawn(EntityKind::item(), Vec3::ZERO);

        assert!(w.set_parent(item, a));
        assert!(w.set_parent(item, b));
        assert!(w.get(a).unwrap().contents.is_empty());
        assert_eq!(w.get(b).unwrap().contents, vec![item]);
        assert_eq!(w.get(item).unwrap().parent, Some(b));
        assert!(!w.set_parent(item, item));
    }

    #[test]
    fn despawn_detaches_from_parent() {
        let mut w = World::new();
        let bag = w.spawn(EntityKind::container(), Vec3::ZERO);
        let item = w.spawn(EntityKind::item(), Vec3::ZERO);
        w.set_parent(item, bag);
        w.despawn(item);
        assert!(w.get(bag).unwrap().contents.is_empty());
    }

    #[test]
    fn deterministic_steps() {
        let mut w1 = World::with_seed(42);
        let mut w2 = World::with_seed(42);
        for _ in 0..100 {
            w1.step();
            w2.step();
        }
        assert_eq!(w1.seed(), w2.seed());
        assert_eq!(w1.state_hash(), w2.state_hash());
    }

    #[test]
    fn sample_is_deterministic() {
        let a = World::sample(7, 50);
        let b = World::sample(7, 50);
        assert_eq!(a.entity_count(), 50);
        assert_eq!(a, b);
        assert_ne!(a.state_hash(), World::sample(8, 50).state_hash());
    }

    #[test]
    fn lookup_only_finds_live_entities() {
        let mut w = World::new();
        let serial = w.spawn(EntityKind::item(), Vec3::ZERO);
        assert_eq!(w.find_entity(serial), Some(serial));
        assert_eq!(w.find_entity(Serial::new(99)), None);
    }
}
