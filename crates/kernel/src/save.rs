//! World save format.
//!
//! ```text
//! version    i32
//! tick       u64
//! seed       u64
//! entities   block list, one block per entity
//! ```
//!
//! Entity record: kind (type reference), serial, name, title, position, facing (v2+),
//! flags, parent ref, contents refs, tags map. A record whose kind cannot be resolved is
//! dropped with its block; references to it resolve to nothing.

use glam::Vec3;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use worldsave_common::Serial;
use worldsave_persist::codec::BlockReader;
use worldsave_persist::{
    BinaryReader, BinaryWriter, EntityRef, KnownType, PersistConfig, PersistError, Result, SaveStore,
    ScheduleOutcome, TypeRegistry,
};

use crate::entity::{Entity, EntityFlags, EntityKind, Facing};
use crate::world::World;

/// Current world record version. Version 1 records carry no facing.
pub const WORLD_VERSION: i32 = 2;

/// Registry of every kind this crate saves. Unknown full names load as foreign kinds.
pub fn kind_registry(config: &PersistConfig) -> TypeRegistry<EntityKind> {
    let known = EntityKind::BUILTIN.iter().map(|name| {
        let known = KnownType::new(EntityKind::local(name));
        if *name == EntityKind::ITEM {
            known.alias("worldsave_kernel::kinds::Thing")
        } else {
            known
        }
    });
    let mut registry = TypeRegistry::build(config, known);
    registry.set_fallback_resolver(|name, full| full.then(|| EntityKind::foreign(name)));
    registry
}

struct PendingRefs {
    parent: EntityRef,
    contents: Vec<EntityRef>,
}

impl World {
    pub fn save<W: Write>(&self, w: &mut BinaryWriter<W>, registry: &TypeRegistry<EntityKind>) -> Result<()> {
        w.write_version(WORLD_VERSION)?;
        w.write_u64(self.tick)?;
        w.write_u64(self.seed)?;
        w.write_block_list(self.entities.values(), |b, entity| write_entity(b, entity, registry))
    }

    /// Two-phase load: decode every entity, then resolve references against the result.
    pub fn load<R: Read>(r: &mut BinaryReader<R>, registry: &TypeRegistry<EntityKind>) -> Result<World> {
        let version = r.read_version()?;
        if version < 1 {
            return Err(PersistError::invalid(format!("invalid world version {version}")));
        }
        if version > WORLD_VERSION {
            return Err(PersistError::SchemaMismatch {
                file_version: version as u32,
                expected_version: WORLD_VERSION as u32,
            });
        }

        let mut world = World::new();
        world.tick = r.read_u64()?;
        world.seed = r.read_u64()?;

        let records = r.read_block_list(|b| read_entity(b, registry, version))?;
        let mut pending = BTreeMap::new();
        for (entity, refs) in records {
            let serial = entity.serial;
            if world.insert(entity).is_some() {
                tracing::warn!(%serial, "duplicate serial in save, keeping the later record");
            }
            pending.insert(serial, refs);
        }

        let doomed: Vec<Serial> = world
            .entities
            .values()
            .filter(|e| e.flags.contains(EntityFlags::DELETED_ON_LOAD))
            .map(|e| e.serial)
            .collect();
        for serial in &doomed {
            world.entities.remove(serial);
            pending.remove(serial);
        }

        for (serial, refs) in pending {
            let parent = refs.parent.resolve(&world);
            let contents = EntityRef::resolve_all(&refs.contents, &world);
            if let Some(entity) = world.entities.get_mut(&serial) {
                entity.parent = parent;
                entity.contents = contents;
            }
        }

        tracing::info!(
            version,
            entities = world.entity_count(),
            deleted = doomed.len(),
            "world loaded"
        );
        Ok(world)
    }

    /// Snapshot the world and hand the snapshot to the store's save queue.
    pub fn schedule_save(
        &self,
        store: &SaveStore,
        name: &str,
        registry: Arc<TypeRegistry<EntityKind>>,
    ) -> Result<ScheduleOutcome> {
        let snapshot = self.clone();
        store.save(name, move |w| snapshot.save(w, &registry))
    }

    pub fn load_from(store: &SaveStore, name: &str, registry: &TypeRegistry<EntityKind>) -> Result<World> {
        store.load(name, |r| World::load(r, registry))
    }
}

fn write_entity<W: Write>(w: &mut BinaryWriter<W>, entity: &Entity, registry: &TypeRegistry<EntityKind>) -> Result<()> {
    w.write_type(registry, Some(&entity.kind))?;
    w.write_u32(entity.serial.value())?;
    w.write_opt_string(entity.name.as_deref())?;
    w.write_text_definition(&entity.title)?;
    w.write_f32(entity.position.x)?;
    w.write_f32(entity.position.y)?;
    w.write_f32(entity.position.z)?;
    w.write_flag(&entity.facing)?;
    w.write_flag(&entity.flags)?;
    w.write_entity_ref(entity.parent)?;
    w.write_entity_refs(&entity.contents)?;
    w.write_map(&entity.tags, |w, key, value| {
        w.write_string(key)?;
        w.write_i32(*value)
    })
}

fn read_entity(r: &mut BlockReader, registry: &TypeRegistry<EntityKind>, version: i32) -> Result<(Entity, PendingRefs)> {
    let kind = r
        .read_type(registry)?
        .ok_or_else(|| PersistError::invalid("entity of unknown kind"))?;
    let serial = Serial::new(r.read_u32()?);
    if serial.is_none() {
        return Err(PersistError::invalid("entity without a serial"));
    }

    let mut entity = Entity::new(serial, kind);
    entity.name = r.read_opt_string()?;
    entity.title = r.read_text_definition()?;
    entity.position = Vec3::new(r.read_f32()?, r.read_f32()?, r.read_f32()?);
    entity.facing = if version >= 2 {
        r.read_flag()?
    } else {
        Facing::default()
    };
    entity.flags = r.read_flag()?;

    let refs = PendingRefs {
        parent: r.read_entity_ref()?,
        contents: r.read_entity_refs()?,
    };
    entity.tags = r.read_map(true, |r| Ok((r.read_string()?, r.read_i32()?)))?;
    Ok((entity, refs))
}
