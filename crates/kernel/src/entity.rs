use glam::Vec3;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use worldsave_common::{Serial, TextDefinition};
use worldsave_persist::TypeHandle;

/// Runtime type of an entity. Kinds are what the save format's type references name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EntityKind {
    name: Arc<str>,
    local: bool,
}

impl EntityKind {
    pub const ITEM: &'static str = "worldsave_kernel::kinds::Item";
    pub const MOBILE: &'static str = "worldsave_kernel::kinds::Mobile";
    pub const CONTAINER: &'static str = "worldsave_kernel::kinds::Container";
    pub const SPAWNER: &'static str = "worldsave_kernel::kinds::Spawner";

    /// Kinds defined by this crate.
    pub const BUILTIN: [&'static str; 4] = [Self::ITEM, Self::MOBILE, Self::CONTAINER, Self::SPAWNER];

    pub fn local(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            local: true,
        }
    }

    /// A kind owned by something outside this crate (a plugin, a script). Saved by name.
    pub fn foreign(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            local: false,
        }
    }

    pub fn item() -> Self {
        Self::local(Self::ITEM)
    }

    pub fn mobile() -> Self {
        Self::local(Self::MOBILE)
    }

    pub fn container() -> Self {
        Self::local(Self::CONTAINER)
    }

    pub fn spawner() -> Self {
        Self::local(Self::SPAWNER)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TypeHandle for EntityKind {
    fn full_name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        self.local
    }
}

impl fmt::Debug for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local {
            write!(f, "{}", self.name)
        } else {
            write!(f, "foreign:{}", self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Facing {
    #[default]
    North,
    East,
    South,
    West,
}

worldsave_persist::impl_persist_enum!(Facing, u8, [North, East, South, West]);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntityFlags: u16 {
        const VISIBLE = 1 << 0;
        const MOVABLE = 1 << 1;
        const LOCKED = 1 << 2;
        const FROZEN = 1 << 3;
        const DELETED_ON_LOAD = 1 << 4;
    }
}

worldsave_persist::impl_persist_flags!(EntityFlags, u16);

/// Per-entity data stored in the world.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub serial: Serial,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub title: TextDefinition,
    pub position: Vec3,
    pub facing: Facing,
    pub flags: EntityFlags,
    pub parent: Option<Serial>,
    pub contents: Vec<Serial>,
    pub tags: BTreeMap<String, i32>,
}

impl Entity {
    pub fn new(serial: Serial, kind: EntityKind) -> Self {
        Self {
            serial,
            kind,
            name: None,
            title: TextDefinition::Absent,
            position: Vec3::ZERO,
            facing: Facing::default(),
            flags: EntityFlags::VISIBLE,
            parent: None,
            contents: Vec::new(),
            tags: BTreeMap::new(),
        }
    }
}
