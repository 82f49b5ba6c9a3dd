//! World Kernel: a reference world of serial-keyed entities wired to the persistence engine.
//!
//! # Invariants
//! - Entity iteration order is the serial order, so saves are byte-for-byte deterministic.
//! - Every entity kind is registered before the first save or load.
//! - References between entities are resolved only after every entity has been loaded.

pub mod entity;
pub mod save;
pub mod world;

pub use entity::{Entity, EntityFlags, EntityKind, Facing};
pub use save::{WORLD_VERSION, kind_registry};
pub use world::World;
