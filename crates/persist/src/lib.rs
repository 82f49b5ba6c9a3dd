//! Persistence: versioned block-framed binary codec, type registry, background save queue.
//!
//! # Invariants
//! - Every value round-trips: what a writer emits, the matching reader consumes exactly.
//! - A block can always be skipped by its length prefix, whatever its payload.
//! - A record that fails to decode inside a block is dropped; the stream stays aligned.
//! - `TypeId` is a pure function of the type's full name.
//! - Once `wait_for_drain` returns, no scheduled write is still running.
//! - Saves reach disk via temp file, fsync and rename; the manifest hash is checked on load.

pub mod codec;
pub mod config;
pub mod error;
pub mod queue;
pub mod registry;
pub mod store;
pub mod type_id;

pub use codec::{BinaryReader, BinaryWriter, EntityLookup, EntityRef, FlagWidth, PersistFlag};
pub use config::PersistConfig;
pub use error::{PersistError, Result};
pub use queue::{PersistenceQueue, ProcessState, ScheduleOutcome, WriteTarget};
pub use registry::{KnownType, TypeHandle, TypeRegistry};
pub use store::SaveStore;
pub use type_id::TypeId;

pub fn crate_info() -> &'static str {
    "worldsave-persist v0.1.0"
}
