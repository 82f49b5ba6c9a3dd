//! Shared value types used by the persistence engine and by host object models.

mod types;

pub use types::{Serial, TextDefinition};
