use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable 32-bit identity of a type name on the wire.
///
/// Computed with a fixed rolling hash over the UTF-16 code units of the fully-qualified
/// name, seeded with the unit count. The result never depends on process state, so the
/// same name hashes the same way in every run. Distinct names can collide; the registry
/// reports that when it happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub i32);

impl TypeId {
    pub fn of_name(name: &str) -> Self {
        let len = name.encode_utf16().count() as i32;
        let hash = name
            .encode_utf16()
            .fold(len, |hash, unit| hash.wrapping_mul(397) ^ i32::from(unit));
        Self(hash)
    }

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0 as u32)
    }
}
