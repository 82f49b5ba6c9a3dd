use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-bit serial identifying a live entity in the host world.
///
/// Serials stand in for pointers on disk. `Serial::NONE` (`0xFFFF_FFFF`) is reserved for
/// "no entity" and is never handed out by a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Serial(pub u32);

impl Serial {
    pub const NONE: Serial = Serial(u32::MAX);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Display text that is either a numeric localization id or a literal string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextDefinition {
    #[default]
    Absent,
    Number(i32),
    Text(String),
}

impl TextDefinition {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Collapses degenerate values: a zero number or an empty string carries no text.
    pub fn normalized(self) -> Self {
        match self {
            Self::Number(0) => Self::Absent,
            Self::Text(s) if s.is_empty() => Self::Absent,
            other => other,
        }
    }
}

impl From<i32> for TextDefinition {
    fn from(number: i32) -> Self {
        Self::Number(number).normalized()
    }
}

impl From<&str> for TextDefinition {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned()).normalized()
    }
}

impl fmt::Display for TextDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => Ok(()),
            Self::Number(n) => write!(f, "#{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_serial_is_reserved() {
        assert!(Serial::NONE.is_none());
        assert!(!Serial::new(1).is_none());
        assert_eq!(Serial::new(0x40).to_string(), "0x00000040");
    }

    #[test]
    fn text_definition_normalizes_empty_values() {
        assert_eq!(TextDefinition::from(0), TextDefinition::Absent);
        assert_eq!(TextDefinition::from(""), TextDefinition::Absent);
        assert_eq!(TextDefinition::from(1_020_000), TextDefinition::Number(1_020_000));
        assert_eq!(TextDefinition::from("a lantern").to_string(), "a lantern");
    }
}
