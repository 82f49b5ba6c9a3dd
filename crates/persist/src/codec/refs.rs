//! Entity references and text definitions.
//!
//! Entity references are written as serials and come back unresolved. Resolution is a
//! second pass against the host world once every entity has been loaded, because
//! references point forward as often as backward and graphs can be cyclic.

use std::io::{Read, Write};

use worldsave_common::{Serial, TextDefinition};

use super::{BinaryReader, BinaryWriter};
use crate::error::{PersistError, Result};

const TEXT_ABSENT: i32 = 0;
const TEXT_NUMBER: i32 = 1;
const TEXT_LITERAL: i32 = 2;

/// Host-side lookup used to resolve serials after a load.
pub trait EntityLookup {
    type Entity;

    fn find_entity(&self, serial: Serial) -> Option<Self::Entity>;
}

/// A decoded, not yet resolved, reference to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef(Serial);

impl EntityRef {
    pub const NONE: EntityRef = EntityRef(Serial::NONE);

    pub fn new(serial: Serial) -> Self {
        Self(serial)
    }

    pub fn serial(self) -> Option<Serial> {
        (!self.0.is_none()).then_some(self.0)
    }

    pub fn is_none(self) -> bool {
        self.0.is_none()
    }

    /// Resolve against the loaded world. Dangling references resolve to `None`.
    pub fn resolve<L: EntityLookup>(self, lookup: &L) -> Option<L::Entity> {
        let serial = self.serial()?;
        let found = lookup.find_entity(serial);
        if found.is_none() {
            tracing::debug!(%serial, "dangling entity reference");
        }
        found
    }

    /// Resolve a batch, dropping `NONE` and dangling entries.
    pub fn resolve_all<L: EntityLookup>(refs: &[EntityRef], lookup: &L) -> Vec<L::Entity> {
        refs.iter().filter_map(|r| r.resolve(lookup)).collect()
    }
}

impl From<Option<Serial>> for EntityRef {
    fn from(serial: Option<Serial>) -> Self {
        Self(serial.unwrap_or(Serial::NONE))
    }
}

impl<W: Write> BinaryWriter<W> {
    pub fn write_entity_ref(&mut self, serial: Option<Serial>) -> Result<()> {
        self.write_u32(serial.unwrap_or(Serial::NONE).value())
    }

    pub fn write_entity_refs(&mut self, serials: &[Serial]) -> Result<()> {
        self.write_list(serials, |w, serial| w.write_entity_ref(Some(*serial)))
    }

    pub fn write_text_definition(&mut self, text: &TextDefinition) -> Result<()> {
        match text {
            TextDefinition::Absent => self.write_encoded_int(TEXT_ABSENT),
            TextDefinition::Number(n) => {
                self.write_encoded_int(TEXT_NUMBER)?;
                self.write_encoded_int(*n)
            }
            TextDefinition::Text(s) => {
                self.write_encoded_int(TEXT_LITERAL)?;
                self.write_string(s)
            }
        }
    }
}

impl<R: Read> BinaryReader<R> {
    pub fn read_entity_ref(&mut self) -> Result<EntityRef> {
        Ok(EntityRef(Serial::new(self.read_u32()?)))
    }

    pub fn read_entity_refs(&mut self) -> Result<Vec<EntityRef>> {
        self.read_list(|r| r.read_entity_ref())
    }

    pub fn read_text_definition(&mut self) -> Result<TextDefinition> {
        match self.read_encoded_int()? {
            TEXT_ABSENT => Ok(TextDefinition::Absent),
            TEXT_NUMBER => Ok(TextDefinition::Number(self.read_encoded_int()?)),
            TEXT_LITERAL => Ok(TextDefinition::Text(self.read_string()?)),
            tag => Err(PersistError::invalid(format!("unknown text definition tag {tag}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::reader;
    use std::collections::HashMap;

    struct Lookup(HashMap<Serial, &'static str>);

    impl EntityLookup for Lookup {
        type Entity = &'static str;

        fn find_entity(&self, serial: Serial) -> Option<&'static str> {
            self.0.get(&serial).copied()
        }
    }

    #[test]
    fn entity_refs_resolve_in_second_phase() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_entity_ref(Some(Serial::new(2))).unwrap();
        w.write_entity_ref(None).unwrap();
        w.write_entity_refs(&[Serial::new(1), Serial::new(99), Serial::new(2)]).unwrap();

        let mut r = reader(w.into_inner());
        let owner = r.read_entity_ref().unwrap();
        let nothing = r.read_entity_ref().unwrap();
        let contents = r.read_entity_refs().unwrap();

        // Entities only become known after the whole stream has been read.
        let lookup = Lookup([(Serial::new(1), "chest"), (Serial::new(2), "player")].into());
        assert_eq!(owner.resolve(&lookup), Some("player"));
        assert!(nothing.is_none());
        assert_eq!(nothing.resolve(&lookup), None);
        assert_eq!(EntityRef::resolve_all(&contents, &lookup), vec!["chest", "player"]);
    }

    #[test]
    fn none_ref_is_all_ones() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_entity_ref(None).unwrap();
        assert_eq!(w.into_inner(), vec![0xFF; 4]);
        assert_eq!(EntityRef::from(None), EntityRef::NONE);
    }

    #[test]
    fn text_definition_roundtrip() {
        let values = [
            TextDefinition::Absent,
            TextDefinition::Number(1_041_361),
            TextDefinition::Text("a dusty tome".into()),
        ];
        let mut w = BinaryWriter::new(Vec::new());
        for value in &values {
            w.write_text_definition(value).unwrap();
        }
        let bytes = w.into_inner();
        assert_eq!(bytes[0], 0);

        let mut r = reader(bytes);
        for value in &values {
            assert_eq!(&r.read_text_definition().unwrap(), value);
        }
    }

    #[test]
    fn unknown_text_tag_is_rejected() {
        assert!(reader(vec![7]).read_text_definition().is_err());
    }
}
