//! References to runtime types.
//!
//! ```text
//! absent    bool false
//! compact   bool true, i32 0x0C0FFEE0, i32 type id
//! legacy    bool true, bool is_full_name, string name
//! ```
//!
//! The reader peeks one `i32` after the presence flag: the sentinel selects the compact
//! form, anything else is the start of a legacy record. The legacy record begins with a
//! bool byte (0 or 1), so it can never start with the sentinel's low byte `0xE0`.

use std::io::{Read, Seek, SeekFrom, Write};

use super::{BinaryReader, BinaryWriter};
use crate::error::Result;
use crate::registry::{TypeHandle, TypeRegistry};
use crate::type_id::TypeId;

/// Marks the compact, id-based type reference form.
pub const TYPE_ID_SENTINEL: i32 = 0x0C0F_FEE0;

impl<W: Write> BinaryWriter<W> {
    /// Local types go out as sentinel + id, foreign types by full name.
    pub fn write_type<T: TypeHandle>(&mut self, registry: &TypeRegistry<T>, ty: Option<&T>) -> Result<()> {
        let Some(ty) = ty else {
            return self.write_bool(false);
        };
        self.write_bool(true)?;
        if ty.is_local() {
            let id = registry.id_of(ty.full_name());
            if registry.resolve(id).is_none() {
                tracing::debug!(name = ty.full_name(), %id, "writing id of unregistered type");
            }
            self.write_i32(TYPE_ID_SENTINEL)?;
            self.write_i32(id.value())
        } else {
            self.write_bool(true)?;
            self.write_string(ty.full_name())
        }
    }

    /// Force the legacy name form, e.g. for files that older readers must still load.
    pub fn write_type_by_name<T: TypeHandle>(&mut self, ty: Option<&T>) -> Result<()> {
        match ty {
            Some(ty) => {
                self.write_bool(true)?;
                self.write_bool(true)?;
                self.write_string(ty.full_name())
            }
            None => self.write_bool(false),
        }
    }
}

impl<R: Read + Seek> BinaryReader<R> {
    /// Decode a type reference in either wire form.
    ///
    /// Unknown ids and names come back as `Ok(None)`; callers drop the record that needed
    /// them. The reader is positioned after the reference in every case.
    pub fn read_type<T: TypeHandle>(&mut self, registry: &TypeRegistry<T>) -> Result<Option<T>> {
        if !self.read_bool()? {
            return Ok(None);
        }
        if self.peek_i32()? == Some(TYPE_ID_SENTINEL) {
            self.read_i32()?;
            let id = TypeId(self.read_i32()?);
            let resolved = registry.resolve(id).cloned();
            if resolved.is_none() {
                tracing::debug!(%id, "unknown type id");
            }
            return Ok(resolved);
        }
        let full = self.read_bool()?;
        let name = self.read_string()?;
        let resolved = registry.resolve_name(&name, full);
        if resolved.is_none() {
            tracing::debug!(%name, full, "unknown type name");
        }
        Ok(resolved)
    }

    /// Look at the next `i32` without consuming it. `None` if fewer than four bytes remain.
    pub fn peek_i32(&mut self) -> Result<Option<i32>> {
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < buf.len() {
            let n = self.inner.read(&mut buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        self.inner.seek(SeekFrom::Current(-(got as i64)))?;
        Ok((got == buf.len()).then(|| i32::from_le_bytes(buf)))
    }
}
