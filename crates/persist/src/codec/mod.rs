//! Record-level binary codec.
//!
//! All integers are little-endian. Higher-level encodings (blocks, containers, type
//! references, flags, entity references) are added to [`BinaryWriter`] and
//! [`BinaryReader`] by the submodules.
//!
//! ```text
//! bool            1 byte, 0 or 1
//! encoded int     7 bits per byte, high bit = continuation
//! string          encoded int byte count, UTF-8 bytes
//! block           i64 (payload + 8), payload
//! ```

mod block;
mod containers;
mod flag;
mod refs;
mod type_ref;

pub use block::{BlockReader, BlockWriter, BLOCK_HEADER_LEN};
pub use flag::{FlagRepr, FlagWidth, PersistFlag, UNSUPPORTED_WIDTH_TAG};
pub use refs::{EntityLookup, EntityRef};
pub use type_ref::TYPE_ID_SENTINEL;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::config::DEFAULT_BLOCK_CHUNK_SIZE;
use crate::error::{PersistError, Result};

/// Writes engine records to any [`Write`] sink.
#[derive(Debug)]
pub struct BinaryWriter<W> {
    inner: W,
    chunk_size: usize,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_chunk_size(inner, DEFAULT_BLOCK_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: W, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Record format version; readers branch on it.
    pub fn write_version(&mut self, version: i32) -> Result<()> {
        self.write_i32(version)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.inner.write_u8(u8::from(value))?;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.inner.write_u8(value)?;
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.inner.write_i8(value)?;
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.inner.write_i16::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.inner.write_u16::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_i32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.inner.write_u32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.inner.write_i64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.inner.write_u64::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.inner.write_f32::<LittleEndian>(value)?;
        Ok(())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.inner.write_f64::<LittleEndian>(value)?;
        Ok(())
    }

    /// 7-bit variable-length integer. Negative values always take five bytes.
    pub fn write_encoded_int(&mut self, value: i32) -> Result<()> {
        let mut v = value as u32;
        while v >= 0x80 {
            self.inner.write_u8((v as u8) | 0x80)?;
            v >>= 7;
        }
        self.inner.write_u8(v as u8)?;
        Ok(())
    }

    /// Raw byte run with no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let len = i32::try_from(value.len())
            .map_err(|_| PersistError::invalid(format!("string too long: {} bytes", value.len())))?;
        self.write_encoded_int(len)?;
        self.write_bytes(value.as_bytes())
    }

    /// Presence-prefixed string.
    pub fn write_opt_string(&mut self, value: Option<&str>) -> Result<()> {
        match value {
            Some(s) => {
                self.write_bool(true)?;
                self.write_string(s)
            }
            None => self.write_bool(false),
        }
    }

    pub(crate) fn write_count(&mut self, count: usize) -> Result<()> {
        let count = i32::try_from(count)
            .map_err(|_| PersistError::invalid(format!("collection too large: {count}")))?;
        self.write_i32(count)
    }
}

/// Reads engine records from any [`Read`] source.
///
/// Type-reference decoding additionally needs [`std::io::Seek`] to peek.
#[derive(Debug)]
pub struct BinaryReader<R> {
    inner: R,
    chunk_size: usize,
}

impl<R: Read> BinaryReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_BLOCK_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_version(&mut self) -> Result<i32> {
        self.read_i32()
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.inner.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PersistError::invalid(format!("invalid bool byte {other:#04x}"))),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8()?)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.inner.read_i8()?)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.inner.read_i16::<LittleEndian>()?)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.inner.read_u16::<LittleEndian>()?)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.inner.read_i32::<LittleEndian>()?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.inner.read_u32::<LittleEndian>()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.inner.read_i64::<LittleEndian>()?)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.inner.read_u64::<LittleEndian>()?)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(self.inner.read_f32::<LittleEndian>()?)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(self.inner.read_f64::<LittleEndian>()?)
    }

    pub fn read_encoded_int(&mut self) -> Result<i32> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.inner.read_u8()?;
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(PersistError::invalid("encoded int longer than 5 bytes"))
    }

    /// Read exactly `len` bytes. The buffer grows chunk by chunk, so a corrupt length
    /// fails at end of stream instead of allocating the whole claimed size up front.
    pub fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(self.chunk_size as u64) as usize);
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(self.chunk_size as u64);
            let got = (&mut self.inner).take(step).read_to_end(&mut buf)? as u64;
            if got < step {
                return Err(PersistError::Truncated {
                    expected: len,
                    actual: len - remaining + got,
                });
            }
            remaining -= step;
        }
        Ok(buf)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_encoded_int()?;
        let len = u64::try_from(len)
            .map_err(|_| PersistError::invalid(format!("negative string length {len}")))?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| PersistError::invalid(format!("string is not UTF-8: {e}")))
    }

    pub fn read_opt_string(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn read_count(&mut self) -> Result<usize> {
        let count = self.read_i32()?;
        usize::try_from(count)
            .map_err(|_| PersistError::invalid(format!("negative collection count {count}")))
    }
}
