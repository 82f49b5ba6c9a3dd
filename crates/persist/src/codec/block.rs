//! Length-prefixed blocks: the skip-on-failure seam of the format.
//!
//! A block is `i64 total` followed by `total - 8` payload bytes. A reader that cannot make
//! sense of a payload still knows exactly where the next record starts.

use std::io::{Cursor, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};

use super::{BinaryReader, BinaryWriter};
use crate::error::{PersistError, Result};

/// Fixed overhead counted into every block length.
pub const BLOCK_HEADER_LEN: i64 = 8;

/// Writer handed to block callbacks; output is buffered until the callback returns.
pub type BlockWriter = BinaryWriter<Vec<u8>>;

/// Reader handed to block callbacks; bounded to exactly the block payload.
pub type BlockReader = BinaryReader<Cursor<Vec<u8>>>;

impl<W: Write> BinaryWriter<W> {
    /// Frame the output of `write_fn` as a block.
    ///
    /// The callback writes into scratch memory so the length is known before the header
    /// goes out. If it fails (or panics) the failure is logged and an empty block is
    /// emitted in its place, so the surrounding stream stays aligned. Returns whether the
    /// callback succeeded. Errors from the underlying sink still propagate.
    pub fn write_block<F>(&mut self, write_fn: F) -> Result<bool>
    where
        F: FnOnce(&mut BlockWriter) -> Result<()>,
    {
        let mut scratch = BinaryWriter::with_chunk_size(Vec::new(), self.chunk_size);
        let outcome = catch_unwind(AssertUnwindSafe(|| write_fn(&mut scratch)));
        let (payload, ok) = match outcome {
            Ok(Ok(())) => (scratch.into_inner(), true),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "block write failed, emitting empty block");
                (Vec::new(), false)
            }
            Err(_) => {
                tracing::error!("block writer panicked, emitting empty block");
                (Vec::new(), false)
            }
        };
        self.write_block_payload(&payload)?;
        Ok(ok)
    }

    /// Emit an already-encoded payload as a block, in chunk-sized writes.
    pub fn write_block_payload(&mut self, payload: &[u8]) -> Result<()> {
        let total = i64::try_from(payload.len())
            .ok()
            .and_then(|len| len.checked_add(BLOCK_HEADER_LEN))
            .ok_or_else(|| PersistError::invalid(format!("block too large: {} bytes", payload.len())))?;
        self.write_i64(total)?;
        for chunk in payload.chunks(self.chunk_size) {
            self.inner.write_all(chunk)?;
        }
        Ok(())
    }
}

impl<R: Read> BinaryReader<R> {
    /// Read one block and decode its payload with `read_fn`.
    ///
    /// `read_fn` only ever sees the payload bytes, so it cannot overrun into the next
    /// record. A callback failure or panic is logged and yields `Ok(None)`; the stream is
    /// left positioned after the block either way. Truncated payloads and impossible
    /// lengths are framing errors and propagate.
    pub fn read_block<T, F>(&mut self, read_fn: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut BlockReader) -> Result<T>,
    {
        let payload = self.read_block_payload()?;
        let len = payload.len();
        let mut sub = BinaryReader::with_chunk_size(Cursor::new(payload), self.chunk_size);
        match catch_unwind(AssertUnwindSafe(|| read_fn(&mut sub))) {
            Ok(Ok(value)) => {
                let consumed = sub.get_ref().position();
                if consumed < len as u64 {
                    tracing::trace!(consumed, len, "block payload not fully consumed");
                }
                Ok(Some(value))
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, len, "dropping unreadable block");
                Ok(None)
            }
            Err(_) => {
                tracing::error!(len, "block reader panicked, dropping block");
                Ok(None)
            }
        }
    }

    /// Read a block's payload bytes without interpreting them.
    pub fn read_block_payload(&mut self) -> Result<Vec<u8>> {
        let payload_len = self.read_block_len()?;
        self.read_bytes(payload_len)
    }

    /// Skip over one block. Returns the payload length skipped.
    pub fn skip_block(&mut self) -> Result<u64> {
        let payload_len = self.read_block_len()?;
        let skipped = std::io::copy(&mut (&mut self.inner).take(payload_len), &mut std::io::sink())?;
        if skipped < payload_len {
            return Err(PersistError::Truncated {
                expected: payload_len,
                actual: skipped,
            });
        }
        Ok(payload_len)
    }

    fn read_block_len(&mut self) -> Result<u64> {
        let total = self.read_i64()?;
        if total < BLOCK_HEADER_LEN {
            return Err(PersistError::InvalidBlockLength(total));
        }
        Ok((total - BLOCK_HEADER_LEN) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::reader;

    #[test]
    fn block_layout_counts_header() {
        let mut w = BinaryWriter::new(Vec::new());
        assert!(w.write_block(|b| b.write_i32(7)).unwrap());
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..8], &12i64.to_le_bytes());
    }

    #[test]
    fn block_roundtrip() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_block(|b| {
            b.write_version(2)?;
            b.write_string("torch")
        })
        .unwrap();

        let mut r = reader(w.into_inner());
        let value = r
            .read_block(|b| {
                assert_eq!(b.read_version()?, 2);
                b.read_string()
            })
            .unwrap();
        assert_eq!(value.as_deref(), Some("torch"));
    }

    #[test]
    fn failed_write_emits_empty_block() {
        let mut w = BinaryWriter::new(Vec::new());
        let ok = w
            .write_block(|b| {
                b.write_i32(1)?;
                Err(PersistError::invalid("boom"))
            })
            .unwrap();
        assert!(!ok);
        w.write_block(|b| b.write_i32(2)).unwrap();

        let mut r = reader(w.into_inner());
        assert_eq!(r.read_block(|b| b.read_i32()).unwrap(), None);
        assert_eq!(r.read_block(|b| b.read_i32()).unwrap(), Some(2));
    }

    #[test]
    fn panicking_writer_is_contained() {
        let mut w = BinaryWriter::new(Vec::new());
        let ok = w.write_block(|_| -> Result<()> { panic!("bad record") }).unwrap();
        assert!(!ok);
        assert_eq!(w.into_inner(), 8i64.to_le_bytes().to_vec());
    }

    #[test]
    fn failing_block_does_not_disturb_neighbours() {
        let n = 6;
        let failing = 3;
        let mut w = BinaryWriter::new(Vec::new());
        for i in 0..n {
            w.write_block(|b| {
                b.write_i32(i)?;
                b.write_string(&format!("record-{i}"))
            })
            .unwrap();
        }

        let mut r = reader(w.into_inner());
        let mut seen = Vec::new();
        for i in 0..n {
            let value = r
                .read_block(|b| {
                    if i == failing {
                        // Stale reader expecting a different shape.
                        b.read_u64()?;
                        return Err(PersistError::invalid("unexpected shape"));
                    }
                    let id = b.read_i32()?;
                    let name = b.read_string()?;
                    Ok((id, name))
                })
                .unwrap();
            seen.push(value);
        }

        assert_eq!(seen[failing as usize], None);
        for (i, value) in seen.iter().enumerate() {
            if i as i32 != failing {
                assert_eq!(value, &Some((i as i32, format!("record-{i}"))));
            }
        }
    }

    #[test]
    fn reader_cannot_overrun_block() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_block(|b| b.write_u8(1)).unwrap();
        w.write_i32(99).unwrap();

        let mut r = reader(w.into_inner());
        assert_eq!(r.read_block(|b| b.read_i64()).unwrap(), None);
        assert_eq!(r.read_i32().unwrap(), 99);
    }

    #[test]
    fn partially_consumed_block_still_realigns() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_block(|b| {
            b.write_i32(1)?;
            b.write_string("field added in a later version")
        })
        .unwrap();
        w.write_i32(42).unwrap();

        let mut r = reader(w.into_inner());
        assert_eq!(r.read_block(|b| b.read_i32()).unwrap(), Some(1));
        assert_eq!(r.read_i32().unwrap(), 42);
    }

    #[test]
    fn large_block_uses_chunked_io() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let mut w = BinaryWriter::with_chunk_size(Vec::new(), 4096);
        w.write_block(|b| b.write_bytes(&payload)).unwrap();

        let mut r = BinaryReader::with_chunk_size(std::io::Cursor::new(w.into_inner()), 4096);
        let back = r.read_block(|b| b.read_bytes(200_000)).unwrap().unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn truncated_block_is_framing_error() {
        let mut bytes = 20i64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        let err = reader(bytes).read_block(|b| b.read_i32()).unwrap_err();
        assert!(err.is_framing());
    }

    #[test]
    fn undersized_length_is_rejected() {
        let err = reader(4i64.to_le_bytes().to_vec())
            .read_block(|b| b.read_i32())
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidBlockLength(4)));
    }

    #[test]
    fn skip_block_moves_past_payload() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_block(|b| b.write_string("ignored")).unwrap();
        w.write_i32(5).unwrap();

        let mut r = reader(w.into_inner());
        assert_eq!(r.skip_block().unwrap(), 8);
        assert_eq!(r.read_i32().unwrap(), 5);
    }
}
