//! Sequences, sets, ordered maps and bit vectors.
//!
//! Every container is an `i32` count followed by that many elements. Each element is a
//! presence `bool` and, when present, its payload.
//!
//! Plain variants (`write_list`, `read_map`, ...) write elements inline: a decode error
//! in one element leaves the stream misaligned, so it propagates and the caller loses the
//! rest of the stream. Block variants (`write_block_list`, `read_block_map`, ...) wrap each
//! element in a block: a failing element is logged and dropped and decoding continues with
//! the next one. Block variants cost 8 bytes per element.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use super::{BinaryReader, BinaryWriter, BlockReader, BlockWriter};
use crate::error::Result;

/// Cap on speculative preallocation from an on-disk count.
const MAX_PREALLOC: usize = 4096;

impl<W: Write> BinaryWriter<W> {
    pub fn write_list<'a, T, I, F>(&mut self, items: I, mut write_fn: F) -> Result<()>
    where
        T: 'a,
        I: IntoIterator<Item = &'a T>,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut Self, &T) -> Result<()>,
    {
        let items = items.into_iter();
        self.write_count(items.len())?;
        for item in items {
            self.write_bool(true)?;
            write_fn(self, item)?;
        }
        Ok(())
    }

    /// List whose slots may be empty; `None` is written as a lone `false`.
    pub fn write_sparse_list<T, F>(&mut self, items: &[Option<T>], mut write_fn: F) -> Result<()>
    where
        F: FnMut(&mut Self, &T) -> Result<()>,
    {
        self.write_count(items.len())?;
        for item in items {
            match item {
                Some(item) => {
                    self.write_bool(true)?;
                    write_fn(self, item)?;
                }
                None => self.write_bool(false)?,
            }
        }
        Ok(())
    }

    pub fn write_block_list<'a, T, I, F>(&mut self, items: I, mut write_fn: F) -> Result<()>
    where
        T: 'a,
        I: IntoIterator<Item = &'a T>,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut BlockWriter, &T) -> Result<()>,
    {
        let items = items.into_iter();
        self.write_count(items.len())?;
        for item in items {
            self.write_block(|b| {
                b.write_bool(true)?;
                write_fn(b, item)
            })?;
        }
        Ok(())
    }

    /// Sets share the list encoding.
    pub fn write_set<T, F>(&mut self, set: &BTreeSet<T>, write_fn: F) -> Result<()>
    where
        F: FnMut(&mut Self, &T) -> Result<()>,
    {
        self.write_list(set, write_fn)
    }

    pub fn write_block_set<T, F>(&mut self, set: &BTreeSet<T>, write_fn: F) -> Result<()>
    where
        F: FnMut(&mut BlockWriter, &T) -> Result<()>,
    {
        self.write_block_list(set, write_fn)
    }

    /// Each entry is written as one element: presence, then whatever `write_fn` emits for
    /// the key/value pair.
    pub fn write_map<'a, K, V, I, F>(&mut self, entries: I, mut write_fn: F) -> Result<()>
    where
        K: 'a,
        V: 'a,
        I: IntoIterator<Item = (&'a K, &'a V)>,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut Self, &K, &V) -> Result<()>,
    {
        let entries = entries.into_iter();
        self.write_count(entries.len())?;
        for (key, value) in entries {
            self.write_bool(true)?;
            write_fn(self, key, value)?;
        }
        Ok(())
    }

    pub fn write_block_map<'a, K, V, I, F>(&mut self, entries: I, mut write_fn: F) -> Result<()>
    where
        K: 'a,
        V: 'a,
        I: IntoIterator<Item = (&'a K, &'a V)>,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut BlockWriter, &K, &V) -> Result<()>,
    {
        let entries = entries.into_iter();
        self.write_count(entries.len())?;
        for (key, value) in entries {
            self.write_block(|b| {
                b.write_bool(true)?;
                write_fn(b, key, value)
            })?;
        }
        Ok(())
    }

    /// One byte per bit; not packed.
    pub fn write_bit_vec(&mut self, bits: &[bool]) -> Result<()> {
        self.write_count(bits.len())?;
        for bit in bits {
            self.write_bool(*bit)?;
        }
        Ok(())
    }
}

impl<R: Read> BinaryReader<R> {
    /// Absent elements are skipped.
    pub fn read_list<T, F>(&mut self, mut read_fn: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let count = self.read_count()?;
        let mut items = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            if self.read_bool()? {
                items.push(read_fn(self)?);
            }
        }
        Ok(items)
    }

    /// Keeps absent elements as `None`, preserving positions.
    pub fn read_sparse_list<T, F>(&mut self, mut read_fn: F) -> Result<Vec<Option<T>>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let count = self.read_count()?;
        let mut items = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            let item = if self.read_bool()? {
                Some(read_fn(self)?)
            } else {
                None
            };
            items.push(item);
        }
        Ok(items)
    }

    /// Elements that fail to decode are dropped; the rest are returned in order.
    pub fn read_block_list<T, F>(&mut self, mut read_fn: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut BlockReader) -> Result<T>,
    {
        let count = self.read_count()?;
        let mut items = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            if let Some(Some(item)) = self.read_block(|b| read_present(b, &mut read_fn))? {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub fn read_set<T, F>(&mut self, read_fn: F) -> Result<BTreeSet<T>>
    where
        T: Ord,
        F: FnMut(&mut Self) -> Result<T>,
    {
        Ok(self.read_list(read_fn)?.into_iter().collect())
    }

    pub fn read_block_set<T, F>(&mut self, read_fn: F) -> Result<BTreeSet<T>>
    where
        T: Ord,
        F: FnMut(&mut BlockReader) -> Result<T>,
    {
        Ok(self.read_block_list(read_fn)?.into_iter().collect())
    }

    /// Read a map. When two entries share a key, `replace = true` keeps the later value
    /// and `replace = false` keeps the first one.
    pub fn read_map<K, V, F>(&mut self, replace: bool, mut read_fn: F) -> Result<BTreeMap<K, V>>
    where
        K: Ord,
        F: FnMut(&mut Self) -> Result<(K, V)>,
    {
        let count = self.read_count()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            if self.read_bool()? {
                let (key, value) = read_fn(self)?;
                insert_entry(&mut map, key, value, replace);
            }
        }
        Ok(map)
    }

    /// Block-framed map; same collision policy as [`read_map`](Self::read_map).
    pub fn read_block_map<K, V, F>(&mut self, replace: bool, mut read_fn: F) -> Result<BTreeMap<K, V>>
    where
        K: Ord,
        F: FnMut(&mut BlockReader) -> Result<(K, V)>,
    {
        let count = self.read_count()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            if let Some(Some((key, value))) = self.read_block(|b| read_present(b, &mut read_fn))? {
                insert_entry(&mut map, key, value, replace);
            }
        }
        Ok(map)
    }

    pub fn read_bit_vec(&mut self) -> Result<Vec<bool>> {
        let count = self.read_count()?;
        let mut bits = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            bits.push(self.read_bool()?);
        }
        Ok(bits)
    }
}

fn read_present<T, F>(b: &mut BlockReader, read_fn: &mut F) -> Result<Option<T>>
where
    F: FnMut(&mut BlockReader) -> Result<T>,
{
    if b.read_bool()? {
        Ok(Some(read_fn(b)?))
    } else {
        Ok(None)
    }
}

fn insert_entry<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V, replace: bool) {
    if replace || !map.contains_key(&key) {
        if map.insert(key, value).is_some() {
            tracing::trace!("duplicate map key, replaced earlier value");
        }
    } else {
        tracing::trace!("duplicate map key, kept first value");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::reader;
    use crate::error::PersistError;

    fn int_string_entries(w: &mut BinaryWriter<Vec<u8>>, entries: &[(i32, &str)]) {
        w.write_i32(entries.len() as i32).unwrap();
        for (k, v) in entries {
            w.write_bool(true).unwrap();
            w.write_i32(*k).unwrap();
            w.write_string(v).unwrap();
        }
    }

    fn read_int_string<R: Read>(r: &mut BinaryReader<R>) -> Result<(i32, String)> {
        Ok((r.read_i32()?, r.read_string()?))
    }

    #[test]
    fn list_roundtrip() {
        let items = vec![3u16, 1, 4, 1, 5];
        let mut w = BinaryWriter::new(Vec::new());
        w.write_list(&items, |w, v| w.write_u16(*v)).unwrap();
        let back = reader(w.into_inner()).read_list(|r| r.read_u16()).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn empty_containers_roundtrip() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_list(&Vec::<i32>::new(), |w, v| w.write_i32(*v)).unwrap();
        w.write_map(&BTreeMap::<i32, i32>::new(), |w, k, v| {
            w.write_i32(*k)?;
            w.write_i32(*v)
        })
        .unwrap();
        w.write_bit_vec(&[]).unwrap();

        let mut r = reader(w.into_inner());
        assert!(r.read_list(|r| r.read_i32()).unwrap().is_empty());
        assert!(r.read_map(true, |r| Ok((r.read_i32()?, r.read_i32()?))).unwrap().is_empty());
        assert!(r.read_bit_vec().unwrap().is_empty());
    }

    #[test]
    fn sparse_list_preserves_absent_slots() {
        let items = vec![None, Some("a".to_string()), None, None];
        let mut w = BinaryWriter::new(Vec::new());
        w.write_sparse_list(&items, |w, s| w.write_string(s)).unwrap();
        let bytes = w.into_inner();

        let back = reader(bytes.clone()).read_sparse_list(|r| r.read_string()).unwrap();
        assert_eq!(back, items);
        let dense = reader(bytes).read_list(|r| r.read_string()).unwrap();
        assert_eq!(dense, vec!["a".to_string()]);
    }

    #[test]
    fn all_absent_sparse_list_roundtrip() {
        let items: Vec<Option<i64>> = vec![None; 5];
        let mut w = BinaryWriter::new(Vec::new());
        w.write_sparse_list(&items, |w, v| w.write_i64(*v)).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 4 + 5);
        assert_eq!(reader(bytes).read_sparse_list(|r| r.read_i64()).unwrap(), items);
    }

    #[test]
    fn set_roundtrip() {
        let set: BTreeSet<String> = ["north", "south", "east"].iter().map(|s| s.to_string()).collect();
        let mut w = BinaryWriter::new(Vec::new());
        w.write_set(&set, |w, s| w.write_string(s)).unwrap();
        w.write_block_set(&set, |w, s| w.write_string(s)).unwrap();

        let mut r = reader(w.into_inner());
        assert_eq!(r.read_set(|r| r.read_string()).unwrap(), set);
        assert_eq!(r.read_block_set(|r| r.read_string()).unwrap(), set);
    }

    #[test]
    fn map_roundtrip() {
        let map: BTreeMap<i32, String> = [(1, "a".to_string()), (2, "b".to_string())].into();
        let mut w = BinaryWriter::new(Vec::new());
        w.write_map(&map, |w, k, v| {
            w.write_i32(*k)?;
            w.write_string(v)
        })
        .unwrap();
        let back = reader(w.into_inner()).read_map(true, read_int_string).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn duplicate_keys_follow_replace_policy() {
        let mut w = BinaryWriter::new(Vec::new());
        int_string_entries(&mut w, &[(7, "first"), (7, "second")]);
        let bytes = w.into_inner();

        let replaced = reader(bytes.clone()).read_map(true, read_int_string).unwrap();
        assert_eq!(replaced[&7], "second");
        let kept = reader(bytes).read_map(false, read_int_string).unwrap();
        assert_eq!(kept[&7], "first");
    }

    #[test]
    fn appended_duplicate_overwrites_with_replace() {
        let map: BTreeMap<i32, String> = [(1, "a".to_string()), (2, "b".to_string())].into();
        let mut w = BinaryWriter::new(Vec::new());
        // Same bytes write_map would produce, plus a duplicate key appended.
        let mut entries: Vec<(i32, &str)> = map.iter().map(|(k, v)| (*k, v.as_str())).collect();
        entries.push((1, "z"));
        int_string_entries(&mut w, &entries);

        let back = reader(w.into_inner()).read_map(true, read_int_string).unwrap();
        let expected: BTreeMap<i32, String> = [(1, "z".to_string()), (2, "b".to_string())].into();
        assert_eq!(back, expected);
    }

    #[test]
    fn block_map_duplicate_policy() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_i32(2).unwrap();
        for value in ["first", "second"] {
            w.write_block(|b| {
                b.write_bool(true)?;
                b.write_i32(9)?;
                b.write_string(value)
            })
            .unwrap();
        }
        let bytes = w.into_inner();

        let replaced = reader(bytes.clone()).read_block_map(true, read_int_string).unwrap();
        assert_eq!(replaced[&9], "second");
        let kept = reader(bytes).read_block_map(false, read_int_string).unwrap();
        assert_eq!(kept[&9], "first");
    }

    #[test]
    fn block_list_drops_only_failing_element() {
        let items = vec![10i32, 20, 30, 40];
        let mut w = BinaryWriter::new(Vec::new());
        w.write_block_list(&items, |w, v| w.write_i32(*v)).unwrap();
        w.write_string("trailer").unwrap();

        let mut r = reader(w.into_inner());
        let back = r
            .read_block_list(|r| {
                let v = r.read_i32()?;
                if v == 30 {
                    return Err(PersistError::invalid("cannot read 30"));
                }
                Ok(v)
            })
            .unwrap();
        assert_eq!(back, vec![10, 20, 40]);
        assert_eq!(r.read_string().unwrap(), "trailer");
    }

    #[test]
    fn block_map_drops_only_failing_entry() {
        let map: BTreeMap<i32, String> =
            [(1, "one".to_string()), (2, "two".to_string()), (3, "three".to_string())].into();
        let mut w = BinaryWriter::new(Vec::new());
        w.write_block_map(&map, |w, k, v| {
            w.write_i32(*k)?;
            w.write_string(v)
        })
        .unwrap();

        let back = reader(w.into_inner())
            .read_block_map(true, |r| {
                let (k, v) = read_int_string(r)?;
                if k == 2 {
                    return Err(PersistError::invalid("stale shape"));
                }
                Ok((k, v))
            })
            .unwrap();
        assert_eq!(back.len(), 2);
        assert!(!back.contains_key(&2));
    }

    #[test]
    fn plain_list_error_propagates() {
        let mut w = BinaryWriter::new(Vec::new());
        w.write_list(&[1i32, 2, 3], |w, v| w.write_i32(*v)).unwrap();
        let err = reader(w.into_inner())
            .read_list(|r| {
                let v = r.read_i32()?;
                if v == 2 {
                    return Err(PersistError::invalid("bad element"));
                }
                Ok(v)
            })
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidData(_)));
    }

    #[test]
    fn bit_vec_roundtrip() {
        let bits = vec![true, false, false, true, true, false, true, false, true];
        let mut w = BinaryWriter::new(Vec::new());
        w.write_bit_vec(&bits).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 4 + bits.len());
        assert_eq!(reader(bytes).read_bit_vec().unwrap(), bits);
    }

    #[test]
    fn negative_count_is_rejected() {
        let err = reader((-1i32).to_le_bytes().to_vec())
            .read_list(|r| r.read_u8())
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidData(_)));
    }
}
