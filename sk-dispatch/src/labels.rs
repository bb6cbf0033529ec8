//! Label allocator.
//!
//! Maps textual labels to small positive integer ids and back, with
//! reference counting. The authoritative state lives in the pinned
//! `labels` kernel map so it survives process exits; an in-memory mirror
//! rebuilt by scanning on open gives O(1) name lookups. The kernel map is
//! written before the mirror is committed, so a failed map write never
//! leaves the mirror ahead of the kernel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use aya::maps::{HashMap as BpfHashMap, MapData};

use sk_dispatch_common::{LabelValue, LABEL_NAME_SIZE, MAX_LABEL_ID, MAX_LABEL_LEN};

use crate::errors::{DispatchError, Result};

/// Id assigned to a live label. Never 0; id 0 is the "absent" sentinel in
/// the kernel maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelId(pub(crate) u32);

impl LabelId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Name validation and fixed-size encoding
// ---------------------------------------------------------------------------

/// A label must be 1..=63 bytes of printable, non-space ASCII.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_LABEL_LEN
        || !name.bytes().all(|b| b.is_ascii_graphic())
    {
        return Err(DispatchError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn encode_name(name: &str) -> [u8; LABEL_NAME_SIZE] {
    let mut buf = [0u8; LABEL_NAME_SIZE];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

fn decode_name(buf: &[u8; LABEL_NAME_SIZE]) -> Result<String> {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = std::str::from_utf8(&buf[..len])
        .map_err(|_| DispatchError::Corrupt("label name is not UTF-8".into()))?;
    validate_name(name).map_err(|_| {
        DispatchError::Corrupt(format!("label name {name:?} violates the name rule"))
    })?;
    Ok(name.to_string())
}

// ---------------------------------------------------------------------------
// In-memory mirror
// ---------------------------------------------------------------------------

/// Mirror of the kernel map. All allocation decisions happen here; the
/// kernel map only persists them.
#[derive(Debug, Default)]
struct LabelTable {
    by_name: HashMap<String, (LabelId, u32)>,
    allocated: BTreeSet<u32>,
}

impl LabelTable {
    /// Add an entry found while scanning the kernel map.
    fn insert_scanned(&mut self, id: u32, name: String, count: u32) -> Result<()> {
        if id == 0 || id > MAX_LABEL_ID {
            return Err(DispatchError::Corrupt(format!("label id {id} out of range")));
        }
        if count == 0 {
            return Err(DispatchError::Corrupt(format!(
                "label {name:?} has a zero refcount"
            )));
        }
        if self.by_name.contains_key(&name) {
            return Err(DispatchError::Corrupt(format!(
                "label {name:?} appears under two ids"
            )));
        }
        self.by_name.insert(name, (LabelId(id), count));
        self.allocated.insert(id);
        Ok(())
    }

    /// Smallest id >= 1 not currently allocated.
    fn next_free(&self) -> Option<LabelId> {
        let mut candidate = 1u32;
        for &id in &self.allocated {
            if id > candidate {
                break;
            }
            candidate = id + 1;
        }
        (candidate <= MAX_LABEL_ID).then_some(LabelId(candidate))
    }

    fn get(&self, name: &str) -> Option<(LabelId, u32)> {
        self.by_name.get(name).copied()
    }

    fn commit_acquire(&mut self, name: &str, id: LabelId, count: u32) {
        self.by_name.insert(name.to_string(), (id, count));
        self.allocated.insert(id.0);
    }

    fn commit_release(&mut self, name: &str, remaining: Option<(LabelId, u32)>) {
        match remaining {
            Some((id, count)) => {
                self.by_name.insert(name.to_string(), (id, count));
            }
            None => {
                if let Some((id, _)) = self.by_name.remove(name) {
                    self.allocated.remove(&id.0);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Label allocator backed by the pinned `labels` map.
pub struct Labels {
    map: BpfHashMap<MapData, u32, LabelValue>,
    table: LabelTable,
}

impl Labels {
    /// Wrap the kernel map and rebuild the mirror by scanning it.
    pub fn from_map(map: BpfHashMap<MapData, u32, LabelValue>) -> Result<Labels> {
        let mut table = LabelTable::default();
        for entry in map.iter() {
            let (id, value) = entry?;
            let name = decode_name(&value.name)?;
            table.insert_scanned(id, name, value.count)?;
        }
        Ok(Labels { map, table })
    }

    /// Return the id for `name`, allocating the smallest free id on first
    /// reference and incrementing the refcount otherwise.
    pub fn acquire(&mut self, name: &str) -> Result<LabelId> {
        validate_name(name)?;

        let (id, count) = match self.table.get(name) {
            Some((id, count)) => (id, count + 1),
            None => (self.table.next_free().ok_or(DispatchError::Full)?, 1),
        };

        let value = LabelValue {
            name: encode_name(name),
            count,
        };
        self.map.insert(id.0, value, 0)?;
        self.table.commit_acquire(name, id, count);
        Ok(id)
    }

    /// Drop one reference to `name`, freeing its id when the count
    /// reaches zero.
    pub fn release(&mut self, name: &str) -> Result<()> {
        let (id, count) = self.table.get(name).ok_or(DispatchError::NotFound)?;

        if count > 1 {
            let value = LabelValue {
                name: encode_name(name),
                count: count - 1,
            };
            self.map.insert(id.0, value, 0)?;
            self.table.commit_release(name, Some((id, count - 1)));
        } else {
            self.map.remove(&id.0)?;
            self.table.commit_release(name, None);
        }
        Ok(())
    }

    /// True iff the allocator currently maps `name` to exactly `id`.
    pub fn has_id(&self, name: &str, id: LabelId) -> bool {
        matches!(self.table.get(name), Some((have, _)) if have == id)
    }

    /// Name currently owning `id`, if any.
    pub fn name_for(&self, id: u32) -> Option<&str> {
        self.table
            .by_name
            .iter()
            .find(|(_, &(have, _))| have.0 == id)
            .map(|(name, _)| name.as_str())
    }

    /// Snapshot of the live id -> name mapping.
    pub fn list(&self) -> BTreeMap<LabelId, String> {
        self.table
            .by_name
            .iter()
            .map(|(name, &(id, _))| (id, name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rule() {
        assert!(validate_name("web").is_ok());
        assert!(validate_name("front-end_2.prod").is_ok());
        assert!(validate_name(&"x".repeat(63)).is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("nul\0byte").is_err());
        assert!(validate_name("ünïcode").is_err());
    }

    #[test]
    fn name_encoding_round_trip() {
        let buf = encode_name("web");
        assert_eq!(&buf[..4], b"web\0");
        assert_eq!(decode_name(&buf).unwrap(), "web");

        let long = "y".repeat(63);
        assert_eq!(decode_name(&encode_name(&long)).unwrap(), long);
    }

    #[test]
    fn decode_rejects_corrupt_names() {
        let buf = [0u8; LABEL_NAME_SIZE];
        assert!(matches!(
            decode_name(&buf),
            Err(DispatchError::Corrupt(_))
        ));

        let mut buf = [0u8; LABEL_NAME_SIZE];
        buf[0] = 0xff;
        assert!(decode_name(&buf).is_err());
    }

    #[test]
    fn smallest_free_id() {
        let mut table = LabelTable::default();
        assert_eq!(table.next_free(), Some(LabelId(1)));

        table.insert_scanned(1, "a".into(), 1).unwrap();
        table.insert_scanned(2, "b".into(), 1).unwrap();
        table.insert_scanned(4, "d".into(), 1).unwrap();
        assert_eq!(table.next_free(), Some(LabelId(3)));

        table.insert_scanned(3, "c".into(), 1).unwrap();
        assert_eq!(table.next_free(), Some(LabelId(5)));
    }

    #[test]
    fn freed_ids_are_reused_smallest_first() {
        let mut table = LabelTable::default();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            table.insert_scanned(id, name.into(), 1).unwrap();
        }

        table.commit_release("b", None);
        assert_eq!(table.next_free(), Some(LabelId(2)));
    }

    #[test]
    fn exhaustion() {
        let mut table = LabelTable::default();
        table.allocated = (1..=MAX_LABEL_ID).collect();
        assert_eq!(table.next_free(), None);

        table.allocated.remove(&17);
        assert_eq!(table.next_free(), Some(LabelId(17)));
    }

    #[test]
    fn refcounts_accumulate_and_drain() {
        // Acquire k+1 times, release k+1 times: the id must return to free.
        let mut table = LabelTable::default();
        let k = 4;

        let id = table.next_free().unwrap();
        for count in 1..=k {
            table.commit_acquire("web", id, count);
            assert_eq!(table.get("web"), Some((id, count)));
        }
        for count in (1..k).rev() {
            table.commit_release("web", Some((id, count)));
            assert_eq!(table.get("web"), Some((id, count)));
        }
        table.commit_release("web", None);

        assert_eq!(table.get("web"), None);
        assert_eq!(table.next_free(), Some(id));
    }

    #[test]
    fn scan_detects_corruption() {
        let mut table = LabelTable::default();
        assert!(table.insert_scanned(0, "zero".into(), 1).is_err());
        assert!(table.insert_scanned(1, "dead".into(), 0).is_err());

        table.insert_scanned(2, "web".into(), 1).unwrap();
        assert!(table.insert_scanned(3, "web".into(), 1).is_err());
    }
}
