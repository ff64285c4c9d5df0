//! Per-method literal pool.
//!
//! Constants with no compact immediate form are loaded PC-relative from a
//! pool emitted after the method body. Equal constants share one slot.

use hashbrown::HashMap;
use log::debug;
use std::fmt;

/// A pooled constant, by bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiteralValue {
    Word(u32),
    Wide(u64),
}

impl LiteralValue {
    pub fn size_in_bytes(self) -> usize {
        match self {
            LiteralValue::Word(_) => 4,
            LiteralValue::Wide(_) => 8,
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Word(bits) => write!(f, ".word {bits:#010x}"),
            LiteralValue::Wide(bits) => write!(f, ".quad {bits:#018x}"),
        }
    }
}

/// Handle to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiteralId(u32);

impl LiteralId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LiteralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lit{}", self.0)
    }
}

#[derive(Debug, Default, Clone)]
pub struct LiteralPool {
    entries: Vec<LiteralValue>,
    slots: HashMap<LiteralValue, LiteralId>,
}

impl LiteralPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing slot holding `value`.
    pub fn scan(&self, value: LiteralValue) -> Option<LiteralId> {
        self.slots.get(&value).copied()
    }

    /// Slot for `value`, reusing an existing one when present.
    pub fn get_or_insert(&mut self, value: LiteralValue) -> LiteralId {
        if let Some(id) = self.scan(value) {
            debug!("literal pool hit: {value} in {id}");
            return id;
        }
        let id = LiteralId(self.entries.len() as u32);
        self.entries.push(value);
        self.slots.insert(value, id);
        id
    }

    pub fn get(&self, id: LiteralId) -> LiteralValue {
        self.entries[id.index()]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LiteralId, LiteralValue)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, &value)| (LiteralId(index as u32), value))
    }

    /// Pool size with wide entries 8-byte aligned.
    pub fn size_in_bytes(&self) -> usize {
        self.entries.iter().fold(0, |offset, value| {
            let size = value.size_in_bytes();
            offset.next_multiple_of(size) + size
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup() {
        let mut pool = LiteralPool::new();
        let a = pool.get_or_insert(LiteralValue::Word(0x4049_0fd0));
        let b = pool.get_or_insert(LiteralValue::Wide(0x4049_0fd0));
        let c = pool.get_or_insert(LiteralValue::Word(0x4049_0fd0));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.scan(LiteralValue::Word(1)), None);
    }

    #[test]
    fn test_size_aligns_wide_entries() {
        let mut pool = LiteralPool::new();
        pool.get_or_insert(LiteralValue::Word(1));
        pool.get_or_insert(LiteralValue::Wide(2));
        assert_eq!(pool.size_in_bytes(), 16);
        assert_eq!(pool.get(LiteralId(1)), LiteralValue::Wide(2));
    }
}
