use std::mem::size_of;

use crate::constants::TABLE_MAX_LOAD;
use crate::memory::grow_capacity;
use crate::objects::object_string::ObjectString;
use crate::value::{is_nil, make_bool_value, make_nil_value, Value};

#[derive(Clone, Copy)]
struct Entry {
    key: *mut ObjectString,
    value: Value,
}

impl Entry {
    // An empty slot is a null key with a nil value; a tombstone is a null key
    // with a non-nil sentinel, which keeps probe sequences intact.
    fn empty() -> Entry {
        Entry {
            key: std::ptr::null_mut(),
            value: make_nil_value(),
        }
    }
}

/// Open-addressed, linear-probing map from interned strings to values.
/// Key equality is pointer identity; interning guarantees that equal contents
/// share one pointer.
pub struct Table {
    // Live entries plus tombstones; reset to live-only on rehash.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.key.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Inserts or updates; returns true when `key` was not present before.
    pub fn set(&mut self, key: *mut ObjectString, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let capacity = grow_capacity!(self.entries.len());
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        if is_new_key && is_nil(&entry.value) {
            // Fresh slot; reused tombstones are already counted.
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new_key
    }

    /// Removes `key`, leaving a tombstone. Returns true when it was present.
    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }
        entry.key = std::ptr::null_mut();
        entry.value = make_bool_value(true);
        true
    }

    /// Copies every entry of `from` into this table (copy-down inheritance).
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if !entry.key.is_null() {
                self.set(entry.key, entry.value);
            }
        }
    }

    /// Looks up a string by contents. Used by the intern set before a new
    /// string object exists, so it cannot rely on pointer equality.
    pub fn find_string(&self, content: &str, hash: u32) -> Option<*mut ObjectString> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if is_nil(&entry.value) {
                    return None;
                }
            } else {
                let key = unsafe { &*entry.key };
                if key.hash == hash && key.content == content {
                    return Some(entry.key);
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Drops every entry whose key object is unmarked. Run on the intern set
    /// between tracing and sweeping so dead strings are not resurrected.
    pub fn remove_white(&mut self) {
        let mut dead_keys = Vec::new();
        for entry in &self.entries {
            if !entry.key.is_null() && !unsafe { (*entry.key).object.is_marked } {
                dead_keys.push(entry.key);
            }
        }
        for key in dead_keys {
            self.delete(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjectString, &Value)> {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, &entry.value))
    }

    pub fn deep_size(&self) -> usize {
        size_of::<Table>() + self.entries.capacity() * size_of::<Entry>()
    }

    /// Returns the slot holding `key`, or the slot an insert should use: the
    /// first tombstone on the probe path if any, else the terminating empty
    /// slot. Capacity is a power of two and never full, so probing terminates.
    fn find_entry(entries: &[Entry], key: *mut ObjectString) -> usize {
        let capacity = entries.len();
        let mut index = unsafe { (*key).hash } as usize & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if is_nil(&entry.value) {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if std::ptr::eq(entry.key, key) {
                return index;
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::empty(); capacity]);
        self.count = 0;
        for entry in old_entries {
            if entry.key.is_null() {
                continue;
            }
            let index = Self::find_entry(&self.entries, entry.key);
            self.entries[index] = entry;
            self.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_manager::ObjectManager;
    use crate::objects::object_string::hash_string;
    use crate::value::{as_number, make_number_value};

    fn make_keys(manager: &mut ObjectManager, names: &[&str]) -> Vec<*mut ObjectString> {
        names.iter().map(|name| manager.alloc_string(name).0).collect()
    }

    #[test]
    fn test_set_get_update() {
        let mut manager = ObjectManager::new();
        let keys = make_keys(&mut manager, &["a"]);
        let mut table = Table::new();
        assert!(table.set(keys[0], make_number_value(1.0)));
        assert!(!table.set(keys[0], make_number_value(2.0)));
        let value = table.get(keys[0]).expect("key should be present");
        assert_eq!(as_number(&value), 2.0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_missing_key_is_a_miss() {
        let mut manager = ObjectManager::new();
        let keys = make_keys(&mut manager, &["present", "absent"]);
        let mut table = Table::new();
        table.set(keys[0], make_number_value(1.0));
        assert!(table.get(keys[1]).is_none());
    }

    #[test]
    fn test_delete_leaves_probes_intact() {
        let mut manager = ObjectManager::new();
        let keys = make_keys(&mut manager, &["a", "b", "c", "d", "e", "f"]);
        let mut table = Table::new();
        for (index, &key) in keys.iter().enumerate() {
            table.set(key, make_number_value(index as f64));
        }
        assert!(table.delete(keys[2]));
        assert!(!table.delete(keys[2]));
        // Every other key must still be reachable past the tombstone.
        for (index, &key) in keys.iter().enumerate() {
            if index == 2 {
                assert!(table.get(key).is_none());
            } else {
                assert!(table.get(key).is_some());
            }
        }
        assert_eq!(table.len(), keys.len() - 1);
    }

    #[test]
    fn test_tombstone_slot_is_reused() {
        let mut manager = ObjectManager::new();
        let keys = make_keys(&mut manager, &["x", "y"]);
        let mut table = Table::new();
        table.set(keys[0], make_number_value(1.0));
        table.delete(keys[0]);
        // Reinsertion reports a new key and must not grow the live count twice.
        assert!(table.set(keys[0], make_number_value(2.0)));
        assert!(table.set(keys[1], make_number_value(3.0)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut manager = ObjectManager::new();
        let names: Vec<String> = (0..64).map(|index| format!("key{}", index)).collect();
        let name_refs: Vec<&str> = names.iter().map(|name| name.as_str()).collect();
        let keys = make_keys(&mut manager, &name_refs);
        let mut table = Table::new();
        for (index, &key) in keys.iter().enumerate() {
            table.set(key, make_number_value(index as f64));
        }
        assert_eq!(table.len(), keys.len());
        for (index, &key) in keys.iter().enumerate() {
            let value = table.get(key).expect("entry lost during growth");
            assert_eq!(as_number(&value), index as f64);
        }
    }

    #[test]
    fn test_add_all_copies_every_entry() {
        let mut manager = ObjectManager::new();
        let keys = make_keys(&mut manager, &["m1", "m2", "m3"]);
        let mut source = Table::new();
        for &key in &keys {
            source.set(key, make_number_value(1.0));
        }
        let mut target = Table::new();
        target.set(keys[0], make_number_value(9.0));
        target.add_all(&source);
        assert_eq!(target.len(), 3);
        // add_all overwrites, mirroring inheritance copy-down order.
        assert_eq!(as_number(&target.get(keys[0]).unwrap()), 1.0);
    }

    #[test]
    fn test_find_string_matches_by_contents() {
        let mut manager = ObjectManager::new();
        let keys = make_keys(&mut manager, &["needle"]);
        let mut table = Table::new();
        table.set(keys[0], make_nil_value());
        let found = table.find_string("needle", hash_string("needle"));
        assert_eq!(found, Some(keys[0]));
        assert!(table.find_string("missing", hash_string("missing")).is_none());
    }

    #[test]
    fn test_remove_white_drops_unmarked_keys() {
        let mut manager = ObjectManager::new();
        let mut keys = make_keys(&mut manager, &["live", "dead"]);
        let mut table = Table::new();
        table.set(keys[0], make_nil_value());
        table.set(keys[1], make_nil_value());
        unsafe {
            (*keys[0]).object.is_marked = true;
        }
        table.remove_white();
        assert!(table.get(keys[0]).is_some());
        assert!(table.get(keys[1]).is_none());
        unsafe {
            (*keys[0]).object.is_marked = false;
        }
    }
}
