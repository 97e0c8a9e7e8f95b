//! Open-addressed hash table keyed by `Value`.
//!
//! Linear probing, capacity always a power of two, max load factor 0.75.
//! Vacant slots hold the `empty` sentinel key with a `nil` value; tombstones
//! hold `empty` with `true`. Lookups stop at a truly vacant slot, skip
//! tombstones, and remember the first tombstone as the insertion candidate.
//! `count` includes tombstones; rehashing rebuilds without them.
//!
//! Each entry caches its key's 32-bit hash so rehashing, bulk copies, and
//! the GC's white-entry cull never need to reach back into the heap. The
//! caller supplies the hash for point operations (`hash_value` lives with
//! the heap, which owns string hashes).

use super::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
pub struct Entry {
    pub key: Value,
    pub value: Value,
    hash: u32,
}

impl Entry {
    fn vacant() -> Entry {
        Entry { key: Value::empty(), value: Value::nil(), hash: 0 }
    }

    #[inline]
    fn is_tombstone(&self) -> bool {
        self.key.is_empty() && !self.value.is_nil()
    }
}

#[derive(Clone, Default)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table { count: 0, entries: Vec::new() }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Live entries plus tombstones.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Live entries only.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.key.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_slot(entries: &[Entry], key: Value, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_empty() {
                if entry.value.is_nil() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key.equals(key) {
                return index;
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &self.entries[index];
        if entry.key.is_empty() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, key: Value, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.capacity() * MAX_LOAD_NUM {
            self.grow();
        }

        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_empty();
        // A reused tombstone was already counted.
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }
        *entry = Entry { key, value, hash };
        is_new
    }

    /// Remove a key by writing a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: Value, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_empty() {
            return false;
        }
        entry.key = Value::empty();
        entry.value = Value::boolean(true);
        entry.hash = 0;
        true
    }

    fn grow(&mut self) {
        let capacity = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
        let mut entries = vec![Entry::vacant(); capacity];
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_empty() {
                continue;
            }
            let index = Self::find_slot(&entries, entry.key, entry.hash);
            entries[index] = *entry;
            self.count += 1;
        }
        self.entries = entries;
    }

    /// Copy every live entry of `from` into `to`.
    pub fn add_all(from: &Table, to: &mut Table) {
        for entry in &from.entries {
            if !entry.key.is_empty() {
                to.set(entry.key, entry.hash, entry.value);
            }
        }
    }

    /// Iterate live entries as (key, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.key.is_empty())
            .map(|e| (e.key, e.value))
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Delete every entry whose key fails the predicate. Used on the string
    /// intern table to drop strings the collector did not mark.
    pub fn remove_white(&mut self, is_marked: impl Fn(Value) -> bool) {
        for entry in &mut self.entries {
            if !entry.key.is_empty() && !is_marked(entry.key) {
                entry.key = Value::empty();
                entry.value = Value::boolean(true);
                entry.hash = 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // Number keys are enough to exercise the probing logic; their hash can be
    // anything consistent, including a deliberately colliding one.
    fn num(n: f64) -> Value {
        Value::number(n)
    }

    #[test]
    fn set_and_get() {
        let mut t = Table::new();
        assert!(t.set(num(1.0), 1, num(10.0)));
        assert!(t.set(num(2.0), 2, num(20.0)));
        assert!(!t.set(num(1.0), 1, num(11.0)), "overwrite is not new");
        assert!(t.get(num(1.0), 1).unwrap().equals(num(11.0)));
        assert!(t.get(num(2.0), 2).unwrap().equals(num(20.0)));
        assert!(t.get(num(3.0), 3).is_none());
    }

    #[test]
    fn get_from_empty() {
        let t = Table::new();
        assert!(t.get(num(1.0), 1).is_none());
    }

    #[test]
    fn delete_leaves_tombstone_and_probe_continues() {
        let mut t = Table::new();
        // Force a collision chain: same hash, different keys.
        t.set(num(1.0), 7, num(1.0));
        t.set(num(2.0), 7, num(2.0));
        t.set(num(3.0), 7, num(3.0));
        assert!(t.delete(num(2.0), 7));
        // The entry past the tombstone must still be reachable.
        assert!(t.get(num(3.0), 7).unwrap().equals(num(3.0)));
        assert!(t.get(num(2.0), 7).is_none());
        assert!(!t.delete(num(2.0), 7));
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let mut t = Table::new();
        t.set(num(1.0), 5, num(1.0));
        t.set(num(2.0), 5, num(2.0));
        let count_before = t.count();
        t.delete(num(1.0), 5);
        assert_eq!(t.count(), count_before, "tombstones stay in the count");
        t.set(num(9.0), 5, num(9.0));
        assert_eq!(t.count(), count_before, "insert reused the tombstone");
        assert!(t.get(num(9.0), 5).unwrap().equals(num(9.0)));
        assert!(t.get(num(2.0), 5).unwrap().equals(num(2.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(num(i as f64), i as u32, num(i as f64 * 2.0));
        }
        assert!(t.capacity().is_power_of_two());
        assert!(t.capacity() >= 128);
        for i in 0..100 {
            assert!(t.get(num(i as f64), i as u32).unwrap().equals(num(i as f64 * 2.0)));
        }
    }

    #[test]
    fn rehash_drops_tombstones() {
        let mut t = Table::new();
        for i in 0..6 {
            t.set(num(i as f64), i as u32, num(0.0));
        }
        for i in 0..6 {
            t.delete(num(i as f64), i as u32);
        }
        // Refilling past the load factor rehashes; tombstones disappear.
        for i in 10..20 {
            t.set(num(i as f64), i as u32, num(0.0));
        }
        assert_eq!(t.len(), 10);
        assert!(t.count() >= 10);
    }

    #[test]
    fn iter_skips_vacant_and_tombstones() {
        let mut t = Table::new();
        t.set(num(1.0), 1, num(10.0));
        t.set(num(2.0), 2, num(20.0));
        t.delete(num(1.0), 1);
        let pairs: Vec<_> = t.iter().collect();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].0.equals(num(2.0)));
    }

    #[test]
    fn add_all_copies_live_entries() {
        let mut a = Table::new();
        a.set(num(1.0), 1, num(10.0));
        a.set(num(2.0), 2, num(20.0));
        a.delete(num(2.0), 2);
        let mut b = Table::new();
        b.set(num(3.0), 3, num(30.0));
        Table::add_all(&a, &mut b);
        assert!(b.get(num(1.0), 1).unwrap().equals(num(10.0)));
        assert!(b.get(num(2.0), 2).is_none());
        assert!(b.get(num(3.0), 3).unwrap().equals(num(30.0)));
    }

    #[test]
    fn remove_white_deletes_failing_keys() {
        let mut t = Table::new();
        t.set(num(1.0), 1, num(10.0));
        t.set(num(2.0), 2, num(20.0));
        t.remove_white(|k| k.equals(num(2.0)));
        assert!(t.get(num(1.0), 1).is_none());
        assert!(t.get(num(2.0), 2).unwrap().equals(num(20.0)));
    }
}
