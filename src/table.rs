// File: src/table.rs
//
// Open-addressed hash table keyed by interned strings.
// Backs both the string interner and the global environment. Linear
// probing, tombstone deletion, growth at 75% load. Keys are compared by
// handle identity; interning makes that equivalent to content equality.

use crate::object::{string_of, Obj, ObjHandle};
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

// An empty bucket has key None and value Nil; a tombstone has key None and
// value Bool(true).
#[derive(Debug, Clone, Copy)]
struct Bucket {
    key: Option<ObjHandle>,
    value: Value,
}

const EMPTY: Bucket = Bucket { key: None, value: Value::Nil };

#[derive(Debug)]
pub struct Table {
    count: usize,
    buckets: Vec<Bucket>,
}

impl Table {
    pub fn new() -> Table {
        Table { count: 0, buckets: Vec::new() }
    }

    /// Probe for `key`'s bucket: either the bucket holding it, or the slot
    /// an insertion should land on (the first tombstone seen, if any,
    /// otherwise the first truly empty bucket).
    fn find_bucket(buckets: &[Bucket], objects: &[Obj], key: ObjHandle) -> usize {
        let capacity = buckets.len();
        let mut index = string_of(objects, key).hash as usize % capacity;
        let mut tombstone = None;
        loop {
            let bucket = &buckets[index];
            match bucket.key {
                None => {
                    if matches!(bucket.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Insert or overwrite. Returns true when the key was not present
    /// before the call.
    pub fn set(&mut self, objects: &[Obj], key: ObjHandle, value: Value) -> bool {
        if (self.count + 1) as f64 > self.buckets.len() as f64 * TABLE_MAX_LOAD {
            self.grow(objects);
        }

        let index = Self::find_bucket(&self.buckets, objects, key);
        let bucket = &mut self.buckets[index];
        let is_new = bucket.key.is_none();
        // Landing on a tombstone reuses a slot already counted.
        if is_new && matches!(bucket.value, Value::Nil) {
            self.count += 1;
        }
        bucket.key = Some(key);
        bucket.value = value;
        is_new
    }

    pub fn get(&self, objects: &[Obj], key: ObjHandle) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let index = Self::find_bucket(&self.buckets, objects, key);
        let bucket = &self.buckets[index];
        bucket.key.map(|_| bucket.value)
    }

    /// Remove a key, leaving a tombstone so probe chains stay intact.
    pub fn delete(&mut self, objects: &[Obj], key: ObjHandle) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        let index = Self::find_bucket(&self.buckets, objects, key);
        let bucket = &mut self.buckets[index];
        if bucket.key.is_none() {
            return false;
        }
        bucket.key = None;
        bucket.value = Value::Bool(true);
        true
    }

    /// Content-based probe used by the interner, before a string has a
    /// handle of its own. Matches on length, hash and bytes.
    pub fn find_string(&self, objects: &[Obj], chars: &str, hash: u32) -> Option<ObjHandle> {
        if self.buckets.is_empty() {
            return None;
        }
        let capacity = self.buckets.len();
        let mut index = hash as usize % capacity;
        loop {
            let bucket = &self.buckets[index];
            match bucket.key {
                None => {
                    if matches!(bucket.value, Value::Nil) {
                        return None;
                    }
                    // Tombstone: keep probing.
                }
                Some(key) => {
                    let s = string_of(objects, key);
                    if s.chars.len() == chars.len() && s.hash == hash && s.chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjHandle, Value)> + '_ {
        self.buckets.iter().filter_map(|bucket| bucket.key.map(|key| (key, bucket.value)))
    }

    fn grow(&mut self, objects: &[Obj]) {
        let capacity = if self.buckets.len() < 8 { 8 } else { self.buckets.len() * 2 };
        let old = std::mem::replace(&mut self.buckets, vec![EMPTY; capacity]);

        // Tombstones are dropped on the way over, so recount.
        self.count = 0;
        for bucket in old {
            if let Some(key) = bucket.key {
                let index = Self::find_bucket(&self.buckets, objects, key);
                self.buckets[index] = Bucket { key: Some(key), value: bucket.value };
                self.count += 1;
            }
        }
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}
