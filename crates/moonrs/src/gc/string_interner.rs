// Intern set for short strings: hash -> bucket of candidate ids. Equal
// bytes always resolve to the same id within one VM. The collector sweeps
// the buckets before the arenas so the map never points at freed slots.

use ahash::RandomState;
use std::collections::HashMap;

use crate::gc::gc_header::other_white;
use crate::gc::gc_id::StrId;
use crate::gc::object_pool::Arena;
use crate::lua_value::LuaStr;

pub struct StringInterner {
    map: HashMap<u64, Vec<StrId>, RandomState>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
        }
    }

    /// Find a live interned string with these bytes. Strings condemned for
    /// the cycle being swept (other-white) are skipped; the caller
    /// resurrects a found current-white string.
    pub fn find(
        &self,
        hash: u64,
        bytes: &[u8],
        strings: &Arena<LuaStr>,
        current_white: u8,
    ) -> Option<StrId> {
        let bucket = self.map.get(&hash)?;
        let ow = other_white(current_white);
        for &id in bucket {
            let Some(header) = strings.header(id.0) else {
                continue;
            };
            if header.is_dead(ow) {
                continue;
            }
            if strings.get(id.0).map(|s| s.as_bytes()) == Some(bytes) {
                return Some(id);
            }
        }
        None
    }

    pub fn insert(&mut self, hash: u64, id: StrId) {
        self.map.entry(hash).or_default().push(id);
    }

    /// Bucket keys snapshot for the sweep-string phase.
    pub fn bucket_keys(&self) -> Vec<u64> {
        self.map.keys().copied().collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.map.len()
    }

    /// Drop dead ids from one bucket, returning them for arena disposal.
    pub fn sweep_bucket(
        &mut self,
        hash: u64,
        strings: &Arena<LuaStr>,
        current_white: u8,
    ) -> Vec<StrId> {
        let ow = other_white(current_white);
        let mut dead = Vec::new();
        if let Some(bucket) = self.map.get_mut(&hash) {
            bucket.retain(|&id| match strings.header(id.0) {
                Some(h) if !h.is_dead(ow) => true,
                _ => {
                    dead.push(id);
                    false
                }
            });
            if bucket.is_empty() {
                self.map.remove(&hash);
            }
        }
        dead
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        StringInterner::new()
    }
}
