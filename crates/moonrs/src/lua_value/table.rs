// Hybrid array + hash container.
//
// The array part holds integer keys 1..=n contiguously. The hash part is a
// power-of-two vector of nodes resolved with Brent's variation: every key
// is reachable from its main position, and a colliding resident that is
// *not* in its own main position gets displaced to a free slot. Each node
// stores a signed offset to the next node of its chain (0 = end of chain).
//
// Writing nil is deletion: the slot keeps its key until the next rehash so
// chains stay intact, but lookups and iteration treat it as absent.

use crate::gc::{Arena, StrId, TableId};
use crate::lua_value::lua_string::LuaStr;
use crate::lua_value::value::{Value, float_to_int};

/// Narrow view of the string arena, so table operations can hash and
/// compare string keys while the table itself is mutably borrowed from the
/// pool.
pub struct StrPool<'a> {
    pub arena: &'a Arena<LuaStr>,
    pub seed: &'a ahash::RandomState,
}

impl<'a> StrPool<'a> {
    #[inline(always)]
    pub fn hash(&self, id: StrId) -> u64 {
        self.arena.get(id.0).expect("string id").hash(self.seed)
    }

    #[inline(always)]
    pub fn bytes(&self, id: StrId) -> &[u8] {
        self.arena.get(id.0).expect("string id").as_bytes()
    }
}

/// Key equality as used by the hash part: mathematical equality for
/// numbers, content equality for strings, identity otherwise.
pub fn key_equal(a: &Value, b: &Value, strs: &StrPool) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::LightPtr(x), Value::LightPtr(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y || strs.bytes(*x) == strs.bytes(*y),
        (Value::Table(x), Value::Table(y)) => x == y,
        (Value::Func(x), Value::Func(y)) => x == y,
        (Value::UserData(x), Value::UserData(y)) => x == y,
        (Value::Thread(x), Value::Thread(y)) => x == y,
        _ => false,
    }
}

/// Keys are normalized before hashing: a float with an exact integer value
/// is the same key as that integer, and -0.0 folds onto 0.
#[inline(always)]
pub fn normalize_key(key: Value) -> Value {
    if let Value::Float(f) = key {
        if let Some(i) = float_to_int(f) {
            return Value::Int(i);
        }
    }
    key
}

fn key_hash(key: &Value, strs: &StrPool) -> u64 {
    match key {
        Value::Nil => 0,
        Value::Bool(b) => {
            if *b {
                0x9e37_79b9_7f4a_7c15
            } else {
                0x2545_f491_4f6c_dd1d
            }
        }
        Value::Int(i) => strs.seed.hash_one(*i),
        Value::Float(f) => strs.seed.hash_one(f.to_bits()),
        Value::LightPtr(p) => strs.seed.hash_one(*p),
        Value::Str(id) => strs.hash(*id),
        Value::Table(id) => strs.seed.hash_one((5u8, id.0)),
        Value::Func(id) => strs.seed.hash_one((6u8, id.0)),
        Value::UserData(id) => strs.seed.hash_one((7u8, id.0)),
        Value::Thread(id) => strs.seed.hash_one((8u8, id.0)),
    }
}

#[derive(Clone, Copy)]
struct Node {
    key: Value,
    value: Value,
    /// Signed offset to the next node in this key's chain; 0 ends it.
    next: i32,
}

const EMPTY_NODE: Node = Node {
    key: Value::Nil,
    value: Value::Nil,
    next: 0,
};

pub struct Table {
    array: Vec<Value>,
    nodes: Vec<Node>,
    /// One past the last slot that may still be free; free-slot search
    /// walks downward from here.
    lastfree: usize,
    pub(crate) metatable: Option<TableId>,
    /// Cache of "metamethod known absent" bits, cleared on any write.
    pub(crate) flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    NilKey,
    NanKey,
    InvalidNextKey,
}

impl Table {
    pub fn new(asize: usize, hsize: usize) -> Self {
        let nsize = if hsize == 0 {
            0
        } else {
            hsize.next_power_of_two()
        };
        Table {
            array: vec![Value::Nil; asize],
            nodes: vec![EMPTY_NODE; nsize],
            lastfree: nsize,
            metatable: None,
            flags: 0,
        }
    }

    #[inline(always)]
    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    pub fn set_metatable(&mut self, mt: Option<TableId>) {
        self.metatable = mt;
        self.flags = 0;
    }

    #[inline(always)]
    fn main_position(&self, key: &Value, strs: &StrPool) -> usize {
        debug_assert!(!self.nodes.is_empty());
        (key_hash(key, strs) as usize) & (self.nodes.len() - 1)
    }

    fn hash_find(&self, key: &Value, strs: &StrPool) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut pos = self.main_position(key, strs);
        loop {
            let node = &self.nodes[pos];
            if key_equal(&node.key, key, strs) {
                return Some(pos);
            }
            if node.next == 0 {
                return None;
            }
            pos = (pos as i64 + node.next as i64) as usize;
        }
    }

    pub fn get_int(&self, i: i64, strs: &StrPool) -> Value {
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            return self.array[(i - 1) as usize];
        }
        match self.hash_find(&Value::Int(i), strs) {
            Some(pos) => self.nodes[pos].value,
            None => Value::Nil,
        }
    }

    pub fn get(&self, key: &Value, strs: &StrPool) -> Value {
        let key = normalize_key(*key);
        match key {
            Value::Nil => Value::Nil,
            Value::Int(i) => self.get_int(i, strs),
            _ => match self.hash_find(&key, strs) {
                Some(pos) => self.nodes[pos].value,
                None => Value::Nil,
            },
        }
    }

    pub fn set_int(&mut self, i: i64, value: Value, strs: &StrPool) {
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            self.array[(i - 1) as usize] = value;
        } else {
            self.hash_set(Value::Int(i), value, strs);
        }
        self.flags = 0;
    }

    pub fn set(&mut self, key: Value, value: Value, strs: &StrPool) -> Result<(), TableError> {
        let key = normalize_key(key);
        match key {
            Value::Nil => return Err(TableError::NilKey),
            Value::Float(f) if f.is_nan() => return Err(TableError::NanKey),
            Value::Int(i) => self.set_int(i, value, strs),
            _ => {
                self.hash_set(key, value, strs);
                self.flags = 0;
            }
        }
        Ok(())
    }

    fn hash_set(&mut self, key: Value, value: Value, strs: &StrPool) {
        if let Some(pos) = self.hash_find(&key, strs) {
            self.nodes[pos].value = value;
            return;
        }
        if value.is_nil() {
            // Deleting an absent key is a no-op.
            return;
        }
        self.insert_new_key(key, value, strs);
    }

    fn free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.nodes[self.lastfree].key.is_nil() {
                return Some(self.lastfree);
            }
        }
        None
    }

    fn insert_new_key(&mut self, key: Value, value: Value, strs: &StrPool) {
        if self.nodes.is_empty() {
            self.rehash(&key, strs);
            // The key may now belong in the grown array part.
            self.set_resolved(key, value, strs);
            return;
        }
        let mut mp = self.main_position(&key, strs);
        if !self.nodes[mp].key.is_nil() {
            let Some(f) = self.free_pos() else {
                self.rehash(&key, strs);
                self.set_resolved(key, value, strs);
                return;
            };
            let colliding = self.nodes[mp];
            let othern = self.main_position(&colliding.key, strs);
            if othern != mp {
                // The resident is not in its main position: displace it to
                // the free slot and take its place.
                let mut prev = othern;
                loop {
                    let next = self.nodes[prev].next;
                    debug_assert!(next != 0);
                    let target = (prev as i64 + next as i64) as usize;
                    if target == mp {
                        break;
                    }
                    prev = target;
                }
                self.nodes[prev].next = (f as i64 - prev as i64) as i32;
                self.nodes[f] = colliding;
                if colliding.next != 0 {
                    let abs = (mp as i64 + colliding.next as i64) as usize;
                    self.nodes[f].next = (abs as i64 - f as i64) as i32;
                }
                self.nodes[mp] = Node {
                    key,
                    value,
                    next: 0,
                };
                return;
            }
            // The resident owns this main position: the new key goes to the
            // free slot, chained right after it.
            if self.nodes[mp].next != 0 {
                let abs = (mp as i64 + self.nodes[mp].next as i64) as usize;
                self.nodes[f].next = (abs as i64 - f as i64) as i32;
            } else {
                self.nodes[f].next = 0;
            }
            self.nodes[mp].next = (f as i64 - mp as i64) as i32;
            mp = f;
            self.nodes[mp].key = key;
            self.nodes[mp].value = value;
            return;
        }
        self.nodes[mp] = Node {
            key,
            value,
            next: 0,
        };
    }

    /// Re-dispatch a set after a rehash may have grown the array part.
    fn set_resolved(&mut self, key: Value, value: Value, strs: &StrPool) {
        if let Value::Int(i) = key {
            if i >= 1 && (i as u64) <= self.array.len() as u64 {
                self.array[(i - 1) as usize] = value;
                return;
            }
        }
        self.insert_new_key(key, value, strs);
    }

    /// Recompute the optimal split and rebuild both parts. The optimal
    /// array size is the largest n such that more than n/2 of the slots
    /// 1..=n are in use.
    fn rehash(&mut self, extra: &Value, strs: &StrPool) {
        let mut bins = [0usize; 64];
        let mut total_int = 0usize;
        let mut total_other = 0usize;

        let mut count_key = |k: &Value| match k {
            Value::Int(i) if *i >= 1 => {
                // Bin b counts keys in (2^(b-1), 2^b].
                let bin = 64 - ((*i as u64) - 1).leading_zeros() as usize;
                bins[bin] += 1;
                total_int += 1;
            }
            _ => total_other += 1,
        };

        for (idx, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                count_key(&Value::Int(idx as i64 + 1));
            }
        }
        for node in &self.nodes {
            if !node.key.is_nil() && !node.value.is_nil() {
                count_key(&node.key);
            }
        }
        count_key(extra);

        // Pick the array size from the bin counts.
        let mut asize = 0usize;
        let mut in_array = 0usize;
        let mut accum = 0usize;
        let mut two_to_i = 1usize;
        for bin in bins.iter().take(40) {
            accum += bin;
            if accum > two_to_i / 2 {
                asize = two_to_i;
                in_array = accum;
            }
            if accum == total_int {
                break;
            }
            two_to_i = match two_to_i.checked_mul(2) {
                Some(n) => n,
                None => break,
            };
        }
        let nhash = total_other + (total_int - in_array) + 1;

        let old_array = std::mem::take(&mut self.array);
        let old_nodes = std::mem::take(&mut self.nodes);
        self.array = vec![Value::Nil; asize];
        let nsize = nhash.next_power_of_two();
        self.nodes = vec![EMPTY_NODE; nsize];
        self.lastfree = nsize;

        for (idx, v) in old_array.into_iter().enumerate() {
            if !v.is_nil() {
                self.set_resolved(Value::Int(idx as i64 + 1), v, strs);
            }
        }
        for node in old_nodes {
            if !node.key.is_nil() && !node.value.is_nil() {
                self.set_resolved(node.key, node.value, strs);
            }
        }
    }

    /// A border: n with t[n] non-nil and t[n+1] nil.
    pub fn length(&self, strs: &StrPool) -> i64 {
        let alen = self.array.len();
        if alen > 0 && self.array[alen - 1].is_nil() {
            // Binary search inside the array part.
            let mut i = 0usize;
            let mut j = alen;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as i64;
        }
        if self.nodes.is_empty() {
            return alen as i64;
        }
        self.unbound_search(alen as i64, strs)
    }

    fn unbound_search(&self, start: i64, strs: &StrPool) -> i64 {
        let mut i = start;
        let mut j = start.saturating_add(1);
        while !self.get_int(j, strs).is_nil() {
            i = j;
            if j > i64::MAX / 2 {
                // Pathological table; fall back to a linear scan.
                let mut k = 1;
                while !self.get_int(k, strs).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m, strs).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    /// Iteration order: array part first, then hash nodes. A nil input key
    /// starts the traversal; an unknown key is an error.
    pub fn next(
        &self,
        key: &Value,
        strs: &StrPool,
    ) -> Result<Option<(Value, Value)>, TableError> {
        let start = match normalize_key(*key) {
            Value::Nil => 0,
            k => {
                let idx = match k {
                    Value::Int(i) if i >= 1 && (i as u64) <= self.array.len() as u64 => {
                        i as usize - 1
                    }
                    _ => {
                        let pos = self
                            .hash_find(&k, strs)
                            .ok_or(TableError::InvalidNextKey)?;
                        self.array.len() + pos
                    }
                };
                idx + 1
            }
        };
        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((Value::Int(i as i64 + 1), self.array[i])));
            }
        }
        let nstart = start.saturating_sub(self.array.len());
        for pos in nstart..self.nodes.len() {
            let node = &self.nodes[pos];
            if !node.key.is_nil() && !node.value.is_nil() {
                return Ok(Some((node.key, node.value)));
            }
        }
        Ok(None)
    }

    /// Live entries for the collector's traversal.
    pub fn gc_entries(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::new();
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((Value::Int(i as i64 + 1), *v));
            }
        }
        for node in &self.nodes {
            if !node.key.is_nil() && !node.value.is_nil() {
                out.push((node.key, node.value));
            }
        }
        out
    }

    /// Drop entries whose weak side died, called at the collector's atomic
    /// point. Array keys are integers, so only values can be weak there.
    pub fn clear_weak_entries<F>(&mut self, weak_keys: bool, weak_values: bool, mut is_dead: F)
    where
        F: FnMut(&Value) -> bool,
    {
        if weak_values {
            for v in self.array.iter_mut() {
                if !v.is_nil() && is_dead(v) {
                    *v = Value::Nil;
                }
            }
        }
        for node in self.nodes.iter_mut() {
            if node.value.is_nil() {
                continue;
            }
            let dead = (weak_keys && is_dead(&node.key)) || (weak_values && is_dead(&node.value));
            if dead {
                node.value = Value::Nil;
            }
        }
    }

    /// Approximate heap footprint for GC accounting.
    pub fn gc_size(&self) -> usize {
        std::mem::size_of::<Table>()
            + self.array.len() * std::mem::size_of::<Value>()
            + self.nodes.len() * std::mem::size_of::<Node>()
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new(0, 0)
    }
}
