// Immutable byte string. Short strings are interned by the pool and carry
// their hash from creation; long strings hash lazily on first use as a
// table key, so identical long strings may keep distinct identities until
// then.

use std::cell::Cell;

pub struct LuaStr {
    bytes: Box<[u8]>,
    hash: Cell<Option<u64>>,
    short: bool,
}

impl LuaStr {
    pub fn new_short(bytes: Box<[u8]>, hash: u64) -> Self {
        LuaStr {
            bytes,
            hash: Cell::new(Some(hash)),
            short: true,
        }
    }

    pub fn new_long(bytes: Box<[u8]>) -> Self {
        LuaStr {
            bytes,
            hash: Cell::new(None),
            short: false,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// UTF-8 view; Lua strings are byte strings, so this can fail.
    #[inline(always)]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn to_display_string(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn is_short(&self) -> bool {
        self.short
    }

    /// Hash, computing and caching it for long strings.
    pub fn hash(&self, seed: &ahash::RandomState) -> u64 {
        match self.hash.get() {
            Some(h) => h,
            None => {
                let h = seed.hash_one(&self.bytes);
                self.hash.set(Some(h));
                h
            }
        }
    }

    /// Hash if it has already been computed.
    #[inline(always)]
    pub fn cached_hash(&self) -> Option<u64> {
        self.hash.get()
    }

    /// Approximate heap footprint for GC accounting.
    #[inline(always)]
    pub fn gc_size(&self) -> usize {
        std::mem::size_of::<LuaStr>() + self.bytes.len()
    }
}

impl std::fmt::Debug for LuaStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.bytes))
    }
}
