// Typed handles into the per-type arenas of the object pool.
// A Value stores one of these instead of a pointer; the pool owns the data.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpvalId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

/// A reference to any collectable object, used by the collector's work lists
/// and by the write barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRef {
    Str(StrId),
    Table(TableId),
    Func(FuncId),
    Upval(UpvalId),
    Ud(UdId),
    Thread(ThreadId),
}
