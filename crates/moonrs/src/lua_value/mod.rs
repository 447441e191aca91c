// Value model: tagged values, strings, tables, prototypes, closures,
// userdata, and the binary chunk serializer.

mod chunk_serializer;
mod closure;
mod lua_string;
mod proto;
mod table;
mod userdata;
mod value;

pub use chunk_serializer::{dump_proto, undump_proto, BINARY_SIGNATURE};
pub use closure::{Closure, HostClosure, LuaClosure, Upvalue};
pub use lua_string::LuaStr;
pub use proto::{LocVar, Proto, UpvalDesc};
pub use table::{key_equal, normalize_key, StrPool, Table, TableError};
pub use userdata::Userdata;
pub use value::{float_to_int, fmt_float, fmt_int, Value, ValueKind};
