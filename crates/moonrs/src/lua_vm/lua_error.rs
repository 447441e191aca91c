// Lightweight error kind, one byte. The error *object* (usually a string,
// but any value a script passed to error()) lives in the VM state so
// Results stay small; hosts retrieve it with `LuaVM::take_error_value` or
// `into_full_error`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Error raised while running (type error, arithmetic on a
    /// non-number, user error() call, ...).
    RuntimeError,
    /// Compile failure; the message carries chunkname:line.
    SyntaxError,
    /// Allocation limit hit.
    OutOfMemory,
    /// Value-stack or call-depth limit hit.
    StackOverflow,
    /// A __gc finalizer raised.
    GcMetamethodError,
    /// The message handler of a protected call itself raised.
    ErrorInErrorHandler,
    /// Not an error: a coroutine yielded and is unwinding to its resume
    /// point.
    Yield,
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LuaError::RuntimeError => "runtime error",
            LuaError::SyntaxError => "syntax error",
            LuaError::OutOfMemory => "not enough memory",
            LuaError::StackOverflow => "stack overflow",
            LuaError::GcMetamethodError => "error in __gc metamethod",
            LuaError::ErrorInErrorHandler => "error in error handling",
            LuaError::Yield => "yield",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for LuaError {}

/// Error kind plus the rendered error message, for embedders that want a
/// `std::error::Error` with the whole story.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LuaFullError {}
