//! Runtime exception machinery.
//!
//! The VM uses its own try-frame discipline on the value stack rather than
//! host-language unwinding: `BEGIN_TRY` pushes a frame recording the catch
//! target, `THROW` searches the stack downward for the nearest frame. These
//! types carry exception payloads between the dispatcher, natives, and the
//! host boundary.

use strum::IntoStaticStr;

use crate::vm::value::Value;

/// Well-known runtime exception categories; each renders a message carried
/// by the thrown string value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ExceptionKind {
    DivisionByZero,
    InvalidOperation,
    InvalidComparison,
    OutOfBounds,
    MemberNotFound,
    NotAFunction,
    WrongArgumentCount,
    HeapOverflow,
    StackOverflow,
}

impl ExceptionKind {
    /// The message text thrown for this kind, before formatting arguments.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::DivisionByZero => "division by zero",
            Self::InvalidOperation => "invalid operation",
            Self::InvalidComparison => "cannot compare these values",
            Self::OutOfBounds => "index out of bounds",
            Self::MemberNotFound => "member not found",
            Self::NotAFunction => "value is not callable",
            Self::WrongArgumentCount => "wrong number of arguments",
            Self::HeapOverflow => "heap overflow",
            Self::StackOverflow => "stack overflow",
        }
    }
}

/// Error type returned by native functions.
#[derive(Debug)]
pub enum NativeError {
    /// Throw a fresh exception carrying this message.
    Throw(String),
    /// Propagate an in-flight exception value that crossed back out of a
    /// nested bytecode invocation.
    Rethrow(Value),
}

impl NativeError {
    /// Convenience constructor for message throws.
    #[must_use]
    pub fn throw(kind: ExceptionKind, detail: &str) -> Self {
        if detail.is_empty() {
            Self::Throw(kind.message().to_owned())
        } else {
            Self::Throw(format!("{}: {detail}", kind.message()))
        }
    }
}

/// Result alias for native function bodies.
pub type NativeResult = Result<Value, NativeError>;

/// Where an unwind ended up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Unwind {
    /// A try frame caught the exception; execution continues at this code
    /// position with the exception value in register 0.
    Caught { catch_addr: u32 },
    /// The unwind crossed a host-invocation boundary; the pending exception
    /// propagates through the native that started the invocation.
    HostBoundary { value: Value },
    /// No try frame anywhere on the thread's stack.
    Unhandled { value: Value },
}
