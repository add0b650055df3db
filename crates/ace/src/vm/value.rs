//! Tagged stack values.
//!
//! A [`Value`] is a small `Copy` union: immediates are stored inline and
//! heap data is referenced through a [`HeapId`]. The integer types form a
//! widening lattice `I32 < I64 < F32 < F64` used for binary-arithmetic
//! coercion.

use crate::{emit::static_object::FunctionFlags, vm::heap::HeapId};

/// One slot of a thread's stack or register file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Null,
    HeapPtr(HeapId),
    Function {
        addr: u32,
        nargs: u8,
        flags: FunctionFlags,
    },
    /// Index into the native-function registry.
    NativeFunction(u32),
    /// A raw code address, loaded from a label static.
    Address(u32),
    /// Pushed by `CALL`; `RET` pops back to it.
    CallFrame {
        return_addr: u32,
        args_to_pop: u8,
    },
    /// Pushed by `BEGIN_TRY`; records the catch target for unwinding.
    TryFrame {
        catch_addr: u32,
    },
}

/// Position in the numeric widening lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NumericRank {
    I32,
    I64,
    F32,
    F64,
}

impl Value {
    /// The value's rank in the numeric lattice, if numeric.
    #[must_use]
    pub fn numeric_rank(self) -> Option<NumericRank> {
        match self {
            Self::I32(_) => Some(NumericRank::I32),
            Self::I64(_) => Some(NumericRank::I64),
            Self::F32(_) => Some(NumericRank::F32),
            Self::F64(_) => Some(NumericRank::F64),
            _ => None,
        }
    }

    /// Reads an integer value, widening `I32` to `i64`.
    #[must_use]
    pub fn as_integer(self) -> Option<i64> {
        match self {
            Self::I32(v) => Some(i64::from(v)),
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Reads any numeric value as `f64`.
    #[must_use]
    pub fn as_number(self) -> Option<f64> {
        match self {
            Self::I32(v) => Some(f64::from(v)),
            Self::I64(v) => Some(v as f64),
            Self::F32(v) => Some(f64::from(v)),
            Self::F64(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_heap(self) -> Option<HeapId> {
        match self {
            Self::HeapPtr(id) => Some(id),
            _ => None,
        }
    }

    /// A short name for diagnostics; heap values refine this through the
    /// cell's own kind name.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::I32(_) => "Int",
            Self::I64(_) => "Int64",
            Self::F32(_) => "Float32",
            Self::F64(_) => "Float",
            Self::Bool(_) => "Boolean",
            Self::Null => "Null",
            Self::HeapPtr(_) => "Object",
            Self::Function { .. } => "Function",
            Self::NativeFunction(_) => "NativeFunction",
            Self::Address(_) => "Address",
            Self::CallFrame { .. } => "FunctionCall",
            Self::TryFrame { .. } => "TryCatchInfo",
        }
    }
}

/// Formats a float the way `ECHO` prints it: shortest round-trip form.
#[must_use]
pub fn format_float(v: f64) -> String {
    if v.is_finite() {
        let mut buffer = ryu::Buffer::new();
        let formatted = buffer.format(v);
        // ryu prints integral floats as "1.0"; keep that form.
        formatted.to_owned()
    } else if v.is_nan() {
        "nan".to_owned()
    } else if v > 0.0 {
        "inf".to_owned()
    } else {
        "-inf".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_is_ordered() {
        assert!(NumericRank::I32 < NumericRank::I64);
        assert!(NumericRank::I64 < NumericRank::F32);
        assert!(NumericRank::F32 < NumericRank::F64);
    }

    #[test]
    fn integer_widening() {
        assert_eq!(Value::I32(7).as_integer(), Some(7));
        assert_eq!(Value::I64(1 << 40).as_integer(), Some(1 << 40));
        assert_eq!(Value::F64(1.0).as_integer(), None);
        assert_eq!(Value::I32(3).as_number(), Some(3.0));
    }

    #[test]
    fn float_formatting() {
        assert_eq!(format_float(2.5), "2.5");
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(f64::NAN), "nan");
    }
}
