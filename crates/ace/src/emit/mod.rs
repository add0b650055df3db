//! Bytecode emission: the Buildable IR, the static-object table, and the
//! emitter that lowers the analyzed AST through them into a flat code
//! section.

pub use buildable::{Buildable, Chunk, JumpKind, LabelId, RawOperand, RawOperation, StorageOp};
pub use emitter::Emitter;
pub use static_object::{FunctionFlags, StaticObject, StaticObjectId, StaticObjectTable, StaticTypeInfo};

pub mod buildable;
pub mod emitter;
pub mod static_object;
