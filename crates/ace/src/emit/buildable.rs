//! Composable bytecode IR.
//!
//! A [`Buildable`] reports its encoded byte size without lowering, which
//! makes label resolution a pure two-pass affair: `resolve` walks the tree
//! accumulating offsets and records each label marker's absolute position
//! (and patches function/label statics), then `build` walks again writing
//! bytes, with every jump target already known. No back-patching.
//!
//! A [`Chunk`] owns the label table its children reference; label ids are
//! opaque and locally valid inside the enclosing chunk.

use smallvec::SmallVec;

use crate::{
    bytecode::Opcode,
    emit::static_object::{StaticObjectId, StaticObjectTable},
};

/// Opaque label id, valid inside the chunk that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(pub u32);

/// A label's resolved position, absolute within the program.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelInfo {
    pub position: Option<u32>,
}

/// Jump conditions, keyed to the comparison flags register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Unconditional,
    IfEqual,
    IfNotEqual,
    IfGreater,
    IfGreaterEqual,
}

impl JumpKind {
    #[must_use]
    pub fn opcode(self) -> Opcode {
        match self {
            Self::Unconditional => Opcode::Jmp,
            Self::IfEqual => Opcode::Je,
            Self::IfNotEqual => Opcode::Jne,
            Self::IfGreater => Opcode::Jg,
            Self::IfGreaterEqual => Opcode::Jge,
        }
    }
}

/// A load or store between a register and one of the storage surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    /// Local slots address from the top of the stack.
    LoadLocal { dst: u8, offset: u16 },
    StoreLocal { offset: u16, src: u8 },
    LoadStatic { dst: u8, id: StaticObjectId },
    LoadMember { dst: u8, object: u8, index: u8 },
    StoreMember { object: u8, index: u8, src: u8 },
    LoadMemberHash { dst: u8, object: u8, hash: u32 },
    StoreMemberHash { object: u8, hash: u32, src: u8 },
    LoadArrayIndex { dst: u8, array: u8, index: u8 },
    StoreArrayIndex { array: u8, index: u8, src: u8 },
}

impl StorageOp {
    #[must_use]
    fn opcode(self) -> Opcode {
        match self {
            Self::LoadLocal { .. } => Opcode::LoadLocal,
            Self::StoreLocal { .. } => Opcode::MovLocal,
            Self::LoadStatic { .. } => Opcode::LoadStatic,
            Self::LoadMember { .. } => Opcode::LoadMem,
            Self::StoreMember { .. } => Opcode::MovMem,
            Self::LoadMemberHash { .. } => Opcode::LoadMemHash,
            Self::StoreMemberHash { .. } => Opcode::MovMemHash,
            Self::LoadArrayIndex { .. } => Opcode::LoadArrayIdx,
            Self::StoreArrayIndex { .. } => Opcode::MovArrayIdx,
        }
    }

    fn write(self, buf: &mut Vec<u8>) {
        buf.push(self.opcode().into());
        match self {
            Self::LoadLocal { dst, offset } => {
                buf.push(dst);
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Self::StoreLocal { offset, src } => {
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.push(src);
            }
            Self::LoadStatic { dst, id } => {
                buf.push(dst);
                buf.extend_from_slice(&id.0.to_le_bytes());
            }
            Self::LoadMember { dst, object, index } => {
                buf.push(dst);
                buf.push(object);
                buf.push(index);
            }
            Self::StoreMember { object, index, src } => {
                buf.push(object);
                buf.push(index);
                buf.push(src);
            }
            Self::LoadMemberHash { dst, object, hash } => {
                buf.push(dst);
                buf.push(object);
                buf.extend_from_slice(&hash.to_le_bytes());
            }
            Self::StoreMemberHash { object, hash, src } => {
                buf.push(object);
                buf.extend_from_slice(&hash.to_le_bytes());
                buf.push(src);
            }
            Self::LoadArrayIndex { dst, array, index } => {
                buf.push(dst);
                buf.push(array);
                buf.push(index);
            }
            Self::StoreArrayIndex { array, index, src } => {
                buf.push(array);
                buf.push(index);
                buf.push(src);
            }
        }
    }
}

/// One operand of a raw operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawOperand {
    U8(u8),
    U16(u16),
    U32(u32),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl RawOperand {
    fn size(self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U32(_) | Self::I32(_) | Self::F32(_) => 4,
            Self::I64(_) | Self::F64(_) => 8,
        }
    }

    fn write(self, buf: &mut Vec<u8>) {
        match self {
            Self::U8(v) => buf.push(v),
            Self::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Self::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Self::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Self::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Self::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Self::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// Variadic-operand escape hatch for opcodes not otherwise modelled.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOperation {
    pub opcode: Opcode,
    pub operands: SmallVec<[RawOperand; 4]>,
}

/// An IR node that can report its byte size and lower itself into a buffer.
#[derive(Debug)]
pub enum Buildable {
    Chunk(Chunk),
    /// Records the current position into the enclosing chunk's label table;
    /// optionally patches a static function/label entry with that position.
    LabelMarker {
        label: LabelId,
        static_fixup: Option<StaticObjectId>,
    },
    Jump {
        kind: JumpKind,
        label: LabelId,
    },
    /// Two-register compare writing the flags register.
    Comparison {
        lhs: u8,
        rhs: u8,
    },
    Storage(StorageOp),
    FunctionCall {
        func: u8,
        nargs: u8,
    },
    Return,
    /// Pushes a register, creating a new local slot.
    StoreNewLocal {
        src: u8,
    },
    /// Pops local slots at scope exit.
    PopLocals {
        count: u16,
    },
    ConstI32 {
        dst: u8,
        value: i32,
    },
    ConstI64 {
        dst: u8,
        value: i64,
    },
    ConstF32 {
        dst: u8,
        value: f32,
    },
    ConstF64 {
        dst: u8,
        value: f64,
    },
    ConstBool {
        dst: u8,
        value: bool,
    },
    ConstNull {
        dst: u8,
    },
    BeginTry {
        catch_reg: u8,
    },
    EndTry,
    Raw(RawOperation),
}

impl Buildable {
    /// Encoded size in bytes, computable without lowering.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Chunk(chunk) => chunk.size(),
            Self::LabelMarker { .. } => 0,
            Self::Jump { .. } => Opcode::Jmp.encoded_size(),
            Self::Comparison { .. } => Opcode::Cmp.encoded_size(),
            Self::Storage(op) => op.opcode().encoded_size(),
            Self::FunctionCall { .. } => Opcode::Call.encoded_size(),
            Self::Return => Opcode::Ret.encoded_size(),
            Self::StoreNewLocal { .. } => Opcode::Push.encoded_size(),
            Self::PopLocals { count } => match count {
                0 => 0,
                1 => Opcode::Pop.encoded_size(),
                _ => Opcode::PopN.encoded_size(),
            },
            Self::ConstI32 { .. } => Opcode::LoadI32.encoded_size(),
            Self::ConstI64 { .. } => Opcode::LoadI64.encoded_size(),
            Self::ConstF32 { .. } => Opcode::LoadF32.encoded_size(),
            Self::ConstF64 { .. } => Opcode::LoadF64.encoded_size(),
            Self::ConstBool { .. } => Opcode::LoadTrue.encoded_size(),
            Self::ConstNull { .. } => Opcode::LoadNull.encoded_size(),
            Self::BeginTry { .. } => Opcode::BeginTry.encoded_size(),
            Self::EndTry => Opcode::EndTry.encoded_size(),
            Self::Raw(raw) => 1 + raw.operands.iter().map(|o| o.size()).sum::<usize>(),
        }
    }
}

/// A Buildable container owning its own label table.
#[derive(Debug, Default)]
pub struct Chunk {
    buildables: Vec<Buildable>,
    labels: Vec<LabelInfo>,
    chunk_size: usize,
}

impl Chunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a child, aggregating its size.
    pub fn append(&mut self, buildable: Buildable) {
        self.chunk_size += buildable.size();
        self.buildables.push(buildable);
    }

    /// Allocates a fresh label in this chunk's table.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(u32::try_from(self.labels.len()).expect("label table fits u32"));
        self.labels.push(LabelInfo::default());
        id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn label_position(&self, label: LabelId) -> Option<u32> {
        self.labels.get(label.0 as usize).and_then(|info| info.position)
    }

    /// First pass: records every label marker's absolute position and
    /// patches static entries that reference code positions. Child chunks
    /// resolve recursively against their own tables.
    pub fn resolve(&mut self, block_offset: u32, statics: &mut StaticObjectTable) {
        let mut local_offset = 0u32;
        for buildable in &mut self.buildables {
            match buildable {
                Buildable::Chunk(child) => child.resolve(block_offset + local_offset, statics),
                Buildable::LabelMarker { label, static_fixup } => {
                    let position = block_offset + local_offset;
                    let info = self
                        .labels
                        .get_mut(label.0 as usize)
                        .expect("label marker references an owned label");
                    assert!(info.position.is_none(), "a label's position is written exactly once");
                    info.position = Some(position);
                    if let Some(id) = static_fixup {
                        statics.patch_position(*id, position);
                    }
                }
                _ => {}
            }
            local_offset += u32::try_from(buildable.size()).expect("chunk size fits u32");
        }
    }

    /// Second pass: writes the final byte sequence. Every jump's label has a
    /// position by now; a jump referencing an unresolved or foreign label is
    /// an emitter invariant violation.
    pub fn build(&self, buf: &mut Vec<u8>) {
        for buildable in &self.buildables {
            match buildable {
                Buildable::Chunk(child) => child.build(buf),
                Buildable::LabelMarker { .. } => {}
                Buildable::Jump { kind, label } => {
                    let target = self
                        .label_position(*label)
                        .expect("jump references a resolved label in its enclosing chunk");
                    buf.push(kind.opcode().into());
                    buf.extend_from_slice(&target.to_le_bytes());
                }
                Buildable::Comparison { lhs, rhs } => {
                    buf.push(Opcode::Cmp.into());
                    buf.push(*lhs);
                    buf.push(*rhs);
                }
                Buildable::Storage(op) => op.write(buf),
                Buildable::FunctionCall { func, nargs } => {
                    buf.push(Opcode::Call.into());
                    buf.push(*func);
                    buf.push(*nargs);
                }
                Buildable::Return => buf.push(Opcode::Ret.into()),
                Buildable::StoreNewLocal { src } => {
                    buf.push(Opcode::Push.into());
                    buf.push(*src);
                }
                Buildable::PopLocals { count } => match count {
                    0 => {}
                    1 => buf.push(Opcode::Pop.into()),
                    n => {
                        buf.push(Opcode::PopN.into());
                        buf.push(u8::try_from(*n).expect("scope locals fit u8"));
                    }
                },
                Buildable::ConstI32 { dst, value } => {
                    buf.push(Opcode::LoadI32.into());
                    buf.push(*dst);
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                Buildable::ConstI64 { dst, value } => {
                    buf.push(Opcode::LoadI64.into());
                    buf.push(*dst);
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                Buildable::ConstF32 { dst, value } => {
                    buf.push(Opcode::LoadF32.into());
                    buf.push(*dst);
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                Buildable::ConstF64 { dst, value } => {
                    buf.push(Opcode::LoadF64.into());
                    buf.push(*dst);
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                Buildable::ConstBool { dst, value } => {
                    buf.push(if *value { Opcode::LoadTrue } else { Opcode::LoadFalse }.into());
                    buf.push(*dst);
                }
                Buildable::ConstNull { dst } => {
                    buf.push(Opcode::LoadNull.into());
                    buf.push(*dst);
                }
                Buildable::BeginTry { catch_reg } => {
                    buf.push(Opcode::BeginTry.into());
                    buf.push(*catch_reg);
                }
                Buildable::EndTry => buf.push(Opcode::EndTry.into()),
                Buildable::Raw(raw) => {
                    buf.push(raw.opcode.into());
                    for operand in &raw.operands {
                        operand.write(buf);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn chunk_aggregates_child_sizes() {
        let mut chunk = Chunk::new();
        chunk.append(Buildable::ConstI32 { dst: 0, value: 1 });
        chunk.append(Buildable::Return);
        assert_eq!(chunk.size(), Opcode::LoadI32.encoded_size() + Opcode::Ret.encoded_size());
    }

    #[test]
    fn label_markers_have_zero_size() {
        let mut chunk = Chunk::new();
        let label = chunk.new_label();
        chunk.append(Buildable::LabelMarker {
            label,
            static_fixup: None,
        });
        assert_eq!(chunk.size(), 0);
    }

    #[test]
    fn forward_jump_resolves_without_backpatching() {
        let mut statics = StaticObjectTable::new();
        let mut chunk = Chunk::new();
        let end = chunk.new_label();
        chunk.append(Buildable::Jump {
            kind: JumpKind::Unconditional,
            label: end,
        });
        chunk.append(Buildable::ConstNull { dst: 0 });
        chunk.append(Buildable::LabelMarker {
            label: end,
            static_fixup: None,
        });
        chunk.append(Buildable::Return);

        chunk.resolve(0, &mut statics);
        let mut buf = Vec::new();
        chunk.build(&mut buf);

        // JMP (5 bytes) + LOAD_NULL (2 bytes) puts the label at offset 7.
        assert_eq!(chunk.label_position(end), Some(7));
        assert_eq!(buf[0], u8::from(Opcode::Jmp));
        assert_eq!(u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 7);
        assert_eq!(buf.len(), chunk.size());
    }

    #[test]
    fn block_offset_shifts_label_positions() {
        let mut statics = StaticObjectTable::new();
        let mut chunk = Chunk::new();
        let here = chunk.new_label();
        chunk.append(Buildable::ConstNull { dst: 0 });
        chunk.append(Buildable::LabelMarker {
            label: here,
            static_fixup: None,
        });
        chunk.resolve(100, &mut statics);
        assert_eq!(chunk.label_position(here), Some(102));
    }

    #[test]
    fn label_marker_patches_function_static() {
        let mut statics = StaticObjectTable::new();
        let func = statics.register_function(1, crate::emit::static_object::FunctionFlags::empty());
        let mut chunk = Chunk::new();
        let entry = chunk.new_label();
        chunk.append(Buildable::ConstNull { dst: 0 });
        chunk.append(Buildable::LabelMarker {
            label: entry,
            static_fixup: Some(func),
        });
        chunk.append(Buildable::Return);
        chunk.resolve(0, &mut statics);
        let crate::emit::static_object::StaticObject::Function(f) = statics.get(func) else {
            panic!("expected function static");
        };
        assert_eq!(f.addr, 2);
    }

    #[test]
    fn build_length_matches_reported_size() {
        let mut statics = StaticObjectTable::new();
        let mut chunk = Chunk::new();
        chunk.append(Buildable::Storage(StorageOp::LoadLocal { dst: 1, offset: 3 }));
        chunk.append(Buildable::Storage(StorageOp::LoadMemberHash {
            dst: 0,
            object: 1,
            hash: 0xdead_beef,
        }));
        chunk.append(Buildable::Raw(RawOperation {
            opcode: Opcode::New,
            operands: smallvec![RawOperand::U8(0), RawOperand::U16(7)],
        }));
        chunk.append(Buildable::PopLocals { count: 3 });
        chunk.resolve(0, &mut statics);
        let mut buf = Vec::new();
        chunk.build(&mut buf);
        assert_eq!(buf.len(), chunk.size());
    }
}
