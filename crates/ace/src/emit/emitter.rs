//! The emitter: a second walk over the analyzed AST producing Buildable IR,
//! then lowering it to flat bytecode with all label addresses resolved.
//!
//! Register discipline: a monotonically increasing register counter per
//! statement, bounds-checked against the fixed register file. Binary
//! operations choose among three strategies by side-effect analysis:
//! left-then-right when the right side is pure, right-then-left when the
//! left is a simple reference, and a stack spill when both sides may have
//! effects or registers run short.
//!
//! Calling convention: arguments are pushed left to right, the callee is
//! loaded into a register, and `CALL` transfers control; the return value
//! arrives in register 0. Captured variables live in one-element arrays
//! ("boxes") so closures observe writes; a closure value is an object
//! carrying the boxes plus a `$invoke` member holding the code, and the VM
//! passes that object as the implicit zeroth argument.

use ahash::AHashMap;
use smallvec::smallvec;

use crate::{
    ast::{AccessMode, BinaryOp, ConstValue, Expr, ExprKind, FunctionExpr, Stmt, StmtKind, TypeExprNode, UnaryOp},
    builtins::NativeRegistry,
    bytecode::{Opcode, name_hash},
    emit::{
        buildable::{Buildable, Chunk, JumpKind, LabelId, RawOperand, RawOperation, StorageOp},
        static_object::{FunctionFlags, StaticObjectId, StaticObjectTable, StaticTypeInfo},
    },
    error::{EmitError, EmitResult, SourceLocation},
    scope::{CompilationUnit, IdentRef},
    types::{self, TypeId, TypeKind},
};

/// Per-function emission context.
struct FnCtx {
    /// Capture source -> member index on the closure object.
    capture_map: AHashMap<IdentRef, u16>,
    has_closure: bool,
    is_generator: bool,
}

/// Innermost-loop jump targets.
struct LoopCtx {
    continue_label: LabelId,
    break_label: LabelId,
    entry_depth: u32,
}

/// Emits analyzed statements into a static table plus flat code.
pub struct Emitter<'a> {
    unit: &'a mut CompilationUnit,
    natives: &'a NativeRegistry,
    statics: StaticObjectTable,
    chunk: Chunk,
    /// Compile-time stack depth in the current frame's coordinates.
    depth: u32,
    max_registers: u8,
    functions: Vec<FnCtx>,
    loops: Vec<LoopCtx>,
    native_statics: AHashMap<u32, StaticObjectId>,
    type_statics: AHashMap<TypeId, StaticObjectId>,
    /// Member defaults per declared type, recorded at the declaration and
    /// emitted after each `NEW`.
    type_defaults: AHashMap<TypeId, Vec<(u8, Expr)>>,
    /// Register holding the object under construction while emitting member
    /// defaults.
    self_reg: Option<u8>,
}

impl<'a> Emitter<'a> {
    pub fn new(unit: &'a mut CompilationUnit, natives: &'a NativeRegistry) -> Self {
        let max_registers = u8::try_from(unit.config.max_registers).unwrap_or(8);
        Self {
            unit,
            natives,
            statics: StaticObjectTable::new(),
            chunk: Chunk::new(),
            depth: 0,
            max_registers,
            functions: Vec::new(),
            loops: Vec::new(),
            native_statics: AHashMap::new(),
            type_statics: AHashMap::new(),
            type_defaults: AHashMap::new(),
            self_reg: None,
        }
    }

    /// Emits every section in order (imports first, then the main program),
    /// appends `EXIT`, resolves labels, and lowers to bytes.
    pub fn emit_program(mut self, sections: &[&[Stmt]]) -> EmitResult<(StaticObjectTable, Vec<u8>)> {
        for section in sections {
            for stmt in *section {
                self.emit_stmt(stmt)?;
            }
        }
        self.raw(Opcode::Exit, smallvec![]);

        let mut chunk = std::mem::take(&mut self.chunk);
        chunk.resolve(0, &mut self.statics);
        let mut code = Vec::with_capacity(chunk.size());
        chunk.build(&mut code);
        Ok((self.statics, code))
    }

    // ================================================================
    // Helpers
    // ================================================================

    fn raw(&mut self, opcode: Opcode, operands: smallvec::SmallVec<[RawOperand; 4]>) {
        self.chunk.append(Buildable::Raw(RawOperation { opcode, operands }));
    }

    fn storage(&mut self, op: StorageOp) {
        self.chunk.append(Buildable::Storage(op));
    }

    /// Bounds-checks a register index against the fixed register file.
    fn check_register(&self, reg: u8, loc: SourceLocation) -> EmitResult<u8> {
        if reg >= self.max_registers {
            return Err(EmitError::new(loc, "expression needs more registers than the register file holds"));
        }
        Ok(reg)
    }

    /// Pushes a register onto the stack, creating a local slot.
    fn push_value(&mut self, src: u8) {
        self.chunk.append(Buildable::StoreNewLocal { src });
        self.depth += 1;
    }

    fn pop_values(&mut self, count: u32) {
        let mut remaining = count;
        while remaining > 0 {
            let batch = remaining.min(255);
            self.chunk.append(Buildable::PopLocals {
                count: u16::try_from(batch).expect("batch fits u16"),
            });
            remaining -= batch;
        }
        self.depth -= count;
    }

    /// Stack offset (from the top) of an absolute frame location.
    fn offset_of(&self, location: u32, loc: SourceLocation) -> EmitResult<u16> {
        let offset = self
            .depth
            .checked_sub(1 + location)
            .ok_or_else(|| EmitError::new(loc, "local referenced above the current stack depth"))?;
        u16::try_from(offset).map_err(|_| EmitError::new(loc, "local offset exceeds the encodable range"))
    }

    fn ident_location(&self, binding: IdentRef, loc: SourceLocation) -> EmitResult<u32> {
        self.unit
            .ident(binding)
            .stack_location()
            .ok_or_else(|| EmitError::new(loc, "identifier read before its declaration was emitted"))
    }

    /// Conservative estimate of the registers an expression needs above its
    /// destination register. Saturating: deep pure chains report "too many"
    /// and fall back to the stack-spill strategy.
    fn register_need(expr: &Expr) -> u16 {
        match &expr.kind {
            ExprKind::Binary { op, lhs, rhs } if !op.is_assignment() => {
                if rhs.may_have_side_effects() {
                    2
                } else {
                    Self::register_need(lhs)
                        .max(Self::register_need(rhs).saturating_add(1))
                        .max(2)
                }
            }
            ExprKind::Index { object, index } => {
                Self::register_need(object).max(Self::register_need(index).saturating_add(1))
            }
            ExprKind::ArrayLit(_) | ExprKind::New { .. } => 3,
            ExprKind::Member { object, .. } => Self::register_need(object),
            ExprKind::Unary { operand, .. } => Self::register_need(operand).max(2),
            _ => 1,
        }
    }

    fn native_static(&mut self, native: u32) -> StaticObjectId {
        if let Some(&id) = self.native_statics.get(&native) {
            return id;
        }
        let entry = self.natives.get(native).expect("analyzer resolved the native index");
        let nargs = u8::try_from(entry.params.len()).expect("native arity fits u8");
        let id = self.statics.register_native(native, nargs, entry.variadic);
        self.native_statics.insert(native, id);
        id
    }

    fn type_static(&mut self, ty: TypeId) -> StaticObjectId {
        let resolved = self.unit.registry.resolve(ty);
        if let Some(&id) = self.type_statics.get(&resolved) {
            return id;
        }
        let desc = self.unit.registry.get(resolved);
        let members = match &desc.kind {
            TypeKind::Object { members, .. } => members.iter().map(|m| m.name.clone()).collect(),
            _ => Vec::new(),
        };
        let info = StaticTypeInfo {
            name: desc.name.clone(),
            members,
        };
        let id = self.statics.register_type_info(info);
        self.type_statics.insert(resolved, id);
        id
    }

    // ================================================================
    // Statements
    // ================================================================

    fn emit_stmt(&mut self, stmt: &Stmt) -> EmitResult<()> {
        let loc = stmt.loc;
        match &stmt.kind {
            StmtKind::Module { .. } | StmtKind::Import(_) | StmtKind::Directive { .. } | StmtKind::AliasDecl { .. } => {
                Ok(())
            }
            StmtKind::VarDecl(decl) => {
                let Some(binding) = decl.binding else {
                    return Ok(());
                };
                if self.unit.ident(binding).template.is_some() {
                    return Ok(());
                }
                self.emit_declaration(binding, decl.init.as_deref(), loc)
            }
            StmtKind::FuncDecl { func, binding, .. } => {
                let Some(binding) = binding else {
                    return Ok(());
                };
                if self.unit.ident(*binding).template.is_some() {
                    return Ok(());
                }
                self.emit_declaration(*binding, Some(func.as_ref()), loc)
            }
            StmtKind::TypeDecl(node) => {
                self.record_type_defaults(node);
                Ok(())
            }
            StmtKind::Block(body) => {
                let saved = self.depth;
                for child in body {
                    self.emit_stmt(child)?;
                }
                self.pop_values(self.depth - saved);
                Ok(())
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let else_label = self.chunk.new_label();
                let end_label = self.chunk.new_label();
                self.emit_cond_jump(cond, else_label, false, 0)?;
                let saved = self.depth;
                for child in then_branch {
                    self.emit_stmt(child)?;
                }
                self.pop_values(self.depth - saved);
                self.chunk.append(Buildable::Jump {
                    kind: JumpKind::Unconditional,
                    label: end_label,
                });
                self.chunk.append(Buildable::LabelMarker {
                    label: else_label,
                    static_fixup: None,
                });
                if let Some(else_branch) = else_branch {
                    let saved = self.depth;
                    for child in else_branch {
                        self.emit_stmt(child)?;
                    }
                    self.pop_values(self.depth - saved);
                }
                self.chunk.append(Buildable::LabelMarker {
                    label: end_label,
                    static_fixup: None,
                });
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let cond_label = self.chunk.new_label();
                let end_label = self.chunk.new_label();
                self.chunk.append(Buildable::LabelMarker {
                    label: cond_label,
                    static_fixup: None,
                });
                self.emit_cond_jump(cond, end_label, false, 0)?;
                self.loops.push(LoopCtx {
                    continue_label: cond_label,
                    break_label: end_label,
                    entry_depth: self.depth,
                });
                let saved = self.depth;
                for child in body {
                    self.emit_stmt(child)?;
                }
                self.pop_values(self.depth - saved);
                self.loops.pop();
                self.chunk.append(Buildable::Jump {
                    kind: JumpKind::Unconditional,
                    label: cond_label,
                });
                self.chunk.append(Buildable::LabelMarker {
                    label: end_label,
                    static_fixup: None,
                });
                Ok(())
            }
            StmtKind::For { lowered, .. } => {
                let lowered = lowered
                    .as_deref()
                    .ok_or_else(|| EmitError::new(loc, "for statement reached the emitter without lowering"))?;
                self.emit_expr(lowered, 0)
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.emit_expr(value, 0)?,
                    None => self.chunk.append(Buildable::ConstNull { dst: 0 }),
                }
                self.chunk.append(Buildable::Return);
                Ok(())
            }
            StmtKind::Yield(value) => {
                self.emit_expr(value, 0)?;
                self.push_value(0);
                let ctx = self
                    .functions
                    .last()
                    .ok_or_else(|| EmitError::new(loc, "yield outside of a function body"))?;
                if !ctx.is_generator {
                    return Err(EmitError::new(loc, "yield in a non-generator function"));
                }
                let callback_location = u32::from(ctx.has_closure);
                let offset = self.offset_of(callback_location, loc)?;
                self.storage(StorageOp::LoadLocal { dst: 0, offset });
                self.raw(Opcode::Yield, smallvec![RawOperand::U8(0)]);
                // The callback consumed the pushed argument on return.
                self.depth -= 1;
                Ok(())
            }
            StmtKind::Throw(value) => {
                self.emit_expr(value, 0)?;
                self.raw(Opcode::Throw, smallvec![RawOperand::U8(0)]);
                Ok(())
            }
            StmtKind::TryCatch {
                body,
                catch_name: _,
                catch_binding,
                catch_body,
            } => {
                let catch_label = self.chunk.new_label();
                let end_label = self.chunk.new_label();
                let catch_static = self.statics.register_label();

                self.storage(StorageOp::LoadStatic {
                    dst: 0,
                    id: catch_static,
                });
                self.chunk.append(Buildable::BeginTry { catch_reg: 0 });
                let depth_at_try = self.depth;
                self.depth += 1; // the try frame occupies a slot

                let saved = self.depth;
                for child in body {
                    self.emit_stmt(child)?;
                }
                self.pop_values(self.depth - saved);
                self.chunk.append(Buildable::EndTry);
                self.depth -= 1;
                self.chunk.append(Buildable::Jump {
                    kind: JumpKind::Unconditional,
                    label: end_label,
                });

                // Unwinding pops the try frame and everything above it; the
                // catch path resumes at the pre-try depth with the exception
                // value in register 0.
                self.chunk.append(Buildable::LabelMarker {
                    label: catch_label,
                    static_fixup: Some(catch_static),
                });
                self.depth = depth_at_try;
                let saved = self.depth;
                if let Some(binding) = catch_binding {
                    self.unit.ident_mut(*binding).assign_stack_location(self.depth);
                    self.push_value(0);
                }
                for child in catch_body {
                    self.emit_stmt(child)?;
                }
                self.pop_values(self.depth - saved);
                self.chunk.append(Buildable::LabelMarker {
                    label: end_label,
                    static_fixup: None,
                });
                Ok(())
            }
            StmtKind::Print(args) => {
                for arg in args {
                    self.emit_expr(arg, 0)?;
                    self.raw(Opcode::Echo, smallvec![RawOperand::U8(0)]);
                }
                self.raw(Opcode::EchoNewline, smallvec![]);
                Ok(())
            }
            StmtKind::Expr(expr) => self.emit_expr(expr, 0),
            StmtKind::Break => {
                let Some(ctx) = self.loops.last() else {
                    return Err(EmitError::new(loc, "break outside of a loop"));
                };
                let (label, entry_depth) = (ctx.break_label, ctx.entry_depth);
                let to_pop = self.depth - entry_depth;
                // Emit the pops without disturbing the tracked depth: the
                // code after the jump still runs at the body depth.
                let saved = self.depth;
                self.pop_values(to_pop);
                self.depth = saved;
                self.chunk.append(Buildable::Jump {
                    kind: JumpKind::Unconditional,
                    label,
                });
                Ok(())
            }
            StmtKind::Continue => {
                let Some(ctx) = self.loops.last() else {
                    return Err(EmitError::new(loc, "continue outside of a loop"));
                };
                let (label, entry_depth) = (ctx.continue_label, ctx.entry_depth);
                let to_pop = self.depth - entry_depth;
                let saved = self.depth;
                self.pop_values(to_pop);
                self.depth = saved;
                self.chunk.append(Buildable::Jump {
                    kind: JumpKind::Unconditional,
                    label,
                });
                Ok(())
            }
        }
    }

    /// Emits a variable or function declaration. Captured identifiers get a
    /// one-element array box as their slot so closures share the storage.
    fn emit_declaration(&mut self, binding: IdentRef, init: Option<&Expr>, loc: SourceLocation) -> EmitResult<()> {
        let captured = self.unit.ident(binding).is_captured();
        if captured {
            self.raw(Opcode::NewArray, smallvec![RawOperand::U8(0), RawOperand::U16(1)]);
            let location = self.depth;
            self.unit.ident_mut(binding).assign_stack_location(location);
            self.push_value(0);
            match init {
                Some(init) => self.emit_expr(init, 0)?,
                None => self.chunk.append(Buildable::ConstNull { dst: 0 }),
            }
            let box_offset = self.offset_of(location, loc)?;
            self.check_register(2, loc)?;
            self.storage(StorageOp::LoadLocal {
                dst: 1,
                offset: box_offset,
            });
            self.chunk.append(Buildable::ConstI32 { dst: 2, value: 0 });
            self.storage(StorageOp::StoreArrayIndex {
                array: 1,
                index: 2,
                src: 0,
            });
        } else {
            match init {
                Some(init) => self.emit_expr(init, 0)?,
                None => self.chunk.append(Buildable::ConstNull { dst: 0 }),
            }
            let location = self.depth;
            self.unit.ident_mut(binding).assign_stack_location(location);
            self.push_value(0);
        }
        Ok(())
    }

    fn record_type_defaults(&mut self, node: &TypeExprNode) {
        let Some(ty) = node.ty else {
            return;
        };
        let defaults: Vec<(u8, Expr)> = node
            .members
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                m.default
                    .as_deref()
                    .map(|d| (u8::try_from(i).expect("member count fits u8"), d.clone()))
            })
            .collect();
        self.type_defaults.insert(self.unit.registry.resolve(ty), defaults);
    }

    // ================================================================
    // Expressions
    // ================================================================

    fn emit_expr(&mut self, expr: &Expr, dst: u8) -> EmitResult<()> {
        let loc = expr.loc;
        self.check_register(dst, loc)?;

        // Folded constants emit directly, substituting the equivalent
        // constant for the whole sub-tree.
        if expr.access == AccessMode::Load {
            if let Some(value) = &expr.const_value {
                let value = value.clone();
                return self.emit_const(&value, dst, loc);
            }
        }

        match &expr.kind {
            ExprKind::IntLit(v) => {
                self.emit_const(&ConstValue::Int(*v), dst, loc)?;
                Ok(())
            }
            ExprKind::FloatLit(v) => {
                self.chunk.append(Buildable::ConstF64 { dst, value: *v });
                Ok(())
            }
            ExprKind::StrLit(s) => {
                let id = self.statics.register_string(s);
                self.storage(StorageOp::LoadStatic { dst, id });
                Ok(())
            }
            ExprKind::BoolLit(v) => {
                self.chunk.append(Buildable::ConstBool { dst, value: *v });
                Ok(())
            }
            ExprKind::NullLit => {
                self.chunk.append(Buildable::ConstNull { dst });
                Ok(())
            }
            ExprKind::Ident {
                binding,
                capture_index,
                ..
            } => {
                let binding =
                    binding.ok_or_else(|| EmitError::new(loc, "identifier reached the emitter unresolved"))?;
                self.emit_ident_load(binding, *capture_index, dst, loc)
            }
            ExprKind::Unary { op, operand } => self.emit_unary(*op, operand, dst, loc),
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_assignment() {
                    self.emit_assignment(*op, lhs, rhs, dst, loc)
                } else if op.is_comparison() || op.is_logical() {
                    self.emit_bool_materialization(expr, dst)
                } else {
                    let (ra, rb) = self.emit_operand_pair(lhs, rhs, dst, loc)?;
                    let opcode = arithmetic_opcode(*op).ok_or_else(|| {
                        EmitError::new(loc, "operator survived analysis without an arithmetic opcode")
                    })?;
                    self.raw(
                        opcode,
                        smallvec![RawOperand::U8(dst), RawOperand::U8(ra), RawOperand::U8(rb)],
                    );
                    Ok(())
                }
            }
            ExprKind::Call { callee, args } => self.emit_call(callee, args, dst, loc),
            ExprKind::Member {
                object,
                member,
                member_index,
            } => {
                self.emit_expr(object, dst)?;
                match member_index {
                    Some(index) => self.storage(StorageOp::LoadMember {
                        dst,
                        object: dst,
                        index: *index,
                    }),
                    None => self.storage(StorageOp::LoadMemberHash {
                        dst,
                        object: dst,
                        hash: name_hash(member),
                    }),
                }
                Ok(())
            }
            ExprKind::Index { object, index } => {
                self.emit_expr(object, dst)?;
                let idx = self.check_register(dst + 1, loc)?;
                self.emit_expr(index, idx)?;
                self.storage(StorageOp::LoadArrayIndex {
                    dst,
                    array: dst,
                    index: idx,
                });
                Ok(())
            }
            ExprKind::ArrayLit(items) => {
                let count = u16::try_from(items.len())
                    .map_err(|_| EmitError::new(loc, "array literal exceeds the encodable length"))?;
                self.raw(Opcode::NewArray, smallvec![RawOperand::U8(dst), RawOperand::U16(count)]);
                let value_reg = self.check_register(dst + 1, loc)?;
                let index_reg = self.check_register(dst + 2, loc)?;
                for (i, item) in items.iter().enumerate() {
                    self.emit_expr(item, value_reg)?;
                    self.chunk.append(Buildable::ConstI32 {
                        dst: index_reg,
                        value: i32::try_from(i).expect("array literal length fits i32"),
                    });
                    self.storage(StorageOp::StoreArrayIndex {
                        array: dst,
                        index: index_reg,
                        src: value_reg,
                    });
                }
                Ok(())
            }
            ExprKind::Function(f) => self.emit_function_expr(f, dst, loc),
            ExprKind::TypeExpr(node) => {
                self.record_type_defaults(node);
                let ty = node
                    .ty
                    .ok_or_else(|| EmitError::new(loc, "type expression reached the emitter unregistered"))?;
                let id = self.type_static(ty);
                self.storage(StorageOp::LoadStatic { dst, id });
                Ok(())
            }
            ExprKind::New { .. } => {
                let ty = expr
                    .ty
                    .ok_or_else(|| EmitError::new(loc, "new expression reached the emitter untyped"))?;
                self.emit_new(ty, dst, loc)
            }
            ExprKind::SelfExpr => {
                let self_reg = self
                    .self_reg
                    .ok_or_else(|| EmitError::new(loc, "self outside of a member default"))?;
                if self_reg != dst {
                    self.raw(Opcode::MovReg, smallvec![RawOperand::U8(dst), RawOperand::U8(self_reg)]);
                }
                Ok(())
            }
            ExprKind::NativeRef { native } => {
                let id = self.native_static(*native);
                self.storage(StorageOp::LoadStatic { dst, id });
                Ok(())
            }
            ExprKind::GenericApply { .. } | ExprKind::BlockExpr(_) | ExprKind::Has { .. } | ExprKind::TypeOf { .. } => {
                Err(EmitError::new(loc, "surface form reached the emitter without lowering"))
            }
        }
    }

    fn emit_const(&mut self, value: &ConstValue, dst: u8, _loc: SourceLocation) -> EmitResult<()> {
        match value {
            ConstValue::Null | ConstValue::Undefined => self.chunk.append(Buildable::ConstNull { dst }),
            ConstValue::Bool(v) => self.chunk.append(Buildable::ConstBool { dst, value: *v }),
            ConstValue::Int(v) => match i32::try_from(*v) {
                Ok(v) => self.chunk.append(Buildable::ConstI32 { dst, value: v }),
                Err(_) => self.chunk.append(Buildable::ConstI64 { dst, value: *v }),
            },
            ConstValue::Float(v) => self.chunk.append(Buildable::ConstF64 { dst, value: *v }),
            ConstValue::Str(s) => {
                let id = self.statics.register_string(s);
                self.storage(StorageOp::LoadStatic { dst, id });
            }
        }
        Ok(())
    }

    fn emit_ident_load(
        &mut self,
        binding: IdentRef,
        capture_index: Option<u16>,
        dst: u8,
        loc: SourceLocation,
    ) -> EmitResult<()> {
        let ident = self.unit.ident(binding);
        if let Some(native) = ident.native {
            let id = self.native_static(native);
            self.storage(StorageOp::LoadStatic { dst, id });
            return Ok(());
        }
        if let Some(ty) = ident.type_ref {
            let id = self.type_static(ty);
            self.storage(StorageOp::LoadStatic { dst, id });
            return Ok(());
        }
        if let Some(index) = capture_index {
            // Captured box via the implicit closure object parameter.
            let member = u8::try_from(index).map_err(|_| EmitError::new(loc, "capture index exceeds a byte"))?;
            let closure_offset = self.offset_of(0, loc)?;
            self.storage(StorageOp::LoadLocal {
                dst,
                offset: closure_offset,
            });
            self.storage(StorageOp::LoadMember {
                dst,
                object: dst,
                index: member,
            });
            let idx_reg = self.check_register(dst + 1, loc)?;
            self.chunk.append(Buildable::ConstI32 { dst: idx_reg, value: 0 });
            self.storage(StorageOp::LoadArrayIndex {
                dst,
                array: dst,
                index: idx_reg,
            });
            return Ok(());
        }
        let location = self.ident_location(binding, loc)?;
        let offset = self.offset_of(location, loc)?;
        self.storage(StorageOp::LoadLocal { dst, offset });
        if self.unit.ident(binding).is_captured() {
            // The slot holds the box; dereference it.
            let idx_reg = self.check_register(dst + 1, loc)?;
            self.chunk.append(Buildable::ConstI32 { dst: idx_reg, value: 0 });
            self.storage(StorageOp::LoadArrayIndex {
                dst,
                array: dst,
                index: idx_reg,
            });
        }
        Ok(())
    }

    /// Stores the value in `src` into a storable place. Scratch registers
    /// above `src` address the container.
    fn emit_store(&mut self, place: &Expr, src: u8) -> EmitResult<()> {
        let loc = place.loc;
        match &place.kind {
            ExprKind::Ident {
                binding,
                capture_index,
                ..
            } => {
                let binding =
                    binding.ok_or_else(|| EmitError::new(loc, "assignment target reached the emitter unresolved"))?;
                if let Some(index) = capture_index {
                    let member =
                        u8::try_from(*index).map_err(|_| EmitError::new(loc, "capture index exceeds a byte"))?;
                    let obj_reg = self.check_register(src + 1, loc)?;
                    let idx_reg = self.check_register(src + 2, loc)?;
                    let closure_offset = self.offset_of(0, loc)?;
                    self.storage(StorageOp::LoadLocal {
                        dst: obj_reg,
                        offset: closure_offset,
                    });
                    self.storage(StorageOp::LoadMember {
                        dst: obj_reg,
                        object: obj_reg,
                        index: member,
                    });
                    self.chunk.append(Buildable::ConstI32 { dst: idx_reg, value: 0 });
                    self.storage(StorageOp::StoreArrayIndex {
                        array: obj_reg,
                        index: idx_reg,
                        src,
                    });
                    return Ok(());
                }
                let location = self.ident_location(binding, loc)?;
                let offset = self.offset_of(location, loc)?;
                if self.unit.ident(binding).is_captured() {
                    let box_reg = self.check_register(src + 1, loc)?;
                    let idx_reg = self.check_register(src + 2, loc)?;
                    self.storage(StorageOp::LoadLocal {
                        dst: box_reg,
                        offset,
                    });
                    self.chunk.append(Buildable::ConstI32 { dst: idx_reg, value: 0 });
                    self.storage(StorageOp::StoreArrayIndex {
                        array: box_reg,
                        index: idx_reg,
                        src,
                    });
                } else {
                    self.storage(StorageOp::StoreLocal { offset, src });
                }
                Ok(())
            }
            ExprKind::Member {
                object,
                member,
                member_index,
            } => {
                let obj_reg = self.check_register(src + 1, loc)?;
                self.emit_expr(object, obj_reg)?;
                match member_index {
                    Some(index) => self.storage(StorageOp::StoreMember {
                        object: obj_reg,
                        index: *index,
                        src,
                    }),
                    None => self.storage(StorageOp::StoreMemberHash {
                        object: obj_reg,
                        hash: name_hash(member),
                        src,
                    }),
                }
                Ok(())
            }
            ExprKind::Index { object, index } => {
                let obj_reg = self.check_register(src + 1, loc)?;
                let idx_reg = self.check_register(src + 2, loc)?;
                self.emit_expr(object, obj_reg)?;
                self.emit_expr(index, idx_reg)?;
                self.storage(StorageOp::StoreArrayIndex {
                    array: obj_reg,
                    index: idx_reg,
                    src,
                });
                Ok(())
            }
            _ => Err(EmitError::new(loc, "assignment target is not a storable place")),
        }
    }

    fn emit_assignment(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u8,
        loc: SourceLocation,
    ) -> EmitResult<()> {
        match op.compound_base() {
            None => {
                self.emit_expr(rhs, dst)?;
                self.emit_store(lhs, dst)?;
                Ok(())
            }
            Some(base) => {
                // Load the current value, apply the base operator, store.
                let mut load_place = lhs.clone();
                load_place.access = AccessMode::Load;
                self.emit_expr(&load_place, dst)?;
                let rhs_reg = self.check_register(dst + 1, loc)?;
                if rhs.may_have_side_effects() {
                    self.push_value(dst);
                    self.emit_expr(rhs, dst)?;
                    self.storage(StorageOp::LoadLocal {
                        dst: rhs_reg,
                        offset: 0,
                    });
                    self.pop_values(1);
                    let opcode = arithmetic_opcode(base)
                        .ok_or_else(|| EmitError::new(loc, "compound assignment without an arithmetic opcode"))?;
                    // value order: saved lhs is in rhs_reg, new rhs in dst
                    self.raw(
                        opcode,
                        smallvec![RawOperand::U8(dst), RawOperand::U8(rhs_reg), RawOperand::U8(dst)],
                    );
                } else {
                    self.emit_expr(rhs, rhs_reg)?;
                    let opcode = arithmetic_opcode(base)
                        .ok_or_else(|| EmitError::new(loc, "compound assignment without an arithmetic opcode"))?;
                    self.raw(
                        opcode,
                        smallvec![RawOperand::U8(dst), RawOperand::U8(dst), RawOperand::U8(rhs_reg)],
                    );
                }
                self.emit_store(lhs, dst)?;
                Ok(())
            }
        }
    }

    fn emit_unary(&mut self, op: UnaryOp, operand: &Expr, dst: u8, loc: SourceLocation) -> EmitResult<()> {
        match op {
            UnaryOp::Not => {
                // Materialize through the flags register.
                let true_label = self.chunk.new_label();
                let end_label = self.chunk.new_label();
                self.emit_cond_jump_simple(operand, true_label, false, dst)?;
                self.chunk.append(Buildable::ConstBool { dst, value: false });
                self.chunk.append(Buildable::Jump {
                    kind: JumpKind::Unconditional,
                    label: end_label,
                });
                self.chunk.append(Buildable::LabelMarker {
                    label: true_label,
                    static_fixup: None,
                });
                self.chunk.append(Buildable::ConstBool { dst, value: true });
                self.chunk.append(Buildable::LabelMarker {
                    label: end_label,
                    static_fixup: None,
                });
                Ok(())
            }
            UnaryOp::Negate => {
                self.emit_expr(operand, dst)?;
                self.raw(Opcode::Neg, smallvec![RawOperand::U8(dst)]);
                Ok(())
            }
            UnaryOp::Positive => self.emit_expr(operand, dst),
            UnaryOp::BitNot => {
                self.emit_expr(operand, dst)?;
                let mask_reg = self.check_register(dst + 1, loc)?;
                self.chunk.append(Buildable::ConstI64 {
                    dst: mask_reg,
                    value: -1,
                });
                self.raw(
                    Opcode::Xor,
                    smallvec![RawOperand::U8(dst), RawOperand::U8(dst), RawOperand::U8(mask_reg)],
                );
                Ok(())
            }
            UnaryOp::Increment | UnaryOp::Decrement => {
                Err(EmitError::new(loc, "prefix increment reached the emitter without rewriting"))
            }
        }
    }

    /// Emits the two operands of a binary operator, choosing among the
    /// register strategies; returns (lhs register, rhs register).
    fn emit_operand_pair(&mut self, lhs: &Expr, rhs: &Expr, base: u8, loc: SourceLocation) -> EmitResult<(u8, u8)> {
        let second = self.check_register(base + 1, loc)?;
        let rhs_pure = !rhs.may_have_side_effects();
        let fits = u16::from(base) + 1 + Self::register_need(rhs) <= u16::from(self.max_registers);
        if rhs_pure && fits {
            // Left-then-right.
            self.emit_expr(lhs, base)?;
            self.emit_expr(rhs, second)?;
            return Ok((base, second));
        }
        if matches!(lhs.kind, ExprKind::Ident { .. }) && !lhs.may_have_side_effects() {
            // Right-then-left: the left side is a simple reference.
            self.emit_expr(rhs, base)?;
            self.emit_expr(lhs, second)?;
            return Ok((second, base));
        }
        // Load-and-store: spill the left value across the right side's
        // evaluation.
        self.emit_expr(lhs, base)?;
        self.push_value(base);
        self.emit_expr(rhs, base)?;
        self.storage(StorageOp::LoadLocal {
            dst: second,
            offset: 0,
        });
        self.pop_values(1);
        Ok((second, base))
    }

    /// Emits a conditional jump for a condition expression, specializing
    /// direct comparisons onto the flags register.
    fn emit_cond_jump(&mut self, cond: &Expr, label: LabelId, jump_if_true: bool, base: u8) -> EmitResult<()> {
        let loc = cond.loc;
        if let Some(value) = &cond.const_value {
            let truth = matches!(value, ConstValue::Bool(true));
            if truth == jump_if_true {
                self.chunk.append(Buildable::Jump {
                    kind: JumpKind::Unconditional,
                    label,
                });
            }
            return Ok(());
        }
        match &cond.kind {
            ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
                let (ra, rb) = self.emit_operand_pair(lhs, rhs, base, loc)?;
                // The flags register has no LESS flag; the operand order
                // makes every condition expressible as JE/JNE/JG/JGE.
                let (first, second, kind) = comparison_jump(*op, jump_if_true, ra, rb);
                self.chunk.append(Buildable::Comparison {
                    lhs: first,
                    rhs: second,
                });
                self.chunk.append(Buildable::Jump { kind, label });
                Ok(())
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_logical() => {
                let and = matches!(op, BinaryOp::LogicalAnd);
                if and == jump_if_true {
                    // (a && b) jump-if-true L, or (a || b) jump-if-false L:
                    // the first operand can only short-circuit past the jump.
                    let skip = self.chunk.new_label();
                    self.emit_cond_jump(lhs, skip, !jump_if_true, base)?;
                    self.emit_cond_jump(rhs, label, jump_if_true, base)?;
                    self.chunk.append(Buildable::LabelMarker {
                        label: skip,
                        static_fixup: None,
                    });
                } else {
                    // Either operand alone decides the jump.
                    self.emit_cond_jump(lhs, label, jump_if_true, base)?;
                    self.emit_cond_jump(rhs, label, jump_if_true, base)?;
                }
                Ok(())
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => self.emit_cond_jump(operand, label, !jump_if_true, base),
            _ => self.emit_cond_jump_simple(cond, label, jump_if_true, base),
        }
    }

    /// The general condition path: evaluate to a boolean and compare against
    /// `true`.
    fn emit_cond_jump_simple(&mut self, cond: &Expr, label: LabelId, jump_if_true: bool, base: u8) -> EmitResult<()> {
        let loc = cond.loc;
        self.emit_expr(cond, base)?;
        let true_reg = self.check_register(base + 1, loc)?;
        self.chunk.append(Buildable::ConstBool {
            dst: true_reg,
            value: true,
        });
        self.chunk.append(Buildable::Comparison {
            lhs: base,
            rhs: true_reg,
        });
        self.chunk.append(Buildable::Jump {
            kind: if jump_if_true {
                JumpKind::IfEqual
            } else {
                JumpKind::IfNotEqual
            },
            label,
        });
        Ok(())
    }

    /// Materializes a boolean-valued comparison or logical expression.
    fn emit_bool_materialization(&mut self, expr: &Expr, dst: u8) -> EmitResult<()> {
        let true_label = self.chunk.new_label();
        let end_label = self.chunk.new_label();
        self.emit_cond_jump(expr, true_label, true, dst)?;
        self.chunk.append(Buildable::ConstBool { dst, value: false });
        self.chunk.append(Buildable::Jump {
            kind: JumpKind::Unconditional,
            label: end_label,
        });
        self.chunk.append(Buildable::LabelMarker {
            label: true_label,
            static_fixup: None,
        });
        self.chunk.append(Buildable::ConstBool { dst, value: true });
        self.chunk.append(Buildable::LabelMarker {
            label: end_label,
            static_fixup: None,
        });
        Ok(())
    }

    fn emit_call(&mut self, callee: &Expr, args: &[Expr], dst: u8, loc: SourceLocation) -> EmitResult<()> {
        let mut pushed: u32 = 0;
        for arg in args {
            self.emit_expr(arg, dst)?;
            self.push_value(dst);
            pushed += 1;
        }
        // Fill omitted trailing parameters from the function type's constant
        // defaults.
        if let Some(callee_ty) = callee.ty {
            if let Some((_, params)) = self.unit.registry.as_function(callee_ty) {
                let variadic = params
                    .last()
                    .is_some_and(|&p| self.unit.registry.varargs_element(p).is_some());
                let fixed = if variadic { params.len() - 1 } else { params.len() };
                if args.len() < fixed {
                    let defaults = self.param_defaults(callee_ty);
                    for i in args.len()..fixed {
                        if let Some(Some(default)) = defaults.get(i) {
                            let default = default.clone();
                            self.emit_const(&default, dst, loc)?;
                            self.push_value(dst);
                            pushed += 1;
                        }
                    }
                }
            }
        }
        self.emit_expr(callee, dst)?;
        let nargs = u8::try_from(pushed).map_err(|_| EmitError::new(loc, "call exceeds the encodable arity"))?;
        self.chunk.append(Buildable::FunctionCall { func: dst, nargs });
        // The callee's return pops the arguments.
        self.depth -= pushed;
        if dst != 0 {
            self.raw(Opcode::MovReg, smallvec![RawOperand::U8(dst), RawOperand::U8(0)]);
        }
        Ok(())
    }

    fn param_defaults(&self, func_ty: TypeId) -> Vec<Option<ConstValue>> {
        let resolved = self.unit.registry.resolve(func_ty);
        match &self.unit.registry.get(resolved).kind {
            TypeKind::GenericInstance { base, args } if self.unit.registry.resolve(*base) == types::FUNCTION => {
                args.iter().skip(1).map(|a| a.default.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    fn emit_new(&mut self, ty: TypeId, dst: u8, loc: SourceLocation) -> EmitResult<()> {
        let id = self.type_static(ty);
        self.raw(Opcode::New, smallvec![RawOperand::U8(dst), RawOperand::U16(id.0)]);
        let defaults = self
            .type_defaults
            .get(&self.unit.registry.resolve(ty))
            .cloned()
            .unwrap_or_default();
        if !defaults.is_empty() {
            let value_reg = self.check_register(dst + 1, loc)?;
            let previous_self = self.self_reg.replace(dst);
            for (index, default) in &defaults {
                self.emit_expr(default, value_reg)?;
                self.storage(StorageOp::StoreMember {
                    object: dst,
                    index: *index,
                    src: value_reg,
                });
            }
            self.self_reg = previous_self;
        }
        Ok(())
    }

    /// Emits a function expression: the body inline behind an unconditional
    /// jump, a function static patched to the entry label, and at the use
    /// site either the bare function value or a closure object carrying the
    /// captured boxes.
    fn emit_function_expr(&mut self, f: &FunctionExpr, dst: u8, loc: SourceLocation) -> EmitResult<()> {
        let has_closure = !f.captures.is_empty();
        let user_params = u32::try_from(f.params.len()).expect("param count fits u32");
        let implicit = u32::from(has_closure) + u32::from(f.is_generator);
        let total_params = implicit + user_params;
        let nargs =
            u8::try_from(total_params).map_err(|_| EmitError::new(loc, "function exceeds the encodable arity"))?;
        let variadic = f.params.last().is_some_and(|p| p.is_variadic);
        let mut flags = FunctionFlags::empty();
        if variadic {
            flags |= FunctionFlags::VARIADIC;
        }
        let fn_static = self.statics.register_function(nargs, flags);

        let entry_label = self.chunk.new_label();
        let skip_label = self.chunk.new_label();
        self.chunk.append(Buildable::Jump {
            kind: JumpKind::Unconditional,
            label: skip_label,
        });
        self.chunk.append(Buildable::LabelMarker {
            label: entry_label,
            static_fixup: Some(fn_static),
        });

        // Body context: the frame starts with the arguments and the call
        // frame the VM pushed.
        let saved_depth = self.depth;
        let saved_self = self.self_reg.take();
        let saved_loops = std::mem::take(&mut self.loops);
        self.depth = total_params + 1;
        self.functions.push(FnCtx {
            capture_map: f
                .captures
                .iter()
                .enumerate()
                .map(|(i, c)| (c.source, u16::try_from(i).expect("capture list fits u16")))
                .collect(),
            has_closure,
            is_generator: f.is_generator,
        });

        // Assign parameter slots; captured parameters are re-homed into
        // boxes by the prologue so inner closures share their storage.
        for (i, param) in f.params.iter().enumerate() {
            let Some(binding) = param.binding else {
                continue;
            };
            let raw_location = implicit + u32::try_from(i).expect("param index fits u32");
            if self.unit.ident(binding).is_captured() {
                let raw_offset = self.offset_of(raw_location, param.loc)?;
                self.storage(StorageOp::LoadLocal {
                    dst: 0,
                    offset: raw_offset,
                });
                self.raw(Opcode::NewArray, smallvec![RawOperand::U8(1), RawOperand::U16(1)]);
                self.chunk.append(Buildable::ConstI32 { dst: 2, value: 0 });
                self.storage(StorageOp::StoreArrayIndex {
                    array: 1,
                    index: 2,
                    src: 0,
                });
                let box_location = self.depth;
                self.unit.ident_mut(binding).assign_stack_location(box_location);
                self.push_value(1);
            } else {
                self.unit.ident_mut(binding).assign_stack_location(raw_location);
            }
        }

        for stmt in &f.body {
            self.emit_stmt(stmt)?;
        }
        // A body ending without an explicit return implicitly returns Null.
        self.chunk.append(Buildable::ConstNull { dst: 0 });
        self.chunk.append(Buildable::Return);

        self.functions.pop();
        self.depth = saved_depth;
        self.self_reg = saved_self;
        self.loops = saved_loops;
        self.chunk.append(Buildable::LabelMarker {
            label: skip_label,
            static_fixup: None,
        });

        // Use site: a plain function value, or a closure object carrying the
        // captured boxes and the code in `$invoke`.
        if !has_closure {
            self.storage(StorageOp::LoadStatic { dst, id: fn_static });
            return Ok(());
        }
        let mut member_names: Vec<Box<str>> = f.captures.iter().map(|c| c.name.clone()).collect();
        let invoke_index = u8::try_from(member_names.len())
            .map_err(|_| EmitError::new(loc, "closure captures exceed the member limit"))?;
        member_names.push("$invoke".into());
        member_names.push(types::PROTO_MEMBER.into());
        let closure_type = self.statics.register_type_info(StaticTypeInfo {
            name: "$closure".into(),
            members: member_names,
        });
        self.raw(Opcode::New, smallvec![RawOperand::U8(dst), RawOperand::U16(closure_type.0)]);
        let value_reg = self.check_register(dst + 1, loc)?;
        for (i, capture) in f.captures.iter().enumerate() {
            let member = u8::try_from(i).expect("capture list fits u8 after the limit check");
            self.emit_capture_box_load(capture.source, value_reg, loc)?;
            self.storage(StorageOp::StoreMember {
                object: dst,
                index: member,
                src: value_reg,
            });
        }
        self.storage(StorageOp::LoadStatic {
            dst: value_reg,
            id: fn_static,
        });
        self.storage(StorageOp::StoreMember {
            object: dst,
            index: invoke_index,
            src: value_reg,
        });
        Ok(())
    }

    /// Loads the box cell of a captured identifier (not its value) into a
    /// register, from either the current frame or the current closure.
    fn emit_capture_box_load(&mut self, source: IdentRef, dst: u8, loc: SourceLocation) -> EmitResult<()> {
        if let Some(ctx) = self.functions.last() {
            if let Some(&index) = ctx.capture_map.get(&source) {
                let member = u8::try_from(index).map_err(|_| EmitError::new(loc, "capture index exceeds a byte"))?;
                let closure_offset = self.offset_of(0, loc)?;
                self.storage(StorageOp::LoadLocal {
                    dst,
                    offset: closure_offset,
                });
                self.storage(StorageOp::LoadMember {
                    dst,
                    object: dst,
                    index: member,
                });
                return Ok(());
            }
        }
        let location = self.ident_location(source, loc)?;
        let offset = self.offset_of(location, loc)?;
        self.storage(StorageOp::LoadLocal { dst, offset });
        Ok(())
    }
}

/// Maps an arithmetic/bitwise operator to its opcode.
fn arithmetic_opcode(op: BinaryOp) -> Option<Opcode> {
    match op {
        BinaryOp::Add => Some(Opcode::Add),
        BinaryOp::Sub => Some(Opcode::Sub),
        BinaryOp::Mul => Some(Opcode::Mul),
        BinaryOp::Div => Some(Opcode::Div),
        BinaryOp::Mod => Some(Opcode::Mod),
        BinaryOp::BitAnd => Some(Opcode::And),
        BinaryOp::BitOr => Some(Opcode::Or),
        BinaryOp::BitXor => Some(Opcode::Xor),
        BinaryOp::Shl => Some(Opcode::Shl),
        BinaryOp::Shr => Some(Opcode::Shr),
        _ => None,
    }
}

/// Operand order and jump kind for a comparison condition. The flags
/// register records only EQUAL and GREATER, so `<` and `<=` swap operands.
fn comparison_jump(op: BinaryOp, jump_if_true: bool, lhs: u8, rhs: u8) -> (u8, u8, JumpKind) {
    match (op, jump_if_true) {
        (BinaryOp::Equals, true) | (BinaryOp::NotEquals, false) => (lhs, rhs, JumpKind::IfEqual),
        (BinaryOp::Equals, false) | (BinaryOp::NotEquals, true) => (lhs, rhs, JumpKind::IfNotEqual),
        (BinaryOp::Greater, true) | (BinaryOp::LessEquals, false) => (lhs, rhs, JumpKind::IfGreater),
        (BinaryOp::Greater, false) | (BinaryOp::LessEquals, true) => (rhs, lhs, JumpKind::IfGreaterEqual),
        (BinaryOp::GreaterEquals, true) | (BinaryOp::Less, false) => (lhs, rhs, JumpKind::IfGreaterEqual),
        (BinaryOp::GreaterEquals, false) | (BinaryOp::Less, true) => (rhs, lhs, JumpKind::IfGreater),
        _ => unreachable!("comparison_jump is called for comparison operators only"),
    }
}
