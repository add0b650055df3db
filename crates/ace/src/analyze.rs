//! Semantic analysis: a top-down walk over the AST that resolves names,
//! computes and checks types, instantiates generics, folds constants,
//! performs imports, and lowers surface forms (for-each, block expressions,
//! `has` on dynamic types, prefix increment) into the shapes the emitter
//! understands.
//!
//! Analysis writes its results back into the AST nodes; the emitter never
//! consults scopes again. Diagnostics accumulate in the compilation unit's
//! error list and analysis keeps going after most errors, typing the failed
//! sub-tree as `Any` to avoid cascades.

use std::path::PathBuf;

use ahash::AHashMap;

use crate::{
    ast::{
        AccessMode, BinaryOp, Capture, ConstValue, DeclKind, Expr, ExprKind, FunctionExpr, ImportTarget, Stmt,
        StmtKind, TypeExprNode, UnaryOp,
    },
    builtins::NativeRegistry,
    error::{DiagnosticCode, SourceLocation},
    io::SourceLoader,
    lex::Lexer,
    parse,
    scope::{CompilationUnit, IdentFlags, IdentRef, ModuleId, ScopeKind},
    types::{self, GenericArg, Member, TypeId, TypeKind, UnifyEnv},
};

/// Per-function analysis state: the capture list under construction and the
/// generator/loop bookkeeping.
struct FunctionCtx {
    captures: Vec<Capture>,
    capture_map: AHashMap<IdentRef, u16>,
    is_generator: bool,
    loop_depth: u32,
}

impl FunctionCtx {
    fn new() -> Self {
        Self {
            captures: Vec::new(),
            capture_map: AHashMap::new(),
            is_generator: false,
            loop_depth: 0,
        }
    }

    fn capture(&mut self, name: &str, source: IdentRef) -> u16 {
        if let Some(&index) = self.capture_map.get(&source) {
            return index;
        }
        let index = u16::try_from(self.captures.len()).expect("capture list fits u16");
        self.captures.push(Capture {
            name: name.into(),
            source,
        });
        self.capture_map.insert(source, index);
        index
    }
}

/// The analyzer. Owns no AST; it mutates the statement list in place and
/// records imported modules' statement lists for the emitter.
pub struct Analyzer<'a> {
    unit: &'a mut CompilationUnit,
    natives: &'a NativeRegistry,
    loader: &'a dyn SourceLoader,
    functions: Vec<FunctionCtx>,
    /// Loop nesting outside any function, for break/continue legality.
    module_loop_depth: u32,
    self_ty: Option<TypeId>,
    current_file: Option<PathBuf>,
    /// Imported modules in emit order (dependencies first).
    imported: Vec<(ModuleId, Vec<Stmt>)>,
}

impl<'a> Analyzer<'a> {
    pub fn new(unit: &'a mut CompilationUnit, natives: &'a NativeRegistry, loader: &'a dyn SourceLoader) -> Self {
        Self {
            unit,
            natives,
            loader,
            functions: Vec::new(),
            module_loop_depth: 0,
            self_ty: None,
            current_file: None,
            imported: Vec::new(),
        }
    }

    /// Analyzes a whole source file's statement list. Returns the imported
    /// statement lists accumulated along the way, in emit order.
    pub fn analyze_program(mut self, stmts: &mut [Stmt], file: Option<PathBuf>) -> Vec<(ModuleId, Vec<Stmt>)> {
        self.current_file = file;
        self.analyze_file(stmts);
        self.imported
    }

    /// Analyzes one file's statements, honoring a leading `module` header.
    /// Returns the module the file's declarations landed in.
    fn analyze_file(&mut self, stmts: &mut [Stmt]) -> ModuleId {
        let previous_module = self.unit.current_module;
        if let Some(first) = stmts.first() {
            if let StmtKind::Module { name } = &first.kind {
                let global = self.unit.global_module();
                let module = self
                    .unit
                    .find_child_module(global, name)
                    .unwrap_or_else(|| self.unit.add_module(name, first.loc, global));
                self.unit.current_module = module;
                if self.unit.module(module).path.is_none() {
                    self.unit.module_mut(module).path = self.current_file.clone();
                }
            }
        }
        for stmt in stmts {
            self.analyze_stmt(stmt);
        }
        let analyzed_into = self.unit.current_module;
        self.unit.current_module = previous_module;
        analyzed_into
    }

    // ================================================================
    // Statements
    // ================================================================

    fn analyze_stmt(&mut self, stmt: &mut Stmt) {
        let loc = stmt.loc;
        match &mut stmt.kind {
            StmtKind::Module { .. } => {
                // Handled at file entry; a mid-file module header is ignored.
            }
            StmtKind::VarDecl(decl) => {
                let mut init_ty = None;
                if let Some(init) = &mut decl.init {
                    self.analyze_expr(init);
                    init_ty = init.ty;
                }
                let proto_ty = decl
                    .proto
                    .as_deref_mut()
                    .and_then(|proto| self.eval_type_expr_reporting(proto));
                if let (Some(from), Some(to)) = (init_ty, proto_ty) {
                    if !self.unit.registry.is_assignable(from, to) {
                        self.mismatch(loc, from, to);
                    }
                }
                let ty = proto_ty.or(init_ty).unwrap_or(types::ANY);
                let mut flags = IdentFlags::empty();
                if matches!(decl.decl_kind, DeclKind::Const | DeclKind::Val) {
                    flags |= IdentFlags::CONST;
                }
                if !self.functions.is_empty() {
                    flags |= IdentFlags::DECLARED_IN_FUNCTION;
                }
                let Some(binding) = self.declare(&decl.name, flags, Some(ty), loc) else {
                    return;
                };
                decl.binding = Some(binding);
                // Record the initializer's folded value as the binding's
                // compile-time current value.
                if let Some(init) = &decl.init {
                    self.unit.ident_mut(binding).current_value = init.const_value.clone();
                }
                // A declared type used as a prototype makes this identifier a
                // type name too when the initializer is a type expression.
                if let Some(init) = &decl.init {
                    if let ExprKind::TypeExpr(node) = &init.kind {
                        self.unit.ident_mut(binding).type_ref = node.ty;
                    }
                }
            }
            StmtKind::AliasDecl { name, aliasee, binding } => {
                // A type aliasee registers a transparent type alias; a value
                // aliasee shares the aliasee's storage and flags.
                if let Some(target_ty) = self.eval_type_expr_quiet(aliasee) {
                    let name_owned = name.clone();
                    let alias_ty = self.unit.registry.register_alias(name_owned.clone(), target_ty);
                    if let Some(ident) = self.declare(&name_owned, IdentFlags::CONST, Some(types::TYPE), loc) {
                        self.unit.ident_mut(ident).type_ref = Some(alias_ty);
                        *binding = Some(ident);
                    }
                    return;
                }
                self.analyze_expr(aliasee);
                let ExprKind::Ident {
                    binding: Some(target), ..
                } = &aliasee.kind
                else {
                    self.unit.errors.error(
                        DiagnosticCode::ExpectedIdentifier,
                        loc,
                        "alias target must be an identifier or a type",
                    );
                    return;
                };
                let target = *target;
                let target_flags = self.unit.ident(target).flags;
                let target_ty = self.unit.ident(target).ty;
                if let Some(ident) = self.declare(name, target_flags | IdentFlags::ALIAS, target_ty, loc) {
                    self.unit.ident_mut(ident).alias_of = Some(target);
                    *binding = Some(ident);
                }
            }
            StmtKind::TypeDecl(node) => {
                self.analyze_type_node(node, loc, true);
            }
            StmtKind::FuncDecl { name, func, binding } => {
                let ExprKind::Function(f) = &mut func.kind else {
                    unreachable!("parser builds function declarations from function expressions");
                };
                let mut flags = IdentFlags::CONST;
                if !self.functions.is_empty() {
                    flags |= IdentFlags::DECLARED_IN_FUNCTION;
                }
                if !f.generic_params.is_empty() {
                    // A generic declaration stores its template for cloning at
                    // each instantiation site, then type-checks the template
                    // once under placeholder types.
                    let template = func.clone();
                    let Some(ident) = self.declare(name, flags, Some(types::FUNCTION), loc) else {
                        return;
                    };
                    self.unit.ident_mut(ident).template = Some(template);
                    *binding = Some(ident);
                    self.check_template(func, loc);
                    return;
                }
                // Declare before analyzing the body so the function may
                // recurse through its own name.
                let Some(ident) = self.declare(name, flags, Some(types::FUNCTION), loc) else {
                    return;
                };
                *binding = Some(ident);
                self.analyze_expr(func);
                let is_generator = matches!(&func.kind, ExprKind::Function(f) if f.is_generator);
                let ident_mut = self.unit.ident_mut(ident);
                ident_mut.ty = func.ty;
                if is_generator {
                    ident_mut.flags |= IdentFlags::GENERATOR;
                }
            }
            StmtKind::Block(body) => {
                self.open_scope(ScopeKind::Normal);
                for child in body {
                    self.analyze_stmt(child);
                }
                self.close_scope();
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.analyze_condition(cond);
                self.open_scope(ScopeKind::Normal);
                for child in then_branch.iter_mut() {
                    self.analyze_stmt(child);
                }
                self.close_scope();
                if let Some(else_branch) = else_branch {
                    self.open_scope(ScopeKind::Normal);
                    for child in else_branch.iter_mut() {
                        self.analyze_stmt(child);
                    }
                    self.close_scope();
                }
            }
            StmtKind::While { cond, body } => {
                self.analyze_condition(cond);
                self.open_scope(ScopeKind::Loop);
                self.enter_loop();
                for child in body.iter_mut() {
                    self.analyze_stmt(child);
                }
                self.exit_loop();
                self.close_scope();
            }
            StmtKind::For {
                params,
                iteree,
                body,
                lowered,
            } => {
                self.analyze_expr(iteree);
                let element_ty = iteree.ty.and_then(|t| self.unit.registry.array_element(t)).unwrap_or(types::ANY);
                // Both for-each and numeric for lower to a call of the
                // event-action driver with a synthesized closure.
                let call_action = self
                    .natives
                    .find(Some("events"), "call_action")
                    .expect("standard registry includes call_action");
                let closure = Expr::new(
                    ExprKind::Function(Box::new(FunctionExpr {
                        params: std::mem::take(params),
                        generic_params: Vec::new(),
                        return_type_expr: None,
                        body: std::mem::take(body),
                        captures: Vec::new(),
                        return_ty: None,
                        is_generator: false,
                    })),
                    loc,
                );
                let mut call = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(Expr::new(ExprKind::NativeRef { native: call_action }, loc)),
                        args: vec![(**iteree).clone(), closure],
                    },
                    loc,
                );
                self.analyze_call_with_hints(&mut call, &[element_ty]);
                *lowered = Some(Box::new(call));
            }
            StmtKind::Return(value) => {
                if self.functions.is_empty() {
                    self.unit.errors.error(
                        DiagnosticCode::UnexpectedToken,
                        loc,
                        "'return' outside of a function",
                    );
                    return;
                }
                let ty = match value {
                    Some(value) => {
                        self.analyze_expr(value);
                        value.ty.unwrap_or(types::ANY)
                    }
                    None => types::NULL,
                };
                let module = self.unit.current_mut();
                if let Some(scope_id) = module.nearest_function_scope() {
                    module.scope_mut(scope_id).return_types.push((ty, loc));
                }
            }
            StmtKind::Yield(value) => {
                self.analyze_expr(value);
                match self.functions.last_mut() {
                    Some(ctx) => ctx.is_generator = true,
                    None => {
                        self.unit.errors.error(
                            DiagnosticCode::IllegalYield,
                            loc,
                            "'yield' outside of a generator context",
                        );
                    }
                }
            }
            StmtKind::Throw(value) => {
                self.analyze_expr(value);
            }
            StmtKind::TryCatch {
                body,
                catch_name,
                catch_binding,
                catch_body,
            } => {
                self.open_scope(ScopeKind::Normal);
                for child in body.iter_mut() {
                    self.analyze_stmt(child);
                }
                self.close_scope();
                self.open_scope(ScopeKind::Normal);
                if let Some(name) = catch_name {
                    let mut flags = IdentFlags::empty();
                    if !self.functions.is_empty() {
                        flags |= IdentFlags::DECLARED_IN_FUNCTION;
                    }
                    *catch_binding = self.declare(&name.clone(), flags, Some(types::ANY), loc);
                }
                for child in catch_body.iter_mut() {
                    self.analyze_stmt(child);
                }
                self.close_scope();
            }
            StmtKind::Import(target) => {
                let target = target.clone();
                self.analyze_import(&target, loc);
            }
            StmtKind::Directive { name, args } => {
                let name = name.clone();
                let args = args.clone();
                self.analyze_directive(&name, &args, loc);
            }
            StmtKind::Print(args) => {
                for arg in args {
                    self.analyze_expr(arg);
                }
            }
            StmtKind::Expr(expr) => {
                self.analyze_expr(expr);
            }
            StmtKind::Break => {
                if !self.in_loop() {
                    self.unit
                        .errors
                        .error(DiagnosticCode::IllegalBreak, loc, "'break' outside of a loop");
                }
            }
            StmtKind::Continue => {
                if !self.in_loop() {
                    self.unit
                        .errors
                        .error(DiagnosticCode::IllegalContinue, loc, "'continue' outside of a loop");
                }
            }
        }
    }

    fn analyze_import(&mut self, target: &ImportTarget, loc: SourceLocation) {
        match target {
            ImportTarget::File(path) => {
                let loaded = self.loader.load(path, self.current_file.as_deref());
                let (canonical, text) = match loaded {
                    Ok(loaded) => loaded,
                    Err(err) => {
                        self.unit.errors.error(
                            DiagnosticCode::ImportNotFound,
                            loc,
                            format!("cannot import '{path}': {err}"),
                        );
                        return;
                    }
                };
                // Re-imports of the same resolved path reuse the module.
                if self.unit.import_map.contains_key(&canonical) {
                    return;
                }
                let file_id = self.unit.add_file(canonical.clone());
                let tokens = Lexer::new(&text, file_id, &mut self.unit.errors).tokenize();
                let mut stmts = parse::parse(&tokens, &mut self.unit.errors);

                let previous_file = self.current_file.replace(canonical.clone());
                // Imports resolve against the global module tree regardless
                // of where the import statement appeared.
                let previous_module = self.unit.current_module;
                self.unit.current_module = self.unit.global_module();
                let imported_module = self.analyze_file(&mut stmts);
                self.unit.current_module = previous_module;
                self.current_file = previous_file;

                self.unit.import_map.insert(canonical, imported_module);
                self.imported.push((imported_module, stmts));
            }
            ImportTarget::Module(path) => {
                let global = self.unit.global_module();
                let mut current = global;
                for segment in path {
                    match self.unit.find_child_module(current, segment) {
                        Some(child) => current = child,
                        None => {
                            self.unit.errors.error(
                                DiagnosticCode::UnknownModule,
                                loc,
                                format!("unknown module '{segment}'"),
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    fn analyze_directive(&mut self, name: &str, args: &[Box<str>], loc: SourceLocation) {
        match name {
            "library" => {
                for arg in args {
                    self.unit.native_libraries.push(arg.to_string());
                }
            }
            "strict" => {
                self.unit.config.strict = true;
            }
            other => {
                self.unit.errors.warning(
                    DiagnosticCode::UnknownDirective,
                    loc,
                    format!("unknown directive '{other}'"),
                );
            }
        }
    }

    // ================================================================
    // Expressions
    // ================================================================

    fn analyze_expr(&mut self, expr: &mut Expr) {
        let loc = expr.loc;
        match &mut expr.kind {
            ExprKind::IntLit(v) => {
                expr.ty = Some(types::INT);
                expr.const_value = Some(ConstValue::Int(*v));
            }
            ExprKind::FloatLit(v) => {
                expr.ty = Some(types::FLOAT);
                expr.const_value = Some(ConstValue::Float(*v));
            }
            ExprKind::StrLit(s) => {
                expr.ty = Some(types::STRING);
                expr.const_value = Some(ConstValue::Str(s.clone()));
            }
            ExprKind::BoolLit(b) => {
                expr.ty = Some(types::BOOLEAN);
                expr.const_value = Some(ConstValue::Bool(*b));
            }
            ExprKind::NullLit => {
                expr.ty = Some(types::NULL);
                expr.const_value = Some(ConstValue::Null);
            }
            ExprKind::Ident { .. } => self.analyze_ident(expr),
            ExprKind::Unary { op, operand } => {
                if matches!(op, UnaryOp::Increment | UnaryOp::Decrement) {
                    // Prefix ++/-- rewrite to compound assignment.
                    let assign_op = if matches!(op, UnaryOp::Increment) {
                        BinaryOp::AddAssign
                    } else {
                        BinaryOp::SubAssign
                    };
                    let target = std::mem::replace(
                        operand,
                        Box::new(Expr::new(ExprKind::NullLit, loc)),
                    );
                    expr.kind = ExprKind::Binary {
                        op: assign_op,
                        lhs: target,
                        rhs: Box::new(Expr::new(ExprKind::IntLit(1), loc)),
                    };
                    self.analyze_expr(expr);
                    return;
                }
                self.analyze_unary(expr);
            }
            ExprKind::Binary { .. } => self.analyze_binary(expr),
            ExprKind::Call { .. } => self.analyze_call_with_hints(expr, &[]),
            ExprKind::Member { .. } => self.analyze_member(expr),
            ExprKind::Index { object, index } => {
                self.analyze_expr(object);
                self.analyze_expr(index);
                if let Some(index_ty) = index.ty {
                    if !self.unit.registry.is_assignable(index_ty, types::INT) {
                        self.mismatch(index.loc, index_ty, types::INT);
                    }
                }
                let element = object
                    .ty
                    .and_then(|t| {
                        let resolved = self.unit.registry.resolve(t);
                        if resolved == types::STRING {
                            Some(types::STRING)
                        } else {
                            self.unit.registry.array_element(t)
                        }
                    })
                    .unwrap_or(types::ANY);
                expr.ty = Some(element);
            }
            ExprKind::ArrayLit(items) => {
                let mut element = None;
                for item in items.iter_mut() {
                    self.analyze_expr(item);
                    let item_ty = item.ty.unwrap_or(types::ANY);
                    element = Some(match element {
                        None => item_ty,
                        Some(prior) => self.unit.registry.join(prior, item_ty),
                    });
                }
                let element = element.unwrap_or(types::ANY);
                expr.ty = Some(self.unit.registry.array_of(element));
            }
            ExprKind::Function(_) => self.analyze_function(expr, &[]),
            ExprKind::TypeExpr(node) => {
                let ty = self.analyze_type_node(node, loc, true);
                let _ = ty;
                expr.ty = Some(types::TYPE);
            }
            ExprKind::GenericApply { .. } => self.analyze_generic_apply(expr),
            ExprKind::BlockExpr(stmts) => {
                // A block expression reifies through a synthesized
                // zero-argument closure; its value is the value of its last
                // expression statement.
                let mut body = std::mem::take(stmts);
                if let Some(last) = body.last_mut() {
                    if let StmtKind::Expr(_) = &last.kind {
                        let StmtKind::Expr(value) = std::mem::replace(&mut last.kind, StmtKind::Break) else {
                            unreachable!("checked expression statement");
                        };
                        last.kind = StmtKind::Return(Some(value));
                    }
                }
                let closure = Expr::new(
                    ExprKind::Function(Box::new(FunctionExpr {
                        params: Vec::new(),
                        generic_params: Vec::new(),
                        return_type_expr: None,
                        body,
                        captures: Vec::new(),
                        return_ty: None,
                        is_generator: false,
                    })),
                    loc,
                );
                expr.kind = ExprKind::Call {
                    callee: Box::new(closure),
                    args: Vec::new(),
                };
                self.analyze_expr(expr);
            }
            ExprKind::New { proto } => {
                let ty = self.eval_type_expr_reporting(proto);
                match ty.map(|t| (t, self.unit.registry.resolve(t))) {
                    Some((t, resolved))
                        if matches!(self.unit.registry.get(resolved).kind, TypeKind::Object { .. }) =>
                    {
                        expr.ty = Some(t);
                    }
                    _ => {
                        self.unit.errors.error(
                            DiagnosticCode::NotAType,
                            loc,
                            "'new' requires an object type",
                        );
                        expr.ty = Some(types::ANY);
                    }
                }
            }
            ExprKind::Has { object, member } => {
                self.analyze_expr(object);
                let member = member.clone();
                let object_ty = object.ty.map(|t| self.unit.registry.resolve(t));
                if let Some(ty) = object_ty {
                    if let TypeKind::Object { members, .. } = &self.unit.registry.get(ty).kind {
                        let found = members.iter().any(|m| m.name == member);
                        expr.ty = Some(types::BOOLEAN);
                        expr.const_value = Some(ConstValue::Bool(found));
                        return;
                    }
                }
                // Dynamic receiver: defer to the runtime membership native.
                let has = self
                    .natives
                    .find(Some("runtime"), "has")
                    .expect("standard registry includes runtime::has");
                let object = std::mem::replace(object, Box::new(Expr::new(ExprKind::NullLit, loc)));
                expr.kind = ExprKind::Call {
                    callee: Box::new(Expr::new(ExprKind::NativeRef { native: has }, loc)),
                    args: vec![*object, Expr::new(ExprKind::StrLit(member), loc)],
                };
                self.analyze_expr(expr);
            }
            ExprKind::TypeOf { operand } => {
                self.analyze_expr(operand);
                let name = operand
                    .ty
                    .map_or_else(|| "Any".to_owned(), |t| self.unit.registry.get(t).name.to_string());
                expr.ty = Some(types::STRING);
                expr.const_value = Some(ConstValue::Str(name.into_boxed_str()));
            }
            ExprKind::SelfExpr => match self.self_ty {
                Some(ty) => expr.ty = Some(ty),
                None => {
                    self.unit.errors.error(
                        DiagnosticCode::IllegalSelf,
                        loc,
                        "'self' outside of a type definition",
                    );
                    expr.ty = Some(types::ANY);
                }
            },
            ExprKind::NativeRef { native } => {
                let index = *native;
                expr.ty = Some(self.natives.signature(index, &mut self.unit.registry));
            }
        }
    }

    fn analyze_ident(&mut self, expr: &mut Expr) {
        let loc = expr.loc;
        let ExprKind::Ident {
            name,
            binding,
            capture_index,
        } = &mut expr.kind
        else {
            unreachable!("analyze_ident visits identifier nodes");
        };
        let active = u32::try_from(self.functions.len()).expect("function depth fits u32");
        let Some((mut resolved, crossed)) = self.unit.resolve_name(name, active) else {
            self.unit.errors.error(
                DiagnosticCode::UndeclaredIdentifier,
                loc,
                format!("undeclared identifier '{name}'"),
            );
            expr.ty = Some(types::ANY);
            return;
        };
        // Aliases behave as references to the aliasee.
        while let Some(target) = self.unit.ident(resolved).alias_of {
            resolved = target;
        }
        self.unit.mark_used(resolved);
        *binding = Some(resolved);

        let ident = self.unit.ident(resolved);
        expr.ty = ident.ty.or(Some(types::ANY));

        if ident.is_native() {
            return;
        }
        if ident.type_ref.is_some() {
            expr.ty = Some(types::TYPE);
            return;
        }
        // Constants fold into closures by value; no capture needed.
        if ident.is_const() && ident.current_value.is_some() && expr.access == AccessMode::Load {
            expr.const_value = ident.current_value.clone();
            return;
        }
        if crossed > 0 {
            // The reference crosses function boundaries: record the capture
            // on every function between the declaration and this use, so the
            // emitter can thread the shared box through each closure object.
            self.unit.ident_mut(resolved).flags |= IdentFlags::CAPTURED;
            let total = self.functions.len();
            let first = total - (crossed as usize).min(total);
            let name = name.clone();
            let mut index = 0;
            for ctx in &mut self.functions[first..] {
                index = ctx.capture(&name, resolved);
            }
            *capture_index = Some(index);
        }
    }

    fn analyze_unary(&mut self, expr: &mut Expr) {
        let loc = expr.loc;
        let ExprKind::Unary { op, operand } = &mut expr.kind else {
            unreachable!("analyze_unary visits unary nodes");
        };
        self.analyze_expr(operand);
        let op = *op;
        let operand_ty = operand.ty.unwrap_or(types::ANY);
        let folded = operand.const_value.clone();
        match op {
            UnaryOp::Not => {
                self.require_assignable(operand.loc, operand_ty, types::BOOLEAN);
                expr.ty = Some(types::BOOLEAN);
                if let Some(ConstValue::Bool(b)) = folded {
                    expr.const_value = Some(ConstValue::Bool(!b));
                }
            }
            UnaryOp::Negate | UnaryOp::Positive => {
                if !self.unit.registry.is_numeric(operand_ty) && self.unit.registry.resolve(operand_ty) != types::ANY {
                    self.mismatch(loc, operand_ty, types::NUMBER);
                }
                expr.ty = Some(operand_ty);
                expr.const_value = match (op, folded) {
                    (UnaryOp::Negate, Some(ConstValue::Int(v))) => Some(ConstValue::Int(v.wrapping_neg())),
                    (UnaryOp::Negate, Some(ConstValue::Float(v))) => Some(ConstValue::Float(-v)),
                    (UnaryOp::Positive, folded) => folded,
                    _ => None,
                };
            }
            UnaryOp::BitNot => {
                self.require_assignable(operand.loc, operand_ty, types::INT);
                expr.ty = Some(types::INT);
                if let Some(ConstValue::Int(v)) = folded {
                    expr.const_value = Some(ConstValue::Int(!v));
                }
            }
            UnaryOp::Increment | UnaryOp::Decrement => unreachable!("rewritten before analyze_unary"),
        }
    }

    fn analyze_binary(&mut self, expr: &mut Expr) {
        let loc = expr.loc;
        let ExprKind::Binary { op, lhs, rhs } = &mut expr.kind else {
            unreachable!("analyze_binary visits binary nodes");
        };
        let op = *op;

        if op.is_assignment() {
            lhs.access = AccessMode::Store;
            self.analyze_expr(lhs);
            self.analyze_expr(rhs);
            if !lhs.is_storable_place() {
                self.unit.errors.error(
                    DiagnosticCode::UnexpectedToken,
                    lhs.loc,
                    "left side of assignment is not assignable",
                );
                expr.ty = Some(types::ANY);
                return;
            }
            if let ExprKind::Ident {
                binding: Some(binding), ..
            } = &lhs.kind
            {
                let binding = *binding;
                let ident = self.unit.ident(binding);
                if ident.is_const() {
                    let name = ident.name.clone();
                    self.unit.errors.error(
                        DiagnosticCode::ConstReassignment,
                        loc,
                        format!("cannot assign to constant '{name}'"),
                    );
                }
                // Assignment invalidates the recorded compile-time value.
                self.unit.ident_mut(binding).current_value = None;
            }
            let lhs_ty = lhs.ty.unwrap_or(types::ANY);
            let rhs_ty = rhs.ty.unwrap_or(types::ANY);
            if let Some(base) = op.compound_base() {
                self.check_binary_operands(loc, base, lhs_ty, rhs_ty);
            }
            if !self.unit.registry.is_assignable(rhs_ty, lhs_ty) {
                self.mismatch(loc, rhs_ty, lhs_ty);
            }
            expr.ty = Some(lhs_ty);
            return;
        }

        self.analyze_expr(lhs);
        self.analyze_expr(rhs);
        let lhs_ty = lhs.ty.unwrap_or(types::ANY);
        let rhs_ty = rhs.ty.unwrap_or(types::ANY);

        if op.is_logical() {
            self.require_assignable(lhs.loc, lhs_ty, types::BOOLEAN);
            self.require_assignable(rhs.loc, rhs_ty, types::BOOLEAN);
            expr.ty = Some(types::BOOLEAN);
            expr.const_value = self.fold_logical(op, lhs, rhs);
            return;
        }
        if op.is_comparison() {
            expr.ty = Some(types::BOOLEAN);
            expr.const_value = fold_comparison(op, lhs.const_value.as_ref(), rhs.const_value.as_ref());
            return;
        }

        // Arithmetic, bitwise and shift operators.
        self.check_binary_operands(loc, op, lhs_ty, rhs_ty);
        expr.ty = Some(match op {
            BinaryOp::Add
                if self.unit.registry.resolve(lhs_ty) == types::STRING
                    && self.unit.registry.resolve(rhs_ty) == types::STRING =>
            {
                types::STRING
            }
            BinaryOp::Add if self.unit.registry.array_element(lhs_ty).is_some() => lhs_ty,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => types::INT,
            _ => self.unit.registry.promote(lhs_ty, rhs_ty),
        });
        if let (Some(a), Some(b)) = (lhs.const_value.clone(), rhs.const_value.clone()) {
            match fold_arithmetic(op, &a, &b) {
                Ok(folded) => expr.const_value = folded,
                Err(FoldError::DivisionByZero) => {
                    // Division or modulus by a zero constant is diagnosed at
                    // the divisor and folds to Undefined.
                    self.unit.errors.error(
                        DiagnosticCode::DivisionByZeroConstant,
                        rhs.loc,
                        "division by a zero constant",
                    );
                    expr.const_value = Some(ConstValue::Undefined);
                }
            }
        }
    }

    /// Checks operand types for an arithmetic/bitwise operator, allowing the
    /// string-concatenation and array-append forms of `+`.
    fn check_binary_operands(&mut self, loc: SourceLocation, op: BinaryOp, lhs_ty: TypeId, rhs_ty: TypeId) {
        let registry = &self.unit.registry;
        let lhs_res = registry.resolve(lhs_ty);
        let rhs_res = registry.resolve(rhs_ty);
        if lhs_res == types::ANY || rhs_res == types::ANY {
            return;
        }
        match op {
            BinaryOp::Add => {
                let strings = lhs_res == types::STRING && rhs_res == types::STRING;
                let array_append = registry.array_element(lhs_ty).is_some();
                let numeric = registry.is_numeric(lhs_ty) && registry.is_numeric(rhs_ty);
                if !strings && !array_append && !numeric {
                    self.invalid_operands(loc, lhs_ty, rhs_ty);
                }
            }
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                if !(registry.is_numeric(lhs_ty) && registry.is_numeric(rhs_ty)) {
                    self.invalid_operands(loc, lhs_ty, rhs_ty);
                }
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => {
                let ints = registry.is_assignable(lhs_ty, types::INT) && registry.is_assignable(rhs_ty, types::INT);
                if !ints {
                    self.invalid_operands(loc, lhs_ty, rhs_ty);
                }
            }
            _ => {}
        }
    }

    fn fold_logical(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Option<ConstValue> {
        let lhs_const = lhs.const_value.as_ref();
        let rhs_const = rhs.const_value.as_ref();
        match (op, lhs_const, rhs_const) {
            (BinaryOp::LogicalAnd, Some(ConstValue::Bool(a)), Some(ConstValue::Bool(b))) => {
                Some(ConstValue::Bool(*a && *b))
            }
            (BinaryOp::LogicalOr, Some(ConstValue::Bool(a)), Some(ConstValue::Bool(b))) => {
                Some(ConstValue::Bool(*a || *b))
            }
            // A deciding left operand folds when the skipped right side has
            // no side effects.
            (BinaryOp::LogicalAnd, Some(ConstValue::Bool(false)), _) if !rhs.may_have_side_effects() => {
                Some(ConstValue::Bool(false))
            }
            (BinaryOp::LogicalOr, Some(ConstValue::Bool(true)), _) if !rhs.may_have_side_effects() => {
                Some(ConstValue::Bool(true))
            }
            _ => None,
        }
    }

    fn analyze_call_with_hints(&mut self, expr: &mut Expr, closure_hints: &[TypeId]) {
        let loc = expr.loc;
        let ExprKind::Call { callee, args } = &mut expr.kind else {
            unreachable!("analyze_call visits call nodes");
        };
        match &mut callee.kind {
            ExprKind::Function(_) => self.analyze_function(callee, closure_hints),
            _ => self.analyze_expr(callee),
        }
        // Calling a generator directly would misalign its implicit callback
        // parameter; only the event-action driver may invoke it.
        if let ExprKind::Ident {
            binding: Some(binding), ..
        } = &callee.kind
        {
            if self.unit.ident(*binding).flags.contains(IdentFlags::GENERATOR) {
                self.unit.errors.error(
                    DiagnosticCode::NotAFunction,
                    loc,
                    "a generator function can only be driven by 'for'",
                );
            }
        }
        let mut arg_hint_index = 0usize;
        for arg in args.iter_mut() {
            if matches!(arg.kind, ExprKind::Function(_)) && arg_hint_index == 0 && !closure_hints.is_empty() {
                self.analyze_function(arg, closure_hints);
                arg_hint_index += 1;
            } else {
                self.analyze_expr(arg);
            }
        }

        let callee_ty = callee.ty.unwrap_or(types::ANY);
        let resolved = self.unit.registry.resolve(callee_ty);
        if resolved == types::ANY || resolved == types::FUNCTION {
            expr.ty = Some(types::ANY);
            return;
        }
        let Some((ret, params)) = self.unit.registry.as_function(callee_ty) else {
            self.unit.errors.error(
                DiagnosticCode::NotAFunction,
                loc,
                format!("cannot call a value of type '{}'", self.unit.registry.get(callee_ty).name),
            );
            expr.ty = Some(types::ANY);
            return;
        };

        let variadic = params
            .last()
            .is_some_and(|&p| self.unit.registry.varargs_element(p).is_some());
        let fixed = if variadic { params.len() - 1 } else { params.len() };
        let defaults = self.param_defaults(callee_ty);
        let required = fixed - defaults.iter().take(fixed).filter(|d| d.is_some()).count();
        if args.len() < required || (!variadic && args.len() > params.len()) {
            self.unit.errors.error(
                DiagnosticCode::IncorrectArgumentCount,
                loc,
                format!("expected {} argument(s), found {}", params.len(), args.len()),
            );
        }
        for (i, arg) in args.iter().enumerate() {
            let param_ty = if i < fixed {
                params[i]
            } else if variadic {
                self.unit
                    .registry
                    .varargs_element(params[fixed])
                    .unwrap_or(types::ANY)
            } else {
                break;
            };
            let arg_ty = arg.ty.unwrap_or(types::ANY);
            if !self.unit.registry.is_assignable(arg_ty, param_ty) {
                self.mismatch(arg.loc, arg_ty, param_ty);
            }
        }
        expr.ty = Some(ret);
    }

    /// Per-parameter constant defaults of a function type, in order.
    fn param_defaults(&self, func_ty: TypeId) -> Vec<Option<ConstValue>> {
        let resolved = self.unit.registry.resolve(func_ty);
        match &self.unit.registry.get(resolved).kind {
            TypeKind::GenericInstance { base, args } if self.unit.registry.resolve(*base) == types::FUNCTION => {
                args.iter().skip(1).map(|a| a.default.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    fn analyze_member(&mut self, expr: &mut Expr) {
        let loc = expr.loc;
        let access = expr.access;
        let ExprKind::Member {
            object,
            member,
            member_index,
        } = &mut expr.kind
        else {
            unreachable!("analyze_member visits member nodes");
        };

        // `Module.name` resolves to the module's own binding rather than a
        // runtime member access.
        if let ExprKind::Ident { name, .. } = &object.kind {
            let active = u32::try_from(self.functions.len()).expect("function depth fits u32");
            if self.unit.resolve_name(name, active).is_none() {
                let global = self.unit.global_module();
                let module = self
                    .unit
                    .find_child_module(global, name)
                    .or_else(|| self.unit.find_child_module(self.unit.current_module, name));
                if let Some(module) = module {
                    if self.unit.module(module).lookup_root(member).is_some() {
                        let rewritten = Expr {
                            kind: ExprKind::Ident {
                                name: member.clone(),
                                binding: None,
                                capture_index: None,
                            },
                            loc,
                            access,
                            ty: None,
                            const_value: None,
                        };
                        *expr = rewritten;
                        self.analyze_module_member(expr, module);
                        return;
                    }
                }
            }
        }

        self.analyze_expr(object);
        let object_ty = object.ty.map(|t| self.unit.registry.resolve(t)).unwrap_or(types::ANY);
        if let TypeKind::Object { members, .. } = &self.unit.registry.get(object_ty).kind {
            match members.iter().position(|m| m.name == *member) {
                Some(index) => {
                    *member_index = Some(u8::try_from(index).expect("member count fits u8"));
                    expr.ty = Some(members[index].ty);
                }
                None => {
                    let member = member.clone();
                    let type_name = self.unit.registry.get(object_ty).name.clone();
                    self.unit.errors.error(
                        DiagnosticCode::UnknownMemberName,
                        loc,
                        format!("type '{type_name}' has no member '{member}'"),
                    );
                    expr.ty = Some(types::ANY);
                }
            }
        } else {
            // Dynamic receiver: emitted as a hashed member access.
            expr.ty = Some(types::ANY);
        }
    }

    /// Analyzes an identifier that was rewritten from a `Module.name` access:
    /// resolution happens in the named module's root scope.
    fn analyze_module_member(&mut self, expr: &mut Expr, module: ModuleId) {
        let loc = expr.loc;
        let ExprKind::Ident {
            name,
            binding,
            capture_index,
        } = &mut expr.kind
        else {
            unreachable!("module members rewrite to identifiers");
        };
        let Some(ident) = self.unit.module(module).lookup_root(name) else {
            self.unit.errors.error(
                DiagnosticCode::UndeclaredIdentifier,
                loc,
                format!("undeclared identifier '{name}'"),
            );
            expr.ty = Some(types::ANY);
            return;
        };
        let mut resolved = IdentRef { module, ident };
        while let Some(target) = self.unit.ident(resolved).alias_of {
            resolved = target;
        }
        self.unit.mark_used(resolved);
        *binding = Some(resolved);
        let ident = self.unit.ident(resolved);
        expr.ty = ident.ty.or(Some(types::ANY));
        if ident.is_native() || ident.type_ref.is_some() {
            return;
        }
        if ident.is_const() && ident.current_value.is_some() {
            expr.const_value = ident.current_value.clone();
            return;
        }
        // A cross-module data reference from inside any function captures.
        if !self.functions.is_empty() {
            self.unit.ident_mut(resolved).flags |= IdentFlags::CAPTURED;
            let name = name.clone();
            let mut index = 0;
            for ctx in &mut self.functions {
                index = ctx.capture(&name, resolved);
            }
            *capture_index = Some(index);
        }
    }

    fn analyze_function(&mut self, expr: &mut Expr, param_hints: &[TypeId]) {
        let loc = expr.loc;
        let ExprKind::Function(f) = &mut expr.kind else {
            unreachable!("analyze_function visits function nodes");
        };
        if !f.generic_params.is_empty() {
            self.unit.errors.error(
                DiagnosticCode::UnexpectedToken,
                loc,
                "generic parameters are only allowed on function declarations",
            );
        }

        self.open_scope(ScopeKind::Function);
        self.functions.push(FunctionCtx::new());

        let mut param_tys = Vec::with_capacity(f.params.len());
        for (i, param) in f.params.iter_mut().enumerate() {
            let annotated = param
                .type_expr
                .as_deref_mut()
                .and_then(|e| self.eval_type_expr_reporting(e));
            let ty = annotated.or_else(|| param_hints.get(i).copied()).unwrap_or(types::ANY);
            let mut default_const = None;
            if let Some(default) = &mut param.default {
                self.analyze_expr(default);
                if let Some(default_ty) = default.ty {
                    if !self.unit.registry.is_assignable(default_ty, ty) {
                        self.mismatch(default.loc, default_ty, ty);
                    }
                }
                default_const = default.const_value.clone();
                if default_const.is_none() {
                    self.unit.errors.error(
                        DiagnosticCode::UnexpectedToken,
                        default.loc,
                        "parameter defaults must be compile-time constants",
                    );
                }
            }
            let declared_ty = if param.is_variadic {
                let wrapped = self.unit.registry.varargs(ty);
                param_tys.push((wrapped, None));
                // Inside the body a variadic parameter binds to an array.
                self.unit.registry.array_of(ty)
            } else {
                param_tys.push((ty, default_const));
                ty
            };
            let flags = IdentFlags::DECLARED_IN_FUNCTION;
            param.binding = self.declare(&param.name.clone(), flags, Some(declared_ty), param.loc);
        }

        for stmt in &mut f.body {
            self.analyze_stmt(stmt);
        }

        // The return type is the join of every observed return; a body with
        // no returns yields Null.
        let declared_ret = f
            .return_type_expr
            .as_deref_mut()
            .and_then(|e| self.eval_type_expr_reporting(e));
        let module = self.unit.current();
        let observations: Vec<(TypeId, SourceLocation)> = module
            .nearest_function_scope()
            .map(|s| module.scope(s).return_types.clone())
            .unwrap_or_default();
        let mut observed = None;
        for (ty, obs_loc) in &observations {
            if let Some(declared) = declared_ret {
                if !self.unit.registry.is_assignable(*ty, declared) {
                    self.unit.errors.error(
                        DiagnosticCode::MismatchedReturnTypes,
                        *obs_loc,
                        format!(
                            "return type '{}' is not assignable to declared '{}'",
                            self.unit.registry.get(*ty).name,
                            self.unit.registry.get(declared).name
                        ),
                    );
                }
            }
            observed = Some(match observed {
                None => *ty,
                Some(prior) => self.unit.registry.join(prior, *ty),
            });
        }
        let ret = declared_ret.or(observed).unwrap_or(types::NULL);

        let ctx = self.functions.pop().expect("pushed above");
        self.close_scope();

        f.captures = ctx.captures;
        f.is_generator = ctx.is_generator;
        f.return_ty = Some(ret);
        expr.ty = Some(self.unit.registry.function_sig(ret, param_tys));
    }

    /// Type-checks a generic template once, with its formals introduced as
    /// placeholder types in a fresh scope. Unused-identifier warnings stay
    /// off: the template body is re-checked at every instantiation.
    fn check_template(&mut self, func: &mut Expr, loc: SourceLocation) {
        let ExprKind::Function(f) = &func.kind else {
            return;
        };
        let generic_params = f.generic_params.clone();
        let warn = self.unit.config.warn_unused;
        self.unit.config.warn_unused = false;
        self.open_scope(ScopeKind::Normal);
        for generic in &generic_params {
            let placeholder = self.unit.registry.register_placeholder(generic.name.clone());
            if let Some(ident) = self.declare(
                &generic.name,
                IdentFlags::CONST | IdentFlags::GENERIC_PLACEHOLDER,
                Some(types::TYPE),
                generic.loc,
            ) {
                self.unit.ident_mut(ident).type_ref = Some(placeholder);
            }
        }
        let mut check_clone = func.clone();
        if let ExprKind::Function(f) = &mut check_clone.kind {
            f.generic_params.clear();
        }
        self.analyze_function(&mut check_clone, &[]);
        self.close_scope();
        self.unit.config.warn_unused = warn;
        let _ = loc;
    }

    /// Instantiates `base<Args...>`: unifies formals against the supplied
    /// actuals, clones the stored template with placeholders substituted,
    /// and re-analyzes the clone in place of this node.
    fn analyze_generic_apply(&mut self, expr: &mut Expr) {
        let loc = expr.loc;
        let ExprKind::GenericApply { base, args } = &mut expr.kind else {
            unreachable!("analyze_generic_apply visits generic applications");
        };

        let mut arg_tys = Vec::with_capacity(args.len());
        for arg in args.iter_mut() {
            arg_tys.push(self.eval_type_expr_reporting(arg).unwrap_or(types::ANY));
        }

        // Generic type application (Array<Int>, Maybe<T>) in type position
        // is handled by eval_type_expr; reaching here in value position means
        // the base must be a generic function template.
        let template = match &base.kind {
            ExprKind::Ident { name, .. } => {
                let active = u32::try_from(self.functions.len()).expect("function depth fits u32");
                self.unit
                    .resolve_name(name, active)
                    .and_then(|(binding, _)| {
                        self.unit.mark_used(binding);
                        self.unit.ident(binding).template.clone()
                    })
            }
            _ => None,
        };
        let Some(template) = template else {
            self.unit.errors.error(
                DiagnosticCode::NotAFunction,
                loc,
                "generic application requires a generic function",
            );
            expr.ty = Some(types::ANY);
            return;
        };
        let ExprKind::Function(template_fn) = &template.kind else {
            unreachable!("templates are stored as function expressions");
        };
        let generic_params = template_fn.generic_params.clone();
        if generic_params.len() != arg_tys.len() {
            self.unit.errors.error(
                DiagnosticCode::GenericArgumentCount,
                loc,
                format!(
                    "expected {} generic argument(s), found {}",
                    generic_params.len(),
                    arg_tys.len()
                ),
            );
            expr.ty = Some(types::ANY);
            return;
        }

        // Each placeholder unifies with exactly one concrete type.
        let mut env = UnifyEnv::new();
        let placeholders: Vec<TypeId> = generic_params
            .iter()
            .map(|g| self.unit.registry.register_placeholder(g.name.clone()))
            .collect();
        for (&placeholder, &actual) in placeholders.iter().zip(&arg_tys) {
            if let Err(conflict) = env.unify(&self.unit.registry, placeholder, actual, loc) {
                self.unit.errors.error(
                    DiagnosticCode::CannotUnifyGenericParameter,
                    conflict.loc,
                    format!(
                        "cannot unify generic parameter '{}' with '{}'",
                        self.unit.registry.get(conflict.placeholder).name,
                        self.unit.registry.get(conflict.attempted).name
                    ),
                );
            }
        }

        // Synthesize the instantiation: a clone of the template re-analyzed
        // in a scope where each formal names its concrete argument.
        let mut instance = template.clone();
        if let ExprKind::Function(f) = &mut instance.kind {
            f.generic_params.clear();
        }
        self.open_scope(ScopeKind::Normal);
        for (generic, &actual) in generic_params.iter().zip(&arg_tys) {
            if let Some(ident) = self.declare(
                &generic.name,
                IdentFlags::CONST | IdentFlags::GENERIC_PLACEHOLDER,
                Some(types::TYPE),
                generic.loc,
            ) {
                self.unit.ident_mut(ident).type_ref = Some(actual);
            }
        }
        self.analyze_function(&mut instance, &[]);
        self.close_scope();

        let instance_ty = instance.ty;
        *expr = *instance;
        expr.loc = loc;
        expr.ty = instance_ty;
    }

    /// Registers a `type Name { ... }` node: members first, then the object
    /// type, then member defaults under the type-definition scope with
    /// `self` bound.
    fn analyze_type_node(&mut self, node: &mut TypeExprNode, loc: SourceLocation, declare_name: bool) -> Option<TypeId> {
        self.open_scope(ScopeKind::TypeDefinition);
        let mut members = Vec::with_capacity(node.members.len() + 1);
        for member in &mut node.members {
            let ty = member
                .type_expr
                .as_deref_mut()
                .and_then(|e| self.eval_type_expr_reporting(e))
                .unwrap_or(types::ANY);
            members.push(Member {
                name: member.name.clone(),
                ty,
                has_default: member.default.is_some(),
            });
        }
        // A `$proto` member is synthesized if absent; it names the prototype
        // TypeObject used by `new`.
        if !members.iter().any(|m| m.name.as_ref() == types::PROTO_MEMBER) {
            members.push(Member {
                name: types::PROTO_MEMBER.into(),
                ty: types::TYPE,
                has_default: false,
            });
        }
        if members.len() > self.unit.config.max_data_members {
            self.unit.errors.error(
                DiagnosticCode::UnexpectedToken,
                loc,
                format!("type '{}' exceeds the member limit", node.name),
            );
        }
        let ty = self.unit.registry.register_object(node.name.clone(), None, members);
        node.ty = Some(ty);

        let previous_self = self.self_ty.replace(ty);
        for member in &mut node.members {
            if let Some(default) = &mut member.default {
                self.analyze_expr(default);
            }
        }
        self.self_ty = previous_self;
        self.close_scope();

        if declare_name {
            if let Some(ident) = self.declare(&node.name.clone(), IdentFlags::CONST, Some(types::TYPE), loc) {
                self.unit.ident_mut(ident).type_ref = Some(ty);
            }
        }
        Some(ty)
    }

    // ================================================================
    // Type expressions
    // ================================================================

    /// Evaluates an expression in type position, reporting a diagnostic when
    /// it does not denote a type.
    fn eval_type_expr_reporting(&mut self, expr: &mut Expr) -> Option<TypeId> {
        match self.eval_type_expr_quiet(expr) {
            Some(ty) => Some(ty),
            None => {
                self.unit.errors.error(
                    DiagnosticCode::ExpectedTypeExpression,
                    expr.loc,
                    "expected a type expression",
                );
                None
            }
        }
    }

    /// Evaluates an expression in type position without diagnostics, so
    /// callers can fall back to value semantics.
    fn eval_type_expr_quiet(&mut self, expr: &mut Expr) -> Option<TypeId> {
        let loc = expr.loc;
        match &mut expr.kind {
            ExprKind::Ident { name, .. } => {
                let active = u32::try_from(self.functions.len()).expect("function depth fits u32");
                let (binding, _) = self.unit.resolve_name(name, active)?;
                let mut resolved = binding;
                while let Some(target) = self.unit.ident(resolved).alias_of {
                    resolved = target;
                }
                let ty = self.unit.ident(resolved).type_ref?;
                self.unit.mark_used(resolved);
                expr.ty = Some(types::TYPE);
                Some(ty)
            }
            ExprKind::GenericApply { base, args } => {
                let base_ty = self.eval_type_expr_quiet(base)?;
                let mut generic_args = Vec::with_capacity(args.len());
                for (i, arg) in args.iter_mut().enumerate() {
                    let arg_ty = self.eval_type_expr_quiet(arg)?;
                    generic_args.push(GenericArg::new(format!("@arg{i}"), arg_ty));
                }
                expr.ty = Some(types::TYPE);
                Some(self.unit.registry.instantiate(base_ty, generic_args))
            }
            ExprKind::TypeExpr(node) => {
                let mut node_taken = node.clone();
                let ty = self.analyze_type_node(&mut node_taken, loc, false);
                **node = *node_taken;
                expr.ty = Some(types::TYPE);
                ty
            }
            _ => None,
        }
    }

    // ================================================================
    // Conditions, scopes, helpers
    // ================================================================

    fn analyze_condition(&mut self, cond: &mut Expr) {
        self.analyze_expr(cond);
        if let Some(ty) = cond.ty {
            if !self.unit.registry.is_assignable(ty, types::BOOLEAN) {
                self.unit.errors.error(
                    DiagnosticCode::ConditionNotBoolean,
                    cond.loc,
                    format!("condition has type '{}', expected Boolean", self.unit.registry.get(ty).name),
                );
            }
        }
    }

    fn open_scope(&mut self, kind: ScopeKind) {
        self.unit.current_mut().open_scope(kind);
    }

    fn close_scope(&mut self) {
        let module_id = self.unit.current_module;
        let scope = self.unit.current().top();
        self.unit.warn_unused_in_scope(module_id, scope);
        self.unit.current_mut().close_scope();
    }

    fn declare(&mut self, name: &str, flags: IdentFlags, ty: Option<TypeId>, loc: SourceLocation) -> Option<IdentRef> {
        let module_id = self.unit.current_module;
        match self.unit.module_mut(module_id).declare(name, flags, ty, loc) {
            Some(ident) => Some(IdentRef {
                module: module_id,
                ident,
            }),
            None => {
                self.unit.errors.error(
                    DiagnosticCode::RedeclaredIdentifier,
                    loc,
                    format!("identifier '{name}' is already declared in this scope"),
                );
                None
            }
        }
    }

    fn enter_loop(&mut self) {
        match self.functions.last_mut() {
            Some(ctx) => ctx.loop_depth += 1,
            None => self.module_loop_depth += 1,
        }
    }

    fn exit_loop(&mut self) {
        match self.functions.last_mut() {
            Some(ctx) => ctx.loop_depth -= 1,
            None => self.module_loop_depth -= 1,
        }
    }

    fn in_loop(&self) -> bool {
        match self.functions.last() {
            Some(ctx) => ctx.loop_depth > 0,
            None => self.module_loop_depth > 0,
        }
    }

    fn mismatch(&mut self, loc: SourceLocation, from: TypeId, to: TypeId) {
        self.unit.errors.error(
            DiagnosticCode::MismatchedTypes,
            loc,
            format!(
                "type '{}' is not assignable to '{}'",
                self.unit.registry.get(from).name,
                self.unit.registry.get(to).name
            ),
        );
    }

    fn require_assignable(&mut self, loc: SourceLocation, from: TypeId, to: TypeId) {
        if !self.unit.registry.is_assignable(from, to) {
            self.mismatch(loc, from, to);
        }
    }

    fn invalid_operands(&mut self, loc: SourceLocation, lhs: TypeId, rhs: TypeId) {
        self.unit.errors.error(
            DiagnosticCode::MismatchedTypes,
            loc,
            format!(
                "invalid operands '{}' and '{}'",
                self.unit.registry.get(lhs).name,
                self.unit.registry.get(rhs).name
            ),
        );
    }
}

/// Failure mode of constant folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FoldError {
    DivisionByZero,
}

/// Folds an arithmetic or bitwise operator over two constants. Binary ops on
/// two integer constants yield an integer; any float operand promotes to
/// float.
fn fold_arithmetic(op: BinaryOp, lhs: &ConstValue, rhs: &ConstValue) -> Result<Option<ConstValue>, FoldError> {
    use ConstValue::{Float, Int, Str};
    let folded = match (op, lhs, rhs) {
        (BinaryOp::Add, Int(a), Int(b)) => Some(Int(a.wrapping_add(*b))),
        (BinaryOp::Sub, Int(a), Int(b)) => Some(Int(a.wrapping_sub(*b))),
        (BinaryOp::Mul, Int(a), Int(b)) => Some(Int(a.wrapping_mul(*b))),
        (BinaryOp::Div, Int(_), Int(0)) | (BinaryOp::Mod, Int(_), Int(0)) => {
            return Err(FoldError::DivisionByZero);
        }
        (BinaryOp::Div, Int(a), Int(b)) => Some(Int(a.wrapping_div(*b))),
        (BinaryOp::Mod, Int(a), Int(b)) => Some(Int(a.wrapping_rem(*b))),
        (BinaryOp::BitAnd, Int(a), Int(b)) => Some(Int(a & b)),
        (BinaryOp::BitOr, Int(a), Int(b)) => Some(Int(a | b)),
        (BinaryOp::BitXor, Int(a), Int(b)) => Some(Int(a ^ b)),
        (BinaryOp::Shl, Int(a), Int(b)) => Some(Int(a.wrapping_shl(*b as u32 & 63))),
        (BinaryOp::Shr, Int(a), Int(b)) => Some(Int(a.wrapping_shr(*b as u32 & 63))),
        (BinaryOp::Add, Str(a), Str(b)) => {
            let mut s = a.to_string();
            s.push_str(b);
            Some(Str(s.into_boxed_str()))
        }
        // Mixed numeric operands promote to float; the integer explicitly
        // loses its exactness here.
        (op, lhs, rhs) => {
            let (a, b) = match (as_float(lhs), as_float(rhs)) {
                (Some(a), Some(b)) => (a, b),
                _ => return Ok(None),
            };
            match op {
                BinaryOp::Add => Some(Float(a + b)),
                BinaryOp::Sub => Some(Float(a - b)),
                BinaryOp::Mul => Some(Float(a * b)),
                BinaryOp::Div if b == 0.0 => return Err(FoldError::DivisionByZero),
                BinaryOp::Div => Some(Float(a / b)),
                BinaryOp::Mod if b == 0.0 => return Err(FoldError::DivisionByZero),
                BinaryOp::Mod => Some(Float(a % b)),
                _ => None,
            }
        }
    };
    Ok(folded)
}

fn as_float(v: &ConstValue) -> Option<f64> {
    match v {
        ConstValue::Int(v) => Some(*v as f64),
        ConstValue::Float(v) => Some(*v),
        _ => None,
    }
}

fn fold_comparison(op: BinaryOp, lhs: Option<&ConstValue>, rhs: Option<&ConstValue>) -> Option<ConstValue> {
    use std::cmp::Ordering;
    let (lhs, rhs) = (lhs?, rhs?);
    let ordering = match (lhs, rhs) {
        (ConstValue::Int(a), ConstValue::Int(b)) => a.cmp(b),
        (ConstValue::Str(a), ConstValue::Str(b)) => a.cmp(b),
        (ConstValue::Bool(a), ConstValue::Bool(b)) => a.cmp(b),
        (ConstValue::Null, ConstValue::Null) => Ordering::Equal,
        (a, b) => {
            let (a, b) = (as_float(a)?, as_float(b)?);
            a.partial_cmp(&b)?
        }
    };
    let result = match op {
        BinaryOp::Equals => ordering == Ordering::Equal,
        BinaryOp::NotEquals => ordering != Ordering::Equal,
        BinaryOp::Less => ordering == Ordering::Less,
        BinaryOp::Greater => ordering == Ordering::Greater,
        BinaryOp::LessEquals => ordering != Ordering::Greater,
        BinaryOp::GreaterEquals => ordering != Ordering::Less,
        _ => return None,
    };
    Some(ConstValue::Bool(result))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        builtins,
        config::CompilerConfig,
        error::{ErrorList, FileId},
        io::MemLoader,
        lex::Lexer,
    };

    fn analyze_source(src: &str) -> (Vec<Stmt>, CompilationUnit) {
        let natives = NativeRegistry::standard();
        let mut unit = CompilationUnit::new(CompilerConfig::default());
        builtins::declare_builtin_types(&mut unit);
        builtins::declare_natives(&mut unit, &natives);
        let mut errors = ErrorList::new();
        let tokens = Lexer::new(src, FileId::MAIN, &mut errors).tokenize();
        let mut stmts = parse::parse(&tokens, &mut errors);
        unit.errors.extend(errors);
        let loader = MemLoader::new();
        Analyzer::new(&mut unit, &natives, &loader).analyze_program(&mut stmts, None);
        (stmts, unit)
    }

    fn expect_clean(src: &str) -> (Vec<Stmt>, CompilationUnit) {
        let (stmts, unit) = analyze_source(src);
        assert!(
            !unit.errors.has_errors(),
            "unexpected diagnostics: {:?}",
            unit.errors.iter().collect::<Vec<_>>()
        );
        (stmts, unit)
    }

    fn expect_error(src: &str, code: DiagnosticCode) {
        let (_, unit) = analyze_source(src);
        assert!(
            unit.errors.iter().any(|d| d.code == code),
            "expected {code:?}, got {:?}",
            unit.errors.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn folds_integer_arithmetic() {
        let (stmts, _) = expect_clean("let x = 3 * 4 + 2");
        let StmtKind::VarDecl(decl) = &stmts[0].kind else {
            panic!("expected declaration");
        };
        assert_eq!(decl.init.as_ref().unwrap().const_value, Some(ConstValue::Int(14)));
    }

    #[test]
    fn division_by_zero_constant_is_diagnosed() {
        expect_error("let x = 10 / 0", DiagnosticCode::DivisionByZeroConstant);
    }

    #[test]
    fn division_by_nonconstant_zero_is_not_diagnosed() {
        // A `let` binding's value does not participate in folding, so this
        // stays a runtime division.
        let (_, unit) = analyze_source("let z = 0\nlet y = 10 / z");
        assert!(!unit.errors.has_errors());
    }

    #[test]
    fn const_bindings_fold_through_references() {
        let (stmts, _) = expect_clean("const n = 6\nlet x = n * 7");
        let StmtKind::VarDecl(decl) = &stmts[1].kind else {
            panic!("expected declaration");
        };
        assert_eq!(decl.init.as_ref().unwrap().const_value, Some(ConstValue::Int(42)));
    }

    #[test]
    fn undeclared_identifier_reports() {
        expect_error("print missing", DiagnosticCode::UndeclaredIdentifier);
    }

    #[test]
    fn type_mismatch_reports() {
        expect_error("let x: Int = \"hello\"", DiagnosticCode::MismatchedTypes);
    }

    #[test]
    fn const_reassignment_reports() {
        expect_error("const x = 1\nx = 2", DiagnosticCode::ConstReassignment);
    }

    #[test]
    fn closure_captures_are_recorded() {
        let (stmts, _) = expect_clean("func make(n: Int) -> Function { func inner() -> Int { return n + 1 } return inner }");
        let StmtKind::FuncDecl { func, .. } = &stmts[0].kind else {
            panic!("expected function declaration");
        };
        let ExprKind::Function(outer) = &func.kind else {
            panic!("expected function expression");
        };
        let StmtKind::FuncDecl { func: inner, .. } = &outer.body[0].kind else {
            panic!("expected nested declaration");
        };
        let ExprKind::Function(inner) = &inner.kind else {
            panic!("expected function expression");
        };
        assert_eq!(inner.captures.len(), 1);
        assert_eq!(inner.captures[0].name.as_ref(), "n");
    }

    #[test]
    fn for_lowers_to_call_action() {
        let (stmts, _) = expect_clean("let a = [1, 2, 3]\nlet s = 0\nfor x in a { s = s + x }\nprint s");
        let StmtKind::For { lowered, .. } = &stmts[2].kind else {
            panic!("expected for statement");
        };
        let lowered = lowered.as_ref().expect("for is lowered during analysis");
        let ExprKind::Call { callee, args } = &lowered.kind else {
            panic!("expected lowered call");
        };
        assert!(matches!(callee.kind, ExprKind::NativeRef { .. }));
        assert_eq!(args.len(), 2);
        assert!(matches!(args[1].kind, ExprKind::Function(_)));
    }

    #[test]
    fn generic_instantiation_replaces_the_node() {
        let (stmts, unit) = expect_clean("func id<T>(x: T) -> T { return x }\nlet y: Int = id<Int>(7)");
        let StmtKind::VarDecl(decl) = &stmts[1].kind else {
            panic!("expected declaration");
        };
        let ExprKind::Call { callee, .. } = &decl.init.as_ref().unwrap().kind else {
            panic!("expected call");
        };
        assert!(matches!(callee.kind, ExprKind::Function(_)));
        let (ret, params) = unit.registry.as_function(callee.ty.unwrap()).expect("function type");
        assert_eq!(unit.registry.resolve(ret), types::INT);
        assert_eq!(params.len(), 1);
        assert_eq!(unit.registry.resolve(params[0]), types::INT);
    }

    #[test]
    fn generic_argument_count_is_checked() {
        expect_error(
            "func id<T>(x: T) -> T { return x }\nid<Int, Int>(7)",
            DiagnosticCode::GenericArgumentCount,
        );
    }

    #[test]
    fn yield_outside_generator_reports() {
        expect_error("yield 1", DiagnosticCode::IllegalYield);
    }

    #[test]
    fn yield_marks_generator() {
        let (stmts, _) = expect_clean("func gen() { yield 1\nyield 2 }");
        let StmtKind::FuncDecl { func, .. } = &stmts[0].kind else {
            panic!("expected function declaration");
        };
        let ExprKind::Function(f) = &func.kind else {
            panic!("expected function expression");
        };
        assert!(f.is_generator);
    }

    #[test]
    fn type_declaration_synthesizes_proto() {
        let (stmts, unit) = expect_clean("type Point { x: Float = 0.0, y: Float = 0.0 }");
        let StmtKind::TypeDecl(node) = &stmts[0].kind else {
            panic!("expected type declaration");
        };
        let ty = node.ty.expect("registered type");
        let TypeKind::Object { members, .. } = &unit.registry.get(ty).kind else {
            panic!("expected object type");
        };
        assert_eq!(members.len(), 3);
        assert_eq!(members[2].name.as_ref(), types::PROTO_MEMBER);
    }

    #[test]
    fn member_access_resolves_index() {
        let (stmts, _) = expect_clean("type Point { x: Float = 0.0 }\nlet p = new Point\nprint p.x");
        let StmtKind::Print(args) = &stmts[2].kind else {
            panic!("expected print");
        };
        let ExprKind::Member { member_index, .. } = &args[0].kind else {
            panic!("expected member access");
        };
        assert_eq!(*member_index, Some(0));
    }

    #[test]
    fn unknown_member_reports() {
        expect_error(
            "type Point { x: Float = 0.0 }\nlet p = new Point\nprint p.z",
            DiagnosticCode::UnknownMemberName,
        );
    }

    #[test]
    fn has_folds_on_known_types() {
        let (stmts, _) = expect_clean("type Point { x: Float = 0.0 }\nlet p = new Point\nprint p has x");
        let StmtKind::Print(args) = &stmts[2].kind else {
            panic!("expected print");
        };
        assert_eq!(args[0].const_value, Some(ConstValue::Bool(true)));
    }

    #[test]
    fn alias_shares_the_binding() {
        let (stmts, unit) = expect_clean("let counter = 1\nalias c = counter\nc = 5\nprint counter");
        let StmtKind::Expr(assign) = &stmts[2].kind else {
            panic!("expected assignment");
        };
        let ExprKind::Binary { lhs, .. } = &assign.kind else {
            panic!("expected binary assignment");
        };
        let ExprKind::Ident { binding: Some(b), .. } = &lhs.kind else {
            panic!("expected resolved identifier");
        };
        assert_eq!(unit.ident(*b).name.as_ref(), "counter");
    }

    #[test]
    fn break_outside_loop_reports() {
        expect_error("break", DiagnosticCode::IllegalBreak);
    }

    #[test]
    fn break_inside_for_body_reports() {
        // The for body becomes a closure; break cannot cross it.
        expect_error("for x in [1] { break }", DiagnosticCode::IllegalBreak);
    }

    #[test]
    fn unknown_directive_warns() {
        let (_, unit) = analyze_source("use shiny_new_feature");
        assert!(unit.errors.iter().any(|d| d.code == DiagnosticCode::UnknownDirective));
        assert!(!unit.errors.has_errors());
    }

    #[test]
    fn condition_must_be_boolean() {
        expect_error("if 1 { print 1 }", DiagnosticCode::ConditionNotBoolean);
    }

    #[test]
    fn typeof_folds_to_static_type_name() {
        let (stmts, _) = expect_clean("let x = 1\nprint typeof x");
        let StmtKind::Print(args) = &stmts[1].kind else {
            panic!("expected print");
        };
        assert_eq!(args[0].const_value, Some(ConstValue::Str("Int".into())));
    }
}
