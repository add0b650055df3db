//! Identifier bindings, lexical scopes, modules and the compilation unit.
//!
//! Scopes form a per-module tree; the module keeps a `top` pointer tracking
//! the current position during traversal. Modules form a compilation-wide
//! tree represented as an index-addressed vector so that parent/sibling links
//! never create ownership cycles.

use std::path::PathBuf;

use ahash::AHashMap;
use bitflags::bitflags;
use indexmap::IndexMap;

use crate::{
    ast::{ConstValue, Expr},
    config::CompilerConfig,
    error::{DiagnosticCode, ErrorList, FileId, SourceLocation},
    types::{TypeId, TypeRegistry},
};

bitflags! {
    /// Identifier property flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IdentFlags: u8 {
        /// Declared `const`; reassignment is a diagnostic and the binding's
        /// current value participates in constant folding.
        const CONST = 1 << 0;
        /// Declared by `alias`; shares the aliasee's storage.
        const ALIAS = 1 << 1;
        /// The declaration lives inside some function body.
        const DECLARED_IN_FUNCTION = 1 << 2;
        /// A formal generic parameter standing in for a concrete type.
        const GENERIC_PLACEHOLDER = 1 << 3;
        /// Referenced from inside a nested function; its storage is a shared
        /// heap box so closures observe writes.
        const CAPTURED = 1 << 4;
        /// Bound to a registered host function rather than a stack slot.
        const NATIVE = 1 << 5;
        /// Declared by a `func` whose body contains `yield`; called only
        /// through the event-action driver, never directly.
        const GENERATOR = 1 << 6;
    }
}

/// Index of an identifier within its owning module's identifier arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentId(pub u32);

/// Index of a scope within its owning module's scope tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// Index of a module within the compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// A fully qualified identifier reference recorded on AST nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentRef {
    pub module: ModuleId,
    pub ident: IdentId,
}

/// A name binding.
#[derive(Debug)]
pub struct Identifier {
    pub name: Box<str>,
    /// Index within the owning scope's table.
    pub index: u32,
    /// Stack location, assigned exactly once when the emitter first reaches
    /// the declaration.
    stack_location: Option<u32>,
    pub use_count: u32,
    pub flags: IdentFlags,
    /// The compile-time value the identifier is currently bound to. Valid
    /// only while analysis of the owning scope is active; cleared at scope
    /// close.
    pub current_value: Option<ConstValue>,
    /// Symbol type.
    pub ty: Option<TypeId>,
    /// For identifiers declared by generic `func` declarations: the template
    /// expression cloned at each instantiation site.
    pub template: Option<Box<Expr>>,
    /// Native registry index for `NATIVE` identifiers.
    pub native: Option<u32>,
    /// For identifiers that name a type (builtins, `type` declarations,
    /// type aliases): the named type.
    pub type_ref: Option<TypeId>,
    /// For `ALIAS` identifiers: the binding whose storage this name shares.
    pub alias_of: Option<IdentRef>,
    pub loc: SourceLocation,
}

impl Identifier {
    #[must_use]
    pub fn stack_location(&self) -> Option<u32> {
        self.stack_location
    }

    /// Assigns the stack location. Panics if assigned twice: the emitter
    /// reaches each declaration exactly once.
    pub fn assign_stack_location(&mut self, location: u32) {
        assert!(
            self.stack_location.is_none(),
            "stack location for '{}' assigned twice",
            self.name
        );
        self.stack_location = Some(location);
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        self.flags.contains(IdentFlags::CONST)
    }

    #[must_use]
    pub fn is_captured(&self) -> bool {
        self.flags.contains(IdentFlags::CAPTURED)
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        self.flags.contains(IdentFlags::NATIVE)
    }
}

/// The kind of a lexical scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Normal,
    Function,
    PureFunction,
    Loop,
    TypeDefinition,
}

/// A lexical region: an identifier table plus a kind plus the return-type
/// observations collected for function scopes.
///
/// The table keeps declaration order: an identifier's index within its scope
/// is its insertion position.
#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    table: IndexMap<Box<str>, IdentId>,
    /// ⟨type, location⟩ pairs recorded by `return` statements.
    pub return_types: Vec<(TypeId, SourceLocation)>,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            table: IndexMap::new(),
            return_types: Vec::new(),
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<IdentId> {
        self.table.get(name).copied()
    }

    /// Identifiers in declaration order.
    pub fn identifiers(&self) -> impl Iterator<Item = IdentId> + '_ {
        self.table.values().copied()
    }
}

/// A module: a named identifier tree plus its position in the compilation
/// tree.
#[derive(Debug)]
pub struct Module {
    pub name: Box<str>,
    pub loc: SourceLocation,
    /// Path of the source file that declared the module, for import
    /// resolution.
    pub path: Option<PathBuf>,
    pub parent: Option<ModuleId>,
    pub children: Vec<ModuleId>,
    scopes: Vec<Scope>,
    idents: Vec<Identifier>,
    root: ScopeId,
    /// Current position during traversal.
    top: ScopeId,
}

impl Module {
    #[must_use]
    pub fn new(name: impl Into<Box<str>>, loc: SourceLocation, parent: Option<ModuleId>) -> Self {
        let root_scope = Scope::new(ScopeKind::Normal, None);
        Self {
            name: name.into(),
            loc,
            path: None,
            parent,
            children: Vec::new(),
            scopes: vec![root_scope],
            idents: Vec::new(),
            root: ScopeId(0),
            top: ScopeId(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> ScopeId {
        self.root
    }

    #[must_use]
    pub fn top(&self) -> ScopeId {
        self.top
    }

    #[must_use]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    #[must_use]
    pub fn ident(&self, id: IdentId) -> &Identifier {
        &self.idents[id.0 as usize]
    }

    pub fn ident_mut(&mut self, id: IdentId) -> &mut Identifier {
        &mut self.idents[id.0 as usize]
    }

    /// Opens a child scope under the current top and moves top into it.
    pub fn open_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(u32::try_from(self.scopes.len()).expect("scope table fits u32"));
        self.scopes.push(Scope::new(kind, Some(self.top)));
        self.top = id;
        id
    }

    /// Closes the current top scope, restoring its parent as top. Clears the
    /// closed scope's identifier current values: they are valid only while
    /// analysis of the scope is active.
    pub fn close_scope(&mut self) {
        let closing = self.top;
        let ident_ids: Vec<IdentId> = self.scope(closing).identifiers().collect();
        for id in ident_ids {
            self.ident_mut(id).current_value = None;
        }
        let parent = self.scope(closing).parent.expect("cannot close the root scope");
        self.top = parent;
    }

    /// Declares an identifier in the current top scope. Returns `None` when
    /// the name is already declared in that scope.
    pub fn declare(
        &mut self,
        name: &str,
        flags: IdentFlags,
        ty: Option<TypeId>,
        loc: SourceLocation,
    ) -> Option<IdentId> {
        let top = self.top;
        if self.scope(top).table.contains_key(name) {
            return None;
        }
        let id = IdentId(u32::try_from(self.idents.len()).expect("ident table fits u32"));
        let index = u32::try_from(self.scope(top).table.len()).expect("scope table fits u32");
        self.idents.push(Identifier {
            name: name.into(),
            index,
            stack_location: None,
            use_count: 0,
            flags,
            current_value: None,
            ty,
            template: None,
            native: None,
            type_ref: None,
            alias_of: None,
            loc,
        });
        self.scope_mut(top).table.insert(name.into(), id);
        Some(id)
    }

    /// Searches outward from the current top scope. Returns the binding and
    /// the number of function-scope boundaries the search crossed.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<(IdentId, u32)> {
        let mut crossed_functions = 0;
        let mut current = Some(self.top);
        while let Some(scope_id) = current {
            let scope = self.scope(scope_id);
            if let Some(id) = scope.lookup(name) {
                return Some((id, crossed_functions));
            }
            if matches!(scope.kind, ScopeKind::Function | ScopeKind::PureFunction) {
                crossed_functions += 1;
            }
            current = scope.parent;
        }
        None
    }

    /// The nearest enclosing function or pure-function scope.
    #[must_use]
    pub fn nearest_function_scope(&self) -> Option<ScopeId> {
        let mut current = Some(self.top);
        while let Some(scope_id) = current {
            let scope = self.scope(scope_id);
            if matches!(scope.kind, ScopeKind::Function | ScopeKind::PureFunction) {
                return Some(scope_id);
            }
            current = scope.parent;
        }
        None
    }

    /// Looks a name up in the module's root scope only (used when other
    /// modules search this one).
    #[must_use]
    pub fn lookup_root(&self, name: &str) -> Option<IdentId> {
        self.scope(self.root).lookup(name)
    }

    /// The nearest enclosing scope of the given kind, if any.
    #[must_use]
    pub fn nearest_scope(&self, kind: ScopeKind) -> Option<ScopeId> {
        let mut current = Some(self.top);
        while let Some(scope_id) = current {
            let scope = self.scope(scope_id);
            if scope.kind == kind {
                return Some(scope_id);
            }
            current = scope.parent;
        }
        None
    }
}

/// The global module plus a tree of child modules, the error list, and the
/// tables shared by every compilation phase.
#[derive(Debug)]
pub struct CompilationUnit {
    pub config: CompilerConfig,
    pub registry: TypeRegistry,
    pub errors: ErrorList,
    modules: Vec<Module>,
    global: ModuleId,
    /// Module currently being analyzed or emitted.
    pub current_module: ModuleId,
    /// Canonical import path -> module, for import deduplication.
    pub import_map: AHashMap<PathBuf, ModuleId>,
    /// Native library names recorded by `use library [...]` for the loader.
    pub native_libraries: Vec<String>,
    /// Registered source files addressed by `FileId`.
    files: Vec<PathBuf>,
}

impl CompilationUnit {
    #[must_use]
    pub fn new(config: CompilerConfig) -> Self {
        let global = Module::new(config.global_module_name.clone(), SourceLocation::unknown(), None);
        Self {
            config,
            registry: TypeRegistry::new(),
            errors: ErrorList::new(),
            modules: vec![global],
            global: ModuleId(0),
            current_module: ModuleId(0),
            import_map: AHashMap::new(),
            native_libraries: Vec::new(),
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn global_module(&self) -> ModuleId {
        self.global
    }

    #[must_use]
    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0 as usize]
    }

    #[must_use]
    pub fn current(&self) -> &Module {
        self.module(self.current_module)
    }

    pub fn current_mut(&mut self) -> &mut Module {
        self.module_mut(self.current_module)
    }

    #[must_use]
    pub fn ident(&self, r: IdentRef) -> &Identifier {
        self.module(r.module).ident(r.ident)
    }

    pub fn ident_mut(&mut self, r: IdentRef) -> &mut Identifier {
        self.module_mut(r.module).ident_mut(r.ident)
    }

    /// Adds a child module under `parent` and returns its id.
    pub fn add_module(&mut self, name: &str, loc: SourceLocation, parent: ModuleId) -> ModuleId {
        let id = ModuleId(u32::try_from(self.modules.len()).expect("module table fits u32"));
        self.modules.push(Module::new(name, loc, Some(parent)));
        self.module_mut(parent).children.push(id);
        id
    }

    /// Finds a direct child of `parent` by name.
    #[must_use]
    pub fn find_child_module(&self, parent: ModuleId, name: &str) -> Option<ModuleId> {
        self.module(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.module(c).name.as_ref() == name)
    }

    /// Registers a source file and returns its id.
    pub fn add_file(&mut self, path: impl Into<PathBuf>) -> FileId {
        let id = FileId(u32::try_from(self.files.len()).expect("file table fits u32"));
        self.files.push(path.into());
        id
    }

    #[must_use]
    pub fn file_path(&self, id: FileId) -> Option<&PathBuf> {
        self.files.get(id.0 as usize)
    }

    /// Resolves a name from the current module outward: current scope chain,
    /// then ancestor modules' root scopes, then the global module. Returns
    /// the binding and the number of function boundaries crossed; lookups
    /// that leave the module cross every function active in it.
    #[must_use]
    pub fn resolve_name(&self, name: &str, active_functions: u32) -> Option<(IdentRef, u32)> {
        let module = self.current();
        if let Some((ident, crossed)) = module.lookup(name) {
            return Some((
                IdentRef {
                    module: self.current_module,
                    ident,
                },
                crossed,
            ));
        }
        let mut ancestor = module.parent;
        while let Some(module_id) = ancestor {
            if let Some(ident) = self.module(module_id).lookup_root(name) {
                return Some((
                    IdentRef {
                        module: module_id,
                        ident,
                    },
                    active_functions,
                ));
            }
            ancestor = self.module(module_id).parent;
        }
        if self.current_module != self.global {
            if let Some(ident) = self.module(self.global).lookup_root(name) {
                return Some((
                    IdentRef {
                        module: self.global,
                        ident,
                    },
                    active_functions,
                ));
            }
        }
        None
    }

    /// Records a use of a binding.
    pub fn mark_used(&mut self, r: IdentRef) {
        self.ident_mut(r).use_count += 1;
    }

    /// Emits unused-identifier warnings for a scope that is about to close.
    pub fn warn_unused_in_scope(&mut self, module: ModuleId, scope: ScopeId) {
        if !self.config.warn_unused {
            return;
        }
        let unused: Vec<(Box<str>, SourceLocation)> = {
            let module = self.module(module);
            module
                .scope(scope)
                .identifiers()
                .map(|id| module.ident(id))
                .filter(|ident| ident.use_count == 0 && !ident.name.starts_with('_') && !ident.is_native())
                .map(|ident| (ident.name.clone(), ident.loc))
                .collect()
        };
        for (name, loc) in unused {
            self.errors.warning(
                DiagnosticCode::UnusedIdentifier,
                loc,
                format!("identifier '{name}' is never used"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types;

    fn unit() -> CompilationUnit {
        CompilationUnit::new(CompilerConfig::default())
    }

    #[test]
    fn scope_open_close_is_lifo() {
        let mut unit = unit();
        let module_id = unit.global_module();
        let module = unit.module_mut(module_id);
        let root = module.top();
        let inner = module.open_scope(ScopeKind::Normal);
        let innermost = module.open_scope(ScopeKind::Loop);
        assert_eq!(module.top(), innermost);
        module.close_scope();
        assert_eq!(module.top(), inner);
        module.close_scope();
        assert_eq!(module.top(), root);
    }

    #[test]
    fn lookup_crosses_function_boundary() {
        let mut unit = unit();
        let module = unit.current_mut();
        module
            .declare("outer", IdentFlags::empty(), Some(types::INT), SourceLocation::unknown())
            .expect("fresh declaration");
        module.open_scope(ScopeKind::Function);
        let (_, crossed) = module.lookup("outer").expect("visible from inner scope");
        assert_eq!(crossed, 1);
        module
            .declare("inner", IdentFlags::empty(), None, SourceLocation::unknown())
            .expect("fresh declaration");
        let (_, crossed) = module.lookup("inner").expect("local lookup");
        assert_eq!(crossed, 0);
    }

    #[test]
    fn redeclaration_in_same_scope_is_rejected() {
        let mut unit = unit();
        let module = unit.current_mut();
        assert!(module
            .declare("x", IdentFlags::empty(), None, SourceLocation::unknown())
            .is_some());
        assert!(module
            .declare("x", IdentFlags::empty(), None, SourceLocation::unknown())
            .is_none());
    }

    #[test]
    fn close_scope_clears_current_values() {
        let mut unit = unit();
        let module = unit.current_mut();
        module.open_scope(ScopeKind::Normal);
        let id = module
            .declare("x", IdentFlags::CONST, Some(types::INT), SourceLocation::unknown())
            .expect("fresh declaration");
        module.ident_mut(id).current_value = Some(ConstValue::Int(3));
        module.close_scope();
        assert_eq!(module.ident(id).current_value, None);
    }

    #[test]
    fn name_resolution_falls_back_to_global() {
        let mut unit = unit();
        let global = unit.global_module();
        unit.module_mut(global)
            .declare("shared", IdentFlags::empty(), None, SourceLocation::unknown())
            .expect("fresh declaration");
        let child = unit.add_module("Child", SourceLocation::unknown(), global);
        unit.current_module = child;
        let (binding, _) = unit.resolve_name("shared", 0).expect("visible from child module");
        assert_eq!(binding.module, global);
    }

    #[test]
    fn stack_location_assigned_once() {
        let mut unit = unit();
        let module = unit.current_mut();
        let id = module
            .declare("x", IdentFlags::empty(), None, SourceLocation::unknown())
            .expect("fresh declaration");
        module.ident_mut(id).assign_stack_location(4);
        assert_eq!(module.ident(id).stack_location(), Some(4));
    }
}
