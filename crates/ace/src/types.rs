//! Canonical type descriptors and the typing judgments over them.
//!
//! Every type the compiler reasons about is registered once in a
//! [`TypeRegistry`] and addressed by a stable [`TypeId`]. Builtins are
//! registered at construction in a fixed order so their ids are constants.
//! Aliases resolve transparently in every judgment. Generic instances are
//! deduplicated structurally on their arguments and nominally on their base;
//! function types are themselves generic instances of the builtin `Function`.

use ahash::AHashMap;
use strum::{Display, EnumIter, IntoStaticStr};

use crate::{ast::ConstValue, error::SourceLocation};

/// Index into the registry's type table. Assigned once on first registration;
/// registering a value-identical generic instance returns the prior id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The builtin primitive types. Exactly one descriptor instance exists per
/// builtin, registered in declaration order at ids `0..COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
pub enum Builtin {
    Any,
    Int,
    Float,
    Number,
    Boolean,
    String,
    Null,
    Undefined,
    Function,
    Array,
    Maybe,
    Event,
    EventArray,
    Type,
    VarArgs,
    Enum,
    ModuleInfo,
    GenericVariable,
    GenericPlaceholder,
}

/// The id of a builtin's singleton descriptor, fixed by registration order.
#[must_use]
pub fn builtin_id(builtin: Builtin) -> TypeId {
    use strum::IntoEnumIterator;
    let index = Builtin::iter()
        .position(|b| b == builtin)
        .expect("every builtin is registered");
    TypeId(u32::try_from(index).expect("builtin table fits u32"))
}

/// Builtin type ids, fixed by registration order.
pub const ANY: TypeId = TypeId(0);
pub const INT: TypeId = TypeId(1);
pub const FLOAT: TypeId = TypeId(2);
pub const NUMBER: TypeId = TypeId(3);
pub const BOOLEAN: TypeId = TypeId(4);
pub const STRING: TypeId = TypeId(5);
pub const NULL: TypeId = TypeId(6);
pub const UNDEFINED: TypeId = TypeId(7);
pub const FUNCTION: TypeId = TypeId(8);
pub const ARRAY: TypeId = TypeId(9);
pub const MAYBE: TypeId = TypeId(10);
pub const EVENT: TypeId = TypeId(11);
pub const EVENT_ARRAY: TypeId = TypeId(12);
pub const TYPE: TypeId = TypeId(13);
pub const VAR_ARGS: TypeId = TypeId(14);
pub const ENUM: TypeId = TypeId(15);
pub const MODULE_INFO: TypeId = TypeId(16);
pub const GENERIC_VARIABLE: TypeId = TypeId(17);
pub const GENERIC_PLACEHOLDER: TypeId = TypeId(18);

/// An ordered member of an object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: Box<str>,
    pub ty: TypeId,
    /// Whether the declaration carried a default-value expression. The
    /// expression itself stays on the AST node; the emitter reads it there.
    pub has_default: bool,
}

/// An ordered argument of a generic instance: ⟨name, type, default?⟩.
///
/// For function types the default is the parameter's constant default value,
/// pushed by the emitter at call sites that omit the argument. Defaults do
/// not participate in instance identity.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericArg {
    pub name: Box<str>,
    pub ty: TypeId,
    pub default: Option<ConstValue>,
}

impl GenericArg {
    #[must_use]
    pub fn new(name: impl Into<Box<str>>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }
}

/// The kind payload of a type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Builtin(Builtin),
    /// Resolves transparently in every typing judgment; printed as its own
    /// name.
    Alias { target: TypeId },
    /// A formal generic parameter introduced while analyzing a template.
    Placeholder,
    /// `base<args...>`. Equality is structural on args, nominal on base.
    GenericInstance { base: TypeId, args: Vec<GenericArg> },
    /// Named nominal type with ordered members.
    Object {
        base: Option<TypeId>,
        members: Vec<Member>,
    },
}

/// A reference-counted-in-spirit record: one per registered type, owned by
/// the registry and addressed by [`TypeId`].
#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub name: Box<str>,
    pub kind: TypeKind,
}

/// The member name every object type carries for its prototype slot.
pub const PROTO_MEMBER: &str = "$proto";

/// Registry owning every type descriptor of a compilation.
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeDesc>,
    /// Dedup map for generic instances: (base, ordered arg ids) -> id.
    instances: AHashMap<(TypeId, Vec<TypeId>), TypeId>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        use strum::IntoEnumIterator;
        let types = Builtin::iter()
            .map(|b| TypeDesc {
                name: <&'static str>::from(b).into(),
                kind: TypeKind::Builtin(b),
            })
            .collect();
        Self {
            types,
            instances: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, id: TypeId) -> &TypeDesc {
        &self.types[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    fn push(&mut self, desc: TypeDesc) -> TypeId {
        let id = TypeId(u32::try_from(self.types.len()).expect("type table fits u32"));
        self.types.push(desc);
        id
    }

    /// Follows alias links until a non-alias descriptor is reached.
    #[must_use]
    pub fn resolve(&self, id: TypeId) -> TypeId {
        let mut current = id;
        loop {
            match &self.get(current).kind {
                TypeKind::Alias { target } => current = *target,
                _ => return current,
            }
        }
    }

    /// Registers an alias. The alias gets its own id but resolves to the
    /// aliasee everywhere.
    pub fn register_alias(&mut self, name: impl Into<Box<str>>, target: TypeId) -> TypeId {
        self.push(TypeDesc {
            name: name.into(),
            kind: TypeKind::Alias { target },
        })
    }

    /// Registers a fresh generic placeholder for a template formal.
    pub fn register_placeholder(&mut self, name: impl Into<Box<str>>) -> TypeId {
        self.push(TypeDesc {
            name: name.into(),
            kind: TypeKind::Placeholder,
        })
    }

    /// Registers a named nominal object type. Each declaration gets a fresh
    /// id: object types are nominal on name, and redeclarations are the
    /// analyzer's concern.
    pub fn register_object(
        &mut self,
        name: impl Into<Box<str>>,
        base: Option<TypeId>,
        members: Vec<Member>,
    ) -> TypeId {
        self.push(TypeDesc {
            name: name.into(),
            kind: TypeKind::Object { base, members },
        })
    }

    /// Registers (or finds) the generic instance `base<args...>`. Two
    /// instances are identical iff their base and ordered argument types are
    /// identical.
    pub fn instantiate(&mut self, base: TypeId, args: Vec<GenericArg>) -> TypeId {
        let key = (base, args.iter().map(|a| a.ty).collect::<Vec<_>>());
        if let Some(&existing) = self.instances.get(&key) {
            return existing;
        }
        let name = self.instance_name(base, &args);
        let id = self.push(TypeDesc {
            name: name.into_boxed_str(),
            kind: TypeKind::GenericInstance { base, args },
        });
        self.instances.insert(key, id);
        id
    }

    fn instance_name(&self, base: TypeId, args: &[GenericArg]) -> String {
        let mut out = self.get(base).name.to_string();
        out.push('<');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.get(arg.ty).name);
        }
        out.push('>');
        out
    }

    /// A function type: a generic instance of the builtin `Function` whose
    /// first argument is the return type, followed by the parameter types.
    /// A variadic trailing parameter arrives already wrapped in `VarArgs`.
    pub fn function(&mut self, return_ty: TypeId, params: Vec<TypeId>) -> TypeId {
        let sig = params.into_iter().map(|p| (p, None)).collect();
        self.function_sig(return_ty, sig)
    }

    /// A function type with per-parameter constant defaults.
    pub fn function_sig(&mut self, return_ty: TypeId, params: Vec<(TypeId, Option<ConstValue>)>) -> TypeId {
        let mut args = Vec::with_capacity(params.len() + 1);
        args.push(GenericArg::new("@return", return_ty));
        for (i, (ty, default)) in params.into_iter().enumerate() {
            args.push(GenericArg {
                name: format!("@param{i}").into_boxed_str(),
                ty,
                default,
            });
        }
        self.instantiate(FUNCTION, args)
    }

    /// Wraps a type in `VarArgs<T>` for a variadic trailing parameter.
    pub fn varargs(&mut self, element: TypeId) -> TypeId {
        self.instantiate(VAR_ARGS, vec![GenericArg::new("@element", element)])
    }

    /// `Maybe<T>`.
    pub fn maybe(&mut self, inner: TypeId) -> TypeId {
        self.instantiate(MAYBE, vec![GenericArg::new("@inner", inner)])
    }

    /// `Array<T>`.
    pub fn array_of(&mut self, element: TypeId) -> TypeId {
        self.instantiate(ARRAY, vec![GenericArg::new("@element", element)])
    }

    /// If `t` is a function type, returns (return type, param types).
    #[must_use]
    pub fn as_function(&self, t: TypeId) -> Option<(TypeId, Vec<TypeId>)> {
        let t = self.resolve(t);
        match &self.get(t).kind {
            TypeKind::GenericInstance { base, args } if self.resolve(*base) == FUNCTION => {
                let ret = args.first()?.ty;
                let params = args.iter().skip(1).map(|a| a.ty).collect();
                Some((ret, params))
            }
            TypeKind::Builtin(Builtin::Function) => Some((ANY, Vec::new())),
            _ => None,
        }
    }

    /// If `t` is `Array` or `Array<T>`, returns the element type.
    #[must_use]
    pub fn array_element(&self, t: TypeId) -> Option<TypeId> {
        let t = self.resolve(t);
        match &self.get(t).kind {
            TypeKind::Builtin(Builtin::Array) => Some(ANY),
            TypeKind::GenericInstance { base, args } if self.resolve(*base) == ARRAY => {
                Some(args.first().map_or(ANY, |a| a.ty))
            }
            _ => None,
        }
    }

    /// If `t` is `VarArgs<T>`, returns `T`.
    #[must_use]
    pub fn varargs_element(&self, t: TypeId) -> Option<TypeId> {
        let t = self.resolve(t);
        match &self.get(t).kind {
            TypeKind::GenericInstance { base, args } if self.resolve(*base) == VAR_ARGS => {
                Some(args.first().map_or(ANY, |a| a.ty))
            }
            _ => None,
        }
    }

    /// Position in the numeric widening lattice, or `None` for non-numerics.
    fn numeric_rank(&self, t: TypeId) -> Option<u8> {
        match self.resolve(t) {
            INT => Some(0),
            FLOAT => Some(1),
            NUMBER => Some(2),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_numeric(&self, t: TypeId) -> bool {
        self.numeric_rank(t).is_some()
    }

    /// Assignability judgment: may a value of type `from` be stored where a
    /// `to` is expected?
    #[must_use]
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        let from = self.resolve(from);
        let to = self.resolve(to);
        if from == to || to == ANY || from == ANY || from == UNDEFINED {
            return true;
        }
        // Numeric widening.
        if let (Some(f), Some(t)) = (self.numeric_rank(from), self.numeric_rank(to)) {
            return f <= t;
        }
        match (&self.get(from).kind, &self.get(to).kind) {
            // Maybe<T> accepts Null and anything assignable to T.
            (_, TypeKind::GenericInstance { base, args }) if self.resolve(*base) == MAYBE => {
                let inner = args.first().map_or(ANY, |a| a.ty);
                from == NULL || self.is_assignable(from, inner)
            }
            // Object types: equal name and mutually assignable members.
            (
                TypeKind::Object {
                    members: from_members, ..
                },
                TypeKind::Object { members: to_members, .. },
            ) => {
                self.get(from).name == self.get(to).name
                    && from_members.len() == to_members.len()
                    && from_members.iter().zip(to_members).all(|(a, b)| {
                        a.name == b.name && self.is_assignable(a.ty, b.ty) && self.is_assignable(b.ty, a.ty)
                    })
            }
            // Generic instances: equal base, pointwise-assignable args.
            (
                TypeKind::GenericInstance {
                    base: from_base,
                    args: from_args,
                },
                TypeKind::GenericInstance {
                    base: to_base,
                    args: to_args,
                },
            ) => {
                self.resolve(*from_base) == self.resolve(*to_base)
                    && from_args.len() == to_args.len()
                    && from_args
                        .iter()
                        .zip(to_args)
                        .all(|(a, b)| self.is_assignable(a.ty, b.ty))
            }
            // A bare generic base accepts its instances (Array<Int> -> Array).
            (TypeKind::GenericInstance { base, .. }, TypeKind::Builtin(_)) => self.resolve(*base) == to,
            _ => false,
        }
    }

    /// Common supertype for arithmetic promotion: the lattice maximum of the
    /// two operand types, or `Any` if incomparable.
    #[must_use]
    pub fn promote(&self, a: TypeId, b: TypeId) -> TypeId {
        let ra = self.resolve(a);
        let rb = self.resolve(b);
        if ra == rb {
            return ra;
        }
        match (self.numeric_rank(ra), self.numeric_rank(rb)) {
            (Some(x), Some(y)) => {
                if x >= y {
                    ra
                } else {
                    rb
                }
            }
            _ => ANY,
        }
    }

    /// Join used for a function's observed return types.
    #[must_use]
    pub fn join(&self, a: TypeId, b: TypeId) -> TypeId {
        let ra = self.resolve(a);
        let rb = self.resolve(b);
        if ra == rb {
            return ra;
        }
        if self.is_assignable(ra, rb) {
            return rb;
        }
        if self.is_assignable(rb, ra) {
            return ra;
        }
        self.promote(ra, rb)
    }
}

/// Environment threaded through generic unification: each placeholder
/// unifies with exactly one concrete type.
#[derive(Debug, Default)]
pub struct UnifyEnv {
    bindings: AHashMap<TypeId, TypeId>,
}

/// A unification conflict: the placeholder was already bound to a different
/// type at the first site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnifyConflict {
    pub placeholder: TypeId,
    pub bound: TypeId,
    pub attempted: TypeId,
    pub loc: SourceLocation,
}

impl UnifyEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn binding(&self, placeholder: TypeId) -> Option<TypeId> {
        self.bindings.get(&placeholder).copied()
    }

    /// Unifies `formal` (which may contain placeholders) against the concrete
    /// `actual`. Re-unification of a placeholder must be identical.
    pub fn unify(
        &mut self,
        registry: &TypeRegistry,
        formal: TypeId,
        actual: TypeId,
        loc: SourceLocation,
    ) -> Result<(), UnifyConflict> {
        let formal = registry.resolve(formal);
        let actual = registry.resolve(actual);
        match &registry.get(formal).kind {
            TypeKind::Placeholder => match self.bindings.get(&formal) {
                Some(&bound) if bound != actual => Err(UnifyConflict {
                    placeholder: formal,
                    bound,
                    attempted: actual,
                    loc,
                }),
                Some(_) => Ok(()),
                None => {
                    self.bindings.insert(formal, actual);
                    Ok(())
                }
            },
            TypeKind::GenericInstance { base, args } => {
                let formal_base = *base;
                let formal_args = args.clone();
                if let TypeKind::GenericInstance {
                    base: actual_base,
                    args: actual_args,
                } = &registry.get(actual).kind
                {
                    if registry.resolve(formal_base) == registry.resolve(*actual_base)
                        && formal_args.len() == actual_args.len()
                    {
                        let actual_args = actual_args.clone();
                        for (f, a) in formal_args.iter().zip(&actual_args) {
                            self.unify(registry, f.ty, a.ty, loc)?;
                        }
                        return Ok(());
                    }
                }
                // No placeholder reached: fall back to assignability.
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Rewrites `ty`, substituting bound placeholders. Unbound placeholders
    /// substitute to `Any`.
    pub fn substitute(&self, registry: &mut TypeRegistry, ty: TypeId) -> TypeId {
        let resolved = registry.resolve(ty);
        match registry.get(resolved).kind.clone() {
            TypeKind::Placeholder => self.bindings.get(&resolved).copied().unwrap_or(ANY),
            TypeKind::GenericInstance { base, args } => {
                let new_args: Vec<GenericArg> = args
                    .iter()
                    .map(|a| GenericArg {
                        name: a.name.clone(),
                        ty: self.substitute(registry, a.ty),
                        default: a.default.clone(),
                    })
                    .collect();
                if new_args.iter().zip(&args).all(|(n, o)| n.ty == o.ty) {
                    resolved
                } else {
                    registry.instantiate(base, new_args)
                }
            }
            _ => resolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builtin_ids_are_fixed() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.get(ANY).name.as_ref(), "Any");
        assert_eq!(registry.get(INT).name.as_ref(), "Int");
        assert_eq!(registry.get(GENERIC_PLACEHOLDER).name.as_ref(), "GenericPlaceholder");
    }

    #[test]
    fn generic_instances_dedup() {
        let mut registry = TypeRegistry::new();
        let a = registry.array_of(INT);
        let b = registry.array_of(INT);
        let c = registry.array_of(FLOAT);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.get(a).name.as_ref(), "Array<Int>");
    }

    #[test]
    fn aliases_resolve_transparently() {
        let mut registry = TypeRegistry::new();
        let speed = registry.register_alias("Speed", FLOAT);
        assert_eq!(registry.resolve(speed), FLOAT);
        assert!(registry.is_assignable(INT, speed));
        assert_eq!(registry.get(speed).name.as_ref(), "Speed");
    }

    #[test]
    fn numeric_widening() {
        let registry = TypeRegistry::new();
        assert!(registry.is_assignable(INT, FLOAT));
        assert!(registry.is_assignable(FLOAT, NUMBER));
        assert!(!registry.is_assignable(FLOAT, INT));
        assert_eq!(registry.promote(INT, FLOAT), FLOAT);
        assert_eq!(registry.promote(INT, INT), INT);
        assert_eq!(registry.promote(STRING, INT), ANY);
    }

    #[test]
    fn maybe_accepts_null_and_inner() {
        let mut registry = TypeRegistry::new();
        let maybe_int = registry.maybe(INT);
        assert!(registry.is_assignable(NULL, maybe_int));
        assert!(registry.is_assignable(INT, maybe_int));
        assert!(!registry.is_assignable(STRING, maybe_int));
    }

    #[test]
    fn function_types_are_function_instances() {
        let mut registry = TypeRegistry::new();
        let f = registry.function(INT, vec![INT, STRING]);
        let (ret, params) = registry.as_function(f).expect("function type");
        assert_eq!(ret, INT);
        assert_eq!(params, vec![INT, STRING]);
        let again = registry.function(INT, vec![INT, STRING]);
        assert_eq!(f, again);
    }

    #[test]
    fn unification_binds_each_placeholder_once() {
        let mut registry = TypeRegistry::new();
        let t = registry.register_placeholder("T");
        let mut env = UnifyEnv::new();
        let loc = SourceLocation::unknown();
        env.unify(&registry, t, INT, loc).expect("first unification");
        env.unify(&registry, t, INT, loc).expect("identical re-unification");
        let conflict = env.unify(&registry, t, STRING, loc).expect_err("conflicting unification");
        assert_eq!(conflict.bound, INT);
        assert_eq!(conflict.attempted, STRING);
    }

    #[test]
    fn substitution_rewrites_instances() {
        let mut registry = TypeRegistry::new();
        let t = registry.register_placeholder("T");
        let array_t = registry.array_of(t);
        let mut env = UnifyEnv::new();
        env.unify(&registry, t, INT, SourceLocation::unknown()).expect("bind T");
        let out = env.substitute(&mut registry, array_t);
        let array_int = registry.array_of(INT);
        assert_eq!(out, array_int);
    }

    #[test]
    fn object_assignability_is_nominal_on_name() {
        let mut registry = TypeRegistry::new();
        let a = registry.register_object(
            "Point",
            None,
            vec![Member {
                name: "x".into(),
                ty: INT,
                has_default: false,
            }],
        );
        let b = registry.register_object(
            "Point",
            None,
            vec![Member {
                name: "x".into(),
                ty: INT,
                has_default: false,
            }],
        );
        let other = registry.register_object(
            "Size",
            None,
            vec![Member {
                name: "x".into(),
                ty: INT,
                has_default: false,
            }],
        );
        assert!(registry.is_assignable(a, b));
        assert!(!registry.is_assignable(a, other));
    }
}
