//! AST node definitions.
//!
//! Statements and expressions are two sealed tagged unions. Shared fields
//! (source location, access mode) live on the enclosing [`Stmt`] / [`Expr`]
//! records; behaviors (compile-time truth, side-effect queries, constant
//! folding) are match statements over the kinds.
//!
//! Analysis writes its results back into the nodes: an expression's type, its
//! folded constant value, an identifier's resolved binding, a function's
//! capture list. The emitter reads those fields and never re-resolves names.

use crate::{
    error::SourceLocation,
    scope::IdentRef,
    types::TypeId,
};

/// Whether a node is being evaluated for its value or assigned through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Load,
    Store,
}

/// Three-valued compile-time truth of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

/// A compile-time constant produced by folding.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Null,
    /// Result of a diagnosed-but-recovered fold such as division by a zero
    /// constant.
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Box<str>),
}

impl ConstValue {
    /// The constant's truth value; `Unknown` for values without one.
    #[must_use]
    pub fn truth(&self) -> Truth {
        match self {
            Self::Bool(true) => Truth::True,
            Self::Bool(false) | Self::Null => Truth::False,
            _ => Truth::Unknown,
        }
    }
}

/// Binary operators after parsing. Assignment (plain and compound) is a
/// binary node; the analyzer checks its left side is a storable place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitXor,
    BitAnd,
    BitOr,
    Shl,
    Shr,
    LogicalAnd,
    LogicalOr,
    Equals,
    NotEquals,
    Less,
    Greater,
    LessEquals,
    GreaterEquals,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    XorAssign,
    AndAssign,
    OrAssign,
}

impl BinaryOp {
    #[must_use]
    pub fn is_assignment(self) -> bool {
        matches!(
            self,
            Self::Assign
                | Self::AddAssign
                | Self::SubAssign
                | Self::MulAssign
                | Self::DivAssign
                | Self::ModAssign
                | Self::XorAssign
                | Self::AndAssign
                | Self::OrAssign
        )
    }

    /// The arithmetic/bitwise operator a compound assignment applies, if any.
    #[must_use]
    pub fn compound_base(self) -> Option<Self> {
        match self {
            Self::AddAssign => Some(Self::Add),
            Self::SubAssign => Some(Self::Sub),
            Self::MulAssign => Some(Self::Mul),
            Self::DivAssign => Some(Self::Div),
            Self::ModAssign => Some(Self::Mod),
            Self::XorAssign => Some(Self::BitXor),
            Self::AndAssign => Some(Self::BitAnd),
            Self::OrAssign => Some(Self::BitOr),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equals | Self::NotEquals | Self::Less | Self::Greater | Self::LessEquals | Self::GreaterEquals
        )
    }

    #[must_use]
    pub fn is_logical(self) -> bool {
        matches!(self, Self::LogicalAnd | Self::LogicalOr)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Positive,
    BitNot,
    /// Prefix `++`; the analyzer rewrites it to a compound assignment.
    Increment,
    /// Prefix `--`; the analyzer rewrites it to a compound assignment.
    Decrement,
}

/// Declaration keyword of a variable declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Const,
    Ref,
    Val,
}

/// A function parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Box<str>,
    pub type_expr: Option<Box<Expr>>,
    pub default: Option<Box<Expr>>,
    /// Trailing `...` parameter collecting extra arguments into an array.
    pub is_variadic: bool,
    /// Resolved binding, filled during analysis.
    pub binding: Option<IdentRef>,
    pub loc: SourceLocation,
}

/// A formal generic parameter on a function declaration.
#[derive(Debug, Clone)]
pub struct GenericParamDecl {
    pub name: Box<str>,
    pub loc: SourceLocation,
}

/// An identifier captured by a closure from an enclosing function or module
/// scope, recorded by the analyzer for the emitter.
#[derive(Debug, Clone)]
pub struct Capture {
    pub name: Box<str>,
    pub source: IdentRef,
}

/// A function expression. Also the payload of `func` declarations.
#[derive(Debug, Clone)]
pub struct FunctionExpr {
    pub params: Vec<Param>,
    pub generic_params: Vec<GenericParamDecl>,
    pub return_type_expr: Option<Box<Expr>>,
    pub body: Vec<Stmt>,

    // Analysis results.
    pub captures: Vec<Capture>,
    pub return_ty: Option<TypeId>,
    /// Set when the body contains `yield`; the function then receives the
    /// generator callback as an implicit parameter.
    pub is_generator: bool,
}

/// One member of a `type` expression.
#[derive(Debug, Clone)]
pub struct TypeMember {
    pub name: Box<str>,
    pub type_expr: Option<Box<Expr>>,
    pub default: Option<Box<Expr>>,
    pub loc: SourceLocation,
}

/// A `type Name { members }` expression; evaluates at compile time to a
/// TypeObject.
#[derive(Debug, Clone)]
pub struct TypeExprNode {
    pub name: Box<str>,
    pub members: Vec<TypeMember>,
    /// Registered object type, filled during analysis.
    pub ty: Option<TypeId>,
}

/// Expression kinds.
#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    StrLit(Box<str>),
    BoolLit(bool),
    NullLit,
    Ident {
        name: Box<str>,
        /// Resolved binding, filled during analysis.
        binding: Option<IdentRef>,
        /// Index into the enclosing function's capture list when the binding
        /// crosses a function boundary.
        capture_index: Option<u16>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Member {
        object: Box<Expr>,
        member: Box<str>,
        /// Member slot resolved from the object's static type, when known.
        member_index: Option<u8>,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    ArrayLit(Vec<Expr>),
    Function(Box<FunctionExpr>),
    TypeExpr(Box<TypeExprNode>),
    /// `base<Args...>` generic application; replaced by the instantiated
    /// expression during analysis.
    GenericApply {
        base: Box<Expr>,
        args: Vec<Expr>,
    },
    /// A block in expression position; its value is the value of its last
    /// expression statement.
    BlockExpr(Vec<Stmt>),
    New {
        proto: Box<Expr>,
    },
    Has {
        object: Box<Expr>,
        member: Box<str>,
    },
    TypeOf {
        operand: Box<Expr>,
    },
    SelfExpr,
    /// Direct reference to a registered native function, synthesized by the
    /// analyzer (for-each lowering and `has` on dynamic types).
    NativeRef {
        native: u32,
    },
}

/// An expression node with its shared fields.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLocation,
    pub access: AccessMode,
    /// Expression type, filled during analysis.
    pub ty: Option<TypeId>,
    /// Folded constant, filled during analysis when every sub-expression is
    /// constant and no side effects intervene.
    pub const_value: Option<ConstValue>,
}

impl Expr {
    #[must_use]
    pub fn new(kind: ExprKind, loc: SourceLocation) -> Self {
        Self {
            kind,
            loc,
            access: AccessMode::Load,
            ty: None,
            const_value: None,
        }
    }

    /// Points at an equivalent constant if this expression is a compile-time
    /// constant.
    #[must_use]
    pub fn value_of(&self) -> Option<&ConstValue> {
        self.const_value.as_ref()
    }

    /// The expression's compile-time truth value.
    #[must_use]
    pub fn is_true(&self) -> Truth {
        match &self.kind {
            ExprKind::BoolLit(true) => Truth::True,
            ExprKind::BoolLit(false) | ExprKind::NullLit => Truth::False,
            _ => self.const_value.as_ref().map_or(Truth::Unknown, ConstValue::truth),
        }
    }

    /// Conservative side-effect analysis: true unless every reachable
    /// sub-expression is known effect-free.
    #[must_use]
    pub fn may_have_side_effects(&self) -> bool {
        match &self.kind {
            ExprKind::IntLit(_)
            | ExprKind::FloatLit(_)
            | ExprKind::StrLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::NullLit
            | ExprKind::Ident { .. }
            | ExprKind::SelfExpr
            | ExprKind::NativeRef { .. } => false,
            // Creating a function value allocates but does not mutate
            // observable state.
            ExprKind::Function(_) | ExprKind::TypeExpr(_) => false,
            ExprKind::Unary { op, operand } => {
                matches!(op, UnaryOp::Increment | UnaryOp::Decrement) || operand.may_have_side_effects()
            }
            ExprKind::Binary { op, lhs, rhs } => {
                op.is_assignment() || lhs.may_have_side_effects() || rhs.may_have_side_effects()
            }
            ExprKind::Member { object, .. } => object.may_have_side_effects(),
            ExprKind::Has { object, .. } => object.may_have_side_effects(),
            ExprKind::TypeOf { operand } => operand.may_have_side_effects(),
            ExprKind::Index { object, index } => object.may_have_side_effects() || index.may_have_side_effects(),
            ExprKind::ArrayLit(items) => items.iter().any(Self::may_have_side_effects),
            ExprKind::GenericApply { base, args } => {
                base.may_have_side_effects() || args.iter().any(Self::may_have_side_effects)
            }
            // Calls, news and block expressions may run arbitrary code.
            ExprKind::Call { .. } | ExprKind::New { .. } | ExprKind::BlockExpr(_) => true,
        }
    }

    /// True if this expression may appear on the left of an assignment.
    #[must_use]
    pub fn is_storable_place(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Ident { .. } | ExprKind::Member { .. } | ExprKind::Index { .. }
        )
    }
}

/// A variable declaration (`let`, `const`, `ref`, `val`).
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub decl_kind: DeclKind,
    pub name: Box<str>,
    /// Optional prototype specification preceding `=`.
    pub proto: Option<Box<Expr>>,
    pub init: Option<Box<Expr>>,
    /// Resolved binding, filled during analysis.
    pub binding: Option<IdentRef>,
}

/// An import target.
#[derive(Debug, Clone)]
pub enum ImportTarget {
    /// `import "relative/path"`.
    File(Box<str>),
    /// `import Module.Sub`.
    Module(Vec<Box<str>>),
}

/// Statement kinds.
#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `module Name` file header.
    Module { name: Box<str> },
    VarDecl(VarDecl),
    AliasDecl {
        name: Box<str>,
        aliasee: Box<Expr>,
        binding: Option<IdentRef>,
    },
    /// `type Name { ... }` in statement position.
    TypeDecl(Box<TypeExprNode>),
    /// `func name(...) { ... }` declaration sugar.
    FuncDecl {
        name: Box<str>,
        func: Box<Expr>,
        binding: Option<IdentRef>,
    },
    Block(Vec<Stmt>),
    If {
        cond: Box<Expr>,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        cond: Box<Expr>,
        body: Vec<Stmt>,
    },
    For {
        params: Vec<Param>,
        iteree: Box<Expr>,
        body: Vec<Stmt>,
        /// The `events::call_action` call synthesized by the analyzer; the
        /// emitter visits this instead of the surface form.
        lowered: Option<Box<Expr>>,
    },
    Return(Option<Box<Expr>>),
    Yield(Box<Expr>),
    Throw(Box<Expr>),
    TryCatch {
        body: Vec<Stmt>,
        /// Optional identifier binding the caught value.
        catch_name: Option<Box<str>>,
        catch_binding: Option<IdentRef>,
        catch_body: Vec<Stmt>,
    },
    Import(ImportTarget),
    Directive {
        name: Box<str>,
        args: Vec<Box<str>>,
    },
    Print(Vec<Expr>),
    Expr(Box<Expr>),
    Break,
    Continue,
}

/// A statement node with its shared fields.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SourceLocation,
}

impl Stmt {
    #[must_use]
    pub fn new(kind: StmtKind, loc: SourceLocation) -> Self {
        Self { kind, loc }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Expr {
        Expr::new(ExprKind::IntLit(v), SourceLocation::unknown())
    }

    #[test]
    fn side_effect_analysis() {
        let pure = Expr::new(
            ExprKind::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(int(1)),
                rhs: Box::new(int(2)),
            },
            SourceLocation::unknown(),
        );
        assert!(!pure.may_have_side_effects());

        let call = Expr::new(
            ExprKind::Call {
                callee: Box::new(int(0)),
                args: vec![],
            },
            SourceLocation::unknown(),
        );
        let effectful = Expr::new(
            ExprKind::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(int(1)),
                rhs: Box::new(call),
            },
            SourceLocation::unknown(),
        );
        assert!(effectful.may_have_side_effects());
    }

    #[test]
    fn truth_of_folded_constants() {
        let mut e = int(1);
        assert_eq!(e.is_true(), Truth::Unknown);
        e.const_value = Some(ConstValue::Bool(true));
        assert_eq!(e.is_true(), Truth::True);
    }

    #[test]
    fn compound_assignment_base() {
        assert_eq!(BinaryOp::AddAssign.compound_base(), Some(BinaryOp::Add));
        assert_eq!(BinaryOp::Assign.compound_base(), None);
        assert!(BinaryOp::OrAssign.is_assignment());
    }
}
