//! Compile-time diagnostics.
//!
//! Every diagnostic carries a level, a stable message id, a source location and
//! a rendered message. Diagnostics accumulate in an [`ErrorList`] owned by the
//! compilation unit; the list is sorted by location before being surfaced.
//! Compilation succeeds only if no diagnostic has level [`Level::Error`].

use std::{fmt, vec};

use strum::IntoStaticStr;

/// Index into the compilation unit's registered source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    /// The file id of the main (first-registered) source file.
    pub const MAIN: Self = Self(0);
}

/// A position in a source file. Lines and columns are zero-based internally
/// and rendered one-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct SourceLocation {
    pub file: FileId,
    pub line: u32,
    pub col: u32,
}

impl SourceLocation {
    #[must_use]
    pub fn new(file: FileId, line: u32, col: u32) -> Self {
        Self { file, line, col }
    }

    /// A location for synthesized nodes that have no source position.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(FileId::MAIN, 0, 0)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.col + 1)
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Level {
    Warning,
    Error,
}

/// Stable message ids for every diagnostic the toolchain can produce.
///
/// The id is part of the public surface: tooling matches on it rather than on
/// the rendered message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticCode {
    // lexer
    UnterminatedString,
    UnterminatedBlockComment,
    UnrecognizedEscape,
    UnexpectedCharacter,
    InvalidNumericLiteral,

    // parser
    UnexpectedToken,
    UnexpectedEof,
    ExpectedExpression,
    ExpectedIdentifier,
    ExpectedTypeExpression,
    IllegalBreak,
    IllegalContinue,
    IllegalYield,
    IllegalSelf,

    // name resolution
    UndeclaredIdentifier,
    RedeclaredIdentifier,
    UnknownModule,
    UnknownMemberName,

    // types
    MismatchedTypes,
    MismatchedReturnTypes,
    NotAFunction,
    NotAType,
    NotIndexable,
    IncorrectArgumentCount,
    CannotUnifyGenericParameter,
    GenericArgumentCount,
    ConstReassignment,
    ConditionNotBoolean,

    // constant folding
    DivisionByZeroConstant,

    // imports and directives
    ImportNotFound,
    CircularImport,
    UnknownDirective,

    // warnings
    UnusedIdentifier,
    UnreachableCode,
}

/// A single diagnostic record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub level: Level,
    pub code: DiagnosticCode,
    pub loc: SourceLocation,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            Level::Warning => "warning",
            Level::Error => "error",
        };
        let code: &'static str = self.code.into();
        write!(f, "{level}[{code}] at {}: {}", self.loc, self.message)
    }
}

/// Accumulator for diagnostics produced across all compilation phases.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorList {
    diagnostics: Vec<Diagnostic>,
}

impl ErrorList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, code: DiagnosticCode, loc: SourceLocation, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            level: Level::Error,
            code,
            loc,
            message: message.into(),
        });
    }

    pub fn warning(&mut self, code: DiagnosticCode, loc: SourceLocation, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            level: Level::Warning,
            code,
            loc,
            message: message.into(),
        });
    }

    /// True if any diagnostic has level [`Level::Error`].
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == Level::Error)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// Sorts diagnostics by source location, keeping insertion order for ties.
    pub fn sort(&mut self) {
        self.diagnostics.sort_by_key(|d| d.loc);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    /// Moves another list's diagnostics into this one.
    pub fn extend(&mut self, other: Self) {
        self.diagnostics.extend(other.diagnostics);
    }
}

impl IntoIterator for ErrorList {
    type Item = Diagnostic;
    type IntoIter = vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.diagnostics.into_iter()
    }
}

/// Fatal emitter failure. Unlike diagnostics these abort compilation
/// immediately: they indicate a violated invariant, not a user mistake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitError {
    pub loc: SourceLocation,
    pub message: String,
}

impl EmitError {
    pub fn new(loc: SourceLocation, message: impl Into<String>) -> Self {
        Self {
            loc,
            message: message.into(),
        }
    }
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emitter invariant violated at {}: {}", self.loc, self.message)
    }
}

impl std::error::Error for EmitError {}

/// Result alias for emitter operations.
pub type EmitResult<T> = Result<T, EmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_list_sorts_by_location() {
        let mut errors = ErrorList::new();
        let file = FileId::MAIN;
        errors.error(DiagnosticCode::UnexpectedToken, SourceLocation::new(file, 4, 0), "late");
        errors.warning(DiagnosticCode::UnusedIdentifier, SourceLocation::new(file, 1, 2), "early");
        errors.sort();

        let locations: Vec<u32> = errors.iter().map(|d| d.loc.line).collect();
        assert_eq!(locations, vec![1, 4]);
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let mut errors = ErrorList::new();
        errors.warning(
            DiagnosticCode::UnusedIdentifier,
            SourceLocation::unknown(),
            "unused identifier 'x'",
        );
        assert!(!errors.has_errors());

        errors.error(
            DiagnosticCode::UndeclaredIdentifier,
            SourceLocation::unknown(),
            "undeclared identifier 'y'",
        );
        assert!(errors.has_errors());
    }
}
