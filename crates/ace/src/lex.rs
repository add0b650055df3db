//! Lexer: source bytes to a token sequence with locations.
//!
//! Newlines are first-class tokens because the parser treats most of them as
//! statement terminators, but suppresses them after a token with the
//! continuation property (operators, commas, opening brackets) so that
//! expressions may span lines.

use std::{fmt, str::FromStr};

use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{DiagnosticCode, ErrorList, FileId, SourceLocation};

/// Reserved words of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    Module,
    Import,
    Use,
    Let,
    Const,
    Ref,
    Val,
    Func,
    Type,
    Alias,
    As,
    Has,
    New,
    Print,
    #[strum(serialize = "self")]
    SelfKw,
    If,
    Else,
    For,
    Each,
    While,
    Do,
    Try,
    Catch,
    Throw,
    Nil,
    Null,
    Void,
    True,
    False,
    Return,
    Break,
    Continue,
    Async,
    Pure,
    Valueof,
    Typeof,
    Yield,
}

impl Keyword {
    /// Reclassifies an identifier as a keyword, if it is one.
    #[must_use]
    pub fn lookup(text: &str) -> Option<Self> {
        Self::from_str(text).ok()
    }
}

/// Surface operator tokens. `+` and `-` double as unary and binary; the
/// parser decides from position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Op {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = ">>")]
    Shr,
    #[strum(serialize = "&&")]
    LogicalAnd,
    #[strum(serialize = "||")]
    LogicalOr,
    #[strum(serialize = "==")]
    Equals,
    #[strum(serialize = "!=")]
    NotEquals,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = "<=")]
    LessEquals,
    #[strum(serialize = ">=")]
    GreaterEquals,
    #[strum(serialize = "=")]
    Assign,
    #[strum(serialize = "+=")]
    AddAssign,
    #[strum(serialize = "-=")]
    SubAssign,
    #[strum(serialize = "*=")]
    MulAssign,
    #[strum(serialize = "/=")]
    DivAssign,
    #[strum(serialize = "%=")]
    ModAssign,
    #[strum(serialize = "^=")]
    XorAssign,
    #[strum(serialize = "&=")]
    AndAssign,
    #[strum(serialize = "|=")]
    OrAssign,
    #[strum(serialize = "!")]
    LogicalNot,
    #[strum(serialize = "~")]
    BitNot,
    #[strum(serialize = "++")]
    Increment,
    #[strum(serialize = "--")]
    Decrement,
}

impl Op {
    /// Binding power when used as a binary operator; `None` for tokens that
    /// are only unary. Higher binds tighter.
    #[must_use]
    pub fn binary_precedence(self) -> Option<u8> {
        let prec = match self {
            Self::Mul | Self::Div | Self::Mod => 12,
            Self::Add | Self::Sub => 11,
            Self::Shl | Self::Shr => 10,
            Self::Less | Self::Greater | Self::LessEquals | Self::GreaterEquals => 9,
            Self::Equals | Self::NotEquals => 8,
            Self::BitAnd => 7,
            Self::BitXor => 6,
            Self::BitOr => 5,
            Self::LogicalAnd => 4,
            Self::LogicalOr => 3,
            Self::Assign
            | Self::AddAssign
            | Self::SubAssign
            | Self::MulAssign
            | Self::DivAssign
            | Self::ModAssign
            | Self::XorAssign
            | Self::AndAssign
            | Self::OrAssign => 2,
            Self::LogicalNot | Self::BitNot | Self::Increment | Self::Decrement => return None,
        };
        Some(prec)
    }

    /// Assignment operators are right-associative.
    #[must_use]
    pub fn is_right_associative(self) -> bool {
        self.binary_precedence() == Some(2)
    }

    /// True for the compound and plain assignment operators.
    #[must_use]
    pub fn is_assignment(self) -> bool {
        self.is_right_associative()
    }

    /// True if this token can begin a unary expression.
    #[must_use]
    pub fn is_unary(self) -> bool {
        matches!(
            self,
            Self::LogicalNot | Self::BitNot | Self::Add | Self::Sub | Self::Increment | Self::Decrement
        )
    }
}

/// Punctuation tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Punct {
    #[strum(serialize = ",")]
    Comma,
    #[strum(serialize = ";")]
    Semicolon,
    #[strum(serialize = ":")]
    Colon,
    #[strum(serialize = ".")]
    Dot,
    #[strum(serialize = "...")]
    Ellipsis,
    #[strum(serialize = "->")]
    Arrow,
    #[strum(serialize = "(")]
    OpenParen,
    #[strum(serialize = ")")]
    CloseParen,
    #[strum(serialize = "[")]
    OpenBracket,
    #[strum(serialize = "]")]
    CloseBracket,
    #[strum(serialize = "{{")]
    OpenBrace,
    #[strum(serialize = "}}")]
    CloseBrace,
    #[strum(serialize = "#")]
    Hash,
}

/// A lexed token. Literal values are parsed during lexing.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Integer(i64),
    Float(f64),
    Str(Box<str>),
    Ident(Box<str>),
    Keyword(Keyword),
    Operator(Op),
    Punct(Punct),
    DocComment(Box<str>),
    Newline,
    /// The empty end-of-input token.
    Eof,
}

impl TokenKind {
    /// Tokens with the continuation property permit a following newline to be
    /// treated as whitespace when parsing expression continuations.
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        match self {
            Self::Operator(_) => true,
            Self::Punct(p) => matches!(
                p,
                Punct::Comma
                    | Punct::Dot
                    | Punct::Arrow
                    | Punct::Colon
                    | Punct::OpenParen
                    | Punct::OpenBracket
                    | Punct::OpenBrace
            ),
            Self::Keyword(k) => matches!(k, Keyword::Else | Keyword::Catch),
            _ => false,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Ident(name) => write!(f, "{name}"),
            Self::Keyword(k) => write!(f, "{k}"),
            Self::Operator(op) => write!(f, "{op}"),
            Self::Punct(p) => write!(f, "{p}"),
            Self::DocComment(_) => write!(f, "documentation comment"),
            Self::Newline => write!(f, "newline"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: SourceLocation,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, loc: SourceLocation) -> Self {
        Self { kind, loc }
    }
}

/// Converts a UTF-8 source buffer into tokens, recording lex diagnostics.
pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    file: FileId,
    errors: &'a mut ErrorList,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, file: FileId, errors: &'a mut ErrorList) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 0,
            col: 0,
            file,
            errors,
        }
    }

    /// Lexes the whole buffer. The result always ends with an `Eof` token.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let crossed_newline = self.skip_whitespace_and_comments(&mut tokens);
            if crossed_newline {
                tokens.push(Token::new(TokenKind::Newline, self.location()));
            }
            if self.at_end() {
                tokens.push(Token::new(TokenKind::Eof, self.location()));
                return tokens;
            }
            let token = self.next_token();
            tokens.push(token);
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation::new(self.file, self.line, self.col)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> u8 {
        self.bytes.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.bytes.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn bump(&mut self) -> u8 {
        let byte = self.peek();
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        byte
    }

    /// Skips whitespace and comments, returning whether a newline was
    /// crossed. Documentation comments are emitted as tokens, not skipped.
    fn skip_whitespace_and_comments(&mut self, tokens: &mut Vec<Token>) -> bool {
        let mut crossed = false;
        loop {
            match self.peek() {
                b'\n' => {
                    crossed = true;
                    self.bump();
                }
                b' ' | b'\t' | b'\r' => {
                    self.bump();
                }
                b'/' if self.peek_at(1) == b'/' => {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.bump();
                    }
                }
                b'/' if self.peek_at(1) == b'*' => {
                    let is_doc = self.peek_at(2) == b'*' && self.peek_at(3) != b'/';
                    if is_doc {
                        if let Some(token) = self.read_doc_comment() {
                            tokens.push(token);
                        }
                    } else {
                        self.skip_block_comment();
                    }
                }
                _ => return crossed,
            }
        }
    }

    fn skip_block_comment(&mut self) {
        let start = self.location();
        self.bump();
        self.bump();
        loop {
            if self.at_end() {
                self.errors
                    .error(DiagnosticCode::UnterminatedBlockComment, start, "unterminated block comment");
                return;
            }
            if self.peek() == b'*' && self.peek_at(1) == b'/' {
                self.bump();
                self.bump();
                return;
            }
            self.bump();
        }
    }

    /// Reads a `/** ... */` comment, keeping the body as a distinct token.
    fn read_doc_comment(&mut self) -> Option<Token> {
        let start = self.location();
        self.bump();
        self.bump();
        self.bump();
        let body_start = self.pos;
        loop {
            if self.at_end() {
                self.errors.error(
                    DiagnosticCode::UnterminatedBlockComment,
                    start,
                    "unterminated documentation comment",
                );
                return None;
            }
            if self.peek() == b'*' && self.peek_at(1) == b'/' {
                let body = self.src[body_start..self.pos].trim().to_owned();
                self.bump();
                self.bump();
                return Some(Token::new(TokenKind::DocComment(body.into_boxed_str()), start));
            }
            self.bump();
        }
    }

    fn next_token(&mut self) -> Token {
        let loc = self.location();
        let byte = self.peek();
        match byte {
            b'0'..=b'9' => self.read_number(loc),
            b'"' => self.read_string(loc),
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => self.read_identifier(loc),
            _ => self.read_operator_or_punct(loc),
        }
    }

    fn read_number(&mut self, loc: SourceLocation) -> Token {
        let start = self.pos;
        if self.peek() == b'0' && (self.peek_at(1) == b'x' || self.peek_at(1) == b'X') {
            self.bump();
            self.bump();
            let digits_start = self.pos;
            while self.peek().is_ascii_hexdigit() {
                self.bump();
            }
            let digits = &self.src[digits_start..self.pos];
            return match i64::from_str_radix(digits, 16) {
                Ok(value) if !digits.is_empty() => Token::new(TokenKind::Integer(value), loc),
                _ => {
                    self.errors
                        .error(DiagnosticCode::InvalidNumericLiteral, loc, "invalid hexadecimal literal");
                    Token::new(TokenKind::Integer(0), loc)
                }
            };
        }

        while self.peek().is_ascii_digit() {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == b'.' && self.peek_at(1).is_ascii_digit() {
            is_float = true;
            self.bump();
            while self.peek().is_ascii_digit() {
                self.bump();
            }
        }
        let text = &self.src[start..self.pos];
        if is_float {
            match text.parse::<f64>() {
                Ok(value) => Token::new(TokenKind::Float(value), loc),
                Err(_) => {
                    self.errors
                        .error(DiagnosticCode::InvalidNumericLiteral, loc, format!("invalid float literal '{text}'"));
                    Token::new(TokenKind::Float(0.0), loc)
                }
            }
        } else {
            match text.parse::<i64>() {
                Ok(value) => Token::new(TokenKind::Integer(value), loc),
                Err(_) => {
                    self.errors.error(
                        DiagnosticCode::InvalidNumericLiteral,
                        loc,
                        format!("integer literal '{text}' out of range"),
                    );
                    Token::new(TokenKind::Integer(0), loc)
                }
            }
        }
    }

    fn read_string(&mut self, loc: SourceLocation) -> Token {
        self.bump();
        let mut value = String::new();
        loop {
            if self.at_end() || self.peek() == b'\n' {
                self.errors
                    .error(DiagnosticCode::UnterminatedString, loc, "unterminated string literal");
                return Token::new(TokenKind::Str(value.into_boxed_str()), loc);
            }
            match self.bump() {
                b'"' => return Token::new(TokenKind::Str(value.into_boxed_str()), loc),
                b'\\' => {
                    if self.at_end() {
                        self.errors
                            .error(DiagnosticCode::UnterminatedString, loc, "unterminated string literal");
                        return Token::new(TokenKind::Str(value.into_boxed_str()), loc);
                    }
                    let escape_loc = self.location();
                    match self.bump() {
                        b'n' => value.push('\n'),
                        b't' => value.push('\t'),
                        b'r' => value.push('\r'),
                        b'0' => value.push('\0'),
                        b'\\' => value.push('\\'),
                        b'\'' => value.push('\''),
                        b'"' => value.push('"'),
                        b'b' => value.push('\u{8}'),
                        b'f' => value.push('\u{c}'),
                        b'v' => value.push('\u{b}'),
                        b'x' => {
                            let hi = self.peek();
                            let lo = self.peek_at(1);
                            if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() {
                                self.bump();
                                self.bump();
                                let code = u8::from_str_radix(
                                    std::str::from_utf8(&[hi, lo]).expect("hex digits are ascii"),
                                    16,
                                )
                                .expect("validated hex digits");
                                value.push(char::from(code));
                            } else {
                                self.errors.error(
                                    DiagnosticCode::UnrecognizedEscape,
                                    escape_loc,
                                    "\\x escape requires two hex digits",
                                );
                            }
                        }
                        other => {
                            self.errors.error(
                                DiagnosticCode::UnrecognizedEscape,
                                escape_loc,
                                format!("unrecognized escape '\\{}'", char::from(other)),
                            );
                            value.push(char::from(other));
                        }
                    }
                }
                byte => {
                    // Multi-byte UTF-8 sequences pass through untouched.
                    if byte < 0x80 {
                        value.push(char::from(byte));
                    } else {
                        let char_start = self.pos - 1;
                        let ch = self.src[char_start..].chars().next().expect("valid utf-8 source");
                        for _ in 1..ch.len_utf8() {
                            self.bump();
                        }
                        value.push(ch);
                    }
                }
            }
        }
    }

    fn read_identifier(&mut self, loc: SourceLocation) -> Token {
        let start = self.pos;
        while matches!(self.peek(), b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_') {
            self.bump();
        }
        let text = &self.src[start..self.pos];
        match Keyword::lookup(text) {
            Some(keyword) => Token::new(TokenKind::Keyword(keyword), loc),
            None => Token::new(TokenKind::Ident(text.into()), loc),
        }
    }

    fn read_operator_or_punct(&mut self, loc: SourceLocation) -> Token {
        // Greedy-match three-, two-, then one-byte sequences.
        let three: &[u8] = &[self.peek(), self.peek_at(1), self.peek_at(2)];
        if three == b"..." {
            self.bump();
            self.bump();
            self.bump();
            return Token::new(TokenKind::Punct(Punct::Ellipsis), loc);
        }

        let two = [self.peek(), self.peek_at(1)];
        let two_matched = match &two {
            b"->" => Some(TokenKind::Punct(Punct::Arrow)),
            b"<<" => Some(TokenKind::Operator(Op::Shl)),
            b">>" => Some(TokenKind::Operator(Op::Shr)),
            b"<=" => Some(TokenKind::Operator(Op::LessEquals)),
            b">=" => Some(TokenKind::Operator(Op::GreaterEquals)),
            b"==" => Some(TokenKind::Operator(Op::Equals)),
            b"!=" => Some(TokenKind::Operator(Op::NotEquals)),
            b"&&" => Some(TokenKind::Operator(Op::LogicalAnd)),
            b"||" => Some(TokenKind::Operator(Op::LogicalOr)),
            b"++" => Some(TokenKind::Operator(Op::Increment)),
            b"--" => Some(TokenKind::Operator(Op::Decrement)),
            b"+=" => Some(TokenKind::Operator(Op::AddAssign)),
            b"-=" => Some(TokenKind::Operator(Op::SubAssign)),
            b"*=" => Some(TokenKind::Operator(Op::MulAssign)),
            b"/=" => Some(TokenKind::Operator(Op::DivAssign)),
            b"%=" => Some(TokenKind::Operator(Op::ModAssign)),
            b"^=" => Some(TokenKind::Operator(Op::XorAssign)),
            b"&=" => Some(TokenKind::Operator(Op::AndAssign)),
            b"|=" => Some(TokenKind::Operator(Op::OrAssign)),
            _ => None,
        };
        if let Some(kind) = two_matched {
            self.bump();
            self.bump();
            return Token::new(kind, loc);
        }

        let kind = match self.peek() {
            b'+' => TokenKind::Operator(Op::Add),
            b'-' => TokenKind::Operator(Op::Sub),
            b'*' => TokenKind::Operator(Op::Mul),
            b'/' => TokenKind::Operator(Op::Div),
            b'%' => TokenKind::Operator(Op::Mod),
            b'^' => TokenKind::Operator(Op::BitXor),
            b'&' => TokenKind::Operator(Op::BitAnd),
            b'|' => TokenKind::Operator(Op::BitOr),
            b'<' => TokenKind::Operator(Op::Less),
            b'>' => TokenKind::Operator(Op::Greater),
            b'=' => TokenKind::Operator(Op::Assign),
            b'!' => TokenKind::Operator(Op::LogicalNot),
            b'~' => TokenKind::Operator(Op::BitNot),
            b',' => TokenKind::Punct(Punct::Comma),
            b';' => TokenKind::Punct(Punct::Semicolon),
            b':' => TokenKind::Punct(Punct::Colon),
            b'.' => TokenKind::Punct(Punct::Dot),
            b'(' => TokenKind::Punct(Punct::OpenParen),
            b')' => TokenKind::Punct(Punct::CloseParen),
            b'[' => TokenKind::Punct(Punct::OpenBracket),
            b']' => TokenKind::Punct(Punct::CloseBracket),
            b'{' => TokenKind::Punct(Punct::OpenBrace),
            b'}' => TokenKind::Punct(Punct::CloseBrace),
            b'#' => TokenKind::Punct(Punct::Hash),
            other => {
                self.bump();
                self.errors.error(
                    DiagnosticCode::UnexpectedCharacter,
                    loc,
                    format!("unexpected character '{}'", char::from(other)),
                );
                return Token::new(TokenKind::Newline, loc);
            }
        };
        self.bump();
        Token::new(kind, loc)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn lex(src: &str) -> (Vec<Token>, ErrorList) {
        let mut errors = ErrorList::new();
        let tokens = Lexer::new(src, FileId::MAIN, &mut errors).tokenize();
        (tokens, errors)
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, errors) = lex(src);
        assert!(!errors.has_errors(), "unexpected lex errors");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_declaration() {
        assert_eq!(
            kinds("let x = 3"),
            vec![
                TokenKind::Keyword(Keyword::Let),
                TokenKind::Ident("x".into()),
                TokenKind::Operator(Op::Assign),
                TokenKind::Integer(3),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_hex_and_float_literals() {
        assert_eq!(
            kinds("0xff 2.5"),
            vec![TokenKind::Integer(255), TokenKind::Float(2.5), TokenKind::Eof]
        );
    }

    #[test]
    fn lexes_string_escapes() {
        assert_eq!(
            kinds(r#""a\tb\x41\n""#),
            vec![TokenKind::Str("a\tb\u{41}\n".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn newline_is_a_token() {
        assert_eq!(
            kinds("1\n2"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Newline,
                TokenKind::Integer(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn doc_comment_is_kept_and_line_comment_dropped() {
        let tokens = kinds("/** adds one */ // nothing\nfunc");
        assert_eq!(
            tokens,
            vec![
                TokenKind::DocComment("adds one".into()),
                TokenKind::Newline,
                TokenKind::Keyword(Keyword::Func),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn greedy_operator_matching() {
        assert_eq!(
            kinds("a <<= b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Operator(Op::Shl),
                TokenKind::Operator(Op::Assign),
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("x<=y"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Operator(Op::LessEquals),
                TokenKind::Ident("y".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_reports_and_recovers() {
        let (tokens, errors) = lex("\"abc");
        assert!(errors.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Str("abc".into()));
    }

    #[test]
    fn every_byte_is_consumed() {
        // Tokenization is total: arbitrary input terminates and covers the buffer.
        let (tokens, _) = lex("let @ 3 $ \"x");
        assert!(matches!(tokens.last().map(|t| &t.kind), Some(TokenKind::Eof)));
    }

    #[test]
    fn keyword_reclassification() {
        assert_eq!(Keyword::lookup("while"), Some(Keyword::While));
        assert_eq!(Keyword::lookup("self"), Some(Keyword::SelfKw));
        assert_eq!(Keyword::lookup("whiles"), None);
    }
}
