//! Parser: tokens to the statement tree.
//!
//! Recursive descent with Pratt-style precedence climbing for binary
//! operators. The parser builds AST shape only; it constructs no types and
//! resolves no names. Newlines terminate statements except after a token
//! with the continuation property.

use crate::{
    ast::{
        BinaryOp, DeclKind, Expr, ExprKind, FunctionExpr, GenericParamDecl, ImportTarget, Param, Stmt, StmtKind,
        TypeExprNode, TypeMember, UnaryOp, VarDecl,
    },
    error::{DiagnosticCode, ErrorList, SourceLocation},
    lex::{Keyword, Op, Punct, Token, TokenKind},
};

/// Maximum expression nesting depth; prevents stack overflow on
/// pathological inputs like `((((...))))`.
const MAX_NESTING_DEPTH: u32 = 200;

/// Binding power just above assignment; type annotations parse at this
/// level so that `let x: Int = 3` stops the annotation before `=`.
const ANNOTATION_PRECEDENCE: u8 = 3;

/// Parses a token sequence into a statement list, recording diagnostics.
pub fn parse(tokens: &[Token], errors: &mut ErrorList) -> Vec<Stmt> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        errors,
    };
    parser.parse_program()
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: u32,
    errors: &'a mut ErrorList,
}

impl Parser<'_> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn location(&self) -> SourceLocation {
        self.tokens[self.pos.min(self.tokens.len() - 1)].loc
    }

    fn advance(&mut self) -> &Token {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn check_punct(&self, p: Punct) -> bool {
        matches!(self.peek(), TokenKind::Punct(q) if *q == p)
    }

    fn check_op(&self, op: Op) -> bool {
        matches!(self.peek(), TokenKind::Operator(o) if *o == op)
    }

    fn check_keyword(&self, k: Keyword) -> bool {
        matches!(self.peek(), TokenKind::Keyword(q) if *q == k)
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.check_punct(p) {
            self.advance();
            if TokenKind::Punct(p).is_continuation() {
                self.skip_newlines_after_continuation();
            }
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: Op) -> bool {
        if self.check_op(op) {
            self.advance();
            self.skip_newlines_after_continuation();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, k: Keyword) -> bool {
        if self.check_keyword(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// After consuming a continuation token, following newlines are
    /// whitespace.
    fn skip_newlines_after_continuation(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    /// Reports expected-vs-found at the current token.
    fn expected(&mut self, what: &str) {
        let found = self.peek().clone();
        let loc = self.location();
        let code = if matches!(found, TokenKind::Eof) {
            DiagnosticCode::UnexpectedEof
        } else {
            DiagnosticCode::UnexpectedToken
        };
        self.errors.error(code, loc, format!("expected {what}, found {found}"));
    }

    /// Minimal recovery: skip to the next statement terminator or closing
    /// brace.
    fn recover(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Eof | TokenKind::Newline => return,
                TokenKind::Punct(Punct::Semicolon) => {
                    self.advance();
                    return;
                }
                TokenKind::Punct(Punct::CloseBrace) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn expect_punct(&mut self, p: Punct, what: &str) -> bool {
        if self.eat_punct(p) {
            true
        } else {
            self.expected(what);
            false
        }
    }

    fn expect_ident(&mut self) -> Option<Box<str>> {
        if let TokenKind::Ident(name) = self.peek() {
            let name = name.clone();
            self.advance();
            Some(name)
        } else {
            self.expected("an identifier");
            None
        }
    }

    // ================================================================
    // Statements
    // ================================================================

    fn parse_program(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.at_eof() {
            if let Some(stmt) = self.parse_statement() {
                stmts.push(stmt);
            } else {
                self.recover();
            }
            self.skip_newlines();
            while self.eat_punct(Punct::Semicolon) {
                self.skip_newlines();
            }
        }
        stmts
    }

    fn parse_statement(&mut self) -> Option<Stmt> {
        // Leading documentation comments attach to nothing yet; skip them.
        while matches!(self.peek(), TokenKind::DocComment(_)) {
            self.advance();
            self.skip_newlines();
        }
        let loc = self.location();
        match self.peek().clone() {
            TokenKind::Keyword(Keyword::Module) => {
                self.advance();
                let name = self.expect_ident()?;
                Some(Stmt::new(StmtKind::Module { name }, loc))
            }
            TokenKind::Keyword(Keyword::Let) => self.parse_var_decl(DeclKind::Let, loc),
            TokenKind::Keyword(Keyword::Const) => self.parse_var_decl(DeclKind::Const, loc),
            TokenKind::Keyword(Keyword::Ref) => self.parse_var_decl(DeclKind::Ref, loc),
            TokenKind::Keyword(Keyword::Val) => self.parse_var_decl(DeclKind::Val, loc),
            TokenKind::Keyword(Keyword::Alias) => {
                self.advance();
                let name = self.expect_ident()?;
                if !self.eat_op(Op::Assign) {
                    self.expected("'=' in alias declaration");
                    return None;
                }
                let aliasee = self.parse_expression()?;
                Some(Stmt::new(
                    StmtKind::AliasDecl {
                        name,
                        aliasee: Box::new(aliasee),
                        binding: None,
                    },
                    loc,
                ))
            }
            TokenKind::Keyword(Keyword::Type) => {
                self.advance();
                let node = self.parse_type_body(loc)?;
                Some(Stmt::new(StmtKind::TypeDecl(Box::new(node)), loc))
            }
            TokenKind::Keyword(Keyword::Func) if matches!(self.peek_at(1), TokenKind::Ident(_)) => {
                self.advance();
                let name = self.expect_ident()?;
                let func = self.parse_function_tail(loc)?;
                Some(Stmt::new(
                    StmtKind::FuncDecl {
                        name,
                        func: Box::new(func),
                        binding: None,
                    },
                    loc,
                ))
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if(loc),
            TokenKind::Keyword(Keyword::While) => {
                self.advance();
                let cond = self.parse_expression()?;
                let body = self.parse_block()?;
                Some(Stmt::new(
                    StmtKind::While {
                        cond: Box::new(cond),
                        body,
                    },
                    loc,
                ))
            }
            TokenKind::Keyword(Keyword::For) => self.parse_for(loc),
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.statement_finished() {
                    None
                } else {
                    Some(Box::new(self.parse_expression()?))
                };
                Some(Stmt::new(StmtKind::Return(value), loc))
            }
            TokenKind::Keyword(Keyword::Yield) => {
                self.advance();
                let value = self.parse_expression()?;
                Some(Stmt::new(StmtKind::Yield(Box::new(value)), loc))
            }
            TokenKind::Keyword(Keyword::Throw) => {
                self.advance();
                let value = self.parse_expression()?;
                Some(Stmt::new(StmtKind::Throw(Box::new(value)), loc))
            }
            TokenKind::Keyword(Keyword::Try) => self.parse_try(loc),
            TokenKind::Keyword(Keyword::Import) => self.parse_import(loc),
            TokenKind::Keyword(Keyword::Use) => self.parse_directive(loc),
            TokenKind::Keyword(Keyword::Print) => {
                self.advance();
                let mut args = vec![self.parse_expression()?];
                while self.eat_punct(Punct::Comma) {
                    args.push(self.parse_expression()?);
                }
                Some(Stmt::new(StmtKind::Print(args), loc))
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                Some(Stmt::new(StmtKind::Break, loc))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                Some(Stmt::new(StmtKind::Continue, loc))
            }
            TokenKind::Punct(Punct::OpenBrace) => {
                let body = self.parse_block()?;
                Some(Stmt::new(StmtKind::Block(body), loc))
            }
            _ => {
                let expr = self.parse_expression()?;
                Some(Stmt::new(StmtKind::Expr(Box::new(expr)), loc))
            }
        }
    }

    fn statement_finished(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Newline | TokenKind::Eof | TokenKind::Punct(Punct::Semicolon | Punct::CloseBrace)
        )
    }

    fn parse_var_decl(&mut self, decl_kind: DeclKind, loc: SourceLocation) -> Option<Stmt> {
        self.advance();
        let name = self.expect_ident()?;
        let proto = if self.eat_punct(Punct::Colon) {
            Some(Box::new(self.parse_annotation()?))
        } else {
            None
        };
        let init = if self.eat_op(Op::Assign) {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        Some(Stmt::new(
            StmtKind::VarDecl(VarDecl {
                decl_kind,
                name,
                proto,
                init,
                binding: None,
            }),
            loc,
        ))
    }

    fn parse_if(&mut self, loc: SourceLocation) -> Option<Stmt> {
        self.advance();
        let cond = self.parse_expression()?;
        let then_branch = self.parse_block()?;
        let checkpoint = self.pos;
        self.skip_newlines();
        let else_branch = if self.eat_keyword(Keyword::Else) {
            self.skip_newlines();
            if self.check_keyword(Keyword::If) {
                let else_loc = self.location();
                let nested = self.parse_if(else_loc)?;
                Some(vec![nested])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            self.pos = checkpoint;
            None
        };
        Some(Stmt::new(
            StmtKind::If {
                cond: Box::new(cond),
                then_branch,
                else_branch,
            },
            loc,
        ))
    }

    fn parse_for(&mut self, loc: SourceLocation) -> Option<Stmt> {
        self.advance();
        self.eat_keyword(Keyword::Each);
        let mut params = Vec::new();
        loop {
            let param_loc = self.location();
            let name = self.expect_ident()?;
            let type_expr = if self.eat_punct(Punct::Colon) {
                Some(Box::new(self.parse_annotation()?))
            } else {
                None
            };
            params.push(Param {
                name,
                type_expr,
                default: None,
                is_variadic: false,
                binding: None,
                loc: param_loc,
            });
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        // `in` is contextual: an ordinary identifier in the keyword table's
        // absence.
        match self.peek() {
            TokenKind::Ident(word) if word.as_ref() == "in" => {
                self.advance();
            }
            _ => {
                self.expected("'in' in for statement");
                return None;
            }
        }
        let iteree = self.parse_expression()?;
        let body = self.parse_block()?;
        Some(Stmt::new(
            StmtKind::For {
                params,
                iteree: Box::new(iteree),
                body,
                lowered: None,
            },
            loc,
        ))
    }

    fn parse_try(&mut self, loc: SourceLocation) -> Option<Stmt> {
        self.advance();
        let body = self.parse_block()?;
        self.skip_newlines();
        if !self.eat_keyword(Keyword::Catch) {
            self.expected("'catch' after try block");
            return None;
        }
        let catch_name = if self.eat_punct(Punct::OpenParen) {
            let name = self.expect_ident()?;
            self.expect_punct(Punct::CloseParen, "')' after catch binding");
            Some(name)
        } else if let TokenKind::Ident(name) = self.peek() {
            let name = name.clone();
            self.advance();
            Some(name)
        } else {
            None
        };
        let catch_body = self.parse_block()?;
        Some(Stmt::new(
            StmtKind::TryCatch {
                body,
                catch_name,
                catch_binding: None,
                catch_body,
            },
            loc,
        ))
    }

    fn parse_import(&mut self, loc: SourceLocation) -> Option<Stmt> {
        self.advance();
        match self.peek().clone() {
            TokenKind::Str(path) => {
                self.advance();
                Some(Stmt::new(StmtKind::Import(ImportTarget::File(path)), loc))
            }
            TokenKind::Ident(first) => {
                self.advance();
                let mut path = vec![first];
                while self.eat_punct(Punct::Dot) {
                    path.push(self.expect_ident()?);
                }
                Some(Stmt::new(StmtKind::Import(ImportTarget::Module(path)), loc))
            }
            _ => {
                self.expected("an import path");
                None
            }
        }
    }

    fn parse_directive(&mut self, loc: SourceLocation) -> Option<Stmt> {
        self.advance();
        let name = self.expect_ident()?;
        let mut args = Vec::new();
        if self.eat_punct(Punct::OpenBracket) {
            loop {
                match self.peek().clone() {
                    TokenKind::Str(s) => {
                        self.advance();
                        args.push(s);
                    }
                    TokenKind::Ident(s) => {
                        self.advance();
                        args.push(s);
                    }
                    _ => {
                        self.expected("a directive argument");
                        break;
                    }
                }
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
            self.expect_punct(Punct::CloseBracket, "']' after directive arguments");
        }
        Some(Stmt::new(StmtKind::Directive { name, args }, loc))
    }

    fn parse_block(&mut self) -> Option<Vec<Stmt>> {
        self.skip_newlines();
        if !self.expect_punct(Punct::OpenBrace, "'{'") {
            return None;
        }
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !self.check_punct(Punct::CloseBrace) && !self.at_eof() {
            if let Some(stmt) = self.parse_statement() {
                stmts.push(stmt);
            } else {
                self.recover();
            }
            self.skip_newlines();
            while self.eat_punct(Punct::Semicolon) {
                self.skip_newlines();
            }
        }
        self.expect_punct(Punct::CloseBrace, "'}'");
        Some(stmts)
    }

    // ================================================================
    // Expressions
    // ================================================================

    fn parse_expression(&mut self) -> Option<Expr> {
        self.parse_binary(2)
    }

    /// Type annotations bind tighter than assignment so `=` stays outside.
    fn parse_annotation(&mut self) -> Option<Expr> {
        self.parse_binary(ANNOTATION_PRECEDENCE)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Option<Expr> {
        if self.depth >= MAX_NESTING_DEPTH {
            let loc = self.location();
            self.errors
                .error(DiagnosticCode::ExpectedExpression, loc, "expression nesting too deep");
            return None;
        }
        self.depth += 1;
        let result = self.parse_binary_inner(min_precedence);
        self.depth -= 1;
        result
    }

    fn parse_binary_inner(&mut self, min_precedence: u8) -> Option<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let TokenKind::Operator(op) = *self.peek() else {
                return Some(lhs);
            };
            let Some(precedence) = op.binary_precedence() else {
                return Some(lhs);
            };
            if precedence < min_precedence {
                return Some(lhs);
            }
            let loc = self.location();
            self.advance();
            self.skip_newlines_after_continuation();
            let next_min = if op.is_right_associative() {
                precedence
            } else {
                precedence + 1
            };
            let rhs = self.parse_binary(next_min)?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op: binary_op_of(op),
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let loc = self.location();
        if let TokenKind::Operator(op) = *self.peek() {
            if op.is_unary() {
                self.advance();
                self.skip_newlines_after_continuation();
                let operand = self.parse_unary()?;
                let unary = match op {
                    Op::LogicalNot => UnaryOp::Not,
                    Op::Sub => UnaryOp::Negate,
                    Op::Add => UnaryOp::Positive,
                    Op::BitNot => UnaryOp::BitNot,
                    Op::Increment => UnaryOp::Increment,
                    Op::Decrement => UnaryOp::Decrement,
                    _ => unreachable!("is_unary covers the unary table"),
                };
                return Some(Expr::new(
                    ExprKind::Unary {
                        op: unary,
                        operand: Box::new(operand),
                    },
                    loc,
                ));
            }
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = self.location();
            if self.check_punct(Punct::OpenParen) {
                self.advance();
                self.skip_newlines_after_continuation();
                let mut args = Vec::new();
                if !self.check_punct(Punct::CloseParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::CloseParen, "')' after call arguments");
                expr = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    loc,
                );
            } else if self.check_punct(Punct::Dot) {
                self.advance();
                self.skip_newlines_after_continuation();
                let member = self.expect_ident()?;
                expr = Expr::new(
                    ExprKind::Member {
                        object: Box::new(expr),
                        member,
                        member_index: None,
                    },
                    loc,
                );
            } else if self.check_punct(Punct::OpenBracket) {
                self.advance();
                self.skip_newlines_after_continuation();
                let index = self.parse_expression()?;
                self.expect_punct(Punct::CloseBracket, "']' after index expression");
                expr = Expr::new(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    loc,
                );
            } else if self.check_op(Op::Less) && self.generic_apply_ahead() {
                self.advance();
                self.skip_newlines_after_continuation();
                let mut args = Vec::new();
                if !self.check_op(Op::Greater) {
                    loop {
                        args.push(self.parse_annotation()?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                if !self.eat_op(Op::Greater) {
                    self.expected("'>' closing generic arguments");
                    return None;
                }
                expr = Expr::new(
                    ExprKind::GenericApply {
                        base: Box::new(expr),
                        args,
                    },
                    loc,
                );
            } else if self.check_keyword(Keyword::Has) {
                self.advance();
                match self.peek().clone() {
                    TokenKind::Str(member) => {
                        self.advance();
                        expr = Expr::new(
                            ExprKind::Has {
                                object: Box::new(expr),
                                member,
                            },
                            loc,
                        );
                    }
                    TokenKind::Ident(member) => {
                        self.advance();
                        expr = Expr::new(
                            ExprKind::Has {
                                object: Box::new(expr),
                                member,
                            },
                            loc,
                        );
                    }
                    _ => {
                        self.expected("a member name after 'has'");
                        return None;
                    }
                }
            } else {
                return Some(expr);
            }
        }
    }

    /// Bounded look-ahead deciding `<` between less-than and generic
    /// application: the matching `>` must be followed by `(`, `{`, `,`, `)`,
    /// `;`, a newline, or end of input.
    fn generic_apply_ahead(&self) -> bool {
        let mut depth = 0usize;
        for offset in 0..64 {
            match self.peek_at(offset) {
                TokenKind::Operator(Op::Less) => depth += 1,
                TokenKind::Operator(Op::Greater) => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(
                            self.peek_at(offset + 1),
                            TokenKind::Punct(
                                Punct::OpenParen
                                    | Punct::OpenBrace
                                    | Punct::Comma
                                    | Punct::CloseParen
                                    | Punct::Semicolon
                            ) | TokenKind::Newline
                                | TokenKind::Eof
                        );
                    }
                }
                TokenKind::Operator(Op::Shr) => {
                    if depth < 2 {
                        return false;
                    }
                    depth -= 2;
                }
                TokenKind::Ident(_) | TokenKind::Punct(Punct::Comma | Punct::Dot) => {}
                TokenKind::Keyword(Keyword::Type | Keyword::Func) => {}
                _ => return false,
            }
        }
        false
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let loc = self.location();
        match self.peek().clone() {
            TokenKind::Integer(value) => {
                self.advance();
                Some(Expr::new(ExprKind::IntLit(value), loc))
            }
            TokenKind::Float(value) => {
                self.advance();
                Some(Expr::new(ExprKind::FloatLit(value), loc))
            }
            TokenKind::Str(value) => {
                self.advance();
                Some(Expr::new(ExprKind::StrLit(value), loc))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Some(Expr::new(ExprKind::BoolLit(true), loc))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Some(Expr::new(ExprKind::BoolLit(false), loc))
            }
            TokenKind::Keyword(Keyword::Null | Keyword::Nil | Keyword::Void) => {
                self.advance();
                Some(Expr::new(ExprKind::NullLit, loc))
            }
            TokenKind::Keyword(Keyword::SelfKw) => {
                self.advance();
                Some(Expr::new(ExprKind::SelfExpr, loc))
            }
            TokenKind::Keyword(Keyword::New) => {
                self.advance();
                let proto = self.parse_unary()?;
                Some(Expr::new(
                    ExprKind::New {
                        proto: Box::new(proto),
                    },
                    loc,
                ))
            }
            TokenKind::Keyword(Keyword::Typeof) => {
                self.advance();
                let operand = self.parse_unary()?;
                Some(Expr::new(
                    ExprKind::TypeOf {
                        operand: Box::new(operand),
                    },
                    loc,
                ))
            }
            TokenKind::Keyword(Keyword::Func) => {
                self.advance();
                self.parse_function_tail(loc)
            }
            TokenKind::Keyword(Keyword::Type) => {
                self.advance();
                let node = self.parse_type_body(loc)?;
                Some(Expr::new(ExprKind::TypeExpr(Box::new(node)), loc))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Some(Expr::new(
                    ExprKind::Ident {
                        name,
                        binding: None,
                        capture_index: None,
                    },
                    loc,
                ))
            }
            TokenKind::Punct(Punct::OpenParen) => {
                self.advance();
                self.skip_newlines_after_continuation();
                let inner = self.parse_expression()?;
                self.expect_punct(Punct::CloseParen, "')'");
                Some(inner)
            }
            TokenKind::Punct(Punct::OpenBracket) => {
                self.advance();
                self.skip_newlines_after_continuation();
                let mut items = Vec::new();
                if !self.check_punct(Punct::CloseBracket) {
                    loop {
                        items.push(self.parse_expression()?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                        self.skip_newlines();
                        if self.check_punct(Punct::CloseBracket) {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::CloseBracket, "']' after array literal");
                Some(Expr::new(ExprKind::ArrayLit(items), loc))
            }
            TokenKind::Punct(Punct::OpenBrace) => {
                let body = self.parse_block()?;
                Some(Expr::new(ExprKind::BlockExpr(body), loc))
            }
            _ => {
                self.expected("an expression");
                None
            }
        }
    }

    /// Parses the remainder of a function after `func [name]`: generic
    /// parameters, parameter list, optional return type, body.
    fn parse_function_tail(&mut self, loc: SourceLocation) -> Option<Expr> {
        let mut generic_params = Vec::new();
        if self.eat_op(Op::Less) {
            loop {
                let param_loc = self.location();
                let name = self.expect_ident()?;
                generic_params.push(GenericParamDecl { name, loc: param_loc });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
            if !self.eat_op(Op::Greater) {
                self.expected("'>' closing generic parameters");
                return None;
            }
        }
        if !self.expect_punct(Punct::OpenParen, "'(' starting parameter list") {
            return None;
        }
        let mut params = Vec::new();
        if !self.check_punct(Punct::CloseParen) {
            loop {
                let param_loc = self.location();
                let is_variadic = self.eat_punct(Punct::Ellipsis);
                let name = self.expect_ident()?;
                let type_expr = if self.eat_punct(Punct::Colon) {
                    Some(Box::new(self.parse_annotation()?))
                } else {
                    None
                };
                let default = if self.eat_op(Op::Assign) {
                    Some(Box::new(self.parse_annotation()?))
                } else {
                    None
                };
                params.push(Param {
                    name,
                    type_expr,
                    default,
                    is_variadic,
                    binding: None,
                    loc: param_loc,
                });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::CloseParen, "')' after parameters");
        let return_type_expr = if self.eat_punct(Punct::Arrow) {
            Some(Box::new(self.parse_annotation()?))
        } else {
            None
        };
        let body = self.parse_block()?;
        Some(Expr::new(
            ExprKind::Function(Box::new(FunctionExpr {
                params,
                generic_params,
                return_type_expr,
                body,
                captures: Vec::new(),
                return_ty: None,
                is_generator: false,
            })),
            loc,
        ))
    }

    /// Parses `Name { member: Type = default, ... }` after `type`.
    fn parse_type_body(&mut self, _loc: SourceLocation) -> Option<TypeExprNode> {
        let name = self.expect_ident()?;
        self.skip_newlines();
        if !self.expect_punct(Punct::OpenBrace, "'{' starting type body") {
            return None;
        }
        let mut members = Vec::new();
        self.skip_newlines();
        while !self.check_punct(Punct::CloseBrace) && !self.at_eof() {
            let member_loc = self.location();
            let Some(member_name) = self.expect_ident() else {
                self.recover();
                self.skip_newlines();
                continue;
            };
            let type_expr = if self.eat_punct(Punct::Colon) {
                Some(Box::new(self.parse_annotation()?))
            } else {
                None
            };
            let default = if self.eat_op(Op::Assign) {
                Some(Box::new(self.parse_annotation()?))
            } else {
                None
            };
            members.push(TypeMember {
                name: member_name,
                type_expr,
                default,
                loc: member_loc,
            });
            if !self.eat_punct(Punct::Comma) {
                self.skip_newlines();
                if self.check_punct(Punct::CloseBrace) {
                    break;
                }
            } else {
                self.skip_newlines();
            }
        }
        self.expect_punct(Punct::CloseBrace, "'}' closing type body");
        Some(TypeExprNode {
            name,
            members,
            ty: None,
        })
    }
}

fn binary_op_of(op: Op) -> BinaryOp {
    match op {
        Op::Add => BinaryOp::Add,
        Op::Sub => BinaryOp::Sub,
        Op::Mul => BinaryOp::Mul,
        Op::Div => BinaryOp::Div,
        Op::Mod => BinaryOp::Mod,
        Op::BitXor => BinaryOp::BitXor,
        Op::BitAnd => BinaryOp::BitAnd,
        Op::BitOr => BinaryOp::BitOr,
        Op::Shl => BinaryOp::Shl,
        Op::Shr => BinaryOp::Shr,
        Op::LogicalAnd => BinaryOp::LogicalAnd,
        Op::LogicalOr => BinaryOp::LogicalOr,
        Op::Equals => BinaryOp::Equals,
        Op::NotEquals => BinaryOp::NotEquals,
        Op::Less => BinaryOp::Less,
        Op::Greater => BinaryOp::Greater,
        Op::LessEquals => BinaryOp::LessEquals,
        Op::GreaterEquals => BinaryOp::GreaterEquals,
        Op::Assign => BinaryOp::Assign,
        Op::AddAssign => BinaryOp::AddAssign,
        Op::SubAssign => BinaryOp::SubAssign,
        Op::MulAssign => BinaryOp::MulAssign,
        Op::DivAssign => BinaryOp::DivAssign,
        Op::ModAssign => BinaryOp::ModAssign,
        Op::XorAssign => BinaryOp::XorAssign,
        Op::AndAssign => BinaryOp::AndAssign,
        Op::OrAssign => BinaryOp::OrAssign,
        Op::LogicalNot | Op::BitNot | Op::Increment | Op::Decrement => {
            unreachable!("unary-only operators never reach binary_op_of")
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{error::ErrorList, lex::Lexer};

    fn parse_ok(src: &str) -> Vec<Stmt> {
        let mut errors = ErrorList::new();
        let tokens = Lexer::new(src, crate::error::FileId::MAIN, &mut errors).tokenize();
        let stmts = parse(&tokens, &mut errors);
        assert!(!errors.has_errors(), "unexpected parse errors: {:?}", errors.iter().collect::<Vec<_>>());
        stmts
    }

    fn parse_err(src: &str) -> ErrorList {
        let mut errors = ErrorList::new();
        let tokens = Lexer::new(src, crate::error::FileId::MAIN, &mut errors).tokenize();
        let _ = parse(&tokens, &mut errors);
        errors
    }

    #[test]
    fn parses_declaration_with_annotation() {
        let stmts = parse_ok("let x: Int = 3");
        let StmtKind::VarDecl(decl) = &stmts[0].kind else {
            panic!("expected variable declaration");
        };
        assert_eq!(decl.name.as_ref(), "x");
        assert!(decl.proto.is_some());
        assert!(decl.init.is_some());
    }

    #[test]
    fn precedence_climbing() {
        // x * x + y * y parses as (x*x) + (y*y)
        let stmts = parse_ok("x * x + y * y");
        let StmtKind::Expr(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, lhs, rhs } = &expr.kind else {
            panic!("expected binary node");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(lhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn assignment_is_right_associative() {
        let stmts = parse_ok("a = b = c");
        let StmtKind::Expr(expr) = &stmts[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, rhs, .. } = &expr.kind else {
            panic!("expected binary node");
        };
        assert_eq!(*op, BinaryOp::Assign);
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Assign, .. }));
    }

    #[test]
    fn newline_terminates_statement() {
        let stmts = parse_ok("let x = 1\nlet y = 2");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn newline_after_operator_continues_expression() {
        let stmts = parse_ok("let x = 1 +\n2");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn parses_function_declaration() {
        let stmts = parse_ok("func add(a: Int, b: Int) -> Int { return a + b }");
        let StmtKind::FuncDecl { name, func, .. } = &stmts[0].kind else {
            panic!("expected function declaration");
        };
        assert_eq!(name.as_ref(), "add");
        let ExprKind::Function(f) = &func.kind else {
            panic!("expected function expression");
        };
        assert_eq!(f.params.len(), 2);
        assert!(f.return_type_expr.is_some());
    }

    #[test]
    fn parses_generic_function_and_application() {
        let stmts = parse_ok("func id<T>(x: T) -> T { return x }\nid<Int>(7)");
        let StmtKind::FuncDecl { func, .. } = &stmts[0].kind else {
            panic!("expected function declaration");
        };
        let ExprKind::Function(f) = &func.kind else {
            panic!("expected function expression");
        };
        assert_eq!(f.generic_params.len(), 1);

        let StmtKind::Expr(expr) = &stmts[1].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { callee, args } = &expr.kind else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(callee.kind, ExprKind::GenericApply { .. }));
    }

    #[test]
    fn less_than_is_not_generic_application() {
        let stmts = parse_ok("let r = a < b");
        let StmtKind::VarDecl(decl) = &stmts[0].kind else {
            panic!("expected variable declaration");
        };
        let init = decl.init.as_ref().expect("initializer");
        assert!(matches!(init.kind, ExprKind::Binary { op: BinaryOp::Less, .. }));
    }

    #[test]
    fn parses_for_each() {
        let stmts = parse_ok("for x in a { print x }");
        let StmtKind::For { params, .. } = &stmts[0].kind else {
            panic!("expected for statement");
        };
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name.as_ref(), "x");
    }

    #[test]
    fn parses_try_catch() {
        let stmts = parse_ok("try { throw \"oops\" } catch { print \"caught\" }");
        assert!(matches!(stmts[0].kind, StmtKind::TryCatch { .. }));
    }

    #[test]
    fn parses_type_declaration() {
        let stmts = parse_ok("type Point { x: Float = 0.0, y: Float = 0.0 }");
        let StmtKind::TypeDecl(node) = &stmts[0].kind else {
            panic!("expected type declaration");
        };
        assert_eq!(node.name.as_ref(), "Point");
        assert_eq!(node.members.len(), 2);
    }

    #[test]
    fn parses_imports_and_directives() {
        let stmts = parse_ok("import \"lib/util\"\nimport Math.Trig\nuse library [\"vecmath\"]");
        assert!(matches!(stmts[0].kind, StmtKind::Import(ImportTarget::File(_))));
        assert!(matches!(stmts[1].kind, StmtKind::Import(ImportTarget::Module(_))));
        assert!(matches!(stmts[2].kind, StmtKind::Directive { .. }));
    }

    #[test]
    fn mismatched_token_recovers() {
        let errors = parse_err("let = 3\nlet y = 4");
        assert!(errors.has_errors());
    }

    #[test]
    fn parses_array_literal_and_index() {
        let stmts = parse_ok("let a = [1, 2, 3]\na[0]");
        assert_eq!(stmts.len(), 2);
        let StmtKind::Expr(expr) = &stmts[1].kind else {
            panic!("expected expression statement");
        };
        assert!(matches!(expr.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn parses_new_and_member_access() {
        let stmts = parse_ok("let p = new Point\np.x = 1.5");
        assert_eq!(stmts.len(), 2);
        let StmtKind::Expr(expr) = &stmts[1].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op: BinaryOp::Assign, lhs, .. } = &expr.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(lhs.kind, ExprKind::Member { .. }));
    }
}
