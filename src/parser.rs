//! # Parser Module
//!
//! Recursive descent parser with Pratt-style precedence climbing for
//! expressions. Consumes the lexer's token stream and produces the AST the
//! compiler lowers to bytecode.
//!
//! ## Notes
//! - `function name(...)` is a declaration only at the top level of a
//!   program; anywhere else `function` is the function type literal.
//! - `{` opens a block in statement position and an object literal in
//!   expression position.

use crate::ast::*;
use crate::error::{Span, TotemError, TotemResult};
use crate::token::{Token, TokenKind};
use crate::value::PublicType;

// -----------------------------------------------------------------------------
// PRECEDENCE LEVELS
// -----------------------------------------------------------------------------

/// Operator precedence levels, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None = 0,
    Assignment = 1, // = += -= *= /=
    Or = 2,         // ||
    And = 3,        // &&
    Equality = 4,   // == != is
    Comparison = 5, // < > <= >=
    Shift = 6,      // <<
    Term = 7,       // + -
    Factor = 8,     // * /
    Power = 9,      // **
    Cast = 10,      // as
    Unary = 11,     // ! - ++ --
    Call = 12,      // . () []
}

impl Precedence {
    /// The next tighter level, saturating at `Call`.
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Power,
            Precedence::Power => Precedence::Cast,
            Precedence::Cast => Precedence::Unary,
            Precedence::Unary | Precedence::Call => Precedence::Call,
        }
    }
}

// -----------------------------------------------------------------------------
// PARSER STATE
// -----------------------------------------------------------------------------

/// The Totem parser. Turns tokens into an abstract syntax tree.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    /// `tokens` must end with [`TokenKind::Eof`], as the lexer guarantees.
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    /// Parses a whole program.
    pub fn parse(&mut self) -> TotemResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            if self.at(&TokenKind::Function) && self.next_is_ident() {
                stmts.push(self.fun_declaration()?);
            } else {
                stmts.push(self.declaration()?);
            }
        }
        Ok(stmts)
    }

    // -------------------------------------------------------------------------
    // DECLARATION PARSING
    // -------------------------------------------------------------------------

    fn declaration(&mut self) -> TotemResult<Stmt> {
        match self.peek_token_kind() {
            TokenKind::Var => self.var_declaration(false),
            TokenKind::Const => self.var_declaration(true),
            TokenKind::Function if self.next_is_ident() => Err(TotemError::parser(
                "functions can only be declared at the top level",
                self.peek().span,
            )),
            _ => self.statement(),
        }
    }

    /// Parses `var name = expr;`, `var name;` or `const name = expr;`
    fn var_declaration(&mut self, is_const: bool) -> TotemResult<Stmt> {
        let span = self.advance().span;
        let name = self.identifier("expected variable name")?;

        let initializer = if self.eat(&TokenKind::Eq) {
            Some(self.expression()?)
        } else if is_const {
            return Err(TotemError::parser(
                "expected '=' after constant name",
                self.peek().span,
            ));
        } else {
            None
        };

        self.semicolon()?;
        Ok(Stmt::VarDecl {
            name,
            initializer,
            is_const,
            span,
        })
    }

    /// Parses `function name(params...) { body }`
    fn fun_declaration(&mut self) -> TotemResult<Stmt> {
        let span = self.advance().span;
        let name = self.identifier("expected function name")?;
        let params = self.param_list()?;
        let body = self.block_body()?;
        Ok(Stmt::FunDecl {
            name,
            params,
            body,
            span,
        })
    }

    // -------------------------------------------------------------------------
    // STATEMENT PARSING
    // -------------------------------------------------------------------------

    fn statement(&mut self) -> TotemResult<Stmt> {
        match self.peek_token_kind() {
            TokenKind::LBrace => self.block_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Do => self.do_while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Switch => self.switch_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => {
                let span = self.advance().span;
                self.semicolon()?;
                Ok(Stmt::Break { span })
            }
            TokenKind::Continue => {
                let span = self.advance().span;
                self.semicolon()?;
                Ok(Stmt::Continue { span })
            }
            _ => self.expression_statement(),
        }
    }

    fn block_statement(&mut self) -> TotemResult<Stmt> {
        let span = self.peek().span;
        let stmts = self.block_body()?;
        Ok(Stmt::Block { stmts, span })
    }

    /// Parses `if (cond) stmt [else stmt]`
    fn if_statement(&mut self) -> TotemResult<Stmt> {
        let span = self.advance().span;
        let condition = self.parenthesized("if")?;
        let then_branch = Box::new(self.statement()?);

        let else_branch = if self.eat(&TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };

        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            span,
        })
    }

    fn while_statement(&mut self) -> TotemResult<Stmt> {
        let span = self.advance().span;
        let condition = self.parenthesized("while")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While {
            condition,
            body,
            span,
        })
    }

    /// Parses `do stmt while (cond);`
    fn do_while_statement(&mut self) -> TotemResult<Stmt> {
        let span = self.advance().span;
        let body = Box::new(self.statement()?);
        self.consume(&TokenKind::While, "expected 'while' after do body")?;
        let condition = self.parenthesized("while")?;
        self.semicolon()?;
        Ok(Stmt::DoWhile {
            body,
            condition,
            span,
        })
    }

    /// Parses `for (init; cond; update) stmt`
    fn for_statement(&mut self) -> TotemResult<Stmt> {
        let span = self.advance().span;
        self.consume(&TokenKind::LParen, "expected '(' after 'for'")?;

        let init = if self.eat(&TokenKind::Semicolon) {
            None
        } else if self.at(&TokenKind::Var) {
            Some(Box::new(self.var_declaration(false)?))
        } else {
            let expr = self.expression()?;
            let s = expr.span();
            self.semicolon()?;
            Some(Box::new(Stmt::ExprStmt { expr, span: s }))
        };

        let condition = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.semicolon()?;

        let update = if self.at(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(&TokenKind::RParen, "expected ')' after for clauses")?;

        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            condition,
            update,
            body,
            span,
        })
    }

    /// Parses `switch (value) { case a: ... default: ... }`
    fn switch_statement(&mut self) -> TotemResult<Stmt> {
        let span = self.advance().span;
        let value = self.parenthesized("switch")?;
        self.consume(&TokenKind::LBrace, "expected '{' after switch value")?;

        let mut cases = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            let case_span = self.peek().span;
            let test = match self.peek_token_kind() {
                TokenKind::Case => {
                    self.advance();
                    Some(self.expression()?)
                }
                TokenKind::Default => {
                    self.advance();
                    None
                }
                _ => {
                    return Err(TotemError::parser(
                        "expected 'case' or 'default'",
                        case_span,
                    ))
                }
            };
            self.consume(&TokenKind::Colon, "expected ':' after case")?;

            let mut body = Vec::new();
            while !matches!(
                self.peek_token_kind(),
                TokenKind::Case | TokenKind::Default | TokenKind::RBrace | TokenKind::Eof
            ) {
                body.push(self.declaration()?);
            }
            cases.push(SwitchCase {
                test,
                body,
                span: case_span,
            });
        }

        self.consume(&TokenKind::RBrace, "expected '}' after switch cases")?;
        Ok(Stmt::Switch { value, cases, span })
    }

    fn return_statement(&mut self) -> TotemResult<Stmt> {
        let span = self.advance().span;
        let value = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.semicolon()?;
        Ok(Stmt::Return { value, span })
    }

    fn expression_statement(&mut self) -> TotemResult<Stmt> {
        let expr = self.expression()?;
        let span = expr.span();
        self.semicolon()?;
        Ok(Stmt::ExprStmt { expr, span })
    }

    // -------------------------------------------------------------------------
    // EXPRESSION PARSING
    // -------------------------------------------------------------------------

    fn expression(&mut self) -> TotemResult<Expr> {
        self.expr_at(Precedence::Assignment)
    }

    fn expr_at(&mut self, min_prec: Precedence) -> TotemResult<Expr> {
        let mut left = self.prefix()?;

        loop {
            let prec = self.infix_precedence();
            if prec == Precedence::None || prec < min_prec {
                break;
            }
            left = self.infix(left, prec)?;
        }

        Ok(left)
    }

    fn prefix(&mut self) -> TotemResult<Expr> {
        let token = self.advance();
        let span = token.span;
        match token.kind {
            TokenKind::Minus => Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(self.expr_at(Precedence::Unary)?),
                span,
            }),
            TokenKind::Bang => Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(self.expr_at(Precedence::Unary)?),
                span,
            }),
            TokenKind::PlusPlus => Ok(Expr::PreIncDec {
                op: IncDecOp::Inc,
                operand: Box::new(self.expr_at(Precedence::Unary)?),
                span,
            }),
            TokenKind::MinusMinus => Ok(Expr::PreIncDec {
                op: IncDecOp::Dec,
                operand: Box::new(self.expr_at(Precedence::Unary)?),
                span,
            }),

            TokenKind::Number(text) => Ok(Expr::Number { text, span }),
            TokenKind::Str(value) => Ok(Expr::Str { value, span }),
            TokenKind::True => Ok(Expr::Bool { value: true, span }),
            TokenKind::False => Ok(Expr::Bool { value: false, span }),
            TokenKind::Null => Ok(Expr::Null { span }),
            TokenKind::Type(ty) => Ok(Expr::Type { ty, span }),
            TokenKind::Function => Ok(Expr::Type {
                ty: PublicType::Function,
                span,
            }),
            TokenKind::Ident(name) => Ok(Expr::Ident { name, span }),

            TokenKind::LParen => {
                let expr = self.expression()?;
                self.consume(&TokenKind::RParen, "expected ')'")?;
                Ok(expr)
            }
            TokenKind::LBracket => self.array_literal(span),
            TokenKind::LBrace => self.object_literal(span),

            other => Err(TotemError::parser(
                format!("unexpected token: {:?}", other),
                span,
            )),
        }
    }

    fn infix(&mut self, left: Expr, prec: Precedence) -> TotemResult<Expr> {
        let token = self.advance();
        let span = token.span;
        match token.kind {
            TokenKind::Eq => {
                let value = self.expr_at(Precedence::Assignment)?;
                Ok(Expr::Assign {
                    target: Box::new(left),
                    value: Box::new(value),
                    span,
                })
            }

            TokenKind::PlusEq | TokenKind::MinusEq | TokenKind::StarEq | TokenKind::SlashEq => {
                let op = match token.kind {
                    TokenKind::PlusEq => BinOp::Add,
                    TokenKind::MinusEq => BinOp::Sub,
                    TokenKind::StarEq => BinOp::Mul,
                    _ => BinOp::Div,
                };
                let value = self.expr_at(Precedence::Assignment)?;
                Ok(Expr::CompoundAssign {
                    target: Box::new(left),
                    op,
                    value: Box::new(value),
                    span,
                })
            }

            TokenKind::PlusPlus => Ok(Expr::PostIncDec {
                op: IncDecOp::Inc,
                operand: Box::new(left),
                span,
            }),
            TokenKind::MinusMinus => Ok(Expr::PostIncDec {
                op: IncDecOp::Dec,
                operand: Box::new(left),
                span,
            }),

            TokenKind::LParen => {
                let args = self.arg_list()?;
                let span = left.span();
                Ok(Expr::Call {
                    callee: Box::new(left),
                    args,
                    span,
                })
            }

            TokenKind::LBracket => {
                let index = self.expression()?;
                self.consume(&TokenKind::RBracket, "expected ']'")?;
                let span = left.span();
                Ok(Expr::Index {
                    object: Box::new(left),
                    index: Box::new(index),
                    span,
                })
            }

            TokenKind::Dot => {
                let member = self.identifier("expected member name after '.'")?;
                let span = left.span();
                Ok(Expr::MemberAccess {
                    object: Box::new(left),
                    member,
                    span,
                })
            }

            kind => {
                let op = binop_for(&kind).ok_or_else(|| {
                    TotemError::parser(format!("unexpected token: {:?}", kind), span)
                })?;

                // `**` is right-associative.
                let next_prec = if op == BinOp::Pow { prec } else { prec.next() };
                let right = self.expr_at(next_prec)?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                    span,
                })
            }
        }
    }

    fn infix_precedence(&self) -> Precedence {
        match self.peek_token_kind() {
            TokenKind::Eq
            | TokenKind::PlusEq
            | TokenKind::MinusEq
            | TokenKind::StarEq
            | TokenKind::SlashEq => Precedence::Assignment,
            TokenKind::PipePipe => Precedence::Or,
            TokenKind::AmpAmp => Precedence::And,
            TokenKind::EqEq | TokenKind::BangEq | TokenKind::Is => Precedence::Equality,
            TokenKind::Lt | TokenKind::Gt | TokenKind::LtEq | TokenKind::GtEq => {
                Precedence::Comparison
            }
            TokenKind::Shl => Precedence::Shift,
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::Star | TokenKind::Slash => Precedence::Factor,
            TokenKind::Power => Precedence::Power,
            TokenKind::As => Precedence::Cast,
            TokenKind::PlusPlus
            | TokenKind::MinusMinus
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::Dot => Precedence::Call,
            _ => Precedence::None,
        }
    }

    // -------------------------------------------------------------------------
    // COMPOUND CONSTRUCTS
    // -------------------------------------------------------------------------

    /// Parses the rest of `[a, b, ...]`; a trailing comma is allowed.
    fn array_literal(&mut self, span: Span) -> TotemResult<Expr> {
        let mut elements = Vec::new();

        if !self.at(&TokenKind::RBracket) {
            elements.push(self.expression()?);
            while self.eat(&TokenKind::Comma) {
                if self.at(&TokenKind::RBracket) {
                    break;
                }
                elements.push(self.expression()?);
            }
        }

        self.consume(&TokenKind::RBracket, "expected ']' after array elements")?;
        Ok(Expr::Array { elements, span })
    }

    /// Parses the rest of `{"key": value, name: value}`.
    fn object_literal(&mut self, span: Span) -> TotemResult<Expr> {
        let mut entries = Vec::new();

        while !self.at(&TokenKind::RBrace) {
            let key_token = self.advance();
            let key = match key_token.kind {
                TokenKind::Str(s) | TokenKind::Ident(s) => s,
                _ => {
                    return Err(TotemError::parser(
                        "expected object key",
                        key_token.span,
                    ))
                }
            };
            self.consume(&TokenKind::Colon, "expected ':' after object key")?;
            entries.push((key, self.expression()?));

            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        self.consume(&TokenKind::RBrace, "expected '}' after object entries")?;
        Ok(Expr::Object { entries, span })
    }

    fn parenthesized(&mut self, keyword: &str) -> TotemResult<Expr> {
        self.consume(
            &TokenKind::LParen,
            &format!("expected '(' after '{}'", keyword),
        )?;
        let expr = self.expression()?;
        self.consume(&TokenKind::RParen, "expected ')' after condition")?;
        Ok(expr)
    }

    fn param_list(&mut self) -> TotemResult<Vec<String>> {
        self.consume(&TokenKind::LParen, "expected '(' for parameter list")?;
        let mut params = Vec::new();

        if !self.at(&TokenKind::RParen) {
            params.push(self.identifier("expected parameter name")?);
            while self.eat(&TokenKind::Comma) {
                params.push(self.identifier("expected parameter name")?);
            }
        }

        self.consume(&TokenKind::RParen, "expected ')' after parameters")?;
        Ok(params)
    }

    fn arg_list(&mut self) -> TotemResult<Vec<Expr>> {
        let mut args = Vec::new();

        if !self.at(&TokenKind::RParen) {
            args.push(self.expression()?);
            while self.eat(&TokenKind::Comma) {
                args.push(self.expression()?);
            }
        }

        self.consume(&TokenKind::RParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn block_body(&mut self) -> TotemResult<Vec<Stmt>> {
        self.consume(&TokenKind::LBrace, "expected '{'")?;
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) && !self.at_eof() {
            stmts.push(self.declaration()?);
        }
        self.consume(&TokenKind::RBrace, "expected '}'")?;
        Ok(stmts)
    }

    // -------------------------------------------------------------------------
    // TOKEN HELPERS
    // -------------------------------------------------------------------------

    #[inline]
    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    #[inline]
    fn peek_token_kind(&self) -> &TokenKind {
        &self.tokens[self.current].kind
    }

    fn next_is_ident(&self) -> bool {
        matches!(
            self.tokens.get(self.current + 1).map(|t| &t.kind),
            Some(TokenKind::Ident(_))
        )
    }

    /// Consumes and returns the current token. `Eof` is never consumed.
    #[inline]
    fn advance(&mut self) -> Token {
        let token = self.tokens[self.current].clone();
        if !self.at_eof() {
            self.current += 1;
        }
        token
    }

    #[inline]
    fn at_eof(&self) -> bool {
        matches!(self.tokens[self.current].kind, TokenKind::Eof)
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_token_kind()) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, msg: &str) -> TotemResult<Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(TotemError::parser(msg, self.peek().span))
        }
    }

    fn identifier(&mut self, msg: &str) -> TotemResult<String> {
        if let TokenKind::Ident(name) = self.peek_token_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(TotemError::parser(msg, self.peek().span))
        }
    }

    fn semicolon(&mut self) -> TotemResult<Token> {
        self.consume(&TokenKind::Semicolon, "expected ';'")
    }
}

// -----------------------------------------------------------------------------
// OPERATOR CONVERSION
// -----------------------------------------------------------------------------

fn binop_for(kind: &TokenKind) -> Option<BinOp> {
    Some(match kind {
        TokenKind::Plus => BinOp::Add,
        TokenKind::Minus => BinOp::Sub,
        TokenKind::Star => BinOp::Mul,
        TokenKind::Slash => BinOp::Div,
        TokenKind::Power => BinOp::Pow,
        TokenKind::EqEq => BinOp::Eq,
        TokenKind::BangEq => BinOp::Ne,
        TokenKind::Lt => BinOp::Lt,
        TokenKind::Gt => BinOp::Gt,
        TokenKind::LtEq => BinOp::Le,
        TokenKind::GtEq => BinOp::Ge,
        TokenKind::AmpAmp => BinOp::And,
        TokenKind::PipePipe => BinOp::Or,
        TokenKind::Is => BinOp::Is,
        TokenKind::As => BinOp::As,
        TokenKind::Shl => BinOp::Shift,
        _ => return None,
    })
}
