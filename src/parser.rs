//! Recursive-descent parser over the token stream.
//!
//! Statement parsing dispatches on the keyword after `{%`; bodies are
//! parsed with an explicit terminator set, and the terminating keyword is
//! left as the current token for the caller to consume. Expression parsing
//! is precedence climbing, loosest first: conditional, `or`, `and`, `not`,
//! comparisons (chainable, desugared to `and` pairs) with `in` and
//! `is` tests, then a shared additive tier for `+ - ~` and pipe filters
//! (so `a + b | f` is `f(a + b)` while `a | f + 1` is `(a | f) + 1`),
//! multiplicative, unary, power, and postfix `.attr` / `[i]` / `(args)`.

use std::mem::discriminant;

use crate::ast::{
    Arg, BinOp, Expr, FilterCall, ForStmt, MacroStmt, Param, SetSource, SetStmt, Stmt, UnaryOp,
};
use crate::error::{SyntaxError, SyntaxErrorKind};
use crate::lexer::{Lexer, LexerOptions, Token, TokenKind};

type PResult<T> = Result<T, SyntaxError>;

pub(crate) fn parse(source: &str, options: LexerOptions) -> PResult<Vec<Stmt>> {
    let mut parser = Parser::new(source, options)?;
    let body = parser.parse_body(&[])?;
    match parser.current.kind {
        TokenKind::Eof => Ok(body),
        ref other => Err(parser.unexpected(other.to_string(), "end of template")),
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    peeked: Option<Token>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, options: LexerOptions) -> PResult<Self> {
        let mut lexer = Lexer::new(source, options);
        let current = match lexer.next() {
            Some(token) => token?,
            None => Token {
                kind: TokenKind::Eof,
                line: 1,
            },
        };
        Ok(Self {
            lexer,
            current,
            peeked: None,
        })
    }

    /// Advances and returns the token that was current.
    fn bump(&mut self) -> PResult<Token> {
        let next = match self.peeked.take() {
            Some(token) => token,
            None => match self.lexer.next() {
                Some(token) => token?,
                None => Token {
                    kind: TokenKind::Eof,
                    line: self.current.line,
                },
            },
        };
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn peek_kind(&mut self) -> PResult<&TokenKind> {
        if self.peeked.is_none() {
            self.peeked = Some(match self.lexer.next() {
                Some(token) => token?,
                None => Token {
                    kind: TokenKind::Eof,
                    line: self.current.line,
                },
            });
        }
        Ok(self.peeked.as_ref().map_or(&TokenKind::Eof, |t| &t.kind))
    }

    fn at(&self, kind: &TokenKind) -> bool {
        discriminant(&self.current.kind) == discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> PResult<bool> {
        if self.at(kind) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> PResult<()> {
        if self.at(kind) {
            self.bump()?;
            Ok(())
        } else {
            Err(self.unexpected(self.current.kind.to_string(), kind.to_string()))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        if let TokenKind::Name(name) = &self.current.kind {
            let name = name.clone();
            self.bump()?;
            Ok(name)
        } else {
            Err(self.unexpected(self.current.kind.to_string(), "identifier"))
        }
    }

    fn expect_string(&mut self) -> PResult<String> {
        if let TokenKind::Str(s) = &self.current.kind {
            let s = s.clone();
            self.bump()?;
            Ok(s)
        } else {
            Err(self.unexpected(self.current.kind.to_string(), "string literal"))
        }
    }

    fn unexpected(&self, found: impl Into<String>, expected: impl Into<String>) -> SyntaxError {
        SyntaxError::new(
            self.current.line,
            SyntaxErrorKind::UnexpectedToken {
                expected: expected.into(),
                found: found.into(),
            },
        )
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Parses statements until one of `terminators` opens a tag. On
    /// return the terminating keyword is the current token; the caller
    /// consumes it and its `%}`.
    fn parse_body(&mut self, terminators: &[TokenKind]) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            match &self.current.kind {
                TokenKind::Eof => {
                    if terminators.is_empty() {
                        return Ok(body);
                    }
                    let expected = terminators
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" or ");
                    return Err(SyntaxError::new(
                        self.current.line,
                        SyntaxErrorKind::unexpected_eof(Some(&expected)),
                    ));
                }
                TokenKind::Text(_) => {
                    if let TokenKind::Text(text) = self.bump()?.kind {
                        body.push(Stmt::Text(text));
                    }
                }
                TokenKind::VarBegin => {
                    let line = self.current.line;
                    self.bump()?;
                    let expr = self.parse_expr()?;
                    self.expect(&TokenKind::VarEnd)?;
                    body.push(Stmt::Output { expr, line });
                }
                TokenKind::TagBegin => {
                    self.bump()?;
                    if terminators
                        .iter()
                        .any(|t| discriminant(t) == discriminant(&self.current.kind))
                    {
                        return Ok(body);
                    }
                    body.push(self.parse_tag()?);
                }
                other => {
                    return Err(self.unexpected(other.to_string(), "template content"));
                }
            }
        }
    }

    fn parse_tag(&mut self) -> PResult<Stmt> {
        match self.current.kind {
            TokenKind::If => self.parse_if(false, &TokenKind::Endif),
            TokenKind::Unless => self.parse_if(true, &TokenKind::Endunless),
            TokenKind::For => self.parse_for(),
            TokenKind::Set => self.parse_set(&TokenKind::Endset),
            TokenKind::Assign => self.parse_set(&TokenKind::Endassign),
            TokenKind::Capture => self.parse_set(&TokenKind::Endcapture),
            TokenKind::Macro => self.parse_macro(),
            TokenKind::Call => self.parse_call_block(),
            TokenKind::Filter => self.parse_filter_block(),
            TokenKind::Block => self.parse_block(),
            TokenKind::Extends => {
                let line = self.current.line;
                self.bump()?;
                let name = self.expect_string()?;
                self.expect(&TokenKind::TagEnd)?;
                Ok(Stmt::Extends { name, line })
            }
            TokenKind::Include => {
                let line = self.current.line;
                self.bump()?;
                let name = self.parse_expr()?;
                self.expect(&TokenKind::TagEnd)?;
                Ok(Stmt::Include { name, line })
            }
            TokenKind::From => self.parse_import(),
            TokenKind::Name(ref name) => Err(SyntaxError::new(
                self.current.line,
                SyntaxErrorKind::UnknownTag { name: name.clone() },
            )),
            ref other => Err(SyntaxError::new(
                self.current.line,
                SyntaxErrorKind::UnexpectedTag {
                    name: other.to_string().trim_matches('\'').to_string(),
                },
            )),
        }
    }

    fn parse_if(&mut self, negate: bool, end: &TokenKind) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let mut cond = self.parse_expr()?;
        if negate {
            cond = Expr::UnaryOp {
                op: UnaryOp::Not,
                expr: Box::new(cond),
                line,
            };
        }
        self.expect(&TokenKind::TagEnd)?;
        let terminators = [TokenKind::Elsif, TokenKind::Else, end.clone()];
        let mut arms = vec![(cond, self.parse_body(&terminators)?)];
        let mut otherwise = None;
        loop {
            match self.current.kind {
                TokenKind::Elsif => {
                    self.bump()?;
                    let cond = self.parse_expr()?;
                    self.expect(&TokenKind::TagEnd)?;
                    let body = self.parse_body(&terminators)?;
                    arms.push((cond, body));
                }
                TokenKind::Else => {
                    self.bump()?;
                    self.expect(&TokenKind::TagEnd)?;
                    otherwise = Some(self.parse_body(std::slice::from_ref(end))?);
                    self.bump()?;
                    self.expect(&TokenKind::TagEnd)?;
                    break;
                }
                _ => {
                    // The end keyword.
                    self.bump()?;
                    self.expect(&TokenKind::TagEnd)?;
                    break;
                }
            }
        }
        Ok(Stmt::If {
            arms,
            otherwise,
            line,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let mut targets = vec![self.reserved_checked_name()?];
        while self.eat(&TokenKind::Comma)? {
            targets.push(self.reserved_checked_name()?);
        }
        self.expect(&TokenKind::In)?;
        // No conditional expression here, `if` introduces the loop filter.
        let iter = self.parse_or()?;
        let filter = if self.eat(&TokenKind::If)? {
            Some(self.parse_or()?)
        } else {
            None
        };
        let recursive = if matches!(&self.current.kind, TokenKind::Name(n) if n == "recursive") {
            self.bump()?;
            true
        } else {
            false
        };
        self.expect(&TokenKind::TagEnd)?;
        let body = self.parse_body(&[TokenKind::Else, TokenKind::Endfor])?;
        let otherwise = if self.at(&TokenKind::Else) {
            self.bump()?;
            self.expect(&TokenKind::TagEnd)?;
            let otherwise = self.parse_body(&[TokenKind::Endfor])?;
            self.bump()?;
            Some(otherwise)
        } else {
            self.bump()?;
            None
        };
        self.expect(&TokenKind::TagEnd)?;
        Ok(Stmt::For(ForStmt {
            targets,
            iter,
            filter,
            recursive,
            body,
            otherwise,
            line,
        }))
    }

    fn reserved_checked_name(&mut self) -> PResult<String> {
        let line = self.current.line;
        let name = self.expect_name()?;
        if name == "forloop" {
            return Err(SyntaxError::new(
                line,
                SyntaxErrorKind::ReservedName { name },
            ));
        }
        Ok(name)
    }

    fn parse_set(&mut self, end: &TokenKind) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let target = self.reserved_checked_name()?;
        let source = if self.eat(&TokenKind::Equal)? {
            let value = self.parse_expr()?;
            self.expect(&TokenKind::TagEnd)?;
            SetSource::Expr(value)
        } else {
            self.expect(&TokenKind::TagEnd)?;
            let body = self.parse_body(std::slice::from_ref(end))?;
            self.bump()?;
            self.expect(&TokenKind::TagEnd)?;
            SetSource::Block(body)
        };
        Ok(Stmt::Set(SetStmt {
            target,
            source,
            line,
        }))
    }

    fn parse_macro(&mut self) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let name = self.expect_name()?;
        self.expect(&TokenKind::LParen)?;
        let params = self.parse_params()?;
        self.expect(&TokenKind::TagEnd)?;
        let body = self.parse_body(&[TokenKind::Endmacro])?;
        self.bump()?;
        self.expect(&TokenKind::TagEnd)?;
        Ok(Stmt::Macro(MacroStmt {
            name,
            params,
            body,
            line,
        }))
    }

    /// Parameter list up to and including the closing parenthesis.
    fn parse_params(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        if self.eat(&TokenKind::RParen)? {
            return Ok(params);
        }
        loop {
            let name = self.expect_name()?;
            let default = if self.eat(&TokenKind::Equal)? {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param { name, default });
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(params)
    }

    fn parse_call_block(&mut self) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let params = if self.eat(&TokenKind::LParen)? {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let target = self.parse_expr()?;
        let Expr::Call { callee, args, .. } = target else {
            return Err(SyntaxError::new(
                line,
                SyntaxErrorKind::Message {
                    message: "'call' needs a macro invocation".to_string(),
                },
            ));
        };
        self.expect(&TokenKind::TagEnd)?;
        let body = self.parse_body(&[TokenKind::Endcall])?;
        self.bump()?;
        self.expect(&TokenKind::TagEnd)?;
        Ok(Stmt::CallBlock {
            params,
            callee: *callee,
            args,
            body,
            line,
        })
    }

    fn parse_filter_block(&mut self) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let mut filters = vec![self.parse_filter_call()?];
        while self.eat(&TokenKind::Pipe)? {
            filters.push(self.parse_filter_call()?);
        }
        self.expect(&TokenKind::TagEnd)?;
        let body = self.parse_body(&[TokenKind::Endfilter])?;
        self.bump()?;
        self.expect(&TokenKind::TagEnd)?;
        Ok(Stmt::FilterBlock {
            filters,
            body,
            line,
        })
    }

    fn parse_block(&mut self) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let name = self.expect_name()?;
        self.expect(&TokenKind::TagEnd)?;
        let body = self.parse_body(&[TokenKind::Endblock])?;
        self.bump()?;
        // Optional `{% endblock name %}`, which must match.
        if let TokenKind::Name(trailing) = &self.current.kind {
            if trailing != &name {
                return Err(SyntaxError::new(
                    self.current.line,
                    SyntaxErrorKind::Message {
                        message: format!(
                            "mismatched endblock: expected '{name}', found '{trailing}'"
                        ),
                    },
                ));
            }
            self.bump()?;
        }
        self.expect(&TokenKind::TagEnd)?;
        Ok(Stmt::Block { name, body, line })
    }

    fn parse_import(&mut self) -> PResult<Stmt> {
        let line = self.current.line;
        self.bump()?;
        let template = self.expect_string()?;
        self.expect(&TokenKind::Import)?;
        let mut names = Vec::new();
        loop {
            let source = self.expect_name()?;
            let alias = if matches!(&self.current.kind, TokenKind::Name(n) if n == "as") {
                self.bump()?;
                self.expect_name()?
            } else {
                source.clone()
            };
            names.push((source, alias));
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(&TokenKind::TagEnd)?;
        Ok(Stmt::Import {
            template,
            names,
            line,
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<Expr> {
        let then = self.parse_or()?;
        if !self.at(&TokenKind::If) {
            return Ok(then);
        }
        let line = self.current.line;
        self.bump()?;
        let test = self.parse_or()?;
        let otherwise = if self.eat(&TokenKind::Else)? {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Expr::Cond {
            then: Box::new(then),
            test: Box::new(test),
            otherwise,
            line,
        })
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.at(&TokenKind::Or) {
            let line = self.current.line;
            self.bump()?;
            let rhs = self.parse_and()?;
            lhs = Expr::BinOp {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_not()?;
        while self.at(&TokenKind::And) {
            let line = self.current.line;
            self.bump()?;
            let rhs = self.parse_not()?;
            lhs = Expr::BinOp {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if self.at(&TokenKind::Not) && !matches!(self.peek_kind()?, TokenKind::In) {
            let line = self.current.line;
            self.bump()?;
            let expr = self.parse_not()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOp::Not,
                expr: Box::new(expr),
                line,
            });
        }
        self.parse_comparison()
    }

    /// Comparisons chain: `a < b < c` becomes `a < b and b < c`.
    fn parse_comparison(&mut self) -> PResult<Expr> {
        let mut prev = self.parse_tested()?;
        let mut chained: Option<Expr> = None;
        loop {
            let line = self.current.line;
            let not_in = matches!(self.current.kind, TokenKind::Not)
                && matches!(self.peek_kind()?, TokenKind::In);
            let op = match self.current.kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::NotEq => BinOp::Ne,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::LtEq => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::GtEq => BinOp::Ge,
                TokenKind::In => BinOp::In,
                TokenKind::Not if not_in => {
                    self.bump()?;
                    BinOp::NotIn
                }
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_tested()?;
            let link = Expr::BinOp {
                op,
                lhs: Box::new(prev.clone()),
                rhs: Box::new(rhs.clone()),
                line,
            };
            chained = Some(match chained {
                None => link,
                Some(acc) => Expr::BinOp {
                    op: BinOp::And,
                    lhs: Box::new(acc),
                    rhs: Box::new(link),
                    line,
                },
            });
            prev = rhs;
        }
        Ok(chained.unwrap_or(prev))
    }

    /// `is [not] NAME[: args | (args)]`, binding tighter than comparison.
    fn parse_tested(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_filtered()?;
        while self.at(&TokenKind::Is) {
            let line = self.current.line;
            self.bump()?;
            let negated = self.eat(&TokenKind::Not)?;
            let name = match &self.current.kind {
                TokenKind::Name(n) => {
                    let n = n.clone();
                    self.bump()?;
                    n
                }
                TokenKind::NoneLit => {
                    self.bump()?;
                    "none".to_string()
                }
                other => return Err(self.unexpected(other.to_string(), "test name")),
            };
            let args = self.parse_relaxed_args()?;
            expr = Expr::Test {
                base: Box::new(expr),
                name,
                args,
                negated,
                line,
            };
        }
        Ok(expr)
    }

    /// The shared tier for `+ - ~` and pipe filters. Left-associative, so
    /// a filter grabs everything accumulated to its left.
    fn parse_filtered(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let line = self.current.line;
            let op = match self.current.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                TokenKind::Tilde => BinOp::Concat,
                TokenKind::Pipe => {
                    self.bump()?;
                    let call = self.parse_filter_call()?;
                    lhs = Expr::Filter {
                        base: Box::new(lhs),
                        call,
                    };
                    continue;
                }
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_filter_call(&mut self) -> PResult<FilterCall> {
        let line = self.current.line;
        let name = self.expect_name()?;
        let args = self.parse_relaxed_args()?;
        Ok(FilterCall { name, args, line })
    }

    /// Filter/test arguments: `(a, b, k=v)` or the colon form `: a, b`.
    /// Colon arguments parse at the additive level so they never swallow
    /// a following `| filter`.
    fn parse_relaxed_args(&mut self) -> PResult<Vec<Arg>> {
        if self.at(&TokenKind::LParen) {
            self.bump()?;
            return self.parse_call_args();
        }
        let mut args = Vec::new();
        if !self.eat(&TokenKind::Colon)? {
            return Ok(args);
        }
        loop {
            args.push(self.parse_one_arg(Self::parse_additive)?);
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        Ok(args)
    }

    /// Arguments up to and including the closing parenthesis.
    fn parse_call_args(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen)? {
            return Ok(args);
        }
        loop {
            args.push(self.parse_one_arg(Self::parse_expr)?);
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_one_arg(&mut self, element: fn(&mut Self) -> PResult<Expr>) -> PResult<Arg> {
        if self.eat(&TokenKind::Star)? {
            return Ok(Arg::Splat(element(self)?));
        }
        if let TokenKind::Name(name) = &self.current.kind {
            let name = name.clone();
            if matches!(self.peek_kind()?, TokenKind::Equal) {
                self.bump()?;
                self.bump()?;
                return Ok(Arg::Kw(name, element(self)?));
            }
        }
        Ok(Arg::Pos(element(self)?))
    }

    /// Plain `+ - ~` with no pipe handling; used for relaxed arguments.
    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let line = self.current.line;
            let op = match self.current.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                TokenKind::Tilde => BinOp::Concat,
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let line = self.current.line;
            let op = match self.current.kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::SlashSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Rem,
                _ => break,
            };
            self.bump()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        match self.current.kind {
            TokenKind::Minus => {
                let line = self.current.line;
                self.bump()?;
                let expr = self.parse_unary()?;
                Ok(Expr::UnaryOp {
                    op: UnaryOp::Neg,
                    expr: Box::new(expr),
                    line,
                })
            }
            TokenKind::Plus => {
                self.bump()?;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_postfix()?;
        if self.at(&TokenKind::StarStar) {
            let line = self.current.line;
            self.bump()?;
            // Right-associative; the exponent may be unary (`2 ** -1`).
            let exponent = self.parse_unary()?;
            return Ok(Expr::BinOp {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
                line,
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.current.line;
            match self.current.kind {
                TokenKind::Dot => {
                    self.bump()?;
                    let name = self.expect_name()?;
                    expr = Expr::Getattr {
                        base: Box::new(expr),
                        name,
                        line,
                    };
                }
                TokenKind::LBracket => {
                    self.bump()?;
                    let index = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket)?;
                    expr = Expr::Getitem {
                        base: Box::new(expr),
                        index: Box::new(index),
                        line,
                    };
                }
                TokenKind::LParen => {
                    self.bump()?;
                    let args = self.parse_call_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        line,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let line = self.current.line;
        match &self.current.kind {
            TokenKind::Int(i) => {
                let v = crate::value::Value::Int(*i);
                self.bump()?;
                Ok(Expr::Const(v))
            }
            TokenKind::Float(f) => {
                let v = crate::value::Value::Float(*f);
                self.bump()?;
                Ok(Expr::Const(v))
            }
            TokenKind::Str(s) => {
                let v = crate::value::Value::from(s.as_str());
                self.bump()?;
                Ok(Expr::Const(v))
            }
            TokenKind::True => {
                self.bump()?;
                Ok(Expr::Const(crate::value::Value::Bool(true)))
            }
            TokenKind::False => {
                self.bump()?;
                Ok(Expr::Const(crate::value::Value::Bool(false)))
            }
            TokenKind::NoneLit => {
                self.bump()?;
                Ok(Expr::Const(crate::value::Value::Null))
            }
            TokenKind::Name(name) => {
                let name = name.clone();
                self.bump()?;
                Ok(Expr::Name { name, line })
            }
            TokenKind::LParen => {
                self.bump()?;
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.bump()?;
                let mut items = Vec::new();
                if !self.at(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma)? {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBracket)?;
                Ok(Expr::List { items, line })
            }
            TokenKind::LBrace => {
                self.bump()?;
                let mut entries = Vec::new();
                if !self.at(&TokenKind::RBrace) {
                    loop {
                        let key = self.parse_expr()?;
                        self.expect(&TokenKind::Colon)?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                        if !self.eat(&TokenKind::Comma)? {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBrace)?;
                Ok(Expr::MapLit { entries, line })
            }
            other => Err(self.unexpected(other.to_string(), "an expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn parse_ok(source: &str) -> Vec<Stmt> {
        parse(source, LexerOptions::default()).unwrap()
    }

    fn parse_err(source: &str) -> SyntaxError {
        parse(source, LexerOptions::default()).unwrap_err()
    }

    fn only_expr(source: &str) -> Expr {
        let body = parse_ok(source);
        match body.into_iter().next() {
            Some(Stmt::Output { expr, .. }) => expr,
            other => panic!("expected output statement, got {other:?}"),
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn output_and_text() {
        let body = parse_ok("a{{ x }}b");
        assert_eq!(body.len(), 3);
        assert!(matches!(&body[0], Stmt::Text(t) if t == "a"));
        assert!(matches!(&body[2], Stmt::Text(t) if t == "b"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn filter_applies_to_the_whole_sum() {
        // Precedence table, looser side: `a + b | f` is `f(a + b)`.
        let expr = only_expr("{{ a + b | f }}");
        let Expr::Filter { base, call } = expr else {
            panic!("expected filter at the top");
        };
        assert_eq!(call.name, "f");
        assert!(matches!(*base, Expr::BinOp { op: BinOp::Add, .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn addition_continues_after_a_filter() {
        // Precedence table, tighter side: `a | f + 1` is `(a | f) + 1`.
        let expr = only_expr("{{ a | f + 1 }}");
        let Expr::BinOp {
            op: BinOp::Add,
            lhs,
            ..
        } = expr
        else {
            panic!("expected addition at the top");
        };
        assert!(matches!(*lhs, Expr::Filter { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn multiplication_binds_tighter_than_filters() {
        let expr = only_expr("{{ a * b | f }}");
        let Expr::Filter { base, .. } = expr else {
            panic!("expected filter at the top");
        };
        assert!(matches!(*base, Expr::BinOp { op: BinOp::Mul, .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn comparison_sees_filtered_operands() {
        let expr = only_expr("{{ a | length == 3 }}");
        let Expr::BinOp {
            op: BinOp::Eq, lhs, ..
        } = expr
        else {
            panic!("expected comparison at the top");
        };
        assert!(matches!(*lhs, Expr::Filter { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn chained_comparison_desugars_to_and() {
        let expr = only_expr("{{ a < b < c }}");
        let Expr::BinOp {
            op: BinOp::And,
            lhs,
            rhs,
            ..
        } = expr
        else {
            panic!("expected and at the top");
        };
        assert!(matches!(*lhs, Expr::BinOp { op: BinOp::Lt, .. }));
        assert!(matches!(*rhs, Expr::BinOp { op: BinOp::Lt, .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn ternary_and_not_in() {
        let expr = only_expr("{{ a if b else c }}");
        assert!(matches!(
            expr,
            Expr::Cond {
                otherwise: Some(_),
                ..
            }
        ));
        let expr = only_expr("{{ a not in b }}");
        assert!(matches!(expr, Expr::BinOp { op: BinOp::NotIn, .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn tests_with_colon_arguments() {
        let expr = only_expr("{{ x is divisibleby: 3 }}");
        let Expr::Test {
            name,
            args,
            negated,
            ..
        } = expr
        else {
            panic!("expected test");
        };
        assert_eq!(name, "divisibleby");
        assert_eq!(args.len(), 1);
        assert!(!negated);

        let expr = only_expr("{{ x is not none }}");
        assert!(matches!(expr, Expr::Test { negated: true, .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn colon_arguments_stop_before_the_next_pipe() {
        let expr = only_expr("{{ xs | join: ', ' | upper }}");
        let Expr::Filter { base, call } = expr else {
            panic!("expected filter");
        };
        assert_eq!(call.name, "upper");
        assert!(matches!(*base, Expr::Filter { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn splat_and_keyword_arguments() {
        let expr = only_expr("{{ f(1, *rest, k=2) }}");
        let Expr::Call { args, .. } = expr else {
            panic!("expected call");
        };
        assert!(matches!(args[0], Arg::Pos(_)));
        assert!(matches!(args[1], Arg::Splat(_)));
        assert!(matches!(&args[2], Arg::Kw(name, _) if name == "k"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn for_with_filter_and_recursive() {
        let body = parse_ok("{% for a, b in items if a recursive %}x{% else %}y{% endfor %}");
        let Stmt::For(stmt) = &body[0] else {
            panic!("expected for");
        };
        assert_eq!(stmt.targets, vec!["a".to_string(), "b".to_string()]);
        assert!(stmt.filter.is_some());
        assert!(stmt.recursive);
        assert!(stmt.otherwise.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn unless_negates_its_condition() {
        let body = parse_ok("{% unless x %}a{% elsif y %}b{% else %}c{% endunless %}");
        let Stmt::If {
            arms, otherwise, ..
        } = &body[0]
        else {
            panic!("expected if");
        };
        assert_eq!(arms.len(), 2);
        assert!(matches!(
            arms[0].0,
            Expr::UnaryOp {
                op: UnaryOp::Not,
                ..
            }
        ));
        assert!(matches!(arms[1].0, Expr::Name { .. }));
        assert!(otherwise.is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn set_forms_share_a_shape() {
        for source in [
            "{% set x = 1 %}",
            "{% assign x = 1 %}",
            "{% capture x %}text{% endcapture %}",
            "{% set x %}text{% endset %}",
        ] {
            let body = parse_ok(source);
            assert!(
                matches!(&body[0], Stmt::Set(s) if s.target == "x"),
                "{source}"
            );
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn mismatched_set_block_terminator_is_rejected() {
        let err = parse_err("{% capture x %}text{% endset %}");
        assert!(matches!(err.kind, SyntaxErrorKind::UnexpectedTag { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn assigning_to_forloop_is_a_syntax_error() {
        for source in [
            "{% for forloop in items %}{% endfor %}",
            "{% set forloop = 1 %}",
            "{% capture forloop %}x{% endcapture %}",
        ] {
            let err = parse_err(source);
            assert!(
                matches!(err.kind, SyntaxErrorKind::ReservedName { ref name } if name == "forloop"),
                "{source}"
            );
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn reading_forloop_is_fine() {
        parse_ok("{% for i in items %}{% set row = forloop %}{{ row.index }}{% endfor %}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn macro_and_call_blocks() {
        let body = parse_ok("{% macro m(a, b='x') %}{{ a }}{% endmacro %}");
        let Stmt::Macro(m) = &body[0] else {
            panic!("expected macro");
        };
        assert_eq!(m.name, "m");
        assert_eq!(m.params.len(), 2);
        assert!(m.params[0].default.is_none());
        assert!(m.params[1].default.is_some());

        let body = parse_ok("{% call(item) list(items) %}<{{ item }}>{% endcall %}");
        let Stmt::CallBlock { params, callee, .. } = &body[0] else {
            panic!("expected call block");
        };
        assert_eq!(params.len(), 1);
        assert!(matches!(callee, Expr::Name { name, .. } if name == "list"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn import_with_aliases() {
        let body = parse_ok("{% from \"helpers\" import input, label as lbl %}");
        let Stmt::Import {
            template, names, ..
        } = &body[0]
        else {
            panic!("expected import");
        };
        assert_eq!(template, "helpers");
        assert_eq!(
            names,
            &vec![
                ("input".to_string(), "input".to_string()),
                ("label".to_string(), "lbl".to_string()),
            ]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn literals() {
        assert_eq!(only_expr("{{ none }}"), Expr::Const(Value::Null));
        assert_eq!(only_expr("{{ True }}"), Expr::Const(Value::Bool(true)));
        let Expr::MapLit { entries, .. } = only_expr("{{ {'a': 1, 'b': [2]} }}") else {
            panic!("expected map literal");
        };
        assert_eq!(entries.len(), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn errors_carry_line_numbers() {
        let err = parse_err("line\n\n{% if %}x{% endif %}");
        assert_eq!(err.line, 3);

        let err = parse_err("{% for x in items %}\n{{ x }}\n");
        assert!(matches!(err.kind, SyntaxErrorKind::UnexpectedEof { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn unknown_tag() {
        let err = parse_err("{% loop x %}");
        assert!(matches!(err.kind, SyntaxErrorKind::UnknownTag { ref name } if name == "loop"));
    }
}
