use pyjvm_bytecode::{Operator, UnaryOperator};

use crate::ast::*;
use crate::error::CompileError;
use crate::lexer::{StrKind, Token, TokenKind};

/// Parse one module. Syntax errors are collected rather than returned
/// early: a malformed statement is skipped up to the next statement
/// boundary and parsing resumes, so the returned module holds every
/// statement that did parse.
pub fn parse(module: &str, tokens: Vec<Token>) -> (Module, Vec<CompileError>) {
    let mut parser = Parser::new(tokens);
    let scope = parser.fresh_id();
    let mut body = Vec::new();
    while !parser.at(&TokenKind::EndOfFile) {
        if parser.at(&TokenKind::Newline) {
            parser.pos += 1;
            continue;
        }
        parser.statement_into(&mut body);
    }
    (Module { name: module.to_string(), body, scope }, parser.errors)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_id: u32,
    errors: Vec<CompileError>,
}

fn binary_operator(kind: &TokenKind) -> Option<(Operator, u8)> {
    Some(match kind {
        TokenKind::Pipe => (Operator::BitOr, 1),
        TokenKind::Caret => (Operator::BitXor, 2),
        TokenKind::Amp => (Operator::BitAnd, 3),
        TokenKind::LShift => (Operator::LShift, 4),
        TokenKind::RShift => (Operator::RShift, 4),
        TokenKind::Plus => (Operator::Add, 5),
        TokenKind::Minus => (Operator::Sub, 5),
        TokenKind::Star => (Operator::Mul, 6),
        TokenKind::Slash => (Operator::Div, 6),
        TokenKind::DoubleSlash => (Operator::FloorDiv, 6),
        TokenKind::Percent => (Operator::Mod, 6),
        TokenKind::At => (Operator::MatMul, 6),
        _ => return None,
    })
}

fn augmented_operator(kind: &TokenKind) -> Option<Operator> {
    Some(match kind {
        TokenKind::PlusEq => Operator::Add,
        TokenKind::MinusEq => Operator::Sub,
        TokenKind::StarEq => Operator::Mul,
        TokenKind::SlashEq => Operator::Div,
        TokenKind::DoubleSlashEq => Operator::FloorDiv,
        TokenKind::PercentEq => Operator::Mod,
        TokenKind::DoubleStarEq => Operator::Pow,
        TokenKind::AtEq => Operator::MatMul,
        TokenKind::LShiftEq => Operator::LShift,
        TokenKind::RShiftEq => Operator::RShift,
        TokenKind::AmpEq => Operator::BitAnd,
        TokenKind::PipeEq => Operator::BitOr,
        TokenKind::CaretEq => Operator::BitXor,
        _ => return None,
    })
}

impl Parser {
    fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().map(|t| &t.kind) != Some(&TokenKind::EndOfFile) {
            let pos = tokens.last().map(|t| t.pos).unwrap_or(Pos { line: 1, col: 1 });
            tokens.push(Token { kind: TokenKind::EndOfFile, text: String::new(), pos });
        }
        Parser { tokens, pos: 0, next_id: 0, errors: Vec::new() }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn token(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn peek(&self) -> &TokenKind {
        &self.token().kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + offset).min(last)].kind
    }

    fn here(&self) -> Pos {
        self.token().pos
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.token().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::syntax(self.here(), msg)
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        self.error(format!("expected {expected}, found {}", self.peek().describe()))
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, CompileError> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_name(&mut self) -> Result<(String, Pos), CompileError> {
        let pos = self.here();
        match self.peek() {
            TokenKind::Name(name) => {
                let name = name.clone();
                self.advance();
                Ok((name, pos))
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn bind_name(&mut self) -> Result<BindName, CompileError> {
        let (name, pos) = self.expect_name()?;
        Ok(BindName { name, id: self.fresh_id(), pos })
    }

    // ---- statements ----

    fn statement_into(&mut self, out: &mut Vec<Stmt>) {
        if let Err(e) = self.parse_statement(out) {
            self.errors.push(e);
            self.synchronize();
        }
    }

    /// Skip to the next statement boundary at the current indentation
    /// level, swallowing any block nested under the broken statement.
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                TokenKind::EndOfFile => return,
                TokenKind::Indent => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::Dedent => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.advance();
                    if depth == 0 && !self.at(&TokenKind::Indent) {
                        return;
                    }
                }
                TokenKind::Newline => {
                    self.advance();
                    if depth == 0 && !self.at(&TokenKind::Indent) {
                        return;
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn parse_statement(&mut self, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
        let pos = self.here();
        let stmt = match self.peek() {
            TokenKind::Indent => return Err(self.error("unexpected indent")),
            TokenKind::Def => self.parse_funcdef(Vec::new(), false, pos)?,
            TokenKind::Class => self.parse_classdef(Vec::new(), pos)?,
            TokenKind::At => self.parse_decorated()?,
            TokenKind::If => {
                self.advance();
                self.parse_if(pos)?
            }
            TokenKind::While => self.parse_while()?,
            TokenKind::For => self.parse_for(false, pos)?,
            TokenKind::Try => self.parse_try()?,
            TokenKind::With => self.parse_with(false, pos)?,
            TokenKind::Async => {
                self.advance();
                match self.peek() {
                    TokenKind::Def => self.parse_funcdef(Vec::new(), true, pos)?,
                    TokenKind::For => self.parse_for(true, pos)?,
                    TokenKind::With => self.parse_with(true, pos)?,
                    _ => return Err(self.unexpected("'def', 'for' or 'with' after 'async'")),
                }
            }
            _ => return self.parse_simple_line(out),
        };
        out.push(stmt);
        Ok(())
    }

    /// `small_stmt (';' small_stmt)* [';'] NEWLINE`
    fn parse_simple_line(&mut self, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
        loop {
            let stmt = self.parse_small_statement()?;
            out.push(stmt);
            if !self.eat(&TokenKind::Semi) {
                break;
            }
            if self.at(&TokenKind::Newline) || self.at(&TokenKind::EndOfFile) {
                break;
            }
        }
        if self.at(&TokenKind::EndOfFile) {
            return Ok(());
        }
        self.expect(&TokenKind::Newline, "newline")?;
        Ok(())
    }

    fn parse_small_statement(&mut self) -> Result<Stmt, CompileError> {
        let pos = self.here();
        let kind = match self.peek() {
            TokenKind::Pass => {
                self.advance();
                StmtKind::Pass
            }
            TokenKind::Break => {
                self.advance();
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                StmtKind::Continue
            }
            TokenKind::Return => {
                self.advance();
                if self.at_line_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_testlist_star()?))
                }
            }
            TokenKind::Raise => {
                self.advance();
                if self.at_line_end() {
                    StmtKind::Raise { exc: None, cause: None }
                } else {
                    let exc = self.parse_test()?;
                    let cause = if self.eat(&TokenKind::From) { Some(self.parse_test()?) } else { None };
                    StmtKind::Raise { exc: Some(exc), cause }
                }
            }
            TokenKind::Global | TokenKind::Nonlocal => {
                let global = self.at(&TokenKind::Global);
                self.advance();
                let mut names = vec![self.expect_name()?.0];
                while self.eat(&TokenKind::Comma) {
                    names.push(self.expect_name()?.0);
                }
                if global {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            TokenKind::Del => {
                self.advance();
                let mut targets = Vec::new();
                loop {
                    let target = self.parse_bitor()?;
                    self.check_target(&target, "delete")?;
                    targets.push(target);
                    if !self.eat(&TokenKind::Comma) || self.at_line_end() {
                        break;
                    }
                }
                StmtKind::Delete(targets)
            }
            TokenKind::Assert => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat(&TokenKind::Comma) { Some(self.parse_test()?) } else { None };
                StmtKind::Assert { test, msg }
            }
            TokenKind::Import => {
                self.advance();
                self.parse_import()?
            }
            TokenKind::From => {
                self.advance();
                self.parse_import_from()?
            }
            _ => self.parse_expression_statement()?,
        };
        Ok(Stmt { kind, pos })
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek(), TokenKind::Newline | TokenKind::Semi | TokenKind::EndOfFile)
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, CompileError> {
        let first = self.parse_testlist_star_or_yield()?;
        if let Some(op) = augmented_operator(self.peek()) {
            if !matches!(
                first.kind,
                ExprKind::Name { .. } | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
            ) {
                return Err(CompileError::syntax(first.pos, "illegal expression for augmented assignment"));
            }
            self.advance();
            let value = self.parse_testlist_star_or_yield()?;
            return Ok(StmtKind::AugAssign { target: first, op, value });
        }
        if self.at(&TokenKind::Colon) {
            self.advance();
            if !matches!(
                first.kind,
                ExprKind::Name { .. } | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
            ) {
                return Err(CompileError::syntax(first.pos, "illegal target for annotation"));
            }
            let annotation = self.parse_test()?;
            let value = if self.eat(&TokenKind::Assign) { Some(self.parse_testlist_star_or_yield()?) } else { None };
            return Ok(StmtKind::AnnAssign { target: first, annotation, value });
        }
        if !self.at(&TokenKind::Assign) {
            return Ok(StmtKind::Expr(first));
        }
        let mut targets = vec![first];
        while self.eat(&TokenKind::Assign) {
            targets.push(self.parse_testlist_star_or_yield()?);
        }
        let value = targets.pop().ok_or_else(|| self.error("missing assignment value"))?;
        for target in &targets {
            self.check_target(target, "assign to")?;
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn check_target(&self, target: &Expr, verb: &str) -> Result<(), CompileError> {
        if target.is_target() {
            return Ok(());
        }
        let what = match &target.kind {
            ExprKind::Constant(_) => "literal",
            ExprKind::Call { .. } => "function call",
            ExprKind::Lambda(_) => "lambda",
            ExprKind::BinOp { .. } | ExprKind::UnaryOp { .. } | ExprKind::BoolOp { .. } => "expression",
            ExprKind::Compare { .. } => "comparison",
            _ => "expression",
        };
        Err(CompileError::syntax(target.pos, format!("cannot {verb} {what}")))
    }

    fn parse_dotted_name(&mut self) -> Result<String, CompileError> {
        let mut name = self.expect_name()?.0;
        while self.eat(&TokenKind::Dot) {
            name.push('.');
            name.push_str(&self.expect_name()?.0);
        }
        Ok(name)
    }

    fn parse_import(&mut self) -> Result<StmtKind, CompileError> {
        let mut aliases = Vec::new();
        loop {
            let pos = self.here();
            let name = self.parse_dotted_name()?;
            let asname = if self.eat(&TokenKind::As) { Some(self.expect_name()?.0) } else { None };
            let bound = asname
                .clone()
                .unwrap_or_else(|| name.split('.').next().unwrap_or(&name).to_string());
            let bind = BindName { name: bound, id: self.fresh_id(), pos };
            aliases.push(Alias { name, asname, bind });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(StmtKind::Import(aliases))
    }

    fn parse_import_from(&mut self) -> Result<StmtKind, CompileError> {
        let mut level = 0;
        loop {
            if self.eat(&TokenKind::Dot) {
                level += 1;
            } else if self.eat(&TokenKind::Ellipsis) {
                level += 3;
            } else {
                break;
            }
        }
        let module = if level > 0 && self.at(&TokenKind::Import) { String::new() } else { self.parse_dotted_name()? };
        self.expect(&TokenKind::Import, "'import'")?;
        if self.eat(&TokenKind::Star) {
            return Ok(StmtKind::ImportFrom { module, names: Vec::new(), level, star: true });
        }
        let parenthesized = self.eat(&TokenKind::LParen);
        let mut names = Vec::new();
        loop {
            let pos = self.here();
            let name = self.expect_name()?.0;
            let asname = if self.eat(&TokenKind::As) { Some(self.expect_name()?.0) } else { None };
            let bind = BindName { name: asname.clone().unwrap_or_else(|| name.clone()), id: self.fresh_id(), pos };
            names.push(Alias { name, asname, bind });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            if parenthesized && self.at(&TokenKind::RParen) {
                break;
            }
        }
        if parenthesized {
            self.expect(&TokenKind::RParen, "')'")?;
        }
        Ok(StmtKind::ImportFrom { module, names, level, star: false })
    }

    /// The statements after a compound-statement header's ':'.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect(&TokenKind::Colon, "':'")?;
        let mut body = Vec::new();
        if !self.at(&TokenKind::Newline) {
            self.parse_simple_line(&mut body)?;
            return Ok(body);
        }
        self.advance();
        if !self.at(&TokenKind::Indent) {
            let missing = self.error("expected an indented block");
            self.errors.push(missing);
            return Ok(body);
        }
        self.advance();
        loop {
            match self.peek() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndOfFile => break,
                TokenKind::Newline => {
                    self.advance();
                }
                _ => self.statement_into(&mut body),
            }
        }
        Ok(body)
    }

    fn parse_decorated(&mut self) -> Result<Stmt, CompileError> {
        let mut decorators = Vec::new();
        while self.eat(&TokenKind::At) {
            decorators.push(self.parse_named_test()?);
            self.expect(&TokenKind::Newline, "newline after decorator")?;
        }
        let pos = self.here();
        match self.peek() {
            TokenKind::Def => self.parse_funcdef(decorators, false, pos),
            TokenKind::Class => self.parse_classdef(decorators, pos),
            TokenKind::Async => {
                self.advance();
                self.parse_funcdef(decorators, true, pos)
            }
            _ => Err(self.unexpected("'def' or 'class' after decorator")),
        }
    }

    fn parse_funcdef(&mut self, decorators: Vec<Expr>, is_async: bool, pos: Pos) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::Def, "'def'")?;
        let name = self.bind_name()?;
        self.expect(&TokenKind::LParen, "'('")?;
        let params = self.parse_params(&TokenKind::RParen, true)?;
        self.expect(&TokenKind::RParen, "')'")?;
        let returns = if self.eat(&TokenKind::Arrow) { Some(self.parse_test()?) } else { None };
        let scope = self.fresh_id();
        let body = self.parse_block()?;
        let def = FunctionDef { name, params, body, decorators, returns, is_async, scope };
        Ok(Stmt { kind: StmtKind::FunctionDef(Box::new(def)), pos })
    }

    fn parse_params(&mut self, close: &TokenKind, annotated: bool) -> Result<Vec<Param>, CompileError> {
        let mut params: Vec<Param> = Vec::new();
        let mut seen_default = false;
        while !self.at(close) {
            let pos = self.here();
            let kind = if self.eat(&TokenKind::DoubleStar) {
                ParamKind::KwArgs
            } else if self.eat(&TokenKind::Star) {
                ParamKind::VarArgs
            } else {
                ParamKind::Normal
            };
            if kind == ParamKind::Normal && self.eat(&TokenKind::Slash) {
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                continue;
            }
            let name = if kind == ParamKind::VarArgs && (self.at(&TokenKind::Comma) || self.at(close)) {
                String::new()
            } else {
                self.expect_name()?.0
            };
            if !name.is_empty() && params.iter().any(|p| p.name == name) {
                return Err(CompileError::syntax(pos, format!("duplicate argument '{name}' in function definition")));
            }
            let annotation = if annotated && !name.is_empty() && self.eat(&TokenKind::Colon) {
                Some(self.parse_test()?)
            } else {
                None
            };
            let default = if kind == ParamKind::Normal && self.eat(&TokenKind::Assign) {
                seen_default = true;
                Some(self.parse_test()?)
            } else {
                if kind == ParamKind::Normal && seen_default && params.iter().all(|p| p.kind == ParamKind::Normal) {
                    return Err(CompileError::syntax(pos, "non-default argument follows default argument"));
                }
                None
            };
            params.push(Param { name, kind, default, annotation, pos });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_classdef(&mut self, decorators: Vec<Expr>, pos: Pos) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::Class, "'class'")?;
        let name = self.bind_name()?;
        let (bases, keywords) = if self.eat(&TokenKind::LParen) {
            let args = self.parse_call_args()?;
            self.expect(&TokenKind::RParen, "')'")?;
            args
        } else {
            (Vec::new(), Vec::new())
        };
        let scope = self.fresh_id();
        let body = self.parse_block()?;
        let def = ClassDef { name, bases, keywords, body, decorators, scope };
        Ok(Stmt { kind: StmtKind::ClassDef(Box::new(def)), pos })
    }

    /// After `if`/`elif` has been consumed.
    fn parse_if(&mut self, pos: Pos) -> Result<Stmt, CompileError> {
        let test = self.parse_named_test()?;
        let body = self.parse_block()?;
        let orelse = match self.peek() {
            TokenKind::Elif => {
                let elif_pos = self.here();
                self.advance();
                vec![self.parse_if(elif_pos)?]
            }
            TokenKind::Else => {
                self.advance();
                self.parse_block()?
            }
            _ => Vec::new(),
        };
        Ok(Stmt { kind: StmtKind::If { test, body, orelse }, pos })
    }

    fn parse_while(&mut self) -> Result<Stmt, CompileError> {
        let pos = self.here();
        self.expect(&TokenKind::While, "'while'")?;
        let test = self.parse_named_test()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&TokenKind::Else) { self.parse_block()? } else { Vec::new() };
        Ok(Stmt { kind: StmtKind::While { test, body, orelse }, pos })
    }

    fn parse_for(&mut self, is_async: bool, pos: Pos) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::For, "'for'")?;
        let target = self.parse_target_list()?;
        self.expect(&TokenKind::In, "'in'")?;
        let iter = self.parse_testlist_star()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&TokenKind::Else) { self.parse_block()? } else { Vec::new() };
        Ok(Stmt { kind: StmtKind::For { target, iter, body, orelse, is_async }, pos })
    }

    fn parse_try(&mut self) -> Result<Stmt, CompileError> {
        let pos = self.here();
        self.expect(&TokenKind::Try, "'try'")?;
        let body = self.parse_block()?;
        let mut handlers: Vec<ExceptHandler> = Vec::new();
        while self.at(&TokenKind::Except) {
            let handler_pos = self.here();
            self.advance();
            if handlers.last().is_some_and(|h| h.kind.is_none()) {
                return Err(CompileError::syntax(handler_pos, "default 'except:' must be last"));
            }
            let (kind, name) = if self.at(&TokenKind::Colon) {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat(&TokenKind::As) { Some(self.bind_name()?) } else { None };
                (Some(kind), name)
            };
            let handler_body = self.parse_block()?;
            handlers.push(ExceptHandler { kind, name, body: handler_body, pos: handler_pos });
        }
        let orelse = if self.eat(&TokenKind::Else) {
            if handlers.is_empty() {
                return Err(self.error("'else' in 'try' requires an 'except' clause"));
            }
            self.parse_block()?
        } else {
            Vec::new()
        };
        let has_finally = self.eat(&TokenKind::Finally);
        if handlers.is_empty() && !has_finally {
            return Err(self.unexpected("'except' or 'finally' block"));
        }
        let finalbody = if has_finally { self.parse_block()? } else { Vec::new() };
        Ok(Stmt { kind: StmtKind::Try { body, handlers, orelse, finalbody }, pos })
    }

    fn parse_with(&mut self, is_async: bool, pos: Pos) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::With, "'with'")?;
        let mut items = Vec::new();
        loop {
            let context = self.parse_test()?;
            let target = if self.eat(&TokenKind::As) {
                let target = self.parse_bitor()?;
                self.check_target(&target, "assign to")?;
                Some(target)
            } else {
                None
            };
            items.push(WithItem { context, target });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(Stmt { kind: StmtKind::With { items, body, is_async }, pos })
    }

    // ---- expressions ----

    /// Loop and comprehension targets: `in` must not be read as a comparison.
    fn parse_target_list(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let first = self.parse_star_or(Self::parse_bitor)?;
        let target = if self.at(&TokenKind::Comma) {
            let mut items = vec![first];
            while self.eat(&TokenKind::Comma) {
                if self.at(&TokenKind::In) {
                    break;
                }
                items.push(self.parse_star_or(Self::parse_bitor)?);
            }
            Expr::new(ExprKind::Tuple(items), pos)
        } else {
            first
        };
        self.check_target(&target, "assign to")?;
        Ok(target)
    }

    fn parse_star_or(&mut self, inner: fn(&mut Self) -> Result<Expr, CompileError>) -> Result<Expr, CompileError> {
        let pos = self.here();
        if self.eat(&TokenKind::Star) {
            let value = self.parse_bitor()?;
            return Ok(Expr::new(ExprKind::Starred(Box::new(value)), pos));
        }
        inner(self)
    }

    fn parse_testlist_star_or_yield(&mut self) -> Result<Expr, CompileError> {
        if self.at(&TokenKind::Yield) {
            return self.parse_yield();
        }
        self.parse_testlist_star()
    }

    fn parse_yield(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        self.expect(&TokenKind::Yield, "'yield'")?;
        self.eat(&TokenKind::From);
        let value = if self.at_line_end() || self.at(&TokenKind::RParen) || self.at(&TokenKind::Assign) {
            None
        } else {
            Some(Box::new(self.parse_testlist_star()?))
        };
        Ok(Expr::new(ExprKind::Yield(value), pos))
    }

    /// Comma-separated expressions forming an implicit tuple.
    fn parse_testlist_star(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let first = self.parse_star_or(Self::parse_test)?;
        if !self.at(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at_expression_end() {
                break;
            }
            items.push(self.parse_star_or(Self::parse_test)?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), pos))
    }

    fn at_expression_end(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Newline
                | TokenKind::Semi
                | TokenKind::EndOfFile
                | TokenKind::Assign
                | TokenKind::Colon
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::RBrace
        ) || augmented_operator(self.peek()).is_some()
    }

    fn parse_named_test(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let value = self.parse_test()?;
        if self.eat(&TokenKind::Walrus) {
            if !matches!(value.kind, ExprKind::Name { .. }) {
                return Err(CompileError::syntax(pos, "cannot use assignment expressions with this target"));
            }
            let bound = self.parse_test()?;
            return Ok(Expr::new(ExprKind::NamedExpr { target: Box::new(value), value: Box::new(bound) }, pos));
        }
        Ok(value)
    }

    fn parse_test(&mut self) -> Result<Expr, CompileError> {
        if self.at(&TokenKind::Lambda) {
            return self.parse_lambda(true);
        }
        let pos = self.here();
        let body = self.parse_or()?;
        if !self.eat(&TokenKind::If) {
            return Ok(body);
        }
        let test = self.parse_or()?;
        self.expect(&TokenKind::Else, "'else' in conditional expression")?;
        let orelse = self.parse_test()?;
        Ok(Expr::new(
            ExprKind::IfExp { test: Box::new(test), body: Box::new(body), orelse: Box::new(orelse) },
            pos,
        ))
    }

    /// Test without a conditional tail, as used by comprehension filters.
    fn parse_test_nocond(&mut self) -> Result<Expr, CompileError> {
        if self.at(&TokenKind::Lambda) {
            return self.parse_lambda(false);
        }
        self.parse_or()
    }

    fn parse_lambda(&mut self, allow_cond: bool) -> Result<Expr, CompileError> {
        let pos = self.here();
        self.expect(&TokenKind::Lambda, "'lambda'")?;
        let params = self.parse_params(&TokenKind::Colon, false)?;
        self.expect(&TokenKind::Colon, "':'")?;
        let scope = self.fresh_id();
        let body = if allow_cond { self.parse_test()? } else { self.parse_test_nocond()? };
        Ok(Expr::new(ExprKind::Lambda(Box::new(Lambda { params, body, scope })), pos))
    }

    fn parse_bool_chain(
        &mut self,
        token: &TokenKind,
        op: BoolOp,
        inner: fn(&mut Self) -> Result<Expr, CompileError>,
    ) -> Result<Expr, CompileError> {
        let pos = self.here();
        let first = inner(self)?;
        if !self.at(token) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(token) {
            values.push(inner(self)?);
        }
        Ok(Expr::new(ExprKind::BoolOp { op, values }, pos))
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        self.parse_bool_chain(&TokenKind::Or, BoolOp::Or, Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        self.parse_bool_chain(&TokenKind::And, BoolOp::And, Self::parse_not)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        if self.eat(&TokenKind::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::new(ExprKind::UnaryOp { op: UnaryOperator::Not, operand: Box::new(operand) }, pos));
        }
        self.parse_comparison()
    }

    fn comparison_operator(&mut self) -> Option<Operator> {
        let op = match self.peek() {
            TokenKind::Lt => Operator::Lt,
            TokenKind::Gt => Operator::Gt,
            TokenKind::LtEq => Operator::Le,
            TokenKind::GtEq => Operator::Ge,
            TokenKind::EqEq => Operator::Eq,
            TokenKind::NotEq => Operator::Ne,
            TokenKind::In => Operator::In,
            TokenKind::Is => {
                self.advance();
                return Some(if self.eat(&TokenKind::Not) { Operator::IsNot } else { Operator::Is });
            }
            TokenKind::Not if self.peek_at(1) == &TokenKind::In => {
                self.advance();
                self.advance();
                return Some(Operator::NotIn);
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comparison_operator() {
            ops.push(op);
            comparators.push(self.parse_bitor()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(ExprKind::Compare { left: Box::new(left), ops, comparators }, pos))
    }

    fn parse_bitor(&mut self) -> Result<Expr, CompileError> {
        self.parse_binary(1)
    }

    /// Precedence climbing over the left-associative binary operators.
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let pos = self.here();
        let mut left = self.parse_factor()?;
        while let Some((op, prec)) = binary_operator(self.peek()) {
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            left = Expr::new(ExprKind::BinOp { left: Box::new(left), op, right: Box::new(right) }, pos);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let op = match self.peek() {
            TokenKind::Minus => UnaryOperator::Neg,
            TokenKind::Plus => UnaryOperator::Pos,
            TokenKind::Tilde => UnaryOperator::Invert,
            _ => return self.parse_power(),
        };
        self.advance();
        let operand = self.parse_factor()?;
        Ok(Expr::new(ExprKind::UnaryOp { op, operand: Box::new(operand) }, pos))
    }

    fn parse_power(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let base = if self.eat(&TokenKind::Await) {
            let inner = self.parse_primary()?;
            Expr::new(ExprKind::Await(Box::new(inner)), pos)
        } else {
            self.parse_primary()?
        };
        if !self.eat(&TokenKind::DoubleStar) {
            return Ok(base);
        }
        let exponent = self.parse_factor()?;
        Ok(Expr::new(ExprKind::BinOp { left: Box::new(base), op: Operator::Pow, right: Box::new(exponent) }, pos))
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_atom()?;
        let pos = expr.pos;
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    self.advance();
                    let (args, keywords) = self.parse_call_args()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    expr = Expr::new(ExprKind::Call { func: Box::new(expr), args, keywords }, pos);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_subscript_list()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expr::new(ExprKind::Subscript { value: Box::new(expr), index: Box::new(index) }, pos);
                }
                TokenKind::Dot => {
                    self.advance();
                    let (attr, _) = self.expect_name()?;
                    expr = Expr::new(ExprKind::Attribute { value: Box::new(expr), attr }, pos);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<Keyword>), CompileError> {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let pos = self.here();
            if self.eat(&TokenKind::DoubleStar) {
                self.parse_test()?;
                self.errors.push(CompileError::unsupported(pos, "'**' argument unpacking"));
            } else if matches!(self.peek(), TokenKind::Name(_)) && self.peek_at(1) == &TokenKind::Assign {
                let (name, _) = self.expect_name()?;
                self.advance();
                if keywords.iter().any(|k| k.name == name) {
                    return Err(CompileError::syntax(pos, format!("keyword argument repeated: {name}")));
                }
                let value = self.parse_test()?;
                keywords.push(Keyword { name, value });
            } else {
                let arg = self.parse_star_or(Self::parse_named_test)?;
                if !keywords.is_empty() && !matches!(arg.kind, ExprKind::Starred(_)) {
                    return Err(CompileError::syntax(pos, "positional argument follows keyword argument"));
                }
                if self.at(&TokenKind::For) {
                    let generator = self.parse_comprehension(CompKind::Generator, arg, None, pos)?;
                    args.push(generator);
                    break;
                }
                args.push(arg);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok((args, keywords))
    }

    fn parse_subscript_list(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let first = self.parse_subscript()?;
        if !self.at(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_subscript()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), pos))
    }

    fn parse_subscript(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let lower = if self.at(&TokenKind::Colon) { None } else { Some(self.parse_named_test()?) };
        if !self.eat(&TokenKind::Colon) {
            return lower.ok_or_else(|| self.unexpected("an index"));
        }
        let bound = |p: &mut Self| -> Result<Option<Box<Expr>>, CompileError> {
            if matches!(p.peek(), TokenKind::Colon | TokenKind::Comma | TokenKind::RBracket) {
                Ok(None)
            } else {
                Ok(Some(Box::new(p.parse_test()?)))
            }
        };
        let upper = bound(self)?;
        let step = if self.eat(&TokenKind::Colon) { bound(self)? } else { None };
        Ok(Expr::new(ExprKind::Slice { lower: lower.map(Box::new), upper, step }, pos))
    }

    fn parse_atom(&mut self) -> Result<Expr, CompileError> {
        let pos = self.here();
        let kind = match self.peek().clone() {
            TokenKind::Name(name) => {
                self.advance();
                ExprKind::Name { id: self.fresh_id(), name }
            }
            TokenKind::Int(value) => {
                self.advance();
                ExprKind::Constant(Constant::Int(value))
            }
            TokenKind::Float(value) => {
                self.advance();
                ExprKind::Constant(Constant::Float(value))
            }
            TokenKind::Imaginary(text) => {
                self.advance();
                ExprKind::Constant(Constant::Imaginary(text))
            }
            TokenKind::Str(_) => ExprKind::Constant(self.parse_strings()?),
            TokenKind::TrueLit => {
                self.advance();
                ExprKind::Constant(Constant::Bool(true))
            }
            TokenKind::FalseLit => {
                self.advance();
                ExprKind::Constant(Constant::Bool(false))
            }
            TokenKind::NoneLit => {
                self.advance();
                ExprKind::Constant(Constant::None)
            }
            TokenKind::Ellipsis => {
                self.advance();
                ExprKind::Constant(Constant::Ellipsis)
            }
            TokenKind::LParen => {
                self.advance();
                return self.parse_paren(pos);
            }
            TokenKind::LBracket => {
                self.advance();
                return self.parse_list_display(pos);
            }
            TokenKind::LBrace => {
                self.advance();
                return self.parse_brace_display(pos);
            }
            _ => return Err(self.unexpected("an expression")),
        };
        Ok(Expr::new(kind, pos))
    }

    /// Adjacent string literals concatenate into one constant.
    fn parse_strings(&mut self) -> Result<Constant, CompileError> {
        let pos = self.here();
        let mut value = String::new();
        let mut bytes = None;
        let mut format = false;
        while let TokenKind::Str(lit) = self.peek() {
            let is_bytes = lit.kind == StrKind::Bytes;
            if bytes.is_some_and(|b| b != is_bytes) {
                return Err(CompileError::syntax(pos, "cannot mix bytes and nonbytes literals"));
            }
            bytes = Some(is_bytes);
            format |= lit.kind == StrKind::Format;
            value.push_str(&lit.value);
            self.advance();
        }
        Ok(if bytes == Some(true) {
            Constant::Bytes(value)
        } else if format {
            Constant::FormatStr(value)
        } else {
            Constant::Str(value)
        })
    }

    fn parse_paren(&mut self, pos: Pos) -> Result<Expr, CompileError> {
        if self.eat(&TokenKind::RParen) {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), pos));
        }
        if self.at(&TokenKind::Yield) {
            let value = self.parse_yield()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(value);
        }
        let first = self.parse_star_or(Self::parse_named_test)?;
        if self.at(&TokenKind::For) {
            let generator = self.parse_comprehension(CompKind::Generator, first, None, pos)?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(generator);
        }
        if !self.at(&TokenKind::Comma) {
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RParen) {
                break;
            }
            items.push(self.parse_star_or(Self::parse_named_test)?);
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(Expr::new(ExprKind::Tuple(items), pos))
    }

    fn parse_list_display(&mut self, pos: Pos) -> Result<Expr, CompileError> {
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::new(ExprKind::List(Vec::new()), pos));
        }
        let first = self.parse_star_or(Self::parse_named_test)?;
        if self.at(&TokenKind::For) {
            let comp = self.parse_comprehension(CompKind::List, first, None, pos)?;
            self.expect(&TokenKind::RBracket, "']'")?;
            return Ok(comp);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_star_or(Self::parse_named_test)?);
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Expr::new(ExprKind::List(items), pos))
    }

    fn parse_brace_display(&mut self, pos: Pos) -> Result<Expr, CompileError> {
        if self.eat(&TokenKind::RBrace) {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), pos));
        }
        if self.at(&TokenKind::DoubleStar) {
            return Err(CompileError::unsupported(self.here(), "'**' dictionary unpacking"));
        }
        let first = self.parse_star_or(Self::parse_test)?;
        if self.eat(&TokenKind::Colon) {
            let value = self.parse_test()?;
            if self.at(&TokenKind::For) {
                let comp = self.parse_comprehension(CompKind::Dict, first, Some(value), pos)?;
                self.expect(&TokenKind::RBrace, "'}'")?;
                return Ok(comp);
            }
            let mut pairs = vec![(first, value)];
            while self.eat(&TokenKind::Comma) {
                if self.at(&TokenKind::RBrace) {
                    break;
                }
                let key = self.parse_test()?;
                self.expect(&TokenKind::Colon, "':'")?;
                pairs.push((key, self.parse_test()?));
            }
            self.expect(&TokenKind::RBrace, "'}'")?;
            return Ok(Expr::new(ExprKind::Dict(pairs), pos));
        }
        if self.at(&TokenKind::For) {
            let comp = self.parse_comprehension(CompKind::Set, first, None, pos)?;
            self.expect(&TokenKind::RBrace, "'}'")?;
            return Ok(comp);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RBrace) {
                break;
            }
            items.push(self.parse_star_or(Self::parse_test)?);
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::new(ExprKind::Set(items), pos))
    }

    fn parse_comprehension(
        &mut self,
        kind: CompKind,
        element: Expr,
        value: Option<Expr>,
        pos: Pos,
    ) -> Result<Expr, CompileError> {
        let scope = self.fresh_id();
        let mut generators = Vec::new();
        while self.at(&TokenKind::For) || self.at(&TokenKind::Async) {
            let pos = self.here();
            if self.eat(&TokenKind::Async) {
                self.errors.push(CompileError::unsupported(pos, "asynchronous comprehension"));
            }
            self.expect(&TokenKind::For, "'for'")?;
            let target = self.parse_target_list()?;
            self.expect(&TokenKind::In, "'in'")?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.eat(&TokenKind::If) {
                ifs.push(self.parse_test_nocond()?);
            }
            generators.push(CompFor { target, iter, ifs });
        }
        Ok(Expr::new(
            ExprKind::Comprehension { kind, element: Box::new(element), value: value.map(Box::new), generators, scope },
            pos,
        ))
    }
}
