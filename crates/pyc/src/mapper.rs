//! Type and dispatch mapping.
//!
//! No static types are inferred: every operation is lowered to an entry
//! point of the dynamic value interface and the runtime picks the
//! behaviour from the operand's type tag. This module owns the table from
//! syntax to entry point and rejects, before emission starts, every
//! construct that has no runtime-support counterpart.

use num_traits::ToPrimitive;
use pyjvm_bytecode::abi;
use pyjvm_bytecode::{Operator, RuntimeEntry, UnaryOperator};

use crate::ast::*;
use crate::error::CompileError;

/// How an operation reaches the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Plain call of an entry point.
    Entry(RuntimeEntry),
    /// Entry point taking an operator code as its first argument.
    Operator { entry: RuntimeEntry, code: i16 },
    /// Read of a static field of the runtime library.
    Static { class: &'static str, field: &'static str },
}

pub fn binary(op: Operator, pos: Pos) -> Result<Dispatch, CompileError> {
    if !op.is_supported() {
        return Err(CompileError::unsupported(pos, format!("the '{}' operator", op.symbol())));
    }
    Ok(Dispatch::Operator { entry: RuntimeEntry::BinaryOp, code: op.code() })
}

pub fn inplace(op: Operator, pos: Pos) -> Result<Dispatch, CompileError> {
    binary(op, pos).map(|_| Dispatch::Operator { entry: RuntimeEntry::InplaceOp, code: op.code() })
}

pub fn unary(op: UnaryOperator) -> Dispatch {
    Dispatch::Operator { entry: RuntimeEntry::UnaryOp, code: op.code() }
}

pub fn call(has_keywords: bool) -> Dispatch {
    Dispatch::Entry(if has_keywords { RuntimeEntry::CallKw } else { RuntimeEntry::Call })
}

/// Constructor for a literal constant.
pub fn literal(constant: &Constant, pos: Pos) -> Result<Dispatch, CompileError> {
    Ok(match constant {
        Constant::None => Dispatch::Static { class: abi::DYN, field: abi::NONE_FIELD },
        Constant::Bool(_) => Dispatch::Entry(RuntimeEntry::Bool),
        Constant::Int(value) if value.to_i64().is_some() => Dispatch::Entry(RuntimeEntry::Int),
        Constant::Int(_) => Dispatch::Entry(RuntimeEntry::BigInt),
        Constant::Float(_) => Dispatch::Entry(RuntimeEntry::Float),
        Constant::Str(_) => Dispatch::Entry(RuntimeEntry::Str),
        Constant::Bytes(_) => return Err(CompileError::unsupported(pos, "bytes literals")),
        Constant::FormatStr(_) => return Err(CompileError::unsupported(pos, "f-strings")),
        Constant::Ellipsis => return Err(CompileError::unsupported(pos, "the '...' literal")),
        Constant::Imaginary(_) => return Err(CompileError::unsupported(pos, "complex literals")),
    })
}

/// Constructor and element-insertion entry points of a container display
/// or comprehension.
pub fn container(kind: CompKind) -> (RuntimeEntry, RuntimeEntry) {
    match kind {
        CompKind::List | CompKind::Generator => (RuntimeEntry::List, RuntimeEntry::ListAppend),
        CompKind::Set => (RuntimeEntry::Set, RuntimeEntry::SetAdd),
        CompKind::Dict => (RuntimeEntry::Dict, RuntimeEntry::SetItem),
    }
}

/// Builtin type named by a simple annotation.
fn annotated_type(annotation: &Expr) -> Option<&str> {
    match &annotation.kind {
        ExprKind::Name { name, .. } if matches!(name.as_str(), "int" | "float" | "str" | "bool") => Some(name),
        ExprKind::Constant(Constant::None) => Some("None"),
        _ => None,
    }
}

fn literal_type(value: &Expr) -> Option<&'static str> {
    match &value.kind {
        ExprKind::Constant(Constant::Int(_)) => Some("int"),
        ExprKind::Constant(Constant::Float(_)) => Some("float"),
        ExprKind::Constant(Constant::Str(_)) => Some("str"),
        ExprKind::Constant(Constant::Bool(_)) => Some("bool"),
        ExprKind::Constant(Constant::None) => Some("None"),
        _ => None,
    }
}

/// Whether a literal value agrees with a builtin-type annotation, following
/// the numeric tower (`bool` is an `int`, an `int` is accepted as `float`).
pub fn annotation_consistent(annotation: &Expr, value: &Expr) -> Option<bool> {
    let declared = annotated_type(annotation)?;
    let actual = literal_type(value)?;
    Some(match (declared, actual) {
        (d, a) if d == a => true,
        ("int", "bool") | ("float", "int") | ("float", "bool") => true,
        _ => false,
    })
}

/// Check a whole module for constructs the runtime cannot express and for
/// misplaced control flow. Errors abort emission for the module; annotation
/// mismatches are reported as warnings.
pub fn check_module(module: &Module) -> Vec<CompileError> {
    let mut checker = Checker { errors: Vec::new(), loops: 0, function: false, class: false };
    checker.block(&module.body);
    checker.errors
}

struct Checker {
    errors: Vec<CompileError>,
    loops: usize,
    function: bool,
    class: bool,
}

impl Checker {
    fn unsupported(&mut self, pos: Pos, feature: &str) {
        self.errors.push(CompileError::unsupported(pos, feature));
    }

    fn annotation(&mut self, annotation: &Expr, value: &Expr) {
        if annotation_consistent(annotation, value) == Some(false) {
            let declared = annotated_type(annotation).unwrap_or("?");
            let actual = literal_type(value).unwrap_or("?");
            self.errors.push(CompileError::AnnotationMismatch {
                line: value.pos.line,
                col: value.pos.col,
                msg: format!("'{actual}' literal does not match annotation '{declared}'"),
            });
        }
    }

    fn block(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    /// Check a nested function or class body with fresh loop context.
    fn nested(&mut self, function: bool, class: bool, f: impl FnOnce(&mut Self)) {
        let saved = (self.loops, self.function, self.class);
        self.loops = 0;
        self.function = function;
        self.class = class;
        f(self);
        (self.loops, self.function, self.class) = saved;
    }

    fn params(&mut self, params: &[Param]) {
        for param in params {
            match param.kind {
                ParamKind::VarArgs if param.name.is_empty() => self.unsupported(param.pos, "keyword-only parameters"),
                ParamKind::VarArgs => self.unsupported(param.pos, "'*args' parameters"),
                ParamKind::KwArgs => self.unsupported(param.pos, "'**kwargs' parameters"),
                ParamKind::Normal => {}
            }
            if let Some(default) = &param.default {
                self.expr(default);
                if let Some(annotation) = &param.annotation {
                    self.annotation(annotation, default);
                }
            }
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                if def.is_async {
                    self.unsupported(stmt.pos, "async functions");
                }
                for decorator in &def.decorators {
                    self.expr(decorator);
                }
                self.params(&def.params);
                self.nested(true, false, |c| c.block(&def.body));
            }
            StmtKind::ClassDef(def) => {
                for decorator in &def.decorators {
                    self.expr(decorator);
                }
                for base in &def.bases {
                    self.expr(base);
                }
                if let Some(keyword) = def.keywords.first() {
                    self.unsupported(keyword.value.pos, "class keyword arguments");
                }
                self.nested(false, true, |c| c.block(&def.body));
            }
            StmtKind::Return(value) => {
                if !self.function {
                    self.errors.push(CompileError::syntax(stmt.pos, "'return' outside function"));
                }
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.target(target);
                }
            }
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    self.target(target);
                }
                self.expr(value);
            }
            StmtKind::AugAssign { target, op, value } => {
                if let Err(e) = inplace(*op, stmt.pos) {
                    self.errors.push(e);
                }
                self.target(target);
                self.expr(value);
            }
            StmtKind::AnnAssign { target, annotation, value } => {
                self.target(target);
                if let Some(value) = value {
                    self.expr(value);
                    self.annotation(annotation, value);
                }
            }
            StmtKind::For { target, iter, body, orelse, is_async } => {
                if *is_async {
                    self.unsupported(stmt.pos, "'async for'");
                }
                self.target(target);
                self.expr(iter);
                self.loop_body(body);
                self.block(orelse);
            }
            StmtKind::While { test, body, orelse } => {
                self.expr(test);
                self.loop_body(body);
                self.block(orelse);
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test);
                self.block(body);
                self.block(orelse);
            }
            StmtKind::With { items, body, is_async } => {
                if *is_async {
                    self.unsupported(stmt.pos, "'async with'");
                }
                for item in items {
                    self.expr(&item.context);
                    if let Some(target) = &item.target {
                        self.target(target);
                    }
                }
                self.block(body);
            }
            StmtKind::Raise { exc, cause } => {
                for e in [exc, cause].into_iter().flatten() {
                    self.expr(e);
                }
            }
            StmtKind::Try { body, handlers, orelse, finalbody } => {
                self.block(body);
                for handler in handlers {
                    if let Some(kind) = &handler.kind {
                        self.expr(kind);
                    }
                    self.block(&handler.body);
                }
                self.block(orelse);
                self.block(finalbody);
            }
            StmtKind::Assert { test, msg } => {
                self.expr(test);
                if let Some(msg) = msg {
                    self.expr(msg);
                }
            }
            StmtKind::Import(_) => {}
            StmtKind::ImportFrom { level, star, .. } => {
                if *star {
                    self.unsupported(stmt.pos, "'import *'");
                }
                if *level > 0 {
                    self.unsupported(stmt.pos, "relative imports");
                }
            }
            StmtKind::Break | StmtKind::Continue if self.loops == 0 => {
                let word = if matches!(stmt.kind, StmtKind::Break) { "break" } else { "continue" };
                self.errors.push(CompileError::syntax(stmt.pos, format!("'{word}' outside loop")));
            }
            StmtKind::Expr(value) => self.expr(value),
            StmtKind::Global(_) | StmtKind::Nonlocal(_) | StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
    }

    fn loop_body(&mut self, body: &[Stmt]) {
        self.loops += 1;
        self.block(body);
        self.loops -= 1;
    }

    fn target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Starred(_) => self.unsupported(target.pos, "starred assignment targets"),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.target(item);
                }
            }
            ExprKind::Name { .. } => {}
            _ => self.expr(target),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::BoolOp { values, .. } => {
                for value in values {
                    self.expr(value);
                }
            }
            ExprKind::BinOp { left, op, right } => {
                if let Err(e) = binary(*op, expr.pos) {
                    self.errors.push(e);
                }
                self.expr(left);
                self.expr(right);
            }
            ExprKind::UnaryOp { operand, .. } => self.expr(operand),
            ExprKind::Compare { left, comparators, .. } => {
                self.expr(left);
                for c in comparators {
                    self.expr(c);
                }
            }
            ExprKind::Lambda(lambda) => {
                self.params(&lambda.params);
                self.nested(true, false, |c| c.expr(&lambda.body));
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test);
                self.expr(body);
                self.expr(orelse);
            }
            ExprKind::Call { func, args, keywords } => {
                self.expr(func);
                for arg in args {
                    self.expr(arg);
                }
                for keyword in keywords {
                    self.expr(&keyword.value);
                }
            }
            ExprKind::Attribute { value, .. } => self.expr(value),
            ExprKind::Subscript { value, index } => {
                self.expr(value);
                self.expr(index);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part);
                }
            }
            ExprKind::Name { .. } => {}
            ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key);
                    self.expr(value);
                }
            }
            ExprKind::Comprehension { element, value, generators, .. } => {
                for generator in generators {
                    self.target(&generator.target);
                    self.expr(&generator.iter);
                    for cond in &generator.ifs {
                        self.expr(cond);
                    }
                }
                self.expr(element);
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            ExprKind::Constant(constant) => {
                if let Err(e) = literal(constant, expr.pos) {
                    self.errors.push(e);
                }
            }
            ExprKind::Starred(_) => self.unsupported(expr.pos, "starred expressions"),
            ExprKind::Yield(_) => self.unsupported(expr.pos, "generators ('yield')"),
            ExprKind::Await(_) => self.unsupported(expr.pos, "'await'"),
            ExprKind::NamedExpr { .. } => self.unsupported(expr.pos, "assignment expressions"),
        }
    }
}
