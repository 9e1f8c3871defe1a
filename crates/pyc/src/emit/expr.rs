use num_traits::ToPrimitive;
use pyjvm_bytecode::abi;
use pyjvm_bytecode::{Insn, RuntimeEntry};

use super::{Body, Branch, Emitter, FnEmitter, Op};
use crate::ast::*;
use crate::error::CompileError;
use crate::mapper::{self, Dispatch};
use crate::resolve::Binding;

fn operator(fe: &FnEmitter<'_>, dispatch: Dispatch) -> Result<(RuntimeEntry, i16), CompileError> {
    match dispatch {
        Dispatch::Operator { entry, code } => Ok((entry, code)),
        other => Err(CompileError::internal(fe.scope.qualname.clone(), format!("{other:?} is not an operator"))),
    }
}

impl<'a> Emitter<'a> {
    /// Push the value of an expression.
    pub(super) fn emit_expr(&mut self, expr: &'a Expr, fe: &mut FnEmitter<'a>) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Constant(constant) => self.emit_constant(fe, constant, expr.pos),
            ExprKind::Name { id, name } => self.load_name(fe, *id, name, expr.pos),
            ExprKind::BoolOp { op, values } => {
                let end = fe.label();
                let short = if *op == BoolOp::And { Branch::Ifeq } else { Branch::Ifne };
                if let Some((last, rest)) = values.split_last() {
                    for value in rest {
                        self.emit_expr(value, fe)?;
                        fe.insn(Insn::Dup)?;
                        fe.call(RuntimeEntry::Truth)?;
                        fe.branch(short, end)?;
                        fe.insn(Insn::Pop)?;
                    }
                    self.emit_expr(last, fe)?;
                }
                fe.bind(end)
            }
            ExprKind::BinOp { left, op, right } => {
                let (entry, code) = operator(fe, mapper::binary(*op, expr.pos)?)?;
                fe.insn(Insn::Iconst(code))?;
                self.emit_expr(left, fe)?;
                self.emit_expr(right, fe)?;
                fe.call(entry)
            }
            ExprKind::UnaryOp { op, operand } => {
                let (entry, code) = operator(fe, mapper::unary(*op))?;
                fe.insn(Insn::Iconst(code))?;
                self.emit_expr(operand, fe)?;
                fe.call(entry)
            }
            ExprKind::Compare { left, ops, comparators } => self.emit_compare(fe, left, ops, comparators, expr.pos),
            ExprKind::Lambda(lambda) => {
                self.emit_function_object(fe, lambda.scope, &lambda.params, Body::Expr(&lambda.body))
            }
            ExprKind::IfExp { test, body, orelse } => {
                let otherwise = fe.label();
                let end = fe.label();
                self.emit_condition(fe, test)?;
                fe.branch(Branch::Ifeq, otherwise)?;
                self.emit_expr(body, fe)?;
                fe.branch(Branch::Goto, end)?;
                fe.bind(otherwise)?;
                self.emit_expr(orelse, fe)?;
                fe.bind(end)
            }
            ExprKind::Call { func, args, keywords } => self.emit_call(fe, func, args, keywords),
            ExprKind::Attribute { value, attr } => {
                self.emit_expr(value, fe)?;
                fe.string(attr)?;
                fe.call(RuntimeEntry::GetAttr)
            }
            ExprKind::Subscript { value, index } => {
                self.emit_expr(value, fe)?;
                self.emit_expr(index, fe)?;
                fe.call(RuntimeEntry::GetItem)
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step] {
                    match part {
                        Some(part) => self.emit_expr(part, fe)?,
                        None => fe.insn(Insn::AconstNull)?,
                    }
                }
                fe.call(RuntimeEntry::Slice)
            }
            ExprKind::List(items) => {
                self.expr_array(fe, items)?;
                fe.call(RuntimeEntry::List)
            }
            ExprKind::Tuple(items) => {
                self.expr_array(fe, items)?;
                fe.call(RuntimeEntry::Tuple)
            }
            ExprKind::Set(items) => {
                self.expr_array(fe, items)?;
                fe.call(RuntimeEntry::Set)
            }
            ExprKind::Dict(pairs) => {
                fe.new_array(abi::PY_OBJECT, pairs.len() * 2)?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    fe.insn(Insn::Dup)?;
                    fe.iconst(2 * i)?;
                    self.emit_expr(key, fe)?;
                    fe.insn(Insn::Aastore)?;
                    fe.insn(Insn::Dup)?;
                    fe.iconst(2 * i + 1)?;
                    self.emit_expr(value, fe)?;
                    fe.insn(Insn::Aastore)?;
                }
                fe.call(RuntimeEntry::Dict)
            }
            ExprKind::Comprehension { kind, element, value, generators, .. } => {
                self.emit_comprehension(fe, *kind, element, value.as_deref(), generators)
            }
            ExprKind::Starred(_) => Err(CompileError::unsupported(expr.pos, "starred expressions")),
            ExprKind::Yield(_) => Err(CompileError::unsupported(expr.pos, "generators ('yield')")),
            ExprKind::Await(_) => Err(CompileError::unsupported(expr.pos, "'await'")),
            ExprKind::NamedExpr { .. } => Err(CompileError::unsupported(expr.pos, "assignment expressions")),
        }
    }

    fn emit_constant(&mut self, fe: &mut FnEmitter<'a>, constant: &Constant, pos: Pos) -> Result<(), CompileError> {
        match mapper::literal(constant, pos)? {
            Dispatch::Static { class, field } => {
                fe.op(Op::GetStatic { class: class.to_string(), field: field.to_string() })
            }
            Dispatch::Operator { .. } => {
                Err(CompileError::internal(fe.scope.qualname.clone(), "literal mapped to an operator"))
            }
            Dispatch::Entry(entry) => {
                match constant {
                    Constant::Bool(b) => fe.iconst(usize::from(*b))?,
                    Constant::Int(value) => match value.to_i64() {
                        Some(small) if entry == RuntimeEntry::Int => fe.op(Op::Long(small))?,
                        _ => fe.string(&value.to_string())?,
                    },
                    Constant::Float(value) => fe.op(Op::Double(*value))?,
                    Constant::Str(value) => fe.string(value)?,
                    other => {
                        return Err(CompileError::internal(
                            fe.scope.qualname.clone(),
                            format!("no operand lowering for {other:?}"),
                        ))
                    }
                }
                fe.call(entry)
            }
        }
    }

    /// `a < b < c` evaluates `b` once and stops at the first false link.
    fn emit_compare(
        &mut self,
        fe: &mut FnEmitter<'a>,
        left: &'a Expr,
        ops: &[pyjvm_bytecode::Operator],
        comparators: &'a [Expr],
        pos: Pos,
    ) -> Result<(), CompileError> {
        if let ([op], [right]) = (ops, comparators) {
            let (entry, code) = operator(fe, mapper::binary(*op, pos)?)?;
            fe.insn(Insn::Iconst(code))?;
            self.emit_expr(left, fe)?;
            self.emit_expr(right, fe)?;
            return fe.call(entry);
        }
        let end = fe.label();
        let prev = fe.temp();
        self.emit_expr(left, fe)?;
        fe.astore(prev)?;
        let last = comparators.len().saturating_sub(1);
        for (i, (op, right)) in ops.iter().zip(comparators).enumerate() {
            let (entry, code) = operator(fe, mapper::binary(*op, pos)?)?;
            fe.insn(Insn::Iconst(code))?;
            fe.aload(prev)?;
            self.emit_expr(right, fe)?;
            if i < last {
                fe.insn(Insn::Dup)?;
                fe.astore(prev)?;
            }
            fe.call(entry)?;
            if i < last {
                fe.insn(Insn::Dup)?;
                fe.call(RuntimeEntry::Truth)?;
                fe.branch(Branch::Ifeq, end)?;
                fe.insn(Insn::Pop)?;
            }
        }
        fe.release(prev);
        fe.bind(end)
    }

    fn emit_call(
        &mut self,
        fe: &mut FnEmitter<'a>,
        func: &'a Expr,
        args: &'a [Expr],
        keywords: &'a [Keyword],
    ) -> Result<(), CompileError> {
        if let ExprKind::Name { id, name } = &func.kind {
            if self.binding(*id, name)? == &Binding::Super {
                if !args.is_empty() || !keywords.is_empty() {
                    return Err(CompileError::unsupported(func.pos, "super() with arguments"));
                }
                return self.emit_super(fe, func.pos);
            }
        }
        let Dispatch::Entry(entry) = mapper::call(!keywords.is_empty()) else {
            return Err(CompileError::internal(fe.scope.qualname.clone(), "call mapped to a non-entry dispatch"));
        };
        self.emit_expr(func, fe)?;
        self.expr_array(fe, args)?;
        if !keywords.is_empty() {
            self.string_array(fe, keywords.iter().map(|k| k.name.as_str()))?;
            fe.new_array(abi::PY_OBJECT, keywords.len())?;
            for (i, keyword) in keywords.iter().enumerate() {
                fe.insn(Insn::Dup)?;
                fe.iconst(i)?;
                self.emit_expr(&keyword.value, fe)?;
                fe.insn(Insn::Aastore)?;
            }
        }
        fe.call(entry)
    }

    /// Zero-argument `super()`: the class object of the defining class
    /// statement and the method's first argument.
    fn emit_super(&mut self, fe: &mut FnEmitter<'a>, pos: Pos) -> Result<(), CompileError> {
        let unit = fe
            .scope
            .class_scope
            .and_then(|class| self.class_units.get(&class))
            .map(|&unit| self.units[unit].name().to_string())
            .ok_or_else(|| CompileError::unsupported(pos, "super() outside a method"))?;
        let Some(receiver) = fe.scope.params.first().and_then(|_| fe.scope.locals.first()) else {
            return Err(CompileError::syntax(pos, "super(): no arguments"));
        };
        fe.op(Op::GetStatic { class: unit, field: abi::CLASS_FIELD.to_string() })?;
        fe.aload(receiver.slot)?;
        if receiver.cell {
            fe.call(RuntimeEntry::CellGet)?;
        }
        fe.string(&receiver.name)?;
        fe.call(RuntimeEntry::CheckLocal)?;
        fe.call(RuntimeEntry::SuperOf)
    }

    /// Comprehensions run inline in the enclosing frame; the accumulator
    /// lives in a temporary slot.
    fn emit_comprehension(
        &mut self,
        fe: &mut FnEmitter<'a>,
        kind: CompKind,
        element: &'a Expr,
        value: Option<&'a Expr>,
        generators: &'a [CompFor],
    ) -> Result<(), CompileError> {
        for generator in generators {
            self.fresh_cells(fe, &generator.target)?;
        }
        let (ctor, _) = mapper::container(kind);
        fe.new_array(abi::PY_OBJECT, 0)?;
        fe.call(ctor)?;
        let acc = fe.temp();
        fe.astore(acc)?;
        self.comprehension_level(fe, kind, element, value, generators, acc)?;
        fe.aload(acc)?;
        fe.release(acc);
        if kind == CompKind::Generator {
            fe.call(RuntimeEntry::Iter)?;
        }
        Ok(())
    }

    fn comprehension_level(
        &mut self,
        fe: &mut FnEmitter<'a>,
        kind: CompKind,
        element: &'a Expr,
        value: Option<&'a Expr>,
        generators: &'a [CompFor],
        acc: u16,
    ) -> Result<(), CompileError> {
        let Some((generator, inner)) = generators.split_first() else {
            let (_, add) = mapper::container(kind);
            fe.aload(acc)?;
            self.emit_expr(element, fe)?;
            if let Some(value) = value {
                self.emit_expr(value, fe)?;
            }
            return fe.call(add);
        };
        self.emit_expr(&generator.iter, fe)?;
        fe.call(RuntimeEntry::Iter)?;
        let it = fe.temp();
        fe.astore(it)?;
        let top = fe.code.here()?;
        let done = fe.label();
        fe.aload(it)?;
        fe.call(RuntimeEntry::Next)?;
        fe.insn(Insn::Dup)?;
        fe.branch(Branch::Ifnull, done)?;
        self.store_target(fe, &generator.target)?;
        for cond in &generator.ifs {
            self.emit_condition(fe, cond)?;
            fe.branch(Branch::Ifeq, top)?;
        }
        self.comprehension_level(fe, kind, element, value, inner, acc)?;
        fe.branch(Branch::Goto, top)?;
        fe.bind(done)?;
        fe.insn(Insn::Pop)?;
        fe.release(it);
        Ok(())
    }

    /// Give every captured comprehension variable a new cell, so closures
    /// created by this evaluation do not share it with earlier ones.
    fn fresh_cells(&mut self, fe: &mut FnEmitter<'a>, target: &'a Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Name { id, name } => {
                if let Binding::Cell(slot) = self.binding(*id, name)? {
                    fe.new_cell(*slot)?;
                }
                Ok(())
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.fresh_cells(fe, item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
