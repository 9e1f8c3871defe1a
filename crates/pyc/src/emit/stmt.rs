use pyjvm_bytecode::abi;
use pyjvm_bytecode::{Insn, RuntimeEntry};

use super::{Body, Branch, Cleanup, Emitter, FnEmitter, Unwind};
use crate::ast::*;
use crate::error::CompileError;
use crate::mapper::{self, Dispatch};

impl<'a> Emitter<'a> {
    pub(super) fn emit_block(&mut self, body: &'a [Stmt], fe: &mut FnEmitter<'a>) -> Result<(), CompileError> {
        for stmt in body {
            self.emit_stmt(stmt, fe)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &'a Stmt, fe: &mut FnEmitter<'a>) -> Result<(), CompileError> {
        if self.options.emit_line_numbers {
            fe.code.line(stmt.pos.line);
        }
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                for decorator in &def.decorators {
                    self.emit_expr(decorator, fe)?;
                }
                self.emit_function_object(fe, def.scope, &def.params, Body::Block(&def.body))?;
                self.apply_decorators(fe, def.decorators.len())?;
                self.store_name(fe, def.name.id, &def.name.name)
            }
            StmtKind::ClassDef(def) => {
                for decorator in &def.decorators {
                    self.emit_expr(decorator, fe)?;
                }
                self.emit_class(fe, def)?;
                self.apply_decorators(fe, def.decorators.len())?;
                self.store_name(fe, def.name.id, &def.name.name)
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.emit_expr(value, fe)?,
                    None => fe.none()?,
                }
                if self.has_cleanup(fe, 0) {
                    let t = fe.temp();
                    fe.astore(t)?;
                    self.exit_regions(fe, 0)?;
                    fe.aload(t)?;
                    fe.release(t);
                } else {
                    self.exit_regions(fe, 0)?;
                }
                fe.insn(Insn::Areturn)?;
                self.resume_regions(fe, 0)
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete_target(fe, target)?;
                }
                Ok(())
            }
            StmtKind::Assign { targets, value } => {
                self.emit_expr(value, fe)?;
                if let Some((last, rest)) = targets.split_last() {
                    for target in rest {
                        fe.insn(Insn::Dup)?;
                        self.store_target(fe, target)?;
                    }
                    self.store_target(fe, last)?;
                }
                Ok(())
            }
            StmtKind::AugAssign { target, op, value } => self.emit_aug_assign(fe, target, *op, value, stmt.pos),
            StmtKind::AnnAssign { target, value, .. } => match value {
                Some(value) => {
                    self.emit_expr(value, fe)?;
                    self.store_target(fe, target)
                }
                None => Ok(()),
            },
            StmtKind::For { target, iter, body, orelse, .. } => self.emit_for(fe, target, iter, body, orelse),
            StmtKind::While { test, body, orelse } => self.emit_while(fe, test, body, orelse),
            StmtKind::If { test, body, orelse } => {
                let otherwise = fe.label();
                let end = fe.label();
                self.emit_condition(fe, test)?;
                fe.branch(Branch::Ifeq, otherwise)?;
                self.emit_block(body, fe)?;
                if orelse.is_empty() {
                    fe.bind(otherwise)?;
                } else {
                    fe.goto_unless_terminated(end)?;
                    fe.bind(otherwise)?;
                    self.emit_block(orelse, fe)?;
                }
                fe.bind(end)
            }
            StmtKind::With { items, body, .. } => self.emit_with(fe, items, body),
            StmtKind::Raise { exc, cause } => {
                match exc {
                    None => match fe.active_exc.last().copied() {
                        Some(slot) => fe.aload(slot)?,
                        None => fe.call(RuntimeEntry::Reraise)?,
                    },
                    Some(exc) => {
                        self.emit_expr(exc, fe)?;
                        match cause {
                            Some(cause) => self.emit_expr(cause, fe)?,
                            None => fe.insn(Insn::AconstNull)?,
                        }
                        fe.call(RuntimeEntry::Raise)?;
                    }
                }
                fe.insn(Insn::Athrow)
            }
            StmtKind::Try { body, handlers, orelse, finalbody } => {
                if finalbody.is_empty() {
                    self.emit_try_except(fe, body, handlers, orelse)
                } else {
                    self.emit_try_finally(fe, body, handlers, orelse, finalbody)
                }
            }
            StmtKind::Assert { test, msg } => {
                let ok = fe.label();
                self.emit_condition(fe, test)?;
                fe.branch(Branch::Ifne, ok)?;
                match msg {
                    Some(msg) => self.emit_expr(msg, fe)?,
                    None => fe.insn(Insn::AconstNull)?,
                }
                fe.call(RuntimeEntry::AssertFail)?;
                fe.insn(Insn::Athrow)?;
                fe.bind(ok)
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    fe.string(&alias.name)?;
                    fe.call(RuntimeEntry::ImportModule)?;
                    if alias.asname.is_none() && alias.name != alias.bind.name {
                        fe.insn(Insn::Pop)?;
                        fe.string(&alias.bind.name)?;
                        fe.call(RuntimeEntry::ImportModule)?;
                    }
                    self.store_name(fe, alias.bind.id, &alias.bind.name)?;
                }
                Ok(())
            }
            StmtKind::ImportFrom { module, names, .. } => {
                fe.string(module)?;
                fe.call(RuntimeEntry::ImportModule)?;
                for alias in names {
                    fe.insn(Insn::Dup)?;
                    fe.string(&alias.name)?;
                    fe.call(RuntimeEntry::ImportFrom)?;
                    self.store_name(fe, alias.bind.id, &alias.bind.name)?;
                }
                fe.insn(Insn::Pop)
            }
            StmtKind::Expr(value) => {
                self.emit_expr(value, fe)?;
                fe.insn(Insn::Pop)
            }
            StmtKind::Break | StmtKind::Continue => {
                let Some(depth) = fe.unwind.iter().rposition(|u| matches!(u, Unwind::Loop { .. })) else {
                    return Err(CompileError::syntax(stmt.pos, "loop control outside loop"));
                };
                let Unwind::Loop { brk, cont } = fe.unwind[depth] else {
                    return Err(CompileError::internal(fe.scope.qualname.clone(), "loop entry vanished"));
                };
                self.exit_regions(fe, depth + 1)?;
                let target = if matches!(stmt.kind, StmtKind::Break) { brk } else { cont };
                fe.branch(Branch::Goto, target)?;
                self.resume_regions(fe, depth + 1)
            }
            StmtKind::Global(_) | StmtKind::Nonlocal(_) | StmtKind::Pass => Ok(()),
        }
    }

    /// Evaluate a test and leave its truth value as an int.
    pub(super) fn emit_condition(&mut self, fe: &mut FnEmitter<'a>, test: &'a Expr) -> Result<(), CompileError> {
        self.emit_expr(test, fe)?;
        fe.call(RuntimeEntry::Truth)
    }

    fn has_cleanup(&self, fe: &FnEmitter<'a>, depth: usize) -> bool {
        fe.unwind[depth..].iter().any(|u| match u {
            Unwind::Protected { cleanup, .. } => !matches!(cleanup, Cleanup::None),
            Unwind::Loop { .. } => false,
        })
    }

    /// Leave every protected region above `depth`: close its current
    /// segment and run its cleanup, innermost first. Each cleanup runs
    /// protected only by the regions outside it.
    fn exit_regions(&mut self, fe: &mut FnEmitter<'a>, depth: usize) -> Result<(), CompileError> {
        for i in (depth..fe.unwind.len()).rev() {
            let Unwind::Protected { start, handler, catch, cleanup } = fe.unwind[i] else {
                continue;
            };
            let end = fe.code.here()?;
            fe.code.handler(start, end, handler, catch);
            let saved = fe.unwind.split_off(i);
            match cleanup {
                Cleanup::None => {}
                Cleanup::Finally(body) => self.emit_block(body, fe)?,
                Cleanup::Exit(manager) => {
                    fe.aload(manager)?;
                    fe.insn(Insn::AconstNull)?;
                    fe.call(RuntimeEntry::Exit)?;
                    fe.insn(Insn::Pop)?;
                }
            }
            fe.unwind.extend(saved);
        }
        Ok(())
    }

    /// Reopen the regions closed by [`exit_regions`](Self::exit_regions)
    /// for the code following the jump.
    fn resume_regions(&mut self, fe: &mut FnEmitter<'a>, depth: usize) -> Result<(), CompileError> {
        if !fe.unwind[depth..].iter().any(|u| matches!(u, Unwind::Protected { .. })) {
            return Ok(());
        }
        let here = fe.code.here()?;
        for entry in &mut fe.unwind[depth..] {
            if let Unwind::Protected { start, .. } = entry {
                *start = here;
            }
        }
        Ok(())
    }

    fn emit_while(
        &mut self,
        fe: &mut FnEmitter<'a>,
        test: &'a Expr,
        body: &'a [Stmt],
        orelse: &'a [Stmt],
    ) -> Result<(), CompileError> {
        let top = fe.code.here()?;
        let exhausted = fe.label();
        let end = fe.label();
        self.emit_condition(fe, test)?;
        fe.branch(Branch::Ifeq, exhausted)?;
        fe.unwind.push(Unwind::Loop { brk: end, cont: top });
        self.emit_block(body, fe)?;
        fe.unwind.pop();
        fe.goto_unless_terminated(top)?;
        fe.bind(exhausted)?;
        self.emit_block(orelse, fe)?;
        fe.bind(end)
    }

    fn emit_for(
        &mut self,
        fe: &mut FnEmitter<'a>,
        target: &'a Expr,
        iter: &'a Expr,
        body: &'a [Stmt],
        orelse: &'a [Stmt],
    ) -> Result<(), CompileError> {
        self.emit_expr(iter, fe)?;
        fe.call(RuntimeEntry::Iter)?;
        let it = fe.temp();
        fe.astore(it)?;
        let top = fe.code.here()?;
        let exhausted = fe.label();
        let end = fe.label();
        fe.aload(it)?;
        fe.call(RuntimeEntry::Next)?;
        fe.insn(Insn::Dup)?;
        fe.branch(Branch::Ifnull, exhausted)?;
        self.store_target(fe, target)?;
        fe.unwind.push(Unwind::Loop { brk: end, cont: top });
        self.emit_block(body, fe)?;
        fe.unwind.pop();
        fe.goto_unless_terminated(top)?;
        fe.bind(exhausted)?;
        fe.insn(Insn::Pop)?;
        self.emit_block(orelse, fe)?;
        fe.bind(end)?;
        fe.release(it);
        Ok(())
    }

    fn emit_try_except(
        &mut self,
        fe: &mut FnEmitter<'a>,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
    ) -> Result<(), CompileError> {
        if handlers.is_empty() {
            self.emit_block(body, fe)?;
            return self.emit_block(orelse, fe);
        }
        let handler = fe.label();
        let end = fe.label();
        fe.open(handler, Some(abi::PY_EXCEPTION), Cleanup::None)?;
        self.emit_block(body, fe)?;
        fe.close()?;
        self.emit_block(orelse, fe)?;
        fe.goto_unless_terminated(end)?;

        fe.bind(handler)?;
        let exc = fe.temp();
        fe.astore(exc)?;
        for clause in handlers {
            let next = fe.label();
            if self.options.emit_line_numbers {
                fe.code.line(clause.pos.line);
            }
            if let Some(kind) = &clause.kind {
                fe.aload(exc)?;
                self.emit_expr(kind, fe)?;
                fe.call(RuntimeEntry::ExcMatch)?;
                fe.branch(Branch::Ifeq, next)?;
            }
            if let Some(name) = &clause.name {
                fe.aload(exc)?;
                fe.call(RuntimeEntry::ExceptionValue)?;
                self.store_name(fe, name.id, &name.name)?;
            }
            fe.active_exc.push(exc);
            self.emit_block(&clause.body, fe)?;
            fe.active_exc.pop();
            fe.goto_unless_terminated(end)?;
            fe.bind(next)?;
        }
        fe.aload(exc)?;
        fe.insn(Insn::Athrow)?;
        fe.release(exc);
        fe.bind(end)
    }

    fn emit_try_finally(
        &mut self,
        fe: &mut FnEmitter<'a>,
        body: &'a [Stmt],
        handlers: &'a [ExceptHandler],
        orelse: &'a [Stmt],
        finalbody: &'a [Stmt],
    ) -> Result<(), CompileError> {
        let handler = fe.label();
        let end = fe.label();
        fe.open(handler, None, Cleanup::Finally(finalbody))?;
        self.emit_try_except(fe, body, handlers, orelse)?;
        fe.close()?;
        if !fe.terminated() {
            self.emit_block(finalbody, fe)?;
            fe.goto_unless_terminated(end)?;
        }

        fe.bind(handler)?;
        let exc = fe.temp();
        fe.astore(exc)?;
        self.emit_block(finalbody, fe)?;
        if !fe.terminated() {
            fe.aload(exc)?;
            fe.insn(Insn::Athrow)?;
        }
        fe.release(exc);
        fe.bind(end)
    }

    fn emit_with(&mut self, fe: &mut FnEmitter<'a>, items: &'a [WithItem], body: &'a [Stmt]) -> Result<(), CompileError> {
        let Some((item, rest)) = items.split_first() else {
            return self.emit_block(body, fe);
        };
        self.emit_expr(&item.context, fe)?;
        fe.insn(Insn::Dup)?;
        let manager = fe.temp();
        fe.astore(manager)?;
        fe.call(RuntimeEntry::Enter)?;
        match &item.target {
            Some(target) => self.store_target(fe, target)?,
            None => fe.insn(Insn::Pop)?,
        }

        let handler = fe.label();
        let end = fe.label();
        fe.open(handler, None, Cleanup::Exit(manager))?;
        self.emit_with(fe, rest, body)?;
        fe.close()?;
        if !fe.terminated() {
            fe.aload(manager)?;
            fe.insn(Insn::AconstNull)?;
            fe.call(RuntimeEntry::Exit)?;
            fe.insn(Insn::Pop)?;
            fe.branch(Branch::Goto, end)?;
        }

        fe.bind(handler)?;
        let exc = fe.temp();
        fe.astore(exc)?;
        fe.aload(manager)?;
        fe.aload(exc)?;
        fe.call(RuntimeEntry::Exit)?;
        fe.branch(Branch::Ifne, end)?;
        fe.aload(exc)?;
        fe.insn(Insn::Athrow)?;
        fe.release(exc);
        fe.release(manager);
        fe.bind(end)
    }

    /// Store the value on top of the stack into an assignment target.
    pub(super) fn store_target(&mut self, fe: &mut FnEmitter<'a>, target: &'a Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Name { id, name } => self.store_name(fe, *id, name),
            ExprKind::Attribute { value, attr } => {
                self.emit_expr(value, fe)?;
                fe.insn(Insn::Swap)?;
                fe.string(attr)?;
                fe.insn(Insn::Swap)?;
                fe.call(RuntimeEntry::SetAttr)
            }
            ExprKind::Subscript { value, index } => {
                self.emit_expr(value, fe)?;
                fe.insn(Insn::Swap)?;
                self.emit_expr(index, fe)?;
                fe.insn(Insn::Swap)?;
                fe.call(RuntimeEntry::SetItem)
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                fe.iconst(items.len())?;
                fe.call(RuntimeEntry::Unpack)?;
                for (i, item) in items.iter().enumerate() {
                    fe.insn(Insn::Dup)?;
                    fe.iconst(i)?;
                    fe.insn(Insn::Aaload)?;
                    self.store_target(fe, item)?;
                }
                fe.insn(Insn::Pop)
            }
            _ => Err(CompileError::syntax(target.pos, "cannot assign to expression")),
        }
    }

    fn delete_target(&mut self, fe: &mut FnEmitter<'a>, target: &'a Expr) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Name { id, name } => self.delete_name(fe, *id, name, target.pos),
            ExprKind::Attribute { value, attr } => {
                self.emit_expr(value, fe)?;
                fe.string(attr)?;
                fe.call(RuntimeEntry::DelAttr)
            }
            ExprKind::Subscript { value, index } => {
                self.emit_expr(value, fe)?;
                self.emit_expr(index, fe)?;
                fe.call(RuntimeEntry::DelItem)
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.delete_target(fe, item)?;
                }
                Ok(())
            }
            _ => Err(CompileError::syntax(target.pos, "cannot delete expression")),
        }
    }

    fn emit_aug_assign(
        &mut self,
        fe: &mut FnEmitter<'a>,
        target: &'a Expr,
        op: pyjvm_bytecode::Operator,
        value: &'a Expr,
        pos: Pos,
    ) -> Result<(), CompileError> {
        let Dispatch::Operator { entry, code } = mapper::inplace(op, pos)? else {
            return Err(CompileError::internal(fe.scope.qualname.clone(), "in-place operator without a code"));
        };
        match &target.kind {
            ExprKind::Name { id, name } => {
                fe.insn(Insn::Iconst(code))?;
                self.load_name(fe, *id, name, target.pos)?;
                self.emit_expr(value, fe)?;
                fe.call(entry)?;
                self.store_name(fe, *id, name)
            }
            ExprKind::Attribute { value: object, attr } => {
                self.emit_expr(object, fe)?;
                let obj = fe.temp();
                fe.astore(obj)?;
                fe.insn(Insn::Iconst(code))?;
                fe.aload(obj)?;
                fe.string(attr)?;
                fe.call(RuntimeEntry::GetAttr)?;
                self.emit_expr(value, fe)?;
                fe.call(entry)?;
                fe.aload(obj)?;
                fe.insn(Insn::Swap)?;
                fe.string(attr)?;
                fe.insn(Insn::Swap)?;
                fe.call(RuntimeEntry::SetAttr)?;
                fe.release(obj);
                Ok(())
            }
            ExprKind::Subscript { value: object, index } => {
                self.emit_expr(object, fe)?;
                let obj = fe.temp();
                fe.astore(obj)?;
                self.emit_expr(index, fe)?;
                let key = fe.temp();
                fe.astore(key)?;
                fe.insn(Insn::Iconst(code))?;
                fe.aload(obj)?;
                fe.aload(key)?;
                fe.call(RuntimeEntry::GetItem)?;
                self.emit_expr(value, fe)?;
                fe.call(entry)?;
                fe.aload(obj)?;
                fe.insn(Insn::Swap)?;
                fe.aload(key)?;
                fe.insn(Insn::Swap)?;
                fe.call(RuntimeEntry::SetItem)?;
                fe.release(key);
                fe.release(obj);
                Ok(())
            }
            _ => Err(CompileError::syntax(target.pos, "illegal expression for augmented assignment")),
        }
    }
}
