//! Bytecode emission.
//!
//! A module becomes one unit whose static fields are the module globals and
//! whose `<clinit>` runs the module body. Every class statement becomes a
//! further unit holding the class object and the methods defined directly
//! in its body. Every other function body is a static method of the unit
//! its definition appears in. All dynamic operations are calls into the
//! runtime-support library.

mod code;
mod expr;
mod stmt;
mod unit;

use std::collections::{HashMap, HashSet};

use pyjvm_bytecode::abi;
use pyjvm_bytecode::{CompiledUnit, Insn, RuntimeEntry};
use tracing::{debug, debug_span};

use crate::ast::*;
use crate::error::CompileError;
use crate::options::CompilerOptions;
use crate::resolve::{Binding, Resolution, ScopeInfo, ScopeKind};

pub use code::{Branch, CodeBuilder, Label, Op};
pub use unit::{mangle, UnitBuilder};

/// Emit every unit of a resolved, checked module. The module unit comes
/// first, class units follow in definition order.
pub fn emit_module(
    module: &Module,
    resolution: &Resolution,
    source_file: &str,
    options: &CompilerOptions,
) -> Result<Vec<CompiledUnit>, CompileError> {
    let _span = debug_span!("emit", module = %module.name).entered();
    let mut emitter = Emitter::new(module, resolution, source_file, options)?;
    emitter.emit_module_body(module)?;
    debug!(units = emitter.units.len(), "emitted module");
    Ok(emitter.units.into_iter().map(UnitBuilder::finish).collect())
}

/// Cleanup that must run when control leaves a protected region.
#[derive(Debug, Clone, Copy)]
enum Cleanup<'a> {
    None,
    Finally(&'a [Stmt]),
    /// `__exit__` of the context manager held in this slot.
    Exit(u16),
}

#[derive(Debug, Clone, Copy)]
enum Unwind<'a> {
    Loop { brk: Label, cont: Label },
    Protected { start: Label, handler: Label, catch: Option<&'static str>, cleanup: Cleanup<'a> },
}

enum Body<'a> {
    Block(&'a [Stmt]),
    Expr(&'a Expr),
}

/// Per-method emission state.
struct FnEmitter<'a> {
    scope: &'a ScopeInfo,
    unit: usize,
    code: CodeBuilder,
    unwind: Vec<Unwind<'a>>,
    /// Slots holding the exception of each enclosing `except` clause.
    active_exc: Vec<u16>,
    next_temp: u16,
    free_temps: Vec<u16>,
}

impl<'a> FnEmitter<'a> {
    fn new(scope: &'a ScopeInfo, unit: usize, method: &str) -> Self {
        FnEmitter {
            scope,
            unit,
            code: CodeBuilder::new(method, scope.n_slots),
            unwind: Vec::new(),
            active_exc: Vec::new(),
            next_temp: scope.n_slots,
            free_temps: Vec::new(),
        }
    }

    fn op(&mut self, op: Op) -> Result<(), CompileError> {
        self.code.push(op)
    }

    fn insn(&mut self, insn: Insn) -> Result<(), CompileError> {
        self.code.insn(insn)
    }

    fn call(&mut self, entry: RuntimeEntry) -> Result<(), CompileError> {
        self.code.runtime(entry)
    }

    fn branch(&mut self, kind: Branch, label: Label) -> Result<(), CompileError> {
        self.code.branch(kind, label)
    }

    fn bind(&mut self, label: Label) -> Result<(), CompileError> {
        self.code.bind(label)
    }

    fn label(&mut self) -> Label {
        self.code.new_label()
    }

    fn aload(&mut self, slot: u16) -> Result<(), CompileError> {
        self.insn(Insn::Aload(slot))
    }

    fn astore(&mut self, slot: u16) -> Result<(), CompileError> {
        self.insn(Insn::Astore(slot))
    }

    fn iconst(&mut self, value: usize) -> Result<(), CompileError> {
        let value = i16::try_from(value)
            .map_err(|_| CompileError::internal(self.scope.qualname.clone(), format!("constant {value} too large")))?;
        self.insn(Insn::Iconst(value))
    }

    fn string(&mut self, s: &str) -> Result<(), CompileError> {
        self.op(Op::Str(s.to_string()))
    }

    fn none(&mut self) -> Result<(), CompileError> {
        self.op(Op::GetStatic { class: abi::DYN.to_string(), field: abi::NONE_FIELD.to_string() })
    }

    fn new_array(&mut self, class: &'static str, len: usize) -> Result<(), CompileError> {
        self.iconst(len)?;
        self.op(Op::NewArray(class))
    }

    fn new_cell(&mut self, slot: u16) -> Result<(), CompileError> {
        self.op(Op::NewCell)?;
        self.insn(Insn::Dup)?;
        self.call(RuntimeEntry::CellInit)?;
        self.astore(slot)
    }

    fn temp(&mut self) -> u16 {
        self.free_temps.pop().unwrap_or_else(|| {
            let slot = self.next_temp;
            self.next_temp += 1;
            slot
        })
    }

    fn release(&mut self, slot: u16) {
        self.free_temps.push(slot);
    }

    fn terminated(&self) -> bool {
        self.code.terminated()
    }

    fn goto_unless_terminated(&mut self, label: Label) -> Result<(), CompileError> {
        if self.terminated() {
            Ok(())
        } else {
            self.branch(Branch::Goto, label)
        }
    }

    /// Start a protected region whose exceptions land on `handler`.
    fn open(&mut self, handler: Label, catch: Option<&'static str>, cleanup: Cleanup<'a>) -> Result<(), CompileError> {
        let start = self.code.here()?;
        self.unwind.push(Unwind::Protected { start, handler, catch, cleanup });
        Ok(())
    }

    /// End the innermost protected region at the current position.
    fn close(&mut self) -> Result<(), CompileError> {
        match self.unwind.pop() {
            Some(Unwind::Protected { start, handler, catch, .. }) => {
                let end = self.code.here()?;
                self.code.handler(start, end, handler, catch);
                Ok(())
            }
            _ => Err(CompileError::internal(self.scope.qualname.clone(), "unbalanced protected region")),
        }
    }

    /// Check that slot `index` of this scope's capture record holds `name`.
    fn capture(&self, index: u16, name: &str) -> Result<u16, CompileError> {
        match self.scope.captures.get(usize::from(index)) {
            Some(recorded) if recorded == name => Ok(index),
            Some(recorded) => Err(CompileError::internal(
                self.scope.qualname.clone(),
                format!("capture slot {index} holds '{recorded}', not '{name}'"),
            )),
            None => Err(CompileError::internal(
                self.scope.qualname.clone(),
                format!("capture index {index} outside a record of {}", self.scope.captures.len()),
            )),
        }
    }

    /// Check that cell `slot` of this scope belongs to `name`.
    fn cell(&self, slot: u16, name: &str) -> Result<u16, CompileError> {
        match self.scope.locals.iter().find(|v| v.cell && v.slot == slot) {
            Some(var) if var.name == name => Ok(slot),
            Some(var) => Err(CompileError::internal(
                self.scope.qualname.clone(),
                format!("cell slot {slot} holds '{}', not '{name}'", var.name),
            )),
            None => Err(CompileError::internal(self.scope.qualname.clone(), format!("slot {slot} is not a cell"))),
        }
    }
}

pub(crate) struct Emitter<'a> {
    resolution: &'a Resolution,
    options: &'a CompilerOptions,
    module_unit: String,
    source_file: Option<String>,
    units: Vec<UnitBuilder>,
    unit_names: HashSet<String>,
    class_units: HashMap<NodeId, usize>,
}

impl<'a> Emitter<'a> {
    fn new(
        module: &Module,
        resolution: &'a Resolution,
        source_file: &str,
        options: &'a CompilerOptions,
    ) -> Result<Self, CompileError> {
        let module_unit = module.name.replace('.', "/");
        let source_file = options.source_file_attribute.then(|| source_file.to_string());
        let unit = UnitBuilder::module(&module_unit, &resolution.module_fields, source_file.as_deref())?;
        Ok(Emitter {
            resolution,
            options,
            unit_names: HashSet::from([module_unit.clone()]),
            module_unit,
            source_file,
            units: vec![unit],
            class_units: HashMap::new(),
        })
    }

    fn scope(&self, id: NodeId) -> Result<&'a ScopeInfo, CompileError> {
        self.resolution
            .scope(id)
            .ok_or_else(|| CompileError::internal("emit", format!("no scope recorded for node {}", id.0)))
    }

    fn binding(&self, id: NodeId, name: &str) -> Result<&'a Binding, CompileError> {
        self.resolution
            .binding(id)
            .ok_or_else(|| CompileError::internal("emit", format!("no binding recorded for '{name}'")))
    }

    fn emit_module_body(&mut self, module: &'a Module) -> Result<(), CompileError> {
        let scope = self.scope(module.scope)?;
        let mut fe = FnEmitter::new(scope, 0, abi::CLINIT);
        let named = fe.label();
        fe.op(self.global(abi::MODULE_NAME, false))?;
        fe.branch(Branch::Ifnonnull, named)?;
        fe.string(&module.name)?;
        fe.call(RuntimeEntry::Str)?;
        fe.op(self.global(abi::MODULE_NAME, true))?;
        fe.bind(named)?;
        self.prologue(&mut fe)?;
        self.emit_block(&module.body, &mut fe)?;
        if !fe.terminated() {
            fe.insn(Insn::Return)?;
        }
        self.units[0].add(abi::CLINIT, abi::CLINIT_DESCRIPTOR, fe.code, None, true)
    }

    fn global(&self, name: &str, store: bool) -> Op {
        let (class, field) = (self.module_unit.clone(), name.to_string());
        if store {
            Op::PutStatic { class, field }
        } else {
            Op::GetStatic { class, field }
        }
    }

    /// Argument unpacking and local initialisation at method entry.
    fn prologue(&mut self, fe: &mut FnEmitter<'a>) -> Result<(), CompileError> {
        let scope = fe.scope;
        if scope.kind == ScopeKind::Class {
            fe.aload(abi::ARGS_SLOT)?;
            fe.iconst(0)?;
            fe.insn(Insn::Aaload)?;
            fe.astore(abi::CLASS_SLOT)?;
        }
        for (i, var) in scope.locals.iter().enumerate() {
            let param = i < scope.params.len();
            if var.cell {
                fe.new_cell(var.slot)?;
            }
            match (param, var.cell) {
                (true, true) => {
                    fe.aload(var.slot)?;
                    fe.aload(abi::ARGS_SLOT)?;
                    fe.iconst(i)?;
                    fe.insn(Insn::Aaload)?;
                    fe.call(RuntimeEntry::CellSet)?;
                }
                (true, false) => {
                    fe.aload(abi::ARGS_SLOT)?;
                    fe.iconst(i)?;
                    fe.insn(Insn::Aaload)?;
                    fe.astore(var.slot)?;
                }
                (false, true) => {}
                (false, false) => {
                    fe.insn(Insn::AconstNull)?;
                    fe.astore(var.slot)?;
                }
            }
        }
        Ok(())
    }

    /// Unit receiving the method of a function defined in `fe`'s scope.
    fn function_unit(&self, fe: &FnEmitter<'a>) -> usize {
        if fe.scope.kind == ScopeKind::Class {
            self.class_units.get(&fe.scope.id).copied().unwrap_or(fe.unit)
        } else {
            fe.unit
        }
    }

    fn unique_unit(&mut self, base: String) -> String {
        let mut name = base.clone();
        let mut n = 1;
        while self.unit_names.contains(&name) {
            name = format!("{base}${n}");
            n += 1;
        }
        self.unit_names.insert(name.clone());
        name
    }

    /// Compile a function body into its own method and push the function
    /// object built from it.
    fn emit_function_object(
        &mut self,
        fe: &mut FnEmitter<'a>,
        scope_id: NodeId,
        params: &'a [Param],
        body: Body<'a>,
    ) -> Result<(), CompileError> {
        let scope = self.scope(scope_id)?;
        let unit = self.function_unit(fe);
        let method = self.units[unit].reserve(&mangle(&scope.qualname));

        let mut inner = FnEmitter::new(scope, unit, &method);
        self.prologue(&mut inner)?;
        match body {
            Body::Block(stmts) => {
                self.emit_block(stmts, &mut inner)?;
                if !inner.terminated() {
                    inner.none()?;
                    inner.insn(Insn::Areturn)?;
                }
            }
            Body::Expr(expr) => {
                self.emit_expr(expr, &mut inner)?;
                inner.insn(Insn::Areturn)?;
            }
        }
        let captures = (!scope.captures.is_empty()).then_some(scope.captures.as_slice());
        self.units[unit].add(&method, abi::FUNCTION_DESCRIPTOR, inner.code, captures, false)?;

        fe.string(self.units[unit].name())?;
        fe.string(&method)?;
        fe.string(&scope.qualname)?;
        self.string_array(fe, params.iter().map(|p| p.name.as_str()))?;
        let defaults: Vec<&Expr> = params.iter().filter_map(|p| p.default.as_ref()).collect();
        fe.new_array(abi::PY_OBJECT, defaults.len())?;
        for (i, default) in defaults.into_iter().enumerate() {
            fe.insn(Insn::Dup)?;
            fe.iconst(i)?;
            self.emit_expr(default, fe)?;
            fe.insn(Insn::Aastore)?;
        }
        self.capture_array(fe, scope)?;
        fe.call(RuntimeEntry::MakeFunction)
    }

    fn emit_class(&mut self, fe: &mut FnEmitter<'a>, def: &'a ClassDef) -> Result<(), CompileError> {
        let scope = self.scope(def.scope)?;
        let unit_name = self.unique_unit(format!("{}${}", self.module_unit, mangle(&scope.qualname)));
        let unit = self.units.len();
        self.units.push(UnitBuilder::class(&unit_name, self.source_file.as_deref())?);
        self.class_units.insert(def.scope, unit);

        let mut body = FnEmitter::new(scope, unit, abi::CLASS_BODY);
        self.prologue(&mut body)?;
        self.emit_block(&def.body, &mut body)?;
        if !body.terminated() {
            body.none()?;
            body.insn(Insn::Areturn)?;
        }
        let captures = (!scope.captures.is_empty()).then_some(scope.captures.as_slice());
        self.units[unit].add(abi::CLASS_BODY, abi::FUNCTION_DESCRIPTOR, body.code, captures, true)?;

        fe.string(&unit_name)?;
        fe.string(&def.name.name)?;
        self.expr_array(fe, &def.bases)?;
        self.capture_array(fe, scope)?;
        fe.call(RuntimeEntry::MakeClass)
    }

    /// Push the capture record handed to a nested scope.
    fn capture_array(&mut self, fe: &mut FnEmitter<'a>, scope: &ScopeInfo) -> Result<(), CompileError> {
        if scope.capture_sources.len() != scope.captures.len() {
            return Err(CompileError::internal(
                scope.qualname.clone(),
                format!(
                    "{} captured names but {} capture sources",
                    scope.captures.len(),
                    scope.capture_sources.len()
                ),
            ));
        }
        fe.new_array(abi::CELL, scope.capture_sources.len())?;
        for (i, source) in scope.capture_sources.iter().enumerate() {
            fe.insn(Insn::Dup)?;
            fe.iconst(i)?;
            let name = &scope.captures[i];
            match source {
                Binding::Cell(slot) => {
                    let slot = fe.cell(*slot, name)?;
                    fe.aload(slot)?
                }
                Binding::Free(index) => {
                    let index = fe.capture(*index, name)?;
                    fe.aload(abi::CAPTURES_SLOT)?;
                    fe.iconst(usize::from(index))?;
                    fe.insn(Insn::Aaload)?;
                }
                other => {
                    return Err(CompileError::internal(
                        scope.qualname.clone(),
                        format!("capture '{}' has non-cell source {other:?}", scope.captures[i]),
                    ))
                }
            }
            fe.insn(Insn::Aastore)?;
        }
        Ok(())
    }

    fn string_array<'s>(
        &mut self,
        fe: &mut FnEmitter<'a>,
        items: impl ExactSizeIterator<Item = &'s str>,
    ) -> Result<(), CompileError> {
        fe.new_array(abi::JAVA_STRING, items.len())?;
        for (i, item) in items.enumerate() {
            fe.insn(Insn::Dup)?;
            fe.iconst(i)?;
            fe.string(item)?;
            fe.insn(Insn::Aastore)?;
        }
        Ok(())
    }

    fn expr_array(&mut self, fe: &mut FnEmitter<'a>, items: &'a [Expr]) -> Result<(), CompileError> {
        fe.new_array(abi::PY_OBJECT, items.len())?;
        for (i, item) in items.iter().enumerate() {
            fe.insn(Insn::Dup)?;
            fe.iconst(i)?;
            self.emit_expr(item, fe)?;
            fe.insn(Insn::Aastore)?;
        }
        Ok(())
    }

    /// Call each decorator on the stack with the object above it,
    /// innermost first.
    fn apply_decorators(&mut self, fe: &mut FnEmitter<'a>, count: usize) -> Result<(), CompileError> {
        for _ in 0..count {
            let t = fe.temp();
            fe.astore(t)?;
            fe.new_array(abi::PY_OBJECT, 1)?;
            fe.insn(Insn::Dup)?;
            fe.iconst(0)?;
            fe.aload(t)?;
            fe.insn(Insn::Aastore)?;
            fe.call(RuntimeEntry::Call)?;
            fe.release(t);
        }
        Ok(())
    }

    fn load_name(&mut self, fe: &mut FnEmitter<'a>, id: NodeId, name: &str, pos: Pos) -> Result<(), CompileError> {
        match self.binding(id, name)? {
            Binding::Local(slot) => {
                fe.aload(*slot)?;
                fe.string(name)?;
                fe.call(RuntimeEntry::CheckLocal)
            }
            Binding::Cell(slot) => {
                fe.aload(*slot)?;
                fe.call(RuntimeEntry::CellGet)?;
                fe.string(name)?;
                fe.call(RuntimeEntry::CheckLocal)
            }
            Binding::Free(index) => {
                let index = fe.capture(*index, name)?;
                fe.aload(abi::CAPTURES_SLOT)?;
                fe.iconst(usize::from(index))?;
                fe.insn(Insn::Aaload)?;
                fe.call(RuntimeEntry::CellGet)?;
                fe.string(name)?;
                fe.call(RuntimeEntry::CheckLocal)
            }
            Binding::Global(field) => {
                fe.op(self.global(field, false))?;
                fe.string(name)?;
                fe.call(RuntimeEntry::CheckGlobal)
            }
            Binding::ClassAttr(attr) => {
                fe.aload(abi::CLASS_SLOT)?;
                fe.string(attr)?;
                fe.call(RuntimeEntry::GetAttr)
            }
            Binding::Builtin(builtin) => {
                fe.string(builtin)?;
                fe.call(RuntimeEntry::Builtin)
            }
            Binding::Super => Err(CompileError::unsupported(pos, "'super' other than as a zero-argument call")),
        }
    }

    /// Store the value on top of the stack into a name.
    fn store_name(&mut self, fe: &mut FnEmitter<'a>, id: NodeId, name: &str) -> Result<(), CompileError> {
        match self.binding(id, name)? {
            Binding::Local(slot) => fe.astore(*slot),
            Binding::Cell(slot) => {
                fe.aload(*slot)?;
                fe.insn(Insn::Swap)?;
                fe.call(RuntimeEntry::CellSet)
            }
            Binding::Free(index) => {
                let index = fe.capture(*index, name)?;
                fe.aload(abi::CAPTURES_SLOT)?;
                fe.iconst(usize::from(index))?;
                fe.insn(Insn::Aaload)?;
                fe.insn(Insn::Swap)?;
                fe.call(RuntimeEntry::CellSet)
            }
            Binding::Global(field) => fe.op(self.global(field, true)),
            Binding::ClassAttr(attr) => {
                fe.aload(abi::CLASS_SLOT)?;
                fe.insn(Insn::Swap)?;
                fe.string(attr)?;
                fe.insn(Insn::Swap)?;
                fe.call(RuntimeEntry::Publish)
            }
            other => Err(CompileError::internal(
                fe.scope.qualname.clone(),
                format!("cannot store '{name}' through {other:?}"),
            )),
        }
    }

    /// Unbind a name, raising if it is not bound.
    fn delete_name(&mut self, fe: &mut FnEmitter<'a>, id: NodeId, name: &str, pos: Pos) -> Result<(), CompileError> {
        let binding = self.binding(id, name)?;
        if let Binding::ClassAttr(attr) = binding {
            fe.aload(abi::CLASS_SLOT)?;
            fe.string(attr)?;
            return fe.call(RuntimeEntry::DelAttr);
        }
        self.load_name(fe, id, name, pos)?;
        fe.insn(Insn::Pop)?;
        fe.insn(Insn::AconstNull)?;
        self.store_name(fe, id, name)
    }
}
