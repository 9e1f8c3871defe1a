//! Method-body builder.
//!
//! Lowering appends symbolic operations; pool indices, byte offsets and
//! branch targets are only fixed when the body is finished against the
//! constant pool of the unit that will own it.

use pyjvm_bytecode::abi::{self, InvokeKind};
use pyjvm_bytecode::insn;
use pyjvm_bytecode::verify::analyze_stack;
use pyjvm_bytecode::{Code, ConstantPool, ExceptionEntry, Insn, LineNumber, RuntimeEntry};

use crate::error::{fault, CompileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Ifeq,
    Ifne,
    Ifnull,
    Ifnonnull,
    Goto,
}

impl Branch {
    fn insn(self, target: u32) -> Insn {
        match self {
            Branch::Ifeq => Insn::Ifeq(target),
            Branch::Ifne => Insn::Ifne(target),
            Branch::Ifnull => Insn::Ifnull(target),
            Branch::Ifnonnull => Insn::Ifnonnull(target),
            Branch::Goto => Insn::Goto(target),
        }
    }
}

/// One operation of a method body before pool resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Instruction without pool operand or branch target.
    Insn(Insn),
    Long(i64),
    Double(f64),
    Str(String),
    Runtime(RuntimeEntry),
    GetStatic { class: String, field: String },
    PutStatic { class: String, field: String },
    NewArray(&'static str),
    NewCell,
    Branch(Branch, Label),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Empty,
    Emitting,
    Finalizing,
    Sealed,
}

#[derive(Debug, Clone)]
struct Handler {
    start: Label,
    end: Label,
    handler: Label,
    catch: Option<&'static str>,
}

/// Builder for one method body. Moves from empty through emitting to
/// sealed; anything appended after sealing is a compiler fault.
#[derive(Debug)]
pub struct CodeBuilder {
    method: String,
    state: State,
    ops: Vec<Op>,
    labels: Vec<Option<usize>>,
    handlers: Vec<Handler>,
    lines: Vec<(usize, u16)>,
    max_locals: u16,
}

impl CodeBuilder {
    pub fn new(method: impl Into<String>, max_locals: u16) -> Self {
        CodeBuilder {
            method: method.into(),
            state: State::Empty,
            ops: Vec::new(),
            labels: Vec::new(),
            handlers: Vec::new(),
            lines: Vec::new(),
            max_locals,
        }
    }

    fn fault(&self, msg: impl Into<String>) -> CompileError {
        CompileError::internal(format!("method {}", self.method), msg)
    }

    fn writable(&mut self) -> Result<(), CompileError> {
        match self.state {
            State::Empty => {
                self.state = State::Emitting;
                Ok(())
            }
            State::Emitting => Ok(()),
            State::Finalizing | State::Sealed => Err(self.fault("emission after the body was sealed")),
        }
    }

    pub fn push(&mut self, op: Op) -> Result<(), CompileError> {
        self.writable()?;
        if let Op::Insn(Insn::Aload(slot) | Insn::Astore(slot)) = op {
            self.max_locals = self.max_locals.max(slot + 1);
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn insn(&mut self, insn: Insn) -> Result<(), CompileError> {
        if insn.pool_index().is_some() || insn.branch_target().is_some() {
            return Err(self.fault(format!("{} needs a symbolic operand", insn.mnemonic())));
        }
        self.push(Op::Insn(insn))
    }

    pub fn runtime(&mut self, entry: RuntimeEntry) -> Result<(), CompileError> {
        self.push(Op::Runtime(entry))
    }

    pub fn branch(&mut self, kind: Branch, label: Label) -> Result<(), CompileError> {
        self.push(Op::Branch(kind, label))
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the next operation appended.
    pub fn bind(&mut self, label: Label) -> Result<(), CompileError> {
        self.writable()?;
        match self.labels.get_mut(label.0) {
            Some(slot @ None) => {
                *slot = Some(self.ops.len());
                Ok(())
            }
            Some(Some(_)) => Err(self.fault(format!("label {} bound twice", label.0))),
            None => Err(self.fault(format!("unknown label {}", label.0))),
        }
    }

    pub fn here(&mut self) -> Result<Label, CompileError> {
        let label = self.new_label();
        self.bind(label)?;
        Ok(label)
    }

    /// Protect `start..end`; `catch` of `None` catches everything.
    pub fn handler(&mut self, start: Label, end: Label, handler: Label, catch: Option<&'static str>) {
        self.handlers.push(Handler { start, end, handler, catch });
    }

    pub fn line(&mut self, line: usize) {
        let line = u16::try_from(line).unwrap_or(u16::MAX);
        let at = self.ops.len();
        match self.lines.last_mut() {
            Some((_, last)) if *last == line => {}
            Some((last_at, last)) if *last_at == at => *last = line,
            _ => self.lines.push((at, line)),
        }
    }

    /// Whether the last operation ends control flow.
    pub fn terminated(&self) -> bool {
        let bound_here = self.labels.iter().any(|l| *l == Some(self.ops.len()));
        !bound_here
            && matches!(
                self.ops.last(),
                Some(Op::Insn(Insn::Areturn | Insn::Return | Insn::Athrow) | Op::Branch(Branch::Goto, _))
            )
    }

    fn position(&self, label: Label) -> Result<usize, CompileError> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| self.fault(format!("label {} never bound", label.0)))
    }

    /// Resolve the body against `pool` and seal the builder.
    pub fn finish(&mut self, pool: &mut ConstantPool) -> Result<Code, CompileError> {
        match self.state {
            State::Emitting => self.state = State::Finalizing,
            State::Empty => return Err(self.fault("empty method body")),
            State::Finalizing | State::Sealed => return Err(self.fault("body finished twice")),
        }
        let context = format!("method {}", self.method);
        let mut insns = Vec::with_capacity(self.ops.len());
        let mut fixups = Vec::new();
        for op in &self.ops {
            let insn = match op {
                Op::Insn(insn) => insn.clone(),
                Op::Long(v) => Insn::Ldc2W(pool.long(*v).map_err(fault(&context))?),
                Op::Double(v) => Insn::Ldc2W(pool.double(*v).map_err(fault(&context))?),
                Op::Str(s) => Insn::Ldc(pool.string(s).map_err(fault(&context))?),
                Op::Runtime(entry) => {
                    let m = entry.method();
                    let index = pool.method_ref(m.class, m.name, m.descriptor).map_err(fault(&context))?;
                    match m.kind {
                        InvokeKind::Static => Insn::Invokestatic(index),
                        InvokeKind::Virtual => Insn::Invokevirtual(index),
                        InvokeKind::Special => Insn::Invokespecial(index),
                    }
                }
                Op::GetStatic { class, field } => {
                    Insn::Getstatic(pool.field_ref(class, field, abi::OBJ).map_err(fault(&context))?)
                }
                Op::PutStatic { class, field } => {
                    Insn::Putstatic(pool.field_ref(class, field, abi::OBJ).map_err(fault(&context))?)
                }
                Op::NewArray(class) => Insn::Anewarray(pool.class(class).map_err(fault(&context))?),
                Op::NewCell => Insn::New(pool.class(abi::CELL).map_err(fault(&context))?),
                Op::Branch(kind, label) => {
                    fixups.push((insns.len(), *label));
                    kind.insn(0)
                }
            };
            insns.push(insn);
        }

        let pcs = insn::offsets(&insns);
        let code_len = pcs.last().copied().unwrap_or(0);
        if code_len > u32::from(u16::MAX) {
            return Err(self.fault(format!("body is {code_len} bytes, over the 65535 byte limit")));
        }
        let pc_of = |label: Label| -> Result<u32, CompileError> { Ok(pcs[self.position(label)?]) };

        for (index, label) in fixups {
            let at = self.position(label)?;
            if at >= insns.len() {
                return Err(self.fault(format!("branch to label {} past the last instruction", label.0)));
            }
            let target = pcs[at];
            insns[index] = insns[index].clone().map_target(|_| target);
        }

        let mut exception_table = Vec::new();
        for h in &self.handlers {
            let start = pc_of(h.start)?;
            let end = pc_of(h.end)?;
            if start >= end {
                continue;
            }
            let catch_type = match h.catch {
                Some(class) => pool.class(class).map_err(fault(&context))?,
                None => 0,
            };
            exception_table.push(ExceptionEntry {
                start_pc: start as u16,
                end_pc: end as u16,
                handler_pc: pc_of(h.handler)? as u16,
                catch_type,
            });
        }

        let mut line_numbers: Vec<LineNumber> = Vec::new();
        for &(at, line) in &self.lines {
            if at >= insns.len() {
                continue;
            }
            let start_pc = pcs[at] as u16;
            match line_numbers.last_mut() {
                Some(last) if last.start_pc == start_pc => last.line = line,
                _ => line_numbers.push(LineNumber { start_pc, line }),
            }
        }

        let mut code = Code { max_stack: 0, max_locals: self.max_locals, insns, exception_table, line_numbers };
        code.max_stack = analyze_stack(pool, &code).map_err(|msg| self.fault(msg))?;
        self.state = State::Sealed;
        Ok(code)
    }
}
