//! Reference loader and interpreter for compiled units.
//!
//! Units are verified and linked when loaded: every member reference is
//! resolved once, either to a runtime-support entry point or to a method or
//! field of another unit. Execution then walks the decoded instruction list
//! of each method, one host frame per invoked method.

use std::cell::{Cell as StdCell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use indexmap::IndexMap;
use pyjvm_bytecode::abi::{self, InvokeKind};
use pyjvm_bytecode::descriptor::parse_method_descriptor;
use pyjvm_bytecode::verify::verify_unit;
use pyjvm_bytecode::{Code, CompiledUnit, Constant, ConstantPool, Insn, MemberKind, RuntimeEntry};
use serde::Serialize;
use tracing::{debug, trace};

use crate::builtins::{self, TypeTable};
use crate::error::{PyErr, VmError};
use crate::value::{Cell, ModuleKind, ModuleObj, Value};

const MAX_CALL_DEPTH: usize = 256;
const DEFAULT_MAX_STEPS: u64 = 50_000_000;

/// A host-level operand: what the emitted instructions push, store and pass.
#[derive(Debug, Clone)]
pub enum Slot {
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Str(Rc<str>),
    Obj(Value),
    Array(Rc<RefCell<Vec<Slot>>>),
    Cell(Cell),
    Exc(PyErr),
}

impl Slot {
    pub fn array(items: Vec<Slot>) -> Slot {
        Slot::Array(Rc::new(RefCell::new(items)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Slot::Null => "null",
            Slot::Int(_) => "int",
            Slot::Long(_) => "long",
            Slot::Double(_) => "double",
            Slot::Str(_) => "string",
            Slot::Obj(_) => "object",
            Slot::Array(_) => "array",
            Slot::Cell(_) => "cell",
            Slot::Exc(_) => "exception",
        }
    }

    pub(crate) fn int(self) -> Result<i32, VmError> {
        match self {
            Slot::Int(i) => Ok(i),
            other => Err(VmError::OperandType { expected: "int", got: other.kind() }),
        }
    }

    pub(crate) fn into_array(self) -> Result<Rc<RefCell<Vec<Slot>>>, VmError> {
        match self {
            Slot::Array(a) => Ok(a),
            other => Err(VmError::OperandType { expected: "array", got: other.kind() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    NotStarted,
    InProgress,
    Done,
}

#[derive(Debug, Clone)]
enum Link {
    Native { entry: RuntimeEntry, argc: usize, returns: bool },
    Method { class: Rc<str>, name: Rc<str>, descriptor: Rc<str>, argc: usize, returns: bool },
    Field { class: Rc<str>, name: Rc<str> },
}

pub(crate) struct MethodBody {
    name: String,
    code: Code,
    offsets: Vec<u32>,
}

impl MethodBody {
    fn index_of(&self, pc: u32) -> Result<usize, VmError> {
        self.offsets.binary_search(&pc).map_err(|_| VmError::InvalidBranch(pc))
    }
}

/// A verified, linked unit with its static state.
pub struct LoadedUnit {
    pub name: String,
    pool: ConstantPool,
    methods: HashMap<(String, String), Rc<MethodBody>>,
    links: HashMap<u16, Link>,
    constants: HashMap<u16, Slot>,
    statics: RefCell<HashMap<String, Slot>>,
    state: StdCell<InitState>,
    host: bool,
}

impl LoadedUnit {
    fn new(unit: CompiledUnit) -> Result<Self, VmError> {
        let name = unit.name()?.to_string();
        let host = unit.super_name()? != abi::PY_INSTANCE && !unit.field_names()?.contains(&abi::MODULE_NAME);
        let mut methods = HashMap::new();
        for method in &unit.methods {
            let Some(code) = &method.code else { continue };
            let method_name = unit.pool.get_utf8(method.name)?.to_string();
            let descriptor = unit.pool.get_utf8(method.descriptor)?.to_string();
            let body = MethodBody {
                name: format!("{name}.{method_name}"),
                offsets: code.offsets(),
                code: code.clone(),
            };
            methods.insert((method_name, descriptor), Rc::new(body));
        }
        let mut statics = HashMap::new();
        for field in unit.field_names()? {
            statics.insert(field.to_string(), Slot::Null);
        }
        let (links, constants) = link(&unit.pool)?;
        Ok(LoadedUnit {
            name,
            pool: unit.pool,
            methods,
            links,
            constants,
            statics: RefCell::new(statics),
            state: StdCell::new(InitState::NotStarted),
            host,
        })
    }

    fn method(&self, name: &str, descriptor: &str) -> Option<Rc<MethodBody>> {
        self.methods.get(&(name.to_string(), descriptor.to_string())).cloned()
    }

    /// Whether the unit was produced by something other than the compiler:
    /// neither a module unit nor a class unit.
    pub fn is_host(&self) -> bool {
        self.host
    }

    /// Descriptors of the methods called `name`, in a stable order.
    pub(crate) fn overloads(&self, name: &str) -> Vec<String> {
        let mut found: Vec<String> =
            self.methods.keys().filter(|(n, _)| n == name).map(|(_, d)| d.clone()).collect();
        found.sort();
        found
    }

    fn link(&self, index: u16) -> Result<&Link, VmError> {
        self.links
            .get(&index)
            .ok_or(VmError::OperandType { expected: "member reference", got: "constant" })
    }

    fn constant(&self, index: u16) -> Result<Slot, VmError> {
        self.constants
            .get(&index)
            .cloned()
            .ok_or(VmError::OperandType { expected: "loadable constant", got: "constant" })
    }

    pub fn get_static(&self, name: &str) -> Slot {
        self.statics.borrow().get(name).cloned().unwrap_or(Slot::Null)
    }

    pub fn has_static(&self, name: &str) -> bool {
        self.statics.borrow().contains_key(name)
    }

    pub fn set_static(&self, name: &str, value: Slot) {
        self.statics.borrow_mut().insert(name.to_string(), value);
    }

    /// Static fields holding a value, in no particular order.
    pub fn bound_statics(&self) -> Vec<(String, Value)> {
        self.statics
            .borrow()
            .iter()
            .filter_map(|(k, v)| match v {
                Slot::Obj(v) => Some((k.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    fn catches(&self, catch_type: u16) -> bool {
        catch_type == 0 || self.pool.get_class(catch_type).is_ok_and(|c| c == abi::PY_EXCEPTION)
    }
}

fn link(pool: &ConstantPool) -> Result<(HashMap<u16, Link>, HashMap<u16, Slot>), VmError> {
    let mut links = HashMap::new();
    let mut constants = HashMap::new();
    for (index, constant) in pool.iter() {
        match constant {
            Constant::Integer(i) => {
                constants.insert(index, Slot::Int(*i));
            }
            Constant::Long(l) => {
                constants.insert(index, Slot::Long(*l));
            }
            Constant::Double(bits) => {
                constants.insert(index, Slot::Double(f64::from_bits(*bits)));
            }
            Constant::String(_) => {
                constants.insert(index, Slot::Str(Rc::from(pool.get_string(index)?)));
            }
            Constant::Fieldref(..) | Constant::Methodref(..) | Constant::InterfaceMethodref(..) => {
                let member = pool.get_member(index)?;
                let link = if member.kind == MemberKind::Field {
                    Link::Field { class: Rc::from(member.class), name: Rc::from(member.name) }
                } else if member.class.starts_with("pylib/") {
                    let entry = RuntimeEntry::from_member(member.class, member.name, member.descriptor)
                        .ok_or_else(|| VmError::UnknownNative {
                            class: member.class.to_string(),
                            name: member.name.to_string(),
                            descriptor: member.descriptor.to_string(),
                        })?;
                    let method = entry.method();
                    let desc = parse_method_descriptor(method.descriptor)?;
                    let receiver = usize::from(method.kind != InvokeKind::Static);
                    Link::Native { entry, argc: desc.params.len() + receiver, returns: desc.ret.is_some() }
                } else {
                    let desc = parse_method_descriptor(member.descriptor)?;
                    Link::Method {
                        class: Rc::from(member.class),
                        name: Rc::from(member.name),
                        descriptor: Rc::from(member.descriptor),
                        argc: desc.params.len(),
                        returns: desc.ret.is_some(),
                    }
                };
                links.insert(index, link);
            }
            _ => {}
        }
    }
    Ok((links, constants))
}

/// Execution counters, reported by `pyjvm run --stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VmStats {
    pub units_loaded: usize,
    pub modules_imported: usize,
    pub instructions: u64,
    pub calls: u64,
    pub native_calls: u64,
    pub max_depth: usize,
}

struct Frame {
    locals: Vec<Slot>,
    stack: Vec<Slot>,
    ip: usize,
}

/// The runtime: loaded units, imported modules and the builtin namespace.
pub struct Vm {
    units: HashMap<String, Rc<LoadedUnit>>,
    modules: HashMap<String, Value>,
    pub(crate) builtins: IndexMap<&'static str, Value>,
    pub(crate) types: TypeTable,
    /// Containers currently being rendered, to cut reference cycles.
    pub(crate) repr_active: Vec<usize>,
    output: Option<String>,
    depth: usize,
    max_steps: u64,
    stats: VmStats,
    pub(crate) argv: Vec<String>,
    pub(crate) started: Instant,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let (types, builtins) = builtins::install();
        Vm {
            units: HashMap::new(),
            modules: HashMap::new(),
            builtins,
            types,
            repr_active: Vec::new(),
            output: None,
            depth: 0,
            max_steps: DEFAULT_MAX_STEPS,
            stats: VmStats::default(),
            argv: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Command-line arguments exposed as `sys.argv`; read on first import.
    pub fn set_argv(&mut self, argv: Vec<String>) {
        self.argv = argv;
    }

    pub fn set_max_steps(&mut self, max: u64) {
        self.max_steps = max;
    }

    /// Collect `print` output in memory instead of writing to stdout.
    pub fn capture_output(&mut self) {
        self.output = Some(String::new());
    }

    pub fn take_output(&mut self) -> String {
        self.output.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub(crate) fn write_text(&mut self, text: &str) {
        match &mut self.output {
            Some(buf) => buf.push_str(text),
            None => print!("{text}"),
        }
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// Verify and link a unit. Nothing runs until a module is imported.
    pub fn load_unit(&mut self, unit: CompiledUnit) -> Result<(), VmError> {
        verify_unit(&unit)?;
        let loaded = LoadedUnit::new(unit)?;
        if self.units.contains_key(&loaded.name) {
            return Err(VmError::DuplicateUnit(loaded.name));
        }
        debug!(unit = %loaded.name, methods = loaded.methods.len(), "loaded unit");
        self.stats.units_loaded += 1;
        self.units.insert(loaded.name.clone(), Rc::new(loaded));
        Ok(())
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.load_unit(CompiledUnit::from_bytes(bytes)?)
    }

    pub fn has_unit(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn unit(&self, name: &str) -> Result<Rc<LoadedUnit>, VmError> {
        self.units
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
    }

    pub(crate) fn cached_module(&self, name: &str) -> Option<Value> {
        self.modules.get(name).cloned()
    }

    /// Import a dotted module name, initialising it and its parents.
    pub fn import(&mut self, name: &str) -> Result<Value, VmError> {
        if let Some(module) = self.modules.get(name) {
            return Ok(module.clone());
        }
        if let Some((parent, _)) = name.rsplit_once('.') {
            self.import(parent)?;
        }
        if let Some(module) = builtins::native_module(self, name) {
            self.modules.insert(name.to_string(), module.clone());
            return Ok(module);
        }
        let unit_name = name.replace('.', "/");
        let kind = match self.units.get(&unit_name) {
            Some(unit) if unit.is_host() => ModuleKind::Host(unit_name.clone()),
            Some(_) => ModuleKind::Unit(unit_name.clone()),
            None if self.units.keys().any(|k| k.starts_with(&format!("{unit_name}/"))) => {
                ModuleKind::Native(RefCell::new(IndexMap::new()))
            }
            None => return Err(self.err("ModuleNotFoundError", format!("No module named '{name}'"))),
        };
        trace!(module = name, "importing");
        let module = Value::Module(Rc::new(ModuleObj { name: name.to_string(), kind }));
        self.modules.insert(name.to_string(), module.clone());
        self.stats.modules_imported += 1;
        if let Some(unit) = self.units.get(&unit_name).cloned() {
            if let Err(e) = self.ensure_init(&unit) {
                self.modules.remove(name);
                return Err(e);
            }
        }
        Ok(module)
    }

    /// Run a module as the program entry point (`__name__ == "__main__"`).
    pub fn run_main(&mut self, name: &str) -> Result<Value, VmError> {
        let unit = self.unit(&name.replace('.', "/"))?;
        unit.set_static(abi::MODULE_NAME, Slot::Obj(Value::str("__main__")));
        self.import(name)
    }

    pub(crate) fn ensure_init(&mut self, unit: &Rc<LoadedUnit>) -> Result<(), VmError> {
        if unit.state.get() != InitState::NotStarted {
            return Ok(());
        }
        unit.state.set(InitState::InProgress);
        debug!(unit = %unit.name, "initializing");
        let result = if unit.method(abi::CLINIT, abi::CLINIT_DESCRIPTOR).is_some() {
            self.invoke(unit, abi::CLINIT, abi::CLINIT_DESCRIPTOR, Vec::new()).map(|_| ())
        } else {
            Ok(())
        };
        unit.state.set(InitState::Done);
        result
    }

    /// Invoke a static method of a loaded unit.
    pub(crate) fn invoke(
        &mut self,
        unit: &Rc<LoadedUnit>,
        name: &str,
        descriptor: &str,
        args: Vec<Slot>,
    ) -> Result<Slot, VmError> {
        let body = unit.method(name, descriptor).ok_or_else(|| VmError::MethodNotFound {
            class: unit.name.clone(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })?;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.err("RecursionError", "maximum recursion depth exceeded"));
        }
        self.depth += 1;
        self.stats.calls += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.depth);
        let result = self.execute(unit, &body, args);
        self.depth -= 1;
        result
    }

    fn execute(&mut self, unit: &Rc<LoadedUnit>, body: &MethodBody, args: Vec<Slot>) -> Result<Slot, VmError> {
        let code = &body.code;
        let mut frame = Frame {
            locals: vec![Slot::Null; code.max_locals as usize],
            stack: Vec::with_capacity(code.max_stack as usize),
            ip: 0,
        };
        for (i, arg) in args.into_iter().enumerate() {
            let local = frame.locals.get_mut(i).ok_or(VmError::InvalidLocal(i as u16))?;
            *local = arg;
        }
        loop {
            let ip = frame.ip;
            let insn = code
                .insns
                .get(ip)
                .ok_or_else(|| VmError::InvalidBranch(body.offsets.last().copied().unwrap_or(0)))?;
            frame.ip += 1;
            self.stats.instructions += 1;
            if self.stats.instructions > self.max_steps {
                return Err(VmError::ExecutionLimitExceeded(self.max_steps));
            }
            match self.step(unit, body, insn, &mut frame) {
                Ok(None) => {}
                Ok(Some(result)) => return Ok(result),
                Err(VmError::Exception(exc)) => {
                    let pc = body.offsets[ip];
                    let handler = code.exception_table.iter().find(|e| {
                        u32::from(e.start_pc) <= pc && pc < u32::from(e.end_pc) && unit.catches(e.catch_type)
                    });
                    match handler {
                        Some(entry) => {
                            trace!(method = %body.name, pc, handler = entry.handler_pc, "exception caught");
                            frame.stack.clear();
                            frame.stack.push(Slot::Exc(exc));
                            frame.ip = body.index_of(u32::from(entry.handler_pc))?;
                        }
                        None => return Err(VmError::Exception(exc)),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn step(
        &mut self,
        unit: &Rc<LoadedUnit>,
        body: &MethodBody,
        insn: &Insn,
        frame: &mut Frame,
    ) -> Result<Option<Slot>, VmError> {
        let stack = &mut frame.stack;
        match insn {
            Insn::Nop | Insn::Checkcast(_) => {}
            Insn::AconstNull => stack.push(Slot::Null),
            Insn::Iconst(v) => stack.push(Slot::Int(i32::from(*v))),
            Insn::Ldc(index) | Insn::Ldc2W(index) => stack.push(unit.constant(*index)?),
            Insn::Aload(index) => {
                let value = frame.locals.get(*index as usize).ok_or(VmError::InvalidLocal(*index))?;
                stack.push(value.clone());
            }
            Insn::Astore(index) => {
                let value = pop(stack, body)?;
                let local = frame.locals.get_mut(*index as usize).ok_or(VmError::InvalidLocal(*index))?;
                *local = value;
            }
            Insn::Aaload => {
                let index = pop(stack, body)?.int()?;
                let array = pop(stack, body)?.into_array()?;
                let item = usize::try_from(index)
                    .ok()
                    .and_then(|i| array.borrow().get(i).cloned())
                    .ok_or(VmError::ArrayIndex(i64::from(index)))?;
                stack.push(item);
            }
            Insn::Aastore => {
                let value = pop(stack, body)?;
                let index = pop(stack, body)?.int()?;
                let array = pop(stack, body)?.into_array()?;
                let mut array = array.borrow_mut();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| array.get_mut(i))
                    .ok_or(VmError::ArrayIndex(i64::from(index)))?;
                *slot = value;
            }
            Insn::Pop => {
                pop(stack, body)?;
            }
            Insn::Pop2 => {
                if !matches!(pop(stack, body)?, Slot::Long(_) | Slot::Double(_)) {
                    pop(stack, body)?;
                }
            }
            Insn::Dup => {
                let top = stack.last().cloned().ok_or_else(|| VmError::StackUnderflow(body.name.clone()))?;
                stack.push(top);
            }
            Insn::DupX1 => {
                let a = pop(stack, body)?;
                let b = pop(stack, body)?;
                stack.push(a.clone());
                stack.push(b);
                stack.push(a);
            }
            Insn::Swap => {
                let a = pop(stack, body)?;
                let b = pop(stack, body)?;
                stack.push(a);
                stack.push(b);
            }
            Insn::Ifeq(target) | Insn::Ifne(target) => {
                let value = pop(stack, body)?.int()?;
                if (value == 0) == matches!(insn, Insn::Ifeq(_)) {
                    frame.ip = body.index_of(*target)?;
                }
            }
            Insn::Ifnull(target) | Insn::Ifnonnull(target) => {
                let is_null = matches!(pop(stack, body)?, Slot::Null);
                if is_null == matches!(insn, Insn::Ifnull(_)) {
                    frame.ip = body.index_of(*target)?;
                }
            }
            Insn::Goto(target) => frame.ip = body.index_of(*target)?,
            Insn::Areturn => return Ok(Some(pop(stack, body)?)),
            Insn::Return => return Ok(Some(Slot::Null)),
            Insn::Athrow => {
                return Err(match pop(stack, body)? {
                    Slot::Exc(e) => VmError::Exception(e),
                    Slot::Obj(value) => VmError::Exception(PyErr { value }),
                    _ => VmError::NullReference("athrow"),
                });
            }
            Insn::Getstatic(index) => {
                let Link::Field { class, name } = unit.link(*index)? else {
                    return Err(VmError::OperandType { expected: "field reference", got: "method reference" });
                };
                if &**class == abi::DYN {
                    stack.push(Slot::Obj(Value::None));
                } else {
                    let owner = self.unit(class)?;
                    self.ensure_init(&owner)?;
                    stack.push(owner.get_static(name));
                }
            }
            Insn::Putstatic(index) => {
                let Link::Field { class, name } = unit.link(*index)? else {
                    return Err(VmError::OperandType { expected: "field reference", got: "method reference" });
                };
                let value = pop(stack, body)?;
                let owner = self.unit(class)?;
                self.ensure_init(&owner)?;
                owner.set_static(name, value);
            }
            Insn::Getfield(index) => {
                let Link::Field { name, .. } = unit.link(*index)? else {
                    return Err(VmError::OperandType { expected: "field reference", got: "method reference" });
                };
                let value = match pop(stack, body)? {
                    Slot::Obj(Value::Instance(inst)) => inst.dict.borrow().get(&**name).cloned(),
                    other => return Err(VmError::OperandType { expected: "instance", got: other.kind() }),
                };
                stack.push(value.map_or(Slot::Null, Slot::Obj));
            }
            Insn::Putfield(index) => {
                let Link::Field { name, .. } = unit.link(*index)? else {
                    return Err(VmError::OperandType { expected: "field reference", got: "method reference" });
                };
                let value = pop(stack, body)?;
                match (pop(stack, body)?, value) {
                    (Slot::Obj(Value::Instance(inst)), Slot::Obj(v)) => {
                        inst.dict.borrow_mut().insert(name.to_string(), v);
                    }
                    (Slot::Obj(Value::Instance(inst)), _) => {
                        inst.dict.borrow_mut().shift_remove(&**name);
                    }
                    (other, _) => return Err(VmError::OperandType { expected: "instance", got: other.kind() }),
                }
            }
            Insn::Invokestatic(index)
            | Insn::Invokevirtual(index)
            | Insn::Invokespecial(index)
            | Insn::Invokeinterface(index, _) => match unit.link(*index)? {
                Link::Native { entry, argc, returns } => {
                    let args = pop_n(stack, *argc, body)?;
                    self.stats.native_calls += 1;
                    let result = self.native(*entry, args)?;
                    if *returns {
                        frame.stack.push(result);
                    }
                }
                Link::Method { class, name, descriptor, argc, returns } => {
                    let args = pop_n(stack, *argc, body)?;
                    let owner = self.unit(class)?;
                    self.ensure_init(&owner)?;
                    let result = self.invoke(&owner, name, descriptor, args)?;
                    if *returns {
                        frame.stack.push(result);
                    }
                }
                Link::Field { .. } => {
                    return Err(VmError::OperandType { expected: "method reference", got: "field reference" })
                }
            },
            Insn::New(index) => {
                let class = unit.pool.get_class(*index)?;
                if class != abi::CELL {
                    return Err(VmError::ClassNotFound(class.to_string()));
                }
                stack.push(Slot::Cell(Rc::new(RefCell::new(None))));
            }
            Insn::Anewarray(_) => {
                let count = pop(stack, body)?.int()?;
                let count = usize::try_from(count).map_err(|_| VmError::ArrayIndex(i64::from(count)))?;
                stack.push(Slot::array(vec![Slot::Null; count]));
            }
            Insn::Arraylength => {
                let array = pop(stack, body)?.into_array()?;
                let len = array.borrow().len();
                stack.push(Slot::Int(len as i32));
            }
            Insn::Instanceof(index) => {
                let class = unit.pool.get_class(*index)?;
                let is = match pop(stack, body)? {
                    Slot::Exc(_) => class == abi::PY_EXCEPTION,
                    Slot::Cell(_) => class == abi::CELL,
                    Slot::Obj(_) => class == abi::PY_OBJECT || class == abi::JAVA_OBJECT,
                    Slot::Str(_) => class == abi::JAVA_STRING || class == abi::JAVA_OBJECT,
                    _ => false,
                };
                stack.push(Slot::Int(i32::from(is)));
            }
        }
        Ok(None)
    }
}

fn pop(stack: &mut Vec<Slot>, body: &MethodBody) -> Result<Slot, VmError> {
    stack.pop().ok_or_else(|| VmError::StackUnderflow(body.name.clone()))
}

fn pop_n(stack: &mut Vec<Slot>, n: usize, body: &MethodBody) -> Result<Vec<Slot>, VmError> {
    if stack.len() < n {
        return Err(VmError::StackUnderflow(body.name.clone()));
    }
    Ok(stack.split_off(stack.len() - n))
}
