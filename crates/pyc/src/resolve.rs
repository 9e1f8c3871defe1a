//! Name and scope resolution.
//!
//! Every scope is processed in two steps: the names it binds anywhere are
//! collected first, then each name use is resolved against the current
//! scope, the enclosing function scopes, the module and finally the
//! builtin namespace. Free variables found in an enclosing function are
//! turned into cells there and threaded through every intermediate scope's
//! capture list, whose order defines the closure capture record.

use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use pyjvm_bytecode::abi;
use serde::Serialize;

use crate::ast::*;
use crate::error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScopeKind {
    Module,
    Function,
    Lambda,
    Class,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Binding {
    /// Plain local slot.
    Local(u16),
    /// Local slot holding a cell shared with inner closures.
    Cell(u16),
    /// Index into the capture record of the current function.
    Free(u16),
    /// Static field of the module unit.
    Global(String),
    /// Entry in the namespace of the class under construction.
    ClassAttr(String),
    Builtin(String),
    /// Zero-argument `super` inside a method.
    Super,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalVar {
    pub name: String,
    pub slot: u16,
    pub cell: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeInfo {
    pub id: NodeId,
    pub kind: ScopeKind,
    pub name: String,
    pub qualname: String,
    pub parent: Option<NodeId>,
    /// For methods: the scope of the class whose body defines them.
    pub class_scope: Option<NodeId>,
    pub params: Vec<String>,
    pub locals: Vec<LocalVar>,
    /// Names of the capture record, in record order.
    pub captures: Vec<String>,
    /// Where the parent scope finds each captured variable.
    pub capture_sources: Vec<Binding>,
    /// First slot free for emitter temporaries.
    pub n_slots: u16,
}

impl ScopeInfo {
    pub fn cells(&self) -> impl Iterator<Item = &LocalVar> {
        self.locals.iter().filter(|v| v.cell)
    }

    pub fn param_slot(&self, index: usize) -> u16 {
        first_slot(self.kind) + index as u16
    }
}

/// First local slot available to named variables.
pub fn first_slot(kind: ScopeKind) -> u16 {
    match kind {
        ScopeKind::Module => 0,
        ScopeKind::Function | ScopeKind::Lambda => abi::ARGS_SLOT + 1,
        ScopeKind::Class => abi::CLASS_SLOT + 1,
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    bindings: HashMap<NodeId, Binding>,
    scopes: HashMap<NodeId, ScopeInfo>,
    /// Module-level names, in first-binding order.
    pub module_fields: Vec<String>,
    pub module_scope: Option<NodeId>,
}

impl Resolution {
    pub fn binding(&self, id: NodeId) -> Option<&Binding> {
        self.bindings.get(&id)
    }

    pub fn scope(&self, id: NodeId) -> Option<&ScopeInfo> {
        self.scopes.get(&id)
    }

    pub fn scopes(&self) -> impl Iterator<Item = &ScopeInfo> {
        self.scopes.values()
    }

    #[cfg(test)]
    pub(crate) fn scope_mut(&mut self, id: NodeId) -> Option<&mut ScopeInfo> {
        self.scopes.get_mut(&id)
    }
}

pub fn resolve(module: &Module) -> (Resolution, Vec<CompileError>) {
    let mut resolver = Resolver::default();
    let mut declared = IndexSet::new();
    declared_globals(&module.body, &mut declared);
    resolver.declared_globals = declared;

    let mut frame = Frame::new(module.scope, ScopeKind::Module, "<module>".into(), "<module>".into(), None);
    frame.collect(&module.body);
    resolver.module_assigned = frame.assigned.clone();
    resolver.stack.push(frame);
    resolver.block(&module.body);
    resolver.pop_frame();

    let mut fields: IndexSet<String> = IndexSet::new();
    fields.insert(abi::MODULE_NAME.to_string());
    fields.extend(resolver.module_assigned.iter().cloned());
    fields.extend(resolver.declared_globals.iter().cloned());
    let (mut resolution, errors) = resolver.finish();
    resolution.module_fields = fields.into_iter().collect();
    resolution.module_scope = Some(module.scope);
    (resolution, errors)
}

/// Names declared `global` anywhere in the module, including nested
/// function bodies: each becomes a module field.
fn declared_globals(body: &[Stmt], out: &mut IndexSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Global(names) => out.extend(names.iter().cloned()),
            StmtKind::FunctionDef(def) => declared_globals(&def.body, out),
            StmtKind::ClassDef(def) => declared_globals(&def.body, out),
            _ => {
                for block in child_blocks(stmt) {
                    declared_globals(block, out);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Var { scope: NodeId, var: usize },
    Done(Binding),
}

struct Frame {
    id: NodeId,
    kind: ScopeKind,
    name: String,
    qualname: String,
    parent: Option<NodeId>,
    class_scope: Option<NodeId>,
    params: Vec<String>,
    globals: HashSet<String>,
    nonlocals: HashSet<String>,
    assigned: IndexSet<String>,
    names: HashMap<String, usize>,
    vars: Vec<LocalVar>,
    comps: Vec<HashMap<String, usize>>,
    captures: IndexMap<String, Pending>,
    next_slot: u16,
}

impl Frame {
    fn new(id: NodeId, kind: ScopeKind, name: String, qualname: String, parent: Option<NodeId>) -> Self {
        Frame {
            id,
            kind,
            name,
            qualname,
            parent,
            class_scope: None,
            params: Vec::new(),
            globals: HashSet::new(),
            nonlocals: HashSet::new(),
            assigned: IndexSet::new(),
            names: HashMap::new(),
            vars: Vec::new(),
            comps: Vec::new(),
            captures: IndexMap::new(),
            next_slot: first_slot(kind),
        }
    }

    fn alloc(&mut self, name: &str) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.vars.push(LocalVar { name: name.to_string(), slot, cell: false });
        self.vars.len() - 1
    }

    /// First sub-pass: every name bound in this scope's own body.
    fn collect(&mut self, body: &[Stmt]) {
        self.collect_block(body);
        if matches!(self.kind, ScopeKind::Function | ScopeKind::Lambda) {
            let assigned: Vec<String> = self.assigned.iter().cloned().collect();
            for name in assigned {
                if !self.globals.contains(&name) && !self.nonlocals.contains(&name) && !self.names.contains_key(&name) {
                    let var = self.alloc(&name);
                    self.names.insert(name, var);
                }
            }
        }
    }

    fn bind(&mut self, name: &str) {
        self.assigned.insert(name.to_string());
    }

    fn bind_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name { name, .. } => self.bind(name),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.bind_target(item);
                }
            }
            ExprKind::Starred(inner) => self.bind_target(inner),
            _ => {}
        }
    }

    fn collect_block(&mut self, body: &[Stmt]) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::FunctionDef(def) => self.bind(&def.name.name),
                StmtKind::ClassDef(def) => self.bind(&def.name.name),
                StmtKind::Assign { targets, .. } => {
                    for target in targets {
                        self.bind_target(target);
                    }
                }
                StmtKind::AugAssign { target, .. } | StmtKind::AnnAssign { target, .. } => self.bind_target(target),
                StmtKind::Delete(targets) => {
                    for target in targets {
                        self.bind_target(target);
                    }
                }
                StmtKind::For { target, .. } => self.bind_target(target),
                StmtKind::With { items, .. } => {
                    for item in items {
                        if let Some(target) = &item.target {
                            self.bind_target(target);
                        }
                    }
                }
                StmtKind::Try { handlers, .. } => {
                    for handler in handlers {
                        if let Some(name) = &handler.name {
                            self.bind(&name.name);
                        }
                    }
                }
                StmtKind::Import(aliases) => {
                    for alias in aliases {
                        self.bind(&alias.bind.name);
                    }
                }
                StmtKind::ImportFrom { names, .. } => {
                    for alias in names {
                        self.bind(&alias.bind.name);
                    }
                }
                StmtKind::Global(names) => self.globals.extend(names.iter().cloned()),
                StmtKind::Nonlocal(names) => self.nonlocals.extend(names.iter().cloned()),
                _ => {}
            }
            for block in child_blocks(stmt) {
                self.collect_block(block);
            }
        }
    }
}

#[derive(Default)]
struct Resolver {
    stack: Vec<Frame>,
    finished: HashMap<NodeId, Frame>,
    pending: Vec<(NodeId, Pending)>,
    declared_globals: IndexSet<String>,
    module_assigned: IndexSet<String>,
    errors: Vec<CompileError>,
}

impl Resolver {
    fn top(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.stack.pop() {
            self.finished.insert(frame.id, frame);
        }
    }

    fn is_module_global(&self, name: &str) -> bool {
        name == abi::MODULE_NAME || self.module_assigned.contains(name) || self.declared_globals.contains(name)
    }

    fn comp_lookup(&self, fi: usize, name: &str) -> Option<Pending> {
        let frame = &self.stack[fi];
        frame
            .comps
            .iter()
            .rev()
            .find_map(|comp| comp.get(name))
            .map(|&var| Pending::Var { scope: frame.id, var })
    }

    /// Binding of `name` inside frame `fi` only; `None` sends the lookup
    /// outward.
    fn local_lookup(&self, fi: usize, name: &str) -> Option<Pending> {
        if let Some(found) = self.comp_lookup(fi, name) {
            return Some(found);
        }
        let frame = &self.stack[fi];
        if frame.globals.contains(name) {
            return Some(Pending::Done(Binding::Global(name.to_string())));
        }
        if frame.nonlocals.contains(name) {
            return None;
        }
        match frame.kind {
            ScopeKind::Function | ScopeKind::Lambda => {
                frame.names.get(name).map(|&var| Pending::Var { scope: frame.id, var })
            }
            ScopeKind::Class if frame.comps.is_empty() && frame.assigned.contains(name) => {
                Some(Pending::Done(Binding::ClassAttr(name.to_string())))
            }
            ScopeKind::Class => None,
            ScopeKind::Module if self.is_module_global(name) => Some(Pending::Done(Binding::Global(name.to_string()))),
            ScopeKind::Module => None,
        }
    }

    /// Find `name` in an enclosing function scope, threading it through the
    /// capture lists of every scope in between. Class and module scopes
    /// only contribute comprehension variables.
    fn lookup_enclosing(&mut self, name: &str) -> Option<Pending> {
        let top = self.stack.len() - 1;
        let mut owner = None;
        for fi in (0..top).rev() {
            let kind = self.stack[fi].kind;
            let found = match kind {
                ScopeKind::Function | ScopeKind::Lambda => self.local_lookup(fi, name),
                ScopeKind::Class | ScopeKind::Module => self.comp_lookup(fi, name),
            };
            match found {
                Some(Pending::Var { var, .. }) => {
                    owner = Some((fi, var));
                    break;
                }
                Some(done) => return Some(done),
                None if kind == ScopeKind::Module => break,
                None => {}
            }
        }
        let (fi, var) = owner?;
        self.stack[fi].vars[var].cell = true;
        let mut source = Pending::Var { scope: self.stack[fi].id, var };
        for k in fi + 1..=top {
            let frame = &mut self.stack[k];
            let index = match frame.captures.get_index_of(name) {
                Some(i) => i,
                None => {
                    frame.captures.insert(name.to_string(), source);
                    frame.captures.len() - 1
                }
            };
            source = Pending::Done(Binding::Free(index as u16));
        }
        Some(source)
    }

    fn lookup(&mut self, name: &str) -> Option<Pending> {
        let top = self.stack.len() - 1;
        if let Some(found) = self.local_lookup(top, name) {
            return Some(found);
        }
        if let Some(found) = self.lookup_enclosing(name) {
            return Some(found);
        }
        if self.stack[top].nonlocals.contains(name) {
            return None;
        }
        if self.is_module_global(name) {
            return Some(Pending::Done(Binding::Global(name.to_string())));
        }
        if name == "super" && self.stack[top].class_scope.is_some() {
            return Some(Pending::Done(Binding::Super));
        }
        if abi::is_builtin(name) {
            return Some(Pending::Done(Binding::Builtin(name.to_string())));
        }
        None
    }

    fn name(&mut self, id: NodeId, name: &str, pos: Pos) {
        match self.lookup(name) {
            Some(found) => self.pending.push((id, found)),
            None => {
                let scope = self.top().qualname.clone();
                self.errors.push(CompileError::UnresolvedName {
                    line: pos.line,
                    col: pos.col,
                    name: name.to_string(),
                    scope,
                });
            }
        }
    }

    fn block(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                for decorator in &def.decorators {
                    self.expr(decorator);
                }
                for param in &def.params {
                    if let Some(default) = &param.default {
                        self.expr(default);
                    }
                }
                self.name(def.name.id, &def.name.name, def.name.pos);
                self.function(def.scope, &def.name.name, &def.params, |r| r.block(&def.body), &def.body);
            }
            StmtKind::ClassDef(def) => {
                for decorator in &def.decorators {
                    self.expr(decorator);
                }
                for base in &def.bases {
                    self.expr(base);
                }
                for keyword in &def.keywords {
                    self.expr(&keyword.value);
                }
                self.name(def.name.id, &def.name.name, def.name.pos);
                let qualname = self.qualname(&def.name.name);
                let parent = self.top().id;
                let mut frame = Frame::new(def.scope, ScopeKind::Class, def.name.name.clone(), qualname, Some(parent));
                frame.collect(&def.body);
                self.stack.push(frame);
                self.block(&def.body);
                self.pop_frame();
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.expr(target);
                }
            }
            StmtKind::Assign { targets, value } => {
                self.expr(value);
                for target in targets {
                    self.expr(target);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.expr(value);
                self.expr(target);
            }
            StmtKind::AnnAssign { target, value, .. } => {
                if let Some(value) = value {
                    self.expr(value);
                }
                self.expr(target);
            }
            StmtKind::For { target, iter, body, orelse, .. } => {
                self.expr(iter);
                self.expr(target);
                self.block(body);
                self.block(orelse);
            }
            StmtKind::While { test, body, orelse } | StmtKind::If { test, body, orelse } => {
                self.expr(test);
                self.block(body);
                self.block(orelse);
            }
            StmtKind::With { items, body, .. } => {
                for item in items {
                    self.expr(&item.context);
                    if let Some(target) = &item.target {
                        self.expr(target);
                    }
                }
                self.block(body);
            }
            StmtKind::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.expr(exc);
                }
                if let Some(cause) = cause {
                    self.expr(cause);
                }
            }
            StmtKind::Try { body, handlers, orelse, finalbody } => {
                self.block(body);
                for handler in handlers {
                    if let Some(kind) = &handler.kind {
                        self.expr(kind);
                    }
                    if let Some(name) = &handler.name {
                        self.name(name.id, &name.name, name.pos);
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
            StmtKind::Import(aliases) | StmtKind::ImportFrom { names: aliases, .. } => {
                for alias in aliases {
                    self.name(alias.bind.id, &alias.bind.name, alias.bind.pos);
                }
            }
            StmtKind::Global(names) => {
                let params = self.top().params.clone();
                if let Some(name) = names.iter().find(|n| params.contains(n)) {
                    let msg = format!("name '{name}' is parameter and global");
                    self.errors.push(CompileError::syntax(stmt.pos, msg));
                }
            }
            StmtKind::Nonlocal(names) => {
                if self.top().kind == ScopeKind::Module {
                    self.errors.push(CompileError::syntax(stmt.pos, "nonlocal declaration not allowed at module level"));
                    return;
                }
                for name in names {
                    if self.top().params.contains(name) {
                        let msg = format!("name '{name}' is parameter and nonlocal");
                        self.errors.push(CompileError::syntax(stmt.pos, msg));
                    } else if self.lookup_enclosing(name).is_none() {
                        let msg = format!("no binding for nonlocal '{name}' found");
                        self.errors.push(CompileError::syntax(stmt.pos, msg));
                    }
                }
            }
            StmtKind::Expr(value) => self.expr(value),
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }
    }

    fn qualname(&mut self, name: &str) -> String {
        let frame = self.top();
        match frame.kind {
            ScopeKind::Module => name.to_string(),
            ScopeKind::Class => format!("{}.{name}", frame.qualname),
            ScopeKind::Function | ScopeKind::Lambda => format!("{}.<locals>.{name}", frame.qualname),
        }
    }

    fn function(
        &mut self,
        scope: NodeId,
        name: &str,
        params: &[Param],
        body: impl FnOnce(&mut Self),
        stmts: &[Stmt],
    ) {
        let kind = if name == "<lambda>" { ScopeKind::Lambda } else { ScopeKind::Function };
        let qualname = self.qualname(name);
        let parent = self.top();
        let class_scope = (parent.kind == ScopeKind::Class).then_some(parent.id);
        let parent = parent.id;
        let mut frame = Frame::new(scope, kind, name.to_string(), qualname, Some(parent));
        frame.class_scope = class_scope;
        for param in params {
            frame.params.push(param.name.clone());
            let var = frame.alloc(&param.name);
            frame.names.insert(param.name.clone(), var);
        }
        frame.collect(stmts);
        self.stack.push(frame);
        body(self);
        self.pop_frame();
    }

    fn comprehension(&mut self, element: &Expr, value: Option<&Expr>, generators: &[CompFor]) {
        if let Some(first) = generators.first() {
            self.expr(&first.iter);
        }
        self.top().comps.push(HashMap::new());
        for (i, generator) in generators.iter().enumerate() {
            if i > 0 {
                self.expr(&generator.iter);
            }
            self.comp_target(&generator.target);
            for cond in &generator.ifs {
                self.expr(cond);
            }
        }
        self.expr(element);
        if let Some(value) = value {
            self.expr(value);
        }
        self.top().comps.pop();
    }

    fn comp_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name { id, name } => {
                let frame = self.top();
                let var = frame.alloc(name);
                let scope = frame.id;
                if let Some(comp) = frame.comps.last_mut() {
                    comp.insert(name.clone(), var);
                }
                self.pending.push((*id, Pending::Var { scope, var }));
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.comp_target(item);
                }
            }
            ExprKind::Starred(inner) => self.comp_target(inner),
            _ => self.expr(target),
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name { id, name } => self.name(*id, name, expr.pos),
            ExprKind::BoolOp { values, .. } => {
                for value in values {
                    self.expr(value);
                }
            }
            ExprKind::BinOp { left, right, .. } => {
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
                for param in &lambda.params {
                    if let Some(default) = &param.default {
                        self.expr(default);
                    }
                }
                self.function(lambda.scope, "<lambda>", &lambda.params, |r| r.expr(&lambda.body), &[]);
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
                self.comprehension(element, value.as_deref(), generators);
            }
            ExprKind::Constant(_) => {}
            ExprKind::Starred(inner) | ExprKind::Await(inner) => self.expr(inner),
            ExprKind::Yield(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
            }
            ExprKind::NamedExpr { target, value } => {
                self.expr(value);
                self.expr(target);
            }
        }
    }

    fn settle(&self, pending: &Pending) -> Option<Binding> {
        match pending {
            Pending::Done(binding) => Some(binding.clone()),
            Pending::Var { scope, var } => {
                let local = self.finished.get(scope)?.vars.get(*var)?;
                Some(if local.cell { Binding::Cell(local.slot) } else { Binding::Local(local.slot) })
            }
        }
    }

    fn finish(self) -> (Resolution, Vec<CompileError>) {
        let mut resolution = Resolution::default();
        for (id, pending) in &self.pending {
            if let Some(binding) = self.settle(pending) {
                resolution.bindings.insert(*id, binding);
            }
        }
        for frame in self.finished.values() {
            let capture_sources = frame.captures.values().filter_map(|p| self.settle(p)).collect();
            let info = ScopeInfo {
                id: frame.id,
                kind: frame.kind,
                name: frame.name.clone(),
                qualname: frame.qualname.clone(),
                parent: frame.parent,
                class_scope: frame.class_scope,
                params: frame.params.clone(),
                locals: frame.vars.clone(),
                captures: frame.captures.keys().cloned().collect(),
                capture_sources,
                n_slots: frame.next_slot,
            };
            resolution.scopes.insert(frame.id, info);
        }
        (resolution, self.errors)
    }
}
