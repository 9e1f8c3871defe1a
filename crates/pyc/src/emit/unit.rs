use std::collections::HashSet;

use pyjvm_bytecode::abi;
use pyjvm_bytecode::unit::{ACC_FINAL, ACC_PUBLIC, ACC_STATIC, ACC_SYNTHETIC};
use pyjvm_bytecode::CompiledUnit;
use tracing::trace;

use super::code::CodeBuilder;
use crate::error::{fault, CompileError};

/// A unit under construction together with the method names it already
/// holds.
pub struct UnitBuilder {
    name: String,
    unit: CompiledUnit,
    methods: HashSet<String>,
}

impl UnitBuilder {
    /// The unit of a module: one static field per module-level name.
    pub fn module(name: &str, fields: &[String], source_file: Option<&str>) -> Result<Self, CompileError> {
        let mut builder = UnitBuilder::new(name, abi::JAVA_OBJECT, source_file)?;
        for field in fields {
            builder
                .unit
                .add_field(ACC_PUBLIC | ACC_STATIC, field, abi::OBJ)
                .map_err(fault(name))?;
        }
        Ok(builder)
    }

    /// The unit of a class statement: holds the class object, the body
    /// method and the methods defined directly in the body.
    pub fn class(name: &str, source_file: Option<&str>) -> Result<Self, CompileError> {
        let mut builder = UnitBuilder::new(name, abi::PY_INSTANCE, source_file)?;
        builder.unit.add_interface(abi::PY_OBJECT).map_err(fault(name))?;
        builder
            .unit
            .add_field(ACC_PUBLIC | ACC_STATIC, abi::CLASS_FIELD, abi::OBJ)
            .map_err(fault(name))?;
        builder.methods.insert(abi::CLASS_BODY.to_string());
        Ok(builder)
    }

    fn new(name: &str, super_name: &str, source_file: Option<&str>) -> Result<Self, CompileError> {
        let mut unit = CompiledUnit::new(name, super_name).map_err(fault(name))?;
        if let Some(file) = source_file {
            unit.set_source_file(file).map_err(fault(name))?;
        }
        Ok(UnitBuilder { name: name.to_string(), unit, methods: HashSet::new() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reserve a method name, suffixing `$N` when `base` is taken.
    pub fn reserve(&mut self, base: &str) -> String {
        let mut name = base.to_string();
        let mut n = 1;
        while self.methods.contains(&name) {
            name = format!("{base}${n}");
            n += 1;
        }
        self.methods.insert(name.clone());
        name
    }

    /// Seal a body and add it as a static method.
    pub fn add(
        &mut self,
        name: &str,
        descriptor: &str,
        mut code: CodeBuilder,
        captures: Option<&[String]>,
        synthetic: bool,
    ) -> Result<(), CompileError> {
        let body = code.finish(&mut self.unit.pool)?;
        let mut access = ACC_PUBLIC | ACC_STATIC;
        if synthetic {
            access |= ACC_SYNTHETIC | ACC_FINAL;
        }
        trace!(unit = %self.name, method = name, insns = body.insns.len(), "sealed method");
        self.unit
            .add_method(access, name, descriptor, body, captures)
            .map_err(fault(&self.name))
    }

    pub fn finish(self) -> CompiledUnit {
        self.unit
    }
}

/// Method or unit name component for a qualified name:
/// `f.<locals>.g` becomes `f$g`, lambdas become `lambda`.
pub fn mangle(qualname: &str) -> String {
    qualname
        .split('.')
        .filter(|part| *part != "<locals>")
        .map(|part| part.trim_start_matches('<').trim_end_matches('>'))
        .collect::<Vec<_>>()
        .join("$")
}
