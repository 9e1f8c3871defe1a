pub mod lexer;
pub mod ast;
pub mod parser;
pub mod resolve;
pub mod mapper;
pub mod emit;
pub mod error;
pub mod diagnostics;
pub mod options;
pub mod driver;
#[cfg(test)]
mod tests;

pub use diagnostics::{Diagnostic, DiagnosticSink};
pub use error::{CompileError, Severity};
pub use options::CompilerOptions;

use std::collections::HashSet;

use pyjvm_bytecode::verify::verify_unit;
use pyjvm_bytecode::CompiledUnit;
use tracing::{debug, info_span};

use diagnostics::ModuleDiagnostics;

/// Result of running the pipeline over one module. `units` is empty
/// whenever an error-severity diagnostic was recorded.
#[derive(Debug)]
pub struct ModuleOutput {
    pub name: String,
    pub units: Vec<CompiledUnit>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ModuleOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity >= Severity::Error)
    }

    pub fn worst(&self) -> Option<Severity> {
        self.diagnostics.iter().map(|d| d.severity).max()
    }
}

/// Compile a single module with default options.
pub fn compile(name: &str, source: &str) -> Result<Vec<CompiledUnit>, CompileError> {
    let output = compile_module(name, source, &CompilerOptions::default());
    match output.diagnostics.into_iter().find(|d| d.severity >= Severity::Error) {
        Some(diagnostic) => Err(diagnostic.error),
        None => Ok(output.units),
    }
}

/// Compile a module named by its dotted name; the source file attribute is
/// the last name segment with a `.py` suffix.
pub fn compile_module(name: &str, source: &str, options: &CompilerOptions) -> ModuleOutput {
    let file = format!("{}.py", name.rsplit('.').next().unwrap_or(name));
    compile_source(name, &file, source, options)
}

/// Run lex, parse, resolve, check and emit over one module. Errors of the
/// earlier stages are collected; emission only runs on a clean module.
pub fn compile_source(name: &str, file: &str, source: &str, options: &CompilerOptions) -> ModuleOutput {
    let _span = info_span!("module", module = name).entered();
    let mut diags = ModuleDiagnostics::new(name, options.max_errors_per_module);
    let units = run_pipeline(name, file, source, options, &mut diags).unwrap_or_default();
    let diagnostics = diags.finish();
    let units = if diagnostics.iter().any(|d| d.severity >= Severity::Error) { Vec::new() } else { units };
    ModuleOutput { name: name.to_string(), units, diagnostics }
}

fn run_pipeline(
    name: &str,
    file: &str,
    source: &str,
    options: &CompilerOptions,
    diags: &mut ModuleDiagnostics,
) -> Option<Vec<CompiledUnit>> {
    let (tokens, lex_errors) = info_span!("lex").in_scope(|| lexer::lex(source));
    let bad_lines: HashSet<usize> = lex_errors.iter().filter_map(|e| e.position()).map(|p| p.line).collect();
    let lex_failed = !lex_errors.is_empty();
    diags.extend(lex_errors);

    // Malformed tokens are dropped; syntax errors on their lines only
    // restate the lexical ones.
    let (module, errors) = info_span!("parse").in_scope(|| parser::parse(name, tokens));
    diags.extend(errors.into_iter().filter(|e| !e.position().is_some_and(|p| bad_lines.contains(&p.line))));
    if lex_failed || diags.exhausted() {
        return None;
    }

    let (resolution, errors) = info_span!("resolve").in_scope(|| resolve::resolve(&module));
    diags.extend(errors);
    if diags.exhausted() {
        return None;
    }

    let errors = info_span!("map").in_scope(|| mapper::check_module(&module));
    diags.extend(errors);
    if diags.has_errors() {
        return None;
    }

    let units = match info_span!("emit").in_scope(|| emit::emit_module(&module, &resolution, file, options)) {
        Ok(units) => units,
        Err(e) => {
            diags.push(e);
            return None;
        }
    };
    for unit in &units {
        if let Err(e) = verify_unit(unit) {
            let context = unit.name().unwrap_or(name).to_string();
            diags.push(CompileError::internal(context, e.to_string()));
            return None;
        }
    }
    debug!(units = units.len(), "module compiled");
    Some(units)
}
