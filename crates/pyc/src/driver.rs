//! Multi-module driver: source discovery, parallel compilation and unit
//! output.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use pyjvm_bytecode::CompiledUnit;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info, info_span};

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::Severity;
use crate::options::CompilerOptions;
use crate::{compile_source, ModuleOutput};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("module '{module}' is defined by both {first} and {second}")]
    DuplicateModule { module: String, first: PathBuf, second: PathBuf },

    #[error("{path}: '{segment}' is not a valid module name")]
    InvalidModuleName { path: PathBuf, segment: String },

    #[error("unit {unit}: {msg}")]
    Encode { unit: String, msg: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DriverError + '_ {
    move |source| DriverError::Io { path: path.to_path_buf(), source }
}

/// One module found under a source root.
#[derive(Debug, Clone)]
pub struct SourceModule {
    pub name: String,
    pub path: PathBuf,
    pub source: String,
}

impl SourceModule {
    /// File name recorded in the unit's source file attribute.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.py", self.name))
    }
}

/// Find every `*.py` file under `roots` and read it. Modules come back
/// sorted by dotted name.
pub fn discover(roots: &[PathBuf]) -> Result<Vec<SourceModule>, DriverError> {
    let mut modules: Vec<SourceModule> = Vec::new();
    for root in roots {
        let mut files = Vec::new();
        walk(root, &mut files)?;
        for path in files {
            if path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let Some(name) = module_name(root, &path)? else {
                continue;
            };
            if let Some(existing) = modules.iter().find(|m| m.name == name) {
                return Err(DriverError::DuplicateModule {
                    module: name,
                    first: existing.path.clone(),
                    second: path,
                });
            }
            let source = fs::read_to_string(&path).map_err(io_error(&path))?;
            modules.push(SourceModule { name, path, source });
        }
    }
    modules.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(count = modules.len(), "discovered modules");
    Ok(modules)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DriverError> {
    let mut entries = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(dir))?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Dotted module name of `path` relative to `root`; `pkg/__init__.py` is
/// `pkg`. A root-level `__init__.py` names no module.
fn module_name(root: &Path, path: &Path) -> Result<Option<String>, DriverError> {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    let mut segments: Vec<String> =
        relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    if segments.last().map(String::as_str) == Some("__init__") {
        segments.pop();
    }
    if segments.is_empty() {
        return Ok(None);
    }
    for segment in &segments {
        let mut chars = segment.chars();
        let valid = chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_');
        if !valid {
            return Err(DriverError::InvalidModuleName { path: path.to_path_buf(), segment: segment.clone() });
        }
    }
    Ok(Some(segments.join(".")))
}

/// Outcome of compiling a set of modules.
#[derive(Debug)]
pub struct BuildOutput {
    /// Units of every module that compiled cleanly, in module order.
    pub units: Vec<CompiledUnit>,
    /// Diagnostics of every module, sorted by module then position.
    pub diagnostics: Vec<Diagnostic>,
    /// Set when an internal fault stopped the run.
    pub aborted: bool,
    pub failed_modules: Vec<String>,
}

impl BuildOutput {
    pub fn worst(&self) -> Option<Severity> {
        self.diagnostics.iter().map(|d| d.severity).max()
    }

    /// True when no diagnostic of error severity or worse was produced.
    pub fn success(&self) -> bool {
        !self.aborted && !matches!(self.worst(), Some(s) if s >= Severity::Error)
    }
}

/// Compile every module. Module pipelines are independent; a failing module
/// does not stop its siblings, but an internal fault stops modules that have
/// not started yet.
pub fn compile_all(modules: &[SourceModule], options: &CompilerOptions) -> BuildOutput {
    let _span = info_span!("build", modules = modules.len()).entered();
    let sink = DiagnosticSink::new();
    let aborted = AtomicBool::new(false);

    let compile_one = |module: &SourceModule| -> Option<ModuleOutput> {
        if aborted.load(Ordering::SeqCst) {
            return None;
        }
        let mut output = compile_source(&module.name, &module.file_name(), &module.source, options);
        if output.worst() == Some(Severity::Fatal) {
            error!(module = %module.name, "internal fault, aborting the run");
            aborted.store(true, Ordering::SeqCst);
        }
        sink.extend(std::mem::take(&mut output.diagnostics));
        Some(output)
    };

    let outputs: Vec<Option<ModuleOutput>> = if options.parallel {
        modules.par_iter().map(compile_one).collect()
    } else {
        modules.iter().map(compile_one).collect()
    };

    let aborted = aborted.load(Ordering::SeqCst);
    let mut units = Vec::new();
    let mut failed_modules = Vec::new();
    let diagnostics = sink.into_sorted();
    for (module, output) in modules.iter().zip(outputs) {
        let Some(output) = output else {
            continue;
        };
        let failed = diagnostics.iter().any(|d| d.module == module.name && d.severity >= Severity::Error);
        if failed {
            failed_modules.push(module.name.clone());
        } else if !aborted {
            units.extend(output.units);
        }
    }
    info!(units = units.len(), failed = failed_modules.len(), aborted, "build finished");
    BuildOutput { units, diagnostics, aborted, failed_modules }
}

/// Relative path of a unit's class file: `pkg/mod$C` becomes
/// `pkg/mod$C.class`.
pub fn unit_path(unit: &CompiledUnit) -> Result<PathBuf, DriverError> {
    let name = unit_name(unit)?;
    Ok(PathBuf::from(format!("{name}.class")))
}

fn unit_name(unit: &CompiledUnit) -> Result<String, DriverError> {
    unit.name()
        .map(str::to_string)
        .map_err(|e| DriverError::Encode { unit: "<unnamed>".into(), msg: e.to_string() })
}

/// Encode every unit, keyed by its relative class file path.
pub fn encode_units(units: &[CompiledUnit]) -> Result<Vec<(PathBuf, Vec<u8>)>, DriverError> {
    units
        .iter()
        .map(|unit| {
            let path = unit_path(unit)?;
            let bytes = unit
                .to_bytes()
                .map_err(|e| DriverError::Encode { unit: path.display().to_string(), msg: e.to_string() })?;
            Ok((path, bytes))
        })
        .collect()
}

/// Write each unit as `<unit>.class` under `out_dir`.
pub fn write_units(units: &[CompiledUnit], out_dir: &Path) -> Result<Vec<PathBuf>, DriverError> {
    let mut written = Vec::new();
    for (relative, bytes) in encode_units(units)? {
        let path = out_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::write(&path, bytes).map_err(io_error(&path))?;
        written.push(path);
    }
    debug!(count = written.len(), dir = %out_dir.display(), "wrote units");
    Ok(written)
}

/// Every regular file under a resource root, keyed by its `/`-separated
/// relative path, sorted.
pub fn collect_resources(root: &Path) -> Result<Vec<(String, Vec<u8>)>, DriverError> {
    let mut files = Vec::new();
    walk(root, &mut files)?;
    let mut resources = Vec::with_capacity(files.len());
    for path in files {
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let data = fs::read(&path).map_err(io_error(&path))?;
        resources.push((key, data));
    }
    Ok(resources)
}
