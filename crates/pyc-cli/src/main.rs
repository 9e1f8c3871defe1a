use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing::{debug, info, Level};

use pyjvm_bytecode::CompiledUnit;
use pyjvm_compiler::driver;
use pyjvm_compiler::{CompilerOptions, Severity};
use pyjvm_pylib::{Vm, VmError};

mod archive;
#[cfg(test)]
mod tests;

use archive::{Entry, EntryKind};

#[derive(Parser)]
#[command(name = "pyjvm", about = "pyjvm: compile Python-like sources to JVM class files")]
struct Cli {
    /// Log pipeline stages to stderr (also enabled by PYJVM_DEBUG=1).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile every module under the source roots.
    Compile {
        /// Source root directories.
        #[arg(required = true)]
        roots: Vec<PathBuf>,
        /// Resource root; its files are bundled into the archive.
        #[arg(long)]
        resources: Option<PathBuf>,
        /// Output directory for class files. Defaults to `out` unless only
        /// an archive is requested.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also bundle units and resources into this archive.
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Print diagnostics as JSON lines on stdout.
        #[arg(long)]
        json: bool,
        /// Error diagnostics per module before the module is abandoned.
        #[arg(long)]
        max_errors: Option<usize>,
        /// Compiler options file (JSON); flags override it.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Compile modules one at a time.
        #[arg(long)]
        sequential: bool,
    },
    /// Run a module from an output directory or archive.
    Run {
        /// Output directory or archive file.
        input: PathBuf,
        /// Dotted module name to run as `__main__`.
        module: String,
        /// Maximum interpreted instructions.
        #[arg(long)]
        max_steps: Option<u64>,
        /// Program arguments, visible as `sys.argv[1:]`.
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Print a class file as JSON.
    Inspect {
        /// Class file (.class).
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    }
}

fn debug_enabled(verbose: bool) -> bool {
    verbose || std::env::var("PYJVM_DEBUG").is_ok_and(|v| !v.is_empty() && v != "0")
}

fn init_tracing(verbose: bool) {
    let level = if debug_enabled(verbose) { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Compile { roots, resources, output, archive, json, max_errors, config, sequential } => {
            let mut options = match &config {
                Some(path) => CompilerOptions::from_json(&fs::read_to_string(path)?)?,
                None => CompilerOptions::default(),
            };
            if let Some(max) = max_errors {
                options.max_errors_per_module = max;
            }
            if sequential {
                options.parallel = false;
            }
            let output = match (&output, &archive) {
                (None, Some(_)) => None,
                (None, None) => Some(PathBuf::from("out")),
                (Some(dir), _) => Some(dir.clone()),
            };
            compile(&roots, resources.as_deref(), output.as_deref(), archive.as_deref(), json, &options)
        }
        Command::Run { input, module, max_steps, args } => {
            let mut vm = Vm::new();
            if let Some(max) = max_steps {
                vm.set_max_steps(max);
            }
            vm.set_argv(std::iter::once(module.clone()).chain(args).collect());
            load_input(&mut vm, &input)?;
            run_module(&mut vm, &module)
        }
        Command::Inspect { file } => {
            let unit = CompiledUnit::from_bytes(&fs::read(&file)?)?;
            println!("{}", unit.to_json()?);
            Ok(0)
        }
    }
}

/// Run `module` as `__main__` and map its outcome to a process exit code.
fn run_module(vm: &mut Vm, module: &str) -> Result<i32, Box<dyn std::error::Error>> {
    let result = vm.run_main(module);
    let stats = vm.stats();
    debug!(
        instructions = stats.instructions,
        calls = stats.calls,
        max_depth = stats.max_depth,
        "run finished"
    );
    match result {
        Ok(_) => Ok(0),
        Err(VmError::Exception(exc)) => match exc.exit_status() {
            Some((status, message)) => {
                if let Some(message) = message {
                    eprintln!("{message}");
                }
                Ok(status)
            }
            None => {
                eprintln!("Traceback: uncaught exception");
                eprintln!("{exc}");
                Ok(1)
            }
        },
        Err(e) => Err(e.into()),
    }
}

fn compile(
    roots: &[PathBuf],
    resources: Option<&Path>,
    output: Option<&Path>,
    archive_path: Option<&Path>,
    json: bool,
    options: &CompilerOptions,
) -> Result<i32, Box<dyn std::error::Error>> {
    let modules = driver::discover(roots)?;
    info!(modules = modules.len(), "compiling");
    let build = driver::compile_all(&modules, options);

    for diagnostic in &build.diagnostics {
        if json {
            println!("{}", diagnostic.to_json());
        } else {
            eprintln!("{diagnostic}");
        }
    }

    if build.aborted {
        eprintln!("error: internal compiler fault, no output written");
        return Ok(1);
    }

    if let Some(dir) = output {
        let written = driver::write_units(&build.units, dir)?;
        info!(count = written.len(), dir = %dir.display(), "wrote class files");
    }
    if let Some(path) = archive_path {
        let entries = archive_entries(&build.units, resources)?;
        archive::write(path, &entries)?;
        info!(entries = entries.len(), path = %path.display(), "wrote archive");
    }

    let errors = build.diagnostics.iter().filter(|d| d.severity >= Severity::Error).count();
    let warnings = build.diagnostics.iter().filter(|d| d.severity == Severity::Warning).count();
    if !json {
        eprintln!(
            "compiled {} module(s) into {} unit(s): {errors} error(s), {warnings} warning(s)",
            modules.len() - build.failed_modules.len(),
            build.units.len()
        );
    }
    Ok(if build.success() { 0 } else { 1 })
}

fn archive_entries(units: &[CompiledUnit], resources: Option<&Path>) -> Result<Vec<Entry>, Box<dyn std::error::Error>> {
    let mut entries = Vec::new();
    for (path, data) in driver::encode_units(units)? {
        let name = path.to_string_lossy().replace('\\', "/");
        entries.push(Entry { kind: EntryKind::Unit, name, data });
    }
    if let Some(root) = resources {
        for (name, data) in driver::collect_resources(root)? {
            entries.push(Entry { kind: EntryKind::Resource, name, data });
        }
    }
    Ok(entries)
}

/// Load every unit of an output directory or archive into `vm`.
fn load_input(vm: &mut Vm, input: &Path) -> Result<usize, Box<dyn std::error::Error>> {
    let mut count = 0;
    if input.is_dir() {
        let mut files = Vec::new();
        class_files(input, &mut files)?;
        for path in files {
            vm.load_bytes(&fs::read(&path)?)?;
            count += 1;
        }
    } else {
        for entry in archive::read(input)? {
            if entry.kind == EntryKind::Unit {
                vm.load_bytes(&entry.data)?;
                count += 1;
            }
        }
    }
    debug!(units = count, input = %input.display(), "loaded units");
    Ok(count)
}

fn class_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir)?.map(|e| e.map(|e| e.path())).collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            class_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("class") {
            out.push(path);
        }
    }
    Ok(())
}
