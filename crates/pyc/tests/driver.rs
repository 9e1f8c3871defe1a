//! Multi-module runs through the driver: discovery, independent failure,
//! unit output and reproducible bytes.

use std::fs;
use std::path::{Path, PathBuf};

use pyjvm_compiler::driver::{self, DriverError};
use pyjvm_compiler::{CompileError, CompilerOptions, Severity};
use pyjvm_pylib::Vm;
use tempfile::TempDir;

fn write(root: &Path, relative: &str, source: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, source).unwrap();
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "good.py", "def ok():\n    return 1\n");
    write(root, "bad.py", "def f():\n    return undefined_name\n");
    write(root, "pkg/__init__.py", "label = 'pkg'\n");
    write(
        root,
        "pkg/util.py",
        "class Scale:\n    def __init__(self, k):\n        self.k = k\n    def apply(self, x):\n        return x * self.k\n\ndef double(x):\n    return Scale(2).apply(x)\n",
    );
    write(
        root,
        "app.py",
        "import pkg.util as u\nfrom pkg.util import double\nfrom pkg import label\nprint(label, u.double(2), double(5))\n",
    );
    write(root, "notes.txt", "not a module\n");
    dir
}

#[test]
fn test_discover_names_modules() {
    let dir = project();
    let modules = driver::discover(&[dir.path().to_path_buf()]).unwrap();
    let names: Vec<&str> = modules.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["app", "bad", "good", "pkg", "pkg.util"]);
    let pkg = modules.iter().find(|m| m.name == "pkg").unwrap();
    assert_eq!(pkg.file_name(), "__init__.py");
}

#[test]
fn test_discover_rejects_duplicates() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    write(first.path(), "m.py", "x = 1\n");
    write(second.path(), "m.py", "x = 2\n");
    let err = driver::discover(&[first.path().to_path_buf(), second.path().to_path_buf()]).unwrap_err();
    assert!(matches!(err, DriverError::DuplicateModule { ref module, .. } if module == "m"));
}

#[test]
fn test_discover_rejects_bad_names() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "my-module.py", "x = 1\n");
    let err = driver::discover(&[dir.path().to_path_buf()]).unwrap_err();
    assert!(matches!(err, DriverError::InvalidModuleName { ref segment, .. } if segment == "my-module"));
}

#[test]
fn test_failing_module_does_not_stop_siblings() {
    let dir = project();
    let modules = driver::discover(&[dir.path().to_path_buf()]).unwrap();
    let build = driver::compile_all(&modules, &CompilerOptions::default());

    assert!(!build.success());
    assert!(!build.aborted);
    assert_eq!(build.failed_modules, ["bad"]);
    assert_eq!(build.worst(), Some(Severity::Error));

    let errors: Vec<_> = build.diagnostics.iter().filter(|d| d.severity >= Severity::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].module, "bad");
    assert!(matches!(
        &errors[0].error,
        CompileError::UnresolvedName { line: 2, col: 12, name, .. } if name == "undefined_name"
    ));

    let names: Vec<String> = build.units.iter().map(|u| u.name().unwrap().to_string()).collect();
    assert!(names.contains(&"good".to_string()));
    assert!(names.contains(&"pkg/util".to_string()));
    assert!(names.contains(&"pkg/util$Scale".to_string()));
    assert!(!names.iter().any(|n| n.starts_with("bad")));
}

#[test]
fn test_write_and_run_units() {
    let dir = project();
    fs::remove_file(dir.path().join("bad.py")).unwrap();
    let modules = driver::discover(&[dir.path().to_path_buf()]).unwrap();
    let build = driver::compile_all(&modules, &CompilerOptions::default());
    assert!(build.success(), "{:?}", build.diagnostics);

    let out = TempDir::new().unwrap();
    let written = driver::write_units(&build.units, out.path()).unwrap();
    assert_eq!(written.len(), build.units.len());
    assert!(out.path().join("pkg/util$Scale.class").is_file());
    assert!(out.path().join("app.class").is_file());

    let mut vm = Vm::new();
    vm.capture_output();
    for path in &written {
        vm.load_bytes(&fs::read(path).unwrap()).unwrap();
    }
    vm.run_main("app").unwrap();
    assert_eq!(vm.take_output(), "pkg 4 10\n");
}

#[test]
fn test_output_is_reproducible() {
    let dir = project();
    let roots: Vec<PathBuf> = vec![dir.path().to_path_buf()];
    let modules = driver::discover(&roots).unwrap();
    let parallel = driver::compile_all(&modules, &CompilerOptions::default());
    let sequential = driver::compile_all(&modules, &CompilerOptions { parallel: false, ..Default::default() });
    let again = driver::compile_all(&modules, &CompilerOptions::default());

    let a = driver::encode_units(&parallel.units).unwrap();
    let b = driver::encode_units(&sequential.units).unwrap();
    let c = driver::encode_units(&again.units).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(parallel.diagnostics, sequential.diagnostics);
}

#[test]
fn test_collect_resources() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "data/config.json", "{}");
    write(dir.path(), "readme.txt", "hi");
    let resources = driver::collect_resources(dir.path()).unwrap();
    let keys: Vec<&str> = resources.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["data/config.json", "readme.txt"]);
    assert_eq!(resources[1].1, b"hi");
}
