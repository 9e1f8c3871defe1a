//! Exception-handler ranges of a `try` inside a loop that breaks out of it.

use pyjvm_bytecode::{abi, CompiledUnit, Insn, MethodInfo};
use pyjvm_compiler::compile;

const SOURCE: &str = "\
def mark(s):
    pass

def scan(items):
    for x in items:
        try:
            mark('inside')
            if x:
                break
        except ValueError:
            mark('handler')
    mark('after')
    return x
";

fn method<'a>(unit: &'a CompiledUnit, name: &str) -> &'a MethodInfo {
    unit.find_method(name, abi::FUNCTION_DESCRIPTOR).expect("method not emitted")
}

/// Byte offset of the `ldc` loading the string `marker`.
fn marker_pc(unit: &CompiledUnit, insns: &[Insn], pcs: &[u32], marker: &str) -> u32 {
    insns
        .iter()
        .zip(pcs)
        .find_map(|(insn, pc)| match insn {
            Insn::Ldc(index) if unit.pool.get_string(*index).ok() == Some(marker) => Some(*pc),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no ldc of '{marker}'"))
}

#[test]
fn test_try_with_break_handler_range() {
    let units = compile("scan", SOURCE).expect("compilation failed");
    let unit = &units[0];
    let code = method(unit, "scan").code.as_ref().expect("scan has a body");
    let pcs = code.offsets();
    let covered = |pc: u32| {
        code.exception_table
            .iter()
            .any(|e| u32::from(e.start_pc) <= pc && pc < u32::from(e.end_pc))
    };

    assert!(!code.exception_table.is_empty());
    for entry in &code.exception_table {
        assert!(entry.start_pc < entry.end_pc);
        assert_eq!(unit.pool.get_class(entry.catch_type).unwrap(), abi::PY_EXCEPTION);
    }

    let inside = marker_pc(unit, &code.insns, &pcs, "inside");
    let handler = marker_pc(unit, &code.insns, &pcs, "handler");
    let after = marker_pc(unit, &code.insns, &pcs, "after");
    assert!(covered(inside), "the protected call is outside every range");
    assert!(!covered(handler), "the except clause protects itself");
    assert!(!covered(after), "code after the loop is protected");

    // The break leaves the loop: its jump and everything from its target on
    // lie outside the protected ranges.
    let break_target = code
        .insns
        .iter()
        .filter_map(|insn| match insn {
            Insn::Goto(target) if *target <= after => Some(*target),
            _ => None,
        })
        .max()
        .expect("no forward jump out of the loop");
    assert!(!covered(break_target));
    for (insn, pc) in code.insns.iter().zip(&pcs) {
        if *insn == Insn::Goto(break_target) {
            assert!(!covered(*pc), "break jump at {pc} is protected");
        }
    }
    for entry in &code.exception_table {
        assert!(u32::from(entry.end_pc) <= break_target);
    }
}

#[test]
fn test_try_with_break_runs() {
    let source = format!("{SOURCE}print(scan([0, 0, 1, 0]))\n");
    let units = compile("scan", &source).expect("compilation failed");
    let mut vm = pyjvm_pylib::Vm::new();
    vm.capture_output();
    for unit in units {
        vm.load_unit(unit).unwrap();
    }
    vm.run_main("scan").unwrap();
    assert_eq!(vm.take_output(), "1\n");
}

#[test]
fn test_finally_inlined_on_break() {
    let source = "\
def f(items):
    for x in items:
        try:
            if x:
                break
        finally:
            print('cleanup')
    return x
";
    let units = compile("fin", source).expect("compilation failed");
    let unit = &units[0];
    let code = method(unit, "f").code.as_ref().unwrap();
    let catch_all = code.exception_table.iter().filter(|e| e.catch_type == 0).count();
    assert!(catch_all >= 1);
    // The finally body appears on the normal path, the break path and the
    // exceptional path.
    let copies = code
        .insns
        .iter()
        .filter(|insn| matches!(insn, Insn::Ldc(i) if unit.pool.get_string(*i).ok() == Some("cleanup")))
        .count();
    assert_eq!(copies, 3);
}
