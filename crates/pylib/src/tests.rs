#[cfg(test)]
mod tests {
    use num_bigint::BigInt;
    use proptest::prelude::*;
    use pyjvm_bytecode::abi::{self, RuntimeEntry};
    use pyjvm_bytecode::unit::{ACC_PUBLIC, ACC_STATIC};
    use pyjvm_bytecode::verify::analyze_stack;
    use pyjvm_bytecode::{Code, CompiledUnit, Insn, Operator};

    use crate::format::parse_format_spec;
    use crate::number::float_repr;
    use crate::ops::c3_linearize;
    use crate::value::{Args, Value};
    use crate::vm::{Slot, Vm};
    use crate::VmError;

    fn int(i: i64) -> Value {
        Value::int(i)
    }

    fn s(text: &str) -> Value {
        Value::str(text)
    }

    fn repr(vm: &mut Vm, v: &Value) -> String {
        vm.repr(v).unwrap()
    }

    fn builtin(vm: &Vm, name: &str) -> Value {
        vm.builtin(name).unwrap()
    }

    /// Call a method on `target` the way emitted code does: attribute
    /// lookup followed by a call of the bound result.
    fn method(vm: &mut Vm, target: &Value, name: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let bound = vm.getattr(target, name)?;
        vm.call(&bound, args)
    }

    fn exception_class(err: VmError) -> String {
        match err {
            VmError::Exception(e) => e.class_name(),
            other => panic!("expected a raised exception, got {other:?}"),
        }
    }

    /// A unit whose `<clinit>` runs `insns`.
    fn module_unit(name: &str, build: impl FnOnce(&mut CompiledUnit) -> Vec<Insn>) -> CompiledUnit {
        let mut unit = CompiledUnit::new(name, abi::JAVA_OBJECT).unwrap();
        unit.add_field(ACC_PUBLIC | ACC_STATIC, abi::MODULE_NAME, abi::OBJ).unwrap();
        let insns = build(&mut unit);
        let code = Code { max_stack: 0, max_locals: 1, insns, exception_table: vec![], line_numbers: vec![] };
        let max_stack = analyze_stack(&unit.pool, &code).unwrap();
        let code = Code { max_stack, ..code };
        unit.add_method(ACC_STATIC, abi::CLINIT, abi::CLINIT_DESCRIPTOR, code, None).unwrap();
        unit
    }

    fn runtime(unit: &mut CompiledUnit, entry: RuntimeEntry) -> u16 {
        let m = entry.method();
        unit.pool.method_ref(m.class, m.name, m.descriptor).unwrap()
    }

    /// `print(text)` followed by `return`.
    fn print_insns(unit: &mut CompiledUnit, text: &str) -> Vec<Insn> {
        let print = unit.pool.string("print").unwrap();
        let literal = unit.pool.string(text).unwrap();
        let obj_class = unit.pool.class(abi::PY_OBJECT).unwrap();
        vec![
            Insn::Ldc(print),
            Insn::Invokestatic(runtime(unit, RuntimeEntry::Builtin)),
            Insn::Iconst(1),
            Insn::Anewarray(obj_class),
            Insn::Dup,
            Insn::Iconst(0),
            Insn::Ldc(literal),
            Insn::Invokestatic(runtime(unit, RuntimeEntry::Str)),
            Insn::Aastore,
            Insn::Invokestatic(runtime(unit, RuntimeEntry::Call)),
            Insn::Pop,
            Insn::Return,
        ]
    }

    // --- Numbers ---

    #[test]
    fn test_int_arithmetic_is_unbounded() {
        let mut vm = Vm::new();
        let big = vm.binop(Operator::Pow, &int(2), &int(100)).unwrap();
        assert_eq!(repr(&mut vm, &big), "1267650600228229401496703205376");
        let product = vm.binop(Operator::Mul, &big, &big).unwrap();
        assert!(matches!(product, Value::Int(ref i) if i.bits() == 201));
    }

    #[test]
    fn test_true_division_of_ints_floors() {
        let mut vm = Vm::new();
        let q = vm.binop(Operator::Div, &int(7), &int(2)).unwrap();
        assert_eq!(repr(&mut vm, &q), "3");
        let q = vm.binop(Operator::Div, &int(-7), &int(2)).unwrap();
        assert_eq!(repr(&mut vm, &q), "-4");
        let q = vm.binop(Operator::Div, &Value::Float(7.0), &int(2)).unwrap();
        assert_eq!(repr(&mut vm, &q), "3.5");
    }

    #[test]
    fn test_division_by_zero_raises() {
        let mut vm = Vm::new();
        let err = vm.binop(Operator::FloorDiv, &int(1), &int(0)).unwrap_err();
        assert_eq!(exception_class(err), "ZeroDivisionError");
        let err = vm.binop(Operator::Mod, &Value::Float(1.0), &Value::Float(0.0)).unwrap_err();
        assert_eq!(exception_class(err), "ZeroDivisionError");
    }

    #[test]
    fn test_mixed_comparisons() {
        let mut vm = Vm::new();
        assert!(vm.eq(&int(1), &Value::Float(1.0)).unwrap());
        assert!(vm.eq(&Value::Bool(true), &int(1)).unwrap());
        assert!(vm.lt(&int(1), &Value::Float(1.5)).unwrap());
        let err = vm.lt(&int(1), &s("a")).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
    }

    #[test]
    fn test_round_negative_ndigits() {
        let mut vm = Vm::new();
        let round = builtin(&vm, "round");
        let mut call = |x: Value, n: i64| {
            let v = vm.call(&round, vec![x, int(n)]).unwrap();
            repr(&mut vm, &v)
        };
        assert_eq!(call(int(1234), -2), "1200");
        assert_eq!(call(int(25), -1), "20");
        assert_eq!(call(int(35), -1), "40");
        assert_eq!(call(int(1), -1_000_000_000), "0");
        assert_eq!(call(int(-7), i64::MIN), "0");
        assert_eq!(call(Value::Float(1.5), -400), "0.0");
    }

    #[test]
    fn test_float_repr_shortest_round_trip() {
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(-0.0), "-0.0");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-7), "1.5e-07");
        assert_eq!(float_repr(f64::INFINITY), "inf");
        assert_eq!(float_repr(f64::NAN), "nan");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_floor_div_and_mod_agree(a in -10_000i64..10_000, b in -500i64..500) {
            prop_assume!(b != 0);
            let mut vm = Vm::new();
            let q = vm.binop(Operator::FloorDiv, &int(a), &int(b)).unwrap();
            let r = vm.binop(Operator::Mod, &int(a), &int(b)).unwrap();
            let (Value::Int(q), Value::Int(r)) = (q, r) else {
                panic!("integer operands must give integer results");
            };
            prop_assert_eq!(&q * BigInt::from(b) + &r, BigInt::from(a));
            prop_assert!(r == BigInt::from(0) || (r < BigInt::from(0)) == (b < 0));
            prop_assert_eq!(q, BigInt::from(a.div_euclid(b) - i64::from(b < 0 && a.rem_euclid(b) != 0)));
        }

        #[test]
        fn test_float_repr_parses_back(x in proptest::num::f64::NORMAL) {
            let text = float_repr(x);
            prop_assert_eq!(text.parse::<f64>().unwrap(), x);
        }
    }

    // --- Strings and formatting ---

    #[test]
    fn test_repr_of_containers() {
        let mut vm = Vm::new();
        let items = Value::list(vec![int(1), s("a'b"), Value::None, Value::tuple(vec![int(2)])]);
        assert_eq!(repr(&mut vm, &items), "[1, \"a'b\", None, (2,)]");
        let d = vm.make_dict(vec![(s("k"), Value::Float(2.5))]).unwrap();
        assert_eq!(repr(&mut vm, &d), "{'k': 2.5}");
        let empty = vm.make_set(vec![]).unwrap();
        assert_eq!(repr(&mut vm, &empty), "set()");
    }

    #[test]
    fn test_recursive_list_repr() {
        let mut vm = Vm::new();
        let list = Value::list(vec![int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(repr(&mut vm, &list), "[1, [...]]");
    }

    #[test]
    fn test_str_format_fields() {
        let mut vm = Vm::new();
        let args = Args {
            receiver: None,
            positional: vec![int(42), Value::Float(2.71828)],
            keywords: vec![("name".to_string(), s("x"))],
        };
        let out = vm.format_str("{name}={0:>5}|{1:.2f}|{0:#x}|{{}}", &args).unwrap();
        assert_eq!(out, "x=   42|2.72|0x2a|{}");
    }

    #[test]
    fn test_format_spec_parsing() {
        let spec = parse_format_spec("*^+#010,.3e").unwrap();
        assert_eq!(spec.fill, Some('*'));
        assert_eq!(spec.align, Some('^'));
        assert_eq!(spec.width, 10);
        assert!(spec.zero && spec.alternate);
        assert_eq!(spec.grouping, Some(','));
        assert_eq!(spec.precision, Some(3));
        assert_eq!(spec.kind, Some('e'));
        assert!(parse_format_spec("10q!").is_none());
    }

    #[test]
    fn test_percent_formatting() {
        let mut vm = Vm::new();
        let args = Value::tuple(vec![s("r"), Value::Float(1.23456), int(7)]);
        let out = vm.binop(Operator::Mod, &s("%s=%.3f [%03d] 100%%"), &args).unwrap();
        assert_eq!(repr(&mut vm, &out), "'r=1.235 [007] 100%'");
        let err = vm.binop(Operator::Mod, &s("%d %d"), &Value::tuple(vec![int(1)])).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
    }

    #[test]
    fn test_string_methods() {
        let mut vm = Vm::new();
        let parts = method(&mut vm, &s("  a  b c "), "split", vec![]).unwrap();
        assert_eq!(repr(&mut vm, &parts), "['a', 'b', 'c']");
        let parts = method(&mut vm, &s("a,b,,c"), "split", vec![s(","), int(2)]).unwrap();
        assert_eq!(repr(&mut vm, &parts), "['a', 'b', ',c']");
        let joined = method(&mut vm, &s("-"), "join", vec![Value::list(vec![s("x"), s("y")])]).unwrap();
        assert_eq!(repr(&mut vm, &joined), "'x-y'");
        let found = method(&mut vm, &s("héllo"), "find", vec![s("l")]).unwrap();
        assert_eq!(repr(&mut vm, &found), "2");
        let filled = method(&mut vm, &s("-42"), "zfill", vec![int(6)]).unwrap();
        assert_eq!(repr(&mut vm, &filled), "'-00042'");
        let err = method(&mut vm, &s("x"), "join", vec![Value::list(vec![int(1)])]).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
    }

    #[test]
    fn test_slicing() {
        let mut vm = Vm::new();
        let list = Value::list((0..10).map(int).collect());
        let slice = vm.native(RuntimeEntry::Slice, vec![Slot::Null, Slot::Null, Slot::Obj(int(-3))]).unwrap();
        let Slot::Obj(slice) = slice else { panic!("slice must be an object") };
        let picked = vm.getitem(&list, &slice).unwrap();
        assert_eq!(repr(&mut vm, &picked), "[9, 6, 3, 0]");
        let word = vm.getitem(&s("hello"), &slice).unwrap();
        assert_eq!(repr(&mut vm, &word), "'oe'");
    }

    // --- Containers ---

    #[test]
    fn test_list_methods() {
        let mut vm = Vm::new();
        let list = Value::list(vec![int(3), int(1), int(2)]);
        method(&mut vm, &list, "append", vec![int(0)]).unwrap();
        method(&mut vm, &list, "sort", vec![]).unwrap();
        assert_eq!(repr(&mut vm, &list), "[0, 1, 2, 3]");
        let popped = method(&mut vm, &list, "pop", vec![]).unwrap();
        assert_eq!(repr(&mut vm, &popped), "3");
        let err = method(&mut vm, &list, "remove", vec![int(9)]).unwrap_err();
        assert_eq!(exception_class(err), "ValueError");
    }

    #[test]
    fn test_sort_with_key_and_reverse_is_stable() {
        let mut vm = Vm::new();
        let words = Value::list(vec![s("bb"), s("a"), s("cc"), s("d")]);
        let key = builtin(&vm, "len");
        let sorted = builtin(&vm, "sorted");
        let args = Args {
            receiver: None,
            positional: vec![words],
            keywords: vec![("key".to_string(), key), ("reverse".to_string(), Value::Bool(true))],
        };
        let out = vm.call_value(&sorted, args).unwrap();
        assert_eq!(repr(&mut vm, &out), "['bb', 'cc', 'a', 'd']");
    }

    #[test]
    fn test_dict_preserves_insertion_order() {
        let mut vm = Vm::new();
        let d = vm.make_dict(vec![(s("b"), int(1)), (s("a"), int(2))]).unwrap();
        vm.setitem(&d, &s("c"), int(3)).unwrap();
        vm.setitem(&d, &s("b"), int(4)).unwrap();
        let keys = method(&mut vm, &d, "keys", vec![]).unwrap();
        assert_eq!(repr(&mut vm, &keys), "['b', 'a', 'c']");
        assert!(vm.eq(&int(1), &Value::Float(1.0)).unwrap());
        vm.setitem(&d, &Value::Float(1.0), s("one")).unwrap();
        let one = vm.getitem(&d, &int(1)).unwrap();
        assert_eq!(repr(&mut vm, &one), "'one'");
        let err = vm.getitem(&d, &s("zz")).unwrap_err();
        assert_eq!(exception_class(err), "KeyError");
    }

    #[test]
    fn test_unhashable_key_raises() {
        let mut vm = Vm::new();
        let err = vm.make_set(vec![Value::list(vec![])]).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
    }

    #[test]
    fn test_unpack_count_mismatch() {
        let mut vm = Vm::new();
        let err = vm.unpack(&Value::tuple(vec![int(1), int(2), int(3)]), 2).unwrap_err();
        assert_eq!(exception_class(err), "ValueError");
        let items = vm.unpack(&s("ab"), 2).unwrap();
        assert_eq!(items.len(), 2);
    }

    // --- Classes ---

    #[test]
    fn test_c3_diamond() {
        let vm = Vm::new();
        let a = vm.new_class("A", vec![]).unwrap();
        let b = vm.new_class("B", vec![a.clone()]).unwrap();
        let c = vm.new_class("C", vec![a.clone()]).unwrap();
        let d = vm.new_class("D", vec![b, c]).unwrap();
        let names: Vec<String> = d.mro().iter().map(|k| k.name.clone()).collect();
        assert_eq!(names, ["D", "B", "C", "A", "object"]);
    }

    #[test]
    fn test_c3_rejects_inconsistent_order() {
        let vm = Vm::new();
        let x = vm.new_class("X", vec![]).unwrap();
        let y = vm.new_class("Y", vec![]).unwrap();
        let a = vm.new_class("A", vec![x.clone(), y.clone()]).unwrap();
        let b = vm.new_class("B", vec![y, x]).unwrap();
        assert!(format!("{a:?}").contains(r#"ancestors: ["X", "Y", "object"]"#), "{a:?}");
        assert!(c3_linearize(&[a.clone(), b.clone()]).is_none());
        let err = vm.new_class("Z", vec![a, b]).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
    }

    #[test]
    fn test_exception_hierarchy() {
        let mut vm = Vm::new();
        let key_error = builtin(&vm, "KeyError");
        let lookup = builtin(&vm, "LookupError");
        let issubclass = builtin(&vm, "issubclass");
        let yes = vm.call(&issubclass, vec![key_error.clone(), lookup]).unwrap();
        assert!(matches!(yes, Value::Bool(true)));
        let exc = vm.call(&key_error, vec![s("k")]).unwrap();
        let text = vm.to_str(&exc).unwrap();
        assert_eq!(text, "'k'");
        assert_eq!(repr(&mut vm, &exc), "KeyError('k')");
    }

    #[test]
    fn test_every_builtin_name_is_installed() {
        let vm = Vm::new();
        for name in abi::BUILTINS {
            assert!(vm.builtin(name).is_ok(), "missing builtin {name}");
        }
    }

    // --- Loading and running units ---

    #[test]
    fn test_clinit_runs_on_import() {
        let mut vm = Vm::new();
        vm.capture_output();
        let unit = module_unit("hello", |u| print_insns(u, "hi there"));
        vm.load_unit(unit).unwrap();
        assert_eq!(vm.take_output(), "");
        vm.import("hello").unwrap();
        vm.import("hello").unwrap();
        assert_eq!(vm.take_output(), "hi there\n");
        assert_eq!(vm.stats().modules_imported, 1);
    }

    #[test]
    fn test_unit_round_trips_through_bytes() {
        let mut vm = Vm::new();
        vm.capture_output();
        let unit = module_unit("pkg/inner", |u| print_insns(u, "inner"));
        let bytes = unit.to_bytes().unwrap();
        vm.load_bytes(&bytes).unwrap();
        let module = vm.import("pkg.inner").unwrap();
        assert_eq!(repr(&mut vm, &module), "<module 'pkg.inner'>");
        assert_eq!(vm.take_output(), "inner\n");
        let parent = vm.cached_module("pkg");
        assert!(parent.is_some());
    }

    #[test]
    fn test_missing_module_raises() {
        let mut vm = Vm::new();
        let err = vm.import("nowhere").unwrap_err();
        assert_eq!(exception_class(err), "ModuleNotFoundError");
    }

    #[test]
    fn test_duplicate_unit_rejected() {
        let mut vm = Vm::new();
        vm.load_unit(module_unit("dup", |u| print_insns(u, "x"))).unwrap();
        let err = vm.load_unit(module_unit("dup", |u| print_insns(u, "x"))).unwrap_err();
        assert!(matches!(err, VmError::DuplicateUnit(name) if name == "dup"));
    }

    #[test]
    fn test_step_limit() {
        let mut vm = Vm::new();
        vm.set_max_steps(3);
        vm.load_unit(module_unit("spin", |u| print_insns(u, "x"))).unwrap();
        let err = vm.import("spin").unwrap_err();
        assert!(matches!(err, VmError::ExecutionLimitExceeded(3)));
    }

    #[test]
    fn test_math_module() {
        let mut vm = Vm::new();
        let math = vm.import("math").unwrap();
        let sqrt = vm.getattr(&math, "sqrt").unwrap();
        let root = vm.call(&sqrt, vec![int(16)]).unwrap();
        assert_eq!(repr(&mut vm, &root), "4.0");
        let floor = vm.getattr(&math, "floor").unwrap();
        let down = vm.call(&floor, vec![Value::Float(-1.5)]).unwrap();
        assert_eq!(repr(&mut vm, &down), "-2");
    }

    /// A unit not produced by the compiler: a `VERSION` string set by
    /// `<clinit>` plus static `echo` and `pick` methods.
    fn host_unit() -> CompiledUnit {
        let mut unit = CompiledUnit::new("demo/Greeter", abi::JAVA_OBJECT).unwrap();
        unit.add_field(ACC_PUBLIC | ACC_STATIC, "VERSION", "Ljava/lang/String;").unwrap();
        let version = unit.pool.string("1.2").unwrap();
        let field = unit.pool.field_ref("demo/Greeter", "VERSION", "Ljava/lang/String;").unwrap();
        let clinit = vec![Insn::Ldc(version), Insn::Putstatic(field), Insn::Return];
        let methods = [
            (abi::CLINIT, abi::CLINIT_DESCRIPTOR, clinit, 0),
            ("echo", "(Ljava/lang/String;)Ljava/lang/String;", vec![Insn::Aload(0), Insn::Areturn], 1),
            ("echo", "(Lpylib/PyObject;)Lpylib/PyObject;", vec![Insn::Aload(0), Insn::Areturn], 1),
            ("pick", "(Ljava/lang/String;Ljava/lang/String;)Ljava/lang/String;", vec![Insn::Aload(1), Insn::Areturn], 2),
        ];
        for (name, descriptor, insns, max_locals) in methods {
            let code = Code { max_stack: 0, max_locals, insns, exception_table: vec![], line_numbers: vec![] };
            let max_stack = analyze_stack(&unit.pool, &code).unwrap();
            let code = Code { max_stack, ..code };
            unit.add_method(ACC_PUBLIC | ACC_STATIC, name, descriptor, code, None).unwrap();
        }
        unit
    }

    #[test]
    fn test_host_unit_statics_and_overloads() {
        let mut vm = Vm::new();
        vm.load_unit(host_unit()).unwrap();
        assert!(vm.unit("demo/Greeter").unwrap().is_host());
        let greeter = vm.import("demo.Greeter").unwrap();
        let version = vm.getattr(&greeter, "VERSION").unwrap();
        assert_eq!(repr(&mut vm, &version), "'1.2'");

        let echo = vm.getattr(&greeter, "echo").unwrap();
        assert_eq!(repr(&mut vm, &echo), "<host method demo.Greeter.echo>");
        let text = vm.call(&echo, vec![s("hi")]).unwrap();
        assert_eq!(repr(&mut vm, &text), "'hi'");
        let items = Value::list(vec![int(5)]);
        let same = vm.call(&echo, vec![items.clone()]).unwrap();
        assert!(same.is(&items));

        let pick = vm.getattr(&greeter, "pick").unwrap();
        let second = vm.call(&pick, vec![s("a"), s("b")]).unwrap();
        assert_eq!(repr(&mut vm, &second), "'b'");
        let err = vm.call(&pick, vec![s("a"), int(1)]).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
        let err = vm.call(&pick, vec![s("a")]).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
    }

    #[test]
    fn test_host_unit_hides_initializers_and_rejects_stores() {
        let mut vm = Vm::new();
        vm.load_unit(host_unit()).unwrap();
        let greeter = vm.import("demo.Greeter").unwrap();
        let err = vm.getattr(&greeter, abi::CLINIT).unwrap_err();
        assert_eq!(exception_class(err), "AttributeError");
        let err = vm.setattr(&greeter, "VERSION", s("2.0")).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
        assert!(matches!(vm.unit("demo/Greeter").unwrap().get_static("VERSION"), Slot::Str(v) if &*v == "1.2"));
    }

    #[test]
    fn test_module_units_are_not_host_units() {
        let mut vm = Vm::new();
        vm.load_unit(module_unit("plain", |u| print_insns(u, "x"))).unwrap();
        assert!(!vm.unit("plain").unwrap().is_host());
    }

    #[test]
    fn test_java_lang_classes() {
        let mut vm = Vm::new();
        let lang = vm.import("java.lang").unwrap();
        let string = vm.import("java.lang.String").unwrap();
        let attr = vm.getattr(&lang, "String").unwrap();
        assert!(attr.is(&string));
        let value_of = vm.getattr(&string, "valueOf").unwrap();
        let yes = vm.call(&value_of, vec![Value::Bool(true)]).unwrap();
        assert_eq!(repr(&mut vm, &yes), "'true'");
        let nothing = vm.call(&value_of, vec![Value::None]).unwrap();
        assert_eq!(repr(&mut vm, &nothing), "'null'");

        let math = vm.import("java.lang.Math").unwrap();
        let max = vm.getattr(&math, "max").unwrap();
        let bigger = vm.call(&max, vec![int(3), Value::Float(4.5)]).unwrap();
        assert_eq!(repr(&mut vm, &bigger), "4.5");
        let err = vm.call(&max, vec![int(3), s("4")]).unwrap_err();
        assert_eq!(exception_class(err), "TypeError");
        let sqrt = vm.getattr(&math, "sqrt").unwrap();
        let nan = vm.call(&sqrt, vec![int(-1)]).unwrap();
        assert!(matches!(nan, Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_sys_exit_status() {
        let mut vm = Vm::new();
        vm.set_argv(vec!["prog".to_string(), "-v".to_string()]);
        let sys = vm.import("sys").unwrap();
        let argv = vm.getattr(&sys, "argv").unwrap();
        assert_eq!(repr(&mut vm, &argv), "['prog', '-v']");
        let exit = vm.getattr(&sys, "exit").unwrap();
        let status = |vm: &mut Vm, args: Vec<Value>| match vm.call(&exit, args).unwrap_err() {
            VmError::Exception(e) => e.exit_status(),
            other => panic!("expected SystemExit, got {other:?}"),
        };
        assert_eq!(status(&mut vm, vec![]), Some((0, None)));
        assert_eq!(status(&mut vm, vec![Value::None]), Some((0, None)));
        assert_eq!(status(&mut vm, vec![int(3)]), Some((3, None)));
        assert_eq!(status(&mut vm, vec![s("bad input")]), Some((1, Some("bad input".to_string()))));
        let base = builtin(&vm, "BaseException");
        let system_exit = builtin(&vm, "SystemExit");
        let issubclass = builtin(&vm, "issubclass");
        let exception = builtin(&vm, "Exception");
        let under_base = vm.call(&issubclass, vec![system_exit.clone(), base]).unwrap();
        let under_exception = vm.call(&issubclass, vec![system_exit, exception]).unwrap();
        assert!(matches!((under_base, under_exception), (Value::Bool(true), Value::Bool(false))));
    }

    #[test]
    fn test_time_module() {
        let mut vm = Vm::new();
        let time = vm.import("time").unwrap();
        let now = method(&mut vm, &time, "time", vec![]).unwrap();
        assert!(matches!(now, Value::Float(t) if t > 1.0e9));
        let first = method(&mut vm, &time, "monotonic", vec![]).unwrap();
        method(&mut vm, &time, "sleep", vec![Value::Float(0.001)]).unwrap();
        let second = method(&mut vm, &time, "perf_counter", vec![]).unwrap();
        assert!(matches!((first, second), (Value::Float(a), Value::Float(b)) if b > a));
        let err = method(&mut vm, &time, "sleep", vec![int(-1)]).unwrap_err();
        assert_eq!(exception_class(err), "ValueError");
        let err = method(&mut vm, &time, "sleep", vec![Value::Float(f64::INFINITY)]).unwrap_err();
        assert_eq!(exception_class(err), "OverflowError");
    }
}
