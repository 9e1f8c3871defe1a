#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use pyjvm_bytecode::abi;
    use pyjvm_bytecode::unit::{ACC_PUBLIC, ACC_STATIC};
    use pyjvm_bytecode::{Code, CompiledUnit, ConstantPool, Insn};
    use pyjvm_pylib::{Vm, VmError};

    use crate::emit::{self, mangle, Branch, CodeBuilder};
    use crate::lexer::{self, TokenKind};
    use crate::{compile, compile_module, parser, resolve, CompileError, CompilerOptions, Severity};

    /// Strip the common leading indentation so sources can be written
    /// indented inside the test body.
    fn dedent(text: &str) -> String {
        let text = text.strip_prefix('\n').unwrap_or(text);
        let indent = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.len() - l.trim_start().len())
            .min()
            .unwrap_or(0);
        text.lines()
            .map(|l| if l.len() >= indent { &l[indent..] } else { l.trim_start() })
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    fn execute(source: &str) -> Result<String, VmError> {
        let units = compile("main", &dedent(source)).unwrap_or_else(|e| panic!("compilation failed: {e}"));
        let mut vm = Vm::new();
        vm.capture_output();
        for unit in units {
            vm.load_unit(unit).expect("unit rejected by the loader");
        }
        vm.run_main("main")?;
        Ok(vm.take_output())
    }

    fn run(source: &str) -> String {
        execute(source).unwrap_or_else(|e| panic!("runtime error: {e}"))
    }

    fn errors(source: &str) -> Vec<CompileError> {
        compile_module("main", &dedent(source), &CompilerOptions::default())
            .diagnostics
            .into_iter()
            .filter(|d| d.severity >= Severity::Error)
            .map(|d| d.error)
            .collect()
    }

    // --- Lexer Tests ---

    #[test]
    fn test_lex_indent_dedent() {
        let (tokens, errors) = lexer::lex("if x:\n    y = 1\nz = 2\n");
        assert!(errors.is_empty());
        let kinds: Vec<_> = tokens.iter().map(|t| &t.kind).collect();
        let indent = kinds.iter().position(|k| **k == TokenKind::Indent).expect("no INDENT");
        let dedent = kinds.iter().position(|k| **k == TokenKind::Dedent).expect("no DEDENT");
        assert!(indent < dedent);
        assert_eq!(kinds.last(), Some(&&TokenKind::EndOfFile));
    }

    #[test]
    fn test_lex_no_newline_inside_brackets() {
        let (tokens, errors) = lexer::lex("x = [1,\n     2]\n");
        assert!(errors.is_empty());
        let newlines = tokens.iter().filter(|t| t.kind == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!tokens.iter().any(|t| t.kind == TokenKind::Indent));
    }

    #[test]
    fn test_lex_number_forms() {
        let (tokens, errors) = lexer::lex("0xff 0o17 0b101 1_000 123456789012345678901234567890");
        assert!(errors.is_empty());
        let ints: Vec<String> = tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Int(v) => Some(v.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(ints, ["255", "15", "5", "1000", "123456789012345678901234567890"]);
    }

    #[test]
    fn test_lex_unterminated_string() {
        let (_, errors) = lexer::lex("x = 'abc\n");
        assert!(matches!(errors.first(), Some(CompileError::Lex { line: 1, .. })));
    }

    #[test]
    fn test_lex_bad_dedent() {
        let (_, errors) = lexer::lex("if x:\n        a = 1\n    b = 2\n");
        assert!(errors.iter().any(|e| matches!(e, CompileError::Lex { line: 3, msg, .. } if msg.contains("unindent"))));
    }

    #[test]
    fn test_lex_mixed_indentation_rejected() {
        let (_, errors) = lexer::lex("if x:\n\ty = 1\nif z:\n    w = 2\n");
        assert!(errors.iter().any(|e| matches!(e, CompileError::Lex { msg, .. } if msg.contains("tabs and spaces"))));
    }

    // --- Parser Tests ---

    #[test]
    fn test_parse_recovers_after_bad_statement() {
        let (tokens, lex_errors) = lexer::lex("x = = 1\ny = 2\nz = 3 +\nw = 4\n");
        assert!(lex_errors.is_empty());
        let (module, errors) = parser::parse("main", tokens);
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors.iter().all(|e| matches!(e, CompileError::Syntax { .. })));
        assert_eq!(module.body.len(), 2);
    }

    #[test]
    fn test_parse_error_lines() {
        let errors = errors("a = (1,\nb = 2\n");
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| matches!(e, CompileError::Syntax { .. })));
    }

    #[test]
    fn test_syntax_errors_reported_after_lex_error() {
        let errors = errors("x = $\ny = = 2\nz = 3\n");
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors.iter().any(|e| matches!(e, CompileError::Lex { line: 1, .. })));
        assert!(errors.iter().any(|e| matches!(e, CompileError::Syntax { line: 2, .. })));

        let errors = self::errors("x = $\ny = (1 +\n");
        assert!(errors.iter().any(|e| matches!(e, CompileError::Lex { line: 1, .. })));
        assert!(errors.iter().any(|e| matches!(e, CompileError::Syntax { line, .. } if *line >= 2)), "{errors:?}");
    }

    // --- Resolver Tests ---

    #[test]
    fn test_resolve_forward_reference() {
        let errors = errors(
            "
            def f():
                return g()
            def g():
                return 1
            ",
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_unresolved_name_position() {
        let output = compile_module("bad", "def f():\n    return undefined_name\n", &CompilerOptions::default());
        let errors: Vec<_> = output.diagnostics.iter().filter(|d| d.severity >= Severity::Error).collect();
        assert_eq!(errors.len(), 1);
        match &errors[0].error {
            CompileError::UnresolvedName { line, col, name, scope } => {
                assert_eq!((*line, *col), (2, 12));
                assert_eq!(name, "undefined_name");
                assert_eq!(scope, "f");
            }
            other => panic!("expected an unresolved name, got {other:?}"),
        }
        assert!(output.units.is_empty());
    }

    #[test]
    fn test_unresolved_names_all_reported() {
        let errors = errors("print(a)\nprint(b)\ndef f():\n    return c\n");
        let names: Vec<_> = errors
            .iter()
            .filter_map(|e| match e {
                CompileError::UnresolvedName { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_capture_record_matches_resolver() {
        let source = dedent(
            "
            def outer():
                a = 1
                b = 2
                def inner():
                    return b + a
                return inner
            print(outer()())
            ",
        );
        let (tokens, _) = lexer::lex(&source);
        let (module, _) = parser::parse("closures", tokens);
        let (resolution, errors) = resolve::resolve(&module);
        assert!(errors.is_empty());
        let scope = resolution
            .scopes()
            .find(|s| s.qualname == "outer.<locals>.inner")
            .expect("inner scope");
        assert_eq!(scope.captures.len(), 2);

        let units = compile("closures", &source).unwrap();
        let unit = &units[0];
        let method = unit.find_method("outer$inner", abi::FUNCTION_DESCRIPTOR).expect("inner method");
        let emitted = method.capture_names(&unit.pool).unwrap();
        assert_eq!(emitted, scope.captures.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_capture_record_mismatch_is_fault() {
        let source = dedent(
            "
            def outer():
                a = 1
                b = 2
                def inner():
                    return b + a
                return inner
            ",
        );
        let (tokens, _) = lexer::lex(&source);
        let (module, _) = parser::parse("closures", tokens);
        let (mut resolution, errors) = resolve::resolve(&module);
        assert!(errors.is_empty());
        let id = resolution
            .scopes()
            .find(|s| s.qualname == "outer.<locals>.inner")
            .map(|s| s.id)
            .expect("inner scope");
        let scope = resolution.scope_mut(id).unwrap();
        assert_eq!(scope.captures.len(), 2);
        scope.captures.swap(0, 1);

        let err = emit::emit_module(&module, &resolution, "closures.py", &CompilerOptions::default()).unwrap_err();
        match err {
            CompileError::InternalFault { msg, .. } => assert!(msg.contains("capture slot"), "{msg}"),
            other => panic!("expected an internal fault, got {other:?}"),
        }
    }

    // --- Mapper Tests ---

    #[test]
    fn test_matmul_unsupported() {
        let errors = errors("a = 1\nb = 2\nx = a @ b\n");
        assert!(matches!(errors.as_slice(), [CompileError::UnsupportedFeature { line: 3, .. }]));
    }

    #[test]
    fn test_star_args_unsupported() {
        let errors = errors("def f(*args):\n    pass\n");
        assert!(matches!(errors.as_slice(), [CompileError::UnsupportedFeature { .. }]));
    }

    #[test]
    fn test_yield_unsupported() {
        let errors = errors("def gen():\n    yield 1\n");
        assert!(errors.iter().any(|e| matches!(e, CompileError::UnsupportedFeature { feature, .. } if feature.contains("yield"))));
    }

    #[test]
    fn test_break_outside_loop() {
        let errors = errors("break\n");
        assert!(matches!(errors.as_slice(), [CompileError::Syntax { msg, .. }] if msg.contains("outside loop")));
    }

    #[test]
    fn test_return_outside_function() {
        let errors = errors("return 1\n");
        assert!(matches!(errors.as_slice(), [CompileError::Syntax { msg, .. }] if msg.contains("outside function")));
    }

    #[test]
    fn test_annotation_mismatch_is_warning() {
        let output = compile_module("main", "x: int = 'a'\nprint(x)\n", &CompilerOptions::default());
        assert!(!output.has_errors());
        assert!(output
            .diagnostics
            .iter()
            .any(|d| matches!(d.error, CompileError::AnnotationMismatch { line: 1, .. })));
        assert!(!output.units.is_empty());
    }

    // --- Diagnostics and Options ---

    #[test]
    fn test_error_threshold_suppresses() {
        let source: String = (0..30).map(|i| format!("print(u{i})\n")).collect();
        let output = compile_module("noisy", &source, &CompilerOptions::default());
        let unresolved = output
            .diagnostics
            .iter()
            .filter(|d| matches!(d.error, CompileError::UnresolvedName { .. }))
            .count();
        assert_eq!(unresolved, 25);
        assert!(output.diagnostics.iter().any(|d| d.error == CompileError::Suppressed { count: 5 }));
    }

    #[test]
    fn test_diagnostic_json() {
        let output = compile_module("bad", "print(nope)\n", &CompilerOptions::default());
        let json = output.diagnostics[0].to_json();
        assert!(json.contains("\"kind\":\"UnresolvedName\""), "{json}");
        assert!(json.contains("\"severity\":\"error\""), "{json}");
        assert!(json.contains("\"module\":\"bad\""), "{json}");
    }

    #[test]
    fn test_options_from_json_defaults() {
        let options = CompilerOptions::from_json(r#"{"parallel": false}"#).unwrap();
        assert!(!options.parallel);
        assert_eq!(options.max_errors_per_module, 25);
        assert!(options.emit_line_numbers);
    }

    #[test]
    fn test_line_numbers_toggle() {
        let options = CompilerOptions { emit_line_numbers: false, source_file_attribute: false, ..Default::default() };
        let output = compile_module("main", "x = 1\ny = 2\n", &options);
        let unit = &output.units[0];
        assert!(unit.source_file.is_none());
        let clinit = unit.find_method(abi::CLINIT, abi::CLINIT_DESCRIPTOR).unwrap();
        assert!(clinit.code.as_ref().unwrap().line_numbers.is_empty());

        let output = compile_module("main", "x = 1\ny = 2\n", &CompilerOptions::default());
        let clinit = output.units[0].find_method(abi::CLINIT, abi::CLINIT_DESCRIPTOR).unwrap();
        let lines: Vec<u16> = clinit.code.as_ref().unwrap().line_numbers.iter().map(|l| l.line).collect();
        assert_eq!(lines, [1, 2]);
    }

    // --- Code Builder ---

    #[test]
    fn test_code_builder_max_stack() {
        let mut code = CodeBuilder::new("scratch", 0);
        code.insn(Insn::AconstNull).unwrap();
        code.insn(Insn::Dup).unwrap();
        code.insn(Insn::Pop).unwrap();
        code.insn(Insn::Areturn).unwrap();
        let mut pool = ConstantPool::new();
        let body = code.finish(&mut pool).unwrap();
        assert_eq!(body.max_stack, 2);
    }

    #[test]
    fn test_code_builder_unbound_label() {
        let mut code = CodeBuilder::new("scratch", 0);
        let label = code.new_label();
        code.branch(Branch::Goto, label).unwrap();
        let err = code.finish(&mut ConstantPool::new()).unwrap_err();
        assert!(matches!(err, CompileError::InternalFault { .. }));
    }

    #[test]
    fn test_code_builder_sealed() {
        let mut code = CodeBuilder::new("scratch", 0);
        code.insn(Insn::Return).unwrap();
        code.finish(&mut ConstantPool::new()).unwrap();
        assert!(code.insn(Insn::Return).is_err());
        assert!(code.finish(&mut ConstantPool::new()).is_err());
    }

    #[test]
    fn test_code_builder_label_bound_twice() {
        let mut code = CodeBuilder::new("scratch", 0);
        let label = code.here().unwrap();
        assert!(code.bind(label).is_err());
    }

    #[test]
    fn test_code_builder_rejects_raw_pool_operand() {
        let mut code = CodeBuilder::new("scratch", 0);
        assert!(code.insn(Insn::Ldc(1)).is_err());
    }

    #[test]
    fn test_mangle() {
        assert_eq!(mangle("f"), "f");
        assert_eq!(mangle("f.<locals>.g"), "f$g");
        assert_eq!(mangle("C.m.<locals>.<lambda>"), "C$m$lambda");
    }

    // --- Execution Tests ---

    #[test]
    fn test_run_arithmetic() {
        let out = run(
            "
            print(-7 / 2, 7 // -2, -7 % 3, 7 % -3)
            print(2 ** -1, 7 / 2.0, 2 ** 100)
            print(1 + 2 * 3 ** 2, -2 ** 2, not 1 == 2)
            print(True + 1, 1 == 1.0, 3 > 2 > 1, 1 < 3 < 2)
            ",
        );
        assert_eq!(
            out,
            "-4 -4 2 -2\n0.5 3.5 1267650600228229401496703205376\n19 -4 True\n2 True True False\n"
        );
    }

    #[test]
    fn test_run_bool_ops_return_operands() {
        assert_eq!(run("print(0 or 'x', 1 and 2, None or 0, [] and 5)"), "x 2 0 []\n");
    }

    #[test]
    fn test_run_print_keywords() {
        assert_eq!(run("print(1, 2, sep='-', end='.\\n')"), "1-2.\n");
    }

    #[test]
    fn test_run_closure_nonlocal() {
        let out = run(
            "
            def counter(start):
                count = start
                step = 2
                def bump():
                    nonlocal count
                    count = count + step
                    return count
                return bump

            c = counter(10)
            c()
            print(c(), c())
            ",
        );
        assert_eq!(out, "14 16\n");
    }

    #[test]
    fn test_run_lambda() {
        let out = run(
            "
            def make(n):
                return lambda x: x * n
            double = make(2)
            print(double(21), (lambda: 'ok')())
            ",
        );
        assert_eq!(out, "42 ok\n");
    }

    #[test]
    fn test_run_virtual_dispatch() {
        let out = run(
            "
            class Shape:
                def area(self):
                    return 0
                def name(self):
                    return 'shape'
                def describe(self):
                    return self.name() + ' ' + str(self.area())

            class Square(Shape):
                def __init__(self, side):
                    self.side = side
                def area(self):
                    return self.side * self.side
                def name(self):
                    return 'square'

            def report(s):
                return s.describe()

            print(report(Shape()), report(Square(3)))
            ",
        );
        assert_eq!(out, "shape 0 square 9\n");
    }

    #[test]
    fn test_run_super_chain() {
        let out = run(
            "
            class A:
                def greet(self):
                    return 'A'
            class B(A):
                def greet(self):
                    return 'B' + super().greet()
            class C(B):
                def greet(self):
                    return 'C' + super().greet()
            print(C().greet())
            ",
        );
        assert_eq!(out, "CBA\n");
    }

    #[test]
    fn test_run_operator_overloading() {
        let out = run(
            "
            class Vec:
                def __init__(self, x, y):
                    self.x = x
                    self.y = y
                def __add__(self, other):
                    return Vec(self.x + other.x, self.y + other.y)
                def __eq__(self, other):
                    return self.x == other.x and self.y == other.y
                def __repr__(self):
                    return 'Vec(' + str(self.x) + ', ' + str(self.y) + ')'
            v = Vec(1, 2) + Vec(3, 4)
            print(v, v == Vec(4, 6))
            ",
        );
        assert_eq!(out, "Vec(4, 6) True\n");
    }

    #[test]
    fn test_run_try_except_else_finally() {
        let out = run(
            "
            def risky(n):
                if n < 0:
                    raise ValueError('negative')
                return n

            def attempt(n):
                try:
                    value = risky(n)
                except ValueError as e:
                    print('caught', e)
                    return -1
                else:
                    print('ok', value)
                    return value
                finally:
                    print('cleanup', n)

            print(attempt(3))
            print(attempt(-1))
            ",
        );
        assert_eq!(out, "ok 3\ncleanup 3\n3\ncaught negative\ncleanup -1\n-1\n");
    }

    #[test]
    fn test_run_except_tuple_and_reraise() {
        let out = run(
            "
            def f(d):
                try:
                    return d['k']
                except (IndexError, KeyError):
                    print('missing')
                    raise
            try:
                f({})
            except KeyError as e:
                print('outer', repr(e))
            ",
        );
        assert_eq!(out, "missing\nouter KeyError('k')\n");
    }

    #[test]
    fn test_run_return_expression_raises_inside_try() {
        let out = run(
            "
            def f(n):
                try:
                    return 1 // n
                except ZeroDivisionError:
                    return 'caught'
            def g(items):
                for x in items:
                    try:
                        return items[x]
                    except IndexError:
                        print('skip', x)
                return None
            print(f(0), f(1))
            print(g([7, 0, 3]))
            ",
        );
        assert_eq!(out, "caught 1\nskip 7\n7\n");
    }

    #[test]
    fn test_run_break_through_finally() {
        let out = run(
            "
            for i in range(5):
                try:
                    if i == 2:
                        break
                    print('body', i)
                finally:
                    print('finally', i)
            print('done', i)
            ",
        );
        assert_eq!(out, "body 0\nfinally 0\nbody 1\nfinally 1\nfinally 2\ndone 2\n");
    }

    #[test]
    fn test_run_with_statement() {
        let out = run(
            "
            class Resource:
                def __init__(self, name):
                    self.name = name
                def __enter__(self):
                    print('enter', self.name)
                    return self
                def __exit__(self, kind, value, tb):
                    print('exit', self.name, kind is not None)
                    return True

            with Resource('a') as r:
                print('using', r.name)
            with Resource('b'):
                raise KeyError('x')
            print('after')
            ",
        );
        assert_eq!(out, "enter a\nusing a\nexit a False\nenter b\nexit b True\nafter\n");
    }

    #[test]
    fn test_run_comprehensions() {
        let out = run(
            "
            squares = [x * x for x in range(5) if x % 2 == 0]
            pairs = {k: v for k, v in zip('ab', [1, 2])}
            unique = {c for c in 'hello'}
            total = sum(n for n in range(4))
            nested = [(i, j) for i in range(3) for j in range(i)]
            print(squares, pairs, len(unique), total)
            print(nested)
            ",
        );
        assert_eq!(out, "[0, 4, 16] {'a': 1, 'b': 2} 4 6\n[(1, 0), (2, 0), (2, 1)]\n");
    }

    #[test]
    fn test_run_destructuring_and_slicing() {
        let out = run(
            "
            a, b = 1, 2
            a, b = b, a
            items = [10, 20, 30, 40, 50]
            first, [second, third] = items[0], items[1:3]
            print(a, b, first, second, third)
            print(items[-1], items[-2:], items[::-2], 'hello'[1:-1])
            ",
        );
        assert_eq!(out, "2 1 10 20 30\n50 [40, 50] [50, 30, 10] ell\n");
    }

    #[test]
    fn test_run_augmented_assignment() {
        let out = run(
            "
            x = 5
            x += 3
            x //= 3
            data = {'n': 1}
            data['n'] *= 10
            class Box:
                pass
            b = Box()
            b.v = 1
            b.v -= 4
            print(x, data['n'], b.v)
            ",
        );
        assert_eq!(out, "2 10 -3\n");
    }

    #[test]
    fn test_run_decorators() {
        let out = run(
            "
            def twice(f):
                def wrapper(x):
                    return f(f(x))
                return wrapper

            @twice
            def inc(x):
                return x + 1

            class Temp:
                def __init__(self, c):
                    self._c = c
                @property
                def f(self):
                    return self._c * 9 // 5 + 32
                @staticmethod
                def zero():
                    return 0

            print(inc(1), Temp(100).f, Temp.zero())
            ",
        );
        assert_eq!(out, "3 212 0\n");
    }

    #[test]
    fn test_run_defaults_and_keywords() {
        let out = run(
            "
            def greet(name, greeting='hello', punct='!'):
                return greeting + ' ' + name + punct
            print(greet('bob'), greet('amy', punct='?'), greet(greeting='hi', name='zed'))
            ",
        );
        assert_eq!(out, "hello bob! hello amy? hi zed!\n");
    }

    #[test]
    fn test_run_loop_else() {
        let out = run(
            "
            n = 0
            while n < 3:
                n += 1
            else:
                print('while done', n)
            for x in [1, 2, 3]:
                if x == 2:
                    break
            else:
                print('not reached')
            print('x', x)
            ",
        );
        assert_eq!(out, "while done 3\nx 2\n");
    }

    #[test]
    fn test_run_global_and_main_guard() {
        let out = run(
            "
            total = 0
            def add(n):
                global total
                total = total + n
            add(3)
            add(4)
            if __name__ == '__main__':
                print('main', total)
            ",
        );
        assert_eq!(out, "main 7\n");
    }

    #[test]
    fn test_run_native_import() {
        let out = run(
            "
            import math
            from math import sqrt as root
            print(math.floor(2.5), root(16.0))
            ",
        );
        assert_eq!(out, "2 4.0\n");
    }

    #[test]
    fn test_run_java_lang_imports() {
        let out = run(
            "
            from java.lang import String, Math
            import java.lang.System
            print(String.valueOf(42), String.valueOf(False), Math.max(3, 9), Math.abs(-2))
            print(java.lang.System.currentTimeMillis() > 0)
            ",
        );
        assert_eq!(out, "42 false 9 2\nTrue\n");
        let err = execute("from java.lang import Math\nclass Sub(Math):\n    pass\n").unwrap_err();
        assert_eq!(err.as_exception().expect("a raised exception").class_name(), "TypeError");
    }

    #[test]
    fn test_run_calls_host_unit_static_method() {
        let mut host = CompiledUnit::new("util/Text", abi::JAVA_OBJECT).unwrap();
        let code = Code {
            max_stack: 1,
            max_locals: 2,
            insns: vec![Insn::Aload(1), Insn::Areturn],
            exception_table: vec![],
            line_numbers: vec![],
        };
        let descriptor = format!("({0}{0}){0}", abi::OBJ);
        host.add_method(ACC_PUBLIC | ACC_STATIC, "second", &descriptor, code, None).unwrap();
        let units = compile("main", &dedent("from util import Text\nprint(Text.second('a', [1, 2]))\n")).unwrap();
        let mut vm = Vm::new();
        vm.capture_output();
        vm.load_unit(host).unwrap();
        for unit in units {
            vm.load_unit(unit).unwrap();
        }
        vm.run_main("main").unwrap();
        assert_eq!(vm.take_output(), "[1, 2]\n");
    }

    #[test]
    fn test_run_sys_exit_is_catchable() {
        let out = run(
            "
            import sys
            try:
                sys.exit(3)
            except Exception:
                print('not an Exception')
            except SystemExit as e:
                print('exit', e.args)
            print(sys.argv, sys.platform)
            ",
        );
        assert_eq!(out, "exit (3,)\n[] java\n");
        let err = execute("import sys\nsys.exit('bye')\n").unwrap_err();
        let exc = err.as_exception().expect("a raised exception");
        assert_eq!(exc.exit_status(), Some((1, Some("bye".to_string()))));
    }

    #[test]
    fn test_run_time_module() {
        let out = run(
            "
            import time
            start = time.time()
            t0 = time.perf_counter()
            time.sleep(0)
            print(isinstance(start, float), start > 1e9, time.perf_counter() >= t0)
            ",
        );
        assert_eq!(out, "True True True\n");
    }

    #[test]
    fn test_run_uncaught_exception() {
        let err = execute("raise ValueError('bad')").unwrap_err();
        let exc = err.as_exception().expect("a raised exception");
        assert_eq!(exc.class_name(), "ValueError");
        assert_eq!(exc.message(), "bad");
    }

    #[test]
    fn test_run_raise_from() {
        let out = run(
            "
            try:
                try:
                    1 // 0
                except ZeroDivisionError as e:
                    raise RuntimeError('wrapped') from e
            except RuntimeError as e:
                print(e, type(e.__cause__).__name__)
            ",
        );
        assert_eq!(out, "wrapped ZeroDivisionError\n");
    }

    #[test]
    fn test_run_assert_failure() {
        let err = execute("assert 1 == 2, 'nope'").unwrap_err();
        let exc = err.as_exception().expect("a raised exception");
        assert_eq!(exc.class_name(), "AssertionError");
        assert_eq!(exc.message(), "nope");
    }

    #[test]
    fn test_run_unbound_local() {
        let err = execute(
            "
            def f():
                print(x)
                x = 1
            f()
            ",
        )
        .unwrap_err();
        assert_eq!(err.as_exception().map(|e| e.class_name()).as_deref(), Some("UnboundLocalError"));
    }

    #[test]
    fn test_run_delete() {
        let out = run(
            "
            d = {'a': 1, 'b': 2}
            del d['a']
            x = 1
            del x
            try:
                print(x)
            except NameError:
                print('gone', d)
            ",
        );
        assert_eq!(out, "gone {'b': 2}\n");
    }

    // --- Property Tests ---

    fn literal_token() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u64..1_000_000).prop_map(|n| n.to_string()),
            (0u64..65536).prop_map(|n| format!("0x{n:x}")),
            (0u64..512).prop_map(|n| format!("0o{n:o}")),
            (0u64..256).prop_map(|n| format!("0b{n:b}")),
            (0u32..1000, 0u32..1000).prop_map(|(a, b)| format!("{a}.{b}")),
            (1u32..100, 0u32..20).prop_map(|(a, e)| format!("{a}e{e}")),
            "[a-z ]{0,8}".prop_map(|s| format!("'{s}'")),
            "[a-z ]{0,8}".prop_map(|s| format!("\"{s}\"")),
            "[a-z_][a-z0-9_]{0,6}",
            prop::sample::select(vec!["+", "-", "**", "//", "<<", ">=", "!=", "->", "+=", "(", "]", ":"])
                .prop_map(str::to_string),
        ]
    }

    /// Nesting depths of consecutive lines; each line is at most one level
    /// deeper than the previous one.
    fn indentation_tree() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(0usize..4, 1..30).prop_map(|steps| {
            let mut depth = 0usize;
            steps
                .into_iter()
                .map(|step| {
                    depth = if step == 3 { depth + 1 } else { depth.saturating_sub(step) };
                    depth
                })
                .collect()
        })
    }

    fn floor_div(a: i64, b: i64) -> (i64, i64) {
        let q = a / b;
        let q = if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q };
        (q, a - b * q)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_token_round_trip(words in prop::collection::vec(literal_token(), 1..12)) {
            let source = words.join(" ");
            let (tokens, errors) = lexer::lex(&source);
            prop_assert!(errors.is_empty());
            for token in tokens.iter().filter(|t| !t.text.is_empty()) {
                let (again, errors) = lexer::lex(&token.text);
                prop_assert!(errors.is_empty());
                prop_assert_eq!(&again[0].kind, &token.kind);
            }
        }

        #[test]
        fn test_indent_dedent_balance(depths in indentation_tree()) {
            let source: String = depths.iter().map(|d| format!("{}x = 1\n", "    ".repeat(*d))).collect();
            let (tokens, errors) = lexer::lex(&source);
            prop_assert!(errors.is_empty());
            let mut open = 0i64;
            for token in &tokens {
                match token.kind {
                    TokenKind::Indent => open += 1,
                    TokenKind::Dedent => open -= 1,
                    _ => {}
                }
                prop_assert!(open >= 0);
            }
            prop_assert_eq!(open, 0);
        }

        #[test]
        fn test_floor_division(a in -1000i64..1000, b in (-50i64..50).prop_filter("nonzero", |b| *b != 0)) {
            let (q, r) = floor_div(a, b);
            let out = run(&format!("print({a} / {b}, {a} // {b}, {a} % {b})"));
            prop_assert_eq!(out, format!("{q} {q} {r}\n"));
        }

        #[test]
        fn test_capture_order_agreement(order in Just((0..5).collect::<Vec<usize>>()).prop_shuffle()) {
            let mut source = String::from("def outer():\n");
            for i in 0..5 {
                source.push_str(&format!("    v{i} = {}\n", i + 1));
            }
            let uses: Vec<String> = order.iter().map(|i| format!("v{i}")).collect();
            source.push_str(&format!("    def inner():\n        return [{}]\n", uses.join(", ")));
            source.push_str("    return inner\nprint(outer()())\n");

            let (tokens, _) = lexer::lex(&source);
            let (module, _) = parser::parse("caps", tokens);
            let (resolution, _) = resolve::resolve(&module);
            let scope = resolution.scopes().find(|s| s.qualname == "outer.<locals>.inner").unwrap();

            let units = compile("caps", &source).unwrap();
            let method = units[0].find_method("outer$inner", abi::FUNCTION_DESCRIPTOR).unwrap();
            let emitted = method.capture_names(&units[0].pool).unwrap();
            prop_assert_eq!(emitted, scope.captures.iter().map(String::as_str).collect::<Vec<_>>());

            let mut vm = Vm::new();
            vm.capture_output();
            for unit in units {
                vm.load_unit(unit).unwrap();
            }
            vm.run_main("caps").unwrap();
            let expected: Vec<String> = order.iter().map(|i| (i + 1).to_string()).collect();
            prop_assert_eq!(vm.take_output(), format!("[{}]\n", expected.join(", ")));
        }

        #[test]
        fn test_idempotent_output(values in prop::collection::vec(-100_000i64..100_000, 1..6)) {
            let literals: Vec<String> = values.iter().map(i64::to_string).collect();
            let source = format!(
                "class Acc:\n    def total(self, xs):\n        return sum(xs)\ndata = [{}]\nprint(Acc().total(data), [x * 2 for x in data])\n",
                literals.join(", ")
            );
            let first = compile("idem", &source).unwrap();
            let second = compile("idem", &source).unwrap();
            prop_assert_eq!(first.len(), second.len());
            for (a, b) in first.iter().zip(&second) {
                prop_assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
            }
        }
    }
}
