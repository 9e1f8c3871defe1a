#[cfg(test)]
mod tests {
    use crate::abi::{self, Operator, RuntimeEntry, UnaryOperator};
    use crate::descriptor::{parse_method_descriptor, FieldType};
    use crate::insn::{decode_all, encode_all, offsets};
    use crate::pool::{decode_modified_utf8, encode_modified_utf8, Constant};
    use crate::unit::{ACC_PUBLIC, ACC_STATIC};
    use crate::verify::{analyze_stack, verify_unit};
    use crate::*;

    fn static_method(unit: &mut CompiledUnit, name: &str, insns: Vec<Insn>, max_locals: u16) {
        let code = Code {
            max_stack: 0,
            max_locals,
            insns,
            exception_table: vec![],
            line_numbers: vec![],
        };
        let max_stack = analyze_stack(&unit.pool, &code).unwrap();
        let code = Code { max_stack, ..code };
        unit.add_method(ACC_PUBLIC | ACC_STATIC, name, "()V", code, None).unwrap();
    }

    // --- Constant pool ---

    #[test]
    fn test_pool_deduplicates() {
        let mut pool = ConstantPool::new();
        let a = pool.string("hello").unwrap();
        let b = pool.string("hello").unwrap();
        assert_eq!(a, b);
        let m1 = pool.method_ref("pylib/Dyn", "iter", "(Lpylib/PyObject;)Lpylib/PyObject;").unwrap();
        let m2 = pool.method_ref("pylib/Dyn", "iter", "(Lpylib/PyObject;)Lpylib/PyObject;").unwrap();
        assert_eq!(m1, m2);
        let utf8_count = pool.iter().filter(|(_, c)| matches!(c, Constant::Utf8(s) if s == "hello")).count();
        assert_eq!(utf8_count, 1);
    }

    #[test]
    fn test_pool_wide_entries_take_two_slots() {
        let mut pool = ConstantPool::new();
        let l = pool.long(1 << 40).unwrap();
        let next = pool.integer(7).unwrap();
        assert_eq!(l, 1);
        assert_eq!(next, 3);
        assert!(pool.get(2).is_none());
        assert_eq!(pool.count(), 4);
    }

    #[test]
    fn test_pool_double_dedup_by_bits() {
        let mut pool = ConstantPool::new();
        let a = pool.double(0.5).unwrap();
        let b = pool.double(0.5).unwrap();
        let c = pool.double(-0.0).unwrap();
        let d = pool.double(0.0).unwrap();
        assert_eq!(a, b);
        assert_ne!(c, d);
    }

    #[test]
    fn test_member_lookup() {
        let mut pool = ConstantPool::new();
        let idx = pool.field_ref("app/main", "x", abi::OBJ).unwrap();
        let m = pool.get_member(idx).unwrap();
        assert_eq!(m.kind, MemberKind::Field);
        assert_eq!(m.class, "app/main");
        assert_eq!(m.name, "x");
        assert_eq!(m.descriptor, abi::OBJ);
        assert!(pool.get_class(idx).is_err());
    }

    #[test]
    fn test_modified_utf8() {
        let s = "a\u{0}é😀";
        let bytes = encode_modified_utf8(s);
        assert!(!bytes.contains(&0));
        // The emoji becomes a surrogate pair: two three-byte sequences.
        assert_eq!(bytes.len(), 1 + 2 + 2 + 6);
        assert_eq!(decode_modified_utf8(&bytes).unwrap(), s);
        assert!(decode_modified_utf8(&[0xC0]).is_err());
    }

    // --- Instructions ---

    #[test]
    fn test_short_forms() {
        assert_eq!(Insn::Iconst(3).size(), 1);
        assert_eq!(Insn::Iconst(-1).size(), 1);
        assert_eq!(Insn::Iconst(100).size(), 2);
        assert_eq!(Insn::Iconst(1000).size(), 3);
        assert_eq!(Insn::Aload(2).size(), 1);
        assert_eq!(Insn::Aload(200).size(), 2);
        assert_eq!(Insn::Aload(300).size(), 4);
        assert_eq!(Insn::Ldc(5).size(), 2);
        assert_eq!(Insn::Ldc(500).size(), 3);
    }

    #[test]
    fn test_encode_decode_instructions() {
        let insns = vec![
            Insn::Iconst(-1),
            Insn::Iconst(42),
            Insn::Iconst(-300),
            Insn::Aload(0),
            Insn::Astore(7),
            Insn::Aload(1000),
            Insn::Ldc(3),
            Insn::Ldc(400),
            Insn::Ifeq(0),
            Insn::Goto(24),
            Insn::Invokeinterface(9, 2),
            Insn::Return,
        ];
        let bytes = encode_all(&insns).unwrap();
        assert_eq!(bytes.len() as u32, *offsets(&insns).last().unwrap());
        assert_eq!(decode_all(&bytes).unwrap(), insns);
    }

    #[test]
    fn test_branch_out_of_range() {
        let mut out = Vec::new();
        let err = Insn::Goto(70_000).encode(0, &mut out).unwrap_err();
        assert!(matches!(err, BytecodeError::BranchOutOfRange { .. }));
    }

    #[test]
    fn test_unknown_opcode() {
        let err = decode_all(&[0xaa]).unwrap_err();
        assert!(matches!(err, BytecodeError::UnknownOpcode { opcode: 0xaa, pc: 0 }));
    }

    // --- Descriptors ---

    #[test]
    fn test_parse_method_descriptor() {
        let d = parse_method_descriptor("(IJ[Lpylib/PyObject;D)Lpylib/PyObject;").unwrap();
        assert_eq!(d.params.len(), 4);
        assert_eq!(d.param_words(), 1 + 2 + 1 + 2);
        assert_eq!(d.ret, Some(FieldType::Object("pylib/PyObject".into())));
        assert_eq!(parse_method_descriptor("()V").unwrap().return_words(), 0);
        assert!(parse_method_descriptor("(L;)V").is_err());
        assert!(parse_method_descriptor("(I").is_err());
        assert!(parse_method_descriptor("I").is_err());
    }

    #[test]
    fn test_every_runtime_entry_has_valid_descriptor() {
        for entry in RuntimeEntry::ALL {
            let m = entry.method();
            assert!(parse_method_descriptor(m.descriptor).is_ok(), "{entry:?}");
            assert_eq!(RuntimeEntry::from_member(m.class, m.name, m.descriptor), Some(*entry));
        }
        assert_eq!(RuntimeEntry::from_member("pylib/Dyn", "nope", "()V"), None);
    }

    #[test]
    fn test_operator_codes() {
        for code in 0..23 {
            let op = Operator::from_code(code).unwrap();
            assert_eq!(op.code() as i32, code);
        }
        assert_eq!(Operator::from_code(23), None);
        assert_eq!(Operator::from_code(-1), None);
        assert_eq!(UnaryOperator::from_code(3), Some(UnaryOperator::Not));
        assert!(!Operator::MatMul.is_supported());
    }

    // --- Units ---

    fn sample_unit() -> CompiledUnit {
        let mut unit = CompiledUnit::new("app/main", abi::JAVA_OBJECT).unwrap();
        unit.add_field(ACC_PUBLIC | ACC_STATIC, "x", abi::OBJ).unwrap();
        unit.set_source_file("main.py").unwrap();
        let none = unit.pool.field_ref(abi::DYN, abi::NONE_FIELD, abi::OBJ).unwrap();
        let x = unit.pool.field_ref("app/main", "x", abi::OBJ).unwrap();
        static_method(
            &mut unit,
            abi::CLINIT,
            vec![Insn::Getstatic(none), Insn::Putstatic(x), Insn::Return],
            0,
        );
        unit
    }

    #[test]
    fn test_unit_binary_roundtrip() {
        let unit = sample_unit();
        let bytes = unit.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 49);
        let decoded = CompiledUnit::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, unit);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
        assert_eq!(decoded.name().unwrap(), "app/main");
        assert_eq!(decoded.field_names().unwrap(), vec!["x"]);
    }

    #[test]
    fn test_unit_json_roundtrip() {
        let unit = sample_unit();
        let json = unit.to_json().unwrap();
        assert_eq!(CompiledUnit::from_json(&json).unwrap(), unit);
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let bytes = sample_unit().to_bytes().unwrap();
        let mut bad = bytes.clone();
        bad[0] = 0;
        assert!(matches!(CompiledUnit::from_bytes(&bad), Err(BytecodeError::InvalidMagic)));
        assert!(matches!(
            CompiledUnit::from_bytes(&bytes[..bytes.len() - 3]),
            Err(BytecodeError::Truncated(_))
        ));
    }

    #[test]
    fn test_captures_attribute_survives() {
        let mut unit = CompiledUnit::new("app/main", abi::JAVA_OBJECT).unwrap();
        let none = unit.pool.field_ref(abi::DYN, abi::NONE_FIELD, abi::OBJ).unwrap();
        let code = Code {
            max_stack: 1,
            max_locals: 2,
            insns: vec![Insn::Getstatic(none), Insn::Areturn],
            exception_table: vec![],
            line_numbers: vec![LineNumber { start_pc: 0, line: 3 }],
        };
        let captures = vec!["a".to_string(), "b".to_string()];
        unit.add_method(ACC_PUBLIC | ACC_STATIC, "f", abi::FUNCTION_DESCRIPTOR, code, Some(&captures))
            .unwrap();
        let decoded = CompiledUnit::from_bytes(&unit.to_bytes().unwrap()).unwrap();
        let method = decoded.find_method("f", abi::FUNCTION_DESCRIPTOR).unwrap();
        assert_eq!(method.capture_names(&decoded.pool).unwrap(), vec!["a", "b"]);
        assert_eq!(method.code.as_ref().unwrap().line_numbers.len(), 1);
        verify_unit(&decoded).unwrap();
    }

    // --- Verifier ---

    #[test]
    fn test_stack_analysis_with_branches() {
        let mut unit = CompiledUnit::new("t", abi::JAVA_OBJECT).unwrap();
        let truth = unit.pool.method_ref(abi::DYN, "truth", "(Lpylib/PyObject;)Z").unwrap();
        let none = unit.pool.field_ref(abi::DYN, abi::NONE_FIELD, abi::OBJ).unwrap();
        // 0 getstatic; 3 invokestatic; 6 ifeq 13; 9 getstatic; 12 pop; 13 return
        let insns = vec![
            Insn::Getstatic(none),
            Insn::Invokestatic(truth),
            Insn::Ifeq(13),
            Insn::Getstatic(none),
            Insn::Pop,
            Insn::Return,
        ];
        let code = Code { max_stack: 0, max_locals: 0, insns, exception_table: vec![], line_numbers: vec![] };
        assert_eq!(analyze_stack(&unit.pool, &code).unwrap(), 1);
    }

    #[test]
    fn test_stack_underflow_rejected() {
        let pool = ConstantPool::new();
        let code = Code {
            max_stack: 1,
            max_locals: 0,
            insns: vec![Insn::Pop, Insn::Return],
            exception_table: vec![],
            line_numbers: vec![],
        };
        assert!(analyze_stack(&pool, &code).unwrap_err().contains("underflow"));
    }

    #[test]
    fn test_inconsistent_merge_rejected() {
        let pool = ConstantPool::new();
        // 0 aconst_null; 1 aconst_null; 2 ifnull 6; 5 aconst_null; 6 return
        let code = Code {
            max_stack: 3,
            max_locals: 0,
            insns: vec![Insn::AconstNull, Insn::AconstNull, Insn::Ifnull(6), Insn::AconstNull, Insn::Return],
            exception_table: vec![],
            line_numbers: vec![],
        };
        assert!(analyze_stack(&pool, &code).unwrap_err().contains("disagree"));
    }

    #[test]
    fn test_branch_into_instruction_rejected() {
        let pool = ConstantPool::new();
        let code = Code {
            max_stack: 0,
            max_locals: 0,
            insns: vec![Insn::Goto(1), Insn::Return],
            exception_table: vec![],
            line_numbers: vec![],
        };
        assert!(analyze_stack(&pool, &code).is_err());
    }

    #[test]
    fn test_fall_off_end_rejected() {
        let pool = ConstantPool::new();
        let code = Code {
            max_stack: 1,
            max_locals: 0,
            insns: vec![Insn::AconstNull, Insn::Pop],
            exception_table: vec![],
            line_numbers: vec![],
        };
        assert!(analyze_stack(&pool, &code).unwrap_err().contains("falls off"));
    }

    #[test]
    fn test_handler_entry_depth() {
        let mut pool = ConstantPool::new();
        let exc = pool.class(abi::PY_EXCEPTION).unwrap();
        // 0 aconst_null; 1 pop; 2 return; 3 athrow (handler)
        let code = Code {
            max_stack: 1,
            max_locals: 0,
            insns: vec![Insn::AconstNull, Insn::Pop, Insn::Return, Insn::Athrow],
            exception_table: vec![ExceptionEntry { start_pc: 0, end_pc: 2, handler_pc: 3, catch_type: exc }],
            line_numbers: vec![],
        };
        assert_eq!(analyze_stack(&pool, &code).unwrap(), 1);
    }

    #[test]
    fn test_local_out_of_range_rejected() {
        let pool = ConstantPool::new();
        let code = Code {
            max_stack: 1,
            max_locals: 1,
            insns: vec![Insn::Aload(1), Insn::Areturn],
            exception_table: vec![],
            line_numbers: vec![],
        };
        assert!(analyze_stack(&pool, &code).is_err());
    }

    #[test]
    fn test_verify_rejects_small_max_stack() {
        let mut unit = sample_unit();
        if let Some(code) = unit.methods[0].code.as_mut() {
            code.max_stack = 0;
        }
        assert!(matches!(verify_unit(&unit), Err(BytecodeError::Verify { .. })));
    }
}
