//! Structural verification of compiled units.
//!
//! Mirrors the checks the host loader applies before running a class:
//! cross-references point at constants of the right kind, branch targets
//! and handler ranges land on instruction boundaries, locals stay below
//! `max_locals`, and the operand stack never underflows or disagrees with
//! itself where control flow merges.

use std::collections::HashMap;

use crate::descriptor::{parse_field_descriptor, parse_method_descriptor};
use crate::insn::{offsets, Insn};
use crate::pool::{Constant, ConstantPool, MemberKind};
use crate::unit::{BytecodeError, Code, CompiledUnit, ACC_STATIC};

pub fn verify_unit(unit: &CompiledUnit) -> Result<(), BytecodeError> {
    let pool = &unit.pool;
    let invalid = |msg: String| BytecodeError::Invalid(msg);
    pool.get_class(unit.this_class)?;
    pool.get_class(unit.super_class)?;
    for &iface in &unit.interfaces {
        pool.get_class(iface)?;
    }
    for field in &unit.fields {
        pool.get_utf8(field.name)?;
        parse_field_descriptor(pool.get_utf8(field.descriptor)?)?;
    }
    for method in &unit.methods {
        let name = pool.get_utf8(method.name)?;
        let desc = parse_method_descriptor(pool.get_utf8(method.descriptor)?)?;
        if let Some(captures) = &method.captures {
            for &c in captures {
                pool.get_utf8(c)?;
            }
        }
        let code = method
            .code
            .as_ref()
            .ok_or_else(|| invalid(format!("method {name} has no code")))?;
        let receiver = if method.access & ACC_STATIC != 0 { 0 } else { 1 };
        if code.max_locals < desc.param_words() + receiver {
            return Err(verify_error(name, "max_locals smaller than the parameter area"));
        }
        let needed = analyze_stack(pool, code).map_err(|msg| verify_error(name, &msg))?;
        if needed > code.max_stack {
            return Err(verify_error(
                name,
                &format!("operand stack needs {needed} words but max_stack is {}", code.max_stack),
            ));
        }
    }
    Ok(())
}

fn verify_error(method: &str, msg: &str) -> BytecodeError {
    BytecodeError::Verify { method: method.to_string(), msg: msg.to_string() }
}

/// Compute the maximum operand stack depth of a method body, checking
/// structural constraints along the way.
pub fn analyze_stack(pool: &ConstantPool, code: &Code) -> Result<u16, String> {
    let insns = &code.insns;
    if insns.is_empty() {
        return Err("empty method body".into());
    }
    let pcs = offsets(insns);
    let code_len = *pcs.last().unwrap_or(&0);
    let index_of: HashMap<u32, usize> = pcs[..insns.len()].iter().enumerate().map(|(i, &pc)| (pc, i)).collect();
    let boundary = |pc: u32| index_of.get(&pc).copied();

    for (i, insn) in insns.iter().enumerate() {
        if let Some(target) = insn.branch_target() {
            boundary(target).ok_or_else(|| format!("branch at {} targets {target}, not an instruction", pcs[i]))?;
        }
        if let Insn::Aload(n) | Insn::Astore(n) = insn {
            if *n >= code.max_locals {
                return Err(format!("local {n} out of range at {}", pcs[i]));
            }
        }
        check_constant(pool, insn).map_err(|e| format!("at {}: {e}", pcs[i]))?;
    }

    let mut worklist: Vec<(usize, u16)> = vec![(0, 0)];
    for entry in &code.exception_table {
        let start = entry.start_pc as u32;
        let end = entry.end_pc as u32;
        if start >= end || boundary(start).is_none() || (end != code_len && boundary(end).is_none()) {
            return Err(format!("bad exception range {start}..{end}"));
        }
        if entry.catch_type != 0 {
            pool.get_class(entry.catch_type).map_err(|e| e.to_string())?;
        }
        let handler = boundary(entry.handler_pc as u32)
            .ok_or_else(|| format!("handler {} is not an instruction", entry.handler_pc))?;
        worklist.push((handler, 1));
    }

    let mut depth: Vec<Option<u16>> = vec![None; insns.len()];
    let mut max = 0u16;
    while let Some((i, d)) = worklist.pop() {
        match depth[i] {
            Some(seen) if seen == d => continue,
            Some(seen) => {
                return Err(format!("stack depth {seen} and {d} disagree at {}", pcs[i]));
            }
            None => depth[i] = Some(d),
        }
        let insn = &insns[i];
        let (pops, pushes) = stack_effect(pool, insn)?;
        if d < pops {
            return Err(format!("stack underflow at {} ({})", pcs[i], insn.mnemonic()));
        }
        let next = d - pops + pushes;
        max = max.max(d).max(next);
        if let Some(target) = insn.branch_target() {
            if let Some(t) = boundary(target) {
                worklist.push((t, next));
            }
        }
        if !insn.is_terminal() {
            if i + 1 >= insns.len() {
                return Err("control falls off the end of the method".into());
            }
            worklist.push((i + 1, next));
        }
    }
    Ok(max)
}

fn check_constant(pool: &ConstantPool, insn: &Insn) -> Result<(), String> {
    let Some(index) = insn.pool_index() else {
        return Ok(());
    };
    let constant = pool.get(index).ok_or_else(|| format!("constant #{index} does not exist"))?;
    let ok = match insn {
        Insn::Ldc(_) => matches!(constant, Constant::Integer(_) | Constant::String(_) | Constant::Class(_)),
        Insn::Ldc2W(_) => matches!(constant, Constant::Long(_) | Constant::Double(_)),
        Insn::Getstatic(_) | Insn::Putstatic(_) | Insn::Getfield(_) | Insn::Putfield(_) => {
            matches!(constant, Constant::Fieldref(..))
        }
        Insn::Invokevirtual(_) | Insn::Invokespecial(_) | Insn::Invokestatic(_) => {
            matches!(constant, Constant::Methodref(..))
        }
        Insn::Invokeinterface(..) => matches!(constant, Constant::InterfaceMethodref(..)),
        Insn::New(_) | Insn::Anewarray(_) | Insn::Checkcast(_) | Insn::Instanceof(_) => {
            matches!(constant, Constant::Class(_))
        }
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{} cannot reference constant #{index}", insn.mnemonic()))
    }
}

/// Words popped and pushed by one instruction.
fn stack_effect(pool: &ConstantPool, insn: &Insn) -> Result<(u16, u16), String> {
    let member = |index: u16| pool.get_member(index).map_err(|e| e.to_string());
    Ok(match insn {
        Insn::Nop | Insn::Goto(_) | Insn::Return => (0, 0),
        Insn::AconstNull | Insn::Iconst(_) | Insn::Ldc(_) | Insn::Aload(_) | Insn::New(_) => (0, 1),
        Insn::Ldc2W(_) => (0, 2),
        Insn::Astore(_) | Insn::Pop | Insn::Areturn | Insn::Athrow => (1, 0),
        Insn::Ifeq(_) | Insn::Ifne(_) | Insn::Ifnull(_) | Insn::Ifnonnull(_) => (1, 0),
        Insn::Aaload => (2, 1),
        Insn::Aastore => (3, 0),
        Insn::Pop2 => (2, 0),
        Insn::Dup => (1, 2),
        Insn::DupX1 => (2, 3),
        Insn::Swap => (2, 2),
        Insn::Anewarray(_) | Insn::Arraylength | Insn::Checkcast(_) | Insn::Instanceof(_) => (1, 1),
        Insn::Getstatic(i) | Insn::Putstatic(i) | Insn::Getfield(i) | Insn::Putfield(i) => {
            let m = member(*i)?;
            let words = parse_field_descriptor(m.descriptor).map_err(|e| e.to_string())?.words();
            match insn {
                Insn::Getstatic(_) => (0, words),
                Insn::Putstatic(_) => (words, 0),
                Insn::Getfield(_) => (1, words),
                _ => (1 + words, 0),
            }
        }
        Insn::Invokevirtual(i) | Insn::Invokespecial(i) | Insn::Invokestatic(i) | Insn::Invokeinterface(i, _) => {
            let m = member(*i)?;
            if matches!(insn, Insn::Invokeinterface(..)) != (m.kind == MemberKind::InterfaceMethod) {
                return Err(format!("{} of a {:?} reference", insn.mnemonic(), m.kind));
            }
            let desc = parse_method_descriptor(m.descriptor).map_err(|e| e.to_string())?;
            let receiver = if matches!(insn, Insn::Invokestatic(_)) { 0 } else { 1 };
            if let Insn::Invokeinterface(_, count) = insn {
                if *count as u16 != desc.param_words() + 1 {
                    return Err("invokeinterface argument count mismatch".into());
                }
            }
            (desc.param_words() + receiver, desc.return_words())
        }
    })
}
