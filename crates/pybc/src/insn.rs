use serde::{Deserialize, Serialize};

use crate::unit::BytecodeError;

/// The subset of the host instruction set that the compiler emits.
///
/// Branch operands are absolute byte offsets inside the method body; the
/// encoder turns them into the relative 16-bit form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Insn {
    Nop,
    AconstNull,
    /// Push an int; encoded as `iconst_<n>`, `bipush` or `sipush`.
    Iconst(i16),
    Ldc(u16),
    Ldc2W(u16),
    Aload(u16),
    Astore(u16),
    Aaload,
    Aastore,
    Pop,
    Pop2,
    Dup,
    DupX1,
    Swap,
    Ifeq(u32),
    Ifne(u32),
    Ifnull(u32),
    Ifnonnull(u32),
    Goto(u32),
    Areturn,
    Return,
    Athrow,
    Getstatic(u16),
    Putstatic(u16),
    Getfield(u16),
    Putfield(u16),
    Invokevirtual(u16),
    Invokespecial(u16),
    Invokestatic(u16),
    /// Interface method reference and argument word count (receiver included).
    Invokeinterface(u16, u8),
    New(u16),
    Anewarray(u16),
    Arraylength,
    Checkcast(u16),
    Instanceof(u16),
}

mod op {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_5: u8 = 0x08;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ALOAD: u8 = 0x19;
    pub const ALOAD_0: u8 = 0x2a;
    pub const ALOAD_3: u8 = 0x2d;
    pub const AALOAD: u8 = 0x32;
    pub const ASTORE: u8 = 0x3a;
    pub const ASTORE_0: u8 = 0x4b;
    pub const ASTORE_3: u8 = 0x4e;
    pub const AASTORE: u8 = 0x53;
    pub const POP: u8 = 0x57;
    pub const POP2: u8 = 0x58;
    pub const DUP: u8 = 0x59;
    pub const DUP_X1: u8 = 0x5a;
    pub const SWAP: u8 = 0x5f;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9a;
    pub const GOTO: u8 = 0xa7;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const NEW: u8 = 0xbb;
    pub const ANEWARRAY: u8 = 0xbd;
    pub const ARRAYLENGTH: u8 = 0xbe;
    pub const ATHROW: u8 = 0xbf;
    pub const CHECKCAST: u8 = 0xc0;
    pub const INSTANCEOF: u8 = 0xc1;
    pub const WIDE: u8 = 0xc4;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
}

impl Insn {
    /// Encoded length in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Insn::Iconst(v) => match *v {
                -1..=5 => 1,
                -128..=127 => 2,
                _ => 3,
            },
            Insn::Ldc(idx) => {
                if *idx <= 0xff {
                    2
                } else {
                    3
                }
            }
            Insn::Aload(n) | Insn::Astore(n) => match *n {
                0..=3 => 1,
                4..=255 => 2,
                _ => 4,
            },
            Insn::Ldc2W(_)
            | Insn::Ifeq(_)
            | Insn::Ifne(_)
            | Insn::Ifnull(_)
            | Insn::Ifnonnull(_)
            | Insn::Goto(_)
            | Insn::Getstatic(_)
            | Insn::Putstatic(_)
            | Insn::Getfield(_)
            | Insn::Putfield(_)
            | Insn::Invokevirtual(_)
            | Insn::Invokespecial(_)
            | Insn::Invokestatic(_)
            | Insn::New(_)
            | Insn::Anewarray(_)
            | Insn::Checkcast(_)
            | Insn::Instanceof(_) => 3,
            Insn::Invokeinterface(..) => 5,
            _ => 1,
        }
    }

    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Insn::Ifeq(t) | Insn::Ifne(t) | Insn::Ifnull(t) | Insn::Ifnonnull(t) | Insn::Goto(t) => {
                Some(*t)
            }
            _ => None,
        }
    }

    /// Rewrite the branch operand, leaving other instructions untouched.
    pub fn map_target(self, f: impl FnOnce(u32) -> u32) -> Insn {
        match self {
            Insn::Ifeq(t) => Insn::Ifeq(f(t)),
            Insn::Ifne(t) => Insn::Ifne(f(t)),
            Insn::Ifnull(t) => Insn::Ifnull(f(t)),
            Insn::Ifnonnull(t) => Insn::Ifnonnull(f(t)),
            Insn::Goto(t) => Insn::Goto(f(t)),
            other => other,
        }
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Insn::Goto(_) | Insn::Areturn | Insn::Return | Insn::Athrow)
    }

    /// Constant pool index referenced by the instruction, if any.
    pub fn pool_index(&self) -> Option<u16> {
        match self {
            Insn::Ldc(i)
            | Insn::Ldc2W(i)
            | Insn::Getstatic(i)
            | Insn::Putstatic(i)
            | Insn::Getfield(i)
            | Insn::Putfield(i)
            | Insn::Invokevirtual(i)
            | Insn::Invokespecial(i)
            | Insn::Invokestatic(i)
            | Insn::Invokeinterface(i, _)
            | Insn::New(i)
            | Insn::Anewarray(i)
            | Insn::Checkcast(i)
            | Insn::Instanceof(i) => Some(*i),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Insn::Nop => "nop",
            Insn::AconstNull => "aconst_null",
            Insn::Iconst(_) => "iconst",
            Insn::Ldc(_) => "ldc",
            Insn::Ldc2W(_) => "ldc2_w",
            Insn::Aload(_) => "aload",
            Insn::Astore(_) => "astore",
            Insn::Aaload => "aaload",
            Insn::Aastore => "aastore",
            Insn::Pop => "pop",
            Insn::Pop2 => "pop2",
            Insn::Dup => "dup",
            Insn::DupX1 => "dup_x1",
            Insn::Swap => "swap",
            Insn::Ifeq(_) => "ifeq",
            Insn::Ifne(_) => "ifne",
            Insn::Ifnull(_) => "ifnull",
            Insn::Ifnonnull(_) => "ifnonnull",
            Insn::Goto(_) => "goto",
            Insn::Areturn => "areturn",
            Insn::Return => "return",
            Insn::Athrow => "athrow",
            Insn::Getstatic(_) => "getstatic",
            Insn::Putstatic(_) => "putstatic",
            Insn::Getfield(_) => "getfield",
            Insn::Putfield(_) => "putfield",
            Insn::Invokevirtual(_) => "invokevirtual",
            Insn::Invokespecial(_) => "invokespecial",
            Insn::Invokestatic(_) => "invokestatic",
            Insn::Invokeinterface(..) => "invokeinterface",
            Insn::New(_) => "new",
            Insn::Anewarray(_) => "anewarray",
            Insn::Arraylength => "arraylength",
            Insn::Checkcast(_) => "checkcast",
            Insn::Instanceof(_) => "instanceof",
        }
    }

    pub fn encode(&self, pc: u32, out: &mut Vec<u8>) -> Result<(), BytecodeError> {
        let with_u16 = |out: &mut Vec<u8>, opcode: u8, v: u16| {
            out.push(opcode);
            out.extend_from_slice(&v.to_be_bytes());
        };
        match self {
            Insn::Nop => out.push(op::NOP),
            Insn::AconstNull => out.push(op::ACONST_NULL),
            Insn::Iconst(v) => match *v {
                -1..=5 => out.push((op::ICONST_M1 as i16 + 1 + *v) as u8),
                -128..=127 => {
                    out.push(op::BIPUSH);
                    out.push(*v as i8 as u8);
                }
                _ => with_u16(out, op::SIPUSH, *v as u16),
            },
            Insn::Ldc(idx) => {
                if *idx <= 0xff {
                    out.push(op::LDC);
                    out.push(*idx as u8);
                } else {
                    with_u16(out, op::LDC_W, *idx);
                }
            }
            Insn::Ldc2W(idx) => with_u16(out, op::LDC2_W, *idx),
            Insn::Aload(n) => encode_local(out, op::ALOAD, op::ALOAD_0, *n),
            Insn::Astore(n) => encode_local(out, op::ASTORE, op::ASTORE_0, *n),
            Insn::Aaload => out.push(op::AALOAD),
            Insn::Aastore => out.push(op::AASTORE),
            Insn::Pop => out.push(op::POP),
            Insn::Pop2 => out.push(op::POP2),
            Insn::Dup => out.push(op::DUP),
            Insn::DupX1 => out.push(op::DUP_X1),
            Insn::Swap => out.push(op::SWAP),
            Insn::Ifeq(t) => encode_branch(out, op::IFEQ, pc, *t)?,
            Insn::Ifne(t) => encode_branch(out, op::IFNE, pc, *t)?,
            Insn::Ifnull(t) => encode_branch(out, op::IFNULL, pc, *t)?,
            Insn::Ifnonnull(t) => encode_branch(out, op::IFNONNULL, pc, *t)?,
            Insn::Goto(t) => encode_branch(out, op::GOTO, pc, *t)?,
            Insn::Areturn => out.push(op::ARETURN),
            Insn::Return => out.push(op::RETURN),
            Insn::Athrow => out.push(op::ATHROW),
            Insn::Getstatic(i) => with_u16(out, op::GETSTATIC, *i),
            Insn::Putstatic(i) => with_u16(out, op::PUTSTATIC, *i),
            Insn::Getfield(i) => with_u16(out, op::GETFIELD, *i),
            Insn::Putfield(i) => with_u16(out, op::PUTFIELD, *i),
            Insn::Invokevirtual(i) => with_u16(out, op::INVOKEVIRTUAL, *i),
            Insn::Invokespecial(i) => with_u16(out, op::INVOKESPECIAL, *i),
            Insn::Invokestatic(i) => with_u16(out, op::INVOKESTATIC, *i),
            Insn::Invokeinterface(i, count) => {
                with_u16(out, op::INVOKEINTERFACE, *i);
                out.push(*count);
                out.push(0);
            }
            Insn::New(i) => with_u16(out, op::NEW, *i),
            Insn::Anewarray(i) => with_u16(out, op::ANEWARRAY, *i),
            Insn::Arraylength => out.push(op::ARRAYLENGTH),
            Insn::Checkcast(i) => with_u16(out, op::CHECKCAST, *i),
            Insn::Instanceof(i) => with_u16(out, op::INSTANCEOF, *i),
        }
        Ok(())
    }

    /// Decode one instruction at `pc`, returning it with its length.
    pub fn decode(code: &[u8], pc: usize) -> Result<(Insn, usize), BytecodeError> {
        let byte = |i: usize| code.get(i).copied().ok_or(BytecodeError::Truncated(i));
        let u16_at = |i: usize| -> Result<u16, BytecodeError> { Ok(u16::from_be_bytes([byte(i)?, byte(i + 1)?])) };
        let target = |i: usize| -> Result<u32, BytecodeError> {
            let rel = u16_at(i)? as i16 as i64;
            let abs = pc as i64 + rel;
            u32::try_from(abs).map_err(|_| BytecodeError::Invalid(format!("branch at {pc} leaves the method")))
        };
        let opcode = byte(pc)?;
        let decoded = match opcode {
            op::NOP => (Insn::Nop, 1),
            op::ACONST_NULL => (Insn::AconstNull, 1),
            op::ICONST_M1..=op::ICONST_5 => (Insn::Iconst(opcode as i16 - op::ICONST_M1 as i16 - 1), 1),
            op::BIPUSH => (Insn::Iconst(byte(pc + 1)? as i8 as i16), 2),
            op::SIPUSH => (Insn::Iconst(u16_at(pc + 1)? as i16), 3),
            op::LDC => (Insn::Ldc(byte(pc + 1)? as u16), 2),
            op::LDC_W => (Insn::Ldc(u16_at(pc + 1)?), 3),
            op::LDC2_W => (Insn::Ldc2W(u16_at(pc + 1)?), 3),
            op::ALOAD => (Insn::Aload(byte(pc + 1)? as u16), 2),
            op::ALOAD_0..=op::ALOAD_3 => (Insn::Aload((opcode - op::ALOAD_0) as u16), 1),
            op::AALOAD => (Insn::Aaload, 1),
            op::ASTORE => (Insn::Astore(byte(pc + 1)? as u16), 2),
            op::ASTORE_0..=op::ASTORE_3 => (Insn::Astore((opcode - op::ASTORE_0) as u16), 1),
            op::AASTORE => (Insn::Aastore, 1),
            op::POP => (Insn::Pop, 1),
            op::POP2 => (Insn::Pop2, 1),
            op::DUP => (Insn::Dup, 1),
            op::DUP_X1 => (Insn::DupX1, 1),
            op::SWAP => (Insn::Swap, 1),
            op::IFEQ => (Insn::Ifeq(target(pc + 1)?), 3),
            op::IFNE => (Insn::Ifne(target(pc + 1)?), 3),
            op::IFNULL => (Insn::Ifnull(target(pc + 1)?), 3),
            op::IFNONNULL => (Insn::Ifnonnull(target(pc + 1)?), 3),
            op::GOTO => (Insn::Goto(target(pc + 1)?), 3),
            op::ARETURN => (Insn::Areturn, 1),
            op::RETURN => (Insn::Return, 1),
            op::ATHROW => (Insn::Athrow, 1),
            op::GETSTATIC => (Insn::Getstatic(u16_at(pc + 1)?), 3),
            op::PUTSTATIC => (Insn::Putstatic(u16_at(pc + 1)?), 3),
            op::GETFIELD => (Insn::Getfield(u16_at(pc + 1)?), 3),
            op::PUTFIELD => (Insn::Putfield(u16_at(pc + 1)?), 3),
            op::INVOKEVIRTUAL => (Insn::Invokevirtual(u16_at(pc + 1)?), 3),
            op::INVOKESPECIAL => (Insn::Invokespecial(u16_at(pc + 1)?), 3),
            op::INVOKESTATIC => (Insn::Invokestatic(u16_at(pc + 1)?), 3),
            op::INVOKEINTERFACE => (Insn::Invokeinterface(u16_at(pc + 1)?, byte(pc + 3)?), 5),
            op::NEW => (Insn::New(u16_at(pc + 1)?), 3),
            op::ANEWARRAY => (Insn::Anewarray(u16_at(pc + 1)?), 3),
            op::ARRAYLENGTH => (Insn::Arraylength, 1),
            op::CHECKCAST => (Insn::Checkcast(u16_at(pc + 1)?), 3),
            op::INSTANCEOF => (Insn::Instanceof(u16_at(pc + 1)?), 3),
            op::WIDE => match byte(pc + 1)? {
                op::ALOAD => (Insn::Aload(u16_at(pc + 2)?), 4),
                op::ASTORE => (Insn::Astore(u16_at(pc + 2)?), 4),
                other => return Err(BytecodeError::UnknownOpcode { opcode: other, pc: pc + 1 }),
            },
            other => return Err(BytecodeError::UnknownOpcode { opcode: other, pc }),
        };
        Ok(decoded)
    }
}

fn encode_local(out: &mut Vec<u8>, long_form: u8, short_base: u8, n: u16) {
    match n {
        0..=3 => out.push(short_base + n as u8),
        4..=255 => {
            out.push(long_form);
            out.push(n as u8);
        }
        _ => {
            out.push(op::WIDE);
            out.push(long_form);
            out.extend_from_slice(&n.to_be_bytes());
        }
    }
}

fn encode_branch(out: &mut Vec<u8>, opcode: u8, pc: u32, target: u32) -> Result<(), BytecodeError> {
    let rel = target as i64 - pc as i64;
    let rel = i16::try_from(rel).map_err(|_| BytecodeError::BranchOutOfRange { from: pc, to: target })?;
    out.push(opcode);
    out.extend_from_slice(&rel.to_be_bytes());
    Ok(())
}

/// Byte offset of every instruction, followed by the total code length.
pub fn offsets(insns: &[Insn]) -> Vec<u32> {
    let mut pcs = Vec::with_capacity(insns.len() + 1);
    let mut pc = 0u32;
    for insn in insns {
        pcs.push(pc);
        pc += insn.size();
    }
    pcs.push(pc);
    pcs
}

pub fn encode_all(insns: &[Insn]) -> Result<Vec<u8>, BytecodeError> {
    let mut out = Vec::new();
    for insn in insns {
        let pc = out.len() as u32;
        insn.encode(pc, &mut out)?;
    }
    Ok(out)
}

pub fn decode_all(code: &[u8]) -> Result<Vec<Insn>, BytecodeError> {
    let mut insns = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let (insn, len) = Insn::decode(code, pc)?;
        insns.push(insn);
        pc += len;
    }
    Ok(insns)
}
