pub mod abi;
pub mod descriptor;
pub mod insn;
pub mod pool;
pub mod unit;
pub mod verify;
#[cfg(test)]
mod tests;

pub use abi::{Operator, RuntimeEntry, UnaryOperator};
pub use insn::Insn;
pub use pool::{Constant, ConstantPool, MemberKind, MemberRef};
pub use unit::{BytecodeError, Code, CompiledUnit, ExceptionEntry, FieldInfo, LineNumber, MethodInfo};
