//! Runtime-support library for compiled pyjvm programs.
//!
//! Emitted units call into `pylib/Dyn` for every dynamic operation. The
//! [`Vm`] here loads those units, links them against the runtime entry
//! points and interprets them, which is how the compiler's output is run
//! and tested without a host virtual machine.

pub mod builtins;
pub mod error;
pub mod format;
mod host;
mod methods;
mod natives;
pub mod number;
pub mod ops;
mod stdlib;
#[cfg(test)]
mod tests;
pub mod value;
pub mod vm;

pub use error::{PyErr, VmError};
pub use value::{Args, Value};
pub use vm::{LoadedUnit, Slot, Vm, VmStats};
