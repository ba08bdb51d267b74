//! Garnet Runtime - register-machine execution core
//!
//! This library provides:
//! - Stack bytecode ([`iseq`]) and its validator
//! - Translation into register bytecode ([`translate`], [`rtl`])
//! - The speculative dispatch loop ([`vm`]) with inline caches ([`cache`])
//! - A reference object model ([`host`]) behind the [`object::ObjectModel`] contract

/// Garnet runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cache;
pub mod host;
pub mod iseq;
pub mod object;
pub mod rtl;
pub mod runtime;
pub mod translate;
pub mod value;
pub mod vm;

pub use host::ReferenceHost;
pub use iseq::{validate, Iseq, IseqKind, Literal, StackInsn, ValidationError};
pub use object::{BasicOp, GlobalState, MethodBody, MethodEntry, NativeCall, ObjectModel};
pub use rtl::{disassemble, Insn, Routine, Variant};
pub use runtime::{Garnet, RunError, RunResult};
pub use translate::{translate, TranslateError, TranslateOptions};
pub use value::{ClassId, Symbol, Value};
pub use vm::{Vm, VmError, VmOptions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }
}
