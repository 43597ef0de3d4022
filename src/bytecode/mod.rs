pub mod builder;
pub mod codegen;
pub mod disasm;
pub mod op;
pub mod program;

pub use op::Opcode;
pub use program::{Function, Program, Syscall, SyscallEntry};
