//! flint is a tiny imperative scripting language: a compiler (lexer,
//! parser, semantic passes, bytecode emitter) paired with a stack virtual
//! machine that runs against a two-space copying garbage collector.
//!
//! Building and running a script:
//!
//! ```rust
//! use flint::{Compiler, Value, Vm};
//!
//! let source = "function main()\n  return 2 + 3 * 4\nend\n";
//! let program = Compiler::new().build(source).unwrap();
//!
//! let mut vm = Vm::new(&program);
//! vm.call_init().unwrap();
//! let main = program.function_find("main").unwrap();
//! assert_eq!(vm.call_once(main, &[]).unwrap(), Value::Int(14));
//! ```

pub mod bytecode;
pub mod error;
pub mod frontend;
pub mod lang;
pub mod runtime;


pub use bytecode::disasm::disasm;
pub use bytecode::program::{Function, Program, Syscall, SyscallEntry};
pub use error::{CompileError, CompileErrorKind};
pub use lang::value::{Value, ValueRef};
pub use runtime::thread::{RunState, Thread};
pub use runtime::thread_error::ThreadError;
pub use runtime::{Handlers, Vm};

use frontend::lexer::Lexer;
use frontend::parser::Parser;
use frontend::sema;

/// The top level build API. Syscalls are registered by name before
/// building; the program image records them by stable index.
pub struct Compiler {
    syscalls: Vec<SyscallEntry>,
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            syscalls: Vec::new(),
        }
    }

    /// Expose a host callable to scripts. `num_args` is advisory; syscall
    /// arity is enforced by convention at the call boundary.
    pub fn register_syscall(&mut self, name: &str, call: Syscall, num_args: u32) {
        self.syscalls.push(SyscallEntry::new(name, call, num_args));
    }

    /// Run the whole pipeline: source text to program image. The first
    /// error from any phase aborts the build.
    pub fn build(&self, source: &str) -> Result<Program, CompileError> {
        let (tokens, lines) = Lexer::new(source).tokenize()?;
        let mut ast = Parser::new(tokens).parse()?;
        sema::run(&mut ast, &self.syscalls)?;
        bytecode::codegen::generate(&ast, &self.syscalls, lines)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}
