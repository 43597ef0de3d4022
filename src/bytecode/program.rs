use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::runtime::thread::Thread;

/// An embedder provided callable. The function receives the running thread
/// and the number of arguments on the value stack; it must pop its
/// arguments and push exactly one result (which may be `none`).
pub type Syscall = fn(&mut Thread, i32);

/// A compiled function record. `code_start..code_end` is the byte range of
/// the function's instructions inside the program code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub num_args: u32,
    pub code_start: u32,
    pub code_end: u32,
}

/// A syscall slot in the program image. The binding itself is not part of
/// the serialized image; after loading, syscalls are re-bound by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallEntry {
    pub name: String,
    pub num_args: u32,
    #[serde(skip)]
    pub call: Option<Syscall>,
}

impl SyscallEntry {
    pub fn new(name: &str, call: Syscall, num_args: u32) -> Self {
        SyscallEntry {
            name: name.to_string(),
            num_args,
            call: Some(call),
        }
    }
}

/// A global variable descriptor: its name and its slot in the globals
/// array, used by `@init` and by embedders inspecting state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalInfo {
    pub name: String,
    pub slot: u32,
}

/// The program image: everything the VM needs to execute a build. Read
/// only after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub(crate) code: Vec<u8>,
    pub(crate) strings: Vec<String>,
    pub(crate) functions: Vec<Function>,
    pub(crate) syscalls: Vec<SyscallEntry>,
    /// Sparse PC -> source line map.
    pub(crate) line_table: BTreeMap<u32, u32>,
    pub(crate) globals: Vec<GlobalInfo>,
    /// Per-line copy of the source, for error rendering and disassembly.
    pub(crate) source_lines: Vec<String>,
}

impl Program {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn syscalls(&self) -> &[SyscallEntry] {
        &self.syscalls
    }

    pub fn globals(&self) -> &[GlobalInfo] {
        &self.globals
    }

    pub fn num_globals(&self) -> u32 {
        self.globals
            .iter()
            .map(|g| g.slot + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn function_find(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Find the function whose code range contains `pc`. Used by the
    /// disassembler and by error reports.
    pub fn function_at(&self, pc: u32) -> Option<&Function> {
        self.functions
            .iter()
            .find(|f| pc >= f.code_start && pc < f.code_end)
    }

    /// Source line recorded for the instruction at `pc`.
    pub fn line_for(&self, pc: u32) -> Option<u32> {
        self.line_table.get(&pc).copied()
    }

    pub fn line_table(&self) -> &BTreeMap<u32, u32> {
        &self.line_table
    }

    pub fn source_line(&self, line: u32) -> Option<&str> {
        // lines are 1 based
        self.source_lines
            .get(line.checked_sub(1)? as usize)
            .map(String::as_str)
    }

    /// Re-attach a syscall binding after `load_json`. Returns false when no
    /// syscall of that name exists in the image.
    pub fn bind_syscall(&mut self, name: &str, call: Syscall) -> bool {
        match self.syscalls.iter_mut().find(|s| s.name == name) {
            Some(entry) => {
                entry.call = Some(call);
                true
            }
            None => false,
        }
    }

    /// Serialize the image. Syscall bindings are dropped; see
    /// [`Program::bind_syscall`].
    pub fn save_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn load_json(text: &str) -> serde_json::Result<Program> {
        serde_json::from_str(text)
    }
}
