use crate::bytecode::op::Opcode;
use crate::bytecode::program::{Function, GlobalInfo, Program, SyscallEntry};
use crate::error::{CompileError, CompileErrorKind};

/// Hard ceiling on emitted code size. Exceeding it is a build error, not a
/// panic, so a runaway input degrades gracefully.
const CODE_LIMIT: usize = 1 << 20;

/// Byte-level emitter that bridges the code generator and the program
/// image.
///
/// Jump and call targets that are not yet known are emitted as placeholder
/// operands; the emitter hands back the *byte index* of the operand so the
/// caller can patch it after the pass completes. No pointers into the code
/// buffer are ever held across appends.
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder {
            program: Program::default(),
        }
    }

    /// Current output position, i.e. the PC of the next instruction.
    pub fn pos(&self) -> u32 {
        self.program.code.len() as u32
    }

    fn write8(&mut self, value: u8, line: u32) -> Result<(), CompileError> {
        if self.program.code.len() + 1 > CODE_LIMIT {
            return Err(CompileError::new(CompileErrorKind::ProgramTooLarge, line));
        }
        self.program.code.push(value);
        Ok(())
    }

    fn write32(&mut self, value: i32, line: u32) -> Result<(), CompileError> {
        if self.program.code.len() + 4 > CODE_LIMIT {
            return Err(CompileError::new(CompileErrorKind::ProgramTooLarge, line));
        }
        self.program.code.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Emit an instruction with no operand.
    pub fn emit(&mut self, op: Opcode, line: u32) -> Result<(), CompileError> {
        debug_assert_eq!(op.operand_count(), 0);
        self.add_line(line);
        self.write8(op as u8, line)
    }

    /// Emit an instruction with one operand. Returns the byte index of the
    /// operand for later patching.
    pub fn emit1(&mut self, op: Opcode, value: i32, line: u32) -> Result<u32, CompileError> {
        debug_assert_eq!(op.operand_count(), 1);
        self.add_line(line);
        self.write8(op as u8, line)?;
        let at = self.pos();
        self.write32(value, line)?;
        Ok(at)
    }

    /// Emit an instruction with two operands. Returns the byte index of the
    /// *second* operand (the call target slot).
    pub fn emit2(&mut self, op: Opcode, a: i32, b: i32, line: u32) -> Result<u32, CompileError> {
        debug_assert_eq!(op.operand_count(), 2);
        self.add_line(line);
        self.write8(op as u8, line)?;
        self.write32(a, line)?;
        let at = self.pos();
        self.write32(b, line)?;
        Ok(at)
    }

    /// Patch a previously emitted operand in place.
    pub fn apply_fixup(&mut self, index: u32, value: i32) {
        let index = index as usize;
        self.program.code[index..index + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn add_line(&mut self, line: u32) {
        self.program.line_table.insert(self.pos(), line);
    }

    /// Intern a string into the pool, returning its index.
    pub fn add_string(&mut self, value: &str) -> u32 {
        if let Some(at) = self.program.strings.iter().position(|s| s == value) {
            return at as u32;
        }
        self.program.strings.push(value.to_string());
        self.program.strings.len() as u32 - 1
    }

    pub fn add_function(&mut self, func: Function) {
        self.program.functions.push(func);
    }

    pub fn add_global(&mut self, name: &str, slot: u32) {
        self.program.globals.push(GlobalInfo {
            name: name.to_string(),
            slot,
        });
    }

    pub fn set_syscalls(&mut self, syscalls: Vec<SyscallEntry>) {
        self.program.syscalls = syscalls;
    }

    pub fn set_source_lines(&mut self, lines: Vec<String>) {
        self.program.source_lines = lines;
    }

    pub fn finish(self) -> Program {
        self.program
    }
}
