use std::any::Any;
use std::collections::BTreeSet;

use crate::bytecode::op::Opcode;
use crate::bytecode::program::Function;
use crate::lang::value::{Value, ValueRef, NONE_REF};
use crate::runtime::thread_error::ThreadError;
use crate::runtime::Vm;

/// Value stack capacity, in slots.
const STACK_LIMIT: usize = 1024;

/// Call depth limit.
const FRAME_LIMIT: usize = 64;

/*
 * STACK LAYOUT (grows upward)
 *
 *   |  work stack   |
 *   |  local K-1    |
 *   |  ...          |
 *   |  local 0      |  <-- frame base (sp)
 *   |  arg N-1      |      offset -1
 *   |  ...          |
 *   |  arg 0        |      offset -N
 *   |  caller work  |
 *
 * CALL records the head after the arguments as the frame base, so argument
 * k of N lives at offset k - N and locals at 0, 1, ...
 */
#[derive(Debug, Clone, Copy)]
struct Frame {
    sp: u32,
    return_pc: u32,
    #[allow(dead_code)]
    callee: u32,
    /// Returning from a terminal frame ends the thread.
    terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Finished,
}

/// A prepared, resumable execution of a script function.
///
/// The thread owns its value stack, frame stack and program counter, and
/// borrows the VM for the program image, the globals and the collector.
/// Between `resume` calls the state is stable and may be inspected.
///
/// Instruction handlers never hold a value reference across an allocation:
/// everything long-lived sits in the value stack or the globals array,
/// which are exactly the collector's roots.
pub struct Thread<'v, 'p> {
    vm: &'v mut Vm<'p>,
    stack: Vec<ValueRef>,
    frames: Vec<Frame>,
    pc: u32,
    /// PC of the instruction currently executing (before operand reads).
    op_pc: u32,
    cycles: u64,
    finished: bool,
    halted: bool,
    error: Option<ThreadError>,
    breakpoints: BTreeSet<u32>,
    last_line: Option<u32>,
    /// Embedder slot, reachable from syscalls.
    pub user: Option<Box<dyn Any>>,
}

impl<'v, 'p> Thread<'v, 'p> {
    pub fn new(vm: &'v mut Vm<'p>) -> Self {
        Thread {
            vm,
            stack: Vec::new(),
            frames: Vec::new(),
            pc: 0,
            op_pc: 0,
            cycles: 0,
            finished: true,
            halted: false,
            error: None,
            breakpoints: BTreeSet::new(),
            last_line: None,
            user: None,
        }
    }

    // -------------------------------------------------------------------------
    // embedder surface
    // -------------------------------------------------------------------------

    /// Point the thread at `func` with the given arguments. Argument values
    /// are copied into the collector; arrays cannot cross the boundary.
    pub fn prepare(&mut self, func: &Function, args: &[Value]) -> Result<(), ThreadError> {
        self.error = None;
        self.finished = true;
        self.halted = false;
        self.cycles = 0;
        self.stack.clear();
        self.frames.clear();

        self.pc = func.code_start;
        if func.num_args as usize != args.len() {
            self.error = Some(ThreadError::BadNumArgs);
            return Err(ThreadError::BadNumArgs);
        }
        for arg in args {
            let r = match arg {
                Value::None => NONE_REF,
                Value::Array(_) => {
                    self.error = Some(ThreadError::BadTypeOperation);
                    return Err(ThreadError::BadTypeOperation);
                }
                other => self.vm.gc.alloc(other.clone()),
            };
            self.push(r)?;
        }
        self.enter(self.stack.len() as u32, self.pc, func.code_start)?;
        if let Some(frame) = self.frames.last_mut() {
            frame.terminal = true;
        }
        self.finished = false;
        Ok(())
    }

    /// Interpret up to `cycles` instructions. Returns `Running` when the
    /// budget ran out or the thread halted cooperatively.
    pub fn resume(&mut self, cycles: u32) -> Result<RunState, ThreadError> {
        if self.finished {
            return match self.error {
                Some(e) => Err(e),
                None => Ok(RunState::Finished),
            };
        }
        self.halted = false;
        for _ in 0..cycles {
            if let Err(e) = self.tick_gc() {
                return Err(self.fail(e));
            }
            if let Err(e) = self.step_imp() {
                return Err(self.fail(e));
            }
            if self.finished {
                if let Some(handler) = self.vm.handlers.on_thread_finish {
                    handler(self);
                }
                return Ok(RunState::Finished);
            }
            if self.halted {
                return Ok(RunState::Running);
            }
        }
        Ok(RunState::Running)
    }

    /// Execute a single instruction.
    pub fn step_inst(&mut self) -> Result<(), ThreadError> {
        if self.finished {
            return Ok(());
        }
        if let Err(e) = self.tick_gc() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.step_imp() {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Execute instructions until the source line changes.
    pub fn step_line(&mut self) -> Result<(), ThreadError> {
        if self.finished {
            return Ok(());
        }
        let line = self.source_line();
        loop {
            if let Err(e) = self.step_imp() {
                return Err(self.fail(e));
            }
            if self.finished || self.source_line() != line {
                return Ok(());
            }
        }
    }

    /// Request a cooperative stop at the next instruction boundary. Used by
    /// syscalls to yield control back to the embedder.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<ThreadError> {
        self.error
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Source line of the next instruction to execute.
    pub fn source_line(&self) -> Option<u32> {
        self.vm.program.line_for(self.pc)
    }

    /// Source line of the instruction that raised the current error.
    pub fn error_line(&self) -> Option<u32> {
        self.vm.program.line_for(self.op_pc)
    }

    /// The return value of a cleanly finished thread.
    pub fn return_value(&self) -> Option<&Value> {
        if self.finished && self.error.is_none() {
            self.stack.last().map(|&r| self.value(r))
        } else {
            None
        }
    }

    pub fn value_stack(&self) -> &[ValueRef] {
        &self.stack
    }

    pub fn value(&self, r: ValueRef) -> &Value {
        self.vm.gc.get(r)
    }

    pub fn push(&mut self, r: ValueRef) -> Result<(), ThreadError> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(ThreadError::StackOverflow);
        }
        self.stack.push(r);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<ValueRef, ThreadError> {
        self.stack.pop().ok_or(ThreadError::StackUnderflow)
    }

    pub fn new_int(&mut self, value: i32) -> ValueRef {
        self.vm.gc.new_int(value)
    }

    pub fn new_float(&mut self, value: f32) -> ValueRef {
        self.vm.gc.new_float(value)
    }

    pub fn new_string(&mut self, value: &str) -> ValueRef {
        self.vm.gc.new_string(value)
    }

    pub fn new_array(&mut self, len: usize) -> ValueRef {
        self.vm.gc.new_array(len)
    }

    pub fn new_none(&mut self) -> ValueRef {
        NONE_REF
    }

    /// Raise an error from inside a syscall; the thread stops after the
    /// syscall returns.
    pub fn raise_error(&mut self, error: ThreadError) {
        self.error = Some(error);
    }

    pub fn breakpoint_add(&mut self, line: u32) {
        self.breakpoints.insert(line);
    }

    pub fn breakpoint_remove(&mut self, line: u32) {
        self.breakpoints.remove(&line);
    }

    pub fn breakpoint_clear(&mut self) {
        self.breakpoints.clear();
    }

    /// Collect now: forward the value stack and the globals, then swap the
    /// spaces.
    pub fn gc_collect(&mut self) {
        let vm = &mut *self.vm;
        vm.gc.begin_collect();
        vm.gc.forward_roots(&mut self.stack);
        vm.gc.forward_roots(&mut vm.globals);
        vm.gc.end_collect();
    }

    // -------------------------------------------------------------------------
    // fetch, decode, dispatch
    // -------------------------------------------------------------------------

    fn tick_gc(&mut self) -> Result<(), ThreadError> {
        if self.vm.gc.should_collect() {
            self.gc_collect();
            if self.vm.gc.over_budget() {
                return Err(ThreadError::OutOfMemory);
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: ThreadError) -> ThreadError {
        self.error = Some(error);
        self.finished = true;
        if let Some(handler) = self.vm.handlers.on_thread_error {
            handler(self);
        }
        if let Some(handler) = self.vm.handlers.on_thread_finish {
            handler(self);
        }
        error
    }

    fn read_opcode(&mut self) -> Result<Opcode, ThreadError> {
        let byte = *self
            .vm
            .program
            .code()
            .get(self.pc as usize)
            .ok_or(ThreadError::BadOpcode)?;
        self.pc += 1;
        Opcode::from_byte(byte).ok_or(ThreadError::BadOpcode)
    }

    fn read_operand(&mut self) -> Result<i32, ThreadError> {
        let at = self.pc as usize;
        let bytes: [u8; 4] = self
            .vm
            .program
            .code()
            .get(at..at + 4)
            .ok_or(ThreadError::BadOpcode)?
            .try_into()
            .map_err(|_| ThreadError::BadOpcode)?;
        self.pc += 4;
        Ok(i32::from_le_bytes(bytes))
    }

    fn step_imp(&mut self) -> Result<(), ThreadError> {
        self.op_pc = self.pc;
        let op = self.read_opcode()?;
        match op {
            Opcode::Add => self.op_add()?,
            Opcode::Sub => self.op_sub()?,
            Opcode::Mul => self.op_mul()?,
            Opcode::Div => self.op_div()?,
            Opcode::Mod => self.op_mod()?,
            Opcode::And => self.op_and()?,
            Opcode::Or => self.op_or()?,
            Opcode::Not => self.op_not()?,
            Opcode::Neg => self.op_neg()?,
            Opcode::Lt => self.compare(|a, b| a < b, |a, b| a < b)?,
            Opcode::Gt => self.compare(|a, b| a > b, |a, b| a > b)?,
            Opcode::Leq => self.compare(|a, b| a <= b, |a, b| a <= b)?,
            Opcode::Geq => self.compare(|a, b| a >= b, |a, b| a >= b)?,
            Opcode::Eq => self.op_eq()?,
            Opcode::Jmp => {
                let target = self.read_operand()?;
                self.pc = target as u32;
            }
            Opcode::Tjmp => {
                let target = self.read_operand()?;
                let cond = self.pop()?;
                if self.value(cond).as_bool() {
                    self.pc = target as u32;
                }
            }
            Opcode::Fjmp => {
                let target = self.read_operand()?;
                let cond = self.pop()?;
                if !self.value(cond).as_bool() {
                    self.pc = target as u32;
                }
            }
            Opcode::Call => {
                let _num_args = self.read_operand()?;
                let callee = self.read_operand()?;
                self.enter(self.stack.len() as u32, self.pc, callee as u32)?;
            }
            Opcode::Ret => self.op_ret()?,
            Opcode::Scall => {
                let num_args = self.read_operand()?;
                let index = self.read_operand()?;
                self.do_syscall(index, num_args)?;
            }
            Opcode::Icall => self.op_icall()?,
            Opcode::Pop => {
                let count = self.read_operand()?;
                if count < 0 || self.stack.len() < count as usize {
                    return Err(ThreadError::BadPop);
                }
                self.stack.truncate(self.stack.len() - count as usize);
            }
            Opcode::NewInt => {
                let value = self.read_operand()?;
                let r = self.vm.gc.new_int(value);
                self.push(r)?;
            }
            Opcode::NewStr => {
                let index = self.read_operand()?;
                let program = self.vm.program;
                let text = program.string(index as u32).ok_or(ThreadError::BadOpcode)?;
                let r = self.vm.gc.new_string(text);
                self.push(r)?;
            }
            Opcode::NewFlt => {
                let bits = self.read_operand()?;
                let r = self.vm.gc.new_float(f32::from_bits(bits as u32));
                self.push(r)?;
            }
            Opcode::NewAry => {
                let len = self.read_operand()?;
                if len <= 0 {
                    return Err(ThreadError::BadArrayBounds);
                }
                let r = self.vm.gc.new_array(len as usize);
                self.push(r)?;
            }
            Opcode::NewNone => self.push(NONE_REF)?,
            Opcode::NewFunc => {
                let pc = self.read_operand()?;
                let r = self.vm.gc.new_func(pc as u32);
                self.push(r)?;
            }
            Opcode::NewScall => {
                let index = self.read_operand()?;
                let r = self.vm.gc.new_syscall(index as u32);
                self.push(r)?;
            }
            Opcode::Locals => {
                let count = self.read_operand()?;
                for _ in 0..count {
                    self.push(NONE_REF)?;
                }
            }
            Opcode::Globals => {
                let count = self.read_operand()?;
                self.vm.globals.clear();
                self.vm.globals.resize(count.max(0) as usize, NONE_REF);
            }
            Opcode::Getv => {
                let offset = self.read_operand()?;
                let r = self.getv(offset)?;
                self.push(r)?;
            }
            Opcode::Setv => {
                let offset = self.read_operand()?;
                let value = self.pop()?;
                self.setv(offset, value)?;
            }
            Opcode::Getg => {
                let slot = self.read_operand()?;
                let r = *self
                    .vm
                    .globals
                    .get(slot.max(0) as usize)
                    .filter(|_| slot >= 0)
                    .ok_or(ThreadError::BadGetGlobal)?;
                self.push(r)?;
            }
            Opcode::Setg => {
                let slot = self.read_operand()?;
                let value = self.pop()?;
                if slot < 0 || slot as usize >= self.vm.globals.len() {
                    return Err(ThreadError::BadSetGlobal);
                }
                self.vm.globals[slot as usize] = value;
            }
            Opcode::Deref => self.op_deref()?,
            Opcode::Seta => self.op_seta()?,
            Opcode::Getm => self.op_getm()?,
            Opcode::Setm => self.op_setm()?,
            Opcode::AryInit => self.op_ary_init()?,
        }

        // breakpoints halt when a different breakpointed line is reached
        if !self.breakpoints.is_empty() {
            let line = self.vm.program.line_for(self.pc);
            if let Some(l) = line {
                if self.breakpoints.contains(&l) && self.last_line != Some(l) {
                    self.halted = true;
                }
            }
            self.last_line = line;
        }
        self.cycles += 1;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // frames
    // -------------------------------------------------------------------------

    fn enter(&mut self, sp: u32, return_pc: u32, callee: u32) -> Result<(), ThreadError> {
        if self.frames.len() >= FRAME_LIMIT {
            return Err(ThreadError::StackOverflow);
        }
        self.frames.push(Frame {
            sp,
            return_pc,
            callee,
            terminal: false,
        });
        self.pc = callee;
        Ok(())
    }

    fn leave(&mut self) -> Result<u32, ThreadError> {
        let frame = self.frames.pop().ok_or(ThreadError::StackUnderflow)?;
        self.finished = frame.terminal || self.frames.is_empty();
        Ok(frame.return_pc)
    }

    fn frame(&self) -> Result<&Frame, ThreadError> {
        self.frames.last().ok_or(ThreadError::StackUnderflow)
    }

    fn getv(&self, offset: i32) -> Result<ValueRef, ThreadError> {
        let index = self.frame()?.sp as i64 + offset as i64;
        if index < 0 || index >= self.stack.len() as i64 {
            return Err(ThreadError::BadGetv);
        }
        Ok(self.stack[index as usize])
    }

    fn setv(&mut self, offset: i32, value: ValueRef) -> Result<(), ThreadError> {
        let index = self.frame()?.sp as i64 + offset as i64;
        if index < 0 || index >= self.stack.len() as i64 {
            return Err(ThreadError::BadSetv);
        }
        self.stack[index as usize] = value;
        Ok(())
    }

    fn op_ret(&mut self) -> Result<(), ThreadError> {
        let frame_size = self.read_operand()?;
        let result = self.pop()?;
        if frame_size < 0 || self.stack.len() < frame_size as usize {
            return Err(ThreadError::StackUnderflow);
        }
        self.stack.truncate(self.stack.len() - frame_size as usize);
        self.push(result)?;
        self.pc = self.leave()?;
        Ok(())
    }

    fn do_syscall(&mut self, index: i32, num_args: i32) -> Result<(), ThreadError> {
        let call = self
            .vm
            .program
            .syscalls()
            .get(index.max(0) as usize)
            .filter(|_| index >= 0)
            .and_then(|entry| entry.call)
            .ok_or(ThreadError::BadSyscall)?;
        call(self, num_args);
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn op_icall(&mut self) -> Result<(), ThreadError> {
        let num_args = self.read_operand()?;
        let callee = self.pop()?;
        match *self.value(callee) {
            Value::Syscall(index) => self.do_syscall(index as i32, num_args),
            Value::Func(addr) => {
                let func = self
                    .vm
                    .program
                    .functions()
                    .iter()
                    .find(|f| f.code_start == addr)
                    .ok_or(ThreadError::BadTypeOperation)?;
                if func.num_args as i32 != num_args {
                    return Err(ThreadError::BadNumArgs);
                }
                self.enter(self.stack.len() as u32, self.pc, addr)
            }
            _ => Err(ThreadError::BadTypeOperation),
        }
    }

    // -------------------------------------------------------------------------
    // operators
    // -------------------------------------------------------------------------

    fn binary_operands(&mut self) -> Result<(ValueRef, ValueRef), ThreadError> {
        let r = self.pop()?;
        let l = self.pop()?;
        Ok((l, r))
    }

    fn push_int(&mut self, value: i32) -> Result<(), ThreadError> {
        let r = self.vm.gc.new_int(value);
        self.push(r)
    }

    fn push_float(&mut self, value: f32) -> Result<(), ThreadError> {
        let r = self.vm.gc.new_float(value);
        self.push(r)
    }

    fn op_add(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let lv = self.value(l).clone();
        let rv = self.value(r).clone();
        if let (Value::Int(a), Value::Int(b)) = (&lv, &rv) {
            return self.push_int(a.wrapping_add(*b));
        }
        if let (Some(a), Some(b)) = (lv.as_f32(), rv.as_f32()) {
            return self.push_float(a + b);
        }
        // string concatenation stringifies the other operand
        if let Value::Str(a) = &lv {
            if let Some(b) = rv.render() {
                let joined = format!("{}{}", a, b);
                let v = self.vm.gc.new_string(&joined);
                return self.push(v);
            }
        }
        if let Value::Str(b) = &rv {
            if let Some(a) = lv.render() {
                let joined = format!("{}{}", a, b);
                let v = self.vm.gc.new_string(&joined);
                return self.push(v);
            }
        }
        if let Some(handler) = self.vm.handlers.on_add {
            if handler(self, l, r) {
                return Ok(());
            }
        }
        Err(ThreadError::BadTypeOperation)
    }

    fn op_sub(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let lv = self.value(l).clone();
        let rv = self.value(r).clone();
        if let (Value::Int(a), Value::Int(b)) = (&lv, &rv) {
            return self.push_int(a.wrapping_sub(*b));
        }
        if let (Some(a), Some(b)) = (lv.as_f32(), rv.as_f32()) {
            return self.push_float(a - b);
        }
        if let Some(handler) = self.vm.handlers.on_sub {
            if handler(self, l, r) {
                return Ok(());
            }
        }
        Err(ThreadError::BadTypeOperation)
    }

    fn op_mul(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let lv = self.value(l).clone();
        let rv = self.value(r).clone();
        if let (Value::Int(a), Value::Int(b)) = (&lv, &rv) {
            return self.push_int(a.wrapping_mul(*b));
        }
        if let (Some(a), Some(b)) = (lv.as_f32(), rv.as_f32()) {
            return self.push_float(a * b);
        }
        if let Some(handler) = self.vm.handlers.on_mul {
            if handler(self, l, r) {
                return Ok(());
            }
        }
        Err(ThreadError::BadTypeOperation)
    }

    fn op_div(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let lv = self.value(l).clone();
        let rv = self.value(r).clone();
        if let (Value::Int(a), Value::Int(b)) = (&lv, &rv) {
            if *b == 0 {
                return Err(ThreadError::DivideByZero);
            }
            return self.push_int(a.wrapping_div(*b));
        }
        if let (Some(a), Some(b)) = (lv.as_f32(), rv.as_f32()) {
            return self.push_float(a / b);
        }
        if let Some(handler) = self.vm.handlers.on_div {
            if handler(self, l, r) {
                return Ok(());
            }
        }
        Err(ThreadError::BadTypeOperation)
    }

    fn op_mod(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        if let (Value::Int(a), Value::Int(b)) = (self.value(l), self.value(r)) {
            let (a, b) = (*a, *b);
            if b == 0 {
                return Err(ThreadError::DivideByZero);
            }
            return self.push_int(a.wrapping_rem(b));
        }
        Err(ThreadError::BadTypeOperation)
    }

    fn op_and(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let result = self.value(l).as_bool() && self.value(r).as_bool();
        self.push_int(result as i32)
    }

    fn op_or(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let result = self.value(l).as_bool() || self.value(r).as_bool();
        self.push_int(result as i32)
    }

    fn op_not(&mut self) -> Result<(), ThreadError> {
        let v = self.pop()?;
        let result = !self.value(v).as_bool();
        self.push_int(result as i32)
    }

    fn op_neg(&mut self) -> Result<(), ThreadError> {
        let v = self.pop()?;
        match *self.value(v) {
            Value::Int(a) => self.push_int(a.wrapping_neg()),
            Value::Float(a) => self.push_float(-a),
            _ => Err(ThreadError::BadTypeOperation),
        }
    }

    fn compare(
        &mut self,
        int_op: fn(i32, i32) -> bool,
        float_op: fn(f32, f32) -> bool,
    ) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let lv = self.value(l).clone();
        let rv = self.value(r).clone();
        if let (Value::Int(a), Value::Int(b)) = (&lv, &rv) {
            return self.push_int(int_op(*a, *b) as i32);
        }
        if let (Some(a), Some(b)) = (lv.as_f32(), rv.as_f32()) {
            return self.push_int(float_op(a, b) as i32);
        }
        Err(ThreadError::BadTypeOperation)
    }

    fn op_eq(&mut self) -> Result<(), ThreadError> {
        let (l, r) = self.binary_operands()?;
        let lv = self.value(l).clone();
        let rv = self.value(r).clone();
        match (&lv, &rv) {
            (Value::Int(a), Value::Int(b)) => return self.push_int((a == b) as i32),
            (Value::Str(a), Value::Str(b)) => return self.push_int((a == b) as i32),
            (Value::Func(a), Value::Func(b)) => return self.push_int((a == b) as i32),
            // only none equals none
            (Value::None, _) | (_, Value::None) => {
                let both = matches!((&lv, &rv), (Value::None, Value::None));
                return self.push_int(both as i32);
            }
            _ => {}
        }
        if let (Some(a), Some(b)) = (lv.as_f32(), rv.as_f32()) {
            return self.push_int((a == b) as i32);
        }
        if let Some(handler) = self.vm.handlers.on_equals {
            if handler(self, l, r) {
                return Ok(());
            }
        }
        Err(ThreadError::BadTypeOperation)
    }

    // -------------------------------------------------------------------------
    // arrays and members
    // -------------------------------------------------------------------------

    fn op_deref(&mut self) -> Result<(), ThreadError> {
        let a = self.pop()?;
        let i = self.pop()?;
        if let Some(handler) = self.vm.handlers.on_array_get {
            if handler(self, a, i) {
                return Ok(());
            }
        }
        if matches!(self.value(a), Value::None) {
            return Err(ThreadError::BadArrayObject);
        }
        let index = match *self.value(i) {
            Value::Int(v) => v,
            _ => return Err(ThreadError::BadArrayIndex),
        };
        match self.value(a) {
            Value::Array(slots) => {
                if index < 0 || index as usize >= slots.len() {
                    return Err(ThreadError::BadArrayBounds);
                }
                let slot = slots[index as usize];
                self.push(slot)
            }
            Value::Str(s) => {
                if index < 0 || index as usize >= s.len() {
                    return Err(ThreadError::BadArrayBounds);
                }
                let byte = s.as_bytes()[index as usize];
                self.push_int(byte as i32)
            }
            _ => Err(ThreadError::BadTypeOperation),
        }
    }

    fn op_seta(&mut self) -> Result<(), ThreadError> {
        let a = self.pop()?;
        let i = self.pop()?;
        let v = self.pop()?;
        if let Some(handler) = self.vm.handlers.on_array_set {
            if handler(self, a, i, v) {
                return Ok(());
            }
        }
        if !matches!(self.value(a), Value::Array(_)) {
            return Err(ThreadError::BadArrayObject);
        }
        let index = match *self.value(i) {
            Value::Int(v) => v,
            _ => return Err(ThreadError::BadArrayIndex),
        };
        let len = match self.value(a) {
            Value::Array(slots) => slots.len(),
            _ => 0,
        };
        if index < 0 || index as usize >= len {
            return Err(ThreadError::BadArrayBounds);
        }
        // arrays store by reference, everything else by copy
        let stored = self.vm.gc.copy(v);
        if let Value::Array(slots) = self.vm.gc.get_mut(a) {
            slots[index as usize] = stored;
        }
        Ok(())
    }

    fn op_getm(&mut self) -> Result<(), ThreadError> {
        let obj = self.pop()?;
        let index = self.read_operand()?;
        let program = self.vm.program;
        let member = program.string(index as u32).ok_or(ThreadError::BadOpcode)?;
        if let Value::Array(slots) = self.value(obj) {
            if member == "length" {
                let len = slots.len() as i32;
                return self.push_int(len);
            }
        }
        if let Some(handler) = self.vm.handlers.on_member_get {
            if handler(self, obj, member) {
                return Ok(());
            }
        }
        Err(ThreadError::BadMemberAccess)
    }

    fn op_setm(&mut self) -> Result<(), ThreadError> {
        let obj = self.pop()?;
        let expr = self.pop()?;
        let index = self.read_operand()?;
        let program = self.vm.program;
        let member = program.string(index as u32).ok_or(ThreadError::BadOpcode)?;
        if let Some(handler) = self.vm.handlers.on_member_set {
            if handler(self, obj, expr, member) {
                return Ok(());
            }
        }
        Err(ThreadError::BadMemberAccess)
    }

    fn op_ary_init(&mut self) -> Result<(), ThreadError> {
        let count = self.read_operand()?;
        if count <= 0 {
            return Err(ThreadError::BadArrayBounds);
        }
        let array = self.vm.gc.new_array(count as usize);
        for i in (0..count as usize).rev() {
            let item = self.pop()?;
            if let Value::Array(slots) = self.vm.gc.get_mut(array) {
                slots[i] = item;
            }
        }
        self.push(array)
    }
}
