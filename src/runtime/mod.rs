pub mod gc;
pub mod thread;
pub mod thread_error;

use crate::bytecode::program::{Function, Program};
use crate::lang::value::{Value, ValueRef};
use gc::Gc;
use thread::{RunState, Thread};
use thread_error::ThreadError;

/// Cycle budget used by the one-shot [`Vm::call_once`] helper.
const CALL_ONCE_CYCLES: u32 = 1 << 27;

pub type BinaryHandler = fn(&mut Thread<'_, '_>, ValueRef, ValueRef) -> bool;
pub type MemberGetHandler = fn(&mut Thread<'_, '_>, ValueRef, &str) -> bool;
pub type MemberSetHandler = fn(&mut Thread<'_, '_>, ValueRef, ValueRef, &str) -> bool;
pub type ArraySetHandler = fn(&mut Thread<'_, '_>, ValueRef, ValueRef, ValueRef) -> bool;
pub type ThreadHandler = fn(&mut Thread<'_, '_>);

/// Optional embedder hooks. The dynamic operator hooks run when the
/// built-in coercions do not apply; returning true means handled, and the
/// handler is responsible for pushing any result.
#[derive(Default, Clone, Copy)]
pub struct Handlers {
    pub on_add: Option<BinaryHandler>,
    pub on_sub: Option<BinaryHandler>,
    pub on_mul: Option<BinaryHandler>,
    pub on_div: Option<BinaryHandler>,
    pub on_equals: Option<BinaryHandler>,
    pub on_member_get: Option<MemberGetHandler>,
    pub on_member_set: Option<MemberSetHandler>,
    pub on_array_get: Option<BinaryHandler>,
    pub on_array_set: Option<ArraySetHandler>,
    pub on_thread_error: Option<ThreadHandler>,
    pub on_thread_finish: Option<ThreadHandler>,
}

/// The virtual machine: one program image, one collector, one globals
/// array. Threads borrow the VM while they run, so a VM executes one
/// script thread at a time, cooperatively.
pub struct Vm<'p> {
    pub(crate) program: &'p Program,
    pub(crate) gc: Gc,
    pub(crate) globals: Vec<ValueRef>,
    pub handlers: Handlers,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p Program) -> Self {
        Vm {
            program,
            gc: Gc::new(),
            globals: Vec::new(),
            handlers: Handlers::default(),
        }
    }

    pub fn with_gc_capacity(program: &'p Program, bytes: usize) -> Self {
        Vm {
            program,
            gc: Gc::with_capacity(bytes),
            globals: Vec::new(),
            handlers: Handlers::default(),
        }
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    /// Run the synthesized `@init` function, sizing the globals array and
    /// assigning every global initializer. Must run before any user entry
    /// point.
    pub fn call_init(&mut self) -> Result<(), ThreadError> {
        let Some(init) = self.program.function_find("@init") else {
            return Ok(());
        };
        self.call_once(init, &[]).map(|_| ())
    }

    /// Prepare and run a single function to completion, returning its
    /// value. Arrays in the result are returned as shallow handles.
    pub fn call_once(&mut self, func: &Function, args: &[Value]) -> Result<Value, ThreadError> {
        let mut thread = Thread::new(self);
        thread.prepare(func, args)?;
        match thread.resume(CALL_ONCE_CYCLES)? {
            RunState::Finished => Ok(thread.return_value().cloned().unwrap_or(Value::None)),
            RunState::Running => Err(ThreadError::MaxCycleCount),
        }
    }

    /// Read a global by name, for embedder inspection between runs.
    pub fn global(&self, name: &str) -> Option<&Value> {
        let info = self.program.globals().iter().find(|g| g.name == name)?;
        let r = *self.globals.get(info.slot as usize)?;
        Some(self.gc.get(r))
    }

    pub fn gc_used_bytes(&self) -> usize {
        self.gc.used_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::ProgramBuilder;
    use crate::bytecode::op::Opcode;
    use crate::bytecode::program::SyscallEntry;
    use crate::lang::value::NONE_REF;

    // =========================================================================
    // hand-assembled programs drive the VM without the compiler
    // =========================================================================

    struct ProgBuilder {
        b: ProgramBuilder,
    }

    impl ProgBuilder {
        fn new() -> Self {
            ProgBuilder {
                b: ProgramBuilder::new(),
            }
        }

        fn op(&mut self, op: Opcode) -> &mut Self {
            self.b.emit(op, 1).expect("emit");
            self
        }

        fn op1(&mut self, op: Opcode, v: i32) -> &mut Self {
            self.b.emit1(op, v, 1).expect("emit");
            self
        }

        fn op2(&mut self, op: Opcode, a: i32, v: i32) -> &mut Self {
            self.b.emit2(op, a, v, 1).expect("emit");
            self
        }

        fn string(&mut self, s: &str) -> i32 {
            self.b.add_string(s) as i32
        }

        fn finish(mut self) -> Program {
            let end = self.b.pos();
            self.b.add_function(Function {
                name: "main".to_string(),
                num_args: 0,
                code_start: 0,
                code_end: end,
            });
            self.b.finish()
        }

        fn finish_with(mut self, syscalls: Vec<SyscallEntry>) -> Program {
            self.b.set_syscalls(syscalls);
            self.finish()
        }
    }

    fn run(prog: &Program) -> Result<Value, ThreadError> {
        let mut vm = Vm::new(prog);
        let main = prog.function_find("main").expect("main function");
        vm.call_once(main, &[])
    }

    fn expect_int(prog: &Program, want: i32) {
        match run(prog) {
            Ok(Value::Int(got)) => assert_eq!(got, want),
            other => panic!("expected int {}, got {:?}", want, other),
        }
    }

    fn expect_error(prog: &Program, want: ThreadError) {
        match run(prog) {
            Err(got) => assert_eq!(got, want),
            other => panic!("expected error {:?}, got {:?}", want, other),
        }
    }

    #[test]
    fn test_int_arithmetic() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 7)
            .op1(Opcode::NewInt, 3)
            .op(Opcode::Sub)
            .op1(Opcode::NewInt, 5)
            .op(Opcode::Mul)
            .op1(Opcode::Ret, 0);
        expect_int(&p.finish(), 20);
    }

    #[test]
    fn test_divide_by_zero() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 1)
            .op1(Opcode::NewInt, 0)
            .op(Opcode::Div)
            .op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::DivideByZero);

        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 1)
            .op1(Opcode::NewInt, 0)
            .op(Opcode::Mod)
            .op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::DivideByZero);
    }

    #[test]
    fn test_float_coercion() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 1)
            .op1(Opcode::NewFlt, 0.5f32.to_bits() as i32)
            .op(Opcode::Add)
            .op1(Opcode::Ret, 0);
        match run(&p.finish()) {
            Ok(Value::Float(f)) => assert_eq!(f, 1.5),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_string_concat_stringifies() {
        let mut p = ProgBuilder::new();
        let idx = p.string("n=");
        p.op1(Opcode::NewStr, idx)
            .op1(Opcode::NewInt, 4)
            .op(Opcode::Add)
            .op1(Opcode::Ret, 0);
        match run(&p.finish()) {
            Ok(Value::Str(s)) => assert_eq!(s, "n=4"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_string_equality_is_bytewise() {
        let mut p = ProgBuilder::new();
        let a = p.string("abc");
        p.op1(Opcode::NewStr, a)
            .op1(Opcode::NewStr, a)
            .op(Opcode::Eq)
            .op1(Opcode::Ret, 0);
        expect_int(&p.finish(), 1);
    }

    #[test]
    fn test_none_equality() {
        let mut p = ProgBuilder::new();
        p.op(Opcode::NewNone)
            .op(Opcode::NewNone)
            .op(Opcode::Eq)
            .op1(Opcode::Ret, 0);
        expect_int(&p.finish(), 1);

        let mut p = ProgBuilder::new();
        p.op(Opcode::NewNone)
            .op1(Opcode::NewInt, 0)
            .op(Opcode::Eq)
            .op1(Opcode::Ret, 0);
        expect_int(&p.finish(), 0);
    }

    #[test]
    fn test_mixed_type_operation_fails() {
        let mut p = ProgBuilder::new();
        let idx = p.string("x");
        p.op1(Opcode::NewStr, idx)
            .op1(Opcode::NewInt, 1)
            .op(Opcode::Sub)
            .op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::BadTypeOperation);
    }

    #[test]
    fn test_array_bounds() {
        // read past the end
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 5)
            .op1(Opcode::NewAry, 3)
            .op(Opcode::Deref)
            .op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::BadArrayBounds);

        // negative index
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, -1)
            .op1(Opcode::NewAry, 3)
            .op(Opcode::Deref)
            .op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::BadArrayBounds);
    }

    #[test]
    fn test_array_store_and_load() {
        // a[1] = 42; return a[1]  (array kept in a local slot)
        let mut p = ProgBuilder::new();
        p.op1(Opcode::Locals, 1)
            .op1(Opcode::NewAry, 3)
            .op1(Opcode::Setv, 0)
            .op1(Opcode::NewInt, 42)
            .op1(Opcode::NewInt, 1)
            .op1(Opcode::Getv, 0)
            .op(Opcode::Seta)
            .op1(Opcode::NewInt, 1)
            .op1(Opcode::Getv, 0)
            .op(Opcode::Deref)
            .op1(Opcode::Ret, 1);
        expect_int(&p.finish(), 42);
    }

    #[test]
    fn test_fresh_array_slots_read_none() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 0)
            .op1(Opcode::NewAry, 2)
            .op(Opcode::Deref)
            .op1(Opcode::Ret, 0);
        match run(&p.finish()) {
            Ok(Value::None) => {}
            other => panic!("expected none, got {:?}", other),
        }
    }

    #[test]
    fn test_string_subscript_reads_bytes() {
        let mut p = ProgBuilder::new();
        let idx = p.string("AB");
        p.op1(Opcode::NewInt, 1)
            .op1(Opcode::NewStr, idx)
            .op(Opcode::Deref)
            .op1(Opcode::Ret, 0);
        expect_int(&p.finish(), 'B' as i32);
    }

    #[test]
    fn test_member_length_on_array() {
        let mut p = ProgBuilder::new();
        let member = p.string("length");
        p.op1(Opcode::NewAry, 7)
            .op1(Opcode::Getm, member)
            .op1(Opcode::Ret, 0);
        expect_int(&p.finish(), 7);
    }

    #[test]
    fn test_member_access_unhandled() {
        let mut p = ProgBuilder::new();
        let member = p.string("missing");
        p.op1(Opcode::NewInt, 1)
            .op1(Opcode::Getm, member)
            .op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::BadMemberAccess);
    }

    #[test]
    fn test_ary_init_builds_from_stack() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 10)
            .op1(Opcode::NewInt, 20)
            .op1(Opcode::NewInt, 30)
            .op1(Opcode::AryInit, 3)
            .op1(Opcode::NewInt, 2)
            .op(Opcode::Sub) // (array - 2) is a type error; use DEREF instead
            .op1(Opcode::Ret, 0);
        // build a correct program: [10 20 30][0]
        let mut p2 = ProgBuilder::new();
        p2.op1(Opcode::NewInt, 0)
            .op1(Opcode::NewInt, 10)
            .op1(Opcode::NewInt, 20)
            .op1(Opcode::NewInt, 30)
            .op1(Opcode::AryInit, 3)
            .op(Opcode::Deref)
            .op1(Opcode::Ret, 0);
        expect_int(&p2.finish(), 10);
        expect_error(&p.finish(), ThreadError::BadTypeOperation);
    }

    #[test]
    fn test_globals_resize_and_access() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::Globals, 2)
            .op1(Opcode::NewInt, 9)
            .op1(Opcode::Setg, 1)
            .op1(Opcode::Getg, 1)
            .op1(Opcode::Ret, 0);
        expect_int(&p.finish(), 9);
    }

    #[test]
    fn test_global_bounds() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::Globals, 1)
            .op1(Opcode::Getg, 5)
            .op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::BadGetGlobal);
    }

    #[test]
    fn test_bad_opcode() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 1).op1(Opcode::Ret, 0);
        let mut prog = p.finish();
        prog.code[0] = 0xfe;
        expect_error(&prog, ThreadError::BadOpcode);
    }

    #[test]
    fn test_pop_underflow() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::Pop, 3).op1(Opcode::NewInt, 0).op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::BadPop);
    }

    #[test]
    fn test_icall_function_value() {
        // target(): return 5   main(): push func; icall
        let mut b = ProgramBuilder::new();
        b.emit1(Opcode::NewInt, 5, 1).unwrap();
        b.emit1(Opcode::Ret, 0, 1).unwrap();
        let target_end = b.pos();
        let main_start = b.pos();
        b.emit1(Opcode::NewFunc, 0, 2).unwrap();
        b.emit1(Opcode::Icall, 0, 2).unwrap();
        b.emit1(Opcode::Ret, 0, 2).unwrap();
        let main_end = b.pos();
        b.add_function(Function {
            name: "target".to_string(),
            num_args: 0,
            code_start: 0,
            code_end: target_end,
        });
        b.add_function(Function {
            name: "main".to_string(),
            num_args: 0,
            code_start: main_start,
            code_end: main_end,
        });
        let prog = b.finish();
        expect_int(&prog, 5);
    }

    #[test]
    fn test_icall_arity_checked_dynamically() {
        let mut b = ProgramBuilder::new();
        b.emit1(Opcode::NewInt, 5, 1).unwrap();
        b.emit1(Opcode::Ret, 1, 1).unwrap();
        let target_end = b.pos();
        let main_start = b.pos();
        // no arguments pushed, target expects one
        b.emit1(Opcode::NewFunc, 0, 2).unwrap();
        b.emit1(Opcode::Icall, 0, 2).unwrap();
        b.emit1(Opcode::Ret, 0, 2).unwrap();
        let main_end = b.pos();
        b.add_function(Function {
            name: "target".to_string(),
            num_args: 1,
            code_start: 0,
            code_end: target_end,
        });
        b.add_function(Function {
            name: "main".to_string(),
            num_args: 0,
            code_start: main_start,
            code_end: main_end,
        });
        expect_error(&b.finish(), ThreadError::BadNumArgs);
    }

    #[test]
    fn test_syscall_pops_args_pushes_result() {
        fn sys_sum(t: &mut Thread, nargs: i32) {
            let mut total = 0;
            for _ in 0..nargs {
                if let Ok(v) = t.pop() {
                    if let Value::Int(n) = t.value(v) {
                        total += *n;
                    }
                }
            }
            let r = t.new_int(total);
            let _ = t.push(r);
        }
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 3)
            .op1(Opcode::NewInt, 4)
            .op2(Opcode::Scall, 2, 0)
            .op1(Opcode::Ret, 0);
        let prog = p.finish_with(vec![SyscallEntry::new("sum", sys_sum, 2)]);
        expect_int(&prog, 7);
    }

    #[test]
    fn test_syscall_value_through_icall() {
        fn sys_nine(t: &mut Thread, _nargs: i32) {
            let r = t.new_int(9);
            let _ = t.push(r);
        }
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewScall, 0)
            .op1(Opcode::Icall, 0)
            .op1(Opcode::Ret, 0);
        let prog = p.finish_with(vec![SyscallEntry::new("nine", sys_nine, 0)]);
        expect_int(&prog, 9);
    }

    #[test]
    fn test_unbound_syscall_fails() {
        let mut p = ProgBuilder::new();
        p.op2(Opcode::Scall, 0, 0).op1(Opcode::Ret, 0);
        let prog = p.finish_with(vec![SyscallEntry {
            name: "missing".to_string(),
            num_args: 0,
            call: None,
        }]);
        expect_error(&prog, ThreadError::BadSyscall);
    }

    #[test]
    fn test_halt_yields_to_embedder() {
        fn sys_halt(t: &mut Thread, _nargs: i32) {
            t.halt();
            let none = t.new_none();
            let _ = t.push(none);
        }
        let mut p = ProgBuilder::new();
        p.op2(Opcode::Scall, 0, 0)
            .op1(Opcode::Pop, 1)
            .op1(Opcode::NewInt, 3)
            .op1(Opcode::Ret, 0);
        let prog = p.finish_with(vec![SyscallEntry::new("yield", sys_halt, 0)]);

        let mut vm = Vm::new(&prog);
        let main = prog.function_find("main").unwrap();
        let mut thread = Thread::new(&mut vm);
        thread.prepare(main, &[]).unwrap();
        assert_eq!(thread.resume(100).unwrap(), RunState::Running);
        assert!(thread.halted());
        assert_eq!(thread.resume(100).unwrap(), RunState::Finished);
        assert_eq!(thread.return_value(), Some(&Value::Int(3)));
    }

    #[test]
    fn test_cycle_budget_suspends() {
        // infinite loop: JMP 0
        let mut p = ProgBuilder::new();
        p.op1(Opcode::Jmp, 0);
        let prog = p.finish();
        let mut vm = Vm::new(&prog);
        let main = prog.function_find("main").unwrap();
        let mut thread = Thread::new(&mut vm);
        thread.prepare(main, &[]).unwrap();
        assert_eq!(thread.resume(1000).unwrap(), RunState::Running);
        assert_eq!(thread.cycles(), 1000);
    }

    #[test]
    fn test_prepare_checks_arity() {
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 0).op1(Opcode::Ret, 0);
        let prog = p.finish();
        let mut vm = Vm::new(&prog);
        let main = prog.function_find("main").unwrap();
        let mut thread = Thread::new(&mut vm);
        assert_eq!(
            thread.prepare(main, &[Value::Int(1)]),
            Err(ThreadError::BadNumArgs)
        );
    }

    #[test]
    fn test_frame_depth_limit() {
        // main calls itself forever
        let mut p = ProgBuilder::new();
        p.op2(Opcode::Call, 0, 0).op1(Opcode::Ret, 0);
        expect_error(&p.finish(), ThreadError::StackOverflow);
    }

    #[test]
    fn test_gc_runs_during_execution() {
        // a loop that allocates garbage each iteration: the collector keeps
        // usage bounded and the program still terminates correctly
        //
        //   i = 200           (local 0)
        //   while i: "waste" + i; pop; i = i - 1
        //   return 77
        let mut b = ProgramBuilder::new();
        b.emit1(Opcode::Locals, 1, 1).unwrap();
        b.emit1(Opcode::NewInt, 200, 1).unwrap();
        b.emit1(Opcode::Setv, 0, 1).unwrap();
        let top = b.pos();
        b.emit1(Opcode::Getv, 0, 2).unwrap();
        let exit_fix = b.emit1(Opcode::Fjmp, 0, 2).unwrap();
        let waste = b.add_string("waste") as i32;
        b.emit1(Opcode::NewStr, waste, 3).unwrap();
        b.emit1(Opcode::Getv, 0, 3).unwrap();
        b.emit(Opcode::Add, 3).unwrap();
        b.emit1(Opcode::Pop, 1, 3).unwrap();
        b.emit1(Opcode::Getv, 0, 4).unwrap();
        b.emit1(Opcode::NewInt, 1, 4).unwrap();
        b.emit(Opcode::Sub, 4).unwrap();
        b.emit1(Opcode::Setv, 0, 4).unwrap();
        b.emit1(Opcode::Jmp, top as i32, 4).unwrap();
        let exit = b.pos();
        b.apply_fixup(exit_fix, exit as i32);
        b.emit1(Opcode::NewInt, 77, 5).unwrap();
        b.emit1(Opcode::Ret, 1, 5).unwrap();
        let end = b.pos();
        b.add_function(Function {
            name: "main".to_string(),
            num_args: 0,
            code_start: 0,
            code_end: end,
        });
        let prog = b.finish();

        // a tiny arena forces many collections
        let mut vm = Vm::with_gc_capacity(&prog, 4 * 1024);
        let main = prog.function_find("main").unwrap();
        match vm.call_once(main, &[]) {
            Ok(Value::Int(77)) => {}
            other => panic!("expected 77, got {:?}", other),
        }
        assert!(vm.gc_used_bytes() < 4 * 1024);
    }

    #[test]
    fn test_out_of_memory() {
        // allocate and keep strings on the stack until the budget bursts
        let mut b = ProgramBuilder::new();
        let s = b.add_string("0123456789abcdef") as i32;
        let top = b.pos();
        b.emit1(Opcode::NewStr, s, 1).unwrap();
        b.emit1(Opcode::Jmp, top as i32, 1).unwrap();
        let end = b.pos();
        b.add_function(Function {
            name: "main".to_string(),
            num_args: 0,
            code_start: 0,
            code_end: end,
        });
        let prog = b.finish();
        let mut vm = Vm::with_gc_capacity(&prog, 2 * 1024);
        let main = prog.function_find("main").unwrap();
        assert_eq!(vm.call_once(main, &[]), Err(ThreadError::OutOfMemory));
    }

    #[test]
    fn test_dynamic_add_handler() {
        fn on_add(t: &mut Thread, l: ValueRef, _r: ValueRef) -> bool {
            // arrays "add" to their first element in this embedder
            if let Value::Array(slots) = t.value(l) {
                let first = slots[0];
                let _ = t.push(first);
                return true;
            }
            false
        }
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 6)
            .op1(Opcode::NewAry, 2)
            .op1(Opcode::NewInt, 1)
            .op(Opcode::Add)
            .op1(Opcode::Ret, 0);
        let prog = p.finish();
        let mut vm = Vm::new(&prog);
        vm.handlers.on_add = Some(on_add);
        let main = prog.function_find("main").unwrap();
        // array + 1 hits the handler, which pushes slot 0 (none); the
        // surrounding code then returns it
        match vm.call_once(main, &[]) {
            Ok(Value::None) => {}
            other => panic!("expected none, got {:?}", other),
        }
    }

    #[test]
    fn test_thread_error_handler_fires() {
        fn on_error(t: &mut Thread) {
            t.user = Some(Box::new("fired"));
        }
        let mut p = ProgBuilder::new();
        p.op1(Opcode::NewInt, 1)
            .op1(Opcode::NewInt, 0)
            .op(Opcode::Div)
            .op1(Opcode::Ret, 0);
        let prog = p.finish();
        let mut vm = Vm::new(&prog);
        vm.handlers.on_thread_error = Some(on_error);
        let main = prog.function_find("main").unwrap();
        let mut thread = Thread::new(&mut vm);
        thread.prepare(main, &[]).unwrap();
        assert_eq!(thread.resume(100), Err(ThreadError::DivideByZero));
        assert!(thread.user.is_some());
        assert!(thread.has_error());
    }

    #[test]
    fn test_step_inst_and_breakpoints() {
        let mut b = ProgramBuilder::new();
        b.emit1(Opcode::NewInt, 1, 1).unwrap();
        b.emit1(Opcode::NewInt, 2, 2).unwrap();
        b.emit(Opcode::Add, 2).unwrap();
        b.emit1(Opcode::Ret, 0, 3).unwrap();
        let end = b.pos();
        b.add_function(Function {
            name: "main".to_string(),
            num_args: 0,
            code_start: 0,
            code_end: end,
        });
        let prog = b.finish();
        let mut vm = Vm::new(&prog);
        let main = prog.function_find("main").unwrap();
        let mut thread = Thread::new(&mut vm);
        thread.prepare(main, &[]).unwrap();
        thread.breakpoint_add(2);
        assert_eq!(thread.resume(100).unwrap(), RunState::Running);
        // halted on arrival at line 2
        assert!(thread.halted());
        assert_eq!(thread.source_line(), Some(2));
        thread.breakpoint_clear();
        assert_eq!(thread.resume(100).unwrap(), RunState::Finished);
        assert_eq!(thread.return_value(), Some(&Value::Int(3)));
    }

    #[test]
    fn test_stack_effect_of_ret() {
        // after a call completes, exactly one value (the result) remains
        // above the caller's stack
        let mut b = ProgramBuilder::new();
        // callee(arg): locals 1; return arg
        b.emit1(Opcode::Locals, 1, 1).unwrap();
        b.emit1(Opcode::Getv, -1, 1).unwrap();
        b.emit1(Opcode::Ret, 2, 1).unwrap();
        let callee_end = b.pos();
        let main_start = b.pos();
        b.emit1(Opcode::NewInt, 11, 2).unwrap();
        b.emit2(Opcode::Call, 1, 0, 2).unwrap();
        b.emit1(Opcode::Ret, 0, 2).unwrap();
        let main_end = b.pos();
        b.add_function(Function {
            name: "callee".to_string(),
            num_args: 1,
            code_start: 0,
            code_end: callee_end,
        });
        b.add_function(Function {
            name: "main".to_string(),
            num_args: 0,
            code_start: main_start,
            code_end: main_end,
        });
        let prog = b.finish();

        let mut vm = Vm::new(&prog);
        let main = prog.function_find("main").unwrap();
        let mut thread = Thread::new(&mut vm);
        thread.prepare(main, &[]).unwrap();
        assert_eq!(thread.resume(1000).unwrap(), RunState::Finished);
        // terminal frame popped: only the return value remains
        assert_eq!(thread.value_stack().len(), 1);
        assert_eq!(thread.return_value(), Some(&Value::Int(11)));
    }

    #[test]
    fn test_shared_array_identity_survives_collection() {
        // store one array into two global slots, force a collection, then
        // write through one slot and read through the other
        let mut p = ProgBuilder::new();
        p.op1(Opcode::Globals, 2)
            .op1(Opcode::NewAry, 2)
            .op1(Opcode::Setg, 0)
            .op1(Opcode::Getg, 0)
            .op1(Opcode::Setg, 1)
            .op1(Opcode::NewInt, 0)
            .op1(Opcode::Ret, 0);
        let prog = p.finish();
        let mut vm = Vm::new(&prog);
        let main = prog.function_find("main").unwrap();
        vm.call_once(main, &[]).unwrap();

        {
            let mut thread = Thread::new(&mut vm);
            thread.gc_collect();
        }
        let (a, b) = (vm.globals[0], vm.globals[1]);
        assert_eq!(a, b);
        assert_ne!(a, NONE_REF);
    }
}
