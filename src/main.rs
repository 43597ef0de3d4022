use std::io::{Read, Write};
use std::path::Path;
use std::{env, fs, process};

use flint::{
    disasm, Compiler, Program, RunState, Thread, ThreadError, Value, Vm,
};

/// Cycle budget per resume slice while driving a script.
const CYCLE_SLICE: u32 = 1 << 27;

fn main() {
    let args: Vec<String> = env::args().collect();

    let tokens_only = args.contains(&"--tokens".to_string());
    let bytecode = args.contains(&"--bc".to_string()) || args.contains(&"--bytecode".to_string());

    // first non-flag argument is the filename
    let filename = args.iter().skip(1).find(|a| !a.starts_with('-'));

    let Some(filename) = filename else {
        print_usage();
        process::exit(1);
    };
    ensure_extension(filename);

    let source = match fs::read_to_string(filename) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("failed to read '{}': {}", filename, e);
            process::exit(1);
        }
    };

    if tokens_only {
        dump_tokens(&source);
        return;
    }
    run_program(&source, bytecode);
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("fl") {
        eprintln!("error: expected a .fl file, got {}", filename);
        process::exit(1);
    }
}

fn print_usage() {
    println!("flint - a tiny imperative scripting language");
    println!();
    println!("usage:");
    println!("  flint <file.fl>           build and run a program");
    println!("  flint --tokens <file.fl>  show tokens only");
    println!("  flint --bc <file.fl>      print disassembly before running");
}

fn dump_tokens(source: &str) {
    match flint::frontend::lexer::Lexer::new(source).tokenize() {
        Ok((tokens, _)) => {
            for token in tokens {
                println!("{:4}  {}", token.line, token.kind);
            }
        }
        Err(e) => {
            fail_compile(&e, source);
        }
    }
}

fn run_program(source: &str, bytecode: bool) {
    let mut compiler = Compiler::new();
    compiler.register_syscall("putc", sys_putc, 1);
    compiler.register_syscall("getc", sys_getc, 0);

    let program = match compiler.build(source) {
        Ok(program) => program,
        Err(e) => fail_compile(&e, source),
    };

    if bytecode {
        print!("{}", disasm(&program));
    }

    let Some(main_fn) = program.function_find("main") else {
        eprintln!("unable to locate function 'main'");
        process::exit(1);
    };

    let mut vm = Vm::new(&program);
    if let Some(init) = program.function_find("@init") {
        if let Err((e, line)) = drive(&mut vm, init) {
            fail_runtime(&program, e, line);
        }
    }
    match drive(&mut vm, main_fn) {
        Ok(value) => {
            let _ = std::io::stdout().flush();
            match value {
                Value::Int(code) => println!("exit: {}", code),
                other => println!("exit: {}", other.render().unwrap_or_default()),
            }
        }
        Err((e, line)) => fail_runtime(&program, e, line),
    }
}

/// Run one function to completion on a fresh thread, resuming across
/// cooperative halts, and carry the faulting source line out of errors.
fn drive<'p>(
    vm: &mut Vm<'p>,
    func: &flint::Function,
) -> Result<Value, (ThreadError, Option<u32>)> {
    let mut thread = Thread::new(vm);
    thread.prepare(func, &[]).map_err(|e| (e, None))?;
    loop {
        match thread.resume(CYCLE_SLICE) {
            Ok(RunState::Finished) => {
                return Ok(thread.return_value().cloned().unwrap_or(Value::None));
            }
            Ok(RunState::Running) => {
                if !thread.halted() {
                    return Err((ThreadError::MaxCycleCount, thread.source_line()));
                }
            }
            Err(e) => return Err((e, thread.error_line())),
        }
    }
}

fn fail_compile(error: &flint::CompileError, source: &str) -> ! {
    eprintln!("{}", error);
    if let Some(text) = source.lines().nth(error.line.saturating_sub(1) as usize) {
        eprintln!("  {}", text);
    }
    process::exit(1);
}

fn fail_runtime(program: &Program, error: ThreadError, line: Option<u32>) -> ! {
    match line {
        Some(line) => {
            eprintln!("line:{} - {}", line, error);
            if let Some(text) = program.source_line(line) {
                eprintln!("  {}", text);
            }
        }
        None => eprintln!("{}", error),
    }
    process::exit(2);
}

fn sys_putc(t: &mut Thread, _num_args: i32) {
    if let Ok(v) = t.pop() {
        if let Value::Int(ch) = *t.value(v) {
            print!("{}", (ch as u8) as char);
        }
    }
    let none = t.new_none();
    let _ = t.push(none);
}

fn sys_getc(t: &mut Thread, _num_args: i32) {
    let mut buf = [0u8; 1];
    let ch = match std::io::stdin().read(&mut buf) {
        Ok(1) => buf[0] as i32,
        _ => -1,
    };
    let r = t.new_int(ch);
    let _ = t.push(r);
}
