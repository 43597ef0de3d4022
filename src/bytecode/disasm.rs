use std::fmt::Write;

use crate::bytecode::op::Opcode;
use crate::bytecode::program::Program;

/// Disassemble a whole program image.
///
/// Each function is printed under a header, one `PC MNEMONIC OPERANDS` row
/// per instruction, with source lines interleaved whenever the line table
/// moves to a new line. The output is deterministic so that disassembling
/// the same image twice yields identical text.
pub fn disasm(program: &Program) -> String {
    let mut out = String::new();
    for func in program.functions() {
        let _ = writeln!(out, "{}:", func.name);
        let mut last_line = None;
        let mut pc = func.code_start;
        while pc < func.code_end {
            if let Some(line) = program.line_for(pc) {
                if last_line != Some(line) {
                    let source = program.source_line(line).unwrap_or("");
                    let _ = writeln!(out, "  {:3} -- {}", line, source);
                    last_line = Some(line);
                }
            }
            match disasm_one(program, pc) {
                Some((text, size)) => {
                    let _ = writeln!(out, "{:04} {}", pc, text);
                    pc += size as u32;
                }
                None => {
                    let _ = writeln!(out, "{:04} ??", pc);
                    break;
                }
            }
        }
        let _ = writeln!(out);
    }
    out
}

/// Render a single instruction. Returns the text and its encoded size, or
/// `None` on an invalid opcode byte.
pub fn disasm_one(program: &Program, pc: u32) -> Option<(String, usize)> {
    let code = program.code();
    let op = Opcode::from_byte(*code.get(pc as usize)?)?;
    let mut operands = Vec::new();
    let mut at = pc as usize + 1;
    for _ in 0..op.operand_count() {
        let bytes: [u8; 4] = code.get(at..at + 4)?.try_into().ok()?;
        operands.push(i32::from_le_bytes(bytes));
        at += 4;
    }
    let text = match (op, operands.as_slice()) {
        (Opcode::NewStr, [index]) => {
            let s = program.string(*index as u32).unwrap_or("?");
            format!("{:<10} {} ; \"{}\"", op.mnemonic(), index, s)
        }
        (Opcode::NewFlt, [bits]) => {
            let val = f32::from_bits(*bits as u32);
            format!("{:<10} {}", op.mnemonic(), val)
        }
        (Opcode::Call, [nargs, target]) => {
            // name the callee when the target pc falls inside a function
            match program.function_at(*target as u32) {
                Some(f) => format!("{:<10} {} {} ; {}", op.mnemonic(), nargs, target, f.name),
                None => format!("{:<10} {} {}", op.mnemonic(), nargs, target),
            }
        }
        (Opcode::Scall, [nargs, index]) => {
            match program.syscalls().get(*index as usize) {
                Some(s) => format!("{:<10} {} {} ; {}", op.mnemonic(), nargs, index, s.name),
                None => format!("{:<10} {} {}", op.mnemonic(), nargs, index),
            }
        }
        (_, []) => op.mnemonic().to_string(),
        (_, [a]) => format!("{:<10} {}", op.mnemonic(), a),
        (_, [a, b]) => format!("{:<10} {} {}", op.mnemonic(), a, b),
        _ => op.mnemonic().to_string(),
    };
    Some((text, op.encoded_size()))
}
