use std::collections::HashMap;

use crate::bytecode::builder::ProgramBuilder;
use crate::bytecode::op::Opcode;
use crate::bytecode::program::{Function, Program, SyscallEntry};
use crate::error::CompileError;
use crate::frontend::token::TokenKind;
use crate::lang::ast::{Ast, Binding, Expr, ExprId, FuncId, Stmt, StmtId, VarId, VarKind};

/// Lower a resolved AST to bytecode.
///
/// Two sub-passes per the classic scheme: a stack layout pass that assigns
/// every argument and local a frame-relative slot, then an emit pass that
/// walks each function and appends instructions. Call and function-value
/// operands are recorded as fixups (byte indices) and patched once every
/// function's start PC is known.
pub fn generate(
    ast: &Ast,
    syscalls: &[SyscallEntry],
    source_lines: Vec<String>,
) -> Result<Program, CompileError> {
    let layout = Layout::build(ast);

    let mut emitter = Emitter {
        ast,
        layout: &layout,
        builder: ProgramBuilder::new(),
        fixups: Vec::new(),
        func_pcs: HashMap::new(),
    };
    emitter.builder.set_syscalls(syscalls.to_vec());
    emitter.builder.set_source_lines(source_lines);

    for &fid in &ast.functions {
        emitter.emit_function(fid)?;
    }

    // patch call and function-value operands now that targets are known
    for (at, fid) in std::mem::take(&mut emitter.fixups) {
        let pc = emitter.func_pcs[&fid];
        emitter.builder.apply_fixup(at, pc);
    }

    for (&gid, &slot) in &layout.global_slots {
        emitter.builder.add_global(&ast.var(gid).name, slot as u32);
    }

    Ok(emitter.builder.finish())
}

// =============================================================================
// stack layout pass
// =============================================================================

struct FrameInfo {
    num_args: i32,
    max_locals: i32,
}

struct Layout {
    /// Frame-relative slot for every argument and local.
    offsets: HashMap<VarId, i32>,
    /// Flat slot in the globals array for every global.
    global_slots: HashMap<VarId, i32>,
    frames: HashMap<FuncId, FrameInfo>,
    num_global_slots: i32,
}

impl Layout {
    fn build(ast: &Ast) -> Layout {
        let mut layout = Layout {
            offsets: HashMap::new(),
            global_slots: HashMap::new(),
            frames: HashMap::new(),
            num_global_slots: 0,
        };

        for &gid in &ast.globals {
            let slot = layout.num_global_slots;
            layout.global_slots.insert(gid, slot);
            layout.num_global_slots += 1;
        }

        for &fid in &ast.functions {
            let func = ast.func(fid);
            // arguments sit below the frame base at -N .. -1
            let num_args = func.args.len() as i32;
            let mut offset = -num_args;
            for &arg in &func.args {
                layout.offsets.insert(arg, offset);
                offset += 1;
            }
            // locals grow upward from the frame base; nested blocks reuse
            // the enclosing scope's high-water mark
            let mut cur = 0;
            let mut max = 0;
            layout.walk_block(ast, &func.body, &mut cur, &mut max);
            layout.frames.insert(
                fid,
                FrameInfo {
                    num_args,
                    max_locals: max,
                },
            );
        }
        layout
    }

    fn walk_block(&mut self, ast: &Ast, block: &[StmtId], cur: &mut i32, max: &mut i32) {
        for &sid in block {
            match ast.stmt(sid) {
                Stmt::Decl(vid) => {
                    self.offsets.insert(*vid, *cur);
                    *cur += 1;
                    *max = (*max).max(*cur);
                }
                Stmt::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    let save = *cur;
                    self.walk_block(ast, then_block, cur, max);
                    self.walk_block(ast, else_block, cur, max);
                    *cur = save;
                }
                Stmt::While { body, .. } => {
                    let save = *cur;
                    self.walk_block(ast, body, cur, max);
                    *cur = save;
                }
                _ => {}
            }
        }
    }

    fn frame_size(&self, fid: FuncId) -> i32 {
        let frame = &self.frames[&fid];
        frame.num_args + frame.max_locals
    }
}

// =============================================================================
// emit pass
// =============================================================================

struct Emitter<'a> {
    ast: &'a Ast,
    layout: &'a Layout,
    builder: ProgramBuilder,
    /// (operand byte index, target function) pairs patched after the pass.
    fixups: Vec<(u32, FuncId)>,
    func_pcs: HashMap<FuncId, i32>,
}

impl<'a> Emitter<'a> {
    fn emit_function(&mut self, fid: FuncId) -> Result<(), CompileError> {
        let func = self.ast.func(fid);
        let line = self.ast.line_of(func.tok);
        let start = self.builder.pos();
        self.func_pcs.insert(fid, start as i32);

        // @init owns sizing the globals array
        if func.name == "@init" {
            self.builder
                .emit1(Opcode::Globals, self.layout.num_global_slots, line)?;
        }
        let max_locals = self.layout.frames[&fid].max_locals;
        if max_locals > 0 {
            self.builder.emit1(Opcode::Locals, max_locals, line)?;
        }

        for &sid in &func.body {
            self.emit_stmt(sid, fid)?;
        }

        // fall-through epilogue returns zero
        let falls_through = !matches!(
            func.body.last().map(|&s| self.ast.stmt(s)),
            Some(Stmt::Return { .. })
        );
        if falls_through {
            self.builder.emit1(Opcode::NewInt, 0, line)?;
            self.builder
                .emit1(Opcode::Ret, self.layout.frame_size(fid), line)?;
        }

        self.builder.add_function(Function {
            name: func.name.clone(),
            num_args: func.args.len() as u32,
            code_start: start,
            code_end: self.builder.pos(),
        });
        Ok(())
    }

    fn emit_stmt(&mut self, sid: StmtId, fid: FuncId) -> Result<(), CompileError> {
        match self.ast.stmt(sid) {
            Stmt::Decl(vid) => {
                let var = self.ast.var(*vid);
                let line = self.ast.line_of(var.tok);
                let offset = self.layout.offsets[vid];
                if let Some(size) = var.size {
                    self.builder.emit1(Opcode::NewAry, size, line)?;
                } else if let Some(init) = var.init {
                    self.emit_expr(init)?;
                } else {
                    // explicit store so a reused slot never exposes a stale
                    // value from a sibling block
                    self.builder.emit(Opcode::NewNone, line)?;
                }
                self.builder.emit1(Opcode::Setv, offset, line)?;
                Ok(())
            }
            Stmt::AssignVar {
                tok, expr, decl, ..
            } => {
                let line = self.ast.line_of(*tok);
                let expr = *expr;
                let vid = decl.expect("assignment resolved by sema");
                self.emit_expr(expr)?;
                self.emit_store(vid, line)
            }
            Stmt::AssignIndex {
                tok,
                index,
                expr,
                decl,
                ..
            } => {
                let line = self.ast.line_of(*tok);
                let (index, expr) = (*index, *expr);
                let vid = decl.expect("assignment resolved by sema");
                self.emit_expr(expr)?;
                self.emit_expr(index)?;
                self.emit_load(vid, line)?;
                self.builder.emit(Opcode::Seta, line)
            }
            Stmt::If {
                tok,
                cond,
                then_block,
                else_block,
            } => {
                let line = self.ast.line_of(*tok);
                let (cond, then_block, else_block) =
                    (*cond, then_block.clone(), else_block.clone());
                self.emit_expr(cond)?;
                let to_else = self.builder.emit1(Opcode::Fjmp, 0, line)?;
                for sid in then_block {
                    self.emit_stmt(sid, fid)?;
                }
                if else_block.is_empty() {
                    self.builder.apply_fixup(to_else, self.builder.pos() as i32);
                    return Ok(());
                }
                let to_end = self.builder.emit1(Opcode::Jmp, 0, line)?;
                self.builder.apply_fixup(to_else, self.builder.pos() as i32);
                for sid in else_block {
                    self.emit_stmt(sid, fid)?;
                }
                self.builder.apply_fixup(to_end, self.builder.pos() as i32);
                Ok(())
            }
            Stmt::While { tok, cond, body } => {
                let line = self.ast.line_of(*tok);
                let (cond, body) = (*cond, body.clone());
                // jump straight to the condition; the body sits above it so
                // each iteration costs a single conditional branch
                let to_cond = self.builder.emit1(Opcode::Jmp, 0, line)?;
                let top = self.builder.pos();
                for sid in body {
                    self.emit_stmt(sid, fid)?;
                }
                self.builder.apply_fixup(to_cond, self.builder.pos() as i32);
                self.emit_expr(cond)?;
                self.builder.emit1(Opcode::Tjmp, top as i32, line)?;
                Ok(())
            }
            Stmt::Return { tok, expr } => {
                let line = self.ast.line_of(*tok);
                let expr = *expr;
                self.emit_expr(expr)?;
                self.builder
                    .emit1(Opcode::Ret, self.layout.frame_size(fid), line)?;
                Ok(())
            }
            Stmt::Call(expr) => {
                let expr = *expr;
                let line = self.ast.line_of(self.ast.expr(expr).tok());
                self.emit_expr(expr)?;
                // discard the unused return value
                self.builder.emit1(Opcode::Pop, 1, line)?;
                Ok(())
            }
        }
    }

    fn emit_expr(&mut self, eid: ExprId) -> Result<(), CompileError> {
        match self.ast.expr(eid) {
            Expr::Int { val, tok } => {
                let line = self.ast.line_of(*tok);
                self.builder.emit1(Opcode::NewInt, *val, line)?;
                Ok(())
            }
            Expr::Float { val, tok } => {
                let line = self.ast.line_of(*tok);
                // IEEE bits travel in the operand
                self.builder
                    .emit1(Opcode::NewFlt, val.to_bits() as i32, line)?;
                Ok(())
            }
            Expr::Str { val, tok } => {
                let line = self.ast.line_of(*tok);
                let index = self.builder.add_string(val);
                self.builder.emit1(Opcode::NewStr, index as i32, line)?;
                Ok(())
            }
            Expr::None { tok } => {
                let line = self.ast.line_of(*tok);
                self.builder.emit(Opcode::NewNone, line)
            }
            Expr::Ident { tok, binding, .. } => {
                let line = self.ast.line_of(*tok);
                match binding.expect("identifier resolved by sema") {
                    Binding::Var(vid) => self.emit_load(vid, line),
                    Binding::Func(target) => {
                        let at = self.builder.emit1(Opcode::NewFunc, 0, line)?;
                        self.fixups.push((at, target));
                        Ok(())
                    }
                    Binding::Syscall(index) => {
                        self.builder.emit1(Opcode::NewScall, index as i32, line)?;
                        Ok(())
                    }
                }
            }
            Expr::Index {
                tok, index, decl, ..
            } => {
                let line = self.ast.line_of(*tok);
                let index = *index;
                let vid = decl.expect("subscript resolved by sema");
                self.emit_expr(index)?;
                self.emit_load(vid, line)?;
                self.builder.emit(Opcode::Deref, line)
            }
            Expr::Call {
                tok, args, target, ..
            } => {
                let line = self.ast.line_of(*tok);
                let args = args.clone();
                let nargs = args.len() as i32;
                let target = target.expect("call resolved by sema");
                for arg in args {
                    self.emit_expr(arg)?;
                }
                match target {
                    Binding::Func(callee) => {
                        let at = self.builder.emit2(Opcode::Call, nargs, 0, line)?;
                        self.fixups.push((at, callee));
                        Ok(())
                    }
                    Binding::Syscall(index) => {
                        self.builder
                            .emit2(Opcode::Scall, nargs, index as i32, line)?;
                        Ok(())
                    }
                    Binding::Var(vid) => {
                        self.emit_load(vid, line)?;
                        self.builder.emit1(Opcode::Icall, nargs, line)?;
                        Ok(())
                    }
                }
            }
            Expr::Binary { tok, lhs, rhs } => {
                let line = self.ast.line_of(*tok);
                let (lhs, rhs) = (*lhs, *rhs);
                let op = match self.ast.token_kind(*tok) {
                    TokenKind::Add => Opcode::Add,
                    TokenKind::Sub => Opcode::Sub,
                    TokenKind::Mul => Opcode::Mul,
                    TokenKind::Div => Opcode::Div,
                    TokenKind::Mod => Opcode::Mod,
                    TokenKind::And => Opcode::And,
                    TokenKind::Or => Opcode::Or,
                    TokenKind::Eq => Opcode::Eq,
                    TokenKind::Lt => Opcode::Lt,
                    TokenKind::Gt => Opcode::Gt,
                    TokenKind::Leq => Opcode::Leq,
                    TokenKind::Geq => Opcode::Geq,
                    other => unreachable!("not a binary operator: {:?}", other),
                };
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.builder.emit(op, line)
            }
            Expr::Unary { tok, child } => {
                let line = self.ast.line_of(*tok);
                let child = *child;
                let op = match self.ast.token_kind(*tok) {
                    TokenKind::Sub => Opcode::Neg,
                    TokenKind::Not => Opcode::Not,
                    other => unreachable!("not a unary operator: {:?}", other),
                };
                self.emit_expr(child)?;
                self.builder.emit(op, line)
            }
            Expr::ArrayInit { tok, items } => {
                let line = self.ast.line_of(*tok);
                let items = items.clone();
                let count = items.len() as i32;
                for item in items {
                    self.emit_expr(item)?;
                }
                self.builder.emit1(Opcode::AryInit, count, line)?;
                Ok(())
            }
            Expr::NewArray { tok, size } => {
                let line = self.ast.line_of(*tok);
                self.builder.emit1(Opcode::NewAry, *size, line)?;
                Ok(())
            }
        }
    }

    fn emit_load(&mut self, vid: VarId, line: u32) -> Result<(), CompileError> {
        if self.ast.var(vid).kind == VarKind::Global {
            let slot = self.layout.global_slots[&vid];
            self.builder.emit1(Opcode::Getg, slot, line)?;
        } else {
            let offset = self.layout.offsets[&vid];
            self.builder.emit1(Opcode::Getv, offset, line)?;
        }
        Ok(())
    }

    fn emit_store(&mut self, vid: VarId, line: u32) -> Result<(), CompileError> {
        if self.ast.var(vid).kind == VarKind::Global {
            let slot = self.layout.global_slots[&vid];
            self.builder.emit1(Opcode::Setg, slot, line)?;
        } else {
            let offset = self.layout.offsets[&vid];
            self.builder.emit1(Opcode::Setv, offset, line)?;
        }
        Ok(())
    }
}
