use crate::bytecode::program::SyscallEntry;
use crate::error::{CompileError, CompileErrorKind};
use crate::frontend::token::TokenKind;
use crate::lang::ast::{Ast, Binding, Expr, ExprId, FuncDecl, FuncId, Stmt, StmtId, TokId, VarId};

/// Run the semantic pass pipeline. Passes run in order and the first error
/// aborts the pipeline, so later passes can rely on the earlier ones.
///
/// 1. fold global initializers to literals
/// 2. resolve every name to its declaration
/// 3. reject duplicate declarations
/// 4. check user-function call arity
/// 5. check declared array sizes
/// 6. synthesize the `@init` function that assigns global initializers
pub fn run(ast: &mut Ast, syscalls: &[SyscallEntry]) -> Result<(), CompileError> {
    fold_globals(ast)?;
    annotate_decls(ast, syscalls)?;
    check_duplicates(ast)?;
    check_arity(ast)?;
    check_array_sizes(ast)?;
    synthesize_init(ast);
    Ok(())
}

// =============================================================================
// pass 1: global initializer constant folding
// =============================================================================

fn fold_globals(ast: &mut Ast) -> Result<(), CompileError> {
    for i in 0..ast.globals.len() {
        let gid = ast.globals[i];
        let Some(init) = ast.var(gid).init else {
            continue;
        };
        let name = ast.var(gid).name.clone();
        match ast.expr(init) {
            Expr::Int { .. } | Expr::Float { .. } | Expr::Str { .. } => {}
            Expr::None { .. } => {
                // `var x = none` is the same as no initializer
                ast.var_mut(gid).init = None;
            }
            Expr::ArrayInit { items, .. } => {
                let items = items.clone();
                for item in items {
                    fold_array_item(ast, item, &name)?;
                }
            }
            Expr::Binary { .. } | Expr::Unary { .. } => {
                let tok = ast.expr(init).tok();
                let val = eval_const(ast, init, &name)?;
                let folded = ast.add_expr(Expr::Int { val, tok });
                ast.var_mut(gid).init = Some(folded);
            }
            _ => {
                let line = ast.line_of(ast.expr(init).tok());
                return Err(CompileError::new(
                    CompileErrorKind::GlobalVarConstExpr(name),
                    line,
                ));
            }
        }
    }
    Ok(())
}

fn fold_array_item(ast: &mut Ast, item: ExprId, name: &str) -> Result<(), CompileError> {
    match ast.expr(item) {
        Expr::Int { .. } | Expr::Float { .. } | Expr::Str { .. } | Expr::None { .. } => Ok(()),
        Expr::Binary { .. } | Expr::Unary { .. } => {
            let tok = ast.expr(item).tok();
            let val = eval_const(ast, item, name)?;
            *ast.expr_mut(item) = Expr::Int { val, tok };
            Ok(())
        }
        other => {
            let line = ast.line_of(other.tok());
            Err(CompileError::new(
                CompileErrorKind::BadArrayInitValue(name.to_string()),
                line,
            ))
        }
    }
}

/// Evaluate an integer constant expression: literals, unary minus and the
/// binary operators. Anything else rejects the global initializer.
fn eval_const(ast: &Ast, id: ExprId, name: &str) -> Result<i32, CompileError> {
    match ast.expr(id) {
        Expr::Int { val, .. } => Ok(*val),
        Expr::Unary { tok, child } => {
            let v = eval_const(ast, *child, name)?;
            match ast.token_kind(*tok) {
                TokenKind::Sub => Ok(v.wrapping_neg()),
                _ => Err(CompileError::new(
                    CompileErrorKind::GlobalVarConstExpr(name.to_string()),
                    ast.line_of(*tok),
                )),
            }
        }
        Expr::Binary { tok, lhs, rhs } => {
            let a = eval_const(ast, *lhs, name)?;
            let b = eval_const(ast, *rhs, name)?;
            let line = ast.line_of(*tok);
            let kind = ast.token_kind(*tok);
            if b == 0 && matches!(kind, TokenKind::Div | TokenKind::Mod) {
                return Err(CompileError::new(
                    CompileErrorKind::ConstantDivideByZero,
                    line,
                ));
            }
            Ok(match kind {
                TokenKind::Add => a.wrapping_add(b),
                TokenKind::Sub => a.wrapping_sub(b),
                TokenKind::Mul => a.wrapping_mul(b),
                TokenKind::Div => a.wrapping_div(b),
                TokenKind::Mod => a.wrapping_rem(b),
                TokenKind::And => (a != 0 && b != 0) as i32,
                TokenKind::Or => (a != 0 || b != 0) as i32,
                TokenKind::Eq => (a == b) as i32,
                TokenKind::Lt => (a < b) as i32,
                TokenKind::Gt => (a > b) as i32,
                TokenKind::Leq => (a <= b) as i32,
                TokenKind::Geq => (a >= b) as i32,
                _ => {
                    return Err(CompileError::new(
                        CompileErrorKind::GlobalVarConstExpr(name.to_string()),
                        line,
                    ))
                }
            })
        }
        other => Err(CompileError::new(
            CompileErrorKind::GlobalVarConstExpr(name.to_string()),
            ast.line_of(other.tok()),
        )),
    }
}

// =============================================================================
// pass 2: declaration annotation
// =============================================================================
//
// Builds a lexical scope stack and attaches a resolved binding to every
// identifier, subscript, call and assignment. `if`/`while` blocks open real
// scopes: a `var` declared inside one is not visible after `end`.

#[derive(Clone, Copy)]
enum ScopeEntry {
    Var(VarId),
    Func(FuncId),
}

struct Annotator<'a> {
    syscalls: &'a [SyscallEntry],
    scopes: Vec<Vec<ScopeEntry>>,
}

fn annotate_decls(ast: &mut Ast, syscalls: &[SyscallEntry]) -> Result<(), CompileError> {
    let mut pass = Annotator {
        syscalls,
        scopes: Vec::new(),
    };
    // the outermost scope holds every global and every function, so
    // forward references between functions resolve
    let mut top = Vec::new();
    for &gid in &ast.globals {
        top.push(ScopeEntry::Var(gid));
    }
    for &fid in &ast.functions {
        top.push(ScopeEntry::Func(fid));
    }
    pass.scopes.push(top);

    for i in 0..ast.functions.len() {
        let fid = ast.functions[i];
        pass.scopes.push(Vec::new());
        for &arg in &ast.func(fid).args.clone() {
            pass.scopes.last_mut().expect("scope").push(ScopeEntry::Var(arg));
        }
        let body = ast.func(fid).body.clone();
        for sid in body {
            pass.visit_stmt(ast, sid)?;
        }
        pass.scopes.pop();
    }
    Ok(())
}

impl<'a> Annotator<'a> {
    fn find(&self, ast: &Ast, name: &str) -> Option<ScopeEntry> {
        for scope in self.scopes.iter().rev() {
            for entry in scope.iter().rev() {
                let found = match entry {
                    ScopeEntry::Var(v) => ast.var(*v).name == name,
                    ScopeEntry::Func(f) => ast.func(*f).name == name,
                };
                if found {
                    return Some(*entry);
                }
            }
        }
        None
    }

    fn find_syscall(&self, name: &str) -> Option<u32> {
        self.syscalls
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32)
    }

    fn err(&self, ast: &Ast, tok: TokId, kind: CompileErrorKind) -> CompileError {
        CompileError::new(kind, ast.line_of(tok))
    }

    fn visit_stmt(&mut self, ast: &mut Ast, sid: StmtId) -> Result<(), CompileError> {
        match ast.stmt(sid).clone() {
            Stmt::Decl(vid) => {
                // resolve the initializer before the name becomes visible,
                // so `var x = x` cannot resolve to itself
                if let Some(init) = ast.var(vid).init {
                    self.visit_expr(ast, init)?;
                }
                self.scopes.last_mut().expect("scope").push(ScopeEntry::Var(vid));
                Ok(())
            }
            Stmt::AssignVar { name, tok, expr, .. } => {
                self.visit_expr(ast, expr)?;
                match self.find(ast, &name) {
                    Some(ScopeEntry::Var(vid)) => {
                        if ast.var(vid).is_array() {
                            return Err(self.err(
                                ast,
                                tok,
                                CompileErrorKind::IdentIsArrayNotVar(name),
                            ));
                        }
                        if let Stmt::AssignVar { decl, .. } = ast.stmt_mut(sid) {
                            *decl = Some(vid);
                        }
                        Ok(())
                    }
                    _ => Err(self.err(ast, tok, CompileErrorKind::UnknownVariable(name))),
                }
            }
            Stmt::AssignIndex {
                name,
                tok,
                index,
                expr,
                ..
            } => {
                self.visit_expr(ast, index)?;
                self.visit_expr(ast, expr)?;
                match self.find(ast, &name) {
                    Some(ScopeEntry::Var(vid)) => {
                        if !ast.var(vid).is_array() {
                            return Err(self.err(
                                ast,
                                tok,
                                CompileErrorKind::VariableIsNotArray(name),
                            ));
                        }
                        if let Stmt::AssignIndex { decl, .. } = ast.stmt_mut(sid) {
                            *decl = Some(vid);
                        }
                        Ok(())
                    }
                    _ => Err(self.err(ast, tok, CompileErrorKind::UnknownArray(name))),
                }
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                self.visit_expr(ast, cond)?;
                self.scopes.push(Vec::new());
                for s in then_block {
                    self.visit_stmt(ast, s)?;
                }
                for s in else_block {
                    self.visit_stmt(ast, s)?;
                }
                self.scopes.pop();
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                self.visit_expr(ast, cond)?;
                self.scopes.push(Vec::new());
                for s in body {
                    self.visit_stmt(ast, s)?;
                }
                self.scopes.pop();
                Ok(())
            }
            Stmt::Return { expr, .. } => self.visit_expr(ast, expr),
            Stmt::Call(expr) => self.visit_expr(ast, expr),
        }
    }

    fn visit_expr(&mut self, ast: &mut Ast, eid: ExprId) -> Result<(), CompileError> {
        match ast.expr(eid).clone() {
            Expr::Ident { name, tok, .. } => {
                let binding = match self.find(ast, &name) {
                    Some(ScopeEntry::Var(vid)) => {
                        if ast.var(vid).is_array() {
                            return Err(self.err(
                                ast,
                                tok,
                                CompileErrorKind::ArrayRequiresSubscript(name),
                            ));
                        }
                        Binding::Var(vid)
                    }
                    // a bare function name is a first class function value
                    Some(ScopeEntry::Func(fid)) => Binding::Func(fid),
                    None => match self.find_syscall(&name) {
                        Some(idx) => Binding::Syscall(idx),
                        None => {
                            return Err(self.err(
                                ast,
                                tok,
                                CompileErrorKind::UnknownIdentifier(name),
                            ))
                        }
                    },
                };
                if let Expr::Ident { binding: b, .. } = ast.expr_mut(eid) {
                    *b = Some(binding);
                }
                Ok(())
            }
            Expr::Index { name, tok, index, .. } => {
                self.visit_expr(ast, index)?;
                match self.find(ast, &name) {
                    // subscripting a plain variable is allowed since the
                    // value may be a string; arrays are checked at runtime
                    Some(ScopeEntry::Var(vid)) => {
                        if let Expr::Index { decl, .. } = ast.expr_mut(eid) {
                            *decl = Some(vid);
                        }
                        Ok(())
                    }
                    Some(ScopeEntry::Func(_)) => {
                        Err(self.err(ast, tok, CompileErrorKind::ExpectedFuncCall(name)))
                    }
                    None => Err(self.err(ast, tok, CompileErrorKind::UnknownArray(name))),
                }
            }
            Expr::Call { name, tok, args, .. } => {
                for arg in args {
                    self.visit_expr(ast, arg)?;
                }
                let target = match self.find(ast, &name) {
                    Some(ScopeEntry::Func(fid)) => Binding::Func(fid),
                    // calling through a variable dispatches at runtime
                    Some(ScopeEntry::Var(vid)) => Binding::Var(vid),
                    None => match self.find_syscall(&name) {
                        Some(idx) => Binding::Syscall(idx),
                        None => {
                            return Err(self.err(
                                ast,
                                tok,
                                CompileErrorKind::UnknownFunction(name),
                            ))
                        }
                    },
                };
                if let Expr::Call { target: t, .. } = ast.expr_mut(eid) {
                    *t = Some(target);
                }
                Ok(())
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.visit_expr(ast, lhs)?;
                self.visit_expr(ast, rhs)
            }
            Expr::Unary { child, .. } => self.visit_expr(ast, child),
            Expr::ArrayInit { items, .. } => {
                for item in items {
                    self.visit_expr(ast, item)?;
                }
                Ok(())
            }
            Expr::Int { .. }
            | Expr::Float { .. }
            | Expr::Str { .. }
            | Expr::None { .. }
            | Expr::NewArray { .. } => Ok(()),
        }
    }
}

// =============================================================================
// pass 3: duplicate declarations
// =============================================================================

fn check_duplicates(ast: &Ast) -> Result<(), CompileError> {
    let mut scopes: Vec<Vec<String>> = vec![Vec::new()];

    let is_def = |scopes: &[Vec<String>], name: &str| -> bool {
        scopes.iter().any(|s| s.iter().any(|n| n == name))
    };

    for &gid in &ast.globals {
        let var = ast.var(gid);
        if is_def(&scopes, &var.name) {
            return Err(CompileError::new(
                CompileErrorKind::VarAlreadyExists(var.name.clone()),
                ast.line_of(var.tok),
            ));
        }
        scopes[0].push(var.name.clone());
    }
    for &fid in &ast.functions {
        let func = ast.func(fid);
        if is_def(&scopes, &func.name) {
            return Err(CompileError::new(
                CompileErrorKind::FunctionAlreadyExists(func.name.clone()),
                ast.line_of(func.tok),
            ));
        }
        scopes[0].push(func.name.clone());
    }

    fn walk_block(
        ast: &Ast,
        scopes: &mut Vec<Vec<String>>,
        block: &[StmtId],
    ) -> Result<(), CompileError> {
        let is_def = |scopes: &[Vec<String>], name: &str| -> bool {
            scopes.iter().any(|s| s.iter().any(|n| n == name))
        };
        for &sid in block {
            match ast.stmt(sid) {
                Stmt::Decl(vid) => {
                    let var = ast.var(*vid);
                    if is_def(scopes, &var.name) {
                        return Err(CompileError::new(
                            CompileErrorKind::VarAlreadyExists(var.name.clone()),
                            ast.line_of(var.tok),
                        ));
                    }
                    scopes.last_mut().expect("scope").push(var.name.clone());
                }
                Stmt::If {
                    then_block,
                    else_block,
                    ..
                } => {
                    scopes.push(Vec::new());
                    walk_block(ast, scopes, then_block)?;
                    walk_block(ast, scopes, else_block)?;
                    scopes.pop();
                }
                Stmt::While { body, .. } => {
                    scopes.push(Vec::new());
                    walk_block(ast, scopes, body)?;
                    scopes.pop();
                }
                _ => {}
            }
        }
        Ok(())
    }

    for &fid in &ast.functions {
        let func = ast.func(fid);
        scopes.push(Vec::new());
        for &arg in &func.args {
            let var = ast.var(arg);
            if is_def(&scopes, &var.name) {
                return Err(CompileError::new(
                    CompileErrorKind::VarAlreadyExists(var.name.clone()),
                    ast.line_of(var.tok),
                ));
            }
            scopes.last_mut().expect("scope").push(var.name.clone());
        }
        walk_block(ast, &mut scopes, &func.body)?;
        scopes.pop();
    }
    Ok(())
}

// =============================================================================
// pass 4: call arity
// =============================================================================

fn check_arity(ast: &Ast) -> Result<(), CompileError> {
    for expr in ast.exprs() {
        if let Expr::Call {
            name,
            tok,
            args,
            target: Some(Binding::Func(fid)),
        } = expr
        {
            let want = ast.func(*fid).args.len();
            if args.len() > want {
                return Err(CompileError::new(
                    CompileErrorKind::TooManyArgs(name.clone()),
                    ast.line_of(*tok),
                ));
            }
            if args.len() < want {
                return Err(CompileError::new(
                    CompileErrorKind::NotEnoughArgs(name.clone()),
                    ast.line_of(*tok),
                ));
            }
        }
    }
    Ok(())
}

// =============================================================================
// pass 5: array sizes
// =============================================================================

fn check_array_sizes(ast: &Ast) -> Result<(), CompileError> {
    for var in ast.vars() {
        if let Some(size) = var.size {
            if size <= 1 {
                return Err(CompileError::new(
                    CompileErrorKind::ArraySizeMustBeGreaterThan(var.name.clone()),
                    ast.line_of(var.tok),
                ));
            }
        }
    }
    Ok(())
}

// =============================================================================
// pass 6: @init synthesis
// =============================================================================
//
// `@init` assigns every global its initial value: sized arrays get a fresh
// allocation, folded scalars are stored directly, and array literals are
// built element wise. The VM runs it before any user entry point.

fn synthesize_init(ast: &mut Ast) {
    let tok = TokId(0);
    let mut body = Vec::new();
    for i in 0..ast.globals.len() {
        let gid = ast.globals[i];
        let (name, var_tok, size, init) = {
            let var = ast.var(gid);
            (var.name.clone(), var.tok, var.size, var.init)
        };
        let expr = if let Some(size) = size {
            Some(ast.add_expr(Expr::NewArray { tok: var_tok, size }))
        } else {
            init
        };
        if let Some(expr) = expr {
            body.push(ast.add_stmt(Stmt::AssignVar {
                name,
                tok: var_tok,
                expr,
                decl: Some(gid),
            }));
        }
    }
    let init = ast.add_func(FuncDecl {
        name: "@init".to_string(),
        tok,
        args: Vec::new(),
        body,
    });
    ast.functions.push(init);
}
