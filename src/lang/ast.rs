use crate::frontend::token::{Token, TokenKind};

// =============================================================================
// AST - arena allocated, index keyed
// =============================================================================
//
// Nodes never hold pointers to each other; every cross reference is a typed
// index into one of the arena vectors below. This keeps name resolution
// (use site -> declaration site) cycle free and lets semantic passes attach
// resolved bindings in place.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

/// Index of the token that produced a node, kept for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokId(pub u32);

/// What a name resolved to after the declaration annotation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Var(VarId),
    Func(FuncId),
    Syscall(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Global,
    Local,
    Arg,
}

/// A `var` declaration: global, local or function argument.
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    pub tok: TokId,
    pub kind: VarKind,
    /// Declared array size, for `var a[N]`.
    pub size: Option<i32>,
    /// Initializer expression. For globals this is folded to a literal by
    /// the semantic passes.
    pub init: Option<ExprId>,
}

impl VarDecl {
    pub fn is_array(&self) -> bool {
        self.size.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: String,
    pub tok: TokId,
    pub args: Vec<VarId>,
    pub body: Vec<StmtId>,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int {
        val: i32,
        tok: TokId,
    },
    Float {
        val: f32,
        tok: TokId,
    },
    Str {
        val: String,
        tok: TokId,
    },
    None {
        tok: TokId,
    },
    /// A plain identifier reference. `binding` is attached by sema; a
    /// function or syscall name here denotes a first class callable value.
    Ident {
        name: String,
        tok: TokId,
        binding: Option<Binding>,
    },
    /// `name[index]` element read. Subscripting a string is legal, so the
    /// declaration is not required to be an array.
    Index {
        name: String,
        tok: TokId,
        index: ExprId,
        decl: Option<VarId>,
    },
    /// `name(args...)`. The target is a user function, a registered
    /// syscall, or a variable holding a callable (indirect call).
    Call {
        name: String,
        tok: TokId,
        args: Vec<ExprId>,
        target: Option<Binding>,
    },
    Binary {
        tok: TokId,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        tok: TokId,
        child: ExprId,
    },
    /// `[ lit, lit, ... ]`, accepted as a global initializer only.
    ArrayInit {
        tok: TokId,
        items: Vec<ExprId>,
    },
    /// Allocation of a fresh array of `size` slots. Synthesized by the
    /// `@init` builder for sized array globals; never parsed.
    NewArray {
        tok: TokId,
        size: i32,
    },
}

impl Expr {
    pub fn tok(&self) -> TokId {
        match self {
            Expr::Int { tok, .. }
            | Expr::Float { tok, .. }
            | Expr::Str { tok, .. }
            | Expr::None { tok }
            | Expr::Ident { tok, .. }
            | Expr::Index { tok, .. }
            | Expr::Call { tok, .. }
            | Expr::Binary { tok, .. }
            | Expr::Unary { tok, .. }
            | Expr::ArrayInit { tok, .. }
            | Expr::NewArray { tok, .. } => *tok,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Decl(VarId),
    AssignVar {
        name: String,
        tok: TokId,
        expr: ExprId,
        decl: Option<VarId>,
    },
    AssignIndex {
        name: String,
        tok: TokId,
        index: ExprId,
        expr: ExprId,
        decl: Option<VarId>,
    },
    If {
        tok: TokId,
        cond: ExprId,
        then_block: Vec<StmtId>,
        else_block: Vec<StmtId>,
    },
    While {
        tok: TokId,
        cond: ExprId,
        body: Vec<StmtId>,
    },
    Return {
        tok: TokId,
        expr: ExprId,
    },
    /// A call in statement position; its result is discarded.
    Call(ExprId),
}

/// The whole parsed program: token storage plus the node arenas. The arena
/// outlives code generation and is dropped afterwards.
#[derive(Debug, Default)]
pub struct Ast {
    pub tokens: Vec<Token>,
    exprs: Vec<Expr>,
    stmts: Vec<Stmt>,
    vars: Vec<VarDecl>,
    funcs: Vec<FuncDecl>,
    /// Global declarations in source order.
    pub globals: Vec<VarId>,
    /// Function declarations in source order (`@init` appended last).
    pub functions: Vec<FuncId>,
}

impl Ast {
    pub fn new(tokens: Vec<Token>) -> Self {
        Ast {
            tokens,
            ..Default::default()
        }
    }

    pub fn add_expr(&mut self, expr: Expr) -> ExprId {
        self.exprs.push(expr);
        ExprId(self.exprs.len() as u32 - 1)
    }

    pub fn add_stmt(&mut self, stmt: Stmt) -> StmtId {
        self.stmts.push(stmt);
        StmtId(self.stmts.len() as u32 - 1)
    }

    pub fn add_var(&mut self, var: VarDecl) -> VarId {
        self.vars.push(var);
        VarId(self.vars.len() as u32 - 1)
    }

    pub fn add_func(&mut self, func: FuncDecl) -> FuncId {
        self.funcs.push(func);
        FuncId(self.funcs.len() as u32 - 1)
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id.0 as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    pub fn stmt_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id.0 as usize]
    }

    pub fn var(&self, id: VarId) -> &VarDecl {
        &self.vars[id.0 as usize]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut VarDecl {
        &mut self.vars[id.0 as usize]
    }

    pub fn func(&self, id: FuncId) -> &FuncDecl {
        &self.funcs[id.0 as usize]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut FuncDecl {
        &mut self.funcs[id.0 as usize]
    }

    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        self.exprs.iter()
    }

    pub fn vars(&self) -> impl Iterator<Item = &VarDecl> {
        self.vars.iter()
    }

    pub fn token(&self, id: TokId) -> &Token {
        &self.tokens[id.0 as usize]
    }

    pub fn token_kind(&self, id: TokId) -> &TokenKind {
        &self.tokens[id.0 as usize].kind
    }

    pub fn line_of(&self, id: TokId) -> u32 {
        self.tokens[id.0 as usize].line
    }
}
