use crate::error::{CompileError, CompileErrorKind};
use crate::frontend::token::{Token, TokenKind};
use crate::lang::ast::{Ast, Expr, ExprId, FuncDecl, Stmt, StmtId, TokId, VarDecl, VarKind};

/// Recursive-descent parser for flint.
///
/// Statements are newline terminated and parsed by dedicated methods;
/// expressions go through an explicit operator stack (shunting-yard style)
/// that builds AST nodes instead of emitting code directly.
///
/// Precedence, higher binds tighter:
/// `or`/`and` (1), `not` (2), comparisons (3), `+`/`-` (4), `*`/`/`/`%` (5),
/// unary `-` (6). `not` sits below the comparison layer on purpose, so that
/// `not a == b` reads as `not (a == b)` while `not a and b` still reads as
/// `(not a) and b`.
pub struct Parser {
    ast: Ast,
    pos: usize,
    ops: Vec<OpEntry>,
    out: Vec<ExprId>,
}

#[derive(Clone, Copy)]
struct OpEntry {
    tok: TokId,
    prec: u32,
    unary: bool,
}

fn binary_prec(kind: &TokenKind) -> u32 {
    match kind {
        TokenKind::And | TokenKind::Or => 1,
        TokenKind::Eq | TokenKind::Lt | TokenKind::Gt | TokenKind::Leq | TokenKind::Geq => 3,
        TokenKind::Add | TokenKind::Sub => 4,
        TokenKind::Mul | TokenKind::Div | TokenKind::Mod => 5,
        // not an operator
        _ => 0,
    }
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            ast: Ast::new(tokens),
            pos: 0,
            ops: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Parse a whole program: a sequence of global `var` declarations and
    /// `function` declarations separated by newlines.
    pub fn parse(mut self) -> Result<Ast, CompileError> {
        loop {
            if self.found(&TokenKind::Eof).is_some() {
                break;
            }
            if self.found(&TokenKind::Eol).is_some() {
                continue;
            }
            if self.found(&TokenKind::Var).is_some() {
                self.parse_global()?;
                continue;
            }
            if self.found(&TokenKind::Function).is_some() {
                self.parse_function()?;
                continue;
            }
            return Err(self.error(CompileErrorKind::UnexpectedToken {
                got: self.current_text(),
                expected: None,
            }));
        }
        Ok(self.ast)
    }

    // -------------------------------------------------------------------------
    // token stream helpers
    // -------------------------------------------------------------------------

    fn current(&self) -> &Token {
        // the lexer guarantees a trailing Eof token
        &self.ast.tokens[self.pos.min(self.ast.tokens.len() - 1)]
    }

    fn current_text(&self) -> String {
        self.current().kind.to_string()
    }

    fn current_line(&self) -> u32 {
        self.current().line
    }

    fn error(&self, kind: CompileErrorKind) -> CompileError {
        CompileError::new(kind, self.current_line())
    }

    fn advance(&mut self) -> TokId {
        let id = TokId(self.pos as u32);
        if self.pos + 1 < self.ast.tokens.len() {
            self.pos += 1;
        }
        id
    }

    /// Consume and return the current token if it matches `kind`
    /// (payload-carrying kinds match on the kind alone).
    fn found(&mut self, kind: &TokenKind) -> Option<TokId> {
        if std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    /// Consume a token of the given kind or fail with `UnexpectedToken`.
    fn pop(&mut self, kind: &TokenKind) -> Result<TokId, CompileError> {
        self.found(kind).ok_or_else(|| {
            self.error(CompileErrorKind::UnexpectedToken {
                got: self.current_text(),
                expected: Some(kind.name()),
            })
        })
    }

    fn pop_ident(&mut self) -> Result<(TokId, String), CompileError> {
        if let TokenKind::Ident(name) = &self.current().kind {
            let name = name.clone();
            Ok((self.advance(), name))
        } else {
            Err(self.error(CompileErrorKind::UnexpectedToken {
                got: self.current_text(),
                expected: Some("identifier"),
            }))
        }
    }

    /// Append a synthesized token (used by desugaring); the parse position
    /// is unaffected.
    fn synth_token(&mut self, kind: TokenKind, line: u32) -> TokId {
        self.ast.tokens.push(Token::new(kind, line));
        TokId(self.ast.tokens.len() as u32 - 1)
    }

    fn pop_int(&mut self) -> Result<(TokId, i32), CompileError> {
        if let TokenKind::Int(val) = self.current().kind {
            Ok((self.advance(), val))
        } else {
            Err(self.error(CompileErrorKind::UnexpectedToken {
                got: self.current_text(),
                expected: Some("value"),
            }))
        }
    }

    // -------------------------------------------------------------------------
    // expressions
    // -------------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<ExprId, CompileError> {
        let tide = self.ops.len();
        loop {
            self.parse_operand()?;
            let prec = binary_prec(&self.current().kind);
            if prec == 0 {
                break;
            }
            let tok = self.advance();
            self.op_push(tok, prec, tide);
        }
        self.op_pop_all(tide);
        Ok(self.out.pop().expect("expression leaves one node"))
    }

    /// Parse any unary prefix chain followed by a primary, pushing the
    /// primary onto the output stack and the unaries onto the op stack.
    fn parse_operand(&mut self) -> Result<(), CompileError> {
        loop {
            if let Some(tok) = self.found(&TokenKind::Not) {
                self.ops.push(OpEntry {
                    tok,
                    prec: 2,
                    unary: true,
                });
            } else if let Some(tok) = self.found(&TokenKind::Sub) {
                self.ops.push(OpEntry {
                    tok,
                    prec: 6,
                    unary: true,
                });
            } else {
                break;
            }
        }
        let primary = self.parse_primary()?;
        self.out.push(primary);
        Ok(())
    }

    fn parse_primary(&mut self) -> Result<ExprId, CompileError> {
        if self.found(&TokenKind::LParen).is_some() {
            let inner = self.parse_expr()?;
            self.pop(&TokenKind::RParen)?;
            return Ok(inner);
        }
        if let TokenKind::Ident(_) = &self.current().kind {
            let (tok, name) = self.pop_ident()?;
            if self.found(&TokenKind::LParen).is_some() {
                let args = self.parse_call_args()?;
                return Ok(self.ast.add_expr(Expr::Call {
                    name,
                    tok,
                    args,
                    target: None,
                }));
            }
            if self.found(&TokenKind::LBracket).is_some() {
                let index = self.parse_expr()?;
                self.pop(&TokenKind::RBracket)?;
                return Ok(self.ast.add_expr(Expr::Index {
                    name,
                    tok,
                    index,
                    decl: None,
                }));
            }
            return Ok(self.ast.add_expr(Expr::Ident {
                name,
                tok,
                binding: None,
            }));
        }
        match self.current().kind.clone() {
            TokenKind::Int(val) => {
                let tok = self.advance();
                Ok(self.ast.add_expr(Expr::Int { val, tok }))
            }
            TokenKind::Float(val) => {
                let tok = self.advance();
                Ok(self.ast.add_expr(Expr::Float { val, tok }))
            }
            TokenKind::Str(val) => {
                let tok = self.advance();
                Ok(self.ast.add_expr(Expr::Str { val, tok }))
            }
            TokenKind::None => {
                let tok = self.advance();
                Ok(self.ast.add_expr(Expr::None { tok }))
            }
            _ => Err(self.error(CompileErrorKind::ExpectingLitOrIdent {
                got: self.current_text(),
            })),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<ExprId>, CompileError> {
        let mut args = Vec::new();
        if self.found(&TokenKind::RParen).is_some() {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.found(&TokenKind::Comma).is_none() {
                break;
            }
        }
        self.pop(&TokenKind::RParen)?;
        Ok(args)
    }

    /// Push a binary operator, first popping anything on the stack that
    /// binds at least as tightly (operators are left associative).
    fn op_push(&mut self, tok: TokId, prec: u32, tide: usize) {
        while self.ops.len() > tide {
            let top = *self.ops.last().expect("stack is non-empty");
            if top.prec >= prec {
                self.op_apply(top);
                self.ops.pop();
            } else {
                break;
            }
        }
        self.ops.push(OpEntry {
            tok,
            prec,
            unary: false,
        });
    }

    fn op_pop_all(&mut self, tide: usize) {
        while self.ops.len() > tide {
            let top = *self.ops.last().expect("stack is non-empty");
            self.op_apply(top);
            self.ops.pop();
        }
    }

    fn op_apply(&mut self, op: OpEntry) {
        if op.unary {
            let child = self.out.pop().expect("operand for unary operator");
            let id = self.ast.add_expr(Expr::Unary { tok: op.tok, child });
            self.out.push(id);
        } else {
            let rhs = self.out.pop().expect("rhs for binary operator");
            let lhs = self.out.pop().expect("lhs for binary operator");
            let id = self.ast.add_expr(Expr::Binary {
                tok: op.tok,
                lhs,
                rhs,
            });
            self.out.push(id);
        }
    }

    // -------------------------------------------------------------------------
    // statements
    // -------------------------------------------------------------------------

    fn parse_stmt(&mut self) -> Result<StmtId, CompileError> {
        let stmt = if self.found(&TokenKind::Var).is_some() {
            self.parse_local_decl()?
        } else if self.at(&TokenKind::Ident(String::new())) {
            let (tok, name) = self.pop_ident()?;
            if self.found(&TokenKind::Assign).is_some() {
                let expr = self.parse_expr()?;
                self.ast.add_stmt(Stmt::AssignVar {
                    name,
                    tok,
                    expr,
                    decl: None,
                })
            } else if self.found(&TokenKind::AddAssign).is_some() {
                // x += e desugars to x = x + e, through a synthetic + token
                let line = self.ast.line_of(tok);
                let plus = self.synth_token(TokenKind::Add, line);
                let rhs = self.parse_expr()?;
                let lhs = self.ast.add_expr(Expr::Ident {
                    name: name.clone(),
                    tok,
                    binding: None,
                });
                let sum = self.ast.add_expr(Expr::Binary {
                    tok: plus,
                    lhs,
                    rhs,
                });
                self.ast.add_stmt(Stmt::AssignVar {
                    name,
                    tok,
                    expr: sum,
                    decl: None,
                })
            } else if self.found(&TokenKind::LBracket).is_some() {
                let index = self.parse_expr()?;
                self.pop(&TokenKind::RBracket)?;
                self.pop(&TokenKind::Assign)?;
                let expr = self.parse_expr()?;
                self.ast.add_stmt(Stmt::AssignIndex {
                    name,
                    tok,
                    index,
                    expr,
                    decl: None,
                })
            } else if self.found(&TokenKind::LParen).is_some() {
                let args = self.parse_call_args()?;
                let call = self.ast.add_expr(Expr::Call {
                    name,
                    tok,
                    args,
                    target: None,
                });
                self.ast.add_stmt(Stmt::Call(call))
            } else {
                return Err(self.error(CompileErrorKind::AssignOrCallExpected {
                    after: name,
                }));
            }
        } else if let Some(tok) = self.found(&TokenKind::If) {
            return self.parse_if(tok);
        } else if let Some(tok) = self.found(&TokenKind::While) {
            return self.parse_while(tok);
        } else if let Some(tok) = self.found(&TokenKind::Return) {
            let expr = self.parse_expr()?;
            self.ast.add_stmt(Stmt::Return { tok, expr })
        } else {
            return Err(self.error(CompileErrorKind::StatementExpected));
        };
        // every simple statement sits on its own line
        self.pop(&TokenKind::Eol)?;
        Ok(stmt)
    }

    fn parse_local_decl(&mut self) -> Result<StmtId, CompileError> {
        let (tok, name) = self.pop_ident()?;
        let mut size = None;
        let mut init = None;
        if self.found(&TokenKind::LBracket).is_some() {
            let (_, n) = self.pop_int()?;
            self.pop(&TokenKind::RBracket)?;
            size = Some(n);
        } else if self.found(&TokenKind::Assign).is_some() {
            init = Some(self.parse_expr()?);
        }
        let var = self.ast.add_var(VarDecl {
            name,
            tok,
            kind: VarKind::Local,
            size,
            init,
        });
        Ok(self.ast.add_stmt(Stmt::Decl(var)))
    }

    fn parse_if(&mut self, tok: TokId) -> Result<StmtId, CompileError> {
        self.pop(&TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.pop(&TokenKind::RParen)?;
        self.pop(&TokenKind::Eol)?;

        let mut then_block = Vec::new();
        let mut else_block = Vec::new();
        let mut has_else = false;
        loop {
            if self.found(&TokenKind::Eol).is_some() {
                continue;
            }
            if self.found(&TokenKind::End).is_some() {
                break;
            }
            if self.found(&TokenKind::Else).is_some() {
                self.pop(&TokenKind::Eol)?;
                has_else = true;
                break;
            }
            then_block.push(self.parse_stmt()?);
        }
        if has_else {
            loop {
                if self.found(&TokenKind::Eol).is_some() {
                    continue;
                }
                if self.found(&TokenKind::End).is_some() {
                    break;
                }
                else_block.push(self.parse_stmt()?);
            }
        }
        self.pop(&TokenKind::Eol)?;
        Ok(self.ast.add_stmt(Stmt::If {
            tok,
            cond,
            then_block,
            else_block,
        }))
    }

    fn parse_while(&mut self, tok: TokId) -> Result<StmtId, CompileError> {
        self.pop(&TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.pop(&TokenKind::RParen)?;
        self.pop(&TokenKind::Eol)?;

        let mut body = Vec::new();
        loop {
            if self.found(&TokenKind::Eol).is_some() {
                continue;
            }
            if self.found(&TokenKind::End).is_some() {
                break;
            }
            body.push(self.parse_stmt()?);
        }
        self.pop(&TokenKind::Eol)?;
        Ok(self.ast.add_stmt(Stmt::While { tok, cond, body }))
    }

    // -------------------------------------------------------------------------
    // declarations
    // -------------------------------------------------------------------------

    fn parse_function(&mut self) -> Result<(), CompileError> {
        let (tok, name) = self.pop_ident()?;

        self.pop(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if self.found(&TokenKind::RParen).is_none() {
            loop {
                let (arg_tok, arg_name) = self.pop_ident()?;
                args.push(self.ast.add_var(VarDecl {
                    name: arg_name,
                    tok: arg_tok,
                    kind: VarKind::Arg,
                    size: None,
                    init: None,
                }));
                if self.found(&TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.pop(&TokenKind::RParen)?;
        }
        self.pop(&TokenKind::Eol)?;

        let mut body = Vec::new();
        loop {
            if self.found(&TokenKind::Eol).is_some() {
                continue;
            }
            if self.found(&TokenKind::End).is_some() {
                break;
            }
            body.push(self.parse_stmt()?);
        }
        self.pop(&TokenKind::Eol)?;

        let func = self.ast.add_func(FuncDecl {
            name,
            tok,
            args,
            body,
        });
        self.ast.functions.push(func);
        Ok(())
    }

    fn parse_global(&mut self) -> Result<(), CompileError> {
        let (tok, name) = self.pop_ident()?;
        let mut size = None;
        let mut init = None;
        if self.found(&TokenKind::LBracket).is_some() {
            let (_, n) = self.pop_int()?;
            self.pop(&TokenKind::RBracket)?;
            size = Some(n);
        } else if self.found(&TokenKind::Assign).is_some() {
            if let Some(open) = self.found(&TokenKind::LBracket) {
                init = Some(self.parse_array_init(open)?);
            } else {
                init = Some(self.parse_expr()?);
            }
        }
        self.pop(&TokenKind::Eol)?;
        let var = self.ast.add_var(VarDecl {
            name,
            tok,
            kind: VarKind::Global,
            size,
            init,
        });
        self.ast.globals.push(var);
        Ok(())
    }

    fn parse_array_init(&mut self, open: TokId) -> Result<ExprId, CompileError> {
        let mut items = Vec::new();
        if self.found(&TokenKind::RBracket).is_none() {
            loop {
                items.push(self.parse_expr()?);
                if self.found(&TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.pop(&TokenKind::RBracket)?;
        }
        Ok(self.ast.add_expr(Expr::ArrayInit { tok: open, items }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(source: &str) -> Ast {
        let (tokens, _) = Lexer::new(source).tokenize().expect("lex");
        Parser::new(tokens).parse().expect("parse")
    }

    fn parse_err(source: &str) -> CompileError {
        let (tokens, _) = Lexer::new(source).tokenize().expect("lex");
        Parser::new(tokens).parse().unwrap_err()
    }

    /// Return the single expression of `function main() return <src> end`.
    fn parse_ret_expr(expr: &str) -> (Ast, ExprId) {
        let ast = parse(&format!("function main()\nreturn {}\nend\n", expr));
        let func = ast.func(ast.functions[0]);
        match ast.stmt(func.body[0]) {
            Stmt::Return { expr, .. } => {
                let id = *expr;
                (ast, id)
            }
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn test_mul_binds_tighter_than_add() {
        let (ast, root) = parse_ret_expr("a + b * c");
        // expect (a + (b * c))
        match ast.expr(root) {
            Expr::Binary { tok, lhs, rhs } => {
                assert_eq!(ast.token_kind(*tok), &TokenKind::Add);
                assert!(matches!(ast.expr(*lhs), Expr::Ident { name, .. } if name == "a"));
                match ast.expr(*rhs) {
                    Expr::Binary { tok, .. } => {
                        assert_eq!(ast.token_kind(*tok), &TokenKind::Mul)
                    }
                    other => panic!("expected mul on rhs, got {:?}", other),
                }
            }
            other => panic!("expected binary add, got {:?}", other),
        }
    }

    #[test]
    fn test_left_associativity() {
        let (ast, root) = parse_ret_expr("a - b - c");
        // expect ((a - b) - c)
        match ast.expr(root) {
            Expr::Binary { lhs, rhs, .. } => {
                assert!(matches!(ast.expr(*lhs), Expr::Binary { .. }));
                assert!(matches!(ast.expr(*rhs), Expr::Ident { name, .. } if name == "c"));
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_not_sits_below_comparison() {
        let (ast, root) = parse_ret_expr("not a == b");
        // expect not (a == b)
        match ast.expr(root) {
            Expr::Unary { tok, child } => {
                assert_eq!(ast.token_kind(*tok), &TokenKind::Not);
                match ast.expr(*child) {
                    Expr::Binary { tok, .. } => assert_eq!(ast.token_kind(*tok), &TokenKind::Eq),
                    other => panic!("expected comparison under not, got {:?}", other),
                }
            }
            other => panic!("expected unary not, got {:?}", other),
        }
    }

    #[test]
    fn test_not_sits_above_and() {
        let (ast, root) = parse_ret_expr("not a and b");
        // expect (not a) and b
        match ast.expr(root) {
            Expr::Binary { tok, lhs, .. } => {
                assert_eq!(ast.token_kind(*tok), &TokenKind::And);
                assert!(matches!(ast.expr(*lhs), Expr::Unary { .. }));
            }
            other => panic!("expected binary and, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_minus_on_primary() {
        let (ast, root) = parse_ret_expr("-a * b");
        // expect (-a) * b
        match ast.expr(root) {
            Expr::Binary { tok, lhs, .. } => {
                assert_eq!(ast.token_kind(*tok), &TokenKind::Mul);
                assert!(matches!(ast.expr(*lhs), Expr::Unary { .. }));
            }
            other => panic!("expected binary mul, got {:?}", other),
        }
    }

    #[test]
    fn test_parens_override_precedence() {
        let (ast, root) = parse_ret_expr("(a + b) * c");
        match ast.expr(root) {
            Expr::Binary { tok, lhs, .. } => {
                assert_eq!(ast.token_kind(*tok), &TokenKind::Mul);
                assert!(matches!(ast.expr(*lhs), Expr::Binary { .. }));
            }
            other => panic!("expected binary mul, got {:?}", other),
        }
    }

    #[test]
    fn test_add_assign_desugars() {
        let ast = parse("function main()\nx += 1\nend\n");
        let func = ast.func(ast.functions[0]);
        match ast.stmt(func.body[0]) {
            Stmt::AssignVar { name, expr, .. } => {
                assert_eq!(name, "x");
                match ast.expr(*expr) {
                    Expr::Binary { lhs, rhs, .. } => {
                        assert!(matches!(ast.expr(*lhs), Expr::Ident { name, .. } if name == "x"));
                        assert!(matches!(ast.expr(*rhs), Expr::Int { val: 1, .. }));
                    }
                    other => panic!("expected binary, got {:?}", other),
                }
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_if_else_blocks() {
        let ast = parse("function main()\nif (1)\nreturn 1\nelse\nreturn 2\nend\nreturn 0\nend\n");
        let func = ast.func(ast.functions[0]);
        assert_eq!(func.body.len(), 2);
        match ast.stmt(func.body[0]) {
            Stmt::If {
                then_block,
                else_block,
                ..
            } => {
                assert_eq!(then_block.len(), 1);
                assert_eq!(else_block.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_global_forms() {
        let ast = parse("var a\nvar b = 2\nvar c[4]\nvar d = [1, 2, 3]\n");
        assert_eq!(ast.globals.len(), 4);
        assert!(ast.var(ast.globals[0]).init.is_none());
        assert!(ast.var(ast.globals[1]).init.is_some());
        assert_eq!(ast.var(ast.globals[2]).size, Some(4));
        match ast.expr(ast.var(ast.globals[3]).init.unwrap()) {
            Expr::ArrayInit { items, .. } => assert_eq!(items.len(), 3),
            other => panic!("expected array literal, got {:?}", other),
        }
    }

    #[test]
    fn test_statement_expected() {
        let err = parse_err("function main()\n)\nend\n");
        assert_eq!(err.kind, CompileErrorKind::StatementExpected);
    }

    #[test]
    fn test_assign_or_call_expected() {
        let err = parse_err("function main()\nx 1\nend\n");
        assert!(matches!(
            err.kind,
            CompileErrorKind::AssignOrCallExpected { .. }
        ));
    }

    #[test]
    fn test_expecting_lit_or_ident() {
        let err = parse_err("function main()\nreturn *\nend\n");
        assert!(matches!(
            err.kind,
            CompileErrorKind::ExpectingLitOrIdent { .. }
        ));
    }

    #[test]
    fn test_call_with_args() {
        let (ast, root) = parse_ret_expr("f(1, g(2), 3)");
        match ast.expr(root) {
            Expr::Call { name, args, .. } => {
                assert_eq!(name, "f");
                assert_eq!(args.len(), 3);
                assert!(matches!(ast.expr(args[1]), Expr::Call { .. }));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }
}
