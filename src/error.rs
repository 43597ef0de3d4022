/// A build-phase error: anything the lexer, parser, semantic passes or the
/// code generator can reject.
///
/// Every error carries the source line it was raised on. Phases return
/// `Result<_, CompileError>` and stop at the first failure, so downstream
/// phases never run on a broken input.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileErrorKind {
    // lexer
    UnexpectedCharacter(char),

    // parser
    UnexpectedToken {
        got: String,
        expected: Option<&'static str>,
    },
    ExpectingLitOrIdent {
        got: String,
    },
    AssignOrCallExpected {
        after: String,
    },
    StatementExpected,

    // semantic passes
    UnknownVariable(String),
    UnknownArray(String),
    UnknownFunction(String),
    UnknownIdentifier(String),
    VarAlreadyExists(String),
    FunctionAlreadyExists(String),
    IdentIsArrayNotVar(String),
    VariableIsNotArray(String),
    ArrayRequiresSubscript(String),
    ExpectedFuncCall(String),
    TooManyArgs(String),
    NotEnoughArgs(String),
    ArraySizeMustBeGreaterThan(String),
    BadArrayInitValue(String),
    GlobalVarConstExpr(String),
    ConstantDivideByZero,

    // code emission
    ProgramTooLarge,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, line: u32) -> Self {
        CompileError { kind, line }
    }

    /// The message body, without the `line:` prefix.
    pub fn message(&self) -> String {
        use CompileErrorKind::*;
        match &self.kind {
            UnexpectedCharacter(ch) => {
                format!("unexpected character '{}' in source", ch)
            }
            UnexpectedToken { got, expected } => match expected {
                Some(e) => format!("unexpected token '{}' expecting '{}'", got, e),
                None => format!("unexpected token '{}'", got),
            },
            ExpectingLitOrIdent { got } => {
                format!("expecting literal or identifier, found '{}' instead", got)
            }
            AssignOrCallExpected { after } => {
                format!("assignment or call expected after '{}'", after)
            }
            StatementExpected => "statement expected".to_string(),
            UnknownVariable(name) => format!("unknown variable '{}'", name),
            UnknownArray(name) => format!("use of unknown array '{}'", name),
            UnknownFunction(name) => format!("unknown function '{}'", name),
            UnknownIdentifier(name) => format!("unknown identifier '{}'", name),
            VarAlreadyExists(name) => {
                format!("var '{}' already exists in this scope", name)
            }
            FunctionAlreadyExists(name) => format!("function '{}' already exists", name),
            IdentIsArrayNotVar(name) => {
                format!("identifier '{}' is an array type not a variable", name)
            }
            VariableIsNotArray(name) => {
                format!("variable '{}' was not declared as an array", name)
            }
            ArrayRequiresSubscript(name) => {
                format!("array '{}' requires a subscript", name)
            }
            ExpectedFuncCall(name) => {
                format!("expected a function call for '{}'", name)
            }
            TooManyArgs(name) => format!("too many arguments passed to '{}'", name),
            NotEnoughArgs(name) => format!("not enough arguments passed to '{}'", name),
            ArraySizeMustBeGreaterThan(name) => {
                format!("size of array '{}' must be greater than 1", name)
            }
            BadArrayInitValue(name) => {
                format!("array initializer for '{}' must contain only literals", name)
            }
            GlobalVarConstExpr(name) => {
                format!("global '{}' must be initialized with a constant expression", name)
            }
            ConstantDivideByZero => "divide by zero in constant expression".to_string(),
            ProgramTooLarge => "program too large, ran out of space".to_string(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line:{} - {}", self.line, self.message())
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_has_line_prefix() {
        let err = CompileError::new(CompileErrorKind::StatementExpected, 12);
        assert_eq!(err.to_string(), "line:12 - statement expected");
    }

    #[test]
    fn test_unexpected_token_with_expected() {
        let err = CompileError::new(
            CompileErrorKind::UnexpectedToken {
                got: "else".to_string(),
                expected: Some("end"),
            },
            3,
        );
        assert_eq!(err.to_string(), "line:3 - unexpected token 'else' expecting 'end'");
    }
}
