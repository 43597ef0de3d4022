use crate::error::{CompileError, CompileErrorKind};
use crate::frontend::token::{Token, TokenKind};

/// Hand-rolled lexer for flint source text.
///
/// Whitespace inside a line is insignificant; newlines are significant and
/// terminate statements, so they are emitted as `TokenKind::Eol` tokens.
/// Comments run from `#` to end of line. The lexer also keeps a copy of
/// every source line so that errors (including runtime errors, via the
/// program image) can render the offending line.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: u32,
    tokens: Vec<Token>,
    lines: Vec<String>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
            lines: source.lines().map(str::to_string).collect(),
        }
    }

    /// Lex the whole input, producing the token stream and the per-line
    /// source copies. The stream always ends with a single `Eof` token.
    pub fn tokenize(mut self) -> Result<(Vec<Token>, Vec<String>), CompileError> {
        while let Some(ch) = self.current() {
            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.push(TokenKind::Eol);
                    self.advance();
                    self.line += 1;
                }
                '#' => self.skip_comment(),
                '"' => self.read_string()?,
                '0'..='9' => self.read_number()?,
                'a'..='z' | 'A'..='Z' | '_' => self.read_ident(),
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '[' => self.single(TokenKind::LBracket),
                ']' => self.single(TokenKind::RBracket),
                ',' => self.single(TokenKind::Comma),
                '*' => self.single(TokenKind::Mul),
                '/' => self.single(TokenKind::Div),
                '%' => self.single(TokenKind::Mod),
                '-' => self.single(TokenKind::Sub),
                '+' => {
                    if self.peek() == Some('=') {
                        self.advance();
                        self.single(TokenKind::AddAssign);
                    } else {
                        self.single(TokenKind::Add);
                    }
                }
                '=' => {
                    if self.peek() == Some('=') {
                        self.advance();
                        self.single(TokenKind::Eq);
                    } else {
                        self.single(TokenKind::Assign);
                    }
                }
                '<' => {
                    if self.peek() == Some('=') {
                        self.advance();
                        self.single(TokenKind::Leq);
                    } else {
                        self.single(TokenKind::Lt);
                    }
                }
                '>' => {
                    if self.peek() == Some('=') {
                        self.advance();
                        self.single(TokenKind::Geq);
                    } else {
                        self.single(TokenKind::Gt);
                    }
                }
                other => {
                    return Err(CompileError::new(
                        CompileErrorKind::UnexpectedCharacter(other),
                        self.line,
                    ));
                }
            }
        }
        // a trailing newline keeps the parser's statement handling uniform
        // when the input does not end with one
        if !matches!(self.tokens.last().map(|t| &t.kind), Some(TokenKind::Eol)) {
            self.push(TokenKind::Eol);
        }
        self.push(TokenKind::Eof);
        Ok((self.tokens, self.lines))
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token::new(kind, self.line));
    }

    fn single(&mut self, kind: TokenKind) {
        self.push(kind);
        self.advance();
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn read_ident(&mut self) {
        let mut name = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let kind = match name.as_str() {
            "var" => TokenKind::Var,
            "function" => TokenKind::Function,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "return" => TokenKind::Return,
            "end" => TokenKind::End,
            "none" => TokenKind::None,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            _ => TokenKind::Ident(name),
        };
        self.push(kind);
    }

    fn read_number(&mut self) -> Result<(), CompileError> {
        let mut digits = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        // a '.' followed by a digit makes this a float literal
        if self.current() == Some('.') && self.peek().map_or(false, |c| c.is_ascii_digit()) {
            digits.push('.');
            self.advance();
            while let Some(ch) = self.current() {
                if ch.is_ascii_digit() {
                    digits.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
            let val: f32 = digits.parse().map_err(|_| {
                CompileError::new(CompileErrorKind::UnexpectedCharacter('.'), self.line)
            })?;
            self.push(TokenKind::Float(val));
            return Ok(());
        }
        let val: i32 = digits.parse().map_err(|_| {
            // out of range for a 32 bit integer
            CompileError::new(
                CompileErrorKind::UnexpectedCharacter(digits.chars().next().unwrap_or('0')),
                self.line,
            )
        })?;
        self.push(TokenKind::Int(val));
        Ok(())
    }

    fn read_string(&mut self) -> Result<(), CompileError> {
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    self.push(TokenKind::Str(out));
                    return Ok(());
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => out.push('\n'),
                        Some('t') => out.push('\t'),
                        Some('\\') => out.push('\\'),
                        Some('"') => out.push('"'),
                        Some(other) => {
                            return Err(CompileError::new(
                                CompileErrorKind::UnexpectedCharacter(other),
                                self.line,
                            ));
                        }
                        None => {
                            return Err(CompileError::new(
                                CompileErrorKind::UnexpectedCharacter('\\'),
                                self.line,
                            ));
                        }
                    }
                    self.advance();
                }
                Some('\n') | None => {
                    // unterminated string
                    return Err(CompileError::new(
                        CompileErrorKind::UnexpectedCharacter('"'),
                        self.line,
                    ));
                }
                Some(other) => {
                    out.push(other);
                    self.advance();
                }
            }
        }
    }
}
