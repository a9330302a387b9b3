//! Tokenizer for the expression language used inside `${{ }}` templates.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Identifier(String),
    Integer(i64),
    Float(f64),
    String(String),
    True,
    False,
    Null,

    // Operators
    DoubleEquals, // ==
    NotEquals,    // !=
    LessThan,     // <
    LessEqual,    // <=
    GreaterThan,  // >
    GreaterEqual, // >=
    And,          // &&
    Or,           // ||
    Not,          // !
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    Dot,          // .
    Comma,        // ,

    // Delimiters
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]

    Eof,
}

#[derive(Debug)]
pub struct Lexer<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        self.pos += 1;
        ch
    }

    fn error(&self, message: impl std::fmt::Display) -> ExpressionError {
        ExpressionError::Syntax(format!("{} in '{}'", message, self.source))
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();

        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
                continue;
            }

            let token = match ch {
                '(' => self.single(Token::OpenParen),
                ')' => self.single(Token::CloseParen),
                '[' => self.single(Token::OpenBracket),
                ']' => self.single(Token::CloseBracket),
                ',' => self.single(Token::Comma),
                '.' => self.single(Token::Dot),
                '+' => self.single(Token::Plus),
                '-' => self.single(Token::Minus),
                '*' => self.single(Token::Star),
                '/' => self.single(Token::Slash),
                '%' => self.single(Token::Percent),
                '=' if self.peek() == Some('=') => self.double(Token::DoubleEquals),
                '!' if self.peek() == Some('=') => self.double(Token::NotEquals),
                '!' => self.single(Token::Not),
                '<' if self.peek() == Some('=') => self.double(Token::LessEqual),
                '<' => self.single(Token::LessThan),
                '>' if self.peek() == Some('=') => self.double(Token::GreaterEqual),
                '>' => self.single(Token::GreaterThan),
                '&' if self.peek() == Some('&') => self.double(Token::And),
                '|' if self.peek() == Some('|') => self.double(Token::Or),
                '\'' | '"' => self.string(ch)?,
                c if c.is_ascii_digit() => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.identifier(),
                other => return Err(self.error(format!("unexpected character '{}'", other))),
            };
            tokens.push(token);
        }

        tokens.push(Token::Eof);
        Ok(tokens)
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn double(&mut self, token: Token) -> Token {
        self.advance();
        self.advance();
        token
    }

    fn string(&mut self, quote: char) -> Result<Token, ExpressionError> {
        self.advance();
        let mut value = String::new();

        loop {
            match self.advance() {
                Some(c) if c == quote => return Ok(Token::String(value)),
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(c) => value.push(c),
                    None => break,
                },
                Some(c) => value.push(c),
                None => break,
            }
        }

        Err(self.error("unterminated string literal"))
    }

    fn number(&mut self) -> Result<Token, ExpressionError> {
        let start = self.pos;
        let mut is_float = false;

        while let Some(c) = self.current() {
            if c.is_ascii_digit() || c == '_' {
                self.advance();
            } else if c == '.' && !is_float && self.peek().is_some_and(|n| n.is_ascii_digit()) {
                is_float = true;
                self.advance();
            } else {
                break;
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();

        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| self.error(format!("invalid number '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(Token::Integer)
                .map_err(|_| self.error(format!("integer out of range '{}'", text)))
        }
    }

    fn identifier(&mut self) -> Token {
        let start = self.pos;
        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let text: String = self.chars[start..self.pos].iter().collect();
        match text.as_str() {
            "true" | "True" => Token::True,
            "false" | "False" => Token::False,
            "null" | "None" => Token::Null,
            _ => Token::Identifier(text),
        }
    }
}
