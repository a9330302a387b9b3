//! Recursive-descent parser producing the expression AST.
//!
//! Precedence, lowest first: `||`, `&&`, `== !=`, `< <= > >=`, `+ -`,
//! `* / %`, unary `! -`, postfix (`.field`, `[index]`).

use std::fmt;

use serde_json::Value;

use super::lexer::{Lexer, Token};
use super::ExpressionError;

/// Root namespaces addressable from an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Actions,
    Trigger,
    Env,
    Inputs,
    Var,
}

impl Namespace {
    fn from_identifier(name: &str) -> Option<Self> {
        match name {
            "ACTIONS" => Some(Self::Actions),
            "TRIGGER" => Some(Self::Trigger),
            "ENV" => Some(Self::Env),
            "INPUTS" => Some(Self::Inputs),
            "var" => Some(Self::Var),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actions => "ACTIONS",
            Self::Trigger => "TRIGGER",
            Self::Env => "ENV",
            Self::Inputs => "INPUTS",
            Self::Var => "var",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    Index(i64),
}

/// A static path into the execution context, e.g. `ACTIONS.a.result[0]`
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub root: Namespace,
    pub segments: Vec<PathSegment>,
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.root.as_str())?;
        for segment in &self.segments {
            match segment {
                PathSegment::Field(name) => write!(f, ".{}", name)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Path(Path),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        function: String,
        broadcast: bool,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// Parse a bare expression (no `${{ }}` wrapper)
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if parser.current() != &Token::Eof {
        return Err(parser.error(format!("unexpected token {:?}", parser.current())));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos + 1).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, expected: &Token) -> bool {
        self.current() == expected
    }

    fn expect(&mut self, expected: Token) -> Result<Token, ExpressionError> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(self.error(format!(
                "expected {:?}, found {:?}",
                expected,
                self.current()
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ExpressionError> {
        match self.advance() {
            Token::Identifier(name) => Ok(name),
            other => Err(self.error(format!("expected identifier, found {:?}", other))),
        }
    }

    fn error(&self, message: impl fmt::Display) -> ExpressionError {
        ExpressionError::Syntax(format!("{} in '{}'", message, self.source))
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_equality()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.current() {
                Token::DoubleEquals => BinaryOp::Equal,
                Token::NotEquals => BinaryOp::NotEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current() {
                Token::LessThan => BinaryOp::Less,
                Token::LessEqual => BinaryOp::LessEqual,
                Token::GreaterThan => BinaryOp::Greater,
                Token::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.current() {
            Token::Not => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Negate, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let field = self.expect_identifier()?;
                    expr = match expr {
                        Expr::Path(mut path) => {
                            path.segments.push(PathSegment::Field(field));
                            Expr::Path(path)
                        }
                        other => Expr::Member(Box::new(other), field),
                    };
                }
                Token::OpenBracket => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(Token::CloseBracket)?;
                    expr = match (expr, index) {
                        (Expr::Path(mut path), Expr::Literal(Value::Number(n)))
                            if n.is_i64() =>
                        {
                            path.segments
                                .push(PathSegment::Index(n.as_i64().unwrap_or_default()));
                            Expr::Path(path)
                        }
                        (Expr::Path(mut path), Expr::Literal(Value::String(key))) => {
                            path.segments.push(PathSegment::Field(key));
                            Expr::Path(path)
                        }
                        (base, index) => Expr::Index(Box::new(base), Box::new(index)),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Token::Integer(i) => Ok(Expr::Literal(Value::from(i))),
            Token::Float(f) => Ok(Expr::Literal(
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::String(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::OpenParen => {
                let expr = self.parse_or()?;
                self.expect(Token::CloseParen)?;
                Ok(expr)
            }
            Token::OpenBracket => {
                let items = self.parse_list(Token::CloseBracket)?;
                Ok(Expr::List(items))
            }
            Token::Identifier(name) if name == "FN" => self.parse_call(),
            Token::Identifier(name) => match Namespace::from_identifier(&name) {
                Some(root) => Ok(Expr::Path(Path {
                    root,
                    segments: Vec::new(),
                })),
                None => Err(self.error(format!("unknown identifier '{}'", name))),
            },
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }

    /// `FN.name(args)` or `FN.name.map(args)`
    fn parse_call(&mut self) -> Result<Expr, ExpressionError> {
        self.expect(Token::Dot)?;
        let function = self.expect_identifier()?;

        let broadcast = if self.check(&Token::Dot)
            && self.peek() == &Token::Identifier("map".to_string())
        {
            self.advance();
            self.advance();
            true
        } else {
            false
        };

        self.expect(Token::OpenParen)?;
        let args = self.parse_list(Token::CloseParen)?;

        Ok(Expr::Call {
            function,
            broadcast,
            args,
        })
    }

    fn parse_list(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if self.check(&close) {
            self.advance();
            return Ok(items);
        }

        loop {
            items.push(self.parse_or()?);
            if self.check(&Token::Comma) {
                self.advance();
                // Allow a trailing comma
                if self.check(&close) {
                    self.advance();
                    break;
                }
            } else {
                self.expect(close.clone())?;
                break;
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static_path() {
        let expr = parse("ACTIONS.a.result[0]['key']").unwrap();
        match expr {
            Expr::Path(path) => {
                assert_eq!(path.root, Namespace::Actions);
                assert_eq!(
                    path.segments,
                    vec![
                        PathSegment::Field("a".into()),
                        PathSegment::Field("result".into()),
                        PathSegment::Index(0),
                        PathSegment::Field("key".into()),
                    ]
                );
                assert_eq!(path.to_string(), "ACTIONS.a.result[0].key");
            }
            other => panic!("expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_dynamic_index() {
        let expr = parse("TRIGGER.items[var.i]").unwrap();
        assert!(matches!(expr, Expr::Index(_, _)));
    }

    #[test]
    fn test_parse_call_and_broadcast() {
        let expr = parse("FN.add(1, 2)").unwrap();
        assert!(matches!(expr, Expr::Call { broadcast: false, ref args, .. } if args.len() == 2));

        let expr = parse("FN.add.map([1, 2, 3], 10)").unwrap();
        match expr {
            Expr::Call {
                function,
                broadcast,
                args,
            } => {
                assert_eq!(function, "add");
                assert!(broadcast);
                assert!(matches!(args[0], Expr::List(ref items) if items.len() == 3));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3 == 7 && true").unwrap();
        match expr {
            Expr::Binary(BinaryOp::And, left, _) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::Equal, _, _)));
            }
            other => panic!("unexpected AST {:?}", other),
        }
    }

    #[test]
    fn test_unknown_identifier() {
        let err = parse("SECRETS.token").unwrap_err();
        assert!(err.to_string().contains("unknown identifier"));
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(parse("1 2").is_err());
        assert!(parse("FN.add(1,").is_err());
    }
}
