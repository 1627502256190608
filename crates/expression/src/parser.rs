//! Lexer and recursive-descent parser for guard expressions.

use serde_json::Value;

use crate::ExprError;
use crate::ast::{BinaryOp, Expr};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Path(String),
    True,
    False,
    Null,
    AndAnd,
    OrOr,
    Not,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn tokens(mut self) -> Result<Vec<(usize, Token)>, ExprError> {
        let mut out = Vec::new();
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'(' => {
                    self.pos += 1;
                    out.push((start, Token::LParen));
                }
                b')' => {
                    self.pos += 1;
                    out.push((start, Token::RParen));
                }
                b'&' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'&') {
                        self.pos += 2;
                        out.push((start, Token::AndAnd));
                    } else {
                        return Err(self.error("expected '&&'"));
                    }
                }
                b'|' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'|') {
                        self.pos += 2;
                        out.push((start, Token::OrOr));
                    } else {
                        return Err(self.error("expected '||'"));
                    }
                }
                b'=' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        out.push((start, Token::EqEq));
                    } else {
                        return Err(self.error("expected '=='"));
                    }
                }
                b'!' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        out.push((start, Token::NotEq));
                    } else {
                        self.pos += 1;
                        out.push((start, Token::Not));
                    }
                }
                b'<' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        out.push((start, Token::Le));
                    } else {
                        self.pos += 1;
                        out.push((start, Token::Lt));
                    }
                }
                b'>' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        out.push((start, Token::Ge));
                    } else {
                        self.pos += 1;
                        out.push((start, Token::Gt));
                    }
                }
                b'\'' | b'"' => out.push((start, self.string(c)?)),
                b'0'..=b'9' | b'-' => out.push((start, self.number()?)),
                c if c.is_ascii_alphabetic() || c == b'_' => out.push((start, self.path())),
                _ => return Err(self.error(format!("unexpected character {:?}", c as char))),
            }
        }
        Ok(out)
    }

    fn string(&mut self, quote: u8) -> Result<Token, ExprError> {
        self.pos += 1;
        let mut bytes = Vec::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                c if c == quote => {
                    return String::from_utf8(bytes)
                        .map(Token::Str)
                        .map_err(|_| self.error("invalid UTF-8 in string literal"));
                }
                b'\\' => {
                    let escaped = self.peek().ok_or_else(|| self.error("unterminated escape"))?;
                    self.pos += 1;
                    match escaped {
                        b'\\' => bytes.push(b'\\'),
                        b'\'' => bytes.push(b'\''),
                        b'"' => bytes.push(b'"'),
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        other => {
                            return Err(self.error(format!("unknown escape \\{}", other as char)));
                        }
                    }
                }
                _ => bytes.push(c),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn number(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == b'.')
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number {text:?}")))
    }

    fn path(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        match text {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Path(text.to_owned()),
        }
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn error(&self, message: impl Into<String>) -> ExprError {
        let offset = self
            .tokens
            .get(self.pos)
            .map_or(self.end, |(offset, _)| *offset);
        ExprError::Parse {
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.comparison()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.unary()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parse a guard expression.
///
/// # Errors
///
/// [`ExprError::Parse`] with the byte offset of the first problem.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let end = src.len();
    let tokens = Lexer::new(src).tokens()?;
    let mut parser = Parser { tokens, pos: 0, end };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing input after expression"));
    }
    Ok(expr)
}
