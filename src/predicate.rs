//! Failover predicate grammar: boolean expressions over attempt outcomes,
//! e.g. `IsNetworkError`, `IsNetworkError || ResponseCodeIs(503)`,
//! `!ResponseCodeIs(401) && IsNetworkError`.

use std::fmt;

use crate::error::{ProxyError, Result};
use crate::mux::chain::Attempt;

/// Compiled failover predicate. Cheap to clone, evaluated per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPredicate {
    expr: Expr,
    source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    IsNetworkError,
    ResponseCodeIs(u16),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl FailoverPredicate {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ProxyError::Config(format!(
                "trailing input in predicate: {source}"
            )));
        }
        Ok(Self {
            expr,
            source: source.to_string(),
        })
    }

    pub fn network_error() -> Self {
        Self {
            expr: Expr::IsNetworkError,
            source: "IsNetworkError".to_string(),
        }
    }

    pub fn should_failover(&self, attempt: &Attempt) -> bool {
        eval(&self.expr, attempt)
    }
}

impl fmt::Display for FailoverPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn eval(expr: &Expr, attempt: &Attempt) -> bool {
    match expr {
        Expr::IsNetworkError => attempt.is_network_error(),
        Expr::ResponseCodeIs(code) => attempt.status.map(|s| s.as_u16()) == Some(*code),
        Expr::Not(inner) => !eval(inner, attempt),
        Expr::And(a, b) => eval(a, attempt) && eval(b, attempt),
        Expr::Or(a, b) => eval(a, attempt) || eval(b, attempt),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(u16),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(ProxyError::Config(format!("bad predicate: {source}")));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(ProxyError::Config(format!("bad predicate: {source}")));
                }
                tokens.push(Token::Or);
            }
            c if c.is_ascii_digit() => {
                let mut n = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        n.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = n
                    .parse()
                    .map_err(|_| ProxyError::Config(format!("bad status code in: {source}")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ProxyError::Config(format!(
                    "unexpected '{other}' in predicate: {source}"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(ProxyError::Config(format!(
                "expected {token:?}, got {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "IsNetworkError" => Ok(Expr::IsNetworkError),
                "ResponseCodeIs" => {
                    self.expect(Token::LParen)?;
                    let code = match self.next() {
                        Some(Token::Number(n)) => n,
                        other => {
                            return Err(ProxyError::Config(format!(
                                "ResponseCodeIs expects a status code, got {other:?}"
                            )));
                        }
                    };
                    self.expect(Token::RParen)?;
                    Ok(Expr::ResponseCodeIs(code))
                }
                other => Err(ProxyError::Config(format!("unknown predicate: {other}"))),
            },
            other => Err(ProxyError::Config(format!(
                "unexpected token in predicate: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn net_error() -> Attempt {
        Attempt {
            error: Some("connection refused".into()),
            ..Attempt::default()
        }
    }

    fn status(code: u16) -> Attempt {
        Attempt {
            status: Some(StatusCode::from_u16(code).unwrap()),
            ..Attempt::default()
        }
    }

    #[test]
    fn network_error_atom() {
        let p = FailoverPredicate::parse("IsNetworkError").unwrap();
        assert!(p.should_failover(&net_error()));
        assert!(!p.should_failover(&status(200)));
    }

    #[test]
    fn response_code_atom() {
        let p = FailoverPredicate::parse("ResponseCodeIs(503)").unwrap();
        assert!(p.should_failover(&status(503)));
        assert!(!p.should_failover(&status(200)));
        assert!(!p.should_failover(&net_error()));
    }

    #[test]
    fn composition() {
        let p = FailoverPredicate::parse("IsNetworkError || ResponseCodeIs(503)").unwrap();
        assert!(p.should_failover(&net_error()));
        assert!(p.should_failover(&status(503)));
        assert!(!p.should_failover(&status(200)));

        let p = FailoverPredicate::parse("!IsNetworkError && ResponseCodeIs(429)").unwrap();
        assert!(p.should_failover(&status(429)));
        assert!(!p.should_failover(&net_error()));
    }

    #[test]
    fn parens_override_precedence() {
        let p = FailoverPredicate::parse("!(IsNetworkError || ResponseCodeIs(503))").unwrap();
        assert!(!p.should_failover(&net_error()));
        assert!(p.should_failover(&status(200)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(FailoverPredicate::parse("IsTuesday").is_err());
        assert!(FailoverPredicate::parse("IsNetworkError &&").is_err());
        assert!(FailoverPredicate::parse("IsNetworkError | IsNetworkError").is_err());
        assert!(FailoverPredicate::parse("ResponseCodeIs()").is_err());
    }
}
