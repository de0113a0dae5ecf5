//! Rule parsing for the routing predicate DSL (syntax `v3`).
//!
//! A rule is a boolean expression over matcher calls:
//! `Host(`example.com`) && (PathPrefix(`/api`) || !Method(`POST`))`.
//! `&&` binds tighter than `||`, `!` applies to the following primary,
//! literals are backtick-quoted. Parsing yields an [`Expr`] tree that the
//! matcher module compiles per protocol.

pub mod matcher;

use crate::error::{Error, Result};
use std::fmt;

/// A single matcher invocation, e.g. `PathPrefix(`/api`, `/ui`)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatcherCall {
    pub name: String,
    pub args: Vec<String>,
}

/// Parsed rule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Call(MatcherCall),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Deterministic priority: the length of the canonical printed form.
    /// Longer, more specific rules outrank shorter ones; ties are broken
    /// by router name at dispatch time.
    pub fn priority(&self) -> i64 {
        self.to_string().len() as i64
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_expr(expr: &Expr, parent: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            // Precedence: Or = 1, And = 2, Not/Call = 3.
            match expr {
                Expr::Call(call) => {
                    write!(f, "{}(", call.name)?;
                    for (i, arg) in call.args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "`{}`", arg)?;
                    }
                    write!(f, ")")
                }
                Expr::Not(inner) => {
                    write!(f, "!")?;
                    write_expr(inner, 3, f)
                }
                Expr::And(lhs, rhs) => {
                    let needs_parens = parent > 2;
                    if needs_parens {
                        write!(f, "(")?;
                    }
                    write_expr(lhs, 2, f)?;
                    write!(f, " && ")?;
                    write_expr(rhs, 2, f)?;
                    if needs_parens {
                        write!(f, ")")?;
                    }
                    Ok(())
                }
                Expr::Or(lhs, rhs) => {
                    let needs_parens = parent > 1;
                    if needs_parens {
                        write!(f, "(")?;
                    }
                    write_expr(lhs, 1, f)?;
                    write!(f, " || ")?;
                    write_expr(rhs, 1, f)?;
                    if needs_parens {
                        write!(f, ")")?;
                    }
                    Ok(())
                }
            }
        }
        write_expr(self, 0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Literal(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

fn tokenize(rule: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = rule.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(Error::rule("expected '&&'", rule));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(Error::rule("expected '||'", rule));
                }
                tokens.push(Token::Or);
            }
            '`' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('`') => break,
                        Some(ch) => literal.push(ch),
                        None => return Err(Error::rule("unterminated literal", rule)),
                    }
                }
                tokens.push(Token::Literal(literal));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c => {
                return Err(Error::rule(format!("unexpected character '{}'", c), rule));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    rule: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(Error::rule(
                format!("expected {:?}, found {:?}", expected, tok),
                self.rule,
            )),
            None => Err(Error::rule(
                format!("expected {:?}, found end of rule", expected),
                self.rule,
            )),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        match self.next() {
                            Some(Token::Literal(lit)) => args.push(lit),
                            Some(tok) => {
                                return Err(Error::rule(
                                    format!("expected literal argument, found {:?}", tok),
                                    self.rule,
                                ))
                            }
                            None => {
                                return Err(Error::rule(
                                    "expected literal argument, found end of rule",
                                    self.rule,
                                ))
                            }
                        }
                        if self.peek() == Some(&Token::Comma) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call(MatcherCall { name, args }))
            }
            Some(tok) => Err(Error::rule(
                format!("unexpected token {:?}", tok),
                self.rule,
            )),
            None => Err(Error::rule("unexpected end of rule", self.rule)),
        }
    }
}

/// Parse a rule into an expression tree.
pub fn parse(rule: &str) -> Result<Expr> {
    let tokens = tokenize(rule)?;
    if tokens.is_empty() {
        return Err(Error::rule("empty rule", rule));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        rule,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::rule("trailing tokens after expression", rule));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[&str]) -> Expr {
        Expr::Call(MatcherCall {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_parse_single_matcher() {
        let expr = parse("Host(`example.com`)").unwrap();
        assert_eq!(expr, call("Host", &["example.com"]));
    }

    #[test]
    fn test_parse_multiple_args() {
        let expr = parse("PathPrefix(`/api`, `/ui`)").unwrap();
        assert_eq!(expr, call("PathPrefix", &["/api", "/ui"]));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse("Host(`a`) || Host(`b`) && Path(`/c`)").unwrap();
        assert_eq!(
            expr,
            Expr::Or(
                Box::new(call("Host", &["a"])),
                Box::new(Expr::And(
                    Box::new(call("Host", &["b"])),
                    Box::new(call("Path", &["/c"])),
                )),
            )
        );
    }

    #[test]
    fn test_parens_override_precedence() {
        let expr = parse("(Host(`a`) || Host(`b`)) && Path(`/c`)").unwrap();
        assert_eq!(
            expr,
            Expr::And(
                Box::new(Expr::Or(
                    Box::new(call("Host", &["a"])),
                    Box::new(call("Host", &["b"])),
                )),
                Box::new(call("Path", &["/c"])),
            )
        );
    }

    #[test]
    fn test_negation() {
        let expr = parse("!Method(`POST`) && Host(`a`)").unwrap();
        assert_eq!(
            expr,
            Expr::And(
                Box::new(Expr::Not(Box::new(call("Method", &["POST"])))),
                Box::new(call("Host", &["a"])),
            )
        );
    }

    #[test]
    fn test_parse_print_parse_idempotent() {
        let rules = [
            "Host(`example.com`)",
            "Host(`a`) && PathPrefix(`/api`)",
            "Host(`a`) || Host(`b`) && Path(`/c`)",
            "(Host(`a`) || Host(`b`)) && Path(`/c`)",
            "!Method(`POST`)",
            "!(Host(`a`) && Path(`/b`))",
            "Header(`X-Env`, `prod`) && ClientIP(`10.0.0.0/8`)",
        ];
        for rule in rules {
            let parsed = parse(rule).unwrap();
            let printed = parsed.to_string();
            let reparsed = parse(&printed).unwrap();
            assert_eq!(parsed, reparsed, "rule {} not stable", rule);
            // Printing is a fixed point after one round.
            assert_eq!(printed, reparsed.to_string());
        }
    }

    #[test]
    fn test_priority_is_deterministic_and_ordered() {
        let short = parse("Host(`a.com`)").unwrap();
        let long = parse("Host(`a.com`) && PathPrefix(`/api/v1`)").unwrap();
        assert!(long.priority() > short.priority());
        assert_eq!(short.priority(), parse("Host(`a.com`)").unwrap().priority());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("Host(`unterminated").is_err());
        assert!(parse("Host(`a`) &&").is_err());
        assert!(parse("Host(`a`) Host(`b`)").is_err());
        assert!(parse("Host(bare)").is_err());
        assert!(parse("&& Host(`a`)").is_err());
    }
}
