// Recursive-descent parser producing the evaluation AST.
//
// Grammar (loosest binding first):
//   ternary    := or ('?' expr ':' expr)?
//   or         := and ('||' and)*
//   and        := equality ('&&' equality)*
//   equality   := comparison (('==' | '!=') comparison)*
//   comparison := additive (('<' | '<=' | '>' | '>=') additive)*
//   additive   := multiplicative (('+' | '-') multiplicative)*
//   multiplicative := unary (('*' | '/' | '%') unary)*
//   unary      := ('!' | '-') unary | primary
//   primary    := literal | ident | accessor | call | '(' expr ')'

use crate::error::Error;
use crate::token::{Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Bare identifier resolved through the parameter object.
    Param(String),
    /// Dotted chain: parameter lookup of `base`, then property digs.
    Access { base: String, path: Vec<String> },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

pub fn parse(tokens: &[Token]) -> Result<Expr, Error> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != tokens.len() {
        return Err(Error::Parse(format!(
            "unexpected token '{}'",
            tokens[parser.pos].text
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, kind: TokenKind, text: &str) -> bool {
        if let Some(t) = self.peek() {
            if t.kind == kind && t.text == text {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), Error> {
        match self.bump() {
            Some(t) if t.kind == kind => Ok(()),
            Some(t) => Err(Error::Parse(format!(
                "expected {}, found '{}'",
                what, t.text
            ))),
            None => Err(Error::Parse(format!("expected {}, found end of input", what))),
        }
    }

    fn ternary(&mut self) -> Result<Expr, Error> {
        let cond = self.or()?;
        if let Some(t) = self.peek() {
            if t.kind == TokenKind::TernaryIf {
                self.pos += 1;
                let then_branch = self.ternary()?;
                self.expect(TokenKind::TernaryElse, "':'")?;
                let else_branch = self.ternary()?;
                return Ok(Expr::Ternary {
                    cond: Box::new(cond),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                });
            }
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.and()?;
        while self.eat(TokenKind::LogicalOp, "||") {
            let rhs = self.and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.equality()?;
        while self.eat(TokenKind::LogicalOp, "&&") {
            let rhs = self.equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.kind == TokenKind::Comparator && t.text == "==" => BinaryOp::Eq,
                Some(t) if t.kind == TokenKind::Comparator && t.text == "!=" => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.kind == TokenKind::Comparator => match t.text.as_str() {
                    "<" => BinaryOp::Lt,
                    "<=" => BinaryOp::Le,
                    ">" => BinaryOp::Gt,
                    ">=" => BinaryOp::Ge,
                    _ => break,
                },
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.kind == TokenKind::Arithmetic => match t.text.as_str() {
                    "+" => BinaryOp::Add,
                    "-" => BinaryOp::Sub,
                    _ => break,
                },
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.kind == TokenKind::Arithmetic => match t.text.as_str() {
                    "*" => BinaryOp::Mul,
                    "/" => BinaryOp::Div,
                    "%" => BinaryOp::Mod,
                    _ => break,
                },
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, Error> {
        if let Some(t) = self.peek() {
            if t.kind == TokenKind::Prefix {
                let op = match t.text.as_str() {
                    "!" => UnaryOp::Not,
                    "-" => UnaryOp::Neg,
                    other => return Err(Error::Parse(format!("unknown prefix '{}'", other))),
                };
                self.pos += 1;
                let operand = self.unary()?;
                return Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                });
            }
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, Error> {
        let token = match self.bump() {
            Some(t) => t.clone(),
            None => return Err(Error::Parse("unexpected end of expression".to_string())),
        };

        match token.kind {
            TokenKind::Number => {
                let n: f64 = token
                    .text
                    .parse()
                    .map_err(|_| Error::Parse(format!("invalid number '{}'", token.text)))?;
                Ok(Expr::Literal(Value::Num(n)))
            }
            TokenKind::Str => Ok(Expr::Literal(Value::Str(token.text))),
            TokenKind::Bool => Ok(Expr::Literal(Value::Bool(token.text == "true"))),
            TokenKind::Ident => Ok(Expr::Param(token.text)),
            TokenKind::Accessor => {
                let mut parts = token.parts.clone();
                let base = parts.remove(0);
                Ok(Expr::Access { base, path: parts })
            }
            TokenKind::Function => {
                self.expect(TokenKind::Clause, "'('")?;
                let mut args = Vec::new();
                if matches!(self.peek(), Some(t) if t.kind == TokenKind::ClauseClose) {
                    self.pos += 1;
                } else {
                    loop {
                        args.push(self.ternary()?);
                        match self.bump() {
                            Some(t) if t.kind == TokenKind::Separator => continue,
                            Some(t) if t.kind == TokenKind::ClauseClose => break,
                            Some(t) => {
                                return Err(Error::Parse(format!(
                                    "expected ',' or ')', found '{}'",
                                    t.text
                                )))
                            }
                            None => {
                                return Err(Error::Parse(
                                    "unterminated argument list".to_string(),
                                ))
                            }
                        }
                    }
                }
                Ok(Expr::Call {
                    name: token.text,
                    args,
                })
            }
            TokenKind::Clause => {
                let inner = self.ternary()?;
                self.expect(TokenKind::ClauseClose, "')'")?;
                Ok(inner)
            }
            _ => Err(Error::Parse(format!("unexpected token '{}'", token.text))),
        }
    }
}
