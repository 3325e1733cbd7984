//! Recursive-descent parser for the kernel statement language.
//!
//! Grammar (statements):
//!
//! ```text
//! stmt      := ident '=' expr ';'
//!            | 'if' '(' expr ')' block ('else' block)?
//!            | 'switch' '(' expr ')' '{' case* default? '}'
//!            | 'break' ';'
//! case      := 'case' number ':' block-or-stmts
//! block     := '{' stmt* '}'
//! ```
//!
//! Expressions are parsed by precedence climbing: `||` < `&&` <
//! comparisons < `+ -` < `* / %` < unary `- !` < call/primary.

use crate::error::CompileError;
use crate::lexer::{lex, SpannedTok, Tok};

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal.
    Num(f64),
    /// Variable read.
    Var(String),
    /// Unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        rhs: Box<Expr>,
    },
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Function call; the function set is fixed by the evaluator.
    Call {
        /// Function name.
        name: String,
        /// Arguments.
        args: Vec<Expr>,
        /// Line for arity/unknown-function diagnostics.
        line: u32,
    },
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Boolean not (non-zero → 0, zero → 1).
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&&`
    And,
    /// `||`
    Or,
}

/// Statement node.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `name = expr;`
    Assign {
        /// Target variable.
        name: String,
        /// Value expression.
        expr: Expr,
    },
    /// `if (cond) { .. } else { .. }`
    If {
        /// Condition (non-zero = true).
        cond: Expr,
        /// Then branch.
        then: Vec<Stmt>,
        /// Else branch (possibly empty).
        otherwise: Vec<Stmt>,
    },
    /// `switch (expr) { case n: ... }` with no fallthrough; each case runs
    /// to its `break` or to the end of its statement list.
    Switch {
        /// Scrutinee, rounded to the nearest integer for matching.
        scrutinee: Expr,
        /// `(label, body)` pairs.
        cases: Vec<(i64, Vec<Stmt>)>,
        /// `default:` body, when present.
        default: Vec<Stmt>,
    },
    /// `break;`: ends the innermost case body.
    Break,
}

pub(crate) struct Parser {
    toks: Vec<SpannedTok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&SpannedTok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<SpannedTok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &Tok, what: &'static str) -> Result<(), CompileError> {
        match self.next() {
            Some(t) if &t.tok == want => Ok(()),
            Some(t) => Err(CompileError::Expected {
                expected: what,
                found: format!("{:?}", t.tok),
                line: t.line,
            }),
            None => Err(CompileError::UnexpectedEof { expected: what }),
        }
    }

    fn parse_stmts_until_rbrace(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Some(t) if t.tok == Tok::RBrace => {
                    self.next();
                    return Ok(stmts);
                }
                Some(_) => stmts.push(self.parse_stmt()?),
                None => return Err(CompileError::UnexpectedEof { expected: "'}'" }),
            }
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect(&Tok::LBrace, "'{'")?;
        self.parse_stmts_until_rbrace()
    }

    pub(crate) fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let t = self
            .peek()
            .cloned()
            .ok_or(CompileError::UnexpectedEof { expected: "statement" })?;
        match &t.tok {
            Tok::Ident(name) => match name.as_str() {
                "if" => {
                    self.next();
                    self.expect(&Tok::LParen, "'('")?;
                    let cond = self.parse_expr()?;
                    self.expect(&Tok::RParen, "')'")?;
                    let then = self.parse_block()?;
                    let otherwise = if matches!(self.peek(), Some(t) if t.tok == Tok::Ident("else".into()))
                    {
                        self.next();
                        self.parse_block()?
                    } else {
                        Vec::new()
                    };
                    Ok(Stmt::If {
                        cond,
                        then,
                        otherwise,
                    })
                }
                "switch" => {
                    self.next();
                    self.expect(&Tok::LParen, "'('")?;
                    let scrutinee = self.parse_expr()?;
                    self.expect(&Tok::RParen, "')'")?;
                    self.expect(&Tok::LBrace, "'{'")?;
                    let mut cases = Vec::new();
                    let mut default = Vec::new();
                    loop {
                        match self.next() {
                            Some(t) if t.tok == Tok::RBrace => break,
                            Some(t) if t.tok == Tok::Ident("case".into()) => {
                                let label = match self.next() {
                                    Some(SpannedTok {
                                        tok: Tok::Num(n), ..
                                    }) => n.round() as i64,
                                    Some(other) => {
                                        return Err(CompileError::Expected {
                                            expected: "case label",
                                            found: format!("{:?}", other.tok),
                                            line: other.line,
                                        })
                                    }
                                    None => {
                                        return Err(CompileError::UnexpectedEof {
                                            expected: "case label",
                                        })
                                    }
                                };
                                self.expect(&Tok::Colon, "':'")?;
                                let body = self.parse_case_body()?;
                                cases.push((label, body));
                            }
                            Some(t) if t.tok == Tok::Ident("default".into()) => {
                                self.expect(&Tok::Colon, "':'")?;
                                default = self.parse_case_body()?;
                            }
                            Some(other) => {
                                return Err(CompileError::Expected {
                                    expected: "'case', 'default' or '}'",
                                    found: format!("{:?}", other.tok),
                                    line: other.line,
                                })
                            }
                            None => {
                                return Err(CompileError::UnexpectedEof { expected: "'}'" })
                            }
                        }
                    }
                    Ok(Stmt::Switch {
                        scrutinee,
                        cases,
                        default,
                    })
                }
                "break" => {
                    self.next();
                    self.expect(&Tok::Semi, "';'")?;
                    Ok(Stmt::Break)
                }
                _ => {
                    // Assignment.
                    let name = name.clone();
                    self.next();
                    self.expect(&Tok::Assign, "'='")?;
                    let expr = self.parse_expr()?;
                    self.expect(&Tok::Semi, "';'")?;
                    Ok(Stmt::Assign { name, expr })
                }
            },
            other => Err(CompileError::Expected {
                expected: "statement",
                found: format!("{other:?}"),
                line: t.line,
            }),
        }
    }

    /// A case body is either a brace block or bare statements running until
    /// the next `case`/`default`/`}`.
    fn parse_case_body(&mut self) -> Result<Vec<Stmt>, CompileError> {
        if matches!(self.peek(), Some(t) if t.tok == Tok::LBrace) {
            return self.parse_block();
        }
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Some(t)
                    if t.tok == Tok::RBrace
                        || t.tok == Tok::Ident("case".into())
                        || t.tok == Tok::Ident("default".into()) =>
                {
                    return Ok(stmts)
                }
                Some(_) => stmts.push(self.parse_stmt()?),
                None => return Err(CompileError::UnexpectedEof { expected: "'}'" }),
            }
        }
    }

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(t) if t.tok == Tok::OrOr) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_cmp()?;
        while matches!(self.peek(), Some(t) if t.tok == Tok::AndAnd) {
            self.next();
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_add()?;
        let op = match self.peek().map(|t| &t.tok) {
            Some(Tok::Lt) => Some(BinOp::Lt),
            Some(Tok::Le) => Some(BinOp::Le),
            Some(Tok::Gt) => Some(BinOp::Gt),
            Some(Tok::Ge) => Some(BinOp::Ge),
            Some(Tok::Eq) => Some(BinOp::Eq),
            Some(Tok::Ne) => Some(BinOp::Ne),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let rhs = self.parse_add()?;
            Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        } else {
            Ok(lhs)
        }
    }

    fn parse_add(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.next();
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        match self.peek().map(|t| &t.tok) {
            Some(Tok::Minus) => {
                self.next();
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    rhs: Box::new(self.parse_unary()?),
                })
            }
            Some(Tok::Not) => {
                self.next();
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    rhs: Box::new(self.parse_unary()?),
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let t = self
            .next()
            .ok_or(CompileError::UnexpectedEof { expected: "expression" })?;
        match t.tok {
            Tok::Num(n) => Ok(Expr::Num(n)),
            Tok::LParen => {
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(e)
            }
            Tok::Ident(name) => {
                if matches!(self.peek(), Some(t) if t.tok == Tok::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(t) if t.tok == Tok::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            match self.next() {
                                Some(t) if t.tok == Tok::Comma => continue,
                                Some(t) if t.tok == Tok::RParen => break,
                                Some(other) => {
                                    return Err(CompileError::Expected {
                                        expected: "',' or ')'",
                                        found: format!("{:?}", other.tok),
                                        line: other.line,
                                    })
                                }
                                None => {
                                    return Err(CompileError::UnexpectedEof { expected: "')'" })
                                }
                            }
                        }
                    } else {
                        self.next();
                    }
                    Ok(Expr::Call {
                        name,
                        args,
                        line: t.line,
                    })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(CompileError::Expected {
                expected: "expression",
                found: format!("{other:?}"),
                line: t.line,
            }),
        }
    }
}

/// Parses a full kernel source (a statement sequence) into its AST.
pub(crate) fn parse_source(src: &str) -> Result<Vec<Stmt>, CompileError> {
    let toks = lex(src)?;
    let mut p = Parser { toks, pos: 0 };
    let mut stmts = Vec::new();
    while p.peek().is_some() {
        stmts.push(p.parse_stmt()?);
    }
    Ok(stmts)
}

/// Parses a single expression (inspector predicates, conditions).
pub(crate) fn parse_expression(src: &str) -> Result<Expr, CompileError> {
    let toks = lex(src)?;
    let mut p = Parser { toks, pos: 0 };
    let e = p.parse_expr()?;
    if let Some(t) = p.peek() {
        return Err(CompileError::Expected {
            expected: "end of expression",
            found: format!("{:?}", t.tok),
            line: t.line,
        });
    }
    Ok(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_switch_with_cases() {
        let src = "switch (family) { case 2: { vX = -sin(t); break; } default: { vX = 0; } }";
        let stmts = parse_source(src).unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            Stmt::Switch { cases, default, .. } => {
                assert_eq!(cases.len(), 1);
                assert_eq!(cases[0].0, 2);
                assert_eq!(default.len(), 1);
            }
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn parses_guarded_family_change() {
        let src = "if (family == 1) { changed = Z < 0.05; if (changed) { newFamily = 2; } }";
        let stmts = parse_source(src).unwrap();
        assert!(matches!(stmts[0], Stmt::If { .. }));
    }

    #[test]
    fn rejects_dangling_assignment() {
        assert!(parse_source("vX = ;").is_err());
    }

    #[test]
    fn precedence_binds_mul_over_add() {
        let e = parse_expression("1 + 2 * 3").unwrap();
        match e {
            Expr::Binary { op: BinOp::Add, rhs, .. } => {
                assert!(matches!(*rhs, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }
}
