//! Compiled kernel programs and their evaluation scope.

use std::collections::HashMap;

use crate::error::CompileError;
use crate::parser::{parse_expression, parse_source, BinOp, Expr, Stmt, UnaryOp};

/// Named `f64` bindings a program reads and writes.
///
/// Kernel callers bind the per-body locals (`t`, `X`, `Y`, `Z`, `vX`, ...,
/// `family`) before running a program, then read back the outputs the
/// program assigned. `pi` is pre-bound.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: HashMap<String, f64>,
}

impl Scope {
    /// A scope with only the built-in constants bound.
    #[must_use]
    pub fn new() -> Self {
        let mut vars = HashMap::new();
        vars.insert("pi".to_string(), std::f64::consts::PI);
        Self { vars }
    }

    /// Binds (or rebinds) a variable.
    pub fn set(&mut self, name: &str, value: f64) {
        self.vars.insert(name.to_string(), value);
    }

    /// Reads a variable, if bound.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.vars.get(name).copied()
    }
}

/// A compiled kernel: the parsed statement list of one specialized source.
///
/// Programs are immutable and shareable; evaluation happens against a
/// caller-owned [`Scope`], so one program serves any number of threads.
#[derive(Debug, Clone)]
pub struct Program {
    stmts: Vec<Stmt>,
}

/// Why statement execution stopped early.
enum Flow {
    Normal,
    Broke,
}

impl Program {
    /// Parses kernel source into a program.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        Ok(Self {
            stmts: parse_source(source)?,
        })
    }

    /// Parses a single expression as a program that assigns `value`.
    pub fn compile_expression(source: &str) -> Result<Self, CompileError> {
        let expr = parse_expression(source)?;
        Ok(Self {
            stmts: vec![Stmt::Assign {
                name: "value".to_string(),
                expr,
            }],
        })
    }

    /// Whether the program contains no statements (an all-absent
    /// prescription compiles to this).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// Runs the program against `scope`.
    pub fn run(&self, scope: &mut Scope) -> Result<(), CompileError> {
        run_stmts(&self.stmts, scope)?;
        Ok(())
    }
}

fn run_stmts(stmts: &[Stmt], scope: &mut Scope) -> Result<Flow, CompileError> {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { name, expr } => {
                let v = eval(expr, scope)?;
                scope.set(name, v);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if eval(cond, scope)? != 0.0 {
                    then
                } else {
                    otherwise
                };
                if let Flow::Broke = run_stmts(branch, scope)? {
                    return Ok(Flow::Broke);
                }
            }
            Stmt::Switch {
                scrutinee,
                cases,
                default,
            } => {
                let v = eval(scrutinee, scope)?.round() as i64;
                let body = cases
                    .iter()
                    .find(|(label, _)| *label == v)
                    .map_or(default.as_slice(), |(_, body)| body.as_slice());
                // `break` inside a case ends the switch, not the program.
                let _ = run_stmts(body, scope)?;
            }
            Stmt::Break => return Ok(Flow::Broke),
        }
    }
    Ok(Flow::Normal)
}

fn eval(expr: &Expr, scope: &Scope) -> Result<f64, CompileError> {
    match expr {
        Expr::Num(n) => Ok(*n),
        Expr::Var(name) => scope
            .get(name)
            .ok_or_else(|| CompileError::UnboundVariable { name: name.clone() }),
        Expr::Unary { op, rhs } => {
            let v = eval(rhs, scope)?;
            Ok(match op {
                UnaryOp::Neg => -v,
                UnaryOp::Not => f64::from(v == 0.0),
            })
        }
        Expr::Binary { op, lhs, rhs } => {
            // Short-circuit the boolean operators.
            match op {
                BinOp::And => {
                    return Ok(if eval(lhs, scope)? != 0.0 {
                        f64::from(eval(rhs, scope)? != 0.0)
                    } else {
                        0.0
                    });
                }
                BinOp::Or => {
                    return Ok(if eval(lhs, scope)? != 0.0 {
                        1.0
                    } else {
                        f64::from(eval(rhs, scope)? != 0.0)
                    });
                }
                _ => {}
            }
            let a = eval(lhs, scope)?;
            let b = eval(rhs, scope)?;
            Ok(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                BinOp::Lt => f64::from(a < b),
                BinOp::Le => f64::from(a <= b),
                BinOp::Gt => f64::from(a > b),
                BinOp::Ge => f64::from(a >= b),
                BinOp::Eq => f64::from(a == b),
                BinOp::Ne => f64::from(a != b),
                BinOp::And | BinOp::Or => unreachable!("short-circuited above"),
            })
        }
        Expr::Call { name, args, line } => {
            let argv: Vec<f64> = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<_, _>>()?;
            call(name, &argv, *line)
        }
    }
}

fn call(name: &str, args: &[f64], line: u32) -> Result<f64, CompileError> {
    let arity = |n: usize| -> Result<(), CompileError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(CompileError::BadArity {
                name: name.to_string(),
                expected: n,
                got: args.len(),
                line,
            })
        }
    };
    match name {
        "sin" => arity(1).map(|()| args[0].sin()),
        "cos" => arity(1).map(|()| args[0].cos()),
        "tan" => arity(1).map(|()| args[0].tan()),
        "asin" => arity(1).map(|()| args[0].asin()),
        "acos" => arity(1).map(|()| args[0].acos()),
        "atan" => arity(1).map(|()| args[0].atan()),
        "atan2" => arity(2).map(|()| args[0].atan2(args[1])),
        "sqrt" => arity(1).map(|()| args[0].sqrt()),
        "cbrt" => arity(1).map(|()| args[0].cbrt()),
        "abs" => arity(1).map(|()| args[0].abs()),
        "exp" => arity(1).map(|()| args[0].exp()),
        "log" => arity(1).map(|()| args[0].ln()),
        "floor" => arity(1).map(|()| args[0].floor()),
        "ceil" => arity(1).map(|()| args[0].ceil()),
        "round" => arity(1).map(|()| args[0].round()),
        "sign" => arity(1).map(|()| {
            if args[0] == 0.0 {
                0.0
            } else {
                args[0].signum()
            }
        }),
        "min" => arity(2).map(|()| args[0].min(args[1])),
        "max" => arity(2).map(|()| args[0].max(args[1])),
        "pow" => arity(2).map(|()| args[0].powf(args[1])),
        "clamp" => arity(3).map(|()| args[0].clamp(args[1], args[2])),
        _ => Err(CompileError::UnknownFunction {
            name: name.to_string(),
            line,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn runs_prescription_switch() {
        let src = "switch (family) { case 2: { vX = -sin(t); vY = 0; break; } }";
        let prog = Program::compile(src).unwrap();

        let mut scope = Scope::new();
        scope.set("family", 2.0);
        scope.set("t", std::f64::consts::FRAC_PI_2);
        scope.set("vX", 7.0);
        scope.set("vY", 7.0);
        prog.run(&mut scope).unwrap();
        assert_relative_eq!(scope.get("vX").unwrap(), -1.0, epsilon = 1e-12);
        assert_relative_eq!(scope.get("vY").unwrap(), 0.0);

        // A family with no case leaves the seeds untouched.
        let mut other = Scope::new();
        other.set("family", 5.0);
        other.set("t", 0.0);
        other.set("vX", 7.0);
        prog.run(&mut other).unwrap();
        assert_relative_eq!(other.get("vX").unwrap(), 7.0);
    }

    #[test]
    fn runs_family_change_chain() {
        let src = "if (family == 1) { changed = Z < 0.05; if (changed) { newFamily = 2; } }";
        let prog = Program::compile(src).unwrap();

        let mut scope = Scope::new();
        scope.set("family", 1.0);
        scope.set("newFamily", 1.0);
        scope.set("Z", 0.01);
        prog.run(&mut scope).unwrap();
        assert_relative_eq!(scope.get("newFamily").unwrap(), 2.0);

        let mut high = Scope::new();
        high.set("family", 1.0);
        high.set("newFamily", 1.0);
        high.set("Z", 0.5);
        prog.run(&mut high).unwrap();
        assert_relative_eq!(high.get("newFamily").unwrap(), 1.0);
    }

    #[test]
    fn unbound_variable_is_reported() {
        let prog = Program::compile("x = y + 1;").unwrap();
        let mut scope = Scope::new();
        assert!(matches!(
            prog.run(&mut scope),
            Err(CompileError::UnboundVariable { .. })
        ));
    }

    #[test]
    fn expression_program_assigns_value() {
        let prog = Program::compile_expression("max(X, Y) * 2").unwrap();
        let mut scope = Scope::new();
        scope.set("X", 1.5);
        scope.set("Y", -3.0);
        prog.run(&mut scope).unwrap();
        assert_relative_eq!(scope.get("value").unwrap(), 3.0);
    }
}
