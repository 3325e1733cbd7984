//! Compilation error type.

use thiserror::Error;

/// Errors from lexing, parsing, or evaluating kernel source.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    /// A character the lexer does not understand.
    #[error("unexpected character '{ch}' at line {line}, column {col}")]
    UnexpectedChar {
        /// The offending character.
        ch: char,
        /// 1-based line number in the (specialized) source.
        line: u32,
        /// 1-based column.
        col: u32,
    },

    /// A malformed numeric literal.
    #[error("malformed number '{text}' at line {line}")]
    BadNumber {
        /// The literal as written.
        text: String,
        /// 1-based line number.
        line: u32,
    },

    /// The parser expected something else.
    #[error("parse error at line {line}: expected {expected}, found {found}")]
    Expected {
        /// What the grammar required.
        expected: &'static str,
        /// What was actually there.
        found: String,
        /// 1-based line number.
        line: u32,
    },

    /// Source ended mid-construct.
    #[error("unexpected end of kernel source (expected {expected})")]
    UnexpectedEof {
        /// What the grammar still required.
        expected: &'static str,
    },

    /// A function name the evaluator does not provide.
    #[error("unknown function '{name}' at line {line}")]
    UnknownFunction {
        /// The function name as written.
        name: String,
        /// 1-based line number.
        line: u32,
    },

    /// Wrong number of call arguments.
    #[error("function '{name}' takes {expected} argument(s), got {got} (line {line})")]
    BadArity {
        /// The function name.
        name: String,
        /// Required argument count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
        /// 1-based line number.
        line: u32,
    },

    /// A variable read that no binding satisfies.
    #[error("unbound variable '{name}' in kernel evaluation")]
    UnboundVariable {
        /// The variable name.
        name: String,
    },
}
