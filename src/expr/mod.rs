//! Boolean expression engine.
//!
//! Rule expressions are boolean predicates over a tree of symbol tables
//! (`rmq:latency`, `rules:latency_fail:since`, ...). Compilation parses and
//! scope-checks an expression; evaluation resolves symbols through an
//! [`EvalContext`] so the same compiled form works against metric histories
//! (trigger engine) and candidate assignments (dependency solver).

mod eval;
mod lexer;
mod parser;
mod scope;
mod value;

pub use eval::eval;
pub use parser::{Compiled, Expr, Operand, compile};
pub use scope::{EvalContext, LeafKind, MapContext, SymbolTable};
pub use value::{CmpOp, Value, compare, contains, parse_duration};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExprError {
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Unknown symbol '{path}'")]
    Scope { path: String },

    #[error("Symbol '{path}' absent from evaluation context")]
    Missing { path: String },

    #[error("Cannot compare {lhs} {op} {rhs}")]
    Incomparable {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
}

impl ExprError {
    /// Error kind exposed on the RPC envelope. Type mismatches and absent
    /// symbols both surface as scope errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ExprError::Parse { .. } => "ParseError",
            ExprError::Scope { .. } | ExprError::Missing { .. } | ExprError::Incomparable { .. } => {
                "ScopeError"
            }
        }
    }
}
