#![warn(missing_docs)]

//! # Archflow Expression
//!
//! The guard expression language used on workflow connections: boolean
//! expressions over dotted context paths, with literals, comparisons,
//! `&&`/`||`/`!` and parentheses.
//!
//! ```
//! use archflow_expression::{evaluate_guard, MapResolver};
//! use serde_json::json;
//!
//! let mut ctx = serde_json::Map::new();
//! ctx.insert("step.A.output".into(), json!({"score": 8}));
//! let resolver = MapResolver::new(&ctx);
//!
//! assert!(evaluate_guard("step.A.output.score >= 5", &resolver).unwrap());
//! assert!(!evaluate_guard("step.A.output.score > 100", &resolver).unwrap());
//! ```
//!
//! The engine treats a malformed guard (parse error, unknown path, type
//! error) as `false` and logs it; this crate only reports the error.

pub mod ast;
pub mod eval;
pub mod parser;

pub use ast::{BinaryOp, Expr};
pub use eval::{MapResolver, PathResolver, evaluate, evaluate_guard, truthy};
pub use parser::parse;

/// Error raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    /// The source text is not a valid expression.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset of the failure.
        offset: usize,
        /// What went wrong.
        message: String,
    },
    /// A referenced path is absent from the context.
    #[error("unknown context path: {0}")]
    UnknownPath(String),
    /// The operands do not support the requested operation.
    #[error("type error: {0}")]
    Type(String),
    /// Expression nesting exceeded the evaluator's depth cap.
    #[error("expression too deeply nested")]
    TooDeep,
}
