//! Expression tokenizer, parser and evaluator for access-control matchers.
//!
//! The engine treats this crate as an embedded expression library with a
//! small, fixed set of entry points:
//!
//! - [`tokenize`] / [`render_tokens`] expose the raw token stream so the
//!   matcher compiler can fold boolean expressions into stages.
//! - [`Program`] compiles a source string against a [`FunctionRegistry`] and
//!   evaluates it under a [`Params`] object inside an [`EvalEnv`].
//! - [`Value`] is the runtime value union; structured request attributes ride
//!   in its JSON arm.
//!
//! The `eval(<expr>)` special form re-parses its argument in the same
//! environment, with a per-evaluation compile cache and a recursion bound.

pub mod error;
pub mod eval;
pub mod functions;
pub mod parser;
pub mod token;
pub mod value;

pub use error::Error;
pub use eval::{EvalEnv, NoParams, Params, Program};
pub use functions::{FunctionRegistry, NativeFunction};
pub use parser::{BinaryOp, Expr, UnaryOp};
pub use token::{render_tokens, tokenize, Token, TokenKind};
pub use value::Value;
