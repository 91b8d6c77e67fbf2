// Compilation and evaluation of expressions.
//
// A Program is an immutable compiled expression; evaluation binds it to a
// parameter object and an environment carrying the function registry. The
// `eval(<expr>)` special form compiles its argument lazily against the same
// environment, with a per-evaluation compile cache and a recursion bound.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::error::Error;
use crate::functions::FunctionRegistry;
use crate::parser::{parse, BinaryOp, Expr, UnaryOp};
use crate::token::tokenize;
use crate::value::Value;

/// Maximum nesting of `eval()` calls. The inner expression may itself call
/// `eval`, so an attacker-supplied rule could otherwise recurse unboundedly.
const MAX_EVAL_DEPTH: usize = 32;

/// Answers parameter lookups by name during evaluation.
pub trait Params {
    fn get(&self, name: &str) -> Result<Value, Error>;
}

/// Parameter object with no entries; every lookup fails.
pub struct NoParams;

impl Params for NoParams {
    fn get(&self, name: &str) -> Result<Value, Error> {
        Err(Error::UnknownParameter(name.to_string()))
    }
}

type Rewriter<'a> = &'a (dyn Fn(&str) -> String + Sync);

/// Per-evaluation environment: the registry, an optional source rewriter for
/// `eval()` arguments, the nested-eval compile cache and the depth guard.
pub struct EvalEnv<'a> {
    functions: &'a FunctionRegistry,
    rewriter: Option<Rewriter<'a>>,
    cache: RefCell<HashMap<String, Rc<Program>>>,
    depth: Cell<usize>,
}

impl<'a> EvalEnv<'a> {
    pub fn new(functions: &'a FunctionRegistry) -> Self {
        EvalEnv {
            functions,
            rewriter: None,
            cache: RefCell::new(HashMap::new()),
            depth: Cell::new(0),
        }
    }

    /// Installs a rewrite applied to `eval()` argument strings before they
    /// are compiled, e.g. dotted-reference normalization.
    pub fn with_rewriter(mut self, rewriter: Rewriter<'a>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn functions(&self) -> &FunctionRegistry {
        self.functions
    }
}

/// A compiled expression, reusable across evaluations.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    ast: Expr,
}

impl Program {
    /// Parses and statically validates `source`. Calls to names missing from
    /// the registry are rejected here rather than at evaluation time.
    pub fn compile(source: &str, functions: &FunctionRegistry) -> Result<Program, Error> {
        let tokens = tokenize(source)?;
        let ast = parse(&tokens)?;
        validate_calls(&ast, functions)?;
        Ok(Program {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, params: &dyn Params, env: &EvalEnv) -> Result<Value, Error> {
        eval_expr(&self.ast, params, env)
    }

    /// Evaluates and requires a boolean result, as matchers do.
    pub fn eval_bool(&self, params: &dyn Params, env: &EvalEnv) -> Result<bool, Error> {
        self.eval(params, env)?.as_bool()
    }
}

fn validate_calls(expr: &Expr, functions: &FunctionRegistry) -> Result<(), Error> {
    match expr {
        Expr::Call { name, args } => {
            if name != "eval" && !functions.contains(name) {
                return Err(Error::UnknownFunction(name.clone()));
            }
            if name == "eval" && args.len() != 1 {
                return Err(Error::Arity {
                    function: "eval".to_string(),
                    expected: 1,
                    got: args.len(),
                });
            }
            for arg in args {
                validate_calls(arg, functions)?;
            }
            Ok(())
        }
        Expr::Unary { operand, .. } => validate_calls(operand, functions),
        Expr::Binary { lhs, rhs, .. } => {
            validate_calls(lhs, functions)?;
            validate_calls(rhs, functions)
        }
        Expr::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            validate_calls(cond, functions)?;
            validate_calls(then_branch, functions)?;
            validate_calls(else_branch, functions)
        }
        Expr::Literal(_) | Expr::Param(_) | Expr::Access { .. } => Ok(()),
    }
}

fn eval_expr(expr: &Expr, params: &dyn Params, env: &EvalEnv) -> Result<Value, Error> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Param(name) => params.get(name),
        Expr::Access { base, path } => {
            let mut value = params.get(base)?;
            for segment in path {
                value = value.property(segment)?;
            }
            Ok(value)
        }
        Expr::Unary { op, operand } => {
            let v = eval_expr(operand, params, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.as_bool()?)),
                UnaryOp::Neg => Ok(Value::Num(-v.as_num()?)),
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, params, env),
        Expr::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            if eval_expr(cond, params, env)?.as_bool()? {
                eval_expr(then_branch, params, env)
            } else {
                eval_expr(else_branch, params, env)
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, params, env)?);
            }
            if name == "eval" {
                return eval_special_form(&values, params, env);
            }
            let function = env
                .functions
                .get(name)
                .ok_or_else(|| Error::UnknownFunction(name.clone()))?;
            function(&values)
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    params: &dyn Params,
    env: &EvalEnv,
) -> Result<Value, Error> {
    // logical operators short-circuit
    match op {
        BinaryOp::And => {
            if !eval_expr(lhs, params, env)?.as_bool()? {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(eval_expr(rhs, params, env)?.as_bool()?));
        }
        BinaryOp::Or => {
            if eval_expr(lhs, params, env)?.as_bool()? {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(eval_expr(rhs, params, env)?.as_bool()?));
        }
        _ => {}
    }

    let a = eval_expr(lhs, params, env)?;
    let b = eval_expr(rhs, params, env)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(a == b)),
        BinaryOp::Ne => Ok(Value::Bool(a != b)),
        BinaryOp::Lt => Ok(Value::Bool(a.compare(&b)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(a.compare(&b)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(a.compare(&b)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(a.compare(&b)? != Ordering::Less)),
        BinaryOp::Add => match (&a, &b) {
            (Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{}{}", x, y))),
            _ => Ok(Value::Num(a.as_num()? + b.as_num()?)),
        },
        BinaryOp::Sub => Ok(Value::Num(a.as_num()? - b.as_num()?)),
        BinaryOp::Mul => Ok(Value::Num(a.as_num()? * b.as_num()?)),
        BinaryOp::Div => Ok(Value::Num(a.as_num()? / b.as_num()?)),
        BinaryOp::Mod => Ok(Value::Num(a.as_num()? % b.as_num()?)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

/// `eval(<expr>)`: compile the argument as a fresh expression in the same
/// environment and evaluate it under the same parameter object.
fn eval_special_form(
    args: &[Value],
    params: &dyn Params,
    env: &EvalEnv,
) -> Result<Value, Error> {
    if args.len() != 1 {
        return Err(Error::Arity {
            function: "eval".to_string(),
            expected: 1,
            got: args.len(),
        });
    }
    let raw = args[0].as_str()?;
    let source = match env.rewriter {
        Some(rewrite) => rewrite(raw),
        None => raw.to_string(),
    };

    let program = {
        let mut cache = env.cache.borrow_mut();
        match cache.get(&source) {
            Some(p) => Rc::clone(p),
            None => {
                let compiled = Rc::new(Program::compile(&source, env.functions)?);
                cache.insert(source.clone(), Rc::clone(&compiled));
                compiled
            }
        }
    };

    if env.depth.get() >= MAX_EVAL_DEPTH {
        return Err(Error::Depth);
    }
    env.depth.set(env.depth.get() + 1);
    let result = program.eval(params, env);
    env.depth.set(env.depth.get() - 1);
    result
}
