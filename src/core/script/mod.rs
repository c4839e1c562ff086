//! Expression sublanguage host.
//!
//! Every computed value in a story (conditions, assignments, interpolation,
//! directive and jump arguments) goes through a `ScriptHost`. The default
//! `Interpreter` implements a small dynamically typed language: arithmetic,
//! comparisons, literals, indexing and slicing, attribute and method access
//! on registered host objects, and list/dict comprehensions. Nothing in it
//! can reach the filesystem, network or processes.

pub mod builtins;
pub mod eval;
pub mod format;
pub mod lexer;
pub mod parser;

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::core::scope::Scope;
use crate::schema::value::Value;
use parser::{Expr, Stmt};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error at column {column}: {message}")]
    Syntax { message: String, column: usize },

    #[error("name '{0}' is not defined")]
    UndefinedName(String),

    #[error("'{type_name}' object has no attribute '{attr}'")]
    Attribute { type_name: String, attr: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,

    /// Raised by host functions or host object methods.
    #[error("{0}")]
    Host(String),

    #[error("invalid format spec '{0}'")]
    Format(String),
}

impl EvalError {
    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }
}

/// Pluggable evaluator. The compiler uses the `check_*` methods to reject
/// malformed fragments before a story ever runs.
pub trait ScriptHost: Send + Sync {
    fn check_expression(&self, source: &str) -> Result<(), EvalError>;

    /// Accepts assignments (`a.b[0] += 1`) as well as bare expressions.
    fn check_statement(&self, source: &str) -> Result<(), EvalError>;

    fn evaluate(&self, source: &str, scope: &mut Scope<'_>) -> Result<Value, EvalError>;

    fn execute(&self, source: &str, scope: &mut Scope<'_>) -> Result<(), EvalError>;
}

/// Default tree-walking interpreter with a parse cache.
#[derive(Debug, Default)]
pub struct Interpreter {
    expressions: Mutex<FxHashMap<String, Arc<Expr>>>,
    statements: Mutex<FxHashMap<String, Arc<Stmt>>>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    fn expression(&self, source: &str) -> Result<Arc<Expr>, EvalError> {
        if let Ok(cache) = self.expressions.lock() {
            if let Some(expr) = cache.get(source) {
                return Ok(Arc::clone(expr));
            }
        }
        let expr = Arc::new(parser::parse_expression(source)?);
        if let Ok(mut cache) = self.expressions.lock() {
            cache.insert(source.to_string(), Arc::clone(&expr));
        }
        Ok(expr)
    }

    fn statement(&self, source: &str) -> Result<Arc<Stmt>, EvalError> {
        if let Ok(cache) = self.statements.lock() {
            if let Some(stmt) = cache.get(source) {
                return Ok(Arc::clone(stmt));
            }
        }
        let stmt = Arc::new(parser::parse_statement(source)?);
        if let Ok(mut cache) = self.statements.lock() {
            cache.insert(source.to_string(), Arc::clone(&stmt));
        }
        Ok(stmt)
    }
}

impl ScriptHost for Interpreter {
    fn check_expression(&self, source: &str) -> Result<(), EvalError> {
        self.expression(source).map(|_| ())
    }

    fn check_statement(&self, source: &str) -> Result<(), EvalError> {
        self.statement(source).map(|_| ())
    }

    fn evaluate(&self, source: &str, scope: &mut Scope<'_>) -> Result<Value, EvalError> {
        let expr = self.expression(source)?;
        eval::eval_expr(&expr, scope)
    }

    fn execute(&self, source: &str, scope: &mut Scope<'_>) -> Result<(), EvalError> {
        let stmt = self.statement(source)?;
        eval::exec_stmt(&stmt, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::Bindings;
    use crate::schema::value::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn evaluate_and_execute_through_trait_object() {
        let host: Box<dyn ScriptHost> = Box::new(Interpreter::new());
        let mut vars = VarMap::new();
        let mut rng = StdRng::seed_from_u64(7);
        let bindings = Bindings::default();
        let mut scope = Scope::owned(&mut vars, VarMap::new(), &mut rng, &bindings);

        host.execute("gold = 10", &mut scope).unwrap();
        host.execute("gold += 5", &mut scope).unwrap();
        assert_eq!(host.evaluate("gold * 2", &mut scope).unwrap(), Value::Int(30));
        drop(scope);
        assert_eq!(vars.get("gold"), Some(&Value::Int(15)));
    }

    #[test]
    fn checks_reject_malformed_fragments() {
        let host = Interpreter::new();
        assert!(host.check_expression("a ==").is_err());
        assert!(host.check_expression("a == b").is_ok());
        assert!(host.check_statement("x[0] = 1").is_ok());
        assert!(host.check_statement("f() = 1").is_err());
    }

    #[test]
    fn parse_cache_is_reused() {
        let host = Interpreter::new();
        host.check_expression("1 + 1").unwrap();
        host.check_expression("1 + 1").unwrap();
        assert_eq!(host.expressions.lock().unwrap().len(), 1);
    }
}
