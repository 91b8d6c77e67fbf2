// Named native functions callable from expressions.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::value::Value;

/// Signature of a function callable from an expression.
pub type NativeFunction = Arc<dyn Fn(&[Value]) -> Result<Value, Error> + Send + Sync>;

/// Named mapping from function name to callable, consulted both at compile
/// time (unknown names are rejected) and at evaluation time.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    fns: HashMap<String, NativeFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry {
            fns: HashMap::new(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, function: NativeFunction) {
        self.fns.insert(name.into(), function);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.fns.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.fns.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fns.keys().map(|k| k.as_str())
    }

    /// Copies every entry of `other` into this registry, overwriting
    /// name collisions.
    pub fn merge(&mut self, other: &FunctionRegistry) {
        for (name, f) in &other.fns {
            self.fns.insert(name.clone(), Arc::clone(f));
        }
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.fns.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}
