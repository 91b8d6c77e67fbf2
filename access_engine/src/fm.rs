// Function map: the named functions available to matcher expressions.

use std::sync::OnceLock;

use matchexpr::{FunctionRegistry, NativeFunction};
use parking_lot::RwLock;

use crate::functions;

fn global_registry() -> &'static RwLock<FunctionRegistry> {
    static GLOBAL: OnceLock<RwLock<FunctionRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(FunctionRegistry::new()))
}

/// Registers a function for every model loaded afterwards. Custom matching
/// functions must be registered before the model text referencing them is
/// loaded, otherwise matcher compilation fails.
pub fn set_function(name: impl Into<String>, function: NativeFunction) {
    global_registry().write().set(name, function);
}

/// Named mapping from function name to callable, owned by a model.
#[derive(Debug, Clone, Default)]
pub struct FunctionMap {
    registry: FunctionRegistry,
}

impl FunctionMap {
    /// An empty function map.
    pub fn new() -> Self {
        FunctionMap {
            registry: FunctionRegistry::new(),
        }
    }

    /// A function map with all built-in operators plus every globally
    /// registered function.
    pub fn default_function_map() -> Self {
        let mut fm = FunctionMap::new();

        fm.set_function("keyMatch", functions::wrap_matching_fn("keyMatch", functions::key_match));
        fm.set_function("keyGet", functions::key_get_fn());
        fm.set_function(
            "keyMatch2",
            functions::wrap_matching_fn_err("keyMatch2", functions::key_match2),
        );
        fm.set_function("keyGet2", functions::key_get2_fn());
        fm.set_function(
            "keyMatch3",
            functions::wrap_matching_fn_err("keyMatch3", functions::key_match3),
        );
        fm.set_function(
            "keyMatch4",
            functions::wrap_matching_fn_err("keyMatch4", functions::key_match4),
        );
        fm.set_function(
            "keyMatch5",
            functions::wrap_matching_fn_err("keyMatch5", functions::key_match5),
        );
        fm.set_function(
            "pathMatch",
            functions::wrap_matching_fn("pathMatch", functions::path_match),
        );
        fm.set_function(
            "pathMatch2",
            functions::wrap_matching_fn("pathMatch2", functions::path_match2),
        );
        fm.set_function(
            "regexMatch",
            functions::wrap_matching_fn_err("regexMatch", functions::regex_match),
        );
        fm.set_function(
            "ipMatch",
            functions::wrap_matching_fn_err("ipMatch", functions::ip_match),
        );
        fm.set_function(
            "globMatch",
            functions::wrap_matching_fn_err("globMatch", functions::glob_match),
        );

        fm.registry.merge(&global_registry().read());
        fm
    }

    pub fn set_function(&mut self, name: impl Into<String>, function: NativeFunction) {
        self.registry.set(name, function);
    }

    pub fn remove_function(&mut self, name: &str) -> bool {
        self.registry.remove(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// The registry handed to the expression evaluator.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchexpr::Value;
    use std::sync::Arc;

    #[test]
    fn default_map_has_builtins() {
        let fm = FunctionMap::default_function_map();
        for name in [
            "keyMatch",
            "keyMatch2",
            "keyMatch3",
            "keyMatch4",
            "keyMatch5",
            "keyGet",
            "keyGet2",
            "pathMatch",
            "pathMatch2",
            "regexMatch",
            "ipMatch",
            "globMatch",
        ] {
            assert!(fm.has_function(name), "missing builtin {}", name);
        }
    }

    #[test]
    fn global_functions_flow_into_new_maps() {
        set_function(
            "alwaysTrue",
            Arc::new(|_args: &[Value]| Ok(Value::Bool(true))),
        );
        let fm = FunctionMap::default_function_map();
        assert!(fm.has_function("alwaysTrue"));
    }
}
