// Role-inheritance graphs with pattern-matched edges and optional domain
// partitioning.

mod domain_manager;
mod role_manager;
mod role_policy;

pub use domain_manager::DomainManager;
pub use role_manager::DefaultRoleManager;
pub use role_policy::RolePolicy;

use std::sync::Arc;

use matchexpr::{Error as ExprError, NativeFunction, Value};

use crate::functions::NameMatcher;

/// Default bound for reachability queries.
pub const DEFAULT_MAX_HIERARCHY: usize = 10;

/// The role-inheritance graph contract, for both plain and domain-qualified
/// role families. Operations never fail for unknown names (nodes are created
/// on demand); booleans report whether anything changed.
pub trait RoleManager: Send + Sync {
    /// Drops all stored data.
    fn clear(&self);

    /// Links `name1` to inherit `name2`. False when the link already existed.
    fn add_link(&self, name1: &str, name2: &str, domains: &[&str]) -> bool;

    /// Removes the inheritance link. False when it did not exist.
    fn delete_link(&self, name1: &str, name2: &str, domains: &[&str]) -> bool;

    /// Reachability within the configured hierarchy depth.
    fn has_link(&self, name1: &str, name2: &str, domains: &[&str]) -> bool;

    /// Roles `name` inherits, one hop away.
    fn get_roles(&self, name: &str, domains: &[&str]) -> Vec<String>;

    /// Users inheriting `name`, one hop away.
    fn get_users(&self, name: &str, domains: &[&str]) -> Vec<String>;

    /// Enumerates authored (non-mirrored) links; true continues.
    fn range(&self, f: &mut dyn FnMut(&str, &str, &[&str]) -> bool);

    /// Enables pattern-matched role names; rebuilds existing links.
    fn set_matcher(&self, matcher: Arc<dyn NameMatcher>);

    /// Enables pattern-matched domain keys.
    fn set_domain_matcher(&self, matcher: Arc<dyn NameMatcher>);
}

/// Builds the expression function backing a role definition: `g(a, b)` or
/// `g(a, b, domain)` answers reachability in the definition's graph.
pub fn generate_g_function(key: &str, rm: Arc<dyn RoleManager>) -> NativeFunction {
    let key = key.to_string();
    Arc::new(move |args: &[Value]| {
        if args.len() != 2 && args.len() != 3 {
            return Err(ExprError::function(
                &key,
                format!("expected 2 or 3 arguments, got {}", args.len()),
            ));
        }
        let mut strs = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Value::Str(s) => strs.push(s.as_str()),
                _ => return Err(ExprError::function(&key, "argument must be a string")),
            }
        }
        let linked = match strs.len() {
            2 => rm.has_link(strs[0], strs[1], &[]),
            _ => rm.has_link(strs[0], strs[1], &strs[2..]),
        };
        Ok(Value::Bool(linked))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g_function_answers_reachability() {
        let rm: Arc<dyn RoleManager> = Arc::new(DefaultRoleManager::new(DEFAULT_MAX_HIERARCHY));
        rm.add_link("alice", "admin", &[]);
        let g = generate_g_function("g", Arc::clone(&rm));

        let res = g(&[Value::from("alice"), Value::from("admin")]).unwrap();
        assert_eq!(res, Value::Bool(true));
        let res = g(&[Value::from("bob"), Value::from("admin")]).unwrap();
        assert_eq!(res, Value::Bool(false));

        assert!(g(&[Value::from("alice")]).is_err());
        assert!(g(&[Value::from("alice"), Value::Num(1.0)]).is_err());
    }
}
