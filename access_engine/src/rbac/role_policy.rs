// Role rules as a rule store: a thin view over a role-inheritance graph so
// `g`-family rules share the policy-store contract (events included).

use std::collections::HashMap;
use std::sync::Arc;

use crate::defs::PolicyDef;
use crate::error::Result;
use crate::policy::{Emitter, RuleStore, StoreEvent};
use crate::types::{rule_hash, Rule};

use super::RoleManager;

/// Field names a role family projects through, so matchers can reference
/// `g_user`, `g_role` and `g_domain`.
fn role_args(nargs: usize) -> &'static str {
    if nargs >= 3 {
        "user, role, domain"
    } else {
        "user, role"
    }
}

pub struct RolePolicy {
    rm: Arc<dyn RoleManager>,
    def: PolicyDef,
    emitter: Emitter,
}

impl RolePolicy {
    pub fn new(key: &str, rm: Arc<dyn RoleManager>, nargs: usize) -> RolePolicy {
        RolePolicy {
            rm,
            def: PolicyDef::new(key, role_args(nargs)),
            emitter: Emitter::new(),
        }
    }

    pub fn role_manager(&self) -> &Arc<dyn RoleManager> {
        &self.rm
    }
}

impl RuleStore for RolePolicy {
    fn def(&self) -> &PolicyDef {
        &self.def
    }

    fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    fn len(&self) -> usize {
        let mut n = 0;
        self.rm.range(&mut |_, _, _| {
            n += 1;
            true
        });
        n
    }

    fn range_rules(&self, f: &mut dyn FnMut(&Rule) -> bool) {
        self.rm.range(&mut |name1, name2, domains| {
            let mut rule = vec![name1.to_string(), name2.to_string()];
            rule.extend(domains.iter().map(|d| d.to_string()));
            f(&rule)
        });
    }

    fn add_rule(&self, rule: &[String]) -> bool {
        if rule.len() < 2 {
            return false;
        }
        let domains: Vec<&str> = rule[2..].iter().map(String::as_str).collect();
        let added = self.rm.add_link(&rule[0], &rule[1], &domains);
        if added {
            self.emitter.emit(StoreEvent::RuleAdded, rule);
        }
        added
    }

    fn remove_rule(&self, rule: &[String]) -> bool {
        if rule.len() < 2 {
            return false;
        }
        let domains: Vec<&str> = rule[2..].iter().map(String::as_str).collect();
        let removed = self.rm.delete_link(&rule[0], &rule[1], &domains);
        if removed {
            self.emitter.emit(StoreEvent::RuleRemoved, rule);
        }
        removed
    }

    fn clear(&self) {
        self.rm.clear();
        self.emitter.emit(StoreEvent::Cleared, &[]);
    }

    fn distinct(&self, args: &[&str]) -> Result<Vec<Rule>> {
        let names: Vec<String> = args
            .iter()
            .map(|arg| format!("{}_{}", self.def.key(), arg))
            .collect();
        let mut seen: HashMap<String, Rule> = HashMap::new();
        let mut first_err = None;
        self.range_rules(&mut |rule| match self.def.get_parameters(rule, &names) {
            Ok(projected) => {
                seen.insert(rule_hash(&projected), projected);
                true
            }
            Err(e) => {
                first_err = Some(e);
                false
            }
        });
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(seen.into_values().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{DefaultRoleManager, DomainManager, DEFAULT_MAX_HIERARCHY};
    use crate::types::rule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plain() -> RolePolicy {
        let rm: Arc<dyn RoleManager> = Arc::new(DefaultRoleManager::new(DEFAULT_MAX_HIERARCHY));
        RolePolicy::new("g", rm, 2)
    }

    #[test]
    fn rules_are_edges() {
        let rp = plain();
        assert!(rp.add_rule(&rule(&["alice", "admin"])));
        assert!(!rp.add_rule(&rule(&["alice", "admin"])));
        assert!(rp.role_manager().has_link("alice", "admin", &[]));
        assert_eq!(rp.len(), 1);

        assert!(rp.remove_rule(&rule(&["alice", "admin"])));
        assert!(!rp.remove_rule(&rule(&["alice", "admin"])));
        assert_eq!(rp.len(), 0);
    }

    #[test]
    fn domain_rules_carry_three_fields() {
        let rm: Arc<dyn RoleManager> = Arc::new(DomainManager::new(DEFAULT_MAX_HIERARCHY));
        let rp = RolePolicy::new("g", rm, 3);
        rp.add_rule(&rule(&["alice", "admin", "domain1"]));

        let mut rules = Vec::new();
        rp.range_rules(&mut |r| {
            rules.push(r.clone());
            true
        });
        assert_eq!(rules, vec![rule(&["alice", "admin", "domain1"])]);

        assert_eq!(
            rp.def().get_parameter(&rules[0], "g_domain").unwrap(),
            "domain1"
        );
    }

    #[test]
    fn events_mirror_store_contract() {
        let rp = plain();
        let adds = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&adds);
        rp.emitter().on(
            StoreEvent::RuleAdded,
            Box::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }),
        );

        rp.add_rule(&rule(&["alice", "admin"]));
        rp.add_rule(&rule(&["alice", "admin"]));
        assert_eq!(adds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_projects_fields() {
        let rp = plain();
        rp.add_rule(&rule(&["alice", "admin"]));
        rp.add_rule(&rule(&["bob", "admin"]));

        let mut roles = rp.distinct(&["role"]).unwrap();
        roles.sort();
        assert_eq!(roles, vec![rule(&["admin"])]);
    }
}
