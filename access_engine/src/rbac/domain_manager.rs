// Domain-qualified role management: one role graph per domain key, with
// optional pattern domains mirrored into the concrete graphs they match.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::cache::{SyncLruCache, DEFAULT_CACHE_SIZE};
use crate::functions::NameMatcher;

use super::{DefaultRoleManager, RoleManager};

/// Graph key used when no domain argument is given.
const DEFAULT_DOMAIN: &str = "__default__";

pub struct DomainManager {
    managers: DashMap<String, Arc<DefaultRoleManager>>,
    max_hierarchy: usize,
    matcher: RwLock<Option<Arc<dyn NameMatcher>>>,
    domain_matcher: RwLock<Option<Arc<dyn NameMatcher>>>,
    domain_cache: SyncLruCache<String, bool>,
}

impl DomainManager {
    pub fn new(max_hierarchy: usize) -> DomainManager {
        DomainManager {
            managers: DashMap::new(),
            max_hierarchy,
            matcher: RwLock::new(None),
            domain_matcher: RwLock::new(None),
            domain_cache: SyncLruCache::new(DEFAULT_CACHE_SIZE),
        }
    }

    fn domain_of<'a>(domains: &'a [&'a str]) -> &'a str {
        domains.first().copied().unwrap_or(DEFAULT_DOMAIN)
    }

    fn domain_match(&self, s: &str, pattern: &str) -> bool {
        let matcher = match self.domain_matcher.read().clone() {
            Some(m) => m,
            None => return false,
        };
        let key = format!("{}$${}", s, pattern);
        if let Some(hit) = self.domain_cache.get(&key) {
            return hit;
        }
        let matched = matcher.matches(s, pattern);
        self.domain_cache.put(key, matched);
        matched
    }

    /// Loads or creates the graph of a domain. A freshly created graph pulls
    /// mirrored copies of every pattern domain it matches, so mirroring holds
    /// regardless of insertion order.
    fn get_manager(&self, domain: &str, store: bool) -> Arc<DefaultRoleManager> {
        use dashmap::mapref::entry::Entry;

        if let Some(rm) = self.managers.get(domain) {
            return Arc::clone(&rm);
        }

        let rm = Arc::new(DefaultRoleManager::new(self.max_hierarchy));
        if let Some(m) = self.matcher.read().clone() {
            rm.set_matcher(m);
        }
        if let Some(m) = self.domain_matcher.read().clone() {
            rm.set_domain_matcher(m);
        }

        let rm = if store {
            match self.managers.entry(domain.to_string()) {
                Entry::Occupied(e) => return Arc::clone(e.get()),
                Entry::Vacant(v) => {
                    v.insert(Arc::clone(&rm));
                    rm
                }
            }
        } else {
            rm
        };

        if self.domain_matcher.read().is_some() {
            let patterns: Vec<(String, Arc<DefaultRoleManager>)> = self
                .managers
                .iter()
                .filter(|e| e.key() != domain)
                .map(|e| (e.key().clone(), Arc::clone(e.value())))
                .collect();
            for (domain2, rm2) in patterns {
                if self.domain_match(domain, &domain2) {
                    rm.mirror_from(&rm2);
                }
            }
        }

        rm
    }

    /// Mirrors a mutation of a (possibly pattern) domain into every other
    /// stored graph whose key matches it.
    fn range_affected(&self, domain: &str, f: impl Fn(&DefaultRoleManager)) {
        if self.domain_matcher.read().is_none() {
            return;
        }
        let affected: Vec<(String, Arc<DefaultRoleManager>)> = self
            .managers
            .iter()
            .filter(|e| e.key() != domain)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (domain2, rm2) in affected {
            if self.domain_match(&domain2, domain) {
                f(&rm2);
            }
        }
    }

    fn rebuild(&self) {
        let mut links: Vec<(String, String, Vec<String>)> = Vec::new();
        self.range(&mut |n1, n2, domains| {
            links.push((
                n1.to_string(),
                n2.to_string(),
                domains.iter().map(|d| d.to_string()).collect(),
            ));
            true
        });

        self.managers.clear();
        self.domain_cache.clear();
        for (n1, n2, domains) in links {
            let domains: Vec<&str> = domains.iter().map(String::as_str).collect();
            self.add_link(&n1, &n2, &domains);
        }
    }

    /// Domains in which `name` participates in at least one link.
    pub fn get_domains(&self, name: &str) -> Vec<String> {
        let mut res: Vec<String> = self
            .managers
            .iter()
            .filter(|e| e.value().has_active_role(name))
            .map(|e| e.key().clone())
            .filter(|d| d != DEFAULT_DOMAIN)
            .collect();
        res.sort();
        res
    }

    /// Every domain with a stored graph.
    pub fn get_all_domains(&self) -> Vec<String> {
        let mut res: Vec<String> = self
            .managers
            .iter()
            .map(|e| e.key().clone())
            .filter(|d| d != DEFAULT_DOMAIN)
            .collect();
        res.sort();
        res
    }
}

impl RoleManager for DomainManager {
    fn clear(&self) {
        self.managers.clear();
        self.domain_cache.clear();
    }

    fn add_link(&self, name1: &str, name2: &str, domains: &[&str]) -> bool {
        let domain = Self::domain_of(domains);
        let rm = self.get_manager(domain, true);
        let added = rm.add_link_flagged(name1, name2, false);

        self.range_affected(domain, |rm2| {
            rm2.add_link_flagged(name1, name2, true);
        });
        added
    }

    fn delete_link(&self, name1: &str, name2: &str, domains: &[&str]) -> bool {
        let domain = Self::domain_of(domains);
        let rm = self.get_manager(domain, true);
        let removed = rm.delete_link_flagged(name1, name2);

        self.range_affected(domain, |rm2| {
            rm2.delete_link_flagged(name1, name2);
        });
        removed
    }

    fn has_link(&self, name1: &str, name2: &str, domains: &[&str]) -> bool {
        let rm = self.get_manager(Self::domain_of(domains), false);
        rm.has_link(name1, name2, &[])
    }

    fn get_roles(&self, name: &str, domains: &[&str]) -> Vec<String> {
        let rm = self.get_manager(Self::domain_of(domains), false);
        rm.get_roles(name, &[])
    }

    fn get_users(&self, name: &str, domains: &[&str]) -> Vec<String> {
        let rm = self.get_manager(Self::domain_of(domains), false);
        rm.get_users(name, &[])
    }

    fn range(&self, f: &mut dyn FnMut(&str, &str, &[&str]) -> bool) {
        let snapshot: Vec<(String, Arc<DefaultRoleManager>)> = self
            .managers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (domain, rm) in snapshot {
            let mut keep_going = true;
            rm.range(&mut |n1, n2, _| {
                keep_going = if domain == DEFAULT_DOMAIN {
                    f(n1, n2, &[])
                } else {
                    f(n1, n2, &[&domain])
                };
                keep_going
            });
            if !keep_going {
                return;
            }
        }
    }

    fn set_matcher(&self, matcher: Arc<dyn NameMatcher>) {
        *self.matcher.write() = Some(Arc::clone(&matcher));
        let snapshot: Vec<Arc<DefaultRoleManager>> =
            self.managers.iter().map(|e| Arc::clone(e.value())).collect();
        for rm in snapshot {
            rm.set_matcher(Arc::clone(&matcher));
        }
    }

    fn set_domain_matcher(&self, matcher: Arc<dyn NameMatcher>) {
        *self.domain_matcher.write() = Some(Arc::clone(&matcher));
        let snapshot: Vec<Arc<DefaultRoleManager>> =
            self.managers.iter().map(|e| Arc::clone(e.value())).collect();
        for rm in snapshot {
            rm.set_domain_matcher(Arc::clone(&matcher));
        }
        self.rebuild();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions;

    fn dm() -> DomainManager {
        DomainManager::new(super::super::DEFAULT_MAX_HIERARCHY)
    }

    #[test]
    fn domains_partition_the_graph() {
        let dm = dm();
        dm.add_link("alice", "admin", &["domain1"]);
        dm.add_link("bob", "admin", &["domain2"]);

        assert!(dm.has_link("alice", "admin", &["domain1"]));
        assert!(!dm.has_link("alice", "admin", &["domain2"]));
        assert!(dm.has_link("bob", "admin", &["domain2"]));
    }

    #[test]
    fn add_delete_is_idempotent_per_domain() {
        let dm = dm();
        assert!(dm.add_link("alice", "admin", &["d1"]));
        assert!(!dm.add_link("alice", "admin", &["d1"]));
        assert!(dm.delete_link("alice", "admin", &["d1"]));
        assert!(!dm.delete_link("alice", "admin", &["d1"]));
    }

    #[test]
    fn missing_domain_argument_uses_default_graph() {
        let dm = dm();
        dm.add_link("alice", "admin", &[]);
        assert!(dm.has_link("alice", "admin", &[]));
        assert!(!dm.has_link("alice", "admin", &["domain1"]));
    }

    #[test]
    fn pattern_domain_mirrors_into_existing_concrete() {
        let dm = dm();
        dm.set_domain_matcher(functions::path_name_matcher());

        dm.add_link("bob", "admin", &["domain1"]);
        dm.add_link("alice", "admin", &["*"]);

        assert!(dm.has_link("alice", "admin", &["domain1"]));
        assert!(dm.has_link("bob", "admin", &["domain1"]));
        assert!(!dm.has_link("bob", "admin", &["domain2"]));
    }

    #[test]
    fn pattern_domain_reaches_later_concrete_domains() {
        let dm = dm();
        dm.set_domain_matcher(functions::path_name_matcher());

        dm.add_link("alice", "admin", &["*"]);
        // domain2's graph is created on first use, after the pattern insert
        assert!(dm.has_link("alice", "admin", &["domain2"]));
    }

    #[test]
    fn mirrored_edges_do_not_leak_from_range() {
        let dm = dm();
        dm.set_domain_matcher(functions::path_name_matcher());

        dm.add_link("bob", "admin", &["domain1"]);
        dm.add_link("alice", "admin", &["*"]);

        let mut authored = Vec::new();
        dm.range(&mut |n1, n2, domains| {
            authored.push(format!("{},{},{}", n1, n2, domains.join("/")));
            true
        });
        authored.sort();
        assert_eq!(
            authored,
            vec!["alice,admin,*".to_string(), "bob,admin,domain1".to_string()]
        );
    }

    #[test]
    fn set_domain_matcher_rebuilds_existing_links() {
        let dm = dm();
        dm.add_link("bob", "admin", &["domain1"]);
        dm.add_link("alice", "admin", &["*"]);
        assert!(!dm.has_link("alice", "admin", &["domain1"]));

        dm.set_domain_matcher(functions::path_name_matcher());
        assert!(dm.has_link("alice", "admin", &["domain1"]));
    }

    #[test]
    fn domain_listing() {
        let dm = dm();
        dm.add_link("alice", "admin", &["domain1"]);
        dm.add_link("bob", "admin", &["domain2"]);

        assert_eq!(dm.get_all_domains(), vec!["domain1", "domain2"]);
        assert_eq!(dm.get_domains("alice"), vec!["domain1"]);
    }
}
