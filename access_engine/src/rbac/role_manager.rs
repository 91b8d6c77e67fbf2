// Single-graph role manager: directed reachability over concurrent maps,
// with optional pattern-matched role names.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;

use crate::cache::{SyncLruCache, DEFAULT_CACHE_SIZE};
use crate::functions::NameMatcher;

use super::RoleManager;

/// One role node. Neighbours are kept as name sets; the manager's role map
/// resolves them, which keeps the graph free of reference cycles.
pub(crate) struct RoleNode {
    name: String,
    /// Roles this one inherits.
    parents: DashSet<String>,
    /// Users pointing at this role.
    children: DashSet<String>,
    /// Concrete names this pattern name matches.
    matched: DashSet<String>,
    /// Pattern names matching this concrete name.
    matched_by: DashSet<String>,
    /// Parents whose edge is a mirrored copy, hidden from enumeration.
    redundant: DashSet<String>,
}

impl RoleNode {
    fn new(name: &str) -> RoleNode {
        RoleNode {
            name: name.to_string(),
            parents: DashSet::new(),
            children: DashSet::new(),
            matched: DashSet::new(),
            matched_by: DashSet::new(),
            redundant: DashSet::new(),
        }
    }

    fn names(set: &DashSet<String>) -> Vec<String> {
        set.iter().map(|n| n.key().clone()).collect()
    }
}

pub struct DefaultRoleManager {
    all_roles: DashMap<String, Arc<RoleNode>>,
    max_hierarchy: usize,
    matcher: RwLock<Option<Arc<dyn NameMatcher>>>,
    domain_matcher: RwLock<Option<Arc<dyn NameMatcher>>>,
    match_cache: SyncLruCache<String, bool>,
}

impl DefaultRoleManager {
    pub fn new(max_hierarchy: usize) -> DefaultRoleManager {
        DefaultRoleManager {
            all_roles: DashMap::new(),
            max_hierarchy,
            matcher: RwLock::new(None),
            domain_matcher: RwLock::new(None),
            match_cache: SyncLruCache::new(DEFAULT_CACHE_SIZE),
        }
    }

    fn node(&self, name: &str) -> Option<Arc<RoleNode>> {
        self.all_roles.get(name).map(|n| Arc::clone(&n))
    }

    fn cached_match(&self, s: &str, pattern: &str, matcher: &Arc<dyn NameMatcher>) -> bool {
        let key = format!("{}$${}", s, pattern);
        if let Some(hit) = self.match_cache.get(&key) {
            return hit;
        }
        let matched = matcher.matches(s, pattern);
        self.match_cache.put(key, matched);
        matched
    }

    /// Loads or creates a role. New nodes are wired into the pattern match
    /// sets in both directions.
    fn get_or_create(&self, name: &str) -> (Arc<RoleNode>, bool) {
        use dashmap::mapref::entry::Entry;

        let (node, created) = match self.all_roles.entry(name.to_string()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(v) => {
                let node = Arc::new(RoleNode::new(name));
                v.insert(Arc::clone(&node));
                (node, true)
            }
        };

        if created {
            if let Some(matcher) = self.matcher.read().clone() {
                let name_is_pattern = matcher.is_pattern(name);
                let others: Vec<(String, Arc<RoleNode>)> = self
                    .all_roles
                    .iter()
                    .filter(|e| e.key() != name)
                    .map(|e| (e.key().clone(), Arc::clone(e.value())))
                    .collect();

                for (name2, node2) in others {
                    if matcher.is_pattern(&name2) && self.cached_match(name, &name2, &matcher) {
                        node2.matched.insert(name.to_string());
                        node.matched_by.insert(name2.clone());
                    }
                    if name_is_pattern && self.cached_match(&name2, name, &matcher) {
                        node.matched.insert(name2.clone());
                        node2.matched_by.insert(name.to_string());
                    }
                }
            }
        }

        (node, created)
    }

    /// Removes a role and unhooks its match links. Used for probe nodes
    /// created by read queries on unknown names.
    fn remove_role(&self, name: &str) {
        if let Some((_, node)) = self.all_roles.remove(name) {
            for matched in RoleNode::names(&node.matched) {
                if let Some(other) = self.node(&matched) {
                    other.matched_by.remove(name);
                }
            }
            for pattern in RoleNode::names(&node.matched_by) {
                if let Some(other) = self.node(&pattern) {
                    other.matched.remove(name);
                }
            }
        }
    }

    /// Out-neighbours for reachability: direct parents, the concrete roles
    /// matched by pattern parents, and the parents of patterns matching this
    /// node. A concrete user inherits whatever its pattern siblings inherit.
    fn out_neighbours(&self, node: &Arc<RoleNode>) -> HashMap<String, Arc<RoleNode>> {
        let mut res = HashMap::new();

        for parent in RoleNode::names(&node.parents) {
            if let Some(p) = self.node(&parent) {
                for matched in RoleNode::names(&p.matched) {
                    if let Some(m) = self.node(&matched) {
                        res.insert(matched, m);
                    }
                }
                res.insert(parent, p);
            }
        }
        for pattern in RoleNode::names(&node.matched_by) {
            if let Some(p) = self.node(&pattern) {
                for parent in RoleNode::names(&p.parents) {
                    if let Some(n) = self.node(&parent) {
                        res.insert(parent, n);
                    }
                }
            }
        }

        res
    }

    /// Users side of [`Self::out_neighbours`].
    fn in_neighbours(&self, node: &Arc<RoleNode>) -> HashMap<String, Arc<RoleNode>> {
        let mut res = HashMap::new();

        for child in RoleNode::names(&node.children) {
            if let Some(c) = self.node(&child) {
                for matched in RoleNode::names(&c.matched) {
                    if let Some(m) = self.node(&matched) {
                        res.insert(matched, m);
                    }
                }
                res.insert(child, c);
            }
        }
        for pattern in RoleNode::names(&node.matched_by) {
            if let Some(p) = self.node(&pattern) {
                for child in RoleNode::names(&p.children) {
                    if let Some(n) = self.node(&child) {
                        res.insert(child, n);
                    }
                }
            }
        }

        res
    }

    /// Adds a link, optionally marking the edge as a mirrored copy.
    pub(crate) fn add_link_flagged(&self, name1: &str, name2: &str, redundant: bool) -> bool {
        let (user, _) = self.get_or_create(name1);
        let (role, _) = self.get_or_create(name2);

        if redundant {
            user.redundant.insert(name2.to_string());
        } else {
            user.redundant.remove(name2);
        }

        if user.parents.contains(name2) {
            return false;
        }
        user.parents.insert(name2.to_string());
        role.children.insert(name1.to_string());
        true
    }

    pub(crate) fn delete_link_flagged(&self, name1: &str, name2: &str) -> bool {
        let (user, _) = self.get_or_create(name1);
        let (role, _) = self.get_or_create(name2);

        user.redundant.remove(name2);
        if user.parents.remove(name2).is_none() {
            return false;
        }
        role.children.remove(name1);
        true
    }

    /// Copies every authored link of `other` into this graph as mirrored
    /// edges.
    pub(crate) fn mirror_from(&self, other: &DefaultRoleManager) {
        other.range(&mut |name1, name2, _| {
            self.add_link_flagged(name1, name2, true);
            true
        });
    }

    /// True when the graph holds a linked node of this name.
    pub(crate) fn has_active_role(&self, name: &str) -> bool {
        match self.node(name) {
            Some(node) => !node.parents.is_empty() || !node.children.is_empty(),
            None => false,
        }
    }

    fn rebuild(&self) {
        let mut links: Vec<(String, String)> = Vec::new();
        self.range(&mut |n1, n2, _| {
            links.push((n1.to_string(), n2.to_string()));
            true
        });
        self.all_roles.clear();
        self.match_cache.clear();
        for (n1, n2) in links {
            self.add_link_flagged(&n1, &n2, false);
        }
    }
}

impl RoleManager for DefaultRoleManager {
    fn clear(&self) {
        self.all_roles.clear();
        self.match_cache.clear();
    }

    fn add_link(&self, name1: &str, name2: &str, _domains: &[&str]) -> bool {
        self.add_link_flagged(name1, name2, false)
    }

    fn delete_link(&self, name1: &str, name2: &str, _domains: &[&str]) -> bool {
        self.delete_link_flagged(name1, name2)
    }

    fn has_link(&self, name1: &str, name2: &str, _domains: &[&str]) -> bool {
        if name1 == name2 {
            return true;
        }
        let matcher = self.matcher.read().clone();
        if let Some(m) = &matcher {
            if self.cached_match(name1, name2, m) {
                return true;
            }
        }

        let (user, user_created) = self.get_or_create(name1);
        let (_, role_created) = self.get_or_create(name2);

        let mut frontier: HashMap<String, Arc<RoleNode>> = HashMap::new();
        frontier.insert(user.name.clone(), Arc::clone(&user));
        let mut found = false;

        // Each iteration expands one hop and then checks the nodes it just
        // reached, so a path of length L is found whenever max_hierarchy >= L.
        // The start node itself was checked above.
        let mut level = self.max_hierarchy;
        'search: while level > 0 && !frontier.is_empty() {
            let mut next: HashMap<String, Arc<RoleNode>> = HashMap::new();
            for node in frontier.values() {
                next.extend(self.out_neighbours(node));
            }
            for node in next.values() {
                if node.name == name2 {
                    found = true;
                    break 'search;
                }
                if let Some(m) = &matcher {
                    if self.cached_match(&node.name, name2, m) {
                        found = true;
                        break 'search;
                    }
                }
            }
            frontier = next;
            level -= 1;
        }

        if user_created {
            self.remove_role(name1);
        }
        if role_created {
            self.remove_role(name2);
        }
        found
    }

    fn get_roles(&self, name: &str, _domains: &[&str]) -> Vec<String> {
        let (node, created) = self.get_or_create(name);
        let res = self.out_neighbours(&node).into_keys().collect();
        if created {
            self.remove_role(name);
        }
        res
    }

    fn get_users(&self, name: &str, _domains: &[&str]) -> Vec<String> {
        let (node, created) = self.get_or_create(name);
        let res = self.in_neighbours(&node).into_keys().collect();
        if created {
            self.remove_role(name);
        }
        res
    }

    fn range(&self, f: &mut dyn FnMut(&str, &str, &[&str]) -> bool) {
        let mut links: Vec<(String, String)> = Vec::new();
        for entry in self.all_roles.iter() {
            let node = entry.value();
            for parent in node.parents.iter() {
                if !node.redundant.contains(parent.key()) {
                    links.push((node.name.clone(), parent.key().clone()));
                }
            }
        }
        for (name1, name2) in links {
            if !f(&name1, &name2, &[]) {
                return;
            }
        }
    }

    fn set_matcher(&self, matcher: Arc<dyn NameMatcher>) {
        *self.matcher.write() = Some(matcher);
        self.rebuild();
    }

    fn set_domain_matcher(&self, matcher: Arc<dyn NameMatcher>) {
        *self.domain_matcher.write() = Some(matcher);
    }
}
