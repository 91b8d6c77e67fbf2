// Rule stores: hash-deduplicated rule sets with change events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::defs::PolicyDef;
use crate::error::Result;
use crate::types::{rule_hash, Rule};

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEvent {
    RuleAdded,
    RuleRemoved,
    Cleared,
}

pub type ListenerId = u64;

type Handler = Box<dyn Fn(&[String]) + Send + Sync>;

/// Direct-call subscriber list. Events are dispatched synchronously on the
/// mutating thread, under the owning store's lock, so listeners observe
/// mutations in program order.
#[derive(Default)]
pub struct Emitter {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(StoreEvent, ListenerId, Handler)>>,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter::default()
    }

    pub fn on(&self, event: StoreEvent, handler: Handler) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((event, id, handler));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(_, lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: StoreEvent, rule: &[String]) {
        for (evt, _, handler) in self.listeners.read().iter() {
            if *evt == event {
                handler(rule);
            }
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

// ============================================================================
// Store contract
// ============================================================================

/// Common contract of the policy-rule store and the role-rule view: matchers
/// index whatever implements this.
pub trait RuleStore: Send + Sync {
    fn def(&self) -> &PolicyDef;
    fn emitter(&self) -> &Emitter;
    fn len(&self) -> usize;

    /// Enumerates rules; the callback returns true to continue.
    fn range_rules(&self, f: &mut dyn FnMut(&Rule) -> bool);

    /// Inserts a rule; false when an identical rule is already present.
    fn add_rule(&self, rule: &[String]) -> bool;

    /// Deletes a rule; false when it was absent.
    fn remove_rule(&self, rule: &[String]) -> bool;

    fn clear(&self);

    /// Deduplicated projection of the named fields across all rules.
    fn distinct(&self, args: &[&str]) -> Result<Vec<Rule>>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Policy rules
// ============================================================================

/// The `p`-family rule store: a hash map from rule identity to rule, plus
/// the event emitter. Readers are the evaluator; writers are add/remove/clear.
pub struct Policy {
    def: PolicyDef,
    rules: RwLock<HashMap<String, Rule>>,
    emitter: Emitter,
}

impl Policy {
    pub fn new(key: &str, arguments: &str) -> Policy {
        Policy::from_def(PolicyDef::new(key, arguments))
    }

    pub fn from_def(def: PolicyDef) -> Policy {
        Policy {
            def,
            rules: RwLock::new(HashMap::new()),
            emitter: Emitter::new(),
        }
    }
}

impl RuleStore for Policy {
    fn def(&self) -> &PolicyDef {
        &self.def
    }

    fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    fn len(&self) -> usize {
        self.rules.read().len()
    }

    fn range_rules(&self, f: &mut dyn FnMut(&Rule) -> bool) {
        for rule in self.rules.read().values() {
            if !f(rule) {
                break;
            }
        }
    }

    fn add_rule(&self, rule: &[String]) -> bool {
        let mut rules = self.rules.write();
        let hash = rule_hash(rule);
        if rules.contains_key(&hash) {
            return false;
        }
        rules.insert(hash, rule.to_vec());
        self.emitter.emit(StoreEvent::RuleAdded, rule);
        true
    }

    fn remove_rule(&self, rule: &[String]) -> bool {
        let mut rules = self.rules.write();
        if rules.remove(&rule_hash(rule)).is_none() {
            return false;
        }
        self.emitter.emit(StoreEvent::RuleRemoved, rule);
        true
    }

    fn clear(&self) {
        let mut rules = self.rules.write();
        rules.clear();
        self.emitter.emit(StoreEvent::Cleared, &[]);
    }

    fn distinct(&self, args: &[&str]) -> Result<Vec<Rule>> {
        let names: Vec<String> = args
            .iter()
            .map(|arg| format!("{}_{}", self.def.key(), arg))
            .collect();
        let rules = self.rules.read();
        let mut seen: HashMap<String, Rule> = HashMap::new();
        for rule in rules.values() {
            let projected = self.def.get_parameters(rule, &names)?;
            seen.insert(rule_hash(&projected), projected);
        }
        Ok(seen.into_values().collect())
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("def", &self.def.to_string())
            .field("rules", &self.len())
            .finish()
    }
}
