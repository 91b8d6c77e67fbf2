// Indexed matcher evaluation.
//
// Per matcher, an index tree mirrors the compiled stage tree: each index
// node keeps, per stage child, a hash map keyed by the rule fields that
// child projects. Rules sharing a projection share a subtree, so one stage
// evaluation prunes or admits all of them at once. Children that reference
// no policy fields, and leaves, key by the full rule hash so request-only
// matchers still enumerate every rule.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, Weak};

use matchexpr::{Error as ExprError, EvalEnv, Params, Program, Value};
use parking_lot::RwLock;

use crate::defs::{normalize_refs, MatcherDef, MatcherStage, PolicyDef, RequestDef};
use crate::error::{Error, Result};
use crate::fm::FunctionMap;
use crate::policy::{ListenerId, RuleStore, StoreEvent};
use crate::types::{rule_hash, Rule};

// ============================================================================
// Index tree
// ============================================================================

#[derive(Debug)]
struct IndexNode {
    /// Representative rule: every rule below this node agrees with it on the
    /// fields projected along the path here. Leaves hold the concrete rule.
    rule: Rule,
    /// One keyed map per stage child, aligned by position.
    edges: Vec<HashMap<String, IndexNode>>,
}

impl IndexNode {
    fn new(rule: Rule, children: usize) -> IndexNode {
        IndexNode {
            rule,
            edges: (0..children).map(|_| HashMap::new()).collect(),
        }
    }
}

fn edge_key(child: &MatcherStage, rule: &[String], def: &PolicyDef) -> String {
    if child.is_leaf() || child.policy_args().is_empty() {
        rule_hash(rule)
    } else {
        let projected = def
            .get_parameters(rule, child.policy_args())
            .unwrap_or_default();
        rule_hash(&projected)
    }
}

fn index_insert(stage: &MatcherStage, node: &mut IndexNode, rule: &[String], def: &PolicyDef) {
    for (i, child) in stage.children().iter().enumerate() {
        let key = edge_key(child, rule, def);
        let next = node.edges[i]
            .entry(key)
            .or_insert_with(|| IndexNode::new(rule.to_vec(), child.children().len()));
        index_insert(child, next, rule, def);
    }
}

fn index_remove(stage: &MatcherStage, node: &mut IndexNode, rule: &[String], def: &PolicyDef) {
    for (i, child) in stage.children().iter().enumerate() {
        let key = edge_key(child, rule, def);
        if child.is_leaf() {
            node.edges[i].remove(&key);
        } else if let Some(next) = node.edges[i].get_mut(&key) {
            index_remove(child, next, rule, def);
            if next.edges.iter().all(|m| m.is_empty()) {
                node.edges[i].remove(&key);
            }
        }
    }
}

// ============================================================================
// Parameter object
// ============================================================================

/// Resolves expression parameters by leading identifier byte: `p`/`g` lookups
/// go to the candidate rule through the policy definition, `r` lookups to the
/// request tuple through the request definition.
struct MatchParameters<'a> {
    pdef: PolicyDef,
    pvals: RefCell<Rule>,
    rdef: &'a RequestDef,
    rvals: &'a [Value],
}

impl<'a> MatchParameters<'a> {
    fn new(pdef: PolicyDef, rdef: &'a RequestDef, rvals: &'a [Value]) -> Self {
        MatchParameters {
            pdef,
            pvals: RefCell::new(Rule::new()),
            rdef,
            rvals,
        }
    }

    fn set_rule(&self, rule: &[String]) {
        *self.pvals.borrow_mut() = rule.to_vec();
    }
}

impl Params for MatchParameters<'_> {
    fn get(&self, name: &str) -> std::result::Result<Value, ExprError> {
        match name.as_bytes().first() {
            Some(b'p') | Some(b'g') => {
                let rule = self.pvals.borrow();
                let value = self.pdef.get_parameter(&rule, name)?;
                Ok(Value::from(value))
            }
            Some(b'r') => self.rdef.get_parameter(self.rvals, name),
            _ => Err(ExprError::UnknownParameter(name.to_string())),
        }
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// A compiled matcher bound to its rule store, kept coherent through the
/// store's change events. Readers evaluate under the index read lock;
/// mutation takes the write lock, so evaluation and mutation exclude each
/// other while concurrent evaluations proceed in parallel.
pub struct Matcher {
    def: MatcherDef,
    store: Arc<dyn RuleStore>,
    index: Arc<RwLock<IndexNode>>,
    listener_ids: Vec<ListenerId>,
}

impl Matcher {
    /// Builds the index for `def` (already compiled) over the store's
    /// current rules and subscribes to its change events.
    pub fn new(store: Arc<dyn RuleStore>, def: MatcherDef) -> Result<Matcher> {
        let root_stage = def
            .root()
            .cloned()
            .ok_or_else(|| Error::Compile(format!("matcher {} is not built", def.key())))?;

        let index = Arc::new(RwLock::new(IndexNode::new(
            Rule::new(),
            root_stage.children().len(),
        )));

        let pdef = store.def().clone();
        {
            let mut guard = index.write();
            store.range_rules(&mut |rule| {
                index_insert(&root_stage, &mut guard, rule, &pdef);
                true
            });
        }

        let mut listener_ids = Vec::new();

        let weak: Weak<RwLock<IndexNode>> = Arc::downgrade(&index);
        let stage = root_stage.clone();
        let def_clone = pdef.clone();
        listener_ids.push(store.emitter().on(
            StoreEvent::RuleAdded,
            Box::new(move |rule| {
                if let Some(index) = weak.upgrade() {
                    index_insert(&stage, &mut index.write(), rule, &def_clone);
                }
            }),
        ));

        let weak = Arc::downgrade(&index);
        let stage = root_stage.clone();
        let def_clone = pdef.clone();
        listener_ids.push(store.emitter().on(
            StoreEvent::RuleRemoved,
            Box::new(move |rule| {
                if let Some(index) = weak.upgrade() {
                    index_remove(&stage, &mut index.write(), rule, &def_clone);
                }
            }),
        ));

        let weak = Arc::downgrade(&index);
        let children = root_stage.children().len();
        listener_ids.push(store.emitter().on(
            StoreEvent::Cleared,
            Box::new(move |_| {
                if let Some(index) = weak.upgrade() {
                    *index.write() = IndexNode::new(Rule::new(), children);
                }
            }),
        ));

        Ok(Matcher {
            def,
            store,
            index,
            listener_ids,
        })
    }

    pub fn def(&self) -> &MatcherDef {
        &self.def
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    /// The definition of the rule family this matcher indexes.
    pub fn store_def(&self) -> &PolicyDef {
        self.store.def()
    }

    /// Enumerates the rules matching a request: pruned depth-first traversal
    /// of the index, yielding each matched rule once. The consumer returns
    /// true to continue; errors abort enumeration.
    pub fn range_matches(
        &self,
        rdef: &RequestDef,
        rvals: &[Value],
        fm: &FunctionMap,
        f: &mut dyn FnMut(&Rule) -> bool,
    ) -> Result<()> {
        let root_stage = self
            .def
            .root()
            .ok_or_else(|| Error::Compile(format!("matcher {} is not built", self.def.key())))?;

        let params = MatchParameters::new(self.store.def().clone(), rdef, rvals);
        let env = EvalEnv::new(fm.registry()).with_rewriter(&normalize_refs);
        let run = MatchRun {
            params,
            env,
            programs: RefCell::new(HashMap::new()),
        };

        // Read the store size before taking the index lock: store mutation
        // holds the store lock while updating the index through listeners,
        // so the locks must always be taken in that order.
        let store_is_empty = self.store.len() == 0;
        let index = self.index.read();

        // With no rules, evaluate each stage chain once against an all-empty
        // synthetic rule so request-only matchers still fire.
        if store_is_empty {
            let empty: Rule = vec![String::new(); self.store.def().args().len()];
            if run.walk_empty(root_stage, &empty)? {
                f(&empty);
            }
            return Ok(());
        }

        let mut seen: HashSet<String> = HashSet::new();
        run.walk(root_stage, &index, &mut seen, f)?;
        Ok(())
    }
}

impl Drop for Matcher {
    fn drop(&mut self) {
        for id in &self.listener_ids {
            self.store.emitter().off(*id);
        }
    }
}

struct MatchRun<'a> {
    params: MatchParameters<'a>,
    env: EvalEnv<'a>,
    programs: RefCell<HashMap<String, Rc<Program>>>,
}

impl MatchRun<'_> {
    /// Stage expressions compile once per evaluation call.
    fn program_for(&self, stage: &MatcherStage) -> Result<Rc<Program>> {
        let mut programs = self.programs.borrow_mut();
        if let Some(p) = programs.get(stage.expr()) {
            return Ok(Rc::clone(p));
        }
        let program = Program::compile(stage.expr(), self.env.functions())
            .map_err(|e| Error::Compile(format!("{}: {}", stage.expr(), e)))?;
        let program = Rc::new(program);
        programs.insert(stage.expr().to_string(), Rc::clone(&program));
        Ok(program)
    }

    fn walk(
        &self,
        stage: &MatcherStage,
        node: &IndexNode,
        seen: &mut HashSet<String>,
        f: &mut dyn FnMut(&Rule) -> bool,
    ) -> Result<bool> {
        for (i, child) in stage.children().iter().enumerate() {
            let program = self.program_for(child)?;
            let edge = match node.edges.get(i) {
                Some(edge) => edge,
                None => continue,
            };

            for next in edge.values() {
                self.params.set_rule(&next.rule);
                if !program.eval_bool(&self.params, &self.env)? {
                    continue;
                }
                if child.is_leaf() {
                    if seen.insert(rule_hash(&next.rule)) && !f(&next.rule) {
                        return Ok(false);
                    }
                } else if !self.walk(child, next, seen, f)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn walk_empty(&self, stage: &MatcherStage, empty: &Rule) -> Result<bool> {
        for child in stage.children() {
            let program = self.program_for(child)?;
            self.params.set_rule(empty);
            if !program.eval_bool(&self.params, &self.env)? {
                continue;
            }
            if child.is_leaf() || self.walk_empty(child, empty)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
