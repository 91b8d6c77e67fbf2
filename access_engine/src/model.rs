// Model registry: named definitions per section, the stores and matchers
// built from them, and rule dispatch by family key.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use matchexpr::Value;
use parking_lot::RwLock;

use crate::config::Config;
use crate::defs::{EffectDef, MatcherDef, PolicyDef, RequestDef, RoleDef};
use crate::effector::DefaultEffector;
use crate::error::{Error, Result};
use crate::fm::FunctionMap;
use crate::matcher::Matcher;
use crate::policy::{Emitter, Policy, RuleStore, StoreEvent};
use crate::rbac::{
    generate_g_function, DefaultRoleManager, DomainManager, RoleManager, RolePolicy,
    DEFAULT_MAX_HIERARCHY,
};
use crate::types::Rule;

pub const R_SEC: u8 = b'r';
pub const P_SEC: u8 = b'p';
pub const G_SEC: u8 = b'g';
pub const E_SEC: u8 = b'e';
pub const M_SEC: u8 = b'm';

/// Model sections: config section name and expected key prefix.
const SECTIONS: [(&str, u8); 5] = [
    ("request_definition", R_SEC),
    ("policy_definition", P_SEC),
    ("role_definition", G_SEC),
    ("policy_effect", E_SEC),
    ("matchers", M_SEC),
];

struct ModelCore {
    /// Raw definition text per section byte and key.
    defs: HashMap<u8, HashMap<String, String>>,
    r_map: HashMap<String, Arc<RequestDef>>,
    p_map: HashMap<String, Arc<Policy>>,
    rp_map: HashMap<String, Arc<RolePolicy>>,
    rm_map: HashMap<String, Arc<dyn RoleManager>>,
    e_map: HashMap<String, Arc<DefaultEffector>>,
    m_defs: HashMap<String, MatcherDef>,
    m_map: HashMap<String, Arc<Matcher>>,
    fm: FunctionMap,
}

/// The model registry. Interior locking keeps the whole registry usable
/// through shared references; rule mutations go through the stores' own
/// locks and surface as key-prefixed events on the model emitter.
pub struct Model {
    core: RwLock<ModelCore>,
    emitter: Arc<Emitter>,
}

impl Default for Model {
    fn default() -> Self {
        Model::new()
    }
}

impl Model {
    pub fn new() -> Model {
        Model {
            core: RwLock::new(ModelCore {
                defs: HashMap::new(),
                r_map: HashMap::new(),
                p_map: HashMap::new(),
                rp_map: HashMap::new(),
                rm_map: HashMap::new(),
                e_map: HashMap::new(),
                m_defs: HashMap::new(),
                m_map: HashMap::new(),
                fm: FunctionMap::default_function_map(),
            }),
            emitter: Arc::new(Emitter::new()),
        }
    }

    pub fn from_file(path: &str) -> Result<Model> {
        let m = Model::new();
        m.load_model_from_file(path)?;
        Ok(m)
    }

    pub fn from_text(text: &str) -> Result<Model> {
        let m = Model::new();
        m.load_model(text)?;
        Ok(m)
    }

    /// Rule events (`RuleAdded`/`RuleRemoved`) with key-prefixed rules; this
    /// is what the storage controller listens to.
    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn load_model_from_file(&self, path: &str) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read model '{}': {}", path, e)))?;
        self.load_model(&text)
    }

    /// Loads an INI-shaped model document, installs every definition and
    /// compiles every matcher. Unknown sections are ignored; a key that does
    /// not start with its section's prefix letter is a load error.
    pub fn load_model(&self, text: &str) -> Result<()> {
        let cfg = Config::from_text(text)?;

        for section in cfg.sections() {
            let sec = match SECTIONS.iter().find(|(name, _)| *name == section.name) {
                Some((_, sec)) => *sec,
                None => continue,
            };
            for (key, value) in &section.entries {
                if key.as_bytes().first() != Some(&sec) {
                    return Err(Error::Config(format!(
                        "key of {} must start with '{}'",
                        section.name, sec as char
                    )));
                }
                self.add_def(sec, key, value)?;
            }
        }

        self.build_matchers()?;
        debug!("model loaded: {} matchers", self.core.read().m_map.len());
        Ok(())
    }

    // ========================================================================
    // Definition handlers
    // ========================================================================

    /// Installs a definition at runtime; the same handlers back model
    /// loading. Matchers referencing the definition are not rebuilt
    /// automatically.
    pub fn add_def(&self, sec: u8, key: &str, value: &str) -> Result<()> {
        let mut core = self.core.write();
        match sec {
            R_SEC => {
                core.r_map
                    .insert(key.to_string(), Arc::new(RequestDef::new(key, value)));
            }
            P_SEC => {
                let policy = Arc::new(Policy::from_def(PolicyDef::new(key, value)));
                self.relay_events(key, policy.emitter());
                core.p_map.insert(key.to_string(), policy);
            }
            G_SEC => {
                let def = RoleDef::new(key, value);
                let rm: Arc<dyn RoleManager> = if def.nargs() <= 2 {
                    Arc::new(DefaultRoleManager::new(DEFAULT_MAX_HIERARCHY))
                } else {
                    Arc::new(DomainManager::new(DEFAULT_MAX_HIERARCHY))
                };
                self.install_role_manager(&mut core, key, rm, def.nargs());
            }
            E_SEC => {
                core.e_map.insert(
                    key.to_string(),
                    Arc::new(DefaultEffector::new(EffectDef::new(key, value))),
                );
            }
            M_SEC => {
                let (base, index) = match key.split_once('.') {
                    Some((base, idx)) => (base, idx.parse().unwrap_or(-1)),
                    None => (key, -1),
                };
                match core.m_defs.get_mut(base) {
                    Some(def) => def.add_stage(index, value),
                    None => {
                        core.m_defs
                            .insert(base.to_string(), MatcherDef::new(key, value));
                    }
                }
            }
            other => {
                return Err(Error::Config(format!("invalid section '{}'", other as char)));
            }
        }
        core.defs
            .entry(sec)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Removes a definition and everything hanging off it: a policy def
    /// drops its rule store and the matchers built over it, a role def drops
    /// its graph and registry function.
    pub fn remove_def(&self, sec: u8, key: &str) -> Result<()> {
        let mut core = self.core.write();
        core.defs.entry(sec).or_default().remove(key);
        match sec {
            R_SEC => {
                core.r_map.remove(key);
            }
            P_SEC => {
                core.p_map.remove(key);
                core.m_map.retain(|_, m| m.store_def().key() != key);
            }
            G_SEC => {
                core.rp_map.remove(key);
                core.rm_map.remove(key);
                core.fm.remove_function(key);
                core.m_map.retain(|_, m| m.store_def().key() != key);
            }
            E_SEC => {
                core.e_map.remove(key);
            }
            M_SEC => {
                let base = key.split_once('.').map(|(b, _)| b).unwrap_or(key);
                core.m_defs.remove(base);
                core.m_map.remove(base);
            }
            other => {
                return Err(Error::Config(format!("invalid section '{}'", other as char)));
            }
        }
        Ok(())
    }

    fn relay_events(&self, key: &str, emitter: &Emitter) {
        for event in [StoreEvent::RuleAdded, StoreEvent::RuleRemoved] {
            let model_emitter = Arc::clone(&self.emitter);
            let key = key.to_string();
            emitter.on(
                event,
                Box::new(move |rule| {
                    let mut full = Vec::with_capacity(rule.len() + 1);
                    full.push(key.clone());
                    full.extend(rule.iter().cloned());
                    model_emitter.emit(event, &full);
                }),
            );
        }
    }

    fn install_role_manager(
        &self,
        core: &mut ModelCore,
        key: &str,
        rm: Arc<dyn RoleManager>,
        nargs: usize,
    ) {
        let rp = Arc::new(RolePolicy::new(key, Arc::clone(&rm), nargs));
        self.relay_events(key, rp.emitter());
        core.fm
            .set_function(key, generate_g_function(key, Arc::clone(&rm)));
        core.rm_map.insert(key.to_string(), rm);
        core.rp_map.insert(key.to_string(), rp);
    }

    /// Replaces the role manager behind a role definition, keeping the rule
    /// view and the registry function coherent.
    pub fn set_role_manager(&self, key: &str, rm: Arc<dyn RoleManager>) {
        let nargs = {
            let core = self.core.read();
            core.defs
                .get(&G_SEC)
                .and_then(|defs| defs.get(key))
                .map(|args| RoleDef::new(key, args).nargs())
                .unwrap_or(2)
        };
        let mut core = self.core.write();
        self.install_role_manager(&mut core, key, rm, nargs);
    }

    // ========================================================================
    // Matchers
    // ========================================================================

    /// Compiles every defined matcher.
    pub fn build_matchers(&self) -> Result<()> {
        let keys: Vec<String> = self.core.read().m_defs.keys().cloned().collect();
        for key in keys {
            self.build_matcher(&key)?;
        }
        Ok(())
    }

    /// Recompiles one matcher and rebuilds its index. Fails when the matcher
    /// or the rule family it references is unknown.
    pub fn build_matcher(&self, key: &str) -> Result<()> {
        let mut core = self.core.write();
        let mut def = core
            .m_defs
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Reference(format!("matcher {} not found", key)))?;
        def.build(core.fm.registry())?;

        let policy_key = def.policy_key();
        let store: Arc<dyn RuleStore> = if policy_key.starts_with('g') {
            core.rp_map
                .get(&policy_key)
                .cloned()
                .map(|rp| rp as Arc<dyn RuleStore>)
                .ok_or_else(|| Error::Reference(format!("policy {} not found", policy_key)))?
        } else {
            core.p_map
                .get(&policy_key)
                .cloned()
                .map(|p| p as Arc<dyn RuleStore>)
                .ok_or_else(|| Error::Reference(format!("policy {} not found", policy_key)))?
        };

        let matcher = Matcher::new(store, def.clone())?;
        core.m_defs.insert(key.to_string(), def);
        core.m_map.insert(key.to_string(), Arc::new(matcher));
        Ok(())
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Adds a key-prefixed rule, dispatching on the family key (`p*` or
    /// `g*`). Returns false when an identical rule already exists.
    pub fn add_rule(&self, rule: &[String]) -> Result<bool> {
        self.dispatch_rule(rule, true)
    }

    /// Removes a key-prefixed rule. Returns false when it was absent.
    pub fn remove_rule(&self, rule: &[String]) -> Result<bool> {
        self.dispatch_rule(rule, false)
    }

    fn dispatch_rule(&self, rule: &[String], add: bool) -> Result<bool> {
        let key = rule
            .first()
            .ok_or_else(|| Error::Argument("empty rule".to_string()))?;
        let core = self.core.read();
        match key.as_bytes().first() {
            Some(&P_SEC) => {
                let policy = core
                    .p_map
                    .get(key)
                    .ok_or_else(|| Error::Reference(format!("policy {} not found", key)))?;
                Ok(if add {
                    policy.add_rule(&rule[1..])
                } else {
                    policy.remove_rule(&rule[1..])
                })
            }
            Some(&G_SEC) => {
                let rp = core
                    .rp_map
                    .get(key)
                    .ok_or_else(|| Error::Reference(format!("role manager {} not found", key)))?;
                if rule.len() < 3 {
                    return Err(Error::Argument(format!(
                        "role rule {:?} needs at least two fields",
                        rule
                    )));
                }
                Ok(if add {
                    rp.add_rule(&rule[1..])
                } else {
                    rp.remove_rule(&rule[1..])
                })
            }
            _ => Err(Error::Reference(format!("unknown rule family '{}'", key))),
        }
    }

    /// Drops every policy and role rule; definitions stay.
    pub fn clear_policy(&self) {
        let core = self.core.read();
        for policy in core.p_map.values() {
            policy.clear();
        }
        for rp in core.rp_map.values() {
            rp.clear();
        }
    }

    /// Enumerates all rules, key-prefixed; true continues.
    pub fn range_rules(&self, f: &mut dyn FnMut(&[String]) -> bool) {
        let stores: Vec<(String, Arc<dyn RuleStore>)> = {
            let core = self.core.read();
            core.p_map
                .iter()
                .map(|(k, p)| (k.clone(), Arc::clone(p) as Arc<dyn RuleStore>))
                .chain(
                    core.rp_map
                        .iter()
                        .map(|(k, rp)| (k.clone(), Arc::clone(rp) as Arc<dyn RuleStore>)),
                )
                .collect()
        };

        let mut keep_going = true;
        for (key, store) in stores {
            if !keep_going {
                break;
            }
            store.range_rules(&mut |rule| {
                let mut full = Vec::with_capacity(rule.len() + 1);
                full.push(key.clone());
                full.extend(rule.iter().cloned());
                keep_going = f(&full);
                keep_going
            });
        }
    }

    /// Streams the rules matched by `m_key` for a request; rules are yielded
    /// as stored, without their family key.
    pub fn range_matches(
        &self,
        m_key: &str,
        r_key: &str,
        rvals: &[Value],
        f: &mut dyn FnMut(&Rule) -> bool,
    ) -> Result<()> {
        let (matcher, rdef, fm) = {
            let core = self.core.read();
            let matcher = core
                .m_map
                .get(m_key)
                .cloned()
                .ok_or_else(|| Error::Reference(format!("matcher {} not found", m_key)))?;
            let rdef = core
                .r_map
                .get(r_key)
                .cloned()
                .ok_or_else(|| Error::Reference(format!("request definition {} not found", r_key)))?;
            (matcher, rdef, core.fm.clone())
        };
        matcher.range_matches(&rdef, rvals, &fm, f)
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn get_request_def(&self, key: &str) -> Option<Arc<RequestDef>> {
        self.core.read().r_map.get(key).cloned()
    }

    pub fn get_policy(&self, key: &str) -> Option<Arc<Policy>> {
        self.core.read().p_map.get(key).cloned()
    }

    pub fn get_role_policy(&self, key: &str) -> Option<Arc<RolePolicy>> {
        self.core.read().rp_map.get(key).cloned()
    }

    pub fn get_role_manager(&self, key: &str) -> Option<Arc<dyn RoleManager>> {
        self.core.read().rm_map.get(key).cloned()
    }

    pub fn get_effector(&self, key: &str) -> Option<Arc<DefaultEffector>> {
        self.core.read().e_map.get(key).cloned()
    }

    pub fn get_matcher(&self, key: &str) -> Option<Arc<Matcher>> {
        self.core.read().m_map.get(key).cloned()
    }

    pub fn has_matcher_def(&self, key: &str) -> bool {
        self.core.read().m_defs.contains_key(key)
    }

    /// A snapshot of the function map, for evaluating matchers outside the
    /// registry.
    pub fn function_map(&self) -> FunctionMap {
        self.core.read().fm.clone()
    }

    pub fn set_function(&self, name: &str, function: matchexpr::NativeFunction) {
        self.core.write().fm.set_function(name, function);
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.read();
        f.debug_struct("Model")
            .field("request_defs", &core.r_map.len())
            .field("policies", &core.p_map.len())
            .field("role_policies", &core.rp_map.len())
            .field("effectors", &core.e_map.len())
            .field("matchers", &core.m_map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::rule;

    const BASIC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#;

    #[test]
    fn load_installs_all_sections() {
        let m = Model::from_text(BASIC_MODEL).unwrap();
        assert!(m.get_request_def("r").is_some());
        assert!(m.get_policy("p").is_some());
        assert!(m.get_effector("e").is_some());
        assert!(m.get_matcher("m").is_some());
    }

    #[test]
    fn key_prefix_mismatch_is_a_config_error() {
        let bad = BASIC_MODEL.replace("p = sub, obj, act", "x = sub, obj, act");
        assert!(matches!(Model::from_text(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let text = format!("{}\n[future_section]\nz = ignored\n", BASIC_MODEL);
        assert!(Model::from_text(&text).is_ok());
    }

    #[test]
    fn rules_dispatch_on_family_key() {
        let m = Model::from_text(BASIC_MODEL).unwrap();
        assert!(m.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap());
        assert!(!m.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap());

        assert!(matches!(
            m.add_rule(&rule(&["p2", "a", "b", "c"])),
            Err(Error::Reference(_))
        ));
        assert!(matches!(
            m.add_rule(&rule(&["g", "alice", "admin"])),
            Err(Error::Reference(_))
        ));
        assert!(matches!(m.add_rule(&[]), Err(Error::Argument(_))));
    }

    #[test]
    fn model_events_carry_prefixed_rules() {
        use std::sync::Mutex;

        let m = Model::from_text(BASIC_MODEL).unwrap();
        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        m.emitter().on(
            StoreEvent::RuleAdded,
            Box::new(move |r| {
                sink.lock().unwrap().push(r.to_vec());
            }),
        );

        m.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![rule(&["p", "alice", "data1", "read"])]
        );
    }

    #[test]
    fn remove_policy_def_drops_dependent_matchers() {
        let m = Model::from_text(BASIC_MODEL).unwrap();
        m.remove_def(P_SEC, "p").unwrap();
        assert!(m.get_policy("p").is_none());
        assert!(m.get_matcher("m").is_none());
        // rebuilding now fails with a reference error
        assert!(matches!(m.build_matcher("m"), Err(Error::Reference(_))));
    }

    #[test]
    fn runtime_def_installation() {
        let m = Model::from_text(BASIC_MODEL).unwrap();
        m.add_def(M_SEC, "m2", "r.sub == p.sub").unwrap();
        m.build_matcher("m2").unwrap();
        assert!(m.get_matcher("m2").is_some());

        m.remove_def(M_SEC, "m2").unwrap();
        assert!(m.get_matcher("m2").is_none());
    }

    #[test]
    fn range_rules_prefixes_keys() {
        let text = format!("{}\n[role_definition]\ng = _, _\n", BASIC_MODEL);
        let m = Model::from_text(&text).unwrap();
        m.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();
        m.add_rule(&rule(&["g", "alice", "admin"])).unwrap();

        let mut rules = Vec::new();
        m.range_rules(&mut |r| {
            rules.push(r.join(","));
            true
        });
        rules.sort();
        assert_eq!(rules, vec!["g,alice,admin", "p,alice,data1,read"]);
    }

    #[test]
    fn clear_policy_keeps_definitions() {
        let m = Model::from_text(BASIC_MODEL).unwrap();
        m.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();
        m.clear_policy();

        let mut count = 0;
        m.range_rules(&mut |_| {
            count += 1;
            true
        });
        assert_eq!(count, 0);
        assert!(m.get_policy("p").is_some());
    }
}
