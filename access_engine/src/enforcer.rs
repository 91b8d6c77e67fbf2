// Enforcement façade: decision evaluation plus rule and policy management
// over a model and a storage adapter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use matchexpr::Value;

use crate::defs::{EffectDef, RequestDef};
use crate::effector::{DefaultEffector, Effector};
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::model::{Model, M_SEC};
use crate::storage::{
    Adapter, FileAdapter, ModelSink, ModelSource, NoopAdapter, StorageController,
};
use crate::types::{Effect, Rule};

// ============================================================================
// Construction inputs
// ============================================================================

/// Model argument of [`Enforcer::new`]: a model file path or a built model.
pub enum ModelInit {
    Path(String),
    Value(Model),
}

impl From<&str> for ModelInit {
    fn from(path: &str) -> Self {
        ModelInit::Path(path.to_string())
    }
}

impl From<String> for ModelInit {
    fn from(path: String) -> Self {
        ModelInit::Path(path)
    }
}

impl From<Model> for ModelInit {
    fn from(model: Model) -> Self {
        ModelInit::Value(model)
    }
}

/// Adapter argument of [`Enforcer::new`]: nothing, a policy file path, or an
/// adapter value.
pub enum AdapterInit {
    None,
    Path(String),
    Value(Arc<dyn Adapter>),
}

impl From<()> for AdapterInit {
    fn from(_: ()) -> Self {
        AdapterInit::None
    }
}

impl From<&str> for AdapterInit {
    fn from(path: &str) -> Self {
        AdapterInit::Path(path.to_string())
    }
}

impl From<String> for AdapterInit {
    fn from(path: String) -> Self {
        AdapterInit::Path(path)
    }
}

impl From<Arc<dyn Adapter>> for AdapterInit {
    fn from(adapter: Arc<dyn Adapter>) -> Self {
        AdapterInit::Value(adapter)
    }
}

impl From<Option<Arc<dyn Adapter>>> for AdapterInit {
    fn from(adapter: Option<Arc<dyn Adapter>>) -> Self {
        match adapter {
            Some(a) => AdapterInit::Value(a),
            None => AdapterInit::None,
        }
    }
}

/// Runtime switches applied through [`Enforcer::set_option`].
#[derive(Debug, Clone, Copy)]
pub enum EnforcerOption {
    /// Flush storage automatically as mutations come in.
    Autosave(bool),
    /// Mirror rule changes into the adapter at all.
    StorageEnabled(bool),
}

// ============================================================================
// Per-call context
// ============================================================================

/// Selects or inlines the matcher, request definition and effect definition
/// used by one enforcement call.
#[derive(Debug, Clone)]
pub enum ContextOption {
    /// A matcher key, or an inline matcher expression when the key is
    /// unknown.
    Matcher(String),
    /// Inline matcher built from conjoined stage expressions.
    MatcherStages(Vec<String>),
    /// A request definition key, or inline field names under the key `r`.
    RequestDef(String),
    /// Inline request definition with an explicit key, e.g. `r5 = sub`.
    RequestDefInline { key: String, args: String },
    /// An effect definition key, or an inline effect expression.
    Effector(String),
}

impl ContextOption {
    pub fn matcher(s: impl Into<String>) -> ContextOption {
        ContextOption::Matcher(s.into())
    }

    pub fn matcher_stages(stages: impl IntoIterator<Item = impl Into<String>>) -> ContextOption {
        ContextOption::MatcherStages(stages.into_iter().map(Into::into).collect())
    }

    pub fn request_def(s: impl Into<String>) -> ContextOption {
        ContextOption::RequestDef(s.into())
    }

    pub fn request_def_inline(key: impl Into<String>, args: impl Into<String>) -> ContextOption {
        ContextOption::RequestDefInline {
            key: key.into(),
            args: args.into(),
        }
    }

    pub fn effector(s: impl Into<String>) -> ContextOption {
        ContextOption::Effector(s.into())
    }
}

/// One positional argument of an enforcement call: either a context option
/// or a request value.
pub enum EnforceArg {
    Option(ContextOption),
    Value(Value),
}

impl From<ContextOption> for EnforceArg {
    fn from(opt: ContextOption) -> Self {
        EnforceArg::Option(opt)
    }
}

impl From<Value> for EnforceArg {
    fn from(v: Value) -> Self {
        EnforceArg::Value(v)
    }
}

impl From<&str> for EnforceArg {
    fn from(s: &str) -> Self {
        EnforceArg::Value(Value::from(s))
    }
}

impl From<String> for EnforceArg {
    fn from(s: String) -> Self {
        EnforceArg::Value(Value::from(s))
    }
}

impl From<i64> for EnforceArg {
    fn from(n: i64) -> Self {
        EnforceArg::Value(Value::from(n))
    }
}

impl From<serde_json::Value> for EnforceArg {
    fn from(v: serde_json::Value) -> Self {
        EnforceArg::Value(Value::from(v))
    }
}

fn split_args(args: impl IntoIterator<Item = EnforceArg>) -> (Vec<ContextOption>, Vec<Value>) {
    let mut options = Vec::new();
    let mut rvals = Vec::new();
    for arg in args {
        match arg {
            EnforceArg::Option(opt) => options.push(opt),
            EnforceArg::Value(v) => rvals.push(v),
        }
    }
    (options, rvals)
}

/// Removes an inline matcher's reserved definition on every exit path.
struct TempMatcherGuard<'a> {
    model: &'a Model,
    key: String,
}

impl Drop for TempMatcherGuard<'_> {
    fn drop(&mut self) {
        let _ = self.model.remove_def(M_SEC, &self.key);
    }
}

struct EnforceContext<'a> {
    matcher: Arc<Matcher>,
    rdef: Arc<RequestDef>,
    effector: Arc<DefaultEffector>,
    _guard: Option<TempMatcherGuard<'a>>,
}

fn next_reserved_key() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!("m9999_{}", SEQ.fetch_add(1, Ordering::Relaxed))
}

fn build_temp_matcher<'a>(
    model: &'a Model,
    stages: &[String],
) -> Result<(Arc<Matcher>, TempMatcherGuard<'a>)> {
    let key = next_reserved_key();
    let guard = TempMatcherGuard {
        model,
        key: key.clone(),
    };
    if stages.len() == 1 {
        model.add_def(M_SEC, &key, &stages[0])?;
    } else {
        for (i, stage) in stages.iter().enumerate() {
            model.add_def(M_SEC, &format!("{}.{}", key, i), stage)?;
        }
    }
    model.build_matcher(&key)?;
    let matcher = model
        .get_matcher(&key)
        .ok_or_else(|| Error::Reference(format!("matcher {} not found", key)))?;
    Ok((matcher, guard))
}

fn build_context<'a>(model: &'a Model, options: Vec<ContextOption>) -> Result<EnforceContext<'a>> {
    let mut matcher = None;
    let mut rdef = None;
    let mut effector = None;
    let mut guard = None;

    for option in options {
        match option {
            ContextOption::Matcher(s) => match model.get_matcher(&s) {
                Some(m) => matcher = Some(m),
                None => {
                    let (m, g) = build_temp_matcher(model, std::slice::from_ref(&s))?;
                    matcher = Some(m);
                    guard = Some(g);
                }
            },
            ContextOption::MatcherStages(stages) => {
                let (m, g) = build_temp_matcher(model, &stages)?;
                matcher = Some(m);
                guard = Some(g);
            }
            ContextOption::RequestDef(s) => {
                rdef = Some(
                    model
                        .get_request_def(&s)
                        .unwrap_or_else(|| Arc::new(RequestDef::new("r", &s))),
                );
            }
            ContextOption::RequestDefInline { key, args } => {
                rdef = Some(Arc::new(RequestDef::new(&key, &args)));
            }
            ContextOption::Effector(s) => {
                effector = Some(model.get_effector(&s).unwrap_or_else(|| {
                    Arc::new(DefaultEffector::new(EffectDef::new("e", &s)))
                }));
            }
        }
    }

    let matcher = match matcher {
        Some(m) => m,
        None => model
            .get_matcher("m")
            .ok_or_else(|| Error::Reference("matcher m not found".to_string()))?,
    };
    let rdef = match rdef {
        Some(r) => r,
        None => model
            .get_request_def("r")
            .ok_or_else(|| Error::Reference("request definition r not found".to_string()))?,
    };
    let effector = match effector {
        Some(e) => e,
        None => model
            .get_effector("e")
            .ok_or_else(|| Error::Reference("effect definition e not found".to_string()))?,
    };

    Ok(EnforceContext {
        matcher,
        rdef,
        effector,
        _guard: guard,
    })
}

// ============================================================================
// Enforcer
// ============================================================================

/// The embedding entry point: owns the model and the storage controller and
/// exposes decisions (`enforce`, `filter`, `range_matches`) plus rule and
/// policy management.
pub struct Enforcer {
    model: Model,
    adapter: Option<Arc<dyn Adapter>>,
    sc: StorageController,
}

impl Enforcer {
    /// Builds an enforcer from a model (path or value) and an optional
    /// adapter (nothing, policy file path, or adapter value). With an
    /// adapter, the initial policy load runs with storage mirroring off.
    pub fn new(model: impl Into<ModelInit>, adapter: impl Into<AdapterInit>) -> Result<Enforcer> {
        let model = match model.into() {
            ModelInit::Path(path) => Model::from_file(&path)?,
            ModelInit::Value(model) => model,
        };
        let adapter: Option<Arc<dyn Adapter>> = match adapter.into() {
            AdapterInit::None => None,
            AdapterInit::Path(path) => Some(Arc::new(FileAdapter::new(path))),
            AdapterInit::Value(adapter) => Some(adapter),
        };

        let controller_adapter: Arc<dyn Adapter> = match &adapter {
            Some(a) => Arc::clone(a),
            None => Arc::new(NoopAdapter),
        };
        let sc = StorageController::new(Arc::clone(model.emitter()), controller_adapter, false);
        if adapter.is_none() {
            sc.disable();
        }

        let enforcer = Enforcer { model, adapter, sc };
        if enforcer.adapter.is_some() {
            enforcer.load_policy()?;
        }
        Ok(enforcer)
    }

    /// [`Enforcer::new`] plus a set of option switches.
    pub fn new_with_options(
        model: impl Into<ModelInit>,
        adapter: impl Into<AdapterInit>,
        options: impl IntoIterator<Item = EnforcerOption>,
    ) -> Result<Enforcer> {
        let enforcer = Enforcer::new(model, adapter)?;
        for option in options {
            enforcer.set_option(option);
        }
        Ok(enforcer)
    }

    pub fn set_option(&self, option: EnforcerOption) {
        match option {
            EnforcerOption::Autosave(on) => self.sc.set_autosave(on),
            EnforcerOption::StorageEnabled(true) => self.sc.enable(),
            EnforcerOption::StorageEnabled(false) => self.sc.disable(),
        }
    }

    pub fn get_model(&self) -> &Model {
        &self.model
    }

    pub fn get_storage_controller(&self) -> &StorageController {
        &self.sc
    }

    /// Swaps the storage adapter and enables mirroring into it.
    pub fn set_adapter(&mut self, adapter: Arc<dyn Adapter>) {
        self.sc.set_adapter(Arc::clone(&adapter));
        self.adapter = Some(adapter);
        self.sc.enable();
    }

    // ========================================================================
    // Rule management
    // ========================================================================

    pub fn add_rule(&self, rule: &[String]) -> Result<bool> {
        self.model.add_rule(rule)
    }

    pub fn remove_rule(&self, rule: &[String]) -> Result<bool> {
        self.model.remove_rule(rule)
    }

    /// Adds rules as one storage batch: under autosave the adapter sees a
    /// single grouped write.
    pub fn add_rules(&self, rules: &[Rule]) -> Result<()> {
        self.sc.add_wait(rules.len());
        let mut result = Ok(());
        for rule in rules {
            if let Err(e) = self.model.add_rule(rule) {
                result = Err(e);
                break;
            }
        }
        result.and(self.sc.settle())
    }

    pub fn remove_rules(&self, rules: &[Rule]) -> Result<()> {
        self.sc.add_wait(rules.len());
        let mut result = Ok(());
        for rule in rules {
            if let Err(e) = self.model.remove_rule(rule) {
                result = Err(e);
                break;
            }
        }
        result.and(self.sc.settle())
    }

    // ========================================================================
    // Policy persistence
    // ========================================================================

    /// Replaces in-memory rules with the adapter's, storage mirroring
    /// suspended for the duration.
    pub fn load_policy(&self) -> Result<()> {
        let adapter = self
            .adapter
            .clone()
            .ok_or_else(|| Error::adapter("no adapter set"))?;

        let was_enabled = self.sc.enabled();
        self.sc.disable();
        self.model.clear_policy();
        let result = adapter.load_policy(&mut ModelSink(&self.model));
        if was_enabled {
            self.sc.enable();
        }
        debug!("policy loaded: {:?}", result.is_ok());
        result
    }

    /// Writes all in-memory rules through the adapter.
    pub fn save_policy(&self) -> Result<()> {
        let adapter = self
            .adapter
            .clone()
            .ok_or_else(|| Error::adapter("no adapter set"))?;
        adapter.save_policy(&ModelSource(&self.model))
    }

    /// Drains queued storage operations.
    pub fn flush(&self) -> Result<()> {
        self.sc.flush()
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    /// Decides a request. Positional arguments mix context options (which
    /// matcher/request/effect definitions to use, possibly inline) with the
    /// request values. Errors deny and surface to the caller.
    pub fn enforce(&self, args: impl IntoIterator<Item = EnforceArg>) -> Result<bool> {
        let (options, rvals) = split_args(args);
        let ctx = build_context(&self.model, options)?;
        self.enforce_with_context(&ctx, &rvals)
    }

    /// [`Enforcer::enforce`] over plain request values.
    pub fn enforce_request(
        &self,
        rvals: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Result<bool> {
        let rvals: Vec<Value> = rvals.into_iter().map(Into::into).collect();
        let ctx = build_context(&self.model, Vec::new())?;
        self.enforce_with_context(&ctx, &rvals)
    }

    fn enforce_with_context(&self, ctx: &EnforceContext, rvals: &[Value]) -> Result<bool> {
        let pdef = ctx.matcher.store_def().clone();
        let fm = self.model.function_map();

        let mut effects: Vec<Effect> = Vec::new();
        let mut matches: Vec<Rule> = Vec::new();
        let mut decision = Effect::Indeterminate;
        let mut effector_err: Option<Error> = None;

        ctx.matcher.range_matches(&ctx.rdef, rvals, &fm, &mut |rule| {
            effects.push(pdef.get_eft(rule));
            matches.push(rule.clone());
            match ctx.effector.merge_effects(&effects, &matches, false) {
                Ok((eft, _)) => {
                    decision = eft;
                    eft == Effect::Indeterminate
                }
                Err(e) => {
                    effector_err = Some(e);
                    false
                }
            }
        })?;

        if let Some(e) = effector_err {
            return Err(e);
        }
        if decision == Effect::Indeterminate {
            decision = ctx.effector.merge_effects(&effects, &matches, true)?.0;
        }

        debug!("request {:?} -> {:?}", rvals, decision);
        Ok(decision == Effect::Allow)
    }

    /// Collects every rule the matcher admits for the request, key-prefixed,
    /// regardless of effect.
    pub fn filter(&self, args: impl IntoIterator<Item = EnforceArg>) -> Result<Vec<Rule>> {
        let mut rules = Vec::new();
        self.range_matches(args, |rule| {
            rules.push(rule.to_vec());
            true
        })?;
        Ok(rules)
    }

    /// Streams matched rules, key-prefixed; the callback returns true to
    /// continue.
    pub fn range_matches(
        &self,
        args: impl IntoIterator<Item = EnforceArg>,
        mut f: impl FnMut(&[String]) -> bool,
    ) -> Result<()> {
        let (options, rvals) = split_args(args);
        let ctx = build_context(&self.model, options)?;
        let key = ctx.matcher.store_def().key().to_string();
        let fm = self.model.function_map();

        ctx.matcher.range_matches(&ctx.rdef, &rvals, &fm, &mut |rule| {
            let mut full = Vec::with_capacity(rule.len() + 1);
            full.push(key.clone());
            full.extend(rule.iter().cloned());
            f(&full)
        })
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

    fn enforcer() -> Enforcer {
        Enforcer::new(Model::from_text(BASIC_MODEL).unwrap(), ()).unwrap()
    }

    #[test]
    fn option_switches_toggle_the_controller() {
        let e = enforcer();
        let sc = e.get_storage_controller();
        assert!(!sc.enabled());
        assert!(!sc.autosave_enabled());

        e.set_option(EnforcerOption::StorageEnabled(true));
        e.set_option(EnforcerOption::Autosave(true));
        assert!(sc.enabled());
        assert!(sc.autosave_enabled());

        e.set_option(EnforcerOption::StorageEnabled(false));
        e.set_option(EnforcerOption::Autosave(false));
        assert!(!sc.enabled());
        assert!(!sc.autosave_enabled());
    }

    #[test]
    fn storage_defaults_follow_the_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        std::fs::write(&path, "p, alice, data1, read\n").unwrap();

        let e = Enforcer::new(
            Model::from_text(BASIC_MODEL).unwrap(),
            path.to_str().unwrap(),
        )
        .unwrap();
        assert!(e.get_storage_controller().enabled());
        assert!(!e.get_storage_controller().autosave_enabled());
        assert!(e.enforce_request(["alice", "data1", "read"]).unwrap());
    }

    #[test]
    fn inline_matcher_definitions_are_removed_on_all_paths() {
        let e = enforcer();
        e.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();

        let allowed = e
            .enforce([
                EnforceArg::from(ContextOption::matcher("p.sub == r.sub")),
                EnforceArg::from("alice"),
                EnforceArg::from("data1"),
                EnforceArg::from("read"),
            ])
            .unwrap();
        assert!(allowed);

        // a broken inline matcher errors and still cleans up
        let res = e.enforce([
            EnforceArg::from(ContextOption::matcher("nonsense(r.sub)")),
            EnforceArg::from("alice"),
        ]);
        assert!(res.is_err());

        // no reserved matcher definitions survive
        assert!(!e.get_model().has_matcher_def("m9999_0"));
        assert!(!e.get_model().has_matcher_def("m9999_1"));
    }

    #[test]
    fn save_policy_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.csv");
        let dst = dir.path().join("dst.csv");
        std::fs::write(&src, "p, alice, data1, read\np, bob, data2, write\n").unwrap();

        let mut e = Enforcer::new(
            Model::from_text(BASIC_MODEL).unwrap(),
            src.to_str().unwrap(),
        )
        .unwrap();

        e.set_adapter(Arc::new(FileAdapter::new(&dst)));
        e.save_policy().unwrap();

        let mut lines: Vec<String> = std::fs::read_to_string(&dst)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect();
        lines.sort();
        assert_eq!(lines, vec!["p, alice, data1, read", "p, bob, data2, write"]);
    }

    #[test]
    fn add_rules_batches_under_autosave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        std::fs::write(&path, "").unwrap();

        let e = Enforcer::new_with_options(
            Model::from_text(BASIC_MODEL).unwrap(),
            path.to_str().unwrap(),
            [EnforcerOption::Autosave(true)],
        )
        .unwrap();

        e.add_rules(&[
            rule(&["p", "alice", "data1", "read"]),
            rule(&["p", "alice", "data1", "read"]), // duplicate, no event
            rule(&["p", "bob", "data2", "write"]),
        ])
        .unwrap();

        assert_eq!(e.get_storage_controller().pending_ops(), 0);
        let mut lines: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect();
        lines.sort();
        assert_eq!(lines, vec!["p, alice, data1, read", "p, bob, data2, write"]);
    }

    #[test]
    fn load_policy_does_not_echo_into_the_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        std::fs::write(&path, "p, alice, data1, read\n").unwrap();

        let e = Enforcer::new_with_options(
            Model::from_text(BASIC_MODEL).unwrap(),
            path.to_str().unwrap(),
            [EnforcerOption::Autosave(true)],
        )
        .unwrap();

        e.load_policy().unwrap();
        assert_eq!(e.get_storage_controller().pending_ops(), 0);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "p, alice, data1, read\n"
        );
    }
}
