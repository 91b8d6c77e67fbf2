// Named definitions from the model: request/policy/role/effect shapes and
// the matcher compiler that folds a boolean expression into a stage tree.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use matchexpr::{render_tokens, tokenize, Error as ExprError, FunctionRegistry, Program, Token, TokenKind, Value};
use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{Effect, Rule, DEFAULT_ROLE_PARTY, DEFAULT_SEP};

// ============================================================================
// Reference rewriting and extraction
// ============================================================================

fn arg_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([prg][0-9]*)(\.|_)([A-Za-z0-9_]+)").unwrap())
}

fn policy_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[pg][0-9]*_[A-Za-z0-9_]+").unwrap())
}

fn request_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\br[0-9]*_[A-Za-z0-9_]+").unwrap())
}

/// Rewrites dotted field references (`r.sub`, `p2.obj`) to their underscore
/// form before parsing; the evaluator treats dotted names as property access.
pub fn normalize_refs(expr: &str) -> String {
    arg_ref_regex().replace_all(expr, "${1}_${3}").into_owned()
}

fn find_refs(re: &Regex, expr: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in re.find_iter(expr) {
        let s = m.as_str().to_string();
        if !seen.contains(&s) {
            seen.push(s);
        }
    }
    seen
}

// ============================================================================
// Policy / request / effect / role definitions
// ============================================================================

/// Field layout of a rule family (`p`, `p2`, `g`, ...): maps names like
/// `p_sub` to positional indices.
#[derive(Debug, Clone)]
pub struct PolicyDef {
    key: String,
    args: Vec<String>,
    arg_index: HashMap<String, usize>,
}

impl PolicyDef {
    pub fn new(key: &str, arguments: &str) -> PolicyDef {
        let args: Vec<String> = arguments
            .replace(' ', "")
            .split(DEFAULT_SEP)
            .map(|s| s.to_string())
            .collect();
        let arg_index = args
            .iter()
            .enumerate()
            .map(|(i, arg)| (format!("{}_{}", key, arg), i))
            .collect();
        PolicyDef {
            key: key.to_string(),
            args,
            arg_index,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn has(&self, name: &str) -> bool {
        self.arg_index.contains_key(name)
    }

    /// Looks up a named field in a rule. Rules passed with their family key
    /// are one longer than the definition; indices shift accordingly.
    pub fn get_parameter<'a>(&self, rule: &'a [String], name: &str) -> std::result::Result<&'a str, ExprError> {
        let mut index = *self
            .arg_index
            .get(name)
            .ok_or_else(|| ExprError::UnknownParameter(name.to_string()))?;
        if rule.len() > self.args.len() {
            index += 1;
        }
        rule.get(index)
            .map(|s| s.as_str())
            .ok_or_else(|| ExprError::Type("rule has not enough values".to_string()))
    }

    pub fn get_parameters(&self, rule: &[String], names: &[String]) -> std::result::Result<Rule, ExprError> {
        names
            .iter()
            .map(|name| self.get_parameter(rule, name).map(|s| s.to_string()))
            .collect()
    }

    /// Per-rule effect from the optional `eft` field. An absent definition or
    /// empty value means Allow.
    pub fn get_eft(&self, rule: &[String]) -> Effect {
        let eft_arg = format!("{}_eft", self.key);
        if !self.has(&eft_arg) {
            return Effect::Allow;
        }
        match self.get_parameter(rule, &eft_arg).unwrap_or("") {
            "" | "allow" => Effect::Allow,
            "deny" => Effect::Deny,
            _ => Effect::Indeterminate,
        }
    }
}

impl fmt::Display for PolicyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.args.join(", "))
    }
}

/// Field layout of the request tuple; values are runtime values rather than
/// strings.
#[derive(Debug, Clone)]
pub struct RequestDef {
    key: String,
    args: Vec<String>,
    arg_index: HashMap<String, usize>,
}

impl RequestDef {
    pub fn new(key: &str, arguments: &str) -> RequestDef {
        let args: Vec<String> = arguments
            .replace(' ', "")
            .split(DEFAULT_SEP)
            .map(|s| s.to_string())
            .collect();
        let arg_index = args
            .iter()
            .enumerate()
            .map(|(i, arg)| (format!("{}_{}", key, arg), i))
            .collect();
        RequestDef {
            key: key.to_string(),
            args,
            arg_index,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn has(&self, name: &str) -> bool {
        self.arg_index.contains_key(name)
    }

    pub fn get_parameter(&self, values: &[Value], name: &str) -> std::result::Result<Value, ExprError> {
        let index = *self
            .arg_index
            .get(name)
            .ok_or_else(|| ExprError::UnknownParameter(name.to_string()))?;
        values
            .get(index)
            .cloned()
            .ok_or_else(|| ExprError::Type("request tuple has not enough values".to_string()))
    }
}

impl fmt::Display for RequestDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.args.join(", "))
    }
}

/// An effect definition: a name and its combining expression, stored with
/// whitespace squeezed out so the combiner can match it literally.
#[derive(Debug, Clone)]
pub struct EffectDef {
    key: String,
    expr: String,
}

impl EffectDef {
    pub fn new(key: &str, expr: &str) -> EffectDef {
        EffectDef {
            key: key.to_string(),
            expr: expr.replace(' ', ""),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }
}

impl fmt::Display for EffectDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.expr)
    }
}

/// A role definition: arity 2 for plain roles, 3 for domain-qualified ones.
#[derive(Debug, Clone)]
pub struct RoleDef {
    key: String,
    nargs: usize,
}

impl RoleDef {
    pub fn new(key: &str, arguments: &str) -> RoleDef {
        RoleDef {
            key: key.to_string(),
            nargs: arguments.split(DEFAULT_SEP).count(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn nargs(&self) -> usize {
        self.nargs
    }
}

impl fmt::Display for RoleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = vec![DEFAULT_ROLE_PARTY; self.nargs];
        write!(f, "{} = {}", self.key, args.join(", "))
    }
}

// ============================================================================
// Matcher stages
// ============================================================================

/// One conjunctive sub-expression of a compiled matcher. Disjunctions branch
/// into sibling children; conjunctions nest.
#[derive(Debug, Clone)]
pub struct MatcherStage {
    expr: String,
    policy_args: Vec<String>,
    request_args: Vec<String>,
    children: Vec<MatcherStage>,
}

impl MatcherStage {
    pub fn new(expr: impl Into<String>) -> MatcherStage {
        let expr = expr.into();
        let policy_args = find_refs(policy_ref_regex(), &expr);
        let request_args = find_refs(request_ref_regex(), &expr);
        MatcherStage {
            expr,
            policy_args,
            request_args,
            children: Vec::new(),
        }
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Policy-side references (`p_*`, `g_*`) this stage touches.
    pub fn policy_args(&self) -> &[String] {
        &self.policy_args
    }

    /// Request-side references (`r_*`) this stage touches.
    pub fn request_args(&self) -> &[String] {
        &self.request_args
    }

    pub fn children(&self) -> &[MatcherStage] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn recursive_policy_args(&self) -> Vec<String> {
        let mut res = self.policy_args.clone();
        for child in &self.children {
            for arg in child.recursive_policy_args() {
                if !res.contains(&arg) {
                    res.push(arg);
                }
            }
        }
        res
    }
}

// ============================================================================
// Matcher compiler
// ============================================================================

/// Locates the splitting operator for the current token slice: the first
/// top-level `||` if any, otherwise the last top-level `&&`. Also reports
/// whether the whole slice is wrapped in one bracket pair.
fn next_operator(tokens: &[Token]) -> (Option<usize>, bool) {
    let mut clause = 0i32;
    let mut index = None;
    let mut is_bracket = matches!(tokens.first(), Some(t) if t.kind == TokenKind::Clause);

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Clause => clause += 1,
            TokenKind::ClauseClose => {
                clause -= 1;
                if is_bracket && clause == 0 && i != tokens.len() - 1 {
                    is_bracket = false;
                }
            }
            TokenKind::LogicalOp => {
                if clause != 0 {
                    continue;
                }
                index = Some(i);
                if token.text == "||" {
                    return (index, false);
                }
            }
            _ => {}
        }
    }

    (index, is_bracket)
}

/// Folds a token slice into the stage tree. `and_tail` carries the pending
/// right-hand sides of `&&` splits; they are attached below the deepest leaf
/// of whichever branch is being built.
fn build_expr_tree(
    node: &mut MatcherStage,
    tokens: &[Token],
    mut and_tail: Vec<Vec<Token>>,
) -> Result<()> {
    if tokens.is_empty() {
        return Err(Error::Compile("empty sub-expression".to_string()));
    }

    let (index, is_bracket) = next_operator(tokens);

    if is_bracket {
        return build_expr_tree(node, &tokens[1..tokens.len() - 1], and_tail);
    }

    match index {
        None => {
            let mut next = MatcherStage::new(render_tokens(tokens));
            if let Some(tail) = and_tail.pop() {
                build_expr_tree(&mut next, &tail, and_tail)?;
            }
            node.children.push(next);
            Ok(())
        }
        Some(i) if tokens[i].text == "||" => {
            build_expr_tree(node, &tokens[..i], and_tail.clone())?;
            build_expr_tree(node, &tokens[i + 1..], and_tail)
        }
        Some(i) => {
            and_tail.push(tokens[i + 1..].to_vec());
            build_expr_tree(node, &tokens[..i], and_tail)
        }
    }
}

/// References to properties starting with `_` never resolve; reject them at
/// compile time with the offending expression.
fn check_private_refs(tokens: &[Token], expr: &str) -> Result<()> {
    for token in tokens {
        if token.kind != TokenKind::Accessor {
            continue;
        }
        for segment in token.parts.iter().skip(1) {
            if segment.starts_with('_') {
                return Err(Error::Compile(format!(
                    "{}: reference to private property '{}'",
                    expr, segment
                )));
            }
        }
    }
    Ok(())
}

/// A named matcher definition. Holds the raw stage expressions (stage keys
/// like `m.1` append) and, once built, the folded stage tree.
#[derive(Debug, Clone)]
pub struct MatcherDef {
    key: String,
    stages: Vec<(i32, String)>,
    root: Option<MatcherStage>,
}

impl MatcherDef {
    /// `key` may carry a stage suffix (`m.0`); the suffix orders stages that
    /// are conjoined at build time.
    pub fn new(key: &str, expr: &str) -> MatcherDef {
        let (key, index) = match key.split_once('.') {
            Some((base, idx)) => (base.to_string(), idx.parse().unwrap_or(-1)),
            None => (key.to_string(), -1),
        };
        MatcherDef {
            key,
            stages: vec![(index, expr.to_string())],
            root: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn add_stage(&mut self, index: i32, expr: &str) {
        self.stages.retain(|(i, _)| *i != index);
        self.stages.push((index, expr.to_string()));
        self.root = None;
    }

    /// The conjoined, reference-normalized source of all stages.
    fn combined_source(&self) -> String {
        let mut stages = self.stages.clone();
        stages.sort_by_key(|(index, _)| *index);
        let exprs: Vec<String> = stages.iter().map(|(_, e)| e.clone()).collect();
        let combined = if exprs.len() == 1 {
            exprs.into_iter().next().unwrap()
        } else {
            exprs
                .iter()
                .map(|e| format!("({})", e))
                .collect::<Vec<_>>()
                .join(" && ")
        };
        normalize_refs(&combined)
    }

    /// Tokenizes, validates and folds the expression into the stage tree.
    pub fn build(&mut self, functions: &FunctionRegistry) -> Result<()> {
        let source = self.combined_source();

        let tokens = tokenize(&source)
            .map_err(|e| Error::Compile(format!("{}: {}", source, e)))?;
        check_private_refs(&tokens, &source)?;
        Program::compile(&source, functions)
            .map_err(|e| Error::Compile(format!("{}: {}", source, e)))?;

        let mut root = MatcherStage::new("");
        build_expr_tree(&mut root, &tokens, Vec::new())?;
        self.root = Some(root);
        Ok(())
    }

    /// The root of the stage tree; present after a successful build.
    pub fn root(&self) -> Option<&MatcherStage> {
        self.root.as_ref()
    }

    pub fn policy_args(&self) -> Vec<String> {
        self.root
            .as_ref()
            .map(|r| r.recursive_policy_args())
            .unwrap_or_default()
    }

    /// The rule family this matcher indexes over, derived from its first
    /// policy-side reference; `p` when the matcher references none.
    pub fn policy_key(&self) -> String {
        self.policy_args()
            .first()
            .and_then(|arg| arg.split('_').next())
            .unwrap_or("p")
            .to_string()
    }
}

impl fmt::Display for MatcherDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.combined_source())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_def_indexes_fields() {
        let def = PolicyDef::new("p", "sub, obj, act");
        let rule = crate::types::rule(&["alice", "data1", "read"]);
        assert_eq!(def.get_parameter(&rule, "p_obj").unwrap(), "data1");
        assert!(def.get_parameter(&rule, "p_nope").is_err());

        // key-prefixed rules shift by one
        let prefixed = crate::types::rule(&["p", "alice", "data1", "read"]);
        assert_eq!(def.get_parameter(&prefixed, "p_sub").unwrap(), "alice");
    }

    #[test]
    fn eft_parsing() {
        let def = PolicyDef::new("p", "sub, obj, act, eft");
        let allow = crate::types::rule(&["a", "d", "r", ""]);
        let deny = crate::types::rule(&["a", "d", "r", "deny"]);
        let odd = crate::types::rule(&["a", "d", "r", "maybe"]);
        assert_eq!(def.get_eft(&allow), Effect::Allow);
        assert_eq!(def.get_eft(&deny), Effect::Deny);
        assert_eq!(def.get_eft(&odd), Effect::Indeterminate);

        let plain = PolicyDef::new("p", "sub, obj, act");
        assert_eq!(plain.get_eft(&crate::types::rule(&["a", "d", "r"])), Effect::Allow);
    }

    #[test]
    fn normalize_rewrites_dotted_refs() {
        assert_eq!(
            normalize_refs("r.sub == p.sub && g(r.sub, p2.sub)"),
            "r_sub == p_sub && g(r_sub, p2_sub)"
        );
        // only the field reference is rewritten; deeper property access stays
        assert_eq!(normalize_refs("r.sub.Age > 18"), "r_sub.Age > 18");
    }

    fn build(expr: &str) -> MatcherDef {
        let fm = crate::fm::FunctionMap::default_function_map();
        let mut def = MatcherDef::new("m", expr);
        def.build(fm.registry()).unwrap();
        def
    }

    fn chain_exprs(stage: &MatcherStage) -> Vec<String> {
        let mut res = vec![stage.expr().to_string()];
        if let Some(child) = stage.children().first() {
            res.extend(chain_exprs(child));
        }
        res
    }

    #[test]
    fn conjunctions_nest() {
        let def = build("r.sub == p.sub && r.obj == p.obj && r.act == p.act");
        let root = def.root().unwrap();
        assert_eq!(root.children().len(), 1);
        assert_eq!(
            chain_exprs(&root.children()[0]),
            vec!["r_sub == p_sub", "r_obj == p_obj", "r_act == p_act"]
        );
    }

    #[test]
    fn disjunctions_branch() {
        let def = build("r.sub == p.sub || r.sub == 'root'");
        let root = def.root().unwrap();
        assert_eq!(root.children().len(), 2);
        assert!(root.children().iter().all(|c| c.is_leaf()));
    }

    #[test]
    fn or_branches_share_the_and_tail() {
        let def = build("(r.sub == p.sub || r.sub == 'root') && r.obj == p.obj");
        let root = def.root().unwrap();
        assert_eq!(root.children().len(), 2);
        for child in root.children() {
            assert_eq!(child.children().len(), 1);
            assert_eq!(child.children()[0].expr(), "r_obj == p_obj");
        }
    }

    #[test]
    fn stage_reference_extraction() {
        let stage = MatcherStage::new("g(r_sub, p_sub) && r_obj == p_obj");
        assert_eq!(stage.policy_args(), &["p_sub".to_string(), "p_obj".to_string()]);
        assert_eq!(stage.request_args(), &["r_sub".to_string(), "r_obj".to_string()]);
    }

    #[test]
    fn multi_stage_keys_conjoin() {
        let fm = crate::fm::FunctionMap::default_function_map();
        let mut def = MatcherDef::new("m.0", "r.sub == p.sub");
        def.add_stage(1, "r.obj == p.obj");
        def.build(fm.registry()).unwrap();
        let root = def.root().unwrap();
        assert_eq!(
            chain_exprs(&root.children()[0]),
            vec!["r_sub == p_sub", "r_obj == p_obj"]
        );
    }

    #[test]
    fn compile_failures_name_the_expression() {
        let fm = crate::fm::FunctionMap::default_function_map();

        let mut bad_syntax = MatcherDef::new("m", "r.sub == ");
        assert!(matches!(bad_syntax.build(fm.registry()), Err(Error::Compile(_))));

        let mut unknown_fn = MatcherDef::new("m", "noSuchFn(r.sub, p.sub)");
        let err = unknown_fn.build(fm.registry()).unwrap_err();
        assert!(err.to_string().contains("noSuchFn"));

        let mut private = MatcherDef::new("m", "r.sub._secret == 'x'");
        let err = private.build(fm.registry()).unwrap_err();
        assert!(err.to_string().contains("_secret"));
    }

    #[test]
    fn policy_key_defaults_to_p() {
        let def = build("r.sub == 'alice'");
        assert_eq!(def.policy_key(), "p");
        let def = build("g.user == r.sub");
        assert_eq!(def.policy_key(), "g");
    }
}
