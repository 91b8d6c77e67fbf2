// Built-in matching functions exposed to matcher expressions.
//
// Every operator exists in two forms: a plain Rust function and an evaluator
// wrapper that validates arity and string types before delegating. Compiled
// regex and glob patterns are cached in bounded LRU caches keyed by the raw
// pattern.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use globset::{GlobBuilder, GlobMatcher};
use ipnet::IpNet;
use matchexpr::{Error as ExprError, NativeFunction, Value};
use regex::Regex;

use crate::cache::{SyncLruCache, DEFAULT_CACHE_SIZE};

// ============================================================================
// Pattern caches
// ============================================================================

fn regex_cache() -> &'static SyncLruCache<String, Regex> {
    static CACHE: OnceLock<SyncLruCache<String, Regex>> = OnceLock::new();
    CACHE.get_or_init(|| SyncLruCache::new(DEFAULT_CACHE_SIZE))
}

fn glob_cache() -> &'static SyncLruCache<String, GlobMatcher> {
    static CACHE: OnceLock<SyncLruCache<String, GlobMatcher>> = OnceLock::new();
    CACHE.get_or_init(|| SyncLruCache::new(DEFAULT_CACHE_SIZE))
}

fn path_cache() -> &'static SyncLruCache<String, Arc<PathPattern>> {
    static CACHE: OnceLock<SyncLruCache<String, Arc<PathPattern>>> = OnceLock::new();
    CACHE.get_or_init(|| SyncLruCache::new(DEFAULT_CACHE_SIZE))
}

fn compile_regex(pattern: &str) -> Result<Regex, ExprError> {
    regex_cache().get_or_try_insert(pattern.to_string(), || {
        Regex::new(pattern)
            .map_err(|e| ExprError::function("regexMatch", format!("invalid pattern: {}", e)))
    })
}

// ============================================================================
// Regex / glob / ip operators
// ============================================================================

/// True when `key1` matches the regular expression `key2` (unanchored).
pub fn regex_match(key1: &str, key2: &str) -> Result<bool, ExprError> {
    Ok(compile_regex(key2)?.is_match(key1))
}

/// Shell-glob match with `/` as a literal separator, so `*` stays within one
/// path segment and `**` crosses them.
pub fn glob_match(key1: &str, key2: &str) -> Result<bool, ExprError> {
    let matcher = glob_cache().get_or_try_insert(key2.to_string(), || {
        GlobBuilder::new(key2)
            .literal_separator(true)
            .build()
            .map(|g| g.compile_matcher())
            .map_err(|e| ExprError::function("globMatch", format!("invalid pattern: {}", e)))
    })?;
    Ok(matcher.is_match(key1))
}

/// True when `ip1` lies within `ip2`, which is either a CIDR block or a
/// plain address. Unparsable inputs are errors, never silent mismatches.
pub fn ip_match(ip1: &str, ip2: &str) -> Result<bool, ExprError> {
    let ip: IpAddr = ip1.parse().map_err(|_| {
        ExprError::function("ipMatch", format!("'{}' is not an IP address", ip1))
    })?;

    if let Ok(net) = ip2.parse::<IpNet>() {
        return Ok(net.contains(&ip));
    }
    match ip2.parse::<IpAddr>() {
        Ok(other) => Ok(ip == other),
        Err(_) => Err(ExprError::function(
            "ipMatch",
            format!("'{}' is neither an IP address nor a CIDR", ip2),
        )),
    }
}

// ============================================================================
// Segment-based path matching
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Literal(String),
    /// `:name` or `{name}`: exactly one segment.
    Dynamic,
    /// `*`: one or more segments; a pattern that is just `*` matches
    /// anything.
    Star,
}

/// A `/`-segmented pattern compiled once and cached by its raw text.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PathSegment>,
}

fn is_dynamic_segment(segment: &str, prefix: u8, suffix: u8) -> bool {
    let bytes = segment.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    (prefix == 0 || bytes[0] == prefix) && (suffix == 0 || bytes[bytes.len() - 1] == suffix)
}

impl PathPattern {
    fn compile(pattern: &str, prefix: u8, suffix: u8) -> PathPattern {
        let segments = pattern
            .split('/')
            .map(|seg| {
                if seg == "*" {
                    PathSegment::Star
                } else if is_dynamic_segment(seg, prefix, suffix) {
                    PathSegment::Dynamic
                } else {
                    PathSegment::Literal(seg.to_string())
                }
            })
            .collect();
        PathPattern {
            raw: pattern.to_string(),
            segments,
        }
    }

    fn matches(&self, path: &str) -> bool {
        if path == self.raw || self.raw == "*" {
            return true;
        }
        let parts: Vec<&str> = path.split('/').collect();
        Self::match_segments(&parts, &self.segments)
    }

    fn match_segments(path: &[&str], pattern: &[PathSegment]) -> bool {
        match pattern.first() {
            None => path.is_empty(),
            Some(PathSegment::Literal(lit)) => match path.first() {
                Some(seg) if seg == lit => Self::match_segments(&path[1..], &pattern[1..]),
                _ => false,
            },
            Some(PathSegment::Dynamic) => {
                !path.is_empty() && Self::match_segments(&path[1..], &pattern[1..])
            }
            Some(PathSegment::Star) => {
                !path.is_empty()
                    && (Self::match_segments(&path[1..], &pattern[1..])
                        || Self::match_segments(&path[1..], pattern))
            }
        }
    }
}

fn cached_path_pattern(pattern: &str, prefix: u8, suffix: u8) -> Arc<PathPattern> {
    let key = format!("{}\u{1}{}", prefix as char, pattern);
    if let Some(p) = path_cache().get(&key) {
        return p;
    }
    let compiled = Arc::new(PathPattern::compile(pattern, prefix, suffix));
    path_cache().put(key, Arc::clone(&compiled));
    compiled
}

/// `/`-segmented template match: `:name` matches one segment, `*` matches
/// one or more, other segments match literally.
pub fn path_match(path: &str, pattern: &str) -> bool {
    cached_path_pattern(pattern, b':', 0).matches(path)
}

/// Same as [`path_match`] with `{name}` parameter delimiters.
pub fn path_match2(path: &str, pattern: &str) -> bool {
    cached_path_pattern(pattern, b'{', b'}').matches(path)
}

fn is_path_pattern_helper(pattern: &str, prefix: u8, suffix: u8) -> bool {
    pattern
        .split('/')
        .any(|seg| seg == "*" || is_dynamic_segment(seg, prefix, suffix))
}

pub fn is_path_pattern(pattern: &str) -> bool {
    is_path_pattern_helper(pattern, b':', 0)
}

pub fn is_path_pattern2(pattern: &str) -> bool {
    is_path_pattern_helper(pattern, b'{', b'}')
}

// ============================================================================
// keyMatch compatibility family
// ============================================================================

/// `*`-suffix prefix match: `/foo/*` matches everything under `/foo/`.
pub fn key_match(key1: &str, key2: &str) -> bool {
    match key2.find('*') {
        None => key1 == key2,
        Some(i) => {
            if key1.len() > i {
                key1.as_bytes()[..i] == key2.as_bytes()[..i]
            } else {
                key1.as_bytes() == &key2.as_bytes()[..i]
            }
        }
    }
}

/// Returns the part of `key1` covered by the `*` in `key2`, or "".
pub fn key_get(key1: &str, key2: &str) -> String {
    match key2.find('*') {
        None => String::new(),
        Some(i) => {
            if key1.len() > i && key1.as_bytes()[..i] == key2.as_bytes()[..i] {
                key1[i..].to_string()
            } else {
                String::new()
            }
        }
    }
}

/// `:name` one-segment wildcards, `/*` tail wildcard.
pub fn key_match2(key1: &str, key2: &str) -> Result<bool, ExprError> {
    let pattern = key2.replace("/*", "/.*");
    let pattern = compile_regex(r":[^/]+")?
        .replace_all(&pattern, "[^/]+")
        .into_owned();
    regex_match(key1, &format!("^{}$", pattern))
}

/// Returns the value captured for `:path_var` in `key2`, or "".
pub fn key_get2(key1: &str, key2: &str, path_var: &str) -> Result<String, ExprError> {
    let pattern = key2.replace("/*", "/.*");
    let token_re = compile_regex(r":[^/]+")?;
    let names: Vec<String> = token_re
        .find_iter(&pattern)
        .map(|m| m.as_str()[1..].to_string())
        .collect();
    let pattern = token_re.replace_all(&pattern, "([^/]+)").into_owned();
    let re = compile_regex(&format!("^{}$", pattern))?;

    let captures = match re.captures(key1) {
        Some(c) => c,
        None => return Ok(String::new()),
    };
    for (i, name) in names.iter().enumerate() {
        if name == path_var {
            return Ok(captures
                .get(i + 1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default());
        }
    }
    Ok(String::new())
}

/// `{name}` one-segment wildcards.
pub fn key_match3(key1: &str, key2: &str) -> Result<bool, ExprError> {
    let pattern = key2.replace("/*", "/.*");
    let pattern = compile_regex(r"\{[^/]+\}")?
        .replace_all(&pattern, "[^/]+")
        .into_owned();
    regex_match(key1, &format!("^{}$", pattern))
}

/// Like keyMatch3, but repeated `{name}` tokens must capture equal values.
pub fn key_match4(key1: &str, key2: &str) -> Result<bool, ExprError> {
    let pattern = key2.replace("/*", "/.*");
    let token_re = compile_regex(r"\{[^/]+\}")?;
    let tokens: Vec<String> = token_re
        .find_iter(&pattern)
        .map(|m| m.as_str().to_string())
        .collect();
    let pattern = token_re.replace_all(&pattern, "([^/]+)").into_owned();
    let re = compile_regex(&format!("^{}$", pattern))?;

    let captures = match re.captures(key1) {
        Some(c) => c,
        None => return Ok(false),
    };
    if captures.len() - 1 != tokens.len() {
        return Err(ExprError::function(
            "keyMatch4",
            "capture count does not equal token count",
        ));
    }

    let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for (i, token) in tokens.iter().enumerate() {
        let value = captures.get(i + 1).map(|m| m.as_str()).unwrap_or("");
        match seen.get(token.as_str()) {
            Some(prev) if *prev != value => return Ok(false),
            _ => {
                seen.insert(token, value);
            }
        }
    }
    Ok(true)
}

/// Like keyMatch3, ignoring any `?query` suffix on `key1`.
pub fn key_match5(key1: &str, key2: &str) -> Result<bool, ExprError> {
    let key1 = match key1.find('?') {
        Some(i) => &key1[..i],
        None => key1,
    };
    key_match3(key1, key2)
}

// ============================================================================
// Evaluator wrappers
// ============================================================================

fn string_args<'a>(
    name: &str,
    expected: usize,
    args: &'a [Value],
) -> Result<Vec<&'a str>, ExprError> {
    if args.len() != expected {
        return Err(ExprError::Arity {
            function: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    args.iter()
        .map(|v| match v {
            Value::Str(s) => Ok(s.as_str()),
            _ => Err(ExprError::function(name, "argument must be a string")),
        })
        .collect()
}

/// Wraps an infallible two-argument matching function for the evaluator.
pub fn wrap_matching_fn(name: &'static str, f: fn(&str, &str) -> bool) -> NativeFunction {
    Arc::new(move |args: &[Value]| {
        let args = string_args(name, 2, args)?;
        Ok(Value::Bool(f(args[0], args[1])))
    })
}

/// Wraps a fallible two-argument matching function for the evaluator.
pub fn wrap_matching_fn_err(
    name: &'static str,
    f: fn(&str, &str) -> Result<bool, ExprError>,
) -> NativeFunction {
    Arc::new(move |args: &[Value]| {
        let args = string_args(name, 2, args)?;
        Ok(Value::Bool(f(args[0], args[1])?))
    })
}

pub fn key_get_fn() -> NativeFunction {
    Arc::new(|args: &[Value]| {
        let args = string_args("keyGet", 2, args)?;
        Ok(Value::Str(key_get(args[0], args[1])))
    })
}

pub fn key_get2_fn() -> NativeFunction {
    Arc::new(|args: &[Value]| {
        let args = string_args("keyGet2", 3, args)?;
        Ok(Value::Str(key_get2(args[0], args[1], args[2])?))
    })
}

// ============================================================================
// Name matchers for pattern roles and pattern domains
// ============================================================================

/// Decides whether a role or domain name is a pattern and whether a concrete
/// name matches it. Configured on role managers to enable pattern roles.
pub trait NameMatcher: Send + Sync {
    fn is_pattern(&self, s: &str) -> bool;
    fn matches(&self, s: &str, pattern: &str) -> bool;
}

/// Matcher built from two plain functions.
pub struct FnMatcher {
    is_pattern_fn: fn(&str) -> bool,
    match_fn: fn(&str, &str) -> bool,
}

impl FnMatcher {
    pub fn new(is_pattern_fn: fn(&str) -> bool, match_fn: fn(&str, &str) -> bool) -> Self {
        FnMatcher {
            is_pattern_fn,
            match_fn,
        }
    }
}

impl NameMatcher for FnMatcher {
    fn is_pattern(&self, s: &str) -> bool {
        (self.is_pattern_fn)(s)
    }

    fn matches(&self, s: &str, pattern: &str) -> bool {
        (self.match_fn)(s, pattern)
    }
}

/// Marks patterns with a string prefix; the prefix is stripped before the
/// inner matching function runs. Example: `reg:user:.*` with prefix `reg:`.
pub struct PrefixMatcher {
    prefix: String,
    match_fn: fn(&str, &str) -> bool,
}

impl PrefixMatcher {
    pub fn new(prefix: impl Into<String>, match_fn: fn(&str, &str) -> bool) -> Self {
        PrefixMatcher {
            prefix: prefix.into(),
            match_fn,
        }
    }
}

impl NameMatcher for PrefixMatcher {
    fn is_pattern(&self, s: &str) -> bool {
        s.starts_with(&self.prefix)
    }

    fn matches(&self, s: &str, pattern: &str) -> bool {
        match pattern.strip_prefix(&self.prefix) {
            Some(stripped) => (self.match_fn)(s, stripped),
            None => false,
        }
    }
}

fn regex_match_quiet(s: &str, pattern: &str) -> bool {
    regex_match(s, pattern).unwrap_or(false)
}

/// NameMatcher over [`path_match`] patterns.
pub fn path_name_matcher() -> Arc<dyn NameMatcher> {
    Arc::new(FnMatcher::new(is_path_pattern, path_match))
}

/// NameMatcher over [`path_match2`] patterns.
pub fn path_name_matcher2() -> Arc<dyn NameMatcher> {
    Arc::new(FnMatcher::new(is_path_pattern2, path_match2))
}

/// NameMatcher treating `prefix`-marked names as regular expressions.
pub fn regex_name_matcher(prefix: impl Into<String>) -> Arc<dyn NameMatcher> {
    Arc::new(PrefixMatcher::new(prefix, regex_match_quiet))
}
