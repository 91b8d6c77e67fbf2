// Storage integration: adapter contracts, the line-oriented rule format and
// the controller mirroring rule changes into an adapter.

mod controller;
mod file_adapter;

pub use controller::StorageController;
pub use file_adapter::FileAdapter;

use crate::error::Result;
use crate::model::Model;
use crate::types::Rule;

/// Receives rules during a policy load.
pub trait RuleSink {
    fn add_rule(&mut self, rule: &[String]) -> Result<bool>;
}

/// Enumerates rules for a policy save; true continues.
pub trait RuleSource {
    fn range_rules(&self, f: &mut dyn FnMut(&[String]) -> bool);
}

/// The storage adapter contract. Back-ends implement the bulk pair and
/// advertise finer-grained capabilities through the accessors; the
/// controller picks its flush path from them.
pub trait Adapter: Send + Sync {
    /// Loads all rules from storage into the sink.
    fn load_policy(&self, sink: &mut dyn RuleSink) -> Result<()>;

    /// Replaces the stored rules with the source's.
    fn save_policy(&self, source: &dyn RuleSource) -> Result<()>;

    fn as_simple(&self) -> Option<&dyn SimpleAdapter> {
        None
    }

    fn as_batch(&self) -> Option<&dyn BatchAdapter> {
        None
    }
}

/// Per-rule incremental writes.
pub trait SimpleAdapter: Adapter {
    fn add_rule(&self, rule: &[String]) -> Result<()>;
    fn remove_rule(&self, rule: &[String]) -> Result<()>;
}

/// Grouped incremental writes.
pub trait BatchAdapter: Adapter {
    fn add_rules(&self, rules: &[Rule]) -> Result<()>;
    fn remove_rules(&self, rules: &[Rule]) -> Result<()>;
}

/// Adapter that stores nothing; the default until a real adapter is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAdapter;

impl Adapter for NoopAdapter {
    fn load_policy(&self, _sink: &mut dyn RuleSink) -> Result<()> {
        Ok(())
    }

    fn save_policy(&self, _source: &dyn RuleSource) -> Result<()> {
        Ok(())
    }
}

impl SimpleAdapter for NoopAdapter {
    fn add_rule(&self, _rule: &[String]) -> Result<()> {
        Ok(())
    }

    fn remove_rule(&self, _rule: &[String]) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Rule line format
// ============================================================================

/// Parses one stored rule line: comma-separated fields, leading space
/// trimmed, double quotes protecting embedded commas. Blank lines and `#`
/// comments yield None.
pub fn parse_rule_line(line: &str) -> Option<Rule> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = trimmed.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                // doubled quote is an escaped quote
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.trim().is_empty() => {
                in_quotes = true;
                current.clear();
            }
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    Some(fields)
}

/// Loads one text line into the sink, skipping blanks and comments.
pub fn load_policy_line(line: &str, sink: &mut dyn RuleSink) -> Result<()> {
    if let Some(rule) = parse_rule_line(line) {
        sink.add_rule(&rule)?;
    }
    Ok(())
}

/// Renders a rule as a stored line.
pub fn rule_to_line(rule: &[String]) -> String {
    rule.join(", ")
}

// ============================================================================
// Model bridging
// ============================================================================

/// Feeds adapter loads into a model.
pub struct ModelSink<'a>(pub &'a Model);

impl RuleSink for ModelSink<'_> {
    fn add_rule(&mut self, rule: &[String]) -> Result<bool> {
        self.0.add_rule(rule)
    }
}

/// Exposes a model's rules to adapter saves.
pub struct ModelSource<'a>(pub &'a Model);

impl RuleSource for ModelSource<'_> {
    fn range_rules(&self, f: &mut dyn FnMut(&[String]) -> bool) {
        self.0.range_rules(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::rule;

    #[test]
    fn parses_plain_lines() {
        assert_eq!(
            parse_rule_line("p, alice, data1, read"),
            Some(rule(&["p", "alice", "data1", "read"]))
        );
        assert_eq!(parse_rule_line("  "), None);
        assert_eq!(parse_rule_line("# comment"), None);
    }

    #[test]
    fn quoted_fields_keep_commas() {
        assert_eq!(
            parse_rule_line(r#"p2, "r2.sub.Age > 60 && r2.sub.Age < 100", /data1, read"#),
            Some(rule(&[
                "p2",
                "r2.sub.Age > 60 && r2.sub.Age < 100",
                "/data1",
                "read"
            ]))
        );
    }

    #[test]
    fn line_round_trip_by_hash() {
        let r = rule(&["p", "alice", "data1", "read"]);
        assert_eq!(parse_rule_line(&rule_to_line(&r)), Some(r));
    }
}
