// File-backed adapter: one rule per line, comma-separated.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{rule_hash, Rule};

use super::{
    load_policy_line, rule_to_line, Adapter, BatchAdapter, RuleSink, RuleSource, SimpleAdapter,
};

/// In-memory working set for the load-modify-save incremental paths.
#[derive(Default)]
struct RuleSet {
    rules: HashMap<String, Rule>,
}

impl RuleSet {
    fn remove_rule(&mut self, rule: &[String]) {
        self.rules.remove(&rule_hash(rule));
    }
}

impl RuleSink for RuleSet {
    fn add_rule(&mut self, rule: &[String]) -> Result<bool> {
        Ok(self
            .rules
            .insert(rule_hash(rule), rule.to_vec())
            .is_none())
    }
}

impl RuleSource for RuleSet {
    fn range_rules(&self, f: &mut dyn FnMut(&[String]) -> bool) {
        for rule in self.rules.values() {
            if !f(rule) {
                break;
            }
        }
    }
}

/// Stores rules in a plain text file. Line order is not preserved across
/// round-trips; rule identity is.
pub struct FileAdapter {
    path: PathBuf,
}

impl FileAdapter {
    pub fn new(path: impl AsRef<Path>) -> FileAdapter {
        FileAdapter {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load_set(&self) -> Result<RuleSet> {
        let mut set = RuleSet::default();
        self.load_policy(&mut set)?;
        Ok(set)
    }

    fn save_set(&self, set: &RuleSet) -> Result<()> {
        self.save_policy(set)
    }
}

impl Adapter for FileAdapter {
    fn load_policy(&self, sink: &mut dyn RuleSink) -> Result<()> {
        let text = std::fs::read_to_string(&self.path).map_err(Error::adapter)?;
        for line in text.lines() {
            load_policy_line(line, sink)?;
        }
        Ok(())
    }

    fn save_policy(&self, source: &dyn RuleSource) -> Result<()> {
        let mut file = std::fs::File::create(&self.path).map_err(Error::adapter)?;
        let mut write_err = None;
        source.range_rules(&mut |rule| {
            match writeln!(file, "{}", rule_to_line(rule)) {
                Ok(()) => true,
                Err(e) => {
                    write_err = Some(e);
                    false
                }
            }
        });
        match write_err {
            Some(e) => Err(Error::adapter(e)),
            None => file.flush().map_err(Error::adapter),
        }
    }

    fn as_simple(&self) -> Option<&dyn SimpleAdapter> {
        Some(self)
    }

    fn as_batch(&self) -> Option<&dyn BatchAdapter> {
        Some(self)
    }
}

impl SimpleAdapter for FileAdapter {
    fn add_rule(&self, rule: &[String]) -> Result<()> {
        let mut set = self.load_set()?;
        set.add_rule(rule)?;
        self.save_set(&set)
    }

    fn remove_rule(&self, rule: &[String]) -> Result<()> {
        let mut set = self.load_set()?;
        set.remove_rule(rule);
        self.save_set(&set)
    }
}

impl BatchAdapter for FileAdapter {
    fn add_rules(&self, rules: &[Rule]) -> Result<()> {
        let mut set = self.load_set()?;
        for rule in rules {
            set.add_rule(rule)?;
        }
        self.save_set(&set)
    }

    fn remove_rules(&self, rules: &[Rule]) -> Result<()> {
        let mut set = self.load_set()?;
        for rule in rules {
            set.remove_rule(rule);
        }
        self.save_set(&set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::rule;

    struct VecSink(Vec<Rule>);

    impl RuleSink for VecSink {
        fn add_rule(&mut self, rule: &[String]) -> Result<bool> {
            self.0.push(rule.to_vec());
            Ok(true)
        }
    }

    fn lines_of(path: &Path) -> Vec<String> {
        let mut lines: Vec<String> = std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect();
        lines.sort();
        lines
    }

    #[test]
    fn save_then_load_keeps_rule_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        let adapter = FileAdapter::new(&path);

        let mut set = RuleSet::default();
        set.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();
        set.add_rule(&rule(&["g", "alice", "admin"])).unwrap();
        adapter.save_policy(&set).unwrap();

        let mut sink = VecSink(Vec::new());
        adapter.load_policy(&mut sink).unwrap();

        let mut loaded: Vec<String> = sink.0.iter().map(|r| rule_hash(r)).collect();
        loaded.sort();
        assert_eq!(loaded, vec!["g,alice,admin", "p,alice,data1,read"]);
    }

    #[test]
    fn load_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        std::fs::write(&path, "# header\n\np, alice, data1, read\n").unwrap();

        let mut sink = VecSink(Vec::new());
        FileAdapter::new(&path).load_policy(&mut sink).unwrap();
        assert_eq!(sink.0, vec![rule(&["p", "alice", "data1", "read"])]);
    }

    #[test]
    fn incremental_writes_modify_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        std::fs::write(&path, "p, alice, data1, read\n").unwrap();
        let adapter = FileAdapter::new(&path);

        adapter.add_rule(&rule(&["p", "bob", "data2", "write"])).unwrap();
        adapter.remove_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();
        assert_eq!(lines_of(&path), vec!["p, bob, data2, write"]);

        adapter
            .add_rules(&[
                rule(&["p", "carol", "data3", "read"]),
                rule(&["p", "dave", "data4", "read"]),
            ])
            .unwrap();
        adapter
            .remove_rules(&[rule(&["p", "bob", "data2", "write"])])
            .unwrap();
        assert_eq!(
            lines_of(&path),
            vec!["p, carol, data3, read", "p, dave, data4, read"]
        );

        // removing an unknown rule is a no-op
        adapter.remove_rule(&rule(&["p", "ghost", "x", "y"])).unwrap();
        assert_eq!(lines_of(&path).len(), 2);
    }

    #[test]
    fn missing_file_surfaces_as_adapter_error() {
        let adapter = FileAdapter::new("/nonexistent/policy.csv");
        let mut sink = VecSink(Vec::new());
        assert!(matches!(
            adapter.load_policy(&mut sink),
            Err(Error::Adapter(_))
        ));
    }
}
