// INI-shaped reader for model text.
//
// Accepted shape:
//   [section]
//   key = value
// `#` and `;` start comments, either on their own line or trailing a value
// when preceded by whitespace. Values keep their internal spacing. Later
// duplicate keys within a section overwrite earlier ones at install time;
// this reader preserves every pair so stage-suffixed matcher keys
// (`m.0`, `m.1`) survive.

use crate::error::{Error, Result};

/// One parsed section: its name plus key/value pairs in file order.
#[derive(Debug, Clone, Default)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

/// A parsed model document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: Vec<Section>,
}

impl Config {
    pub fn from_text(text: &str) -> Result<Config> {
        let mut sections: Vec<Section> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    Error::Config(format!("line {}: unterminated section header", lineno + 1))
                })?;
                sections.push(Section {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("line {}: expected 'key = value'", lineno + 1))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Config(format!("line {}: empty key", lineno + 1)));
            }

            let section = sections.last_mut().ok_or_else(|| {
                Error::Config(format!("line {}: entry outside of a section", lineno + 1))
            })?;
            section
                .entries
                .push((key.to_string(), value.trim().to_string()));
        }

        Ok(Config { sections })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Cuts a `#`/`;` comment. Comment characters inside quoted strings are kept,
/// as are ones glued to non-space text (e.g. a `#` inside a pattern).
fn strip_comment(line: &str) -> &str {
    let mut in_quote: Option<char> = None;
    let mut prev_is_space = true;

    for (i, c) in line.char_indices() {
        match in_quote {
            Some(q) => {
                if c == q {
                    in_quote = None;
                }
            }
            None => match c {
                '\'' | '"' => in_quote = Some(c),
                '#' | ';' if prev_is_space => return &line[..i],
                _ => {}
            },
        }
        prev_is_space = c.is_whitespace();
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
# request shape
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act   ; trailing comment

[matchers]
m.0 = r.sub == p.sub
m.1 = r.obj == p.obj
"#;

    #[test]
    fn parses_sections_and_entries() {
        let cfg = Config::from_text(MODEL).unwrap();
        let r = cfg.section("request_definition").unwrap();
        assert_eq!(r.entries, vec![("r".to_string(), "sub, obj, act".to_string())]);

        let p = cfg.section("policy_definition").unwrap();
        assert_eq!(p.entries[0].1, "sub, obj, act");

        let m = cfg.section("matchers").unwrap();
        assert_eq!(m.entries.len(), 2);
        assert_eq!(m.entries[1].0, "m.1");
    }

    #[test]
    fn keeps_comment_chars_inside_values() {
        let cfg = Config::from_text("[s]\nk = a#b 'c ; d'\n").unwrap();
        assert_eq!(cfg.section("s").unwrap().entries[0].1, "a#b 'c ; d'");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Config::from_text("[s]\nno equals sign\n").is_err());
        assert!(Config::from_text("k = outside\n").is_err());
        assert!(Config::from_text("[unterminated\n").is_err());
    }
}
