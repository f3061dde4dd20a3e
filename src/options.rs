//! The options store: a typed name/value map with server-wide defaults and
//! per-session overrides. Lookup falls back from the session scope to the
//! server scope to the built-in default.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    String(String),
    Number(i64),
}

impl OptionValue {
    pub fn as_number(&self) -> Option<i64> {
        match self {
            OptionValue::Number(n) => Some(*n),
            OptionValue::String(s) => s.parse().ok(),
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            OptionValue::Number(n) => n.to_string(),
            OptionValue::String(s) => s.clone(),
        }
    }
}

/// Built-in defaults. Options not named here are rejected unless prefixed
/// with `@` (user options are free-form strings).
const DEFAULTS: &[(&str, OptionDefault)] = &[
    ("base-index", OptionDefault::Number(0)),
    ("bell-action", OptionDefault::String("any")),
    ("default-shell", OptionDefault::String("")),
    ("default-terminal", OptionDefault::String("screen-256color")),
    ("display-time", OptionDefault::Number(750)),
    ("escape-time", OptionDefault::Number(500)),
    ("history-limit", OptionDefault::Number(2000)),
    ("monitor-activity", OptionDefault::Number(0)),
    ("monitor-silence", OptionDefault::Number(0)),
    ("remain-on-exit", OptionDefault::Number(0)),
    ("renumber-windows", OptionDefault::Number(0)),
    ("repeat-time", OptionDefault::Number(1000)),
    ("status", OptionDefault::Number(1)),
    ("status-position", OptionDefault::String("bottom")),
];

enum OptionDefault {
    String(&'static str),
    Number(i64),
}

#[derive(Default)]
pub struct Options {
    values: HashMap<String, OptionValue>,
}

impl Options {
    pub fn new() -> Self {
        Options { values: HashMap::new() }
    }

    fn default_for(name: &str) -> Option<OptionValue> {
        DEFAULTS.iter().find(|(n, _)| *n == name).map(|(_, d)| match d {
            OptionDefault::String(s) => OptionValue::String(s.to_string()),
            OptionDefault::Number(n) => OptionValue::Number(*n),
        })
    }

    pub fn is_known(name: &str) -> bool {
        name.starts_with('@') || DEFAULTS.iter().any(|(n, _)| *n == name)
    }

    pub fn set(&mut self, name: &str, value: OptionValue) -> bool {
        if !Self::is_known(name) {
            return false;
        }
        self.values.insert(name.to_string(), value);
        true
    }

    pub fn unset(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<OptionValue> {
        self.values
            .get(name)
            .cloned()
            .or_else(|| Self::default_for(name))
    }

    /// Session-scope lookup with server fallback.
    pub fn get_with_parent(&self, parent: &Options, name: &str) -> Option<OptionValue> {
        self.values
            .get(name)
            .cloned()
            .or_else(|| parent.values.get(name).cloned())
            .or_else(|| Self::default_for(name))
    }

    pub fn number(&self, name: &str) -> i64 {
        self.get(name).and_then(|v| v.as_number()).unwrap_or(0)
    }

    pub fn string(&self, name: &str) -> String {
        self.get(name).map(|v| v.as_str()).unwrap_or_default()
    }

    /// All set options, for show-options output.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let o = Options::new();
        assert_eq!(o.number("history-limit"), 2000);
        assert_eq!(o.string("status-position"), "bottom");
    }

    #[test]
    fn unknown_names_rejected_but_user_options_pass() {
        let mut o = Options::new();
        assert!(!o.set("no-such-option", OptionValue::Number(1)));
        assert!(o.set("@mine", OptionValue::String("x".into())));
        assert_eq!(o.string("@mine"), "x");
    }

    #[test]
    fn session_falls_back_to_server() {
        let mut server = Options::new();
        server.set("escape-time", OptionValue::Number(100));
        let mut session = Options::new();
        assert_eq!(
            session.get_with_parent(&server, "escape-time").unwrap().as_number(),
            Some(100)
        );
        session.set("escape-time", OptionValue::Number(5));
        assert_eq!(
            session.get_with_parent(&server, "escape-time").unwrap().as_number(),
            Some(5)
        );
    }
}
