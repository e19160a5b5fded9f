//! The execution environment.
//!
//! An [`Environment`] is an immutable mapping from variable names (compiler
//! path, flag lists, install prefix, ...) to [`Value`]s. It is assembled once
//! per invocation by an [`EnvBuilder`] from several layers, later layers
//! winning:
//!
//! 1. engine built-ins,
//! 2. defaults declared by the build script,
//! 3. the process environment (only for names already known from 1 and 2),
//! 4. overrides declared by the build script,
//! 5. overrides given on the command line (`--env KEY=VALUE`).
//!
//! Append-style keys (flag lists) concatenate across layers instead of
//! replacing each other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Keys that concatenate across layers instead of being replaced.
const APPEND_KEYS: &[&str] = &["CFLAGS", "CXXFLAGS", "CPPFLAGS", "LDFLAGS", "INTERACTIVE"];

/// A single environment value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    List(Vec<String>),
}

impl Value {
    /// Flattens the value into command line words.
    pub fn words(&self) -> Vec<&str> {
        match self {
            Value::Text(text) => vec![text.as_str()],
            Value::List(list) => list.iter().map(String::as_str).collect(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::List(_) => None,
        }
    }

    fn append(&mut self, other: Value) {
        let mut words: Vec<String> = match std::mem::replace(self, Value::List(vec![])) {
            Value::Text(text) => vec![text],
            Value::List(list) => list,
        };

        match other {
            Value::Text(text) => words.push(text),
            Value::List(list) => words.extend(list),
        }

        *self = Value::List(words);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::List(list) => f.write_str(&list.join(" ")),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&Utf8Path> for Value {
    fn from(value: &Utf8Path) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<Utf8PathBuf> for Value {
    fn from(value: Utf8PathBuf) -> Self {
        Value::Text(value.into_string())
    }
}

impl<S: Into<String>> From<Vec<S>> for Value {
    fn from(value: Vec<S>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for Value {
    fn from(value: [S; N]) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

/// Immutable, per-invocation set of named values shared by every producer
/// and shell command of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Environment {
    vars: BTreeMap<String, Value>,
}

impl Environment {
    pub fn builder() -> EnvBuilder {
        EnvBuilder::new()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Text value of `key`, lists are joined with spaces.
    pub fn text(&self, key: &str) -> Option<String> {
        self.vars.get(key).map(Value::to_string)
    }

    /// List value of `key`; a text value becomes a one element list.
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.vars.get(key) {
            Some(Value::Text(text)) => vec![text.clone()],
            Some(Value::List(list)) => list.clone(),
            None => vec![],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.vars)
    }
}

/// Layered builder for an [`Environment`].
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    builtins: BTreeMap<String, Value>,
    defaults: BTreeMap<String, Value>,
    overrides: Vec<(String, Value)>,
    cli: Vec<(String, String)>,
    process: Option<BTreeMap<String, String>>,
    append: BTreeSet<String>,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvBuilder {
    pub fn new() -> Self {
        let mut builtins = BTreeMap::new();
        builtins.insert(
            crate::config::STRESS_CYCLES.to_string(),
            Value::from(crate::config::DEFAULT_STRESS_CYCLES.to_string()),
        );
        builtins.insert(crate::config::INTERACTIVE.to_string(), Value::List(vec![]));
        builtins.insert(crate::config::STRESS.to_string(), Value::from(""));
        builtins.insert(crate::config::SEED.to_string(), Value::from(""));

        Self {
            builtins,
            defaults: BTreeMap::new(),
            overrides: Vec::new(),
            cli: Vec::new(),
            process: None,
            append: APPEND_KEYS.iter().map(|key| key.to_string()).collect(),
        }
    }

    /// Declares a default value, which the process environment may override.
    pub fn default(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }

    /// Declares a script-level override, applied after the process
    /// environment.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Marks `key` as append-style.
    pub fn append_key(mut self, key: impl Into<String>) -> Self {
        self.append.insert(key.into());
        self
    }

    /// Adds `--env KEY=VALUE` overrides from the command line.
    pub fn cli_overrides<I, S>(mut self, pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| ConfigError::Override(pair.to_string()))?;
            self.cli.push((key.to_string(), value.to_string()));
        }
        Ok(self)
    }

    /// Uses `vars` in place of the real process environment.
    pub fn process_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.process = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn build(self) -> Environment {
        let process = match self.process {
            Some(vars) => vars,
            None => std::env::vars().collect(),
        };

        let append = self.append;
        let mut vars: BTreeMap<String, Value> = BTreeMap::new();

        let merge = |vars: &mut BTreeMap<String, Value>, key: String, value: Value| {
            match vars.get_mut(&key) {
                Some(old) if append.contains(&key) => old.append(value),
                Some(old) => *old = value,
                None => {
                    vars.insert(key, value);
                }
            }
        };

        for (key, value) in self.builtins.into_iter().chain(self.defaults) {
            merge(&mut vars, key, value);
        }

        // Only names the engine or the script already know about are read
        // from the process environment.
        let known: Vec<String> = vars
            .keys()
            .cloned()
            .chain(self.overrides.iter().map(|(key, _)| key.clone()))
            .collect();

        for key in known {
            if let Some(raw) = process.get(&key) {
                let value = parse_raw(&key, raw, vars.get(&key), &append);
                merge(&mut vars, key, value);
            }
        }

        for (key, value) in self.overrides {
            merge(&mut vars, key, value);
        }

        for (key, raw) in self.cli {
            let value = parse_raw(&key, &raw, vars.get(&key), &append);
            merge(&mut vars, key, value);
        }

        Environment { vars }
    }
}

/// Interprets a raw string coming from outside the script. List-valued and
/// append-style keys are split the way a POSIX shell would split them.
fn parse_raw(key: &str, raw: &str, current: Option<&Value>, append: &BTreeSet<String>) -> Value {
    let listy = append.contains(key) || matches!(current, Some(Value::List(_)));

    if listy {
        let words = shlex::split(raw)
            .unwrap_or_else(|| raw.split_whitespace().map(str::to_string).collect());
        Value::List(words)
    } else {
        Value::Text(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_process() -> Vec<(String, String)> {
        vec![]
    }

    #[test]
    fn test_defaults_are_present() {
        let env = Environment::builder()
            .default("CC", "clang++")
            .process_vars(empty_process())
            .build();

        assert_eq!(env.text("CC").as_deref(), Some("clang++"));
        assert_eq!(env.text("STRESS_CYCLES").as_deref(), Some("10"));
    }

    #[test]
    fn test_process_overrides_defaults() {
        let env = Environment::builder()
            .default("CC", "clang++")
            .default("PREFIX", "/usr/local")
            .process_vars([("CC", "g++"), ("UNRELATED", "x")])
            .build();

        assert_eq!(env.text("CC").as_deref(), Some("g++"));
        assert_eq!(env.text("PREFIX").as_deref(), Some("/usr/local"));
        assert!(!env.contains("UNRELATED"));
    }

    #[test]
    fn test_append_keys_concatenate() {
        let env = Environment::builder()
            .default("CFLAGS", ["-g", "-I./include"])
            .process_vars([("CFLAGS", "-O2 '-DNAME=a b'")])
            .set("CFLAGS", ["-Wall"])
            .build();

        assert_eq!(
            env.list("CFLAGS"),
            vec!["-g", "-I./include", "-O2", "-DNAME=a b", "-Wall"]
        );
    }

    #[test]
    fn test_script_overrides_replace_process() {
        let env = Environment::builder()
            .default("CC", "clang++")
            .set("CC", "cc")
            .process_vars([("CC", "g++")])
            .build();

        assert_eq!(env.text("CC").as_deref(), Some("cc"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let env = Environment::builder()
            .default("CC", "clang++")
            .set("CC", "cc")
            .cli_overrides(["CC=tcc", "LDFLAGS=-lm -ldl"])
            .unwrap()
            .process_vars(empty_process())
            .build();

        assert_eq!(env.text("CC").as_deref(), Some("tcc"));
        assert_eq!(env.list("LDFLAGS"), vec!["-lm", "-ldl"]);
    }

    #[test]
    fn test_cli_override_rejects_garbage() {
        let result = Environment::builder().cli_overrides(["NOEQUALS"]);
        assert!(matches!(result, Err(ConfigError::Override(_))));

        let result = Environment::builder().cli_overrides(["=x"]);
        assert!(matches!(result, Err(ConfigError::Override(_))));
    }

    #[test]
    fn test_list_keys_split_from_process() {
        let env = Environment::builder()
            .default("TESTS", ["a"])
            .process_vars([("TESTS", "b c")])
            .build();

        assert_eq!(env.list("TESTS"), vec!["b", "c"]);
    }
}
