//! Process environment handling.
//!
//! An [`Environment`] is the set of variables a child process starts with. It
//! is built from the OS environment, optionally overlaid with an env file,
//! and supports `$VAR`/`${VAR}` expansion where unknown variables expand to
//! the empty string.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Errors produced while parsing an env file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvFileError {
    #[error("line {0} does not contain '='")]
    MissingEquals(usize),
}

/// A set of environment variables for child processes. Serializes as a
/// plain name → value map.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    /// Creates an Environment from the OS environment of this process.
    pub fn system() -> Self {
        let mut env = Environment::new();
        for (key, value) in std::env::vars() {
            env.vars.insert(key, value);
        }
        env
    }

    /// Creates an Environment from a list of `KEY=VALUE` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Environment::new();
        for pair in pairs {
            env.set_pair(pair.as_ref());
        }
        env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Splits `pair` at the first `=` and sets the resulting variable. Key
    /// and value are trimmed and surrounding single or double quotes are
    /// stripped from the value; a pair without `=` sets the key to the empty
    /// string.
    pub fn set_pair(&mut self, pair: &str) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        self.vars.insert(key.trim().to_string(), value.to_string());
    }

    /// Iterates over all variables as key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Returns all variables as `KEY=VALUE` pairs, sorted by key for
    /// deterministic output.
    pub fn list(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self
            .vars
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        pairs.sort();
        pairs
    }

    /// Replaces `$VAR` and `${VAR}` in `input` with the corresponding values.
    /// Unknown variables expand to the empty string. A `$` not followed by a
    /// variable name, and a `${` without a closing brace, are kept literally.
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            if let Some(inner) = after.strip_prefix('{') {
                match inner.find('}') {
                    Some(end) => {
                        out.push_str(self.get(&inner[..end]).unwrap_or(""));
                        rest = &inner[end + 1..];
                    }
                    None => {
                        out.push('$');
                        rest = after;
                    }
                }
                continue;
            }
            let bytes = after.as_bytes();
            if !bytes.is_empty() && is_name_start(bytes[0]) {
                let mut end = 1;
                while end < bytes.len() && is_name_char(bytes[end]) {
                    end += 1;
                }
                out.push_str(self.get(&after[..end]).unwrap_or(""));
                rest = &after[end..];
            } else {
                out.push('$');
                rest = after;
            }
        }
        out.push_str(rest);
        out
    }

    /// Parses env-file `content` into this Environment. Trimmed lines that
    /// are empty or start with `#` are skipped. Values may reference
    /// variables set on earlier lines or already present in the Environment;
    /// expansion happens before the value is stored.
    pub fn parse_env_file(&mut self, content: &str) -> Result<(), EnvFileError> {
        for (i, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !line.contains('=') {
                return Err(EnvFileError::MissingEquals(i + 1));
            }
            let expanded = self.expand(line);
            self.set_pair(&expanded);
        }
        Ok(())
    }
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
