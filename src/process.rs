//! Process specifications and validation.
//!
//! A [`ProcessSpec`] describes one long-lived child: its name, the script to
//! run, the environment it starts with, and optionally how its structured
//! log output should be decoded. Specs are produced by the Procfile/Muxfile
//! parsers and validated as a set before the supervisor starts anything.

use std::collections::HashMap;
use std::fmt;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::colors::{Color, Style};
use crate::env::Environment;

/// Log format accepted by [`StructuredOutput::format`]: unset, `auto`, or
/// `json`.
pub const FORMAT_AUTO: &str = "auto";
pub const FORMAT_JSON: &str = "json";

/// Field names used by the JSON decorator when a process does not configure
/// its own.
pub const DEFAULT_MESSAGE_FIELD: &str = "message";
pub const DEFAULT_LEVEL_FIELD: &str = "level";

/// Specification of a single supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSpec {
    /// Unique name, used as the output prefix and the control-socket handle.
    pub name: String,
    /// The shell script to run (tokenized, not handed to a shell).
    pub script: String,
    /// Environment the child starts with.
    pub env: Environment,
    /// How to treat the process's log output.
    pub output: StructuredOutput,
}

impl ProcessSpec {
    pub fn new(name: &str, script: &str, env: Environment) -> Self {
        ProcessSpec {
            name: name.trim().to_string(),
            script: script.trim().to_string(),
            env,
            output: StructuredOutput::default(),
        }
    }

    /// Checks this spec in isolation and returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("missing name".to_string());
        }
        if self.script.trim().is_empty() {
            errors.push("missing script".to_string());
        }
        match self.output.format.as_str() {
            "" | FORMAT_AUTO => {}
            FORMAT_JSON => {
                if self.output.message_field.is_empty() {
                    errors.push(r#"missing log output "message" field"#.to_string());
                }
                if self.output.level_field.is_empty() {
                    errors.push(r#"missing log output "level" field"#.to_string());
                }
            }
            other => errors.push(format!("unknown log output format {:?}", other)),
        }
        for rule in &self.output.tagging_rules {
            if let Err(err) = rule.matcher() {
                errors.push(format!("tag {:?}: {}", rule.tag, err));
            }
        }
        errors
    }
}

/// Configuration that turns a process's JSON log lines into tagged, colored
/// text.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StructuredOutput {
    /// `""` (auto-detect with defaults), `"auto"`, or `"json"`.
    pub format: String,
    pub message_field: String,
    pub level_field: String,
    /// Applied in order; later matching rules override earlier tag colors.
    pub tagging_rules: Vec<TaggingRule>,
    pub tag_styles: HashMap<String, Style>,
}

/// Tags a decoded log message when `field`'s value matches `value`.
#[derive(Debug, Clone, Serialize)]
pub struct TaggingRule {
    pub field: String,
    /// A literal value, or `/pattern/` with an optional trailing `i` flag
    /// for case-insensitive regex matching.
    pub value: String,
    pub tag: String,
}

/// A compiled match predicate for a tagging rule.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(String),
    Pattern(regex::Regex),
}

impl Matcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Literal(expected) => value == expected,
            Matcher::Pattern(re) => re.is_match(value),
        }
    }
}

impl TaggingRule {
    /// Compiles the rule's match value. `/pattern/` becomes a regex,
    /// `/pattern/i` a case-insensitive one; anything else matches literally.
    pub fn matcher(&self) -> Result<Matcher, regex::Error> {
        let v = self.value.as_str();
        let Some(rest) = v.strip_prefix('/') else {
            return Ok(Matcher::Literal(self.value.clone()));
        };
        let (pattern, insensitive) = match rest.strip_suffix("/i") {
            Some(pattern) => (pattern, true),
            None => match rest.strip_suffix('/') {
                Some(pattern) => (pattern, false),
                // no closing slash: treat the whole value as a literal
                None => return Ok(Matcher::Literal(self.value.clone())),
            },
        };
        let re = RegexBuilder::new(pattern).case_insensitive(insensitive).build()?;
        Ok(Matcher::Pattern(re))
    }
}

impl StructuredOutput {
    /// The configuration applied when a process does not set one up: detect
    /// JSON automatically, read `message`/`level`, and color error and fatal
    /// lines red.
    pub fn auto_detect() -> Self {
        StructuredOutput {
            format: FORMAT_AUTO.to_string(),
            message_field: DEFAULT_MESSAGE_FIELD.to_string(),
            level_field: DEFAULT_LEVEL_FIELD.to_string(),
            tagging_rules: vec![TaggingRule {
                field: DEFAULT_LEVEL_FIELD.to_string(),
                value: "/^(error|fatal)$/i".to_string(),
                tag: "error".to_string(),
            }],
            tag_styles: HashMap::from([("error".to_string(), Style::new(Color::Red))]),
        }
    }
}

/// The aggregate of all process-set validation failures.
#[derive(Debug)]
pub struct ValidationError {
    pub errors: Vec<String>,
}

impl std::error::Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "invalid process set"),
            [single] => write!(f, "{}", single),
            many => {
                for err in many {
                    write!(f, "\n\t* {}", err)?;
                }
                Ok(())
            }
        }
    }
}

/// Validates every spec and checks that no two share a name. All problems
/// are reported at once; nothing is started if this fails.
pub fn validate_all(specs: &[ProcessSpec]) -> Result<(), ValidationError> {
    let mut errors = Vec::new();
    let mut seen = HashMap::new();

    for (i, spec) in specs.iter().enumerate() {
        let number = i + 1;
        let describe = |msg: &str| {
            if spec.name.trim().is_empty() {
                format!("process {}: {}", number, msg)
            } else {
                format!("process {:?}: {}", spec.name, msg)
            }
        };
        for problem in spec.validate() {
            errors.push(describe(&problem));
        }
        if !spec.name.trim().is_empty() && seen.insert(spec.name.clone(), number).is_some() {
            errors.push(format!("process {}: name {:?} is already used", number, spec.name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { errors })
    }
}

/// Point-in-time information about a supervised process, as served by the
/// control socket's LIST command. `pid` is -1 when the process is not
/// currently running; `uptime` is in nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "PID")]
    pub pid: i64,
    #[serde(rename = "Uptime")]
    pub uptime: i64,
}
