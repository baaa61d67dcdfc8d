//! Process configuration files.
//!
//! Two formats are supported: the classic line-oriented `Procfile`
//! (`name: script`) and the nested YAML `Muxfile`, which additionally
//! configures per-process environment entries and structured-output
//! decoding. A `--procfile` path whose basename is `Procfile` is parsed with
//! the Procfile grammar; anything else is treated as a Muxfile.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::colors::Style;
use crate::env::Environment;
use crate::process::{ProcessSpec, StructuredOutput, TaggingRule, FORMAT_JSON};

pub const MUXFILE_NAME: &str = "Muxfile";
pub const PROCFILE_NAME: &str = "Procfile";

/// Errors while locating or parsing a process configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {}", .path.display(), .source)]
    Io { path: PathBuf, source: io::Error },
    #[error("no Muxfile or Procfile found in the current directory")]
    NoProcessFile,
    #[error("invalid Procfile format at line {line}: {text}")]
    ProcfileSyntax { line: usize, text: String },
    #[error("failed to decode Muxfile as YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported Muxfile version {0:?} (expected \"1\")")]
    UnsupportedVersion(String),
    #[error("unknown color {color:?} for tag {tag:?}")]
    UnknownColor { tag: String, color: String },
}

/// Parses a Procfile: one `name: script` entry per line, `#` comments and
/// blank lines ignored. Every process inherits `env` unchanged.
pub fn parse_procfile(content: &str, env: &Environment) -> Result<Vec<ProcessSpec>, ConfigError> {
    let mut specs = Vec::new();
    for (i, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, script)) = line.split_once(':') else {
            return Err(ConfigError::ProcfileSyntax { line: i + 1, text: line.to_string() });
        };
        specs.push(ProcessSpec::new(name, script, env.clone()));
    }
    Ok(specs)
}

#[derive(Debug, Deserialize)]
struct Muxfile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    processes: BTreeMap<String, MuxfileProcess>,
}

// A process is either just a script string or a structured entry.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MuxfileProcess {
    Script(String),
    Full(MuxfileEntry),
}

#[derive(Debug, Deserialize)]
struct MuxfileEntry {
    script: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    format: String,
    #[serde(default)]
    fields: Fields,
    #[serde(default)]
    tags: BTreeMap<String, Tag>,
}

#[derive(Debug, Default, Deserialize)]
struct Fields {
    #[serde(default)]
    message: String,
    #[serde(default)]
    level: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    #[serde(default)]
    color: String,
    condition: Condition,
}

#[derive(Debug, Deserialize)]
struct Condition {
    field: String,
    value: String,
}

/// Parses a Muxfile. Process maps are sorted by name so palette colors are
/// assigned deterministically.
pub fn parse_muxfile(content: &str, env: &Environment) -> Result<Vec<ProcessSpec>, ConfigError> {
    let muxfile: Muxfile = serde_yaml::from_str(content)?;
    match muxfile.version.as_str() {
        "" | "1" => {}
        other => return Err(ConfigError::UnsupportedVersion(other.to_string())),
    }

    let mut specs = Vec::new();
    for (name, process) in muxfile.processes {
        let spec = match process {
            MuxfileProcess::Script(script) => ProcessSpec::new(&name, &script, env.clone()),
            MuxfileProcess::Full(entry) => {
                let mut child_env = env.clone();
                for pair in &entry.env {
                    child_env.set_pair(pair);
                }

                let mut output = StructuredOutput {
                    format: entry.format.clone(),
                    message_field: entry.fields.message.clone(),
                    level_field: entry.fields.level.clone(),
                    ..StructuredOutput::default()
                };
                // tags only apply to explicitly structured processes
                if output.format == FORMAT_JSON {
                    for (tag, def) in &entry.tags {
                        output.tagging_rules.push(TaggingRule {
                            field: def.condition.field.clone(),
                            value: def.condition.value.clone(),
                            tag: tag.clone(),
                        });
                        if !def.color.is_empty() {
                            let style = Style::parse(&def.color).ok_or_else(|| {
                                ConfigError::UnknownColor {
                                    tag: tag.clone(),
                                    color: def.color.clone(),
                                }
                            })?;
                            output.tag_styles.insert(tag.clone(), style);
                        }
                    }
                }

                let mut spec = ProcessSpec::new(&name, &entry.script, child_env);
                spec.output = output;
                spec
            }
        };
        specs.push(spec);
    }
    Ok(specs)
}

/// Loads process specs from `path`, or discovers `Muxfile`/`Procfile` in the
/// working directory when no path is given.
pub fn load_processes(
    path: Option<&Path>,
    env: &Environment,
) -> Result<Vec<ProcessSpec>, ConfigError> {
    match path {
        Some(path) => {
            let content = read(path)?;
            if path.file_name().map(|n| n == PROCFILE_NAME).unwrap_or(false) {
                parse_procfile(&content, env)
            } else {
                parse_muxfile(&content, env)
            }
        }
        None => match read_optional(Path::new(MUXFILE_NAME))? {
            Some(content) => parse_muxfile(&content, env),
            None => match read_optional(Path::new(PROCFILE_NAME))? {
                Some(content) => parse_procfile(&content, env),
                None => Err(ConfigError::NoProcessFile),
            },
        },
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io { path: path.to_path_buf(), source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colors::Color;

    #[test]
    fn parses_a_procfile() {
        let content = "\
# all the services
web:  rails server
  worker: sidekiq -c 5

# trailing comment";
        let specs = parse_procfile(content, &Environment::new()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "web");
        assert_eq!(specs[0].script, "rails server");
        assert_eq!(specs[1].name, "worker");
        assert_eq!(specs[1].script, "sidekiq -c 5");
    }

    #[test]
    fn procfile_scripts_may_contain_colons() {
        let specs = parse_procfile("api: serve --listen localhost:8080", &Environment::new())
            .unwrap();
        assert_eq!(specs[0].script, "serve --listen localhost:8080");
    }

    #[test]
    fn procfile_line_without_colon_is_an_error() {
        let err = parse_procfile("web rails server", &Environment::new()).unwrap_err();
        match err {
            ConfigError::ProcfileSyntax { line, text } => {
                assert_eq!(line, 1);
                assert_eq!(text, "web rails server");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn parses_short_form_muxfile_entries() {
        let content = "
version: \"1\"
processes:
  web: rails server
  worker: sidekiq
";
        let specs = parse_muxfile(content, &Environment::new()).unwrap();
        assert_eq!(specs.len(), 2);
        // sorted by name
        assert_eq!(specs[0].name, "web");
        assert_eq!(specs[0].script, "rails server");
        assert_eq!(specs[1].name, "worker");
    }

    #[test]
    fn parses_structured_muxfile_entries() {
        let content = r#"
processes:
  api:
    script: ./api --port $PORT
    env:
      - PORT=8080
    format: json
    fields:
      message: msg
      level: severity
    tags:
      error:
        color: red
        condition:
          field: severity
          value: /error|fatal/i
"#;
        let specs = parse_muxfile(content, &Environment::new()).unwrap();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.name, "api");
        assert_eq!(spec.script, "./api --port $PORT");
        assert_eq!(spec.env.get("PORT"), Some("8080"));
        assert_eq!(spec.output.format, "json");
        assert_eq!(spec.output.message_field, "msg");
        assert_eq!(spec.output.level_field, "severity");
        assert_eq!(spec.output.tagging_rules.len(), 1);
        assert_eq!(spec.output.tagging_rules[0].field, "severity");
        assert_eq!(spec.output.tagging_rules[0].tag, "error");
        assert_eq!(spec.output.tag_styles["error"], Style::new(Color::Red));
    }

    #[test]
    fn muxfile_tags_support_bold_styles() {
        let content = r#"
processes:
  api:
    script: ./api
    format: json
    fields: { message: message, level: level }
    tags:
      warning:
        color: yellow-bold
        condition: { field: level, value: warn }
"#;
        let specs = parse_muxfile(content, &Environment::new()).unwrap();
        let style = specs[0].output.tag_styles["warning"];
        assert_eq!(style, Style { color: Color::Yellow, bold: true });
    }

    #[test]
    fn muxfile_rejects_unknown_versions() {
        let err = parse_muxfile("version: \"2\"\nprocesses: {}\n", &Environment::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(v) if v == "2"));
    }

    #[test]
    fn muxfile_rejects_unknown_tag_colors() {
        let content = r#"
processes:
  api:
    script: ./api
    format: json
    fields: { message: message, level: level }
    tags:
      bad:
        color: sparkly
        condition: { field: level, value: x }
"#;
        let err = parse_muxfile(content, &Environment::new()).unwrap_err();
        match err {
            ConfigError::UnknownColor { tag, color } => {
                assert_eq!(tag, "bad");
                assert_eq!(color, "sparkly");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn muxfile_tags_are_ignored_without_json_format() {
        let content = r#"
processes:
  api:
    script: ./api
    tags:
      error:
        color: red
        condition: { field: level, value: error }
"#;
        let specs = parse_muxfile(content, &Environment::new()).unwrap();
        assert!(specs[0].output.tagging_rules.is_empty());
        assert!(specs[0].output.tag_styles.is_empty());
    }

    #[test]
    fn load_prefers_explicit_procfile_grammar_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let procfile = dir.path().join(PROCFILE_NAME);
        std::fs::write(&procfile, "web: serve\n").unwrap();
        let specs = load_processes(Some(&procfile), &Environment::new()).unwrap();
        assert_eq!(specs[0].name, "web");

        let muxfile = dir.path().join("stack.yml");
        std::fs::write(&muxfile, "processes:\n  web: serve\n").unwrap();
        let specs = load_processes(Some(&muxfile), &Environment::new()).unwrap();
        assert_eq!(specs[0].name, "web");
    }
}
