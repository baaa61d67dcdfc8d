//! Line buffering and structured-log decoration.
//!
//! Child output arrives as arbitrary byte chunks. The [`LineBuffer`] turns
//! those chunks into complete lines, and the [`Decorator`] optionally decodes
//! JSON log lines into tagged, colored text. Detection looks at the first
//! line only: once a process is recognized as emitting JSON it stays in JSON
//! mode for the rest of the run.

use serde_json::{Map, Value};

use crate::colors::Style;
use crate::process::{Matcher, StructuredOutput, FORMAT_JSON};

/// Accumulates bytes and yields complete lines. Line terminators (`\n` or
/// `\r\n`) are preserved in the yielded lines; bytes after the last newline
/// stay buffered until more data arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer::default()
    }

    /// Appends `chunk` and returns every line completed by it, terminators
    /// included.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            lines.push(std::mem::replace(&mut self.buf, rest));
        }
        lines
    }
}

/// The result of decorating one line: the text to emit (without a trailing
/// newline) and, when decoding was expected but failed, a note for the
/// supervisor's log sink. The raw line is still emitted in that case.
#[derive(Debug, PartialEq, Eq)]
pub struct Decorated {
    pub text: String,
    pub note: Option<String>,
}

impl Decorated {
    fn plain(text: &str) -> Self {
        Decorated { text: text.to_string(), note: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Waiting for the first line to decide between Json and Plain.
    Auto,
    Json,
    Plain,
}

/// Per-process format adapter. Runs in one of three modes: `Auto` until the
/// first line arrives, then `Json` or `Plain` for the rest of the run.
#[derive(Debug)]
pub struct Decorator {
    mode: Mode,
    message_field: String,
    level_field: String,
    rules: Vec<CompiledRule>,
    styles: Vec<(String, Style)>,
}

#[derive(Debug)]
struct CompiledRule {
    field: String,
    matcher: Matcher,
    tag: String,
}

impl Decorator {
    /// Builds the adapter for a process. The configuration must already have
    /// passed validation; rules that fail to compile are dropped here.
    pub fn new(output: &StructuredOutput) -> Self {
        let auto = output.format != FORMAT_JSON;
        let defaults = StructuredOutput::auto_detect();

        // validation guarantees the fields for json; auto-detection falls
        // back to the defaults for anything left unconfigured
        let message_field = if output.message_field.is_empty() && auto {
            defaults.message_field
        } else {
            output.message_field.clone()
        };
        let level_field = if output.level_field.is_empty() && auto {
            defaults.level_field
        } else {
            output.level_field.clone()
        };
        let (tagging_rules, tag_styles) = if auto && output.tagging_rules.is_empty() {
            (defaults.tagging_rules, defaults.tag_styles)
        } else {
            (output.tagging_rules.clone(), output.tag_styles.clone())
        };

        let rules = tagging_rules
            .iter()
            .filter_map(|rule| {
                let matcher = rule.matcher().ok()?;
                Some(CompiledRule {
                    field: rule.field.clone(),
                    matcher,
                    tag: rule.tag.clone(),
                })
            })
            .collect();
        Decorator {
            mode: if auto { Mode::Auto } else { Mode::Json },
            message_field,
            level_field,
            rules,
            styles: tag_styles.into_iter().collect(),
        }
    }

    /// Decorates one complete line (without its terminator).
    pub fn decorate(&mut self, line: &str) -> Decorated {
        match self.mode {
            Mode::Plain => Decorated::plain(line),
            Mode::Json => match parse_object(line) {
                Some(object) => Decorated { text: self.render(object), note: None },
                None => Decorated {
                    text: line.to_string(),
                    note: Some("line is not a JSON object".to_string()),
                },
            },
            Mode::Auto => match parse_object(line) {
                Some(object) => {
                    self.mode = Mode::Json;
                    Decorated { text: self.render(object), note: None }
                }
                None => {
                    self.mode = Mode::Plain;
                    Decorated::plain(line)
                }
            },
        }
    }

    fn render(&self, mut object: Map<String, Value>) -> String {
        let style = self.pick_style(&object);

        let message = take_string(&mut object, &self.message_field);
        let level = take_string(&mut object, &self.level_field);

        let mut text = String::new();
        if !level.is_empty() {
            text.push('[');
            text.push_str(&level.to_uppercase());
            text.push_str("]\t");
        }
        text.push_str(&message);
        if !object.is_empty() {
            text.push('\t');
            text.push_str(&compact_object(&object));
        }

        match style {
            Some(style) => style.paint(&text),
            None => text,
        }
    }

    // Later matching rules override the colors of earlier ones.
    fn pick_style(&self, object: &Map<String, Value>) -> Option<Style> {
        let mut chosen = None;
        for rule in &self.rules {
            let Some(value) = object.get(&rule.field).and_then(scalar_to_string) else {
                continue;
            };
            if !rule.matcher.matches(&value) {
                continue;
            }
            if let Some((_, style)) = self.styles.iter().find(|(tag, _)| *tag == rule.tag) {
                chosen = Some(*style);
            }
        }
        chosen
    }
}

fn parse_object(line: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

fn take_string(object: &mut Map<String, Value>, field: &str) -> String {
    match object.remove(field) {
        Some(Value::String(s)) => s,
        Some(_) | None => String::new(),
    }
}

// Tag rules match against the stringified value of scalar fields; objects,
// arrays, and null never match.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Renders the residual fields of a decoded message as readable single-line
/// JSON: `{ "key": "value", "nested": { "n": 1 } }`. Keys are sorted.
fn compact_object(object: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_value(&Value::Object(object.clone()), &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(object) if object.is_empty() => out.push_str("{}"),
        Value::Object(object) => {
            out.push_str("{ ");
            for (i, (key, value)) in object.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(&Value::String(key.clone()), out);
                out.push_str(": ");
                write_value(value, out);
            }
            out.push_str(" }");
        }
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(items) => {
            out.push_str("[ ");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, out);
            }
            out.push_str(" ]");
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colors::{Color, RESET};
    use crate::process::TaggingRule;

    fn json_output() -> StructuredOutput {
        StructuredOutput {
            format: FORMAT_JSON.to_string(),
            message_field: "message".to_string(),
            level_field: "level".to_string(),
            ..StructuredOutput::default()
        }
    }

    #[test]
    fn line_buffer_emits_complete_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.feed(b"This").is_empty());
        assert!(buffer.feed(b" is a ").is_empty());
        assert!(buffer.feed(b"comp").is_empty());
        let lines = buffer.feed(b"lete line\n");
        assert_eq!(lines, vec![b"This is a complete line\n".to_vec()]);
    }

    #[test]
    fn line_buffer_handles_multiple_lines_per_chunk() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.feed(b"one\ntwo\nthr");
        assert_eq!(lines, vec![b"one\n".to_vec(), b"two\n".to_vec()]);
        let lines = buffer.feed(b"ee\n");
        assert_eq!(lines, vec![b"three\n".to_vec()]);
    }

    #[test]
    fn line_buffer_preserves_crlf() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.feed(b"This is line").is_empty());
        let lines = buffer.feed(b" one\r\n");
        assert_eq!(lines, vec![b"This is line one\r\n".to_vec()]);
    }

    #[test]
    fn renders_message_level_and_residual_fields() {
        let mut d = Decorator::new(&json_output());
        let line = d.decorate(r#"{"level": "info", "message": "Hello World", "foo": "bar"}"#);
        assert_eq!(line.text, "[INFO]\tHello World\t{ \"foo\": \"bar\" }");
        assert_eq!(line.note, None);

        let line = d.decorate(
            r#"{"level": "info", "message": "An error has occurred", "n":42, "object": {"test":true}}"#,
        );
        assert_eq!(
            line.text,
            "[INFO]\tAn error has occurred\t{ \"n\": 42, \"object\": { \"test\": true } }"
        );
    }

    #[test]
    fn missing_message_or_level_fields_are_tolerated() {
        let mut d = Decorator::new(&json_output());
        assert_eq!(d.decorate(r#"{"level": "info"}"#).text, "[INFO]\t");
        let mut d = Decorator::new(&json_output());
        assert_eq!(
            d.decorate(r#"{"message": "Hello World", "foo": "bar"}"#).text,
            "Hello World\t{ \"foo\": \"bar\" }"
        );
    }

    #[test]
    fn colors_messages_by_tagging_rule() {
        let mut output = json_output();
        output.tagging_rules.push(TaggingRule {
            field: "level".to_string(),
            value: "error".to_string(),
            tag: "error".to_string(),
        });
        output.tag_styles.insert("error".to_string(), Style::new(Color::Red));

        let mut d = Decorator::new(&output);
        assert_eq!(d.decorate(r#"{"level": "info",  "message": "Hello World"}"#).text, "[INFO]\tHello World");
        assert_eq!(
            d.decorate(r#"{"level": "error", "message": "An error has occurred"}"#).text,
            format!("\x1b[31m[ERROR]\tAn error has occurred{}", RESET)
        );
    }

    #[test]
    fn colors_messages_by_regex_rule() {
        let mut output = json_output();
        output.tagging_rules.push(TaggingRule {
            field: "message".to_string(),
            value: "/t..t/i".to_string(),
            tag: "my-tag".to_string(),
        });
        output.tag_styles.insert("my-tag".to_string(), Style::new(Color::Blue));

        let mut d = Decorator::new(&output);
        assert_eq!(
            d.decorate(r#"{"level": "info",  "message": "This is a tEsT"}"#).text,
            format!("\x1b[34m[INFO]\tThis is a tEsT{}", RESET)
        );
        assert_eq!(
            d.decorate(r#"{"level": "error", "message": "An error has occurred"}"#).text,
            "[ERROR]\tAn error has occurred"
        );
    }

    #[test]
    fn later_rules_override_earlier_colors() {
        let mut output = json_output();
        for (value, tag) in [("/.*/", "all"), ("error", "error")] {
            output.tagging_rules.push(TaggingRule {
                field: "level".to_string(),
                value: value.to_string(),
                tag: tag.to_string(),
            });
        }
        output.tag_styles.insert("all".to_string(), Style::new(Color::Green));
        output.tag_styles.insert("error".to_string(), Style::new(Color::Red));

        let mut d = Decorator::new(&output);
        assert_eq!(
            d.decorate(r#"{"level": "error", "message": "x"}"#).text,
            format!("\x1b[31m[ERROR]\tx{}", RESET)
        );
    }

    #[test]
    fn auto_detects_json_on_the_first_line() {
        let mut d = Decorator::new(&StructuredOutput::auto_detect());
        assert_eq!(
            d.decorate(r#"{"level": "info", "message": "Hello World", "foo": "bar"}"#).text,
            "[INFO]\tHello World\t{ \"foo\": \"bar\" }"
        );
        // stays in JSON mode afterwards
        assert_eq!(d.decorate(r#"{"level": "info", "message": "again"}"#).text, "[INFO]\tagain");
    }

    #[test]
    fn auto_detection_settles_on_plain_for_unstructured_output() {
        let mut d = Decorator::new(&StructuredOutput::auto_detect());
        let first = "This is an unstructured message. It should be printed unchanged";
        assert_eq!(d.decorate(first), Decorated::plain(first));

        // JSON appearing later is still printed verbatim
        let json = r#"{"level": "info", "message": "later JSON is printed normally"}"#;
        assert_eq!(d.decorate(json), Decorated::plain(json));
        assert_eq!(d.decorate("Another message"), Decorated::plain("Another message"));
    }

    #[test]
    fn default_config_colors_error_levels_red() {
        let mut d = Decorator::new(&StructuredOutput::default());
        assert_eq!(d.decorate(r#"{"level":"info","message":"hello","k":1}"#).text, "[INFO]\thello\t{ \"k\": 1 }");
        assert_eq!(
            d.decorate(r#"{"level":"error","message":"bad"}"#).text,
            format!("\x1b[31m[ERROR]\tbad{}", RESET)
        );
        assert_eq!(
            d.decorate(r#"{"level":"FATAL","message":"worse"}"#).text,
            format!("\x1b[31m[FATAL]\tworse{}", RESET)
        );
    }

    #[test]
    fn forced_json_mode_forwards_undecodable_lines() {
        let mut d = Decorator::new(&json_output());
        let line = d.decorate("not json at all");
        assert_eq!(line.text, "not json at all");
        assert!(line.note.is_some());

        // a JSON scalar is not an object either
        let line = d.decorate("42");
        assert_eq!(line.text, "42");
        assert!(line.note.is_some());

        // decoding failures do not flip the mode
        assert_eq!(d.decorate(r#"{"level": "info", "message": "ok"}"#).text, "[INFO]\tok");
    }

    #[test]
    fn residual_rendering_sorts_keys_and_handles_nesting() {
        let mut d = Decorator::new(&json_output());
        let line = d.decorate(r#"{"b": [1, 2], "a": {"x": {"y": null}}, "c": "s"}"#);
        assert_eq!(
            line.text,
            "\t{ \"a\": { \"x\": { \"y\": null } }, \"b\": [ 1, 2 ], \"c\": \"s\" }"
        );
    }
}
