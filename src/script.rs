//! Shell-script tokenization for process scripts.
//!
//! Scripts are split into argv on ASCII whitespace with single-quote,
//! double-quote, and backslash handling. The supervisor starts executables
//! directly rather than through a shell, so unquoted shell control characters
//! (`;`, `|`, `<`, `>`, `&`) are rejected instead of silently passed through.
//! `$VAR`/`${VAR}` expansion and leading `KEY=VALUE` environment assignments
//! are resolved against the process environment after tokenization.

use thiserror::Error;

use crate::env::Environment;

/// Errors produced while turning a script into an argv.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("unterminated {quote} quote")]
    UnterminatedQuote { quote: char },
    #[error("trailing backslash")]
    TrailingBackslash,
    #[error("unsupported shell character {0:?} (pipes and redirection are not supported)")]
    Metacharacter(char),
    #[error("script contains no command")]
    MissingCommand,
}

/// A tokenized and expanded script, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// The executable and its arguments.
    pub argv: Vec<String>,
    /// `KEY=VALUE` assignments that prefixed the command; they apply to the
    /// child's environment only and are not part of argv.
    pub env_overrides: Vec<(String, String)>,
}

/// Splits `script` into raw tokens according to the quoting grammar. No
/// expansion is performed.
pub fn tokenize(script: &str) -> Result<Vec<String>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = script.chars();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\\' => {
                let escaped = chars.next().ok_or(TokenizeError::TrailingBackslash)?;
                current.push(escaped);
                in_token = true;
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(TokenizeError::UnterminatedQuote { quote: '\'' }),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c) => current.push(c),
                            None => {
                                return Err(TokenizeError::UnterminatedQuote { quote: '"' })
                            }
                        },
                        Some(c) => current.push(c),
                        None => return Err(TokenizeError::UnterminatedQuote { quote: '"' }),
                    }
                }
            }
            ';' | '|' | '<' | '>' | '&' => return Err(TokenizeError::Metacharacter(c)),
            _ => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Tokenizes `script`, expands every token against `env`, and splits off
/// leading `KEY=VALUE` assignments.
pub fn parse_command(script: &str, env: &Environment) -> Result<CommandLine, TokenizeError> {
    let tokens = tokenize(script)?;

    let mut env_overrides = Vec::new();
    let mut argv = Vec::new();
    for token in tokens {
        let expanded = env.expand(&token);
        if argv.is_empty() {
            if let Some((key, value)) = split_assignment(&expanded) {
                env_overrides.push((key.to_string(), value.to_string()));
                continue;
            }
        }
        argv.push(expanded);
    }

    if argv.is_empty() {
        return Err(TokenizeError::MissingCommand);
    }
    Ok(CommandLine { argv, env_overrides })
}

// An assignment token is KEY=VALUE where KEY is a valid variable name.
fn split_assignment(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    let mut bytes = key.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return None,
    }
    if bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Some((key, value))
    } else {
        None
    }
}
