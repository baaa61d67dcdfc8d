//! ANSI colors for prefixed process output.
//!
//! The palette hands out one color per process in a fixed order, wrapping
//! around when it runs out. In no-color mode the palette is empty and every
//! consumer receives [`Color::None`], which must suppress escape sequences
//! entirely instead of emitting empty ones.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Resets all SGR attributes.
pub const RESET: &str = "\x1b[0m";
/// Bold/bright SGR attribute, used for process name prefixes.
pub const BOLD: &str = "\x1b[1m";

/// A single ANSI foreground color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Color {
    /// No color at all; consumers must not emit any escape sequence.
    None,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    /// Reserved for the supervisor's own log sink.
    White,
}

impl Color {
    /// Returns the SGR escape sequence for this color, or `""` for
    /// [`Color::None`].
    pub fn code(self) -> &'static str {
        match self {
            Color::None => "",
            Color::Red => "\x1b[31m",
            Color::Green => "\x1b[32m",
            Color::Yellow => "\x1b[33m",
            Color::Blue => "\x1b[34m",
            Color::Magenta => "\x1b[35m",
            Color::Cyan => "\x1b[36m",
            Color::White => "\x1b[37m",
        }
    }

    fn from_name(name: &str) -> Option<Color> {
        match name {
            "red" => Some(Color::Red),
            "green" => Some(Color::Green),
            "yellow" => Some(Color::Yellow),
            "blue" => Some(Color::Blue),
            "magenta" => Some(Color::Magenta),
            "cyan" => Some(Color::Cyan),
            "white" => Some(Color::White),
            _ => None,
        }
    }
}

/// A color plus an optional bold attribute, as configured for message tags
/// (`red`, `green-bold`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Style {
    pub color: Color,
    pub bold: bool,
}

impl Style {
    pub fn new(color: Color) -> Self {
        Style { color, bold: false }
    }

    /// Parses a style name of the form `<color>` or `<color>-bold`.
    pub fn parse(name: &str) -> Option<Style> {
        let (color, bold) = match name.strip_suffix("-bold") {
            Some(base) => (base, true),
            None => (name, false),
        };
        Color::from_name(color).map(|color| Style { color, bold })
    }

    /// Wraps `text` in this style's escape sequences. Text is returned
    /// unchanged when the color is [`Color::None`].
    pub fn paint(&self, text: &str) -> String {
        if self.color == Color::None {
            return text.to_string();
        }
        let bold = if self.bold { BOLD } else { "" };
        format!("{}{}{}{}", bold, self.color.code(), text, RESET)
    }
}

/// An ordered, wrap-around cursor over the process colors. `next()` may be
/// called from any thread.
#[derive(Debug)]
pub struct Palette {
    colors: Vec<Color>,
    cursor: AtomicUsize,
}

impl Palette {
    /// The palette used for process prefixes. White is deliberately absent;
    /// it is reserved for the supervisor's log sink.
    pub fn colored() -> Self {
        Palette {
            colors: vec![
                Color::Cyan,
                Color::Yellow,
                Color::Green,
                Color::Magenta,
                Color::Red,
                Color::Blue,
            ],
            cursor: AtomicUsize::new(0),
        }
    }

    /// An empty palette for no-color mode; `next()` always returns
    /// [`Color::None`].
    pub fn monochrome() -> Self {
        Palette {
            colors: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Returns the color at the cursor and advances it, wrapping around at
    /// the end of the palette.
    pub fn next(&self) -> Color {
        if self.colors.is_empty() {
            return Color::None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.colors[i % self.colors.len()]
    }
}
