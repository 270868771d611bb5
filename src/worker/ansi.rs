//! Translation of terminal escape sequences in task output.
//!
//! Processes print colour codes assuming a terminal. The renderer either
//! drops them (`Plain`) or turns SGR attributes into HTML spans (`Html`) for
//! viewports that understand markup. Style state carries across lines of one
//! stream, so a colour opened on one line still applies on the next.

use std::fmt::Write as _;
use std::str::FromStr;

use vte::{Params, Parser, Perform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Plain,
    Html,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" => Ok(OutputFormat::Plain),
            "html" => Ok(OutputFormat::Html),
            other => Err(format!("expected 'plain' or 'html', got '{}'", other)),
        }
    }
}

const BASIC_COLORS: [&str; 8] = ["black", "red", "green", "yellow", "blue", "magenta", "cyan", "white"];
const BRIGHT_COLORS: [&str; 8] = ["gray", "#ff5555", "#55ff55", "#ffff55", "#5555ff", "#ff55ff", "#55ffff", "#ffffff"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Style {
    bold: bool,
    italic: bool,
    underline: bool,
    fg: Option<String>,
    bg: Option<String>,
}

impl Style {
    fn is_plain(&self) -> bool {
        *self == Style::default()
    }

    fn css(&self) -> String {
        let mut css = String::new();
        if let Some(fg) = &self.fg {
            let _ = write!(css, "color: {};", fg);
        }
        if let Some(bg) = &self.bg {
            let _ = write!(css, "background-color: {};", bg);
        }
        if self.bold {
            css.push_str("font-weight: bold;");
        }
        if self.italic {
            css.push_str("font-style: italic;");
        }
        if self.underline {
            css.push_str("text-decoration: underline;");
        }
        css
    }

    fn apply(&mut self, params: &[u16]) {
        if params.is_empty() {
            *self = Style::default();
            return;
        }
        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => *self = Style::default(),
                1 => self.bold = true,
                3 => self.italic = true,
                4 => self.underline = true,
                22 => self.bold = false,
                23 => self.italic = false,
                24 => self.underline = false,
                code @ 30..=37 => self.fg = Some(BASIC_COLORS[(code - 30) as usize].to_string()),
                39 => self.fg = None,
                code @ 40..=47 => self.bg = Some(BASIC_COLORS[(code - 40) as usize].to_string()),
                49 => self.bg = None,
                code @ 90..=97 => self.fg = Some(BRIGHT_COLORS[(code - 90) as usize].to_string()),
                code @ 100..=107 => self.bg = Some(BRIGHT_COLORS[(code - 100) as usize].to_string()),
                selector @ (38 | 48) => {
                    let (color, used) = extended_color(&params[i + 1..]);
                    if selector == 38 {
                        self.fg = color;
                    } else {
                        self.bg = color;
                    }
                    i += used;
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// Parses the tail of a `38;...` / `48;...` sequence. Returns the colour and
/// how many parameters it consumed.
fn extended_color(rest: &[u16]) -> (Option<String>, usize) {
    match rest {
        [5, n, ..] => (Some(palette_color(*n)), 2),
        [2, r, g, b, ..] => (Some(format!("rgb({}, {}, {})", r, g, b)), 4),
        [5] => (None, 1),
        [2, ..] => (None, rest.len()),
        _ => (None, 0),
    }
}

fn palette_color(n: u16) -> String {
    match n {
        0..=7 => BASIC_COLORS[n as usize].to_string(),
        8..=15 => BRIGHT_COLORS[(n - 8) as usize].to_string(),
        16..=231 => {
            let n = n - 16;
            let level = |v: u16| if v == 0 { 0 } else { 55 + v * 40 };
            format!("rgb({}, {}, {})", level(n / 36), level((n / 6) % 6), level(n % 6))
        }
        _ => {
            let gray = 8 + (n.min(255) - 232) * 10;
            format!("rgb({}, {}, {})", gray, gray, gray)
        }
    }
}

/// Stateful per-stream renderer.
pub struct AnsiRenderer {
    format: OutputFormat,
    style: Style,
    parser: Parser,
}

impl AnsiRenderer {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            style: Style::default(),
            parser: Parser::new(),
        }
    }

    pub fn render_line(&mut self, line: &str) -> String {
        match self.format {
            OutputFormat::Plain => strip_ansi_escapes::strip_str(line),
            OutputFormat::Html => {
                let mut markup = HtmlMarkup::new(&mut self.style, line.len());
                for byte in line.bytes() {
                    self.parser.advance(&mut markup, byte);
                }
                markup.finish()
            }
        }
    }
}

/// Receives one line from the escape parser and writes HTML.
struct HtmlMarkup<'a> {
    out: String,
    style: &'a mut Style,
    span_open: bool,
}

impl<'a> HtmlMarkup<'a> {
    fn new(style: &'a mut Style, capacity: usize) -> Self {
        let mut markup = Self {
            out: String::with_capacity(capacity),
            style,
            span_open: false,
        };
        markup.open_span();
        markup
    }

    fn open_span(&mut self) {
        if !self.style.is_plain() {
            let _ = write!(self.out, "<span style=\"{}\">", self.style.css());
            self.span_open = true;
        }
    }

    fn close_span(&mut self) {
        if self.span_open {
            self.out.push_str("</span>");
            self.span_open = false;
        }
    }

    fn finish(mut self) -> String {
        self.close_span();
        self.out
    }
}

impl Perform for HtmlMarkup<'_> {
    fn print(&mut self, c: char) {
        match c {
            '&' => self.out.push_str("&amp;"),
            '<' => self.out.push_str("&lt;"),
            '>' => self.out.push_str("&gt;"),
            '"' => self.out.push_str("&quot;"),
            _ => self.out.push(c),
        }
    }

    fn execute(&mut self, byte: u8) {
        if byte == b'\t' {
            self.out.push('\t');
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if action != 'm' || ignore || !intermediates.is_empty() {
            return;
        }
        let codes: Vec<u16> = params.iter().flatten().copied().collect();
        self.style.apply(&codes);
        self.close_span();
        self.open_span();
    }
}
