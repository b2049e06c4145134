//! ANSI styling for terminal tables.
//!
//! Plain text is emitted when stdout is redirected or `NO_COLOR` is set.

use std::io::IsTerminal;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy)]
enum Paint {
    Bold,
    Dim,
    Ok,
    Warn,
    Bad,
    Title,
}

impl Paint {
    fn sgr(self) -> &'static str {
        match self {
            Paint::Bold => "1",
            Paint::Dim => "2",
            Paint::Ok => "32",
            Paint::Warn => "33",
            Paint::Bad => "31",
            Paint::Title => "1;36",
        }
    }

    fn apply(self, text: &str) -> String {
        static ON: OnceLock<bool> = OnceLock::new();
        let on = *ON.get_or_init(|| {
            std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal()
        });
        if on {
            format!("\x1b[{}m{text}\x1b[0m", self.sgr())
        } else {
            text.to_owned()
        }
    }
}

pub fn bold(s: &str) -> String {
    Paint::Bold.apply(s)
}

pub fn dim(s: &str) -> String {
    Paint::Dim.apply(s)
}

pub fn green(s: &str) -> String {
    Paint::Ok.apply(s)
}

pub fn yellow(s: &str) -> String {
    Paint::Warn.apply(s)
}

pub fn red(s: &str) -> String {
    Paint::Bad.apply(s)
}

pub fn bold_cyan(s: &str) -> String {
    Paint::Title.apply(s)
}

/// Printed width of `s`: CSI sequences (`ESC [ ... final`) take no columns.
fn width(s: &str) -> usize {
    let mut chars = s.chars();
    let mut cols = 0;
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip up to and including the final byte, '@'..='~'.
            chars.by_ref().skip(1).find(|c| ('@'..='~').contains(c));
        } else {
            cols += 1;
        }
    }
    cols
}

/// Left-align `s` in a column `cols` wide, ignoring escape codes.
pub fn rpad(s: &str, cols: usize) -> String {
    let fill = cols.saturating_sub(width(s));
    format!("{s}{:fill$}", "")
}
