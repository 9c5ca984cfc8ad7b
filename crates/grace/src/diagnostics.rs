//! Compile-time diagnostic rendering.
//!
//! Errors and warnings print a coloured banner, the `file:line:column`
//! header, the offending line with its neighbours, and a caret underline
//! spanning the token.

use std::fmt::Write as _;

use crate::scanner::{SourceMap, Token, TokenKind};

const RED: &str = "\x1b[31;1m";
const ORANGE: &str = "\x1b[33;1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warning,
    Error,
}

/// A structured diagnostic, retained so tests and embedders can inspect what
/// the compiler reported without parsing the rendered text.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: LogLevel,
    pub message: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
}

/// Renders one diagnostic in the compiler's report format.
#[must_use]
pub fn render(
    token: &Token,
    message: &str,
    level: LogLevel,
    file_path: &str,
    sources: &SourceMap,
    source_key: &str,
) -> String {
    let colour = if level == LogLevel::Error { RED } else { ORANGE };
    let banner = if level == LogLevel::Error { "ERROR" } else { "WARNING" };

    let mut out = String::new();
    let _ = write!(out, "{colour}{banner}: {RESET}");
    match token.kind {
        TokenKind::EndOfFile => {
            let _ = writeln!(out, "at end: {message}");
        }
        TokenKind::Error => {
            let detail = token.error_message.as_deref().unwrap_or(message);
            let _ = writeln!(out, "{detail}");
        }
        _ => {
            let _ = writeln!(out, "at '{}': {message}", token.lexeme);
        }
    }

    let length = token.length();
    let column_start = token.column.saturating_sub(length).max(1);
    let _ = writeln!(out, "       --> {file_path}:{}:{column_start}", token.line);
    let _ = writeln!(out, "        |");

    if token.line > 1
        && let Some(code) = sources.code_at_line(source_key, token.line - 1)
    {
        let _ = writeln!(out, "{:>7} | {code}", token.line - 1);
    }

    let code = sources.code_at_line(source_key, token.line).unwrap_or("");
    let _ = writeln!(out, "{:>7} | {code}", token.line);
    let _ = write!(out, "        | ");
    for _ in 1..column_start {
        out.push(' ');
    }
    let _ = write!(out, "{colour}");
    for _ in 0..length.max(1) {
        out.push('^');
    }
    let _ = writeln!(out, "{RESET}");

    if let Some(code) = sources.code_at_line(source_key, token.line + 1) {
        let _ = writeln!(out, "{:>7} | {code}", token.line + 1);
    }
    let _ = writeln!(out, "        |");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_underlines_the_token() {
        let mut sources = SourceMap::new();
        sources.insert("test.gr".into(), "var x = y;\n".into());
        let token = Token {
            kind: TokenKind::Identifier,
            lexeme: "y".into(),
            line: 1,
            column: 10,
            error_message: None,
        };
        let rendered = render(
            &token,
            "Cannot find variable 'y' in this scope",
            LogLevel::Error,
            "/tmp/test.gr",
            &sources,
            "test.gr",
        );
        assert!(rendered.contains("ERROR"));
        assert!(rendered.contains("/tmp/test.gr:1:9"));
        assert!(rendered.contains("var x = y;"));
        assert!(rendered.contains('^'));
    }
}
