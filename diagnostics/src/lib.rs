//! Diagnostics for the offload compiler
//!
//! Lowering never aborts on a warning; warnings are collected here and
//! rendered by the driver once a function is done. Each diagnostic carries a
//! stable code (see [`offload`]) so callers and tests can pick them out.

use std::fmt;

/// Source position a diagnostic points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceSpan {
    pub file_id: u32,
    pub line: u32,
    pub column: u32,
}

impl SourceSpan {
    pub fn new(file_id: u32, line: u32, column: u32) -> Self {
        Self {
            file_id,
            line,
            column,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        self.line != 0
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file_id, self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

impl DiagnosticSeverity {
    fn ansi(self) -> &'static str {
        match self {
            DiagnosticSeverity::Error => "\x1b[31m",
            DiagnosticSeverity::Warning => "\x1b[33m",
        }
    }
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Error => write!(f, "error"),
            DiagnosticSeverity::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub code: Option<String>,
    pub message: String,
    pub span: SourceSpan,
    pub notes: Vec<String>,
    pub help: Vec<String>,
}

impl Diagnostic {
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

/// Diagnostics collected over a compilation, in emission order
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    diagnostics: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.of_severity(DiagnosticSeverity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.of_severity(DiagnosticSeverity::Error).next().is_some()
    }

    fn of_severity(&self, severity: DiagnosticSeverity) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.severity == severity)
    }

    /// Diagnostics carrying the given code.
    pub fn with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.has_code(code))
    }
}

/// Builder for creating diagnostics
pub struct DiagnosticBuilder {
    diagnostic: Diagnostic,
}

impl DiagnosticBuilder {
    fn new(severity: DiagnosticSeverity, message: impl Into<String>, span: SourceSpan) -> Self {
        Self {
            diagnostic: Diagnostic {
                severity,
                code: None,
                message: message.into(),
                span,
                notes: Vec::new(),
                help: Vec::new(),
            },
        }
    }

    pub fn error(message: impl Into<String>, span: SourceSpan) -> Self {
        Self::new(DiagnosticSeverity::Error, message, span)
    }

    pub fn warning(message: impl Into<String>, span: SourceSpan) -> Self {
        Self::new(DiagnosticSeverity::Warning, message, span)
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.diagnostic.code = Some(code.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.diagnostic.notes.push(note.into());
        self
    }

    pub fn help(mut self, help_msg: impl Into<String>) -> Self {
        self.diagnostic.help.push(help_msg.into());
        self
    }

    pub fn build(self) -> Diagnostic {
        self.diagnostic
    }
}

/// Renders diagnostics as terminal text
#[derive(Debug, Default)]
pub struct ErrorFormatter {
    use_colors: bool,
}

impl ErrorFormatter {
    pub fn new() -> Self {
        Self { use_colors: false }
    }

    pub fn with_colors() -> Self {
        Self { use_colors: true }
    }

    fn paint(&self, ansi: &str, text: &str) -> String {
        if self.use_colors {
            format!("{}{}\x1b[0m", ansi, text)
        } else {
            text.to_string()
        }
    }

    /// Every diagnostic followed by a count summary.
    pub fn format_diagnostics(&self, diagnostics: &Diagnostics) -> String {
        let mut output: String = diagnostics.iter().map(|d| self.format_diagnostic(d)).collect();
        let warnings = diagnostics.warnings().count();
        let errors = diagnostics.len() - warnings;
        let plural = |n: usize| if n == 1 { "" } else { "s" };
        if errors > 0 {
            output.push_str(&format!("{} error{} emitted\n", errors, plural(errors)));
        }
        if warnings > 0 {
            output.push_str(&format!("{} warning{} emitted\n", warnings, plural(warnings)));
        }
        output
    }

    pub fn format_diagnostic(&self, diagnostic: &Diagnostic) -> String {
        let mut header = diagnostic.severity.to_string();
        if let Some(code) = &diagnostic.code {
            header.push_str(&format!("[{}]", code));
        }
        let mut output = format!(
            "{}: {}\n",
            self.paint(diagnostic.severity.ansi(), &header),
            diagnostic.message
        );
        if diagnostic.span.is_known() {
            output.push_str(&format!("  {} {}\n", self.paint("\x1b[96m", "-->"), diagnostic.span));
        }
        for note in &diagnostic.notes {
            output.push_str(&format!("  = {}: {}\n", self.paint("\x1b[34m", "note"), note));
        }
        for help_msg in &diagnostic.help {
            output.push_str(&format!("  = {}: {}\n", self.paint("\x1b[32m", "help"), help_msg));
        }
        output
    }
}

// Diagnostics raised while offloading loop nests
pub mod offload;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_builder() {
        let diagnostic = DiagnosticBuilder::warning("test warning", SourceSpan::new(0, 5, 4))
            .code("W0001")
            .help("try this")
            .note("additional info")
            .build();

        assert_eq!(diagnostic.severity, DiagnosticSeverity::Warning);
        assert!(diagnostic.has_code("W0001"));
        assert_eq!(diagnostic.help, vec!["try this".to_string()]);
        assert_eq!(diagnostic.notes, vec!["additional info".to_string()]);
    }

    #[test]
    fn test_plain_formatting() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(
            DiagnosticBuilder::warning("slow path", SourceSpan::new(2, 10, 3))
                .code("W0002")
                .note("cause")
                .build(),
        );
        diagnostics.push(DiagnosticBuilder::error("broken", SourceSpan::unknown()).build());

        let text = ErrorFormatter::new().format_diagnostics(&diagnostics);
        assert!(text.contains("warning[W0002]: slow path\n  --> 2:10:3\n  = note: cause\n"));
        assert!(text.contains("error: broken\n"));
        assert!(text.ends_with("1 error emitted\n1 warning emitted\n"));
        assert!(diagnostics.has_errors());
    }

    #[test]
    fn test_colors_wrap_header_only() {
        let diag = DiagnosticBuilder::warning("w", SourceSpan::unknown()).build();
        let text = ErrorFormatter::with_colors().format_diagnostic(&diag);
        assert_eq!(text, "\x1b[33mwarning\x1b[0m: w\n");
    }
}
