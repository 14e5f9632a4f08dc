//! Offload-specific diagnostic builders
//!
//! Warnings raised while moving loop nests to a device. Neither is fatal:
//! a parallel-safety warning accompanies an automatic rewrite, a performance
//! warning accompanies a fallback to sequential execution.

use crate::{Diagnostic, DiagnosticBuilder, SourceSpan};

/// Variable written concurrently by several work-items
pub const PARALLEL_SAFETY: &str = "W0801";

/// Loop nest could not be offloaded and runs sequentially instead
pub const PERFORMANCE: &str = "W0802";

/// Provides the offload diagnostic builders
pub struct OffloadDiagnostics;

impl OffloadDiagnostics {
    /// Race on a loop-carried variable
    pub fn parallel_safety(variable: &str, span: SourceSpan) -> Diagnostic {
        DiagnosticBuilder::warning(
            format!(
                "Variable {} used in parallel loop may be written to simultaneously by \
                 multiple workers and may result in non-deterministic or unintended results.",
                variable
            ),
            span,
        )
        .code(PARALLEL_SAFETY)
        .note(format!("{} is stored through a one-element array inside the kernel", variable))
        .build()
    }

    /// Device lowering failed and the function was lowered sequentially
    pub fn offload_fallback(device: &str, cause: &str, debug: bool, span: SourceSpan) -> Diagnostic {
        let mut builder = DiagnosticBuilder::warning(
            format!(
                "Failed to offload loop nest to {}. Falling back to default CPU parallelization.",
                device
            ),
            span,
        )
        .code(PERFORMANCE)
        .note(format!("cause: {}", cause));
        if !debug {
            builder = builder.help("Set `debug = true` in the offload configuration to log the full failure.");
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DiagnosticSeverity;

    #[test]
    fn test_fallback_help_depends_on_debug() {
        let quiet = OffloadDiagnostics::offload_fallback("host", "boom", false, SourceSpan::unknown());
        assert_eq!(quiet.severity, DiagnosticSeverity::Warning);
        assert!(quiet.has_code(PERFORMANCE));
        assert!(quiet.message.contains("host"));
        assert_eq!(quiet.notes, vec!["cause: boom".to_string()]);
        assert_eq!(quiet.help.len(), 1);

        let verbose = OffloadDiagnostics::offload_fallback("host", "boom", true, SourceSpan::unknown());
        assert!(verbose.help.is_empty());
    }

    #[test]
    fn test_parallel_safety_names_variable() {
        let diag = OffloadDiagnostics::parallel_safety("acc", SourceSpan::new(0, 3, 1));
        assert!(diag.has_code(PARALLEL_SAFETY));
        assert!(diag.message.starts_with("Variable acc used in parallel loop"));
    }
}
