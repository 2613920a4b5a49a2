#![forbid(unsafe_code)]

use std::collections::HashSet;

use ciphra_ast::Span;
use miette::Diagnostic;
use thiserror::Error;

/// Closed taxonomy of semantic failures. A kind is fatal to its owning
/// module's codegen eligibility, never to the whole program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    // scheme / context
    UnknownScheme,
    MissingParameter,
    InvalidParameter,

    // resolution
    UnboundName,
    DuplicateBinding,
    CyclicImport,
    UnknownExport,
    AmbiguousContext,

    // types
    NoApplicableOverload,
    TypeMismatch,
    ArityMismatch,
    LengthMismatch,
    RecordShapeMismatch,
    NonExhaustiveConditional,
    OccursCheck,
    AssignToImmutable,

    // refinement
    IncompatibleLevels,
    IncompatibleModuli,
    NoiseBudgetExceeded,
    LevelExhausted,
    SignatureLevelMismatch,

    // constraints
    ConstraintViolation,
    UnderconstrainedNatural,

    // effects
    MissingEffectAnnotation,
    EffectAnnotationTooNarrow,

    // warnings
    UnusedSymbol,
}

impl DiagnosticKind {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticKind::UnknownScheme => "UnknownScheme",
            DiagnosticKind::MissingParameter => "MissingParameter",
            DiagnosticKind::InvalidParameter => "InvalidParameter",
            DiagnosticKind::UnboundName => "UnboundName",
            DiagnosticKind::DuplicateBinding => "DuplicateBinding",
            DiagnosticKind::CyclicImport => "CyclicImport",
            DiagnosticKind::UnknownExport => "UnknownExport",
            DiagnosticKind::AmbiguousContext => "AmbiguousContext",
            DiagnosticKind::NoApplicableOverload => "NoApplicableOverload",
            DiagnosticKind::TypeMismatch => "TypeMismatch",
            DiagnosticKind::ArityMismatch => "ArityMismatch",
            DiagnosticKind::LengthMismatch => "LengthMismatch",
            DiagnosticKind::RecordShapeMismatch => "RecordShapeMismatch",
            DiagnosticKind::NonExhaustiveConditional => "NonExhaustiveConditional",
            DiagnosticKind::OccursCheck => "OccursCheck",
            DiagnosticKind::AssignToImmutable => "AssignToImmutable",
            DiagnosticKind::IncompatibleLevels => "IncompatibleLevels",
            DiagnosticKind::IncompatibleModuli => "IncompatibleModuli",
            DiagnosticKind::NoiseBudgetExceeded => "NoiseBudgetExceeded",
            DiagnosticKind::LevelExhausted => "LevelExhausted",
            DiagnosticKind::SignatureLevelMismatch => "SignatureLevelMismatch",
            DiagnosticKind::ConstraintViolation => "ConstraintViolation",
            DiagnosticKind::UnderconstrainedNatural => "UnderconstrainedNatural",
            DiagnosticKind::MissingEffectAnnotation => "MissingEffectAnnotation",
            DiagnosticKind::EffectAnnotationTooNarrow => "EffectAnnotationTooNarrow",
            DiagnosticKind::UnusedSymbol => "UnusedSymbol",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            DiagnosticKind::UnusedSymbol => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn display(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

#[derive(Clone, Debug, Error, Diagnostic)]
#[error("{}: {message}", kind.name())]
#[diagnostic(code(ciphra::sema))]
pub struct Diag {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
    #[label]
    pub span: Span,
    #[help]
    pub help: Option<String>,
}

/// Accumulating sink with deduplication and a fatal-diagnostic threshold.
///
/// One root cause should produce one diagnostic: checking continues with
/// `Error`-placeholder types, and a repeat report with the same kind, span
/// and message is dropped. Once `fatal_limit` errors accumulate, [`Diagnostics::overflowed`]
/// tells the checker to abandon the rest of the module.
#[derive(Debug)]
pub struct Diagnostics {
    diags: Vec<Diag>,
    seen: HashSet<(DiagnosticKind, usize, usize, String)>,
    fatal_count: usize,
    fatal_limit: usize,
}

impl Diagnostics {
    pub fn new(fatal_limit: usize) -> Self {
        Self {
            diags: Vec::new(),
            seen: HashSet::new(),
            fatal_count: 0,
            fatal_limit,
        }
    }

    pub fn error(&mut self, kind: DiagnosticKind, span: Span, message: impl Into<String>) {
        self.push(kind, Severity::Error, span, message.into(), None);
    }

    pub fn error_help(
        &mut self,
        kind: DiagnosticKind,
        span: Span,
        message: impl Into<String>,
        help: impl Into<String>,
    ) {
        self.push(kind, Severity::Error, span, message.into(), Some(help.into()));
    }

    pub fn warn(&mut self, kind: DiagnosticKind, span: Span, message: impl Into<String>) {
        self.push(kind, Severity::Warning, span, message.into(), None);
    }

    fn push(
        &mut self,
        kind: DiagnosticKind,
        severity: Severity,
        span: Span,
        message: String,
        help: Option<String>,
    ) {
        let key = (kind, span.offset(), span.len(), message.clone());
        if !self.seen.insert(key) {
            return;
        }
        if severity == Severity::Error {
            self.fatal_count += 1;
        }
        self.diags.push(Diag {
            kind,
            severity,
            message,
            span,
            help,
        });
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal_count > 0
    }

    /// The module should be abandoned once the threshold is reached.
    pub fn overflowed(&self) -> bool {
        self.fatal_count >= self.fatal_limit
    }

    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diags.len()
    }

    /// Finish the pass: diagnostics ordered by source position, then kind.
    pub fn into_sorted(mut self) -> Vec<Diag> {
        self.diags.sort_by_key(|d| (d.span.offset(), d.span.len(), d.kind.name()));
        self.diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciphra_ast::span;

    #[test]
    fn dedupes_same_kind_and_span() {
        let mut diags = Diagnostics::new(32);
        diags.error(DiagnosticKind::UnboundName, span(4, 2), "unknown 'x'");
        diags.error(DiagnosticKind::UnboundName, span(4, 2), "unknown 'x'");
        diags.error(DiagnosticKind::UnboundName, span(9, 2), "unknown 'y'");
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn warnings_do_not_count_toward_fatal_threshold() {
        let mut diags = Diagnostics::new(1);
        diags.warn(DiagnosticKind::UnusedSymbol, span(0, 1), "unused 'a'");
        assert!(!diags.has_fatal());
        assert!(!diags.overflowed());
        diags.error(DiagnosticKind::TypeMismatch, span(2, 1), "Int vs Bool");
        assert!(diags.has_fatal());
        assert!(diags.overflowed());
    }

    #[test]
    fn sorted_by_source_position() {
        let mut diags = Diagnostics::new(32);
        diags.error(DiagnosticKind::TypeMismatch, span(20, 1), "later");
        diags.error(DiagnosticKind::UnboundName, span(3, 1), "earlier");
        let out = diags.into_sorted();
        assert_eq!(out[0].kind, DiagnosticKind::UnboundName);
        assert_eq!(out[1].kind, DiagnosticKind::TypeMismatch);
    }
}
