//! Diagnostic records and the collectors that gather them.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::error::{CompileError, Severity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub module: String,
    pub severity: Severity,
    pub error: CompileError,
}

impl Diagnostic {
    pub fn new(module: &str, error: CompileError) -> Self {
        Diagnostic { module: module.to_string(), severity: error.severity(), error }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"serialization_error\":\"{e}\"}}"))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.module, self.severity, self.error)
    }
}

/// Per-module collector with a fail-fast threshold on error diagnostics.
pub struct ModuleDiagnostics {
    module: String,
    limit: usize,
    errors: usize,
    suppressed: usize,
    items: Vec<Diagnostic>,
}

impl ModuleDiagnostics {
    pub fn new(module: &str, limit: usize) -> Self {
        ModuleDiagnostics { module: module.to_string(), limit, errors: 0, suppressed: 0, items: Vec::new() }
    }

    pub fn push(&mut self, error: CompileError) {
        let severity = error.severity();
        if severity == Severity::Error {
            if self.errors >= self.limit {
                self.suppressed += 1;
                return;
            }
            self.errors += 1;
        }
        self.items.push(Diagnostic::new(&self.module, error));
    }

    pub fn extend(&mut self, errors: impl IntoIterator<Item = CompileError>) {
        for e in errors {
            self.push(e);
        }
    }

    /// True once the threshold has been hit; the pipeline stops early.
    pub fn exhausted(&self) -> bool {
        self.errors >= self.limit
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity >= Severity::Error)
    }

    pub fn finish(mut self) -> Vec<Diagnostic> {
        if self.suppressed > 0 {
            warn!(module = %self.module, count = self.suppressed, "diagnostics suppressed");
            self.items.push(Diagnostic::new(&self.module, CompileError::Suppressed { count: self.suppressed }));
        }
        self.items
    }
}

/// Append-only diagnostic sink shared by concurrently compiled modules.
/// Each diagnostic is stored whole under the lock.
#[derive(Default)]
pub struct DiagnosticSink {
    items: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, diagnostic: Diagnostic) {
        let mut items = self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        items.push(diagnostic);
    }

    pub fn extend(&self, diagnostics: Vec<Diagnostic>) {
        let mut items = self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        items.extend(diagnostics);
    }

    /// All diagnostics ordered by module, then by position, independent of
    /// the order in which worker threads finished.
    pub fn into_sorted(self) -> Vec<Diagnostic> {
        let mut items = self.items.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        items.sort_by_key(|d| {
            let pos = d.error.position().map(|p| (p.line, p.col));
            (d.module.clone(), pos.is_none(), pos)
        });
        items
    }

    pub fn worst(&self) -> Option<Severity> {
        let items = self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        items.iter().map(|d| d.severity).max()
    }
}
