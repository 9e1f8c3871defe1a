use pyjvm_bytecode::BytecodeError;
use serde::Serialize;
use thiserror::Error;

use crate::ast::Pos;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind")]
pub enum CompileError {
    #[error("lexer error at line {line}, col {col}: {msg}")]
    Lex { line: usize, col: usize, msg: String },

    #[error("syntax error at line {line}, col {col}: {msg}")]
    Syntax { line: usize, col: usize, msg: String },

    #[error("unresolved name '{name}' at line {line}, col {col} (in {scope})")]
    UnresolvedName { line: usize, col: usize, name: String, scope: String },

    #[error("unsupported feature at line {line}, col {col}: {feature}")]
    UnsupportedFeature { line: usize, col: usize, feature: String },

    #[error("internal consistency fault in {context}: {msg}")]
    InternalFault { context: String, msg: String },

    #[error("annotation mismatch at line {line}, col {col}: {msg}")]
    AnnotationMismatch { line: usize, col: usize, msg: String },

    #[error("{count} further diagnostic(s) suppressed")]
    Suppressed { count: usize },
}

impl CompileError {
    pub fn lex(pos: Pos, msg: impl Into<String>) -> Self {
        CompileError::Lex { line: pos.line, col: pos.col, msg: msg.into() }
    }

    pub fn syntax(pos: Pos, msg: impl Into<String>) -> Self {
        CompileError::Syntax { line: pos.line, col: pos.col, msg: msg.into() }
    }

    pub fn unsupported(pos: Pos, feature: impl Into<String>) -> Self {
        CompileError::UnsupportedFeature { line: pos.line, col: pos.col, feature: feature.into() }
    }

    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        CompileError::InternalFault { context: context.into(), msg: msg.into() }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CompileError::InternalFault { .. } => Severity::Fatal,
            CompileError::AnnotationMismatch { .. } | CompileError::Suppressed { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Source position, when the diagnostic has one.
    pub fn position(&self) -> Option<Pos> {
        match self {
            CompileError::Lex { line, col, .. }
            | CompileError::Syntax { line, col, .. }
            | CompileError::UnresolvedName { line, col, .. }
            | CompileError::UnsupportedFeature { line, col, .. }
            | CompileError::AnnotationMismatch { line, col, .. } => Some(Pos { line: *line, col: *col }),
            CompileError::InternalFault { .. } | CompileError::Suppressed { .. } => None,
        }
    }
}

/// Lift a class-file format failure into a compiler defect report.
pub(crate) fn fault(context: &str) -> impl FnOnce(BytecodeError) -> CompileError + '_ {
    move |e| CompileError::internal(context, e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        })
    }
}
