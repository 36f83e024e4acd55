#![forbid(unsafe_code)]

use miette::Diagnostic;
use sable_ir::types::Type;
use sable_ir::Span;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompileError>;

/// A fault raised while translating one source file. Translation is
/// first-error-wins: the first of these aborts the file.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    /// A user-facing error, attached to the offending node.
    #[error("{filename}: {kind}")]
    #[diagnostic(code(sable::syntax))]
    Syntax {
        filename: String,
        kind: ErrorKind,
        #[label]
        span: Span,
    },

    /// The pipeline itself misbehaved; retains the causing fault.
    #[error("{filename}: internal failure: {message}")]
    #[diagnostic(code(sable::internal))]
    Internal {
        filename: String,
        message: String,
        #[label]
        span: Span,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl CompileError {
    pub fn syntax(filename: impl Into<String>, kind: ErrorKind, span: Span) -> Self {
        CompileError::Syntax {
            filename: filename.into(),
            kind,
            span,
        }
    }

    pub fn internal(filename: impl Into<String>, message: impl Into<String>, span: Span) -> Self {
        CompileError::Internal {
            filename: filename.into(),
            message: message.into(),
            span,
            cause: None,
        }
    }

    pub fn internal_caused(
        filename: impl Into<String>,
        message: impl Into<String>,
        span: Span,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CompileError::Internal {
            filename: filename.into(),
            message: message.into(),
            span,
            cause: Some(Box::new(cause)),
        }
    }

    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            CompileError::Syntax { kind, .. } => Some(kind),
            CompileError::Internal { .. } => None,
        }
    }
}

/// The message key of a user-facing error.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ErrorKind {
    #[error("unknown variable")]
    UnknownVariable,
    #[error("variable {0} is already defined")]
    VariableAlreadyDefined(String),
    #[error("unable to resolve {0}")]
    UnresolvedName(String),
    #[error("invalid lvalue expression")]
    InvalidLVal,
    #[error("invalid tuple lvalue")]
    InvalidTupleLVal,
    #[error("expected type {expected}, found {found}")]
    SubtypeMismatch { expected: Type, found: Type },
    #[error("invalid boolean expression")]
    InvalidBooleanExpression,
    #[error("invalid binary expression")]
    InvalidBinaryExpression,
    #[error("invalid string operation")]
    InvalidStringOperation,
    #[error("invalid set operation")]
    InvalidSetOperation,
    #[error("invalid list operation")]
    InvalidListOperation,
    #[error("invalid set expression")]
    InvalidSetExpression,
    #[error("invalid list expression")]
    InvalidListExpression,
    #[error("invalid dictionary expression")]
    InvalidDictionaryExpression,
    #[error("invalid record expression")]
    InvalidRecordExpression,
    #[error("record has no field {0}")]
    UnknownField(String),
    #[error("duplicate case label")]
    DuplicateCaseLabel,
    #[error("duplicate default label")]
    DuplicateDefaultLabel,
    #[error("unreachable case")]
    UnreachableCase,
    #[error("case label must be a compile-time constant")]
    InvalidCaseLabel,
    #[error("break outside loop")]
    BreakOutsideLoop,
    #[error("unknown function or method")]
    UnknownFunctionOrMethod,
}
