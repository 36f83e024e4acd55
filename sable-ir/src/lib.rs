#![forbid(unsafe_code)]

use std::fmt;

use miette::SourceSpan;

pub mod block;
pub mod module;
pub mod types;
pub mod value;

pub use block::{ArithOp, Block, CompOp, Entry, Instr, LabelAllocator, OpDir};
pub use module::{Case, ConstDef, Method, Module, TypeDef};
pub use types::{Type, TypePair};
pub use value::Value;

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

/// A dot-separated package path, e.g. `std.collections`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(pub Vec<String>);

impl PackageId {
    pub fn root(name: impl Into<String>) -> Self {
        PackageId(vec![name.into()])
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// A module within a package.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    pub package: PackageId,
    pub name: String,
}

impl ModuleId {
    pub fn new(package: PackageId, name: impl Into<String>) -> Self {
        ModuleId {
            package,
            name: name.into(),
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.package.0.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.package, self.name)
        }
    }
}

/// A fully qualified symbol: the module it lives in plus its local name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub module: ModuleId,
    pub name: String,
}

impl QualifiedName {
    pub fn new(module: ModuleId, name: impl Into<String>) -> Self {
        QualifiedName {
            module,
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.name)
    }
}
