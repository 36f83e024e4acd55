#![forbid(unsafe_code)]

//! Collaborator contracts.
//!
//! Alias expansion and name resolution are owned by surrounding stages; the
//! semantic core only consumes these two interfaces.

use sable_ast::Import;
use sable_ir::types::Type;
use sable_ir::value::Value;
use sable_ir::{ModuleId, PackageId, QualifiedName};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
#[error("unable to resolve `{name}`")]
pub struct ResolveError {
    pub name: String,
}

impl ResolveError {
    pub fn new(name: impl Into<String>) -> Self {
        ResolveError { name: name.into() }
    }
}

/// Expands a nominal type into its fully alias-expanded structural form.
/// The contract is `raw = expand(nominal)`, always.
pub trait TypeExpander {
    fn expand(&self, ty: &Type) -> Result<Type, ResolveError>;
}

/// Resolves a bare identifier against the imports in scope.
pub trait NameResolver {
    /// Resolves an identifier to an external symbol.
    fn resolve_name(&self, name: &str, imports: &[Import])
    -> Result<QualifiedName, ResolveError>;

    /// Resolves an identifier to a module.
    fn resolve_module(&self, name: &str, imports: &[Import]) -> Result<ModuleId, ResolveError>;

    fn is_package(&self, package: &PackageId) -> bool;

    /// The compile-time value of an external constant, when the loader has
    /// one.
    fn constant_value(&self, name: &QualifiedName) -> Option<Value>;
}

/// An expander for inputs whose types are already structural: it maps every
/// non-nominal type to itself and refuses alias references.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralExpander;

impl TypeExpander for StructuralExpander {
    fn expand(&self, ty: &Type) -> Result<Type, ResolveError> {
        match ty {
            Type::Nominal(name) => Err(ResolveError::new(name.to_string())),
            other => Ok(other.clone()),
        }
    }
}
