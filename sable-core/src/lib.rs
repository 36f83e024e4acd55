#![forbid(unsafe_code)]

//! The semantic core of the Sable compiler: flow-sensitive type
//! propagation over an attributed AST, followed by lowering into
//! contract-carrying block IR.

mod env;
mod error;
mod generate;
mod propagate;
mod resolve;

pub use env::Env;
pub use error::{CompileError, ErrorKind, Result};
pub use generate::{invert, Generator};
pub use propagate::Propagator;
pub use resolve::{NameResolver, ResolveError, StructuralExpander, TypeExpander};

use sable_ast::SourceFile;
use sable_ir::module::Module;

#[derive(Clone, Debug)]
pub struct CompileConfig {
    /// Iteration ceiling for loop-body re-propagation; exceeding it is an
    /// internal failure rather than a hang.
    pub loop_fixpoint_limit: u32,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            loop_fixpoint_limit: 10,
        }
    }
}

/// Runs the whole pipeline over one file: propagate types through the AST,
/// then lower it into its module record. First error aborts the file.
pub fn compile_file(
    file: SourceFile,
    expander: &dyn TypeExpander,
    resolver: &dyn NameResolver,
    config: &CompileConfig,
) -> Result<Module> {
    let mut propagator = Propagator::new(expander, resolver, config);
    let file = propagator.propagate_file(file)?;
    let mut generator = Generator::new();
    generator.generate_file(&file)
}
