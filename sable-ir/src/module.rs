#![forbid(unsafe_code)]

//! The compiled module record: the external interface of the pipeline.

use crate::block::Block;
use crate::types::Type;
use crate::value::Value;
use crate::ModuleId;

/// One compiled source file.
#[derive(Clone, Debug)]
pub struct Module {
    pub id: ModuleId,
    pub filename: String,
    /// Function and method definitions, in declaration order. Two
    /// declarations sharing a name and erased signature coalesce into one
    /// definition with multiple cases.
    pub methods: Vec<Method>,
    pub types: Vec<TypeDef>,
    pub constants: Vec<ConstDef>,
}

impl Module {
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn constant(&self, name: &str) -> Option<&ConstDef> {
        self.constants.iter().find(|c| c.name == name)
    }
}

#[derive(Clone, Debug)]
pub struct Method {
    pub name: String,
    /// Declared function or method type.
    pub ty: Type,
    pub cases: Vec<Case>,
}

#[derive(Clone, Debug)]
pub struct Case {
    pub body: Block,
    pub precondition: Option<Block>,
    pub postcondition: Option<Block>,
    /// Slot index to variable name; anonymous temporaries are `None`.
    pub locals: Vec<Option<String>>,
}

#[derive(Clone, Debug)]
pub struct TypeDef {
    pub name: String,
    pub ty: Type,
    pub constraint: Option<Block>,
}

#[derive(Clone, Debug)]
pub struct ConstDef {
    pub name: String,
    pub value: Value,
    pub constraint: Option<Block>,
}
