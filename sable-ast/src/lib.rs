#![forbid(unsafe_code)]

//! The attributed abstract syntax tree consumed by the semantic core.
//!
//! Parsing and name resolution happen upstream; by the time a
//! [`SourceFile`] reaches this pipeline its declared type positions carry a
//! [`ResolvedType`] (nominal type plus optional compiled constraint block),
//! constant accesses may carry their compile-time value, and calls may
//! carry the module their name resolved to. Type propagation fills each
//! expression's `types` slot in place and may rewrite nodes (unresolved
//! variables into local/constant/module/package accesses, abstract index
//! accesses into their string/list/dictionary forms, operators into their
//! retargeted collection forms).

use sable_ir::block::Block;
use sable_ir::types::{Type, TypePair};
use sable_ir::value::Value;
use sable_ir::{ModuleId, PackageId, QualifiedName, Span};

/// A declared type position: the nominal type as resolved at the use site
/// plus the compiled constraint block of that type, when it has one.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedType {
    pub span: Span,
    pub nominal: Type,
    /// Alias-expanded form, filled by type propagation.
    pub raw: Option<Type>,
    pub constraint: Option<Block>,
}

impl ResolvedType {
    pub fn plain(span: Span, nominal: Type) -> Self {
        ResolvedType {
            span,
            nominal,
            raw: None,
            constraint: None,
        }
    }

    /// The raw type when propagation has run, else the nominal type.
    pub fn expanded(&self) -> &Type {
        self.raw.as_ref().unwrap_or(&self.nominal)
    }
}

/// An import in scope for name resolution, passed through to the resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    pub span: Span,
    pub package: PackageId,
    pub module: String,
    /// `None` imports the whole module.
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceFile {
    pub filename: String,
    pub module: ModuleId,
    pub imports: Vec<Import>,
    pub declarations: Vec<Decl>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decl {
    Type(TypeDecl),
    Constant(ConstDecl),
    Function(FunctionDecl),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeDecl {
    pub span: Span,
    pub name: String,
    pub ty: ResolvedType,
    /// The `where` clause over the reserved `$` binding, if declared.
    pub where_clause: Option<Expr>,
    /// Alias-expanded form, filled by type propagation.
    pub raw: Option<Type>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstDecl {
    pub span: Span,
    pub name: String,
    pub value: Value,
    /// Compiled constraint over the constant, when its declared type has
    /// one.
    pub constraint: Option<Block>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub span: Span,
    pub name: String,
    /// A receiver type makes this a method.
    pub receiver: Option<ResolvedType>,
    pub parameters: Vec<Parameter>,
    pub ret: ResolvedType,
    pub precondition: Option<Expr>,
    pub postcondition: Option<Expr>,
    pub body: Vec<Stmt>,
}

impl FunctionDecl {
    pub fn is_method(&self) -> bool {
        self.receiver.is_some()
    }

    /// The declared (nominal) signature type.
    pub fn signature(&self) -> Type {
        let params = self.parameters.iter().map(|p| p.ty.nominal.clone()).collect();
        let ret = Box::new(self.ret.nominal.clone());
        match &self.receiver {
            Some(receiver) => Type::Method {
                receiver: Some(Box::new(receiver.nominal.clone())),
                params,
                ret,
            },
            None => Type::Function { params, ret },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub span: Span,
    pub name: String,
    pub ty: ResolvedType,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Assign(AssignStmt),
    Assert(AssertStmt),
    Return(ReturnStmt),
    Debug(DebugStmt),
    Skip(SkipStmt),
    Break(BreakStmt),
    Throw(ThrowStmt),
    IfElse(IfElseStmt),
    While(WhileStmt),
    DoWhile(DoWhileStmt),
    For(ForStmt),
    Switch(SwitchStmt),
    TryCatch(TryCatchStmt),
    Expr(ExprStmt),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Assign(s) => s.span,
            Stmt::Assert(s) => s.span,
            Stmt::Return(s) => s.span,
            Stmt::Debug(s) => s.span,
            Stmt::Skip(s) => s.span,
            Stmt::Break(s) => s.span,
            Stmt::Throw(s) => s.span,
            Stmt::IfElse(s) => s.span,
            Stmt::While(s) => s.span,
            Stmt::DoWhile(s) => s.span,
            Stmt::For(s) => s.span,
            Stmt::Switch(s) => s.span,
            Stmt::TryCatch(s) => s.span,
            Stmt::Expr(s) => s.span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignStmt {
    pub span: Span,
    pub lhs: Expr,
    pub rhs: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssertStmt {
    pub span: Span,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStmt {
    pub span: Span,
    pub expr: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DebugStmt {
    pub span: Span,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SkipStmt {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BreakStmt {
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThrowStmt {
    pub span: Span,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfElseStmt {
    pub span: Span,
    pub condition: Expr,
    pub true_branch: Vec<Stmt>,
    pub false_branch: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStmt {
    pub span: Span,
    pub condition: Expr,
    pub invariant: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DoWhileStmt {
    pub span: Span,
    pub condition: Expr,
    pub invariant: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForStmt {
    pub span: Span,
    /// More than one variable destructures a tuple element.
    pub variables: Vec<String>,
    pub source: Expr,
    pub invariant: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchStmt {
    pub span: Span,
    pub expr: Expr,
    pub cases: Vec<SwitchCase>,
}

/// A case with no values is the default clause.
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
    pub span: Span,
    pub values: Vec<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TryCatchStmt {
    pub span: Span,
    pub body: Vec<Stmt>,
    pub catches: Vec<CatchClause>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatchClause {
    pub span: Span,
    pub ty: ResolvedType,
    pub variable: String,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprStmt {
    pub span: Span,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    /// Filled by type propagation.
    pub types: Option<TypePair>,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(span: Span, kind: ExprKind) -> Expr {
        Expr {
            span,
            types: None,
            kind,
        }
    }

    pub fn typed(span: Span, types: TypePair, kind: ExprKind) -> Expr {
        Expr {
            span,
            types: Some(types),
            kind,
        }
    }

    pub fn nominal(&self) -> Option<&Type> {
        self.types.as_ref().map(|t| &t.nominal)
    }

    pub fn raw(&self) -> Option<&Type> {
        self.types.as_ref().map(|t| &t.raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Invert,
    Not,
    LengthOf,
    Spawn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Range,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,

    And,
    Or,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    Subset,
    SubsetEq,
    ElementOf,

    // Retargeted forms, installed by type propagation.
    Union,
    Intersection,
    Difference,
    ListAppend,
    StringAppend,
}

/// Which collection shape an index access resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    String,
    List,
    Dictionary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComprehensionKind {
    Some,
    None,
    List,
    Set,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Constant(Value),
    Null,
    /// An identifier not yet resolved to anything.
    Variable(String),
    Local(String),
    ConstantAccess {
        name: QualifiedName,
        value: Option<Value>,
    },
    ModuleAccess(ModuleId),
    PackageAccess(PackageId),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `e is T`
    TypeTest {
        operand: Box<Expr>,
        test: ResolvedType,
    },
    Index {
        /// Filled by type propagation.
        kind: Option<IndexKind>,
        src: Box<Expr>,
        index: Box<Expr>,
    },
    SubList {
        src: Box<Expr>,
        start: Box<Expr>,
        end: Box<Expr>,
    },
    FieldAccess {
        src: Box<Expr>,
        field: String,
    },
    Record {
        fields: Vec<(String, Expr)>,
    },
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Set(Vec<Expr>),
    Dictionary(Vec<(Expr, Expr)>),
    Comprehension {
        kind: ComprehensionKind,
        sources: Vec<(String, Expr)>,
        condition: Option<Box<Expr>>,
        value: Option<Box<Expr>>,
    },
    Convert {
        target: ResolvedType,
        operand: Box<Expr>,
    },
    /// `&name` — a reference to a module-level function.
    FunctionRef {
        name: String,
        module: Option<ModuleId>,
        signature: Option<Type>,
    },
    Invoke(Invoke),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Invoke {
    pub receiver: Option<Box<Expr>>,
    pub name: String,
    pub args: Vec<Expr>,
    /// For message sends: whether the sender awaits the result.
    pub synchronous: bool,
    /// Resolved-module attribute.
    pub module: Option<ModuleId>,
    /// Resolved callee signature, when name resolution found one.
    pub signature: Option<Type>,
}
