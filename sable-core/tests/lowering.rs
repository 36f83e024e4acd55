//! End-to-end pipeline tests: propagate an attributed AST, lower it, and
//! run the emitted blocks through a small reference evaluator.

use std::collections::HashMap;

use sable_ast::{
    AssignStmt, BinaryOp, Expr, ExprKind, FunctionDecl, Import, Parameter, ResolvedType,
    ReturnStmt, SourceFile, Stmt,
};
use sable_core::{
    compile_file, invert, CompileConfig, ErrorKind, Generator, NameResolver, ResolveError,
    StructuralExpander,
};
use sable_ir::block::{ArithOp, Block, CompOp, Instr};
use sable_ir::types::{Type, TypePair};
use sable_ir::value::Value;
use sable_ir::{span, ModuleId, PackageId, QualifiedName, Span};

struct NoExternals;

impl NameResolver for NoExternals {
    fn resolve_name(
        &self,
        name: &str,
        _imports: &[Import],
    ) -> Result<QualifiedName, ResolveError> {
        Err(ResolveError::new(name))
    }

    fn resolve_module(&self, name: &str, _imports: &[Import]) -> Result<ModuleId, ResolveError> {
        Err(ResolveError::new(name))
    }

    fn is_package(&self, _package: &PackageId) -> bool {
        false
    }

    fn constant_value(&self, _name: &QualifiedName) -> Option<Value> {
        None
    }
}

fn sp() -> Span {
    span(0, 0)
}

fn expr(kind: ExprKind) -> Expr {
    Expr::new(sp(), kind)
}

fn var(name: &str) -> Expr {
    expr(ExprKind::Variable(name.to_string()))
}

fn local_bool(name: &str) -> Expr {
    Expr::typed(
        sp(),
        TypePair::plain(Type::Bool),
        ExprKind::Local(name.to_string()),
    )
}

fn int_lit(i: i64) -> Expr {
    expr(ExprKind::Constant(Value::int(i)))
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    expr(ExprKind::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

fn source_file(declarations: Vec<sable_ast::Decl>) -> SourceFile {
    SourceFile {
        filename: "main.sable".to_string(),
        module: ModuleId::new(PackageId::root("demo"), "main"),
        imports: Vec::new(),
        declarations,
    }
}

fn int_function(
    name: &str,
    params: &[&str],
    precondition: Option<Expr>,
    postcondition: Option<Expr>,
    body: Vec<Stmt>,
) -> FunctionDecl {
    FunctionDecl {
        span: sp(),
        name: name.to_string(),
        receiver: None,
        parameters: params
            .iter()
            .map(|p| Parameter {
                span: sp(),
                name: p.to_string(),
                ty: ResolvedType::plain(sp(), Type::Int),
            })
            .collect(),
        ret: ResolvedType::plain(sp(), Type::Int),
        precondition,
        postcondition,
        body,
    }
}

/// What running a block produced.
#[derive(Clone, Debug, PartialEq)]
enum Outcome {
    /// Fell off the end of the block.
    Fell,
    /// Jumped to a label not defined inside the block.
    Reached(String),
    Failed(String),
    Returned(Option<Value>),
}

/// A small reference evaluator for the straight-line instruction subset the
/// contract and condition blocks use.
fn run(block: &Block, slots: &mut Vec<Value>) -> Outcome {
    let entries = block.entries();
    let mut labels: HashMap<&str, usize> = HashMap::new();
    for (i, e) in entries.iter().enumerate() {
        if let Instr::Label(l) | Instr::TryEnd(l) = &e.instr {
            labels.insert(l, i);
        }
    }
    let mut stack: Vec<Value> = Vec::new();
    let mut pc = 0;
    while pc < entries.len() {
        match &entries[pc].instr {
            Instr::Const(v) => stack.push(v.clone()),
            Instr::Load(s) => stack.push(slots[*s].clone()),
            Instr::Store(s) => {
                let v = stack.pop().expect("store on empty stack");
                if *s >= slots.len() {
                    slots.resize(*s + 1, Value::int(0));
                }
                slots[*s] = v;
            }
            Instr::Goto(l) => match labels.get(l.as_str()) {
                Some(&i) => {
                    pc = i;
                    continue;
                }
                None => return Outcome::Reached(l.clone()),
            },
            Instr::IfGo { op, target } => {
                let rhs = stack.pop().expect("comparison needs two operands");
                let lhs = stack.pop().expect("comparison needs two operands");
                let holds = match op {
                    CompOp::Eq => lhs == rhs,
                    CompOp::Ne => lhs != rhs,
                    CompOp::Lt => lhs < rhs,
                    CompOp::Le => lhs <= rhs,
                    CompOp::Gt => lhs > rhs,
                    CompOp::Ge => lhs >= rhs,
                    other => panic!("evaluator does not model {other:?}"),
                };
                if holds {
                    match labels.get(target.as_str()) {
                        Some(&i) => {
                            pc = i;
                            continue;
                        }
                        None => return Outcome::Reached(target.clone()),
                    }
                }
            }
            Instr::BinOp(op) => {
                let rhs = stack.pop().expect("arithmetic needs two operands");
                let lhs = stack.pop().expect("arithmetic needs two operands");
                let result = match op {
                    ArithOp::Add => lhs.add(&rhs),
                    ArithOp::Sub => lhs.sub(&rhs),
                    ArithOp::Mul => lhs.mul(&rhs),
                    ArithOp::Div => lhs.div(&rhs),
                    ArithOp::Rem => lhs.remainder(&rhs),
                    other => panic!("evaluator does not model {other:?}"),
                };
                stack.push(result.expect("operand kinds matched by propagation"));
            }
            Instr::Fail(message) => return Outcome::Failed(message.clone()),
            Instr::Return(_) => return Outcome::Returned(stack.pop()),
            Instr::Label(_) | Instr::TryEnd(_) | Instr::Assert(_) | Instr::Skip => {}
            other => panic!("evaluator does not model {other:?}"),
        }
        pc += 1;
    }
    Outcome::Fell
}

#[test]
fn contracts_lower_to_pre_body_and_postcondition_blocks() {
    // int f(int x) where x >= 0 ensures $ > 0: return x + 1
    let fd = int_function(
        "f",
        &["x"],
        Some(binary(BinaryOp::Ge, var("x"), int_lit(0))),
        Some(binary(BinaryOp::Gt, var("$"), int_lit(0))),
        vec![Stmt::Return(ReturnStmt {
            span: sp(),
            expr: Some(binary(BinaryOp::Add, var("x"), int_lit(1))),
        })],
    );
    let module = compile_file(
        source_file(vec![sable_ast::Decl::Function(fd)]),
        &StructuralExpander,
        &NoExternals,
        &CompileConfig::default(),
    )
    .expect("compiles");

    let method = module.method("f").expect("f is defined");
    assert_eq!(method.cases.len(), 1);
    let case = &method.cases[0];

    let precondition = case.precondition.as_ref().expect("precondition block");
    assert_eq!(
        run(precondition, &mut vec![Value::int(-1)]),
        Outcome::Failed("precondition not satisfied".to_string())
    );
    assert_eq!(run(precondition, &mut vec![Value::int(3)]), Outcome::Fell);

    assert_eq!(
        run(&case.body, &mut vec![Value::int(3)]),
        Outcome::Returned(Some(Value::int(4)))
    );

    // Postcondition frame: the result at slot 0, parameters shifted up one.
    let postcondition = case.postcondition.as_ref().expect("postcondition block");
    assert_eq!(
        run(postcondition, &mut vec![Value::int(4), Value::int(3)]),
        Outcome::Fell
    );
    assert_eq!(
        run(postcondition, &mut vec![Value::int(0), Value::int(3)]),
        Outcome::Failed("postcondition not satisfied".to_string())
    );
}

#[test]
fn reassigned_parameters_are_shadowed_for_the_postcondition() {
    // int bump(int x) ensures $ > x: x = x + 1; return x
    let fd = int_function(
        "bump",
        &["x"],
        None,
        Some(binary(BinaryOp::Gt, var("$"), var("x"))),
        vec![
            Stmt::Assign(AssignStmt {
                span: sp(),
                lhs: var("x"),
                rhs: binary(BinaryOp::Add, var("x"), int_lit(1)),
            }),
            Stmt::Return(ReturnStmt {
                span: sp(),
                expr: Some(var("x")),
            }),
        ],
    );
    let module = compile_file(
        source_file(vec![sable_ast::Decl::Function(fd)]),
        &StructuralExpander,
        &NoExternals,
        &CompileConfig::default(),
    )
    .expect("compiles");

    let case = &module.method("bump").expect("bump is defined").cases[0];

    // The body snapshots the parameter before anything else runs.
    let head: Vec<_> = case.body.entries().iter().take(2).map(|e| &e.instr).collect();
    assert_eq!(head, vec![&Instr::Load(0), &Instr::Store(1)]);

    // The postcondition reads the shadow slot, not the live parameter:
    // frame is [result, live x, shadow x].
    let postcondition = case.postcondition.as_ref().expect("postcondition block");
    let entry = Value::int(5);
    let returned = Value::int(6);
    assert_eq!(
        run(
            postcondition,
            &mut vec![returned.clone(), returned, entry.clone()]
        ),
        Outcome::Fell,
        "$ > entry value must hold even though the live slot equals $"
    );
    assert_eq!(
        run(postcondition, &mut vec![entry.clone(), Value::int(9), entry]),
        Outcome::Failed("postcondition not satisfied".to_string())
    );
}

#[test]
fn condition_lowering_agrees_with_expression_inversion() {
    // For every boolean valuation, lowering `a && b` toward a target and
    // lowering `!(a && b)` must reach the target in complementary cases,
    // and `a || b` likewise.
    let cases = [
        binary(BinaryOp::And, local_bool("a"), local_bool("b")),
        binary(BinaryOp::Or, local_bool("a"), local_bool("b")),
        binary(
            BinaryOp::And,
            local_bool("a"),
            binary(BinaryOp::Or, local_bool("b"), local_bool("a")),
        ),
    ];
    let truth = [
        |a: bool, b: bool| a && b,
        |a: bool, b: bool| a || b,
        |a: bool, b: bool| a && (b || a),
    ];

    for (condition, expected) in cases.iter().zip(truth) {
        for a in [false, true] {
            for b in [false, true] {
                let mut generator = Generator::new();
                let mut env =
                    HashMap::from([("a".to_string(), 0), ("b".to_string(), 1)]);
                let straight = generator
                    .lower_condition("hit", condition, &mut env)
                    .expect("lowers");
                let negated = generator
                    .lower_condition("hit", &invert(condition), &mut env)
                    .expect("lowers");

                let mut slots = vec![Value::boolean(a), Value::boolean(b)];
                let straight_hit =
                    run(&straight, &mut slots) == Outcome::Reached("hit".to_string());
                let mut slots = vec![Value::boolean(a), Value::boolean(b)];
                let negated_hit =
                    run(&negated, &mut slots) == Outcome::Reached("hit".to_string());

                assert_eq!(straight_hit, expected(a, b), "{condition:?} at a={a} b={b}");
                assert_eq!(
                    negated_hit,
                    !expected(a, b),
                    "inverted {condition:?} at a={a} b={b}"
                );
            }
        }
    }
}

#[test]
fn parameter_type_constraints_inline_into_the_precondition() {
    // A `nat` parameter arrives with its compiled constraint block over the
    // reserved slot 0; the precondition rebinds it to the parameter's slot.
    let mut constraint = Block::new(1);
    constraint.push(Instr::Load(0), sp());
    constraint.push(Instr::Const(Value::int(0)), sp());
    constraint.push(
        Instr::IfGo {
            op: CompOp::Ge,
            target: "ok".to_string(),
        },
        sp(),
    );
    constraint.push(Instr::Fail("precondition not satisfied".to_string()), sp());
    constraint.push(Instr::Label("ok".to_string()), sp());

    let mut fd = int_function(
        "half",
        &["skip", "n"],
        None,
        None,
        vec![Stmt::Return(ReturnStmt {
            span: sp(),
            expr: Some(var("n")),
        })],
    );
    fd.parameters[1].ty.constraint = Some(constraint);

    let module = compile_file(
        source_file(vec![sable_ast::Decl::Function(fd)]),
        &StructuralExpander,
        &NoExternals,
        &CompileConfig::default(),
    )
    .expect("compiles");

    let case = &module.method("half").expect("half is defined").cases[0];
    let precondition = case.precondition.as_ref().expect("inlined constraint");

    // Slot 0 was rebound to the constrained parameter's slot 1.
    assert_eq!(
        run(precondition, &mut vec![Value::int(0), Value::int(7)]),
        Outcome::Fell
    );
    assert_eq!(
        run(precondition, &mut vec![Value::int(7), Value::int(-1)]),
        Outcome::Failed("precondition not satisfied".to_string())
    );
}

#[test]
fn type_and_constant_declarations_land_in_the_module_record() {
    let td = sable_ast::TypeDecl {
        span: sp(),
        name: "nat".to_string(),
        ty: ResolvedType::plain(sp(), Type::Int),
        where_clause: Some(binary(BinaryOp::Ge, var("$"), int_lit(0))),
        raw: None,
    };
    let cd = sable_ast::ConstDecl {
        span: sp(),
        name: "LIMIT".to_string(),
        value: Value::int(1024),
        constraint: None,
    };
    let module = compile_file(
        source_file(vec![sable_ast::Decl::Type(td), sable_ast::Decl::Constant(cd)]),
        &StructuralExpander,
        &NoExternals,
        &CompileConfig::default(),
    )
    .expect("compiles");

    assert_eq!(module.type_def("nat").map(|t| &t.ty), Some(&Type::Int));
    assert_eq!(
        module.constant("LIMIT").map(|c| &c.value),
        Some(&Value::int(1024))
    );
}

#[test]
fn same_signature_functions_coalesce_into_cases() {
    let make = |body_value: i64| {
        int_function(
            "pick",
            &["x"],
            None,
            None,
            vec![Stmt::Return(ReturnStmt {
                span: sp(),
                expr: Some(int_lit(body_value)),
            })],
        )
    };
    let module = compile_file(
        source_file(vec![
            sable_ast::Decl::Function(make(1)),
            sable_ast::Decl::Function(make(2)),
        ]),
        &StructuralExpander,
        &NoExternals,
        &CompileConfig::default(),
    )
    .expect("compiles");

    assert_eq!(module.methods.len(), 1);
    assert_eq!(module.method("pick").map(|m| m.cases.len()), Some(2));
}

#[test]
fn undefined_names_abort_the_file() {
    let fd = int_function(
        "broken",
        &[],
        None,
        None,
        vec![Stmt::Return(ReturnStmt {
            span: sp(),
            expr: Some(var("ghost")),
        })],
    );
    let err = compile_file(
        source_file(vec![sable_ast::Decl::Function(fd)]),
        &StructuralExpander,
        &NoExternals,
        &CompileConfig::default(),
    )
    .expect_err("unknown variable");
    assert!(matches!(err.kind(), Some(ErrorKind::UnknownVariable)));
}
