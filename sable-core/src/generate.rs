#![forbid(unsafe_code)]

//! Lowering of propagated declarations into block IR.
//!
//! Conditions are lowered as control flow: `lower_condition(target, e)`
//! emits code that jumps to `target` exactly when `e` holds and falls
//! through otherwise, never materializing a boolean. Negated branches are
//! derived by rewriting the expression to its De Morgan dual rather than
//! re-deriving control flow. Contracts are woven around each function: a
//! parameter's inlined type constraint joins the explicit precondition, and
//! the return type's constraint joins the explicit postcondition, with
//! entry values of body-assigned parameters snapshotted into shadow slots.

use std::collections::{HashMap, HashSet};

use sable_ast::{
    AssignStmt, BinaryOp, ComprehensionKind, Decl, Expr, ExprKind, ForStmt, FunctionDecl,
    IfElseStmt, Invoke, SourceFile, Stmt, SwitchStmt, TryCatchStmt, UnaryOp,
};
use sable_ir::block::{ArithOp, Block, CompOp, Instr, LabelAllocator, OpDir};
use sable_ir::module::{Case, ConstDef, Method, Module, TypeDef};
use sable_ir::types::{Type, TypePair};
use sable_ir::value::{Value, ValueData};
use sable_ir::{QualifiedName, Span};

use crate::error::{CompileError, ErrorKind, Result};

struct LoopScope {
    label: String,
}

pub struct Generator {
    filename: String,
    labels: LabelAllocator,
    scopes: Vec<LoopScope>,
    /// Declared return type of the function being lowered.
    ret: Option<Type>,
}

impl Generator {
    pub fn new() -> Generator {
        Generator {
            filename: String::new(),
            labels: LabelAllocator::new(),
            scopes: Vec::new(),
            ret: None,
        }
    }

    /// Lowers a propagated file into its module record. The first error
    /// aborts the file; a function that fails contributes nothing.
    pub fn generate_file(&mut self, file: &SourceFile) -> Result<Module> {
        self.filename = file.filename.clone();

        let mut methods: Vec<Method> = Vec::new();
        let mut method_index: HashMap<(String, Type), usize> = HashMap::new();
        let mut types = Vec::new();
        let mut constants = Vec::new();

        for decl in &file.declarations {
            match decl {
                Decl::Type(td) => types.push(TypeDef {
                    name: td.name.clone(),
                    ty: td.raw.clone().unwrap_or_else(|| td.ty.nominal.clone()),
                    constraint: td.ty.constraint.clone(),
                }),
                Decl::Constant(cd) => constants.push(ConstDef {
                    name: cd.name.clone(),
                    value: cd.value.clone(),
                    constraint: cd.constraint.clone(),
                }),
                Decl::Function(fd) => {
                    let method = self.generate_function(fd)?;
                    let key = (method.name.clone(), method.ty.clone());
                    match method_index.get(&key).copied() {
                        // Same name and erased signature: coalesce cases.
                        Some(i) => methods[i].cases.extend(method.cases),
                        None => {
                            method_index.insert(key, methods.len());
                            methods.push(method);
                        }
                    }
                }
            }
        }

        Ok(Module {
            id: file.module.clone(),
            filename: file.filename.clone(),
            methods,
            types,
            constants,
        })
    }

    fn generate_function(&mut self, fd: &FunctionDecl) -> Result<Method> {
        let mut environment: HashMap<String, usize> = HashMap::new();
        let mut param_index = 0;
        let mut nparams = fd.parameters.len();
        if fd.is_method() {
            environment.insert("this".to_string(), param_index);
            param_index += 1;
            nparams += 1;
        }

        // Precondition: each parameter's own type constraint, rebinding the
        // constraint's reserved slot 0 to the parameter's actual slot.
        let mut precondition: Option<Block> = None;
        for p in &fd.parameters {
            if let Some(constraint) = &p.ty.constraint {
                let blk = precondition.get_or_insert_with(|| Block::new(nparams));
                blk.import_external(
                    constraint,
                    &HashMap::from([(0, param_index)]),
                    &mut self.labels,
                );
            }
            environment.insert(p.name.clone(), param_index);
            param_index += 1;
        }

        if let Some(pre) = &fd.precondition {
            let blk = precondition.get_or_insert_with(|| Block::new(nparams));
            let lab = self.labels.fresh();
            let mut pre_env = environment.clone();
            let cond = self.lower_condition(&lab, pre, &mut pre_env)?;
            blk.append(cond);
            blk.push(Instr::Fail("precondition not satisfied".to_string()), pre.span);
            blk.push(Instr::Label(lab), pre.span);
        }

        // Parameters the postcondition reads but the body may reassign keep
        // their entry values in shadow slots.
        let mut shadows: HashMap<String, usize> = HashMap::new();
        if let Some(post) = &fd.postcondition {
            let assigned = assigned_variables(&fd.body);
            let read = free_variables(post);
            for p in &fd.parameters {
                if assigned.contains(&p.name) && read.contains(&p.name) {
                    let slot = allocate_temp(&mut environment);
                    shadows.insert(p.name.clone(), slot);
                }
            }
        }

        // Postcondition environment: the result binds the reserved `$` at
        // slot 0 and everything else shifts up one slot.
        let mut post_env: HashMap<String, usize> = HashMap::new();
        post_env.insert("$".to_string(), 0);
        for (var, slot) in &environment {
            post_env.insert(var.clone(), slot + 1);
        }
        for (var, slot) in &shadows {
            post_env.insert(var.clone(), slot + 1);
        }

        let mut postcondition: Option<Block> = None;
        if let Some(constraint) = &fd.ret.constraint {
            let blk = postcondition.get_or_insert_with(|| Block::new(post_env.len()));
            blk.import_external(constraint, &HashMap::from([(0, 0)]), &mut self.labels);
        }
        if let Some(post) = &fd.postcondition {
            let blk = postcondition.get_or_insert_with(|| Block::new(post_env.len()));
            let lab = self.labels.fresh();
            let cond = self.lower_condition(&lab, post, &mut post_env)?;
            blk.append(cond);
            blk.push(
                Instr::Fail("postcondition not satisfied".to_string()),
                post.span,
            );
            blk.push(Instr::Label(lab), post.span);
        }

        self.ret = Some(fd.ret.expanded().clone());

        let mut body = Block::new(environment.len());
        for p in &fd.parameters {
            if let Some(shadow) = shadows.get(&p.name) {
                body.push(Instr::Load(environment[&p.name]), p.span);
                body.push(Instr::Store(*shadow), p.span);
            }
        }
        for stmt in &fd.body {
            let blk = self.generate_stmt(stmt, &mut environment)?;
            body.append(blk);
        }
        // Guarantees every body ends in a return; for value-returning
        // functions this is either unreachable or a missing-return fault.
        body.push(Instr::Return(Type::Void), fd.span);

        self.ret = None;

        let mut locals: Vec<Option<String>> = vec![None; environment.len()];
        for (name, slot) in &environment {
            if !name.starts_with('$') {
                locals[*slot] = Some(name.clone());
            }
        }

        Ok(Method {
            name: fd.name.clone(),
            ty: fd.signature(),
            cases: vec![Case {
                body,
                precondition,
                postcondition,
                locals,
            }],
        })
    }

    fn generate_stmts(
        &mut self,
        stmts: &[Stmt],
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        let mut blk = Block::new(env.len());
        for stmt in stmts {
            let s = self.generate_stmt(stmt, env)?;
            blk.append(s);
        }
        Ok(blk)
    }

    fn generate_stmt(&mut self, stmt: &Stmt, env: &mut HashMap<String, usize>) -> Result<Block> {
        match stmt {
            Stmt::Assign(s) => self.generate_assign(s, env),
            Stmt::Assert(s) => {
                let lab = self.labels.fresh();
                let mut blk = Block::new(env.len());
                blk.push(Instr::Assert(lab.clone()), s.span);
                blk.append(self.lower_condition(&lab, &s.expr, env)?);
                blk.push(Instr::Fail("assertion failed".to_string()), s.span);
                blk.push(Instr::Label(lab), s.span);
                Ok(blk)
            }
            Stmt::Return(s) => match &s.expr {
                Some(e) => {
                    let mut blk = self.generate_expr(e, env)?;
                    let ret = self.ret.clone().unwrap_or(Type::Void);
                    blk.push(Instr::Return(ret), s.span);
                    Ok(blk)
                }
                None => {
                    let mut blk = Block::new(env.len());
                    blk.push(Instr::Return(Type::Void), s.span);
                    Ok(blk)
                }
            },
            Stmt::Debug(s) => {
                let mut blk = self.generate_expr(&s.expr, env)?;
                blk.push(Instr::Debug, s.span);
                Ok(blk)
            }
            Stmt::Skip(s) => {
                let mut blk = Block::new(env.len());
                blk.push(Instr::Skip, s.span);
                Ok(blk)
            }
            Stmt::Break(s) => {
                // Innermost enclosing loop scope.
                let label = match self.scopes.last() {
                    Some(scope) => scope.label.clone(),
                    None => return Err(self.err(ErrorKind::BreakOutsideLoop, s.span)),
                };
                let mut blk = Block::new(env.len());
                blk.push(Instr::Goto(label), s.span);
                Ok(blk)
            }
            Stmt::Throw(s) => {
                let mut blk = self.generate_expr(&s.expr, env)?;
                blk.push(Instr::Throw, s.span);
                Ok(blk)
            }
            Stmt::IfElse(s) => self.generate_if_else(s, env),
            Stmt::While(s) => {
                let label = self.labels.fresh();
                let mut blk = Block::new(env.len());
                if let Some(inv) = &s.invariant {
                    self.check_invariant(&mut blk, inv, "loop invariant not satisfied on entry", env)?;
                }
                blk.push(Instr::Loop(label.clone()), s.span);
                blk.append(self.lower_condition(&label, &invert(&s.condition), env)?);
                self.scopes.push(LoopScope { label: label.clone() });
                let body = self.generate_stmts(&s.body, env);
                self.scopes.pop();
                blk.append(body?);
                if let Some(inv) = &s.invariant {
                    self.check_invariant(&mut blk, inv, "loop invariant not restored", env)?;
                }
                blk.push(Instr::End(label), s.span);
                Ok(blk)
            }
            Stmt::DoWhile(s) => {
                let label = self.labels.fresh();
                let mut blk = Block::new(env.len());
                if let Some(inv) = &s.invariant {
                    self.check_invariant(&mut blk, inv, "loop invariant not satisfied on entry", env)?;
                }
                blk.push(Instr::Loop(label.clone()), s.span);
                self.scopes.push(LoopScope { label: label.clone() });
                let body = self.generate_stmts(&s.body, env);
                self.scopes.pop();
                blk.append(body?);
                if let Some(inv) = &s.invariant {
                    self.check_invariant(&mut blk, inv, "loop invariant not restored", env)?;
                }
                blk.append(self.lower_condition(&label, &invert(&s.condition), env)?);
                blk.push(Instr::End(label), s.span);
                Ok(blk)
            }
            Stmt::For(s) => self.generate_for(s, env),
            Stmt::Switch(s) => self.generate_switch(s, env),
            Stmt::TryCatch(s) => self.generate_try_catch(s, env),
            Stmt::Expr(s) => match &s.expr.kind {
                ExprKind::Invoke(invoke) => self.generate_invoke(invoke, false, s.expr.span, env),
                ExprKind::Unary {
                    op: UnaryOp::Spawn, ..
                } => self.generate_expr(&s.expr, env),
                _ => Err(self.internal("unsupported expression statement", s.span)),
            },
        }
    }

    fn generate_assign(
        &mut self,
        s: &AssignStmt,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        match &s.lhs.kind {
            ExprKind::Local(name) => {
                let mut blk = self.generate_expr(&s.rhs, env)?;
                blk.push(Instr::Store(allocate(name, env)), s.span);
                Ok(blk)
            }
            ExprKind::Tuple(elements) => {
                let mut blk = self.generate_expr(&s.rhs, env)?;
                blk.push(Instr::Destructure, s.span);
                // Destructure pushes left-to-right, so stores pop in
                // reverse declaration order.
                for element in elements.iter().rev() {
                    let ExprKind::Local(name) = &element.kind else {
                        return Err(self.err(ErrorKind::InvalidTupleLVal, element.span));
                    };
                    blk.push(Instr::Store(allocate(name, env)), s.span);
                }
                Ok(blk)
            }
            ExprKind::Index { .. } | ExprKind::FieldAccess { .. } => {
                let mut fields = Vec::new();
                let mut blk = Block::new(env.len());
                let (base, depth) = self.extract_lval(&s.lhs, &mut fields, &mut blk, env)?;
                let slot = match env.get(&base) {
                    Some(slot) => *slot,
                    None => return Err(self.err(ErrorKind::UnknownVariable, s.lhs.span)),
                };
                blk.append(self.generate_expr(&s.rhs, env)?);
                blk.push(Instr::Update { slot, depth, fields }, s.span);
                Ok(blk)
            }
            _ => Err(self.err(ErrorKind::InvalidLVal, s.lhs.span)),
        }
    }

    /// Recurses a nested index/field chain down to its base local,
    /// collecting field names and the access depth while emitting index
    /// subexpressions in syntactic order. The caller then issues a single
    /// multi-level update, preserving atomicity of the conceptual store.
    fn extract_lval(
        &mut self,
        e: &Expr,
        fields: &mut Vec<String>,
        blk: &mut Block,
        env: &mut HashMap<String, usize>,
    ) -> Result<(String, usize)> {
        match &e.kind {
            ExprKind::Local(name) => Ok((name.clone(), 0)),
            ExprKind::Index { src, index, .. } => {
                let (base, depth) = self.extract_lval(src, fields, blk, env)?;
                blk.append(self.generate_expr(index, env)?);
                Ok((base, depth + 1))
            }
            ExprKind::FieldAccess { src, field } => {
                let (base, depth) = self.extract_lval(src, fields, blk, env)?;
                fields.push(field.clone());
                Ok((base, depth + 1))
            }
            _ => Err(self.err(ErrorKind::InvalidLVal, e.span)),
        }
    }

    fn generate_if_else(
        &mut self,
        s: &IfElseStmt,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        let false_lab = self.labels.fresh();
        let exit_lab = if s.false_branch.is_empty() {
            false_lab.clone()
        } else {
            self.labels.fresh()
        };

        let mut blk = self.lower_condition(&false_lab, &invert(&s.condition), env)?;
        blk.append(self.generate_stmts(&s.true_branch, env)?);
        if !s.false_branch.is_empty() {
            blk.push(Instr::Goto(exit_lab.clone()), s.span);
            blk.push(Instr::Label(false_lab), s.span);
            blk.append(self.generate_stmts(&s.false_branch, env)?);
        }
        blk.push(Instr::Label(exit_lab), s.span);
        Ok(blk)
    }

    fn generate_for(&mut self, s: &ForStmt, env: &mut HashMap<String, usize>) -> Result<Block> {
        let label = self.labels.fresh();
        let mut blk = Block::new(env.len());

        if let Some(inv) = &s.invariant {
            self.check_invariant(&mut blk, inv, "loop invariant not satisfied on entry", env)?;
        }

        blk.append(self.generate_expr(&s.source, env)?);
        if s.variables.len() > 1 {
            // Destructuring: iterate through a hidden composite slot and
            // unpack it in reverse declaration order.
            let composite = allocate_temp(env);
            blk.push(
                Instr::ForAll {
                    slot: composite,
                    end: label.clone(),
                },
                s.span,
            );
            blk.push(Instr::Load(composite), s.span);
            blk.push(Instr::Destructure, s.span);
            for var in s.variables.iter().rev() {
                blk.push(Instr::Store(allocate(var, env)), s.span);
            }
        } else {
            let var = match s.variables.first() {
                Some(var) => var,
                None => return Err(self.internal("for loop binds no variables", s.span)),
            };
            let slot = allocate(var, env);
            blk.push(
                Instr::ForAll {
                    slot,
                    end: label.clone(),
                },
                s.span,
            );
        }

        self.scopes.push(LoopScope { label: label.clone() });
        let body = self.generate_stmts(&s.body, env);
        self.scopes.pop();
        blk.append(body?);

        if let Some(inv) = &s.invariant {
            self.check_invariant(&mut blk, inv, "loop invariant not restored", env)?;
        }
        blk.push(Instr::End(label), s.span);
        Ok(blk)
    }

    fn generate_switch(
        &mut self,
        s: &SwitchStmt,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        let exit = self.labels.fresh();
        let mut blk = self.generate_expr(&s.expr, env)?;
        let mut cblk = Block::new(env.len());
        let mut default_target = exit.clone();
        let mut seen: HashSet<Value> = HashSet::new();
        let mut cases: Vec<(Value, String)> = Vec::new();

        for c in &s.cases {
            if c.values.is_empty() {
                if default_target != exit {
                    return Err(self.err(ErrorKind::DuplicateDefaultLabel, c.span));
                }
                default_target = self.labels.fresh();
                cblk.push(Instr::Label(default_target.clone()), c.span);
                cblk.append(self.generate_stmts(&c.body, env)?);
                cblk.push(Instr::Goto(exit.clone()), c.span);
            } else if default_target == exit {
                let target = self.labels.fresh();
                cblk.push(Instr::Label(target.clone()), c.span);
                for v in &c.values {
                    let constant = match constant_of(v) {
                        Some(constant) => constant,
                        None => return Err(self.err(ErrorKind::InvalidCaseLabel, v.span)),
                    };
                    if !seen.insert(constant.clone()) {
                        return Err(self.err(ErrorKind::DuplicateCaseLabel, v.span));
                    }
                    cases.push((constant, target.clone()));
                }
                cblk.append(self.generate_stmts(&c.body, env)?);
                cblk.push(Instr::Goto(exit.clone()), c.span);
            } else {
                // Cases after the default clause can never be reached.
                return Err(self.err(ErrorKind::UnreachableCase, c.span));
            }
        }

        blk.push(
            Instr::Switch {
                default: default_target,
                cases,
            },
            s.span,
        );
        blk.append(cblk);
        blk.push(Instr::Label(exit), s.span);
        Ok(blk)
    }

    fn generate_try_catch(
        &mut self,
        s: &TryCatchStmt,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        let exit = self.labels.fresh();
        let mut cblk = self.generate_stmts(&s.body, env)?;
        // Normal path jumps past the handlers.
        cblk.push(Instr::Goto(exit.clone()), s.span);

        let mut catches: Vec<(Type, String)> = Vec::new();
        let mut first = true;
        for c in &s.catches {
            let slot = allocate(&c.variable, env);
            let label = self.labels.fresh();
            let marker = if first {
                Instr::TryEnd(label.clone())
            } else {
                Instr::Label(label.clone())
            };
            first = false;
            catches.push((c.ty.expanded().clone(), label));
            cblk.push(marker, c.span);
            cblk.push(Instr::Store(slot), c.span);
            cblk.append(self.generate_stmts(&c.body, env)?);
            cblk.push(Instr::Goto(exit.clone()), c.span);
        }

        let mut blk = Block::new(env.len());
        blk.push(Instr::TryCatch { catches }, s.span);
        blk.append(cblk);
        blk.push(Instr::Label(exit), s.span);
        Ok(blk)
    }

    fn check_invariant(
        &mut self,
        blk: &mut Block,
        invariant: &Expr,
        message: &str,
        env: &mut HashMap<String, usize>,
    ) -> Result<()> {
        let lab = self.labels.fresh();
        blk.push(Instr::Assert(lab.clone()), invariant.span);
        blk.append(self.lower_condition(&lab, invariant, env)?);
        blk.push(Instr::Fail(message.to_string()), invariant.span);
        blk.push(Instr::Label(lab), invariant.span);
        Ok(())
    }

    /// Emits code that jumps to `target` iff `condition` evaluates true,
    /// falling through otherwise.
    pub fn lower_condition(
        &mut self,
        target: &str,
        condition: &Expr,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        match &condition.kind {
            ExprKind::Constant(v) => match v.data() {
                ValueData::Bool(true) => {
                    let mut blk = Block::new(env.len());
                    blk.push(Instr::Goto(target.to_string()), condition.span);
                    Ok(blk)
                }
                ValueData::Bool(false) => Ok(Block::new(env.len())),
                _ => Err(self.err(ErrorKind::InvalidBooleanExpression, condition.span)),
            },
            ExprKind::Local(name) => {
                let slot = match env.get(name) {
                    Some(slot) => *slot,
                    None => return Err(self.err(ErrorKind::UnknownVariable, condition.span)),
                };
                let mut blk = Block::new(env.len());
                blk.push(Instr::Load(slot), condition.span);
                blk.push(Instr::Const(Value::boolean(true)), condition.span);
                blk.push(
                    Instr::IfGo {
                        op: CompOp::Eq,
                        target: target.to_string(),
                    },
                    condition.span,
                );
                Ok(blk)
            }
            ExprKind::ConstantAccess { value, .. } => {
                let value = match value {
                    Some(v) => v.clone(),
                    None => {
                        return Err(
                            self.internal("constant access without a value", condition.span)
                        );
                    }
                };
                let mut blk = Block::new(env.len());
                blk.push(Instr::Const(value), condition.span);
                blk.push(Instr::Const(Value::boolean(true)), condition.span);
                blk.push(
                    Instr::IfGo {
                        op: CompOp::Eq,
                        target: target.to_string(),
                    },
                    condition.span,
                );
                Ok(blk)
            }
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => {
                let label = self.labels.fresh();
                let mut blk = self.lower_condition(&label, operand, env)?;
                blk.push(Instr::Goto(target.to_string()), condition.span);
                blk.push(Instr::Label(label), condition.span);
                Ok(blk)
            }
            ExprKind::TypeTest { operand, test } => {
                let test_ty = test.expanded().clone();
                match &operand.kind {
                    ExprKind::Local(name) => {
                        let slot = match env.get(name) {
                            Some(slot) => *slot,
                            None => {
                                return Err(self.err(ErrorKind::UnknownVariable, operand.span));
                            }
                        };
                        let mut blk = Block::new(env.len());
                        blk.push(
                            Instr::IfType {
                                slot: Some(slot),
                                test: test_ty,
                                target: target.to_string(),
                            },
                            condition.span,
                        );
                        Ok(blk)
                    }
                    _ => {
                        let mut blk = self.generate_expr(operand, env)?;
                        blk.push(
                            Instr::IfType {
                                slot: None,
                                test: test_ty,
                                target: target.to_string(),
                            },
                            condition.span,
                        );
                        Ok(blk)
                    }
                }
            }
            ExprKind::Binary { op, left, right } => {
                self.lower_binary_condition(target, condition, *op, left, right, env)
            }
            ExprKind::Comprehension {
                kind,
                sources,
                condition: inner,
                ..
            } => self.lower_comprehension_condition(
                target,
                *kind,
                sources,
                inner.as_deref(),
                condition.span,
                env,
            ),
            ExprKind::Index { .. } | ExprKind::FieldAccess { .. } | ExprKind::Invoke(_) => {
                let mut blk = self.generate_expr(condition, env)?;
                blk.push(Instr::Const(Value::boolean(true)), condition.span);
                blk.push(
                    Instr::IfGo {
                        op: CompOp::Eq,
                        target: target.to_string(),
                    },
                    condition.span,
                );
                Ok(blk)
            }
            _ => Err(self.err(ErrorKind::InvalidBooleanExpression, condition.span)),
        }
    }

    fn lower_binary_condition(
        &mut self,
        target: &str,
        condition: &Expr,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        if op == BinaryOp::Or {
            let mut blk = self.lower_condition(target, left, env)?;
            blk.append(self.lower_condition(target, right, env)?);
            return Ok(blk);
        }
        if op == BinaryOp::And {
            let exit = self.labels.fresh();
            let mut blk = self.lower_condition(&exit, &invert(left), env)?;
            blk.append(self.lower_condition(target, right, env)?);
            blk.push(Instr::Label(exit), condition.span);
            return Ok(blk);
        }

        let cop = match comparison_op(op) {
            Some(cop) => cop,
            None => return Err(self.err(ErrorKind::InvalidBooleanExpression, condition.span)),
        };

        // Null comparisons against a plain local rewrite to a runtime type
        // test, which downstream analyses can narrow on.
        if let (ExprKind::Local(name), ExprKind::Null) = (&left.kind, &right.kind) {
            let slot = match env.get(name) {
                Some(slot) => *slot,
                None => return Err(self.err(ErrorKind::UnknownVariable, left.span)),
            };
            let mut blk = Block::new(env.len());
            match cop {
                CompOp::Eq => {
                    blk.push(
                        Instr::IfType {
                            slot: Some(slot),
                            test: Type::Null,
                            target: target.to_string(),
                        },
                        condition.span,
                    );
                    return Ok(blk);
                }
                CompOp::Ne => {
                    let exit = self.labels.fresh();
                    blk.push(
                        Instr::IfType {
                            slot: Some(slot),
                            test: Type::Null,
                            target: exit.clone(),
                        },
                        condition.span,
                    );
                    blk.push(Instr::Goto(target.to_string()), condition.span);
                    blk.push(Instr::Label(exit), condition.span);
                    return Ok(blk);
                }
                _ => {}
            }
        }

        let mut blk = self.generate_expr(left, env)?;
        blk.append(self.generate_expr(right, env)?);
        blk.push(
            Instr::IfGo {
                op: cop,
                target: target.to_string(),
            },
            condition.span,
        );
        Ok(blk)
    }

    fn lower_comprehension_condition(
        &mut self,
        target: &str,
        kind: ComprehensionKind,
        sources: &[(String, Expr)],
        condition: Option<&Expr>,
        span: Span,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        if kind != ComprehensionKind::Some && kind != ComprehensionKind::None {
            return Err(self.err(ErrorKind::InvalidBooleanExpression, span));
        }
        let condition = match condition {
            Some(c) => c,
            None => return Err(self.internal("quantifier without a condition", span)),
        };

        let mut blk = Block::new(env.len());
        let slots = self.bind_comprehension_sources(&mut blk, sources, env)?;

        // Iteration markers open outer-to-inner...
        let mut end_labels = Vec::with_capacity(slots.len());
        for (var_slot, src_slot) in &slots {
            let label = self.labels.fresh();
            blk.push(Instr::Load(*src_slot), span);
            blk.push(
                Instr::ForAll {
                    slot: *var_slot,
                    end: label.clone(),
                },
                span,
            );
            end_labels.push(label);
        }

        if kind == ComprehensionKind::None {
            // Early exit on the first satisfying element; completing the
            // iteration is success.
            let exit = self.labels.fresh();
            blk.append(self.lower_condition(&exit, condition, env)?);
            // ...and must close inner-to-outer.
            for label in end_labels.iter().rev() {
                blk.push(Instr::End(label.clone()), span);
            }
            blk.push(Instr::Goto(target.to_string()), span);
            blk.push(Instr::Label(exit), span);
        } else {
            blk.append(self.lower_condition(target, condition, env)?);
            for label in end_labels.iter().rev() {
                blk.push(Instr::End(label.clone()), span);
            }
        }
        Ok(blk)
    }

    /// Allocates (element, source) slot pairs for comprehension
    /// generators. A source that is already a bare local reuses its slot;
    /// anything else is evaluated into a fresh one.
    fn bind_comprehension_sources(
        &mut self,
        blk: &mut Block,
        sources: &[(String, Expr)],
        env: &mut HashMap<String, usize>,
    ) -> Result<Vec<(usize, usize)>> {
        let mut slots = Vec::with_capacity(sources.len());
        for (var, src) in sources {
            let var_slot = allocate(var, env);
            let src_slot = match &src.kind {
                ExprKind::Local(name) if env.contains_key(name) => env[name],
                _ => {
                    blk.append(self.generate_expr(src, env)?);
                    let slot = allocate_temp(env);
                    blk.push(Instr::Store(slot), src.span);
                    slot
                }
            };
            slots.push((var_slot, src_slot));
        }
        Ok(slots)
    }

    /// Lowers an expression so its value ends up on the operand stack.
    pub fn generate_expr(&mut self, e: &Expr, env: &mut HashMap<String, usize>) -> Result<Block> {
        match &e.kind {
            ExprKind::Constant(v) => {
                let mut blk = Block::new(env.len());
                blk.push(Instr::Const(v.clone()), e.span);
                Ok(blk)
            }
            ExprKind::Null => {
                let mut blk = Block::new(env.len());
                blk.push(Instr::ConstNull, e.span);
                Ok(blk)
            }
            ExprKind::Local(name) => match env.get(name) {
                Some(slot) => {
                    let mut blk = Block::new(env.len());
                    blk.push(Instr::Load(*slot), e.span);
                    Ok(blk)
                }
                None => Err(self.err(ErrorKind::UnknownVariable, e.span)),
            },
            ExprKind::ConstantAccess { value, .. } => match value {
                Some(v) => {
                    let mut blk = Block::new(env.len());
                    blk.push(Instr::Const(v.clone()), e.span);
                    Ok(blk)
                }
                None => Err(self.internal("constant access without a value", e.span)),
            },
            ExprKind::Unary { op, operand } => self.generate_unary(*op, operand, e.span, env),
            ExprKind::Binary { op, left, right } => {
                self.generate_binary(e, *op, left, right, env)
            }
            ExprKind::TypeTest { .. } => self.materialize_condition(e, env),
            ExprKind::Index { src, index, .. } => {
                let mut blk = self.generate_expr(src, env)?;
                blk.append(self.generate_expr(index, env)?);
                blk.push(Instr::IndexLoad, e.span);
                Ok(blk)
            }
            ExprKind::SubList { src, start, end } => {
                let mut blk = self.generate_expr(src, env)?;
                blk.append(self.generate_expr(start, env)?);
                blk.append(self.generate_expr(end, env)?);
                blk.push(Instr::SubList, e.span);
                Ok(blk)
            }
            ExprKind::FieldAccess { src, field } => {
                let mut blk = self.generate_expr(src, env)?;
                blk.push(Instr::FieldLoad(field.clone()), e.span);
                Ok(blk)
            }
            ExprKind::Record { fields } => {
                // Field values are emitted in sorted key order, matching
                // the record layout.
                let mut sorted: Vec<&(String, Expr)> = fields.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                let mut blk = Block::new(env.len());
                let mut keys = Vec::with_capacity(sorted.len());
                for (name, value) in sorted {
                    keys.push(name.clone());
                    blk.append(self.generate_expr(value, env)?);
                }
                blk.push(Instr::NewRecord(keys), e.span);
                Ok(blk)
            }
            ExprKind::Tuple(elements) => {
                let mut blk = Block::new(env.len());
                for element in elements {
                    blk.append(self.generate_expr(element, env)?);
                }
                blk.push(Instr::NewTuple(elements.len()), e.span);
                Ok(blk)
            }
            ExprKind::List(elements) => {
                let mut blk = Block::new(env.len());
                for element in elements {
                    blk.append(self.generate_expr(element, env)?);
                }
                blk.push(Instr::NewList(elements.len()), e.span);
                Ok(blk)
            }
            ExprKind::Set(elements) => {
                let mut blk = Block::new(env.len());
                for element in elements {
                    blk.append(self.generate_expr(element, env)?);
                }
                blk.push(Instr::NewSet(elements.len()), e.span);
                Ok(blk)
            }
            ExprKind::Dictionary(pairs) => {
                let mut blk = Block::new(env.len());
                for (k, v) in pairs {
                    blk.append(self.generate_expr(k, env)?);
                    blk.append(self.generate_expr(v, env)?);
                }
                blk.push(Instr::NewDict(pairs.len()), e.span);
                Ok(blk)
            }
            ExprKind::Comprehension {
                kind,
                sources,
                condition,
                value,
            } => self.generate_comprehension(*kind, sources, condition.as_deref(), value.as_deref(), e.span, env),
            ExprKind::Convert { target, operand } => {
                let mut blk = self.generate_expr(operand, env)?;
                blk.push(Instr::Convert(target.expanded().clone()), e.span);
                Ok(blk)
            }
            ExprKind::FunctionRef {
                name,
                module,
                signature,
            } => {
                let module = match module {
                    Some(m) => m.clone(),
                    None => return Err(self.err(ErrorKind::UnknownFunctionOrMethod, e.span)),
                };
                let mut blk = Block::new(env.len());
                blk.push(
                    Instr::FunctionConst {
                        name: QualifiedName::new(module, name.clone()),
                        ty: signature.clone(),
                    },
                    e.span,
                );
                Ok(blk)
            }
            ExprKind::Invoke(invoke) => self.generate_invoke(invoke, true, e.span, env),
            ExprKind::Variable(_) | ExprKind::ModuleAccess(_) | ExprKind::PackageAccess(_) => {
                Err(self.internal("unresolved access survived propagation", e.span))
            }
        }
    }

    fn generate_unary(
        &mut self,
        op: UnaryOp,
        operand: &Expr,
        span: Span,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        match op {
            UnaryOp::Not => {
                let false_lab = self.labels.fresh();
                let exit_lab = self.labels.fresh();
                let mut blk = self.lower_condition(&false_lab, operand, env)?;
                blk.push(Instr::Const(Value::boolean(true)), span);
                blk.push(Instr::Goto(exit_lab.clone()), span);
                blk.push(Instr::Label(false_lab), span);
                blk.push(Instr::Const(Value::boolean(false)), span);
                blk.push(Instr::Label(exit_lab), span);
                Ok(blk)
            }
            UnaryOp::Neg => {
                let mut blk = self.generate_expr(operand, env)?;
                blk.push(Instr::Negate, span);
                Ok(blk)
            }
            UnaryOp::Invert => {
                let mut blk = self.generate_expr(operand, env)?;
                blk.push(Instr::Invert, span);
                Ok(blk)
            }
            UnaryOp::LengthOf => {
                let mut blk = self.generate_expr(operand, env)?;
                blk.push(Instr::LengthOf, span);
                Ok(blk)
            }
            UnaryOp::Spawn => {
                let mut blk = self.generate_expr(operand, env)?;
                blk.push(Instr::Spawn, span);
                Ok(blk)
            }
        }
    }

    fn generate_binary(
        &mut self,
        e: &Expr,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        use BinaryOp::*;
        match op {
            Eq | Ne | Lt | Le | Gt | Ge | Subset | SubsetEq | ElementOf | And | Or => {
                self.materialize_condition(e, env)
            }
            Union => {
                let mut blk = self.generate_operands(left, right, env)?;
                blk.push(Instr::SetUnion(OpDir::Uniform), e.span);
                Ok(blk)
            }
            Intersection => {
                let mut blk = self.generate_operands(left, right, env)?;
                blk.push(Instr::SetIntersect(OpDir::Uniform), e.span);
                Ok(blk)
            }
            Difference => {
                let mut blk = self.generate_operands(left, right, env)?;
                blk.push(Instr::SetDifference(OpDir::Uniform), e.span);
                Ok(blk)
            }
            ListAppend => {
                let mut blk = self.generate_operands(left, right, env)?;
                blk.push(Instr::ListAppend(OpDir::Uniform), e.span);
                Ok(blk)
            }
            StringAppend => {
                let dir = string_append_dir(left, right);
                let mut blk = self.generate_operands(left, right, env)?;
                blk.push(Instr::StringAppend(dir), e.span);
                Ok(blk)
            }
            Add | Sub | Mul | Div | Rem | Range | BitAnd | BitOr | BitXor | Shl | Shr => {
                let arith = match arith_op(op) {
                    Some(a) => a,
                    None => return Err(self.err(ErrorKind::InvalidBinaryExpression, e.span)),
                };
                let mut blk = self.generate_operands(left, right, env)?;
                blk.push(Instr::BinOp(arith), e.span);
                Ok(blk)
            }
        }
    }

    fn generate_operands(
        &mut self,
        left: &Expr,
        right: &Expr,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        let mut blk = self.generate_expr(left, env)?;
        blk.append(self.generate_expr(right, env)?);
        Ok(blk)
    }

    /// Produces a boolean value from a condition-shaped expression via the
    /// two-label pattern.
    fn materialize_condition(
        &mut self,
        e: &Expr,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        let true_lab = self.labels.fresh();
        let exit_lab = self.labels.fresh();
        let mut blk = self.lower_condition(&true_lab, e, env)?;
        blk.push(Instr::Const(Value::boolean(false)), e.span);
        blk.push(Instr::Goto(exit_lab.clone()), e.span);
        blk.push(Instr::Label(true_lab), e.span);
        blk.push(Instr::Const(Value::boolean(true)), e.span);
        blk.push(Instr::Label(exit_lab), e.span);
        Ok(blk)
    }

    fn generate_comprehension(
        &mut self,
        kind: ComprehensionKind,
        sources: &[(String, Expr)],
        condition: Option<&Expr>,
        value: Option<&Expr>,
        span: Span,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        if kind == ComprehensionKind::Some || kind == ComprehensionKind::None {
            // Boolean quantifiers reuse condition lowering, storing the
            // outcome into a fresh slot.
            let true_lab = self.labels.fresh();
            let exit_lab = self.labels.fresh();
            let free_slot = allocate_temp(env);
            let mut blk =
                self.lower_comprehension_condition(&true_lab, kind, sources, condition, span, env)?;
            blk.push(Instr::Const(Value::boolean(false)), span);
            blk.push(Instr::Store(free_slot), span);
            blk.push(Instr::Goto(exit_lab.clone()), span);
            blk.push(Instr::Label(true_lab), span);
            blk.push(Instr::Const(Value::boolean(true)), span);
            blk.push(Instr::Store(free_slot), span);
            blk.push(Instr::Label(exit_lab), span);
            blk.push(Instr::Load(free_slot), span);
            return Ok(blk);
        }

        let value = match value {
            Some(v) => v,
            None => return Err(self.internal("comprehension has no value expression", span)),
        };

        let mut blk = Block::new(env.len());
        let slots = self.bind_comprehension_sources(&mut blk, sources, env)?;

        let result_slot = allocate_temp(env);
        match kind {
            ComprehensionKind::List => blk.push(Instr::NewList(0), span),
            _ => blk.push(Instr::NewSet(0), span),
        }
        blk.push(Instr::Store(result_slot), span);

        let continue_lab = self.labels.fresh();
        let mut end_labels = Vec::with_capacity(slots.len());
        for (var_slot, src_slot) in &slots {
            let label = self.labels.fresh();
            blk.push(Instr::Load(*src_slot), span);
            blk.push(
                Instr::ForAll {
                    slot: *var_slot,
                    end: label.clone(),
                },
                span,
            );
            end_labels.push(label);
        }

        if let Some(cond) = condition {
            blk.append(self.lower_condition(&continue_lab, &invert(cond), env)?);
        }

        blk.push(Instr::Load(result_slot), span);
        blk.append(self.generate_expr(value, env)?);
        match kind {
            ComprehensionKind::List => blk.push(Instr::ListAppend(OpDir::Left), span),
            _ => blk.push(Instr::SetUnion(OpDir::Left), span),
        }
        blk.push(Instr::Store(result_slot), span);

        if condition.is_some() {
            blk.push(Instr::Label(continue_lab), span);
        }
        for label in end_labels.iter().rev() {
            blk.push(Instr::End(label.clone()), span);
        }
        blk.push(Instr::Load(result_slot), span);
        Ok(blk)
    }

    /// Exactly one invocation interpretation applies, tried in priority
    /// order: slot-indirect, field-indirect, direct, implicit-this method,
    /// message send.
    fn generate_invoke(
        &mut self,
        invoke: &Invoke,
        retval: bool,
        span: Span,
        env: &mut HashMap<String, usize>,
    ) -> Result<Block> {
        let receiver_is_this = matches!(
            invoke.receiver.as_deref(),
            Some(Expr {
                kind: ExprKind::Local(name),
                ..
            }) if name == "this"
        );

        let variable_indirect = env.contains_key(&invoke.name);
        let field_indirect =
            !variable_indirect && invoke.receiver.is_some() && invoke.module.is_none();
        let direct = !variable_indirect && invoke.receiver.is_none() && invoke.module.is_some();
        let method_invoke = !variable_indirect && receiver_is_this && invoke.module.is_some();
        let direct_send = !variable_indirect
            && invoke.receiver.is_some()
            && !receiver_is_this
            && invoke.module.is_some();

        let mut blk = Block::new(env.len());
        if variable_indirect {
            blk.push(Instr::Load(env[&invoke.name]), span);
        }
        if let Some(receiver) = &invoke.receiver {
            blk.append(self.generate_expr(receiver, env)?);
        }
        if field_indirect {
            blk.push(Instr::FieldLoad(invoke.name.clone()), span);
        }
        for arg in &invoke.args {
            blk.append(self.generate_expr(arg, env)?);
        }

        if variable_indirect {
            if invoke.receiver.is_some() {
                blk.push(
                    Instr::IndirectSend {
                        synchronous: invoke.synchronous,
                        retval,
                    },
                    span,
                );
            } else {
                blk.push(Instr::IndirectInvoke { retval }, span);
            }
        } else if field_indirect {
            blk.push(Instr::IndirectInvoke { retval }, span);
        } else if direct || method_invoke {
            let Some(module) = &invoke.module else {
                return Err(self.internal("direct invoke without a module", span));
            };
            blk.push(
                Instr::Invoke {
                    name: QualifiedName::new(module.clone(), invoke.name.clone()),
                    retval,
                },
                span,
            );
        } else if direct_send {
            let Some(module) = &invoke.module else {
                return Err(self.internal("message send without a module", span));
            };
            blk.push(
                Instr::Send {
                    name: QualifiedName::new(module.clone(), invoke.name.clone()),
                    synchronous: invoke.synchronous,
                    retval,
                },
                span,
            );
        } else {
            return Err(self.err(ErrorKind::UnknownFunctionOrMethod, span));
        }
        Ok(blk)
    }

    fn err(&self, kind: ErrorKind, span: Span) -> CompileError {
        CompileError::syntax(&self.filename, kind, span)
    }

    fn internal(&self, message: &str, span: Span) -> CompileError {
        CompileError::internal(&self.filename, message, span)
    }
}

impl Default for Generator {
    fn default() -> Self {
        Generator::new()
    }
}

/// Rewrites a boolean expression to its logical negation without
/// re-deriving control flow: De Morgan on and/or, complemented relational
/// operators, and double negation elimination.
pub fn invert(e: &Expr) -> Expr {
    use BinaryOp::*;
    match &e.kind {
        ExprKind::Binary { op, left, right } => {
            let dual = |op| ExprKind::Binary {
                op,
                left: left.clone(),
                right: right.clone(),
            };
            let kind = match op {
                And => ExprKind::Binary {
                    op: Or,
                    left: Box::new(invert(left)),
                    right: Box::new(invert(right)),
                },
                Or => ExprKind::Binary {
                    op: And,
                    left: Box::new(invert(left)),
                    right: Box::new(invert(right)),
                },
                Eq => dual(Ne),
                Ne => dual(Eq),
                Lt => dual(Ge),
                Le => dual(Gt),
                Gt => dual(Le),
                Ge => dual(Lt),
                _ => return wrap_not(e),
            };
            Expr {
                span: e.span,
                types: e.types.clone(),
                kind,
            }
        }
        ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => (**operand).clone(),
        _ => wrap_not(e),
    }
}

fn wrap_not(e: &Expr) -> Expr {
    Expr {
        span: e.span,
        types: Some(TypePair::plain(Type::Bool)),
        kind: ExprKind::Unary {
            op: UnaryOp::Not,
            operand: Box::new(e.clone()),
        },
    }
}

fn comparison_op(op: BinaryOp) -> Option<CompOp> {
    match op {
        BinaryOp::Eq => Some(CompOp::Eq),
        BinaryOp::Ne => Some(CompOp::Ne),
        BinaryOp::Lt => Some(CompOp::Lt),
        BinaryOp::Le => Some(CompOp::Le),
        BinaryOp::Gt => Some(CompOp::Gt),
        BinaryOp::Ge => Some(CompOp::Ge),
        BinaryOp::Subset => Some(CompOp::Subset),
        BinaryOp::SubsetEq => Some(CompOp::SubsetEq),
        BinaryOp::ElementOf => Some(CompOp::ElemOf),
        _ => None,
    }
}

fn arith_op(op: BinaryOp) -> Option<ArithOp> {
    match op {
        BinaryOp::Add => Some(ArithOp::Add),
        BinaryOp::Sub => Some(ArithOp::Sub),
        BinaryOp::Mul => Some(ArithOp::Mul),
        BinaryOp::Div => Some(ArithOp::Div),
        BinaryOp::Rem => Some(ArithOp::Rem),
        BinaryOp::Range => Some(ArithOp::Range),
        BinaryOp::BitAnd => Some(ArithOp::BitAnd),
        BinaryOp::BitOr => Some(ArithOp::BitOr),
        BinaryOp::BitXor => Some(ArithOp::BitXor),
        BinaryOp::Shl => Some(ArithOp::Shl),
        BinaryOp::Shr => Some(ArithOp::Shr),
        _ => None,
    }
}

fn string_append_dir(left: &Expr, right: &Expr) -> OpDir {
    let is_string = |e: &Expr| matches!(e.raw(), Some(Type::String));
    match (is_string(left), is_string(right)) {
        (true, false) => OpDir::Left,
        (false, true) => OpDir::Right,
        _ => OpDir::Uniform,
    }
}

fn constant_of(e: &Expr) -> Option<Value> {
    match &e.kind {
        ExprKind::Constant(v) => Some(v.clone()),
        ExprKind::ConstantAccess { value, .. } => value.clone(),
        _ => None,
    }
}

fn allocate(var: &str, environment: &mut HashMap<String, usize>) -> usize {
    match environment.get(var).copied() {
        Some(slot) => slot,
        None => {
            let slot = environment.len();
            environment.insert(var.to_string(), slot);
            slot
        }
    }
}

fn allocate_temp(environment: &mut HashMap<String, usize>) -> usize {
    let name = format!("${}", environment.len());
    allocate(&name, environment)
}

/// Base variables assigned anywhere in a statement list.
fn assigned_variables(stmts: &[Stmt]) -> HashSet<String> {
    fn base_of(e: &Expr, out: &mut HashSet<String>) {
        match &e.kind {
            ExprKind::Variable(name) | ExprKind::Local(name) => {
                out.insert(name.clone());
            }
            ExprKind::Tuple(elements) => {
                for element in elements {
                    base_of(element, out);
                }
            }
            ExprKind::Index { src, .. } => base_of(src, out),
            ExprKind::FieldAccess { src, .. } => base_of(src, out),
            _ => {}
        }
    }
    fn walk(stmts: &[Stmt], out: &mut HashSet<String>) {
        for stmt in stmts {
            match stmt {
                Stmt::Assign(s) => base_of(&s.lhs, out),
                Stmt::IfElse(s) => {
                    walk(&s.true_branch, out);
                    walk(&s.false_branch, out);
                }
                Stmt::While(s) => walk(&s.body, out),
                Stmt::DoWhile(s) => walk(&s.body, out),
                Stmt::For(s) => walk(&s.body, out),
                Stmt::Switch(s) => {
                    for c in &s.cases {
                        walk(&c.body, out);
                    }
                }
                Stmt::TryCatch(s) => {
                    walk(&s.body, out);
                    for c in &s.catches {
                        walk(&c.body, out);
                    }
                }
                _ => {}
            }
        }
    }
    let mut out = HashSet::new();
    walk(stmts, &mut out);
    out
}

/// Variables referenced anywhere in an expression.
fn free_variables(e: &Expr) -> HashSet<String> {
    fn walk(e: &Expr, out: &mut HashSet<String>) {
        match &e.kind {
            ExprKind::Variable(name) | ExprKind::Local(name) => {
                out.insert(name.clone());
            }
            ExprKind::Unary { operand, .. } => walk(operand, out),
            ExprKind::Binary { left, right, .. } => {
                walk(left, out);
                walk(right, out);
            }
            ExprKind::TypeTest { operand, .. } => walk(operand, out),
            ExprKind::Index { src, index, .. } => {
                walk(src, out);
                walk(index, out);
            }
            ExprKind::SubList { src, start, end } => {
                walk(src, out);
                walk(start, out);
                walk(end, out);
            }
            ExprKind::FieldAccess { src, .. } => walk(src, out),
            ExprKind::Record { fields } => {
                for (_, v) in fields {
                    walk(v, out);
                }
            }
            ExprKind::Tuple(es) | ExprKind::List(es) | ExprKind::Set(es) => {
                for e in es {
                    walk(e, out);
                }
            }
            ExprKind::Dictionary(pairs) => {
                for (k, v) in pairs {
                    walk(k, out);
                    walk(v, out);
                }
            }
            ExprKind::Comprehension {
                sources,
                condition,
                value,
                ..
            } => {
                for (_, src) in sources {
                    walk(src, out);
                }
                if let Some(c) = condition {
                    walk(c, out);
                }
                if let Some(v) = value {
                    walk(v, out);
                }
            }
            ExprKind::Convert { operand, .. } => walk(operand, out),
            ExprKind::Invoke(invoke) => {
                if let Some(r) = &invoke.receiver {
                    walk(r, out);
                }
                for a in &invoke.args {
                    walk(a, out);
                }
            }
            _ => {}
        }
    }
    let mut out = HashSet::new();
    walk(e, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_ast::{BreakStmt, SwitchCase, WhileStmt};
    use sable_ir::span;

    fn sp() -> Span {
        span(0, 0)
    }

    fn expr(kind: ExprKind) -> Expr {
        Expr::new(sp(), kind)
    }

    fn local(name: &str) -> Expr {
        Expr::typed(sp(), TypePair::plain(Type::Bool), ExprKind::Local(name.to_string()))
    }

    fn bool_lit(b: bool) -> Expr {
        expr(ExprKind::Constant(Value::boolean(b)))
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

    fn instrs(blk: &Block) -> Vec<&Instr> {
        blk.entries().iter().map(|e| &e.instr).collect()
    }

    #[test]
    fn invert_applies_de_morgan_duals() {
        let a = local("a");
        let b = local("b");
        let inverted = invert(&binary(BinaryOp::And, a, b));
        let ExprKind::Binary { op, left, right } = &inverted.kind else {
            panic!("expected a binary expression");
        };
        assert_eq!(*op, BinaryOp::Or);
        assert!(matches!(
            left.kind,
            ExprKind::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
        assert!(matches!(
            right.kind,
            ExprKind::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn invert_complements_relational_operators() {
        let pairs = [
            (BinaryOp::Lt, BinaryOp::Ge),
            (BinaryOp::Le, BinaryOp::Gt),
            (BinaryOp::Gt, BinaryOp::Le),
            (BinaryOp::Ge, BinaryOp::Lt),
            (BinaryOp::Eq, BinaryOp::Ne),
            (BinaryOp::Ne, BinaryOp::Eq),
        ];
        for (op, complement) in pairs {
            let inverted = invert(&binary(op, local("a"), local("b")));
            let ExprKind::Binary { op: got, .. } = inverted.kind else {
                panic!("expected a binary expression");
            };
            assert_eq!(got, complement);
        }
    }

    #[test]
    fn invert_unwraps_double_negation() {
        let e = local("a");
        let not_e = expr(ExprKind::Unary {
            op: UnaryOp::Not,
            operand: Box::new(e.clone()),
        });
        assert_eq!(invert(&not_e).kind, e.kind);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let mut g = Generator::new();
        let mut env = HashMap::new();
        let err = g
            .generate_stmt(&Stmt::Break(BreakStmt { span: sp() }), &mut env)
            .unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::BreakOutsideLoop)));
    }

    #[test]
    fn break_targets_the_innermost_loop() {
        let for_stmt = Stmt::For(ForStmt {
            span: sp(),
            variables: vec!["x".to_string()],
            source: local("xs"),
            invariant: None,
            body: vec![Stmt::Break(BreakStmt { span: sp() })],
        });
        let while_stmt = Stmt::While(WhileStmt {
            span: sp(),
            condition: bool_lit(true),
            invariant: None,
            body: vec![for_stmt],
        });

        let mut g = Generator::new();
        let mut env = HashMap::from([("xs".to_string(), 0)]);
        let blk = g.generate_stmt(&while_stmt, &mut env).unwrap();

        let instrs = instrs(&blk);
        let while_label = instrs
            .iter()
            .find_map(|i| match i {
                Instr::Loop(l) => Some(l.clone()),
                _ => None,
            })
            .expect("while loop marker");
        let (forall_at, for_label) = instrs
            .iter()
            .enumerate()
            .find_map(|(at, i)| match i {
                Instr::ForAll { end, .. } => Some((at, end.clone())),
                _ => None,
            })
            .expect("for loop marker");
        assert_ne!(while_label, for_label);
        // The break is the first statement of the for body.
        assert_eq!(instrs[forall_at + 1], &Instr::Goto(for_label));
    }

    #[test]
    fn switch_rejects_duplicate_case_constants() {
        let stmt = Stmt::Switch(SwitchStmt {
            span: sp(),
            expr: int_lit(0),
            cases: vec![
                SwitchCase {
                    span: sp(),
                    values: vec![int_lit(1)],
                    body: vec![],
                },
                SwitchCase {
                    span: sp(),
                    values: vec![int_lit(1)],
                    body: vec![],
                },
            ],
        });
        let mut g = Generator::new();
        let mut env = HashMap::new();
        let err = g.generate_stmt(&stmt, &mut env).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::DuplicateCaseLabel)));
    }

    #[test]
    fn switch_rejects_a_second_default() {
        let stmt = Stmt::Switch(SwitchStmt {
            span: sp(),
            expr: int_lit(0),
            cases: vec![
                SwitchCase {
                    span: sp(),
                    values: vec![],
                    body: vec![],
                },
                SwitchCase {
                    span: sp(),
                    values: vec![],
                    body: vec![],
                },
            ],
        });
        let mut g = Generator::new();
        let mut env = HashMap::new();
        let err = g.generate_stmt(&stmt, &mut env).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::DuplicateDefaultLabel)));
    }

    #[test]
    fn switch_rejects_cases_after_the_default() {
        let stmt = Stmt::Switch(SwitchStmt {
            span: sp(),
            expr: int_lit(0),
            cases: vec![
                SwitchCase {
                    span: sp(),
                    values: vec![],
                    body: vec![],
                },
                SwitchCase {
                    span: sp(),
                    values: vec![int_lit(1)],
                    body: vec![],
                },
            ],
        });
        let mut g = Generator::new();
        let mut env = HashMap::new();
        let err = g.generate_stmt(&stmt, &mut env).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::UnreachableCase)));
    }

    #[test]
    fn switch_without_default_falls_through_to_the_exit() {
        let stmt = Stmt::Switch(SwitchStmt {
            span: sp(),
            expr: int_lit(0),
            cases: vec![SwitchCase {
                span: sp(),
                values: vec![int_lit(1)],
                body: vec![],
            }],
        });
        let mut g = Generator::new();
        let mut env = HashMap::new();
        let blk = g.generate_stmt(&stmt, &mut env).unwrap();

        let default = blk
            .entries()
            .iter()
            .find_map(|e| match &e.instr {
                Instr::Switch { default, .. } => Some(default.clone()),
                _ => None,
            })
            .expect("dispatch table");
        // The exit label is the final instruction of the lowered switch.
        let last = blk.entries().last().map(|e| &e.instr);
        assert_eq!(last, Some(&Instr::Label(default)));
    }

    #[test]
    fn quantifier_markers_close_inner_to_outer() {
        let comprehension = Expr::typed(
            sp(),
            TypePair::plain(Type::Bool),
            ExprKind::Comprehension {
                kind: ComprehensionKind::Some,
                sources: vec![
                    ("x".to_string(), local("xs")),
                    ("y".to_string(), local("ys")),
                ],
                condition: Some(Box::new(binary(BinaryOp::Lt, local("x"), local("y")))),
                value: None,
            },
        );
        let mut g = Generator::new();
        let mut env = HashMap::from([("xs".to_string(), 0), ("ys".to_string(), 1)]);
        let blk = g.lower_condition("target", &comprehension, &mut env).unwrap();

        let mut opened = Vec::new();
        let mut closed = Vec::new();
        for e in blk.entries() {
            match &e.instr {
                Instr::ForAll { end, .. } => opened.push(end.clone()),
                Instr::End(l) => closed.push(l.clone()),
                _ => {}
            }
        }
        assert_eq!(opened.len(), 2);
        let reversed: Vec<_> = opened.iter().rev().cloned().collect();
        assert_eq!(closed, reversed, "markers must close inner to outer");
    }

    #[test]
    fn null_equality_on_a_local_becomes_a_type_test() {
        let cond = binary(BinaryOp::Eq, local("x"), expr(ExprKind::Null));
        let mut g = Generator::new();
        let mut env = HashMap::from([("x".to_string(), 0)]);
        let blk = g.lower_condition("target", &cond, &mut env).unwrap();
        assert_eq!(
            instrs(&blk),
            vec![&Instr::IfType {
                slot: Some(0),
                test: Type::Null,
                target: "target".to_string(),
            }]
        );

        let cond = binary(BinaryOp::Ne, local("x"), expr(ExprKind::Null));
        let blk = g.lower_condition("target", &cond, &mut env).unwrap();
        assert!(matches!(
            instrs(&blk)[0],
            Instr::IfType {
                test: Type::Null,
                ..
            }
        ));
        assert!(matches!(instrs(&blk)[1], Instr::Goto(t) if t == "target"));
    }

    #[test]
    fn multi_level_lvalue_lowers_to_one_update() {
        // xs[i].field = 1
        let lhs = expr(ExprKind::FieldAccess {
            src: Box::new(expr(ExprKind::Index {
                kind: None,
                src: Box::new(local("xs")),
                index: Box::new(local("i")),
            })),
            field: "field".to_string(),
        });
        let stmt = Stmt::Assign(AssignStmt {
            span: sp(),
            lhs,
            rhs: int_lit(1),
        });
        let mut g = Generator::new();
        let mut env = HashMap::from([("xs".to_string(), 0), ("i".to_string(), 1)]);
        let blk = g.generate_stmt(&stmt, &mut env).unwrap();
        let update = blk
            .entries()
            .iter()
            .find_map(|e| match &e.instr {
                Instr::Update { slot, depth, fields } => Some((*slot, *depth, fields.clone())),
                _ => None,
            })
            .expect("update instruction");
        assert_eq!(update, (0, 2, vec!["field".to_string()]));
    }
}
