#![forbid(unsafe_code)]

//! Flow-sensitive type propagation.
//!
//! Propagates type information from declared parameter and return types
//! through assigned expressions, decorating every expression with its
//! (nominal, raw) type pair and rewriting nodes whose meaning only becomes
//! apparent once operand types are known: unresolved identifiers become
//! local/constant/module/package accesses, abstract index accesses become
//! string/list/dictionary accesses, and `+`/`-`/`&` retarget to the
//! matching set, list or string operation.
//!
//! Loops are propagated to a fixed point: a single forward pass
//! under-approximates a variable whose type widens inside the body (an int
//! accumulator receiving a real increment), so the body is re-propagated
//! from the merged pre-loop/post-body environment until nothing widens,
//! bounded by [`CompileConfig::loop_fixpoint_limit`].

use sable_ast::{
    AssignStmt, AssertStmt, BinaryOp, ComprehensionKind, ConstDecl, Decl, DebugStmt, DoWhileStmt,
    Expr, ExprKind, ExprStmt, ForStmt, FunctionDecl, IfElseStmt, Import, IndexKind, Invoke,
    ReturnStmt, SourceFile, Stmt, SwitchCase, SwitchStmt, ThrowStmt, TryCatchStmt, TypeDecl,
    UnaryOp, WhileStmt,
};
use sable_ir::types::{
    self, effective_dict_type, effective_list_type, effective_record_type, effective_set_type,
    is_implicit_coercive_subtype, is_subtype, Type, TypePair,
};
use sable_ir::{PackageId, Span};

use crate::env::Env;
use crate::error::{CompileError, ErrorKind, Result};
use crate::resolve::{NameResolver, TypeExpander};
use crate::CompileConfig;

pub struct Propagator<'a> {
    filename: String,
    expander: &'a dyn TypeExpander,
    resolver: &'a dyn NameResolver,
    config: &'a CompileConfig,
    imports: Vec<Import>,
    /// Declared return type of the function being propagated.
    ret: Option<TypePair>,
}

impl<'a> Propagator<'a> {
    pub fn new(
        expander: &'a dyn TypeExpander,
        resolver: &'a dyn NameResolver,
        config: &'a CompileConfig,
    ) -> Self {
        Propagator {
            filename: String::new(),
            expander,
            resolver,
            config,
            imports: Vec::new(),
            ret: None,
        }
    }

    /// Propagates a whole file, returning the annotated AST. The first
    /// error aborts the file.
    pub fn propagate_file(&mut self, mut file: SourceFile) -> Result<SourceFile> {
        self.filename = file.filename.clone();
        self.imports = file.imports.clone();
        file.declarations = file
            .declarations
            .into_iter()
            .map(|d| self.propagate_decl(d))
            .collect::<Result<Vec<_>>>()?;
        Ok(file)
    }

    fn propagate_decl(&mut self, decl: Decl) -> Result<Decl> {
        match decl {
            Decl::Type(td) => self.propagate_type_decl(td).map(Decl::Type),
            Decl::Constant(cd) => self.propagate_const_decl(cd).map(Decl::Constant),
            Decl::Function(fd) => self.propagate_function(fd).map(Decl::Function),
        }
    }

    fn propagate_type_decl(&mut self, mut td: TypeDecl) -> Result<TypeDecl> {
        let pair = self.expand_pair(&td.ty.nominal, td.span)?;
        td.ty.raw = Some(pair.raw.clone());
        td.raw = Some(pair.raw.clone());
        if let Some(constraint) = td.where_clause.take() {
            let env = Env::new().put("$", pair);
            let constraint = self.propagate_expr(constraint, &env)?;
            self.check_is(&Type::Bool, &constraint)?;
            td.where_clause = Some(constraint);
        }
        Ok(td)
    }

    fn propagate_const_decl(&mut self, cd: ConstDecl) -> Result<ConstDecl> {
        // The value arrives as a compile-time-constant attribute; nothing
        // to infer.
        Ok(cd)
    }

    fn propagate_function(&mut self, mut fd: FunctionDecl) -> Result<FunctionDecl> {
        let mut env = Env::new();
        for p in &mut fd.parameters {
            let pair = self.expand_pair(&p.ty.nominal, p.span)?;
            p.ty.raw = Some(pair.raw.clone());
            env = env.put(p.name.clone(), pair);
        }
        if let Some(receiver) = &mut fd.receiver {
            let pair = self.expand_pair(&receiver.nominal, receiver.span)?;
            receiver.raw = Some(pair.raw.clone());
            env = env.put("this", pair);
        }

        let ret_pair = self.expand_pair(&fd.ret.nominal, fd.ret.span)?;
        fd.ret.raw = Some(ret_pair.raw.clone());

        if let Some(pre) = fd.precondition.take() {
            let pre = self.propagate_expr(pre, &env.clone())?;
            self.check_is(&Type::Bool, &pre)?;
            fd.precondition = Some(pre);
        }

        if let Some(post) = fd.postcondition.take() {
            let post_env = env.clone().put("$", ret_pair.clone());
            let post = self.propagate_expr(post, &post_env)?;
            self.check_is(&Type::Bool, &post)?;
            fd.postcondition = Some(post);
        }

        self.ret = Some(ret_pair);
        let (body, _) = self.propagate_stmts(fd.body, env)?;
        fd.body = body;
        self.ret = None;
        Ok(fd)
    }

    fn propagate_stmts(&mut self, stmts: Vec<Stmt>, mut env: Env) -> Result<(Vec<Stmt>, Env)> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            let (stmt, next) = self.propagate_stmt(stmt, env)?;
            out.push(stmt);
            env = next;
        }
        Ok((out, env))
    }

    fn propagate_stmt(&mut self, stmt: Stmt, env: Env) -> Result<(Stmt, Env)> {
        match stmt {
            Stmt::Assign(s) => self.propagate_assign(s, env),
            Stmt::Assert(s) => {
                let expr = self.propagate_expr(s.expr, &env)?;
                self.check_is(&Type::Bool, &expr)?;
                Ok((Stmt::Assert(AssertStmt { span: s.span, expr }), env))
            }
            Stmt::Return(s) => self.propagate_return(s, env),
            Stmt::Debug(s) => {
                let expr = self.propagate_expr(s.expr, &env)?;
                self.check_is(&Type::String, &expr)?;
                Ok((Stmt::Debug(DebugStmt { span: s.span, expr }), env))
            }
            Stmt::Skip(s) => Ok((Stmt::Skip(s), env)),
            Stmt::Break(s) => Ok((Stmt::Break(s), Env::Bottom)),
            Stmt::Throw(s) => {
                let expr = self.propagate_expr(s.expr, &env)?;
                Ok((Stmt::Throw(ThrowStmt { span: s.span, expr }), Env::Bottom))
            }
            Stmt::IfElse(s) => self.propagate_if_else(s, env),
            Stmt::While(s) => self.propagate_while(s, env),
            Stmt::DoWhile(s) => self.propagate_do_while(s, env),
            Stmt::For(s) => self.propagate_for(s, env),
            Stmt::Switch(s) => self.propagate_switch(s, env),
            Stmt::TryCatch(s) => self.propagate_try_catch(s, env),
            Stmt::Expr(s) => {
                let expr = self.propagate_expr(s.expr, &env)?;
                Ok((Stmt::Expr(ExprStmt { span: s.span, expr }), env))
            }
        }
    }

    fn propagate_assign(&mut self, s: AssignStmt, env: Env) -> Result<(Stmt, Env)> {
        let rhs = self.propagate_expr(s.rhs, &env)?;
        let rhs_pair = self.pair_of(&rhs)?.clone();

        let (lhs, env) = match s.lhs.kind {
            // A bare variable target is (re)bound flow-sensitively to the
            // right-hand side's type.
            ExprKind::Variable(name) | ExprKind::Local(name) => {
                let lhs = Expr::typed(s.lhs.span, rhs_pair.clone(), ExprKind::Local(name.clone()));
                let env = env.put(name, rhs_pair);
                (lhs, env)
            }
            ExprKind::Tuple(elements) => {
                let span = s.lhs.span;
                let element_raws = match &rhs_pair.raw {
                    Type::Tuple(ts) if ts.len() == elements.len() => ts.clone(),
                    _ => return Err(self.err(ErrorKind::InvalidTupleLVal, span)),
                };
                let element_nominals = match &rhs_pair.nominal {
                    Type::Tuple(ts) if ts.len() == elements.len() => ts.clone(),
                    _ => element_raws.clone(),
                };
                let mut env = env;
                let mut typed = Vec::with_capacity(elements.len());
                for (element, (nominal, raw)) in elements
                    .into_iter()
                    .zip(element_nominals.into_iter().zip(element_raws))
                {
                    let name = match element.kind {
                        ExprKind::Variable(name) | ExprKind::Local(name) => name,
                        _ => return Err(self.err(ErrorKind::InvalidTupleLVal, element.span)),
                    };
                    let pair = TypePair::new(nominal, raw);
                    env = env.put(name.clone(), pair.clone());
                    typed.push(Expr::typed(element.span, pair, ExprKind::Local(name)));
                }
                let pair = rhs_pair;
                (Expr::typed(span, pair, ExprKind::Tuple(typed)), env)
            }
            ExprKind::Index { .. } | ExprKind::FieldAccess { .. } => {
                let lhs = self.propagate_expr(s.lhs, &env)?;
                let lhs_pair = self.pair_of(&lhs)?;
                if !is_implicit_coercive_subtype(&lhs_pair.raw, &rhs_pair.raw) {
                    return Err(self.subtype_err(&lhs_pair.nominal, &rhs, rhs.span));
                }
                (lhs, env)
            }
            _ => return Err(self.err(ErrorKind::InvalidLVal, s.lhs.span)),
        };

        Ok((Stmt::Assign(AssignStmt { span: s.span, lhs, rhs }), env))
    }

    fn propagate_return(&mut self, s: ReturnStmt, env: Env) -> Result<(Stmt, Env)> {
        let ret = match &self.ret {
            Some(ret) => ret.clone(),
            None => return Err(self.internal("return outside any function", s.span)),
        };
        let expr = match s.expr {
            Some(expr) => {
                let expr = self.propagate_expr(expr, &env)?;
                let found = self.pair_of(&expr)?;
                if !is_implicit_coercive_subtype(&ret.raw, &found.raw) {
                    return Err(self.subtype_err(&ret.nominal, &expr, expr.span));
                }
                Some(expr)
            }
            None => {
                if ret.raw != Type::Void {
                    return Err(self.err(
                        ErrorKind::SubtypeMismatch {
                            expected: ret.nominal.clone(),
                            found: Type::Void,
                        },
                        s.span,
                    ));
                }
                None
            }
        };
        Ok((Stmt::Return(ReturnStmt { span: s.span, expr }), Env::Bottom))
    }

    fn propagate_if_else(&mut self, s: IfElseStmt, env: Env) -> Result<(Stmt, Env)> {
        let condition = self.propagate_expr(s.condition, &env)?;
        self.check_is(&Type::Bool, &condition)?;
        let (true_branch, true_env) = self.propagate_stmts(s.true_branch, env.clone())?;
        let (false_branch, false_env) = self.propagate_stmts(s.false_branch, env.clone())?;
        Ok((
            Stmt::IfElse(IfElseStmt {
                span: s.span,
                condition,
                true_branch,
                false_branch,
            }),
            true_env.join(&false_env),
        ))
    }

    /// Re-propagates a loop body from the merged pre-loop/post-body
    /// environment until the environment stabilizes.
    fn fixpoint(&mut self, body: &[Stmt], env: Env, span: Span) -> Result<(Vec<Stmt>, Env)> {
        let mut current = env;
        for _ in 0..self.config.loop_fixpoint_limit {
            let (propagated, out) = self.propagate_stmts(body.to_vec(), current.clone())?;
            let merged = current.join(&out);
            if merged == current {
                return Ok((propagated, merged));
            }
            current = merged;
        }
        Err(self.internal("loop type propagation failed to converge", span))
    }

    fn propagate_while(&mut self, s: WhileStmt, env: Env) -> Result<(Stmt, Env)> {
        let (body, loop_env) = self.fixpoint(&s.body, env, s.span)?;
        let condition = self.propagate_expr(s.condition, &loop_env)?;
        self.check_is(&Type::Bool, &condition)?;
        let invariant = match s.invariant {
            Some(inv) => {
                let inv = self.propagate_expr(inv, &loop_env)?;
                self.check_is(&Type::Bool, &inv)?;
                Some(inv)
            }
            None => None,
        };
        Ok((
            Stmt::While(WhileStmt {
                span: s.span,
                condition,
                invariant,
                body,
            }),
            loop_env,
        ))
    }

    fn propagate_do_while(&mut self, s: DoWhileStmt, env: Env) -> Result<(Stmt, Env)> {
        let invariant = match s.invariant {
            Some(inv) => {
                let inv = self.propagate_expr(inv, &env)?;
                self.check_is(&Type::Bool, &inv)?;
                Some(inv)
            }
            None => None,
        };
        let (body, loop_env) = self.fixpoint(&s.body, env, s.span)?;
        // The condition is evaluated after the body has run.
        let condition = self.propagate_expr(s.condition, &loop_env)?;
        self.check_is(&Type::Bool, &condition)?;
        Ok((
            Stmt::DoWhile(DoWhileStmt {
                span: s.span,
                condition,
                invariant,
                body,
            }),
            loop_env,
        ))
    }

    fn propagate_for(&mut self, s: ForStmt, env: Env) -> Result<(Stmt, Env)> {
        if s.variables.is_empty() {
            return Err(self.internal("for loop binds no variables", s.span));
        }
        let source = self.propagate_expr(s.source, &env)?;
        let element = self.element_type(&source)?;

        let mut loop_env = env;
        if s.variables.len() > 1 {
            let elements = match &element {
                Type::Tuple(ts) if ts.len() == s.variables.len() => ts.clone(),
                _ => return Err(self.err(ErrorKind::InvalidTupleLVal, s.span)),
            };
            for (var, ty) in s.variables.iter().zip(elements) {
                if loop_env.contains(var) {
                    return Err(
                        self.err(ErrorKind::VariableAlreadyDefined(var.clone()), s.span)
                    );
                }
                loop_env = loop_env.put(var.clone(), TypePair::plain(ty));
            }
        } else {
            let var = &s.variables[0];
            if loop_env.contains(var) {
                return Err(self.err(ErrorKind::VariableAlreadyDefined(var.clone()), s.span));
            }
            loop_env = loop_env.put(var.clone(), TypePair::plain(element));
        }

        let invariant = match s.invariant {
            Some(inv) => {
                let inv = self.propagate_expr(inv, &loop_env)?;
                self.check_is(&Type::Bool, &inv)?;
                Some(inv)
            }
            None => None,
        };

        let (body, mut out) = self.fixpoint(&s.body, loop_env, s.span)?;
        // The iteration variables are scoped to the loop.
        for var in &s.variables {
            out = out.remove(var);
        }
        Ok((
            Stmt::For(ForStmt {
                span: s.span,
                variables: s.variables,
                source,
                invariant,
                body,
            }),
            out,
        ))
    }

    fn propagate_switch(&mut self, s: SwitchStmt, env: Env) -> Result<(Stmt, Env)> {
        let expr = self.propagate_expr(s.expr, &env)?;
        let mut has_default = false;
        let mut joined: Option<Env> = None;
        let mut cases = Vec::with_capacity(s.cases.len());
        for case in s.cases {
            if case.values.is_empty() {
                has_default = true;
            }
            let values = case
                .values
                .into_iter()
                .map(|v| self.propagate_expr(v, &env))
                .collect::<Result<Vec<_>>>()?;
            let (body, out) = self.propagate_stmts(case.body, env.clone())?;
            joined = Some(match joined {
                Some(acc) => acc.join(&out),
                None => out,
            });
            cases.push(SwitchCase {
                span: case.span,
                values,
                body,
            });
        }
        let mut result = joined.unwrap_or(Env::Bottom);
        if !has_default {
            // Without a default clause control can fall straight through.
            result = result.join(&env);
        }
        Ok((Stmt::Switch(SwitchStmt { span: s.span, expr, cases }), result))
    }

    fn propagate_try_catch(&mut self, s: TryCatchStmt, env: Env) -> Result<(Stmt, Env)> {
        let (body, mut joined) = self.propagate_stmts(s.body, env.clone())?;
        let mut catches = Vec::with_capacity(s.catches.len());
        for mut c in s.catches {
            let pair = self.expand_pair(&c.ty.nominal, c.span)?;
            c.ty.raw = Some(pair.raw.clone());
            let handler_env = env.clone().put(c.variable.clone(), pair);
            let (handler_body, out) = self.propagate_stmts(c.body, handler_env)?;
            c.body = handler_body;
            joined = joined.join(&out.remove(&c.variable));
            catches.push(c);
        }
        Ok((
            Stmt::TryCatch(TryCatchStmt {
                span: s.span,
                body,
                catches,
            }),
            joined,
        ))
    }

    fn propagate_expr(&mut self, expr: Expr, env: &Env) -> Result<Expr> {
        let span = expr.span;
        match expr.kind {
            ExprKind::Constant(value) => {
                let ty = value.type_of();
                Ok(Expr::typed(span, TypePair::plain(ty), ExprKind::Constant(value)))
            }
            ExprKind::Null => Ok(Expr::typed(span, TypePair::plain(Type::Null), ExprKind::Null)),
            ExprKind::Variable(name) => self.propagate_variable(name, span, env),
            ExprKind::Local(name) => match env.get(&name) {
                Some(pair) => Ok(Expr::typed(span, pair.clone(), ExprKind::Local(name))),
                None => Err(self.err(ErrorKind::UnknownVariable, span)),
            },
            ExprKind::ConstantAccess { name, value } => {
                let ty = value.as_ref().map(|v| v.type_of()).unwrap_or(Type::Any);
                Ok(Expr::typed(
                    span,
                    TypePair::plain(ty),
                    ExprKind::ConstantAccess { name, value },
                ))
            }
            ExprKind::ModuleAccess(id) => Ok(Expr::typed(
                span,
                TypePair::plain(Type::Any),
                ExprKind::ModuleAccess(id),
            )),
            ExprKind::PackageAccess(id) => Ok(Expr::typed(
                span,
                TypePair::plain(Type::Any),
                ExprKind::PackageAccess(id),
            )),
            ExprKind::Unary { op, operand } => self.propagate_unary(op, *operand, span, env),
            ExprKind::Binary { op, left, right } => {
                self.propagate_binary(op, *left, *right, span, env)
            }
            ExprKind::TypeTest { operand, mut test } => {
                let operand = self.propagate_expr(*operand, env)?;
                test.raw = Some(self.expand_pair(&test.nominal, test.span)?.raw);
                Ok(Expr::typed(
                    span,
                    TypePair::plain(Type::Bool),
                    ExprKind::TypeTest {
                        operand: Box::new(operand),
                        test,
                    },
                ))
            }
            ExprKind::Index { src, index, .. } => self.propagate_index(*src, *index, span, env),
            ExprKind::SubList { src, start, end } => {
                let src = self.propagate_expr(*src, env)?;
                let element = match effective_list_type(&self.pair_of(&src)?.raw) {
                    Some(e) => e,
                    None => return Err(self.err(ErrorKind::InvalidListExpression, src.span)),
                };
                let start = self.propagate_expr(*start, env)?;
                let end = self.propagate_expr(*end, env)?;
                self.check_is(&Type::Int, &start)?;
                self.check_is(&Type::Int, &end)?;
                Ok(Expr::typed(
                    span,
                    TypePair::plain(Type::List(Box::new(element))),
                    ExprKind::SubList {
                        src: Box::new(src),
                        start: Box::new(start),
                        end: Box::new(end),
                    },
                ))
            }
            ExprKind::FieldAccess { src, field } => {
                let src = self.propagate_expr(*src, env)?;
                let fields = match effective_record_type(&self.pair_of(&src)?.raw) {
                    Some(fields) => fields,
                    None => return Err(self.err(ErrorKind::InvalidRecordExpression, src.span)),
                };
                let ty = match fields.get(&field) {
                    Some(ty) => ty.clone(),
                    None => return Err(self.err(ErrorKind::UnknownField(field), span)),
                };
                Ok(Expr::typed(
                    span,
                    TypePair::plain(ty),
                    ExprKind::FieldAccess {
                        src: Box::new(src),
                        field,
                    },
                ))
            }
            ExprKind::Record { fields } => {
                let mut typed = Vec::with_capacity(fields.len());
                let mut raw = std::collections::BTreeMap::new();
                let mut nominal = std::collections::BTreeMap::new();
                for (name, value) in fields {
                    let value = self.propagate_expr(value, env)?;
                    let pair = self.pair_of(&value)?;
                    raw.insert(name.clone(), pair.raw.clone());
                    nominal.insert(name.clone(), pair.nominal.clone());
                    typed.push((name, value));
                }
                Ok(Expr::typed(
                    span,
                    TypePair::new(Type::Record(nominal), Type::Record(raw)),
                    ExprKind::Record { fields: typed },
                ))
            }
            ExprKind::Tuple(elements) => {
                let elements = elements
                    .into_iter()
                    .map(|e| self.propagate_expr(e, env))
                    .collect::<Result<Vec<_>>>()?;
                let nominal = Type::Tuple(
                    elements
                        .iter()
                        .map(|e| self.pair_of(e).map(|p| p.nominal.clone()))
                        .collect::<Result<_>>()?,
                );
                let raw = Type::Tuple(
                    elements
                        .iter()
                        .map(|e| self.pair_of(e).map(|p| p.raw.clone()))
                        .collect::<Result<_>>()?,
                );
                Ok(Expr::typed(span, TypePair::new(nominal, raw), ExprKind::Tuple(elements)))
            }
            ExprKind::List(elements) => {
                let (elements, element) = self.propagate_elements(elements, env)?;
                Ok(Expr::typed(
                    span,
                    TypePair::plain(Type::List(Box::new(element))),
                    ExprKind::List(elements),
                ))
            }
            ExprKind::Set(elements) => {
                let (elements, element) = self.propagate_elements(elements, env)?;
                Ok(Expr::typed(
                    span,
                    TypePair::plain(Type::Set(Box::new(element))),
                    ExprKind::Set(elements),
                ))
            }
            ExprKind::Dictionary(pairs) => {
                let mut typed = Vec::with_capacity(pairs.len());
                let mut key = Type::Void;
                let mut value = Type::Void;
                for (k, v) in pairs {
                    let k = self.propagate_expr(k, env)?;
                    let v = self.propagate_expr(v, env)?;
                    key = types::union(&key, &self.pair_of(&k)?.raw);
                    value = types::union(&value, &self.pair_of(&v)?.raw);
                    typed.push((k, v));
                }
                Ok(Expr::typed(
                    span,
                    TypePair::plain(Type::Dictionary {
                        key: Box::new(key),
                        value: Box::new(value),
                    }),
                    ExprKind::Dictionary(typed),
                ))
            }
            ExprKind::Comprehension {
                kind,
                sources,
                condition,
                value,
            } => self.propagate_comprehension(kind, sources, condition, value, span, env),
            ExprKind::Convert { mut target, operand } => {
                let operand = self.propagate_expr(*operand, env)?;
                let to = self.expand_pair(&target.nominal, target.span)?.raw;
                let from = &self.pair_of(&operand)?.raw;
                if !types::is_explicit_coercive_subtype(&to, from) {
                    return Err(self.subtype_err(&target.nominal, &operand, span));
                }
                target.raw = Some(to.clone());
                Ok(Expr::typed(
                    span,
                    TypePair::new(target.nominal.clone(), to),
                    ExprKind::Convert {
                        target,
                        operand: Box::new(operand),
                    },
                ))
            }
            ExprKind::FunctionRef {
                name,
                module,
                signature,
            } => {
                let module = match module {
                    Some(m) => Some(m),
                    None => self
                        .resolver
                        .resolve_name(&name, &self.imports)
                        .ok()
                        .map(|q| q.module),
                };
                let pair = match &signature {
                    Some(sig) => {
                        TypePair::new(sig.clone(), self.expand_pair(sig, span)?.raw)
                    }
                    None => TypePair::plain(Type::Any),
                };
                Ok(Expr::typed(
                    span,
                    pair,
                    ExprKind::FunctionRef {
                        name,
                        module,
                        signature,
                    },
                ))
            }
            ExprKind::Invoke(invoke) => self.propagate_invoke(invoke, span, env),
        }
    }

    fn propagate_elements(&mut self, elements: Vec<Expr>, env: &Env) -> Result<(Vec<Expr>, Type)> {
        let mut typed = Vec::with_capacity(elements.len());
        let mut element = Type::Void;
        for e in elements {
            let e = self.propagate_expr(e, env)?;
            element = types::union(&element, &self.pair_of(&e)?.raw);
            typed.push(e);
        }
        Ok((typed, element))
    }

    /// Unresolved identifier: local variable, then compile-time constant,
    /// then external module, then package, else unresolved.
    fn propagate_variable(&mut self, name: String, span: Span, env: &Env) -> Result<Expr> {
        if let Some(pair) = env.get(&name) {
            return Ok(Expr::typed(span, pair.clone(), ExprKind::Local(name)));
        }
        if let Ok(qname) = self.resolver.resolve_name(&name, &self.imports) {
            let value = self.resolver.constant_value(&qname);
            let ty = value.as_ref().map(|v| v.type_of()).unwrap_or(Type::Any);
            return Ok(Expr::typed(
                span,
                TypePair::plain(ty),
                ExprKind::ConstantAccess { name: qname, value },
            ));
        }
        if let Ok(module) = self.resolver.resolve_module(&name, &self.imports) {
            return Ok(Expr::typed(
                span,
                TypePair::plain(Type::Any),
                ExprKind::ModuleAccess(module),
            ));
        }
        let package = PackageId::root(name.clone());
        if self.resolver.is_package(&package) {
            return Ok(Expr::typed(
                span,
                TypePair::plain(Type::Any),
                ExprKind::PackageAccess(package),
            ));
        }
        Err(self.err(ErrorKind::UnknownVariable, span))
    }

    fn propagate_unary(
        &mut self,
        op: UnaryOp,
        operand: Expr,
        span: Span,
        env: &Env,
    ) -> Result<Expr> {
        let operand = self.propagate_expr(operand, env)?;
        let raw = self.pair_of(&operand)?.raw.clone();
        let result = match op {
            UnaryOp::Not => {
                self.check_is(&Type::Bool, &operand)?;
                Type::Bool
            }
            UnaryOp::Neg => {
                self.check_is(&Type::Real, &operand)?;
                if is_implicit_coercive_subtype(&Type::Int, &raw) {
                    Type::Int
                } else {
                    Type::Real
                }
            }
            UnaryOp::Invert => {
                self.check_is(&Type::Byte, &operand)?;
                Type::Byte
            }
            UnaryOp::LengthOf => {
                let is_collection = is_implicit_coercive_subtype(&Type::String, &raw)
                    || effective_list_type(&raw).is_some()
                    || effective_set_type(&raw).is_some()
                    || effective_dict_type(&raw).is_some();
                if !is_collection {
                    return Err(self.err(ErrorKind::InvalidSetExpression, operand.span));
                }
                Type::Int
            }
            UnaryOp::Spawn => Type::Process(Box::new(raw)),
        };
        Ok(Expr::typed(
            span,
            TypePair::plain(result),
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        ))
    }

    fn propagate_binary(
        &mut self,
        op: BinaryOp,
        left: Expr,
        right: Expr,
        span: Span,
        env: &Env,
    ) -> Result<Expr> {
        let left = self.propagate_expr(left, env)?;
        let right = self.propagate_expr(right, env)?;
        let lraw = self.pair_of(&left)?.raw.clone();
        let rraw = self.pair_of(&right)?.raw.clone();

        let set_any = Type::Set(Box::new(Type::Any));
        let list_any = Type::List(Box::new(Type::Any));
        let lhs_set = is_subtype(&set_any, &lraw);
        let rhs_set = is_subtype(&set_any, &rraw);
        let lhs_list = is_subtype(&list_any, &lraw);
        let rhs_list = is_subtype(&list_any, &rraw);
        let lhs_str = is_subtype(&Type::String, &lraw);
        let rhs_str = is_subtype(&Type::String, &rraw);

        use BinaryOp::*;
        let (op, result) = match op {
            And | Or => {
                self.check_is(&Type::Bool, &left)?;
                self.check_is(&Type::Bool, &right)?;
                (op, Type::Bool)
            }
            Eq | Ne => {
                let comparable = is_implicit_coercive_subtype(&lraw, &rraw)
                    || is_implicit_coercive_subtype(&rraw, &lraw);
                if !comparable {
                    return Err(self.err(ErrorKind::InvalidBinaryExpression, span));
                }
                (op, Type::Bool)
            }
            Lt | Le | Gt | Ge => {
                let numeric = is_implicit_coercive_subtype(&Type::Real, &lraw)
                    && is_implicit_coercive_subtype(&Type::Real, &rraw);
                let textual = lhs_str && rhs_str;
                if !numeric && !textual {
                    return Err(self.err(ErrorKind::InvalidBinaryExpression, span));
                }
                (op, Type::Bool)
            }
            Subset | SubsetEq => {
                if !lhs_set || !rhs_set {
                    return Err(self.err(ErrorKind::InvalidSetExpression, span));
                }
                (op, Type::Bool)
            }
            ElementOf => {
                if !rhs_set && !rhs_list {
                    return Err(self.err(ErrorKind::InvalidSetExpression, span));
                }
                (op, Type::Bool)
            }
            _ if lhs_str || rhs_str => {
                // String concatenation swallows either operand shape.
                if !matches!(op, Add | StringAppend) {
                    return Err(self.err(ErrorKind::InvalidStringOperation, span));
                }
                (StringAppend, Type::String)
            }
            _ if lhs_set && rhs_set => {
                let joined = types::union(&lraw, &rraw);
                let element = match effective_set_type(&joined) {
                    Some(e) => e,
                    None => return Err(self.err(ErrorKind::InvalidSetExpression, span)),
                };
                let retargeted = match op {
                    Add | Union => Union,
                    BitAnd | Intersection => Intersection,
                    Sub | Difference => Difference,
                    _ => return Err(self.err(ErrorKind::InvalidSetOperation, span)),
                };
                (retargeted, Type::Set(Box::new(element)))
            }
            _ if lhs_list && rhs_list => {
                let joined = types::union(&lraw, &rraw);
                let element = match effective_list_type(&joined) {
                    Some(e) => e,
                    None => return Err(self.err(ErrorKind::InvalidListExpression, span)),
                };
                if !matches!(op, Add | ListAppend) {
                    return Err(self.err(ErrorKind::InvalidListOperation, span));
                }
                (ListAppend, Type::List(Box::new(element)))
            }
            BitAnd | BitOr | BitXor => {
                self.check_is(&Type::Byte, &left)?;
                self.check_is(&Type::Byte, &right)?;
                (op, Type::Byte)
            }
            Shl | Shr => {
                self.check_is(&Type::Byte, &left)?;
                self.check_is(&Type::Int, &right)?;
                (op, Type::Byte)
            }
            Range => {
                self.check_is(&Type::Int, &left)?;
                self.check_is(&Type::Int, &right)?;
                (op, Type::List(Box::new(Type::Int)))
            }
            Rem => {
                self.check_is(&Type::Int, &left)?;
                self.check_is(&Type::Int, &right)?;
                (op, Type::Int)
            }
            Add | Sub | Mul | Div => {
                // Arithmetic: pick the result from the side the other
                // operand implicitly widens into.
                let result = if is_implicit_coercive_subtype(&lraw, &rraw) {
                    self.check_is(&Type::Real, &left)?;
                    numeric_result(&lraw)
                } else {
                    self.check_is(&Type::Real, &left)?;
                    self.check_is(&Type::Real, &right)?;
                    numeric_result(&rraw)
                };
                (op, result)
            }
            Union | Intersection | Difference => {
                return Err(self.err(ErrorKind::InvalidSetOperation, span));
            }
            ListAppend => return Err(self.err(ErrorKind::InvalidListOperation, span)),
            StringAppend => return Err(self.err(ErrorKind::InvalidStringOperation, span)),
        };

        Ok(Expr::typed(
            span,
            TypePair::plain(result),
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        ))
    }

    fn propagate_index(
        &mut self,
        src: Expr,
        index: Expr,
        span: Span,
        env: &Env,
    ) -> Result<Expr> {
        let src = self.propagate_expr(src, env)?;
        let index = self.propagate_expr(index, env)?;
        let sraw = self.pair_of(&src)?.raw.clone();

        let (kind, result) = if is_implicit_coercive_subtype(&Type::String, &sraw) {
            self.check_is(&Type::Int, &index)?;
            (IndexKind::String, Type::Char)
        } else if let Some(element) = effective_list_type(&sraw) {
            self.check_is(&Type::Int, &index)?;
            (IndexKind::List, element)
        } else {
            let (key, value) = match effective_dict_type(&sraw) {
                Some(kv) => kv,
                None => return Err(self.err(ErrorKind::InvalidDictionaryExpression, src.span)),
            };
            let iraw = &self.pair_of(&index)?.raw;
            if !is_implicit_coercive_subtype(&key, iraw) {
                return Err(self.subtype_err(&key, &index, index.span));
            }
            (IndexKind::Dictionary, value)
        };

        Ok(Expr::typed(
            span,
            TypePair::plain(result),
            ExprKind::Index {
                kind: Some(kind),
                src: Box::new(src),
                index: Box::new(index),
            },
        ))
    }

    fn propagate_comprehension(
        &mut self,
        kind: ComprehensionKind,
        sources: Vec<(String, Expr)>,
        condition: Option<Box<Expr>>,
        value: Option<Box<Expr>>,
        span: Span,
        env: &Env,
    ) -> Result<Expr> {
        let mut inner = env.clone();
        let mut typed_sources = Vec::with_capacity(sources.len());
        for (var, src) in sources {
            let src = self.propagate_expr(src, &inner)?;
            let element = self.element_type(&src)?;
            if inner.contains(&var) {
                return Err(self.err(ErrorKind::VariableAlreadyDefined(var), src.span));
            }
            inner = inner.put(var.clone(), TypePair::plain(element));
            typed_sources.push((var, src));
        }

        let condition = match condition {
            Some(c) => {
                let c = self.propagate_expr(*c, &inner)?;
                self.check_is(&Type::Bool, &c)?;
                Some(Box::new(c))
            }
            None => None,
        };

        let (value, result) = match kind {
            ComprehensionKind::Some | ComprehensionKind::None => (None, Type::Bool),
            ComprehensionKind::List | ComprehensionKind::Set => {
                let v = match value {
                    Some(v) => self.propagate_expr(*v, &inner)?,
                    None => {
                        return Err(self.internal("comprehension has no value expression", span));
                    }
                };
                let element = self.pair_of(&v)?.raw.clone();
                let result = match kind {
                    ComprehensionKind::List => Type::List(Box::new(element)),
                    _ => Type::Set(Box::new(element)),
                };
                (Some(Box::new(v)), result)
            }
        };

        Ok(Expr::typed(
            span,
            TypePair::plain(result),
            ExprKind::Comprehension {
                kind,
                sources: typed_sources,
                condition,
                value,
            },
        ))
    }

    fn propagate_invoke(&mut self, invoke: Invoke, span: Span, env: &Env) -> Result<Expr> {
        let receiver = match invoke.receiver {
            Some(r) => Some(Box::new(self.propagate_expr(*r, env)?)),
            None => None,
        };
        let args = invoke
            .args
            .into_iter()
            .map(|a| self.propagate_expr(a, env))
            .collect::<Result<Vec<_>>>()?;

        let slot_signature = if receiver.is_none() {
            env.get(&invoke.name).map(|p| p.raw.clone())
        } else {
            None
        };

        let mut module = invoke.module;
        let result = match (&slot_signature, &invoke.signature) {
            (Some(Type::Function { ret, .. }), _) => (**ret).clone(),
            (Some(_), _) => Type::Any,
            (None, Some(Type::Function { ret, .. }) | Some(Type::Method { ret, .. })) => {
                (**ret).clone()
            }
            (None, _) => {
                if module.is_none() {
                    module = self
                        .resolver
                        .resolve_name(&invoke.name, &self.imports)
                        .ok()
                        .map(|q| q.module);
                }
                Type::Any
            }
        };

        Ok(Expr::typed(
            span,
            TypePair::plain(result),
            ExprKind::Invoke(Invoke {
                receiver,
                name: invoke.name,
                args,
                synchronous: invoke.synchronous,
                module,
                signature: invoke.signature,
            }),
        ))
    }

    /// The element type a for-loop or comprehension generator yields for
    /// this source: set/list elements, or (key, value) tuples for
    /// dictionaries.
    fn element_type(&self, source: &Expr) -> Result<Type> {
        let raw = &self.pair_of(source)?.raw;
        if let Some(e) = effective_set_type(raw) {
            return Ok(e);
        }
        if let Some(e) = effective_list_type(raw) {
            return Ok(e);
        }
        if let Some((k, v)) = effective_dict_type(raw) {
            return Ok(Type::Tuple(vec![k, v]));
        }
        Err(self.err(ErrorKind::InvalidSetExpression, source.span))
    }

    fn expand_pair(&self, nominal: &Type, span: Span) -> Result<TypePair> {
        match self.expander.expand(nominal) {
            Ok(raw) => Ok(TypePair::new(nominal.clone(), raw)),
            Err(cause) => Err(CompileError::internal_caused(
                &self.filename,
                format!("type expansion failed for {nominal}"),
                span,
                cause,
            )),
        }
    }

    fn pair_of<'e>(&self, expr: &'e Expr) -> Result<&'e TypePair> {
        match &expr.types {
            Some(pair) => Ok(pair),
            None => Err(self.internal("expression reached use before propagation", expr.span)),
        }
    }

    /// Checks `expr`'s raw type is an implicit-coercive subtype of
    /// `expected`; reports against the nominal type, which carries the
    /// more helpful names.
    fn check_is(&self, expected: &Type, expr: &Expr) -> Result<()> {
        let pair = self.pair_of(expr)?;
        if is_implicit_coercive_subtype(expected, &pair.raw) {
            Ok(())
        } else {
            Err(self.subtype_err(expected, expr, expr.span))
        }
    }

    fn subtype_err(&self, expected: &Type, found: &Expr, span: Span) -> CompileError {
        let found = found
            .nominal()
            .cloned()
            .unwrap_or(Type::Void);
        self.err(
            ErrorKind::SubtypeMismatch {
                expected: expected.clone(),
                found,
            },
            span,
        )
    }

    fn err(&self, kind: ErrorKind, span: Span) -> CompileError {
        CompileError::syntax(&self.filename, kind, span)
    }

    fn internal(&self, message: &str, span: Span) -> CompileError {
        CompileError::internal(&self.filename, message, span)
    }
}

fn numeric_result(raw: &Type) -> Type {
    if is_subtype(&Type::Char, raw) {
        Type::Char
    } else if is_subtype(&Type::Int, raw) {
        Type::Int
    } else {
        Type::Real
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{ResolveError, StructuralExpander};
    use num_bigint::BigInt;
    use num_rational::BigRational;
    use sable_ast::{Parameter, ResolvedType, SkipStmt};
    use sable_ir::value::Value;
    use sable_ir::{span, ModuleId, PackageId, QualifiedName};
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestResolver {
        constants: HashMap<String, Value>,
    }

    impl NameResolver for TestResolver {
        fn resolve_name(
            &self,
            name: &str,
            _imports: &[Import],
        ) -> std::result::Result<QualifiedName, ResolveError> {
            match self.constants.get(name) {
                Some(_) => Ok(QualifiedName::new(test_module(), name)),
                None => Err(ResolveError::new(name)),
            }
        }

        fn resolve_module(
            &self,
            name: &str,
            _imports: &[Import],
        ) -> std::result::Result<ModuleId, ResolveError> {
            Err(ResolveError::new(name))
        }

        fn is_package(&self, _package: &PackageId) -> bool {
            false
        }

        fn constant_value(&self, name: &QualifiedName) -> Option<Value> {
            self.constants.get(&name.name).cloned()
        }
    }

    fn test_module() -> ModuleId {
        ModuleId::new(PackageId::root("test"), "main")
    }

    fn sp() -> Span {
        span(0, 0)
    }

    fn with_propagator<T>(
        resolver: TestResolver,
        f: impl FnOnce(&mut Propagator<'_>) -> T,
    ) -> T {
        let expander = StructuralExpander;
        let config = CompileConfig::default();
        let mut p = Propagator::new(&expander, &resolver, &config);
        p.filename = "test.sable".to_string();
        f(&mut p)
    }

    fn expr(kind: ExprKind) -> Expr {
        Expr::new(sp(), kind)
    }

    fn var(name: &str) -> Expr {
        expr(ExprKind::Variable(name.to_string()))
    }

    fn int_lit(i: i64) -> Expr {
        expr(ExprKind::Constant(Value::int(i)))
    }

    fn real_lit(num: i64, den: i64) -> Expr {
        expr(ExprKind::Constant(Value::rational(BigRational::new(
            BigInt::from(num),
            BigInt::from(den),
        ))))
    }

    fn str_lit(s: &str) -> Expr {
        expr(ExprKind::Constant(Value::string(s)))
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        expr(ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn assign(name: &str, rhs: Expr) -> Stmt {
        Stmt::Assign(AssignStmt {
            span: sp(),
            lhs: var(name),
            rhs,
        })
    }

    fn set_int() -> Type {
        Type::Set(Box::new(Type::Int))
    }

    fn env_with(bindings: &[(&str, Type)]) -> Env {
        let mut env = Env::new();
        for (name, ty) in bindings {
            env = env.put(name.to_string(), TypePair::plain(ty.clone()));
        }
        env
    }

    #[test]
    fn set_addition_retargets_to_union() {
        let env = env_with(&[("x", set_int()), ("y", set_int())]);
        let out = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::Add, var("x"), var("y")), &env)
        })
        .unwrap();
        assert!(matches!(
            out.kind,
            ExprKind::Binary {
                op: BinaryOp::Union,
                ..
            }
        ));
        assert_eq!(out.raw(), Some(&set_int()));
    }

    #[test]
    fn set_subtraction_and_bitand_retarget() {
        let env = env_with(&[("x", set_int()), ("y", set_int())]);
        let diff = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::Sub, var("x"), var("y")), &env)
        })
        .unwrap();
        assert!(matches!(
            diff.kind,
            ExprKind::Binary {
                op: BinaryOp::Difference,
                ..
            }
        ));

        let inter = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::BitAnd, var("x"), var("y")), &env)
        })
        .unwrap();
        assert!(matches!(
            inter.kind,
            ExprKind::Binary {
                op: BinaryOp::Intersection,
                ..
            }
        ));
    }

    #[test]
    fn list_addition_retargets_to_append() {
        let list_int = Type::List(Box::new(Type::Int));
        let env = env_with(&[("x", list_int.clone()), ("y", list_int.clone())]);
        let out = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::Add, var("x"), var("y")), &env)
        })
        .unwrap();
        assert!(matches!(
            out.kind,
            ExprKind::Binary {
                op: BinaryOp::ListAppend,
                ..
            }
        ));
        assert_eq!(out.raw(), Some(&list_int));
    }

    #[test]
    fn string_addition_retargets_to_string_append() {
        let out = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::Add, str_lit("n="), int_lit(1)), &Env::new())
        })
        .unwrap();
        assert!(matches!(
            out.kind,
            ExprKind::Binary {
                op: BinaryOp::StringAppend,
                ..
            }
        ));
        assert_eq!(out.raw(), Some(&Type::String));
    }

    #[test]
    fn arithmetic_picks_the_widening_side() {
        let out = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::Add, int_lit(1), real_lit(1, 2)), &Env::new())
        })
        .unwrap();
        assert_eq!(out.raw(), Some(&Type::Real));

        let out = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::Add, int_lit(1), int_lit(2)), &Env::new())
        })
        .unwrap();
        assert_eq!(out.raw(), Some(&Type::Int));
    }

    #[test]
    fn branch_merge_takes_lub_and_drops_one_sided_bindings() {
        let stmts = vec![Stmt::IfElse(IfElseStmt {
            span: sp(),
            condition: var("c"),
            true_branch: vec![assign("x", int_lit(1)), assign("only_true", int_lit(1))],
            false_branch: vec![assign("x", real_lit(1, 2))],
        })];
        let env = env_with(&[("c", Type::Bool)]);
        let (_, out) = with_propagator(TestResolver::default(), |p| {
            p.propagate_stmts(stmts, env)
        })
        .unwrap();
        assert_eq!(out.get("x"), Some(&TypePair::plain(Type::Real)));
        assert!(!out.contains("only_true"));
    }

    #[test]
    fn loop_fixpoint_widens_int_accumulator_to_real() {
        let fd = FunctionDecl {
            span: sp(),
            name: "loopy".to_string(),
            receiver: None,
            parameters: vec![Parameter {
                span: sp(),
                name: "max".to_string(),
                ty: ResolvedType::plain(sp(), Type::Int),
            }],
            ret: ResolvedType::plain(sp(), Type::Real),
            precondition: None,
            postcondition: None,
            body: vec![
                assign("i", int_lit(0)),
                Stmt::While(WhileStmt {
                    span: sp(),
                    condition: binary(BinaryOp::Lt, var("i"), var("max")),
                    invariant: None,
                    body: vec![assign("i", binary(BinaryOp::Add, var("i"), real_lit(1, 2)))],
                }),
                Stmt::Return(ReturnStmt {
                    span: sp(),
                    expr: Some(var("i")),
                }),
            ],
        };
        let fd = with_propagator(TestResolver::default(), |p| p.propagate_function(fd)).unwrap();

        let Stmt::While(w) = &fd.body[1] else {
            panic!("expected while");
        };
        let ExprKind::Binary { left, .. } = &w.condition.kind else {
            panic!("expected comparison");
        };
        assert_eq!(left.raw(), Some(&Type::Real), "i must widen to real");

        let Stmt::Return(r) = &fd.body[2] else {
            panic!("expected return");
        };
        let returned = r.expr.as_ref().unwrap();
        assert_eq!(returned.raw(), Some(&Type::Real));
    }

    #[test]
    fn non_convergent_loops_hit_the_iteration_ceiling() {
        // A pathological one-iteration ceiling turns ordinary widening into
        // an internal failure instead of further iteration.
        let expander = StructuralExpander;
        let resolver = TestResolver::default();
        let config = CompileConfig {
            loop_fixpoint_limit: 1,
        };
        let mut p = Propagator::new(&expander, &resolver, &config);
        p.filename = "test.sable".to_string();
        p.ret = Some(TypePair::plain(Type::Real));

        let body = vec![assign("i", binary(BinaryOp::Add, var("i"), real_lit(1, 2)))];
        let env = env_with(&[("i", Type::Int)]);
        let err = p.fixpoint(&body, env, sp()).unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    #[test]
    fn debug_argument_must_be_string() {
        let stmt = Stmt::Debug(DebugStmt {
            span: sp(),
            expr: int_lit(7),
        });
        let err = with_propagator(TestResolver::default(), |p| {
            p.propagate_stmt(stmt, Env::new())
        })
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(ErrorKind::SubtypeMismatch { .. })
        ));
    }

    #[test]
    fn while_condition_must_be_boolean() {
        let stmt = Stmt::While(WhileStmt {
            span: sp(),
            condition: int_lit(1),
            invariant: None,
            body: vec![Stmt::Skip(SkipStmt { span: sp() })],
        });
        let err = with_propagator(TestResolver::default(), |p| {
            p.propagate_stmt(stmt, Env::new())
        })
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(ErrorKind::SubtypeMismatch { .. })
        ));
    }

    #[test]
    fn for_loop_rejects_rebinding_an_existing_variable() {
        let stmt = Stmt::For(ForStmt {
            span: sp(),
            variables: vec!["x".to_string()],
            source: var("xs"),
            invariant: None,
            body: vec![],
        });
        let env = env_with(&[("x", Type::Int), ("xs", Type::List(Box::new(Type::Int)))]);
        let err = with_propagator(TestResolver::default(), |p| {
            p.propagate_stmt(stmt, env)
        })
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(ErrorKind::VariableAlreadyDefined(name)) if name == "x"
        ));
    }

    #[test]
    fn for_loop_variables_are_scoped_to_the_loop() {
        let stmt = Stmt::For(ForStmt {
            span: sp(),
            variables: vec!["x".to_string()],
            source: var("xs"),
            invariant: None,
            body: vec![assign("seen", var("x"))],
        });
        let env = env_with(&[("xs", Type::List(Box::new(Type::Int)))]);
        let (_, out) = with_propagator(TestResolver::default(), |p| {
            p.propagate_stmt(stmt, env)
        })
        .unwrap();
        assert!(!out.contains("x"));
        assert_eq!(out.get("seen"), Some(&TypePair::plain(Type::Int)));
    }

    #[test]
    fn unresolved_identifiers_try_constants_before_failing() {
        let mut resolver = TestResolver::default();
        resolver.constants.insert("LIMIT".to_string(), Value::int(100));
        let out = with_propagator(resolver, |p| p.propagate_expr(var("LIMIT"), &Env::new()))
            .unwrap();
        assert!(matches!(
            out.kind,
            ExprKind::ConstantAccess { value: Some(_), .. }
        ));
        assert_eq!(out.raw(), Some(&Type::Int));

        let err = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(var("nope"), &Env::new())
        })
        .unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::UnknownVariable)));
    }

    #[test]
    fn return_becomes_bottom_and_absorbs_into_joins() {
        let stmts = vec![Stmt::IfElse(IfElseStmt {
            span: sp(),
            condition: var("c"),
            true_branch: vec![Stmt::Return(ReturnStmt {
                span: sp(),
                expr: Some(int_lit(1)),
            })],
            false_branch: vec![assign("x", int_lit(2))],
        })];
        let env = env_with(&[("c", Type::Bool)]);
        let (_, out) = with_propagator(TestResolver::default(), |p| {
            p.ret = Some(TypePair::plain(Type::Int));
            p.propagate_stmts(stmts, env)
        })
        .unwrap();
        // Only the else path reaches the join, so its binding survives.
        assert_eq!(out.get("x"), Some(&TypePair::plain(Type::Int)));
    }

    #[test]
    fn null_comparison_types_against_optional_unions() {
        let optional = Type::Union(vec![Type::Int, Type::Null]);
        let env = env_with(&[("x", optional)]);
        let out = with_propagator(TestResolver::default(), |p| {
            p.propagate_expr(binary(BinaryOp::Eq, var("x"), expr(ExprKind::Null)), &env)
        })
        .unwrap();
        assert_eq!(out.raw(), Some(&Type::Bool));
    }
}
