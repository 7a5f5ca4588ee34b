//! Compilation: AST to an immutable, shareable render unit.
//!
//! The compiler lowers statements into `Step`s (bodies behind `Arc` so
//! macros and recursive loops can re-enter them), folds constant
//! expressions, merges adjacent literal output, prunes statically decided
//! branches, validates filter/test names against the environment
//! registries, enforces the macro parameter-default ordering rule, and
//! collects the template's block table and module exports.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::{Arg, BinOp, Expr, FilterCall, Param, SetSource, Stmt, UnaryOp};
use crate::environment::Environment;
use crate::error::{MoltenError, MoltenResult};
use crate::eval::apply_bin_op;
use crate::value::{Value, html_escape};

pub(crate) type Body = Arc<[Step]>;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Literal output, already escaped where that could be decided.
    Emit(Arc<str>),
    Output {
        expr: Expr,
        line: u32,
    },
    If {
        arms: Vec<(Expr, Body)>,
        otherwise: Option<Body>,
    },
    For(Arc<ForStep>),
    SetExpr {
        target: String,
        value: Expr,
    },
    SetBlock {
        target: String,
        body: Body,
    },
    FilterBlock {
        filters: Vec<FilterCall>,
        body: Body,
    },
    Macro(Arc<MacroDecl>),
    CallBlock(Arc<CallBlockStep>),
    /// Rendered through the block table so inheritance can override it.
    Block {
        name: String,
    },
    Include {
        name: Expr,
        line: u32,
    },
    Import {
        template: String,
        names: Vec<(String, String)>,
        line: u32,
    },
}

#[derive(Debug)]
pub(crate) struct ForStep {
    pub targets: Vec<String>,
    pub iter: Expr,
    pub filter: Option<Expr>,
    pub recursive: bool,
    pub body: Body,
    pub otherwise: Option<Body>,
    pub line: u32,
}

#[derive(Debug)]
pub(crate) struct MacroDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Body,
    /// Whether the body refers to `caller`, `varargs` or `kwargs`; extra
    /// arguments are only collected when the macro catches them.
    pub accepts_caller: bool,
    pub catch_varargs: bool,
    pub catch_kwargs: bool,
    pub line: u32,
}

#[derive(Debug)]
pub(crate) struct CallBlockStep {
    pub params: Vec<Param>,
    pub callee: Expr,
    pub args: Vec<Arg>,
    pub body: Body,
    pub line: u32,
}

/// The compiled, reusable form of one template. Opaque outside the
/// crate; it holds no per-render state, so one unit may serve many
/// concurrent renders.
#[derive(Debug)]
pub struct RenderUnit {
    pub(crate) root: Body,
    pub(crate) blocks: BTreeMap<String, Body>,
    /// Top-level set targets and macro names, in source order.
    pub(crate) exports: Vec<String>,
    pub(crate) macros: BTreeMap<String, Arc<MacroDecl>>,
    pub(crate) extends: Option<String>,
}

pub(crate) fn compile(body: Vec<Stmt>, env: &Environment) -> MoltenResult<RenderUnit> {
    let mut compiler = Compiler {
        env,
        blocks: BTreeMap::new(),
        macros: BTreeMap::new(),
        exports: Vec::new(),
        extends: None,
    };
    let root = compiler.compile_body(body, true)?;
    Ok(RenderUnit {
        root,
        blocks: compiler.blocks,
        exports: compiler.exports,
        macros: compiler.macros,
        extends: compiler.extends,
    })
}

struct Compiler<'env> {
    env: &'env Environment,
    blocks: BTreeMap<String, Body>,
    macros: BTreeMap<String, Arc<MacroDecl>>,
    exports: Vec<String>,
    extends: Option<String>,
}

impl Compiler<'_> {
    fn compile_body(&mut self, body: Vec<Stmt>, top_level: bool) -> MoltenResult<Body> {
        let mut steps = Vec::new();
        for stmt in body {
            self.compile_stmt(stmt, top_level, &mut steps)?;
        }
        Ok(steps.into())
    }

    fn compile_stmt(
        &mut self,
        stmt: Stmt,
        top_level: bool,
        out: &mut Vec<Step>,
    ) -> MoltenResult<()> {
        match stmt {
            Stmt::Text(text) => push_emit(out, &text),
            Stmt::Output { expr, line } => {
                let expr = self.fold_expr(expr)?;
                if let Expr::Const(value) = &expr {
                    if !value.is_undefined() {
                        let rendered = if self.env.autoescape() && !value.is_safe() {
                            html_escape(&value.display())
                        } else {
                            value.display()
                        };
                        push_emit(out, &rendered);
                        return Ok(());
                    }
                }
                out.push(Step::Output { expr, line });
            }
            Stmt::If {
                arms, otherwise, ..
            } => {
                let mut compiled: Vec<(Expr, Body)> = Vec::new();
                let mut tail: Option<Vec<Stmt>> = otherwise;
                for (cond, body) in arms {
                    match self.fold_expr(cond)? {
                        Expr::Const(v) if !v.truthy() => {}
                        Expr::Const(_) => {
                            tail = Some(body);
                            break;
                        }
                        cond => {
                            // `if` bodies share the enclosing frame, so
                            // the export rule flows through them.
                            compiled.push((cond, self.compile_body(body, top_level)?));
                        }
                    }
                }
                if compiled.is_empty() {
                    if let Some(body) = tail {
                        for stmt in body {
                            self.compile_stmt(stmt, top_level, out)?;
                        }
                    }
                } else {
                    let otherwise = match tail {
                        Some(body) => Some(self.compile_body(body, top_level)?),
                        None => None,
                    };
                    out.push(Step::If {
                        arms: compiled,
                        otherwise,
                    });
                }
            }
            Stmt::For(stmt) => {
                let body = self.compile_body(stmt.body, false)?;
                let otherwise = match stmt.otherwise {
                    Some(body) => Some(self.compile_body(body, false)?),
                    None => None,
                };
                out.push(Step::For(Arc::new(ForStep {
                    targets: stmt.targets,
                    iter: self.fold_expr(stmt.iter)?,
                    filter: stmt.filter.map(|f| self.fold_expr(f)).transpose()?,
                    recursive: stmt.recursive,
                    body,
                    otherwise,
                    line: stmt.line,
                })));
            }
            Stmt::Set(stmt) => {
                if top_level {
                    self.export(&stmt.target);
                }
                match stmt.source {
                    SetSource::Expr(value) => out.push(Step::SetExpr {
                        target: stmt.target,
                        value: self.fold_expr(value)?,
                    }),
                    SetSource::Block(body) => out.push(Step::SetBlock {
                        target: stmt.target,
                        body: self.compile_body(body, false)?,
                    }),
                }
            }
            Stmt::FilterBlock {
                filters,
                body,
                line: _,
            } => {
                let filters = filters
                    .into_iter()
                    .map(|f| self.fold_filter_call(f))
                    .collect::<MoltenResult<Vec<_>>>()?;
                out.push(Step::FilterBlock {
                    filters,
                    body: self.compile_body(body, false)?,
                });
            }
            Stmt::Macro(stmt) => {
                self.check_param_order(&stmt.params, stmt.line, &stmt.name)?;
                let accepts_caller = references(&stmt.body, "caller");
                let catch_varargs = references(&stmt.body, "varargs");
                let catch_kwargs = references(&stmt.body, "kwargs");
                let params = stmt
                    .params
                    .into_iter()
                    .map(|p| {
                        Ok(Param {
                            name: p.name,
                            default: p.default.map(|d| self.fold_expr(d)).transpose()?,
                        })
                    })
                    .collect::<MoltenResult<Vec<_>>>()?;
                let decl = Arc::new(MacroDecl {
                    name: stmt.name.clone(),
                    params,
                    body: self.compile_body(stmt.body, false)?,
                    accepts_caller,
                    catch_varargs,
                    catch_kwargs,
                    line: stmt.line,
                });
                if top_level {
                    self.export(&stmt.name);
                    self.macros.insert(stmt.name, Arc::clone(&decl));
                }
                out.push(Step::Macro(decl));
            }
            Stmt::CallBlock {
                params,
                callee,
                args,
                body,
                line,
            } => {
                self.check_param_order(&params, line, "call")?;
                out.push(Step::CallBlock(Arc::new(CallBlockStep {
                    params,
                    callee: self.fold_expr(callee)?,
                    args: self.fold_args(args)?,
                    body: self.compile_body(body, false)?,
                    line,
                })));
            }
            Stmt::Block { name, body, line } => {
                let body = self.compile_body(body, false)?;
                if self.blocks.insert(name.clone(), body).is_some() {
                    return Err(MoltenError::assertion(
                        line,
                        format!("block '{name}' defined twice"),
                    ));
                }
                out.push(Step::Block { name });
            }
            Stmt::Extends { name, line } => {
                if self.extends.is_some() {
                    return Err(MoltenError::assertion(line, "multiple 'extends' tags"));
                }
                self.extends = Some(name);
            }
            Stmt::Include { name, line } => {
                out.push(Step::Include {
                    name: self.fold_expr(name)?,
                    line,
                });
            }
            Stmt::Import {
                template,
                names,
                line,
            } => {
                out.push(Step::Import {
                    template,
                    names,
                    line,
                });
            }
        }
        Ok(())
    }

    fn export(&mut self, name: &str) {
        if !self.exports.iter().any(|n| n == name) {
            self.exports.push(name.to_string());
        }
    }

    fn check_param_order(&self, params: &[Param], line: u32, owner: &str) -> MoltenResult<()> {
        let mut seen_default = false;
        for param in params {
            if param.default.is_some() {
                seen_default = true;
            } else if seen_default {
                return Err(MoltenError::assertion(
                    line,
                    format!(
                        "'{owner}': non-default parameter '{}' follows a default parameter",
                        param.name
                    ),
                ));
            }
        }
        Ok(())
    }

    fn fold_args(&self, args: Vec<Arg>) -> MoltenResult<Vec<Arg>> {
        args.into_iter()
            .map(|arg| {
                Ok(match arg {
                    Arg::Pos(e) => Arg::Pos(self.fold_expr(e)?),
                    Arg::Splat(e) => Arg::Splat(self.fold_expr(e)?),
                    Arg::Kw(name, e) => Arg::Kw(name, self.fold_expr(e)?),
                })
            })
            .collect()
    }

    fn fold_filter_call(&self, call: FilterCall) -> MoltenResult<FilterCall> {
        if !self.env.has_filter(&call.name) {
            return Err(self.env.unknown_filter(&call.name, call.line));
        }
        Ok(FilterCall {
            name: call.name,
            args: self.fold_args(call.args)?,
            line: call.line,
        })
    }

    /// Recursively folds constant subexpressions and validates every
    /// statically named filter and test. Operations that would fail are
    /// left in place so the error surfaces at render time.
    fn fold_expr(&self, expr: Expr) -> MoltenResult<Expr> {
        Ok(match expr {
            Expr::Const(_) | Expr::Name { .. } => expr,
            Expr::List { items, line } => {
                let items = items
                    .into_iter()
                    .map(|e| self.fold_expr(e))
                    .collect::<MoltenResult<Vec<_>>>()?;
                if items.iter().all(|e| matches!(e, Expr::Const(_))) {
                    let values = items
                        .into_iter()
                        .filter_map(|e| match e {
                            Expr::Const(v) => Some(v),
                            _ => None,
                        })
                        .collect();
                    Expr::Const(values)
                } else {
                    Expr::List { items, line }
                }
            }
            Expr::MapLit { entries, line } => {
                let entries = entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.fold_expr(k)?, self.fold_expr(v)?)))
                    .collect::<MoltenResult<Vec<_>>>()?;
                let constant = entries.iter().all(|(k, v)| {
                    matches!((k, v), (Expr::Const(key), Expr::Const(_)) if key.as_str().is_some())
                });
                if constant {
                    let map = entries
                        .into_iter()
                        .filter_map(|(k, v)| match (k, v) {
                            (Expr::Const(key), Expr::Const(value)) => {
                                key.as_str().map(|s| (s.to_string(), value))
                            }
                            _ => None,
                        })
                        .collect();
                    Expr::Const(map)
                } else {
                    Expr::MapLit { entries, line }
                }
            }
            Expr::Getattr { base, name, line } => Expr::Getattr {
                base: Box::new(self.fold_expr(*base)?),
                name,
                line,
            },
            Expr::Getitem { base, index, line } => Expr::Getitem {
                base: Box::new(self.fold_expr(*base)?),
                index: Box::new(self.fold_expr(*index)?),
                line,
            },
            Expr::Call { callee, args, line } => Expr::Call {
                callee: Box::new(self.fold_expr(*callee)?),
                args: self.fold_args(args)?,
                line,
            },
            Expr::Filter { base, call } => Expr::Filter {
                base: Box::new(self.fold_expr(*base)?),
                call: self.fold_filter_call(call)?,
            },
            Expr::Test {
                base,
                name,
                args,
                negated,
                line,
            } => {
                if !self.env.has_test(&name) {
                    return Err(self.env.unknown_test(&name, line));
                }
                Expr::Test {
                    base: Box::new(self.fold_expr(*base)?),
                    name,
                    args: self.fold_args(args)?,
                    negated,
                    line,
                }
            }
            Expr::BinOp { op, lhs, rhs, line } => {
                let lhs = self.fold_expr(*lhs)?;
                let rhs = self.fold_expr(*rhs)?;
                if let (Expr::Const(a), Expr::Const(b)) = (&lhs, &rhs) {
                    let folded = match op {
                        BinOp::And => Some(if a.truthy() { b.clone() } else { a.clone() }),
                        BinOp::Or => Some(if a.truthy() { a.clone() } else { b.clone() }),
                        _ => apply_bin_op(op, a, b, self.env.autoescape()).ok(),
                    };
                    if let Some(value) = folded {
                        return Ok(Expr::Const(value));
                    }
                }
                Expr::BinOp {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    line,
                }
            }
            Expr::UnaryOp { op, expr, line } => {
                let expr = self.fold_expr(*expr)?;
                if let Expr::Const(v) = &expr {
                    match op {
                        UnaryOp::Not => return Ok(Expr::Const(Value::Bool(!v.truthy()))),
                        UnaryOp::Neg => {
                            if let Ok(value) = crate::value::neg(v) {
                                return Ok(Expr::Const(value));
                            }
                        }
                    }
                }
                Expr::UnaryOp {
                    op,
                    expr: Box::new(expr),
                    line,
                }
            }
            Expr::Cond {
                then,
                test,
                otherwise,
                line,
            } => {
                let test = self.fold_expr(*test)?;
                if let Expr::Const(v) = &test {
                    return if v.truthy() {
                        self.fold_expr(*then)
                    } else {
                        match otherwise {
                            Some(e) => self.fold_expr(*e),
                            None => Ok(Expr::Const(Value::Undefined)),
                        }
                    };
                }
                Expr::Cond {
                    then: Box::new(self.fold_expr(*then)?),
                    test: Box::new(test),
                    otherwise: otherwise
                        .map(|e| self.fold_expr(*e).map(Box::new))
                        .transpose()?,
                    line,
                }
            }
        })
    }
}

fn push_emit(out: &mut Vec<Step>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Step::Emit(prev)) = out.last_mut() {
        let merged = format!("{prev}{text}");
        *prev = Arc::from(merged.as_str());
        return;
    }
    out.push(Step::Emit(Arc::from(text)));
}

/// Whether any statement in `body` reads `name`, ignoring nested macro
/// bodies, which resolve the name against their own call frame.
fn references(body: &[Stmt], name: &str) -> bool {
    body.iter().any(|stmt| stmt_references(stmt, name))
}

fn stmt_references(stmt: &Stmt, name: &str) -> bool {
    match stmt {
        Stmt::Text(_) => false,
        Stmt::Output { expr, .. } | Stmt::Include { name: expr, .. } => {
            expr_references(expr, name)
        }
        Stmt::If {
            arms, otherwise, ..
        } => {
            arms.iter()
                .any(|(cond, body)| expr_references(cond, name) || references(body, name))
                || otherwise.as_deref().is_some_and(|b| references(b, name))
        }
        Stmt::For(stmt) => {
            expr_references(&stmt.iter, name)
                || stmt
                    .filter
                    .as_ref()
                    .is_some_and(|f| expr_references(f, name))
                || references(&stmt.body, name)
                || stmt.otherwise.as_deref().is_some_and(|b| references(b, name))
        }
        Stmt::Set(stmt) => match &stmt.source {
            SetSource::Expr(expr) => expr_references(expr, name),
            SetSource::Block(body) => references(body, name),
        },
        Stmt::FilterBlock { filters, body, .. } => {
            filters.iter().any(|f| args_reference(&f.args, name)) || references(body, name)
        }
        Stmt::Macro(_) => false,
        Stmt::CallBlock {
            callee, args, body, ..
        } => {
            expr_references(callee, name)
                || args_reference(args, name)
                || references(body, name)
        }
        Stmt::Block { body, .. } => references(body, name),
        Stmt::Extends { .. } | Stmt::Import { .. } => false,
    }
}

fn args_reference(args: &[Arg], name: &str) -> bool {
    args.iter().any(|arg| match arg {
        Arg::Pos(e) | Arg::Splat(e) | Arg::Kw(_, e) => expr_references(e, name),
    })
}

fn expr_references(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Const(_) => false,
        Expr::Name { name: n, .. } => n == name,
        Expr::List { items, .. } => items.iter().any(|e| expr_references(e, name)),
        Expr::MapLit { entries, .. } => entries
            .iter()
            .any(|(k, v)| expr_references(k, name) || expr_references(v, name)),
        Expr::Getattr { base, .. } => expr_references(base, name),
        Expr::Getitem { base, index, .. } => {
            expr_references(base, name) || expr_references(index, name)
        }
        Expr::Call { callee, args, .. } => {
            expr_references(callee, name) || args_reference(args, name)
        }
        Expr::Filter { base, call } => {
            expr_references(base, name) || args_reference(&call.args, name)
        }
        Expr::Test { base, args, .. } => {
            expr_references(base, name) || args_reference(args, name)
        }
        Expr::BinOp { lhs, rhs, .. } => expr_references(lhs, name) || expr_references(rhs, name),
        Expr::UnaryOp { expr, .. } => expr_references(expr, name),
        Expr::Cond {
            then,
            test,
            otherwise,
            ..
        } => {
            expr_references(then, name)
                || expr_references(test, name)
                || otherwise.as_deref().is_some_and(|e| expr_references(e, name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::LexerOptions;
    use crate::parser::parse;

    fn unit(source: &str) -> RenderUnit {
        let env = Environment::new();
        compile(parse(source, LexerOptions::default()).unwrap(), &env).unwrap()
    }

    fn unit_err(source: &str) -> MoltenError {
        let env = Environment::new();
        compile(parse(source, LexerOptions::default()).unwrap(), &env).unwrap_err()
    }

    #[test]
    #[ntest::timeout(100)]
    fn constant_output_folds_into_literal_text() {
        let unit = unit("a{{ 1 + 2 }}b{{ 'c' }}");
        assert_eq!(unit.root.len(), 1);
        assert!(matches!(&unit.root[0], Step::Emit(t) if t.as_ref() == "a3bc"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn autoescape_applies_to_folded_output() {
        let mut env = Environment::new();
        env.set_autoescape(true);
        let unit = compile(
            parse("{{ '<b>' }}", LexerOptions::default()).unwrap(),
            &env,
        )
        .unwrap();
        assert!(matches!(&unit.root[0], Step::Emit(t) if t.as_ref() == "&lt;b&gt;"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn statically_false_branches_are_pruned() {
        let negative = unit("{% if 0 %}A{% else %}B{% endif %}");
        assert!(matches!(&negative.root[0], Step::Emit(t) if t.as_ref() == "B"));

        let empty = unit("{% if [] %}A{% endif %}done");
        assert!(matches!(&empty.root[0], Step::Emit(t) if t.as_ref() == "done"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn dynamic_conditions_survive() {
        let unit = unit("{% if x %}A{% endif %}");
        assert!(matches!(&unit.root[0], Step::If { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn unknown_filter_is_a_compile_time_assertion() {
        let err = unit_err("{{ x | no_such_filter }}");
        assert!(matches!(err, MoltenError::Assertion { .. }));
        assert!(err.to_string().contains("no_such_filter"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn unknown_test_is_a_compile_time_assertion() {
        let err = unit_err("{{ x is mysterious }}");
        assert!(matches!(err, MoltenError::Assertion { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn default_ordering_rule_for_macros_and_call_blocks() {
        let err = unit_err("{% macro m(a, b='x', c) %}{% endmacro %}");
        assert!(matches!(err, MoltenError::Assertion { .. }));
        assert!(err.to_string().contains("'c'"));

        let err = unit_err("{% macro m() %}{% endmacro %}{% call(a=1, b) m() %}{% endcall %}");
        assert!(matches!(err, MoltenError::Assertion { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn macro_flags_come_from_body_references() {
        let unit = unit(
            "{% macro m(a) %}{{ varargs | join: ',' }}{{ caller() }}{% endmacro %}\
             {% macro n() %}{{ kwargs }}{% endmacro %}",
        );
        let m = unit.macros.get("m").unwrap();
        assert!(m.catch_varargs);
        assert!(m.accepts_caller);
        assert!(!m.catch_kwargs);
        let n = unit.macros.get("n").unwrap();
        assert!(n.catch_kwargs);
        assert!(!n.accepts_caller);
    }

    #[test]
    #[ntest::timeout(100)]
    fn exports_cover_top_level_sets_and_macros_through_if() {
        let unit = unit(
            "{% set a = 1 %}{% macro b() %}{% endmacro %}\
             {% if x %}{% set c = 2 %}{% endif %}\
             {% for i in xs %}{% set hidden = i %}{% endfor %}",
        );
        assert_eq!(unit.exports, vec!["a", "b", "c"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn blocks_and_extends_are_collected() {
        let unit = unit("{% extends \"base\" %}{% block body %}hi{% endblock %}");
        assert_eq!(unit.extends.as_deref(), Some("base"));
        assert!(unit.blocks.contains_key("body"));

        let err = unit_err("{% block a %}{% endblock %}{% block a %}{% endblock %}");
        assert!(matches!(err, MoltenError::Assertion { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn failing_constant_operations_are_deferred_to_render() {
        let unit = unit("{{ 1 / 0 }}");
        assert!(matches!(&unit.root[0], Step::Output { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn constant_collections_fold() {
        let list = unit("{{ [1, 2, 3] }}");
        assert!(matches!(&list.root[0], Step::Emit(t) if t.as_ref() == "[1, 2, 3]"));
        let map = unit("{{ {'a': 1} }}");
        assert!(matches!(&map.root[0], Step::Emit(t) if t.as_ref() == "{'a': 1}"));
    }
}
