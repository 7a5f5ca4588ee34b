//! Expression evaluation.
//!
//! Runs on the renderer so macro calls, `super()` and recursive loop
//! re-entry can happen in the middle of an expression. The sandbox
//! policy, when set, is consulted on every attribute access, subscript
//! and call.

use std::sync::Arc;

use crate::ast::{Arg, BinOp, Expr, FilterCall, UnaryOp};
use crate::error::{MoltenError, MoltenResult};
use crate::registry::FilterFn;
use crate::runtime::{LoopValue, Renderer, loop_cycle_fn};
use crate::value::{self, Value};

impl Renderer<'_> {
    pub(crate) fn eval_expr(&mut self, expr: &Expr) -> MoltenResult<Value> {
        match expr {
            Expr::Const(value) => Ok(value.clone()),
            Expr::Name { name, .. } => Ok(self
                .frames
                .get(name)
                .cloned()
                .or_else(|| self.env.global(name))
                .unwrap_or_default()),
            Expr::List { items, .. } => items.iter().map(|e| self.eval_expr(e)).collect(),
            Expr::MapLit { entries, line } => entries
                .iter()
                .map(|(key, value)| {
                    let key = self.eval_expr(key)?;
                    let Some(key) = key.as_str() else {
                        return Err(MoltenError::runtime(format!(
                            "map keys must be strings, found {} (line {line})",
                            key.kind_name()
                        )));
                    };
                    Ok((key.to_string(), self.eval_expr(value)?))
                })
                .collect(),
            Expr::Getattr { base, name, line } => {
                let base = self.eval_expr(base)?;
                self.get_attr(&base, name, *line)
            }
            Expr::Getitem { base, index, line } => {
                let base = self.eval_expr(base)?;
                let index = self.eval_expr(index)?;
                self.get_item(&base, &index, *line)
            }
            Expr::Call { callee, args, line } => self.eval_call(callee, args, *line),
            Expr::Filter { base, call } => {
                let base = self.eval_expr(base)?;
                self.apply_filter(base, call)
            }
            Expr::Test {
                base,
                name,
                args,
                negated,
                line,
            } => {
                let base = self.eval_expr(base)?;
                let (args, kwargs) = self.eval_args(args)?;
                let env = self.env;
                let Some(test) = env.test(name) else {
                    return Err(env.unknown_test(name, *line));
                };
                let passed = test(&base, &args, &kwargs)?;
                Ok(Value::Bool(passed != *negated))
            }
            Expr::BinOp { op, lhs, rhs, line } => match op {
                BinOp::And => {
                    let lhs = self.eval_expr(lhs)?;
                    if self.check_condition(&lhs, *line)? {
                        self.eval_expr(rhs)
                    } else {
                        Ok(lhs)
                    }
                }
                BinOp::Or => {
                    let lhs = self.eval_expr(lhs)?;
                    if self.check_condition(&lhs, *line)? {
                        Ok(lhs)
                    } else {
                        self.eval_expr(rhs)
                    }
                }
                _ => {
                    let a = self.eval_expr(lhs)?;
                    let b = self.eval_expr(rhs)?;
                    let arithmetic = matches!(
                        op,
                        BinOp::Add
                            | BinOp::Sub
                            | BinOp::Mul
                            | BinOp::Div
                            | BinOp::FloorDiv
                            | BinOp::Rem
                            | BinOp::Pow
                    );
                    if arithmetic && (a.is_undefined() || b.is_undefined()) {
                        return Err(MoltenError::undefined(format!(
                            "arithmetic on an undefined value (line {line})"
                        )));
                    }
                    if matches!(op, BinOp::Concat)
                        && (a.is_undefined() || b.is_undefined())
                        && self.strict()
                    {
                        return Err(MoltenError::undefined(format!(
                            "string conversion of an undefined value (line {line})"
                        )));
                    }
                    apply_bin_op(*op, &a, &b, self.env.autoescape())
                }
            },
            Expr::UnaryOp { op, expr, line } => {
                let value = self.eval_expr(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!self.check_condition(&value, *line)?)),
                    UnaryOp::Neg => {
                        if value.is_undefined() {
                            return Err(MoltenError::undefined(format!(
                                "arithmetic on an undefined value (line {line})"
                            )));
                        }
                        value::neg(&value)
                    }
                }
            }
            Expr::Cond {
                then,
                test,
                otherwise,
                line,
            } => {
                let picked = self.eval_expr(test)?;
                if self.check_condition(&picked, *line)? {
                    self.eval_expr(then)
                } else {
                    match otherwise {
                        Some(expr) => self.eval_expr(expr),
                        None => Ok(Value::Undefined),
                    }
                }
            }
        }
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Arg], line: u32) -> MoltenResult<Value> {
        let value = self.eval_expr(callee)?;
        if value.is_undefined() {
            let message = match callee {
                Expr::Name { name, .. } => {
                    format!("'{name}' is undefined (line {line})")
                }
                _ => format!("called an undefined value (line {line})"),
            };
            return Err(MoltenError::undefined(message));
        }
        if let Some(policy) = self.env.sandbox() {
            if !policy.is_safe_call(&value) {
                return Err(MoltenError::security(format!(
                    "call of {} denied (line {line})",
                    value.kind_name()
                )));
            }
        }
        match &value {
            Value::Macro(mac) => {
                let mac = Arc::clone(mac);
                let (args, kwargs) = self.eval_args(args)?;
                self.call_macro(&mac, args, kwargs, None, line)
            }
            Value::Func(func) => {
                let func = Arc::clone(func);
                let (args, kwargs) = self.eval_args(args)?;
                func.call(&args, &kwargs)
            }
            Value::Loop(control) => {
                let control = Arc::clone(control);
                let (mut args, kwargs) = self.eval_args(args)?;
                if args.len() != 1 || !kwargs.is_empty() {
                    return Err(MoltenError::runtime(format!(
                        "a recursive loop takes exactly one argument (line {line})"
                    )));
                }
                let items = args.remove(0);
                self.recurse_loop(&control, items)
            }
            Value::Super(handle) => {
                if !args.is_empty() {
                    return Err(MoltenError::runtime(format!(
                        "super() takes no arguments (line {line})"
                    )));
                }
                let handle = Arc::clone(handle);
                self.call_super(&handle)
            }
            other => Err(MoltenError::runtime(format!(
                "{} is not callable (line {line})",
                other.kind_name()
            ))),
        }
    }

    pub(crate) fn eval_args(
        &mut self,
        args: &[Arg],
    ) -> MoltenResult<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut keyword = Vec::new();
        for arg in args {
            match arg {
                Arg::Pos(expr) => positional.push(self.eval_expr(expr)?),
                Arg::Splat(expr) => {
                    let value = self.eval_expr(expr)?;
                    positional.extend(value.try_iter()?);
                }
                Arg::Kw(name, expr) => keyword.push((name.clone(), self.eval_expr(expr)?)),
            }
        }
        Ok((positional, keyword))
    }

    pub(crate) fn apply_filter(&mut self, value: Value, call: &FilterCall) -> MoltenResult<Value> {
        let (args, kwargs) = self.eval_args(&call.args)?;
        let env = self.env;
        let Some(filter) = env.filter(&call.name) else {
            return Err(env.unknown_filter(&call.name, call.line));
        };
        match filter {
            FilterFn::Plain(f) => f(&value, &args, &kwargs),
            FilterFn::Contextual(f) => f(env, &value, &args, &kwargs),
        }
    }

    pub(crate) fn get_attr(&self, base: &Value, name: &str, line: u32) -> MoltenResult<Value> {
        if let Some(policy) = self.env.sandbox() {
            if !policy.is_safe_attribute(base, name) {
                return Err(MoltenError::security(format!(
                    "access to attribute '{name}' of {} denied (line {line})",
                    base.kind_name()
                )));
            }
        }
        match base {
            Value::Undefined => Err(MoltenError::undefined(format!(
                "attribute '{name}' of an undefined value (line {line})"
            ))),
            Value::Map(map) => Ok(map.get(name).cloned().unwrap_or_default()),
            Value::Loop(control) => Ok(loop_attr(control, name)),
            Value::Macro(mac) => Ok(match name {
                "name" => Value::from(mac.name()),
                _ => Value::Undefined,
            }),
            _ => Ok(Value::Undefined),
        }
    }

    pub(crate) fn get_item(
        &self,
        base: &Value,
        index: &Value,
        line: u32,
    ) -> MoltenResult<Value> {
        if let Some(policy) = self.env.sandbox() {
            // Non-string subscripts are presented in their display form,
            // so a policy sees "0" for integer indexing.
            let key = index
                .as_str()
                .map_or_else(|| index.display(), str::to_string);
            if !policy.is_safe_attribute(base, &key) {
                return Err(MoltenError::security(format!(
                    "access to item '{key}' of {} denied (line {line})",
                    base.kind_name()
                )));
            }
        }
        match (base, index) {
            (Value::Undefined, _) => Err(MoltenError::undefined(format!(
                "subscript of an undefined value (line {line})"
            ))),
            (Value::Seq(items), Value::Int(i)) => Ok(seq_index(items, *i)),
            (Value::Str(s) | Value::Safe(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = normalize_index(*i, chars.len()).and_then(|n| chars.get(n));
                Ok(match picked {
                    Some(c) => Value::from(c.to_string()),
                    None => Value::Undefined,
                })
            }
            (Value::Map(map), _) => Ok(match index.as_str() {
                Some(key) => map.get(key).cloned().unwrap_or_default(),
                None => Value::Undefined,
            }),
            (Value::Loop(control), _) => Ok(match index.as_str() {
                Some(name) => loop_attr(control, name),
                None => Value::Undefined,
            }),
            (Value::Seq(_) | Value::Str(_) | Value::Safe(_), other) => {
                Err(MoltenError::runtime(format!(
                    "indices must be integers, found {} (line {line})",
                    other.kind_name()
                )))
            }
            (other, _) => Err(MoltenError::runtime(format!(
                "{} is not subscriptable (line {line})",
                other.kind_name()
            ))),
        }
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    if index < 0 {
        let back = usize::try_from(-i128::from(index)).ok()?;
        len.checked_sub(back)
    } else {
        usize::try_from(index).ok()
    }
}

fn seq_index(items: &[Value], index: i64) -> Value {
    normalize_index(index, items.len())
        .and_then(|n| items.get(n))
        .cloned()
        .unwrap_or_default()
}

fn loop_attr(control: &LoopValue, name: &str) -> Value {
    match name {
        "index" => Value::from(control.index0 + 1),
        "index0" => Value::from(control.index0),
        "rindex" => Value::from(control.length - control.index0),
        "rindex0" => Value::from(control.length - control.index0 - 1),
        "first" => Value::Bool(control.index0 == 0),
        "last" => Value::Bool(control.index0 + 1 == control.length),
        "length" => Value::from(control.length),
        "depth" => Value::from(control.depth0 + 1),
        "depth0" => Value::from(control.depth0),
        "cycle" => loop_cycle_fn(control),
        _ => Value::Undefined,
    }
}

/// Applies one non-lazy binary operator. `and`/`or` are included for
/// constant folding, the evaluator short-circuits them itself.
pub(crate) fn apply_bin_op(
    op: BinOp,
    a: &Value,
    b: &Value,
    autoescape: bool,
) -> MoltenResult<Value> {
    use std::cmp::Ordering;
    Ok(match op {
        BinOp::Add => value::add(a, b, autoescape)?,
        BinOp::Sub => value::sub(a, b)?,
        BinOp::Mul => value::mul(a, b)?,
        BinOp::Div => value::div(a, b)?,
        BinOp::FloorDiv => value::floor_div(a, b)?,
        BinOp::Rem => value::rem(a, b)?,
        BinOp::Pow => value::pow(a, b)?,
        BinOp::Concat => value::concat(a, b, autoescape),
        BinOp::Eq => Value::Bool(value::equals(a, b)),
        BinOp::Ne => Value::Bool(!value::equals(a, b)),
        BinOp::Lt => Value::Bool(value::compare(a, b)? == Ordering::Less),
        BinOp::Le => Value::Bool(value::compare(a, b)? != Ordering::Greater),
        BinOp::Gt => Value::Bool(value::compare(a, b)? == Ordering::Greater),
        BinOp::Ge => Value::Bool(value::compare(a, b)? != Ordering::Less),
        BinOp::In => Value::Bool(value::contains(b, a)?),
        BinOp::NotIn => Value::Bool(!value::contains(b, a)?),
        BinOp::And => {
            if a.truthy() {
                b.clone()
            } else {
                a.clone()
            }
        }
        BinOp::Or => {
            if a.truthy() {
                a.clone()
            } else {
                b.clone()
            }
        }
    })
}
