//! The dynamic value model shared by the compiler and the runtime.
//!
//! Template values are a closed tagged variant with uniform truthiness,
//! comparison and iteration rules. Engine-internal callables (macros, the
//! loop control object, `super` handles, host functions) are variants too,
//! so a single dispatch in the evaluator covers every call site.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{MoltenError, MoltenResult};
use crate::runtime::{LoopValue, MacroValue, SuperValue};

/// How lookups of missing names behave at runtime.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndefinedBehavior {
    /// Undefined stringifies to `""`, is falsy and iterates empty.
    #[default]
    Lenient,
    /// Any use of an undefined value raises immediately.
    Strict,
}

/// A host function exposed to templates, either as a global or as a
/// built-in attribute of an engine value (`forloop.cycle`).
pub struct HostFn {
    name: String,
    f: Box<dyn Fn(&[Value], &[(String, Value)]) -> MoltenResult<Value> + Send + Sync>,
}

impl HostFn {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value], &[(String, Value)]) -> MoltenResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value], kwargs: &[(String, Value)]) -> MoltenResult<Value> {
        (self.f)(args, kwargs)
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFn").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    /// A missing name or attribute; carries the name when known so error
    /// messages can point at it.
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A string exempt from autoescaping.
    Safe(Arc<str>),
    Seq(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    Macro(Arc<MacroValue>),
    Func(Arc<HostFn>),
    Loop(Arc<LoopValue>),
    Super(Arc<SuperValue>),
}

impl Value {
    pub fn safe(s: impl Into<String>) -> Self {
        Self::Safe(Arc::from(s.into().as_str()))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "none",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) | Self::Safe(_) => "string",
            Self::Seq(_) => "sequence",
            Self::Map(_) => "mapping",
            Self::Macro(_) => "macro",
            Self::Func(_) => "function",
            Self::Loop(_) => "forloop",
            Self::Super(_) => "super",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe(_))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) | Self::Safe(s) => !s.is_empty(),
            Self::Seq(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::Macro(_) | Self::Func(_) | Self::Loop(_) | Self::Super(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s),
            _ => None,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s.chars().count()),
            Self::Seq(items) => Some(items.len()),
            Self::Map(map) => Some(map.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// Top-level display: how the value looks inside `{{ }}` output.
    /// Undefined is blank here; strict mode rejects it before display.
    pub fn display(&self) -> String {
        match self {
            Self::Undefined => String::new(),
            Self::Null => "None".to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Str(s) | Self::Safe(s) => s.to_string(),
            Self::Seq(_) | Self::Map(_) => self.repr(),
            Self::Macro(m) => format!("<macro {}>", m.name()),
            Self::Func(f) => format!("<function {}>", f.name()),
            Self::Loop(_) => "<forloop>".to_string(),
            Self::Super(s) => format!("<super {}>", s.block_name()),
        }
    }

    /// Container-element display: strings come out quoted.
    fn repr(&self) -> String {
        match self {
            Self::Str(s) | Self::Safe(s) => format!("'{s}'"),
            Self::Seq(items) => {
                let inner: Vec<String> = items.iter().map(Self::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{k}': {}", v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::Undefined
            | Self::Null
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::Macro(_)
            | Self::Func(_)
            | Self::Loop(_)
            | Self::Super(_) => self.display(),
        }
    }

    /// Materializes the values this one yields in a `for` loop. Maps
    /// iterate over their keys, strings over their characters.
    pub fn try_iter(&self) -> MoltenResult<Vec<Value>> {
        match self {
            Self::Seq(items) => Ok(items.as_ref().clone()),
            Self::Map(map) => Ok(map.keys().map(|k| Self::from(k.as_str())).collect()),
            Self::Str(s) | Self::Safe(s) => {
                Ok(s.chars().map(|c| Self::from(c.to_string())).collect())
            }
            _ => Err(MoltenError::runtime(format!(
                "{} is not iterable",
                self.kind_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        equals(self, other)
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f < 0.0 { "-inf" } else { "inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

pub(crate) fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn numeric_pair(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((as_f64(a)?, as_f64(b)?))
}

fn bad_operands(op: &str, a: &Value, b: &Value) -> MoltenError {
    MoltenError::runtime(format!(
        "unsupported operands for '{op}': {} and {}",
        a.kind_name(),
        b.kind_name()
    ))
}

pub(crate) fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            match numeric_pair(a, b) {
                Some((x, y)) => x == y,
                None => false,
            }
        }
        (Value::Str(_) | Value::Safe(_), Value::Str(_) | Value::Safe(_)) => {
            a.as_str() == b.as_str()
        }
        (Value::Seq(x), Value::Seq(y)) => x.len() == y.len() && x.iter().eq(y.iter()),
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| p.0 == q.0 && p.1 == q.1)
        }
        (Value::Macro(x), Value::Macro(y)) => Arc::ptr_eq(x, y),
        (Value::Func(x), Value::Func(y)) => Arc::ptr_eq(x, y),
        (Value::Loop(x), Value::Loop(y)) => Arc::ptr_eq(x, y),
        (Value::Super(x), Value::Super(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

pub(crate) fn compare(a: &Value, b: &Value) -> MoltenResult<Ordering> {
    if let Some((x, y)) = numeric_pair(a, b) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| MoltenError::runtime("cannot order nan"));
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Ok(x.cmp(y));
    }
    Err(MoltenError::runtime(format!(
        "cannot compare {} with {}",
        a.kind_name(),
        b.kind_name()
    )))
}

pub(crate) fn contains(haystack: &Value, needle: &Value) -> MoltenResult<bool> {
    match haystack {
        Value::Seq(items) => Ok(items.iter().any(|item| equals(item, needle))),
        Value::Map(map) => match needle.as_str() {
            Some(key) => Ok(map.contains_key(key)),
            None => Ok(false),
        },
        Value::Str(s) | Value::Safe(s) => match needle.as_str() {
            Some(sub) => Ok(s.contains(sub)),
            None => Err(MoltenError::runtime(format!(
                "cannot search a string for {}",
                needle.kind_name()
            ))),
        },
        _ => Err(MoltenError::runtime(format!(
            "'in' needs a sequence, mapping or string, found {}",
            haystack.kind_name()
        ))),
    }
}

pub(crate) fn add(a: &Value, b: &Value, autoescape: bool) -> MoltenResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_add(*y)
            .map(Value::Int)
            .ok_or_else(|| MoltenError::runtime("integer overflow in '+'")),
        (Value::Str(_) | Value::Safe(_), Value::Str(_) | Value::Safe(_)) => {
            Ok(join_strings(a, b, autoescape))
        }
        (Value::Seq(x), Value::Seq(y)) => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            Ok(Value::Seq(Arc::new(items)))
        }
        _ => match numeric_pair(a, b) {
            Some((x, y)) => Ok(Value::Float(x + y)),
            None => Err(bad_operands("+", a, b)),
        },
    }
}

pub(crate) fn sub(a: &Value, b: &Value) -> MoltenResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_sub(*y)
            .map(Value::Int)
            .ok_or_else(|| MoltenError::runtime("integer overflow in '-'")),
        _ => match numeric_pair(a, b) {
            Some((x, y)) => Ok(Value::Float(x - y)),
            None => Err(bad_operands("-", a, b)),
        },
    }
}

pub(crate) fn mul(a: &Value, b: &Value) -> MoltenResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_mul(*y)
            .map(Value::Int)
            .ok_or_else(|| MoltenError::runtime("integer overflow in '*'")),
        _ => match numeric_pair(a, b) {
            Some((x, y)) => Ok(Value::Float(x * y)),
            None => Err(bad_operands("*", a, b)),
        },
    }
}

/// True division always yields a float.
pub(crate) fn div(a: &Value, b: &Value) -> MoltenResult<Value> {
    match numeric_pair(a, b) {
        Some((_, y)) if y == 0.0 => Err(MoltenError::runtime("division by zero")),
        Some((x, y)) => Ok(Value::Float(x / y)),
        None => Err(bad_operands("/", a, b)),
    }
}

pub(crate) fn floor_div(a: &Value, b: &Value) -> MoltenResult<Value> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(MoltenError::runtime("division by zero")),
        (Value::Int(x), Value::Int(y)) => {
            let q = x / y;
            // Floor semantics, not truncation.
            if x % y != 0 && (x < &0) != (y < &0) {
                Ok(Value::Int(q - 1))
            } else {
                Ok(Value::Int(q))
            }
        }
        _ => match numeric_pair(a, b) {
            Some((_, y)) if y == 0.0 => Err(MoltenError::runtime("division by zero")),
            Some((x, y)) => Ok(Value::Float((x / y).floor())),
            None => Err(bad_operands("//", a, b)),
        },
    }
}

pub(crate) fn rem(a: &Value, b: &Value) -> MoltenResult<Value> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(MoltenError::runtime("modulo by zero")),
        (Value::Int(x), Value::Int(y)) => {
            let r = x % y;
            // Result takes the sign of the divisor.
            if r != 0 && (r < 0) != (y < &0) {
                Ok(Value::Int(r + y))
            } else {
                Ok(Value::Int(r))
            }
        }
        _ => match numeric_pair(a, b) {
            Some((_, y)) if y == 0.0 => Err(MoltenError::runtime("modulo by zero")),
            Some((x, y)) => Ok(Value::Float(x - (x / y).floor() * y)),
            None => Err(bad_operands("%", a, b)),
        },
    }
}

pub(crate) fn pow(a: &Value, b: &Value) -> MoltenResult<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) if *y >= 0 => {
            match u32::try_from(*y).ok().and_then(|e| x.checked_pow(e)) {
                Some(v) => Ok(Value::Int(v)),
                None => Ok(Value::Float((*x as f64).powf(*y as f64))),
            }
        }
        _ => match numeric_pair(a, b) {
            Some((x, y)) => Ok(Value::Float(x.powf(y))),
            None => Err(bad_operands("**", a, b)),
        },
    }
}

pub(crate) fn neg(v: &Value) -> MoltenResult<Value> {
    match v {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| MoltenError::runtime("integer overflow in '-'")),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(MoltenError::runtime(format!(
            "cannot negate {}",
            v.kind_name()
        ))),
    }
}

/// `~` stringifies both sides. Safe-marked input keeps the result safe,
/// escaping the other side when autoescape is on so trusted markup is
/// never double-encoded.
pub(crate) fn concat(a: &Value, b: &Value, autoescape: bool) -> Value {
    join_strings(a, b, autoescape)
}

fn join_strings(a: &Value, b: &Value, autoescape: bool) -> Value {
    let safe = a.is_safe() || b.is_safe();
    let piece = |v: &Value| {
        if safe && autoescape && !v.is_safe() {
            html_escape(&v.display())
        } else {
            v.display()
        }
    };
    let joined = format!("{}{}", piece(a), piece(b));
    if safe {
        Value::safe(joined)
    } else {
        Value::from(joined)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s.as_str()))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Seq(Arc::new(items.into_iter().map(Into::into).collect()))
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(map: BTreeMap<String, T>) -> Self {
        Self::Map(Arc::new(
            map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        ))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::Seq(Arc::new(iter.into_iter().collect()))
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::Map(Arc::new(iter.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn truthiness_table() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Float(0.0).truthy());
        assert!(!Value::from("").truthy());
        assert!(!Value::from(Vec::<i64>::new()).truthy());
        assert!(!Value::from(BTreeMap::<String, i64>::new()).truthy());

        assert!(Value::Bool(true).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(Value::Float(0.5).truthy());
        assert!(Value::from("x").truthy());
        assert!(Value::from(vec![0]).truthy());
    }

    #[test]
    #[ntest::timeout(100)]
    fn display_formats() {
        assert_eq!(Value::Bool(true).display(), "True");
        assert_eq!(Value::Bool(false).display(), "False");
        assert_eq!(Value::Null.display(), "None");
        assert_eq!(Value::Undefined.display(), "");
        assert_eq!(Value::Float(3.0).display(), "3.0");
        assert_eq!(Value::Float(1.5).display(), "1.5");
        assert_eq!(Value::from(vec![1, 2]).display(), "[1, 2]");
        assert_eq!(
            Value::from(vec![Value::from("a"), Value::Int(1)]).display(),
            "['a', 1]"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn arithmetic_promotes_to_float() {
        assert_eq!(
            add(&Value::Int(1), &Value::Int(2), false).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            add(&Value::Int(1), &Value::Float(0.5), false).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            div(&Value::Int(3), &Value::Int(2)).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn floor_div_and_rem_follow_divisor_sign() {
        assert_eq!(
            floor_div(&Value::Int(-7), &Value::Int(2)).unwrap(),
            Value::Int(-4)
        );
        assert_eq!(
            floor_div(&Value::Int(7), &Value::Int(2)).unwrap(),
            Value::Int(3)
        );
        assert_eq!(rem(&Value::Int(-7), &Value::Int(3)).unwrap(), Value::Int(2));
        assert_eq!(rem(&Value::Int(7), &Value::Int(-3)).unwrap(), Value::Int(-2));
    }

    #[test]
    #[ntest::timeout(100)]
    fn division_by_zero_is_a_runtime_error() {
        assert!(matches!(
            div(&Value::Int(1), &Value::Int(0)),
            Err(MoltenError::Runtime { .. })
        ));
        assert!(matches!(
            rem(&Value::Int(1), &Value::Int(0)),
            Err(MoltenError::Runtime { .. })
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn string_and_seq_addition() {
        assert_eq!(
            add(&Value::from("ab"), &Value::from("cd"), false).unwrap(),
            Value::from("abcd")
        );
        assert_eq!(
            add(&Value::from(vec![1]), &Value::from(vec![2]), false).unwrap(),
            Value::from(vec![1, 2])
        );
        assert!(add(&Value::Int(1), &Value::from("x"), false).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn concat_keeps_safety_and_escapes_the_other_side() {
        let out = concat(&Value::safe("<b>"), &Value::from("<i>"), true);
        assert!(out.is_safe());
        assert_eq!(out.display(), "<b>&lt;i&gt;");

        let plain = concat(&Value::from(1), &Value::from("x"), true);
        assert!(!plain.is_safe());
        assert_eq!(plain.display(), "1x");
    }

    #[test]
    #[ntest::timeout(100)]
    fn membership() {
        assert!(contains(&Value::from(vec![1, 2]), &Value::Int(2)).unwrap());
        assert!(contains(&Value::from("hello"), &Value::from("ell")).unwrap());
        let map: BTreeMap<String, i64> = [("a".to_string(), 1)].into_iter().collect();
        assert!(contains(&Value::from(map), &Value::from("a")).unwrap());
        assert!(contains(&Value::Int(1), &Value::Int(1)).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn cross_type_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::from("2"));
        assert_eq!(Value::from("a"), Value::safe("a"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn iteration_sources() {
        assert_eq!(
            Value::from("ab").try_iter().unwrap(),
            vec![Value::from("a"), Value::from("b")]
        );
        let map: BTreeMap<String, i64> =
            [("b".to_string(), 1), ("a".to_string(), 2)].into_iter().collect();
        assert_eq!(
            Value::from(map).try_iter().unwrap(),
            vec![Value::from("a"), Value::from("b")]
        );
        assert!(Value::Int(3).try_iter().is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn escaping() {
        assert_eq!(html_escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
