//! Filter and test registries, with the builtin set.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::environment::Environment;
use crate::error::{MoltenError, MoltenResult};
use crate::value::{self, Value, html_escape};

pub(crate) enum FilterFn {
    Plain(Box<dyn Fn(&Value, &[Value], &[(String, Value)]) -> MoltenResult<Value> + Send + Sync>),
    /// Filters that look other filters up by name or traverse values take
    /// the environment as well.
    Contextual(
        Box<
            dyn Fn(&Environment, &Value, &[Value], &[(String, Value)]) -> MoltenResult<Value>
                + Send
                + Sync,
        >,
    ),
}

pub(crate) type TestFn =
    Box<dyn Fn(&Value, &[Value], &[(String, Value)]) -> MoltenResult<bool> + Send + Sync>;

pub(crate) struct Registry {
    filters: BTreeMap<String, FilterFn>,
    tests: BTreeMap<String, TestFn>,
}

impl Registry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            filters: BTreeMap::new(),
            tests: BTreeMap::new(),
        };
        registry.install_filters();
        registry.install_tests();
        registry
    }

    pub fn filter(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }

    pub fn test(&self, name: &str) -> Option<&TestFn> {
        self.tests.get(name)
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn has_test(&self, name: &str) -> bool {
        self.tests.contains_key(name)
    }

    pub fn add_filter(&mut self, name: String, filter: FilterFn) {
        self.filters.insert(name, filter);
    }

    pub fn add_test(&mut self, name: String, test: TestFn) {
        self.tests.insert(name, test);
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    fn plain<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value, &[Value], &[(String, Value)]) -> MoltenResult<Value> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), FilterFn::Plain(Box::new(f)));
    }

    fn contextual<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Environment, &Value, &[Value], &[(String, Value)]) -> MoltenResult<Value>
            + Send
            + Sync
            + 'static,
    {
        self.filters
            .insert(name.to_string(), FilterFn::Contextual(Box::new(f)));
    }

    fn check<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value, &[Value], &[(String, Value)]) -> MoltenResult<bool> + Send + Sync + 'static,
    {
        self.tests.insert(name.to_string(), Box::new(f));
    }

    fn install_filters(&mut self) {
        self.plain("abs", |value, _, _| match value {
            Value::Int(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| MoltenError::runtime("integer overflow in 'abs'")),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(MoltenError::runtime(format!(
                "'abs' needs a number, found {}",
                other.kind_name()
            ))),
        });

        self.plain("capitalize", |value, _, _| {
            let text = value.display();
            let mut chars = text.chars();
            Ok(Value::from(match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }))
        });

        self.plain("default", |value, args, kwargs| {
            let fallback = args.first().cloned().unwrap_or_else(|| Value::from(""));
            let boolean = kwargs
                .iter()
                .find(|(k, _)| k == "boolean")
                .map(|(_, v)| v.truthy())
                .or_else(|| args.get(1).map(Value::truthy))
                .unwrap_or(false);
            if value.is_undefined() || (boolean && !value.truthy()) {
                Ok(fallback)
            } else {
                Ok(value.clone())
            }
        });

        let escape = |value: &Value, _: &[Value], _: &[(String, Value)]| {
            if value.is_safe() {
                Ok(value.clone())
            } else {
                Ok(Value::safe(html_escape(&value.display())))
            }
        };
        self.plain("escape", escape);
        self.plain("e", escape);

        self.plain("first", |value, _, _| {
            Ok(value.try_iter()?.into_iter().next().unwrap_or_default())
        });
        self.plain("last", |value, _, _| {
            Ok(value.try_iter()?.pop().unwrap_or_default())
        });

        self.plain("join", |value, args, _| {
            let sep = match args.first() {
                Some(sep) => sep.display(),
                None => String::new(),
            };
            let pieces: Vec<String> = value.try_iter()?.iter().map(Value::display).collect();
            Ok(Value::from(pieces.join(&sep)))
        });

        let length = |value: &Value, _: &[Value], _: &[(String, Value)]| {
            value.len().map(Value::from).ok_or_else(|| {
                MoltenError::runtime(format!("{} has no length", value.kind_name()))
            })
        };
        self.plain("length", length);
        self.plain("size", length);

        self.plain("lower", |value, _, _| {
            Ok(Value::from(value.display().to_lowercase()))
        });
        self.plain("upper", |value, _, _| {
            Ok(Value::from(value.display().to_uppercase()))
        });

        self.contextual("map", |env, value, args, kwargs| {
            let items = value.try_iter()?;
            if let Some((_, key)) = kwargs.iter().find(|(k, _)| k == "attribute") {
                let Some(key) = key.as_str() else {
                    return Err(MoltenError::runtime("'map' attribute must be a string"));
                };
                return Ok(items
                    .into_iter()
                    .map(|item| match &item {
                        Value::Map(map) => map.get(key).cloned().unwrap_or_default(),
                        _ => Value::Undefined,
                    })
                    .collect());
            }
            let Some(name) = args.first().and_then(Value::as_str) else {
                return Err(MoltenError::runtime(
                    "'map' needs a filter name or an 'attribute' argument",
                ));
            };
            let Some(filter) = env.filter(name) else {
                return Err(env.unknown_filter(name, 0));
            };
            items
                .into_iter()
                .map(|item| match filter {
                    FilterFn::Plain(f) => f(&item, &[], &[]),
                    FilterFn::Contextual(f) => f(env, &item, &[], &[]),
                })
                .collect()
        });

        self.plain("replace", |value, args, _| {
            let (Some(from), Some(to)) = (
                args.first().and_then(Value::as_str),
                args.get(1).and_then(Value::as_str),
            ) else {
                return Err(MoltenError::runtime(
                    "'replace' needs two string arguments",
                ));
            };
            Ok(Value::from(value.display().replace(from, to)))
        });

        self.plain("reverse", |value, _, _| match value {
            Value::Str(_) | Value::Safe(_) => {
                Ok(Value::from(value.display().chars().rev().collect::<String>()))
            }
            _ => {
                let mut items = value.try_iter()?;
                items.reverse();
                Ok(items.into_iter().collect())
            }
        });

        self.plain("round", |value, args, _| {
            let x = match value {
                Value::Int(i) => *i as f64,
                Value::Float(f) => *f,
                other => {
                    return Err(MoltenError::runtime(format!(
                        "'round' needs a number, found {}",
                        other.kind_name()
                    )));
                }
            };
            let precision = match args.first() {
                Some(Value::Int(p)) => *p,
                Some(other) => {
                    return Err(MoltenError::runtime(format!(
                        "'round' precision must be an integer, found {}",
                        other.kind_name()
                    )));
                }
                None => 0,
            };
            let factor = 10f64.powi(precision as i32);
            Ok(Value::Float((x * factor).round() / factor))
        });

        self.plain("safe", |value, _, _| {
            if value.is_safe() {
                Ok(value.clone())
            } else {
                Ok(Value::safe(value.display()))
            }
        });

        self.contextual("sort", |_env, value, _args, kwargs| {
            let mut items = value.try_iter()?;
            let attribute = kwargs
                .iter()
                .find(|(k, _)| k == "attribute")
                .and_then(|(_, v)| v.as_str().map(str::to_string));
            let descending = kwargs
                .iter()
                .find(|(k, _)| k == "reverse")
                .is_some_and(|(_, v)| v.truthy());
            let key = |item: &Value| match (&attribute, item) {
                (Some(attr), Value::Map(map)) => map.get(attr).cloned().unwrap_or_default(),
                _ => item.clone(),
            };
            let mut failed = None;
            items.sort_by(|a, b| match value::compare(&key(a), &key(b)) {
                Ok(order) => order,
                Err(err) => {
                    failed.get_or_insert(err);
                    Ordering::Equal
                }
            });
            if let Some(err) = failed {
                return Err(err);
            }
            if descending {
                items.reverse();
            }
            Ok(items.into_iter().collect())
        });

        self.plain("trim", |value, _, _| {
            Ok(Value::from(value.display().trim().to_string()))
        });
    }

    fn install_tests(&mut self) {
        self.check("defined", |value, _, _| Ok(!value.is_undefined()));
        self.check("undefined", |value, _, _| Ok(value.is_undefined()));
        self.check("none", |value, _, _| Ok(matches!(value, Value::Null)));
        self.check("string", |value, _, _| {
            Ok(matches!(value, Value::Str(_) | Value::Safe(_)))
        });
        self.check("number", |value, _, _| {
            Ok(matches!(value, Value::Int(_) | Value::Float(_)))
        });
        self.check("sequence", |value, _, _| Ok(matches!(value, Value::Seq(_))));
        self.check("mapping", |value, _, _| Ok(matches!(value, Value::Map(_))));
        self.check("even", |value, _, _| match value {
            Value::Int(i) => Ok(i % 2 == 0),
            other => Err(non_integer("even", other)),
        });
        self.check("odd", |value, _, _| match value {
            Value::Int(i) => Ok(i % 2 != 0),
            other => Err(non_integer("odd", other)),
        });
        self.check("divisibleby", |value, args, _| {
            let Value::Int(n) = value else {
                return Err(non_integer("divisibleby", value));
            };
            match args.first() {
                Some(Value::Int(0)) => Err(MoltenError::runtime("'divisibleby' by zero")),
                Some(Value::Int(d)) => Ok(n % d == 0),
                _ => Err(MoltenError::runtime(
                    "'divisibleby' needs an integer argument",
                )),
            }
        });
    }
}

fn non_integer(test: &str, value: &Value) -> MoltenError {
    MoltenError::runtime(format!(
        "'{test}' test needs an integer, found {}",
        value.kind_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, value: Value, args: &[Value], kwargs: &[(String, Value)]) -> MoltenResult<Value> {
        let env = Environment::new();
        let registry = Registry::with_builtins();
        match registry.filter(name).unwrap() {
            FilterFn::Plain(f) => f(&value, args, kwargs),
            FilterFn::Contextual(f) => f(&env, &value, args, kwargs),
        }
    }

    fn passes(name: &str, value: Value, args: &[Value]) -> bool {
        let registry = Registry::with_builtins();
        registry.test(name).unwrap()(&value, args, &[]).unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn join_displays_each_item() {
        let out = run(
            "join",
            Value::from(vec![Value::Int(1), Value::from("a"), Value::Bool(true)]),
            &[Value::from(", ")],
            &[],
        )
        .unwrap();
        assert_eq!(out, Value::from("1, a, True"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn default_replaces_undefined_only_unless_boolean() {
        let out = run("default", Value::Undefined, &[Value::from("x")], &[]).unwrap();
        assert_eq!(out, Value::from("x"));
        let out = run("default", Value::from(""), &[Value::from("x")], &[]).unwrap();
        assert_eq!(out, Value::from(""));
        let kwargs = [("boolean".to_string(), Value::Bool(true))];
        let out = run("default", Value::from(""), &[Value::from("x")], &kwargs).unwrap();
        assert_eq!(out, Value::from("x"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn escape_never_double_encodes() {
        let once = run("escape", Value::from("<b>"), &[], &[]).unwrap();
        assert_eq!(once.display(), "&lt;b&gt;");
        let twice = run("escape", once, &[], &[]).unwrap();
        assert_eq!(twice.display(), "&lt;b&gt;");
    }

    #[test]
    #[ntest::timeout(100)]
    fn sort_orders_and_reverses() {
        let out = run("sort", Value::from(vec![3, 1, 2]), &[], &[]).unwrap();
        assert_eq!(out, Value::from(vec![1, 2, 3]));
        let kwargs = [("reverse".to_string(), Value::Bool(true))];
        let out = run("sort", Value::from(vec![3, 1, 2]), &[], &kwargs).unwrap();
        assert_eq!(out, Value::from(vec![3, 2, 1]));
        assert!(run(
            "sort",
            Value::from(vec![Value::Int(1), Value::from("a")]),
            &[],
            &[]
        )
        .is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn map_applies_a_filter_or_extracts_an_attribute() {
        let out = run(
            "map",
            Value::from(vec![Value::from("a"), Value::from("b")]),
            &[Value::from("upper")],
            &[],
        )
        .unwrap();
        assert_eq!(out, Value::from(vec![Value::from("A"), Value::from("B")]));

        let person = |name: &str| {
            Value::from(
                [("name".to_string(), Value::from(name))]
                    .into_iter()
                    .collect::<std::collections::BTreeMap<_, _>>(),
            )
        };
        let kwargs = [("attribute".to_string(), Value::from("name"))];
        let out = run(
            "map",
            Value::from(vec![person("ada"), person("bob")]),
            &[],
            &kwargs,
        )
        .unwrap();
        assert_eq!(out, Value::from(vec![Value::from("ada"), Value::from("bob")]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn round_respects_precision() {
        assert_eq!(
            run("round", Value::Float(2.345), &[Value::Int(2)], &[]).unwrap(),
            Value::Float(2.35)
        );
        assert_eq!(
            run("round", Value::Float(2.5), &[], &[]).unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn builtin_tests() {
        assert!(passes("defined", Value::Int(1), &[]));
        assert!(passes("undefined", Value::Undefined, &[]));
        assert!(passes("none", Value::Null, &[]));
        assert!(passes("even", Value::Int(4), &[]));
        assert!(passes("odd", Value::Int(3), &[]));
        assert!(passes("divisibleby", Value::Int(9), &[Value::Int(3)]));
        assert!(!passes("divisibleby", Value::Int(10), &[Value::Int(3)]));
    }
}
