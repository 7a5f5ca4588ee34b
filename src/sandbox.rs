//! Opt-in access policy consulted by the evaluator.
//!
//! When a policy is installed on the environment it sees every attribute
//! access, subscript and call before it happens. A denial aborts the
//! render with a security error.

use crate::value::Value;

pub trait SandboxPolicy: Send + Sync {
    /// Whether `name` may be read as an attribute or item of `value`.
    /// Non-string subscripts arrive in their display form ("0", "-1").
    fn is_safe_attribute(&self, value: &Value, name: &str) -> bool;

    /// Whether `value` may be called.
    fn is_safe_call(&self, value: &Value) -> bool;
}

/// Denies underscore-prefixed names, the usual mutating method names,
/// and calls to anything that is not an engine callable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSandboxPolicy;

const DENIED_NAMES: &[&str] = &[
    "append", "clear", "extend", "insert", "pop", "remove", "setdefault", "sort", "update",
];

impl SandboxPolicy for DefaultSandboxPolicy {
    fn is_safe_attribute(&self, _value: &Value, name: &str) -> bool {
        !name.starts_with('_') && !DENIED_NAMES.contains(&name)
    }

    fn is_safe_call(&self, value: &Value) -> bool {
        matches!(
            value,
            Value::Macro(_) | Value::Func(_) | Value::Loop(_) | Value::Super(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn default_policy_denies_private_and_mutating_names() {
        let policy = DefaultSandboxPolicy;
        let map = Value::from(std::collections::BTreeMap::<String, i64>::new());
        assert!(policy.is_safe_attribute(&map, "name"));
        assert!(!policy.is_safe_attribute(&map, "_secret"));
        assert!(!policy.is_safe_attribute(&map, "update"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn default_policy_only_allows_engine_callables() {
        let policy = DefaultSandboxPolicy;
        assert!(!policy.is_safe_call(&Value::Int(1)));
        assert!(!policy.is_safe_call(&Value::from("x")));
    }
}
