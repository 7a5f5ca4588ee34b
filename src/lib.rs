//! A small template engine with Liquid-flavored syntax: `{{ }}` output,
//! `{% %}` tags, filters, tests, macros, template inheritance with
//! `super()`, autoescaping and an opt-in sandbox.
//!
//! ```
//! use molten::{Environment, vars};
//!
//! let env = Environment::new();
//! let out = env
//!     .render_str(
//!         "{% for name in names %}{{ forloop.index }}. {{ name | upper }}\n{% endfor %}",
//!         vars! { "names" => vec!["ada", "bob"] },
//!     )
//!     .unwrap();
//! assert_eq!(out, "1. ADA\n2. BOB\n");
//! ```

mod ast;
mod compile;
mod environment;
mod error;
mod eval;
mod lexer;
mod parser;
mod registry;
mod runtime;
mod sandbox;
mod template;
mod value;

// Public exports.
pub use compile::RenderUnit;
pub use environment::{
    Environment, FileLoader, Loader, LoaderSource, MapLoader, MemoryCache, UnitCache,
};
pub use error::{MoltenError, MoltenResult, SyntaxError, SyntaxErrorKind};
pub use sandbox::{DefaultSandboxPolicy, SandboxPolicy};
pub use template::{MacroInfo, Module, Template};
pub use value::{HostFn, UndefinedBehavior, Value};

/// Builds the variable map for a render call.
///
/// ```
/// use molten::{Environment, vars};
///
/// let env = Environment::new();
/// let out = env.render_str("{{ a }}{{ b }}", vars! { "a" => 1, "b" => "x" }).unwrap();
/// assert_eq!(out, "1x");
/// ```
#[macro_export]
macro_rules! vars {
    () => {
        ::std::collections::BTreeMap::<::std::string::String, $crate::Value>::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = ::std::collections::BTreeMap::<::std::string::String, $crate::Value>::new();
        $(map.insert($name.to_string(), $crate::Value::from($value));)+
        map
    }};
}
