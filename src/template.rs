//! Template handles and module introspection.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compile::RenderUnit;
use crate::environment::Environment;
use crate::error::{MoltenError, MoltenResult};
use crate::runtime::{Renderer, resolve_chain};
use crate::value::Value;

/// A compiled template bound to its environment.
pub struct Template<'env> {
    env: &'env Environment,
    name: String,
    unit: Arc<RenderUnit>,
}

impl<'env> Template<'env> {
    pub(crate) fn new(env: &'env Environment, name: String, unit: Arc<RenderUnit>) -> Self {
        Self { env, name, unit }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, vars: BTreeMap<String, Value>) -> MoltenResult<String> {
        let (text, failed) = self.render_partial(vars);
        match failed {
            Some(err) => Err(err),
            None => Ok(text),
        }
    }

    /// Like [`render`](Self::render), but hands back whatever output was
    /// produced before a failure along with the error.
    pub fn render_partial(&self, vars: BTreeMap<String, Value>) -> (String, Option<MoltenError>) {
        let (base, blocks) = match resolve_chain(self.env, Arc::clone(&self.unit)) {
            Ok(resolved) => resolved,
            Err(err) => return (String::new(), Some(err)),
        };
        let mut renderer = Renderer::new(self.env);
        renderer.blocks = blocks;
        for (name, value) in vars {
            renderer.frames.set(name, value);
        }
        let failed = renderer.render_body(&base.root).err();
        (renderer.out, failed)
    }

    /// Executes the template's top level with output discarded and
    /// exposes its exported names and macros.
    pub fn module(&self, vars: BTreeMap<String, Value>) -> MoltenResult<Module<'env>> {
        let mut renderer = Renderer::new(self.env);
        let (base, frame) =
            renderer.run_module(Arc::clone(&self.unit), vars.into_iter().collect())?;
        let exports = base.exports.clone();
        Ok(Module {
            renderer,
            frame,
            exports,
        })
    }
}

/// The exported top-level names of one executed template.
pub struct Module<'env> {
    renderer: Renderer<'env>,
    frame: usize,
    exports: Vec<String>,
}

/// Signature details of an exported macro.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroInfo {
    pub name: String,
    pub arguments: Vec<String>,
    /// Constant defaults, position-aligned with the tail of `arguments`.
    /// A non-constant default appears as `Value::Undefined`.
    pub defaults: Vec<Value>,
    pub accepts_caller: bool,
    pub catch_varargs: bool,
    pub catch_kwargs: bool,
}

impl Module<'_> {
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if !self.exports.iter().any(|n| n == name) {
            return None;
        }
        self.renderer.frames.get_in(self.frame, name).cloned()
    }

    pub fn macro_info(&self, name: &str) -> Option<MacroInfo> {
        let Value::Macro(mac) = self.get(name)? else {
            return None;
        };
        let decl = &mac.decl;
        let defaults = decl
            .params
            .iter()
            .filter_map(|p| p.default.as_ref())
            .map(|default| match default {
                crate::ast::Expr::Const(value) => value.clone(),
                _ => Value::Undefined,
            })
            .collect();
        Some(MacroInfo {
            name: decl.name.clone(),
            arguments: decl.params.iter().map(|p| p.name.clone()).collect(),
            defaults,
            accepts_caller: decl.accepts_caller,
            catch_varargs: decl.catch_varargs,
            catch_kwargs: decl.catch_kwargs,
        })
    }

    /// Calls an exported macro with positional arguments and returns its
    /// rendered output.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> MoltenResult<String> {
        let Some(value) = self.get(name) else {
            return Err(MoltenError::undefined(format!(
                "module exports no name '{name}'"
            )));
        };
        match value {
            Value::Macro(mac) => {
                self.renderer.frames.restore(self.frame);
                let out = self.renderer.call_macro(&mac, args, Vec::new(), None, 0)?;
                Ok(out.display())
            }
            other => Err(MoltenError::runtime(format!(
                "'{name}' is not a macro, found {}",
                other.kind_name()
            ))),
        }
    }
}
