//! Template execution: the frame arena and the step renderer.
//!
//! Scopes live in an arena. Popping a scope only moves the cursor back to
//! the parent, the frame itself stays alive for the whole render, so a
//! macro can close over the frame it was defined in by index and still
//! resolve names through it when called from anywhere else.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::compile::{Body, ForStep, MacroDecl, RenderUnit, Step};
use crate::environment::Environment;
use crate::error::{MoltenError, MoltenResult};
use crate::value::{HostFn, UndefinedBehavior, Value};

/// A user-defined macro bound to the frame it was declared in.
#[derive(Debug)]
pub struct MacroValue {
    pub(crate) decl: Arc<MacroDecl>,
    pub(crate) scope: usize,
}

impl MacroValue {
    pub fn name(&self) -> &str {
        &self.decl.name
    }
}

/// The `forloop` control object, rebuilt for every iteration. The cycle
/// counter is shared across the iterations of one loop run.
#[derive(Debug)]
pub struct LoopValue {
    pub(crate) index0: usize,
    pub(crate) length: usize,
    pub(crate) depth0: usize,
    pub(crate) cycle: Arc<Mutex<usize>>,
    pub(crate) recurse: Option<LoopRecurse>,
}

/// Re-entry point for loops declared `recursive`.
#[derive(Debug)]
pub(crate) struct LoopRecurse {
    pub step: Arc<ForStep>,
    pub scope: usize,
}

/// Handle to the next override up a block chain.
#[derive(Debug)]
pub struct SuperValue {
    pub(crate) name: String,
    pub(crate) level: usize,
}

impl SuperValue {
    pub fn block_name(&self) -> &str {
        &self.name
    }
}

struct Frame {
    vars: HashMap<String, Value>,
    parent: Option<usize>,
}

pub(crate) struct Frames {
    arena: Vec<Frame>,
    current: usize,
}

impl Frames {
    pub fn new() -> Self {
        Self {
            arena: vec![Frame {
                vars: HashMap::new(),
                parent: None,
            }],
            current: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Enters a fresh child scope of `parent` and returns its index.
    pub fn push_child_of(&mut self, parent: usize) -> usize {
        self.arena.push(Frame {
            vars: HashMap::new(),
            parent: Some(parent),
        });
        self.current = self.arena.len() - 1;
        self.current
    }

    pub fn push(&mut self) -> usize {
        self.push_child_of(self.current)
    }

    /// Enters a scope with no parent, used for module isolation.
    pub fn push_root(&mut self) -> usize {
        self.arena.push(Frame {
            vars: HashMap::new(),
            parent: None,
        });
        self.current = self.arena.len() - 1;
        self.current
    }

    pub fn restore(&mut self, frame: usize) {
        self.current = frame;
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.arena[self.current].vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.get_in(self.current, name)
    }

    pub fn get_in(&self, frame: usize, name: &str) -> Option<&Value> {
        let mut cursor = Some(frame);
        while let Some(idx) = cursor {
            let frame = &self.arena[idx];
            if let Some(value) = frame.vars.get(name) {
                return Some(value);
            }
            cursor = frame.parent;
        }
        None
    }
}

pub(crate) struct Renderer<'env> {
    pub env: &'env Environment,
    pub frames: Frames,
    pub out: String,
    /// Override chains per block name, child-most first.
    pub blocks: BTreeMap<String, Vec<Body>>,
    depth: usize,
}

/// Walks the `extends` chain of `unit`, collecting the block override
/// chains. Returns the chain's base unit, whose root is what executes.
pub(crate) fn resolve_chain(
    env: &Environment,
    unit: Arc<RenderUnit>,
) -> MoltenResult<(Arc<RenderUnit>, BTreeMap<String, Vec<Body>>)> {
    let mut blocks: BTreeMap<String, Vec<Body>> = BTreeMap::new();
    let mut seen: Vec<String> = Vec::new();
    let mut current = unit;
    loop {
        for (name, body) in &current.blocks {
            blocks
                .entry(name.clone())
                .or_default()
                .push(Arc::clone(body));
        }
        let Some(parent) = current.extends.clone() else {
            return Ok((current, blocks));
        };
        if seen.iter().any(|n| n == &parent) {
            return Err(MoltenError::runtime(format!(
                "circular 'extends' chain through '{parent}'"
            )));
        }
        seen.push(parent.clone());
        tracing::trace!(parent = %parent, "resolving extends");
        current = env.load_unit(&parent)?;
    }
}

impl<'env> Renderer<'env> {
    pub fn new(env: &'env Environment) -> Self {
        Self {
            env,
            frames: Frames::new(),
            out: String::new(),
            blocks: BTreeMap::new(),
            depth: 0,
        }
    }

    pub fn render_body(&mut self, body: &[Step]) -> MoltenResult<()> {
        for step in body {
            self.render_step(step)?;
        }
        Ok(())
    }

    fn render_step(&mut self, step: &Step) -> MoltenResult<()> {
        match step {
            Step::Emit(text) => self.out.push_str(text),
            Step::Output { expr, line } => {
                let value = self.eval_expr(expr)?;
                self.write_value(&value, *line)?;
            }
            Step::If { arms, otherwise } => {
                for (cond, body) in arms {
                    let value = self.eval_expr(cond)?;
                    if self.check_condition(&value, cond.line())? {
                        return self.render_body(body);
                    }
                }
                if let Some(body) = otherwise {
                    return self.render_body(body);
                }
            }
            Step::For(step) => {
                let iter = self.eval_expr(&step.iter)?;
                self.run_for(step, iter, 0)?;
            }
            Step::SetExpr { target, value } => {
                let value = self.eval_expr(value)?;
                self.frames.set(target.clone(), value);
            }
            Step::SetBlock { target, body } => {
                let text = self.capture_body(body)?;
                self.frames.set(target.clone(), self.mark_rendered(text));
            }
            Step::FilterBlock { filters, body } => {
                let text = self.capture_body(body)?;
                let mut value = self.mark_rendered(text);
                for call in filters {
                    value = self.apply_filter(value, call)?;
                }
                let line = filters.last().map_or(0, |f| f.line);
                self.write_value(&value, line)?;
            }
            Step::Macro(decl) => {
                let mac = MacroValue {
                    decl: Arc::clone(decl),
                    scope: self.frames.current(),
                };
                self.frames.set(decl.name.clone(), Value::Macro(Arc::new(mac)));
            }
            Step::CallBlock(step) => {
                let caller = Value::Macro(Arc::new(MacroValue {
                    decl: Arc::new(MacroDecl {
                        name: "caller".to_string(),
                        params: step.params.clone(),
                        body: Arc::clone(&step.body),
                        accepts_caller: false,
                        catch_varargs: false,
                        catch_kwargs: false,
                        line: step.line,
                    }),
                    scope: self.frames.current(),
                }));
                let callee = self.eval_expr(&step.callee)?;
                let (args, kwargs) = self.eval_args(&step.args)?;
                let Value::Macro(mac) = &callee else {
                    return Err(MoltenError::runtime(format!(
                        "'call' needs a macro, found {} (line {})",
                        callee.kind_name(),
                        step.line
                    )));
                };
                let mac = Arc::clone(mac);
                let result = self.call_macro(&mac, args, kwargs, Some(caller), step.line)?;
                self.write_value(&result, step.line)?;
            }
            Step::Block { name } => {
                self.render_block(name)?;
            }
            Step::Include { name, line } => {
                let value = self.eval_expr(name)?;
                let Some(target) = value.as_str() else {
                    return Err(MoltenError::runtime(format!(
                        "include name must be a string, found {} (line {line})",
                        value.kind_name()
                    )));
                };
                self.check_recursion(*line)?;
                tracing::trace!(template = target, "including template");
                let unit = self.env.load_unit(target)?;
                let (base, blocks) = resolve_chain(self.env, unit)?;
                let saved_blocks = std::mem::replace(&mut self.blocks, blocks);
                let saved_frame = self.frames.current();
                self.frames.push();
                self.depth += 1;
                let result = self.render_body(&base.root);
                self.depth -= 1;
                self.frames.restore(saved_frame);
                self.blocks = saved_blocks;
                result?;
            }
            Step::Import {
                template,
                names,
                line,
            } => {
                self.check_recursion(*line)?;
                tracing::trace!(template = %template, "importing module");
                let unit = self.env.load_unit(template)?;
                let (base, module_frame) = self.run_module(unit, Vec::new())?;
                for (name, alias) in names {
                    if !base.exports.iter().any(|n| n == name) {
                        return Err(MoltenError::runtime(format!(
                            "template '{template}' does not export '{name}' (line {line})"
                        )));
                    }
                    let value = self
                        .frames
                        .get_in(module_frame, name)
                        .cloned()
                        .unwrap_or_default();
                    self.frames.set(alias.clone(), value);
                }
            }
        }
        Ok(())
    }

    /// Executes a template's top level in an isolated root scope with the
    /// output discarded. Returns the chain base and the module's frame.
    pub fn run_module(
        &mut self,
        unit: Arc<RenderUnit>,
        vars: Vec<(String, Value)>,
    ) -> MoltenResult<(Arc<RenderUnit>, usize)> {
        let (base, blocks) = resolve_chain(self.env, unit)?;
        let saved_blocks = std::mem::replace(&mut self.blocks, blocks);
        let saved_out = std::mem::take(&mut self.out);
        let saved_frame = self.frames.current();
        let module_frame = self.frames.push_root();
        for (name, value) in vars {
            self.frames.set(name, value);
        }
        self.depth += 1;
        let result = self.render_body(&base.root);
        self.depth -= 1;
        self.frames.restore(saved_frame);
        self.blocks = saved_blocks;
        self.out = saved_out;
        result?;
        Ok((base, module_frame))
    }

    fn run_for(&mut self, step: &Arc<ForStep>, iter: Value, depth0: usize) -> MoltenResult<()> {
        let raw = if iter.is_undefined() {
            if self.strict() {
                return Err(MoltenError::undefined(format!(
                    "iterated an undefined value (line {})",
                    step.line
                )));
            }
            Vec::new()
        } else {
            iter.try_iter()?
        };

        // The filter pass runs before numbering so `forloop.length` counts
        // the kept items. `forloop` itself is not visible to the filter.
        let items = match &step.filter {
            None => raw,
            Some(filter) => {
                let saved = self.frames.current();
                self.frames.push();
                let mut kept = Vec::new();
                for item in raw {
                    self.bind_targets(&step.targets, &item, step.line)?;
                    let keep = self.eval_expr(filter)?;
                    if self.check_condition(&keep, filter.line())? {
                        kept.push(item);
                    }
                }
                self.frames.restore(saved);
                kept
            }
        };

        if items.is_empty() {
            if let Some(body) = &step.otherwise {
                let saved = self.frames.current();
                self.frames.push();
                let result = self.render_body(body);
                self.frames.restore(saved);
                return result;
            }
            return Ok(());
        }

        let length = items.len();
        let cycle = Arc::new(Mutex::new(0usize));
        let parent_scope = self.frames.current();
        for (index0, item) in items.into_iter().enumerate() {
            self.frames.push_child_of(parent_scope);
            self.bind_targets(&step.targets, &item, step.line)?;
            let control = LoopValue {
                index0,
                length,
                depth0,
                cycle: Arc::clone(&cycle),
                recurse: step.recursive.then(|| LoopRecurse {
                    step: Arc::clone(step),
                    scope: parent_scope,
                }),
            };
            self.frames.set("forloop", Value::Loop(Arc::new(control)));
            let result = self.render_body(&step.body);
            self.frames.restore(parent_scope);
            result?;
        }
        Ok(())
    }

    /// `loop(children)` on a `recursive` loop: renders the loop body once
    /// more over `items`, one level deeper, and returns the text.
    pub fn recurse_loop(&mut self, control: &LoopValue, items: Value) -> MoltenResult<Value> {
        let Some(recurse) = &control.recurse else {
            return Err(MoltenError::runtime(
                "this loop is not marked 'recursive'",
            ));
        };
        self.check_recursion(recurse.step.line)?;
        let saved_out = std::mem::take(&mut self.out);
        let saved_frame = self.frames.current();
        self.frames.restore(recurse.scope);
        self.depth += 1;
        let result = self.run_for(&Arc::clone(&recurse.step), items, control.depth0 + 1);
        self.depth -= 1;
        self.frames.restore(saved_frame);
        let text = std::mem::replace(&mut self.out, saved_out);
        result?;
        Ok(self.mark_rendered(text))
    }

    pub fn call_macro(
        &mut self,
        mac: &MacroValue,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        caller: Option<Value>,
        line: u32,
    ) -> MoltenResult<Value> {
        self.check_recursion(line)?;
        let decl = &mac.decl;
        let saved_frame = self.frames.current();
        self.frames.push_child_of(mac.scope);

        let mut kwargs = kwargs;
        let mut args = args.into_iter();
        let mut extra_pos: Vec<Value> = Vec::new();
        for param in &decl.params {
            let by_kw = kwargs.iter().position(|(k, _)| k == &param.name);
            let value = match (args.next(), by_kw) {
                (Some(_), Some(_)) => {
                    self.frames.restore(saved_frame);
                    return Err(MoltenError::runtime(format!(
                        "macro '{}' got multiple values for parameter '{}' (line {line})",
                        decl.name, param.name
                    )));
                }
                (Some(value), None) => value,
                (None, Some(idx)) => kwargs.remove(idx).1,
                (None, None) => match &param.default {
                    Some(default) => self.eval_expr(default)?,
                    None => Value::Undefined,
                },
            };
            self.frames.set(param.name.clone(), value);
        }
        extra_pos.extend(args);

        if decl.catch_varargs {
            self.frames.set("varargs", extra_pos.into_iter().collect());
        } else if !extra_pos.is_empty() {
            let n = decl.params.len();
            self.frames.restore(saved_frame);
            return Err(MoltenError::runtime(format!(
                "macro '{}' takes at most {n} positional arguments (line {line})",
                decl.name
            )));
        }
        if decl.catch_kwargs {
            self.frames.set(
                "kwargs",
                kwargs.into_iter().collect(),
            );
        } else if let Some((name, _)) = kwargs.first() {
            let message = format!(
                "macro '{}' got an unexpected keyword argument '{name}' (line {line})",
                decl.name
            );
            self.frames.restore(saved_frame);
            return Err(MoltenError::runtime(message));
        }
        if decl.accepts_caller {
            self.frames.set("caller", caller.unwrap_or_default());
        } else if caller.is_some() {
            self.frames.restore(saved_frame);
            return Err(MoltenError::runtime(format!(
                "macro '{}' does not accept a caller (line {line})",
                decl.name
            )));
        }

        let saved_out = std::mem::take(&mut self.out);
        self.depth += 1;
        let result = self.render_body(&decl.body);
        self.depth -= 1;
        let text = std::mem::replace(&mut self.out, saved_out);
        self.frames.restore(saved_frame);
        result?;
        Ok(self.mark_rendered(text))
    }

    /// `super()` inside a block body: renders the next body up the chain.
    pub fn call_super(&mut self, handle: &SuperValue) -> MoltenResult<Value> {
        let chain = self.blocks.get(&handle.name).cloned().unwrap_or_default();
        let Some(body) = chain.get(handle.level).cloned() else {
            return Err(MoltenError::runtime(format!(
                "block '{}' has no parent to call super() on",
                handle.name
            )));
        };
        let saved_out = std::mem::take(&mut self.out);
        let saved_frame = self.frames.current();
        self.frames.push();
        if chain.len() > handle.level + 1 {
            self.frames.set(
                "super",
                Value::Super(Arc::new(SuperValue {
                    name: handle.name.clone(),
                    level: handle.level + 1,
                })),
            );
        }
        let result = self.render_body(&body);
        self.frames.restore(saved_frame);
        let text = std::mem::replace(&mut self.out, saved_out);
        result?;
        Ok(self.mark_rendered(text))
    }

    fn render_block(&mut self, name: &str) -> MoltenResult<()> {
        let chain = self.blocks.get(name).cloned().unwrap_or_default();
        let Some(body) = chain.first().cloned() else {
            return Ok(());
        };
        let saved_frame = self.frames.current();
        self.frames.push();
        if chain.len() > 1 {
            self.frames.set(
                "super",
                Value::Super(Arc::new(SuperValue {
                    name: name.to_string(),
                    level: 1,
                })),
            );
        }
        let result = self.render_body(&body);
        self.frames.restore(saved_frame);
        result
    }

    fn bind_targets(&mut self, targets: &[String], item: &Value, line: u32) -> MoltenResult<()> {
        if let [target] = targets {
            self.frames.set(target.clone(), item.clone());
            return Ok(());
        }
        let parts = item.try_iter().map_err(|_| {
            MoltenError::runtime(format!(
                "cannot unpack {} into {} names (line {line})",
                item.kind_name(),
                targets.len()
            ))
        })?;
        if parts.len() != targets.len() {
            return Err(MoltenError::runtime(format!(
                "expected {} values to unpack, found {} (line {line})",
                targets.len(),
                parts.len()
            )));
        }
        for (target, part) in targets.iter().zip(parts) {
            self.frames.set(target.clone(), part);
        }
        Ok(())
    }

    /// Renders `body` into a fresh buffer inside its own child scope.
    fn capture_body(&mut self, body: &[Step]) -> MoltenResult<String> {
        let saved_out = std::mem::take(&mut self.out);
        let saved_frame = self.frames.current();
        self.frames.push();
        let result = self.render_body(body);
        self.frames.restore(saved_frame);
        let text = std::mem::replace(&mut self.out, saved_out);
        result?;
        Ok(text)
    }

    /// Already-rendered text is final markup under autoescaping.
    fn mark_rendered(&self, text: String) -> Value {
        if self.env.autoescape() {
            Value::safe(text)
        } else {
            Value::from(text)
        }
    }

    pub(crate) fn write_value(&mut self, value: &Value, line: u32) -> MoltenResult<()> {
        if value.is_undefined() {
            if self.strict() {
                return Err(MoltenError::undefined(format!(
                    "output of an undefined value (line {line})"
                )));
            }
            return Ok(());
        }
        if self.env.autoescape() && !value.is_safe() {
            self.out.push_str(&crate::value::html_escape(&value.display()));
        } else {
            self.out.push_str(&value.display());
        }
        Ok(())
    }

    pub(crate) fn strict(&self) -> bool {
        self.env.undefined() == UndefinedBehavior::Strict
    }

    /// Truthiness of a value used as a condition. Strict mode refuses to
    /// coerce Undefined to a boolean, in any condition position.
    pub(crate) fn check_condition(&self, value: &Value, line: u32) -> MoltenResult<bool> {
        if value.is_undefined() && self.strict() {
            return Err(MoltenError::undefined(format!(
                "undefined value in condition (line {line})"
            )));
        }
        Ok(value.truthy())
    }

    fn check_recursion(&self, line: u32) -> MoltenResult<()> {
        if self.depth >= self.env.max_recursion() {
            return Err(MoltenError::runtime(format!(
                "recursion limit of {} exceeded (line {line})",
                self.env.max_recursion()
            )));
        }
        Ok(())
    }
}

/// Builds the bound `forloop.cycle` function for one loop run.
pub(crate) fn loop_cycle_fn(control: &LoopValue) -> Value {
    let counter = Arc::clone(&control.cycle);
    Value::Func(Arc::new(HostFn::new("cycle", move |args, _kwargs| {
        if args.is_empty() {
            return Err(MoltenError::runtime("cycle needs at least one argument"));
        }
        let mut n = counter.lock().unwrap_or_else(|e| e.into_inner());
        let picked = args[*n % args.len()].clone();
        *n += 1;
        Ok(picked)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn popping_a_frame_keeps_it_readable_by_index() {
        let mut frames = Frames::new();
        frames.set("a", Value::Int(1));
        let child = frames.push();
        frames.set("b", Value::Int(2));
        frames.restore(0);

        assert!(frames.get("b").is_none());
        assert_eq!(frames.get_in(child, "b"), Some(&Value::Int(2)));
        assert_eq!(frames.get_in(child, "a"), Some(&Value::Int(1)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn root_frames_do_not_see_outer_scopes() {
        let mut frames = Frames::new();
        frames.set("a", Value::Int(1));
        let isolated = frames.push_root();
        assert!(frames.get_in(isolated, "a").is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn sibling_scopes_share_the_parent() {
        let mut frames = Frames::new();
        let root = frames.current();
        frames.push_child_of(root);
        frames.set("x", Value::Int(1));
        frames.restore(root);
        frames.push_child_of(root);
        assert!(frames.get("x").is_none());
    }
}
