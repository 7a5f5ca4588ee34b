//! The environment: registries, globals, engine settings and the
//! template store.
//!
//! Settings that affect compilation (autoescaping, whitespace handling)
//! should be configured before templates are added, since compiled units
//! bake them in.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::compile::{RenderUnit, compile};
use crate::error::{MoltenError, MoltenResult};
use crate::lexer::LexerOptions;
use crate::parser::parse;
use crate::registry::{FilterFn, Registry, TestFn};
use crate::sandbox::SandboxPolicy;
use crate::template::Template;
use crate::value::{HostFn, UndefinedBehavior, Value};

const DEFAULT_RECURSION_LIMIT: usize = 64;
const MAX_RANGE_LEN: i64 = 1_000_000;

/// Source text handed back by a loader, with an optional version token
/// used as part of the compile-cache key.
#[derive(Debug, Clone)]
pub struct LoaderSource {
    pub source: String,
    pub version: Option<String>,
}

pub trait Loader: Send + Sync {
    fn get_source(&self, name: &str) -> MoltenResult<LoaderSource>;
}

/// Serves templates from an owned name-to-source map.
#[derive(Debug, Default)]
pub struct MapLoader {
    templates: HashMap<String, String>,
}

impl MapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.templates.insert(name.into(), source.into());
    }
}

impl Loader for MapLoader {
    fn get_source(&self, name: &str) -> MoltenResult<LoaderSource> {
        match self.templates.get(name) {
            Some(source) => Ok(LoaderSource {
                source: source.clone(),
                version: None,
            }),
            None => Err(MoltenError::TemplateNotFound {
                name: name.to_string(),
            }),
        }
    }
}

/// Serves templates from files under a root directory. The file's
/// modification time becomes the version token, so edits invalidate
/// cached compiles.
#[derive(Debug)]
pub struct FileLoader {
    root: PathBuf,
}

impl FileLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if escapes { None } else { Some(self.root.join(relative)) }
    }
}

impl Loader for FileLoader {
    fn get_source(&self, name: &str) -> MoltenResult<LoaderSource> {
        let not_found = || MoltenError::TemplateNotFound {
            name: name.to_string(),
        };
        let path = self.resolve(name).ok_or_else(not_found)?;
        let source = std::fs::read_to_string(&path).map_err(|_| not_found())?;
        let version = std::fs::metadata(&path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos().to_string());
        Ok(LoaderSource { source, version })
    }
}

/// Cache for loader-compiled units, keyed by template name and version.
pub trait UnitCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<RenderUnit>>;
    fn put(&self, key: String, unit: Arc<RenderUnit>);
}

/// Unbounded in-process cache.
#[derive(Default)]
pub struct MemoryCache {
    units: Mutex<HashMap<String, Arc<RenderUnit>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UnitCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Arc<RenderUnit>> {
        let units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.get(key).cloned()
    }

    fn put(&self, key: String, unit: Arc<RenderUnit>) {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.insert(key, unit);
    }
}

pub struct Environment {
    registry: Registry,
    globals: BTreeMap<String, Value>,
    autoescape: bool,
    undefined: UndefinedBehavior,
    sandbox: Option<Arc<dyn SandboxPolicy>>,
    trim_blocks: bool,
    lstrip_blocks: bool,
    max_recursion: usize,
    loader: Option<Arc<dyn Loader>>,
    cache: Option<Arc<dyn UnitCache>>,
    store: RwLock<HashMap<String, Arc<RenderUnit>>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        let mut globals = BTreeMap::new();
        globals.insert(
            "range".to_string(),
            Value::Func(Arc::new(HostFn::new("range", range_fn))),
        );
        Self {
            registry: Registry::with_builtins(),
            globals,
            autoescape: false,
            undefined: UndefinedBehavior::default(),
            sandbox: None,
            trim_blocks: false,
            lstrip_blocks: false,
            max_recursion: DEFAULT_RECURSION_LIMIT,
            loader: None,
            cache: None,
            store: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_autoescape(&mut self, on: bool) {
        self.autoescape = on;
    }

    pub fn set_undefined(&mut self, behavior: UndefinedBehavior) {
        self.undefined = behavior;
    }

    pub fn set_sandbox(&mut self, policy: Option<Arc<dyn SandboxPolicy>>) {
        self.sandbox = policy;
    }

    pub fn set_trim_blocks(&mut self, on: bool) {
        self.trim_blocks = on;
    }

    pub fn set_lstrip_blocks(&mut self, on: bool) {
        self.lstrip_blocks = on;
    }

    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.max_recursion = limit;
    }

    pub fn set_loader(&mut self, loader: Arc<dyn Loader>) {
        self.loader = Some(loader);
    }

    pub fn set_cache(&mut self, cache: Arc<dyn UnitCache>) {
        self.cache = Some(cache);
    }

    pub fn add_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.globals.insert(name.into(), value.into());
    }

    /// Exposes a host function to templates under `name`.
    pub fn add_function<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value], &[(String, Value)]) -> MoltenResult<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let func = Value::Func(Arc::new(HostFn::new(name.clone(), f)));
        self.globals.insert(name, func);
    }

    pub fn add_filter<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &[Value], &[(String, Value)]) -> MoltenResult<Value> + Send + Sync + 'static,
    {
        self.registry
            .add_filter(name.into(), FilterFn::Plain(Box::new(f)));
    }

    pub fn add_test<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &[Value], &[(String, Value)]) -> MoltenResult<bool> + Send + Sync + 'static,
    {
        let test: TestFn = Box::new(f);
        self.registry.add_test(name.into(), test);
    }

    /// Compiles `source` and stores it under `name`. Adding a name twice
    /// is an error; templates are immutable once registered.
    pub fn add_template(&mut self, name: impl Into<String>, source: &str) -> MoltenResult<()> {
        let name = name.into();
        let unit = self.compile_source(source)?;
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        if store.contains_key(&name) {
            return Err(MoltenError::TemplateExists { name });
        }
        tracing::debug!(template = %name, "compiled template");
        store.insert(name, unit);
        Ok(())
    }

    pub fn get_template(&self, name: &str) -> MoltenResult<Template<'_>> {
        let unit = self.load_unit(name)?;
        Ok(Template::new(self, name.to_string(), unit))
    }

    /// Compiles and renders `source` in one shot, without storing it.
    pub fn render_str(
        &self,
        source: &str,
        vars: BTreeMap<String, Value>,
    ) -> MoltenResult<String> {
        let unit = self.compile_source(source)?;
        Template::new(self, "<string>".to_string(), unit).render(vars)
    }

    /// Looks `name` up in the store, then through the loader, consulting
    /// the compile cache when one is configured.
    pub(crate) fn load_unit(&self, name: &str) -> MoltenResult<Arc<RenderUnit>> {
        {
            let store = self.store.read().unwrap_or_else(|e| e.into_inner());
            if let Some(unit) = store.get(name) {
                return Ok(Arc::clone(unit));
            }
        }
        let Some(loader) = &self.loader else {
            return Err(MoltenError::TemplateNotFound {
                name: name.to_string(),
            });
        };
        let LoaderSource { source, version } = loader.get_source(name)?;
        let key = match &version {
            Some(version) => format!("{name}@{version}"),
            None => name.to_string(),
        };
        if let Some(cache) = &self.cache {
            if let Some(unit) = cache.get(&key) {
                return Ok(unit);
            }
        }
        tracing::debug!(template = %name, "compiling loaded template");
        let unit = self.compile_source(&source)?;
        if let Some(cache) = &self.cache {
            cache.put(key, Arc::clone(&unit));
        }
        Ok(unit)
    }

    pub(crate) fn compile_source(&self, source: &str) -> MoltenResult<Arc<RenderUnit>> {
        let options = LexerOptions {
            trim_blocks: self.trim_blocks,
            lstrip_blocks: self.lstrip_blocks,
        };
        let ast = parse(source, options)?;
        Ok(Arc::new(compile(ast, self)?))
    }

    pub(crate) fn autoescape(&self) -> bool {
        self.autoescape
    }

    pub(crate) fn undefined(&self) -> UndefinedBehavior {
        self.undefined
    }

    pub(crate) fn sandbox(&self) -> Option<&Arc<dyn SandboxPolicy>> {
        self.sandbox.as_ref()
    }

    pub(crate) fn max_recursion(&self) -> usize {
        self.max_recursion
    }

    pub(crate) fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub(crate) fn filter(&self, name: &str) -> Option<&FilterFn> {
        self.registry.filter(name)
    }

    pub(crate) fn test(&self, name: &str) -> Option<&TestFn> {
        self.registry.test(name)
    }

    pub(crate) fn has_filter(&self, name: &str) -> bool {
        self.registry.has_filter(name)
    }

    pub(crate) fn has_test(&self, name: &str) -> bool {
        self.registry.has_test(name)
    }

    pub(crate) fn unknown_filter(&self, name: &str, line: u32) -> MoltenError {
        let known: Vec<&str> = self.registry.filter_names().collect();
        MoltenError::assertion(
            line,
            format!("unknown filter '{name}' (known filters: {})", known.join(", ")),
        )
    }

    pub(crate) fn unknown_test(&self, name: &str, line: u32) -> MoltenError {
        let known: Vec<&str> = self.registry.test_names().collect();
        MoltenError::assertion(
            line,
            format!("unknown test '{name}' (known tests: {})", known.join(", ")),
        )
    }
}

fn range_fn(args: &[Value], _kwargs: &[(String, Value)]) -> MoltenResult<Value> {
    let int = |value: &Value| match value {
        Value::Int(i) => Ok(*i),
        other => Err(MoltenError::runtime(format!(
            "range arguments must be integers, found {}",
            other.kind_name()
        ))),
    };
    let (start, stop, step) = match args {
        [stop] => (0, int(stop)?, 1),
        [start, stop] => (int(start)?, int(stop)?, 1),
        [start, stop, step] => (int(start)?, int(stop)?, int(step)?),
        _ => return Err(MoltenError::runtime("range takes one to three arguments")),
    };
    if step == 0 {
        return Err(MoltenError::runtime("range step must not be zero"));
    }
    let span = if step > 0 {
        stop.checked_sub(start)
    } else {
        start.checked_sub(stop)
    };
    match span {
        Some(span) if span / step.abs() <= MAX_RANGE_LEN => {}
        _ => return Err(MoltenError::runtime("range is too large")),
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        items.push(Value::Int(i));
        i += step;
    }
    Ok(items.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    #[test]
    #[ntest::timeout(100)]
    fn render_str_compiles_and_renders() {
        let env = Environment::new();
        let out = env.render_str("{{ 1 + 2 }} and {{ 'x' | upper }}", vars()).unwrap();
        assert_eq!(out, "3 and X");
    }

    #[test]
    #[ntest::timeout(100)]
    fn adding_a_template_twice_is_rejected() {
        let mut env = Environment::new();
        env.add_template("page", "hi").unwrap();
        assert!(matches!(
            env.add_template("page", "again"),
            Err(MoltenError::TemplateExists { .. })
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn missing_templates_report_their_name() {
        let env = Environment::new();
        let Err(err) = env.get_template("nope") else {
            panic!("expected a missing-template error");
        };
        assert!(matches!(err, MoltenError::TemplateNotFound { ref name } if name == "nope"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn map_loader_serves_templates_on_demand() {
        let mut loader = MapLoader::new();
        loader.insert("hello", "hello {{ who }}");
        let mut env = Environment::new();
        env.set_loader(Arc::new(loader));
        env.set_cache(Arc::new(MemoryCache::new()));

        let template = env.get_template("hello").unwrap();
        let mut vars = vars();
        vars.insert("who".to_string(), Value::from("world"));
        assert_eq!(template.render(vars).unwrap(), "hello world");
    }

    #[test]
    #[ntest::timeout(100)]
    fn file_loader_rejects_escaping_paths() {
        let loader = FileLoader::new("/tmp/templates");
        assert!(loader.resolve("../etc/passwd").is_none());
        assert!(loader.resolve("/etc/passwd").is_none());
        assert!(loader.resolve("sub/page.html").is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn custom_filters_functions_and_tests() {
        let mut env = Environment::new();
        env.add_filter("shout", |value, _, _| {
            Ok(Value::from(format!("{}!", value.display())))
        });
        env.add_test("big", |value, _, _| Ok(matches!(value, Value::Int(i) if *i > 100)));
        env.add_function("double", |args, _| match args {
            [Value::Int(i)] => Ok(Value::Int(i * 2)),
            _ => Err(MoltenError::runtime("double needs one integer")),
        });
        env.add_global("greeting", "hey");

        let out = env
            .render_str(
                "{{ greeting | shout }} {{ double(21) }} {{ 200 is big }}",
                vars(),
            )
            .unwrap();
        assert_eq!(out, "hey! 42 True");
    }

    #[test]
    #[ntest::timeout(100)]
    fn range_produces_sequences() {
        let env = Environment::new();
        assert_eq!(
            env.render_str("{% for i in range(3) %}{{ i }}{% endfor %}", vars()).unwrap(),
            "012"
        );
        assert_eq!(
            env.render_str("{% for i in range(5, 1, -2) %}{{ i }}{% endfor %}", vars())
                .unwrap(),
            "53"
        );
        assert!(env.render_str("{{ range(0, 1, 0) }}", vars()).is_err());
    }
}
