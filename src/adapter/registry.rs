//! Adapter registry and factory: lazy construction, memoization, plugins.

use super::{AdapterDescriptor, AdapterKind, AdapterRef};
use crate::error::{Error, Result};
use crate::workflow::Step;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Constructor closure producing a fresh adapter.
pub type ConstructorFn = Box<dyn Fn() -> Result<AdapterRef> + Send + Sync>;

/// Deferred-loading descriptor for an adapter provided by a plugin.
///
/// Written as `module.path:Symbol` with an optional `#param` suffix for
/// parameterized adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub module: String,
    pub symbol: String,
    pub param: Option<String>,
}

impl PluginSpec {
    /// Parse a `module:Symbol` or `module:Symbol#param` reference.
    pub fn parse(reference: &str) -> Result<Self> {
        let (path, param) = match reference.split_once('#') {
            Some((path, param)) => (path, Some(param.to_string())),
            None => (reference, None),
        };
        let (module, symbol) = path
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("invalid plugin reference: {}", reference)))?;
        Ok(Self {
            module: module.to_string(),
            symbol: symbol.to_string(),
            param,
        })
    }
}

/// Resolves [`PluginSpec`]s into adapter instances.
///
/// The core ships no loader; hosts embedding the orchestrator install one
/// that knows how to materialize their plugin format.
pub trait PluginLoader: Send + Sync {
    fn load(&self, name: &str, spec: &PluginSpec) -> Result<AdapterRef>;
}

enum Registration {
    Constructor(ConstructorFn),
    Plugin(PluginSpec),
}

#[derive(Default)]
struct FactoryState {
    instances: HashMap<String, AdapterRef>,
    registrations: HashMap<String, Registration>,
    /// Construction failures, remembered so later calls short-circuit
    failed: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PluginManifest {
    #[serde(default)]
    adapters: HashMap<String, String>,
}

/// Factory for adapter instances.
///
/// Supports three registration modes: prebuilt instances, constructor
/// closures, and plugin references resolved through a [`PluginLoader`].
/// Construction is memoized; the single mutex guarantees at most one
/// constructor runs per key.
pub struct AdapterFactory {
    state: Mutex<FactoryState>,
    loader: Option<Box<dyn PluginLoader>>,
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FactoryState::default()),
            loader: None,
        }
    }

    /// Install a plugin loader for deferred registrations.
    pub fn with_plugin_loader(mut self, loader: Box<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Register a prebuilt adapter instance (eager).
    pub fn register_instance(&self, adapter: AdapterRef) {
        let name = adapter.name().to_string();
        let mut state = self.state.lock().expect("factory lock poisoned");
        state.instances.insert(name.clone(), adapter);
        debug!(adapter = %name, "registered adapter instance");
    }

    /// Register a constructor for lazy instantiation.
    pub fn register_constructor(&self, name: impl Into<String>, constructor: ConstructorFn) {
        let name = name.into();
        let mut state = self.state.lock().expect("factory lock poisoned");
        state
            .registrations
            .insert(name.clone(), Registration::Constructor(constructor));
        debug!(adapter = %name, "registered adapter constructor");
    }

    /// Register a plugin reference for deferred loading.
    pub fn register_plugin(&self, name: impl Into<String>, spec: PluginSpec) {
        let name = name.into();
        let mut state = self.state.lock().expect("factory lock poisoned");
        state
            .registrations
            .insert(name.clone(), Registration::Plugin(spec));
        debug!(adapter = %name, "registered plugin adapter");
    }

    /// Learn additional `key -> plugin reference` entries from a manifest
    /// file. A missing manifest is not an error; the core functions without
    /// plugins.
    pub fn load_plugin_manifest(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(0);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let manifest: PluginManifest = serde_yaml::from_str(&text)?;
        let mut count = 0;
        for (name, reference) in manifest.adapters {
            match PluginSpec::parse(&reference) {
                Ok(spec) => {
                    self.register_plugin(name, spec);
                    count += 1;
                }
                Err(e) => warn!(adapter = %name, error = %e, "skipping malformed plugin entry"),
            }
        }
        Ok(count)
    }

    /// Create or retrieve an adapter.
    ///
    /// Resolution order: cached instance, remembered failure, constructor,
    /// plugin loader. A failed construction is remembered so later calls
    /// return the same diagnostic without retrying.
    pub fn create(&self, name: &str) -> Result<AdapterRef> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("factory lock poisoned".into()))?;

        if let Some(adapter) = state.instances.get(name) {
            return Ok(adapter.clone());
        }
        if let Some(diagnostic) = state.failed.get(name) {
            return Err(Error::adapter_construction(name, diagnostic.clone()));
        }

        let built = match state.registrations.get(name) {
            Some(Registration::Constructor(constructor)) => constructor(),
            Some(Registration::Plugin(spec)) => match &self.loader {
                Some(loader) => loader.load(name, spec),
                None => Err(Error::adapter_construction(
                    name,
                    "plugin registered but no plugin loader installed",
                )),
            },
            None => return Err(Error::AdapterNotFound(name.to_string())),
        };

        match built {
            Ok(adapter) => {
                state.instances.insert(name.to_string(), adapter.clone());
                debug!(adapter = %name, "constructed adapter");
                Ok(adapter)
            }
            Err(e) => {
                warn!(adapter = %name, error = %e, "adapter construction failed");
                state.failed.insert(name.to_string(), e.to_string());
                Err(Error::adapter_construction(name, e.to_string()))
            }
        }
    }

    /// Whether a key is known, constructed or not.
    pub fn is_registered(&self, name: &str) -> bool {
        let state = self.state.lock().expect("factory lock poisoned");
        state.instances.contains_key(name) || state.registrations.contains_key(name)
    }

    /// All registered keys, sorted.
    pub fn names(&self) -> Vec<String> {
        let state = self.state.lock().expect("factory lock poisoned");
        let mut names: Vec<String> = state
            .instances
            .keys()
            .chain(state.registrations.keys())
            .cloned()
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }

    /// Descriptors for every key without forcing construction.
    ///
    /// Constructed adapters report their real metadata; lazy entries get the
    /// conservative default so the router can still consider them.
    pub fn descriptors(&self) -> HashMap<String, AdapterDescriptor> {
        let state = self.state.lock().expect("factory lock poisoned");
        let mut out = HashMap::new();
        for (name, adapter) in &state.instances {
            out.insert(name.clone(), adapter.descriptor());
        }
        for name in state.registrations.keys() {
            if !out.contains_key(name) && !state.failed.contains_key(name) {
                out.insert(name.clone(), AdapterDescriptor::lazy_default(name));
            }
        }
        out
    }

    /// Drop cached instances and remembered failures (testing hook).
    pub fn clear_cache(&self) {
        let mut state = self.state.lock().expect("factory lock poisoned");
        state.instances.clear();
        state.failed.clear();
    }
}

/// Keyed registry of adapters, the single lookup point for routing and
/// execution.
pub struct AdapterRegistry {
    factory: AdapterFactory,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factory: AdapterFactory::new(),
        }
    }

    /// Registry pre-wired with the built-in adapter set.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_defaults();
        registry
    }

    /// Wire the built-in adapters as lazy constructors.
    pub fn register_defaults(&self) {
        use super::builtin::*;
        self.factory.register_constructor("code_fixers", {
            Box::new(|| Ok(std::sync::Arc::new(CodeFixersAdapter::new()) as AdapterRef))
        });
        self.factory.register_constructor("vscode_diagnostics", {
            Box::new(|| Ok(std::sync::Arc::new(VscodeDiagnosticsAdapter::new()) as AdapterRef))
        });
        self.factory.register_constructor("pytest_runner", {
            Box::new(|| Ok(std::sync::Arc::new(PytestRunnerAdapter::new()) as AdapterRef))
        });
        self.factory.register_constructor("git_ops", {
            Box::new(|| Ok(std::sync::Arc::new(GitOpsAdapter::new()) as AdapterRef))
        });
        self.factory.register_constructor("ai_editor", {
            Box::new(|| Ok(std::sync::Arc::new(AiEditorAdapter::new()) as AdapterRef))
        });
        self.factory.register_constructor("ai_analyst", {
            Box::new(|| Ok(std::sync::Arc::new(AiAnalystAdapter::new()) as AdapterRef))
        });
    }

    /// Access the underlying factory for custom registrations.
    pub fn factory(&self) -> &AdapterFactory {
        &self.factory
    }

    /// Register a prebuilt adapter.
    pub fn register(&self, adapter: AdapterRef) {
        self.factory.register_instance(adapter);
    }

    /// Resolve an adapter, constructing it on first use.
    pub fn get(&self, name: &str) -> Result<AdapterRef> {
        self.factory.create(name)
    }

    /// Whether the adapter resolves and reports itself available.
    pub fn is_available(&self, name: &str) -> bool {
        match self.factory.create(name) {
            Ok(adapter) => adapter.is_available(),
            Err(_) => false,
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factory.is_registered(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factory.names()
    }

    /// Descriptors without forcing construction of lazy entries.
    pub fn descriptors(&self) -> HashMap<String, AdapterDescriptor> {
        self.factory.descriptors()
    }

    /// Names of available adapters of one kind (constructs on demand).
    pub fn available_by_kind(&self, kind: AdapterKind) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|name| {
                self.factory
                    .create(name)
                    .map(|a| a.kind() == kind && a.is_available())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Delegate structural validation to the adapter.
    pub fn validate_step(&self, name: &str, step: &Step) -> bool {
        self.factory
            .create(name)
            .map(|a| a.validate_step(step))
            .unwrap_or(false)
    }

    /// Delegate cost estimation to the adapter; unknown adapters cost zero.
    pub fn estimate_cost(&self, name: &str, step: &Step) -> u64 {
        self.factory
            .create(name)
            .map(|a| a.estimate_cost(step))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::ScriptedAdapter;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_plugin_spec_parse() {
        let spec = PluginSpec::parse("ext.adapters:LintBridge").unwrap();
        assert_eq!(spec.module, "ext.adapters");
        assert_eq!(spec.symbol, "LintBridge");
        assert_eq!(spec.param, None);

        let spec = PluginSpec::parse("ext.adapters:ToolBridge#vcs").unwrap();
        assert_eq!(spec.param.as_deref(), Some("vcs"));

        assert!(PluginSpec::parse("no-symbol-here").is_err());
    }

    #[test]
    fn test_constructor_runs_once() {
        static BUILDS: AtomicU64 = AtomicU64::new(0);
        let factory = AdapterFactory::new();
        factory.register_constructor(
            "counted",
            Box::new(|| {
                BUILDS.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(ScriptedAdapter::deterministic("counted")) as AdapterRef)
            }),
        );

        let a = factory.create("counted").unwrap();
        let b = factory.create("counted").unwrap();
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn test_failed_construction_is_remembered() {
        let factory = AdapterFactory::new();
        factory.register_constructor(
            "broken",
            Box::new(|| Err(crate::error::Error::Internal("no binary".into()))),
        );

        let first = factory.create("broken").unwrap_err();
        assert!(first.to_string().contains("no binary"));
        // Second call short-circuits with the remembered diagnostic.
        let second = factory.create("broken").unwrap_err();
        assert!(second.to_string().contains("no binary"));
    }

    #[test]
    fn test_unknown_adapter() {
        let factory = AdapterFactory::new();
        let err = factory.create("nope").unwrap_err();
        assert!(matches!(err, Error::AdapterNotFound(_)));
    }

    #[test]
    fn test_plugin_without_loader_fails_construction() {
        let factory = AdapterFactory::new();
        factory.register_plugin("ext", PluginSpec::parse("ext.mod:Thing").unwrap());
        let err = factory.create("ext").unwrap_err();
        assert!(err.to_string().contains("no plugin loader"));
    }

    #[test]
    fn test_plugin_loader_resolves() {
        struct StaticLoader;
        impl PluginLoader for StaticLoader {
            fn load(&self, name: &str, _spec: &PluginSpec) -> crate::error::Result<AdapterRef> {
                Ok(Arc::new(ScriptedAdapter::deterministic(name)))
            }
        }

        let factory = AdapterFactory::new().with_plugin_loader(Box::new(StaticLoader));
        factory.register_plugin("ext", PluginSpec::parse("ext.mod:Thing").unwrap());
        let adapter = factory.create("ext").unwrap();
        assert_eq!(adapter.name(), "ext");
    }

    #[test]
    fn test_manifest_loading() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("plugins.yaml");
        std::fs::write(
            &manifest,
            "adapters:\n  lint_bridge: \"ext.adapters:LintBridge\"\n  bad_entry: \"nocolon\"\n",
        )
        .unwrap();

        let factory = AdapterFactory::new();
        let count = factory.load_plugin_manifest(&manifest).unwrap();
        assert_eq!(count, 1);
        assert!(factory.is_registered("lint_bridge"));
        assert!(!factory.is_registered("bad_entry"));

        // Missing manifest is a no-op.
        assert_eq!(
            factory
                .load_plugin_manifest(dir.path().join("absent.yaml"))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_descriptors_do_not_force_construction() {
        static BUILDS: AtomicU64 = AtomicU64::new(0);
        let factory = AdapterFactory::new();
        factory.register_constructor(
            "lazy",
            Box::new(|| {
                BUILDS.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(ScriptedAdapter::ai("lazy", 100)) as AdapterRef)
            }),
        );

        let descriptors = factory.descriptors();
        assert_eq!(BUILDS.load(Ordering::SeqCst), 0);
        // Lazy entries advertise the conservative default.
        let d = &descriptors["lazy"];
        assert_eq!(d.kind, AdapterKind::Deterministic);
        assert!(d.available);

        // After construction the real metadata shows through.
        factory.create("lazy").unwrap();
        let descriptors = factory.descriptors();
        assert_eq!(descriptors["lazy"].kind, AdapterKind::Ai);
    }

    #[test]
    fn test_registry_availability() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(ScriptedAdapter::deterministic("fixer")));
        registry.register(Arc::new(ScriptedAdapter::deterministic("offline").unavailable()));

        assert!(registry.is_available("fixer"));
        assert!(!registry.is_available("offline"));
        assert!(!registry.is_available("missing"));
        assert!(registry.is_registered("offline"));
    }

    #[test]
    fn test_registry_by_kind() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(ScriptedAdapter::deterministic("fixer")));
        registry.register(Arc::new(ScriptedAdapter::ai("editor", 500)));

        assert_eq!(
            registry.available_by_kind(AdapterKind::Deterministic),
            vec!["fixer"]
        );
        assert_eq!(registry.available_by_kind(AdapterKind::Ai), vec!["editor"]);
    }
}
