//! Plugin metadata, registries, and loaders.
//!
//! Plugins are looked up by a `(namespace, name)` pair. A
//! [`PluginRegistry`] is an explicit in-process registry populated at
//! startup; a [`ChainedLoader`] composes several loaders, and a
//! [`DiscoveryLoader`] adapts an external discovery mechanism whose
//! per-plugin construction may fail.

pub mod hub;

pub use hub::PluginHub;

use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use bon::Builder;
use dyn_iter::{DynIter, IntoDynIterator};
use getset::Getters;
use indexmap::IndexMap;
use std::sync::Arc;

/// Descriptive metadata carried by every plugin.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct PluginInfo {
    #[builder(into)]
    namespace: String,
    #[builder(into)]
    name: String,
    #[builder(default)]
    aliases: Vec<String>,
    #[builder(into, default)]
    summary: String,
    #[builder(into, default)]
    description: String,
    #[builder(into, default = "1.1.0".to_string())]
    version: String,
    #[builder(into, default = "1.1".to_string())]
    api_version: String,
}

pub trait PluginLoader<T> {
    /// Construct a fresh plugin instance for `(namespace, name)`.
    fn load(&self, namespace: &str, name: &str) -> Result<T>;

    /// Iterate freshly constructed plugins of a namespace in registration
    /// order, without alias duplicates.
    fn iterate<'a>(&'a self, namespace: &str) -> DynIter<'a, T>;

    /// Plugin metadata for a namespace, in registration order.
    fn infos(&self, namespace: &str) -> Vec<PluginInfo>;
}

/// All names (canonical plus aliases) a loader answers to in a namespace.
pub fn loadable_names<T>(loader: &dyn PluginLoader<T>, namespace: &str) -> Vec<String> {
    let mut names = Vec::new();
    for info in loader.infos(namespace) {
        names.push(info.name().clone());
        names.extend(info.aliases().iter().cloned());
    }
    names
}

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;

struct Registered<T> {
    info: PluginInfo,
    factory: Factory<T>,
}

/// In-process plugin registry: namespace -> (name -> constructor).
pub struct PluginRegistry<T> {
    namespaces: IndexMap<String, IndexMap<String, Registered<T>>>,
    // alias -> canonical name, per namespace
    aliases: IndexMap<String, IndexMap<String, String>>,
}

impl<T> Default for PluginRegistry<T> {
    fn default() -> Self {
        PluginRegistry {
            namespaces: IndexMap::new(),
            aliases: IndexMap::new(),
        }
    }
}

impl<T> PluginRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its name and every alias. A reused name is
    /// logged and the later registration wins.
    pub fn register(&mut self, info: PluginInfo, factory: impl Fn() -> T + Send + Sync + 'static) {
        let namespace = info.namespace().clone();
        let plugins = self.namespaces.entry(namespace.clone()).or_default();
        let aliases = self.aliases.entry(namespace.clone()).or_default();

        if plugins.contains_key(info.name()) || aliases.contains_key(info.name()) {
            tracing::debug!(
                "plugin '{}' already registered under '{}'; replacing",
                info.name(),
                namespace
            );
        }
        aliases.shift_remove(info.name());
        for alias in info.aliases() {
            if plugins.contains_key(alias) || aliases.contains_key(alias) {
                tracing::debug!(
                    "plugin alias '{}' already registered under '{}'; replacing",
                    alias,
                    namespace
                );
            }
            aliases.insert(alias.clone(), info.name().clone());
        }
        plugins.insert(
            info.name().clone(),
            Registered {
                info,
                factory: Arc::new(factory),
            },
        );
    }

    fn resolve<'a>(&'a self, namespace: &str, name: &str) -> Option<&'a Registered<T>> {
        let plugins = self.namespaces.get(namespace)?;
        if let Some(registered) = plugins.get(name) {
            return Some(registered);
        }
        let canonical = self.aliases.get(namespace)?.get(name)?;
        plugins.get(canonical)
    }
}

impl<T> PluginLoader<T> for PluginRegistry<T> {
    fn load(&self, namespace: &str, name: &str) -> Result<T> {
        self.resolve(namespace, name)
            .map(|registered| (registered.factory)())
            .ok_or_else(|| Error::plugin_not_found(namespace, name))
    }

    fn iterate<'a>(&'a self, namespace: &str) -> DynIter<'a, T> {
        match self.namespaces.get(namespace) {
            Some(plugins) => plugins
                .values()
                .map(|registered| (registered.factory)())
                .into_dyn_iter(),
            None => std::iter::empty().into_dyn_iter(),
        }
    }

    fn infos(&self, namespace: &str) -> Vec<PluginInfo> {
        self.namespaces
            .get(namespace)
            .map(|plugins| plugins.values().map(|r| r.info.clone()).collect())
            .unwrap_or_default()
    }
}

type FallibleFactory<T> = Arc<dyn Fn() -> Result<T> + Send + Sync>;

/// Loader over an external discovery mechanism whose plugin construction can
/// fail. Failures propagate from [`PluginLoader::load`] but are swallowed
/// (with a diagnostic) during iteration.
pub struct DiscoveryLoader<T> {
    namespaces: IndexMap<String, IndexMap<String, (PluginInfo, FallibleFactory<T>)>>,
}

impl<T> Default for DiscoveryLoader<T> {
    fn default() -> Self {
        DiscoveryLoader {
            namespaces: IndexMap::new(),
        }
    }
}

impl<T> DiscoveryLoader<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info: PluginInfo, factory: impl Fn() -> Result<T> + Send + Sync + 'static) {
        self.namespaces
            .entry(info.namespace().clone())
            .or_default()
            .insert(info.name().clone(), (info, Arc::new(factory)));
    }
}

impl<T> PluginLoader<T> for DiscoveryLoader<T> {
    fn load(&self, namespace: &str, name: &str) -> Result<T> {
        let (_, factory) = self
            .namespaces
            .get(namespace)
            .and_then(|plugins| plugins.get(name))
            .ok_or_else(|| Error::plugin_not_found(namespace, name))?;
        factory().map_err(|error| Error::plugin_load(namespace, name, error))
    }

    fn iterate<'a>(&'a self, namespace: &str) -> DynIter<'a, T> {
        match self.namespaces.get(namespace) {
            Some(plugins) => plugins
                .iter()
                .filter_map(|(name, (_, factory))| match factory() {
                    Ok(plugin) => Some(plugin),
                    Err(error) => {
                        tracing::debug!("skipping broken plugin '{}': {}", name, error);
                        None
                    }
                })
                .into_dyn_iter(),
            None => std::iter::empty().into_dyn_iter(),
        }
    }

    fn infos(&self, namespace: &str) -> Vec<PluginInfo> {
        self.namespaces
            .get(namespace)
            .map(|plugins| plugins.values().map(|(info, _)| info.clone()).collect())
            .unwrap_or_default()
    }
}

/// Compose several loaders; `load` returns the first success, `iterate`
/// concatenates.
pub struct ChainedLoader<T> {
    loaders: Vec<Arc<dyn PluginLoader<T> + Send + Sync>>,
}

impl<T> Default for ChainedLoader<T> {
    fn default() -> Self {
        ChainedLoader {
            loaders: Vec::new(),
        }
    }
}

impl<T> ChainedLoader<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loader: Arc<dyn PluginLoader<T> + Send + Sync>) {
        self.loaders.push(loader);
    }
}

impl<T> PluginLoader<T> for ChainedLoader<T> {
    fn load(&self, namespace: &str, name: &str) -> Result<T> {
        let mut last_error = None;
        for loader in &self.loaders {
            match loader.load(namespace, name) {
                Ok(plugin) => return Ok(plugin),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::plugin_not_found(namespace, name)))
    }

    fn iterate<'a>(&'a self, namespace: &str) -> DynIter<'a, T> {
        let namespace = namespace.to_string();
        self.loaders
            .iter()
            .flat_map(move |loader| loader.iterate(&namespace))
            .into_dyn_iter()
    }

    fn infos(&self, namespace: &str) -> Vec<PluginInfo> {
        self.loaders
            .iter()
            .flat_map(|loader| loader.infos(namespace))
            .collect()
    }
}
