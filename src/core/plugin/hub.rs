//! The plugin hub.
//!
//! One value owning every plugin registry the controller consults. There is
//! no process-global registry: the hub is built at startup (or per test)
//! and handed to the controller, so tests always get an isolated set.

use crate::core::archive::{self, Archiver};
use crate::core::backup_plugin::{self, BackupStrategy};
use crate::core::config::validators::ValidatorContext;
use crate::core::estimation::{self, EstimationMethod};
use crate::core::hooks::{self, BackupHook};
use crate::core::plugin::{loadable_names, PluginRegistry};
use crate::core::stream::{self, StreamPlugin};
use std::sync::Arc;

pub struct PluginHub {
    pub strategies: PluginRegistry<Box<dyn BackupStrategy>>,
    pub hooks: PluginRegistry<Box<dyn BackupHook>>,
    pub streams: PluginRegistry<Box<dyn StreamPlugin>>,
    pub archivers: PluginRegistry<Box<dyn Archiver>>,
    pub estimators: PluginRegistry<Box<dyn EstimationMethod>>,
}

impl PluginHub {
    /// An empty hub; plugins must be registered by the caller.
    pub fn empty() -> PluginHub {
        PluginHub {
            strategies: PluginRegistry::new(),
            hooks: PluginRegistry::new(),
            streams: PluginRegistry::new(),
            archivers: PluginRegistry::new(),
            estimators: PluginRegistry::new(),
        }
    }

    /// A hub populated with every builtin plugin.
    pub fn builtin() -> PluginHub {
        let mut hub = PluginHub::empty();
        backup_plugin::register_builtins(&mut hub.strategies);
        hooks::register_builtins(&mut hub.hooks);
        stream::register_builtins(&mut hub.streams);
        archive::register_builtins(&mut hub.archivers);
        estimation::register_builtins(&mut hub.estimators);
        hub
    }

    pub fn into_shared(self) -> Arc<PluginHub> {
        Arc::new(self)
    }

    /// Validator context naming the stream and archiver methods this hub
    /// can actually load.
    pub fn validator_context(&self) -> ValidatorContext {
        ValidatorContext {
            compression_methods: loadable_names(&self.streams, stream::NAMESPACE),
            archive_methods: loadable_names(&self.archivers, archive::NAMESPACE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugin::PluginLoader;

    #[test]
    fn test_builtin_hub_contents() {
        let hub = PluginHub::builtin();
        assert!(hub.strategies.load(backup_plugin::NAMESPACE, "noop").is_ok());
        assert!(hub.streams.load(stream::NAMESPACE, "gzip").is_ok());
        assert!(hub.streams.load(stream::NAMESPACE, "xz").is_ok());
        assert!(hub.archivers.load(archive::NAMESPACE, "tar").is_ok());
        assert!(hub.estimators.load(estimation::NAMESPACE, "last-backup").is_ok());
        assert_eq!(hub.hooks.iterate(hooks::NAMESPACE).count(), 7);
    }

    #[test]
    fn test_validator_context_names() {
        let ctx = PluginHub::builtin().validator_context();
        assert!(ctx.compression_methods.contains(&"pigz".to_string()));
        assert!(ctx.archive_methods.contains(&"dircopy".to_string()));
    }

    #[test]
    fn test_empty_hub_is_isolated() {
        let hub = PluginHub::empty();
        assert!(hub.strategies.load(backup_plugin::NAMESPACE, "noop").is_err());
    }
}
