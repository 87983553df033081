//! Backup size estimation methods.
//!
//! Selected per backupset via `estimation-method = <name>:<arg>`. The
//! estimate feeds the free-space precheck run by the estimation hook before
//! a backup writes any data.

use crate::core::backup_plugin::BackupStrategy;
use crate::core::controller::BackupContext;
use crate::core::plugin::{PluginInfo, PluginRegistry};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::util::{directory_size, format_bytes, parse_bytes};
use std::path::Path;

pub const NAMESPACE: &str = "holland.backup.estimation";

/// An estimation method produces a byte figure for the upcoming backup.
pub trait EstimationMethod {
    fn info(&self) -> &PluginInfo;

    fn estimate(
        &self,
        arg: &str,
        ctx: &mut BackupContext<'_>,
        plugin: &mut dyn BackupStrategy,
    ) -> Result<u64>;
}

fn info(name: &str, summary: &str) -> PluginInfo {
    PluginInfo::builder()
        .namespace(NAMESPACE)
        .name(name)
        .summary(summary)
        .build()
}

/// Ask the backup strategy itself.
pub struct PluginEstimation {
    info: PluginInfo,
}

impl EstimationMethod for PluginEstimation {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn estimate(
        &self,
        _arg: &str,
        ctx: &mut BackupContext<'_>,
        plugin: &mut dyn BackupStrategy,
    ) -> Result<u64> {
        plugin.estimate(ctx)
    }
}

/// Sum the bytes under a directory named by the method argument.
pub struct DirectoryEstimation {
    info: PluginInfo,
}

impl EstimationMethod for DirectoryEstimation {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn estimate(
        &self,
        arg: &str,
        _ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<u64> {
        if arg.is_empty() {
            return Err(Error::backup(
                "estimation-method 'directory' requires a directory argument",
            ));
        }
        directory_size(Path::new(arg))
    }
}

/// Parse the method argument as a constant byte figure, e.g. `const:10G`.
pub struct ConstantEstimation {
    info: PluginInfo,
}

impl EstimationMethod for ConstantEstimation {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn estimate(
        &self,
        arg: &str,
        _ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<u64> {
        parse_bytes(arg)
    }
}

/// Assume the backup will be the size the previous one really was; fall back
/// to the plugin estimator when there is no previous backup.
pub struct LastBackupEstimation {
    info: PluginInfo,
}

impl EstimationMethod for LastBackupEstimation {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn estimate(
        &self,
        _arg: &str,
        ctx: &mut BackupContext<'_>,
        plugin: &mut dyn BackupStrategy,
    ) -> Result<u64> {
        let previous = ctx.controller.catalog().previous_backup(ctx.backup)?;
        match previous.and_then(|backup| backup.real_size.map(|size| (backup, size))) {
            Some((backup, size)) => {
                tracing::info!(
                    "last backup ({}) appeared to have size: {}",
                    backup.backup_directory.display(),
                    format_bytes(size)
                );
                Ok(size)
            }
            None => plugin.estimate(ctx),
        }
    }
}

pub fn register_builtins(registry: &mut PluginRegistry<Box<dyn EstimationMethod>>) {
    registry.register(
        info("plugin", "ask the backup plugin for an estimate"),
        || {
            Box::new(PluginEstimation {
                info: info("plugin", "ask the backup plugin for an estimate"),
            })
        },
    );
    registry.register(info("directory", "sum the size of a directory"), || {
        Box::new(DirectoryEstimation {
            info: info("directory", "sum the size of a directory"),
        })
    });
    registry.register(info("const", "use a constant size"), || {
        Box::new(ConstantEstimation {
            info: info("const", "use a constant size"),
        })
    });
    registry.register(
        info("last-backup", "assume the size of the previous backup"),
        || {
            Box::new(LastBackupEstimation {
                info: info("last-backup", "assume the size of the previous backup"),
            })
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backup_plugin::{BackupStrategy, NAMESPACE as BACKUP_NAMESPACE};
    use crate::core::catalog::{Backup, BackupStatus, Catalog};
    use crate::core::config::Config;
    use crate::core::controller::{BackupContext, BackupController};
    use crate::core::plugin::{PluginHub, PluginLoader, PluginRegistry};
    use crate::core::spool::{BackupNode, BackupSpool};
    use chrono::Duration;
    use tempfile::TempDir;

    struct FixedEstimateStrategy {
        info: PluginInfo,
        estimate: u64,
    }

    impl BackupStrategy for FixedEstimateStrategy {
        fn info(&self) -> &PluginInfo {
            &self.info
        }

        fn estimate(&mut self, _ctx: &mut BackupContext<'_>) -> Result<u64> {
            Ok(self.estimate)
        }

        fn backup(&mut self, _ctx: &mut BackupContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn fixed_strategy(estimate: u64) -> FixedEstimateStrategy {
        FixedEstimateStrategy {
            info: PluginInfo::builder()
                .namespace(BACKUP_NAMESPACE)
                .name("fixed")
                .build(),
            estimate,
        }
    }

    fn load(name: &str) -> Box<dyn EstimationMethod> {
        let mut registry: PluginRegistry<Box<dyn EstimationMethod>> = PluginRegistry::new();
        register_builtins(&mut registry);
        registry.load(NAMESPACE, name).unwrap()
    }

    fn context_parts() -> (TempDir, BackupController, Backup, Config, BackupNode) {
        let tmp = TempDir::new().unwrap();
        let spool = BackupSpool::new(tmp.path().join("spool"));
        let catalog = Catalog::open("").unwrap();
        let controller = BackupController::new(spool, catalog, PluginHub::builtin().into_shared());
        let node = controller.spool().add_node("alpha", None).unwrap();
        let mut backup = Backup::new(None, "alpha");
        backup.backup_directory = node.path().to_path_buf();
        (tmp, controller, backup, Config::new(), node)
    }

    #[test]
    fn test_registry_carries_all_methods() {
        let mut registry: PluginRegistry<Box<dyn EstimationMethod>> = PluginRegistry::new();
        register_builtins(&mut registry);
        for name in ["plugin", "directory", "const", "last-backup"] {
            assert!(registry.load(NAMESPACE, name).is_ok(), "missing {name}");
        }
        assert!(registry.load(NAMESPACE, "guess").is_err());
    }

    #[test]
    fn test_plugin_method_asks_strategy() {
        let (_tmp, mut controller, mut backup, config, node) = context_parts();
        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut controller,
            is_dryrun: false,
        };
        let mut plugin = fixed_strategy(42);

        let estimated = load("plugin").estimate("", &mut ctx, &mut plugin).unwrap();
        assert_eq!(estimated, 42);
    }

    #[test]
    fn test_directory_method_sums_directory() {
        let (tmp, mut controller, mut backup, config, node) = context_parts();
        let data_dir = tmp.path().join("data");
        std::fs::create_dir_all(data_dir.join("sub")).unwrap();
        std::fs::write(data_dir.join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(data_dir.join("sub/b"), vec![0u8; 50]).unwrap();

        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut controller,
            is_dryrun: false,
        };
        let mut plugin = fixed_strategy(0);

        let estimated = load("directory")
            .estimate(&data_dir.to_string_lossy(), &mut ctx, &mut plugin)
            .unwrap();
        assert!(estimated >= 150, "expected at least 150 bytes, got {estimated}");
    }

    #[test]
    fn test_directory_method_requires_argument() {
        let (_tmp, mut controller, mut backup, config, node) = context_parts();
        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut controller,
            is_dryrun: false,
        };
        let mut plugin = fixed_strategy(0);

        assert!(load("directory").estimate("", &mut ctx, &mut plugin).is_err());
    }

    #[test]
    fn test_const_method_parses_byte_strings() {
        let (_tmp, mut controller, mut backup, config, node) = context_parts();
        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut controller,
            is_dryrun: false,
        };
        let mut plugin = fixed_strategy(0);
        let estimator = load("const");

        assert_eq!(estimator.estimate("1K", &mut ctx, &mut plugin).unwrap(), 1024);
        assert_eq!(estimator.estimate("100", &mut ctx, &mut plugin).unwrap(), 100);
        assert!(estimator.estimate("lots", &mut ctx, &mut plugin).is_err());
    }

    #[test]
    fn test_last_backup_uses_previous_real_size() {
        let (_tmp, mut controller, mut backup, config, node) = context_parts();

        let mut previous = Backup::new(None, "alpha");
        previous.start_time = backup.start_time - Duration::seconds(100);
        previous.status = BackupStatus::Completed;
        previous.real_size = Some(4096);
        previous.backup_directory = backup.backup_directory.clone();
        controller.catalog().insert_backup(&mut previous).unwrap();

        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut controller,
            is_dryrun: false,
        };
        // the plugin's own figure must not be consulted
        let mut plugin = fixed_strategy(7);

        let estimated = load("last-backup").estimate("", &mut ctx, &mut plugin).unwrap();
        assert_eq!(estimated, 4096);
    }

    #[test]
    fn test_last_backup_falls_back_without_previous() {
        let (_tmp, mut controller, mut backup, config, node) = context_parts();
        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut controller,
            is_dryrun: false,
        };
        let mut plugin = fixed_strategy(777);

        let estimated = load("last-backup").estimate("", &mut ctx, &mut plugin).unwrap();
        assert_eq!(estimated, 777, "empty catalog must fall back to the plugin estimate");
    }

    #[test]
    fn test_last_backup_falls_back_when_previous_has_no_size() {
        let (_tmp, mut controller, mut backup, config, node) = context_parts();

        let mut previous = Backup::new(None, "alpha");
        previous.start_time = backup.start_time - Duration::seconds(100);
        previous.status = BackupStatus::Completed;
        previous.backup_directory = backup.backup_directory.clone();
        controller.catalog().insert_backup(&mut previous).unwrap();

        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut controller,
            is_dryrun: false,
        };
        let mut plugin = fixed_strategy(512);

        let estimated = load("last-backup").estimate("", &mut ctx, &mut plugin).unwrap();
        assert_eq!(estimated, 512, "a previous backup without a real size must not be used");
    }
}
