//! The backup strategy interface.
//!
//! A strategy is the plugin that actually produces backup artifacts under
//! the node directory handed to it. Real strategies (mysqldump, LVM
//! snapshots, pg_dump) live outside the core; the `noop` strategy ships
//! here as a stub for disabling backups and exercising the pipeline.

use crate::core::config::Configspec;
use crate::core::controller::BackupContext;
use crate::core::plugin::{PluginInfo, PluginRegistry};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use nix::sys::signal::Signal;
use std::borrow::Cow;

pub const NAMESPACE: &str = "holland.backup";

/// Configspec every backupset config is validated against; strategy specs
/// are melded on top of this.
pub const BASE_CONFIGSPEC: &str = "\
[holland:backup]
backup-plugin = string
estimation-method = namearg(default='plugin:')
estimated-size-adjust-by-percent = percent(default='100%')
checksum-algorithm = option(md5, sha1, sha256, sha512, none, default=sha256)
retention-count = integer(min=0, default=1)
purge-policy = option(manual, before-backup, after-backup, default=after-backup)
before-backup-command = cmdline(default=list())
after-backup-command = cmdline(default=list())
completed-backup-command = cmdline(default=list())
failed-backup-command = cmdline(default=list())

[compression]
method = compression(default=gzip)
level = integer(min=0, max=9, default=1)
options = cmdline(default=list())
additional-args = cmdline(default=list(), aliasof='options')
inline = boolean(default=yes)
";

pub fn base_configspec() -> Result<Configspec> {
    Configspec::from_string(BASE_CONFIGSPEC)
}

/// Raise a typed strategy failure.
pub fn fail<T>(reason: impl Into<Cow<'static, str>>) -> Result<T> {
    Err(Error::backup(reason.into()))
}

/// Capability set implemented by backup strategies.
///
/// Every method receives the [`BackupContext`] binding the strategy to the
/// backup row, the validated config, the spool node, and the controller.
/// `backup()` must write its artifacts under
/// `ctx.backup.backup_directory`.
pub trait BackupStrategy {
    fn info(&self) -> &PluginInfo;

    /// This strategy's configspec, melded with the base spec.
    fn configspec(&self) -> Result<Configspec> {
        base_configspec()
    }

    fn setup(&mut self, _ctx: &mut BackupContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Estimated size in bytes of the backup this strategy will produce.
    fn estimate(&mut self, _ctx: &mut BackupContext<'_>) -> Result<u64> {
        Ok(0)
    }

    fn backup(&mut self, ctx: &mut BackupContext<'_>) -> Result<()>;

    /// Run as many checks as are feasible without producing a backup.
    fn dryrun(&mut self, _ctx: &mut BackupContext<'_>) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut BackupContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Free external resources still held by a previous run (e.g. a
    /// snapshot that is still mounted).
    fn release(&mut self, ctx: &mut BackupContext<'_>) -> Result<()> {
        tracing::info!(
            "Releasing plugin resources held by {}",
            ctx.backup.backup_directory.display()
        );
        Ok(())
    }

    /// Forward an operator-initiated shutdown signal to any child work.
    fn terminate(&self, _signal: Signal) -> Result<()> {
        Ok(())
    }
}

/// A strategy that produces no data at all.
pub struct NoopStrategy {
    info: PluginInfo,
}

impl NoopStrategy {
    pub fn new() -> NoopStrategy {
        NoopStrategy {
            info: PluginInfo::builder()
                .namespace(NAMESPACE)
                .name("noop")
                .summary("a dummy backup method that does not backup any data")
                .description("a dummy backup method that does not backup any data")
                .build(),
        }
    }
}

impl Default for NoopStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStrategy for NoopStrategy {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn backup(&mut self, ctx: &mut BackupContext<'_>) -> Result<()> {
        tracing::info!(
            "noop: nothing to back up for '{}'",
            ctx.backup.name
        );
        Ok(())
    }
}

pub fn register_builtins(registry: &mut PluginRegistry<Box<dyn BackupStrategy>>) {
    registry.register(NoopStrategy::new().info().clone(), || {
        Box::new(NoopStrategy::new())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::validators::ValidatorContext;
    use crate::core::config::Config;

    #[test]
    fn test_base_configspec_defaults() {
        let spec = base_configspec().unwrap();
        let mut config = Config::from_string("[holland:backup]\nbackup-plugin = noop\n", None)
            .unwrap();
        spec.validate(&mut config, &ValidatorContext::default()).unwrap();

        let section = config.get_section("holland:backup").unwrap();
        assert_eq!(section.get_str("backup-plugin").unwrap(), "noop");
        assert_eq!(section.get_int("retention-count").unwrap(), 1);
        assert_eq!(section.get_str("purge-policy").unwrap(), "after-backup");
        assert_eq!(section.get_str("checksum-algorithm").unwrap(), "sha256");
        assert_eq!(
            section.get_float("estimated-size-adjust-by-percent").unwrap(),
            1.0
        );
        let (method, arg) = section.get_namearg("estimation-method").unwrap();
        assert_eq!((method, arg), ("plugin", ""));

        let compression = config.get_section("compression").unwrap();
        assert_eq!(compression.get_str("method").unwrap(), "gzip");
        assert_eq!(compression.get_int("level").unwrap(), 1);
    }

    #[test]
    fn test_base_configspec_requires_plugin() {
        let spec = base_configspec().unwrap();
        let mut config = Config::from_string("[holland:backup]\n", None).unwrap();
        let result = spec.validate(&mut config, &ValidatorContext::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_fail_helper() {
        let result: Result<()> = fail("strategy exploded");
        assert_eq!(result.unwrap_err().to_string(), "strategy exploded");
    }
}
