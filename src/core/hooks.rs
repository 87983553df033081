//! The backup lifecycle hook pipeline.
//!
//! Hooks observe a backup as it runs: `initialize`, `before-backup`, then
//! exactly one of `completed-backup`/`failed-backup`, then `after-backup`.
//! Within an event every hook runs even when an earlier one fails; the
//! first failure is reported to the caller.

use crate::core::backup_plugin::BackupStrategy;
use crate::core::controller::{BackupContext, PurgeOptions};
use crate::core::plugin::{PluginInfo, PluginLoader, PluginRegistry};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::spool::METADATA_DIR;
use crate::core::util::{directory_size, disk_free, format_bytes};
use derive_more::Display;
use digest::DynDigest;
use std::io::{Read, Write};
use std::path::Path;

pub const NAMESPACE: &str = "holland.backup.hooks";

const STATUS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum HookEvent {
    #[display("initialize")]
    Initialize,
    #[display("before-backup")]
    BeforeBackup,
    #[display("completed-backup")]
    CompletedBackup,
    #[display("failed-backup")]
    FailedBackup,
    #[display("after-backup")]
    AfterBackup,
}

/// Hook capability set. Event methods default to no-ops; hooks implement
/// the subset they care about.
pub trait BackupHook {
    fn info(&self) -> &PluginInfo;

    /// Dispatch order within an event: ascending priority, ties broken by
    /// registration order.
    fn priority(&self) -> i32 {
        0
    }

    fn initialize(
        &mut self,
        _ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        Ok(())
    }

    fn before_backup(
        &mut self,
        _ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        Ok(())
    }

    fn completed_backup(
        &mut self,
        _ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        Ok(())
    }

    fn failed_backup(
        &mut self,
        _ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        Ok(())
    }

    fn after_backup(
        &mut self,
        _ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        Ok(())
    }
}

fn dispatch(
    hook: &mut dyn BackupHook,
    event: HookEvent,
    ctx: &mut BackupContext<'_>,
    plugin: &mut dyn BackupStrategy,
) -> Result<()> {
    match event {
        HookEvent::Initialize => hook.initialize(ctx, plugin),
        HookEvent::BeforeBackup => hook.before_backup(ctx, plugin),
        HookEvent::CompletedBackup => hook.completed_backup(ctx, plugin),
        HookEvent::FailedBackup => hook.failed_backup(ctx, plugin),
        HookEvent::AfterBackup => hook.after_backup(ctx, plugin),
    }
}

/// Materializes the registered hooks for one backup and dispatches events
/// to them in priority order.
pub struct HookExecutor {
    hooks: Vec<Box<dyn BackupHook>>,
}

impl HookExecutor {
    pub fn new(loader: &dyn PluginLoader<Box<dyn BackupHook>>) -> HookExecutor {
        let mut hooks: Vec<Box<dyn BackupHook>> = loader.iterate(NAMESPACE).collect();
        // stable sort keeps registration order among equal priorities
        hooks.sort_by_key(|hook| hook.priority());
        HookExecutor { hooks }
    }

    /// Dispatch `event` to every hook. A failing hook is logged and the
    /// remaining hooks still run; the first failure is returned.
    pub fn event(
        &mut self,
        event: HookEvent,
        ctx: &mut BackupContext<'_>,
        plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        tracing::debug!("dispatching hook event '{}'", event);
        let mut first_error: Option<Error> = None;
        for hook in &mut self.hooks {
            if let Err(error) = dispatch(hook.as_mut(), event, ctx, plugin) {
                tracing::warn!("hook '{}' failed on event {}: {}", hook.info().name(), event, error);
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Dispatch an event whose failures must not mask an earlier error.
    pub fn event_logged(
        &mut self,
        event: HookEvent,
        ctx: &mut BackupContext<'_>,
        plugin: &mut dyn BackupStrategy,
    ) {
        if let Err(error) = self.event(event, ctx, plugin) {
            tracing::warn!("ignoring failure from {} hooks: {}", event, error);
        }
    }
}

/// Predict the size of the backup and refuse to start without enough space.
pub struct EstimationHook {
    info: PluginInfo,
}

impl EstimationHook {
    fn update_backup_size(&self, ctx: &mut BackupContext<'_>) -> Result<()> {
        if ctx.backup.real_size.is_none() {
            let real_size = if ctx.backup.backup_directory.exists() {
                directory_size(&ctx.backup.backup_directory)?
            } else {
                0
            };
            ctx.backup.real_size = Some(real_size);
            tracing::info!("Final backup size: {}", format_bytes(real_size));
        }
        if let (Some(real), Some(estimated)) = (ctx.backup.real_size, ctx.backup.estimated_size) {
            if estimated > 0 {
                tracing::info!(
                    "This backup was {:.4}% of estimated-size ({})",
                    real as f64 / estimated as f64 * 100.0,
                    format_bytes(estimated)
                );
            }
        }
        Ok(())
    }
}

impl BackupHook for EstimationHook {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn priority(&self) -> i32 {
        50
    }

    fn before_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        let section = ctx.backupset_section()?;
        let (method, arg) = section.get_namearg("estimation-method")?;
        let (method, arg) = (method.to_string(), arg.to_string());
        let adjust = section.get_float("estimated-size-adjust-by-percent")?;
        tracing::info!("Using estimation method '{}'", method);

        let hub = ctx.controller.hub().clone();
        let estimator = hub
            .estimators
            .load(crate::core::estimation::NAMESPACE, &method)?;
        let estimated = estimator.estimate(&arg, ctx, plugin)?;
        ctx.backup.estimated_size = Some(estimated);
        tracing::info!("Estimated backup size: {}", format_bytes(estimated));

        let adjusted = (estimated as f64 * adjust) as u64;
        if adjusted != estimated {
            tracing::info!(
                "Adjusted estimated size by {:.2}% to {}",
                adjust * 100.0,
                format_bytes(adjusted)
            );
        }

        let available = disk_free(&ctx.backup.backup_directory)?;
        tracing::info!(
            "Available space on '{}': {}",
            ctx.backup.backup_directory.display(),
            format_bytes(available)
        );
        if available < adjusted {
            return Err(Error::insufficient_space(adjusted, available));
        }
        Ok(())
    }

    fn completed_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.update_backup_size(ctx)
    }

    fn failed_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.update_backup_size(ctx)
    }
}

/// Write the effective config into the node and track changes.
pub struct SaveConfigHook {
    info: PluginInfo,
    saved_text: Option<String>,
}

impl SaveConfigHook {
    fn write_config(&mut self, ctx: &mut BackupContext<'_>) -> Result<()> {
        let text = ctx.config.text();
        ctx.backup.config = Some(text.clone());
        let metadata_dir = ctx.backup.backup_directory.join(METADATA_DIR);
        if !metadata_dir.exists() {
            return Ok(());
        }
        let config_path = metadata_dir.join("config");

        // write-temp-then-rename in the same directory keeps the swap atomic
        let mut temp = tempfile::NamedTempFile::new_in(&metadata_dir)?;
        temp.write_all(text.as_bytes())?;
        temp.persist(&config_path)
            .map_err(|e| Error::from(e.error))?;
        tracing::info!("Saved config {}", config_path.display());

        ctx.backup.config_path = Some(config_path);
        self.saved_text = Some(text);
        Ok(())
    }
}

impl BackupHook for SaveConfigHook {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn before_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        let link = ctx.backup.backup_directory.join("backup.conf");
        let target = Path::new(METADATA_DIR).join("config");
        match std::os::unix::fs::symlink(&target, &link) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
        self.write_config(ctx)
    }

    fn after_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        if self.saved_text.as_deref() != Some(ctx.config.text().as_str()) {
            self.write_config(ctx)?;
        }
        Ok(())
    }
}

/// Maintain `.holland/status` inside the node.
pub struct WriteStatusHook {
    info: PluginInfo,
}

impl WriteStatusHook {
    fn write_status(&self, ctx: &BackupContext<'_>, stopping: bool) -> Result<()> {
        let node_path = ctx.node.path();
        if !node_path.exists() {
            return Ok(());
        }
        let mut status = crate::core::config::Config::new();
        status.set_str("status", ctx.backup.status.to_string());
        status.set_str(
            "start-time",
            ctx.backup.start_time.format(STATUS_TIME_FORMAT).to_string(),
        );
        if stopping {
            if let Some(stop_time) = ctx.backup.stop_time {
                status.set_str("stop-time", stop_time.format(STATUS_TIME_FORMAT).to_string());
            }
        }
        status.set_str(
            "job-id",
            ctx.backup.job_id.map(|id| id.to_string()).unwrap_or_default(),
        );
        status.set_str(
            "backup-id",
            ctx.backup.id.map(|id| id.to_string()).unwrap_or_default(),
        );
        let mut file = ctx.node.create(Path::new(METADATA_DIR).join("status"))?;
        file.write_all(status.text().as_bytes())?;
        Ok(())
    }
}

impl BackupHook for WriteStatusHook {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn before_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.write_status(ctx, false)
    }

    fn after_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.write_status(ctx, true)
    }
}

/// Checksum every regular file under the node after a backup.
pub struct ChecksumHook {
    info: PluginInfo,
}

fn new_hasher(algorithm: &str) -> Option<Box<dyn DynDigest>> {
    use digest::Digest as _;
    match algorithm {
        "md5" => Some(Box::new(md5::Md5::new())),
        "sha1" => Some(Box::new(sha1::Sha1::new())),
        "sha256" => Some(Box::new(sha2::Sha256::new())),
        "sha512" => Some(Box::new(sha2::Sha512::new())),
        _ => None,
    }
}

fn hash_file(hasher: &mut dyn DynDigest, path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; 32768];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize_reset()))
}

impl BackupHook for ChecksumHook {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn priority(&self) -> i32 {
        100
    }

    fn after_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        if ctx.is_dryrun {
            return Ok(());
        }
        let algorithm = ctx.backupset_section()?.get_str("checksum-algorithm")?.to_string();
        if algorithm == "none" {
            tracing::info!("Checksums are disabled.");
            return Ok(());
        }
        let backup_directory = ctx.backup.backup_directory.clone();
        if !backup_directory.exists() {
            tracing::debug!(
                "Skipping checksums - '{}' no longer exists.",
                backup_directory.display()
            );
            return Ok(());
        }
        let Some(mut hasher) = new_hasher(&algorithm) else {
            return Err(Error::backup(format!(
                "unsupported checksum algorithm '{algorithm}'"
            )));
        };

        tracing::info!("Generating checksums for '{}'", backup_directory.display());
        let checksum_path = backup_directory.join(METADATA_DIR).join("checksums");
        let mut output = std::fs::File::create(&checksum_path)?;
        writeln!(output, "# {algorithm}sum")?;

        for entry in walkdir::WalkDir::new(&backup_directory)
            .sort_by_file_name()
            .follow_links(false)
        {
            let entry = entry?;
            if entry.path_is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            if entry.path() == checksum_path {
                continue;
            }
            let rel = entry.path().strip_prefix(&backup_directory)?;
            let digest = hash_file(hasher.as_mut(), entry.path())?;
            writeln!(output, "{digest}  {}", rel.display())?;
        }
        Ok(())
    }
}

/// Rotate old backups out of the backupset per the configured purge policy.
pub struct RotateBackupsHook {
    info: PluginInfo,
}

impl RotateBackupsHook {
    fn purge(&self, ctx: &mut BackupContext<'_>) -> Result<()> {
        let retention_count = ctx.backupset_section()?.get_int("retention-count")?.max(0) as usize;
        let name = ctx.backup.name.clone();
        let exclude = vec![ctx.backup.backup_directory.clone()];
        tracing::info!("Rotating backups in '{}'", name);
        ctx.controller.purge_set(
            &name,
            PurgeOptions {
                retention_count,
                dry_run: false,
            },
            &exclude,
        )?;
        Ok(())
    }

    fn policy(&self, ctx: &BackupContext<'_>) -> Result<String> {
        Ok(ctx.backupset_section()?.get_str("purge-policy")?.to_string())
    }
}

impl BackupHook for RotateBackupsHook {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn before_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        if ctx.is_dryrun {
            return Ok(());
        }
        if self.policy(ctx)? == "before-backup" {
            self.purge(ctx)?;
        }
        Ok(())
    }

    fn completed_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        if ctx.is_dryrun {
            return Ok(());
        }
        if self.policy(ctx)? == "after-backup" {
            self.purge(ctx)?;
        }
        Ok(())
    }
}

/// Remove the node of a failed backup, and dry-run scratch data afterwards.
pub struct RemoveFailureHook {
    info: PluginInfo,
}

impl BackupHook for RemoveFailureHook {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn priority(&self) -> i32 {
        100
    }

    fn failed_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        let backup_directory = &ctx.backup.backup_directory;
        tracing::info!("Removing failed backup '{}'", backup_directory.display());
        match std::fs::remove_dir_all(backup_directory) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn after_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        if ctx.is_dryrun && ctx.node.path().exists() {
            tracing::info!(
                "Removing dry-run temporary files in '{}'",
                ctx.node.path().display()
            );
            ctx.node.purge()?;
        }
        Ok(())
    }
}

/// Run operator-configured commands around the backup lifecycle.
pub struct UserCommandHook {
    info: PluginInfo,
}

impl UserCommandHook {
    fn run_command(&self, ctx: &BackupContext<'_>, option: &str, fatal: bool) -> Result<()> {
        let argv = ctx.backupset_section()?.get_cmdline(option)?.to_vec();
        if argv.is_empty() {
            return Ok(());
        }
        tracing::info!("Running {}: {}", option, argv.join(" "));
        let status = std::process::Command::new(&argv[0])
            .args(&argv[1..])
            .env("HOLLAND_BACKUP_DIR", &ctx.backup.backup_directory)
            .status();
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                let message = format!("{option} exited with status {status}");
                if fatal {
                    Err(Error::backup(message))
                } else {
                    tracing::warn!("{message}");
                    Ok(())
                }
            }
            Err(err) => {
                let message = format!("{option} failed to start: {err}");
                if fatal {
                    Err(Error::backup(message))
                } else {
                    tracing::warn!("{message}");
                    Ok(())
                }
            }
        }
    }
}

impl BackupHook for UserCommandHook {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn priority(&self) -> i32 {
        100
    }

    fn before_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.run_command(ctx, "before-backup-command", true)
    }

    fn completed_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.run_command(ctx, "completed-backup-command", false)
    }

    fn failed_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.run_command(ctx, "failed-backup-command", false)
    }

    fn after_backup(
        &mut self,
        ctx: &mut BackupContext<'_>,
        _plugin: &mut dyn BackupStrategy,
    ) -> Result<()> {
        self.run_command(ctx, "after-backup-command", false)
    }
}

fn hook_info(name: &str, summary: &str) -> PluginInfo {
    PluginInfo::builder()
        .namespace(NAMESPACE)
        .name(name)
        .summary(summary)
        .build()
}

pub fn register_builtins(registry: &mut PluginRegistry<Box<dyn BackupHook>>) {
    registry.register(
        hook_info("estimation", "predict the size of the current backup"),
        || {
            Box::new(EstimationHook {
                info: hook_info("estimation", "predict the size of the current backup"),
            })
        },
    );
    registry.register(hook_info("checksum", "checksum backup directory"), || {
        Box::new(ChecksumHook {
            info: hook_info("checksum", "checksum backup directory"),
        })
    });
    registry.register(
        hook_info("update-status", "track backup status in the node"),
        || {
            Box::new(WriteStatusHook {
                info: hook_info("update-status", "track backup status in the node"),
            })
        },
    );
    registry.register(
        hook_info("save-config", "write the active config to the backup directory"),
        || {
            Box::new(SaveConfigHook {
                info: hook_info("save-config", "write the active config to the backup directory"),
                saved_text: None,
            })
        },
    );
    registry.register(
        hook_info("remove-failed-backup", "remove a failed backup"),
        || {
            Box::new(RemoveFailureHook {
                info: hook_info("remove-failed-backup", "remove a failed backup"),
            })
        },
    );
    registry.register(
        hook_info("rotate-backups", "rotate backups in a backupset"),
        || {
            Box::new(RotateBackupsHook {
                info: hook_info("rotate-backups", "rotate backups in a backupset"),
            })
        },
    );
    registry.register(hook_info("user-commands", "execute user commands"), || {
        Box::new(UserCommandHook {
            info: hook_info("user-commands", "execute user commands"),
        })
    });
}
