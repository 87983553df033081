//! The backup controller.
//!
//! Drives the full lifecycle: open a job in the catalog, then per
//! backupset take the spool lock, mint a node, bind the strategy and walk
//! the hook pipeline. Also owns purge/rotation and the `release` path that
//! lets a strategy free external resources left behind by an earlier run.

use crate::core::backup_plugin::{self, base_configspec, BackupStrategy};
use crate::core::catalog::{Backup, BackupFilter, BackupStatus, Catalog, Job};
use crate::core::config::validators::ValidatorContext;
use crate::core::config::Config;
use crate::core::hooks::{HookEvent, HookExecutor};
use crate::core::plugin::{PluginHub, PluginLoader};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::spool::{BackupNode, BackupSpool, METADATA_DIR};
use crate::core::util::{format_interval, replace_symlink};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation flag checked at suspension points.
///
/// Signal handlers (wired outside the core) set the flag; the controller
/// translates it into an orderly teardown at the next backupset boundary.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(Error::interrupted("shutdown requested"))
        } else {
            Ok(())
        }
    }
}

/// Options controlling a purge run.
#[derive(Clone, Copy, Debug)]
pub struct PurgeOptions {
    pub retention_count: usize,
    pub dry_run: bool,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        PurgeOptions {
            retention_count: 1,
            dry_run: true,
        }
    }
}

/// Everything a strategy or hook can see while a backup runs.
pub struct BackupContext<'a> {
    pub backup: &'a mut Backup,
    pub config: &'a Config,
    pub node: BackupNode,
    pub controller: &'a mut BackupController,
    pub is_dryrun: bool,
}

impl BackupContext<'_> {
    /// The validated `[holland:backup]` section of the backupset config.
    pub fn backupset_section(&self) -> Result<&Config> {
        self.config
            .get_section("holland:backup")
            .ok_or_else(|| Error::backup("missing [holland:backup] section"))
    }
}

pub struct BackupController {
    spool: BackupSpool,
    catalog: Catalog,
    hub: Arc<PluginHub>,
    validator_ctx: ValidatorContext,
    jobs: Vec<Job>,
    shutdown: ShutdownFlag,
}

impl BackupController {
    pub fn new(spool: BackupSpool, catalog: Catalog, hub: Arc<PluginHub>) -> BackupController {
        let validator_ctx = hub.validator_context();
        BackupController {
            spool,
            catalog,
            hub,
            validator_ctx,
            jobs: Vec::new(),
            shutdown: ShutdownFlag::new(),
        }
    }

    /// Build a controller from a validated `[holland]` section.
    pub fn from_config(holland: &Config, hub: Arc<PluginHub>) -> Result<BackupController> {
        let backup_directory = holland.get_str("backup-directory")?.to_string();
        let catalog_db = holland
            .get_value("catalog-db")
            .and_then(|value| match value {
                crate::core::config::Value::Str(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(BackupController::new(
            BackupSpool::new(backup_directory),
            Catalog::open(&catalog_db)?,
            hub,
        ))
    }

    pub fn spool(&self) -> &BackupSpool {
        &self.spool
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn hub(&self) -> &Arc<PluginHub> {
        &self.hub
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn current_job(&self) -> Result<&Job> {
        self.jobs
            .last()
            .ok_or_else(|| Error::backup("no active job"))
    }

    /// Run `body` inside a job scope.
    ///
    /// The job row is committed on entry; stop time and final status are
    /// committed on every exit path.
    pub fn job<R>(
        &mut self,
        is_dryrun: bool,
        external_id: Option<String>,
        body: impl FnOnce(&mut BackupController) -> Result<R>,
    ) -> Result<R> {
        let mut job = Job::new(is_dryrun, external_id);
        tracing::info!("--- Starting backup job ---");
        self.catalog.insert_job(&mut job)?;
        tracing::info!("Commandline: {}", job.cmdline);
        self.jobs.push(job);

        let started = Instant::now();
        let result = body(self);

        let mut job = match self.jobs.pop() {
            Some(job) => job,
            None => return Err(Error::backup("job stack underflow")),
        };
        job.stop_time = Some(chrono::Local::now().naive_local());
        job.status = if result.is_ok() {
            BackupStatus::Completed
        } else {
            BackupStatus::Failed
        };
        if let Err(update_error) = self.catalog.update_job(&job) {
            tracing::warn!("failed to finalize job row: {}", update_error);
        }
        tracing::info!(
            "--- Ending backup job ({}) in {} ---",
            job.status,
            format_interval(started.elapsed())
        );
        result
    }

    /// Validate a backupset config and load its strategy.
    ///
    /// The config is validated twice: against the base spec to resolve
    /// `backup-plugin`, then against the strategy's own spec (which is the
    /// base spec melded with the strategy's additions).
    pub fn validate_config(&self, mut config: Config) -> Result<(Box<dyn BackupStrategy>, Config)> {
        if config.get_section("holland:backup").is_none() {
            return Err(Error::backup(format!(
                "no [holland:backup] section defined in {}",
                config
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "config".to_string())
            )));
        }
        base_configspec()?.validate(&mut config, &self.validator_ctx)?;

        let plugin_name = config
            .get_section("holland:backup")
            .and_then(|section| section.get_str("backup-plugin").ok())
            .unwrap_or_default()
            .to_string();
        if plugin_name.is_empty() {
            return Err(Error::backup("no backup-plugin specified in [holland:backup]"));
        }

        let plugin = self
            .hub
            .strategies
            .load(backup_plugin::NAMESPACE, &plugin_name)?;
        plugin.configspec()?.validate(&mut config, &self.validator_ctx)?;
        Ok((plugin, config))
    }

    /// Run one backupset end to end. Requires an active job scope.
    pub fn backup(&mut self, config: Config, name: &str) -> Result<Backup> {
        self.shutdown.check()?;
        tracing::info!("--- Starting backup {} ---", name);
        let started = Instant::now();

        let (mut plugin, config) = self.validate_config(config)?;
        let (job_id, is_dryrun) = {
            let job = self.current_job()?;
            (job.id, job.is_dryrun)
        };

        let _lock = self.spool.lock(name)?;
        let node = self.spool.add_node(name, None)?;
        let mut backup = Backup::new(job_id, name);
        backup.backup_directory = node.path().to_path_buf();
        backup.status = BackupStatus::Running;
        self.catalog.insert_backup(&mut backup)?;

        let result = {
            let mut ctx = BackupContext {
                backup: &mut backup,
                config: &config,
                node,
                controller: &mut *self,
                is_dryrun,
            };
            execute_backup(&mut ctx, plugin.as_mut())
        };

        if result.is_err()
            && !matches!(backup.status, BackupStatus::Completed | BackupStatus::Failed)
        {
            backup.status = BackupStatus::Failed;
            if backup.message.is_none() {
                backup.message = result.as_ref().err().map(|e| e.to_string());
            }
        }
        if let Err(update_error) = self.catalog.update_backup(&backup) {
            tracing::warn!("failed to finalize backup row: {}", update_error);
        }
        tracing::info!(
            "--- Ending backup {} ({}) in {} ---",
            name,
            backup.status,
            format_interval(started.elapsed())
        );
        result.map(|()| backup)
    }

    /// Let a strategy clean up after a previous backup node.
    ///
    /// An unreadable node config is logged and skipped; everything else
    /// (plugin resolution, release itself) propagates errors.
    pub fn release(&mut self, path: &Path) -> Result<()> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let config_path = path.join(METADATA_DIR).join("config");
        let config = match Config::from_path(&config_path) {
            Ok(config) => config,
            Err(_) => {
                tracing::info!(
                    "Unable to load backup config for {}. Skipping release",
                    path.display()
                );
                return Ok(());
            }
        };

        let (mut plugin, config) = self.validate_config(config)?;
        let namespace = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::spool(format!("cannot derive backupset from '{}'", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::spool(format!("cannot derive node name from '{}'", path.display())))?;
        let node = self.spool.load_node(&namespace, &name)?;

        let mut backup = match self
            .catalog
            .load_backup(&BackupFilter::builder().backup_directory(path.clone()).build())?
        {
            Some(backup) => backup,
            None => self.catalog.load_backup_from_node(&node),
        };

        let is_dryrun = self.jobs.last().map(|job| job.is_dryrun).unwrap_or(false);
        let mut ctx = BackupContext {
            backup: &mut backup,
            config: &config,
            node,
            controller: &mut *self,
            is_dryrun,
        };
        plugin.release(&mut ctx)
    }

    /// Purge a backupset down to its retention count.
    ///
    /// Nodes are considered newest first; a node is kept when its path is
    /// excluded or when it is completed and the kept count has not yet
    /// reached the retention count. Returns (kept, candidates).
    pub fn purge_set(
        &mut self,
        name: &str,
        options: PurgeOptions,
        exclude: &[PathBuf],
    ) -> Result<(Vec<BackupNode>, Vec<BackupNode>)> {
        let candidates = self.spool.iter_nodes(name)?;
        let mut kept: Vec<BackupNode> = Vec::new();

        for node in candidates.iter().rev() {
            if exclude.iter().any(|path| path == node.path()) {
                kept.push(node.clone());
                continue;
            }
            if kept.len() >= options.retention_count {
                continue;
            }
            let status = match self.catalog.load_backup(
                &BackupFilter::builder()
                    .backup_directory(node.path())
                    .build(),
            )? {
                Some(backup) => backup.status,
                None => self.catalog.load_backup_from_node(node).status,
            };
            if status == BackupStatus::Completed {
                kept.push(node.clone());
            }
        }

        // kept was collected newest first
        let newest = kept.first().cloned();
        let oldest = kept.last().cloned();
        let backupset_path = self.spool.path().join(name);
        match (oldest, newest) {
            (Some(oldest), Some(newest)) => {
                if options.dry_run {
                    tracing::info!("Would point 'oldest' symlink to {}", oldest.name());
                    tracing::info!("Would point 'newest' symlink to {}", newest.name());
                } else {
                    replace_symlink(Path::new(&oldest.name()), &backupset_path.join("oldest"))?;
                    replace_symlink(Path::new(&newest.name()), &backupset_path.join("newest"))?;
                }
            }
            _ => {
                if options.dry_run {
                    tracing::info!("No backups kept. Would remove oldest/newest symlinks");
                } else {
                    for link in ["oldest", "newest"] {
                        match std::fs::remove_file(backupset_path.join(link)) {
                            Ok(()) => {}
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
            }
        }

        for node in &candidates {
            if exclude.iter().any(|path| path == node.path()) {
                continue;
            }
            if kept.iter().any(|keep| keep.path() == node.path()) {
                continue;
            }
            if options.dry_run {
                tracing::info!("Would purge {}", node.path().display());
            } else {
                if let Err(error) = self.release(node.path()) {
                    tracing::info!("Release failed: {}", error);
                }
                tracing::info!("Purging {}", node.path().display());
                node.purge()?;
            }
        }

        Ok((kept, candidates))
    }
}

/// Walk one backup through the hook pipeline and strategy.
fn execute_backup(ctx: &mut BackupContext<'_>, plugin: &mut dyn BackupStrategy) -> Result<()> {
    let hub = ctx.controller.hub().clone();
    let mut executor = HookExecutor::new(&hub.hooks);

    executor.event(HookEvent::Initialize, ctx, plugin)?;
    plugin.setup(ctx)?;

    let run_result = executor
        .event(HookEvent::BeforeBackup, ctx, plugin)
        .and_then(|()| {
            if ctx.is_dryrun {
                plugin.dryrun(ctx)
            } else {
                plugin.backup(ctx)
            }
        });
    ctx.backup.stop_time = Some(chrono::Local::now().naive_local());

    let outcome = match run_result {
        Err(error) => {
            tracing::debug!("Failed backup: {}", error);
            ctx.backup.status = BackupStatus::Failed;
            ctx.backup.message = Some(error.to_string());
            executor.event_logged(HookEvent::FailedBackup, ctx, plugin);
            Err(error)
        }
        Ok(()) => {
            ctx.backup.status = BackupStatus::Completed;
            executor.event(HookEvent::CompletedBackup, ctx, plugin)
        }
    };

    executor.event_logged(HookEvent::AfterBackup, ctx, plugin);
    if let Err(error) = plugin.cleanup(ctx) {
        tracing::warn!("plugin cleanup failed: {}", error);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugin::PluginInfo;
    use crate::core::result_error::error::ErrorInternal;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const BACKUPSET: &str = "\
[holland:backup]
backup-plugin = noop
retention-count = 2
purge-policy = after-backup
[compression]
method = none
";

    fn backupset_config(text: &str) -> Config {
        Config::from_string(text, None).unwrap()
    }

    fn controller_with_hub(tmp: &TempDir, hub: PluginHub) -> BackupController {
        let spool = BackupSpool::new(tmp.path().join("spool"));
        std::fs::create_dir_all(tmp.path().join("spool")).unwrap();
        let catalog =
            Catalog::open(&tmp.path().join("catalog.db").to_string_lossy()).unwrap();
        BackupController::new(spool, catalog, hub.into_shared())
    }

    fn controller(tmp: &TempDir) -> BackupController {
        controller_with_hub(tmp, PluginHub::builtin())
    }

    fn run_backup(controller: &mut BackupController, config_text: &str, name: &str) -> Result<Backup> {
        controller.job(false, None, |controller| {
            controller.backup(backupset_config(config_text), name)
        })
    }

    #[test]
    fn test_first_successful_backup() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);

        let backup = run_backup(&mut controller, BACKUPSET, "alpha").unwrap();
        assert_eq!(backup.status, BackupStatus::Completed);
        assert!(backup.real_size.is_some());

        // node metadata is complete
        let nodes = controller.spool().iter_nodes("alpha").unwrap();
        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        for file in ["timestamp", "status", "config", "checksums"] {
            assert!(
                node.join(".holland").join(file).is_file(),
                "missing .holland/{file}"
            );
        }
        let status = std::fs::read_to_string(node.join(".holland/status")).unwrap();
        assert!(status.contains("status = completed"), "{status}");

        // backup.conf symlink points into the metadata directory
        let link = std::fs::read_link(node.join("backup.conf")).unwrap();
        assert_eq!(link, Path::new(".holland/config"));

        // oldest and newest both point at the only node
        let backupset_path = controller.spool().path().join("alpha");
        assert_eq!(
            std::fs::read_link(backupset_path.join("oldest")).unwrap(),
            Path::new(&node.name())
        );
        assert_eq!(
            std::fs::read_link(backupset_path.join("newest")).unwrap(),
            Path::new(&node.name())
        );

        // catalog holds one completed job and one completed backup
        let jobs = controller.catalog().list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, BackupStatus::Completed);
        assert!(jobs[0].stop_time.is_some());
        let backups = controller
            .catalog()
            .list_backups(&BackupFilter::default())
            .unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Completed);
    }

    #[test]
    fn test_checksums_cover_all_regular_files() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        run_backup(&mut controller, BACKUPSET, "alpha").unwrap();

        let node = controller.spool().last("alpha").unwrap().unwrap();
        let checksums = std::fs::read_to_string(node.join(".holland/checksums")).unwrap();
        assert!(checksums.starts_with("# sha256sum\n"), "{checksums}");

        let listed: std::collections::HashSet<String> = checksums
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once("  ").map(|(_, rel)| rel.to_string()))
            .collect();
        for entry in walkdir::WalkDir::new(node.path()) {
            let entry = entry.unwrap();
            if entry.path_is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(node.path())
                .unwrap()
                .display()
                .to_string();
            if rel == ".holland/checksums" {
                continue;
            }
            assert!(listed.contains(&rel), "missing checksum for {rel}");
        }
    }

    #[test]
    fn test_insufficient_space_fails_backup_and_removes_node() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);

        let config = "\
[holland:backup]
backup-plugin = noop
estimation-method = const:1024T
[compression]
method = none
";
        let error = run_backup(&mut controller, config, "alpha").unwrap_err();
        assert!(
            error.to_string().contains("insufficient space"),
            "{error}"
        );

        // node was removed by the failed-backup hook
        assert!(controller.spool().iter_nodes("alpha").unwrap().is_empty());
        // no symlinks were created
        assert!(!controller.spool().path().join("alpha/newest").exists());

        let backups = controller
            .catalog()
            .list_backups(&BackupFilter::default())
            .unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Failed);
        assert!(backups[0]
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("insufficient space"));
    }

    #[test]
    fn test_concurrent_lock_conflict() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);

        // another process holds the backupset lock
        let other_spool = BackupSpool::new(tmp.path().join("spool"));
        let _held = other_spool.lock("alpha").unwrap();

        let error = run_backup(&mut controller, BACKUPSET, "alpha").unwrap_err();
        assert!(error.is_lock_conflict(), "{error}");
        assert!(
            error.to_string().contains(&std::process::id().to_string()),
            "{error}"
        );
    }

    #[test]
    fn test_rotation_keeps_retention_count_nodes() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);

        for _ in 0..5 {
            run_backup(&mut controller, BACKUPSET, "alpha").unwrap();
            // node names have one-second resolution
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }

        let nodes = controller.spool().iter_nodes("alpha").unwrap();
        assert_eq!(nodes.len(), 2, "retention-count = 2 must keep 2 nodes");

        let backupset_path = controller.spool().path().join("alpha");
        assert_eq!(
            std::fs::read_link(backupset_path.join("oldest")).unwrap(),
            Path::new(&nodes[0].name())
        );
        assert_eq!(
            std::fs::read_link(backupset_path.join("newest")).unwrap(),
            Path::new(&nodes[1].name())
        );

        // catalog rows for purged runs persist
        let backups = controller
            .catalog()
            .list_backups(&BackupFilter::default())
            .unwrap();
        assert_eq!(backups.len(), 5);
    }

    #[test]
    fn test_dry_run_leaves_no_node_behind() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);

        let backup = controller
            .job(true, None, |controller| {
                controller.backup(backupset_config(BACKUPSET), "alpha")
            })
            .unwrap();
        assert_eq!(backup.status, BackupStatus::Completed);

        assert!(controller.spool().iter_nodes("alpha").unwrap().is_empty());
        assert!(!controller.spool().path().join("alpha/newest").exists());
        assert!(!controller.spool().path().join("alpha/oldest").exists());

        let jobs = controller.catalog().list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].is_dryrun);
        let backups = controller
            .catalog()
            .list_backups(&BackupFilter::default())
            .unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Completed);
    }

    struct ReleaseProbe {
        info: PluginInfo,
        released: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl BackupStrategy for ReleaseProbe {
        fn info(&self) -> &PluginInfo {
            &self.info
        }

        fn backup(&mut self, ctx: &mut BackupContext<'_>) -> Result<()> {
            std::fs::write(ctx.backup.backup_directory.join("data"), b"payload")?;
            Ok(())
        }

        fn release(&mut self, ctx: &mut BackupContext<'_>) -> Result<()> {
            self.released
                .lock()
                .unwrap()
                .push(ctx.backup.backup_directory.clone());
            Ok(())
        }
    }

    fn probe_hub(released: Arc<Mutex<Vec<PathBuf>>>) -> PluginHub {
        let mut hub = PluginHub::builtin();
        let info = PluginInfo::builder()
            .namespace(backup_plugin::NAMESPACE)
            .name("release-probe")
            .build();
        let probe_info = info.clone();
        hub.strategies.register(info, move || {
            Box::new(ReleaseProbe {
                info: probe_info.clone(),
                released: released.clone(),
            })
        });
        hub
    }

    #[test]
    fn test_release_calls_strategy_once_with_node_path() {
        let tmp = TempDir::new().unwrap();
        let released = Arc::new(Mutex::new(Vec::new()));
        let mut controller = controller_with_hub(&tmp, probe_hub(released.clone()));

        let config = "\
[holland:backup]
backup-plugin = release-probe
[compression]
method = none
";
        run_backup(&mut controller, config, "alpha").unwrap();
        let node = controller.spool().last("alpha").unwrap().unwrap();

        controller.release(node.path()).unwrap();

        let calls = released.lock().unwrap();
        assert_eq!(calls.len(), 1, "release() must be called exactly once");
        assert_eq!(
            std::fs::canonicalize(&calls[0]).unwrap(),
            std::fs::canonicalize(node.path()).unwrap()
        );
    }

    #[test]
    fn test_release_skips_node_without_config() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        let node = controller.spool().add_node("alpha", None).unwrap();
        // no .holland/config present: release is a logged no-op
        controller.release(node.path()).unwrap();
    }

    #[test]
    fn test_purge_set_dry_run_deletes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        run_backup(&mut controller, BACKUPSET, "alpha").unwrap();

        let (kept, candidates) = controller
            .purge_set(
                "alpha",
                PurgeOptions {
                    retention_count: 0,
                    dry_run: true,
                },
                &[],
            )
            .unwrap();
        assert!(kept.is_empty());
        assert_eq!(candidates.len(), 1);
        assert_eq!(controller.spool().iter_nodes("alpha").unwrap().len(), 1);
    }

    #[test]
    fn test_purge_set_removes_symlinks_when_nothing_kept() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        run_backup(&mut controller, BACKUPSET, "alpha").unwrap();
        assert!(controller.spool().path().join("alpha/newest").exists());

        controller
            .purge_set(
                "alpha",
                PurgeOptions {
                    retention_count: 0,
                    dry_run: false,
                },
                &[],
            )
            .unwrap();

        assert!(controller.spool().iter_nodes("alpha").unwrap().is_empty());
        for link in ["oldest", "newest"] {
            assert!(
                !controller
                    .spool()
                    .path()
                    .join("alpha")
                    .join(link)
                    .exists(),
                "{link} symlink should be gone"
            );
        }
    }

    #[test]
    fn test_backup_without_job_scope_fails() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        let error = controller
            .backup(backupset_config(BACKUPSET), "alpha")
            .unwrap_err();
        assert!(error.to_string().contains("no active job"), "{error}");
    }

    #[test]
    fn test_missing_backup_section_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        let error = run_backup(&mut controller, "[other]\nx = 1\n", "alpha").unwrap_err();
        assert!(
            error.to_string().contains("[holland:backup]"),
            "{error}"
        );
    }

    #[test]
    fn test_unknown_strategy_is_plugin_not_found() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        let config = "\
[holland:backup]
backup-plugin = mysterious
[compression]
method = none
";
        let error = run_backup(&mut controller, config, "alpha").unwrap_err();
        match error.inner() {
            ErrorInternal::PluginNotFound { name, .. } => assert_eq!(name, "mysterious"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_failing_before_command_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        let config = "\
[holland:backup]
backup-plugin = noop
before-backup-command = false
[compression]
method = none
";
        let error = run_backup(&mut controller, config, "alpha").unwrap_err();
        assert!(
            error.to_string().contains("before-backup-command"),
            "{error}"
        );
        // failed path ran: the node is gone
        assert!(controller.spool().iter_nodes("alpha").unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_flag_cancels_next_backup() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);
        controller.shutdown_flag().set();
        let error = run_backup(&mut controller, BACKUPSET, "alpha").unwrap_err();
        assert!(error.to_string().contains("shutdown"), "{error}");
    }

    struct FailingStrategy {
        info: PluginInfo,
    }

    impl BackupStrategy for FailingStrategy {
        fn info(&self) -> &PluginInfo {
            &self.info
        }

        fn backup(&mut self, _ctx: &mut BackupContext<'_>) -> Result<()> {
            crate::core::backup_plugin::fail("strategy blew up")
        }
    }

    #[test]
    fn test_failed_strategy_marks_backup_failed_and_removes_node() {
        let tmp = TempDir::new().unwrap();
        let mut hub = PluginHub::builtin();
        let info = PluginInfo::builder()
            .namespace(backup_plugin::NAMESPACE)
            .name("failing")
            .build();
        let failing_info = info.clone();
        hub.strategies.register(info, move || {
            Box::new(FailingStrategy {
                info: failing_info.clone(),
            })
        });
        let mut controller = controller_with_hub(&tmp, hub);

        let config = "\
[holland:backup]
backup-plugin = failing
[compression]
method = none
";
        let error = run_backup(&mut controller, config, "alpha").unwrap_err();
        assert_eq!(error.to_string(), "strategy blew up");

        assert!(controller.spool().iter_nodes("alpha").unwrap().is_empty());
        let backups = controller
            .catalog()
            .list_backups(&BackupFilter::default())
            .unwrap();
        assert_eq!(backups[0].status, BackupStatus::Failed);
        assert_eq!(backups[0].message.as_deref(), Some("strategy blew up"));
        assert!(backups[0].stop_time.is_some());
    }

    #[test]
    fn test_per_backupset_errors_do_not_abort_job() {
        let tmp = TempDir::new().unwrap();
        let mut controller = controller(&tmp);

        let bad = "\
[holland:backup]
backup-plugin = mysterious
[compression]
method = none
";
        let outcome: Result<Vec<bool>> = controller.job(false, None, |controller| {
            let mut results = Vec::new();
            for (config, name) in [(bad, "bad"), (BACKUPSET, "good")] {
                match controller.backup(backupset_config(config), name) {
                    Ok(_) => results.push(true),
                    Err(error) => {
                        tracing::error!("backup {name} failed: {error}");
                        results.push(false);
                    }
                }
            }
            Ok(results)
        });
        assert_eq!(outcome.unwrap(), vec![false, true]);
        assert_eq!(controller.spool().iter_nodes("good").unwrap().len(), 1);
    }
}
