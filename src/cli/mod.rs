//! Command line surface.
//!
//! Thin command implementations over the core: global config loading,
//! backupset resolution, and the `backup` / `purge` / `list-*` / `release`
//! subcommands. Exit codes: 0 when everything requested succeeded, 1
//! otherwise.

use crate::core::catalog::Catalog;
use crate::core::config::validators::ValidatorContext;
use crate::core::config::{Config, Configspec, LogLevel};
use crate::core::controller::{BackupController, PurgeOptions};
use crate::core::plugin::{PluginHub, PluginLoader};
use crate::core::result_error::result::Result;
use crate::core::result_error::{AddFunctionName, AddMsg};
use crate::core::spool::BackupSpool;
use crate::core::util::format_bytes;
use clap::{Parser, Subcommand};
use function_name::named;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/holland/holland.conf";

/// Configspec for the global holland.conf.
pub const GLOBAL_CONFIGSPEC: &str = "\
[holland]
backup-directory = string(default='/var/spool/holland')
backupsets = force_list(default=list())
catalog-db = string(default='')
umask = integer(base=8, default='0022')
tmpdir = string(default='')
path = string(default='')

[logging]
level = log_level(default=info)
format = string(default='')
filename = string(default='')
";

#[derive(Parser, Debug)]
#[command(name = "holland", version, about = "Pluggable backup orchestrator")]
pub struct Cli {
    /// Read configuration from the given file
    #[arg(long, short = 'c', global = true, env = "HOLLAND_CONFIG",
          default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Specify the log level
    #[arg(long, global = true, value_parser = ["debug", "info", "warning", "error", "fatal"])]
    pub log_level: Option<String>,

    /// Shortcut for --log-level=debug
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log informational output
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress console logging
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backup for one or more backupsets
    #[command(alias = "bk")]
    Backup {
        /// Spool directory to back up into
        #[arg(long, short = 'd')]
        backup_directory: Option<PathBuf>,

        /// Perform all checks without producing a backup
        #[arg(long, short = 'n')]
        dry_run: bool,

        /// Catalog database to record jobs and backups in
        #[arg(long)]
        catalog_db: Option<String>,

        /// Backupsets to run; defaults to [holland] backupsets
        backupset: Vec<String>,
    },

    /// Purge old backups from one or more backupsets
    Purge {
        /// Keep this many completed backups
        #[arg(long, conflicts_with = "all")]
        retention_count: Option<usize>,

        /// Purge every backup
        #[arg(long)]
        all: bool,

        /// Only log what would be purged (default)
        #[arg(long, short = 'n')]
        dry_run: bool,

        /// Actually purge
        #[arg(long, conflicts_with = "dry_run")]
        force: bool,

        /// Alias for --force
        #[arg(long, conflicts_with = "dry_run")]
        execute: bool,

        #[arg(long, short = 'd')]
        backup_directory: Option<PathBuf>,

        backupset: Vec<String>,
    },

    /// List the backups in the spool
    ListBackups {
        #[arg(long, short = 'd')]
        backup_directory: Option<PathBuf>,
    },

    /// List the available commands
    ListCommands,

    /// List the registered plugins
    ListPlugins,

    /// Release external resources held by previous backups
    Release {
        /// Backup node paths to release
        path: Vec<PathBuf>,
    },
}

/// Load and validate the global config; a missing file yields defaults.
pub fn load_global_config(path: &Path, ctx: &ValidatorContext) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_path(path)?
    } else {
        tracing::debug!(
            "holland config '{}' not found; using defaults",
            path.display()
        );
        let mut config = Config::new();
        config.set_path(path.to_path_buf());
        config
    };
    Configspec::from_string(GLOBAL_CONFIGSPEC)?.validate(&mut config, ctx)?;
    Ok(config)
}

/// Resolve and load a backupset config.
///
/// Relative names resolve to `<config dir>/backupsets/<name>.conf`. When a
/// provider config exists for the configured plugin it is melded in
/// underneath the backupset's own settings.
#[named]
pub fn load_backupset(global: &Config, name: &str) -> Result<(String, Config)> {
    let basedir = global
        .path()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut path = PathBuf::from(name);
    if path.is_relative() {
        path = basedir.join("backupsets").join(name);
    }
    if path.extension().is_none() {
        path.set_extension("conf");
    }

    let mut config = Config::from_path(&path)
        .add_msg(format!("failed to load backup config '{name}'"))
        .add_fn_name(crate::core::function_path!())?;

    if let Some(plugin) = config
        .get_section("holland:backup")
        .and_then(|section| section.get_value("backup-plugin"))
        .and_then(|value| match value {
            crate::core::config::Value::Str(s) => Some(s.clone()),
            _ => None,
        })
    {
        let provider = basedir.join("providers").join(format!("{plugin}.conf"));
        if provider.exists() {
            config.meld(Config::from_path(&provider)?)?;
        } else {
            tracing::debug!("No global provider found. Skipping.");
        }
    }

    let set_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    Ok((set_name, config))
}

fn holland_section(global: &Config) -> Result<Config> {
    global
        .get_section("holland")
        .cloned()
        .ok_or_else(|| crate::core::result_error::error::Error::backup("missing [holland] section"))
}

fn build_controller(
    global: &Config,
    hub: Arc<PluginHub>,
    backup_directory: Option<&Path>,
    catalog_db: Option<&str>,
) -> Result<BackupController> {
    let section = holland_section(global)?;
    let directory = backup_directory
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(section.get_str("backup-directory").unwrap_or_default()));
    let mut db = catalog_db
        .map(str::to_string)
        .unwrap_or_else(|| section.get_str("catalog-db").unwrap_or_default().to_string());
    if db.is_empty() {
        // keep the catalog next to the spool by default
        db = directory.join("holland.catalog.db").to_string_lossy().into_owned();
    }
    crate::core::util::ensure_directory(&directory)?;
    Ok(BackupController::new(
        BackupSpool::new(directory),
        Catalog::open(&db)?,
        hub,
    ))
}

/// Run the `backup` command; returns the process exit code.
pub fn run_backup(
    global: &Config,
    hub: Arc<PluginHub>,
    backup_directory: Option<&Path>,
    catalog_db: Option<&str>,
    dry_run: bool,
    backupsets: &[String],
) -> Result<i32> {
    let section = holland_section(global)?;
    let requested: Vec<String> = if backupsets.is_empty() {
        section.get_list("backupsets")?.to_vec()
    } else {
        backupsets.to_vec()
    };
    if requested.is_empty() {
        tracing::error!("Nothing to backup");
        return Ok(1);
    }

    let mut controller = build_controller(global, hub, backup_directory, catalog_db)?;
    let mut failures = 0usize;
    controller.job(dry_run, None, |controller| {
        for name in &requested {
            let result = load_backupset(global, name)
                .and_then(|(set_name, config)| controller.backup(config, &set_name));
            if let Err(error) = result {
                tracing::error!("backup '{}' failed: {}", name, error);
                tracing::debug!("failure detail: {:?}", error);
                failures += 1;
            }
        }
        Ok(())
    })?;
    Ok(if failures == 0 { 0 } else { 1 })
}

/// Run the `purge` command; returns the process exit code.
pub fn run_purge(
    global: &Config,
    hub: Arc<PluginHub>,
    backup_directory: Option<&Path>,
    retention_count: Option<usize>,
    purge_all: bool,
    dry_run: bool,
    backupsets: &[String],
) -> Result<i32> {
    let section = holland_section(global)?;
    let requested: Vec<String> = if backupsets.is_empty() {
        section.get_list("backupsets")?.to_vec()
    } else {
        backupsets.to_vec()
    };

    if dry_run {
        tracing::warn!("Running in dry-run mode. Use --force to run a real purge");
    }

    let mut controller = build_controller(global, hub, backup_directory, None)?;
    let mut failures = 0usize;
    for name in &requested {
        let retention = if purge_all {
            0
        } else {
            match retention_count {
                Some(count) => count,
                None => load_backupset(global, name)
                    .ok()
                    .and_then(|(_, config)| {
                        config
                            .get_section("holland:backup")
                            .and_then(|s| s.get_value("retention-count").cloned())
                    })
                    .and_then(|value| match value {
                        crate::core::config::Value::Int(i) => Some(i.max(0) as usize),
                        crate::core::config::Value::Str(s) => s.parse().ok(),
                        _ => None,
                    })
                    .unwrap_or(1),
            }
        };
        let options = PurgeOptions {
            retention_count: retention,
            dry_run,
        };
        if let Err(error) = controller.purge_set(name, options, &[]) {
            tracing::error!("purge '{}' failed: {}", name, error);
            failures += 1;
        }
    }
    Ok(if failures == 0 { 0 } else { 1 })
}

/// Run the `list-backups` command.
pub fn run_list_backups(
    global: &Config,
    hub: Arc<PluginHub>,
    backup_directory: Option<&Path>,
) -> Result<i32> {
    let controller = build_controller(global, hub, backup_directory, None)?;
    for namespace in controller.spool().iter_namespaces()? {
        println!("{namespace}:");
        for node in controller.spool().iter_nodes(&namespace)? {
            let backup = controller.catalog().load_backup_from_node(&node);
            println!(
                "  {}  {}  {}  {}",
                node.name(),
                node.timestamp(),
                backup.status,
                format_bytes(node.size().unwrap_or(0))
            );
        }
    }
    Ok(0)
}

/// Run the `list-plugins` command.
pub fn run_list_plugins(hub: &PluginHub) -> i32 {
    let sections: [(&str, Vec<crate::core::plugin::PluginInfo>); 5] = [
        (
            "backup strategies",
            hub.strategies.infos(crate::core::backup_plugin::NAMESPACE),
        ),
        ("hooks", hub.hooks.infos(crate::core::hooks::NAMESPACE)),
        ("streams", hub.streams.infos(crate::core::stream::NAMESPACE)),
        ("archivers", hub.archivers.infos(crate::core::archive::NAMESPACE)),
        (
            "estimation methods",
            hub.estimators.infos(crate::core::estimation::NAMESPACE),
        ),
    ];
    for (title, infos) in sections {
        println!("{title}:");
        for info in infos {
            let aliases = if info.aliases().is_empty() {
                String::new()
            } else {
                format!(" (aliases: {})", info.aliases().join(", "))
            };
            println!("  {}{}  {}", info.name(), aliases, info.summary());
        }
    }
    0
}

/// Run the `list-commands` command.
pub fn run_list_commands() -> i32 {
    let commands = [
        ("backup", "run a backup for one or more backupsets"),
        ("purge", "purge old backups from one or more backupsets"),
        ("list-backups", "list the backups in the spool"),
        ("list-commands", "list the available commands"),
        ("list-plugins", "list the registered plugins"),
        ("release", "release external resources held by previous backups"),
    ];
    for (name, summary) in commands {
        println!("{name:<14} {summary}");
    }
    0
}

/// Run the `release` command.
pub fn run_release(
    global: &Config,
    hub: Arc<PluginHub>,
    paths: &[PathBuf],
) -> Result<i32> {
    let mut controller = build_controller(global, hub, None, None)?;
    let mut failures = 0usize;
    for path in paths {
        if let Err(error) = controller.release(path) {
            tracing::error!("release '{}' failed: {}", path.display(), error);
            failures += 1;
        }
    }
    Ok(if failures == 0 { 0 } else { 1 })
}

/// Resolve the effective log level from CLI flags and the global config.
pub fn resolve_log_level(cli: &Cli, global: Option<&Config>) -> LogLevel {
    if cli.debug {
        return LogLevel::Debug;
    }
    if let Some(level) = cli.log_level.as_deref().and_then(LogLevel::from_name) {
        return level;
    }
    if cli.verbose {
        return LogLevel::Info;
    }
    if cli.quiet {
        return LogLevel::Error;
    }
    global
        .and_then(|config| config.get_section("logging"))
        .and_then(|section| section.get_log_level("level").ok())
        .unwrap_or(LogLevel::Info)
}

/// Apply `[holland] umask`, `tmpdir`, and `path` to the process.
pub fn apply_process_settings(global: &Config) -> Result<()> {
    let section = holland_section(global)?;
    if let Ok(umask) = section.get_int("umask") {
        let mode = nix::sys::stat::Mode::from_bits_truncate(umask as u32);
        nix::sys::stat::umask(mode);
    }
    if let Ok(tmpdir) = section.get_str("tmpdir") {
        if !tmpdir.is_empty() {
            std::env::set_var("TMPDIR", tmpdir);
        }
    }
    if let Ok(path) = section.get_str("path") {
        if !path.is_empty() {
            std::env::set_var("PATH", path);
        }
    }
    Ok(())
}
