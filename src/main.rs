use clap::Parser;
use holland::cli::{self, Cli, Command};
use holland::core::plugin::PluginHub;
use std::process::exit;
use tracing::error;

fn main() {
    let cli = Cli::parse();

    let hub = PluginHub::builtin().into_shared();
    let validator_ctx = hub.validator_context();

    let global = match cli::load_global_config(&cli.config, &validator_ctx) {
        Ok(global) => global,
        Err(err) => {
            eprintln!("failed to load config {}: {}", cli.config.display(), err);
            exit(1);
        }
    };

    let level = cli::resolve_log_level(&cli, Some(&global));
    tracing_subscriber::fmt()
        .with_max_level(level.as_level_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = cli::apply_process_settings(&global) {
        error!("{err}");
        exit(1);
    }

    let result = match &cli.command {
        Command::Backup {
            backup_directory,
            dry_run,
            catalog_db,
            backupset,
        } => cli::run_backup(
            &global,
            hub,
            backup_directory.as_deref(),
            catalog_db.as_deref(),
            *dry_run,
            backupset,
        ),
        Command::Purge {
            retention_count,
            all,
            dry_run,
            force,
            execute,
            backup_directory,
            backupset,
        } => {
            // dry-run is the default; --force / --execute switch it off
            let effective_dry_run = !(*force || *execute) || *dry_run;
            cli::run_purge(
                &global,
                hub,
                backup_directory.as_deref(),
                *retention_count,
                *all,
                effective_dry_run,
                backupset,
            )
        }
        Command::ListBackups { backup_directory } => {
            cli::run_list_backups(&global, hub, backup_directory.as_deref())
        }
        Command::ListCommands => Ok(cli::run_list_commands()),
        Command::ListPlugins => Ok(cli::run_list_plugins(&hub)),
        Command::Release { path } => cli::run_release(&global, hub, path),
    };

    match result {
        Ok(code) => exit(code),
        Err(err) => {
            error!("{err}");
            tracing::debug!("failure detail: {:?}", err);
            exit(1);
        }
    }
}
