//! # holland
//!
//! A pluggable backup orchestrator for database and filesystem state.
//!
//! ## Features
//!
//! - **Backupsets**: Named backup configurations validated by configspecs
//! - **Spool**: Locked, timestamp-ordered on-disk store of backup nodes
//! - **Catalog**: Durable sqlite record of jobs and backups
//! - **Hooks**: Ordered lifecycle observers (estimation, checksums, status,
//!   rotation, cleanup, user commands)
//! - **Streams & Archivers**: External compression pipelines and tar /
//!   directory-copy packaging
//!
//! ## Quick Start
//!
//! ```no_run
//! use holland::core::catalog::Catalog;
//! use holland::core::config::Config;
//! use holland::core::controller::BackupController;
//! use holland::core::plugin::PluginHub;
//! use holland::core::spool::BackupSpool;
//!
//! let hub = PluginHub::builtin().into_shared();
//! let spool = BackupSpool::new("/var/spool/holland");
//! let catalog = Catalog::open("/var/spool/holland/holland.catalog.db")?;
//! let mut controller = BackupController::new(spool, catalog, hub);
//!
//! let config = Config::from_string(
//!     "[holland:backup]\nbackup-plugin = noop\n[compression]\nmethod = none\n",
//!     None,
//! )?;
//! controller.job(false, None, |controller| {
//!     controller.backup(config, "example").map(|_| ())
//! })?;
//! # Ok::<(), holland::core::result_error::error::Error>(())
//! ```

pub mod cli;
pub mod core;
