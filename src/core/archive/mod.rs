//! Archiver plugins.
//!
//! An archiver packages a list of `(relative_path, base_directory)` pairs
//! into an artifact under a destination directory: the `tar` archiver pipes
//! an external tar process through a compression stream, the `dircopy`
//! archiver mirrors file trees through compressed per-file streams.

pub mod dircopy;
pub mod tar;

use crate::core::config::validators::ValidatorContext;
use crate::core::config::{Config, Configspec};
use crate::core::plugin::{PluginInfo, PluginLoader, PluginRegistry};
use crate::core::result_error::result::Result;
use crate::core::stream::StreamPlugin;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};

pub const NAMESPACE: &str = "holland.archiver";

/// Archiver capability set.
pub trait Archiver {
    fn info(&self) -> &PluginInfo;

    fn configspec(&self) -> Result<Configspec>;

    /// Receive the validated backupset config; archivers read their own
    /// section and the `[compression]` section from it.
    fn configure(&mut self, config: &Config) -> Result<()>;

    /// Queue a path (relative to `basedir`) for archival.
    fn add_path(&mut self, path: &Path, basedir: &Path);

    /// Package the queued paths into `dstdir`.
    fn archive(
        &mut self,
        streams: &dyn PluginLoader<Box<dyn StreamPlugin>>,
        dstdir: &Path,
    ) -> Result<()>;

    /// Forward a shutdown signal to in-flight archive work.
    fn terminate(&self, signal: Signal) -> Result<()>;
}

/// Queued archive inputs shared by the concrete archivers.
#[derive(Clone, Debug, Default)]
pub struct PathSet {
    paths: Vec<(PathBuf, PathBuf)>,
}

impl PathSet {
    pub fn add(&mut self, path: &Path, basedir: &Path) {
        self.paths.push((path.to_path_buf(), basedir.to_path_buf()));
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.paths
            .iter()
            .map(|(path, basedir)| (path.as_path(), basedir.as_path()))
    }
}

/// Validate `config` against an archiver spec and hand back a private copy.
pub(crate) fn validated_copy(spec: &Configspec, config: &Config) -> Result<Config> {
    let mut copy = config.clone();
    spec.validate(&mut copy, &ValidatorContext::default())?;
    Ok(copy)
}

/// Extract the `[compression]` section, defaulting to `none` when absent.
pub(crate) fn compression_section(config: &Config) -> Config {
    match config.get_section("compression") {
        Some(section) => section.clone(),
        None => {
            let mut section = Config::new();
            section.set_str("method", "none");
            section
        }
    }
}

pub fn register_builtins(registry: &mut PluginRegistry<Box<dyn Archiver>>) {
    registry.register(tar::TarArchiver::new().info().clone(), || {
        Box::new(tar::TarArchiver::new())
    });
    registry.register(dircopy::DirCopyArchiver::new().info().clone(), || {
        Box::new(dircopy::DirCopyArchiver::new())
    });
}

/// Names of the builtin archivers, for the `archive_method` check.
pub fn builtin_archiver_names() -> Vec<String> {
    vec!["tar".to_string(), "dircopy".to_string()]
}
