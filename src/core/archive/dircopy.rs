//! The directory-copy archiver.
//!
//! Mirrors each source path into the destination directory, writing regular
//! files through a compressed output stream and recreating directories.
//! Non-regular files are skipped with a diagnostic.

use crate::core::archive::{compression_section, validated_copy, Archiver, PathSet, NAMESPACE};
use crate::core::config::{Config, Configspec};
use crate::core::plugin::{PluginInfo, PluginLoader};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::stream::{load_stream_plugin, StreamPlugin};
use crate::core::util::ensure_directory;
use nix::sys::signal::Signal;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DIRCOPY_CONFIGSPEC: &str = "\
[dircopy]
follow-unsafe-links = boolean(default=no)
";

pub struct DirCopyArchiver {
    info: PluginInfo,
    paths: PathSet,
    follow_unsafe_links: bool,
    compression: Config,
    terminated: Arc<AtomicBool>,
}

impl DirCopyArchiver {
    pub fn new() -> DirCopyArchiver {
        DirCopyArchiver {
            info: PluginInfo::builder()
                .namespace(NAMESPACE)
                .name("dircopy")
                .summary("archive a directory tree to another directory")
                .build(),
            paths: PathSet::default(),
            follow_unsafe_links: false,
            compression: Config::new(),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_terminated(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            Err(Error::interrupted("archive terminated by signal"))
        } else {
            Ok(())
        }
    }

    fn copy_file(
        &self,
        plugin: &dyn StreamPlugin,
        srcpath: &Path,
        dstpath: &Path,
    ) -> Result<()> {
        if let Some(parent) = dstpath.parent() {
            ensure_directory(parent)?;
        }
        let mut source = std::fs::File::open(srcpath)?;
        let mut stream = plugin.open_write(dstpath)?;
        std::io::copy(&mut source, &mut stream)?;
        stream.close()
    }
}

impl Default for DirCopyArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver for DirCopyArchiver {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn configspec(&self) -> Result<Configspec> {
        Configspec::from_string(DIRCOPY_CONFIGSPEC)
    }

    fn configure(&mut self, config: &Config) -> Result<()> {
        let validated = validated_copy(&self.configspec()?, config)?;
        self.follow_unsafe_links = validated
            .get_section("dircopy")
            .map(|section| section.get_bool("follow-unsafe-links"))
            .transpose()?
            .unwrap_or(false);
        self.compression = compression_section(config);
        Ok(())
    }

    fn add_path(&mut self, path: &Path, basedir: &Path) {
        self.paths.add(path, basedir);
    }

    fn archive(
        &mut self,
        streams: &dyn PluginLoader<Box<dyn StreamPlugin>>,
        dstdir: &Path,
    ) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::archive("No paths to archive specified"));
        }
        let plugin = load_stream_plugin(streams, &self.compression)?;
        tracing::info!(
            "Using compression method '{}'",
            self.compression.get_str("method").unwrap_or("none")
        );

        for (rpath, basedir) in self.paths.iter() {
            self.check_terminated()?;
            let srcpath = basedir.join(rpath);
            let dstpath = dstdir.join(rpath);
            tracing::info!("* Archiving {}", srcpath.display());

            let metadata = std::fs::symlink_metadata(&srcpath)?;
            if metadata.is_file() {
                self.copy_file(plugin.as_ref(), &srcpath, &dstpath)?;
                continue;
            }
            if !metadata.is_dir() {
                tracing::info!("- Skipping '{}' - not a regular file.", srcpath.display());
                continue;
            }

            for entry in walkdir::WalkDir::new(&srcpath)
                .follow_links(self.follow_unsafe_links)
                .sort_by_file_name()
            {
                self.check_terminated()?;
                let entry = entry?;
                let rel = entry.path().strip_prefix(&srcpath)?;
                let target = dstpath.join(rel);
                if entry.file_type().is_dir() {
                    ensure_directory(&target)?;
                } else if entry.file_type().is_file() {
                    tracing::debug!("+ Copying '{}'", rel.display());
                    self.copy_file(plugin.as_ref(), entry.path(), &target)?;
                } else {
                    tracing::info!("- Skipping '{}' - not a regular file.", rel.display());
                }
            }
        }
        Ok(())
    }

    fn terminate(&self, _signal: Signal) -> Result<()> {
        tracing::info!("Terminating directory copy");
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugin::PluginRegistry;
    use std::fs::{create_dir_all, write};
    use tempfile::TempDir;

    fn stream_registry() -> PluginRegistry<Box<dyn StreamPlugin>> {
        let mut registry = PluginRegistry::new();
        crate::core::stream::register_builtins(&mut registry);
        registry
    }

    fn config(method: &str) -> Config {
        Config::from_string(
            &format!("[compression]\nmethod = {method}\nlevel = 1\n"),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_mirror_tree_uncompressed() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        create_dir_all(source.join("nested")).unwrap();
        write(source.join("a.txt"), "alpha").unwrap();
        write(source.join("nested/b.txt"), "beta").unwrap();
        let dest = tmp.path().join("dest");
        create_dir_all(&dest).unwrap();

        let mut archiver = DirCopyArchiver::new();
        archiver.configure(&config("none")).unwrap();
        archiver.add_path(Path::new("source"), tmp.path());
        archiver.archive(&stream_registry(), &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("source/a.txt")).unwrap(),
            "alpha"
        );
        assert_eq!(
            std::fs::read_to_string(dest.join("source/nested/b.txt")).unwrap(),
            "beta"
        );
    }

    #[test]
    fn test_single_file_source() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path().join("one.txt"), "1").unwrap();
        let dest = tmp.path().join("dest");
        create_dir_all(&dest).unwrap();

        let mut archiver = DirCopyArchiver::new();
        archiver.configure(&config("none")).unwrap();
        archiver.add_path(Path::new("one.txt"), tmp.path());
        archiver.archive(&stream_registry(), &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("one.txt")).unwrap(), "1");
    }

    #[test]
    fn test_symlinks_skipped_by_default() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        create_dir_all(&source).unwrap();
        write(source.join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink(source.join("real.txt"), source.join("link.txt")).unwrap();
        let dest = tmp.path().join("dest");
        create_dir_all(&dest).unwrap();

        let mut archiver = DirCopyArchiver::new();
        archiver.configure(&config("none")).unwrap();
        archiver.add_path(Path::new("source"), tmp.path());
        archiver.archive(&stream_registry(), &dest).unwrap();

        assert!(dest.join("source/real.txt").exists());
        assert!(!dest.join("source/link.txt").exists());
    }

    #[test]
    fn test_terminate_aborts_archive() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        create_dir_all(&source).unwrap();
        write(source.join("a.txt"), "a").unwrap();
        let dest = tmp.path().join("dest");
        create_dir_all(&dest).unwrap();

        let mut archiver = DirCopyArchiver::new();
        archiver.configure(&config("none")).unwrap();
        archiver.add_path(Path::new("source"), tmp.path());
        archiver.terminate(Signal::SIGTERM).unwrap();
        assert!(archiver.archive(&stream_registry(), &dest).is_err());
    }
}
