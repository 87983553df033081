//! The tar archiver.
//!
//! Spawns `tar --verbose --totals -cf - ...` with stdout piped through a
//! compression write stream into `backup.tar[.ext]` and stderr captured to
//! `archive.log`. On failure the captured stderr is replayed to the log and
//! the error names the terminating signal when tar was killed.

use crate::core::archive::{compression_section, validated_copy, Archiver, PathSet, NAMESPACE};
use crate::core::config::{Config, Configspec};
use crate::core::plugin::{PluginInfo, PluginLoader};
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::stream::{open_write_stream, StreamPlugin};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

pub const TAR_CONFIGSPEC: &str = "\
[tar]
exclude = force_list(default=list())
pre-args = force_list(default=list())
post-args = force_list(default=list())
";

pub struct TarArchiver {
    info: PluginInfo,
    paths: PathSet,
    tar_config: Config,
    compression: Config,
    child_pid: Arc<Mutex<Option<u32>>>,
}

impl TarArchiver {
    pub fn new() -> TarArchiver {
        TarArchiver {
            info: PluginInfo::builder()
                .namespace(NAMESPACE)
                .name("tar")
                .summary("archive via the tar command")
                .build(),
            paths: PathSet::default(),
            tar_config: Config::new(),
            compression: Config::new(),
            child_pid: Arc::new(Mutex::new(None)),
        }
    }

    fn build_args(&self) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![
            "tar".to_string(),
            "--verbose".to_string(),
            "--totals".to_string(),
            "-cf".to_string(),
            "-".to_string(),
        ];
        for (idx, pre_arg) in self.tar_config.get_list("pre-args")?.iter().enumerate() {
            args.insert(1 + idx, pre_arg.clone());
        }

        let mut last_basedir: Option<&Path> = None;
        for (path, basedir) in self.paths.iter() {
            if path.is_relative() && last_basedir != Some(basedir) {
                args.push("-C".to_string());
                args.push(basedir.to_string_lossy().into_owned());
                last_basedir = Some(basedir);
            }
            args.push(path.to_string_lossy().into_owned());
        }

        args.extend(self.tar_config.get_list("post-args")?.iter().cloned());
        for pattern in self.tar_config.get_list("exclude")? {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        Ok(args)
    }
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self::new()
    }
}

fn signal_name(signum: i32) -> String {
    Signal::try_from(signum)
        .map(|signal| signal.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signum}"))
}

impl Archiver for TarArchiver {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn configspec(&self) -> Result<Configspec> {
        Configspec::from_string(TAR_CONFIGSPEC)
    }

    fn configure(&mut self, config: &Config) -> Result<()> {
        let validated = validated_copy(&self.configspec()?, config)?;
        self.tar_config = validated
            .get_section("tar")
            .cloned()
            .unwrap_or_default();
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
        let args = self.build_args()?;

        let dstpath = dstdir.join("backup.tar");
        let errpath = dstdir.join("archive.log");
        let mut stream = open_write_stream(streams, &dstpath, &self.compression)?;
        let mut stderr = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&errpath)?;

        tracing::info!("+ Archiving via command: {}", args.join(" "));
        tracing::info!("+ Archive destination: {}", stream.name().display());
        if let Some(filter) = stream.command_line() {
            tracing::info!("+ Compressing via {}", filter);
        }

        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdout(stream.take_stdio()?)
            .stderr(stderr.try_clone()?)
            .spawn()?;
        if let Ok(mut pid) = self.child_pid.lock() {
            *pid = Some(child.id());
        }

        let status = child.wait();
        if let Ok(mut pid) = self.child_pid.lock() {
            *pid = None;
        }
        let status = status?;
        stream.close()?;

        if !status.success() {
            stderr.seek(SeekFrom::Start(0))?;
            for line in BufReader::new(&stderr).lines() {
                let line = line?;
                tracing::error!("tar: {}", line.trim_end());
            }
            let message = match status.signal() {
                Some(signum) => format!(
                    "tar was terminated by {} [{}]",
                    signal_name(signum),
                    signum
                ),
                None => format!(
                    "tar exited with non-zero status [{}]",
                    status.code().unwrap_or(-1)
                ),
            };
            return Err(Error::archive(message));
        }
        Ok(())
    }

    fn terminate(&self, signal: Signal) -> Result<()> {
        let pid = self.child_pid.lock().ok().and_then(|pid| *pid);
        if let Some(pid) = pid {
            tracing::info!("Terminating tar({}) with signal {}", pid, signal);
            kill(Pid::from_raw(pid as i32), signal)?;
        }
        Ok(())
    }
}
