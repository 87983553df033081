//! Compression command streams.
//!
//! Write streams spawn `<cmd> [options] -<level>` with stdin piped from the
//! caller and stdout writing the destination file; read streams spawn
//! `<cmd> -d [options]` with stdin reading the source file and stdout piped
//! to the caller. stderr is buffered to a temp file and drained to the log
//! when the stream closes.

use crate::core::config::Config;
use crate::core::plugin::PluginInfo;
use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::stream::{InputStream, OutputStream, StreamPlugin};
use crate::core::util::which;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Builtin compression commands: (name, aliases, extension, summary).
pub const BUILTIN_COMPRESSORS: &[(&str, &[&str], &str, &str)] = &[
    ("gzip", &[], ".gz", "gzip compression"),
    ("pigz", &[], ".gz", "parallel gzip compression"),
    ("bzip2", &[], ".bz2", "bzip2 compression"),
    ("pbzip2", &[], ".bz2", "parallel bzip2 compression"),
    ("lzma", &["xz"], ".xz", "lzma compression"),
    ("lzop", &[], ".lzo", "lzo compression"),
];

#[derive(Clone, Debug, Default)]
struct StreamSettings {
    method: String,
    level: i64,
    options: Vec<String>,
}

/// A stream plugin that pipes bytes through an external compression command.
pub struct CompressionStreamPlugin {
    info: PluginInfo,
    ext: &'static str,
    settings: StreamSettings,
}

impl CompressionStreamPlugin {
    pub fn new(info: PluginInfo, ext: &'static str) -> Self {
        CompressionStreamPlugin {
            info,
            ext,
            settings: StreamSettings::default(),
        }
    }

    fn command_path(&self) -> Result<PathBuf> {
        let method = if self.settings.method.is_empty() {
            self.info.name()
        } else {
            &self.settings.method
        };
        which(method).map_err(|_| Error::stream_method_not_found(method.to_string()))
    }

    fn dest_path(&self, path: &Path) -> PathBuf {
        let name = path.to_string_lossy();
        if name.ends_with(self.ext) {
            path.to_path_buf()
        } else {
            PathBuf::from(format!("{name}{}", self.ext))
        }
    }
}

impl StreamPlugin for CompressionStreamPlugin {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn configure(&mut self, config: &Config) -> Result<()> {
        self.settings = StreamSettings {
            method: config.get_str("method")?.to_string(),
            level: config.get_int("level")?,
            options: config.get_cmdline("options")?.to_vec(),
        };
        Ok(())
    }

    fn extension(&self) -> &'static str {
        self.ext
    }

    fn open_write(&self, path: &Path) -> Result<OutputStream> {
        let cmd = self.command_path()?;
        let mut argv: Vec<String> = vec![cmd.to_string_lossy().into_owned()];
        argv.extend(self.settings.options.iter().cloned());
        if self.settings.level > 0 {
            argv.push(format!("-{}", self.settings.level));
        }
        let dest = self.dest_path(path);
        CompressionOutput::spawn(argv, &dest).map(OutputStream::Compression)
    }

    fn open_read(&self, path: &Path) -> Result<InputStream> {
        let cmd = self.command_path()?;
        let mut argv: Vec<String> = vec![cmd.to_string_lossy().into_owned(), "-d".to_string()];
        argv.extend(self.settings.options.iter().cloned());
        let src = self.dest_path(path);
        CompressionInput::spawn(argv, &src).map(InputStream::Compression)
    }
}

fn command_line(argv: &[String]) -> String {
    shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
}

/// Wait on a finished filter process: replay its buffered stderr to the log
/// and fail when the exit status is non-zero.
fn finish_child(child: &mut Child, argv: &[String], stderr: &mut File) -> Result<()> {
    let status = child.wait()?;
    let _ = stderr.seek(SeekFrom::Start(0));
    let mut buffered = String::new();
    if io::Read::read_to_string(stderr, &mut buffered).is_ok() {
        for line in buffered.lines() {
            if !line.trim().is_empty() {
                tracing::info!("{}: {}", argv[0], line.trim_end());
            }
        }
    }
    if status.success() {
        Ok(())
    } else {
        Err(Error::from(io::Error::other(format!(
            "'{}' exited with non-zero status ({status})",
            command_line(argv)
        ))))
    }
}

/// Write side of a compression pipeline.
#[derive(Debug)]
pub struct CompressionOutput {
    path: PathBuf,
    argv: Vec<String>,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: File,
    closed: bool,
}

impl CompressionOutput {
    fn spawn(argv: Vec<String>, dest: &Path) -> Result<CompressionOutput> {
        let stdout = File::create(dest)?;
        let stderr = tempfile::tempfile()?;
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr.try_clone()?)
            .spawn()?;
        let stdin = child.stdin.take();
        tracing::debug!("spawned '{}' writing {}", command_line(&argv), dest.display());
        Ok(CompressionOutput {
            path: dest.to_path_buf(),
            argv,
            child,
            stdin,
            stderr,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn command_line(&self) -> String {
        command_line(&self.argv)
    }

    /// Detach the child's stdin as a `Stdio` so another process can write
    /// into the pipeline directly.
    pub fn take_stdin_stdio(&mut self) -> Result<Stdio> {
        self.stdin
            .take()
            .map(Stdio::from)
            .ok_or_else(|| Error::from(io::Error::other("stream stdin already taken")))
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        drop(self.stdin.take());
        finish_child(&mut self.child, &self.argv, &mut self.stderr)
    }
}

impl io::Write for CompressionOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stdin {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::other("stream is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stdin {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CompressionOutput {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.close() {
                tracing::warn!("error closing stream {}: {}", self.path.display(), error);
            }
        }
    }
}

/// Read side of a compression pipeline.
pub struct CompressionInput {
    path: PathBuf,
    argv: Vec<String>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: File,
    closed: bool,
}

impl CompressionInput {
    fn spawn(argv: Vec<String>, src: &Path) -> Result<CompressionInput> {
        let stdin = File::open(src)?;
        let stderr = tempfile::tempfile()?;
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(stderr.try_clone()?)
            .spawn()?;
        let stdout = child.stdout.take();
        tracing::debug!("spawned '{}' reading {}", command_line(&argv), src.display());
        Ok(CompressionInput {
            path: src.to_path_buf(),
            argv,
            child,
            stdout,
            stderr,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn command_line(&self) -> String {
        command_line(&self.argv)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        drop(self.stdout.take());
        finish_child(&mut self.child, &self.argv, &mut self.stderr)
    }
}

impl io::Read for CompressionInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stdout {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for CompressionInput {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.close() {
                tracing::warn!("error closing stream {}: {}", self.path.display(), error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Value;
    use crate::core::stream::NAMESPACE;
    use std::io::{Read as _, Write as _};
    use tempfile::TempDir;

    fn gzip_plugin() -> CompressionStreamPlugin {
        let info = PluginInfo::builder().namespace(NAMESPACE).name("gzip").build();
        let mut plugin = CompressionStreamPlugin::new(info, ".gz");
        let mut config = Config::new();
        config.set_value("method", Value::Str("gzip".to_string()));
        config.set_value("level", Value::Int(6));
        config.set_value("options", Value::Cmdline(vec![]));
        plugin.configure(&config).unwrap();
        plugin
    }

    #[test]
    fn test_extension_appended_once() {
        let plugin = gzip_plugin();
        assert_eq!(
            plugin.dest_path(Path::new("/tmp/backup.tar")),
            Path::new("/tmp/backup.tar.gz")
        );
        assert_eq!(
            plugin.dest_path(Path::new("/tmp/backup.tar.gz")),
            Path::new("/tmp/backup.tar.gz")
        );
    }

    #[test]
    fn test_write_and_read_pipeline() {
        if which("gzip").is_err() {
            eprintln!("gzip not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let plugin = gzip_plugin();

        let target = tmp.path().join("payload");
        let mut output = plugin.open_write(&target).unwrap();
        output.write_all(b"pipeline payload").unwrap();
        output.close().unwrap();
        assert!(tmp.path().join("payload.gz").exists());

        let mut input = plugin.open_read(&target).unwrap();
        let mut contents = String::new();
        input.read_to_string(&mut contents).unwrap();
        input.close().unwrap();
        assert_eq!(contents, "pipeline payload");
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        if which("gzip").is_err() {
            eprintln!("gzip not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let plugin = gzip_plugin();

        // reading a file that is not gzip data makes gzip -d fail on close
        let bogus = tmp.path().join("bogus.gz");
        std::fs::write(&bogus, b"not gzip data").unwrap();
        let mut input = plugin.open_read(&tmp.path().join("bogus")).unwrap();
        let mut sink = Vec::new();
        let _ = input.read_to_end(&mut sink);
        let error = input.close().unwrap_err();
        assert!(error.to_string().contains("non-zero"), "{error}");
    }

    #[test]
    fn test_missing_binary_is_method_not_found() {
        let info = PluginInfo::builder()
            .namespace(NAMESPACE)
            .name("gzip")
            .build();
        let mut plugin = CompressionStreamPlugin::new(info, ".gz");
        let mut config = Config::new();
        config.set_value("method", Value::Str("no-such-compressor".to_string()));
        config.set_value("level", Value::Int(1));
        config.set_value("options", Value::Cmdline(vec![]));
        plugin.configure(&config).unwrap();

        let error = plugin.open_write(Path::new("/tmp/x")).unwrap_err();
        assert!(error.to_string().contains("not found on path"), "{error}");
    }
}
