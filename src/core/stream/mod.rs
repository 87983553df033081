//! Byte stream plugins.
//!
//! A stream plugin opens a named sink or source, optionally piping the bytes
//! through an external compression command. The `file` plugin (alias
//! `none`) is a passthrough; the compression plugins spawn the configured
//! command with stdin/stdout wired to the caller and the on-disk file.

pub mod compression;

use crate::core::config::validators::ValidatorContext;
use crate::core::config::{Config, Configspec};
use crate::core::plugin::{PluginInfo, PluginLoader, PluginRegistry};
use crate::core::result_error::result::Result;
use crate::core::result_error::AddMsg;
use crate::core::stream::compression::{CompressionInput, CompressionOutput};
use io_enum::{Read, Write};
use std::fs::File;
use std::io;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

pub const NAMESPACE: &str = "holland.stream";

/// Configspec shared by every stream plugin.
pub const STREAM_CONFIGSPEC: &str = "\
method = compression(default=gzip)
level = integer(min=0, max=9, default=1)
options = cmdline(default=list())
additional-args = cmdline(default=list(), aliasof='options')
inline = boolean(default=yes)
";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    Read,
    Write,
}

/// A plain file sink with its path retained for diagnostics.
#[derive(Debug)]
pub struct FileOutput {
    path: PathBuf,
    file: File,
}

impl FileOutput {
    pub fn create(path: &Path) -> Result<FileOutput> {
        Ok(FileOutput {
            path: path.to_path_buf(),
            file: File::create(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl io::Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Debug)]
pub struct FileInput {
    path: PathBuf,
    file: File,
}

impl FileInput {
    pub fn open(path: &Path) -> Result<FileInput> {
        Ok(FileInput {
            path: path.to_path_buf(),
            file: File::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl io::Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Writable stream handle returned by stream plugins.
#[derive(Debug, Write)]
pub enum OutputStream {
    File(FileOutput),
    Compression(CompressionOutput),
}

impl OutputStream {
    /// Final on-disk path of the stream (including any appended extension).
    pub fn name(&self) -> &Path {
        match self {
            OutputStream::File(file) => file.path(),
            OutputStream::Compression(stream) => stream.path(),
        }
    }

    /// Command line of the filter process, if any.
    pub fn command_line(&self) -> Option<String> {
        match self {
            OutputStream::File(_) => None,
            OutputStream::Compression(stream) => Some(stream.command_line()),
        }
    }

    /// Hand the underlying sink to a child process and wait via
    /// [`OutputStream::close`]. Used by archivers that redirect a child's
    /// stdout straight into the stream.
    pub fn take_stdio(&mut self) -> Result<std::process::Stdio> {
        match self {
            OutputStream::File(file) => Ok(file.file.try_clone()?.into()),
            OutputStream::Compression(stream) => stream.take_stdin_stdio(),
        }
    }

    /// Close the stream, waiting on any filter process.
    pub fn close(&mut self) -> Result<()> {
        match self {
            OutputStream::File(file) => {
                io::Write::flush(&mut file.file)?;
                Ok(())
            }
            OutputStream::Compression(stream) => stream.close(),
        }
    }
}

/// Readable stream handle returned by stream plugins.
#[derive(Read)]
pub enum InputStream {
    File(FileInput),
    Compression(CompressionInput),
}

impl InputStream {
    pub fn name(&self) -> &Path {
        match self {
            InputStream::File(file) => file.path(),
            InputStream::Compression(stream) => stream.path(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            InputStream::File(_) => Ok(()),
            InputStream::Compression(stream) => stream.close(),
        }
    }

    /// Iterate the stream line by line.
    pub fn lines(self) -> io::Lines<io::BufReader<InputStream>> {
        io::BufRead::lines(io::BufReader::new(self))
    }
}

/// Either direction of stream handle, as returned by [`StreamPlugin::open`].
pub enum Stream {
    Input(InputStream),
    Output(OutputStream),
}

impl Stream {
    pub fn name(&self) -> &Path {
        match self {
            Stream::Input(stream) => stream.name(),
            Stream::Output(stream) => stream.name(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Stream::Input(stream) => stream.close(),
            Stream::Output(stream) => stream.close(),
        }
    }
}

/// Stream plugin capability set.
pub trait StreamPlugin {
    fn info(&self) -> &PluginInfo;

    fn configspec(&self) -> Result<Configspec> {
        Configspec::from_string(STREAM_CONFIGSPEC)
    }

    /// Receive the validated stream config section.
    fn configure(&mut self, config: &Config) -> Result<()>;

    /// Canonical file extension appended to sink names, e.g. `.gz`.
    fn extension(&self) -> &'static str {
        ""
    }

    fn open_write(&self, path: &Path) -> Result<OutputStream>;

    fn open_read(&self, path: &Path) -> Result<InputStream>;

    fn open(&self, path: &Path, mode: StreamMode) -> Result<Stream> {
        match mode {
            StreamMode::Read => self.open_read(path).map(Stream::Input),
            StreamMode::Write => self.open_write(path).map(Stream::Output),
        }
    }
}

/// Passthrough plugin writing directly to the named file.
pub struct FileStreamPlugin {
    info: PluginInfo,
}

impl FileStreamPlugin {
    pub fn new() -> Self {
        FileStreamPlugin {
            info: PluginInfo::builder()
                .namespace(NAMESPACE)
                .name("file")
                .aliases(vec!["none".to_string()])
                .summary("uncompressed file i/o")
                .build(),
        }
    }
}

impl Default for FileStreamPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamPlugin for FileStreamPlugin {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn configure(&mut self, _config: &Config) -> Result<()> {
        Ok(())
    }

    fn open_write(&self, path: &Path) -> Result<OutputStream> {
        Ok(OutputStream::File(FileOutput::create(path)?))
    }

    fn open_read(&self, path: &Path) -> Result<InputStream> {
        Ok(InputStream::File(FileInput::open(path)?))
    }
}

/// Register the builtin stream plugins.
pub fn register_builtins(registry: &mut PluginRegistry<Box<dyn StreamPlugin>>) {
    registry.register(FileStreamPlugin::new().info().clone(), || {
        Box::new(FileStreamPlugin::new())
    });
    for &(name, aliases, ext, summary) in compression::BUILTIN_COMPRESSORS {
        let info = PluginInfo::builder()
            .namespace(NAMESPACE)
            .name(name)
            .aliases(aliases.iter().map(|a| a.to_string()).collect())
            .summary(summary)
            .build();
        let plugin_info = info.clone();
        registry.register(info, move || {
            Box::new(compression::CompressionStreamPlugin::new(
                plugin_info.clone(),
                ext,
            ))
        });
    }
}

/// Names (with aliases) of the builtin stream methods, for the
/// `compression` check.
pub fn builtin_method_names() -> Vec<String> {
    let mut names = vec!["file".to_string(), "none".to_string()];
    for &(name, aliases, _, _) in compression::BUILTIN_COMPRESSORS {
        names.push(name.to_string());
        names.extend(aliases.iter().map(|a| a.to_string()));
    }
    names
}

/// Load and configure the stream plugin named by `config`'s `method` option.
pub fn load_stream_plugin(
    loader: &dyn PluginLoader<Box<dyn StreamPlugin>>,
    config: &Config,
) -> Result<Box<dyn StreamPlugin>> {
    let method = config.get_str("method")?;
    let mut plugin = loader.load(NAMESPACE, method)?;

    let mut effective = config.clone();
    let ctx = ValidatorContext {
        compression_methods: crate::core::plugin::loadable_names(loader, NAMESPACE),
        ..ValidatorContext::default()
    };
    plugin.configspec()?.validate(&mut effective, &ctx)?;
    plugin.configure(&effective)?;
    Ok(plugin)
}

/// Open a write stream through the configured method.
pub fn open_write_stream(
    loader: &dyn PluginLoader<Box<dyn StreamPlugin>>,
    path: &Path,
    config: &Config,
) -> Result<OutputStream> {
    let plugin = load_stream_plugin(loader, config)?;
    plugin.open_write(path).map_err(|error| {
        error.add_msg(format!(
            "failed to open stream {} for writing",
            path.display()
        ))
    })
}

/// Open a read stream through the configured method.
pub fn open_read_stream(
    loader: &dyn PluginLoader<Box<dyn StreamPlugin>>,
    path: &Path,
    config: &Config,
) -> Result<InputStream> {
    let plugin = load_stream_plugin(loader, config)?;
    plugin.open_read(path).map_err(|error| {
        error.add_msg(format!(
            "failed to open stream {} for reading",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Value;
    use std::io::{Read as _, Write as _};
    use tempfile::TempDir;

    fn stream_config(method: &str) -> Config {
        let mut config = Config::new();
        config.set_value("method", Value::Str(method.to_string()));
        config.set_value("level", Value::Int(1));
        config.set_value("options", Value::Cmdline(vec![]));
        config.set_value("inline", Value::Bool(true));
        config
    }

    fn registry() -> PluginRegistry<Box<dyn StreamPlugin>> {
        let mut registry = PluginRegistry::new();
        register_builtins(&mut registry);
        registry
    }

    #[test]
    fn test_builtin_method_names() {
        let names = builtin_method_names();
        for expected in ["file", "none", "gzip", "pigz", "bzip2", "pbzip2", "lzma", "xz", "lzop"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_file_stream_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.txt");
        let registry = registry();

        let mut output =
            open_write_stream(&registry, &path, &stream_config("none")).unwrap();
        output.write_all(b"hello stream").unwrap();
        output.close().unwrap();

        let mut input = open_read_stream(&registry, &path, &stream_config("none")).unwrap();
        let mut contents = String::new();
        input.read_to_string(&mut contents).unwrap();
        input.close().unwrap();
        assert_eq!(contents, "hello stream");
        assert_eq!(input.name(), path);
    }

    #[test]
    fn test_gzip_stream_round_trip() {
        if crate::core::util::which("gzip").is_err() {
            eprintln!("gzip not installed; skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.txt");
        let registry = registry();

        let mut output =
            open_write_stream(&registry, &path, &stream_config("gzip")).unwrap();
        // the plugin appends its canonical extension
        assert_eq!(output.name(), tmp.path().join("data.txt.gz"));
        output.write_all(b"compressed contents").unwrap();
        output.close().unwrap();
        assert!(tmp.path().join("data.txt.gz").exists());

        let mut input = open_read_stream(&registry, &path, &stream_config("gzip")).unwrap();
        let mut contents = String::new();
        input.read_to_string(&mut contents).unwrap();
        input.close().unwrap();
        assert_eq!(contents, "compressed contents");
    }

    #[test]
    fn test_unknown_method_fails() {
        let registry = registry();
        let tmp = TempDir::new().unwrap();
        let result = open_write_stream(
            &registry,
            &tmp.path().join("x"),
            &stream_config("nonesuch"),
        );
        assert!(result.is_err());
    }
}
