//! INI-style configuration trees.
//!
//! A [`Config`] is an insertion-ordered map of keys to either scalar values
//! or nested sections. Every key and section carries a [`Span`] recording
//! where it was read from, so validation failures can point at the offending
//! file and line. Scalars start out as raw strings; configspec validation
//! replaces them with typed [`Value`]s that render back to canonical text.

pub mod check;
pub mod configspec;
pub mod validators;

pub use check::Check;
pub use configspec::Configspec;

use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::result_error::AddMsg;
use derive_more::From;
use indexmap::IndexMap;
use itertools::Itertools;
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a key or section was defined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub source: Option<PathBuf>,
    pub start_line: usize,
    pub end_line: usize,
}

impl Span {
    pub fn new(source: Option<PathBuf>, start_line: usize, end_line: usize) -> Self {
        Span {
            source,
            start_line,
            end_line,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(path) => write!(f, "{}", path.display())?,
            None => write!(f, "<string>")?,
        }
        if self.start_line == self.end_line {
            write!(f, " line {}", self.start_line)
        } else {
            write!(f, " lines {}-{}", self.start_line, self.end_line)
        }
    }
}

/// Logging levels accepted by the `log_level` check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn from_name(name: &str) -> Option<LogLevel> {
        match name.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "fatal" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    /// Numeric form, compatible with the catalog's historical encoding.
    pub fn as_int(self) -> i64 {
        match self {
            LogLevel::Debug => 10,
            LogLevel::Info => 20,
            LogLevel::Warning => 30,
            LogLevel::Error => 40,
            LogLevel::Fatal => 50,
        }
    }

    pub fn from_int(level: i64) -> Option<LogLevel> {
        match level {
            10 => Some(LogLevel::Debug),
            20 => Some(LogLevel::Info),
            30 => Some(LogLevel::Warning),
            40 => Some(LogLevel::Error),
            50 => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    pub fn as_level_filter(self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// A scalar config value.
///
/// Freshly parsed configs only contain [`Value::Str`]; validation converts
/// scalars to the typed variants. Each variant's `Display` is the canonical
/// config-file form, so a validated config renders back to text that parses
/// and validates to an equal config.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A ratio parsed from a percent string; `75%` is stored as `0.75`.
    Percent(f64),
    List(Vec<String>),
    /// An argv list; renders back via shell quoting rather than CSV.
    Cmdline(Vec<String>),
    NameArg {
        name: String,
        arg: String,
    },
    LogLevel(LogLevel),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(&quote_if_needed(s)),
            Value::Bool(true) => f.write_str("yes"),
            Value::Bool(false) => f.write_str("no"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Percent(x) => write!(f, "{}%", x * 100.0),
            Value::List(items) => {
                f.write_str(&items.iter().map(|i| quote_if_needed(i)).join(", "))
            }
            Value::Cmdline(argv) => f.write_str(
                &shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_default(),
            ),
            Value::NameArg { name, arg } => write!(f, "{name}:{arg}"),
            Value::LogLevel(level) => write!(f, "{level}"),
        }
    }
}

/// A config tree node: either a scalar value or a nested section.
#[derive(Clone, Debug, PartialEq, From)]
pub enum Entry {
    Value(Value),
    Section(Config),
}

/// Strip one level of matching quotes and unescape the contents.
pub fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[bytes.len() - 1] == bytes[0]
    {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut escaped = false;
        for c in inner.chars() {
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else {
                out.push(c);
            }
        }
        out
    } else {
        value.to_string()
    }
}

/// Quote a value for rendering when it would otherwise parse differently.
pub fn quote_if_needed(value: &str) -> String {
    let needs_quoting = value.is_empty()
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace)
        || value.contains(['#', ',', '"']);
    if needs_quoting {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

fn canonical_key(key: &str) -> String {
    key.replace('_', "-")
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Cut an inline comment off a raw value, honoring quoted runs and escapes.
fn strip_inline_comment(raw: &str) -> &str {
    let mut in_quote = false;
    let mut escaped = false;
    for (idx, c) in raw.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_quote = !in_quote,
            '#' if !in_quote => return &raw[..idx],
            _ => {}
        }
    }
    raw
}

/// An ordered, provenance-tracking configuration section.
#[derive(Clone, Debug, Default)]
pub struct Config {
    section: String,
    path: Option<PathBuf>,
    entries: IndexMap<String, Entry>,
    spans: IndexMap<String, Span>,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn section_name(&self) -> &str {
        &self.section
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&canonical_key(key))
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(&canonical_key(key))
    }

    pub fn span(&self, key: &str) -> Option<&Span> {
        self.spans
            .get(key)
            .or_else(|| self.spans.get(&canonical_key(key)))
    }

    pub fn set_span(&mut self, key: &str, span: Span) {
        self.spans.insert(key.to_string(), span);
    }

    /// Insert or overwrite a scalar value under a canonicalized key.
    pub fn set_value(&mut self, key: &str, value: Value) {
        self.entries.insert(canonical_key(key), Entry::Value(value));
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.set_value(key, Value::Str(value.into()));
    }

    /// Insert or overwrite a section. Section names are not canonicalized.
    pub fn set_section(&mut self, name: &str, mut section: Config) {
        section.section = name.to_string();
        self.entries
            .insert(name.to_string(), Entry::Section(section));
    }

    pub fn get_section(&self, name: &str) -> Option<&Config> {
        match self.entries.get(name) {
            Some(Entry::Section(section)) => Some(section),
            _ => None,
        }
    }

    pub fn get_section_mut(&mut self, name: &str) -> Option<&mut Config> {
        match self.entries.get_mut(name) {
            Some(Entry::Section(section)) => Some(section),
            _ => None,
        }
    }

    /// Fetch a section or create an empty one in place. An existing scalar
    /// under the same name is replaced by the new section.
    pub fn section_or_default(&mut self, name: &str) -> &mut Config {
        if !matches!(self.entries.get(name), Some(Entry::Section(_))) {
            let mut section = Config::new();
            section.section = name.to_string();
            self.entries
                .insert(name.to_string(), Entry::Section(section));
        }
        match self.entries.get_mut(name) {
            Some(Entry::Section(section)) => section,
            _ => unreachable!("entry just inserted as a section"),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        match self.get(key) {
            Some(Entry::Value(value)) => Some(value),
            _ => None,
        }
    }

    fn required_value(&self, key: &str) -> Result<&Value> {
        self.get_value(key).ok_or_else(|| {
            Error::validation(
                Cow::from(format!(
                    "option '{}' is not set in [{}]",
                    key, self.section
                )),
                self.span(key).cloned(),
            )
        })
    }

    fn type_error(&self, key: &str, expected: &str, value: &Value) -> Error {
        Error::validation(
            Cow::from(format!(
                "option '{}' in [{}] is not a {expected} (found {value:?})",
                key, self.section
            )),
            self.span(key).cloned(),
        )
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        match self.required_value(key)? {
            Value::Str(s) => Ok(s),
            other => Err(self.type_error(key, "string", other)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.required_value(key)? {
            Value::Bool(b) => Ok(*b),
            other => Err(self.type_error(key, "boolean", other)),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        match self.required_value(key)? {
            Value::Int(i) => Ok(*i),
            other => Err(self.type_error(key, "integer", other)),
        }
    }

    pub fn get_float(&self, key: &str) -> Result<f64> {
        match self.required_value(key)? {
            Value::Float(x) | Value::Percent(x) => Ok(*x),
            Value::Int(i) => Ok(*i as f64),
            other => Err(self.type_error(key, "float", other)),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<&[String]> {
        match self.required_value(key)? {
            Value::List(items) | Value::Cmdline(items) => Ok(items),
            other => Err(self.type_error(key, "list", other)),
        }
    }

    pub fn get_cmdline(&self, key: &str) -> Result<&[String]> {
        match self.required_value(key)? {
            Value::Cmdline(argv) | Value::List(argv) => Ok(argv),
            other => Err(self.type_error(key, "command line", other)),
        }
    }

    pub fn get_namearg(&self, key: &str) -> Result<(&str, &str)> {
        match self.required_value(key)? {
            Value::NameArg { name, arg } => Ok((name, arg)),
            other => Err(self.type_error(key, "name:arg pair", other)),
        }
    }

    pub fn get_log_level(&self, key: &str) -> Result<LogLevel> {
        match self.required_value(key)? {
            Value::LogLevel(level) => Ok(*level),
            other => Err(self.type_error(key, "log level", other)),
        }
    }

    /// Remove a key, preserving the relative order of the remaining keys.
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let key = canonical_key(key);
        self.spans.shift_remove(&key);
        self.entries.shift_remove(&key)
    }

    /// Check whether `key1` appears after `key2` in insertion order.
    pub fn is_after(&self, key1: &str, key2: &str) -> bool {
        match (
            self.entries.get_index_of(&canonical_key(key1)),
            self.entries.get_index_of(&canonical_key(key2)),
        ) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }

    /// Rename `old` to `new`, keeping `old`'s position and value.
    ///
    /// An existing entry under `new` is removed; other keys keep their order.
    pub fn rename(&mut self, old: &str, new: &str) {
        let old = canonical_key(old);
        let new = canonical_key(new);
        if old == new || !self.entries.contains_key(&old) {
            return;
        }
        self.entries.shift_remove(&new);
        if let Some(old_idx) = self.entries.get_index_of(&old) {
            if let Some(entry) = self.entries.shift_remove(&old) {
                let idx = old_idx.min(self.entries.len());
                self.entries.shift_insert(idx, new.clone(), entry);
            }
        }
        self.spans.shift_remove(&new);
        if let Some(span) = self.spans.shift_remove(&old) {
            self.spans.insert(new, span);
        }
    }

    /// Merge `other` into this config; values from `other` win on conflict.
    ///
    /// Overlaying a scalar where a section exists (or vice versa) is a hard
    /// type conflict.
    pub fn merge(&mut self, other: Config) -> Result<()> {
        for (key, entry) in other.entries {
            match entry {
                Entry::Section(section) => match self.entries.get_mut(&key) {
                    Some(Entry::Section(existing)) => existing.merge(section)?,
                    Some(Entry::Value(_)) => {
                        return Err(Error::validation(
                            Cow::from(format!(
                                "value-namespace conflict merging section [{key}]"
                            )),
                            other.spans.get(&key).cloned(),
                        ))
                    }
                    None => {
                        self.entries.insert(key.clone(), Entry::Section(section));
                    }
                },
                Entry::Value(value) => {
                    if let Some(Entry::Section(_)) = self.entries.get(&key) {
                        return Err(Error::validation(
                            Cow::from(format!(
                                "value-namespace conflict merging option '{key}'"
                            )),
                            other.spans.get(&key).cloned(),
                        ));
                    }
                    self.entries.insert(key.clone(), Entry::Value(value));
                }
            }
        }
        for (key, span) in other.spans {
            self.spans.insert(key, span);
        }
        Ok(())
    }

    /// Meld `other` into this config; existing values are preserved and only
    /// missing keys are copied. Type conflicts are hard errors, as in merge.
    pub fn meld(&mut self, other: Config) -> Result<()> {
        for (key, entry) in other.entries {
            match entry {
                Entry::Section(section) => match self.entries.get_mut(&key) {
                    Some(Entry::Section(existing)) => existing.meld(section)?,
                    Some(Entry::Value(_)) => {
                        return Err(Error::validation(
                            Cow::from(format!(
                                "value-namespace conflict melding section [{key}]"
                            )),
                            other.spans.get(&key).cloned(),
                        ))
                    }
                    None => {
                        if let Some(span) = other.spans.get(&key) {
                            self.spans.insert(key.clone(), span.clone());
                        }
                        self.entries.insert(key.clone(), Entry::Section(section));
                    }
                },
                Entry::Value(value) => match self.entries.get(&key) {
                    Some(Entry::Section(_)) => {
                        return Err(Error::validation(
                            Cow::from(format!(
                                "value-namespace conflict melding option '{key}'"
                            )),
                            other.spans.get(&key).cloned(),
                        ))
                    }
                    Some(Entry::Value(_)) => {}
                    None => {
                        if let Some(span) = other.spans.get(&key) {
                            self.spans.insert(key.clone(), span.clone());
                        }
                        self.entries.insert(key.clone(), Entry::Value(value));
                    }
                },
            }
        }
        Ok(())
    }

    /// Parse config text. `name` is used for provenance when there is no
    /// backing file.
    pub fn from_string(text: &str, name: Option<&Path>) -> Result<Config> {
        let mut config = Config::new();
        config.path = name.map(Path::to_path_buf);
        config.parse_lines(text.lines(), name)?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).add_msg(format!("failed to read {}", path.display())))?;
        Config::from_string(&text, Some(path))
    }

    /// Read and merge a list of config files, left to right.
    pub fn read(paths: &[PathBuf]) -> Result<Config> {
        let mut main = Config::new();
        for path in paths {
            let config = Config::from_path(path)?;
            main.merge(config)?;
            main.path = Some(path.clone());
        }
        Ok(main)
    }

    fn parse_lines<'a>(
        &mut self,
        lines: impl Iterator<Item = &'a str>,
        source: Option<&Path>,
    ) -> Result<()> {
        let mut current_section: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (idx, line) in lines.enumerate() {
            let lineno = idx + 1;
            let span = Span::new(source.map(Path::to_path_buf), lineno, lineno);
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            // [section]
            if let Some(rest) = trimmed.strip_prefix('[') {
                if let Some(close) = rest.find(']') {
                    let trailer = rest[close + 1..].trim();
                    if trailer.is_empty() || trailer.starts_with('#') {
                        let name = rest[..close].to_string();
                        if name.is_empty() {
                            return Err(Error::config_syntax(span, "empty section name"));
                        }
                        if self.get_section(&name).is_none() {
                            let mut section = Config::new();
                            section.section = name.clone();
                            section.path = self.path.clone();
                            self.entries
                                .insert(name.clone(), Entry::Section(section));
                        }
                        self.spans.insert(name.clone(), span);
                        current_section = Some(name);
                        last_key = None;
                        continue;
                    }
                }
                return Err(Error::config_syntax(span, "malformed section header"));
            }

            // continuation line: leading whitespace appends to the last key
            if line.starts_with(char::is_whitespace) {
                let Some(key) = &last_key else {
                    return Err(Error::config_syntax(span, "unexpected continuation line"));
                };
                let continuation = strip_inline_comment(trimmed).trim().to_string();
                let target = match &current_section {
                    Some(name) => self.section_or_default(name),
                    None => self,
                };
                match target.entries.get_mut(key) {
                    Some(Entry::Value(Value::Str(existing))) => existing.push_str(&continuation),
                    _ => {
                        return Err(Error::config_syntax(span, "unexpected continuation line"))
                    }
                }
                if let Some(existing_span) = target.spans.get_mut(key) {
                    existing_span.end_line = lineno;
                }
                continue;
            }

            // %include path
            if let Some(rest) = line.strip_prefix("%include") {
                let target = rest.trim();
                if target.is_empty() {
                    return Err(Error::config_syntax(span, "%include requires a path"));
                }
                let mut include_path = PathBuf::from(target);
                if include_path.is_relative() {
                    let base = source
                        .and_then(Path::parent)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."));
                    include_path = base.join(include_path);
                }
                let sub = Config::from_path(&include_path)?;
                self.merge(sub)?;
                continue;
            }

            // key = value
            let key_len = line
                .find(|c: char| !is_key_char(c))
                .unwrap_or(line.len());
            if key_len > 0 && line[key_len..].trim_start().starts_with('=') {
                let key = canonical_key(&line[..key_len]);
                let raw_value = line[key_len..]
                    .trim_start()
                    .strip_prefix('=')
                    .unwrap_or("");
                let value = strip_inline_comment(raw_value).trim().to_string();
                let target = match &current_section {
                    Some(name) => self.section_or_default(name),
                    None => self,
                };
                target.entries.insert(key.clone(), Entry::Value(Value::Str(value)));
                target.spans.insert(key.clone(), span);
                last_key = Some(key);
                continue;
            }

            return Err(Error::config_syntax(
                span,
                Cow::from(format!("invalid config line: {trimmed:?}")),
            ));
        }
        Ok(())
    }

    /// Render this config back to text.
    pub fn text(&self) -> String {
        self.to_string()
    }

    /// Write the rendered config to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.text())?;
        Ok(())
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, entry) in &self.entries {
            match entry {
                Entry::Section(section) => {
                    writeln!(f, "[{key}]")?;
                    write!(f, "{section}")?;
                }
                Entry::Value(value) => writeln!(f, "{key} = {value}")?,
            }
        }
        Ok(())
    }
}
