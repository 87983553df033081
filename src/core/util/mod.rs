//! Filesystem and formatting helpers shared across the backup machinery.

use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use std::borrow::Cow;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Recursive byte count of everything under `path`.
///
/// Files that disappear mid-walk are tolerated; a backup may be purged by
/// another process while we are summing it.
pub fn directory_size(path: &Path) -> Result<u64> {
    let mut total = std::fs::symlink_metadata(path)?.len();
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.io_error().map(|e| e.kind()) == Some(ErrorKind::NotFound) => continue,
            Err(err) => return Err(err.into()),
        };
        if entry.depth() == 0 {
            continue;
        }
        match entry.metadata() {
            Ok(md) => total += md.len(),
            Err(err) if err.io_error().map(|e| e.kind()) == Some(ErrorKind::NotFound) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(total)
}

/// Disk usage of the filesystem holding `path`, in bytes.
#[derive(Clone, Copy, Debug)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let frsize = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * frsize;
    let free = stat.blocks_available() as u64 * frsize;
    let used = (stat.blocks() as u64 - stat.blocks_free() as u64) * frsize;
    Ok(DiskUsage { total, used, free })
}

/// Free bytes available to an unprivileged user on the filesystem of `path`.
pub fn disk_free(path: &Path) -> Result<u64> {
    Ok(disk_usage(path)?.free)
}

/// Create a directory path, tolerating a pre-existing directory.
///
/// Returns true when the directory was created by this call.
pub fn ensure_directory(path: &Path) -> Result<bool> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Add or replace the symlink `link_name` pointing at `target`.
///
/// `link_name` never disappears: a uniquely named temporary link is created
/// and renamed over the final name. The temporary is unlinked on any failure.
pub fn replace_symlink(target: &Path, link_name: &Path) -> Result<()> {
    let tmp_link = link_name.with_file_name(format!(
        "{}.{}.{}",
        link_name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "link".to_string()),
        std::process::id(),
        chrono::Local::now().timestamp()
    ));
    std::os::unix::fs::symlink(target, &tmp_link)?;
    std::fs::rename(&tmp_link, link_name).map_err(|err| {
        let _ = std::fs::remove_file(&tmp_link);
        Error::from(err)
    })
}

/// Resolve a command name to an absolute path by searching `PATH`.
pub fn which(cmd: &str) -> Result<PathBuf> {
    ::which::which(cmd).map_err(|err| {
        std::io::Error::new(
            ErrorKind::NotFound,
            format!("{cmd:?}: command not found ({err})"),
        )
        .into()
    })
}

static BYTE_UNITS: &[(&str, u64)] = &[
    ("", 1),
    ("KiB", 1 << 10),
    ("MiB", 1 << 20),
    ("GiB", 1 << 30),
    ("TiB", 1 << 40),
    ("PiB", 1 << 50),
];

/// Format a byte count with a binary unit suffix, e.g. `1.50MiB`.
pub fn format_bytes(nbytes: u64) -> String {
    let (unit, factor) = BYTE_UNITS
        .iter()
        .rev()
        .find(|(_, factor)| nbytes >= *factor)
        .unwrap_or(&BYTE_UNITS[0]);
    if *factor == 1 {
        format!("{nbytes}B")
    } else {
        format!("{:.2}{}", nbytes as f64 / *factor as f64, unit)
    }
}

/// Parse a human byte string such as `100`, `512K`, `1.5G` or `2GiB`.
pub fn parse_bytes(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().map_err(|_| {
        Error::validation(
            Cow::from(format!("invalid byte value '{value}'")),
            None,
        )
    })?;
    let factor = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1u64,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => {
            return Err(Error::validation(
                Cow::from(format!("unknown byte unit '{other}' in '{value}'")),
                None,
            ))
        }
    };
    Ok((number * factor as f64) as u64)
}

/// Format a duration as a short human interval, e.g. `1m32.50s`.
pub fn format_interval(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0) as u64;
    let minutes = ((total % 3600.0) / 60.0) as u64;
    let seconds = total % 60.0;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds:.2}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:.2}s")
    } else {
        format!("{seconds:.2}s")
    }
}
