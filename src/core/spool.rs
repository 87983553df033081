//! The backup spool.
//!
//! A spool is a directory tree `<root>/<backupset>/<node>/` where each node
//! is one on-disk backup. Backupset directories carry a `.holland/lock`
//! file guarding concurrent access and `oldest`/`newest` symlinks naming the
//! retention extremes. Each node carries its own `.holland/` metadata
//! directory with at least a `timestamp` file used for ordering.

use crate::core::result_error::error::Error;
use crate::core::result_error::result::Result;
use crate::core::util::{directory_size, disk_free, ensure_directory};
use chrono::NaiveDateTime;
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const METADATA_DIR: &str = ".holland";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S%.6f";
pub const NODE_NAME_FORMAT: &str = "%Y%m%d_%H%M%S";

fn epoch() -> NaiveDateTime {
    chrono::DateTime::from_timestamp(0, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

/// One backup instance inside a backupset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupNode {
    path: PathBuf,
    namespace: String,
}

impl BackupNode {
    fn new(path: PathBuf, namespace: String) -> BackupNode {
        BackupNode { path, namespace }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel)
    }

    /// Open an existing file relative to this node.
    pub fn open(&self, rel: impl AsRef<Path>) -> Result<File> {
        Ok(File::open(self.path.join(rel))?)
    }

    /// Create (or truncate) a file relative to this node.
    pub fn create(&self, rel: impl AsRef<Path>) -> Result<File> {
        Ok(File::create(self.path.join(rel))?)
    }

    /// Parsed content of the node's timestamp file; epoch 0 when the file is
    /// missing or malformed.
    pub fn timestamp(&self) -> NaiveDateTime {
        let ts_path = self.path.join(METADATA_DIR).join("timestamp");
        let Ok(raw) = std::fs::read_to_string(&ts_path) else {
            return epoch();
        };
        let raw = raw.trim();
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(raw, NODE_NAME_FORMAT))
            .unwrap_or_else(|_| epoch())
    }

    /// Recursive size of this node in bytes.
    pub fn size(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        directory_size(&self.path)
            .map_err(|e| Error::spool(format!("unable to determine size of '{}': {}", self.path.display(), e)))
    }

    /// Recursively delete this node.
    pub fn purge(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.path)
            .map_err(|e| Error::spool(format!("failed to purge node '{}': {}", self.path.display(), e)))
    }
}

/// Scoped, per-process re-entrant lock over one backupset.
///
/// Dropping the guard releases the advisory lock (closing the fd) and clears
/// the in-memory re-entrancy marker.
#[derive(Debug)]
pub struct SpoolLock {
    backupset: String,
    locked: Arc<Mutex<HashSet<String>>>,
    _flock: Option<Flock<File>>,
    owner: bool,
}

impl Drop for SpoolLock {
    fn drop(&mut self) {
        if self.owner {
            if let Ok(mut locked) = self.locked.lock() {
                locked.remove(&self.backupset);
            }
        }
    }
}

/// Manage a spool of backups rooted at a directory.
pub struct BackupSpool {
    path: PathBuf,
    locked: Arc<Mutex<HashSet<String>>>,
}

impl BackupSpool {
    pub fn new(path: impl Into<PathBuf>) -> BackupSpool {
        BackupSpool {
            path: path.into(),
            locked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Free bytes on the spool filesystem.
    pub fn capacity(&self) -> Result<u64> {
        disk_free(&self.path)
            .map_err(|e| Error::spool(format!("unable to stat spool '{}': {}", self.path.display(), e)))
    }

    fn backupset_path(&self, backupset: &str) -> PathBuf {
        self.path.join(backupset)
    }

    /// Add a new node under `backupset`, named by the current timestamp
    /// unless `name` is given.
    pub fn add_node(&self, backupset: &str, name: Option<&str>) -> Result<BackupNode> {
        let now = chrono::Local::now().naive_local();
        let default_name = now.format(NODE_NAME_FORMAT).to_string();
        let name = name.unwrap_or(&default_name);
        if !sanitize_filename::is_sanitized(name) {
            return Err(Error::spool(format!("invalid node name '{name}'")));
        }

        let namespace_path = self.backupset_path(backupset);
        ensure_directory(&namespace_path.join(METADATA_DIR)).map_err(|e| {
            Error::spool(format!(
                "failed to initialize '{}': {}",
                namespace_path.display(),
                e
            ))
        })?;

        let node_path = namespace_path.join(name);
        ensure_directory(&node_path.join(METADATA_DIR))?;
        let node = BackupNode::new(node_path, backupset.to_string());
        let mut timestamp_file = node.create(Path::new(METADATA_DIR).join("timestamp"))?;
        writeln!(timestamp_file, "{}", now.format(TIMESTAMP_FORMAT))?;
        Ok(node)
    }

    /// Load an existing node.
    pub fn load_node(&self, backupset: &str, name: &str) -> Result<BackupNode> {
        let node_path = self.backupset_path(backupset).join(name);
        if !node_path.exists() {
            return Err(Error::spool(format!("no node '{}'", node_path.display())));
        }
        Ok(BackupNode::new(node_path, backupset.to_string()))
    }

    /// Take the exclusive per-backupset lock.
    ///
    /// The lock is advisory (flock) and non-blocking: a conflict fails
    /// immediately with the holder's pid. It is re-entrant within one
    /// process through an in-memory set keyed by backupset name.
    pub fn lock(&self, backupset: &str) -> Result<SpoolLock> {
        {
            let locked = self
                .locked
                .lock()
                .map_err(|_| Error::spool("spool lock table poisoned"))?;
            if locked.contains(backupset) {
                return Ok(SpoolLock {
                    backupset: backupset.to_string(),
                    locked: self.locked.clone(),
                    _flock: None,
                    owner: false,
                });
            }
        }

        let lock_dir = self.backupset_path(backupset).join(METADATA_DIR);
        ensure_directory(&lock_dir)?;
        let lock_path = lock_dir.join("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((mut file, _errno)) => {
                let mut pid = String::new();
                let _ = file.read_to_string(&mut pid);
                let pid = pid.trim();
                let pid = if pid.is_empty() { "unknown" } else { pid };
                return Err(Error::spool_locked(backupset, pid));
            }
        };

        // record our pid for whoever hits the conflict path above
        flock.set_len(0)?;
        let mut writer: &File = &flock;
        write!(writer, "{}", std::process::id())?;
        writer.flush()?;

        let mut locked = self
            .locked
            .lock()
            .map_err(|_| Error::spool("spool lock table poisoned"))?;
        locked.insert(backupset.to_string());
        Ok(SpoolLock {
            backupset: backupset.to_string(),
            locked: self.locked.clone(),
            _flock: Some(flock),
            owner: true,
        })
    }

    fn is_mountpoint(&self) -> bool {
        let Ok(md) = std::fs::metadata(&self.path) else {
            return false;
        };
        match self.path.parent().and_then(|p| std::fs::metadata(p).ok()) {
            Some(parent_md) => md.dev() != parent_md.dev(),
            None => true,
        }
    }

    /// Iterate backupset names, sorted. Symlinks are skipped, as is a
    /// `lost+found` directory when the spool root is a mount point.
    pub fn iter_namespaces(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let skip_lost_found = self.is_mountpoint();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if skip_lost_found && name == "lost+found" {
                continue;
            }
            if entry.file_type()?.is_symlink() || !entry.file_type()?.is_dir() {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Iterate the nodes of a backupset in timestamp order.
    ///
    /// The order is total: ties and unparseable timestamps fall back to the
    /// node name. `.holland` and symlinks (`oldest`/`newest`) are skipped.
    pub fn iter_nodes(&self, backupset: &str) -> Result<Vec<BackupNode>> {
        let namespace_path = self.backupset_path(backupset);
        let entries = match std::fs::read_dir(&namespace_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == METADATA_DIR {
                continue;
            }
            if entry.file_type()?.is_symlink() || !entry.file_type()?.is_dir() {
                continue;
            }
            nodes.push(BackupNode::new(entry.path(), backupset.to_string()));
        }
        nodes.sort_by_key(|node| (node.timestamp(), node.name()));
        Ok(nodes)
    }

    /// The earliest node of a backupset.
    pub fn first(&self, backupset: &str) -> Result<Option<BackupNode>> {
        Ok(self.iter_nodes(backupset)?.into_iter().next())
    }

    /// The latest node of a backupset.
    pub fn last(&self, backupset: &str) -> Result<Option<BackupNode>> {
        Ok(self.iter_nodes(backupset)?.into_iter().next_back())
    }

    /// The node immediately following `node`.
    pub fn next(&self, node: &BackupNode) -> Result<Option<BackupNode>> {
        let nodes = self.iter_nodes(node.namespace())?;
        Ok(nodes
            .windows(2)
            .find(|pair| &pair[0] == node)
            .map(|pair| pair[1].clone()))
    }

    /// The node immediately preceding `node`.
    pub fn previous(&self, node: &BackupNode) -> Result<Option<BackupNode>> {
        let nodes = self.iter_nodes(node.namespace())?;
        Ok(nodes
            .windows(2)
            .find(|pair| &pair[1] == node)
            .map(|pair| pair[0].clone()))
    }
}
