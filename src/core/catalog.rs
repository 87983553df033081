//! The backup catalog.
//!
//! Durable job and backup metadata over a local sqlite database. The
//! controller is the single writer; reads may happen concurrently from
//! other processes inspecting the same catalog file.

use crate::core::config::Config;
use crate::core::result_error::result::Result;
use crate::core::spool::{BackupNode, METADATA_DIR};
use bon::Builder;
use chrono::NaiveDateTime;
use derive_more::Display;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Lifecycle states shared by jobs and backups. Transitions are forward
/// only: initialized -> running -> completed | failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum BackupStatus {
    #[display("initialized")]
    Initialized,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl FromStr for BackupStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(BackupStatus::Initialized),
            "running" => Ok(BackupStatus::Running),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            _ => Err(()),
        }
    }
}

/// One controller invocation, owning zero or more backups.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: Option<i64>,
    pub pid: u32,
    pub cmdline: String,
    pub start_time: NaiveDateTime,
    pub stop_time: Option<NaiveDateTime>,
    pub status: BackupStatus,
    pub external_id: Option<String>,
    pub is_dryrun: bool,
}

impl Job {
    pub fn new(is_dryrun: bool, external_id: Option<String>) -> Job {
        let cmdline = shlex::try_join(
            std::env::args().collect::<Vec<_>>().iter().map(String::as_str),
        )
        .unwrap_or_default();
        Job {
            id: None,
            pid: std::process::id(),
            cmdline,
            start_time: chrono::Local::now().naive_local(),
            stop_time: None,
            status: BackupStatus::Initialized,
            external_id,
            is_dryrun,
        }
    }
}

/// One backup run of a single backupset.
#[derive(Clone, Debug)]
pub struct Backup {
    pub id: Option<i64>,
    pub job_id: Option<i64>,
    pub name: String,
    pub start_time: NaiveDateTime,
    pub stop_time: Option<NaiveDateTime>,
    pub message: Option<String>,
    pub status: BackupStatus,
    pub estimated_size: Option<u64>,
    pub real_size: Option<u64>,
    pub backup_directory: PathBuf,
    pub config_path: Option<PathBuf>,
    pub config: Option<String>,
}

impl Backup {
    pub fn new(job_id: Option<i64>, name: &str) -> Backup {
        Backup {
            id: None,
            job_id,
            name: name.to_string(),
            start_time: chrono::Local::now().naive_local(),
            stop_time: None,
            message: None,
            status: BackupStatus::Initialized,
            estimated_size: None,
            real_size: None,
            backup_directory: PathBuf::new(),
            config_path: None,
            config: None,
        }
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        let stop = self.stop_time?;
        (stop - self.start_time).to_std().ok()
    }
}

/// Column filters for backup queries.
#[derive(Clone, Debug, Default, Builder)]
pub struct BackupFilter {
    #[builder(into)]
    pub name: Option<String>,
    #[builder(into)]
    pub backup_directory: Option<PathBuf>,
    pub status: Option<BackupStatus>,
    pub job_id: Option<i64>,
}

impl BackupFilter {
    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(name) = &self.name {
            clauses.push("name = ?");
            values.push(SqlValue::Text(name.clone()));
        }
        if let Some(dir) = &self.backup_directory {
            clauses.push("backup_directory = ?");
            values.push(SqlValue::Text(dir.to_string_lossy().into_owned()));
        }
        if let Some(status) = &self.status {
            clauses.push("status = ?");
            values.push(SqlValue::Text(status.to_string()));
        }
        if let Some(job_id) = self.job_id {
            clauses.push("job_id = ?");
            values.push(SqlValue::Integer(job_id));
        }
        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

const BACKUP_COLUMNS: &str = "id, job_id, name, start_time, stop_time, message, status, \
                              estimated_size, real_size, backup_directory, config_path, config";

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open (or create) a catalog. `url` is a sqlite path, optionally with a
    /// `sqlite://` prefix; the empty string opens an in-memory catalog.
    pub fn open(url: &str) -> Result<Catalog> {
        let url = url.strip_prefix("sqlite://").unwrap_or(url);
        let conn = if url.is_empty() || url == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(url)?
        };
        let catalog = Catalog { conn };
        catalog.create_tables()?;
        Ok(catalog)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                 version INTEGER PRIMARY KEY,
                 holland_version TEXT
             );
             CREATE TABLE IF NOT EXISTS job (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 pid INTEGER,
                 cmdline TEXT,
                 start_time TEXT DEFAULT (datetime('now', 'localtime')),
                 stop_time TEXT,
                 status TEXT DEFAULT 'initialized',
                 external_id TEXT,
                 is_dryrun INTEGER DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_job_external_id ON job(external_id);
             CREATE TABLE IF NOT EXISTS backup (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 job_id INTEGER REFERENCES job(id),
                 name TEXT,
                 start_time TEXT DEFAULT (datetime('now', 'localtime')),
                 stop_time TEXT,
                 message TEXT,
                 status TEXT DEFAULT 'initialized',
                 estimated_size INTEGER,
                 real_size INTEGER,
                 backup_directory TEXT,
                 config_path TEXT,
                 config TEXT
             );",
        )?;
        let rows: i64 =
            self.conn
                .query_row("SELECT count(*) FROM schema_version", [], |row| row.get(0))?;
        if rows == 0 {
            self.conn.execute(
                "INSERT INTO schema_version (version, holland_version) VALUES (1, ?1)",
                params![env!("CARGO_PKG_VERSION")],
            )?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))?)
    }

    /// Persist a new job row; sets `job.id`.
    pub fn insert_job(&self, job: &mut Job) -> Result<()> {
        self.conn.execute(
            "INSERT INTO job (pid, cmdline, start_time, stop_time, status, external_id, is_dryrun)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.pid,
                job.cmdline,
                job.start_time,
                job.stop_time,
                job.status.to_string(),
                job.external_id,
                job.is_dryrun,
            ],
        )?;
        job.id = Some(self.conn.last_insert_rowid());
        Ok(())
    }

    pub fn update_job(&self, job: &Job) -> Result<()> {
        self.conn.execute(
            "UPDATE job SET stop_time = ?1, status = ?2 WHERE id = ?3",
            params![job.stop_time, job.status.to_string(), job.id],
        )?;
        Ok(())
    }

    /// Persist a new backup row; sets `backup.id`.
    pub fn insert_backup(&self, backup: &mut Backup) -> Result<()> {
        self.conn.execute(
            "INSERT INTO backup (job_id, name, start_time, stop_time, message, status,
                                 estimated_size, real_size, backup_directory, config_path, config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                backup.job_id,
                backup.name,
                backup.start_time,
                backup.stop_time,
                backup.message,
                backup.status.to_string(),
                backup.estimated_size.map(|v| v as i64),
                backup.real_size.map(|v| v as i64),
                backup.backup_directory.to_string_lossy(),
                backup.config_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                backup.config,
            ],
        )?;
        backup.id = Some(self.conn.last_insert_rowid());
        Ok(())
    }

    pub fn update_backup(&self, backup: &Backup) -> Result<()> {
        self.conn.execute(
            "UPDATE backup SET stop_time = ?1, message = ?2, status = ?3, estimated_size = ?4,
                               real_size = ?5, backup_directory = ?6, config_path = ?7, config = ?8
             WHERE id = ?9",
            params![
                backup.stop_time,
                backup.message,
                backup.status.to_string(),
                backup.estimated_size.map(|v| v as i64),
                backup.real_size.map(|v| v as i64),
                backup.backup_directory.to_string_lossy(),
                backup.config_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                backup.config,
                backup.id,
            ],
        )?;
        Ok(())
    }

    fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<Backup> {
        Ok(Backup {
            id: row.get(0)?,
            job_id: row.get(1)?,
            name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            start_time: row.get(3)?,
            stop_time: row.get(4)?,
            message: row.get(5)?,
            status: row
                .get::<_, Option<String>>(6)?
                .and_then(|s| s.parse().ok())
                .unwrap_or(BackupStatus::Initialized),
            estimated_size: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
            real_size: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
            backup_directory: row
                .get::<_, Option<String>>(9)?
                .map(PathBuf::from)
                .unwrap_or_default(),
            config_path: row.get::<_, Option<String>>(10)?.map(PathBuf::from),
            config: row.get(11)?,
        })
    }

    /// First backup matching the filter, ordered by start time.
    pub fn load_backup(&self, filter: &BackupFilter) -> Result<Option<Backup>> {
        let (clause, values) = filter.where_clause();
        let sql =
            format!("SELECT {BACKUP_COLUMNS} FROM backup{clause} ORDER BY start_time LIMIT 1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params_from_iter(values), Self::backup_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All backups matching the filter, ordered by start time.
    pub fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<Backup>> {
        let (clause, values) = filter.where_clause();
        let sql = format!("SELECT {BACKUP_COLUMNS} FROM backup{clause} ORDER BY start_time");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::backup_from_row)?;
        let mut backups = Vec::new();
        for row in rows {
            backups.push(row?);
        }
        Ok(backups)
    }

    /// The closest backup started before `backup`.
    pub fn previous_backup(&self, backup: &Backup) -> Result<Option<Backup>> {
        let sql = format!(
            "SELECT {BACKUP_COLUMNS} FROM backup WHERE start_time < ?1
             ORDER BY start_time DESC LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![backup.start_time], Self::backup_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// The closest backup started after `backup`.
    pub fn next_backup(&self, backup: &Backup) -> Result<Option<Backup>> {
        let sql = format!(
            "SELECT {BACKUP_COLUMNS} FROM backup WHERE start_time > ?1
             ORDER BY start_time LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![backup.start_time], Self::backup_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Synthesize an unsaved backup row from a spool node by reading its
    /// status file; an unreadable status means `failed`.
    pub fn load_backup_from_node(&self, node: &BackupNode) -> Backup {
        let mut backup = Backup::new(None, node.namespace());
        backup.backup_directory = node.path().to_path_buf();
        backup.start_time = node.timestamp();
        backup.status = Config::from_path(&node.join(Path::new(METADATA_DIR).join("status")))
            .ok()
            .and_then(|status| {
                status
                    .get_str("status")
                    .ok()
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or(BackupStatus::Failed);
        backup
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pid, cmdline, start_time, stop_time, status, external_id, is_dryrun
             FROM job ORDER BY start_time",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Job {
                id: row.get(0)?,
                pid: row.get::<_, Option<u32>>(1)?.unwrap_or_default(),
                cmdline: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                start_time: row.get(3)?,
                stop_time: row.get(4)?,
                status: row
                    .get::<_, Option<String>>(5)?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(BackupStatus::Initialized),
                external_id: row.get(6)?,
                is_dryrun: row.get::<_, Option<bool>>(7)?.unwrap_or_default(),
            })
        })?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }
}
