use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};
use uuid::Uuid;

use crate::util::{copy_dir_recursive, ensure_directory, now_utc_string};

const DB_FILENAME: &str = "tracking.sqlite";
const ARTIFACT_DIRNAME: &str = "artifacts";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            other => bail!("unknown run status in tracking store: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment: String,
    pub run_name: String,
    pub status: RunStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub artifact_dir: PathBuf,
}

pub struct TrackingStore {
    root: PathBuf,
    connection: Connection,
}

impl TrackingStore {
    pub fn open(root: &Path) -> Result<Self> {
        ensure_directory(root)?;
        let db_path = root.join(DB_FILENAME);
        let connection = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;

        Ok(Self {
            root: root.to_path_buf(),
            connection,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_experiment(&self, name: &str) -> Result<i64> {
        self.connection
            .execute(
                "INSERT INTO experiments(name, created_at) VALUES(?1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![name, now_utc_string()],
            )
            .with_context(|| format!("failed to register experiment {name}"))?;

        let experiment_id = self.connection.query_row(
            "SELECT experiment_id FROM experiments WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(experiment_id)
    }

    pub fn start_run(&self, experiment: &str, run_name: &str) -> Result<ActiveRun<'_>> {
        let experiment_id = self.ensure_experiment(experiment)?;
        let run_id = Uuid::new_v4().simple().to_string();
        let started_at = now_utc_string();
        let artifact_dir = self.root.join(ARTIFACT_DIRNAME).join(&run_id);

        self.connection
            .execute(
                "INSERT INTO runs(run_id, experiment_id, run_name, status, started_at, artifact_dir)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    experiment_id,
                    run_name,
                    RunStatus::Running.as_str(),
                    started_at,
                    artifact_dir.display().to_string(),
                ],
            )
            .with_context(|| format!("failed to start run {run_name}"))?;

        info!(experiment, run_name, run_id = %run_id, "tracking run started");

        Ok(ActiveRun {
            store: self,
            info: RunInfo {
                run_id,
                experiment: experiment.to_string(),
                run_name: run_name.to_string(),
                status: RunStatus::Running,
                started_at,
                ended_at: None,
                artifact_dir,
            },
            closed: false,
        })
    }

    /// Runs `body` inside a run scope. The run ends FINISHED when `body`
    /// returns `Ok` and FAILED otherwise; a panic is caught by the scope's
    /// `Drop`.
    pub fn scoped_run<T>(
        &self,
        experiment: &str,
        run_name: &str,
        body: impl FnOnce(&ActiveRun<'_>) -> Result<T>,
    ) -> Result<(T, RunInfo)> {
        let run = self.start_run(experiment, run_name)?;

        match body(&run) {
            Ok(value) => {
                let info = run.finish()?;
                Ok((value, info))
            }
            Err(err) => {
                let run_id = run.run_id().to_string();
                if let Err(close_err) = run.fail() {
                    warn!(run_id = %run_id, error = %close_err, "failed to close run as FAILED");
                }
                Err(err)
            }
        }
    }

    pub fn set_run_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO tags(run_id, key, value) VALUES(?1, ?2, ?3)
                 ON CONFLICT(run_id, key) DO UPDATE SET value = excluded.value",
                params![run_id, key, value],
            )
            .with_context(|| format!("failed to set tag {key} on run {run_id}"))?;
        Ok(())
    }

    pub fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>> {
        let row = self
            .connection
            .query_row(
                "SELECT r.run_id, e.name, r.run_name, r.status, r.started_at, r.ended_at,
                        r.artifact_dir
                 FROM runs r JOIN experiments e ON e.experiment_id = r.experiment_id
                 WHERE r.run_id = ?1",
                params![run_id],
                read_run_row,
            )
            .optional()?;

        row.map(into_run_info).transpose()
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunInfo>> {
        let mut statement = self.connection.prepare(
            "SELECT r.run_id, e.name, r.run_name, r.status, r.started_at, r.ended_at, r.artifact_dir
             FROM runs r JOIN experiments e ON e.experiment_id = r.experiment_id
             ORDER BY r.started_at DESC, r.rowid DESC
             LIMIT ?1",
        )?;

        let mut rows = statement.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(into_run_info(read_run_row(row)?)?);
        }

        Ok(out)
    }

    pub fn run_params(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        self.key_values("SELECT key, value FROM params WHERE run_id = ?1 ORDER BY rowid", run_id)
    }

    pub fn run_tags(&self, run_id: &str) -> Result<Vec<(String, String)>> {
        self.key_values("SELECT key, value FROM tags WHERE run_id = ?1 ORDER BY key", run_id)
    }

    pub fn run_metrics(&self, run_id: &str) -> Result<Vec<(String, f64)>> {
        let mut statement = self.connection.prepare(
            "SELECT key, value FROM metrics WHERE run_id = ?1 ORDER BY key, step",
        )?;
        let mut rows = statement.query(params![run_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }

    pub fn run_artifacts(&self, run_id: &str) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT path FROM artifacts WHERE run_id = ?1 ORDER BY rowid")?;
        let mut rows = statement.query(params![run_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn key_values(&self, sql: &str, run_id: &str) -> Result<Vec<(String, String)>> {
        let mut statement = self.connection.prepare(sql)?;
        let mut rows = statement.query(params![run_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> Result<String> {
        let ended_at = now_utc_string();
        let updated = self
            .connection
            .execute(
                "UPDATE runs SET status = ?1, ended_at = ?2 WHERE run_id = ?3",
                params![status.as_str(), ended_at, run_id],
            )
            .with_context(|| format!("failed to close run {run_id}"))?;
        if updated == 0 {
            bail!("run {run_id} not found in tracking store");
        }
        Ok(ended_at)
    }
}

/// An open run. Must be closed through [`ActiveRun::finish`] or
/// [`ActiveRun::fail`]; dropping it unclosed records FAILED.
pub struct ActiveRun<'a> {
    store: &'a TrackingStore,
    info: RunInfo,
    closed: bool,
}

impl ActiveRun<'_> {
    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn log_param(&self, key: &str, value: &str) -> Result<()> {
        let connection = &self.store.connection;
        connection.execute(
            "INSERT INTO params(run_id, key, value) VALUES(?1, ?2, ?3)
             ON CONFLICT(run_id, key) DO NOTHING",
            params![self.info.run_id, key, value],
        )?;

        let stored: String = connection.query_row(
            "SELECT value FROM params WHERE run_id = ?1 AND key = ?2",
            params![self.info.run_id, key],
            |row| row.get(0),
        )?;
        if stored != value {
            bail!(
                "param {key} already logged for run {} with value {stored:?}, refusing {value:?}",
                self.info.run_id
            );
        }

        Ok(())
    }

    pub fn log_params(&self, pairs: &[(String, String)]) -> Result<()> {
        for (key, value) in pairs {
            self.log_param(key, value)?;
        }
        info!(run_id = %self.info.run_id, count = pairs.len(), "logged params");
        Ok(())
    }

    pub fn log_metric(&self, key: &str, value: f64) -> Result<()> {
        let connection = &self.store.connection;
        let step: i64 = connection.query_row(
            "SELECT COUNT(*) FROM metrics WHERE run_id = ?1 AND key = ?2",
            params![self.info.run_id, key],
            |row| row.get(0),
        )?;
        connection
            .execute(
                "INSERT INTO metrics(run_id, key, value, step, logged_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![self.info.run_id, key, value, step, now_utc_string()],
            )
            .with_context(|| format!("failed to log metric {key}"))?;
        Ok(())
    }

    pub fn log_metrics<'m>(
        &self,
        metrics: impl IntoIterator<Item = (&'m String, &'m f64)>,
    ) -> Result<usize> {
        let mut count = 0;
        for (key, value) in metrics {
            self.log_metric(key, *value)?;
            count += 1;
        }
        info!(run_id = %self.info.run_id, count, "logged metrics");
        Ok(count)
    }

    pub fn set_tag(&self, key: &str, value: &str) -> Result<()> {
        self.store.set_run_tag(&self.info.run_id, key, value)
    }

    pub fn log_artifact(&self, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .with_context(|| format!("artifact path has no file name: {}", path.display()))?;
        let destination = self.info.artifact_dir.join(name);
        ensure_directory(&self.info.artifact_dir)?;

        let kind = if path.is_dir() {
            copy_dir_recursive(path, &destination)?;
            "dir"
        } else if path.is_file() {
            fs::copy(path, &destination).with_context(|| {
                format!(
                    "failed to copy artifact {} to {}",
                    path.display(),
                    destination.display()
                )
            })?;
            "file"
        } else {
            bail!("artifact does not exist: {}", path.display());
        };

        let relative = name.to_string_lossy().into_owned();
        self.store
            .connection
            .execute(
                "INSERT INTO artifacts(run_id, path, kind, source, logged_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id, path) DO UPDATE SET kind = excluded.kind,
                   source = excluded.source, logged_at = excluded.logged_at",
                params![
                    self.info.run_id,
                    relative,
                    kind,
                    path.display().to_string(),
                    now_utc_string()
                ],
            )
            .with_context(|| format!("failed to record artifact {}", path.display()))?;

        info!(run_id = %self.info.run_id, artifact = %relative, kind, "logged artifact");
        Ok(destination)
    }

    pub fn finish(self) -> Result<RunInfo> {
        self.close(RunStatus::Finished)
    }

    pub fn fail(self) -> Result<RunInfo> {
        self.close(RunStatus::Failed)
    }

    fn close(mut self, status: RunStatus) -> Result<RunInfo> {
        // Marked closed up front so a failing UPDATE does not retry from Drop.
        self.closed = true;
        let ended_at = self.store.end_run(&self.info.run_id, status)?;
        info!(run_id = %self.info.run_id, status = status.as_str(), "tracking run closed");

        let mut info = self.info.clone();
        info.status = status;
        info.ended_at = Some(ended_at);
        Ok(info)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(run_id = %self.info.run_id, "run scope dropped while open; marking FAILED");
        if let Err(err) = self.store.end_run(&self.info.run_id, RunStatus::Failed) {
            warn!(run_id = %self.info.run_id, error = %err, "failed to mark dropped run FAILED");
        }
    }
}

type RunRow = (String, String, String, String, String, Option<String>, String);

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_run_info(row: RunRow) -> Result<RunInfo> {
    let (run_id, experiment, run_name, status, started_at, ended_at, artifact_dir) = row;
    Ok(RunInfo {
        run_id,
        experiment,
        run_name,
        status: RunStatus::parse(&status)?,
        started_at,
        ended_at,
        artifact_dir: PathBuf::from(artifact_dir),
    })
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS experiments (
          experiment_id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
          run_id TEXT PRIMARY KEY,
          experiment_id INTEGER NOT NULL,
          run_name TEXT NOT NULL,
          status TEXT NOT NULL,
          started_at TEXT NOT NULL,
          ended_at TEXT,
          artifact_dir TEXT NOT NULL,
          FOREIGN KEY(experiment_id) REFERENCES experiments(experiment_id)
        );

        CREATE TABLE IF NOT EXISTS params (
          run_id TEXT NOT NULL,
          key TEXT NOT NULL,
          value TEXT NOT NULL,
          PRIMARY KEY(run_id, key),
          FOREIGN KEY(run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS metrics (
          run_id TEXT NOT NULL,
          key TEXT NOT NULL,
          value REAL NOT NULL,
          step INTEGER NOT NULL DEFAULT 0,
          logged_at TEXT NOT NULL,
          FOREIGN KEY(run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS tags (
          run_id TEXT NOT NULL,
          key TEXT NOT NULL,
          value TEXT NOT NULL,
          PRIMARY KEY(run_id, key),
          FOREIGN KEY(run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS artifacts (
          run_id TEXT NOT NULL,
          path TEXT NOT NULL,
          kind TEXT NOT NULL,
          source TEXT NOT NULL,
          logged_at TEXT NOT NULL,
          PRIMARY KEY(run_id, path),
          FOREIGN KEY(run_id) REFERENCES runs(run_id)
        );

        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        CREATE INDEX IF NOT EXISTS idx_metrics_run_key ON metrics(run_id, key);
        ",
        )
        .context("failed to create tracking schema")?;
    Ok(())
}
