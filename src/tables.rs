use std::fs::{self, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AuditError;
use crate::records::TableBatch;
use crate::store::{Store, TableKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Append,
    Replace,
}

#[derive(Debug)]
enum Snapshot {
    Missing,
    Length(u64),
    Contents(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct OutputTables {
    dir: Utf8PathBuf,
    prefix: String,
    backup: bool,
}

impl OutputTables {
    pub fn new(dir: impl Into<Utf8PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            backup: false,
        }
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn path(&self, kind: TableKind) -> Utf8PathBuf {
        Store::table_path(&self.dir, &self.prefix, kind)
    }

    pub fn append(&self, batch: &TableBatch) -> Result<usize, AuditError> {
        self.write(batch, WriteMode::Append)
    }

    pub fn replace(&self, batch: &TableBatch) -> Result<usize, AuditError> {
        self.write(batch, WriteMode::Replace)
    }

    fn write(&self, batch: &TableBatch, mode: WriteMode) -> Result<usize, AuditError> {
        fs::create_dir_all(self.dir.as_std_path())
            .map_err(|err| AuditError::Output(format!("create {}: {err}", self.dir)))?;
        let snapshots = TableKind::ALL
            .into_iter()
            .map(|kind| self.snapshot(kind, mode).map(|snapshot| (kind, snapshot)))
            .collect::<Result<Vec<_>, _>>()?;
        match self.write_tables(batch, mode) {
            Ok(written) => {
                info!(dir = %self.dir, prefix = %self.prefix, rows = written, "tables written");
                Ok(written)
            }
            Err(err) => {
                for (kind, snapshot) in snapshots {
                    if let Err(restore_err) = self.restore(kind, snapshot) {
                        warn!(table = ?kind, error = %restore_err, "table rollback failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn write_tables(&self, batch: &TableBatch, mode: WriteMode) -> Result<usize, AuditError> {
        let mut written = 0;
        written += self.write_rows(TableKind::Presence, &batch.presence, mode)?;
        written += self.write_rows(TableKind::Summary, &batch.summaries, mode)?;
        written += self.write_rows(TableKind::Descriptors, &batch.descriptors, mode)?;
        written += self.write_rows(TableKind::Participants, &batch.participants, mode)?;
        written += self.write_rows(TableKind::Events, &batch.events, mode)?;
        Ok(written)
    }

    fn snapshot(&self, kind: TableKind, mode: WriteMode) -> Result<Snapshot, AuditError> {
        let path = self.path(kind);
        if !path.as_std_path().is_file() {
            return Ok(Snapshot::Missing);
        }
        match mode {
            WriteMode::Append => {
                fs::metadata(path.as_std_path()).map(|meta| Snapshot::Length(meta.len()))
            }
            WriteMode::Replace => fs::read(path.as_std_path()).map(Snapshot::Contents),
        }
        .map_err(|err| output_error(&path, err))
    }

    fn restore(&self, kind: TableKind, snapshot: Snapshot) -> Result<(), AuditError> {
        let path = self.path(kind);
        let std_path = path.as_std_path();
        let restored = match snapshot {
            Snapshot::Missing if std_path.is_file() => fs::remove_file(std_path),
            Snapshot::Missing => Ok(()),
            Snapshot::Length(len) => OpenOptions::new()
                .write(true)
                .open(std_path)
                .and_then(|file| file.set_len(len)),
            Snapshot::Contents(bytes) => fs::write(std_path, bytes),
        };
        restored.map_err(|err| output_error(&path, err))
    }

    fn write_rows<T: Serialize>(
        &self,
        kind: TableKind,
        rows: &[T],
        mode: WriteMode,
    ) -> Result<usize, AuditError> {
        let path = self.path(kind);
        let exists = path.as_std_path().is_file();
        if rows.is_empty() {
            if exists && mode == WriteMode::Replace {
                fs::remove_file(path.as_std_path()).map_err(|err| output_error(&path, err))?;
            }
            return Ok(0);
        }
        if exists && self.backup {
            backup_table(&path)?;
        }
        let append = mode == WriteMode::Append && exists;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path.as_std_path())
            .map_err(|err| output_error(&path, err))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(!append)
            .from_writer(file);
        for row in rows {
            writer
                .serialize(row)
                .map_err(|err| output_error(&path, err))?;
        }
        writer.flush().map_err(|err| output_error(&path, err))?;
        debug!(path = %path, rows = rows.len(), append, "table rows written");
        Ok(rows.len())
    }
}

fn backup_table(path: &Utf8Path) -> Result<Utf8PathBuf, AuditError> {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let backup = Utf8PathBuf::from(format!("{path}.{stamp}.bak"));
    fs::copy(path.as_std_path(), backup.as_std_path()).map_err(|err| output_error(path, err))?;
    Ok(backup)
}

fn output_error(path: &Utf8Path, err: impl std::fmt::Display) -> AuditError {
    AuditError::Output(format!("{path}: {err}"))
}
