use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::DatasetId;
use crate::error::AuditError;

pub const DATASET_OUTPUT_DIR: &str = "dataset_output";
pub const RERUN_DIR: &str = "rerun_details";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Presence,
    Summary,
    Descriptors,
    Participants,
    Events,
}

impl TableKind {
    pub const ALL: [TableKind; 5] = [
        TableKind::Presence,
        TableKind::Summary,
        TableKind::Descriptors,
        TableKind::Participants,
        TableKind::Events,
    ];

    pub fn file_suffix(self) -> &'static str {
        match self {
            TableKind::Presence => "basics_summary.csv",
            TableKind::Summary => "counts_summary.csv",
            TableKind::Descriptors => "descriptors.csv",
            TableKind::Participants => "participants.csv",
            TableKind::Events => "events.csv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    out_root: Utf8PathBuf,
}

impl Store {
    pub fn new(data_root: Utf8PathBuf, out_root: Utf8PathBuf) -> Self {
        Self {
            data_root,
            out_root,
        }
    }

    pub fn from_std(data_root: &std::path::Path, out_root: &std::path::Path) -> Result<Self, AuditError> {
        let data_root = Utf8PathBuf::from_path_buf(data_root.to_path_buf())
            .map_err(|_| AuditError::InvalidInput("non-utf8 dataset directory".to_string()))?;
        let out_root = Utf8PathBuf::from_path_buf(out_root.to_path_buf())
            .map_err(|_| AuditError::InvalidInput("non-utf8 output directory".to_string()))?;
        Ok(Self::new(data_root, out_root))
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn out_root(&self) -> &Utf8Path {
        &self.out_root
    }

    pub fn dataset_dir(&self, id: &DatasetId) -> Utf8PathBuf {
        self.data_root.join(id.as_str())
    }

    pub fn dataset_output_dir(&self) -> Utf8PathBuf {
        self.out_root.join(DATASET_OUTPUT_DIR)
    }

    pub fn rerun_dir(&self) -> Utf8PathBuf {
        self.out_root.join(RERUN_DIR)
    }

    pub fn table_path(dir: &Utf8Path, prefix: &str, kind: TableKind) -> Utf8PathBuf {
        dir.join(format!("{prefix}_{}", kind.file_suffix()))
    }

    pub fn ensure_data_root(&self) -> Result<(), AuditError> {
        fs::create_dir_all(self.data_root.as_std_path())
            .map_err(|err| AuditError::Filesystem(err.to_string()))
    }

    pub fn ensure_out_root(&self) -> Result<(), AuditError> {
        fs::create_dir_all(self.out_root.as_std_path())
            .map_err(|err| AuditError::Filesystem(err.to_string()))
    }

    pub fn require_data_root(&self) -> Result<(), AuditError> {
        if !self.data_root.as_std_path().is_dir() {
            return Err(AuditError::InvalidInput(format!(
                "dataset directory does not exist: {}",
                self.data_root
            )));
        }
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), AuditError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| AuditError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| AuditError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| AuditError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new(Utf8PathBuf::from("/data"), Utf8PathBuf::from("/out"));
        let id: DatasetId = "ds000117".parse().unwrap();

        assert_eq!(store.dataset_dir(&id), Utf8PathBuf::from("/data/ds000117"));
        assert!(store.dataset_output_dir().ends_with("dataset_output"));
        let table = Store::table_path(store.out_root(), "final", TableKind::Presence);
        assert_eq!(table, Utf8PathBuf::from("/out/final_basics_summary.csv"));
        let table = Store::table_path(&store.dataset_output_dir(), id.as_str(), TableKind::Events);
        assert!(table.ends_with("ds000117_events.csv"));
    }
}
