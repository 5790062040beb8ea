use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::domain::DatasetId;
use crate::error::AuditError;

pub fn count_files_capped(root: &Path, ceiling: usize) -> usize {
    let mut count = 0usize;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
        .filter_map(|entry| entry.ok())
    {
        if entry.file_type().is_dir() {
            continue;
        }
        count += 1;
        if count > ceiling {
            break;
        }
    }
    count
}

pub fn remove_dir_if_exists(path: &Path) -> Result<bool, AuditError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AuditError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

pub fn list_dataset_dirs(root: &Path) -> Result<Vec<DatasetId>, AuditError> {
    let entries = fs::read_dir(root).map_err(|err| {
        AuditError::InvalidInput(format!("cannot read dataset directory {}: {err}", root.display()))
    })?;
    let mut ids = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(|name| name.to_string()))
        .filter(|name| name.starts_with("ds"))
        .filter_map(|name| name.parse::<DatasetId>().ok())
        .collect::<Vec<_>>();
    ids.sort();
    Ok(ids)
}
