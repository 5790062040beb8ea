use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogClient, SnapshotFile};
use crate::domain::DatasetId;
use crate::error::AuditError;

pub const SELECTED_FILES: [&str; 3] = [
    "participants.json",
    "participants.tsv",
    "dataset_description.json",
];
const EVENTS_SIDECAR_SUFFIX: &str = "_events.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneTool {
    Datalad,
    Git,
}

pub trait DatasetFetcher: Send + Sync {
    fn clone_dataset(&self, id: &DatasetId, target: &Path) -> Result<CloneTool, AuditError>;
}

#[derive(Clone)]
pub struct SystemFetcher {
    clone_base_url: String,
    private_sibling: Option<String>,
    datalad: Option<PathBuf>,
    git: Option<PathBuf>,
}

impl SystemFetcher {
    pub fn new(clone_base_url: &str, private_sibling: Option<String>) -> Self {
        Self {
            clone_base_url: clone_base_url.trim_end_matches('/').to_string(),
            private_sibling,
            datalad: find_in_path("datalad"),
            git: find_in_path("git"),
        }
    }

    pub fn clone_url(&self, id: &DatasetId) -> String {
        format!("{}/{}.git", self.clone_base_url, id)
    }

    fn enable_sibling(&self, datalad: &Path, target: &Path, sibling: &str) {
        let args = vec![
            "siblings".to_string(),
            "-d".to_string(),
            target.display().to_string(),
            "enable".to_string(),
            "-s".to_string(),
            sibling.to_string(),
        ];
        if let Err(err) = run_cmd(datalad, &args) {
            warn!(target = %target.display(), sibling, error = %err, "sibling enable failed");
        }
    }
}

impl DatasetFetcher for SystemFetcher {
    fn clone_dataset(&self, id: &DatasetId, target: &Path) -> Result<CloneTool, AuditError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| AuditError::Filesystem(err.to_string()))?;
        }
        let url = self.clone_url(id);
        let args = vec![
            "clone".to_string(),
            url.clone(),
            target.display().to_string(),
        ];
        if let Some(datalad) = &self.datalad {
            info!(dataset = %id, url = %url, "cloning with datalad");
            run_cmd(datalad, &args)?;
            if let Some(sibling) = &self.private_sibling {
                self.enable_sibling(datalad, target, sibling);
            }
            return Ok(CloneTool::Datalad);
        }
        let git = self
            .git
            .as_ref()
            .ok_or_else(|| AuditError::MissingTool("datalad or git".to_string()))?;
        info!(dataset = %id, url = %url, "cloning with git");
        run_cmd(git, &args)?;
        Ok(CloneTool::Git)
    }
}

pub fn is_selected_file(filename: &str) -> bool {
    SELECTED_FILES.contains(&filename) || filename.ends_with(EVENTS_SIDECAR_SUFFIX)
}

pub fn download_selected<C: CatalogClient + ?Sized>(
    catalog: &C,
    id: &DatasetId,
    target: &Path,
) -> Result<Vec<PathBuf>, AuditError> {
    let snapshot = catalog.latest_snapshot(id)?;
    let files = catalog.snapshot_files(&snapshot)?;
    fs::create_dir_all(target).map_err(|err| AuditError::Filesystem(err.to_string()))?;
    let staging = tempfile::Builder::new()
        .prefix(".on-audit-download")
        .tempdir_in(target)
        .map_err(|err| AuditError::Filesystem(err.to_string()))?;

    let mut downloaded = Vec::new();
    for file in files
        .iter()
        .filter(|file| !file.directory && is_selected_file(&file.filename))
    {
        let staged = staging.path().join(&file.filename);
        download_any(catalog, file, &staged)?;
        let destination = target.join(&file.filename);
        fs::rename(&staged, &destination)
            .map_err(|err| AuditError::Filesystem(err.to_string()))?;
        debug!(dataset = %id, file = %file.filename, "downloaded");
        downloaded.push(destination);
    }
    info!(dataset = %id, snapshot = %snapshot, files = downloaded.len(), "selective download finished");
    Ok(downloaded)
}

fn download_any<C: CatalogClient + ?Sized>(
    catalog: &C,
    file: &SnapshotFile,
    destination: &Path,
) -> Result<(), AuditError> {
    let mut last_error = None;
    for url in &file.urls {
        match catalog.download_file(url, destination) {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(file = %file.filename, url = %url, error = %err, "download attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        AuditError::Fetch(format!("no download url for {}", file.filename))
    }))
}

fn run_cmd(program: &Path, args: &[String]) -> Result<(), AuditError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| AuditError::Fetch(err.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("command failed: {}", program.display())
    } else {
        stderr
    };
    Err(AuditError::Fetch(message))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
