use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::domain::DatasetId;
use crate::error::AuditError;
use crate::store::TableKind;

pub const RUNLIST_FILE: &str = "datasets_torun.tsv";
pub const FILE_TYPE_PRESENCE_FILE: &str = "file_type_presence.csv";
pub const PARTICIPANT_KEY_FILE: &str = "participant_key_frequency.csv";
pub const EVENT_KEY_FILE: &str = "event_key_frequency.csv";

#[derive(Debug, Deserialize)]
struct PresenceRow {
    study_id: String,
    file: String,
    presence: String,
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    study_id: String,
    key: String,
    #[serde(default, rename = "partkeys_in_json", alias = "eventkeys_in_json")]
    in_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileTypePresence {
    pub file: String,
    pub datasets: usize,
    pub rows: usize,
    pub percent_present: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyFrequency {
    pub key: String,
    pub datasets: usize,
    pub percent_datasets: f64,
    pub percent_declared: Option<f64>,
}

#[derive(Debug, Default)]
struct KeyUsage {
    datasets: BTreeSet<String>,
    with_sidecar: BTreeSet<String>,
    declared: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunlistResult {
    pub path: PathBuf,
    pub catalog: usize,
    pub completed: usize,
    pub pending: Vec<DatasetId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportResult {
    pub datasets: usize,
    pub file_type_presence: PathBuf,
    pub participant_key_frequency: PathBuf,
    pub event_key_frequency: PathBuf,
}

pub fn completed_datasets(out_dir: &Path) -> Result<BTreeSet<DatasetId>, AuditError> {
    let mut completed = BTreeSet::new();
    for path in find_tables(out_dir, TableKind::Presence) {
        for row in read_rows::<PresenceRow>(&path)? {
            if let Ok(id) = row.study_id.parse() {
                completed.insert(id);
            }
        }
    }
    Ok(completed)
}

pub fn pending_datasets(
    catalog_ids: Vec<DatasetId>,
    out_dir: &Path,
) -> Result<Vec<DatasetId>, AuditError> {
    let completed = completed_datasets(out_dir)?;
    Ok(catalog_ids
        .into_iter()
        .filter(|id| !completed.contains(id))
        .collect())
}

pub fn write_runlist(
    catalog_ids: Vec<DatasetId>,
    out_dir: &Path,
) -> Result<RunlistResult, AuditError> {
    let catalog = catalog_ids.len();
    let pending = pending_datasets(catalog_ids, out_dir)?;
    fs::create_dir_all(out_dir).map_err(|err| AuditError::Output(err.to_string()))?;
    let path = out_dir.join(RUNLIST_FILE);
    let mut content = String::new();
    for id in &pending {
        content.push_str(id.as_str());
        content.push('\n');
    }
    fs::write(&path, content).map_err(|err| AuditError::Output(err.to_string()))?;
    info!(pending = pending.len(), catalog, "run list written");
    Ok(RunlistResult {
        path,
        catalog,
        completed: catalog - pending.len(),
        pending,
    })
}

pub fn file_type_presence(out_dir: &Path) -> Result<Vec<FileTypePresence>, AuditError> {
    let task_pattern =
        Regex::new(r"task-[^_]+").map_err(|err| AuditError::Output(err.to_string()))?;
    let mut latest = BTreeMap::<(String, String), bool>::new();
    for path in find_tables(out_dir, TableKind::Presence) {
        for row in read_rows::<PresenceRow>(&path)? {
            let present = match row.presence.as_str() {
                "1" => true,
                "0" => false,
                _ => continue,
            };
            if row.file.is_empty() {
                continue;
            }
            latest.insert((row.study_id, row.file), present);
        }
    }

    let mut grouped = BTreeMap::<String, (BTreeSet<String>, usize, usize)>::new();
    for ((study_id, file), present) in latest {
        let file_type = task_pattern.replace_all(&file, "task-*").into_owned();
        let (datasets, rows, present_rows) = grouped.entry(file_type).or_default();
        datasets.insert(study_id);
        *rows += 1;
        if present {
            *present_rows += 1;
        }
    }
    Ok(grouped
        .into_iter()
        .map(|(file, (datasets, rows, present))| FileTypePresence {
            file,
            datasets: datasets.len(),
            rows,
            percent_present: percent(present, rows),
        })
        .collect())
}

pub fn key_frequency(out_dir: &Path, kind: TableKind) -> Result<Vec<KeyFrequency>, AuditError> {
    let mut usage = BTreeMap::<String, KeyUsage>::new();
    let mut datasets = BTreeSet::<String>::new();
    for path in find_tables(out_dir, kind) {
        for row in read_rows::<KeyRow>(&path)? {
            datasets.insert(row.study_id.clone());
            let entry = usage.entry(row.key).or_default();
            match row.in_json.as_deref() {
                Some("1") => {
                    entry.with_sidecar.insert(row.study_id.clone());
                    entry.declared.insert(row.study_id.clone());
                }
                Some("0") => {
                    entry.with_sidecar.insert(row.study_id.clone());
                }
                _ => {}
            }
            entry.datasets.insert(row.study_id);
        }
    }
    let mut frequencies = usage
        .into_iter()
        .map(|(key, usage)| KeyFrequency {
            key,
            datasets: usage.datasets.len(),
            percent_datasets: percent(usage.datasets.len(), datasets.len()),
            percent_declared: (!usage.with_sidecar.is_empty())
                .then(|| percent(usage.declared.len(), usage.with_sidecar.len())),
        })
        .collect::<Vec<_>>();
    frequencies.sort_by(|a, b| b.datasets.cmp(&a.datasets).then_with(|| a.key.cmp(&b.key)));
    Ok(frequencies)
}

pub fn write_report(out_dir: &Path) -> Result<ReportResult, AuditError> {
    let presence = file_type_presence(out_dir)?;
    let participants = key_frequency(out_dir, TableKind::Participants)?;
    let events = key_frequency(out_dir, TableKind::Events)?;
    let datasets = completed_datasets(out_dir)?.len();

    let result = ReportResult {
        datasets,
        file_type_presence: write_rows(&out_dir.join(FILE_TYPE_PRESENCE_FILE), &presence)?,
        participant_key_frequency: write_rows(&out_dir.join(PARTICIPANT_KEY_FILE), &participants)?,
        event_key_frequency: write_rows(&out_dir.join(EVENT_KEY_FILE), &events)?,
    };
    info!(datasets, "report tables written");
    Ok(result)
}

fn find_tables(out_dir: &Path, kind: TableKind) -> Vec<PathBuf> {
    let suffix = format!("_{}", kind.file_suffix());
    WalkDir::new(out_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(&suffix))
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, AuditError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|err| decode_error(path, err))?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<T>() {
        match row {
            Ok(row) => rows.push(row),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable row"),
        }
    }
    Ok(rows)
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<PathBuf, AuditError> {
    let output_error = |err: csv::Error| AuditError::Output(format!("{}: {err}", path.display()));
    let mut writer = csv::Writer::from_path(path).map_err(output_error)?;
    for row in rows {
        writer.serialize(row).map_err(output_error)?;
    }
    writer
        .flush()
        .map_err(|err| AuditError::Output(format!("{}: {err}", path.display())))?;
    Ok(path.to_path_buf())
}

fn decode_error(path: &Path, err: impl std::fmt::Display) -> AuditError {
    AuditError::Decode {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, text: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }

    #[test]
    fn pending_excludes_completed_ids() {
        let temp = tempfile::tempdir().unwrap();
        write(
            &temp.path().join("final_basics_summary.csv"),
            "study_id,file,location,n_files,presence\nds000001,README,top,1,1\n",
        );
        write(
            &temp.path().join("dataset_output/ds000003_basics_summary.csv"),
            "study_id,file,location,n_files,presence\nds000003,,,,bids_validation_error\n",
        );
        let catalog = ["ds000001", "ds000002", "ds000003"]
            .iter()
            .map(|id| id.parse().unwrap())
            .collect::<Vec<DatasetId>>();

        let result = write_runlist(catalog, temp.path()).unwrap();

        assert_eq!(result.completed, 2);
        let text = fs::read_to_string(temp.path().join(RUNLIST_FILE)).unwrap();
        assert_eq!(text, "ds000002\n");
    }

    #[test]
    fn presence_collapses_task_names_and_ignores_errors() {
        let temp = tempfile::tempdir().unwrap();
        write(
            &temp.path().join("final_basics_summary.csv"),
            "study_id,file,location,n_files,presence\n\
             ds000001,task-nback_events.tsv,func,2,1\n\
             ds000002,task-flanker_events.tsv,missing,0,0\n\
             ds000002,task-nback_events.tsv,func,2,1\n\
             ds000002,README,top,1,1\n\
             ds000003,,,,bids_conflict_error\n",
        );

        let rows = file_type_presence(temp.path()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].file, "README");
        assert_eq!(rows[1].file, "task-*_events.tsv");
        assert_eq!(rows[1].datasets, 2);
        assert_eq!(rows[1].rows, 3);
        assert!((rows[1].percent_present - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn key_frequency_counts_datasets_once() {
        let temp = tempfile::tempdir().unwrap();
        write(
            &temp.path().join("final_participants.csv"),
            "study_id,key,value,partkeys_in_json\n\
             ds000001,age,21,1\n\
             ds000001,age,23,1\n\
             ds000001,sex,F,0\n\
             ds000002,age,30,json_notavailable\n\
             ds000003,age,40,0\n",
        );

        let rows = key_frequency(temp.path(), TableKind::Participants).unwrap();

        assert_eq!(rows[0].key, "age");
        assert_eq!(rows[0].datasets, 3);
        assert!((rows[0].percent_datasets - 100.0).abs() < f64::EPSILON);
        assert_eq!(rows[0].percent_declared, Some(50.0));
        assert_eq!(rows[1].key, "sex");
        assert_eq!(rows[1].datasets, 1);
        assert_eq!(rows[1].percent_declared, Some(0.0));
    }

    #[test]
    fn event_key_declaration_reads_event_tag_column() {
        let temp = tempfile::tempdir().unwrap();
        write(
            &temp.path().join("final_events.csv"),
            "study_id,task,key,value,eventkeys_in_json\n\
             ds000001,nback,onset,0.0,1\n\
             ds000001,nback,trial_type,go,0\n\
             ds000002,flanker,onset,1.0,json_notavailable\n",
        );

        let rows = key_frequency(temp.path(), TableKind::Events).unwrap();

        let onset = rows.iter().find(|row| row.key == "onset").unwrap();
        assert_eq!(onset.datasets, 2);
        assert_eq!(onset.percent_declared, Some(100.0));
        let trial_type = rows.iter().find(|row| row.key == "trial_type").unwrap();
        assert_eq!(trial_type.percent_declared, Some(0.0));
    }

    #[test]
    fn key_without_any_sidecar_has_no_declaration_rate() {
        let temp = tempfile::tempdir().unwrap();
        write(
            &temp.path().join("final_participants.csv"),
            "study_id,key,value,partkeys_in_json\nds000001,group,control,json_notavailable\n",
        );

        let rows = key_frequency(temp.path(), TableKind::Participants).unwrap();

        assert_eq!(rows[0].percent_declared, None);
    }
}
