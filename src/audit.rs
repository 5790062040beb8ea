use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::domain::{DatasetId, LayoutKind, Location, SidecarMatch, is_resting_task};
use crate::error::AuditError;
use crate::layout::{FileQuery, LayoutIndex, normalize_extension, open_layout};
use crate::records::{
    DatasetSummaryRecord, DescriptorRecord, EventRecord, ParticipantRecord, PresenceRecord,
    ResultBundle, StepFailure,
};

pub const BASELINE_FILES: [&str; 5] = [
    "CHANGES",
    "README",
    "participants.json",
    "participants.tsv",
    "dataset_description.json",
];
pub const AGGREGATE_FILES: [&str; 2] = ["scans.tsv", "sessions.tsv"];
pub const DEFAULT_SESSION: &str = "01";
pub const DEFAULT_RUN: &str = "1";

const ID_COLUMN: &str = "study_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutFacts {
    pub subjects: Vec<String>,
    pub sessions: Vec<String>,
    pub runs: Vec<String>,
    pub tasks: Vec<String>,
    pub nonrest_tasks: Vec<String>,
}

impl LayoutFacts {
    pub fn from_layout<L: LayoutIndex + ?Sized>(layout: &L) -> Self {
        let tasks = layout.tasks();
        let nonrest_tasks = tasks
            .iter()
            .filter(|task| !is_resting_task(task))
            .cloned()
            .collect();
        Self {
            subjects: layout.subjects(),
            sessions: non_empty_or(layout.sessions(), DEFAULT_SESSION),
            runs: non_empty_or(layout.runs(), DEFAULT_RUN),
            tasks,
            nonrest_tasks,
        }
    }
}

pub fn task_files(task: &str) -> [String; 3] {
    [
        format!("task-{task}_events.json"),
        format!("task-{task}_events.tsv"),
        format!("task-{task}_bold.json"),
    ]
}

pub fn expected_files(nonrest_tasks: &[String]) -> Vec<String> {
    let mut files = BASELINE_FILES
        .iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    for task in nonrest_tasks {
        files.extend(task_files(task));
    }
    files.extend(AGGREGATE_FILES.iter().map(|name| name.to_string()));
    files
}

pub fn build_layout_summary<L: LayoutIndex + ?Sized>(
    layout: &L,
    id: &DatasetId,
) -> Vec<PresenceRecord> {
    let facts = LayoutFacts::from_layout(layout);
    expected_files(&facts.nonrest_tasks)
        .iter()
        .map(|file| {
            let (location, count) = locate(layout, &facts.nonrest_tasks, file);
            PresenceRecord::new(id, file, location, count)
        })
        .collect()
}

fn locate<L: LayoutIndex + ?Sized>(
    layout: &L,
    nonrest_tasks: &[String],
    file: &str,
) -> (Location, usize) {
    let (stem, extension) = file.split_once('.').unwrap_or((file, ""));

    if AGGREGATE_FILES.contains(&file) {
        let found = layout.get(&FileQuery::new().suffix(stem).extension(extension));
        return if found.is_empty() {
            (Location::Missing, 0)
        } else {
            (Location::Lower, found.len())
        };
    }

    if layout.get_file(file).is_some() {
        return (Location::Top, 1);
    }

    let task = file
        .split('_')
        .next()
        .and_then(|token| token.strip_prefix("task-"));
    let task = task.filter(|task| nonrest_tasks.iter().any(|known| known.as_str() == *task));
    if let Some(task) = task {
        let found = layout.get(
            &FileQuery::new()
                .task(task)
                .suffix("events")
                .extension(normalize_extension(extension)),
        );
        return if found.is_empty() {
            (Location::Missing, 0)
        } else {
            (Location::Func, found.len())
        };
    }

    (Location::Missing, 0)
}

pub fn build_dataset_summary<L: LayoutIndex + ?Sized>(
    layout: &L,
    id: &DatasetId,
    kind: LayoutKind,
) -> DatasetSummaryRecord {
    let facts = LayoutFacts::from_layout(layout);
    let per_subject = facts
        .subjects
        .iter()
        .map(|subject| layout.sessions_for_subject(subject).len().max(1))
        .collect::<Vec<_>>();
    let exists = |query: FileQuery| u8::from(!layout.get(&query).is_empty());

    DatasetSummaryRecord {
        study_id: id.clone(),
        root_type: kind,
        num_subs: facts.subjects.len(),
        num_tasks: facts.tasks.len(),
        num_runs: facts.runs.len(),
        num_sessions: facts.sessions.len(),
        max_sessions: per_subject.iter().copied().max().unwrap_or(1),
        min_sessions: per_subject.iter().copied().min().unwrap_or(1),
        nifti_exists: exists(FileQuery::new().extension("nii.gz")),
        dwi_exists: exists(FileQuery::new().suffix("dwi")),
        t1w_exists: exists(FileQuery::new().suffix("T1w")),
        t2w_exists: exists(FileQuery::new().suffix("T2w")),
        bold_exists: exists(FileQuery::new().suffix("bold")),
        tasks: facts.tasks,
        nonrest_tasks: facts.nonrest_tasks,
    }
}

pub fn extract_descriptor<L: LayoutIndex + ?Sized>(
    layout: &L,
    id: &DatasetId,
) -> Result<Vec<DescriptorRecord>, AuditError> {
    let description = layout.dataset_description()?;
    Ok(description
        .into_iter()
        .map(|(key, value)| DescriptorRecord {
            study_id: id.clone(),
            key,
            value: match value {
                Value::String(text) => text,
                other => other.to_string(),
            },
        })
        .collect())
}

pub fn extract_participants<L: LayoutIndex + ?Sized>(
    layout: &L,
    id: &DatasetId,
    sidecar_present: bool,
) -> Result<Vec<ParticipantRecord>, AuditError> {
    let table_path = layout
        .get(&FileQuery::new().suffix("participants").extension("tsv"))
        .into_iter()
        .next()
        .ok_or_else(|| AuditError::MissingArtifact("no participants.tsv file found".to_string()))?;
    let table = Table::read(&table_path)?;

    let sidecar = if sidecar_present {
        let json = layout
            .get(&FileQuery::new().suffix("participants").extension("json"))
            .into_iter()
            .next();
        Some(sidecar_keys(json.as_deref())?)
    } else {
        None
    };

    Ok(table
        .melt()
        .map(|(key, value)| ParticipantRecord {
            study_id: id.clone(),
            partkeys_in_json: tag_key(sidecar.as_ref(), key),
            key: key.to_string(),
            value: value.to_string(),
        })
        .collect())
}

pub fn extract_events<L: LayoutIndex + ?Sized>(
    layout: &L,
    id: &DatasetId,
    task: &str,
    sidecar_present: bool,
) -> Result<Vec<EventRecord>, AuditError> {
    let table_path = layout
        .get(&FileQuery::new().task(task).suffix("events").extension("tsv"))
        .into_iter()
        .next()
        .ok_or_else(|| {
            AuditError::MissingArtifact(format!("no events.tsv file found for task: {task}"))
        })?;
    let table = Table::read(&table_path)?;

    let sidecar = if sidecar_present {
        let json = layout
            .get(&FileQuery::new().task(task).suffix("events").extension("json"))
            .into_iter()
            .next();
        Some(sidecar_keys(json.as_deref())?)
    } else {
        None
    };

    Ok(table
        .melt()
        .map(|(key, value)| EventRecord {
            study_id: id.clone(),
            task: task.to_string(),
            eventkeys_in_json: tag_key(sidecar.as_ref(), key),
            key: key.to_string(),
            value: value.to_string(),
        })
        .collect())
}

pub fn audit_structure(root: &Path, id: &DatasetId) -> Vec<PresenceRecord> {
    match open_layout(root) {
        Ok(layout) => build_layout_summary(&layout, id),
        Err(err) => {
            error!(dataset = %id, error = %err, "layout indexing failed");
            vec![PresenceRecord::sentinel(id, err.kind())]
        }
    }
}

pub fn process_dataset(id: &DatasetId, root: &Path) -> ResultBundle {
    let dataset_root = root.join(id.as_str());
    match open_layout(&dataset_root) {
        Ok(layout) => audit_layout(&layout, id, layout.kind()),
        Err(err) => {
            error!(dataset = %id, error = %err, "layout indexing failed");
            let mut bundle = ResultBundle::new(id.clone());
            bundle
                .presence
                .push(PresenceRecord::sentinel(id, err.kind()));
            bundle.failures.push(StepFailure {
                step: "layout",
                task: None,
                message: err.to_string(),
            });
            bundle
        }
    }
}

pub fn audit_layout<L: LayoutIndex + ?Sized>(
    layout: &L,
    id: &DatasetId,
    kind: LayoutKind,
) -> ResultBundle {
    let mut bundle = ResultBundle::new(id.clone());
    bundle.presence = build_layout_summary(layout, id);
    bundle.summary = Some(build_dataset_summary(layout, id, kind));

    match extract_descriptor(layout, id) {
        Ok(records) => bundle.descriptors = Some(records),
        Err(err) => record_failure(&mut bundle, "descriptor", None, err),
    }

    if is_present(&bundle.presence, "participants.tsv") {
        let sidecar = is_present(&bundle.presence, "participants.json");
        match extract_participants(layout, id, sidecar) {
            Ok(records) => bundle.participants = Some(records),
            Err(err) => record_failure(&mut bundle, "participants", None, err),
        }
    } else {
        debug!(dataset = %id, "participants.tsv absent, skipping participant extraction");
    }

    let facts = LayoutFacts::from_layout(layout);
    for task in &facts.nonrest_tasks {
        let [events_json, events_tsv, _] = task_files(task);
        if !is_present(&bundle.presence, &events_tsv) {
            continue;
        }
        let sidecar = is_present(&bundle.presence, &events_json);
        match extract_events(layout, id, task, sidecar) {
            Ok(records) => bundle.events.extend(records),
            Err(err) => record_failure(&mut bundle, "events", Some(task), err),
        }
    }

    bundle
}

fn is_present(presence: &[PresenceRecord], file: &str) -> bool {
    presence
        .iter()
        .any(|record| record.file.as_deref() == Some(file) && record.presence.is_present())
}

fn record_failure(
    bundle: &mut ResultBundle,
    step: &'static str,
    task: Option<&str>,
    err: AuditError,
) {
    match task {
        Some(task) => {
            warn!(dataset = %bundle.dataset_id, step, task, error = %err, "extraction step failed")
        }
        None => warn!(dataset = %bundle.dataset_id, step, error = %err, "extraction step failed"),
    }
    bundle.failures.push(StepFailure {
        step,
        task: task.map(|task| task.to_string()),
        message: err.to_string(),
    });
}

fn non_empty_or(values: Vec<String>, default: &str) -> Vec<String> {
    if values.is_empty() {
        vec![default.to_string()]
    } else {
        values
    }
}

fn tag_key(sidecar: Option<&BTreeSet<String>>, key: &str) -> SidecarMatch {
    match sidecar {
        Some(keys) if keys.contains(key) => SidecarMatch::Declared,
        Some(_) => SidecarMatch::Undeclared,
        None => SidecarMatch::Unavailable,
    }
}

fn sidecar_keys(path: Option<&Path>) -> Result<BTreeSet<String>, AuditError> {
    let Some(path) = path else {
        return Ok(BTreeSet::new());
    };
    let content = fs::read_to_string(path).map_err(|err| decode_error(path, err))?;
    match serde_json::from_str::<Value>(&content).map_err(|err| decode_error(path, err))? {
        Value::Object(map) => Ok(map.into_iter().map(|(key, _)| key).collect()),
        _ => Err(AuditError::Decode {
            path: path.to_path_buf(),
            message: "sidecar is not a JSON object".to_string(),
        }),
    }
}

fn decode_error(path: &Path, err: impl std::fmt::Display) -> AuditError {
    AuditError::Decode {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read(path: &Path) -> Result<Self, AuditError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|err| decode_error(path, err))?;
        let headers = reader
            .headers()
            .map_err(|err| decode_error(path, err))?
            .iter()
            .map(|header| header.to_string())
            .collect::<Vec<_>>();
        if headers.is_empty() || headers.iter().all(|header| header.is_empty()) {
            return Err(decode_error(path, "no columns to parse from file"));
        }

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|err| decode_error(path, err))?;
            if record.len() > headers.len() {
                return Err(decode_error(
                    path,
                    format!(
                        "expected {} fields in line {}, saw {}",
                        headers.len(),
                        index + 2,
                        record.len()
                    ),
                ));
            }
            let mut row = record
                .iter()
                .map(|value| value.to_string())
                .collect::<Vec<_>>();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        Ok(Self {
            headers,
            rows,
        })
    }

    pub fn melt(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.rows.iter().flat_map(move |row| {
            self.headers
                .iter()
                .zip(row.iter())
                .filter(|(header, _)| header.as_str() != ID_COLUMN)
                .map(|(header, value)| (header.as_str(), value.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use serde_json::Map;

    use super::*;
    use crate::domain::PresenceFlag;

    #[derive(Default)]
    struct FakeLayout {
        files: Vec<(PathBuf, BTreeMap<&'static str, &'static str>, &'static str, &'static str)>,
        top: Vec<&'static str>,
        description: Option<Map<String, Value>>,
    }

    impl FakeLayout {
        fn file(
            mut self,
            path: &str,
            entities: &[(&'static str, &'static str)],
            suffix: &'static str,
            extension: &'static str,
        ) -> Self {
            self.files.push((
                PathBuf::from(path),
                entities.iter().copied().collect(),
                suffix,
                extension,
            ));
            self
        }

        fn values(&self, key: &str) -> Vec<String> {
            self.files
                .iter()
                .filter_map(|(_, entities, _, _)| entities.get(key))
                .map(|value| value.to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }
    }

    impl LayoutIndex for FakeLayout {
        fn subjects(&self) -> Vec<String> {
            self.values("sub")
        }
        fn sessions(&self) -> Vec<String> {
            self.values("ses")
        }
        fn runs(&self) -> Vec<String> {
            self.values("run")
        }
        fn tasks(&self) -> Vec<String> {
            self.values("task")
        }
        fn sessions_for_subject(&self, subject: &str) -> Vec<String> {
            self.files
                .iter()
                .filter(|(_, entities, _, _)| entities.get("sub") == Some(&subject))
                .filter_map(|(_, entities, _, _)| entities.get("ses"))
                .map(|value| value.to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }
        fn get_file(&self, name: &str) -> Option<PathBuf> {
            self.top
                .iter()
                .any(|top| *top == name)
                .then(|| PathBuf::from(name))
        }
        fn get(&self, query: &FileQuery) -> Vec<PathBuf> {
            self.files
                .iter()
                .filter(|(_, entities, suffix, extension)| {
                    query
                        .task
                        .as_deref()
                        .is_none_or(|task| entities.get("task") == Some(&task))
                        && query.suffix.as_deref().is_none_or(|wanted| wanted == *suffix)
                        && query
                            .extension
                            .as_deref()
                            .is_none_or(|wanted| wanted == *extension)
                })
                .map(|(path, _, _, _)| path.clone())
                .collect()
        }
        fn dataset_description(&self) -> Result<Map<String, Value>, AuditError> {
            self.description.clone().ok_or_else(|| {
                AuditError::MissingArtifact("dataset_description.json".to_string())
            })
        }
    }

    fn id() -> DatasetId {
        "ds000001".parse().unwrap()
    }

    #[test]
    fn resting_tasks_get_no_task_rows() {
        let layout = FakeLayout::default()
            .file("a", &[("sub", "01"), ("task", "rest")], "bold", "nii.gz")
            .file("b", &[("sub", "01"), ("task", "nback")], "bold", "nii.gz");
        let rows = build_layout_summary(&layout, &id());
        let files = rows
            .iter()
            .filter_map(|row| row.file.clone())
            .collect::<Vec<_>>();
        assert!(files.contains(&"task-nback_events.tsv".to_string()));
        assert!(!files.iter().any(|file| file.contains("rest")));
        assert_eq!(files.len(), BASELINE_FILES.len() + 3 + AGGREGATE_FILES.len());
    }

    #[test]
    fn classification_order_and_counts() {
        let mut layout = FakeLayout::default()
            .file("s1", &[("sub", "01")], "scans", "tsv")
            .file("s2", &[("sub", "02")], "scans", "tsv")
            .file(
                "e1",
                &[("sub", "01"), ("task", "nback")],
                "events",
                "tsv",
            )
            .file(
                "e2",
                &[("sub", "02"), ("task", "nback")],
                "events",
                "tsv",
            );
        layout.top = vec!["README", "task-nback_events.json"];

        let rows = build_layout_summary(&layout, &id());
        let row = |name: &str| {
            rows.iter()
                .find(|row| row.file.as_deref() == Some(name))
                .unwrap()
                .clone()
        };

        assert_eq!(row("scans.tsv").location, Some(Location::Lower));
        assert_eq!(row("scans.tsv").n_files, Some(2));
        assert_eq!(row("sessions.tsv").location, Some(Location::Missing));
        assert_eq!(row("README").location, Some(Location::Top));
        assert_eq!(row("task-nback_events.json").location, Some(Location::Top));
        assert_eq!(row("task-nback_events.json").n_files, Some(1));
        assert_eq!(row("task-nback_events.tsv").location, Some(Location::Func));
        assert_eq!(row("task-nback_events.tsv").n_files, Some(2));
        assert_eq!(row("CHANGES").presence, PresenceFlag::Absent);

        for row in &rows {
            assert_eq!(
                row.presence == PresenceFlag::Absent,
                row.location == Some(Location::Missing)
            );
        }
    }

    #[test]
    fn summary_defaults_sessions_and_runs() {
        let layout = FakeLayout::default()
            .file("a", &[("sub", "01"), ("task", "nback")], "bold", "nii.gz")
            .file("b", &[("sub", "01")], "T1w", "nii.gz");
        let summary = build_dataset_summary(&layout, &id(), LayoutKind::BidsInput);
        assert_eq!(summary.num_subs, 1);
        assert_eq!(summary.num_sessions, 1);
        assert_eq!(summary.num_runs, 1);
        assert_eq!(summary.min_sessions, 1);
        assert_eq!(summary.max_sessions, 1);
        assert_eq!(summary.bold_exists, 1);
        assert_eq!(summary.t1w_exists, 1);
        assert_eq!(summary.dwi_exists, 0);
        assert_eq!(summary.nifti_exists, 1);
    }

    #[test]
    fn summary_without_subjects_uses_one_session() {
        let layout = FakeLayout::default();
        let summary = build_dataset_summary(&layout, &id(), LayoutKind::BidsDerivative);
        assert_eq!(summary.num_subs, 0);
        assert_eq!(summary.max_sessions, 1);
        assert_eq!(summary.min_sessions, 1);
    }

    #[test]
    fn missing_description_is_missing_artifact() {
        let layout = FakeLayout::default();
        assert_matches!(
            extract_descriptor(&layout, &id()),
            Err(AuditError::MissingArtifact(_))
        );
    }

    #[test]
    fn missing_participants_table_is_missing_artifact() {
        let layout = FakeLayout::default();
        assert_matches!(
            extract_participants(&layout, &id(), false),
            Err(AuditError::MissingArtifact(_))
        );
    }

    #[test]
    fn failed_descriptor_step_does_not_abort_bundle() {
        let layout = FakeLayout::default()
            .file("a", &[("sub", "01"), ("task", "nback")], "bold", "nii.gz");
        let bundle = audit_layout(&layout, &id(), LayoutKind::BidsInput);
        assert!(bundle.summary.is_some());
        assert!(bundle.descriptors.is_none());
        assert_eq!(bundle.failures.len(), 1);
        assert_eq!(bundle.failures[0].step, "descriptor");
    }

    #[test]
    fn table_melt_skips_id_column_and_pads_short_rows() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("participants.tsv");
        fs::write(&path, "participant_id\tstudy_id\tage\nsub-01\tx\t31\nsub-02\tx\n").unwrap();

        let table = Table::read(&path).unwrap();
        let melted = table.melt().collect::<Vec<_>>();
        assert_eq!(
            melted,
            vec![
                ("participant_id", "sub-01"),
                ("age", "31"),
                ("participant_id", "sub-02"),
                ("age", ""),
            ]
        );
    }

    #[test]
    fn table_with_extra_fields_is_decode_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("events.tsv");
        fs::write(&path, "onset\tduration\n1\t2\t3\n").unwrap();
        assert_matches!(Table::read(&path), Err(AuditError::Decode { .. }));
    }

    #[test]
    fn table_with_invalid_utf8_is_decode_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("participants.tsv");
        fs::write(&path, b"participant_id\tsex\nsub-01\t\xff\xfe\n").unwrap();
        assert_matches!(Table::read(&path), Err(AuditError::Decode { .. }));
    }
}
