use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use openneuro_audit::audit::{audit_structure, process_dataset};
use openneuro_audit::domain::{DatasetId, LayoutKind, Location, PresenceFlag, SidecarMatch};

fn write(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, text).unwrap();
}

fn nback_dataset(root: &Path, with_participants: bool) {
    write(
        &root.join("dataset_description.json"),
        r#"{"Name": "N-back study", "BIDSVersion": "1.8.0", "Authors": ["A", "B"]}"#,
    );
    write(&root.join("README"), "readme");
    if with_participants {
        write(
            &root.join("participants.tsv"),
            "participant_id\tage\tsex\nsub-01\t21\tF\nsub-02\tn/a\tM\n",
        );
        write(
            &root.join("participants.json"),
            r#"{"age": {"Description": "age"}}"#,
        );
    }
    write(
        &root.join("task-nback_events.tsv"),
        "onset\tduration\ttrial_type\n0.0\t1.5\ttarget\n2.0\t1.5\tlure\n",
    );
    write(
        &root.join("task-nback_events.json"),
        r#"{"onset": {}, "duration": {}}"#,
    );
    write(&root.join("task-nback_bold.json"), r#"{"RepetitionTime": 2}"#);
    for sub in ["01", "02"] {
        write(
            &root.join(format!("sub-{sub}/func/sub-{sub}_task-nback_bold.nii.gz")),
            "",
        );
        write(
            &root.join(format!("sub-{sub}/anat/sub-{sub}_T1w.nii.gz")),
            "",
        );
    }
}

#[test]
fn nback_dataset_with_two_subjects() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000001".parse().unwrap();
    nback_dataset(&temp.path().join(id.as_str()), true);

    let bundle = process_dataset(&id, temp.path());

    let summary = bundle.summary.clone().unwrap();
    assert_eq!(summary.root_type, LayoutKind::BidsInput);
    assert_eq!(summary.num_subs, 2);
    assert_eq!(summary.nonrest_tasks, vec!["nback".to_string()]);
    assert_eq!(summary.num_sessions, 1);
    assert_eq!(summary.num_runs, 1);
    assert_eq!(summary.min_sessions, 1);
    assert_eq!(summary.t1w_exists, 1);
    assert_eq!(summary.bold_exists, 1);
    assert_eq!(summary.dwi_exists, 0);

    let task_rows = bundle
        .presence
        .iter()
        .filter(|row| row.file.as_deref().is_some_and(|file| file.starts_with("task-nback")))
        .collect::<Vec<_>>();
    assert_eq!(task_rows.len(), 3);
    for row in task_rows {
        assert!(matches!(row.location, Some(Location::Func | Location::Top)));
        assert_eq!(row.presence, PresenceFlag::Present);
    }
    assert!(bundle.failures.is_empty());
}

#[test]
fn presence_is_zero_exactly_when_missing() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000001".parse().unwrap();
    nback_dataset(&temp.path().join(id.as_str()), true);

    let bundle = process_dataset(&id, temp.path());

    for row in &bundle.presence {
        let missing = row.location == Some(Location::Missing);
        assert_eq!(row.presence == PresenceFlag::Absent, missing, "{row:?}");
    }
    let changes = bundle
        .presence
        .iter()
        .find(|row| row.file.as_deref() == Some("CHANGES"))
        .unwrap();
    assert_eq!(changes.presence, PresenceFlag::Absent);
}

#[test]
fn missing_participants_table_yields_no_participant_records() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000002".parse().unwrap();
    nback_dataset(&temp.path().join(id.as_str()), false);

    let bundle = process_dataset(&id, temp.path());

    assert!(bundle.participants.is_none());
    let row = bundle
        .presence
        .iter()
        .find(|row| row.file.as_deref() == Some("participants.tsv"))
        .unwrap();
    assert_eq!(row.presence.as_str(), "0");
    assert!(!bundle.events.is_empty());
}

#[test]
fn participant_keys_are_tagged_against_sidecar() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000003".parse().unwrap();
    nback_dataset(&temp.path().join(id.as_str()), true);

    let bundle = process_dataset(&id, temp.path());
    let participants = bundle.participants.unwrap();

    assert_eq!(participants.len(), 6);
    let age = participants.iter().find(|row| row.key == "age").unwrap();
    assert_eq!(age.partkeys_in_json, SidecarMatch::Declared);
    let sex = participants.iter().find(|row| row.key == "sex").unwrap();
    assert_eq!(sex.partkeys_in_json, SidecarMatch::Undeclared);
    assert!(participants.iter().any(|row| row.value == "n/a"));
}

#[test]
fn event_keys_match_table_columns() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000004".parse().unwrap();
    nback_dataset(&temp.path().join(id.as_str()), true);

    let bundle = process_dataset(&id, temp.path());

    let keys = bundle
        .events
        .iter()
        .map(|row| row.key.as_str())
        .collect::<BTreeSet<_>>();
    assert_eq!(keys, BTreeSet::from(["duration", "onset", "trial_type"]));
    assert_eq!(bundle.events.len(), 6);
    assert!(bundle.events.iter().all(|row| row.task == "nback"));
    let trial_type = bundle
        .events
        .iter()
        .find(|row| row.key == "trial_type")
        .unwrap();
    assert_eq!(trial_type.eventkeys_in_json, SidecarMatch::Undeclared);
}

#[test]
fn descriptor_values_keep_strings_and_encode_lists() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000005".parse().unwrap();
    nback_dataset(&temp.path().join(id.as_str()), true);

    let bundle = process_dataset(&id, temp.path());
    let descriptors = bundle.descriptors.unwrap();

    let name = descriptors.iter().find(|row| row.key == "Name").unwrap();
    assert_eq!(name.value, "N-back study");
    let authors = descriptors.iter().find(|row| row.key == "Authors").unwrap();
    assert_eq!(authors.value, r#"["A","B"]"#);
}

#[test]
fn processing_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000006".parse().unwrap();
    nback_dataset(&temp.path().join(id.as_str()), true);

    let first = process_dataset(&id, temp.path());
    let second = process_dataset(&id, temp.path());

    assert_eq!(first, second);
}

#[test]
fn broken_event_table_fails_only_that_task() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000007".parse().unwrap();
    let root = temp.path().join(id.as_str());
    nback_dataset(&root, true);
    write(&root.join("task-flanker_events.tsv"), "");
    write(
        &root.join("sub-01/func/sub-01_task-flanker_bold.nii.gz"),
        "",
    );

    let bundle = process_dataset(&id, temp.path());

    assert_eq!(bundle.failures.len(), 1);
    assert_eq!(bundle.failures[0].step, "events");
    assert_eq!(bundle.failures[0].task.as_deref(), Some("flanker"));
    assert!(bundle.events.iter().all(|row| row.task == "nback"));
    assert!(bundle.participants.is_some());
}

#[test]
fn missing_description_produces_validation_sentinel() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000008".parse().unwrap();
    let root = temp.path().join(id.as_str());
    write(&root.join("sub-01/anat/sub-01_T1w.nii.gz"), "");

    let bundle = process_dataset(&id, temp.path());

    assert!(bundle.layout_failed());
    assert_eq!(bundle.presence.len(), 1);
    assert_eq!(bundle.presence[0].presence.as_str(), "bids_validation_error");
    assert!(bundle.summary.is_none());

    let rows = audit_structure(&root, &id);
    assert_eq!(rows, bundle.presence);
}

#[test]
fn misplaced_subject_file_produces_conflict_sentinel() {
    let temp = tempfile::tempdir().unwrap();
    let id: DatasetId = "ds000009".parse().unwrap();
    let root = temp.path().join(id.as_str());
    nback_dataset(&root, true);
    write(&root.join("sub-01/anat/sub-02_T2w.nii.gz"), "");

    let rows = audit_structure(&root, &id);

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].presence.as_str(), "bids_conflict_error");
}
