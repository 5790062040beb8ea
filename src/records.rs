use serde::{Serialize, Serializer};

use crate::domain::{DatasetId, LayoutErrorKind, LayoutKind, Location, PresenceFlag, SidecarMatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub study_id: DatasetId,
    pub file: Option<String>,
    pub location: Option<Location>,
    pub n_files: Option<usize>,
    pub presence: PresenceFlag,
}

impl PresenceRecord {
    pub fn new(study_id: &DatasetId, file: &str, location: Location, n_files: usize) -> Self {
        Self {
            study_id: study_id.clone(),
            file: Some(file.to_string()),
            location: Some(location),
            n_files: Some(n_files),
            presence: location.presence(),
        }
    }

    pub fn sentinel(study_id: &DatasetId, kind: LayoutErrorKind) -> Self {
        Self {
            study_id: study_id.clone(),
            file: None,
            location: None,
            n_files: None,
            presence: PresenceFlag::Error(kind),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.presence, PresenceFlag::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSummaryRecord {
    pub study_id: DatasetId,
    pub root_type: LayoutKind,
    pub num_subs: usize,
    pub num_tasks: usize,
    pub num_runs: usize,
    pub num_sessions: usize,
    pub max_sessions: usize,
    pub min_sessions: usize,
    #[serde(serialize_with = "json_list")]
    pub tasks: Vec<String>,
    #[serde(serialize_with = "json_list")]
    pub nonrest_tasks: Vec<String>,
    pub nifti_exists: u8,
    pub dwi_exists: u8,
    pub t1w_exists: u8,
    pub t2w_exists: u8,
    pub bold_exists: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorRecord {
    pub study_id: DatasetId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantRecord {
    pub study_id: DatasetId,
    pub key: String,
    pub value: String,
    pub partkeys_in_json: SidecarMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub study_id: DatasetId,
    pub task: String,
    pub key: String,
    pub value: String,
    pub eventkeys_in_json: SidecarMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: &'static str,
    pub task: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultBundle {
    pub dataset_id: DatasetId,
    pub presence: Vec<PresenceRecord>,
    pub summary: Option<DatasetSummaryRecord>,
    pub descriptors: Option<Vec<DescriptorRecord>>,
    pub participants: Option<Vec<ParticipantRecord>>,
    pub events: Vec<EventRecord>,
    pub failures: Vec<StepFailure>,
}

impl ResultBundle {
    pub fn new(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id,
            presence: Vec::new(),
            summary: None,
            descriptors: None,
            participants: None,
            events: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn layout_failed(&self) -> bool {
        self.presence.iter().any(PresenceRecord::is_sentinel)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableBatch {
    pub presence: Vec<PresenceRecord>,
    pub summaries: Vec<DatasetSummaryRecord>,
    pub descriptors: Vec<DescriptorRecord>,
    pub participants: Vec<ParticipantRecord>,
    pub events: Vec<EventRecord>,
}

impl TableBatch {
    pub fn push(&mut self, bundle: ResultBundle) {
        self.presence.extend(bundle.presence);
        self.summaries.extend(bundle.summary);
        self.descriptors.extend(bundle.descriptors.unwrap_or_default());
        self.participants
            .extend(bundle.participants.unwrap_or_default());
        self.events.extend(bundle.events);
    }

    pub fn row_count(&self) -> usize {
        self.presence.len()
            + self.summaries.len()
            + self.descriptors.len()
            + self.participants.len()
            + self.events.len()
    }
}

impl FromIterator<ResultBundle> for TableBatch {
    fn from_iter<I: IntoIterator<Item = ResultBundle>>(iter: I) -> Self {
        let mut batch = TableBatch::default();
        for bundle in iter {
            batch.push(bundle);
        }
        batch
    }
}

fn json_list<S: Serializer>(items: &[String], serializer: S) -> Result<S::Ok, S::Error> {
    let text = serde_json::to_string(items).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_row_carries_error_token() {
        let id: DatasetId = "ds000001".parse().unwrap();
        let row = PresenceRecord::sentinel(&id, LayoutErrorKind::Conflict);
        assert!(row.is_sentinel());
        assert_eq!(row.presence.as_str(), "bids_conflict_error");
        assert!(row.file.is_none());
    }

    #[test]
    fn batch_merges_bundles_by_field() {
        let id: DatasetId = "ds000001".parse().unwrap();
        let mut first = ResultBundle::new(id.clone());
        first.presence.push(PresenceRecord::new(&id, "README", Location::Top, 1));
        first.descriptors = Some(vec![DescriptorRecord {
            study_id: id.clone(),
            key: "Name".to_string(),
            value: "x".to_string(),
        }]);
        let mut second = ResultBundle::new("ds000002".parse().unwrap());
        second.presence.push(PresenceRecord::sentinel(
            &second.dataset_id.clone(),
            LayoutErrorKind::Validation,
        ));

        let batch: TableBatch = vec![first, second].into_iter().collect();
        assert_eq!(batch.presence.len(), 2);
        assert_eq!(batch.descriptors.len(), 1);
        assert!(batch.summaries.is_empty());
        assert_eq!(batch.row_count(), 3);
    }
}
