use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::AuditError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized != "."
            && normalized != ".."
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(AuditError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotTag {
    pub dataset: DatasetId,
    pub tag: String,
}

impl fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.tag)
    }
}

impl FromStr for SnapshotTag {
    type Err = AuditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (dataset, tag) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| AuditError::InvalidSnapshot(value.to_string()))?;
        if tag.is_empty() || tag.contains(':') {
            return Err(AuditError::InvalidSnapshot(value.to_string()));
        }
        Ok(Self {
            dataset: dataset.parse()?,
            tag: tag.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    BidsInput,
    BidsDerivative,
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutKind::BidsInput => write!(f, "bids_input"),
            LayoutKind::BidsDerivative => write!(f, "bids_derivative"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Top,
    Func,
    Lower,
    Missing,
}

impl Location {
    pub fn presence(self) -> PresenceFlag {
        match self {
            Location::Missing => PresenceFlag::Absent,
            Location::Top | Location::Func | Location::Lower => PresenceFlag::Present,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutErrorKind {
    Conflict,
    Validation,
}

impl LayoutErrorKind {
    pub fn token(self) -> &'static str {
        match self {
            LayoutErrorKind::Conflict => "bids_conflict_error",
            LayoutErrorKind::Validation => "bids_validation_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceFlag {
    Present,
    Absent,
    Error(LayoutErrorKind),
}

impl PresenceFlag {
    pub fn is_present(self) -> bool {
        matches!(self, PresenceFlag::Present)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PresenceFlag::Present => "1",
            PresenceFlag::Absent => "0",
            PresenceFlag::Error(kind) => kind.token(),
        }
    }
}

impl Serialize for PresenceFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SidecarMatch {
    Declared,
    Undeclared,
    Unavailable,
}

impl SidecarMatch {
    pub fn as_str(self) -> &'static str {
        match self {
            SidecarMatch::Declared => "1",
            SidecarMatch::Undeclared => "0",
            SidecarMatch::Unavailable => "json_notavailable",
        }
    }
}

impl Serialize for SidecarMatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub fn is_resting_task(task: &str) -> bool {
    task.to_ascii_lowercase().starts_with("rest")
}
