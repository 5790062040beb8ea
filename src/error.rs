use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::LayoutErrorKind;

#[derive(Debug, Error, Diagnostic)]
pub enum AuditError {
    #[error("invalid dataset identifier: {0}")]
    InvalidDatasetId(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("missing config file {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing OpenNeuro API key: {0}")]
    #[diagnostic(help("generate a key at openneuro.org and store it in api_key.txt or OPENNEURO_API_KEY"))]
    MissingCredentials(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("resume marker {0} is not in the dataset list")]
    ResumeMarkerNotFound(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("unexpected catalog response: {0}")]
    CatalogResponse(String),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("output table error: {0}")]
    Output(String),
}

#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum LayoutError {
    #[error("conflicting layout metadata: {0}")]
    Conflict(String),

    #[error("layout validation failed: {0}")]
    Validation(String),
}

impl LayoutError {
    pub fn kind(&self) -> LayoutErrorKind {
        match self {
            LayoutError::Conflict(_) => LayoutErrorKind::Conflict,
            LayoutError::Validation(_) => LayoutErrorKind::Validation,
        }
    }
}
