use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::domain::LayoutKind;
use crate::error::{AuditError, LayoutError};

pub const DESCRIPTION_FILE: &str = "dataset_description.json";

const IGNORED_TOP_LEVEL: &[&str] = &["code", "derivatives", "sourcedata", "stimuli", "models"];

pub trait LayoutIndex {
    fn subjects(&self) -> Vec<String>;
    fn sessions(&self) -> Vec<String>;
    fn runs(&self) -> Vec<String>;
    fn tasks(&self) -> Vec<String>;
    fn sessions_for_subject(&self, subject: &str) -> Vec<String>;
    fn get_file(&self, name: &str) -> Option<PathBuf>;
    fn get(&self, query: &FileQuery) -> Vec<PathBuf>;
    fn dataset_description(&self) -> Result<Map<String, Value>, AuditError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileQuery {
    pub task: Option<String>,
    pub suffix: Option<String>,
    pub extension: Option<String>,
}

impl FileQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, value: impl Into<String>) -> Self {
        self.task = Some(value.into());
        self
    }

    pub fn suffix(mut self, value: impl Into<String>) -> Self {
        self.suffix = Some(value.into());
        self
    }

    pub fn extension(mut self, value: impl AsRef<str>) -> Self {
        self.extension = Some(normalize_extension(value.as_ref()));
        self
    }

    fn matches(&self, file: &IndexedFile) -> bool {
        let entity_matches = |key: &str, wanted: &Option<String>| match wanted {
            Some(value) => file.entities.get(key) == Some(value),
            None => true,
        };
        entity_matches("task", &self.task)
            && self
                .suffix
                .as_ref()
                .is_none_or(|suffix| file.suffix.as_ref() == Some(suffix))
            && self
                .extension
                .as_ref()
                .is_none_or(|extension| &file.extension == extension)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub entities: BTreeMap<String, String>,
    pub suffix: Option<String>,
    pub extension: String,
}

#[derive(Debug, Clone)]
struct IndexedFile {
    path: PathBuf,
    relative: PathBuf,
    entities: BTreeMap<String, String>,
    suffix: Option<String>,
    extension: String,
}

#[derive(Debug, Clone)]
pub struct BidsLayout {
    kind: LayoutKind,
    files: Vec<IndexedFile>,
    description: Map<String, Value>,
}

impl BidsLayout {
    pub fn open(root: &Path, kind: LayoutKind) -> Result<Self, LayoutError> {
        if !root.is_dir() {
            return Err(LayoutError::Validation(format!(
                "dataset root {} does not exist",
                root.display()
            )));
        }

        let description = read_description(root)?;
        if kind == LayoutKind::BidsDerivative
            && !description.contains_key("GeneratedBy")
            && !description.contains_key("PipelineDescription")
        {
            return Err(LayoutError::Validation(
                "derivative dataset_description.json has no GeneratedBy or PipelineDescription"
                    .to_string(),
            ));
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_ignored(root, entry.path(), entry.depth()));
        for entry in walker.filter_map(|entry| entry.ok()) {
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                debug!(path = %entry.path().display(), "skipping non-utf8 file name");
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|err| LayoutError::Validation(err.to_string()))?
                .to_path_buf();
            let parsed = parse_filename(name)?;
            check_directory_entities(&relative, &parsed.entities)?;
            if kind == LayoutKind::BidsInput && !is_valid_input_location(&relative, &parsed) {
                debug!(path = %relative.display(), "skipping file outside subject tree");
                continue;
            }
            files.push(IndexedFile {
                path: entry.path().to_path_buf(),
                relative,
                entities: parsed.entities,
                suffix: parsed.suffix,
                extension: parsed.extension,
            });
        }

        debug!(root = %root.display(), files = files.len(), "layout indexed");
        Ok(Self {
            kind,
            files,
            description,
        })
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    fn entity_values(&self, key: &str) -> BTreeSet<String> {
        self.files
            .iter()
            .filter_map(|file| file.entities.get(key))
            .cloned()
            .collect()
    }
}

impl LayoutIndex for BidsLayout {
    fn subjects(&self) -> Vec<String> {
        self.entity_values("sub").into_iter().collect()
    }

    fn sessions(&self) -> Vec<String> {
        self.entity_values("ses").into_iter().collect()
    }

    fn runs(&self) -> Vec<String> {
        self.entity_values("run").into_iter().collect()
    }

    fn tasks(&self) -> Vec<String> {
        self.entity_values("task").into_iter().collect()
    }

    fn sessions_for_subject(&self, subject: &str) -> Vec<String> {
        self.files
            .iter()
            .filter(|file| file.entities.get("sub").map(String::as_str) == Some(subject))
            .filter_map(|file| file.entities.get("ses"))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn get_file(&self, name: &str) -> Option<PathBuf> {
        let wanted = Path::new(name);
        self.files
            .iter()
            .find(|file| file.relative == wanted)
            .map(|file| file.path.clone())
    }

    fn get(&self, query: &FileQuery) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|file| query.matches(file))
            .map(|file| file.path.clone())
            .collect()
    }

    fn dataset_description(&self) -> Result<Map<String, Value>, AuditError> {
        Ok(self.description.clone())
    }
}

pub fn open_layout(root: &Path) -> Result<BidsLayout, LayoutError> {
    let layout = BidsLayout::open(root, LayoutKind::BidsInput)?;
    if !layout.subjects().is_empty() {
        return Ok(layout);
    }
    debug!(root = %root.display(), "no subjects in input layout, retrying as derivative");
    BidsLayout::open(root, LayoutKind::BidsDerivative)
}

pub fn parse_filename(name: &str) -> Result<ParsedName, LayoutError> {
    let (stem, extension) = match name.split_once('.') {
        Some((stem, extension)) => (stem, extension.to_string()),
        None => (name, String::new()),
    };

    let parts = stem.split('_').collect::<Vec<_>>();
    let mut entities = BTreeMap::new();
    let mut suffix = None;
    for (index, part) in parts.iter().enumerate() {
        match part.split_once('-') {
            Some((key, value)) if is_token(key) && is_token(value) => {
                let value = if key == "run" {
                    normalize_run(value)
                } else {
                    value.to_string()
                };
                if let Some(previous) = entities.insert(key.to_string(), value.clone()) {
                    if previous != value {
                        return Err(LayoutError::Conflict(format!(
                            "{name}: entity '{key}' has values '{previous}' and '{value}'"
                        )));
                    }
                }
            }
            _ if index == parts.len() - 1 && is_token(part) => {
                suffix = Some(part.to_string());
            }
            _ => {}
        }
    }

    Ok(ParsedName {
        entities,
        suffix,
        extension,
    })
}

pub fn normalize_extension(value: &str) -> String {
    value.trim_start_matches('.').to_string()
}

fn normalize_run(value: &str) -> String {
    if value.chars().all(|ch| ch.is_ascii_digit()) {
        let trimmed = value.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    } else {
        value.to_string()
    }
}

fn is_token(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_alphanumeric())
}

fn is_ignored(root: &Path, path: &Path, depth: usize) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return true;
    }
    depth == 1 && path.parent() == Some(root) && path.is_dir() && IGNORED_TOP_LEVEL.contains(&name)
}

fn directory_names(relative: &Path) -> Vec<&str> {
    let mut names = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>();
    names.pop();
    names
}

fn check_directory_entities(
    relative: &Path,
    entities: &BTreeMap<String, String>,
) -> Result<(), LayoutError> {
    for dir in directory_names(relative) {
        for key in ["sub", "ses"] {
            let Some(dir_value) = dir.strip_prefix(key).and_then(|rest| rest.strip_prefix('-'))
            else {
                continue;
            };
            if let Some(file_value) = entities.get(key) {
                if file_value != dir_value {
                    return Err(LayoutError::Conflict(format!(
                        "{}: '{key}-{file_value}' is stored under '{dir}'",
                        relative.display()
                    )));
                }
            }
        }
    }
    Ok(())
}

fn is_valid_input_location(relative: &Path, parsed: &ParsedName) -> bool {
    let dirs = directory_names(relative);
    match parsed.entities.get("sub") {
        Some(subject) => dirs.first().is_some_and(|first| {
            first
                .strip_prefix("sub-")
                .is_some_and(|value| value == subject)
        }),
        None => true,
    }
}

fn read_description(root: &Path) -> Result<Map<String, Value>, LayoutError> {
    let path = root.join(DESCRIPTION_FILE);
    let content = fs::read_to_string(&path).map_err(|_| {
        LayoutError::Validation(format!("'{DESCRIPTION_FILE}' is missing from project root"))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|err| {
        LayoutError::Validation(format!("'{DESCRIPTION_FILE}' is not valid JSON: {err}"))
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(LayoutError::Validation(format!(
            "'{DESCRIPTION_FILE}' is not a JSON object"
        ))),
    }
}
