use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, USER_AGENT};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ApiKey;
use crate::domain::{DatasetId, SnapshotTag};
use crate::error::AuditError;

pub const PAGE_SIZE: usize = 25;

const DATASETS_QUERY: &str = "query datasetPage($first: Int!, $after: String) { datasets(first: $first, after: $after) { edges { cursor node { id } } } }";
const SNAPSHOTS_QUERY: &str =
    "query datasetSnapshots($id: ID!) { dataset(id: $id) { snapshots { id } } }";
const FILES_QUERY: &str = "query snapshotFiles($datasetId: ID!, $tag: String!) { snapshot(datasetId: $datasetId, tag: $tag) { files { id key filename size directory annexed urls } } }";
const DESCRIPTION_QUERY: &str = "query snapshotDescription($datasetId: ID!, $tag: String!) { snapshot(datasetId: $datasetId, tag: $tag) { id description { Name Funding Acknowledgements } } }";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFile {
    pub filename: String,
    pub urls: Vec<String>,
    pub size: Option<u64>,
    pub directory: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotDescription {
    pub snapshot: String,
    pub name: Option<String>,
    pub funding: Vec<String>,
    pub acknowledgements: Option<String>,
}

pub trait CatalogClient: Send + Sync {
    fn dataset_ids(&self) -> Result<Vec<DatasetId>, AuditError>;
    fn snapshots(&self, id: &DatasetId) -> Result<Vec<SnapshotTag>, AuditError>;
    fn snapshot_files(&self, snapshot: &SnapshotTag) -> Result<Vec<SnapshotFile>, AuditError>;
    fn snapshot_description(
        &self,
        snapshot: &SnapshotTag,
    ) -> Result<SnapshotDescription, AuditError>;
    fn download_file(&self, url: &str, destination: &Path) -> Result<(), AuditError>;

    fn latest_snapshot(&self, id: &DatasetId) -> Result<SnapshotTag, AuditError> {
        self.snapshots(id)?
            .pop()
            .ok_or_else(|| AuditError::InvalidSnapshot(format!("no snapshots for {id}")))
    }
}

#[derive(Clone)]
pub struct GraphqlCatalogClient {
    client: Client,
    endpoint: String,
}

impl GraphqlCatalogClient {
    pub fn new(endpoint: &str, api_key: Option<&ApiKey>) -> Result<Self, AuditError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("on-audit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AuditError::CatalogHttp(err.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ORIGIN, HeaderValue::from_static("https://openneuro.org"));
        if let Some(key) = api_key {
            let mut value = HeaderValue::from_str(key.as_str())
                .map_err(|err| AuditError::MissingCredentials(err.to_string()))?;
            value.set_sensitive(true);
            headers.insert("accessToken", value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| AuditError::CatalogHttp(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    fn query(&self, query: &str, variables: Value) -> Result<Value, AuditError> {
        let body = json!({ "query": query, "variables": variables });
        let response = self.send_with_retries(|| self.client.post(&self.endpoint).json(&body))?;
        let response = Self::handle_status(response)?;
        let payload: Value = response
            .json()
            .map_err(|err| AuditError::CatalogResponse(err.to_string()))?;
        graphql_data(payload)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, AuditError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(AuditError::CatalogStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, AuditError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 250;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        debug!(status, attempt, "retrying catalog request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        debug!(error = %err, attempt, "retrying catalog request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(AuditError::CatalogHttp(err.to_string()));
                }
            }
        }
    }
}

impl CatalogClient for GraphqlCatalogClient {
    fn dataset_ids(&self) -> Result<Vec<DatasetId>, AuditError> {
        let mut ids = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let data = self.query(
                DATASETS_QUERY,
                json!({ "first": PAGE_SIZE, "after": after }),
            )?;
            let page = parse_dataset_page(&data)?;
            let edge_count = page.ids.len();
            ids.extend(page.ids);
            debug!(page_size = edge_count, total = ids.len(), "catalog page");
            if edge_count < PAGE_SIZE {
                break;
            }
            match page.next_cursor {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }
        Ok(ids)
    }

    fn snapshots(&self, id: &DatasetId) -> Result<Vec<SnapshotTag>, AuditError> {
        let data = self.query(SNAPSHOTS_QUERY, json!({ "id": id.as_str() }))?;
        parse_snapshots(&data)
    }

    fn snapshot_files(&self, snapshot: &SnapshotTag) -> Result<Vec<SnapshotFile>, AuditError> {
        let data = self.query(
            FILES_QUERY,
            json!({ "datasetId": snapshot.dataset.as_str(), "tag": snapshot.tag }),
        )?;
        parse_snapshot_files(&data)
    }

    fn snapshot_description(
        &self,
        snapshot: &SnapshotTag,
    ) -> Result<SnapshotDescription, AuditError> {
        let data = self.query(
            DESCRIPTION_QUERY,
            json!({ "datasetId": snapshot.dataset.as_str(), "tag": snapshot.tag }),
        )?;
        parse_description(&data)
    }

    fn download_file(&self, url: &str, destination: &Path) -> Result<(), AuditError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let mut response = Self::handle_status(response)?;
        let mut file =
            File::create(destination).map_err(|err| AuditError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| AuditError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPage {
    pub ids: Vec<DatasetId>,
    pub next_cursor: Option<String>,
}

pub fn graphql_data(payload: Value) -> Result<Value, AuditError> {
    if let Some(errors) = payload.get("errors").and_then(|value| value.as_array()) {
        if !errors.is_empty() {
            let message = errors
                .iter()
                .filter_map(|err| err.get("message").and_then(|value| value.as_str()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AuditError::CatalogResponse(message));
        }
    }
    match payload {
        Value::Object(mut map) => map
            .remove("data")
            .filter(|data| !data.is_null())
            .ok_or_else(|| AuditError::CatalogResponse("response has no data".to_string())),
        _ => Err(AuditError::CatalogResponse(
            "response is not an object".to_string(),
        )),
    }
}

pub fn parse_dataset_page(data: &Value) -> Result<DatasetPage, AuditError> {
    let edges = data
        .get("datasets")
        .and_then(|value| value.get("edges"))
        .and_then(|value| value.as_array())
        .ok_or_else(|| AuditError::CatalogResponse("datasets.edges missing".to_string()))?;

    let ids = edges
        .iter()
        .filter_map(|edge| edge.get("node"))
        .filter_map(|node| node.get("id"))
        .filter_map(|id| id.as_str())
        .map(str::parse)
        .collect::<Result<Vec<DatasetId>, _>>()?;
    let next_cursor = edges
        .last()
        .and_then(|edge| edge.get("cursor"))
        .and_then(|cursor| cursor.as_str())
        .map(|cursor| cursor.to_string());

    Ok(DatasetPage { ids, next_cursor })
}

pub fn parse_snapshots(data: &Value) -> Result<Vec<SnapshotTag>, AuditError> {
    let dataset = data
        .get("dataset")
        .filter(|value| !value.is_null())
        .ok_or_else(|| AuditError::CatalogResponse("dataset not found".to_string()))?;
    let Some(snapshots) = dataset.get("snapshots").and_then(|value| value.as_array()) else {
        return Ok(Vec::new());
    };
    snapshots
        .iter()
        .filter_map(|snapshot| snapshot.get("id").and_then(|id| id.as_str()))
        .map(str::parse)
        .collect()
}

pub fn parse_snapshot_files(data: &Value) -> Result<Vec<SnapshotFile>, AuditError> {
    let snapshot = data
        .get("snapshot")
        .and_then(|value| value.as_object())
        .ok_or_else(|| AuditError::CatalogResponse("'snapshot' is not an object".to_string()))?;
    let files = match snapshot.get("files") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(files)) => files,
        Some(_) => {
            return Err(AuditError::CatalogResponse(
                "'files' is not a list".to_string(),
            ));
        }
    };

    Ok(files
        .iter()
        .filter_map(|file| file.as_object())
        .filter_map(|file| {
            let filename = file.get("filename")?.as_str()?.to_string();
            let urls = file
                .get("urls")
                .and_then(|value| value.as_array())
                .map(|urls| {
                    urls.iter()
                        .filter_map(|url| url.as_str())
                        .map(|url| url.to_string())
                        .collect()
                })
                .unwrap_or_default();
            Some(SnapshotFile {
                filename,
                urls,
                size: file.get("size").and_then(|value| value.as_u64()),
                directory: file
                    .get("directory")
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false),
            })
        })
        .collect())
}

pub fn parse_description(data: &Value) -> Result<SnapshotDescription, AuditError> {
    let snapshot = data
        .get("snapshot")
        .filter(|value| !value.is_null())
        .ok_or_else(|| AuditError::CatalogResponse("snapshot not found".to_string()))?;
    let description = snapshot.get("description");
    let text = |key: &str| {
        description
            .and_then(|value| value.get(key))
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
    };
    let funding = match description.and_then(|value| value.get("Funding")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|item| item.to_string())
            .collect(),
        Some(Value::String(item)) => vec![item.clone()],
        _ => Vec::new(),
    };

    Ok(SnapshotDescription {
        snapshot: snapshot
            .get("id")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string(),
        name: text("Name"),
        funding,
        acknowledgements: text("Acknowledgements"),
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
