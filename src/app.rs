use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::audit;
use crate::batch::{BatchConfig, BatchOrchestrator, LayoutAuditor, RunReport};
use crate::catalog::{CatalogClient, SnapshotDescription};
use crate::config::{ResolvedConfig, workers_for_cpus};
use crate::domain::DatasetId;
use crate::error::AuditError;
use crate::fetch::{self, CloneTool, DatasetFetcher};
use crate::fs_util;
use crate::records::{StepFailure, TableBatch};
use crate::report::{self, ReportResult, RunlistResult};
use crate::store::Store;
use crate::tables::OutputTables;

#[derive(Debug, Clone, Serialize)]
pub struct IdsResult {
    pub count: usize,
    pub ids: Vec<DatasetId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub id: DatasetId,
    pub snapshots: Vec<String>,
    pub latest: SnapshotDescription,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub select: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub items: Vec<FetchItemResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchItemResult {
    pub id: DatasetId,
    pub action: String,
    pub tool: Option<CloneTool>,
    pub path: String,
    pub files: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditOptions {
    pub no_clone: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditResult {
    pub id: DatasetId,
    pub cloned: Option<CloneTool>,
    pub tables_dir: String,
    pub rows: usize,
    pub layout_failed: bool,
    pub failures: Vec<StepFailure>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub n_cpus: usize,
    pub batch_size: Option<usize>,
    pub resume_after: Option<DatasetId>,
    pub prefix: String,
    pub fetch_missing: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

pub struct App<C: CatalogClient, F: DatasetFetcher> {
    store: Store,
    catalog: C,
    fetcher: F,
    config: ResolvedConfig,
}

impl<C: CatalogClient, F: DatasetFetcher> App<C, F> {
    pub fn new(store: Store, catalog: C, fetcher: F, config: ResolvedConfig) -> Self {
        Self {
            store,
            catalog,
            fetcher,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn ids(&self, sink: &dyn ProgressSink) -> Result<IdsResult, AuditError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; listing catalog datasets".to_string(),
            elapsed: None,
        });
        let start = Instant::now();
        let ids = self.catalog.dataset_ids()?;
        sink.event(ProgressEvent {
            message: format!("catalog.response datasets={}", ids.len()),
            elapsed: Some(start.elapsed()),
        });
        Ok(IdsResult {
            count: ids.len(),
            ids,
        })
    }

    pub fn info(&self, id: &DatasetId, sink: &dyn ProgressSink) -> Result<InfoResult, AuditError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; snapshots for {id}"),
            elapsed: None,
        });
        let snapshots = self.catalog.snapshots(id)?;
        let latest = snapshots
            .last()
            .cloned()
            .ok_or_else(|| AuditError::InvalidSnapshot(format!("no snapshots for {id}")))?;
        let description = self.catalog.snapshot_description(&latest)?;
        Ok(InfoResult {
            id: id.clone(),
            snapshots: snapshots.iter().map(ToString::to_string).collect(),
            latest: description,
        })
    }

    pub fn fetch(
        &self,
        ids: &[DatasetId],
        options: FetchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, AuditError> {
        self.store.ensure_data_root()?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; {id}"),
                elapsed: None,
            });
            let start = Instant::now();
            let target = self.store.dataset_dir(id);
            let mut item = FetchItemResult {
                id: id.clone(),
                action: if options.select { "select" } else { "clone" }.to_string(),
                tool: None,
                path: target.to_string(),
                files: 0,
                error: None,
            };
            let outcome = if options.select {
                fetch::download_selected(&self.catalog, id, target.as_std_path())
                    .map(|files| item.files = files.len())
            } else {
                self.clone_fresh(id).map(|tool| {
                    item.tool = Some(tool);
                    item.files = fs_util::count_files_capped(target.as_std_path(), usize::MAX);
                })
            };
            if let Err(err) = outcome {
                warn!(dataset = %id, step = "fetch", error = %err, "fetch failed");
                item.error = Some(err.to_string());
            }
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; {id} done"),
                elapsed: Some(start.elapsed()),
            });
            items.push(item);
        }
        Ok(FetchResult { items })
    }

    pub fn audit(
        &self,
        id: &DatasetId,
        options: AuditOptions,
        sink: &dyn ProgressSink,
    ) -> Result<AuditResult, AuditError> {
        let cloned = if options.no_clone {
            self.store.require_data_root()?;
            None
        } else {
            self.store.ensure_data_root()?;
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; cloning {id}"),
                elapsed: None,
            });
            Some(self.clone_fresh(id)?)
        };

        sink.event(ProgressEvent {
            message: format!("phase=Audit; processing {id}"),
            elapsed: None,
        });
        let start = Instant::now();
        let bundle = audit::process_dataset(id, self.store.data_root().as_std_path());
        let layout_failed = bundle.layout_failed();
        let failures = bundle.failures.clone();

        let tables_dir = self.store.dataset_output_dir();
        let tables = OutputTables::new(tables_dir.clone(), id.as_str());
        let batch: TableBatch = std::iter::once(bundle).collect();
        let rows = tables.replace(&batch)?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; wrote {rows} rows for {id}"),
            elapsed: Some(start.elapsed()),
        });

        Ok(AuditResult {
            id: id.clone(),
            cloned,
            tables_dir: tables_dir.to_string(),
            rows,
            layout_failed,
            failures,
        })
    }

    pub fn run(&self, options: RunOptions, sink: &dyn ProgressSink) -> Result<RunReport, AuditError> {
        if options.fetch_missing {
            self.store.ensure_data_root()?;
            self.fetch_missing(sink)?;
        } else {
            self.store.require_data_root()?;
        }
        self.store.ensure_out_root()?;

        let ids = fs_util::list_dataset_dirs(self.store.data_root().as_std_path())?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} local datasets", ids.len()),
            elapsed: None,
        });

        let mut config = BatchConfig::from_resolved(&self.config, workers_for_cpus(options.n_cpus));
        if let Some(batch_size) = options.batch_size {
            if batch_size == 0 {
                return Err(AuditError::InvalidInput("batch size must be at least 1".to_string()));
            }
            config.batch_size = batch_size;
        }
        config.resume_after = options.resume_after;

        let tables = OutputTables::new(self.store.out_root().to_owned(), options.prefix.clone())
            .with_backup(self.config.backup_before_append);
        let orchestrator = BatchOrchestrator::new(
            LayoutAuditor::new(self.store.data_root().as_std_path()),
            tables,
            config,
            self.store.data_root().as_std_path(),
        );
        let report = orchestrator.run(ids, sink)?;
        self.write_rerun_list(&options.prefix, &report)?;
        Ok(report)
    }

    fn write_rerun_list(&self, prefix: &str, report: &RunReport) -> Result<(), AuditError> {
        let mut content = String::from("study_id\treason\n");
        for failed in &report.failed {
            content.push_str(&format!("{}\t{}\n", failed.id, failed.reason.as_str()));
        }
        for id in &report.incomplete {
            content.push_str(&format!("{id}\tincomplete\n"));
        }
        for skipped in &report.skipped {
            content.push_str(&format!("{}\tskipped\n", skipped.id));
        }
        let path = self.store.rerun_dir().join(format!("{prefix}_rerun.tsv"));
        Store::write_bytes_atomic(&path, content.as_bytes())?;
        info!(path = %path, "rerun list written");
        Ok(())
    }

    pub fn runlist(&self, sink: &dyn ProgressSink) -> Result<RunlistResult, AuditError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; listing catalog datasets".to_string(),
            elapsed: None,
        });
        let ids = self.catalog.dataset_ids()?;
        report::write_runlist(ids, self.store.out_root().as_std_path())
    }

    pub fn report(&self, sink: &dyn ProgressSink) -> Result<ReportResult, AuditError> {
        sink.event(ProgressEvent {
            message: "phase=Report; aggregating output tables".to_string(),
            elapsed: None,
        });
        report::write_report(self.store.out_root().as_std_path())
    }

    fn clone_fresh(&self, id: &DatasetId) -> Result<CloneTool, AuditError> {
        let target = self.store.dataset_dir(id);
        if fs_util::remove_dir_if_exists(target.as_std_path())? {
            info!(dataset = %id, "removed existing local copy");
        }
        self.fetcher.clone_dataset(id, target.as_std_path())
    }

    fn fetch_missing(&self, sink: &dyn ProgressSink) -> Result<Vec<DatasetId>, AuditError> {
        let local = fs_util::list_dataset_dirs(self.store.data_root().as_std_path())?;
        let missing = self
            .catalog
            .dataset_ids()?
            .into_iter()
            .filter(|id| !local.contains(id))
            .collect::<Vec<_>>();
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {} datasets missing locally", missing.len()),
            elapsed: None,
        });
        let mut cloned = Vec::new();
        for id in missing {
            let target: PathBuf = self.store.dataset_dir(&id).into();
            match self.fetcher.clone_dataset(&id, &target) {
                Ok(_) => cloned.push(id),
                Err(err) => {
                    warn!(dataset = %id, step = "fetch", error = %err, "clone failed");
                    fs_util::remove_dir_if_exists(&target)?;
                }
            }
        }
        Ok(cloned)
    }
}
