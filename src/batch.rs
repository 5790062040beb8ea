use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::audit;
use crate::config::ResolvedConfig;
use crate::domain::DatasetId;
use crate::error::AuditError;
use crate::fs_util::count_files_capped;
use crate::records::{ResultBundle, TableBatch};
use crate::tables::OutputTables;

pub trait DatasetProcessor: Send + Sync + 'static {
    fn process(&self, id: &DatasetId) -> Result<ResultBundle, AuditError>;
}

#[derive(Debug, Clone)]
pub struct LayoutAuditor {
    data_root: PathBuf,
}

impl LayoutAuditor {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }
}

impl DatasetProcessor for LayoutAuditor {
    fn process(&self, id: &DatasetId) -> Result<ResultBundle, AuditError> {
        Ok(audit::process_dataset(id, &self.data_root))
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub task_timeout: Duration,
    pub batch_timeout: Duration,
    pub file_ceiling: usize,
    pub resume_after: Option<DatasetId>,
}

impl BatchConfig {
    pub fn from_resolved(config: &ResolvedConfig, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            batch_size: config.batch_size.max(1),
            task_timeout: config.task_timeout,
            batch_timeout: config.batch_timeout,
            file_ceiling: config.file_ceiling,
            resume_after: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Failure,
    TimedOut,
    OutputWrite,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Failure => "failure",
            FailureReason::TimedOut => "timed_out",
            FailureReason::OutputWrite => "output_write",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDataset {
    pub id: DatasetId,
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDataset {
    pub id: DatasetId,
    pub file_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub processed: Vec<DatasetId>,
    pub skipped: Vec<SkippedDataset>,
    pub failed: Vec<FailedDataset>,
    pub incomplete: Vec<DatasetId>,
    pub batches: usize,
}

#[derive(Debug)]
enum TaskState {
    Pending,
    Running { worker: usize, since: Instant },
    Completed(Box<ResultBundle>),
    Failed(String),
    TimedOut,
    Incomplete,
}

impl TaskState {
    fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running { .. })
    }
}

enum WorkerMessage {
    Started {
        slot: usize,
        worker: usize,
    },
    Finished {
        slot: usize,
        outcome: Result<ResultBundle, String>,
    },
}

type WorkQueue = Arc<Mutex<VecDeque<(usize, DatasetId)>>>;

#[derive(Debug, Default)]
struct BatchOutcome {
    completed: Vec<ResultBundle>,
    failed: Vec<FailedDataset>,
    incomplete: Vec<DatasetId>,
}

pub struct BatchOrchestrator<P: DatasetProcessor> {
    processor: Arc<P>,
    tables: OutputTables,
    config: BatchConfig,
    data_root: PathBuf,
}

impl<P: DatasetProcessor> BatchOrchestrator<P> {
    pub fn new(
        processor: P,
        tables: OutputTables,
        config: BatchConfig,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            processor: Arc::new(processor),
            tables,
            config,
            data_root: data_root.into(),
        }
    }

    pub fn run(
        &self,
        ids: Vec<DatasetId>,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, AuditError> {
        let ids = resume_after(ids, self.config.resume_after.as_ref())?;
        let mut report = RunReport::default();
        let mut runnable = Vec::with_capacity(ids.len());
        for id in ids {
            let file_count =
                count_files_capped(&self.data_root.join(id.as_str()), self.config.file_ceiling);
            if file_count > self.config.file_ceiling {
                warn!(dataset = %id, file_count, "dataset exceeds file ceiling, skipping");
                report.skipped.push(SkippedDataset { id, file_count });
            } else {
                runnable.push(id);
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = runnable.len().div_ceil(batch_size);
        let run_start = Instant::now();
        for (index, chunk) in runnable.chunks(batch_size).enumerate() {
            let batch_start = Instant::now();
            sink.event(ProgressEvent {
                message: format!(
                    "batch {}/{}: {} datasets",
                    index + 1,
                    total_batches,
                    chunk.len()
                ),
                elapsed: None,
            });
            let outcome = self.run_batch(chunk);
            let completed_ids = outcome
                .completed
                .iter()
                .map(|bundle| bundle.dataset_id.clone())
                .collect::<Vec<_>>();
            let tables: TableBatch = outcome.completed.into_iter().collect();
            let rows = tables.row_count();
            match self.tables.append(&tables) {
                Ok(_) => report.processed.extend(completed_ids),
                Err(err) => {
                    warn!(batch = index + 1, error = %err, "batch append failed");
                    report
                        .failed
                        .extend(completed_ids.into_iter().map(|id| FailedDataset {
                            id,
                            reason: FailureReason::OutputWrite,
                            message: err.to_string(),
                        }));
                }
            }
            let batch_failed = outcome.failed.len();
            report.failed.extend(outcome.failed);
            report.incomplete.extend(outcome.incomplete);
            report.batches += 1;

            info!(
                batch = index + 1,
                rows,
                failed = batch_failed,
                processed_total = report.processed.len(),
                failed_total = report.failed.len(),
                "batch finished"
            );
            sink.event(ProgressEvent {
                message: format!(
                    "batch {}/{} appended {} rows; {} processed, {} failed so far",
                    index + 1,
                    total_batches,
                    rows,
                    report.processed.len(),
                    report.failed.len()
                ),
                elapsed: Some(batch_start.elapsed()),
            });
        }

        sink.event(ProgressEvent {
            message: format!(
                "run finished: {} processed, {} skipped, {} failed, {} incomplete",
                report.processed.len(),
                report.skipped.len(),
                report.failed.len(),
                report.incomplete.len()
            ),
            elapsed: Some(run_start.elapsed()),
        });
        Ok(report)
    }

    fn run_batch(&self, chunk: &[DatasetId]) -> BatchOutcome {
        if chunk.is_empty() {
            return BatchOutcome::default();
        }
        let queue: WorkQueue = Arc::new(Mutex::new(
            chunk.iter().cloned().enumerate().collect::<VecDeque<_>>(),
        ));
        let mut states = chunk
            .iter()
            .map(|_| TaskState::Pending)
            .collect::<Vec<_>>();
        let (tx, rx) = mpsc::channel();
        let mut retired: Vec<Arc<AtomicBool>> = Vec::new();
        for _ in 0..self.config.workers.clamp(1, chunk.len()) {
            retired.push(self.spawn_worker(retired.len(), &queue, &tx));
        }

        let batch_deadline = Instant::now() + self.config.batch_timeout;
        while !states.iter().all(TaskState::is_terminal) {
            let now = Instant::now();
            if now >= batch_deadline {
                warn!("batch timeout reached, abandoning remaining datasets");
                close_batch(&queue, &mut states, chunk);
                break;
            }
            let wake_at = states
                .iter()
                .filter_map(|state| match state {
                    TaskState::Running { since, .. } => Some(*since + self.config.task_timeout),
                    _ => None,
                })
                .chain(std::iter::once(batch_deadline))
                .min()
                .unwrap_or(batch_deadline);

            match rx.recv_timeout(wake_at.saturating_duration_since(now)) {
                Ok(WorkerMessage::Started { slot, worker }) => {
                    if matches!(states.get(slot), Some(TaskState::Pending)) {
                        states[slot] = TaskState::Running {
                            worker,
                            since: Instant::now(),
                        };
                    }
                }
                Ok(WorkerMessage::Finished { slot, outcome }) => {
                    let Some(state) = states.get_mut(slot) else {
                        continue;
                    };
                    if state.is_terminal() {
                        debug!(dataset = %chunk[slot], "discarding late result");
                        continue;
                    }
                    *state = match outcome {
                        Ok(bundle) => TaskState::Completed(Box::new(bundle)),
                        Err(message) => {
                            warn!(dataset = %chunk[slot], error = %message, "dataset failed");
                            TaskState::Failed(message)
                        }
                    };
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    close_batch(&queue, &mut states, chunk);
                    break;
                }
            }

            let now = Instant::now();
            for slot in 0..states.len() {
                let TaskState::Running { worker, since } = states[slot] else {
                    continue;
                };
                if now.duration_since(since) < self.config.task_timeout {
                    continue;
                }
                warn!(dataset = %chunk[slot], "dataset timed out");
                states[slot] = TaskState::TimedOut;
                if let Some(flag) = retired.get(worker) {
                    flag.store(true, Ordering::SeqCst);
                }
                let replacement = self.spawn_worker(retired.len(), &queue, &tx);
                retired.push(replacement);
            }
        }

        let mut outcome = BatchOutcome::default();
        for (slot, state) in states.into_iter().enumerate() {
            let id = chunk[slot].clone();
            match state {
                TaskState::Completed(bundle) => outcome.completed.push(*bundle),
                TaskState::Failed(message) => outcome.failed.push(FailedDataset {
                    id,
                    reason: FailureReason::Failure,
                    message,
                }),
                TaskState::TimedOut => outcome.failed.push(FailedDataset {
                    id,
                    reason: FailureReason::TimedOut,
                    message: "result not returned in time".to_string(),
                }),
                TaskState::Incomplete | TaskState::Pending => outcome.incomplete.push(id),
                TaskState::Running { .. } => outcome.failed.push(FailedDataset {
                    id,
                    reason: FailureReason::TimedOut,
                    message: "batch closed while running".to_string(),
                }),
            }
        }
        outcome
    }

    fn spawn_worker(
        &self,
        worker: usize,
        queue: &WorkQueue,
        tx: &Sender<WorkerMessage>,
    ) -> Arc<AtomicBool> {
        let retired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&retired);
        let processor = Arc::clone(&self.processor);
        let queue = Arc::clone(queue);
        let tx = tx.clone();
        thread::spawn(move || {
            loop {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                let next = match queue.lock() {
                    Ok(mut queue) => queue.pop_front(),
                    Err(_) => None,
                };
                let Some((slot, id)) = next else {
                    break;
                };
                if tx.send(WorkerMessage::Started { slot, worker }).is_err() {
                    break;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&id)))
                    .map_err(panic_message)
                    .and_then(|result| result.map_err(|err| err.to_string()));
                if tx.send(WorkerMessage::Finished { slot, outcome }).is_err() {
                    break;
                }
            }
        });
        retired
    }
}

pub fn resume_after(
    ids: Vec<DatasetId>,
    marker: Option<&DatasetId>,
) -> Result<Vec<DatasetId>, AuditError> {
    let Some(marker) = marker else {
        return Ok(ids);
    };
    let position = ids
        .iter()
        .position(|id| id == marker)
        .ok_or_else(|| AuditError::ResumeMarkerNotFound(marker.to_string()))?;
    Ok(ids.into_iter().skip(position + 1).collect())
}

fn close_batch(queue: &WorkQueue, states: &mut [TaskState], chunk: &[DatasetId]) {
    let drained = match queue.lock() {
        Ok(mut queue) => queue.drain(..).collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    };
    for (slot, _) in drained {
        if let Some(state) = states.get_mut(slot) {
            *state = TaskState::Incomplete;
        }
    }
    for (slot, state) in states.iter_mut().enumerate() {
        if !state.is_terminal() {
            warn!(dataset = %chunk[slot], "dataset timed out at batch close");
            *state = TaskState::TimedOut;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}
