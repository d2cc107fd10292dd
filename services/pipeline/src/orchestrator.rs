//! Sequences Extract → Transform → Load for one run.
//!
//! Extraction failures are collected per task; only a Load failure ends the
//! run in `Failed`. An empty dataset ends it in `Aborted` without touching the
//! destination store.

use crate::artifact::CanonicalArtifact;
use crate::error::{FetchErrorKind, PipelineError};
use crate::extract::Extractor;
use crate::load::{LoadResult, Loader};
use crate::model::{ReplaceScope, Task};
use crate::staging::StagingArea;
use crate::transform::{TransformStats, Transformer};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Done,
    Aborted,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Extracting => "extracting",
            RunState::Transforming => "transforming",
            RunState::Loading => "loading",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub transient: bool,
    pub cause: String,
}

/// Final status and per-stage counts of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub tasks_total: usize,
    pub tasks_fetched: usize,
    /// Fetched successfully but returned no rows.
    pub tasks_empty: usize,
    pub task_failures: Vec<TaskFailure>,
    pub batches_failed: usize,
    pub rows_produced: usize,
    pub rows_dropped: usize,
    pub rows_loaded: usize,
    pub load_error: Option<String>,
}

impl RunReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            tasks_total: 0,
            tasks_fetched: 0,
            tasks_empty: 0,
            task_failures: Vec::new(),
            batches_failed: 0,
            rows_produced: 0,
            rows_dropped: 0,
            rows_loaded: 0,
            load_error: None,
        }
    }

    fn apply_transform(&mut self, stats: &TransformStats) {
        self.batches_failed = stats.batches_failed;
        self.rows_produced = stats.rows_out;
        self.rows_dropped = stats.rows_dropped();
    }
}

pub struct Orchestrator {
    tasks: Vec<Task>,
    extractor: Extractor,
    staging: Arc<dyn StagingArea>,
    transformer: Transformer,
    artifact: CanonicalArtifact,
    loader: Loader,
}

impl Orchestrator {
    pub fn new(
        tasks: Vec<Task>,
        extractor: Extractor,
        staging: Arc<dyn StagingArea>,
        transformer: Transformer,
        artifact: CanonicalArtifact,
        loader: Loader,
    ) -> Self {
        Self {
            tasks,
            extractor,
            staging,
            transformer,
            artifact,
            loader,
        }
    }

    /// Run every stage. `Err` means the staging area or the artifact could
    /// not be used at all; every other outcome is a terminal state in the
    /// report.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        self.run_stages(run_id)
            .instrument(info_span!("run", %run_id))
            .await
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new(run_id);

        // A run never mixes data with a previous one.
        self.artifact.clear().await?;

        report.state = RunState::Extracting;
        report.tasks_total = self.tasks.len();
        info!(tasks = self.tasks.len(), "extracting");
        let results = self.extractor.extract_fresh(&self.tasks).await?;
        for (task, result) in self.tasks.iter().zip(results) {
            match result {
                Ok(batch) => {
                    report.tasks_fetched += 1;
                    if batch.is_empty() {
                        report.tasks_empty += 1;
                    }
                }
                Err(e) => report.task_failures.push(TaskFailure {
                    task: task.to_string(),
                    transient: e.kind == FetchErrorKind::Transient,
                    cause: e.cause,
                }),
            }
        }

        report.state = RunState::Transforming;
        let output = self
            .transformer
            .transform_to_artifact(self.staging.as_ref(), &self.artifact)
            .await?;
        report.apply_transform(&output.stats);

        if output.dataset.is_empty() {
            warn!("no valid data to load");
            report.state = RunState::Aborted;
            return Ok(report);
        }

        report.state = RunState::Loading;
        match self.loader.load(&output.dataset, &ReplaceScope::Everything).await {
            Ok(LoadResult { rows_loaded, .. }) => {
                report.rows_loaded = rows_loaded;
                report.state = RunState::Done;
            }
            Err(e) => {
                warn!(error = %e, committed = e.committed(), "load failed, a full re-run is required");
                report.rows_loaded = e.committed();
                report.load_error = Some(e.to_string());
                report.state = RunState::Failed;
            }
        }

        info!(
            state = %report.state,
            fetched = report.tasks_fetched,
            failed = report.task_failures.len(),
            produced = report.rows_produced,
            dropped = report.rows_dropped,
            loaded = report.rows_loaded,
            "run finished"
        );
        Ok(report)
    }
}
