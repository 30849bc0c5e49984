use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tokio::task::JoinSet;
use tracing::{info, warn};

use common::store;
use common::task::{gather_temp_file, make_url, map_output_file, map_source_file, reduce_output_file};
use common::{Error, Phase, TaskError, Workload};
use mrl_worker::{blocking, merge, perform_map, perform_reduce, split, MapSummary, Progress, ReduceSummary, StoreRef, Worker};

use crate::plan::{self, JobConfig, Plan};

/// Drives a run over a fixed set of workers.
///
/// The first worker holds the split shards and gathers the final output.
#[derive(Debug, Clone)]
pub struct Coordinator {
    workers: Vec<Worker>,
    config: JobConfig,
    progress: Progress,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub m: usize,
    pub r: usize,
    /// Records in the source store.
    pub records_in: usize,
    pub shard_counts: Vec<usize>,
    pub maps: Vec<MapSummary>,
    pub reduces: Vec<ReduceSummary>,
    /// Records in the target store.
    pub records_out: usize,
}

impl Coordinator {
    pub fn new(workers: Vec<Worker>, config: JobConfig) -> Self {
        Self {
            workers,
            config,
            progress: Progress::default(),
        }
    }

    /// Send every task state transition to `progress`.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Run `workload` over the store at `source` and write the result to a
    /// new store at `target`.
    ///
    /// Map and reduce are separated by a barrier: no reduce task starts
    /// until every map task is done. The first failing task ends the run
    /// and its error is returned.
    pub async fn run(&self, source: &Path, target: &Path, workload: Workload) -> Result<RunReport, TaskError> {
        let split_error = |e| TaskError::new(Phase::Split, 0, e);
        let Some(home) = self.workers.first() else {
            return Err(split_error(Error::Protocol("a run needs at least one worker".into())));
        };

        let source_path = source.to_path_buf();
        let records_in = blocking(move || store::count(source_path)).await.map_err(split_error)?;
        let (m, r) = self.config.task_counts(records_in).map_err(split_error)?;
        let addresses: Vec<String> = self.workers.iter().map(|w| w.address().to_string()).collect();
        let plan = plan::build(m, r, home.address(), &addresses).map_err(split_error)?;
        info!(
            "running over {records_in} records with M={m} R={r} on {} workers",
            self.workers.len()
        );

        let result = self.run_plan(&plan, source, target, workload, records_in).await;
        if let Err(e) = &result {
            warn!("run aborted: {e}");
            self.clean_up(&plan);
        }
        result
    }

    async fn run_plan(
        &self,
        plan: &Plan,
        source: &Path,
        target: &Path,
        workload: Workload,
        records_in: usize,
    ) -> Result<RunReport, TaskError> {
        let home = &self.workers[0];

        let shards: Vec<PathBuf> = (0..plan.m).map(|i| home.path(&map_source_file(i))).collect();
        let source = source.to_path_buf();
        let shard_counts = blocking(move || split(&source, &shards))
            .await
            .map_err(|e| TaskError::new(Phase::Split, 0, e))?;

        let maps = run_phase(
            Phase::Map,
            plan.map_tasks.iter().zip(&plan.map_workers).map(|(task, &w)| {
                let (task, worker, progress) = (task.clone(), self.workers[w].clone(), self.progress.clone());
                async move { perform_map(task, workload, &worker, &progress).await }
            }),
        )
        .await?;
        for i in 0..plan.m {
            home.discard(&map_source_file(i));
        }
        info!("map phase done");

        let reduces = run_phase(
            Phase::Reduce,
            plan.reduce_tasks.iter().zip(&plan.reduce_workers).map(|(task, &w)| {
                let (task, worker, progress) = (task.clone(), self.workers[w].clone(), self.progress.clone());
                async move { perform_reduce(task, workload, &worker, &progress).await }
            }),
        )
        .await?;
        self.discard_map_outputs(plan);
        info!("reduce phase done");

        let sources: Vec<StoreRef> = plan
            .reduce_workers
            .iter()
            .enumerate()
            .map(|(n, &w)| StoreRef::Remote {
                url: make_url(self.workers[w].address(), &reduce_output_file(n)),
                temp: home.path(&gather_temp_file(n)),
            })
            .collect();
        let records_out = merge(home.fetcher(), &sources, target)
            .await
            .map_err(|e| TaskError::new(Phase::Gather, 0, e))?;
        self.discard_reduce_outputs(plan);
        info!("gathered {records_out} records into {}", target.display());

        Ok(RunReport {
            m: plan.m,
            r: plan.r,
            records_in,
            shard_counts,
            maps,
            reduces,
            records_out,
        })
    }

    fn discard_map_outputs(&self, plan: &Plan) {
        for (i, &w) in plan.map_workers.iter().enumerate() {
            for n in 0..plan.r {
                self.workers[w].discard(&map_output_file(i, n));
            }
        }
    }

    fn discard_reduce_outputs(&self, plan: &Plan) {
        for (n, &w) in plan.reduce_workers.iter().enumerate() {
            self.workers[w].discard(&reduce_output_file(n));
        }
    }

    /// Remove every store a run may have left behind.
    fn clean_up(&self, plan: &Plan) {
        for i in 0..plan.m {
            self.workers[0].discard(&map_source_file(i));
        }
        self.discard_map_outputs(plan);
        self.discard_reduce_outputs(plan);
    }
}

/// Run every task of a phase concurrently and wait for all of them.
///
/// Tasks still running when one fails are allowed to finish, so nothing of
/// theirs appears after the caller has cleaned up; the first failure is
/// returned. Summaries come back in task order.
async fn run_phase<T, F, I>(phase: Phase, tasks: I) -> Result<Vec<T>, TaskError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    let mut indices = HashMap::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let handle = set.spawn(task);
        indices.insert(handle.id(), index);
    }

    let mut done: Vec<Option<T>> = (0..indices.len()).map(|_| None).collect();
    let mut failure: Option<TaskError> = None;
    while let Some(joined) = set.join_next_with_id().await {
        let (index, result) = match joined {
            Ok((id, result)) => (indices[&id], result),
            Err(e) => (
                indices[&e.id()],
                Err(Error::UserFunction(anyhow!("task panicked: {e}"))),
            ),
        };
        match result {
            Ok(summary) => done[index] = Some(summary),
            Err(e) if failure.is_none() => failure = Some(TaskError::new(phase, index, e)),
            Err(e) => warn!("{phase} task {index} also failed: {e}"),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(done.into_iter().flatten().collect()),
    }
}
