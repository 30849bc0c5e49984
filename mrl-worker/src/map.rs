//! Map tasks.
//!
//! The map function runs on a blocking thread and hands every emitted
//! record over a bounded channel to the partition stage. The partition
//! stage is the only writer of the partition buffers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{error, info};

use common::store::{self, RecordStore};
use common::task::{make_url, MapState, MapTask, TaskEvent};
use common::{partition, Error, KeyValue, Workload};

use crate::core::{blocking, publish, Progress, Worker};

/// Emitted records in flight between the map and the partition stage.
pub const PARTITION_CHANNEL_CAPACITY: usize = 1024;

/// What a finished map task did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSummary {
    pub n: usize,
    pub records_read: usize,
    pub records_emitted: usize,
    /// Records per reduce partition; always `r` entries.
    pub partition_counts: Vec<usize>,
}

/// Run `task` on `worker`: fetch its shard, map it, and publish one store per
/// reduce partition.
///
/// Nothing is published unless the whole task succeeds.
pub async fn perform_map(
    task: Arc<MapTask>,
    workload: Workload,
    worker: &Worker,
    progress: &Progress,
) -> Result<MapSummary, Error> {
    let mut runner = MapRunner {
        task,
        worker,
        progress,
        state: MapState::Pending,
    };
    runner.enter(MapState::Pending);

    let result = runner.run(workload).await;
    worker.discard(&runner.task.input_name());

    match result {
        Ok(summary) => {
            runner.enter(MapState::Done);
            Ok(summary)
        }
        Err(e) => {
            error!("map task {} failed in {:?}: {e}", runner.task.n, runner.state);
            for r in 0..runner.task.r {
                store::discard(worker.staging_path(&runner.task.output_name(r)));
            }
            runner.enter(MapState::Failed);
            Err(e)
        }
    }
}

struct MapRunner<'a> {
    task: Arc<MapTask>,
    worker: &'a Worker,
    progress: &'a Progress,
    state: MapState,
}

impl MapRunner<'_> {
    fn enter(&mut self, state: MapState) {
        self.state = state;
        self.progress.report(TaskEvent::map(self.task.n, state));
    }

    async fn run(&mut self, workload: Workload) -> Result<MapSummary, Error> {
        let task = self.task.clone();
        if task.r == 0 {
            return Err(Error::Protocol(format!("map task {} has no reduce partitions", task.n)));
        }

        self.enter(MapState::FetchingInput);
        let input = self.worker.path(&task.input_name());
        let url = make_url(&task.source_address, &task.source_name());
        self.worker.fetcher().fetch(&url, &input).await?;

        self.enter(MapState::Mapping);
        let (tx, rx) = mpsc::channel(PARTITION_CHANNEL_CAPACITY);
        let partitioner = tokio::spawn(partition_stage(rx, task.r));
        let records_read = blocking(move || map_stage(&input, workload, tx)).await?;

        self.enter(MapState::Partitioning);
        let buffers = partitioner
            .await
            .map_err(|e| Error::UserFunction(anyhow!("partition stage panicked: {e}")))?;
        let partition_counts: Vec<usize> = buffers.iter().map(Vec::len).collect();
        let records_emitted = partition_counts.iter().sum();

        self.enter(MapState::Publishing);
        let worker = self.worker.clone();
        blocking(move || publish_partitions(&worker, &task, buffers)).await?;

        info!(
            "map task {} read {records_read} records, emitted {records_emitted}",
            self.task.n
        );
        Ok(MapSummary {
            n: self.task.n,
            records_read,
            records_emitted,
            partition_counts,
        })
    }
}

/// Feed every input record to the map function. Returns the number read.
fn map_stage(input: &Path, workload: Workload, tx: mpsc::Sender<KeyValue>) -> Result<usize, Error> {
    let mut emit = |kv: KeyValue| {
        tx.blocking_send(kv)
            .map_err(|_| anyhow!("partition stage stopped accepting records"))
    };

    let mut read = 0;
    for record in store::scan(input)? {
        (workload.map_fn)(record?, &mut emit).map_err(Error::UserFunction)?;
        read += 1;
    }
    Ok(read)
}

/// Route every emitted record into the buffer of its reduce partition.
/// Ends once the map stage drops its sender.
async fn partition_stage(mut rx: mpsc::Receiver<KeyValue>, r: usize) -> Vec<Vec<KeyValue>> {
    let mut buffers = vec![Vec::new(); r];
    while let Some(kv) = rx.recv().await {
        buffers[partition(&kv.key, r)].push(kv);
    }
    buffers
}

/// Write every buffer, empty ones included, to a staged store, then move all
/// of them to their published names at once.
fn publish_partitions(worker: &Worker, task: &MapTask, buffers: Vec<Vec<KeyValue>>) -> Result<(), Error> {
    let names: Vec<String> = (0..task.r).map(|r| task.output_name(r)).collect();
    let staged: Vec<PathBuf> = names.iter().map(|n| worker.staging_path(n)).collect();

    let written = buffers
        .into_iter()
        .zip(&staged)
        .try_for_each(|(buffer, path)| {
            let mut output = RecordStore::create(path)?;
            for kv in &buffer {
                output.insert(kv)?;
            }
            output.close()
        });
    if let Err(e) = written {
        staged.iter().for_each(store::discard);
        return Err(e);
    }

    for (i, (path, name)) in staged.iter().zip(&names).enumerate() {
        if let Err(e) = publish(path, &worker.path(name)) {
            staged.iter().for_each(store::discard);
            names[..i].iter().for_each(|n| worker.discard(n));
            return Err(e);
        }
    }
    Ok(())
}
