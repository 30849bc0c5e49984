//! Reduce tasks.
//!
//! A reduce task pulls its partition from every map task, merges the
//! pieces, sorts the result by key and value with an external sort, and
//! walks it once: every key change closes a group, and every group is
//! handed to the reduce function exactly once.

use std::iter::Peekable;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use tracing::{error, info};

use common::store::{self, RecordStore};
use common::task::{make_url, map_output_file, ReduceState, ReduceTask, TaskEvent};
use common::{Error, KeyValue, ReduceFn, Workload};

use crate::core::{blocking, publish, Progress, Worker};
use crate::merge::{combine, fetch_sources, StoreRef};

/// What a finished reduce task did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceSummary {
    pub n: usize,
    /// Records merged from all map tasks.
    pub records_in: usize,
    /// Distinct keys, i.e. reduce function calls.
    pub groups: usize,
    pub records_out: usize,
}

/// Totals of a [`reduce_groups`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub groups: usize,
    pub records_out: usize,
}

/// Run `task` on `worker` and publish its output store.
///
/// Nothing is published unless the whole task succeeds.
pub async fn perform_reduce(
    task: Arc<ReduceTask>,
    workload: Workload,
    worker: &Worker,
    progress: &Progress,
) -> Result<ReduceSummary, Error> {
    let runner = Arc::new(ReduceRunner {
        task,
        worker: worker.clone(),
        progress: progress.clone(),
        state: Mutex::new(ReduceState::Pending),
    });
    runner.enter(ReduceState::Pending);

    let result = runner.clone().run(workload).await;
    worker.discard(&runner.task.input_name());

    match result {
        Ok(summary) => {
            runner.enter(ReduceState::Done);
            Ok(summary)
        }
        Err(e) => {
            error!("reduce task {} failed in {:?}: {e}", runner.task.n, runner.state());
            // A panic in the reduce function skips the staged cleanup in `reduce_sorted`.
            store::discard(worker.staging_path(&runner.task.output_name()));
            runner.enter(ReduceState::Failed);
            Err(e)
        }
    }
}

struct ReduceRunner {
    task: Arc<ReduceTask>,
    worker: Worker,
    progress: Progress,
    // Shared with the blocking thread that sorts and reduces.
    state: Mutex<ReduceState>,
}

impl ReduceRunner {
    fn enter(&self, state: ReduceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.progress.report(TaskEvent::reduce(self.task.n, state));
    }

    fn state(&self) -> ReduceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, workload: Workload) -> Result<ReduceSummary, Error> {
        let task = &self.task;
        if task.source_addresses.len() != task.m {
            return Err(Error::Protocol(format!(
                "reduce task {} expects {} map outputs but has {} addresses",
                task.n,
                task.m,
                task.source_addresses.len()
            )));
        }

        self.enter(ReduceState::FetchingInputs);
        let sources: Vec<StoreRef> = task
            .source_addresses
            .iter()
            .enumerate()
            .map(|(m, address)| StoreRef::Remote {
                url: make_url(address, &map_output_file(m, task.n)),
                temp: self.worker.path(&task.temp_name(m)),
            })
            .collect();
        let staged = fetch_sources(self.worker.fetcher(), &sources).await?;

        self.enter(ReduceState::Merging);
        let input = self.worker.path(&task.input_name());
        let records_in = blocking(move || combine(staged, &input)).await?;

        let runner = self.clone();
        let stats = blocking(move || runner.reduce_sorted(workload.reduce_fn)).await?;

        info!(
            "reduce task {} reduced {records_in} records into {} groups",
            task.n, stats.groups
        );
        Ok(ReduceSummary {
            n: task.n,
            records_in,
            groups: stats.groups,
            records_out: stats.records_out,
        })
    }

    /// Sort the merged input, reduce every group into a staged output store
    /// and publish it.
    fn reduce_sorted(&self, reduce_fn: ReduceFn) -> Result<GroupStats, Error> {
        let input = self.worker.path(&self.task.input_name());
        let target = self.worker.path(&self.task.output_name());
        let staged = self.worker.staging_path(&self.task.output_name());

        let result = (|| -> Result<GroupStats, Error> {
            let mut output = RecordStore::create(&staged)?;
            let mut merged = RecordStore::open(&input)?;

            self.enter(ReduceState::Grouping);
            let stats = merged.sorted(self.worker.data_dir(), |records| {
                self.enter(ReduceState::Reducing);
                reduce_groups(records, reduce_fn, &mut |kv| output.insert(&kv))
            })?;

            self.enter(ReduceState::Publishing);
            output.close()?;
            publish(&staged, &target)?;
            Ok(stats)
        })();

        if result.is_err() {
            store::discard(&staged);
        }
        result
    }
}

/// Call `reduce_fn` once per distinct key of `records`, which must arrive
/// ordered by key. Everything emitted goes to `sink`.
///
/// A key smaller than its predecessor is a protocol error.
pub fn reduce_groups<I>(
    records: I,
    reduce_fn: ReduceFn,
    sink: &mut dyn FnMut(KeyValue) -> Result<(), Error>,
) -> Result<GroupStats, Error>
where
    I: Iterator<Item = Result<KeyValue, Error>>,
{
    let mut input = records.peekable();
    let mut stats = GroupStats::default();
    let mut previous: Option<String> = None;

    loop {
        let key = match input.peek() {
            None => break,
            Some(Ok(kv)) => kv.key.clone(),
            Some(Err(_)) => return Err(next_error(&mut input)),
        };
        if let Some(previous) = &previous {
            if key < *previous {
                return Err(Error::Protocol(format!(
                    "key `{key}` arrived after `{previous}`; input is not sorted"
                )));
            }
        }

        let mut read_failure = None;
        let mut sink_failure = None;
        let mut emitted = 0;
        let result = {
            let mut values = Values {
                key: &key,
                input: &mut input,
                failure: &mut read_failure,
            };
            let mut emit = |kv: KeyValue| match sink(kv) {
                Ok(()) => {
                    emitted += 1;
                    Ok(())
                }
                Err(e) => {
                    sink_failure = Some(e);
                    Err(anyhow!("output store rejected record"))
                }
            };
            let result = reduce_fn(&key, &mut values, &mut emit);
            // Skip whatever the reduce function left unread.
            values.for_each(drop);
            result
        };

        if let Some(e) = read_failure.or(sink_failure) {
            return Err(e);
        }
        result.map_err(Error::UserFunction)?;

        stats.groups += 1;
        stats.records_out += emitted;
        previous = Some(key);
    }
    Ok(stats)
}

/// The values of one group: a single forward pass that stops at the first
/// record with a different key.
struct Values<'a, I: Iterator<Item = Result<KeyValue, Error>>> {
    key: &'a str,
    input: &'a mut Peekable<I>,
    failure: &'a mut Option<Error>,
}

impl<I: Iterator<Item = Result<KeyValue, Error>>> Iterator for Values<'_, I> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.failure.is_some() {
            return None;
        }
        let same_group = match self.input.peek()? {
            Ok(kv) if kv.key == self.key => true,
            Ok(_) => return None,
            Err(_) => false,
        };
        if !same_group {
            *self.failure = Some(next_error(&mut *self.input));
            return None;
        }
        self.input.next()?.ok().map(KeyValue::into_value)
    }
}

fn next_error<I: Iterator<Item = Result<KeyValue, Error>>>(input: &mut Peekable<I>) -> Error {
    match input.next() {
        Some(Err(e)) => e,
        _ => Error::Protocol("record stream changed while reading it".into()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;

    use common::Emit;

    use super::*;
    use crate::exchange::Fetcher;

    fn ok(records: &[(&str, &str)]) -> Vec<Result<KeyValue, Error>> {
        records.iter().map(|(k, v)| Ok(KeyValue::new(*k, *v))).collect()
    }

    fn run(records: Vec<Result<KeyValue, Error>>, reduce_fn: ReduceFn) -> Result<(GroupStats, Vec<KeyValue>), Error> {
        let mut out = vec![];
        let stats = reduce_groups(records.into_iter(), reduce_fn, &mut |kv| {
            out.push(kv);
            Ok(())
        })?;
        Ok((stats, out))
    }

    fn concat(key: &str, values: &mut dyn Iterator<Item = String>, emit: &mut Emit<'_>) -> anyhow::Result<()> {
        emit(KeyValue::new(key, values.collect::<Vec<_>>().join(",")))
    }

    fn first_only(key: &str, values: &mut dyn Iterator<Item = String>, emit: &mut Emit<'_>) -> anyhow::Result<()> {
        if let Some(first) = values.next() {
            emit(KeyValue::new(key, first))?;
        }
        Ok(())
    }

    fn silent(_: &str, _: &mut dyn Iterator<Item = String>, _: &mut Emit<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn failing(key: &str, _: &mut dyn Iterator<Item = String>, _: &mut Emit<'_>) -> anyhow::Result<()> {
        Err(anyhow!("cannot reduce `{key}`"))
    }

    #[test]
    fn each_key_is_reduced_once_with_all_its_values() {
        let (stats, out) = run(
            ok(&[("a", "1"), ("a", "1"), ("a", "2"), ("b", "7"), ("c", "")]),
            concat,
        )
        .unwrap();

        assert_eq!(stats, GroupStats { groups: 3, records_out: 3 });
        assert_eq!(
            out,
            vec![
                KeyValue::new("a", "1,1,2"),
                KeyValue::new("b", "7"),
                KeyValue::new("c", ""),
            ]
        );
    }

    #[test]
    fn unread_values_do_not_leak_into_the_next_group() {
        let (stats, out) = run(ok(&[("a", "1"), ("a", "2"), ("a", "3"), ("b", "4")]), first_only).unwrap();
        assert_eq!(stats.groups, 2);
        assert_eq!(out, vec![KeyValue::new("a", "1"), KeyValue::new("b", "4")]);

        let (stats, out) = run(ok(&[("a", "1"), ("b", "2")]), silent).unwrap();
        assert_eq!(stats, GroupStats { groups: 2, records_out: 0 });
        assert!(out.is_empty());
    }

    #[test]
    fn out_of_order_keys_are_a_protocol_error() {
        let err = run(ok(&[("b", "1"), ("a", "1")]), concat).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[test]
    fn user_function_failure_is_reported() {
        let err = run(ok(&[("a", "1")]), failing).unwrap_err();
        assert!(matches!(err, Error::UserFunction(_)));
        assert!(err.to_string().contains("cannot reduce `a`"));
    }

    #[test]
    fn read_error_inside_a_group_wins_over_partial_output() {
        let mut records = ok(&[("a", "1")]);
        records.push(Err(Error::storage("x.db", io::Error::other("disk gone"))));
        records.extend(ok(&[("b", "1")]));

        let err = run(records, concat).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }), "{err}");
    }

    #[test]
    fn empty_input_reduces_nothing() {
        let (stats, out) = run(vec![], concat).unwrap();
        assert_eq!(stats, GroupStats::default());
        assert!(out.is_empty());
    }

    async fn start_worker(dir: &std::path::Path) -> Worker {
        let (worker, _server) = Worker::start("127.0.0.1:0".parse().unwrap(), None, dir, Fetcher::default())
            .await
            .unwrap();
        worker
    }

    fn publish_map_output(worker: &Worker, m: usize, n: usize, records: &[(&str, &str)]) {
        let mut store = RecordStore::create(worker.path(&map_output_file(m, n))).unwrap();
        for (k, v) in records {
            store.insert(&KeyValue::new(*k, *v)).unwrap();
        }
        store.close().unwrap();
    }

    #[tokio::test]
    async fn reduce_task_merges_every_map_output() {
        let map_dir = tempfile::tempdir().unwrap();
        let reduce_dir = tempfile::tempdir().unwrap();
        let mapper = start_worker(map_dir.path()).await;
        let reducer = start_worker(reduce_dir.path()).await;

        publish_map_output(&mapper, 0, 1, &[("the", "1"), ("cat", "1"), ("the", "1")]);
        publish_map_output(&mapper, 1, 1, &[]);
        publish_map_output(&mapper, 2, 1, &[("the", "1"), ("dog", "1")]);

        let task = Arc::new(ReduceTask {
            m: 3,
            r: 2,
            n: 1,
            source_addresses: vec![mapper.address().to_string(); 3],
        });
        let wc = workload::try_named("wc").unwrap();
        let summary = perform_reduce(task, wc, &reducer, &Progress::default()).await.unwrap();

        assert_eq!(summary.records_in, 5);
        assert_eq!(summary.groups, 3);
        assert_eq!(summary.records_out, 3);

        let output: HashMap<String, String> = store::scan(reducer.path("reduce_1_output.db"))
            .unwrap()
            .map(|kv| {
                let kv = kv.unwrap();
                (kv.key, kv.value)
            })
            .collect();
        assert_eq!(
            output,
            HashMap::from([
                ("the".to_string(), "3".to_string()),
                ("cat".to_string(), "1".to_string()),
                ("dog".to_string(), "1".to_string()),
            ])
        );

        // Only the published output is left behind.
        let files: Vec<_> = std::fs::read_dir(reduce_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec!["reduce_1_output.db".to_string()]);
    }

    #[tokio::test]
    async fn missing_partition_fails_the_task() {
        let map_dir = tempfile::tempdir().unwrap();
        let reduce_dir = tempfile::tempdir().unwrap();
        let mapper = start_worker(map_dir.path()).await;
        let reducer = start_worker(reduce_dir.path()).await;
        publish_map_output(&mapper, 0, 0, &[("a", "1")]);

        let task = Arc::new(ReduceTask {
            m: 2,
            r: 1,
            n: 0,
            source_addresses: vec![mapper.address().to_string(); 2],
        });
        let wc = workload::try_named("wc").unwrap();
        let err = perform_reduce(task, wc, &reducer, &Progress::default()).await.unwrap_err();

        assert!(matches!(err, Error::Protocol(_)), "{err}");
        assert_eq!(std::fs::read_dir(reduce_dir.path()).unwrap().count(), 0);
    }

    fn panicking(key: &str, _: &mut dyn Iterator<Item = String>, _: &mut Emit<'_>) -> anyhow::Result<()> {
        panic!("cannot reduce `{key}`")
    }

    #[tokio::test]
    async fn panicking_reduce_function_leaves_nothing_behind() {
        let map_dir = tempfile::tempdir().unwrap();
        let reduce_dir = tempfile::tempdir().unwrap();
        let mapper = start_worker(map_dir.path()).await;
        let reducer = start_worker(reduce_dir.path()).await;
        publish_map_output(&mapper, 0, 0, &[("a", "1"), ("b", "1")]);

        let task = Arc::new(ReduceTask {
            m: 1,
            r: 1,
            n: 0,
            source_addresses: vec![mapper.address().to_string()],
        });
        let workload = Workload {
            map_fn: workload::try_named("wc").unwrap().map_fn,
            reduce_fn: panicking,
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let err = perform_reduce(task, workload, &reducer, &Progress::new(tx))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UserFunction(_)), "{err}");
        let files: Vec<_> = std::fs::read_dir(reduce_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(files.is_empty(), "left behind: {files:?}");

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event.state);
        }
        assert_eq!(last, Some(common::task::TaskState::Reduce(ReduceState::Failed)));
    }
}
