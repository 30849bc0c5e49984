//! Task descriptors, task states and the names of the stores they exchange.

use std::fmt;

use crate::Phase;

/// A map task.
///
/// Built once by the coordinator and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTask {
    /// Total number of map tasks.
    pub m: usize,

    /// Total number of reduce tasks.
    pub r: usize,

    /// Index of this task, in `[0, m)`.
    pub n: usize,

    /// Address of the worker publishing this task's input shard.
    pub source_address: String,
}

impl MapTask {
    /// Name of the shard this task reads, as published by the source worker.
    pub fn source_name(&self) -> String {
        map_source_file(self.n)
    }

    /// Name of the local copy of the shard.
    pub fn input_name(&self) -> String {
        map_input_file(self.n)
    }

    /// Name of the store holding reduce partition `r` of this task's output.
    pub fn output_name(&self, r: usize) -> String {
        map_output_file(self.n, r)
    }
}

/// A reduce task.
///
/// `source_addresses[m]` is where map task `m` publishes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceTask {
    /// Total number of map tasks.
    pub m: usize,

    /// Total number of reduce tasks.
    pub r: usize,

    /// Index of this task, in `[0, r)`.
    pub n: usize,

    /// One address per map task.
    pub source_addresses: Vec<String>,
}

impl ReduceTask {
    pub fn input_name(&self) -> String {
        reduce_input_file(self.n)
    }

    pub fn temp_name(&self, m: usize) -> String {
        reduce_temp_file(self.n, m)
    }

    pub fn output_name(&self) -> String {
        reduce_output_file(self.n)
    }
}

pub fn map_source_file(m: usize) -> String {
    format!("map_{m}_source.db")
}

pub fn map_input_file(m: usize) -> String {
    format!("map_{m}_input.db")
}

pub fn map_output_file(m: usize, r: usize) -> String {
    format!("map_{m}_output_{r}.db")
}

pub fn reduce_input_file(r: usize) -> String {
    format!("reduce_{r}_input.db")
}

pub fn reduce_temp_file(r: usize, m: usize) -> String {
    format!("reduce_{r}_temp_{m}.db")
}

pub fn reduce_output_file(r: usize) -> String {
    format!("reduce_{r}_output.db")
}

/// Name of the local copy of reduce output `r` while gathering.
pub fn gather_temp_file(r: usize) -> String {
    format!("gather_{r}_temp.db")
}

/// URL under which a worker at `address` publishes the store `name`.
pub fn make_url(address: &str, name: &str) -> String {
    format!("http://{address}/data/{name}")
}

/// State of a map task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// Task not started.
    Pending,

    /// Downloading the input shard.
    FetchingInput,

    /// Running the map function over the input.
    Mapping,

    /// Input consumed, the partition stage is draining emitted records.
    Partitioning,

    /// Writing the partition stores.
    Publishing,

    /// All partitions published.
    Done,

    Failed,
}

/// State of a reduce task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceState {
    /// Task not started.
    Pending,

    /// Downloading one partition from every map task.
    FetchingInputs,

    /// Combining the downloaded partitions into one store.
    Merging,

    /// Sorting the combined store by key and value.
    Grouping,

    /// Running the reduce function once per key.
    Reducing,

    /// Writing the output store.
    Publishing,

    /// Output published.
    Done,

    Failed,
}

/// The state half of a [`TaskEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Map(MapState),
    Reduce(ReduceState),
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Map(state) => write!(f, "{state:?}"),
            TaskState::Reduce(state) => write!(f, "{state:?}"),
        }
    }
}

/// A state transition of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskEvent {
    pub phase: Phase,
    pub index: usize,
    pub state: TaskState,
}

impl TaskEvent {
    pub fn map(index: usize, state: MapState) -> Self {
        Self {
            phase: Phase::Map,
            index,
            state: TaskState::Map(state),
        }
    }

    pub fn reduce(index: usize, state: ReduceState) -> Self {
        Self {
            phase: Phase::Reduce,
            index,
            state: TaskState::Reduce(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_names_are_indexed_by_task_and_partition() {
        let map = MapTask {
            m: 3,
            r: 2,
            n: 1,
            source_address: "127.0.0.1:8080".into(),
        };
        assert_eq!(map.source_name(), "map_1_source.db");
        assert_eq!(map.input_name(), "map_1_input.db");
        assert_eq!(map.output_name(0), "map_1_output_0.db");

        let reduce = ReduceTask {
            m: 3,
            r: 2,
            n: 1,
            source_addresses: vec!["a:1".into(), "b:2".into(), "c:3".into()],
        };
        assert_eq!(reduce.input_name(), "reduce_1_input.db");
        assert_eq!(reduce.temp_name(2), "reduce_1_temp_2.db");
        assert_eq!(reduce.output_name(), "reduce_1_output.db");
    }

    #[test]
    fn urls_live_under_data_prefix() {
        assert_eq!(
            make_url("10.0.0.7:8080", "map_0_output_1.db"),
            "http://10.0.0.7:8080/data/map_0_output_1.db"
        );
    }
}
