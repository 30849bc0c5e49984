//! Task counts and task descriptors for a run.

use std::sync::Arc;

use common::task::{MapTask, ReduceTask};
use common::Error;

/// Records per map shard when the map task count is left to the heuristic.
pub const DEFAULT_TARGET_SHARD_RECORDS: usize = 10_000;

/// How a run is cut into tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Number of map tasks. Derived from the source size when unset.
    pub map_tasks: Option<usize>,

    /// Number of reduce tasks. Half the map tasks (rounded up) when unset.
    pub reduce_tasks: Option<usize>,

    pub target_shard_records: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            map_tasks: None,
            reduce_tasks: None,
            target_shard_records: DEFAULT_TARGET_SHARD_RECORDS,
        }
    }
}

impl JobConfig {
    /// Resolve `(M, R)` for a source holding `records` records.
    pub fn task_counts(&self, records: usize) -> Result<(usize, usize), Error> {
        if self.map_tasks == Some(0) || self.reduce_tasks == Some(0) {
            return Err(Error::Protocol("task counts must be at least 1".into()));
        }
        let m = self
            .map_tasks
            .unwrap_or_else(|| records.div_ceil(self.target_shard_records.max(1)).max(1));
        let r = self.reduce_tasks.unwrap_or_else(|| m.div_ceil(2).max(1));
        Ok((m, r))
    }
}

/// Every descriptor of a run, together with the worker each task runs on.
#[derive(Debug, Clone)]
pub struct Plan {
    pub m: usize,
    pub r: usize,
    pub map_tasks: Vec<Arc<MapTask>>,
    pub reduce_tasks: Vec<Arc<ReduceTask>>,
    /// Index into the worker list, per map task.
    pub map_workers: Vec<usize>,
    /// Index into the worker list, per reduce task.
    pub reduce_workers: Vec<usize>,
}

/// Lay `m` map and `r` reduce tasks out round-robin over `workers`.
///
/// Every map task reads its shard from `source_address`; every reduce task
/// reads partition `n` of map task `i` from the worker running map task `i`.
pub fn build(m: usize, r: usize, source_address: &str, workers: &[String]) -> Result<Plan, Error> {
    if workers.is_empty() {
        return Err(Error::Protocol("a run needs at least one worker".into()));
    }
    if m == 0 || r == 0 {
        return Err(Error::Protocol("task counts must be at least 1".into()));
    }

    let map_workers: Vec<usize> = (0..m).map(|i| i % workers.len()).collect();
    let reduce_workers: Vec<usize> = (0..r).map(|n| n % workers.len()).collect();

    let map_tasks = (0..m)
        .map(|n| {
            Arc::new(MapTask {
                m,
                r,
                n,
                source_address: source_address.to_string(),
            })
        })
        .collect();

    let source_addresses: Vec<String> = map_workers.iter().map(|&w| workers[w].clone()).collect();
    let reduce_tasks = (0..r)
        .map(|n| {
            Arc::new(ReduceTask {
                m,
                r,
                n,
                source_addresses: source_addresses.clone(),
            })
        })
        .collect();

    Ok(Plan {
        m,
        r,
        map_tasks,
        reduce_tasks,
        map_workers,
        reduce_workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_follows_source_size() {
        let config = JobConfig {
            target_shard_records: 10,
            ..JobConfig::default()
        };
        assert_eq!(config.task_counts(0).unwrap(), (1, 1));
        assert_eq!(config.task_counts(10).unwrap(), (1, 1));
        assert_eq!(config.task_counts(11).unwrap(), (2, 1));
        assert_eq!(config.task_counts(45).unwrap(), (5, 3));
    }

    #[test]
    fn explicit_counts_win_and_zero_is_rejected() {
        let config = JobConfig {
            map_tasks: Some(3),
            reduce_tasks: Some(7),
            ..JobConfig::default()
        };
        assert_eq!(config.task_counts(1_000_000).unwrap(), (3, 7));

        let config = JobConfig {
            reduce_tasks: Some(0),
            ..JobConfig::default()
        };
        assert!(matches!(config.task_counts(5), Err(Error::Protocol(_))));
    }

    #[test]
    fn tasks_are_spread_round_robin() {
        let workers = vec!["w0:1".to_string(), "w1:1".to_string()];
        let plan = build(3, 2, "w0:1", &workers).unwrap();

        assert_eq!(plan.map_workers, vec![0, 1, 0]);
        assert_eq!(plan.reduce_workers, vec![0, 1]);
        assert!(plan.map_tasks.iter().all(|t| t.source_address == "w0:1" && t.r == 2));
        for (n, task) in plan.reduce_tasks.iter().enumerate() {
            assert_eq!(task.n, n);
            assert_eq!(task.source_addresses, vec!["w0:1", "w1:1", "w0:1"]);
        }
    }

    #[test]
    fn no_workers_no_plan() {
        assert!(matches!(build(1, 1, "x", &[]), Err(Error::Protocol(_))));
    }
}
