use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mrl_coordinator::plan::DEFAULT_TARGET_SHARD_RECORDS;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a MapReduce job over a source store on local workers.
    Run {
        /// The source store.
        #[arg(short, long)]
        source: PathBuf,

        /// Where the result store is written.
        #[arg(short, long)]
        target: PathBuf,

        /// Name of the workload, e.g. `wc` or `vertex-degree`.
        #[arg(short, long, default_value = "wc")]
        workload: String,

        /// Number of workers to start.
        #[arg(long, default_value = "2")]
        workers: usize,

        /// Number of map tasks. Derived from the source size if not given.
        #[arg(short, long)]
        map_tasks: Option<usize>,

        /// Number of reduce tasks. Half the map tasks if not given.
        #[arg(short, long)]
        reduce_tasks: Option<usize>,

        /// Records per shard when the map task count is derived.
        #[arg(long, default_value_t = DEFAULT_TARGET_SHARD_RECORDS)]
        target_shard_records: usize,

        /// Parent of the worker data directories. A temporary directory is
        /// used if not given.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Host the workers bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Host peers use to reach the workers. Defaults to the bound
        /// address; needed when `--host` is a wildcard such as 0.0.0.0.
        #[arg(long)]
        advertise_host: Option<String>,
    },

    /// Build a source store from files, one record per file.
    Load {
        /// Glob pattern for the input files.
        #[arg(short, long)]
        input: String,

        /// Where the store is written.
        #[arg(short, long)]
        target: PathBuf,
    },
}

pub fn parse_args() -> Command {
    Args::parse().command
}
