mod args;

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

use args::{parse_args, Command};
use mrl_coordinator::load::load;
use mrl_coordinator::{Coordinator, JobConfig};
use mrl_worker::{Fetcher, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    match parse_args() {
        Command::Run {
            source,
            target,
            workload,
            workers,
            map_tasks,
            reduce_tasks,
            target_shard_records,
            data_dir,
            host,
            advertise_host,
        } => {
            let workload = workload::try_named(&workload)
                .ok_or_else(|| anyhow!("unknown workload `{workload}`, expected one of {:?}", workload::NAMES))?;
            if workers == 0 {
                bail!("at least one worker is needed");
            }

            // Only created without --data-dir, and kept alive until the run ends.
            let scratch;
            let root: PathBuf = match data_dir {
                Some(dir) => dir,
                None => {
                    scratch = tempfile::tempdir().context("creating worker directories")?;
                    scratch.path().to_path_buf()
                }
            };

            let bind: SocketAddr = format!("{host}:0").parse().with_context(|| format!("bad host `{host}`"))?;
            let mut pool = Vec::with_capacity(workers);
            for i in 0..workers {
                let dir: PathBuf = root.join(format!("worker_{i}"));
                fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
                let (worker, _server) = Worker::start(bind, advertise_host.as_deref(), dir, Fetcher::default()).await?;
                pool.push(worker);
            }

            let config = JobConfig {
                map_tasks,
                reduce_tasks,
                target_shard_records,
            };
            let report = Coordinator::new(pool, config).run(&source, &target, workload).await?;
            info!(
                "done: {} records in, {} records out (M={}, R={})",
                report.records_in, report.records_out, report.m, report.r
            );
        }
        Command::Load { input, target } => {
            let loaded = load(&input, &target)?;
            info!("loaded {loaded} files into {}", target.display());
        }
    }

    Ok(())
}
