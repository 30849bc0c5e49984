use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::info;

use common::store;
use common::task::TaskEvent;
use common::Error;

use crate::exchange::{self, Fetcher};

/// A worker: a data directory and the address at which it is published.
///
/// The address is given explicitly; it is never probed from the network.
#[derive(Debug, Clone)]
pub struct Worker {
    address: String,
    data_dir: PathBuf,
    fetcher: Fetcher,
}

impl Worker {
    pub fn new(address: impl Into<String>, data_dir: impl Into<PathBuf>, fetcher: Fetcher) -> Self {
        Self {
            address: address.into(),
            data_dir: data_dir.into(),
            fetcher,
        }
    }

    /// Bind `bind`, start publishing `data_dir` in the background and
    /// return the worker together with the server task.
    ///
    /// `advertise_host` is the host peers should use to reach the bound
    /// port, e.g. when binding a wildcard address. Without it the bound
    /// socket address is advertised.
    pub async fn start(
        bind: SocketAddr,
        advertise_host: Option<&str>,
        data_dir: impl Into<PathBuf>,
        fetcher: Fetcher,
    ) -> io::Result<(Worker, JoinHandle<io::Result<()>>)> {
        let data_dir = data_dir.into();
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        let address = match advertise_host {
            Some(host) => format!("{host}:{}", local.port()),
            None => local.to_string(),
        };
        info!("worker {address} serving {}", data_dir.display());

        let server = tokio::spawn(exchange::serve(listener, data_dir.clone()));
        Ok((Worker::new(address, data_dir, fetcher), server))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Local path of the store `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Path a store is written to before it is published under `name`.
    pub fn staging_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.tmp"))
    }

    /// Remove the store `name`, if present.
    pub fn discard(&self, name: &str) {
        store::discard(self.path(name));
    }
}

/// Where a task reports its state transitions.
///
/// Every transition is logged; when an observer is attached it also
/// receives a [`TaskEvent`].
#[derive(Debug, Clone, Default)]
pub struct Progress {
    events: Option<UnboundedSender<TaskEvent>>,
}

impl Progress {
    pub fn new(events: UnboundedSender<TaskEvent>) -> Self {
        Self {
            events: Some(events),
        }
    }

    pub fn report(&self, event: TaskEvent) {
        info!("{} task {} -> {}", event.phase, event.index, event.state);
        if let Some(events) = &self.events {
            // A departed observer is not a task failure.
            let _ = events.send(event);
        }
    }
}

/// Run blocking store and user-function work off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::UserFunction(anyhow!("task panicked: {e}")))?
}

/// Publish a staged file under its final name.
pub(crate) fn publish(staged: &Path, target: &Path) -> Result<(), Error> {
    std::fs::rename(staged, target).map_err(|e| Error::storage(target, e))
}

#[cfg(test)]
mod tests {
    use common::task::make_url;

    use super::*;

    #[tokio::test]
    async fn advertised_host_keeps_the_bound_port() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.db"), "eA== MQ==\n").unwrap();
        let (worker, _server) = Worker::start(
            "0.0.0.0:0".parse().unwrap(),
            Some("127.0.0.1"),
            dir.path(),
            Fetcher::default(),
        )
        .await
        .unwrap();

        let (host, port) = worker.address().rsplit_once(':').unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_ne!(port, "0");

        let local = tempfile::tempdir().unwrap();
        let copy = local.path().join("a.db");
        worker
            .fetcher()
            .fetch(&make_url(worker.address(), "a.db"), &copy)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(copy).unwrap(), "eA== MQ==\n");
    }

    #[tokio::test]
    async fn bound_address_is_advertised_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _server) = Worker::start("127.0.0.1:0".parse().unwrap(), None, dir.path(), Fetcher::default())
            .await
            .unwrap();
        assert!(worker.address().starts_with("127.0.0.1:"));
        assert!(!worker.address().ends_with(":0"));
    }
}
