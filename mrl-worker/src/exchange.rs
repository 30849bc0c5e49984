//! Moving stores between workers.
//!
//! Every worker publishes its data directory under `/data/` over plain
//! HTTP GET; peers download what they need with a [`Fetcher`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

use common::store;
use common::Error;

/// Path prefix under which stores are published.
pub const DATA_PREFIX: &str = "/data";

/// Routes serving the files of `dir` under [`DATA_PREFIX`].
pub fn router(dir: impl AsRef<Path>) -> Router {
    Router::new()
        .nest_service(DATA_PREFIX, ServeDir::new(dir.as_ref()))
        .layer(TraceLayer::new_for_http())
}

/// Publish `dir` on `listener` until the server fails.
pub async fn serve(listener: TcpListener, dir: PathBuf) -> io::Result<()> {
    info!(
        "publishing {} on http://{}{DATA_PREFIX}/",
        dir.display(),
        listener.local_addr()?
    );
    axum::serve(listener, router(&dir)).await
}

/// Retry and timeout policy for fetches.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Attempts per fetch, including the first one.
    pub attempts: u32,

    /// Limit on a single request, body included.
    pub timeout: Duration,

    /// Pause before the second attempt; grows linearly after that.
    pub backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(30),
            backoff: Duration::from_millis(200),
        }
    }
}

/// Downloads published stores to local paths.
#[derive(Debug, Clone, Default)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Download `url` into `local`, which must not exist yet.
    ///
    /// Connection failures and 5xx answers are retried according to the
    /// [`FetchConfig`]; any other non-success status fails immediately.
    /// Returns the number of bytes written.
    pub async fn fetch(&self, url: &str, local: &Path) -> Result<u64, Error> {
        let parsed = Url::parse(url).map_err(|e| network(url, None, format!("invalid url: {e}")))?;
        if parsed.scheme() != "http" {
            return Err(network(url, None, "only http urls can be fetched".into()));
        }

        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_fetch(&parsed, local).await {
                Ok(written) => {
                    debug!("fetched {url} ({written} bytes) into {}", local.display());
                    return Ok(written);
                }
                Err(e) if attempt < attempts && is_transient(&e) => {
                    warn!("fetch attempt {attempt}/{attempts} failed: {e}");
                    tokio::time::sleep(self.config.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_fetch(&self, url: &Url, local: &Path) -> Result<u64, Error> {
        let mut response = self
            .client
            .get(url.clone())
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| network(url.as_str(), None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(network(
                url.as_str(),
                Some(status.as_u16()),
                format!("server answered {status}"),
            ));
        }
        let expected = response.content_length();

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(local)
            .await
            .map_err(|e| Error::storage(local, e))?;

        let result = async {
            let mut written = 0u64;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| network(url.as_str(), None, e.to_string()))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::storage(local, e))?;
                written += chunk.len() as u64;
            }
            if let Some(expected) = expected {
                if expected != written {
                    return Err(network(
                        url.as_str(),
                        None,
                        format!("truncated body: got {written} of {expected} bytes"),
                    ));
                }
            }
            file.sync_all().await.map_err(|e| Error::storage(local, e))?;
            Ok(written)
        }
        .await;

        if result.is_err() {
            drop(file);
            store::discard(local);
        }
        result
    }
}

fn network(url: &str, status: Option<u16>, reason: String) -> Error {
    Error::Network {
        url: url.to_string(),
        status,
        reason,
    }
}

fn is_transient(err: &Error) -> bool {
    match err {
        Error::Network { status: None, .. } => true,
        Error::Network {
            status: Some(status),
            ..
        } => *status >= 500,
        _ => false,
    }
}
