//! Gazer agent shell.
//!
//! Wires the collaborators around the snapshot engine: a cached,
//! singleflight program fetch (the only network I/O on the snapshot path,
//! always before the pause) and the environment-driven configuration. The
//! RPC transport that delivers program keys and carries blobs away is out
//! of scope; embedders plug their transport in through [`ProgramFetcher`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod env;
pub mod fetcher;

pub use cache::{DEFAULT_CACHE_CAPACITY, ProgramCache};
pub use env::AgentConfig;
pub use fetcher::{BlobFetcher, DecodingFetcher, FetchError, ProgramFetcher};

use std::sync::Arc;

use gazer_snapshot::{SnapshotError, SnapshotResponse};

/// Failures of a full capture.
#[derive(Debug)]
pub enum CaptureError {
    /// The snapshot program could not be fetched or decoded.
    Fetch(FetchError),
    /// The snapshot itself failed.
    Snapshot(SnapshotError),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Fetch(e) => write!(f, "{}", e),
            CaptureError::Snapshot(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Fetch(e) => Some(e),
            CaptureError::Snapshot(e) => Some(e),
        }
    }
}

impl From<FetchError> for CaptureError {
    fn from(e: FetchError) -> Self {
        CaptureError::Fetch(e)
    }
}

impl From<SnapshotError> for CaptureError {
    fn from(e: SnapshotError) -> Self {
        CaptureError::Snapshot(e)
    }
}

/// The in-process agent: program cache plus snapshot entry point.
pub struct Agent {
    config: AgentConfig,
    cache: ProgramCache,
}

impl Agent {
    /// Agent over the given fetch transport, configured from the
    /// environment.
    pub fn new(fetcher: Arc<dyn ProgramFetcher>) -> Self {
        Agent {
            config: AgentConfig::from_env(),
            cache: ProgramCache::new(fetcher),
        }
    }

    /// Agent with explicit configuration and cache capacity.
    pub fn with_config(
        fetcher: Arc<dyn ProgramFetcher>,
        config: AgentConfig,
        cache_capacity: usize,
    ) -> Self {
        Agent {
            config,
            cache: ProgramCache::with_capacity(fetcher, cache_capacity),
        }
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Take a snapshot using the program identified by `key`.
    ///
    /// Fetching (and any waiting on a concurrent fetch) happens before the
    /// world stops; the pause itself performs no I/O.
    pub fn capture(&self, key: &str) -> Result<SnapshotResponse, CaptureError> {
        let program = self.cache.get_or_fetch(key)?;
        let response = gazer_snapshot::snapshot(&program)?;
        tracing::info!(
            key,
            bytes = response.data.len(),
            pause_ns = response.pause_duration_ns,
            "snapshot complete"
        );
        Ok(response)
    }
}
