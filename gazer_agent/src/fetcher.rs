//! The program-fetch boundary.
//!
//! The transport that actually talks to the remote program store is out of
//! scope; the engine sees only this trait. The blob shape on the wire is
//! the `gazer_program` wire format, so a byte-level transport composes
//! with [`DecodingFetcher`] to produce typed programs.

use gazer_program::{SnapshotProgram, WireError, wire};

/// Fetch failures.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// The fetch was cancelled before completing; a later caller may
    /// retry.
    Cancelled,
    /// The remote source failed.
    Remote(String),
    /// The fetched bytes did not decode as a program.
    Decode(WireError),
}

impl FetchError {
    /// Whether this failure is a cancellation, retryable by the next
    /// caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Cancelled => write!(f, "fetch cancelled"),
            FetchError::Remote(msg) => write!(f, "failed to get snapshot program: {}", msg),
            FetchError::Decode(e) => write!(f, "failed to decode snapshot program: {}", e),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// A source of snapshot programs, keyed by the program key the control
/// plane hands out.
pub trait ProgramFetcher: Send + Sync {
    /// Fetch and decode the program for `key`.
    fn fetch(&self, key: &str) -> Result<SnapshotProgram, FetchError>;
}

impl<F> ProgramFetcher for F
where
    F: Fn(&str) -> Result<SnapshotProgram, FetchError> + Send + Sync,
{
    fn fetch(&self, key: &str) -> Result<SnapshotProgram, FetchError> {
        self(key)
    }
}

/// A source of raw program blobs.
pub trait BlobFetcher: Send + Sync {
    /// Fetch the encoded program for `key`.
    fn fetch_blob(&self, key: &str) -> Result<Vec<u8>, FetchError>;
}

/// Adapts a byte transport into a [`ProgramFetcher`] by decoding the wire
/// format.
pub struct DecodingFetcher<B> {
    transport: B,
}

impl<B: BlobFetcher> DecodingFetcher<B> {
    /// Wrap a byte transport.
    pub fn new(transport: B) -> Self {
        Self { transport }
    }
}

impl<B: BlobFetcher> ProgramFetcher for DecodingFetcher<B> {
    fn fetch(&self, key: &str) -> Result<SnapshotProgram, FetchError> {
        let blob = self.transport.fetch_blob(key)?;
        wire::decode_program(&blob).map_err(FetchError::Decode)
    }
}
