//! Seams to the block source. The sync pipeline only sees these traits;
//! transports implement them outside this crate.

use std::fmt;

use async_trait::async_trait;
use utxod_primitives::Hash256;

#[derive(Debug)]
pub enum SourceError {
    /// Transient failure; the caller may retry.
    Unavailable(String),
    /// The source answered with something we cannot use.
    Protocol(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(message) => write!(f, "source unavailable: {message}"),
            SourceError::Protocol(message) => write!(f, "source protocol: {message}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Confirmed-chain view of the block source.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Current chain height.
    async fn height(&self) -> Result<i32, SourceError>;

    /// Block hashes for `count` heights starting at `start`. Short reads
    /// are allowed near the tip.
    async fn block_hashes(&self, start: u32, count: usize) -> Result<Vec<Hash256>, SourceError>;

    /// Raw blocks for the given hashes, in order.
    async fn raw_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Vec<u8>>, SourceError>;
}

/// Mempool view of the block source.
#[async_trait]
pub trait MempoolSource: Send + Sync {
    /// Chain height as the source currently sees it, used to detect a
    /// block landing mid-snapshot.
    async fn height(&self) -> Result<i32, SourceError>;

    async fn mempool_hashes(&self) -> Result<Vec<Hash256>, SourceError>;

    /// Raw transactions for the given hashes; `None` where the source no
    /// longer has one.
    async fn raw_transactions(
        &self,
        hashes: &[Hash256],
    ) -> Result<Vec<Option<Vec<u8>>>, SourceError>;
}
