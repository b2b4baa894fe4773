//! SQLite persistence, page fetching, and the raw page archive for ratiowatch.

pub mod archive;
pub mod db;
pub mod fetch;
pub mod resolver;
pub mod sessions;
pub mod snapshots;

use ratiowatch_core::{ParseStatusError, SessionStatus};
use thiserror::Error;
use uuid::Uuid;

pub use archive::{ArchivedPage, PageArchive};
pub use db::{EntityCounts, Store};
pub use fetch::{
    FetchError, FetchedPage, HttpClientConfig, HttpFetcher, PageFetcher,
};
pub use resolver::EntityResolver;
pub use sessions::SessionTracker;
pub use snapshots::{BatchOutcome, MeasurementQuery, MeasurementRow, RecordFailure, SnapshotStore};

pub const CRATE_NAME: &str = "ratiowatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("source {0} is not registered")]
    UnknownSource(String),
    #[error("session {0} does not exist")]
    UnknownSession(Uuid),
    #[error("session {id} is already {status}")]
    SessionAlreadyFinalized { id: Uuid, status: SessionStatus },
    #[error("stored value is unreadable: {0}")]
    Corrupt(String),
}

impl From<ParseStatusError> for StoreError {
    fn from(err: ParseStatusError) -> Self {
        Self::Corrupt(err.to_string())
    }
}
