//! Reconciliation loops.
//!
//! Each operator is a periodic `step()` over the shared datastores and
//! backends; there is no messaging between them. Every step re-reads the
//! state it needs, so a missed or duplicated observation in one pass is
//! corrected in the next, and the loops are free to run in any
//! interleaving.

pub mod content_upload;
pub mod download_once_cleanup;
pub mod fileversion_sync;
pub mod local_create;
pub mod local_hasher;
pub mod local_scanner;
pub mod local_version_creation;

pub use content_upload::ContentUpload;
pub use download_once_cleanup::DownloadOnceCleanup;
pub use fileversion_sync::FileVersionSync;
pub use local_create::LocalCreate;
pub use local_hasher::LocalHasher;
pub use local_scanner::LocalScanner;
pub use local_version_creation::LocalVersionCreation;

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::datastore::StoreError;

/// Sleep after a step that did work.
pub const DEFAULT_SHORT_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling for the exponential back-off after idle steps.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Sleep after a failed step, so a persistent fault cannot spin the CPU.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// A failure that aborts one operator step.
///
/// Most backend trouble is handled inside the operators (logged, backend
/// skipped); what escapes here is either a datastore invariant violation or
/// an exhausted metadata merge, both of which should hit the error
/// back-off.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("operator io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One reconciliation loop.
pub trait Operator: Send {
    fn name(&self) -> &'static str;

    /// Run one pass; the returned flag is whether any work happened, which
    /// drives the loop's back-off.
    fn step(&mut self) -> Result<bool, StepError>;

    fn short_interval(&self) -> Duration {
        DEFAULT_SHORT_INTERVAL
    }

    fn max_interval(&self) -> Duration {
        DEFAULT_MAX_INTERVAL
    }
}
