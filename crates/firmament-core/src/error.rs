//! Error types, re-exported from the modules that define them.

pub use crate::backend::BackendError;
pub use crate::config::ConfigError;
pub use crate::datastore::StoreError;
pub use crate::encrypt::EncryptError;
pub use crate::operators::StepError;
