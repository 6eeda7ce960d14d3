//! Reconciliation pipelines projecting garden resources into the stores.
//!
//! Both reconcilers follow the same discipline: transport failures are
//! returned as errors and retried with backoff, while validation failures
//! evict the cache entry and report success, because they describe an
//! upstream that no longer entitles the entry to be served.

pub mod certificate;
pub mod openidmeta;

use std::any::Any;
use std::time::Duration;

use crate::Error;

/// Base delay applied by the error policies before a failed key is retried.
pub const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound of reconciles running in parallel per controller.
pub const MAX_CONCURRENT_RECONCILES: u16 = 50;

/// Extract a readable message from a recovered panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Flatten a caught-panic outcome into the reconciler's own result type.
pub(crate) fn flatten_panic<T>(
    outcome: Result<Result<T, Error>, Box<dyn Any + Send>>,
) -> Result<T, Error> {
    match outcome {
        Ok(result) => result,
        Err(payload) => Err(Error::Panic(panic_message(payload))),
    }
}
