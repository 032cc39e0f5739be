//! Panic recovery for worker services.
//!
//! A panicking service must surface as a fault exit, not tear down the
//! worker runtime that is supposed to report it.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Await `future`, returning the panic message if it panicked.
pub async fn catch_panic<Fut, T>(future: Fut) -> std::result::Result<T, String>
where
    Fut: Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| extract_panic_message(payload.as_ref()))
}

/// Await `future`, converting a panic into [`Error::Internal`].
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match catch_panic(future).await {
        Ok(result) => result,
        Err(panic_msg) => {
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                "panic_recovered"
            );
            Err(Error::internal(format!(
                "panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Best-effort message from a panic payload.
pub fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}
