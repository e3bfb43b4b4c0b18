//! Bounded watch helper: wait until an event matches a predicate, the
//! stream closes, or a deadline elapses. Every watch in the workflow goes
//! through this so no code path can block on the API server indefinitely.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, WatchEvent, WatchParams};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, ScalerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// An event satisfied the predicate before the deadline.
    Matched,
    TimedOut,
    /// The server closed the watch without a matching event.
    StreamClosed,
}

pub(crate) async fn wait_for_event<K>(
    api: &Api<K>,
    name: &str,
    resource_version: &str,
    deadline: Duration,
    mut predicate: impl FnMut(&WatchEvent<K>) -> bool,
) -> Result<WaitOutcome>
where
    K: Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let params = WatchParams::default()
        .fields(&format!("metadata.name={name}"))
        .timeout(deadline.as_secs() as u32);
    let stream = api
        .watch(&params, resource_version)
        .await
        .map_err(|err| ScalerError::Api {
            message: format!("failed to start watch for {name}: {err}"),
        })?;
    let mut stream = stream.boxed();

    let waited = tokio::time::timeout(deadline, async {
        loop {
            match stream.try_next().await {
                Ok(Some(event)) => {
                    if predicate(&event) {
                        return WaitOutcome::Matched;
                    }
                }
                Ok(None) => return WaitOutcome::StreamClosed,
                Err(err) => {
                    debug!(name, error = %err, "watch stream error");
                    return WaitOutcome::StreamClosed;
                }
            }
        }
    })
    .await;

    Ok(waited.unwrap_or(WaitOutcome::TimedOut))
}
