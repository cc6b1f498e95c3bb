// ── Bounded fan-out ──
//
// Runs one future per device with a concurrency cap and collects
// `{succeeded, failed}` instead of short-circuiting on the first error.

use std::future::Future;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;

use crate::error::CoreError;
use crate::model::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceFailure {
    pub device: DeviceId,
    pub reason: String,
}

#[derive(Debug)]
pub struct FanOut<T> {
    pub succeeded: Vec<(DeviceId, T)>,
    pub failed: Vec<DeviceFailure>,
}

impl<T> FanOut<T> {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Run `f` for every device, at most `concurrency` at a time.
///
/// Results keep input order.
pub async fn fan_out<F, Fut, T>(devices: Vec<DeviceId>, concurrency: usize, f: F) -> FanOut<T>
where
    F: Fn(DeviceId) -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let results: Vec<(DeviceId, Result<T, CoreError>)> = stream::iter(devices)
        .map(|id| {
            let fut = f(id.clone());
            async move { (id, fut.await) }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut out = FanOut {
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    for (device, result) in results {
        match result {
            Ok(value) => out.succeeded.push((device, value)),
            Err(e) => out.failed.push(DeviceFailure {
                device,
                reason: e.to_string(),
            }),
        }
    }
    out
}
