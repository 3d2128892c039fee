use std::future::Future;

use futures::{StreamExt, stream};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ObjectError, Operation, StoreError, StoreResult},
    store::{ObjectRef, ObjectStore},
};

pub const DEFAULT_CONCURRENCY: usize = 8;

/// Issues independent per-object requests concurrently, at most `limit` at a time.
///
/// Once `cancel` fires no new request is issued; requests already in flight
/// finish and their results are kept. Targets that were never issued come back
/// as `StoreError::Cancelled`.
#[derive(Debug, Clone)]
pub struct FanOut {
    limit: usize,
    cancel: CancellationToken,
}

impl FanOut {
    pub fn new(limit: usize, cancel: CancellationToken) -> Self {
        FanOut {
            limit: limit.max(1),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `call` for every target. Results are sorted by target, not by completion.
    pub async fn run<T, F, Fut>(&self, targets: Vec<ObjectRef>, call: F) -> Vec<(ObjectRef, StoreResult<T>)>
    where
        F: Fn(ObjectRef) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let cancel = &self.cancel;
        let call = &call;
        let mut results: Vec<(ObjectRef, StoreResult<T>)> = stream::iter(targets)
            .map(|target| async move {
                if cancel.is_cancelled() {
                    return (target, Err(StoreError::Cancelled));
                }
                let result = call(target.clone()).await;
                (target, result)
            })
            .buffer_unordered(self.limit)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Read every target, splitting bodies from tagged failures.
    pub async fn read_all(
        &self,
        store: &dyn ObjectStore,
        targets: Vec<ObjectRef>,
    ) -> (Vec<(ObjectRef, Value)>, Vec<ObjectError>) {
        let results = self
            .run(targets, |target| async move { store.read(&target).await })
            .await;
        split(results, Operation::Read)
    }

    pub async fn delete_all(
        &self,
        store: &dyn ObjectStore,
        targets: Vec<ObjectRef>,
    ) -> (Vec<ObjectRef>, Vec<ObjectError>) {
        let results = self
            .run(targets, |target| async move { store.delete(&target).await })
            .await;
        let (done, errors) = split(results, Operation::Delete);
        (done.into_iter().map(|(target, _)| target).collect(), errors)
    }
}

pub(crate) fn split<T>(
    results: Vec<(ObjectRef, StoreResult<T>)>,
    operation: Operation,
) -> (Vec<(ObjectRef, T)>, Vec<ObjectError>) {
    let mut ok = Vec::new();
    let mut errors = Vec::new();
    for (target, result) in results {
        match result {
            Ok(value) => ok.push((target, value)),
            Err(source) => errors.push(ObjectError::new(target, operation, source)),
        }
    }
    (ok, errors)
}
