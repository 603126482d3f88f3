use std::fmt;
use std::future::Future;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, info};

use super::{OperationConfig, OperationTracker, ProgressReporter, TrackedResult};

type Work<'a, T> = Box<dyn FnOnce(ProgressReporter) -> BoxFuture<'a, Result<T, String>> + Send + 'a>;

/// One unit of work for a batch, tracked under its own key
pub struct TrackedTask<'a, T> {
    pub key: String,
    pub config: OperationConfig,
    work: Work<'a, T>,
}

impl<'a, T: Send + 'a> TrackedTask<'a, T> {
    pub fn new<E, F, Fut>(key: impl Into<String>, config: OperationConfig, work: F) -> Self
    where
        F: FnOnce(ProgressReporter) -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        E: fmt::Display,
    {
        Self {
            key: key.into(),
            config,
            work: Box::new(move |progress| {
                work(progress)
                    .map(|result| result.map_err(|e| e.to_string()))
                    .boxed()
            }),
        }
    }
}

impl<T> fmt::Debug for TrackedTask<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedTask")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OperationTracker {
    /// Run every task concurrently; a failing task does not affect the others.
    ///
    /// Results are in input order.
    pub async fn run_parallel<T>(&self, tasks: Vec<TrackedTask<'_, T>>) -> Vec<TrackedResult<T>> {
        info!(count = tasks.len(), "Running tracked tasks in parallel");
        join_all(tasks.into_iter().map(|task| async move {
            let TrackedTask { key, config, work } = task;
            self.run_tracked(&key, config, work).await
        }))
        .await
    }

    /// Run tasks one after another.
    ///
    /// Stops after the first failure unless `continue_on_error` is set; the
    /// returned results cover the tasks that actually ran.
    pub async fn run_sequential<T>(
        &self,
        tasks: Vec<TrackedTask<'_, T>>,
        continue_on_error: bool,
    ) -> Vec<TrackedResult<T>> {
        let total = tasks.len();
        let mut results = Vec::with_capacity(total);

        for TrackedTask { key, config, work } in tasks {
            let result = self.run_tracked(&key, config, work).await;
            let failed = !result.success;
            results.push(result);

            if failed && !continue_on_error {
                debug!(key = %key, ran = results.len(), total, "Stopping sequence after failure");
                break;
            }
        }

        results
    }
}
