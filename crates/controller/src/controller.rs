use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, Stream};
use kwork_core::{Delta, Key, MetaAccessor};
use kwork_queue::WorkQueue;
use kwork_store::{Cache, Informer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ControllerConfig, ControllerError, ErrorSink, RetryPolicy, SyncError, SyncHandler, TracingSink, Verdict};

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

enum Startup {
    Synced,
    Stopped,
    TimedOut(Duration),
}

/// Cache + queue + workers around one [`SyncHandler`].
pub struct Controller<O: MetaAccessor> {
    config: ControllerConfig,
    cache: Cache<O>,
    queue: WorkQueue,
    handler: Arc<dyn SyncHandler<O>>,
    sink: Arc<dyn ErrorSink>,
    retry: RetryPolicy,
}

impl<O: MetaAccessor> Controller<O> {
    pub fn new(config: ControllerConfig, handler: impl SyncHandler<O> + 'static) -> Result<Self, ControllerError> {
        config.validate()?;
        let queue = WorkQueue::new(config.name.clone(), config.rate_limiter());
        Ok(Self {
            retry: RetryPolicy::new(config.max_retries),
            cache: Cache::new(),
            queue,
            handler: Arc::new(handler),
            sink: Arc::new(TracingSink),
            config,
        })
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }
    pub fn cache(&self) -> &Cache<O> { &self.cache }
    pub fn queue(&self) -> &WorkQueue { &self.queue }

    /// Change detector wired to this controller's cache and queue.
    pub fn informer(&self) -> Informer<O> {
        Informer::new(self.cache.clone(), Arc::new(self.queue.clone())).with_resync(self.config.resync_period)
    }

    /// Take one key, sync it and settle its retry state. Returns `false` once the queue is
    /// shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        match self.queue.get().await {
            Some(key) => {
                self.process(key).await;
                true
            }
            None => false,
        }
    }

    async fn process(&self, key: Key) {
        let started = Instant::now();
        let result = self.sync(&key).await;
        metrics::histogram!(
            "controller_sync_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0,
            "controller" => self.config.name.clone()
        );
        // The key must reach `done` or it stays processing forever.
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| self.handle_err(&key, result))) {
            error!(key = %key, panic = %panic_message(&*panic), "settling retry state panicked");
        }
        self.queue.done(&key);
    }

    async fn sync(&self, key: &Key) -> Result<(), SyncError> {
        let obj = self.cache.get_by_key(key.as_str()).map_err(|e| {
            error!(key = %key, error = %e, "fetching object from store failed");
            e
        })?;
        match AssertUnwindSafe(self.handler.sync(key, obj)).catch_unwind().await {
            Ok(res) => res.map_err(SyncError::Handler),
            Err(panic) => Err(SyncError::Panicked(panic_message(&*panic))),
        }
    }

    /// Apply the retry policy to the outcome of one sync of `key`.
    pub fn handle_err(&self, key: &Key, result: Result<(), SyncError>) {
        let label = self.config.name.clone();
        let err = match result {
            Ok(()) => {
                metrics::counter!("controller_syncs_total", 1u64, "controller" => label, "result" => "ok");
                // Stale failure history must not delay future updates of this key.
                self.queue.forget(key);
                return;
            }
            Err(e) => e,
        };
        metrics::counter!("controller_syncs_total", 1u64, "controller" => label, "result" => "error");
        let failures = self.queue.num_requeues(key).saturating_add(1);
        match self.retry.on_failure(failures) {
            Verdict::Retry => {
                info!(key = %key, attempt = failures, error = %err, "error syncing; requeueing");
                self.queue.add_rate_limited(key.clone());
            }
            Verdict::Drop => {
                self.queue.forget(key);
                self.sink.report(key, &err);
                info!(key = %key, attempts = failures, error = %err, "dropping key out of the queue");
            }
        }
    }

    async fn run_worker(&self, id: usize, stop: CancellationToken) {
        debug!(worker = id, "worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                key = self.queue.get() => key,
            };
            match next {
                Some(key) => self.process(key).await,
                None => break,
            }
        }
        debug!(worker = id, "worker stopped");
    }

    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> Startup {
        let timeout = self.config.cache_sync_timeout;
        tokio::select! {
            _ = self.cache.wait_synced() => Startup::Synced,
            _ = stop.cancelled() => Startup::Stopped,
            _ = async {
                match timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending::<()>().await,
                }
            } => Startup::TimedOut(timeout.unwrap_or_default()),
        }
    }

    /// Run until `stop` fires.
    ///
    /// Starts the informer over `source`, waits for the initial listing, then starts
    /// `workers` workers. On stop the queue is shut down and the call returns once every
    /// in-flight sync has finished; running handlers are never interrupted.
    pub async fn run<S>(self: Arc<Self>, source: S, stop: CancellationToken) -> Result<(), ControllerError>
    where
        S: Stream<Item = anyhow::Result<Delta<O>>> + Send + 'static,
    {
        let name = self.config.name.clone();
        info!(controller = %name, workers = self.config.workers, "starting controller");

        let informer_stop = stop.child_token();
        let informer = tokio::spawn(self.informer().run(source, informer_stop.clone()));

        match self.wait_for_cache_sync(&stop).await {
            Startup::Synced => debug!(controller = %name, "caches synced"),
            Startup::Stopped => {
                info!(controller = %name, "stopped before caches synced");
                self.queue.shut_down();
                let _ = informer.await;
                return Ok(());
            }
            Startup::TimedOut(after) => {
                error!(controller = %name, ?after, "timed out waiting for caches to sync");
                self.queue.shut_down();
                informer_stop.cancel();
                let _ = informer.await;
                return Err(ControllerError::CacheSyncTimeout(after));
            }
        }

        let workers: Vec<_> = (0..self.config.workers)
            .map(|id| {
                let this = Arc::clone(&self);
                let stop = stop.clone();
                tokio::spawn(async move { this.run_worker(id, stop).await })
            })
            .collect();

        stop.cancelled().await;
        info!(controller = %name, "stopping controller");
        self.queue.shut_down();

        let mut failed = None;
        for res in futures::future::join_all(workers).await {
            if let Err(e) = res {
                warn!(controller = %name, error = %e, "worker task failed");
                failed.get_or_insert_with(|| ControllerError::Join(e.to_string()));
            }
        }
        if let Err(e) = informer.await {
            warn!(controller = %name, error = %e, "informer task failed");
        }
        info!(controller = %name, "controller stopped");
        failed.map_or(Ok(()), Err)
    }
}
