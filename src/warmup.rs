//! Startup warmup of the local store
//!
//! A pass over one module scans the remote store, keeps the entries that
//! still have a useful lifetime ahead of them and copies them into the
//! local region of the same name, longest-lived first. Batches run on a
//! bounded pool, each under its own timeout. A failed or timed-out batch is
//! counted and the pass moves on.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::FutureExt;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    config::WarmupConfig,
    entry::derive_local_ttl,
    error::Result,
    invalidation::InvalidationTracker,
    key::CacheKeyGenerator,
    local::LocalStore,
    remote::RemoteStore,
};

/// A remote entry selected for loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupCandidate {
    pub identifier: String,
    pub remote_key: String,
    pub remaining_ttl_seconds: i64,
}

/// Outcome of one warmup pass over a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupReport {
    pub module: String,
    /// Remote keys matched by the scan
    pub scanned: usize,
    /// Keys left after filtering and capping
    pub candidates: usize,
    pub loaded: usize,
    pub failed: usize,
    /// Vanished, invalidated, or not started because of shutdown
    pub skipped: usize,
    pub elapsed: Duration,
}

impl WarmupReport {
    fn empty(module: &str) -> Self {
        Self {
            module: module.to_owned(),
            scanned: 0,
            candidates: 0,
            loaded: 0,
            failed: 0,
            skipped: 0,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    loaded: usize,
    failed: usize,
    skipped: usize,
}

enum LoadOutcome {
    Loaded,
    Skipped,
}

/// Copies long-lived remote entries into the local store
#[derive(Clone)]
pub struct WarmupLoader {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    tracker: InvalidationTracker,
    config: WarmupConfig,
    stopped: Arc<AtomicBool>,
}

impl WarmupLoader {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        tracker: InvalidationTracker,
        config: WarmupConfig,
    ) -> Self {
        Self {
            remote,
            local,
            tracker,
            config,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &WarmupConfig {
        &self.config
    }

    /// Run one pass over `module` on the current runtime
    pub async fn run(&self, module: &str) -> WarmupReport {
        let started = Instant::now();
        let mut report = WarmupReport::empty(module);
        if !self.config.enabled {
            return report;
        }

        let candidates = match self.collect_candidates(module, &mut report).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Warmup scan of module {} failed: {}", module, e);
                report.elapsed = started.elapsed();
                return report;
            }
        };
        report.candidates = candidates.len();

        let semaphore = Arc::new(Semaphore::new(self.config.thread_pool_size.max(1)));
        let mut batches = JoinSet::new();
        let mut pending = candidates.chunks(self.config.batch_size.max(1));

        // Permits are taken here, in order, so batches start longest-lived first
        for batch in pending.by_ref() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                report.skipped += batch.len();
                break;
            };
            if self.stopped.load(Ordering::SeqCst) {
                report.skipped += batch.len();
                break;
            }

            let loader = self.clone();
            let module = module.to_owned();
            let batch = batch.to_vec();
            batches.spawn(async move {
                let outcome = loader.run_batch(&module, &batch).await;
                drop(permit);
                outcome
            });
        }
        for batch in pending {
            report.skipped += batch.len();
        }

        while let Some(joined) = batches.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.loaded += outcome.loaded;
                    report.failed += outcome.failed;
                    report.skipped += outcome.skipped;
                }
                Err(e) => error!("Warmup batch task for module {} failed: {}", module, e),
            }
        }

        report.elapsed = started.elapsed();
        info!(
            "Warmup of module {} finished in {:?}: scanned={} candidates={} loaded={} failed={} skipped={}",
            module,
            report.elapsed,
            report.scanned,
            report.candidates,
            report.loaded,
            report.failed,
            report.skipped
        );
        report
    }

    /// Run passes over `modules` on a dedicated thread and return at once
    pub fn spawn(&self, modules: Vec<String>) -> WarmupHandle {
        let mut loader = self.clone();
        loader.stopped = Arc::new(AtomicBool::new(false));
        let stopped = Arc::clone(&loader.stopped);

        if !self.config.enabled {
            return WarmupHandle {
                stopped,
                thread: None,
                reports: modules.iter().map(|m| WarmupReport::empty(m)).collect(),
            };
        }

        let workers = self.config.thread_pool_size.max(1);
        let spawned = std::thread::Builder::new()
            .name("tiercache-warmup".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(workers)
                    .thread_name("tiercache-warmup-worker")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to create warmup runtime: {}", e);
                        return Vec::new();
                    }
                };

                runtime.block_on(async move {
                    let mut reports = Vec::with_capacity(modules.len());
                    for module in &modules {
                        if loader.stopped.load(Ordering::SeqCst) {
                            debug!("Warmup stopped before module {}", module);
                            break;
                        }
                        reports.push(loader.run(module).await);
                    }
                    reports
                })
            });

        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(e) => {
                error!("Failed to spawn warmup thread: {}", e);
                None
            }
        };

        WarmupHandle {
            stopped,
            thread,
            reports: Vec::new(),
        }
    }

    async fn collect_candidates(
        &self,
        module: &str,
        report: &mut WarmupReport,
    ) -> Result<Vec<WarmupCandidate>> {
        let keys = self
            .remote
            .scan(&CacheKeyGenerator::scan_pattern(module))
            .await?;
        report.scanned = keys.len();

        let mut candidates = Vec::new();
        for remote_key in keys {
            let Some(identifier) = CacheKeyGenerator::strip_module(module, &remote_key) else {
                continue;
            };
            let remaining_ttl_seconds = match self.remote.ttl(&remote_key).await {
                Ok(ttl) => ttl,
                Err(e) => {
                    warn!("Warmup TTL read for {} failed: {}", remote_key, e);
                    report.failed += 1;
                    continue;
                }
            };
            // Never-expiring (-1) and vanished (-2) keys fall out here too
            if remaining_ttl_seconds <= 0 || remaining_ttl_seconds <= self.config.min_ttl_seconds {
                continue;
            }
            candidates.push(WarmupCandidate {
                identifier: identifier.to_owned(),
                remaining_ttl_seconds,
                remote_key,
            });
        }

        candidates.sort_by(|a, b| {
            b.remaining_ttl_seconds
                .cmp(&a.remaining_ttl_seconds)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        candidates.truncate(self.config.max_count);
        Ok(candidates)
    }

    async fn run_batch(&self, module: &str, batch: &[WarmupCandidate]) -> BatchOutcome {
        let work = AssertUnwindSafe(self.load_batch(module, batch)).catch_unwind();
        match tokio::time::timeout(self.config.batch_timeout(), work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                error!("Warmup batch for module {} panicked", module);
                BatchOutcome {
                    failed: batch.len(),
                    ..BatchOutcome::default()
                }
            }
            Err(_) => {
                warn!(
                    "Warmup batch of {} entries for module {} timed out after {:?}",
                    batch.len(),
                    module,
                    self.config.batch_timeout()
                );
                BatchOutcome {
                    failed: batch.len(),
                    ..BatchOutcome::default()
                }
            }
        }
    }

    async fn load_batch(&self, module: &str, batch: &[WarmupCandidate]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for candidate in batch {
            match self.load_one(module, candidate).await {
                Ok(LoadOutcome::Loaded) => outcome.loaded += 1,
                Ok(LoadOutcome::Skipped) => outcome.skipped += 1,
                Err(e) => {
                    warn!("Warmup load of {} failed: {}", candidate.remote_key, e);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn load_one(&self, module: &str, candidate: &WarmupCandidate) -> Result<LoadOutcome> {
        let read_at = Utc::now();
        let Some(raw) = self.remote.get(&candidate.remote_key).await? else {
            return Ok(LoadOutcome::Skipped);
        };

        let local_ttl = derive_local_ttl(candidate.remaining_ttl_seconds);
        if local_ttl <= 0 {
            return Ok(LoadOutcome::Skipped);
        }

        let key = candidate.identifier.as_str();
        if self.tracker.is_stale(module, key, read_at).await {
            debug!("Skipping warmup of {}:{}: invalidated after read", module, key);
            return Ok(LoadOutcome::Skipped);
        }

        self.local.put(module, key, raw, local_ttl as u64).await;
        if self.tracker.is_stale(module, key, read_at).await {
            self.local.remove(module, key).await;
            return Ok(LoadOutcome::Skipped);
        }
        self.tracker.clear_if_older(module, key, read_at).await;
        Ok(LoadOutcome::Loaded)
    }
}

/// Running warmup started by [`WarmupLoader::spawn`]
pub struct WarmupHandle {
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<Vec<WarmupReport>>>,
    reports: Vec<WarmupReport>,
}

impl WarmupHandle {
    /// Stop scheduling batches. Batches already running finish.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Block until the warmup thread exits and return its reports.
    ///
    /// Blocks the calling thread; call it from outside the async runtime.
    pub fn wait(mut self) -> Vec<WarmupReport> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                error!("Warmup thread panicked");
                Vec::new()
            }),
            None => std::mem::take(&mut self.reports),
        }
    }
}
