//! Reconcile worker daemon for patchwork.
//!
//! In queued mode hierarchy writes only record `reconcile_jobs` rows. This
//! crate runs the worker pool that applies them.
//!
//! # Features
//!
//! - **Stale job recovery**: jobs left `running` by a crashed worker are requeued on startup
//! - **Cold-start sweep**: every active lead gets a job when the daemon starts
//! - **Worker pool**: `worker_count` tasks claim batches and reconcile each job
//! - **Retry with backoff**: failed jobs are retried, then parked as `failed`
//! - **Periodic sweep**: catches link expiry, which no write triggers, and prunes old `done` jobs
//! - **Graceful shutdown**: workers finish their batch, then the queue is drained
//! - **Optional Dashboard**: HTTP monitoring server (enable with `dashboard` feature)
//!
//! # Example
//!
//! ```no_run
//! use pw_daemon::{Daemon, DaemonConfig};
//! use pw_storage::Database;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::RwLock;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open(".patchwork/patchwork.db").await?;
//! let storage = Arc::new(RwLock::new(db));
//!
//! let config = DaemonConfig {
//!     worker_count: 4,
//!     poll_interval: Duration::from_millis(100),
//!     ..Default::default()
//! };
//!
//! let mut daemon = Daemon::new_with_config(storage, config);
//! let shutdown = daemon.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     let _ = shutdown.send(()).await;
//! });
//! daemon.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Dashboard Feature
//!
//! ```toml
//! pw-daemon = { version = "0.1", features = ["dashboard"] }
//! ```
//!
//! ```no_run
//! # #[cfg(feature = "dashboard")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use pw_daemon::dashboard::{DashboardServer, DaemonStats};
//! use std::sync::Arc;
//!
//! let stats = Arc::new(DaemonStats::new());
//! let addr = "127.0.0.1:8787".parse()?;
//! let server = DashboardServer::new(addr, stats, None);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

// Optional dashboard feature
#[cfg(feature = "dashboard")]
pub mod dashboard;

use pw_core::{Actor, JobStatus, ReconcileJob, WorkerSettings};
use pw_storage::{Database, DbError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors surfaced by the daemon.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Daemon is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Number of worker tasks.
    /// Default: 2
    pub worker_count: usize,

    /// How often an idle worker checks for runnable jobs.
    /// Default: 250ms
    pub poll_interval: Duration,

    /// Maximum jobs a worker claims per poll.
    /// Default: 16
    pub batch_size: usize,

    /// Attempts before a job is parked as `failed`.
    /// Default: 5
    pub max_attempts: u32,

    /// Base retry delay, multiplied by the attempt count.
    /// Default: 500ms
    pub retry_backoff: Duration,

    /// Interval between full sweeps. `Duration::ZERO` disables them.
    /// Default: 1 hour
    pub sweep_interval: Duration,

    /// Enqueue every active lead when the daemon starts.
    /// Default: true
    pub sweep_on_startup: bool,

    /// Age after which `done` jobs are pruned by the periodic sweep.
    /// `Duration::ZERO` keeps them forever.
    /// Default: 24 hours
    pub done_retention: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for DaemonConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            worker_count: settings.worker_count.max(1),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            batch_size: settings.batch_size.max(1),
            max_attempts: settings.max_attempts,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            sweep_on_startup: true,
            done_retention: Duration::from_secs(settings.done_retention_secs),
        }
    }
}

/// What one pass over the queue did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Jobs handed back to `pending` after their status update failed.
    pub released: usize,
    pub assignments_added: usize,
    pub assignments_removed: usize,
}

impl BatchReport {
    pub fn merge(&mut self, other: &BatchReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
        self.released += other.released;
        self.assignments_added += other.assignments_added;
        self.assignments_removed += other.assignments_removed;
    }

    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Worker pool that drains `reconcile_jobs`.
pub struct Daemon {
    storage: Arc<RwLock<Database>>,
    config: DaemonConfig,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    #[cfg(feature = "dashboard")]
    stats: Option<Arc<dashboard::DaemonStats>>,
}

impl Daemon {
    /// Create a new daemon instance with default configuration.
    pub fn new(storage: Arc<RwLock<Database>>) -> Self {
        Self::new_with_config(storage, DaemonConfig::default())
    }

    /// Create a new daemon instance with custom configuration.
    pub fn new_with_config(storage: Arc<RwLock<Database>>, config: DaemonConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            storage,
            config,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            #[cfg(feature = "dashboard")]
            stats: None,
        }
    }

    /// Enable dashboard statistics tracking.
    #[cfg(feature = "dashboard")]
    pub fn with_stats(mut self, stats: Arc<dashboard::DaemonStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Get a reference to the dashboard statistics (if enabled).
    #[cfg(feature = "dashboard")]
    pub fn stats(&self) -> Option<Arc<dashboard::DaemonStats>> {
        self.stats.clone()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Sender that stops a running daemon; usable from another task.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Start the daemon.
    ///
    /// Blocks until a shutdown signal arrives. It performs the following steps:
    /// 1. Requeue jobs a previous run left `running`
    /// 2. Enqueue a cold-start sweep
    /// 3. Launch worker tasks and the periodic sweeper
    /// 4. On shutdown, let workers finish their batch and drain the queue
    pub async fn run(&mut self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.take().ok_or(DaemonError::AlreadyRunning)?;
        info!(
            "Starting daemon with {} workers (batch {}, poll {:?})",
            self.config.worker_count, self.config.batch_size, self.config.poll_interval
        );

        {
            let db = self.storage.read().await;
            let requeued = db.requeue_running_jobs().await?;
            if requeued > 0 {
                info!("Requeued {} stale running jobs", requeued);
            }
        }

        if self.config.sweep_on_startup {
            self.sweep().await?;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for worker_id in 0..self.config.worker_count {
            let ctx = self.context();
            let stop_rx = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                ctx.worker_loop(worker_id, stop_rx).await;
            }));
        }

        if !self.config.sweep_interval.is_zero() {
            let ctx = self.context();
            let stop_rx = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                ctx.periodic_sweep(stop_rx).await;
            }));
        }

        let _ = shutdown_rx.recv().await;
        info!("Received shutdown signal");

        let _ = stop_tx.send(true);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }

        info!("Draining remaining jobs...");
        let report = self.drain().await?;
        info!(
            "Daemon stopped ({} jobs drained, {} failed)",
            report.completed, report.failed
        );

        Ok(())
    }

    /// Enqueue a reconcile job for every active lead.
    pub async fn sweep(&self) -> Result<usize> {
        self.context().sweep().await
    }

    /// Process runnable jobs until none are left.
    ///
    /// Jobs waiting out a retry backoff are left for a later run.
    pub async fn drain(&self) -> Result<BatchReport> {
        let ctx = self.context();
        let mut total = BatchReport::default();
        loop {
            let report = ctx.timed_batch().await?;
            if report.is_empty() {
                break;
            }
            total.merge(&report);
        }
        Ok(total)
    }

    /// Claim one batch and reconcile each job in it.
    ///
    /// A job that fails is retried or parked; it never aborts the batch.
    pub async fn process_batch(
        storage: &Arc<RwLock<Database>>,
        config: &DaemonConfig,
    ) -> Result<BatchReport> {
        let jobs = storage.write().await.claim_jobs(config.batch_size).await?;
        let report = process_jobs(storage, config, &jobs).await;

        if !report.is_empty() {
            debug!(
                "Batch done: {} claimed, {} completed, {} retried, {} failed",
                report.claimed, report.completed, report.retried, report.failed
            );
        }

        Ok(report)
    }

    /// Stop the daemon gracefully.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping daemon");
        let _ = self.shutdown_tx.send(()).await;
        Ok(())
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            storage: self.storage.clone(),
            config: self.config.clone(),
            #[cfg(feature = "dashboard")]
            stats: self.stats.clone(),
        }
    }
}

/// Run every claimed job. A job whose status update fails goes back to
/// `pending` so it is not stranded in `running`; the rest still run.
async fn process_jobs(
    storage: &Arc<RwLock<Database>>,
    config: &DaemonConfig,
    jobs: &[ReconcileJob],
) -> BatchReport {
    let mut report = BatchReport {
        claimed: jobs.len(),
        ..Default::default()
    };

    for job in jobs {
        if let Err(e) = process_job(storage, config, job, &mut report).await {
            error!(
                "Could not record result of job {} for {}: {}",
                job.id, job.coordinator_id, e
            );
            match storage.read().await.release_job(&job.id).await {
                Ok(true) => report.released += 1,
                Ok(false) => {}
                Err(e) => error!("Could not release job {}: {}", job.id, e),
            }
        }
    }

    report
}

async fn process_job(
    storage: &Arc<RwLock<Database>>,
    config: &DaemonConfig,
    job: &ReconcileJob,
    report: &mut BatchReport,
) -> Result<()> {
    let mut db = storage.write().await;

    match db.reconcile(&job.coordinator_id).await {
        Ok(outcome) => {
            db.complete_job(&job.id).await?;
            report.completed += 1;
            report.assignments_added += outcome.added;
            report.assignments_removed += outcome.removed;
        }
        Err(e) => {
            let status = db
                .fail_job(
                    &job.id,
                    &e.to_string(),
                    config.max_attempts,
                    config.retry_backoff,
                )
                .await?;
            match status {
                JobStatus::Failed => {
                    error!(
                        "Giving up on {} after {} attempts: {}",
                        job.coordinator_id, job.attempts, e
                    );
                    report.failed += 1;
                }
                _ => {
                    warn!("Reconcile of {} failed, will retry: {}", job.coordinator_id, e);
                    report.retried += 1;
                }
            }
        }
    }

    Ok(())
}

/// Everything a background task needs, cloned out of the daemon.
#[derive(Clone)]
struct WorkerContext {
    storage: Arc<RwLock<Database>>,
    config: DaemonConfig,
    #[cfg(feature = "dashboard")]
    stats: Option<Arc<dashboard::DaemonStats>>,
}

impl WorkerContext {
    async fn timed_batch(&self) -> Result<BatchReport> {
        let started = Instant::now();
        let report = Daemon::process_batch(&self.storage, &self.config).await?;

        #[cfg(feature = "dashboard")]
        {
            if let Some(stats) = &self.stats {
                stats.record_batch(&report, started.elapsed());
            }
        }
        #[cfg(not(feature = "dashboard"))]
        let _ = started;

        Ok(report)
    }

    async fn sweep(&self) -> Result<usize> {
        let inserted = self
            .storage
            .write()
            .await
            .enqueue_sweep(&Actor::System)
            .await?;
        info!("Sweep enqueued {} jobs", inserted);

        #[cfg(feature = "dashboard")]
        {
            if let Some(stats) = &self.stats {
                stats.increment_sweeps_run();
            }
        }

        Ok(inserted)
    }

    async fn prune(&self) -> Result<u64> {
        if self.config.done_retention.is_zero() {
            return Ok(0);
        }
        let removed = self
            .storage
            .read()
            .await
            .prune_done_jobs(self.config.done_retention)
            .await?;
        if removed > 0 {
            info!("Pruned {} finished jobs", removed);
        }
        Ok(removed)
    }

    /// Worker task: poll, process, repeat until told to stop.
    async fn worker_loop(self, worker_id: usize, mut stop_rx: watch::Receiver<bool>) {
        debug!("Worker {} started", worker_id);
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.changed() => break,
            }

            // keep going while batches come back full
            loop {
                let report = match self.timed_batch().await {
                    Ok(report) => report,
                    Err(e) => {
                        error!("Worker {} failed to process batch: {}", worker_id, e);
                        break;
                    }
                };
                if report.claimed < self.config.batch_size || *stop_rx.borrow() {
                    break;
                }
            }
        }

        debug!("Worker {} stopped", worker_id);
    }

    /// Background task that periodically enqueues a full sweep.
    async fn periodic_sweep(self, mut stop_rx: watch::Receiver<bool>) {
        let period = self.config.sweep_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.changed() => break,
            }

            debug!("Periodic sweep");
            if let Err(e) = self.sweep().await {
                error!("Periodic sweep failed: {}", e);
            }
            if let Err(e) = self.prune().await {
                error!("Pruning finished jobs failed: {}", e);
            }
        }
    }
}
