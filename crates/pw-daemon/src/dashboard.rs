//! Monitoring dashboard for the reconcile daemon.
//!
//! Provides HTTP endpoints for health checks, Prometheus metrics, queue
//! statistics and the list of jobs that exhausted their retries.

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pw_core::JobStatus;
use pw_storage::{Database, JobCounts};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::BatchReport;

/// Maximum failed jobs returned by `/jobs/failed`.
const FAILED_JOBS_LIMIT: usize = 100;

/// Statistics tracked by the daemon.
#[derive(Debug, Clone)]
pub struct DaemonStats {
    /// Jobs reconciled successfully since startup
    pub jobs_processed: Arc<AtomicU64>,
    /// Failed attempts that were scheduled for retry
    pub jobs_retried: Arc<AtomicU64>,
    /// Jobs parked after exhausting their attempts
    pub jobs_failed: Arc<AtomicU64>,
    /// Lead assignment rows opened
    pub assignments_added: Arc<AtomicU64>,
    /// Lead assignment rows closed
    pub assignments_removed: Arc<AtomicU64>,
    /// Sweeps enqueued (startup and periodic)
    pub sweeps_run: Arc<AtomicU64>,
    /// Duration of the last non-empty batch in microseconds
    pub last_batch_duration_us: Arc<AtomicU64>,
    /// When the daemon started
    pub uptime_started: Instant,
}

impl DaemonStats {
    pub fn new() -> Self {
        Self {
            jobs_processed: Arc::new(AtomicU64::new(0)),
            jobs_retried: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
            assignments_added: Arc::new(AtomicU64::new(0)),
            assignments_removed: Arc::new(AtomicU64::new(0)),
            sweeps_run: Arc::new(AtomicU64::new(0)),
            last_batch_duration_us: Arc::new(AtomicU64::new(0)),
            uptime_started: Instant::now(),
        }
    }

    /// Fold one batch into the counters. Empty batches only cost a poll.
    pub fn record_batch(&self, report: &BatchReport, duration: Duration) {
        if report.is_empty() {
            return;
        }
        self.jobs_processed
            .fetch_add(report.completed as u64, Ordering::Relaxed);
        self.jobs_retried
            .fetch_add(report.retried as u64, Ordering::Relaxed);
        self.jobs_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.assignments_added
            .fetch_add(report.assignments_added as u64, Ordering::Relaxed);
        self.assignments_removed
            .fetch_add(report.assignments_removed as u64, Ordering::Relaxed);
        self.last_batch_duration_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn increment_sweeps_run(&self) {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.uptime_started.elapsed()
    }
}

impl Default for DaemonStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for dashboard server.
#[derive(Clone)]
struct DashboardState {
    stats: Arc<DaemonStats>,
    storage: Option<Arc<RwLock<Database>>>,
}

/// Dashboard HTTP server.
pub struct DashboardServer {
    bind_addr: SocketAddr,
    state: DashboardState,
}

impl DashboardServer {
    /// Create a new dashboard server.
    ///
    /// Without `storage` the queue endpoints answer 503.
    pub fn new(
        bind_addr: SocketAddr,
        stats: Arc<DaemonStats>,
        storage: Option<Arc<RwLock<Database>>>,
    ) -> Self {
        Self {
            bind_addr,
            state: DashboardState { stats, storage },
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/", get(handle_root))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .route("/stats", get(handle_stats))
            .route("/jobs/failed", get(handle_failed_jobs))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the listener and serve in a background task.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(self) -> crate::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router();

        info!("Starting dashboard server on http://{}", local_addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Dashboard server error: {}", e);
            }
        });

        Ok(local_addr)
    }
}

async fn handle_root() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Patchwork Reconciler</title>
    <style>
        body { font-family: sans-serif; margin: 40px; }
        li { margin: 10px 0; }
        code { background: #eee; padding: 2px 6px; }
    </style>
</head>
<body>
    <h1>Patchwork Reconciler</h1>
    <ul>
        <li><a href="/health"><code>GET /health</code></a> - Health check (JSON)</li>
        <li><a href="/metrics"><code>GET /metrics</code></a> - Prometheus metrics (text)</li>
        <li><a href="/stats"><code>GET /stats</code></a> - Counters and queue depth (JSON)</li>
        <li><a href="/jobs/failed"><code>GET /jobs/failed</code></a> - Parked jobs (JSON)</li>
    </ul>
</body>
</html>"#,
    )
}

async fn handle_health(State(state): State<DashboardState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.stats.uptime().as_secs(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
}

async fn queue_counts(state: &DashboardState) -> Option<JobCounts> {
    let storage = state.storage.as_ref()?;
    let db = storage.read().await;
    match db.job_counts().await {
        Ok(counts) => Some(counts),
        Err(e) => {
            error!("Failed to read job counts: {}", e);
            None
        }
    }
}

/// Prometheus-style metrics endpoint.
async fn handle_metrics(State(state): State<DashboardState>) -> Response {
    let stats = &state.stats;
    let mut metrics = String::new();

    let counters = [
        ("jobs_processed", "Reconcile jobs completed", &stats.jobs_processed),
        ("jobs_retried", "Failed attempts scheduled for retry", &stats.jobs_retried),
        ("jobs_failed", "Jobs parked after exhausting attempts", &stats.jobs_failed),
        ("assignments_added", "Lead assignment rows opened", &stats.assignments_added),
        ("assignments_removed", "Lead assignment rows closed", &stats.assignments_removed),
        ("sweeps_run", "Full sweeps enqueued", &stats.sweeps_run),
    ];
    for (name, help, value) in counters {
        metrics.push_str(&format!(
            "# HELP patchwork_{name} {help}\n# TYPE patchwork_{name} counter\npatchwork_{name} {}\n\n",
            value.load(Ordering::Relaxed)
        ));
    }

    metrics.push_str(&format!(
        "# HELP patchwork_last_batch_duration_microseconds Duration of last batch\n\
         # TYPE patchwork_last_batch_duration_microseconds gauge\n\
         patchwork_last_batch_duration_microseconds {}\n\n",
        stats.last_batch_duration_us.load(Ordering::Relaxed)
    ));

    if let Some(counts) = queue_counts(&state).await {
        metrics.push_str(
            "# HELP patchwork_queue_jobs Reconcile jobs by status\n# TYPE patchwork_queue_jobs gauge\n",
        );
        for (status, value) in [
            (JobStatus::Pending, counts.pending),
            (JobStatus::Running, counts.running),
            (JobStatus::Done, counts.done),
            (JobStatus::Failed, counts.failed),
        ] {
            metrics.push_str(&format!(
                "patchwork_queue_jobs{{status=\"{}\"}} {}\n",
                status, value
            ));
        }
        metrics.push('\n');
    }

    metrics.push_str(&format!(
        "# HELP patchwork_uptime_seconds Daemon uptime in seconds\n\
         # TYPE patchwork_uptime_seconds counter\n\
         patchwork_uptime_seconds {}\n",
        stats.uptime().as_secs()
    ));

    (StatusCode::OK, [("Content-Type", "text/plain")], metrics).into_response()
}

async fn handle_stats(State(state): State<DashboardState>) -> Json<StatsResponse> {
    let stats = &state.stats;

    Json(StatsResponse {
        jobs_processed: stats.jobs_processed.load(Ordering::Relaxed),
        jobs_retried: stats.jobs_retried.load(Ordering::Relaxed),
        jobs_failed: stats.jobs_failed.load(Ordering::Relaxed),
        assignments_added: stats.assignments_added.load(Ordering::Relaxed),
        assignments_removed: stats.assignments_removed.load(Ordering::Relaxed),
        sweeps_run: stats.sweeps_run.load(Ordering::Relaxed),
        last_batch_duration_us: stats.last_batch_duration_us.load(Ordering::Relaxed),
        uptime_seconds: stats.uptime().as_secs(),
        queue: queue_counts(&state).await,
    })
}

#[derive(Serialize)]
struct StatsResponse {
    jobs_processed: u64,
    jobs_retried: u64,
    jobs_failed: u64,
    assignments_added: u64,
    assignments_removed: u64,
    sweeps_run: u64,
    last_batch_duration_us: u64,
    uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<JobCounts>,
}

/// Jobs parked as `failed`, newest first (requires database).
async fn handle_failed_jobs(State(state): State<DashboardState>) -> Response {
    let Some(storage) = &state.storage else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "Database not available" })),
        )
            .into_response();
    };

    let db = storage.read().await;
    match db.list_jobs(Some(JobStatus::Failed), FAILED_JOBS_LIMIT).await {
        Ok(jobs) => Json(FailedJobsResponse {
            count: jobs.len(),
            jobs: jobs
                .into_iter()
                .map(|job| FailedJob {
                    id: job.id,
                    coordinator_id: job.coordinator_id,
                    attempts: job.attempts,
                    last_error: job.last_error,
                })
                .collect(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("Failed to list jobs: {}", e) })),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct FailedJobsResponse {
    count: usize,
    jobs: Vec<FailedJob>,
}

#[derive(Serialize)]
struct FailedJob {
    id: String,
    coordinator_id: String,
    attempts: i64,
    last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(&db_path).await.unwrap();
        db.init_schema().await.unwrap();
        (db, temp_dir)
    }

    fn state_without_storage(stats: Arc<DaemonStats>) -> DashboardState {
        DashboardState {
            stats,
            storage: None,
        }
    }

    async fn body_string(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[test]
    fn test_record_batch() {
        let stats = DaemonStats::new();
        stats.record_batch(
            &BatchReport {
                claimed: 3,
                completed: 2,
                retried: 1,
                assignments_added: 5,
                assignments_removed: 1,
                ..Default::default()
            },
            Duration::from_millis(150),
        );

        assert_eq!(stats.jobs_processed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.jobs_retried.load(Ordering::Relaxed), 1);
        assert_eq!(stats.assignments_added.load(Ordering::Relaxed), 5);
        assert_eq!(stats.assignments_removed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.last_batch_duration_us.load(Ordering::Relaxed), 150_000);
    }

    #[test]
    fn test_empty_batch_keeps_last_duration() {
        let stats = DaemonStats::new();
        stats.record_batch(
            &BatchReport {
                claimed: 1,
                completed: 1,
                ..Default::default()
            },
            Duration::from_millis(20),
        );
        stats.record_batch(&BatchReport::default(), Duration::from_millis(1));

        assert_eq!(stats.last_batch_duration_us.load(Ordering::Relaxed), 20_000);
    }

    #[tokio::test]
    async fn test_dashboard_health_endpoint() {
        let state = state_without_storage(Arc::new(DaemonStats::new()));

        let response = handle_health(State(state)).await;
        assert_eq!(response.0.status, "ok");
    }

    #[tokio::test]
    async fn test_dashboard_stats_includes_queue() {
        let (db, _temp_dir) = create_test_db().await;
        db.enqueue("lead-1", "test").await.unwrap();

        let stats = Arc::new(DaemonStats::new());
        stats.increment_sweeps_run();
        let state = DashboardState {
            stats,
            storage: Some(Arc::new(RwLock::new(db))),
        };

        let response = handle_stats(State(state)).await;
        assert_eq!(response.0.sweeps_run, 1);
        assert_eq!(response.0.queue.map(|q| q.pending), Some(1));
    }

    #[tokio::test]
    async fn test_failed_jobs_without_storage() {
        let state = state_without_storage(Arc::new(DaemonStats::new()));

        let response = handle_failed_jobs(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_failed_jobs_lists_parked_jobs() {
        let (mut db, _temp_dir) = create_test_db().await;
        db.enqueue("lead-1", "test").await.unwrap();
        let job = db.claim_jobs(1).await.unwrap().remove(0);
        db.fail_job(&job.id, "boom", 1, Duration::ZERO).await.unwrap();

        let state = DashboardState {
            stats: Arc::new(DaemonStats::new()),
            storage: Some(Arc::new(RwLock::new(db))),
        };

        let response = handle_failed_jobs(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("\"count\":1"));
        assert!(body.contains("boom"));
    }

    #[tokio::test]
    async fn test_dashboard_metrics_format() {
        let stats = Arc::new(DaemonStats::new());
        stats.record_batch(
            &BatchReport {
                claimed: 1,
                completed: 1,
                ..Default::default()
            },
            Duration::from_millis(1),
        );

        let response = handle_metrics(State(state_without_storage(stats))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert!(body.contains("# HELP patchwork_jobs_processed"));
        assert!(body.contains("# TYPE patchwork_jobs_processed counter"));
        assert!(body.contains("patchwork_jobs_processed 1"));
        assert!(!body.contains("patchwork_queue_jobs"));
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = DashboardServer::new(addr, Arc::new(DaemonStats::new()), None);

        let bound = server.start().await.unwrap();
        assert_ne!(bound.port(), 0);
    }
}
