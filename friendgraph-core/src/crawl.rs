use friendgraph_crawler::crawler::{CancelFlag, Crawler, ProgressCallback, RetryPolicy};
use friendgraph_crawler::error::CrawlError;
use friendgraph_crawler::model::{CrawlJob, GraphArtifact, JobState};
use friendgraph_crawler::source::{ProfileSource, SteamSource};
use friendgraph_crawler::store::Store;
use friendgraph_crawler::validate::{is_valid_job_id, validate_request};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{Instrument, Span, error, info, warn};

use crate::aggregate;
use crate::config::Config;
use crate::data::SqliteStore;
use crate::error::CoreError;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Options for configuring crawl jobs started by a [`CrawlService`]
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
    /// See [`Crawler::with_profile_reuse`]
    pub profile_reuse: Option<Duration>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(10),
            profile_reuse: None,
        }
    }
}

impl CrawlOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.crawl_workers,
            retry: RetryPolicy::new(config.retry_attempts, RETRY_BASE_DELAY),
            fetch_timeout: config.fetch_timeout,
            profile_reuse: config.profile_max_age,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlRequest {
    pub origins: Vec<String>,
    pub depth: u32,
    /// Caller-chosen job ID; one is generated when absent
    pub job_id: Option<String>,
    /// Crawl again even if a finished job for the same input exists
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTicket {
    /// A new job was created
    Started(String),
    /// A finished job for the same origins and depth was reused
    Existing(String),
}

impl CrawlTicket {
    pub fn job_id(&self) -> &str {
        match self {
            CrawlTicket::Started(id) | CrawlTicket::Existing(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, CrawlTicket::Started(_))
    }
}

enum Prepared {
    Existing(CrawlJob),
    New(CrawlJob, CancelFlag),
}

/// Entry point for everything that starts, inspects, cancels or aggregates
/// crawl jobs. Jobs started here run on the tokio runtime in the background.
pub struct CrawlService<S> {
    store: Arc<S>,
    source: Arc<dyn ProfileSource>,
    options: CrawlOptions,
    span: Span,
    running: Arc<Mutex<HashMap<String, CancelFlag>>>,
}

impl<S> CrawlService<S>
where
    S: Store + 'static,
{
    pub fn new(store: Arc<S>, source: Arc<dyn ProfileSource>, options: CrawlOptions) -> Self {
        Self {
            store,
            source,
            options,
            span: Span::none(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Service span every job span is parented to.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn crawler(&self, progress: Option<ProgressCallback>) -> Crawler<S> {
        let crawler = Crawler::new(self.source.clone(), self.store.clone())
            .with_workers(self.options.workers)
            .with_retry_policy(self.options.retry.clone())
            .with_fetch_timeout(self.options.fetch_timeout)
            .with_store_timeout(self.options.store_timeout)
            .with_profile_reuse(self.options.profile_reuse)
            .with_span(self.span.clone());
        match progress {
            Some(callback) => crawler.with_progress_callback(callback),
            None => crawler,
        }
    }

    async fn prepare(&self, request: CrawlRequest) -> Result<Prepared, CrawlError> {
        let origins = validate_request(&request.origins, request.depth)?;

        if let Some(ref job_id) = request.job_id {
            if !is_valid_job_id(job_id) {
                return Err(CrawlError::InvalidInput(format!("invalid job id '{}'", job_id)));
            }
            if self.store.get_job(job_id).await?.is_some() {
                return Err(CrawlError::InvalidInput(format!(
                    "job id '{}' is already in use",
                    job_id
                )));
            }
        }

        if !request.force
            && let Some(existing) = self.store.find_reusable_job(&origins, request.depth).await?
        {
            info!(
                "Reusing job {} for {:?} at depth {}",
                existing.job_id, origins, request.depth
            );
            return Ok(Prepared::Existing(existing));
        }

        let job_id = request
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let job = CrawlJob::new(job_id, origins, request.depth);
        self.store.create_job(&job).await?;

        let cancel = CancelFlag::new();
        lock(&self.running).insert(job.job_id.clone(), cancel.clone());
        Ok(Prepared::New(job, cancel))
    }

    /// Starts a crawl in the background, or points at a finished job with the
    /// same origins and depth.
    pub async fn request_crawl(&self, request: CrawlRequest) -> Result<CrawlTicket, CrawlError> {
        match self.prepare(request).await? {
            Prepared::Existing(job) => Ok(CrawlTicket::Existing(job.job_id)),
            Prepared::New(job, cancel) => {
                let job_id = job.job_id.clone();
                self.spawn(job, cancel, false);
                Ok(CrawlTicket::Started(job_id))
            }
        }
    }

    /// Like [`request_crawl`](Self::request_crawl) but waits for the job to
    /// finish and returns its final status.
    pub async fn run_crawl(
        &self,
        request: CrawlRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<CrawlJob, CrawlError> {
        match self.prepare(request).await? {
            Prepared::Existing(job) => Ok(job),
            Prepared::New(job, cancel) => {
                let job_id = job.job_id.clone();
                let result = self.crawler(progress).run_job(job, cancel).await;
                lock(&self.running).remove(&job_id);
                result
            }
        }
    }

    fn spawn(&self, job: CrawlJob, cancel: CancelFlag, resume: bool) {
        let crawler = self.crawler(None).with_resume(resume);
        let running = self.running.clone();
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let job_id = job.job_id.clone();
                if let Err(e) = crawler.run_job(job, cancel).await {
                    error!("Crawl job {} aborted: {}", job_id, e);
                }
                lock(&running).remove(&job_id);
            }
            .instrument(span),
        );
    }

    /// Restarts jobs left `Pending` or `Running` by a previous process.
    /// Nodes those jobs already crawled are read back from the store.
    pub async fn resume_interrupted(&self) -> Result<Vec<String>, CrawlError> {
        let mut resumed = Vec::new();
        for stored in self.store.unfinished_jobs().await? {
            if lock(&self.running).contains_key(&stored.job_id) {
                continue;
            }
            warn!("Resuming interrupted crawl job {}", stored.job_id);
            let mut job = CrawlJob::new(stored.job_id.clone(), stored.origins, stored.max_depth);
            job.started_at = stored.started_at;

            let cancel = CancelFlag::new();
            lock(&self.running).insert(job.job_id.clone(), cancel.clone());
            resumed.push(job.job_id.clone());
            self.spawn(job, cancel, true);
        }
        Ok(resumed)
    }

    pub async fn status(&self, job_id: &str) -> Result<CrawlJob, CrawlError> {
        check_job_id(job_id)?;
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CrawlError::NotFound(job_id.to_string()))
    }

    /// Polls until the job reaches a terminal state.
    pub async fn wait_for(&self, job_id: &str, poll: Duration) -> Result<CrawlJob, CrawlError> {
        loop {
            let job = self.status(job_id).await?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancels a job. A pending job, or one no live worker pool owns, is
    /// cancelled at once; a running one stops at its workers' next dequeue.
    pub async fn cancel(&self, job_id: &str) -> Result<CrawlJob, CrawlError> {
        let mut job = self.status(job_id).await?;
        if job.state.is_terminal() {
            return Err(CrawlError::InvalidTransition {
                from: job.state,
                to: JobState::Cancelled,
            });
        }

        let flag = lock(&self.running).get(job_id).cloned();
        match flag {
            Some(flag) if job.state == JobState::Running => {
                info!("Cancellation requested for running job {}", job_id);
                flag.cancel();
            }
            flag => {
                if let Some(flag) = flag {
                    flag.cancel();
                }
                job.transition(JobState::Cancelled)?;
                self.store.update_job(&job).await?;
                info!("Job {} cancelled", job_id);
            }
        }
        Ok(job)
    }

    pub async fn create_graph(&self, job_id: &str) -> Result<GraphArtifact, CrawlError> {
        check_job_id(job_id)?;
        aggregate::create_graph(self.store.as_ref(), job_id).await
    }

    pub async fn graph(&self, job_id: &str) -> Result<GraphArtifact, CrawlError> {
        check_job_id(job_id)?;
        self.store
            .get_graph(job_id)
            .await?
            .ok_or_else(|| CrawlError::NotFound(format!("no graph for job {}", job_id)))
    }

    pub fn running_jobs(&self) -> usize {
        lock(&self.running).len()
    }
}

impl CrawlService<SqliteStore> {
    /// Opens the configured database, creating its directory if needed, and
    /// connects a Steam source with the configured key and timeout.
    pub fn from_config(config: &Config) -> Result<Self, CoreError> {
        if let Some(parent) = config.database_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let store = Arc::new(SqliteStore::open(&config.database_path)?);
        let source = Arc::new(SteamSource::new(
            config.steam_api_key.clone(),
            config.fetch_timeout,
        )?);
        Ok(Self::new(store, source, CrawlOptions::from_config(config)))
    }
}

fn check_job_id(job_id: &str) -> Result<(), CrawlError> {
    if is_valid_job_id(job_id) {
        Ok(())
    } else {
        Err(CrawlError::InvalidInput(format!("invalid job id '{}'", job_id)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spinner that counts processed profiles, plus the callback that drives it.
pub fn progress_spinner() -> (Arc<ProgressBar>, ProgressCallback) {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("Starting crawl...");
    pb.enable_steady_tick(Duration::from_millis(120));
    let pb = Arc::new(pb);

    let processed = Arc::new(AtomicUsize::new(0));
    let pb_clone = pb.clone();
    let callback: ProgressCallback = Arc::new(move |_worker_id: usize, profile_id: String| {
        let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
        pb_clone.set_message(format!(
            "Crawling... {} profiles processed (last: {})",
            count, profile_id
        ));
    });
    (pb, callback)
}
