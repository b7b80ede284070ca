use crate::error::{CrawlError, Result, SourceError, StoreError};
use crate::model::{
    ContentItem, CrawlJob, DiscoveredNode, FetchedProfile, JobState, NodeStatus,
    current_timestamp_ms,
};
use crate::source::ProfileSource;
use crate::store::{JobStore, ProfileStore, StoreResult};
use crate::validate::{is_valid_profile_id, validate_request};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

pub type ProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(8),
        }
    }

    /// Delay before retry number `attempt + 1` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Cooperative cancellation flag shared between a running job and
/// whoever may cancel it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded-depth breadth-first crawler over the friend graph.
///
/// Levels are processed one at a time by a pool of worker tasks, so the
/// depth recorded for every node is its shortest distance from the nearest
/// origin along the edges seen so far.
pub struct Crawler<S> {
    source: Arc<dyn ProfileSource>,
    store: Arc<S>,
    workers: usize,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    store_timeout: Duration,
    progress_callback: Option<ProgressCallback>,
    resume: bool,
    profile_reuse: Option<Duration>,
    span: Span,
}

impl<S> Crawler<S>
where
    S: JobStore + ProfileStore + 'static,
{
    pub fn new(source: Arc<dyn ProfileSource>, store: Arc<S>) -> Self {
        Self {
            source,
            store,
            workers: 4,
            retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(10),
            progress_callback: None,
            resume: false,
            profile_reuse: None,
            span: Span::none(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Reuse the stored records of nodes this job already crawled instead of
    /// fetching them again. Used when restarting an interrupted job.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Reuse profiles any job stored within the last `max_age` instead of
    /// fetching them again. A reused record is the snapshot taken when it
    /// was stored, not the profile's current state.
    pub fn with_profile_reuse(mut self, max_age: Option<Duration>) -> Self {
        self.profile_reuse = max_age;
        self
    }

    /// Parent span for the per-job spans this crawler opens.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Validates the request, records a new job and crawls it to completion.
    pub async fn crawl(&self, job_id: &str, origins: &[String], max_depth: u32) -> Result<CrawlJob> {
        let origins = validate_request(origins, max_depth)?;
        let job = CrawlJob::new(job_id, origins, max_depth);
        store_call(self.store_timeout, self.store.create_job(&job)).await?;
        self.run_job(job, CancelFlag::new()).await
    }

    /// Crawls a job that has already been recorded in the `Pending` state.
    ///
    /// If the job cannot be started or its workers fail, it is moved to
    /// `Cancelled` before the error is returned. When even that write fails
    /// the job stays unfinished for [`with_resume`](Self::with_resume).
    pub async fn run_job(&self, job: CrawlJob, cancel: CancelFlag) -> Result<CrawlJob> {
        let span = info_span!(
            parent: &self.span,
            "crawl_job",
            job_id = %job.job_id,
            max_depth = job.max_depth
        );
        let job_id = job.job_id.clone();
        async {
            let result = self.run_job_inner(job, cancel).await;
            if let Err(ref e) = result {
                self.abandon(&job_id, e).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn abandon(&self, job_id: &str, cause: &CrawlError) {
        error!("Cancelling job {} after error: {}", job_id, cause);
        let stored = match retry_store(&self.retry, self.store_timeout, || {
            self.store.get_job(job_id)
        })
        .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!("Job {} left unfinished for resume: {}", job_id, e);
                return;
            }
        };
        if stored.state.is_terminal() {
            return;
        }
        let mut job = stored;
        if job.transition(JobState::Cancelled).is_err() {
            return;
        }
        if let Err(e) =
            retry_store(&self.retry, self.store_timeout, || self.store.update_job(&job)).await
        {
            warn!("Job {} left unfinished for resume: {}", job_id, e);
        }
    }

    async fn run_job_inner(&self, mut job: CrawlJob, cancel: CancelFlag) -> Result<CrawlJob> {
        if cancel.is_cancelled() {
            job.transition(JobState::Cancelled)?;
            job.skipped = job.origins.len();
            for origin in &job.origins {
                let node = skipped_node(origin, origin, 0);
                retry_store(&self.retry, self.store_timeout, || {
                    self.store.save_node(&job.job_id, &node)
                })
                .await?;
            }
            retry_store(&self.retry, self.store_timeout, || self.store.update_job(&job)).await?;
            info!("Job cancelled before it started");
            return Ok(job);
        }

        let already_crawled: HashSet<String> = if self.resume {
            retry_store(&self.retry, self.store_timeout, || {
                self.store.job_nodes(&job.job_id)
            })
            .await?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Crawled)
            .map(|n| n.profile_id)
            .collect()
        } else {
            HashSet::new()
        };

        job.transition(JobState::Running)?;
        if self.resume {
            retry_store(&self.retry, self.store_timeout, || self.store.restart_job(&job)).await?;
        } else {
            retry_store(&self.retry, self.store_timeout, || self.store.update_job(&job)).await?;
        }
        info!(
            "Starting crawl of {:?} to depth {} with {} workers",
            job.origins, job.max_depth, self.workers
        );

        let ctx = Arc::new(JobContext {
            job_id: job.job_id.clone(),
            origins: job.origins.clone(),
            max_depth: job.max_depth,
            source: self.source.clone(),
            store: self.store.clone(),
            retry: self.retry.clone(),
            fetch_timeout: self.fetch_timeout,
            store_timeout: self.store_timeout,
            progress_callback: self.progress_callback.clone(),
            cancel,
            already_crawled,
            profile_reuse: self.profile_reuse,
            visited: Mutex::new(HashSet::new()),
            discovered: Mutex::new(
                job.origins
                    .iter()
                    .enumerate()
                    .map(|(idx, id)| {
                        let discovery = Discovery {
                            depth: 0,
                            seed: idx,
                            parent: None,
                        };
                        (id.clone(), discovery)
                    })
                    .collect(),
            ),
            content_cache: Mutex::new(HashMap::new()),
            progress: AsyncMutex::new(job.clone()),
        });

        let mut level: VecDeque<String> = job.origins.iter().cloned().collect();
        let mut depth = 0u32;

        while !level.is_empty() {
            debug!("Level {}: {} profiles", depth, level.len());
            let queue = Arc::new(Mutex::new(level));
            let next = Arc::new(Mutex::new(Vec::new()));
            let pool_size = self.workers.min(lock(&queue).len());

            let mut handles = Vec::with_capacity(pool_size);
            for worker_id in 0..pool_size {
                let ctx = ctx.clone();
                let queue = queue.clone();
                let next = next.clone();
                let handle = tokio::spawn(
                    async move {
                        debug!("Worker {} started", worker_id);
                        loop {
                            if ctx.cancel.is_cancelled() {
                                break;
                            }
                            let Some(profile_id) = lock(&queue).pop_front() else {
                                break;
                            };
                            ctx.process_node(worker_id, profile_id, depth, &next).await;
                        }
                        debug!("Worker {} finished", worker_id);
                    }
                    .in_current_span(),
                );
                handles.push(handle);
            }

            for result in futures::future::join_all(handles).await {
                result?;
            }

            let leftover: Vec<String> = lock(&queue).drain(..).collect();
            let next_level: Vec<String> = std::mem::take(&mut *lock(&next));

            if ctx.cancel.is_cancelled() {
                ctx.skip_remaining(&leftover, depth).await;
                ctx.skip_remaining(&next_level, depth + 1).await;
                break;
            }

            level = next_level.into_iter().collect();
            depth += 1;
        }

        let job = ctx.finish().await;
        info!(
            "Crawl {} finished as {}: {}/{} profiles, {} failed, {} skipped",
            job.job_id, job.state, job.completed, job.total_discovered, job.failed, job.skipped
        );
        Ok(job)
    }
}

#[derive(Debug, Clone)]
struct Discovery {
    depth: u32,
    /// Index into the job's origins
    seed: usize,
    /// Profile whose friend list this node was claimed from
    parent: Option<String>,
}

/// Shared state of one running job.
struct JobContext<S> {
    job_id: String,
    origins: Vec<String>,
    max_depth: u32,
    source: Arc<dyn ProfileSource>,
    store: Arc<S>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    store_timeout: Duration,
    progress_callback: Option<ProgressCallback>,
    cancel: CancelFlag,
    already_crawled: HashSet<String>,
    profile_reuse: Option<Duration>,
    visited: Mutex<HashSet<String>>,
    discovered: Mutex<HashMap<String, Discovery>>,
    content_cache: Mutex<HashMap<u64, ContentItem>>,
    progress: AsyncMutex<CrawlJob>,
}

impl<S> JobContext<S>
where
    S: JobStore + ProfileStore + 'static,
{
    async fn process_node(
        &self,
        worker_id: usize,
        profile_id: String,
        depth: u32,
        next: &Mutex<Vec<String>>,
    ) {
        if !lock(&self.visited).insert(profile_id.clone()) {
            debug!("{} already visited, skipping", profile_id);
            return;
        }

        if let Some(ref callback) = self.progress_callback {
            callback(worker_id, profile_id.clone());
        }

        let (seed_idx, parent) = self.discovery(&profile_id);
        let seed = self.origins[seed_idx].clone();

        let mut newly_discovered = 0;
        let fetched = match self.stored_profile(&profile_id).await {
            Some(fetched) => Ok(fetched),
            None => self.fetch_with_retry(&profile_id).await,
        };
        let node = match fetched {
            Ok(fetched) => {
                let friend_ids = fetched.record.friend_ids.clone();
                match self.persist_profile(fetched).await {
                    Ok(()) => {
                        if self.cancel.is_cancelled() {
                            debug!("Job cancelled, dropping neighbours of {}", profile_id);
                        } else if depth < self.max_depth {
                            let mut claimed = Vec::new();
                            for friend in friend_ids {
                                if self.claim(&friend, depth + 1, seed_idx, &profile_id) {
                                    claimed.push(friend);
                                }
                            }
                            newly_discovered = claimed.len();
                            lock(next).extend(claimed);
                        }
                        DiscoveredNode {
                            profile_id: profile_id.clone(),
                            seed,
                            parent,
                            depth,
                            status: NodeStatus::Crawled,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!("Could not persist profile {}: {}", profile_id, e);
                        failed_node(&profile_id, seed, parent, depth, e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!("Fetch failed for {}: {}", profile_id, e);
                failed_node(&profile_id, seed, parent, depth, e.to_string())
            }
        };

        let failed = node.status == NodeStatus::Failed;
        if let Err(e) = self
            .with_store_retry(|| self.store.save_node(&self.job_id, &node))
            .await
        {
            warn!("Could not record node {}: {}", profile_id, e);
        }
        self.record(newly_discovered, failed).await;
    }

    /// Seed index and discovering parent recorded for `profile_id`.
    fn discovery(&self, profile_id: &str) -> (usize, Option<String>) {
        lock(&self.discovered)
            .get(profile_id)
            .map(|d| (d.seed, d.parent.clone()))
            .unwrap_or_default()
    }

    /// Atomically claims `profile_id` for the next level. Returns true only
    /// for the first claim; a later claim at the same depth from an earlier
    /// origin re-tags the node with that origin and that parent.
    fn claim(&self, profile_id: &str, depth: u32, seed: usize, parent: &str) -> bool {
        if !is_valid_profile_id(profile_id) {
            debug!("Ignoring malformed friend id {:?}", profile_id);
            return false;
        }
        let mut discovered = lock(&self.discovered);
        match discovered.get_mut(profile_id) {
            Some(existing) => {
                if existing.depth == depth && seed < existing.seed {
                    existing.seed = seed;
                    existing.parent = Some(parent.to_string());
                }
                false
            }
            None => {
                let discovery = Discovery {
                    depth,
                    seed,
                    parent: Some(parent.to_string()),
                };
                discovered.insert(profile_id.to_string(), discovery);
                true
            }
        }
    }

    /// Record saved by an earlier run of this job, or by any job within the
    /// reuse window.
    async fn stored_profile(&self, profile_id: &str) -> Option<FetchedProfile> {
        let stored = if self.already_crawled.contains(profile_id) {
            self.with_store_retry(|| self.store.get_profile(profile_id))
                .await
        } else if let Some(max_age) = self.profile_reuse {
            let fetched_after =
                current_timestamp_ms().saturating_sub(max_age.as_millis() as i64);
            self.with_store_retry(|| self.store.get_profile_since(profile_id, fetched_after))
                .await
        } else {
            return None;
        };
        match stored {
            Ok(Some(record)) => {
                debug!("Reusing stored record for {}", profile_id);
                Some(FetchedProfile {
                    record,
                    content: Vec::new(),
                })
            }
            Ok(None) => None,
            Err(e) => {
                debug!("Stored record for {} unavailable: {}", profile_id, e);
                None
            }
        }
    }

    async fn fetch_with_retry(&self, profile_id: &str) -> std::result::Result<FetchedProfile, SourceError> {
        let mut attempt = 0;
        loop {
            let result =
                match tokio::time::timeout(self.fetch_timeout, self.source.fetch_profile(profile_id))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Transient(format!(
                        "fetch timed out after {:?}",
                        self.fetch_timeout
                    ))),
                };

            match result {
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let backoff = self.retry.delay_for(attempt);
                    warn!(
                        profile_id,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient fetch failure, retrying after backoff: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn with_store_retry<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        retry_store(&self.retry, self.store_timeout, op).await
    }

    /// Saves the profile and any content metadata this job has not cached yet.
    async fn persist_profile(&self, fetched: FetchedProfile) -> StoreResult<()> {
        let fresh: Vec<ContentItem> = {
            let mut cache = lock(&self.content_cache);
            fetched
                .content
                .into_iter()
                .filter(|item| cache.insert(item.content_id, item.clone()).is_none())
                .collect()
        };
        if !fresh.is_empty() {
            self.with_store_retry(|| self.store.save_content_items(&fresh))
                .await?;
        }
        self.with_store_retry(|| self.store.save_profile(&fetched.record))
            .await
    }

    async fn record(&self, newly_discovered: usize, failed: bool) {
        let mut job = self.progress.lock().await;
        if self.cancel.is_cancelled() && job.state == JobState::Running {
            let _ = job.transition(JobState::Cancelled);
        }
        job.record_processed(newly_discovered, failed);
        self.persist_job(&job).await;
    }

    async fn skip_remaining(&self, ids: &[String], depth: u32) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            let (seed_idx, parent) = self.discovery(id);
            let mut node = skipped_node(id, &self.origins[seed_idx], depth);
            node.parent = parent;
            if let Err(e) = self
                .with_store_retry(|| self.store.save_node(&self.job_id, &node))
                .await
            {
                warn!("Could not record skipped node {}: {}", id, e);
            }
        }
        let mut job = self.progress.lock().await;
        job.skipped += ids.len();
        self.persist_job(&job).await;
    }

    async fn finish(&self) -> CrawlJob {
        let mut job = self.progress.lock().await;
        if job.state == JobState::Running && self.cancel.is_cancelled() {
            let _ = job.transition(JobState::Cancelled);
        }
        self.persist_job(&job).await;
        job.clone()
    }

    async fn persist_job(&self, job: &CrawlJob) {
        if let Err(e) = self.with_store_retry(|| self.store.update_job(job)).await {
            warn!("Could not persist status of job {}: {}", job.job_id, e);
        }
    }
}

/// Runs a store operation with the per-call timeout, retrying failures with
/// the same backoff as transient fetch errors.
async fn retry_store<T, F, Fut>(
    retry: &RetryPolicy,
    timeout: Duration,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match store_call(timeout, op()).await {
            Err(e) if attempt + 1 < retry.max_attempts => {
                debug!("Store call failed (attempt {}): {}", attempt + 1, e);
                tokio::time::sleep(retry.delay_for(attempt)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn store_call<T>(
    timeout: Duration,
    op: impl Future<Output = StoreResult<T>>,
) -> std::result::Result<T, StoreError> {
    tokio::time::timeout(timeout, op)
        .await
        .unwrap_or(Err(StoreError::Timeout(timeout)))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failed_node(
    profile_id: &str,
    seed: String,
    parent: Option<String>,
    depth: u32,
    error: String,
) -> DiscoveredNode {
    DiscoveredNode {
        profile_id: profile_id.to_string(),
        seed,
        parent,
        depth,
        status: NodeStatus::Failed,
        error: Some(error),
    }
}

fn skipped_node(profile_id: &str, seed: &str, depth: u32) -> DiscoveredNode {
    DiscoveredNode {
        profile_id: profile_id.to_string(),
        seed: seed.to_string(),
        parent: None,
        depth,
        status: NodeStatus::Skipped,
        error: None,
    }
}
