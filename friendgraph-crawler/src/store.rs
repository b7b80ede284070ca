//! Persistence contracts the coordinator and the aggregator write through,
//! plus an in-process implementation.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::model::{
    ContentItem, CrawlJob, DiscoveredNode, GraphArtifact, ProfileRecord, current_timestamp_ms,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable crawl status records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &CrawlJob) -> StoreResult<()>;
    /// Writes progress. Counters never go down and a terminal state is
    /// never replaced.
    async fn update_job(&self, job: &CrawlJob) -> StoreResult<()>;
    /// Moves an unfinished job into a fresh run: `failed` and `skipped`
    /// start over from `job`, the other counters keep the never-lower guard.
    /// Fails if the job is missing or already terminal.
    async fn restart_job(&self, job: &CrawlJob) -> StoreResult<()>;
    async fn get_job(&self, job_id: &str) -> StoreResult<Option<CrawlJob>>;
    /// Most recent job that finished successfully or partially for the
    /// given origins and depth bound.
    async fn find_reusable_job(
        &self,
        origins: &[String],
        max_depth: u32,
    ) -> StoreResult<Option<CrawlJob>>;
    /// Jobs still `Pending` or `Running`, oldest first.
    async fn unfinished_jobs(&self) -> StoreResult<Vec<CrawlJob>>;
}

/// Profiles, content metadata and per-job discovery rows.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn save_profile(&self, record: &ProfileRecord) -> StoreResult<()>;
    async fn get_profile(&self, profile_id: &str) -> StoreResult<Option<ProfileRecord>>;
    /// The stored record if it was fetched at or after `fetched_after`
    /// (unix millis).
    async fn get_profile_since(
        &self,
        profile_id: &str,
        fetched_after: i64,
    ) -> StoreResult<Option<ProfileRecord>>;
    async fn save_content_items(&self, items: &[ContentItem]) -> StoreResult<()>;
    async fn get_content_items(&self, content_ids: &[u64]) -> StoreResult<Vec<ContentItem>>;
    async fn save_node(&self, job_id: &str, node: &DiscoveredNode) -> StoreResult<()>;
    async fn job_nodes(&self, job_id: &str) -> StoreResult<Vec<DiscoveredNode>>;
}

/// Aggregated graph artifacts, written once per job.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn save_graph(&self, artifact: &GraphArtifact) -> StoreResult<()>;
    async fn get_graph(&self, job_id: &str) -> StoreResult<Option<GraphArtifact>>;
}

/// Everything a crawl service needs from its backend.
pub trait Store: JobStore + ProfileStore + GraphStore {}

impl<T: JobStore + ProfileStore + GraphStore> Store for T {}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, CrawlJob>,
    /// Record plus the time it was saved
    profiles: HashMap<String, (ProfileRecord, i64)>,
    content: BTreeMap<u64, ContentItem>,
    nodes: HashMap<String, Vec<DiscoveredNode>>,
    graphs: HashMap<String, GraphArtifact>,
}

/// Non-durable store used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> StoreResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &CrawlJob) -> StoreResult<()> {
        self.with_state(|state| {
            if state.jobs.contains_key(&job.job_id) {
                return Err(StoreError::Backend(format!(
                    "job {} already exists",
                    job.job_id
                )));
            }
            state.jobs.insert(job.job_id.clone(), job.clone());
            Ok(())
        })?
    }

    async fn update_job(&self, job: &CrawlJob) -> StoreResult<()> {
        self.with_state(|state| match state.jobs.get_mut(&job.job_id) {
            Some(existing) => {
                let settled = existing
                    .state
                    .is_terminal()
                    .then_some((existing.state, existing.finished_at));
                let merged = CrawlJob {
                    total_discovered: existing.total_discovered.max(job.total_discovered),
                    completed: existing.completed.max(job.completed),
                    failed: existing.failed.max(job.failed),
                    skipped: existing.skipped.max(job.skipped),
                    ..job.clone()
                };
                *existing = merged;
                if let Some((state, finished_at)) = settled {
                    existing.state = state;
                    existing.finished_at = finished_at;
                }
                Ok(())
            }
            None => Err(StoreError::Backend(format!("job {} does not exist", job.job_id))),
        })?
    }

    async fn restart_job(&self, job: &CrawlJob) -> StoreResult<()> {
        self.with_state(|state| match state.jobs.get_mut(&job.job_id) {
            Some(existing) if !existing.state.is_terminal() => {
                existing.total_discovered = existing.total_discovered.max(job.total_discovered);
                existing.completed = existing.completed.max(job.completed);
                existing.failed = job.failed;
                existing.skipped = job.skipped;
                existing.state = job.state;
                Ok(())
            }
            Some(existing) => Err(StoreError::Backend(format!(
                "job {} is already {}",
                job.job_id, existing.state
            ))),
            None => Err(StoreError::Backend(format!("job {} does not exist", job.job_id))),
        })?
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<CrawlJob>> {
        self.with_state(|state| state.jobs.get(job_id).cloned())
    }

    async fn find_reusable_job(
        &self,
        origins: &[String],
        max_depth: u32,
    ) -> StoreResult<Option<CrawlJob>> {
        self.with_state(|state| {
            state
                .jobs
                .values()
                .filter(|job| job.state.is_reusable() && job.is_for(origins, max_depth))
                .max_by_key(|job| job.started_at)
                .cloned()
        })
    }

    async fn unfinished_jobs(&self) -> StoreResult<Vec<CrawlJob>> {
        self.with_state(|state| {
            let mut jobs: Vec<CrawlJob> = state
                .jobs
                .values()
                .filter(|job| !job.state.is_terminal())
                .cloned()
                .collect();
            jobs.sort_by_key(|job| job.started_at);
            jobs
        })
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn save_profile(&self, record: &ProfileRecord) -> StoreResult<()> {
        self.with_state(|state| {
            state.profiles.insert(
                record.profile_id().to_string(),
                (record.clone(), current_timestamp_ms()),
            );
        })
    }

    async fn get_profile(&self, profile_id: &str) -> StoreResult<Option<ProfileRecord>> {
        self.with_state(|state| state.profiles.get(profile_id).map(|(record, _)| record.clone()))
    }

    async fn get_profile_since(
        &self,
        profile_id: &str,
        fetched_after: i64,
    ) -> StoreResult<Option<ProfileRecord>> {
        self.with_state(|state| {
            state
                .profiles
                .get(profile_id)
                .filter(|(_, fetched_at)| *fetched_at >= fetched_after)
                .map(|(record, _)| record.clone())
        })
    }

    async fn save_content_items(&self, items: &[ContentItem]) -> StoreResult<()> {
        self.with_state(|state| {
            for item in items {
                state
                    .content
                    .entry(item.content_id)
                    .or_insert_with(|| item.clone());
            }
        })
    }

    async fn get_content_items(&self, content_ids: &[u64]) -> StoreResult<Vec<ContentItem>> {
        self.with_state(|state| {
            content_ids
                .iter()
                .filter_map(|id| state.content.get(id).cloned())
                .collect()
        })
    }

    async fn save_node(&self, job_id: &str, node: &DiscoveredNode) -> StoreResult<()> {
        self.with_state(|state| {
            let nodes = state.nodes.entry(job_id.to_string()).or_default();
            match nodes.iter_mut().find(|n| n.profile_id == node.profile_id) {
                Some(existing) => *existing = node.clone(),
                None => nodes.push(node.clone()),
            }
        })
    }

    async fn job_nodes(&self, job_id: &str) -> StoreResult<Vec<DiscoveredNode>> {
        self.with_state(|state| state.nodes.get(job_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn save_graph(&self, artifact: &GraphArtifact) -> StoreResult<()> {
        self.with_state(|state| {
            state
                .graphs
                .entry(artifact.job_id.clone())
                .or_insert_with(|| artifact.clone());
        })
    }

    async fn get_graph(&self, job_id: &str) -> StoreResult<Option<GraphArtifact>> {
        self.with_state(|state| state.graphs.get(job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobState;

    fn origin() -> Vec<String> {
        vec!["76561197969081524".to_string()]
    }

    #[tokio::test]
    async fn test_update_job_never_lowers_counts() {
        let store = MemoryStore::new();
        let mut job = CrawlJob::new("job1", origin(), 1);
        store.create_job(&job).await.unwrap();

        job.completed = 3;
        job.total_discovered = 5;
        store.update_job(&job).await.unwrap();

        let mut stale = job.clone();
        stale.completed = 1;
        stale.total_discovered = 2;
        store.update_job(&stale).await.unwrap();

        let stored = store.get_job("job1").await.unwrap().unwrap();
        assert_eq!(stored.completed, 3);
        assert_eq!(stored.total_discovered, 5);
    }

    #[tokio::test]
    async fn test_update_job_never_lowers_failed_or_skipped() {
        let store = MemoryStore::new();
        let mut job = CrawlJob::new("job1", origin(), 1);
        store.create_job(&job).await.unwrap();

        job.failed = 2;
        job.skipped = 4;
        store.update_job(&job).await.unwrap();

        let mut stale = job.clone();
        stale.failed = 0;
        stale.skipped = 1;
        store.update_job(&stale).await.unwrap();

        let stored = store.get_job("job1").await.unwrap().unwrap();
        assert_eq!(stored.failed, 2);
        assert_eq!(stored.skipped, 4);
    }

    #[tokio::test]
    async fn test_restart_job_resets_failures_only() {
        let store = MemoryStore::new();
        let mut job = CrawlJob::new("job1", origin(), 2);
        store.create_job(&job).await.unwrap();
        job.transition(JobState::Running).unwrap();
        job.completed = 3;
        job.total_discovered = 5;
        job.failed = 2;
        job.skipped = 1;
        store.update_job(&job).await.unwrap();

        let mut rerun = CrawlJob::new("job1", origin(), 2);
        rerun.transition(JobState::Running).unwrap();
        store.restart_job(&rerun).await.unwrap();

        let stored = store.get_job("job1").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert_eq!(stored.completed, 3);
        assert_eq!(stored.total_discovered, 5);
        assert_eq!(stored.failed, 0);
        assert_eq!(stored.skipped, 0);
    }

    #[tokio::test]
    async fn test_restart_job_refuses_terminal_or_missing() {
        let store = MemoryStore::new();
        let mut job = CrawlJob::new("job1", origin(), 1);
        store.create_job(&job).await.unwrap();
        job.transition(JobState::Cancelled).unwrap();
        store.update_job(&job).await.unwrap();

        let mut rerun = CrawlJob::new("job1", origin(), 1);
        rerun.transition(JobState::Running).unwrap();
        assert!(store.restart_job(&rerun).await.is_err());
        assert_eq!(
            store.get_job("job1").await.unwrap().unwrap().state,
            JobState::Cancelled
        );

        let ghost = CrawlJob::new("ghost", origin(), 1);
        assert!(store.restart_job(&ghost).await.is_err());
    }

    #[tokio::test]
    async fn test_get_profile_since_honours_fetch_time() {
        let store = MemoryStore::new();
        let record = ProfileRecord {
            details: crate::model::AccountDetails {
                steam_id: origin()[0].clone(),
                persona_name: "someone".to_string(),
                profile_url: String::new(),
                avatar: String::new(),
                time_created: 0,
                country_code: None,
            },
            friend_ids: Vec::new(),
            owned: Vec::new(),
        };
        let before = current_timestamp_ms();
        store.save_profile(&record).await.unwrap();

        let id = record.profile_id();
        assert_eq!(store.get_profile_since(id, before).await.unwrap(), Some(record.clone()));
        assert!(
            store
                .get_profile_since(id, current_timestamp_ms() + 60_000)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_job_keeps_terminal_state() {
        let store = MemoryStore::new();
        let mut job = CrawlJob::new("job1", origin(), 1);
        store.create_job(&job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled.transition(JobState::Cancelled).unwrap();
        store.update_job(&cancelled).await.unwrap();

        job.transition(JobState::Running).unwrap();
        store.update_job(&job).await.unwrap();

        let stored = store.get_job("job1").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Cancelled);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_create_job_twice_fails() {
        let store = MemoryStore::new();
        let job = CrawlJob::new("job1", origin(), 1);
        store.create_job(&job).await.unwrap();
        assert!(store.create_job(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_find_reusable_job_ignores_running_and_other_depths() {
        let store = MemoryStore::new();

        let running = CrawlJob::new("running", origin(), 1);
        store.create_job(&running).await.unwrap();

        let mut done = CrawlJob::new("done", origin(), 2);
        done.state = JobState::Completed;
        store.create_job(&done).await.unwrap();

        assert!(store.find_reusable_job(&origin(), 1).await.unwrap().is_none());
        let found = store.find_reusable_job(&origin(), 2).await.unwrap().unwrap();
        assert_eq!(found.job_id, "done");
    }

    #[tokio::test]
    async fn test_content_items_are_write_once() {
        let store = MemoryStore::new();
        let first = ContentItem {
            content_id: 10,
            name: "First".to_string(),
            icon_url: String::new(),
            logo_url: String::new(),
        };
        let mut second = first.clone();
        second.name = "Second".to_string();

        store.save_content_items(&[first]).await.unwrap();
        store.save_content_items(&[second]).await.unwrap();

        let items = store.get_content_items(&[10, 11]).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "First");
    }
}
