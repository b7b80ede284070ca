//! Canonical schema shared by every friendgraph component.
//!
//! The crawler, the store implementations, the aggregator and the HTTP API
//! all exchange these types; nothing re-declares them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CrawlError;

/// Public account attributes of one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetails {
    pub steam_id: String,
    pub persona_name: String,
    pub profile_url: String,
    pub avatar: String,
    pub time_created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

/// A reference from a profile to a content item with its usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedContent {
    pub content_id: u64,
    pub usage_minutes: u64,
}

/// Point-in-time snapshot of a profile as returned by the profile source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub details: AccountDetails,
    pub friend_ids: Vec<String>,
    pub owned: Vec<OwnedContent>,
}

impl ProfileRecord {
    pub fn profile_id(&self) -> &str {
        &self.details.steam_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub content_id: u64,
    pub name: String,
    pub icon_url: String,
    pub logo_url: String,
}

impl ContentItem {
    /// Stand-in for content whose metadata was never fetched.
    pub fn placeholder(content_id: u64) -> Self {
        Self {
            content_id,
            name: format!("Unknown content {}", content_id),
            icon_url: String::new(),
            logo_url: String::new(),
        }
    }
}

/// What a profile source returns for one identifier: the record plus the
/// metadata of every content item the record references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedProfile {
    pub record: ProfileRecord,
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::PartiallyFailed => "partially_failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "partially_failed" => Some(JobState::PartiallyFailed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::PartiallyFailed | JobState::Cancelled
        )
    }

    /// Terminal states whose results can be aggregated and reused.
    pub fn is_reusable(&self) -> bool {
        matches!(self, JobState::Completed | JobState::PartiallyFailed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::PartiallyFailed)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status record of one crawl request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub job_id: String,
    pub origins: Vec<String>,
    pub max_depth: u32,
    pub total_discovered: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub state: JobState,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl CrawlJob {
    pub fn new(job_id: impl Into<String>, origins: Vec<String>, max_depth: u32) -> Self {
        Self {
            job_id: job_id.into(),
            total_discovered: origins.len(),
            origins,
            max_depth,
            completed: 0,
            failed: 0,
            skipped: 0,
            state: JobState::Pending,
            started_at: current_timestamp_ms(),
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), CrawlError> {
        if !self.state.can_transition_to(next) {
            return Err(CrawlError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(current_timestamp_ms());
        }
        Ok(())
    }

    /// Records one processed node together with the neighbours it
    /// discovered. Moves a running job to its terminal state as soon as
    /// every discovered node has been processed.
    pub fn record_processed(&mut self, newly_discovered: usize, failed: bool) {
        self.total_discovered += newly_discovered;
        self.completed += 1;
        if failed {
            self.failed += 1;
        }
        if self.state == JobState::Running && self.completed == self.total_discovered {
            let terminal = if self.failed > 0 {
                JobState::PartiallyFailed
            } else {
                JobState::Completed
            };
            self.state = terminal;
            self.finished_at = Some(current_timestamp_ms());
        }
    }

    pub fn is_for(&self, origins: &[String], max_depth: u32) -> bool {
        self.max_depth == max_depth && self.origins == origins
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Crawled,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Crawled => "crawled",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crawled" => Some(NodeStatus::Crawled),
            "failed" => Some(NodeStatus::Failed),
            "skipped" => Some(NodeStatus::Skipped),
            _ => None,
        }
    }
}

/// A node reached by a crawl job, tagged with the origin it was reached
/// from, the profile whose friend list it came from and its BFS depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredNode {
    pub profile_id: String,
    pub seed: String,
    /// `None` for origins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub depth: u32,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub profile: ProfileRecord,
    pub seed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub depth: u32,
    pub max_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedContent {
    pub item: ContentItem,
    pub total_usage: u64,
    pub owner_count: usize,
}

/// Aggregated, renderable result of one finished crawl job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphArtifact {
    pub job_id: String,
    pub origin: GraphNode,
    pub nodes: Vec<GraphNode>,
    pub top_content: Vec<RankedContent>,
    pub created_at: i64,
}

pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
