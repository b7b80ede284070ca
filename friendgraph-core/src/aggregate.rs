//! Graph assembly: turns the records of a finished crawl job into a
//! [`GraphArtifact`] with a top content summary.

use friendgraph_crawler::error::CrawlError;
use friendgraph_crawler::model::{
    ContentItem, CrawlJob, DiscoveredNode, GraphArtifact, GraphNode, NodeStatus, ProfileRecord,
    RankedContent,
};
use friendgraph_crawler::store::{GraphStore, JobStore, ProfileStore};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

pub const TOP_CONTENT_LIMIT: usize = 10;

/// Assembles the artifact for `job` from its discovered nodes and the
/// fetched records. Pure: equal inputs give equal artifacts.
pub fn build_graph(
    job: &CrawlJob,
    nodes: &[DiscoveredNode],
    profiles: &HashMap<String, ProfileRecord>,
    content: &HashMap<u64, ContentItem>,
) -> Result<GraphArtifact, CrawlError> {
    let origin_id = job
        .origins
        .first()
        .ok_or_else(|| CrawlError::NotFound(format!("job {} has no origin", job.job_id)))?;
    let origin_record = profiles.get(origin_id).ok_or_else(|| {
        CrawlError::NotFound(format!("origin profile {} was never fetched", origin_id))
    })?;

    let seed_rank = |seed: &str| {
        job.origins
            .iter()
            .position(|o| o == seed)
            .unwrap_or(job.origins.len())
    };

    let mut included: Vec<&DiscoveredNode> = nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Crawled && n.profile_id != *origin_id)
        .filter(|n| profiles.contains_key(&n.profile_id))
        .collect();
    included.sort_by(|a, b| {
        (a.depth, seed_rank(&a.seed), &a.profile_id).cmp(&(b.depth, seed_rank(&b.seed), &b.profile_id))
    });
    included.dedup_by(|a, b| a.profile_id == b.profile_id);

    let origin = GraphNode {
        profile: origin_record.clone(),
        seed: origin_id.clone(),
        parent: None,
        depth: 0,
        max_depth: job.max_depth,
    };
    let graph_nodes: Vec<GraphNode> = included
        .iter()
        .filter_map(|node| {
            profiles.get(&node.profile_id).map(|profile| GraphNode {
                profile: profile.clone(),
                seed: node.seed.clone(),
                parent: node.parent.clone(),
                depth: node.depth,
                max_depth: job.max_depth,
            })
        })
        .collect();

    let top_content = rank_content(
        std::iter::once(&origin.profile).chain(graph_nodes.iter().map(|n| &n.profile)),
        content,
        TOP_CONTENT_LIMIT,
    );

    Ok(GraphArtifact {
        job_id: job.job_id.clone(),
        origin,
        nodes: graph_nodes,
        top_content,
        created_at: job.finished_at.unwrap_or(job.started_at),
    })
}

/// Sums usage per content ID over `records` and keeps the `limit` most used,
/// ties broken by ascending content ID.
pub fn rank_content<'a>(
    records: impl IntoIterator<Item = &'a ProfileRecord>,
    content: &HashMap<u64, ContentItem>,
    limit: usize,
) -> Vec<RankedContent> {
    let mut totals: HashMap<u64, (u64, usize)> = HashMap::new();
    for record in records {
        for owned in &record.owned {
            let entry = totals.entry(owned.content_id).or_default();
            entry.0 = entry.0.saturating_add(owned.usage_minutes);
            entry.1 += 1;
        }
    }

    let mut ranked: Vec<(u64, u64, usize)> = totals
        .into_iter()
        .map(|(id, (usage, owners))| (id, usage, owners))
        .collect();
    ranked.sort_by_key(|&(id, usage, _)| (Reverse(usage), id));
    ranked.truncate(limit);

    ranked
        .into_iter()
        .map(|(id, usage, owners)| RankedContent {
            item: content
                .get(&id)
                .cloned()
                .unwrap_or_else(|| ContentItem::placeholder(id)),
            total_usage: usage,
            owner_count: owners,
        })
        .collect()
}

/// Aggregates a finished job, storing the artifact on first call and
/// returning the stored one afterwards.
pub async fn create_graph<S>(store: &S, job_id: &str) -> Result<GraphArtifact, CrawlError>
where
    S: JobStore + ProfileStore + GraphStore + ?Sized,
{
    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| CrawlError::NotFound(job_id.to_string()))?;

    if !job.state.is_reusable() {
        return Err(CrawlError::IncompleteJob {
            job_id: job.job_id,
            state: job.state,
        });
    }

    if let Some(existing) = store.get_graph(job_id).await? {
        debug!("Graph for {} already exists", job_id);
        return Ok(existing);
    }

    let nodes = store.job_nodes(job_id).await?;
    let mut profiles = HashMap::new();
    for profile_id in job.origins.iter().take(1).chain(
        nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Crawled)
            .map(|n| &n.profile_id),
    ) {
        if profiles.contains_key(profile_id) {
            continue;
        }
        if let Some(record) = store.get_profile(profile_id).await? {
            profiles.insert(profile_id.clone(), record);
        }
    }

    let content_ids: Vec<u64> = profiles
        .values()
        .flat_map(|p| p.owned.iter().map(|o| o.content_id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let content: HashMap<u64, ContentItem> = store
        .get_content_items(&content_ids)
        .await?
        .into_iter()
        .map(|item| (item.content_id, item))
        .collect();

    let artifact = build_graph(&job, &nodes, &profiles, &content)?;
    store.save_graph(&artifact).await?;
    info!(
        "Created graph for {}: {} nodes, {} ranked content items",
        job_id,
        artifact.nodes.len() + 1,
        artifact.top_content.len()
    );

    // A concurrent call may have stored its artifact first
    Ok(store.get_graph(job_id).await?.unwrap_or(artifact))
}
