// Report generation from stored crawl jobs and graphs

use crate::data::Database;
use friendgraph_crawler::model::{CrawlJob, GraphArtifact, GraphNode};
use rusqlite::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
    Markdown,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            "markdown" | "md" => Some(ReportFormat::Markdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCounts {
    pub crawled: i64,
    pub failed: i64,
    pub skipped: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportData {
    pub job: CrawlJob,
    pub node_counts: NodeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphArtifact>,
}

/// Loads a job, its per-status node counts and its graph if one was created.
/// Returns `None` for an unknown job.
pub fn gather_report_data(db: &Database, job_id: &str) -> Result<Option<ReportData>> {
    let Some(job) = db.get_job(job_id)? else {
        return Ok(None);
    };

    let mut node_counts = NodeCounts::default();
    for (status, count) in db.count_nodes_by_status(job_id)? {
        match status.as_str() {
            "crawled" => node_counts.crawled = count,
            "failed" => node_counts.failed = count,
            "skipped" => node_counts.skipped = count,
            _ => {}
        }
    }

    let graph = db.get_graph(job_id)?;
    Ok(Some(ReportData {
        job,
        node_counts,
        graph,
    }))
}

pub fn generate_report(data: &ReportData, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Text => Ok(generate_text_report(data)),
        ReportFormat::Json => generate_json_report(data),
        ReportFormat::Markdown => Ok(generate_markdown_report(data)),
    }
}

pub fn generate_text_report(data: &ReportData) -> String {
    let job = &data.job;
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                          FRIENDGRAPH CRAWL REPORT\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Job ID:       {}\n", job.job_id));
    report.push_str(&format!("Status:       {}\n", data.status_to_string()));
    report.push_str(&format!("Started:      {}\n", format_timestamp(job.started_at)));
    if let Some(finished_at) = job.finished_at {
        let secs = (finished_at - job.started_at) as f64 / 1000.0;
        report.push_str(&format!("Duration:     {:.1} seconds\n", secs));
    }
    report.push_str(&format!("Origins:      {}\n", job.origins.join(", ")));
    report.push_str(&format!("Max depth:    {}\n", job.max_depth));
    report.push_str(&format!(
        "Progress:     {}/{} profiles\n",
        job.completed, job.total_discovered
    ));
    report.push_str(&format!(
        "Nodes:        {} crawled, {} failed, {} skipped\n\n",
        data.node_counts.crawled, data.node_counts.failed, data.node_counts.skipped
    ));

    let Some(ref graph) = data.graph else {
        report.push_str("No graph has been created for this job yet.\n");
        return report;
    };

    report.push_str(RULE);
    report.push_str("TOP CONTENT\n");
    report.push_str(RULE);
    report.push('\n');
    if graph.top_content.is_empty() {
        report.push_str("  (none)\n");
    }
    for (idx, ranked) in graph.top_content.iter().enumerate() {
        report.push_str(&format!(
            "  {:>2}. {:<40} {:>8}  ({} owners)\n",
            idx + 1,
            truncate(&ranked.item.name, 40),
            format_minutes(ranked.total_usage),
            ranked.owner_count
        ));
    }
    report.push('\n');

    report.push_str(RULE);
    report.push_str("FRIEND GRAPH\n");
    report.push_str(RULE);
    report.push('\n');
    report.push_str(&generate_graph_tree(graph));
    report.push('\n');

    report.push_str(RULE);
    report.push_str("                               End of Report\n");
    report.push_str(RULE);
    report
}

pub fn generate_json_report(data: &ReportData) -> Result<String, serde_json::Error> {
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "friendgraph",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "format": "json"
            },
            "job": {
                "id": data.job.job_id,
                "state": data.job.state.as_str(),
                "origins": data.job.origins,
                "max_depth": data.job.max_depth,
                "started_at": format_iso8601_timestamp(data.job.started_at),
                "finished_at": data.job.finished_at.map(format_iso8601_timestamp),
                "total_discovered": data.job.total_discovered,
                "completed": data.job.completed
            },
            "nodes": data.node_counts,
            "graph": data.graph
        }
    });

    serde_json::to_string_pretty(&json_report)
}

pub fn generate_markdown_report(data: &ReportData) -> String {
    let job = &data.job;
    let mut report = String::new();

    report.push_str(&format!("# Crawl report: `{}`\n\n", job.job_id));
    report.push_str("| | |\n|---|---|\n");
    report.push_str(&format!("| Status | {} |\n", data.status_to_string()));
    report.push_str(&format!("| Started | {} |\n", format_timestamp(job.started_at)));
    report.push_str(&format!("| Origins | {} |\n", job.origins.join(", ")));
    report.push_str(&format!("| Max depth | {} |\n", job.max_depth));
    report.push_str(&format!(
        "| Nodes | {} crawled, {} failed, {} skipped |\n\n",
        data.node_counts.crawled, data.node_counts.failed, data.node_counts.skipped
    ));

    if let Some(ref graph) = data.graph {
        report.push_str("## Top content\n\n");
        report.push_str("| # | Name | Playtime | Owners |\n|---|---|---|---|\n");
        for (idx, ranked) in graph.top_content.iter().enumerate() {
            report.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                idx + 1,
                ranked.item.name.replace('|', "\\|"),
                format_minutes(ranked.total_usage),
                ranked.owner_count
            ));
        }
        report.push_str("\n## Profiles\n\n");
        report.push_str("| Depth | Seed | Profile | Name |\n|---|---|---|---|\n");
        for node in std::iter::once(&graph.origin).chain(graph.nodes.iter()) {
            report.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                node.depth,
                node.seed,
                node.profile.profile_id(),
                node.profile.details.persona_name.replace('|', "\\|")
            ));
        }
    }

    report
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

impl ReportData {
    fn status_to_string(&self) -> &str {
        match self.job.state.as_str() {
            "pending" => "Pending",
            "running" => "Running",
            "completed" => "Completed",
            "partially_failed" => "Partially failed",
            "cancelled" => "Cancelled",
            _ => "Unknown",
        }
    }
}

/// Profiles drawn under the profile whose friend list they were found in.
/// Nodes without a known parent (such as a second origin) hang off the root.
fn generate_graph_tree(graph: &GraphArtifact) -> String {
    let root = graph.origin.profile.profile_id();
    let mut result = format!(
        "{} ({})\n",
        graph.origin.profile.details.persona_name, root
    );
    if graph.nodes.is_empty() {
        result.push_str("  (no friends reached)\n");
        return result;
    }

    let known: HashSet<&str> = graph.nodes.iter().map(|n| n.profile.profile_id()).collect();
    let mut children: HashMap<&str, Vec<&GraphNode>> = HashMap::new();
    for node in &graph.nodes {
        let parent = node
            .parent
            .as_deref()
            .filter(|p| known.contains(p))
            .unwrap_or(root);
        children.entry(parent).or_default().push(node);
    }

    push_subtree(&children, root, "", &mut result);
    result
}

fn push_subtree(
    children: &HashMap<&str, Vec<&GraphNode>>,
    parent: &str,
    indent: &str,
    out: &mut String,
) {
    let Some(nodes) = children.get(parent) else {
        return;
    };
    for (i, node) in nodes.iter().enumerate() {
        let is_last = i == nodes.len() - 1;
        let (branch, continuation) = if is_last {
            ("└── ", "    ")
        } else {
            ("├── ", "│   ")
        };
        out.push_str(&format!(
            "{}{}[{}] {} ({})\n",
            indent,
            branch,
            node.depth,
            node.profile.details.persona_name,
            node.profile.profile_id()
        ));
        let indent = format!("{}{}", indent, continuation);
        push_subtree(children, node.profile.profile_id(), &indent, out);
    }
}

fn format_minutes(minutes: u64) -> String {
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h", minutes / 60)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

fn format_timestamp(timestamp_ms: i64) -> String {
    use chrono::{DateTime, Utc};
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_iso8601_timestamp(timestamp_ms: i64) -> String {
    use chrono::{DateTime, Utc};
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
