// Tests for database functionality

use friendgraph_core::data::{Database, SqliteStore};
use friendgraph_crawler::model::{
    AccountDetails, ContentItem, CrawlJob, DiscoveredNode, GraphArtifact, GraphNode, JobState,
    NodeStatus, OwnedContent, ProfileRecord, current_timestamp_ms,
};
use friendgraph_crawler::store::{GraphStore, JobStore, ProfileStore};
use tempfile::TempDir;

const ALICE: &str = "76561197960265728";
const BOB: &str = "76561197960265729";

fn create_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path).unwrap();
    (temp_dir, db)
}

fn profile(id: &str, friends: &[&str], owned: &[(u64, u64)]) -> ProfileRecord {
    ProfileRecord {
        details: AccountDetails {
            steam_id: id.to_string(),
            persona_name: format!("player-{}", &id[12..]),
            profile_url: format!("https://steamcommunity.com/profiles/{}/", id),
            avatar: String::new(),
            time_created: 1_100_000_000,
            country_code: Some("NL".to_string()),
        },
        friend_ids: friends.iter().map(|f| f.to_string()).collect(),
        owned: owned
            .iter()
            .map(|&(content_id, usage_minutes)| OwnedContent {
                content_id,
                usage_minutes,
            })
            .collect(),
    }
}

fn node(id: &str, depth: u32, status: NodeStatus) -> DiscoveredNode {
    DiscoveredNode {
        profile_id: id.to_string(),
        seed: ALICE.to_string(),
        parent: (depth > 0).then(|| ALICE.to_string()),
        depth,
        status,
        error: None,
    }
}

// ============================================================================
// Database Creation Tests
// ============================================================================

#[test]
fn test_database_creation() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let db = Database::new(&db_path);
    assert!(db.is_ok());
    assert!(db_path.exists());
}

#[test]
fn test_database_drop() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let _db = Database::new(&db_path).unwrap();
    assert!(Database::exists(&db_path));

    Database::drop(&db_path).unwrap();
    assert!(!Database::exists(&db_path));
}

#[test]
fn test_reopen_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    {
        let db = Database::new(&db_path).unwrap();
        db.insert_job(&CrawlJob::new("job1", vec![ALICE.to_string()], 2))
            .unwrap();
    }

    let db = Database::new(&db_path).unwrap();
    assert!(db.get_job("job1").unwrap().is_some());
}

// ============================================================================
// Job Tests
// ============================================================================

#[test]
fn test_insert_and_get_job() {
    let (_temp_dir, db) = create_test_db();
    let job = CrawlJob::new("job1", vec![ALICE.to_string(), BOB.to_string()], 2);
    db.insert_job(&job).unwrap();

    let stored = db.get_job("job1").unwrap().unwrap();
    assert_eq!(stored, job);
}

#[test]
fn test_get_unknown_job() {
    let (_temp_dir, db) = create_test_db();
    assert!(db.get_job("missing").unwrap().is_none());
}

#[test]
fn test_duplicate_job_id_rejected() {
    let (_temp_dir, db) = create_test_db();
    let job = CrawlJob::new("job1", vec![ALICE.to_string()], 1);
    db.insert_job(&job).unwrap();
    assert!(db.insert_job(&job).is_err());
}

#[test]
fn test_update_job_counts_never_decrease() {
    let (_temp_dir, db) = create_test_db();
    let mut job = CrawlJob::new("job1", vec![ALICE.to_string()], 2);
    db.insert_job(&job).unwrap();

    job.transition(JobState::Running).unwrap();
    job.total_discovered = 8;
    job.completed = 5;
    db.update_job(&job).unwrap();

    let mut stale = job.clone();
    stale.total_discovered = 4;
    stale.completed = 2;
    db.update_job(&stale).unwrap();

    let stored = db.get_job("job1").unwrap().unwrap();
    assert_eq!(stored.total_discovered, 8);
    assert_eq!(stored.completed, 5);
}

#[test]
fn test_restart_job_resets_failures_but_not_progress() {
    let (_temp_dir, db) = create_test_db();
    let mut job = CrawlJob::new("job1", vec![ALICE.to_string()], 2);
    db.insert_job(&job).unwrap();
    job.transition(JobState::Running).unwrap();
    job.total_discovered = 6;
    job.completed = 4;
    job.failed = 3;
    job.skipped = 1;
    db.update_job(&job).unwrap();

    let mut rerun = CrawlJob::new("job1", vec![ALICE.to_string()], 2);
    rerun.transition(JobState::Running).unwrap();
    assert_eq!(db.restart_job(&rerun).unwrap(), 1);

    let stored = db.get_job("job1").unwrap().unwrap();
    assert_eq!(stored.state, JobState::Running);
    assert_eq!(stored.total_discovered, 6);
    assert_eq!(stored.completed, 4);
    assert_eq!(stored.failed, 0);
    assert_eq!(stored.skipped, 0);
}

#[test]
fn test_restart_job_leaves_terminal_job_alone() {
    let (_temp_dir, db) = create_test_db();
    let mut job = CrawlJob::new("job1", vec![ALICE.to_string()], 1);
    db.insert_job(&job).unwrap();
    job.transition(JobState::Cancelled).unwrap();
    db.update_job(&job).unwrap();

    let mut rerun = CrawlJob::new("job1", vec![ALICE.to_string()], 1);
    rerun.transition(JobState::Running).unwrap();
    assert_eq!(db.restart_job(&rerun).unwrap(), 0);
    assert_eq!(db.get_job("job1").unwrap().unwrap().state, JobState::Cancelled);
}

#[test]
fn test_update_job_keeps_terminal_state() {
    let (_temp_dir, db) = create_test_db();
    let mut job = CrawlJob::new("job1", vec![ALICE.to_string()], 1);
    db.insert_job(&job).unwrap();

    let mut cancelled = job.clone();
    cancelled.transition(JobState::Cancelled).unwrap();
    db.update_job(&cancelled).unwrap();

    job.transition(JobState::Running).unwrap();
    db.update_job(&job).unwrap();

    let stored = db.get_job("job1").unwrap().unwrap();
    assert_eq!(stored.state, JobState::Cancelled);
    assert_eq!(stored.finished_at, cancelled.finished_at);
}

#[test]
fn test_update_unknown_job_changes_nothing() {
    let (_temp_dir, db) = create_test_db();
    let job = CrawlJob::new("ghost", vec![ALICE.to_string()], 1);
    assert_eq!(db.update_job(&job).unwrap(), 0);
}

#[test]
fn test_find_job_matches_origins_depth_and_state() {
    let (_temp_dir, db) = create_test_db();

    let mut done = CrawlJob::new("done", vec![ALICE.to_string()], 2);
    done.state = JobState::Completed;
    db.insert_job(&done).unwrap();

    let running = CrawlJob::new("running", vec![ALICE.to_string()], 3);
    db.insert_job(&running).unwrap();

    let mut cancelled = CrawlJob::new("cancelled", vec![BOB.to_string()], 2);
    cancelled.state = JobState::Cancelled;
    db.insert_job(&cancelled).unwrap();

    let found = db.find_job(&[ALICE.to_string()], 2).unwrap().unwrap();
    assert_eq!(found.job_id, "done");
    assert!(db.find_job(&[ALICE.to_string()], 3).unwrap().is_none());
    assert!(db.find_job(&[BOB.to_string()], 2).unwrap().is_none());
    // origin order is part of the request
    assert!(
        db.find_job(&[BOB.to_string(), ALICE.to_string()], 2)
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_find_job_prefers_most_recent() {
    let (_temp_dir, db) = create_test_db();

    let mut older = CrawlJob::new("older", vec![ALICE.to_string()], 1);
    older.state = JobState::Completed;
    older.started_at = 1_000;
    db.insert_job(&older).unwrap();

    let mut newer = CrawlJob::new("newer", vec![ALICE.to_string()], 1);
    newer.state = JobState::PartiallyFailed;
    newer.started_at = 2_000;
    db.insert_job(&newer).unwrap();

    let found = db.find_job(&[ALICE.to_string()], 1).unwrap().unwrap();
    assert_eq!(found.job_id, "newer");
}

#[test]
fn test_unfinished_and_listed_jobs() {
    let (_temp_dir, db) = create_test_db();

    let pending = CrawlJob::new("pending", vec![ALICE.to_string()], 1);
    db.insert_job(&pending).unwrap();
    let mut finished = CrawlJob::new("finished", vec![BOB.to_string()], 1);
    finished.state = JobState::Completed;
    db.insert_job(&finished).unwrap();

    let unfinished: Vec<String> = db
        .unfinished_jobs()
        .unwrap()
        .into_iter()
        .map(|j| j.job_id)
        .collect();
    assert_eq!(unfinished, vec!["pending".to_string()]);
    assert_eq!(db.list_jobs(10).unwrap().len(), 2);
    assert_eq!(db.list_jobs(1).unwrap().len(), 1);
}

// ============================================================================
// Profile and Content Tests
// ============================================================================

#[test]
fn test_profile_round_trip_keeps_friend_order() {
    let (_temp_dir, db) = create_test_db();
    let record = profile(ALICE, &[BOB, "76561197960265730"], &[(440, 120), (570, 3)]);
    db.upsert_profile(&record).unwrap();

    let stored = db.get_profile(ALICE).unwrap().unwrap();
    assert_eq!(stored, record);
}

#[test]
fn test_get_profile_since_filters_on_fetch_time() {
    let (_temp_dir, db) = create_test_db();
    let before = current_timestamp_ms();
    db.upsert_profile(&profile(ALICE, &[BOB], &[])).unwrap();

    assert!(db.get_profile_since(ALICE, before).unwrap().is_some());
    assert!(
        db.get_profile_since(ALICE, current_timestamp_ms() + 60_000)
            .unwrap()
            .is_none()
    );
    assert!(db.get_profile_since(BOB, 0).unwrap().is_none());
}

#[test]
fn test_upsert_profile_replaces_snapshot() {
    let (_temp_dir, db) = create_test_db();
    db.upsert_profile(&profile(ALICE, &[BOB], &[(440, 1)])).unwrap();
    db.upsert_profile(&profile(ALICE, &[], &[(440, 90)])).unwrap();

    let stored = db.get_profile(ALICE).unwrap().unwrap();
    assert!(stored.friend_ids.is_empty());
    assert_eq!(stored.owned[0].usage_minutes, 90);
}

#[test]
fn test_content_items_are_write_once() {
    let (_temp_dir, db) = create_test_db();
    let original = ContentItem {
        content_id: 440,
        name: "Team Fortress 2".to_string(),
        icon_url: "icon".to_string(),
        logo_url: "logo".to_string(),
    };
    let mut renamed = original.clone();
    renamed.name = "Renamed".to_string();

    assert_eq!(db.insert_content_items(&[original.clone()]).unwrap(), 1);
    assert_eq!(db.insert_content_items(&[renamed]).unwrap(), 0);

    let items = db.get_content_items(&[440, 999]).unwrap();
    assert_eq!(items, vec![original]);
}

// ============================================================================
// Node Tests
// ============================================================================

#[test]
fn test_nodes_ordered_by_depth() {
    let (_temp_dir, db) = create_test_db();
    db.insert_job(&CrawlJob::new("job1", vec![ALICE.to_string()], 2))
        .unwrap();

    db.upsert_node("job1", &node(BOB, 1, NodeStatus::Crawled)).unwrap();
    db.upsert_node("job1", &node(ALICE, 0, NodeStatus::Crawled)).unwrap();

    let nodes = db.get_nodes("job1").unwrap();
    assert_eq!(nodes[0].profile_id, ALICE);
    assert_eq!(nodes[0].parent, None);
    assert_eq!(nodes[1].profile_id, BOB);
    assert_eq!(nodes[1].parent.as_deref(), Some(ALICE));
}

#[test]
fn test_upsert_node_has_one_row_per_profile() {
    let (_temp_dir, db) = create_test_db();
    db.insert_job(&CrawlJob::new("job1", vec![ALICE.to_string()], 2))
        .unwrap();

    db.upsert_node("job1", &node(BOB, 1, NodeStatus::Skipped)).unwrap();
    let mut failed = node(BOB, 1, NodeStatus::Failed);
    failed.error = Some("private profile".to_string());
    db.upsert_node("job1", &failed).unwrap();

    let nodes = db.get_nodes("job1").unwrap();
    assert_eq!(nodes, vec![failed]);

    let counts = db.count_nodes_by_status("job1").unwrap();
    assert_eq!(counts, vec![("failed".to_string(), 1)]);
}

#[test]
fn test_node_for_unknown_job_rejected() {
    let (_temp_dir, db) = create_test_db();
    assert!(db.upsert_node("ghost", &node(BOB, 1, NodeStatus::Crawled)).is_err());
}

// ============================================================================
// Graph Tests
// ============================================================================

fn artifact(job_id: &str, name: &str) -> GraphArtifact {
    let mut origin = profile(ALICE, &[], &[]);
    origin.details.persona_name = name.to_string();
    GraphArtifact {
        job_id: job_id.to_string(),
        origin: GraphNode {
            profile: origin,
            seed: ALICE.to_string(),
            parent: None,
            depth: 0,
            max_depth: 1,
        },
        nodes: Vec::new(),
        top_content: Vec::new(),
        created_at: 42,
    }
}

#[test]
fn test_graph_is_written_once() {
    let (_temp_dir, db) = create_test_db();
    db.insert_job(&CrawlJob::new("job1", vec![ALICE.to_string()], 1))
        .unwrap();

    assert!(db.insert_graph(&artifact("job1", "first")).unwrap());
    assert!(!db.insert_graph(&artifact("job1", "second")).unwrap());

    let stored = db.get_graph("job1").unwrap().unwrap();
    assert_eq!(stored.origin.profile.details.persona_name, "first");
}

// ============================================================================
// Async Store Tests
// ============================================================================

#[tokio::test]
async fn test_sqlite_store_implements_store_contracts() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&temp_dir.path().join("store.db")).unwrap();

    let job = CrawlJob::new("job1", vec![ALICE.to_string()], 1);
    store.create_job(&job).await.unwrap();
    assert!(store.create_job(&job).await.is_err());

    store
        .save_profile(&profile(ALICE, &[BOB], &[(10, 5)]))
        .await
        .unwrap();
    store
        .save_node("job1", &node(ALICE, 0, NodeStatus::Crawled))
        .await
        .unwrap();
    store
        .save_content_items(&[ContentItem::placeholder(10)])
        .await
        .unwrap();

    assert_eq!(store.job_nodes("job1").await.unwrap().len(), 1);
    assert!(store.get_profile(ALICE).await.unwrap().is_some());
    assert_eq!(store.get_content_items(&[10]).await.unwrap().len(), 1);
    assert_eq!(store.unfinished_jobs().await.unwrap().len(), 1);

    store.save_graph(&artifact("job1", "graph")).await.unwrap();
    assert!(store.get_graph("job1").await.unwrap().is_some());
    assert_eq!(store.list_jobs(5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sqlite_store_update_of_unknown_job_fails() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&temp_dir.path().join("store.db")).unwrap();
    let job = CrawlJob::new("ghost", vec![ALICE.to_string()], 1);
    assert!(store.update_job(&job).await.is_err());
    assert!(store.restart_job(&job).await.is_err());
}
