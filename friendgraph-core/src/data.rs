use async_trait::async_trait;
use friendgraph_crawler::error::StoreError;
use friendgraph_crawler::model::{
    AccountDetails, ContentItem, CrawlJob, DiscoveredNode, GraphArtifact, JobState, NodeStatus,
    ProfileRecord, current_timestamp_ms,
};
use friendgraph_crawler::store::{GraphStore, JobStore, ProfileStore, StoreResult};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct Database {
    conn: Connection,
}

const JOB_COLUMNS: &str = "job_id, origins, max_depth, total_discovered, completed, failed, \
                           skipped, state, started_at, finished_at";

impl Database {
    pub fn drop(path: &Path) -> std::io::Result<()> {
        fs::remove_file(path)
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Many small writes from concurrent crawl workers
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Database { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            -- One row per crawl request
            CREATE TABLE IF NOT EXISTS crawl_jobs (
    job_id TEXT PRIMARY KEY,
    origins TEXT NOT NULL,           -- JSON array, input order
    max_depth INTEGER NOT NULL,
    total_discovered INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL CHECK(state IN ('pending', 'running', 'completed', 'partially_failed', 'cancelled')),
    started_at INTEGER NOT NULL,
    finished_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_crawl_jobs_lookup ON crawl_jobs(origins, max_depth, state);

-- Latest snapshot of every fetched profile
CREATE TABLE IF NOT EXISTS profiles (
    profile_id TEXT PRIMARY KEY,
    persona_name TEXT NOT NULL,
    profile_url TEXT NOT NULL,
    avatar TEXT NOT NULL,
    time_created INTEGER NOT NULL,
    country_code TEXT,
    friend_ids TEXT NOT NULL,        -- JSON array, source order
    owned TEXT NOT NULL,             -- JSON array of {content_id, usage_minutes}
    fetched_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS content_items (
    content_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    icon_url TEXT NOT NULL,
    logo_url TEXT NOT NULL
);

-- Nodes reached by each job
CREATE TABLE IF NOT EXISTS job_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    profile_id TEXT NOT NULL,
    seed TEXT NOT NULL,
    parent TEXT,                     -- profile whose friend list led here
    depth INTEGER NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('crawled', 'failed', 'skipped')),
    error TEXT,
    FOREIGN KEY(job_id) REFERENCES crawl_jobs(job_id) ON DELETE CASCADE,
    UNIQUE(job_id, profile_id)
);

CREATE INDEX IF NOT EXISTS idx_job_nodes_job ON job_nodes(job_id);
CREATE INDEX IF NOT EXISTS idx_job_nodes_status ON job_nodes(job_id, status);

-- Aggregated artifacts, written once
CREATE TABLE IF NOT EXISTS graphs (
    job_id TEXT PRIMARY KEY,
    artifact TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY(job_id) REFERENCES crawl_jobs(job_id) ON DELETE CASCADE
);
            ",
        )?;
        Ok(())
    }

    // Job management
    pub fn insert_job(&self, job: &CrawlJob) -> Result<()> {
        self.conn.execute(
            "INSERT INTO crawl_jobs (
                job_id, origins, max_depth, total_discovered, completed, failed,
                skipped, state, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &job.job_id,
                to_json(&job.origins)?,
                job.max_depth,
                job.total_discovered as i64,
                job.completed as i64,
                job.failed as i64,
                job.skipped as i64,
                job.state.as_str(),
                job.started_at,
                job.finished_at,
            ],
        )?;
        Ok(())
    }

    /// Writes the job's progress. Counters never go down and a terminal
    /// state is never replaced, so a late write cannot undo a newer one.
    pub fn update_job(&self, job: &CrawlJob) -> Result<usize> {
        self.conn.execute(
            "UPDATE crawl_jobs SET
                total_discovered = MAX(total_discovered, ?2),
                completed = MAX(completed, ?3),
                failed = MAX(failed, ?4),
                skipped = MAX(skipped, ?5),
                state = CASE WHEN state IN ('completed', 'partially_failed', 'cancelled')
                             THEN state ELSE ?6 END,
                finished_at = COALESCE(finished_at, ?7)
             WHERE job_id = ?1",
            params![
                &job.job_id,
                job.total_discovered as i64,
                job.completed as i64,
                job.failed as i64,
                job.skipped as i64,
                job.state.as_str(),
                job.finished_at,
            ],
        )
    }

    /// Starts a new run of an unfinished job: `failed` and `skipped` are
    /// replaced, the other counters keep the never-lower guard. Returns 0
    /// when the job is missing or already terminal.
    pub fn restart_job(&self, job: &CrawlJob) -> Result<usize> {
        self.conn.execute(
            "UPDATE crawl_jobs SET
                total_discovered = MAX(total_discovered, ?2),
                completed = MAX(completed, ?3),
                failed = ?4,
                skipped = ?5,
                state = ?6
             WHERE job_id = ?1 AND state IN ('pending', 'running')",
            params![
                &job.job_id,
                job.total_discovered as i64,
                job.completed as i64,
                job.failed as i64,
                job.skipped as i64,
                job.state.as_str(),
            ],
        )
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<CrawlJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM crawl_jobs WHERE job_id = ?1",
            JOB_COLUMNS
        ))?;
        stmt.query_row(params![job_id], job_from_row).optional()
    }

    /// Most recent completed or partially failed job for these origins and depth.
    pub fn find_job(&self, origins: &[String], max_depth: u32) -> Result<Option<CrawlJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM crawl_jobs
             WHERE origins = ?1 AND max_depth = ?2
               AND state IN ('completed', 'partially_failed')
             ORDER BY started_at DESC, rowid DESC
             LIMIT 1",
            JOB_COLUMNS
        ))?;
        stmt.query_row(params![to_json(origins)?, max_depth], job_from_row)
            .optional()
    }

    pub fn unfinished_jobs(&self) -> Result<Vec<CrawlJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM crawl_jobs WHERE state IN ('pending', 'running')
             ORDER BY started_at, rowid",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn list_jobs(&self, limit: usize) -> Result<Vec<CrawlJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM crawl_jobs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![limit as i64], job_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(jobs)
    }

    // Profile operations
    pub fn upsert_profile(&self, record: &ProfileRecord) -> Result<()> {
        let details = &record.details;
        self.conn.execute(
            "INSERT INTO profiles (
                profile_id, persona_name, profile_url, avatar, time_created,
                country_code, friend_ids, owned, fetched_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(profile_id) DO UPDATE SET
                persona_name = excluded.persona_name,
                profile_url = excluded.profile_url,
                avatar = excluded.avatar,
                time_created = excluded.time_created,
                country_code = excluded.country_code,
                friend_ids = excluded.friend_ids,
                owned = excluded.owned,
                fetched_at = excluded.fetched_at",
            params![
                &details.steam_id,
                &details.persona_name,
                &details.profile_url,
                &details.avatar,
                details.time_created,
                &details.country_code,
                to_json(&record.friend_ids)?,
                to_json(&record.owned)?,
                current_timestamp_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, profile_id: &str) -> Result<Option<ProfileRecord>> {
        self.get_profile_since(profile_id, i64::MIN)
    }

    /// The stored profile if it was fetched at or after `fetched_after`.
    pub fn get_profile_since(
        &self,
        profile_id: &str,
        fetched_after: i64,
    ) -> Result<Option<ProfileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT profile_id, persona_name, profile_url, avatar, time_created,
                    country_code, friend_ids, owned
             FROM profiles WHERE profile_id = ?1 AND fetched_at >= ?2",
        )?;
        stmt.query_row(params![profile_id, fetched_after], |row| {
            Ok(ProfileRecord {
                details: AccountDetails {
                    steam_id: row.get(0)?,
                    persona_name: row.get(1)?,
                    profile_url: row.get(2)?,
                    avatar: row.get(3)?,
                    time_created: row.get(4)?,
                    country_code: row.get(5)?,
                },
                friend_ids: from_json(row, 6)?,
                owned: from_json(row, 7)?,
            })
        })
        .optional()
    }

    // Content metadata
    /// Inserts content items that are not stored yet; existing rows are kept.
    pub fn insert_content_items(&self, items: &[ContentItem]) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO content_items (content_id, name, icon_url, logo_url)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut inserted = 0;
        for item in items {
            inserted += stmt.execute(params![
                item.content_id as i64,
                &item.name,
                &item.icon_url,
                &item.logo_url,
            ])?;
        }
        Ok(inserted)
    }

    pub fn get_content_items(&self, content_ids: &[u64]) -> Result<Vec<ContentItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT content_id, name, icon_url, logo_url FROM content_items WHERE content_id = ?1",
        )?;
        let mut items = Vec::with_capacity(content_ids.len());
        for id in content_ids {
            let item = stmt
                .query_row(params![*id as i64], |row| {
                    Ok(ContentItem {
                        content_id: row.get::<_, i64>(0)? as u64,
                        name: row.get(1)?,
                        icon_url: row.get(2)?,
                        logo_url: row.get(3)?,
                    })
                })
                .optional()?;
            items.extend(item);
        }
        Ok(items)
    }

    // Node operations
    pub fn upsert_node(&self, job_id: &str, node: &DiscoveredNode) -> Result<()> {
        self.conn.execute(
            "INSERT INTO job_nodes (job_id, profile_id, seed, parent, depth, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(job_id, profile_id) DO UPDATE SET
                seed = excluded.seed,
                parent = excluded.parent,
                depth = excluded.depth,
                status = excluded.status,
                error = excluded.error",
            params![
                job_id,
                &node.profile_id,
                &node.seed,
                &node.parent,
                node.depth,
                node.status.as_str(),
                &node.error,
            ],
        )?;
        Ok(())
    }

    pub fn get_nodes(&self, job_id: &str) -> Result<Vec<DiscoveredNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT profile_id, seed, parent, depth, status, error FROM job_nodes
             WHERE job_id = ?1 ORDER BY depth, id",
        )?;
        let nodes = stmt
            .query_map(params![job_id], |row| {
                let status: String = row.get(4)?;
                Ok(DiscoveredNode {
                    profile_id: row.get(0)?,
                    seed: row.get(1)?,
                    parent: row.get(2)?,
                    depth: row.get(3)?,
                    status: NodeStatus::parse(&status)
                        .ok_or_else(|| invalid_text(4, &status))?,
                    error: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(nodes)
    }

    pub fn count_nodes_by_status(&self, job_id: &str) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM job_nodes WHERE job_id = ?1 GROUP BY status",
        )?;
        let counts = stmt
            .query_map(params![job_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(counts)
    }

    // Graph artifacts
    /// Stores the artifact unless one exists for the job. Returns whether
    /// this call wrote it.
    pub fn insert_graph(&self, artifact: &GraphArtifact) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO graphs (job_id, artifact, created_at) VALUES (?1, ?2, ?3)",
            params![&artifact.job_id, to_json(artifact)?, artifact.created_at],
        )?;
        Ok(changed > 0)
    }

    pub fn get_graph(&self, job_id: &str) -> Result<Option<GraphArtifact>> {
        let mut stmt = self
            .conn
            .prepare("SELECT artifact FROM graphs WHERE job_id = ?1")?;
        stmt.query_row(params![job_id], |row| from_json(row, 0))
            .optional()
    }

    pub fn get_connection(&self) -> &Connection {
        &self.conn
    }
}

fn job_from_row(row: &Row<'_>) -> Result<CrawlJob> {
    let state: String = row.get(7)?;
    Ok(CrawlJob {
        job_id: row.get(0)?,
        origins: from_json(row, 1)?,
        max_depth: row.get(2)?,
        total_discovered: row.get::<_, i64>(3)? as usize,
        completed: row.get::<_, i64>(4)? as usize,
        failed: row.get::<_, i64>(5)? as usize,
        skipped: row.get::<_, i64>(6)? as usize,
        state: JobState::parse(&state).ok_or_else(|| invalid_text(7, &state))?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn invalid_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value '{}'", value).into(),
    )
}

/// Async store adapter over a shared [`Database`]. Each call runs on the
/// blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::new(path)?))
    }

    async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let db = db
                .lock()
                .map_err(|_| StoreError::Backend("database lock poisoned".to_string()))?;
            f(&db).map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    pub async fn list_jobs(&self, limit: usize) -> StoreResult<Vec<CrawlJob>> {
        self.call(move |db| db.list_jobs(limit)).await
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: &CrawlJob) -> StoreResult<()> {
        let job = job.clone();
        self.call(move |db| db.insert_job(&job)).await
    }

    async fn update_job(&self, job: &CrawlJob) -> StoreResult<()> {
        let job = job.clone();
        let updated = self.call(move |db| db.update_job(&job)).await?;
        if updated == 0 {
            return Err(StoreError::Backend("job does not exist".to_string()));
        }
        Ok(())
    }

    async fn restart_job(&self, job: &CrawlJob) -> StoreResult<()> {
        let job = job.clone();
        let restarted = self.call(move |db| db.restart_job(&job)).await?;
        if restarted == 0 {
            return Err(StoreError::Backend(
                "job does not exist or has already finished".to_string(),
            ));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<CrawlJob>> {
        let job_id = job_id.to_string();
        self.call(move |db| db.get_job(&job_id)).await
    }

    async fn find_reusable_job(
        &self,
        origins: &[String],
        max_depth: u32,
    ) -> StoreResult<Option<CrawlJob>> {
        let origins = origins.to_vec();
        self.call(move |db| db.find_job(&origins, max_depth)).await
    }

    async fn unfinished_jobs(&self) -> StoreResult<Vec<CrawlJob>> {
        self.call(|db| db.unfinished_jobs()).await
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn save_profile(&self, record: &ProfileRecord) -> StoreResult<()> {
        let record = record.clone();
        self.call(move |db| db.upsert_profile(&record)).await
    }

    async fn get_profile(&self, profile_id: &str) -> StoreResult<Option<ProfileRecord>> {
        let profile_id = profile_id.to_string();
        self.call(move |db| db.get_profile(&profile_id)).await
    }

    async fn get_profile_since(
        &self,
        profile_id: &str,
        fetched_after: i64,
    ) -> StoreResult<Option<ProfileRecord>> {
        let profile_id = profile_id.to_string();
        self.call(move |db| db.get_profile_since(&profile_id, fetched_after))
            .await
    }

    async fn save_content_items(&self, items: &[ContentItem]) -> StoreResult<()> {
        let items = items.to_vec();
        self.call(move |db| db.insert_content_items(&items).map(|_| ()))
            .await
    }

    async fn get_content_items(&self, content_ids: &[u64]) -> StoreResult<Vec<ContentItem>> {
        let content_ids = content_ids.to_vec();
        self.call(move |db| db.get_content_items(&content_ids)).await
    }

    async fn save_node(&self, job_id: &str, node: &DiscoveredNode) -> StoreResult<()> {
        let job_id = job_id.to_string();
        let node = node.clone();
        self.call(move |db| db.upsert_node(&job_id, &node)).await
    }

    async fn job_nodes(&self, job_id: &str) -> StoreResult<Vec<DiscoveredNode>> {
        let job_id = job_id.to_string();
        self.call(move |db| db.get_nodes(&job_id)).await
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn save_graph(&self, artifact: &GraphArtifact) -> StoreResult<()> {
        let artifact = artifact.clone();
        self.call(move |db| db.insert_graph(&artifact).map(|_| ()))
            .await
    }

    async fn get_graph(&self, job_id: &str) -> StoreResult<Option<GraphArtifact>> {
        let job_id = job_id.to_string();
        self.call(move |db| db.get_graph(&job_id)).await
    }
}
