use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{
    core::{
        domain::{AccessToken, Category, FlowStatus, Project, ResultStatus, TestFlow, TestResult},
        error::{Error as CoreError, Result as CoreResult},
        ports::{FlowRepository, ResultPage, SchedulableFlow},
    },
    paths::data_dir,
};

const FLOW_COLUMNS: &str =
    "f.id, f.project_id, f.name, f.description, f.category, f.methods_json, f.status, f.last_run, f.duration";
const RESULT_COLUMNS: &str = "id, flow_id, status, started_at, ended_at, duration, logs_json, screenshots_json, error_message, attempt_group, attempt";

/// SQLite-backed store for flows, results and the collaborator records they reference.
#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(custom_root: Option<PathBuf>) -> Result<Self> {
        let base = custom_root.unwrap_or_else(data_dir);
        if !base.exists() {
            fs::create_dir_all(&base)
                .with_context(|| format!("Failed to create data directory {}", base.display()))?;
        }
        let db_path = base.join("flowbench.sqlite3");
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    /// Marks flows left RUNNING by a previous process as FAILED. Returns how many were reset.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.connect()?;
        let changed = conn
            .execute(
                "UPDATE flows SET status = 'FAILED' WHERE status = 'RUNNING'",
                [],
            )
            .context("Failed to reset interrupted flows")?;
        Ok(changed)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("Failed to open flow database {}", self.db_path.display())
        })?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                github_url TEXT,
                staging_url TEXT,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                access_token TEXT
            );
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                methods_json TEXT NOT NULL,
                status TEXT NOT NULL,
                last_run INTEGER,
                duration INTEGER
            );
            CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL REFERENCES flows(id),
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                logs_json TEXT NOT NULL,
                screenshots_json TEXT NOT NULL,
                error_message TEXT,
                attempt_group TEXT,
                attempt INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS results_by_flow ON results(flow_id, started_at);
            "#,
        )
        .context("Failed to initialise schema")?;
        Ok(())
    }

    /// Runs `op` on a fresh connection off the async runtime.
    async fn blocking<T, F>(&self, op: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> CoreResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store
                .connect()
                .map_err(|e| CoreError::Persistence(format!("{e:#}")))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| CoreError::System(format!("Join error: {e}")))?
    }
}

struct FlowRow {
    id: String,
    project_id: String,
    name: String,
    description: String,
    category: String,
    methods_json: String,
    status: String,
    last_run: Option<i64>,
    duration: Option<i64>,
}

impl FlowRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            category: row.get(4)?,
            methods_json: row.get(5)?,
            status: row.get(6)?,
            last_run: row.get(7)?,
            duration: row.get(8)?,
        })
    }

    fn into_flow(self) -> CoreResult<TestFlow> {
        let category: Category = self.category.parse()?;
        let status = FlowStatus::from_db(&self.status).ok_or_else(|| {
            CoreError::Persistence(format!("Invalid flow status '{}' in store", self.status))
        })?;
        Ok(TestFlow {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            description: self.description,
            category,
            methods: serde_json::from_str(&self.methods_json)?,
            status,
            last_run: self.last_run,
            duration: self.duration,
        })
    }
}

struct ResultRow {
    id: String,
    flow_id: String,
    status: String,
    started_at: i64,
    ended_at: i64,
    duration: i64,
    logs_json: String,
    screenshots_json: String,
    error_message: Option<String>,
    attempt_group: Option<String>,
    attempt: i64,
}

impl ResultRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            duration: row.get(5)?,
            logs_json: row.get(6)?,
            screenshots_json: row.get(7)?,
            error_message: row.get(8)?,
            attempt_group: row.get(9)?,
            attempt: row.get(10)?,
        })
    }

    fn into_result(self) -> CoreResult<TestResult> {
        let status = ResultStatus::from_db(&self.status).ok_or_else(|| {
            CoreError::Persistence(format!("Invalid result status '{}' in store", self.status))
        })?;
        Ok(TestResult {
            id: self.id,
            flow_id: self.flow_id,
            status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration: self.duration,
            logs: serde_json::from_str(&self.logs_json)?,
            screenshot_urls: serde_json::from_str(&self.screenshots_json)?,
            error_message: self.error_message,
            attempt_group: self.attempt_group,
            attempt: u32::try_from(self.attempt).unwrap_or(1),
        })
    }
}

fn collect_results(rows: Vec<ResultRow>) -> CoreResult<Vec<TestResult>> {
    rows.into_iter().map(ResultRow::into_result).collect()
}

#[async_trait]
impl FlowRepository for SqliteStore {
    async fn get_flow(&self, flow_id: &str) -> CoreResult<Option<TestFlow>> {
        let flow_id = flow_id.to_string();
        self.blocking(move |conn| {
            let sql = format!("SELECT {FLOW_COLUMNS} FROM flows f WHERE f.id = ?1");
            let row = conn
                .query_row(&sql, params![flow_id], FlowRow::read)
                .optional()?;
            row.map(FlowRow::into_flow).transpose()
        })
        .await
    }

    async fn get_project(&self, project_id: &str) -> CoreResult<Option<Project>> {
        let project_id = project_id.to_string();
        self.blocking(move |conn| {
            let project = conn
                .query_row(
                    r#"
                    SELECT id, name, owner_id, github_url, staging_url, active
                    FROM projects
                    WHERE id = ?1
                    "#,
                    params![project_id],
                    |row| {
                        Ok(Project {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            owner_id: row.get(2)?,
                            github_url: row.get(3)?,
                            staging_url: row.get(4)?,
                            active: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(project)
        })
        .await
    }

    async fn access_token(&self, user_id: &str) -> CoreResult<Option<AccessToken>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let token: Option<Option<String>> = conn
                .query_row(
                    "SELECT access_token FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(token.flatten().filter(|t| !t.is_empty()).map(AccessToken::new))
        })
        .await
    }

    async fn try_start(&self, flow_id: &str, started_at: i64) -> CoreResult<bool> {
        let flow_id = flow_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE flows SET status = 'RUNNING', last_run = ?2 WHERE id = ?1 AND status != 'RUNNING'",
                params![flow_id, started_at],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn finish(&self, flow_id: &str, status: FlowStatus, duration: i64) -> CoreResult<()> {
        let flow_id = flow_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE flows SET status = ?2, duration = ?3 WHERE id = ?1",
                params![flow_id, status.as_str(), duration],
            )?;
            if changed == 0 {
                return Err(CoreError::NotFound(format!("Flow {flow_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn insert_result(&self, result: &TestResult) -> CoreResult<()> {
        let result = result.clone();
        self.blocking(move |conn| {
            let logs_json = serde_json::to_string(&result.logs)?;
            let screenshots_json = serde_json::to_string(&result.screenshot_urls)?;
            conn.execute(
                &format!(
                    "INSERT INTO results ({RESULT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    result.id,
                    result.flow_id,
                    result.status.as_str(),
                    result.started_at,
                    result.ended_at,
                    result.duration,
                    logs_json,
                    screenshots_json,
                    result.error_message,
                    result.attempt_group,
                    i64::from(result.attempt),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_results(
        &self,
        flow_id: &str,
        page: usize,
        limit: usize,
    ) -> CoreResult<ResultPage> {
        let flow_id = flow_id.to_string();
        let limit = limit.max(1);
        let offset = page.saturating_sub(1).saturating_mul(limit);
        self.blocking(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM results WHERE flow_id = ?1",
                params![flow_id],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {RESULT_COLUMNS}
                FROM results
                WHERE flow_id = ?1
                ORDER BY started_at DESC, rowid DESC
                LIMIT ?2 OFFSET ?3
                "#
            ))?;
            let rows = stmt
                .query_map(
                    params![flow_id, limit as i64, offset as i64],
                    ResultRow::read,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ResultPage {
                results: collect_results(rows)?,
                total: usize::try_from(total).unwrap_or_default(),
            })
        })
        .await
    }

    async fn get_result(&self, flow_id: &str, result_id: &str) -> CoreResult<Option<TestResult>> {
        let flow_id = flow_id.to_string();
        let result_id = result_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {RESULT_COLUMNS} FROM results WHERE id = ?1 AND flow_id = ?2"),
                    params![result_id, flow_id],
                    ResultRow::read,
                )
                .optional()?;
            row.map(ResultRow::into_result).transpose()
        })
        .await
    }

    /// Every non-RUNNING flow of an active project. Finished flows are included on
    /// purpose; [`Scheduler::should_run`](crate::application::Scheduler::should_run)
    /// applies the re-run interval.
    async fn list_schedulable_flows(&self) -> CoreResult<Vec<SchedulableFlow>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {FLOW_COLUMNS}, p.owner_id
                FROM flows f
                JOIN projects p ON p.id = f.project_id
                WHERE p.active = 1 AND f.status != 'RUNNING'
                ORDER BY f.id
                "#
            ))?;
            let rows = stmt
                .query_map([], |row| Ok((FlowRow::read(row)?, row.get::<_, String>(9)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(flow, owner_id)| -> CoreResult<SchedulableFlow> {
                    Ok(SchedulableFlow {
                        flow: flow.into_flow()?,
                        owner_id,
                    })
                })
                .collect()
        })
        .await
    }

    async fn delete_results_before(&self, cutoff: i64) -> CoreResult<Vec<TestResult>> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {RESULT_COLUMNS} FROM results WHERE ended_at < ?1"
                ))?;
                stmt.query_map(params![cutoff], ResultRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.execute("DELETE FROM results WHERE ended_at < ?1", params![cutoff])?;
            tx.commit()?;
            collect_results(rows)
        })
        .await
    }

    async fn save_project(&self, project: &Project) -> CoreResult<()> {
        let project = project.clone();
        self.blocking(move |conn| {
            conn.execute(
                r#"
                INSERT INTO projects (id, name, owner_id, github_url, staging_url, active)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id)
                DO UPDATE SET
                    name=excluded.name,
                    owner_id=excluded.owner_id,
                    github_url=excluded.github_url,
                    staging_url=excluded.staging_url,
                    active=excluded.active
                "#,
                params![
                    project.id,
                    project.name,
                    project.owner_id,
                    project.github_url,
                    project.staging_url,
                    project.active
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_flow(&self, flow: &TestFlow) -> CoreResult<()> {
        let flow = flow.clone();
        self.blocking(move |conn| {
            let methods_json = serde_json::to_string(&flow.methods)?;
            conn.execute(
                r#"
                INSERT INTO flows (id, project_id, name, description, category, methods_json, status, last_run, duration)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id)
                DO UPDATE SET
                    project_id=excluded.project_id,
                    name=excluded.name,
                    description=excluded.description,
                    category=excluded.category,
                    methods_json=excluded.methods_json
                "#,
                params![
                    flow.id,
                    flow.project_id,
                    flow.name,
                    flow.description,
                    flow.category.as_str(),
                    methods_json,
                    flow.status.as_str(),
                    flow.last_run,
                    flow.duration
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_access_token(&self, user_id: &str, token: &AccessToken) -> CoreResult<()> {
        let user_id = user_id.to_string();
        let token = token.clone();
        self.blocking(move |conn| {
            conn.execute(
                r#"
                INSERT INTO users (id, access_token) VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET access_token=excluded.access_token
                "#,
                params![user_id, token.expose()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::LogLine;
    use tempfile::tempdir;

    async fn seed(store: &SqliteStore) {
        store
            .save_project(&Project {
                id: "p1".into(),
                name: "shop".into(),
                owner_id: "owner".into(),
                github_url: Some("https://github.com/acme/shop".into()),
                staging_url: None,
                active: true,
            })
            .await
            .unwrap();
        store
            .save_flow(&TestFlow {
                id: "f1".into(),
                project_id: "p1".into(),
                name: "math".into(),
                description: "adds numbers".into(),
                category: Category::Unit,
                methods: vec!["add numbers".into()],
                status: FlowStatus::Idle,
                last_run: None,
                duration: None,
            })
            .await
            .unwrap();
    }

    fn result(id: &str, started_at: i64) -> TestResult {
        TestResult {
            id: id.into(),
            flow_id: "f1".into(),
            status: ResultStatus::Failed,
            started_at,
            ended_at: started_at + 5,
            duration: 5,
            logs: vec![LogLine::stdout("npm test"), LogLine::stderr("boom")],
            screenshot_urls: vec!["/screenshots/screenshot-f1-a-1.png".into()],
            error_message: Some("Method failed: add numbers".into()),
            attempt_group: Some("g1".into()),
            attempt: 2,
        }
    }

    #[tokio::test]
    async fn start_is_exclusive_until_finished() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        seed(&store).await;

        assert!(store.try_start("f1", 100).await.unwrap());
        assert!(!store.try_start("f1", 101).await.unwrap());
        let flow = store.get_flow("f1").await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Running);
        assert_eq!(flow.last_run, Some(100));

        store.finish("f1", FlowStatus::Success, 42).await.unwrap();
        let flow = store.get_flow("f1").await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Success);
        assert_eq!(flow.duration, Some(42));
        assert!(store.try_start("f1", 200).await.unwrap());
    }

    #[tokio::test]
    async fn interrupted_runs_are_failed_on_recovery() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        seed(&store).await;
        assert!(store.try_start("f1", 100).await.unwrap());

        assert_eq!(store.recover_interrupted().unwrap(), 1);
        let flow = store.get_flow("f1").await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Failed);
        assert_eq!(store.recover_interrupted().unwrap(), 0);
    }

    #[tokio::test]
    async fn results_page_newest_first_and_keep_logs() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        seed(&store).await;
        for (idx, started) in [10, 30, 20].into_iter().enumerate() {
            store
                .insert_result(&result(&format!("r{idx}"), started))
                .await
                .unwrap();
        }

        let page = store.list_results("f1", 1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        let ids: Vec<_> = page.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2"]);

        let detail = store.get_result("f1", "r0").await.unwrap().unwrap();
        assert_eq!(detail, result("r0", 10));
        assert!(store.get_result("other", "r0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_returns_deleted_rows() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        seed(&store).await;
        store.insert_result(&result("old", 10)).await.unwrap();
        store.insert_result(&result("new", 1_000)).await.unwrap();

        let removed = store.delete_results_before(500).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "old");
        assert_eq!(store.list_results("f1", 1, 10).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn schedulable_flows_skip_running_and_inactive() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        seed(&store).await;

        let flows = store.list_schedulable_flows().await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].owner_id, "owner");

        store.try_start("f1", 1).await.unwrap();
        assert!(store.list_schedulable_flows().await.unwrap().is_empty());

        assert_eq!(store.recover_interrupted().unwrap(), 1);
        let flow = store.get_flow("f1").await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Failed);
    }

    #[tokio::test]
    async fn empty_token_counts_as_unlinked() {
        let temp = tempdir().unwrap();
        let store = SqliteStore::open(Some(temp.path().to_path_buf())).unwrap();
        store
            .save_access_token("u1", &AccessToken::new(""))
            .await
            .unwrap();
        assert!(store.access_token("u1").await.unwrap().is_none());
        store
            .save_access_token("u1", &AccessToken::new("ghp_x"))
            .await
            .unwrap();
        assert_eq!(
            store.access_token("u1").await.unwrap().unwrap().expose(),
            "ghp_x"
        );
    }
}
