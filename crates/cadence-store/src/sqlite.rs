use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use cadence_core::context::RunContext;
use cadence_core::error::{FlowError, Result};
use cadence_core::traits::{FlowStore, StatusChange};
use cadence_core::types::{Flow, FlowId, FlowRun, RunId, RunOutcome, RunStatus, TriggerKind};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        active INTEGER NOT NULL,
        runs INTEGER NOT NULL DEFAULT 0,
        succeeded INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        definition TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_flows_trigger ON flows(active, trigger_type);

    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        conversation_id TEXT,
        contact_id TEXT,
        status TEXT NOT NULL,
        current_node_id TEXT NOT NULL,
        context TEXT NOT NULL,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        resume_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_runs_flow ON runs(flow_id);
    CREATE INDEX IF NOT EXISTS idx_runs_wakeup ON runs(status, resume_at);";

/// SQLite-backed flow and run persistence.
///
/// Flow definitions are stored as their full JSON document; the stats
/// counters and the active flag live in columns so they can be updated
/// without rewriting the document, and the columns are authoritative on
/// read. Status transitions are row-count CAS updates.
pub struct SqliteFlowStore {
    conn: Mutex<Connection>,
}

impl SqliteFlowStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlowError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Flow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

fn parse_status(s: &str) -> Result<RunStatus> {
    match s {
        "running" => Ok(RunStatus::Running),
        "paused" => Ok(RunStatus::Paused),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        other => Err(FlowError::Database(format!("unknown run status '{}'", other))),
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<(FlowRun, String, String)> {
    // Status and context come back as raw strings; the caller finishes
    // parsing them so errors stay on our error type.
    let status_str: String = row.get(4)?;
    let context_str: String = row.get(6)?;
    let completed_at: Option<String> = row.get(9)?;
    let resume_at: Option<String> = row.get(10)?;
    let started_at: String = row.get(8)?;

    let run = FlowRun {
        id: RunId::from_string(row.get::<_, String>(0)?),
        flow_id: FlowId::from_string(row.get::<_, String>(1)?),
        conversation_id: row.get(2)?,
        contact_id: row.get(3)?,
        status: RunStatus::Running, // placeholder, replaced by caller
        current_node_id: row.get(5)?,
        context: RunContext::new(), // placeholder, replaced by caller
        error: row.get(7)?,
        started_at: parse_timestamp(&started_at),
        completed_at: completed_at.as_deref().map(parse_timestamp),
        resume_at: resume_at.as_deref().map(parse_timestamp),
    };
    Ok((run, status_str, context_str))
}

fn finish_run((mut run, status_str, context_str): (FlowRun, String, String)) -> Result<FlowRun> {
    run.status = parse_status(&status_str)?;
    run.context = serde_json::from_str(&context_str)?;
    Ok(run)
}

const RUN_COLUMNS: &str = "id, flow_id, conversation_id, contact_id, status, current_node_id, \
                           context, error, started_at, completed_at, resume_at";

impl SqliteFlowStore {
    fn load_flow(conn: &Connection, id: &str) -> Result<Option<Flow>> {
        let mut stmt = conn
            .prepare("SELECT definition, active, runs, succeeded, failed FROM flows WHERE id = ?1")
            .map_err(db_err)?;

        let row = stmt
            .query_row(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;

        match row {
            Some((definition, active, runs, succeeded, failed)) => {
                let mut flow: Flow = serde_json::from_str(&definition)?;
                flow.active = active;
                flow.stats.runs = runs as u64;
                flow.stats.succeeded = succeeded as u64;
                flow.stats.failed = failed as u64;
                Ok(Some(flow))
            }
            None => Ok(None),
        }
    }
}

impl FlowStore for SqliteFlowStore {
    fn get_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<Flow>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            Self::load_flow(&conn, &id)
        })
    }

    fn put_flow(&self, flow: &Flow) -> BoxFuture<'_, Result<()>> {
        let flow = flow.clone();
        Box::pin(async move {
            let definition = serde_json::to_string(&flow)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO flows (id, name, trigger_type, active, runs, succeeded, failed, definition)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     trigger_type = excluded.trigger_type,
                     active = excluded.active,
                     definition = excluded.definition",
                params![
                    flow.id.0,
                    flow.name,
                    flow.trigger_kind.as_str(),
                    flow.active,
                    flow.stats.runs as i64,
                    flow.stats.succeeded as i64,
                    flow.stats.failed as i64,
                    definition,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_active_by_trigger(&self, kind: TriggerKind) -> BoxFuture<'_, Result<Vec<Flow>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT id FROM flows WHERE active = 1 AND trigger_type = ?1 ORDER BY id")
                .map_err(db_err)?;
            let ids: Vec<String> = stmt
                .query_map(params![kind.as_str()], |row| row.get(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(db_err)?;
            drop(stmt);

            let mut flows = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(flow) = Self::load_flow(&conn, &id)? {
                    flows.push(flow);
                }
            }
            Ok(flows)
        })
    }

    fn create_run(&self, run: &FlowRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let context = serde_json::to_string(&run.context)?;
            let conn = self.lock()?;
            conn.execute(
                &format!("INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)", RUN_COLUMNS),
                params![
                    run.id.0,
                    run.flow_id.0,
                    run.conversation_id,
                    run.contact_id,
                    run.status.as_str(),
                    run.current_node_id,
                    context,
                    run.error,
                    run.started_at.to_rfc3339(),
                    run.completed_at.map(|t| t.to_rfc3339()),
                    run.resume_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<FlowRun>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
                .map_err(db_err)?;

            let row = stmt
                .query_row(params![id], row_to_run)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(db_err(other)),
                })?;

            row.map(finish_run).transpose()
        })
    }

    fn save_progress(
        &self,
        id: &RunId,
        node_id: &str,
        context: &RunContext,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.0.clone();
        let node_id = node_id.to_string();
        let context = context.clone();
        Box::pin(async move {
            let context = serde_json::to_string(&context)?;
            let conn = self.lock()?;
            let updated = conn
                .execute(
                    "UPDATE runs SET current_node_id = ?1, context = ?2
                     WHERE id = ?3 AND status = 'running'",
                    params![node_id, context, id],
                )
                .map_err(db_err)?;
            Ok(updated > 0)
        })
    }

    fn transition_status(
        &self,
        id: &RunId,
        from: &[RunStatus],
        to: RunStatus,
        change: StatusChange,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.0.clone();
        let from: Vec<&'static str> = from.iter().map(RunStatus::as_str).collect();
        Box::pin(async move {
            if from.is_empty() {
                return Ok(false);
            }
            let placeholders = vec!["?"; from.len()].join(", ");
            let sql = format!(
                "UPDATE runs SET status = ?, error = ?, completed_at = ?, resume_at = ?
                 WHERE id = ? AND status IN ({})",
                placeholders
            );

            let mut values: Vec<Option<String>> = vec![
                Some(to.as_str().to_string()),
                change.error.clone(),
                change.completed_at.map(|t| t.to_rfc3339()),
                change.resume_at.map(|t| t.to_rfc3339()),
                Some(id),
            ];
            values.extend(from.iter().map(|s| Some(s.to_string())));

            let conn = self.lock()?;
            let updated = conn
                .execute(&sql, rusqlite::params_from_iter(values))
                .map_err(db_err)?;
            Ok(updated > 0)
        })
    }

    fn increment_stats(&self, flow: &FlowId, outcome: RunOutcome) -> BoxFuture<'_, Result<()>> {
        let flow = flow.0.clone();
        Box::pin(async move {
            let column = match outcome {
                RunOutcome::Started => "runs",
                RunOutcome::Succeeded => "succeeded",
                RunOutcome::Failed => "failed",
            };
            let conn = self.lock()?;
            conn.execute(
                &format!("UPDATE flows SET {col} = {col} + 1 WHERE id = ?1", col = column),
                params![flow],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn due_runs(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM runs
                     WHERE status = 'paused' AND resume_at IS NOT NULL AND resume_at <= ?1
                     ORDER BY resume_at ASC",
                )
                .map_err(db_err)?;
            let ids = stmt
                .query_map(params![now.to_rfc3339()], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            Ok(ids.into_iter().map(RunId::from_string).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::{FlowEdge, FlowNode, NodeKind};
    use chrono::Duration;
    use serde_json::json;

    fn store() -> SqliteFlowStore {
        SqliteFlowStore::in_memory().unwrap()
    }

    fn sample_flow() -> Flow {
        let mut flow = Flow::new("Welcome", TriggerKind::NewContact);
        flow.nodes = vec![
            FlowNode::new("t", NodeKind::Trigger),
            FlowNode::new("m", NodeKind::SendMessage).with_data("message", json!("Hi")),
        ];
        flow.edges = vec![FlowEdge::new("e1", "t", "m")];
        flow
    }

    fn sample_run(flow_id: &FlowId) -> FlowRun {
        FlowRun::new(
            flow_id.clone(),
            Some("conv-1".into()),
            Some("contact-1".into()),
            "t",
            RunContext::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_flow_roundtrip() {
        let store = store();
        let flow = sample_flow();
        store.put_flow(&flow).await.unwrap();

        let loaded = store.get_flow(&flow.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Welcome");
        assert_eq!(loaded.trigger_kind, TriggerKind::NewContact);
        assert_eq!(loaded.nodes.len(), 2);
        assert!(loaded.active);

        assert!(store
            .get_flow(&FlowId::from_string("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stats_columns_survive_redefinition() {
        let store = store();
        let flow = sample_flow();
        store.put_flow(&flow).await.unwrap();

        store
            .increment_stats(&flow.id, RunOutcome::Started)
            .await
            .unwrap();
        store
            .increment_stats(&flow.id, RunOutcome::Succeeded)
            .await
            .unwrap();

        // Saving the definition again (dashboard edit) keeps the counters
        store.put_flow(&flow).await.unwrap();

        let loaded = store.get_flow(&flow.id).await.unwrap().unwrap();
        assert_eq!(loaded.stats.runs, 1);
        assert_eq!(loaded.stats.succeeded, 1);
        assert_eq!(loaded.stats.failed, 0);
    }

    #[tokio::test]
    async fn test_list_active_by_trigger() {
        let store = store();

        let mut active = sample_flow();
        active.name = "active".into();
        store.put_flow(&active).await.unwrap();

        let mut inactive = sample_flow();
        inactive.id = FlowId::new();
        inactive.name = "inactive".into();
        inactive.active = false;
        store.put_flow(&inactive).await.unwrap();

        let mut other_kind = sample_flow();
        other_kind.id = FlowId::new();
        other_kind.trigger_kind = TriggerKind::Keyword;
        store.put_flow(&other_kind).await.unwrap();

        let found = store
            .list_active_by_trigger(TriggerKind::NewContact)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "active");
    }

    #[tokio::test]
    async fn test_run_roundtrip() {
        let store = store();
        let flow = sample_flow();
        store.put_flow(&flow).await.unwrap();

        let mut run = sample_run(&flow.id);
        run.context.set_str("message", "hello");
        store.create_run(&run).await.unwrap();

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.current_node_id, "t");
        assert_eq!(loaded.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(loaded.context.get_str("message"), Some("hello"));
        assert!(loaded.resume_at.is_none());
    }

    #[tokio::test]
    async fn test_save_progress_only_while_running() {
        let store = store();
        let flow = sample_flow();
        let run = sample_run(&flow.id);
        store.create_run(&run).await.unwrap();

        let mut ctx = RunContext::new();
        ctx.set_str("k", "v");
        assert!(store.save_progress(&run.id, "m", &ctx).await.unwrap());

        // Park the run, then progress saves must be rejected
        assert!(store
            .transition_status(
                &run.id,
                &[RunStatus::Running],
                RunStatus::Paused,
                StatusChange::default()
            )
            .await
            .unwrap());
        assert!(!store.save_progress(&run.id, "x", &ctx).await.unwrap());

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_node_id, "m");
        assert_eq!(loaded.context.get_str("k"), Some("v"));
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let store = store();
        let run = sample_run(&FlowId::from_string("f"));
        store.create_run(&run).await.unwrap();

        // Completing a running run applies once
        assert!(store
            .transition_status(
                &run.id,
                &[RunStatus::Running],
                RunStatus::Completed,
                StatusChange {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                }
            )
            .await
            .unwrap());

        // A late cancel loses the race
        assert!(!store
            .transition_status(
                &run.id,
                &[RunStatus::Running, RunStatus::Paused],
                RunStatus::Failed,
                StatusChange {
                    error: Some("Cancelled".into()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                }
            )
            .await
            .unwrap());

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.error.is_none());
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_due_runs() {
        let store = store();
        let now = Utc::now();

        let mut due = sample_run(&FlowId::from_string("f"));
        due.status = RunStatus::Paused;
        due.resume_at = Some(now - Duration::minutes(1));
        store.create_run(&due).await.unwrap();

        let mut future = sample_run(&FlowId::from_string("f"));
        future.status = RunStatus::Paused;
        future.resume_at = Some(now + Duration::hours(1));
        store.create_run(&future).await.unwrap();

        let mut waiting = sample_run(&FlowId::from_string("f"));
        waiting.status = RunStatus::Paused;
        store.create_run(&waiting).await.unwrap();

        let ids = store.due_runs(now).await.unwrap();
        assert_eq!(ids, vec![due.id]);
    }
}
