//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Filters are rendered to
//! parameterized SQL here; nothing else in the crate builds WHERE clauses.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{params, Connection, Database as LibSqlDatabase, Value};
use tracing::info;

use crate::error::StoreError;
use crate::model::{
    App, AssimilateState, Batch, BatchState, FileDeleteState, HostAppVersion, Outcome,
    ResultRecord, ServerState, ValidateState, Workunit, WorkunitWithResults,
};
use crate::store::migrations;
use crate::store::query::{ResultFilter, Shard, WuFilter};
use crate::store::traits::JobStore;

/// libSQL job store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Column order used by every workunit SELECT.
const WU_COLUMNS: &str = "id, create_time, name, appid, error_mask, assimilate_state, \
     file_delete_state, canonical_resultid, need_validate, min_quorum, target_nresults, \
     max_error_results, max_total_results, max_success_results, transition_time, delay_bound, \
     hr_class, app_version_id, batch, transitioner_flags, priority, xml_doc";

/// Column order used by every result SELECT.
const RESULT_COLUMNS: &str = "id, create_time, workunitid, name, server_state, outcome, \
     validate_state, file_delete_state, report_deadline, received_time, sent_time, appid, \
     hostid, userid, app_version_id, priority, exit_status, xml_doc_in, xml_doc_out, stderr_out";

fn query_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Query(e.to_string())
}

fn row_to_wu(row: &libsql::Row) -> Result<Workunit, libsql::Error> {
    Ok(Workunit {
        id: row.get(0)?,
        create_time: row.get(1)?,
        name: row.get(2)?,
        appid: row.get(3)?,
        error_mask: row.get::<i64>(4)? as i32,
        assimilate_state: AssimilateState::from_code(row.get(5)?),
        file_delete_state: FileDeleteState::from_code(row.get(6)?),
        canonical_resultid: row.get(7)?,
        need_validate: row.get::<i64>(8)? != 0,
        min_quorum: row.get::<i64>(9)? as i32,
        target_nresults: row.get::<i64>(10)? as i32,
        max_error_results: row.get::<i64>(11)? as i32,
        max_total_results: row.get::<i64>(12)? as i32,
        max_success_results: row.get::<i64>(13)? as i32,
        transition_time: row.get(14)?,
        delay_bound: row.get(15)?,
        hr_class: row.get::<i64>(16)? as i32,
        app_version_id: row.get(17)?,
        batch: row.get(18)?,
        transitioner_flags: row.get::<i64>(19)? as i32,
        priority: row.get::<i64>(20)? as i32,
        xml_doc: row.get(21)?,
    })
}

fn row_to_result(row: &libsql::Row) -> Result<ResultRecord, libsql::Error> {
    Ok(ResultRecord {
        id: row.get(0)?,
        create_time: row.get(1)?,
        workunitid: row.get(2)?,
        name: row.get(3)?,
        server_state: ServerState::from_code(row.get(4)?),
        outcome: Outcome::from_code(row.get(5)?),
        validate_state: ValidateState::from_code(row.get(6)?),
        file_delete_state: FileDeleteState::from_code(row.get(7)?),
        report_deadline: row.get(8)?,
        received_time: row.get(9)?,
        sent_time: row.get(10)?,
        appid: row.get(11)?,
        hostid: row.get(12)?,
        userid: row.get(13)?,
        app_version_id: row.get(14)?,
        priority: row.get::<i64>(15)? as i32,
        exit_status: row.get::<i64>(16)? as i32,
        xml_doc_in: row.get(17)?,
        xml_doc_out: row.get(18)?,
        stderr_out: row.get(19)?,
    })
}

/// Non-id column values of a workunit, in `WU_COLUMNS` order.
fn wu_values(wu: &Workunit) -> Vec<Value> {
    vec![
        wu.create_time.into(),
        wu.name.clone().into(),
        wu.appid.into(),
        (wu.error_mask as i64).into(),
        wu.assimilate_state.code().into(),
        wu.file_delete_state.code().into(),
        wu.canonical_resultid.into(),
        (wu.need_validate as i64).into(),
        (wu.min_quorum as i64).into(),
        (wu.target_nresults as i64).into(),
        (wu.max_error_results as i64).into(),
        (wu.max_total_results as i64).into(),
        (wu.max_success_results as i64).into(),
        wu.transition_time.into(),
        wu.delay_bound.into(),
        (wu.hr_class as i64).into(),
        wu.app_version_id.into(),
        wu.batch.into(),
        (wu.transitioner_flags as i64).into(),
        (wu.priority as i64).into(),
        wu.xml_doc.clone().into(),
    ]
}

/// Non-id column values of a result, in `RESULT_COLUMNS` order.
fn result_values(r: &ResultRecord) -> Vec<Value> {
    vec![
        r.create_time.into(),
        r.workunitid.into(),
        r.name.clone().into(),
        r.server_state.code().into(),
        r.outcome.code().into(),
        r.validate_state.code().into(),
        r.file_delete_state.code().into(),
        r.report_deadline.into(),
        r.received_time.into(),
        r.sent_time.into(),
        r.appid.into(),
        r.hostid.into(),
        r.userid.into(),
        r.app_version_id.into(),
        (r.priority as i64).into(),
        (r.exit_status as i64).into(),
        r.xml_doc_in.clone().into(),
        r.xml_doc_out.clone().into(),
        r.stderr_out.clone().into(),
    ]
}

// ── Filter rendering ────────────────────────────────────────────────

fn render_wu_filter(filter: &WuFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(s) = filter.assimilate_state {
        clauses.push("assimilate_state = ?".into());
        params.push(s.code().into());
    }
    if let Some(s) = filter.file_delete_state {
        clauses.push("file_delete_state = ?".into());
        params.push(s.code().into());
    }
    if let Some(appid) = filter.appid {
        clauses.push("appid = ?".into());
        params.push(appid.into());
    }
    if let Some(shard) = filter.shard {
        clauses.push("id % ? = ?".into());
        params.push((shard.n as i64).into());
        params.push((shard.r as i64).into());
    }
    if let Some(t) = filter.max_create_time {
        clauses.push("create_time <= ?".into());
        params.push(t.into());
    }
    if let Some(batches) = &filter.batch_in {
        if batches.is_empty() {
            clauses.push("1 = 0".into());
        } else {
            let marks = vec!["?"; batches.len()].join(", ");
            clauses.push(format!("batch IN ({marks})"));
            params.extend(batches.iter().map(|&b| Value::from(b)));
        }
    }
    if let Some(pat) = &filter.xml_doc_like {
        clauses.push("xml_doc LIKE ?".into());
        params.push(pat.clone().into());
    }
    if let Some(due) = filter.transition_due_by {
        clauses.push("transition_time <= ?".into());
        params.push(due.into());
    }

    if clauses.is_empty() {
        ("1 = 1".into(), params)
    } else {
        (clauses.join(" AND "), params)
    }
}

fn render_result_filter(filter: &ResultFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if !filter.file_delete_states.is_empty() {
        let marks = vec!["?"; filter.file_delete_states.len()].join(", ");
        clauses.push(format!("file_delete_state IN ({marks})"));
        params.extend(
            filter
                .file_delete_states
                .iter()
                .map(|s| Value::from(s.code())),
        );
    }
    if let Some(s) = filter.server_state {
        clauses.push("server_state = ?".into());
        params.push(s.code().into());
    }
    if let Some(appid) = filter.appid {
        clauses.push("appid = ?".into());
        params.push(appid.into());
    }
    if let Some(userid) = filter.userid {
        clauses.push("userid = ?".into());
        params.push(userid.into());
    }
    if let Some(shard) = filter.shard {
        clauses.push("id % ? = ?".into());
        params.push((shard.n as i64).into());
        params.push((shard.r as i64).into());
    }
    if let Some(pat) = &filter.xml_doc_like {
        clauses.push("xml_doc_in LIKE ?".into());
        params.push(pat.clone().into());
    }

    if clauses.is_empty() {
        ("1 = 1".into(), params)
    } else {
        (clauses.join(" AND "), params)
    }
}

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn insert_workunit(&self, wu: &Workunit) -> Result<i64, StoreError> {
        let sql = "INSERT INTO workunits (create_time, name, appid, error_mask, \
             assimilate_state, file_delete_state, canonical_resultid, need_validate, \
             min_quorum, target_nresults, max_error_results, max_total_results, \
             max_success_results, transition_time, delay_bound, hr_class, app_version_id, \
             batch, transitioner_flags, priority, xml_doc) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";
        self.conn()
            .execute(sql, wu_values(wu))
            .await
            .map_err(query_err)?;
        Ok(self.conn().last_insert_rowid())
    }

    async fn insert_results(&self, results: &[ResultRecord]) -> Result<Vec<i64>, StoreError> {
        let sql = "INSERT INTO results (create_time, workunitid, name, server_state, outcome, \
             validate_state, file_delete_state, report_deadline, received_time, sent_time, \
             appid, hostid, userid, app_version_id, priority, exit_status, xml_doc_in, \
             xml_doc_out, stderr_out) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err)?;
        let mut ids = Vec::with_capacity(results.len());
        for r in results {
            tx.execute(sql, result_values(r)).await.map_err(query_err)?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit().await.map_err(query_err)?;
        Ok(ids)
    }

    async fn workunit(&self, id: i64) -> Result<Option<Workunit>, StoreError> {
        let sql = format!("SELECT {WU_COLUMNS} FROM workunits WHERE id = ?");
        let mut rows = self
            .conn()
            .query(&sql, params![id])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_wu(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn result(&self, id: i64) -> Result<Option<ResultRecord>, StoreError> {
        let sql = format!("SELECT {RESULT_COLUMNS} FROM results WHERE id = ?");
        let mut rows = self
            .conn()
            .query(&sql, params![id])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_result(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn enumerate_workunits(
        &self,
        filter: &WuFilter,
        limit: usize,
    ) -> Result<Vec<Workunit>, StoreError> {
        let (clause, mut values) = render_wu_filter(filter);
        let sql =
            format!("SELECT {WU_COLUMNS} FROM workunits WHERE {clause} ORDER BY id LIMIT ?");
        values.push((limit as i64).into());
        let mut rows = self.conn().query(&sql, values).await.map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_wu(&row).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn enumerate_results(
        &self,
        filter: &ResultFilter,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        let (clause, mut values) = render_result_filter(filter);
        let sql =
            format!("SELECT {RESULT_COLUMNS} FROM results WHERE {clause} ORDER BY id LIMIT ?");
        values.push((limit as i64).into());
        let mut rows = self.conn().query(&sql, values).await.map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_result(&row).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn enumerate_transition_ready(
        &self,
        now: i64,
        shard: Option<Shard>,
        limit: usize,
    ) -> Result<Vec<WorkunitWithResults>, StoreError> {
        let filter = WuFilter {
            shard,
            transition_due_by: Some(now),
            ..Default::default()
        };
        let (clause, mut values) = render_wu_filter(&filter);
        let sql = format!(
            "SELECT {WU_COLUMNS} FROM workunits WHERE {clause} \
             ORDER BY transition_time LIMIT ?"
        );
        values.push((limit as i64).into());
        let mut rows = self.conn().query(&sql, values).await.map_err(query_err)?;
        let mut wus = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            wus.push(row_to_wu(&row).map_err(query_err)?);
        }

        let mut out = Vec::with_capacity(wus.len());
        for wu in wus {
            let results = self.results_for_wu(wu.id).await?;
            out.push(WorkunitWithResults { wu, results });
        }
        Ok(out)
    }

    async fn results_for_wu(&self, wu_id: i64) -> Result<Vec<ResultRecord>, StoreError> {
        let sql =
            format!("SELECT {RESULT_COLUMNS} FROM results WHERE workunitid = ? ORDER BY id");
        let mut rows = self
            .conn()
            .query(&sql, params![wu_id])
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_result(&row).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn feeder_candidates(
        &self,
        userid: i64,
        limit: usize,
    ) -> Result<Vec<(Workunit, ResultRecord)>, StoreError> {
        let filter = ResultFilter {
            server_state: Some(ServerState::Unsent),
            userid: Some(userid),
            ..Default::default()
        };
        let results = self.enumerate_results(&filter, limit).await?;
        let mut out = Vec::with_capacity(results.len());
        for r in results {
            if let Some(wu) = self.workunit(r.workunitid).await? {
                out.push((wu, r));
            }
        }
        Ok(out)
    }

    async fn update_workunit(&self, wu: &Workunit) -> Result<(), StoreError> {
        let sql = "UPDATE workunits SET create_time = ?, name = ?, appid = ?, error_mask = ?, \
             assimilate_state = ?, file_delete_state = ?, canonical_resultid = ?, \
             need_validate = ?, min_quorum = ?, target_nresults = ?, max_error_results = ?, \
             max_total_results = ?, max_success_results = ?, transition_time = ?, \
             delay_bound = ?, hr_class = ?, app_version_id = ?, batch = ?, \
             transitioner_flags = ?, priority = ?, xml_doc = ? WHERE id = ?";
        let mut values = wu_values(wu);
        values.push(wu.id.into());
        let n = self.conn().execute(sql, values).await.map_err(query_err)?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "workunit".into(),
                id: wu.id,
            });
        }
        Ok(())
    }

    async fn update_workunit_guarded(
        &self,
        prev: &Workunit,
        new: &Workunit,
    ) -> Result<bool, StoreError> {
        let sql = "UPDATE workunits SET create_time = ?, name = ?, appid = ?, error_mask = ?, \
             assimilate_state = ?, file_delete_state = ?, canonical_resultid = ?, \
             need_validate = ?, min_quorum = ?, target_nresults = ?, max_error_results = ?, \
             max_total_results = ?, max_success_results = ?, transition_time = ?, \
             delay_bound = ?, hr_class = ?, app_version_id = ?, batch = ?, \
             transitioner_flags = ?, priority = ?, xml_doc = ? \
             WHERE id = ? AND transition_time = ? AND error_mask = ? \
             AND canonical_resultid = ? AND need_validate = ? AND assimilate_state = ? \
             AND file_delete_state = ? AND hr_class = ? AND app_version_id = ? \
             AND transitioner_flags = ? AND priority = ?";
        let mut values = wu_values(new);
        values.push(prev.id.into());
        values.push(prev.transition_time.into());
        values.push((prev.error_mask as i64).into());
        values.push(prev.canonical_resultid.into());
        values.push((prev.need_validate as i64).into());
        values.push(prev.assimilate_state.code().into());
        values.push(prev.file_delete_state.code().into());
        values.push((prev.hr_class as i64).into());
        values.push(prev.app_version_id.into());
        values.push((prev.transitioner_flags as i64).into());
        values.push((prev.priority as i64).into());
        let n = self.conn().execute(sql, values).await.map_err(query_err)?;
        Ok(n > 0)
    }

    async fn update_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
        let sql = "UPDATE results SET create_time = ?, workunitid = ?, name = ?, \
             server_state = ?, outcome = ?, validate_state = ?, file_delete_state = ?, \
             report_deadline = ?, received_time = ?, sent_time = ?, appid = ?, hostid = ?, \
             userid = ?, app_version_id = ?, priority = ?, exit_status = ?, xml_doc_in = ?, \
             xml_doc_out = ?, stderr_out = ? WHERE id = ?";
        let mut values = result_values(result);
        values.push(result.id.into());
        let n = self.conn().execute(sql, values).await.map_err(query_err)?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "result".into(),
                id: result.id,
            });
        }
        Ok(())
    }

    async fn set_wu_file_delete_state(
        &self,
        id: i64,
        state: FileDeleteState,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE workunits SET file_delete_state = ? WHERE id = ?",
                params![state.code(), id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_result_file_delete_state(
        &self,
        id: i64,
        state: FileDeleteState,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE results SET file_delete_state = ? WHERE id = ?",
                params![state.code(), id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_assimilate_states(
        &self,
        updates: &[(i64, AssimilateState, i64)],
    ) -> Result<(), StoreError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err)?;
        for &(id, state, transition_time) in updates {
            tx.execute(
                "UPDATE workunits SET assimilate_state = ?, transition_time = ? WHERE id = ?",
                params![state.code(), transition_time, id],
            )
            .await
            .map_err(query_err)?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn delete_workunit(&self, id: i64) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM workunits WHERE id = ?", params![id])
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn delete_result(&self, id: i64) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM results WHERE id = ?", params![id])
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn upsert_batch(&self, batch: Batch) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO batches (id, state) VALUES (?, ?) \
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state",
                params![batch.id, batch.state.code()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn retired_batches(&self) -> Result<Vec<i64>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM batches WHERE state = ?",
                params![BatchState::Retired.code()],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row.get(0).map_err(query_err)?);
        }
        Ok(out)
    }

    async fn min_live_wu_create_time(&self) -> Result<Option<i64>, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT MIN(create_time) FROM workunits", ())
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<Option<i64>>(0).map_err(query_err)?),
            None => Ok(None),
        }
    }

    async fn apps(&self) -> Result<Vec<App>, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT id, name FROM apps ORDER BY id", ())
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(App {
                id: row.get(0).map_err(query_err)?,
                name: row.get(1).map_err(query_err)?,
            });
        }
        Ok(out)
    }

    async fn insert_app(&self, app: &App) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO apps (id, name) VALUES (?, ?) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![app.id, app.name.clone()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn app_by_name(&self, name: &str) -> Result<Option<App>, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT id, name FROM apps WHERE name = ?", params![name])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(App {
                id: row.get(0).map_err(query_err)?,
                name: row.get(1).map_err(query_err)?,
            })),
            None => Ok(None),
        }
    }

    async fn host_app_version(
        &self,
        host_id: i64,
        app_version_id: i64,
    ) -> Result<HostAppVersion, StoreError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO host_app_versions (host_id, app_version_id) \
                 VALUES (?, ?)",
                params![host_id, app_version_id],
            )
            .await
            .map_err(query_err)?;
        let mut rows = self
            .conn()
            .query(
                "SELECT max_jobs_per_day, consecutive_valid FROM host_app_versions \
                 WHERE host_id = ? AND app_version_id = ?",
                params![host_id, app_version_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(HostAppVersion {
                host_id,
                app_version_id,
                max_jobs_per_day: row.get::<i64>(0).map_err(query_err)? as i32,
                consecutive_valid: row.get::<i64>(1).map_err(query_err)? as i32,
            }),
            None => Err(StoreError::NotFound {
                entity: "host_app_version".into(),
                id: host_id,
            }),
        }
    }

    async fn update_host_app_version(&self, hav: &HostAppVersion) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE host_app_versions SET max_jobs_per_day = ?, consecutive_valid = ? \
                 WHERE host_id = ? AND app_version_id = ?",
                params![
                    hav.max_jobs_per_day as i64,
                    hav.consecutive_valid as i64,
                    hav.host_id,
                    hav.app_version_id
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_workunit() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut wu = Workunit::new("wu_rt", 3, 5000);
        wu.transition_time = i64::MAX;
        wu.xml_doc = "<file_info><name>in.dat</name></file_info>".into();
        let id = store.insert_workunit(&wu).await.unwrap();
        let got = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(got.name, "wu_rt");
        assert_eq!(got.transition_time, i64::MAX);
        assert_eq!(got.xml_doc, wu.xml_doc);
    }

    #[tokio::test]
    async fn guarded_update_sql() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let id = store
            .insert_workunit(&Workunit::new("wu_g", 1, 100))
            .await
            .unwrap();
        let snap = store.workunit(id).await.unwrap().unwrap();

        let mut moved = snap.clone();
        moved.error_mask = crate::model::WU_ERROR_CANCELLED;
        store.update_workunit(&moved).await.unwrap();

        let mut ours = snap.clone();
        ours.transition_time = 7;
        assert!(!store.update_workunit_guarded(&snap, &ours).await.unwrap());

        let fresh = store.workunit(id).await.unwrap().unwrap();
        let mut ours = fresh.clone();
        ours.transition_time = 7;
        assert!(store.update_workunit_guarded(&fresh, &ours).await.unwrap());
    }

    #[tokio::test]
    async fn batched_assimilate_states_apply() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let a = store
            .insert_workunit(&Workunit::new("wu_ba", 1, 100))
            .await
            .unwrap();
        let b = store
            .insert_workunit(&Workunit::new("wu_bb", 1, 100))
            .await
            .unwrap();

        store
            .set_assimilate_states(&[
                (a, AssimilateState::Done, 500),
                (b, AssimilateState::Init, 600),
            ])
            .await
            .unwrap();

        let got = store.workunit(a).await.unwrap().unwrap();
        assert_eq!(got.assimilate_state, AssimilateState::Done);
        assert_eq!(got.transition_time, 500);
        let got = store.workunit(b).await.unwrap().unwrap();
        assert_eq!(got.assimilate_state, AssimilateState::Init);
        assert_eq!(got.transition_time, 600);
    }

    #[tokio::test]
    async fn filters_render_and_apply() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut a = Workunit::new("wu_a", 1, 100);
        a.file_delete_state = FileDeleteState::Done;
        a.batch = 5;
        let mut b = Workunit::new("wu_b", 1, 100);
        b.file_delete_state = FileDeleteState::Done;
        b.batch = 6;
        store.insert_workunit(&a).await.unwrap();
        store.insert_workunit(&b).await.unwrap();

        let filter = WuFilter {
            file_delete_state: Some(FileDeleteState::Done),
            batch_in: Some(vec![5]),
            ..Default::default()
        };
        let got = store.enumerate_workunits(&filter, 10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].batch, 5);

        let empty = WuFilter {
            batch_in: Some(Vec::new()),
            ..Default::default()
        };
        assert!(store.enumerate_workunits(&empty, 10).await.unwrap().is_empty());
    }
}
