//! The `JobStore` trait, a single async interface over the persistent
//! workunit/result store.
//!
//! Every daemon holds an `Arc<dyn JobStore>`; the libSQL backend is the
//! production implementation and `MemStore` backs the tests. No component
//! owns a row exclusively, so mutations are either narrow single-field
//! updates or (for the transitioner) snapshot-guarded whole-row updates.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{
    App, Batch, FileDeleteState, HostAppVersion, ResultRecord, Workunit, WorkunitWithResults,
};
use crate::store::query::{ResultFilter, Shard, WuFilter};

/// Backend-agnostic persistent job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ── Inserts ─────────────────────────────────────────────────────

    /// Insert a workunit; returns the assigned id.
    async fn insert_workunit(&self, wu: &Workunit) -> Result<i64, StoreError>;

    /// Batch-insert results; returns assigned ids in input order.
    async fn insert_results(&self, results: &[ResultRecord]) -> Result<Vec<i64>, StoreError>;

    // ── Lookups / enumeration ───────────────────────────────────────

    async fn workunit(&self, id: i64) -> Result<Option<Workunit>, StoreError>;

    async fn result(&self, id: i64) -> Result<Option<ResultRecord>, StoreError>;

    async fn enumerate_workunits(
        &self,
        filter: &WuFilter,
        limit: usize,
    ) -> Result<Vec<Workunit>, StoreError>;

    async fn enumerate_results(
        &self,
        filter: &ResultFilter,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError>;

    /// WUs due for transition (`transition_time <= now`), each joined
    /// with all of its results.
    async fn enumerate_transition_ready(
        &self,
        now: i64,
        shard: Option<Shard>,
        limit: usize,
    ) -> Result<Vec<WorkunitWithResults>, StoreError>;

    async fn results_for_wu(&self, wu_id: i64) -> Result<Vec<ResultRecord>, StoreError>;

    /// Unsent results belonging to one submitter, joined with their WUs.
    /// Feeds the multi-tenant feeder's per-stream refill query.
    async fn feeder_candidates(
        &self,
        userid: i64,
        limit: usize,
    ) -> Result<Vec<(Workunit, ResultRecord)>, StoreError>;

    // ── Updates ─────────────────────────────────────────────────────

    /// Unconditional whole-row workunit update.
    async fn update_workunit(&self, wu: &Workunit) -> Result<(), StoreError>;

    /// Optimistic whole-row update: succeeds only if the row's mutable
    /// lifecycle fields still match `prev`. Returns false when another
    /// process changed the row in between (lost-update detection).
    async fn update_workunit_guarded(
        &self,
        prev: &Workunit,
        new: &Workunit,
    ) -> Result<bool, StoreError>;

    async fn update_result(&self, result: &ResultRecord) -> Result<(), StoreError>;

    async fn set_wu_file_delete_state(
        &self,
        id: i64,
        state: FileDeleteState,
    ) -> Result<(), StoreError>;

    async fn set_result_file_delete_state(
        &self,
        id: i64,
        state: FileDeleteState,
    ) -> Result<(), StoreError>;

    /// Set assimilate state and next transition time for a page of WUs
    /// in one commit. Entries are `(wu_id, state, transition_time)`.
    async fn set_assimilate_states(
        &self,
        updates: &[(i64, crate::model::AssimilateState, i64)],
    ) -> Result<(), StoreError>;

    // ── Deletes (purge) ─────────────────────────────────────────────

    async fn delete_workunit(&self, id: i64) -> Result<(), StoreError>;

    async fn delete_result(&self, id: i64) -> Result<(), StoreError>;

    // ── Batches ─────────────────────────────────────────────────────

    async fn upsert_batch(&self, batch: Batch) -> Result<(), StoreError>;

    /// Ids of all batches currently in the Retired state.
    async fn retired_batches(&self) -> Result<Vec<i64>, StoreError>;

    // ── Auxiliary tables ────────────────────────────────────────────

    /// Creation time of the oldest live WU, if any (antique-deleter cutoff).
    async fn min_live_wu_create_time(&self) -> Result<Option<i64>, StoreError>;

    async fn apps(&self) -> Result<Vec<App>, StoreError>;

    async fn insert_app(&self, app: &App) -> Result<(), StoreError>;

    async fn app_by_name(&self, name: &str) -> Result<Option<App>, StoreError>;

    /// Reliability stats for a (host, app version) pair; a default row
    /// is materialized on first access.
    async fn host_app_version(
        &self,
        host_id: i64,
        app_version_id: i64,
    ) -> Result<HostAppVersion, StoreError>;

    async fn update_host_app_version(&self, hav: &HostAppVersion) -> Result<(), StoreError>;
}
