//! Transition Engine: the WU/result state machine.
//!
//! The transitioner is upstream of every other daemon: it is the only
//! component that sets `assimilate_state = Ready` and
//! `file_delete_state = Ready`. Each pass selects WUs whose
//! `transition_time` has arrived, examines their full result set, and
//! decides whether to spawn more results, record errors, trigger
//! assimilation or file deletion, or just schedule a future re-check.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::daemon::DaemonPass;
use crate::error::{Error, Result, StoreError, TransitionError};
use crate::model::{
    AssimilateState, FileDeleteState, Outcome, ResultRecord, ServerState, ValidateState, Workunit,
    WorkunitWithResults, TRANSITIONER_FLAG_NO_NEW_RESULTS, TRANSITION_TIME_NEVER,
    WU_ERROR_COULDNT_SEND_RESULT, WU_ERROR_TOO_MANY_ERROR_RESULTS,
    WU_ERROR_TOO_MANY_SUCCESS_RESULTS, WU_ERROR_TOO_MANY_TOTAL_RESULTS,
};
use crate::store::{JobStore, Shard};

/// WUs examined per pass.
const ENUM_LIMIT: usize = 500;

/// Upper bound on the safety-net re-check interval.
const SAFETY_NET_MAX_SECS: i64 = 10 * 86_400;

/// Bounds on the lag-recovery pushback.
const LAG_PUSHBACK_MIN_SECS: i64 = 60;
const LAG_PUSHBACK_MAX_SECS: i64 = 86_400;

/// Current epoch seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The Transition Engine daemon.
pub struct Transitioner {
    store: Arc<dyn JobStore>,
    shard: Option<Shard>,
    /// Single-WU debug mode: process only this WU, ignoring its
    /// `transition_time`.
    wu_id: Option<i64>,
    /// Grace window past the last upload before files become deletable.
    delete_delay: i64,
}

/// Per-WU result census taken at the top of `handle_wu`.
#[derive(Debug, Default)]
struct Tally {
    nunsent: i32,
    ninprogress: i32,
    nsuccess: i32,
    nerrors: i32,
    ncouldnt_send: i32,
    nno_reply: i32,
    ntotal: i32,
    /// Highest numeric suffix among existing result names; -1 if none.
    max_suffix: i64,
    /// A success exists whose validation hasn't started.
    have_new_success: bool,
    /// At least one in-progress result blew its deadline this pass.
    some_timed_out: bool,
    /// Latest report arrival time, if any.
    most_recent_received: Option<i64>,
}

impl Transitioner {
    pub fn new(
        store: Arc<dyn JobStore>,
        shard: Option<Shard>,
        wu_id: Option<i64>,
        delete_delay: i64,
    ) -> Self {
        Self {
            store,
            shard,
            wu_id,
            delete_delay,
        }
    }

    /// Process one bounded batch of due WUs. Returns true if any were found.
    pub async fn process_due_workunits(&self, now: i64) -> Result<bool> {
        let items = match self.wu_id {
            Some(id) => {
                let wu = self
                    .store
                    .workunit(id)
                    .await?
                    .ok_or(StoreError::NotFound {
                        entity: "workunit".into(),
                        id,
                    })?;
                let results = self.store.results_for_wu(id).await?;
                vec![WorkunitWithResults { wu, results }]
            }
            None => {
                self.store
                    .enumerate_transition_ready(now, self.shard, ENUM_LIMIT)
                    .await?
            }
        };

        let found = !items.is_empty();
        for item in items {
            // A single WU failing is treated as systemic: fail the pass
            // rather than silently skipping.
            self.handle_wu(item, now).await?;
        }
        Ok(found)
    }

    /// Advance one workunit. See module docs for the full decision list.
    pub async fn handle_wu(&self, item: WorkunitWithResults, now: i64) -> Result<()> {
        let prev = item.wu.clone();
        let mut wu = item.wu;
        let mut results = item.results;
        let wu_id = wu.id;

        debug!(wu_id, name = %wu.name, nresults = results.len(), "Handling WU");

        let tally = self.take_census(wu_id, &mut results, now).await?;

        // Validation trigger: enough fresh successes for a quorum.
        if tally.have_new_success && tally.nsuccess >= wu.min_quorum && !wu.need_validate {
            debug!(wu_id, nsuccess = tally.nsuccess, "Flagging for validation");
            wu.need_validate = true;
        }

        // Error accumulation.
        if tally.ncouldnt_send > 0 {
            wu.error_mask |= WU_ERROR_COULDNT_SEND_RESULT;
        }
        if tally.nerrors > wu.max_error_results {
            wu.error_mask |= WU_ERROR_TOO_MANY_ERROR_RESULTS;
        }
        if tally.nsuccess > wu.max_success_results {
            wu.error_mask |= WU_ERROR_TOO_MANY_SUCCESS_RESULTS;
        }

        // All current results errored and nothing can still come back:
        // clear the HR targeting so other platforms get a chance.
        if tally.nerrors > 0
            && tally.nsuccess == 0
            && tally.ninprogress == 0
            && tally.nunsent == 0
            && tally.nno_reply == 0
            && (wu.hr_class != 0 || wu.app_version_id != 0)
        {
            info!(wu_id, "All results errored; resetting HR class and app version pin");
            wu.hr_class = 0;
            wu.app_version_id = 0;
        }

        // Replenishment.
        let mut nunsent = tally.nunsent;
        if wu.error_mask == 0
            && wu.canonical_resultid == 0
            && wu.transitioner_flags & TRANSITIONER_FLAG_NO_NEW_RESULTS == 0
        {
            let needed = wu.target_nresults - nunsent - tally.ninprogress - tally.nsuccess;
            if needed > 0 {
                let headroom = wu.max_total_results - tally.ntotal;
                let n_create = needed.min(headroom);
                if n_create <= 0 {
                    warn!(
                        wu_id,
                        needed, headroom, "Result shortfall but no headroom left"
                    );
                    wu.error_mask |= WU_ERROR_TOO_MANY_TOTAL_RESULTS;
                } else {
                    let priority_bump = if tally.some_timed_out { 1 } else { 0 };
                    let mut new_results = Vec::with_capacity(n_create as usize);
                    for i in 0..n_create as i64 {
                        let mut r =
                            ResultRecord::new_for_wu(&wu, tally.max_suffix + 1 + i, now);
                        r.priority = wu.priority + priority_bump;
                        new_results.push(r);
                    }
                    info!(wu_id, count = n_create, "Creating new results");
                    let ids = self
                        .store
                        .insert_results(&new_results)
                        .await
                        .map_err(|source| TransitionError::Store { wu_id, source })?;
                    for (mut r, id) in new_results.into_iter().zip(ids) {
                        r.id = id;
                        results.push(r);
                    }
                    nunsent += n_create;
                }
            }
        }

        // Error-path cleanup: failed WUs still flow through the rest of
        // the pipeline, they just never send more work.
        if wu.error_mask != 0 {
            for r in results.iter_mut() {
                let mut changed = false;
                if matches!(r.server_state, ServerState::Unsent | ServerState::Inactive) {
                    r.server_state = ServerState::Over;
                    r.outcome = Outcome::DidntNeed;
                    changed = true;
                }
                if r.outcome == Outcome::Success
                    && matches!(
                        r.validate_state,
                        ValidateState::Init | ValidateState::Inconclusive
                    )
                {
                    r.validate_state = ValidateState::NoCheck;
                    changed = true;
                }
                if changed {
                    self.store
                        .update_result(r)
                        .await
                        .map_err(|source| TransitionError::Store { wu_id, source })?;
                }
            }
            if wu.assimilate_state == AssimilateState::Init {
                info!(
                    wu_id,
                    error_mask = wu.error_mask,
                    "WU errored; marking ready for assimilation"
                );
                wu.assimilate_state = AssimilateState::Ready;
            }
        }

        let all_over = results
            .iter()
            .all(|r| r.server_state == ServerState::Over);
        let all_success_validated = results
            .iter()
            .filter(|r| r.outcome == Outcome::Success)
            .all(|r| r.validate_state != ValidateState::Init);

        // Assimilation trigger for the healthy path.
        if wu.error_mask == 0
            && wu.canonical_resultid != 0
            && all_over
            && all_success_validated
            && wu.assimilate_state == AssimilateState::Init
        {
            info!(wu_id, "All results validated; marking ready for assimilation");
            wu.assimilate_state = AssimilateState::Ready;
        }

        // File deletion, only after assimilation completed, and only once
        // the upload-retry grace window has passed.
        let mut deferred_delete_at: Option<i64> = None;
        if wu.assimilate_state == AssimilateState::Done {
            let eligible_at = tally
                .most_recent_received
                .map(|t| t + self.delete_delay)
                .unwrap_or(now);
            if now < eligible_at {
                deferred_delete_at = Some(eligible_at);
            } else {
                let all_over_and_validated = all_over && all_success_validated;
                if all_over_and_validated && wu.file_delete_state == FileDeleteState::Init {
                    wu.file_delete_state = FileDeleteState::Ready;
                }
                for r in results.iter_mut() {
                    if r.file_delete_state != FileDeleteState::Init
                        || r.server_state != ServerState::Over
                    {
                        continue;
                    }
                    let deletable = match r.outcome {
                        Outcome::ClientError => true,
                        Outcome::Success if r.validate_state != ValidateState::Init => {
                            // The canonical result's output is protected
                            // until every other result is settled.
                            r.id != wu.canonical_resultid || all_over_and_validated
                        }
                        _ => false,
                    };
                    if deletable {
                        r.file_delete_state = FileDeleteState::Ready;
                        self.store
                            .update_result(r)
                            .await
                            .map_err(|source| TransitionError::Store { wu_id, source })?;
                    }
                }
            }
        }

        // Re-check scheduling.
        let mut next = TRANSITION_TIME_NEVER;
        let earliest_deadline = results
            .iter()
            .filter(|r| r.server_state == ServerState::InProgress)
            .map(|r| r.report_deadline)
            .min();
        if let Some(deadline) = earliest_deadline {
            next = next.min(deadline);
        }
        if let Some(t) = deferred_delete_at {
            next = next.min(t);
        }
        if wu.error_mask == 0 && wu.canonical_resultid == 0 {
            let safety_net = SAFETY_NET_MAX_SECS.min((wu.delay_bound as f64 * 1.5) as i64);
            next = next.min(now + safety_net);
        }
        if next < now {
            // The engine fell behind; spread recovery out instead of
            // re-processing the same backlog instantly.
            let lag = now - next;
            next = now + (2 * lag).clamp(LAG_PUSHBACK_MIN_SECS, LAG_PUSHBACK_MAX_SECS);
        }
        wu.transition_time = next;

        debug!(
            wu_id,
            transition_time = wu.transition_time,
            error_mask = wu.error_mask,
            nunsent,
            "WU handled"
        );

        let updated = self
            .store
            .update_workunit_guarded(&prev, &wu)
            .await
            .map_err(|source| TransitionError::Store { wu_id, source })?;
        if !updated {
            return Err(TransitionError::ConcurrentUpdate { wu_id }.into());
        }
        Ok(())
    }

    /// Classify every result, forcing deadline-blown in-progress results
    /// to Over/NoReply and penalizing their host's reliability stats.
    async fn take_census(
        &self,
        wu_id: i64,
        results: &mut [ResultRecord],
        now: i64,
    ) -> Result<Tally> {
        let mut tally = Tally {
            max_suffix: -1,
            ..Default::default()
        };

        for r in results.iter_mut() {
            tally.ntotal += 1;
            if let Some(suffix) = r.name_suffix() {
                tally.max_suffix = tally.max_suffix.max(suffix);
            }

            if r.server_state == ServerState::InProgress && r.report_deadline < now {
                warn!(
                    wu_id,
                    result_id = r.id,
                    hostid = r.hostid,
                    deadline = r.report_deadline,
                    "Result timed out"
                );
                r.server_state = ServerState::Over;
                r.outcome = Outcome::NoReply;
                self.store
                    .update_result(r)
                    .await
                    .map_err(|source| TransitionError::Store { wu_id, source })?;
                self.penalize_host(r).await?;
                tally.some_timed_out = true;
            }

            match r.server_state {
                ServerState::Unsent | ServerState::Inactive => tally.nunsent += 1,
                ServerState::InProgress => tally.ninprogress += 1,
                ServerState::Over => match r.outcome {
                    Outcome::Success => {
                        if r.validate_state == ValidateState::Invalid {
                            tally.nerrors += 1;
                        } else {
                            tally.nsuccess += 1;
                            if r.validate_state == ValidateState::Init {
                                tally.have_new_success = true;
                            }
                        }
                    }
                    Outcome::ClientError | Outcome::ValidateError | Outcome::ClientDetached => {
                        tally.nerrors += 1;
                    }
                    Outcome::CouldntSend => tally.ncouldnt_send += 1,
                    Outcome::NoReply => tally.nno_reply += 1,
                    Outcome::DidntNeed | Outcome::Init => {}
                },
            }

            if r.received_time > 0 {
                tally.most_recent_received = Some(
                    tally
                        .most_recent_received
                        .map_or(r.received_time, |t| t.max(r.received_time)),
                );
            }
        }

        Ok(tally)
    }

    /// Timeout feedback loop: one fewer job per day for the offending
    /// host+app-version, and its valid streak resets.
    async fn penalize_host(&self, r: &ResultRecord) -> Result<()> {
        let mut hav = self
            .store
            .host_app_version(r.hostid, r.app_version_id)
            .await?;
        hav.penalize_timeout();
        self.store.update_host_app_version(&hav).await?;
        debug!(
            hostid = r.hostid,
            app_version_id = r.app_version_id,
            max_jobs_per_day = hav.max_jobs_per_day,
            "Penalized host for timeout"
        );
        Ok(())
    }
}

/// Daemon wrapper around the engine.
pub struct TransitionerDaemon {
    engine: Transitioner,
}

impl TransitionerDaemon {
    pub fn new(engine: Transitioner) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl DaemonPass for TransitionerDaemon {
    fn name(&self) -> &'static str {
        "transitioner"
    }

    async fn pass(&mut self) -> Result<bool> {
        self.engine.process_due_workunits(unix_now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    async fn seed_wu(store: &MemStore, now: i64) -> Workunit {
        let mut wu = Workunit::new("wu_t", 1, now);
        wu.target_nresults = 2;
        wu.min_quorum = 2;
        let id = store.insert_workunit(&wu).await.unwrap();
        store.workunit(id).await.unwrap().unwrap()
    }

    fn engine(store: &Arc<MemStore>) -> Transitioner {
        Transitioner::new(store.clone() as Arc<dyn JobStore>, None, None, 3600)
    }

    #[tokio::test]
    async fn replenishes_to_target() {
        let store = Arc::new(MemStore::new());
        let now = 10_000;
        let wu = seed_wu(&store, now).await;
        let t = engine(&store);
        assert!(t.process_due_workunits(now).await.unwrap());

        let results = store.results_for_wu(wu.id).await.unwrap();
        assert_eq!(results.len(), 2);
        let mut names: Vec<_> = results.iter().map(|r| r.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["wu_t_0", "wu_t_1"]);

        let wu = store.workunit(wu.id).await.unwrap().unwrap();
        let expected_net = SAFETY_NET_MAX_SECS.min((wu.delay_bound as f64 * 1.5) as i64);
        assert_eq!(wu.transition_time, now + expected_net);
    }

    #[tokio::test]
    async fn handle_wu_is_idempotent_when_nothing_changed() {
        let store = Arc::new(MemStore::new());
        let now = 10_000;
        let wu = seed_wu(&store, now).await;
        let t = engine(&store);
        t.process_due_workunits(now).await.unwrap();

        let after_first = store.workunit(wu.id).await.unwrap().unwrap();
        let nresults_first = store.results_for_wu(wu.id).await.unwrap().len();

        // Same clock, no new results: a second run must land in the
        // same place.
        let results = store.results_for_wu(wu.id).await.unwrap();
        t.handle_wu(
            WorkunitWithResults {
                wu: after_first.clone(),
                results,
            },
            now,
        )
        .await
        .unwrap();

        let after_second = store.workunit(wu.id).await.unwrap().unwrap();
        assert_eq!(after_second.transition_time, after_first.transition_time);
        assert_eq!(
            store.results_for_wu(wu.id).await.unwrap().len(),
            nresults_first
        );
    }

    #[tokio::test]
    async fn timeout_forces_no_reply_and_penalizes_host() {
        let store = Arc::new(MemStore::new());
        let now = 10_000;
        let mut wu = Workunit::new("wu_to", 1, now - 1000);
        wu.target_nresults = 1;
        wu.min_quorum = 1;
        let wu_id = store.insert_workunit(&wu).await.unwrap();
        let wu = store.workunit(wu_id).await.unwrap().unwrap();

        let mut r = ResultRecord::new_for_wu(&wu, 0, now - 1000);
        r.server_state = ServerState::InProgress;
        r.report_deadline = now - 100;
        r.hostid = 42;
        r.app_version_id = 7;
        let rid = store.insert_results(&[r]).await.unwrap()[0];

        let t = engine(&store);
        t.process_due_workunits(now).await.unwrap();

        let r = store.result(rid).await.unwrap().unwrap();
        assert_eq!(r.server_state, ServerState::Over);
        assert_eq!(r.outcome, Outcome::NoReply);

        let hav = store.host_app_version(42, 7).await.unwrap();
        assert_eq!(hav.max_jobs_per_day, 99);
        assert_eq!(hav.consecutive_valid, 0);
    }

    #[tokio::test]
    async fn clamp_sets_too_many_total() {
        let store = Arc::new(MemStore::new());
        let now = 10_000;
        let mut wu = Workunit::new("wu_cap", 1, now);
        wu.target_nresults = 4;
        wu.max_total_results = 2;
        wu.max_error_results = 10;
        let wu_id = store.insert_workunit(&wu).await.unwrap();
        let wu = store.workunit(wu_id).await.unwrap().unwrap();

        // Two results already exist, both client errors: total = max.
        let mut a = ResultRecord::new_for_wu(&wu, 0, now);
        a.server_state = ServerState::Over;
        a.outcome = Outcome::ClientError;
        let mut b = ResultRecord::new_for_wu(&wu, 1, now);
        b.server_state = ServerState::Over;
        b.outcome = Outcome::ClientError;
        store.insert_results(&[a, b]).await.unwrap();

        let t = engine(&store);
        t.process_due_workunits(now).await.unwrap();

        let wu = store.workunit(wu_id).await.unwrap().unwrap();
        assert_ne!(wu.error_mask & WU_ERROR_TOO_MANY_TOTAL_RESULTS, 0);
        assert_eq!(store.results_for_wu(wu_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn success_cap_sets_too_many_success() {
        let store = Arc::new(MemStore::new());
        let now = 10_000;
        let mut wu = Workunit::new("wu_succ", 1, now);
        wu.target_nresults = 2;
        wu.min_quorum = 3;
        wu.max_success_results = 1;
        let wu_id = store.insert_workunit(&wu).await.unwrap();
        let wu = store.workunit(wu_id).await.unwrap().unwrap();

        let mut a = ResultRecord::new_for_wu(&wu, 0, now);
        a.server_state = ServerState::Over;
        a.outcome = Outcome::Success;
        a.received_time = now - 10;
        let mut b = ResultRecord::new_for_wu(&wu, 1, now);
        b.server_state = ServerState::Over;
        b.outcome = Outcome::Success;
        b.received_time = now - 10;
        store.insert_results(&[a, b]).await.unwrap();

        let t = engine(&store);
        t.process_due_workunits(now).await.unwrap();

        let wu = store.workunit(wu_id).await.unwrap().unwrap();
        assert_ne!(wu.error_mask & WU_ERROR_TOO_MANY_SUCCESS_RESULTS, 0);
        // Failed WUs still flow into assimilation.
        assert_eq!(wu.assimilate_state, AssimilateState::Ready);
        assert_eq!(store.results_for_wu(wu_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn canonical_resultid_never_touched() {
        let store = Arc::new(MemStore::new());
        let now = 10_000;
        let mut wu = Workunit::new("wu_can", 1, now);
        wu.canonical_resultid = 55;
        wu.target_nresults = 1;
        let wu_id = store.insert_workunit(&wu).await.unwrap();

        let t = engine(&store);
        t.process_due_workunits(now).await.unwrap();

        let wu = store.workunit(wu_id).await.unwrap().unwrap();
        assert_eq!(wu.canonical_resultid, 55);
    }
}
