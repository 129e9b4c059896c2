//! Assimilation Runner.
//!
//! Drains WUs whose results are complete (`assimilate_state = Ready`),
//! invokes a pluggable handler once per WU with its full result set and
//! canonical result, then marks the WU assimilated or defers it. The
//! handler's business logic is per-application; the drain loop here is
//! generic.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::daemon::DaemonPass;
use crate::error::{AssimilateError, Result};
use crate::model::{
    AssimilateState, ResultRecord, Workunit, WU_ERROR_NO_CANONICAL_RESULT,
};
use crate::store::{JobStore, Shard, WuFilter};
use crate::transitioner::unix_now;

/// WUs drained per pass.
const ENUM_LIMIT: usize = 1000;

/// What a handler decided about one workunit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssimilateOutcome {
    /// Consumed; mark the WU assimilated.
    Done,
    /// A result is still outstanding; leave the WU for a later pass.
    Defer,
}

/// Per-application assimilation logic, injected into the runner.
///
/// Returning an error is fatal for the whole process: a handler bug must
/// not silently corrupt state for subsequent WUs.
#[async_trait]
pub trait AssimilateHandler: Send + Sync {
    async fn assimilate(
        &self,
        wu: &Workunit,
        results: &[ResultRecord],
        canonical: Option<&ResultRecord>,
    ) -> std::result::Result<AssimilateOutcome, AssimilateError>;
}

/// Handler that records nothing; useful for projects whose outputs are
/// consumed elsewhere, and for tests.
pub struct NoopHandler;

#[async_trait]
impl AssimilateHandler for NoopHandler {
    async fn assimilate(
        &self,
        wu: &Workunit,
        results: &[ResultRecord],
        canonical: Option<&ResultRecord>,
    ) -> std::result::Result<AssimilateOutcome, AssimilateError> {
        info!(
            wu_id = wu.id,
            name = %wu.name,
            nresults = results.len(),
            canonical_id = canonical.map(|r| r.id).unwrap_or(0),
            error_mask = wu.error_mask,
            "Assimilating WU"
        );
        Ok(AssimilateOutcome::Done)
    }
}

/// The Assimilation Runner daemon.
pub struct Assimilator {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn AssimilateHandler>,
    appid: Option<i64>,
    shard: Option<Shard>,
}

impl Assimilator {
    pub fn new(
        store: Arc<dyn JobStore>,
        handler: Arc<dyn AssimilateHandler>,
        appid: Option<i64>,
        shard: Option<Shard>,
    ) -> Self {
        Self {
            store,
            handler,
            appid,
            shard,
        }
    }

    /// Drain one page of ready WUs. Returns true if any were found.
    pub async fn assimilate_ready_workunits(&self, now: i64) -> Result<bool> {
        let filter = WuFilter {
            assimilate_state: Some(AssimilateState::Ready),
            appid: self.appid,
            shard: self.shard,
            ..Default::default()
        };
        let wus = self.store.enumerate_workunits(&filter, ENUM_LIMIT).await?;
        let found = !wus.is_empty();

        // State writes are collected and committed once per page.
        let mut pending: Vec<(i64, AssimilateState, i64)> = Vec::new();
        for wu in wus {
            let mut wu = wu;
            let results = self.store.results_for_wu(wu.id).await?;
            let canonical = results.iter().find(|r| r.id == wu.canonical_resultid);

            // Inconsistency self-healing: a canonical id pointing at a
            // result that no longer exists.
            if wu.canonical_resultid != 0 && canonical.is_none() && wu.error_mask == 0 {
                warn!(
                    wu_id = wu.id,
                    canonical_resultid = wu.canonical_resultid,
                    "Canonical result missing; flagging WU"
                );
                wu.error_mask |= WU_ERROR_NO_CANONICAL_RESULT;
                self.store.update_workunit(&wu).await?;
            }

            let outcome = match self.handler.assimilate(&wu, &results, canonical).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Record what the page already decided before dying.
                    if !pending.is_empty() {
                        if let Err(flush) = self.store.set_assimilate_states(&pending).await {
                            warn!(error = %flush, "Failed to record assimilate states while aborting");
                        }
                    }
                    return Err(e.into());
                }
            };
            match outcome {
                AssimilateOutcome::Done => {
                    debug!(wu_id = wu.id, "Assimilated");
                    // transition_time = now so the transitioner promptly
                    // evaluates file-deletion eligibility.
                    pending.push((wu.id, AssimilateState::Done, now));
                }
                AssimilateOutcome::Defer => {
                    debug!(wu_id = wu.id, "Assimilation deferred");
                    pending.push((wu.id, AssimilateState::Init, now));
                }
            }
        }
        if !pending.is_empty() {
            self.store.set_assimilate_states(&pending).await?;
        }
        Ok(found)
    }
}

/// Daemon wrapper around the runner.
pub struct AssimilatorDaemon {
    runner: Assimilator,
}

impl AssimilatorDaemon {
    pub fn new(runner: Assimilator) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl DaemonPass for AssimilatorDaemon {
    fn name(&self) -> &'static str {
        "assimilator"
    }

    async fn pass(&mut self) -> Result<bool> {
        self.runner.assimilate_ready_workunits(unix_now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::FileDeleteState;
    use crate::store::MemStore;

    async fn seed_ready_wu(store: &MemStore, canonical: i64) -> i64 {
        let mut wu = Workunit::new("wu_as", 1, 100);
        wu.assimilate_state = AssimilateState::Ready;
        wu.canonical_resultid = canonical;
        store.insert_workunit(&wu).await.unwrap()
    }

    #[tokio::test]
    async fn marks_done_and_reschedules_transition() {
        let store = Arc::new(MemStore::new());
        let id = seed_ready_wu(&store, 0).await;
        let runner = Assimilator::new(store.clone(), Arc::new(NoopHandler), None, None);
        assert!(runner.assimilate_ready_workunits(5000).await.unwrap());

        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.assimilate_state, AssimilateState::Done);
        assert_eq!(wu.transition_time, 5000);
        assert_eq!(wu.file_delete_state, FileDeleteState::Init);
    }

    #[tokio::test]
    async fn missing_canonical_flags_inconsistency() {
        let store = Arc::new(MemStore::new());
        let id = seed_ready_wu(&store, 999).await;
        let runner = Assimilator::new(store.clone(), Arc::new(NoopHandler), None, None);
        runner.assimilate_ready_workunits(5000).await.unwrap();

        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_ne!(wu.error_mask & WU_ERROR_NO_CANONICAL_RESULT, 0);
        // Still assimilated: failed WUs complete the pipeline too.
        assert_eq!(wu.assimilate_state, AssimilateState::Done);
    }

    struct DeferHandler;

    #[async_trait]
    impl AssimilateHandler for DeferHandler {
        async fn assimilate(
            &self,
            _wu: &Workunit,
            _results: &[ResultRecord],
            _canonical: Option<&ResultRecord>,
        ) -> std::result::Result<AssimilateOutcome, AssimilateError> {
            Ok(AssimilateOutcome::Defer)
        }
    }

    #[tokio::test]
    async fn defer_resets_to_init() {
        let store = Arc::new(MemStore::new());
        let id = seed_ready_wu(&store, 0).await;
        let runner = Assimilator::new(store.clone(), Arc::new(DeferHandler), None, None);
        runner.assimilate_ready_workunits(5000).await.unwrap();

        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.assimilate_state, AssimilateState::Init);
    }

    struct FatalHandler;

    #[async_trait]
    impl AssimilateHandler for FatalHandler {
        async fn assimilate(
            &self,
            wu: &Workunit,
            _results: &[ResultRecord],
            _canonical: Option<&ResultRecord>,
        ) -> std::result::Result<AssimilateOutcome, AssimilateError> {
            Err(AssimilateError::Handler {
                wu_id: wu.id,
                code: 3,
                reason: "output store unreachable".into(),
            })
        }
    }

    #[tokio::test]
    async fn handler_error_is_fatal_for_the_pass() {
        let store = Arc::new(MemStore::new());
        let id = seed_ready_wu(&store, 0).await;
        let runner = Assimilator::new(store.clone(), Arc::new(FatalHandler), None, None);
        let err = runner.assimilate_ready_workunits(5000).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Assimilate(AssimilateError::Handler { code: 3, .. })
        ));

        // The WU stays Ready for a retry after the operator intervenes.
        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.assimilate_state, AssimilateState::Ready);
    }

    #[derive(Default)]
    struct FailSecondHandler {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl AssimilateHandler for FailSecondHandler {
        async fn assimilate(
            &self,
            wu: &Workunit,
            _results: &[ResultRecord],
            _canonical: Option<&ResultRecord>,
        ) -> std::result::Result<AssimilateOutcome, AssimilateError> {
            use std::sync::atomic::Ordering;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(AssimilateOutcome::Done)
            } else {
                Err(AssimilateError::Handler {
                    wu_id: wu.id,
                    code: 5,
                    reason: "output store unreachable".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn earlier_page_work_survives_a_handler_failure() {
        let store = Arc::new(MemStore::new());
        let first = seed_ready_wu(&store, 0).await;
        let second = seed_ready_wu(&store, 0).await;
        let runner = Assimilator::new(
            store.clone(),
            Arc::new(FailSecondHandler::default()),
            None,
            None,
        );
        runner.assimilate_ready_workunits(5000).await.unwrap_err();

        // The first WU's Done verdict was committed before the abort.
        let wu = store.workunit(first).await.unwrap().unwrap();
        assert_eq!(wu.assimilate_state, AssimilateState::Done);
        let wu = store.workunit(second).await.unwrap().unwrap();
        assert_eq!(wu.assimilate_state, AssimilateState::Ready);
    }
}
