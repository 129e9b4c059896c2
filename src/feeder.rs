//! Multi-tenant Feeder.
//!
//! Keeps a fixed-size slot table of dispatchable work items topped up
//! from the job store, dividing admission between submitters in
//! proportion to configured shares. Each submitter is a job stream with
//! its own refill cache; admission always draws from the unpaused stream
//! with the lowest accumulated usage, and usage grows by the inverse of
//! the stream's share, so a share-2 stream is admitted twice as often as
//! a share-1 stream over time.
//!
//! Slots are handed to dispatchers under a lease. A dispatcher that dies
//! holding a slot simply lets the lease lapse and the item becomes
//! claimable again; there is no liveness probing.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::daemon::{consume_trigger, DaemonPass};
use crate::error::{FeederError, Result};
use crate::model::{App, Outcome, ServerState};
use crate::store::JobStore;
use crate::transitioner::unix_now;

/// Results fetched per stream refill.
const ENUM_LIMIT: usize = 100;

/// How long a stream sleeps after its refill query comes back empty.
pub const EMPTY_BACKOFF_TIME: i64 = 15;

/// Usage headroom before renormalization, in admissions of the
/// highest-share stream.
const NJOBS_STARTUP: f64 = 100.0;

/// One dispatchable unit in the slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub wu_id: i64,
    pub result_id: i64,
    pub name: String,
    pub appid: i64,
}

/// State of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Empty,
    /// Filled and waiting for a dispatcher to claim it.
    Present { item: WorkItem, filled_at: i64 },
    /// Claimed by a dispatcher; reverts to Present if the lease lapses.
    Claimed { item: WorkItem, lease_expires: i64 },
}

/// Fixed-size table of work items shared with dispatchers.
pub struct SlotTable {
    slots: Vec<Slot>,
    lease_secs: i64,
}

impl SlotTable {
    pub fn new(size: usize, lease_secs: i64) -> Self {
        Self {
            slots: vec![Slot::Empty; size],
            lease_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, Slot::Empty))
            .count()
    }

    /// True if any slot (present or claimed) holds a result of this WU.
    /// Prevents two results of one WU from being dispatchable at once.
    pub fn contains_wu(&self, wu_id: i64) -> bool {
        self.slots.iter().any(|s| match s {
            Slot::Present { item, .. } | Slot::Claimed { item, .. } => item.wu_id == wu_id,
            Slot::Empty => false,
        })
    }

    fn first_empty(&self) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Slot::Empty))
    }

    fn fill(&mut self, idx: usize, item: WorkItem, now: i64) {
        self.slots[idx] = Slot::Present {
            item,
            filled_at: now,
        };
    }

    /// Claim the first present item for dispatch, starting a lease.
    pub fn claim(&mut self, now: i64) -> Option<WorkItem> {
        let idx = self
            .slots
            .iter()
            .position(|s| matches!(s, Slot::Present { .. }))?;
        let Slot::Present { item, .. } = std::mem::replace(&mut self.slots[idx], Slot::Empty)
        else {
            unreachable!()
        };
        self.slots[idx] = Slot::Claimed {
            item: item.clone(),
            lease_expires: now + self.lease_secs,
        };
        Some(item)
    }

    /// Confirm a claimed item was dispatched; frees its slot.
    pub fn release(&mut self, result_id: i64) {
        for s in &mut self.slots {
            if matches!(s, Slot::Claimed { item, .. } if item.result_id == result_id) {
                *s = Slot::Empty;
            }
        }
    }

    /// Return lapsed claims to the dispatchable pool.
    pub fn reclaim_expired(&mut self, now: i64) -> usize {
        let mut reclaimed = 0;
        for s in &mut self.slots {
            let lapsed = match s {
                Slot::Claimed { item, lease_expires } if *lease_expires <= now => {
                    Some(item.clone())
                }
                _ => None,
            };
            if let Some(item) = lapsed {
                *s = Slot::Present {
                    item,
                    filled_at: now,
                };
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// Per-submitter admission state.
struct JobStream {
    user_id: i64,
    /// Inverse share: usage grows by this on each admission.
    inv_share: f64,
    usage: f64,
    /// Epoch time before which this stream is skipped (empty backoff).
    pause_until: i64,
    cache: VecDeque<WorkItem>,
}

/// Feeder behavior flags (CLI surface).
#[derive(Debug, Clone)]
pub struct FeederOpts {
    pub slot_count: usize,
    pub lease_secs: i64,
    /// Drop unclaimed items that have sat in the table longer than this
    /// many minutes; their results are re-admitted by a later refill.
    pub purge_stale_mins: Option<i64>,
}

impl Default for FeederOpts {
    fn default() -> Self {
        Self {
            slot_count: 100,
            lease_secs: 300,
            purge_stale_mins: None,
        }
    }
}

/// The Feeder daemon.
pub struct Feeder {
    store: Arc<dyn JobStore>,
    streams: Vec<JobStream>,
    table: SlotTable,
    apps: Vec<App>,
    opts: FeederOpts,
    reread_trigger: PathBuf,
}

impl Feeder {
    /// Build a feeder from `(user_id, share)` pairs. Shares must be
    /// positive; at least one stream is required.
    pub fn new(
        store: Arc<dyn JobStore>,
        shares: &[(i64, f64)],
        opts: FeederOpts,
        reread_trigger: PathBuf,
    ) -> Result<Self> {
        if shares.is_empty() {
            return Err(FeederError::NoStreams.into());
        }
        let mut streams = Vec::with_capacity(shares.len());
        for &(user_id, share) in shares {
            if share <= 0.0 || !share.is_finite() {
                return Err(FeederError::InvalidShare { user_id, share }.into());
            }
            streams.push(JobStream {
                user_id,
                inv_share: 1.0 / share,
                usage: 0.0,
                pause_until: 0,
                cache: VecDeque::new(),
            });
        }
        Ok(Self {
            store,
            streams,
            table: SlotTable::new(opts.slot_count, opts.lease_secs),
            apps: Vec::new(),
            opts,
            reread_trigger,
        })
    }

    pub fn table(&mut self) -> &mut SlotTable {
        &mut self.table
    }

    /// Load the app registry. Called at startup and again whenever the
    /// `reread_db` trigger file appears.
    pub async fn load_apps(&mut self) -> Result<()> {
        self.apps = self.store.apps().await?;
        info!(napps = self.apps.len(), "App registry loaded");
        Ok(())
    }

    fn app_registered(&self, appid: i64) -> bool {
        self.apps.iter().any(|a| a.id == appid)
    }

    /// Shift every stream's usage down uniformly once the largest debt
    /// exceeds the headroom, so relative debts are kept but absolute
    /// usage never grows without bound.
    fn normalize_usage(&mut self) {
        let min_inv = self
            .streams
            .iter()
            .map(|s| s.inv_share)
            .fold(f64::INFINITY, f64::min);
        let max_usage = NJOBS_STARTUP * min_inv;
        let excess = self
            .streams
            .iter()
            .map(|s| s.usage)
            .fold(0.0, f64::max)
            - max_usage;
        if excess > 0.0 {
            for s in &mut self.streams {
                s.usage -= excess;
            }
        }
    }

    /// Index of the unpaused stream with the lowest usage. Ties go to
    /// the first stream in configuration order.
    fn pick_stream(&self, now: i64) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, s) in self.streams.iter().enumerate() {
            if s.pause_until > now {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) if s.usage < self.streams[b].usage => best = Some(i),
                _ => {}
            }
        }
        best
    }

    /// Refill one stream's cache from the store, dropping unusable
    /// candidates along the way.
    async fn refill_stream(&mut self, idx: usize, now: i64) -> Result<()> {
        let user_id = self.streams[idx].user_id;
        let candidates = self.store.feeder_candidates(user_id, ENUM_LIMIT).await?;
        let mut usable = VecDeque::new();
        for (wu, r) in candidates {
            if !self.app_registered(wu.appid) {
                warn!(wu_id = wu.id, appid = wu.appid, "Unregistered app; skipping");
                continue;
            }
            // A WU that errored after this result was created no longer
            // needs it; write it off instead of dispatching it.
            if wu.error_mask != 0 {
                debug!(
                    result_id = r.id,
                    wu_id = wu.id,
                    error_mask = wu.error_mask,
                    "WU errored; writing off unsent result"
                );
                let mut r = r;
                r.server_state = ServerState::Over;
                r.outcome = Outcome::DidntNeed;
                self.store.update_result(&r).await?;
                continue;
            }
            if self.table.contains_wu(wu.id) {
                continue;
            }
            usable.push_back(WorkItem {
                wu_id: wu.id,
                result_id: r.id,
                name: r.name,
                appid: wu.appid,
            });
        }

        let stream = &mut self.streams[idx];
        if usable.is_empty() {
            debug!(user_id, backoff = EMPTY_BACKOFF_TIME, "Stream empty; pausing");
            stream.pause_until = now + EMPTY_BACKOFF_TIME;
        } else {
            stream.cache = usable;
        }
        Ok(())
    }

    /// Drop unclaimed items that have outstayed the staleness window.
    fn purge_stale_slots(&mut self, now: i64, max_age_secs: i64) -> usize {
        let mut purged = 0;
        for s in &mut self.table.slots {
            if matches!(s, Slot::Present { filled_at, .. } if now - *filled_at > max_age_secs) {
                debug!("Dropping stale slot item");
                *s = Slot::Empty;
                purged += 1;
            }
        }
        purged
    }

    /// One feeder pass: reclaim lapsed leases, optionally purge stale
    /// items, then admit work into empty slots under proportional share.
    /// Returns true if any slot was filled.
    pub async fn fill_slots(&mut self, now: i64) -> Result<bool> {
        if consume_trigger(&self.reread_trigger) {
            info!("reread trigger consumed; reloading app registry");
            self.load_apps().await?;
        }
        self.table.reclaim_expired(now);
        if let Some(mins) = self.opts.purge_stale_mins {
            self.purge_stale_slots(now, mins * 60);
        }

        let mut filled = 0usize;
        while let Some(slot_idx) = self.table.first_empty() {
            let Some(stream_idx) = self.pick_stream(now) else {
                break;
            };

            if self.streams[stream_idx].cache.is_empty() {
                self.refill_stream(stream_idx, now).await?;
                if self.streams[stream_idx].cache.is_empty() {
                    // Paused by the refill; the next pick skips it.
                    continue;
                }
            }

            // Items cached before earlier admissions may have become
            // duplicates since; recheck at admission time.
            let item = loop {
                match self.streams[stream_idx].cache.pop_front() {
                    Some(item) if self.table.contains_wu(item.wu_id) => continue,
                    other => break other,
                }
            };
            let Some(item) = item else { continue };

            debug!(
                slot = slot_idx,
                user_id = self.streams[stream_idx].user_id,
                result_id = item.result_id,
                "Admitting work item"
            );
            self.table.fill(slot_idx, item, now);
            self.streams[stream_idx].usage += self.streams[stream_idx].inv_share;
            self.normalize_usage();
            filled += 1;
        }

        if filled > 0 {
            info!(filled, occupied = self.table.occupied(), "Feeder pass filled slots");
        }
        Ok(filled > 0)
    }
}

#[async_trait]
impl DaemonPass for Feeder {
    fn name(&self) -> &'static str {
        "feeder"
    }

    async fn pass(&mut self) -> Result<bool> {
        self.fill_slots(unix_now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResultRecord, Workunit};
    use crate::store::MemStore;

    async fn seed_app(store: &MemStore) {
        store
            .insert_app(&App {
                id: 1,
                name: "uppercase".into(),
            })
            .await
            .unwrap();
    }

    /// Seed `n` single-result WUs with unsent results owned by `userid`.
    async fn seed_unsent(store: &MemStore, userid: i64, n: usize, prefix: &str) {
        for i in 0..n {
            let wu = Workunit::new(format!("{prefix}_{i}"), 1, 100);
            let wu_id = store.insert_workunit(&wu).await.unwrap();
            let wu = store.workunit(wu_id).await.unwrap().unwrap();
            let mut r = ResultRecord::new_for_wu(&wu, 0, 100);
            r.userid = userid;
            store.insert_results(&[r]).await.unwrap();
        }
    }

    fn trigger_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("reread_db")
    }

    #[tokio::test]
    async fn fills_slots_from_single_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_app(&store).await;
        seed_unsent(&store, 7, 5, "wu_a").await;

        let opts = FeederOpts {
            slot_count: 10,
            ..Default::default()
        };
        let mut feeder =
            Feeder::new(store.clone(), &[(7, 1.0)], opts, trigger_path(&dir)).unwrap();
        feeder.load_apps().await.unwrap();

        assert!(feeder.fill_slots(1_000).await.unwrap());
        assert_eq!(feeder.table().occupied(), 5);
    }

    #[tokio::test]
    async fn shares_converge_to_proportion() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_app(&store).await;
        seed_unsent(&store, 1, 60, "wu_u1").await;
        seed_unsent(&store, 2, 60, "wu_u2").await;

        let opts = FeederOpts {
            slot_count: 90,
            ..Default::default()
        };
        let mut feeder = Feeder::new(
            store.clone(),
            &[(1, 1.0), (2, 2.0)],
            opts,
            trigger_path(&dir),
        )
        .unwrap();
        feeder.load_apps().await.unwrap();
        feeder.fill_slots(1_000).await.unwrap();
        assert_eq!(feeder.table().occupied(), 90);

        let mut admitted = std::collections::HashMap::new();
        for s in &feeder.table.slots {
            if let Slot::Present { item, .. } = s {
                let user = if item.name.starts_with("wu_u1") { 1 } else { 2 };
                *admitted.entry(user).or_insert(0usize) += 1;
            }
        }
        let u1 = admitted[&1] as f64;
        let u2 = admitted[&2] as f64;
        // Share 2 should receive about twice the admissions of share 1.
        assert!((u2 / u1 - 2.0).abs() < 0.15, "u1={u1} u2={u2}");
    }

    #[tokio::test]
    async fn empty_stream_backs_off_and_others_continue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_app(&store).await;
        seed_unsent(&store, 2, 4, "wu_only").await;

        let opts = FeederOpts {
            slot_count: 10,
            ..Default::default()
        };
        let mut feeder = Feeder::new(
            store.clone(),
            &[(1, 1.0), (2, 1.0)],
            opts,
            trigger_path(&dir),
        )
        .unwrap();
        feeder.load_apps().await.unwrap();
        feeder.fill_slots(1_000).await.unwrap();

        // Stream 1 found nothing and is paused; stream 2's work landed.
        assert_eq!(feeder.table().occupied(), 4);
        assert_eq!(feeder.streams[0].pause_until, 1_000 + EMPTY_BACKOFF_TIME);
    }

    #[tokio::test]
    async fn one_result_per_wu_in_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_app(&store).await;

        let wu = Workunit::new("wu_dup", 1, 100);
        let wu_id = store.insert_workunit(&wu).await.unwrap();
        let wu = store.workunit(wu_id).await.unwrap().unwrap();
        let mut r0 = ResultRecord::new_for_wu(&wu, 0, 100);
        r0.userid = 7;
        let mut r1 = ResultRecord::new_for_wu(&wu, 1, 100);
        r1.userid = 7;
        store.insert_results(&[r0, r1]).await.unwrap();

        let opts = FeederOpts {
            slot_count: 10,
            ..Default::default()
        };
        let mut feeder =
            Feeder::new(store.clone(), &[(7, 1.0)], opts, trigger_path(&dir)).unwrap();
        feeder.load_apps().await.unwrap();
        feeder.fill_slots(1_000).await.unwrap();

        assert_eq!(feeder.table().occupied(), 1);
    }

    #[tokio::test]
    async fn errored_wu_results_are_written_off() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_app(&store).await;

        let mut wu = Workunit::new("wu_err", 1, 100);
        wu.error_mask = crate::model::WU_ERROR_TOO_MANY_ERROR_RESULTS;
        let wu_id = store.insert_workunit(&wu).await.unwrap();
        let wu = store.workunit(wu_id).await.unwrap().unwrap();
        let mut r = ResultRecord::new_for_wu(&wu, 0, 100);
        r.userid = 7;
        let rid = store.insert_results(&[r]).await.unwrap()[0];

        let mut feeder = Feeder::new(
            store.clone(),
            &[(7, 1.0)],
            FeederOpts::default(),
            trigger_path(&dir),
        )
        .unwrap();
        feeder.load_apps().await.unwrap();
        feeder.fill_slots(1_000).await.unwrap();

        assert_eq!(feeder.table().occupied(), 0);
        let r = store.result(rid).await.unwrap().unwrap();
        assert_eq!(r.server_state, ServerState::Over);
        assert_eq!(r.outcome, Outcome::DidntNeed);
    }

    #[tokio::test]
    async fn lapsed_lease_returns_item_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_app(&store).await;
        seed_unsent(&store, 7, 1, "wu_lease").await;

        let opts = FeederOpts {
            slot_count: 2,
            lease_secs: 60,
            ..Default::default()
        };
        let mut feeder =
            Feeder::new(store.clone(), &[(7, 1.0)], opts, trigger_path(&dir)).unwrap();
        feeder.load_apps().await.unwrap();
        feeder.fill_slots(1_000).await.unwrap();

        let item = feeder.table().claim(1_000).unwrap();
        assert!(feeder.table().claim(1_000).is_none());

        // Lease lapses; the same item becomes claimable again.
        feeder.table().reclaim_expired(1_061);
        let again = feeder.table().claim(1_061).unwrap();
        assert_eq!(again, item);
    }

    #[tokio::test]
    async fn stale_unclaimed_items_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_app(&store).await;
        seed_unsent(&store, 7, 2, "wu_stale").await;

        let mut feeder = Feeder::new(
            store.clone(),
            &[(7, 1.0)],
            FeederOpts::default(),
            trigger_path(&dir),
        )
        .unwrap();
        feeder.load_apps().await.unwrap();
        feeder.fill_slots(1_000).await.unwrap();
        assert_eq!(feeder.table().occupied(), 2);

        // Within the window nothing is dropped; past it both are.
        assert_eq!(feeder.purge_stale_slots(1_000 + 60, 180), 0);
        assert_eq!(feeder.purge_stale_slots(1_000 + 181, 180), 2);
        assert_eq!(feeder.table().occupied(), 0);
    }

    #[tokio::test]
    async fn reread_trigger_reloads_apps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        seed_unsent(&store, 7, 1, "wu_late_app").await;

        let mut feeder = Feeder::new(
            store.clone(),
            &[(7, 1.0)],
            FeederOpts::default(),
            trigger_path(&dir),
        )
        .unwrap();
        feeder.load_apps().await.unwrap();
        feeder.fill_slots(1_000).await.unwrap();
        // App not registered yet: nothing admitted.
        assert_eq!(feeder.table().occupied(), 0);

        seed_app(&store).await;
        std::fs::write(trigger_path(&dir), "").unwrap();
        feeder.fill_slots(1_100).await.unwrap();
        assert_eq!(feeder.table().occupied(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemStore::new());
        assert!(Feeder::new(
            store.clone(),
            &[],
            FeederOpts::default(),
            trigger_path(&dir)
        )
        .is_err());
        assert!(Feeder::new(
            store,
            &[(1, 0.0)],
            FeederOpts::default(),
            trigger_path(&dir)
        )
        .is_err());
    }
}
