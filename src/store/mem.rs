//! In-memory `JobStore` backend.
//!
//! Backs the test suite and single-process experiments. Filter semantics
//! are kept identical to the SQL rendering in the libSQL backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{
    App, AssimilateState, Batch, BatchState, FileDeleteState, HostAppVersion, ResultRecord,
    ServerState, Workunit, WorkunitWithResults,
};
use crate::store::query::{like_match, ResultFilter, WuFilter};
use crate::store::traits::JobStore;
use crate::store::Shard;

#[derive(Default)]
struct Inner {
    wus: BTreeMap<i64, Workunit>,
    results: BTreeMap<i64, ResultRecord>,
    batches: BTreeMap<i64, Batch>,
    apps: BTreeMap<i64, App>,
    havs: HashMap<(i64, i64), HostAppVersion>,
    next_wu_id: i64,
    next_result_id: i64,
}

/// In-memory job store.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wu_matches(filter: &WuFilter, wu: &Workunit) -> bool {
    if let Some(s) = filter.assimilate_state {
        if wu.assimilate_state != s {
            return false;
        }
    }
    if let Some(s) = filter.file_delete_state {
        if wu.file_delete_state != s {
            return false;
        }
    }
    if let Some(appid) = filter.appid {
        if wu.appid != appid {
            return false;
        }
    }
    if let Some(shard) = filter.shard {
        if !shard.matches(wu.id) {
            return false;
        }
    }
    if let Some(t) = filter.max_create_time {
        if wu.create_time > t {
            return false;
        }
    }
    if let Some(batches) = &filter.batch_in {
        if !batches.contains(&wu.batch) {
            return false;
        }
    }
    if let Some(pat) = &filter.xml_doc_like {
        if !like_match(pat, &wu.xml_doc) {
            return false;
        }
    }
    if let Some(due) = filter.transition_due_by {
        if wu.transition_time > due {
            return false;
        }
    }
    true
}

fn result_matches(filter: &ResultFilter, r: &ResultRecord) -> bool {
    if !filter.file_delete_states.is_empty()
        && !filter.file_delete_states.contains(&r.file_delete_state)
    {
        return false;
    }
    if let Some(s) = filter.server_state {
        if r.server_state != s {
            return false;
        }
    }
    if let Some(appid) = filter.appid {
        if r.appid != appid {
            return false;
        }
    }
    if let Some(userid) = filter.userid {
        if r.userid != userid {
            return false;
        }
    }
    if let Some(shard) = filter.shard {
        if !shard.matches(r.id) {
            return false;
        }
    }
    if let Some(pat) = &filter.xml_doc_like {
        if !like_match(pat, &r.xml_doc_in) {
            return false;
        }
    }
    true
}

/// Lifecycle fields the guarded update compares. A mismatch on any of
/// these means another daemon advanced the row since it was read.
fn guard_fields_match(a: &Workunit, b: &Workunit) -> bool {
    a.transition_time == b.transition_time
        && a.error_mask == b.error_mask
        && a.canonical_resultid == b.canonical_resultid
        && a.need_validate == b.need_validate
        && a.assimilate_state == b.assimilate_state
        && a.file_delete_state == b.file_delete_state
        && a.hr_class == b.hr_class
        && a.app_version_id == b.app_version_id
        && a.transitioner_flags == b.transitioner_flags
        && a.priority == b.priority
}

#[async_trait]
impl JobStore for MemStore {
    async fn insert_workunit(&self, wu: &Workunit) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_wu_id += 1;
        let id = inner.next_wu_id;
        let mut wu = wu.clone();
        wu.id = id;
        inner.wus.insert(id, wu);
        Ok(id)
    }

    async fn insert_results(&self, results: &[ResultRecord]) -> Result<Vec<i64>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut ids = Vec::with_capacity(results.len());
        for r in results {
            inner.next_result_id += 1;
            let id = inner.next_result_id;
            let mut r = r.clone();
            r.id = id;
            inner.results.insert(id, r);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn workunit(&self, id: i64) -> Result<Option<Workunit>, StoreError> {
        Ok(self.inner.read().await.wus.get(&id).cloned())
    }

    async fn result(&self, id: i64) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self.inner.read().await.results.get(&id).cloned())
    }

    async fn enumerate_workunits(
        &self,
        filter: &WuFilter,
        limit: usize,
    ) -> Result<Vec<Workunit>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .wus
            .values()
            .filter(|wu| wu_matches(filter, wu))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn enumerate_results(
        &self,
        filter: &ResultFilter,
        limit: usize,
    ) -> Result<Vec<ResultRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .values()
            .filter(|r| result_matches(filter, r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn enumerate_transition_ready(
        &self,
        now: i64,
        shard: Option<Shard>,
        limit: usize,
    ) -> Result<Vec<WorkunitWithResults>, StoreError> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for wu in inner.wus.values() {
            if wu.transition_time > now {
                continue;
            }
            if let Some(shard) = shard {
                if !shard.matches(wu.id) {
                    continue;
                }
            }
            let results = inner
                .results
                .values()
                .filter(|r| r.workunitid == wu.id)
                .cloned()
                .collect();
            out.push(WorkunitWithResults {
                wu: wu.clone(),
                results,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn results_for_wu(&self, wu_id: i64) -> Result<Vec<ResultRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .values()
            .filter(|r| r.workunitid == wu_id)
            .cloned()
            .collect())
    }

    async fn feeder_candidates(
        &self,
        userid: i64,
        limit: usize,
    ) -> Result<Vec<(Workunit, ResultRecord)>, StoreError> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for r in inner.results.values() {
            if r.userid != userid || r.server_state != ServerState::Unsent {
                continue;
            }
            let Some(wu) = inner.wus.get(&r.workunitid) else {
                continue;
            };
            out.push((wu.clone(), r.clone()));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn update_workunit(&self, wu: &Workunit) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.wus.get_mut(&wu.id) {
            Some(slot) => {
                *slot = wu.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "workunit".into(),
                id: wu.id,
            }),
        }
    }

    async fn update_workunit_guarded(
        &self,
        prev: &Workunit,
        new: &Workunit,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.wus.get_mut(&prev.id) {
            Some(slot) => {
                if guard_fields_match(slot, prev) {
                    *slot = new.clone();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Err(StoreError::NotFound {
                entity: "workunit".into(),
                id: prev.id,
            }),
        }
    }

    async fn update_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.results.get_mut(&result.id) {
            Some(slot) => {
                *slot = result.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "result".into(),
                id: result.id,
            }),
        }
    }

    async fn set_wu_file_delete_state(
        &self,
        id: i64,
        state: FileDeleteState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.wus.get_mut(&id) {
            Some(wu) => {
                wu.file_delete_state = state;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "workunit".into(),
                id,
            }),
        }
    }

    async fn set_result_file_delete_state(
        &self,
        id: i64,
        state: FileDeleteState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.results.get_mut(&id) {
            Some(r) => {
                r.file_delete_state = state;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "result".into(),
                id,
            }),
        }
    }

    async fn set_assimilate_states(
        &self,
        updates: &[(i64, AssimilateState, i64)],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for &(id, state, transition_time) in updates {
            match inner.wus.get_mut(&id) {
                Some(wu) => {
                    wu.assimilate_state = state;
                    wu.transition_time = transition_time;
                }
                None => {
                    return Err(StoreError::NotFound {
                        entity: "workunit".into(),
                        id,
                    })
                }
            }
        }
        Ok(())
    }

    async fn delete_workunit(&self, id: i64) -> Result<(), StoreError> {
        self.inner.write().await.wus.remove(&id);
        Ok(())
    }

    async fn delete_result(&self, id: i64) -> Result<(), StoreError> {
        self.inner.write().await.results.remove(&id);
        Ok(())
    }

    async fn upsert_batch(&self, batch: Batch) -> Result<(), StoreError> {
        self.inner.write().await.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn retired_batches(&self) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .batches
            .values()
            .filter(|b| b.state == BatchState::Retired)
            .map(|b| b.id)
            .collect())
    }

    async fn min_live_wu_create_time(&self) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.wus.values().map(|wu| wu.create_time).min())
    }

    async fn apps(&self) -> Result<Vec<App>, StoreError> {
        Ok(self.inner.read().await.apps.values().cloned().collect())
    }

    async fn insert_app(&self, app: &App) -> Result<(), StoreError> {
        self.inner.write().await.apps.insert(app.id, app.clone());
        Ok(())
    }

    async fn app_by_name(&self, name: &str) -> Result<Option<App>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.apps.values().find(|a| a.name == name).cloned())
    }

    async fn host_app_version(
        &self,
        host_id: i64,
        app_version_id: i64,
    ) -> Result<HostAppVersion, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(*inner
            .havs
            .entry((host_id, app_version_id))
            .or_insert_with(|| HostAppVersion::new(host_id, app_version_id)))
    }

    async fn update_host_app_version(&self, hav: &HostAppVersion) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .havs
            .insert((hav.host_id, hav.app_version_id), *hav);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_enumerate() {
        let store = MemStore::new();
        let wu_id = store
            .insert_workunit(&Workunit::new("wu_a", 1, 100))
            .await
            .unwrap();
        let wu = store.workunit(wu_id).await.unwrap().unwrap();
        let ids = store
            .insert_results(&[
                ResultRecord::new_for_wu(&wu, 0, 100),
                ResultRecord::new_for_wu(&wu, 1, 100),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.results_for_wu(wu_id).await.unwrap().len(), 2);

        let due = store
            .enumerate_transition_ready(200, None, 100)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].results.len(), 2);
    }

    #[tokio::test]
    async fn guarded_update_detects_interference() {
        let store = MemStore::new();
        let id = store
            .insert_workunit(&Workunit::new("wu_g", 1, 100))
            .await
            .unwrap();
        let snapshot = store.workunit(id).await.unwrap().unwrap();

        // Another daemon advances the row between read and write.
        let mut interfering = snapshot.clone();
        interfering.assimilate_state = AssimilateState::Ready;
        store.update_workunit(&interfering).await.unwrap();

        let mut ours = snapshot.clone();
        ours.transition_time = 999;
        assert!(!store.update_workunit_guarded(&snapshot, &ours).await.unwrap());

        // With a fresh snapshot the update goes through.
        let fresh = store.workunit(id).await.unwrap().unwrap();
        let mut ours = fresh.clone();
        ours.transition_time = 999;
        assert!(store.update_workunit_guarded(&fresh, &ours).await.unwrap());
    }

    #[tokio::test]
    async fn shard_filters_enumeration() {
        let store = MemStore::new();
        for i in 0..10 {
            store
                .insert_workunit(&Workunit::new(format!("wu_{i}"), 1, 100))
                .await
                .unwrap();
        }
        let shard = Shard { n: 2, r: 0 };
        let due = store
            .enumerate_transition_ready(200, Some(shard), 100)
            .await
            .unwrap();
        assert_eq!(due.len(), 5);
        assert!(due.iter().all(|w| w.wu.id % 2 == 0));
    }

    #[tokio::test]
    async fn retired_batches_only() {
        let store = MemStore::new();
        store
            .upsert_batch(Batch {
                id: 1,
                state: BatchState::InProgress,
            })
            .await
            .unwrap();
        store
            .upsert_batch(Batch {
                id: 2,
                state: BatchState::Retired,
            })
            .await
            .unwrap();
        assert_eq!(store.retired_batches().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn host_app_version_materializes_default() {
        let store = MemStore::new();
        let hav = store.host_app_version(7, 3).await.unwrap();
        assert_eq!(hav.max_jobs_per_day, 100);
        let mut hav = hav;
        hav.penalize_timeout();
        store.update_host_app_version(&hav).await.unwrap();
        assert_eq!(
            store.host_app_version(7, 3).await.unwrap().max_jobs_per_day,
            99
        );
    }
}
