//! File Deletion Sweeper.
//!
//! Drains workunits and results marked ready for deletion, removes their
//! on-disk files from the fanned-out upload tree, and reports per-item
//! success or failure back into the job store. A companion antique
//! deleter reconciles orphaned files against the oldest live workunit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::daemon::DaemonPass;
use crate::error::Result;
use crate::model::FileDeleteState;
use crate::store::{JobStore, ResultFilter, Shard, WuFilter};
use crate::transitioner::unix_now;

/// Items examined per scan per pass.
const ENUM_LIMIT: usize = 500;

/// How often previously-errored items get one more try.
const ERROR_INTERVAL: i64 = 3600;

/// Antique files older than this are fair game even with live WUs around.
const ANTIQUE_LIMIT_SECS: i64 = 31 * 86_400;

/// Files removed by the antique deleter in a single pass.
const ANTIQUE_DELETE_CAP: usize = 50_000;

/// One entry of a `<file_info>` manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub no_delete: bool,
}

/// Parse the `<file_info>` fragments of a WU or result manifest.
///
/// The manifest is a fragment, not a document: zero or more blocks, each
/// with a `<name>` and an optional `<no_delete/>` flag.
pub fn parse_file_manifest(xml: &str) -> std::result::Result<Vec<FileInfo>, String> {
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<file_info>") {
        let after = &rest[start + "<file_info>".len()..];
        let Some(end) = after.find("</file_info>") else {
            return Err("unterminated <file_info> block".into());
        };
        let block = &after[..end];
        let name = block
            .find("<name>")
            .and_then(|i| {
                let inner = &block[i + "<name>".len()..];
                inner.find("</name>").map(|j| inner[..j].trim().to_string())
            })
            .ok_or_else(|| "<file_info> block without <name>".to_string())?;
        if name.is_empty() {
            return Err("empty <name> in <file_info> block".into());
        }
        let no_delete = block.contains("<no_delete/>") || block.contains("<no_delete>");
        out.push(FileInfo { name, no_delete });
        rest = &after[end..];
    }
    Ok(out)
}

/// Resolve a file's location in the content-hash-fanout directory scheme:
/// `upload_dir/<hash(name) % fanout as hex>/<name>`.
pub fn dir_hier_path(name: &str, upload_dir: &Path, fanout: u32) -> PathBuf {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();
    name.hash(&mut hasher);
    let bucket = hasher.finish() % fanout.max(1) as u64;
    upload_dir.join(format!("{bucket:x}")).join(name)
}

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteOutcome {
    Deleted,
    /// Parent fanout directory missing; transient, retry later.
    DirMissing,
    /// Missing from a present directory, or the unlink itself failed.
    Failed,
}

/// Sweeper behavior flags (CLI surface).
#[derive(Debug, Clone, Default)]
pub struct SweeperOpts {
    /// Mark states in the store but leave files on disk.
    pub preserve_wu_files: bool,
    pub preserve_result_files: bool,
    /// Compute outcomes but never write states back.
    pub no_db_update: bool,
    /// Scan only WU input files / only result output files.
    pub input_files_only: bool,
    pub output_files_only: bool,
    /// Periodically retry items previously left in ERROR.
    pub retry_errors: bool,
    pub appid: Option<i64>,
    pub xml_doc_like: Option<String>,
    pub shard: Option<Shard>,
}

/// The File Deletion Sweeper daemon.
pub struct FileDeleter {
    store: Arc<dyn JobStore>,
    upload_dir: PathBuf,
    fanout: u32,
    cache_md5_info: bool,
    opts: SweeperOpts,
    /// Last time the ERROR retry window opened.
    last_error_retry: i64,
}

impl FileDeleter {
    pub fn new(store: Arc<dyn JobStore>, config: &ProjectConfig, opts: SweeperOpts) -> Self {
        Self {
            store,
            upload_dir: config.upload_dir.clone(),
            fanout: config.uldl_dir_fanout,
            cache_md5_info: config.cache_md5_info,
            opts,
            last_error_retry: 0,
        }
    }

    /// One sweep over ready (and, within the retry window, errored)
    /// results and workunits. Returns true if anything was examined.
    pub async fn delete_ready_files(&mut self, now: i64) -> Result<bool> {
        if !self.upload_dir.is_dir() {
            return Err(crate::error::SweepError::UploadDirMissing(self.upload_dir.clone()).into());
        }
        let mut states = vec![FileDeleteState::Ready];
        if self.opts.retry_errors && now - self.last_error_retry >= ERROR_INTERVAL {
            self.last_error_retry = now;
            states.push(FileDeleteState::Error);
            debug!("Retry window open; including errored items");
        }

        let mut found = false;
        if !self.opts.input_files_only {
            found |= self.sweep_results(&states).await?;
        }
        if !self.opts.output_files_only {
            found |= self.sweep_workunits(&states).await?;
        }
        Ok(found)
    }

    async fn sweep_results(&self, states: &[FileDeleteState]) -> Result<bool> {
        let filter = ResultFilter {
            file_delete_states: states.to_vec(),
            appid: self.opts.appid,
            xml_doc_like: self.opts.xml_doc_like.clone(),
            shard: self.opts.shard,
            ..Default::default()
        };
        let results = self.store.enumerate_results(&filter, ENUM_LIMIT).await?;
        let found = !results.is_empty();

        for r in results {
            if r.name.contains("nodelete") {
                debug!(result_id = r.id, name = %r.name, "Skipping nodelete result");
                continue;
            }
            let new_state = self.sweep_item(
                "result",
                r.id,
                &r.xml_doc_in,
                self.opts.preserve_result_files,
            );
            if let Some(state) = new_state {
                if state != r.file_delete_state && !self.opts.no_db_update {
                    self.store.set_result_file_delete_state(r.id, state).await?;
                }
            }
        }
        Ok(found)
    }

    async fn sweep_workunits(&self, states: &[FileDeleteState]) -> Result<bool> {
        let mut found = false;
        for &state in states {
            let filter = WuFilter {
                file_delete_state: Some(state),
                appid: self.opts.appid,
                xml_doc_like: self.opts.xml_doc_like.clone(),
                shard: self.opts.shard,
                ..Default::default()
            };
            let wus = self.store.enumerate_workunits(&filter, ENUM_LIMIT).await?;
            found |= !wus.is_empty();

            for wu in wus {
                if wu.name.contains("nodelete") {
                    debug!(wu_id = wu.id, name = %wu.name, "Skipping nodelete WU");
                    continue;
                }
                let new_state =
                    self.sweep_item("workunit", wu.id, &wu.xml_doc, self.opts.preserve_wu_files);
                if let Some(state) = new_state {
                    if state != wu.file_delete_state && !self.opts.no_db_update {
                        self.store.set_wu_file_delete_state(wu.id, state).await?;
                    }
                }
            }
        }
        Ok(found)
    }

    /// Delete one item's files. Returns the state to record, or None when
    /// a transient condition (missing fanout dir) means "leave as-is and
    /// retry on a later pass".
    fn sweep_item(
        &self,
        entity: &'static str,
        id: i64,
        manifest_xml: &str,
        preserve: bool,
    ) -> Option<FileDeleteState> {
        let manifest = match parse_file_manifest(manifest_xml) {
            Ok(m) => m,
            Err(reason) => {
                let err = crate::error::SweepError::BadManifest { entity, id, reason };
                warn!(error = %err, "Leaving item in ERROR");
                return Some(FileDeleteState::Error);
            }
        };

        let mut failed = 0usize;
        let mut transient = 0usize;
        let mut deleted = 0usize;
        for fi in &manifest {
            if fi.no_delete {
                debug!(entity, id, file = %fi.name, "Protected by no_delete");
                continue;
            }
            if preserve {
                continue;
            }
            match self.delete_one(&fi.name) {
                DeleteOutcome::Deleted => deleted += 1,
                DeleteOutcome::DirMissing => transient += 1,
                DeleteOutcome::Failed => failed += 1,
            }
        }

        if failed > 0 {
            warn!(entity, id, failed, "File deletion failed");
            Some(FileDeleteState::Error)
        } else if transient > 0 {
            info!(entity, id, "Fanout directory missing; will retry");
            None
        } else {
            debug!(entity, id, deleted, "Files deleted");
            Some(FileDeleteState::Done)
        }
    }

    fn delete_one(&self, name: &str) -> DeleteOutcome {
        let path = dir_hier_path(name, &self.upload_dir, self.fanout);
        let outcome = match std::fs::remove_file(&path) {
            Ok(()) => DeleteOutcome::Deleted,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match path.parent() {
                    Some(dir) if !dir.exists() => DeleteOutcome::DirMissing,
                    _ => {
                        // A file the manifest names but the fanout dir
                        // doesn't hold: something else removed it, so the
                        // item needs a human look, not a DONE mark.
                        warn!(file = %path.display(), "File missing from its fanout directory");
                        DeleteOutcome::Failed
                    }
                }
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Unlink failed");
                DeleteOutcome::Failed
            }
        };

        // Sidecars are best-effort; their absence is normal.
        if outcome == DeleteOutcome::Deleted {
            let gz = PathBuf::from(format!("{}.gz", path.display()));
            let _ = std::fs::remove_file(gz);
            if self.cache_md5_info {
                let md5 = PathBuf::from(format!("{}.md5", path.display()));
                let _ = std::fs::remove_file(md5);
            }
        }
        outcome
    }
}

#[async_trait]
impl DaemonPass for FileDeleter {
    fn name(&self) -> &'static str {
        "file_deleter"
    }

    async fn pass(&mut self) -> Result<bool> {
        self.delete_ready_files(unix_now()).await
    }
}

/// Safety net against files orphaned by rows purged before their files
/// were ever claimed: walks the upload tree outside of any DB-referenced
/// manifest and removes anything older than the oldest live WU.
pub struct AntiqueDeleter {
    store: Arc<dyn JobStore>,
    upload_dir: PathBuf,
    httpd_uid: Option<u32>,
}

impl AntiqueDeleter {
    pub fn new(store: Arc<dyn JobStore>, config: &ProjectConfig) -> Self {
        Self {
            store,
            upload_dir: config.upload_dir.clone(),
            httpd_uid: config.httpd_uid,
        }
    }

    /// One reconciliation pass. Returns true if anything was removed.
    pub async fn delete_antiques(&self, now: i64) -> Result<bool> {
        let oldest_live = self.store.min_live_wu_create_time().await?.unwrap_or(now);
        let cutoff = oldest_live.min(now - ANTIQUE_LIMIT_SECS);
        info!(cutoff, "Antique sweep starting");

        let mut removed = 0usize;
        self.walk(&self.upload_dir, cutoff, &mut removed)?;
        if removed > 0 {
            info!(removed, "Antique files removed");
        }
        Ok(removed > 0)
    }

    fn walk(&self, dir: &Path, cutoff: i64, removed: &mut usize) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(crate::error::SweepError::Io(e).into()),
        };
        for entry in entries.flatten() {
            if *removed >= ANTIQUE_DELETE_CAP {
                return Ok(());
            }
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                self.walk(&path, cutoff, removed)?;
                continue;
            }
            if let Some(uid) = self.httpd_uid {
                use std::os::unix::fs::MetadataExt;
                if meta.uid() != uid {
                    continue;
                }
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(i64::MAX);
            if mtime < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(file = %path.display(), "Removed antique file");
                        *removed += 1;
                    }
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "Failed to remove antique file");
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DaemonPass for AntiqueDeleter {
    fn name(&self) -> &'static str {
        "antique_deleter"
    }

    async fn pass(&mut self) -> Result<bool> {
        self.delete_antiques(unix_now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResultRecord, ServerState, Workunit};
    use crate::store::MemStore;

    #[test]
    fn manifest_parses_names_and_flags() {
        let xml = r#"
            <file_info>
                <name>foo.dat</name>
            </file_info>
            <file_info>
                <name>bar.dat</name>
                <no_delete/>
            </file_info>
        "#;
        let files = parse_file_manifest(xml).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], FileInfo { name: "foo.dat".into(), no_delete: false });
        assert_eq!(files[1], FileInfo { name: "bar.dat".into(), no_delete: true });

        assert!(parse_file_manifest("").unwrap().is_empty());
        assert!(parse_file_manifest("<file_info><name></name></file_info>").is_err());
        assert!(parse_file_manifest("<file_info><name>x</name>").is_err());
    }

    #[test]
    fn fanout_path_is_stable() {
        let a = dir_hier_path("foo.dat", Path::new("/up"), 1024);
        let b = dir_hier_path("foo.dat", Path::new("/up"), 1024);
        assert_eq!(a, b);
        assert!(a.starts_with("/up"));
        assert!(a.ends_with("foo.dat"));
    }

    fn write_fanout_file(upload: &Path, fanout: u32, name: &str) -> PathBuf {
        let path = dir_hier_path(name, upload, fanout);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"data").unwrap();
        path
    }

    fn test_config(upload: &Path) -> ProjectConfig {
        ProjectConfig {
            upload_dir: upload.to_path_buf(),
            uldl_dir_fanout: 16,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn deletes_file_and_gz_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let path = write_fanout_file(dir.path(), 16, "foo.dat");
        let gz = PathBuf::from(format!("{}.gz", path.display()));
        std::fs::write(&gz, b"gz").unwrap();

        let store = Arc::new(MemStore::new());
        let mut wu = Workunit::new("wu_del", 1, 100);
        wu.file_delete_state = FileDeleteState::Ready;
        wu.xml_doc = "<file_info><name>foo.dat</name></file_info>".into();
        let id = store.insert_workunit(&wu).await.unwrap();

        let mut deleter = FileDeleter::new(store.clone(), &cfg, SweeperOpts::default());
        assert!(deleter.delete_ready_files(10_000).await.unwrap());

        assert!(!path.exists());
        assert!(!gz.exists());
        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.file_delete_state, FileDeleteState::Done);
    }

    #[tokio::test]
    async fn no_delete_files_survive() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let keep = write_fanout_file(dir.path(), 16, "keep.dat");
        let gone = write_fanout_file(dir.path(), 16, "gone.dat");

        let store = Arc::new(MemStore::new());
        let mut wu = Workunit::new("wu_mix", 1, 100);
        wu.file_delete_state = FileDeleteState::Ready;
        wu.xml_doc = "<file_info><name>keep.dat</name><no_delete/></file_info>\
                      <file_info><name>gone.dat</name></file_info>"
            .into();
        let id = store.insert_workunit(&wu).await.unwrap();

        let mut deleter = FileDeleter::new(store.clone(), &cfg, SweeperOpts::default());
        deleter.delete_ready_files(10_000).await.unwrap();

        assert!(keep.exists());
        assert!(!gone.exists());
        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.file_delete_state, FileDeleteState::Done);
    }

    #[tokio::test]
    async fn nodelete_name_skips_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let path = write_fanout_file(dir.path(), 16, "in.dat");

        let store = Arc::new(MemStore::new());
        let mut wu = Workunit::new("wu_nodelete_7", 1, 100);
        wu.file_delete_state = FileDeleteState::Ready;
        wu.xml_doc = "<file_info><name>in.dat</name></file_info>".into();
        let id = store.insert_workunit(&wu).await.unwrap();

        let mut deleter = FileDeleter::new(store.clone(), &cfg, SweeperOpts::default());
        deleter.delete_ready_files(10_000).await.unwrap();

        assert!(path.exists());
        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.file_delete_state, FileDeleteState::Ready);
    }

    #[tokio::test]
    async fn result_manifest_sweep_marks_done() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let path = write_fanout_file(dir.path(), 16, "out_0.dat");

        let store = Arc::new(MemStore::new());
        let wu = Workunit::new("wu_r", 1, 100);
        let wu_id = store.insert_workunit(&wu).await.unwrap();
        let wu = store.workunit(wu_id).await.unwrap().unwrap();
        let mut r = ResultRecord::new_for_wu(&wu, 0, 100);
        r.server_state = ServerState::Over;
        r.file_delete_state = FileDeleteState::Ready;
        r.xml_doc_in = "<file_info><name>out_0.dat</name></file_info>".into();
        let rid = store.insert_results(&[r]).await.unwrap()[0];

        let mut deleter = FileDeleter::new(store.clone(), &cfg, SweeperOpts::default());
        deleter.delete_ready_files(10_000).await.unwrap();

        assert!(!path.exists());
        let r = store.result(rid).await.unwrap().unwrap();
        assert_eq!(r.file_delete_state, FileDeleteState::Done);
    }

    #[tokio::test]
    async fn missing_file_in_present_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        // Fanout dir exists, the file does not.
        let path = dir_hier_path("ghost.dat", dir.path(), 16);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        let store = Arc::new(MemStore::new());
        let mut wu = Workunit::new("wu_ghost", 1, 100);
        wu.file_delete_state = FileDeleteState::Ready;
        wu.xml_doc = "<file_info><name>ghost.dat</name></file_info>".into();
        let id = store.insert_workunit(&wu).await.unwrap();

        let mut deleter = FileDeleter::new(store.clone(), &cfg, SweeperOpts::default());
        deleter.delete_ready_files(10_000).await.unwrap();

        // Left for manual inspection, never silently marked done.
        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.file_delete_state, FileDeleteState::Error);
    }

    #[tokio::test]
    async fn missing_fanout_dir_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let store = Arc::new(MemStore::new());
        let mut wu = Workunit::new("wu_trans", 1, 100);
        wu.file_delete_state = FileDeleteState::Ready;
        wu.xml_doc = "<file_info><name>nowhere.dat</name></file_info>".into();
        let id = store.insert_workunit(&wu).await.unwrap();

        let mut deleter = FileDeleter::new(store.clone(), &cfg, SweeperOpts::default());
        deleter.delete_ready_files(10_000).await.unwrap();

        // Left READY for a later retry.
        let wu = store.workunit(id).await.unwrap().unwrap();
        assert_eq!(wu.file_delete_state, FileDeleteState::Ready);
    }

    #[tokio::test]
    async fn antique_deleter_respects_live_wus() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let orphan = write_fanout_file(dir.path(), 16, "orphan.dat");

        let store = Arc::new(MemStore::new());
        let file_mtime = unix_now();

        // A live WU older than the orphan pins the cutoff below it.
        store
            .insert_workunit(&Workunit::new("wu_old", 1, file_mtime - 100))
            .await
            .unwrap();
        let antique = AntiqueDeleter::new(store.clone(), &cfg);
        antique.delete_antiques(file_mtime + 40 * 86_400).await.unwrap();
        assert!(orphan.exists());

        // With no live WUs the 31-day limit alone applies.
        let store = Arc::new(MemStore::new());
        let antique = AntiqueDeleter::new(store, &cfg);
        antique.delete_antiques(file_mtime + 40 * 86_400).await.unwrap();
        assert!(!orphan.exists());
    }
}
