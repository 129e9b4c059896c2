//! DB Purge / Archiver.
//!
//! Removes fully-finished workunits and their results from the job store,
//! after writing each row to append-only XML archive files (plain,
//! gzip, or zlib) plus flat index files. Rows are archived before they are
//! deleted; a WU whose archive write fails is skipped, not lost.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::daemon::DaemonPass;
use crate::error::{PurgeError, Result};
use crate::model::{FileDeleteState, ResultRecord, Workunit};
use crate::store::{JobStore, Shard, WuFilter};
use crate::transitioner::unix_now;

/// WUs examined per pass.
const ENUM_LIMIT: usize = 1000;

/// How archive streams are compressed on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveCompression {
    #[default]
    None,
    Gzip,
    Zlib,
}

impl ArchiveCompression {
    fn suffix(self) -> &'static str {
        match self {
            Self::None => ".xml",
            Self::Gzip => ".xml.gz",
            Self::Zlib => ".xml.zz",
        }
    }
}

/// Purger behavior flags (CLI surface).
#[derive(Debug, Clone)]
pub struct PurgeOpts {
    /// Purge only WUs belonging to retired batches, regardless of age.
    pub retired_wus: bool,
    /// Minimum age (seconds since creation) outside retired-batch mode.
    pub min_age_secs: i64,
    /// Cap on WUs purged in one pass; None = no cap.
    pub max: Option<usize>,
    pub compression: ArchiveCompression,
    /// Place archives in a `YYYY_MM_DD` subdirectory.
    pub daily_dir: bool,
    /// Rotate archive files after this many WUs; 0 = never.
    pub max_wu_per_file: usize,
    /// Archive but leave rows in the store (dry run of the delete side).
    pub dont_delete: bool,
    /// Delete without archiving.
    pub no_archive: bool,
    pub appid: Option<i64>,
    pub shard: Option<Shard>,
}

impl Default for PurgeOpts {
    fn default() -> Self {
        Self {
            retired_wus: false,
            min_age_secs: 0,
            max: None,
            compression: ArchiveCompression::None,
            daily_dir: false,
            max_wu_per_file: 0,
            dont_delete: false,
            no_archive: false,
            appid: None,
            shard: None,
        }
    }
}

/// Sink for one archive stream.
enum ArchiveWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zlib(ZlibEncoder<BufWriter<File>>),
}

impl ArchiveWriter {
    fn create(
        path: &PathBuf,
        compression: ArchiveCompression,
    ) -> std::result::Result<Self, PurgeError> {
        let buf = BufWriter::new(File::create(path)?);
        Ok(match compression {
            ArchiveCompression::None => Self::Plain(buf),
            ArchiveCompression::Gzip => Self::Gzip(GzEncoder::new(buf, Compression::default())),
            ArchiveCompression::Zlib => Self::Zlib(ZlibEncoder::new(buf, Compression::default())),
        })
    }

    fn write_str(&mut self, s: &str) -> std::result::Result<(), PurgeError> {
        match self {
            Self::Plain(w) => w.write_all(s.as_bytes())?,
            Self::Gzip(w) => w.write_all(s.as_bytes())?,
            Self::Zlib(w) => w.write_all(s.as_bytes())?,
        }
        Ok(())
    }

    fn finish(self) -> std::result::Result<(), PurgeError> {
        match self {
            Self::Plain(mut w) => w.flush()?,
            Self::Gzip(w) => {
                w.finish()?.flush()?;
            }
            Self::Zlib(w) => {
                w.finish()?.flush()?;
            }
        }
        Ok(())
    }
}

/// The four files of one archive generation: WU and result archives plus
/// their flat indexes.
struct ArchiveSet {
    wu_archive: ArchiveWriter,
    result_archive: ArchiveWriter,
    wu_index: BufWriter<File>,
    result_index: BufWriter<File>,
    epoch: i64,
}

impl ArchiveSet {
    fn open(
        dir: &PathBuf,
        epoch: i64,
        compression: ArchiveCompression,
    ) -> std::result::Result<Self, PurgeError> {
        std::fs::create_dir_all(dir)?;
        let suffix = compression.suffix();
        let mut wu_archive =
            ArchiveWriter::create(&dir.join(format!("wu_archive_{epoch}{suffix}")), compression)?;
        let mut result_archive = ArchiveWriter::create(
            &dir.join(format!("result_archive_{epoch}{suffix}")),
            compression,
        )?;
        wu_archive.write_str("<archive>\n")?;
        result_archive.write_str("<archive>\n")?;
        let wu_index =
            BufWriter::new(File::create(dir.join(format!("wu_index_{epoch}.xml")))?);
        let result_index =
            BufWriter::new(File::create(dir.join(format!("result_index_{epoch}.xml")))?);
        Ok(Self {
            wu_archive,
            result_archive,
            wu_index,
            result_index,
            epoch,
        })
    }

    fn archive_wu(&mut self, wu: &Workunit, now: i64) -> std::result::Result<(), PurgeError> {
        self.wu_archive.write_str(&render_workunit(wu))?;
        writeln!(self.wu_index, "{}     {}    {}", wu.id, now, wu.name)?;
        Ok(())
    }

    fn archive_result(
        &mut self,
        r: &ResultRecord,
        now: i64,
    ) -> std::result::Result<(), PurgeError> {
        self.result_archive.write_str(&render_result(r))?;
        writeln!(self.result_index, "{}     {}    {}", r.id, now, r.name)?;
        Ok(())
    }

    fn close(mut self) -> std::result::Result<(), PurgeError> {
        self.wu_archive.write_str("</archive>\n")?;
        self.result_archive.write_str("</archive>\n")?;
        self.wu_archive.finish()?;
        self.result_archive.finish()?;
        self.wu_index.flush()?;
        self.result_index.flush()?;
        Ok(())
    }
}

pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn render_workunit(wu: &Workunit) -> String {
    let mut s = String::new();
    s.push_str("<workunit_archive>\n");
    let mut tag = |name: &str, value: String| {
        s.push_str(&format!("    <{name}>{value}</{name}>\n"));
    };
    tag("id", wu.id.to_string());
    tag("create_time", wu.create_time.to_string());
    tag("name", xml_escape(&wu.name));
    tag("appid", wu.appid.to_string());
    tag("error_mask", wu.error_mask.to_string());
    tag("assimilate_state", wu.assimilate_state.code().to_string());
    tag("file_delete_state", wu.file_delete_state.code().to_string());
    tag("canonical_resultid", wu.canonical_resultid.to_string());
    tag("need_validate", (wu.need_validate as i64).to_string());
    tag("min_quorum", wu.min_quorum.to_string());
    tag("target_nresults", wu.target_nresults.to_string());
    tag("max_error_results", wu.max_error_results.to_string());
    tag("max_total_results", wu.max_total_results.to_string());
    tag("max_success_results", wu.max_success_results.to_string());
    tag("transition_time", wu.transition_time.to_string());
    tag("delay_bound", wu.delay_bound.to_string());
    tag("hr_class", wu.hr_class.to_string());
    tag("app_version_id", wu.app_version_id.to_string());
    tag("batch", wu.batch.to_string());
    tag("transitioner_flags", wu.transitioner_flags.to_string());
    tag("priority", wu.priority.to_string());
    tag("xml_doc", xml_escape(&wu.xml_doc));
    s.push_str("</workunit_archive>\n");
    s
}

fn render_result(r: &ResultRecord) -> String {
    let mut s = String::new();
    s.push_str("<result_archive>\n");
    let mut tag = |name: &str, value: String| {
        s.push_str(&format!("    <{name}>{value}</{name}>\n"));
    };
    tag("id", r.id.to_string());
    tag("create_time", r.create_time.to_string());
    tag("workunitid", r.workunitid.to_string());
    tag("name", xml_escape(&r.name));
    tag("server_state", r.server_state.code().to_string());
    tag("outcome", r.outcome.code().to_string());
    tag("validate_state", r.validate_state.code().to_string());
    tag("file_delete_state", r.file_delete_state.code().to_string());
    tag("report_deadline", r.report_deadline.to_string());
    tag("received_time", r.received_time.to_string());
    tag("sent_time", r.sent_time.to_string());
    tag("appid", r.appid.to_string());
    tag("hostid", r.hostid.to_string());
    tag("userid", r.userid.to_string());
    tag("app_version_id", r.app_version_id.to_string());
    tag("priority", r.priority.to_string());
    tag("exit_status", r.exit_status.to_string());
    tag("xml_doc_in", xml_escape(&r.xml_doc_in));
    tag("xml_doc_out", xml_escape(&r.xml_doc_out));
    tag("stderr_out", xml_escape(&r.stderr_out));
    s.push_str("</result_archive>\n");
    s
}

fn tag_text<'a>(block: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let i = block.find(&open)? + open.len();
    let j = block[i..].find(&close)? + i;
    Some(&block[i..j])
}

fn tag_i64(block: &str, name: &str) -> i64 {
    tag_text(block, name)
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0)
}

fn tag_i32(block: &str, name: &str) -> i32 {
    tag_i64(block, name) as i32
}

fn tag_string(block: &str, name: &str) -> String {
    tag_text(block, name)
        .map(xml_unescape)
        .unwrap_or_default()
}

fn blocks<'a>(xml: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(i) = rest.find(&open) {
        let after = &rest[i + open.len()..];
        let Some(j) = after.find(&close) else { break };
        out.push(&after[..j]);
        rest = &after[j + close.len()..];
    }
    out
}

/// Read back a WU archive stream (verification and disaster recovery).
pub fn parse_wu_archive(xml: &str) -> Vec<Workunit> {
    blocks(xml, "workunit_archive")
        .into_iter()
        .map(|b| Workunit {
            id: tag_i64(b, "id"),
            create_time: tag_i64(b, "create_time"),
            name: tag_string(b, "name"),
            appid: tag_i64(b, "appid"),
            error_mask: tag_i32(b, "error_mask"),
            assimilate_state: crate::model::AssimilateState::from_code(tag_i64(
                b,
                "assimilate_state",
            )),
            file_delete_state: FileDeleteState::from_code(tag_i64(b, "file_delete_state")),
            canonical_resultid: tag_i64(b, "canonical_resultid"),
            need_validate: tag_i64(b, "need_validate") != 0,
            min_quorum: tag_i32(b, "min_quorum"),
            target_nresults: tag_i32(b, "target_nresults"),
            max_error_results: tag_i32(b, "max_error_results"),
            max_total_results: tag_i32(b, "max_total_results"),
            max_success_results: tag_i32(b, "max_success_results"),
            transition_time: tag_i64(b, "transition_time"),
            delay_bound: tag_i64(b, "delay_bound"),
            hr_class: tag_i32(b, "hr_class"),
            app_version_id: tag_i64(b, "app_version_id"),
            batch: tag_i64(b, "batch"),
            transitioner_flags: tag_i32(b, "transitioner_flags"),
            priority: tag_i32(b, "priority"),
            xml_doc: tag_string(b, "xml_doc"),
        })
        .collect()
}

/// Read back a result archive stream.
pub fn parse_result_archive(xml: &str) -> Vec<ResultRecord> {
    blocks(xml, "result_archive")
        .into_iter()
        .map(|b| ResultRecord {
            id: tag_i64(b, "id"),
            create_time: tag_i64(b, "create_time"),
            workunitid: tag_i64(b, "workunitid"),
            name: tag_string(b, "name"),
            server_state: crate::model::ServerState::from_code(tag_i64(b, "server_state")),
            outcome: crate::model::Outcome::from_code(tag_i64(b, "outcome")),
            validate_state: crate::model::ValidateState::from_code(tag_i64(b, "validate_state")),
            file_delete_state: FileDeleteState::from_code(tag_i64(b, "file_delete_state")),
            report_deadline: tag_i64(b, "report_deadline"),
            received_time: tag_i64(b, "received_time"),
            sent_time: tag_i64(b, "sent_time"),
            appid: tag_i64(b, "appid"),
            hostid: tag_i64(b, "hostid"),
            userid: tag_i64(b, "userid"),
            app_version_id: tag_i64(b, "app_version_id"),
            priority: tag_i32(b, "priority"),
            exit_status: tag_i32(b, "exit_status"),
            xml_doc_in: tag_string(b, "xml_doc_in"),
            xml_doc_out: tag_string(b, "xml_doc_out"),
            stderr_out: tag_string(b, "stderr_out"),
        })
        .collect()
}

/// The DB Purge / Archiver daemon.
pub struct Purger {
    store: Arc<dyn JobStore>,
    archive_dir: PathBuf,
    opts: PurgeOpts,
    /// Last archive-file epoch issued; forced monotonic so rotation
    /// within one second never reuses a filename.
    last_epoch: i64,
}

impl Purger {
    pub fn new(store: Arc<dyn JobStore>, archive_dir: PathBuf, opts: PurgeOpts) -> Self {
        Self {
            store,
            archive_dir,
            opts,
            last_epoch: 0,
        }
    }

    fn next_epoch(&mut self, now: i64) -> i64 {
        self.last_epoch = now.max(self.last_epoch + 1);
        self.last_epoch
    }

    fn archive_target_dir(&self, now: i64) -> PathBuf {
        if self.opts.daily_dir {
            let day = Utc
                .timestamp_opt(now, 0)
                .single()
                .map(|t| t.format("%Y_%m_%d").to_string())
                .unwrap_or_else(|| "unknown_date".to_string());
            self.archive_dir.join(day)
        } else {
            self.archive_dir.clone()
        }
    }

    /// One purge pass. Returns true if any WU was purged.
    pub async fn purge_pass(&mut self, now: i64) -> Result<bool> {
        let mut filter = WuFilter {
            file_delete_state: Some(FileDeleteState::Done),
            appid: self.opts.appid,
            shard: self.opts.shard,
            ..Default::default()
        };

        if self.opts.retired_wus {
            let retired = self.store.retired_batches().await?;
            if retired.is_empty() {
                debug!("No retired batches; nothing to purge");
                return Ok(false);
            }
            filter.batch_in = Some(retired);
        } else if self.opts.min_age_secs > 0 {
            filter.max_create_time = Some(now - self.opts.min_age_secs);
        }

        let limit = self.opts.max.unwrap_or(ENUM_LIMIT).min(ENUM_LIMIT);
        let wus = self.store.enumerate_workunits(&filter, limit).await?;
        if wus.is_empty() {
            return Ok(false);
        }

        let dir = self.archive_target_dir(now);
        let mut set = if self.opts.no_archive {
            None
        } else {
            Some(ArchiveSet::open(&dir, self.next_epoch(now), self.opts.compression)?)
        };

        let mut purged = 0usize;
        let mut wu_in_file = 0usize;
        for wu in wus {
            // Rotation keeps individual archive files manageable.
            if self.opts.max_wu_per_file > 0 && wu_in_file >= self.opts.max_wu_per_file {
                if let Some(old) = set.take() {
                    debug!(epoch = old.epoch, "Rotating archive files");
                    old.close()?;
                    set = Some(ArchiveSet::open(
                        &dir,
                        self.next_epoch(now),
                        self.opts.compression,
                    )?);
                }
                wu_in_file = 0;
            }
            match self.purge_wu(&wu, set.as_mut(), now).await {
                Ok(()) => {
                    purged += 1;
                    wu_in_file += 1;
                }
                Err(e) => {
                    warn!(wu_id = wu.id, error = %e, "Purge failed for WU; skipping");
                }
            }
        }
        if let Some(set) = set {
            set.close()?;
        }

        info!(purged, "Purge pass complete");
        Ok(purged > 0)
    }

    /// Archive and delete one WU with all of its results. Archive writes
    /// come first; a failure leaves the rows in place for a later pass.
    async fn purge_wu(
        &self,
        wu: &Workunit,
        mut set: Option<&mut ArchiveSet>,
        now: i64,
    ) -> Result<()> {
        let results = self.store.results_for_wu(wu.id).await?;
        for r in &results {
            if let Some(s) = set.as_mut() {
                s.archive_result(r, now)?;
            }
            if !self.opts.dont_delete {
                self.store.delete_result(r.id).await?;
            }
        }
        if let Some(s) = set.as_mut() {
            s.archive_wu(wu, now)?;
        }
        if !self.opts.dont_delete {
            self.store.delete_workunit(wu.id).await?;
        }
        debug!(wu_id = wu.id, nresults = results.len(), "Purged WU");
        Ok(())
    }
}

#[async_trait]
impl DaemonPass for Purger {
    fn name(&self) -> &'static str {
        "db_purge"
    }

    async fn pass(&mut self) -> Result<bool> {
        self.purge_pass(unix_now()).await
    }
}
