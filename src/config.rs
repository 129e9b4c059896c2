//! Project configuration.
//!
//! Built once in `main` and passed by reference into every component;
//! there is no process-global config singleton.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Project-wide settings shared by all pipeline daemons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project root directory (trigger files live here).
    pub project_dir: PathBuf,
    /// Root of the fanned-out upload/download file tree.
    pub upload_dir: PathBuf,
    /// Directory where purge archives are written.
    pub archive_dir: PathBuf,
    /// Number of hashed subdirectories under `upload_dir`.
    pub uldl_dir_fanout: u32,
    /// Seconds to wait past the last result's `received_time` before
    /// marking a WU's files deletable (upload-retry grace window).
    pub delete_delay_secs: i64,
    /// Whether `.md5` sidecar files are maintained next to uploads.
    pub cache_md5_info: bool,
    /// UID expected to own upload files; the antique deleter skips files
    /// owned by anyone else when this is set.
    pub httpd_uid: Option<u32>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            upload_dir: PathBuf::from("./upload"),
            archive_dir: PathBuf::from("./archives"),
            uldl_dir_fanout: 1024,
            delete_delay_secs: 6 * 3600,
            cache_md5_info: false,
            httpd_uid: None,
        }
    }
}

impl ProjectConfig {
    /// Load configuration from a JSON file. Absent keys take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
            key: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Build configuration from `WUFLOW_*` environment variables,
    /// falling back to defaults for anything unset. If `WUFLOW_CONFIG`
    /// names a JSON file it is loaded first and the other variables
    /// override it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let (mut cfg, from_file) = match std::env::var("WUFLOW_CONFIG") {
            Ok(path) => (Self::from_file(Path::new(&path))?, true),
            Err(_) => (Self::default(), false),
        };

        if let Ok(dir) = std::env::var("WUFLOW_PROJECT_DIR") {
            cfg.project_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("WUFLOW_UPLOAD_DIR") {
            cfg.upload_dir = PathBuf::from(dir);
        } else if !from_file {
            cfg.upload_dir = cfg.project_dir.join("upload");
        }
        if let Ok(dir) = std::env::var("WUFLOW_ARCHIVE_DIR") {
            cfg.archive_dir = PathBuf::from(dir);
        } else if !from_file {
            cfg.archive_dir = cfg.project_dir.join("archives");
        }
        if let Ok(v) = std::env::var("WUFLOW_ULDL_DIR_FANOUT") {
            cfg.uldl_dir_fanout = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "WUFLOW_ULDL_DIR_FANOUT".into(),
                message: format!("expected a positive integer, got {v:?}"),
            })?;
            if cfg.uldl_dir_fanout == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "WUFLOW_ULDL_DIR_FANOUT".into(),
                    message: "fanout must be nonzero".into(),
                });
            }
        }
        if let Ok(v) = std::env::var("WUFLOW_DELETE_DELAY_SECS") {
            cfg.delete_delay_secs = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "WUFLOW_DELETE_DELAY_SECS".into(),
                message: format!("expected seconds as an integer, got {v:?}"),
            })?;
        }
        if let Ok(v) = std::env::var("WUFLOW_CACHE_MD5_INFO") {
            cfg.cache_md5_info = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("WUFLOW_HTTPD_UID") {
            cfg.httpd_uid = Some(v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "WUFLOW_HTTPD_UID".into(),
                message: format!("expected a numeric UID, got {v:?}"),
            })?);
        }

        Ok(cfg)
    }

    /// Path of the graceful-shutdown trigger file.
    pub fn stop_trigger(&self) -> PathBuf {
        self.project_dir.join("stop_daemons")
    }

    /// Path of the feeder's live-rescan trigger file.
    pub fn reread_trigger(&self) -> PathBuf {
        self.project_dir.join("reread_db")
    }
}
