//! Workunit / result data model.
//!
//! These are the rows the pipeline daemons advance through the shared job
//! store. State enums carry stable integer codes so every backend stores
//! the same values; `from_code` is total (unknown codes collapse to the
//! initial state) because rows written by older daemons must never wedge
//! a pass.

use serde::{Deserialize, Serialize};

/// Sentinel `transition_time`: the WU is finished and never re-examined.
pub const TRANSITION_TIME_NEVER: i64 = i64::MAX;

// WU error_mask bits.
pub const WU_ERROR_COULDNT_SEND_RESULT: i32 = 1;
pub const WU_ERROR_TOO_MANY_ERROR_RESULTS: i32 = 2;
pub const WU_ERROR_TOO_MANY_TOTAL_RESULTS: i32 = 4;
pub const WU_ERROR_TOO_MANY_SUCCESS_RESULTS: i32 = 8;
pub const WU_ERROR_CANCELLED: i32 = 16;
pub const WU_ERROR_NO_CANONICAL_RESULT: i32 = 32;

// transitioner_flags bits.
/// Set when a WU has been externally restricted to specific hosts;
/// suppresses replenishment of new results.
pub const TRANSITIONER_FLAG_NO_NEW_RESULTS: i32 = 1;

/// Assimilation progress of a workunit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssimilateState {
    Init,
    Ready,
    Done,
}

impl AssimilateState {
    pub fn code(self) -> i64 {
        match self {
            Self::Init => 0,
            Self::Ready => 1,
            Self::Done => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Ready,
            2 => Self::Done,
            _ => Self::Init,
        }
    }
}

/// File-deletion progress of a workunit's inputs or a result's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDeleteState {
    Init,
    Ready,
    Done,
    Error,
}

impl FileDeleteState {
    pub fn code(self) -> i64 {
        match self {
            Self::Init => 0,
            Self::Ready => 1,
            Self::Done => 2,
            Self::Error => 3,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Ready,
            2 => Self::Done,
            3 => Self::Error,
            _ => Self::Init,
        }
    }
}

/// Server-side dispatch state of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Created but withheld from dispatch.
    Inactive,
    /// Eligible to be sent to a host.
    Unsent,
    /// Sent to a host; a report is outstanding.
    InProgress,
    /// Terminal: reported, timed out, or written off.
    Over,
}

impl ServerState {
    pub fn code(self) -> i64 {
        match self {
            Self::Inactive => 1,
            Self::Unsent => 2,
            Self::InProgress => 4,
            Self::Over => 5,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Inactive,
            4 => Self::InProgress,
            5 => Self::Over,
            _ => Self::Unsent,
        }
    }
}

/// How a result ended up, once `server_state` is `Over`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Init,
    Success,
    CouldntSend,
    ClientError,
    NoReply,
    /// Written off unsent because the WU already errored or completed.
    DidntNeed,
    ValidateError,
    ClientDetached,
}

impl Outcome {
    pub fn code(self) -> i64 {
        match self {
            Self::Init => 0,
            Self::Success => 1,
            Self::CouldntSend => 2,
            Self::ClientError => 3,
            Self::NoReply => 4,
            Self::DidntNeed => 5,
            Self::ValidateError => 6,
            Self::ClientDetached => 7,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Success,
            2 => Self::CouldntSend,
            3 => Self::ClientError,
            4 => Self::NoReply,
            5 => Self::DidntNeed,
            6 => Self::ValidateError,
            7 => Self::ClientDetached,
            _ => Self::Init,
        }
    }
}

/// Validator decision on a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidateState {
    Init,
    Valid,
    Invalid,
    /// The WU errored before validation; never checked.
    NoCheck,
    Inconclusive,
    /// Arrived after the canonical result was already chosen and purged.
    TooLate,
}

impl ValidateState {
    pub fn code(self) -> i64 {
        match self {
            Self::Init => 0,
            Self::Valid => 1,
            Self::Invalid => 2,
            Self::NoCheck => 3,
            Self::Inconclusive => 4,
            Self::TooLate => 5,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Valid,
            2 => Self::Invalid,
            3 => Self::NoCheck,
            4 => Self::Inconclusive,
            5 => Self::TooLate,
            _ => Self::Init,
        }
    }
}

/// A unit of work, computed redundantly by one or more hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workunit {
    pub id: i64,
    pub create_time: i64,
    pub name: String,
    pub appid: i64,
    /// Bitmask of `WU_ERROR_*` conditions.
    pub error_mask: i32,
    pub assimilate_state: AssimilateState,
    pub file_delete_state: FileDeleteState,
    /// Id of the validator-chosen trusted result; 0 until chosen.
    /// Set at most once and never cleared.
    pub canonical_resultid: i64,
    /// Raised when enough new successes exist for the validator to run.
    pub need_validate: bool,
    pub min_quorum: i32,
    pub target_nresults: i32,
    pub max_error_results: i32,
    pub max_total_results: i32,
    pub max_success_results: i32,
    /// Earliest epoch time the Transition Engine should re-examine this WU.
    pub transition_time: i64,
    /// Per-result deadline offset, seconds.
    pub delay_bound: i64,
    /// Homogeneous-redundancy class; 0 = unrestricted.
    pub hr_class: i32,
    /// Pinned app version for HR; 0 = unpinned.
    pub app_version_id: i64,
    /// Batch this WU belongs to; 0 = none.
    pub batch: i64,
    /// Bitmask of `TRANSITIONER_FLAG_*`.
    pub transitioner_flags: i32,
    pub priority: i32,
    /// Input-file manifest (`<file_info>` fragments).
    pub xml_doc: String,
}

impl Workunit {
    /// A fresh WU with sane redundancy defaults, due for transition now.
    pub fn new(name: impl Into<String>, appid: i64, now: i64) -> Self {
        Self {
            id: 0,
            create_time: now,
            name: name.into(),
            appid,
            error_mask: 0,
            assimilate_state: AssimilateState::Init,
            file_delete_state: FileDeleteState::Init,
            canonical_resultid: 0,
            need_validate: false,
            min_quorum: 2,
            target_nresults: 2,
            max_error_results: 3,
            max_total_results: 10,
            max_success_results: 6,
            transition_time: now,
            delay_bound: 7 * 86_400,
            hr_class: 0,
            app_version_id: 0,
            batch: 0,
            transitioner_flags: 0,
            priority: 0,
            xml_doc: String::new(),
        }
    }
}

/// One host's attempt at computing a workunit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: i64,
    pub create_time: i64,
    pub workunitid: i64,
    pub name: String,
    pub server_state: ServerState,
    pub outcome: Outcome,
    pub validate_state: ValidateState,
    pub file_delete_state: FileDeleteState,
    /// Epoch deadline for the host's report; 0 until sent.
    pub report_deadline: i64,
    /// Epoch time the report arrived; 0 if none.
    pub received_time: i64,
    pub sent_time: i64,
    pub appid: i64,
    pub hostid: i64,
    pub userid: i64,
    pub app_version_id: i64,
    pub priority: i32,
    pub exit_status: i32,
    /// Dispatch descriptor, including the output-file manifest.
    pub xml_doc_in: String,
    pub xml_doc_out: String,
    pub stderr_out: String,
}

impl ResultRecord {
    /// A fresh unsent instance of `wu`, named `<wu.name>_<suffix>`.
    pub fn new_for_wu(wu: &Workunit, suffix: i64, now: i64) -> Self {
        Self {
            id: 0,
            create_time: now,
            workunitid: wu.id,
            name: format!("{}_{}", wu.name, suffix),
            server_state: ServerState::Unsent,
            outcome: Outcome::Init,
            validate_state: ValidateState::Init,
            file_delete_state: FileDeleteState::Init,
            report_deadline: 0,
            received_time: 0,
            sent_time: 0,
            appid: wu.appid,
            hostid: 0,
            userid: 0,
            app_version_id: 0,
            priority: wu.priority,
            exit_status: 0,
            xml_doc_in: String::new(),
            xml_doc_out: String::new(),
            stderr_out: String::new(),
        }
    }

    /// The numeric suffix of this result's name, if it has one.
    /// `"wu_abc_17"` yields 17; names without a trailing number yield None.
    pub fn name_suffix(&self) -> Option<i64> {
        self.name.rsplit_once('_').and_then(|(_, s)| s.parse().ok())
    }
}

/// Administrative grouping of WUs sharing a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub state: BatchState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Init,
    InProgress,
    Complete,
    Aborted,
    Retired,
}

impl BatchState {
    pub fn code(self) -> i64 {
        match self {
            Self::Init => 0,
            Self::InProgress => 1,
            Self::Complete => 2,
            Self::Aborted => 3,
            Self::Retired => 4,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::InProgress,
            2 => Self::Complete,
            3 => Self::Aborted,
            4 => Self::Retired,
            _ => Self::Init,
        }
    }
}

/// A registered application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: i64,
    pub name: String,
}

/// Per (host, app version) reliability statistics. Timeouts decay
/// `max_jobs_per_day` so overloaded or flaky hosts receive less work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAppVersion {
    pub host_id: i64,
    pub app_version_id: i64,
    pub max_jobs_per_day: i32,
    pub consecutive_valid: i32,
}

impl HostAppVersion {
    pub fn new(host_id: i64, app_version_id: i64) -> Self {
        Self {
            host_id,
            app_version_id,
            max_jobs_per_day: 100,
            consecutive_valid: 0,
        }
    }

    /// Apply the timeout penalty: one fewer job per day, floor of 1,
    /// and the valid streak resets.
    pub fn penalize_timeout(&mut self) {
        self.max_jobs_per_day = (self.max_jobs_per_day - 1).max(1);
        self.consecutive_valid = 0;
    }
}

/// A workunit joined with all of its results, as the transitioner and
/// assimilator consume them.
#[derive(Debug, Clone)]
pub struct WorkunitWithResults {
    pub wu: Workunit,
    pub results: Vec<ResultRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for s in [
            AssimilateState::Init,
            AssimilateState::Ready,
            AssimilateState::Done,
        ] {
            assert_eq!(AssimilateState::from_code(s.code()), s);
        }
        for s in [
            FileDeleteState::Init,
            FileDeleteState::Ready,
            FileDeleteState::Done,
            FileDeleteState::Error,
        ] {
            assert_eq!(FileDeleteState::from_code(s.code()), s);
        }
        for s in [
            ServerState::Inactive,
            ServerState::Unsent,
            ServerState::InProgress,
            ServerState::Over,
        ] {
            assert_eq!(ServerState::from_code(s.code()), s);
        }
        for o in [
            Outcome::Init,
            Outcome::Success,
            Outcome::CouldntSend,
            Outcome::ClientError,
            Outcome::NoReply,
            Outcome::DidntNeed,
            Outcome::ValidateError,
            Outcome::ClientDetached,
        ] {
            assert_eq!(Outcome::from_code(o.code()), o);
        }
        for v in [
            ValidateState::Init,
            ValidateState::Valid,
            ValidateState::Invalid,
            ValidateState::NoCheck,
            ValidateState::Inconclusive,
            ValidateState::TooLate,
        ] {
            assert_eq!(ValidateState::from_code(v.code()), v);
        }
    }

    #[test]
    fn unknown_codes_collapse_to_initial() {
        assert_eq!(AssimilateState::from_code(99), AssimilateState::Init);
        assert_eq!(Outcome::from_code(-1), Outcome::Init);
        assert_eq!(ServerState::from_code(0), ServerState::Unsent);
    }

    #[test]
    fn result_name_suffix() {
        let wu = Workunit::new("batch7_wu", 1, 1000);
        let r = ResultRecord::new_for_wu(&wu, 3, 1000);
        assert_eq!(r.name, "batch7_wu_3");
        assert_eq!(r.name_suffix(), Some(3));

        let mut odd = r.clone();
        odd.name = "plainname".into();
        assert_eq!(odd.name_suffix(), None);
    }

    #[test]
    fn timeout_penalty_floors_at_one() {
        let mut hav = HostAppVersion::new(1, 2);
        hav.max_jobs_per_day = 2;
        hav.consecutive_valid = 5;
        hav.penalize_timeout();
        assert_eq!(hav.max_jobs_per_day, 1);
        assert_eq!(hav.consecutive_valid, 0);
        hav.penalize_timeout();
        assert_eq!(hav.max_jobs_per_day, 1);
    }
}
