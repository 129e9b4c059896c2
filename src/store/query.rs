//! Typed query construction for the job store.
//!
//! Daemons never build WHERE clauses by hand; they fill in a filter
//! struct and the backend renders it. This keeps predicate construction
//! in one place instead of scattered format strings.

use crate::model::{AssimilateState, FileDeleteState, ServerState};

/// Horizontal shard selector: `id mod n == r`. Lets multiple instances
/// of the same daemon divide the id space between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub n: u32,
    pub r: u32,
}

impl Shard {
    pub fn matches(&self, id: i64) -> bool {
        self.n > 0 && (id.rem_euclid(self.n as i64)) as u32 == self.r
    }
}

/// Filter over workunit rows.
#[derive(Debug, Clone, Default)]
pub struct WuFilter {
    pub assimilate_state: Option<AssimilateState>,
    pub file_delete_state: Option<FileDeleteState>,
    pub appid: Option<i64>,
    pub shard: Option<Shard>,
    /// Only WUs created at or before this epoch time (min-age gating).
    pub max_create_time: Option<i64>,
    /// Only WUs whose `batch` is in this set. An empty set matches nothing.
    pub batch_in: Option<Vec<i64>>,
    /// SQL LIKE pattern applied to `xml_doc`.
    pub xml_doc_like: Option<String>,
    /// Only WUs with `transition_time <= this`.
    pub transition_due_by: Option<i64>,
}

/// Filter over result rows.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    /// Match any of these deletion states (READY alone, or READY + ERROR
    /// during a retry window).
    pub file_delete_states: Vec<FileDeleteState>,
    pub server_state: Option<ServerState>,
    pub appid: Option<i64>,
    pub userid: Option<i64>,
    pub shard: Option<Shard>,
    /// SQL LIKE pattern applied to `xml_doc_in`.
    pub xml_doc_like: Option<String>,
}

/// Evaluate a SQL LIKE pattern (`%` and `_` wildcards) against `text`.
/// Used by the in-memory backend so both backends agree on semantics.
pub fn like_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'%') => {
                // '%' matches any run, including empty.
                (0..=t.len()).any(|i| inner(&p[1..], &t[i..]))
            }
            Some(b'_') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(c) => t.first().is_some_and(|tc| {
                tc.eq_ignore_ascii_case(c) && inner(&p[1..], &t[1..])
            }),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
