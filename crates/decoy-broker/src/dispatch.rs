//! Analysis-lane bookkeeping for one session.
//!
//! The dispatcher is a supervised task group: intelligence extraction runs
//! under a per-session concurrency cap and is never cancelled mid-flight;
//! coaching holds a single cancellable slot where a newer transcript aborts
//! the in-flight job. It also enforces the emission-order rule: a coaching
//! envelope is held until the intelligence round for its triggering
//! transcript has completed.

use decoy_types::CoachingSuggestion;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Per-lane health. A fatal collaborator failure disables the lane for the
/// remainder of the session; audio relay is never affected.
#[derive(Debug, Clone, Copy)]
pub struct LaneHealth {
    pub stt: bool,
    pub extraction_llm: bool,
    pub coaching: bool,
}

impl Default for LaneHealth {
    fn default() -> Self {
        Self {
            stt: true,
            extraction_llm: true,
            coaching: true,
        }
    }
}

pub(crate) struct AnalysisDispatcher {
    intel_permits: Arc<Semaphore>,
    /// Transcript seqs whose intelligence round has not completed yet.
    intel_pending: HashSet<u64>,
    /// The single cancellable coaching slot.
    coaching_inflight: Option<(u64, JoinHandle<()>)>,
    /// A finished suggestion waiting for its intelligence round.
    held_suggestion: Option<(u64, CoachingSuggestion)>,
}

impl AnalysisDispatcher {
    pub fn new(intel_concurrency: usize) -> Self {
        Self {
            intel_permits: Arc::new(Semaphore::new(intel_concurrency.max(1))),
            intel_pending: HashSet::new(),
            coaching_inflight: None,
            held_suggestion: None,
        }
    }

    pub fn intel_permits(&self) -> Arc<Semaphore> {
        self.intel_permits.clone()
    }

    pub fn begin_intel(&mut self, seq: u64) {
        self.intel_pending.insert(seq);
    }

    /// Marks an intelligence round complete and releases a held coaching
    /// suggestion when its round is no longer pending.
    pub fn finish_intel(&mut self, seq: u64) -> Option<CoachingSuggestion> {
        self.intel_pending.remove(&seq);
        self.release_held()
    }

    pub fn intel_is_pending(&self, seq: u64) -> bool {
        self.intel_pending.contains(&seq)
    }

    /// Installs a new coaching job, aborting any in-flight one. A stale
    /// held suggestion is discarded along with it.
    pub fn replace_coaching(&mut self, seq: u64, handle: JoinHandle<()>) {
        if let Some((stale_seq, stale)) = self.coaching_inflight.take() {
            stale.abort();
            tracing::debug!(stale_seq, seq, "superseded in-flight coaching job");
        }
        self.held_suggestion = None;
        self.coaching_inflight = Some((seq, handle));
    }

    /// Records a finished coaching job. Returns false when the result is
    /// stale (a newer job replaced it before completion landed).
    pub fn coaching_done(&mut self, seq: u64) -> bool {
        match &self.coaching_inflight {
            Some((current, _)) if *current == seq => {
                self.coaching_inflight = None;
                true
            }
            _ => false,
        }
    }

    /// Stashes a suggestion whose intelligence round is still running.
    pub fn hold_suggestion(&mut self, seq: u64, suggestion: CoachingSuggestion) {
        self.held_suggestion = Some((seq, suggestion));
    }

    fn release_held(&mut self) -> Option<CoachingSuggestion> {
        if let Some((seq, _)) = &self.held_suggestion {
            if !self.intel_pending.contains(seq) {
                return self.held_suggestion.take().map(|(_, s)| s);
            }
        }
        None
    }

    /// Aborts everything at teardown.
    pub fn abort_all(&mut self) {
        if let Some((_, handle)) = self.coaching_inflight.take() {
            handle.abort();
        }
        self.held_suggestion = None;
        self.intel_permits.close();
    }
}
