//! Request ledger: deduplication and lifecycle tracking
//!
//! The ledger is the only writer of `RequestState`. Every state change goes
//! through `transition` (or `fail`) under one lock, so two tasks can never
//! both move the same request out of the same state.
//!
//! Lifecycle:
//!
//! ```text
//! Detected -> Scoring -> Decided -> Submitting -> Confirmed
//!     \__________\___________\__________\______-> Failed(reason)
//!
//! Failed(Unconfirmed) -> Submitting   (manual re-submission)
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::debug;

use crate::models::{
    Decision, FailureReason, LoanRequest, RequestId, RequestState, SubmissionRecord,
};

pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the caller owns processing
    New,
    /// Already tracked (or previously completed); drop it
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    UnknownRequest(RequestId),
    /// The request is not in the state the caller expected
    InvalidTransition {
        request_id: RequestId,
        expected: RequestState,
        actual: RequestState,
    },
    /// The edge is not part of the lifecycle
    IllegalTransition {
        request_id: RequestId,
        from: RequestState,
        to: RequestState,
    },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRequest(id) => write!(f, "unknown request {}", id),
            Self::InvalidTransition {
                request_id,
                expected,
                actual,
            } => write!(
                f,
                "request {} is {}, expected {}",
                request_id, actual, expected
            ),
            Self::IllegalTransition {
                request_id,
                from,
                to,
            } => write!(
                f,
                "illegal transition {} -> {} for request {}",
                from, to, request_id
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Whether `from -> to` is an edge of the lifecycle.
pub fn is_legal_edge(from: &RequestState, to: &RequestState) -> bool {
    use RequestState::*;
    match (from, to) {
        (Detected, Scoring) | (Scoring, Decided) | (Decided, Submitting) => true,
        (Submitting, Confirmed) => true,
        (Failed(FailureReason::Unconfirmed), Submitting) => true,
        (from, Failed(_)) => !from.is_terminal(),
        _ => false,
    }
}

/// Everything known about one request
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub request: LoanRequest,
    pub state: RequestState,
    pub decision: Option<Decision>,
    pub submission: Option<SubmissionRecord>,
    pub admitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerInner {
    entries: HashMap<RequestId, LedgerEntry>,
    /// Admission order, oldest first
    order: VecDeque<RequestId>,
    /// Ids whose entries were evicted. Kept so redelivery stays a duplicate.
    evicted: HashSet<RequestId>,
    /// Eviction order of `evicted`, oldest first
    evicted_order: VecDeque<RequestId>,
}

pub struct RequestLedger {
    inner: Mutex<LedgerInner>,
    capacity: usize,
    /// Evicted ids remembered as duplicates. Older ones are forgotten and
    /// rely on the contract's processed flag instead.
    tombstone_capacity: usize,
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl RequestLedger {
    /// Tombstones default to the same bound as live entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            capacity: capacity.max(1),
            tombstone_capacity: capacity,
        }
    }

    pub fn with_tombstone_capacity(mut self, tombstones: usize) -> Self {
        self.tombstone_capacity = tombstones;
        self
    }

    /// Record a sighting of `request`. Only the first sighting is `New`.
    pub fn admit(&self, request: LoanRequest) -> Admission {
        let mut inner = self.inner.lock();
        let id = request.request_id;
        if inner.entries.contains_key(&id) || inner.evicted.contains(&id) {
            return Admission::Duplicate;
        }

        let now = Utc::now();
        inner.entries.insert(
            id,
            LedgerEntry {
                request,
                state: RequestState::Detected,
                decision: None,
                submission: None,
                admitted_at: now,
                updated_at: now,
            },
        );
        inner.order.push_back(id);
        self.evict_terminal(&mut inner);
        Admission::New
    }

    /// Drop the oldest terminal entries while over capacity.
    fn evict_terminal(&self, inner: &mut LedgerInner) {
        if inner.entries.len() <= self.capacity {
            return;
        }
        let mut excess = inner.entries.len() - self.capacity;
        let mut kept = VecDeque::with_capacity(inner.order.len());
        while let Some(id) = inner.order.pop_front() {
            let terminal = inner
                .entries
                .get(&id)
                .map(|e| e.state.is_terminal())
                .unwrap_or(false);
            if excess > 0 && terminal {
                inner.entries.remove(&id);
                self.remember_evicted(inner, id);
                excess -= 1;
                debug!(request_id = %id, "evicted terminal request from ledger");
            } else {
                kept.push_back(id);
            }
        }
        inner.order = kept;
    }

    fn remember_evicted(&self, inner: &mut LedgerInner, id: RequestId) {
        if self.tombstone_capacity == 0 {
            return;
        }
        if inner.evicted.insert(id) {
            inner.evicted_order.push_back(id);
        }
        while inner.evicted_order.len() > self.tombstone_capacity {
            if let Some(oldest) = inner.evicted_order.pop_front() {
                inner.evicted.remove(&oldest);
            }
        }
    }

    /// Move `id` from `from` to `to`.
    pub fn transition(
        &self,
        id: &RequestId,
        from: &RequestState,
        to: RequestState,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(LedgerError::UnknownRequest(*id))?;

        if !is_legal_edge(from, &to) {
            return Err(LedgerError::IllegalTransition {
                request_id: *id,
                from: from.clone(),
                to,
            });
        }
        if entry.state != *from {
            return Err(LedgerError::InvalidTransition {
                request_id: *id,
                expected: from.clone(),
                actual: entry.state.clone(),
            });
        }

        entry.state = to;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Move `id` to `Failed(reason)` from whatever non-terminal state it is in.
    /// Returns the state it failed from.
    pub fn fail(&self, id: &RequestId, reason: FailureReason) -> Result<RequestState, LedgerError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(LedgerError::UnknownRequest(*id))?;

        let to = RequestState::Failed(reason);
        if entry.state.is_terminal() {
            return Err(LedgerError::IllegalTransition {
                request_id: *id,
                from: entry.state.clone(),
                to,
            });
        }

        let previous = std::mem::replace(&mut entry.state, to);
        entry.updated_at = Utc::now();
        Ok(previous)
    }

    pub fn get(&self, id: &RequestId) -> Option<RequestState> {
        self.inner.lock().entries.get(id).map(|e| e.state.clone())
    }

    pub fn snapshot(&self, id: &RequestId) -> Option<LedgerEntry> {
        self.inner.lock().entries.get(id).cloned()
    }

    pub fn attach_decision(&self, id: &RequestId, decision: Decision) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(LedgerError::UnknownRequest(*id))?;
        entry.decision = Some(decision);
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn attach_submission(
        &self,
        id: &RequestId,
        record: SubmissionRecord,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(LedgerError::UnknownRequest(*id))?;
        entry.submission = Some(record);
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Number of requests currently tracked (evicted ids excluded)
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicted ids still remembered as duplicates
    pub fn tombstones(&self) -> usize {
        self.inner.lock().evicted.len()
    }

    /// Tracked requests per state label
    pub fn state_counts(&self) -> HashMap<&'static str, usize> {
        let inner = self.inner.lock();
        let mut counts = HashMap::new();
        for entry in inner.entries.values() {
            *counts.entry(entry.state.label()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Address;
    use std::sync::Arc;

    fn request(n: u8) -> LoanRequest {
        LoanRequest {
            request_id: RequestId([n; 32]),
            borrower: Address([n; 20]),
            amount_wei: 1,
            ens_name: String::new(),
            test_balance_override: None,
        }
    }

    fn drive_to_confirmed(ledger: &RequestLedger, id: &RequestId) {
        use RequestState::*;
        ledger.transition(id, &Detected, Scoring).unwrap();
        ledger.transition(id, &Scoring, Decided).unwrap();
        ledger.transition(id, &Decided, Submitting).unwrap();
        ledger.transition(id, &Submitting, Confirmed).unwrap();
    }

    #[test]
    fn test_admit_deduplicates() {
        let ledger = RequestLedger::default();
        assert_eq!(ledger.admit(request(1)), Admission::New);
        assert_eq!(ledger.admit(request(1)), Admission::Duplicate);
        assert_eq!(ledger.admit(request(2)), Admission::New);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get(&RequestId([1; 32])), Some(RequestState::Detected));
    }

    #[test]
    fn test_full_lifecycle() {
        let ledger = RequestLedger::default();
        let id = RequestId([1; 32]);
        ledger.admit(request(1));
        drive_to_confirmed(&ledger, &id);
        assert_eq!(ledger.get(&id), Some(RequestState::Confirmed));
    }

    #[test]
    fn test_transition_from_wrong_state_is_invalid() {
        let ledger = RequestLedger::default();
        let id = RequestId([1; 32]);
        ledger.admit(request(1));

        let err = ledger
            .transition(&id, &RequestState::Scoring, RequestState::Decided)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(ledger.get(&id), Some(RequestState::Detected));
    }

    #[test]
    fn test_edge_outside_lifecycle_is_illegal() {
        let ledger = RequestLedger::default();
        let id = RequestId([1; 32]);
        ledger.admit(request(1));

        let err = ledger
            .transition(&id, &RequestState::Detected, RequestState::Confirmed)
            .unwrap_err();
        assert!(matches!(err, LedgerError::IllegalTransition { .. }));
    }

    #[test]
    fn test_unknown_request() {
        let ledger = RequestLedger::default();
        let err = ledger
            .transition(&RequestId([9; 32]), &RequestState::Detected, RequestState::Scoring)
            .unwrap_err();
        assert_eq!(err, LedgerError::UnknownRequest(RequestId([9; 32])));
    }

    #[test]
    fn test_fail_from_any_non_terminal_state() {
        let ledger = RequestLedger::default();
        let id = RequestId([1; 32]);
        ledger.admit(request(1));
        ledger
            .transition(&id, &RequestState::Detected, RequestState::Scoring)
            .unwrap();

        let previous = ledger
            .fail(&id, FailureReason::Pipeline("boom".into()))
            .unwrap();
        assert_eq!(previous, RequestState::Scoring);

        // terminal states stay put
        assert!(ledger.fail(&id, FailureReason::Reverted).is_err());
    }

    #[test]
    fn test_only_unconfirmed_failures_can_resubmit() {
        let ledger = RequestLedger::default();
        let a = RequestId([1; 32]);
        let b = RequestId([2; 32]);
        ledger.admit(request(1));
        ledger.admit(request(2));
        ledger.fail(&a, FailureReason::Unconfirmed).unwrap();
        ledger.fail(&b, FailureReason::Reverted).unwrap();

        let unconfirmed = RequestState::Failed(FailureReason::Unconfirmed);
        ledger
            .transition(&a, &unconfirmed, RequestState::Submitting)
            .unwrap();

        let reverted = RequestState::Failed(FailureReason::Reverted);
        assert!(matches!(
            ledger.transition(&b, &reverted, RequestState::Submitting),
            Err(LedgerError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_concurrent_transition_has_single_winner() {
        let ledger = Arc::new(RequestLedger::default());
        let id = RequestId([1; 32]);
        ledger.admit(request(1));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger
                        .transition(&id, &RequestState::Detected, RequestState::Scoring)
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_eviction_only_touches_terminal_entries() {
        let ledger = RequestLedger::new(2);
        ledger.admit(request(1));
        ledger.admit(request(2));
        drive_to_confirmed(&ledger, &RequestId([2; 32]));

        // over capacity: only the confirmed entry may go
        ledger.admit(request(3));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get(&RequestId([1; 32])).is_some());
        assert!(ledger.get(&RequestId([2; 32])).is_none());

        // evicted ids stay duplicates
        assert_eq!(ledger.admit(request(2)), Admission::Duplicate);

        // nothing terminal left: the ledger grows past the cap
        ledger.admit(request(4));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_tombstones_are_bounded() {
        fn numbered(n: u16) -> LoanRequest {
            let mut id = [0u8; 32];
            id[..2].copy_from_slice(&n.to_be_bytes());
            LoanRequest {
                request_id: RequestId(id),
                ..request(0)
            }
        }

        let ledger = RequestLedger::new(4).with_tombstone_capacity(8);
        for n in 0..1_000u16 {
            let req = numbered(n);
            let id = req.request_id;
            assert_eq!(ledger.admit(req), Admission::New);
            drive_to_confirmed(&ledger, &id);
        }

        assert!(ledger.len() <= 5);
        assert_eq!(ledger.tombstones(), 8);
        {
            let inner = ledger.inner.lock();
            assert_eq!(inner.evicted_order.len(), 8);
            assert!(inner.order.len() <= 5);
        }

        // recently evicted: still a duplicate
        assert_eq!(ledger.admit(numbered(994)), Admission::Duplicate);
        // aged out of the tombstones: admitted again
        assert_eq!(ledger.admit(numbered(0)), Admission::New);
    }

    #[test]
    fn test_attachments_show_in_snapshot() {
        use crate::models::{ScoreResult, ScoreSource};

        let ledger = RequestLedger::default();
        let id = RequestId([1; 32]);
        ledger.admit(request(1));
        let decision = Decision {
            score: ScoreResult {
                value: 700,
                source: ScoreSource::RuleBased,
            },
            approved: true,
            interest_rate_bps: 1000,
        };
        ledger.attach_decision(&id, decision).unwrap();

        let entry = ledger.snapshot(&id).unwrap();
        assert_eq!(entry.decision, Some(decision));
        assert!(entry.submission.is_none());
        assert_eq!(ledger.state_counts().get("detected"), Some(&1));
    }
}
