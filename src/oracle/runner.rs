//! Oracle loop
//!
//! One tick:
//! 1. poll every event source (a failing source does not affect the others)
//! 2. merge by (block, log index) and admit into the ledger
//! 3. evaluate newly admitted requests concurrently (bounded)
//! 4. submit decisions one at a time, in admission order
//!
//! Per-request errors and panics end in `Failed` for that request only.
//! Shutdown is only observed between ticks, so an admitted batch is always
//! carried to a terminal state before the loop exits.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::features::FeatureAggregator;
use super::ledger::{Admission, RequestLedger};
use super::policy::DecisionPolicy;
use super::scoring::ScoringChain;
use super::stats::OracleStats;
use super::submission::SubmissionManager;
use crate::chain::{ContractReader, EventSource};
use crate::models::{
    Decision, FailureReason, LoanRequest, ObservedEvent, RequestId, RequestState,
    SubmissionOutcome,
};

/// Everything a request needs on its way through the pipeline.
/// Built once at startup and shared by reference.
pub struct OracleContext {
    pub ledger: Arc<RequestLedger>,
    pub aggregator: FeatureAggregator,
    pub scoring: ScoringChain,
    pub policy: DecisionPolicy,
    pub submissions: SubmissionManager,
    /// Used to skip requests the contract already considers processed
    pub contract: Option<Arc<dyn ContractReader>>,
    pub stats: Arc<OracleStats>,
}

impl OracleContext {
    /// Detected -> Scoring -> Decided
    pub async fn evaluate(&self, request: &LoanRequest) -> Result<Decision> {
        let id = request.request_id;
        self.ledger
            .transition(&id, &RequestState::Detected, RequestState::Scoring)?;

        let features = self.aggregator.gather(request).await;
        let score = self.scoring.score(request, &features);
        let decision = self.policy.decide(score, &features);

        self.ledger.attach_decision(&id, decision)?;
        self.ledger
            .transition(&id, &RequestState::Scoring, RequestState::Decided)?;

        if decision.approved {
            OracleStats::incr(&self.stats.approved);
        } else {
            OracleStats::incr(&self.stats.rejected);
        }

        info!(
            request_id = %id,
            borrower = %request.borrower,
            amount = request.amount_native(),
            score = decision.score.value,
            source = %decision.score.source,
            approved = decision.approved,
            rate_bps = decision.interest_rate_bps,
            valuation = ?features.valuation_source,
            "🧮 Credit decision"
        );

        Ok(decision)
    }

    /// Whether the contract already holds a result for `id`.
    /// A failed read is logged and treated as "not processed".
    async fn already_processed(&self, id: &RequestId) -> bool {
        let Some(contract) = &self.contract else {
            return false;
        };
        match contract.loan_request(id).await {
            Ok(on_chain) => on_chain.processed,
            Err(e) => {
                warn!(request_id = %id, error = %e, "⚠️ Reconciliation read failed, submitting anyway");
                false
            }
        }
    }

    /// Decided -> Submitting -> Confirmed | Failed
    pub async fn fulfill(&self, id: &RequestId) -> Result<RequestState> {
        let decision = self
            .ledger
            .snapshot(id)
            .and_then(|entry| entry.decision)
            .ok_or_else(|| anyhow!("request {} has no decision", id))?;

        self.ledger
            .transition(id, &RequestState::Decided, RequestState::Submitting)?;

        if self.already_processed(id).await {
            return self.mark_already_processed(id);
        }

        self.submit_and_confirm(id, &decision).await
    }

    fn mark_already_processed(&self, id: &RequestId) -> Result<RequestState> {
        self.ledger
            .transition(id, &RequestState::Submitting, RequestState::Confirmed)?;
        OracleStats::incr(&self.stats.already_processed);
        info!(request_id = %id, "⏭️ Contract already processed request, nothing to send");
        Ok(RequestState::Confirmed)
    }

    /// Send the decision and wait for the receipt. Expects `Submitting`.
    pub async fn submit_and_confirm(
        &self,
        id: &RequestId,
        decision: &Decision,
    ) -> Result<RequestState> {
        let mut record = self.submissions.submit(id, decision).await;
        self.ledger.attach_submission(id, record.clone())?;

        if record.outcome == SubmissionOutcome::SubmissionError {
            let detail = record
                .last_error
                .clone()
                .unwrap_or_else(|| "no attempt reached the node".to_string());
            return self.fail(id, FailureReason::SubmissionExhausted(detail));
        }

        record.outcome = self.submissions.await_confirmation(&record).await;
        self.ledger.attach_submission(id, record.clone())?;

        match record.outcome {
            SubmissionOutcome::Confirmed => {
                self.ledger
                    .transition(id, &RequestState::Submitting, RequestState::Confirmed)?;
                OracleStats::incr(&self.stats.confirmed);
                Ok(RequestState::Confirmed)
            }
            SubmissionOutcome::Reverted => self.fail(id, FailureReason::Reverted),
            SubmissionOutcome::Pending => self.fail(id, FailureReason::Unconfirmed),
            SubmissionOutcome::SubmissionError => self.fail(
                id,
                FailureReason::SubmissionExhausted("no transaction hash".to_string()),
            ),
        }
    }

    /// Manually re-submit a request whose last transaction was never confirmed.
    pub async fn resubmit(&self, id: &RequestId) -> Result<RequestState> {
        let entry = self
            .ledger
            .snapshot(id)
            .with_context(|| format!("unknown request {}", id))?;
        let unconfirmed = RequestState::Failed(FailureReason::Unconfirmed);
        if entry.state != unconfirmed {
            bail!("request {} is {}, only unconfirmed requests can be re-submitted", id, entry.state);
        }
        let decision = entry
            .decision
            .ok_or_else(|| anyhow!("request {} has no decision", id))?;

        self.ledger
            .transition(id, &unconfirmed, RequestState::Submitting)?;
        info!(request_id = %id, "🔁 Re-submitting fulfillment");

        if self.already_processed(id).await {
            return self.mark_already_processed(id);
        }
        self.submit_and_confirm(id, &decision).await
    }

    /// Record a failure. A request that is already terminal is left alone.
    pub fn fail(&self, id: &RequestId, reason: FailureReason) -> Result<RequestState> {
        let state = RequestState::Failed(reason.clone());
        match self.ledger.fail(id, reason) {
            Ok(previous) => {
                OracleStats::incr(&self.stats.failed);
                error!(request_id = %id, from = %previous, state = %state, "❌ Request failed");
            }
            Err(e) => {
                debug!(request_id = %id, error = %e, "failure not recorded");
            }
        }
        Ok(self.ledger.get(id).unwrap_or(state))
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub poll_interval: Duration,
    /// Requests evaluated at the same time
    pub evaluation_concurrency: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            evaluation_concurrency: 4,
        }
    }
}

/// What a single tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub events: usize,
    pub admitted: usize,
    pub duplicates: usize,
    pub source_errors: usize,
    pub confirmed: usize,
    pub failed: usize,
}

pub struct OracleLoop {
    ctx: Arc<OracleContext>,
    sources: Vec<Arc<dyn EventSource>>,
    config: LoopConfig,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl OracleLoop {
    pub fn new(
        ctx: Arc<OracleContext>,
        sources: Vec<Arc<dyn EventSource>>,
        config: LoopConfig,
    ) -> Self {
        Self {
            ctx,
            sources,
            config,
        }
    }

    pub fn context(&self) -> &Arc<OracleContext> {
        &self.ctx
    }

    /// Tick until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            sources = self.sources.len(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            concurrency = self.config.evaluation_concurrency,
            "🎧 Oracle loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let before = self.ctx.stats.snapshot();
                    let summary = self.tick().await;
                    let after = self.ctx.stats.snapshot();
                    if after.has_activity_since(&before) {
                        info!(
                            admitted = summary.admitted,
                            duplicates = summary.duplicates,
                            confirmed = summary.confirmed,
                            failed = summary.failed,
                            total_admitted = after.admitted,
                            total_confirmed = after.confirmed,
                            total_failed = after.failed,
                            "📊 Tick complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("🛑 Oracle loop stopped");
        Ok(())
    }

    /// Poll, admit and process one batch.
    pub async fn tick(&self) -> TickSummary {
        OracleStats::incr(&self.ctx.stats.ticks);
        let mut summary = TickSummary::default();

        let (events, source_errors) = self.poll_sources().await;
        summary.events = events.len();
        summary.source_errors = source_errors;

        let admitted = self.admit(events, &mut summary);
        summary.admitted = admitted.len();

        for state in self.process_batch(admitted).await {
            match state {
                RequestState::Confirmed => summary.confirmed += 1,
                RequestState::Failed(_) => summary.failed += 1,
                _ => {}
            }
        }

        summary
    }

    async fn poll_sources(&self) -> (Vec<ObservedEvent>, usize) {
        let polls = self.sources.iter().map(|source| async move {
            let result = source.poll().await;
            (source.name().to_string(), result)
        });

        let mut events = Vec::new();
        let mut errors = 0;
        for (name, result) in join_all(polls).await {
            match result {
                Ok(mut batch) => events.append(&mut batch),
                Err(e) => {
                    errors += 1;
                    OracleStats::incr(&self.ctx.stats.source_errors);
                    warn!(source = %name, error = %e, "⚠️ Event source poll failed");
                }
            }
        }

        events.sort_by_key(|e| (e.block_number, e.log_index));
        (events, errors)
    }

    fn admit(&self, events: Vec<ObservedEvent>, summary: &mut TickSummary) -> Vec<LoanRequest> {
        let mut admitted = Vec::new();
        for event in events {
            OracleStats::incr(&self.ctx.stats.events_seen);
            let id = event.request.request_id;
            match self.ctx.ledger.admit(event.request.clone()) {
                Admission::New => {
                    OracleStats::incr(&self.ctx.stats.admitted);
                    info!(
                        request_id = %id,
                        stream = %event.stream,
                        block = event.block_number,
                        "🔔 Loan request detected"
                    );
                    admitted.push(event.request);
                }
                Admission::Duplicate => {
                    OracleStats::incr(&self.ctx.stats.duplicates);
                    summary.duplicates += 1;
                    debug!(request_id = %id, stream = %event.stream, "duplicate loan request dropped");
                }
            }
        }
        admitted
    }

    /// Evaluate concurrently, then submit sequentially in admission order.
    /// Returns the state each request ended in.
    pub async fn process_batch(&self, requests: Vec<LoanRequest>) -> Vec<RequestState> {
        let permits = Arc::new(Semaphore::new(self.config.evaluation_concurrency.max(1)));

        let evaluations: Vec<_> = requests
            .iter()
            .map(|request| {
                let ctx = self.ctx.clone();
                let permits = permits.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| anyhow!("evaluation semaphore closed: {}", e))?;
                    ctx.evaluate(&request).await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(requests.len());
        for (request, evaluation) in requests.iter().zip(evaluations) {
            let id = request.request_id;
            let state = match evaluation.await {
                Ok(Ok(_decision)) => self.submit_stage(&id).await,
                Ok(Err(e)) => self.fail_logged(&id, FailureReason::Pipeline(format!("{:#}", e))),
                Err(join_err) => {
                    let detail = if join_err.is_panic() {
                        format!("panic: {}", panic_message(join_err.into_panic().as_ref()))
                    } else {
                        join_err.to_string()
                    };
                    self.fail_logged(&id, FailureReason::Pipeline(detail))
                }
            };
            outcomes.push(state);
        }
        outcomes
    }

    async fn submit_stage(&self, id: &RequestId) -> RequestState {
        match AssertUnwindSafe(self.ctx.fulfill(id)).catch_unwind().await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => self.fail_logged(id, FailureReason::Pipeline(format!("{:#}", e))),
            Err(payload) => self.fail_logged(
                id,
                FailureReason::Pipeline(format!("panic: {}", panic_message(payload.as_ref()))),
            ),
        }
    }

    fn fail_logged(&self, id: &RequestId, reason: FailureReason) -> RequestState {
        match self.ctx.fail(id, reason.clone()) {
            Ok(state) => state,
            Err(_) => RequestState::Failed(reason),
        }
    }
}
