//! Loan request event polling
//!
//! Each stream keeps its own block cursor. A poll re-reads a few blocks behind
//! the cursor so that logs from a shallow reorg are seen again; the ledger
//! drops the duplicates. The cursor only moves once a whole range was read.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::abi::{self, RawLog};
use super::RpcClient;
use crate::models::{Address, EventStream, ObservedEvent};

/// A source of loan request events
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    /// Events observed since the previous poll, in chain order.
    async fn poll(&self) -> Result<Vec<ObservedEvent>>;
}

#[derive(Debug, Clone)]
pub struct EventSourceConfig {
    /// First block to scan. `None` starts at the chain head.
    pub start_block: Option<u64>,
    /// Blocks re-read behind the cursor on every poll
    pub overlap_blocks: u64,
    /// Largest range requested in a single `eth_getLogs`
    pub max_block_range: u64,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            start_block: None,
            overlap_blocks: 5,
            max_block_range: 2_000,
        }
    }
}

/// Polls one event stream of the lending contract via `eth_getLogs`.
pub struct ContractEventSource {
    name: String,
    rpc: Arc<RpcClient>,
    contract: Address,
    stream: EventStream,
    topic: [u8; 32],
    config: EventSourceConfig,
    /// Next block that has never been scanned
    cursor: Mutex<Option<u64>>,
}

impl ContractEventSource {
    pub fn new(
        rpc: Arc<RpcClient>,
        contract: Address,
        stream: EventStream,
        config: EventSourceConfig,
    ) -> Self {
        Self {
            name: format!("{}-loan-events", stream),
            rpc,
            contract,
            stream,
            topic: abi::stream_topic(stream),
            config,
            cursor: Mutex::new(None),
        }
    }

    fn decode_logs(&self, logs: Vec<serde_json::Value>, out: &mut Vec<ObservedEvent>) {
        for value in logs {
            let log = match RawLog::from_json(&value) {
                Ok(log) => log,
                Err(e) => {
                    warn!(source = %self.name, error = %e, "⚠️ Skipping unparseable log");
                    continue;
                }
            };
            if log.removed {
                continue;
            }
            match abi::decode_loan_event(&log, self.stream) {
                Ok(event) => out.push(event),
                Err(e) => warn!(
                    source = %self.name,
                    block = log.block_number,
                    log_index = log.log_index,
                    error = %e,
                    "⚠️ Skipping malformed loan event"
                ),
            }
        }
    }
}

/// Inclusive `(from, to)` chunks covering `from..=to`.
pub(crate) fn block_ranges(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let step = max_range.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(step - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

#[async_trait]
impl EventSource for ContractEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<Vec<ObservedEvent>> {
        let mut cursor = self.cursor.lock().await;
        let latest = self.rpc.block_number().await?;

        let from = match *cursor {
            Some(next) => next.saturating_sub(self.config.overlap_blocks),
            None => self.config.start_block.unwrap_or(latest),
        };
        if from > latest {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        for (start, end) in block_ranges(from, latest, self.config.max_block_range) {
            let logs = self
                .rpc
                .get_logs(&self.contract, &self.topic, start, end)
                .await?;
            self.decode_logs(logs, &mut events);
        }

        events.sort_by_key(|e| (e.block_number, e.log_index));
        *cursor = Some(latest + 1);

        debug!(
            source = %self.name,
            from,
            to = latest,
            found = events.len(),
            "polled loan events"
        );

        Ok(events)
    }
}
