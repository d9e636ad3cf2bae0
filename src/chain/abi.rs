//! Lending contract ABI codec
//!
//! The oracle touches exactly four contract members:
//!
//! ```text
//! event LoanRequested(bytes32 indexed requestId, address indexed borrower, uint256 amount, string ensName)
//! event DebugLoanRequested(bytes32 indexed requestId, address indexed borrower, uint256 amount, string ensName, uint256 testBalanceEth)
//! function fulfillLoanRequest(bytes32 requestId, uint256 creditScore, uint256 interestRateBPS, bool approved)
//! function getLoanRequest(bytes32 requestId) view returns (address, uint256, string, bool, uint256, bool)
//! ```
//!
//! Encoding is done by hand over 32-byte words. `uint256` values are carried
//! as `u128`; anything wider is rejected as a decode error.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use sha3::{Digest, Keccak256};

use crate::models::{Address, Decision, EventStream, LoanRequest, ObservedEvent, RequestId};

pub const LOAN_REQUESTED_SIGNATURE: &str = "LoanRequested(bytes32,address,uint256,string)";
pub const DEBUG_LOAN_REQUESTED_SIGNATURE: &str =
    "DebugLoanRequested(bytes32,address,uint256,string,uint256)";
pub const FULFILL_SIGNATURE: &str = "fulfillLoanRequest(bytes32,uint256,uint256,bool)";
pub const GET_LOAN_REQUEST_SIGNATURE: &str = "getLoanRequest(bytes32)";

const WORD: usize = 32;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// topic0 of an event
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

pub fn stream_topic(stream: EventStream) -> [u8; 32] {
    match stream {
        EventStream::Standard => event_topic(LOAN_REQUESTED_SIGNATURE),
        EventStream::Debug => event_topic(DEBUG_LOAN_REQUESTED_SIGNATURE),
    }
}

fn word_from_u128(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn word_at(data: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * WORD;
    data.get(start..start + WORD)
        .ok_or_else(|| anyhow!("abi data too short: need word {} of {} bytes", index, data.len()))
}

fn word_to_u128(word: &[u8]) -> Result<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        bail!("uint256 value exceeds 128 bits");
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
}

fn word_to_usize(word: &[u8]) -> Result<usize> {
    let value = word_to_u128(word)?;
    usize::try_from(value).map_err(|_| anyhow!("abi offset {} out of range", value))
}

fn word_to_address(word: &[u8]) -> Address {
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&word[12..]);
    Address(addr)
}

fn word_to_bool(word: &[u8]) -> Result<bool> {
    match word_to_u128(word)? {
        0 => Ok(false),
        1 => Ok(true),
        other => bail!("invalid bool word: {}", other),
    }
}

/// Read a dynamic `string` whose head offset is stored in word `head_index`.
fn read_string(data: &[u8], head_index: usize) -> Result<String> {
    let offset = word_to_usize(word_at(data, head_index)?)?;
    let Some(start) = offset.checked_add(WORD) else {
        bail!("string offset {} out of bounds", offset);
    };
    let len_word = data
        .get(offset..start)
        .ok_or_else(|| anyhow!("string offset {} out of bounds", offset))?;
    let len = word_to_usize(len_word)?;
    let Some(end) = start.checked_add(len) else {
        bail!("string length {} out of bounds", len);
    };
    let bytes = data
        .get(start..end)
        .ok_or_else(|| anyhow!("string length {} out of bounds", len))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Calldata for `fulfillLoanRequest(requestId, score, interestRateBps, approved)`
pub fn encode_fulfill(request_id: &RequestId, decision: &Decision) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 4 * WORD);
    data.extend_from_slice(&selector(FULFILL_SIGNATURE));
    data.extend_from_slice(request_id.as_bytes());
    data.extend_from_slice(&word_from_u128(decision.score.value as u128));
    data.extend_from_slice(&word_from_u128(decision.interest_rate_bps as u128));
    data.extend_from_slice(&word_from_u128(decision.approved as u128));
    data
}

/// Calldata for `getLoanRequest(requestId)`
pub fn encode_get_loan_request(request_id: &RequestId) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&selector(GET_LOAN_REQUEST_SIGNATURE));
    data.extend_from_slice(request_id.as_bytes());
    data
}

/// Contract-side view of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnChainLoanRequest {
    pub borrower: Address,
    pub amount_wei: u128,
    pub ens_name: String,
    pub processed: bool,
    pub credit_score: u128,
    pub approved: bool,
}

/// Decode the return data of `getLoanRequest`
pub fn decode_loan_request(data: &[u8]) -> Result<OnChainLoanRequest> {
    Ok(OnChainLoanRequest {
        borrower: word_to_address(word_at(data, 0)?),
        amount_wei: word_to_u128(word_at(data, 1)?)?,
        ens_name: read_string(data, 2)?,
        processed: word_to_bool(word_at(data, 3)?)?,
        credit_score: word_to_u128(word_at(data, 4)?)?,
        approved: word_to_bool(word_at(data, 5)?)?,
    })
}

/// A log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub log_index: u64,
    /// Set by the node when the log was dropped by a reorg
    pub removed: bool,
}

fn hex_field<'a>(log: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    log.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("log is missing '{}'", field))
}

fn hex_quantity(value: &str) -> Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid hex quantity '{}'", value))
}

impl RawLog {
    pub fn from_json(log: &serde_json::Value) -> Result<Self> {
        let topics = log
            .get("topics")
            .and_then(|t| t.as_array())
            .ok_or_else(|| anyhow!("log is missing 'topics'"))?
            .iter()
            .map(|t| {
                let s = t.as_str().ok_or_else(|| anyhow!("topic is not a string"))?;
                let bytes = hex::decode(s.trim_start_matches("0x")).context("invalid topic hex")?;
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map_err(|_| anyhow!("topic must be 32 bytes, got {}", bytes.len()))
            })
            .collect::<Result<Vec<_>>>()?;

        let data = hex::decode(hex_field(log, "data")?.trim_start_matches("0x"))
            .context("invalid log data hex")?;

        Ok(Self {
            topics,
            data,
            block_number: hex_quantity(hex_field(log, "blockNumber")?)?,
            log_index: hex_quantity(hex_field(log, "logIndex")?)?,
            removed: log.get("removed").and_then(|r| r.as_bool()).unwrap_or(false),
        })
    }
}

/// Decode a `LoanRequested` / `DebugLoanRequested` log.
///
/// The balance override is only ever read from the debug stream.
pub fn decode_loan_event(log: &RawLog, stream: EventStream) -> Result<ObservedEvent> {
    let expected = stream_topic(stream);
    match log.topics.first() {
        Some(topic) if *topic == expected => {}
        Some(_) => bail!("log topic does not match the {} loan event", stream),
        None => bail!("log has no topics"),
    }
    if log.topics.len() < 3 {
        bail!("loan event needs 3 topics, got {}", log.topics.len());
    }

    let request_id = RequestId(log.topics[1]);
    let borrower = word_to_address(&log.topics[2]);
    let amount_wei = word_to_u128(word_at(&log.data, 0)?)?;
    let ens_name = read_string(&log.data, 1)?;
    let test_balance_override = match stream {
        EventStream::Standard => None,
        EventStream::Debug => Some(word_to_u128(word_at(&log.data, 2)?)?),
    };

    Ok(ObservedEvent {
        request: LoanRequest {
            request_id,
            borrower,
            amount_wei,
            ens_name,
            test_balance_override,
        },
        stream,
        block_number: log.block_number,
        log_index: log.log_index,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ScoreResult, ScoreSource};

    /// ABI-encode the non-indexed part of a loan event.
    pub(crate) fn encode_event_data(amount: u128, name: &str, test_balance: Option<u128>) -> Vec<u8> {
        let head_words = if test_balance.is_some() { 3 } else { 2 };
        let mut data = Vec::new();
        data.extend_from_slice(&word_from_u128(amount));
        data.extend_from_slice(&word_from_u128((head_words * WORD) as u128));
        if let Some(balance) = test_balance {
            data.extend_from_slice(&word_from_u128(balance));
        }
        data.extend_from_slice(&word_from_u128(name.len() as u128));
        let mut tail = name.as_bytes().to_vec();
        tail.resize(name.len().div_ceil(WORD) * WORD, 0);
        data.extend_from_slice(&tail);
        data
    }

    fn padded_address(addr: &Address) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(addr.as_bytes());
        word
    }

    #[test]
    fn test_keccak_selector_matches_known_value() {
        // transfer(address,uint256) is the canonical 0xa9059cbb
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_encode_fulfill_layout() {
        let id = RequestId([7u8; 32]);
        let decision = Decision {
            score: ScoreResult {
                value: 730,
                source: ScoreSource::RuleBased,
            },
            approved: true,
            interest_rate_bps: 1100,
        };
        let data = encode_fulfill(&id, &decision);

        assert_eq!(data.len(), 4 + 4 * 32);
        assert_eq!(&data[..4], &selector(FULFILL_SIGNATURE));
        assert_eq!(&data[4..36], id.as_bytes());
        assert_eq!(word_to_u128(&data[36..68]).unwrap(), 730);
        assert_eq!(word_to_u128(&data[68..100]).unwrap(), 1100);
        assert_eq!(word_to_u128(&data[100..132]).unwrap(), 1);
    }

    #[test]
    fn test_decode_standard_event() {
        let borrower = Address([0x11; 20]);
        let log = RawLog {
            topics: vec![
                stream_topic(EventStream::Standard),
                [0x42; 32],
                padded_address(&borrower),
            ],
            data: encode_event_data(1_000_000_000_000_000_000, "alice.eth", None),
            block_number: 12,
            log_index: 3,
            removed: false,
        };

        let event = decode_loan_event(&log, EventStream::Standard).unwrap();
        assert_eq!(event.request.request_id, RequestId([0x42; 32]));
        assert_eq!(event.request.borrower, borrower);
        assert_eq!(event.request.amount_wei, 1_000_000_000_000_000_000);
        assert_eq!(event.request.ens_name, "alice.eth");
        assert_eq!(event.request.test_balance_override, None);
        assert_eq!((event.block_number, event.log_index), (12, 3));
    }

    #[test]
    fn test_decode_debug_event_carries_override() {
        let borrower = Address([0x22; 20]);
        let log = RawLog {
            topics: vec![
                stream_topic(EventStream::Debug),
                [0x01; 32],
                padded_address(&borrower),
            ],
            data: encode_event_data(5, "", Some(2_000_000_000_000_000_000)),
            block_number: 1,
            log_index: 0,
            removed: false,
        };

        let event = decode_loan_event(&log, EventStream::Debug).unwrap();
        assert_eq!(event.request.ens_name, "");
        assert_eq!(
            event.request.test_balance_override,
            Some(2_000_000_000_000_000_000)
        );
    }

    #[test]
    fn test_decode_rejects_mismatched_topic() {
        let log = RawLog {
            topics: vec![stream_topic(EventStream::Debug), [0; 32], [0; 32]],
            data: encode_event_data(1, "x", Some(1)),
            block_number: 1,
            log_index: 0,
            removed: false,
        };
        assert!(decode_loan_event(&log, EventStream::Standard).is_err());
    }

    #[test]
    fn test_raw_log_from_json() {
        let data = encode_event_data(9, "bob", None);
        let json = serde_json::json!({
            "topics": [
                format!("0x{}", hex::encode(stream_topic(EventStream::Standard))),
                format!("0x{}", hex::encode([0xaa; 32])),
                format!("0x{}", hex::encode([0u8; 32])),
            ],
            "data": format!("0x{}", hex::encode(&data)),
            "blockNumber": "0x1a",
            "logIndex": "0x2",
        });

        let log = RawLog::from_json(&json).unwrap();
        assert_eq!(log.block_number, 26);
        assert_eq!(log.log_index, 2);
        assert!(!log.removed);
        assert_eq!(log.data, data);
    }

    #[test]
    fn test_decode_get_loan_request() {
        let mut data = Vec::new();
        let mut addr_word = [0u8; 32];
        addr_word[12..].copy_from_slice(&[0x33; 20]);
        data.extend_from_slice(&addr_word);
        data.extend_from_slice(&word_from_u128(42));
        data.extend_from_slice(&word_from_u128(6 * 32));
        data.extend_from_slice(&word_from_u128(1));
        data.extend_from_slice(&word_from_u128(700));
        data.extend_from_slice(&word_from_u128(1));
        data.extend_from_slice(&word_from_u128(4));
        let mut name = b"carl".to_vec();
        name.resize(32, 0);
        data.extend_from_slice(&name);

        let decoded = decode_loan_request(&data).unwrap();
        assert_eq!(decoded.borrower, Address([0x33; 20]));
        assert_eq!(decoded.amount_wei, 42);
        assert_eq!(decoded.ens_name, "carl");
        assert!(decoded.processed);
        assert_eq!(decoded.credit_score, 700);
        assert!(decoded.approved);
    }

    #[test]
    fn test_oversized_uint_is_rejected() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert!(word_to_u128(&word).is_err());
    }

    #[test]
    fn test_string_offset_and_length_near_max_are_errors() {
        let data = word_from_u128(u64::MAX as u128).to_vec();
        assert!(read_string(&data, 0).is_err());

        let mut data = word_from_u128(WORD as u128).to_vec();
        data.extend_from_slice(&word_from_u128(usize::MAX as u128));
        assert!(read_string(&data, 0).is_err());
    }
}
