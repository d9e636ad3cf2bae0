//! JSON-RPC client for an Ethereum-compatible node

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::abi::{self, OnChainLoanRequest};
use super::{ContractReader, LedgerClient, RpcError, TransactionReceipt};
use crate::models::{Address, RequestId, TxHash};

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &Value) -> Result<u128, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected hex quantity, got {}", value)))?;
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Decode(format!("invalid quantity '{}': {}", s, e)))
}

fn parse_u64(value: &Value) -> Result<u64, RpcError> {
    let q = parse_quantity(value)?;
    u64::try_from(q).map_err(|_| RpcError::Decode(format!("quantity {} exceeds u64", q)))
}

fn parse_bytes(value: &Value) -> Result<Vec<u8>, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected hex data, got {}", value)))?;
    hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| RpcError::Decode(format!("invalid hex data: {}", e)))
}

/// Thin JSON-RPC 2.0 client. Every call is bounded by the client timeout.
pub struct RpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue a single JSON-RPC call and return its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });

        debug!(method, id, "rpc call");

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Transport(e.to_string())
                }
            })?;

        let body: JsonRpcResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Decode(e.to_string())
            }
        })?;

        if let Some(err) = body.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        parse_u64(&self.call("eth_chainId", serde_json::json!([])).await?)
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        parse_u64(&self.call("eth_blockNumber", serde_json::json!([])).await?)
    }

    /// Logs emitted by `address` with `topic0`, inclusive block range.
    pub async fn get_logs(
        &self,
        address: &Address,
        topic0: &[u8; 32],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Value>, RpcError> {
        let result = self
            .call(
                "eth_getLogs",
                serde_json::json!([{
                    "address": address.to_hex(),
                    "topics": [format!("0x{}", hex::encode(topic0))],
                    "fromBlock": format!("0x{:x}", from_block),
                    "toBlock": format!("0x{:x}", to_block)
                }]),
            )
            .await?;

        match result {
            Value::Array(logs) => Ok(logs),
            Value::Null => Ok(Vec::new()),
            other => Err(RpcError::Decode(format!("eth_getLogs returned {}", other))),
        }
    }

    pub async fn get_code(&self, address: &Address) -> Result<Vec<u8>, RpcError> {
        parse_bytes(
            &self
                .call("eth_getCode", serde_json::json!([address.to_hex(), "latest"]))
                .await?,
        )
    }

    pub async fn eth_call(&self, to: &Address, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        parse_bytes(
            &self
                .call(
                    "eth_call",
                    serde_json::json!([{
                        "to": to.to_hex(),
                        "data": format!("0x{}", hex::encode(data))
                    }, "latest"]),
                )
                .await?,
        )
    }

    /// Balance in wei at the latest block
    pub async fn get_balance(&self, address: &Address) -> Result<u128, RpcError> {
        parse_quantity(
            &self
                .call("eth_getBalance", serde_json::json!([address.to_hex(), "latest"]))
                .await?,
        )
    }

    pub async fn get_transaction_count(
        &self,
        address: &Address,
        block: &str,
    ) -> Result<u64, RpcError> {
        parse_u64(
            &self
                .call(
                    "eth_getTransactionCount",
                    serde_json::json!([address.to_hex(), block]),
                )
                .await?,
        )
    }
}

#[async_trait]
impl LedgerClient for RpcClient {
    async fn pending_nonce(&self, account: &Address) -> Result<u64, RpcError> {
        self.get_transaction_count(account, "pending").await
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        parse_quantity(&self.call("eth_gasPrice", serde_json::json!([])).await?)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, RpcError> {
        let result = self
            .call(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        let s = result
            .as_str()
            .ok_or_else(|| RpcError::Decode(format!("expected tx hash, got {}", result)))?;
        s.parse()
            .map_err(|e: anyhow::Error| RpcError::Decode(e.to_string()))
    }

    async fn transaction_receipt(
        &self,
        hash: &TxHash,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        let result = self
            .call("eth_getTransactionReceipt", serde_json::json!([hash.to_hex()]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }

        let status = result
            .get("status")
            .ok_or_else(|| RpcError::Decode("receipt has no status".to_string()))?;
        let block_number = match result.get("blockNumber") {
            Some(v) if !v.is_null() => Some(parse_u64(v)?),
            _ => None,
        };

        Ok(Some(TransactionReceipt {
            success: parse_quantity(status)? == 1,
            block_number,
        }))
    }

    async fn is_transaction_known(&self, hash: &TxHash) -> Result<bool, RpcError> {
        let result = self
            .call("eth_getTransactionByHash", serde_json::json!([hash.to_hex()]))
            .await?;
        Ok(!result.is_null())
    }
}

/// Read access to the deployed lending contract
pub struct LendingContract {
    rpc: Arc<RpcClient>,
    address: Address,
}

impl LendingContract {
    pub fn new(rpc: Arc<RpcClient>, address: Address) -> Self {
        Self { rpc, address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

#[async_trait]
impl ContractReader for LendingContract {
    async fn loan_request(&self, request_id: &RequestId) -> Result<OnChainLoanRequest> {
        let data = abi::encode_get_loan_request(request_id);
        let output = self
            .rpc
            .eth_call(&self.address, &data)
            .await
            .map_err(|e| anyhow!("getLoanRequest({}) failed: {}", request_id, e))?;
        abi::decode_loan_request(&output)
            .with_context(|| format!("failed to decode getLoanRequest({})", request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&Value::from("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&Value::from("0x")).unwrap(), 0);
        assert_eq!(parse_quantity(&Value::from("0x4a817c800")).unwrap(), 20_000_000_000);
        assert!(parse_quantity(&Value::from(12)).is_err());
        assert!(parse_quantity(&Value::from("0xzz")).is_err());
    }

    #[test]
    fn test_parse_u64_rejects_overflow() {
        let big = Value::from(format!("0x{}", "f".repeat(20)));
        assert!(parse_u64(&big).is_err());
    }

    #[test]
    fn test_json_rpc_error_body_deserializes() {
        let body: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"nonce too low"}}"#,
        )
        .unwrap();
        let err = body.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "nonce too low");
        assert!(body.result.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transport_error() {
        let rpc = RpcClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = rpc.block_number().await.unwrap_err();
        assert!(err.is_ambiguous());
    }
}
