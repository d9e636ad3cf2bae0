//! Local-key transaction signing
//!
//! Fulfillment transactions are plain legacy transactions with EIP-155 replay
//! protection, RLP-encoded by hand. The key never leaves this module.

use anyhow::{anyhow, Context, Result};
use k256::ecdsa::{RecoveryId, SigningKey};

use super::abi::keccak256;
use crate::models::{Address, TxHash};

/// Signs transactions on behalf of the oracle account.
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    fn sign(&self, tx: &LegacyTransaction) -> Result<SignedTransaction>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn base_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp_uint(self.nonce as u128),
            rlp_uint(self.gas_price),
            rlp_uint(self.gas_limit as u128),
            rlp_bytes(self.to.as_bytes()),
            rlp_uint(self.value),
            rlp_bytes(&self.data),
        ]
    }

    /// RLP payload hashed for signing: the six fields followed by `chain_id, 0, 0`.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut fields = self.base_fields();
        fields.push(rlp_uint(self.chain_id as u128));
        fields.push(rlp_uint(0));
        fields.push(rlp_uint(0));
        rlp_list(&fields)
    }

    pub fn signing_hash(&self) -> [u8; 32] {
        keccak256(&self.signing_payload())
    }

    /// Final wire encoding once `v`, `r` and `s` are known.
    pub fn encode_signed(&self, v: u64, r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
        let mut fields = self.base_fields();
        fields.push(rlp_uint(v as u128));
        fields.push(rlp_bytes(strip_leading_zeros(r)));
        fields.push(rlp_bytes(strip_leading_zeros(s)));
        rlp_list(&fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
    /// Hash the node will report for this transaction
    pub hash: TxHash,
}

pub struct LocalKeySigner {
    key: SigningKey,
    address: Address,
}

impl LocalKeySigner {
    /// Load a 32-byte secp256k1 key from hex, with or without `0x`.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let raw = secret.trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = hex::decode(raw).context("private key is not valid hex")?;
        if bytes.len() != 32 {
            return Err(anyhow!("private key must be 32 bytes, got {}", bytes.len()));
        }
        let key = SigningKey::from_slice(&bytes).map_err(|_| anyhow!("invalid secp256k1 private key"))?;
        let address = address_of(&key);
        Ok(Self { key, address })
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn address_of(key: &SigningKey) -> Address {
    let point = key.verifying_key().to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    Address(addr)
}

impl TransactionSigner for LocalKeySigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, tx: &LegacyTransaction) -> Result<SignedTransaction> {
        let hash = tx.signing_hash();
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| anyhow!("signing failed: {}", e))?;

        // Nodes reject high-s signatures
        let (signature, recovery_id) = match signature.normalize_s() {
            Some(normalized) => (
                normalized,
                RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced()),
            ),
            None => (signature, recovery_id),
        };

        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);

        let v = tx.chain_id * 2 + 35 + recovery_id.to_byte() as u64;
        let raw = tx.encode_signed(v, &r, &s);
        let hash = TxHash(keccak256(&raw));

        Ok(SignedTransaction { raw, hash })
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

fn rlp_length_prefix(len: usize, short_offset: u8, long_offset: u8) -> Vec<u8> {
    if len <= 55 {
        vec![short_offset + len as u8]
    } else {
        let len_bytes = len.to_be_bytes();
        let len_bytes = strip_leading_zeros(&len_bytes);
        let mut prefix = vec![long_offset + len_bytes.len() as u8];
        prefix.extend_from_slice(len_bytes);
        prefix
    }
}

fn rlp_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return bytes.to_vec();
    }
    let mut out = rlp_length_prefix(bytes.len(), 0x80, 0xb7);
    out.extend_from_slice(bytes);
    out
}

fn rlp_uint(value: u128) -> Vec<u8> {
    let be = value.to_be_bytes();
    rlp_bytes(strip_leading_zeros(&be))
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flatten().copied().collect();
    let mut out = rlp_length_prefix(payload.len(), 0xc0, 0xf7);
    out.extend_from_slice(&payload);
    out
}
