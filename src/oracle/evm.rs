use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::rpc::{hex_quantity, JsonRpcClient};
use super::{AddressInfo, ChainBackend, ChainTransaction};
use crate::error::OracleError;

/// Native token decimals (wei per ether).
const NATIVE_DECIMALS: u32 = 18;

/// Any EVM chain over standard `eth_*` JSON-RPC.
pub struct EvmBackend {
    rpc: JsonRpcClient,
}

impl EvmBackend {
    pub fn new(rpc: JsonRpcClient) -> Self {
        Self { rpc }
    }
}

pub fn is_evm_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

pub fn wei_to_decimal(wei: u128) -> Result<Decimal, OracleError> {
    let wei = i128::try_from(wei).map_err(|_| OracleError::Decode(format!("value {wei} out of range")))?;
    Decimal::try_from_i128_with_scale(wei, NATIVE_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|e| OracleError::Decode(format!("value {wei}: {e}")))
}

/// Builds a chain transaction from `eth_getTransactionByHash`, the receipt
/// status and the block timestamp.
pub fn parse_transaction(
    hash: &str,
    tx: &Value,
    receipt_status: Option<&Value>,
    block_timestamp: Option<&Value>,
) -> Result<ChainTransaction, OracleError> {
    let from = tx["from"]
        .as_str()
        .ok_or_else(|| OracleError::Decode(format!("{hash}: missing from")))?;
    let value = hex_quantity(&tx["value"]).ok_or_else(|| OracleError::Decode(format!("{hash}: bad value")))?;

    // Contract creations have no recipient.
    let transfers = match tx["to"].as_str() {
        Some(to) => vec![(to.to_string(), wei_to_decimal(value)?)],
        None => Vec::new(),
    };

    Ok(ChainTransaction {
        hash: hash.to_string(),
        senders: vec![from.to_string()],
        transfers,
        timestamp: block_timestamp.and_then(hex_quantity).and_then(|t| i64::try_from(t).ok()),
        success: receipt_status.and_then(hex_quantity) == Some(1),
    })
}

#[async_trait]
impl ChainBackend for EvmBackend {
    fn name(&self) -> &str {
        "evm-jsonrpc"
    }

    /// An address exists once it has sent a transaction, holds code or
    /// holds a balance. First-seen needs an indexer and stays unknown.
    async fn address(&self, address: &str) -> Result<Option<AddressInfo>, OracleError> {
        if !is_evm_address(address) {
            return Ok(Some(AddressInfo {
                exists: false,
                first_seen: None,
            }));
        }

        let nonce = self
            .rpc
            .call("eth_getTransactionCount", vec![json!(address), json!("latest")])
            .await?;
        let mut exists = hex_quantity(&nonce).unwrap_or(0) > 0;
        if !exists {
            let code = self.rpc.call("eth_getCode", vec![json!(address), json!("latest")]).await?;
            exists = code.as_str().is_some_and(|c| c.len() > 2);
        }
        if !exists {
            let balance = self.rpc.call("eth_getBalance", vec![json!(address), json!("latest")]).await?;
            exists = hex_quantity(&balance).unwrap_or(0) > 0;
        }
        Ok(Some(AddressInfo {
            exists,
            first_seen: None,
        }))
    }

    async fn transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, OracleError> {
        let tx = self.rpc.call("eth_getTransactionByHash", vec![json!(hash)]).await?;
        if tx.is_null() {
            return Ok(None);
        }

        // Pending transactions have no block yet.
        if tx["blockNumber"].is_null() {
            return parse_transaction(hash, &tx, None, None).map(Some);
        }

        let receipt = self.rpc.call("eth_getTransactionReceipt", vec![json!(hash)]).await?;
        let block = self
            .rpc
            .call("eth_getBlockByNumber", vec![tx["blockNumber"].clone(), json!(false)])
            .await?;
        parse_transaction(hash, &tx, receipt.get("status"), block.get("timestamp")).map(Some)
    }
}
