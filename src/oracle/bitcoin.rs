use std::str::FromStr;

use async_trait::async_trait;
use ::bitcoin::{Address, Txid};
use serde_json::{json, Value};
use tracing::debug;

use super::rpc::{decimal_from_json, JsonRpcClient};
use super::{AddressInfo, ChainBackend, ChainTransaction};
use crate::error::OracleError;

/// "No such mempool or blockchain transaction".
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// Bitcoin Core over JSON-RPC. Requires `txindex=1` for confirmed lookups.
pub struct BitcoinBackend {
    rpc: JsonRpcClient,
}

impl BitcoinBackend {
    pub fn new(rpc: JsonRpcClient) -> Self {
        Self { rpc }
    }
}

/// Turns a verbosity-2 `getrawtransaction` result into a chain transaction.
pub fn parse_transaction(hash: &str, raw: &Value) -> Result<ChainTransaction, OracleError> {
    let vin = raw["vin"]
        .as_array()
        .ok_or_else(|| OracleError::Decode(format!("{hash}: missing vin")))?;
    let vout = raw["vout"]
        .as_array()
        .ok_or_else(|| OracleError::Decode(format!("{hash}: missing vout")))?;

    let senders = vin
        .iter()
        .filter_map(|input| input["prevout"]["scriptPubKey"]["address"].as_str())
        .map(str::to_string)
        .collect();

    let mut transfers = Vec::with_capacity(vout.len());
    for output in vout {
        let Some(address) = output["scriptPubKey"]["address"].as_str() else {
            continue; // OP_RETURN and bare scripts
        };
        let amount = decimal_from_json(&output["value"])
            .ok_or_else(|| OracleError::Decode(format!("{hash}: bad output value")))?;
        transfers.push((address.to_string(), amount));
    }

    let confirmations = raw["confirmations"].as_u64().unwrap_or(0);
    Ok(ChainTransaction {
        hash: hash.to_string(),
        senders,
        transfers,
        timestamp: raw["blocktime"].as_i64(),
        success: confirmations > 0,
    })
}

#[async_trait]
impl ChainBackend for BitcoinBackend {
    fn name(&self) -> &str {
        "bitcoin-core"
    }

    /// Bitcoin Core keeps no address index, so only syntactic validity is
    /// checked and the first-seen time stays unknown.
    async fn address(&self, address: &str) -> Result<Option<AddressInfo>, OracleError> {
        let exists = Address::from_str(address).is_ok();
        Ok(Some(AddressInfo {
            exists,
            first_seen: None,
        }))
    }

    async fn transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, OracleError> {
        if Txid::from_str(hash).is_err() {
            debug!(hash, "Not a bitcoin txid");
            return Ok(None);
        }
        match self.rpc.call("getrawtransaction", vec![json!(hash), json!(2)]).await {
            Ok(raw) => parse_transaction(hash, &raw).map(Some),
            Err(OracleError::Rpc(err)) if err["code"].as_i64() == Some(RPC_INVALID_ADDRESS_OR_KEY) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
