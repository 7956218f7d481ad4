//! TronGrid ledger client for TRC20 USDT
//!
//! Balances come from the account tokens endpoint. Transfers build a
//! `transfer(address,uint256)` call with `triggersmartcontract`, sign the
//! returned transaction locally and submit it with `broadcasttransaction`.

use crate::domain::entities::payment::SweepKey;
use crate::domain::errors::LedgerError;
use crate::domain::repositories::ledger_client::{LedgerClient, LedgerResult};
use crate::infrastructure::tron_signer::{address_to_hex, TronSigner, ADDRESS_PREFIX};
use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const TRANSFER_SELECTOR: &str = "transfer(address,uint256)";
/// 100 TRX in sun
const FEE_LIMIT_SUN: u64 = 100_000_000;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Deserialize)]
struct TokenBalances {
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    #[serde(default)]
    result: TriggerResult,
    transaction: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerResult {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct TronGridLedger {
    client: Client,
    base_url: String,
    api_key: Option<Zeroizing<String>>,
    token_contract: String,
    limiter: Limiter,
}

impl TronGridLedger {
    pub fn new(
        base_url: &str,
        api_key: Option<Zeroizing<String>>,
        token_contract: &str,
        requests_per_second: u32,
    ) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Network(e.to_string()))?;
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            token_contract: token_contract.to_string(),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("TRON-PRO-API-KEY", key.as_str()),
            None => builder,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> LedgerResult<T> {
        self.limiter.until_ready().await;

        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|e| LedgerError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LedgerError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(LedgerError::Api {
                status: status.as_u16(),
                message: format!("{}: {}", what, body),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| LedgerError::MalformedResponse(format!("{}: {}", what, e)))
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: &Value) -> LedgerResult<T> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.client.post(&url).json(body), path).await
    }
}

/// ABI-encode the arguments of `transfer(address,uint256)`: the 20-byte address
/// (hex form without the `41` prefix) and the amount, each left-padded to 32 bytes.
pub(crate) fn encode_transfer_parameter(to_hex: &str, amount: u64) -> LedgerResult<String> {
    let bytes = hex::decode(to_hex).map_err(|_| LedgerError::InvalidAddress(to_hex.to_string()))?;
    if bytes.len() != 21 || bytes[0] != ADDRESS_PREFIX {
        return Err(LedgerError::InvalidAddress(to_hex.to_string()));
    }
    Ok(format!("{:0>64}{:064x}", hex::encode(&bytes[1..]), amount))
}

/// Attach a local signature to the transaction returned by `triggersmartcontract`.
fn sign_transaction(mut transaction: Value, signer: &TronSigner) -> LedgerResult<(String, Value)> {
    let raw_data_hex = transaction
        .get("raw_data_hex")
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::MalformedResponse("transaction without raw_data_hex".to_string()))?;
    let signed = signer.sign(raw_data_hex)?;

    if let Some(tx_id) = transaction.get("txID").and_then(Value::as_str) {
        if !tx_id.eq_ignore_ascii_case(&signed.tx_id) {
            return Err(LedgerError::MalformedResponse(format!(
                "txID {} does not match raw_data",
                tx_id
            )));
        }
    }
    transaction["signature"] = json!([signed.signature]);
    Ok((signed.tx_id, transaction))
}

/// Pull a base-unit balance out of one entry of the account tokens response.
fn parse_token_balance(entry: &Value) -> LedgerResult<u64> {
    match entry.get("balance") {
        Some(Value::String(raw)) => raw
            .parse::<u64>()
            .map_err(|_| LedgerError::MalformedResponse(format!("balance: {}", raw))),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| LedgerError::MalformedResponse(format!("balance: {}", n))),
        _ => Err(LedgerError::MalformedResponse(
            "token entry without balance".to_string(),
        )),
    }
}

/// TronGrid reports contract errors as hex-encoded text.
fn decode_message(message: &str) -> String {
    hex::decode(message)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| message.to_string())
}

#[async_trait]
impl LedgerClient for TronGridLedger {
    async fn balance_of(&self, address: &str) -> LedgerResult<u64> {
        let url = format!("{}/v1/accounts/{}/tokens", self.base_url, address);
        let builder = self
            .client
            .get(&url)
            .query(&[("contract_address", self.token_contract.as_str())]);
        let balances: TokenBalances = self.send(builder, "account tokens").await?;

        let balance = match balances.data.first() {
            Some(entry) => parse_token_balance(entry)?,
            None => 0,
        };
        debug!("Token balance of {}: {}", address, balance);
        Ok(balance)
    }

    async fn transfer(
        &self,
        from_address: &str,
        from_key: &SweepKey,
        to_address: &str,
        amount: u64,
    ) -> LedgerResult<String> {
        let signer = TronSigner::from_sweep_key(from_key)?;
        if signer.address() != from_address {
            return Err(LedgerError::InvalidKey(format!(
                "sweep key does not control {}",
                from_address
            )));
        }
        let to_hex = address_to_hex(to_address)?;
        let parameter = encode_transfer_parameter(&to_hex, amount)?;

        let trigger: TriggerResponse = self
            .post(
                "/wallet/triggersmartcontract",
                &json!({
                    "owner_address": from_address,
                    "contract_address": self.token_contract,
                    "function_selector": TRANSFER_SELECTOR,
                    "parameter": parameter,
                    "fee_limit": FEE_LIMIT_SUN,
                    "call_value": 0,
                    "visible": true,
                }),
            )
            .await?;
        let transaction = match trigger.transaction {
            Some(tx) if trigger.result.result => tx,
            _ => {
                let reason = trigger
                    .result
                    .message
                    .as_deref()
                    .map(decode_message)
                    .unwrap_or_else(|| "contract call rejected".to_string());
                return Err(LedgerError::TransferFailed(reason));
            }
        };

        let (tx_id, signed) = sign_transaction(transaction, &signer)?;
        drop(signer);

        let broadcast: BroadcastResponse = self
            .post("/wallet/broadcasttransaction", &signed)
            .await?;
        if !broadcast.result {
            let reason = format!(
                "{} {}",
                broadcast.code.unwrap_or_default(),
                broadcast.message.as_deref().map(decode_message).unwrap_or_default()
            );
            warn!("Broadcast from {} rejected: {}", from_address, reason.trim());
            return Err(LedgerError::TransferFailed(reason.trim().to_string()));
        }

        let txid = broadcast.txid.unwrap_or(tx_id);
        info!("Transferred {} base units from {} (tx {})", amount, from_address, txid);
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREASURY_HEX: &str = "41a614f803b6fd780986a42c78ec9c7f77e6ded13c";
    const KEY_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    const KEY_ONE_ADDRESS: &str = "TMVQGm1qAQYVdetCeGRRkTWYYrLXuHK2HC";

    fn ledger() -> TronGridLedger {
        TronGridLedger::new("http://localhost:9/", None, "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t", 10).unwrap()
    }

    #[test]
    fn test_encode_transfer_parameter() {
        let encoded = encode_transfer_parameter(TREASURY_HEX, 20_000_000).unwrap();
        assert_eq!(encoded.len(), 128);
        assert_eq!(
            &encoded[..64],
            "000000000000000000000000a614f803b6fd780986a42c78ec9c7f77e6ded13c"
        );
        assert_eq!(
            &encoded[64..],
            "0000000000000000000000000000000000000000000000000000000001312d00"
        );
    }

    #[test]
    fn test_encode_rejects_bad_address() {
        assert!(encode_transfer_parameter("TYz8xR6dNbhCPEWkYUuKMmTzcNSyoVRhJp", 1).is_err());
        assert!(encode_transfer_parameter("42a614f803b6fd780986a42c78ec9c7f77e6ded13c", 1).is_err());
    }

    #[test]
    fn test_parse_token_balance() {
        assert_eq!(parse_token_balance(&json!({"balance": "20000000"})).unwrap(), 20_000_000);
        assert_eq!(parse_token_balance(&json!({"balance": 5})).unwrap(), 5);
        assert!(parse_token_balance(&json!({"balance": "-1"})).is_err());
        assert!(parse_token_balance(&json!({})).is_err());
    }

    #[test]
    fn test_decode_message() {
        assert_eq!(decode_message("52455645525445440a"), "REVERTED\n");
        assert_eq!(decode_message("not hex"), "not hex");
    }

    #[test]
    fn test_sign_transaction_attaches_signature() {
        let signer = TronSigner::from_sweep_key(&SweepKey::new(KEY_ONE)).unwrap();
        let raw_data_hex = "0a0207902208e1b9de559665c6714080c49789bb2c5a67";
        let expected = signer.sign(raw_data_hex).unwrap();

        let transaction = json!({
            "txID": expected.tx_id,
            "raw_data": {"contract": []},
            "raw_data_hex": raw_data_hex,
        });
        let (tx_id, signed) = sign_transaction(transaction, &signer).unwrap();
        assert_eq!(tx_id, expected.tx_id);
        assert_eq!(signed["signature"], json!([expected.signature]));
        assert_eq!(signed["raw_data_hex"], raw_data_hex);
        assert!(signed.get("privateKey").is_none());

        let tampered = json!({"txID": "00".repeat(32), "raw_data_hex": raw_data_hex});
        assert!(matches!(
            sign_transaction(tampered, &signer),
            Err(LedgerError::MalformedResponse(_))
        ));
        assert!(sign_transaction(json!({"txID": "ab"}), &signer).is_err());
    }

    #[tokio::test]
    async fn test_transfer_checks_addresses_and_key_before_any_request() {
        let ledger = ledger();
        assert_eq!(ledger.base_url, "http://localhost:9");

        let err = ledger
            .transfer(KEY_ONE_ADDRESS, &SweepKey::new(KEY_ONE), "TNowhere", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAddress(_)));
        assert!(!err.is_transient());

        // Key of a different account
        let err = ledger
            .transfer("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t", &SweepKey::new(KEY_ONE), KEY_ONE_ADDRESS, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidKey(_)));

        let err = ledger
            .transfer(KEY_ONE_ADDRESS, &SweepKey::new("not a key"), KEY_ONE_ADDRESS, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidKey(_)));
    }
}
