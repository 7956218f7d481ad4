//! Binance USDⓈ-M futures REST client
//!
//! Signed endpoints carry `timestamp` and `recvWindow` in the query string plus an
//! HMAC-SHA256 `signature` over that query, keyed with the tenant's secret key.

use crate::domain::entities::balance::{Balance, OpenPosition};
use crate::domain::entities::order::{OrderRequest, OrderType};
use crate::domain::entities::tenant::ApiCredentials;
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

const BINANCE_FUTURES_BASE: &str = "https://fapi.binance.com";
const BINANCE_FUTURES_TESTNET_BASE: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Binance error codes that mean the key itself is unusable
const CREDENTIAL_ERROR_CODES: &[i64] = &[-2014, -2015, -1022];

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceBalance {
    asset: String,
    balance: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinancePosition {
    symbol: String,
    position_amt: String,
    entry_price: String,
    leverage: String,
    un_realized_profit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrderResponse {
    order_id: i64,
}

pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    credentials: ApiCredentials,
}

impl BinanceFuturesClient {
    pub fn new(credentials: ApiCredentials, testnet: bool) -> ExchangeResult<Self> {
        let base_url = if testnet {
            BINANCE_FUTURES_TESTNET_BASE
        } else {
            BINANCE_FUTURES_BASE
        };
        Self::with_base_url(credentials, base_url)
    }

    pub fn with_base_url(credentials: ApiCredentials, base_url: &str) -> ExchangeResult<Self> {
        if !credentials.is_complete() {
            return Err(ExchangeError::Authentication(
                "API key and secret are required".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn sign(&self, query: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Authentication(format!("Invalid secret key: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build `params&timestamp=..&recvWindow=..&signature=..`
    fn signed_query(&self, params: &[(&str, String)], timestamp_ms: i64) -> ExchangeResult<String> {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in params {
            serializer.append_pair(key, value);
        }
        serializer.append_pair("recvWindow", &RECV_WINDOW_MS.to_string());
        serializer.append_pair("timestamp", &timestamp_ms.to_string());
        let query = serializer.finish();

        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let query = self.signed_query(params, chrono::Utc::now().timestamp_millis())?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        debug!("Binance {} {}", method, path);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", self.credentials.api_key.as_str())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if !status.is_success() {
            let error = map_error_response(status, &body);
            warn!("Binance {} failed: {}", path, error);
            return Err(error);
        }

        serde_json::from_str(&body).map_err(|e| {
            ExchangeError::MalformedResponse(format!("{}: {}", path, e))
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Timeout(REQUEST_TIMEOUT)
    } else {
        ExchangeError::Network(e.to_string())
    }
}

/// Classify a non-2xx Binance response.
pub(crate) fn map_error_response(status: StatusCode, body: &str) -> ExchangeError {
    let parsed: Option<BinanceErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| format!("{} ({})", b.msg, b.code))
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body));

    let credential_code = parsed
        .as_ref()
        .map(|b| CREDENTIAL_ERROR_CODES.contains(&b.code))
        .unwrap_or(false);

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN || credential_code {
        ExchangeError::Authentication(message)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ExchangeError::Network(message)
    } else if status.is_client_error() {
        ExchangeError::Rejected(message)
    } else {
        ExchangeError::MalformedResponse(message)
    }
}

fn parse_number(field: &str, raw: &str) -> ExchangeResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::MalformedResponse(format!("{} is not a number: {}", field, raw)))
}

/// Quantity as Binance expects it: fixed precision, no exponent.
fn format_quantity(quantity: f64) -> String {
    let formatted = format!("{:.3}", quantity);
    formatted.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    fn name(&self) -> &str {
        "binance-futures"
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/fapi/v1/ping", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Binance ping failed: {}", e);
                false
            }
        }
    }

    async fn get_balance(&self) -> ExchangeResult<Vec<Balance>> {
        let raw: Vec<BinanceBalance> = self
            .signed_request(Method::GET, "/fapi/v2/balance", &[])
            .await?;

        raw.into_iter()
            .map(|b| {
                let available = parse_number("availableBalance", &b.available_balance)?;
                let total = parse_number("balance", &b.balance)?;
                // Negative wallet balances occur with unrealized losses; clamp for sizing
                Balance::new(b.asset, available.max(0.0), total.max(0.0))
                    .map_err(ExchangeError::MalformedResponse)
            })
            .collect()
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<OpenPosition>> {
        let raw: Vec<BinancePosition> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;

        let mut positions = Vec::new();
        for p in raw {
            let amount = parse_number("positionAmt", &p.position_amt)?;
            if amount == 0.0 {
                continue;
            }
            positions.push(OpenPosition {
                symbol: p.symbol,
                amount,
                entry_price: parse_number("entryPrice", &p.entry_price)?,
                leverage: p.leverage.parse().unwrap_or(1),
                unrealized_pnl: parse_number("unRealizedProfit", &p.un_realized_profit)?,
            });
        }
        Ok(positions)
    }

    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<String> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.to_string()),
            ("type", order.order_type.to_string()),
            ("quantity", format_quantity(order.quantity.value())),
        ];
        if order.order_type == OrderType::Limit {
            let price = order
                .price
                .ok_or_else(|| ExchangeError::InvalidOrder("Limit order without price".into()))?;
            params.push(("price", price.value().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }

        let response: BinanceOrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;
        Ok(response.order_id.to_string())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let _: serde_json::Value = self
            .signed_request(Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        Ok(())
    }
}
