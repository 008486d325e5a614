use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;

use crate::breaker::RequestGate;
use crate::error::CircuitOpenError;

// Bybit V5 public REST API
// Docs: https://bybit-exchange.github.io/docs/v5/intro
pub const BYBIT_API_BASE: &str = "https://api.bybit.com";
pub const BYBIT_TESTNET_API_BASE: &str = "https://api-testnet.bybit.com";
const DEFAULT_REQUESTS_PER_SECOND: u32 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 10;

type ExchangeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("exchange error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("symbol {0} not found")]
    SymbolNotFound(String),
}

impl ExchangeError {
    /// Failure class recorded by the circuit breaker
    pub fn kind(&self) -> String {
        match self {
            ExchangeError::CircuitOpen(_) => "CIRCUIT_OPEN".to_string(),
            ExchangeError::Http(e) if e.is_timeout() => "TIMEOUT".to_string(),
            ExchangeError::Http(_) => "TRANSPORT".to_string(),
            ExchangeError::Status { status, .. } => format!("HTTP_{}", status),
            ExchangeError::Api { code, .. } => format!("API_{}", code),
            ExchangeError::Decode(_) => "DECODE".to_string(),
            ExchangeError::SymbolNotFound(_) => "NOT_FOUND".to_string(),
        }
    }
}

/// Common V5 response envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResult {
    time_second: String,
    time_nano: String,
}

#[derive(Debug, Deserialize)]
struct TickersResult {
    #[serde(default)]
    list: Vec<TickerData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    symbol: String,
    last_price: String,
    #[serde(default)]
    bid1_price: Option<String>,
    #[serde(default)]
    ask1_price: Option<String>,
    #[serde(default)]
    volume24h: Option<String>,
}

/// Latest ticker for a symbol
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub volume_24h: Option<f64>,
}

/// Bybit client whose every request passes through the circuit breaker
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    base_url: String,
    gate: RequestGate,
    rate_limiter: Arc<ExchangeRateLimiter>,
}

impl BybitClient {
    pub fn new(base_url: impl Into<String>, gate: RequestGate) -> Result<Self, ExchangeError> {
        Self::with_rate_limit(base_url, gate, DEFAULT_REQUESTS_PER_SECOND)
    }

    pub fn with_rate_limit(
        base_url: impl Into<String>,
        gate: RequestGate,
        requests_per_second: u32,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gate,
            rate_limiter,
        })
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    /// Exchange server time
    pub async fn get_server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.get("/v5/market/time", &[], parse_server_time).await
    }

    /// Latest ticker for `symbol` in `category` (spot, linear, inverse, option)
    pub async fn get_ticker(&self, category: &str, symbol: &str) -> Result<Ticker, ExchangeError> {
        let ticker = self
            .get(
                "/v5/market/tickers",
                &[("category", category), ("symbol", symbol)],
                |result: TickersResult| {
                    result
                        .list
                        .into_iter()
                        .find(|t| t.symbol == symbol)
                        .map(parse_ticker)
                        .transpose()
                },
            )
            .await?;

        // An empty list is a caller problem, not an exchange failure
        ticker.ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    /// Rate-limited, breaker-guarded GET. Decoding into the final value
    /// happens inside the guard so malformed payloads count as failures.
    async fn get<R, T, P>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        parse: P,
    ) -> Result<T, ExchangeError>
    where
        R: DeserializeOwned,
        P: FnOnce(R) -> Result<T, ExchangeError>,
    {
        self.gate
            .call_classified(
                || async move {
                    self.rate_limiter.until_ready().await;
                    let result: R = self.fetch(path, query).await?;
                    parse(result)
                },
                ExchangeError::kind,
            )
            .await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, "Exchange request");

        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Decode(e.to_string()))?;

        if envelope.ret_code != 0 {
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }

        envelope
            .result
            .ok_or_else(|| ExchangeError::Decode("missing result".to_string()))
    }
}

fn parse_server_time(result: ServerTimeResult) -> Result<DateTime<Utc>, ExchangeError> {
    let secs: i64 = result
        .time_second
        .parse()
        .map_err(|e| ExchangeError::Decode(format!("timeSecond: {}", e)))?;
    let nanos: i64 = result
        .time_nano
        .parse()
        .map_err(|e| ExchangeError::Decode(format!("timeNano: {}", e)))?;
    let subsec = (nanos % 1_000_000_000) as u32;

    DateTime::from_timestamp(secs, subsec)
        .ok_or_else(|| ExchangeError::Decode(format!("timestamp out of range: {}", secs)))
}

fn parse_ticker(data: TickerData) -> Result<Ticker, ExchangeError> {
    let last_price = data
        .last_price
        .parse()
        .map_err(|e| ExchangeError::Decode(format!("lastPrice: {}", e)))?;

    Ok(Ticker {
        symbol: data.symbol,
        last_price,
        bid_price: data.bid1_price.and_then(|p| p.parse().ok()),
        ask_price: data.ask1_price.and_then(|p| p.parse().ok()),
        volume_24h: data.volume24h.and_then(|v| v.parse().ok()),
    })
}
