//! Binance USDⓈ-M futures gateway (testnet and mainnet).
//!
//! Signed endpoints carry `timestamp` and `recvWindow` in the query string and
//! an HMAC-SHA256 `signature` of that query, with the key in `X-MBX-APIKEY`.
//! Protective orders are reduce-only STOP_MARKET / TAKE_PROFIT_MARKET sells.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::{ExchangeGateway, ExchangeMode};
use crate::error::TradingError;
use crate::models::{CancelOutcome, Fill, OrderSide, OrderState, OrderStatus, PriceBar};
use crate::trading::Timeframe;

type HmacSha256 = Hmac<Sha256>;

/// Futures REST base URLs
pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

const RECV_WINDOW_MS: u64 = 5000;

/// Unknown order (already filled, canceled, or never existed)
const CODE_UNKNOWN_ORDER: i64 = -2011;
const CODE_NO_SUCH_ORDER: i64 = -2013;
/// Client order id already used
const CODE_DUPLICATE_CLIENT_ID: i64 = -4116;

/// Error body returned by the API on 4xx.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

/// Raw failure of one REST call, before it is classified per endpoint.
#[derive(Debug, Clone, PartialEq)]
enum ApiFailure {
    /// Transport error, timeout, 5xx, or rate limit
    Transient(String),
    /// The API answered with an error code
    Rejected { code: i64, msg: String },
}

/// What an endpoint does, which decides how its failures are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    MarketData,
    Account,
    Order,
}

impl ApiFailure {
    fn into_error(self, kind: CallKind, context: &str) -> TradingError {
        match (self, kind) {
            (ApiFailure::Transient(msg), CallKind::MarketData) => {
                TradingError::MarketDataUnavailable(format!("{}: {}", context, msg))
            }
            (ApiFailure::Transient(msg), _) => {
                TradingError::ExchangeUnavailable(format!("{}: {}", context, msg))
            }
            (ApiFailure::Rejected { code, msg }, CallKind::MarketData) => {
                TradingError::MarketDataUnavailable(format!("{}: [{}] {}", context, code, msg))
            }
            (ApiFailure::Rejected { code, msg }, CallKind::Account) => {
                TradingError::InvalidConfiguration(format!("{}: [{}] {}", context, code, msg))
            }
            (ApiFailure::Rejected { code, msg }, CallKind::Order) => {
                TradingError::OrderRejected(format!("{}: [{}] {}", context, code, msg))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    #[serde(default)]
    avg_price: Decimal,
    #[serde(default)]
    executed_qty: Decimal,
}

impl OrderResponse {
    /// Stop and take-profit orders fill at market, so avgPrice carries the slippage.
    fn order_status(&self) -> OrderStatus {
        match order_state(&self.status) {
            OrderState::Filled => OrderStatus::filled(Some(self.avg_price)),
            state => OrderStatus::new(state),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    asset: String,
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: Decimal,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

/// Lot and price increments for the traded symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SymbolFilters {
    step_size: Decimal,
    tick_size: Decimal,
}

impl SymbolFilters {
    fn from_info(info: &SymbolInfo) -> Option<Self> {
        let filter = |name: &str, field: &str| -> Option<Decimal> {
            info.filters
                .iter()
                .find(|f| f.get("filterType").and_then(|v| v.as_str()) == Some(name))
                .and_then(|f| f.get(field))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
        };
        Some(Self {
            step_size: filter("LOT_SIZE", "stepSize")?,
            tick_size: filter("PRICE_FILTER", "tickSize")?,
        })
    }

    fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        ((price / self.tick_size).round() * self.tick_size).normalize()
    }

    fn round_quantity(&self, quantity: Decimal) -> Decimal {
        if self.step_size.is_zero() {
            return quantity;
        }
        ((quantity / self.step_size).floor() * self.step_size).normalize()
    }
}

/// Signed REST client bound to one symbol.
pub struct BinanceFuturesGateway {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    /// Exchange form of the pair, e.g. "BTCUSDT"
    symbol: String,
    quote_asset: String,
    filters: SymbolFilters,
}

impl BinanceFuturesGateway {
    /// Connect to testnet or mainnet, load symbol filters, and set leverage.
    pub async fn connect(
        mode: ExchangeMode,
        api_key: &str,
        api_secret: &str,
        pair: &str,
        leverage: u32,
    ) -> Result<Self> {
        let base_url = match mode {
            ExchangeMode::Testnet => TESTNET_URL,
            ExchangeMode::Live => MAINNET_URL,
            ExchangeMode::DryRun => return Err(anyhow!("dry-run mode has no exchange to connect to")),
        };

        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let (symbol, quote_asset) = split_pair(pair);
        let mut gateway = Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            symbol,
            quote_asset,
            filters: SymbolFilters {
                step_size: Decimal::ZERO,
                tick_size: Decimal::ZERO,
            },
        };

        let info: ExchangeInfo = gateway
            .send(Method::GET, "/fapi/v1/exchangeInfo", Vec::new(), false)
            .await
            .map_err(|e| anyhow!("{:?}", e))
            .context("Failed to load exchange info")?;
        let symbol_info = info
            .symbols
            .iter()
            .find(|s| s.symbol == gateway.symbol)
            .ok_or_else(|| anyhow!("Symbol {} is not listed on {}", gateway.symbol, base_url))?;
        gateway.filters = SymbolFilters::from_info(symbol_info)
            .ok_or_else(|| anyhow!("Symbol {} has no lot/price filters", gateway.symbol))?;

        let _: serde_json::Value = gateway
            .send(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", gateway.symbol.clone()),
                    ("leverage", leverage.to_string()),
                ],
                true,
            )
            .await
            .map_err(|e| anyhow!("{:?}", e))
            .context("Failed to set leverage")?;

        info!(
            mode = %mode,
            symbol = %gateway.symbol,
            leverage,
            step_size = %gateway.filters.step_size,
            tick_size = %gateway.filters.tick_size,
            "Connected to Binance futures"
        );

        Ok(gateway)
    }

    fn sign(&self, query: &str) -> Result<String, ApiFailure> {
        sign_query(&self.api_secret, query)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<T, ApiFailure> {
        if signed {
            params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
            params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        }
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if signed {
            let signature = self.sign(&query)?;
            query = format!("{}&signature={}", query, signature);
        }

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut request = self.http.request(method.clone(), &url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ApiFailure::Transient(e.to_string()))?;
        let status = resp.status();

        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| ApiFailure::Transient(format!("unreadable response: {}", e)));
        }

        let text = resp.text().await.unwrap_or_default();
        debug!(%method, path, status = status.as_u16(), body = %text, "Binance request failed");
        Err(classify_failure(status.as_u16(), &text))
    }

    async fn query_order(&self, key: (&str, String)) -> Result<OrderResponse, ApiFailure> {
        self.send(
            Method::GET,
            "/fapi/v1/order",
            vec![("symbol", self.symbol.clone()), key],
            true,
        )
        .await
    }

    /// Submit an order; a duplicate client id returns the order already placed.
    async fn submit_order(
        &self,
        params: Vec<(&str, String)>,
        client_order_id: &str,
    ) -> Result<OrderResponse, ApiFailure> {
        let mut params = params;
        params.push(("newClientOrderId", client_order_id.to_string()));
        params.push(("newOrderRespType", "RESULT".to_string()));

        match self.send(Method::POST, "/fapi/v1/order", params, true).await {
            Err(ApiFailure::Rejected { code, .. }) if code == CODE_DUPLICATE_CLIENT_ID => {
                warn!(client_order_id, "Order already accepted, reading it back");
                self.query_order(("origClientOrderId", client_order_id.to_string()))
                    .await
            }
            other => other,
        }
    }

    async fn place_protective(
        &self,
        order_type: &str,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError> {
        let stop_price = self.filters.round_price(price);
        let quantity = self.filters.round_quantity(quantity);
        let params = vec![
            ("symbol", self.symbol.clone()),
            ("side", OrderSide::Sell.as_str().to_string()),
            ("type", order_type.to_string()),
            ("stopPrice", stop_price.to_string()),
            ("quantity", quantity.to_string()),
            ("reduceOnly", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        let order = self
            .submit_order(params, client_order_id)
            .await
            .map_err(|e| e.into_error(CallKind::Order, order_type))?;

        info!(order_id = order.order_id, order_type, stop_price = %stop_price, quantity = %quantity, "Protective order placed");
        Ok(order.order_id.to_string())
    }
}

#[async_trait]
impl ExchangeGateway for BinanceFuturesGateway {
    fn name(&self) -> &str {
        "binance-futures"
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<PriceBar>, TradingError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .send(
                Method::GET,
                "/fapi/v1/klines",
                vec![
                    ("symbol", self.symbol.clone()),
                    ("interval", timeframe.as_str().to_string()),
                    ("limit", limit.min(1500).to_string()),
                ],
                false,
            )
            .await
            .map_err(|e| e.into_error(CallKind::MarketData, "klines"))?;

        let bars = rows
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TradingError::MarketDataUnavailable("malformed kline row".into()))?;

        if !PriceBar::is_ordered(&bars) {
            return Err(TradingError::MarketDataUnavailable(
                "klines out of order".into(),
            ));
        }
        debug!(symbol = %self.symbol, count = bars.len(), "Fetched candles");
        Ok(bars)
    }

    async fn equity(&self) -> Result<Decimal, TradingError> {
        let balances: Vec<BalanceEntry> = self
            .send(Method::GET, "/fapi/v2/balance", Vec::new(), true)
            .await
            .map_err(|e| e.into_error(CallKind::Account, "balance"))?;

        Ok(balances
            .into_iter()
            .find(|b| b.asset == self.quote_asset)
            .map(|b| b.balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn quantity_step(&self, _symbol: &str) -> Result<Decimal, TradingError> {
        Ok(self.filters.step_size)
    }

    async fn place_market_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<Fill, TradingError> {
        let quantity = self.filters.round_quantity(quantity);
        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
        ];
        if side == OrderSide::Sell {
            params.push(("reduceOnly", "true".to_string()));
        }

        let mut order = self
            .submit_order(params, client_order_id)
            .await
            .map_err(|e| e.into_error(CallKind::Order, "market order"))?;

        if order.status != "FILLED" {
            // Market orders normally fill before the response; read it once more.
            order = self
                .query_order(("orderId", order.order_id.to_string()))
                .await
                .map_err(|e| e.into_error(CallKind::Order, "market order status"))?;
        }
        if order.status != "FILLED" || order.executed_qty <= Decimal::ZERO {
            return Err(TradingError::OrderRejected(format!(
                "market order {} not filled (status {})",
                order.order_id, order.status
            )));
        }

        info!(
            order_id = order.order_id,
            side = side.as_str(),
            price = %order.avg_price,
            quantity = %order.executed_qty,
            "Market order filled"
        );
        Ok(Fill {
            order_id: order.order_id.to_string(),
            price: order.avg_price,
            quantity: order.executed_qty,
        })
    }

    async fn place_stop_order(
        &self,
        _symbol: &str,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError> {
        self.place_protective("STOP_MARKET", price, quantity, client_order_id)
            .await
    }

    async fn place_take_profit_order(
        &self,
        _symbol: &str,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError> {
        self.place_protective("TAKE_PROFIT_MARKET", price, quantity, client_order_id)
            .await
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, TradingError> {
        let result: Result<serde_json::Value, ApiFailure> = self
            .send(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", self.symbol.clone()),
                    ("orderId", order_id.to_string()),
                ],
                true,
            )
            .await;

        match result {
            Ok(_) => Ok(CancelOutcome::Canceled),
            Err(ApiFailure::Rejected { code, .. })
                if code == CODE_UNKNOWN_ORDER || code == CODE_NO_SUCH_ORDER =>
            {
                Ok(CancelOutcome::NotFound)
            }
            Err(e) => Err(e.into_error(CallKind::Order, "cancel")),
        }
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, TradingError> {
        let order = self
            .query_order(("orderId", order_id.to_string()))
            .await
            .map_err(|e| e.into_error(CallKind::Order, "order status"))?;
        Ok(order.order_status())
    }

    async fn position_size(&self, _symbol: &str) -> Result<Decimal, TradingError> {
        let positions: Vec<PositionRisk> = self
            .send(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", self.symbol.clone())],
                true,
            )
            .await
            .map_err(|e| e.into_error(CallKind::Account, "position risk"))?;

        Ok(positions
            .iter()
            .filter(|p| p.symbol == self.symbol)
            .map(|p| p.position_amt.max(Decimal::ZERO))
            .sum())
    }
}

/// "BTC/USDT" -> ("BTCUSDT", "USDT"). A pair without a slash is assumed USDT-quoted.
fn split_pair(pair: &str) -> (String, String) {
    let pair = pair.trim().to_uppercase();
    match pair.split_once('/') {
        Some((base, quote)) => (format!("{}{}", base, quote), quote.to_string()),
        None => (pair, "USDT".to_string()),
    }
}

fn sign_query(secret: &str, query: &str) -> Result<String, ApiFailure> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
        ApiFailure::Rejected {
            code: 0,
            msg: format!("invalid API secret: {}", e),
        }
    })?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn classify_failure(status: u16, body: &str) -> ApiFailure {
    if status >= 500 || status == 429 || status == 418 {
        return ApiFailure::Transient(format!("HTTP {}: {}", status, body));
    }
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => ApiFailure::Rejected {
            code: err.code,
            msg: err.msg,
        },
        Err(_) => ApiFailure::Rejected {
            code: -(status as i64),
            msg: body.to_string(),
        },
    }
}

fn order_state(status: &str) -> OrderState {
    match status {
        "FILLED" => OrderState::Filled,
        "CANCELED" | "EXPIRED" | "REJECTED" | "EXPIRED_IN_MATCH" => OrderState::Canceled,
        _ => OrderState::Open,
    }
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline(row: &[serde_json::Value]) -> Option<PriceBar> {
    let number = |i: usize| -> Option<f64> { row.get(i)?.as_str()?.parse().ok() };
    let open_time = row.first()?.as_i64()?;
    Some(PriceBar::new(
        DateTime::from_timestamp_millis(open_time)?,
        number(1)?,
        number(2)?,
        number(3)?,
        number(4)?,
        number(5)?,
    ))
}
