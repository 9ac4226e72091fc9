//! Wire types for the line-delimited JSON protocol spoken by the MT5
//! sidecar process. One JSON object per line, UTF-8, correlated by a
//! monotonically increasing `requestId`.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use bullion_broker::{
    SymbolInfo, TradeReceipt, VenueError, VenuePosition, VenueQuote, VenueResult,
};
use bullion_core::Side;

/// A reply correlated to an earlier request.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// An unsolicited event pushed by the sidecar.
#[derive(Clone, Debug, Deserialize)]
pub struct PriceEvent {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub spread: f64,
}

/// Everything a stdout line can decode into.
#[derive(Debug)]
pub enum Inbound {
    Reply(RpcResponse),
    PriceUpdate(PriceEvent),
    /// Anything else the sidecar printed; logged, never fatal.
    Noise(String),
}

/// Decode one stdout line.
pub fn parse_line(line: &str) -> Inbound {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Inbound::Noise(String::new());
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Inbound::Noise(trimmed.to_string()),
    };
    if value.get("requestId").is_some() {
        match serde_json::from_value::<RpcResponse>(value) {
            Ok(reply) => Inbound::Reply(reply),
            Err(_) => Inbound::Noise(trimmed.to_string()),
        }
    } else if value.get("type").and_then(Value::as_str) == Some("price_update") {
        match value
            .get("data")
            .cloned()
            .map(serde_json::from_value::<PriceEvent>)
        {
            Some(Ok(event)) => Inbound::PriceUpdate(event),
            _ => Inbound::Noise(trimmed.to_string()),
        }
    } else {
        Inbound::Noise(trimmed.to_string())
    }
}

/// Encode a request line for the sidecar.
#[must_use]
pub fn request_line(action: &str, request_id: u64, params: Value) -> String {
    let mut object = Map::new();
    object.insert("action".into(), json!(action));
    object.insert("requestId".into(), json!(request_id));
    if let Value::Object(params) = params {
        object.extend(params);
    }
    Value::Object(object).to_string()
}

pub fn to_decimal(value: f64, field: &'static str) -> VenueResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| VenueError::Serialization(format!("non-finite {field}: {value}")))
}

fn parse_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|value| value.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now)
}

fn parse_side(raw: &str) -> VenueResult<Side> {
    raw.parse()
        .map_err(|err: String| VenueError::Serialization(err))
}

#[derive(Debug, Deserialize)]
struct PriceData {
    symbol: String,
    bid: f64,
    ask: f64,
    #[serde(default)]
    spread: f64,
    #[serde(default)]
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfoData {
    name: String,
    point: f64,
    digits: u32,
    #[serde(default)]
    spread: f64,
    trade_mode: i64,
    volume_min: f64,
    volume_max: f64,
    volume_step: f64,
    #[serde(default)]
    stops_level: f64,
    #[serde(default)]
    filling_mode: i64,
}

#[derive(Debug, Deserialize)]
struct TradeData {
    ticket: u64,
    #[serde(default)]
    deal: u64,
    price: f64,
    volume: f64,
    #[serde(default)]
    sl: f64,
    #[serde(default)]
    tp: f64,
    retcode: u32,
}

#[derive(Debug, Deserialize)]
struct PositionData {
    ticket: u64,
    symbol: String,
    #[serde(rename = "type")]
    side: String,
    volume: f64,
    price_open: f64,
    price_current: f64,
    profit: f64,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Deserialize)]
pub struct CloseData {
    #[serde(default)]
    pub deal: u64,
    pub price: f64,
    #[serde(default)]
    pub profit: f64,
}

pub fn decode_quote(data: Value) -> VenueResult<VenueQuote> {
    let raw: PriceData = serde_json::from_value(data)
        .map_err(|err| VenueError::Serialization(err.to_string()))?;
    Ok(VenueQuote {
        symbol: raw.symbol,
        bid: to_decimal(raw.bid, "bid")?,
        ask: to_decimal(raw.ask, "ask")?,
        spread: to_decimal(raw.spread, "spread")?,
        time: parse_time(raw.time.as_deref()),
    })
}

pub fn decode_symbol_info(data: Value) -> VenueResult<SymbolInfo> {
    let raw: SymbolInfoData = serde_json::from_value(data)
        .map_err(|err| VenueError::Serialization(err.to_string()))?;
    Ok(SymbolInfo {
        name: raw.name,
        point: to_decimal(raw.point, "point")?,
        digits: raw.digits,
        spread: to_decimal(raw.spread, "spread")?,
        trade_mode: raw.trade_mode,
        volume_min: to_decimal(raw.volume_min, "volume_min")?,
        volume_max: to_decimal(raw.volume_max, "volume_max")?,
        volume_step: to_decimal(raw.volume_step, "volume_step")?,
        stops_level: to_decimal(raw.stops_level, "stops_level")?,
        filling_mode: raw.filling_mode,
    })
}

pub fn decode_receipt(data: Value) -> VenueResult<TradeReceipt> {
    let raw: TradeData = serde_json::from_value(data)
        .map_err(|err| VenueError::Serialization(err.to_string()))?;
    Ok(TradeReceipt {
        ticket: raw.ticket,
        deal: raw.deal,
        price: to_decimal(raw.price, "price")?,
        volume: to_decimal(raw.volume, "volume")?,
        sl: to_decimal(raw.sl, "sl")?,
        tp: to_decimal(raw.tp, "tp")?,
        retcode: raw.retcode,
    })
}

pub fn decode_positions(data: Value) -> VenueResult<Vec<VenuePosition>> {
    let raw: Vec<PositionData> = serde_json::from_value(data)
        .map_err(|err| VenueError::Serialization(err.to_string()))?;
    raw.into_iter()
        .map(|item| {
            Ok(VenuePosition {
                ticket: item.ticket,
                side: parse_side(&item.side)?,
                volume: to_decimal(item.volume, "volume")?,
                symbol: item.symbol,
                price_open: to_decimal(item.price_open, "price_open")?,
                price_current: to_decimal(item.price_current, "price_current")?,
                profit: to_decimal(item.profit, "profit")?,
                comment: item.comment,
            })
        })
        .collect()
}

/// Map a failed reply into a venue error, preferring an embedded retcode so
/// callers can classify transient rejections.
pub fn rejection(reply: &RpcResponse) -> VenueError {
    if let Some(retcode) = reply
        .data
        .as_ref()
        .and_then(|data| data.get("retcode"))
        .and_then(Value::as_u64)
    {
        if retcode != u64::from(bullion_broker::RETCODE_DONE) {
            return VenueError::from_retcode(retcode as u32);
        }
    }
    let message = reply.error.clone().unwrap_or_else(|| "unknown".into());
    // Sidecar error strings embed the retcode as "Code: NNNNN".
    if let Some(code) = extract_retcode(&message) {
        return VenueError::from_retcode(code);
    }
    VenueError::Other(message)
}

fn extract_retcode(message: &str) -> Option<u32> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|chunk| chunk.parse::<u32>().ok())
        .find(|code| (10_000..11_000).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reply_lines() {
        let line = r#"{"requestId": 7, "success": true, "data": {"bid": 1900.0}}"#;
        match parse_line(line) {
            Inbound::Reply(reply) => {
                assert_eq!(reply.request_id, 7);
                assert!(reply.success);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_price_events() {
        let line = r#"{"type": "price_update", "data": {"symbol": "XAUUSD", "bid": 1900.1, "ask": 1900.5, "spread": 40}}"#;
        match parse_line(line) {
            Inbound::PriceUpdate(event) => {
                assert_eq!(event.symbol, "XAUUSD");
                assert!(event.ask > event.bid);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_json_lines_become_noise() {
        assert!(matches!(
            parse_line("Traceback (most recent call last):"),
            Inbound::Noise(_)
        ));
    }

    #[test]
    fn request_line_merges_params() {
        let line = request_line("get_price", 3, json!({"symbol": "XAUUSD"}));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["action"], "get_price");
        assert_eq!(value["requestId"], 3);
        assert_eq!(value["symbol"], "XAUUSD");
    }

    #[test]
    fn rejection_prefers_embedded_retcode() {
        let reply = RpcResponse {
            request_id: 1,
            success: false,
            data: Some(json!({"retcode": 10020})),
            error: Some("Order failed: Prices changed".into()),
        };
        assert!(rejection(&reply).is_transient());
    }

    #[test]
    fn rejection_extracts_retcode_from_message() {
        let reply = RpcResponse {
            request_id: 1,
            success: false,
            data: None,
            error: Some("Order failed: Code: 10019 - no money".into()),
        };
        match rejection(&reply) {
            VenueError::Rejected { retcode, .. } => assert_eq!(retcode, 10_019),
            other => panic!("unexpected {other:?}"),
        }
    }
}
