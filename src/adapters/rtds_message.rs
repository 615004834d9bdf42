//! Inbound RTDS frame classification.
//!
//! Frames are not uniform: besides the documented
//! `{"topic":..,"type":"update","payload":{"symbol":"btc/usd","timestamp":..,"value":..}}`
//! shape, the stream sends control frames and occasionally flat price objects.
//! Each shape is handled by one extractor rule; rules are tried in order and
//! the first one that claims the frame decides how it is classified.

use serde_json::{Map, Value};

/// Frame types that carry no price
const CONTROL_TYPES: [&str; 5] = ["ping", "pong", "heartbeat", "subscribed", "connected"];

const SYMBOL_FIELDS: [&str; 2] = ["symbol", "asset"];
const VALUE_FIELDS: [&str; 3] = ["value", "price", "p"];
const TIMESTAMP_FIELDS: [&str; 2] = ["timestamp", "t"];

/// Timestamps above this are milliseconds
const MILLIS_THRESHOLD: f64 = 1_000_000_000_000.0;

/// Price extracted from a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTick {
    pub price: f64,
    /// Source timestamp in unix seconds, if the frame carried one
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Control frame; the string is its `type`
    Control(String),
    Price(PriceTick),
    /// Valid JSON that carries nothing usable
    Unusable,
}

/// One way of reading a frame. `None` means the rule does not apply and the
/// next rule should be tried.
type ExtractorRule = fn(&Map<String, Value>, &str) -> Option<Inbound>;

const RULES: [(&str, ExtractorRule); 3] = [
    ("control_frame", control_frame),
    ("nested_payload", nested_payload),
    ("flat_payload", flat_payload),
];

/// Classify a raw text frame for `asset` (e.g. "btc").
///
/// Returns `None` for text that is not a JSON object.
pub fn parse_frame(text: &str, asset: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    Some(classify(obj, asset))
}

/// Apply the extractor rules in priority order
pub fn classify(obj: &Map<String, Value>, asset: &str) -> Inbound {
    RULES
        .iter()
        .find_map(|(_, rule)| rule(obj, asset))
        .unwrap_or(Inbound::Unusable)
}

fn control_frame(obj: &Map<String, Value>, _asset: &str) -> Option<Inbound> {
    let kind = obj.get("type")?.as_str()?;
    CONTROL_TYPES
        .contains(&kind)
        .then(|| Inbound::Control(kind.to_string()))
}

fn nested_payload(obj: &Map<String, Value>, asset: &str) -> Option<Inbound> {
    let payload = obj.get("payload")?.as_object()?;
    if payload.is_empty() {
        return None;
    }
    Some(price_body(payload, asset))
}

fn flat_payload(obj: &Map<String, Value>, asset: &str) -> Option<Inbound> {
    Some(price_body(obj, asset))
}

/// Read a price out of a body that has been chosen by a rule. Once a body is
/// chosen, a missing field makes the frame unusable rather than falling
/// through to the next rule.
fn price_body(body: &Map<String, Value>, asset: &str) -> Inbound {
    match extract_tick(body, asset) {
        Some(tick) => Inbound::Price(tick),
        None => Inbound::Unusable,
    }
}

fn extract_tick(body: &Map<String, Value>, asset: &str) -> Option<PriceTick> {
    let symbol = first_present(body, &SYMBOL_FIELDS).map(symbol_text)?;
    if !symbol.to_lowercase().contains(&asset.to_lowercase()) {
        return None;
    }

    let price = first_present(body, &VALUE_FIELDS).and_then(numeric)?;
    if !price.is_finite() {
        return None;
    }

    Some(PriceTick {
        price,
        timestamp: first_present(body, &TIMESTAMP_FIELDS).and_then(timestamp_secs),
    })
}

/// First alias whose value is present and not null
fn first_present<'a>(body: &'a Map<String, Value>, fields: &[&str]) -> Option<&'a Value> {
    fields
        .iter()
        .filter_map(|f| body.get(*f))
        .find(|v| !v.is_null())
}

fn symbol_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numbers and numeric strings
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn timestamp_secs(value: &Value) -> Option<f64> {
    let ts = value.as_f64()?;
    if !ts.is_finite() || ts <= 0.0 {
        return None;
    }
    Some(if ts > MILLIS_THRESHOLD { ts / 1000.0 } else { ts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_of(text: &str) -> Option<PriceTick> {
        match parse_frame(text, "btc") {
            Some(Inbound::Price(tick)) => Some(tick),
            _ => None,
        }
    }

    #[test]
    fn test_documented_update_frame() {
        let tick = price_of(
            r#"{"topic":"crypto_prices_chainlink","type":"update","timestamp":1753314064237,
                "payload":{"symbol":"btc/usd","timestamp":1753314064213,"value":97000.50}}"#,
        )
        .unwrap();

        assert_eq!(tick.price, 97000.50);
        assert!((tick.timestamp.unwrap() - 1_753_314_064.213).abs() < 1e-6);
    }

    #[test]
    fn test_flat_frame_with_aliases() {
        let tick = price_of(r#"{"asset":"BTC-USD","price":"101234.5","t":1753314064}"#).unwrap();
        assert_eq!(tick.price, 101_234.5);
        assert_eq!(tick.timestamp, Some(1_753_314_064.0));

        let tick = price_of(r#"{"symbol":"btc/usd","p":99000}"#).unwrap();
        assert_eq!(tick.price, 99_000.0);
        assert_eq!(tick.timestamp, None);
    }

    #[test]
    fn test_null_value_falls_through_to_next_alias() {
        let tick = price_of(r#"{"symbol":"btc/usd","value":null,"price":98000}"#).unwrap();
        assert_eq!(tick.price, 98_000.0);
    }

    #[test]
    fn test_control_frames() {
        for kind in CONTROL_TYPES {
            let frame = format!(r#"{{"type":"{kind}","payload":{{"symbol":"btc/usd","value":1}}}}"#);
            assert_eq!(
                parse_frame(&frame, "btc"),
                Some(Inbound::Control(kind.to_string()))
            );
        }
    }

    #[test]
    fn test_unusable_frames() {
        let unusable = [
            r#"{"payload":{"symbol":"eth/usd","value":3500.1}}"#,
            r#"{"payload":{"symbol":"btc/usd"}}"#,
            r#"{"payload":{"symbol":"btc/usd","value":"n/a"}}"#,
            r#"{"payload":{"symbol":"btc/usd","value":[1,2]}}"#,
            r#"{"payload":{"value":97000}}"#,
            r#"{"type":"update"}"#,
        ];
        for text in unusable {
            assert_eq!(parse_frame(text, "btc"), Some(Inbound::Unusable), "{text}");
        }
    }

    #[test]
    fn test_nested_payload_wins_over_flat_fields() {
        // The outer object would parse, but the chosen payload lacks a value
        let text = r#"{"symbol":"btc/usd","value":1.0,"payload":{"symbol":"btc/usd"}}"#;
        assert_eq!(parse_frame(text, "btc"), Some(Inbound::Unusable));
    }

    #[test]
    fn test_empty_payload_uses_flat_rule() {
        let tick = price_of(r#"{"symbol":"btc/usd","value":1.5,"payload":{}}"#).unwrap();
        assert_eq!(tick.price, 1.5);
    }

    #[test]
    fn test_non_positive_timestamp_is_ignored() {
        let tick = price_of(r#"{"symbol":"btc/usd","value":1.5,"timestamp":0}"#).unwrap();
        assert_eq!(tick.timestamp, None);
    }

    #[test]
    fn test_non_json_and_non_object() {
        assert_eq!(parse_frame("PONG", "btc"), None);
        assert_eq!(parse_frame("[1,2,3]", "btc"), None);
        assert_eq!(parse_frame("", "btc"), None);
    }
}
