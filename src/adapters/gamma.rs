//! Gamma REST client: market lookup by slug and settlement lookup by id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;

use crate::domain::{MarketDescriptor, Side};
use crate::error::{PolywatchError, Result};
use crate::strategy::OutcomeLookup;

/// Outcome price above which a side counts as the winner
const RESOLVED_PRICE: f64 = 0.9;

/// Ids arrive as strings or as bare numbers
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("unexpected market id: {}", other))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GammaEvent {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(rename = "conditionId", default)]
    pub condition_id: Option<String>,
    /// Outcome labels as a JSON string, e.g. "[\"Up\", \"Down\"]"
    #[serde(default)]
    pub outcomes: Option<String>,
    /// Outcome prices as a JSON string, e.g. "[\"1\", \"0\"]"
    #[serde(rename = "outcomePrices", default)]
    pub outcome_prices: Option<String>,
    #[serde(rename = "eventStartTime", default)]
    pub event_start_time: Option<String>,
    #[serde(rename = "endDate", default)]
    pub end_date: Option<String>,
    #[serde(rename = "acceptingOrders", default)]
    pub accepting_orders: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
}

impl GammaMarket {
    /// Parse outcome labels from the JSON string
    pub fn outcome_labels(&self) -> Vec<String> {
        self.outcomes
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn is_up_down(&self) -> bool {
        let labels = self.outcome_labels();
        labels.iter().any(|l| l == "Up") && labels.iter().any(|l| l == "Down")
    }

    /// Parse outcome prices from the JSON string. Entries may be strings or
    /// numbers.
    pub fn prices(&self) -> Option<(f64, f64)> {
        let raw: Vec<serde_json::Value> = serde_json::from_str(self.outcome_prices.as_deref()?).ok()?;
        let parse = |v: &serde_json::Value| match v {
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        };
        match raw.as_slice() {
            [up, down, ..] => Some((parse(up)?, parse(down)?)),
            _ => None,
        }
    }

    /// Winning side of a closed market
    pub fn resolved_side(&self) -> Option<Side> {
        if !self.closed.unwrap_or(false) {
            return None;
        }
        let (up, down) = self.prices()?;
        if up > RESOLVED_PRICE {
            Some(Side::Up)
        } else if down > RESOLVED_PRICE {
            Some(Side::Down)
        } else {
            None
        }
    }

    /// Build a descriptor, using the predicted window when the API omits or
    /// garbles the times. `None` when this is not an Up/Down market.
    pub fn to_descriptor(
        &self,
        slug: &str,
        title: Option<&str>,
        predicted_start: DateTime<Utc>,
        predicted_end: DateTime<Utc>,
    ) -> Option<MarketDescriptor> {
        if !self.is_up_down() {
            return None;
        }

        let start = parse_time(self.event_start_time.as_deref()).unwrap_or(predicted_start);
        let end = parse_time(self.end_date.as_deref()).unwrap_or(predicted_end);

        let mut market = MarketDescriptor::new(self.id.clone(), slug, start, end);
        market.condition_id = self.condition_id.clone();
        market.title = self.question.clone().or_else(|| title.map(str::to_string));
        market.accepting_orders = self.accepting_orders.unwrap_or(false);
        Some(market)
    }
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Gamma API client
#[derive(Debug, Clone)]
pub struct GammaClient {
    client: Client,
    base_url: String,
}

impl GammaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PolywatchError::Internal(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// First market of the event with `slug`, if the event exists
    pub async fn fetch_event_market(&self, slug: &str) -> Result<Option<(GammaMarket, Option<String>)>> {
        let url = format!("{}/events", self.base_url);
        let events: Vec<GammaEvent> = self
            .client
            .get(&url)
            .query(&[("slug", slug)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(event) = events.into_iter().next() else {
            debug!("No event for slug {}", slug);
            return Ok(None);
        };
        let title = event.title;
        Ok(event.markets.into_iter().next().map(|m| (m, title)))
    }

    pub async fn fetch_market(&self, market_id: &str) -> Result<GammaMarket> {
        let url = format!("{}/markets/{}", self.base_url, market_id);
        let market = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(market)
    }
}

#[async_trait]
impl OutcomeLookup for GammaClient {
    async fn fetch_outcome(&self, market_id: &str) -> Result<Option<Side>> {
        Ok(self.fetch_market(market_id).await?.resolved_side())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, routing::get, Json, Router};
    use chrono::TimeZone;

    fn market_json(closed: bool, prices: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "512345",
            "question": "Bitcoin Up or Down - July 24, 12:00PM-12:15PM ET",
            "conditionId": "0xabc",
            "outcomes": "[\"Up\", \"Down\"]",
            "outcomePrices": prices,
            "eventStartTime": "2025-07-24T12:00:00Z",
            "endDate": "2025-07-24T12:15:00Z",
            "acceptingOrders": true,
            "closed": closed
        })
    }

    fn parse(value: serde_json::Value) -> GammaMarket {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolved_side() {
        assert_eq!(parse(market_json(true, "[\"1\", \"0\"]")).resolved_side(), Some(Side::Up));
        assert_eq!(parse(market_json(true, "[\"0.02\", \"0.98\"]")).resolved_side(), Some(Side::Down));
        assert_eq!(parse(market_json(true, "[\"0.5\", \"0.5\"]")).resolved_side(), None);
        assert_eq!(parse(market_json(false, "[\"1\", \"0\"]")).resolved_side(), None);
        assert_eq!(parse(market_json(true, "not json")).resolved_side(), None);
        assert_eq!(parse(market_json(true, "[1, 0]")).resolved_side(), Some(Side::Up));
    }

    #[test]
    fn test_numeric_id_and_descriptor() {
        let mut value = market_json(false, "[\"0.5\", \"0.5\"]");
        value["id"] = serde_json::json!(512345);
        let market = parse(value);
        assert_eq!(market.id, "512345");

        let predicted = Utc.with_ymd_and_hms(2025, 7, 24, 11, 0, 0).unwrap();
        let descriptor = market
            .to_descriptor("btc-updown-15m-1753358400", None, predicted, predicted)
            .unwrap();
        assert_eq!(descriptor.start_time, Utc.with_ymd_and_hms(2025, 7, 24, 12, 0, 0).unwrap());
        assert_eq!(descriptor.end_time, Utc.with_ymd_and_hms(2025, 7, 24, 12, 15, 0).unwrap());
        assert!(descriptor.accepting_orders);
        assert_eq!(descriptor.beat_price, None);
    }

    #[test]
    fn test_descriptor_falls_back_to_predicted_window() {
        let mut value = market_json(false, "[]");
        value["eventStartTime"] = serde_json::Value::Null;
        value["endDate"] = serde_json::json!("garbage");
        let market = parse(value);

        let start = Utc.with_ymd_and_hms(2025, 7, 24, 12, 0, 0).unwrap();
        let end = start + chrono::Duration::minutes(15);
        let descriptor = market.to_descriptor("slug", Some("title"), start, end).unwrap();
        assert_eq!((descriptor.start_time, descriptor.end_time), (start, end));
    }

    #[test]
    fn test_non_up_down_market_is_rejected() {
        let mut value = market_json(false, "[]");
        value["outcomes"] = serde_json::json!("[\"Yes\", \"No\"]");
        let start = Utc::now();
        assert!(parse(value).to_descriptor("slug", None, start, start).is_none());
    }

    #[tokio::test]
    async fn test_client_against_local_server() {
        let app = Router::new()
            .route(
                "/events",
                get(|| async {
                    Json(serde_json::json!([
                        {"title": "BTC 15m", "markets": [market_json(false, "[\"0.5\", \"0.5\"]")]}
                    ]))
                }),
            )
            .route(
                "/markets/:id",
                get(|Path(id): Path<String>| async move {
                    let mut m = market_json(true, "[\"0\", \"1\"]");
                    m["id"] = serde_json::json!(id);
                    Json(m)
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = GammaClient::new(&format!("http://{}/", addr), Duration::from_secs(5)).unwrap();

        let (market, title) = client
            .fetch_event_market("btc-updown-15m-1753358400")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.id, "512345");
        assert_eq!(title.as_deref(), Some("BTC 15m"));

        assert_eq!(client.fetch_outcome("777").await.unwrap(), Some(Side::Down));
    }
}
