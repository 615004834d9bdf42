use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::domain::{Decision, MarketRecord, Side, SkipReason, TrackingSample};
use crate::error::{PolywatchError, Result};
use crate::strategy::RecordSink;

const RECORD_COLUMNS: &str = r#"
    market_id, market_slug, start_time, end_time, beat_price, price_before_beat,
    price_after_beat, decision, skip_reason, price_at_t14_31, price_at_t14_45,
    price_at_t14_55, price_at_t14_58, price_at_t14_59, current_price,
    distance_at_t14_31, distance_at_decision, would_buy, actual_outcome,
    would_have_won, theoretical_pnl, simulated_shares, buy_price, price_samples,
    logged_at
"#;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a record, or merge it into the stored one. Every column keeps
    /// its stored value when the new record leaves it empty.
    #[instrument(skip(self, record), fields(market_id = %record.market_id))]
    pub async fn upsert_record(&self, record: &MarketRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO market_records (
                market_id, market_slug, start_time, end_time, beat_price, price_before_beat,
                price_after_beat, decision, skip_reason, price_at_t14_31, price_at_t14_45,
                price_at_t14_55, price_at_t14_58, price_at_t14_59, current_price,
                distance_at_t14_31, distance_at_decision, would_buy, actual_outcome,
                would_have_won, theoretical_pnl, simulated_shares, buy_price, price_samples
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (market_id) DO UPDATE SET
                market_slug = COALESCE(EXCLUDED.market_slug, market_records.market_slug),
                start_time = COALESCE(EXCLUDED.start_time, market_records.start_time),
                end_time = COALESCE(EXCLUDED.end_time, market_records.end_time),
                beat_price = COALESCE(EXCLUDED.beat_price, market_records.beat_price),
                price_before_beat = COALESCE(EXCLUDED.price_before_beat, market_records.price_before_beat),
                price_after_beat = COALESCE(EXCLUDED.price_after_beat, market_records.price_after_beat),
                decision = COALESCE(EXCLUDED.decision, market_records.decision),
                skip_reason = COALESCE(EXCLUDED.skip_reason, market_records.skip_reason),
                price_at_t14_31 = COALESCE(EXCLUDED.price_at_t14_31, market_records.price_at_t14_31),
                price_at_t14_45 = COALESCE(EXCLUDED.price_at_t14_45, market_records.price_at_t14_45),
                price_at_t14_55 = COALESCE(EXCLUDED.price_at_t14_55, market_records.price_at_t14_55),
                price_at_t14_58 = COALESCE(EXCLUDED.price_at_t14_58, market_records.price_at_t14_58),
                price_at_t14_59 = COALESCE(EXCLUDED.price_at_t14_59, market_records.price_at_t14_59),
                current_price = COALESCE(EXCLUDED.current_price, market_records.current_price),
                distance_at_t14_31 = COALESCE(EXCLUDED.distance_at_t14_31, market_records.distance_at_t14_31),
                distance_at_decision = COALESCE(EXCLUDED.distance_at_decision, market_records.distance_at_decision),
                would_buy = COALESCE(EXCLUDED.would_buy, market_records.would_buy),
                actual_outcome = COALESCE(EXCLUDED.actual_outcome, market_records.actual_outcome),
                would_have_won = COALESCE(EXCLUDED.would_have_won, market_records.would_have_won),
                theoretical_pnl = COALESCE(EXCLUDED.theoretical_pnl, market_records.theoretical_pnl),
                simulated_shares = COALESCE(EXCLUDED.simulated_shares, market_records.simulated_shares),
                buy_price = COALESCE(EXCLUDED.buy_price, market_records.buy_price),
                price_samples = COALESCE(EXCLUDED.price_samples, market_records.price_samples)
            "#,
        )
        .bind(&record.market_id)
        .bind(&record.market_slug)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.beat_price)
        .bind(record.price_before_beat)
        .bind(record.price_after_beat)
        .bind(record.decision.as_str())
        .bind(record.skip_reason.map(|r| r.as_str()))
        .bind(record.price_at_t14_31)
        .bind(record.price_at_t14_45)
        .bind(record.price_at_t14_55)
        .bind(record.price_at_t14_58)
        .bind(record.price_at_t14_59)
        .bind(record.current_price)
        .bind(record.distance_at_t14_31)
        .bind(record.distance_at_decision)
        .bind(record.would_buy.map(|s| s.as_str()))
        .bind(record.actual_outcome.map(|s| s.as_str()))
        .bind(record.would_have_won)
        .bind(record.theoretical_pnl)
        .bind(record.simulated_shares)
        .bind(record.buy_price)
        .bind(record.price_samples.as_ref().map(Json))
        .execute(&self.pool)
        .await?;

        debug!("Upserted market record");
        Ok(())
    }

    pub async fn get_record(&self, market_id: &str) -> Result<Option<MarketRecord>> {
        let sql = format!("SELECT {} FROM market_records WHERE market_id = $1", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn recent_market_ids(&self, since: DateTime<Utc>) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT market_id FROM market_records WHERE logged_at >= $1")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("market_id").map_err(Into::into))
            .collect()
    }

    pub async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<MarketRecord>> {
        let sql = format!(
            "SELECT {} FROM market_records WHERE logged_at >= $1 ORDER BY logged_at DESC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }
}

fn since(window: Duration) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::zero())
}

/// Text column holding one of the domain codes
fn parse_code<T>(
    value: Option<String>,
    parse: impl Fn(&str) -> std::result::Result<T, String>,
) -> Result<Option<T>> {
    value
        .map(|v| parse(&v).map_err(PolywatchError::InvalidMarketData))
        .transpose()
}

fn row_to_record(row: &PgRow) -> Result<MarketRecord> {
    let decision: String = row.try_get("decision")?;
    let samples: Option<Json<Vec<TrackingSample>>> = row.try_get("price_samples")?;

    Ok(MarketRecord {
        market_id: row.try_get("market_id")?,
        market_slug: row.try_get("market_slug")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        beat_price: row.try_get("beat_price")?,
        price_before_beat: row.try_get("price_before_beat")?,
        price_after_beat: row.try_get("price_after_beat")?,
        decision: Decision::try_from(decision.as_str()).map_err(PolywatchError::InvalidMarketData)?,
        skip_reason: parse_code(row.try_get("skip_reason")?, |s| SkipReason::try_from(s))?,
        price_at_t14_31: row.try_get("price_at_t14_31")?,
        price_at_t14_45: row.try_get("price_at_t14_45")?,
        price_at_t14_55: row.try_get("price_at_t14_55")?,
        price_at_t14_58: row.try_get("price_at_t14_58")?,
        price_at_t14_59: row.try_get("price_at_t14_59")?,
        current_price: row.try_get("current_price")?,
        distance_at_t14_31: row.try_get("distance_at_t14_31")?,
        distance_at_decision: row.try_get("distance_at_decision")?,
        would_buy: parse_code(row.try_get("would_buy")?, |s| Side::try_from(s))?,
        actual_outcome: parse_code(row.try_get("actual_outcome")?, |s| Side::try_from(s))?,
        would_have_won: row.try_get("would_have_won")?,
        theoretical_pnl: row.try_get("theoretical_pnl")?,
        simulated_shares: row.try_get("simulated_shares")?,
        buy_price: row.try_get("buy_price")?,
        price_samples: samples.map(|s| s.0),
        logged_at: row.try_get("logged_at")?,
    })
}

#[async_trait]
impl RecordSink for PostgresStore {
    async fn upsert(&self, record: &MarketRecord) -> Result<()> {
        self.upsert_record(record).await
    }

    async fn recent_ids(&self, window: Duration) -> Result<HashSet<String>> {
        self.recent_market_ids(since(window)).await
    }

    async fn recent_records(&self, window: Duration) -> Result<Vec<MarketRecord>> {
        self.records_since(since(window)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MarketDescriptor;
    use chrono::{TimeZone, Utc};

    // Requires a database:
    // DATABASE_URL=postgresql://localhost/polywatch_test cargo test -- --ignored

    fn market(id: &str) -> MarketDescriptor {
        let start = Utc.with_ymd_and_hms(2025, 7, 24, 12, 0, 0).unwrap();
        MarketDescriptor::new(id, "btc-updown-15m-1753358400", start, start + ChronoDuration::minutes(15))
    }

    async fn store() -> PostgresStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/polywatch_test".to_string());
        let store = PostgresStore::new(&url, 2).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_partial_upsert_keeps_stored_columns() {
        let store = store().await;
        let id = format!("pg-merge-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let m = market(&id);

        let mut full = MarketRecord::for_market(&m, Decision::Active);
        full.beat_price = Some(100_000.0);
        full.would_buy = Some(Side::Up);
        full.price_at_t14_59 = Some(100_200.0);
        full.distance_at_decision = Some(200.0);
        full.simulated_shares = Some(10_000);
        full.buy_price = Some(0.99);
        full.price_samples = Some(vec![TrackingSample {
            tick: 0,
            timestamp: m.start_time + ChronoDuration::seconds(14 * 60 + 31),
            price: 100_100.0,
            distance: 100.0,
            side: Side::Up,
        }]);
        store.upsert_record(&full).await.unwrap();

        // Settlement fills in the outcome only
        let mut partial = MarketRecord::for_market(&m, Decision::Active);
        partial.actual_outcome = Some(Side::Up);
        partial.would_have_won = Some(true);
        partial.theoretical_pnl = Some(100.0);
        store.upsert_record(&partial).await.unwrap();

        let stored = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(stored.decision, Decision::Active);
        assert_eq!(stored.beat_price, Some(100_000.0));
        assert_eq!(stored.would_buy, Some(Side::Up));
        assert_eq!(stored.price_at_t14_59, Some(100_200.0));
        assert_eq!(stored.distance_at_decision, Some(200.0));
        assert_eq!(stored.price_samples.as_ref().map(Vec::len), Some(1));
        assert_eq!(stored.actual_outcome, Some(Side::Up));
        assert_eq!(stored.would_have_won, Some(true));
        assert_eq!(stored.theoretical_pnl, Some(100.0));
        assert!(stored.logged_at.is_some());

        assert!(store.recent_ids(Duration::from_secs(3600)).await.unwrap().contains(&id));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_skip_reason_round_trips_through_text_column() {
        let store = store().await;
        let id = format!("pg-skip-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());

        store
            .upsert_record(&MarketRecord::skipped(&market(&id), SkipReason::UnstableDuringTracking))
            .await
            .unwrap();

        let stored = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(stored.decision, Decision::Skip);
        assert_eq!(stored.skip_reason, Some(SkipReason::UnstableDuringTracking));
        assert!(store.get_record("pg-missing").await.unwrap().is_none());
    }
}
