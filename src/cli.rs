//! Command line interface
//!
//! Output supports two modes: human-readable tables (default) and JSON
//! (`--json`).

use clap::{Parser, Subcommand};
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::domain::{MarketDescriptor, MarketRecord};

#[derive(Parser, Debug)]
#[command(name = "polywatch")]
#[command(version)]
#[command(about = "Read-only monitor for 15-minute BTC Up/Down markets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration directory (default.toml plus $POLYWATCH_ENV overlay)
    #[arg(short, long, default_value = "config", env = "POLYWATCH_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the full monitor (default)
    Run,
    /// Connect to the price stream and print the price every second
    Feed {
        /// How long to watch
        #[arg(long, default_value = "30")]
        secs: u64,
    },
    /// Run one discovery pass and print the markets found
    Discover {
        #[arg(long)]
        json: bool,
    },
    /// Print recent terminal records
    Records {
        /// Look-back window
        #[arg(long, default_value = "24")]
        hours: u64,
        #[arg(long)]
        json: bool,
    },
}

/// Output mode for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Render Tabled + Serialize items in the chosen mode
pub fn render_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<String> {
    match mode {
        OutputMode::Table if items.is_empty() => Ok("(no results)".to_string()),
        OutputMode::Table => Ok(Table::new(items).to_string()),
        OutputMode::Json => Ok(serde_json::to_string_pretty(items)?),
    }
}

pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> anyhow::Result<()> {
    println!("{}", render_items(items, mode)?);
    Ok(())
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn money(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Serialize, Tabled)]
pub struct MarketRow {
    pub id: String,
    pub slug: String,
    pub start: String,
    pub end: String,
    pub accepting: bool,
}

impl From<&MarketDescriptor> for MarketRow {
    fn from(m: &MarketDescriptor) -> Self {
        Self {
            id: m.id.clone(),
            slug: m.slug.clone(),
            start: m.start_time.format("%Y-%m-%d %H:%M").to_string(),
            end: m.end_time.format("%H:%M").to_string(),
            accepting: m.accepting_orders,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct RecordRow {
    pub slug: String,
    pub decision: String,
    pub reason: String,
    pub beat: String,
    pub distance: String,
    pub side: String,
    pub outcome: String,
    pub pnl: String,
    pub logged: String,
}

impl From<&MarketRecord> for RecordRow {
    fn from(r: &MarketRecord) -> Self {
        Self {
            slug: r.market_slug.clone().unwrap_or_else(|| r.market_id.clone()),
            decision: r.decision.to_string(),
            reason: or_dash(r.skip_reason),
            beat: money(r.beat_price),
            distance: money(r.distance_at_decision.or(r.distance_at_t14_31)),
            side: or_dash(r.would_buy),
            outcome: or_dash(r.actual_outcome),
            pnl: money(r.theoretical_pnl),
            logged: or_dash(r.logged_at.map(|t| t.format("%Y-%m-%d %H:%M:%S"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decision, Side, SkipReason};
    use chrono::{TimeZone, Utc};

    fn market() -> MarketDescriptor {
        let start = Utc.with_ymd_and_hms(2025, 7, 24, 12, 0, 0).unwrap();
        MarketDescriptor::new("512345", "btc-updown-15m-1753358400", start, start + chrono::Duration::minutes(15))
    }

    #[test]
    fn test_parse_defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["polywatch"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, "config");
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["polywatch", "--config", "/etc/pw", "records", "--hours", "6", "--json"]).unwrap();
        assert_eq!(cli.config, "/etc/pw");
        assert!(matches!(cli.command, Some(Commands::Records { hours: 6, json: true })));

        let cli = Cli::try_parse_from(["polywatch", "feed", "--secs", "5"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Feed { secs: 5 })));
    }

    #[test]
    fn test_record_rows() {
        let skip = MarketRecord::skipped(&market(), SkipReason::DistanceTooLarge);
        let row = RecordRow::from(&skip);
        assert_eq!(row.decision, "SKIP");
        assert_eq!(row.reason, "distance_too_large");
        assert_eq!(row.side, "-");

        let mut active = MarketRecord::for_market(&market(), Decision::Active);
        active.would_buy = Some(Side::Up);
        active.theoretical_pnl = Some(100.0);
        let row = RecordRow::from(&active);
        assert_eq!(row.side, "Up");
        assert_eq!(row.pnl, "100.00");
    }

    #[test]
    fn test_render_modes() {
        let rows = vec![MarketRow::from(&market())];
        let table = render_items(&rows, OutputMode::Table).unwrap();
        assert!(table.contains("btc-updown-15m-1753358400"));

        let json = render_items(&rows, OutputMode::Json).unwrap();
        assert!(json.contains("\"accepting\": false"));

        let empty: Vec<MarketRow> = Vec::new();
        assert_eq!(render_items(&empty, OutputMode::Table).unwrap(), "(no results)");
    }
}
