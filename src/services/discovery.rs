//! Background discovery service: predicts upcoming window slugs, looks them
//! up on Gamma and hands new markets to the supervisor.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use crate::adapters::GammaClient;
use crate::clock::Clock;
use crate::config::DiscoveryConfig;
use crate::domain::MarketDescriptor;
use crate::error::Result;
use crate::strategy::{MarketSupervisor, RecordSink};

/// A window the venue is expected to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictedWindow {
    pub slug: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The window containing `now` followed by the next `lookahead - 1`.
/// Windows are aligned to multiples of `window_minutes` since the epoch.
pub fn predicted_windows(now: DateTime<Utc>, cfg: &DiscoveryConfig) -> Vec<PredictedWindow> {
    let window = i64::from(cfg.window_minutes.max(1)) * 60;
    let boundary = now.timestamp() - now.timestamp().rem_euclid(window);

    (0..i64::from(cfg.lookahead))
        .filter_map(|offset| {
            let start_secs = boundary + offset * window;
            let start = Utc.timestamp_opt(start_secs, 0).single()?;
            Some(PredictedWindow {
                slug: format!("{}-{}", cfg.slug_prefix, start_secs),
                start,
                end: start + ChronoDuration::seconds(window),
            })
        })
        .collect()
}

pub struct DiscoveryService {
    client: GammaClient,
    cfg: DiscoveryConfig,
    clock: Arc<dyn Clock>,
    /// Market ids and slugs already handed out, with the end of their window
    seen: DashMap<String, DateTime<Utc>>,
}

impl DiscoveryService {
    pub fn new(client: GammaClient, cfg: DiscoveryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            cfg,
            clock,
            seen: DashMap::new(),
        }
    }

    pub fn from_config(cfg: DiscoveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = GammaClient::new(
            &cfg.gamma_url,
            Duration::from_secs(cfg.request_timeout_secs),
        )?;
        Ok(Self::new(client, cfg, clock))
    }

    /// Remember markets already logged so a restart does not run them twice
    pub async fn seed_seen(&self, sink: &dyn RecordSink, window: Duration) -> Result<usize> {
        let ids = sink.recent_ids(window).await?;
        let count = ids.len();
        // Only the window running now can list them again
        let expires = self.clock.now() + self.window_width();
        for id in ids {
            self.seen.insert(id, expires);
        }
        if count > 0 {
            info!("Loaded {} already-processed markets", count);
        }
        Ok(count)
    }

    pub fn is_seen(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    fn window_width(&self) -> ChronoDuration {
        ChronoDuration::minutes(i64::from(self.cfg.window_minutes.max(1)))
    }

    /// Forget entries whose window ended over one window width before
    /// `now`. Predictions never reach back that far.
    fn prune_seen(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window_width();
        let before = self.seen.len();
        self.seen.retain(|_, end| *end >= cutoff);
        before - self.seen.len()
    }

    /// One pass over the predicted windows. Returns markets not seen before
    /// and marks them as seen. Lookup failures are logged and retried on the
    /// next pass.
    pub async fn discover(&self) -> Vec<MarketDescriptor> {
        let mut found = Vec::new();
        let now = self.clock.now();

        let pruned = self.prune_seen(now);
        if pruned > 0 {
            debug!("Forgot {} expired market keys", pruned);
        }

        for window in predicted_windows(now, &self.cfg) {
            if self.seen.contains_key(&window.slug) {
                continue;
            }

            let (market, title) = match self.client.fetch_event_market(&window.slug).await {
                Ok(Some(hit)) => hit,
                Ok(None) => {
                    debug!("No market at {}", window.slug);
                    continue;
                }
                Err(e) => {
                    warn!("Error checking {}: {}", window.slug, e);
                    continue;
                }
            };

            if self.seen.contains_key(&market.id) {
                continue;
            }

            let Some(descriptor) =
                market.to_descriptor(&window.slug, title.as_deref(), window.start, window.end)
            else {
                debug!("{} is not an Up/Down market", window.slug);
                continue;
            };

            self.seen.insert(descriptor.id.clone(), window.end);
            self.seen.insert(window.slug.clone(), window.end);
            info!(
                "Discovered: {} | {}-{} UTC | accepting={}",
                descriptor.slug,
                descriptor.start_time.format("%H:%M"),
                descriptor.end_time.format("%H:%M"),
                descriptor.accepting_orders
            );
            found.push(descriptor);
        }

        found
    }

    /// Discover and launch. Returns the number of markets the supervisor
    /// accepted.
    pub async fn run_once(&self, supervisor: &MarketSupervisor) -> usize {
        self.discover()
            .await
            .into_iter()
            .filter(|market| supervisor.launch(market.clone()))
            .count()
    }

    /// Poll until `shutdown` flips to `true`
    pub async fn run_forever(
        &self,
        supervisor: &MarketSupervisor,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "DiscoveryService: starting (interval={}s, prefix={}, lookahead={})",
            self.cfg.poll_interval_secs, self.cfg.slug_prefix, self.cfg.lookahead
        );

        let mut ticker = time::interval(Duration::from_secs(self.cfg.poll_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let launched = self.run_once(supervisor).await;
                    if launched > 0 {
                        debug!("DiscoveryService: launched {} market(s)", launched);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("DiscoveryService: stopping");
                        return;
                    }
                }
            }
        }
    }
}
