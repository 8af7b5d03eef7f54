//! Per-topic stream workers.
//!
//! At most one worker runs per active topic. A worker wakes on its topic's
//! cadence, pulls the latest view through the fetch coordinator, diffs the
//! salient fields against the last push and fans changed snapshots out via
//! the connection manager. A topic whose subscriber set stays empty beyond
//! a grace window stops its worker; resubscribing inside the window keeps
//! it alive.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fetcher::DataFetcher;
use crate::models::Market;
use crate::ws::connection::ConnectionManager;
use crate::ws::protocol::{ServerFrame, Topic};

/// How long a worker survives with zero subscribers.
pub const EMPTY_GRACE: Duration = Duration::from_secs(300);
/// Subscriber-count poll cadence inside workers with long tick intervals.
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Worker {
    handle: JoinHandle<()>,
}

pub struct StreamService {
    connections: Arc<ConnectionManager>,
    fetcher: Arc<DataFetcher>,
    workers: Mutex<HashMap<String, Worker>>,
    grace: Duration,
}

impl std::fmt::Debug for StreamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamService")
            .field("active_workers", &self.workers.lock().len())
            .finish()
    }
}

impl StreamService {
    pub fn new(connections: Arc<ConnectionManager>, fetcher: Arc<DataFetcher>) -> Self {
        Self {
            connections,
            fetcher,
            workers: Mutex::new(HashMap::new()),
            grace: EMPTY_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn active_workers(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|_, w| !w.handle.is_finished());
        workers.len()
    }

    /// Lazily start the worker for a topic; called on every subscribe.
    pub fn ensure_worker(self: &Arc<Self>, topic_str: &str) {
        let Some(topic) = Topic::parse(topic_str) else {
            return;
        };

        let mut workers = self.workers.lock();
        workers.retain(|_, w| !w.handle.is_finished());
        if workers.contains_key(topic_str) {
            return;
        }

        let service = self.clone();
        let key = topic_str.to_string();
        let handle = tokio::spawn(async move {
            service.run_worker(topic).await;
            service.workers.lock().remove(&key);
        });
        workers.insert(topic_str.to_string(), Worker { handle });
        info!(topic = topic_str, "stream worker started");
    }

    /// Cancel every worker and wait for them to wind down.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, Worker)> = self.workers.lock().drain().collect();
        for (topic, worker) in workers {
            worker.handle.abort();
            let _ = worker.handle.await;
            debug!(topic, "stream worker stopped");
        }
    }

    async fn run_worker(&self, topic: Topic) {
        let topic_str = topic.to_string();
        let tick = Duration::from_secs(topic.tick_seconds());

        let mut data_tick = tokio::time::interval(tick.min(Duration::from_secs(86_400)));
        data_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_TICK.min(self.grace / 2).max(Duration::from_millis(10)));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_pushed: Option<Value> = None;
        let mut empty_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = data_tick.tick() => {
                    if self.connections.subscriber_count(&topic_str) == 0 {
                        continue;
                    }
                    match self.snapshot(&topic).await {
                        Some(data) => {
                            if last_pushed.as_ref().is_some_and(|prev| !salient_changed(prev, &data)) {
                                continue;
                            }
                            let frame = ServerFrame::Data {
                                topic: topic_str.clone(),
                                data: data.clone(),
                                timestamp: Utc::now().to_rfc3339(),
                            };
                            let delivered = self.connections.broadcast(&topic_str, &frame).await;
                            debug!(topic = %topic_str, delivered, "pushed stream update");
                            last_pushed = Some(data);
                        }
                        None => {
                            debug!(topic = %topic_str, "no snapshot available this tick");
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    if self.connections.subscriber_count(&topic_str) == 0 {
                        let since = empty_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= self.grace {
                            info!(topic = %topic_str, "no subscribers past grace window, stopping worker");
                            return;
                        }
                    } else {
                        empty_since = None;
                    }
                }
            }
        }
    }

    /// Latest view for the topic, shaped for the `data` frame payload.
    async fn snapshot(&self, topic: &Topic) -> Option<Value> {
        match topic {
            Topic::Quote {
                symbol, interval, ..
            } => {
                let rows = match self
                    .fetcher
                    .get_ohlcv(symbol, interval.fetch_interval(), None)
                    .await
                {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "stream snapshot fetch failed");
                        return None;
                    }
                };
                let last = rows.last()?;
                Some(json!({
                    "symbol": last.symbol,
                    "price": last.close,
                    "open": last.open,
                    "high": last.high,
                    "low": last.low,
                    "volume": last.volume,
                    "pct_chg": last.pct_chg,
                    "timestamp": last.trade_date,
                }))
            }
            Topic::MarketSummary { market } => {
                let market = Market::parse(market)?;
                let symbols = match self.fetcher.get_symbol_list(market).await {
                    Ok(symbols) => symbols,
                    Err(e) => {
                        warn!(market = %market, error = %e, "market summary fetch failed");
                        return None;
                    }
                };
                let latest_refresh = symbols.iter().map(|s| s.last_updated).max();
                Some(json!({
                    "market": market.as_str(),
                    "symbol_count": symbols.len(),
                    "timestamp": latest_refresh.map(|t| t.to_rfc3339()),
                }))
            }
        }
    }
}

/// Push-worthiness: compare the salient fields only, so cosmetic payload
/// differences do not spam subscribers.
fn salient_changed(prev: &Value, next: &Value) -> bool {
    for field in ["price", "volume", "timestamp", "symbol_count"] {
        if prev.get(field) != next.get(field) {
            return true;
        }
    }
    false
}
