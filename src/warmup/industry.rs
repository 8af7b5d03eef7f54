//! Industry overview precompute.
//!
//! For each time window (5D/20D/60D) and each industry, compute the window
//! return and a spark-line series over member close histories, then publish
//! to the cache. A minimum reseed interval persisted in L2 under
//! `industry_warming:last_time` keeps restarts inside the window from
//! redoing the work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapters::classify_status;
use crate::cache::{keys, Category};
use crate::errors::{AdapterError, FetchResult};
use crate::fetcher::DataFetcher;
use crate::models::Interval;

/// L2 key gating reseeds across restarts.
pub const LAST_RUN_KEY: &str = "industry_warming:last_time";
/// Trailing-day windows the overview is computed for.
pub const WINDOWS: &[usize] = &[5, 20, 60];

const BOARD_LIST_URL: &str = "https://push2.eastmoney.com/api/qt/clist/get";

/// One industry and its member symbols.
#[derive(Debug, Clone)]
pub struct Industry {
    pub code: String,
    pub name: String,
    pub members: Vec<String>,
}

/// Where industries and their members come from.
#[async_trait]
pub trait IndustrySource: Send + Sync {
    async fn industries(&self) -> Result<Vec<Industry>, AdapterError>;
}

/// Eastmoney industry boards (`m:90 t:2`) with members per board.
pub struct EastmoneyIndustrySource {
    http: reqwest::Client,
    /// Bound on boards fetched per run to stay under upstream rate limits.
    max_boards: usize,
}

impl EastmoneyIndustrySource {
    pub fn new(http: reqwest::Client, max_boards: usize) -> Self {
        Self { http, max_boards }
    }

    async fn get_json(&self, query: &[(&str, String)]) -> Result<Value, AdapterError> {
        let resp = self.http.get(BOARD_LIST_URL).query(query).send().await?;
        if let Some(err) = classify_status(&resp) {
            return Err(err);
        }
        resp.json::<Value>()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))
    }
}

pub(crate) fn parse_board_list(payload: &Value) -> Vec<(String, String)> {
    payload
        .pointer("/data/diff")
        .and_then(|d| d.as_array())
        .map(|diff| {
            diff.iter()
                .filter_map(|item| {
                    let code = item.get("f12")?.as_str()?;
                    let name = item.get("f14")?.as_str()?;
                    Some((code.to_string(), name.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_board_members(payload: &Value) -> Vec<String> {
    payload
        .pointer("/data/diff")
        .and_then(|d| d.as_array())
        .map(|diff| {
            diff.iter()
                .filter_map(|item| {
                    let code = item.get("f12")?.as_str()?;
                    let exchange = match item.get("f13").and_then(Value::as_i64) {
                        Some(1) => "SH",
                        _ => match code.as_bytes().first() {
                            Some(b'4') | Some(b'8') => "BJ",
                            _ => "SZ",
                        },
                    };
                    Some(format!("{code}.{exchange}"))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl IndustrySource for EastmoneyIndustrySource {
    async fn industries(&self) -> Result<Vec<Industry>, AdapterError> {
        let boards_payload = self
            .get_json(&[
                ("pn", "1".to_string()),
                ("pz", "500".to_string()),
                ("fltt", "2".to_string()),
                ("fs", "m:90+t:2".to_string()),
                ("fields", "f12,f14".to_string()),
            ])
            .await?;
        let boards = parse_board_list(&boards_payload);

        let mut industries = Vec::new();
        for (code, name) in boards.into_iter().take(self.max_boards) {
            let members_payload = self
                .get_json(&[
                    ("pn", "1".to_string()),
                    ("pz", "500".to_string()),
                    ("fltt", "2".to_string()),
                    ("fs", format!("b:{code}")),
                    ("fields", "f12,f13".to_string()),
                ])
                .await?;
            industries.push(Industry {
                code,
                name,
                members: parse_board_members(&members_payload),
            });
        }
        Ok(industries)
    }
}

/// Published overview entry, one per industry per window.
#[derive(Debug, Clone, Serialize)]
pub struct IndustryOverview {
    pub code: String,
    pub name: String,
    pub window_days: usize,
    /// Mean member return over the window, as a percentage.
    pub window_return_pct: Option<f64>,
    /// Per-day mean close across members, oldest first.
    pub spark: Vec<f64>,
    pub members: usize,
}

/// Mean-close series and window return over member histories.
pub(crate) fn overview_for(
    industry: &Industry,
    window: usize,
    histories: &[Vec<f64>],
) -> IndustryOverview {
    // Align member series on the tail of the window.
    let series: Vec<&[f64]> = histories
        .iter()
        .filter(|h| h.len() >= 2)
        .map(|h| &h[h.len().saturating_sub(window)..])
        .collect();

    let depth = series.iter().map(|s| s.len()).min().unwrap_or(0);
    let mut spark = Vec::with_capacity(depth);
    for day in 0..depth {
        let sum: f64 = series.iter().map(|s| s[s.len() - depth + day]).sum();
        spark.push(sum / series.len() as f64);
    }

    let window_return_pct = match (spark.first(), spark.last()) {
        (Some(first), Some(last)) if *first > 0.0 && depth >= 2 => {
            Some((last - first) / first * 100.0)
        }
        _ => None,
    };

    IndustryOverview {
        code: industry.code.clone(),
        name: industry.name.clone(),
        window_days: window,
        window_return_pct,
        spark,
        members: histories.len(),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndustryWarmStats {
    pub industries: usize,
    pub published: usize,
    pub skipped: bool,
}

/// Run the precompute unless a run finished inside the reseed window.
pub async fn warm_industries(
    fetcher: &DataFetcher,
    source: &Arc<dyn IndustrySource>,
    min_reseed: Duration,
    now: DateTime<Utc>,
) -> FetchResult<IndustryWarmStats> {
    // Gate on the L2 marker; fall back to store bookkeeping when L2 is out.
    let last_run = match fetcher.cache().l2().get(LAST_RUN_KEY).await {
        Ok(Some(raw)) => DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Ok(None) => None,
        Err(_) => fetcher.store().last_job_finish("industry_warming").await?,
    };
    if let Some(last) = last_run {
        // A marker in the future (clock skew) also counts as inside the
        // window; reseeding early is the risky direction.
        let elapsed = now.signed_duration_since(last);
        if elapsed.num_seconds() < min_reseed.as_secs() as i64 {
            info!(last_run = %last, "industry warming inside reseed window, skipping");
            return Ok(IndustryWarmStats {
                skipped: true,
                ..Default::default()
            });
        }
    }

    fetcher.store().job_started("industry_warming").await?;

    let industries = match source.industries().await {
        Ok(industries) => industries,
        Err(e) => {
            warn!(error = %e, "industry source unavailable");
            return Ok(IndustryWarmStats::default());
        }
    };

    let mut stats = IndustryWarmStats {
        industries: industries.len(),
        ..Default::default()
    };

    for industry in &industries {
        // Member close histories from the store; fetch misses through the
        // coordinator so the next run hits the store.
        let mut histories: Vec<Vec<f64>> = Vec::with_capacity(industry.members.len());
        for member in &industry.members {
            let rows = match fetcher.get_ohlcv(member, Interval::Daily, None).await {
                Ok(rows) => rows,
                Err(e) => {
                    debug!(member, error = %e, "member history unavailable");
                    continue;
                }
            };
            if !rows.is_empty() {
                histories.push(rows.iter().map(|r| r.close).collect());
            }
        }

        for &window in WINDOWS {
            let overview = overview_for(industry, window, &histories);
            let key = keys::build(
                keys::prefix::MARKET_METRICS,
                &format!("industry:{}", industry.code),
                Some(&format!("{window}d")),
                None,
            );
            fetcher
                .cache()
                .set_json(Category::MarketMetrics, &key, &overview)
                .await;
            stats.published += 1;
        }
    }

    // Persist the reseed marker with headroom so the gate outlives the window.
    let marker_ttl = min_reseed * 4;
    let _ = fetcher
        .cache()
        .l2()
        .set_ex(LAST_RUN_KEY, &now.to_rfc3339(), marker_ttl)
        .await;
    fetcher
        .store()
        .job_finished("industry_warming", Some(format!("{} industries", stats.industries)))
        .await?;

    info!(
        industries = stats.industries,
        published = stats.published,
        "industry overview warmed"
    );
    Ok(stats)
}
