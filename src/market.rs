//! Day-ahead market price source
//!
//! Fetches settlement prices (PLN/MWh) from the PSE market data API and keeps
//! them indexed by period start. A failed or malformed fetch collapses to an
//! empty sequence: downstream price generation simply skips the periods it
//! cannot resolve, so the distinction between "no data" and "fetch failed"
//! never matters here.

use crate::config::MarketConfig;
use crate::error::Result;
use crate::logging::get_logger;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// One market price period
#[derive(Debug, Clone, PartialEq)]
pub struct MarketPrice {
    /// Start of the price period
    pub starts_at: DateTime<Utc>,

    /// Price in PLN per MWh
    pub price_mwh: f64,
}

/// Market prices indexed by period start
#[derive(Debug, Default)]
pub struct MarketPrices {
    by_time: BTreeMap<DateTime<Utc>, f64>,
}

impl MarketPrices {
    /// Build an index from a price sequence
    pub fn from_points(points: Vec<MarketPrice>) -> Self {
        let mut by_time = BTreeMap::new();
        for point in points {
            by_time.insert(point.starts_at, point.price_mwh);
        }
        Self { by_time }
    }

    /// Resolve the price for a timestamp: exact period match first, then the
    /// enclosing hour (covers sources publishing at hourly resolution)
    pub fn resolve(&self, ts: DateTime<Utc>) -> Option<f64> {
        if let Some(price) = self.by_time.get(&ts) {
            return Some(*price);
        }
        let hour_ts = ts.timestamp() - ts.timestamp().rem_euclid(3600);
        let hour = DateTime::from_timestamp(hour_ts, 0)?;
        self.by_time.get(&hour).copied()
    }

    /// Start of the most recent known period
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.by_time.keys().next_back().copied()
    }

    /// Whether any price is known
    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }

    /// Number of known periods
    pub fn len(&self) -> usize {
        self.by_time.len()
    }
}

/// Client for the PSE settlement price API
pub struct MarketClient {
    client: reqwest::Client,
    base_url: String,
    tz: Tz,
    logger: crate::logging::StructuredLogger,
}

impl MarketClient {
    /// Create a new market price client
    pub fn new(config: &MarketConfig, tz: Tz) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            tz,
            logger: get_logger("market"),
        })
    }

    /// Fetch prices for the inclusive date range; empty on any failure
    pub async fn fetch_range(&self, from: NaiveDate, to: NaiveDate) -> MarketPrices {
        let url = format!(
            "{}?$filter=business_date ge '{}' and business_date le '{}'&$first=20000",
            self.base_url, from, to
        );

        let body = match self.get_json(&url).await {
            Ok(body) => body,
            Err(e) => {
                self.logger
                    .warn(&format!("Market price fetch failed: {}", e));
                return MarketPrices::default();
            }
        };

        let entries = body
            .get("value")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut points: Vec<MarketPrice> = Vec::with_capacity(entries.len());
        for entry in &entries {
            let Some(raw_time) = entry.get("dtime").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(price) = entry.get("rce_pln").and_then(|v| v.as_f64()) else {
                continue;
            };
            let Some(starts_at) = self.parse_period_start(raw_time) else {
                self.logger
                    .debug(&format!("Skipping unparseable price period {}", raw_time));
                continue;
            };
            points.push(MarketPrice {
                starts_at,
                price_mwh: price,
            });
        }
        points.sort_by_key(|p| p.starts_at);

        self.logger.debug(&format!(
            "Fetched {} market price periods for {}..{}",
            points.len(),
            from,
            to
        ));
        MarketPrices::from_points(points)
    }

    /// Parse a local "YYYY-MM-DD HH:MM" period-end stamp into a UTC period
    /// start (the API marks each 15-minute period by its end).
    fn parse_period_start(&self, raw: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M")
            .or_else(|_| NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S"))
            .ok()?;
        let local = self.tz.from_local_datetime(&naive).earliest()?;
        Some(local.with_timezone(&Utc) - Duration::minutes(15))
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self.client.get(url).send().await?;
        let body = resp.error_for_status()?.json::<serde_json::Value>().await?;
        Ok(body)
    }
}
