//! Public holiday lookup for weekend-substitution tariffs
//!
//! Holiday-aware tariffs treat public holidays like weekends. Lists are
//! fetched per year through a [`HolidayProvider`] and cached for the lifetime
//! of the process; a failed fetch caches an empty list so a flaky source
//! cannot cause a retry storm, and callers simply see "not a holiday".

use crate::config::HolidayConfig;
use crate::error::Result;
use crate::logging::get_logger;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;

/// Source of the holiday list for one year
#[async_trait]
pub trait HolidayProvider: Send + Sync {
    /// Fetch all public holidays of the given year
    async fn fetch(&self, year: i32) -> Result<Vec<NaiveDate>>;
}

/// Client for the Nager.Date public holiday API
pub struct NagerClient {
    client: reqwest::Client,
    base_url: String,
    country: String,
}

impl NagerClient {
    /// Create a new client
    pub fn new(base_url: &str, country: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            country: country.to_string(),
        })
    }
}

#[async_trait]
impl HolidayProvider for NagerClient {
    async fn fetch(&self, year: i32) -> Result<Vec<NaiveDate>> {
        let url = format!(
            "{}/api/v3/PublicHolidays/{}/{}",
            self.base_url, year, self.country
        );
        let resp = self.client.get(&url).send().await?;
        let entries: Vec<serde_json::Value> = resp.error_for_status()?.json().await?;

        let mut dates = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(raw) = entry.get("date").and_then(|v| v.as_str())
                && let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }
}

/// Fixed holiday list taken from the configuration file
pub struct FixedHolidayProvider {
    dates: Vec<NaiveDate>,
}

impl FixedHolidayProvider {
    /// Create a provider serving the given dates
    pub fn new(mut dates: Vec<NaiveDate>) -> Self {
        dates.sort();
        Self { dates }
    }
}

#[async_trait]
impl HolidayProvider for FixedHolidayProvider {
    async fn fetch(&self, year: i32) -> Result<Vec<NaiveDate>> {
        Ok(self
            .dates
            .iter()
            .copied()
            .filter(|d| d.year() == year)
            .collect())
    }
}

/// Build the provider selected by the configuration
pub fn build_provider(config: &HolidayConfig) -> Result<Box<dyn HolidayProvider>> {
    match config {
        HolidayConfig::Api { base_url, country } => {
            Ok(Box::new(NagerClient::new(base_url, country)?))
        }
        HolidayConfig::Fixed { dates } => Ok(Box::new(FixedHolidayProvider::new(dates.clone()))),
    }
}

/// Per-year holiday cache; a year is fetched at most once
pub struct HolidayCache {
    provider: Box<dyn HolidayProvider>,
    years: HashMap<i32, Vec<NaiveDate>>,
    logger: crate::logging::StructuredLogger,
}

impl HolidayCache {
    /// Create a new cache over the given provider
    pub fn new(provider: Box<dyn HolidayProvider>) -> Self {
        Self {
            provider,
            years: HashMap::new(),
            logger: get_logger("holidays"),
        }
    }

    /// Whether the given calendar day is a public holiday.
    ///
    /// Loads the year's list on first use; a fetch failure caches an empty
    /// list so the year is never retried.
    pub async fn is_holiday(&mut self, date: NaiveDate) -> bool {
        let year = date.year();
        if !self.years.contains_key(&year) {
            let list = match self.provider.fetch(year).await {
                Ok(list) => {
                    self.logger
                        .info(&format!("Loaded {} holidays for {}", list.len(), year));
                    list
                }
                Err(e) => {
                    self.logger.warn(&format!(
                        "Holiday fetch for {} failed, assuming none: {}",
                        year, e
                    ));
                    Vec::new()
                }
            };
            self.years.insert(year, list);
        }

        self.years
            .get(&year)
            .map(|list| list.binary_search(&date).is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GridfluxError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: std::sync::Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl HolidayProvider for CountingProvider {
        async fn fetch(&self, year: i32) -> Result<Vec<NaiveDate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GridfluxError::api("holiday source down"));
            }
            Ok(vec![
                NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(year, 5, 1).unwrap(),
            ])
        }
    }

    #[tokio::test]
    async fn year_is_fetched_once() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let mut cache = HolidayCache::new(Box::new(CountingProvider {
            calls: calls.clone(),
            fail: false,
        }));

        assert!(
            cache
                .is_holiday(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
                .await
        );
        assert!(
            !cache
                .is_holiday(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
                .await
        );
        assert!(
            cache
                .is_holiday(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap())
                .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_terminal_for_the_year() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let mut cache = HolidayCache::new(Box::new(CountingProvider {
            calls: calls.clone(),
            fail: true,
        }));

        for _ in 0..5 {
            assert!(
                !cache
                    .is_holiday(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
                    .await
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fixed_provider_filters_by_year() {
        let provider = FixedHolidayProvider::new(vec![
            NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
            NaiveDate::from_ymd_opt(2025, 12, 25).unwrap(),
        ]);
        let list = provider.fetch(2025).await.unwrap();
        assert_eq!(list, vec![NaiveDate::from_ymd_opt(2025, 12, 25).unwrap()]);
    }
}
