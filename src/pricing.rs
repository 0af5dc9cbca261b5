//! Tariff price calculation
//!
//! Computes the applicable electricity price per tariff and 15-minute period.
//! Static tariffs combine a contracted base price with distribution fees and
//! excise duty; dynamic tariffs build on the day-ahead market price instead;
//! a raw market tariff passes the converted market price through untouched.
//! Peak/off-peak tariffs pick their fee set by local hour, with weekends and
//! public holidays always off-peak for the holiday-aware schemes.

use crate::config::{PriceBasis, RateTable, TariffConfig};
use crate::holidays::HolidayCache;
use crate::logging::get_logger;
use crate::market::MarketPrices;
use crate::sink::Point;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Price engine over the configured tariff set
pub struct PriceCalculator {
    tariffs: Vec<TariffConfig>,

    /// Sink measurement name for price points
    measurement: String,

    /// Timezone the tariff hour rules are written in
    tz: Tz,

    /// Shared holiday cache for weekend-substitution tariffs
    holidays: Arc<Mutex<HolidayCache>>,

    logger: crate::logging::StructuredLogger,
}

impl PriceCalculator {
    /// Create a new calculator
    pub fn new(
        tariffs: Vec<TariffConfig>,
        measurement: String,
        tz: Tz,
        holidays: Arc<Mutex<HolidayCache>>,
    ) -> Self {
        Self {
            tariffs,
            measurement,
            tz,
            holidays,
            logger: get_logger("pricing"),
        }
    }

    /// Configured tariffs
    pub fn tariffs(&self) -> &[TariffConfig] {
        &self.tariffs
    }

    /// Whether the peak fee set applies at the given instant.
    ///
    /// Flat tariffs have a single fee set and always count as peak. For
    /// holiday-aware split tariffs, weekends and public holidays are always
    /// off-peak regardless of the hour.
    pub async fn is_peak_hour(&self, ts: DateTime<Utc>, tariff: &TariffConfig) -> bool {
        match &tariff.rates {
            RateTable::Flat { .. } => true,
            RateTable::Split {
                peak_hours,
                holidays_off_peak,
                ..
            } => {
                let local = ts.with_timezone(&self.tz);
                if *holidays_off_peak {
                    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
                        return false;
                    }
                    let mut holidays = self.holidays.lock().await;
                    if holidays.is_holiday(local.date_naive()).await {
                        return false;
                    }
                }
                peak_hours.iter().any(|range| range.contains(local.hour()))
            }
        }
    }

    /// Price in PLN/kWh for one tariff at one instant, or `None` when the
    /// tariff needs a market price that was not supplied.
    pub async fn calculate_price(
        &self,
        ts: DateTime<Utc>,
        tariff: &TariffConfig,
        market_price_mwh: Option<f64>,
    ) -> Option<f64> {
        let peak = self.is_peak_hour(ts, tariff).await;
        let fees = match &tariff.rates {
            RateTable::Flat { fees } => fees,
            RateTable::Split { peak: p, off_peak: o, .. } => {
                if peak {
                    p
                } else {
                    o
                }
            }
        };
        let fee_sum = fees.network_fee + fees.quality_fee + fees.cogeneration_fee;

        match &tariff.basis {
            // Market prices arrive per MWh, consumer prices are per kWh
            PriceBasis::Market => market_price_mwh.map(|p| p / 1000.0),
            PriceBasis::Dynamic { trade_margin } => market_price_mwh
                .map(|p| (p / 1000.0 + fee_sum) * (1.0 + tariff.vat) + trade_margin),
            PriceBasis::Static { base_price, excise } => {
                Some((base_price + fee_sum) * (1.0 + tariff.vat) + excise)
            }
        }
    }

    /// Generate one price point per tariff per 15-minute step of `[start,
    /// end)`, skipping steps where a tariff's market price is unresolvable.
    ///
    /// Tariffs are evaluated independently; a tariff that cannot produce a
    /// price for a step never affects the others.
    pub async fn generate_price_points(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        prices: &MarketPrices,
    ) -> Vec<Point> {
        let step = Duration::minutes(15);
        let mut points = Vec::new();
        let mut skipped = 0usize;

        let mut ts = start;
        while ts < end {
            let market = prices.resolve(ts);
            for tariff in &self.tariffs {
                match self.calculate_price(ts, tariff, market).await {
                    Some(price) => {
                        points.push(
                            Point::new(&self.measurement)
                                .tag("tariff", &tariff.name)
                                .field_f64("price_pln_kwh", price)
                                .timestamp(ts),
                        );
                    }
                    None => skipped += 1,
                }
            }
            ts += step;
        }

        if skipped > 0 {
            self.logger.debug(&format!(
                "Skipped {} tariff/period combinations without market data",
                skipped
            ));
        }
        points
    }
}
