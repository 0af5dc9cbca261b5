use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use gridflux::config::{FeeComponents, HourRange, PriceBasis, RateTable, TariffConfig};
use gridflux::holidays::{FixedHolidayProvider, HolidayCache};
use gridflux::market::{MarketPrice, MarketPrices};
use gridflux::pricing::PriceCalculator;
use std::sync::Arc;
use tokio::sync::Mutex;

const WARSAW: Tz = chrono_tz::Europe::Warsaw;

fn fees(network_fee: f64) -> FeeComponents {
    FeeComponents {
        network_fee,
        quality_fee: 0.013,
        cogeneration_fee: 0.001,
    }
}

fn night_tariff(holidays_off_peak: bool) -> TariffConfig {
    TariffConfig {
        name: "g12w".to_string(),
        vat: 0.23,
        basis: PriceBasis::Static {
            base_price: 0.41,
            excise: 0.005,
        },
        rates: RateTable::Split {
            peak: fees(0.30),
            off_peak: fees(0.08),
            peak_hours: vec![
                HourRange { start: 6, end: 13 },
                HourRange { start: 15, end: 22 },
            ],
            holidays_off_peak,
        },
    }
}

fn spot_tariff() -> TariffConfig {
    TariffConfig {
        name: "spot".to_string(),
        vat: 0.23,
        basis: PriceBasis::Market,
        rates: RateTable::Flat { fees: fees(0.0) },
    }
}

fn calculator(tariffs: Vec<TariffConfig>, holidays: Vec<NaiveDate>) -> PriceCalculator {
    let cache = HolidayCache::new(Box::new(FixedHolidayProvider::new(holidays)));
    PriceCalculator::new(
        tariffs,
        "energy_price".to_string(),
        WARSAW,
        Arc::new(Mutex::new(cache)),
    )
}

fn warsaw_utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
    WARSAW
        .with_ymd_and_hms(y, mo, d, h, 0, 0)
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn weekday_holiday_is_off_peak_all_day() {
    // 2025-05-01 is a Thursday and a Polish public holiday
    let holiday = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
    let calc = calculator(vec![night_tariff(true)], vec![holiday]);
    let tariff = &calc.tariffs()[0];

    for hour in 0..24 {
        assert!(
            !calc
                .is_peak_hour(warsaw_utc(2025, 5, 1, hour), tariff)
                .await,
            "hour {} of the holiday should be off-peak",
            hour
        );
    }

    // The same Thursday a week later follows the normal hour rules
    assert!(calc.is_peak_hour(warsaw_utc(2025, 5, 8, 10), tariff).await);
}

#[tokio::test]
async fn holiday_unaware_tariff_ignores_the_calendar() {
    let holiday = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
    let calc = calculator(vec![night_tariff(false)], vec![holiday]);
    let tariff = &calc.tariffs()[0];

    assert!(calc.is_peak_hour(warsaw_utc(2025, 5, 1, 10), tariff).await);
    assert!(!calc.is_peak_hour(warsaw_utc(2025, 5, 1, 14), tariff).await);
}

#[tokio::test]
async fn one_point_per_resolvable_tariff_and_step() {
    let calc = calculator(vec![spot_tariff(), night_tariff(true)], vec![]);

    let start = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
    let end = start + Duration::hours(1);
    let prices = MarketPrices::from_points(vec![
        MarketPrice {
            starts_at: start,
            price_mwh: 400.0,
        },
        MarketPrice {
            starts_at: start + Duration::minutes(15),
            price_mwh: 420.0,
        },
        MarketPrice {
            starts_at: start + Duration::minutes(30),
            price_mwh: 380.0,
        },
        MarketPrice {
            starts_at: start + Duration::minutes(45),
            price_mwh: 410.0,
        },
    ]);

    let points = calc.generate_price_points(start, end, &prices).await;
    // Both tariffs resolve at every one of the four steps
    assert_eq!(points.len(), 8);

    let lines: Vec<String> = points
        .iter()
        .map(|p| p.line_protocol().unwrap())
        .collect();
    assert_eq!(lines.iter().filter(|l| l.contains("tariff=spot")).count(), 4);
    assert_eq!(lines.iter().filter(|l| l.contains("tariff=g12w")).count(), 4);
}

#[tokio::test]
async fn market_gaps_silence_market_tariffs_only() {
    let calc = calculator(vec![spot_tariff(), night_tariff(true)], vec![]);

    let start = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
    let end = start + Duration::hours(1);
    let points = calc
        .generate_price_points(start, end, &MarketPrices::default())
        .await;

    // The static tariff still prices all four steps
    assert_eq!(points.len(), 4);
    assert!(
        points
            .iter()
            .map(|p| p.line_protocol().unwrap())
            .all(|l| l.contains("tariff=g12w"))
    );
}

#[tokio::test]
async fn quarter_hour_steps_fall_back_to_the_hourly_price() {
    let calc = calculator(vec![spot_tariff()], vec![]);

    let start = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
    let end = start + Duration::hours(1);
    // Hourly-resolution market data: a single price at the top of the hour
    let prices = MarketPrices::from_points(vec![MarketPrice {
        starts_at: start,
        price_mwh: 500.0,
    }]);

    let points = calc.generate_price_points(start, end, &prices).await;
    assert_eq!(points.len(), 4);
    for point in &points {
        let line = point.line_protocol().unwrap();
        assert!(line.contains("price_pln_kwh=0.5"), "line was: {}", line);
    }
}

#[tokio::test]
async fn dynamic_tariff_prices_peak_and_off_peak_differently() {
    let tariff = TariffConfig {
        name: "dynamic".to_string(),
        vat: 0.23,
        basis: PriceBasis::Dynamic { trade_margin: 0.09 },
        rates: RateTable::Split {
            peak: fees(0.30),
            off_peak: fees(0.08),
            peak_hours: vec![
                HourRange { start: 7, end: 13 },
                HourRange { start: 16, end: 22 },
            ],
            holidays_off_peak: false,
        },
    };
    let calc = calculator(vec![tariff], vec![]);
    let tariff = &calc.tariffs()[0];

    let peak = calc
        .calculate_price(warsaw_utc(2025, 6, 2, 10), tariff, Some(400.0))
        .await
        .unwrap();
    let off_peak = calc
        .calculate_price(warsaw_utc(2025, 6, 2, 14), tariff, Some(400.0))
        .await
        .unwrap();
    assert!(peak > off_peak);

    // (0.4 + 0.30 + 0.013 + 0.001) * 1.23 + 0.09
    assert!((peak - 0.96822).abs() < 1e-9);
    // (0.4 + 0.08 + 0.013 + 0.001) * 1.23 + 0.09
    assert!((off_peak - 0.69762).abs() < 1e-9);
}
