use anyhow::Result;
use chrono::{Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use gridflux::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    gridflux::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Logging init failed: {}", e))?;

    info!("gridflux energy telemetry collector starting up");

    let tz: Tz = config
        .timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("Unknown timezone {}", config.timezone))?;

    let sink = Arc::new(gridflux::sink::InfluxSink::new(&config.sink)?);
    let aggregator = Arc::new(Mutex::new(gridflux::aggregator::Aggregator::new(
        &config.aggregation,
    )));

    seed_attributed_totals(&config, &sink, &aggregator, tz).await;

    // Connection manager loop plus its initial device set
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = gridflux::ConnectionManager::new(
        config.polling.clone(),
        aggregator.clone(),
        tx.clone(),
    );
    tx.send(gridflux::ManagerMsg::Reconcile(config.devices.clone()))
        .ok();
    let manager_task = tokio::spawn(manager.run(rx));

    let flush_task = tokio::spawn(flush_loop(
        aggregator.clone(),
        sink.clone(),
        config.aggregation.interval_minutes,
    ));

    let price_task = if config.tariffs.is_empty() {
        info!("No tariffs configured, price generation disabled");
        None
    } else {
        let holidays = Arc::new(Mutex::new(gridflux::holidays::HolidayCache::new(
            gridflux::holidays::build_provider(&config.holidays)
                .map_err(|e| anyhow::anyhow!("Holiday source setup failed: {}", e))?,
        )));
        let market = gridflux::market::MarketClient::new(&config.market, tz)?;
        let calculator = gridflux::pricing::PriceCalculator::new(
            config.tariffs.clone(),
            config.market.price_measurement.clone(),
            tz,
            holidays,
        );
        Some(tokio::spawn(price_loop(
            market,
            calculator,
            sink.clone(),
            config.market.clone(),
            tz,
        )))
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    tx.send(gridflux::ManagerMsg::Shutdown).ok();
    if tokio::time::timeout(Duration::from_secs(10), manager_task)
        .await
        .is_err()
    {
        error!("Connection manager did not stop in time");
    }
    flush_task.abort();
    if let Some(task) = price_task {
        task.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

/// Restore per-source consumption totals from the sink so day totals stay
/// continuous across restarts. Best-effort: a failed query starts at zero.
async fn seed_attributed_totals(
    config: &Config,
    sink: &gridflux::sink::InfluxSink,
    aggregator: &Arc<Mutex<gridflux::aggregator::Aggregator>>,
    tz: Tz,
) {
    let today = Utc::now().with_timezone(&tz).date_naive();
    let Some(midnight) = tz
        .with_ymd_and_hms(today.year(), today.month(), today.day(), 0, 0, 0)
        .earliest()
    else {
        return;
    };
    let midnight_utc = midnight.with_timezone(&Utc);

    for device in &config.devices {
        match sink
            .sum_field(
                &config.aggregation.measurement,
                "energy_wh",
                "source",
                &device.id,
                midnight_utc,
            )
            .await
        {
            Ok(wh) if wh > 0.0 => {
                info!(
                    "Resuming {} with {:.1} Wh already attributed today",
                    device.id, wh
                );
                aggregator.lock().await.seed_attributed(&device.id, wh);
            }
            Ok(_) => {}
            Err(e) => warn!(
                "Could not restore attributed consumption for {}: {}",
                device.id, e
            ),
        }
    }
}

/// Flush the aggregator at every wall-clock window boundary
async fn flush_loop(
    aggregator: Arc<Mutex<gridflux::aggregator::Aggregator>>,
    sink: Arc<gridflux::sink::InfluxSink>,
    interval_minutes: u32,
) {
    let interval_seconds = i64::from(interval_minutes) * 60;
    loop {
        tokio::time::sleep(until_next_boundary(interval_seconds)).await;
        let now = Utc::now();
        let points = aggregator.lock().await.flush(now);
        if points.is_empty() {
            continue;
        }
        if let Err(e) = sink.write_points(&points).await {
            error!("Writing {} aggregate points failed: {}", points.len(), e);
        }
    }
}

/// Time remaining until the next wall-clock multiple of the interval
fn until_next_boundary(interval_seconds: i64) -> Duration {
    let now = Utc::now();
    let ts = now.timestamp();
    let next = ts - ts.rem_euclid(interval_seconds) + interval_seconds;
    let mut wait = next - ts;
    if wait <= 0 {
        wait = interval_seconds;
    }
    Duration::from_secs(wait as u64)
}

/// Periodically fetch market prices and extend the persisted price series.
///
/// Generation resumes from the last persisted price point, bounded by the
/// configured lookback, and runs to the end of the fetched market horizon.
async fn price_loop(
    market: gridflux::market::MarketClient,
    calculator: gridflux::pricing::PriceCalculator,
    sink: Arc<gridflux::sink::InfluxSink>,
    config: gridflux::config::MarketConfig,
    tz: Tz,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.refresh_minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now = Utc::now();

        let resume_from = match sink
            .last_point_time(
                &config.price_measurement,
                chrono::Duration::days(config.resume_lookback_days),
            )
            .await
        {
            Ok(Some(last)) => last + chrono::Duration::minutes(15),
            Ok(None) => start_of_local_day(now, tz),
            Err(e) => {
                warn!("Could not read the last persisted price point: {}", e);
                start_of_local_day(now, tz)
            }
        };

        let from = resume_from.with_timezone(&tz).date_naive();
        let to = (now + chrono::Duration::days(1)).with_timezone(&tz).date_naive();
        let prices = market.fetch_range(from, to).await;

        let Some(horizon) = prices.last_time() else {
            warn!("No market data available for {}..{}", from, to);
            continue;
        };
        let end = horizon + chrono::Duration::minutes(15);
        if resume_from >= end {
            continue;
        }

        let points = calculator
            .generate_price_points(resume_from, end, &prices)
            .await;
        if points.is_empty() {
            continue;
        }
        match sink.write_points(&points).await {
            Ok(()) => info!(
                "Wrote {} price points covering {} to {}",
                points.len(),
                resume_from,
                end
            ),
            Err(e) => error!("Writing {} price points failed: {}", points.len(), e),
        }
    }
}

/// Midnight of the local day containing `ts`, expressed in UTC
fn start_of_local_day(ts: chrono::DateTime<Utc>, tz: Tz) -> chrono::DateTime<Utc> {
    let local = ts.with_timezone(&tz).date_naive();
    tz.with_ymd_and_hms(local.year(), local.month(), local.day(), 0, 0, 0)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(ts)
}
