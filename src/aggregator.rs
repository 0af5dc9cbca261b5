//! Raw sample aggregation into fixed wall-clock windows
//!
//! Devices report at whatever cadence they manage, so raw readings are
//! buffered per source and reduced at each window boundary: power is
//! integrated over time (each reading held until the next one), voltage and
//! current are averaged, and cumulative meter counters are folded into
//! non-negative deltas. Flushing drains and resets a buffer in one critical
//! section, so a reading racing the flush lands in the next window.

use crate::config::AggregationConfig;
use crate::logging::get_logger;
use crate::sink::Point;
use crate::transport::Measurement;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Raw samples collected for one source since the last flush
#[derive(Debug, Default)]
struct SampleBuffer {
    /// Power readings in watts
    power: Vec<(DateTime<Utc>, f64)>,

    /// Voltage readings in volts
    voltage: Vec<(DateTime<Utc>, f64)>,

    /// Current readings in amperes
    current: Vec<(DateTime<Utc>, f64)>,

    /// Last seen value of the device's cumulative counter.
    /// Survives flushes so a delta is only ever counted once.
    last_energy_total: Option<f64>,

    /// Counter consumption accumulated in the current window
    counter_delta_wh: f64,

    /// Whether the counter reported at all in the current window
    counter_seen: bool,
}

impl SampleBuffer {
    fn is_empty(&self) -> bool {
        self.power.is_empty()
            && self.voltage.is_empty()
            && self.current.is_empty()
            && !self.counter_seen
    }

    /// Reset for the next window, keeping the counter baseline
    fn reset(&mut self) {
        self.power.clear();
        self.voltage.clear();
        self.current.clear();
        self.counter_delta_wh = 0.0;
        self.counter_seen = false;
    }
}

/// Reduces irregular raw samples to one aggregate record per source per window
pub struct Aggregator {
    /// Window length in seconds
    interval_seconds: i64,

    /// Sink measurement name for aggregate records
    measurement: String,

    /// Per-source raw sample store
    buffers: HashMap<String, SampleBuffer>,

    /// Running consumption totals already attributed to past windows
    attributed_wh: HashMap<String, f64>,

    /// Logger
    logger: crate::logging::StructuredLogger,
}

impl Aggregator {
    /// Create a new aggregator
    pub fn new(config: &AggregationConfig) -> Self {
        Self {
            interval_seconds: i64::from(config.interval_minutes) * 60,
            measurement: config.measurement.clone(),
            buffers: HashMap::new(),
            attributed_wh: HashMap::new(),
            logger: get_logger("aggregator"),
        }
    }

    /// Append a measurement to the source's buffer.
    ///
    /// Cumulative counter values are folded into a delta against the previous
    /// reading. A decrease means the meter reset: nothing is added, but the
    /// new value becomes the baseline so the next delta stays sane.
    pub fn ingest(&mut self, source: &str, measurement: &Measurement) {
        let buffer = self.buffers.entry(source.to_string()).or_default();

        if let Some(v) = measurement.voltage {
            buffer.voltage.push((measurement.timestamp, v));
        }
        if let Some(a) = measurement.current {
            buffer.current.push((measurement.timestamp, a));
        }
        if let Some(w) = measurement.power_w {
            buffer.power.push((measurement.timestamp, w));
        }

        if let Some(total) = measurement.energy_total_wh {
            buffer.counter_seen = true;
            if let Some(previous) = buffer.last_energy_total {
                let delta = total - previous;
                if delta >= 0.0 {
                    buffer.counter_delta_wh += delta;
                } else {
                    self.logger.warn(&format!(
                        "Counter for {} decreased from {:.1} to {:.1} Wh, treating as meter reset",
                        source, previous, total
                    ));
                }
            }
            buffer.last_energy_total = Some(total);
        }
    }

    /// Restore the consumption already attributed to a source in past windows
    pub fn seed_attributed(&mut self, source: &str, wh: f64) {
        self.attributed_wh.insert(source.to_string(), wh);
    }

    /// Drop all state for a source that left the configuration
    pub fn remove_source(&mut self, source: &str) {
        self.buffers.remove(source);
        self.attributed_wh.remove(source);
    }

    /// Reduce every source's buffer into one point for the window ending at
    /// `now` truncated to the interval boundary, and reset the buffers.
    ///
    /// A source with no samples in the window is omitted entirely.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<Point> {
        let window_end = truncate_to_interval(now, self.interval_seconds);
        let mut points = Vec::new();

        for (source, buffer) in self.buffers.iter_mut() {
            if buffer.is_empty() {
                continue;
            }

            // The meter's own counter wins over the power integral when both
            // are available.
            let energy_wh = if buffer.counter_seen {
                buffer.counter_delta_wh
            } else {
                integrate_power(&buffer.power, window_end)
            };

            let total = self.attributed_wh.entry(source.clone()).or_insert(0.0);
            *total += energy_wh;

            let point = Point::new(&self.measurement)
                .tag("source", source)
                .field_f64("energy_wh", energy_wh)
                .field_f64("energy_total_wh", *total)
                .field_f64("voltage_v", mean(&buffer.voltage))
                .field_f64("current_a", mean(&buffer.current))
                .timestamp(window_end);
            points.push(point);

            buffer.reset();
        }

        self.logger.debug(&format!(
            "Flushed {} sources for window ending {}",
            points.len(),
            window_end
        ));
        points
    }
}

/// Truncate a timestamp down to the nearest interval boundary
fn truncate_to_interval(now: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let ts = now.timestamp();
    let truncated = ts - ts.rem_euclid(interval_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(now)
}

/// Integrate power readings over the window, each held until the next sample
/// and the last one held to the window end. Watt-seconds become watt-hours.
fn integrate_power(samples: &[(DateTime<Utc>, f64)], end: DateTime<Utc>) -> f64 {
    let mut watt_seconds = 0.0;
    for (i, (start, power)) in samples.iter().enumerate() {
        let held_until = samples.get(i + 1).map(|(next, _)| *next).unwrap_or(end);
        let held_seconds = (held_until - *start).num_milliseconds() as f64 / 1000.0;
        if held_seconds > 0.0 {
            watt_seconds += power * held_seconds;
        }
    }
    watt_seconds / 3600.0
}

/// Arithmetic mean of readings, zero when there are none
fn mean(samples: &[(DateTime<Utc>, f64)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|(_, v)| v).sum::<f64>() / samples.len() as f64
}
