//! Configuration management for gridflux
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Device transports and tariff families are
//! tagged enums resolved once at load time, so nothing downstream has to poke
//! at dynamic keys during a poll or a price calculation.

use crate::error::{GridfluxError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Devices to collect telemetry from
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Time-series sink (InfluxDB v2) connection
    pub sink: SinkConfig,

    /// Polling cadence, timeouts and reconnect backoff
    pub polling: PollingConfig,

    /// Aggregation window settings
    pub aggregation: AggregationConfig,

    /// Tariff definitions for price calculation
    #[serde(default)]
    pub tariffs: Vec<TariffConfig>,

    /// Day-ahead market price source
    pub market: MarketConfig,

    /// Public holiday source for weekend-substitution tariffs
    pub holidays: HolidayConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Timezone used for tariff hour rules and holiday dates
    pub timezone: String,
}

/// A single telemetry source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identifier; used as the sink tag and registry key
    pub id: String,

    /// Human-readable name for logs
    #[serde(default)]
    pub name: String,

    /// Transport family and its connection parameters
    #[serde(flatten)]
    pub transport: TransportConfig,
}

/// Transport families known to the collector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Modbus TCP energy meter
    Modbus(ModbusParams),
}

/// Modbus TCP connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusParams {
    /// Socket address of the meter, e.g. "192.168.1.50:502"
    pub address: String,

    /// Modbus unit (slave) id
    pub unit_id: u8,

    /// Input register layout of the meter
    #[serde(default)]
    pub registers: ModbusRegisterMap,
}

/// Input register addresses per measured quantity.
///
/// Voltage, current and power are 32-bit floats (two registers); the energy
/// counter is a 64-bit float (four registers) holding lifetime Wh. A `None`
/// entry means the meter does not expose that quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusRegisterMap {
    /// Phase voltage register address
    pub voltage: Option<u16>,

    /// Phase current register address
    pub current: Option<u16>,

    /// Active power register address
    pub power: Option<u16>,

    /// Cumulative energy counter register address
    pub energy_total: Option<u16>,
}

/// Sink (InfluxDB v2) connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Base URL, e.g. "http://127.0.0.1:8086"
    pub url: String,

    /// Organization name
    pub org: String,

    /// Target bucket
    pub bucket: String,

    /// API token
    pub token: String,

    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

/// Polling cadence and reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between refresh attempts per device
    pub interval_seconds: u64,

    /// Per-refresh timeout in seconds
    pub timeout_seconds: u64,

    /// First reconnect delay in milliseconds
    pub backoff_initial_ms: u64,

    /// Upper bound for the reconnect delay in seconds
    pub backoff_max_seconds: u64,

    /// Growth factor applied to the delay after each failed attempt
    pub backoff_multiplier: f64,
}

/// Aggregation window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Window length in minutes; flushes align to wall-clock multiples
    pub interval_minutes: u32,

    /// Sink measurement name for aggregate records
    pub measurement: String,
}

/// Day-ahead market price source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Price API base URL
    pub base_url: String,

    /// Minutes between price-generation runs
    pub refresh_minutes: u64,

    /// How far back to look for the last persisted price point
    pub resume_lookback_days: i64,

    /// Sink measurement name for price points
    pub price_measurement: String,

    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

/// Public holiday source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum HolidayConfig {
    /// Nager.Date-compatible public holiday API
    Api { base_url: String, country: String },

    /// Fixed list of dates from the configuration file
    Fixed { dates: Vec<NaiveDate> },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Log directory (or a file path whose parent is used)
    pub file: String,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,
}

/// Named electricity pricing scheme
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffConfig {
    /// Tariff name; used as the sink tag
    pub name: String,

    /// VAT rate, e.g. 0.23
    pub vat: f64,

    /// Where the base of the price comes from
    #[serde(flatten)]
    pub basis: PriceBasis,

    /// Fee table, flat or split into peak/off-peak
    #[serde(flatten)]
    pub rates: RateTable,
}

/// Source of the base price component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum PriceBasis {
    /// Raw day-ahead market price passthrough, no fees applied
    Market,

    /// Day-ahead market price plus fees and a trade margin
    Dynamic {
        /// Supplier margin added after VAT, per kWh
        trade_margin: f64,
    },

    /// Fixed base price plus fees and excise duty
    Static {
        /// Contracted energy price per kWh
        base_price: f64,

        /// Excise duty added after VAT, per kWh
        excise: f64,
    },
}

/// Fee table resolved per tariff family at load time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rates", rename_all = "snake_case")]
pub enum RateTable {
    /// One fee set applies around the clock
    Flat {
        fees: FeeComponents,
    },

    /// Separate peak and off-peak fee sets
    Split {
        peak: FeeComponents,
        off_peak: FeeComponents,

        /// Hour ranges counting as peak on applicable days
        peak_hours: Vec<HourRange>,

        /// Whether weekends and public holidays are always off-peak
        #[serde(default)]
        holidays_off_peak: bool,
    },
}

/// Distribution fee components, all per kWh
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeComponents {
    /// Network (distribution) fee
    pub network_fee: f64,

    /// Quality fee
    pub quality_fee: f64,

    /// Cogeneration fee
    pub cogeneration_fee: f64,
}

/// Half-open local-time hour range `[start, end)`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u8,
    pub end: u8,
}

impl HourRange {
    /// Whether the given local hour falls inside the range
    pub fn contains(&self, hour: u32) -> bool {
        (self.start as u32) <= hour && hour < (self.end as u32)
    }
}

impl Default for ModbusRegisterMap {
    fn default() -> Self {
        // Matches the Eastron SDM-series single-phase layout.
        Self {
            voltage: Some(0x0000),
            current: Some(0x0006),
            power: Some(0x000C),
            energy_total: Some(0x0156),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            org: "home".to_string(),
            bucket: "energy".to_string(),
            token: String::new(),
            timeout_seconds: 10,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            timeout_seconds: 5,
            backoff_initial_ms: 1000,
            backoff_max_seconds: 300,
            backoff_multiplier: 1.5,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            measurement: "energy".to_string(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.raporty.pse.pl/api/rce-pln".to_string(),
            refresh_minutes: 60,
            resume_lookback_days: 7,
            price_measurement: "energy_price".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for HolidayConfig {
    fn default() -> Self {
        Self::Api {
            base_url: "https://date.nager.at".to_string(),
            country: "PL".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/var/log/gridflux".to_string(),
            console_output: true,
            json_format: false,
            backup_count: 5,
            console_level: None,
            file_level: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            sink: SinkConfig::default(),
            polling: PollingConfig::default(),
            aggregation: AggregationConfig::default(),
            tariffs: Vec::new(),
            market: MarketConfig::default(),
            holidays: HolidayConfig::default(),
            logging: LoggingConfig::default(),
            timezone: "Europe/Warsaw".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let default_paths = [
            "gridflux.yaml",
            "/data/gridflux.yaml",
            "/etc/gridflux/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen_devices = std::collections::HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(GridfluxError::validation(
                    "devices.id",
                    "Device id cannot be empty",
                ));
            }
            if !seen_devices.insert(device.id.as_str()) {
                return Err(GridfluxError::validation(
                    "devices.id",
                    "Device ids must be unique",
                ));
            }
            match &device.transport {
                TransportConfig::Modbus(params) => {
                    if params.address.is_empty() {
                        return Err(GridfluxError::validation(
                            "devices.address",
                            "Modbus address cannot be empty",
                        ));
                    }
                }
            }
        }

        if self.sink.url.is_empty() {
            return Err(GridfluxError::validation(
                "sink.url",
                "Sink URL cannot be empty",
            ));
        }

        if self.polling.interval_seconds == 0 {
            return Err(GridfluxError::validation(
                "polling.interval_seconds",
                "Must be greater than 0",
            ));
        }

        if self.polling.backoff_multiplier < 1.0 {
            return Err(GridfluxError::validation(
                "polling.backoff_multiplier",
                "Must be at least 1.0",
            ));
        }

        if self.aggregation.interval_minutes == 0 || self.aggregation.interval_minutes > 1440 {
            return Err(GridfluxError::validation(
                "aggregation.interval_minutes",
                "Must be between 1 and 1440",
            ));
        }

        let mut seen_tariffs = std::collections::HashSet::new();
        for tariff in &self.tariffs {
            if tariff.name.is_empty() {
                return Err(GridfluxError::validation(
                    "tariffs.name",
                    "Tariff name cannot be empty",
                ));
            }
            if !seen_tariffs.insert(tariff.name.as_str()) {
                return Err(GridfluxError::validation(
                    "tariffs.name",
                    "Tariff names must be unique",
                ));
            }
            if tariff.vat < 0.0 {
                return Err(GridfluxError::validation(
                    "tariffs.vat",
                    "VAT rate cannot be negative",
                ));
            }
            if let RateTable::Split { peak_hours, .. } = &tariff.rates {
                for range in peak_hours {
                    if range.start >= range.end || range.end > 24 {
                        return Err(GridfluxError::validation(
                            "tariffs.peak_hours",
                            "Hour ranges must satisfy start < end <= 24",
                        ));
                    }
                }
            }
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(GridfluxError::validation(
                "timezone",
                "Unknown timezone name",
            ));
        }

        Ok(())
    }
}
