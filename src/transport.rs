//! Device transport capability interface
//!
//! Every device family the collector talks to implements [`DeviceTransport`]:
//! a connect sequence (discovery plus handshake), a field-selective refresh,
//! and an event subscription with a closed set of variants. The connection
//! manager only ever sees this trait, so adding a family means adding one
//! implementation and one [`TransportConfig`](crate::config::TransportConfig)
//! variant.

use crate::config::{DeviceConfig, TransportConfig};
use crate::error::{GridfluxError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// One reading delivered by a transport refresh or a data event.
///
/// Fields a device does not report stay `None`; `energy_total_wh` is the
/// device's own lifetime counter, not a per-interval value.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// When the reading was taken
    pub timestamp: DateTime<Utc>,

    /// Voltage in volts
    pub voltage: Option<f64>,

    /// Current in amperes
    pub current: Option<f64>,

    /// Active power in watts
    pub power_w: Option<f64>,

    /// Cumulative consumption counter in watt-hours
    pub energy_total_wh: Option<f64>,
}

impl Measurement {
    /// Create an empty measurement stamped with the given time
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            voltage: None,
            current: None,
            power_w: None,
            energy_total_wh: None,
        }
    }
}

/// Quantities a refresh can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasuredField {
    Voltage,
    Current,
    Power,
    EnergyTotal,
}

impl MeasuredField {
    /// Every quantity the collector knows about
    pub const ALL: &'static [MeasuredField] = &[
        MeasuredField::Voltage,
        MeasuredField::Current,
        MeasuredField::Power,
        MeasuredField::EnergyTotal,
    ];
}

/// Events a transport may emit between refreshes
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The underlying link came up
    Connected,

    /// The underlying link went away
    Disconnected,

    /// The transport hit an error it could not handle itself
    Error(String),

    /// The device pushed a reading on its own
    DataUpdate(Measurement),
}

/// Capability interface for one device connection
#[async_trait]
pub trait DeviceTransport: Send {
    /// Locate the device (address resolution, discovery probes)
    async fn find(&mut self) -> Result<()>;

    /// Establish the connection after a successful `find`
    async fn connect(&mut self) -> Result<()>;

    /// Tear down the connection; must be safe to call when not connected
    async fn disconnect(&mut self) -> Result<()>;

    /// Read the requested quantities from the device
    async fn refresh(&mut self, fields: &[MeasuredField]) -> Result<Measurement>;

    /// Subscribe to transport events; at most one subscriber per transport
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent>;
}

/// Build the transport implementation for a configured device
pub fn build_transport(device: &DeviceConfig) -> Result<Box<dyn DeviceTransport>> {
    match &device.transport {
        #[cfg(feature = "modbus")]
        TransportConfig::Modbus(params) => Ok(Box::new(
            crate::modbus::ModbusMeterTransport::new(&device.id, params)?,
        )),
        #[cfg(not(feature = "modbus"))]
        TransportConfig::Modbus(_) => Err(GridfluxError::config(format!(
            "Device {} needs the modbus feature, which is disabled",
            device.id
        ))),
    }
}

/// Whether an error indicates a broken connection rather than bad data.
///
/// Connection-level failures escalate to a reconnect; anything else is a
/// per-request problem the next poll may not hit.
pub fn is_connection_error(error: &GridfluxError) -> bool {
    match error {
        GridfluxError::Timeout { .. } => true,
        GridfluxError::Transport { message } => {
            let msg = message.to_lowercase();
            msg.contains("connection")
                || msg.contains("timeout")
                || msg.contains("reset")
                || msg.contains("refused")
                || msg.contains("broken pipe")
                || msg.contains("disconnected")
                || msg.contains("not connected")
        }
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport used by the connection and poller tests.

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Shared counters and handles the tests assert on
    #[derive(Default)]
    pub(crate) struct MockState {
        pub connect_attempts: AtomicUsize,
        pub refresh_calls: AtomicUsize,
        pub disconnects: AtomicUsize,
        /// Event sender captured when the manager subscribes
        pub events: std::sync::Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    pub(crate) struct MockTransport {
        pub state: Arc<MockState>,
        /// The first N connect attempts fail
        pub fail_connects: usize,
        /// Simulated duration of each refresh
        pub refresh_delay: Duration,
        /// Error message every refresh fails with, if set
        pub refresh_error: Option<String>,
    }

    impl MockTransport {
        pub(crate) fn new(state: Arc<MockState>) -> Self {
            Self {
                state,
                fail_connects: 0,
                refresh_delay: Duration::ZERO,
                refresh_error: None,
            }
        }
    }

    #[async_trait]
    impl DeviceTransport for MockTransport {
        async fn find(&mut self) -> Result<()> {
            Ok(())
        }

        async fn connect(&mut self) -> Result<()> {
            let attempt = self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_connects {
                Err(GridfluxError::transport("connection refused"))
            } else {
                Ok(())
            }
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn refresh(&mut self, _fields: &[MeasuredField]) -> Result<Measurement> {
            self.state.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if !self.refresh_delay.is_zero() {
                tokio::time::sleep(self.refresh_delay).await;
            }
            if let Some(ref msg) = self.refresh_error {
                return Err(GridfluxError::transport(msg.clone()));
            }
            let mut m = Measurement::at(Utc::now());
            m.power_w = Some(1000.0);
            Ok(m)
        }

        fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut slot) = self.state.events.lock() {
                *slot = Some(tx);
            }
            rx
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_classified() {
        assert!(is_connection_error(&GridfluxError::timeout("read timeout")));
        assert!(is_connection_error(&GridfluxError::transport(
            "Connection reset by peer"
        )));
        assert!(is_connection_error(&GridfluxError::transport(
            "connection refused"
        )));
        assert!(!is_connection_error(&GridfluxError::transport(
            "modbus exception: IllegalDataAddress"
        )));
        assert!(!is_connection_error(&GridfluxError::config("bad field")));
    }

    #[test]
    fn measurement_starts_empty() {
        let m = Measurement::at(Utc::now());
        assert!(m.voltage.is_none());
        assert!(m.power_w.is_none());
        assert_eq!(MeasuredField::ALL.len(), 4);
    }
}
