//! Device connection lifecycle management
//!
//! The [`ConnectionManager`] owns every configured device connection: it
//! reconciles the registry against configuration changes, runs the connect
//! sequence, escalates failures into exponential-backoff reconnects, and
//! feeds poll results and transport events into the aggregator. All state
//! transitions happen on one message loop; timers and spawned I/O report back
//! over the same channel instead of touching shared state.

use crate::aggregator::Aggregator;
use crate::config::{DeviceConfig, PollingConfig};
use crate::error::Result;
use crate::logging::get_logger;
use crate::poller::Poller;
use crate::scheduler::ScheduledTask;
use crate::transport::{DeviceTransport, Measurement, TransportEvent, is_connection_error};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Lifecycle state of one device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and no attempt in progress
    Disconnected,

    /// Connect sequence running
    Connecting,

    /// Transport established, polling active
    Connected,

    /// Last attempt failed, reconnect timer pending
    ErrorBackoff,
}

/// Messages driving the manager's run loop
#[derive(Debug)]
pub enum ManagerMsg {
    /// Apply a new device configuration set
    Reconcile(Vec<DeviceConfig>),

    /// A backoff timer elapsed, retry the connect
    ReconnectDue(String),

    /// A spawned connect sequence resolved
    ConnectFinished { id: String, result: Result<()> },

    /// A poll cadence timer fired
    PollTick(String),

    /// A spawned refresh resolved
    PollFinished {
        id: String,
        result: Result<Measurement>,
    },

    /// A transport pushed an event
    Transport { id: String, event: TransportEvent },

    /// Disconnect everything and stop the loop
    Shutdown,
}

/// Mutable bookkeeping for one tracked device
struct DeviceConnection {
    state: ConnectionState,

    /// Delay the next reconnect timer will be armed with
    backoff_delay: Duration,

    /// Most recent failure, for diagnostics
    last_error: Option<String>,

    /// Pending reconnect timer; replaced handles abort their timer
    reconnect: Option<ScheduledTask>,

    /// Shared transport handle; spawned connects and polls lock it briefly
    transport: Arc<Mutex<Box<dyn DeviceTransport>>>,
}

/// Builds a transport for a device; injectable so tests and embedders can
/// supply their own families
pub type TransportFactory =
    Box<dyn Fn(&DeviceConfig) -> Result<Box<dyn DeviceTransport>> + Send>;

/// Owns the registry of device connections and their lifecycle
pub struct ConnectionManager {
    settings: PollingConfig,
    connections: HashMap<String, DeviceConnection>,
    poller: Poller,
    aggregator: Arc<Mutex<Aggregator>>,
    factory: TransportFactory,
    tx: UnboundedSender<ManagerMsg>,
    logger: crate::logging::StructuredLogger,
}

impl ConnectionManager {
    /// Create a manager using the built-in transport families
    pub fn new(
        settings: PollingConfig,
        aggregator: Arc<Mutex<Aggregator>>,
        tx: UnboundedSender<ManagerMsg>,
    ) -> Self {
        Self::with_factory(
            settings,
            aggregator,
            tx,
            Box::new(crate::transport::build_transport),
        )
    }

    /// Create a manager with a custom transport factory
    pub fn with_factory(
        settings: PollingConfig,
        aggregator: Arc<Mutex<Aggregator>>,
        tx: UnboundedSender<ManagerMsg>,
        factory: TransportFactory,
    ) -> Self {
        Self {
            settings,
            connections: HashMap::new(),
            poller: Poller::new(),
            aggregator,
            factory,
            tx,
            logger: get_logger("connections"),
        }
    }

    /// Run the message loop until a `Shutdown` message arrives
    pub async fn run(mut self, mut rx: UnboundedReceiver<ManagerMsg>) {
        self.logger.info("Connection manager started");
        while let Some(msg) = rx.recv().await {
            let stop = matches!(msg, ManagerMsg::Shutdown);
            self.handle(msg).await;
            if stop {
                break;
            }
        }
        self.logger.info("Connection manager stopped");
    }

    /// Dispatch one message; every state transition happens here
    pub(crate) async fn handle(&mut self, msg: ManagerMsg) {
        match msg {
            ManagerMsg::Reconcile(configs) => self.reconcile(configs).await,
            ManagerMsg::ReconnectDue(id) => self.reconnect_due(&id),
            ManagerMsg::ConnectFinished { id, result } => self.connect_finished(&id, result),
            ManagerMsg::PollTick(id) => self.poll_tick(&id),
            ManagerMsg::PollFinished { id, result } => self.poll_finished(&id, result).await,
            ManagerMsg::Transport { id, event } => self.transport_event(&id, event).await,
            ManagerMsg::Shutdown => self.shutdown().await,
        }
    }

    /// Apply a configuration set: drop connections whose id disappeared,
    /// create connections for new ids, leave unchanged ids alone.
    async fn reconcile(&mut self, configs: Vec<DeviceConfig>) {
        let incoming: HashMap<String, DeviceConfig> = configs
            .into_iter()
            .map(|config| (config.id.clone(), config))
            .collect();

        let removed: Vec<String> = self
            .connections
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in &removed {
            self.remove_device(id).await;
        }

        for (id, config) in incoming {
            if self.connections.contains_key(&id) {
                continue;
            }
            self.add_device(config);
        }
    }

    /// Track a new device and start its connect sequence.
    ///
    /// A device whose transport cannot be built is skipped and logged; the
    /// rest of the configuration is unaffected.
    fn add_device(&mut self, config: DeviceConfig) {
        let id = config.id.clone();
        let mut transport = match (self.factory)(&config) {
            Ok(transport) => transport,
            Err(e) => {
                self.logger
                    .warn(&format!("Skipping device {}: {}", id, e));
                return;
            }
        };

        // Forward transport events into the manager loop. The task ends on
        // its own once the transport (and with it the sender) is dropped.
        let mut events = transport.subscribe();
        let event_tx = self.tx.clone();
        let event_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let msg = ManagerMsg::Transport {
                    id: event_id.clone(),
                    event,
                };
                if event_tx.send(msg).is_err() {
                    break;
                }
            }
        });

        let connection = DeviceConnection {
            state: ConnectionState::Connecting,
            backoff_delay: self.initial_backoff(),
            last_error: None,
            reconnect: None,
            transport: Arc::new(Mutex::new(transport)),
        };
        self.connections.insert(id.clone(), connection);
        self.logger.info(&format!("Tracking device {}", id));
        self.start_connect(&id);
    }

    /// Stop tracking a device: cancel its timers, tear down the transport
    /// best-effort, and drop its sample buffer.
    async fn remove_device(&mut self, id: &str) {
        let Some(connection) = self.connections.remove(id) else {
            return;
        };
        // Dropping the connection aborts any pending reconnect timer
        self.poller.stop(id);
        self.aggregator.lock().await.remove_source(id);

        let transport = connection.transport;
        let logger = self.logger.clone();
        let owner = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = transport.lock().await.disconnect().await {
                logger.warn(&format!("Disconnecting {} failed: {}", owner, e));
            }
        });
        self.logger.info(&format!("Stopped tracking device {}", id));
    }

    /// Kick off the transport's connect sequence off-loop
    fn start_connect(&mut self, id: &str) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        connection.state = ConnectionState::Connecting;
        connection.reconnect = None;

        let transport = connection.transport.clone();
        let tx = self.tx.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let result = {
                let mut transport = transport.lock().await;
                match transport.find().await {
                    Ok(()) => transport.connect().await,
                    Err(e) => Err(e),
                }
            };
            let _ = tx.send(ManagerMsg::ConnectFinished { id, result });
        });
    }

    /// Fold a connect outcome into the state machine
    fn connect_finished(&mut self, id: &str, result: Result<()>) {
        let interval = Duration::from_secs(self.settings.interval_seconds);
        let timeout = Duration::from_secs(self.settings.timeout_seconds);
        let initial = self.initial_backoff();

        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        if connection.state != ConnectionState::Connecting {
            return;
        }

        match result {
            Ok(()) => {
                connection.state = ConnectionState::Connected;
                connection.backoff_delay = initial;
                connection.last_error = None;
                self.logger.info(&format!("Device {} connected", id));
                self.poller.start(id, interval, timeout, &self.tx);
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Connecting to {} failed: {}", id, e));
                connection.state = ConnectionState::ErrorBackoff;
                connection.last_error = Some(e.to_string());
                self.schedule_reconnect(id);
            }
        }
    }

    /// Arm the reconnect timer at the current backoff delay, then grow the
    /// stored delay for the next failure (clamped to the configured maximum).
    /// Any previously pending timer is cancelled by the replacement.
    fn schedule_reconnect(&mut self, id: &str) {
        let max_seconds = self.settings.backoff_max_seconds as f64;
        let multiplier = self.settings.backoff_multiplier;
        let tx = self.tx.clone();

        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        let delay = connection.backoff_delay;
        connection.reconnect = Some(ScheduledTask::once(
            delay,
            tx,
            ManagerMsg::ReconnectDue(id.to_string()),
        ));
        connection.backoff_delay =
            Duration::from_secs_f64((delay.as_secs_f64() * multiplier).min(max_seconds));

        self.logger.debug(&format!(
            "Reconnect to {} scheduled in {:.1}s",
            id,
            delay.as_secs_f64()
        ));
    }

    /// A backoff timer fired; retry unless the device moved on meanwhile
    fn reconnect_due(&mut self, id: &str) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        if connection.state != ConnectionState::ErrorBackoff {
            return;
        }
        self.start_connect(id);
    }

    /// A poll cadence timer fired; the poller decides whether to refresh
    fn poll_tick(&mut self, id: &str) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        let connected = connection.state == ConnectionState::Connected;
        self.poller
            .handle_tick(id, connected, connection.transport.clone(), &self.tx);
    }

    /// Fold a refresh outcome into the aggregator or the state machine
    async fn poll_finished(&mut self, id: &str, result: Result<Measurement>) {
        self.poller.finish(id);
        match result {
            Ok(measurement) => {
                self.aggregator.lock().await.ingest(id, &measurement);
            }
            Err(e) if is_connection_error(&e) => {
                self.logger.warn(&format!(
                    "Poll of {} hit a connection error: {}",
                    id, e
                ));
                self.mark_disconnected(id, &e.to_string());
            }
            Err(e) => {
                // Anything else is a per-request problem; the next tick
                // proceeds normally.
                self.logger.warn(&format!("Poll of {} failed: {}", id, e));
            }
        }
    }

    /// React to a transport-pushed event
    async fn transport_event(&mut self, id: &str, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.logger.debug(&format!("Transport for {} reported up", id));
            }
            TransportEvent::Disconnected => {
                self.mark_disconnected(id, "transport reported disconnect");
            }
            TransportEvent::Error(message) => {
                self.mark_disconnected(id, &message);
            }
            TransportEvent::DataUpdate(measurement) => {
                self.aggregator.lock().await.ingest(id, &measurement);
            }
        }
    }

    /// Move a connected device into backoff and schedule its reconnect
    fn mark_disconnected(&mut self, id: &str, reason: &str) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        if connection.state != ConnectionState::Connected {
            return;
        }
        connection.state = ConnectionState::ErrorBackoff;
        connection.last_error = Some(reason.to_string());
        self.schedule_reconnect(id);
    }

    /// Disconnect every device and clear the registry
    async fn shutdown(&mut self) {
        self.logger.info("Disconnecting all devices");
        for (id, connection) in self.connections.drain() {
            self.poller.stop(&id);
            let transport = connection.transport;
            let result = tokio::time::timeout(Duration::from_secs(5), async {
                transport.lock().await.disconnect().await
            })
            .await;
            match result {
                Ok(Err(e)) => self
                    .logger
                    .warn(&format!("Disconnecting {} failed: {}", id, e)),
                Err(_) => self
                    .logger
                    .warn(&format!("Disconnecting {} timed out", id)),
                Ok(Ok(())) => {}
            }
        }
    }

    fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.settings.backoff_initial_ms)
    }

    /// Number of tracked devices
    pub fn device_count(&self) -> usize {
        self.connections.len()
    }

    /// Current lifecycle state of a device, if tracked
    pub fn connection_state(&self, id: &str) -> Option<ConnectionState> {
        self.connections.get(id).map(|c| c.state)
    }

    /// Delay the next reconnect timer would be armed with
    pub fn backoff_delay(&self, id: &str) -> Option<Duration> {
        self.connections.get(id).map(|c| c.backoff_delay)
    }

    /// Most recent failure recorded for a device
    pub fn last_error(&self, id: &str) -> Option<String> {
        self.connections.get(id).and_then(|c| c.last_error.clone())
    }

    /// Whether a reconnect timer is currently pending for a device
    pub fn has_pending_reconnect(&self, id: &str) -> bool {
        self.connections
            .get(id)
            .and_then(|c| c.reconnect.as_ref())
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Whether the poller has an armed cadence timer for a device
    pub fn is_polling(&self, id: &str) -> bool {
        self.poller.is_polling(id)
    }
}
