//! Timeout-bounded device polling
//!
//! Each connected device is refreshed on its own fixed cadence. A tick is
//! skipped outright when the device is not connected or a refresh is still in
//! flight, so at most one request is ever outstanding per device and a slow
//! device never delays the others. Results are reported back to the
//! connection manager, which forwards measurements to the aggregator and
//! escalates connection-level failures to a reconnect.

use crate::connections::ManagerMsg;
use crate::error::GridfluxError;
use crate::logging::get_logger;
use crate::scheduler::ScheduledTask;
use crate::transport::{DeviceTransport, MeasuredField};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Poll bookkeeping for one device
struct PollEntry {
    /// Per-refresh timeout
    timeout: Duration,

    /// Whether a refresh is currently outstanding
    in_flight: bool,

    /// Tick timer; aborted when the entry is dropped
    _ticker: ScheduledTask,
}

/// Drives per-device refresh cycles
pub struct Poller {
    entries: HashMap<String, PollEntry>,
    logger: crate::logging::StructuredLogger,
}

impl Poller {
    /// Create an empty poller
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            logger: get_logger("poller"),
        }
    }

    /// Arm the recurring tick for a device.
    ///
    /// Re-arming an already polled device replaces (and thereby cancels) the
    /// previous timer.
    pub fn start(
        &mut self,
        id: &str,
        interval: Duration,
        timeout: Duration,
        tx: &UnboundedSender<ManagerMsg>,
    ) {
        let tick_id = id.to_string();
        let ticker = ScheduledTask::repeating(interval, tx.clone(), move || {
            ManagerMsg::PollTick(tick_id.clone())
        });
        self.entries.insert(
            id.to_string(),
            PollEntry {
                timeout,
                in_flight: false,
                _ticker: ticker,
            },
        );
        self.logger.debug(&format!(
            "Polling {} every {:.0}s with a {:.0}s timeout",
            id,
            interval.as_secs_f64(),
            timeout.as_secs_f64()
        ));
    }

    /// Stop polling a device and cancel its tick timer
    pub fn stop(&mut self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.logger.debug(&format!("Stopped polling {}", id));
        }
    }

    /// Whether a device has an armed tick timer
    pub fn is_polling(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether a refresh is currently outstanding for a device
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.entries.get(id).map(|e| e.in_flight).unwrap_or(false)
    }

    /// React to a tick: spawn one refresh raced against the timeout, unless
    /// the device is not connected or a refresh is already outstanding.
    pub fn handle_tick(
        &mut self,
        id: &str,
        connected: bool,
        transport: Arc<Mutex<Box<dyn DeviceTransport>>>,
        tx: &UnboundedSender<ManagerMsg>,
    ) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if !connected {
            self.logger
                .trace(&format!("Skipping poll tick for {} while not connected", id));
            return;
        }
        if entry.in_flight {
            self.logger.debug(&format!(
                "Skipping poll tick for {}, previous refresh still in flight",
                id
            ));
            return;
        }

        entry.in_flight = true;
        let timeout = entry.timeout;
        let id = id.to_string();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, async {
                let mut transport = transport.lock().await;
                transport.refresh(MeasuredField::ALL).await
            })
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GridfluxError::timeout(format!(
                    "Refresh timed out after {:.0}s",
                    timeout.as_secs_f64()
                ))),
            };
            let _ = tx.send(ManagerMsg::PollFinished { id, result });
        });
    }

    /// Clear the in-flight marker once a refresh resolved
    pub fn finish(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.in_flight = false;
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockState, MockTransport};
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    fn shared_transport(
        state: Arc<MockState>,
        refresh_delay: Duration,
    ) -> Arc<Mutex<Box<dyn DeviceTransport>>> {
        let mut transport = MockTransport::new(state);
        transport.refresh_delay = refresh_delay;
        Arc::new(Mutex::new(Box::new(transport) as Box<dyn DeviceTransport>))
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_refresh_in_flight_per_device() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState::default());
        let transport = shared_transport(state.clone(), Duration::from_secs(5));

        let mut poller = Poller::new();
        poller.start("meter", Duration::from_secs(1), Duration::from_secs(30), &tx);
        // Drain the immediate first tick from arming the timer
        let _ = rx.recv().await;

        poller.handle_tick("meter", true, transport.clone(), &tx);
        assert!(poller.is_in_flight("meter"));

        // Ticks keep firing while the refresh is still running
        poller.handle_tick("meter", true, transport.clone(), &tx);
        poller.handle_tick("meter", true, transport.clone(), &tx);

        tokio::time::advance(Duration::from_secs(6)).await;
        // Skip over queued ticks until the refresh outcome arrives
        let result = loop {
            match rx.recv().await {
                Some(ManagerMsg::PollFinished { result, .. }) => break result,
                Some(_) => continue,
                None => panic!("channel closed before the poll finished"),
            }
        };
        assert!(result.is_ok());
        assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);

        // Once finished, the next tick issues a new refresh
        poller.finish("meter");
        poller.handle_tick("meter", true, transport, &tx);
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_is_reported_as_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState::default());
        let transport = shared_transport(state, Duration::from_secs(60));

        let mut poller = Poller::new();
        poller.start("meter", Duration::from_secs(10), Duration::from_secs(2), &tx);
        let _ = rx.recv().await;

        poller.handle_tick("meter", true, transport, &tx);
        tokio::time::advance(Duration::from_secs(3)).await;

        match rx.recv().await {
            Some(ManagerMsg::PollFinished {
                result: Err(err), ..
            }) => {
                assert!(matches!(err, GridfluxError::Timeout { .. }));
                assert!(crate::transport::is_connection_error(&err));
            }
            other => panic!("expected a timed-out poll, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_are_skipped_while_disconnected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState::default());
        let transport = shared_transport(state.clone(), Duration::ZERO);

        let mut poller = Poller::new();
        poller.start("meter", Duration::from_secs(1), Duration::from_secs(5), &tx);
        let _ = rx.recv().await;

        poller.handle_tick("meter", false, transport, &tx);
        assert!(!poller.is_in_flight("meter"));
        assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_tick_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut poller = Poller::new();
        poller.start("meter", Duration::from_secs(1), Duration::from_secs(5), &tx);
        let _ = rx.recv().await;

        poller.stop("meter");
        assert!(!poller.is_polling("meter"));

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
