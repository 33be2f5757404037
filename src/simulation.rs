//! Simulated transport for unit testing the connection and protocol layers
//! without hardware.
//!
//! [SimTransport] answers requests from a scripted request to response map,
//! delivering the reply through the same bounded notification queue a real
//! transport would use. An optional latency makes the device "slow" so that
//! timeout paths can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::transport::{
    Advertisement, Connector, DiscoveryBackend, NotificationReceiver, NotificationSender,
    TransportError, TransportHandle, TransportResult, notification_queue,
};

/// Depth of the simulated notification queue
const SIM_QUEUE_CAPACITY: usize = 8;

type ScriptMap = Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>;

/// Scripted in-memory transport handle
#[derive(Debug)]
pub struct SimTransport {
    script: ScriptMap,
    connected: Arc<AtomicBool>,
    latency: Duration,
    notify_tx: NotificationSender,
    notify_rx: NotificationReceiver,
}

impl SimTransport {
    /// Creates a transport answering from the given request map
    pub fn new(script: ScriptMap) -> Self {
        let (notify_tx, notify_rx) = notification_queue(SIM_QUEUE_CAPACITY);
        Self {
            script,
            connected: Arc::new(AtomicBool::new(true)),
            latency: Duration::ZERO,
            notify_tx,
            notify_rx,
        }
    }

    /// Delays every response by `latency`, simulating a slow device
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }
}

impl TransportHandle for SimTransport {
    fn send_receive(&mut self, data: &[u8], timeout: Duration) -> TransportResult<Vec<u8>> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.notify_rx.drain();
        // A request not in the script never gets an answer, the wait below
        // then expires like a real unresponsive adapter.
        if let Some(resp) = self.script.read().unwrap().get(data).cloned() {
            if self.latency.is_zero() {
                self.notify_tx.push(resp);
            } else {
                let tx = self.notify_tx.clone();
                let delay = self.latency;
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    tx.push(resp);
                });
            }
        }
        self.notify_rx.wait(timeout)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Connector handing out [SimTransport]s that share one script map
#[derive(Debug, Default)]
pub struct SimConnector {
    script: ScriptMap,
    latency: Duration,
    refuse: bool,
}

impl SimConnector {
    /// Creates a connector with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the response the simulated device gives for `request`
    pub fn add_response(&self, request: &[u8], response: &[u8]) {
        self.script
            .write()
            .unwrap()
            .insert(request.to_vec(), response.to_vec());
    }

    /// Applies `latency` to every transport opened from now on
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }

    /// Makes every subsequent connect attempt fail
    pub fn refuse_connections(&mut self) {
        self.refuse = true;
    }
}

impl Connector for SimConnector {
    fn connect(&self, address: &str) -> TransportResult<Box<dyn TransportHandle>> {
        if self.refuse {
            return Err(TransportError::Other(format!(
                "simulated device {address} refused the connection"
            )));
        }
        log::debug!("simulated connect to {address}");
        let mut transport = SimTransport::new(self.script.clone());
        transport.set_latency(self.latency);
        Ok(Box::new(transport))
    }
}

/// Discovery backend replaying a fixed list of advertisements
#[derive(Debug, Default)]
pub struct SimDiscovery {
    advertisements: Vec<Advertisement>,
}

impl SimDiscovery {
    /// Creates an empty feed
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one advertisement to the replay list
    pub fn advertise(&mut self, advertisement: Advertisement) {
        self.advertisements.push(advertisement);
    }
}

impl DiscoveryBackend for SimDiscovery {
    fn discover(
        &mut self,
        _timeout: Duration,
        sink: &mut dyn FnMut(Advertisement),
    ) -> TransportResult<()> {
        for adv in &self.advertisements {
            sink(adv.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod sim_transport_test {
    use super::*;

    #[test]
    fn scripted_request_gets_scripted_response() {
        let connector = SimConnector::new();
        connector.add_response(b"ATZ\r", b"ELM327 v1.5\r>");
        let mut handle = connector.connect("AA:BB").unwrap();
        let resp = handle
            .send_receive(b"ATZ\r", Duration::from_millis(100))
            .unwrap();
        assert_eq!(resp, b"ELM327 v1.5\r>");
    }

    #[test]
    fn unscripted_request_times_out() {
        let connector = SimConnector::new();
        let mut handle = connector.connect("AA:BB").unwrap();
        let res = handle.send_receive(b"0100\r", Duration::from_millis(20));
        assert!(matches!(res, Err(TransportError::Timeout)));
    }

    #[test]
    fn disconnected_transport_refuses_io() {
        let connector = SimConnector::new();
        let mut handle = connector.connect("AA:BB").unwrap();
        handle.disconnect().unwrap();
        assert!(!handle.is_connected());
        let res = handle.send_receive(b"ATZ\r", Duration::from_millis(20));
        assert!(matches!(res, Err(TransportError::NotConnected)));
    }
}
