//! Connection manager multiplexing logical adapter connections.
//!
//! Every live link is tracked in a registry keyed by connection ID
//! (`"{kind}_{address}"`). Connect and disconnect serialize on the registry
//! mutex, so concurrent callers can never race on the same ID and iteration
//! never observes the registry mid-mutation. [ConnectionManager::send_data]
//! only holds the mutex for the initial lookup, a long-running exchange does
//! not block unrelated connects or disconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{Connector, TransportError, TransportHandle};
use crate::{Error, ObdResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
/// Supported connection kinds
pub enum ConnectionKind {
    /// Bluetooth Low Energy (GATT)
    #[strum(serialize = "ble")]
    BluetoothLe,
    /// Bluetooth Classic (RFCOMM)
    #[strum(serialize = "bt_classic")]
    BluetoothClassic,
    /// USB adapter
    #[strum(serialize = "usb")]
    Usb,
    /// Serial port
    #[strum(serialize = "serial")]
    Serial,
    /// WiFi adapter
    #[strum(serialize = "wifi")]
    Wifi,
}

struct ActiveConnection {
    kind: ConnectionKind,
    handle: Arc<Mutex<Box<dyn TransportHandle>>>,
}

/// Manages connections to automotive adapters across transport kinds
pub struct ConnectionManager {
    registry: Mutex<HashMap<String, ActiveConnection>>,
    ble_connector: Box<dyn Connector>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.list_connections())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager using `ble_connector` for
    /// [ConnectionKind::BluetoothLe] links. The remaining kinds are stubs
    /// that fail with [Error::Unsupported].
    pub fn new(ble_connector: Box<dyn Connector>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            ble_connector,
        }
    }

    /// Establishes a connection to the adapter at `address` and returns the
    /// connection ID used for all further calls.
    ///
    /// The whole attempt runs under the registry lock. On failure the
    /// registry is left unchanged.
    pub fn connect(&self, kind: ConnectionKind, address: &str) -> ObdResult<String> {
        let mut registry = self.registry.lock().unwrap();
        let connection_id = format!("{kind}_{address}");
        if registry.contains_key(&connection_id) {
            return Err(Error::ConnectionFailure(format!(
                "{connection_id} is already connected"
            )));
        }
        let handle = match kind {
            ConnectionKind::BluetoothLe => {
                self.ble_connector.connect(address).map_err(|e| {
                    log::error!("failed to connect to {address}: {e}");
                    Error::ConnectionFailure(format!("connection to {address} failed: {e}"))
                })?
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "{other} connections are not implemented"
                )));
            }
        };
        registry.insert(
            connection_id.clone(),
            ActiveConnection {
                kind,
                handle: Arc::new(Mutex::new(handle)),
            },
        );
        log::info!("connected to {address} via {kind}");
        Ok(connection_id)
    }

    /// Disconnects `connection_id` and removes it from the registry.
    ///
    /// Best effort: an unknown ID is a no-op and failures while closing the
    /// handle are logged, the registry entry is removed either way.
    pub fn disconnect(&self, connection_id: &str) {
        let mut registry = self.registry.lock().unwrap();
        if let Some(connection) = registry.remove(connection_id) {
            if let Err(e) = connection.handle.lock().unwrap().disconnect() {
                log::warn!("error disconnecting {connection_id}: {e}");
            } else {
                log::info!("disconnected {connection_id}");
            }
        }
    }

    /// Sends `data` on `connection_id` and waits up to `timeout` for the
    /// device response.
    ///
    /// An expired wait is reported as [Error::Timeout], distinct from
    /// [Error::ConnectionFailure], so callers can tell "device busy" from
    /// "device gone".
    pub fn send_data(
        &self,
        connection_id: &str,
        data: &[u8],
        timeout: Duration,
    ) -> ObdResult<Vec<u8>> {
        let handle = self
            .registry
            .lock()
            .unwrap()
            .get(connection_id)
            .map(|c| Arc::clone(&c.handle))
            .ok_or_else(|| Error::NoActiveConnection(connection_id.to_string()))?;
        let mut handle = handle.lock().unwrap();
        handle.send_receive(data, timeout).map_err(|e| match e {
            TransportError::Timeout => Error::Timeout(connection_id.to_string()),
            other => {
                log::error!("send on {connection_id} failed: {other}");
                Error::ConnectionFailure(format!("send on {connection_id} failed: {other}"))
            }
        })
    }

    /// Disconnects every active connection
    pub fn close_all(&self) {
        let ids: Vec<String> = self.registry.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.disconnect(&id);
        }
    }

    /// Read-only snapshot of connection ID to transport kind
    pub fn list_connections(&self) -> HashMap<String, ConnectionKind> {
        self.registry
            .lock()
            .unwrap()
            .iter()
            .map(|(id, conn)| (id.clone(), conn.kind))
            .collect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod connection_manager_test {
    use super::*;
    use crate::simulation::SimConnector;

    fn manager_with_echo() -> ConnectionManager {
        let connector = SimConnector::new();
        connector.add_response(b"ping", b"pong");
        ConnectionManager::new(Box::new(connector))
    }

    #[test]
    fn connect_returns_kind_prefixed_id() {
        let mgr = manager_with_echo();
        let id = mgr
            .connect(ConnectionKind::BluetoothLe, "AA:BB:CC:DD:EE:FF")
            .unwrap();
        assert_eq!(id, "ble_AA:BB:CC:DD:EE:FF");
        assert_eq!(
            mgr.list_connections().get(&id),
            Some(&ConnectionKind::BluetoothLe)
        );
    }

    #[test]
    fn kind_round_trips_through_its_wire_name() {
        use std::str::FromStr;
        assert_eq!(ConnectionKind::BluetoothLe.to_string(), "ble");
        assert_eq!(
            ConnectionKind::from_str("ble").unwrap(),
            ConnectionKind::BluetoothLe
        );
        assert!(ConnectionKind::from_str("zigbee").is_err());
    }

    #[test]
    fn duplicate_connect_is_rejected() {
        let mgr = manager_with_echo();
        mgr.connect(ConnectionKind::BluetoothLe, "AA:BB").unwrap();
        let res = mgr.connect(ConnectionKind::BluetoothLe, "AA:BB");
        assert!(matches!(res, Err(Error::ConnectionFailure(_))));
        assert_eq!(mgr.list_connections().len(), 1);
    }

    #[test]
    fn unimplemented_kinds_fail_fast() {
        let mgr = manager_with_echo();
        for kind in [
            ConnectionKind::BluetoothClassic,
            ConnectionKind::Usb,
            ConnectionKind::Serial,
            ConnectionKind::Wifi,
        ] {
            let res = mgr.connect(kind, "dev0");
            assert!(matches!(res, Err(Error::Unsupported(_))));
        }
        assert!(mgr.list_connections().is_empty());
    }

    #[test]
    fn failed_connect_leaves_registry_unchanged() {
        let mut connector = SimConnector::new();
        connector.refuse_connections();
        let mgr = ConnectionManager::new(Box::new(connector));
        let res = mgr.connect(ConnectionKind::BluetoothLe, "AA:BB");
        assert!(matches!(res, Err(Error::ConnectionFailure(_))));
        assert!(mgr.list_connections().is_empty());
    }

    #[test]
    fn send_data_round_trip() {
        let mgr = manager_with_echo();
        let id = mgr.connect(ConnectionKind::BluetoothLe, "AA:BB").unwrap();
        let resp = mgr
            .send_data(&id, b"ping", Duration::from_millis(100))
            .unwrap();
        assert_eq!(resp, b"pong");
    }

    #[test]
    fn send_data_on_unknown_id_is_no_active_connection() {
        let mgr = manager_with_echo();
        let res = mgr.send_data("ble_missing", b"ping", Duration::from_millis(10));
        match res {
            Err(Error::NoActiveConnection(id)) => assert_eq!(id, "ble_missing"),
            other => panic!("expected NoActiveConnection, got {other:?}"),
        }
    }

    #[test]
    fn slow_device_reports_timeout_not_connection_failure() {
        let mut connector = SimConnector::new();
        connector.add_response(b"ping", b"pong");
        connector.set_latency(Duration::from_millis(200));
        let mgr = ConnectionManager::new(Box::new(connector));
        let id = mgr.connect(ConnectionKind::BluetoothLe, "AA:BB").unwrap();
        let res = mgr.send_data(&id, b"ping", Duration::from_millis(20));
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[test]
    fn disconnect_unknown_id_is_noop() {
        let mgr = manager_with_echo();
        let id = mgr.connect(ConnectionKind::BluetoothLe, "AA:BB").unwrap();
        mgr.disconnect("ble_not_there");
        assert_eq!(mgr.list_connections().len(), 1);
        mgr.disconnect(&id);
        assert!(mgr.list_connections().is_empty());
    }

    #[test]
    fn close_all_empties_registry() {
        let mgr = manager_with_echo();
        mgr.connect(ConnectionKind::BluetoothLe, "AA:BB").unwrap();
        mgr.connect(ConnectionKind::BluetoothLe, "CC:DD").unwrap();
        mgr.close_all();
        assert!(mgr.list_connections().is_empty());
    }
}
