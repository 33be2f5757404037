//! End-to-end walk-through against a scripted ELM327 adapter: connect,
//! bring the protocol up, query live data, read and clear trouble codes.

use std::sync::Arc;
use std::time::Duration;

use obd_bridge::connection::{ConnectionKind, ConnectionManager};
use obd_bridge::obd2::{
    DEFAULT_COMMAND_TIMEOUT, DecodedValue, EngineState, Obd2Engine, WireMode, mode01_command,
};
use obd_bridge::simulation::SimConnector;

fn scripted_adapter() -> SimConnector {
    let connector = SimConnector::new();
    // ELM327 bring-up chatter
    connector.add_response(b"ATZ\r", b"ELM327 v1.5\r\r>");
    connector.add_response(b"ATE0\r", b"OK\r\r>");
    connector.add_response(b"ATL0\r", b"OK\r\r>");
    connector.add_response(b"ATS0\r", b"OK\r\r>");
    connector.add_response(b"ATH1\r", b"OK\r\r>");
    connector.add_response(b"ATSP0\r", b"OK\r\r>");
    // Liveness probe and PID support bitmap
    connector.add_response(b"01 01\r", b"41 01 00 07 E5 00\r\r>");
    connector.add_response(b"01 00\r", b"41 00 BE 1F B8 10\r\r>");
    // Live data
    connector.add_response(b"01 0C\r", b"41 0C 1A 2B\r\r>");
    connector.add_response(b"01 05\r", b"41 05 7B\r\r>");
    // Trouble codes
    connector.add_response(b"03\r", b"43 01 03 01 04 00 00\r\r>");
    connector.add_response(b"04\r", b"44\r\r>");
    connector
}

fn ready_engine() -> (Arc<ConnectionManager>, Obd2Engine) {
    let _ = env_logger::builder().is_test(true).try_init();
    let manager = Arc::new(ConnectionManager::new(Box::new(scripted_adapter())));
    let id = manager
        .connect(ConnectionKind::BluetoothLe, "AA:BB:CC:DD:EE:FF")
        .unwrap();
    let mut engine = Obd2Engine::new(manager.clone(), id);
    assert!(engine.initialize());
    assert_eq!(engine.state(), EngineState::Ready);
    (manager, engine)
}

#[test]
fn initialize_probes_vehicle_and_discovers_pids() {
    let (_manager, engine) = ready_engine();
    assert!(engine.is_pid_supported(0x0C));
    assert!(engine.is_pid_supported(0x05));
    assert!(!engine.is_pid_supported(0x02));
    assert!(!engine.supported_pids().is_empty());
    assert!(!engine.supported_pids_for(0x00).is_empty());
    assert!(engine.supported_pids_for(0x20).is_empty());
}

#[test]
fn engine_rpm_is_formula_converted() {
    let (_manager, engine) = ready_engine();
    let rpm = mode01_command(0x0C).unwrap();
    let response = engine.send_command(rpm, DEFAULT_COMMAND_TIMEOUT);
    assert!(response.success);
    assert_eq!(response.value, DecodedValue::Number(1673.75));

    let coolant = mode01_command(0x05).unwrap();
    let response = engine.send_command(coolant, DEFAULT_COMMAND_TIMEOUT);
    assert_eq!(response.value, DecodedValue::Number(83.0));
}

#[test]
fn stored_codes_round_trip() {
    let (_manager, engine) = ready_engine();
    let codes: Vec<String> = engine
        .read_dtc_codes()
        .iter()
        .map(|c| c.to_string())
        .collect();
    assert_eq!(codes, vec!["P0103".to_string(), "P0104".to_string()]);
    assert!(engine.clear_dtc_codes());
}

#[test]
fn unresponsive_vehicle_faults_the_engine() {
    let _ = env_logger::builder().is_test(true).try_init();
    let connector = SimConnector::new();
    connector.add_response(b"ATZ\r", b"ELM327 v1.5\r\r>");
    connector.add_response(b"ATE0\r", b"OK\r\r>");
    connector.add_response(b"ATL0\r", b"OK\r\r>");
    connector.add_response(b"ATS0\r", b"OK\r\r>");
    connector.add_response(b"ATH1\r", b"OK\r\r>");
    connector.add_response(b"ATSP0\r", b"OK\r\r>");
    connector.add_response(b"01 01\r", b"NO DATA\r\r>");

    let manager = Arc::new(ConnectionManager::new(Box::new(connector)));
    let id = manager
        .connect(ConnectionKind::BluetoothLe, "AA:BB")
        .unwrap();
    let mut engine = Obd2Engine::new(manager, id);
    assert!(!engine.initialize());
    assert_eq!(engine.state(), EngineState::Faulted);
    // Faulted is terminal for this instance
    assert!(!engine.initialize());
    assert_eq!(engine.state(), EngineState::Faulted);
}

#[test]
fn failed_command_is_reported_not_raised() {
    let (_manager, engine) = ready_engine();
    // 0x0D is not in the script, the exchange times out
    let speed = mode01_command(0x0D).unwrap();
    let response = engine.send_command(speed, Duration::from_millis(50));
    assert!(!response.success);
    assert!(response.error_message.is_some());
}

#[test]
fn raw_wire_mode_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let connector = SimConnector::new();
    connector.add_response(&[0x01, 0x0C], &[0x41, 0x0C, 0x1A, 0x2B]);
    connector.add_response(&[0x01, 0x01], &[0x41, 0x01, 0x00, 0x07, 0xE5, 0x00]);
    connector.add_response(&[0x01, 0x00], &[0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10]);

    let manager = Arc::new(ConnectionManager::new(Box::new(connector)));
    let id = manager
        .connect(ConnectionKind::BluetoothLe, "AA:BB")
        .unwrap();
    let mut engine = Obd2Engine::with_wire_mode(manager, id, WireMode::Raw);
    assert!(engine.initialize());

    let rpm = mode01_command(0x0C).unwrap();
    let response = engine.send_command(rpm, DEFAULT_COMMAND_TIMEOUT);
    assert!(response.success);
    assert_eq!(response.value, DecodedValue::Number(1673.75));
}
