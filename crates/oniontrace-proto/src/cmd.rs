//! Builders for outbound control-port commands.
//!
//! Every function returns one complete, CRLF-terminated command string,
//! ready for the transport's outbound queue.

use crate::event::{CircId, StreamId};

/// `AUTHENTICATE` with a quoted password.
pub fn authenticate(password: &str) -> String {
    format!("AUTHENTICATE \"{}\"\r\n", password)
}

/// Query the daemon's bootstrap phase.
pub fn getinfo_bootstrap_phase() -> String {
    "GETINFO status/bootstrap-phase\r\n".to_owned()
}

/// Fetch the full set of relay descriptors.
pub fn getinfo_ns_all() -> String {
    "GETINFO ns/all\r\n".to_owned()
}

/// Fetch the status of every circuit the daemon has open.
pub fn getinfo_circuit_status() -> String {
    "GETINFO circuit-status\r\n".to_owned()
}

/// Subscribe to a space-delimited event set; an empty set clears the
/// subscription.
pub fn set_events(space_delimited: &str) -> String {
    if space_delimited.is_empty() {
        "SETEVENTS\r\n".to_owned()
    } else {
        format!("SETEVENTS {}\r\n", space_delimited)
    }
}

/// Keep streams unattached until we attach them, and stretch circuit
/// lifetimes past the length of an experiment.
pub fn setconf_manual_attachment() -> String {
    "SETCONF __LeaveStreamsUnattached=1 __DisablePredictedCircuits=1 \
     MaxCircuitDirtiness=1200 CircuitStreamTimeout=1200\r\n"
        .to_owned()
}

/// Ask the daemon to stop reusing any pre-existing circuits.
pub fn signal_newnym() -> String {
    "SIGNAL NEWNYM\r\n".to_owned()
}

/// Build a new circuit, optionally along an explicit relay path.
pub fn extend_circuit(path: Option<&str>) -> String {
    match path {
        Some(path) => format!("EXTENDCIRCUIT 0 {}\r\n", path),
        None => "EXTENDCIRCUIT 0\r\n".to_owned(),
    }
}

/// Attach a stream to a circuit; circuit id 0 delegates the choice to the
/// daemon.
pub fn attach_stream(stream: StreamId, circuit: CircId) -> String {
    format!("ATTACHSTREAM {} {}\r\n", stream, circuit)
}

/// Close a circuit.
pub fn close_circuit(circuit: CircId) -> String {
    format!("CLOSECIRCUIT {}\r\n", circuit)
}

/// Close a stream.
pub fn close_stream(stream: StreamId) -> String {
    format!("CLOSESTREAM {} REASON_MISC\r\n", stream)
}
