//! Observes the daemon and persists completed circuits as trace records.
//!
//! Each circuit the daemon builds is tracked from its first event to its
//! close; when it terminates it is written out as one trace record,
//! provided it was built with a path. Streams are attributed to circuits
//! through the session tag carried in their `USERNAME` field, so that a
//! later replay can reproduce the same stream-to-circuit mapping.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use oniontrace_proto::{CircId, CircuitStatus, StreamId, StreamStatus};

use crate::circuit::Circuit;
use crate::torctl::ControlCommands;
use crate::tracefile::{TraceFileError, TraceWriter};

/// Records every circuit the daemon completes during a run.
pub(crate) struct Recorder {
    /// When recording started; trace offsets are relative to this.
    start_time: SystemTime,
    /// Where completed circuits get persisted.
    writer: TraceWriter,
    /// Circuits the daemon currently has open, by id.
    active: HashMap<CircId, Circuit>,
    /// Circuits observed to finish building.
    n_built: u64,
    /// Circuits persisted to the trace.
    n_recorded: u64,
    /// Streams observed to attach successfully.
    n_streams: u64,
}

impl Recorder {
    /// Start recording into the trace file at `path`.
    pub(crate) fn new(
        ctl: &mut dyn ControlCommands,
        path: &Path,
    ) -> Result<Self, TraceFileError> {
        let writer = TraceWriter::create(path)?;
        info!(path = %path.display(), "recording circuits");
        Ok(Self::with_writer(ctl, writer))
    }

    /// Start recording into an existing writer.
    pub(crate) fn with_writer(ctl: &mut dyn ControlCommands, writer: TraceWriter) -> Self {
        let recorder = Self {
            start_time: SystemTime::now(),
            writer,
            active: HashMap::new(),
            n_built: 0,
            n_recorded: 0,
            n_streams: 0,
        };
        ctl.watch_events("CIRC STREAM");
        // Pick up any circuits that were already open before we started.
        ctl.request_circuit_status();
        recorder
    }

    /// Track one circuit status change.
    pub(crate) fn on_circuit_status(
        &mut self,
        status: CircuitStatus,
        circ_id: CircId,
        path: Option<String>,
    ) {
        match status {
            CircuitStatus::Launched | CircuitStatus::Extended | CircuitStatus::Assigned => {
                let circuit = self.track(circ_id);
                circuit.status = status;
                if path.is_some() {
                    circuit.path = path;
                }
            }
            CircuitStatus::Built => {
                let circuit = self.track(circ_id);
                circuit.status = CircuitStatus::Built;
                if path.is_some() {
                    circuit.path = path;
                }
                self.n_built += 1;
            }
            CircuitStatus::Failed | CircuitStatus::Closed => {
                if let Some(circuit) = self.active.remove(&circ_id) {
                    self.record(circuit);
                }
            }
            CircuitStatus::Unlaunched => {}
            _ => {}
        }
    }

    /// Track one stream status change.
    ///
    /// Only successful attachments matter here: they tell us which circuit
    /// a stream landed on, and which session it belongs to.
    pub(crate) fn on_stream_status(
        &mut self,
        ctl: &mut dyn ControlCommands,
        status: StreamStatus,
        circ_id: CircId,
        stream_id: StreamId,
        username: Option<String>,
    ) {
        if status != StreamStatus::Succeeded {
            return;
        }
        match self.active.get_mut(&circ_id) {
            Some(circuit) => {
                circuit.n_streams += 1;
                self.n_streams += 1;
                if let Some(user) = username {
                    match &circuit.session_id {
                        None => {
                            debug!(circ_id, session = user.as_str(), "session attributed");
                            circuit.session_id = Some(user);
                        }
                        Some(existing) if existing != &user => warn!(
                            circ_id,
                            existing = existing.as_str(),
                            new = user.as_str(),
                            "circuit carried streams from two sessions; keeping the first"
                        ),
                        Some(_) => {}
                    }
                }
            }
            None => {
                // We never saw this circuit get built, so its path is
                // unknown. Close it: the replacement gets observed from
                // launch.
                info!(
                    circ_id,
                    stream_id, "stream attached to an untracked circuit; closing it"
                );
                ctl.close_circuit(circ_id);
            }
        }
    }

    /// Flush still-open circuits to the trace ahead of shutdown.
    ///
    /// Asks for every open circuit in cleanup mode; the resulting `CLOSED`
    /// replays route back through
    /// [`on_circuit_status`](Recorder::on_circuit_status) and persist each
    /// tracked circuit.
    pub(crate) fn cleanup(&mut self, ctl: &mut dyn ControlCommands) {
        info!("asking the daemon for open circuits so they can be recorded");
        ctl.request_circuit_status_cleanup();
    }

    /// Persist everything still tracked. Called at teardown.
    pub(crate) fn finish(&mut self) {
        let leftovers: Vec<Circuit> = self.active.drain().map(|(_, c)| c).collect();
        for circuit in leftovers {
            self.record(circuit);
        }
    }

    /// One-line status snapshot for the heartbeat.
    pub(crate) fn status_line(&self) -> String {
        format!(
            "n_circs_active={} n_circs_built={} n_circs_recorded={} n_strms_seen={}",
            self.active.len(),
            self.n_built,
            self.n_recorded,
            self.n_streams
        )
    }

    /// Get or create the tracked entry for `circ_id`.
    fn track(&mut self, circ_id: CircId) -> &mut Circuit {
        self.active.entry(circ_id).or_insert_with(|| {
            debug!(circ_id, "tracking new circuit");
            let mut circuit = Circuit::new(SystemTime::now());
            circuit.circuit_id = Some(circ_id);
            circuit
        })
    }

    /// Persist one finished circuit, if it ever got a path.
    fn record(&mut self, circuit: Circuit) {
        if circuit.path.is_none() {
            debug!(circ_id = ?circuit.circuit_id, "dropping path-less circuit");
            return;
        }
        match self.writer.write_circuit(&circuit, self.start_time) {
            Ok(()) => {
                self.n_recorded += 1;
                info!(
                    circ_id = ?circuit.circuit_id,
                    session = ?circuit.session_id,
                    "recorded circuit"
                );
            }
            Err(e) => warn!(error = %e, "unable to record circuit"),
        }
    }
}
