//! Replays a recorded trace: rebuilds circuits on schedule and attaches
//! each session's streams to that session's current circuit.
//!
//! Circuits are requested ahead of their recorded launch time so they are
//! ready when streams arrive. The daemon reports a new circuit's id in a
//! positional reply with no correlation id, so at most one build may be
//! outstanding at a time; sessions that want to build while another
//! assignment is pending wait in a FIFO backlog.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use oniontrace_proto::{CircId, CircuitStatus, StreamId, StreamStatus};

use crate::circuit::Circuit;
use crate::torctl::ControlCommands;
use crate::tracefile::{self, TraceFileError};

/// How long before its recorded launch time a circuit's build is started.
const PREBUILD_LEAD: Duration = Duration::from_secs(10);

/// Build failures tolerated before falling back to daemon-chosen paths.
const MAX_PATH_FAILURES: u32 = 3;

/// An entry waiting on a session's current circuit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PendingStream {
    /// Build the circuit ahead of schedule; nothing to attach yet.
    Prebuild,
    /// Attach this stream once the circuit is built.
    Attach(StreamId),
}

/// One logical session: an ordered run of circuits and its waiting streams.
#[derive(Debug)]
struct Session {
    /// The session's circuits, future and current, ordered by launch time.
    /// The front is the current circuit.
    circuits: VecDeque<Circuit>,
    /// Streams (and prebuild markers) waiting for the current circuit.
    waiting: VecDeque<PendingStream>,
}

impl Session {
    /// Return a new session with no circuits.
    fn new() -> Self {
        Self {
            circuits: VecDeque::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Insert a circuit, keeping the launch-time ordering.
    fn insert_circuit(&mut self, circuit: Circuit) {
        let pos = self
            .circuits
            .iter()
            .position(|c| c.launch_time > circuit.launch_time)
            .unwrap_or(self.circuits.len());
        self.circuits.insert(pos, circuit);
    }
}

/// A scheduled circuit build.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Launch {
    /// When to start the build (launch time minus the prebuild lead).
    at: SystemTime,
    /// The session whose current circuit should be built.
    session: String,
}

/// Counters reported in the heartbeat snapshot.
#[derive(Clone, Copy, Debug, Default)]
struct Counts {
    /// Streams queued and not yet attached.
    streams_assigning: u32,
    /// Streams attached to a circuit.
    streams_assigned: u32,
    /// Streams that went on to succeed.
    streams_succeeded: u32,
    /// Streams that failed.
    streams_failed: u32,
    /// Streams detached from their circuit.
    streams_detached: u32,
    /// Circuit builds in flight.
    circuits_building: u32,
    /// Circuits built.
    circuits_built: u32,
    /// Circuit builds that failed.
    circuits_failed: u32,
}

/// Replays a recorded trace against the daemon.
pub(crate) struct Player {
    /// Sessions by id; each owns its circuits.
    sessions: HashMap<String, Session>,
    /// Which session holds each daemon-assigned circuit id.
    ///
    /// Entries are removed the moment a circuit's id is reset.
    circuits: HashMap<CircId, String>,
    /// Scheduled builds, earliest first.
    launches: BinaryHeap<Reverse<Launch>>,
    /// The session whose `EXTENDCIRCUIT` reply is outstanding, if any.
    awaiting_assignment: Option<String>,
    /// Sessions waiting their turn to build, in FIFO order.
    backlog: VecDeque<String>,
    /// Heartbeat counters.
    counts: Counts,
}

impl Player {
    /// Load the trace at `path` and configure the daemon for replay.
    pub(crate) fn new(
        ctl: &mut dyn ControlCommands,
        path: &Path,
    ) -> Result<Self, TraceFileError> {
        let start_time = SystemTime::now();
        let circuits = tracefile::read_circuits(path, start_time)?;
        let n_parsed = circuits.len();
        let player = Self::from_circuits(ctl, circuits);
        info!(
            n_parsed,
            n_sessions = player.sessions.len(),
            path = %path.display(),
            "loaded trace"
        );
        Ok(player)
    }

    /// Build a player from already-parsed circuits.
    ///
    /// Records without both a session and a path cannot be replayed
    /// deterministically and are dropped.
    pub(crate) fn from_circuits(ctl: &mut dyn ControlCommands, circuits: Vec<Circuit>) -> Self {
        let mut player = Self {
            sessions: HashMap::new(),
            circuits: HashMap::new(),
            launches: BinaryHeap::new(),
            awaiting_assignment: None,
            backlog: VecDeque::new(),
            counts: Counts::default(),
        };

        for mut circuit in circuits {
            if circuit.path.is_none() {
                continue;
            }
            let Some(session_id) = circuit.session_id.clone() else {
                continue;
            };
            circuit.status = CircuitStatus::Unlaunched;
            circuit.circuit_id = None;
            let launch_at = circuit
                .launch_time
                .checked_sub(PREBUILD_LEAD)
                .unwrap_or(circuit.launch_time);
            player
                .sessions
                .entry(session_id.clone())
                .or_insert_with(Session::new)
                .insert_circuit(circuit);
            player.launches.push(Reverse(Launch {
                at: launch_at,
                session: session_id,
            }));
        }

        // Configure manual stream attachment before asking for events, so
        // no stream slips past us.
        ctl.configure_daemon();
        ctl.watch_events("CIRC STREAM");
        player
    }

    /// Start every build whose time has come.
    ///
    /// Returns the delay until the next scheduled build, or `None` when
    /// nothing further is scheduled.
    pub(crate) fn launch_next_circuit(
        &mut self,
        ctl: &mut dyn ControlCommands,
    ) -> Option<Duration> {
        let now = SystemTime::now();
        let mut due = false;
        loop {
            match self.launches.peek() {
                Some(Reverse(launch)) if launch.at <= now => {}
                _ => break,
            }
            let Some(Reverse(launch)) = self.launches.pop() else {
                break;
            };
            if let Some(session) = self.sessions.get_mut(&launch.session) {
                session.waiting.push_back(PendingStream::Prebuild);
            }
            self.backlog.push_back(launch.session);
            due = true;
        }
        if due {
            self.drain_backlog(ctl);
        }

        let Reverse(next) = self.launches.peek()?;
        Some(
            next.at
                .duration_since(SystemTime::now())
                .unwrap_or_default(),
        )
    }

    /// Track one circuit status change.
    pub(crate) fn on_circuit_status(
        &mut self,
        ctl: &mut dyn ControlCommands,
        status: CircuitStatus,
        circ_id: CircId,
        path: Option<String>,
    ) {
        match status {
            CircuitStatus::Assigned => {
                debug!(circ_id, "daemon assigned a circuit id");
                let Some(session_id) = self.awaiting_assignment.take() else {
                    return;
                };
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    if let Some(circuit) = session.circuits.front_mut() {
                        circuit.circuit_id = Some(circ_id);
                        circuit.status = CircuitStatus::Assigned;
                        info!(circ_id, session = session_id.as_str(), "circuit id assigned");
                        self.circuits.insert(circ_id, session_id.clone());
                    }
                }
                self.drain_backlog(ctl);
            }
            CircuitStatus::Built => {
                let Some(session_id) = self.circuits.get(&circ_id).cloned() else {
                    debug!(circ_id, "build completed for a circuit we do not track");
                    return;
                };
                self.counts.circuits_building = self.counts.circuits_building.saturating_sub(1);
                self.counts.circuits_built += 1;
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    if let Some(circuit) = session.circuits.front_mut() {
                        if circuit.circuit_id == Some(circ_id) {
                            circuit.status = CircuitStatus::Built;
                        }
                    }
                }
                info!(circ_id, session = session_id.as_str(), path = ?path, "circuit built");
                self.handle_session(ctl, &session_id);
            }
            CircuitStatus::Failed | CircuitStatus::Closed => {
                let Some(session_id) = self.circuits.remove(&circ_id) else {
                    return;
                };
                debug!(circ_id, %status, session = session_id.as_str(), "circuit gone");
                if status == CircuitStatus::Failed {
                    self.counts.circuits_failed += 1;
                }
                let Some(session) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                if let Some(circuit) = session.circuits.front_mut() {
                    if circuit.circuit_id == Some(circ_id) {
                        circuit.circuit_id = None;
                        circuit.status = CircuitStatus::Unlaunched;
                        if status == CircuitStatus::Failed {
                            circuit.n_failures += 1;
                        }
                    }
                }
                if !session.waiting.is_empty() {
                    info!(
                        session = session_id.as_str(),
                        "circuit went away with streams waiting; retrying"
                    );
                    self.backlog.push_back(session_id);
                    self.drain_backlog(ctl);
                }
            }
            CircuitStatus::Launched | CircuitStatus::Extended => {}
            CircuitStatus::Unlaunched => {}
            _ => {}
        }
    }

    /// Track one stream status change.
    pub(crate) fn on_stream_status(
        &mut self,
        ctl: &mut dyn ControlCommands,
        status: StreamStatus,
        stream_id: StreamId,
        username: Option<String>,
    ) {
        let session_known = username
            .as_deref()
            .is_some_and(|user| self.sessions.contains_key(user));
        match status {
            StreamStatus::Detached | StreamStatus::New => {
                if status == StreamStatus::Detached && session_known {
                    self.counts.streams_detached += 1;
                }
                // A detached stream needs a circuit again, exactly like a
                // new one.
                let Some(user) = username else {
                    debug!(stream_id, "stream has no session tag; daemon may attach it");
                    ctl.attach_stream(stream_id, 0);
                    return;
                };
                if !session_known {
                    // The session never completed a circuit while recording.
                    warn!(session = user.as_str(), "stream for an unknown session");
                    self.sessions.insert(user.clone(), Session::new());
                }
                if let Some(session) = self.sessions.get_mut(&user) {
                    if session.circuits.is_empty() {
                        // Ran out of recorded circuits; build an unplanned
                        // one and let the daemon choose its path.
                        warn!(session = user.as_str(), "session has no circuits left");
                        let mut circuit = Circuit::new(SystemTime::now());
                        circuit.session_id = Some(user.clone());
                        session.insert_circuit(circuit);
                    }
                    session.waiting.push_back(PendingStream::Attach(stream_id));
                }
                self.counts.streams_assigning += 1;
                self.backlog.push_back(user);
                self.drain_backlog(ctl);
            }
            StreamStatus::Failed => {
                if session_known {
                    self.counts.streams_failed += 1;
                }
            }
            StreamStatus::Succeeded => {
                if session_known {
                    self.counts.streams_succeeded += 1;
                }
            }
            StreamStatus::Closed => {}
            _ => {}
        }
    }

    /// One-line status snapshot for the heartbeat.
    pub(crate) fn status_line(&self) -> String {
        format!(
            "n_strms_assigning={} n_strms_assigned={} n_strms_succeeded={} \
             n_strms_failed={} n_strms_detached={} n_circs_building={} \
             n_circs_built={} n_circs_failed={}",
            self.counts.streams_assigning,
            self.counts.streams_assigned,
            self.counts.streams_succeeded,
            self.counts.streams_failed,
            self.counts.streams_detached,
            self.counts.circuits_building,
            self.counts.circuits_built,
            self.counts.circuits_failed,
        )
    }

    /// Handle backlogged sessions until one is left awaiting assignment.
    fn drain_backlog(&mut self, ctl: &mut dyn ControlCommands) {
        while self.awaiting_assignment.is_none() {
            let Some(session_id) = self.backlog.pop_front() else {
                break;
            };
            self.handle_session(ctl, &session_id);
        }
    }

    /// Advance one session: rotate to its scheduled circuit, launch a build
    /// if it needs one, or attach its waiting streams.
    fn handle_session(&mut self, ctl: &mut dyn ControlCommands, session_id: &str) {
        let now = SystemTime::now();
        let Some(session) = self.sessions.get_mut(session_id) else {
            warn!(session = session_id, "no such session");
            return;
        };

        // Rotate when the next recorded circuit's launch time has arrived.
        let rotate = matches!(session.circuits.get(1), Some(next) if next.launch_time <= now);
        if rotate {
            if let Some(old) = session.circuits.pop_front() {
                if let Some(old_id) = old.circuit_id {
                    self.circuits.remove(&old_id);
                }
                info!(
                    session = session_id,
                    old_circuit = ?old.circuit_id,
                    "rotating to the session's next circuit"
                );
            }
        }

        let Some(circuit) = session.circuits.front_mut() else {
            debug!(session = session_id, "session has no circuits to handle");
            return;
        };

        match circuit.status {
            CircuitStatus::Unlaunched => match self.awaiting_assignment.as_deref() {
                Some(waiting) if waiting == session_id => {
                    debug!(session = session_id, "waiting for our circuit id");
                }
                Some(_) => {
                    debug!(session = session_id, "assignment pending elsewhere; backlogged");
                    self.backlog.push_back(session_id.to_owned());
                }
                None => {
                    if circuit.n_failures >= MAX_PATH_FAILURES {
                        // The recorded path keeps failing; let the daemon
                        // pick relays instead.
                        ctl.build_circuit(None);
                        info!(
                            session = session_id,
                            "launching circuit without a path after repeated failures"
                        );
                    } else {
                        ctl.build_circuit(circuit.path.as_deref());
                        info!(session = session_id, path = ?circuit.path, "launching circuit");
                    }
                    circuit.status = CircuitStatus::Launched;
                    self.counts.circuits_building += 1;
                    self.awaiting_assignment = Some(session_id.to_owned());
                }
            },
            CircuitStatus::Launched => {
                debug!(session = session_id, "circuit id not assigned yet");
            }
            CircuitStatus::Assigned => {
                debug!(
                    session = session_id,
                    circuit = ?circuit.circuit_id,
                    "circuit not built yet"
                );
            }
            CircuitStatus::Built => {
                let circ_id = circuit.circuit_id.unwrap_or(0);
                while let Some(pending) = session.waiting.pop_front() {
                    match pending {
                        PendingStream::Attach(stream_id) => {
                            ctl.attach_stream(stream_id, circ_id);
                            self.counts.streams_assigning =
                                self.counts.streams_assigning.saturating_sub(1);
                            self.counts.streams_assigned += 1;
                            info!(
                                stream_id,
                                circ_id,
                                session = session_id,
                                "stream assigned to circuit"
                            );
                        }
                        PendingStream::Prebuild => {
                            debug!(circ_id, session = session_id, "circuit built ahead of need");
                        }
                    }
                }
            }
            _ => {
                warn!(
                    session = session_id,
                    status = %circuit.status,
                    "current circuit in an unexpected status"
                );
            }
        }
    }
}
