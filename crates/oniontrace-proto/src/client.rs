//! The control-connection state machine.
//!
//! [`ControlClient`] is the sans-I/O half of the controller's connection to
//! the daemon. The transport feeds it one decoded line at a time; it walks
//! the conversation through authentication and bootstrap, decodes
//! asynchronous notifications into [`CtlEvent`]s, reassembles dotted
//! multi-line `GETINFO` replies, and queues command strings for the
//! transport to write.

use std::collections::VecDeque;

use tracing::{debug, error, info, trace, warn};

use crate::cmd;
use crate::event::{parse_circ_line, parse_extended_reply, parse_stream_line, CtlEvent};
use crate::reply::{self, decimal_prefix, starts_with_ignore_ascii_case};
use crate::status::CircuitStatus;
use crate::{CircId, StreamId};

/// The password the daemon is provisioned with in these experiments.
const CONTROL_PASSWORD: &str = "password";

/// Progress of the conversation toward its operational state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ClientState {
    /// Connected, but no command has been issued yet.
    Idle,
    /// `AUTHENTICATE` sent; waiting for the reply.
    Authenticating,
    /// Bootstrap-phase query sent; waiting for the daemon to reach 100%.
    Bootstrapping,
    /// Fully operational; lines carry events and query replies.
    Processing,
}

/// Accumulator for one dotted multi-line `GETINFO` reply.
///
/// The reply arrives as a `250+<key>=` header, any number of body lines, a
/// lone `.` terminator, and finally `250 OK`.
#[derive(Debug, Default)]
struct DottedReply {
    /// Body lines collected so far; `Some` from header until `250 OK`.
    lines: Option<Vec<String>>,
    /// True between sending the query and seeing its header line.
    awaiting: bool,
}

impl DottedReply {
    /// True while body lines are being collected.
    fn collecting(&self) -> bool {
        self.lines.is_some()
    }
}

/// State machine for our half of the control conversation.
///
/// Command methods queue outbound text; the transport drains it with
/// [`next_outbound`](ControlClient::next_outbound). Inbound lines go
/// through [`handle_line`](ControlClient::handle_line), which returns the
/// events the line produced.
#[derive(Debug, Default)]
pub struct ControlClient {
    /// Where we are in the conversation.
    state: ClientState,
    /// Whether we already subscribed to status events while bootstrapping.
    status_events_requested: bool,
    /// Accumulator for `GETINFO ns/all`.
    descriptors: DottedReply,
    /// Accumulator for `GETINFO circuit-status`.
    circuit_status: DottedReply,
    /// When set, circuit-status results replay as `CLOSED` events so every
    /// tracked circuit gets torn down and persisted. Sticky once requested.
    circuit_status_cleanup: bool,
    /// Forward every processed line verbatim as a [`CtlEvent::Line`].
    line_events: bool,
    /// Command strings waiting for the transport to send.
    outbound: VecDeque<String>,
}

impl Default for ClientState {
    fn default() -> Self {
        ClientState::Idle
    }
}

impl ControlClient {
    /// Return a new client for a freshly connected control socket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `AUTHENTICATE` and start waiting for its reply.
    pub fn authenticate(&mut self) {
        self.state = ClientState::Authenticating;
        self.queue(cmd::authenticate(CONTROL_PASSWORD));
    }

    /// Queue a bootstrap-phase query and start watching for 100%.
    pub fn request_bootstrap_status(&mut self) {
        self.state = ClientState::Bootstrapping;
        self.queue(cmd::getinfo_bootstrap_phase());
    }

    /// Subscribe to the given space-delimited event set.
    pub fn watch_events(&mut self, events: &str) {
        self.queue(cmd::set_events(events));
    }

    /// Clear the event subscription.
    pub fn clear_events(&mut self) {
        self.queue(cmd::set_events(""));
    }

    /// Configure the daemon to leave stream attachment to us, and discard
    /// any circuits that predate the experiment.
    pub fn configure_daemon(&mut self) {
        self.queue(cmd::setconf_manual_attachment());
        self.queue(cmd::signal_newnym());
    }

    /// Ask for the full relay descriptor set.
    ///
    /// The reassembled body is delivered as a [`CtlEvent::Descriptors`].
    pub fn request_descriptors(&mut self) {
        self.descriptors.awaiting = true;
        self.queue(cmd::getinfo_ns_all());
    }

    /// Ask for the status of every open circuit.
    ///
    /// Each result line replays as a pair of `Assigned` and `Built` events,
    /// so a consumer can pick up circuits that predate it.
    pub fn request_circuit_status(&mut self) {
        self.circuit_status.awaiting = true;
        self.queue(cmd::getinfo_circuit_status());
    }

    /// Ask for circuit statuses, replaying each result as a `Closed` event.
    pub fn request_circuit_status_cleanup(&mut self) {
        self.circuit_status_cleanup = true;
        self.request_circuit_status();
    }

    /// Queue a circuit build, optionally along an explicit path.
    pub fn build_circuit(&mut self, path: Option<&str>) {
        self.queue(cmd::extend_circuit(path));
    }

    /// Queue a stream attachment (`circuit` 0 delegates to the daemon).
    pub fn attach_stream(&mut self, stream: StreamId, circuit: CircId) {
        self.queue(cmd::attach_stream(stream, circuit));
    }

    /// Queue a circuit close.
    pub fn close_circuit(&mut self, circuit: CircId) {
        self.queue(cmd::close_circuit(circuit));
    }

    /// Queue a stream close.
    pub fn close_stream(&mut self, stream: StreamId) {
        self.queue(cmd::close_stream(stream));
    }

    /// Enable or disable verbatim [`CtlEvent::Line`] forwarding.
    pub fn set_line_events(&mut self, enabled: bool) {
        self.line_events = enabled;
    }

    /// Take the next queued outbound command, if any.
    pub fn next_outbound(&mut self) -> Option<String> {
        self.outbound.pop_front()
    }

    /// True if any outbound command is waiting to be sent.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Queue one command string for the transport.
    fn queue(&mut self, command: String) {
        trace!(command = command.trim_end(), "queueing control command");
        self.outbound.push_back(command);
    }

    /// Consume one decoded line, returning the events it produced.
    pub fn handle_line(&mut self, line: &str) -> Vec<CtlEvent> {
        let mut events = Vec::new();
        match self.state {
            ClientState::Idle => {
                warn!(line, "received a control line before sending any command");
            }
            ClientState::Authenticating => match reply::status_code(line) {
                Some(250) => {
                    info!("successfully authenticated to the control port");
                    events.push(CtlEvent::Authenticated);
                }
                _ => {
                    error!(line, "control-port authentication failed");
                    events.push(CtlEvent::AuthenticationFailed {
                        line: line.to_owned(),
                    });
                }
            },
            ClientState::Bootstrapping => {
                // Not every status line carries a bootstrap report.
                if let Some(progress) = reply::bootstrap_progress(line) {
                    if progress >= 100 {
                        info!("daemon is fully bootstrapped");
                        self.status_events_requested = false;
                        self.state = ClientState::Processing;
                        events.push(CtlEvent::Bootstrapped);
                    } else {
                        debug!(progress, "daemon has not finished bootstrapping");
                        if !self.status_events_requested {
                            self.queue(cmd::set_events("EXTENDED STATUS_CLIENT"));
                            self.status_events_requested = true;
                        }
                    }
                }
            }
            ClientState::Processing => {
                if self.line_events {
                    events.push(CtlEvent::Line(line.to_owned()));
                }
                self.process_line(line, &mut events);
            }
        }
        events
    }

    /// Handle one line in the operational state.
    fn process_line(&mut self, line: &str, events: &mut Vec<CtlEvent>) {
        if self.descriptors.collecting() {
            self.descriptor_line(line, events);
            return;
        }
        if self.circuit_status.collecting() {
            self.circuit_status_line(line, events);
            return;
        }

        match reply::status_code(line) {
            Some(250) => {
                if self.descriptors.awaiting && starts_with_ignore_ascii_case(line, "250+ns/all=")
                {
                    self.descriptor_line(line, events);
                } else if self.circuit_status.awaiting
                    && starts_with_ignore_ascii_case(line, "250+circuit-status=")
                {
                    self.circuit_status_line(line, events);
                } else if starts_with_ignore_ascii_case(line, "250 EXTENDED ") {
                    if let Some(event) = parse_extended_reply(line) {
                        events.push(event);
                    }
                }
            }
            Some(650) => {
                // .exit circuits and streams are daemon-internal.
                if line.contains(".exit") {
                    trace!(line, "ignoring daemon-internal notification");
                    return;
                }
                if starts_with_ignore_ascii_case(line, "650 CIRC ") {
                    match parse_circ_line(line) {
                        Some(event) => events.push(event),
                        None => debug!(line, "discarding unparseable circuit event"),
                    }
                } else if starts_with_ignore_ascii_case(line, "650 STREAM ") {
                    match parse_stream_line(line) {
                        Some(event) => events.push(event),
                        None => debug!(line, "discarding unparseable stream event"),
                    }
                }
            }
            code => {
                trace!(?code, line, "ignoring control line");
            }
        }
    }

    /// Feed one line of an `ns/all` reply into its accumulator.
    fn descriptor_line(&mut self, line: &str, events: &mut Vec<CtlEvent>) {
        if !self.descriptors.collecting() {
            if starts_with_ignore_ascii_case(line, "250+ns/all=") {
                debug!("descriptor response header received");
                self.descriptors.lines = Some(Vec::new());
                self.descriptors.awaiting = false;
            }
            return;
        }
        if starts_with_ignore_ascii_case(line, "250+ns/all=") {
            debug!(line, "duplicate descriptor header");
        } else if line.starts_with('.') {
            trace!("descriptor response terminator received");
        } else if starts_with_ignore_ascii_case(line, "250 OK") {
            let lines = self.descriptors.lines.take().unwrap_or_default();
            info!(n_lines = lines.len(), "finished receiving descriptors");
            events.push(CtlEvent::Descriptors(lines));
        } else if let Some(lines) = self.descriptors.lines.as_mut() {
            lines.push(line.to_owned());
        }
    }

    /// Feed one line of a `circuit-status` reply into its accumulator.
    fn circuit_status_line(&mut self, line: &str, events: &mut Vec<CtlEvent>) {
        if !self.circuit_status.collecting() {
            if starts_with_ignore_ascii_case(line, "250+circuit-status=") {
                debug!("circuit-status response header received");
                self.circuit_status.lines = Some(Vec::new());
                self.circuit_status.awaiting = false;
            }
            return;
        }
        if starts_with_ignore_ascii_case(line, "250+circuit-status=") {
            debug!(line, "duplicate circuit-status header");
        } else if line.starts_with('.') {
            trace!("circuit-status response terminator received");
        } else if starts_with_ignore_ascii_case(line, "250 OK") {
            let lines = self.circuit_status.lines.take().unwrap_or_default();
            info!(n_circuits = lines.len(), "finished receiving circuit statuses");
            for status_line in lines {
                self.replay_circuit_status(&status_line, events);
            }
        } else if let Some(lines) = self.circuit_status.lines.as_mut() {
            lines.push(line.to_owned());
        }
    }

    /// Replay one `circuit-status` body line as circuit events.
    ///
    /// Body lines look like `<id> <STATUS> <path> ...`. In cleanup mode the
    /// circuit is reported closed; otherwise its existence is replayed as an
    /// assignment followed by a completed build.
    fn replay_circuit_status(&mut self, line: &str, events: &mut Vec<CtlEvent>) {
        debug!(line, "circuit-status result");
        let parts: Vec<&str> = line.split(' ').collect();
        let circ_id = parts.first().map(|p| decimal_prefix(p)).unwrap_or(0);
        let path = parts.get(2).map(|p| (*p).to_owned());
        if self.circuit_status_cleanup {
            events.push(CtlEvent::Circuit {
                status: CircuitStatus::Closed,
                circ_id,
                path,
            });
        } else {
            events.push(CtlEvent::Circuit {
                status: CircuitStatus::Assigned,
                circ_id,
                path: None,
            });
            events.push(CtlEvent::Circuit {
                status: CircuitStatus::Built,
                circ_id,
                path,
            });
        }
    }
}
