//! Transport for the control connection.
//!
//! [`TorCtl`] owns the nonblocking socket, the receive buffer, and the
//! outbound command queue; everything it says or hears goes through the
//! sans-I/O [`ControlClient`] engine.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, trace, warn};

use oniontrace_proto::{CircId, ControlClient, CtlEvent, LineBuffer, StreamId};

/// Bytes read from the socket per syscall.
const READ_CHUNK: usize = 4096;

/// The commands a record or play component issues while running.
///
/// [`TorCtl`] implements this against the live connection; tests substitute
/// a fake that records what would have been sent.
pub(crate) trait ControlCommands {
    /// Subscribe to the given space-delimited event set.
    fn watch_events(&mut self, events: &str);
    /// Leave stream attachment to us and stretch circuit lifetimes.
    fn configure_daemon(&mut self);
    /// Ask for every open circuit, replayed as assignment+build events.
    fn request_circuit_status(&mut self);
    /// Ask for every open circuit, replayed as close events.
    fn request_circuit_status_cleanup(&mut self);
    /// Build a circuit, optionally along an explicit path.
    fn build_circuit(&mut self, path: Option<&str>);
    /// Attach a stream to a circuit (`circuit` 0 delegates to the daemon).
    fn attach_stream(&mut self, stream: StreamId, circuit: CircId);
    /// Close a circuit.
    fn close_circuit(&mut self, circuit: CircId);
}

/// The control-port connection.
pub(crate) struct TorCtl {
    /// The nonblocking socket to the daemon.
    stream: TcpStream,
    /// The port our end of the connection was bound to.
    client_port: u16,
    /// The protocol state machine.
    proto: ControlClient,
    /// Reassembles CRLF lines across read boundaries.
    lines: LineBuffer,
    /// Commands waiting to be written; the head may be partially sent.
    outbound: VecDeque<Vec<u8>>,
    /// True once the nonblocking connect has completed.
    connected: bool,
}

impl TorCtl {
    /// Start a nonblocking connect to the daemon's loopback control port.
    ///
    /// The connection is not usable until the socket reports writable and
    /// [`finish_connect`](TorCtl::finish_connect) succeeds.
    pub(crate) fn connect(port: u16) -> io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream = TcpStream::connect(addr)?;
        let client_port = stream.local_addr()?.port();
        Ok(Self {
            stream,
            client_port,
            proto: ControlClient::new(),
            lines: LineBuffer::new(),
            outbound: VecDeque::new(),
            connected: false,
        })
    }

    /// The socket descriptor, for event-manager registration.
    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// The locally bound client port, used in status output.
    pub(crate) fn client_port(&self) -> u16 {
        self.client_port
    }

    /// Complete the overlapped connect once the socket reports writable.
    pub(crate) fn finish_connect(&mut self) -> io::Result<()> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        self.stream.peer_addr()?;
        self.connected = true;
        Ok(())
    }

    /// True once the connection has been established.
    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    /// The readiness this connection currently needs from the event loop.
    pub(crate) fn desired_interest(&self) -> Interest {
        if !self.connected {
            Interest::WRITABLE
        } else if self.outbound.is_empty() && !self.proto.has_outbound() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Move commands queued by the protocol engine onto the wire queue.
    fn collect_outbound(&mut self) {
        while let Some(command) = self.proto.next_outbound() {
            debug!(command = command.trim_end(), "sending control command");
            self.outbound.push_back(command.into_bytes());
        }
    }

    /// Write queued commands until done or the socket would block.
    ///
    /// On a short write the unsent suffix stays at the head of the queue
    /// for the next writable notification.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.collect_outbound();
        while let Some(front) = self.outbound.front_mut() {
            match self.stream.write(front) {
                Ok(n) if n == front.len() => {
                    self.outbound.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read whatever the socket has and decode it into events.
    ///
    /// Returns `UnexpectedEof` when the daemon has closed the connection.
    pub(crate) fn handle_readable(&mut self) -> io::Result<Vec<CtlEvent>> {
        let mut events = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.lines.push_bytes(&chunk[..n]);
                    while let Some(line) = self.lines.next_line() {
                        match line {
                            Ok(line) => {
                                trace!(line = line.as_str(), "received control line");
                                events.extend(self.proto.handle_line(&line));
                            }
                            Err(e) => warn!(error = %e, "discarding control line"),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        // Handling lines may itself queue replies (bootstrap subscriptions).
        self.flush()?;
        Ok(events)
    }

    /// Queue `AUTHENTICATE` and start the conversation.
    pub(crate) fn authenticate(&mut self) {
        self.proto.authenticate();
        self.try_flush();
    }

    /// Queue the bootstrap-phase query.
    pub(crate) fn request_bootstrap_status(&mut self) {
        self.proto.request_bootstrap_status();
        self.try_flush();
    }

    /// Forward every received line verbatim as a [`CtlEvent::Line`].
    pub(crate) fn enable_line_events(&mut self) {
        self.proto.set_line_events(true);
    }

    /// Flush, downgrading failures to a warning.
    ///
    /// A persistent socket error will surface again on the readiness path,
    /// where the descriptor gets deregistered.
    fn try_flush(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "unable to write to control socket");
        }
    }
}

impl ControlCommands for TorCtl {
    fn watch_events(&mut self, events: &str) {
        self.proto.watch_events(events);
        self.try_flush();
    }

    fn configure_daemon(&mut self) {
        self.proto.configure_daemon();
        self.try_flush();
    }

    fn request_circuit_status(&mut self) {
        self.proto.request_circuit_status();
        self.try_flush();
    }

    fn request_circuit_status_cleanup(&mut self) {
        self.proto.request_circuit_status_cleanup();
        self.try_flush();
    }

    fn build_circuit(&mut self, path: Option<&str>) {
        self.proto.build_circuit(path);
        self.try_flush();
    }

    fn attach_stream(&mut self, stream: StreamId, circuit: CircId) {
        self.proto.attach_stream(stream, circuit);
        self.try_flush();
    }

    fn close_circuit(&mut self, circuit: CircId) {
        self.proto.close_circuit(circuit);
        self.try_flush();
    }
}
