//! Readiness multiplexing for the main loop.
//!
//! Scheduling here is single-threaded and cooperative: [`EventManager::run`]
//! blocks waiting for readiness, then invokes the handler once per ready
//! descriptor, in order, before blocking again. Everything the handlers
//! touch lives on this one thread, so no locking is needed anywhere.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Readiness observed on a descriptor.
///
/// May be a subset of the interest the descriptor was registered with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Readiness {
    /// The descriptor is readable.
    pub(crate) readable: bool,
    /// The descriptor is writable.
    pub(crate) writable: bool,
}

/// Receives the readiness notifications dispatched by [`EventManager::run`].
pub(crate) trait EventHandler {
    /// Handle readiness observed on `fd`.
    ///
    /// The manager is passed back in so the handler can re-register or
    /// deregister descriptors, or stop the loop.
    fn handle_event(&mut self, manager: &mut EventManager, fd: RawFd, ready: Readiness);
}

/// A fatal error in the main loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum EvLoopError {
    /// The readiness poll failed unrecoverably.
    #[error("unable to poll for readiness")]
    Poll(#[source] io::Error),
}

/// Watches descriptors for readiness and runs the dispatch loop.
pub(crate) struct EventManager {
    /// The kernel readiness facility.
    poll: Poll,
    /// Interest registered per descriptor; at most one watch per fd.
    watches: HashMap<RawFd, Interest>,
    /// Sticky stop flag; checked after each dispatch batch.
    stop_requested: bool,
}

impl EventManager {
    /// Return a new manager with no watches.
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            watches: HashMap::new(),
            stop_requested: false,
        })
    }

    /// Watch `fd` for `interest`, replacing any existing watch on it.
    ///
    /// Returns false (after logging) when registration fails; the loop
    /// keeps running without the watch.
    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest) -> bool {
        if fd < 0 {
            return false;
        }
        let token = Token(fd as usize);
        let result = if self.watches.contains_key(&fd) {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token, interest)
        } else {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, interest)
        };
        match result {
            Ok(()) => {
                self.watches.insert(fd, interest);
                true
            }
            Err(e) => {
                warn!(fd, error = %e, "unable to register descriptor");
                false
            }
        }
    }

    /// Stop watching `fd`. Returns false if it was not being watched.
    pub(crate) fn deregister(&mut self, fd: RawFd) -> bool {
        if self.watches.remove(&fd).is_none() {
            return false;
        }
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            warn!(fd, error = %e, "unable to deregister descriptor");
            return false;
        }
        true
    }

    /// True if `fd` currently has a watch.
    pub(crate) fn is_watched(&self, fd: RawFd) -> bool {
        self.watches.contains_key(&fd)
    }

    /// Make [`run`](EventManager::run) return after the current batch.
    pub(crate) fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Block on readiness and dispatch until [`stop`](EventManager::stop)
    /// is called.
    ///
    /// A handler may deregister any descriptor, including the one whose
    /// event is being dispatched: each batch is drained to owned storage
    /// first, and stale descriptors are skipped.
    pub(crate) fn run<H: EventHandler>(&mut self, handler: &mut H) -> Result<(), EvLoopError> {
        let mut events = Events::with_capacity(100);
        let mut batch: Vec<(RawFd, Readiness)> = Vec::new();
        while !self.stop_requested {
            trace!("waiting for readiness");
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EvLoopError::Poll(e)),
            }

            batch.clear();
            batch.extend(events.iter().map(|event| {
                (
                    event.token().0 as RawFd,
                    Readiness {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                    },
                )
            }));

            for &(fd, ready) in &batch {
                if !self.watches.contains_key(&fd) {
                    trace!(fd, "skipping event for deregistered descriptor");
                    continue;
                }
                handler.handle_event(self, fd, ready);
            }
        }
        debug!("main loop stopped");
        Ok(())
    }
}
