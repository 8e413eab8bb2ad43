//! Verbatim forwarding of control events to the log.

use tracing::info;

use crate::torctl::ControlCommands;

/// Subscribes to a configured event set and re-logs every line received.
pub(crate) struct LineLogger {
    /// Lines forwarded so far.
    n_logged: u64,
}

impl LineLogger {
    /// Subscribe to `events` (space-delimited) and start counting.
    ///
    /// The caller also enables the connection's raw-line sink; every line
    /// it yields should be passed to [`log_line`](LineLogger::log_line).
    pub(crate) fn new(ctl: &mut dyn ControlCommands, events: &str) -> Self {
        info!(events, "forwarding control events to the log");
        ctl.watch_events(events);
        Self { n_logged: 0 }
    }

    /// Write one verbatim control line to the log.
    pub(crate) fn log_line(&mut self, line: &str) {
        info!("control: {}", line);
        self.n_logged += 1;
    }

    /// One-line status snapshot for the heartbeat.
    pub(crate) fn status_line(&self) -> String {
        format!("n_msgs_logged={}", self.n_logged)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::torctl::test::FakeCtl;

    #[test]
    fn subscribes_and_counts() {
        let mut ctl = FakeCtl::default();
        let mut logger = LineLogger::new(&mut ctl, "BW CIRC");
        assert_eq!(ctl.commands, vec!["SETEVENTS BW CIRC"]);

        logger.log_line("650 BW 1024 2048");
        logger.log_line("650 CIRC 3 BUILT");
        assert_eq!(logger.status_line(), "n_msgs_logged=2");
    }
}
