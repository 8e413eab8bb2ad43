//! Ties the pieces together: connection bring-up, the mode component, and
//! every timer the controller runs on.
//!
//! The driver is the single [`EventHandler`] behind the main loop. It
//! routes socket readiness into the control connection, typed control
//! events into the recorder, player, or logger, and timer expirations into
//! the heartbeat, cleanup, shutdown, and launch-schedule handlers.

use std::fmt::{self, Display};
use std::os::fd::RawFd;

use anyhow::Context as _;
use mio::Interest;
use tracing::{debug, error, info, warn};

use oniontrace_proto::CtlEvent;

use crate::config::{Config, Mode};
use crate::evloop::{EventHandler, EventManager, Readiness};
use crate::logger::LineLogger;
use crate::player::Player;
use crate::recorder::Recorder;
use crate::timer::Timer;
use crate::torctl::TorCtl;

/// Seconds between heartbeat status lines.
const HEARTBEAT_SECS: u64 = 1;

/// Where the controller is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DriverState {
    /// Not started, or stopped.
    Idle,
    /// Waiting for the nonblocking connect to complete.
    Connecting,
    /// Waiting for the daemon to accept our credentials.
    Authenticating,
    /// Waiting for the daemon to finish bootstrapping.
    Bootstrapping,
    /// Recording circuits to the trace file.
    Recording,
    /// Replaying circuits from the trace file.
    Playing,
    /// Forwarding control events to the log.
    Logging,
}

impl Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverState::Idle => "IDLE",
            DriverState::Connecting => "CONNECTING",
            DriverState::Authenticating => "AUTHENTICATING",
            DriverState::Bootstrapping => "BOOTSTRAPPING",
            DriverState::Recording => "RECORDING",
            DriverState::Playing => "PLAYING",
            DriverState::Logging => "LOGGING",
        };
        write!(f, "{}", s)
    }
}

/// Owns the control connection, the mode component, and all timers.
pub(crate) struct Driver {
    /// The run's configuration.
    config: Config,
    /// Lifecycle state.
    state: DriverState,
    /// The control connection, once started.
    torctl: Option<TorCtl>,
    /// The recorder, in record mode after bootstrap.
    recorder: Option<Recorder>,
    /// The player, in play mode after bootstrap.
    player: Option<Player>,
    /// The logger, in log mode after bootstrap.
    logger: Option<LineLogger>,
    /// Periodic status heartbeat.
    heartbeat: Option<Timer>,
    /// Fires one second before shutdown so the recorder can flush.
    cleanup_timer: Option<Timer>,
    /// Fires at the end of the configured run time.
    shutdown_timer: Option<Timer>,
    /// One-shot timer armed for the next scheduled circuit launch.
    play_timer: Option<Timer>,
}

impl Driver {
    /// Return an idle driver for `config`.
    pub(crate) fn new(config: Config) -> Self {
        Self {
            config,
            state: DriverState::Idle,
            torctl: None,
            recorder: None,
            player: None,
            logger: None,
            heartbeat: None,
            cleanup_timer: None,
            shutdown_timer: None,
            play_timer: None,
        }
    }

    /// Connect to the daemon and arm the long-lived timers.
    pub(crate) fn start(&mut self, manager: &mut EventManager) -> anyhow::Result<()> {
        anyhow::ensure!(self.state == DriverState::Idle, "driver is already running");

        info!(
            port = self.config.tor_control_port,
            "connecting to the daemon's control port"
        );
        let torctl = TorCtl::connect(self.config.tor_control_port)
            .context("connecting to control port")?;
        anyhow::ensure!(
            manager.register(torctl.fd(), Interest::WRITABLE),
            "unable to watch the control socket"
        );
        self.torctl = Some(torctl);
        self.state = DriverState::Connecting;

        let heartbeat = Timer::new().context("creating heartbeat timer")?;
        heartbeat
            .arm(HEARTBEAT_SECS, HEARTBEAT_SECS)
            .context("arming heartbeat timer")?;
        manager.register(heartbeat.fd(), Interest::READABLE);
        self.heartbeat = Some(heartbeat);

        if self.config.run_time > 0 {
            let cleanup = Timer::new().context("creating cleanup timer")?;
            cleanup
                .arm(self.config.run_time.saturating_sub(1), 0)
                .context("arming cleanup timer")?;
            manager.register(cleanup.fd(), Interest::READABLE);
            self.cleanup_timer = Some(cleanup);

            let shutdown = Timer::new().context("creating shutdown timer")?;
            shutdown
                .arm(self.config.run_time, 0)
                .context("arming shutdown timer")?;
            manager.register(shutdown.fd(), Interest::READABLE);
            self.shutdown_timer = Some(shutdown);
        }
        Ok(())
    }

    /// Tear everything down, newest first.
    pub(crate) fn stop(&mut self, manager: &mut EventManager) {
        if self.state == DriverState::Idle {
            return;
        }
        if let Some(mut recorder) = self.recorder.take() {
            // Persists any circuits that were still open.
            recorder.finish();
        }
        self.player = None;
        self.logger = None;
        for timer in [
            self.play_timer.take(),
            self.cleanup_timer.take(),
            self.shutdown_timer.take(),
            self.heartbeat.take(),
        ]
        .into_iter()
        .flatten()
        {
            manager.deregister(timer.fd());
        }
        if let Some(torctl) = self.torctl.take() {
            manager.deregister(torctl.fd());
        }
        self.state = DriverState::Idle;
        info!("driver stopped");
    }

    /// The control socket's descriptor, if the connection exists.
    fn torctl_fd(&self) -> Option<RawFd> {
        self.torctl.as_ref().map(TorCtl::fd)
    }

    /// A timer's descriptor, if the timer exists.
    fn timer_fd(timer: &Option<Timer>) -> Option<RawFd> {
        timer.as_ref().map(Timer::fd)
    }

    /// Handle readiness on the control socket.
    fn handle_ctl_ready(&mut self, manager: &mut EventManager, ready: Readiness) {
        let mut events = Vec::new();
        {
            let Some(ctl) = self.torctl.as_mut() else {
                return;
            };
            if !ctl.is_connected() {
                // The first writable notification completes the connect.
                if !ready.writable {
                    return;
                }
                match ctl.finish_connect() {
                    Ok(()) => {
                        info!(
                            client_port = ctl.client_port(),
                            "control connection established; authenticating"
                        );
                        ctl.authenticate();
                        self.state = DriverState::Authenticating;
                    }
                    Err(e) => {
                        error!(error = %e, "unable to connect to the control port");
                        manager.deregister(ctl.fd());
                        manager.stop();
                        return;
                    }
                }
            } else {
                if ready.readable {
                    match ctl.handle_readable() {
                        Ok(decoded) => events = decoded,
                        Err(e) => {
                            warn!(error = %e, "control connection lost");
                            manager.deregister(ctl.fd());
                            return;
                        }
                    }
                }
                if ready.writable {
                    if let Err(e) = ctl.flush() {
                        warn!(error = %e, "unable to write to control socket");
                    }
                }
            }
        }
        for event in events {
            self.dispatch(manager, event);
        }
        self.sync_ctl_interest(manager);
    }

    /// Keep the socket registration in step with what the connection needs.
    fn sync_ctl_interest(&self, manager: &mut EventManager) {
        if let Some(ctl) = self.torctl.as_ref() {
            if manager.is_watched(ctl.fd()) {
                manager.register(ctl.fd(), ctl.desired_interest());
            }
        }
    }

    /// Route one decoded control event.
    fn dispatch(&mut self, manager: &mut EventManager, event: CtlEvent) {
        match event {
            CtlEvent::Authenticated => {
                if let Some(ctl) = self.torctl.as_mut() {
                    info!(
                        client_port = ctl.client_port(),
                        "authenticated; waiting for the daemon to bootstrap"
                    );
                    ctl.request_bootstrap_status();
                }
                self.state = DriverState::Bootstrapping;
            }
            CtlEvent::AuthenticationFailed { line } => {
                // Fatal for the session: we stay pre-operational until the
                // shutdown timer (or the operator) ends the run.
                error!(line = line.as_str(), "the daemon rejected our credentials");
            }
            CtlEvent::Bootstrapped => self.enter_mode(manager),
            CtlEvent::Circuit {
                status,
                circ_id,
                path,
            } => match self.state {
                DriverState::Recording => {
                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder.on_circuit_status(status, circ_id, path);
                    }
                }
                DriverState::Playing => {
                    if let (Some(player), Some(ctl)) =
                        (self.player.as_mut(), self.torctl.as_mut())
                    {
                        player.on_circuit_status(ctl, status, circ_id, path);
                    }
                }
                _ => {}
            },
            CtlEvent::Stream {
                status,
                circ_id,
                stream_id,
                username,
            } => match self.state {
                DriverState::Recording => {
                    if let (Some(recorder), Some(ctl)) =
                        (self.recorder.as_mut(), self.torctl.as_mut())
                    {
                        recorder.on_stream_status(ctl, status, circ_id, stream_id, username);
                    }
                }
                DriverState::Playing => {
                    if let (Some(player), Some(ctl)) =
                        (self.player.as_mut(), self.torctl.as_mut())
                    {
                        player.on_stream_status(ctl, status, stream_id, username);
                    }
                }
                _ => {}
            },
            CtlEvent::Descriptors(lines) => {
                debug!(n_lines = lines.len(), "received relay descriptors");
            }
            CtlEvent::Line(line) => {
                if let Some(logger) = self.logger.as_mut() {
                    logger.log_line(&line);
                }
            }
            _ => {}
        }
    }

    /// Start the configured mode component after bootstrap completes.
    fn enter_mode(&mut self, manager: &mut EventManager) {
        info!(mode = %self.config.mode, "daemon is ready; starting configured mode");
        let Some(ctl) = self.torctl.as_mut() else {
            return;
        };
        match self.config.mode {
            Mode::Record => match Recorder::new(ctl, &self.config.trace_file) {
                Ok(recorder) => {
                    self.recorder = Some(recorder);
                    self.state = DriverState::Recording;
                }
                Err(e) => {
                    error!(error = %e, "unable to start the recorder");
                    self.state = DriverState::Idle;
                    manager.stop();
                }
            },
            Mode::Play => match Player::new(ctl, &self.config.trace_file) {
                Ok(player) => {
                    self.player = Some(player);
                    self.state = DriverState::Playing;
                    self.schedule_next_launch(manager);
                }
                Err(e) => {
                    error!(error = %e, "unable to start the player");
                    self.state = DriverState::Idle;
                    manager.stop();
                }
            },
            Mode::Log => {
                ctl.enable_line_events();
                let logger = LineLogger::new(ctl, &self.config.events);
                self.logger = Some(logger);
                self.state = DriverState::Logging;
            }
        }
    }

    /// Run every due launch, then arm a timer for the next one.
    fn schedule_next_launch(&mut self, manager: &mut EventManager) {
        let delay = {
            let (Some(player), Some(ctl)) = (self.player.as_mut(), self.torctl.as_mut()) else {
                return;
            };
            player.launch_next_circuit(ctl)
        };
        self.sync_ctl_interest(manager);

        match delay {
            Some(delay) => {
                debug!(?delay, "next circuit launch scheduled");
                let timer = match Timer::new() {
                    Ok(timer) => timer,
                    Err(e) => {
                        warn!(error = %e, "unable to create launch timer");
                        return;
                    }
                };
                if let Err(e) = timer.arm_granular(delay, None) {
                    warn!(error = %e, "unable to arm launch timer");
                    return;
                }
                manager.register(timer.fd(), Interest::READABLE);
                self.play_timer = Some(timer);
            }
            None => debug!("no further circuit launches scheduled"),
        }
    }

    /// Log the periodic status line.
    fn log_heartbeat(&self) {
        let status = match self.state {
            DriverState::Recording => self.recorder.as_ref().map(Recorder::status_line),
            DriverState::Playing => self.player.as_ref().map(Player::status_line),
            DriverState::Logging => self.logger.as_ref().map(LineLogger::status_line),
            _ => None,
        };
        match status {
            Some(status) => info!("heartbeat: state={} {}", self.state, status),
            None => info!("heartbeat: state={}", self.state),
        }
    }
}

impl EventHandler for Driver {
    fn handle_event(&mut self, manager: &mut EventManager, fd: RawFd, ready: Readiness) {
        if Some(fd) == self.torctl_fd() {
            self.handle_ctl_ready(manager, ready);
            return;
        }

        if Some(fd) == Self::timer_fd(&self.heartbeat) {
            if self.heartbeat.as_ref().is_some_and(Timer::check) {
                self.log_heartbeat();
            }
            return;
        }

        if Some(fd) == Self::timer_fd(&self.cleanup_timer) {
            if self.cleanup_timer.as_ref().is_some_and(Timer::check)
                && self.state == DriverState::Recording
            {
                if let (Some(recorder), Some(ctl)) =
                    (self.recorder.as_mut(), self.torctl.as_mut())
                {
                    recorder.cleanup(ctl);
                }
                self.sync_ctl_interest(manager);
            }
            return;
        }

        if Some(fd) == Self::timer_fd(&self.shutdown_timer) {
            if self.shutdown_timer.as_ref().is_some_and(Timer::check) {
                info!("run time expired; stopping the main loop");
                manager.stop();
            }
            return;
        }

        if Some(fd) == Self::timer_fd(&self.play_timer) {
            if self.play_timer.as_ref().is_some_and(Timer::check) {
                manager.deregister(fd);
                self.play_timer = None;
                self.schedule_next_launch(manager);
            }
            return;
        }

        debug!(fd, "readiness for a descriptor nobody owns");
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
    use crate::config::LogLevel;
    use std::net::TcpListener;
    use std::path::PathBuf;

    fn config(port: u16, mode: Mode) -> Config {
        Config {
            mode,
            tor_control_port: port,
            log_level: LogLevel::Info,
            trace_file: PathBuf::from("oniontrace.csv"),
            run_time: 30,
            events: "BW".to_owned(),
        }
    }

    #[test]
    fn state_names() {
        assert_eq!(DriverState::Idle.to_string(), "IDLE");
        assert_eq!(DriverState::Connecting.to_string(), "CONNECTING");
        assert_eq!(DriverState::Recording.to_string(), "RECORDING");
    }

    #[test]
    fn start_registers_socket_and_timers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut manager = EventManager::new().unwrap();
        let mut driver = Driver::new(config(port, Mode::Log));
        driver.start(&mut manager).unwrap();

        assert_eq!(driver.state, DriverState::Connecting);
        assert!(manager.is_watched(driver.torctl_fd().unwrap()));
        assert!(manager.is_watched(Driver::timer_fd(&driver.heartbeat).unwrap()));
        assert!(manager.is_watched(Driver::timer_fd(&driver.cleanup_timer).unwrap()));
        assert!(manager.is_watched(Driver::timer_fd(&driver.shutdown_timer).unwrap()));

        driver.stop(&mut manager);
        assert_eq!(driver.state, DriverState::Idle);
        assert!(driver.torctl.is_none());
        assert!(driver.heartbeat.is_none());
    }

    #[test]
    fn run_time_zero_skips_shutdown_timers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut manager = EventManager::new().unwrap();
        let mut config = config(port, Mode::Log);
        config.run_time = 0;
        let mut driver = Driver::new(config);
        driver.start(&mut manager).unwrap();
        assert!(driver.cleanup_timer.is_none());
        assert!(driver.shutdown_timer.is_none());
        driver.stop(&mut manager);
    }
}
