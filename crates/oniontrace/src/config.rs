//! Configuration from positional `key=value` command-line tokens.

use std::fmt::{self, Display};
use std::path::PathBuf;

use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Which high-level operation the controller performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Mode {
    /// Observe the daemon and persist completed circuits to a trace.
    Record,
    /// Rebuild the circuits in a trace and attach streams to them.
    Play,
    /// Forward a configurable set of control events to the log.
    Log,
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Record => "record",
            Mode::Play => "play",
            Mode::Log => "log",
        };
        write!(f, "{}", s)
    }
}

/// Log verbosity, ordered coarse to fine.
///
/// The names come from the tool's historical log levels; they map onto
/// tracing filters one step finer than their names suggest, so that
/// `message` (major milestones) lands on `INFO` and `info` (per-event
/// detail) lands on `DEBUG`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LogLevel {
    /// Recoverable anomalies only.
    Warning,
    /// Heartbeats, state transitions, per-circuit milestones.
    Message,
    /// Per-event detail.
    Info,
    /// Raw line and byte traffic.
    Debug,
}

impl LogLevel {
    /// The tracing filter this level corresponds to.
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Message => LevelFilter::INFO,
            LogLevel::Info => LevelFilter::DEBUG,
            LogLevel::Debug => LevelFilter::TRACE,
        }
    }
}

/// Fully parsed runtime configuration.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// The operation to perform.
    pub mode: Mode,
    /// The daemon's control port on 127.0.0.1.
    pub tor_control_port: u16,
    /// Log filter, fixed for the lifetime of the process.
    pub log_level: LogLevel,
    /// Trace file to write (record) or read (play).
    pub trace_file: PathBuf,
    /// Seconds to run before shutting down; 0 means run until killed.
    pub run_time: u64,
    /// Space-delimited event names handed to the daemon in log mode.
    pub events: String,
}

/// An error in the command-line configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An argument was not of the form `key=value`.
    #[error("argument {0:?} is not a key=value pair")]
    NotKeyValue(String),
    /// An argument used a key we do not know.
    #[error("unrecognized configuration key {0:?}")]
    UnrecognizedKey(String),
    /// The mode was not one of the three we support.
    #[error("invalid mode {0:?} (expected record, play, or log)")]
    BadMode(String),
    /// The control port was missing or out of range.
    #[error("invalid control port {0:?} (expected 1-65535)")]
    BadControlPort(String),
    /// The log level was not one we know.
    #[error("invalid log level {0:?} (expected debug, info, message, or warning)")]
    BadLogLevel(String),
    /// The run time did not parse as a number of seconds.
    #[error("invalid run time {0:?}")]
    BadRunTime(String),
    /// No control port was given.
    #[error("missing required configuration key TorControlPort")]
    MissingControlPort,
    /// Play mode needs an existing trace file.
    #[error("trace file {0:?} does not exist")]
    TraceFileMissing(PathBuf),
}

impl Config {
    /// Parse configuration tokens, program name excluded.
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Config {
            mode: Mode::Log,
            tor_control_port: 0,
            log_level: LogLevel::Info,
            trace_file: PathBuf::from("oniontrace.csv"),
            run_time: 0,
            events: "BW".to_owned(),
        };

        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                return Err(ConfigError::NotKeyValue(arg));
            };
            if key.eq_ignore_ascii_case("Mode") {
                config.mode = parse_mode(value)?;
            } else if key.eq_ignore_ascii_case("TorControlPort") {
                config.tor_control_port = parse_port(value)?;
            } else if key.eq_ignore_ascii_case("LogLevel") {
                config.log_level = parse_log_level(value)?;
            } else if key.eq_ignore_ascii_case("TraceFile") {
                config.trace_file = expand_home(value);
            } else if key.eq_ignore_ascii_case("RunTime") {
                config.run_time = parse_run_time(value)?;
            } else if key.eq_ignore_ascii_case("Events") {
                config.events = value.split(',').collect::<Vec<_>>().join(" ");
            } else {
                return Err(ConfigError::UnrecognizedKey(key.to_owned()));
            }
        }

        if config.tor_control_port == 0 {
            return Err(ConfigError::MissingControlPort);
        }
        if config.mode == Mode::Play && !config.trace_file.is_file() {
            return Err(ConfigError::TraceFileMissing(config.trace_file));
        }
        Ok(config)
    }
}

/// Parse a `Mode=` value.
fn parse_mode(value: &str) -> Result<Mode, ConfigError> {
    if value.eq_ignore_ascii_case("record") {
        Ok(Mode::Record)
    } else if value.eq_ignore_ascii_case("play") {
        Ok(Mode::Play)
    } else if value.eq_ignore_ascii_case("log") {
        Ok(Mode::Log)
    } else {
        Err(ConfigError::BadMode(value.to_owned()))
    }
}

/// Parse a `TorControlPort=` value.
fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| ConfigError::BadControlPort(value.to_owned()))
}

/// Parse a `LogLevel=` value.
fn parse_log_level(value: &str) -> Result<LogLevel, ConfigError> {
    if value.eq_ignore_ascii_case("debug") {
        Ok(LogLevel::Debug)
    } else if value.eq_ignore_ascii_case("info") {
        Ok(LogLevel::Info)
    } else if value.eq_ignore_ascii_case("message") {
        Ok(LogLevel::Message)
    } else if value.eq_ignore_ascii_case("warning") {
        Ok(LogLevel::Warning)
    } else {
        Err(ConfigError::BadLogLevel(value.to_owned()))
    }
}

/// Parse a `RunTime=` value. Negative values read as "no run-time limit".
fn parse_run_time(value: &str) -> Result<u64, ConfigError> {
    let seconds: i64 = value
        .parse()
        .map_err(|_| ConfigError::BadRunTime(value.to_owned()))?;
    Ok(seconds.max(0) as u64)
}

/// Expand a leading `~` using `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            expanded.push(rest.trim_start_matches('/'));
            return expanded;
        }
    }
    PathBuf::from(path)
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
    use assert_matches::assert_matches;

    fn args(tokens: &[&str]) -> impl Iterator<Item = String> {
        tokens
            .iter()
            .map(|t| (*t).to_owned())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn defaults() {
        let config = Config::from_args(args(&["TorControlPort=9051"])).unwrap();
        assert_eq!(config.mode, Mode::Log);
        assert_eq!(config.tor_control_port, 9051);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.trace_file, PathBuf::from("oniontrace.csv"));
        assert_eq!(config.run_time, 0);
        assert_eq!(config.events, "BW");
    }

    #[test]
    fn keys_are_case_insensitive() {
        let config = Config::from_args(args(&[
            "torcontrolport=9051",
            "MODE=record",
            "loglevel=warning",
            "runtime=60",
        ]))
        .unwrap();
        assert_eq!(config.mode, Mode::Record);
        assert_eq!(config.log_level, LogLevel::Warning);
        assert_eq!(config.run_time, 60);
    }

    #[test]
    fn events_become_space_delimited() {
        let config =
            Config::from_args(args(&["TorControlPort=9051", "Events=BW,CIRC,STREAM"])).unwrap();
        assert_eq!(config.events, "BW CIRC STREAM");
    }

    #[test]
    fn control_port_is_required_and_validated() {
        assert_matches!(
            Config::from_args(args(&[])),
            Err(ConfigError::MissingControlPort)
        );
        assert_matches!(
            Config::from_args(args(&["TorControlPort=0"])),
            Err(ConfigError::BadControlPort(_))
        );
        assert_matches!(
            Config::from_args(args(&["TorControlPort=70000"])),
            Err(ConfigError::BadControlPort(_))
        );
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert_matches!(
            Config::from_args(args(&["TorControlPort"])),
            Err(ConfigError::NotKeyValue(_))
        );
        assert_matches!(
            Config::from_args(args(&["TorControlPort=9051", "Frequency=10"])),
            Err(ConfigError::UnrecognizedKey(_))
        );
        assert_matches!(
            Config::from_args(args(&["TorControlPort=9051", "Mode=observe"])),
            Err(ConfigError::BadMode(_))
        );
        assert_matches!(
            Config::from_args(args(&["TorControlPort=9051", "LogLevel=verbose"])),
            Err(ConfigError::BadLogLevel(_))
        );
        assert_matches!(
            Config::from_args(args(&["TorControlPort=9051", "RunTime=soon"])),
            Err(ConfigError::BadRunTime(_))
        );
    }

    #[test]
    fn negative_run_time_means_unlimited() {
        let config = Config::from_args(args(&["TorControlPort=9051", "RunTime=-5"])).unwrap();
        assert_eq!(config.run_time, 0);
    }

    #[test]
    fn play_mode_requires_an_existing_trace() {
        let err = Config::from_args(args(&[
            "TorControlPort=9051",
            "Mode=play",
            "TraceFile=/nonexistent/oniontrace.csv",
        ]));
        assert_matches!(err, Err(ConfigError::TraceFileMissing(_)));

        let file = tempfile::NamedTempFile::new().unwrap();
        let arg = format!("TraceFile={}", file.path().display());
        let config =
            Config::from_args(args(&["TorControlPort=9051", "Mode=play", &arg])).unwrap();
        assert_eq!(config.trace_file, file.path());
    }

    #[test]
    fn home_expansion() {
        std::env::set_var("HOME", "/home/oniontrace");
        let config = Config::from_args(args(&["TorControlPort=9051", "TraceFile=~/t.csv"]))
            .unwrap();
        assert_eq!(config.trace_file, PathBuf::from("/home/oniontrace/t.csv"));
    }
}
