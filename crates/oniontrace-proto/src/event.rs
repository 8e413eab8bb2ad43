//! Typed events decoded from control-port traffic.

use crate::reply::{decimal_prefix, strip_prefix_ignore_ascii_case};
use crate::status::{CircuitStatus, StreamStatus};

/// Identifier the daemon assigns to a circuit.
///
/// Zero is never assigned; event lines whose id fails to parse read as 0.
pub type CircId = u32;

/// Identifier the daemon assigns to a stream.
pub type StreamId = u32;

/// One decoded notification from the control connection.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CtlEvent {
    /// The daemon accepted our `AUTHENTICATE` command.
    Authenticated,
    /// The daemon rejected our `AUTHENTICATE` command.
    ///
    /// The connection will never become operational after this.
    AuthenticationFailed {
        /// The verbatim rejection line.
        line: String,
    },
    /// The daemon's bootstrap progress reached 100%.
    Bootstrapped,
    /// A circuit changed state.
    Circuit {
        /// The circuit's new status.
        status: CircuitStatus,
        /// The daemon-assigned circuit id (0 if the line carried none).
        circ_id: CircId,
        /// The comma-separated relay path, when the message carried one.
        path: Option<String>,
    },
    /// A stream changed state.
    Stream {
        /// The stream's new status.
        status: StreamStatus,
        /// The circuit the stream is on (0 while unattached).
        circ_id: CircId,
        /// The stream's id.
        stream_id: StreamId,
        /// The session tag from the stream's `USERNAME` field, if any.
        username: Option<String>,
    },
    /// The body of a completed `ns/all` query, one line per element.
    Descriptors(Vec<String>),
    /// A verbatim control line, forwarded when the raw-line sink is enabled.
    Line(String),
}

/// Parse a `650 CIRC <id> <STATUS> [<path> ...]` event line.
///
/// The path is captured only for the statuses whose messages carry one.
/// Returns `None` for lines too short to carry a circuit event, or whose
/// status keyword is one we do not track; both are ignored upstream.
pub fn parse_circ_line(line: &str) -> Option<CtlEvent> {
    let parts: Vec<&str> = line.split(' ').collect();
    let circ_id = decimal_prefix(parts.get(2)?);
    let status = CircuitStatus::from_keyword(parts.get(3)?)?;
    let path = match status {
        CircuitStatus::Extended | CircuitStatus::Built | CircuitStatus::Closed => {
            parts.get(4).map(|p| (*p).to_owned())
        }
        _ => None,
    };
    Some(CtlEvent::Circuit {
        status,
        circ_id,
        path,
    })
}

/// Parse a `650 STREAM <id> <STATUS> <circ> <target> [...]` event line.
pub fn parse_stream_line(line: &str) -> Option<CtlEvent> {
    let parts: Vec<&str> = line.split(' ').collect();
    let stream_id = decimal_prefix(parts.get(2)?);
    let status = StreamStatus::from_keyword(parts.get(3)?)?;
    let circ_id = decimal_prefix(parts.get(4)?);
    let username = parts
        .get(5..)
        .unwrap_or(&[])
        .iter()
        .find_map(|token| strip_prefix_ignore_ascii_case(token, "USERNAME="))
        .map(str::to_owned);
    Some(CtlEvent::Stream {
        status,
        circ_id,
        stream_id,
        username,
    })
}

/// Parse the positional `250 EXTENDED <id>` reply to `EXTENDCIRCUIT`.
///
/// Surfaced as a synthetic [`CircuitStatus::Assigned`] event: it is the only
/// way the daemon tells us which id our newly requested circuit received.
pub fn parse_extended_reply(line: &str) -> Option<CtlEvent> {
    let parts: Vec<&str> = line.split(' ').collect();
    let circ_id = decimal_prefix(parts.get(2)?);
    Some(CtlEvent::Circuit {
        status: CircuitStatus::Assigned,
        circ_id,
        path: None,
    })
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

    const PATH: &str = "$FF197204099FA0E507FA46D41FED97D3337B4BAA~guard,\
                        $F63C257B0819549FCD3E476FB534C08E550AC29D~middle,\
                        $4EBB385C80A2CA5D671E16F1C722FBFB5F176891~exit";

    #[test]
    fn circ_built_with_path() {
        let line = format!("650 CIRC 3 BUILT {} PURPOSE=GENERAL", PATH);
        assert_matches!(
            parse_circ_line(&line),
            Some(CtlEvent::Circuit {
                status: CircuitStatus::Built,
                circ_id: 3,
                path: Some(p),
            }) if p == PATH
        );
    }

    #[test]
    fn circ_launched_has_no_path() {
        assert_matches!(
            parse_circ_line("650 CIRC 3 LAUNCHED PURPOSE=GENERAL"),
            Some(CtlEvent::Circuit {
                status: CircuitStatus::Launched,
                circ_id: 3,
                path: None,
            })
        );
    }

    #[test]
    fn circ_failed_drops_trailing_fields() {
        assert_matches!(
            parse_circ_line("650 CIRC 9 FAILED REASON=DESTROYED"),
            Some(CtlEvent::Circuit {
                status: CircuitStatus::Failed,
                circ_id: 9,
                path: None,
            })
        );
    }

    #[test]
    fn circ_unknown_status_is_dropped() {
        assert_eq!(parse_circ_line("650 CIRC 3 PURPOSE_CHANGED"), None);
        assert_eq!(parse_circ_line("650 CIRC"), None);
    }

    #[test]
    fn stream_with_username() {
        let line = "650 STREAM 21 NEW 0 11.0.0.6:18080 SOURCE_ADDR=127.0.0.1:21437 USERNAME=alice";
        assert_matches!(
            parse_stream_line(line),
            Some(CtlEvent::Stream {
                status: StreamStatus::New,
                circ_id: 0,
                stream_id: 21,
                username: Some(u),
            }) if u == "alice"
        );
    }

    #[test]
    fn stream_without_username() {
        assert_matches!(
            parse_stream_line("650 STREAM 21 SUCCEEDED 20 11.0.0.6:18080"),
            Some(CtlEvent::Stream {
                status: StreamStatus::Succeeded,
                circ_id: 20,
                stream_id: 21,
                username: None,
            })
        );
    }

    #[test]
    fn extended_reply() {
        assert_matches!(
            parse_extended_reply("250 EXTENDED 11"),
            Some(CtlEvent::Circuit {
                status: CircuitStatus::Assigned,
                circ_id: 11,
                path: None,
            })
        );
    }
}
