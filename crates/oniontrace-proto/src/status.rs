//! Circuit and stream status values.

use std::fmt::{self, Display};

/// The lifecycle state of a circuit, as seen by the controller.
///
/// `Unlaunched` and `Assigned` never appear as daemon event keywords:
/// `Unlaunched` marks a circuit we have not (or no longer) asked the daemon
/// to build, and `Assigned` is synthesized when the daemon hands back a
/// circuit id in a `250 EXTENDED` reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CircuitStatus {
    /// Not yet launched, or reset after a failed build.
    Unlaunched,
    /// The daemon has assigned a circuit id but reported nothing since.
    Assigned,
    /// The daemon has started building the circuit.
    Launched,
    /// The circuit gained another hop.
    Extended,
    /// The circuit is complete and can carry streams.
    Built,
    /// The build failed.
    Failed,
    /// The circuit was torn down.
    Closed,
}

impl CircuitStatus {
    /// Parse a daemon status keyword (`LAUNCHED`, `BUILT`, ...).
    ///
    /// Matching is by three-letter prefix, ignoring case, following the
    /// tolerant parser this controller has always used.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword_prefix(keyword)? {
            [b'L', b'A', b'U'] => Some(CircuitStatus::Launched),
            [b'E', b'X', b'T'] => Some(CircuitStatus::Extended),
            [b'B', b'U', b'I'] => Some(CircuitStatus::Built),
            [b'F', b'A', b'I'] => Some(CircuitStatus::Failed),
            [b'C', b'L', b'O'] => Some(CircuitStatus::Closed),
            _ => None,
        }
    }
}

impl Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitStatus::Unlaunched => "UNLAUNCHED",
            CircuitStatus::Assigned => "ASSIGNED",
            CircuitStatus::Launched => "LAUNCHED",
            CircuitStatus::Extended => "EXTENDED",
            CircuitStatus::Built => "BUILT",
            CircuitStatus::Failed => "FAILED",
            CircuitStatus::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// The lifecycle state of a stream, as reported by the daemon.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum StreamStatus {
    /// A new connection is waiting to be attached to a circuit.
    New,
    /// The stream was attached and its connection succeeded.
    Succeeded,
    /// The stream was detached from its circuit and needs a new one.
    Detached,
    /// The stream failed.
    Failed,
    /// The stream was closed.
    Closed,
}

impl StreamStatus {
    /// Parse a daemon status keyword (`NEW`, `SUCCEEDED`, ...) by
    /// three-letter prefix, ignoring case.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword_prefix(keyword)? {
            [b'N', b'E', b'W'] => Some(StreamStatus::New),
            [b'S', b'U', b'C'] => Some(StreamStatus::Succeeded),
            [b'D', b'E', b'T'] => Some(StreamStatus::Detached),
            [b'F', b'A', b'I'] => Some(StreamStatus::Failed),
            [b'C', b'L', b'O'] => Some(StreamStatus::Closed),
            _ => None,
        }
    }
}

impl Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStatus::New => "NEW",
            StreamStatus::Succeeded => "SUCCEEDED",
            StreamStatus::Detached => "DETACHED",
            StreamStatus::Failed => "FAILED",
            StreamStatus::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// The first three bytes of `keyword`, upper-cased; `None` if it is shorter.
fn keyword_prefix(keyword: &str) -> Option<[u8; 3]> {
    let bytes = keyword.as_bytes();
    if bytes.len() < 3 {
        return None;
    }
    Some([
        bytes[0].to_ascii_uppercase(),
        bytes[1].to_ascii_uppercase(),
        bytes[2].to_ascii_uppercase(),
    ])
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

    #[test]
    fn circuit_keywords() {
        assert_eq!(
            CircuitStatus::from_keyword("LAUNCHED"),
            Some(CircuitStatus::Launched)
        );
        assert_eq!(CircuitStatus::from_keyword("built"), Some(CircuitStatus::Built));
        // Prefix matching tolerates daemon-side suffix changes.
        assert_eq!(
            CircuitStatus::from_keyword("EXTENDING"),
            Some(CircuitStatus::Extended)
        );
        assert_eq!(CircuitStatus::from_keyword("NEW"), None);
        assert_eq!(CircuitStatus::from_keyword("BU"), None);
    }

    #[test]
    fn stream_keywords() {
        assert_eq!(StreamStatus::from_keyword("NEW"), Some(StreamStatus::New));
        assert_eq!(
            StreamStatus::from_keyword("SUCCEEDED"),
            Some(StreamStatus::Succeeded)
        );
        assert_eq!(
            StreamStatus::from_keyword("detached"),
            Some(StreamStatus::Detached)
        );
        assert_eq!(StreamStatus::from_keyword("SENTCONNECT"), None);
    }
}
