//! In-memory circuit records and their trace-file wire form.

use std::cmp::Ordering;
use std::time::{Duration, SystemTime};

use oniontrace_proto::{CircId, CircuitStatus};

use crate::tracefile::TraceFileError;

/// Sentinel written in place of an absent field.
const NULL_FIELD: &str = "NULL";

/// One circuit, as tracked by the recorder or replayed by the player.
#[derive(Clone, Debug)]
pub(crate) struct Circuit {
    /// When the daemon launched (or should launch) this circuit.
    pub(crate) launch_time: SystemTime,
    /// The daemon-assigned id; `None` until assignment, and again after the
    /// circuit is reset for a rebuild.
    pub(crate) circuit_id: Option<CircId>,
    /// The session tag that groups streams onto this circuit.
    pub(crate) session_id: Option<String>,
    /// The comma-separated relay path.
    pub(crate) path: Option<String>,
    /// Where the circuit is in its lifecycle.
    pub(crate) status: CircuitStatus,
    /// How many streams attached successfully.
    pub(crate) n_streams: u32,
    /// How many times a build of this circuit has failed.
    pub(crate) n_failures: u32,
}

impl Circuit {
    /// Return a new, empty circuit record.
    pub(crate) fn new(launch_time: SystemTime) -> Self {
        Self {
            launch_time,
            circuit_id: None,
            session_id: None,
            path: None,
            status: CircuitStatus::Unlaunched,
            n_streams: 0,
            n_failures: 0,
        }
    }

    /// Compare by launch time: the ordering of trace files and of each
    /// session's circuit sequence.
    pub(crate) fn cmp_launch_time(&self, other: &Circuit) -> Ordering {
        self.launch_time.cmp(&other.launch_time)
    }

    /// Encode as one trace record, with times relative to `start`.
    pub(crate) fn to_record(&self, start: SystemTime) -> String {
        format!(
            "{};{};{}\n",
            format_elapsed(start, self.launch_time),
            self.session_id.as_deref().unwrap_or(NULL_FIELD),
            self.path.as_deref().unwrap_or(NULL_FIELD),
        )
    }

    /// Decode one trace record, resolving its elapsed offset against `start`.
    pub(crate) fn from_record(line: &str, start: SystemTime) -> Result<Self, TraceFileError> {
        let bad = || TraceFileError::BadRecord(line.to_owned());
        let mut fields = line.split(';');
        let elapsed = fields.next().ok_or_else(bad)?;
        let session = fields.next().ok_or_else(bad)?;
        let path = fields.next().ok_or_else(bad)?;

        let (negative, offset) = parse_elapsed(elapsed).ok_or_else(bad)?;
        let launch_time = if negative {
            start.checked_sub(offset)
        } else {
            start.checked_add(offset)
        }
        .ok_or_else(bad)?;

        let mut circuit = Circuit::new(launch_time);
        if session != NULL_FIELD && !session.is_empty() {
            circuit.session_id = Some(session.to_owned());
        }
        if path != NULL_FIELD && !path.is_empty() {
            circuit.path = Some(path.to_owned());
        }
        Ok(circuit)
    }
}

/// Format the signed offset of `t` from `start` as `<sec>.<nanos9>`.
fn format_elapsed(start: SystemTime, t: SystemTime) -> String {
    match t.duration_since(start) {
        Ok(d) => format!("{}.{:09}", d.as_secs(), d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            format!("-{}.{:09}", d.as_secs(), d.subsec_nanos())
        }
    }
}

/// Parse a `<sec>.<nanos9>` offset, optionally negative.
///
/// Returns the sign and magnitude, or `None` if the field is malformed.
fn parse_elapsed(s: &str) -> Option<(bool, Duration)> {
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (sec, nanos) = s.split_once('.')?;
    let sec: u64 = sec.parse().ok()?;
    if nanos.len() != 9 {
        return None;
    }
    let nanos: u32 = nanos.parse().ok()?;
    Some((negative, Duration::new(sec, nanos)))
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

    fn start() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)
    }

    #[test]
    fn record_format() {
        let mut circuit = Circuit::new(start() + Duration::new(5, 42));
        circuit.session_id = Some("alice".to_owned());
        circuit.path = Some("$A,$B,$C".to_owned());
        assert_eq!(circuit.to_record(start()), "5.000000042;alice;$A,$B,$C\n");
    }

    #[test]
    fn absent_fields_write_null() {
        let circuit = Circuit::new(start() + Duration::from_secs(1));
        assert_eq!(circuit.to_record(start()), "1.000000000;NULL;NULL\n");
    }

    #[test]
    fn round_trip() {
        let mut circuit = Circuit::new(start() + Duration::new(30, 7));
        circuit.session_id = Some("bob".to_owned());
        circuit.path = Some("$X,$Y,$Z".to_owned());
        let record = circuit.to_record(start());

        let parsed = Circuit::from_record(record.trim_end(), start()).unwrap();
        assert_eq!(parsed.launch_time, circuit.launch_time);
        assert_eq!(parsed.session_id, circuit.session_id);
        assert_eq!(parsed.path, circuit.path);
        assert_eq!(parsed.status, CircuitStatus::Unlaunched);
    }

    #[test]
    fn negative_elapsed_round_trip() {
        let circuit = Circuit::new(start() - Duration::new(2, 500_000_000));
        let record = circuit.to_record(start());
        assert_eq!(record, "-2.500000000;NULL;NULL\n");
        let parsed = Circuit::from_record(record.trim_end(), start()).unwrap();
        assert_eq!(parsed.launch_time, circuit.launch_time);
    }

    #[test]
    fn null_fields_parse_as_absent() {
        let parsed = Circuit::from_record("0.000000001;NULL;NULL", start()).unwrap();
        assert_eq!(parsed.session_id, None);
        assert_eq!(parsed.path, None);
    }

    #[test]
    fn malformed_records_are_rejected() {
        for line in [
            "",
            "nonsense",
            "1.0;alice;$A",          // nanos not 9 digits
            "1.000000000;alice",     // missing path field
            "x.000000000;alice;$A",  // non-numeric seconds
        ] {
            assert!(Circuit::from_record(line, start()).is_err(), "{:?}", line);
        }
    }

    #[test]
    fn ordering_is_by_launch_time() {
        let a = Circuit::new(start());
        let b = Circuit::new(start() + Duration::from_nanos(1));
        assert_eq!(a.cmp_launch_time(&b), Ordering::Less);
        assert_eq!(b.cmp_launch_time(&a), Ordering::Greater);
        assert_eq!(a.cmp_launch_time(&a.clone()), Ordering::Equal);
    }
}
