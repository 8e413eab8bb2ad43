//! Reading and writing circuit trace files.
//!
//! One record per line; fields are separated by `;` because relay paths
//! already contain commas, and `NULL` marks an absent field. Records are
//! written in completion order while recording, and sorted by launch time
//! when read back.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, warn};

use crate::circuit::Circuit;

/// An error while persisting or loading trace records.
#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum TraceFileError {
    /// The trace file could not be opened.
    #[error("unable to open trace file {path:?}")]
    Open {
        /// The path we tried to open.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A record could not be written out.
    #[error("unable to write trace record")]
    Write(#[source] io::Error),
    /// The trace file could not be read.
    #[error("unable to read trace file")]
    Read(#[source] io::Error),
    /// A line did not parse as a trace record.
    #[error("malformed trace record {0:?}")]
    BadRecord(String),
}

/// Appends circuit records to a trace.
pub(crate) struct TraceWriter {
    /// Output target; a file in production, a memory buffer in tests.
    out: Box<dyn Write + Send>,
}

impl TraceWriter {
    /// Create (or truncate) the trace file at `path`.
    pub(crate) fn create(path: &Path) -> Result<Self, TraceFileError> {
        let file = File::create(path).map_err(|e| TraceFileError::Open {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(Self::from_writer(Box::new(file)))
    }

    /// Wrap an arbitrary writer.
    pub(crate) fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    /// Append one record, with times relative to `start`.
    ///
    /// Flushed immediately: records have to survive the process being
    /// killed rather than shut down.
    pub(crate) fn write_circuit(
        &mut self,
        circuit: &Circuit,
        start: SystemTime,
    ) -> Result<(), TraceFileError> {
        let record = circuit.to_record(start);
        self.out
            .write_all(record.as_bytes())
            .and_then(|()| self.out.flush())
            .map_err(TraceFileError::Write)
    }
}

/// Load every record from `path`, with offsets resolved against `start`,
/// sorted by launch time.
pub(crate) fn read_circuits(
    path: &Path,
    start: SystemTime,
) -> Result<Vec<Circuit>, TraceFileError> {
    let file = File::open(path).map_err(|e| TraceFileError::Open {
        path: path.to_owned(),
        source: e,
    })?;
    parse_circuits(BufReader::new(file), start)
}

/// Parse records from any line-oriented reader.
///
/// Malformed records are logged and skipped; an unreadable source is an
/// error.
pub(crate) fn parse_circuits<R: BufRead>(
    reader: R,
    start: SystemTime,
) -> Result<Vec<Circuit>, TraceFileError> {
    let mut circuits = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(TraceFileError::Read)?;
        if line.is_empty() {
            continue;
        }
        debug!(line = line.as_str(), "importing trace record");
        match Circuit::from_record(&line, start) {
            Ok(circuit) => circuits.push(circuit),
            Err(e) => warn!(error = %e, "skipping malformed trace record"),
        }
    }
    circuits.sort_by(Circuit::cmp_launch_time);
    Ok(circuits)
}

#[cfg(test)]
pub(crate) mod test {
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
    use proptest::prelude::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// An in-memory `Write` target that can be inspected afterwards.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        /// The bytes written so far, as a string.
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().expect("poisoned").clone()).expect("not utf-8")
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn start() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)
    }

    fn session_circuit(offset: Duration, session: &str, path: &str) -> Circuit {
        let mut circuit = Circuit::new(start() + offset);
        circuit.session_id = Some(session.to_owned());
        circuit.path = Some(path.to_owned());
        circuit
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");

        let mut writer = TraceWriter::create(&path).unwrap();
        let a = session_circuit(Duration::from_secs(5), "alice", "$A,$B,$C");
        let b = session_circuit(Duration::from_secs(2), "bob", "$X,$Y,$Z");
        writer.write_circuit(&a, start()).unwrap();
        writer.write_circuit(&b, start()).unwrap();
        drop(writer);

        let circuits = read_circuits(&path, start()).unwrap();
        assert_eq!(circuits.len(), 2);
        // Sorted by launch time, not write order.
        assert_eq!(circuits[0].session_id.as_deref(), Some("bob"));
        assert_eq!(circuits[1].session_id.as_deref(), Some("alice"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let data = "0.000000001;alice;$A,$B,$C\nnot a record\n1.000000000;NULL;NULL\n";
        let circuits = parse_circuits(Cursor::new(data), start()).unwrap();
        assert_eq!(circuits.len(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = read_circuits(Path::new("/nonexistent/trace.csv"), start());
        assert!(matches!(err, Err(TraceFileError::Open { .. })));
    }

    proptest! {
        /// Writing any set of circuits and reading it back yields the same
        /// records, sorted by launch time, with elapsed offsets preserved
        /// to the nanosecond.
        #[test]
        fn write_then_parse_preserves_records(
            entries in proptest::collection::vec(
                (0_u64..1_000_000, 0_u32..1_000_000_000, "[a-z]{1,8}", "[$A-Z,~]{1,20}"),
                0..20,
            )
        ) {
            let buf = SharedBuf::default();
            let mut expected: Vec<(SystemTime, String, String)> = Vec::new();
            {
                let mut writer = TraceWriter::from_writer(Box::new(buf.clone()));
                for (sec, nanos, session, path) in &entries {
                    let circuit =
                        session_circuit(Duration::new(*sec, *nanos), session, path);
                    writer.write_circuit(&circuit, start()).unwrap();
                    expected.push((
                        circuit.launch_time,
                        session.clone(),
                        path.clone(),
                    ));
                }
            }
            // Stable, like the parser's sort, so ties keep write order.
            expected.sort_by_key(|entry| entry.0);

            let parsed = parse_circuits(Cursor::new(buf.contents()), start()).unwrap();
            prop_assert_eq!(parsed.len(), expected.len());
            for (circuit, (launch, session, path)) in parsed.iter().zip(&expected) {
                prop_assert_eq!(circuit.launch_time, *launch);
                prop_assert_eq!(circuit.session_id.as_deref(), Some(session.as_str()));
                prop_assert_eq!(circuit.path.as_deref(), Some(path.as_str()));
            }
        }
    }
}
