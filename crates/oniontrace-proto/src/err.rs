//! Errors produced while decoding control-protocol data.

use thiserror::Error;

/// A problem with data received on the control connection.
///
/// These are never fatal for the connection: the offending input is
/// discarded and the conversation continues.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// A control line contained bytes that were not valid UTF-8.
    #[error("control line was not valid UTF-8")]
    NotUtf8(#[source] std::str::Utf8Error),
}
