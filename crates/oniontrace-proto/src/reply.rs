//! Classification of control-protocol reply lines.

/// Return the status code at the start of a reply line.
///
/// A code is up to three leading ASCII digits, followed by `' '`, `'-'`, or
/// `'+'` (or nothing at all). Returns `None` for lines that do not start
/// with a digit; callers ignore those.
pub fn status_code(line: &str) -> Option<u16> {
    let digits: String = line.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Extract a bootstrap percentage from a status line.
///
/// Scans for a token beginning `BOOTSTRAP` followed (later in the line) by a
/// `PROGRESS=<n>` token, as produced both by `GETINFO
/// status/bootstrap-phase` replies and by asynchronous `STATUS_CLIENT`
/// notifications. Returns `None` when the line carries no bootstrap report.
pub fn bootstrap_progress(line: &str) -> Option<u32> {
    let mut saw_bootstrap = false;
    for token in line.split(' ') {
        let mut kv = token.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        if starts_with_ignore_ascii_case(key, "BOOTSTRAP") {
            saw_bootstrap = true;
        } else if saw_bootstrap && starts_with_ignore_ascii_case(key, "PROGRESS") {
            return Some(decimal_prefix(kv.next().unwrap_or("")));
        }
    }
    None
}

/// True if `s` begins with `prefix`, ignoring ASCII case.
pub(crate) fn starts_with_ignore_ascii_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// If `s` begins with `prefix` (ignoring ASCII case), return the remainder.
pub(crate) fn strip_prefix_ignore_ascii_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if starts_with_ignore_ascii_case(s, prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

/// Parse the decimal digits at the start of `s`, `atoi`-style.
///
/// Yields 0 when `s` does not start with a digit, which matches how the
/// daemon's ids are treated: 0 is never a valid assigned id.
pub(crate) fn decimal_prefix(s: &str) -> u32 {
    let mut n: u32 = 0;
    for b in s.bytes() {
        if b.is_ascii_digit() {
            n = n.saturating_mul(10).saturating_add(u32::from(b - b'0'));
        } else {
            break;
        }
    }
    n
}
