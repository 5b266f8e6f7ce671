//! Time helpers.

use chrono::{DateTime, Utc};

/// A timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Render a timestamp as fractional seconds since the epoch,
/// e.g. `1700000000.000000123`.
///
/// Used as the creation component of transaction ids.
pub fn epoch_seconds(ts: Timestamp) -> String {
    format!("{}.{:09}", ts.timestamp(), ts.timestamp_subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_epoch_seconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123).unwrap();
        assert_eq!(epoch_seconds(ts), "1700000000.000000123");
    }

    #[test]
    fn test_epoch_seconds_has_no_whitespace() {
        assert!(!epoch_seconds(now()).contains(' '));
    }
}
