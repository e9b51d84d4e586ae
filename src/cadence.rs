//! Cadence tags: the `"{n}ms"` / `"{n}s"` strings naming a `Pulse`'s
//! publish interval in the datastore keyspace.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a cadence tag into its `Duration`. Millisecond tags must fall
/// in `100..=999` — anything below 100ms is expressed in whole seconds
/// instead. Second tags must be a positive integer.
pub fn parse(tag: &str) -> Result<Duration> {
    if let Some(digits) = tag.strip_suffix("ms") {
        let n: u64 = digits
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid cadence tag '{tag}'")))?;
        if !(100..=999).contains(&n) {
            return Err(Error::InvalidArgument(format!(
                "millisecond cadence tag '{tag}' must be in 100..=999"
            )));
        }
        Ok(Duration::from_millis(n))
    } else if let Some(digits) = tag.strip_suffix('s') {
        let n: u64 = digits
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid cadence tag '{tag}'")))?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("second cadence tag '{tag}' must be positive")));
        }
        Ok(Duration::from_secs(n))
    } else {
        Err(Error::InvalidArgument(format!("invalid cadence tag '{tag}'")))
    }
}

/// Render a `Duration` back to its canonical tag, preferring the
/// millisecond form only when seconds can't represent it.
pub fn format(interval: Duration) -> String {
    let millis = interval.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}
