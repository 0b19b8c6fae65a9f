use std::time::{Duration, SystemTime, UNIX_EPOCH};

use url::Url;

/// Milliseconds since the Unix epoch, saturating on clock skew.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| duration_to_ms(elapsed) as i64)
        .unwrap_or(0)
}

pub fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Scheme + host + port of `raw`. Unparseable urls and opaque origins
/// (`data:`, `file:`) aggregate under the raw url string instead.
pub fn origin_of(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(parsed) => {
            let origin = parsed.origin();
            if origin.is_tuple() {
                origin.ascii_serialization()
            } else {
                trimmed.to_string()
            }
        }
        Err(_) => trimmed.to_string(),
    }
}
